use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::query::QueryError;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn optional_bool(req: &Request, key: &str, default: bool) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn string_array(req: &Request, key: &str) -> Result<Vec<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(v) => v
            .as_array()
            .and_then(|arr| {
                arr.iter()
                    .map(|item| item.as_str().map(|s| s.to_string()))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must be an array of strings", key),
                    None,
                )
            }),
    }
}

/// Creation methods accept an explicit id so callers can produce stable keys;
/// otherwise a fresh v4 uuid is assigned.
pub fn param_id(req: &Request) -> String {
    optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn row_exists(
    conn: &Connection,
    req: &Request,
    sql: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row(sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            None,
        ));
    }
    Ok(())
}

pub fn query_err(req: &Request, e: QueryError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}
