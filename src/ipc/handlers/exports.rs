use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_bool, param_id, query_err, required_str, row_exists, string_array};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_exports_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reviewed_only = optional_bool(req, "reviewedOnly", false);
    let tags = match string_array(req, "tags") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM courses WHERE id = ?",
        &course_id,
        "course",
    ) {
        return e;
    }

    let id = param_id(req);
    let tags_json = serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn
        .execute(
            "INSERT INTO course_exports(id, course_id, reviewed_only, tags) VALUES (?, ?, ?, ?)",
            (&id, &course_id, reviewed_only as i64, &tags_json),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "exportId": id }))
}

fn handle_exports_prepare(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let export_id = match required_str(req, "exportId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match export::prepare_course_export(conn, &export_id) {
        Ok(prepared) => ok(&req.id, json!(prepared)),
        Err(e) => query_err(req, e),
    }
}

fn handle_exports_save_file(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let export_id = match required_str(req, "exportId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(Option<String>, Option<Vec<u8>>)> = match conn
        .query_row(
            "SELECT filename, file FROM course_exports WHERE id = ?",
            [&export_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((filename, file)) = row else {
        return err(&req.id, "not_found", "export record not found", None);
    };
    let (Some(filename), Some(file)) = (filename, file) else {
        return err(&req.id, "not_found", "export has no attached file", None);
    };

    if let Err(e) = std::fs::write(&path, &file) {
        return err(&req.id, "generation_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "filename": filename, "byteCount": file.len(), "path": path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exports.create" => Some(handle_exports_create(state, req)),
        "exports.prepare" => Some(handle_exports_prepare(state, req)),
        "exports.saveFile" => Some(handle_exports_save_file(state, req)),
        _ => None,
    }
}
