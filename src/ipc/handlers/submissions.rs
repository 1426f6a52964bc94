use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, param_id, query_err, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use crate::query;
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value};
use serde_json::json;
use uuid::Uuid;

fn handle_submissions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let target_id = match required_str(req, "targetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match req
        .params
        .get("studentIds")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Option<Vec<_>>>()
        }) {
        Some(v) if !v.is_empty() => v,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "studentIds must be a non-empty array of strings",
                None,
            )
        }
    };
    let created_at = optional_str(req, "createdAt").unwrap_or_else(|| Utc::now().to_rfc3339());
    let evaluated_at = optional_str(req, "evaluatedAt");
    let passed_at = optional_str(req, "passedAt");
    let quiz_score = req.params.get("quizScore").and_then(|v| v.as_f64());

    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM targets WHERE id = ?",
        &target_id,
        "target",
    ) {
        return e;
    }
    for student_id in &student_ids {
        if let Err(e) = row_exists(
            conn,
            req,
            "SELECT 1 FROM students WHERE id = ?",
            student_id,
            "student",
        ) {
            return e;
        }
    }

    // At most one latest submission per (student, target): earlier latest
    // rows for any of these founders get flipped before the insert.
    let placeholders = std::iter::repeat("?")
        .take(student_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let flip_sql = format!(
        "UPDATE submissions SET latest = 0
         WHERE target_id = ? AND latest = 1
           AND id IN (SELECT submission_id FROM submission_students WHERE student_id IN ({}))",
        placeholders
    );
    let mut binds: Vec<Value> = vec![Value::Text(target_id.clone())];
    binds.extend(student_ids.iter().map(|s| Value::Text(s.clone())));
    if let Err(e) = conn
        .execute(&flip_sql, params_from_iter(binds))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }

    let id = param_id(req);
    if let Err(e) = conn
        .execute(
            "INSERT INTO submissions(id, target_id, created_at, evaluated_at, passed_at, quiz_score, latest)
             VALUES (?, ?, ?, ?, ?, ?, 1)",
            (
                &id,
                &target_id,
                &created_at,
                &evaluated_at,
                &passed_at,
                quiz_score,
            ),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    for student_id in &student_ids {
        if let Err(e) = conn
            .execute(
                "INSERT INTO submission_students(submission_id, student_id) VALUES (?, ?)",
                (&id, student_id),
            )
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
        {
            return e;
        }
    }

    if let Some(grades) = req.params.get("grades").and_then(|v| v.as_array()) {
        for entry in grades {
            let criterion_id = entry.get("criterionId").and_then(|v| v.as_str());
            let grade = entry.get("grade").and_then(|v| v.as_f64());
            let (Some(criterion_id), Some(grade)) = (criterion_id, grade) else {
                return err(
                    &req.id,
                    "bad_params",
                    "grades entries must have criterionId and grade",
                    None,
                );
            };
            if let Err(e) = conn
                .execute(
                    "INSERT INTO grades(id, submission_id, criterion_id, grade) VALUES (?, ?, ?, ?)",
                    (Uuid::new_v4().to_string(), &id, criterion_id, grade),
                )
                .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
            {
                return e;
            }
        }
    }

    ok(&req.id, json!({ "submissionId": id }))
}

fn handle_submissions_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_coach_id = match required_str(req, "actorCoachId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let filters = match query::parse_resolver_filters(&req.params) {
        Ok(v) => v,
        Err(e) => return query_err(req, e),
    };

    // Authorization precondition: refused outright before any scope query.
    if let Err(e) = query::authorize_coach(conn, &actor_coach_id, &course_id) {
        return query_err(req, e);
    }

    match query::resolve_submissions(conn, &course_id, &filters) {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => query_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.create" => Some(handle_submissions_create(state, req)),
        "submissions.resolve" => Some(handle_submissions_resolve(state, req)),
        _ => None,
    }
}
