use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, query_err, required_str};
use crate::ipc::types::{AppState, Request};
use crate::query;
use rusqlite::OptionalExtension;
use serde_json::json;

/// Presentation model for a course's active students. Per-student tag names
/// come from the bulk fetch helper, one query per batch.
fn handle_course_students_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let course_name: Option<String> = match conn
        .query_row("SELECT name FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_name) = course_name else {
        return err(&req.id, "not_found", "course not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name, s.email, s.title, s.affiliation, s.team_id
         FROM students s
         JOIN teams tm ON tm.id = s.team_id
         WHERE tm.course_id = ? AND s.active = 1
         ORDER BY s.email",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    type StudentRow = (String, String, String, String, Option<String>, String);
    let rows: Vec<StudentRow> = match stmt
        .query_map([&course_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_ids: Vec<String> = rows.iter().map(|r| r.0.clone()).collect();
    let mut tags = match query::student_tags_by_id(conn, &student_ids) {
        Ok(v) => v,
        Err(e) => return query_err(req, e),
    };

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, name, email, title, affiliation, team_id)| {
            let user_tags = tags.remove(&id).unwrap_or_default();
            json!({
                "id": id,
                "name": name,
                "email": email,
                "title": title,
                "affiliation": affiliation,
                "teamId": team_id,
                "userTags": user_tags
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "course": { "id": course_id, "name": course_name },
            "students": students
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.courseStudentsModel" => Some(handle_course_students_model(state, req)),
        _ => None,
    }
}
