use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_str, param_id, required_str, row_exists, string_array,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn handle_coaches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let id = param_id(req);
    if let Err(e) = conn
        .execute("INSERT INTO coaches(id, name) VALUES (?, ?)", (&id, &name))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "coachId": id }))
}

fn handle_coaches_enroll_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coach_id = match required_str(req, "coachId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM coaches WHERE id = ?", &coach_id, "coach")
    {
        return e;
    }
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM courses WHERE id = ?",
        &course_id,
        "course",
    ) {
        return e;
    }
    if let Err(e) = conn
        .execute(
            "INSERT OR IGNORE INTO coach_course_enrollments(coach_id, course_id) VALUES (?, ?)",
            (&coach_id, &course_id),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "enrolled": true }))
}

fn handle_coaches_enroll_team(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coach_id = match required_str(req, "coachId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let team_id = match required_str(req, "teamId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM coaches WHERE id = ?", &coach_id, "coach")
    {
        return e;
    }
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM teams WHERE id = ?", &team_id, "team") {
        return e;
    }
    if let Err(e) = conn
        .execute(
            "INSERT OR IGNORE INTO coach_team_enrollments(coach_id, team_id) VALUES (?, ?)",
            (&coach_id, &team_id),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "enrolled": true }))
}

fn handle_teams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = optional_bool(req, "active", true);
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
    if let Err(e) = conn
        .execute(
            "INSERT INTO teams(id, course_id, name, active) VALUES (?, ?, ?, ?)",
            (&id, &course_id, &name, active as i64),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "teamId": id }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let team_id = match required_str(req, "teamId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = optional_str(req, "title").unwrap_or_default();
    let affiliation = optional_str(req, "affiliation");
    let active = optional_bool(req, "active", true);
    if let Err(e) = row_exists(conn, req, "SELECT 1 FROM teams WHERE id = ?", &team_id, "team") {
        return e;
    }

    let id = param_id(req);
    if let Err(e) = conn
        .execute(
            "INSERT INTO students(id, team_id, name, email, title, affiliation, active)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &team_id,
                &name,
                &email,
                &title,
                &affiliation,
                active as i64,
            ),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "studentId": id }))
}

fn tag_id_by_name(conn: &Connection, name: &str) -> rusqlite::Result<String> {
    conn.execute("INSERT OR IGNORE INTO tags(id, name) VALUES (?, ?)", (
        Uuid::new_v4().to_string(),
        name,
    ))?;
    conn.query_row("SELECT id FROM tags WHERE name = ?", [name], |r| r.get(0))
}

fn apply_tags(
    state: &mut AppState,
    req: &Request,
    owner_key: &str,
    owner_table: &str,
    owner_what: &str,
    link_sql: &str,
) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let owner_id = match required_str(req, owner_key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let tags = match string_array(req, "tags") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists_sql = format!("SELECT 1 FROM {} WHERE id = ?", owner_table);
    if let Err(e) = row_exists(conn, req, &exists_sql, &owner_id, owner_what) {
        return e;
    }

    for tag in &tags {
        let tag_id = match tag_id_by_name(conn, tag) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Err(e) = conn
            .execute(link_sql, (&owner_id, &tag_id))
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
        {
            return e;
        }
    }
    ok(&req.id, json!({ "applied": tags.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "coaches.create" => Some(handle_coaches_create(state, req)),
        "coaches.enrollCourse" => Some(handle_coaches_enroll_course(state, req)),
        "coaches.enrollTeam" => Some(handle_coaches_enroll_team(state, req)),
        "teams.create" => Some(handle_teams_create(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "tags.applyStudent" => Some(apply_tags(
            state,
            req,
            "studentId",
            "students",
            "student",
            "INSERT OR IGNORE INTO student_tags(student_id, tag_id) VALUES (?, ?)",
        )),
        "tags.applyTeam" => Some(apply_tags(
            state,
            req,
            "teamId",
            "teams",
            "team",
            "INSERT OR IGNORE INTO team_tags(team_id, tag_id) VALUES (?, ?)",
        )),
        _ => None,
    }
}
