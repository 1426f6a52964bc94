use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_str, param_id, required_i64, required_str, row_exists,
    string_array,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let id = param_id(req);
    if let Err(e) = conn
        .execute("INSERT INTO courses(id, name) VALUES (?, ?)", (&id, &name))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "courseId": id }))
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let number = match required_i64(req, "number") {
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
    if let Err(e) = conn
        .execute(
            "INSERT INTO levels(id, course_id, number) VALUES (?, ?, ?)",
            (&id, &course_id, number),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "levelId": id }))
}

fn handle_target_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sort_index = match required_i64(req, "sortIndex") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let milestone = optional_bool(req, "milestone", false);
    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM levels WHERE id = ?",
        &level_id,
        "level",
    ) {
        return e;
    }

    let id = param_id(req);
    if let Err(e) = conn
        .execute(
            "INSERT INTO target_groups(id, level_id, milestone, sort_index) VALUES (?, ?, ?, ?)",
            (&id, &level_id, milestone as i64, sort_index),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "targetGroupId": id }))
}

fn handle_targets_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let target_group_id = match required_str(req, "targetGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sort_index = match required_i64(req, "sortIndex") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let live = optional_bool(req, "live", true);
    let has_quiz = optional_bool(req, "hasQuiz", false);
    let link_to_complete = optional_str(req, "linkToComplete");
    let criterion_ids = match string_array(req, "criterionIds") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Completion method is derived from which sub-resource is attached and
    // must stay mutually exclusive.
    let method_count = [
        !criterion_ids.is_empty(),
        has_quiz,
        link_to_complete.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if method_count > 1 {
        return err(
            &req.id,
            "bad_params",
            "a target may declare at most one of criterionIds, hasQuiz, linkToComplete",
            None,
        );
    }

    if let Err(e) = row_exists(
        conn,
        req,
        "SELECT 1 FROM target_groups WHERE id = ?",
        &target_group_id,
        "target group",
    ) {
        return e;
    }
    for criterion_id in &criterion_ids {
        if let Err(e) = row_exists(
            conn,
            req,
            "SELECT 1 FROM evaluation_criteria WHERE id = ?",
            criterion_id,
            "evaluation criterion",
        ) {
            return e;
        }
    }

    let id = param_id(req);
    if let Err(e) = conn
        .execute(
            "INSERT INTO targets(id, target_group_id, title, sort_index, live, link_to_complete)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                &id,
                &target_group_id,
                &title,
                sort_index,
                live as i64,
                &link_to_complete,
            ),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    if has_quiz {
        let quiz_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = conn
            .execute(
                "INSERT INTO quizzes(id, target_id) VALUES (?, ?)",
                (&quiz_id, &id),
            )
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
        {
            return e;
        }
    }
    for criterion_id in &criterion_ids {
        if let Err(e) = conn
            .execute(
                "INSERT INTO target_evaluation_criteria(target_id, criterion_id) VALUES (?, ?)",
                (&id, criterion_id),
            )
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
        {
            return e;
        }
    }
    ok(&req.id, json!({ "targetId": id }))
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
            "INSERT INTO evaluation_criteria(id, course_id, name) VALUES (?, ?, ?)",
            (&id, &course_id, &name),
        )
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
    {
        return e;
    }
    ok(&req.id, json!({ "criterionId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "levels.create" => Some(handle_levels_create(state, req)),
        "targetGroups.create" => Some(handle_target_groups_create(state, req)),
        "targets.create" => Some(handle_targets_create(state, req)),
        "criteria.create" => Some(handle_criteria_create(state, req)),
        _ => None,
    }
}
