use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct QueryError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl QueryError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Reviewed,
}

impl SubmissionStatus {
    /// Unrecognized values are a contract violation, never a silent default.
    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Reviewed" => Ok(Self::Reviewed),
            other => Err(QueryError::new(
                "invalid_argument",
                format!("'{}' is not a valid status", other),
            )),
        }
    }

    fn where_clause(self) -> &'static str {
        match self {
            Self::Pending => " AND s.evaluated_at IS NULL",
            Self::Reviewed => " AND s.evaluated_at IS NOT NULL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortCriterion {
    SubmittedAt,
    EvaluatedAt,
}

impl SortCriterion {
    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "SubmittedAt" => Ok(Self::SubmittedAt),
            "EvaluatedAt" => Ok(Self::EvaluatedAt),
            other => Err(QueryError::new(
                "invalid_argument",
                format!("'{}' is not a valid sort criterion", other),
            )),
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::SubmittedAt => "s.created_at",
            Self::EvaluatedAt => "s.evaluated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "Ascending" => Ok(Self::Ascending),
            "Descending" => Ok(Self::Descending),
            other => Err(QueryError::new(
                "invalid_argument",
                format!("'{}' is not a valid sort direction", other),
            )),
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverFilters {
    pub status: SubmissionStatus,
    pub level_id: Option<String>,
    pub coach_id: Option<String>,
    pub search: Option<String>,
    pub tags: Vec<String>,
    pub sort_criterion: SortCriterion,
    pub sort_direction: SortDirection,
}

pub fn parse_resolver_filters(params: &serde_json::Value) -> Result<ResolverFilters, QueryError> {
    let status_raw = params
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::new("bad_params", "missing status"))?;
    let sort_criterion_raw = params
        .get("sortCriterion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::new("bad_params", "missing sortCriterion"))?;
    let sort_direction_raw = params
        .get("sortDirection")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::new("bad_params", "missing sortDirection"))?;

    let tags = match params.get("tags") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return Err(QueryError::new("bad_params", "tags must be an array"));
            };
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let Some(s) = item.as_str() else {
                    return Err(QueryError::new("bad_params", "tags must be strings"));
                };
                out.push(s.to_string());
            }
            out
        }
    };

    let opt_str = |key: &str| -> Option<String> {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    Ok(ResolverFilters {
        status: SubmissionStatus::parse(status_raw)?,
        level_id: opt_str("levelId"),
        coach_id: opt_str("coachId"),
        search: opt_str("search"),
        tags,
        sort_criterion: SortCriterion::parse(sort_criterion_raw)?,
        sort_direction: SortDirection::parse(sort_direction_raw)?,
    })
}

/// The resolver's precondition: the requesting actor must be a coach enrolled
/// in the course. Refuses the whole operation before any scope query runs.
pub fn authorize_coach(
    conn: &Connection,
    coach_id: &str,
    course_id: &str,
) -> Result<(), QueryError> {
    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM coach_course_enrollments WHERE coach_id = ? AND course_id = ?",
            (coach_id, course_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(QueryError::db)?;
    if enrolled.is_none() {
        return Err(QueryError::new(
            "not_authorized",
            "coach is not enrolled in this course",
        ));
    }
    Ok(())
}

fn text_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

fn course_tag_names(
    conn: &Connection,
    course_id: &str,
    namespace_sql: &str,
) -> Result<HashSet<String>, QueryError> {
    let mut stmt = conn.prepare(namespace_sql).map_err(QueryError::db)?;
    let names = stmt
        .query_map([course_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;
    Ok(names.into_iter().collect())
}

fn team_ids_with_tag_names(
    conn: &Connection,
    course_id: &str,
    sql_prefix: &str,
    names: &[String],
) -> Result<HashSet<String>, QueryError> {
    if names.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!("{} AND t.name IN ({})", sql_prefix, placeholders(names.len()));
    let mut binds = vec![Value::Text(course_id.to_string())];
    binds.extend(text_params(names));
    let mut stmt = conn.prepare(&sql).map_err(QueryError::db)?;
    let ids = stmt
        .query_map(params_from_iter(binds), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;
    Ok(ids.into_iter().collect())
}

/// Best-effort tag matcher across the two disjoint tagging namespaces.
///
/// Requested tags are split into the subset that exists as student-level tags
/// in the course and the subset that exists as team-level tags. Both subsets
/// non-empty: intersect the teams matched on each side. One subset non-empty:
/// that side's teams alone. Neither: every active team of the course.
pub fn tag_filtered_team_ids(
    conn: &Connection,
    course_id: &str,
    tags: &[String],
) -> Result<Vec<String>, QueryError> {
    let mut stmt = conn
        .prepare("SELECT id FROM teams WHERE course_id = ? AND active = 1 ORDER BY rowid")
        .map_err(QueryError::db)?;
    let all_active: Vec<String> = stmt
        .query_map([course_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;

    if tags.is_empty() {
        return Ok(all_active);
    }

    let student_level = course_tag_names(
        conn,
        course_id,
        "SELECT DISTINCT t.name FROM tags t
         JOIN student_tags stg ON stg.tag_id = t.id
         JOIN students s ON s.id = stg.student_id
         JOIN teams tm ON tm.id = s.team_id
         WHERE tm.course_id = ?",
    )?;
    let team_level = course_tag_names(
        conn,
        course_id,
        "SELECT DISTINCT t.name FROM tags t
         JOIN team_tags tt ON tt.tag_id = t.id
         JOIN teams tm ON tm.id = tt.team_id
         WHERE tm.course_id = ?",
    )?;

    let student_subset: Vec<String> = tags
        .iter()
        .filter(|t| student_level.contains(*t))
        .cloned()
        .collect();
    let team_subset: Vec<String> = tags
        .iter()
        .filter(|t| team_level.contains(*t))
        .cloned()
        .collect();

    // No requested tag matches either namespace: fall back to every active team.
    if student_subset.is_empty() && team_subset.is_empty() {
        return Ok(all_active);
    }

    let via_students = team_ids_with_tag_names(
        conn,
        course_id,
        "SELECT DISTINCT s.team_id FROM students s
         JOIN student_tags stg ON stg.student_id = s.id
         JOIN tags t ON t.id = stg.tag_id
         JOIN teams tm ON tm.id = s.team_id
         WHERE tm.course_id = ? AND tm.active = 1",
        &student_subset,
    )?;
    let via_teams = team_ids_with_tag_names(
        conn,
        course_id,
        "SELECT DISTINCT tt.team_id FROM team_tags tt
         JOIN tags t ON t.id = tt.tag_id
         JOIN teams tm ON tm.id = tt.team_id
         WHERE tm.course_id = ? AND tm.active = 1",
        &team_subset,
    )?;

    let keep: HashSet<String> = if !student_subset.is_empty() && !team_subset.is_empty() {
        via_students.intersection(&via_teams).cloned().collect()
    } else {
        via_students.union(&via_teams).cloned().collect()
    };

    Ok(all_active.into_iter().filter(|id| keep.contains(id)).collect())
}

/// Case-insensitive substring search over member name, member email, and team
/// name. ANDed after the tag matcher; the three fields are OR-ed together.
fn search_team_ids(
    conn: &Connection,
    team_ids: Vec<String>,
    search: &str,
) -> Result<Vec<String>, QueryError> {
    if team_ids.is_empty() {
        return Ok(team_ids);
    }
    let needle = search.to_lowercase();

    let sql = format!(
        "SELECT id, name FROM teams WHERE id IN ({})",
        placeholders(team_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(QueryError::db)?;
    let team_names: Vec<(String, String)> = stmt
        .query_map(params_from_iter(text_params(&team_ids)), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;

    let sql = format!(
        "SELECT team_id, name, email FROM students WHERE team_id IN ({})",
        placeholders(team_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(QueryError::db)?;
    let members: Vec<(String, String, String)> = stmt
        .query_map(params_from_iter(text_params(&team_ids)), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;

    let mut keep: HashSet<String> = team_names
        .iter()
        .filter(|(_, name)| name.to_lowercase().contains(&needle))
        .map(|(id, _)| id.clone())
        .collect();
    for (team_id, name, email) in &members {
        if name.to_lowercase().contains(&needle) || email.to_lowercase().contains(&needle) {
            keep.insert(team_id.clone());
        }
    }

    Ok(team_ids.into_iter().filter(|id| keep.contains(id)).collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSubmission {
    pub id: String,
    pub target_id: String,
    pub created_at: String,
    pub evaluated_at: Option<String>,
    pub passed_at: Option<String>,
    pub latest: bool,
}

/// Resolves the exact ordered set of submissions for a course under the
/// combined filter axes. Strictly read-side; each step narrows scope.
pub fn resolve_submissions(
    conn: &Connection,
    course_id: &str,
    filters: &ResolverFilters,
) -> Result<Vec<ResolvedSubmission>, QueryError> {
    let course: Option<String> = conn
        .query_row("SELECT name FROM courses WHERE id = ?", [course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(QueryError::db)?;
    if course.is_none() {
        return Err(QueryError::new("not_found", "course not found"));
    }

    if let Some(level_id) = &filters.level_id {
        let level: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM levels WHERE id = ? AND course_id = ?",
                (level_id, course_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(QueryError::db)?;
        if level.is_none() {
            return Err(QueryError::new("not_found", "level not found in course"));
        }
    }

    let mut team_ids = tag_filtered_team_ids(conn, course_id, &filters.tags)?;
    if let Some(search) = &filters.search {
        team_ids = search_team_ids(conn, team_ids, search)?;
    }
    if team_ids.is_empty() {
        return Ok(Vec::new());
    }

    // Joining through submission_students can surface one row per founder;
    // the contract requires the result distinct by submission identity.
    let mut sql = String::from(
        "SELECT DISTINCT s.id, s.target_id, s.created_at, s.evaluated_at, s.passed_at, s.latest
         FROM submissions s
         JOIN targets t ON t.id = s.target_id
         JOIN target_groups tg ON tg.id = t.target_group_id
         JOIN levels l ON l.id = tg.level_id
         JOIN submission_students ss ON ss.submission_id = s.id
         JOIN students st ON st.id = ss.student_id
         WHERE l.course_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(course_id.to_string())];

    if let Some(level_id) = &filters.level_id {
        sql.push_str(" AND l.id = ?");
        binds.push(Value::Text(level_id.clone()));
    }

    sql.push_str(filters.status.where_clause());

    if let Some(coach_id) = &filters.coach_id {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM coach_team_enrollments cte
                          WHERE cte.team_id = st.team_id AND cte.coach_id = ?)",
        );
        binds.push(Value::Text(coach_id.clone()));
    }

    sql.push_str(&format!(" AND st.team_id IN ({})", placeholders(team_ids.len())));
    binds.extend(text_params(&team_ids));

    sql.push_str(&format!(
        " ORDER BY {} {}",
        filters.sort_criterion.column(),
        filters.sort_direction.sql()
    ));

    let mut stmt = conn.prepare(&sql).map_err(QueryError::db)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ResolvedSubmission {
                id: r.get(0)?,
                target_id: r.get(1)?,
                created_at: r.get(2)?,
                evaluated_at: r.get(3)?,
                passed_at: r.get(4)?,
                latest: r.get::<_, i64>(5)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;

    Ok(rows)
}

/// Bulk fetch of student-level tag names keyed by student id. One query per
/// batch, default-filled so every requested key is present in the mapping.
pub fn student_tags_by_id(
    conn: &Connection,
    student_ids: &[String],
) -> Result<HashMap<String, Vec<String>>, QueryError> {
    let mut out: HashMap<String, Vec<String>> = student_ids
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();
    if student_ids.is_empty() {
        return Ok(out);
    }

    let sql = format!(
        "SELECT stg.student_id, t.name FROM student_tags stg
         JOIN tags t ON t.id = stg.tag_id
         WHERE stg.student_id IN ({})
         ORDER BY t.name",
        placeholders(student_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(QueryError::db)?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params_from_iter(text_params(student_ids)), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(QueryError::db)?;

    for (student_id, tag_name) in rows {
        if let Some(entry) = out.get_mut(&student_id) {
            entry.push(tag_name);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parse_rejects_unknown_values() {
        assert_eq!(
            SubmissionStatus::parse("Pending").unwrap(),
            SubmissionStatus::Pending
        );
        assert_eq!(
            SubmissionStatus::parse("Reviewed").unwrap(),
            SubmissionStatus::Reviewed
        );
        let err = SubmissionStatus::parse("Submitted").unwrap_err();
        assert_eq!(err.code, "invalid_argument");
    }

    #[test]
    fn sort_parse_rejects_unknown_values() {
        assert_eq!(
            SortCriterion::parse("SubmittedAt").unwrap(),
            SortCriterion::SubmittedAt
        );
        let err = SortCriterion::parse("Randomly").unwrap_err();
        assert_eq!(err.code, "invalid_argument");

        assert_eq!(
            SortDirection::parse("Descending").unwrap(),
            SortDirection::Descending
        );
        let err = SortDirection::parse("Sideways").unwrap_err();
        assert_eq!(err.code, "invalid_argument");
    }

    #[test]
    fn parse_filters_requires_enums_and_normalizes_optionals() {
        let err = parse_resolver_filters(&json!({})).unwrap_err();
        assert_eq!(err.code, "bad_params");

        let filters = parse_resolver_filters(&json!({
            "status": "Pending",
            "sortCriterion": "EvaluatedAt",
            "sortDirection": "Ascending",
            "search": "   ",
            "tags": ["alpha", "beta"]
        }))
        .unwrap();
        assert_eq!(filters.status, SubmissionStatus::Pending);
        assert_eq!(filters.sort_criterion, SortCriterion::EvaluatedAt);
        assert_eq!(filters.search, None);
        assert_eq!(filters.tags, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(filters.level_id, None);
        assert_eq!(filters.coach_id, None);
    }

    #[test]
    fn parse_filters_rejects_non_string_tags() {
        let err = parse_resolver_filters(&json!({
            "status": "Pending",
            "sortCriterion": "SubmittedAt",
            "sortDirection": "Ascending",
            "tags": [1, 2]
        }))
        .unwrap_err();
        assert_eq!(err.code, "bad_params");
    }
}
