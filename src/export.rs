use crate::ods::{format_number, Cell, Spreadsheet, Table};
use crate::query::{student_tags_by_id, QueryError};
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

pub const PASSING_STYLE: &str = "passing-grade";
pub const PENDING_STYLE: &str = "pending-grade";
pub const FAILING_STYLE: &str = "failing-grade";

const PASSING_COLOR: &str = "#9AE6B4";
const PENDING_COLOR: &str = "#FAF089";
const FAILING_COLOR: &str = "#FEB2B2";

const REVIEW_PENDING: &str = "RP";
const CHECK_MARK: &str = "\u{2713}";

/// Half-away-from-zero rounding to two decimal places for exported averages.
pub fn round_half_up_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMethod {
    Graded,
    TakeQuiz,
    VisitLink,
    MarkAsComplete,
}

impl CompletionMethod {
    /// Mutually exclusive and total: every target lands in exactly one bucket.
    pub fn derive(has_criteria: bool, has_quiz: bool, has_link: bool) -> Self {
        if has_criteria {
            Self::Graded
        } else if has_quiz {
            Self::TakeQuiz
        } else if has_link {
            Self::VisitLink
        } else {
            Self::MarkAsComplete
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Graded => "Graded",
            Self::TakeQuiz => "Take Quiz",
            Self::VisitLink => "Visit Link",
            Self::MarkAsComplete => "Mark as Complete",
        }
    }
}

fn format_grades(grades: &[f64]) -> String {
    grades
        .iter()
        .map(|g| format_number(*g))
        .collect::<Vec<_>>()
        .join(",")
}

/// Grade classification for one (student, target) cell in the submissions
/// matrix. Total over passed x graded.
pub fn classify_cell(passed: bool, grades: &[f64], quiz_score: Option<f64>) -> Cell {
    match (passed, grades.is_empty()) {
        (true, true) => match quiz_score {
            Some(score) => Cell::number(score),
            None => Cell::text(CHECK_MARK),
        },
        (true, false) => Cell::text(format_grades(grades)).styled(PASSING_STYLE),
        (false, true) => Cell::text(REVIEW_PENDING).styled(PENDING_STYLE),
        (false, false) => Cell::text(format_grades(grades)).styled(FAILING_STYLE),
    }
}

/// Filesystem-safe slug: lowercase, non-alphanumeric runs collapsed to one
/// hyphen, no leading or trailing hyphen.
pub fn parameterize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

fn export_filename(course_name: &str) -> String {
    let stamp = Utc::now().to_rfc3339();
    format!("{}.ods", parameterize(&format!("{}-{}", course_name, stamp)))
}

#[derive(Debug, Clone)]
struct ExportTarget {
    id: String,
    title: String,
    level_number: i64,
    milestone: bool,
    has_quiz: bool,
    has_link: bool,
    criterion_ids: Vec<String>,
}

impl ExportTarget {
    fn identifier(&self) -> String {
        format!("L{}T{}", self.level_number, self.id)
    }
}

#[derive(Debug, Clone)]
struct ExportStudent {
    id: String,
    email: String,
    name: String,
    title: String,
    affiliation: Option<String>,
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
struct SubmissionRecord {
    target_id: String,
    passed: bool,
    evaluated: bool,
    quiz_score: Option<f64>,
    student_ids: Vec<String>,
    grades: Vec<(String, f64)>,
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

fn text_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}

/// Live targets of the course in canonical curriculum order: level number,
/// then target-group sort index, then target sort index. The same order is
/// reused for Table 3's columns.
fn load_targets(
    conn: &Connection,
    course_id: &str,
    reviewed_only: bool,
) -> Result<Vec<ExportTarget>, QueryError> {
    let mut sql = String::from(
        "SELECT t.id, t.title, l.number, tg.milestone, t.link_to_complete,
                EXISTS (SELECT 1 FROM quizzes q WHERE q.target_id = t.id)
         FROM targets t
         JOIN target_groups tg ON tg.id = t.target_group_id
         JOIN levels l ON l.id = tg.level_id
         WHERE l.course_id = ? AND t.live = 1",
    );
    if reviewed_only {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM target_evaluation_criteria tec
                          WHERE tec.target_id = t.id)",
        );
    }
    sql.push_str(" ORDER BY l.number ASC, tg.sort_index ASC, t.sort_index ASC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let mut targets: Vec<ExportTarget> = stmt
        .query_map([course_id], |r| {
            Ok(ExportTarget {
                id: r.get(0)?,
                title: r.get(1)?,
                level_number: r.get(2)?,
                milestone: r.get::<_, i64>(3)? != 0,
                has_link: r.get::<_, Option<String>>(4)?.is_some(),
                has_quiz: r.get::<_, i64>(5)? != 0,
                criterion_ids: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;

    let mut criteria_stmt = conn
        .prepare(
            "SELECT criterion_id FROM target_evaluation_criteria
             WHERE target_id = ? ORDER BY rowid",
        )
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    for target in &mut targets {
        target.criterion_ids = criteria_stmt
            .query_map([&target.id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    }

    Ok(targets)
}

/// Active students of the course ordered by email. The tag filter is a plain
/// OR over student-level tags, deliberately simpler than the resolver's
/// two-namespace matcher.
fn load_students(
    conn: &Connection,
    course_id: &str,
    tag_filter: &[String],
) -> Result<Vec<ExportStudent>, QueryError> {
    let mut sql = String::from(
        "SELECT s.id, s.email, s.name, s.title, s.affiliation
         FROM students s
         JOIN teams tm ON tm.id = s.team_id
         WHERE tm.course_id = ? AND s.active = 1",
    );
    let mut binds: Vec<Value> = vec![Value::Text(course_id.to_string())];
    if !tag_filter.is_empty() {
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM student_tags stg
                          JOIN tags t ON t.id = stg.tag_id
                          WHERE stg.student_id = s.id AND t.name IN ({}))",
            placeholders(tag_filter.len())
        ));
        binds.extend(text_params(tag_filter));
    }
    sql.push_str(" ORDER BY s.email ASC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let mut students: Vec<ExportStudent> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ExportStudent {
                id: r.get(0)?,
                email: r.get(1)?,
                name: r.get(2)?,
                title: r.get(3)?,
                affiliation: r.get(4)?,
                tags: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;

    let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let mut tags = student_tags_by_id(conn, &ids)?;
    for student in &mut students {
        student.tags = tags.remove(&student.id).unwrap_or_default();
    }

    Ok(students)
}

/// Captures every latest submission of the course (live and archived targets
/// alike) with its founders and grades, so classification never re-queries a
/// set it already observed.
fn load_submissions(
    conn: &Connection,
    course_id: &str,
) -> Result<Vec<SubmissionRecord>, QueryError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.target_id, s.passed_at, s.evaluated_at, s.quiz_score
             FROM submissions s
             JOIN targets t ON t.id = s.target_id
             JOIN target_groups tg ON tg.id = t.target_group_id
             JOIN levels l ON l.id = tg.level_id
             WHERE l.course_id = ? AND s.latest = 1
             ORDER BY s.created_at",
        )
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let rows: Vec<(String, SubmissionRecord)> = stmt
        .query_map([course_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                SubmissionRecord {
                    target_id: r.get(1)?,
                    passed: r.get::<_, Option<String>>(2)?.is_some(),
                    evaluated: r.get::<_, Option<String>>(3)?.is_some(),
                    quiz_score: r.get(4)?,
                    student_ids: Vec::new(),
                    grades: Vec::new(),
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;

    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut submissions: Vec<SubmissionRecord> = Vec::with_capacity(rows.len());
    let ids: Vec<String> = rows.iter().map(|(id, _)| id.clone()).collect();
    for (id, record) in rows {
        by_id.insert(id, submissions.len());
        submissions.push(record);
    }

    if !ids.is_empty() {
        let sql = format!(
            "SELECT submission_id, student_id FROM submission_students
             WHERE submission_id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
        let owners: Vec<(String, String)> = stmt
            .query_map(params_from_iter(text_params(&ids)), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
        for (submission_id, student_id) in owners {
            if let Some(&i) = by_id.get(&submission_id) {
                submissions[i].student_ids.push(student_id);
            }
        }

        // Grade order within a submission follows criterion attachment order.
        let sql = format!(
            "SELECT g.submission_id, g.criterion_id, g.grade FROM grades g
             WHERE g.submission_id IN ({})
             ORDER BY g.rowid",
            placeholders(ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
        let grades: Vec<(String, String, f64)> = stmt
            .query_map(params_from_iter(text_params(&ids)), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
        for (submission_id, criterion_id, grade) in grades {
            if let Some(&i) = by_id.get(&submission_id) {
                submissions[i].grades.push((criterion_id, grade));
            }
        }
    }

    Ok(submissions)
}

fn criterion_names(
    conn: &Connection,
    criterion_ids: &[String],
) -> Result<HashMap<String, String>, QueryError> {
    if criterion_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT id, name FROM evaluation_criteria WHERE id IN ({})",
        placeholders(criterion_ids.len())
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let rows: Vec<(String, String)> = stmt
        .query_map(params_from_iter(text_params(criterion_ids)), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedExport {
    pub export_id: String,
    pub filename: String,
    pub byte_count: usize,
    pub checksum: String,
}

struct ExportRecord {
    course_id: String,
    reviewed_only: bool,
    tags: Vec<String>,
}

fn load_export_record(conn: &Connection, export_id: &str) -> Result<ExportRecord, QueryError> {
    let row: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT course_id, reviewed_only, tags FROM course_exports WHERE id = ?",
            [export_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let Some((course_id, reviewed_only, tags_json)) = row else {
        return Err(QueryError::new("not_found", "export record not found"));
    };
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| QueryError::new("generation_failed", format!("bad export tags: {}", e)))?;
    Ok(ExportRecord {
        course_id,
        reviewed_only: reviewed_only != 0,
        tags,
    })
}

/// Builds the three-table course report and attaches the finished document to
/// the export record. Synchronous, one logical unit of work: all data is
/// captured into memory before any table is built.
pub fn prepare_course_export(
    conn: &Connection,
    export_id: &str,
) -> Result<PreparedExport, QueryError> {
    let record = load_export_record(conn, export_id)?;

    let course_name: Option<String> = conn
        .query_row(
            "SELECT name FROM courses WHERE id = ?",
            [&record.course_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| QueryError::new("db_query_failed", e.to_string()))?;
    let Some(course_name) = course_name else {
        return Err(QueryError::new("not_found", "course not found"));
    };

    let targets = load_targets(conn, &record.course_id, record.reviewed_only)?;
    let students = load_students(conn, &record.course_id, &record.tags)?;
    let submissions = load_submissions(conn, &record.course_id)?;

    // Criterion column set: union over included targets, first appearance in
    // canonical order.
    let mut criterion_order: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for target in &targets {
        for criterion_id in &target.criterion_ids {
            if seen.insert(criterion_id.clone()) {
                criterion_order.push(criterion_id.clone());
            }
        }
    }
    let names = criterion_names(conn, &criterion_order)?;
    let criterion_headers: Vec<String> = criterion_order
        .iter()
        .map(|id| {
            format!(
                "{} (Average Grade)",
                names.get(id).map(String::as_str).unwrap_or("")
            )
        })
        .collect();

    // Aggregate the captured submissions once.
    let mut students_by_target: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut pending_by_target: HashMap<&str, i64> = HashMap::new();
    let mut target_grade_sums: HashMap<(&str, &str), (f64, usize)> = HashMap::new();
    let mut student_grade_sums: HashMap<(&str, &str), (f64, usize)> = HashMap::new();
    let mut latest_by_pair: HashMap<(&str, &str), &SubmissionRecord> = HashMap::new();

    for submission in &submissions {
        let target_id = submission.target_id.as_str();
        let owners = students_by_target.entry(target_id).or_default();
        for student_id in &submission.student_ids {
            owners.insert(student_id.as_str());
        }
        if !submission.evaluated {
            *pending_by_target.entry(target_id).or_insert(0) += 1;
        }
        for (criterion_id, grade) in &submission.grades {
            let entry = target_grade_sums
                .entry((target_id, criterion_id.as_str()))
                .or_insert((0.0, 0));
            entry.0 += grade;
            entry.1 += 1;
            for student_id in &submission.student_ids {
                let entry = student_grade_sums
                    .entry((student_id.as_str(), criterion_id.as_str()))
                    .or_insert((0.0, 0));
                entry.0 += grade;
                entry.1 += 1;
            }
        }
        for student_id in &submission.student_ids {
            latest_by_pair.insert((student_id.as_str(), target_id), submission);
        }
    }

    let average_cell = |sums: &HashMap<(&str, &str), (f64, usize)>, key: (&str, &str)| -> Cell {
        match sums.get(&key) {
            Some((sum, count)) if *count > 0 => {
                Cell::number(round_half_up_2(sum / *count as f64))
            }
            _ => Cell::empty(),
        }
    };

    let mut targets_table = Table::new("Targets");
    let mut header: Vec<Cell> = [
        "ID",
        "Level",
        "Name",
        "Completion Method",
        "Milestone?",
        "Students with submissions",
        "Submissions pending review",
    ]
    .iter()
    .map(|h| Cell::text(*h))
    .collect();
    header.extend(criterion_headers.iter().map(Cell::text));
    targets_table.add_row(header);

    for target in &targets {
        let method = CompletionMethod::derive(
            !target.criterion_ids.is_empty(),
            target.has_quiz,
            target.has_link,
        );
        let mut row = vec![
            Cell::text(target.identifier()),
            Cell::number(target.level_number as f64),
            Cell::text(&target.title),
            Cell::text(method.label()),
            Cell::text(if target.milestone { "Yes" } else { "No" }),
            Cell::number(
                students_by_target
                    .get(target.id.as_str())
                    .map(|s| s.len())
                    .unwrap_or(0) as f64,
            ),
            Cell::number(
                pending_by_target
                    .get(target.id.as_str())
                    .copied()
                    .unwrap_or(0) as f64,
            ),
        ];
        for criterion_id in &criterion_order {
            row.push(average_cell(
                &target_grade_sums,
                (target.id.as_str(), criterion_id.as_str()),
            ));
        }
        targets_table.add_row(row);
    }

    let mut students_table = Table::new("Students");
    let mut header: Vec<Cell> = ["Email Address", "Name", "Title", "Affiliation", "Tags"]
        .iter()
        .map(|h| Cell::text(*h))
        .collect();
    header.extend(criterion_headers.iter().map(Cell::text));
    students_table.add_row(header);

    for student in &students {
        let mut row = vec![
            Cell::text(&student.email),
            Cell::text(&student.name),
            Cell::text(&student.title),
            match &student.affiliation {
                Some(a) => Cell::text(a),
                None => Cell::empty(),
            },
            Cell::text(student.tags.join(", ")),
        ];
        for criterion_id in &criterion_order {
            row.push(average_cell(
                &student_grade_sums,
                (student.id.as_str(), criterion_id.as_str()),
            ));
        }
        students_table.add_row(row);
    }

    let mut submissions_table = Table::new("Submissions");
    let mut header = vec![Cell::text("Student Email / Target ID")];
    header.extend(targets.iter().map(|t| Cell::text(t.identifier())));
    submissions_table.add_row(header);

    for student in &students {
        let mut row = vec![Cell::text(&student.email)];
        for target in &targets {
            // Submissions against targets outside the exported subset never
            // reach here; pairs without a submission stay empty and unstyled.
            match latest_by_pair.get(&(student.id.as_str(), target.id.as_str())) {
                Some(submission) => {
                    let grades: Vec<f64> =
                        submission.grades.iter().map(|(_, g)| *g).collect();
                    row.push(classify_cell(
                        submission.passed,
                        &grades,
                        submission.quiz_score,
                    ));
                }
                None => row.push(Cell::empty()),
            }
        }
        submissions_table.add_row(row);
    }

    let mut spreadsheet = Spreadsheet::default();
    spreadsheet.add_style(PASSING_STYLE, PASSING_COLOR);
    spreadsheet.add_style(FAILING_STYLE, FAILING_COLOR);
    spreadsheet.add_style(PENDING_STYLE, PENDING_COLOR);
    spreadsheet.add_table(targets_table);
    spreadsheet.add_table(students_table);
    spreadsheet.add_table(submissions_table);

    let bytes = spreadsheet
        .bytes()
        .map_err(|e| QueryError::new("generation_failed", e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let checksum = format!("{:x}", hasher.finalize());
    let filename = export_filename(&course_name);
    let prepared_at = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE course_exports SET filename = ?, file = ?, checksum = ?, prepared_at = ?
         WHERE id = ?",
        (&filename, &bytes, &checksum, &prepared_at, export_id),
    )
    .map_err(|e| QueryError::new("generation_failed", e.to_string()))?;

    Ok(PreparedExport {
        export_id: export_id.to_string(),
        filename,
        byte_count: bytes.len(),
        checksum,
    })
}
