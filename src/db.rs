use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("cohort.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS levels(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_levels_course ON levels(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS target_groups(
            id TEXT PRIMARY KEY,
            level_id TEXT NOT NULL,
            milestone INTEGER NOT NULL DEFAULT 0,
            sort_index INTEGER NOT NULL,
            FOREIGN KEY(level_id) REFERENCES levels(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_target_groups_level ON target_groups(level_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS targets(
            id TEXT PRIMARY KEY,
            target_group_id TEXT NOT NULL,
            title TEXT NOT NULL,
            sort_index INTEGER NOT NULL,
            live INTEGER NOT NULL DEFAULT 1,
            link_to_complete TEXT,
            FOREIGN KEY(target_group_id) REFERENCES target_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_targets_group ON targets(target_group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            target_id TEXT NOT NULL UNIQUE,
            FOREIGN KEY(target_id) REFERENCES targets(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluation_criteria(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluation_criteria_course ON evaluation_criteria(course_id)",
        [],
    )?;

    // Attachment order (rowid) is the grade/column order for a target.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS target_evaluation_criteria(
            target_id TEXT NOT NULL,
            criterion_id TEXT NOT NULL,
            PRIMARY KEY(target_id, criterion_id),
            FOREIGN KEY(target_id) REFERENCES targets(id),
            FOREIGN KEY(criterion_id) REFERENCES evaluation_criteria(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_target_criteria_criterion ON target_evaluation_criteria(criterion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS coaches(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS coach_course_enrollments(
            coach_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            PRIMARY KEY(coach_id, course_id),
            FOREIGN KEY(coach_id) REFERENCES coaches(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS coach_team_enrollments(
            coach_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            PRIMARY KEY(coach_id, team_id),
            FOREIGN KEY(coach_id) REFERENCES coaches(id),
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teams(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teams_course ON teams(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            team_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            affiliation TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(team_id) REFERENCES teams(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_team ON students(team_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tags(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_tags(
            student_id TEXT NOT NULL,
            tag_id TEXT NOT NULL,
            PRIMARY KEY(student_id, tag_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(tag_id) REFERENCES tags(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS team_tags(
            team_id TEXT NOT NULL,
            tag_id TEXT NOT NULL,
            PRIMARY KEY(team_id, tag_id),
            FOREIGN KEY(team_id) REFERENCES teams(id),
            FOREIGN KEY(tag_id) REFERENCES tags(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            target_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            evaluated_at TEXT,
            passed_at TEXT,
            quiz_score REAL,
            latest INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(target_id) REFERENCES targets(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_target ON submissions(target_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_target_latest ON submissions(target_id, latest)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submission_students(
            submission_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(submission_id, student_id),
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submission_students_student ON submission_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            criterion_id TEXT NOT NULL,
            grade REAL NOT NULL,
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            FOREIGN KEY(criterion_id) REFERENCES evaluation_criteria(id),
            UNIQUE(submission_id, criterion_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_submission ON grades(submission_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_criterion ON grades(criterion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_exports(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            reviewed_only INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            filename TEXT,
            file BLOB,
            checksum TEXT,
            prepared_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_exports_course ON course_exports(course_id)",
        [],
    )?;

    Ok(conn)
}
