use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, ADMIN};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub name: String,
    pub grade_level: String,
    pub teacher_id: String,
    pub academic_year_id: Option<String>,
    pub student_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

const COURSE_COLUMNS: &str =
    "id, name, grade_level, teacher_id, academic_year_id, created_at, updated_at";

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: row.get(0)?,
        name: row.get(1)?,
        grade_level: row.get(2)?,
        teacher_id: row.get(3)?,
        academic_year_id: row.get(4)?,
        student_ids: Vec::new(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn find_course(conn: &Connection, course_id: &str) -> rusqlite::Result<Option<Course>> {
    let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?");
    let Some(mut course) = conn.query_row(&sql, [course_id], course_from_row).optional()? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT cs.student_id
         FROM course_students cs
         JOIN students s ON s.id = cs.student_id
         WHERE cs.course_id = ?
         ORDER BY s.name COLLATE NOCASE, s.code",
    )?;
    course.student_ids = stmt
        .query_map([course_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(course))
}

/// Checks every reference a course row carries before it is written.
fn check_references(conn: &Connection, course: &Course) -> Result<(), HandlerErr> {
    if course.name.is_empty() || course.grade_level.is_empty() {
        return Err(HandlerErr::bad_params("name and gradeLevel must not be empty"));
    }
    if !helpers::exists(conn, "users", &course.teacher_id)? {
        return Err(HandlerErr::not_found("teacher")
            .with_details(json!({ "teacherId": course.teacher_id })));
    }
    if let Some(year_id) = &course.academic_year_id {
        if !helpers::exists(conn, "academic_years", year_id)? {
            return Err(HandlerErr::not_found("academic year")
                .with_details(json!({ "academicYearId": year_id })));
        }
    }
    for sid in &course.student_ids {
        if !helpers::exists(conn, "students", sid)? {
            return Err(HandlerErr::not_found("student").with_details(json!({ "studentId": sid })));
        }
    }
    Ok(())
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}

fn save(conn: &Connection, course: &Course, insert: bool) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Dropping `tx` on an early return rolls everything back.
    if insert {
        tx.execute(
            "INSERT INTO courses(id, name, grade_level, teacher_id, academic_year_id, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &course.id,
                &course.name,
                &course.grade_level,
                &course.teacher_id,
                &course.academic_year_id,
                &course.created_at,
                &course.updated_at,
            ),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "courses" })))?;
    } else {
        tx.execute(
            "UPDATE courses
             SET name = ?, grade_level = ?, teacher_id = ?, academic_year_id = ?, updated_at = ?
             WHERE id = ?",
            (
                &course.name,
                &course.grade_level,
                &course.teacher_id,
                &course.academic_year_id,
                &course.updated_at,
                &course.id,
            ),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "courses" })))?;
    }

    tx.execute("DELETE FROM course_students WHERE course_id = ?", [&course.id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "course_students" }))
        })?;
    for sid in &course.student_ids {
        tx.execute(
            "INSERT INTO course_students(course_id, student_id) VALUES(?, ?)",
            (&course.id, sid),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "course_students" }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;

    // Correlated subquery avoids double-counting from the join.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.grade_level,
               c.teacher_id,
               u.name,
               c.academic_year_id,
               (SELECT COUNT(*) FROM course_students cs WHERE cs.course_id = c.id) AS student_count
             FROM courses c
             LEFT JOIN users u ON u.id = c.teacher_id
             ORDER BY c.name COLLATE NOCASE, c.id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let courses = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_level: String = row.get(2)?;
            let teacher_id: String = row.get(3)?;
            let teacher_name: Option<String> = row.get(4)?;
            let year_id: Option<String> = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLevel": grade_level,
                "teacher": { "id": teacher_id, "name": teacher_name },
                "academicYearId": year_id,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "courses": courses }))
}

fn handle_courses_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;
    let course_id = helpers::required_str(req, "courseId")?;

    let course = find_course(conn, &course_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("course").with_details(json!({ "courseId": course_id })))?;

    let teacher: Option<serde_json::Value> = conn
        .query_row(
            "SELECT id, name, email FROM users WHERE id = ?",
            [&course.teacher_id],
            |r| {
                let id: String = r.get(0)?;
                let name: String = r.get(1)?;
                let email: String = r.get(2)?;
                Ok(json!({ "id": id, "name": name, "email": email }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let year: Option<serde_json::Value> = match &course.academic_year_id {
        Some(year_id) => conn
            .query_row(
                "SELECT id, name FROM academic_years WHERE id = ?",
                [year_id],
                |r| {
                    let id: String = r.get(0)?;
                    let name: String = r.get(1)?;
                    Ok(json!({ "id": id, "name": name }))
                },
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.code
             FROM course_students cs
             JOIN students s ON s.id = cs.student_id
             WHERE cs.course_id = ?
             ORDER BY s.name COLLATE NOCASE, s.code",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([&course.id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let code: String = r.get(2)?;
            Ok(json!({ "id": id, "name": name, "code": code }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "course": {
            "id": course.id,
            "name": course.name,
            "gradeLevel": course.grade_level,
            "teacher": teacher,
            "academicYear": year,
            "students": students,
            "createdAt": course.created_at,
            "updatedAt": course.updated_at,
        }
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CourseCreate {
    name: String,
    grade_level: String,
    teacher_id: String,
    #[serde(default)]
    academic_year_id: Option<String>,
    #[serde(default)]
    student_ids: Vec<String>,
}

fn handle_courses_create(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let p: CourseCreate = helpers::parse_params(req, None)?;

    let now = db::now_rfc3339();
    let course = Course {
        id: Uuid::new_v4().to_string(),
        name: p.name.trim().to_string(),
        grade_level: p.grade_level.trim().to_string(),
        teacher_id: p.teacher_id.trim().to_string(),
        academic_year_id: p.academic_year_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
        student_ids: dedup(p.student_ids),
        created_at: now.clone(),
        updated_at: now,
    };
    check_references(conn, &course)?;
    save(conn, &course, true)?;
    tracing::info!(course_id = %course.id, name = %course.name, "course created");
    Ok(json!({ "course": course }))
}

/// `academicYearId: null` detaches the year; an absent key leaves it alone.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CoursePatch {
    name: Option<String>,
    grade_level: Option<String>,
    teacher_id: Option<String>,
    #[serde(default, with = "double_option")]
    academic_year_id: Option<Option<String>>,
    student_ids: Option<Vec<String>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

fn handle_courses_update(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let course_id = helpers::required_str(req, "courseId")?;
    let patch: CoursePatch = helpers::parse_params(req, Some("patch"))?;

    let mut course = find_course(conn, &course_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("course").with_details(json!({ "courseId": course_id })))?;
    if let Some(v) = patch.name {
        course.name = v.trim().to_string();
    }
    if let Some(v) = patch.grade_level {
        course.grade_level = v.trim().to_string();
    }
    if let Some(v) = patch.teacher_id {
        course.teacher_id = v.trim().to_string();
    }
    if let Some(v) = patch.academic_year_id {
        course.academic_year_id = v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    }
    if let Some(v) = patch.student_ids {
        course.student_ids = dedup(v);
    }
    course.updated_at = db::now_rfc3339();

    check_references(conn, &course)?;
    save(conn, &course, false)?;
    Ok(json!({ "course": course }))
}

fn handle_courses_delete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let course_id = helpers::required_str(req, "courseId")?;

    if !helpers::exists(conn, "courses", &course_id)? {
        return Err(HandlerErr::not_found("course").with_details(json!({ "courseId": course_id })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Dependency order; there is no ON DELETE CASCADE.
    let steps: [(&str, &str); 4] = [
        (
            "grade_trimesters",
            "DELETE FROM grade_trimesters
             WHERE grade_id IN (SELECT id FROM grades WHERE course_id = ?)",
        ),
        ("grades", "DELETE FROM grades WHERE course_id = ?"),
        ("course_students", "DELETE FROM course_students WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&course_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    tracing::info!(course_id = %course_id, "course deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.list" => handle_courses_list(state, req),
        "courses.get" => handle_courses_get(state, req),
        "courses.create" => handle_courses_create(state, req),
        "courses.update" => handle_courses_update(state, req),
        "courses.delete" => handle_courses_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
