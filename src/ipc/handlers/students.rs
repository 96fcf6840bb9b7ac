use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, ADMIN};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub code: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

const STUDENT_COLUMNS: &str = "id, name, code, active, created_at, updated_at";

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let active: i64 = row.get(3)?;
    Ok(Student {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        active: active != 0,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn find_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<Student>> {
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?");
    conn.query_row(&sql, [student_id], student_from_row).optional()
}

fn map_write_err<'a>(
    code: &'static str,
    student_code: &'a str,
) -> impl Fn(rusqlite::Error) -> HandlerErr + 'a {
    move |e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new("conflict", "student code already in use")
                .with_details(json!({ "code": student_code }))
        } else {
            HandlerErr::db(code, e).with_details(json!({ "table": "students" }))
        }
    }
}

fn handle_students_list(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY name COLLATE NOCASE, code");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;
    let student_id = helpers::required_str(req, "studentId")?;
    let student = find_student(conn, &student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("student").with_details(json!({ "studentId": student_id })))?;
    Ok(json!({ "student": student }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StudentCreate {
    name: String,
    code: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

fn handle_students_create(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let p: StudentCreate = helpers::parse_params(req, None)?;

    let name = p.name.trim().to_string();
    let code = p.code.trim().to_string();
    if name.is_empty() || code.is_empty() {
        return Err(HandlerErr::bad_params("name and code must not be empty"));
    }

    let now = db::now_rfc3339();
    let student = Student {
        id: Uuid::new_v4().to_string(),
        name,
        code,
        active: p.active,
        created_at: now.clone(),
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO students(id, name, code, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.name,
            &student.code,
            student.active as i64,
            &student.created_at,
            &student.updated_at,
        ),
    )
    .map_err(map_write_err("db_insert_failed", &student.code))?;

    Ok(json!({ "student": student }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StudentPatch {
    name: Option<String>,
    code: Option<String>,
    active: Option<bool>,
}

fn handle_students_update(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let student_id = helpers::required_str(req, "studentId")?;
    let patch: StudentPatch = helpers::parse_params(req, Some("patch"))?;

    let mut student = find_student(conn, &student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("student").with_details(json!({ "studentId": student_id })))?;
    if let Some(v) = patch.name {
        student.name = v.trim().to_string();
    }
    if let Some(v) = patch.code {
        student.code = v.trim().to_string();
    }
    if let Some(v) = patch.active {
        student.active = v;
    }
    if student.name.is_empty() || student.code.is_empty() {
        return Err(HandlerErr::bad_params("name and code must not be empty"));
    }
    student.updated_at = db::now_rfc3339();

    conn.execute(
        "UPDATE students SET name = ?, code = ?, active = ?, updated_at = ? WHERE id = ?",
        (
            &student.name,
            &student.code,
            student.active as i64,
            &student.updated_at,
            &student.id,
        ),
    )
    .map_err(map_write_err("db_update_failed", &student.code))?;

    Ok(json!({ "student": student }))
}

fn handle_students_delete(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let student_id = helpers::required_str(req, "studentId")?;

    if !helpers::exists(conn, "students", &student_id)? {
        return Err(HandlerErr::not_found("student").with_details(json!({ "studentId": student_id })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Dependency order; there is no ON DELETE CASCADE.
    let steps: [(&str, &str); 4] = [
        (
            "grade_trimesters",
            "DELETE FROM grade_trimesters
             WHERE grade_id IN (SELECT id FROM grades WHERE student_id = ?)",
        ),
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("course_students", "DELETE FROM course_students WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.get" => handle_students_get(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
