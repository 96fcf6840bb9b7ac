use crate::grades::{self, GradeKey, GradeUpdate, StoredGrade};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, STAFF};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct KeyParams {
    student_id: String,
    course_id: String,
    academic_year_id: String,
}

impl KeyParams {
    fn from_req(req: &Request) -> Result<Self, HandlerErr> {
        Ok(Self {
            student_id: helpers::required_str(req, "studentId")?,
            course_id: helpers::required_str(req, "courseId")?,
            academic_year_id: helpers::required_str(req, "academicYearId")?,
        })
    }

    fn key(&self) -> GradeKey<'_> {
        GradeKey {
            student_id: &self.student_id,
            course_id: &self.course_id,
            academic_year_id: &self.academic_year_id,
        }
    }
}

fn parse_update(req: &Request) -> Result<GradeUpdate, HandlerErr> {
    let entry = req.params.get("entry").cloned().unwrap_or(serde_json::Value::Null);
    let scores = req
        .params
        .get("scores")
        .cloned()
        .unwrap_or_else(|| json!({}));
    let update: GradeUpdate = serde_json::from_value(json!({ "entry": entry, "scores": scores }))
        .map_err(|e| {
            HandlerErr::bad_params(format!(
                "invalid grade entry (use T1, T2, T3 or FINAL_EXAM): {e}"
            ))
            .with_details(json!({ "entry": entry }))
        })?;
    update.validate().map_err(|fe| {
        let details = fe.details();
        HandlerErr::bad_params(fe.message).with_details(details)
    })?;
    Ok(update)
}

/// Student name/code and course name/grade level for display.
pub fn populate(conn: &Connection, grade: &StoredGrade) -> Result<serde_json::Value, HandlerErr> {
    let student: Option<serde_json::Value> = conn
        .query_row(
            "SELECT id, name, code FROM students WHERE id = ?",
            [&grade.student_id],
            |r| {
                let id: String = r.get(0)?;
                let name: String = r.get(1)?;
                let code: String = r.get(2)?;
                Ok(json!({ "id": id, "name": name, "code": code }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let course: Option<serde_json::Value> = conn
        .query_row(
            "SELECT id, name, grade_level FROM courses WHERE id = ?",
            [&grade.course_id],
            |r| {
                let id: String = r.get(0)?;
                let name: String = r.get(1)?;
                let grade_level: String = r.get(2)?;
                Ok(json!({ "id": id, "name": name, "gradeLevel": grade_level }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut v = json!(grade);
    v["student"] = json!(student);
    v["course"] = json!(course);
    Ok(v)
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let key = KeyParams::from_req(req)?;
    let update = parse_update(req)?;

    helpers::ensure_course_access(conn, &user, &key.course_id)?;
    if !helpers::exists(conn, "students", &key.student_id)? {
        return Err(HandlerErr::not_found("student")
            .with_details(json!({ "studentId": key.student_id })));
    }
    if !helpers::exists(conn, "academic_years", &key.academic_year_id)? {
        return Err(HandlerErr::not_found("academic year")
            .with_details(json!({ "academicYearId": key.academic_year_id })));
    }

    let grade = grades::upsert(conn, key.key(), &update).map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tracing::info!(
        grade_id = %grade.id,
        entry = update.entry(),
        promotion_score = grade.record.promotion_score,
        "grade recorded"
    );
    Ok(json!({
        "entry": update.entry(),
        "grade": grade,
    }))
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let key = KeyParams::from_req(req)?;
    helpers::ensure_course_access(conn, &user, &key.course_id)?;

    let grade = grades::find_by_key(conn, key.key())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("grade"))?;
    Ok(json!({ "grade": populate(conn, &grade)? }))
}

fn handle_grades_list_by_course(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let course_id = helpers::required_str(req, "courseId")?;
    let year_id = helpers::optional_str(req, "academicYearId");
    helpers::ensure_course_access(conn, &user, &course_id)?;

    let list = grades::list_for_course(conn, &course_id, year_id.as_deref())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut out = Vec::with_capacity(list.len());
    for g in &list {
        out.push(populate(conn, g)?);
    }
    Ok(json!({ "total": out.len(), "grades": out }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let grade_id = helpers::required_str(req, "gradeId")?;

    let grade = grades::find_by_id(conn, &grade_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("grade").with_details(json!({ "gradeId": grade_id })))?;
    helpers::ensure_course_access(conn, &user, &grade.course_id)?;

    grades::delete(conn, &grade_id).map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tracing::info!(grade_id = %grade_id, "grade deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "grades.upsert" => handle_grades_upsert(state, req),
        "grades.get" => handle_grades_get(state, req),
        "grades.listByCourse" => handle_grades_list_by_course(state, req),
        "grades.delete" => handle_grades_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
