//! Report data models. Rendering (PDF or otherwise) happens in the client;
//! everything here reads stored derived values and never recomputes them.

use crate::calc::Trimester;
use crate::grades::{self, GradeKey};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, STAFF};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CourseHeader {
    id: String,
    name: String,
    grade_level: String,
    teacher_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrimesterRow {
    index: usize,
    student_id: String,
    student_name: String,
    student_code: String,
    individual_activities: f64,
    group_activities: f64,
    integrator_project: f64,
    period_evaluation: f64,
    trimester_average: f64,
    excused_absences: i64,
    unexcused_absences: i64,
    qualitative_remark: String,
}

fn course_header(conn: &Connection, course_id: &str) -> Result<CourseHeader, HandlerErr> {
    conn.query_row(
        "SELECT c.id, c.name, c.grade_level, u.name
         FROM courses c
         LEFT JOIN users u ON u.id = c.teacher_id
         WHERE c.id = ?",
        [course_id],
        |r| {
            Ok(CourseHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_level: r.get(2)?,
                teacher_name: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("course").with_details(json!({ "courseId": course_id })))
}

fn student_label(conn: &Connection, student_id: &str) -> Result<(String, String), HandlerErr> {
    let found: Option<(String, String)> = conn
        .query_row(
            "SELECT name, code FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(found.unwrap_or_default())
}

fn parse_trimester(req: &Request, key: &str) -> Result<Trimester, HandlerErr> {
    let raw = helpers::required_str(req, key)?;
    Trimester::parse(&raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("{key} must be one of: T1, T2, T3"))
            .with_details(json!({ "field": key, "value": raw }))
    })
}

fn handle_trimester_model(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let course_id = helpers::required_str(req, "courseId")?;
    let trimester = parse_trimester(req, "trimester")?;

    let course = course_header(conn, &course_id)?;
    helpers::ensure_course_access(conn, &user, &course_id)?;

    let all = grades::list_for_course(conn, &course_id, None)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if all.is_empty() {
        return Err(HandlerErr::not_found("grades for this course")
            .with_details(json!({ "courseId": course_id })));
    }

    let mut labelled = Vec::with_capacity(all.len());
    for g in all {
        let (name, code) = student_label(conn, &g.student_id)?;
        labelled.push((name, code, g));
    }
    labelled.sort_by(|a, b| {
        a.0.to_lowercase()
            .cmp(&b.0.to_lowercase())
            .then_with(|| a.1.cmp(&b.1))
    });

    let rows: Vec<TrimesterRow> = labelled
        .into_iter()
        .enumerate()
        .map(|(i, (name, code, g))| {
            let t = g.record.trimester(trimester);
            TrimesterRow {
                index: i + 1,
                student_id: g.student_id.clone(),
                student_name: name,
                student_code: code,
                individual_activities: t.individual_activities,
                group_activities: t.group_activities,
                integrator_project: t.integrator_project,
                period_evaluation: t.period_evaluation,
                trimester_average: t.trimester_average,
                excused_absences: t.excused_absences,
                unexcused_absences: t.unexcused_absences,
                qualitative_remark: t.qualitative_remark.clone(),
            }
        })
        .collect();

    Ok(json!({
        "course": course,
        "trimester": trimester.as_str(),
        "generatedAt": chrono::Utc::now().date_naive().to_string(),
        "rows": rows,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StudentReportKind {
    Trimester(Trimester),
    Final,
}

fn parse_student_kind(req: &Request) -> Result<StudentReportKind, HandlerErr> {
    let raw = helpers::required_str(req, "kind")?;
    if raw.eq_ignore_ascii_case("final") {
        return Ok(StudentReportKind::Final);
    }
    Trimester::parse(&raw)
        .map(StudentReportKind::Trimester)
        .ok_or_else(|| {
            HandlerErr::bad_params("kind must be one of: T1, T2, T3, FINAL")
                .with_details(json!({ "kind": raw }))
        })
}

fn handle_student_model(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let student_id = helpers::required_str(req, "studentId")?;
    let course_id = helpers::required_str(req, "courseId")?;
    let year_id = helpers::required_str(req, "academicYearId")?;
    let kind = parse_student_kind(req)?;

    let course = course_header(conn, &course_id)?;
    helpers::ensure_course_access(conn, &user, &course_id)?;

    let grade = grades::find_by_key(
        conn,
        GradeKey {
            student_id: &student_id,
            course_id: &course_id,
            academic_year_id: &year_id,
        },
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("grade"))?;
    let (name, code) = student_label(conn, &student_id)?;

    let body = match kind {
        StudentReportKind::Trimester(t) => json!({
            "kind": t.as_str(),
            "trimester": grade.record.trimester(t),
        }),
        StudentReportKind::Final => json!({
            "kind": "FINAL",
            "trimesterAverages": {
                "T1": grade.record.t1.trimester_average,
                "T2": grade.record.t2.trimester_average,
                "T3": grade.record.t3.trimester_average,
            },
            "annualTrimesterAverage": grade.record.annual_trimester_average,
            "finalExamScore": grade.record.final_exam_score,
            "promotionScore": grade.record.promotion_score,
        }),
    };

    Ok(json!({
        "course": course,
        "student": { "id": student_id, "name": name, "code": code },
        "academicYearId": year_id,
        "generatedAt": chrono::Utc::now().date_naive().to_string(),
        "report": body,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.trimesterModel" => handle_trimester_model(state, req),
        "reports.studentModel" => handle_student_model(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
