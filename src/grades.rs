//! Grade persistence boundary.
//!
//! Every write goes through [`upsert`]: load the stored record (or a zeroed
//! one), merge a validated [`GradeUpdate`], run [`calc::recompute`], and store
//! the result in one transaction. Readers only ever see derived values that
//! were computed on write.

use crate::calc::{self, GradeRecord, Trimester, TrimesterScores};
use crate::db;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

/// Partial assignment for one trimester. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrimesterDelta {
    pub individual_activities: Option<f64>,
    pub group_activities: Option<f64>,
    pub integrator_project: Option<f64>,
    pub period_evaluation: Option<f64>,
    pub excused_absences: Option<i64>,
    pub unexcused_absences: Option<i64>,
    pub qualitative_remark: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FinalExamDelta {
    pub final_exam_score: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "entry", content = "scores")]
pub enum GradeUpdate {
    T1(TrimesterDelta),
    T2(TrimesterDelta),
    T3(TrimesterDelta),
    #[serde(rename = "FINAL_EXAM")]
    FinalExam(FinalExamDelta),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub value: serde_json::Value,
}

impl FieldError {
    pub fn details(&self) -> serde_json::Value {
        json!({ "field": self.field, "value": self.value })
    }
}

fn check_score(field: &str, value: Option<f64>) -> Result<(), FieldError> {
    match value {
        Some(v) if !v.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&v) => Err(FieldError {
            field: field.to_string(),
            message: format!("{field} must be between {MIN_SCORE} and {MAX_SCORE}"),
            value: json!(v),
        }),
        _ => Ok(()),
    }
}

fn check_count(field: &str, value: Option<i64>) -> Result<(), FieldError> {
    match value {
        Some(v) if v < 0 => Err(FieldError {
            field: field.to_string(),
            message: format!("{field} must not be negative"),
            value: json!(v),
        }),
        _ => Ok(()),
    }
}

impl TrimesterDelta {
    fn validate(&self) -> Result<(), FieldError> {
        check_score("individualActivities", self.individual_activities)?;
        check_score("groupActivities", self.group_activities)?;
        check_score("integratorProject", self.integrator_project)?;
        check_score("periodEvaluation", self.period_evaluation)?;
        check_count("excusedAbsences", self.excused_absences)?;
        check_count("unexcusedAbsences", self.unexcused_absences)?;
        Ok(())
    }

    fn merge_into(&self, target: &mut TrimesterScores) {
        if let Some(v) = self.individual_activities {
            target.individual_activities = v;
        }
        if let Some(v) = self.group_activities {
            target.group_activities = v;
        }
        if let Some(v) = self.integrator_project {
            target.integrator_project = v;
        }
        if let Some(v) = self.period_evaluation {
            target.period_evaluation = v;
        }
        if let Some(v) = self.excused_absences {
            target.excused_absences = v;
        }
        if let Some(v) = self.unexcused_absences {
            target.unexcused_absences = v;
        }
        if let Some(v) = &self.qualitative_remark {
            target.qualitative_remark = v.trim().to_string();
        }
    }
}

impl GradeUpdate {
    pub fn entry(&self) -> &'static str {
        match self {
            GradeUpdate::T1(_) => "T1",
            GradeUpdate::T2(_) => "T2",
            GradeUpdate::T3(_) => "T3",
            GradeUpdate::FinalExam(_) => "FINAL_EXAM",
        }
    }

    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            GradeUpdate::T1(d) | GradeUpdate::T2(d) | GradeUpdate::T3(d) => d.validate(),
            GradeUpdate::FinalExam(d) => check_score("finalExamScore", Some(d.final_exam_score)),
        }
    }

    /// Merges the assigned fields into `record`. Derived fields are left for
    /// [`calc::recompute`].
    pub fn merge_into(&self, record: &mut GradeRecord) {
        match self {
            GradeUpdate::T1(d) => d.merge_into(record.trimester_mut(Trimester::T1)),
            GradeUpdate::T2(d) => d.merge_into(record.trimester_mut(Trimester::T2)),
            GradeUpdate::T3(d) => d.merge_into(record.trimester_mut(Trimester::T3)),
            GradeUpdate::FinalExam(d) => record.final_exam_score = d.final_exam_score,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GradeKey<'a> {
    pub student_id: &'a str,
    pub course_id: &'a str,
    pub academic_year_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGrade {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub academic_year_id: String,
    #[serde(flatten)]
    pub record: GradeRecord,
    pub created_at: String,
    pub updated_at: String,
}

const GRADE_COLUMNS: &str = "id, student_id, course_id, academic_year_id, final_exam_score,
     annual_trimester_average, promotion_score, created_at, updated_at";

fn grade_from_row(row: &Row<'_>) -> rusqlite::Result<StoredGrade> {
    Ok(StoredGrade {
        id: row.get(0)?,
        student_id: row.get(1)?,
        course_id: row.get(2)?,
        academic_year_id: row.get(3)?,
        record: GradeRecord {
            final_exam_score: row.get(4)?,
            annual_trimester_average: row.get(5)?,
            promotion_score: row.get(6)?,
            ..Default::default()
        },
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn load_trimesters(conn: &Connection, grade: &mut StoredGrade) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT term, individual_activities, group_activities, integrator_project,
                period_evaluation, trimester_average, excused_absences,
                unexcused_absences, qualitative_remark
         FROM grade_trimesters
         WHERE grade_id = ?",
    )?;
    let rows = stmt
        .query_map([&grade.id], |r| {
            let term: i64 = r.get(0)?;
            Ok((
                term,
                TrimesterScores {
                    individual_activities: r.get(1)?,
                    group_activities: r.get(2)?,
                    integrator_project: r.get(3)?,
                    period_evaluation: r.get(4)?,
                    trimester_average: r.get(5)?,
                    excused_absences: r.get(6)?,
                    unexcused_absences: r.get(7)?,
                    qualitative_remark: r.get(8)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (term, scores) in rows {
        if let Some(t) = Trimester::ALL.into_iter().find(|t| t.term() == term) {
            *grade.record.trimester_mut(t) = scores;
        }
    }
    Ok(())
}

pub fn find_by_key(conn: &Connection, key: GradeKey<'_>) -> rusqlite::Result<Option<StoredGrade>> {
    let sql = format!(
        "SELECT {GRADE_COLUMNS} FROM grades
         WHERE student_id = ? AND course_id = ? AND academic_year_id = ?"
    );
    let found = conn
        .query_row(
            &sql,
            (key.student_id, key.course_id, key.academic_year_id),
            grade_from_row,
        )
        .optional()?;
    match found {
        Some(mut g) => {
            load_trimesters(conn, &mut g)?;
            Ok(Some(g))
        }
        None => Ok(None),
    }
}

pub fn find_by_id(conn: &Connection, grade_id: &str) -> rusqlite::Result<Option<StoredGrade>> {
    let sql = format!("SELECT {GRADE_COLUMNS} FROM grades WHERE id = ?");
    let found = conn.query_row(&sql, [grade_id], grade_from_row).optional()?;
    match found {
        Some(mut g) => {
            load_trimesters(conn, &mut g)?;
            Ok(Some(g))
        }
        None => Ok(None),
    }
}

pub fn list_for_course(
    conn: &Connection,
    course_id: &str,
    academic_year_id: Option<&str>,
) -> rusqlite::Result<Vec<StoredGrade>> {
    let sql = format!(
        "SELECT {GRADE_COLUMNS} FROM grades
         WHERE course_id = ?1 AND (?2 IS NULL OR academic_year_id = ?2)
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut grades = stmt
        .query_map((course_id, academic_year_id), grade_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for g in grades.iter_mut() {
        load_trimesters(conn, g)?;
    }
    Ok(grades)
}

fn store(conn: &Connection, grade: &StoredGrade) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO grades(id, student_id, course_id, academic_year_id, final_exam_score,
                            annual_trimester_average, promotion_score, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           final_exam_score = excluded.final_exam_score,
           annual_trimester_average = excluded.annual_trimester_average,
           promotion_score = excluded.promotion_score,
           updated_at = excluded.updated_at",
        (
            &grade.id,
            &grade.student_id,
            &grade.course_id,
            &grade.academic_year_id,
            grade.record.final_exam_score,
            grade.record.annual_trimester_average,
            grade.record.promotion_score,
            &grade.created_at,
            &grade.updated_at,
        ),
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO grade_trimesters(grade_id, term, individual_activities, group_activities,
                                      integrator_project, period_evaluation, trimester_average,
                                      excused_absences, unexcused_absences, qualitative_remark)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(grade_id, term) DO UPDATE SET
           individual_activities = excluded.individual_activities,
           group_activities = excluded.group_activities,
           integrator_project = excluded.integrator_project,
           period_evaluation = excluded.period_evaluation,
           trimester_average = excluded.trimester_average,
           excused_absences = excluded.excused_absences,
           unexcused_absences = excluded.unexcused_absences,
           qualitative_remark = excluded.qualitative_remark",
    )?;
    for t in Trimester::ALL {
        let s = grade.record.trimester(t);
        stmt.execute((
            &grade.id,
            t.term(),
            s.individual_activities,
            s.group_activities,
            s.integrator_project,
            s.period_evaluation,
            s.trimester_average,
            s.excused_absences,
            s.unexcused_absences,
            &s.qualitative_remark,
        ))?;
    }
    Ok(())
}

/// Find-and-merge-then-recompute in a single transaction. Creates a zeroed
/// record for the key when none exists. The update must already be validated.
pub fn upsert(
    conn: &Connection,
    key: GradeKey<'_>,
    update: &GradeUpdate,
) -> rusqlite::Result<StoredGrade> {
    let tx = conn.unchecked_transaction()?;

    let now = db::now_rfc3339();
    let mut grade = match find_by_key(&tx, key)? {
        Some(g) => g,
        None => StoredGrade {
            id: Uuid::new_v4().to_string(),
            student_id: key.student_id.to_string(),
            course_id: key.course_id.to_string(),
            academic_year_id: key.academic_year_id.to_string(),
            record: GradeRecord::default(),
            created_at: now.clone(),
            updated_at: now.clone(),
        },
    };

    update.merge_into(&mut grade.record);
    grade.record = calc::recompute(grade.record);
    grade.updated_at = now;

    store(&tx, &grade)?;
    tx.commit()?;
    Ok(grade)
}

/// Returns false when no grade had that id.
pub fn delete(conn: &Connection, grade_id: &str) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grade_trimesters WHERE grade_id = ?", [grade_id])?;
    let n = tx.execute("DELETE FROM grades WHERE id = ?", [grade_id])?;
    tx.commit()?;
    Ok(n > 0)
}
