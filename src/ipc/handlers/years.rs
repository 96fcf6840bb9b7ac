use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, ADMIN};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub is_current: bool,
    pub created_at: String,
    pub updated_at: String,
}

const YEAR_COLUMNS: &str = "id, name, start_date, end_date, is_current, created_at, updated_at";

fn year_from_row(row: &Row<'_>) -> rusqlite::Result<AcademicYear> {
    let is_current: i64 = row.get(4)?;
    Ok(AcademicYear {
        id: row.get(0)?,
        name: row.get(1)?,
        start_date: row.get(2)?,
        end_date: row.get(3)?,
        is_current: is_current != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn find_year(conn: &Connection, year_id: &str) -> rusqlite::Result<Option<AcademicYear>> {
    let sql = format!("SELECT {YEAR_COLUMNS} FROM academic_years WHERE id = ?");
    conn.query_row(&sql, [year_id], year_from_row).optional()
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("{field} must be a YYYY-MM-DD date"))
            .with_details(json!({ "field": field, "value": raw }))
    })
}

fn validate(year: &AcademicYear) -> Result<(), HandlerErr> {
    if year.name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let start = parse_date("startDate", &year.start_date)?;
    let end = parse_date("endDate", &year.end_date)?;
    if start > end {
        return Err(HandlerErr::bad_params("startDate must not be after endDate")
            .with_details(json!({ "startDate": year.start_date, "endDate": year.end_date })));
    }
    Ok(())
}

fn conflict_or<'a>(code: &'static str, name: &'a str) -> impl Fn(rusqlite::Error) -> HandlerErr + 'a {
    move |e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new("conflict", "an academic year with that name already exists")
                .with_details(json!({ "name": name }))
        } else {
            HandlerErr::db(code, e).with_details(json!({ "table": "academic_years" }))
        }
    }
}

/// Writes the row and, when it is current, clears the flag on every other
/// year in the same transaction.
fn save(conn: &Connection, year: &AcademicYear, insert: bool) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    if year.is_current {
        tx.execute(
            "UPDATE academic_years SET is_current = 0 WHERE id <> ? AND is_current <> 0",
            [&year.id],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    if insert {
        tx.execute(
            "INSERT INTO academic_years(id, name, start_date, end_date, is_current, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &year.id,
                &year.name,
                &year.start_date,
                &year.end_date,
                year.is_current as i64,
                &year.created_at,
                &year.updated_at,
            ),
        )
        .map_err(conflict_or("db_insert_failed", &year.name))?;
    } else {
        tx.execute(
            "UPDATE academic_years
             SET name = ?, start_date = ?, end_date = ?, is_current = ?, updated_at = ?
             WHERE id = ?",
            (
                &year.name,
                &year.start_date,
                &year.end_date,
                year.is_current as i64,
                &year.updated_at,
                &year.id,
            ),
        )
        .map_err(conflict_or("db_update_failed", &year.name))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;
    // Most recent first.
    let sql = format!("SELECT {YEAR_COLUMNS} FROM academic_years ORDER BY start_date DESC, name");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let years = stmt
        .query_map([], year_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "years": years }))
}

fn handle_years_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::authenticate(state, req)?;
    let conn = helpers::db_conn(state)?;
    let year_id = helpers::required_str(req, "yearId")?;
    let year = find_year(conn, &year_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("academic year").with_details(json!({ "yearId": year_id })))?;
    Ok(json!({ "year": year }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct YearCreate {
    name: String,
    start_date: String,
    end_date: String,
    #[serde(default)]
    is_current: bool,
}

fn handle_years_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let p: YearCreate = helpers::parse_params(req, None)?;

    let now = db::now_rfc3339();
    let year = AcademicYear {
        id: Uuid::new_v4().to_string(),
        name: p.name.trim().to_string(),
        start_date: p.start_date.trim().to_string(),
        end_date: p.end_date.trim().to_string(),
        is_current: p.is_current,
        created_at: now.clone(),
        updated_at: now,
    };
    validate(&year)?;
    save(conn, &year, true)?;
    tracing::info!(year_id = %year.id, name = %year.name, "academic year created");
    Ok(json!({ "year": year }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct YearPatch {
    name: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    is_current: Option<bool>,
}

fn handle_years_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let year_id = helpers::required_str(req, "yearId")?;
    let patch: YearPatch = helpers::parse_params(req, Some("patch"))?;

    let mut year = find_year(conn, &year_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("academic year").with_details(json!({ "yearId": year_id })))?;
    if let Some(v) = patch.name {
        year.name = v.trim().to_string();
    }
    if let Some(v) = patch.start_date {
        year.start_date = v.trim().to_string();
    }
    if let Some(v) = patch.end_date {
        year.end_date = v.trim().to_string();
    }
    if let Some(v) = patch.is_current {
        year.is_current = v;
    }
    year.updated_at = db::now_rfc3339();

    validate(&year)?;
    save(conn, &year, false)?;
    Ok(json!({ "year": year }))
}

fn handle_years_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let year_id = helpers::required_str(req, "yearId")?;

    if !helpers::exists(conn, "academic_years", &year_id)? {
        return Err(HandlerErr::not_found("academic year").with_details(json!({ "yearId": year_id })));
    }
    let (courses, grades): (i64, i64) = conn
        .query_row(
            "SELECT
               (SELECT COUNT(*) FROM courses WHERE academic_year_id = ?1),
               (SELECT COUNT(*) FROM grades WHERE academic_year_id = ?1)",
            [&year_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if courses > 0 || grades > 0 {
        return Err(HandlerErr::new("conflict", "academic year is still referenced")
            .with_details(json!({ "courseCount": courses, "gradeCount": grades })));
    }

    conn.execute("DELETE FROM academic_years WHERE id = ?", [&year_id])
        .map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "academic_years" }))
        })?;
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "years.list" => handle_years_list(state, req),
        "years.get" => handle_years_get(state, req),
        "years.create" => handle_years_create(state, req),
        "years.update" => handle_years_update(state, req),
        "years.delete" => handle_years_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
