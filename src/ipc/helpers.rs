use crate::auth::{self, Role};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::users::{self, UserView};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde_json::json;

pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))?;
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{key} must not be empty")));
    }
    Ok(v)
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Deserializes `params[key]` (or the whole params object when `key` is None).
pub fn parse_params<T: DeserializeOwned>(req: &Request, key: Option<&str>) -> Result<T, HandlerErr> {
    let raw = match key {
        Some(k) => req
            .params
            .get(k)
            .cloned()
            .ok_or_else(|| HandlerErr::bad_params(format!("missing {k}")))?,
        None => req.params.clone(),
    };
    serde_json::from_value(raw).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

/// Resolves the caller from the request token. The role is re-read from
/// storage; the copy in the token is not trusted.
pub fn authenticate(state: &AppState, req: &Request) -> Result<UserView, HandlerErr> {
    let Some(raw) = req.token.as_deref().map(auth::strip_bearer).filter(|t| !t.is_empty()) else {
        return Err(HandlerErr::new(
            "unauthorized",
            "not authorized to access this method: no token",
        ));
    };
    let claims = auth::verify_token(&state.config.jwt_secret, raw).map_err(|e| {
        tracing::debug!(error = %e, "token rejected");
        HandlerErr::new("unauthorized", "token expired or invalid")
    })?;

    let conn = db_conn(state)?;
    users::find_user(conn, &claims.sub)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| {
            HandlerErr::new("unauthorized", "token is valid but the user no longer exists")
        })
}

pub fn require_role(
    state: &AppState,
    req: &Request,
    roles: &[Role],
) -> Result<UserView, HandlerErr> {
    let user = authenticate(state, req)?;
    if !roles.contains(&user.role) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("access denied: role ({}) lacks permission", user.role.as_str()),
        )
        .with_details(json!({ "method": req.method })));
    }
    Ok(user)
}

pub const STAFF: &[Role] = &[Role::Admin, Role::Teacher];
pub const ADMIN: &[Role] = &[Role::Admin];

/// Teachers may only touch courses they teach; admins may touch any.
pub fn ensure_course_access(
    conn: &Connection,
    user: &UserView,
    course_id: &str,
) -> Result<(), HandlerErr> {
    let teacher_id: Option<String> = conn
        .query_row(
            "SELECT teacher_id FROM courses WHERE id = ?",
            [course_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(teacher_id) = teacher_id else {
        return Err(HandlerErr::not_found("course").with_details(json!({ "courseId": course_id })));
    };
    if user.role == Role::Teacher && teacher_id != user.id {
        return Err(HandlerErr::new(
            "forbidden",
            "no permission to manage grades in this course",
        )
        .with_details(json!({ "courseId": course_id })));
    }
    Ok(())
}

pub fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
    let found: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(found.is_some())
}
