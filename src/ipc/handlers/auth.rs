use crate::auth::{self, Role};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::users;
use crate::ipc::helpers::{self, respond};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RegisterParams {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LoginParams {
    email: String,
    password: String,
}

fn issue(state: &AppState, user: &users::UserView) -> Result<String, HandlerErr> {
    auth::issue_token(
        &state.config.jwt_secret,
        &user.id,
        user.role,
        state.config.token_ttl_hours,
    )
    .map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// The first account of an empty workspace is the administrator; every later
/// self-registration is a teacher.
fn handle_register(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = helpers::db_conn(state)?;
    let p: RegisterParams = helpers::parse_params(req, None)?;

    let existing = users::count_users(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let role = if existing == 0 { Role::Admin } else { Role::Teacher };
    let user = users::insert_user(conn, &p.name, &p.email, &p.password, role)?;
    let token = issue(state, &user)?;
    Ok(json!({ "user": user, "token": token }))
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = helpers::db_conn(state)?;
    let p: LoginParams = helpers::parse_params(req, None)?;

    let invalid = || HandlerErr::new("unauthorized", "invalid credentials");
    let email = p.email.trim().to_ascii_lowercase();
    let Some((user, hash)) =
        users::find_user_for_login(conn, &email).map_err(|e| HandlerErr::db("db_query_failed", e))?
    else {
        return Err(invalid());
    };
    if !auth::verify_password(&p.password, &hash) {
        return Err(invalid());
    }

    tracing::info!(user_id = %user.id, "login");
    let token = issue(state, &user)?;
    Ok(json!({ "user": user, "token": token }))
}

fn handle_me(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = helpers::authenticate(state, req)?;
    Ok(json!({ "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.register" => handle_register(state, req),
        "auth.login" => handle_login(state, req),
        "auth.me" => handle_me(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
