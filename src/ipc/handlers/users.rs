use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{self, respond, ADMIN, STAFF};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// A user as returned to callers. Never carries the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: String,
    pub updated_at: String,
}

const USER_COLUMNS: &str = "id, name, email, role, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserView> {
    let raw: String = row.get(3)?;
    let role = Role::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown role: {raw}").into(),
        )
    })?;
    Ok(UserView {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

pub fn find_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<UserView>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    conn.query_row(&sql, [user_id], user_from_row).optional()
}

/// Looks up a user by e-mail along with the stored password hash.
pub fn find_user_for_login(
    conn: &Connection,
    email: &str,
) -> rusqlite::Result<Option<(UserView, String)>> {
    let sql = format!("SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ?");
    conn.query_row(&sql, [email], |r| Ok((user_from_row(r)?, r.get(6)?)))
        .optional()
}

pub fn count_users(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
}

pub fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if !valid {
        return Err(HandlerErr::bad_params("email is not a valid address")
            .with_details(json!({ "email": raw })));
    }
    Ok(email)
}

pub fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < auth::MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            auth::MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("role must be one of: admin, teacher")
            .with_details(json!({ "role": raw }))
    })
}

/// Inserts a user; shared with `auth.register`.
pub fn insert_user(
    conn: &Connection,
    name: &str,
    email: &str,
    password: &str,
    role: Role,
) -> Result<UserView, HandlerErr> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = normalize_email(email)?;
    check_password(password)?;
    let hash = auth::hash_password(password)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;

    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, password_hash, role, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, name, &email, &hash, role.as_str(), &now, &now),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new("conflict", "email already registered")
                .with_details(json!({ "email": email }))
        } else {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "users" }))
        }
    })?;

    tracing::info!(user_id = %id, role = role.as_str(), "user created");
    Ok(UserView {
        id,
        name: name.to_string(),
        email,
        role,
        created_at: now.clone(),
        updated_at: now,
    })
}

fn list_users(conn: &Connection, role: Option<Role>) -> Result<Vec<UserView>, HandlerErr> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY name COLLATE NOCASE, id"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([role.map(Role::as_str)], user_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let users = list_users(conn, None)?;
    Ok(json!({ "total": users.len(), "users": users }))
}

fn handle_users_teachers(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, STAFF)?;
    let conn = helpers::db_conn(state)?;
    let users = list_users(conn, Some(Role::Teacher))?;
    Ok(json!({ "total": users.len(), "users": users }))
}

fn handle_users_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let user_id = helpers::required_str(req, "userId")?;
    let user = find_user(conn, &user_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("user").with_details(json!({ "userId": user_id })))?;
    Ok(json!({ "user": user }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UserCreate {
    name: String,
    email: String,
    password: String,
    role: String,
}

fn handle_users_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let p: UserCreate = helpers::parse_params(req, None)?;
    let role = parse_role(&p.role)?;
    let user = insert_user(conn, &p.name, &p.email, &p.password, role)?;
    Ok(json!({ "user": user }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct UserPatch {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    role: Option<String>,
}

fn handle_users_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let user_id = helpers::required_str(req, "userId")?;
    let patch: UserPatch = helpers::parse_params(req, Some("patch"))?;

    let mut user = find_user(conn, &user_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("user").with_details(json!({ "userId": user_id })))?;

    if let Some(name) = patch.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        user.name = name;
    }
    if let Some(email) = patch.email {
        user.email = normalize_email(&email)?;
    }
    if let Some(role) = patch.role {
        let role = parse_role(&role)?;
        if caller.id == user.id && role != Role::Admin {
            return Err(HandlerErr::new("conflict", "admins cannot demote themselves"));
        }
        user.role = role;
    }
    let new_hash = match patch.password {
        Some(pw) => {
            check_password(&pw)?;
            Some(auth::hash_password(&pw).map_err(|e| HandlerErr::new("internal", e.to_string()))?)
        }
        None => None,
    };

    user.updated_at = db::now_rfc3339();
    conn.execute(
        "UPDATE users
         SET name = ?, email = ?, role = ?, password_hash = COALESCE(?, password_hash), updated_at = ?
         WHERE id = ?",
        (
            &user.name,
            &user.email,
            user.role.as_str(),
            new_hash,
            &user.updated_at,
            &user.id,
        ),
    )
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            HandlerErr::new("conflict", "email already registered")
                .with_details(json!({ "email": user.email }))
        } else {
            HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "users" }))
        }
    })?;

    Ok(json!({ "user": user }))
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let caller = helpers::require_role(state, req, ADMIN)?;
    let conn = helpers::db_conn(state)?;
    let user_id = helpers::required_str(req, "userId")?;

    if caller.id == user_id {
        return Err(HandlerErr::new("conflict", "cannot delete the signed-in user"));
    }
    if !helpers::exists(conn, "users", &user_id)? {
        return Err(HandlerErr::not_found("user").with_details(json!({ "userId": user_id })));
    }
    let courses: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM courses WHERE teacher_id = ?",
            [&user_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if courses > 0 {
        return Err(HandlerErr::new("conflict", "user still teaches courses")
            .with_details(json!({ "userId": user_id, "courseCount": courses })));
    }

    conn.execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "users" })))?;
    tracing::info!(user_id = %user_id, "user deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => handle_users_list(state, req),
        "users.teachers" => handle_users_teachers(state, req),
        "users.get" => handle_users_get(state, req),
        "users.create" => handle_users_create(state, req),
        "users.update" => handle_users_update(state, req),
        "users.delete" => handle_users_delete(state, req),
        _ => return None,
    };
    Some(respond(req, result))
}
