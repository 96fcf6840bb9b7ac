use anyhow::{bail, Context};
use std::path::PathBuf;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// Workspace opened at startup, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("SCHOOLD_JWT_SECRET")
            .or_else(|| lookup("JWT_SECRET"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if jwt_secret.is_empty() {
            bail!("SCHOOLD_JWT_SECRET (or JWT_SECRET) must be set");
        }

        let token_ttl_hours = match lookup("SCHOOLD_TOKEN_TTL_HOURS") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("SCHOOLD_TOKEN_TTL_HOURS is not an integer: {raw}"))?,
            None => DEFAULT_TOKEN_TTL_HOURS,
        };
        if token_ttl_hours <= 0 {
            bail!("SCHOOLD_TOKEN_TTL_HOURS must be > 0");
        }

        let workspace = lookup("SCHOOLD_WORKSPACE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            jwt_secret,
            token_ttl_hours,
            workspace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn secret_is_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("SCHOOLD_JWT_SECRET", "  ")])).is_err());
    }

    #[test]
    fn falls_back_to_jwt_secret_and_defaults() {
        let cfg = Config::from_lookup(lookup(&[("JWT_SECRET", "s3cret")])).expect("config");
        assert_eq!(cfg.jwt_secret, "s3cret");
        assert_eq!(cfg.token_ttl_hours, DEFAULT_TOKEN_TTL_HOURS);
        assert!(cfg.workspace.is_none());
    }

    #[test]
    fn rejects_bad_ttl() {
        let bad = Config::from_lookup(lookup(&[
            ("SCHOOLD_JWT_SECRET", "x"),
            ("SCHOOLD_TOKEN_TTL_HOURS", "soon"),
        ]));
        assert!(bad.is_err());
        let zero = Config::from_lookup(lookup(&[
            ("SCHOOLD_JWT_SECRET", "x"),
            ("SCHOOLD_TOKEN_TTL_HOURS", "0"),
        ]));
        assert!(zero.is_err());
        let ok = Config::from_lookup(lookup(&[
            ("SCHOOLD_JWT_SECRET", "x"),
            ("SCHOOLD_TOKEN_TTL_HOURS", "2"),
            ("SCHOOLD_WORKSPACE", "/tmp/school"),
        ]))
        .expect("config");
        assert_eq!(ok.token_ttl_hours, 2);
        assert_eq!(ok.workspace, Some(PathBuf::from("/tmp/school")));
    }
}
