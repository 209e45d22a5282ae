use crate::{
    entity::Capacity,
    error::{Error, Result},
    reaper::ReaperSettings,
    scheduler::AssignmentSettings,
};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, read from `HELPLINE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_path: PathBuf,
    pub bind_addr: String,
    pub assignment: AssignmentSettings,
    pub reaper: ReaperSettings,
    pub capacity: Capacity,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_path = match lookup("HELPLINE_DB_PATH") {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => {
                // ~/.helpline/helpline.db
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".helpline").join("helpline.db")
            }
        };

        let bind_addr = lookup("HELPLINE_BIND").unwrap_or_else(|| "0.0.0.0:3000".into());

        let assignment = AssignmentSettings {
            poll_interval: secs(&lookup, "HELPLINE_POLL_INTERVAL_SECS", 5)?,
            deadline: secs(&lookup, "HELPLINE_ASSIGNMENT_DEADLINE_SECS", 60 * 60)?,
        };
        let reaper = ReaperSettings {
            interval: secs(&lookup, "HELPLINE_REAPER_INTERVAL_SECS", 60)?,
            idle_threshold: secs(&lookup, "HELPLINE_IDLE_TIMEOUT_SECS", 5 * 60)?,
        };
        let capacity = Capacity {
            max_active: number(&lookup, "HELPLINE_MAX_ACTIVE", 5)?,
            max_pending: number(&lookup, "HELPLINE_MAX_PENDING", 10)?,
        };

        Ok(Self {
            database_path,
            bind_addr,
            assignment,
            reaper,
            capacity,
        })
    }
}

fn number(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: u32) -> Result<u32> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| Error::validation(key, format!("expected a positive integer, got '{raw}'")))?;
    if value == 0 {
        return Err(Error::validation(key, "must be greater than zero"));
    }
    Ok(value)
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: u32) -> Result<Duration> {
    number(lookup, key, default).map(|s| Duration::from_secs(u64::from(s)))
}
