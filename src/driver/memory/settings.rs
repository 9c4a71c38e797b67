use super::engine::driver_error;
use crate::core::{Result, codes};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

pub(super) const STATEMENT_TIMEOUT: &str = "statement_timeout";
pub(super) const IDLE_IN_TRANSACTION_SESSION_TIMEOUT: &str = "idle_in_transaction_session_timeout";

/// Run-time parameters of one session or transaction.
#[derive(Debug, Clone, Default)]
pub(super) struct Settings {
    statement_timeout_ms: u64,
    idle_timeout_ms: u64,
    other: BTreeMap<String, String>,
}

impl Settings {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            STATEMENT_TIMEOUT => self.statement_timeout_ms = parse_millis(name, value)?,
            IDLE_IN_TRANSACTION_SESSION_TIMEOUT => self.idle_timeout_ms = parse_millis(name, value)?,
            _ => {
                self.other.insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    pub fn show(&self, name: &str) -> Option<String> {
        match name {
            STATEMENT_TIMEOUT => Some(format_millis(self.statement_timeout_ms)),
            IDLE_IN_TRANSACTION_SESSION_TIMEOUT => Some(format_millis(self.idle_timeout_ms)),
            _ => self.other.get(name).cloned().or_else(|| default_setting(name)),
        }
    }
}

fn default_setting(name: &str) -> Option<String> {
    let value = match name {
        "application_name" => "",
        "search_path" => "\"$user\", public",
        "timezone" => "UTC",
        "server_version" => "16.0",
        "client_encoding" => "UTF8",
        _ => return None,
    };
    Some(value.to_string())
}

/// Parses a time setting the way the server does: bare numbers are milliseconds.
fn parse_millis(name: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);

    let invalid = || {
        driver_error(
            codes::INVALID_PARAMETER_VALUE,
            format!("invalid value for parameter \"{}\": \"{}\"", name, value),
        )
    };

    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let factor = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "min" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid()),
    };
    Ok(amount * factor)
}

/// Formats milliseconds in the largest whole unit, as `SHOW` prints them.
fn format_millis(ms: u64) -> String {
    match ms {
        0 => "0".to_string(),
        ms if ms % 86_400_000 == 0 => format!("{}d", ms / 86_400_000),
        ms if ms % 3_600_000 == 0 => format!("{}h", ms / 3_600_000),
        ms if ms % 60_000 == 0 => format!("{}min", ms / 60_000),
        ms if ms % 1_000 == 0 => format!("{}s", ms / 1_000),
        ms => format!("{}ms", ms),
    }
}

/// Everything expression evaluation may read about the current session.
#[derive(Debug, Clone)]
pub(super) struct SessionView {
    pub database: String,
    /// Transaction start time, or the statement time outside a transaction.
    pub now: DateTime<Utc>,
    pub settings: Settings,
    pub isolation: Option<String>,
    pub read_only: bool,
}

impl SessionView {
    pub fn show(&self, name: &str) -> Result<String> {
        match name {
            "transaction_isolation" => Ok(self
                .isolation
                .clone()
                .unwrap_or_else(|| "read committed".to_string())),
            "transaction_read_only" => Ok(if self.read_only { "on" } else { "off" }.to_string()),
            _ => self.settings.show(name).ok_or_else(|| {
                driver_error(
                    codes::UNDEFINED_OBJECT,
                    format!("unrecognized configuration parameter \"{}\"", name),
                )
            }),
        }
    }
}
