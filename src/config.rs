//! Configuration management
//!
//! Runtime wiring only (paths, tick interval, bot identity). Behaviour
//! knobs live in [`crate::settings`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Proactive speaking runs every 3 minutes unless overridden
const DEFAULT_SPEAK_INTERVAL_SECS: u64 = 180;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path for messages and learned data
    pub db_path: PathBuf,

    /// TOML settings file
    pub settings_path: PathBuf,

    /// Interval between proactive-speak ticks
    pub speak_interval: Duration,

    /// Platform id of the bot account
    pub self_id: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("learning_chat");

        let db_path = std::env::var("LEARNING_CHAT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("learning_chat.db"));

        let settings_path = std::env::var("LEARNING_CHAT_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("learning_chat.toml"));

        let speak_interval = match std::env::var("LEARNING_CHAT_SPEAK_INTERVAL") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("LEARNING_CHAT_SPEAK_INTERVAL is not a number: {v}"))?,
            ),
            Err(_) => Duration::from_secs(DEFAULT_SPEAK_INTERVAL_SECS),
        };

        let self_id = match std::env::var("LEARNING_CHAT_SELF_ID") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("LEARNING_CHAT_SELF_ID is not a number: {v}"))?,
            Err(_) => 0,
        };

        Ok(Self {
            db_path,
            settings_path,
            speak_interval,
            self_id,
        })
    }
}
