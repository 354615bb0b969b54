/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_DATA_DIR: &str = ".chatsync";
const DEFAULT_LOCAL_USER: &str = "me";
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Sync core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local store (`<data_dir>/chatsync.db`)
    pub data_dir: PathBuf,

    /// Identity of the local user; their messages never count as unread
    pub local_user_id: String,

    /// Capacity of the change broadcast channels
    pub event_buffer: usize,

    /// Truncate `last_message_preview` to this many chars
    pub preview_max_chars: Option<usize>,

    /// Flush the store to disk after every committed transaction
    pub flush_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            local_user_id: DEFAULT_LOCAL_USER.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            preview_max_chars: None,
            flush_on_commit: true,
        }
    }
}

impl Config {
    /// Parse flags from command line arguments (program name first).
    /// Returns the config and any positional arguments left over.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Config::default();
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = PathBuf::from(path);
                    i += 2;
                }
                "--user" => {
                    let user = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--user requires a user id".to_string())
                    })?;
                    config.local_user_id = user.clone();
                    i += 2;
                }
                "--buffer" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--buffer requires a number".to_string())
                    })?;
                    config.event_buffer = n.parse::<usize>().map_err(|_| {
                        SyncError::Config("--buffer must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                "--preview-chars" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--preview-chars requires a number".to_string())
                    })?;
                    config.preview_max_chars = Some(n.parse::<usize>().map_err(|_| {
                        SyncError::Config("--preview-chars must be a number".to_string())
                    })?);
                    i += 2;
                }
                "--no-flush" => {
                    config.flush_on_commit = false;
                    i += 1;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(dir) = std::env::var("CHATSYNC_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(user) = std::env::var("CHATSYNC_USER_ID") {
            if !user.is_empty() {
                config.local_user_id = user;
            }
        }

        config.validate()?;
        Ok((config, rest))
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_user_id.trim().is_empty() {
            return Err(SyncError::Config("local user id must not be empty".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Path of the sled database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chatsync.db")
    }
}
