//! Flat `key=value` configuration, plus the startup file that points at it.
//!
//! The startup file lives under the platform config directory
//! (`…/iplchat/server/startup.conf`) and contains a single `configPath=`
//! line naming the active config file. A missing config prompts the
//! operator interactively; declining aborts startup.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hours between automatic snapshots; 0 disables the timer.
    pub snapshot_timeout: u64,
    pub snapshot_path: PathBuf,
    pub snapshot_backlog: usize,
    pub database_path: PathBuf,
    pub database_name: String,
    pub database_buffered_access: bool,
    pub database_queue_size: usize,
    /// Minutes between queue flushes; 0 disables the timer.
    pub database_flush_timeout: u64,
    pub random_rate_limit: bool,
    /// Seconds of login/register throttle window; 0 disables throttling.
    pub rate_limit: u64,
    pub rate_limit_multiplier: f64,
    pub logfile_path: Option<PathBuf>,
    pub log_verbose: bool,
    pub autosave: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout: 24,
            snapshot_path: PathBuf::from("snapshots"),
            snapshot_backlog: 10,
            database_path: PathBuf::from("."),
            database_name: "iplchat.db".to_owned(),
            database_buffered_access: true,
            database_queue_size: 100,
            database_flush_timeout: 5,
            random_rate_limit: false,
            rate_limit: 0,
            rate_limit_multiplier: 2.0,
            logfile_path: None,
            log_verbose: false,
            autosave: true,
        }
    }
}

impl ServerConfig {
    /// Parse the line-oriented `key=value` format. Blank lines and `#`
    /// comments are skipped; unknown keys and unparsable values keep their
    /// defaults with a warning.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line, "config line without '='");
                continue;
            };
            config.apply(key.trim(), value.trim());
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "snapshotTimeout" => set_parsed(key, value, &mut self.snapshot_timeout),
            "snapshotPath" => self.snapshot_path = PathBuf::from(value),
            "snapshotBacklog" => set_parsed(key, value, &mut self.snapshot_backlog),
            "databasePath" => self.database_path = PathBuf::from(value),
            "databaseName" => self.database_name = value.to_owned(),
            "databaseBufferedAccess" => set_bool(key, value, &mut self.database_buffered_access),
            "databaseQueueSize" => set_parsed(key, value, &mut self.database_queue_size),
            "databaseFlushTimeout" => set_parsed(key, value, &mut self.database_flush_timeout),
            "randomRateLimit" => set_bool(key, value, &mut self.random_rate_limit),
            "rateLimit" => set_parsed(key, value, &mut self.rate_limit),
            "rateLimitMultiplier" => set_parsed(key, value, &mut self.rate_limit_multiplier),
            "logfilePath" => {
                self.logfile_path = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            "logVerbose" => set_bool(key, value, &mut self.log_verbose),
            "autosave" => set_bool(key, value, &mut self.autosave),
            other => tracing::warn!(key = other, "unknown config key"),
        }
    }

    /// Render in the same `key=value` format `parse` accepts.
    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: String| {
            out.push_str(key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        };
        line("snapshotTimeout", self.snapshot_timeout.to_string());
        line("snapshotPath", self.snapshot_path.display().to_string());
        line("snapshotBacklog", self.snapshot_backlog.to_string());
        line("databasePath", self.database_path.display().to_string());
        line("databaseName", self.database_name.clone());
        line(
            "databaseBufferedAccess",
            self.database_buffered_access.to_string(),
        );
        line("databaseQueueSize", self.database_queue_size.to_string());
        line(
            "databaseFlushTimeout",
            self.database_flush_timeout.to_string(),
        );
        line("randomRateLimit", self.random_rate_limit.to_string());
        line("rateLimit", self.rate_limit.to_string());
        line("rateLimitMultiplier", self.rate_limit_multiplier.to_string());
        line(
            "logfilePath",
            self.logfile_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        line("logVerbose", self.log_verbose.to_string());
        line("autosave", self.autosave.to_string());
        out
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_file_string())?;
        Ok(())
    }

    pub fn db_file(&self) -> PathBuf {
        self.database_path.join(&self.database_name)
    }
}

/// `…/iplchat/server/startup.conf` under the platform config directory.
pub fn startup_file_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "iplchat", "iplchat")
        .ok_or_else(|| ServerError::Config("no home directory available".into()))?;
    Ok(dirs.config_dir().join("server").join("startup.conf"))
}

/// Read the startup file and return the config file path it names.
pub fn read_startup_file(path: &Path) -> Result<PathBuf> {
    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "configPath" {
                return Ok(PathBuf::from(value.trim()));
            }
        }
    }
    Err(ServerError::Config(format!(
        "startup file {} has no configPath entry",
        path.display()
    )))
}

pub fn write_startup_file(path: &Path, config_path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("configPath={}\n", config_path.display()))?;
    Ok(())
}

/// Resolve the active configuration: startup file → config file. When
/// either is missing, offer to create defaults on the console; a declined
/// prompt aborts startup.
pub fn load_or_prompt() -> Result<(ServerConfig, PathBuf)> {
    let startup = startup_file_path()?;

    let config_path = match read_startup_file(&startup) {
        Ok(path) => path,
        Err(_) => {
            let default_path = startup
                .parent()
                .map(|dir| dir.join("server.conf"))
                .unwrap_or_else(|| PathBuf::from("server.conf"));
            if !confirm(&format!(
                "No startup file at {}. Create one pointing at {}? [Y/n] ",
                startup.display(),
                default_path.display()
            ))? {
                return Err(ServerError::Config("operator declined configuration".into()));
            }
            write_startup_file(&startup, &default_path)?;
            default_path
        }
    };

    match ServerConfig::load(&config_path) {
        Ok(config) => Ok((config, config_path)),
        Err(_) => {
            if !confirm(&format!(
                "No config file at {}. Write defaults? [Y/n] ",
                config_path.display()
            ))? {
                return Err(ServerError::Config("operator declined configuration".into()));
            }
            let config = ServerConfig::default();
            config.save(&config_path)?;
            Ok((config, config_path))
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(key, value, "invalid config value, keeping default"),
    }
}

fn set_bool(key: &str, value: &str, slot: &mut bool) {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => *slot = true,
        "false" | "0" | "no" => *slot = false,
        _ => tracing::warn!(key, value, "invalid boolean config value, keeping default"),
    }
}
