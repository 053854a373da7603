//! Configuration loading.
//!
//! Grounded on the teacher's `config.rs`/`core/config.rs`: a dedicated
//! loader function that applies defaults, validates, and logs what it found.
//! The wire format here is the `key value` file from spec.md §6 rather than
//! environment variables, but the shape (one `load_*` entry point producing
//! a validated struct) is the same.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Threaded,
    EventLoop,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub concurrency: Concurrency,
    pub max_clients: usize,
    pub log_file: Option<String>,
    pub save_seconds: u64,
    pub save_changes: u64,
    pub buffer_size: usize,
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6379,
            concurrency: Concurrency::Threaded,
            max_clients: 100,
            log_file: Some("crimsoncache.log".to_string()),
            save_seconds: 300,
            save_changes: 1000,
            buffer_size: 1024,
            max_events: 64,
        }
    }
}

impl Config {
    /// Parses the `key value` config file format of spec.md §6: `#`
    /// comments, blank lines skipped, unknown keys ignored. Absence of the
    /// file is not an error — the caller decides whether to warn.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        let mut config = Self::default();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();

            match key {
                "port" => match value.parse::<u16>() {
                    Ok(p) => config.port = p,
                    Err(_) => warn!("config line {}: invalid port '{}'", lineno + 1, value),
                },
                "concurrency" => match value {
                    "threaded" => config.concurrency = Concurrency::Threaded,
                    "eventloop" => config.concurrency = Concurrency::EventLoop,
                    other => warn!("config line {}: unknown concurrency '{}'", lineno + 1, other),
                },
                "maxClients" => match value.parse::<usize>() {
                    Ok(v) => config.max_clients = v,
                    Err(_) => warn!("config line {}: invalid maxClients '{}'", lineno + 1, value),
                },
                "logFile" => config.log_file = Some(value.to_string()),
                "saveSeconds" => match value.parse::<u64>() {
                    Ok(v) => config.save_seconds = v,
                    Err(_) => warn!("config line {}: invalid saveSeconds '{}'", lineno + 1, value),
                },
                "saveChanges" => match value.parse::<u64>() {
                    Ok(v) => config.save_changes = v,
                    Err(_) => warn!("config line {}: invalid saveChanges '{}'", lineno + 1, value),
                },
                "buffer_size" => match value.parse::<usize>() {
                    Ok(v) => config.buffer_size = v,
                    Err(_) => warn!("config line {}: invalid buffer_size '{}'", lineno + 1, value),
                },
                "max_events" => match value.parse::<usize>() {
                    Ok(v) => config.max_events = v,
                    Err(_) => warn!("config line {}: invalid max_events '{}'", lineno + 1, value),
                },
                other => warn!("config line {}: unknown key '{}', ignored", lineno + 1, other),
            }
        }

        info!(
            "loaded config: port={} concurrency={:?} maxClients={}",
            config.port, config.concurrency, config.max_clients
        );
        Ok(config)
    }

    /// Resolves the CLI's single optional positional argument per spec.md
    /// §6: a numeric value in 1..65535 overrides the port; anything else is
    /// a config path. A missing file warns and falls back to defaults.
    pub fn resolve(arg: Option<&str>) -> Self {
        let Some(arg) = arg else {
            return Self::default();
        };

        if let Ok(port) = arg.parse::<u32>() {
            if (1..=65535).contains(&port) {
                let mut config = Self::default();
                config.port = port as u16;
                return config;
            }
        }

        let path = Path::new(arg);
        match Self::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "could not read config file '{}' ({}), using defaults",
                    arg, e
                );
                Self::default()
            }
        }
    }
}
