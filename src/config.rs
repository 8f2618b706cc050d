//! Session configuration.
//!
//! Settings come from, in order of precedence:
//! 1. `LISP_BRIDGE_*` environment variables
//! 2. The JSON file named by `$LISP_BRIDGE_CONFIG`, or
//!    `<config dir>/lisp-bridge/config.json` when that variable is unset
//! 3. Built-in defaults (`sbcl --script`, `COMMON-LISP-USER`)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::symbol::COMMON_LISP_USER;

/// Remote side of the protocol, shipped inside the crate.
const BOOTSTRAP_SOURCE: &str = include_str!("../lisp/bootstrap.lisp");

pub const CONFIG_ENV: &str = "LISP_BRIDGE_CONFIG";
pub const COMMAND_ENV: &str = "LISP_BRIDGE_COMMAND";
pub const DEBUG_ENV: &str = "LISP_BRIDGE_DEBUG";
pub const QUICKLISP_ENV: &str = "LISP_BRIDGE_QUICKLISP";

/// How to start and talk to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interpreter program and leading arguments; the bootstrap script
    /// path is appended.
    pub command: Vec<String>,
    /// Use this script instead of the embedded one.
    pub bootstrap: Option<PathBuf>,
    /// Load `~/quicklisp/setup.lisp` after startup.
    pub quicklisp: bool,
    /// Log every request and result at info level.
    pub debug: bool,
    /// Namespace the interpreter starts in.
    pub namespace: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: vec!["sbcl".to_string(), "--script".to_string()],
            bootstrap: None,
            quicklisp: false,
            debug: false,
            namespace: COMMON_LISP_USER.to_string(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("lisp-bridge").join("config.json"))
    }

    /// Build the effective configuration from file and environment.
    pub fn resolve() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let config = match explicit {
            Some(path) => Self::load(&path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply `LISP_BRIDGE_*` overrides using `lookup` to read variables.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(command) = lookup(COMMAND_ENV) {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                warn!("Ignoring empty {}", COMMAND_ENV);
            } else {
                self.command = parts;
            }
        }
        if let Some(flag) = lookup(DEBUG_ENV).and_then(|v| parse_flag(DEBUG_ENV, &v)) {
            self.debug = flag;
        }
        if let Some(flag) = lookup(QUICKLISP_ENV).and_then(|v| parse_flag(QUICKLISP_ENV, &v)) {
            self.quicklisp = flag;
        }
        self
    }

    /// `~/quicklisp/setup.lisp`, if a home directory is known.
    pub fn quicklisp_setup() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join("quicklisp").join("setup.lisp"))
    }

    /// Source of the embedded bootstrap script.
    pub fn embedded_bootstrap() -> &'static str {
        BOOTSTRAP_SOURCE
    }

    /// Path of the script to hand to the interpreter.
    ///
    /// The embedded script is written to the temp directory on first use
    /// and rewritten whenever its contents differ.
    pub fn bootstrap_path(&self) -> io::Result<PathBuf> {
        if let Some(path) = &self.bootstrap {
            return Ok(path.clone());
        }
        let path = std::env::temp_dir().join(format!(
            "lisp-bridge-{}.lisp",
            env!("CARGO_PKG_VERSION")
        ));
        let current = fs::read_to_string(&path).ok();
        if current.as_deref() != Some(BOOTSTRAP_SOURCE) {
            debug!("Writing bootstrap script to {}", path.display());
            // Write then rename so a concurrently starting session never
            // sees a half-written script.
            let staging = path.with_extension(format!("{}.tmp", std::process::id()));
            fs::write(&staging, BOOTSTRAP_SOURCE)?;
            fs::rename(&staging, &path)?;
        }
        Ok(path)
    }
}

fn parse_flag(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        other => {
            warn!("Ignoring {}={:?}: expected a boolean", name, other);
            None
        }
    }
}
