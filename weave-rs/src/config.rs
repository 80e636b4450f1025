//! Engine configuration file parser.
//!
//! The format is one `name = value` setting per line:
//!
//! | Key | Value | Default |
//! |-----|-------|---------|
//! | `debug` | bool; bypass cache reads | `off` |
//! | `html_cache` | bool; cache rendered output | `on` |
//! | `max_age` | seconds, `0` = unlimited | `0` |
//! | `output` | `html`, `xhtml`, `xml`, `plain` | `html` |
//! | `on_error` | `print`, `throw`, `abort`, `ignore` | `print` |
//! | `default_storage` | storage used by bare names | `file` |
//! | `template_dir` | root of the `file` storage | `templates` |
//! | `extension` | template file extension | `tpl` |
//! | `cache_dir` | artifact directory | platform cache dir |
//! | `delimiters` | two whitespace-separated markers | `{ }` |
//!
//! Lines starting with `;` are comments.  Values may be double-quoted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;

use crate::error::ErrorPolicy;
use crate::escape::OutputMode;
use crate::template::Delimiters;

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub debug: bool,
    pub html_cache: bool,
    /// `None` means cache entries never expire by age.
    pub max_age: Option<Duration>,
    pub output: OutputMode,
    pub on_error: ErrorPolicy,
    pub default_storage: String,
    pub template_dir: PathBuf,
    pub extension: String,
    pub cache_dir: PathBuf,
    pub delimiters: Delimiters,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            html_cache: true,
            max_age: None,
            output: OutputMode::Html,
            on_error: ErrorPolicy::Print,
            default_storage: "file".into(),
            template_dir: PathBuf::from("templates"),
            extension: "tpl".into(),
            cache_dir: default_cache_dir(),
            delimiters: Delimiters::default(),
        }
    }
}

/// Per-user cache directory, or `weave` under the system temp dir.
pub fn default_cache_dir() -> PathBuf {
    match ProjectDirs::from("", "", "weave") {
        Some(dirs) => dirs.cache_dir().to_path_buf(),
        None => std::env::temp_dir().join("weave"),
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config string.
    ///
    /// Bad lines are reported and skipped; every good line still applies.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config = Config::new();
        let mut errors = Vec::new();

        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();

            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                errors.push(ConfigError {
                    line: lineno,
                    message: format!("expected `name = value`, got `{line}`"),
                });
                continue;
            };
            if let Err(msg) = config.set(name.trim(), unquote(value.trim())) {
                errors.push(ConfigError {
                    line: lineno,
                    message: msg,
                });
            }
        }

        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    /// Apply one setting by name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => self.debug = parse_bool(name, value)?,
            "html_cache" => self.html_cache = parse_bool(name, value)?,
            "max_age" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("max_age: expected seconds, got `{value}`"))?;
                self.max_age = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "output" => {
                self.output = OutputMode::from_name(value)
                    .ok_or_else(|| format!("output: unknown mode `{value}`"))?;
            }
            "on_error" => {
                self.on_error = ErrorPolicy::from_name(value)
                    .ok_or_else(|| format!("on_error: unknown policy `{value}`"))?;
            }
            "default_storage" => {
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(format!("default_storage: illegal storage name `{value}`"));
                }
                self.default_storage = value.to_owned();
            }
            "template_dir" => self.template_dir = PathBuf::from(value),
            "extension" => self.extension = value.trim_start_matches('.').to_owned(),
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "delimiters" => {
                let parts: Vec<&str> = value.split_whitespace().collect();
                match parts.as_slice() {
                    [open, close] => {
                        self.delimiters = Delimiters {
                            open: (*open).to_owned(),
                            close: (*close).to_owned(),
                        }
                    }
                    _ => return Err(format!("delimiters: expected two markers, got `{value}`")),
                }
            }
            _ => return Err(format!("unknown setting `{name}`")),
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(format!("{name}: expected on/off, got `{value}`")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
