//! Template source storage.
//!
//! The engine reads template sources through the [`Storage`] trait.  Names
//! handed to a storage have already been validated by
//! [`crate::reference::TemplateRef`].

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

pub trait Storage: Send + Sync {
    /// Last-modified stamp, or `None` if the template does not exist.
    fn stamp(&self, name: &str) -> Option<SystemTime>;
    fn load(&self, name: &str) -> Option<String>;
    /// Human-readable location, used in error messages.
    fn path(&self, name: &str) -> String;
}

// ── DirStorage ────────────────────────────────────────────────────────────────

/// Templates as `<root>/<name>.<extension>` files.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
    extension: String,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        DirStorage {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_owned(),
        }
    }

    fn file(&self, name: &str) -> PathBuf {
        if self.extension.is_empty() {
            self.root.join(name)
        } else {
            self.root.join(format!("{name}.{}", self.extension))
        }
    }
}

impl Storage for DirStorage {
    fn stamp(&self, name: &str) -> Option<SystemTime> {
        fs::metadata(self.file(name)).and_then(|m| m.modified()).ok()
    }

    fn load(&self, name: &str) -> Option<String> {
        match fs::read_to_string(self.file(name)) {
            Ok(src) => Some(src),
            Err(e) => {
                tracing::debug!(template = name, error = %e, "template read failed");
                None
            }
        }
    }

    fn path(&self, name: &str) -> String {
        self.file(name).display().to_string()
    }
}

// ── MemoryStorage ─────────────────────────────────────────────────────────────

/// In-process templates with explicit stamps.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, (String, SystemTime)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, SystemTime)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a template, stamped now.
    pub fn insert(&self, name: &str, source: &str) {
        self.entries()
            .insert(name.to_owned(), (source.to_owned(), SystemTime::now()));
    }

    pub fn remove(&self, name: &str) {
        self.entries().remove(name);
    }

    /// Restamp a template as modified now.
    pub fn touch(&self, name: &str) {
        self.set_stamp(name, SystemTime::now());
    }

    pub fn set_stamp(&self, name: &str, stamp: SystemTime) {
        if let Some(entry) = self.entries().get_mut(name) {
            entry.1 = stamp;
        }
    }
}

impl Storage for MemoryStorage {
    fn stamp(&self, name: &str) -> Option<SystemTime> {
        self.entries().get(name).map(|(_, t)| *t)
    }

    fn load(&self, name: &str) -> Option<String> {
        self.entries().get(name).map(|(s, _)| s.clone())
    }

    fn path(&self, name: &str) -> String {
        format!("memory:{name}")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
