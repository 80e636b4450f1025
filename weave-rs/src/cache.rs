//! Compiled-template and HTML-cache persistence.
//!
//! Both cache kinds store the same [`Artifact`] shape; only the
//! [`Kind`] tag and what `template.main` contains differ.  [`FileCache`]
//! writes one gzip-compressed JSON file per entry and replaces files
//! atomically, so concurrent readers see either the old or the new artifact.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::Error;
use crate::reference::{sanitize_cache_id, TemplateRef};
use crate::template::CompiledTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Compiled, inheritance-merged bytecode.
    Template,
    /// Rendered output with live volatile fragments.
    Html,
}

impl Kind {
    fn suffix(self) -> &'static str {
        match self {
            Kind::Template => "tpl",
            Kind::Html => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub storage: String,
    pub name: String,
    /// Sanitized; empty when the caller gave none.
    pub cache_id: String,
}

impl CacheKey {
    pub fn new(reference: &TemplateRef, cache_id: Option<&str>) -> Self {
        CacheKey {
            storage: reference.storage.clone(),
            name: reference.name.clone(),
            cache_id: cache_id.map(sanitize_cache_id).unwrap_or_default(),
        }
    }

    /// Flat file name for this key.  `/` in names becomes `%`, which the
    /// name charset never contains.
    fn file_name(&self, kind: Kind) -> String {
        format!(
            "{}^{}^{}.{}.json.gz",
            self.storage,
            self.name.replace('/', "%"),
            self.cache_id,
            kind.suffix()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: Kind,
    /// When the inputs of this artifact were read.
    pub stamp: SystemTime,
    pub template: CompiledTemplate,
}

pub trait CacheStore: Send + Sync {
    fn stamp(&self, key: &CacheKey, kind: Kind) -> Option<SystemTime>;
    fn load(&self, key: &CacheKey, kind: Kind) -> Result<Option<Artifact>, Error>;
    fn store(&self, key: &CacheKey, kind: Kind, artifact: &Artifact) -> Result<(), Error>;
    fn erase(&self, key: &CacheKey, kind: Kind) -> Result<(), Error>;
    fn clear(&self) -> Result<(), Error>;
}

// ── FileCache ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Cache rooted at `dir`, created if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::usage(format!("cache directory {}: {e}", dir.display())))?;
        Ok(FileCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, key: &CacheKey, kind: Kind) -> PathBuf {
        self.dir.join(key.file_name(kind))
    }
}

impl CacheStore for FileCache {
    /// The entry file's mtime, which [`FileCache::store`] sets to
    /// [`Artifact::stamp`].
    fn stamp(&self, key: &CacheKey, kind: Kind) -> Option<SystemTime> {
        fs::metadata(self.file(key, kind))
            .and_then(|m| m.modified())
            .ok()
    }

    fn load(&self, key: &CacheKey, kind: Kind) -> Result<Option<Artifact>, Error> {
        let file = match File::open(self.file(key, kind)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let artifact: Artifact = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;
        if artifact.kind != kind {
            return Err(Error::usage(format!(
                "cache entry {} holds a {:?} artifact",
                key.file_name(kind),
                artifact.kind
            )));
        }
        Ok(Some(artifact))
    }

    fn store(&self, key: &CacheKey, kind: Kind, artifact: &Artifact) -> Result<(), Error> {
        let tmp = NamedTempFile::new_in(&self.dir)?;
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        serde_json::to_writer(&mut encoder, artifact)?;
        let tmp = encoder.finish()?;
        tmp.as_file().set_modified(artifact.stamp)?;
        tmp.persist(self.file(key, kind))
            .map_err(|e| Error::from(e.error))?;
        Ok(())
    }

    fn erase(&self, key: &CacheKey, kind: Kind) -> Result<(), Error> {
        match fs::remove_file(self.file(key, kind)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every entry this cache wrote; other files are left alone.
    fn clear(&self) -> Result<(), Error> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains('^') && n.ends_with(".json.gz"));
            if ours {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

// ── MemoryCache ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(CacheKey, Kind), Artifact>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(CacheKey, Kind), Artifact>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn stamp(&self, key: &CacheKey, kind: Kind) -> Option<SystemTime> {
        self.entries().get(&(key.clone(), kind)).map(|a| a.stamp)
    }

    fn load(&self, key: &CacheKey, kind: Kind) -> Result<Option<Artifact>, Error> {
        Ok(self.entries().get(&(key.clone(), kind)).cloned())
    }

    fn store(&self, key: &CacheKey, kind: Kind, artifact: &Artifact) -> Result<(), Error> {
        self.entries().insert((key.clone(), kind), artifact.clone());
        Ok(())
    }

    fn erase(&self, key: &CacheKey, kind: Kind) -> Result<(), Error> {
        self.entries().remove(&(key.clone(), kind));
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        self.entries().clear();
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
