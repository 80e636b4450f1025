//! The engine façade.
//!
//! [`Engine`] ties storages, the registry and the cache together:
//!
//! 1. resolve the reference to a storage and name;
//! 2. serve a fresh HTML-cache artifact if there is one;
//! 3. otherwise fetch the compiled template (compiled cache, or compile and
//!    merge its inheritance chain), run it with a weave attached, and store
//!    the recording.
//!
//! Errors that escape a render go through the configured
//! [`ErrorPolicy`](crate::error::ErrorPolicy).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use crate::cache::{Artifact, CacheKey, CacheStore, FileCache, Kind};
use crate::config::Config;
use crate::error::Error;
use crate::reference::TemplateRef;
use crate::storage::{DirStorage, Storage};
use crate::template::{compile, CompiledTemplate, Env, Loader, Registry, Scope, Vm};

/// Longest `inherit` chain before compilation fails.
pub const MAX_INHERIT_DEPTH: usize = 16;

/// Name the directory storage is registered under by [`Engine::from_config`].
pub const FILE_STORAGE: &str = "file";

pub struct Engine {
    config: Config,
    registry: Registry,
    storages: HashMap<String, Arc<dyn Storage>>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl Engine {
    /// Engine with the built-in functions and no storages or cache.
    pub fn new(config: Config) -> Self {
        Engine {
            config,
            registry: Registry::with_builtins(),
            storages: HashMap::new(),
            cache: None,
        }
    }

    /// Engine with a [`DirStorage`] on `template_dir` and a [`FileCache`] on
    /// `cache_dir`.
    pub fn from_config(config: Config) -> Result<Self, Error> {
        let cache = FileCache::new(&config.cache_dir)?;
        let dir = DirStorage::new(&config.template_dir, &config.extension);
        let mut engine = Engine::new(config);
        engine.add_storage(FILE_STORAGE, Arc::new(dir));
        engine.set_cache(Arc::new(cache));
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn add_storage(&mut self, name: &str, storage: Arc<dyn Storage>) {
        self.storages.insert(name.to_owned(), storage);
    }

    pub fn set_cache(&mut self, cache: Arc<dyn CacheStore>) {
        self.cache = Some(cache);
    }

    pub fn disable_cache(&mut self) {
        self.cache = None;
    }

    /// Compile a source string.  `inherit` is recorded but not resolved.
    pub fn compile_str(&self, name: &str, source: &str) -> Result<CompiledTemplate, Error> {
        compile(name, source, &self.config.delimiters, &self.registry)
    }

    /// Compile and run a source string without caching.
    pub fn render_str(&self, name: &str, source: &str, scope: &mut Scope) -> Result<String, Error> {
        let mut output = String::new();
        let result = self.compile_str(name, source).and_then(|t| {
            let mut vm = Vm::new(self.env(), scope, Arc::new(t));
            let result = vm.run();
            output.push_str(&vm.finish().0);
            result
        });
        self.settle(name, output, result)
    }

    pub fn render(&self, reference: &str, scope: &mut Scope) -> Result<String, Error> {
        self.render_with_id(reference, None, scope)
    }

    /// Render `reference`; `cache_id` selects one of several HTML-cache
    /// entries for the same template.
    pub fn render_with_id(
        &self,
        reference: &str,
        cache_id: Option<&str>,
        scope: &mut Scope,
    ) -> Result<String, Error> {
        let mut output = String::new();
        let result = self.render_into(reference, cache_id, scope, &mut output);
        self.settle(reference, output, result)
    }

    /// Drop both cache entries for `reference` / `cache_id`.
    pub fn erase(&self, reference: &str, cache_id: Option<&str>) -> Result<(), Error> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let tref = self.resolve(reference)?;
        cache.erase(&CacheKey::new(&tref, cache_id), Kind::Html)?;
        cache.erase(&CacheKey::new(&tref, None), Kind::Template)?;
        Ok(())
    }

    pub fn clear_cache(&self) -> Result<(), Error> {
        match &self.cache {
            Some(cache) => cache.clear(),
            None => Ok(()),
        }
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    fn env(&self) -> Env<'_> {
        Env {
            registry: &self.registry,
            loader: self,
            mode: self.config.output,
            policy: self.config.on_error,
        }
    }

    /// Apply the error policy to a finished render.
    fn settle(&self, what: &str, mut output: String, result: Result<(), Error>) -> Result<String, Error> {
        match result {
            Ok(()) => Ok(output),
            Err(err) => {
                tracing::debug!(template = what, error = %err, "render failed");
                if let Some(marker) = self.config.on_error.handle(err)? {
                    output.push_str(&marker);
                }
                Ok(output)
            }
        }
    }

    fn render_into(
        &self,
        reference: &str,
        cache_id: Option<&str>,
        scope: &mut Scope,
        output: &mut String,
    ) -> Result<(), Error> {
        let started = SystemTime::now();
        let tref = self.resolve(reference)?;
        let source_stamp = self.source_stamp(&tref)?;
        let key = CacheKey::new(&tref, cache_id);
        let html = self.config.html_cache && self.cache.is_some();

        if html {
            if let Some(artifact) = self.lookup(&key, Kind::Html, source_stamp) {
                tracing::debug!(template = %tref, cache_id = %key.cache_id, "html cache hit");
                let mut vm = Vm::new(self.env(), scope, Arc::new(artifact));
                let result = vm.run();
                output.push_str(&vm.finish().0);
                return result;
            }
        }

        let template = self.compiled(&tref, 0)?;
        let mut vm = Vm::new(self.env(), scope, template);
        if html {
            vm = vm.with_weave();
        }
        let result = vm.run();
        let (out, artifact) = vm.finish();
        output.push_str(&out);
        result?;

        if let Some(artifact) = artifact {
            self.persist(&key, Kind::Html, started, artifact);
        }
        Ok(())
    }

    // ── Compilation ───────────────────────────────────────────────────────────

    fn resolve(&self, reference: &str) -> Result<TemplateRef, Error> {
        TemplateRef::parse(reference, &self.config.default_storage, &self.config.extension)
    }

    fn storage(&self, name: &str) -> Result<&dyn Storage, Error> {
        self.storages
            .get(name)
            .map(|s| s.as_ref())
            .ok_or_else(|| Error::usage(format!("unknown storage `{name}`")))
    }

    fn source_stamp(&self, tref: &TemplateRef) -> Result<SystemTime, Error> {
        let storage = self.storage(&tref.storage)?;
        storage.stamp(&tref.name).ok_or_else(|| {
            Error::usage(format!(
                "template `{tref}` not found ({})",
                storage.path(&tref.name)
            ))
        })
    }

    /// Compiled, inheritance-merged template for `tref`.
    fn compiled(&self, tref: &TemplateRef, depth: usize) -> Result<Arc<CompiledTemplate>, Error> {
        let started = SystemTime::now();
        let source_stamp = self.source_stamp(tref)?;
        let key = CacheKey::new(tref, None);
        if let Some(template) = self.lookup(&key, Kind::Template, source_stamp) {
            tracing::debug!(template = %tref, "compiled cache hit");
            return Ok(Arc::new(template));
        }

        let storage = self.storage(&tref.storage)?;
        let source = storage
            .load(&tref.name)
            .ok_or_else(|| Error::usage(format!("cannot read template `{tref}`")))?;
        let mut template = compile(
            &tref.to_string(),
            &source,
            &self.config.delimiters,
            &self.registry,
        )?;

        if let Some(parent) = template.inherit.take() {
            if depth + 1 >= MAX_INHERIT_DEPTH {
                return Err(Error::usage(format!(
                    "inheritance deeper than {MAX_INHERIT_DEPTH} at `{tref}`"
                )));
            }
            let parent_ref =
                TemplateRef::parse(&parent, &tref.storage, &self.config.extension)?;
            let base = self.compiled(&parent_ref, depth + 1)?;
            template = base.merge(&template, &parent_ref.to_string());
        }

        let template = Arc::new(template);
        self.persist(&key, Kind::Template, started, CompiledTemplate::clone(&template));
        Ok(template)
    }

    // ── Cache ─────────────────────────────────────────────────────────────────

    /// A cached template, if present and fresh.
    fn lookup(&self, key: &CacheKey, kind: Kind, source_stamp: SystemTime) -> Option<CompiledTemplate> {
        let cache = self.cache.as_ref()?;
        if self.config.debug {
            return None;
        }
        let stamp = cache.stamp(key, kind)?;
        if stamp < source_stamp {
            tracing::debug!(name = %key.name, ?kind, "cache entry older than source");
            return None;
        }
        if let Some(max_age) = self.config.max_age {
            let expired = SystemTime::now()
                .duration_since(stamp)
                .is_ok_and(|age| age > max_age);
            if expired {
                tracing::debug!(name = %key.name, ?kind, "cache entry expired");
                return None;
            }
        }

        let artifact = match cache.load(key, kind) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(name = %key.name, ?kind, error = %e, "unreadable cache entry");
                return None;
            }
        };
        if let Some(stale) = artifact
            .template
            .referenced
            .iter()
            .find(|r| !self.reference_fresh(r, stamp))
        {
            tracing::debug!(name = %key.name, ?kind, referenced = %stale, "referenced template changed");
            return None;
        }
        Some(artifact.template)
    }

    fn reference_fresh(&self, reference: &str, stamp: SystemTime) -> bool {
        let Ok(tref) = self.resolve(reference) else {
            return false;
        };
        self.source_stamp(&tref).is_ok_and(|t| t <= stamp)
    }

    /// Store an artifact; failures are logged, never fatal.
    fn persist(&self, key: &CacheKey, kind: Kind, stamp: SystemTime, template: CompiledTemplate) {
        let Some(cache) = &self.cache else {
            return;
        };
        let artifact = Artifact {
            kind,
            stamp,
            template,
        };
        match cache.store(key, kind, &artifact) {
            Ok(()) => tracing::debug!(name = %key.name, cache_id = %key.cache_id, ?kind, "stored"),
            Err(e) => tracing::warn!(name = %key.name, ?kind, error = %e, "cache store failed"),
        }
    }
}

impl Loader for Engine {
    fn load(&self, reference: &str) -> Result<(String, Arc<CompiledTemplate>), Error> {
        let tref = self.resolve(reference)?;
        let template = self.compiled(&tref, 0)?;
        Ok((tref.to_string(), template))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
