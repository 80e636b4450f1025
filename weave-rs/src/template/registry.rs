//! Function registry.
//!
//! Maps a lowercased name to a callable plus its [`Flags`].  Two argument
//! conventions exist:
//!
//! * **native**: the callable sees a flat positional slice (named arguments
//!   are appended in call order) and returns `Result<Value, String>`.
//! * **engine**: the callable sees structured [`Args`] and a
//!   [`CallContext`] through which it can write output or render other
//!   templates.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

use super::value::Value;
use super::vm::CallContext;

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Per-function behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    /// Auto-escape the result when printed.
    pub escape: bool,
    /// Output may be frozen into an HTML-cache artifact.
    pub cacheable: bool,
    /// A bare call statement does not print its result.
    pub suppress_print: bool,
    /// Flat positional argument convention.
    pub native: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            escape: true,
            cacheable: true,
            suppress_print: false,
            native: false,
        }
    }
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result is already safe markup.
    pub fn raw(mut self) -> Self {
        self.escape = false;
        self
    }

    /// Re-run on every render, even from the HTML cache.
    pub fn volatile(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn silent(mut self) -> Self {
        self.suppress_print = true;
        self
    }
}

// ── Args ──────────────────────────────────────────────────────────────────────

/// Evaluated call arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl Args {
    pub fn positional(values: Vec<Value>) -> Self {
        Args {
            positional: values,
            named: Vec::new(),
        }
    }

    pub fn named(pairs: Vec<(String, Value)>) -> Self {
        Args {
            positional: Vec::new(),
            named: pairs,
        }
    }

    /// Named argument, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn at(&self, i: usize) -> Option<&Value> {
        self.positional.get(i)
    }

    /// Positional values followed by named values.
    pub fn flatten(self) -> Vec<Value> {
        let mut out = self.positional;
        out.extend(self.named.into_iter().map(|(_, v)| v));
        out
    }
}

// ── Function ──────────────────────────────────────────────────────────────────

/// A callable registered under a template-visible name.
pub trait Function: Send + Sync {
    fn invoke(&self, args: Args, cx: &mut CallContext<'_, '_>) -> Result<Value, Error>;
}

/// Adapter for the native convention.
pub struct Native<F>(pub F);

impl<F> Function for Native<F>
where
    F: Fn(&[Value]) -> Result<Value, String> + Send + Sync,
{
    fn invoke(&self, args: Args, _cx: &mut CallContext<'_, '_>) -> Result<Value, Error> {
        (self.0)(&args.flatten()).map_err(Error::runtime)
    }
}

/// Adapter for the engine convention.
pub struct Contextual<F>(pub F);

impl<F> Function for Contextual<F>
where
    F: Fn(&Args, &mut CallContext<'_, '_>) -> Result<Value, Error> + Send + Sync,
{
    fn invoke(&self, args: Args, cx: &mut CallContext<'_, '_>) -> Result<Value, Error> {
        (self.0)(&args, cx)
    }
}

#[derive(Clone)]
pub struct Entry {
    pub target: Arc<dyn Function>,
    pub flags: Flags,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry").field("flags", &self.flags).finish()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the structural built-ins.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        super::builtins::register_all(&mut reg);
        reg
    }

    /// Register a native-convention function.  Replaces any earlier entry.
    pub fn register_native<F>(&mut self, name: &str, flags: Flags, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let flags = Flags {
            native: true,
            ..flags
        };
        self.insert(name, Arc::new(Native(f)), flags);
    }

    /// Register an engine-convention function.  Replaces any earlier entry.
    pub fn register<F>(&mut self, name: &str, flags: Flags, f: F)
    where
        F: Fn(&Args, &mut CallContext<'_, '_>) -> Result<Value, Error> + Send + Sync + 'static,
    {
        let flags = Flags {
            native: false,
            ..flags
        };
        self.insert(name, Arc::new(Contextual(f)), flags);
    }

    pub fn insert(&mut self, name: &str, target: Arc<dyn Function>, flags: Flags) {
        self.entries
            .insert(name.to_ascii_lowercase(), Entry { target, flags });
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// `true` for names whose output must stay live in cached renders.
    pub fn is_volatile(&self, name: &str) -> bool {
        self.get(name).is_some_and(|e| !e.flags.cacheable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
