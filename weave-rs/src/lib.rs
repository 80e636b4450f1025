//! weave: a bytecode template engine with fragment-level output caching.
//!
//! Templates are compiled to a flat instruction set and executed by a small
//! stack machine.  A render can be recorded into an HTML-cache artifact that
//! replays the static output verbatim while `nocache` blocks and volatile
//! functions keep running on every request.
//!
//! ```no_run
//! use weave::{Config, Engine, Scope};
//!
//! let engine = Engine::from_config(Config::default())?;
//! let mut scope = Scope::new();
//! scope.set("name", "world");
//! println!("{}", engine.render("hello", &mut scope)?);
//! # Ok::<(), weave::Error>(())
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod reference;
pub mod storage;
pub mod template;

pub use cache::{Artifact, CacheKey, CacheStore, FileCache, Kind, MemoryCache};
pub use config::{Config, ConfigError};
pub use engine::Engine;
pub use error::{Error, ErrorPolicy};
pub use escape::OutputMode;
pub use reference::TemplateRef;
pub use storage::{DirStorage, MemoryStorage, Storage};
pub use template::{
    Args, Array, CallContext, CompiledTemplate, Delimiters, Flags, Key, Object, Registry, Scope,
    Value,
};
