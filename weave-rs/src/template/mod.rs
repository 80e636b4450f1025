//! Template language: lexer, compiler, bytecode and VM.
//!
//! Pipeline: `lexer` → `parser`/`expr` → [`CompiledTemplate`] → `vm`,
//! optionally observed by a `weave` that records an HTML-cache artifact.

pub mod builtins;
pub mod bytecode;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod scope;
pub mod value;
pub mod vm;
pub mod weave;

pub use bytecode::{CompiledTemplate, Instr, Program};
pub use lexer::Delimiters;
pub use parser::compile;
pub use registry::{Args, Flags, Registry};
pub use scope::Scope;
pub use value::{Array, Key, Object, Value};
pub use vm::{CallContext, Env, Loader, Vm};
