//! Error taxonomy and the error policy applied at render boundaries.
//!
//! | Variant | Raised by | Surfaces |
//! |---------|-----------|----------|
//! | [`Error::Parse`]    | lexer, compiler | aborts the compile, goes to the policy |
//! | [`Error::Runtime`]  | VM, functions   | caught at the call boundary when inside a call |
//! | [`Error::Usage`]    | engine, storage, cache | aborts the render, goes to the policy |
//! | [`Error::Internal`] | VM consistency checks | aborts the render |

use std::fmt;

/// Source position attached to runtime errors raised from a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Everything that can go wrong while compiling or rendering a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Parse {
        file: String,
        line: usize,
        message: String,
    },
    Runtime {
        message: String,
        location: Option<Location>,
    },
    Usage(String),
    Internal(String),
}

impl Error {
    pub fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            location: None,
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    /// Attach a call-site location unless one is already present.
    pub fn at(self, file: &str, line: usize) -> Self {
        match self {
            Error::Runtime { message, location: None } => Error::Runtime {
                message,
                location: Some(Location {
                    file: file.to_owned(),
                    line,
                }),
            },
            other => other,
        }
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Parse { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse { file, line, message } => {
                write!(f, "parse error in {file} line {line}: {message}")
            }
            Error::Runtime {
                message,
                location: Some(loc),
            } => write!(f, "runtime error at {loc}: {message}"),
            Error::Runtime {
                message,
                location: None,
            } => write!(f, "runtime error: {message}"),
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Usage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Usage(format!("cache artifact encoding: {e}"))
    }
}

// ── ErrorPolicy ───────────────────────────────────────────────────────────────

/// What to do with an error that reaches a catch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Write an inline `[weave error: …]` marker into the output.
    #[default]
    Print,
    /// Propagate the error to the caller.
    Throw,
    /// Log and terminate the process.
    Abort,
    /// Drop the error silently.
    Ignore,
}

impl ErrorPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "print" => Some(ErrorPolicy::Print),
            "throw" | "rethrow" => Some(ErrorPolicy::Throw),
            "abort" | "exit" => Some(ErrorPolicy::Abort),
            "ignore" | "silent" => Some(ErrorPolicy::Ignore),
            _ => None,
        }
    }

    /// Apply the policy.
    ///
    /// Returns `Ok(Some(marker))` when text should be written in place of the
    /// failed construct, `Ok(None)` when nothing should be written, and
    /// `Err` when the error must keep unwinding.
    pub fn handle(self, err: Error) -> Result<Option<String>, Error> {
        match self {
            ErrorPolicy::Print => Ok(Some(marker(&err))),
            ErrorPolicy::Throw => Err(err),
            ErrorPolicy::Ignore => {
                tracing::debug!(error = %err, "ignoring template error");
                Ok(None)
            }
            ErrorPolicy::Abort => {
                tracing::error!(error = %err, "aborting on template error");
                eprintln!("weave: {err}");
                std::process::exit(1);
            }
        }
    }
}

/// The inline diagnostic written by [`ErrorPolicy::Print`].
pub fn marker(err: &Error) -> String {
    format!("[weave error: {err}]")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse() {
        let e = Error::parse("page.tpl", 3, "missing {end}");
        assert_eq!(e.to_string(), "parse error in page.tpl line 3: missing {end}");
    }

    #[test]
    fn at_adds_location_once() {
        let e = Error::runtime("boom").at("a", 1).at("b", 2);
        assert_eq!(e.to_string(), "runtime error at a:1: boom");
    }

    #[test]
    fn at_leaves_other_kinds_alone() {
        let e = Error::usage("nope").at("a", 1);
        assert_eq!(e, Error::Usage("nope".into()));
    }

    #[test]
    fn policy_names() {
        assert_eq!(ErrorPolicy::from_name("Print"), Some(ErrorPolicy::Print));
        assert_eq!(ErrorPolicy::from_name("rethrow"), Some(ErrorPolicy::Throw));
        assert_eq!(ErrorPolicy::from_name("ignore"), Some(ErrorPolicy::Ignore));
        assert_eq!(ErrorPolicy::from_name("explode"), None);
    }

    #[test]
    fn policy_handle() {
        let e = Error::runtime("bad");
        assert_eq!(
            ErrorPolicy::Print.handle(e.clone()),
            Ok(Some("[weave error: runtime error: bad]".into()))
        );
        assert_eq!(ErrorPolicy::Ignore.handle(e.clone()), Ok(None));
        assert_eq!(ErrorPolicy::Throw.handle(e.clone()), Err(e));
    }
}
