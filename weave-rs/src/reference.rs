//! Template references.
//!
//! A reference is `storage:name` or just `name` (the configured default
//! storage).  Names are relative paths over a restricted charset; a trailing
//! template extension is dropped so `page` and `page.tpl` are the same
//! template.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;

const REFERENCE: &str = r"^(?:([A-Za-z][A-Za-z0-9_]*):)?([A-Za-z0-9_][A-Za-z0-9_./-]*)$";

fn reference_re() -> Result<&'static Regex, Error> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(REFERENCE))
        .as_ref()
        .map_err(|e| Error::Internal(format!("reference pattern: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateRef {
    pub storage: String,
    pub name: String,
}

impl TemplateRef {
    pub fn parse(reference: &str, default_storage: &str, extension: &str) -> Result<Self, Error> {
        let reference = reference.trim();
        let caps = reference_re()?
            .captures(reference)
            .ok_or_else(|| Error::usage(format!("illegal template name `{reference}`")))?;
        let storage = caps
            .get(1)
            .map_or(default_storage, |m| m.as_str())
            .to_owned();
        let mut name = caps.get(2).map_or("", |m| m.as_str());
        if name.contains("..") || name.ends_with('/') {
            return Err(Error::usage(format!("illegal template name `{reference}`")));
        }
        if !extension.is_empty() {
            if let Some(stem) = name
                .strip_suffix(extension)
                .and_then(|s| s.strip_suffix('.'))
                .filter(|s| !s.is_empty())
            {
                name = stem;
            }
        }
        Ok(TemplateRef {
            storage,
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.storage, self.name)
    }
}

/// Restrict a cache id to `[A-Za-z0-9_-]`.
pub fn sanitize_cache_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<TemplateRef, Error> {
        TemplateRef::parse(s, "file", "tpl")
    }

    #[test]
    fn default_storage() {
        let r = parse("pages/home").unwrap();
        assert_eq!(r.storage, "file");
        assert_eq!(r.name, "pages/home");
        assert_eq!(r.to_string(), "file:pages/home");
    }

    #[test]
    fn explicit_storage_and_extension() {
        let r = parse("mem:layout.tpl").unwrap();
        assert_eq!(r, TemplateRef { storage: "mem".into(), name: "layout".into() });
    }

    #[test]
    fn other_extensions_are_kept() {
        assert_eq!(parse("feed.xml").unwrap().name, "feed.xml");
    }

    #[test]
    fn rejects_traversal_and_junk() {
        assert!(parse("../etc/passwd").is_err());
        assert!(parse("a/../b").is_err());
        assert!(parse("/abs").is_err());
        assert!(parse("sp ace").is_err());
        assert!(parse("").is_err());
        assert!(parse("dir/").is_err());
    }

    #[test]
    fn cache_ids() {
        assert_eq!(sanitize_cache_id("user 42/en"), "user_42_en");
        assert_eq!(sanitize_cache_id("ok-id_1"), "ok-id_1");
    }
}
