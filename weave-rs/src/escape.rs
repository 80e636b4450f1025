//! Output escaping.
//!
//! Every auto-escaped `print` goes through [`escape`], which dispatches on the
//! configured [`OutputMode`].  Replacement is a single pass with an
//! Aho-Corasick automaton built once per mode.

use std::sync::OnceLock;

use aho_corasick::AhoCorasick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Html,
    Xhtml,
    Xml,
    Plain,
}

impl OutputMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "html" => Some(OutputMode::Html),
            "xhtml" => Some(OutputMode::Xhtml),
            "xml" => Some(OutputMode::Xml),
            "plain" | "text" | "none" => Some(OutputMode::Plain),
            _ => None,
        }
    }
}

const SPECIALS: [&str; 5] = ["&", "<", ">", "\"", "'"];
const HTML_ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&#039;"];
const XML_ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&apos;"];

fn specials() -> &'static AhoCorasick {
    static AC: OnceLock<AhoCorasick> = OnceLock::new();
    AC.get_or_init(|| AhoCorasick::new(SPECIALS))
}

/// Escape `text` for `mode`.
pub fn escape(mode: OutputMode, text: &str) -> String {
    let entities = match mode {
        OutputMode::Html | OutputMode::Xhtml => &HTML_ENTITIES,
        OutputMode::Xml => &XML_ENTITIES,
        OutputMode::Plain => return text.to_owned(),
    };
    if !text.bytes().any(|b| matches!(b, b'&' | b'<' | b'>' | b'"' | b'\'')) {
        return text.to_owned();
    }
    specials().replace_all(text, entities)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
