//! Template lexer.
//!
//! Outside a command the lexer hands back everything up to the next start
//! delimiter as one [`Tok::Text`].  Inside a command (between the start and
//! end delimiters) it produces expression and keyword tokens.  Tokens are
//! produced one at a time on demand.

use std::sync::Arc;

use crate::error::Error;

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    ElseIf,
    Else,
    End,
    While,
    Loop,
    Foreach,
    In,
    Nocache,
    Section,
    Insert,
    Inherit,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        Some(match word {
            "if" => Keyword::If,
            "elseif" => Keyword::ElseIf,
            "else" => Keyword::Else,
            "end" => Keyword::End,
            "while" => Keyword::While,
            "loop" => Keyword::Loop,
            "foreach" => Keyword::Foreach,
            "in" => Keyword::In,
            "nocache" => Keyword::Nocache,
            "section" => Keyword::Section,
            "insert" => Keyword::Insert,
            "inherit" => Keyword::Inherit,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::If => "if",
            Keyword::ElseIf => "elseif",
            Keyword::Else => "else",
            Keyword::End => "end",
            Keyword::While => "while",
            Keyword::Loop => "loop",
            Keyword::Foreach => "foreach",
            Keyword::In => "in",
            Keyword::Nocache => "nocache",
            Keyword::Section => "section",
            Keyword::Insert => "insert",
            Keyword::Inherit => "inherit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Literal markup outside delimiters.
    Text(String),
    Ident(String),
    /// `$name`, without the sigil.
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Kw(Keyword),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Dot,
    DotDot,
    Arrow,
    Pipe,
    Colon,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Assign,
    FatArrow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    NotIn,

    /// End delimiter of a command.
    Close,
    Eof,
}

impl Tok {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Text(_) => "literal text".into(),
            Tok::Ident(s) => format!("`{s}`"),
            Tok::Var(s) => format!("`${s}`"),
            Tok::Str(s) => format!("string {s:?}"),
            Tok::Int(n) => format!("number {n}"),
            Tok::Float(x) => format!("number {x}"),
            Tok::Bool(b) => format!("`{b}`"),
            Tok::Null => "`null`".into(),
            Tok::Kw(k) => format!("keyword `{}`", k.as_str()),
            Tok::Close => "end of tag".into(),
            Tok::Eof => "end of input".into(),
            other => format!("{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub file: Arc<str>,
    pub line: usize,
}

/// Start and end markers of a template command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    pub open: String,
    pub close: String,
}

impl Delimiters {
    /// Both markers must be non-empty.
    pub fn check(&self) -> Result<(), Error> {
        if self.open.is_empty() || self.close.is_empty() {
            return Err(Error::usage(format!(
                "empty template delimiter in `{}` `{}`",
                self.open, self.close
            )));
        }
        Ok(())
    }
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            open: "{".into(),
            close: "}".into(),
        }
    }
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    in_command: bool,
    file: Arc<str>,
    open: &'a str,
    close: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(file: &str, src: &'a str, delims: &'a Delimiters) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            in_command: false,
            file: Arc::from(file),
            open: &delims.open,
            close: &delims.close,
        }
    }

    pub fn file(&self) -> &Arc<str> {
        &self.file
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos + 1).copied()
    }

    /// Advance over `n` bytes, counting newlines.
    fn bump(&mut self, n: usize) {
        let end = (self.pos + n).min(self.src.len());
        self.line += self.src[self.pos..end].matches('\n').count();
        self.pos = end;
    }

    fn token(&self, tok: Tok, line: usize) -> Token {
        Token {
            tok,
            file: Arc::clone(&self.file),
            line,
        }
    }

    fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::parse(&*self.file, line, message)
    }

    /// A short excerpt of the source at the current position.
    fn excerpt(&self) -> String {
        let rest = self.rest();
        let snippet: String = rest.chars().take(20).take_while(|&c| c != '\n').collect();
        if snippet.len() < rest.len() {
            format!("{snippet}…")
        } else {
            snippet
        }
    }

    /// Produce the next token.
    pub fn next_token(&mut self) -> Result<Token, Error> {
        if !self.in_command {
            if self.pos >= self.src.len() {
                return Ok(self.token(Tok::Eof, self.line));
            }
            match self.rest().find(self.open) {
                Some(0) => {
                    self.pos += self.open.len();
                    self.in_command = true;
                }
                found => {
                    let line = self.line;
                    let len = found.unwrap_or(self.rest().len());
                    let text = self.rest()[..len].to_owned();
                    self.bump(len);
                    return Ok(self.token(Tok::Text(text), line));
                }
            }
        }
        self.command_token()
    }

    /// Skip whitespace and comments inside a command.
    fn skip_trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => self.bump(1),
                Some(b'/') if self.peek2() == Some(b'*') => {
                    let line = self.line;
                    match self.rest()[2..].find("*/") {
                        Some(i) => self.bump(i + 4),
                        None => {
                            let near = self.excerpt();
                            return Err(self.error(line, format!("unterminated comment near `{near}`")));
                        }
                    }
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    // Runs to end of line or the end delimiter, whichever is first.
                    let rest = self.rest();
                    let nl = rest.find('\n').unwrap_or(rest.len());
                    let close = rest.find(self.close).unwrap_or(rest.len());
                    self.bump(nl.min(close));
                }
                _ => return Ok(()),
            }
        }
    }

    fn command_token(&mut self) -> Result<Token, Error> {
        self.skip_trivia()?;
        let line = self.line;
        if self.pos >= self.src.len() {
            return Err(self.error(line, format!("unterminated tag, expected `{}`", self.close)));
        }
        if self.rest().starts_with(self.close) {
            self.pos += self.close.len();
            self.in_command = false;
            return Ok(self.token(Tok::Close, line));
        }

        let ch = self.peek().unwrap_or(0);
        let tok = match ch {
            b'$' => {
                self.pos += 1;
                let name = self.read_word();
                if name.is_empty() {
                    return Err(self.error(line, format!("expected variable name near `{}`", self.excerpt())));
                }
                Tok::Var(name)
            }
            b'0'..=b'9' => self.read_number(),
            b'"' | b'\'' => self.read_string(ch)?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let word = self.read_word();
                let lower = word.to_ascii_lowercase();
                match lower.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    "null" => Tok::Null,
                    _ => match Keyword::lookup(&lower) {
                        Some(kw) => Tok::Kw(kw),
                        None => Tok::Ident(word),
                    },
                }
            }
            _ => self.read_operator(line)?,
        };
        Ok(self.token(tok, line))
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        let rest = self.src.as_bytes();
        let mut end = start;
        while end < rest.len() && (rest[end].is_ascii_alphanumeric() || rest[end] == b'_') {
            // Digits are fine anywhere but first; callers check the first byte.
            end += 1;
        }
        self.pos = end;
        self.src[start..end].to_owned()
    }

    fn read_number(&mut self) -> Tok {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek2(), Some(b'0'..=b'9')) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            Tok::Float(text.parse().unwrap_or(0.0))
        } else {
            match text.parse() {
                Ok(n) => Tok::Int(n),
                Err(_) => Tok::Float(text.parse().unwrap_or(f64::MAX)),
            }
        }
    }

    fn read_string(&mut self, quote: u8) -> Result<Tok, Error> {
        let line = self.line;
        let near = self.excerpt();
        self.bump(1);
        let mut s = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, other)) => s.push(other),
                    None => break,
                },
                c if c as u32 == u32::from(quote) => {
                    self.bump(i + 1);
                    return Ok(Tok::Str(s));
                }
                c => s.push(c),
            }
        }
        Err(self.error(line, format!("unterminated string near `{near}`")))
    }

    fn read_operator(&mut self, line: usize) -> Result<Tok, Error> {
        let rest = self.rest();
        // `!in` needs a word boundary so `!input` stays `!` + `input`.
        if rest.starts_with("!in")
            && !rest[3..]
                .bytes()
                .next()
                .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 3;
            return Ok(Tok::NotIn);
        }
        let multi = match rest.get(..2) {
            Some("==") => Some(Tok::Eq),
            Some("!=") => Some(Tok::Ne),
            Some("<=") => Some(Tok::Le),
            Some(">=") => Some(Tok::Ge),
            Some("||") => Some(Tok::Or),
            Some("&&") => Some(Tok::And),
            Some("->") => Some(Tok::Arrow),
            Some("..") => Some(Tok::DotDot),
            Some("=>") => Some(Tok::FatArrow),
            _ => None,
        };
        if let Some(tok) = multi {
            self.pos += 2;
            return Ok(tok);
        }
        let tok = match self.peek() {
            Some(b'+') => Tok::Plus,
            Some(b'-') => Tok::Minus,
            Some(b'*') => Tok::Star,
            Some(b'/') => Tok::Slash,
            Some(b'%') => Tok::Percent,
            Some(b'!') => Tok::Bang,
            Some(b'.') => Tok::Dot,
            Some(b'|') => Tok::Pipe,
            Some(b':') => Tok::Colon,
            Some(b',') => Tok::Comma,
            Some(b'(') => Tok::LParen,
            Some(b')') => Tok::RParen,
            Some(b'[') => Tok::LBracket,
            Some(b']') => Tok::RBracket,
            Some(b'=') => Tok::Assign,
            Some(b'<') => Tok::Lt,
            Some(b'>') => Tok::Gt,
            _ => {
                return Err(self.error(line, format!("unexpected input near `{}`", self.excerpt())));
            }
        };
        self.pos += 1;
        Ok(tok)
    }
}

/// Lex a whole source string, for tests and diagnostics.
pub fn tokenize(file: &str, src: &str, delims: &Delimiters) -> Result<Vec<Token>, Error> {
    delims.check()?;
    let mut lexer = Lexer::new(file, src, delims);
    let mut out = Vec::new();
    loop {
        let t = lexer.next_token()?;
        let done = t.tok == Tok::Eof;
        out.push(t);
        if done {
            return Ok(out);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize("t", src, &Delimiters::default())
            .expect("lex failed")
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn text_and_command() {
        assert_eq!(
            toks("Hi {$name}!"),
            vec![
                Tok::Text("Hi ".into()),
                Tok::Var("name".into()),
                Tok::Close,
                Tok::Text("!".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_folds() {
        assert_eq!(
            toks("{if true and $x OR null}"),
            vec![
                Tok::Kw(Keyword::If),
                Tok::Bool(true),
                Tok::And,
                Tok::Var("x".into()),
                Tok::Or,
                Tok::Null,
                Tok::Close,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            toks("{1 2.5 1..2}"),
            vec![
                Tok::Int(1),
                Tok::Float(2.5),
                Tok::Int(1),
                Tok::DotDot,
                Tok::Int(2),
                Tok::Close,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(
            toks(r#"{"a\nb" 'it\'s'}"#),
            vec![
                Tok::Str("a\nb".into()),
                Tok::Str("it's".into()),
                Tok::Close,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn multi_char_operators() {
        assert_eq!(
            toks("{== != <= >= || && -> => !in !x}"),
            vec![
                Tok::Eq,
                Tok::Ne,
                Tok::Le,
                Tok::Ge,
                Tok::Or,
                Tok::And,
                Tok::Arrow,
                Tok::FatArrow,
                Tok::NotIn,
                Tok::Bang,
                Tok::Ident("x".into()),
                Tok::Close,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            toks("{ /* note */ $a // trailing}x"),
            vec![
                Tok::Var("a".into()),
                Tok::Close,
                Tok::Text("x".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn line_numbers() {
        let tokens = tokenize("t", "a\nb\n{$x\n}", &Delimiters::default()).unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 3);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn custom_delimiters() {
        let d = Delimiters {
            open: "{{".into(),
            close: "}}".into(),
        };
        let got: Vec<Tok> = tokenize("t", "a { b {{$x}} c", &d)
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect();
        assert_eq!(
            got,
            vec![
                Tok::Text("a { b ".into()),
                Tok::Var("x".into()),
                Tok::Close,
                Tok::Text(" c".into()),
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_is_error() {
        let err = tokenize("page", "\n{'oops}", &Delimiters::default()).unwrap_err();
        assert_eq!(err, Error::parse("page", 2, "unterminated string near `'oops}`"));
    }

    #[test]
    fn unterminated_comment_names_its_start() {
        let err = tokenize("page", "a{ /* never closed }", &Delimiters::default()).unwrap_err();
        assert_eq!(
            err,
            Error::parse("page", 1, "unterminated comment near `/* never closed }`")
        );
    }

    #[test]
    fn empty_delimiters_are_rejected() {
        let delims = Delimiters {
            open: String::new(),
            close: "}".into(),
        };
        assert!(matches!(tokenize("t", "abc", &delims), Err(Error::Usage(_))));
    }

    #[test]
    fn garbage_is_error_with_excerpt() {
        let err = tokenize("page", "{ # }", &Delimiters::default()).unwrap_err();
        let Error::Parse { line, message, .. } = err else {
            panic!("expected parse error")
        };
        assert_eq!(line, 1);
        assert!(message.contains("# }"), "{message}");
    }
}
