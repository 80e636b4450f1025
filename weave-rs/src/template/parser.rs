//! Statement compiler.
//!
//! A recursive-descent loop over the token stream: literal text becomes
//! `Echo`, each command is dispatched on its leading keyword, and anything
//! that is not a keyword or an assignment is a print.  Block bodies are
//! compiled into nested [`Program`]s.  Expressions are handled in
//! [`super::expr`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Error;

use super::bytecode::{CompiledTemplate, Instr, Program};
use super::expr::Node;
use super::lexer::{Delimiters, Keyword, Lexer, Tok, Token};
use super::registry::Registry;
use super::value::Value;

/// Compile `source` into a template.  `name` is used in error messages.
pub fn compile(
    name: &str,
    source: &str,
    delims: &Delimiters,
    registry: &Registry,
) -> Result<CompiledTemplate, Error> {
    delims.check()?;
    let mut parser = Parser::new(name, source, delims, registry);
    let (main, stop) = parser.parse_block(0)?;
    match stop {
        Stop::Eof => {}
        Stop::End(line) => return Err(parser.error(line, "`end` without an open block")),
        Stop::Else(line) => return Err(parser.error(line, "`else` without `if`")),
        Stop::ElseIf(_, line) => return Err(parser.error(line, "`elseif` without `if`")),
    }
    tracing::debug!(template = name, sections = parser.sections.len(), "compiled");
    Ok(CompiledTemplate {
        main,
        sections: parser.sections,
        inherit: parser.inherit,
        referenced: BTreeSet::new(),
    })
}

/// Why a block stopped.
enum Stop {
    Eof,
    End(usize),
    Else(usize),
    ElseIf(Program, usize),
}

pub(super) struct Parser<'a> {
    lexer: Lexer<'a>,
    /// One-token pushback.
    peeked: Option<Token>,
    registry: &'a Registry,
    sections: BTreeMap<String, Program>,
    inherit: Option<String>,
}

// ── Token plumbing ────────────────────────────────────────────────────────────

impl<'a> Parser<'a> {
    pub(super) fn new(
        name: &str,
        source: &'a str,
        delims: &'a Delimiters,
        registry: &'a Registry,
    ) -> Self {
        Parser {
            lexer: Lexer::new(name, source, delims),
            peeked: None,
            registry,
            sections: BTreeMap::new(),
            inherit: None,
        }
    }

    pub(super) fn next(&mut self) -> Result<Token, Error> {
        match self.peeked.take() {
            Some(tok) => Ok(tok),
            None => self.lexer.next_token(),
        }
    }

    pub(super) fn peek(&mut self) -> Result<&Tok, Error> {
        let tok = self.next()?;
        Ok(&self.peeked.insert(tok).tok)
    }

    pub(super) fn peek_line(&mut self) -> Result<usize, Error> {
        let tok = self.next()?;
        Ok(self.peeked.insert(tok).line)
    }

    pub(super) fn push_back(&mut self, tok: Token) {
        debug_assert!(self.peeked.is_none(), "double pushback");
        self.peeked = Some(tok);
    }

    /// Consume the next token if it equals `want`.
    pub(super) fn eat(&mut self, want: &Tok) -> Result<bool, Error> {
        let tok = self.next()?;
        if &tok.tok == want {
            Ok(true)
        } else {
            self.push_back(tok);
            Ok(false)
        }
    }

    pub(super) fn expect(&mut self, want: &Tok, what: &str) -> Result<Token, Error> {
        let tok = self.next()?;
        if &tok.tok == want {
            Ok(tok)
        } else {
            Err(self.error(tok.line, format!("expected {what}, found {}", tok.tok.describe())))
        }
    }

    fn expect_close(&mut self) -> Result<(), Error> {
        self.expect(&Tok::Close, "end of tag").map(drop)
    }

    pub(super) fn file(&self) -> &Arc<str> {
        self.lexer.file()
    }

    pub(super) fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::parse(&**self.lexer.file(), line, message)
    }
}

// ── Statements ────────────────────────────────────────────────────────────────

impl<'a> Parser<'a> {
    /// Compile statements until `end`, `else`, `elseif` or end of input.
    fn parse_block(&mut self, depth: usize) -> Result<(Program, Stop), Error> {
        let mut out = Program::new();
        loop {
            let tok = self.next()?;
            let line = tok.line;
            match tok.tok {
                Tok::Eof => return Ok((out, Stop::Eof)),
                Tok::Text(text) => out.push(Instr::Echo(text)),
                // `{}` is an empty tag.
                Tok::Close => {}
                Tok::Kw(Keyword::End) => {
                    self.expect_close()?;
                    return Ok((out, Stop::End(line)));
                }
                Tok::Kw(Keyword::Else) => {
                    self.expect_close()?;
                    return Ok((out, Stop::Else(line)));
                }
                Tok::Kw(Keyword::ElseIf) => {
                    let test = self.parse_test()?;
                    return Ok((out, Stop::ElseIf(test, line)));
                }
                Tok::Kw(Keyword::If) => self.parse_if(depth, line, &mut out)?,
                Tok::Kw(Keyword::While) => {
                    let test = self.parse_test()?;
                    let body = self.parse_body(depth, "while", line)?;
                    out.push(Instr::While { test, body });
                }
                Tok::Kw(Keyword::Loop) => self.parse_loop(depth, line, &mut out)?,
                Tok::Kw(Keyword::Foreach) => self.parse_foreach(depth, line, &mut out)?,
                Tok::Kw(Keyword::Nocache) => {
                    self.expect_close()?;
                    let body = self.parse_body(depth, "nocache", line)?;
                    out.push(Instr::Nocache(body));
                }
                Tok::Kw(Keyword::Section) => self.parse_section(depth, line, &mut out)?,
                Tok::Kw(Keyword::Inherit) => {
                    if depth > 0 {
                        return Err(self.error(line, "`inherit` is only allowed at the top level"));
                    }
                    if self.inherit.is_some() {
                        return Err(self.error(line, "a template may only inherit once"));
                    }
                    let name = self.parse_name("inherit")?;
                    self.expect_close()?;
                    self.inherit = Some(name);
                }
                Tok::Kw(Keyword::Insert) => {
                    let name = self.parse_name("insert")?;
                    self.expect_close()?;
                    out.push(Instr::Insert(name));
                }
                Tok::Kw(Keyword::In) => {
                    return Err(self.error(line, "unexpected keyword `in`"));
                }
                Tok::Var(name) => {
                    if self.eat(&Tok::Assign)? {
                        let value = self.parse_expr()?;
                        self.expect_close()?;
                        value.emit(&mut out);
                        out.push(Instr::Assign(name));
                    } else {
                        let first = self.parse_postfix(Node::Lookup(name))?;
                        let node = self.parse_expr_from(first)?;
                        self.expect_close()?;
                        self.emit_print(node, &mut out);
                    }
                }
                other => {
                    self.push_back(Token { tok: other, file: Arc::clone(self.file()), line });
                    let node = self.parse_expr()?;
                    self.expect_close()?;
                    self.emit_print(node, &mut out);
                }
            }
        }
    }

    fn emit_print(&self, node: Node, out: &mut Program) {
        if node.suppresses_print(self.registry) {
            node.emit(out);
            out.push(Instr::Discard);
        } else {
            let escape = node.escapes(self.registry);
            node.emit(out);
            out.push(Instr::Print { escape });
        }
    }

    /// An expression up to the end of the tag, compiled on its own.
    fn parse_test(&mut self) -> Result<Program, Error> {
        let node = self.parse_expr()?;
        self.expect_close()?;
        let mut code = Program::new();
        node.emit(&mut code);
        Ok(code)
    }

    /// A block body that must be closed by `end`.
    fn parse_body(&mut self, depth: usize, opener: &str, line: usize) -> Result<Program, Error> {
        let (body, stop) = self.parse_block(depth + 1)?;
        match stop {
            Stop::End(_) => Ok(body),
            Stop::Eof => Err(self.missing_end(opener, line)),
            Stop::Else(at) => Err(self.error(at, format!("`else` inside `{opener}`"))),
            Stop::ElseIf(_, at) => Err(self.error(at, format!("`elseif` inside `{opener}`"))),
        }
    }

    fn missing_end(&self, opener: &str, line: usize) -> Error {
        self.error(line, format!("missing `end` for `{opener}` opened on line {line}"))
    }

    fn parse_if(&mut self, depth: usize, line: usize, out: &mut Program) -> Result<(), Error> {
        let mut clauses: Vec<(Program, Program)> = Vec::new();
        let mut test = self.parse_test()?;
        let mut otherwise = Program::new();
        loop {
            let (body, stop) = self.parse_block(depth + 1)?;
            match stop {
                Stop::ElseIf(next, _) => {
                    clauses.push((test, body));
                    test = next;
                }
                Stop::Else(_) => {
                    clauses.push((test, body));
                    let (tail, stop) = self.parse_block(depth + 1)?;
                    match stop {
                        Stop::End(_) => otherwise = tail,
                        Stop::Eof => return Err(self.missing_end("if", line)),
                        Stop::Else(at) => return Err(self.error(at, "duplicate `else`")),
                        Stop::ElseIf(_, at) => {
                            return Err(self.error(at, "`elseif` after `else`"));
                        }
                    }
                    break;
                }
                Stop::End(_) => {
                    clauses.push((test, body));
                    break;
                }
                Stop::Eof => return Err(self.missing_end("if", line)),
            }
        }

        // Innermost clause last: each test wraps the chain that follows it.
        let chain = clauses
            .into_iter()
            .rev()
            .fold(otherwise, |rest, (test, then)| {
                let mut code = test;
                code.push(Instr::If {
                    then,
                    otherwise: rest,
                });
                code
            });
        out.extend(chain);
        Ok(())
    }

    /// `loop $v in lower, upper[, step]`
    fn parse_loop(&mut self, depth: usize, line: usize, out: &mut Program) -> Result<(), Error> {
        let var = self.parse_var("loop")?;
        self.expect(&Tok::Kw(Keyword::In), "`in`")?;
        let lower = self.parse_expr()?;
        self.expect(&Tok::Comma, "`,` between loop bounds")?;
        let upper = self.parse_expr()?;
        let step = if self.eat(&Tok::Comma)? {
            self.parse_expr()?
        } else {
            Node::Literal(Value::Int(1))
        };
        self.expect_close()?;
        let body = self.parse_body(depth, "loop", line)?;

        lower.emit(out);
        upper.emit(out);
        step.emit(out);
        out.push(Instr::Range { var, body });
        Ok(())
    }

    /// `foreach $v in expr` or `foreach $k, $v in expr`
    fn parse_foreach(&mut self, depth: usize, line: usize, out: &mut Program) -> Result<(), Error> {
        let first = self.parse_var("foreach")?;
        let (key, var) = if self.eat(&Tok::Comma)? {
            (Some(first), self.parse_var("foreach")?)
        } else {
            (None, first)
        };
        self.expect(&Tok::Kw(Keyword::In), "`in`")?;
        let iterable = self.parse_expr()?;
        self.expect_close()?;
        let body = self.parse_body(depth, "foreach", line)?;

        iterable.emit(out);
        out.push(Instr::Foreach { key, var, body });
        Ok(())
    }

    /// `section name[|insert]`
    fn parse_section(&mut self, depth: usize, line: usize, out: &mut Program) -> Result<(), Error> {
        if depth > 0 {
            return Err(self.error(line, "`section` is only allowed at the top level"));
        }
        let name = self.parse_name("section")?;
        let insert_here = if self.eat(&Tok::Pipe)? {
            self.expect(&Tok::Kw(Keyword::Insert), "`insert` after `|`")?;
            true
        } else {
            false
        };
        self.expect_close()?;
        if self.sections.contains_key(&name) {
            return Err(self.error(line, format!("duplicate section `{name}`")));
        }
        let body = self.parse_body(depth, "section", line)?;
        self.sections.insert(name.clone(), body);
        if insert_here {
            out.push(Instr::Insert(name));
        }
        Ok(())
    }

    /// A bare word or string naming a section or template.
    fn parse_name(&mut self, what: &str) -> Result<String, Error> {
        let tok = self.next()?;
        match tok.tok {
            Tok::Ident(name) | Tok::Str(name) if !name.is_empty() => Ok(name),
            Tok::Kw(kw) => Ok(kw.as_str().to_owned()),
            Tok::Close => Err(self.error(tok.line, format!("`{what}` needs a name"))),
            other => Err(self.error(
                tok.line,
                format!("`{what}` expects a name, found {}", other.describe()),
            )),
        }
    }

    fn parse_var(&mut self, what: &str) -> Result<String, Error> {
        let tok = self.next()?;
        match tok.tok {
            Tok::Var(name) => Ok(name),
            other => Err(self.error(
                tok.line,
                format!("`{what}` expects a variable, found {}", other.describe()),
            )),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
