//! Expression trees and the expression compiler.
//!
//! Expressions are parsed into a [`Node`] tree, folded as they are built, and
//! then flattened into bytecode with [`Node::emit`].  Binary operators are
//! handled by a two-stack precedence climber; postfix access and method calls
//! bind tighter than any binary operator, and a trailing `|modifier` chain
//! binds loosest of all.

use std::sync::Arc;

use crate::error::Error;

use super::bytecode::{BinOp, Instr, Program};
use super::lexer::Tok;
use super::parser::Parser;
use super::registry::Registry;
use super::value::{Array, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// How a member is reached: `.name` / `->name` or `[expr]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Property,
    Index,
}

/// Call-site position carried into runtime errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub file: Arc<str>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    Lookup(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    /// Items of `[...]`; keys are literal or absent.
    Array(Vec<(Option<Value>, Node)>),
    Member {
        target: Box<Node>,
        key: Box<Node>,
        access: Access,
    },
    Call {
        name: String,
        args: Vec<(String, Node)>,
        site: Site,
    },
    Method {
        target: Box<Node>,
        name: String,
        args: Vec<Node>,
        site: Site,
    },
    Modify {
        target: Box<Node>,
        name: String,
        args: Vec<Node>,
        site: Site,
    },
}

// ── Folding constructors ──────────────────────────────────────────────────────

impl Node {
    pub fn unary(op: UnaryOp, operand: Node) -> Node {
        match operand {
            Node::Literal(v) => Node::Literal(match op {
                UnaryOp::Neg => v.negate(),
                UnaryOp::Not => v.not(),
            }),
            other => Node::Unary(op, Box::new(other)),
        }
    }

    pub fn binary(op: BinOp, lhs: Node, rhs: Node) -> Node {
        match (lhs, rhs) {
            (Node::Literal(l), Node::Literal(r)) => Node::Literal(fold_binary(op, &l, &r)),
            (l, r) => Node::Binary(op, Box::new(l), Box::new(r)),
        }
    }

    pub fn array(items: Vec<(Option<Value>, Node)>) -> Node {
        if !items.iter().all(|(_, n)| matches!(n, Node::Literal(_))) {
            return Node::Array(items);
        }
        let (keys, values): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|(k, n)| match n {
                Node::Literal(v) => (k, v),
                _ => (k, Value::Null),
            })
            .unzip();
        Node::Literal(Value::Array(Array::from_slots(&keys, values)))
    }

    pub fn member(target: Node, key: Node, access: Access) -> Node {
        match (target, key) {
            (Node::Literal(t @ Value::Array(_)), Node::Literal(k)) => Node::Literal(t.index(&k)),
            (t, k) => Node::Member {
                target: Box::new(t),
                key: Box::new(k),
                access,
            },
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Node::Literal(_))
    }

    // ── Static properties ─────────────────────────────────────────────────────

    /// Whether a `print` of this expression is auto-escaped.
    pub fn escapes(&self, registry: &Registry) -> bool {
        match self {
            Node::Literal(_)
            | Node::Lookup(_)
            | Node::Unary(..)
            | Node::Binary(..)
            | Node::Member { .. } => false,
            Node::Array(_) | Node::Method { .. } => true,
            Node::Call { name, .. } => registry.get(name).map_or(true, |e| e.flags.escape),
            Node::Modify { target, name, .. } => {
                if name.eq_ignore_ascii_case("raw") || name.eq_ignore_ascii_case("escape") {
                    false
                } else {
                    target.escapes(registry) || registry.get(name).map_or(true, |e| e.flags.escape)
                }
            }
        }
    }

    /// A bare call to a function flagged `suppress_print`.
    pub fn suppresses_print(&self, registry: &Registry) -> bool {
        match self {
            Node::Call { name, .. } => registry.get(name).is_some_and(|e| e.flags.suppress_print),
            _ => false,
        }
    }

    // ── Code generation ───────────────────────────────────────────────────────

    /// Append bytecode leaving exactly one value on the stack.
    pub fn emit(self, out: &mut Program) {
        match self {
            Node::Literal(v) => out.push(Instr::Push(v)),
            Node::Lookup(name) => out.push(Instr::Lookup(name)),
            Node::Unary(op, operand) => {
                operand.emit(out);
                out.push(match op {
                    UnaryOp::Neg => Instr::Negate,
                    UnaryOp::Not => Instr::Not,
                });
            }
            Node::Binary(op, lhs, rhs) => {
                lhs.emit(out);
                rhs.emit(out);
                op.emit(out);
            }
            Node::Array(items) => {
                let mut keys = Vec::with_capacity(items.len());
                for (key, node) in items {
                    node.emit(out);
                    keys.push(key);
                }
                out.push(Instr::MakeArray(keys));
            }
            Node::Member {
                target,
                key,
                access,
            } => {
                target.emit(out);
                key.emit(out);
                out.push(match access {
                    Access::Property => Instr::Property,
                    Access::Index => Instr::Index,
                });
            }
            Node::Call { name, args, site } => {
                let mut names = Vec::with_capacity(args.len());
                for (arg, node) in args {
                    node.emit(out);
                    names.push(arg);
                }
                out.push(Instr::Call {
                    name,
                    args: names,
                    file: site.file.to_string(),
                    line: site.line,
                });
            }
            Node::Method {
                target,
                name,
                args,
                site,
            } => {
                target.emit(out);
                let argc = args.len();
                for node in args {
                    node.emit(out);
                }
                out.push(Instr::Method {
                    name,
                    argc,
                    file: site.file.to_string(),
                    line: site.line,
                });
            }
            Node::Modify {
                target,
                name,
                args,
                site,
            } => {
                target.emit(out);
                let argc = args.len();
                for node in args {
                    node.emit(out);
                }
                out.push(Instr::Modify {
                    name,
                    argc,
                    file: site.file.to_string(),
                    line: site.line,
                });
            }
        }
    }
}

/// `NotIn` is two opcodes at runtime; fold it the same way.
fn fold_binary(op: BinOp, l: &Value, r: &Value) -> Value {
    match op {
        BinOp::NotIn => Value::binary(BinOp::In, l, r).not(),
        op => Value::binary(op, l, r),
    }
}

fn binop_for(tok: &Tok) -> Option<BinOp> {
    Some(match tok {
        Tok::Plus => BinOp::Add,
        Tok::Minus => BinOp::Sub,
        Tok::Star => BinOp::Mul,
        Tok::Slash => BinOp::Div,
        Tok::Percent => BinOp::Mod,
        Tok::DotDot => BinOp::Concat,
        Tok::Eq => BinOp::Eq,
        Tok::Ne => BinOp::Ne,
        Tok::Lt => BinOp::Lt,
        Tok::Le => BinOp::Le,
        Tok::Gt => BinOp::Gt,
        Tok::Ge => BinOp::Ge,
        Tok::And => BinOp::And,
        Tok::Or => BinOp::Or,
        Tok::Kw(super::lexer::Keyword::In) => BinOp::In,
        Tok::NotIn => BinOp::NotIn,
        _ => return None,
    })
}

// ── Expression parser ─────────────────────────────────────────────────────────

impl<'a> Parser<'a> {
    /// Parse a full expression, including any modifier chain.
    pub(super) fn parse_expr(&mut self) -> Result<Node, Error> {
        let first = self.parse_unary()?;
        self.parse_expr_from(first)
    }

    /// Continue an expression whose first operand (with its postfix chain)
    /// has already been parsed.
    pub(super) fn parse_expr_from(&mut self, first: Node) -> Result<Node, Error> {
        let mut operands = vec![first];
        let mut operators: Vec<BinOp> = Vec::new();

        loop {
            let Some(op) = binop_for(self.peek()?) else {
                break;
            };
            self.next()?;
            while let Some(&top) = operators.last() {
                if top.precedence() < op.precedence() {
                    break;
                }
                operators.pop();
                self.reduce(&mut operands, top)?;
            }
            operators.push(op);
            let rhs = self.parse_unary()?;
            operands.push(rhs);
        }
        while let Some(op) = operators.pop() {
            self.reduce(&mut operands, op)?;
        }

        let node = match (operands.pop(), operands.is_empty()) {
            (Some(node), true) => node,
            _ => return Err(Error::Internal("expression stack imbalance".into())),
        };
        self.parse_modifiers(node)
    }

    fn reduce(&self, operands: &mut Vec<Node>, op: BinOp) -> Result<(), Error> {
        match (operands.pop(), operands.pop()) {
            (Some(rhs), Some(lhs)) => {
                operands.push(Node::binary(op, lhs, rhs));
                Ok(())
            }
            _ => Err(Error::Internal("expression stack underflow".into())),
        }
    }

    fn parse_unary(&mut self) -> Result<Node, Error> {
        if self.eat(&Tok::Minus)? {
            let operand = self.parse_unary()?;
            return Ok(Node::unary(UnaryOp::Neg, operand));
        }
        if self.eat(&Tok::Bang)? {
            let operand = self.parse_unary()?;
            return Ok(Node::unary(UnaryOp::Not, operand));
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_primary(&mut self) -> Result<Node, Error> {
        let tok = self.next()?;
        let line = tok.line;
        Ok(match tok.tok {
            Tok::Int(n) => Node::Literal(Value::Int(n)),
            Tok::Float(x) => Node::Literal(Value::Float(x)),
            Tok::Str(s) => Node::Literal(Value::Str(s)),
            Tok::Bool(b) => Node::Literal(Value::Bool(b)),
            Tok::Null => Node::Literal(Value::Null),
            Tok::Var(name) => Node::Lookup(name),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Tok::RParen, "`)`")?;
                inner
            }
            Tok::LBracket => self.parse_array()?,
            Tok::Ident(name) => {
                if !self.eat(&Tok::LParen)? {
                    return Err(self.error(line, format!("expected `(` after function name `{name}`")));
                }
                let args = self.parse_named_args()?;
                Node::Call {
                    name,
                    args,
                    site: self.site(line),
                }
            }
            other => {
                return Err(self.error(line, format!("unexpected {} in expression", other.describe())))
            }
        })
    }

    /// `[a, b, "k" => c]`, after the opening bracket.
    fn parse_array(&mut self) -> Result<Node, Error> {
        let mut items = Vec::new();
        loop {
            if self.eat(&Tok::RBracket)? {
                break;
            }
            let line = self.peek_line()?;
            let first = self.parse_expr()?;
            let item = if self.eat(&Tok::FatArrow)? {
                let key = match first {
                    Node::Literal(v) => v,
                    _ => return Err(self.error(line, "array keys must be literals")),
                };
                (Some(key), self.parse_expr()?)
            } else {
                (None, first)
            };
            items.push(item);
            if !self.eat(&Tok::Comma)? {
                self.expect(&Tok::RBracket, "`,` or `]`")?;
                break;
            }
        }
        Ok(Node::array(items))
    }

    /// `name=expr, ...` up to and including `)`.
    fn parse_named_args(&mut self) -> Result<Vec<(String, Node)>, Error> {
        let mut args = Vec::new();
        loop {
            if self.eat(&Tok::RParen)? {
                break;
            }
            let tok = self.next()?;
            let name = match tok.tok {
                Tok::Ident(name) => name,
                other => {
                    return Err(self.error(
                        tok.line,
                        format!("expected argument name, found {}", other.describe()),
                    ))
                }
            };
            self.expect(&Tok::Assign, "`=` after argument name")?;
            args.push((name, self.parse_expr()?));
            if !self.eat(&Tok::Comma)? {
                self.expect(&Tok::RParen, "`,` or `)`")?;
                break;
            }
        }
        Ok(args)
    }

    /// Positional `expr, ...` up to and including `)`.
    fn parse_positional_args(&mut self) -> Result<Vec<Node>, Error> {
        let mut args = Vec::new();
        loop {
            if self.eat(&Tok::RParen)? {
                break;
            }
            args.push(self.parse_expr()?);
            if !self.eat(&Tok::Comma)? {
                self.expect(&Tok::RParen, "`,` or `)`")?;
                break;
            }
        }
        Ok(args)
    }

    /// Member access, indexing and method calls.
    pub(super) fn parse_postfix(&mut self, mut node: Node) -> Result<Node, Error> {
        loop {
            let tok = self.next()?;
            let line = tok.line;
            match tok.tok {
                Tok::Dot | Tok::Arrow => {
                    let name_tok = self.next()?;
                    let name = match name_tok.tok {
                        Tok::Ident(name) => name,
                        Tok::Kw(kw) => kw.as_str().to_owned(),
                        Tok::Int(n) => {
                            node = Node::member(node, Node::Literal(Value::Int(n)), Access::Index);
                            continue;
                        }
                        other => {
                            return Err(self.error(
                                name_tok.line,
                                format!("expected member name, found {}", other.describe()),
                            ))
                        }
                    };
                    if self.eat(&Tok::LParen)? {
                        let args = self.parse_positional_args()?;
                        node = Node::Method {
                            target: Box::new(node),
                            name,
                            args,
                            site: self.site(line),
                        };
                    } else {
                        node = Node::member(node, Node::Literal(Value::Str(name)), Access::Property);
                    }
                }
                Tok::LBracket => {
                    let key = self.parse_expr()?;
                    self.expect(&Tok::RBracket, "`]`")?;
                    node = Node::member(node, key, Access::Index);
                }
                _ => {
                    self.push_back(tok);
                    return Ok(node);
                }
            }
        }
    }

    /// `|name:arg:arg|name2 ...`
    fn parse_modifiers(&mut self, mut node: Node) -> Result<Node, Error> {
        while self.eat(&Tok::Pipe)? {
            let tok = self.next()?;
            let name = match tok.tok {
                Tok::Ident(name) => name,
                other => {
                    return Err(self.error(
                        tok.line,
                        format!("expected modifier name after `|`, found {}", other.describe()),
                    ))
                }
            };
            let mut args = Vec::new();
            while self.eat(&Tok::Colon)? {
                args.push(self.parse_unary()?);
            }
            node = Node::Modify {
                target: Box::new(node),
                name,
                args,
                site: self.site(tok.line),
            };
        }
        Ok(node)
    }

    fn site(&self, line: usize) -> Site {
        Site {
            file: Arc::clone(self.file()),
            line,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::lexer::Delimiters;

    fn parse(src: &str) -> Node {
        let delims = Delimiters::default();
        let reg = Registry::with_builtins();
        let source = format!("{{{src}}}");
        let mut p = Parser::new("t", &source, &delims, &reg);
        p.parse_expr().expect("parse")
    }

    fn lit(src: &str) -> Value {
        match parse(src) {
            Node::Literal(v) => v,
            other => panic!("not folded: {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        assert_eq!(lit("2 + 3 * 4"), Value::Int(14));
    }

    #[test]
    fn parentheses_override() {
        assert_eq!(lit("(2 + 3) * 4"), Value::Int(20));
    }

    #[test]
    fn concat_binds_looser_than_add() {
        assert_eq!(lit("1 + 1 .. 2"), Value::from("22"));
    }

    #[test]
    fn left_associative() {
        assert_eq!(lit("10 - 3 - 2"), Value::Int(5));
        assert_eq!(lit("2 * 6 / 3"), Value::Int(4));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        assert_eq!(lit("true || false && false"), Value::Bool(true));
    }

    #[test]
    fn comparisons_fold() {
        assert_eq!(lit("3 > 2 && 1 == 1"), Value::Bool(true));
        assert_eq!(lit("2 in [1, 2]"), Value::Bool(true));
        assert_eq!(lit("5 !in [1, 2]"), Value::Bool(true));
    }

    #[test]
    fn unary_folds() {
        assert_eq!(lit("-(2 + 3)"), Value::Int(-5));
        assert_eq!(lit("!0"), Value::Bool(true));
    }

    #[test]
    fn literal_array_index_folds() {
        assert_eq!(lit("[10, 20, 30][1]"), Value::Int(20));
        assert_eq!(lit(r#"["a" => 1, "b" => 2].b"#), Value::Int(2));
    }

    #[test]
    fn lookup_is_not_folded() {
        assert!(matches!(parse("$x + 1"), Node::Binary(BinOp::Add, ..)));
    }

    #[test]
    fn postfix_chain() {
        let node = parse("$user.name->first[0]");
        let mut out = Program::new();
        node.emit(&mut out);
        assert_eq!(
            out,
            vec![
                Instr::Lookup("user".into()),
                Instr::Push(Value::from("name")),
                Instr::Property,
                Instr::Push(Value::from("first")),
                Instr::Property,
                Instr::Push(Value::Int(0)),
                Instr::Index,
            ]
        );
    }

    #[test]
    fn method_call_takes_positional_args() {
        match parse("$obj.greet(1, $x)") {
            Node::Method { name, args, .. } => {
                assert_eq!(name, "greet");
                assert_eq!(args.len(), 2);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn call_takes_named_args() {
        match parse(r#"include(file="a", x=1 + 1)"#) {
            Node::Call { name, args, .. } => {
                assert_eq!(name, "include");
                assert_eq!(args[0].0, "file");
                assert_eq!(args[1].1, Node::Literal(Value::Int(2)));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn modifier_chain_with_args() {
        match parse(r#"$x|default:"none"|raw"#) {
            Node::Modify { name, target, .. } => {
                assert_eq!(name, "raw");
                assert!(matches!(*target, Node::Modify { ref args, .. } if args.len() == 1));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn escape_flags() {
        let reg = Registry::with_builtins();
        assert!(!parse("$x").escapes(&reg));
        assert!(!parse("$x.y").escapes(&reg));
        assert!(!parse("$x + 1").escapes(&reg));
        assert!(parse("$o.m()").escapes(&reg));
        assert!(parse("[$x]").escapes(&reg));
        assert!(parse("unknown(a=1)").escapes(&reg));
        assert!(!parse("$o.m()|raw").escapes(&reg));
        assert!(parse("$o.m()|default:1").escapes(&reg));
        assert!(!parse("$x|default:1").escapes(&reg));
    }

    #[test]
    fn include_suppresses_print() {
        let reg = Registry::with_builtins();
        assert!(parse(r#"include(file="x")"#).suppresses_print(&reg));
        assert!(!parse("$x").suppresses_print(&reg));
    }

    #[test]
    fn keyed_array_needs_literal_key() {
        let delims = Delimiters::default();
        let reg = Registry::new();
        let mut p = Parser::new("t", "{[$k => 1]}", &delims, &reg);
        let err = p.parse_expr().unwrap_err();
        assert!(err.is_parse());
    }
}
