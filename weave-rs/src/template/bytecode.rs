//! Instruction set and the compiled-template artifact.
//!
//! A [`Program`] is a flat instruction list.  Block constructs (`if`, loops,
//! `nocache`, sections) embed their bodies as nested programs, so a program
//! never jumps; the VM recurses instead.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::value::Value;

pub type Program = Vec<Instr>;

/// Binary operators.  Precedence is used by the expression compiler; the
/// evaluator lives in [`Value::binary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
}

impl BinOp {
    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Concat => 4,
            BinOp::Eq
            | BinOp::Ne
            | BinOp::Lt
            | BinOp::Le
            | BinOp::Gt
            | BinOp::Ge
            | BinOp::In
            | BinOp::NotIn => 3,
            BinOp::And => 2,
            BinOp::Or => 1,
        }
    }

    /// Append the opcode(s) implementing this operator.
    pub fn emit(self, out: &mut Program) {
        let instr = match self {
            BinOp::Add => Instr::Add,
            BinOp::Sub => Instr::Sub,
            BinOp::Mul => Instr::Mul,
            BinOp::Div => Instr::Div,
            BinOp::Mod => Instr::Mod,
            BinOp::Concat => Instr::Concat,
            BinOp::Eq => Instr::Compare(Cmp::Eq),
            BinOp::Ne => Instr::Compare(Cmp::Ne),
            BinOp::Lt => Instr::Compare(Cmp::Lt),
            BinOp::Le => Instr::Compare(Cmp::Le),
            BinOp::Gt => Instr::Compare(Cmp::Gt),
            BinOp::Ge => Instr::Compare(Cmp::Ge),
            BinOp::And => Instr::Logical(Logic::And),
            BinOp::Or => Instr::Logical(Logic::Or),
            BinOp::In => Instr::In,
            BinOp::NotIn => {
                out.push(Instr::In);
                Instr::Not
            }
        };
        out.push(instr);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    And,
    Or,
}

/// One VM instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    Push(Value),
    Echo(String),
    Print { escape: bool },
    Lookup(String),
    Assign(String),
    Discard,

    Negate,
    Not,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Compare(Cmp),
    Logical(Logic),
    In,
    Index,
    Property,
    /// Pops one value per key slot; `None` slots are auto-indexed.
    MakeArray(Vec<Option<Value>>),

    /// Named-argument function call; argument values are on the stack in
    /// `args` order.
    Call {
        name: String,
        args: Vec<String>,
        file: String,
        line: usize,
    },
    /// Method call; target then `argc` arguments are on the stack.
    Method {
        name: String,
        argc: usize,
        file: String,
        line: usize,
    },
    /// Modifier pipe; input value then `argc` arguments are on the stack.
    Modify {
        name: String,
        argc: usize,
        file: String,
        line: usize,
    },

    /// Lower, upper and step are on the stack.
    Range { var: String, body: Program },
    /// The iterable is on the stack.
    Foreach {
        key: Option<String>,
        var: String,
        body: Program,
    },
    /// The test value is on the stack.
    If { then: Program, otherwise: Program },
    While { test: Program, body: Program },
    Nocache(Program),
    Insert(String),
    /// Live regions recorded inside an `include`: `body` runs in a fresh
    /// frame seeded with `vars`, and `insert` resolves against `sections`.
    Frame {
        vars: Vec<(String, Value)>,
        sections: BTreeMap<String, Program>,
        body: Program,
    },
}

impl Instr {
    /// Net change in operand-stack depth caused by executing this instruction.
    pub fn stack_effect(&self) -> isize {
        match self {
            Instr::Push(_) | Instr::Lookup(_) => 1,
            Instr::Echo(_)
            | Instr::Negate
            | Instr::Not
            | Instr::While { .. }
            | Instr::Nocache(_)
            | Instr::Insert(_)
            | Instr::Frame { .. } => 0,
            Instr::Print { .. } | Instr::Assign(_) | Instr::Discard => -1,
            Instr::Concat
            | Instr::Add
            | Instr::Sub
            | Instr::Mul
            | Instr::Div
            | Instr::Mod
            | Instr::Compare(_)
            | Instr::Logical(_)
            | Instr::In
            | Instr::Index
            | Instr::Property => -1,
            Instr::MakeArray(keys) => 1 - keys.len() as isize,
            Instr::Call { args, .. } => 1 - args.len() as isize,
            Instr::Method { argc, .. } | Instr::Modify { argc, .. } => -(*argc as isize),
            Instr::Range { .. } => -3,
            Instr::Foreach { .. } | Instr::If { .. } => -1,
        }
    }

    /// The operator this instruction applies, if it is a plain binary opcode.
    pub fn binary_op(&self) -> Option<BinOp> {
        Some(match self {
            Instr::Concat => BinOp::Concat,
            Instr::Add => BinOp::Add,
            Instr::Sub => BinOp::Sub,
            Instr::Mul => BinOp::Mul,
            Instr::Div => BinOp::Div,
            Instr::Mod => BinOp::Mod,
            Instr::Compare(Cmp::Eq) => BinOp::Eq,
            Instr::Compare(Cmp::Ne) => BinOp::Ne,
            Instr::Compare(Cmp::Lt) => BinOp::Lt,
            Instr::Compare(Cmp::Le) => BinOp::Le,
            Instr::Compare(Cmp::Gt) => BinOp::Gt,
            Instr::Compare(Cmp::Ge) => BinOp::Ge,
            Instr::Logical(Logic::And) => BinOp::And,
            Instr::Logical(Logic::Or) => BinOp::Or,
            Instr::In => BinOp::In,
            _ => return None,
        })
    }
}

/// Index of the instruction after which the operand stack empties again,
/// scanning forward from `start` with `depth` values already on the stack.
///
/// Returns `None` if the program ends first.
pub fn statement_end(program: &[Instr], start: usize, depth: usize) -> Option<usize> {
    let mut depth = depth as isize;
    for (i, instr) in program.iter().enumerate().skip(start) {
        depth += instr.stack_effect();
        if depth <= 0 {
            return Some(i);
        }
    }
    None
}

// ── CompiledTemplate ──────────────────────────────────────────────────────────

/// The immutable output of compilation (and, with frozen text in `main`, of
/// a cached render).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub main: Program,
    pub sections: BTreeMap<String, Program>,
    pub inherit: Option<String>,
    pub referenced: BTreeSet<String>,
}

/// Name of the section that replaces a parent's body when a child defines it.
pub const CONTENT_SECTION: &str = "content";

impl CompiledTemplate {
    /// Overlay `child` onto `self` (the parent named `parent_ref`).
    ///
    /// Child sections replace parent sections of the same name.  The parent's
    /// main body is kept unless the child defines [`CONTENT_SECTION`].
    pub fn merge(&self, child: &CompiledTemplate, parent_ref: &str) -> CompiledTemplate {
        let mut sections = self.sections.clone();
        for (name, body) in &child.sections {
            sections.insert(name.clone(), body.clone());
        }
        let main = match child.sections.get(CONTENT_SECTION) {
            Some(body) => body.clone(),
            None => self.main.clone(),
        };
        let mut referenced: BTreeSet<String> =
            self.referenced.union(&child.referenced).cloned().collect();
        referenced.insert(parent_ref.to_owned());
        CompiledTemplate {
            main,
            sections,
            inherit: None,
            referenced,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, argc: usize) -> Instr {
        Instr::Call {
            name: name.into(),
            args: (0..argc).map(|i| format!("a{i}")).collect(),
            file: "t".into(),
            line: 1,
        }
    }

    #[test]
    fn not_in_emits_two_opcodes() {
        let mut out = Program::new();
        BinOp::NotIn.emit(&mut out);
        assert_eq!(out, vec![Instr::In, Instr::Not]);
    }

    #[test]
    fn statement_end_simple_print() {
        // {f(a=1) + 2}
        let prog = vec![
            Instr::Push(Value::Int(1)),
            call("f", 1),
            Instr::Push(Value::Int(2)),
            Instr::Add,
            Instr::Print { escape: false },
            Instr::Echo("after".into()),
        ];
        // About to execute the call with one value on the stack.
        assert_eq!(statement_end(&prog, 1, 1), Some(4));
    }

    #[test]
    fn statement_end_runs_off_program() {
        let prog = vec![call("f", 0)];
        assert_eq!(statement_end(&prog, 0, 0), None);
    }

    #[test]
    fn statement_end_through_if() {
        let prog = vec![
            call("f", 0),
            Instr::If {
                then: vec![Instr::Echo("y".into())],
                otherwise: vec![],
            },
        ];
        assert_eq!(statement_end(&prog, 0, 0), Some(1));
    }

    #[test]
    fn merge_keeps_parent_body_without_content() {
        let mut parent = CompiledTemplate::default();
        parent.main = vec![Instr::Echo("<html>".into()), Instr::Insert("title".into())];
        parent.sections.insert("title".into(), vec![Instr::Echo("Default".into())]);
        let mut child = CompiledTemplate::default();
        child.sections.insert("title".into(), vec![Instr::Echo("Mine".into())]);
        child.referenced.insert("file:part".into());

        let merged = parent.merge(&child, "file:layout");
        assert_eq!(merged.main, parent.main);
        assert_eq!(merged.sections["title"], vec![Instr::Echo("Mine".into())]);
        assert!(merged.referenced.contains("file:layout"));
        assert!(merged.referenced.contains("file:part"));
        assert_eq!(merged.inherit, None);
    }

    #[test]
    fn merge_child_content_replaces_body() {
        let mut parent = CompiledTemplate::default();
        parent.main = vec![Instr::Echo("parent".into())];
        let mut child = CompiledTemplate::default();
        child
            .sections
            .insert(CONTENT_SECTION.into(), vec![Instr::Echo("child".into())]);
        let merged = parent.merge(&child, "file:p");
        assert_eq!(merged.main, vec![Instr::Echo("child".into())]);
    }
}
