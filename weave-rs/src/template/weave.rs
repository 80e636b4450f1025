//! Fragment-caching recorder.
//!
//! While a render runs with a [`Weave`] attached, every byte written to the
//! output is also appended to a pending buffer.  Volatile constructs flush
//! that buffer as a single `Echo` and splice in live instructions instead of
//! their output, so replaying the finished artifact reproduces the static
//! parts verbatim and re-runs only the volatile ones.
//!
//! An `include` opens a nested recording.  If anything live was spliced
//! inside it, the nested program is wrapped in an [`Instr::Frame`] carrying
//! the include's arguments and sections; otherwise its text simply joins the
//! surrounding buffer.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use super::bytecode::{CompiledTemplate, Instr, Program};
use super::value::Value;

#[derive(Debug, Default)]
pub struct Weave {
    pending: String,
    program: Program,
    /// Nesting depth of regions whose output is produced by live code.
    suppressed: usize,
    /// Recordings of the enclosing templates while an include is open.
    frames: Vec<OpenFrame>,
    /// Set when a frozen value cannot be persisted.
    opaque: bool,
}

#[derive(Debug)]
struct OpenFrame {
    vars: Vec<(String, Value)>,
    sections: BTreeMap<String, Program>,
    pending: String,
    program: Program,
}

impl Weave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.suppressed == 0
    }

    pub fn record(&mut self, text: &str) {
        if self.is_recording() {
            self.pending.push_str(text);
        }
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.program.push(Instr::Echo(mem::take(&mut self.pending)));
        }
    }

    /// Splice a `nocache` body.  Call [`Weave::suppress`] around its execution.
    pub fn splice_block(&mut self, body: &Program) {
        self.flush();
        self.program.push(Instr::Nocache(body.clone()));
    }

    /// Splice a volatile call: the operand stack as it stands, followed by
    /// the call and the rest of its statement.
    pub fn splice_call(&mut self, operands: &[Value], tail: &[Instr]) {
        self.flush();
        self.opaque |= !operands.iter().all(Value::is_persistable);
        self.program
            .extend(operands.iter().cloned().map(Instr::Push));
        self.program.extend(tail.iter().cloned());
    }

    pub fn suppress(&mut self) {
        self.suppressed += 1;
    }

    pub fn resume(&mut self) {
        self.suppressed = self.suppressed.saturating_sub(1);
    }

    /// Start recording an included template.
    pub fn enter(&mut self, vars: Vec<(String, Value)>, sections: BTreeMap<String, Program>) {
        self.frames.push(OpenFrame {
            vars,
            sections,
            pending: mem::take(&mut self.pending),
            program: mem::take(&mut self.program),
        });
    }

    /// Close the innermost [`Weave::enter`].
    pub fn leave(&mut self) {
        let Some(outer) = self.frames.pop() else {
            return;
        };
        if self.program.is_empty() {
            // Nothing live inside: the text stays in one run with its surroundings.
            let inner = mem::replace(&mut self.pending, outer.pending);
            self.pending.push_str(&inner);
            self.program = outer.program;
            return;
        }
        self.flush();
        let body = mem::replace(&mut self.program, outer.program);
        self.pending = outer.pending;
        self.flush();
        self.opaque |= !outer.vars.iter().all(|(_, v)| v.is_persistable());
        self.program.push(Instr::Frame {
            vars: outer.vars,
            sections: outer.sections,
            body,
        });
    }

    /// Whether the recording holds a host object and cannot be stored.
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Turn the recording into an HTML-cache template.
    pub fn finish(mut self, source: &CompiledTemplate, referenced: BTreeSet<String>) -> CompiledTemplate {
        while !self.frames.is_empty() {
            self.leave();
        }
        self.flush();
        CompiledTemplate {
            main: self.program,
            sections: source.sections.clone(),
            inherit: None,
            referenced: source.referenced.union(&referenced).cloned().collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
