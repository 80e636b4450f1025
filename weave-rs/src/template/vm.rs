//! Stack-machine executor.
//!
//! [`Vm`] runs a [`Program`] against a [`Scope`].  Every block gets a fresh
//! operand stack that must be empty again when the block ends; nested bodies
//! recurse through [`Vm::exec`].  Function calls go through a single
//! boundary ([`Vm::invoke`]) where failures are handed to the
//! [`ErrorPolicy`] instead of unwinding the render.
//!
//! When a [`Weave`] is attached, every write is mirrored into it and
//! volatile constructs are spliced into the recording as live code.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, ErrorPolicy};
use crate::escape::{self, OutputMode};

use super::builtins::MAX_INCLUDE_DEPTH;
use super::bytecode::{statement_end, CompiledTemplate, Instr, Program};
use super::registry::{Args, Registry};
use super::scope::Scope;
use super::value::Value;
use super::weave::Weave;

/// Source of templates for `include`.
pub trait Loader {
    /// Fetch a compiled, inheritance-merged template together with its
    /// canonical reference.
    fn load(&self, reference: &str) -> Result<(String, Arc<CompiledTemplate>), Error>;
}

/// Loader for renders that have no template storage.
pub struct NoTemplates;

impl Loader for NoTemplates {
    fn load(&self, reference: &str) -> Result<(String, Arc<CompiledTemplate>), Error> {
        Err(Error::usage(format!("cannot load `{reference}`: no template storage")))
    }
}

/// Read-only collaborators shared by every VM of a render.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub registry: &'a Registry,
    pub loader: &'a dyn Loader,
    pub mode: OutputMode,
    pub policy: ErrorPolicy,
}

pub struct Vm<'a> {
    env: Env<'a>,
    scope: &'a mut Scope,
    /// Template whose sections `insert` resolves against.
    template: Arc<CompiledTemplate>,
    weave: Option<Weave>,
    /// References pulled in at runtime by `include`.
    referenced: BTreeSet<String>,
    out: String,
    includes: usize,
    /// Call failures handled by the policy.
    failures: usize,
}

impl<'a> Vm<'a> {
    pub fn new(env: Env<'a>, scope: &'a mut Scope, template: Arc<CompiledTemplate>) -> Self {
        Vm {
            env,
            scope,
            template,
            weave: None,
            referenced: BTreeSet::new(),
            out: String::new(),
            includes: 0,
            failures: 0,
        }
    }

    /// Record an HTML-cache artifact while running.
    pub fn with_weave(mut self) -> Self {
        self.weave = Some(Weave::new());
        self
    }

    /// Execute the template's main body in a fresh scope frame.
    pub fn run(&mut self) -> Result<(), Error> {
        let template = Arc::clone(&self.template);
        self.scope.push_frame();
        let result = self.exec(&template.main);
        self.scope.pop_frame();
        result
    }

    /// Output so far, plus the recorded artifact if a weave was attached
    /// and no call failed.
    pub fn finish(self) -> (String, Option<CompiledTemplate>) {
        let artifact = match self.weave {
            Some(_) if self.failures > 0 => {
                tracing::debug!(failures = self.failures, "render had errors; not caching");
                None
            }
            Some(weave) if weave.is_opaque() => {
                tracing::debug!("recording froze a host object; not caching");
                None
            }
            Some(weave) => Some(weave.finish(&self.template, self.referenced)),
            None => None,
        };
        (self.out, artifact)
    }

    // ── Block execution ───────────────────────────────────────────────────────

    /// Run a block body; the operand stack starts and ends empty.
    pub fn exec(&mut self, program: &[Instr]) -> Result<(), Error> {
        let mut stack = Vec::new();
        self.run_program(program, &mut stack)?;
        if stack.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(format!("{} values left on operand stack", stack.len())))
        }
    }

    /// Run an expression program and return its value.
    pub fn eval(&mut self, program: &[Instr]) -> Result<Value, Error> {
        let mut stack = Vec::new();
        self.run_program(program, &mut stack)?;
        match (stack.pop(), stack.is_empty()) {
            (Some(v), true) => Ok(v),
            _ => Err(Error::Internal("expression did not produce one value".into())),
        }
    }

    fn run_program(&mut self, program: &[Instr], stack: &mut Vec<Value>) -> Result<(), Error> {
        // Index of the instruction that ends a spliced volatile statement.
        let mut live_until = None;
        for (pc, instr) in program.iter().enumerate() {
            if live_until.is_none() && self.is_recording() && self.is_volatile(instr) {
                match statement_end(program, pc, stack.len()) {
                    Some(end) => {
                        if let Some(weave) = self.weave.as_mut() {
                            weave.splice_call(stack, &program[pc..=end]);
                            weave.suppress();
                        }
                        live_until = Some(end);
                    }
                    None => tracing::warn!(
                        instr = ?instr,
                        "volatile call does not end its statement in this block; output is frozen"
                    ),
                }
            }
            self.step(instr, stack)?;
            if live_until == Some(pc) {
                if let Some(weave) = self.weave.as_mut() {
                    weave.resume();
                }
                live_until = None;
            }
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.weave.as_ref().is_some_and(Weave::is_recording)
    }

    fn is_volatile(&self, instr: &Instr) -> bool {
        match instr {
            Instr::Call { name, .. } | Instr::Modify { name, .. } => {
                self.env.registry.is_volatile(name)
            }
            _ => false,
        }
    }

    fn write(&mut self, text: &str) {
        self.out.push_str(text);
        if let Some(weave) = self.weave.as_mut() {
            weave.record(text);
        }
    }

    // ── Instructions ──────────────────────────────────────────────────────────

    fn step(&mut self, instr: &Instr, stack: &mut Vec<Value>) -> Result<(), Error> {
        match instr {
            Instr::Push(v) => stack.push(v.clone()),
            Instr::Echo(text) => self.write(text),
            Instr::Print { escape: esc } => {
                let text = pop(stack)?.to_string();
                if *esc {
                    let escaped = escape::escape(self.env.mode, &text);
                    self.write(&escaped);
                } else {
                    self.write(&text);
                }
            }
            Instr::Lookup(name) => stack.push(self.scope.get(name).cloned().unwrap_or_default()),
            Instr::Assign(name) => {
                let v = pop(stack)?;
                self.scope.set(name, v);
            }
            Instr::Discard => {
                pop(stack)?;
            }
            Instr::Negate => {
                let v = pop(stack)?;
                stack.push(v.negate());
            }
            Instr::Not => {
                let v = pop(stack)?;
                stack.push(v.not());
            }
            Instr::Concat
            | Instr::Add
            | Instr::Sub
            | Instr::Mul
            | Instr::Div
            | Instr::Mod
            | Instr::Compare(_)
            | Instr::Logical(_)
            | Instr::In => {
                let rhs = pop(stack)?;
                let lhs = pop(stack)?;
                let op = instr
                    .binary_op()
                    .ok_or_else(|| Error::Internal(format!("{instr:?} is not binary")))?;
                stack.push(Value::binary(op, &lhs, &rhs));
            }
            Instr::Index | Instr::Property => {
                let key = pop(stack)?;
                let target = pop(stack)?;
                stack.push(target.index(&key));
            }
            Instr::MakeArray(keys) => {
                let values = pop_n(stack, keys.len())?;
                stack.push(Value::Array(super::value::Array::from_slots(keys, values)));
            }
            Instr::Call {
                name,
                args,
                file,
                line,
            } => {
                let values = pop_n(stack, args.len())?;
                let named = args.iter().cloned().zip(values).collect();
                let v = self.invoke(name, Args::named(named), file, *line)?;
                stack.push(v);
            }
            Instr::Method {
                name,
                argc,
                file,
                line,
            } => {
                let args = pop_n(stack, *argc)?;
                let target = pop(stack)?;
                let result = match &target {
                    Value::Object(obj) => obj.call_method(name, &args).map_err(Error::runtime),
                    other => Err(Error::runtime(format!(
                        "cannot call method `{name}` on {}",
                        other.type_name()
                    ))),
                };
                let v = self.boundary(result.map_err(|e| e.at(file, *line)))?;
                stack.push(v);
            }
            Instr::Modify {
                name,
                argc,
                file,
                line,
            } => {
                let mut args = pop_n(stack, *argc)?;
                args.insert(0, pop(stack)?);
                let v = self.invoke(name, Args::positional(args), file, *line)?;
                stack.push(v);
            }
            Instr::Range { var, body } => {
                let step = pop(stack)?;
                let upper = pop(stack)?;
                let lower = pop(stack)?;
                self.range(var, &lower, &upper, &step, body)?;
            }
            Instr::Foreach { key, var, body } => {
                let iterable = pop(stack)?;
                self.foreach(key.as_deref(), var, iterable, body)?;
            }
            Instr::If { then, otherwise } => {
                let branch = if pop(stack)?.truthy() { then } else { otherwise };
                self.exec(branch)?;
            }
            Instr::While { test, body } => {
                while self.eval(test)?.truthy() {
                    self.exec(body)?;
                }
            }
            Instr::Nocache(body) => {
                let spliced = self.is_recording();
                if let (true, Some(weave)) = (spliced, self.weave.as_mut()) {
                    weave.splice_block(body);
                    weave.suppress();
                }
                let result = self.exec(body);
                if let (true, Some(weave)) = (spliced, self.weave.as_mut()) {
                    weave.resume();
                }
                result?;
            }
            Instr::Insert(name) => {
                let template = Arc::clone(&self.template);
                match template.sections.get(name) {
                    Some(body) => self.exec(body)?,
                    None => tracing::debug!(section = %name, "insert of undefined section"),
                }
            }
            Instr::Frame {
                vars,
                sections,
                body,
            } => {
                let template = Arc::new(CompiledTemplate {
                    sections: sections.clone(),
                    ..CompiledTemplate::default()
                });
                self.framed(template, vars.clone(), body)?;
            }
        }
        Ok(())
    }

    /// Run `body` in a fresh frame seeded with `vars`, with `insert`
    /// resolving against `template`.
    fn framed(
        &mut self,
        template: Arc<CompiledTemplate>,
        vars: Vec<(String, Value)>,
        body: &[Instr],
    ) -> Result<(), Error> {
        let outer = std::mem::replace(&mut self.template, template);
        self.scope.push_frame();
        for (name, value) in vars {
            self.scope.set(&name, value);
        }
        let result = self.exec(body);
        self.scope.pop_frame();
        self.template = outer;
        result
    }

    fn range(
        &mut self,
        var: &str,
        lower: &Value,
        upper: &Value,
        step: &Value,
        body: &Program,
    ) -> Result<(), Error> {
        if let (Some(lo), Some(hi), Some(st)) = (integral(lower), integral(upper), integral(step)) {
            if st == 0 {
                return Err(Error::runtime("loop step cannot be zero"));
            }
            let mut i = lo;
            while (st > 0 && i <= hi) || (st < 0 && i >= hi) {
                self.scope.set(var, i);
                self.exec(body)?;
                match i.checked_add(st) {
                    Some(next) => i = next,
                    None => break,
                }
            }
            return Ok(());
        }

        let (lo, hi, st) = (lower.as_float(), upper.as_float(), step.as_float());
        if st == 0.0 || st.is_nan() {
            return Err(Error::runtime("loop step cannot be zero"));
        }
        let mut x = lo;
        while (st > 0.0 && x <= hi) || (st < 0.0 && x >= hi) {
            self.scope.set(var, x);
            self.exec(body)?;
            x += st;
        }
        Ok(())
    }

    fn foreach(
        &mut self,
        key: Option<&str>,
        var: &str,
        iterable: Value,
        body: &Program,
    ) -> Result<(), Error> {
        let items: Vec<(Value, Value)> = match iterable {
            Value::Null => return Ok(()),
            Value::Array(a) => a.iter().map(|(k, v)| (k.to_value(), v.clone())).collect(),
            Value::Object(obj) => match obj.iter() {
                Some(items) => items,
                None => {
                    tracing::warn!(object = obj.type_name(), "foreach over a non-iterable object");
                    return Ok(());
                }
            },
            other => {
                tracing::warn!(value = %other, kind = other.type_name(), "foreach over a scalar");
                return Ok(());
            }
        };
        for (k, v) in items {
            if let Some(key) = key {
                self.scope.set(key, k);
            }
            self.scope.set(var, v);
            self.exec(body)?;
        }
        Ok(())
    }

    // ── Call boundary ─────────────────────────────────────────────────────────

    fn invoke(&mut self, name: &str, args: Args, file: &str, line: usize) -> Result<Value, Error> {
        let registry = self.env.registry;
        let result = match registry.get(name) {
            Some(entry) => entry.target.invoke(args, &mut CallContext { vm: self }),
            None => Err(Error::runtime(format!("unknown function `{name}`"))),
        };
        self.boundary(result.map_err(|e| e.at(file, line)))
    }

    /// Route a failed call through the error policy; the call yields null.
    fn boundary(&mut self, result: Result<Value, Error>) -> Result<Value, Error> {
        match result {
            Ok(v) => Ok(v),
            Err(err) => {
                tracing::debug!(error = %err, "call failed");
                self.failures += 1;
                if let Some(marker) = self.env.policy.handle(err)? {
                    self.write(&marker);
                }
                Ok(Value::Null)
            }
        }
    }
}

fn pop(stack: &mut Vec<Value>) -> Result<Value, Error> {
    stack
        .pop()
        .ok_or_else(|| Error::Internal("operand stack underflow".into()))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<Vec<Value>, Error> {
    match stack.len().checked_sub(n) {
        Some(at) => Ok(stack.split_off(at)),
        None => Err(Error::Internal("operand stack underflow".into())),
    }
}

/// Integer view for range bounds; `None` sends the loop down the float path.
fn integral(v: &Value) -> Option<i64> {
    match v {
        Value::Int(n) => Some(*n),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Null => Some(0),
        Value::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ── CallContext ───────────────────────────────────────────────────────────────

/// What an engine-convention function can reach while it runs.
pub struct CallContext<'v, 'a> {
    vm: &'v mut Vm<'a>,
}

impl<'v, 'a> CallContext<'v, 'a> {
    /// Append to the render output (and the active recording).
    pub fn write(&mut self, text: &str) {
        self.vm.write(text);
    }

    pub fn escape(&self, text: &str) -> String {
        escape::escape(self.vm.env.mode, text)
    }

    pub fn mode(&self) -> OutputMode {
        self.vm.env.mode
    }

    pub fn scope(&self) -> &Scope {
        &*self.vm.scope
    }

    pub fn scope_mut(&mut self) -> &mut Scope {
        &mut *self.vm.scope
    }

    /// Render another template into the current output, in a fresh frame
    /// seeded with `vars`.
    pub fn include(&mut self, reference: &str, vars: Vec<(String, Value)>) -> Result<(), Error> {
        let vm = &mut *self.vm;
        if vm.includes >= MAX_INCLUDE_DEPTH {
            return Err(Error::runtime(format!(
                "include nesting deeper than {MAX_INCLUDE_DEPTH} at `{reference}`"
            )));
        }
        let (canonical, template) = vm.env.loader.load(reference)?;
        vm.referenced.insert(canonical);
        vm.referenced.extend(template.referenced.iter().cloned());

        let recording = vm.is_recording();
        if let (true, Some(weave)) = (recording, vm.weave.as_mut()) {
            weave.enter(vars.clone(), template.sections.clone());
        }
        vm.includes += 1;
        let result = vm.framed(Arc::clone(&template), vars, &template.main);
        vm.includes -= 1;
        if let (true, Some(weave)) = (recording, vm.weave.as_mut()) {
            weave.leave();
        }
        result
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::template::lexer::Delimiters;
    use crate::template::parser::compile;
    use crate::template::registry::Flags;

    struct MapLoader {
        registry: Registry,
        sources: HashMap<&'static str, &'static str>,
    }

    impl Loader for MapLoader {
        fn load(&self, reference: &str) -> Result<(String, Arc<CompiledTemplate>), Error> {
            let src = self
                .sources
                .get(reference)
                .ok_or_else(|| Error::usage(format!("no template `{reference}`")))?;
            let t = compile(reference, src, &Delimiters::default(), &self.registry)?;
            Ok((format!("mem:{reference}"), Arc::new(t)))
        }
    }

    fn registry() -> Registry {
        let mut reg = Registry::with_builtins();
        reg.register_native("upper", Flags::new(), |a| {
            Ok(Value::from(a.first().map(|v| v.to_string()).unwrap_or_default().to_uppercase()))
        });
        reg.register_native("fail", Flags::new(), |_| Err("boom".into()));
        reg
    }

    fn render(env: Env<'_>, scope: &mut Scope, template: Arc<CompiledTemplate>) -> Result<String, Error> {
        let mut vm = Vm::new(env, scope, template);
        let result = vm.run();
        let (out, _) = vm.finish();
        result.map(|()| out)
    }

    fn run_with(src: &str, scope: &mut Scope, policy: ErrorPolicy) -> Result<String, Error> {
        let loader = MapLoader {
            registry: registry(),
            sources: HashMap::from([
                ("greet", "Hello {$who}!"),
                ("deep", "{include(file=\"deep\")}"),
            ]),
        };
        let t = compile("t", src, &Delimiters::default(), &loader.registry)?;
        let env = Env {
            registry: &loader.registry,
            loader: &loader,
            mode: OutputMode::Html,
            policy,
        };
        render(env, scope, Arc::new(t))
    }

    fn run(src: &str) -> String {
        run_with(src, &mut Scope::new(), ErrorPolicy::Print).expect("render")
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("{2 + 3 * 4}|{(2 + 3) * 4}|{1 .. 2}"), "14|20|12");
    }

    #[test]
    fn division_by_zero_is_empty() {
        assert_eq!(run("[{1 / 0}][{5 % 0}]"), "[][]");
        assert_eq!(run("{$z = 0}[{1 / $z}]"), "[]");
    }

    #[test]
    fn folding_matches_runtime() {
        assert_eq!(run("{1 + 2}"), run("{$a = 1}{$b = 2}{$a + $b}"));
    }

    #[test]
    fn range_loops() {
        assert_eq!(run("{loop $i in 1, 5}{$i}{end}"), "12345");
        assert_eq!(run("{loop $i in 5, 1, -1}{$i}{end}"), "54321");
        assert_eq!(run("{loop $i in 1, 5, 2}{$i}{end}"), "135");
        assert_eq!(run("{loop $i in 0, 1, 0.5}{$i};{end}"), "0;0.5;1;");
    }

    #[test]
    fn zero_step_is_a_runtime_error() {
        let err = run_with("{loop $i in 1, 5, 0}{end}", &mut Scope::new(), ErrorPolicy::Print)
            .unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    fn foreach_arrays_and_scalars() {
        assert_eq!(
            run(r#"{foreach $k, $v in ["a" => 1, "b" => 2]}{$k}={$v};{end}"#),
            "a=1;b=2;"
        );
        assert_eq!(run("{foreach $v in [3, 4]}{$v}{end}"), "34");
        assert_eq!(run("{foreach $v in null}x{end}|{foreach $v in 5}x{end}"), "|");
    }

    #[test]
    fn while_and_if() {
        assert_eq!(run("{$n = 0}{while $n < 3}{$n}{$n = $n + 1}{end}"), "012");
        assert_eq!(run("{if 0}a{elseif 1}b{else}c{end}"), "b");
        assert_eq!(run("{if false}a{end}"), "");
    }

    #[test]
    fn escaping() {
        let mut scope = Scope::new();
        scope.set("html", "<b>");
        let out = run_with(
            "{$html}|{upper(s=$html)}|{upper(s=$html)|raw}",
            &mut scope,
            ErrorPolicy::Print,
        )
        .unwrap();
        assert_eq!(out, "<b>|&lt;B&gt;|<B>");
    }

    #[test]
    fn call_failures_follow_policy() {
        assert!(run("a{fail()}b").contains("[weave error: runtime error at t:1: boom]"));
        assert!(run("{nosuch()}").contains("unknown function `nosuch`"));
        assert_eq!(
            run_with("a{fail()}b", &mut Scope::new(), ErrorPolicy::Ignore).unwrap(),
            "ab"
        );
        assert!(run_with("a{fail()}b", &mut Scope::new(), ErrorPolicy::Throw).is_err());
    }

    #[test]
    fn method_on_non_object_fails_at_boundary() {
        assert!(run("{$x = 1}{$x.go()}").contains("cannot call method `go` on integer"));
    }

    #[test]
    fn include_uses_fresh_frame() {
        let mut scope = Scope::new();
        scope.set("who", "outer");
        let out = run_with(
            r#"{include(file="greet", who="inner")} {$who}"#,
            &mut scope,
            ErrorPolicy::Print,
        )
        .unwrap();
        assert_eq!(out, "Hello inner! outer");
    }

    #[test]
    fn include_depth_is_limited() {
        let out = run(r#"{include(file="deep")}"#);
        assert!(out.contains("include nesting deeper than 32"));
    }

    #[test]
    fn render_frame_is_popped() {
        let mut scope = Scope::new();
        run_with("{$tmp = 1}{if 1}{$inner = 2}{end}{$inner}", &mut scope, ErrorPolicy::Print)
            .unwrap();
        assert!(!scope.contains("tmp"));
        assert!(!scope.contains("inner"));
        assert_eq!(scope.depth(), 1);
    }

    #[test]
    fn missing_section_renders_nothing() {
        assert_eq!(run("a{insert nothing}b"), "ab");
    }

    #[test]
    fn default_modifier() {
        assert_eq!(run(r#"{$missing|default:"n/a"}|{"x"|default:"n/a"}"#), "n/a|x");
    }

    // ── Weave ─────────────────────────────────────────────────────────────────

    fn counting_registry(counter: Arc<AtomicI64>) -> Registry {
        let mut reg = Registry::with_builtins();
        reg.register_native("tick", Flags::new().volatile(), move |args| {
            let base = args.first().map(Value::as_int).unwrap_or(0);
            Ok(Value::Int(base + counter.fetch_add(1, Ordering::SeqCst)))
        });
        reg
    }

    fn woven_in(
        src: &str,
        reg: &Registry,
        loader: &dyn Loader,
        scope: &mut Scope,
    ) -> (String, Option<CompiledTemplate>) {
        let t = compile("t", src, &Delimiters::default(), reg).unwrap();
        let env = Env {
            registry: reg,
            loader,
            mode: OutputMode::Html,
            policy: ErrorPolicy::Print,
        };
        let mut vm = Vm::new(env, scope, Arc::new(t)).with_weave();
        vm.run().unwrap();
        vm.finish()
    }

    fn woven(src: &str, reg: &Registry) -> (String, CompiledTemplate) {
        let (out, artifact) = woven_in(src, reg, &NoTemplates, &mut Scope::new());
        (out, artifact.unwrap())
    }

    fn replay(artifact: CompiledTemplate, reg: &Registry) -> String {
        let env = Env {
            registry: reg,
            loader: &NoTemplates,
            mode: OutputMode::Html,
            policy: ErrorPolicy::Print,
        };
        render(env, &mut Scope::new(), Arc::new(artifact)).unwrap()
    }

    fn widgets(reg: Registry) -> MapLoader {
        MapLoader {
            registry: reg,
            sources: HashMap::from([
                ("plain", "[{$who}]"),
                ("args", "<{nocache}{$who}{end}>"),
                ("sections", "{section s}S{$who}{end}<{nocache}{insert s}{end}>"),
                ("ticking", "<{tick() .. $who}>"),
            ]),
        }
    }

    #[test]
    fn static_content_collapses_to_one_echo() {
        let reg = Registry::with_builtins();
        let (out, artifact) = woven("{$x = 2}a{$x * 3}{loop $i in 1,3}{$i}{end}", &reg);
        assert_eq!(out, "a6123");
        assert_eq!(artifact.main, vec![Instr::Echo("a6123".into())]);
        assert_eq!(replay(artifact, &reg), out);
    }

    #[test]
    fn nocache_block_stays_live() {
        let counter = Arc::new(AtomicI64::new(0));
        let reg = counting_registry(Arc::clone(&counter));
        let (out, artifact) = woven("<p>{nocache}{tick()}{end}</p>", &reg);
        assert_eq!(out, "<p>0</p>");
        assert_eq!(replay(artifact.clone(), &reg), "<p>1</p>");
        assert_eq!(replay(artifact, &reg), "<p>2</p>");
    }

    #[test]
    fn volatile_call_freezes_loop_arguments() {
        let counter = Arc::new(AtomicI64::new(0));
        let reg = counting_registry(Arc::clone(&counter));
        let (out, artifact) = woven("{loop $i in 1, 2}[{tick(base=$i * 10) + 1}]{end}", &reg);
        assert_eq!(out, "[11][22]");
        // Replays re-run the call with the frozen arguments 10 and 20.
        assert_eq!(replay(artifact, &reg), "[13][24]");
    }

    #[test]
    fn static_include_stays_one_echo() {
        let loader = widgets(Registry::with_builtins());
        let (out, artifact) = woven_in(
            r#"P{include(file="plain", who="x")}Q"#,
            &loader.registry,
            &loader,
            &mut Scope::new(),
        );
        assert_eq!(out, "P[x]Q");
        assert_eq!(artifact.unwrap().main, vec![Instr::Echo("P[x]Q".into())]);
    }

    #[test]
    fn nocache_inside_include_keeps_its_arguments() {
        let loader = widgets(Registry::with_builtins());
        let (out, artifact) = woven_in(
            r#"P{include(file="args", who="inner")}Q"#,
            &loader.registry,
            &loader,
            &mut Scope::new(),
        );
        assert_eq!(out, "P<inner>Q");
        assert_eq!(replay(artifact.unwrap(), &loader.registry), "P<inner>Q");
    }

    #[test]
    fn nocache_inside_include_inserts_its_own_sections() {
        let loader = widgets(Registry::with_builtins());
        let (out, artifact) = woven_in(
            r#"{section s}outer{end}P{include(file="sections", who="!")}Q{insert s}"#,
            &loader.registry,
            &loader,
            &mut Scope::new(),
        );
        assert_eq!(out, "P<S!>Qouter");
        assert_eq!(replay(artifact.unwrap(), &loader.registry), "P<S!>Qouter");
    }

    #[test]
    fn volatile_call_inside_include_replays_in_its_frame() {
        let counter = Arc::new(AtomicI64::new(0));
        let loader = widgets(counting_registry(Arc::clone(&counter)));
        let (out, artifact) = woven_in(
            r#"{include(file="ticking", who="a")}|{include(file="ticking", who="b")}"#,
            &loader.registry,
            &loader,
            &mut Scope::new(),
        );
        assert_eq!(out, "<0a>|<1b>");
        assert_eq!(replay(artifact.unwrap(), &loader.registry), "<2a>|<3b>");
    }

    #[test]
    fn frozen_host_object_is_not_recorded() {
        #[derive(Debug)]
        struct Clock;
        impl crate::template::Object for Clock {}

        let counter = Arc::new(AtomicI64::new(0));
        let reg = counting_registry(counter);
        let mut scope = Scope::new();
        scope.set("clock", Value::Object(Arc::new(Clock)));
        let (out, artifact) = woven_in("{tick(base=$clock)}", &reg, &NoTemplates, &mut scope);
        // Objects count as 1 in arithmetic.
        assert_eq!(out, "1");
        assert!(artifact.is_none());
    }
}
