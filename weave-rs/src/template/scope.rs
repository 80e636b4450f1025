//! Variable scope: a stack of name → value frames.
//!
//! The bottom frame holds host-assigned globals.  Each top-level render
//! (and each `include`) pushes one frame and pops it when done; blocks inside
//! a template share their enclosing frame.  Names are case-insensitive.

use std::collections::HashMap;

use super::value::Value;

#[derive(Debug, Default, Clone)]
struct Frame {
    vars: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    /// Innermost frame last; never empty.
    frames: Vec<Frame>,
}

impl Default for Scope {
    fn default() -> Self {
        Scope {
            frames: vec![Frame::default()],
        }
    }
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable in the innermost frame.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        if let Some(top) = self.frames.last_mut() {
            top.vars.insert(name.to_ascii_lowercase(), value.into());
        }
    }

    /// Look a variable up, innermost frame first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let key = name.to_ascii_lowercase();
        self.frames.iter().rev().find_map(|f| f.vars.get(&key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Pop the innermost frame.  The base frame is never popped.
    pub fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_case_insensitive() {
        let mut scope = Scope::new();
        scope.set("Name", "ada");
        assert_eq!(scope.get("NAME"), Some(&Value::from("ada")));
    }

    #[test]
    fn inner_frame_shadows_and_pops() {
        let mut scope = Scope::new();
        scope.set("x", 1);
        scope.push_frame();
        scope.set("x", 2);
        scope.set("y", 3);
        assert_eq!(scope.get("x"), Some(&Value::Int(2)));
        scope.pop_frame();
        assert_eq!(scope.get("x"), Some(&Value::Int(1)));
        assert!(!scope.contains("y"));
    }

    #[test]
    fn lookup_sees_outer_frames() {
        let mut scope = Scope::new();
        scope.set("site", "example");
        scope.push_frame();
        assert_eq!(scope.get("site"), Some(&Value::from("example")));
    }

    #[test]
    fn base_frame_survives_extra_pops() {
        let mut scope = Scope::new();
        scope.set("keep", true);
        scope.pop_frame();
        scope.pop_frame();
        assert_eq!(scope.depth(), 1);
        assert!(scope.contains("keep"));
    }
}
