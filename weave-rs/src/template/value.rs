//! Runtime value type.
//!
//! Templates are dynamically typed; every opcode dispatches on the tagged
//! [`Value`] with an exhaustive match.  The arithmetic and comparison helpers
//! here are shared by the VM and by the compiler's constant folder, so a
//! folded expression always produces exactly what the VM would have.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bytecode::BinOp;

// ── Object ────────────────────────────────────────────────────────────────────

/// A host-provided value with properties and methods.
///
/// Objects only exist at render time; they cannot be written into a cache
/// artifact.  A render that would have to freeze one (as an operand of a
/// volatile call, or as an `include` argument around live content) is not
/// stored in the HTML cache.
pub trait Object: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str {
        "object"
    }

    /// Property lookup for `$obj.name`, `$obj->name` and `$obj["name"]`.
    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Method invocation for `$obj.name(args)`.
    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value, String> {
        Err(format!("{} has no method `{name}`", self.type_name()))
    }

    /// `(key, value)` pairs for `foreach`, or `None` if not iterable.
    fn iter(&self) -> Option<Vec<(Value, Value)>> {
        None
    }

    /// Text used when the object is printed.
    fn to_text(&self) -> String {
        self.type_name().to_owned()
    }
}

// ── Key / Array ───────────────────────────────────────────────────────────────

/// Array key: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Normalise a value into a key; decimal-integer strings become `Int`.
    pub fn from_value(v: &Value) -> Key {
        match v {
            Value::Int(n) => Key::Int(*n),
            Value::Float(x) => Key::Int(*x as i64),
            Value::Bool(b) => Key::Int(i64::from(*b)),
            Value::Str(s) => match s.parse::<i64>() {
                Ok(n) if n.to_string() == *s => Key::Int(n),
                _ => Key::Str(s.clone()),
            },
            other => Key::Str(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::Int(*n),
            Key::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Insertion-ordered map, auto-indexed like a list when no key is given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Array {
    entries: Vec<(Key, Value)>,
}

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append with the next free integer key.
    pub fn push(&mut self, value: Value) {
        let next = self
            .entries
            .iter()
            .filter_map(|(k, _)| match k {
                Key::Int(n) => Some(*n + 1),
                Key::Str(_) => None,
            })
            .max()
            .unwrap_or(0)
            .max(0);
        self.entries.push((Key::Int(next), value));
    }

    /// Insert or replace the value stored under `key`.
    pub fn insert(&mut self, key: Key, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Build an array literal: keyed slots insert, `None` slots auto-index.
    pub fn from_slots(keys: &[Option<Value>], values: Vec<Value>) -> Array {
        let mut a = Array::new();
        for (key, value) in keys.iter().zip(values) {
            match key {
                Some(k) => a.insert(Key::from_value(k), value),
                None => a.push(value),
            }
        }
        a
    }

    /// Key union: entries of `self`, then entries of `other` whose key is new.
    pub fn union(&self, other: &Array) -> Array {
        let mut out = self.clone();
        for (k, v) in &other.entries {
            if !out.contains_key(k) {
                out.entries.push((k.clone(), v.clone()));
            }
        }
        out
    }
}

impl FromIterator<Value> for Array {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut a = Array::new();
        for v in iter {
            a.push(v);
        }
        a
    }
}

impl FromIterator<(Key, Value)> for Array {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut a = Array::new();
        for (k, v) in iter {
            a.insert(k, v);
        }
        a
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// A template runtime value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Array),
    #[serde(skip)]
    Object(Arc<dyn Object>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(true) => f.write_str("1"),
            Value::Bool(false) => Ok(()),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => {
                // Integral floats print without a fractional part.
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
                    write!(f, "{}", *x as i64)
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => f.write_str(s),
            Value::Array(_) => f.write_str("Array"),
            Value::Object(o) => f.write_str(&o.to_text()),
        }
    }
}

/// Numeric view of a value used by arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::I(n) => n as f64,
            Num::F(x) => x,
        }
    }
}

impl Value {
    /// Truthiness: null, `false`, `0`, `0.0`, `""`, `"0"` and `[]` are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty() && s != "0",
            Value::Array(a) => !a.is_empty(),
            Value::Object(_) => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// False if a host object is reachable from this value, which a cache
    /// artifact cannot hold.
    pub fn is_persistable(&self) -> bool {
        match self {
            Value::Object(_) => false,
            Value::Array(a) => a.values().all(Value::is_persistable),
            _ => true,
        }
    }

    /// Name of the type, for diagnostics.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(o) => o.type_name(),
        }
    }

    /// Int or Float, or a string that parses as one.
    pub fn is_numeric(&self) -> bool {
        match self {
            Value::Int(_) | Value::Float(_) => true,
            Value::Str(s) => parse_num(s).is_some(),
            _ => false,
        }
    }

    fn to_num(&self) -> Num {
        match self {
            Value::Int(n) => Num::I(*n),
            Value::Float(x) => Num::F(*x),
            Value::Bool(b) => Num::I(i64::from(*b)),
            Value::Null => Num::I(0),
            Value::Str(s) => parse_num(s).unwrap_or(Num::I(0)),
            Value::Array(a) => Num::I(i64::from(!a.is_empty())),
            Value::Object(_) => Num::I(1),
        }
    }

    /// Coerce to `i64` (floats truncate, unparseable strings give 0).
    pub fn as_int(&self) -> i64 {
        match self.to_num() {
            Num::I(n) => n,
            Num::F(x) => x as i64,
        }
    }

    /// Coerce to `f64`.
    pub fn as_float(&self) -> f64 {
        self.to_num().as_f64()
    }

    // ── Operators ─────────────────────────────────────────────────────────────

    /// Evaluate a binary operator.  Never fails: division and modulo by zero
    /// yield null.
    pub fn binary(op: BinOp, l: &Value, r: &Value) -> Value {
        match op {
            BinOp::Add => l.add(r),
            BinOp::Sub => arith(l, r, i64::checked_sub, |a, b| a - b),
            BinOp::Mul => arith(l, r, i64::checked_mul, |a, b| a * b),
            BinOp::Div => l.div(r),
            BinOp::Mod => {
                let b = r.as_int();
                if b == 0 {
                    Value::Null
                } else {
                    Value::Int(l.as_int().checked_rem(b).unwrap_or(0))
                }
            }
            BinOp::Concat => Value::Str(format!("{l}{r}")),
            BinOp::Eq => Value::Bool(l.loose_cmp(r) == Some(Ordering::Equal)),
            BinOp::Ne => Value::Bool(l.loose_cmp(r) != Some(Ordering::Equal)),
            BinOp::Lt => Value::Bool(l.loose_cmp(r) == Some(Ordering::Less)),
            BinOp::Le => Value::Bool(matches!(
                l.loose_cmp(r),
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinOp::Gt => Value::Bool(l.loose_cmp(r) == Some(Ordering::Greater)),
            BinOp::Ge => Value::Bool(matches!(
                l.loose_cmp(r),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinOp::And => Value::Bool(l.truthy() && r.truthy()),
            BinOp::Or => Value::Bool(l.truthy() || r.truthy()),
            BinOp::In => Value::Bool(r.contains(l)),
            BinOp::NotIn => Value::Bool(!r.contains(l)),
        }
    }

    /// `+`: numbers add, arrays union, anything else concatenates.
    fn add(&self, rhs: &Value) -> Value {
        match (self, rhs) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                arith(self, rhs, i64::checked_add, |a, b| a + b)
            }
            (Value::Array(a), Value::Array(b)) => Value::Array(a.union(b)),
            _ => Value::Str(format!("{self}{rhs}")),
        }
    }

    fn div(&self, rhs: &Value) -> Value {
        match (self.to_num(), rhs.to_num()) {
            (_, Num::I(0)) => Value::Null,
            (_, Num::F(b)) if b == 0.0 => Value::Null,
            (Num::I(a), Num::I(b)) => match (a.checked_rem(b), a.checked_div(b)) {
                (Some(0), Some(q)) => Value::Int(q),
                _ => Value::Float(a as f64 / b as f64),
            },
            (a, b) => Value::Float(a.as_f64() / b.as_f64()),
        }
    }

    pub fn negate(&self) -> Value {
        match self.to_num() {
            Num::I(n) => n.checked_neg().map_or(Value::Float(-(n as f64)), Value::Int),
            Num::F(x) => Value::Float(-x),
        }
    }

    pub fn not(&self) -> Value {
        Value::Bool(!self.truthy())
    }

    /// Loose comparison used by `==`, `<` and friends.
    pub fn loose_cmp(&self, rhs: &Value) -> Option<Ordering> {
        match (self, rhs) {
            (Value::Bool(_) | Value::Null, _) | (_, Value::Bool(_) | Value::Null) => {
                Some(self.truthy().cmp(&rhs.truthy()))
            }
            (Value::Array(a), Value::Array(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    a.len().partial_cmp(&b.len()).filter(|o| *o != Ordering::Equal)
                }
            }
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            _ if self.is_numeric() && rhs.is_numeric() => {
                self.as_float().partial_cmp(&rhs.as_float())
            }
            _ => Some(self.to_string().cmp(&rhs.to_string())),
        }
    }

    /// Membership: array value, substring, or object iteration value.
    pub fn contains(&self, needle: &Value) -> bool {
        match self {
            Value::Array(a) => a
                .values()
                .any(|v| v.loose_cmp(needle) == Some(Ordering::Equal)),
            Value::Str(s) => s.contains(&needle.to_string()),
            Value::Object(o) => o.iter().is_some_and(|items| {
                items
                    .iter()
                    .any(|(_, v)| v.loose_cmp(needle) == Some(Ordering::Equal))
            }),
            _ => false,
        }
    }

    /// Element or property access; missing entries give null.
    pub fn index(&self, key: &Value) -> Value {
        match self {
            Value::Array(a) => a.get(&Key::from_value(key)).cloned().unwrap_or_default(),
            Value::Str(s) => {
                let i = key.as_int();
                if i < 0 || !key.is_numeric() {
                    return Value::Null;
                }
                s.chars()
                    .nth(i as usize)
                    .map_or(Value::Null, |c| Value::Str(c.to_string()))
            }
            Value::Object(o) => o.get(&key.to_string()).unwrap_or_default(),
            _ => Value::Null,
        }
    }
}

fn parse_num(s: &str) -> Option<Num> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Some(Num::I(n));
    }
    t.parse::<f64>().ok().filter(|x| x.is_finite()).map(Num::F)
}

/// Integer arithmetic when both sides are integral and the result fits,
/// float arithmetic otherwise.
fn arith(
    l: &Value,
    r: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Value {
    match (l.to_num(), r.to_num()) {
        (Num::I(a), Num::I(b)) => int_op(a, b)
            .map_or_else(|| Value::Float(float_op(a as f64, b as f64)), Value::Int),
        (a, b) => Value::Float(float_op(a.as_f64(), b.as_f64())),
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items.into_iter().collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, l: impl Into<Value>, r: impl Into<Value>) -> Value {
        Value::binary(op, &l.into(), &r.into())
    }

    #[test]
    fn display() {
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::Bool(true).to_string(), "1");
        assert_eq!(Value::Bool(false).to_string(), "");
        assert_eq!(Value::Null.to_string(), "");
    }

    #[test]
    fn truthy() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Str("0".into()).truthy());
        assert!(!Value::Str("".into()).truthy());
        assert!(Value::Str("a".into()).truthy());
        assert!(!Value::Array(Array::new()).truthy());
        assert!(Value::Float(0.5).truthy());
    }

    #[test]
    fn add_dispatches_on_type() {
        assert_eq!(bin(BinOp::Add, 2, 3), Value::Int(5));
        assert_eq!(bin(BinOp::Add, 2, 0.5), Value::Float(2.5));
        assert_eq!(bin(BinOp::Add, "2", 3), Value::Str("23".into()));
        let a: Value = vec![Value::Int(1)].into();
        let b: Value = vec![Value::Int(9), Value::Int(2)].into();
        let Value::Array(u) = bin(BinOp::Add, a, b) else {
            panic!("expected array")
        };
        let vals: Vec<_> = u.values().cloned().collect();
        assert_eq!(vals, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn division() {
        assert_eq!(bin(BinOp::Div, 10, 2), Value::Int(5));
        assert_eq!(bin(BinOp::Div, 7, 2), Value::Float(3.5));
        assert_eq!(bin(BinOp::Div, 1, 0), Value::Null);
        assert_eq!(bin(BinOp::Div, 1, 0.0), Value::Null);
        assert_eq!(bin(BinOp::Mod, 7, 0), Value::Null);
        assert_eq!(bin(BinOp::Mod, 7, 3), Value::Int(1));
    }

    #[test]
    fn overflow_falls_back_to_float() {
        assert_eq!(bin(BinOp::Add, i64::MAX, 1), Value::Float(i64::MAX as f64 + 1.0));
        assert_eq!(Value::Int(i64::MIN).negate(), Value::Float(-(i64::MIN as f64)));
    }

    #[test]
    fn concat() {
        assert_eq!(bin(BinOp::Concat, 1, 2), Value::Str("12".into()));
    }

    #[test]
    fn comparison() {
        assert_eq!(bin(BinOp::Eq, "3", 3), Value::Bool(true));
        assert_eq!(bin(BinOp::Lt, "abc", "abd"), Value::Bool(true));
        assert_eq!(bin(BinOp::Gt, 10, "9"), Value::Bool(true));
        assert_eq!(bin(BinOp::Eq, Value::Null, ""), Value::Bool(true));
        assert_eq!(bin(BinOp::Ne, true, 0), Value::Bool(true));
    }

    #[test]
    fn logical_evaluates_both() {
        assert_eq!(bin(BinOp::And, 1, "x"), Value::Bool(true));
        assert_eq!(bin(BinOp::Or, 0, ""), Value::Bool(false));
    }

    #[test]
    fn membership() {
        let list: Value = vec![Value::Int(1), Value::Str("b".into())].into();
        assert_eq!(bin(BinOp::In, "b", list.clone()), Value::Bool(true));
        assert_eq!(bin(BinOp::NotIn, 3, list), Value::Bool(true));
        assert_eq!(bin(BinOp::In, "ell", "hello"), Value::Bool(true));
    }

    #[test]
    fn index() {
        let mut a = Array::new();
        a.insert(Key::Str("name".into()), Value::from("ada"));
        a.push(Value::Int(7));
        let v = Value::Array(a);
        assert_eq!(v.index(&"name".into()), Value::from("ada"));
        assert_eq!(v.index(&Value::Int(0)), Value::Int(7));
        assert_eq!(v.index(&"0".into()), Value::Int(7));
        assert_eq!(v.index(&"missing".into()), Value::Null);
        assert_eq!(Value::from("hey").index(&Value::Int(1)), Value::from("e"));
    }

    #[test]
    fn push_uses_next_int_key() {
        let mut a = Array::new();
        a.insert(Key::Int(5), Value::Null);
        a.push(Value::Int(1));
        assert!(a.contains_key(&Key::Int(6)));
    }

    #[test]
    fn object_is_not_serializable() {
        #[derive(Debug)]
        struct Thing;
        impl Object for Thing {}
        let v = Value::Object(Arc::new(Thing));
        assert!(serde_json::to_string(&v).is_err());
        assert!(serde_json::to_string(&Value::Int(1)).is_ok());
    }
}
