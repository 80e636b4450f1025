//! Built-in template functions.
//!
//! Only the structural pieces every engine needs live here; hosts add their
//! own library through [`Registry::register`] and
//! [`Registry::register_native`].

use crate::error::Error;

use super::registry::{Args, Flags, Registry};
use super::value::Value;
use super::vm::CallContext;

/// Maximum `include` nesting before the call fails.
pub const MAX_INCLUDE_DEPTH: usize = 32;

pub fn register_all(reg: &mut Registry) {
    reg.register("include", Flags::new().raw().silent(), include);
    reg.register_native("raw", Flags::new().raw(), |args| {
        Ok(args.first().cloned().unwrap_or_default())
    });
    reg.register("escape", Flags::new().raw(), |args, cx| {
        let text = args.at(0).map(|v| v.to_string()).unwrap_or_default();
        Ok(Value::Str(cx.escape(&text)))
    });
    reg.register_native("default", Flags::new().raw(), |args| {
        let input = args.first().cloned().unwrap_or_default();
        let empty = match &input {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            _ => false,
        };
        Ok(if empty {
            args.get(1).cloned().unwrap_or_default()
        } else {
            input
        })
    });
}

/// `include(file="name", key=value, ...)`
fn include(args: &Args, cx: &mut CallContext<'_, '_>) -> Result<Value, Error> {
    let file = match args.get("file") {
        Some(Value::Str(s)) if !s.is_empty() => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => return Err(Error::runtime("include: missing `file` argument")),
    };
    let vars = args
        .named
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("file"))
        .cloned()
        .collect();
    cx.include(&file, vars)?;
    Ok(Value::Null)
}
