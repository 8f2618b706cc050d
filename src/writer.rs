//! Serialize host values into text the remote reader accepts.

use std::fmt::Write as _;

use crate::error::EncodingError;
use crate::reader::{character_name, parse_number};
use crate::symbol::Symbol;
use crate::value::{SessionId, Value};

/// Encodes [`Value`]s as remote syntax.
///
/// A writer bound to a session refuses foreign handles minted by any other
/// session; a detached writer accepts all of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Writer {
    session: Option<SessionId>,
}

impl Writer {
    /// A writer not bound to any session.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(session: SessionId) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn write(&self, value: &Value) -> Result<String, EncodingError> {
        let mut out = String::new();
        self.write_into(&mut out, value)?;
        Ok(out)
    }

    fn write_into(&self, out: &mut String, value: &Value) -> Result<(), EncodingError> {
        match value {
            Value::Nil | Value::Bool(false) => out.push_str("NIL"),
            Value::Bool(true) => out.push('T'),
            Value::Integer(n) => push_display(out, n),
            Value::BigInteger(n) => push_display(out, n),
            Value::Ratio(r) => push_display(out, r),
            Value::SingleFloat(f) => {
                if !f.is_finite() {
                    return Err(EncodingError::NonFiniteFloat(f.to_string()));
                }
                let _ = write!(out, "{:E}", f);
            }
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(EncodingError::NonFiniteFloat(f.to_string()));
                }
                out.push_str(&format!("{:E}", f).replace('E', "D"));
            }
            Value::Complex(re, im) => {
                out.push_str("#C(");
                self.write_into(out, re)?;
                out.push(' ');
                self.write_into(out, im)?;
                out.push(')');
            }
            Value::Char(c) => {
                out.push_str("#\\");
                match character_name(*c) {
                    Some(name) => out.push_str(name),
                    None => out.push(*c),
                }
            }
            Value::String(s) => write_string(out, s),
            Value::Symbol(sym) => write_symbol(out, sym),
            Value::Pair(_) => {
                out.push('(');
                let mut items = value.iter();
                let mut first = true;
                for item in items.by_ref() {
                    if !first {
                        out.push(' ');
                    }
                    first = false;
                    self.write_into(out, item)?;
                }
                let tail = items.rest();
                if !tail.is_nil() {
                    out.push_str(" . ");
                    self.write_into(out, tail)?;
                }
                out.push(')');
            }
            Value::Vector(items) => {
                out.push_str("#(");
                self.write_sequence(out, items.iter())?;
                out.push(')');
            }
            Value::HashTable(entries) => {
                out.push('{');
                self.write_sequence(out, entries.iter().flat_map(|(k, v)| [k, v]))?;
                out.push('}');
            }
            Value::Package(pkg) => return Err(EncodingError::Package(pkg.name.clone())),
            Value::Foreign(obj) => {
                if self.session.is_some_and(|s| s != obj.session()) {
                    return Err(EncodingError::ForeignSession {
                        handle: obj.handle(),
                    });
                }
                let _ = write!(out, "#{}?", obj.handle());
            }
        }
        Ok(())
    }

    fn write_sequence<'v>(
        &self,
        out: &mut String,
        items: impl Iterator<Item = &'v Value>,
    ) -> Result<(), EncodingError> {
        for (i, item) in items.enumerate() {
            if i > 0 {
                out.push(' ');
            }
            self.write_into(out, item)?;
        }
        Ok(())
    }
}

/// Encode with a detached writer.
pub fn to_lisp(value: &Value) -> Result<String, EncodingError> {
    Writer::new().write(value)
}

fn push_display(out: &mut String, value: &impl std::fmt::Display) {
    let _ = write!(out, "{}", value);
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// `:NAME` for keywords, `NAMESPACE::NAME` otherwise.
fn write_symbol(out: &mut String, sym: &Symbol) {
    match sym.namespace() {
        Some(ns) => {
            write_name(out, ns);
            out.push_str("::");
        }
        None => out.push(':'),
    }
    write_name(out, sym.name());
}

fn write_name(out: &mut String, name: &str) {
    if !needs_escape(name) {
        out.push_str(name);
        return;
    }
    out.push('|');
    for c in name.chars() {
        if c == '|' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('|');
}

/// A name must be wrapped in `|...|` if reading it back unescaped would
/// change its case, split it, or turn it into a number or dot.
fn needs_escape(name: &str) -> bool {
    name.is_empty()
        || name.chars().all(|c| c == '.')
        || parse_number(name).is_some()
        || name.chars().any(|c| {
            c.is_whitespace()
                || c.to_uppercase().ne(std::iter::once(c))
                || matches!(
                    c,
                    '(' | ')' | '"' | '\'' | ';' | '`' | ',' | '{' | '}' | '|' | '\\' | ':' | '#'
                )
        })
}
