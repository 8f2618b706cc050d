//! Symbols, namespaces, and case normalization.
//!
//! Remote symbol names are stored in wire form: the remote reader upcases
//! unescaped characters, so `car` arrives as `CAR`. Host code refers to
//! the same names in lowercase (`car`, `find-package`). [`to_wire_case`]
//! and [`to_host_case`] convert between the two and are exact inverses
//! for identifiers made of letters, digits, hyphens and underscores.
//!
//! Each session owns a [`SymbolTable`]; decoding the same
//! `(name, namespace)` pair twice yields the same [`Symbol`] allocation.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Canonical name of the standard namespace.
pub const COMMON_LISP: &str = "COMMON-LISP";

/// Namespace the remote side starts in.
pub const COMMON_LISP_USER: &str = "COMMON-LISP-USER";

/// Namespace defined by the bootstrap script.
pub const BRIDGE_NAMESPACE: &str = "LISP-BRIDGE";

/// Convert a host-convention identifier to the remote uppercase convention.
pub fn to_wire_case(name: &str) -> String {
    name.to_uppercase()
}

/// Convert a remote identifier to the host lowercase convention.
pub fn to_host_case(name: &str) -> String {
    name.to_lowercase()
}

/// Normalize a member accessor name for lookup.
///
/// Accepts both `slot-value` and `slot_value` spellings.
pub fn member_key(name: &str) -> String {
    to_wire_case(name).replace('_', "-")
}

/// A namespace-qualified name split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualifiedName<'a> {
    /// Namespace prefix; `None` when absent or for keywords.
    pub namespace: Option<&'a str>,
    /// Symbol name after the separator.
    pub name: &'a str,
    /// Leading colon with no namespace.
    pub keyword: bool,
    /// Separator was `::` rather than `:`.
    pub internal: bool,
}

/// Split `NAMESPACE:NAME`, `NAMESPACE::NAME`, `:NAME` or `NAME` on the
/// first colon.
pub fn split_qualified(token: &str) -> QualifiedName<'_> {
    match token.find(':') {
        None => QualifiedName {
            namespace: None,
            name: token,
            keyword: false,
            internal: false,
        },
        Some(pos) => {
            let rest = &token[pos + 1..];
            let (name, internal) = match rest.strip_prefix(':') {
                Some(name) => (name, true),
                None => (rest, false),
            };
            if pos == 0 {
                QualifiedName {
                    namespace: None,
                    name,
                    keyword: true,
                    internal,
                }
            } else {
                QualifiedName {
                    namespace: Some(&token[..pos]),
                    name,
                    keyword: false,
                    internal,
                }
            }
        }
    }
}

/// Join a namespace and name with the internal (`::`) separator, or
/// produce `:NAME` for keywords.
pub fn join_qualified(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}::{}", ns, name),
        None => format!(":{}", name),
    }
}

#[derive(Debug)]
struct SymbolData {
    name: String,
    namespace: Option<String>,
}

/// A remote symbol, identified by name and namespace.
///
/// Keywords have no namespace. Two symbols are equal when both name and
/// namespace match; symbols from the same table are additionally
/// pointer-identical.
#[derive(Clone)]
pub struct Symbol(Arc<SymbolData>);

impl Symbol {
    /// Build a symbol from wire-form parts without interning.
    pub fn new(name: impl Into<String>, namespace: Option<impl Into<String>>) -> Self {
        Symbol(Arc::new(SymbolData {
            name: name.into(),
            namespace: namespace.map(Into::into),
        }))
    }

    /// Build a keyword symbol.
    pub fn keyword(name: impl Into<String>) -> Self {
        Symbol::new(name, None::<String>)
    }

    /// Wire-form name, e.g. `FIND-PACKAGE`.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Namespace, or `None` for keywords.
    pub fn namespace(&self) -> Option<&str> {
        self.0.namespace.as_deref()
    }

    pub fn is_keyword(&self) -> bool {
        self.0.namespace.is_none()
    }

    /// Host-convention accessor name, e.g. `find-package`.
    pub fn host_name(&self) -> String {
        to_host_case(&self.0.name)
    }

    /// `NAMESPACE::NAME` or `:NAME`.
    pub fn qualified_name(&self) -> String {
        join_qualified(self.namespace(), self.name())
    }

    /// True if both handles point at the same interned allocation.
    pub fn ptr_eq(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || (self.0.name == other.0.name && self.0.namespace == other.0.namespace)
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
        self.0.namespace.hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.qualified_name())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{}:{}", ns, self.name()),
            None => write!(f, ":{}", self.name()),
        }
    }
}

/// Per-session intern table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<(Option<String>, String), Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a wire-form `(name, namespace)` pair.
    pub fn intern(&mut self, name: &str, namespace: Option<&str>) -> Symbol {
        let key = (namespace.map(str::to_string), name.to_string());
        self.symbols
            .entry(key)
            .or_insert_with(|| Symbol::new(name, namespace))
            .clone()
    }

    /// Intern a symbol in the standard namespace.
    pub fn common_lisp(&mut self, name: &str) -> Symbol {
        self.intern(name, Some(COMMON_LISP))
    }

    /// Intern a keyword.
    pub fn keyword(&mut self, name: &str) -> Symbol {
        self.intern(name, None)
    }

    /// Resolve a host-written designator such as `cl:find-package`,
    /// `:test` or `car`. Unqualified names land in `current_namespace`.
    pub fn designator(&mut self, designator: &str, current_namespace: &str) -> Symbol {
        let parts = split_qualified(designator);
        let name = to_wire_case(parts.name);
        if parts.keyword {
            return self.keyword(&name);
        }
        let namespace = match parts.namespace {
            Some(ns) => to_wire_case(ns),
            None => current_namespace.to_string(),
        };
        self.intern(&name, Some(&namespace))
    }

    /// Number of distinct symbols interned so far.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
