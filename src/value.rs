//! Host-side representation of remote data.
//!
//! [`Value`] covers everything the reader can produce and the writer can
//! emit: atoms, symbols, pair chains, vectors, hash tables, package
//! snapshots and handles to objects that only exist on the remote side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, ToPrimitive};

use crate::bridge::ProxyId;
use crate::symbol::{to_host_case, Symbol, COMMON_LISP};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the session a foreign handle was minted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate a fresh process-unique id.
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A decoded remote value.
#[derive(Debug, Clone)]
pub enum Value {
    /// The empty list / nil sentinel.
    Nil,
    /// Host boolean. `true` reads back from `T`; `false` is sent as `NIL`.
    Bool(bool),
    Integer(i64),
    /// Integers outside the `i64` range.
    BigInteger(BigInt),
    /// Normalized ratio with denominator greater than one.
    Ratio(BigRational),
    SingleFloat(f32),
    Float(f64),
    Complex(Box<Value>, Box<Value>),
    Char(char),
    String(String),
    Symbol(Symbol),
    Pair(Arc<Pair>),
    Vector(Vec<Value>),
    /// Hash table entries in wire order.
    HashTable(Vec<(Value, Value)>),
    Package(Package),
    Foreign(ForeignObject),
}

/// A two-slot cell. Chains of pairs ending in [`Value::Nil`] are lists.
///
/// Dropping, comparing and formatting walk the tail chain in a loop, so
/// list length never costs stack depth. Nesting through heads still does.
#[derive(Clone)]
pub struct Pair {
    pub head: Value,
    pub tail: Value,
}

impl Drop for Pair {
    fn drop(&mut self) {
        let mut tail = std::mem::replace(&mut self.tail, Value::Nil);
        while let Value::Pair(next) = tail {
            match Arc::try_unwrap(next) {
                Ok(mut pair) => tail = std::mem::replace(&mut pair.tail, Value::Nil),
                // Still shared; the other owner drops the rest.
                Err(_) => break,
            }
        }
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head && chains_eq(&self.tail, &other.tail)
    }
}

impl fmt::Debug for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.tail.iter();
        let mut list = f.debug_list();
        list.entry(&self.head).entries(rest.by_ref());
        let tail = rest.rest();
        if !tail.is_nil() {
            list.entry(&DottedTail(tail));
        }
        list.finish()
    }
}

struct DottedTail<'a>(&'a Value);

impl fmt::Debug for DottedTail<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ". {:?}", self.0)
    }
}

/// Compare two values, stepping along pair chains iteratively.
fn chains_eq(mut a: &Value, mut b: &Value) -> bool {
    loop {
        match (a, b) {
            (Value::Pair(x), Value::Pair(y)) => {
                if Arc::ptr_eq(x, y) {
                    return true;
                }
                if x.head != y.head {
                    return false;
                }
                a = &x.tail;
                b = &y.tail;
            }
            _ => return a == b,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::BigInteger(a), Value::BigInteger(b)) => a == b,
            (Value::Ratio(a), Value::Ratio(b)) => a == b,
            (Value::SingleFloat(a), Value::SingleFloat(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Complex(ar, ai), Value::Complex(br, bi)) => ar == br && ai == bi,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Pair(_), Value::Pair(_)) => chains_eq(self, other),
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::HashTable(a), Value::HashTable(b)) => a == b,
            (Value::Package(a), Value::Package(b)) => a == b,
            (Value::Foreign(a), Value::Foreign(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn cons(head: impl Into<Value>, tail: impl Into<Value>) -> Value {
        Value::Pair(Arc::new(Pair {
            head: head.into(),
            tail: tail.into(),
        }))
    }

    /// Build a proper list; an empty iterator yields [`Value::Nil`].
    pub fn list<I>(items: I) -> Value
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let items: Vec<Value> = items.into_iter().map(Into::into).collect();
        Value::list_with_tail(items, Value::Nil)
    }

    /// Build a list whose last pair's tail is `tail`.
    pub fn list_with_tail(items: Vec<Value>, tail: Value) -> Value {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Value::cons(item, acc))
    }

    /// A call form `(operator arg...)`.
    pub fn call_form(operator: Symbol, args: impl IntoIterator<Item = Value>) -> Value {
        Value::cons(Value::Symbol(operator), Value::list(args))
    }

    /// Wrap in `(COMMON-LISP:QUOTE ...)` when the remote evaluator would
    /// otherwise treat the value as code.
    pub fn quoted(self) -> Value {
        let needs_quote = match &self {
            Value::Symbol(sym) => !sym.is_keyword(),
            Value::Pair(_) => true,
            _ => false,
        };
        if needs_quote {
            let quote = Symbol::new("QUOTE", Some(COMMON_LISP));
            Value::list([Value::Symbol(quote), self])
        } else {
            self
        }
    }

    /// Normalize a big integer to `Integer` when it fits.
    pub fn from_bigint(n: BigInt) -> Value {
        match n.to_i64() {
            Some(small) => Value::Integer(small),
            None => Value::BigInteger(n),
        }
    }

    /// Normalize a ratio; whole ratios become integers.
    pub fn from_ratio(ratio: BigRational) -> Value {
        if ratio.denom().is_one() {
            Value::from_bigint(ratio.to_integer())
        } else {
            Value::Ratio(ratio)
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<&Pair> {
        match self {
            Value::Pair(pair) => Some(pair),
            _ => None,
        }
    }

    pub fn as_foreign(&self) -> Option<&ForeignObject> {
        match self {
            Value::Foreign(obj) => Some(obj),
            _ => None,
        }
    }

    /// Iterate the heads of a pair chain. Stops at the first non-pair tail.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter { current: self }
    }

    /// Elements of a proper list; `None` for dotted lists and non-lists.
    pub fn to_vec(&self) -> Option<Vec<Value>> {
        let mut iter = self.iter();
        let items: Vec<Value> = iter.by_ref().cloned().collect();
        iter.rest().is_nil().then_some(items)
    }
}

/// Iterator over the heads of a pair chain.
#[derive(Debug, Clone)]
pub struct ListIter<'a> {
    current: &'a Value,
}

impl<'a> ListIter<'a> {
    /// The part of the chain not yet consumed; the dotted tail once the
    /// iterator is exhausted.
    pub fn rest(&self) -> &'a Value {
        self.current
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        match self.current {
            Value::Pair(pair) => {
                self.current = &pair.tail;
                Some(&pair.head)
            }
            _ => None,
        }
    }
}

/// Snapshot of a remote package and its exported functions.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    /// Exported function symbols and their callables, in wire order.
    pub functions: Vec<(Symbol, Value)>,
}

impl Package {
    /// Look up an exported function by host or wire name.
    pub fn function(&self, name: &str) -> Option<&Value> {
        let wanted = to_host_case(name).replace('_', "-");
        self.functions
            .iter()
            .find(|(sym, _)| sym.host_name() == wanted)
            .map(|(_, callable)| callable)
    }

    /// Host-convention names of all exported functions.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.iter().map(|(sym, _)| sym.host_name()).collect()
    }
}

struct ForeignData {
    session: SessionId,
    handle: u64,
    class: Symbol,
    proxy: OnceLock<ProxyId>,
}

/// Handle to a value that lives in the remote process.
///
/// Clones share the proxy slot, so patching one clone patches them all.
/// Identity is the remote reference token.
#[derive(Clone)]
pub struct ForeignObject(Arc<ForeignData>);

impl ForeignObject {
    /// A handle with no proxy class attached yet.
    pub fn new(session: SessionId, handle: u64, class: Symbol) -> Self {
        ForeignObject(Arc::new(ForeignData {
            session,
            handle,
            class,
            proxy: OnceLock::new(),
        }))
    }

    /// A handle whose class is already known.
    pub fn with_proxy(session: SessionId, handle: u64, class: Symbol, proxy: ProxyId) -> Self {
        let obj = ForeignObject::new(session, handle, class);
        obj.patch(proxy);
        obj
    }

    pub fn session(&self) -> SessionId {
        self.0.session
    }

    /// Remote reference token.
    pub fn handle(&self) -> u64 {
        self.0.handle
    }

    /// Remote class name.
    pub fn class(&self) -> &Symbol {
        &self.0.class
    }

    pub fn proxy(&self) -> Option<ProxyId> {
        self.0.proxy.get().copied()
    }

    pub fn is_patched(&self) -> bool {
        self.0.proxy.get().is_some()
    }

    /// Attach a proxy class. The first attachment wins.
    pub(crate) fn patch(&self, proxy: ProxyId) {
        let _ = self.0.proxy.set(proxy);
    }
}

impl PartialEq for ForeignObject {
    fn eq(&self, other: &Self) -> bool {
        self.0.session == other.0.session && self.0.handle == other.0.handle
    }
}

impl fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignObject")
            .field("handle", &self.0.handle)
            .field("class", &self.0.class)
            .field("proxy", &self.proxy())
            .finish()
    }
}

/// What one evaluation returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Returned {
    /// The remote form produced no values.
    Nothing,
    One(Value),
    Many(Vec<Value>),
}

impl Returned {
    /// Classify the decoded value list of a response.
    pub fn from_values(mut values: Vec<Value>) -> Self {
        match values.len() {
            0 => Returned::Nothing,
            1 => Returned::One(values.remove(0)),
            _ => Returned::Many(values),
        }
    }

    /// The single value, if exactly one was returned.
    pub fn into_one(self) -> Option<Value> {
        match self {
            Returned::One(value) => Some(value),
            _ => None,
        }
    }

    /// All returned values in order.
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Returned::Nothing => Vec::new(),
            Returned::One(value) => vec![value],
            Returned::Many(values) => values,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Returned::Nothing)
    }
}

// =============================================================================
// Host conversions
// =============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::from_bigint(BigInt::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::from_bigint(BigInt::from(n))
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::from_bigint(n)
    }
}

impl From<BigRational> for Value {
    fn from(r: BigRational) -> Self {
        Value::from_ratio(r)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::SingleFloat(f)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Value::Char(c)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Symbol> for Value {
    fn from(sym: Symbol) -> Self {
        Value::Symbol(sym)
    }
}

impl From<ForeignObject> for Value {
    fn from(obj: ForeignObject) -> Self {
        Value::Foreign(obj)
    }
}

impl From<Package> for Value {
    fn from(pkg: Package) -> Self {
        Value::Package(pkg)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Nil, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::list(items)
    }
}

impl From<serde_json::Value> for Value {
    /// Arrays become vectors and objects become hash tables keyed by
    /// string, so nesting survives the trip.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    Value::from(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Vector(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::HashTable(
                map.into_iter()
                    .map(|(k, v)| (Value::String(k), Value::from(v)))
                    .collect(),
            ),
        }
    }
}
