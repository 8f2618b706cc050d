//! Foreign class bridge.
//!
//! Remote objects without a host representation arrive as
//! [`ForeignObject`] handles. The first time a class is seen, the session
//! asks the remote side for the generic functions specialized on it (and
//! its superclasses) and records them as a [`ProxyClass`]. Every handle of
//! that class is then patched with the proxy so its members can be called
//! from the host.
//!
//! Handles whose class is still unknown when they are decoded are parked in
//! the [`ClassRegistry`] pending table, grouped by class in first-seen
//! order, until the session gets around to discovering the class.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{Error, Result, SyntaxError};
use crate::symbol::{member_key, Symbol};
use crate::value::{ForeignObject, Returned, Value};

// =============================================================================
// Service Trait for Dependency Injection
// =============================================================================

/// Anything that can evaluate expressions on the remote side.
///
/// [`crate::Session`] is the real implementation. The trait lets callable
/// handles ([`RemoteFunction`], [`ForeignObject::call`]) be exercised
/// against scripted evaluators in tests.
pub trait Evaluator {
    /// Evaluate one expression and return its values.
    fn eval(&mut self, expr: &Value) -> Result<Returned>;

    /// Apply a remote function value to already-built arguments.
    fn funcall(&mut self, function: &Value, args: &[Value]) -> Result<Returned>;

    /// Invoke a member of a foreign object's proxy class, passing the
    /// receiver as the first argument.
    fn call_member(&mut self, object: &ForeignObject, member: &str, args: &[Value])
        -> Result<Returned>;
}

/// A remote function value obtained by name.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFunction {
    name: Symbol,
    function: Value,
}

impl RemoteFunction {
    pub fn new(name: Symbol, function: Value) -> Self {
        Self { name, function }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// The underlying remote value, usually a foreign handle.
    pub fn value(&self) -> &Value {
        &self.function
    }

    /// Call the function with `args`.
    pub fn call<E: Evaluator + ?Sized>(&self, evaluator: &mut E, args: &[Value]) -> Result<Returned> {
        evaluator.funcall(&self.function, args)
    }
}

impl ForeignObject {
    /// Call a member of this object's proxy class.
    ///
    /// `member` may use either hyphens or underscores.
    pub fn call<E: Evaluator + ?Sized>(
        &self,
        evaluator: &mut E,
        member: &str,
        args: &[Value],
    ) -> Result<Returned> {
        evaluator.call_member(self, member, args)
    }
}

// =============================================================================
// Proxy Classes
// =============================================================================

/// Index of a proxy class inside its session's [`ClassRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(pub(crate) usize);

/// One callable member of a proxy class.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Generic function name as sent by the remote side.
    pub name: Symbol,
    /// Remote function value to apply.
    pub callable: Value,
}

/// Host-side stand-in for a remote class.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyClass {
    class: Symbol,
    members: Vec<Member>,
}

impl ProxyClass {
    pub fn new(class: Symbol, members: Vec<Member>) -> Self {
        Self { class, members }
    }

    /// Build a proxy from the `((NAME . FUNCTION) ...)` list returned by
    /// the class information query. Later duplicates of a name are ignored.
    pub fn from_alist(class: Symbol, alist: &Value) -> Result<Self, SyntaxError> {
        let mut members: Vec<Member> = Vec::new();
        let mut entries = alist.iter();
        for entry in entries.by_ref() {
            let pair = entry
                .as_pair()
                .ok_or_else(|| SyntaxError::Malformed("class member entry".into()))?;
            let name = pair
                .head
                .as_symbol()
                .cloned()
                .ok_or_else(|| SyntaxError::Malformed("class member name".into()))?;
            if members.iter().any(|m| m.name == name) {
                continue;
            }
            members.push(Member {
                name,
                callable: pair.tail.clone(),
            });
        }
        if !entries.rest().is_nil() {
            return Err(SyntaxError::Malformed("class member list".into()));
        }
        Ok(Self { class, members })
    }

    pub fn class(&self) -> &Symbol {
        &self.class
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Look up a member by host name (`slot-value` or `slot_value`).
    pub fn member(&self, name: &str) -> Option<&Member> {
        let key = member_key(name);
        self.members.iter().find(|m| m.name.name() == key)
    }

    /// Member names in host convention.
    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.host_name()).collect()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Per-session table of known proxy classes and not-yet-patched handles.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ProxyClass>,
    known: HashMap<Symbol, ProxyId>,
    pending: Vec<(Symbol, Vec<ForeignObject>)>,
    /// Classes whose information query is in flight.
    discovering: HashSet<Symbol>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxy id for an already discovered class.
    pub fn lookup(&self, class: &Symbol) -> Option<ProxyId> {
        self.known.get(class).copied()
    }

    pub fn get(&self, id: ProxyId) -> Option<&ProxyClass> {
        self.classes.get(id.0)
    }

    /// Proxy class a patched object points at.
    pub fn proxy_for(&self, object: &ForeignObject) -> Option<&ProxyClass> {
        object.proxy().and_then(|id| self.get(id))
    }

    /// Number of discovered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Queue a handle whose class has not been discovered.
    pub fn defer(&mut self, object: ForeignObject) {
        let class = object.class().clone();
        match self.pending.iter_mut().find(|(c, _)| *c == class) {
            Some((_, instances)) => instances.push(object),
            None => self.pending.push((class, vec![object])),
        }
    }

    /// Total number of handles waiting for their class.
    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(|(_, instances)| instances.len()).sum()
    }

    /// Remove and return the pending groups that can be resolved now.
    ///
    /// Classes with a discovery already in flight stay queued; the outer
    /// discovery patches them once it completes.
    pub fn take_ready(&mut self) -> Vec<(Symbol, Vec<ForeignObject>)> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(class, _)| !self.discovering.contains(class));
        self.pending = waiting;
        ready
    }

    /// Put a group back after a failed discovery. Order is preserved
    /// relative to groups queued since.
    pub fn requeue(&mut self, class: Symbol, mut instances: Vec<ForeignObject>) {
        match self.pending.iter().position(|(c, _)| *c == class) {
            Some(pos) => {
                instances.append(&mut self.pending[pos].1);
                self.pending[pos].1 = instances;
            }
            None => self.pending.insert(0, (class, instances)),
        }
    }

    pub fn begin_discovery(&mut self, class: &Symbol) {
        self.discovering.insert(class.clone());
    }

    pub fn end_discovery(&mut self, class: &Symbol) {
        self.discovering.remove(class);
    }

    pub fn is_discovering(&self, class: &Symbol) -> bool {
        self.discovering.contains(class)
    }

    /// Record a discovered class. Registering the same class twice keeps
    /// the first proxy.
    pub fn register(&mut self, proxy: ProxyClass) -> ProxyId {
        if let Some(id) = self.lookup(proxy.class()) {
            return id;
        }
        let id = ProxyId(self.classes.len());
        debug!(
            "Registered proxy class {} with {} member(s)",
            proxy.class(),
            proxy.members().len()
        );
        self.known.insert(proxy.class().clone(), id);
        self.classes.push(proxy);
        id
    }

    /// Resolve a member of `object`'s proxy class.
    pub fn member_of(&self, object: &ForeignObject, member: &str) -> Result<&Member> {
        self.proxy_for(object)
            .and_then(|proxy| proxy.member(member))
            .ok_or_else(|| Error::NoSuchMember {
                class: object.class().to_string(),
                member: member.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::COMMON_LISP_USER;
    use crate::value::SessionId;
    use pretty_assertions::assert_eq;

    fn class(name: &str) -> Symbol {
        Symbol::new(name, Some(COMMON_LISP_USER))
    }

    fn object(handle: u64, class_name: &str) -> ForeignObject {
        ForeignObject::new(SessionId(1), handle, class(class_name))
    }

    /// Records calls instead of talking to a remote process.
    #[derive(Default)]
    struct RecordingEvaluator {
        funcalls: Vec<(Value, Vec<Value>)>,
        members: Vec<(u64, String, Vec<Value>)>,
    }

    impl Evaluator for RecordingEvaluator {
        fn eval(&mut self, _expr: &Value) -> Result<Returned> {
            Ok(Returned::Nothing)
        }

        fn funcall(&mut self, function: &Value, args: &[Value]) -> Result<Returned> {
            self.funcalls.push((function.clone(), args.to_vec()));
            Ok(Returned::One(Value::Integer(args.len() as i64)))
        }

        fn call_member(
            &mut self,
            object: &ForeignObject,
            member: &str,
            args: &[Value],
        ) -> Result<Returned> {
            self.members
                .push((object.handle(), member.to_string(), args.to_vec()));
            Ok(Returned::Nothing)
        }
    }

    #[test]
    fn test_proxy_from_alist() {
        let alist = Value::list([
            Value::cons(Value::Symbol(class("POINT-X")), Value::Integer(1)),
            Value::cons(Value::Symbol(class("SLOT-VALUE")), Value::Integer(2)),
            Value::cons(Value::Symbol(class("POINT-X")), Value::Integer(3)),
        ]);
        let proxy = ProxyClass::from_alist(class("POINT"), &alist).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(proxy.member_names(), vec!["point-x", "slot-value"]);
        assert_eq!(proxy.member("slot_value").map(|m| &m.callable), Some(&Value::Integer(2)));
        assert_eq!(proxy.member("point-x").map(|m| &m.callable), Some(&Value::Integer(1)));
        assert!(proxy.member("missing").is_none());
    }

    #[test]
    fn test_proxy_from_malformed_alist() {
        let bad = Value::list([Value::Integer(1)]);
        assert!(ProxyClass::from_alist(class("POINT"), &bad).is_err());
        assert!(ProxyClass::from_alist(class("POINT"), &Value::Nil)
            .map(|p| p.members().is_empty())
            .unwrap_or(false));
    }

    #[test]
    fn test_defer_groups_by_class_in_first_seen_order() {
        let mut registry = ClassRegistry::new();
        registry.defer(object(1, "A"));
        registry.defer(object(2, "B"));
        registry.defer(object(3, "A"));
        assert_eq!(registry.pending_count(), 3);

        let ready = registry.take_ready();
        let summary: Vec<(String, Vec<u64>)> = ready
            .iter()
            .map(|(c, objs)| (c.name().to_string(), objs.iter().map(ForeignObject::handle).collect()))
            .collect();
        assert_eq!(
            summary,
            vec![("A".to_string(), vec![1, 3]), ("B".to_string(), vec![2])]
        );
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_take_ready_skips_classes_under_discovery() {
        let mut registry = ClassRegistry::new();
        registry.defer(object(1, "A"));
        registry.defer(object(2, "B"));
        registry.begin_discovery(&class("A"));

        let ready = registry.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0.name(), "B");
        assert_eq!(registry.pending_count(), 1);

        registry.end_discovery(&class("A"));
        assert_eq!(registry.take_ready().len(), 1);
    }

    #[test]
    fn test_requeue_puts_group_back() {
        let mut registry = ClassRegistry::new();
        registry.defer(object(5, "A"));
        registry.requeue(class("A"), vec![object(1, "A")]);
        registry.requeue(class("B"), vec![object(2, "B")]);
        let ready = registry.take_ready();
        assert_eq!(ready[0].0.name(), "B");
        let handles: Vec<u64> = ready[1].1.iter().map(ForeignObject::handle).collect();
        assert_eq!(handles, vec![1, 5]);
    }

    #[test]
    fn test_register_is_idempotent_and_patches_share_proxy() {
        let mut registry = ClassRegistry::new();
        let first = registry.register(ProxyClass::new(class("A"), vec![]));
        let again = registry.register(ProxyClass::new(class("A"), vec![]));
        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);

        let obj = object(1, "A");
        let clone = obj.clone();
        assert!(registry.proxy_for(&clone).is_none());
        obj.patch(first);
        assert_eq!(registry.proxy_for(&clone).map(|p| p.class().name()), Some("A"));
    }

    #[test]
    fn test_member_of_unknown_member_fails() {
        let mut registry = ClassRegistry::new();
        let id = registry.register(ProxyClass::new(
            class("A"),
            vec![Member {
                name: class("SIZE"),
                callable: Value::Integer(7),
            }],
        ));
        let obj = ForeignObject::with_proxy(SessionId(1), 4, class("A"), id);
        assert_eq!(registry.member_of(&obj, "size").map(|m| m.callable.clone()).ok(), Some(Value::Integer(7)));
        assert!(matches!(
            registry.member_of(&obj, "colour"),
            Err(Error::NoSuchMember { .. })
        ));
        let unpatched = object(5, "A");
        assert!(registry.member_of(&unpatched, "size").is_err());
    }

    #[test]
    fn test_callables_delegate_to_evaluator() {
        let mut evaluator = RecordingEvaluator::default();
        let function = RemoteFunction::new(class("ADD"), Value::Integer(99));
        let result = function
            .call(&mut evaluator, &[Value::Integer(1), Value::Integer(2)])
            .map(Returned::into_vec)
            .unwrap_or_default();
        assert_eq!(result, vec![Value::Integer(2)]);
        assert_eq!(evaluator.funcalls[0].0, Value::Integer(99));

        let obj = object(8, "A");
        assert!(obj.call(&mut evaluator, "size", &[]).is_ok());
        assert_eq!(evaluator.members, vec![(8, "size".to_string(), vec![])]);
    }
}
