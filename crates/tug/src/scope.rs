//! Lexical scopes and the arena that owns them.
//!
//! A scope is a name→value map with an optional outer link forming the lexical
//! chain. All scopes live in a central arena and are addressed by [`ScopeId`],
//! so closures can capture a chain without ownership cycles: the function
//! value stores the id of its definition scope and the GC walks the handles.
//!
//! Binding rules: declarations (`:=`) always bind in the given scope; plain
//! assignment rebinds the nearest existing binding along the chain and
//! otherwise inserts into the outermost chain ancestor. Lookups walk the chain
//! and miss with `None` — the fallback to the task's global scope happens in
//! the VM, because the global scope is not part of the lexical chain.

use ahash::AHashMap;

use crate::value::Value;

/// Handle to a scope in the [`ScopeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One variable map plus its outer link.
#[derive(Debug)]
pub(crate) struct Scope {
    pub bindings: AHashMap<Box<str>, Value>,
    pub outer: Option<ScopeId>,
    pub marked: bool,
}

/// Owner of every scope in a runtime.
#[derive(Debug, Default)]
pub(crate) struct ScopeArena {
    slots: Vec<Option<Scope>>,
    free: Vec<u32>,
    bytes: usize,
}

/// Rough footprint of one binding, for GC pressure accounting.
const BINDING_BYTES: usize = 48;
const SCOPE_BYTES: usize = 64;

impl ScopeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated live bytes, fed into the GC threshold check.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn alloc(&mut self, outer: Option<ScopeId>) -> ScopeId {
        self.bytes += SCOPE_BYTES;
        let scope = Scope { bindings: AHashMap::new(), outer, marked: false };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(scope);
            ScopeId(idx)
        } else {
            self.slots.push(Some(scope));
            ScopeId((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        self.slots[id.index()].as_ref().expect("scope freed while in use")
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        self.slots[id.index()].as_mut().expect("scope freed while in use")
    }

    pub fn outer(&self, id: ScopeId) -> Option<ScopeId> {
        self.get(id).outer
    }

    /// Binds `name` in exactly this scope, shadowing any outer binding.
    pub fn declare(&mut self, id: ScopeId, name: &str, value: Value) {
        let scope = self.get_mut(id);
        if scope.bindings.insert(name.into(), value).is_none() {
            self.bytes += BINDING_BYTES + name.len();
        }
    }

    /// Rebinds the nearest existing binding along the chain, or inserts into
    /// the outermost chain ancestor when the name is unbound everywhere.
    pub fn rebind(&mut self, id: ScopeId, name: &str, value: Value) {
        let mut current = id;
        loop {
            let scope = self.get_mut(current);
            if let Some(slot) = scope.bindings.get_mut(name) {
                *slot = value;
                return;
            }
            match scope.outer {
                Some(outer) => current = outer,
                None => break,
            }
        }
        self.declare(current, name, value);
    }

    /// Walks the chain from `id` outward; `None` when unbound.
    pub fn lookup(&self, id: ScopeId, name: &str) -> Option<Value> {
        let mut current = id;
        loop {
            let scope = self.get(current);
            if let Some(&value) = scope.bindings.get(name) {
                return Some(value);
            }
            current = scope.outer?;
        }
    }

    /// Frees every unmarked scope and clears the mark bits.
    pub fn sweep(&mut self) {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(scope) if scope.marked => scope.marked = false,
                Some(scope) => {
                    self.bytes = self.bytes.saturating_sub(
                        SCOPE_BYTES
                            + scope
                                .bindings
                                .keys()
                                .map(|k| BINDING_BYTES + k.len())
                                .sum::<usize>(),
                    );
                    *slot = None;
                    self.free.push(idx as u32);
                }
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_shadows_outer_binding() {
        let mut arena = ScopeArena::new();
        let outer = arena.alloc(None);
        let inner = arena.alloc(Some(outer));
        arena.declare(outer, "x", Value::TRUE);
        arena.declare(inner, "x", Value::FALSE);
        assert_eq!(arena.lookup(inner, "x"), Some(Value::FALSE));
        assert_eq!(arena.lookup(outer, "x"), Some(Value::TRUE));
    }

    #[test]
    fn rebind_updates_nearest_binding() {
        let mut arena = ScopeArena::new();
        let outer = arena.alloc(None);
        let inner = arena.alloc(Some(outer));
        arena.declare(outer, "x", Value::TRUE);
        arena.rebind(inner, "x", Value::FALSE);
        assert_eq!(arena.lookup(outer, "x"), Some(Value::FALSE));
        assert!(arena.get(inner).bindings.is_empty());
    }

    #[test]
    fn rebind_unbound_name_lands_in_outermost_ancestor() {
        let mut arena = ScopeArena::new();
        let root = arena.alloc(None);
        let mid = arena.alloc(Some(root));
        let leaf = arena.alloc(Some(mid));
        arena.rebind(leaf, "y", Value::TRUE);
        assert_eq!(arena.lookup(root, "y"), Some(Value::TRUE));
        assert!(arena.get(leaf).bindings.is_empty());
        assert!(arena.get(mid).bindings.is_empty());
    }

    #[test]
    fn sweep_frees_unmarked_scopes() {
        let mut arena = ScopeArena::new();
        let keep = arena.alloc(None);
        let drop = arena.alloc(None);
        arena.get_mut(keep).marked = true;
        arena.sweep();
        assert!(!arena.get(keep).marked);
        assert!(arena.slots[drop.index()].is_none());
        // the freed slot is reused
        let again = arena.alloc(None);
        assert_eq!(again, drop);
    }
}
