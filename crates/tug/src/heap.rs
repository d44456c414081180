//! The GC heap: a slot arena owning every non-singleton value.
//!
//! Heap objects are addressed by [`HeapId`] handles; the mark phase walks
//! handles instead of pointers, which is what lets closures, scopes and tables
//! form cycles without reference counting. Collection is a plain mark-and-sweep
//! over three root sets — task stacks/frames, the scope arena, and the task
//! list — with an adaptive byte threshold.
//!
//! Because value content (string bytes, numbers, identities) lives behind
//! handles, key hashing and equality are heap operations: the [`Table`] type
//! never touches the heap itself and receives hashes/equality from here.

use std::rc::Rc;

use crate::{
    bytecode::Code,
    runtime::NativeFn,
    scope::{ScopeArena, ScopeId},
    task::{Task, TaskState},
    tracer::VmTracer,
    types::{List, Str, Table},
    value::{Value, ValueType},
};

/// Handle to a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A function value: scripted (bytecode plus captured scope chain) or native.
#[derive(Debug)]
pub(crate) struct Function {
    /// Source name the function was compiled from, `[C]` for natives.
    pub src: Rc<str>,
    /// Display name used in tracebacks (`<anonymous>` for unnamed literals).
    pub name: Rc<str>,
    pub kind: FuncKind,
}

pub(crate) enum FuncKind {
    Script {
        params: Rc<[Box<str>]>,
        code: Rc<Code>,
        /// Scope chain in effect at the definition site.
        upper: Option<ScopeId>,
    },
    Native(NativeFn),
}

impl std::fmt::Debug for FuncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script { params, .. } => f.debug_struct("Script").field("params", params).finish_non_exhaustive(),
            Self::Native(_) => f.write_str("Native"),
        }
    }
}

/// Heap-allocated value payloads.
#[derive(Debug)]
pub(crate) enum HeapData {
    Num(f64),
    Str(Str),
    Func(Function),
    Table(Table),
    List(List),
    /// Transient multi-value container used at return and argument sites.
    Tuple(Vec<Value>),
    /// Iteration cursor over a string's bytes; `len` is captured at creation.
    IterStr { target: HeapId, len: usize, idx: usize },
    /// Iteration cursor over a list.
    IterList { target: HeapId, idx: usize },
    /// Iteration cursor over a table's buckets.
    IterTable { target: HeapId, bucket: usize, entry: usize },
}

#[derive(Debug)]
struct HeapSlot {
    /// Monotonically increasing identity, seeded from wall-clock time.
    id: u64,
    marked: bool,
    bytes: usize,
    data: HeapData,
}

/// Garbage collector tuning knobs.
///
/// After each sweep the byte threshold is recomputed as
/// `clamp(bytes_in_use / target, old · min_shrink, old · max_growth)`, giving
/// linear growth proportional to the live heap with bounded per-cycle steps.
#[derive(Debug, Clone, Copy)]
pub struct GcTuning {
    /// Initial collection threshold in bytes.
    pub initial_threshold: usize,
    /// Desired live/threshold ratio after a collection.
    pub target: f64,
    /// Lower clamp on the per-cycle threshold step.
    pub min_shrink: f64,
    /// Upper clamp on the per-cycle threshold step.
    pub max_growth: f64,
}

impl Default for GcTuning {
    fn default() -> Self {
        Self {
            initial_threshold: 1024 * 1024,
            target: 0.6,
            min_shrink: 0.5,
            max_growth: 2.0,
        }
    }
}

/// The value arena plus collector state.
#[derive(Debug)]
pub(crate) struct Heap {
    slots: Vec<Option<HeapSlot>>,
    free: Vec<u32>,
    bytes: usize,
    threshold: usize,
    tuning: GcTuning,
    next_identity: u64,
}

impl Heap {
    pub fn new(tuning: GcTuning) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes: 0,
            threshold: tuning.initial_threshold,
            tuning,
            next_identity: identity_seed(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of live heap objects, used by tests and heap diagnostics.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn alloc(&mut self, data: HeapData) -> Value {
        Value::Ref(self.alloc_id(data))
    }

    pub fn alloc_id(&mut self, data: HeapData) -> HeapId {
        let bytes = estimate(&data);
        self.bytes += bytes;
        let id = self.next_identity;
        self.next_identity += 1;
        let slot = HeapSlot { id, marked: false, bytes, data };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(slot);
            HeapId(idx)
        } else {
            self.slots.push(Some(slot));
            HeapId((self.slots.len() - 1) as u32)
        }
    }

    pub fn data(&self, id: HeapId) -> &HeapData {
        &self.slot(id).data
    }

    pub fn data_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.index()].as_mut().expect("heap slot freed while in use").data
    }

    fn slot(&self, id: HeapId) -> &HeapSlot {
        self.slots[id.index()].as_ref().expect("heap slot freed while in use")
    }

    /// The monotonic identity of a heap value; singletons have none.
    pub fn identity(&self, value: Value) -> u64 {
        match value {
            Value::Ref(id) => self.slot(id).id,
            Value::Nil | Value::Bool(_) => 0,
        }
    }

    /// Re-estimates a slot's footprint after a container mutation.
    pub fn refresh_bytes(&mut self, id: HeapId) {
        let slot = self.slots[id.index()].as_mut().expect("heap slot freed while in use");
        let new = estimate(&slot.data);
        self.bytes = self.bytes - slot.bytes + new;
        slot.bytes = new;
    }

    // ----- typed accessors -------------------------------------------------

    pub fn num(&self, value: Value) -> Option<f64> {
        match value {
            Value::Ref(id) => match self.data(id) {
                HeapData::Num(n) => Some(*n),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn str_bytes(&self, value: Value) -> Option<&[u8]> {
        match value {
            Value::Ref(id) => match self.data(id) {
                HeapData::Str(s) => Some(s.as_bytes()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn table_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Ref(id) => match self.data(id) {
                HeapData::Table(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn table_ref(&self, id: HeapId) -> &Table {
        match self.data(id) {
            HeapData::Table(t) => t,
            _ => unreachable!("expected table slot"),
        }
    }

    pub fn table_mut(&mut self, id: HeapId) -> &mut Table {
        match self.data_mut(id) {
            HeapData::Table(t) => t,
            _ => unreachable!("expected table slot"),
        }
    }

    pub fn list_ref(&self, id: HeapId) -> &List {
        match self.data(id) {
            HeapData::List(l) => l,
            _ => unreachable!("expected list slot"),
        }
    }

    pub fn list_mut(&mut self, id: HeapId) -> &mut List {
        match self.data_mut(id) {
            HeapData::List(l) => l,
            _ => unreachable!("expected list slot"),
        }
    }

    pub fn tuple_items(&self, value: Value) -> Option<&[Value]> {
        match value {
            Value::Ref(id) => match self.data(id) {
                HeapData::Tuple(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    // ----- type and truth --------------------------------------------------

    pub fn type_of(&self, value: Value) -> ValueType {
        match value {
            Value::Nil => ValueType::Nil,
            Value::Bool(_) => ValueType::Bool,
            Value::Ref(id) => match self.data(id) {
                HeapData::Num(_) => ValueType::Num,
                HeapData::Str(_) => ValueType::Str,
                HeapData::Func(_) => ValueType::Func,
                HeapData::Table(_) => ValueType::Table,
                HeapData::List(_) => ValueType::List,
                // a tuple reports the type of its first element, nil when empty
                HeapData::Tuple(items) => match items.first() {
                    Some(&first) => self.type_of(first),
                    None => ValueType::Nil,
                },
                HeapData::IterStr { .. } | HeapData::IterList { .. } | HeapData::IterTable { .. } => {
                    ValueType::Iterator
                }
            },
        }
    }

    /// Short type label used in runtime error messages.
    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Ref(id) => match self.data(id) {
                HeapData::Num(_) => "num",
                HeapData::Str(_) => "str",
                HeapData::Func(_) => "func",
                HeapData::Table(_) => "table",
                HeapData::List(_) => "list",
                _ => "unknown",
            },
        }
    }

    /// Truthiness: `nil`, `false`, `0`, the empty string and the empty list
    /// are falsy; everything else (including empty tables) is truthy.
    pub fn truthy(&self, value: Value) -> bool {
        match value {
            Value::Nil | Value::Bool(false) => false,
            Value::Bool(true) => true,
            Value::Ref(id) => match self.data(id) {
                HeapData::Num(n) => *n != 0.0,
                HeapData::Str(s) => !s.is_empty(),
                HeapData::List(l) => !l.is_empty(),
                _ => true,
            },
        }
    }

    // ----- value hashing and equality -------------------------------------

    /// Content hash for numbers and strings, identity hash otherwise.
    pub fn value_hash(&self, value: Value) -> u64 {
        match value {
            Value::Nil => 0x6e69_6c00_6e69_6c00,
            Value::Bool(true) => 1231,
            Value::Bool(false) => 1237,
            Value::Ref(id) => match self.data(id) {
                HeapData::Num(n) => {
                    let mut bits = n.to_bits();
                    // -0.0 hashes like 0.0
                    if bits == 0x8000_0000_0000_0000 {
                        bits = 0;
                    }
                    bits.wrapping_mul(11_400_714_819_323_198_485)
                }
                HeapData::Str(s) => s.hash(),
                _ => mix(self.slot(id).id),
            },
        }
    }

    /// Byte-identical for strings, numeric for numbers, by kind for
    /// singletons, by identity for everything else.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Ref(i), Value::Ref(j)) => {
                if i == j {
                    return true;
                }
                match (self.data(i), self.data(j)) {
                    (HeapData::Num(x), HeapData::Num(y)) => x == y,
                    (HeapData::Str(x), HeapData::Str(y)) => x == y,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    // ----- table operations ------------------------------------------------

    /// Direct lookup; an absent key reads as `nil`.
    pub fn table_get(&self, table: HeapId, key: Value) -> Value {
        let hash = self.value_hash(key);
        let t = self.table_ref(table);
        match t.find(hash, |k| self.values_equal(k, key)) {
            Some(pos) => t.value_at(pos),
            None => Value::NIL,
        }
    }

    /// Lookup by string key without allocating a key value.
    pub fn table_get_str(&self, table: HeapId, key: &str) -> Value {
        let hash = crate::types::fnv1a(key.as_bytes());
        let t = self.table_ref(table);
        let found = t.find(hash, |k| self.str_bytes(k) == Some(key.as_bytes()));
        match found {
            Some(pos) => t.value_at(pos),
            None => Value::NIL,
        }
    }

    /// Insert/overwrite; writing `nil` removes the entry.
    pub fn table_set(&mut self, table: HeapId, key: Value, value: Value) {
        let hash = self.value_hash(key);
        let existing = {
            let t = self.table_ref(table);
            t.find(hash, |k| self.values_equal(k, key))
        };
        let t = self.table_mut(table);
        match (existing, value) {
            (Some(pos), Value::Nil) => t.remove_at(pos),
            (Some(pos), _) => t.set_value_at(pos, value),
            (None, Value::Nil) => {}
            (None, _) => t.insert(hash, key, value),
        }
        self.refresh_bytes(table);
    }

    /// The metatable of a table value, `nil` for everything else.
    pub fn metatable_of(&self, value: Value) -> Value {
        match value {
            Value::Ref(id) => match self.data(id) {
                HeapData::Table(t) => t.metatable,
                _ => Value::NIL,
            },
            _ => Value::NIL,
        }
    }

    /// Looks up a hook on a value's metatable; `nil` when absent.
    pub fn meta_field(&self, value: Value, name: &str) -> Value {
        match self.metatable_of(value) {
            Value::Ref(meta) => self.table_get_str(meta, name),
            _ => Value::NIL,
        }
    }
}

/// Murmur3-style finalizer used for identity hashing.
fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Wall-clock seed for the identity counter; process-wide so two runtimes in
/// one process keep distinct identity ranges.
fn identity_seed() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_SEED: AtomicU64 = AtomicU64::new(0);
    let base = NEXT_SEED.fetch_add(1 << 48, Ordering::Relaxed);
    if base == 0 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let seeded = u64::from(nanos) << 24;
        NEXT_SEED.store(seeded + (1 << 48), Ordering::Relaxed);
        seeded
    } else {
        base
    }
}

/// Rough per-object footprint estimates feeding the GC threshold.
fn estimate(data: &HeapData) -> usize {
    match data {
        HeapData::Num(_) => 16,
        HeapData::Str(s) => 32 + s.len(),
        HeapData::Func(f) => match &f.kind {
            FuncKind::Script { params, code, .. } => 96 + params.len() * 24 + code.len() / 8,
            FuncKind::Native(_) => 64,
        },
        HeapData::Table(t) => 64 + t.capacity() * 24 + t.len() * 48,
        HeapData::List(l) => 32 + l.capacity() * 16,
        HeapData::Tuple(items) => 32 + items.len() * 16,
        HeapData::IterStr { .. } | HeapData::IterList { .. } | HeapData::IterTable { .. } => 48,
    }
}

// ----- collection ----------------------------------------------------------

enum MarkItem {
    Val(HeapId),
    Scope(ScopeId),
}

/// Runs one full mark-and-sweep cycle.
///
/// `current` is a task temporarily detached from the arena while the VM drives
/// it; it is marked like any resident task. Tasks in `Ended` state are closed
/// and freed during the sweep.
pub(crate) fn collect(
    heap: &mut Heap,
    scopes: &mut ScopeArena,
    tasks: &mut [Option<Task>],
    current: Option<&Task>,
    tracer: &mut dyn VmTracer,
) {
    let mut work: Vec<MarkItem> = Vec::new();

    for task in tasks.iter().flatten().chain(current) {
        mark_task_roots(task, &mut work);
    }
    process(heap, scopes, &mut work);

    // sweep values
    for (idx, slot) in heap.slots.iter_mut().enumerate() {
        match slot {
            Some(s) if s.marked => s.marked = false,
            Some(s) => {
                heap.bytes = heap.bytes.saturating_sub(s.bytes);
                *slot = None;
                heap.free.push(idx as u32);
            }
            None => {}
        }
    }
    scopes.sweep();
    for slot in tasks.iter_mut() {
        if slot.as_ref().is_some_and(|t| t.state == TaskState::Ended) {
            *slot = None;
        }
    }

    let in_use = heap.bytes + scopes.bytes();
    let old = heap.threshold as f64;
    let desired = (in_use as f64 / heap.tuning.target)
        .clamp(old * heap.tuning.min_shrink, old * heap.tuning.max_growth);
    heap.threshold = desired as usize;
    tracer.on_gc(in_use, heap.threshold);
}

fn mark_task_roots(task: &Task, work: &mut Vec<MarkItem>) {
    if task.state == TaskState::Ended {
        return;
    }
    for &value in &task.stack {
        mark_value(value, work);
    }
    for &scope in &task.scope_stack {
        work.push(MarkItem::Scope(scope));
    }
    work.push(MarkItem::Scope(task.global));
    for frame in &task.frames {
        for &arg in &frame.args {
            mark_value(arg, work);
        }
        mark_value(frame.ret, work);
    }
    mark_value(task.result, work);
}

fn mark_value(value: Value, work: &mut Vec<MarkItem>) {
    if let Value::Ref(id) = value {
        work.push(MarkItem::Val(id));
    }
}

fn process(heap: &mut Heap, scopes: &mut ScopeArena, work: &mut Vec<MarkItem>) {
    while let Some(item) = work.pop() {
        match item {
            MarkItem::Val(id) => {
                {
                    let slot = heap.slots[id.index()].as_mut().expect("marking a freed heap slot");
                    if slot.marked {
                        continue;
                    }
                    slot.marked = true;
                }
                match heap.data(id) {
                    HeapData::Num(_) | HeapData::Str(_) => {}
                    HeapData::Func(f) => {
                        if let FuncKind::Script { upper: Some(upper), .. } = &f.kind {
                            work.push(MarkItem::Scope(*upper));
                        }
                    }
                    HeapData::Table(t) => {
                        for entry in t.entries() {
                            mark_value(entry.key, work);
                            mark_value(entry.value, work);
                        }
                        mark_value(t.metatable, work);
                    }
                    HeapData::List(l) => {
                        for &item in l.items() {
                            mark_value(item, work);
                        }
                    }
                    HeapData::Tuple(items) => {
                        for &item in items {
                            mark_value(item, work);
                        }
                    }
                    HeapData::IterStr { target, .. }
                    | HeapData::IterList { target, .. }
                    | HeapData::IterTable { target, .. } => {
                        work.push(MarkItem::Val(*target));
                    }
                }
            }
            MarkItem::Scope(id) => {
                let scope = scopes.get_mut(id);
                if scope.marked {
                    continue;
                }
                scope.marked = true;
                for &value in scope.bindings.values() {
                    mark_value(value, work);
                }
                if let Some(outer) = scope.outer {
                    work.push(MarkItem::Scope(outer));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;

    fn test_heap() -> Heap {
        Heap::new(GcTuning::default())
    }

    #[test]
    fn identities_are_monotonic() {
        let mut heap = test_heap();
        let a = heap.alloc(HeapData::Num(1.0));
        let b = heap.alloc(HeapData::Num(2.0));
        assert!(heap.identity(b) > heap.identity(a));
        assert_eq!(heap.identity(Value::NIL), 0);
    }

    #[test]
    fn numbers_and_strings_compare_by_content() {
        let mut heap = test_heap();
        let a = heap.alloc(HeapData::Num(4.5));
        let b = heap.alloc(HeapData::Num(4.5));
        let s1 = heap.alloc(HeapData::Str(Str::from("abc")));
        let s2 = heap.alloc(HeapData::Str(Str::from("abc")));
        assert!(heap.values_equal(a, b));
        assert!(heap.values_equal(s1, s2));
        assert!(!heap.values_equal(a, s1));
        assert_eq!(heap.value_hash(s1), heap.value_hash(s2));
        assert_eq!(heap.value_hash(a), heap.value_hash(b));
    }

    #[test]
    fn tables_compare_by_identity() {
        let mut heap = test_heap();
        let a = heap.alloc(HeapData::Table(Table::new()));
        let b = heap.alloc(HeapData::Table(Table::new()));
        assert!(heap.values_equal(a, a));
        assert!(!heap.values_equal(a, b));
    }

    #[test]
    fn table_set_get_and_nil_removal() {
        let mut heap = test_heap();
        let table = heap.alloc_id(HeapData::Table(Table::new()));
        let key = heap.alloc(HeapData::Str(Str::from("k")));
        let value = heap.alloc(HeapData::Num(9.0));
        heap.table_set(table, key, value);
        assert!(heap.values_equal(heap.table_get(table, key), value));
        // a fresh key with the same bytes hits the same entry
        let key2 = heap.alloc(HeapData::Str(Str::from("k")));
        assert!(heap.values_equal(heap.table_get(table, key2), value));
        assert_eq!(heap.table_get_str(table, "k"), value);
        heap.table_set(table, key2, Value::NIL);
        assert!(heap.table_get(table, key).is_nil());
        assert_eq!(heap.table_ref(table).len(), 0);
    }

    #[test]
    fn negative_zero_hashes_like_zero() {
        let mut heap = test_heap();
        let pos = heap.alloc(HeapData::Num(0.0));
        let neg = heap.alloc(HeapData::Num(-0.0));
        assert_eq!(heap.value_hash(pos), heap.value_hash(neg));
        assert!(heap.values_equal(pos, neg));
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_reachable() {
        let mut heap = test_heap();
        let mut scopes = ScopeArena::new();
        let global = scopes.alloc(None);
        let kept = heap.alloc(HeapData::Num(1.0));
        let _garbage = heap.alloc(HeapData::Num(2.0));
        scopes.declare(global, "kept", kept);

        let mut task = Task::new("t".into(), Rc::new(Code::from_bytes(vec![])), global, global);
        task.state = TaskState::Running;
        let mut tasks = [Some(task)];
        collect(&mut heap, &mut scopes, &mut tasks, None, &mut NoopTracer);

        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.num(kept), Some(1.0));
    }

    #[test]
    fn threshold_steps_are_clamped() {
        let mut heap = test_heap();
        let mut scopes = ScopeArena::new();
        let before = heap.threshold();
        // nothing live: the threshold may shrink by at most half
        collect(&mut heap, &mut scopes, &mut [], None, &mut NoopTracer);
        assert_eq!(heap.threshold(), before / 2);
        // and never grows by more than 2x per cycle
        for _ in 0..4 {
            let old = heap.threshold();
            let filler: Vec<Value> = (0..2048).map(|_| heap.alloc(HeapData::Str(Str::from_bytes(&[0u8; 512])))).collect();
            let global = scopes.alloc(None);
            for (i, v) in filler.iter().enumerate() {
                scopes.declare(global, &format!("v{i}"), *v);
            }
            let mut task = Task::new("t".into(), Rc::new(Code::from_bytes(vec![])), global, global);
            task.state = TaskState::Running;
            let mut tasks = [Some(task)];
            collect(&mut heap, &mut scopes, &mut tasks, None, &mut NoopTracer);
            assert!(heap.threshold() <= old * 2);
            assert!(heap.threshold() >= old / 2);
        }
    }
}
