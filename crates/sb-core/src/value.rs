use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

/// Generation-checked slot reference into an engine heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl EngineId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A value as stored in the engine heap. Numbers keep whether they are
/// integral so they re-enter scripts with the same arithmetic.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Integer(i64),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Object(ObjectId),
}

impl Value {
    pub fn string(value: impl AsRef<str>) -> Self {
        Self::String(Arc::from(value.as_ref()))
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Coarse kind name; objects report "object" here and get their class
    /// name from the engine.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) | Self::Integer(_) => "number",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Object(_) => "object",
        }
    }
}

/// Numbers compare by value whatever their representation, so `1` and
/// `1.0` are the same value.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(_) | Self::Integer(_), Self::Number(_) | Self::Integer(_)) => {
                self.as_number() == other.as_number()
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Deferred releases of rooted handles. Any thread may push; only the
/// engine thread drains.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    pending: SegQueue<ObjectId>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, id: ObjectId) {
        self.pending.push(id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<ObjectId> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(id) = self.pending.pop() {
            out.push(id);
        }
        out
    }
}

struct Root {
    id: ObjectId,
    queue: Arc<ReleaseQueue>,
}

impl Drop for Root {
    fn drop(&mut self) {
        self.queue.push(self.id);
    }
}

/// Shared handle to one engine value. Object values keep their heap slot
/// alive until the last clone is dropped and the engine drains its
/// release queue.
#[derive(Clone)]
pub struct ScriptValue {
    engine: EngineId,
    value: Value,
    root: Option<Arc<Root>>,
}

impl ScriptValue {
    /// A handle for a non-object value; holds no root.
    pub fn primitive(engine: EngineId, value: Value) -> Self {
        debug_assert!(value.object_id().is_none());
        Self {
            engine,
            value,
            root: None,
        }
    }

    /// A handle that releases `id` through `queue` when dropped. The caller
    /// must already have counted the root in its heap.
    #[doc(hidden)]
    pub fn rooted(engine: EngineId, id: ObjectId, queue: &Arc<ReleaseQueue>) -> Self {
        Self {
            engine,
            value: Value::Object(id),
            root: Some(Arc::new(Root {
                id,
                queue: Arc::clone(queue),
            })),
        }
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.value.object_id()
    }

    pub fn is_object(&self) -> bool {
        self.object_id().is_some()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        self.value.as_number()
    }

    pub fn as_integer(&self) -> Option<i64> {
        self.value.as_integer()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Identity comparison without coercion: same engine, same primitive
    /// value or same heap object.
    pub fn strict_equals(&self, other: &ScriptValue) -> bool {
        self.engine == other.engine && self.value == other.value
    }
}

impl PartialEq for ScriptValue {
    fn eq(&self, other: &Self) -> bool {
        self.strict_equals(other)
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptValue")
            .field("engine", &self.engine.0)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    fn id(index: u32) -> ObjectId {
        ObjectId {
            index,
            generation: 1,
        }
    }

    #[test]
    fn dropping_last_clone_queues_release_once() {
        let queue = Arc::new(ReleaseQueue::new());
        let engine = EngineId::next();
        let first = ScriptValue::rooted(engine, id(3), &queue);
        let second = first.clone();
        drop(first);
        assert!(queue.is_empty());
        drop(second);
        assert_eq!(queue.drain(), vec![id(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn release_queue_is_fifo_across_threads() {
        let queue = Arc::new(ReleaseQueue::new());
        let engine = EngineId::next();
        let handles = (0..4)
            .map(|index| ScriptValue::rooted(engine, id(index), &queue))
            .collect::<Vec<_>>();
        let worker = std::thread::spawn(move || drop(handles));
        worker.join().expect("worker should finish");
        assert_eq!(queue.drain(), vec![id(0), id(1), id(2), id(3)]);
    }

    #[test]
    fn strict_equality_does_not_coerce() {
        let engine = EngineId::next();
        let one = ScriptValue::primitive(engine, Value::Number(1.0));
        let text = ScriptValue::primitive(engine, Value::string("1"));
        let truthy = ScriptValue::primitive(engine, Value::Bool(true));
        assert!(one.strict_equals(&one.clone()));
        assert!(!one.strict_equals(&text));
        assert!(!one.strict_equals(&truthy));
        let nan = ScriptValue::primitive(engine, Value::Number(f64::NAN));
        assert!(!nan.strict_equals(&nan.clone()));
    }

    #[test]
    fn integers_and_floats_compare_by_value() {
        let engine = EngineId::next();
        let int = ScriptValue::primitive(engine, Value::Integer(7));
        let float = ScriptValue::primitive(engine, Value::Number(7.0));
        assert!(int.strict_equals(&float));
        assert_eq!(int.as_number(), Some(7.0));
        assert_eq!(int.as_integer(), Some(7));
        assert_eq!(float.as_integer(), None);
        assert_eq!(Value::Integer(7).kind_name(), "number");
        assert_ne!(Value::Integer(7), Value::Number(7.5));
    }

    #[test]
    fn values_from_different_engines_differ() {
        let a = ScriptValue::primitive(EngineId::next(), Value::Null);
        let b = ScriptValue::primitive(EngineId::next(), Value::Null);
        assert_ne!(a, b);
    }
}
