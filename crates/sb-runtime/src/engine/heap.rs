pub(crate) enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    Error,
    NativeFunction {
        name: String,
        func: Rc<NativeFn>,
    },
    ScriptFunction(ScriptFunction),
    /// Script-visible overload set of a wrapped native object.
    Method {
        target: ObjectId,
        name: String,
    },
    Native(Rc<ObjectProxy>),
    /// Script-visible event source of a wrapped native object.
    Signal {
        target: ObjectId,
        event: usize,
    },
    /// A non-reflective native value with a script prototype.
    Variant {
        value: Variant,
        prototype: Option<ObjectId>,
    },
}

#[derive(Clone)]
pub(crate) struct ScriptFunction {
    fn_ptr: FnPtr,
    program: Program,
    /// Global object of the realm the function was created in.
    global: ObjectId,
}

/// Host callbacks standing in for a property's storage.
#[derive(Clone)]
pub(crate) struct Accessor {
    getter: Rc<NativeFn>,
    setter: Rc<NativeFn>,
}

pub(crate) struct HeapObject {
    kind: ObjectKind,
    properties: BTreeMap<String, Value>,
    accessors: BTreeMap<String, Accessor>,
    finalizers: Vec<Box<dyn FnOnce()>>,
}

impl HeapObject {
    fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: BTreeMap::new(),
            accessors: BTreeMap::new(),
            finalizers: Vec::new(),
        }
    }

    fn is_callable(&self) -> bool {
        matches!(
            self.kind,
            ObjectKind::NativeFunction { .. }
                | ObjectKind::ScriptFunction(_)
                | ObjectKind::Method { .. }
        )
    }

    fn class_name(&self) -> String {
        match &self.kind {
            ObjectKind::Plain => "Object".to_string(),
            ObjectKind::Array(_) => "Array".to_string(),
            ObjectKind::Error => match self.properties.get("name") {
                Some(Value::String(name)) => name.to_string(),
                _ => "Error".to_string(),
            },
            ObjectKind::NativeFunction { .. }
            | ObjectKind::ScriptFunction(_)
            | ObjectKind::Method { .. } => "Function".to_string(),
            ObjectKind::Native(proxy) => proxy.class_name().to_string(),
            ObjectKind::Signal { .. } => "Signal".to_string(),
            ObjectKind::Variant { value, .. } => value.native_type().name().to_string(),
        }
    }

    fn trace(&self, out: &mut Vec<ObjectId>) {
        out.extend(self.properties.values().filter_map(Value::object_id));
        match &self.kind {
            ObjectKind::Array(items) => out.extend(items.iter().filter_map(Value::object_id)),
            ObjectKind::ScriptFunction(function) => {
                out.push(function.global);
                for captured in function.fn_ptr.curry() {
                    collect_dynamic_ids(captured, out);
                }
            }
            ObjectKind::Method { target, .. } | ObjectKind::Signal { target, .. } => {
                out.push(*target)
            }
            ObjectKind::Native(proxy) => proxy.trace(out),
            ObjectKind::Variant {
                prototype: Some(prototype),
                ..
            } => out.push(*prototype),
            _ => {}
        }
    }
}

struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

#[derive(Default)]
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: HashMap<ObjectId, usize>,
    live: usize,
    allocated_since_collect: usize,
}

impl Heap {
    fn alloc(&mut self, kind: ObjectKind) -> ObjectId {
        self.live += 1;
        self.allocated_since_collect += 1;
        let object = HeapObject::new(kind);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            return ObjectId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            object: Some(object),
        });
        ObjectId {
            index,
            generation: 1,
        }
    }

    fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_ref()
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.object.as_mut()
    }

    fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    fn add_root(&mut self, id: ObjectId) {
        *self.roots.entry(id).or_insert(0) += 1;
    }

    fn release_root(&mut self, id: ObjectId) {
        if let Some(count) = self.roots.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.roots.remove(&id);
            }
        }
    }

    fn root_count(&self, id: ObjectId) -> usize {
        self.roots.get(&id).copied().unwrap_or(0)
    }

    fn live_count(&self) -> usize {
        self.live
    }

    fn mark(&self, extra_roots: impl IntoIterator<Item = ObjectId>) -> HashSet<ObjectId> {
        let mut marked = HashSet::new();
        let mut pending = self.roots.keys().copied().collect::<Vec<_>>();
        pending.extend(extra_roots);
        while let Some(id) = pending.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(object) = self.get(id) {
                object.trace(&mut pending);
            }
        }
        marked
    }

    /// Frees every live object not in `marked` and hands the freed objects
    /// back so their finalizers run outside the heap borrow.
    fn sweep(&mut self, marked: &HashSet<ObjectId>) -> Vec<(ObjectId, HeapObject)> {
        let mut freed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let id = ObjectId {
                index: index as u32,
                generation: slot.generation,
            };
            if slot.object.is_none() || marked.contains(&id) {
                continue;
            }
            if let Some(object) = slot.object.take() {
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(index as u32);
                freed.push((id, object));
            }
        }
        self.live -= freed.len();
        self.allocated_since_collect = 0;
        freed
    }

    fn clear(&mut self) -> Vec<(ObjectId, HeapObject)> {
        self.roots.clear();
        self.sweep(&HashSet::new())
    }
}

impl ScriptEngine {
    pub(crate) fn alloc(&self, kind: ObjectKind) -> ObjectId {
        self.inner.heap.borrow_mut().alloc(kind)
    }

    pub(crate) fn with_object<R>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&HeapObject) -> R,
    ) -> Result<R, BridgeError> {
        let heap = self.inner.heap.borrow();
        heap.get(id).map(f).ok_or(BridgeError::InvalidHandle)
    }

    pub(crate) fn with_object_mut<R>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&mut HeapObject) -> R,
    ) -> Result<R, BridgeError> {
        let mut heap = self.inner.heap.borrow_mut();
        heap.get_mut(id).map(f).ok_or(BridgeError::InvalidHandle)
    }

    /// A rooted handle for `value`. Object handles keep their target alive
    /// until dropped and drained from the release queue.
    pub(crate) fn make_handle(&self, value: Value) -> ScriptValue {
        let engine = self.inner.shared.id;
        match value {
            Value::Object(id) => {
                self.inner.heap.borrow_mut().add_root(id);
                ScriptValue::rooted(engine, id, &self.inner.shared.releases)
            }
            other => ScriptValue::primitive(engine, other),
        }
    }

    /// Checks that `value` belongs to this engine and still refers to a live
    /// object.
    pub(crate) fn unwrap_handle(&self, value: &ScriptValue) -> Result<Value, BridgeError> {
        if value.engine_id() != self.inner.shared.id {
            return Err(BridgeError::InvalidHandle);
        }
        if let Some(id) = value.object_id() {
            if !self.inner.heap.borrow().is_live(id) {
                return Err(BridgeError::InvalidHandle);
            }
        }
        Ok(value.value().clone())
    }

    pub fn is_valid(&self, value: &ScriptValue) -> bool {
        !self.is_destroyed() && self.unwrap_handle(value).is_ok()
    }

    /// Registers `callback` to run once the object behind `value` has been
    /// collected.
    pub fn register_finalizer(
        &self,
        value: &ScriptValue,
        callback: impl FnOnce() + 'static,
    ) -> Result<(), BridgeError> {
        self.ensure_live("register_finalizer")?;
        let id = self
            .unwrap_handle(value)?
            .object_id()
            .ok_or_else(|| BridgeError::invalid_argument("finalizers need an object value"))?;
        self.with_object_mut(id, |object| object.finalizers.push(Box::new(callback)))
    }

    pub fn live_objects(&self) -> usize {
        self.inner.heap.borrow().live_count()
    }

    /// Marks from every root and frees the rest. Returns the number of
    /// objects freed; does nothing while an evaluation or native call is in
    /// progress.
    pub fn collect_garbage(&self) -> usize {
        if self.is_destroyed() || self.is_evaluating() || !self.inner.frames.borrow().is_empty() {
            return 0;
        }
        self.drain_releases();
        let extra_roots = self.extra_roots();
        let freed = {
            let mut heap = self.inner.heap.borrow_mut();
            let marked = heap.mark(extra_roots);
            heap.sweep(&marked)
        };
        let count = freed.len();
        if count > 0 {
            debug!("collected {count} objects");
        }
        self.finalize(freed);
        count
    }

    fn extra_roots(&self) -> Vec<ObjectId> {
        let mut roots = vec![self.inner.main_global];
        roots.extend(self.inner.realm_stack.borrow().iter().copied());
        roots.extend(self.inner.prototypes.borrow().values().copied());
        for frame in self.inner.frames.borrow().iter() {
            frame.trace(&mut roots);
        }
        let heap = self.inner.heap.borrow();
        for slot in &heap.slots {
            if let Some(HeapObject {
                kind: ObjectKind::Native(proxy),
                ..
            }) = &slot.object
            {
                if proxy.pins_subscriptions() {
                    proxy.trace(&mut roots);
                    roots.extend(proxy.object_id());
                }
            }
        }
        roots
    }

    fn drain_releases(&self) {
        let released = self.inner.shared.releases.drain();
        if released.is_empty() {
            return;
        }
        let mut heap = self.inner.heap.borrow_mut();
        for id in released {
            heap.release_root(id);
        }
    }

    /// Runs finalizers and proxy teardown for freed objects. No heap borrow
    /// is held here, so native destructors may re-enter the engine.
    fn finalize(&self, freed: Vec<(ObjectId, HeapObject)>) {
        let mut interned = self.inner.interned_functions.borrow_mut();
        interned.retain(|_, id| !freed.iter().any(|(dead, _)| dead == id));
        drop(interned);
        for (id, object) in freed {
            for finalizer in object.finalizers {
                finalizer();
            }
            if let ObjectKind::Native(proxy) = object.kind {
                self.release_proxy(id, &proxy);
            }
        }
    }
}

#[cfg(test)]
mod heap_tests {
    use super::*;
    use super::runtime_test_support::*;

    #[test]
    fn stale_ids_are_detected_after_reuse() {
        let mut heap = Heap::default();
        let first = heap.alloc(ObjectKind::Plain);
        let freed = heap.sweep(&HashSet::new());
        assert_eq!(freed.len(), 1);
        let second = heap.alloc(ObjectKind::Plain);
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(heap.get(first).is_none());
        assert!(heap.get(second).is_some());
    }

    #[test]
    fn mark_follows_properties_and_array_elements() {
        let mut heap = Heap::default();
        let leaf = heap.alloc(ObjectKind::Plain);
        let array = heap.alloc(ObjectKind::Array(vec![Value::Object(leaf)]));
        let root = heap.alloc(ObjectKind::Plain);
        heap.get_mut(root)
            .expect("root should be live")
            .properties
            .insert("items".to_string(), Value::Object(array));
        let orphan = heap.alloc(ObjectKind::Plain);
        heap.add_root(root);

        let marked = heap.mark(Vec::new());
        assert!(marked.contains(&leaf));
        assert!(marked.contains(&array));
        assert!(!marked.contains(&orphan));
        let freed = heap.sweep(&marked);
        assert_eq!(freed.len(), 1);
        assert_eq!(heap.live_count(), 3);
    }

    #[test]
    fn handles_root_until_release_queue_is_drained() {
        let engine = engine();
        let before = engine.live_objects();
        let object = engine.new_object().expect("object should allocate");
        assert!(engine.is_valid(&object));
        assert_eq!(engine.collect_garbage(), 0);

        drop(object);
        assert_eq!(engine.live_objects(), before + 1);
        engine.process_events();
        assert_eq!(engine.collect_garbage(), 1);
        assert_eq!(engine.live_objects(), before);
    }

    #[test]
    fn finalizer_runs_after_collection() {
        let engine = engine();
        let flag = Rc::new(Cell::new(false));
        let object = engine.new_object().expect("object should allocate");
        let seen = Rc::clone(&flag);
        engine
            .register_finalizer(&object, move || seen.set(true))
            .expect("finalizer should register");
        let stale = object.clone();
        drop(object);
        engine.process_events();
        assert!(!flag.get());
        drop(stale);
        engine.process_events();
        engine.collect_garbage();
        assert!(flag.get());
    }

    #[test]
    fn handle_from_other_engine_is_rejected() {
        let first = engine();
        let second = engine();
        let object = first.new_object().expect("object should allocate");
        let error = second
            .property(&object, "x")
            .expect_err("foreign handle should fail");
        assert_eq!(error.code(), "BRIDGE_INVALID_HANDLE");
        assert!(!second.is_valid(&object));
    }
}
