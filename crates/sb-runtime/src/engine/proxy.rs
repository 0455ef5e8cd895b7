pub(crate) struct MethodEntry {
    overloads: Vec<usize>,
    max_arity: usize,
}

#[derive(Clone, Copy)]
pub(crate) struct PropertySlot {
    index: usize,
    ty: NativeType,
    read_only: bool,
}

/// Script-visible members of one class under one set of wrap options.
pub(crate) struct ReflectedSurface {
    methods: BTreeMap<String, MethodEntry>,
    properties: BTreeMap<String, PropertySlot>,
    events: BTreeMap<String, usize>,
    enumeration: Vec<String>,
}

impl ReflectedSurface {
    fn reflect(meta: &TypeMetadata, options: WrapOptions) -> Self {
        let mut enumeration = Vec::new();

        let property_start = if options.exclude_superclass_properties {
            meta.own_property_offset()
        } else {
            0
        };
        let mut properties = BTreeMap::new();
        for (index, property) in meta.properties().iter().enumerate().skip(property_start) {
            if !property.scriptable || properties.contains_key(&property.name) {
                continue;
            }
            properties.insert(
                property.name.clone(),
                PropertySlot {
                    index,
                    ty: property.ty,
                    read_only: property.read_only,
                },
            );
            enumeration.push(property.name.clone());
        }

        let method_start = if options.exclude_superclass_methods {
            meta.own_method_offset()
        } else {
            0
        };
        let mut methods: BTreeMap<String, MethodEntry> = BTreeMap::new();
        let mut method_order = Vec::new();
        for (index, method) in meta.methods().iter().enumerate().skip(method_start) {
            let excluded = match method.kind {
                MethodKind::Constructor => true,
                MethodKind::Slot => options.exclude_slots,
                MethodKind::Method => false,
            };
            if excluded || method.name == "deleteLater" {
                continue;
            }
            let entry = methods.entry(method.name.clone()).or_insert_with(|| {
                method_order.push(method.name.clone());
                MethodEntry {
                    overloads: Vec::new(),
                    max_arity: 0,
                }
            });
            entry.overloads.push(index);
            entry.max_arity = entry.max_arity.max(method.arity());
        }
        if !options.skip_methods_in_enumeration {
            enumeration.extend(method_order);
        }

        let event_start = if options.exclude_superclass_methods {
            meta.own_event_offset()
        } else {
            0
        };
        let mut events: BTreeMap<String, usize> = BTreeMap::new();
        for (index, event) in meta.events().iter().enumerate().skip(event_start) {
            match events.get(&event.name) {
                Some(&existing) if meta.events()[existing].params.len() >= event.params.len() => {}
                Some(_) => {
                    events.insert(event.name.clone(), index);
                }
                None => {
                    events.insert(event.name.clone(), index);
                    enumeration.push(event.name.clone());
                }
            }
        }

        Self {
            methods,
            properties,
            events,
            enumeration,
        }
    }

    pub(crate) fn has_member(&self, name: &str) -> bool {
        self.methods.contains_key(name)
            || self.properties.contains_key(name)
            || self.events.contains_key(name)
    }
}

/// Script-side stand-in for one native object.
pub(crate) struct ObjectProxy {
    identity: usize,
    class_name: String,
    object_name: Option<String>,
    ownership: Ownership,
    strong: RefCell<Option<Arc<dyn NativeObject>>>,
    weak: std::sync::Weak<dyn NativeObject>,
    surface: Rc<ReflectedSurface>,
    valid: Cell<bool>,
    object_id: Cell<Option<ObjectId>>,
    method_objects: RefCell<BTreeMap<String, ObjectId>>,
    events: RefCell<BTreeMap<usize, EventProxy>>,
}

impl ObjectProxy {
    pub(crate) fn class_name(&self) -> &str {
        &self.class_name
    }

    pub(crate) fn object_id(&self) -> Option<ObjectId> {
        self.object_id.get()
    }

    /// The wrapped object, or `DeletedNativeObject` once it is gone.
    pub(crate) fn target(&self) -> Result<Arc<dyn NativeObject>, BridgeError> {
        let target = if self.valid.get() {
            self.weak.upgrade()
        } else {
            None
        };
        target.ok_or_else(|| {
            self.valid.set(false);
            BridgeError::DeletedNativeObject {
                class_name: self.class_name.clone(),
            }
        })
    }

    fn full_name(&self, member: &str) -> String {
        match &self.object_name {
            Some(object_name) if !object_name.is_empty() => format!("{object_name}.{member}"),
            _ => format!("{}::{member}", self.class_name),
        }
    }

    pub(crate) fn trace(&self, out: &mut Vec<ObjectId>) {
        out.extend(self.method_objects.borrow().values().copied());
        for event in self.events.borrow().values() {
            event.trace(out);
        }
    }

    /// Subscriptions on a native-owned object stay alive for as long as the
    /// native object can still emit.
    pub(crate) fn pins_subscriptions(&self) -> bool {
        self.valid.get()
            && self.ownership == Ownership::NativeOwned
            && self.weak.strong_count() > 0
            && self
                .events
                .borrow()
                .values()
                .any(|event| !event.subscriptions.is_empty())
    }

    /// Cuts every native connection without touching the heap.
    pub(crate) fn detach(&self) {
        let events = std::mem::take(&mut *self.events.borrow_mut());
        self.disconnect_all(events);
        self.valid.set(false);
        let strong = self.strong.borrow_mut().take();
        drop(strong);
    }

    fn disconnect_all(&self, events: BTreeMap<usize, EventProxy>) -> Vec<Subscription> {
        let target = self.weak.upgrade();
        let mut dropped = Vec::new();
        for (index, event) in events {
            if let (Some(connection), Some(target)) = (event.connection, target.as_ref()) {
                if let Some(signal) = target.signal(index) {
                    signal.disconnect(connection);
                }
            }
            dropped.extend(event.subscriptions);
        }
        dropped
    }
}

impl ScriptEngine {
    /// Returns the wrapper for `native`, creating it on first use. Wrapping
    /// the same native object again yields the same script object.
    pub fn wrap(
        &self,
        native: Arc<dyn NativeObject>,
        ownership: Ownership,
        options: WrapOptions,
    ) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("wrap")?;
        let value = self.wrap_value(native, ownership, options)?;
        Ok(self.make_handle(value))
    }

    /// The native object behind a wrapper, if `value` is a live one.
    pub fn query(&self, value: &ScriptValue) -> Option<Arc<dyn NativeObject>> {
        let id = self.unwrap_handle(value).ok()?.object_id()?;
        self.proxy_of(id).ok()?.target().ok()
    }

    pub(crate) fn wrap_value(
        &self,
        native: Arc<dyn NativeObject>,
        ownership: Ownership,
        options: WrapOptions,
    ) -> Result<Value, BridgeError> {
        let identity = native_identity(&native);
        if let Some(existing) = self.existing_wrapper(identity) {
            return Ok(Value::Object(existing));
        }

        let meta = native.metadata();
        let surface = self.surface_for(&meta, options);
        let ownership = match ownership {
            Ownership::Auto if native.has_owner() || Arc::strong_count(&native) > 1 => {
                Ownership::NativeOwned
            }
            Ownership::Auto => Ownership::EngineOwned,
            explicit => explicit,
        };
        let proxy = Rc::new(ObjectProxy {
            identity,
            class_name: meta.class_name().to_string(),
            object_name: native.object_name(),
            ownership,
            strong: RefCell::new((ownership == Ownership::EngineOwned).then(|| Arc::clone(&native))),
            weak: Arc::downgrade(&native),
            surface,
            valid: Cell::new(true),
            object_id: Cell::new(None),
            method_objects: RefCell::new(BTreeMap::new()),
            events: RefCell::new(BTreeMap::new()),
        });

        let mut wrappers = self.inner.shared.wrappers.lock();
        if let Some(entry) = wrappers.get(&identity) {
            if entry.target.strong_count() > 0 && self.inner.heap.borrow().is_live(entry.object) {
                return Ok(Value::Object(entry.object));
            }
        }
        let id = self.alloc(ObjectKind::Native(Rc::clone(&proxy)));
        proxy.object_id.set(Some(id));
        wrappers.insert(
            identity,
            WrapperEntry {
                object: id,
                target: Arc::downgrade(&native),
            },
        );
        debug!("wrapped {} as {:?} ({:?})", proxy.class_name, id, ownership);
        Ok(Value::Object(id))
    }

    fn existing_wrapper(&self, identity: usize) -> Option<ObjectId> {
        let stale = {
            let wrappers = self.inner.shared.wrappers.lock();
            let entry = wrappers.get(&identity)?;
            if entry.target.strong_count() > 0 && self.inner.heap.borrow().is_live(entry.object) {
                return Some(entry.object);
            }
            entry.object
        };
        // Same address, different object: the old wrapper outlived its target.
        self.inner.shared.wrappers.lock().remove(&identity);
        if let Ok(proxy) = self.proxy_of(stale) {
            self.invalidate_proxy(&proxy);
        }
        None
    }

    fn surface_for(&self, meta: &Arc<TypeMetadata>, options: WrapOptions) -> Rc<ReflectedSurface> {
        let key = (Arc::as_ptr(meta) as usize, options);
        let mut surfaces = self.inner.surfaces.borrow_mut();
        let (_, surface) = surfaces.entry(key).or_insert_with(|| {
            (
                Arc::clone(meta),
                Rc::new(ReflectedSurface::reflect(meta, options)),
            )
        });
        Rc::clone(surface)
    }

    pub(crate) fn proxy_of(&self, id: ObjectId) -> Result<Rc<ObjectProxy>, BridgeError> {
        self.with_object(id, |object| match &object.kind {
            ObjectKind::Native(proxy) => Some(Rc::clone(proxy)),
            _ => None,
        })?
        .ok_or(BridgeError::InvalidHandle)
    }

    pub(crate) fn proxy_get(&self, proxy: &Rc<ObjectProxy>, name: &str) -> Result<Value, BridgeError> {
        let native = proxy.target()?;
        if proxy.surface.methods.contains_key(name) {
            return self.method_object(proxy, name).map(Value::Object);
        }
        if let Some(slot) = proxy.surface.properties.get(name) {
            let value = native.read_property(slot.index).map_err(BridgeError::native)?;
            return self.to_script_value(&value);
        }
        if let Some(&index) = proxy.surface.events.get(name) {
            return self.signal_object(proxy, index).map(Value::Object);
        }
        Err(BridgeError::member_not_found(&proxy.class_name, name))
    }

    pub(crate) fn proxy_set(&self, proxy: &Rc<ObjectProxy>, name: &str, value: Value) -> Result<(), BridgeError> {
        let native = proxy.target()?;
        let Some(slot) = proxy.surface.properties.get(name).copied() else {
            debug!("ignoring write to {}", proxy.full_name(name));
            return Ok(());
        };
        if slot.read_only {
            debug!("ignoring write to read-only {}", proxy.full_name(name));
            return Ok(());
        }
        let converted = self
            .to_native_value(&value, Some(slot.ty))
            .map_err(|Mismatch| BridgeError::conversion(self.type_name(&value), slot.ty.name()))?;
        native
            .write_property(slot.index, converted)
            .map_err(BridgeError::native)
    }

    pub(crate) fn proxy_member_names(&self, proxy: &Rc<ObjectProxy>) -> Result<Vec<String>, BridgeError> {
        proxy.target()?;
        Ok(proxy.surface.enumeration.clone())
    }

    fn method_object(&self, proxy: &Rc<ObjectProxy>, name: &str) -> Result<ObjectId, BridgeError> {
        let target = proxy.object_id().ok_or(BridgeError::InvalidHandle)?;
        if let Some(&cached) = proxy.method_objects.borrow().get(name) {
            if self.inner.heap.borrow().is_live(cached) {
                return Ok(cached);
            }
        }
        let id = self.alloc(ObjectKind::Method {
            target,
            name: name.to_string(),
        });
        proxy.method_objects.borrow_mut().insert(name.to_string(), id);
        Ok(id)
    }

    fn signal_object(&self, proxy: &Rc<ObjectProxy>, index: usize) -> Result<ObjectId, BridgeError> {
        let target = proxy.object_id().ok_or(BridgeError::InvalidHandle)?;
        if let Some(event) = proxy.events.borrow().get(&index) {
            return Ok(event.signal_object);
        }
        let id = self.alloc(ObjectKind::Signal {
            target,
            event: index,
        });
        proxy.events.borrow_mut().insert(index, EventProxy::new(id));
        Ok(id)
    }

    /// Unsubscribes everything, disconnects from native signals and drops
    /// the engine's reference to the native object. Later script access
    /// fails with `DeletedNativeObject`.
    pub(crate) fn invalidate_proxy(&self, proxy: &Rc<ObjectProxy>) {
        let events = std::mem::take(&mut *proxy.events.borrow_mut());
        for subscription in proxy.disconnect_all(events) {
            self.forget_subscriber(&subscription);
        }
        proxy.valid.set(false);
        let strong = proxy.strong.borrow_mut().take();
        drop(strong);
    }

    /// Called for a proxy whose script object was collected.
    pub(crate) fn release_proxy(&self, id: ObjectId, proxy: &Rc<ObjectProxy>) {
        {
            let mut wrappers = self.inner.shared.wrappers.lock();
            if wrappers
                .get(&proxy.identity)
                .is_some_and(|entry| entry.object == id)
            {
                wrappers.remove(&proxy.identity);
            }
        }
        debug!("released {} wrapper {:?} ({:?})", proxy.class_name, id, proxy.ownership);
        self.invalidate_proxy(proxy);
    }

    /// Invalidates wrappers whose native objects were destroyed elsewhere.
    pub(crate) fn reap_dead_natives(&self) {
        let dead = self
            .inner
            .shared
            .wrappers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.target.strong_count() == 0)
            .map(|(identity, entry)| (*identity, entry.object))
            .collect::<Vec<_>>();
        for (identity, object) in dead {
            {
                let mut wrappers = self.inner.shared.wrappers.lock();
                if wrappers.get(&identity).is_some_and(|entry| entry.object == object) {
                    wrappers.remove(&identity);
                }
            }
            if let Ok(proxy) = self.proxy_of(object) {
                debug!("native {} destroyed, invalidating wrapper", proxy.class_name);
                self.invalidate_proxy(&proxy);
            }
        }
    }
}
