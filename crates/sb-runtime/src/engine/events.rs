const DATA_PROPERTY: &str = "__data__";

#[derive(Clone)]
pub(crate) struct Subscription {
    this: Value,
    callback: Value,
}

/// Script-side state of one event of one wrapped object.
pub(crate) struct EventProxy {
    signal_object: ObjectId,
    subscriptions: Vec<Subscription>,
    connection: Option<ConnectionId>,
}

impl EventProxy {
    fn new(signal_object: ObjectId) -> Self {
        Self {
            signal_object,
            subscriptions: Vec::new(),
            connection: None,
        }
    }

    fn trace(&self, out: &mut Vec<ObjectId>) {
        out.push(self.signal_object);
        for subscription in &self.subscriptions {
            out.extend(subscription.this.object_id());
            out.extend(subscription.callback.object_id());
        }
    }
}

/// Forwards native emissions into the engine: in place on the engine
/// thread, through the task queue from anywhere else.
struct BridgeSink {
    engine: EngineHandle,
    target: ObjectId,
    event: usize,
}

impl EventSink for BridgeSink {
    fn deliver(&self, args: &[Variant]) {
        let (target, event) = (self.target, self.event);
        if self.engine.is_engine_thread() {
            if let Some(engine) = live_engine(self.engine.engine_id()) {
                engine.fire_event(target, event, args.to_vec());
            }
            return;
        }
        let args = args.to_vec();
        if let Err(error) = self
            .engine
            .post(move |engine| engine.fire_event(target, event, args))
        {
            debug!("dropping event emission: {error}");
        }
    }
}

impl ScriptEngine {
    /// Subscribes `callback` to the event behind `signal` (a value read from
    /// a wrapper's event member). Subscribing the same pair twice is a no-op.
    pub fn subscribe(
        &self,
        signal: &ScriptValue,
        this: &ScriptValue,
        callback: &ScriptValue,
    ) -> Result<(), BridgeError> {
        self.ensure_live("subscribe")?;
        let (proxy, event) = self.signal_parts(signal)?;
        let this = self.unwrap_handle(this)?;
        let callback = self.unwrap_handle(callback)?;
        self.add_subscription(&proxy, event, this, callback)
    }

    /// Returns false when the pair was not subscribed.
    pub fn unsubscribe(
        &self,
        signal: &ScriptValue,
        this: &ScriptValue,
        callback: &ScriptValue,
    ) -> Result<bool, BridgeError> {
        self.ensure_live("unsubscribe")?;
        let (proxy, event) = self.signal_parts(signal)?;
        let this = self.unwrap_handle(this)?;
        let callback = self.unwrap_handle(callback)?;
        self.remove_subscription(&proxy, event, &this, &callback)
    }

    pub fn subscriber_count(&self, signal: &ScriptValue) -> Result<usize, BridgeError> {
        let (proxy, event) = self.signal_parts(signal)?;
        let count = proxy
            .events
            .borrow()
            .get(&event)
            .map_or(0, |event| event.subscriptions.len());
        Ok(count)
    }

    fn signal_parts(&self, signal: &ScriptValue) -> Result<(Rc<ObjectProxy>, usize), BridgeError> {
        let id = self
            .unwrap_handle(signal)?
            .object_id()
            .ok_or_else(|| BridgeError::invalid_argument("expected a signal"))?;
        let (target, event) = self
            .with_object(id, |object| match object.kind {
                ObjectKind::Signal { target, event } => Some((target, event)),
                _ => None,
            })?
            .ok_or_else(|| BridgeError::invalid_argument("expected a signal"))?;
        Ok((self.proxy_of(target)?, event))
    }

    /// `signal.connect(fn)`, `signal.connect(this, fn)` and the matching
    /// `disconnect` forms.
    pub(crate) fn script_connect(
        &self,
        owner: ObjectId,
        event: usize,
        connect: bool,
        args: &[Value],
    ) -> Result<(), BridgeError> {
        let proxy = self.proxy_of(owner)?;
        let verb = if connect { "connect" } else { "disconnect" };
        let (this, callback) = match args {
            [this, callback] if self.is_callable(callback) => (this.clone(), callback.clone()),
            [callback, ..] => (Value::Undefined, callback.clone()),
            [] => (Value::Undefined, Value::Undefined),
        };
        if !self.is_callable(&callback) {
            return Err(BridgeError::invalid_argument(format!(
                "Function expected as argument to '{verb}'"
            )));
        }
        if connect {
            return self.add_subscription(&proxy, event, this, callback);
        }
        if self.remove_subscription(&proxy, event, &this, &callback)? {
            Ok(())
        } else {
            Err(BridgeError::invalid_argument(format!(
                "Failed to disconnect from {}",
                proxy.full_name(&self.event_name(&proxy, event))
            )))
        }
    }

    fn event_name(&self, proxy: &ObjectProxy, event: usize) -> String {
        proxy
            .target()
            .ok()
            .and_then(|native| native.metadata().events().get(event).map(|meta| meta.name.clone()))
            .unwrap_or_else(|| format!("event{event}"))
    }

    fn add_subscription(
        &self,
        proxy: &Rc<ObjectProxy>,
        event: usize,
        this: Value,
        callback: Value,
    ) -> Result<(), BridgeError> {
        let native = proxy.target()?;
        if !self.is_callable(&callback) {
            return Err(BridgeError::NotCallable {
                what: self.type_name(&callback),
            });
        }
        let target = proxy.object_id().ok_or(BridgeError::InvalidHandle)?;
        let connect = {
            let mut events = proxy.events.borrow_mut();
            let entry = events.get_mut(&event).ok_or(BridgeError::InvalidHandle)?;
            if entry
                .subscriptions
                .iter()
                .any(|existing| existing.this == this && existing.callback == callback)
            {
                return Ok(());
            }
            entry.connection.is_none()
        };
        if connect {
            let signal = native.signal(event).ok_or_else(|| {
                BridgeError::native(format!(
                    "{} does not expose a native signal for {}",
                    proxy.class_name(),
                    self.event_name(proxy, event)
                ))
            })?;
            let connection = signal.connect(Arc::new(BridgeSink {
                engine: self.handle(),
                target,
                event,
            }));
            if let Some(entry) = proxy.events.borrow_mut().get_mut(&event) {
                entry.connection = Some(connection);
            }
        }
        if let Some(entry) = proxy.events.borrow_mut().get_mut(&event) {
            entry.subscriptions.push(Subscription {
                this: this.clone(),
                callback: callback.clone(),
            });
        }
        self.remember_subscriber(&callback, &this)
    }

    fn remove_subscription(
        &self,
        proxy: &Rc<ObjectProxy>,
        event: usize,
        this: &Value,
        callback: &Value,
    ) -> Result<bool, BridgeError> {
        let native = proxy.target()?;
        let (removed, disconnect) = {
            let mut events = proxy.events.borrow_mut();
            let Some(entry) = events.get_mut(&event) else {
                return Ok(false);
            };
            let Some(position) = entry
                .subscriptions
                .iter()
                .position(|existing| &existing.this == this && &existing.callback == callback)
            else {
                return Ok(false);
            };
            let removed = entry.subscriptions.remove(position);
            let disconnect = if entry.subscriptions.is_empty() {
                entry.connection.take()
            } else {
                None
            };
            (removed, disconnect)
        };
        if let (Some(connection), Some(signal)) = (disconnect, native.signal(event)) {
            signal.disconnect(connection);
        }
        self.forget_subscriber(&removed);
        Ok(true)
    }

    /// Keeps the receiver reachable from the callback for as long as the
    /// subscription exists.
    fn remember_subscriber(&self, callback: &Value, this: &Value) -> Result<(), BridgeError> {
        let (Some(callback), Value::Object(_)) = (callback.object_id(), this) else {
            return Ok(());
        };
        let existing = self.with_object(callback, |object| {
            object.properties.get(DATA_PROPERTY).and_then(Value::object_id)
        })?;
        let pushed = match existing {
            Some(data) => self.with_object_mut(data, |object| match &mut object.kind {
                ObjectKind::Array(items) => {
                    items.push(this.clone());
                    true
                }
                _ => false,
            })?,
            None => false,
        };
        if !pushed {
            let data = self.alloc(ObjectKind::Array(vec![this.clone()]));
            self.with_object_mut(callback, |object| {
                object
                    .properties
                    .insert(DATA_PROPERTY.to_string(), Value::Object(data))
            })?;
        }
        Ok(())
    }

    pub(crate) fn forget_subscriber(&self, subscription: &Subscription) {
        let Some(callback) = subscription.callback.object_id() else {
            return;
        };
        if !matches!(subscription.this, Value::Object(_)) {
            return;
        }
        let Ok(Some(data)) = self.with_object(callback, |object| {
            object.properties.get(DATA_PROPERTY).and_then(Value::object_id)
        }) else {
            return;
        };
        let emptied = self
            .with_object_mut(data, |object| match &mut object.kind {
                ObjectKind::Array(items) => {
                    if let Some(position) = items.iter().position(|item| item == &subscription.this) {
                        items.remove(position);
                    }
                    items.is_empty()
                }
                _ => false,
            })
            .unwrap_or(false);
        if emptied {
            if let Err(error) =
                self.with_object_mut(callback, |object| object.properties.remove(DATA_PROPERTY))
            {
                warn!("could not clear receivers of a disconnected callback: {error}");
            }
        }
    }

    /// Calls every subscriber of `event` with the emitted arguments. A
    /// throwing subscriber is reported and does not stop the others.
    fn fire_event(&self, target: ObjectId, event: usize, args: Vec<Variant>) {
        if self.is_destroyed() {
            return;
        }
        let Ok(proxy) = self.proxy_of(target) else {
            return;
        };
        if proxy.target().is_err() {
            return;
        }
        let subscriptions = proxy
            .events
            .borrow()
            .get(&event)
            .map(|event| event.subscriptions.clone())
            .unwrap_or_default();
        if subscriptions.is_empty() {
            return;
        }
        let args = match args
            .iter()
            .enumerate()
            .map(|(position, arg)| {
                self.to_script_value(arg)
                    .map_err(|error| error.at_argument(position))
            })
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(error) => {
                self.report_unhandled(&error);
                return;
            }
        };
        for subscription in subscriptions {
            let this = match subscription.this {
                Value::Undefined => Value::Object(self.current_global()),
                this => this,
            };
            if let Err(error) = self.call_value(&subscription.callback, &this, &args) {
                self.report_unhandled(&error);
            }
            if self.is_destroyed() {
                return;
            }
        }
    }
}
