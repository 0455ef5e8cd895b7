/// Largest run of `undefined` holes a single index write may add to an array.
const MAX_ARRAY_GAP: usize = 1024;

enum PropertyLookup {
    Found(Value),
    Accessor(Rc<NativeFn>),
    Proxy(Rc<ObjectProxy>),
    Prototype(ObjectId),
    Missing,
}

enum Callee {
    Native(String, Rc<NativeFn>),
    Script(ScriptFunction),
    Method(ObjectId, String),
}

/// Iterates the enumerable members of a value, reading each one lazily.
pub struct PropertyIterator {
    engine: ScriptEngine,
    target: ScriptValue,
    names: std::vec::IntoIter<String>,
}

impl Iterator for PropertyIterator {
    type Item = Result<(String, ScriptValue), BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.next()?;
        Some(
            self.engine
                .property(&self.target, &name)
                .map(|value| (name, value)),
        )
    }
}

impl ScriptEngine {
    pub fn undefined(&self) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Undefined)
    }

    pub fn null(&self) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Null)
    }

    pub fn new_bool(&self, value: bool) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Bool(value))
    }

    pub fn new_number(&self, value: f64) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Number(value))
    }

    /// An integral number; scripts see it as `INT` rather than `FLOAT`.
    pub fn new_integer(&self, value: i64) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Integer(value))
    }

    pub fn new_string(&self, value: &str) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::string(value))
    }

    pub fn new_bytes(&self, value: &[u8]) -> ScriptValue {
        ScriptValue::primitive(self.id(), Value::Bytes(Arc::from(value)))
    }

    pub fn new_object(&self) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("new_object")?;
        let id = self.alloc(ObjectKind::Plain);
        Ok(self.make_handle(Value::Object(id)))
    }

    pub fn new_array(&self, items: &[ScriptValue]) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("new_array")?;
        let items = items
            .iter()
            .map(|item| self.unwrap_handle(item))
            .collect::<Result<Vec<_>, _>>()?;
        let id = self.alloc(ObjectKind::Array(items));
        Ok(self.make_handle(Value::Object(id)))
    }

    pub fn new_function(
        &self,
        name: &str,
        func: impl Fn(&ScriptEngine, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, BridgeError>
            + 'static,
    ) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("new_function")?;
        let id = self.alloc(ObjectKind::NativeFunction {
            name: name.to_string(),
            func: Rc::new(func),
        });
        Ok(self.make_handle(Value::Object(id)))
    }

    pub fn new_error(&self, name: &str, message: &str) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("new_error")?;
        Ok(self.make_handle(Value::Object(self.alloc_error(name, message))))
    }

    pub(crate) fn alloc_error(&self, name: &str, message: &str) -> ObjectId {
        let id = self.alloc(ObjectKind::Error);
        let _ = self.with_object_mut(id, |object| {
            object.properties.insert("name".to_string(), Value::string(name));
            object
                .properties
                .insert("message".to_string(), Value::string(message));
        });
        id
    }

    /// Global object of the innermost running realm.
    pub fn global_object(&self) -> ScriptValue {
        self.make_handle(Value::Object(self.current_global()))
    }

    pub(crate) fn current_global(&self) -> ObjectId {
        self.inner
            .realm_stack
            .borrow()
            .last()
            .copied()
            .unwrap_or(self.inner.main_global)
    }

    pub fn register_global(&self, name: &str, value: &ScriptValue) -> Result<(), BridgeError> {
        self.ensure_live("register_global")?;
        let value = self.unwrap_handle(value)?;
        self.set_value(&Value::Object(self.inner.main_global), name, value)
    }

    pub fn register_global_object(
        &self,
        name: &str,
        native: Arc<dyn NativeObject>,
        ownership: Ownership,
    ) -> Result<ScriptValue, BridgeError> {
        let wrapper = self.wrap(native, ownership, WrapOptions::default())?;
        self.register_global(name, &wrapper)?;
        Ok(wrapper)
    }

    pub fn register_function(
        &self,
        name: &str,
        func: impl Fn(&ScriptEngine, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, BridgeError>
            + 'static,
    ) -> Result<ScriptValue, BridgeError> {
        let function = self.new_function(name, func)?;
        self.register_global(name, &function)?;
        Ok(function)
    }

    /// Registers `value` under a dotted path such as `Entities.Types.Box`,
    /// creating intermediate objects as needed.
    pub fn register_value(&self, path: &str, value: &ScriptValue) -> Result<(), BridgeError> {
        self.ensure_live("register_value")?;
        let value = self.unwrap_handle(value)?;
        let segments = path.split('.').collect::<Vec<_>>();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(BridgeError::invalid_argument(format!(
                "invalid global path \"{path}\""
            )));
        }
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| BridgeError::invalid_argument("empty global path"))?;
        let mut container = Value::Object(self.inner.main_global);
        for segment in parents {
            let existing = self.get_value(&container, segment)?;
            container = match existing {
                Value::Object(_) => existing,
                _ => {
                    let created = Value::Object(self.alloc(ObjectKind::Plain));
                    self.set_value(&container, segment, created.clone())?;
                    created
                }
            };
        }
        self.set_value(&container, last, value)
    }

    /// Registers an object of named numeric constants.
    pub fn register_enum(&self, name: &str, entries: &[(&str, i64)]) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("register_enum")?;
        let id = self.alloc(ObjectKind::Plain);
        self.with_object_mut(id, |object| {
            for (key, value) in entries {
                object
                    .properties
                    .insert((*key).to_string(), Value::Integer(*value));
            }
        })?;
        let value = self.make_handle(Value::Object(id));
        self.register_value(name, &value)?;
        Ok(value)
    }

    /// Defines `name` on the object at the dotted `parent` path (the global
    /// object when `parent` is empty) as a property backed by host callbacks.
    /// Reads call `getter` with the object as `this`; writes call `setter`
    /// with the assigned value as its only argument.
    pub fn register_getter_setter(
        &self,
        name: &str,
        getter: impl Fn(&ScriptEngine, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, BridgeError>
            + 'static,
        setter: impl Fn(&ScriptEngine, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, BridgeError>
            + 'static,
        parent: &str,
    ) -> Result<(), BridgeError> {
        self.ensure_live("register_getter_setter")?;
        let mut container = Value::Object(self.inner.main_global);
        for segment in parent.split('.').filter(|segment| !segment.is_empty()) {
            container = self.get_value(&container, segment)?;
        }
        let Value::Object(id) = container else {
            return Err(BridgeError::member_not_found("global", parent));
        };
        let accessor = Accessor {
            getter: Rc::new(getter),
            setter: Rc::new(setter),
        };
        let added = self.with_object_mut(id, |object| {
            let shadowed = object.properties.remove(name).is_some();
            object.accessors.insert(name.to_string(), accessor).is_none() && !shadowed
        })?;
        if added {
            self.note_global_keys_changed(id);
        }
        debug!("registered accessor {name} on {}", if parent.is_empty() { "global" } else { parent });
        Ok(())
    }

    pub fn property(&self, target: &ScriptValue, name: &str) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("property")?;
        let target = self.unwrap_handle(target)?;
        let value = self.get_value(&target, name)?;
        Ok(self.make_handle(value))
    }

    pub fn set_property(
        &self,
        target: &ScriptValue,
        name: &str,
        value: &ScriptValue,
    ) -> Result<(), BridgeError> {
        self.ensure_live("set_property")?;
        let target = self.unwrap_handle(target)?;
        let value = self.unwrap_handle(value)?;
        self.set_value(&target, name, value)
    }

    pub fn enumerate_members(&self, target: &ScriptValue) -> Result<Vec<String>, BridgeError> {
        self.ensure_live("enumerate_members")?;
        let target = self.unwrap_handle(target)?;
        self.member_names(&target)
    }

    pub fn new_iterator(&self, target: &ScriptValue) -> Result<PropertyIterator, BridgeError> {
        let names = self.enumerate_members(target)?;
        Ok(PropertyIterator {
            engine: self.clone(),
            target: target.clone(),
            names: names.into_iter(),
        })
    }

    pub fn call(
        &self,
        callee: &ScriptValue,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("call")?;
        let callee = self.unwrap_handle(callee)?;
        let this = self.unwrap_handle(this)?;
        let args = self.unwrap_all(args)?;
        let result = self.call_value(&callee, &this, &args)?;
        Ok(self.make_handle(result))
    }

    /// Calls `callee` as a constructor: `this` is a fresh object, which is
    /// also the result unless the callee returns an object of its own.
    pub fn construct(
        &self,
        callee: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("construct")?;
        let callee = self.unwrap_handle(callee)?;
        let args = self.unwrap_all(args)?;
        if !self.is_callable(&callee) {
            return Err(BridgeError::NotCallable {
                what: self.type_name(&callee),
            });
        }
        let this = Value::Object(self.alloc(ObjectKind::Plain));
        let result = self.call_value(&callee, &this, &args)?;
        Ok(self.make_handle(match result {
            Value::Object(_) => result,
            _ => this,
        }))
    }

    pub fn strict_equals(&self, a: &ScriptValue, b: &ScriptValue) -> bool {
        a.strict_equals(b)
    }

    /// `undefined`, `null`, `boolean`, `string`, `number`, `bytes`, or the
    /// class name of an object.
    pub fn value_type(&self, value: &ScriptValue) -> String {
        match self.unwrap_handle(value) {
            Ok(value) => self.type_name(&value),
            Err(_) => "invalid".to_string(),
        }
    }

    pub fn is_callable_value(&self, value: &ScriptValue) -> bool {
        self.unwrap_handle(value)
            .map(|value| self.is_callable(&value))
            .unwrap_or(false)
    }

    /// Human-readable rendering used by `print` and string conversions.
    pub fn to_display_string(&self, value: &ScriptValue) -> String {
        match self.unwrap_handle(value) {
            Ok(value) => self.display(&value),
            Err(_) => "[invalid]".to_string(),
        }
    }

    fn unwrap_all(&self, values: &[ScriptValue]) -> Result<Vec<Value>, BridgeError> {
        values.iter().map(|value| self.unwrap_handle(value)).collect()
    }

    pub(crate) fn type_name(&self, value: &Value) -> String {
        match value {
            Value::Object(id) => self
                .with_object(*id, HeapObject::class_name)
                .unwrap_or_else(|_| "invalid".to_string()),
            other => other.kind_name().to_string(),
        }
    }

    pub(crate) fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Object(id) => self.with_object(*id, HeapObject::is_callable).unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) fn display(&self, value: &Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(value) => value.to_string(),
            Value::Number(value) => format_number(*value),
            Value::Integer(value) => value.to_string(),
            Value::String(value) => value.to_string(),
            Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Object(id) => {
                let rendered = self.with_object(*id, |object| match &object.kind {
                    ObjectKind::Array(items) => Err(items.clone()),
                    ObjectKind::Error => Ok(format!(
                        "{}: {}",
                        object.class_name(),
                        object
                            .properties
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                    )),
                    _ => Ok(format!("[object {}]", object.class_name())),
                });
                match rendered {
                    Ok(Ok(text)) => text,
                    Ok(Err(items)) => items
                        .iter()
                        .map(|item| self.display(item))
                        .collect::<Vec<_>>()
                        .join(","),
                    Err(_) => "[invalid]".to_string(),
                }
            }
        }
    }

    pub(crate) fn get_value(&self, target: &Value, name: &str) -> Result<Value, BridgeError> {
        let id = match target {
            Value::Object(id) => *id,
            Value::Undefined | Value::Null => {
                return Err(BridgeError::member_not_found(target.kind_name(), name))
            }
            Value::String(text) if name == "length" => {
                return Ok(Value::Integer(text.chars().count() as i64))
            }
            Value::Bytes(bytes) if name == "length" => {
                return Ok(Value::Integer(bytes.len() as i64))
            }
            _ => return Ok(Value::Undefined),
        };
        let lookup = self.with_object(id, |object| {
            if let Some(accessor) = object.accessors.get(name) {
                return PropertyLookup::Accessor(Rc::clone(&accessor.getter));
            }
            if let ObjectKind::Native(proxy) = &object.kind {
                if !object.properties.contains_key(name) || proxy.surface.has_member(name) {
                    return PropertyLookup::Proxy(Rc::clone(proxy));
                }
            }
            if let ObjectKind::Array(items) = &object.kind {
                if name == "length" {
                    return PropertyLookup::Found(Value::Integer(items.len() as i64));
                }
                if let Some(item) = name.parse::<usize>().ok().and_then(|index| items.get(index)) {
                    return PropertyLookup::Found(item.clone());
                }
            }
            if let Some(value) = object.properties.get(name) {
                return PropertyLookup::Found(value.clone());
            }
            match &object.kind {
                ObjectKind::Variant {
                    prototype: Some(prototype),
                    ..
                } => PropertyLookup::Prototype(*prototype),
                _ => PropertyLookup::Missing,
            }
        })?;
        match lookup {
            PropertyLookup::Found(value) => Ok(value),
            PropertyLookup::Accessor(getter) => self.call_native(name, &getter, target, &[]),
            PropertyLookup::Proxy(proxy) => self.proxy_get(&proxy, name),
            PropertyLookup::Prototype(prototype) => self.get_value(&Value::Object(prototype), name),
            PropertyLookup::Missing => Ok(Value::Undefined),
        }
    }

    pub(crate) fn set_value(&self, target: &Value, name: &str, value: Value) -> Result<(), BridgeError> {
        let Value::Object(id) = target else {
            return Err(BridgeError::member_not_found(target.kind_name(), name));
        };
        let id = *id;
        let (setter, proxy) = self.with_object(id, |object| {
            let setter = object
                .accessors
                .get(name)
                .map(|accessor| Rc::clone(&accessor.setter));
            let proxy = match &object.kind {
                ObjectKind::Native(proxy) if proxy.surface.has_member(name) => Some(Rc::clone(proxy)),
                _ => None,
            };
            (setter, proxy)
        })?;
        if let Some(setter) = setter {
            self.call_native(name, &setter, target, &[value])?;
            return Ok(());
        }
        if let Some(proxy) = proxy {
            return self.proxy_set(&proxy, name, value);
        }
        let added = self.with_object_mut(id, |object| {
            if let ObjectKind::Array(items) = &mut object.kind {
                if let Ok(index) = name.parse::<usize>() {
                    if let Some(slot) = items.get_mut(index) {
                        *slot = value;
                        return false;
                    }
                    // Far-out indices are kept as plain keys instead of growing the array.
                    match index.checked_add(1) {
                        Some(length) if index - items.len() <= MAX_ARRAY_GAP => {
                            items.resize(length, Value::Undefined);
                            items[index] = value;
                            return false;
                        }
                        _ => {}
                    }
                }
            }
            object.properties.insert(name.to_string(), value).is_none()
        })?;
        if added {
            self.note_global_keys_changed(id);
        }
        Ok(())
    }

    pub(crate) fn member_names(&self, target: &Value) -> Result<Vec<String>, BridgeError> {
        let Value::Object(id) = target else {
            return Ok(Vec::new());
        };
        let (proxy, mut names) = self.with_object(*id, |object| {
            let mut names = match &object.kind {
                ObjectKind::Array(items) => (0..items.len()).map(|index| index.to_string()).collect(),
                _ => Vec::new(),
            };
            names.extend(object.properties.keys().cloned());
            names.extend(object.accessors.keys().cloned());
            let proxy = match &object.kind {
                ObjectKind::Native(proxy) => Some(Rc::clone(proxy)),
                _ => None,
            };
            (proxy, names)
        })?;
        if let Some(proxy) = proxy {
            let mut reflected = self.proxy_member_names(&proxy)?;
            reflected.append(&mut names);
            names = reflected;
        }
        Ok(names)
    }

    pub(crate) fn call_value(&self, callee: &Value, this: &Value, args: &[Value]) -> Result<Value, BridgeError> {
        let Value::Object(id) = callee else {
            return Err(BridgeError::NotCallable {
                what: self.type_name(callee),
            });
        };
        let resolved = self.with_object(*id, |object| match &object.kind {
            ObjectKind::NativeFunction { name, func } => Some(Callee::Native(name.clone(), Rc::clone(func))),
            ObjectKind::ScriptFunction(function) => Some(Callee::Script(function.clone())),
            ObjectKind::Method { target, name } => Some(Callee::Method(*target, name.clone())),
            _ => None,
        })?;
        match resolved {
            Some(Callee::Native(name, func)) => self.call_native(&name, &func, this, args),
            Some(Callee::Script(function)) => self.call_script_function(&function, this, args),
            Some(Callee::Method(target, name)) => {
                let proxy = self.proxy_of(target)?;
                self.dispatch_method(&proxy, &name, args)
            }
            None => Err(BridgeError::NotCallable {
                what: self.type_name(callee),
            }),
        }
    }

    fn call_native(&self, name: &str, func: &Rc<NativeFn>, this: &Value, args: &[Value]) -> Result<Value, BridgeError> {
        let _frame = self.enter_frame(Frame::new(name, this.clone(), args.to_vec()))?;
        let this = self.make_handle(this.clone());
        let args = args.iter().cloned().map(|arg| self.make_handle(arg)).collect::<Vec<_>>();
        let result = (**func)(self, &this, &args)?;
        self.unwrap_handle(&result)
    }

    /// `target.name(args)` as written in a script.
    pub(crate) fn invoke_member(&self, target: ObjectId, name: &str, args: &[Value]) -> Result<Value, BridgeError> {
        enum Route {
            Proxy(Rc<ObjectProxy>),
            Signal(ObjectId, usize),
            SelfCall,
            Lookup,
        }
        let route = self.with_object(target, |object| match &object.kind {
            ObjectKind::Native(proxy) if proxy.surface.methods.contains_key(name) => {
                Route::Proxy(Rc::clone(proxy))
            }
            ObjectKind::Signal { target, event } if name == "connect" || name == "disconnect" => {
                Route::Signal(*target, *event)
            }
            _ if name == "call" && object.is_callable() => Route::SelfCall,
            _ => Route::Lookup,
        })?;
        match route {
            Route::Proxy(proxy) => self.dispatch_method(&proxy, name, args),
            Route::Signal(owner, event) => {
                self.script_connect(owner, event, name == "connect", args)?;
                Ok(Value::Undefined)
            }
            Route::SelfCall => self.call_value(&Value::Object(target), &Value::Undefined, args),
            Route::Lookup => {
                let member = self.get_value(&Value::Object(target), name)?;
                if !self.is_callable(&member) {
                    return Err(BridgeError::NotCallable {
                        what: format!("{}.{name}", self.type_name(&Value::Object(target))),
                    });
                }
                self.call_value(&member, &Value::Object(target), args)
            }
        }
    }
}

/// Integral values print without a fraction, the way scripts expect.
pub(crate) fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
