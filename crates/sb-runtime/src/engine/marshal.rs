pub const PENALTY_EXACT: u32 = 0;
pub const PENALTY_MILD: u32 = 5;
pub const PENALTY_STRONG: u32 = 100;
const MAX_MARSHAL_DEPTH: usize = 32;

/// Script-to-native conversion failed; callers turn this into a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mismatch;

pub type MarshalFn = dyn Fn(&ScriptEngine, &Variant) -> Result<ScriptValue, BridgeError>;
pub type DemarshalFn = dyn Fn(&ScriptEngine, &ScriptValue) -> Option<Variant>;

#[derive(Clone)]
struct CustomConverter {
    marshal: Rc<MarshalFn>,
    demarshal: Rc<DemarshalFn>,
}

enum Shape {
    Native(Rc<ObjectProxy>),
    Variant(Variant),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
    Other,
}

impl ScriptEngine {
    /// Installs a converter pair used exclusively for `native_type` in both
    /// directions.
    pub fn register_custom_type(
        &self,
        native_type: NativeType,
        marshal: impl Fn(&ScriptEngine, &Variant) -> Result<ScriptValue, BridgeError> + 'static,
        demarshal: impl Fn(&ScriptEngine, &ScriptValue) -> Option<Variant> + 'static,
    ) {
        self.inner.converters.borrow_mut().insert(
            native_type,
            CustomConverter {
                marshal: Rc::new(marshal),
                demarshal: Rc::new(demarshal),
            },
        );
    }

    /// Prototype given to every variant wrapper of custom values tagged `tag`.
    pub fn set_default_prototype(
        &self,
        tag: &'static str,
        prototype: &ScriptValue,
    ) -> Result<(), BridgeError> {
        self.ensure_live("set_default_prototype")?;
        let id = self
            .unwrap_handle(prototype)?
            .object_id()
            .ok_or_else(|| BridgeError::invalid_argument("prototype must be an object"))?;
        self.inner.prototypes.borrow_mut().insert(tag, id);
        Ok(())
    }

    /// Wraps `value` opaquely, with the default prototype of its custom tag.
    pub fn new_variant(&self, value: Variant) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("new_variant")?;
        let id = self.alloc_variant(value);
        Ok(self.make_handle(Value::Object(id)))
    }

    /// Duck-typed conversion: the value's own kind picks the representation.
    pub fn to_variant(&self, value: &ScriptValue) -> Variant {
        self.unwrap_handle(value)
            .ok()
            .and_then(|value| self.to_native_value(&value, None).ok())
            .unwrap_or(Variant::Invalid)
    }

    pub fn to_native(&self, value: &ScriptValue, target: NativeType) -> Result<Variant, BridgeError> {
        self.ensure_live("to_native")?;
        let value = self.unwrap_handle(value)?;
        self.to_native_value(&value, Some(target))
            .map_err(|Mismatch| BridgeError::conversion(self.type_name(&value), target.name()))
    }

    pub fn to_script(&self, value: &Variant) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("to_script")?;
        let value = self.to_script_value(value)?;
        Ok(self.make_handle(value))
    }

    pub fn cast_penalty(&self, value: &ScriptValue, target: NativeType) -> u32 {
        match self.unwrap_handle(value) {
            Ok(value) => self.penalty(&value, target),
            Err(_) => PENALTY_STRONG,
        }
    }

    fn converter(&self, native_type: NativeType) -> Option<CustomConverter> {
        self.inner.converters.borrow().get(&native_type).cloned()
    }

    fn alloc_variant(&self, value: Variant) -> ObjectId {
        let prototype = match &value {
            Variant::Custom(custom) => self.inner.prototypes.borrow().get(custom.tag()).copied(),
            _ => None,
        };
        self.alloc(ObjectKind::Variant { value, prototype })
    }

    fn shape(&self, id: ObjectId) -> Shape {
        self.with_object(id, |object| match &object.kind {
            ObjectKind::Native(proxy) => Shape::Native(Rc::clone(proxy)),
            ObjectKind::Variant { value, .. } => Shape::Variant(value.clone()),
            ObjectKind::Array(items) => Shape::Array(items.clone()),
            ObjectKind::Plain | ObjectKind::Error => Shape::Map(
                object
                    .properties
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            _ => Shape::Other,
        })
        .unwrap_or(Shape::Other)
    }

    pub(crate) fn to_native_value(&self, value: &Value, hint: Option<NativeType>) -> Result<Variant, Mismatch> {
        self.to_native_at(value, hint.unwrap_or(NativeType::Any), 0)
    }

    fn to_native_at(&self, value: &Value, hint: NativeType, depth: usize) -> Result<Variant, Mismatch> {
        if depth > MAX_MARSHAL_DEPTH {
            return Err(Mismatch);
        }
        if let Some(converter) = self.converter(hint) {
            let handle = self.make_handle(value.clone());
            return (converter.demarshal)(self, &handle).ok_or(Mismatch);
        }
        match hint {
            NativeType::Any => Ok(self.duck_typed(value, depth)),
            NativeType::Void => Ok(Variant::Invalid),
            NativeType::ScriptValue => Ok(Variant::Script(self.make_handle(value.clone()))),
            NativeType::Bool => Ok(Variant::Bool(truthy(value))),
            NativeType::String => Ok(Variant::String(self.display(value))),
            numeric if numeric.is_numeric() => {
                if matches!(value, Value::Object(_)) {
                    return Err(Mismatch);
                }
                let number = to_number(value);
                Ok(match numeric {
                    NativeType::I16 => Variant::I16(to_int32(number) as i16),
                    NativeType::U16 => Variant::U16(to_uint32(number) as u16),
                    NativeType::I32 => Variant::I32(to_int32(number)),
                    NativeType::U32 => Variant::U32(to_uint32(number)),
                    NativeType::I64 => Variant::I64(
                        value.as_integer().unwrap_or_else(|| to_integer(number) as i64),
                    ),
                    NativeType::U64 => Variant::U64(to_integer(number) as u64),
                    NativeType::F32 => Variant::F32(number as f32),
                    _ => Variant::F64(number),
                })
            }
            NativeType::Bytes => match value {
                Value::Bytes(bytes) => Ok(Variant::Bytes(bytes.to_vec())),
                Value::String(text) => Ok(Variant::Bytes(text.as_bytes().to_vec())),
                Value::Object(id) => match self.shape(*id) {
                    Shape::Variant(bytes @ Variant::Bytes(_)) => Ok(bytes),
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            NativeType::DateTime => match value {
                Value::Integer(ms) => Ok(Variant::DateTime(*ms)),
                Value::Number(ms) if ms.is_finite() => Ok(Variant::DateTime(*ms as i64)),
                Value::Object(id) => match self.shape(*id) {
                    Shape::Variant(date @ Variant::DateTime(_)) => Ok(date),
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            NativeType::List => match value {
                Value::Object(id) => match self.shape(*id) {
                    Shape::Array(items) => items
                        .iter()
                        .map(|item| self.to_native_at(item, NativeType::Any, depth + 1))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Variant::List),
                    Shape::Variant(list @ Variant::List(_)) => Ok(list),
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            NativeType::Map => match value {
                Value::Object(id) => match self.shape(*id) {
                    Shape::Map(entries) => entries
                        .iter()
                        .map(|(key, item)| {
                            self.to_native_at(item, NativeType::Any, depth + 1)
                                .map(|item| (key.clone(), item))
                        })
                        .collect::<Result<BTreeMap<_, _>, _>>()
                        .map(Variant::Map),
                    Shape::Variant(map @ Variant::Map(_)) => Ok(map),
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            NativeType::Object | NativeType::ObjectOf(_) => match value {
                Value::Undefined | Value::Null => Ok(Variant::Null),
                Value::Object(id) => match self.shape(*id) {
                    Shape::Native(proxy) => {
                        let native = proxy.target().map_err(|_| Mismatch)?;
                        match hint {
                            NativeType::ObjectOf(class_name)
                                if !native.metadata().inherits(class_name) =>
                            {
                                Err(Mismatch)
                            }
                            _ => Ok(Variant::Object(native)),
                        }
                    }
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            NativeType::Custom(tag) => match value {
                Value::Object(id) => match self.shape(*id) {
                    Shape::Variant(Variant::Custom(custom)) if custom.tag() == tag => {
                        Ok(Variant::Custom(custom))
                    }
                    _ => Err(Mismatch),
                },
                _ => Err(Mismatch),
            },
            _ => Err(Mismatch),
        }
    }

    fn duck_typed(&self, value: &Value, depth: usize) -> Variant {
        match value {
            Value::Undefined => Variant::Invalid,
            Value::Null => Variant::Null,
            Value::Bool(value) => Variant::Bool(*value),
            Value::Number(value) => Variant::F64(*value),
            Value::Integer(value) => Variant::F64(*value as f64),
            Value::String(value) => Variant::String(value.to_string()),
            Value::Bytes(bytes) => Variant::Bytes(bytes.to_vec()),
            Value::Object(id) => match self.shape(*id) {
                Shape::Native(proxy) => proxy.target().map(Variant::Object).unwrap_or(Variant::Null),
                Shape::Variant(variant) => variant,
                Shape::Array(items) if depth < MAX_MARSHAL_DEPTH => Variant::List(
                    items
                        .iter()
                        .map(|item| self.duck_typed(item, depth + 1))
                        .collect(),
                ),
                Shape::Map(entries) if depth < MAX_MARSHAL_DEPTH => Variant::Map(
                    entries
                        .iter()
                        .map(|(key, item)| (key.clone(), self.duck_typed(item, depth + 1)))
                        .collect(),
                ),
                _ => Variant::Script(self.make_handle(value.clone())),
            },
        }
    }

    pub(crate) fn to_script_value(&self, value: &Variant) -> Result<Value, BridgeError> {
        if let Some(converter) = self.converter(value.native_type()) {
            let converted = (converter.marshal)(self, value)?;
            return self.unwrap_handle(&converted);
        }
        Ok(match value {
            Variant::Invalid => Value::Undefined,
            Variant::Null => Value::Null,
            Variant::Bool(value) => Value::Bool(*value),
            Variant::String(value) => Value::string(value),
            Variant::Bytes(bytes) => Value::Bytes(Arc::from(bytes.as_slice())),
            Variant::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.to_script_value(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Object(self.alloc(ObjectKind::Array(items)))
            }
            Variant::Map(entries) => {
                let mut properties = BTreeMap::new();
                for (key, item) in entries {
                    properties.insert(key.clone(), self.to_script_value(item)?);
                }
                let id = self.alloc(ObjectKind::Plain);
                self.with_object_mut(id, |object| object.properties = properties)?;
                Value::Object(id)
            }
            Variant::Object(native) => {
                self.wrap_value(Arc::clone(native), Ownership::Auto, WrapOptions::default())?
            }
            Variant::Custom(_) => Value::Object(self.alloc_variant(value.clone())),
            Variant::Script(handle) => self.unwrap_handle(handle)?,
            numeric => match numeric.to_i64() {
                Some(integer) => Value::Integer(integer),
                None => Value::Number(numeric.to_f64().unwrap_or(f64::NAN)),
            },
        })
    }

    /// Cost of converting `value` to `target` during overload resolution.
    pub(crate) fn penalty(&self, value: &Value, target: NativeType) -> u32 {
        let textual = matches!(
            target,
            NativeType::String | NativeType::Bytes | NativeType::DateTime
        );
        match value {
            Value::Number(_) | Value::Integer(_) => match target {
                NativeType::Bool => PENALTY_MILD,
                numeric if numeric.is_numeric() => PENALTY_EXACT,
                _ if textual => PENALTY_STRONG,
                _ => PENALTY_MILD,
            },
            Value::String(_) => match target {
                NativeType::Bool => PENALTY_STRONG,
                numeric if numeric.is_numeric() => PENALTY_STRONG,
                NativeType::String => PENALTY_EXACT,
                _ => PENALTY_MILD,
            },
            Value::Bool(_) => match target {
                NativeType::Bool => PENALTY_EXACT,
                numeric if numeric.is_numeric() => PENALTY_MILD,
                NativeType::String => PENALTY_STRONG,
                _ => PENALTY_MILD,
            },
            _ => match target {
                NativeType::String => PENALTY_STRONG,
                _ => PENALTY_EXACT,
            },
        }
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(value) => *value != 0.0 && !value.is_nan(),
        Value::Integer(value) => *value != 0,
        Value::String(value) => !value.is_empty(),
        Value::Bytes(value) => !value.is_empty(),
        Value::Object(_) => true,
    }
}

pub(crate) fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(value) => f64::from(u8::from(*value)),
        Value::Number(value) => *value,
        Value::Integer(value) => *value as f64,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Undefined | Value::Bytes(_) | Value::Object(_) => f64::NAN,
    }
}

fn to_integer(number: f64) -> f64 {
    if number.is_nan() {
        0.0
    } else {
        number.trunc()
    }
}

fn to_uint32(number: f64) -> u32 {
    if !number.is_finite() {
        return 0;
    }
    number.trunc().rem_euclid(4_294_967_296.0) as u32
}

fn to_int32(number: f64) -> i32 {
    to_uint32(number) as i32
}
