/// A heap object as seen from rhai. Host objects never cross into scripts
/// by value: scripts hold this reference and every read, write and call
/// goes back through the owning engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HostRef {
    engine: EngineId,
    id: ObjectId,
}

/// rhai function behind every host callable. The callable's own reference
/// travels as the first curried argument of the function pointer.
const HOST_CALLABLE: &str = "__host_callable";
/// Map key linking a thrown error map back to the bridge error it carries.
const ERROR_TAG: &str = "__bridge_error";
const MAX_CONVERSION_DEPTH: usize = 32;

/// Methods rhai resolves on every value; routing them to host members
/// would break function pointers and string conversion.
const BUILTIN_METHODS: &[&str] = &[
    "call", "curry", "to_string", "to_debug", "type_of", "is_shared", "tag",
];

/// Keywords and standard-library functions that must keep their built-in
/// meaning even when a host global of the same name exists.
const RESERVED_NAMES: &[&str] = &[
    "if", "else", "switch", "while", "loop", "for", "in", "do", "until", "return", "throw",
    "try", "catch", "let", "const", "fn", "private", "import", "export", "as", "break",
    "continue", "this", "global", "true", "false", "print", "debug", "type_of", "to_string",
    "to_debug", "to_int", "to_float", "to_char", "to_array", "to_blob", "to_chars", "is_def_var",
    "is_def_fn", "Fn", "call", "curry", "eval", "sleep", "range", "timestamp", "parse_int",
    "parse_float", "parse_be_int", "parse_le_int", "len", "push", "pop", "shift", "insert",
    "append", "remove", "clear", "keys", "values", "contains", "min", "max", "abs", "sign",
    "sqrt", "exp", "ln", "log", "floor", "ceiling", "round", "int", "fraction", "map",
    "filter", "reduce", "reduce_rev", "some", "all", "sort", "reverse", "split", "index_of",
    "sub_string", "trim", "to_upper", "to_lower", "blob", "sin", "cos", "tan", "is_nan",
    "is_finite", "is_infinite", "is_odd", "is_even", "is_zero", "is_string", "is_anonymous",
];

static MEMBER_CALL: OnceLock<Regex> = OnceLock::new();
static PLAIN_CALL: OnceLock<Regex> = OnceLock::new();
static FN_LITERAL: OnceLock<Regex> = OnceLock::new();
static FN_DEFINITION: OnceLock<Regex> = OnceLock::new();

fn member_call_regex() -> &'static Regex {
    MEMBER_CALL.get_or_init(|| {
        Regex::new(r"\.\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("member call regex should compile")
    })
}

fn plain_call_regex() -> &'static Regex {
    PLAIN_CALL.get_or_init(|| {
        Regex::new(r"(?:^|[^.A-Za-z0-9_$])([A-Za-z_][A-Za-z0-9_]*)\s*\(")
            .expect("plain call regex should compile")
    })
}

fn fn_literal_regex() -> &'static Regex {
    FN_LITERAL.get_or_init(|| {
        Regex::new(r#"\bFn\s*\(\s*"([A-Za-z_][A-Za-z0-9_]*)""#).expect("Fn literal regex should compile")
    })
}

fn fn_definition_regex() -> &'static Regex {
    FN_DEFINITION.get_or_init(|| {
        Regex::new(r"\bfn\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("fn definition regex should compile")
    })
}

/// Names a program calls that the bridge has to route: members called on
/// host objects and plain calls of functions living in the realm global.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SourceScan {
    members: BTreeSet<String>,
    globals: BTreeSet<String>,
}

pub(crate) fn scan_source(source: &str) -> SourceScan {
    let captured = |regex: &'static Regex| {
        regex
            .captures_iter(source)
            .filter_map(|captures| captures.get(1))
            .map(|found| found.as_str())
            .collect::<Vec<_>>()
    };
    let defined = captured(fn_definition_regex())
        .into_iter()
        .collect::<BTreeSet<_>>();
    let members = captured(member_call_regex())
        .into_iter()
        .filter(|name| !BUILTIN_METHODS.contains(name))
        .map(str::to_string)
        .collect();
    let globals = captured(plain_call_regex())
        .into_iter()
        .chain(captured(fn_literal_regex()))
        .filter(|name| !defined.contains(name) && !RESERVED_NAMES.contains(name))
        .map(str::to_string)
        .collect();
    SourceScan { members, globals }
}

/// Builds the rhai engine a program runs on. Every callback captures the
/// engine id and the shared state only, never the engine itself.
fn configure_rhai(
    engine_id: EngineId,
    shared: Arc<EngineShared>,
    max_call_depth: usize,
    scan: &SourceScan,
) -> Engine {
    let mut rhai = Engine::new();
    rhai.set_max_call_levels(max_call_depth);
    rhai.register_type_with_name::<HostRef>("Object");
    rhai.register_indexer_get(|target: &mut HostRef, key: ImmutableString| host_get(*target, &key));
    rhai.register_indexer_get(|target: &mut HostRef, index: INT| {
        host_get(*target, &index.to_string())
    });
    // Registered pure so that globals resolved through `on_var`, which rhai
    // treats as constants, stay writable.
    FuncRegistration::new("index$set$")
        .with_purity(true)
        .register_into_engine(
            &mut rhai,
            |target: &mut HostRef, key: ImmutableString, value: Dynamic| {
                host_set(*target, &key, value)
            },
        );
    FuncRegistration::new("index$set$")
        .with_purity(true)
        .register_into_engine(&mut rhai, |target: &mut HostRef, index: INT, value: Dynamic| {
            host_set(*target, &index.to_string(), value)
        });
    rhai.register_fn("==", |a: &mut HostRef, b: HostRef| *a == b);
    rhai.register_fn("!=", |a: &mut HostRef, b: HostRef| *a != b);
    rhai.register_fn("to_string", |target: &mut HostRef| host_display(*target));
    rhai.register_fn("to_debug", |target: &mut HostRef| host_display(*target));

    for arity in 0..=MAX_CALL_ARGS {
        rhai.register_raw_fn(
            HOST_CALLABLE,
            host_arg_types(arity),
            |_context: NativeCallContext, args: &mut [&mut Dynamic]| call_host_callable(args),
        );
    }
    for name in &scan.members {
        for arity in 0..=MAX_CALL_ARGS {
            let member = name.clone();
            rhai.register_raw_fn(
                name.as_str(),
                host_arg_types(arity),
                move |_context: NativeCallContext, args: &mut [&mut Dynamic]| {
                    invoke_host_member(&member, args)
                },
            );
        }
    }
    for name in &scan.globals {
        for arity in 0..=MAX_CALL_ARGS {
            let global = name.clone();
            rhai.register_raw_fn(
                name.as_str(),
                vec![TypeId::of::<Dynamic>(); arity],
                move |_context: NativeCallContext, args: &mut [&mut Dynamic]| {
                    call_global(engine_id, &global, args)
                },
            );
        }
    }

    #[allow(deprecated)]
    rhai.on_var(move |name, _index, context| {
        if context.scope().contains(name) {
            return Ok(None);
        }
        let engine = bridge_engine(engine_id)?;
        let global = engine.current_global();
        if name == "globalThis" {
            return Ok(Some(Dynamic::from(HostRef {
                engine: engine_id,
                id: global,
            })));
        }
        let found = engine
            .with_object(global, |object| object.properties.get(name).cloned())
            .map_err(|error| engine.raise(error))?;
        match found {
            Some(value) => engine
                .to_dynamic(&value)
                .map(Some)
                .map_err(|error| engine.raise(error)),
            None => Ok(None),
        }
    });
    rhai.on_print(move |text| {
        info!(target: "script", "{text}");
        if let Some(engine) = live_engine(engine_id) {
            engine.emit_print(text);
        }
    });
    rhai.on_debug(|text, source, position| {
        debug!(target: "script", "{}:{position:?}: {text}", source.unwrap_or("<eval>"));
    });
    rhai.on_progress(move |_operations| {
        if shared.abort.load(Ordering::SeqCst) || shared.destroyed.load(Ordering::SeqCst) {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    rhai
}

fn host_arg_types(arity: usize) -> Vec<TypeId> {
    std::iter::once(TypeId::of::<HostRef>())
        .chain(std::iter::repeat(TypeId::of::<Dynamic>()).take(arity))
        .collect()
}

fn runtime_error(message: impl Into<Dynamic>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(message.into(), Position::NONE))
}

fn bridge_engine(id: EngineId) -> Result<ScriptEngine, Box<EvalAltResult>> {
    live_engine(id).ok_or_else(|| runtime_error(BridgeError::EngineDestroyed.to_string()))
}

fn host_get(target: HostRef, key: &str) -> Result<Dynamic, Box<EvalAltResult>> {
    let engine = bridge_engine(target.engine)?;
    engine
        .get_value(&Value::Object(target.id), key)
        .and_then(|value| engine.to_dynamic(&value))
        .map_err(|error| engine.raise(error))
}

fn host_set(target: HostRef, key: &str, value: Dynamic) -> Result<(), Box<EvalAltResult>> {
    let engine = bridge_engine(target.engine)?;
    engine
        .from_dynamic(value)
        .and_then(|value| engine.set_value(&Value::Object(target.id), key, value))
        .map_err(|error| engine.raise(error))
}

fn host_display(target: HostRef) -> String {
    match live_engine(target.engine) {
        Some(engine) => engine.display(&Value::Object(target.id)),
        None => "[invalid]".to_string(),
    }
}

fn receiver(args: &[&mut Dynamic]) -> Result<HostRef, Box<EvalAltResult>> {
    args.first()
        .and_then(|arg| (**arg).clone().try_cast::<HostRef>())
        .ok_or_else(|| runtime_error("receiver is not a host object"))
}

fn call_arguments(engine: &ScriptEngine, args: &mut [&mut Dynamic]) -> Result<Vec<Value>, Box<EvalAltResult>> {
    args.iter_mut()
        .map(|arg| engine.from_dynamic(arg.take()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| engine.raise(error))
}

fn invoke_host_member(name: &str, args: &mut [&mut Dynamic]) -> Result<Dynamic, Box<EvalAltResult>> {
    let target = receiver(args)?;
    let engine = bridge_engine(target.engine)?;
    let values = call_arguments(&engine, &mut args[1..])?;
    engine
        .invoke_member(target.id, name, &values)
        .and_then(|value| engine.to_dynamic(&value))
        .map_err(|error| engine.raise(error))
}

fn call_host_callable(args: &mut [&mut Dynamic]) -> Result<Dynamic, Box<EvalAltResult>> {
    let target = receiver(args)?;
    let engine = bridge_engine(target.engine)?;
    let values = call_arguments(&engine, &mut args[1..])?;
    engine
        .call_value(&Value::Object(target.id), &Value::Undefined, &values)
        .and_then(|value| engine.to_dynamic(&value))
        .map_err(|error| engine.raise(error))
}

fn call_global(engine_id: EngineId, name: &str, args: &mut [&mut Dynamic]) -> Result<Dynamic, Box<EvalAltResult>> {
    let engine = bridge_engine(engine_id)?;
    let values = call_arguments(&engine, args)?;
    let result = engine
        .get_value(&Value::Object(engine.current_global()), name)
        .and_then(|callee| match callee {
            Value::Undefined => Err(BridgeError::thrown(format!("{name} is not defined"))),
            callee => engine.call_value(&callee, &Value::Undefined, &values),
        })
        .and_then(|value| engine.to_dynamic(&value));
    result.map_err(|error| engine.raise(error))
}

fn host_callable(reference: HostRef) -> Dynamic {
    match FnPtr::new(HOST_CALLABLE) {
        Ok(mut pointer) => {
            pointer.add_curry(Dynamic::from(reference));
            Dynamic::from(pointer)
        }
        Err(_) => Dynamic::from(reference),
    }
}

/// Collects the heap objects a rhai value refers to, including those held
/// by curried closure arguments.
pub(crate) fn collect_dynamic_ids(value: &Dynamic, out: &mut Vec<ObjectId>) {
    let value = value.flatten_clone();
    if let Some(reference) = value.read_lock::<HostRef>() {
        out.push(reference.id);
    } else if let Some(items) = value.read_lock::<Array>() {
        for item in items.iter() {
            collect_dynamic_ids(item, out);
        }
    } else if let Some(entries) = value.read_lock::<Map>() {
        for item in entries.values() {
            collect_dynamic_ids(item, out);
        }
    } else if let Some(pointer) = value.read_lock::<FnPtr>() {
        for captured in pointer.curry() {
            collect_dynamic_ids(captured, out);
        }
    };
}

/// True when a scope binding still holds what was pushed for it, so the
/// write-back after a run can leave the global untouched.
pub(crate) fn dynamic_matches(before: &Dynamic, after: &Dynamic) -> bool {
    if before.type_id() != after.type_id() {
        return false;
    }
    if before.is_unit() {
        return true;
    }
    if let (Some(a), Some(b)) = (before.read_lock::<HostRef>(), after.read_lock::<HostRef>()) {
        return *a == *b;
    }
    if let (Ok(a), Ok(b)) = (before.as_int(), after.as_int()) {
        return a == b;
    }
    if let (Ok(a), Ok(b)) = (before.as_float(), after.as_float()) {
        return a == b;
    }
    if let (Ok(a), Ok(b)) = (before.as_bool(), after.as_bool()) {
        return a == b;
    }
    if let (Ok(a), Ok(b)) = (before.as_char(), after.as_char()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (
        before.read_lock::<ImmutableString>(),
        after.read_lock::<ImmutableString>(),
    ) {
        return *a == *b;
    }
    if let (Some(a), Some(b)) = (before.read_lock::<Blob>(), after.read_lock::<Blob>()) {
        return *a == *b;
    }
    if let (Some(a), Some(b)) = (before.read_lock::<Array>(), after.read_lock::<Array>()) {
        return a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| dynamic_matches(x, y));
    }
    if let (Some(a), Some(b)) = (before.read_lock::<Map>(), after.read_lock::<Map>()) {
        return a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && dynamic_matches(va, vb));
    }
    if let (Some(a), Some(b)) = (before.read_lock::<FnPtr>(), after.read_lock::<FnPtr>()) {
        return a.fn_name() == b.fn_name()
            && a.curry().len() == b.curry().len()
            && a.curry()
                .iter()
                .zip(b.curry())
                .all(|(x, y)| dynamic_matches(x, y));
    }
    false
}

fn thrown_message(value: &Dynamic) -> String {
    if value.is_string() {
        return value.to_string();
    }
    if let Some(entries) = value.read_lock::<Map>() {
        if let Some(message) = entries.get("message") {
            return message.to_string();
        }
    }
    value.to_string()
}

impl ScriptEngine {
    pub(crate) fn to_dynamic(&self, value: &Value) -> Result<Dynamic, BridgeError> {
        self.to_dynamic_at(value, 0)
    }

    fn to_dynamic_at(&self, value: &Value, depth: usize) -> Result<Dynamic, BridgeError> {
        Ok(match value {
            Value::Undefined | Value::Null => Dynamic::UNIT,
            Value::Bool(flag) => Dynamic::from_bool(*flag),
            Value::Number(number) => Dynamic::from_float(*number),
            Value::Integer(number) => Dynamic::from_int(*number),
            Value::String(text) => Dynamic::from(ImmutableString::from(text.as_ref())),
            Value::Bytes(bytes) => Dynamic::from_blob(bytes.to_vec()),
            Value::Object(id) => return self.object_to_dynamic(*id, depth),
        })
    }

    fn object_to_dynamic(&self, id: ObjectId, depth: usize) -> Result<Dynamic, BridgeError> {
        enum Shape {
            Array(Vec<Value>),
            Function(ScriptFunction),
            Callable,
            Reference,
        }
        let shape = self.with_object(id, |object| match &object.kind {
            ObjectKind::Array(items) if depth < MAX_CONVERSION_DEPTH => Shape::Array(items.clone()),
            ObjectKind::ScriptFunction(function) => Shape::Function(function.clone()),
            ObjectKind::NativeFunction { .. } | ObjectKind::Method { .. } => Shape::Callable,
            _ => Shape::Reference,
        })?;
        let reference = HostRef {
            engine: self.id(),
            id,
        };
        match shape {
            Shape::Array(items) => items
                .iter()
                .map(|item| self.to_dynamic_at(item, depth + 1))
                .collect::<Result<Array, _>>()
                .map(Dynamic::from_array),
            Shape::Function(function) if self.is_local_function(&function) => {
                Ok(Dynamic::from(function.fn_ptr))
            }
            Shape::Function(_) | Shape::Callable => Ok(host_callable(reference)),
            Shape::Reference => Ok(Dynamic::from(reference)),
        }
    }

    /// Script functions of the running program and realm stay plain rhai
    /// function pointers; everything else is called back through the host.
    fn is_local_function(&self, function: &ScriptFunction) -> bool {
        function.fn_ptr.curry().is_empty()
            && function.global == self.current_global()
            && self
                .running_program()
                .is_some_and(|program| program.id() == function.program.id())
    }

    pub(crate) fn from_dynamic(&self, value: Dynamic) -> Result<Value, BridgeError> {
        let value = value.flatten();
        if value.is_unit() {
            return Ok(Value::Undefined);
        }
        if let Ok(flag) = value.as_bool() {
            return Ok(Value::Bool(flag));
        }
        if let Ok(number) = value.as_int() {
            return Ok(Value::Integer(number));
        }
        if let Ok(number) = value.as_float() {
            return Ok(Value::Number(number));
        }
        if let Ok(character) = value.as_char() {
            return Ok(Value::string(character.to_string()));
        }
        if value.is_string() {
            return value
                .into_immutable_string()
                .map(|text| Value::string(text.as_str()))
                .map_err(|type_name| BridgeError::conversion(type_name, "string"));
        }
        if value.is::<Blob>() {
            return value
                .into_blob()
                .map(|bytes| Value::Bytes(Arc::from(bytes)))
                .map_err(|type_name| BridgeError::conversion(type_name, "bytes"));
        }
        if value.is::<HostRef>() {
            let reference = value.try_cast::<HostRef>().ok_or(BridgeError::InvalidHandle)?;
            return self.resolve_host_ref(reference);
        }
        if value.is_array() {
            let items = value
                .into_array()
                .map_err(|type_name| BridgeError::conversion(type_name, "Array"))?
                .into_iter()
                .map(|item| self.from_dynamic(item))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Value::Object(self.alloc(ObjectKind::Array(items))));
        }
        if value.is_map() {
            let entries = value.try_cast::<Map>().unwrap_or_default();
            let id = self.alloc(ObjectKind::Plain);
            for (key, item) in entries {
                let item = self.from_dynamic(item)?;
                self.with_object_mut(id, |object| {
                    object.properties.insert(key.to_string(), item);
                })?;
            }
            return Ok(Value::Object(id));
        }
        if value.is_fnptr() {
            let pointer = value
                .try_cast::<FnPtr>()
                .ok_or_else(|| BridgeError::conversion("Fn", "Function"))?;
            return self.function_from_pointer(pointer);
        }
        Ok(Value::string(value.to_string()))
    }

    fn resolve_host_ref(&self, reference: HostRef) -> Result<Value, BridgeError> {
        if reference.engine != self.id() {
            return Err(BridgeError::InvalidHandle);
        }
        self.with_object(reference.id, |_| ())?;
        Ok(Value::Object(reference.id))
    }

    fn function_from_pointer(&self, pointer: FnPtr) -> Result<Value, BridgeError> {
        if pointer.fn_name() == HOST_CALLABLE {
            let reference = pointer
                .curry()
                .first()
                .and_then(|captured| captured.clone().try_cast::<HostRef>());
            if let Some(reference) = reference {
                return self.resolve_host_ref(reference);
            }
        }
        let Some(program) = self.running_program() else {
            return Err(BridgeError::NotCallable {
                what: pointer.fn_name().to_string(),
            });
        };
        if !pointer.curry().is_empty() {
            let global = self.current_global();
            return Ok(Value::Object(self.alloc(ObjectKind::ScriptFunction(
                ScriptFunction {
                    fn_ptr: pointer,
                    program,
                    global,
                },
            ))));
        }
        if !program.defines(pointer.fn_name()) {
            let existing = self.get_value(&Value::Object(self.current_global()), pointer.fn_name())?;
            if self.is_callable(&existing) {
                return Ok(existing);
            }
        }
        Ok(Value::Object(self.intern_function(&program, pointer)))
    }

    /// Turns a bridge error into a rhai error a script can catch. The
    /// original error is parked until the run ends so it can be restored
    /// intact if the script lets it escape.
    pub(crate) fn raise(&self, error: BridgeError) -> Box<EvalAltResult> {
        if matches!(error, BridgeError::Aborted) {
            return Box::new(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE));
        }
        if let BridgeError::Thrown {
            value: Some(value), ..
        } = &error
        {
            let original = self.unwrap_handle(value).and_then(|value| self.to_dynamic(&value));
            if let Ok(original) = original {
                return runtime_error(original);
            }
        }
        let tag = self.inner.next_raised.get();
        self.inner.next_raised.set(tag + 1);
        let mut entries = Map::new();
        entries.insert("name".into(), error.script_name().into());
        entries.insert("message".into(), error.to_string().into());
        entries.insert("code".into(), error.code().into());
        entries.insert(ERROR_TAG.into(), Dynamic::from_int(tag));
        self.inner.raised.borrow_mut().insert(tag, error);
        runtime_error(Dynamic::from_map(entries))
    }

    fn recover_raised(&self, value: &Dynamic) -> Option<BridgeError> {
        let tag = value.read_lock::<Map>()?.get(ERROR_TAG)?.as_int().ok()?;
        self.inner.raised.borrow_mut().remove(&tag)
    }

    pub(crate) fn map_eval_error(&self, file: &str, error: EvalAltResult) -> BridgeError {
        match error {
            EvalAltResult::ErrorInFunctionCall(_, source, inner, _) => {
                let file = if source.is_empty() { file } else { source.as_str() };
                self.map_eval_error(file, *inner)
            }
            EvalAltResult::ErrorTerminated(..) => BridgeError::Aborted,
            EvalAltResult::ErrorParsing(kind, position) => BridgeError::Syntax {
                file: file.to_string(),
                line: position.line().unwrap_or(0),
                column: position.position().unwrap_or(0),
                message: kind.to_string(),
            },
            EvalAltResult::ErrorVariableNotFound(name, position) => BridgeError::Thrown {
                message: format!("{name} is not defined"),
                file: Some(file.to_string()),
                line: position.line(),
                value: None,
            },
            EvalAltResult::ErrorRuntime(value, position) => {
                if let Some(error) = self.recover_raised(&value) {
                    return error;
                }
                let message = thrown_message(&value);
                let value = self.from_dynamic(value).ok().map(|value| self.make_handle(value));
                BridgeError::Thrown {
                    message,
                    file: Some(file.to_string()),
                    line: position.line(),
                    value,
                }
            }
            mut other => {
                let line = other.position().line();
                other.clear_position();
                BridgeError::Thrown {
                    message: other.to_string(),
                    file: Some(file.to_string()),
                    line,
                    value: None,
                }
            }
        }
    }
}

pub(crate) fn syntax_error(file: &str, error: &ParseError) -> BridgeError {
    let position = error.position();
    BridgeError::Syntax {
        file: file.to_string(),
        line: position.line().unwrap_or(0),
        column: position.position().unwrap_or(0),
        message: error.err_type().to_string(),
    }
}
