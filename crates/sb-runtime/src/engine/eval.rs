static NEXT_PROGRAM_ID: AtomicUsize = AtomicUsize::new(1);

struct ProgramInner {
    id: usize,
    engine: EngineId,
    file: String,
    ast: AST,
    rhai: Engine,
    /// Parameter counts of every script function, anonymous ones included.
    functions: BTreeMap<String, Vec<usize>>,
    /// Named public functions, published to the realm global on each run.
    exported: Vec<String>,
}

/// A compiled script. Cheap to clone; runs only on the engine that
/// compiled it.
#[derive(Clone)]
pub struct Program {
    inner: Rc<ProgramInner>,
}

impl Program {
    pub fn file(&self) -> &str {
        &self.inner.file
    }

    pub fn function_names(&self) -> Vec<String> {
        self.inner.exported.clone()
    }

    fn id(&self) -> usize {
        self.inner.id
    }

    fn defines(&self, name: &str) -> bool {
        self.inner.functions.contains_key(name)
    }

    /// Declared parameter count to call `name` with when `argc` values are
    /// available: an exact match if one exists, else the first overload.
    fn arity_for(&self, name: &str, argc: usize) -> Option<usize> {
        let counts = self.inner.functions.get(name)?;
        counts
            .iter()
            .copied()
            .find(|count| *count == argc)
            .or_else(|| counts.first().copied())
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("file", &self.inner.file)
            .field("functions", &self.inner.exported)
            .finish()
    }
}

pub(crate) struct RunContext {
    program: Program,
}

/// Counts nested evaluations; the outermost one owns the abort flag and the
/// parked bridge errors.
struct EvaluationGuard {
    engine: ScriptEngine,
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        let shared = &self.engine.inner.shared;
        if shared.evaluating.fetch_sub(1, Ordering::SeqCst) == 1 {
            shared.abort.store(false, Ordering::SeqCst);
            self.engine.inner.raised.borrow_mut().clear();
        }
    }
}

struct RealmGuard {
    engine: ScriptEngine,
}

impl Drop for RealmGuard {
    fn drop(&mut self) {
        self.engine.inner.realm_stack.borrow_mut().pop();
    }
}

struct RunGuard {
    engine: ScriptEngine,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.engine.inner.running.borrow_mut().pop();
    }
}

impl ScriptEngine {
    pub fn compile(&self, source: &str, file: &str) -> Result<Program, BridgeError> {
        self.ensure_live("compile")?;
        let scan = scan_source(source);
        let rhai = configure_rhai(
            self.id(),
            Arc::clone(&self.inner.shared),
            self.inner.options.max_call_depth,
            &scan,
        );
        let mut ast = rhai
            .compile(source)
            .map_err(|error| syntax_error(file, &error))?;
        ast.set_source(file);

        let mut functions: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut exported = Vec::new();
        for function in ast.iter_functions() {
            functions
                .entry(function.name.to_string())
                .or_default()
                .push(function.params.len());
            let anonymous = function.name.starts_with("anon$");
            if function.access.is_public() && !anonymous && !exported.iter().any(|name| name == function.name) {
                exported.push(function.name.to_string());
            }
        }
        debug!(
            "compiled {file}: {} functions, {} member names, {} global calls",
            exported.len(),
            scan.members.len(),
            scan.globals.len()
        );
        Ok(Program {
            inner: Rc::new(ProgramInner {
                id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
                engine: self.id(),
                file: file.to_string(),
                ast,
                rhai,
                functions,
                exported,
            }),
        })
    }

    /// Parses `source` without running it.
    pub fn check_syntax(&self, source: &str, file: &str) -> Result<(), BridgeError> {
        self.ensure_live("check_syntax")?;
        Engine::new_raw()
            .compile(source)
            .map(|_| ())
            .map_err(|error| syntax_error(file, &error))
    }

    pub fn evaluate(&self, source: &str, file: &str) -> Result<ScriptValue, BridgeError> {
        let program = self.compile(source, file)?;
        self.run(&program)
    }

    /// Runs `program` in the current realm and returns its last value.
    pub fn run(&self, program: &Program) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("run")?;
        self.check_program(program)?;
        let value = self.run_program(program)?;
        Ok(self.make_handle(value))
    }

    pub fn is_evaluating(&self) -> bool {
        self.inner.shared.evaluating.load(Ordering::SeqCst) > 0
    }

    /// Terminates the evaluation in progress; the run fails with `Aborted`.
    pub fn abort_evaluation(&self) {
        self.handle().abort_evaluation();
    }

    fn check_program(&self, program: &Program) -> Result<(), BridgeError> {
        if program.inner.engine != self.id() {
            return Err(BridgeError::invalid_argument(format!(
                "{} was compiled by another engine",
                program.file()
            )));
        }
        Ok(())
    }

    fn begin_evaluation(&self) -> EvaluationGuard {
        if self.inner.shared.evaluating.fetch_add(1, Ordering::SeqCst) == 0 {
            self.inner.shared.abort.store(false, Ordering::SeqCst);
        }
        EvaluationGuard {
            engine: self.clone(),
        }
    }

    fn enter_realm(&self, global: ObjectId) -> RealmGuard {
        self.inner.realm_stack.borrow_mut().push(global);
        RealmGuard {
            engine: self.clone(),
        }
    }

    fn enter_program(&self, program: &Program) -> RunGuard {
        self.inner.running.borrow_mut().push(RunContext {
            program: program.clone(),
        });
        RunGuard {
            engine: self.clone(),
        }
    }

    fn running_program(&self) -> Option<Program> {
        self.inner
            .running
            .borrow()
            .last()
            .map(|context| context.program.clone())
    }

    pub(crate) fn emit_print(&self, text: &str) {
        let listener = self.inner.print_listener.borrow().clone();
        if let Some(listener) = listener {
            listener(text);
        }
    }

    /// Runs a program against the current realm global. Every global is
    /// visible as a scope variable; bindings the script adds or changes are
    /// written back afterwards, also when the run fails.
    fn run_program(&self, program: &Program) -> Result<Value, BridgeError> {
        let _evaluation = self.begin_evaluation();
        let _running = self.enter_program(program);
        let global = self.current_global();
        let frame = self.enter_frame(
            Frame::new("<eval>", Value::Object(global), Vec::new()).at(program.file()),
        )?;
        self.define_script_functions(program, global)?;

        let mut scope = Scope::new();
        let mut pushed = BTreeMap::new();
        for name in self.member_names(&Value::Object(global))? {
            if !is_scope_name(&name) {
                continue;
            }
            let value = self.get_value(&Value::Object(global), &name)?;
            let converted = self.to_dynamic(&value)?;
            scope.push_dynamic(name.clone(), converted.clone());
            pushed.insert(name, converted);
        }

        let result = program
            .inner
            .rhai
            .eval_ast_with_scope::<Dynamic>(&mut scope, &program.inner.ast);
        let published = self.publish_scope(global, &pushed, &scope);
        frame.pop();
        let value = result.map_err(|error| self.map_eval_error(program.file(), *error))?;
        published?;
        self.from_dynamic(value)
    }

    fn publish_scope(
        &self,
        global: ObjectId,
        pushed: &BTreeMap<String, Dynamic>,
        scope: &Scope,
    ) -> Result<(), BridgeError> {
        let mut bindings = BTreeMap::new();
        for (name, _constant, value) in scope.iter() {
            bindings.insert(name.to_string(), value);
        }
        let target = Value::Object(global);
        for (name, value) in bindings {
            let before = pushed.get(&name);
            if before.is_some_and(|before| dynamic_matches(before, &value)) {
                continue;
            }
            if before.is_some() && value.is_array() {
                if let Value::Object(id) = self.get_value(&target, &name)? {
                    if self.replace_array_items(id, value.clone())? {
                        continue;
                    }
                }
            }
            let converted = self.from_dynamic(value)?;
            self.set_value(&target, &name, converted)?;
        }
        Ok(())
    }

    /// Updates a heap array in place so other references to it see the
    /// script's changes. Returns false when `id` is not an array.
    fn replace_array_items(&self, id: ObjectId, value: Dynamic) -> Result<bool, BridgeError> {
        let is_array = self.with_object(id, |object| matches!(object.kind, ObjectKind::Array(_)))?;
        if !is_array {
            return Ok(false);
        }
        let items = value
            .into_array()
            .map_err(|type_name| BridgeError::conversion(type_name, "Array"))?
            .into_iter()
            .map(|item| self.from_dynamic(item))
            .collect::<Result<Vec<_>, _>>()?;
        self.with_object_mut(id, |object| {
            if let ObjectKind::Array(existing) = &mut object.kind {
                *existing = items;
            }
        })?;
        Ok(true)
    }

    fn define_script_functions(&self, program: &Program, global: ObjectId) -> Result<(), BridgeError> {
        for name in &program.inner.exported {
            let pointer = FnPtr::new(name.as_str()).map_err(|_| BridgeError::NotCallable {
                what: name.clone(),
            })?;
            let id = self.intern_function(program, pointer);
            self.set_value(&Value::Object(global), name, Value::Object(id))?;
        }
        Ok(())
    }

    /// One function object per program, name and realm, so that scripts
    /// passing the same function twice hand the host the same object.
    fn intern_function(&self, program: &Program, pointer: FnPtr) -> ObjectId {
        let global = self.current_global();
        let key = (program.id(), pointer.fn_name().to_string());
        let existing = self.inner.interned_functions.borrow().get(&key).copied();
        if let Some(id) = existing {
            let same_realm = self
                .with_object(id, |object| {
                    matches!(&object.kind, ObjectKind::ScriptFunction(function) if function.global == global)
                })
                .unwrap_or(false);
            if same_realm {
                return id;
            }
        }
        let id = self.alloc(ObjectKind::ScriptFunction(ScriptFunction {
            fn_ptr: pointer,
            program: program.clone(),
            global,
        }));
        self.inner.interned_functions.borrow_mut().insert(key, id);
        id
    }

    /// Calls a script function in the realm it was created in. Missing
    /// arguments are passed as `()`, extra ones are dropped.
    pub(crate) fn call_script_function(
        &self,
        function: &ScriptFunction,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let program = &function.program;
        let name = function.fn_ptr.fn_name();
        let curry = function.fn_ptr.curry();
        let Some(params) = program.arity_for(name, curry.len() + args.len()) else {
            return Err(BridgeError::NotCallable {
                what: name.to_string(),
            });
        };

        let _evaluation = self.begin_evaluation();
        let _realm = self.enter_realm(function.global);
        let _running = self.enter_program(program);
        let callee = if function.fn_ptr.is_anonymous() {
            "<anonymous>"
        } else {
            name
        };
        let frame = self.enter_frame(
            Frame::new(callee, this.clone(), args.to_vec()).at(program.file()),
        )?;

        let mut call_args = curry.to_vec();
        for index in 0..params.saturating_sub(curry.len()) {
            let value = args.get(index).cloned().unwrap_or(Value::Undefined);
            call_args.push(self.to_dynamic(&value)?);
        }
        let mut bound_this = self.to_dynamic(this)?;
        let mut scope = Scope::new();
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut bound_this);
        let result = program.inner.rhai.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &program.inner.ast,
            name,
            call_args,
        );
        frame.pop();
        let value = result.map_err(|error| self.map_eval_error(program.file(), *error))?;
        self.from_dynamic(value)
    }
}

/// Global keys that can be bound as rhai variables.
fn is_scope_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod eval_tests {
    use super::*;
    use super::runtime_test_support::*;

    #[test]
    fn last_expression_is_the_result() {
        let engine = engine();
        let value = engine
            .evaluate("let x = 6; x * 7", "answer.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(42.0));
        let text = engine
            .evaluate(r#""con" + "cat""#, "text.rhai")
            .expect("evaluation should pass");
        assert_eq!(text.as_str(), Some("concat"));
    }

    #[test]
    fn top_level_bindings_become_globals() {
        let engine = engine();
        engine
            .evaluate("let answer = 41;", "define.rhai")
            .expect("evaluation should pass");
        let answer = engine
            .property(&engine.global_object(), "answer")
            .expect("lookup should pass");
        assert_eq!(answer.as_number(), Some(41.0));
        let value = engine
            .evaluate("answer += 1; answer", "update.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn script_functions_are_published_and_callable_from_native_code() {
        let engine = engine();
        engine
            .evaluate("fn double(x) { x * 2 }", "double.rhai")
            .expect("evaluation should pass");
        let double = engine
            .property(&engine.global_object(), "double")
            .expect("lookup should pass");
        assert!(engine.is_callable_value(&double));
        let result = engine
            .call(&double, &engine.undefined(), &[engine.new_number(21.0)])
            .expect("call should pass");
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn programs_call_functions_defined_by_other_programs() {
        let engine = engine();
        engine
            .evaluate(r#"fn greet(name) { "hi " + name }"#, "lib.rhai")
            .expect("library should load");
        let value = engine
            .evaluate(r#"greet("bob")"#, "main.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_str(), Some("hi bob"));
    }

    #[test]
    fn host_functions_are_callable_from_script_functions() {
        let engine = engine();
        engine
            .register_function("twice", |engine, _this, args| {
                let value = args.first().and_then(ScriptValue::as_number).unwrap_or_default();
                Ok(engine.new_number(value * 2.0))
            })
            .expect("function should register");
        let value = engine
            .evaluate("fn quad(x) { twice(twice(x)) } quad(3)", "nested.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(12.0));
    }

    #[test]
    fn compiled_programs_can_run_repeatedly() {
        let engine = engine();
        engine
            .register_global("total", &engine.new_number(0.0))
            .expect("global should register");
        let program = engine
            .compile("total += 1; total", "tick.rhai")
            .expect("compile should pass");
        assert_eq!(program.file(), "tick.rhai");
        for expected in [1.0, 2.0, 3.0] {
            let value = engine.run(&program).expect("run should pass");
            assert_eq!(value.as_number(), Some(expected));
        }
    }

    #[test]
    fn programs_only_run_on_their_engine() {
        let first = engine();
        let second = engine();
        let program = first.compile("1", "one.rhai").expect("compile should pass");
        let error = second.run(&program).expect_err("foreign program should fail");
        assert_eq!(error.code(), "BRIDGE_INVALID_ARGUMENT");
    }

    #[test]
    fn syntax_errors_carry_position() {
        let engine = engine();
        let error = engine
            .evaluate("let a = 1;\nlet = ;", "broken.rhai")
            .expect_err("source should not parse");
        assert_eq!(error.code(), "BRIDGE_SYNTAX");
        let BridgeError::Syntax { file, line, .. } = &error else {
            panic!("expected a syntax error, got {error:?}");
        };
        assert_eq!(file, "broken.rhai");
        assert_eq!(*line, 2);
        assert!(error.to_string().starts_with("broken.rhai:2:"));

        assert!(engine.check_syntax("let fine = 1;", "fine.rhai").is_ok());
        let error = engine
            .check_syntax("fn (", "bad.rhai")
            .expect_err("source should not parse");
        assert_eq!(error.code(), "BRIDGE_SYNTAX");
    }

    #[test]
    fn thrown_values_report_file_and_line() {
        let engine = engine();
        let error = engine
            .evaluate("let a = 1;\nthrow \"bad input\";", "throw.rhai")
            .expect_err("script should throw");
        let BridgeError::Thrown {
            message,
            file,
            line,
            value,
        } = &error
        else {
            panic!("expected a thrown error, got {error:?}");
        };
        assert_eq!(message, "bad input");
        assert_eq!(file.as_deref(), Some("throw.rhai"));
        assert_eq!(*line, Some(2));
        let value = value.as_ref().expect("thrown value should be kept");
        assert_eq!(value.as_str(), Some("bad input"));
    }

    #[test]
    fn scripts_catch_bridge_errors_as_error_maps() {
        let engine = engine();
        engine
            .register_global_object("counter", Counter::new(0), Ownership::Auto)
            .expect("counter should register");
        let value = engine
            .evaluate(
                r#"
                let caught = "";
                try { counter.missing } catch (err) { caught = err.name + ": " + err.message; }
                caught
                "#,
                "catch.rhai",
            )
            .expect("evaluation should pass");
        let caught = value.as_str().expect("caught should be a string");
        assert!(caught.starts_with("ReferenceError: "));
        assert!(caught.contains("missing"));
    }

    #[test]
    fn abort_from_another_thread_stops_an_endless_loop() {
        let engine = engine();
        let handle = engine.handle();
        let worker = std::thread::spawn(move || {
            while !handle.is_evaluating() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            handle.abort_evaluation();
        });
        let error = engine
            .evaluate(
                "let n = 0; try { loop { n += 1; } } catch (err) { n = -1; }",
                "spin.rhai",
            )
            .expect_err("loop should be aborted");
        worker.join().expect("worker should finish");
        assert_eq!(error.code(), "BRIDGE_ABORTED");
        assert!(!engine.is_evaluating());
        assert_eq!(engine.frame_depth(), 0);
        let value = engine
            .evaluate("1 + 1", "after.rhai")
            .expect("engine should be usable again");
        assert_eq!(value.as_number(), Some(2.0));
    }

    #[test]
    fn print_reaches_the_listener() {
        let engine = engine();
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        engine.on_print(move |text| sink.borrow_mut().push(text.to_string()));
        engine
            .evaluate(r#"print("hello"); print(40 + 2);"#, "print.rhai")
            .expect("evaluation should pass");
        assert_eq!(*lines.borrow(), ["hello", "42"]);
    }

    fn rendered_items(engine: &ScriptEngine, value: &ScriptValue) -> Vec<String> {
        engine
            .new_iterator(value)
            .expect("iterator should build")
            .map(|entry| entry.map(|(_, value)| engine.to_display_string(&value)))
            .collect::<Result<Vec<_>, _>>()
            .expect("items should read")
    }

    #[test]
    fn floats_and_integers_keep_their_arithmetic() {
        let engine = engine();
        engine
            .register_global("n", &engine.new_number(7.0))
            .expect("global should register");
        engine
            .register_global("k", &engine.new_integer(7))
            .expect("global should register");
        let value = engine
            .evaluate("[n / 2, type_of(n), k / 2, type_of(k)]", "numbers.rhai")
            .expect("evaluation should pass");
        assert_eq!(rendered_items(&engine, &value), ["3.5", "f64", "3", "i64"]);
    }

    #[test]
    fn whole_floats_stay_floats_across_programs() {
        let engine = engine();
        engine
            .evaluate("let x = 1.0; let y = 4;", "define.rhai")
            .expect("evaluation should pass");
        let x = engine
            .property(&engine.global_object(), "x")
            .expect("lookup should pass");
        assert_eq!(x.as_integer(), None);
        let value = engine
            .evaluate("[x / 2, y / 3, type_of(x)]", "reuse.rhai")
            .expect("evaluation should pass");
        assert_eq!(rendered_items(&engine, &value), ["0.5", "1", "f64"]);
    }

    #[test]
    fn native_floats_enter_scripts_as_floats() {
        let engine = engine();
        engine
            .register_global_object("r", Arc::new(Reordered), Ownership::NativeOwned)
            .expect("object should register");
        engine
            .register_global_object("counter", Counter::new(7), Ownership::NativeOwned)
            .expect("counter should register");
        let value = engine
            .evaluate("[r.ratio / 2, counter.count / 2]", "native.rhai")
            .expect("evaluation should pass");
        assert_eq!(rendered_items(&engine, &value), ["3.5", "3"]);
    }

    #[test]
    fn maps_and_arrays_become_heap_objects() {
        let engine = engine();
        let value = engine
            .evaluate("#{ name: \"box\", sizes: [1, 2, 3] }", "shape.rhai")
            .expect("evaluation should pass");
        assert_eq!(engine.value_type(&value), "Object");
        let sizes = engine.property(&value, "sizes").expect("sizes should exist");
        assert_eq!(engine.value_type(&sizes), "Array");
        let length = engine.property(&sizes, "length").expect("length should read");
        assert_eq!(length.as_number(), Some(3.0));
    }

    #[test]
    fn global_arrays_are_updated_in_place() {
        let engine = engine();
        let items = engine
            .new_array(&[engine.new_number(1.0)])
            .expect("array should allocate");
        engine.register_global("items", &items).expect("global should register");
        engine
            .evaluate("items.push(2);", "push.rhai")
            .expect("evaluation should pass");
        let length = engine.property(&items, "length").expect("length should read");
        assert_eq!(length.as_number(), Some(2.0));
    }

    #[test]
    fn methods_bind_this_to_the_receiver() {
        let engine = engine();
        let person = engine.new_object().expect("object should allocate");
        engine
            .set_property(&person, "name", &engine.new_string("ada"))
            .expect("set should pass");
        let greet = engine
            .new_function("greet", |engine, this, _args| {
                let name = engine.property(this, "name")?;
                Ok(engine.new_string(&format!("hello {}", engine.to_display_string(&name))))
            })
            .expect("function should allocate");
        engine
            .set_property(&person, "greet", &greet)
            .expect("set should pass");
        engine.register_global("person", &person).expect("global should register");
        let value = engine
            .evaluate("person.greet()", "this.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_str(), Some("hello ada"));
    }

    #[test]
    fn global_this_exposes_the_realm_global() {
        let engine = engine();
        let value = engine
            .evaluate("fn later() { added } globalThis.added = 5; later()", "global.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(5.0));
    }

    #[test]
    fn closures_passed_to_native_code_remember_captures() {
        let engine = engine();
        let stored = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&stored);
        engine
            .register_function("keep", move |engine, _this, args| {
                *sink.borrow_mut() = args.first().cloned();
                Ok(engine.undefined())
            })
            .expect("function should register");
        engine
            .evaluate("let base = 10; keep(|x| x + base);", "capture.rhai")
            .expect("evaluation should pass");
        let callback = stored.borrow().clone().expect("callback should be kept");
        let result = engine
            .call(&callback, &engine.undefined(), &[engine.new_number(5.0)])
            .expect("call should pass");
        assert_eq!(result.as_number(), Some(15.0));
    }
}
