/// Builds a realm-bound global for each closure realm, e.g. a module loader
/// that must not be shared with the parent realm.
pub type RealmFactory = dyn Fn(&ScriptEngine) -> Result<ScriptValue, BridgeError>;

/// Global names of the main realm, captured once for seeding closures.
pub(crate) struct GlobalSnapshot {
    names: Vec<String>,
}

impl ScriptEngine {
    /// Registers a global that every closure realm constructs afresh instead
    /// of copying from its parent. A later registration under the same name
    /// replaces the earlier one.
    pub fn register_realm_factory(
        &self,
        name: &str,
        factory: impl Fn(&ScriptEngine) -> Result<ScriptValue, BridgeError> + 'static,
    ) {
        let mut factories = self.inner.realm_factories.borrow_mut();
        factories.retain(|(existing, _)| existing != name);
        factories.push((name.to_string(), Rc::new(factory)));
    }

    /// Drops the cached global-name snapshot; the next closure takes a new one.
    pub fn invalidate_global_snapshot(&self) {
        if self.inner.global_snapshot.borrow_mut().take().is_some() {
            debug!("global snapshot invalidated");
        }
    }

    pub(crate) fn note_global_keys_changed(&self, id: ObjectId) {
        if id == self.inner.main_global
            && self.inner.options.snapshot_policy == SnapshotPolicy::TrackGlobals
        {
            self.invalidate_global_snapshot();
        }
    }

    fn global_snapshot_names(&self) -> Result<Vec<String>, BridgeError> {
        if let Some(snapshot) = self.inner.global_snapshot.borrow().as_ref() {
            return Ok(snapshot.names.clone());
        }
        let names = self.member_names(&Value::Object(self.inner.main_global))?;
        debug!("captured global snapshot of {} names", names.len());
        *self.inner.global_snapshot.borrow_mut() = Some(GlobalSnapshot {
            names: names.clone(),
        });
        Ok(names)
    }

    /// Runs `program` in a fresh realm seeded with the calling realm's
    /// globals and the members of `capture`. Script failures come back as an
    /// error object rather than an `Err`.
    pub fn run_in_closure(&self, capture: &ScriptValue, program: &Program) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("run_in_closure")?;
        self.check_program(program)?;
        let capture = self.unwrap_handle(capture)?;
        let result = self.run_in_realm(&capture, program);
        self.closure_result(result)
    }

    pub fn evaluate_in_closure(
        &self,
        capture: &ScriptValue,
        source: &str,
        file: &str,
    ) -> Result<ScriptValue, BridgeError> {
        self.ensure_live("evaluate_in_closure")?;
        let capture = self.unwrap_handle(capture)?;
        let result = self
            .compile(source, file)
            .and_then(|program| self.run_in_realm(&capture, &program));
        self.closure_result(result)
    }

    fn run_in_realm(&self, capture: &Value, program: &Program) -> Result<Value, BridgeError> {
        let parent = Value::Object(self.current_global());
        let realm = self.alloc(ObjectKind::Plain);
        let factories = self.inner.realm_factories.borrow().clone();
        let mut seeded = Vec::new();
        for name in self.global_snapshot_names()? {
            if factories.iter().any(|(factory, _)| *factory == name) {
                continue;
            }
            let value = self.get_value(&parent, &name)?;
            seeded.push((name, value));
        }
        for name in self.member_names(capture)? {
            let value = self.get_value(capture, &name)?;
            seeded.push((name, value));
        }
        self.with_object_mut(realm, |object| object.properties.extend(seeded))?;

        let _realm = self.enter_realm(realm);
        for (name, factory) in factories {
            let value = factory(self)?;
            let value = self.unwrap_handle(&value)?;
            self.set_value(&Value::Object(realm), &name, value)?;
        }
        debug!("running {} in closure realm", program.file());
        self.run_program(program)
    }

    fn closure_result(&self, result: Result<Value, BridgeError>) -> Result<ScriptValue, BridgeError> {
        match result {
            Ok(value) => Ok(self.make_handle(value)),
            Err(error) if error.is_guard_violation() || matches!(error, BridgeError::Aborted) => Err(error),
            Err(error) => {
                debug!("closure failed: {error}");
                let id = self.alloc_error(error.script_name(), &error.to_string());
                self.with_object_mut(id, |object| {
                    object
                        .properties
                        .insert("code".to_string(), Value::string(error.code()));
                })?;
                Ok(self.make_handle(Value::Object(id)))
            }
        }
    }
}
