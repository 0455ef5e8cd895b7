#[derive(Clone)]
pub(crate) struct Frame {
    callee: String,
    location: Option<String>,
    this: Value,
    args: Vec<Value>,
    native_this: Option<Arc<dyn NativeObject>>,
}

impl Frame {
    fn new(callee: impl Into<String>, this: Value, args: Vec<Value>) -> Self {
        Self {
            callee: callee.into(),
            location: None,
            this,
            args,
            native_this: None,
        }
    }

    fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    fn with_native(mut self, native: Arc<dyn NativeObject>) -> Self {
        self.native_this = Some(native);
        self
    }

    fn trace(&self, out: &mut Vec<ObjectId>) {
        out.extend(self.this.object_id());
        out.extend(self.args.iter().filter_map(Value::object_id));
    }

    fn describe(&self) -> String {
        match &self.location {
            Some(location) => format!("{} ({location})", self.callee),
            None => self.callee.clone(),
        }
    }
}

/// Pops its frame when dropped, including on error paths.
pub struct FrameGuard {
    engine: ScriptEngine,
    depth: usize,
}

impl std::fmt::Debug for FrameGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameGuard").field("depth", &self.depth).finish_non_exhaustive()
    }
}

impl FrameGuard {
    pub fn pop(self) {}

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut frames = self.engine.inner.frames.borrow_mut();
        if frames.len() >= self.depth {
            frames.truncate(self.depth - 1);
        }
    }
}

/// Snapshot of one call frame.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub callee: String,
    pub location: Option<String>,
    pub this: ScriptValue,
    pub arguments: Vec<ScriptValue>,
}

/// The frame a native method was invoked under.
pub struct CallContext<'a> {
    engine: &'a ScriptEngine,
    index: usize,
}

impl ScriptContext for CallContext<'_> {
    fn argument_count(&self) -> usize {
        self.engine
            .inner
            .frames
            .borrow()
            .get(self.index)
            .map_or(0, |frame| frame.args.len())
    }

    fn argument(&self, index: usize) -> Option<ScriptValue> {
        let value = self
            .engine
            .inner
            .frames
            .borrow()
            .get(self.index)?
            .args
            .get(index)?
            .clone();
        Some(self.engine.make_handle(value))
    }

    fn this_object(&self) -> Option<ScriptValue> {
        let value = self.engine.inner.frames.borrow().get(self.index)?.this.clone();
        Some(self.engine.make_handle(value))
    }

    fn this_native(&self) -> Option<Arc<dyn NativeObject>> {
        self.engine
            .inner
            .frames
            .borrow()
            .get(self.index)?
            .native_this
            .clone()
    }

    fn backtrace(&self) -> Vec<String> {
        self.engine.backtrace()
    }
}

impl ScriptEngine {
    pub(crate) fn enter_frame(&self, frame: Frame) -> Result<FrameGuard, BridgeError> {
        let mut frames = self.inner.frames.borrow_mut();
        if frames.len() >= self.inner.options.max_call_depth {
            return Err(BridgeError::invalid_argument(format!(
                "Maximum call depth of {} exceeded",
                self.inner.options.max_call_depth
            )));
        }
        frames.push(frame);
        Ok(FrameGuard {
            engine: self.clone(),
            depth: frames.len(),
        })
    }

    pub(crate) fn call_context(&self, guard: &FrameGuard) -> CallContext<'_> {
        CallContext {
            engine: self,
            index: guard.depth - 1,
        }
    }

    /// Pushes a frame for native code re-entering the engine on its own
    /// behalf. The frame is popped when the guard drops.
    pub fn push_frame(
        &self,
        this: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<FrameGuard, BridgeError> {
        self.ensure_live("push_frame")?;
        let this = self.unwrap_handle(this)?;
        let args = args
            .iter()
            .map(|arg| self.unwrap_handle(arg))
            .collect::<Result<Vec<_>, _>>()?;
        self.enter_frame(Frame::new("<native>", this, args))
    }

    pub fn frame_depth(&self) -> usize {
        self.inner.frames.borrow().len()
    }

    pub fn current_frame(&self) -> Option<FrameInfo> {
        let frame = self.inner.frames.borrow().last().cloned()?;
        Some(FrameInfo {
            callee: frame.callee,
            location: frame.location,
            this: self.make_handle(frame.this),
            arguments: frame.args.into_iter().map(|arg| self.make_handle(arg)).collect(),
        })
    }

    /// Innermost frame first.
    pub fn backtrace(&self) -> Vec<String> {
        self.inner
            .frames
            .borrow()
            .iter()
            .rev()
            .map(Frame::describe)
            .collect()
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;
    use super::runtime_test_support::*;

    #[test]
    fn guards_pop_in_reverse_order() {
        let engine = engine();
        let this = engine.new_string("outer");
        let outer = engine.push_frame(&this, &[]).expect("push should pass");
        {
            let args = [engine.new_number(1.0), engine.new_number(2.0)];
            let _inner = engine
                .push_frame(&engine.undefined(), &args)
                .expect("push should pass");
            let frame = engine.current_frame().expect("frame should exist");
            assert_eq!(frame.arguments.len(), 2);
            assert_eq!(engine.frame_depth(), 2);
        }
        assert_eq!(engine.frame_depth(), 1);
        let frame = engine.current_frame().expect("frame should exist");
        assert_eq!(frame.this.as_str(), Some("outer"));
        outer.pop();
        assert_eq!(engine.frame_depth(), 0);
        assert!(engine.current_frame().is_none());
    }

    #[test]
    fn depth_limit_is_enforced() {
        let engine = ScriptEngine::new(EngineOptions {
            max_call_depth: Some(2),
            ..EngineOptions::default()
        });
        let _a = engine.push_frame(&engine.undefined(), &[]).expect("first push");
        let _b = engine.push_frame(&engine.undefined(), &[]).expect("second push");
        let error = engine
            .push_frame(&engine.undefined(), &[])
            .expect_err("third push should fail");
        assert_eq!(error.code(), "BRIDGE_INVALID_ARGUMENT");
        assert_eq!(engine.frame_depth(), 2);
    }

    #[test]
    fn native_methods_see_their_call_frame() {
        let engine = engine();
        let probe = Arc::new(Probe::default());
        engine
            .register_global_object("probe", probe.clone(), Ownership::NativeOwned)
            .expect("probe should register");
        engine
            .evaluate(r#"probe.record("a", 2)"#, "frames.rhai")
            .expect("evaluation should pass");
        let seen = probe.seen.lock().clone();
        assert_eq!(seen.argument_count, 2);
        assert!(seen.has_native_this);
        assert_eq!(seen.backtrace[0], "Probe::record");
        assert!(seen.backtrace.iter().any(|line| line.contains("frames.rhai")));
        assert_eq!(engine.frame_depth(), 0);
    }
}
