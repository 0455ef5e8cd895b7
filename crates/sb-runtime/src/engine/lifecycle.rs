/// Host callback exposed to scripts as a function object.
pub type NativeFn =
    dyn Fn(&ScriptEngine, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, BridgeError>;
/// Work redirected onto the engine thread.
pub type Task = Box<dyn FnOnce(&ScriptEngine) + Send>;
type UnhandledListener = Rc<dyn Fn(&ScriptEngine, &BridgeError)>;
type PrintListener = Rc<dyn Fn(&str)>;

struct WrapperEntry {
    object: ObjectId,
    target: std::sync::Weak<dyn NativeObject>,
}

/// Engine state that other threads may touch.
struct EngineShared {
    id: EngineId,
    owner: ThreadId,
    destroyed: AtomicBool,
    abort: AtomicBool,
    evaluating: AtomicUsize,
    releases: Arc<ReleaseQueue>,
    tasks: Sender<Task>,
    /// Native identity to wrapper object. Guarded so that a finalizer
    /// removing an entry cannot race a concurrent wrap of the same address.
    wrappers: Mutex<HashMap<usize, WrapperEntry>>,
}

pub(crate) struct EngineInner {
    shared: Arc<EngineShared>,
    options: ResolvedOptions,
    heap: RefCell<Heap>,
    main_global: ObjectId,
    realm_stack: RefCell<Vec<ObjectId>>,
    frames: RefCell<Vec<Frame>>,
    running: RefCell<Vec<RunContext>>,
    task_queue: Receiver<Task>,
    /// Keyed by metadata identity; the entry keeps the metadata alive so
    /// its address is not reused by another type.
    surfaces: RefCell<HashMap<(usize, WrapOptions), (Arc<TypeMetadata>, Rc<ReflectedSurface>)>>,
    converters: RefCell<HashMap<NativeType, CustomConverter>>,
    prototypes: RefCell<HashMap<&'static str, ObjectId>>,
    realm_factories: RefCell<Vec<(String, Rc<RealmFactory>)>>,
    global_snapshot: RefCell<Option<GlobalSnapshot>>,
    interned_functions: RefCell<HashMap<(usize, String), ObjectId>>,
    raised: RefCell<HashMap<INT, BridgeError>>,
    next_raised: Cell<INT>,
    unhandled: RefCell<Vec<UnhandledListener>>,
    print_listener: RefCell<Option<PrintListener>>,
    torn_down: Cell<bool>,
}

thread_local! {
    static LIVE_ENGINES: RefCell<HashMap<EngineId, std::rc::Weak<EngineInner>>> =
        RefCell::new(HashMap::new());
}

/// A script engine instance. Cloning is cheap and yields another handle to
/// the same instance; the instance is torn down when the last clone drops
/// or `shutdown` is called. Not `Send`: all engine work happens on the
/// thread that created it, other threads go through [`EngineHandle`].
#[derive(Clone)]
pub struct ScriptEngine {
    inner: Rc<EngineInner>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl ScriptEngine {
    pub fn new(options: EngineOptions) -> Self {
        let options = options.resolve();
        let (sender, receiver) = unbounded();
        let shared = Arc::new(EngineShared {
            id: EngineId::next(),
            owner: std::thread::current().id(),
            destroyed: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            evaluating: AtomicUsize::new(0),
            releases: Arc::new(ReleaseQueue::new()),
            tasks: sender,
            wrappers: Mutex::new(HashMap::new()),
        });
        let mut heap = Heap::default();
        let main_global = heap.alloc(ObjectKind::Plain);
        let inner = Rc::new(EngineInner {
            shared,
            options,
            heap: RefCell::new(heap),
            main_global,
            realm_stack: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            running: RefCell::new(Vec::new()),
            task_queue: receiver,
            surfaces: RefCell::new(HashMap::new()),
            converters: RefCell::new(HashMap::new()),
            prototypes: RefCell::new(HashMap::new()),
            realm_factories: RefCell::new(Vec::new()),
            global_snapshot: RefCell::new(None),
            interned_functions: RefCell::new(HashMap::new()),
            raised: RefCell::new(HashMap::new()),
            next_raised: Cell::new(1),
            unhandled: RefCell::new(Vec::new()),
            print_listener: RefCell::new(None),
            torn_down: Cell::new(false),
        });
        LIVE_ENGINES.with(|engines| {
            engines
                .borrow_mut()
                .insert(inner.shared.id, Rc::downgrade(&inner));
        });
        debug!("script engine {} created", inner.shared.id.0);
        Self { inner }
    }

    pub fn id(&self) -> EngineId {
        self.inner.shared.id
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Fails with `EngineDestroyed` after teardown and `ThreadAffinity` off
    /// the owner thread. Both are programming errors: with strict guards on
    /// they panic, otherwise they are logged and returned.
    pub(crate) fn ensure_live(&self, operation: &str) -> Result<(), BridgeError> {
        let violation = if self.is_destroyed() {
            Some(BridgeError::EngineDestroyed)
        } else if std::thread::current().id() != self.inner.shared.owner {
            Some(BridgeError::ThreadAffinity {
                operation: operation.to_string(),
            })
        } else {
            None
        };
        match violation {
            None => Ok(()),
            Some(error) => Err(self.guard_violation(operation, error)),
        }
    }

    fn guard_violation(&self, operation: &str, error: BridgeError) -> BridgeError {
        if self.inner.options.strict_guards {
            panic!("{operation}: {error}");
        }
        error!("{operation}: {error}");
        error
    }

    /// One outer event-loop turn: drains deferred releases in FIFO order,
    /// runs tasks redirected from other threads, invalidates wrappers whose
    /// native objects died, and collects garbage once enough has been
    /// allocated.
    pub fn process_events(&self) {
        if self.is_destroyed() {
            return;
        }
        self.drain_releases();
        while let Ok(task) = self.inner.task_queue.try_recv() {
            task(self);
            if self.is_destroyed() {
                return;
            }
        }
        self.drain_releases();
        self.reap_dead_natives();
        let due = self.inner.heap.borrow().allocated_since_collect >= self.inner.options.gc_threshold;
        if due {
            self.collect_garbage();
        }
    }

    pub fn on_unhandled_exception(&self, listener: impl Fn(&ScriptEngine, &BridgeError) + 'static) {
        self.inner.unhandled.borrow_mut().push(Rc::new(listener));
    }

    pub fn on_print(&self, listener: impl Fn(&str) + 'static) {
        *self.inner.print_listener.borrow_mut() = Some(Rc::new(listener));
    }

    /// Reports an exception nobody can catch: logged, then handed to every
    /// listener exactly once.
    pub(crate) fn report_unhandled(&self, error: &BridgeError) {
        warn!("unhandled script exception: {error}");
        let listeners = self.inner.unhandled.borrow().clone();
        for listener in listeners {
            listener(self, error);
        }
    }

    /// Invalidates every wrapper, unsubscribes every event subscription,
    /// frees the heap and marks the engine destroyed.
    pub fn shutdown(&self) {
        if self.inner.torn_down.get() {
            return;
        }
        self.inner.shared.abort.store(true, Ordering::SeqCst);
        self.inner.teardown_with(self);
    }
}

impl EngineInner {
    fn teardown_with(&self, engine: &ScriptEngine) {
        self.torn_down.set(true);
        let proxies = {
            let heap = self.heap.borrow();
            heap.slots
                .iter()
                .filter_map(|slot| match &slot.object {
                    Some(HeapObject {
                        kind: ObjectKind::Native(proxy),
                        ..
                    }) => Some(Rc::clone(proxy)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        for proxy in &proxies {
            engine.invalidate_proxy(proxy);
        }
        self.shared.wrappers.lock().clear();
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.frames.borrow_mut().clear();
        self.realm_stack.borrow_mut().clear();
        self.running.borrow_mut().clear();
        self.interned_functions.borrow_mut().clear();
        self.prototypes.borrow_mut().clear();
        let freed = self.heap.borrow_mut().clear();
        for (_, object) in freed {
            for finalizer in object.finalizers {
                finalizer();
            }
        }
        while self.task_queue.try_recv().is_ok() {}
        self.shared.releases.drain();
        LIVE_ENGINES.with(|engines| {
            if let Ok(mut engines) = engines.try_borrow_mut() {
                engines.remove(&self.shared.id);
            }
        });
        debug!("script engine {} destroyed", self.shared.id.0);
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if self.torn_down.get() {
            return;
        }
        // Proxy invalidation needs an engine handle; only a detached
        // teardown is possible once the last one is gone.
        self.torn_down.set(true);
        let proxies = {
            let heap = self.heap.borrow();
            heap.slots
                .iter()
                .filter_map(|slot| match &slot.object {
                    Some(HeapObject {
                        kind: ObjectKind::Native(proxy),
                        ..
                    }) => Some(Rc::clone(proxy)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        for proxy in proxies {
            proxy.detach();
        }
        self.shared.wrappers.lock().clear();
        self.shared.destroyed.store(true, Ordering::SeqCst);
        LIVE_ENGINES.with(|engines| {
            if let Ok(mut engines) = engines.try_borrow_mut() {
                engines.remove(&self.shared.id);
            }
        });
    }
}

/// Finds the engine with `id` if it lives on the current thread.
fn live_engine(id: EngineId) -> Option<ScriptEngine> {
    LIVE_ENGINES
        .try_with(|engines| {
            engines
                .try_borrow()
                .ok()
                .and_then(|engines| engines.get(&id).and_then(std::rc::Weak::upgrade))
        })
        .ok()
        .flatten()
        .map(|inner| ScriptEngine { inner })
}

/// Thread-safe handle used by native code on other threads.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn engine_id(&self) -> EngineId {
        self.shared.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_engine_thread(&self) -> bool {
        std::thread::current().id() == self.shared.owner
    }

    /// Queues `task` for the next `process_events` on the engine thread.
    pub fn post(&self, task: impl FnOnce(&ScriptEngine) + Send + 'static) -> Result<(), BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::EngineDestroyed);
        }
        self.shared
            .tasks
            .send(Box::new(task))
            .map_err(|_| BridgeError::EngineDestroyed)
    }

    /// Runs `f` in place when called on the engine thread.
    pub fn with_engine<R>(&self, f: impl FnOnce(&ScriptEngine) -> R) -> Result<R, BridgeError> {
        if self.is_destroyed() {
            return Err(BridgeError::EngineDestroyed);
        }
        if !self.is_engine_thread() {
            return Err(BridgeError::ThreadAffinity {
                operation: "with_engine".to_string(),
            });
        }
        let engine = live_engine(self.shared.id).ok_or(BridgeError::EngineDestroyed)?;
        Ok(f(&engine))
    }

    pub fn is_evaluating(&self) -> bool {
        self.shared.evaluating.load(Ordering::SeqCst) > 0
    }

    /// Terminates the evaluation in progress, if any. Safe from any thread.
    pub fn abort_evaluation(&self) {
        if self.shared.evaluating.load(Ordering::SeqCst) > 0 {
            self.shared.abort.store(true, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.shared.id.0)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use super::runtime_test_support::*;

    #[test]
    fn operations_after_shutdown_fail_with_engine_destroyed() {
        let engine = lenient_engine();
        engine.shutdown();
        assert!(engine.is_destroyed());
        let error = engine.new_object().expect_err("allocation should fail");
        assert_eq!(error.code(), "BRIDGE_ENGINE_DESTROYED");
        let error = engine
            .evaluate("1 + 1", "late.rhai")
            .expect_err("evaluation should fail");
        assert_eq!(error.code(), "BRIDGE_ENGINE_DESTROYED");
    }

    #[test]
    #[should_panic(expected = "Script engine has been destroyed")]
    fn strict_guards_panic_on_use_after_shutdown() {
        let engine = ScriptEngine::new(EngineOptions {
            strict_guards: Some(true),
            ..EngineOptions::default()
        });
        engine.shutdown();
        let _ = engine.new_object();
    }

    #[test]
    fn posted_tasks_run_on_next_event_turn() {
        let engine = engine();
        let handle = engine.handle();
        let worker = std::thread::spawn(move || {
            assert!(!handle.is_engine_thread());
            let error = handle
                .with_engine(|_| ())
                .expect_err("with_engine should refuse other threads");
            assert_eq!(error.code(), "BRIDGE_THREAD_AFFINITY");
            handle
                .post(|engine| {
                    engine
                        .register_global("fromWorker", &engine.new_number(7.0))
                        .expect("global should register");
                })
                .expect("post should queue");
        });
        worker.join().expect("worker should finish");

        let global = engine.global_object();
        assert!(engine
            .property(&global, "fromWorker")
            .expect("lookup should pass")
            .is_undefined());
        engine.process_events();
        let value = engine
            .property(&global, "fromWorker")
            .expect("lookup should pass");
        assert_eq!(value.as_number(), Some(7.0));
    }

    #[test]
    fn post_after_shutdown_is_rejected() {
        let engine = engine();
        let handle = engine.handle();
        engine.shutdown();
        assert!(handle.is_destroyed());
        let error = handle.post(|_| {}).expect_err("post should fail");
        assert_eq!(error.code(), "BRIDGE_ENGINE_DESTROYED");
    }

    #[test]
    fn with_engine_runs_in_place_on_owner_thread() {
        let engine = engine();
        let handle = engine.handle();
        let id = handle
            .with_engine(|engine| engine.id())
            .expect("owner thread should be accepted");
        assert_eq!(id, engine.id());
    }

    #[test]
    fn abort_outside_evaluation_is_ignored() {
        let engine = engine();
        engine.handle().abort_evaluation();
        let value = engine
            .evaluate("40 + 2", "after_abort.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn dropping_last_clone_tears_down() {
        let engine = engine();
        let handle = engine.handle();
        let clone = engine.clone();
        drop(engine);
        assert!(!handle.is_destroyed());
        drop(clone);
        assert!(handle.is_destroyed());
    }
}
