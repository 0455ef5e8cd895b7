mod engine;

pub use engine::{
    CallContext, DemarshalFn, EngineHandle, EngineOptions, FrameGuard, FrameInfo, MarshalFn,
    NativeFn, Program, PropertyIterator, RealmFactory, ScriptEngine, SnapshotPolicy, Task,
    DEFAULT_GC_THRESHOLD, DEFAULT_MAX_CALL_DEPTH, MAX_CALL_ARGS, PENALTY_EXACT, PENALTY_MILD,
    PENALTY_STRONG,
};
pub use sb_core;
