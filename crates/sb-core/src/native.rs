use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::meta::TypeMetadata;
use crate::signal::NativeSignal;
use crate::value::ScriptValue;
use crate::variant::Variant;

/// The call frame a native method runs under, as seen from native code.
pub trait ScriptContext {
    fn argument_count(&self) -> usize;
    fn argument(&self, index: usize) -> Option<ScriptValue>;
    /// The script `this` of the current call; `undefined` when none.
    fn this_object(&self) -> Option<ScriptValue>;
    /// The native object behind `this`, when it wraps one.
    fn this_native(&self) -> Option<Arc<dyn NativeObject>>;
    /// Innermost frame first.
    fn backtrace(&self) -> Vec<String>;
}

/// A reflective host object. Member indices are positions in the
/// object's [`TypeMetadata`] lists.
pub trait NativeObject: Send + Sync + 'static {
    fn metadata(&self) -> Arc<TypeMetadata>;

    fn object_name(&self) -> Option<String> {
        None
    }

    /// True when some native parent already owns this object.
    fn has_owner(&self) -> bool {
        false
    }

    fn read_property(&self, index: usize) -> Result<Variant, String>;

    fn write_property(&self, index: usize, _value: Variant) -> Result<(), String> {
        Err(format!("property {index} is not writable"))
    }

    fn invoke(
        &self,
        ctx: &dyn ScriptContext,
        index: usize,
        args: Vec<Variant>,
    ) -> Result<Variant, String>;

    /// The registration table backing event `index`.
    fn signal(&self, _index: usize) -> Option<&NativeSignal> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn NativeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_name() {
            Some(name) => write!(f, "{}({name})", self.metadata().class_name()),
            None => write!(f, "{}", self.metadata().class_name()),
        }
    }
}

/// Stable identity of a native object: the address of its allocation.
pub fn native_identity(object: &Arc<dyn NativeObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// A context for native calls made outside any script frame.
#[derive(Debug, Default)]
pub struct DetachedContext;

impl ScriptContext for DetachedContext {
    fn argument_count(&self) -> usize {
        0
    }

    fn argument(&self, _index: usize) -> Option<ScriptValue> {
        None
    }

    fn this_object(&self) -> Option<ScriptValue> {
        None
    }

    fn this_native(&self) -> Option<Arc<dyn NativeObject>> {
        None
    }

    fn backtrace(&self) -> Vec<String> {
        Vec::new()
    }
}
