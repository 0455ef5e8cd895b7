use std::any::Any;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sb_core::{
    EventMeta, MethodMeta, NativeObject, NativeSignal, NativeType, PropertyMeta, ScriptContext,
    TypeMetadata, Variant,
};

struct LampState {
    on: bool,
    brightness: i32,
}

/// A small native object scripts can drive from the console.
pub(crate) struct Lamp {
    state: Mutex<LampState>,
    toggled: NativeSignal,
}

impl Lamp {
    pub(crate) fn new() -> Arc<Lamp> {
        Arc::new(Lamp {
            state: Mutex::new(LampState {
                on: false,
                brightness: 100,
            }),
            toggled: NativeSignal::new(),
        })
    }

    pub(crate) fn is_on(&self) -> bool {
        self.state.lock().on
    }

    fn toggle(&self) -> bool {
        let on = {
            let mut state = self.state.lock();
            state.on = !state.on;
            state.on
        };
        self.toggled.emit(&[Variant::Bool(on)]);
        on
    }

    fn dim(&self, brightness: i32) -> i32 {
        let mut state = self.state.lock();
        state.brightness = brightness.clamp(0, 100);
        state.brightness
    }
}

fn preset(name: &str) -> Option<i32> {
    match name {
        "off" => Some(0),
        "low" => Some(10),
        "half" => Some(50),
        "high" => Some(100),
        _ => None,
    }
}

impl NativeObject for Lamp {
    fn metadata(&self) -> Arc<TypeMetadata> {
        static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
        Arc::clone(META.get_or_init(|| {
            TypeMetadata::builder("Lamp")
                .property(PropertyMeta::new("on", NativeType::Bool).read_only())
                .property(PropertyMeta::new("brightness", NativeType::I32))
                .method(MethodMeta::new("toggle", [], NativeType::Bool))
                .method(MethodMeta::new("dim", [NativeType::I32], NativeType::I32))
                .method(MethodMeta::new("dim", [NativeType::String], NativeType::I32))
                .event(EventMeta::new("toggled", [NativeType::Bool]))
                .build()
        }))
    }

    fn object_name(&self) -> Option<String> {
        Some("lamp".to_string())
    }

    fn has_owner(&self) -> bool {
        true
    }

    fn read_property(&self, index: usize) -> Result<Variant, String> {
        let state = self.state.lock();
        match index {
            0 => Ok(Variant::Bool(state.on)),
            1 => Ok(Variant::I32(state.brightness)),
            _ => Err(format!("Lamp has no property {index}")),
        }
    }

    fn write_property(&self, index: usize, value: Variant) -> Result<(), String> {
        match (index, value) {
            (1, Variant::I32(brightness)) => {
                self.dim(brightness);
                Ok(())
            }
            (index, _) => Err(format!("Lamp property {index} is not writable")),
        }
    }

    fn invoke(&self, _ctx: &dyn ScriptContext, index: usize, args: Vec<Variant>) -> Result<Variant, String> {
        match (index, args.first()) {
            (0, _) => Ok(Variant::Bool(self.toggle())),
            (1, Some(Variant::I32(brightness))) => Ok(Variant::I32(self.dim(*brightness))),
            (2, Some(Variant::String(name))) => preset(name)
                .map(|brightness| Variant::I32(self.dim(brightness)))
                .ok_or_else(|| format!("unknown brightness preset \"{name}\"")),
            _ => Err(format!("Lamp cannot invoke method {index}")),
        }
    }

    fn signal(&self, index: usize) -> Option<&NativeSignal> {
        (index == 0).then_some(&self.toggled)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
