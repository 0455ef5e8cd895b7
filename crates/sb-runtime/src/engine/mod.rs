#![allow(unused_imports)]

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use rhai::{
    Array, Blob, CallFnOptions, Dynamic, Engine, EvalAltResult, FnPtr, FuncRegistration,
    ImmutableString, Map, NativeCallContext, ParseError, Position, Scope, AST, INT,
};
use sb_core::*;
use serde::Deserialize;

include!("options.rs");
include!("lifecycle.rs");
include!("heap.rs");
include!("context.rs");
include!("values.rs");
include!("marshal.rs");
include!("proxy.rs");
include!("dispatch.rs");
include!("events.rs");
include!("eval.rs");
include!("closure.rs");
include!("../helpers/rhai_bridge.rs");

#[cfg(test)]
pub(super) mod runtime_test_support {
    use super::*;

    pub(crate) fn engine() -> ScriptEngine {
        ScriptEngine::new(EngineOptions::default())
    }

    /// Guard violations are returned instead of panicking.
    pub(crate) fn lenient_engine() -> ScriptEngine {
        ScriptEngine::new(EngineOptions {
            strict_guards: Some(false),
            ..EngineOptions::default()
        })
    }

    fn int_arg(args: &[Variant], index: usize) -> i32 {
        match args.get(index) {
            Some(Variant::I32(value)) => *value,
            _ => 0,
        }
    }

    fn string_arg(args: &[Variant], index: usize) -> String {
        args.get(index)
            .and_then(Variant::as_str)
            .unwrap_or_default()
            .to_string()
    }

    struct CounterState {
        count: i32,
        label: String,
        step: i32,
        secret: i32,
    }

    pub(crate) struct Counter {
        state: Mutex<CounterState>,
        changed: NativeSignal,
    }

    impl Counter {
        pub(crate) fn new(count: i32) -> Arc<Counter> {
            Arc::new(Counter {
                state: Mutex::new(CounterState {
                    count,
                    label: String::new(),
                    step: 1,
                    secret: 42,
                }),
                changed: NativeSignal::new(),
            })
        }

        pub(crate) fn count(&self) -> i32 {
            self.state.lock().count
        }

        pub(crate) fn label(&self) -> String {
            self.state.lock().label.clone()
        }

        /// Adds `amount` and emits `changed`, as native code would.
        pub(crate) fn bump(&self, amount: i32) -> i32 {
            let count = {
                let mut state = self.state.lock();
                state.count += amount;
                state.count
            };
            self.changed.emit(&[Variant::I32(count)]);
            count
        }

        pub(crate) fn changed_subscribers(&self) -> usize {
            self.changed.subscriber_count()
        }
    }

    impl NativeObject for Counter {
        fn metadata(&self) -> Arc<TypeMetadata> {
            static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
            Arc::clone(META.get_or_init(|| {
                TypeMetadata::builder("Counter")
                    .property(PropertyMeta::new("count", NativeType::I32).read_only())
                    .property(PropertyMeta::new("label", NativeType::String))
                    .property(PropertyMeta::new("step", NativeType::I32))
                    .property(PropertyMeta::new("secret", NativeType::I32).hidden())
                    .method(MethodMeta::new("add", [NativeType::I32], NativeType::I32))
                    .method(MethodMeta::new("add", [NativeType::String], NativeType::I32))
                    .method(MethodMeta::new("reset", [], NativeType::Void).slot())
                    .method(MethodMeta::new("deleteLater", [], NativeType::Void).slot())
                    .event(EventMeta::new("changed", [NativeType::I32]))
                    .build()
            }))
        }

        fn read_property(&self, index: usize) -> Result<Variant, String> {
            let state = self.state.lock();
            match index {
                0 => Ok(Variant::I32(state.count)),
                1 => Ok(Variant::string(state.label.clone())),
                2 => Ok(Variant::I32(state.step)),
                3 => Ok(Variant::I32(state.secret)),
                _ => Err(format!("no property {index}")),
            }
        }

        fn write_property(&self, index: usize, value: Variant) -> Result<(), String> {
            let mut state = self.state.lock();
            match (index, value) {
                (1, Variant::String(label)) => state.label = label,
                (2, Variant::I32(step)) => state.step = step,
                (index, _) => return Err(format!("property {index} is not writable")),
            }
            Ok(())
        }

        fn invoke(&self, _ctx: &dyn ScriptContext, index: usize, args: Vec<Variant>) -> Result<Variant, String> {
            match index {
                0 => Ok(Variant::I32(self.bump(int_arg(&args, 0)))),
                1 => {
                    let amount = string_arg(&args, 0).chars().count() as i32;
                    Ok(Variant::I32(self.bump(amount)))
                }
                2 => {
                    self.state.lock().count = 0;
                    Ok(Variant::Invalid)
                }
                3 => Ok(Variant::Invalid),
                _ => Err(format!("no method {index}")),
            }
        }

        fn signal(&self, index: usize) -> Option<&NativeSignal> {
            (index == 0).then_some(&self.changed)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct Seen {
        pub(crate) argument_count: usize,
        pub(crate) has_native_this: bool,
        pub(crate) backtrace: Vec<String>,
    }

    /// Records the call frame it was invoked under.
    #[derive(Default)]
    pub(crate) struct Probe {
        pub(crate) seen: Mutex<Seen>,
    }

    impl NativeObject for Probe {
        fn metadata(&self) -> Arc<TypeMetadata> {
            static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
            Arc::clone(META.get_or_init(|| {
                TypeMetadata::builder("Probe")
                    .method(MethodMeta::new(
                        "record",
                        [NativeType::String, NativeType::I32],
                        NativeType::Void,
                    ))
                    .build()
            }))
        }

        fn read_property(&self, index: usize) -> Result<Variant, String> {
            Err(format!("no property {index}"))
        }

        fn invoke(&self, ctx: &dyn ScriptContext, _index: usize, _args: Vec<Variant>) -> Result<Variant, String> {
            *self.seen.lock() = Seen {
                argument_count: ctx.argument_count(),
                has_native_this: ctx.this_native().is_some(),
                backtrace: ctx.backtrace(),
            };
            Ok(Variant::Invalid)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Each overload answers with its own signature.
    #[derive(Default)]
    pub(crate) struct Overloaded;

    impl NativeObject for Overloaded {
        fn metadata(&self) -> Arc<TypeMetadata> {
            static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
            Arc::clone(META.get_or_init(|| {
                TypeMetadata::builder("Overloaded")
                    .method(MethodMeta::new("pick", [NativeType::F64], NativeType::String))
                    .method(MethodMeta::new("pick", [NativeType::I32], NativeType::String))
                    .method(MethodMeta::new("pick", [NativeType::String], NativeType::String))
                    .method(MethodMeta::new(
                        "pick",
                        [NativeType::Bool, NativeType::I32],
                        NativeType::String,
                    ))
                    .method(MethodMeta::new(
                        "pick",
                        [NativeType::I32, NativeType::Bool],
                        NativeType::String,
                    ))
                    .method(MethodMeta::new("only", [NativeType::I32], NativeType::I32))
                    .method(MethodMeta::new("fail", [], NativeType::Void))
                    .method(MethodMeta::new(
                        "echo",
                        [NativeType::ScriptValue],
                        NativeType::ScriptValue,
                    ))
                    .build()
            }))
        }

        fn read_property(&self, index: usize) -> Result<Variant, String> {
            Err(format!("no property {index}"))
        }

        fn invoke(&self, _ctx: &dyn ScriptContext, index: usize, args: Vec<Variant>) -> Result<Variant, String> {
            match index {
                0 => Ok("f64".into()),
                1 => Ok("i32".into()),
                2 => Ok("string".into()),
                3 => Ok("bool,i32".into()),
                4 => Ok("i32,bool".into()),
                5 => Ok(Variant::I32(int_arg(&args, 0))),
                6 => Err("boom".to_string()),
                7 => Ok(args.into_iter().next().unwrap_or(Variant::Invalid)),
                _ => Err(format!("no method {index}")),
            }
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Shares its class name with `Overloaded` but declares the tied
    /// overloads in the opposite order.
    #[derive(Default)]
    pub(crate) struct Reordered;

    impl NativeObject for Reordered {
        fn metadata(&self) -> Arc<TypeMetadata> {
            static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
            Arc::clone(META.get_or_init(|| {
                TypeMetadata::builder("Overloaded")
                    .property(PropertyMeta::new("ratio", NativeType::F64).read_only())
                    .method(MethodMeta::new("pick", [NativeType::I32], NativeType::String))
                    .method(MethodMeta::new("pick", [NativeType::F64], NativeType::String))
                    .method(MethodMeta::new(
                        "pick",
                        [NativeType::I32, NativeType::Bool],
                        NativeType::String,
                    ))
                    .method(MethodMeta::new(
                        "pick",
                        [NativeType::Bool, NativeType::I32],
                        NativeType::String,
                    ))
                    .build()
            }))
        }

        fn read_property(&self, index: usize) -> Result<Variant, String> {
            match index {
                0 => Ok(Variant::F64(7.0)),
                _ => Err(format!("no property {index}")),
            }
        }

        fn invoke(&self, _ctx: &dyn ScriptContext, index: usize, _args: Vec<Variant>) -> Result<Variant, String> {
            match index {
                0 => Ok("i32".into()),
                1 => Ok("f64".into()),
                2 => Ok("i32,bool".into()),
                3 => Ok("bool,i32".into()),
                _ => Err(format!("no method {index}")),
            }
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// A `Panel`, which inherits the members of `Widget`.
    pub(crate) struct Widget {
        name: String,
        title: Mutex<String>,
        level: Mutex<i32>,
        renamed: NativeSignal,
        promoted: NativeSignal,
    }

    impl Widget {
        pub(crate) fn derived(name: &str) -> Arc<Widget> {
            Arc::new(Widget {
                name: name.to_string(),
                title: Mutex::new(String::new()),
                level: Mutex::new(0),
                renamed: NativeSignal::new(),
                promoted: NativeSignal::new(),
            })
        }
    }

    impl NativeObject for Widget {
        fn metadata(&self) -> Arc<TypeMetadata> {
            static META: OnceLock<Arc<TypeMetadata>> = OnceLock::new();
            Arc::clone(META.get_or_init(|| {
                let base = TypeMetadata::builder("Widget")
                    .property(PropertyMeta::new("title", NativeType::String))
                    .method(MethodMeta::new("describe", [], NativeType::String))
                    .method(MethodMeta::new("refresh", [], NativeType::Void).slot())
                    .event(EventMeta::new("renamed", [NativeType::String]))
                    .build();
                TypeMetadata::builder("Panel")
                    .inherits(&base)
                    .property(PropertyMeta::new("level", NativeType::I32))
                    .method(MethodMeta::new("promote", [NativeType::I32], NativeType::Void))
                    .event(EventMeta::new("promoted", [NativeType::I32]))
                    .build()
            }))
        }

        fn object_name(&self) -> Option<String> {
            Some(self.name.clone())
        }

        fn read_property(&self, index: usize) -> Result<Variant, String> {
            match index {
                0 => Ok(Variant::string(self.title.lock().clone())),
                1 => Ok(Variant::I32(*self.level.lock())),
                _ => Err(format!("no property {index}")),
            }
        }

        fn write_property(&self, index: usize, value: Variant) -> Result<(), String> {
            match (index, value) {
                (0, Variant::String(title)) => {
                    *self.title.lock() = title.clone();
                    self.renamed.emit(&[Variant::String(title)]);
                }
                (1, Variant::I32(level)) => *self.level.lock() = level,
                (index, _) => return Err(format!("property {index} is not writable")),
            }
            Ok(())
        }

        fn invoke(&self, _ctx: &dyn ScriptContext, index: usize, args: Vec<Variant>) -> Result<Variant, String> {
            match index {
                0 => Ok(Variant::string(format!("{}: {}", self.name, self.title.lock()))),
                1 => Ok(Variant::Invalid),
                2 => {
                    let level = {
                        let mut level = self.level.lock();
                        *level += int_arg(&args, 0);
                        *level
                    };
                    self.promoted.emit(&[Variant::I32(level)]);
                    Ok(Variant::Invalid)
                }
                _ => Err(format!("no method {index}")),
            }
        }

        fn signal(&self, index: usize) -> Option<&NativeSignal> {
            match index {
                0 => Some(&self.renamed),
                1 => Some(&self.promoted),
                _ => None,
            }
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
}
