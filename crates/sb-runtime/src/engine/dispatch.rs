struct Candidate {
    index: usize,
    penalty: u32,
    arguments: Vec<Variant>,
}

struct Rejection {
    failures: usize,
    position: usize,
    target: NativeType,
}

impl ScriptEngine {
    /// Resolves `name(args)` against the overload set of `proxy` and invokes
    /// the winner. Only overloads declaring exactly `args.len()` parameters
    /// are considered; the lowest total conversion penalty wins, and ties go
    /// to the overload declared first.
    pub(crate) fn dispatch_method(
        &self,
        proxy: &Rc<ObjectProxy>,
        name: &str,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let native = proxy.target()?;
        let Some(entry) = proxy.surface.methods.get(name) else {
            return Err(BridgeError::member_not_found(proxy.class_name(), name));
        };
        let full_name = proxy.full_name(name);
        let meta = native.metadata();
        let overload_error = |detail: String| BridgeError::OverloadResolution {
            method: full_name.clone(),
            argument_count: args.len(),
            message: format!("Native call of {full_name} failed: {detail}"),
        };
        if args.len() > entry.max_arity {
            return Err(overload_error(format!(
                "unexpected parameter count ({})",
                args.len()
            )));
        }

        let mut best: Option<Candidate> = None;
        let mut closest: Option<Rejection> = None;
        for &index in &entry.overloads {
            let method = &meta.methods()[index];
            if method.params.len() != args.len() {
                continue;
            }
            let mut arguments = Vec::with_capacity(args.len());
            let mut penalty = 0;
            let mut rejection: Option<Rejection> = None;
            for (position, (arg, target)) in args.iter().zip(&method.params).enumerate() {
                match self.to_native_value(arg, Some(*target)) {
                    Ok(converted) => {
                        penalty += self.penalty(arg, *target);
                        arguments.push(converted);
                    }
                    Err(Mismatch) => match rejection.as_mut() {
                        Some(rejection) => rejection.failures += 1,
                        None => {
                            rejection = Some(Rejection {
                                failures: 1,
                                position,
                                target: *target,
                            })
                        }
                    },
                }
            }
            if let Some(rejection) = rejection {
                if closest
                    .as_ref()
                    .map_or(true, |closest| rejection.failures < closest.failures)
                {
                    closest = Some(rejection);
                }
                continue;
            }
            if best.as_ref().map_or(true, |best| penalty < best.penalty) {
                best = Some(Candidate {
                    index,
                    penalty,
                    arguments,
                });
            }
        }

        let Some(winner) = best else {
            return Err(match closest {
                Some(rejection) => overload_error(format!(
                    "Cannot convert parameter {} from {} to {}",
                    rejection.position + 1,
                    self.type_name(&args[rejection.position]),
                    rejection.target
                )),
                None => overload_error(format!("unexpected parameter count ({})", args.len())),
            });
        };

        let method = &meta.methods()[winner.index];
        let this = proxy
            .object_id()
            .map(Value::Object)
            .ok_or(BridgeError::InvalidHandle)?;
        let frame = Frame::new(full_name.clone(), this, args.to_vec()).with_native(Arc::clone(&native));
        let guard = self.enter_frame(frame)?;
        let result = native
            .invoke(&self.call_context(&guard), winner.index, winner.arguments)
            .map_err(BridgeError::native)?;
        guard.pop();
        if method.ret == NativeType::Void {
            return Ok(Value::Undefined);
        }
        self.to_script_value(&result)
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use super::runtime_test_support::*;

    fn picker() -> ScriptEngine {
        let engine = engine();
        engine
            .register_global_object("o", Arc::new(Overloaded::default()), Ownership::NativeOwned)
            .expect("overloaded object should register");
        engine
    }

    fn pick(engine: &ScriptEngine, source: &str) -> String {
        engine
            .evaluate(source, "pick.rhai")
            .expect("evaluation should pass")
            .as_str()
            .map(str::to_string)
            .unwrap_or_default()
    }

    #[test]
    fn exact_matches_win() {
        let engine = picker();
        assert_eq!(pick(&engine, r#"o.pick("x")"#), "string");
        assert_eq!(pick(&engine, "o.pick(true, 2)"), "bool,i32");
    }

    #[test]
    fn ties_go_to_the_first_declared_overload() {
        let engine = picker();
        for _ in 0..8 {
            assert_eq!(pick(&engine, "o.pick(1)"), "f64");
            assert_eq!(pick(&engine, "o.pick(2.5)"), "f64");
            assert_eq!(pick(&engine, "o.pick(false)"), "f64");
        }
    }

    #[test]
    fn penalties_are_summed_across_parameters() {
        let engine = picker();
        // bool,i32 costs 0 + 5; i32,bool costs 5 + 0; the first declared wins.
        assert_eq!(pick(&engine, "o.pick(true, false)"), "bool,i32");
        // i32,bool costs 0 + 0.
        assert_eq!(pick(&engine, "o.pick(1, true)"), "i32,bool");
    }

    #[test]
    fn reversing_declaration_order_flips_the_tie_winner() {
        let engine = engine();
        engine
            .register_global_object("r", Arc::new(Reordered), Ownership::NativeOwned)
            .expect("reordered object should register");
        assert_eq!(pick(&engine, "r.pick(1)"), "i32");
        assert_eq!(pick(&engine, "r.pick(false)"), "i32");
        assert_eq!(pick(&engine, "r.pick(true, false)"), "i32,bool");
        assert_eq!(pick(&engine, "r.pick(2.5)"), "i32");
    }

    #[test]
    fn failed_conversions_fall_through_to_other_overloads() {
        let engine = picker();
        assert_eq!(pick(&engine, "o.pick([1])"), "string");
    }

    #[test]
    fn arity_mismatch_reports_parameter_count() {
        let engine = picker();
        let error = engine
            .evaluate("o.pick()", "arity.rhai")
            .expect_err("no overload takes zero arguments");
        assert_eq!(error.code(), "BRIDGE_OVERLOAD_RESOLUTION");
        assert_eq!(
            error.to_string(),
            "Native call of Overloaded::pick failed: unexpected parameter count (0)"
        );
    }

    #[test]
    fn conversion_failure_names_the_parameter() {
        let engine = picker();
        let error = engine
            .evaluate("o.only(#{ a: 1 })", "convert.rhai")
            .expect_err("map should not convert to i32");
        assert_eq!(
            error.to_string(),
            "Native call of Overloaded::only failed: Cannot convert parameter 1 from Object to i32"
        );
    }

    #[test]
    fn native_errors_surface_as_native_failures() {
        let engine = picker();
        let error = engine
            .evaluate("o.fail()", "fail.rhai")
            .expect_err("native method should fail");
        assert_eq!(error.code(), "BRIDGE_NATIVE_FAILURE");
        assert_eq!(error.to_string(), "boom");
        assert_eq!(engine.frame_depth(), 0);
    }

    #[test]
    fn script_values_pass_through_untouched() {
        let engine = picker();
        let value = engine
            .evaluate("o.echo(#{ a: 41 }).a + 1", "echo.rhai")
            .expect("evaluation should pass");
        assert_eq!(value.as_number(), Some(42.0));
    }

    #[test]
    fn void_methods_return_undefined() {
        let engine = engine();
        let counter = Counter::new(7);
        engine
            .register_global_object("counter", counter.clone(), Ownership::NativeOwned)
            .expect("counter should register");
        let value = engine
            .evaluate("counter.reset()", "void.rhai")
            .expect("evaluation should pass");
        assert!(value.is_undefined());
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn method_objects_can_be_detached_and_called() {
        let engine = engine();
        let counter = Counter::new(1);
        let wrapper = engine
            .register_global_object("counter", counter.clone(), Ownership::NativeOwned)
            .expect("counter should register");
        let add = engine.property(&wrapper, "add").expect("method should resolve");
        assert!(engine.is_callable_value(&add));
        let again = engine.property(&wrapper, "add").expect("method should resolve");
        assert!(engine.strict_equals(&add, &again));
        let result = engine
            .call(&add, &engine.undefined(), &[engine.new_string("abc")])
            .expect("call should pass");
        assert_eq!(result.as_number(), Some(4.0));
    }
}
