use std::cell::RefCell;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::Arc;

use clap::Parser;
use log::debug;
use sb_core::{Ownership, ScriptValue};
use sb_runtime::ScriptEngine;
use tracing_subscriber::{fmt, EnvFilter};

mod cli_args;
mod demo;
mod error_map;
mod output;
mod source_loader;

pub(crate) use cli_args::{CheckArgs, Cli, EvalArgs, Mode, RunArgs, SessionArgs};
pub(crate) use error_map::{emit_error, map_cli_config, map_cli_source_read, CliError};
pub(crate) use source_loader::{load_config, read_script, CliConfig};

pub fn run_cli_from_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return error.exit_code();
        }
    };
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(error) => emit_error(error),
    }
}

/// `--verbose` wins over `RUST_LOG`; otherwise only warnings and errors show.
fn tracing_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Log output goes to stderr so stdout carries only the result protocol.
/// The engine's `log` records reach the subscriber through its log bridge.
fn init_tracing(verbose: bool) {
    let builder = fmt()
        .with_env_filter(tracing_filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time();
    if let Err(err) = builder.try_init() {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn run(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Mode::Run(args) => run_file(args),
        Mode::Eval(args) => run_source(args),
        Mode::Check(args) => run_check(args),
    }
}

fn run_file(args: RunArgs) -> Result<i32, CliError> {
    let source = read_script(&args.file).map_err(map_cli_source_read)?;
    run_session(&args.session, &source, &args.file)
}

fn run_source(args: EvalArgs) -> Result<i32, CliError> {
    run_session(&args.session, &args.source, "<eval>")
}

fn run_check(args: CheckArgs) -> Result<i32, CliError> {
    let source = read_script(&args.file).map_err(map_cli_source_read)?;
    let engine = ScriptEngine::default();
    engine.check_syntax(&source, &args.file)?;
    println!("RESULT:OK");
    Ok(0)
}

/// A console session: demo natives registered, config globals applied,
/// script output collected until the result is printed.
struct Session {
    engine: ScriptEngine,
    /// Native owner of the demo lamp; the script wrapper only observes it.
    lamp: Arc<demo::Lamp>,
    prints: Rc<RefCell<Vec<String>>>,
}

impl Session {
    fn new(config: &CliConfig) -> Result<Self, CliError> {
        let engine = ScriptEngine::new(config.engine.clone());
        let prints = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&prints);
        engine.on_print(move |text| sink.borrow_mut().push(text.to_string()));
        engine.on_unhandled_exception(|_, error| debug!("console saw unhandled exception: {error}"));

        let lamp = demo::Lamp::new();
        engine.register_global_object("lamp", lamp.clone(), Ownership::Auto)?;
        engine.register_function("now_ms", |engine, _this, _args| {
            let elapsed = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|duration| duration.as_millis() as i64)
                .unwrap_or_default();
            Ok(engine.new_integer(elapsed))
        })?;
        engine.register_realm_factory("console", |engine| {
            let console = engine.new_object()?;
            engine.set_property(&console, "isolated", &engine.new_bool(true))?;
            Ok(console)
        });
        let console = engine.new_object()?;
        engine.set_property(&console, "isolated", &engine.new_bool(false))?;
        engine.register_global("console", &console)?;

        for (name, value) in &config.globals {
            let value = output::json_to_script(&engine, value)?;
            engine.register_value(name, &value)?;
        }
        Ok(Self { engine, lamp, prints })
    }

    fn evaluate(&self, source: &str, file: &str, closure: bool) -> Result<ScriptValue, CliError> {
        if !closure {
            let value = self.engine.evaluate(source, file)?;
            self.engine.process_events();
            return Ok(value);
        }
        let capture = self.engine.new_object()?;
        let value = self.engine.evaluate_in_closure(&capture, source, file)?;
        self.engine.process_events();
        if value.is_object() && self.engine.value_type(&value).ends_with("Error") {
            return Err(closure_error(&self.engine, &value)?);
        }
        Ok(value)
    }
}

/// Turns the error object a closure run returns into a console error.
fn closure_error(engine: &ScriptEngine, value: &ScriptValue) -> Result<CliError, CliError> {
    let code = engine.property(value, "code")?;
    let message = engine.property(value, "message")?;
    Ok(CliError::new(
        code.as_str().unwrap_or("BRIDGE_THROWN"),
        engine.to_display_string(&message),
    ))
}

fn run_session(args: &SessionArgs, source: &str, file: &str) -> Result<i32, CliError> {
    let config = load_config(args.config.as_deref()).map_err(map_cli_config)?;
    let session = Session::new(&config)?;
    let value = session.evaluate(source, file, args.closure)?;
    let prints = session.prints.borrow().clone();
    debug!("lamp left {}", if session.lamp.is_on() { "on" } else { "off" });
    Ok(output::emit_success(&session.engine, &prints, &value)?)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&CliConfig::default()).expect("session should build")
    }

    #[test]
    fn sessions_expose_the_demo_lamp() {
        let session = session();
        let value = session
            .evaluate("lamp.toggle(); lamp.on", "lamp.rhai", false)
            .expect("evaluation should pass");
        assert_eq!(value.as_bool(), Some(true));
        assert!(session.lamp.is_on());
    }

    #[test]
    fn prints_are_collected_in_order() {
        let session = session();
        session
            .evaluate(r#"print("one"); print("two");"#, "print.rhai", false)
            .expect("evaluation should pass");
        assert_eq!(*session.prints.borrow(), ["one", "two"]);
    }

    #[test]
    fn closure_runs_get_their_own_console() {
        let session = session();
        let isolated = session
            .evaluate("console.isolated", "closure.rhai", true)
            .expect("closure should run");
        assert_eq!(isolated.as_bool(), Some(true));
        let shared = session
            .evaluate("console.isolated", "main.rhai", false)
            .expect("evaluation should pass");
        assert_eq!(shared.as_bool(), Some(false));
    }

    #[test]
    fn closure_failures_become_console_errors() {
        let session = session();
        let error = session
            .evaluate(r#"throw "bad input";"#, "closure.rhai", true)
            .expect_err("closure should fail");
        assert_eq!(error.code, "BRIDGE_THROWN");
        assert_eq!(error.message, "bad input");
    }

    #[test]
    fn config_globals_support_dotted_names() {
        let mut config = CliConfig::default();
        config
            .globals
            .insert("app.name".to_string(), serde_json::json!("console"));
        let session = Session::new(&config).expect("session should build");
        let value = session
            .evaluate("app.name", "config.rhai", false)
            .expect("evaluation should pass");
        assert_eq!(value.as_str(), Some("console"));
    }

    #[test]
    fn verbose_forces_debug_output() {
        use tracing_subscriber::filter::LevelFilter;
        assert_eq!(tracing_filter(true).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn parse_failures_return_clap_exit_codes() {
        assert_eq!(run_cli_from_args(["sb-cli", "frobnicate"]), 2);
    }
}
