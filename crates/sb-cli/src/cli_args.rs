use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sb-cli")]
#[command(about = "Script bridge console: run scripts against demo native objects")]
pub(crate) struct Cli {
    /// Log bridge activity to stderr.
    #[arg(long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Mode,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Mode {
    /// Run a script file.
    Run(RunArgs),
    /// Evaluate a source string.
    Eval(EvalArgs),
    /// Parse a script file without running it.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub(crate) struct SessionArgs {
    /// JSON file with engine options and extra globals.
    #[arg(long = "config")]
    pub(crate) config: Option<String>,
    /// Run in an isolated closure realm.
    #[arg(long = "closure")]
    pub(crate) closure: bool,
}

#[derive(Debug, Args)]
pub(crate) struct RunArgs {
    pub(crate) file: String,
    #[command(flatten)]
    pub(crate) session: SessionArgs,
}

#[derive(Debug, Args)]
pub(crate) struct EvalArgs {
    pub(crate) source: String,
    #[command(flatten)]
    pub(crate) session: SessionArgs,
}

#[derive(Debug, Args)]
pub(crate) struct CheckArgs {
    pub(crate) file: String,
}
