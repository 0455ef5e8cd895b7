use std::fmt::Display;

use sb_core::BridgeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CliError {
    pub(crate) code: String,
    pub(crate) message: String,
}

impl CliError {
    pub(crate) fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<BridgeError> for CliError {
    fn from(error: BridgeError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

fn map_error(code: &'static str, error: impl Display) -> CliError {
    CliError::new(code, error.to_string())
}

pub(crate) fn emit_error(error: CliError) -> i32 {
    println!("RESULT:ERROR");
    println!("ERROR_CODE:{}", error.code);
    println!(
        "ERROR_MSG_JSON:{}",
        serde_json::Value::String(error.message)
    );
    1
}

pub(crate) fn map_cli_source_read(error: anyhow::Error) -> CliError {
    map_error("CLI_SOURCE_READ", format!("{error:#}"))
}

pub(crate) fn map_cli_config(error: anyhow::Error) -> CliError {
    map_error("CLI_CONFIG_INVALID", format!("{error:#}"))
}

#[cfg(test)]
mod error_map_tests {
    use super::*;

    #[test]
    fn emit_error_returns_non_zero_exit_code() {
        let code = emit_error(CliError::new("ERR", "failed"));
        assert_eq!(code, 1);
    }

    #[test]
    fn bridge_errors_keep_their_codes() {
        let error = CliError::from(BridgeError::member_not_found("Lamp", "missing"));
        assert_eq!(error.code, "BRIDGE_MEMBER_NOT_FOUND");
        assert_eq!(error.message, "Lamp has no member named \"missing\"");
    }

    #[test]
    fn mapping_helpers_keep_context() {
        let error = map_cli_source_read(anyhow::anyhow!("denied").context("reading a.rhai"));
        assert_eq!(error.code, "CLI_SOURCE_READ");
        assert_eq!(error.message, "reading a.rhai: denied");
        assert_eq!(map_cli_config(anyhow::anyhow!("bad")).code, "CLI_CONFIG_INVALID");
    }
}
