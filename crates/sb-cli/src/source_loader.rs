use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use sb_runtime::EngineOptions;
use serde::Deserialize;

/// Contents of a `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CliConfig {
    pub(crate) engine: EngineOptions,
    /// Extra globals, converted from JSON before the script runs.
    pub(crate) globals: BTreeMap<String, serde_json::Value>,
}

pub(crate) fn read_script(path: &str) -> anyhow::Result<String> {
    fs::read_to_string(Path::new(path)).with_context(|| format!("reading script {path}"))
}

pub(crate) fn load_config(path: Option<&str>) -> anyhow::Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {path}"))
}

#[cfg(test)]
mod source_loader_tests {
    use super::*;
    use crate::cli_test_support::*;

    #[test]
    fn missing_config_path_yields_defaults() {
        let config = load_config(None).expect("default config should load");
        assert!(config.globals.is_empty());
        assert!(config.engine.max_call_depth.is_none());
    }

    #[test]
    fn config_files_parse_engine_options_and_globals() {
        let path = temp_path("config.json");
        write_file(
            &path,
            r#"{"engine": {"snapshot_policy": "track_globals"}, "globals": {"greeting": "hi"}}"#,
        );
        let config = load_config(path.to_str()).expect("config should load");
        assert_eq!(
            config.engine.snapshot_policy,
            Some(sb_runtime::SnapshotPolicy::TrackGlobals)
        );
        assert_eq!(config.globals["greeting"], serde_json::json!("hi"));
    }

    #[test]
    fn unreadable_files_report_the_path() {
        let error = read_script("/definitely/not/here.rhai").expect_err("read should fail");
        assert!(format!("{error:#}").starts_with("reading script /definitely/not/here.rhai"));

        let path = temp_path("broken.json");
        write_file(&path, "{");
        let error = load_config(path.to_str()).expect_err("parse should fail");
        assert!(error.to_string().starts_with("parsing config"));
    }
}
