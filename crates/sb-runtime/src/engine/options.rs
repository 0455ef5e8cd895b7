pub const DEFAULT_GC_THRESHOLD: usize = 4096;
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;
/// Highest script argument count routed to native members.
pub const MAX_CALL_ARGS: usize = 10;

/// How closure realms see the parent realm's global names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Names are captured on first use and never refreshed unless
    /// `invalidate_global_snapshot` is called.
    #[default]
    Persistent,
    /// The cached names are dropped whenever the parent global object
    /// gains or loses a key.
    TrackGlobals,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub strict_guards: Option<bool>,
    pub gc_threshold: Option<usize>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub max_call_depth: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedOptions {
    strict_guards: bool,
    gc_threshold: usize,
    snapshot_policy: SnapshotPolicy,
    max_call_depth: usize,
}

impl EngineOptions {
    fn resolve(&self) -> ResolvedOptions {
        ResolvedOptions {
            strict_guards: self.strict_guards.unwrap_or(cfg!(debug_assertions)),
            gc_threshold: self.gc_threshold.unwrap_or(DEFAULT_GC_THRESHOLD).max(1),
            snapshot_policy: self.snapshot_policy.unwrap_or_default(),
            max_call_depth: self.max_call_depth.unwrap_or(DEFAULT_MAX_CALL_DEPTH).max(1),
        }
    }
}

#[cfg(test)]
mod options_tests {
    use super::*;

    #[test]
    fn missing_fields_resolve_to_defaults() {
        let options: EngineOptions = serde_json::from_str("{}").expect("options should parse");
        let resolved = options.resolve();
        assert_eq!(resolved.gc_threshold, DEFAULT_GC_THRESHOLD);
        assert_eq!(resolved.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(resolved.snapshot_policy, SnapshotPolicy::Persistent);
        assert_eq!(resolved.strict_guards, cfg!(debug_assertions));
    }

    #[test]
    fn explicit_fields_win() {
        let options: EngineOptions = serde_json::from_str(
            r#"{"strict_guards": false, "gc_threshold": 0, "snapshot_policy": "track_globals"}"#,
        )
        .expect("options should parse");
        let resolved = options.resolve();
        assert!(!resolved.strict_guards);
        assert_eq!(resolved.gc_threshold, 1);
        assert_eq!(resolved.snapshot_policy, SnapshotPolicy::TrackGlobals);
    }
}
