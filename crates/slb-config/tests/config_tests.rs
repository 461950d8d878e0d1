#[cfg(test)]
mod tests {
    use slb_config::ConfigLoader;
    use slb_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_general_config_defaults() {
        let config = GeneralConfig::default();
        assert_eq!(config.request_timeout_secs, 1800);
        assert_eq!(config.max_pending_per_session, 5);
        assert_eq!(config.max_requests_per_minute, 10);
        assert_eq!(config.rate_limit_action, RateLimitAction::Reject);
        assert!(config.redact_patterns.is_empty());
    }

    #[test]
    fn test_rate_limit_action_parsing() {
        let config: SlbConfig = toml::from_str(
            r#"
[general]
max_requests_per_minute = 3
rate_limit_action = "warn"
"#,
        )
        .unwrap();
        assert_eq!(config.general.max_requests_per_minute, 3);
        assert_eq!(config.general.rate_limit_action, RateLimitAction::Warn);
        assert_eq!(config.general.rate_limit_action.to_string(), "warn");

        let unknown = toml::from_str::<SlbConfig>("[general]\nrate_limit_action = \"queue\"\n");
        assert!(unknown.is_err());
    }

    #[test]
    fn test_pattern_tier_defaults() {
        let config = PatternsConfig::default();
        assert_eq!(config.critical.min_approvals, 2);
        assert_eq!(config.dangerous.min_approvals, 1);
        assert_eq!(config.caution.min_approvals, 0);
        assert_eq!(config.safe.min_approvals, 0);
        assert!(!config.critical.patterns.is_empty());
        assert!(!config.safe.patterns.is_empty());
    }

    #[test]
    fn test_rollback_config_defaults() {
        let config = RollbackConfig::default();
        assert!(config.enabled);
        assert!(config.base_dir.is_none());
        assert_eq!(config.max_size_mb, 100);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.command_timeout_secs, 30);
    }

    #[test]
    fn test_store_and_logging_defaults() {
        let store = StoreConfig::default();
        assert!(store.db_path.ends_with(".slb/state.db"));
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert_eq!(logging.format, "pretty");
    }

    #[test]
    fn test_default_config_validates() {
        let warnings = SlbConfig::default().validate().unwrap();
        assert!(
            warnings
                .iter()
                .all(|w| w.severity != WarningSeverity::Error)
        );
    }

    // ── Agents ─────────────────────────────────────────────────

    #[test]
    fn test_blocked_agents_case_insensitive() {
        let agents = AgentsConfig {
            blocked: vec!["RogueBot".into()],
        };
        assert!(agents.is_blocked("roguebot"));
        assert!(agents.is_blocked("ROGUEBOT"));
        assert!(!agents.is_blocked("BlueLake"));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SlbConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: SlbConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            restored.patterns.critical.patterns,
            config.patterns.critical.patterns
        );
        assert_eq!(
            restored.general.request_timeout_secs,
            config.general.request_timeout_secs
        );
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[general]
request_timeout_secs = 600

[agents]
blocked = ["RogueBot"]
"#;
        let config: SlbConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.request_timeout_secs, 600);
        assert_eq!(config.agents.blocked, vec!["RogueBot".to_string()]);
        // Defaults should fill in
        assert_eq!(config.general.max_pending_per_session, 5);
        assert_eq!(config.sessions.stale_threshold_secs, 1800);
        assert_eq!(config.patterns.critical.min_approvals, 2);
    }

    #[test]
    fn test_custom_tier_with_rules() {
        let toml_str = r#"
[patterns.critical]
min_approvals = 2
patterns = ['^psql\s.*DROP']

[[patterns.critical.rules]]
pattern = '^vault\s+delete'
min_approvals = 3
"#;
        let config: SlbConfig = toml::from_str(toml_str).unwrap();
        let all: Vec<&str> = config.patterns.critical.all_patterns().collect();
        assert_eq!(all, vec![r"^psql\s.*DROP", r"^vault\s+delete"]);
        assert_eq!(config.patterns.critical.rules[0].min_approvals, Some(3));
        // Other tiers keep their built-in lists
        assert!(!config.patterns.dangerous.patterns.is_empty());
    }

    // ── Validation ─────────────────────────────────────────────

    #[test]
    fn test_validate_rejects_zero_dangerous_threshold() {
        let mut config = SlbConfig::default();
        config.patterns.dangerous.min_approvals = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("patterns.dangerous.min_approvals"));
    }

    #[test]
    fn test_validate_rejects_critical_below_dangerous() {
        let mut config = SlbConfig::default();
        config.patterns.critical.min_approvals = 1;
        config.patterns.dangerous.min_approvals = 2;
        let err = config.validate().unwrap_err();
        assert!(err.contains("patterns.critical.min_approvals"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = SlbConfig::default();
        config.patterns.caution.patterns.push("(unclosed".into());
        let err = config.validate().unwrap_err();
        assert!(err.contains("patterns.caution"));

        let mut config = SlbConfig::default();
        config.general.redact_patterns.push("[".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_disabled_rollback() {
        let mut config = SlbConfig::default();
        config.rollback.enabled = false;
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "rollback.enabled"));
    }

    #[test]
    fn test_warning_display() {
        let w = ConfigWarning {
            field: "logging.format".into(),
            message: "unknown log format 'xml'".into(),
            severity: WarningSeverity::Warning,
            hint: Some("Valid values: pretty, json, compact".into()),
        };
        let s = w.to_string();
        assert!(s.starts_with("warning logging.format"));
        assert!(s.contains("Valid values"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("slb.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[general]
max_pending_per_session = 2

[rollback]
max_size_mb = 10
retention_days = 7

[logging]
format = "json"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.general.max_pending_per_session, 2);
        assert_eq!(config.rollback.max_size_mb, 10);
        assert_eq!(config.rollback.retention_days, 7);
        assert_eq!(config.logging.format, "json");
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(dir.path().join("absent.toml").as_path())).unwrap();
        assert_eq!(loader.get().general.request_timeout_secs, 1800);
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("slb.toml");
        std::fs::write(
            &config_path,
            "[patterns.dangerous]\nmin_approvals = 0\npatterns = []\n",
        )
        .unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());

        std::fs::write(&config_path, "not = [valid").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("slb.toml");

        std::fs::write(&config_path, "[agents]\nblocked = [\"A\"]\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().agents.blocked, vec!["A".to_string()]);

        std::fs::write(&config_path, "[agents]\nblocked = [\"A\", \"B\"]\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().agents.blocked.len(), 2);

        // A broken file leaves the current config in place
        std::fs::write(&config_path, "[general]\nrequest_timeout_secs = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().general.request_timeout_secs, 1800);
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = SlbConfig::default();
        assert!(ConfigLoader::from_config(config.clone()).is_ok());
        config.sessions.stale_threshold_secs = 0;
        assert!(ConfigLoader::from_config(config).is_err());
    }
}
