use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration: maps to `slb.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlbConfig {
    pub general: GeneralConfig,
    pub sessions: SessionsConfig,
    pub patterns: PatternsConfig,
    pub rollback: RollbackConfig,
    pub agents: AgentsConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

// ── General ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// How long a request stays open for review before it times out.
    pub request_timeout_secs: u64,
    /// Maximum pending requests a single session may hold. 0 = unlimited.
    pub max_pending_per_session: usize,
    /// Maximum requests a single session may open per minute. 0 = unlimited.
    pub max_requests_per_minute: usize,
    /// What happens when a session goes over either limit.
    pub rate_limit_action: RateLimitAction,
    /// Extra regexes whose matches are masked in the reviewer-facing command.
    pub redact_patterns: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 1800,
            max_pending_per_session: 5,
            max_requests_per_minute: 10,
            rate_limit_action: RateLimitAction::Reject,
            redact_patterns: vec![],
        }
    }
}

/// Response to a session exceeding its request limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitAction {
    /// Refuse the request.
    #[default]
    Reject,
    /// Log a warning and open the request anyway.
    Warn,
}

impl std::fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitAction::Reject => write!(f, "reject"),
            RateLimitAction::Warn => write!(f, "warn"),
        }
    }
}

// ── Sessions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// A session without a heartbeat for this long is stale.
    pub stale_threshold_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: 1800,
        }
    }
}

// ── Patterns ───────────────────────────────────────────────────

/// Rule lists per tier. Evaluated critical → dangerous → caution → safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternsConfig {
    pub critical: PatternTierConfig,
    pub dangerous: PatternTierConfig,
    pub caution: PatternTierConfig,
    pub safe: PatternTierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternTierConfig {
    /// Approvals required for commands in this tier.
    pub min_approvals: u32,
    /// Regexes matched against each normalized command segment.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Rules that carry their own approval threshold.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub min_approvals: Option<u32>,
}

impl PatternTierConfig {
    fn builtin(min_approvals: u32, patterns: &[&str]) -> Self {
        Self {
            min_approvals,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            rules: vec![],
        }
    }

    /// All pattern strings of the tier, plain patterns first.
    pub fn all_patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns
            .iter()
            .map(String::as_str)
            .chain(self.rules.iter().map(|r| r.pattern.as_str()))
    }
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            critical: PatternTierConfig::builtin(2, DEFAULT_CRITICAL_PATTERNS),
            dangerous: PatternTierConfig::builtin(1, DEFAULT_DANGEROUS_PATTERNS),
            caution: PatternTierConfig::builtin(0, DEFAULT_CAUTION_PATTERNS),
            safe: PatternTierConfig::builtin(0, DEFAULT_SAFE_PATTERNS),
        }
    }
}

// Patterns see a normalized segment: wrappers stripped, quotes removed,
// path arguments resolved to absolute form, tokens joined by single spaces.

const DEFAULT_CRITICAL_PATTERNS: &[&str] = &[
    // Recursive delete of the root, home, or a system tree.
    r"^rm\s+(?:\S+\s+)*?(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:\S+\s+)*?(?:/\*?|~\S*|/(?:etc|usr|boot|bin|sbin|lib|lib32|lib64|root|sys|proc|dev)(?:/\S*)?|/(?:var|home|opt|srv|mnt)(?:/[^/\s]+)?/?)(?:\s|$)",
    r"DROP\s+(?:DATABASE|SCHEMA)",
    r"TRUNCATE\s+TABLE",
    r#"DELETE\s+FROM\s+[\w.`"\[\]]+\s*(?:;|$|--|/\*)"#,
    r"^terraform\s+destroy\s*$",
    r"^terraform\s+destroy\s+-auto-approve\s*$",
    r"^terraform\s+destroy\s+[^-\s]",
    r"^kubectl\s+delete\s+(?:\S+\s+)*?(?:node|nodes|namespace|namespaces|ns|pv|pvc|persistentvolume|persistentvolumes|persistentvolumeclaim|persistentvolumeclaims)(?:\s|/|$)",
    r"^helm\s+uninstall\s.*--all",
    r"^docker\s+system\s+prune\s+(?:\S+\s+)*?(?:-a|--all)(?:\s|$)",
    // Force-push to a protected branch, either argument order.
    r"^git\s+push\s+(?:\S+\s+)*?(?:--force\S*|-f)\s+(?:\S+\s+)*?\+?(?:main|master|production|prod|release\S*)(?:\s|$)",
    r"^git\s+push\s+(?:\S+\s+)*?\+?(?:main|master|production|prod|release\S*)\s+(?:\S+\s+)*?(?:--force\S*|-f)(?:\s|$)",
    r"^git\s+push\s+(?:\S+\s+)*?\+(?:main|master|production|prod)(?:\s|$)",
    r"^aws\s+.*terminate-instances",
    r"^aws\s+s3\s+rb\s",
    r"^aws\s+rds\s+delete-db-(?:instance|cluster)",
    r"^gcloud\s+.*delete.*--quiet",
    r"^gcloud\s+projects\s+delete",
    r"^dd\s+.*of=/dev/",
    r"^mkfs(?:\.\S+)?\s",
];

const DEFAULT_DANGEROUS_PATTERNS: &[&str] = &[
    r"^rm\s+(?:\S+\s+)*?(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)(?:\s|$)",
    r"^git\s+reset\s+(?:\S+\s+)*?--hard(?:\s|$)",
    r"^git\s+clean\s+(?:\S+\s+)*?-[a-zA-Z]*f",
    r"^git\s+push\s+(?:\S+\s+)*?(?:--force\S*|-f)(?:\s|$)",
    r"^git\s+rebase(?:\s|$)",
    r"^git\s+filter-(?:branch|repo)(?:\s|$)",
    r"^git\s+checkout\s+(?:\S+\s+)*?(?:--force|-f|--)(?:\s|$)",
    r"^git\s+restore(?:\s|$)",
    r"^kubectl\s+delete\s+(?:\S+\s+)*?(?:deployment|deployments|deploy|statefulset|statefulsets|sts|daemonset|daemonsets|ds|service|services|svc|configmap|configmaps|cm|secret|secrets|ingress|ingresses|ing|job|jobs|cronjob|cronjobs|replicaset|replicasets|rs)(?:\s|/|$)",
    r"^kubectl\s+delete\s+(?:\S+\s+)*?(?:-f|--filename|--all)(?:\s|=|$)",
    r"^helm\s+(?:uninstall|delete)\s",
    r"^docker\s+(?:rm|rmi)\s",
    r"^docker\s+(?:container|image|volume|network)\s+(?:rm|prune)(?:\s|$)",
    r"^terraform\s+destroy(?:\s|$)",
    r"^terraform\s+state\s+rm\s",
    r"DROP\s+TABLE",
    r"DELETE\s+FROM\s.*WHERE",
    r"ALTER\s+TABLE\s+\S+\s+DROP\s",
    r"^chmod\s+(?:\S+\s+)*?-R",
    r"^chown\s+(?:\S+\s+)*?-R",
    r"^find\s.*\s-delete(?:\s|$)",
    r"^shred\s",
];

const DEFAULT_CAUTION_PATTERNS: &[&str] = &[
    r"^rm\s",
    r"^git\s+stash\s+(?:drop|clear)(?:\s|$)",
    r"^git\s+branch\s+(?:\S+\s+)*?-D(?:\s|$)",
    r"^npm\s+(?:uninstall|remove|rm|un)\s",
    r"^yarn\s+remove\s",
    r"^pip3?\s+uninstall\s",
    r"^cargo\s+(?:remove|uninstall)\s",
    r"^brew\s+uninstall\s",
    r"^apt(?:-get)?\s+(?:remove|purge)\s",
];

const DEFAULT_SAFE_PATTERNS: &[&str] = &[
    r"^git\s+stash(?:\s+(?:push|save|list|show|apply))?(?:\s|$)",
    r"^git\s+branch\s+-d\s",
    r"^kubectl\s+delete\s+(?:pod|pods|po)(?:\s|/)",
    r"^npm\s+cache\s+clean(?:\s|$)",
    r"^cargo\s+clean(?:\s|$)",
    r"^go\s+clean(?:\s|$)",
    r"^make\s+clean$",
];

// ── Rollback ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Capture rollback points before clearing dangerous/critical commands.
    /// When disabled those commands can never be cleared.
    pub enabled: bool,
    /// Where rollback points live. Default: `<project>/.slb/rollback`.
    pub base_dir: Option<PathBuf>,
    /// Largest filesystem capture allowed, in MiB. 0 = unlimited.
    pub max_size_mb: u64,
    /// Rollback points older than this are removed on the next capture. 0 = keep forever.
    pub retention_days: u64,
    /// Timeout for each external command (git) run during capture/restore.
    pub command_timeout_secs: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: None,
            max_size_mb: 100,
            retention_days: 30,
            command_timeout_secs: 30,
        }
    }
}

// ── Agents ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Agent names (case-insensitive) that may not open requests.
    pub blocked: Vec<String>,
}

impl AgentsConfig {
    pub fn is_blocked(&self, agent_name: &str) -> bool {
        self.blocked.iter().any(|b| b.eq_ignore_ascii_case(agent_name))
    }
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".slb")
                .join("state.db"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl SlbConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Approval thresholds ───
        let p = &self.patterns;
        if p.dangerous.min_approvals == 0 {
            warnings.push(ConfigWarning {
                field: "patterns.dangerous.min_approvals".into(),
                message: "dangerous commands would never block".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to at least 1".into()),
            });
        }
        if p.critical.min_approvals < p.dangerous.min_approvals.max(1) {
            warnings.push(ConfigWarning {
                field: "patterns.critical.min_approvals".into(),
                message: format!(
                    "critical threshold {} is below the dangerous threshold {}",
                    p.critical.min_approvals, p.dangerous.min_approvals
                ),
                severity: WarningSeverity::Error,
                hint: Some("Critical must require at least as many approvals as dangerous".into()),
            });
        }
        if p.caution.min_approvals > 0 {
            warnings.push(ConfigWarning {
                field: "patterns.caution.min_approvals".into(),
                message: "caution commands are tracked but never block; the threshold is ignored".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Pattern syntax ───
        let tiers = [
            ("critical", &p.critical),
            ("dangerous", &p.dangerous),
            ("caution", &p.caution),
            ("safe", &p.safe),
        ];
        for (name, tier) in tiers {
            for pattern in tier.all_patterns() {
                if let Err(e) = regex::Regex::new(pattern) {
                    warnings.push(ConfigWarning {
                        field: format!("patterns.{}", name),
                        message: format!("invalid pattern '{}': {}", pattern, e),
                        severity: WarningSeverity::Error,
                        hint: None,
                    });
                }
            }
        }
        for pattern in &self.general.redact_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                warnings.push(ConfigWarning {
                    field: "general.redact_patterns".into(),
                    message: format!("invalid pattern '{}': {}", pattern, e),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }

        // ── Timeouts ───
        if self.general.request_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "general.request_timeout_secs".into(),
                message: "requests would expire immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Default is 1800 (30 minutes)".into()),
            });
        }
        if self.sessions.stale_threshold_secs == 0 {
            warnings.push(ConfigWarning {
                field: "sessions.stale_threshold_secs".into(),
                message: "every session would be stale immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Default is 1800 (30 minutes)".into()),
            });
        }
        if self.rollback.command_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "rollback.command_timeout_secs".into(),
                message: "git commands would time out immediately".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Rollback ───
        if !self.rollback.enabled {
            warnings.push(ConfigWarning {
                field: "rollback.enabled".into(),
                message: "rollback capture is disabled; dangerous and critical commands can never be cleared".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if self.rollback.max_size_mb == 0 {
            warnings.push(ConfigWarning {
                field: "rollback.max_size_mb".into(),
                message: "filesystem captures are unbounded".into(),
                severity: WarningSeverity::Info,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
