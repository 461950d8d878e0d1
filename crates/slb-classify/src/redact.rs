//! Masking of secrets in the command text shown to reviewers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

use slb_core::{Result, SlbError};

const REDACTED: &str = "[REDACTED]";

static DEFAULT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // key=value / key: value credentials
        r#"(?i)(api[_-]?key|apikey|token|secret|password|passwd|pwd)\s*[=:]\s*['"]?[^\s'"]+['"]?"#,
        r#"(?i)aws[_-]?(access[_-]?key|secret[_-]?key|session[_-]?token)\s*[=:]\s*['"]?[^\s'"]+['"]?"#,
        r#"(?i)export\s+(API_KEY|SECRET|TOKEN|PASSWORD|AWS_ACCESS_KEY_ID|AWS_SECRET_ACCESS_KEY|DATABASE_URL)\s*=\s*['"]?[^\s'"]+['"]?"#,
        // credentials embedded in connection strings
        r"(?i)(postgres|postgresql|mysql|mongodb|mongodb\+srv|redis|amqp)://[^@\s]+@",
        r"(?i)bearer\s+[a-zA-Z0-9._-]+",
        r"(?i)-----BEGIN\s+[A-Z ]*PRIVATE\s+KEY-----",
        r"sk-ant-[a-zA-Z0-9_-]{20,}",
        r"gh[pousr]_[A-Za-z0-9_]{36,}",
        r"AKIA[A-Z0-9]{16}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// A command with secrets masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub display: String,
    pub contains_sensitive: bool,
}

/// Replaces secrets with `[REDACTED]` using the built-in patterns plus any
/// configured extras.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    custom: Vec<Regex>,
}

impl Redactor {
    pub fn new(custom_patterns: &[String]) -> Result<Self> {
        let custom = custom_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| SlbError::ConfigValidation {
                    field: "general.redact_patterns".into(),
                    reason: format!("invalid pattern '{}': {}", p, e),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { custom })
    }

    pub fn redact_str<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut result = Cow::Borrowed(input);
        for re in DEFAULT_PATTERNS.iter().chain(self.custom.iter()) {
            if re.is_match(&result) {
                result = Cow::Owned(re.replace_all(&result, REDACTED).into_owned());
            }
        }
        result
    }

    pub fn redact(&self, command: &str) -> Redacted {
        let display = self.redact_str(command);
        let contains_sensitive = matches!(display, Cow::Owned(_));
        Redacted {
            display: display.into_owned(),
            contains_sensitive,
        }
    }
}
