use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use slb_config::{PatternTierConfig, PatternsConfig};
use slb_core::{Result, RiskTier, SlbError};

use crate::normalize::normalize;

/// Outcome of classifying one command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub tier: RiskTier,
    pub min_approvals: u32,
    pub needs_approval: bool,
    /// Source text of the rule that decided the tier.
    pub matched_pattern: Option<String>,
    pub normalized_command: String,
    /// Normalized segments, one per top-level command.
    pub segments: Vec<String>,
}

/// A compiled rule.
#[derive(Debug)]
struct Rule {
    regex: Regex,
    min_approvals: u32,
}

#[derive(Debug)]
struct TierRules {
    tier: RiskTier,
    rules: Vec<Rule>,
}

/// Best match for a single segment.
#[derive(Debug, Clone, Copy)]
struct SegmentMatch<'a> {
    tier: RiskTier,
    min_approvals: u32,
    pattern: Option<&'a str>,
}

impl SegmentMatch<'_> {
    fn outranks(&self, other: &Self) -> bool {
        (self.tier, self.min_approvals) > (other.tier, other.min_approvals)
    }
}

/// Ordered, immutable rule table. Tiers are checked most severe first and
/// the first tier with any matching rule decides.
#[derive(Debug)]
pub struct PatternEngine {
    tiers: Vec<TierRules>,
}

static BUILTIN: OnceCell<PatternEngine> = OnceCell::new();

impl PatternEngine {
    /// Compile the rule table from config.
    pub fn from_config(config: &PatternsConfig) -> Result<Self> {
        let tiers = vec![
            compile_tier(RiskTier::Critical, &config.critical)?,
            compile_tier(RiskTier::Dangerous, &config.dangerous)?,
            compile_tier(RiskTier::Caution, &config.caution)?,
            compile_tier(RiskTier::Safe, &config.safe)?,
        ];
        let count: usize = tiers.iter().map(|t| t.rules.len()).sum();
        debug!(rules = count, "pattern engine compiled");
        Ok(Self { tiers })
    }

    /// The engine built from the default rule lists, compiled once per process.
    pub fn builtin() -> Result<&'static PatternEngine> {
        BUILTIN.get_or_try_init(|| Self::from_config(&PatternsConfig::default()))
    }

    /// Number of compiled rules across all tiers.
    pub fn rule_count(&self) -> usize {
        self.tiers.iter().map(|t| t.rules.len()).sum()
    }

    /// Classify `command` as run from `cwd`. Pure; no filesystem access.
    ///
    /// Compound commands are classified per segment and the most severe
    /// segment wins; ties go to the larger approval count.
    pub fn classify(&self, command: &str, cwd: &Path) -> ClassificationResult {
        let normalized = normalize(command, cwd);

        let mut best = SegmentMatch {
            tier: RiskTier::Unclassified,
            min_approvals: 0,
            pattern: None,
        };
        for segment in &normalized.segments {
            let m = self.classify_segment(segment);
            if m.outranks(&best) {
                best = m;
            }
        }

        ClassificationResult {
            tier: best.tier,
            min_approvals: best.min_approvals,
            needs_approval: best.tier.needs_approval(),
            matched_pattern: best.pattern.map(str::to_string),
            normalized_command: normalized.joined(),
            segments: normalized.segments,
        }
    }

    fn classify_segment(&self, segment: &str) -> SegmentMatch<'_> {
        for tier in &self.tiers {
            let mut found: Option<&Rule> = None;
            for rule in tier.rules.iter().filter(|r| r.regex.is_match(segment)) {
                if found.is_none_or(|f| rule.min_approvals > f.min_approvals) {
                    found = Some(rule);
                }
            }
            if let Some(rule) = found {
                return SegmentMatch {
                    tier: tier.tier,
                    min_approvals: rule.min_approvals,
                    pattern: Some(rule.regex.as_str()),
                };
            }
        }
        SegmentMatch {
            tier: RiskTier::Unclassified,
            min_approvals: 0,
            pattern: None,
        }
    }
}

fn compile_tier(tier: RiskTier, config: &PatternTierConfig) -> Result<TierRules> {
    let compile = |pattern: &str, min_approvals: u32| {
        Regex::new(pattern)
            .map(|regex| Rule {
                regex,
                min_approvals,
            })
            .map_err(|e| SlbError::ConfigValidation {
                field: format!("patterns.{}", tier),
                reason: format!("invalid pattern '{}': {}", pattern, e),
            })
    };

    let mut rules = Vec::with_capacity(config.patterns.len() + config.rules.len());
    for pattern in &config.patterns {
        rules.push(compile(pattern, config.min_approvals)?);
    }
    for rule in &config.rules {
        rules.push(compile(
            &rule.pattern,
            rule.min_approvals.unwrap_or(config.min_approvals),
        )?);
    }
    Ok(TierRules { tier, rules })
}
