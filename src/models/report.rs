use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A failure rejects the configuration
    Error,
    /// Reported but never rejects (legitimate exceptions exist)
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

/// RuleOutcome is one itemized validation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub passed: bool,
    pub severity: Severity,
    pub detail: String,
}

impl RuleOutcome {
    pub fn pass(rule_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            passed: true,
            severity: Severity::Error,
            detail: detail.into(),
        }
    }

    pub fn fail(rule_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            passed: false,
            severity: Severity::Error,
            detail: detail.into(),
        }
    }

    pub fn warn(rule_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            passed: false,
            severity: Severity::Warning,
            detail: detail.into(),
        }
    }

    /// Pass when `problems` is empty, otherwise fail listing them
    pub fn from_problems(rule_id: impl Into<String>, ok_detail: impl Into<String>, problems: Vec<String>) -> Self {
        if problems.is_empty() {
            Self::pass(rule_id, ok_detail)
        } else {
            Self::fail(rule_id, problems.join("; "))
        }
    }

    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }
}

/// ValidationReport lists every rule result for one rendered configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationReport {
    items: Vec<RuleOutcome>,
}

impl ValidationReport {
    pub fn new(items: Vec<RuleOutcome>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[RuleOutcome] {
        &self.items
    }

    /// Accepted when no error-severity rule failed
    pub fn accepted(&self) -> bool {
        !self.items.iter().any(RuleOutcome::is_blocking)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.items.iter().filter(|i| i.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.items
            .iter()
            .filter(|i| !i.passed && i.severity == Severity::Warning)
    }

    pub fn get(&self, rule_id: &str) -> Option<&RuleOutcome> {
        self.items.iter().find(|i| i.rule_id == rule_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_reject() {
        let report = ValidationReport::new(vec![
            RuleOutcome::pass("a", "ok"),
            RuleOutcome::warn("b", "reserved host"),
        ]);
        assert!(report.accepted());
        assert_eq!(report.warnings().count(), 1);

        let report = ValidationReport::new(vec![RuleOutcome::fail("c", "bad")]);
        assert!(!report.accepted());
        assert_eq!(report.failures().next().map(|f| f.rule_id.as_str()), Some("c"));
    }

    #[test]
    fn test_report_serializes_as_list() {
        let report = ValidationReport::new(vec![RuleOutcome::pass("placeholders.resolved", "none")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json[0]["rule_id"], "placeholders.resolved");
        assert_eq!(json[0]["passed"], true);
        assert_eq!(json[0]["severity"], "error");
    }
}
