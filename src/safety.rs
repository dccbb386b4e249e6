//! # Stage: Safety Validator
//!
//! ## Responsibility
//! Score how risky a candidate source is relative to the original, for one
//! specification. Risk accumulates additively and is capped at 1.0:
//!
//! | Check | Effect |
//! |---|---|
//! | candidate does not parse | risk = 1.0, no further checks |
//! | imports differ from what the change implies | +0.2 |
//! | declared type vs. new value / literal on disk | +0.3 |
//! | numeric relative change above the magnitude threshold | +0.1 |
//! | target under a sensitive path | +0.1 |
//!
//! ## Guarantees
//! - Pure: the result depends only on `(spec, original, candidate)` and the
//!   configuration the validator was built with
//! - Bounded: `risk_score` is always within `[0, 1]`
//!
//! ## NOT Responsible For
//! - Acting on the verdict (see the mutator and orchestrator)

use std::path::{Component, Path};

use serde::Serialize;

use crate::config::SafetyConfig;
use crate::lang::{AdapterRegistry, LanguageAdapter};
use crate::spec::{ChangeKind, ScalarValue, Specification};

const SYNTAX_RISK: f64 = 1.0;
const IMPORT_RISK: f64 = 0.2;
const TYPE_RISK: f64 = 0.3;
const MAGNITUDE_RISK: f64 = 0.1;
const SENSITIVE_PATH_RISK: f64 = 0.1;

// ---------------------------------------------------------------------------
// RiskAssessment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub syntax_valid: bool,
    pub imports_unchanged: bool,
    pub type_consistent: bool,
    pub risk_score: f64,
    pub warnings: Vec<String>,
}

impl RiskAssessment {
    fn unparsable(warning: String) -> Self {
        Self {
            syntax_valid: false,
            imports_unchanged: false,
            type_consistent: false,
            risk_score: SYNTAX_RISK,
            warnings: vec![warning],
        }
    }

    pub fn is_high_risk(&self, threshold: f64) -> bool {
        self.risk_score >= threshold
    }
}

impl std::fmt::Display for RiskAssessment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "risk={:.2} syntax={} imports_unchanged={} type_consistent={}",
            self.risk_score, self.syntax_valid, self.imports_unchanged, self.type_consistent
        )
    }
}

// ---------------------------------------------------------------------------
// SafetyValidator
// ---------------------------------------------------------------------------

pub struct SafetyValidator {
    config: SafetyConfig,
    adapters: AdapterRegistry,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig, adapters: AdapterRegistry) -> Self {
        Self { config, adapters }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Threshold at or above which a change needs an explicit override.
    pub fn high_risk_threshold(&self) -> f64 {
        self.config.high_risk_threshold
    }

    pub fn assess(&self, spec: &Specification, original: &str, candidate: &str) -> RiskAssessment {
        let Some(adapter) = self.adapters.for_path(spec.target_file()) else {
            return RiskAssessment::unparsable(format!(
                "no language adapter for {}",
                spec.target_file().display()
            ));
        };
        let adapter = adapter.as_ref();

        if let Err(issue) = adapter.check_syntax(candidate) {
            return RiskAssessment::unparsable(format!("candidate does not parse at {issue}"));
        }

        let mut risk = 0.0;
        let mut warnings = Vec::new();

        let imports_unchanged = imports_as_expected(adapter, spec.change(), original, candidate);
        if !imports_unchanged {
            risk += IMPORT_RISK;
            warnings.push("import declarations changed unexpectedly".to_string());
        }

        let type_consistent = match type_mismatch(adapter, spec, original, candidate) {
            Some(warning) => {
                risk += TYPE_RISK;
                warnings.push(warning);
                false
            }
            None => true,
        };

        if let Some(relative) = relative_change(adapter, spec, original) {
            if relative > self.config.magnitude_threshold {
                risk += MAGNITUDE_RISK;
                warnings.push(format!(
                    "value changes by {:.0}% (threshold {:.0}%)",
                    relative * 100.0,
                    self.config.magnitude_threshold * 100.0
                ));
            }
        }

        if let Some(hit) = self
            .config
            .sensitive_paths
            .iter()
            .find(|p| under_sensitive_path(spec.target_file(), p))
        {
            risk += SENSITIVE_PATH_RISK;
            warnings.push(format!("target is under sensitive path '{hit}'"));
        }

        let assessment = RiskAssessment {
            syntax_valid: true,
            imports_unchanged,
            type_consistent,
            risk_score: f64::min(risk, 1.0),
            warnings,
        };
        tracing::debug!(
            target: "autopatch::safety",
            proposal_id = %spec.proposal_id(),
            risk_score = assessment.risk_score,
            warnings = assessment.warnings.len(),
            "assessed candidate"
        );
        assessment
    }
}

/// Candidate imports must equal the original ones, plus exactly the added
/// statement for an import change.
fn imports_as_expected(
    adapter: &dyn LanguageAdapter,
    change: &ChangeKind,
    original: &str,
    candidate: &str,
) -> bool {
    let (Ok(mut before), Ok(mut after)) = (adapter.imports(original), adapter.imports(candidate))
    else {
        return false;
    };
    if let ChangeKind::ImportAddition { statement } = change {
        before.push(statement.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    before.sort();
    after.sort();
    before == after
}

/// The declared type must accept the new value, the literal being replaced
/// and the literal written in its place.
fn type_mismatch(
    adapter: &dyn LanguageAdapter,
    spec: &Specification,
    original: &str,
    candidate: &str,
) -> Option<String> {
    let (declared, _, new_value) = spec.change().scalar_payload()?;
    if !declared.accepts(new_value.value_type()) {
        return Some(format!(
            "new value {new_value} is a {}, declared {declared}",
            new_value.value_type()
        ));
    }
    let key = config_key(spec.change());
    if let Some(current) = adapter
        .read_value(original, spec.target_symbol(), key)
        .and_then(|site| site.literal)
    {
        if !declared.accepts(current.value_type()) {
            return Some(format!(
                "replaces a {} literal ({current}) with a {declared}",
                current.value_type()
            ));
        }
    }
    let on_disk = adapter
        .read_value(candidate, spec.target_symbol(), key)
        .and_then(|site| site.literal)?;
    if !declared.accepts(on_disk.value_type()) {
        return Some(format!(
            "value written is a {}, declared {declared}",
            on_disk.value_type()
        ));
    }
    None
}

/// `|new - old| / |old|` for numeric scalar changes. The old value comes from
/// the specification, else from the literal currently in the original source.
fn relative_change(
    adapter: &dyn LanguageAdapter,
    spec: &Specification,
    original: &str,
) -> Option<f64> {
    let (_, old, new_value) = spec.change().scalar_payload()?;
    let new = new_value.as_f64()?;
    let old = match old.and_then(ScalarValue::as_f64) {
        Some(x) => x,
        None => adapter
            .read_value(original, spec.target_symbol(), config_key(spec.change()))
            .and_then(|site| site.literal)
            .and_then(|v| v.as_f64())?,
    };
    if old == 0.0 {
        return Some(if new == 0.0 { 0.0 } else { f64::INFINITY });
    }
    Some((new - old).abs() / old.abs())
}

/// Whole-component match: `risk` covers `src/risk/limits.py` and
/// `src/risk.py` but not `src/asterisk.py`. Multi-component entries such as
/// `core/execution` must appear as consecutive components.
fn under_sensitive_path(target: &Path, pattern: &str) -> bool {
    let wanted: Vec<String> = pattern
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_lowercase)
        .collect();
    if wanted.is_empty() {
        return false;
    }
    let components: Vec<String> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_lowercase()),
            _ => None,
        })
        .collect();
    let last = components.len().saturating_sub(1);
    components.windows(wanted.len()).enumerate().any(|(start, window)| {
        window.iter().zip(&wanted).enumerate().all(|(offset, (have, want))| {
            have == want
                || (start + offset == last
                    && Path::new(have).file_stem().map(|s| s.to_string_lossy() == want.as_str()).unwrap_or(false))
        })
    })
}

fn config_key(change: &ChangeKind) -> Option<&str> {
    match change {
        ChangeKind::ConfigUpdate { key, .. } => Some(key.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ValueType;

    const ORIGINAL: &str = "import math\n\nclass SignalDetector:\n    confidence_threshold = 0.70\n";

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SafetyConfig::default(), AdapterRegistry::with_defaults())
    }

    fn threshold_spec(file: &str, old: f64, new: ScalarValue) -> Specification {
        Specification::new(
            "p-1",
            file,
            "SignalDetector.confidence_threshold",
            ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: Some(ScalarValue::Float(old)),
                new_value: new,
            },
            "",
        )
    }

    #[test]
    fn test_small_change_is_low_risk() {
        let spec = threshold_spec("src/detectors.py", 0.70, ScalarValue::Float(0.65));
        let candidate = ORIGINAL.replace("0.70", "0.65");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!(a.syntax_valid && a.imports_unchanged && a.type_consistent);
        assert_eq!(a.risk_score, 0.0);
        assert!(!a.is_high_risk(0.5));
    }

    #[test]
    fn test_unparsable_candidate_is_maximal_risk() {
        let spec = threshold_spec("src/detectors.py", 0.70, ScalarValue::Float(0.65));
        let a = validator().assess(&spec, ORIGINAL, "class SignalDetector(:\n");
        assert!(!a.syntax_valid);
        assert_eq!(a.risk_score, 1.0);
        assert_eq!(a.warnings.len(), 1);
    }

    #[test]
    fn test_unexpected_import_change() {
        let spec = threshold_spec("src/detectors.py", 0.70, ScalarValue::Float(0.65));
        let candidate = ORIGINAL.replace("0.70", "0.65").replace("import math", "import os");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!(!a.imports_unchanged);
        assert!((a.risk_score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_expected_import_addition_is_not_penalized() {
        let spec = Specification::new(
            "p-1",
            "src/detectors.py",
            "<module>",
            ChangeKind::ImportAddition { statement: "import statistics".into() },
            "",
        );
        let candidate = ORIGINAL.replace("import math", "import math\nimport statistics");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!(a.imports_unchanged);
    }

    #[test]
    fn test_replacing_string_literal_with_float_is_type_inconsistent() {
        let original = "class Router:\n    label = \"fast\"\n";
        let spec = Specification::new(
            "p-1",
            "src/router.py",
            "Router.label",
            ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: None,
                new_value: ScalarValue::Float(0.5),
            },
            "",
        );
        assert!(spec.validate().is_ok());
        let candidate = original.replace("\"fast\"", "0.5");
        let a = validator().assess(&spec, original, &candidate);
        assert!(!a.type_consistent);
        assert!((a.risk_score - 0.3).abs() < 1e-9);
        assert!(a.warnings[0].contains("str"));
    }

    #[test]
    fn test_int_literal_replaced_by_float_is_consistent() {
        let original = "class Sizer:\n    ratio = 1\n";
        let spec = Specification::new(
            "p-1",
            "src/sizer.py",
            "Sizer.ratio",
            ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: None,
                new_value: ScalarValue::Float(1.2),
            },
            "",
        );
        let a = validator().assess(&spec, original, &original.replace("= 1", "= 1.2"));
        assert!(a.type_consistent);
    }

    #[test]
    fn test_sensitive_paths_match_whole_components() {
        assert!(under_sensitive_path(Path::new("src/risk/limits.py"), "risk"));
        assert!(under_sensitive_path(Path::new("src/risk.py"), "risk"));
        assert!(under_sensitive_path(Path::new("core/Execution/engine.py"), "execution"));
        assert!(under_sensitive_path(Path::new("app/core/execution/x.py"), "core/execution"));
        assert!(!under_sensitive_path(Path::new("src/asterisk.py"), "risk"));
        assert!(!under_sensitive_path(Path::new("src/risky/x.py"), "risk"));
        assert!(!under_sensitive_path(Path::new("execution_report.py"), "execution"));
        assert!(!under_sensitive_path(Path::new("src/x.py"), ""));
    }

    #[test]
    fn test_substring_of_sensitive_name_adds_no_risk() {
        let spec = threshold_spec("src/asterisk.py", 0.70, ScalarValue::Float(0.65));
        let a = validator().assess(&spec, ORIGINAL, &ORIGINAL.replace("0.70", "0.65"));
        assert_eq!(a.risk_score, 0.0);
    }

    #[test]
    fn test_large_magnitude_and_sensitive_path_each_add_risk() {
        let spec = threshold_spec("src/risk/limits.py", 0.70, ScalarValue::Float(0.10));
        let candidate = ORIGINAL.replace("0.70", "0.10");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!((a.risk_score - 0.2).abs() < 1e-9);
        assert_eq!(a.warnings.len(), 2);
    }

    #[test]
    fn test_magnitude_uses_literal_on_disk_without_old_value() {
        let spec = Specification::new(
            "p-1",
            "src/detectors.py",
            "SignalDetector.confidence_threshold",
            ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: None,
                new_value: ScalarValue::Float(2.0),
            },
            "",
        );
        let candidate = ORIGINAL.replace("0.70", "2.0");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!((a.risk_score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_risk_is_capped() {
        let spec = threshold_spec("src/execution/x.py", 0.70, ScalarValue::Str("high".into()));
        let candidate = ORIGINAL.replace("0.70", "\"high\"").replace("import math", "import os");
        let a = validator().assess(&spec, ORIGINAL, &candidate);
        assert!(a.risk_score <= 1.0);
        assert!(a.is_high_risk(0.5));
    }
}
