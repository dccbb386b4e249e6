//! Deterministic rule-based extractor.
//!
//! Used whenever the completion provider is unavailable, slow, or returns
//! something unusable. Pure and total over its grammar: every input yields
//! either a complete [`SpecDraft`] or a [`HeuristicError`].
//!
//! Accepted phrasings (case-insensitive, backticks optional):
//! - `change|set|update|lower|raise|... <symbol> from <old> to <new>`
//! - `set|change|... <symbol> to <new>` and `set CONFIG['key'] to <new>`
//! - `add import <statement> [to <file>]`
//! - `update docstring of <symbol> to "<text>"`
//!
//! Optional clauses: `in file <path>` / `in <path.py>`, `in class <Name>`,
//! `bounds [a, b]` / `between a and b`, and a trailing `because ...` rationale.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::SpecDraft;
use crate::spec::{ChangeKind, ScalarValue, ValidationRules, ValueType, MODULE_SYMBOL};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("heuristic extractor: {0}")]
pub struct HeuristicError(pub String);

static DOCSTRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:set|update|change|replace|rewrite)\s+(?:the\s+)?docstring\s+(?:of|for|on)\s+(?:the\s+)?(?:class\s+|function\s+|method\s+|module\s+)?`?(?P<symbol>[A-Za-z_<][A-Za-z0-9_.>]*)`?\s+to\s+(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#,
    )
    .expect("docstring regex")
});

static IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\badd\s+(?:an?\s+|the\s+)?import\s+(?:of\s+|for\s+)?`?(?P<stmt>[^`]+?)`?(?:\s+(?:to|in|into)\s+(?:the\s+)?(?:file\s+)?`?(?P<file>[^\s`]+?)`?)?\s*\.?\s*$",
    )
    .expect("import regex")
});

static VALUE_CHANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:change|set|update|adjust|lower|raise|increase|decrease|reduce|modify|bump)\s+(?:the\s+)?(?:value\s+of\s+)?`?(?P<symbol>[A-Za-z_][A-Za-z0-9_.]*)(?:\[\s*['"](?P<key>[^'"\]]+)['"]\s*\])?`?(?:\s+(?:parameter|attribute|field|constant|setting|value|default))?(?:\s+from\s+(?P<old>`[^`]*`|'[^']*'|"[^"]*"|\S+))?\s+to\s+(?P<new>`[^`]*`|'[^']*'|"[^"]*"|\S+)"#,
    )
    .expect("value change regex")
});

static FILE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:in|of|inside|within)\s+(?:the\s+)?file\s+`?(?P<file>[^\s`,;]+)`?")
        .expect("file clause regex")
});

static FILE_BARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:in|of|inside|within)\s+`?(?P<file>[^\s`,;]*(?:/[^\s`,;]*|\.py))`?")
        .expect("bare file regex")
});

static CLASS_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:in|of|on|for)\s+(?:the\s+)?(?:class\s+`?(?P<a>[A-Za-z_][A-Za-z0-9_]*)`?|`?(?P<b>[A-Za-z_][A-Za-z0-9_]*)`?\s+class\b)",
    )
    .expect("class clause regex")
});

static BOUNDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bbounds?\s*(?:of\s+)?[\[(]\s*(?P<min>[-+]?[0-9][0-9_.]*(?:e[-+]?[0-9]+)?)\s*,\s*(?P<max>[-+]?[0-9][0-9_.]*(?:e[-+]?[0-9]+)?)\s*[\])]",
    )
    .expect("bounds regex")
});

static BETWEEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbetween\s+(?P<min>[-+]?[0-9][0-9_.]*)\s+and\s+(?P<max>[-+]?[0-9][0-9_.]*)")
        .expect("between regex")
});

static RATIONALE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\s,;]+(?:because|so that|in order to)\s+(?P<why>.+)$")
        .expect("rationale regex")
});

/// Extract a draft specification from free-form proposal text.
pub fn extract(text: &str) -> Result<SpecDraft, HeuristicError> {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return Err(HeuristicError("proposal is empty".into()));
    }

    if let Some(caps) = DOCSTRING.captures(&flat) {
        return Ok(docstring_draft(&caps, &flat));
    }

    let (core, rationale) = match RATIONALE.captures(&flat) {
        Some(caps) => {
            let start = caps.get(0).map_or(flat.len(), |m| m.start());
            (&flat[..start], caps["why"].trim_end_matches('.').to_string())
        }
        None => (flat.as_str(), flat.clone()),
    };

    if let Some(caps) = IMPORT.captures(core) {
        return Ok(import_draft(&caps, core, rationale));
    }

    if let Some(caps) = VALUE_CHANGE.captures(core) {
        return value_draft(&caps, core, rationale);
    }

    Err(HeuristicError(format!("no recognised change phrasing in '{flat}'")))
}

fn docstring_draft(caps: &Captures<'_>, flat: &str) -> SpecDraft {
    let raw_symbol = clean_symbol(&caps["symbol"]);
    let docstring = caps
        .name("dq")
        .or_else(|| caps.name("sq"))
        .map_or("", |m| m.as_str())
        .to_string();
    let target_symbol = if raw_symbol.eq_ignore_ascii_case("module") || raw_symbol == MODULE_SYMBOL {
        MODULE_SYMBOL.to_string()
    } else {
        qualify(raw_symbol, class_clause(flat))
    };
    SpecDraft {
        target_file: file_clause(flat),
        target_symbol,
        change: ChangeKind::DocstringUpdate { docstring },
        rationale: Some(flat.to_string()),
        validation_rules: None,
    }
}

fn import_draft(caps: &Captures<'_>, core: &str, rationale: String) -> SpecDraft {
    let stmt = caps["stmt"].trim().trim_matches('`');
    let lower = stmt.to_ascii_lowercase();
    let statement = if lower.starts_with("import ") || lower.starts_with("from ") {
        stmt.to_string()
    } else {
        format!("import {stmt}")
    };
    let target_file = caps
        .name("file")
        .map(|m| PathBuf::from(m.as_str().trim_end_matches('.')))
        .or_else(|| file_clause(core));
    SpecDraft {
        target_file,
        target_symbol: MODULE_SYMBOL.to_string(),
        change: ChangeKind::ImportAddition { statement },
        rationale: Some(rationale),
        validation_rules: None,
    }
}

fn value_draft(caps: &Captures<'_>, core: &str, rationale: String) -> Result<SpecDraft, HeuristicError> {
    let symbol = clean_symbol(&caps["symbol"]);
    if symbol.is_empty() {
        return Err(HeuristicError("no target symbol".into()));
    }
    let old = caps.name("old").map(|m| ScalarValue::from_token(&clean_token(m.as_str())));
    let new = ScalarValue::from_token(&clean_token(&caps["new"]));
    let (value_type, old_value, new_value) = declared_types(old, new);

    let target_symbol = qualify(symbol, class_clause(core));
    let change = match caps.name("key") {
        Some(key) => ChangeKind::ConfigUpdate {
            key: key.as_str().to_string(),
            value_type,
            old_value,
            new_value,
        },
        None => ChangeKind::ParameterChange { value_type, old_value, new_value },
    };

    Ok(SpecDraft {
        target_file: file_clause(core),
        target_symbol,
        change,
        rationale: Some(rationale),
        validation_rules: bounds_clause(core),
    })
}

/// Declared type for an `(old, new)` pair: a float on either side of a
/// numeric pair makes both floats.
fn declared_types(
    old: Option<ScalarValue>,
    new: ScalarValue,
) -> (ValueType, Option<ScalarValue>, ScalarValue) {
    let numeric = new.as_f64().is_some() && old.as_ref().map_or(true, |o| o.as_f64().is_some());
    let any_float = matches!(new, ScalarValue::Float(_)) || matches!(old, Some(ScalarValue::Float(_)));
    let declared = if numeric && any_float { ValueType::Float } else { new.value_type() };
    (declared, old.map(|o| o.coerce_to(declared)), new.coerce_to(declared))
}

fn file_clause(text: &str) -> Option<PathBuf> {
    FILE_CLAUSE
        .captures(text)
        .or_else(|| FILE_BARE.captures(text))
        .map(|c| PathBuf::from(c["file"].trim_end_matches(['.', ')'])))
}

fn class_clause(text: &str) -> Option<&str> {
    let caps = CLASS_CLAUSE.captures(text)?;
    caps.name("a").or_else(|| caps.name("b")).map(|m| m.as_str())
}

fn bounds_clause(text: &str) -> Option<ValidationRules> {
    let caps = BOUNDS.captures(text).or_else(|| BETWEEN.captures(text))?;
    let min = caps["min"].replace('_', "").trim_end_matches('.').parse::<f64>().ok()?;
    let max = caps["max"].replace('_', "").trim_end_matches('.').parse::<f64>().ok()?;
    Some(ValidationRules::bounds(min, max))
}

fn qualify(symbol: &str, class: Option<&str>) -> String {
    match class {
        Some(class) if !symbol.contains('.') && symbol != class => format!("{class}.{symbol}"),
        _ => symbol.to_string(),
    }
}

fn clean_symbol(raw: &str) -> &str {
    raw.trim_matches('`').trim_end_matches('.')
}

/// Strip backticks and sentence punctuation from a value token; quoted
/// strings are left intact for [`ScalarValue::from_token`].
fn clean_token(raw: &str) -> String {
    let t = raw.trim().trim_matches('`');
    let quoted = t.len() >= 2 && (t.starts_with('"') || t.starts_with('\''));
    if quoted {
        return t.to_string();
    }
    let trimmed = t.trim_end_matches([',', ';', ':', ')', '!']);
    match trimmed.strip_suffix('.') {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scalar(change: &ChangeKind) -> (ValueType, Option<ScalarValue>, ScalarValue) {
        let (t, old, new) = change.scalar_payload().expect("scalar change");
        (t, old.cloned(), new.clone())
    }

    #[rstest]
    #[case("change `confidence_threshold` from 0.70 to 0.65", "confidence_threshold", Some(0.70), 0.65)]
    #[case("Change confidence_threshold from 0.70 to 0.65.", "confidence_threshold", Some(0.70), 0.65)]
    #[case("lower the confidence_threshold parameter from 0.7 to 0.6", "confidence_threshold", Some(0.7), 0.6)]
    #[case("set min_score to 0.25", "min_score", None, 0.25)]
    #[case("update window from 20 to 1.5", "window", Some(20.0), 1.5)]
    fn test_float_value_changes(
        #[case] text: &str,
        #[case] symbol: &str,
        #[case] old: Option<f64>,
        #[case] new: f64,
    ) {
        let draft = extract(text).unwrap();
        assert_eq!(draft.target_symbol, symbol);
        let (t, old_value, new_value) = scalar(&draft.change);
        assert_eq!(t, ValueType::Float);
        assert_eq!(old_value, old.map(ScalarValue::Float));
        assert_eq!(new_value, ScalarValue::Float(new));
    }

    #[rstest]
    #[case("set max_positions to 8", ScalarValue::Int(8), ValueType::Int)]
    #[case("set debug to True", ScalarValue::Bool(true), ValueType::Bool)]
    #[case("set mode to 'fast'", ScalarValue::Str("fast".into()), ValueType::Str)]
    fn test_scalar_types(#[case] text: &str, #[case] expected: ScalarValue, #[case] t: ValueType) {
        let draft = extract(text).unwrap();
        let (declared, _, new_value) = scalar(&draft.change);
        assert_eq!(declared, t);
        assert_eq!(new_value, expected);
    }

    #[test]
    fn test_file_and_class_clauses() {
        let draft = extract(
            "change confidence_threshold from 0.70 to 0.65 in class SignalDetector in file src/detectors.py",
        )
        .unwrap();
        assert_eq!(draft.target_symbol, "SignalDetector.confidence_threshold");
        assert_eq!(draft.target_file, Some(PathBuf::from("src/detectors.py")));
    }

    #[test]
    fn test_bare_python_path_and_bounds() {
        let draft = extract(
            "change SignalDetector.confidence_threshold from 0.70 to 0.65 in detectors.py with bounds [0.5, 0.9]",
        )
        .unwrap();
        assert_eq!(draft.target_file, Some(PathBuf::from("detectors.py")));
        assert_eq!(draft.validation_rules, Some(ValidationRules::bounds(0.5, 0.9)));
    }

    #[test]
    fn test_between_bounds_and_rationale() {
        let draft = extract(
            "set threshold to 0.6, keeping it between 0.5 and 0.9, because recall dropped last week",
        )
        .unwrap();
        assert_eq!(draft.validation_rules, Some(ValidationRules::bounds(0.5, 0.9)));
        assert_eq!(draft.rationale.as_deref(), Some("recall dropped last week"));
    }

    #[test]
    fn test_config_key_update() {
        let draft = extract("set RISK_LIMITS['max_drawdown'] to 0.15 in file risk/limits.py").unwrap();
        assert_eq!(draft.target_symbol, "RISK_LIMITS");
        match draft.change {
            ChangeKind::ConfigUpdate { key, new_value, .. } => {
                assert_eq!(key, "max_drawdown");
                assert_eq!(new_value, ScalarValue::Float(0.15));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[rstest]
    #[case("add import math to src/detectors.py", "import math", Some("src/detectors.py"))]
    #[case("add import `from typing import Optional`", "from typing import Optional", None)]
    #[case("Add an import numpy as np", "import numpy as np", None)]
    fn test_import_additions(#[case] text: &str, #[case] stmt: &str, #[case] file: Option<&str>) {
        let draft = extract(text).unwrap();
        assert_eq!(draft.target_symbol, MODULE_SYMBOL);
        assert_eq!(draft.change, ChangeKind::ImportAddition { statement: stmt.into() });
        assert_eq!(draft.target_file, file.map(PathBuf::from));
    }

    #[test]
    fn test_docstring_update() {
        let draft = extract("update the docstring of SignalDetector to \"Detects entries.\"").unwrap();
        assert_eq!(draft.target_symbol, "SignalDetector");
        assert_eq!(draft.change, ChangeKind::DocstringUpdate { docstring: "Detects entries.".into() });

        let module = extract("set docstring of module to 'Signal helpers.' in file a.py").unwrap();
        assert_eq!(module.target_symbol, MODULE_SYMBOL);
        assert_eq!(module.target_file, Some(PathBuf::from("a.py")));
    }

    #[rstest]
    #[case("")]
    #[case("please make the detector better")]
    #[case("refactor everything")]
    fn test_unrecognised_phrasing_is_error(#[case] text: &str) {
        assert!(extract(text).is_err());
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let text = "change confidence_threshold from 0.70 to 0.65 in class SignalDetector";
        assert_eq!(extract(text).unwrap(), extract(text).unwrap());
    }
}
