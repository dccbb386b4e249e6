//! # Stage: Specification model
//!
//! ## Responsibility
//! The unit of work flowing through the pipeline. A [`Specification`] names one
//! target file, one symbol inside it, and exactly one [`ChangeKind`] variant that
//! carries only the fields that kind needs.
//!
//! ## Guarantees
//! - Immutable: fields are private; the only "mutation" is
//!   [`Specification::with_proposal_id`], which returns a new value
//! - Pure validation: [`Specification::validate`] looks at nothing but the fields
//! - Lexical path confinement: absolute paths and `..` escapes are rejected
//!   without touching the filesystem
//!
//! ## NOT Responsible For
//! - Filesystem-level confinement (symlinks); see the mutator
//! - Deny-listed code fragments, which depend on configuration; see the parser

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{PipelineError, PipelineResult};

/// Symbol used to address a module-level docstring.
pub const MODULE_SYMBOL: &str = "<module>";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

// ---------------------------------------------------------------------------
// ValueType / ScalarValue
// ---------------------------------------------------------------------------

/// Declared type of a scalar attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Float,
    Int,
    Bool,
    Str,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueType::Float => write!(f, "float"),
            ValueType::Int => write!(f, "int"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Str => write!(f, "str"),
        }
    }
}

impl ValueType {
    /// Whether a value of type `actual` may be stored where `self` is declared.
    /// An integer literal is accepted for a float attribute.
    pub fn accepts(self, actual: ValueType) -> bool {
        self == actual || (self == ValueType::Float && actual == ValueType::Int)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "float" | "double" | "number" => Some(ValueType::Float),
            "int" | "integer" => Some(ValueType::Int),
            "bool" | "boolean" => Some(ValueType::Bool),
            "str" | "string" => Some(ValueType::Str),
            _ => None,
        }
    }
}

/// A scalar payload. Serialized untagged so JSON numbers, booleans and strings
/// map directly onto the matching variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ScalarValue::Bool(_) => ValueType::Bool,
            ScalarValue::Int(_) => ValueType::Int,
            ScalarValue::Float(_) => ValueType::Float,
            ScalarValue::Str(_) => ValueType::Str,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Interpret a bare token from free text: quoted → string, `true`/`false`
    /// → bool, digits → int, decimal → float, anything else → string.
    pub fn from_token(token: &str) -> Self {
        let t = token.trim().trim_end_matches([',', ';']);
        let quoted = t.len() >= 2
            && ((t.starts_with('"') && t.ends_with('"'))
                || (t.starts_with('\'') && t.ends_with('\''))
                || (t.starts_with('`') && t.ends_with('`')));
        if quoted {
            return ScalarValue::Str(t[1..t.len() - 1].to_string());
        }
        match t.to_ascii_lowercase().as_str() {
            "true" => return ScalarValue::Bool(true),
            "false" => return ScalarValue::Bool(false),
            _ => {}
        }
        let numeric = t.replace('_', "");
        if let Ok(i) = numeric.parse::<i64>() {
            return ScalarValue::Int(i);
        }
        if let Ok(x) = numeric.parse::<f64>() {
            if x.is_finite() {
                return ScalarValue::Float(x);
            }
        }
        ScalarValue::Str(t.to_string())
    }

    /// Equality that treats `Int(1)` and `Float(1.0)` as the same number.
    pub fn loosely_equals(&self, other: &ScalarValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0),
            _ => self == other,
        }
    }

    /// Coerce to `target` where lossless (int → float); otherwise unchanged.
    pub fn coerce_to(self, target: ValueType) -> Self {
        match (self, target) {
            (ScalarValue::Int(i), ValueType::Float) => ScalarValue::Float(i as f64),
            (v, _) => v,
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{b}"),
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Float(x) => write!(f, "{x}"),
            ScalarValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationRules
// ---------------------------------------------------------------------------

/// Optional post-mutation sanity bounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_type: Option<ValueType>,
}

impl ValidationRules {
    pub fn bounds(min: f64, max: f64) -> Self {
        Self { min: Some(min), max: Some(max), allowed_type: None }
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.allowed_type.is_none()
    }
}

// ---------------------------------------------------------------------------
// ChangeKind
// ---------------------------------------------------------------------------

/// One variant per supported change, each carrying exactly its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Replace a scalar attribute, module constant or parameter default.
    ParameterChange {
        value_type: ValueType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_value: Option<ScalarValue>,
        new_value: ScalarValue,
    },
    /// Append a method to the target class.
    MethodAddition { method_name: String, code: String },
    /// Replace the whole target class definition.
    ClassModification { code: String },
    /// Replace one key of a dict literal bound to the target name.
    ConfigUpdate {
        key: String,
        value_type: ValueType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_value: Option<ScalarValue>,
        new_value: ScalarValue,
    },
    /// Add one top-level import statement.
    ImportAddition { statement: String },
    /// Replace (or insert) the docstring of the target symbol.
    DocstringUpdate { docstring: String },
}

impl ChangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::ParameterChange { .. } => "parameter_change",
            ChangeKind::MethodAddition { .. } => "method_addition",
            ChangeKind::ClassModification { .. } => "class_modification",
            ChangeKind::ConfigUpdate { .. } => "config_update",
            ChangeKind::ImportAddition { .. } => "import_addition",
            ChangeKind::DocstringUpdate { .. } => "docstring_update",
        }
    }

    /// `(declared type, old, new)` for the scalar-valued kinds.
    pub fn scalar_payload(&self) -> Option<(ValueType, Option<&ScalarValue>, &ScalarValue)> {
        match self {
            ChangeKind::ParameterChange { value_type, old_value, new_value }
            | ChangeKind::ConfigUpdate { value_type, old_value, new_value, .. } => {
                Some((*value_type, old_value.as_ref(), new_value))
            }
            _ => None,
        }
    }

    /// Code introduced by the change, if any.
    pub fn code_fragment(&self) -> Option<&str> {
        match self {
            ChangeKind::MethodAddition { code, .. } | ChangeKind::ClassModification { code } => {
                Some(code)
            }
            ChangeKind::ImportAddition { statement } => Some(statement),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// SpecViolation
// ---------------------------------------------------------------------------

/// Why a specification is not acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecViolation {
    /// Path escape or disallowed symbol.
    Security(String),
    /// Type, bounds or shape mismatch.
    Invalid(String),
}

impl From<SpecViolation> for PipelineError {
    fn from(v: SpecViolation) -> Self {
        match v {
            SpecViolation::Security(m) => PipelineError::SecurityViolation(m),
            SpecViolation::Invalid(m) => PipelineError::Validation(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Specification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    proposal_id: String,
    target_file: PathBuf,
    target_symbol: String,
    change: ChangeKind,
    #[serde(default)]
    rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validation_rules: Option<ValidationRules>,
}

impl Specification {
    pub fn new(
        proposal_id: impl Into<String>,
        target_file: impl Into<PathBuf>,
        target_symbol: impl Into<String>,
        change: ChangeKind,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            target_file: target_file.into(),
            target_symbol: target_symbol.into(),
            change,
            rationale: rationale.into(),
            validation_rules: None,
        }
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = if rules.is_empty() { None } else { Some(rules) };
        self
    }

    pub fn with_proposal_id(mut self, proposal_id: impl Into<String>) -> Self {
        self.proposal_id = proposal_id.into();
        self
    }

    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    pub fn target_file(&self) -> &Path {
        &self.target_file
    }

    pub fn target_symbol(&self) -> &str {
        &self.target_symbol
    }

    pub fn change(&self) -> &ChangeKind {
        &self.change
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn validation_rules(&self) -> Option<&ValidationRules> {
        self.validation_rules.as_ref()
    }

    /// Field-wise equality ignoring `proposal_id`.
    pub fn same_change_as(&self, other: &Specification) -> bool {
        self.target_file == other.target_file
            && self.target_symbol == other.target_symbol
            && self.change == other.change
            && self.rationale == other.rationale
            && self.validation_rules == other.validation_rules
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check every structural invariant. Pure: depends only on the fields.
    pub fn validate(&self) -> Result<(), SpecViolation> {
        if self.proposal_id.trim().is_empty() {
            return Err(SpecViolation::Invalid("proposal_id is empty".into()));
        }
        confine_relative(&self.target_file).map_err(SpecViolation::Security)?;
        self.validate_symbol()?;

        match &self.change {
            ChangeKind::ParameterChange { value_type, old_value, new_value } => {
                self.validate_scalar(*value_type, old_value.as_ref(), new_value)?;
            }
            ChangeKind::ConfigUpdate { key, value_type, old_value, new_value } => {
                if key.trim().is_empty() {
                    return Err(SpecViolation::Invalid("config key is empty".into()));
                }
                self.validate_scalar(*value_type, old_value.as_ref(), new_value)?;
            }
            ChangeKind::MethodAddition { method_name, code } => {
                if !IDENTIFIER.is_match(method_name) {
                    return Err(SpecViolation::Invalid(format!(
                        "method name '{method_name}' is not an identifier"
                    )));
                }
                if !code.contains(&format!("def {method_name}")) {
                    return Err(SpecViolation::Invalid(format!(
                        "method code does not define '{method_name}'"
                    )));
                }
            }
            ChangeKind::ClassModification { code } => {
                let class_name = self.symbol_leaf();
                if !code.contains(&format!("class {class_name}")) {
                    return Err(SpecViolation::Invalid(format!(
                        "class code does not define '{class_name}'"
                    )));
                }
            }
            ChangeKind::ImportAddition { statement } => {
                let s = statement.trim();
                if s.contains('\n') || !(s.starts_with("import ") || s.starts_with("from ")) {
                    return Err(SpecViolation::Invalid(format!(
                        "'{s}' is not a single import statement"
                    )));
                }
            }
            ChangeKind::DocstringUpdate { docstring } => {
                if docstring.trim().is_empty() {
                    return Err(SpecViolation::Invalid("docstring is empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Last dotted segment of the symbol.
    pub fn symbol_leaf(&self) -> &str {
        self.target_symbol.rsplit('.').next().unwrap_or(&self.target_symbol)
    }

    fn validate_symbol(&self) -> Result<(), SpecViolation> {
        let symbol = self.target_symbol.trim();
        if symbol == MODULE_SYMBOL {
            return match self.change {
                ChangeKind::DocstringUpdate { .. } | ChangeKind::ImportAddition { .. } => Ok(()),
                _ => Err(SpecViolation::Invalid(format!(
                    "{MODULE_SYMBOL} is only valid for docstring or import changes"
                ))),
            };
        }
        if symbol.is_empty() {
            return Err(SpecViolation::Invalid("target_symbol is empty".into()));
        }
        for segment in symbol.split('.') {
            if !IDENTIFIER.is_match(segment) {
                return Err(SpecViolation::Invalid(format!(
                    "symbol segment '{segment}' is not an identifier"
                )));
            }
            if segment.starts_with("__") && segment.ends_with("__") && segment != "__init__" {
                return Err(SpecViolation::Security(format!(
                    "dunder symbol '{segment}' may not be modified"
                )));
            }
        }
        Ok(())
    }

    fn validate_scalar(
        &self,
        declared: ValueType,
        old_value: Option<&ScalarValue>,
        new_value: &ScalarValue,
    ) -> Result<(), SpecViolation> {
        if !declared.accepts(new_value.value_type()) {
            return Err(SpecViolation::Invalid(format!(
                "new value {new_value} is not of declared type {declared}"
            )));
        }
        if let Some(old) = old_value {
            if !declared.accepts(old.value_type()) {
                return Err(SpecViolation::Invalid(format!(
                    "old value {old} is not of declared type {declared}"
                )));
            }
        }
        let Some(rules) = &self.validation_rules else {
            return Ok(());
        };
        if let Some(allowed) = rules.allowed_type {
            if !allowed.accepts(new_value.value_type()) || !allowed.accepts(declared) {
                return Err(SpecViolation::Invalid(format!(
                    "type {declared} not allowed (allowed: {allowed})"
                )));
            }
        }
        if let (Some(min), Some(max)) = (rules.min, rules.max) {
            if min > max {
                return Err(SpecViolation::Invalid(format!("bounds [{min}, {max}] are empty")));
            }
        }
        if rules.min.is_some() || rules.max.is_some() {
            let Some(x) = new_value.as_f64() else {
                return Err(SpecViolation::Invalid(format!(
                    "bounds given for non-numeric value {new_value}"
                )));
            };
            if rules.min.is_some_and(|min| x < min) || rules.max.is_some_and(|max| x > max) {
                return Err(SpecViolation::Invalid(format!(
                    "new value {x} outside bounds [{}, {}]",
                    rules.min.map_or("-inf".to_string(), |m| m.to_string()),
                    rules.max.map_or("inf".to_string(), |m| m.to_string()),
                )));
            }
        }
        Ok(())
    }

    /// Serialize to the canonical JSON form accepted back by the parser.
    pub fn render(&self) -> String {
        // Every field is a plain string, number, bool or path; serialization
        // cannot fail for this shape.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_rendered(raw: &str) -> PipelineResult<Self> {
        serde_json::from_str(raw).map_err(|e| PipelineError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Path confinement / normalization helpers
// ---------------------------------------------------------------------------

/// Lexically normalize `path` and require it to stay inside the root it is
/// relative to. Absolute paths and `..` escapes are rejected.
pub fn confine_relative(path: &Path) -> Result<PathBuf, String> {
    if path.as_os_str().is_empty() {
        return Err("target_file is empty".into());
    }
    if path.has_root() || path.is_absolute() {
        return Err(format!("target_file '{}' is absolute", path.display()));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(format!(
                        "target_file '{}' escapes the repository root",
                        path.display()
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("target_file '{}' is absolute", path.display()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(format!("target_file '{}' names the root itself", path.display()));
    }
    Ok(out)
}

/// Whitespace- and case-canonical form of a proposal, used as the cache key basis.
pub fn normalize_proposal(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Hex SHA-1 of arbitrary bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha1::digest(bytes))
}
