//! # Module: lang
//!
//! Pluggable language adapters. The pipeline never touches a grammar
//! directly; it goes through the narrow [`LanguageAdapter`] interface:
//! parse → locate → plan a span edit → print (apply the edit).
//!
//! ## Sub-modules
//! - [`python`]: tree-sitter backed adapter for `.py` sources

pub mod python;

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::spec::{ChangeKind, ScalarValue};

pub use python::PythonAdapter;

// ---------------------------------------------------------------------------
// SyntaxIssue / EditError
// ---------------------------------------------------------------------------

/// First syntax problem found in a source text (1-based line and column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Why an edit could not be planned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EditError {
    #[error("source does not parse: {0}")]
    Syntax(SyntaxIssue),
    #[error("symbol not found: {0}")]
    NotFound(String),
    #[error("current value {found} does not match expected old value {expected}")]
    Stale { expected: String, found: String },
    #[error("ambiguous edit: {0}")]
    Ambiguous(String),
    #[error("unsupported edit: {0}")]
    Unsupported(String),
}

// ---------------------------------------------------------------------------
// SpanEdit
// ---------------------------------------------------------------------------

/// How an edit was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStrategy {
    /// The replaced span is exactly one syntax node.
    Structural,
    /// The span was found by text search confined to the declaration span.
    ScopedTextual,
}

impl std::fmt::Display for EditStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditStrategy::Structural => write!(f, "structural"),
            EditStrategy::ScopedTextual => write!(f, "scoped_textual"),
        }
    }
}

/// Replace `span` with `replacement`; `span` must lie within `scope`, the byte
/// range of the located declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEdit {
    pub span: Range<usize>,
    pub replacement: String,
    pub scope: Range<usize>,
    pub strategy: EditStrategy,
}

impl SpanEdit {
    /// Print the edited source. Rejects spans outside the declaration scope or
    /// not on character boundaries.
    pub fn apply(&self, source: &str) -> Result<String, EditError> {
        let Range { start, end } = self.span;
        if start > end
            || start < self.scope.start
            || end > self.scope.end
            || end > source.len()
            || !source.is_char_boundary(start)
            || !source.is_char_boundary(end)
        {
            return Err(EditError::Unsupported(format!(
                "edit span {start}..{end} is outside declaration scope {}..{}",
                self.scope.start, self.scope.end
            )));
        }
        let mut out = String::with_capacity(source.len() + self.replacement.len());
        out.push_str(&source[..start]);
        out.push_str(&self.replacement);
        out.push_str(&source[end..]);
        Ok(out)
    }
}

/// Current value at a scalar target.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSite {
    /// `None` when the value expression is not a plain literal.
    pub literal: Option<ScalarValue>,
    pub span: Range<usize>,
    pub declaration: Range<usize>,
}

// ---------------------------------------------------------------------------
// LanguageAdapter
// ---------------------------------------------------------------------------

pub trait LanguageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extensions handled, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    fn check_syntax(&self, source: &str) -> Result<(), SyntaxIssue>;

    /// Normalized top-level import statements, in source order.
    fn imports(&self, source: &str) -> Result<Vec<String>, SyntaxIssue>;

    /// Whether `symbol` names a definition or scalar binding in `source`.
    fn defines(&self, source: &str, symbol: &str) -> bool;

    /// Locate the value bound to `symbol` (and `key`, for dict entries).
    fn read_value(&self, source: &str, symbol: &str, key: Option<&str>) -> Option<ValueSite>;

    /// Plan the single span edit realizing `change` on `symbol`.
    fn plan_edit(&self, source: &str, symbol: &str, change: &ChangeKind)
        -> Result<SpanEdit, EditError>;

    /// Source-level literal for `value`.
    fn render_scalar(&self, value: &ScalarValue) -> String;

    /// Conventional test file name for a module stem, if the ecosystem has one.
    fn test_file_patterns(&self, module_stem: &str) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

/// Maps file extensions to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn LanguageAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PythonAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn LanguageAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn LanguageAdapter>> {
        let ext = path.extension()?.to_str()?;
        self.adapters
            .iter()
            .find(|a| a.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .cloned()
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }
}

// ---------------------------------------------------------------------------
// Indentation helpers shared by adapters
// ---------------------------------------------------------------------------

/// Strip the common leading whitespace, re-indent every non-blank line with
/// `indent`, and drop trailing blank lines.
pub fn reindent(code: &str, indent: &str) -> String {
    let lines: Vec<&str> = code.trim_end().lines().collect();
    let common = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let body: Vec<String> = lines
        .iter()
        .skip_while(|l| l.trim().is_empty())
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                format!("{indent}{}", &l[common.min(l.len())..])
            }
        })
        .collect();
    body.join("\n")
}

/// Whitespace prefix of the line containing byte `offset`.
pub fn line_indent(source: &str, offset: usize) -> String {
    let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
    source[line_start..]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_edit_applies_inside_scope() {
        let edit = SpanEdit {
            span: 4..8,
            replacement: "0.65".into(),
            scope: 0..8,
            strategy: EditStrategy::Structural,
        };
        assert_eq!(edit.apply("x = 0.70\ny = 0.70").unwrap(), "x = 0.65\ny = 0.70");
    }

    #[test]
    fn test_span_edit_rejects_span_outside_scope() {
        let edit = SpanEdit {
            span: 13..17,
            replacement: "0.65".into(),
            scope: 0..8,
            strategy: EditStrategy::ScopedTextual,
        };
        assert!(edit.apply("x = 0.70\ny = 0.70").is_err());
    }

    #[test]
    fn test_reindent_strips_common_prefix() {
        let code = "\n        def reset(self):\n            self.n = 0\n\n";
        assert_eq!(reindent(code, "    "), "    def reset(self):\n        self.n = 0");
    }

    #[test]
    fn test_line_indent() {
        let src = "class A:\n    x = 1\n";
        let offset = src.find('x').unwrap();
        assert_eq!(line_indent(src, offset), "    ");
    }

    #[test]
    fn test_registry_selects_by_extension() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.supports(Path::new("src/detector.py")));
        assert!(!registry.supports(Path::new("src/detector.rs")));
        assert!(!registry.supports(Path::new("Makefile")));
    }
}
