//! Python adapter backed by `tree-sitter-python`.
//!
//! Symbol addressing:
//! - `name`: module-level assignment, class or function
//! - `Class.attr`: class-body assignment, then `self.attr = ...` in
//!   `__init__`, then an `__init__` parameter default
//! - `func.param` / `Class.method.param`: parameter default
//! - `<module>`: the module itself (docstring, imports)

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use tree_sitter::{Node, Parser, Tree};

use super::{
    line_indent, reindent, EditError, EditStrategy, LanguageAdapter, SpanEdit, SyntaxIssue,
    ValueSite,
};
use crate::spec::{ChangeKind, ScalarValue, MODULE_SYMBOL};

static NUMBER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9][0-9_]*(?:\.[0-9_]*)?(?:[eE][-+]?[0-9]+)?|\.[0-9][0-9_]*")
        .expect("number token regex")
});

static BOOL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:True|False)\b").expect("bool token regex"));

const LITERAL_KINDS: &[&str] = &["float", "integer", "true", "false", "string"];

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonAdapter;

impl PythonAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse(&self, source: &str) -> Result<Tree, SyntaxIssue> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| SyntaxIssue { line: 0, column: 0, message: e.to_string() })?;
        parser.parse(source, None).ok_or_else(|| SyntaxIssue {
            line: 0,
            column: 0,
            message: "parser produced no tree".to_string(),
        })
    }

    fn parse_checked(&self, source: &str) -> Result<Tree, SyntaxIssue> {
        let tree = self.parse(source)?;
        if let Some(bad) = first_error(tree.root_node()) {
            let pos = bad.start_position();
            let message = if bad.is_missing() {
                format!("missing '{}'", bad.kind())
            } else {
                "unexpected syntax".to_string()
            };
            return Err(SyntaxIssue { line: pos.row + 1, column: pos.column + 1, message });
        }
        Ok(tree)
    }
}

impl LanguageAdapter for PythonAdapter {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py"]
    }

    fn check_syntax(&self, source: &str) -> Result<(), SyntaxIssue> {
        self.parse_checked(source).map(|_| ())
    }

    fn imports(&self, source: &str) -> Result<Vec<String>, SyntaxIssue> {
        let tree = self.parse_checked(source)?;
        let src = source.as_bytes();
        Ok(import_nodes(tree.root_node())
            .into_iter()
            .map(|n| normalize_ws(text(n, src)))
            .collect())
    }

    fn defines(&self, source: &str, symbol: &str) -> bool {
        let Ok(tree) = self.parse(source) else {
            return false;
        };
        let segments = segments(symbol);
        if segments.is_empty() {
            return false;
        }
        let root = tree.root_node();
        let src = source.as_bytes();
        resolve_definition(root, &segments, src).is_some()
            || find_binding(root, &segments, src).is_some()
    }

    fn read_value(&self, source: &str, symbol: &str, key: Option<&str>) -> Option<ValueSite> {
        let tree = self.parse(source).ok()?;
        let src = source.as_bytes();
        let (decl, value) = locate_value(tree.root_node(), symbol, key, src).ok()?;
        Some(ValueSite {
            literal: literal_of(value, src),
            span: value.start_byte()..value.end_byte(),
            declaration: decl.start_byte()..decl.end_byte(),
        })
    }

    fn plan_edit(
        &self,
        source: &str,
        symbol: &str,
        change: &ChangeKind,
    ) -> Result<SpanEdit, EditError> {
        let tree = self.parse_checked(source).map_err(EditError::Syntax)?;
        let root = tree.root_node();
        let src = source.as_bytes();

        match change {
            ChangeKind::ParameterChange { old_value, new_value, .. } => {
                let (decl, value) = locate_value(root, symbol, None, src)?;
                scalar_edit(self, root, decl, value, old_value.as_ref(), new_value, src)
            }
            ChangeKind::ConfigUpdate { key, old_value, new_value, .. } => {
                let (decl, value) = locate_value(root, symbol, Some(key.as_str()), src)?;
                scalar_edit(self, root, decl, value, old_value.as_ref(), new_value, src)
            }
            ChangeKind::MethodAddition { method_name, code } => {
                let (outer, class) = require_definition(root, symbol, "class_definition", src)?;
                let body = class
                    .child_by_field_name("body")
                    .ok_or_else(|| EditError::Unsupported(format!("class {symbol} has no body")))?;
                if find_definition(body, method_name, src).is_some() {
                    return Err(EditError::Ambiguous(format!(
                        "{symbol} already defines {method_name}"
                    )));
                }
                let scope = outer.start_byte()..outer.end_byte();
                if body.start_position().row == class.start_position().row {
                    // `class A: pass`: move the inline suite into a block first
                    let indent = format!("{}    ", line_indent(source, class.start_byte()));
                    let colon_end = body.prev_sibling().map_or(body.start_byte(), |n| n.end_byte());
                    let end = named_children(body).last().map_or(body.end_byte(), |n| n.end_byte());
                    let inline = source[body.start_byte()..end].trim();
                    return Ok(SpanEdit {
                        span: colon_end..end,
                        replacement: format!("\n{indent}{inline}\n\n{}", reindent(code, &indent)),
                        scope,
                        strategy: EditStrategy::Structural,
                    });
                }
                let statements = named_children(body);
                let first = statements
                    .iter()
                    .find(|n| n.kind() != "comment")
                    .copied()
                    .unwrap_or(body);
                let last = statements.last().copied().unwrap_or(body);
                let indent = line_indent(source, first.start_byte());
                let at = last.end_byte();
                Ok(SpanEdit {
                    span: at..at,
                    replacement: format!("\n\n{}", reindent(code, &indent)),
                    scope,
                    strategy: EditStrategy::Structural,
                })
            }
            ChangeKind::ClassModification { code } => {
                let (outer, _) = require_definition(root, symbol, "class_definition", src)?;
                let indent = line_indent(source, outer.start_byte());
                let rendered = reindent(code, &indent);
                Ok(SpanEdit {
                    span: outer.start_byte()..outer.end_byte(),
                    replacement: rendered.trim_start().to_string(),
                    scope: outer.start_byte()..outer.end_byte(),
                    strategy: EditStrategy::Structural,
                })
            }
            ChangeKind::ImportAddition { statement } => {
                let wanted = normalize_ws(statement);
                let imports = import_nodes(root);
                if imports.iter().any(|n| normalize_ws(text(*n, src)) == wanted) {
                    return Err(EditError::Ambiguous(format!("'{wanted}' is already imported")));
                }
                let whole = 0..source.len();
                if let Some(last) = imports.last() {
                    let at = last.end_byte();
                    return Ok(SpanEdit {
                        span: at..at,
                        replacement: format!("\n{wanted}"),
                        scope: whole,
                        strategy: EditStrategy::Structural,
                    });
                }
                let anchor = module_docstring(root)
                    .or_else(|| leading_comments(root).last().copied());
                let (at, replacement) = match anchor {
                    Some(node) => (node.end_byte(), format!("\n\n{wanted}")),
                    None => (0, format!("{wanted}\n")),
                };
                Ok(SpanEdit {
                    span: at..at,
                    replacement,
                    scope: whole,
                    strategy: EditStrategy::Structural,
                })
            }
            ChangeKind::DocstringUpdate { docstring } => {
                docstring_edit(root, symbol, docstring, source)
            }
        }
    }

    fn render_scalar(&self, value: &ScalarValue) -> String {
        match value {
            ScalarValue::Bool(true) => "True".to_string(),
            ScalarValue::Bool(false) => "False".to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(x) => {
                let s = x.to_string();
                if s.contains(['.', 'e', 'E']) || !x.is_finite() {
                    s
                } else {
                    format!("{s}.0")
                }
            }
            ScalarValue::Str(s) => python_string_literal(s),
        }
    }

    fn test_file_patterns(&self, module_stem: &str) -> Vec<String> {
        vec![format!("test_{module_stem}.py"), format!("{module_stem}_test.py")]
    }
}

// ---------------------------------------------------------------------------
// Edits
// ---------------------------------------------------------------------------

fn scalar_edit(
    adapter: &PythonAdapter,
    root: Node<'_>,
    decl: Node<'_>,
    value: Node<'_>,
    old_value: Option<&ScalarValue>,
    new_value: &ScalarValue,
    src: &[u8],
) -> Result<SpanEdit, EditError> {
    let replacement = adapter.render_scalar(new_value);
    let scope = decl.start_byte()..decl.end_byte();

    if let Some(current) = literal_of(value, src) {
        if let Some(old) = old_value {
            if !current.loosely_equals(old) {
                return Err(EditError::Stale { expected: old.to_string(), found: current.to_string() });
            }
        }
        return Ok(SpanEdit {
            span: value.start_byte()..value.end_byte(),
            replacement,
            scope,
            strategy: EditStrategy::Structural,
        });
    }

    // The value is an expression such as `float(0.70)`: fall back to replacing
    // the old literal, searched only inside the declaration span.
    let Some(old) = old_value else {
        return Err(EditError::Unsupported(format!(
            "value `{}` is not a literal and no old value was given",
            text(value, src)
        )));
    };
    let span = scoped_literal_span(root, scope.clone(), old, src)?;
    Ok(SpanEdit { span, replacement, scope, strategy: EditStrategy::ScopedTextual })
}

/// Find the single occurrence of `old` as a literal token inside `scope`.
/// Candidates in comments or inside larger strings are discarded by checking
/// the smallest syntax node covering each match.
fn scoped_literal_span(
    root: Node<'_>,
    scope: Range<usize>,
    old: &ScalarValue,
    src: &[u8],
) -> Result<Range<usize>, EditError> {
    let scoped = std::str::from_utf8(&src[scope.clone()])
        .map_err(|e| EditError::Unsupported(e.to_string()))?;

    let candidates: Vec<Range<usize>> = match old {
        ScalarValue::Int(_) | ScalarValue::Float(_) => {
            let negative = old.as_f64().is_some_and(|x| x < 0.0);
            NUMBER_TOKEN
                .find_iter(scoped)
                .filter(|m| {
                    let before = scoped[..m.start()].chars().next_back();
                    !before.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
                })
                .filter_map(|m| {
                    if !negative {
                        let token = ScalarValue::from_token(m.as_str());
                        return token.loosely_equals(old).then(|| m.range());
                    }
                    // a negative literal is `-` applied to the token; the span
                    // starts at the sign
                    let head = scoped[..m.start()].trim_end_matches([' ', '\t']);
                    let sign = head.strip_suffix('-').map(str::len)?;
                    let token = ScalarValue::from_token(&format!("-{}", m.as_str()));
                    token.loosely_equals(old).then(|| sign..m.end())
                })
                .collect()
        }
        ScalarValue::Bool(b) => BOOL_TOKEN
            .find_iter(scoped)
            .filter(|m| (m.as_str() == "True") == *b)
            .map(|m| m.range())
            .collect(),
        ScalarValue::Str(s) => {
            let forms = [format!("\"{s}\""), format!("'{s}'")];
            forms
                .iter()
                .flat_map(|f| scoped.match_indices(f.as_str()).map(|(i, m)| i..i + m.len()))
                .collect()
        }
    };

    let verified: Vec<Range<usize>> = candidates
        .into_iter()
        .map(|r| (r.start + scope.start)..(r.end + scope.start))
        .filter(|r| {
            root.descendant_for_byte_range(r.start, r.end)
                .is_some_and(|n| {
                    let literal = LITERAL_KINDS.contains(&n.kind())
                        || (n.kind() == "unary_operator" && literal_of(n, src).is_some());
                    literal && n.start_byte() == r.start && n.end_byte() == r.end
                })
        })
        .collect();

    match verified.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(EditError::NotFound(format!("literal {old} inside the declaration"))),
        many => Err(EditError::Ambiguous(format!(
            "{} occurrences of {old} inside the declaration",
            many.len()
        ))),
    }
}

fn docstring_edit(
    root: Node<'_>,
    symbol: &str,
    docstring: &str,
    source: &str,
) -> Result<SpanEdit, EditError> {
    let (scope_node, body) = if symbol.trim() == MODULE_SYMBOL {
        (root, root)
    } else {
        let segs = segments(symbol);
        let (outer, def) = resolve_definition(root, &segs, source.as_bytes())
            .ok_or_else(|| EditError::NotFound(symbol.to_string()))?;
        let body = def
            .child_by_field_name("body")
            .ok_or_else(|| EditError::Unsupported(format!("{symbol} has no body")))?;
        (outer, body)
    };
    let scope = scope_node.start_byte()..scope_node.end_byte();

    let statements: Vec<Node<'_>> =
        named_children(body).into_iter().filter(|n| n.kind() != "comment").collect();
    let indent = statements
        .first()
        .map(|n| line_indent(source, n.start_byte()))
        .unwrap_or_default();
    let literal = docstring_literal(docstring, &indent);

    if let Some(existing) = statements.first().and_then(|n| docstring_node(*n)) {
        return Ok(SpanEdit {
            span: existing.start_byte()..existing.end_byte(),
            replacement: literal,
            scope,
            strategy: EditStrategy::Structural,
        });
    }

    match statements.first() {
        Some(first) => {
            let at = first.start_byte();
            let separator = if body.kind() == "module" { "\n\n" } else { "\n" };
            Ok(SpanEdit {
                span: at..at,
                replacement: format!("{literal}{separator}{indent}"),
                scope,
                strategy: EditStrategy::Structural,
            })
        }
        None => Ok(SpanEdit {
            span: 0..0,
            replacement: format!("{literal}\n"),
            scope: 0..source.len(),
            strategy: EditStrategy::Structural,
        }),
    }
}

fn docstring_literal(docstring: &str, indent: &str) -> String {
    let doubled = docstring.trim().replace('\\', "\\\\");
    // quotes right before the closing delimiter would merge into it
    let head = doubled.trim_end_matches('"');
    let trailing = doubled.len() - head.len();
    let escaped = format!(
        "{}{}",
        head.replace("\"\"\"", "\\\"\\\"\\\""),
        "\\\"".repeat(trailing)
    );
    let body = escaped
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i == 0 || l.trim().is_empty() {
                l.trim_end().to_string()
            } else {
                format!("{indent}{}", l.trim_end())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if body.contains('\n') {
        format!("\"\"\"{body}\n{indent}\"\"\"")
    } else {
        format!("\"\"\"{body}\"\"\"")
    }
}

pub(crate) fn python_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

// ---------------------------------------------------------------------------
// Locating
// ---------------------------------------------------------------------------

fn segments(symbol: &str) -> Vec<&str> {
    symbol.split('.').map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn locate_value<'t>(
    root: Node<'t>,
    symbol: &str,
    key: Option<&str>,
    src: &[u8],
) -> Result<(Node<'t>, Node<'t>), EditError> {
    let segs = segments(symbol);
    if segs.is_empty() {
        return Err(EditError::NotFound(symbol.to_string()));
    }
    let (decl, value) =
        find_binding(root, &segs, src).ok_or_else(|| EditError::NotFound(symbol.to_string()))?;
    let Some(key) = key else {
        return Ok((decl, value));
    };
    if value.kind() != "dictionary" {
        return Err(EditError::Unsupported(format!(
            "{symbol} is bound to `{}`, not a dict literal",
            value.kind()
        )));
    }
    let pair_value = named_children(value)
        .into_iter()
        .filter(|n| n.kind() == "pair")
        .find_map(|pair| {
            let k = pair.child_by_field_name("key")?;
            match literal_of(k, src) {
                Some(ScalarValue::Str(s)) if s == key => pair.child_by_field_name("value"),
                _ => None,
            }
        })
        .ok_or_else(|| EditError::NotFound(format!("{symbol}[{key:?}]")))?;
    Ok((decl, pair_value))
}

fn require_definition<'t>(
    root: Node<'t>,
    symbol: &str,
    kind: &str,
    src: &[u8],
) -> Result<(Node<'t>, Node<'t>), EditError> {
    let segs = segments(symbol);
    match resolve_definition(root, &segs, src) {
        Some((outer, def)) if def.kind() == kind => Ok((outer, def)),
        Some((_, def)) => Err(EditError::Unsupported(format!(
            "{symbol} is a {}, expected {kind}",
            def.kind()
        ))),
        None => Err(EditError::NotFound(symbol.to_string())),
    }
}

/// Walk dotted segments through nested class/function definitions.
/// Returns `(outer, definition)` where `outer` includes decorators.
fn resolve_definition<'t>(
    root: Node<'t>,
    segments: &[&str],
    src: &[u8],
) -> Option<(Node<'t>, Node<'t>)> {
    let mut scope = root;
    let mut found = None;
    for (i, seg) in segments.iter().enumerate() {
        let (outer, def) = find_definition(scope, seg, src)?;
        if i + 1 == segments.len() {
            found = Some((outer, def));
        } else {
            scope = def.child_by_field_name("body")?;
        }
    }
    found
}

fn find_definition<'t>(scope: Node<'t>, name: &str, src: &[u8]) -> Option<(Node<'t>, Node<'t>)> {
    named_children(scope).into_iter().find_map(|stmt| {
        let def = if stmt.kind() == "decorated_definition" {
            stmt.child_by_field_name("definition")?
        } else {
            stmt
        };
        let is_def = matches!(def.kind(), "class_definition" | "function_definition");
        let named = def.child_by_field_name("name").is_some_and(|n| text(n, src) == name);
        (is_def && named).then_some((stmt, def))
    })
}

/// `(declaration, value)` for a scalar binding addressed by `segments`.
fn find_binding<'t>(root: Node<'t>, segments: &[&str], src: &[u8]) -> Option<(Node<'t>, Node<'t>)> {
    let (leaf, parents) = segments.split_last()?;
    if parents.is_empty() {
        return assignment_in_block(root, leaf, src);
    }
    let (_, owner) = resolve_definition(root, parents, src)?;
    let body = owner.child_by_field_name("body")?;
    match owner.kind() {
        "class_definition" => assignment_in_block(body, leaf, src).or_else(|| {
            let (_, init) = find_definition(body, "__init__", src)?;
            let init_body = init.child_by_field_name("body")?;
            self_assignment(init_body, leaf, src).or_else(|| parameter_default(init, leaf, src))
        }),
        "function_definition" => {
            parameter_default(owner, leaf, src).or_else(|| assignment_in_block(body, leaf, src))
        }
        _ => None,
    }
}

fn assignments<'t>(block: Node<'t>) -> Vec<(Node<'t>, Node<'t>)> {
    named_children(block)
        .into_iter()
        .filter(|s| s.kind() == "expression_statement")
        .flat_map(|stmt| {
            named_children(stmt)
                .into_iter()
                .filter(|n| n.kind() == "assignment")
                .map(move |a| (stmt, a))
        })
        .collect()
}

fn assignment_in_block<'t>(block: Node<'t>, name: &str, src: &[u8]) -> Option<(Node<'t>, Node<'t>)> {
    assignments(block).into_iter().find_map(|(stmt, assign)| {
        let left = assign.child_by_field_name("left")?;
        let right = assign.child_by_field_name("right")?;
        (left.kind() == "identifier" && text(left, src) == name && right.kind() != "assignment")
            .then_some((stmt, right))
    })
}

fn self_assignment<'t>(block: Node<'t>, name: &str, src: &[u8]) -> Option<(Node<'t>, Node<'t>)> {
    assignments(block).into_iter().find_map(|(stmt, assign)| {
        let left = assign.child_by_field_name("left")?;
        let right = assign.child_by_field_name("right")?;
        if left.kind() != "attribute" {
            return None;
        }
        let object = left.child_by_field_name("object")?;
        let attribute = left.child_by_field_name("attribute")?;
        (text(object, src) == "self" && text(attribute, src) == name).then_some((stmt, right))
    })
}

fn parameter_default<'t>(func: Node<'t>, name: &str, src: &[u8]) -> Option<(Node<'t>, Node<'t>)> {
    let params = func.child_by_field_name("parameters")?;
    named_children(params).into_iter().find_map(|p| {
        if !matches!(p.kind(), "default_parameter" | "typed_default_parameter") {
            return None;
        }
        let param_name = p.child_by_field_name("name")?;
        let value = p.child_by_field_name("value")?;
        (text(param_name, src) == name).then_some((p, value))
    })
}

fn import_nodes(root: Node<'_>) -> Vec<Node<'_>> {
    named_children(root)
        .into_iter()
        .filter(|n| {
            matches!(
                n.kind(),
                "import_statement" | "import_from_statement" | "future_import_statement"
            )
        })
        .collect()
}

fn leading_comments(root: Node<'_>) -> Vec<Node<'_>> {
    named_children(root).into_iter().take_while(|n| n.kind() == "comment").collect()
}

fn module_docstring(root: Node<'_>) -> Option<Node<'_>> {
    named_children(root)
        .into_iter()
        .find(|n| n.kind() != "comment")
        .and_then(docstring_node)
}

/// The string node of `stmt` if it is a bare string expression statement.
fn docstring_node(stmt: Node<'_>) -> Option<Node<'_>> {
    if stmt.kind() != "expression_statement" {
        return None;
    }
    let inner = stmt.named_child(0)?;
    (inner.kind() == "string" && stmt.named_child_count() == 1).then_some(inner)
}

// ---------------------------------------------------------------------------
// Literals / tree utilities
// ---------------------------------------------------------------------------

fn literal_of(node: Node<'_>, src: &[u8]) -> Option<ScalarValue> {
    match node.kind() {
        "true" => Some(ScalarValue::Bool(true)),
        "false" => Some(ScalarValue::Bool(false)),
        "integer" => {
            let raw = text(node, src).replace('_', "");
            let lower = raw.to_ascii_lowercase();
            let parsed = if let Some(hex) = lower.strip_prefix("0x") {
                i64::from_str_radix(hex, 16).ok()
            } else if let Some(oct) = lower.strip_prefix("0o") {
                i64::from_str_radix(oct, 8).ok()
            } else if let Some(bin) = lower.strip_prefix("0b") {
                i64::from_str_radix(bin, 2).ok()
            } else {
                raw.parse().ok()
            };
            parsed.map(ScalarValue::Int)
        }
        "float" => {
            let raw = text(node, src).replace('_', "");
            if raw.ends_with(['j', 'J']) {
                return None;
            }
            raw.parse().ok().map(ScalarValue::Float)
        }
        "string" => string_content(node, src).map(ScalarValue::Str),
        "unary_operator" => {
            let op = node.child_by_field_name("operator")?;
            let arg = node.child_by_field_name("argument")?;
            match (text(op, src), literal_of(arg, src)?) {
                ("-", ScalarValue::Int(i)) => Some(ScalarValue::Int(-i)),
                ("-", ScalarValue::Float(x)) => Some(ScalarValue::Float(-x)),
                ("+", v @ (ScalarValue::Int(_) | ScalarValue::Float(_))) => Some(v),
                _ => None,
            }
        }
        "parenthesized_expression" => literal_of(node.named_child(0)?, src),
        _ => None,
    }
}

/// Content of a plain (non-f, non-bytes, non-interpolated) string literal.
fn string_content(node: Node<'_>, src: &[u8]) -> Option<String> {
    let children = named_children(node);
    if children.iter().any(|c| c.kind() == "interpolation") {
        return None;
    }
    let start = children.iter().find(|c| c.kind() == "string_start")?;
    let end = children.iter().rev().find(|c| c.kind() == "string_end")?;
    let prefix = text(*start, src).to_ascii_lowercase();
    if prefix.contains('f') || prefix.contains('b') {
        return None;
    }
    let inner = src.get(start.end_byte()..end.start_byte())?;
    std::str::from_utf8(inner).ok().map(str::to_string)
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error).or(Some(node))
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn text<'s>(node: Node<'_>, src: &'s [u8]) -> &'s str {
    node.utf8_text(src).unwrap_or("")
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
