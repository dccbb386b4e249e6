//! pytest templates, one per change kind.
//!
//! Generated tests inspect the target with Python's `ast` module instead of
//! importing it, so they exercise nothing but the post-condition of the change
//! and never trigger import-time side effects of the code under change.

use std::path::Path;

use crate::lang::python::python_string_literal;
use crate::lang::{LanguageAdapter, PythonAdapter};
use crate::spec::{ChangeKind, ScalarValue, Specification, ValueType, MODULE_SYMBOL};

const PRELUDE: &str = r#"import ast
import math
import pathlib

ROOT = pathlib.Path(__file__).resolve().parents[__DEPTH__]
TARGET = ROOT / __TARGET__
SYMBOL = __SYMBOL__


def _tree():
    source = TARGET.read_text(encoding="utf-8")
    return ast.parse(source, filename=str(TARGET))


def _definition(scope, name):
    for node in scope.body:
        if isinstance(node, (ast.ClassDef, ast.FunctionDef, ast.AsyncFunctionDef)) and node.name == name:
            return node
    return None


def _resolve(tree, parts):
    scope = tree
    for part in parts:
        scope = _definition(scope, part)
        assert scope is not None, f"{part} is not defined in {TARGET}"
    return scope


def _assigned(body, name):
    for node in body:
        if isinstance(node, ast.Assign):
            for target in node.targets:
                if isinstance(target, ast.Name) and target.id == name:
                    return node.value
        elif isinstance(node, ast.AnnAssign) and node.value is not None:
            if isinstance(node.target, ast.Name) and node.target.id == name:
                return node.value
    return None


def _self_assigned(func, name):
    for node in func.body:
        if isinstance(node, ast.Assign):
            targets = node.targets
        elif isinstance(node, ast.AnnAssign) and node.value is not None:
            targets = [node.target]
        else:
            continue
        for target in targets:
            if (
                isinstance(target, ast.Attribute)
                and target.attr == name
                and isinstance(target.value, ast.Name)
                and target.value.id == "self"
            ):
                return node.value
    return None


def _param_default(func, name):
    args = func.args
    positional = args.posonlyargs + args.args
    defaults = [None] * (len(positional) - len(args.defaults)) + list(args.defaults)
    for arg, default in zip(positional, defaults):
        if arg.arg == name:
            return default
    for arg, default in zip(args.kwonlyargs, args.kw_defaults):
        if arg.arg == name:
            return default
    return None


def _value_node(tree, symbol):
    *parents, leaf = symbol.split(".")
    if not parents:
        node = _assigned(tree.body, leaf)
    else:
        owner = _resolve(tree, parents)
        if isinstance(owner, ast.ClassDef):
            node = _assigned(owner.body, leaf)
            init = _definition(owner, "__init__")
            if node is None and init is not None:
                node = _self_assigned(init, leaf)
            if node is None and init is not None:
                node = _param_default(init, leaf)
        else:
            node = _param_default(owner, leaf)
            if node is None:
                node = _assigned(owner.body, leaf)
    assert node is not None, f"{symbol} has no value in {TARGET}"
    return node


def _literal(node):
    try:
        return ast.literal_eval(node)
    except ValueError:
        if isinstance(node, ast.Call) and len(node.args) == 1 and not node.keywords:
            return _literal(node.args[0])
        raise


def _check_scalar(value, expected, expected_type):
    assert type(value) is expected_type, f"expected {expected_type.__name__}, got {type(value).__name__}"
    if expected_type is float:
        assert math.isclose(value, expected, rel_tol=1e-9, abs_tol=1e-12), f"{value!r} != {expected!r}"
    else:
        assert value == expected, f"{value!r} != {expected!r}"


def test_target_compiles():
    compile(TARGET.read_text(encoding="utf-8"), str(TARGET), "exec")
"#;

/// Render the pytest module for `spec`. `depth` is the number of path
/// components between the working directory and the generated file's parent.
pub fn render_test(spec: &Specification, depth: usize) -> String {
    let target = spec.target_file().to_string_lossy().replace('\\', "/");
    let header = format!(
        "\"\"\"Generated by autopatch for proposal {}: {} on {}.\"\"\"\n",
        sanitize_doc(spec.proposal_id()),
        spec.change(),
        sanitize_doc(spec.target_symbol()),
    );
    let prelude = PRELUDE
        .replace("__DEPTH__", &depth.to_string())
        .replace("__TARGET__", &python_string_literal(&target))
        .replace("__SYMBOL__", &python_string_literal(spec.target_symbol()));

    let body = match spec.change() {
        ChangeKind::ParameterChange { value_type, new_value, .. } => {
            let mut test = format!(
                "\n\ndef test_value_updated():\n    value = _literal(_value_node(_tree(), SYMBOL))\n    _check_scalar(value, {}, {})\n",
                scalar(new_value),
                python_type(*value_type),
            );
            test.push_str(&bounds_test(spec, "_literal(_value_node(_tree(), SYMBOL))"));
            test
        }
        ChangeKind::ConfigUpdate { key, value_type, new_value, .. } => {
            let lookup = format!("_config_value({})", python_string_literal(key));
            let mut test = format!(
                "\n\ndef _config_value(key):\n    node = _value_node(_tree(), SYMBOL)\n    assert isinstance(node, ast.Dict), \"not a dict literal\"\n    for k, v in zip(node.keys, node.values):\n        if isinstance(k, ast.Constant) and k.value == key:\n            return _literal(v)\n    raise AssertionError(f\"key {{key!r}} missing\")\n\n\ndef test_config_key_updated():\n    _check_scalar({lookup}, {}, {})\n",
                scalar(new_value),
                python_type(*value_type),
            );
            test.push_str(&bounds_test(spec, &lookup));
            test
        }
        ChangeKind::MethodAddition { method_name, .. } => format!(
            "\n\ndef test_method_added():\n    owner = _resolve(_tree(), SYMBOL.split(\".\"))\n    assert isinstance(owner, ast.ClassDef)\n    method = _definition(owner, {})\n    assert method is not None\n    assert isinstance(method, (ast.FunctionDef, ast.AsyncFunctionDef))\n",
            python_string_literal(method_name),
        ),
        ChangeKind::ClassModification { code } => format!(
            "\n\nEXPECTED = {}\n\n\ndef test_class_replaced():\n    owner = _resolve(_tree(), SYMBOL.split(\".\"))\n    assert isinstance(owner, ast.ClassDef)\n    import textwrap\n    expected = ast.parse(textwrap.dedent(EXPECTED)).body[0]\n    assert ast.dump(owner) == ast.dump(expected)\n",
            python_string_literal(code),
        ),
        ChangeKind::ImportAddition { statement } => format!(
            "\n\ndef test_import_added():\n    expected = ast.dump(ast.parse({}).body[0])\n    assert any(ast.dump(node) == expected for node in _tree().body)\n",
            python_string_literal(statement.trim()),
        ),
        ChangeKind::DocstringUpdate { docstring } => {
            let owner = if spec.target_symbol().trim() == MODULE_SYMBOL {
                "_tree()"
            } else {
                "_resolve(_tree(), SYMBOL.split(\".\"))"
            };
            format!(
                "\n\ndef test_docstring_updated():\n    doc = ast.get_docstring({owner})\n    assert doc is not None\n    assert \" \".join(doc.split()) == \" \".join({}.split())\n",
                python_string_literal(docstring),
            )
        }
    };

    format!("{header}{prelude}{body}")
}

/// File name for the generated test: `test_autogen_<id>_<symbol>.py`.
pub fn test_file_name(spec: &Specification) -> String {
    let id: String = identifier(spec.proposal_id()).chars().take(12).collect();
    let symbol = if spec.target_symbol().trim() == MODULE_SYMBOL {
        "module".to_string()
    } else {
        identifier(spec.target_symbol())
    };
    format!("test_autogen_{id}_{symbol}.py")
}

/// Number of components in `dir`, i.e. how many `parents[...]` steps lead
/// from a file inside it back to the root.
pub fn depth_of(dir: &Path) -> usize {
    dir.components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .count()
}

fn bounds_test(spec: &Specification, expr: &str) -> String {
    let Some(rules) = spec.validation_rules() else {
        return String::new();
    };
    let mut checks = String::new();
    if let Some(min) = rules.min {
        checks.push_str(&format!("    assert value >= {}\n", float_literal(min)));
    }
    if let Some(max) = rules.max {
        checks.push_str(&format!("    assert value <= {}\n", float_literal(max)));
    }
    if checks.is_empty() {
        return String::new();
    }
    format!("\n\ndef test_value_within_bounds():\n    value = {expr}\n{checks}")
}

fn scalar(value: &ScalarValue) -> String {
    PythonAdapter::new().render_scalar(value)
}

fn float_literal(x: f64) -> String {
    scalar(&ScalarValue::Float(x))
}

fn python_type(t: ValueType) -> &'static str {
    match t {
        ValueType::Float => "float",
        ValueType::Int => "int",
        ValueType::Bool => "bool",
        ValueType::Str => "str",
    }
}

fn identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

fn sanitize_doc(raw: &str) -> String {
    raw.replace('\\', "/").replace('"', "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ValidationRules;

    fn param_spec() -> Specification {
        Specification::new(
            "3f2a9c1e-77aa-4b1e-9d61-0a6c0a3f3b10",
            "src/detectors.py",
            "SignalDetector.confidence_threshold",
            ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: Some(ScalarValue::Float(0.70)),
                new_value: ScalarValue::Float(0.65),
            },
            "reduce false negatives",
        )
        .with_rules(ValidationRules::bounds(0.5, 0.9))
    }

    #[test]
    fn test_file_name_is_sanitized() {
        assert_eq!(
            test_file_name(&param_spec()),
            "test_autogen_3f2a9c1e_77a_signaldetector_confidence_threshold.py"
        );
    }

    #[test]
    fn test_parameter_template_asserts_value_type_and_bounds() {
        let src = render_test(&param_spec(), 2);
        assert!(src.contains("parents[2]"));
        assert!(src.contains("TARGET = ROOT / \"src/detectors.py\""));
        assert!(src.contains("_check_scalar(value, 0.65, float)"));
        assert!(src.contains("assert value >= 0.5"));
        assert!(src.contains("assert value <= 0.9"));
        assert!(src.contains("def test_target_compiles"));
    }

    #[test]
    fn test_each_kind_renders_its_own_check() {
        let cases = [
            (
                ChangeKind::MethodAddition { method_name: "reset".into(), code: "def reset(self): pass".into() },
                "def test_method_added",
            ),
            (ChangeKind::ClassModification { code: "class A:\n    x = 1\n".into() }, "def test_class_replaced"),
            (ChangeKind::ImportAddition { statement: "import math".into() }, "def test_import_added"),
            (ChangeKind::DocstringUpdate { docstring: "Doc \"quoted\".".into() }, "def test_docstring_updated"),
            (
                ChangeKind::ConfigUpdate {
                    key: "leverage".into(),
                    value_type: ValueType::Int,
                    old_value: None,
                    new_value: ScalarValue::Int(2),
                },
                "def test_config_key_updated",
            ),
        ];
        for (change, expected) in cases {
            let spec = Specification::new("p", "a.py", "A", change, "");
            let src = render_test(&spec, 1);
            assert!(src.contains(expected), "missing {expected}");
            assert!(!src.contains("__DEPTH__") && !src.contains("__SYMBOL__"));
        }
    }

    #[test]
    fn test_depth_of_generated_dir() {
        assert_eq!(depth_of(Path::new("tests/generated")), 2);
        assert_eq!(depth_of(Path::new("./tests")), 1);
    }
}
