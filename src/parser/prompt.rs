//! Prompt construction and completion decoding for the provider path.

use super::SpecDraft;
use crate::providers::ProviderFailure;

const INSTRUCTIONS: &str = r#"You convert change requests for a Python codebase into JSON.
Reply with exactly one JSON object and nothing else. Schema:

{
  "target_file": "relative/path.py" | null,
  "target_symbol": "Name" | "Class.attr" | "func.param" | "<module>",
  "change": one of
    {"kind": "parameter_change", "value_type": "float|int|bool|str", "old_value": <scalar or null>, "new_value": <scalar>}
    {"kind": "config_update", "key": "...", "value_type": "...", "old_value": <scalar or null>, "new_value": <scalar>}
    {"kind": "method_addition", "method_name": "...", "code": "def ...(self): ..."}
    {"kind": "class_modification", "code": "class ...: ..."}
    {"kind": "import_addition", "statement": "import ..."}
    {"kind": "docstring_update", "docstring": "..."},
  "rationale": "one sentence",
  "validation_rules": {"min": <number>, "max": <number>, "allowed_type": "..."} | null
}

Use null for target_file when the request does not name a file. Never invent values
that are not in the request."#;

pub fn build_prompt(proposal: &str) -> String {
    format!("{INSTRUCTIONS}\n\nChange request:\n{}\n", proposal.trim())
}

/// Decode a completion into a draft. Accepts bare JSON, fenced code blocks and
/// JSON surrounded by prose.
pub fn decode_completion(completion: &str) -> Result<SpecDraft, ProviderFailure> {
    let body = json_object(completion)
        .ok_or_else(|| ProviderFailure::Malformed("completion holds no JSON object".into()))?;
    serde_json::from_str(body).map_err(|e| ProviderFailure::Malformed(e.to_string()))
}

fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
