//! # Stage: Proposal Parser
//!
//! ## Responsibility
//! Turn a change request into a validated [`Specification`]:
//!
//! 1. Normalize the text and look its hash up in the injected [`SpecStore`]
//! 2. Structured input (a rendered specification) is decoded directly
//! 3. Otherwise ask the completion provider, at the configured temperature,
//!    token budget and timeout
//! 4. Any provider failure falls back to the [`heuristic`] extractor
//! 5. Resolve the target file if the proposal did not name one, then validate
//! 6. Write the result back to the store
//!
//! ## Guarantees
//! - Provider failures never escape: they are recorded in [`ParseMetrics`]
//! - Warm-cache parses of the same normalized text are equal up to `proposal_id`
//! - No target file is written; the only side effects are cache reads/writes
//!
//! ## NOT Responsible For
//! - Checking that the target file exists (see the mutator)

pub mod heuristic;
pub mod prompt;
pub mod resolve;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ParserConfig, SafetyConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::lang::AdapterRegistry;
use crate::providers::{CompletionProvider, CompletionRequest, ProviderFailure};
use crate::spec::{
    content_hash, normalize_proposal, ChangeKind, Specification, ValidationRules,
};
use crate::store::SpecStore;

pub use heuristic::HeuristicError;
pub use resolve::resolve_target_file;

// ---------------------------------------------------------------------------
// SpecDraft
// ---------------------------------------------------------------------------

/// A specification before target resolution and validation. This is the shape
/// of structured proposals, provider completions and heuristic output alike.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpecDraft {
    #[serde(default)]
    pub target_file: Option<PathBuf>,
    pub target_symbol: String,
    pub change: ChangeKind,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub validation_rules: Option<ValidationRules>,
}

impl SpecDraft {
    /// Coerce scalar payloads to their declared type (`1` declared float → `1.0`).
    fn with_coerced_values(mut self) -> Self {
        self.change = match self.change {
            ChangeKind::ParameterChange { value_type, old_value, new_value } => {
                ChangeKind::ParameterChange {
                    value_type,
                    old_value: old_value.map(|v| v.coerce_to(value_type)),
                    new_value: new_value.coerce_to(value_type),
                }
            }
            ChangeKind::ConfigUpdate { key, value_type, old_value, new_value } => {
                ChangeKind::ConfigUpdate {
                    key,
                    value_type,
                    old_value: old_value.map(|v| v.coerce_to(value_type)),
                    new_value: new_value.coerce_to(value_type),
                }
            }
            other => other,
        };
        self
    }
}

// ---------------------------------------------------------------------------
// ParseMetrics / ParseOutcome
// ---------------------------------------------------------------------------

/// Where a specification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecSource {
    Structured,
    Cache,
    Provider,
    Heuristic,
}

impl std::fmt::Display for SpecSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecSource::Structured => write!(f, "structured"),
            SpecSource::Cache => write!(f, "cache"),
            SpecSource::Provider => write!(f, "provider"),
            SpecSource::Heuristic => write!(f, "heuristic"),
        }
    }
}

/// Per-run parse metrics, returned to the caller instead of kept in globals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseMetrics {
    pub source: SpecSource,
    pub cache_hit: bool,
    pub cache_key: String,
    /// Why the provider path was abandoned, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub spec: Specification,
    pub metrics: ParseMetrics,
}

/// Fresh opaque proposal identifier.
pub fn new_proposal_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// ProposalParser
// ---------------------------------------------------------------------------

pub struct ProposalParser {
    config: ParserConfig,
    forbidden_fragments: Vec<String>,
    provider: Arc<dyn CompletionProvider>,
    store: Arc<dyn SpecStore>,
    adapters: AdapterRegistry,
}

impl ProposalParser {
    pub fn new(
        config: ParserConfig,
        safety: &SafetyConfig,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn SpecStore>,
        adapters: AdapterRegistry,
    ) -> Self {
        Self {
            config,
            forbidden_fragments: safety.forbidden_fragments.clone(),
            provider,
            store,
            adapters,
        }
    }

    /// Parse with a freshly generated proposal id.
    pub async fn parse(&self, text: &str, working_dir: &Path) -> PipelineResult<ParseOutcome> {
        self.parse_with_id(text, &new_proposal_id(), working_dir).await
    }

    pub async fn parse_with_id(
        &self,
        text: &str,
        proposal_id: &str,
        working_dir: &Path,
    ) -> PipelineResult<ParseOutcome> {
        let normalized = normalize_proposal(text);
        if normalized.is_empty() {
            return Err(PipelineError::Parse("proposal text is empty".into()));
        }
        let cache_key = content_hash(normalized.as_bytes());

        if let Some(cached) = self.cached(&cache_key) {
            let spec = cached.with_proposal_id(proposal_id);
            self.check(&spec)?;
            tracing::info!(
                target: "autopatch::parser",
                proposal_id,
                cache_key = %cache_key,
                "specification served from cache"
            );
            return Ok(ParseOutcome {
                spec,
                metrics: ParseMetrics {
                    source: SpecSource::Cache,
                    cache_hit: true,
                    cache_key,
                    provider_failure: None,
                },
            });
        }

        let (draft, source, provider_failure) = self.draft(text).await?;
        let spec = self.finish(draft, proposal_id, working_dir)?;
        self.check(&spec)?;

        if let Err(e) = self.store.put(&cache_key, spec.render().as_bytes(), self.config.cache_ttl())
        {
            tracing::warn!(target: "autopatch::parser", error = %e, "spec cache write failed");
        }

        tracing::info!(
            target: "autopatch::parser",
            proposal_id,
            source = %source,
            kind = %spec.change(),
            target_file = %spec.target_file().display(),
            target_symbol = spec.target_symbol(),
            "parsed proposal"
        );
        Ok(ParseOutcome {
            spec,
            metrics: ParseMetrics {
                source,
                cache_hit: false,
                cache_key,
                provider_failure: provider_failure.map(|f| f.to_string()),
            },
        })
    }

    /// Cached specification for `key`. Store errors and undecodable entries
    /// count as misses.
    fn cached(&self, key: &str) -> Option<Specification> {
        let bytes = match self.store.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(target: "autopatch::parser", error = %e, "spec cache read failed");
                return None;
            }
        };
        let raw = String::from_utf8(bytes).ok()?;
        match Specification::from_rendered(&raw) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(target: "autopatch::parser", error = %e, "ignoring undecodable cache entry");
                None
            }
        }
    }

    async fn draft(
        &self,
        text: &str,
    ) -> PipelineResult<(SpecDraft, SpecSource, Option<ProviderFailure>)> {
        if text.trim_start().starts_with('{') {
            let draft = serde_json::from_str::<SpecDraft>(text.trim())
                .map_err(|e| PipelineError::Parse(format!("structured proposal: {e}")))?;
            return Ok((draft, SpecSource::Structured, None));
        }

        let failure = match self.ask_provider(text).await {
            Ok(draft) => return Ok((draft.with_coerced_values(), SpecSource::Provider, None)),
            Err(failure) => failure,
        };
        tracing::warn!(
            target: "autopatch::parser",
            provider = self.provider.name(),
            failure = %failure,
            "provider unusable; falling back to heuristic extraction"
        );

        heuristic::extract(text)
            .map(|draft| (draft, SpecSource::Heuristic, Some(failure.clone())))
            .map_err(|e| PipelineError::Parse(format!("{e} (provider: {failure})")))
    }

    async fn ask_provider(&self, text: &str) -> Result<SpecDraft, ProviderFailure> {
        let request = CompletionRequest {
            prompt: prompt::build_prompt(text),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: self.config.timeout(),
        };
        let completion = tokio::time::timeout(request.timeout, self.provider.complete(&request))
            .await
            .map_err(|_| ProviderFailure::Timeout(request.timeout))??;
        prompt::decode_completion(&completion)
    }

    fn finish(
        &self,
        draft: SpecDraft,
        proposal_id: &str,
        working_dir: &Path,
    ) -> PipelineResult<Specification> {
        let target_file = match draft.target_file {
            Some(path) => path,
            None => resolve_target_file(working_dir, &draft.target_symbol, &self.adapters)?,
        };
        let spec = Specification::new(
            proposal_id,
            target_file,
            draft.target_symbol,
            draft.change,
            draft.rationale.unwrap_or_default(),
        );
        Ok(match draft.validation_rules {
            Some(rules) => spec.with_rules(rules),
            None => spec,
        })
    }

    /// Structural validation plus the configured code-fragment deny list.
    fn check(&self, spec: &Specification) -> PipelineResult<()> {
        spec.validate()?;
        if let Some(code) = spec.change().code_fragment() {
            if let Some(hit) = self.forbidden_fragments.iter().find(|f| code.contains(f.as_str())) {
                return Err(PipelineError::SecurityViolation(format!(
                    "code fragment contains forbidden '{hit}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{OfflineProvider, ScriptedProvider};
    use crate::spec::{ScalarValue, ValueType};
    use crate::store::MemorySpecStore;
    use std::time::Duration;

    fn parser_with(provider: Arc<dyn CompletionProvider>) -> (ProposalParser, Arc<MemorySpecStore>) {
        let store = Arc::new(MemorySpecStore::new());
        let parser = ProposalParser::new(
            ParserConfig::default(),
            &SafetyConfig::default(),
            provider,
            store.clone(),
            AdapterRegistry::with_defaults(),
        );
        (parser, store)
    }

    const TEXT: &str = "change confidence_threshold from 0.70 to 0.65 in class SignalDetector in file src/detectors.py";

    #[tokio::test]
    async fn test_offline_falls_back_to_heuristic() {
        let (parser, store) = parser_with(Arc::new(OfflineProvider));
        let out = parser.parse(TEXT, Path::new(".")).await.unwrap();
        assert_eq!(out.metrics.source, SpecSource::Heuristic);
        assert!(out.metrics.provider_failure.is_some());
        assert_eq!(out.spec.target_symbol(), "SignalDetector.confidence_threshold");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_warm_cache_returns_same_change_with_new_id() {
        let (parser, _) = parser_with(Arc::new(OfflineProvider));
        let first = parser.parse_with_id(TEXT, "a", Path::new(".")).await.unwrap();
        let spaced = format!("  {}\n", TEXT.replace(' ', "   "));
        let second = parser.parse_with_id(&spaced, "b", Path::new(".")).await.unwrap();
        assert!(second.metrics.cache_hit);
        assert_eq!(second.spec.proposal_id(), "b");
        assert!(first.spec.same_change_as(&second.spec));
    }

    #[tokio::test]
    async fn test_provider_reply_is_used_and_coerced() {
        let reply = r#"{"target_file": "src/a.py", "target_symbol": "A.x",
            "change": {"kind": "parameter_change", "value_type": "float", "new_value": 1}}"#;
        let provider = Arc::new(ScriptedProvider::responding(reply));
        let (parser, _) = parser_with(provider.clone());
        let out = parser.parse("make A.x one", Path::new(".")).await.unwrap();
        assert_eq!(out.metrics.source, SpecSource::Provider);
        assert_eq!(provider.calls(), 1);
        assert_eq!(
            out.spec.change(),
            &ChangeKind::ParameterChange {
                value_type: ValueType::Float,
                old_value: None,
                new_value: ScalarValue::Float(1.0),
            }
        );
    }

    #[tokio::test]
    async fn test_provider_timeout_degrades_to_heuristic() {
        let provider = Arc::new(
            ScriptedProvider::responding("{}").with_delay(Duration::from_secs(120)),
        );
        let store = Arc::new(MemorySpecStore::new());
        let config = ParserConfig { timeout_secs: 1, ..ParserConfig::default() };
        let parser = ProposalParser::new(
            config,
            &SafetyConfig::default(),
            provider,
            store,
            AdapterRegistry::with_defaults(),
        );
        let out = parser.parse(TEXT, Path::new(".")).await.unwrap();
        assert_eq!(out.metrics.source, SpecSource::Heuristic);
        assert!(out.metrics.provider_failure.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_structured_round_trip() {
        let (parser, _) = parser_with(Arc::new(OfflineProvider));
        let original = parser.parse(TEXT, Path::new(".")).await.unwrap().spec;
        let (fresh, _) = parser_with(Arc::new(OfflineProvider));
        let back = fresh.parse(&original.render(), Path::new(".")).await.unwrap();
        assert_eq!(back.metrics.source, SpecSource::Structured);
        assert!(back.spec.same_change_as(&original));
    }

    #[tokio::test]
    async fn test_absolute_target_is_security_violation() {
        let (parser, store) = parser_with(Arc::new(OfflineProvider));
        let err = parser
            .parse("set x to 1 in file /etc/passwd", Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SecurityViolation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_forbidden_fragment_is_security_violation() {
        let json = r#"{"target_file": "a.py", "target_symbol": "A",
            "change": {"kind": "method_addition", "method_name": "run",
                       "code": "def run(self):\n    eval(self.src)\n"}}"#;
        let (parser, _) = parser_with(Arc::new(OfflineProvider));
        let err = parser.parse(json, Path::new(".")).await.unwrap_err();
        assert!(matches!(err, PipelineError::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn test_unparsable_proposal_is_parse_error() {
        let (parser, _) = parser_with(Arc::new(OfflineProvider));
        let err = parser.parse("make it better", Path::new(".")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
        assert_eq!(err.kind().exit_code(), 2);
    }
}
