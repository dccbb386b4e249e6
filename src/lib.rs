//! # autopatch
//!
//! Turn a change proposal (plain language or a JSON specification) into a
//! verified commit on a feature branch:
//!
//! ```text
//! proposal ──► ProposalParser ──► SyntaxMutator ──► TestGenerator ──► VersionControlAutomator
//!                  │                   │  (SafetyValidator)  │
//!              SpecStore            Backup ◄── rollback ─────┘
//! ```
//!
//! [`orchestrator::PipelineOrchestrator`] drives the phases and is the only
//! component that decides whether a failure is rolled back.

pub mod cli;
pub mod config;
pub mod error;
pub mod lang;
pub mod mutator;
pub mod orchestrator;
pub mod parser;
pub mod process;
pub mod providers;
pub mod safety;
pub mod spec;
pub mod store;
pub mod testgen;
pub mod vcs;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use orchestrator::{PipelineExecutionReport, PipelineOrchestrator, RunRequest};
pub use spec::{ChangeKind, ScalarValue, Specification, ValidationRules, ValueType};
