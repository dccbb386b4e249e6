//! Target-file resolution for proposals that name a symbol but no file.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::error::{PipelineError, PipelineResult};
use crate::lang::AdapterRegistry;
use crate::spec::MODULE_SYMBOL;

const SKIPPED_DIRS: &[&str] = &[
    "__pycache__",
    "node_modules",
    "site-packages",
    "venv",
    "env",
    "build",
    "dist",
    "target",
];

/// Find the single source file under `root` that defines `symbol`.
///
/// Hidden directories, virtual environments, caches and test files are not
/// searched. Zero or several matches are a parse error.
pub fn resolve_target_file(
    root: &Path,
    symbol: &str,
    adapters: &AdapterRegistry,
) -> PipelineResult<PathBuf> {
    if symbol.trim() == MODULE_SYMBOL {
        return Err(PipelineError::Parse(format!(
            "{MODULE_SYMBOL} changes need an explicit target file"
        )));
    }

    let mut matches = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| !skipped(e));
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() || is_test_file(&entry) {
            continue;
        }
        let path = entry.path();
        let Some(adapter) = adapters.for_path(path) else {
            continue;
        };
        let Ok(source) = std::fs::read_to_string(path) else {
            continue;
        };
        if adapter.defines(&source, symbol) {
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            matches.push(relative);
        }
    }
    matches.sort();

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(PipelineError::Parse(format!(
            "no file under {} defines '{symbol}'",
            root.display()
        ))),
        _ => Err(PipelineError::Parse(format!(
            "'{symbol}' is defined in several files: {}",
            matches.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

pub(crate) fn skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

pub(crate) fn is_test_file(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with("test_") || name.ends_with("_test.py") || name == "conftest.py"
}
