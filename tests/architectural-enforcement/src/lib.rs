//! Architectural Enforcement Integration Tests
//!
//! This package contains tests that enforce architectural principles across
//! the workspace:
//! - The core crate stays free of HTTP server dependencies
//! - No process-wide mutable singletons; shared objects are passed in
//! - No blocking sleeps in async code
//! - No `unwrap()`/`expect()` outside test modules
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A rule violation at a specific source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under `dir/src`
pub fn source_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir.join("src"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .collect()
}

/// Lines of `content` before its first `#[cfg(test)]` marker.
///
/// Test modules sit at the end of each file, so this is the production part.
pub fn production_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(index, line)| (index + 1, line))
}

/// Production lines in `files` that contain any of `patterns`, ignoring comments
pub fn find_in_production_code(files: &[PathBuf], patterns: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for path in files {
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        for (line_no, line) in production_lines(&content) {
            let code = line.trim();
            if code.starts_with("//") {
                continue;
            }
            if patterns.iter().any(|p| code.contains(p)) {
                violations.push(Violation {
                    path: path.clone(),
                    line: line_no,
                    text: code.to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crate_dir(name: &str) -> PathBuf {
        workspace_root().join("chorus").join(name)
    }

    fn all_chorus_sources() -> Vec<PathBuf> {
        let mut files = source_files(&crate_dir("core"));
        files.extend(source_files(&crate_dir("daemon")));
        assert!(!files.is_empty(), "no sources found under chorus/");
        files
    }

    fn assert_clean(violations: &[Violation], rule: &str) {
        let listing: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert!(violations.is_empty(), "{rule}:\n{}", listing.join("\n"));
    }

    #[test]
    fn test_core_has_no_http_server_dependency() {
        let manifest = fs::read_to_string(crate_dir("core").join("Cargo.toml")).unwrap();
        for forbidden in ["axum", "tower", "hyper"] {
            assert!(
                !manifest
                    .lines()
                    .any(|line| line.trim_start().starts_with(forbidden)),
                "chorus-core must not depend on {forbidden}"
            );
        }

        let violations =
            find_in_production_code(&source_files(&crate_dir("core")), &["use axum", "use tower"]);
        assert_clean(&violations, "HTTP server types used in chorus-core");
    }

    #[test]
    fn test_no_process_wide_singletons() {
        let violations = find_in_production_code(
            &all_chorus_sources(),
            &["static mut", "lazy_static!", "OnceCell", "OnceLock"],
        );
        assert_clean(&violations, "process-wide mutable state");
    }

    #[test]
    fn test_no_blocking_sleep() {
        let violations = find_in_production_code(&all_chorus_sources(), &["thread::sleep"]);
        assert_clean(&violations, "blocking sleep in async code");
    }

    #[test]
    fn test_no_unwrap_in_production_code() {
        let violations =
            find_in_production_code(&all_chorus_sources(), &[".unwrap()", ".expect("]);
        assert_clean(&violations, "unwrap/expect outside tests");
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let content = "fn a() {}\n// note\n#[cfg(test)]\nmod tests { fn b() { x.unwrap() } }\n";
        let lines: Vec<(usize, &str)> = production_lines(content).collect();
        assert_eq!(lines, vec![(1, "fn a() {}"), (2, "// note")]);
    }
}
