//! Deterministic classification of tool output into [`CiError`] categories.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{CiError, ProcessResult};

/// Keep at most this many trailing characters of raw output in error details.
pub const DETAIL_LIMIT_CHARS: usize = 8_000;

static SOURCE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:file://)?((?:[A-Za-z]:)?[\w./\\@+-]*[\w-]\.(?:ts|tsx|mts|cts|js|jsx|mjs|cjs))\b",
    )
    .expect("source file regex")
});

static IN_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bin file:\s*(?:file://)?([^\s:'`]+)").expect("in-file regex")
});

static AT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bat file(?::(?://)?|\s+)([^\s:'`]+)").expect("at-file regex")
});

/// Classify a failed invocation by keyword heuristics.
///
/// Rules are checked in order against the lower-cased stdout+stderr and the
/// first match wins:
/// 1. `type` and `error` -> type check
/// 2. `test` and `fail` -> test failure
/// 3. `jsr` or `publish` -> package check
/// 4. `format` -> format
/// 5. `lint` -> lint
/// 6. anything else -> generic failure carrying the raw output
pub fn classify(result: &ProcessResult) -> CiError {
    let output = result.combined_output();
    let lower = output.to_lowercase();
    let files = extract_file_paths(&output);
    let detail = truncate_detail(&output);

    if lower.contains("type") && lower.contains("error") {
        CiError::TypeCheck { files, detail }
    } else if lower.contains("test") && lower.contains("fail") {
        CiError::TestFailure { files, detail }
    } else if lower.contains("jsr") || lower.contains("publish") {
        CiError::Jsr { files, detail }
    } else if lower.contains("format") {
        CiError::Format { files, detail }
    } else if lower.contains("lint") {
        CiError::Lint { files, detail }
    } else {
        CiError::FileSystem { files, detail }
    }
}

/// Extract file paths mentioned in tool output, sorted and de-duplicated.
///
/// `file://` prefixes and trailing `:line:col` positions are dropped.
pub fn extract_file_paths(text: &str) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for re in [&*SOURCE_FILE_RE, &*IN_FILE_RE, &*AT_FILE_RE] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let path = clean_path(m.as_str());
                if !path.is_empty() {
                    found.insert(PathBuf::from(path));
                }
            }
        }
    }
    found.into_iter().collect()
}

fn clean_path(raw: &str) -> &str {
    let trimmed = raw
        .trim_start_matches("file://")
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | ']'));
    // Drop a trailing `:line` or `:line:col`.
    let mut end = trimmed.len();
    for _ in 0..2 {
        let Some(idx) = trimmed[..end].rfind(':') else {
            break;
        };
        let suffix = &trimmed[idx + 1..end];
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            break;
        }
        end = idx;
    }
    &trimmed[..end]
}

fn truncate_detail(output: &str) -> String {
    let count = output.chars().count();
    if count <= DETAIL_LIMIT_CHARS {
        return output.to_string();
    }
    let skipped = count - DETAIL_LIMIT_CHARS;
    let tail: String = output.chars().skip(skipped).collect();
    format!("[... {skipped} chars omitted]\n{tail}")
}
