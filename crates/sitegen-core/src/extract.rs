//! Build output error extraction.
//!
//! Distills noisy install/build output into a bounded excerpt that can be
//! shown to a user or fed back into a fix attempt.

use std::sync::OnceLock;

use regex::Regex;

/// Lines kept by the tail fallback when no failure marker is found.
pub const DEFAULT_TAIL_LINES: usize = 40;

/// Upper bound on excerpt length, in characters.
pub const DEFAULT_MAX_CHARS: usize = 2000;

/// Configuration for the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub tail_lines: usize,
    pub max_chars: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

fn marker_regex() -> &'static Regex {
    static MARKERS: OnceLock<Regex> = OnceLock::new();
    MARKERS.get_or_init(|| {
        Regex::new(concat!(
            r"(?i:failed to compile|type error|module not found|syntax error",
            r"|build error occurred)|\bError:",
        ))
        .unwrap_or_else(|e| unreachable!("marker regex is valid: {e}"))
    })
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]")
            .unwrap_or_else(|e| unreachable!("ansi regex is valid: {e}"))
    })
}

/// Remove terminal color and cursor escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Extract an excerpt using the default configuration.
pub fn extract(raw_output: &str) -> String {
    extract_with(raw_output, &ExtractorConfig::default())
}

/// Extract an excerpt from raw process output.
///
/// Returns everything from the first line carrying a known compiler/bundler
/// failure marker onward; without a marker, the last `tail_lines` lines.
/// The result never exceeds `max_chars` characters.
pub fn extract_with(raw_output: &str, config: &ExtractorConfig) -> String {
    let clean = strip_ansi(raw_output);
    let lines: Vec<&str> = clean.lines().collect();

    let excerpt = match lines.iter().position(|l| marker_regex().is_match(l)) {
        Some(start) => lines[start..].join("\n"),
        None => {
            let start = lines.len().saturating_sub(config.tail_lines);
            lines[start..].join("\n")
        }
    };

    truncate_chars(excerpt.trim_end(), config.max_chars)
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_error_marker_starts_excerpt() {
        let raw = "info  - Linting and checking validity of types...\n\
                   ./app/page.tsx:4:7\n\
                   Type error: Foo is not defined\n\
                   \n  2 | export default function Page() {\n";
        let excerpt = extract(raw);
        assert!(excerpt.starts_with("Type error: Foo is not defined"));
        assert!(excerpt.contains("export default function Page"));
    }

    #[test]
    fn test_first_marker_wins() {
        let raw = "ok\nModule not found: Can't resolve 'xyz'\nmore\nFailed to compile.\n";
        let excerpt = extract(raw);
        assert!(excerpt.starts_with("Module not found: Can't resolve 'xyz'"));
        assert!(excerpt.contains("Failed to compile."));
    }

    #[test]
    fn test_marker_case_insensitive() {
        let excerpt = extract("line\nfailed to compile\nboom");
        assert_eq!(excerpt, "failed to compile\nboom");
    }

    #[test]
    fn test_generic_error_marker() {
        let excerpt = extract("npm warn deprecated\nError: Cannot find module 'next'\n  at x");
        assert!(excerpt.starts_with("Error: Cannot find module 'next'"));
    }

    #[test]
    fn test_no_marker_returns_tail() {
        let raw: String = (1..=100).map(|i| format!("line {i}\n")).collect();
        let excerpt = extract(&raw);
        let lines: Vec<&str> = excerpt.lines().collect();
        assert_eq!(lines.len(), DEFAULT_TAIL_LINES);
        assert_eq!(lines[0], "line 61");
        assert_eq!(lines[39], "line 100");
    }

    #[test]
    fn test_short_output_without_marker_returned_whole() {
        assert_eq!(extract("just\nthree\nlines"), "just\nthree\nlines");
        assert_eq!(extract(""), "");
    }

    #[test]
    fn test_output_bounded_to_max_chars() {
        let raw = format!("Syntax error: {}", "x".repeat(10_000));
        let excerpt = extract(&raw);
        assert_eq!(excerpt.chars().count(), DEFAULT_MAX_CHARS);

        let tail: String = (0..40).map(|_| format!("{}\n", "é".repeat(100))).collect();
        let excerpt = extract(&tail);
        assert!(excerpt.chars().count() <= DEFAULT_MAX_CHARS);
    }

    #[test]
    fn test_ansi_sequences_stripped_before_matching() {
        let raw = "\x1b[31mType error\x1b[39m: Property 'x' does not exist";
        let excerpt = extract(raw);
        assert_eq!(excerpt, "Type error: Property 'x' does not exist");
    }

    #[test]
    fn test_custom_config() {
        let config = ExtractorConfig {
            tail_lines: 2,
            max_chars: 5,
        };
        assert_eq!(extract_with("a\nb\nc", &config), "b\nc");
        assert_eq!(extract_with("Error: abcdef", &config), "Error");
    }

    #[test]
    fn test_truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
