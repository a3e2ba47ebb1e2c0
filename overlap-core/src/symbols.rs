//! Best-effort enclosing-symbol resolution.
//!
//! Given a file and a target substring (typically the `old_string` of an
//! edit), locate the substring's 1-indexed line range and walk upward looking
//! for the nearest declaration line. The pattern set is a fixed, shallow list
//! of function/method/class shapes across common syntaxes; no parser is
//! involved and misses are fine. All I/O failures degrade to `None` so the
//! caller emits its event without enrichment.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// A located edit target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRegion {
    pub start_line: u32,
    pub end_line: u32,
    pub enclosing_symbol: Option<String>,
}

/// Declaration patterns, tried in order per line; the first capture on the
/// nearest line above wins.
static DECL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Rust functions
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)",
        // JS/TS functions
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)",
        // JS/TS arrow functions bound to a const/let
        r"^\s*(?:export\s+)?(?:const|let)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*=>",
        // Python functions
        r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)",
        // Go functions and methods
        r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)",
        // Class declarations (JS/TS/Python/Java-ish)
        r"^\s*(?:export\s+)?(?:public\s+|abstract\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        // Java/C#-style methods with visibility modifiers
        r"^\s*(?:public|private|protected)\s+(?:static\s+)?[\w<>,\[\]\s]+\s([A-Za-z_][A-Za-z0-9_]*)\s*\([^;]*\)\s*\{",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("declaration pattern must compile"))
    .collect()
});

/// Locate `needle` in the file at `path` and resolve its line range plus the
/// nearest enclosing declaration above it.
pub fn resolve_region(path: &Path, needle: &str) -> Option<ResolvedRegion> {
    if needle.is_empty() {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    resolve_in_text(&content, needle)
}

/// Pure core of [`resolve_region`], split out for tests.
pub fn resolve_in_text(content: &str, needle: &str) -> Option<ResolvedRegion> {
    let start_byte = content.find(needle)?;

    let start_line = 1 + count_newlines(&content[..start_byte]);
    let end_line = start_line + count_newlines(needle);

    let enclosing_symbol = enclosing_symbol(content, start_line);

    Some(ResolvedRegion {
        start_line,
        end_line,
        enclosing_symbol,
    })
}

fn count_newlines(text: &str) -> u32 {
    text.bytes().filter(|&b| b == b'\n').count() as u32
}

/// Walk upward from the line above `start_line`, returning the first
/// declaration capture. Ties break by proximity: the nearest line above wins
/// regardless of which pattern matched it.
fn enclosing_symbol(content: &str, start_line: u32) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let first_above = (start_line as usize).checked_sub(2)?;

    for idx in (0..=first_above.min(lines.len().saturating_sub(1))).rev() {
        for pattern in DECL_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(lines[idx]) {
                if let Some(name) = caps.get(1) {
                    return Some(name.as_str().to_string());
                }
            }
        }
    }
    None
}
