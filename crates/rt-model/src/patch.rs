//! Diff-match-patch patch-text parsing and fuzzy application.
//!
//! The wire format is Google's diff-match-patch `patch_toText` output: one
//! or more hunks shaped `@@ -<start1>,<len1> +<start2>,<len2> @@` followed by
//! context/delete/insert lines prefixed ` `/`-`/`+`. Nothing in the
//! reference corpus implements this algorithm, so this is a deliberately
//! reduced port: try the byte offset the header claims, fall back to a
//! substring search for the old-text context, fall back to a positional
//! insert — rather than full Bitap fuzzy matching.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch header: {0:?}")]
    MalformedHeader(String),
    #[error("malformed patch body line: {0:?}")]
    MalformedLine(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    start1: usize,
    old_text: String,
    new_text: String,
}

/// Apply `patch_text` to `source`, returning the patched string.
///
/// Never fails on a patch whose context no longer matches the source
/// exactly — that case falls back to a best-effort merge, per the builder's
/// "unresolvable patches produce best-effort merged text" policy. It does
/// fail on a patch text that isn't parseable at all.
pub fn apply_patch(source: &str, patch_text: &str) -> Result<String, PatchError> {
    let hunks = parse_patch(patch_text)?;
    let mut result = source.to_owned();
    for hunk in &hunks {
        result = apply_hunk(&result, hunk);
    }
    Ok(result)
}

fn parse_patch(patch_text: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks = Vec::new();
    let mut lines = patch_text.lines().peekable();

    while let Some(header) = lines.next() {
        if header.is_empty() {
            continue;
        }
        let start1 = parse_header(header)?;
        let mut old_text = String::new();
        let mut new_text = String::new();

        while let Some(line) = lines.peek() {
            if line.starts_with("@@ ") {
                break;
            }
            let line = lines.next().unwrap();
            if line.is_empty() {
                continue;
            }
            let (op, body) = line.split_at(1);
            let decoded = percent_decode(body);
            match op {
                " " => {
                    old_text.push_str(&decoded);
                    new_text.push_str(&decoded);
                }
                "-" => old_text.push_str(&decoded),
                "+" => new_text.push_str(&decoded),
                other => return Err(PatchError::MalformedLine(format!("{other}{body}"))),
            }
        }

        hunks.push(Hunk {
            start1,
            old_text,
            new_text,
        });
    }

    Ok(hunks)
}

fn parse_header(header: &str) -> Result<usize, PatchError> {
    let rest = header
        .strip_prefix("@@ -")
        .ok_or_else(|| PatchError::MalformedHeader(header.to_owned()))?;
    let start1_field = rest
        .split([',', ' '])
        .next()
        .ok_or_else(|| PatchError::MalformedHeader(header.to_owned()))?;
    start1_field
        .parse::<usize>()
        .map_err(|_| PatchError::MalformedHeader(header.to_owned()))
}

fn apply_hunk(source: &str, hunk: &Hunk) -> String {
    let byte_offset = char_to_byte_offset(source, hunk.start1.saturating_sub(1));

    if source[byte_offset..].starts_with(&hunk.old_text) {
        return splice(source, byte_offset, hunk.old_text.len(), &hunk.new_text);
    }

    if !hunk.old_text.is_empty() {
        if let Some(found) = source.find(&hunk.old_text) {
            return splice(source, found, hunk.old_text.len(), &hunk.new_text);
        }
    }

    tracing::warn!(
        target: "rt_model",
        start1 = hunk.start1,
        "patch context not found in source; falling back to positional insert"
    );
    let at = byte_offset.min(source.len());
    splice(source, at, 0, &hunk.new_text)
}

fn splice(source: &str, at: usize, remove_len: usize, insert: &str) -> String {
    let mut out = String::with_capacity(source.len() + insert.len());
    out.push_str(&source[..at]);
    out.push_str(insert);
    out.push_str(&source[at + remove_len..]);
    out
}

fn char_to_byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

/// Decodes the percent-escapes diff-match-patch uses for control characters
/// in patch body text (`%0A` for newline, `%25` for a literal `%`, ...).
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_simple_insert_patch() {
        let patched = apply_patch("x = 1", "@@ -1,5 +1,11 @@\n x = 1\n+%0Ay = 2\n").unwrap();
        assert_eq!(patched, "x = 1\ny = 2");
    }

    #[test]
    fn falls_back_to_substring_search_when_offset_has_drifted() {
        let patched =
            apply_patch("prefix x = 1", "@@ -1,5 +1,11 @@\n x = 1\n+%0Ay = 2\n").unwrap();
        assert_eq!(patched, "prefix x = 1\ny = 2");
    }

    #[test]
    fn unresolvable_patch_still_resolves_via_positional_insert() {
        let patched = apply_patch(
            "totally different text",
            "@@ -1,5 +1,11 @@\n x = 1\n+%0Ay = 2\n",
        );
        assert!(patched.is_ok());
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(apply_patch("x", "not a patch").is_err());
    }
}
