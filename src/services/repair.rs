//! Tolerant JSON repair for raw model output.
//!
//! Model responses are unreliable: they arrive wrapped in markdown fences,
//! truncated mid-string by output limits, or cut off mid-structure. This
//! module recovers a parseable document from such text without touching
//! already-valid input.

/// Error message fragments that indicate a retry is worth attempting.
const RETRYABLE_PATTERNS: [&str; 5] = ["json", "truncated", "unterminated", "timeout", "rate limit"];

/// Repair possibly-truncated JSON text from a model response.
///
/// Strategy, in order:
/// 1. Strip markdown code fences and stray backticks.
/// 2. If the text already ends in a closing brace/bracket, return it as-is.
/// 3. Detect an unterminated trailing string: an odd count of unescaped
///    quotes means a string is still open, so truncate back to the nearest
///    preceding comma or opening brace/bracket, dropping the partial
///    key/value.
/// 4. Count unmatched `{`/`[` and append exactly that many closers,
///    innermost container first, to restore structural balance.
///
/// Idempotent on valid input: repaired output ends in a structural close,
/// so a second pass is a no-op.
pub fn repair(text: &str) -> String {
    let stripped = strip_code_fences(text);
    let s = stripped.trim();
    if s.is_empty() {
        return String::new();
    }
    if s.ends_with('}') || s.ends_with(']') {
        return s.to_string();
    }

    let mut out = s.to_string();

    // Odd quote parity means the text was cut off inside a string literal.
    if count_unescaped_quotes(&out) % 2 == 1 {
        truncate_open_string(&mut out);
    }

    // Close every container still open, innermost first.
    for open in unmatched_opens(&out).into_iter().rev() {
        out.push(if open == '{' { '}' } else { ']' });
    }
    out
}

/// Whether an error message indicates a transient failure worth a retry.
///
/// Malformed-JSON and truncation errors are usually fixed by re-asking the
/// model; timeouts and rate limits by waiting. Anything else is surfaced as
/// a permanent failure.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Remove markdown code fences (```json ... ```) and stray backticks from
/// the edges of a model response.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Drop an optional language tag on the fence line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let body = match body.rfind("```") {
            Some(end) => &body[..end],
            None => body,
        };
        return body.trim().trim_matches('`').trim().to_string();
    }

    trimmed.trim_matches('`').trim().to_string()
}

/// Count quote characters that are not backslash-escaped.
fn count_unescaped_quotes(text: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            count += 1;
        }
    }
    count
}

/// Drop the trailing partial string the text was truncated inside of,
/// cutting back to the nearest preceding comma (dropped) or opening
/// brace/bracket (kept) so the enclosing container can be closed cleanly.
fn truncate_open_string(out: &mut String) {
    let open_quote = match last_unescaped_quote(out) {
        Some(i) => i,
        None => return,
    };

    match out[..open_quote].rfind(|c: char| c == ',' || c == '{' || c == '[') {
        Some(i) if out.as_bytes()[i] == b',' => out.truncate(i),
        Some(i) => out.truncate(i + 1),
        None => out.clear(),
    }
}

/// Byte index of the last unescaped quote in the text.
fn last_unescaped_quote(text: &str) -> Option<usize> {
    let mut last = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            last = Some(i);
        }
    }
    last
}

/// The `{` and `[` characters left unclosed, in opening order, ignoring
/// structural characters inside string literals.
fn unmatched_opens(text: &str) -> Vec<char> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(c),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    stack
}
