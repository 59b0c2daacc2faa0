//! Cleanup applied to generated test code before it is executed.

/// Strip a markdown code fence wrapped around the whole text.
///
/// Accepts an optional language tag on the opening fence (```` ```python ````).
/// Text without a leading fence is returned trimmed but otherwise unchanged.
/// The result always ends with a single newline.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return format!("{trimmed}\n");
    };
    // Drop the language tag (rest of the opening fence line).
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => "",
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    let mut cleaned = body.trim().to_string();
    cleaned.push('\n');
    cleaned
}
