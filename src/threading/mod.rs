//! Reply-body cleanup: cut quoted and forwarded history out of a
//! human-written reply using textual markers only.
use once_cell::sync::Lazy;
use regex::Regex;

/// Markers that introduce the previous message. Every pattern is anchored at
/// the start of a line and may be preceded by blanks.
static HISTORY_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Attribution lines; mail clients often wrap them once.
        r"(?m)^[ \t]*Em[ \t][^\n]*(?:\n[^\n]*)?escreveu:",
        r"(?m)^[ \t]*On[ \t][^\n]*(?:\n[^\n]*)?wrote:",
        // Forwarded or inlined header blocks.
        r"(?m)^[ \t]*(?:De|From):",
        // "-----Original Message-----", "________", ...
        r"(?m)^[ \t]*(?:-{3,}|_{3,})",
        // Client signatures.
        r"(?m)^[ \t]*(?:Enviado do meu|Sent from my)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("history marker pattern"))
    .collect()
});

static EXCESS_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("newline pattern"));

/// Return only the text the sender wrote for this reply.
///
/// The body is truncated at the earliest history marker, `>`-quoted lines are
/// dropped, runs of blank lines are collapsed and trailing whitespace is
/// removed. Applying the function to its own output returns it unchanged. A
/// body made only of quoted lines yields an empty string, which callers store
/// as-is.
pub fn strip_quoted_history(raw_body: &str) -> String {
    let mut current = raw_body.replace("\r\n", "\n");
    loop {
        let next = clean_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn clean_once(body: &str) -> String {
    let cut = HISTORY_MARKERS
        .iter()
        .filter_map(|marker| marker.find(body).map(|m| m.start()))
        .min()
        .unwrap_or(body.len());

    let kept: Vec<&str> = body[..cut]
        .split('\n')
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect();

    let joined = kept.join("\n");
    let collapsed = EXCESS_NEWLINES.replace_all(&joined, "\n\n");
    let text = collapsed.trim_end();

    // Leading blank lines go; indentation of the first written line stays.
    let first_char = text.find(|c: char| !c.is_whitespace()).unwrap_or(text.len());
    let line_start = text[..first_char].rfind('\n').map_or(0, |i| i + 1);
    text[line_start..].to_string()
}
