//! Text helpers: UTF-8 repair, whitespace tidying, delimiter escapes.

/// Marker appended to a log entry whose bytes had to be repaired.
pub const UTF8_REPAIR_MARKER: &str = "[invalid UTF-8 character(s) removed]";

/// Replace invalid UTF-8 sequences and report whether anything was repaired.
///
/// Invalid sequences are dropped; the caller decides whether to append
/// [`UTF8_REPAIR_MARKER`].
pub fn repair_utf8(input: &[u8]) -> (String, bool) {
    match std::str::from_utf8(input) {
        Ok(s) => (s.to_string(), false),
        Err(_) => {
            let lossy = String::from_utf8_lossy(input);
            (lossy.replace('\u{FFFD}', ""), true)
        }
    }
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn tidy_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_gap = true;
    for c in input.chars() {
        if c.is_whitespace() {
            if !in_gap {
                out.push(' ');
                in_gap = true;
            }
        } else {
            out.push(c);
            in_gap = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Parse a single-character field delimiter with `\n`, `\t` and `\\` escapes.
///
/// Returns `None` for strings that are not exactly one (possibly escaped)
/// character.
pub fn parse_delimiter(spec: &str) -> Option<char> {
    match spec {
        "\\n" => Some('\n'),
        "\\t" => Some('\t'),
        "\\\\" => Some('\\'),
        s => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        }
    }
}
