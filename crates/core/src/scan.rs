//! Best-effort substring extraction for camera header and body fragments.
//!
//! Cameras disagree on quoting, spacing and ordering of attributes in
//! `WWW-Authenticate` challenges and multipart content types, and their
//! XML event bodies are rarely well formed. These helpers pull single
//! values out of raw text without a grammar. None of them fail: a missing
//! marker yields an empty string.

/// Returns the value that follows the first occurrence of `marker`.
///
/// The value ends at the first `,` after the marker; failing that the first
/// `"`, then the first `}`, and otherwise runs to the end of `text`.
///
/// ```
/// use ipcam::scan::extract_between;
///
/// let header = r#"Digest realm="R", nonce="N""#;
/// assert_eq!(extract_between(header, "realm=\""), "R");
/// assert_eq!(extract_between(header, "opaque=\""), "");
/// ```
pub fn extract_between<'a>(text: &'a str, marker: &str) -> &'a str {
    let Some(pos) = text.find(marker) else {
        return "";
    };
    let rest = &text[pos + marker.len()..];

    match rest.find(',') {
        Some(comma) => {
            let value = &rest[..comma];
            // A quoted value keeps its closing quote before the comma.
            match value.find('"') {
                Some(quote) => &value[..quote],
                None => value,
            }
        }
        None => {
            let end = rest
                .find('"')
                .or_else(|| rest.find('}'))
                .unwrap_or(rest.len());
            &rest[..end]
        }
    }
}

/// Pulls the text of `key` out of an XML-ish document.
///
/// Searching for `key` starts after `section_heading` (or at the start of
/// `doc` when the heading is empty). The value is everything after `key`
/// up to the next `<`, cut short at a `"` or `>` that is not its first
/// character, so `Value="true"/>` and `<State>active<` both come back
/// clean.
pub fn extract_xml_field<'a>(doc: &'a str, section_heading: &str, key: &str) -> &'a str {
    let search_from = if section_heading.is_empty() {
        0
    } else {
        match doc.find(section_heading) {
            Some(pos) => pos + section_heading.len(),
            None => return "",
        }
    };

    let Some(key_pos) = doc[search_from..].find(key) else {
        return "";
    };
    let rest = &doc[search_from + key_pos + key.len()..];
    let Some(end) = rest.find('<') else {
        return "";
    };

    let mut value = &rest[..end];
    for stop in ['"', '>'] {
        if let Some(pos) = value.find(stop)
            && pos > 0
        {
            value = &value[..pos];
        }
    }
    value
}

/// Returns the text after `marker` up to the next CRLF (or the end).
///
/// Used for plain `key=value\r\n` replies and multipart part headers.
pub fn value_after<'a>(raw: &'a str, marker: &str) -> &'a str {
    let Some(pos) = raw.find(marker) else {
        return "";
    };
    let rest = &raw[pos + marker.len()..];
    match rest.find("\r\n") {
        Some(end) => &rest[..end],
        None => rest,
    }
}
