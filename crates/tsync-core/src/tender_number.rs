//! Heuristic extraction of the human-assigned tender number from free text.
//!
//! The heuristics are lossy: a title can contain something that looks like a
//! reference code without being one, and nothing here tries to tell the two
//! apart. A `None` result means "store the raw release, skip enrichment".

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Longer tokens first so `RFPQ` is not read as `RFP` + `Q...`.
const TOKENS: &str = "RFPQ|RFBQ|RFQ|RFP|RFB|RFT|RFI|RFA|EOI";

static PREFIX_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*(?P<reference>(?:{TOKENS})\s*[/:#.\-]?\s*(?P<code>[A-Z0-9][A-Z0-9/\-_.]*))"
    ))
    .expect("static prefix pattern")
});

static SUFFIX_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<reference>(?:{TOKENS})\s*[/:#.\-]?\s*(?P<code>[A-Z0-9][A-Z0-9/\-_.]*))[\s.)\]]*$"
    ))
    .expect("static suffix pattern")
});

/// Derive the canonical reference code for a release.
///
/// Order: token-prefixed code at the start of the title, token-prefixed code
/// at the end of the title, then the feed-supplied id verbatim.
pub fn derive_tender_number(title: Option<&str>, fallback_id: Option<&str>) -> Option<String> {
    if let Some(title) = title {
        if let Some(found) = capture_reference(&PREFIX_PATTERN, title) {
            return Some(found);
        }
        if let Some(found) = capture_reference(&SUFFIX_PATTERN, title) {
            return Some(found);
        }
    }

    fallback_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Re-derive from a stored OCDS release payload (`tender.title`, `tender.id`).
pub fn derive_tender_number_from_raw(raw: &JsonValue) -> Option<String> {
    let title = raw.pointer("/tender/title").and_then(JsonValue::as_str);
    let fallback = raw.pointer("/tender/id").and_then(scalar_text);
    derive_tender_number(title, fallback.as_deref())
}

/// Stringify a JSON scalar id; feeds send ids as strings or numbers.
pub fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn capture_reference(pattern: &Regex, text: &str) -> Option<String> {
    let caps = pattern.captures(text)?;
    let code = caps.name("code")?.as_str();
    // a bare word after the token ("RFQ for chairs") is not a code
    if !code.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let reference: String = caps
        .name("reference")?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let reference = reference.trim_end_matches(['.', '-', '/', '_']);
    if reference.is_empty() {
        None
    } else {
        Some(reference.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_code_is_extracted() {
        assert_eq!(
            derive_tender_number(Some("RFQ/410/2025 Supply of Chairs"), None).as_deref(),
            Some("RFQ/410/2025")
        );
    }

    #[test]
    fn suffix_code_is_extracted() {
        assert_eq!(
            derive_tender_number(Some("Supply of Chairs RFP-2024-001"), None).as_deref(),
            Some("RFP-2024-001")
        );
        assert_eq!(
            derive_tender_number(Some("Cleaning services (EOI 12/2025)"), None).as_deref(),
            Some("EOI12/2025")
        );
    }

    #[test]
    fn whitespace_inside_match_is_stripped() {
        assert_eq!(
            derive_tender_number(Some("RFB : 0045/2025 Fencing"), Some("77")).as_deref(),
            Some("RFB:0045/2025")
        );
    }

    #[test]
    fn longer_tokens_win_over_their_prefixes() {
        assert_eq!(
            derive_tender_number(Some("RFPQ-88 Catering"), None).as_deref(),
            Some("RFPQ-88")
        );
    }

    #[test]
    fn token_followed_by_plain_word_falls_through_to_id() {
        assert_eq!(
            derive_tender_number(Some("RFQ for the supply of chairs"), Some("  T-12 ")).as_deref(),
            Some("T-12")
        );
    }

    #[test]
    fn fallback_id_used_when_title_absent() {
        assert_eq!(derive_tender_number(None, Some("T-99")).as_deref(), Some("T-99"));
    }

    #[test]
    fn nothing_to_derive_yields_none() {
        assert_eq!(derive_tender_number(None, None), None);
        assert_eq!(derive_tender_number(Some("Supply of chairs"), Some("   ")), None);
    }

    #[test]
    fn raw_payload_numeric_id_is_stringified() {
        let raw = json!({ "tender": { "title": "Road maintenance", "id": 40123 } });
        assert_eq!(derive_tender_number_from_raw(&raw).as_deref(), Some("40123"));

        let raw = json!({ "tender": { "title": "RFT 2025/07 Bridge repairs", "id": "x" } });
        assert_eq!(derive_tender_number_from_raw(&raw).as_deref(), Some("RFT2025/07"));
    }
}
