//! URL slugs for stored releases.

use sha2::{Digest, Sha256};

use crate::model::ReleaseKey;

const MAX_SLUG_LEN: usize = 80;
const SUFFIX_HEX_LEN: usize = 8;

pub fn slugify(input: &str) -> String {
    let lowered = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let joined = lowered.split_whitespace().collect::<Vec<_>>().join("-");
    if joined.len() <= MAX_SLUG_LEN {
        return joined;
    }
    // cut on a word boundary where possible
    let cut = &joined[..MAX_SLUG_LEN];
    match cut.rfind('-') {
        Some(idx) if idx > MAX_SLUG_LEN / 2 => cut[..idx].to_string(),
        _ => cut.trim_end_matches('-').to_string(),
    }
}

/// Slug derived from the title, or the ocid when the title is blank.
pub fn base_slug(title: Option<&str>, key: &ReleaseKey) -> String {
    let from_title = title.map(slugify).unwrap_or_default();
    if !from_title.is_empty() {
        return from_title;
    }
    let from_ocid = slugify(&key.ocid);
    if from_ocid.is_empty() {
        "tender".to_string()
    } else {
        from_ocid
    }
}

/// Collision fallback: same base plus a suffix that depends only on the
/// release identity, so retries of the same write pick the same slug.
pub fn suffixed_slug(base: &str, key: &ReleaseKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.ocid.as_bytes());
    hasher.update(b"|");
    hasher.update(key.release_date.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{base}-{}", &digest[..SUFFIX_HEX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn key(ocid: &str) -> ReleaseKey {
        ReleaseKey::new(ocid, Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap())
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(
            slugify("RFQ/410/2025 | Supply of Chairs!"),
            "rfq-410-2025-supply-of-chairs"
        );
    }

    #[test]
    fn long_titles_are_cut_on_word_boundary() {
        let title = "supply and delivery of ".repeat(10);
        let slug = slugify(&title);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn blank_title_falls_back_to_ocid() {
        assert_eq!(base_slug(Some("  "), &key("ocds-9t57fa-1001")), "ocds-9t57fa-1001");
    }

    #[test]
    fn suffix_is_deterministic_per_release() {
        let a = suffixed_slug("chairs", &key("ocds-1"));
        let b = suffixed_slug("chairs", &key("ocds-1"));
        let c = suffixed_slug("chairs", &key("ocds-2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("chairs-"));
        assert_eq!(a.len(), "chairs-".len() + SUFFIX_HEX_LEN);
    }
}
