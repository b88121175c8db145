//! Province normalization for enrichment rows.

use once_cell::sync::Lazy;
use regex::Regex;

pub const PROVINCES: [&str; 9] = [
    "Eastern Cape",
    "Free State",
    "Gauteng",
    "KwaZulu-Natal",
    "Limpopo",
    "Mpumalanga",
    "North West",
    "Northern Cape",
    "Western Cape",
];

static VARIANTS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^k(wa)?[\s.\-]*z(ulu)?[\s.\-]*n(atal)?\.?$", "KwaZulu-Natal"),
        (r"^(e[\s.]*c|e\.?\s*cape|eastern[\s\-]*cape)$", "Eastern Cape"),
        (r"^(f[\s.]*s|orange\s+free\s+state|free[\s\-]*state)$", "Free State"),
        (r"^(g[\s.]*p|gtg|gauteng\s+province)$", "Gauteng"),
        (r"^(l[\s.]*p|lim|northern\s+province|limpopo\s+province)$", "Limpopo"),
        (r"^(m[\s.]*p|mpu|mpumalanga\s+province)$", "Mpumalanga"),
        (r"^(n[\s.]*w|north[\s\-]*west(\s+province)?)$", "North West"),
        (r"^(n[\s.]*c|n\.?\s*cape|northern[\s\-]*cape)$", "Northern Cape"),
        (r"^(w[\s.]*c|w\.?\s*cape|western[\s\-]*cape)$", "Western Cape"),
    ]
    .into_iter()
    .map(|(pattern, canonical)| {
        let regex = Regex::new(&format!("(?i){pattern}")).expect("static province pattern");
        (regex, canonical)
    })
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvinceMatch {
    /// Already one of [`PROVINCES`].
    Exact(&'static str),
    /// Rewritten from a known variant spelling.
    Variant(&'static str),
    /// Not recognized; carried through as supplied.
    Unrecognized(String),
}

impl ProvinceMatch {
    pub fn value(&self) -> &str {
        match self {
            Self::Exact(name) | Self::Variant(name) => name,
            Self::Unrecognized(raw) => raw,
        }
    }

    pub fn into_value(self) -> String {
        match self {
            Self::Exact(name) | Self::Variant(name) => name.to_string(),
            Self::Unrecognized(raw) => raw,
        }
    }
}

/// `None` for blank input.
pub fn normalize_province(raw: &str) -> Option<ProvinceMatch> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(exact) = PROVINCES.iter().find(|p| p.eq_ignore_ascii_case(trimmed)) {
        return Some(ProvinceMatch::Exact(exact));
    }
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    VARIANTS
        .iter()
        .find(|(regex, _)| regex.is_match(&collapsed))
        .map(|(_, canonical)| ProvinceMatch::Variant(canonical))
        .or_else(|| Some(ProvinceMatch::Unrecognized(trimmed.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_are_kept() {
        assert_eq!(normalize_province("Gauteng"), Some(ProvinceMatch::Exact("Gauteng")));
        assert_eq!(normalize_province(" western cape "), Some(ProvinceMatch::Exact("Western Cape")));
    }

    #[test]
    fn variants_are_rewritten() {
        for raw in ["kwa-zulu natal", "KZN", "Kwazulu Natal", "k.z.n"] {
            assert_eq!(
                normalize_province(raw),
                Some(ProvinceMatch::Variant("KwaZulu-Natal")),
                "{raw}"
            );
        }
        assert_eq!(normalize_province("E. Cape").unwrap().value(), "Eastern Cape");
        assert_eq!(normalize_province("north-west").unwrap().value(), "North West");
        assert_eq!(normalize_province("Northern Province").unwrap().value(), "Limpopo");
    }

    #[test]
    fn unknown_values_pass_through() {
        assert_eq!(
            normalize_province("Mars"),
            Some(ProvinceMatch::Unrecognized("Mars".into()))
        );
        assert_eq!(normalize_province("   "), None);
    }
}
