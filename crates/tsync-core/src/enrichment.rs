//! Enrichment fields supplied by the secondary provider and the additive
//! merge that folds them into a stored release.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fills every listed slot of `$target` from `$incoming` when the incoming
/// value is present. Absent incoming values never clear a slot.
macro_rules! fill_present {
    ($target:expr, $incoming:expr, $changed:ident; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$incoming.$field {
                if $target.$field.as_ref() != Some(value) {
                    $target.$field = Some(value.clone());
                    $changed = true;
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Briefing {
    pub required: Option<bool>,
    pub compulsory: Option<bool>,
    pub date: Option<NaiveDate>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub meeting_id: Option<String>,
    pub passcode: Option<String>,
}

impl Briefing {
    pub fn is_empty(&self) -> bool {
        self.required.is_none()
            && self.compulsory.is_none()
            && self.date.is_none()
            && self.time.is_none()
            && self.venue.is_none()
            && self.meeting_id.is_none()
            && self.passcode.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderDocument {
    pub id: Option<String>,
    pub name: String,
    pub extension: Option<String>,
    pub modified_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub province: Option<String>,
    pub delivery_location: Option<String>,
    pub special_conditions: Option<String>,
    pub contact_person: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub briefing: Briefing,
    pub detailed_category: Option<String>,
    pub organ_of_state: Option<String>,
    /// National / provincial / municipal / state-owned classification.
    pub organ_of_state_type: Option<String>,
    pub estimated_value_min: Option<f64>,
    pub estimated_value_max: Option<f64>,
    pub documents: Option<Vec<TenderDocument>>,
}

/// Number of signals [`Enrichment::quality_score`] looks at.
const QUALITY_SIGNALS: i32 = 12;

impl Enrichment {
    /// Additive-only merge: present incoming values overwrite, absent ones
    /// leave the stored value alone. Returns whether anything changed.
    pub fn merge_from(&mut self, incoming: &Enrichment) -> bool {
        let mut changed = false;
        fill_present!(self, incoming, changed;
            province,
            delivery_location,
            special_conditions,
            contact_person,
            contact_email,
            contact_phone,
            detailed_category,
            organ_of_state,
            organ_of_state_type,
            estimated_value_min,
            estimated_value_max,
        );
        fill_present!(self.briefing, incoming.briefing, changed;
            required,
            compulsory,
            date,
            time,
            venue,
            meeting_id,
            passcode,
        );
        // an empty document list carries no information
        if let Some(documents) = incoming.documents.as_ref().filter(|d| !d.is_empty()) {
            if self.documents.as_ref() != Some(documents) {
                self.documents = Some(documents.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn merged(&self, incoming: &Enrichment) -> Enrichment {
        let mut out = self.clone();
        out.merge_from(incoming);
        out
    }

    pub fn is_empty(&self) -> bool {
        *self == Enrichment::default()
    }

    /// True when any field tracked by the backfill pass is still missing.
    pub fn is_incomplete(&self) -> bool {
        self.province.is_none()
            || self.delivery_location.is_none()
            || self.contact_person.is_none()
            || self.contact_email.is_none()
            || self.contact_phone.is_none()
            || self.detailed_category.is_none()
            || self.organ_of_state_type.is_none()
    }

    pub fn document_count(&self) -> Option<i32> {
        self.documents
            .as_ref()
            .map(|docs| i32::try_from(docs.len()).unwrap_or(i32::MAX))
    }

    /// Share of populated enrichment signals, 0..=100.
    pub fn quality_score(&self) -> i32 {
        let signals = [
            self.province.is_some(),
            self.delivery_location.is_some(),
            self.special_conditions.is_some(),
            self.contact_person.is_some(),
            self.contact_email.is_some(),
            self.contact_phone.is_some(),
            self.briefing.required.is_some()
                || self.briefing.date.is_some()
                || self.briefing.venue.is_some(),
            self.detailed_category.is_some(),
            self.organ_of_state.is_some(),
            self.organ_of_state_type.is_some(),
            self.estimated_value_min.is_some() || self.estimated_value_max.is_some(),
            self.documents.as_ref().is_some_and(|d| !d.is_empty()),
        ];
        let populated = signals.iter().filter(|s| **s).count() as i32;
        (populated * 100 + QUALITY_SIGNALS / 2) / QUALITY_SIGNALS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Enrichment {
        Enrichment {
            province: Some("Gauteng".into()),
            contact_email: Some("a@b.com".into()),
            contact_phone: Some("0123456789".into()),
            briefing: Briefing {
                required: Some(true),
                venue: Some("Boardroom 4".into()),
                ..Briefing::default()
            },
            documents: Some(vec![TenderDocument {
                id: Some("1".into()),
                name: "spec.pdf".into(),
                extension: Some(".pdf".into()),
                modified_at: None,
            }]),
            ..Enrichment::default()
        }
    }

    #[test]
    fn null_incoming_value_never_clears_stored_value() {
        let mut stored = populated();
        let incoming = Enrichment {
            contact_email: None,
            detailed_category: Some("Services: General".into()),
            ..Enrichment::default()
        };

        assert!(stored.merge_from(&incoming));
        assert_eq!(stored.contact_email.as_deref(), Some("a@b.com"));
        assert_eq!(stored.detailed_category.as_deref(), Some("Services: General"));
        assert_eq!(stored.briefing.venue.as_deref(), Some("Boardroom 4"));
    }

    #[test]
    fn present_incoming_value_overwrites() {
        let mut stored = populated();
        let incoming = Enrichment {
            province: Some("Limpopo".into()),
            briefing: Briefing {
                venue: Some("Online".into()),
                ..Briefing::default()
            },
            ..Enrichment::default()
        };
        stored.merge_from(&incoming);
        assert_eq!(stored.province.as_deref(), Some("Limpopo"));
        assert_eq!(stored.briefing.venue.as_deref(), Some("Online"));
        assert_eq!(stored.briefing.required, Some(true));
    }

    #[test]
    fn merging_identical_values_reports_no_change() {
        let mut stored = populated();
        let again = populated();
        assert!(!stored.merge_from(&again));
        assert!(!stored.merge_from(&Enrichment::default()));
    }

    #[test]
    fn empty_document_list_does_not_replace_documents() {
        let mut stored = populated();
        stored.merge_from(&Enrichment {
            documents: Some(Vec::new()),
            ..Enrichment::default()
        });
        assert_eq!(stored.document_count(), Some(1));
    }

    #[test]
    fn quality_score_counts_populated_signals() {
        assert_eq!(Enrichment::default().quality_score(), 0);
        // province, email, phone, briefing, documents
        assert_eq!(populated().quality_score(), 42);
        assert!(populated().is_incomplete());
    }
}
