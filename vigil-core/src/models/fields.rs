use serde::{Deserialize, Serialize};

use super::EventCategory;

/// Enrichable attributes of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Country,
    Region,
    Location,
    Title,
    EventType,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Country,
        Field::Region,
        Field::Location,
        Field::Title,
        Field::EventType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Country => "country",
            Field::Region => "region",
            Field::Location => "location",
            Field::Title => "title",
            Field::EventType => "event_type",
        }
    }
}

/// A value paired with the confidence of the rule that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub value: Option<T>,
    pub confidence: f32,
}

impl<T> Scored<T> {
    pub fn new(value: T, confidence: f32) -> Self {
        Self {
            value: Some(value),
            confidence,
        }
    }

    pub fn none() -> Self {
        Self {
            value: None,
            confidence: 0.0,
        }
    }

    pub fn unresolved(confidence: f32) -> Self {
        Self {
            value: None,
            confidence,
        }
    }

    /// Value if present and at or above `threshold`.
    pub fn accepted(&self, threshold: f32) -> Option<&T> {
        match &self.value {
            Some(v) if self.confidence >= threshold => Some(v),
            _ => None,
        }
    }
}

impl<T> Default for Scored<T> {
    fn default() -> Self {
        Self::none()
    }
}

/// Output of the deterministic pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichedFields {
    pub country: Scored<String>,
    pub region: Scored<String>,
    pub location: Scored<String>,
    pub title: Scored<String>,
    pub event_category: Scored<EventCategory>,
}

impl EnrichedFields {
    pub fn confidence(&self, field: Field) -> f32 {
        match field {
            Field::Country => self.country.confidence,
            Field::Region => self.region.confidence,
            Field::Location => self.location.confidence,
            Field::Title => self.title.confidence,
            Field::EventType => self.event_category.confidence,
        }
    }

    /// String form of the field's value if it clears `threshold`.
    pub fn accepted(&self, field: Field, threshold: f32) -> Option<String> {
        match field {
            Field::Country => self.country.accepted(threshold).cloned(),
            Field::Region => self.region.accepted(threshold).cloned(),
            Field::Location => self.location.accepted(threshold).cloned(),
            Field::Title => self.title.accepted(threshold).cloned(),
            Field::EventType => self
                .event_category
                .accepted(threshold)
                .map(|c| c.as_str().to_string()),
        }
    }
}

/// Final per-item attributes; `None` means explicitly absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFields {
    pub country: Option<String>,
    pub region: Option<String>,
    pub location: Option<String>,
    pub title: Option<String>,
    pub event_category: Option<EventCategory>,
}

impl ResolvedFields {
    pub fn is_set(&self, field: Field) -> bool {
        match field {
            Field::Country => self.country.is_some(),
            Field::Region => self.region.is_some(),
            Field::Location => self.location.is_some(),
            Field::Title => self.title.is_some(),
            Field::EventType => self.event_category.is_some(),
        }
    }

    pub fn get(&self, field: Field) -> Option<String> {
        match field {
            Field::Country => self.country.clone(),
            Field::Region => self.region.clone(),
            Field::Location => self.location.clone(),
            Field::Title => self.title.clone(),
            Field::EventType => self.event_category.map(|c| c.as_str().to_string()),
        }
    }

    /// Sets a field from a string value. Blank values and unknown event
    /// categories leave the field unset. Returns whether the field was set.
    pub fn set(&mut self, field: Field, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        match field {
            Field::Country => self.country = Some(value.to_string()),
            Field::Region => self.region = Some(value.to_string()),
            Field::Location => self.location = Some(value.to_string()),
            Field::Title => self.title = Some(value.to_string()),
            Field::EventType => match value.parse::<EventCategory>() {
                Ok(c) => self.event_category = Some(c),
                Err(_) => return false,
            },
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scored_accepted_respects_threshold() {
        let s = Scored::new("France".to_string(), 0.7);
        assert_eq!(s.accepted(0.9), None);
        assert_eq!(s.accepted(0.7).map(String::as_str), Some("France"));
        assert_eq!(Scored::<String>::unresolved(0.3).accepted(0.0), None);
    }

    #[test]
    fn test_resolved_set_ignores_blank_and_unknown_category() {
        let mut r = ResolvedFields::default();
        assert!(!r.set(Field::Region, "   "));
        assert!(!r.set(Field::EventType, "Weather"));
        assert!(r.set(Field::EventType, "crime"));
        assert_eq!(r.event_category, Some(EventCategory::Crime));
        assert!(r.set(Field::Title, " Protest downtown "));
        assert_eq!(r.title.as_deref(), Some("Protest downtown"));
    }

    #[test]
    fn test_field_serde_names() {
        let json = serde_json::to_string(&Field::EventType).unwrap();
        assert_eq!(json, "\"event_type\"");
    }
}
