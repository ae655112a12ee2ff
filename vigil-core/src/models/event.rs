use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of event categories assigned to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    Protest,
    Conflict,
    Political,
    #[serde(rename = "Natural disaster")]
    NaturalDisaster,
    Crime,
    #[serde(rename = "Cyber Attack")]
    CyberAttack,
    #[serde(rename = "Public health")]
    PublicHealth,
    Economic,
    #[serde(rename = "Security Alert")]
    SecurityAlert,
    Other,
}

impl EventCategory {
    pub const ALL: [EventCategory; 10] = [
        EventCategory::Protest,
        EventCategory::Conflict,
        EventCategory::Political,
        EventCategory::NaturalDisaster,
        EventCategory::Crime,
        EventCategory::CyberAttack,
        EventCategory::PublicHealth,
        EventCategory::Economic,
        EventCategory::SecurityAlert,
        EventCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Protest => "Protest",
            EventCategory::Conflict => "Conflict",
            EventCategory::Political => "Political",
            EventCategory::NaturalDisaster => "Natural disaster",
            EventCategory::Crime => "Crime",
            EventCategory::CyberAttack => "Cyber Attack",
            EventCategory::PublicHealth => "Public health",
            EventCategory::Economic => "Economic",
            EventCategory::SecurityAlert => "Security Alert",
            EventCategory::Other => "Other",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for EventCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        EventCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}
