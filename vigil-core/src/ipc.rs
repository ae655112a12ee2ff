use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Optional restrictions shared by the aggregation queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VigilRequest {
    Ping,
    Health,
    StartRun,
    RunStatus,
    TailLogs {
        #[serde(default)]
        cursor: u64,
    },
    CancelRun,
    RetentionSweep {
        max_age_days: Option<i64>,
    },
    ActiveCountries {
        #[serde(default)]
        dates: Vec<NaiveDate>,
        days: Option<i64>,
        #[serde(default)]
        filters: QueryFilters,
    },
    CountryEvents {
        country: String,
        date: Option<NaiveDate>,
        #[serde(default)]
        filters: QueryFilters,
    },
    LatestCountryEvents {
        country: String,
        #[serde(default)]
        filters: QueryFilters,
    },
    NonGeorefEvents {
        date: Option<NaiveDate>,
        #[serde(default)]
        filters: QueryFilters,
    },
    CountriesActivity {
        date: NaiveDate,
    },
    Search {
        query: String,
    },
    AvailableDates,
    Sources,
    CountryFacets {
        country: String,
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VigilResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl VigilResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
