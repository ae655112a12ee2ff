//! Deterministic text and country-name normalization.
//!
//! Everything here is pure: no IO beyond [`CountryTable::load`], no shared
//! state. The canonical country key produced by [`canonical_country_key`] is
//! the join key used by the store and by every aggregation query.

use serde::Deserialize;
use std::collections::HashMap;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::VigilError;

const BUNDLED_COUNTRIES: &str = include_str!("../data/countries.json");

/// NFC-compose, replace control characters with spaces, collapse whitespace
/// runs and trim.
pub fn normalize_text(text: &str) -> String {
    let composed: String = text.nfc().collect();
    let mut out = String::with_capacity(composed.len());
    let mut pending_space = false;

    for ch in composed.chars() {
        let ch = if ch.is_control() { ' ' } else { ch };
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }

    out
}

/// Lowercased, accent-free comparison key for plain substring search.
pub fn fold_for_search(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Splits `raw` on commas and maps each token through `aliases`.
/// Unknown tokens are dropped; order of the input is preserved.
pub fn normalize_country_names(raw: &str, aliases: &HashMap<String, String>) -> Vec<String> {
    raw.split(',')
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .filter_map(|token| aliases.get(&token).cloned())
        .collect()
}

/// First alias-resolved name that also has coordinates, or `None`.
/// Single-character inputs are rejected outright.
pub fn canonical_country_key(
    raw: &str,
    aliases: &HashMap<String, String>,
    coordinates: &HashMap<String, [f64; 2]>,
) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() == 1 {
        return None;
    }
    normalize_country_names(trimmed, aliases)
        .into_iter()
        .find(|name| coordinates.contains_key(name))
}

#[derive(Debug, Deserialize, Default)]
struct CountryTableFile {
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default)]
    coordinates: HashMap<String, [f64; 2]>,
    #[serde(default)]
    gazetteer: Vec<String>,
}

/// Alias, coordinate and gazetteer data for country resolution.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    aliases: HashMap<String, String>,
    coordinates: HashMap<String, [f64; 2]>,
    /// Longest names first so multi-word names win over their substrings.
    gazetteer: Vec<String>,
}

impl CountryTable {
    pub fn bundled() -> Result<Self, serde_json::Error> {
        Self::from_json(BUNDLED_COUNTRIES)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let file: CountryTableFile = serde_json::from_str(json)?;
        Ok(Self::new(file.aliases, file.coordinates, file.gazetteer))
    }

    pub fn new(
        aliases: HashMap<String, String>,
        coordinates: HashMap<String, [f64; 2]>,
        gazetteer: Vec<String>,
    ) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(alias, canonical)| (alias.trim().to_lowercase(), canonical))
            .filter(|(alias, _)| !alias.is_empty())
            .collect();

        let mut gazetteer: Vec<String> = gazetteer
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        gazetteer.sort_by(|a, b| {
            b.chars()
                .count()
                .cmp(&a.chars().count())
                .then_with(|| a.cmp(b))
        });
        gazetteer.dedup();

        Self {
            aliases,
            coordinates,
            gazetteer,
        }
    }

    /// Loads the table at `path`, or the bundled table when `path` is `None`.
    pub fn load(path: Option<&str>) -> Result<Self, VigilError> {
        match path {
            Some(p) => {
                let json = std::fs::read_to_string(p)?;
                Ok(Self::from_json(&json)?)
            }
            None => Ok(Self::bundled()?),
        }
    }

    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    pub fn coordinates(&self) -> &HashMap<String, [f64; 2]> {
        &self.coordinates
    }

    pub fn gazetteer(&self) -> &[String] {
        &self.gazetteer
    }

    /// Whether `country` is a canonical key with known coordinates.
    pub fn is_known(&self, country: &str) -> bool {
        self.coordinates.contains_key(country)
    }

    pub fn normalize_names(&self, raw: &str) -> Vec<String> {
        normalize_country_names(raw, &self.aliases)
    }

    pub fn canonical_key(&self, raw: &str) -> Option<String> {
        canonical_country_key(raw, &self.aliases, &self.coordinates)
    }
}
