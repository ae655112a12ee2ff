//! Deterministic enrichment: rule-based language, country, event category
//! and coordinate extraction.
//!
//! Every rule returns a value with a confidence. The fallback batcher later
//! decides, field by field, whether that confidence is good enough.
//!
//! Country inference:
//!   1. whole-token match of every alias in the lowercased text
//!      (overlapping matches keep the longest span)
//!   2. one distinct canonical name → 0.95
//!   3. several distinct names → ambiguous, (None, 0.3)
//!   4. nothing → gazetteer names, longest first, first hit at 0.7

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use vigil_core::models::{EnrichedFields, EventCategory, RawItem, ResolvedFields, Scored};
use vigil_core::normalize::{normalize_text, CountryTable};

// ============================================================================
// PUBLIC API
// ============================================================================

/// Output of [`enrich_item`] for one report.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicResult {
    pub normalized_text: String,
    pub language: Option<String>,
    pub language_confidence: f32,
    pub fields: EnrichedFields,
}

/// A fetched report moving through enrichment. `resolved` is filled by the
/// fallback batcher.
#[derive(Debug, Clone)]
pub struct EnrichedItem {
    pub raw: RawItem,
    pub deterministic: DeterministicResult,
    pub resolved: ResolvedFields,
}

impl EnrichedItem {
    pub fn new(raw: RawItem, countries: &CountryTable) -> Self {
        let deterministic = enrich_item(&raw.text, countries);
        Self {
            raw,
            deterministic,
            resolved: ResolvedFields::default(),
        }
    }
}

/// Runs every deterministic rule over `text`. Language is detected on the
/// original text, the other rules on its normalized form.
pub fn enrich_item(text: &str, countries: &CountryTable) -> DeterministicResult {
    let (language, language_confidence) = detect_language(text);
    let normalized_text = normalize_text(text);

    let (country, country_conf) = infer_country(&normalized_text, countries);
    let (category, category_conf) = infer_event_category(&normalized_text);
    let (location, location_conf) = infer_location(&normalized_text);

    let fields = EnrichedFields {
        country: Scored {
            value: country,
            confidence: country_conf,
        },
        region: Scored::none(),
        location: Scored {
            value: location,
            confidence: location_conf,
        },
        title: Scored::none(),
        event_category: Scored {
            value: category,
            confidence: category_conf,
        },
    };

    DeterministicResult {
        normalized_text,
        language: language.map(str::to_string),
        language_confidence,
        fields,
    }
}

// ============================================================================
// Language
// ============================================================================

const STOPWORDS: [(&str, [&str; 8]); 4] = [
    ("en", ["the", "and", "of", "to", "in", "with", "for", "on"]),
    ("fr", ["le", "la", "les", "des", "et", "de", "dans", "pour"]),
    ("es", ["el", "la", "los", "las", "y", "de", "en", "para"]),
    ("de", ["der", "die", "das", "und", "von", "mit", "fur", "im"]),
];

/// Cyrillic script wins outright; otherwise the language with the most
/// distinct stop-word hits, first listed on ties.
pub fn detect_language(text: &str) -> (Option<&'static str>, f32) {
    if text.trim().is_empty() {
        return (None, 0.0);
    }
    if text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c)) {
        return (Some("ru"), 0.9);
    }

    let padded = format!(" {} ", text.to_lowercase());
    let mut best: Option<(&'static str, usize)> = None;
    for (lang, words) in STOPWORDS.iter() {
        let hits = words
            .iter()
            .filter(|w| padded.contains(&format!(" {} ", w)))
            .count();
        if best.map_or(true, |(_, score)| hits > score) {
            best = Some((*lang, hits));
        }
    }

    match best {
        Some((lang, hits)) if hits >= 3 => (Some(lang), 0.9),
        Some((lang, hits)) if hits > 0 => (Some(lang), 0.6),
        _ => (None, 0.0),
    }
}

// ============================================================================
// Country
// ============================================================================

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Byte spans of every whole-token occurrence of `needle` in `haystack`.
fn whole_token_spans(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    if needle.is_empty() {
        return Vec::new();
    }
    haystack
        .match_indices(needle)
        .filter(|(start, m)| {
            let end = start + m.len();
            let before_ok = haystack[..*start]
                .chars()
                .next_back()
                .map_or(true, |c| !is_word_char(c));
            let after_ok = haystack[end..]
                .chars()
                .next()
                .map_or(true, |c| !is_word_char(c));
            before_ok && after_ok
        })
        .map(|(start, m)| (start, start + m.len()))
        .collect()
}

fn strip_leading_decoration(name: &str) -> &str {
    name.trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim_end()
}

pub fn infer_country(text: &str, countries: &CountryTable) -> (Option<String>, f32) {
    let lowered = text.to_lowercase();
    if lowered.trim().is_empty() {
        return (None, 0.0);
    }

    let mut matches: Vec<(usize, usize, &str)> = Vec::new();
    for (alias, canonical) in countries.aliases() {
        if alias.chars().count() < 2 {
            continue;
        }
        for (start, end) in whole_token_spans(&lowered, alias) {
            matches.push((start, end, canonical.as_str()));
        }
    }

    if matches.is_empty() {
        for name in countries.gazetteer() {
            if !whole_token_spans(&lowered, &name.to_lowercase()).is_empty() {
                return (Some(strip_leading_decoration(name).to_string()), 0.7);
            }
        }
        return (None, 0.0);
    }

    // Longest spans first; a match inside an accepted span is part of a longer name.
    matches.sort_by(|a, b| (b.1 - b.0).cmp(&(a.1 - a.0)).then(a.0.cmp(&b.0)));
    let mut accepted: Vec<(usize, usize)> = Vec::new();
    let mut names: BTreeSet<&str> = BTreeSet::new();
    for (start, end, canonical) in matches {
        if accepted.iter().any(|(s, e)| start < *e && *s < end) {
            continue;
        }
        accepted.push((start, end));
        names.insert(canonical);
    }

    let mut distinct = names.into_iter();
    match (distinct.next(), distinct.next()) {
        (Some(only), None) => (Some(strip_leading_decoration(only).to_string()), 0.95),
        (Some(_), Some(_)) => (None, 0.3),
        _ => (None, 0.0),
    }
}

// ============================================================================
// Event category
// ============================================================================

const EVENT_RULE_SOURCES: &[(EventCategory, &[(&str, u32)])] = &[
    (
        EventCategory::Protest,
        &[
            (r"\bprotest(ers|s|ing)?\b", 3),
            (r"\bstrike(s|ing)?\b", 2),
            (r"\bdemonstrat(ion|ions|e|es|ed)\b", 2),
        ],
    ),
    (
        EventCategory::Conflict,
        &[
            (r"\battack(s|ed|ing)?\b", 2),
            (r"\bairstrikes?\b", 3),
            (r"\bclash(es|ed)?\b", 2),
            (r"\bwar\b", 3),
            (r"\barmed\b", 2),
        ],
    ),
    (
        EventCategory::Political,
        &[
            (r"\belections?\b", 3),
            (r"\bparliament\b", 2),
            (r"\bcoup\b", 3),
            (r"\bgovernment\b", 2),
        ],
    ),
    (
        EventCategory::NaturalDisaster,
        &[
            (r"\bearthquakes?\b", 3),
            (r"\bflood(s|ing)?\b", 2),
            (r"\bwildfires?\b", 2),
            (r"\bhurricanes?\b", 2),
        ],
    ),
    (
        EventCategory::Crime,
        &[
            (r"\bshootings?\b", 2),
            (r"\bkidnapp(ing|ed|ers)?\b", 2),
            (r"\brobber(y|ies)\b", 2),
            (r"\bmurder(s|ed)?\b", 2),
        ],
    ),
    (
        EventCategory::CyberAttack,
        &[
            (r"\bhack(ers|ed|ing)?\b", 2),
            (r"\bransomware\b", 3),
            (r"\bcyber\b", 2),
            (r"\bmalware\b", 2),
        ],
    ),
    (
        EventCategory::PublicHealth,
        &[
            (r"\boutbreaks?\b", 3),
            (r"\bepidemics?\b", 3),
            (r"\bpandemic\b", 3),
            (r"\bcovid\b", 2),
        ],
    ),
    (
        EventCategory::Economic,
        &[
            (r"\binflation\b", 2),
            (r"\brecession\b", 3),
            (r"\bstrike\b", 1),
            (r"\bsanctions?\b", 1),
        ],
    ),
    (
        EventCategory::SecurityAlert,
        &[
            (r"\balert\b", 2),
            (r"\bwarning\b", 2),
            (r"\bevacuat(e|ed|ion)\b", 2),
            (r"\bthreats?\b", 2),
        ],
    ),
];

static EVENT_RULES: LazyLock<Vec<(EventCategory, Vec<(Regex, u32)>)>> = LazyLock::new(|| {
    EVENT_RULE_SOURCES
        .iter()
        .map(|(category, rules)| {
            let compiled = rules
                .iter()
                .filter_map(|(pattern, weight)| {
                    Regex::new(&format!("(?i){}", pattern))
                        .ok()
                        .map(|re| (re, *weight))
                })
                .collect();
            (*category, compiled)
        })
        .collect()
});

/// Sums rule weights per category; a unique maximum wins.
pub fn infer_event_category(text: &str) -> (Option<EventCategory>, f32) {
    let mut best: Option<EventCategory> = None;
    let mut best_score = 0u32;
    let mut tie = false;

    for (category, rules) in EVENT_RULES.iter() {
        let score: u32 = rules
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, weight)| *weight)
            .sum();
        if score > best_score {
            best = Some(*category);
            best_score = score;
            tie = false;
        } else if score == best_score && score > 0 {
            tie = true;
        }
    }

    match best {
        Some(category) if !tie && best_score >= 3 => (Some(category), 0.9),
        Some(category) if !tie && best_score > 0 => (Some(category), 0.7),
        _ => (None, 0.0),
    }
}

// ============================================================================
// Location
// ============================================================================

// The regex crate has no lookaround; the outer groups keep a match from
// starting or ending inside a longer number.
static HEMISPHERE_COORDS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[^\d.])(\d{1,2}\.\d+)\s*°?\s*([NS])\s*[,/ ]\s*(\d{1,3}\.\d+)\s*°?\s*([EW])(?:$|[^\w.])",
    )
    .ok()
});

static DECIMAL_COORDS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\d.])(-?\d{1,2}\.\d+)\s*[,/ ]\s*(-?\d{1,3}\.\d+)(?:$|[^\d.])").ok()
});

fn in_range(lat: &str, lon: &str) -> bool {
    match (lat.parse::<f64>(), lon.parse::<f64>()) {
        (Ok(lat), Ok(lon)) => lat.abs() <= 90.0 && lon.abs() <= 180.0,
        _ => false,
    }
}

/// Coordinates written in the text, hemisphere form first. Pairs outside
/// latitude/longitude range are ignored.
pub fn infer_location(text: &str) -> (Option<String>, f32) {
    if let Some(re) = HEMISPHERE_COORDS.as_ref() {
        if let Some(caps) = re.captures_iter(text).find(|c| in_range(&c[1], &c[3])) {
            let location = format!(
                "{}{}, {}{}",
                &caps[1],
                caps[2].to_uppercase(),
                &caps[3],
                caps[4].to_uppercase()
            );
            return (Some(location), 0.95);
        }
    }
    if let Some(re) = DECIMAL_COORDS.as_ref() {
        if let Some(caps) = re.captures_iter(text).find(|c| in_range(&c[1], &c[2])) {
            return (Some(format!("{}, {}", &caps[1], &caps[2])), 0.95);
        }
    }
    (None, 0.0)
}
