//! Confidence-gated fallback extraction through the model service.
//!
//! Deterministic values at or above their field threshold are kept as-is.
//! Every other eligible field is asked from the model, in sub-batches of
//! `enrichment.batch_size` items, one request per sub-batch. The request
//! carries one JSON object per line; the response is expected in the same
//! form, keyed by the position of the item within the sub-batch.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use vigil_core::config::{ConfidenceThresholds, VigilConfig};
use vigil_core::model_client::ModelBackend;
use vigil_core::models::{EnrichedFields, EventCategory, Field, ResolvedFields};

use super::enrich::EnrichedItem;
use super::run_control::{Cancelled, RunReporter};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub thresholds: ConfidenceThresholds,
    /// Fields the model may fill. Unresolved fields outside this set stay null.
    pub fields: Vec<Field>,
    pub batch_size: usize,
    pub target_language: String,
}

impl FallbackSettings {
    pub fn from_config(config: &VigilConfig) -> Self {
        Self {
            thresholds: config.enrichment.thresholds.clone(),
            fields: config.enrichment.fallback_fields.clone(),
            batch_size: config.enrichment.batch_size.max(1),
            target_language: config.translation.target_language.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackReport {
    pub items_needing_fallback: usize,
    pub sub_batches_sent: usize,
    pub sub_batches_failed: usize,
    pub fields_filled: usize,
    /// Why the remaining sub-batches were not sent, if they were not.
    pub skipped_reason: Option<String>,
}

/// Deterministic values that clear their field threshold.
pub fn resolve_deterministic(
    fields: &EnrichedFields,
    thresholds: &ConfidenceThresholds,
) -> ResolvedFields {
    let mut resolved = ResolvedFields::default();
    for field in Field::ALL {
        if let Some(value) = fields.accepted(field, thresholds.for_field(field)) {
            resolved.set(field, &value);
        }
    }
    resolved
}

/// Eligible fields still unset, in `Field::ALL` order.
pub fn missing_fields(resolved: &ResolvedFields, eligible: &[Field]) -> Vec<Field> {
    Field::ALL
        .into_iter()
        .filter(|f| eligible.contains(f) && !resolved.is_set(*f))
        .collect()
}

#[derive(Debug, Serialize)]
struct FallbackLine<'a> {
    id: usize,
    text: &'a str,
    lang: Option<&'a str>,
    known_fields: BTreeMap<&'static str, String>,
    missing_fields: Vec<&'static str>,
}

fn build_prompt(lines: &[FallbackLine<'_>], target_language: &str) -> String {
    let categories: Vec<&str> = EventCategory::ALL.iter().map(|c| c.as_str()).collect();
    let mut prompt = format!(
        "You extract structured facts from short news reports.\n\
         You will receive one JSON object per line with the keys: id, text, lang, \
         known_fields, missing_fields.\n\
         For EACH input line, output exactly ONE JSON object on a single line.\n\
         Rules:\n\
         - Output strict JSON only, no comments or extra text.\n\
         - Each output object MUST contain the id and ONLY the fields listed in missing_fields.\n\
         - If a field is unknown, set it to an empty string.\n\
         - event_type MUST be one of: {}.\n\
         - title MUST be a short sentence (8-18 words) in {}.\n\
         - country is the main affected country in English, or an empty string if uncertain.\n\
         - region is a large area (province, state), or an empty string.\n\
         - location is a city or specific place, or an empty string.\n\
         Do NOT repeat known_fields. Do NOT add fields that were not requested.\n\
         \n\
         Inputs:\n",
        categories.join(", "),
        target_language
    );

    let body: Vec<String> = lines
        .iter()
        .filter_map(|line| serde_json::to_string(line).ok())
        .collect();
    prompt.push_str(&body.join("\n"));
    prompt
}

fn parse_id(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v as usize).or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as usize)
        }),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    }
}

/// Values per sub-batch position. Lines that are not JSON objects, lack a
/// usable id or point outside the sub-batch are ignored; only the fields the
/// item asked for are read, and empty values are dropped.
pub fn parse_response(raw: &str, missing: &[Vec<Field>]) -> Vec<Vec<(Field, String)>> {
    let mut results: Vec<Vec<(Field, String)>> = vec![Vec::new(); missing.len()];

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(id) = obj.get("id").and_then(parse_id) else {
            continue;
        };
        let Some(wanted) = missing.get(id) else {
            continue;
        };

        results[id] = wanted
            .iter()
            .filter_map(|field| {
                let value = match obj.get(field.as_str())? {
                    Value::Null => return None,
                    Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                };
                (!value.is_empty()).then_some((*field, value))
            })
            .collect();
    }

    results
}

pub struct FallbackBatcher {
    backend: Option<Arc<dyn ModelBackend>>,
    settings: FallbackSettings,
}

impl FallbackBatcher {
    pub fn new(backend: Option<Arc<dyn ModelBackend>>, settings: FallbackSettings) -> Self {
        Self { backend, settings }
    }

    /// Resolves every item's fields. Model failures degrade to nulls; only
    /// cancellation is an error.
    pub async fn run(
        &self,
        items: &mut [EnrichedItem],
        reporter: &RunReporter,
    ) -> Result<FallbackReport, Cancelled> {
        let mut report = FallbackReport::default();
        let mut pending: Vec<(usize, Vec<Field>)> = Vec::new();

        for (idx, item) in items.iter_mut().enumerate() {
            item.resolved =
                resolve_deterministic(&item.deterministic.fields, &self.settings.thresholds);
            let missing = missing_fields(&item.resolved, &self.settings.fields);
            if !missing.is_empty() {
                pending.push((idx, missing));
            }
        }
        report.items_needing_fallback = pending.len();

        if pending.is_empty() {
            reporter.log("Fallback: every item resolved deterministically");
            return Ok(report);
        }

        let Some(backend) = self.backend.as_ref() else {
            reporter.log(format!(
                "Fallback: no model backend configured, {} items keep null fields",
                pending.len()
            ));
            report.skipped_reason = Some("no model backend".to_string());
            return Ok(report);
        };

        let total_batches = pending.len().div_ceil(self.settings.batch_size);
        for (batch_no, chunk) in pending.chunks(self.settings.batch_size).enumerate() {
            reporter.checkpoint()?;

            let lines: Vec<FallbackLine<'_>> = chunk
                .iter()
                .enumerate()
                .map(|(pos, (idx, missing))| {
                    let item = &items[*idx];
                    let known_fields = Field::ALL
                        .into_iter()
                        .filter_map(|f| item.resolved.get(f).map(|v| (f.as_str(), v)))
                        .collect();
                    FallbackLine {
                        id: pos,
                        text: &item.deterministic.normalized_text,
                        lang: item.deterministic.language.as_deref(),
                        known_fields,
                        missing_fields: missing.iter().map(Field::as_str).collect(),
                    }
                })
                .collect();
            let prompt = build_prompt(&lines, &self.settings.target_language);
            drop(lines);

            let response = tokio::select! {
                res = backend.complete(&prompt) => res,
                _ = reporter.token().cancelled() => return Err(Cancelled),
            };
            report.sub_batches_sent += 1;

            let raw = match response {
                Ok(raw) => raw,
                Err(e) if e.is_unreachable() => {
                    report.sub_batches_failed += 1;
                    reporter.warn(format!(
                        "Fallback sub-batch {}/{} failed via {}: {}; skipping remaining fallback",
                        batch_no + 1,
                        total_batches,
                        backend.name(),
                        e
                    ));
                    report.skipped_reason = Some(e.to_string());
                    break;
                }
                Err(e) => {
                    report.sub_batches_failed += 1;
                    reporter.warn(format!(
                        "Fallback sub-batch {}/{} failed via {}: {}; its items keep null fields",
                        batch_no + 1,
                        total_batches,
                        backend.name(),
                        e
                    ));
                    continue;
                }
            };

            let wanted: Vec<Vec<Field>> = chunk.iter().map(|(_, m)| m.clone()).collect();
            let mut filled = 0;
            for (pos, values) in parse_response(&raw, &wanted).into_iter().enumerate() {
                let idx = chunk[pos].0;
                for (field, value) in values {
                    if items[idx].resolved.set(field, &value) {
                        filled += 1;
                    }
                }
            }
            report.fields_filled += filled;

            reporter.log(format!(
                "Fallback sub-batch {}/{}: {} items, {} fields filled",
                batch_no + 1,
                total_batches,
                chunk.len(),
                filled
            ));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use vigil_core::model_client::ModelError;
    use vigil_core::models::RawItem;
    use vigil_core::normalize::CountryTable;

    /// Answers every prompt with a fixed response and records the prompts.
    struct ScriptedBackend {
        responses: Mutex<Vec<Result<String, ModelError>>>,
        prompts: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                responses.remove(0)
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn countries() -> CountryTable {
        let aliases = HashMap::from([("paris".to_string(), "France".to_string())]);
        let coords = HashMap::from([("France".to_string(), [46.2, 2.2])]);
        CountryTable::new(aliases, coords, vec![])
    }

    fn item(id: i64, text: &str) -> EnrichedItem {
        let raw = RawItem {
            source: "Alpha".into(),
            channel: "alpha".into(),
            origin_message_id: id,
            orientation: "unknown".into(),
            label: None,
            text: text.into(),
            timestamp: Utc::now(),
        };
        EnrichedItem::new(raw, &countries())
    }

    fn settings(fields: Vec<Field>, batch_size: usize) -> FallbackSettings {
        FallbackSettings {
            thresholds: ConfidenceThresholds::default(),
            fields,
            batch_size,
            target_language: "fr".into(),
        }
    }

    #[test]
    fn test_parse_response_discards_bad_lines() {
        let missing = vec![vec![Field::Region, Field::EventType], vec![Field::Title]];
        let raw = r#"
not json
[1, 2]
{"region": "Kyiv Oblast"}
{"id": 7, "title": "foreign"}
{"id": "1", "title": "A short headline", "region": "ignored"}
{"id": 0.0, "region": "Kyiv Oblast", "event_type": null}
"#;
        let parsed = parse_response(raw, &missing);
        assert_eq!(parsed[0], vec![(Field::Region, "Kyiv Oblast".to_string())]);
        assert_eq!(parsed[1], vec![(Field::Title, "A short headline".to_string())]);
    }

    #[test]
    fn test_missing_fields_respects_eligible_subset() {
        let resolved = ResolvedFields {
            country: Some("France".into()),
            ..Default::default()
        };
        assert_eq!(
            missing_fields(&resolved, &[Field::Country, Field::Title]),
            vec![Field::Title]
        );
        assert_eq!(
            missing_fields(&resolved, &Field::ALL),
            vec![Field::Region, Field::Location, Field::Title, Field::EventType]
        );
    }

    #[tokio::test]
    async fn test_no_call_when_everything_resolved() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let batcher = FallbackBatcher::new(Some(backend.clone()), settings(vec![Field::Country], 20));
        let mut items = vec![item(1, "Protesters in Paris")];

        let report = batcher.run(&mut items, &RunReporter::detached(50)).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.items_needing_fallback, 0);
        assert_eq!(items[0].resolved.country.as_deref(), Some("France"));
    }

    #[tokio::test]
    async fn test_fills_missing_fields_and_rejects_unknown_category() {
        let backend = Arc::new(ScriptedBackend::new(vec![Ok(
            r#"{"id": 0, "country": "Germany", "event_type": "Weather"}"#.to_string(),
        )]));
        let batcher = FallbackBatcher::new(
            Some(backend.clone()),
            settings(vec![Field::Country, Field::EventType], 20),
        );
        let mut items = vec![item(1, "Something happened somewhere")];

        let report = batcher.run(&mut items, &RunReporter::detached(50)).await.unwrap();

        assert_eq!(report.sub_batches_sent, 1);
        assert_eq!(report.fields_filled, 1);
        assert_eq!(items[0].resolved.country.as_deref(), Some("Germany"));
        assert_eq!(items[0].resolved.event_category, None);
        // Region is not eligible, so it stays null without being asked for.
        assert_eq!(items[0].resolved.region, None);
        let prompt = backend.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("\"missing_fields\":[\"country\",\"event_type\"]"));
    }

    #[tokio::test]
    async fn test_sub_batches_and_failure_skips_rest() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(ModelError::RetryExhausted {
            attempts: 3,
        })]));
        let batcher = FallbackBatcher::new(Some(backend.clone()), settings(Field::ALL.to_vec(), 2));
        let mut items: Vec<EnrichedItem> =
            (0..5).map(|i| item(i, "nothing to see")).collect();

        let report = batcher.run(&mut items, &RunReporter::detached(50)).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.items_needing_fallback, 5);
        assert_eq!(report.sub_batches_failed, 1);
        assert!(report.skipped_reason.is_some());
        assert!(items.iter().all(|i| i.resolved == ResolvedFields::default()));
    }

    #[tokio::test]
    async fn test_rejected_sub_batch_does_not_stop_later_ones() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(ModelError::Api {
                code: 400,
                message: "prompt too long".into(),
            }),
            Ok(r#"{"id": 0, "title": "Second headline"}"#.to_string()),
        ]));
        let batcher = FallbackBatcher::new(Some(backend.clone()), settings(vec![Field::Title], 1));
        let mut items = vec![item(1, "first message"), item(2, "second message")];

        let report = batcher.run(&mut items, &RunReporter::detached(50)).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.sub_batches_sent, 2);
        assert_eq!(report.sub_batches_failed, 1);
        assert_eq!(report.fields_filled, 1);
        assert_eq!(report.skipped_reason, None);
        assert_eq!(items[0].resolved.title, None);
        assert_eq!(items[1].resolved.title.as_deref(), Some("Second headline"));
    }

    #[tokio::test]
    async fn test_without_backend_fields_stay_null() {
        let batcher = FallbackBatcher::new(None, settings(Field::ALL.to_vec(), 20));
        let mut items = vec![item(1, "Protesters in Paris")];

        let report = batcher.run(&mut items, &RunReporter::detached(50)).await.unwrap();

        assert_eq!(report.skipped_reason.as_deref(), Some("no model backend"));
        assert_eq!(items[0].resolved.country.as_deref(), Some("France"));
        assert_eq!(items[0].resolved.title, None);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let batcher = FallbackBatcher::new(Some(backend.clone()), settings(Field::ALL.to_vec(), 20));
        let reporter = RunReporter::detached(50);
        reporter.token().cancel();
        let mut items = vec![item(1, "nothing")];

        assert_eq!(batcher.run(&mut items, &reporter).await, Err(Cancelled));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
