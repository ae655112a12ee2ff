//! Language-grouped translation batching.
//!
//! Items are grouped by detected source language and sent in sub-batches of
//! `translation.batch_size`. Anything that cannot be translated keeps its
//! original text, so a translation is never empty for a non-empty input.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use vigil_core::config::VigilConfig;
use vigil_core::model_client::ModelBackend;
use vigil_core::models::TranslationResult;
use vigil_core::normalize::normalize_text;

use super::enrich::detect_language;
use super::run_control::{Cancelled, RunReporter};

/// Human-readable name used in prompts.
pub fn language_label(code: &str) -> String {
    match code.to_lowercase().as_str() {
        "en" => "English".to_string(),
        "fr" => "French".to_string(),
        "es" => "Spanish".to_string(),
        "de" => "German".to_string(),
        "ru" => "Russian".to_string(),
        _ => code.to_string(),
    }
}

fn build_prompt(texts: &[&str], source: &str, target: &str) -> String {
    let source = language_label(source);
    let target = language_label(target);
    let mut prompt = format!(
        "You are a professional translator.\n\
         You will receive numbered messages written in {source}.\n\
         Reply STRICTLY in JSON Lines, one object per message:\n\
         {{\"index\": <int>, \"translation\": \"<translated text>\"}}\n\
         No text outside the JSON lines.\n\
         Translate every message from {source} to {target}. Keep proper names, \
         hashtags and untranslatable expressions as they are.\n\
         Messages:\n"
    );
    let body: Vec<String> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| format!("[{}] {}", i, text))
        .collect();
    prompt.push_str(&body.join("\n"));
    prompt
}

/// Translations by sub-batch position; `None` where the response had no
/// usable line.
pub fn parse_translations(raw: &str, len: usize) -> Vec<Option<String>> {
    let mut out: Vec<Option<String>> = vec![None; len];
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(index) = obj.get("index").and_then(Value::as_u64) else {
            continue;
        };
        let translation = match obj.get("translation") {
            Some(Value::String(s)) => s.trim().to_string(),
            _ => continue,
        };
        if let Some(slot) = out.get_mut(index as usize) {
            if !translation.is_empty() {
                *slot = Some(translation);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TranslationReport {
    pub passthrough: usize,
    pub sub_batches_sent: usize,
    pub sub_batches_failed: usize,
    pub translated: usize,
}

pub struct TranslationBatcher {
    backend: Option<Arc<dyn ModelBackend>>,
    target_language: String,
    batch_size: usize,
}

impl TranslationBatcher {
    pub fn new(
        backend: Option<Arc<dyn ModelBackend>>,
        target_language: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            target_language: target_language.into().to_lowercase(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(backend: Option<Arc<dyn ModelBackend>>, config: &VigilConfig) -> Self {
        Self::new(
            backend,
            config.translation.target_language.clone(),
            config.translation.batch_size,
        )
    }

    /// One result per input text, in input order.
    pub async fn translate(
        &self,
        texts: &[String],
        reporter: &RunReporter,
    ) -> Result<(Vec<TranslationResult>, TranslationReport), Cancelled> {
        let mut results: Vec<TranslationResult> = texts
            .iter()
            .map(|t| TranslationResult::passthrough(t))
            .collect();
        let mut report = TranslationReport::default();

        let Some(backend) = self.backend.as_ref() else {
            report.passthrough = texts.len();
            reporter.log("Translation: no model backend configured, keeping original text");
            return Ok((results, report));
        };

        let mut groups: BTreeMap<&'static str, Vec<usize>> = BTreeMap::new();
        for (idx, text) in texts.iter().enumerate() {
            match detect_language(text).0 {
                Some(lang) if lang != self.target_language && !text.trim().is_empty() => {
                    groups.entry(lang).or_default().push(idx)
                }
                _ => report.passthrough += 1,
            }
        }

        if groups.is_empty() {
            reporter.log("Translation: nothing to translate");
            return Ok((results, report));
        }

        for (lang, indices) in &groups {
            let total_batches = indices.len().div_ceil(self.batch_size);
            for (batch_no, chunk) in indices.chunks(self.batch_size).enumerate() {
                reporter.checkpoint()?;

                let normalized: Vec<String> =
                    chunk.iter().map(|i| normalize_text(&texts[*i])).collect();
                let refs: Vec<&str> = normalized.iter().map(String::as_str).collect();
                let prompt = build_prompt(&refs, lang, &self.target_language);

                let response = tokio::select! {
                    res = backend.complete(&prompt) => res,
                    _ = reporter.token().cancelled() => return Err(Cancelled),
                };
                report.sub_batches_sent += 1;

                match response {
                    Ok(raw) => {
                        let mut ok = 0;
                        for (pos, translation) in
                            parse_translations(&raw, chunk.len()).into_iter().enumerate()
                        {
                            if let Some(text) = translation {
                                results[chunk[pos]] = TranslationResult {
                                    translated_text: text,
                                };
                                ok += 1;
                            }
                        }
                        report.translated += ok;
                        reporter.log(format!(
                            "Translation {} sub-batch {}/{}: {}/{} translated",
                            lang,
                            batch_no + 1,
                            total_batches,
                            ok,
                            chunk.len()
                        ));
                    }
                    Err(e) => {
                        report.sub_batches_failed += 1;
                        reporter.warn(format!(
                            "Translation {} sub-batch {}/{} failed: {}; keeping original text",
                            lang,
                            batch_no + 1,
                            total_batches,
                            e
                        ));
                    }
                }
            }
        }

        Ok((results, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use vigil_core::model_client::ModelError;

    /// Echoes every numbered line back upper-cased, except indexes listed in `drop`.
    struct EchoBackend {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        drop: Vec<usize>,
        fail: bool,
    }

    impl EchoBackend {
        fn new(drop: Vec<usize>, fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
                drop,
                fail,
            }
        }
    }

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.fail {
                return Err(ModelError::Api {
                    code: 500,
                    message: "down".into(),
                });
            }
            let body = prompt.split("Messages:\n").nth(1).unwrap_or_default();
            let lines: Vec<String> = body
                .lines()
                .filter_map(|l| {
                    let (idx, text) = l.strip_prefix('[')?.split_once("] ")?;
                    let idx: usize = idx.parse().ok()?;
                    if self.drop.contains(&idx) {
                        return None;
                    }
                    Some(
                        serde_json::json!({"index": idx, "translation": text.to_uppercase()})
                            .to_string(),
                    )
                })
                .collect();
            Ok(format!("garbage line\n{}", lines.join("\n")))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_language_labels() {
        assert_eq!(language_label("en"), "English");
        assert_eq!(language_label("RU"), "Russian");
        assert_eq!(language_label("pt"), "pt");
    }

    #[test]
    fn test_parse_translations_ignores_bad_lines() {
        let raw = "{\"index\": 1, \"translation\": \"b\"}\n\
                   {\"index\": 5, \"translation\": \"x\"}\n\
                   {\"index\": 0, \"translation\": \"  \"}\n\
                   {\"index\": \"0\", \"translation\": \"a\"}\n\
                   nope";
        assert_eq!(parse_translations(raw, 2), vec![None, Some("b".to_string())]);
    }

    #[tokio::test]
    async fn test_same_language_and_undetermined_skip_the_call() {
        let backend = Arc::new(EchoBackend::new(vec![], false));
        let batcher = TranslationBatcher::new(Some(backend.clone()), "fr", 20);
        let input = texts(&["Manifestation dans la ville", "zzz qqq"]);

        let (out, report) = batcher
            .translate(&input, &RunReporter::detached(50))
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out[0].translated_text, input[0]);
        assert_eq!(out[1].translated_text, input[1]);
        assert_eq!(report.passthrough, 2);
    }

    #[tokio::test]
    async fn test_groups_by_language_and_maps_by_index() {
        let backend = Arc::new(EchoBackend::new(vec![1], false));
        let batcher = TranslationBatcher::new(Some(backend.clone()), "fr", 2);
        let input = texts(&[
            "the protest in the city",
            "the march and the police",
            "Взрыв в Киеве",
            "the end of the day",
        ]);

        let (out, report) = batcher
            .translate(&input, &RunReporter::detached(50))
            .await
            .unwrap();

        // en: 3 items in 2 sub-batches, ru: 1 sub-batch.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out[0].translated_text, "THE PROTEST IN THE CITY");
        // index 1 of the first en sub-batch was dropped by the backend.
        assert_eq!(out[1].translated_text, "the march and the police");
        assert_eq!(out[2].translated_text, "ВЗРЫВ В КИЕВЕ");
        // index 1 of the second en sub-batch does not exist; index 0 is kept.
        assert_eq!(out[3].translated_text, "THE END OF THE DAY");
        assert_eq!(report.translated, 3);

        let prompts = backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("from English to French"));
        assert!(prompts[2].contains("from Russian to French"));
    }

    #[tokio::test]
    async fn test_failed_sub_batch_keeps_original() {
        let backend = Arc::new(EchoBackend::new(vec![], true));
        let batcher = TranslationBatcher::new(Some(backend.clone()), "fr", 1);
        let input = texts(&["the protest in the city", "and the police of the town"]);

        let (out, report) = batcher
            .translate(&input, &RunReporter::detached(50))
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.sub_batches_failed, 2);
        assert_eq!(out[0].translated_text, input[0]);
        assert_eq!(out[1].translated_text, input[1]);
    }

    #[tokio::test]
    async fn test_without_backend_everything_passes_through() {
        let batcher = TranslationBatcher::new(None, "fr", 20);
        let input = texts(&["the protest in the city"]);
        let (out, _) = batcher
            .translate(&input, &RunReporter::detached(50))
            .await
            .unwrap();
        assert_eq!(out[0].translated_text, input[0]);
    }
}
