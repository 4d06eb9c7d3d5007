//! Extraction-service contract: instruction prompt, REST client, and
//! boundary validation of the returned JSON into a closed entry schema.

use async_trait::async_trait;
use chrono::NaiveDate;
use marginwatch_core::{
    AdjustmentType, CommodityTable, Confidence, MARGIN_PERCENTAGE_CAP,
};
use serde::Deserialize;
use serde_json::Value;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "marginwatch-extract";

/// Jaro-Winkler floor for accepting a near-miss commodity spelling.
pub const FUZZY_COMMODITY_THRESHOLD: f64 = 0.92;

const SOURCE_SENTENCE_MAX_CHARS: usize = 200;

/// Raw wire shape. Two grammar generations are accepted: the margin-only
/// `is_margin_notice` flag and the broader `is_relevant_notice` one.
#[derive(Debug, Clone, Deserialize)]
pub struct RawParseResponse {
    #[serde(default)]
    pub is_relevant_notice: Option<bool>,
    #[serde(default)]
    pub is_margin_notice: Option<bool>,
    #[serde(default)]
    pub announcement_type: Option<String>,
    #[serde(default)]
    pub effective_dates: Vec<RawEffectiveDate>,
    #[serde(default)]
    pub parsing_confidence: Option<String>,
    #[serde(default)]
    pub excluded_non_commodities: Vec<String>,
    #[serde(default)]
    pub is_reversion_notice: Option<bool>,
    #[serde(default)]
    pub reversion_details: Option<RawReversionDetails>,
}

impl RawParseResponse {
    pub fn is_relevant(&self) -> bool {
        self.is_relevant_notice
            .or(self.is_margin_notice)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEffectiveDate {
    pub date: String,
    #[serde(default)]
    pub date_source: Option<String>,
    #[serde(default)]
    pub entries: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReversionDetails {
    #[serde(default)]
    pub has_reversion_clause: bool,
    #[serde(default)]
    pub reversion_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarginEntry {
    pub commodity: String,
    pub hedging_percentage: f64,
    pub speculative_percentage: f64,
    pub adjustment_type: AdjustmentType,
    pub source_sentence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationalEntry {
    pub commodity: String,
    pub operation_type: String,
    pub description: String,
    pub affected_parties: Vec<String>,
    pub adjustment_type: AdjustmentType,
    pub source_sentence: String,
}

/// Closed schema the rest of the pipeline trusts.
#[derive(Debug, Clone, PartialEq)]
pub enum NoticeEntry {
    Margin(MarginEntry),
    Operational(OperationalEntry),
}

impl NoticeEntry {
    pub fn commodity(&self) -> &str {
        match self {
            NoticeEntry::Margin(entry) => &entry.commodity,
            NoticeEntry::Operational(entry) => &entry.commodity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveDateGroup {
    pub date: NaiveDate,
    pub entries: Vec<NoticeEntry>,
}

/// Validated parse result. "Not relevant" is a normal value here, never an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNotice {
    pub is_relevant: bool,
    pub announcement_type: Option<String>,
    pub effective_dates: Vec<EffectiveDateGroup>,
    pub confidence: Confidence,
    pub is_reversion: bool,
    pub has_reversion_clause: bool,
    pub reversion_text: Option<String>,
    pub excluded_non_commodities: Vec<String>,
    pub dropped_entries: Vec<String>,
}

impl ParsedNotice {
    pub fn non_relevant(confidence: Confidence) -> Self {
        Self {
            is_relevant: false,
            announcement_type: None,
            effective_dates: Vec::new(),
            confidence,
            is_reversion: false,
            has_reversion_clause: false,
            reversion_text: None,
            excluded_non_commodities: Vec::new(),
            dropped_entries: Vec::new(),
        }
    }

    pub fn latest_effective_date(&self) -> Option<NaiveDate> {
        self.effective_dates.iter().map(|group| group.date).max()
    }

    pub fn explicit_commodities_on(&self, date: NaiveDate) -> Vec<&str> {
        self.effective_dates
            .iter()
            .filter(|group| group.date == date)
            .flat_map(|group| group.entries.iter().map(NoticeEntry::commodity))
            .collect()
    }
}

/// Standardize a service-reported commodity name: excluded patterns are
/// rejected, exact aliases win, then a fuzzy pass catches near-miss
/// spellings against the canonical names.
pub fn standardize_commodity(name: &str, table: &CommodityTable) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || table.is_excluded(trimmed) {
        return None;
    }
    if let Some(canonical) = table.lookup(trimmed) {
        return Some(canonical.to_string());
    }

    let needle = trimmed.to_lowercase();
    let mut best: Option<(f64, &'static str)> = None;
    for canonical in table.universe() {
        let score = jaro_winkler(&needle, &canonical.to_lowercase());
        if score >= FUZZY_COMMODITY_THRESHOLD
            && best.map(|(b, _)| score > b).unwrap_or(true)
        {
            best = Some((score, canonical));
        }
    }
    best.map(|(_, canonical)| canonical.to_string())
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn validate_entry(value: &Value, table: &CommodityTable) -> Result<NoticeEntry, String> {
    let raw_commodity = value
        .get("commodity")
        .and_then(Value::as_str)
        .ok_or_else(|| "entry without commodity".to_string())?;
    let commodity = standardize_commodity(raw_commodity, table)
        .ok_or_else(|| format!("unknown commodity {raw_commodity:?}"))?;

    let entry_type = value.get("entry_type").and_then(Value::as_str);
    let adjustment = value
        .get("adjustment_type")
        .and_then(Value::as_str)
        .and_then(AdjustmentType::parse)
        .unwrap_or(AdjustmentType::AdjustedTo);
    let source_sentence = truncate_chars(
        value
            .get("source_sentence")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        SOURCE_SENTENCE_MAX_CHARS,
    );

    // The margin-only grammar generation carries no entry_type field.
    let is_margin = match entry_type {
        Some("margin_data") => true,
        Some("operational_data") => false,
        Some(other) => return Err(format!("unknown entry type {other:?}")),
        None if value.get("hedging_percentage").is_some() => true,
        None => return Err(format!("{commodity}: entry without type or margin data")),
    };

    if is_margin {
        let hedging = value
            .get("hedging_percentage")
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("{commodity}: margin entry without hedging percentage"))?;
        let speculative = value
            .get("speculative_percentage")
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("{commodity}: margin entry without speculative percentage"))?;
        let bounds = 0.0..=MARGIN_PERCENTAGE_CAP;
        if !bounds.contains(&hedging) || !bounds.contains(&speculative) {
            return Err(format!(
                "{commodity}: percentages {hedging}/{speculative} outside 0-{MARGIN_PERCENTAGE_CAP}"
            ));
        }
        return Ok(NoticeEntry::Margin(MarginEntry {
            commodity,
            hedging_percentage: hedging,
            speculative_percentage: speculative,
            adjustment_type: adjustment,
            source_sentence,
        }));
    }

    let affected_parties = value
        .get("affected_parties")
        .and_then(Value::as_array)
        .map(|parties| {
            parties
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(NoticeEntry::Operational(OperationalEntry {
        commodity,
        operation_type: value
            .get("operation_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: truncate_chars(
            value
                .get("operation_description")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            SOURCE_SENTENCE_MAX_CHARS,
        ),
        affected_parties,
        adjustment_type: adjustment,
        source_sentence,
    }))
}

/// Validate a raw service response into the closed schema. Invalid entries
/// are dropped individually; their siblings survive.
pub fn validate_response(raw: RawParseResponse, table: &CommodityTable) -> ParsedNotice {
    let mut effective_dates = Vec::new();
    let mut dropped = Vec::new();

    for raw_date in &raw.effective_dates {
        let Ok(date) = NaiveDate::parse_from_str(raw_date.date.trim(), "%Y-%m-%d") else {
            dropped.push(format!("unparseable effective date {:?}", raw_date.date));
            continue;
        };
        let mut entries = Vec::new();
        for value in &raw_date.entries {
            match validate_entry(value, table) {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    warn!(%date, reason, "dropping extraction entry");
                    dropped.push(reason);
                }
            }
        }
        effective_dates.push(EffectiveDateGroup { date, entries });
    }

    let confidence = raw
        .parsing_confidence
        .as_deref()
        .and_then(Confidence::parse)
        .unwrap_or(Confidence::Medium);

    let (has_clause, reversion_text) = match &raw.reversion_details {
        Some(details) => (
            details.has_reversion_clause,
            Some(details.reversion_text.clone()).filter(|t| !t.is_empty()),
        ),
        None => (false, None),
    };

    ParsedNotice {
        is_relevant: raw.is_relevant(),
        announcement_type: raw.announcement_type.clone(),
        effective_dates,
        confidence,
        is_reversion: raw.is_reversion_notice.unwrap_or(false),
        has_reversion_clause: has_clause,
        reversion_text,
        excluded_non_commodities: raw.excluded_non_commodities.clone(),
        dropped_entries: dropped,
    }
}

#[derive(Debug, Error)]
pub enum ParseServiceError {
    #[error("missing extraction service credentials: {0}")]
    Config(String),
    #[error("extraction service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("extraction service returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("extraction service returned no text candidate")]
    EmptyResponse,
    #[error("extraction service returned malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

/// The seam to the natural-language extraction service.
#[async_trait]
pub trait NoticeParser: Send + Sync {
    async fn parse(&self, title: &str, clean_text: &str) -> Result<ParsedNotice, ParseServiceError>;
}

/// Service failures are a local, recoverable condition: the notice simply
/// yielded zero records.
pub async fn parse_with_recovery(
    parser: &dyn NoticeParser,
    title: &str,
    clean_text: &str,
) -> ParsedNotice {
    match parser.parse(title, clean_text).await {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "extraction service failed; notice treated as non-relevant");
            ParsedNotice::non_relevant(Confidence::Low)
        }
    }
}

/// The fixed instruction contract sent with every notice.
pub fn instruction_prompt(title: &str, content: &str, table: &CommodityTable) -> String {
    let universe = table.universe().join(", ");
    format!(
        r#"You are an expert at parsing Shanghai Futures Exchange and Shanghai International Energy Exchange notices. Extract BOTH margin ratio data AND operational announcements that affect trading.

NOTICE TITLE: {title}

NOTICE CONTENT: {content}

PARSING RULES:

1. MARGIN ADJUSTMENT NOTICES (PRIMARY):
- "trading margin ratio and price limit range will be adjusted as follows"
- Chinese: 关于调整…保证金比例…通知
- Extract margin ratios for hedging and speculative transactions.

2. OPERATIONAL ANNOUNCEMENTS (SECONDARY):
- Warehouse capacity changes, delivery suspensions/resumptions, quality
  standard adjustments, contract modifications, storage facility approvals.

3. COMMODITY FILTERING:
- INCLUDE only these physical commodities, using these standardized names:
  {universe}
- EXCLUDE financial indices, freight/shipping indices, and non-physical
  contracts; list anything excluded in excluded_non_commodities.

4. REVERSION CLAUSES:
- Holiday notices often state that commodities not listed "revert to their
  original levels" after the holiday. Flag these with is_reversion_notice
  and quote the clause in reversion_details.reversion_text.

5. MULTI-COMMODITY SENTENCES:
- A sentence covering several commodities produces one entry per commodity,
  each quoting the same source sentence.

6. VALIDATION:
- Margin percentages must be between 0 and 20.
- Every entry must name a physical commodity from the list above.

OUTPUT FORMAT (strict JSON, nothing else):
{{
  "is_relevant_notice": true,
  "announcement_type": "margin_adjustment|warehouse_operations|delivery_operations|quality_standards|contract_modification|other",
  "effective_dates": [
    {{
      "date": "YYYY-MM-DD",
      "date_source": "exact text showing this date",
      "entries": [
        {{
          "commodity": "standardized name",
          "entry_type": "margin_data|operational_data",
          "hedging_percentage": 0,
          "speculative_percentage": 0,
          "operation_type": "warehouse_capacity|delivery_suspension|quality_change|contract_modification",
          "operation_description": "for operational entries",
          "affected_parties": ["company or facility names"],
          "adjustment_type": "adjusted_to|remains_at|restored_to_original|increased|suspended|resumed",
          "source_sentence": "exact sentence with this data"
        }}
      ]
    }}
  ],
  "is_reversion_notice": false,
  "reversion_details": {{"has_reversion_clause": false, "reversion_text": ""}},
  "parsing_confidence": "high|medium|low",
  "excluded_non_commodities": []
}}"#
    )
}

/// Pull the first JSON object out of a model reply that may carry fences or
/// prose around it.
pub fn extract_json_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// REST client for the Gemini `generateContent` endpoint.
pub struct GeminiParser {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    table: CommodityTable,
}

impl GeminiParser {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-1.5-pro".to_string(),
            table: CommodityTable::builtin(),
        }
    }

    /// Reads `GEMINI_API_KEY`, falling back to `GOOGLE_GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, ParseServiceError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_GEMINI_API_KEY"))
            .map_err(|_| {
                ParseServiceError::Config(
                    "GEMINI_API_KEY or GOOGLE_GEMINI_API_KEY not set".to_string(),
                )
            })?;
        Ok(Self::new(api_key))
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn generate(&self, prompt: &str) -> Result<String, ParseServiceError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json",
            },
        });

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ParseServiceError::Api {
                status: status.as_u16(),
                body: truncate_chars(&body, 300),
            });
        }

        let value: Value = response.json().await?;
        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ParseServiceError::EmptyResponse)
    }
}

#[async_trait]
impl NoticeParser for GeminiParser {
    async fn parse(&self, title: &str, clean_text: &str) -> Result<ParsedNotice, ParseServiceError> {
        let prompt = instruction_prompt(title, clean_text, &self.table);
        let reply = self.generate(&prompt).await?;
        let raw: RawParseResponse = serde_json::from_str(extract_json_object(&reply))?;
        let parsed = validate_response(raw, &self.table);
        debug!(
            relevant = parsed.is_relevant,
            dates = parsed.effective_dates.len(),
            dropped = parsed.dropped_entries.len(),
            "extraction service reply validated"
        );
        Ok(parsed)
    }
}

pub mod testing {
    //! Scripted parser for exercising the pipeline without a live service.

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use marginwatch_core::Confidence;

    use super::{NoticeParser, ParseServiceError, ParsedNotice};

    #[derive(Default)]
    pub struct MockParser {
        responses: Mutex<HashMap<String, ParsedNotice>>,
        failures: Mutex<HashSet<String>>,
        pub calls: AtomicUsize,
    }

    impl MockParser {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_response(self, title: impl Into<String>, parsed: ParsedNotice) -> Self {
            self.responses.lock().unwrap().insert(title.into(), parsed);
            self
        }

        pub fn with_failure(self, title: impl Into<String>) -> Self {
            self.failures.lock().unwrap().insert(title.into());
            self
        }
    }

    #[async_trait]
    impl NoticeParser for MockParser {
        async fn parse(
            &self,
            title: &str,
            _clean_text: &str,
        ) -> Result<ParsedNotice, ParseServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.lock().unwrap().contains(title) {
                return Err(ParseServiceError::EmptyResponse);
            }
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(title)
                .cloned()
                .unwrap_or_else(|| ParsedNotice::non_relevant(Confidence::Low)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CommodityTable {
        CommodityTable::builtin()
    }

    fn parse_raw(json: &str) -> RawParseResponse {
        serde_json::from_str(json).expect("valid raw response")
    }

    #[test]
    fn out_of_bound_entry_is_dropped_but_siblings_survive() {
        let raw = parse_raw(
            r#"{
                "is_relevant_notice": true,
                "effective_dates": [{
                    "date": "2025-04-29",
                    "entries": [
                        {"commodity": "Copper", "entry_type": "margin_data",
                         "hedging_percentage": 25, "speculative_percentage": 9,
                         "adjustment_type": "adjusted_to", "source_sentence": "s1"},
                        {"commodity": "Gold", "entry_type": "margin_data",
                         "hedging_percentage": 13, "speculative_percentage": 14,
                         "adjustment_type": "adjusted_to", "source_sentence": "s2"}
                    ]
                }]
            }"#,
        );
        let parsed = validate_response(raw, &table());
        assert_eq!(parsed.effective_dates.len(), 1);
        let entries = &parsed.effective_dates[0].entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].commodity(), "Gold");
        assert_eq!(parsed.dropped_entries.len(), 1);
        assert!(parsed.dropped_entries[0].contains("Copper"));
    }

    #[test]
    fn unknown_and_excluded_commodities_are_rejected() {
        let raw = parse_raw(
            r#"{
                "is_relevant_notice": true,
                "effective_dates": [{
                    "date": "2025-04-29",
                    "entries": [
                        {"commodity": "Container Shipping Index", "entry_type": "margin_data",
                         "hedging_percentage": 8, "speculative_percentage": 9},
                        {"commodity": "Moon Dust", "entry_type": "margin_data",
                         "hedging_percentage": 8, "speculative_percentage": 9}
                    ]
                }]
            }"#,
        );
        let parsed = validate_response(raw, &table());
        assert!(parsed.effective_dates[0].entries.is_empty());
        assert_eq!(parsed.dropped_entries.len(), 2);
    }

    #[test]
    fn margin_only_grammar_without_entry_type_still_parses() {
        let raw = parse_raw(
            r#"{
                "is_margin_notice": true,
                "effective_dates": [{
                    "date": "2025-03-11",
                    "entries": [
                        {"commodity": "Alumina", "hedging_percentage": 9,
                         "speculative_percentage": 10}
                    ]
                }]
            }"#,
        );
        assert!(raw.is_relevant());
        let parsed = validate_response(raw, &table());
        assert!(parsed.is_relevant);
        match &parsed.effective_dates[0].entries[0] {
            NoticeEntry::Margin(entry) => {
                assert_eq!(entry.commodity, "Alumina");
                assert_eq!(entry.adjustment_type, AdjustmentType::AdjustedTo);
            }
            other => panic!("expected margin entry, got {other:?}"),
        }
    }

    #[test]
    fn operational_entries_keep_parties_and_descriptions() {
        let raw = parse_raw(
            r#"{
                "is_relevant_notice": true,
                "announcement_type": "warehouse_operations",
                "effective_dates": [{
                    "date": "2025-04-01",
                    "entries": [
                        {"commodity": "No. 20 rubber", "entry_type": "operational_data",
                         "operation_type": "warehouse_capacity",
                         "operation_description": "increase activated storage capacity",
                         "affected_parties": ["Shandong Logistics Co."],
                         "adjustment_type": "increased",
                         "source_sentence": "…同意增加20号胶期货启用库容…"}
                    ]
                }]
            }"#,
        );
        let parsed = validate_response(raw, &table());
        match &parsed.effective_dates[0].entries[0] {
            NoticeEntry::Operational(entry) => {
                assert_eq!(entry.commodity, "Natural Rubber");
                assert_eq!(entry.operation_type, "warehouse_capacity");
                assert_eq!(entry.affected_parties, vec!["Shandong Logistics Co."]);
                assert_eq!(entry.adjustment_type, AdjustmentType::Increased);
            }
            other => panic!("expected operational entry, got {other:?}"),
        }
    }

    #[test]
    fn fuzzy_standardization_catches_near_miss_spellings() {
        let t = table();
        assert_eq!(standardize_commodity("Aluminium", &t), Some("Aluminum".into()));
        assert_eq!(standardize_commodity("Coper", &t), Some("Copper".into()));
        assert_eq!(standardize_commodity("铜", &t), Some("Copper".into()));
        assert_eq!(standardize_commodity("Moon Dust", &t), None);
        assert_eq!(standardize_commodity("stock index futures", &t), None);
    }

    #[test]
    fn unparseable_dates_drop_the_whole_group() {
        let raw = parse_raw(
            r#"{
                "is_relevant_notice": true,
                "effective_dates": [
                    {"date": "soon", "entries": []},
                    {"date": "2025-05-06", "entries": []}
                ]
            }"#,
        );
        let parsed = validate_response(raw, &table());
        assert_eq!(parsed.effective_dates.len(), 1);
        assert_eq!(
            parsed.effective_dates[0].date,
            NaiveDate::from_ymd_opt(2025, 5, 6).unwrap()
        );
        assert_eq!(parsed.dropped_entries.len(), 1);
    }

    #[test]
    fn source_sentences_truncate_to_two_hundred_chars() {
        let long = "长".repeat(500);
        let raw = parse_raw(&format!(
            r#"{{
                "is_relevant_notice": true,
                "effective_dates": [{{
                    "date": "2025-04-29",
                    "entries": [
                        {{"commodity": "Gold", "entry_type": "margin_data",
                         "hedging_percentage": 13, "speculative_percentage": 14,
                         "source_sentence": "{long}"}}
                    ]
                }}]
            }}"#
        ));
        let parsed = validate_response(raw, &table());
        match &parsed.effective_dates[0].entries[0] {
            NoticeEntry::Margin(entry) => {
                assert_eq!(entry.source_sentence.chars().count(), 200);
            }
            other => panic!("expected margin entry, got {other:?}"),
        }
    }

    #[test]
    fn json_object_is_extracted_from_fenced_replies() {
        let reply = "```json\n{\"is_relevant_notice\": false}\n```";
        assert_eq!(extract_json_object(reply), "{\"is_relevant_notice\": false}");
        assert_eq!(extract_json_object("no braces"), "no braces");
    }

    #[test]
    fn prompt_carries_the_allow_list_and_bounds() {
        let prompt = instruction_prompt("t", "c", &table());
        assert!(prompt.contains("Natural Rubber"));
        assert!(prompt.contains("between 0 and 20"));
        assert!(prompt.contains("is_reversion_notice"));
    }

    #[tokio::test]
    async fn recovery_demotes_service_failures_to_non_relevant() {
        let parser = testing::MockParser::new().with_failure("boom");
        let parsed = parse_with_recovery(&parser, "boom", "text").await;
        assert!(!parsed.is_relevant);
        assert_eq!(parsed.confidence, Confidence::Low);
    }

    #[test]
    fn reversion_details_surface_on_the_parsed_notice() {
        let raw = parse_raw(
            r#"{
                "is_relevant_notice": true,
                "is_reversion_notice": true,
                "reversion_details": {
                    "has_reversion_clause": true,
                    "reversion_text": "margin ratios will revert to their original levels"
                },
                "effective_dates": [
                    {"date": "2025-04-29", "entries": []},
                    {"date": "2025-05-06", "entries": []}
                ]
            }"#,
        );
        let parsed = validate_response(raw, &table());
        assert!(parsed.is_reversion);
        assert!(parsed.has_reversion_clause);
        assert_eq!(
            parsed.latest_effective_date(),
            NaiveDate::from_ymd_opt(2025, 5, 6)
        );
    }
}
