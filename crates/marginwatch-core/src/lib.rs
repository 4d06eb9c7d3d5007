//! Core domain model for the margin notice pipeline.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "marginwatch-core";

/// Margin percentages above this are treated as extraction noise and dropped.
pub const MARGIN_PERCENTAGE_CAP: f64 = 20.0;

/// One row of the paginated notice listing. Lives only for a traversal pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub published: NaiveDate,
    pub detail_url: String,
}

/// Visible text handed to the relevance classifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoticeContext {
    pub title: String,
    pub date_text: String,
    pub surrounding_text: String,
}

impl NoticeContext {
    pub fn from_title(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// All available text joined for body-scope pattern matching.
    pub fn combined(&self) -> String {
        [
            self.title.as_str(),
            self.date_text.as_str(),
            self.surrounding_text.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Classifier output: decision, score, and the rationale behind both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub is_interesting: bool,
    pub score: f64,
    pub reason: String,
    pub matched_signals: Vec<String>,
    pub detected_commodities: Vec<String>,
}

impl RelevanceVerdict {
    pub fn not_interesting(reason: impl Into<String>) -> Self {
        Self {
            is_interesting: false,
            score: 0.0,
            reason: reason.into(),
            matched_signals: Vec::new(),
            detected_commodities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Margin,
    Operational,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Margin => "margin",
            RecordKind::Operational => "operational",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    AdjustedTo,
    RemainsAt,
    RestoredToOriginal,
    Increased,
    Suspended,
    Resumed,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::AdjustedTo => "adjusted_to",
            AdjustmentType::RemainsAt => "remains_at",
            AdjustmentType::RestoredToOriginal => "restored_to_original",
            AdjustmentType::Increased => "increased",
            AdjustmentType::Suspended => "suspended",
            AdjustmentType::Resumed => "resumed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "adjusted_to" => Some(AdjustmentType::AdjustedTo),
            "remains_at" => Some(AdjustmentType::RemainsAt),
            "restored_to_original" => Some(AdjustmentType::RestoredToOriginal),
            "increased" => Some(AdjustmentType::Increased),
            "suspended" => Some(AdjustmentType::Suspended),
            "resumed" => Some(AdjustmentType::Resumed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingMethod {
    LlmParse,
    BaselineInference,
}

impl ParsingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParsingMethod::LlmParse => "llm_parse",
            ParsingMethod::BaselineInference => "baseline_inference",
        }
    }
}

/// Per-run uniqueness key for extracted records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub commodity: String,
    pub effective_date: NaiveDate,
    pub kind: RecordKind,
}

/// The unit of truth persisted to the dataset. Immutable once created;
/// corrections arrive as new records with a later `extracted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub notice_date: NaiveDate,
    pub title: String,
    pub source_url: String,
    pub commodity: String,
    pub kind: RecordKind,
    pub effective_date: NaiveDate,
    pub hedging_percentage: Option<f64>,
    pub speculative_percentage: Option<f64>,
    pub adjustment_type: AdjustmentType,
    pub operation_type: Option<String>,
    pub description: Option<String>,
    pub affected_parties: Vec<String>,
    pub source_sentence: String,
    pub parsing_method: ParsingMethod,
    pub confidence: Confidence,
    pub extracted_at: DateTime<Utc>,
    pub relevance: RelevanceVerdict,
    pub batch_number: u32,
}

impl ExtractedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            commodity: self.commodity.clone(),
            effective_date: self.effective_date,
            kind: self.kind,
        }
    }

    /// Both margin percentages, when present, must sit inside `[0, 20]`.
    pub fn percentages_in_bounds(&self) -> bool {
        let in_bounds = |value: Option<f64>| {
            value
                .map(|v| (0.0..=MARGIN_PERCENTAGE_CAP).contains(&v))
                .unwrap_or(true)
        };
        in_bounds(self.hedging_percentage) && in_bounds(self.speculative_percentage)
    }
}

/// Canonical commodity names with bilingual aliases, plus the non-commodity
/// patterns the exchange also lists (indices and the like) that must never
/// surface as records.
#[derive(Debug, Clone)]
pub struct CommodityTable {
    entries: Vec<(&'static str, Vec<&'static str>)>,
    excluded: Vec<&'static str>,
}

impl CommodityTable {
    pub fn builtin() -> Self {
        let entries = vec![
            ("Copper", vec!["copper", "铜", "international copper", "国际铜"]),
            ("Alumina", vec!["alumina", "氧化铝", "aluminum oxide"]),
            ("Lead", vec!["lead", "铅"]),
            ("Zinc", vec!["zinc", "锌"]),
            ("Aluminum", vec!["aluminum", "aluminium", "铝"]),
            ("Gold", vec!["gold", "黄金", "金"]),
            ("Nickel", vec!["nickel", "镍"]),
            ("Rebar", vec!["rebar", "螺纹钢", "reinforcing bar", "steel rebar"]),
            ("Pulp", vec!["pulp", "纸浆", "wood pulp", "bleached kraft pulp"]),
            (
                "Natural Rubber",
                vec!["natural rubber", "rubber", "天然橡胶", "橡胶", "no. 20 rubber", "20号胶"],
            ),
            ("Silver", vec!["silver", "白银", "银"]),
            ("Fuel Oil", vec!["fuel oil", "燃料油", "marine fuel", "bunker fuel"]),
            (
                "Petroleum Asphalt",
                vec!["petroleum asphalt", "asphalt", "石油沥青", "沥青", "bitumen"],
            ),
            ("Wire Rod", vec!["wire rod", "线材", "steel wire rod"]),
            ("Tin", vec!["tin", "锡"]),
            ("Butadiene Rubber", vec!["butadiene rubber", "丁二烯橡胶"]),
            (
                "Hot-rolled Coil",
                vec!["hot-rolled coil", "hot rolled coil", "热轧卷板", "hrc"],
            ),
            ("Stainless Steel", vec!["stainless steel", "不锈钢"]),
            ("Crude Oil", vec!["crude oil", "原油", "crude"]),
            (
                "Low-sulfur Fuel Oil",
                vec!["low-sulfur fuel oil", "low sulfur fuel oil", "低硫燃料油"],
            ),
        ];
        let excluded = vec![
            "container shipping index",
            "freight",
            "shipping",
            "csi",
            "financial index",
            "stock index",
            "index",
            "bond",
            "currency",
        ];
        Self { entries, excluded }
    }

    /// Canonical names, in table order.
    pub fn universe(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        self.entries.iter().any(|(canonical, _)| *canonical == name)
    }

    /// Exact lookup against canonical names and aliases, case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<&'static str> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|(canonical, aliases)| {
                canonical.to_lowercase() == needle || aliases.iter().any(|a| *a == needle)
            })
            .map(|(canonical, _)| *canonical)
    }

    /// True when the text names something the exchange lists but we exclude.
    pub fn is_excluded(&self, name: &str) -> bool {
        let needle = name.trim().to_lowercase();
        self.excluded.iter().any(|pat| needle.contains(pat))
    }

    /// Alias keywords for all commodities, used for keyword-density scoring.
    pub fn alias_keywords(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .flat_map(|(_, aliases)| aliases.iter().copied())
            .collect()
    }

    /// Canonical names whose alias appears in `text` (expects lowercase),
    /// in table order.
    pub fn detect_in_text(&self, text: &str) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|(_, aliases)| aliases.iter().any(|alias| contains_keyword(text, alias)))
            .map(|(canonical, _)| *canonical)
            .collect()
    }
}

/// Keyword containment for bilingual text. ASCII keywords match only at
/// word boundaries ("tin" must not hit "adjusting"); CJK keywords have no
/// word boundaries and match as substrings.
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    if !keyword.is_ascii() {
        return text.contains(keyword);
    }
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(keyword) {
        let start = search_from + offset;
        let end = start + keyword.len();
        let before_ok = text[..start]
            .chars()
            .next_back()
            .map(|c| !c.is_ascii_alphanumeric())
            .unwrap_or(true);
        let after_ok = text[end..]
            .chars()
            .next()
            .map(|c| !c.is_ascii_alphanumeric())
            .unwrap_or(true);
        if before_ok && after_ok {
            return true;
        }
        search_from = end;
    }
    false
}

/// Most recent non-holiday margin values for one commodity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub hedging: f64,
    pub speculative: f64,
    pub as_of: NaiveDate,
}

/// Commodity -> last known pre-holiday margin levels. Traversal runs newest
/// to oldest, so a seeded snapshot is what makes reversion inference work
/// before the run has observed any historical data of its own.
#[derive(Debug, Clone, Default)]
pub struct BaselineIndex {
    by_commodity: HashMap<String, Baseline>,
}

impl BaselineIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Seeded from the 2025-02-05 reference snapshot.
    pub fn seeded() -> Self {
        let as_of = NaiveDate::from_ymd_opt(2025, 2, 5).expect("valid reference date");
        let seeds: [(&str, f64, f64); 17] = [
            ("Copper", 8.0, 9.0),
            ("Aluminum", 8.0, 9.0),
            ("Zinc", 8.0, 9.0),
            ("Lead", 8.0, 9.0),
            ("Rebar", 6.0, 7.0),
            ("Hot-rolled Coil", 6.0, 7.0),
            ("Stainless Steel", 6.0, 7.0),
            ("Silver", 12.0, 13.0),
            ("Natural Rubber", 7.0, 8.0),
            ("Fuel Oil", 8.0, 9.0),
            ("Petroleum Asphalt", 8.0, 9.0),
            ("Butadiene Rubber", 8.0, 9.0),
            ("Nickel", 11.0, 12.0),
            ("Tin", 11.0, 12.0),
            ("Pulp", 7.0, 8.0),
            ("Wire Rod", 8.0, 9.0),
            ("Alumina", 8.0, 9.0),
        ];
        let mut index = Self::default();
        for (commodity, hedging, speculative) in seeds {
            index.by_commodity.insert(
                commodity.to_string(),
                Baseline {
                    hedging,
                    speculative,
                    as_of,
                },
            );
        }
        index
    }

    pub fn lookup(&self, commodity: &str) -> Option<&Baseline> {
        self.by_commodity.get(commodity)
    }

    /// Record an observed margin level. Monotonic: an older observation never
    /// replaces a newer one.
    pub fn observe(&mut self, commodity: &str, hedging: f64, speculative: f64, as_of: NaiveDate) {
        let candidate = Baseline {
            hedging,
            speculative,
            as_of,
        };
        match self.by_commodity.get(commodity) {
            Some(existing) if existing.as_of > as_of => {}
            _ => {
                self.by_commodity.insert(commodity.to_string(), candidate);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_commodity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_commodity.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_record(commodity: &str, hedging: Option<f64>, speculative: Option<f64>) -> ExtractedRecord {
        ExtractedRecord {
            notice_date: NaiveDate::from_ymd_opt(2025, 4, 25).unwrap(),
            title: "Notice on Adjusting the Margin Ratio".to_string(),
            source_url: "https://example.test/notice/1".to_string(),
            commodity: commodity.to_string(),
            kind: RecordKind::Margin,
            effective_date: NaiveDate::from_ymd_opt(2025, 4, 29).unwrap(),
            hedging_percentage: hedging,
            speculative_percentage: speculative,
            adjustment_type: AdjustmentType::AdjustedTo,
            operation_type: None,
            description: None,
            affected_parties: Vec::new(),
            source_sentence: String::new(),
            parsing_method: ParsingMethod::LlmParse,
            confidence: Confidence::High,
            extracted_at: Utc.with_ymd_and_hms(2025, 4, 25, 9, 0, 0).single().unwrap(),
            relevance: RelevanceVerdict::not_interesting("test"),
            batch_number: 1,
        }
    }

    #[test]
    fn percentage_bounds_accept_zero_and_cap() {
        assert!(mk_record("Copper", Some(0.0), Some(20.0)).percentages_in_bounds());
        assert!(mk_record("Copper", None, None).percentages_in_bounds());
        assert!(!mk_record("Copper", Some(25.0), Some(9.0)).percentages_in_bounds());
        assert!(!mk_record("Copper", Some(8.0), Some(-1.0)).percentages_in_bounds());
    }

    #[test]
    fn record_keys_distinguish_kind_and_date() {
        let margin = mk_record("Copper", Some(8.0), Some(9.0));
        let mut operational = margin.clone();
        operational.kind = RecordKind::Operational;
        assert_eq!(margin.key(), margin.clone().key());
        assert_ne!(margin.key(), operational.key());
    }

    #[test]
    fn commodity_lookup_resolves_bilingual_aliases() {
        let table = CommodityTable::builtin();
        assert_eq!(table.lookup("copper"), Some("Copper"));
        assert_eq!(table.lookup("铜"), Some("Copper"));
        assert_eq!(table.lookup("Aluminium"), Some("Aluminum"));
        assert_eq!(table.lookup("20号胶"), Some("Natural Rubber"));
        assert_eq!(table.lookup("container freight"), None);
    }

    #[test]
    fn ascii_keywords_respect_word_boundaries() {
        assert!(contains_keyword("copper futures trading", "copper"));
        assert!(!contains_keyword("notice on adjusting margins", "tin"));
        assert!(contains_keyword("tin futures", "tin"));
        assert!(contains_keyword("关于铜期货的通知", "铜"));
        assert!(contains_keyword("低硫燃料油fuel oil margin", "fuel oil"));
    }

    #[test]
    fn detection_skips_embedded_ascii_aliases() {
        let table = CommodityTable::builtin();
        let detected =
            table.detect_in_text("notice on adjusting the margin ratio of copper futures trading");
        assert_eq!(detected, vec!["Copper"]);
    }

    #[test]
    fn excluded_patterns_cover_indices() {
        let table = CommodityTable::builtin();
        assert!(table.is_excluded("Container Shipping Index"));
        assert!(table.is_excluded("stock index futures"));
        assert!(!table.is_excluded("Copper"));
    }

    #[test]
    fn baseline_updates_are_monotonic_by_date() {
        let mut index = BaselineIndex::empty();
        let feb = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
        let jan = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        index.observe("Copper", 8.0, 9.0, feb);
        index.observe("Copper", 7.0, 8.0, jan);
        let baseline = index.lookup("Copper").unwrap();
        assert_eq!((baseline.hedging, baseline.speculative), (8.0, 9.0));
        assert_eq!(baseline.as_of, feb);

        let mar = NaiveDate::from_ymd_opt(2025, 3, 11).unwrap();
        index.observe("Copper", 9.0, 10.0, mar);
        assert_eq!(index.lookup("Copper").unwrap().as_of, mar);
    }

    #[test]
    fn seeded_index_matches_reference_snapshot() {
        let index = BaselineIndex::seeded();
        let copper = index.lookup("Copper").unwrap();
        assert_eq!((copper.hedging, copper.speculative), (8.0, 9.0));
        let silver = index.lookup("Silver").unwrap();
        assert_eq!((silver.hedging, silver.speculative), (12.0, 13.0));
        assert!(index.lookup("Gold").is_none());
        assert_eq!(index.len(), 17);
    }
}
