//! Deterministic relevance scoring over declarative signal-rule tables.

use chrono::{Datelike, Utc};
use marginwatch_core::{contains_keyword, CommodityTable, NoticeContext, RelevanceVerdict};
use regex::Regex;
use thiserror::Error;

pub const CRATE_NAME: &str = "marginwatch-classify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    Title,
    Anywhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCategory {
    MarginPrimary,
    Operational,
    Holiday,
    Exclusion,
    StrictExclusion,
}

/// One scoring rule. Within a category the first matching rule wins, and
/// title-scope rules are listed ahead of body-scope rules.
#[derive(Debug, Clone, Copy)]
pub struct SignalRule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub scope: SignalScope,
    pub weight: f64,
    pub category: SignalCategory,
}

const MARGIN_PRIMARY_RULES: [SignalRule; 5] = [
    SignalRule {
        name: "margin_adjustment_primary",
        pattern: "notice on adjusting the margin ratio and price limits",
        scope: SignalScope::Anywhere,
        weight: 25.0,
        category: SignalCategory::MarginPrimary,
    },
    SignalRule {
        name: "margin_adjustment_primary",
        pattern: "关于调整.*保证金比例.*涨跌停板.*通知",
        scope: SignalScope::Anywhere,
        weight: 25.0,
        category: SignalCategory::MarginPrimary,
    },
    SignalRule {
        name: "margin_adjustment_primary",
        pattern: "关于调整.*保证金比例.*通知",
        scope: SignalScope::Anywhere,
        weight: 25.0,
        category: SignalCategory::MarginPrimary,
    },
    SignalRule {
        name: "margin_adjustment_primary",
        pattern: "调整.*保证金比例.*涨跌停板",
        scope: SignalScope::Anywhere,
        weight: 25.0,
        category: SignalCategory::MarginPrimary,
    },
    SignalRule {
        name: "margin_adjustment_primary",
        pattern: "调整.*交易保证金.*通知",
        scope: SignalScope::Anywhere,
        weight: 25.0,
        category: SignalCategory::MarginPrimary,
    },
];

const OPERATIONAL_PATTERNS: [&str; 9] = [
    "关于同意.*增加.*库容.*公告",
    "关于同意.*启用.*库容.*公告",
    "关于暂停.*交割.*公告",
    "关于恢复.*交割.*公告",
    "关于.*品质.*标准.*调整.*公告",
    "关于.*合约.*修改.*公告",
    "warehouse.*capacity.*increase",
    "delivery.*suspend",
    "quality.*standard.*adjust",
];

const HOLIDAY_PATTERN: &str = "labor day|national day|spring festival|dragon boat|mid-autumn|new year|holiday|劳动节|国庆|春节|端午|中秋|元旦|假期|休市";

const EXCLUSION_RULES: [SignalRule; 5] = [
    SignalRule {
        name: "excluded_brand_registration",
        pattern: "品牌.*注册|brand registration",
        scope: SignalScope::Title,
        weight: -10.0,
        category: SignalCategory::Exclusion,
    },
    SignalRule {
        name: "excluded_public_consultation",
        pattern: "征求意见|public consultation|soliciting.*comments",
        scope: SignalScope::Title,
        weight: -8.0,
        category: SignalCategory::Exclusion,
    },
    SignalRule {
        name: "excluded_personnel_appointment",
        pattern: "人事.*任免|personnel (appointment|change)",
        scope: SignalScope::Title,
        weight: -12.0,
        category: SignalCategory::Exclusion,
    },
    SignalRule {
        name: "excluded_registration_cancellation",
        pattern: "注销.*注册.*资质|cancel.*registration",
        scope: SignalScope::Title,
        weight: -5.0,
        category: SignalCategory::Exclusion,
    },
    SignalRule {
        name: "excluded_meeting_minutes",
        pattern: "会议.*纪要|meeting minutes",
        scope: SignalScope::Title,
        weight: -5.0,
        category: SignalCategory::Exclusion,
    },
];

const STRICT_EXCLUSION_RULES: [SignalRule; 1] = [SignalRule {
    name: "excluded_warehouse_delivery_strict",
    pattern: "库容|仓储|交割|warehouse|storage|delivery",
    scope: SignalScope::Title,
    weight: -8.0,
    category: SignalCategory::StrictExclusion,
}];

const RUBBER_KEYWORDS: [&str; 5] = ["橡胶", "rubber", "20号胶", "no. 20 rubber", "天然橡胶"];
const PETROLEUM_KEYWORDS: [&str; 4] = ["petroleum", "石油", "原油", "crude oil"];
const BITUMEN_KEYWORDS: [&str; 4] = ["bitumen", "沥青", "石油沥青", "asphalt"];
const WAREHOUSE_CONTEXT_KEYWORDS: [&str; 2] = ["库容", "warehouse"];

const TRADING_OPS_KEYWORDS: [&str; 15] = [
    "库容",
    "warehouse",
    "storage",
    "交割",
    "delivery",
    "启用",
    "activate",
    "暂停",
    "suspend",
    "恢复",
    "resume",
    "增加",
    "increase",
    "调整",
    "adjust",
];

const EXCHANGE_PATTERN: &str =
    "上海期货交易所|上海国际能源交易中心|shanghai futures exchange|shanghai international energy exchange|\\b(shfe|ine)\\b";

/// Minimal commodity vocabulary for the low-score fallback; deliberately
/// broader than the standardization table (generic words like "futures").
const FALLBACK_COMMODITY_KEYWORDS: [&str; 26] = [
    "copper",
    "aluminum",
    "zinc",
    "lead",
    "nickel",
    "tin",
    "gold",
    "silver",
    "rubber",
    "oil",
    "steel",
    "pulp",
    "futures",
    "铜",
    "铝",
    "锌",
    "铅",
    "镍",
    "锡",
    "金",
    "银",
    "橡胶",
    "油",
    "钢",
    "纸浆",
    "期货",
];

/// The two named policies differ only in threshold, which signal buckets are
/// weighted, and exclusion severity.
#[derive(Debug, Clone, Copy)]
pub struct ScoringPolicy {
    pub name: &'static str,
    pub threshold: f64,
    pub operational_signals: bool,
    pub holiday_signals: bool,
    pub strict_exclusions: bool,
    pub exclusion_multiplier: f64,
    pub commodity_fallback_score: f64,
}

/// Lower threshold, operational and holiday buckets active.
pub fn broad_policy() -> ScoringPolicy {
    ScoringPolicy {
        name: "broad",
        threshold: 3.0,
        operational_signals: true,
        holiday_signals: true,
        strict_exclusions: false,
        exclusion_multiplier: 1.0,
        commodity_fallback_score: 2.0,
    }
}

/// Margin-only: higher threshold, operational buckets off, heavier exclusions.
pub fn strict_policy() -> ScoringPolicy {
    ScoringPolicy {
        name: "strict",
        threshold: 10.0,
        operational_signals: false,
        holiday_signals: false,
        strict_exclusions: true,
        exclusion_multiplier: 1.5,
        commodity_fallback_score: 2.0,
    }
}

pub fn policy_by_name(name: &str) -> Option<ScoringPolicy> {
    match name {
        "broad" => Some(broad_policy()),
        "strict" => Some(strict_policy()),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid signal pattern for {name}: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
struct CompiledRule {
    name: &'static str,
    regex: Regex,
    scope: SignalScope,
    weight: f64,
}

fn compile(rules: &[SignalRule]) -> Result<Vec<CompiledRule>, ClassifyError> {
    rules
        .iter()
        .map(|rule| {
            Regex::new(rule.pattern)
                .map(|regex| CompiledRule {
                    name: rule.name,
                    regex,
                    scope: rule.scope,
                    weight: rule.weight,
                })
                .map_err(|source| ClassifyError::InvalidPattern {
                    name: rule.name,
                    source,
                })
        })
        .collect()
}

fn operational_rules() -> Vec<SignalRule> {
    let mut rules = Vec::with_capacity(OPERATIONAL_PATTERNS.len() * 2);
    for pattern in OPERATIONAL_PATTERNS {
        rules.push(SignalRule {
            name: "operational_announcement_title",
            pattern,
            scope: SignalScope::Title,
            weight: 12.0,
            category: SignalCategory::Operational,
        });
    }
    for pattern in OPERATIONAL_PATTERNS {
        rules.push(SignalRule {
            name: "operational_announcement_context",
            pattern,
            scope: SignalScope::Anywhere,
            weight: 6.0,
            category: SignalCategory::Operational,
        });
    }
    rules
}

/// True when the text references a holiday period or market closure.
pub fn mentions_holiday(text: &str) -> bool {
    let regex = Regex::new(HOLIDAY_PATTERN).expect("valid holiday pattern");
    regex.is_match(&text.to_lowercase())
}

/// Side-effect-free scorer. Identical input always yields an identical
/// verdict; the recency bucket is pinned to `reference_year` at construction.
pub struct Classifier {
    policy: ScoringPolicy,
    primary: Vec<CompiledRule>,
    operational: Vec<CompiledRule>,
    exclusions: Vec<CompiledRule>,
    strict_exclusions: Vec<CompiledRule>,
    holiday: Regex,
    exchange: Regex,
    commodities: CommodityTable,
    reference_year: i32,
}

impl Classifier {
    pub fn new(policy: ScoringPolicy) -> Result<Self, ClassifyError> {
        Ok(Self {
            policy,
            primary: compile(&MARGIN_PRIMARY_RULES)?,
            operational: compile(&operational_rules())?,
            exclusions: compile(&EXCLUSION_RULES)?,
            strict_exclusions: compile(&STRICT_EXCLUSION_RULES)?,
            holiday: Regex::new(HOLIDAY_PATTERN).map_err(|source| {
                ClassifyError::InvalidPattern {
                    name: "holiday_period",
                    source,
                }
            })?,
            exchange: Regex::new(EXCHANGE_PATTERN).map_err(|source| {
                ClassifyError::InvalidPattern {
                    name: "official_exchange",
                    source,
                }
            })?,
            commodities: CommodityTable::builtin(),
            reference_year: Utc::now().year(),
        })
    }

    pub fn with_reference_year(mut self, year: i32) -> Self {
        self.reference_year = year;
        self
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn classify(&self, context: &NoticeContext) -> RelevanceVerdict {
        let title = context.title.trim().to_lowercase();
        if title.is_empty() {
            return RelevanceVerdict::not_interesting("no title found");
        }
        let combined = context.combined().to_lowercase();

        let mut score = 0.0;
        let mut signals: Vec<String> = Vec::new();
        let mut detected: Vec<String> = Vec::new();

        for rule in &self.primary {
            if rule.regex.is_match(&combined) {
                score += rule.weight;
                signals.push(rule.name.to_string());
                break;
            }
        }

        if self.policy.operational_signals {
            for rule in &self.operational {
                let haystack = match rule.scope {
                    SignalScope::Title => &title,
                    SignalScope::Anywhere => &combined,
                };
                if rule.regex.is_match(haystack) {
                    score += rule.weight;
                    signals.push(rule.name.to_string());
                    break;
                }
            }
        }

        for rule in &self.exclusions {
            if rule.regex.is_match(&title) {
                score += rule.weight * self.policy.exclusion_multiplier;
                signals.push(rule.name.to_string());
                break;
            }
        }
        if self.policy.strict_exclusions {
            for rule in &self.strict_exclusions {
                if rule.regex.is_match(&title) {
                    score += rule.weight;
                    signals.push(rule.name.to_string());
                    break;
                }
            }
        }

        if self.policy.holiday_signals && self.holiday.is_match(&combined) {
            score += 5.0;
            signals.push("holiday_period".to_string());
        }

        for canonical in self.commodities.detect_in_text(&combined) {
            detected.push(canonical.to_string());
        }
        score += self.commodity_bonus(&combined, &detected, &mut signals);

        if self.policy.operational_signals {
            let ops_hits = TRADING_OPS_KEYWORDS
                .iter()
                .filter(|kw| combined.contains(*kw))
                .count();
            if ops_hits > 0 {
                score += ops_hits.min(4) as f64;
                signals.push(format!("trading_operations:{ops_hits}"));
            }
        }

        if self.exchange.is_match(&combined) {
            score += 2.0;
            signals.push("official_exchange_announcement".to_string());
        }

        for year in (self.reference_year - 1)..=(self.reference_year + 1) {
            if combined.contains(&year.to_string()) {
                score += 1.0;
                signals.push(format!("recent_year:{year}"));
                break;
            }
        }

        let mut is_interesting = score >= self.policy.threshold;

        // Short or ambiguous titles can score near zero even when they plainly
        // name a commodity; a title-level commodity keyword floors the verdict.
        if !is_interesting && score < 1.0 && self.title_names_commodity(&title) {
            is_interesting = true;
            score = score.max(self.policy.commodity_fallback_score);
            signals.push("commodity_fallback".to_string());
        }

        let detail = if signals.is_empty() {
            "no relevant patterns".to_string()
        } else {
            signals.join(", ")
        };
        let reason = if is_interesting {
            format!("relevant (score {score:.1}): {detail}")
        } else {
            format!("filtered out (score {score:.1}): {detail}")
        };

        RelevanceVerdict {
            is_interesting,
            score,
            reason,
            matched_signals: signals,
            detected_commodities: detected,
        }
    }

    fn commodity_bonus(
        &self,
        combined: &str,
        detected: &[String],
        signals: &mut Vec<String>,
    ) -> f64 {
        if RUBBER_KEYWORDS.iter().any(|kw| contains_keyword(combined, kw)) {
            if WAREHOUSE_CONTEXT_KEYWORDS
                .iter()
                .any(|kw| contains_keyword(combined, kw))
            {
                signals.push("rubber_warehouse_announcement".to_string());
                return 8.0;
            }
            signals.push("rubber_announcement".to_string());
            return 5.0;
        }
        if PETROLEUM_KEYWORDS.iter().any(|kw| contains_keyword(combined, kw)) {
            signals.push("petroleum_announcement".to_string());
            return 6.0;
        }
        if BITUMEN_KEYWORDS.iter().any(|kw| contains_keyword(combined, kw)) {
            signals.push("bitumen_announcement".to_string());
            return 6.0;
        }
        if !detected.is_empty() {
            let count = detected.len();
            signals.push(format!("commodity_keywords:{count}"));
            return ((count * 2).min(6)) as f64;
        }
        0.0
    }

    fn title_names_commodity(&self, title: &str) -> bool {
        FALLBACK_COMMODITY_KEYWORDS
            .iter()
            .any(|keyword| contains_keyword(title, keyword))
    }
}
