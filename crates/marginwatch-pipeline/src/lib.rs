//! Run orchestration: the pagination state machine, the per-notice
//! processing chain, reversion inference, and the flush-on-every-exit
//! guarantees that make crashes lossless.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use marginwatch_browser::{
    classify_browser_error, fetch_detail_text, looks_like_dead_session, parse_listing_rows,
    parse_notice_date, resolve_detail_url, DetailContent, DetailFetchConfig, SessionDisposition,
    SessionFactory, SessionManager, SessionProfile, NEXT_PAGE_SELECTORS,
};
use marginwatch_classify::{broad_policy, mentions_holiday, policy_by_name, Classifier, ScoringPolicy};
use marginwatch_core::{
    AdjustmentType, BaselineIndex, CommodityTable, Confidence, ExtractedRecord, Notice,
    NoticeContext, ParsingMethod, RecordKey, RecordKind, RelevanceVerdict,
};
use marginwatch_extract::{parse_with_recovery, NoticeEntry, NoticeParser, ParsedNotice};
use marginwatch_store::{BatchEngine, DatasetExporter, ExportConfig, IncrementalLog};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marginwatch-pipeline";

/// Validation thresholds for reversion inference. The heuristics are
/// approximate, so they are configuration, not contracts.
#[derive(Debug, Clone)]
pub struct ReversionConfig {
    pub max_explicit_commodities: usize,
    pub require_holiday_context: bool,
}

impl Default for ReversionConfig {
    fn default() -> Self {
        Self {
            max_explicit_commodities: 5,
            require_holiday_context: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub listing_url: String,
    pub dataset_name: String,
    pub source_name: String,
    pub output_dir: PathBuf,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub policy_name: String,
    pub batch_size: usize,
    pub max_pages: usize,
    pub max_consecutive_empty_pages: usize,
    pub initial_load_attempts: usize,
    pub detail: DetailFetchConfig,
    pub profile: SessionProfile,
    pub reversion: ReversionConfig,
    pub seed_baselines: bool,
}

impl RunConfig {
    pub fn from_env() -> Self {
        let today = Utc::now().date_naive();
        let start_date = std::env::var("MARGINWATCH_START_DATE")
            .ok()
            .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok())
            .unwrap_or_else(|| today.checked_sub_days(Days::new(30)).unwrap_or(today));

        let mut profile = SessionProfile::default();
        profile.user_agent = std::env::var("MARGINWATCH_USER_AGENT").ok();

        Self {
            listing_url: std::env::var("MARGINWATCH_LISTING_URL")
                .unwrap_or_else(|_| "https://www.shfe.com.cn/publicnotice/notice/".to_string()),
            dataset_name: std::env::var("MARGINWATCH_DATASET")
                .unwrap_or_else(|_| "SHFEMR".to_string()),
            source_name: "Shanghai Futures Exchange".to_string(),
            output_dir: std::env::var("MARGINWATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./marginwatch_output")),
            start_date,
            end_date: today,
            policy_name: std::env::var("MARGINWATCH_POLICY")
                .unwrap_or_else(|_| "broad".to_string()),
            batch_size: std::env::var("MARGINWATCH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_pages: 30,
            max_consecutive_empty_pages: 5,
            initial_load_attempts: 3,
            detail: DetailFetchConfig::default(),
            profile,
            reversion: ReversionConfig::default(),
            seed_baselines: std::env::var("MARGINWATCH_SEED_BASELINES")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }

    pub fn policy(&self) -> ScoringPolicy {
        policy_by_name(&self.policy_name).unwrap_or_else(broad_policy)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(policy) = overrides.policy {
            self.policy_name = policy;
        }
        if let Some(batch_size) = overrides.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(max_pages) = overrides.max_pages {
            self.max_pages = max_pages;
        }
        if let Some(empty) = overrides.max_consecutive_empty_pages {
            self.max_consecutive_empty_pages = empty;
        }
        if let Some(reversion) = overrides.reversion {
            if let Some(max) = reversion.max_explicit_commodities {
                self.reversion.max_explicit_commodities = max;
            }
            if let Some(require) = reversion.require_holiday_context {
                self.reversion.require_holiday_context = require;
            }
        }
    }

    pub fn load_overrides_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let overrides: ConfigOverrides =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        self.apply_overrides(overrides);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub max_consecutive_empty_pages: Option<usize>,
    #[serde(default)]
    pub reversion: Option<ReversionOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReversionOverrides {
    #[serde(default)]
    pub max_explicit_commodities: Option<usize>,
    #[serde(default)]
    pub require_holiday_context: Option<bool>,
}

/// "Ran and found nothing" is a status of its own, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    NoData,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::NoData => "no_data",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub pages_processed: usize,
    pub notices_processed: usize,
    pub notices_filtered: usize,
    pub records_saved: usize,
    pub batches_flushed: u32,
    pub incremental_log: PathBuf,
    pub archive: Option<PathBuf>,
    pub failure: Option<String>,
}

#[derive(Debug, Default)]
struct RunStats {
    pages_processed: usize,
    notices_processed: usize,
    notices_filtered: usize,
    interrupted: bool,
}

fn contains_reversion_phrase(text: &str) -> bool {
    let pattern = "revert to (their |the )?original|restored? to (the )?original|恢复.*原|恢复至调整前";
    let regex = Regex::new(pattern).expect("valid reversion pattern");
    regex.is_match(&text.to_lowercase())
}

/// The single logical worker driving the whole crawl-filter-extract-persist
/// chain. All run-scoped mutable state lives here, never in globals.
pub struct NoticePipeline {
    config: RunConfig,
    sessions: SessionManager,
    classifier: Classifier,
    parser: Box<dyn NoticeParser>,
    engine: BatchEngine,
    baselines: BaselineIndex,
    table: CommodityTable,
    cancel: CancellationToken,
}

impl NoticePipeline {
    pub fn new(
        config: RunConfig,
        factory: Box<dyn SessionFactory>,
        parser: Box<dyn NoticeParser>,
    ) -> Result<Self> {
        let classifier = Classifier::new(config.policy()).context("compiling signal rules")?;
        let log_name = format!(
            "{}_incremental_{}.csv",
            config.dataset_name,
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let log = IncrementalLog::create(config.output_dir.join(log_name))?;
        let exporter = DatasetExporter::new(ExportConfig {
            dataset_name: config.dataset_name.clone(),
            source_name: config.source_name.clone(),
            output_dir: config.output_dir.clone(),
        });
        let engine = BatchEngine::new(log, exporter, config.batch_size);
        let baselines = if config.seed_baselines {
            BaselineIndex::seeded()
        } else {
            BaselineIndex::empty()
        };
        let sessions = SessionManager::new(factory, config.profile.clone());

        Ok(Self {
            config,
            sessions,
            classifier,
            parser,
            engine,
            baselines,
            table: CommodityTable::builtin(),
            cancel: CancellationToken::new(),
        })
    }

    /// Cancelling this token stops the run before the next notice or page,
    /// after a forced flush.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run to completion. Never panics outward: every exit path, including
    /// errors, force-flushes before the summary is built.
    pub async fn run_once(mut self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            policy = self.config.policy_name,
            start = %self.config.start_date,
            end = %self.config.end_date,
            "starting notice pipeline run"
        );

        let mut stats = RunStats::default();
        let outcome = self.run_inner(&mut stats).await;

        if let Err(err) = &outcome {
            error!(error = %format!("{err:#}"), "run failed; preserving partial dataset");
        }

        // The terminal flush: nothing added before this point can be lost.
        let archive = match self.engine.finalize() {
            Ok(archive) => archive,
            Err(err) => {
                error!(error = %format!("{err:#}"), "final flush failed");
                None
            }
        };

        let status = match (&outcome, stats.interrupted, self.engine.total_saved()) {
            (Err(_), _, _) => RunStatus::Failed,
            (Ok(()), true, _) => RunStatus::Interrupted,
            (Ok(()), false, 0) => RunStatus::NoData,
            (Ok(()), false, _) => RunStatus::Success,
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            pages_processed: stats.pages_processed,
            notices_processed: stats.notices_processed,
            notices_filtered: stats.notices_filtered,
            records_saved: self.engine.total_saved(),
            batches_flushed: self.engine.batches_flushed(),
            incremental_log: self.engine.log_path().to_path_buf(),
            archive: archive.map(|a| a.zip_path),
            failure: outcome.err().map(|err| format!("{err:#}")),
        };
        info!(
            status = summary.status.as_str(),
            records = summary.records_saved,
            pages = summary.pages_processed,
            "notice pipeline run finished"
        );
        summary
    }

    async fn run_inner(&mut self, stats: &mut RunStats) -> Result<()> {
        self.load_initial_listing().await?;
        let mut consecutive_empty = 0usize;

        for page_number in 1..=self.config.max_pages {
            if self.cancel.is_cancelled() {
                stats.interrupted = true;
                info!("interrupt requested; stopping before next page");
                break;
            }
            stats.pages_processed = page_number;

            match self.process_listing_page(page_number, stats).await {
                Ok(processed) => {
                    if processed == 0 {
                        consecutive_empty += 1;
                    } else {
                        consecutive_empty = 0;
                    }
                    if consecutive_empty > self.config.max_consecutive_empty_pages {
                        info!(consecutive_empty, "stopping after consecutive empty pages");
                        break;
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(page = page_number, error = %message, "page-level failure; forcing flush");
                    self.engine
                        .flush(true)
                        .context("emergency flush after page failure")?;
                    if looks_like_dead_session(&message) {
                        warn!("session appears unrecoverable; ending run with what we have");
                        break;
                    }
                    continue;
                }
            }

            if stats.interrupted {
                break;
            }
            if !self.advance_page().await {
                info!("no next-page control; traversal complete");
                break;
            }
        }
        Ok(())
    }

    async fn load_initial_listing(&mut self) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 0..self.config.initial_load_attempts.max(1) {
            match self
                .sessions
                .ensure_usable(Some(&self.config.listing_url))
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    warn!(attempt, error = %err, "initial listing load failed");
                    last_error = err.to_string();
                    self.sessions.invalidate().await;
                }
            }
        }
        anyhow::bail!("could not load initial listing page: {last_error}")
    }

    async fn process_listing_page(
        &mut self,
        page_number: usize,
        stats: &mut RunStats,
    ) -> Result<usize> {
        let html = {
            let session = self
                .sessions
                .ensure_usable(Some(&self.config.listing_url))
                .await?;
            session.page_source().await?
        };

        let rows = parse_listing_rows(&html);
        if rows.is_empty() {
            warn!(page_number, "no notice rows found on listing page");
            return Ok(0);
        }
        info!(page_number, rows = rows.len(), "scanning listing page");

        let mut processed = 0usize;
        for row in rows {
            if self.cancel.is_cancelled() {
                stats.interrupted = true;
                info!("interrupt requested; stopping before next notice");
                break;
            }

            let Some(published) = parse_notice_date(&row.date_text) else {
                debug!(title = %row.title, "row without a parseable date");
                continue;
            };
            // Cheap short-circuit: out-of-window rows never reach the classifier.
            if published < self.config.start_date || published > self.config.end_date {
                continue;
            }

            let context = NoticeContext {
                title: row.title.clone(),
                date_text: row.date_text.clone(),
                surrounding_text: row.context_text.clone(),
            };
            let verdict = self.classifier.classify(&context);
            if !verdict.is_interesting {
                stats.notices_filtered += 1;
                debug!(title = %row.title, reason = %verdict.reason, "filtered out");
                continue;
            }

            let notice = Notice {
                title: row.title,
                published,
                detail_url: resolve_detail_url(&self.config.listing_url, &row.href),
            };
            processed += 1;
            stats.notices_processed += 1;
            info!(title = %notice.title, score = verdict.score, "processing notice");

            match self.process_notice(&notice, &verdict).await {
                Ok(0) => {}
                Ok(count) => info!(records = count, "notice yielded records"),
                Err(err) => {
                    // One bad notice never aborts the page.
                    warn!(title = %notice.title, error = %format!("{err:#}"), "notice failed; continuing");
                }
            }
        }
        Ok(processed)
    }

    async fn advance_page(&mut self) -> bool {
        let session = match self
            .sessions
            .ensure_usable(Some(&self.config.listing_url))
            .await
        {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "cannot reacquire session to advance pages");
                return false;
            }
        };
        for selector in NEXT_PAGE_SELECTORS {
            match session.click(selector).await {
                Ok(true) => return true,
                Ok(false) => continue,
                Err(err) => {
                    warn!(selector, error = %err, "next-page click failed");
                    return false;
                }
            }
        }
        false
    }

    async fn process_notice(
        &mut self,
        notice: &Notice,
        verdict: &RelevanceVerdict,
    ) -> Result<usize> {
        let detail = self.config.detail.clone();
        let mut recovered = false;
        let content = loop {
            let session = self
                .sessions
                .ensure_usable(Some(&self.config.listing_url))
                .await?;
            match fetch_detail_text(session, &notice.detail_url, &detail).await {
                Ok(content) => break content,
                Err(err)
                    if !recovered
                        && classify_browser_error(&err) == SessionDisposition::SessionLost =>
                {
                    // Re-invoke the step once after recovering the session.
                    warn!(error = %err, "session lost mid-fetch; recovering and retrying");
                    recovered = true;
                    self.sessions.invalidate().await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        let clean = match content {
            DetailContent::Text(text) => text,
            DetailContent::Skipped(reason) => {
                info!(%reason, "detail page skipped");
                return Ok(0);
            }
        };

        let parsed = parse_with_recovery(self.parser.as_ref(), &notice.title, &clean).await;
        if !parsed.is_relevant {
            debug!("not a relevant trading announcement");
            return Ok(0);
        }

        let mut saved = self.accept_entries(notice, verdict, &parsed)?;
        if self.is_valid_reversion(&parsed, &notice.title) {
            saved += self.resolve_reversions(notice, verdict, &parsed)?;
        }
        Ok(saved)
    }

    fn accept_entries(
        &mut self,
        notice: &Notice,
        verdict: &RelevanceVerdict,
        parsed: &ParsedNotice,
    ) -> Result<usize> {
        let extracted_at = Utc::now();
        // Holiday-period levels are temporary; they must not become baselines.
        let holiday_context = parsed.is_reversion || mentions_holiday(&notice.title);
        let mut saved = 0usize;

        for group in &parsed.effective_dates {
            for entry in &group.entries {
                let record = match entry {
                    NoticeEntry::Margin(margin) => ExtractedRecord {
                        notice_date: notice.published,
                        title: notice.title.clone(),
                        source_url: notice.detail_url.clone(),
                        commodity: margin.commodity.clone(),
                        kind: RecordKind::Margin,
                        effective_date: group.date,
                        hedging_percentage: Some(margin.hedging_percentage),
                        speculative_percentage: Some(margin.speculative_percentage),
                        adjustment_type: margin.adjustment_type,
                        operation_type: None,
                        description: None,
                        affected_parties: Vec::new(),
                        source_sentence: margin.source_sentence.clone(),
                        parsing_method: ParsingMethod::LlmParse,
                        confidence: parsed.confidence,
                        extracted_at,
                        relevance: verdict.clone(),
                        batch_number: 0,
                    },
                    NoticeEntry::Operational(operational) => ExtractedRecord {
                        notice_date: notice.published,
                        title: notice.title.clone(),
                        source_url: notice.detail_url.clone(),
                        commodity: operational.commodity.clone(),
                        kind: RecordKind::Operational,
                        effective_date: group.date,
                        hedging_percentage: None,
                        speculative_percentage: None,
                        adjustment_type: operational.adjustment_type,
                        operation_type: Some(operational.operation_type.clone()),
                        description: Some(operational.description.clone()),
                        affected_parties: operational.affected_parties.clone(),
                        source_sentence: operational.source_sentence.clone(),
                        parsing_method: ParsingMethod::LlmParse,
                        confidence: parsed.confidence,
                        extracted_at,
                        relevance: verdict.clone(),
                        batch_number: 0,
                    },
                };

                let key = record.key();
                if self.engine.contains_key(&key) {
                    warn!(
                        commodity = %key.commodity,
                        date = %key.effective_date,
                        "skipping duplicate record key"
                    );
                    continue;
                }

                if let NoticeEntry::Margin(margin) = entry {
                    if !holiday_context
                        && matches!(
                            margin.adjustment_type,
                            AdjustmentType::AdjustedTo | AdjustmentType::RemainsAt
                        )
                    {
                        self.baselines.observe(
                            &margin.commodity,
                            margin.hedging_percentage,
                            margin.speculative_percentage,
                            group.date,
                        );
                    }
                }

                self.engine.add(record)?;
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Conservative validation before inferring anything: the parser flag
    /// alone is not trusted.
    fn is_valid_reversion(&self, parsed: &ParsedNotice, title: &str) -> bool {
        if !parsed.is_reversion || !parsed.has_reversion_clause {
            return false;
        }
        let Some(text) = &parsed.reversion_text else {
            return false;
        };
        if !contains_reversion_phrase(text) {
            debug!("reversion flag without a genuine reversion phrase");
            return false;
        }
        if self.config.reversion.require_holiday_context && !mentions_holiday(title) {
            debug!("reversion notice without holiday context; rejecting");
            return false;
        }

        let distinct_dates: BTreeSet<NaiveDate> =
            parsed.effective_dates.iter().map(|g| g.date).collect();
        if distinct_dates.len() >= 2 {
            return true;
        }
        let Some(target) = parsed.latest_effective_date() else {
            return false;
        };
        parsed.explicit_commodities_on(target).len()
            <= self.config.reversion.max_explicit_commodities
    }

    /// Synthesize `restored_to_original` records for every tracked commodity
    /// the notice leaves implicit on the reversion date. A commodity with no
    /// baseline is skipped, never fabricated; existing keys are never
    /// overwritten.
    fn resolve_reversions(
        &mut self,
        notice: &Notice,
        verdict: &RelevanceVerdict,
        parsed: &ParsedNotice,
    ) -> Result<usize> {
        let Some(target) = parsed.latest_effective_date() else {
            return Ok(0);
        };
        let explicit: HashSet<&str> = parsed.explicit_commodities_on(target).into_iter().collect();
        let clause: String = parsed
            .reversion_text
            .clone()
            .unwrap_or_default()
            .chars()
            .take(200)
            .collect();
        let extracted_at = Utc::now();
        let mut inferred = 0usize;

        for commodity in self.table.universe() {
            if explicit.contains(commodity) {
                continue;
            }
            let Some(baseline) = self.baselines.lookup(commodity) else {
                debug!(commodity, "no baseline known; skipping reversion inference");
                continue;
            };
            let key = RecordKey {
                commodity: commodity.to_string(),
                effective_date: target,
                kind: RecordKind::Margin,
            };
            if self.engine.contains_key(&key) {
                continue;
            }

            let record = ExtractedRecord {
                notice_date: notice.published,
                title: notice.title.clone(),
                source_url: notice.detail_url.clone(),
                commodity: commodity.to_string(),
                kind: RecordKind::Margin,
                effective_date: target,
                hedging_percentage: Some(baseline.hedging),
                speculative_percentage: Some(baseline.speculative),
                adjustment_type: AdjustmentType::RestoredToOriginal,
                operation_type: None,
                description: None,
                affected_parties: Vec::new(),
                source_sentence: clause.clone(),
                parsing_method: ParsingMethod::BaselineInference,
                confidence: Confidence::Medium,
                extracted_at,
                relevance: verdict.clone(),
                batch_number: 0,
            };
            let (hedging, speculative, as_of) =
                (baseline.hedging, baseline.speculative, baseline.as_of);
            self.engine.add(record)?;
            inferred += 1;
            debug!(
                commodity,
                hedging, speculative, baseline_as_of = %as_of,
                "inferred reversion record"
            );
        }

        if inferred > 0 {
            info!(count = inferred, date = %target, "reversion inference complete");
        }
        Ok(inferred)
    }
}

/// Build the production pipeline from the environment: HTTP session driver
/// plus the Gemini-backed parser.
pub async fn run_from_env() -> Result<RunSummary> {
    let config = RunConfig::from_env();
    let factory = Box::<marginwatch_browser::HttpSessionFactory>::default();
    let parser = Box::new(marginwatch_extract::GeminiParser::from_env()?);
    let pipeline = NoticePipeline::new(config, factory, parser)?;
    Ok(pipeline.run_once().await)
}
