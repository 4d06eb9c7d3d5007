//! Durable persistence: append-only incremental log, full-snapshot dataset
//! export, distributable archive, and the batching engine on top of them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use chrono::NaiveDate;
use marginwatch_core::{ExtractedRecord, RecordKey, RecordKind};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const CRATE_NAME: &str = "marginwatch-store";

/// Fixed column order of the incremental log, mirroring `ExtractedRecord`.
pub const CSV_COLUMNS: [&str; 20] = [
    "notice_date",
    "title",
    "source_url",
    "commodity",
    "record_kind",
    "hedging_percentage",
    "speculative_percentage",
    "effective_date",
    "adjustment_type",
    "operation_type",
    "operation_description",
    "affected_parties",
    "source_sentence",
    "parsing_method",
    "confidence",
    "extracted_at",
    "relevance_score",
    "relevance_signals",
    "detected_commodities",
    "batch_number",
];

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write one CSV row, quoting only where needed.
pub fn write_csv_row<W: Write>(mut w: W, row: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            write!(w, ",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            let escaped = cell.replace('"', "\"\"");
            write!(w, "\"{escaped}\"")?;
        } else {
            write!(w, "{cell}")?;
        }
    }
    writeln!(w)
}

fn rows_to_bytes(rows: &[Vec<String>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for row in rows {
        let _ = write_csv_row(&mut buf, row);
    }
    buf
}

fn fmt_percentage(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.fract() == 0.0 => format!("{v:.0}"),
        Some(v) => v.to_string(),
    }
}

/// One log row in `CSV_COLUMNS` order.
pub fn csv_row(record: &ExtractedRecord) -> Vec<String> {
    vec![
        record.notice_date.format("%Y-%m-%d").to_string(),
        record.title.clone(),
        record.source_url.clone(),
        record.commodity.clone(),
        record.kind.as_str().to_string(),
        fmt_percentage(record.hedging_percentage),
        fmt_percentage(record.speculative_percentage),
        record.effective_date.format("%Y-%m-%d").to_string(),
        record.adjustment_type.as_str().to_string(),
        record.operation_type.clone().unwrap_or_default(),
        record.description.clone().unwrap_or_default(),
        record.affected_parties.join("; "),
        record.source_sentence.clone(),
        record.parsing_method.as_str().to_string(),
        record.confidence.as_str().to_string(),
        record.extracted_at.to_rfc3339(),
        format!("{:.1}", record.relevance.score),
        record.relevance.matched_signals.join("; "),
        record.relevance.detected_commodities.join("; "),
        record.batch_number.to_string(),
    ]
}

/// Append-only comma-delimited record stream. The header is written once at
/// creation; every flush reopens the file for append.
#[derive(Debug, Clone)]
pub struct IncrementalLog {
    path: PathBuf,
}

impl IncrementalLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let mut file = File::create(&path)
            .with_context(|| format!("creating incremental log {}", path.display()))?;
        let header: Vec<String> = CSV_COLUMNS.iter().map(|c| c.to_string()).collect();
        write_csv_row(&mut file, &header)
            .with_context(|| format!("writing log header {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, records: &[ExtractedRecord]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopening incremental log {}", self.path.display()))?;
        for record in records {
            write_csv_row(&mut file, &csv_row(record))
                .with_context(|| format!("appending to {}", self.path.display()))?;
        }
        file.flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub dataset_name: String,
    pub source_name: String,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExportedSheets {
    pub data_path: PathBuf,
    pub operations_path: PathBuf,
    pub meta_path: PathBuf,
    pub summary_path: PathBuf,
    pub release_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    pub zip_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifest {
    pub schema_version: u32,
    pub files: Vec<ArchiveManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn time_series_code(commodity: &str) -> String {
    commodity.to_uppercase().replace([' ', '-'], "_")
}

fn code_description(code: &str) -> String {
    let mut out = String::new();
    for (i, word) in code.split('_').enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let lower = word.to_lowercase();
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Regenerates the exportable sheets from the entire cumulative record set.
/// Output is a pure function of the records: regeneration on the same set is
/// byte-identical.
#[derive(Debug, Clone)]
pub struct DatasetExporter {
    config: ExportConfig,
}

impl DatasetExporter {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    fn release_date(records: &[ExtractedRecord]) -> NaiveDate {
        records
            .iter()
            .map(|r| r.extracted_at)
            .max()
            .map(|ts| ts.date_naive())
            .unwrap_or_default()
    }

    fn sheet_path(&self, kind: &str, release: NaiveDate, ext: &str) -> PathBuf {
        self.config.output_dir.join(format!(
            "{}_{}_{}.{ext}",
            self.config.dataset_name,
            kind,
            release.format("%Y%m%d")
        ))
    }

    pub fn export_sheets(&self, records: &[ExtractedRecord]) -> Result<ExportedSheets> {
        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("creating export directory {}", self.config.output_dir.display())
        })?;
        let release = Self::release_date(records);

        let sheets = ExportedSheets {
            data_path: self.sheet_path("DATA", release, "csv"),
            operations_path: self.sheet_path("OPERATIONS", release, "csv"),
            meta_path: self.sheet_path("META", release, "csv"),
            summary_path: self.sheet_path("SUMMARY", release, "csv"),
            release_date: release,
        };

        fs::write(&sheets.data_path, rows_to_bytes(&self.data_rows(records)))
            .with_context(|| format!("writing {}", sheets.data_path.display()))?;
        fs::write(
            &sheets.operations_path,
            rows_to_bytes(&self.operations_rows(records)),
        )
        .with_context(|| format!("writing {}", sheets.operations_path.display()))?;
        fs::write(
            &sheets.meta_path,
            rows_to_bytes(&self.meta_rows(records, release)),
        )
        .with_context(|| format!("writing {}", sheets.meta_path.display()))?;
        fs::write(
            &sheets.summary_path,
            rows_to_bytes(&self.summary_rows(records)),
        )
        .with_context(|| format!("writing {}", sheets.summary_path.display()))?;

        Ok(sheets)
    }

    /// Margin pivot: latest value per `(commodity, effective date)`, one
    /// column pair per commodity, one row per effective date ascending.
    fn data_rows(&self, records: &[ExtractedRecord]) -> Vec<Vec<String>> {
        let mut latest: HashMap<(String, NaiveDate), &ExtractedRecord> = HashMap::new();
        for record in records.iter().filter(|r| r.kind == RecordKind::Margin) {
            let key = (record.commodity.clone(), record.effective_date);
            match latest.get(&key) {
                Some(existing) if existing.extracted_at >= record.extracted_at => {}
                _ => {
                    latest.insert(key, record);
                }
            }
        }

        let mut codes: BTreeSet<String> = BTreeSet::new();
        let mut by_date: BTreeMap<NaiveDate, BTreeMap<String, String>> = BTreeMap::new();
        for ((commodity, date), record) in &latest {
            let base = time_series_code(commodity);
            let hedging_code = format!("{base}_HEDGING_MARGIN");
            let speculative_code = format!("{base}_SPECULATIVE_MARGIN");
            let row = by_date.entry(*date).or_default();
            row.insert(hedging_code.clone(), fmt_percentage(record.hedging_percentage));
            row.insert(
                speculative_code.clone(),
                fmt_percentage(record.speculative_percentage),
            );
            codes.insert(hedging_code);
            codes.insert(speculative_code);
        }

        let mut rows = Vec::new();
        let mut header = vec!["DATE".to_string()];
        header.extend(codes.iter().cloned());
        rows.push(header);
        let mut descriptions = vec!["Reporting Date".to_string()];
        descriptions.extend(codes.iter().map(|c| code_description(c)));
        rows.push(descriptions);

        for (date, values) in &by_date {
            let mut row = vec![date.format("%Y-%m-%d").to_string()];
            for code in &codes {
                row.push(values.get(code).cloned().unwrap_or_default());
            }
            rows.push(row);
        }
        rows
    }

    fn operations_rows(&self, records: &[ExtractedRecord]) -> Vec<Vec<String>> {
        let mut operational: Vec<&ExtractedRecord> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Operational)
            .collect();
        operational.sort_by(|a, b| {
            (a.effective_date, &a.commodity, a.extracted_at)
                .cmp(&(b.effective_date, &b.commodity, b.extracted_at))
        });

        let mut rows = vec![vec![
            "Date".to_string(),
            "Commodity".to_string(),
            "Operation_Type".to_string(),
            "Operation_Description".to_string(),
            "Affected_Parties".to_string(),
            "Effective_Date".to_string(),
            "Adjustment_Type".to_string(),
            "Source_Sentence".to_string(),
        ]];
        for record in operational {
            rows.push(vec![
                record.notice_date.format("%Y-%m-%d").to_string(),
                record.commodity.clone(),
                record.operation_type.clone().unwrap_or_default(),
                record.description.clone().unwrap_or_default(),
                record.affected_parties.join("; "),
                record.effective_date.format("%Y-%m-%d").to_string(),
                record.adjustment_type.as_str().to_string(),
                record.source_sentence.clone(),
            ]);
        }
        rows
    }

    fn meta_rows(&self, records: &[ExtractedRecord], release: NaiveDate) -> Vec<Vec<String>> {
        let margin_commodities: BTreeSet<String> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Margin)
            .map(|r| time_series_code(&r.commodity))
            .collect();
        let operational_commodities: BTreeSet<String> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Operational)
            .map(|r| time_series_code(&r.commodity))
            .collect();

        let release_stamp = format!("{}T11:00:00", release.format("%Y-%m-%d"));
        let mut rows = vec![vec![
            "TIMESERIES_ID".to_string(),
            "TIMESERIES_DESCRIPTION".to_string(),
            "UNIT".to_string(),
            "FREQUENCY".to_string(),
            "SOURCE".to_string(),
            "DATASET".to_string(),
            "LAST_RELEASE_DATE".to_string(),
            "NEXT_RELEASE_DATE".to_string(),
        ]];

        for commodity in &margin_commodities {
            for transaction in ["HEDGING", "SPECULATIVE"] {
                let id = format!("{commodity}_{transaction}_MARGIN");
                rows.push(vec![
                    id.clone(),
                    code_description(&id),
                    "Percentage".to_string(),
                    "Irregular".to_string(),
                    self.config.source_name.clone(),
                    self.config.dataset_name.clone(),
                    release_stamp.clone(),
                    String::new(),
                ]);
            }
        }
        for commodity in &operational_commodities {
            let id = format!("{commodity}_OPERATIONAL_ANNOUNCEMENTS");
            rows.push(vec![
                id.clone(),
                code_description(&id),
                "Text".to_string(),
                "Irregular".to_string(),
                self.config.source_name.clone(),
                self.config.dataset_name.clone(),
                release_stamp.clone(),
                String::new(),
            ]);
        }
        rows
    }

    fn summary_rows(&self, records: &[ExtractedRecord]) -> Vec<Vec<String>> {
        let margin_count = records.iter().filter(|r| r.kind == RecordKind::Margin).count();
        let operational: Vec<&ExtractedRecord> = records
            .iter()
            .filter(|r| r.kind == RecordKind::Operational)
            .collect();

        let mut by_operation: BTreeMap<String, usize> = BTreeMap::new();
        for record in &operational {
            let key = record
                .operation_type
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            *by_operation.entry(key).or_default() += 1;
        }
        let commodities: BTreeSet<&str> =
            records.iter().map(|r| r.commodity.as_str()).collect();

        let mut rows = vec![
            vec!["Data_Type".to_string(), "Count".to_string(), "Details".to_string()],
            vec![
                "Margin Adjustments".to_string(),
                margin_count.to_string(),
                String::new(),
            ],
            vec![
                "Operational Announcements".to_string(),
                operational.len().to_string(),
                String::new(),
            ],
        ];
        for (operation, count) in &by_operation {
            rows.push(vec![
                format!("operation:{operation}"),
                count.to_string(),
                String::new(),
            ]);
        }
        rows.push(vec![
            "Commodities Covered".to_string(),
            commodities.len().to_string(),
            commodities.into_iter().collect::<Vec<_>>().join("; "),
        ]);
        rows
    }

    /// Bundle the sheets into the run's terminal artifact: a ZIP plus a
    /// manifest with one hashed entry per bundled file.
    pub fn export_archive(&self, sheets: &ExportedSheets) -> Result<ArchiveOutput> {
        let zip_path = self.config.output_dir.join(format!(
            "{}_{}.zip",
            self.config.dataset_name,
            sheets.release_date.format("%Y%m%d")
        ));

        let file = File::create(&zip_path)
            .with_context(|| format!("creating archive {}", zip_path.display()))?;
        let mut writer = ZipWriter::new(file);

        let mut manifest_files = Vec::new();
        for (name, path) in [
            ("data", &sheets.data_path),
            ("operations", &sheets.operations_path),
            ("meta", &sheets.meta_path),
            ("summary", &sheets.summary_path),
        ] {
            let bytes =
                fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| name.to_string());
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer
                .start_file(file_name.as_str(), options)
                .with_context(|| format!("starting archive entry {file_name}"))?;
            writer
                .write_all(&bytes)
                .with_context(|| format!("writing archive entry {file_name}"))?;

            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            manifest_files.push(ArchiveManifestFile {
                name: name.to_string(),
                path: file_name,
                sha256: hex::encode(hasher.finalize()),
                bytes: bytes.len() as u64,
            });
        }
        writer
            .finish()
            .with_context(|| format!("closing archive {}", zip_path.display()))?;

        let manifest = ArchiveManifest {
            schema_version: 1,
            files: manifest_files,
        };
        let manifest_path = self.config.output_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing archive manifest")?;
        fs::write(&manifest_path, bytes)
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        Ok(ArchiveOutput {
            zip_path,
            manifest_path,
        })
    }
}

/// Accumulates validated records and guarantees that everything added before
/// the last flush is durable, whatever path the run exits through.
pub struct BatchEngine {
    log: IncrementalLog,
    exporter: DatasetExporter,
    batch_size: usize,
    batch: Vec<ExtractedRecord>,
    cumulative: Vec<ExtractedRecord>,
    keys: HashSet<RecordKey>,
    batches_flushed: u32,
}

impl BatchEngine {
    pub fn new(log: IncrementalLog, exporter: DatasetExporter, batch_size: usize) -> Self {
        Self {
            log,
            exporter,
            batch_size: batch_size.max(1),
            batch: Vec::new(),
            cumulative: Vec::new(),
            keys: HashSet::new(),
            batches_flushed: 0,
        }
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn contains_key(&self, key: &RecordKey) -> bool {
        self.keys.contains(key)
    }

    pub fn total_saved(&self) -> usize {
        self.cumulative.len()
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn batches_flushed(&self) -> u32 {
        self.batches_flushed
    }

    pub fn records(&self) -> &[ExtractedRecord] {
        &self.cumulative
    }

    pub fn add(&mut self, mut record: ExtractedRecord) -> Result<()> {
        ensure!(
            record.percentages_in_bounds(),
            "record {} for {} has percentages outside bounds",
            record.commodity,
            record.effective_date
        );
        let key = record.key();
        ensure!(
            !self.keys.contains(&key),
            "duplicate record key {}/{}/{}",
            key.commodity,
            key.effective_date,
            key.kind.as_str()
        );
        record.batch_number = self.batches_flushed + 1;
        self.keys.insert(key);
        self.batch.push(record);
        if self.batch.len() >= self.batch_size {
            self.flush(false)?;
        }
        Ok(())
    }

    /// Append the pending batch to the log and regenerate the export sheets
    /// from the full cumulative set. A no-op on an empty batch unless forced.
    pub fn flush(&mut self, force: bool) -> Result<Option<ExportedSheets>> {
        if self.batch.is_empty() && !force {
            return Ok(None);
        }
        if !self.batch.is_empty() {
            self.batches_flushed += 1;
            info!(
                batch = self.batches_flushed,
                records = self.batch.len(),
                "flushing batch"
            );
            self.log.append(&self.batch)?;
            self.cumulative.append(&mut self.batch);
        }
        if self.cumulative.is_empty() {
            return Ok(None);
        }
        let sheets = self.exporter.export_sheets(&self.cumulative)?;
        Ok(Some(sheets))
    }

    /// Force-flush and wrap the sheets into the distributable archive.
    pub fn finalize(&mut self) -> Result<Option<ArchiveOutput>> {
        match self.flush(true)? {
            Some(sheets) => Ok(Some(self.exporter.export_archive(&sheets)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use marginwatch_core::{
        AdjustmentType, Confidence, ParsingMethod, RelevanceVerdict,
    };
    use tempfile::tempdir;

    fn mk_margin(
        commodity: &str,
        effective: (i32, u32, u32),
        hedging: f64,
        speculative: f64,
    ) -> ExtractedRecord {
        ExtractedRecord {
            notice_date: NaiveDate::from_ymd_opt(2025, 4, 25).unwrap(),
            title: "Notice on Adjusting the Margin Ratio".to_string(),
            source_url: "https://exchange.example/n1".to_string(),
            commodity: commodity.to_string(),
            kind: RecordKind::Margin,
            effective_date: NaiveDate::from_ymd_opt(effective.0, effective.1, effective.2).unwrap(),
            hedging_percentage: Some(hedging),
            speculative_percentage: Some(speculative),
            adjustment_type: AdjustmentType::AdjustedTo,
            operation_type: None,
            description: None,
            affected_parties: Vec::new(),
            source_sentence: "margin ratio adjusted".to_string(),
            parsing_method: ParsingMethod::LlmParse,
            confidence: Confidence::High,
            extracted_at: Utc.with_ymd_and_hms(2025, 4, 25, 9, 0, 0).single().unwrap(),
            relevance: RelevanceVerdict::not_interesting("test"),
            batch_number: 0,
        }
    }

    fn mk_operational(commodity: &str, effective: (i32, u32, u32)) -> ExtractedRecord {
        let mut record = mk_margin(commodity, effective, 0.0, 0.0);
        record.kind = RecordKind::Operational;
        record.hedging_percentage = None;
        record.speculative_percentage = None;
        record.operation_type = Some("warehouse_capacity".to_string());
        record.description = Some("increase activated storage capacity".to_string());
        record.affected_parties = vec!["Shandong Logistics Co.".to_string()];
        record
    }

    fn engine_in(dir: &Path, batch_size: usize) -> BatchEngine {
        let log = IncrementalLog::create(dir.join("incremental.csv")).unwrap();
        let exporter = DatasetExporter::new(ExportConfig {
            dataset_name: "SHFEMR".to_string(),
            source_name: "Shanghai Futures Exchange".to_string(),
            output_dir: dir.to_path_buf(),
        });
        BatchEngine::new(log, exporter, batch_size)
    }

    #[test]
    fn csv_quoting_escapes_commas_quotes_and_newlines() {
        let mut buf = Vec::new();
        write_csv_row(
            &mut buf,
            &[
                "plain".to_string(),
                "with,comma".to_string(),
                "with \"quote\"".to_string(),
                "with\nnewline".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "plain,\"with,comma\",\"with \"\"quote\"\"\",\"with\nnewline\"\n"
        );
    }

    #[test]
    fn log_writes_header_once_and_appends_per_flush() {
        let dir = tempdir().unwrap();
        let log = IncrementalLog::create(dir.path().join("log.csv")).unwrap();
        log.append(&[mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)]).unwrap();
        log.append(&[mk_margin("Gold", (2025, 4, 29), 13.0, 14.0)]).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("notice_date,title,source_url"));
        assert!(lines[1].contains("Copper"));
        assert!(lines[2].contains("Gold"));
    }

    #[test]
    fn export_regeneration_is_byte_identical() {
        let dir = tempdir().unwrap();
        let exporter = DatasetExporter::new(ExportConfig {
            dataset_name: "SHFEMR".to_string(),
            source_name: "Shanghai Futures Exchange".to_string(),
            output_dir: dir.path().to_path_buf(),
        });
        let records = vec![
            mk_margin("Copper", (2025, 4, 29), 8.0, 9.0),
            mk_margin("Gold", (2025, 5, 6), 13.0, 14.0),
            mk_operational("Natural Rubber", (2025, 4, 1)),
        ];

        let first = exporter.export_sheets(&records).unwrap();
        let data_first = fs::read(&first.data_path).unwrap();
        let meta_first = fs::read(&first.meta_path).unwrap();

        let second = exporter.export_sheets(&records).unwrap();
        assert_eq!(data_first, fs::read(&second.data_path).unwrap());
        assert_eq!(meta_first, fs::read(&second.meta_path).unwrap());
    }

    #[test]
    fn data_sheet_pivots_by_date_with_sorted_codes() {
        let dir = tempdir().unwrap();
        let exporter = DatasetExporter::new(ExportConfig {
            dataset_name: "SHFEMR".to_string(),
            source_name: "Shanghai Futures Exchange".to_string(),
            output_dir: dir.path().to_path_buf(),
        });
        let records = vec![
            mk_margin("Gold", (2025, 5, 6), 13.0, 14.0),
            mk_margin("Copper", (2025, 4, 29), 8.0, 9.0),
        ];
        let sheets = exporter.export_sheets(&records).unwrap();
        let text = fs::read_to_string(&sheets.data_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "DATE,COPPER_HEDGING_MARGIN,COPPER_SPECULATIVE_MARGIN,GOLD_HEDGING_MARGIN,GOLD_SPECULATIVE_MARGIN"
        );
        assert!(lines[1].starts_with("Reporting Date,"));
        assert_eq!(lines[2], "2025-04-29,8,9,,");
        assert_eq!(lines[3], "2025-05-06,,,13,14");
    }

    #[test]
    fn duplicate_margin_cells_resolve_to_latest_extraction() {
        let dir = tempdir().unwrap();
        let exporter = DatasetExporter::new(ExportConfig {
            dataset_name: "SHFEMR".to_string(),
            source_name: "Shanghai Futures Exchange".to_string(),
            output_dir: dir.path().to_path_buf(),
        });
        let mut stale = mk_margin("Copper", (2025, 4, 29), 7.0, 8.0);
        stale.extracted_at = Utc.with_ymd_and_hms(2025, 4, 25, 8, 0, 0).single().unwrap();
        let fresh = mk_margin("Copper", (2025, 4, 29), 8.0, 9.0);

        let sheets = exporter.export_sheets(&[stale, fresh]).unwrap();
        let text = fs::read_to_string(&sheets.data_path).unwrap();
        assert!(text.lines().any(|line| line == "2025-04-29,8,9"));
    }

    #[test]
    fn engine_flushes_at_threshold_and_numbers_batches() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(dir.path(), 2);

        engine.add(mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)).unwrap();
        assert_eq!(engine.pending(), 1);
        assert_eq!(engine.batches_flushed(), 0);

        engine.add(mk_margin("Gold", (2025, 4, 29), 13.0, 14.0)).unwrap();
        assert_eq!(engine.pending(), 0);
        assert_eq!(engine.batches_flushed(), 1);
        assert_eq!(engine.total_saved(), 2);
        assert!(engine.records().iter().all(|r| r.batch_number == 1));

        engine.add(mk_margin("Silver", (2025, 4, 29), 12.0, 13.0)).unwrap();
        assert_eq!(engine.records().len(), 2);
        engine.flush(true).unwrap();
        assert_eq!(engine.total_saved(), 3);
        let silver = engine
            .records()
            .iter()
            .find(|r| r.commodity == "Silver")
            .unwrap();
        assert_eq!(silver.batch_number, 2);
    }

    #[test]
    fn engine_refuses_out_of_bounds_and_duplicate_keys() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(dir.path(), 10);

        assert!(engine.add(mk_margin("Copper", (2025, 4, 29), 25.0, 9.0)).is_err());
        engine.add(mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)).unwrap();
        assert!(engine.add(mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)).is_err());
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn forced_flush_on_empty_batch_still_regenerates_sheets() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(dir.path(), 1);
        engine.add(mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)).unwrap();
        assert_eq!(engine.pending(), 0);

        let sheets = engine.flush(true).unwrap();
        assert!(sheets.is_some());

        let mut empty_engine = engine_in(dir.path(), 1);
        assert!(empty_engine.flush(true).unwrap().is_none());
    }

    #[test]
    fn finalize_bundles_sheets_with_hashed_manifest() {
        let dir = tempdir().unwrap();
        let mut engine = engine_in(dir.path(), 10);
        engine.add(mk_margin("Copper", (2025, 4, 29), 8.0, 9.0)).unwrap();
        engine.add(mk_operational("Natural Rubber", (2025, 4, 1))).unwrap();

        let archive = engine.finalize().unwrap().expect("archive produced");
        assert!(archive.zip_path.exists());
        assert!(archive.manifest_path.exists());

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&archive.manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 4);

        let data_entry = files.iter().find(|f| f["name"] == "data").unwrap();
        let data_path = dir.path().join(data_entry["path"].as_str().unwrap());
        let bytes = fs::read(&data_path).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(data_entry["sha256"], hex::encode(hasher.finalize()));
    }
}
