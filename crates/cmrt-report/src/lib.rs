//! Report runs: CSV or Excel inputs in, reconciled or sampled tables and run reports out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cmrt_core::columns::{AREA, LOB, STATUS};
use cmrt_core::{FilterSelection, SetupStatus, Table};
use cmrt_recon::{
    compare, reconcile_setup, reconcile_work_papers, status_breakdown, CentralPlan, Comparison,
    DuplicateKeyPolicy, GroupRate, Quota, QuotaSampler, RedistributionPolicy, DEFAULT_SAMPLE_SEED,
    UNASSIGNED_GROUP,
};
use cmrt_storage::{read_table, ReportStore, StoredReport};
use serde::Serialize;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cmrt-report";

pub const RESULT_CSV: &str = "result.csv";
pub const RESULT_PARQUET: &str = "result.parquet";
pub const RESULT_XLSX: &str = "result.xlsx";
pub const SUMMARY_FILE: &str = "summary.md";
const OVERALL_GROUP: &str = "(overall)";

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub reports_dir: PathBuf,
    pub sample_seed: u64,
    pub duplicate_keys: DuplicateKeyPolicy,
    pub redistribution: RedistributionPolicy,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ReportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unknown or unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            reports_dir: lookup("CMRT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            sample_seed: lookup("CMRT_SAMPLE_SEED")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_SAMPLE_SEED),
            duplicate_keys: match lookup("CMRT_STRICT_KEYS") {
                Some(v) if matches!(v.trim(), "1" | "true" | "TRUE" | "True") => {
                    DuplicateKeyPolicy::Reject
                }
                _ => DuplicateKeyPolicy::FirstMatch,
            },
            redistribution: match lookup("CMRT_REDRAW_POLICY") {
                Some(v) if v.trim().eq_ignore_ascii_case("independent") => {
                    RedistributionPolicy::IndependentRedraw
                }
                _ => RedistributionPolicy::ExcludeDrawn,
            },
        }
    }
}

/// Reads a per-group quota file: either a bare number or `{ default, groups }`.
///
/// Any other key in the mapping is an error.
pub fn load_quota_file(path: &Path) -> Result<Quota> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading quota file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing quota file {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SetupInputs {
    pub branches: PathBuf,
    pub setups: PathBuf,
    pub filter: FilterSelection,
}

#[derive(Debug, Clone)]
pub struct WorkPaperInputs {
    pub branches: PathBuf,
    pub definitions: PathBuf,
    pub progress: PathBuf,
    pub filter: FilterSelection,
}

#[derive(Debug, Clone)]
pub struct SampleInputs {
    pub input: PathBuf,
    pub group_key: String,
    pub cap: usize,
    pub filter: FilterSelection,
}

#[derive(Debug, Clone)]
pub struct CentralSampleInputs {
    pub input: PathBuf,
    pub top_key: String,
    pub branch_key: String,
    pub extra_keys: Vec<String>,
    pub quota: Quota,
    pub filter: FilterSelection,
}

#[derive(Debug, Clone)]
pub struct CompareInputs {
    pub before: PathBuf,
    pub after: PathBuf,
    pub status_field: String,
    pub target_status: String,
    /// Optional per-group breakdown column, e.g. `AREA`.
    pub group_field: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Setup,
    WorkPapers,
    Sample,
    CentralSample,
    Compare,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::WorkPapers => "work_papers",
            Self::Sample => "sample",
            Self::CentralSample => "central_sample",
            Self::Compare => "compare",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Setup => "Setup Reconciliation",
            Self::WorkPapers => "Work Paper Reconciliation",
            Self::Sample => "Per-Group Sample",
            Self::CentralSample => "Central Function Sample",
            Self::Compare => "Completion Comparison",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub output_rows: usize,
    pub matched: Option<usize>,
    pub comparison: Option<Comparison>,
    pub reports_dir: String,
    pub manifest: String,
    pub files: Vec<String>,
}

struct RunOutput {
    kind: RunKind,
    input_rows: usize,
    table: Table,
    matched: Option<usize>,
    comparison: Option<Comparison>,
    details: Vec<String>,
}

pub struct ReportPipeline {
    config: ReportConfig,
    store: ReportStore,
    sampler: QuotaSampler,
}

impl ReportPipeline {
    pub fn new(config: ReportConfig) -> Self {
        let store = ReportStore::new(config.reports_dir.clone());
        let sampler = QuotaSampler::new(config.sample_seed);
        Self {
            config,
            store,
            sampler,
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn run_setup(&self, inputs: &SetupInputs) -> Result<RunSummary> {
        let started_at = Utc::now();
        let branches = load_input("branches", &inputs.branches)?;
        let setups = load_input("setups", &inputs.setups)?;
        let (by_area, by_lob) = split_filter(&inputs.filter);
        let branches = by_area
            .apply(&branches)
            .with_context(|| format!("filtering {}", inputs.branches.display()))?;

        let reconciled = reconcile_setup(&branches, &setups, self.config.duplicate_keys)
            .context("reconciling setups against the branch catalog")?;
        let table = by_lob
            .apply(&reconciled.table)
            .context("filtering reconciled setups")?;
        let configured = SetupStatus::Configured.as_str();
        let matched = table
            .column_values(STATUS)?
            .into_iter()
            .filter(|s| *s == Some(configured))
            .count();

        let mut details = vec![
            format!("- Expected rows: {}", table.height()),
            format!("- Configured: {matched}"),
            format!("- Not configured: {}", table.height() - matched),
            format!("- Duplicate setup rows ignored: {}", reconciled.duplicate_actual_rows),
        ];
        for field in [AREA, LOB] {
            if table.has_column(field) {
                let rates = status_breakdown(&table, field, STATUS, configured)?;
                details.extend(render_rates(field, &rates));
            }
        }

        self.finish(
            started_at,
            RunOutput {
                kind: RunKind::Setup,
                input_rows: branches.height() + setups.height(),
                table,
                matched: Some(matched),
                comparison: None,
                details,
            },
        )
    }

    pub fn run_work_papers(&self, inputs: &WorkPaperInputs) -> Result<RunSummary> {
        let started_at = Utc::now();
        let branches = load_input("branches", &inputs.branches)?;
        let definitions = load_input("work paper definitions", &inputs.definitions)?;
        let progress = load_input("progress", &inputs.progress)?;
        let (by_area, by_lob) = split_filter(&inputs.filter);
        let branches = by_area
            .apply(&branches)
            .with_context(|| format!("filtering {}", inputs.branches.display()))?;
        let definitions = by_lob
            .apply(&definitions)
            .with_context(|| format!("filtering {}", inputs.definitions.display()))?;

        let reconciled = reconcile_work_papers(
            &branches,
            &definitions,
            &progress,
            self.config.duplicate_keys,
        )
        .context("reconciling progress against the work paper catalog")?;

        let mut details = vec![
            format!("- Expected rows: {}", reconciled.table.height()),
            format!("- With progress: {}", reconciled.matched),
            format!("- Without progress: {}", reconciled.unmatched),
            format!(
                "- Duplicate progress rows ignored: {}",
                reconciled.duplicate_actual_rows
            ),
        ];
        details.extend(render_counts(LOB, &group_counts(&reconciled.table, LOB)?));

        self.finish(
            started_at,
            RunOutput {
                kind: RunKind::WorkPapers,
                input_rows: branches.height() + definitions.height() + progress.height(),
                matched: Some(reconciled.matched),
                table: reconciled.table,
                comparison: None,
                details,
            },
        )
    }

    pub fn run_sample(&self, inputs: &SampleInputs) -> Result<RunSummary> {
        let started_at = Utc::now();
        let input = load_input("sample input", &inputs.input)?;
        let input = inputs
            .filter
            .apply(&input)
            .with_context(|| format!("filtering {}", inputs.input.display()))?;

        let sample = self
            .sampler
            .sample_per_group(&input, &inputs.group_key, inputs.cap)
            .with_context(|| format!("sampling {}", inputs.input.display()))?;

        let mut details = vec![
            format!("- Group key: `{}`", inputs.group_key),
            format!("- Cap per group: {}", inputs.cap),
            format!("- Seed: {}", self.sampler.seed()),
            format!("- Rows without a group value: {}", sample.unassigned_rows),
            String::new(),
            "| Group | Available | Drawn |".to_string(),
            "|---|---:|---:|".to_string(),
        ];
        details.extend(
            sample
                .groups
                .iter()
                .map(|g| format!("| {} | {} | {} |", g.group, g.available, g.drawn)),
        );

        self.finish(
            started_at,
            RunOutput {
                kind: RunKind::Sample,
                input_rows: input.height(),
                table: sample.table,
                matched: None,
                comparison: None,
                details,
            },
        )
    }

    pub fn run_central_sample(&self, inputs: &CentralSampleInputs) -> Result<RunSummary> {
        let started_at = Utc::now();
        let input = load_input("sample input", &inputs.input)?;
        let input = inputs
            .filter
            .apply(&input)
            .with_context(|| format!("filtering {}", inputs.input.display()))?;

        let plan = CentralPlan {
            top_key: inputs.top_key.clone(),
            branch_key: inputs.branch_key.clone(),
            extra_keys: inputs.extra_keys.clone(),
            quota: inputs.quota.clone(),
            redistribution: self.config.redistribution,
        };
        let sample = self
            .sampler
            .sample_central(&input, &plan)
            .with_context(|| format!("sampling {}", inputs.input.display()))?;

        for group in sample.groups.iter().filter(|g| g.remaining < 0) {
            warn!(
                group = %group.group,
                quota = group.quota,
                overshoot = -group.remaining,
                "sample exceeds the group quota"
            );
        }

        let mut details = vec![
            format!("- Top key: `{}`", inputs.top_key),
            format!("- Branch key: `{}`", inputs.branch_key),
            format!("- Seed: {}", self.sampler.seed()),
            format!("- Redistribution: {:?}", self.config.redistribution),
            format!("- Rows without a group value: {}", sample.unassigned_rows),
            String::new(),
            "| Group | Quota | Branches | Share | Main | Redistributed | Remaining |".to_string(),
            "|---|---:|---:|---:|---:|---:|---:|".to_string(),
        ];
        details.extend(sample.groups.iter().map(|g| {
            format!(
                "| {} | {} | {} | {} | {} | {} | {} |",
                g.group,
                g.quota,
                g.branch_count,
                g.per_branch_share,
                g.drawn_main,
                g.drawn_redistributed,
                g.remaining
            )
        }));

        self.finish(
            started_at,
            RunOutput {
                kind: RunKind::CentralSample,
                input_rows: input.height(),
                table: sample.table,
                matched: None,
                comparison: None,
                details,
            },
        )
    }

    pub fn run_compare(&self, inputs: &CompareInputs) -> Result<RunSummary> {
        let started_at = Utc::now();
        let before = load_input("before snapshot", &inputs.before)?;
        let after = load_input("after snapshot", &inputs.after)?;

        let overall = compare(&before, &after, &inputs.status_field, &inputs.target_status)
            .context("comparing snapshots")?;

        let mut table = Table::new(["GROUP", "PCT_BEFORE", "PCT_AFTER", "DELTA"])?;
        table.push_row(comparison_row(
            OVERALL_GROUP,
            Some(overall.pct_before),
            Some(overall.pct_after),
        ))?;

        if let Some(field) = &inputs.group_field {
            let rates_before =
                status_breakdown(&before, field, &inputs.status_field, &inputs.target_status)
                    .with_context(|| format!("grouping {}", inputs.before.display()))?;
            let rates_after =
                status_breakdown(&after, field, &inputs.status_field, &inputs.target_status)
                    .with_context(|| format!("grouping {}", inputs.after.display()))?;
            let mut paired: BTreeMap<Option<String>, (Option<f64>, Option<f64>)> = BTreeMap::new();
            for rate in rates_before {
                paired.entry(rate.group).or_default().0 = Some(rate.pct);
            }
            for rate in rates_after {
                paired.entry(rate.group).or_default().1 = Some(rate.pct);
            }
            for (group, (pct_before, pct_after)) in paired {
                let label = group.as_deref().unwrap_or(UNASSIGNED_GROUP);
                table.push_row(comparison_row(label, pct_before, pct_after))?;
            }
        }

        let details = vec![
            format!(
                "- Status: `{}` = `{}`",
                inputs.status_field, inputs.target_status
            ),
            format!("- Before: {:.2}% of {} rows", overall.pct_before, before.height()),
            format!("- After: {:.2}% of {} rows", overall.pct_after, after.height()),
            format!("- Change: {:+.2} points", overall.delta),
        ];

        self.finish(
            started_at,
            RunOutput {
                kind: RunKind::Compare,
                input_rows: before.height() + after.height(),
                table,
                matched: None,
                comparison: Some(overall),
                details,
            },
        )
    }

    fn finish(&self, started_at: DateTime<Utc>, output: RunOutput) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let run_key = run_id.to_string();
        let span = info_span!("report_run", kind = output.kind.as_str(), run_id = %run_id);
        let _guard = span.enter();

        let mut stored: Vec<StoredReport> = Vec::with_capacity(4);
        stored.push(self.store.store_table_csv(&run_key, RESULT_CSV, &output.table)?);
        stored.push(
            self.store
                .store_table_parquet(&run_key, RESULT_PARQUET, &output.table)?,
        );
        stored.push(
            self.store
                .store_table_xlsx(&run_key, RESULT_XLSX, &output.table)?,
        );

        let finished_at = Utc::now();
        let summary_md = render_summary(&output, run_id, started_at, finished_at);
        stored.push(
            self.store
                .store_bytes(&run_key, SUMMARY_FILE, summary_md.as_bytes())?,
        );
        let (_, manifest) = self.store.write_manifest(&run_key, &stored)?;

        info!(
            input_rows = output.input_rows,
            output_rows = output.table.height(),
            "report run completed"
        );

        let mut files: Vec<String> = stored.iter().map(|f| f.file_name.clone()).collect();
        files.push(manifest.file_name.clone());
        Ok(RunSummary {
            run_id,
            kind: output.kind,
            started_at,
            finished_at,
            input_rows: output.input_rows,
            output_rows: output.table.height(),
            matched: output.matched,
            comparison: output.comparison,
            reports_dir: self.store.run_dir(&run_key).display().to_string(),
            manifest: manifest.absolute_path.display().to_string(),
            files,
        })
    }
}

fn load_input(label: &str, path: &Path) -> Result<Table> {
    read_table(path).with_context(|| format!("loading {label} from {}", path.display()))
}

/// Area selection goes to the branch side, LOB selection to the catalog side.
fn split_filter(filter: &FilterSelection) -> (FilterSelection, FilterSelection) {
    (
        FilterSelection {
            areas: filter.areas.clone(),
            lobs: None,
        },
        FilterSelection {
            areas: None,
            lobs: filter.lobs.clone(),
        },
    )
}

fn group_counts(table: &Table, field: &str) -> Result<BTreeMap<Option<String>, usize>> {
    let mut counts = BTreeMap::new();
    for value in table.column_values(field)? {
        *counts.entry(value.map(str::to_string)).or_insert(0) += 1;
    }
    Ok(counts)
}

fn comparison_row(group: &str, before: Option<f64>, after: Option<f64>) -> Vec<Option<String>> {
    let delta = before.zip(after).map(|(b, a)| a - b);
    vec![
        Some(group.to_string()),
        before.map(|v| format!("{v:.2}")),
        after.map(|v| format!("{v:.2}")),
        delta.map(|v| format!("{v:.2}")),
    ]
}

fn render_rates(field: &str, rates: &[GroupRate]) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!("## By {field}"),
        "| Group | Rows | Matching | % |".to_string(),
        "|---|---:|---:|---:|".to_string(),
    ];
    lines.extend(
        rates
            .iter()
            .map(|r| format!("| {} | {} | {} | {:.2} |", r.label(), r.total, r.matching, r.pct)),
    );
    lines
}

fn render_counts(field: &str, counts: &BTreeMap<Option<String>, usize>) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!("## Rows by {field}"),
        "| Group | Rows |".to_string(),
        "|---|---:|".to_string(),
    ];
    lines.extend(counts.iter().map(|(group, rows)| {
        format!("| {} | {rows} |", group.as_deref().unwrap_or(UNASSIGNED_GROUP))
    }));
    lines
}

fn render_summary(
    output: &RunOutput,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> String {
    format!(
        "# {}\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Input rows: {}\n- Output rows: {}\n{}\n",
        output.kind.title(),
        run_id,
        started_at,
        finished_at,
        output.input_rows,
        output.table.height(),
        output.details.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmrt_storage::{read_csv_table, read_xlsx_table, xlsx_bytes, ReportManifest, MANIFEST_FILE};
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).expect("write fixture");
        path
    }

    fn pipeline(reports: &Path) -> ReportPipeline {
        ReportPipeline::new(ReportConfig {
            reports_dir: reports.to_path_buf(),
            ..ReportConfig::default()
        })
    }

    #[test]
    fn config_reads_overrides_and_falls_back() {
        let defaults = ReportConfig::from_lookup(|_| None);
        assert_eq!(defaults.reports_dir, PathBuf::from("./reports"));
        assert_eq!(defaults.sample_seed, 42);
        assert_eq!(defaults.duplicate_keys, DuplicateKeyPolicy::FirstMatch);
        assert_eq!(defaults.redistribution, RedistributionPolicy::ExcludeDrawn);

        let vars: BTreeMap<&str, &str> = BTreeMap::from([
            ("CMRT_REPORTS_DIR", "/tmp/cmrt"),
            ("CMRT_SAMPLE_SEED", "7"),
            ("CMRT_STRICT_KEYS", "true"),
            ("CMRT_REDRAW_POLICY", "Independent"),
        ]);
        let config = ReportConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.reports_dir, PathBuf::from("/tmp/cmrt"));
        assert_eq!(config.sample_seed, 7);
        assert_eq!(config.duplicate_keys, DuplicateKeyPolicy::Reject);
        assert_eq!(config.redistribution, RedistributionPolicy::IndependentRedraw);

        let bad_seed = ReportConfig::from_lookup(|k| (k == "CMRT_SAMPLE_SEED").then(|| "x".into()));
        assert_eq!(bad_seed.sample_seed, DEFAULT_SAMPLE_SEED);
    }

    #[test]
    fn quota_file_accepts_number_or_groups() {
        let dir = tempdir().expect("tempdir");
        let uniform = write(dir.path(), "uniform.yaml", "9\n");
        assert_eq!(load_quota_file(&uniform).expect("quota"), Quota::Uniform(9));

        let grouped = write(dir.path(), "grouped.yaml", "default: 3\ngroups:\n  Treasury: 12\n");
        let quota = load_quota_file(&grouped).expect("quota");
        assert_eq!(quota.for_group("Treasury"), 12);
        assert_eq!(quota.for_group("Payroll"), 3);

        let err = load_quota_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }

    #[test]
    fn quota_file_with_misspelled_keys_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let typo = write(dir.path(), "typo.yaml", "defualt: 12\ngroup:\n  Treasury: 30\n");
        let err = load_quota_file(&typo).unwrap_err();
        assert!(format!("{err:#}").contains("typo.yaml"));
    }

    #[test]
    fn setup_run_writes_reports_and_manifest() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let branches = write(inputs_dir.path(), "branches.csv", "BRANCH_ID,AREA\nB1,North\nB2,South\n");
        let setups = write(
            inputs_dir.path(),
            "setups.csv",
            "BRANCH_ID,LOB,EMPLOYEE_ID\nB1,CREDIT,EMP001\nB2,CARD,EMP002\n",
        );

        let summary = pipeline(reports.path())
            .run_setup(&SetupInputs {
                branches,
                setups,
                filter: FilterSelection::default(),
            })
            .expect("setup run");
        assert_eq!(summary.kind, RunKind::Setup);
        assert_eq!(summary.output_rows, 28);
        assert_eq!(summary.matched, Some(2));
        assert_eq!(
            summary.files,
            vec![RESULT_CSV, RESULT_PARQUET, RESULT_XLSX, SUMMARY_FILE, MANIFEST_FILE]
        );

        let run_dir = PathBuf::from(&summary.reports_dir);
        let manifest: ReportManifest = serde_json::from_slice(
            &std::fs::read(run_dir.join(MANIFEST_FILE)).expect("manifest"),
        )
        .expect("parse manifest");
        assert_eq!(manifest.run_id, summary.run_id.to_string());
        assert_eq!(manifest.files.len(), 4);
        for file in &manifest.files {
            let bytes = std::fs::read(run_dir.join(&file.path)).expect("listed file");
            assert_eq!(ReportStore::sha256_hex(&bytes), file.sha256);
            assert_eq!(bytes.len() as u64, file.bytes);
        }

        let md = std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).expect("summary");
        assert!(md.starts_with("# Setup Reconciliation"));
        assert!(md.contains("- Configured: 2"));
        assert!(md.contains("## By AREA"));

        let workbook = read_xlsx_table(run_dir.join(RESULT_XLSX)).expect("result workbook");
        let csv = read_csv_table(run_dir.join(RESULT_CSV)).expect("result csv");
        assert_eq!(workbook, csv);
    }

    #[test]
    fn setup_run_honours_filter_selection() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let branches = write(inputs_dir.path(), "branches.csv", "BRANCH_ID,AREA\nB1,North\nB2,South\n");
        let setups = write(
            inputs_dir.path(),
            "setups.csv",
            "BRANCH_ID,LOB,EMPLOYEE_ID\nB1,CREDIT,EMP001\nB2,CARD,EMP002\n",
        );

        let filter = FilterSelection::default()
            .with_areas(["North"])
            .with_lobs(["CREDIT", "CARD"]);
        let summary = pipeline(reports.path())
            .run_setup(&SetupInputs {
                branches,
                setups,
                filter,
            })
            .expect("setup run");
        assert_eq!(summary.output_rows, 2);
        assert_eq!(summary.matched, Some(1));
    }

    #[test]
    fn missing_input_names_the_file() {
        let reports = tempdir().expect("tempdir");
        let err = pipeline(reports.path())
            .run_sample(&SampleInputs {
                input: reports.path().join("nowhere.csv"),
                group_key: "AREA".into(),
                cap: 3,
                filter: FilterSelection::default(),
            })
            .unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("sample input"));
        assert!(chain.contains("nowhere.csv"));
    }

    #[test]
    fn sample_run_caps_each_group() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let mut body = String::from("ID,AREA,LOB\n");
        for i in 0..8 {
            body.push_str(&format!("N{i},North,CREDIT\n"));
        }
        for i in 0..2 {
            body.push_str(&format!("S{i},South,CARD\n"));
        }
        let input = write(inputs_dir.path(), "population.csv", &body);

        let summary = pipeline(reports.path())
            .run_sample(&SampleInputs {
                input: input.clone(),
                group_key: "AREA".into(),
                cap: 3,
                filter: FilterSelection::default(),
            })
            .expect("sample run");
        assert_eq!(summary.input_rows, 10);
        assert_eq!(summary.output_rows, 5);

        let credit_only = pipeline(reports.path())
            .run_sample(&SampleInputs {
                input,
                group_key: "AREA".into(),
                cap: 3,
                filter: FilterSelection::default().with_lobs(["CREDIT"]),
            })
            .expect("sample run");
        assert_eq!(credit_only.input_rows, 8);
        assert_eq!(credit_only.output_rows, 3);
    }

    fn work_paper_fixtures(dir: &Path) -> WorkPaperInputs {
        let branches = write(
            dir,
            "branches.csv",
            "BRANCH_ID,AREA,BRANCH_NAME\nB1,North,One\nB2,South,Two\n",
        );
        let definitions = write(
            dir,
            "definitions.csv",
            "LOB,SUB_WP,PROCESS,COMPLIANCE_INDICATOR\n\
             CREDIT,S1,P1,Collateral documents are complete\n\
             CREDIT,S1,P2,Approval within authority\n\
             CARD,S2,P1,Card limits reviewed\n",
        );
        let progress = write(
            dir,
            "progress.csv",
            "BRANCH_ID,LOB,SUB_WP,PROCESS,COMPLIANCE_INDICATOR,PIC,TOTAL_SAMPLE,SCORE\n\
             B1,CREDIT,S1,P1,  collateral documents ARE complete ,alice,4,75\n\
             B1,CARD,S2,P1,Card limits reviewed,bob,0,10\n\
             B2,CREDIT,S1,P2,Approval within authority,carol,2,50\n",
        );
        WorkPaperInputs {
            branches,
            definitions,
            progress,
            filter: FilterSelection::default(),
        }
    }

    #[test]
    fn work_papers_run_reconciles_every_branch_and_definition() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let inputs = work_paper_fixtures(inputs_dir.path());

        let summary = pipeline(reports.path())
            .run_work_papers(&inputs)
            .expect("work paper run");
        assert_eq!(summary.kind, RunKind::WorkPapers);
        assert_eq!(summary.input_rows, 2 + 3 + 3);
        assert_eq!(summary.output_rows, 6);
        assert_eq!(summary.matched, Some(3));

        let run_dir = PathBuf::from(&summary.reports_dir);
        let result = read_csv_table(run_dir.join(RESULT_CSV)).expect("result csv");
        let pics = result.column_values("PIC").unwrap();
        assert_eq!(pics.iter().flatten().count(), 3);
        let scores = result.column_values(cmrt_core::columns::SCORE).unwrap();
        assert_eq!(scores[0], Some("75"));
        // zero TOTAL_SAMPLE floors the score
        assert_eq!(scores[2], Some("100"));

        let md = std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).expect("summary");
        assert!(md.starts_with("# Work Paper Reconciliation"));
        assert!(md.contains("- With progress: 3"));
        assert!(md.contains("## Rows by LOB"));
        assert!(md.contains("| CARD | 2 |"));
        assert!(md.contains("| CREDIT | 4 |"));
    }

    #[test]
    fn work_papers_run_splits_area_and_lob_filters() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let mut inputs = work_paper_fixtures(inputs_dir.path());
        inputs.filter = FilterSelection::default()
            .with_areas(["North"])
            .with_lobs(["CREDIT"]);

        let summary = pipeline(reports.path())
            .run_work_papers(&inputs)
            .expect("work paper run");
        // one branch left, two CREDIT definitions left; the definitions file has no AREA column
        assert_eq!(summary.input_rows, 1 + 2 + 3);
        assert_eq!(summary.output_rows, 2);
        assert_eq!(summary.matched, Some(1));

        let result = read_csv_table(PathBuf::from(&summary.reports_dir).join(RESULT_CSV))
            .expect("result csv");
        assert_eq!(result.distinct_values(LOB).unwrap(), vec!["CREDIT".to_string()]);
        assert_eq!(result.distinct_values("BRANCH_ID").unwrap(), vec!["B1".to_string()]);
    }

    #[test]
    fn central_sample_run_reports_quota_overshoot() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let mut body = String::from("CENTRAL_FUNCTION,BRANCH_ID,LOB,ID\n");
        for i in 0..4 {
            body.push_str(&format!("Treasury,B1,CREDIT,C{i}\n"));
        }
        for i in 0..2 {
            body.push_str(&format!("Treasury,B1,CARD,K{i}\n"));
        }
        for i in 0..3 {
            body.push_str(&format!("Payroll,B2,CREDIT,P{i}\n"));
        }
        let input = write(inputs_dir.path(), "population.csv", &body);
        let quota = write(inputs_dir.path(), "quota.yaml", "default: 2\ngroups:\n  Treasury: 4\n");

        let summary = pipeline(reports.path())
            .run_central_sample(&CentralSampleInputs {
                input,
                top_key: "CENTRAL_FUNCTION".into(),
                branch_key: "BRANCH_ID".into(),
                extra_keys: vec![LOB.to_string()],
                quota: load_quota_file(&quota).expect("quota"),
                filter: FilterSelection::default(),
            })
            .expect("central sample run");
        assert_eq!(summary.kind, RunKind::CentralSample);
        assert_eq!(summary.input_rows, 9);
        // Treasury: share 4 per LOB sub-group gives 4 + 2 = 6 (two over quota); Payroll: 2
        assert_eq!(summary.output_rows, 8);

        let run_dir = PathBuf::from(&summary.reports_dir);
        let md = std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).expect("summary");
        assert!(md.starts_with("# Central Function Sample"));
        assert!(md.contains("| Group | Quota | Branches | Share | Main | Redistributed | Remaining |"));
        assert!(md.contains("| Payroll | 2 | 1 | 2 | 2 | 0 | 0 |"));
        assert!(md.contains("| Treasury | 4 | 1 | 4 | 6 | 0 | -2 |"));

        let result = read_csv_table(run_dir.join(RESULT_CSV)).expect("result csv");
        let ids: std::collections::HashSet<&str> =
            result.column_values("ID").unwrap().into_iter().flatten().collect();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn workbook_inputs_are_accepted() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let population = Table::from_rows(
            ["ID", "AREA"],
            vec![
                vec![Some("N1".into()), Some("North".into())],
                vec![Some("N2".into()), Some("North".into())],
                vec![Some("S1".into()), Some("South".into())],
            ],
        )
        .expect("table");
        let input = inputs_dir.path().join("population.xlsx");
        std::fs::write(&input, xlsx_bytes(&population).expect("xlsx")).expect("write");

        let summary = pipeline(reports.path())
            .run_sample(&SampleInputs {
                input,
                group_key: "AREA".into(),
                cap: 1,
                filter: FilterSelection::default(),
            })
            .expect("sample run");
        assert_eq!(summary.input_rows, 3);
        assert_eq!(summary.output_rows, 2);
    }

    #[test]
    fn compare_run_reports_overall_and_group_deltas() {
        let inputs_dir = tempdir().expect("tempdir");
        let reports = tempdir().expect("tempdir");
        let before = write(
            inputs_dir.path(),
            "before.csv",
            "AREA,STATUS\nNorth,Configured\nNorth,NotConfigured\nSouth,NotConfigured\nSouth,NotConfigured\n",
        );
        let after = write(
            inputs_dir.path(),
            "after.csv",
            "AREA,STATUS\nNorth,Configured\nNorth,Configured\nSouth,Configured\nSouth,NotConfigured\n",
        );

        let summary = pipeline(reports.path())
            .run_compare(&CompareInputs {
                before,
                after,
                status_field: "STATUS".into(),
                target_status: "Configured".into(),
                group_field: Some("AREA".into()),
            })
            .expect("compare run");
        let cmp = summary.comparison.expect("comparison");
        assert_eq!(cmp.pct_before, 25.0);
        assert_eq!(cmp.pct_after, 75.0);
        assert_eq!(cmp.delta, 50.0);
        assert_eq!(summary.output_rows, 3);

        let result = read_csv_table(PathBuf::from(&summary.reports_dir).join(RESULT_CSV))
            .expect("result csv");
        assert_eq!(result.value(0, "GROUP").unwrap(), Some(OVERALL_GROUP));
        assert_eq!(result.value(1, "GROUP").unwrap(), Some("North"));
        assert_eq!(result.value(1, "DELTA").unwrap(), Some("50.00"));
    }
}
