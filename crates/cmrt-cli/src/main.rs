use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cmrt_core::FilterSelection;
use cmrt_recon::{DuplicateKeyPolicy, Quota, RedistributionPolicy};
use cmrt_report::{
    load_quota_file, CentralSampleInputs, CompareInputs, ReportConfig, ReportPipeline, RunSummary,
    SampleInputs, SetupInputs, WorkPaperInputs,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cmrt-cli")]
#[command(about = "Compliance monitoring reconciliation and sampling")]
struct Cli {
    /// Output root for run reports (overrides CMRT_REPORTS_DIR).
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    /// Sampling seed (overrides CMRT_SAMPLE_SEED).
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Fail when an uploaded table repeats a join key.
    #[arg(long, global = true)]
    strict_keys: bool,
    #[arg(long, global = true, value_enum)]
    redraw_policy: Option<RedrawPolicy>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RedrawPolicy {
    ExcludeDrawn,
    Independent,
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// Keep only these areas (repeatable).
    #[arg(long = "area")]
    areas: Vec<String>,
    /// Keep only these lines of business (repeatable).
    #[arg(long = "lob")]
    lobs: Vec<String>,
}

impl FilterArgs {
    fn selection(&self) -> FilterSelection {
        let mut selection = FilterSelection::default();
        if !self.areas.is_empty() {
            selection = selection.with_areas(self.areas.iter().cloned());
        }
        if !self.lobs.is_empty() {
            selection = selection.with_lobs(self.lobs.iter().cloned());
        }
        selection
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile branch × LOB expectations against user setups.
    Setup {
        #[arg(long)]
        branches: PathBuf,
        #[arg(long)]
        setups: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Reconcile branch × work paper expectations against inspection progress.
    WorkPapers {
        #[arg(long)]
        branches: PathBuf,
        #[arg(long)]
        definitions: PathBuf,
        #[arg(long)]
        progress: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Draw up to `cap` rows from every group.
    Sample {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        group_by: String,
        #[arg(long, default_value_t = 6)]
        cap: usize,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Two-level quota sampling per central function and branch.
    SampleCentral {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "CENTRAL_FUNCTION")]
        top_key: String,
        #[arg(long, default_value = "BRANCH_ID")]
        branch_key: String,
        /// Additional sub-grouping keys within a branch (repeatable).
        #[arg(long = "extra-key")]
        extra_keys: Vec<String>,
        /// Uniform quota per top group.
        #[arg(long, conflicts_with = "quota_file")]
        quota: Option<usize>,
        /// YAML file with `default` and per-group quotas.
        #[arg(long)]
        quota_file: Option<PathBuf>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Compare completion rates of two snapshots.
    Compare {
        #[arg(long)]
        before: PathBuf,
        #[arg(long)]
        after: PathBuf,
        #[arg(long, default_value = "STATUS")]
        status_field: String,
        #[arg(long, default_value = "Configured")]
        target_status: String,
        #[arg(long)]
        group_by: Option<String>,
    },
}

fn config_from(cli: &Cli) -> ReportConfig {
    let mut config = ReportConfig::from_env();
    if let Some(dir) = &cli.reports_dir {
        config.reports_dir = dir.clone();
    }
    if let Some(seed) = cli.seed {
        config.sample_seed = seed;
    }
    if cli.strict_keys {
        config.duplicate_keys = DuplicateKeyPolicy::Reject;
    }
    if let Some(policy) = cli.redraw_policy {
        config.redistribution = match policy {
            RedrawPolicy::ExcludeDrawn => RedistributionPolicy::ExcludeDrawn,
            RedrawPolicy::Independent => RedistributionPolicy::IndependentRedraw,
        };
    }
    config
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} input_rows={} output_rows={} reports={}",
        summary.kind.as_str(),
        summary.run_id,
        summary.input_rows,
        summary.output_rows,
        summary.reports_dir
    );
    if let Some(matched) = summary.matched {
        println!("matched={matched}");
    }
    if let Some(cmp) = summary.comparison {
        println!(
            "before={:.2}% after={:.2}% delta={:+.2}",
            cmp.pct_before, cmp.pct_after, cmp.delta
        );
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config_from(&cli);
    info!(reports_dir = %config.reports_dir.display(), seed = config.sample_seed, "starting run");
    let pipeline = ReportPipeline::new(config);

    let summary = match cli.command {
        Commands::Setup {
            branches,
            setups,
            filter,
        } => pipeline.run_setup(&SetupInputs {
            branches,
            setups,
            filter: filter.selection(),
        })?,
        Commands::WorkPapers {
            branches,
            definitions,
            progress,
            filter,
        } => pipeline.run_work_papers(&WorkPaperInputs {
            branches,
            definitions,
            progress,
            filter: filter.selection(),
        })?,
        Commands::Sample {
            input,
            group_by,
            cap,
            filter,
        } => pipeline.run_sample(&SampleInputs {
            input,
            group_key: group_by,
            cap,
            filter: filter.selection(),
        })?,
        Commands::SampleCentral {
            input,
            top_key,
            branch_key,
            extra_keys,
            quota,
            quota_file,
            filter,
        } => {
            let quota = match (quota, quota_file) {
                (Some(n), _) => Quota::Uniform(n),
                (None, Some(path)) => load_quota_file(&path)?,
                (None, None) => bail!("sample-central needs --quota or --quota-file"),
            };
            pipeline.run_central_sample(&CentralSampleInputs {
                input,
                top_key,
                branch_key,
                extra_keys,
                quota,
                filter: filter.selection(),
            })?
        }
        Commands::Compare {
            before,
            after,
            status_field,
            target_status,
            group_by,
        } => pipeline.run_compare(&CompareInputs {
            before,
            after,
            status_field,
            target_status,
            group_field: group_by,
        })?,
    };

    print_summary(&summary);
    Ok(())
}
