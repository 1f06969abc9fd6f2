// src/config.rs

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::pipeline::PipelineConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "bcrmerge")]
#[command(about = "Merge a dataset's billing credit spreadsheets into one CSV plus a missing-fields report")]
pub struct Args {
    /// Dataset name; spreadsheets are read from <ASSETS_DIR>/<DATASET>
    #[arg(short = 'f', long = "file", value_name = "DATASET")]
    pub dataset: String,

    /// Directory holding one sub-directory per dataset, relative to the working directory
    #[arg(long, default_value = "assets")]
    pub assets_dir: PathBuf,

    /// Where the two CSV outputs are written (default: working directory)
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Rows buffered between file workers and the writer
    #[arg(long, default_value_t = 100)]
    pub channel_capacity: usize,

    /// Aggregate writes in flight at once (1 keeps each file's rows in order)
    #[arg(long, default_value_t = 4)]
    pub write_workers: usize,

    /// Spreadsheets read in parallel (default: number of CPUs)
    #[arg(long)]
    pub file_workers: Option<usize>,

    /// Seconds queued rows may take to be written once all files are read or the run is cancelled
    #[arg(long, default_value_t = 300)]
    pub drain_timeout_secs: u64,

    /// Spreadsheet extension to pick up; repeat for more than one
    #[arg(long = "extension", default_value = "xlsx")]
    pub extensions: Vec<String>,

    /// Also write a JSON run summary to this path
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Where the two outputs of a run go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub aggregate: PathBuf,
    pub validation: PathBuf,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub dataset: String,
    pub dataset_dir: PathBuf,
    pub output_dir: PathBuf,
    pub summary_path: Option<PathBuf>,
    pub verbose: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Resolve `args` against the working directory and check them.
    pub fn resolve(args: Args, cwd: &Path) -> Result<Self> {
        let dataset = args.dataset.trim().to_string();
        if dataset.is_empty() {
            bail!("dataset name is empty");
        }
        if dataset.contains(['/', '\\']) || dataset == "." || dataset == ".." {
            bail!("dataset name `{}` must be a plain directory name", dataset);
        }
        if args.channel_capacity == 0 {
            bail!("--channel-capacity must be at least 1");
        }
        if args.write_workers == 0 {
            bail!("--write-workers must be at least 1");
        }
        let file_workers = args.file_workers.unwrap_or_else(num_cpus::get);
        if file_workers == 0 {
            bail!("--file-workers must be at least 1");
        }

        let extensions: Vec<String> = args
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if extensions.is_empty() {
            bail!("at least one --extension is required");
        }

        Ok(Self {
            dataset_dir: cwd.join(&args.assets_dir).join(&dataset),
            output_dir: args
                .output_dir
                .map(|d| cwd.join(d))
                .unwrap_or_else(|| cwd.to_path_buf()),
            summary_path: args.summary.map(|p| cwd.join(p)),
            verbose: args.verbose,
            pipeline: PipelineConfig {
                channel_capacity: args.channel_capacity,
                write_workers: args.write_workers,
                file_workers,
                drain_timeout: Duration::from_secs(args.drain_timeout_secs),
                extensions,
            },
            dataset,
        })
    }

    /// Output file names carry the dataset and one shared UTC timestamp.
    pub fn output_paths(&self, now: DateTime<Utc>) -> OutputPaths {
        let ts = now.format("%Y-%m-%dT%H%M%SZ");
        OutputPaths {
            aggregate: self
                .output_dir
                .join(format!("{} - all bcrs - {}.csv", self.dataset, ts)),
            validation: self
                .output_dir
                .join(format!("{} - missing fields - {}.csv", self.dataset, ts)),
        }
    }
}
