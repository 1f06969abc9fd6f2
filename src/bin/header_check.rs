//! Report where each billing column sits in every spreadsheet of a dataset,
//! without writing any merged output.
//!
//! The YAML maps each file's path, relative to the dataset directory, to
//! field name to zero-based column. Absent fields are `null`:
//!
//! ```yaml
//! jan.xlsx:
//!   Sat Acct: 0
//!   Fund: null
//! ```
use anyhow::{Context, Result};
use bcrmerge::{
    process::{discover_files, first_header, CalamineOpener, WorkbookOpener},
    schema::ColumnLocator,
};
use clap::Parser;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, Write},
    path::PathBuf,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Report = BTreeMap<String, BTreeMap<String, Option<usize>>>;

#[derive(Parser, Debug)]
#[command(name = "header_check", about = "Locate the billing columns in each spreadsheet")]
struct Cli {
    /// Dataset directory to walk
    dir: PathBuf,

    /// Spreadsheet extension to pick up; repeat for more than one
    #[arg(long = "extension", default_value = "xlsx")]
    extensions: Vec<String>,

    /// Write the YAML here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let found = discover_files(&cli.dir, &cli.extensions)?;
    info!(files = found.files.len(), "checking headers");

    let mut report: Report = BTreeMap::new();
    let mut unreadable = 0usize;
    for path in &found.files {
        let header = CalamineOpener
            .open(path)
            .and_then(|mut book| first_header(book.as_mut()));
        let header = match header {
            Ok(h) => h.unwrap_or_default(),
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{:#}", e), "unreadable");
                unreadable += 1;
                continue;
            }
        };

        let locator = ColumnLocator::from_headers(&header);
        let fields = locator
            .to_named()
            .into_iter()
            .map(|(name, pos)| (name.to_string(), pos))
            .collect();
        let key = path.strip_prefix(&cli.dir).unwrap_or(path);
        report.insert(key.display().to_string(), fields);
    }

    let yaml = serde_yaml::to_string(&report)?;
    match &cli.output {
        Some(path) => {
            let mut out = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            out.write_all(yaml.as_bytes())?;
            info!(path = %path.display(), files = report.len(), "report written");
        }
        None => io::stdout().write_all(yaml.as_bytes())?,
    }

    if unreadable > 0 {
        warn!(unreadable, "some files could not be read");
    }
    Ok(())
}
