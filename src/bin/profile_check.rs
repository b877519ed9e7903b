use std::{
    path::{Path, PathBuf},
    process::exit,
};

use anyhow::{Context, Result};
use clap::Parser;
use stagefit::{layers::NamingConfig, profile::RawProfile, OperationList};

/// Loads every profile in a directory and builds its analysis, reporting
/// the ones that fail.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The path to the directory containing .json profiles.
    #[arg(short, long)]
    path: PathBuf,

    /// Worker threads for the analysis.
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn check(path: &Path, threads: usize) -> Result<(usize, usize)> {
    let profile = RawProfile::from_file(path).context("Failed to parse profile")?;
    let (ctx, operations) = OperationList::analyse(&profile, &NamingConfig::default(), threads)
        .context("Failed to analyse profile")?;
    Ok((ctx.num_tiles(), operations.len()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    if !args.path.is_dir() {
        eprintln!("Error: Path must be a directory.");
        exit(1);
    }

    let pattern = args.path.join("*.json");
    let pattern = pattern.to_str().context("Path is not valid UTF-8")?;
    let mut all_ok = true;

    for entry in glob::glob(pattern)? {
        let file_path = entry.context("Failed to read directory entry")?;
        println!("Checking file: {}", file_path.display());
        match check(&file_path, args.threads) {
            Ok((tiles, operations)) => {
                println!("  {tiles} tiles, {operations} operations.");
            }
            Err(e) => {
                eprintln!("  Error: {:#}", e);
                all_ok = false;
            }
        }
    }

    if !all_ok {
        exit(1);
    }

    Ok(())
}
