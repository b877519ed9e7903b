use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use log::LevelFilter;
use stagefit::{
    analysis::DEFAULT_THREADS,
    diagnostics,
    layers::{LayerOrder, NamingConfig, DEFAULT_INPUTS_REGEX_LAYER_0, DEFAULT_LAYER_NAME_REGEX},
    profile::RawProfile,
    report::{self, OutputFormat},
    snapshot::Snapshot,
    AnalysisContext, GreedySolver, OperationList, SolverConfig,
};

const TILES_TO_SHOW: usize = 10;

/// Works out how to split a model that does not fit on one device into
/// pipeline stages that fit in the memory of each tile.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Profile of the compiled program (JSON), or a saved analysis with
    /// --load-from-file
    profile: PathBuf,

    /// Output format of tables and splits
    #[arg(long, value_enum, default_value_t = OutputFormat::Tsv)]
    format: OutputFormat,

    /// Print total memory by category
    #[arg(long)]
    memory_totals: bool,

    /// Solve for split points
    #[arg(long)]
    solve: bool,

    /// When solving, the maximum number of devices
    #[arg(long, default_value_t = 16)]
    num_devices: usize,

    /// When solving, the memory per tile in bytes
    #[arg(long, default_value_t = 638_976)]
    mem_per_tile: u64,

    /// Print a memory breakdown per operation
    #[arg(long)]
    operation_breakdown: bool,

    /// Print a memory breakdown per layer
    #[arg(long)]
    layer_breakdown: bool,

    /// For each layer pair, print the size of shared variables
    #[arg(long)]
    memory_affinity: bool,

    /// For each layer pair, print the size of variables created in the first
    /// layer and consumed in the second one
    #[arg(long)]
    interlayer_communication: bool,

    /// Sort layers by name or by program steps
    #[arg(long, value_enum, default_value_t = LayerOrder::Steps)]
    layer_order: LayerOrder,

    /// Regular expression extracting the layer name (first capture group)
    /// from operation names
    #[arg(long, default_value = DEFAULT_LAYER_NAME_REGEX)]
    layer_name_regex: String,

    /// Operations with an input matching this expression belong to the
    /// first layer
    #[arg(long, default_value = DEFAULT_INPUTS_REGEX_LAYER_0)]
    inputs_regex_layer_0: String,

    /// Ignore operations outside any layer when solving
    #[arg(long)]
    layer_operations_only: bool,

    /// Save the analysis to this file for later runs
    #[arg(long)]
    save_to_file: Option<PathBuf>,

    /// Treat the profile argument as an analysis saved with --save-to-file
    #[arg(long)]
    load_from_file: bool,

    /// Worker threads for the liveness simulation
    #[arg(long, default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Maximum number of rows of the operation breakdown
    #[arg(long)]
    limit: Option<usize>,

    /// Enable debug log messages
    #[arg(short, long)]
    debug: bool,
}

/// Configure the logger level and formating string.
fn setup_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::builder()
        .filter_level(level)
        .format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()))
        .init();
}

fn load(args: &Args, naming: &NamingConfig) -> Result<(AnalysisContext, OperationList)> {
    if args.load_from_file {
        let snapshot = Snapshot::load(&args.profile)
            .with_context(|| format!("Failed to load analysis {}", args.profile.display()))?;
        return Ok(snapshot.restore(naming, args.threads)?);
    }

    log::info!("Loading profile...");
    let profile = RawProfile::from_file(&args.profile)
        .with_context(|| format!("Failed to read profile {}", args.profile.display()))?;
    let (ctx, operations) = OperationList::analyse(&profile, naming, args.threads)?;
    if let Some(path) = &args.save_to_file {
        Snapshot::capture(&ctx, &operations)
            .save(path)
            .with_context(|| format!("Failed to save analysis to {}", path.display()))?;
    }
    Ok((ctx, operations))
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(args.debug);

    let naming = NamingConfig {
        layer_name_regex: args.layer_name_regex.clone(),
        inputs_regex_layer_0: args.inputs_regex_layer_0.clone(),
        layer_order: args.layer_order,
    };
    let (ctx, operations) = load(&args, &naming)?;
    let solver = GreedySolver::new(
        &ctx,
        &operations,
        SolverConfig {
            layer_operations_only: args.layer_operations_only,
            ..SolverConfig::default()
        },
    );

    let delimiter = args.format.delimiter();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.operation_breakdown {
        let all: Vec<_> = operations.iter().collect();
        report::write_operation_breakdown(&mut out, &ctx, &all, delimiter, args.limit)?;
        writeln!(out)?;
    }

    if args.layer_breakdown {
        report::write_layer_breakdown(&mut out, &solver, delimiter)?;
        writeln!(out)?;
    }

    if args.memory_totals {
        let memory = solver.single_stage_memory();
        writeln!(out, "Total memory: {}", memory.total_mem.sum())?;
        report::write_memory_totals(&mut out, &memory, delimiter, TILES_TO_SHOW)?;

        let mut hist = histo::Histogram::with_buckets(10);
        for bytes in memory.total_mem.as_slice() {
            hist.add(*bytes);
        }
        writeln!(out, "\nPer-tile memory distribution:\n{}", hist)?;
    }

    if args.memory_affinity {
        let matrix = diagnostics::memory_affinity(&ctx, solver.operations());
        report::write_matrix(&mut out, &matrix, delimiter)?;
        writeln!(out)?;
    }

    if args.interlayer_communication {
        let matrix = diagnostics::interlayer_exchange(&ctx, solver.operations());
        report::write_matrix(&mut out, &matrix, delimiter)?;
        writeln!(out)?;
    }

    if args.solve {
        let outcome = solver.solve(args.num_devices, args.mem_per_tile);
        if args.format == OutputFormat::Json {
            report::write_splits_json(&mut out, &outcome)?;
            writeln!(out)?;
        } else {
            writeln!(out)?;
            match (outcome.min_layers, outcome.proportion) {
                (Some(min_layers), Some(proportion)) if outcome.success => writeln!(
                    out,
                    "{}",
                    format!(
                        "Model fits in {} devices at {:.0}% of tile memory with at least {} layers per stage",
                        outcome.splits.len(),
                        proportion * 100.0,
                        min_layers
                    )
                    .green()
                )?,
                _ if outcome.success => writeln!(out, "{}", "Nothing to split".green())?,
                _ => writeln!(
                    out,
                    "{}",
                    format!("Unable to fit model in {} devices", args.num_devices).red()
                )?,
            }
            report::write_splits(&mut out, &outcome, delimiter)?;
        }
    }

    out.flush()?;
    Ok(())
}
