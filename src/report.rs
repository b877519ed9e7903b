//! CSV/TSV and JSON rendering of breakdowns, splits and layer matrices.

use std::io::Write;

use csv::WriterBuilder;
use itertools::Itertools;

use crate::{
    analysis::AnalysisContext,
    diagnostics::LayerMatrix,
    error::AnalysisResult,
    memory::{CategoryTotals, MemoryBreakdown, TileBytes},
    operation::NamedRef,
    solver::{display_layer, GreedySolver, SolveOutcome},
    stage::Stage,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Tsv,
    Csv,
    Json,
}

impl OutputFormat {
    pub fn delimiter(self) -> u8 {
        match self {
            OutputFormat::Csv => b',',
            OutputFormat::Tsv | OutputFormat::Json => b'\t',
        }
    }
}

fn writer<W: Write>(out: W, delimiter: u8) -> csv::Writer<W> {
    WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(out)
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn group_of<'a>(op: &NamedRef<'a>) -> &'a str {
    op.named
        .name
        .split('/')
        .next()
        .filter(|g| !g.is_empty())
        .unwrap_or("Anonymous")
}

/// Memory of every operation on its own, with a blank line whenever the
/// first component of the operation name changes.
pub fn write_operation_breakdown<W: Write>(
    mut out: W,
    ctx: &AnalysisContext,
    operations: &[NamedRef<'_>],
    delimiter: u8,
    limit: Option<usize>,
) -> AnalysisResult<()> {
    log::info!("Generating operation breakdown...");
    let mut header = writer(&mut out, delimiter);
    header.write_record([
        "Layer",
        "Note",
        "Full name",
        "Vertex state",
        "Vertex code",
        "Exchange code",
        "Control code",
        "Variables",
    ])?;
    header.flush()?;
    drop(header);

    let groups = operations
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .chunk_by(|op| group_of(op));
    for (i, (_, group)) in (&groups).into_iter().enumerate() {
        if i > 0 {
            out.write_all(b"\n")?;
        }
        let mut wtr = writer(&mut out, delimiter);
        for op in group {
            let mut stage = Stage::new(ctx);
            stage.add(*op);
            let mem = stage.memory().totals();
            wtr.write_record([
                display_layer(op.layer()),
                op.named.note.to_string(),
                op.named.name.clone(),
                mem.vertex_state.to_string(),
                mem.vertex_code.to_string(),
                mem.exchange_code.to_string(),
                mem.control_code.to_string(),
                mem.variables.to_string(),
            ])?;
        }
        wtr.flush()?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_layer_breakdown<W: Write>(
    out: W,
    solver: &GreedySolver<'_>,
    delimiter: u8,
) -> AnalysisResult<()> {
    log::info!("Generating layer breakdown...");
    let mut wtr = writer(out, delimiter);
    wtr.write_record([
        "Name",
        "Vertex state",
        "Vertex code",
        "Exchange code",
        "Control code",
        "Variables",
        "Total (MB)",
    ])?;
    for layer in solver.layers() {
        let mem = solver
            .memory_for_layers(Some(std::slice::from_ref(layer)))
            .totals();
        wtr.write_record([
            display_layer(layer),
            mem.vertex_state.to_string(),
            mem.vertex_code.to_string(),
            mem.exchange_code.to_string(),
            mem.control_code.to_string(),
            mem.variables.to_string(),
            format!("{:.2}", mem.total_mem as f64 / BYTES_PER_MB),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Every category on the first `tiles_to_show` tiles plus the sum over all
/// tiles.
pub fn write_memory_totals<W: Write>(
    out: W,
    memory: &MemoryBreakdown,
    delimiter: u8,
    tiles_to_show: usize,
) -> AnalysisResult<()> {
    let shown = tiles_to_show.min(memory.total_mem.num_tiles());
    let mut wtr = writer(out, delimiter);
    let mut header = vec!["Category".to_string()];
    header.extend((0..shown).map(|tile| format!("Tile {tile}")));
    header.push("All tiles".to_string());
    wtr.write_record(&header)?;

    let rows: [(&str, &TileBytes); 6] = [
        ("Variables", &memory.variables),
        ("Vertex code", &memory.vertex_code),
        ("Vertex state", &memory.vertex_state),
        ("Exchange code", &memory.exchange_code),
        ("Control code", &memory.control_code),
        ("Total", &memory.total_mem),
    ];
    for (name, bytes) in rows {
        let mut record = vec![name.to_string()];
        record.extend(bytes.as_slice()[..shown].iter().map(u64::to_string));
        record.push(bytes.sum().to_string());
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

fn totals_record(from: String, to: String, mem: &CategoryTotals) -> [String; 9] {
    [
        from,
        to,
        mem.total_mem.to_string(),
        mem.max_tile_mem.to_string(),
        mem.variables.to_string(),
        mem.vertex_code.to_string(),
        mem.vertex_state.to_string(),
        mem.exchange_code.to_string(),
        mem.control_code.to_string(),
    ]
}

pub fn write_splits<W: Write>(out: W, outcome: &SolveOutcome, delimiter: u8) -> AnalysisResult<()> {
    let mut wtr = writer(out, delimiter);
    wtr.write_record([
        "layer_from",
        "layer_to",
        "total_mem",
        "max_tile_mem",
        "variables",
        "vertex_code",
        "vertex_state",
        "exchange_code",
        "control_code",
    ])?;
    for split in outcome.splits_totals() {
        wtr.write_record(totals_record(
            display_layer(&split.layer_from),
            display_layer(&split.layer_to),
            &split.mem,
        ))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_splits_json<W: Write>(out: W, outcome: &SolveOutcome) -> AnalysisResult<()> {
    serde_json::to_writer_pretty(out, &outcome.splits_totals())?;
    Ok(())
}

pub fn write_matrix<W: Write>(out: W, matrix: &LayerMatrix, delimiter: u8) -> AnalysisResult<()> {
    let mut wtr = writer(out, delimiter);
    let mut header = vec!["Layer".to_string()];
    header.extend(matrix.labels.iter().map(display_layer));
    wtr.write_record(&header)?;
    for (label, row) in matrix.labels.iter().zip(&matrix.values) {
        let mut record = vec![display_layer(label)];
        record.extend(row.iter().map(u64::to_string));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
