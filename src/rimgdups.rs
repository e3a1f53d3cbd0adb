use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, CommandFactory, Parser};

use crate::cluster::Clusters;
use crate::ingest::{RecordSink, parse_records};
use crate::item::Item;
use crate::records::RecordWriter;

mod cluster;
mod ingest;
mod item;
mod records;

#[derive(Parser, Debug)]
#[command(name = "rimgdups", about = "Group near-duplicate images by perceptual hash", version)]
struct Cli {
    /// Largest Hamming distance that still counts as a match
    #[arg(short = 'l', long = "threshold", default_value_t = 1)]
    threshold: u32,

    /// Record files whose items are matched against, never clustered
    /// with each other
    #[arg(short = 'R', long = "reference-files", value_name = "FILE")]
    reference_files: Vec<PathBuf>,

    /// Cluster each input file separately instead of one global pass
    #[arg(short = 'G', long = "intragroupcheck")]
    per_file: bool,

    /// Keep records whose file no longer exists on disk
    #[arg(short = 'x', long = "missing-ok")]
    missing_ok: bool,

    /// Emit record output instead of plain path lines
    #[arg(short = 'a', long = "jsondump")]
    jsondump: bool,

    /// Read records from stdin
    #[arg(short = 'i', long = "stdin")]
    from_stdin: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    quiet: u8,

    #[arg(long = "zsh-comp-gen", hide = true)]
    zsh_comp_gen: bool,

    /// Record files
    files: Vec<PathBuf>,
}

fn ingest_file(path: &Path, items: &mut Vec<Item>, missing_ok: bool, verbose: i32) -> Result<()> {
    let input =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut sink = RecordSink { items, missing_ok, verbose };
    parse_records(&input, &path.display().to_string(), &mut sink)
}

/// Cluster the candidates at `items[nrefs..]` and emit the resulting
/// groups. With references present, candidates only ever join a
/// reference's cluster.
fn run_pass(
    items: &[Item],
    nrefs: usize,
    threshold: u32,
    writer: &mut Option<RecordWriter<io::Stdout>>,
) -> Result<()> {
    if items.len() == nrefs {
        return Ok(());
    }

    let mut clusters = Clusters::new(items.len(), threshold);
    let roots = if nrefs > 0 {
        clusters.reference(items, nrefs);
        0..nrefs
    } else {
        clusters.intra(items, 0..items.len());
        0..items.len()
    };

    match writer {
        Some(w) => clusters.write_records(items, roots, w),
        None => clusters.print_plain(items, roots, &mut io::stdout().lock()),
    }
}

fn usage() -> ! {
    Cli::command().print_help().ok();
    std::process::exit(1);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.zsh_comp_gen {
        clap_complete::generate(
            clap_complete::shells::Zsh,
            &mut Cli::command(),
            "rimgdups",
            &mut io::stdout(),
        );
        return Ok(());
    }

    if cli.from_stdin == !cli.files.is_empty() {
        usage();
    }

    let verbose = 1 + cli.verbose as i32 - cli.quiet as i32;
    let mut items: Vec<Item> = Vec::new();

    // Reference sets load once, up front, and persist across every pass.
    for path in &cli.reference_files {
        let before = items.len();
        ingest_file(path, &mut items, cli.missing_ok, verbose)?;
        if items.len() == before {
            bail!("no references in {}", path.display());
        }
    }
    let nrefs = items.len();

    let mut writer = if cli.jsondump { Some(RecordWriter::new(io::stdout())?) } else { None };

    if cli.from_stdin {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input).context("reading stdin")?;
        let mut sink =
            RecordSink { items: &mut items, missing_ok: cli.missing_ok, verbose };
        parse_records(&input, "stdin", &mut sink)?;
        run_pass(&items, nrefs, cli.threshold, &mut writer)?;
        items.truncate(nrefs);
    }

    if cli.per_file {
        for path in &cli.files {
            ingest_file(path, &mut items, cli.missing_ok, verbose)?;
            run_pass(&items, nrefs, cli.threshold, &mut writer)?;
            items.truncate(nrefs);
        }
    } else {
        for path in &cli.files {
            ingest_file(path, &mut items, cli.missing_ok, verbose)?;
        }
        run_pass(&items, nrefs, cli.threshold, &mut writer)?;
    }

    if let Some(w) = writer {
        w.finish()?;
    }
    Ok(())
}
