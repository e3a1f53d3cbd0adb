use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, CommandFactory, Parser};
use crossbeam_channel::{Sender, unbounded};
use walkdir::WalkDir;

use crate::item::{Item, Trans};
use crate::phash::{DctHasher, block_means, variant_hashes};
use crate::records::{FullRecord, RecordWriter};

mod decode;
mod exifdate;
mod item;
mod phash;
mod records;

#[derive(Parser, Debug)]
#[command(name = "rimghash", about = "Compute perceptual hashes of images", version)]
struct Cli {
    /// Worker threads (1 disables the pool)
    #[arg(short = 'T', long = "threads", default_value_t = 8)]
    threads: usize,

    /// Skip files larger than this many MiB
    #[arg(short = 'M', long = "maxmegabytes", default_value_t = 64)]
    maxmegabytes: u64,

    /// Also hash the three rotations
    #[arg(short = 'r', long = "rotate")]
    rotate: bool,

    /// Also hash the mirrored image
    #[arg(short = 'f', long = "flip")]
    flip: bool,

    /// All transforms (same as -r -f)
    #[arg(short = 't', long = "transform")]
    transform: bool,

    /// Emit records instead of plain hash lines
    #[arg(short = 'a', long = "jsondump")]
    jsondump: bool,

    /// Read paths from stdin, one per line
    #[arg(short = 'i', long = "stdin")]
    from_stdin: bool,

    /// Write records to a tempfile and hand it to rimgdups
    #[arg(short = 'd', long = "dedup")]
    dedup: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    quiet: u8,

    #[arg(long = "zsh-comp-gen", hide = true)]
    zsh_comp_gen: bool,

    /// Files and/or directories
    paths: Vec<PathBuf>,
}

struct Config {
    rotate: bool,
    flip: bool,
    jsondump: bool,
    verbose: i32,
    maxbuf: u64,
}

enum Sink {
    Plain,
    Records(RecordWriter<Box<dyn Write + Send>>),
}

struct Shared {
    cfg: Config,
    sink: Mutex<Sink>,
    failed: AtomicBool,
}

impl Shared {
    fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }
}

fn hash_line(out: &mut impl Write, item: &Item, t: Trans, verbose: i32) -> io::Result<()> {
    write!(out, "{:016x}", item.hashes[t.index()])?;
    if verbose >= 1 {
        write!(out, "\t{}", item.path.display())?;
    }
    if verbose >= 2 {
        write!(out, "\t# {}", t.name())?;
    }
    writeln!(out)
}

fn print_item(shared: &Shared, item: &Item) {
    let mut sink = shared.sink.lock().unwrap_or_else(PoisonError::into_inner);
    let had_err = match &mut *sink {
        Sink::Records(writer) => writer.record(&FullRecord::from_item(item)).is_err(),
        Sink::Plain => {
            let cfg = &shared.cfg;
            let mut out = io::stdout().lock();
            let mut emit = |t| hash_line(&mut out, item, t, cfg.verbose);
            let mut err = emit(Trans::Base).is_err();
            if cfg.rotate {
                for t in [Trans::Rot1, Trans::Rot2, Trans::Rot3] {
                    err |= emit(t).is_err();
                }
            }
            if cfg.flip {
                err |= emit(Trans::Flip).is_err();
                if cfg.rotate {
                    for t in [Trans::Flr1, Trans::Flr2, Trans::Flr3] {
                        err |= emit(t).is_err();
                    }
                }
            }
            err
        }
    };
    if had_err {
        shared.fail();
    }
}

/// One complete job: read, decode, hash, print. Errors are warned and
/// recorded in the shared failure flag; the run continues.
fn handle_item(shared: &Shared, hasher: &DctHasher, mut item: Item) {
    let bytes = match fs::read(&item.path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("rimghash: read {}: {e}", item.path.display());
            shared.fail();
            return;
        }
    };

    let (w, h, gray) = match decode::decode_gray(&item.path, &bytes, shared.cfg.verbose) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("rimghash: failed to read image data {}: {e}", item.path.display());
            shared.fail();
            return;
        }
    };
    item.w = w;
    item.h = h;

    if w < 8 || h < 8 {
        eprintln!("rimghash: cannot handle {w}x{h} image {}", item.path.display());
        shared.fail();
        return;
    }

    let means = block_means(&gray, w as usize, h as usize);
    drop(gray);
    item.hashes = variant_hashes(hasher, &means, shared.cfg.rotate, shared.cfg.flip);

    if shared.cfg.jsondump {
        item.etime = exifdate::exif_timestamp(&bytes);
    }

    print_item(shared, &item);
}

fn submit(shared: &Shared, pool: Option<&Sender<Item>>, local: Option<&DctHasher>, item: Item) {
    match pool {
        Some(tx) => {
            let _ = tx.send(item);
        }
        None => {
            if let Some(hasher) = local {
                handle_item(shared, hasher, item);
            }
        }
    }
}

fn enqueue_file(
    shared: &Shared,
    pool: Option<&Sender<Item>>,
    local: Option<&DctHasher>,
    path: PathBuf,
    meta: &fs::Metadata,
) {
    if meta.len() > shared.cfg.maxbuf {
        eprintln!("rimghash: won't handle large file: {}", path.display());
        return;
    }
    let mtime = meta
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or_default();
    let item = Item {
        path,
        size: meta.len(),
        w: 0,
        h: 0,
        mtime,
        etime: None,
        hashes: [0; 8],
    };
    submit(shared, pool, local, item);
}

fn handle_path(
    shared: &Shared,
    pool: Option<&Sender<Item>>,
    local: Option<&DctHasher>,
    path: &Path,
) {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("rimghash: stat {}: {e}", path.display());
            shared.fail();
            return;
        }
    };

    if meta.is_dir() {
        for entry in WalkDir::new(path) {
            match entry {
                Ok(entry) if entry.file_type().is_file() => match entry.metadata() {
                    Ok(m) => enqueue_file(shared, pool, local, entry.into_path(), &m),
                    Err(e) => {
                        eprintln!("rimghash: stat {}: {e}", entry.path().display());
                        shared.fail();
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    eprintln!("rimghash: walk {}: {e}", path.display());
                    shared.fail();
                }
            }
        }
    } else if meta.is_file() {
        enqueue_file(shared, pool, local, path.to_path_buf(), &meta);
    } else {
        eprintln!("rimghash: not a regular file: {}", path.display());
        shared.fail();
    }
}

fn usage() -> ! {
    Cli::command().print_help().ok();
    std::process::exit(1);
}

fn run_grouper(record_file: &Path) -> ! {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = Command::new("rimgdups").arg("-a").arg(record_file).exec();
        eprintln!("rimghash: exec rimgdups: {err}");
        std::process::exit(127);
    }
    #[cfg(not(unix))]
    {
        match Command::new("rimgdups").arg("-a").arg(record_file).status() {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(e) => {
                eprintln!("rimghash: run rimgdups: {e}");
                std::process::exit(127);
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.zsh_comp_gen {
        clap_complete::generate(
            clap_complete::shells::Zsh,
            &mut Cli::command(),
            "rimghash",
            &mut io::stdout(),
        );
        return Ok(());
    }

    if cli.from_stdin == !cli.paths.is_empty() {
        usage();
    }

    let jsondump = cli.jsondump || cli.dedup;
    // Record output always carries every variant.
    let rotate = cli.rotate || cli.transform || jsondump;
    let flip = cli.flip || cli.transform || jsondump;

    let mut tmppath = None;
    let sink = if cli.dedup {
        let (file, path) = tempfile::Builder::new()
            .prefix("rimghash-")
            .tempfile()
            .context("unable to get tempfile")?
            .keep()
            .context("unable to keep tempfile")?;
        println!("Writing to tempfile {}", path.display());
        tmppath = Some(path);
        Sink::Records(RecordWriter::new(Box::new(file) as Box<dyn Write + Send>)?)
    } else if jsondump {
        Sink::Records(RecordWriter::new(Box::new(io::stdout()) as Box<dyn Write + Send>)?)
    } else {
        Sink::Plain
    };

    let shared = Arc::new(Shared {
        cfg: Config {
            rotate,
            flip,
            jsondump,
            verbose: 1 + cli.verbose as i32 - cli.quiet as i32,
            maxbuf: cli.maxmegabytes * 1024 * 1024,
        },
        sink: Mutex::new(sink),
        failed: AtomicBool::new(false),
    });

    let nthreads = cli.threads.max(1);
    let (pool, workers, local) = if nthreads > 1 {
        let (tx, rx) = unbounded::<Item>();
        let workers: Vec<_> = (0..nthreads)
            .map(|_| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let hasher = DctHasher::new();
                    while let Ok(item) = rx.recv() {
                        handle_item(&shared, &hasher, item);
                    }
                })
            })
            .collect();
        (Some(tx), workers, None)
    } else {
        (None, Vec::new(), Some(DctHasher::new()))
    };

    if cli.from_stdin {
        for line in io::stdin().lock().lines() {
            let line = line.context("reading stdin")?;
            if !line.is_empty() {
                handle_path(&shared, pool.as_ref(), local.as_ref(), Path::new(&line));
            }
        }
    } else {
        for path in &cli.paths {
            handle_path(&shared, pool.as_ref(), local.as_ref(), path);
        }
    }

    drop(pool);
    for worker in workers {
        let _ = worker.join();
    }

    let shared = Arc::into_inner(shared).context("worker still holds state")?;
    let failed = shared.failed.load(Ordering::Relaxed);
    if let Sink::Records(writer) =
        shared.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    {
        writer.finish()?;
    }

    if let Some(path) = tmppath {
        run_grouper(&path);
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
