use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, CommandFactory, Parser};
use turbojpeg::{
    Decompressor, Image, OutputBuf, PixelFormat, Subsamp, Transform, TransformCrop, TransformOp,
    Transformer,
};

#[derive(Parser, Debug)]
#[command(
    name = "rjpgtrim",
    about = "Losslessly trim uniform borders off JPEG files",
    version
)]
struct Cli {
    /// Smallest luminosity range within a line that stops the border scan
    #[arg(short = 't', long = "threshold", default_value_t = 26)]
    threshold: u8,

    /// Largest luminosity step between adjacent pixels within a border line
    #[arg(short = 'g', long = "gradient", default_value_t = 10)]
    gradient: u8,

    /// Crop this many pixels beyond the detected border
    #[arg(short = 'm', long = "margin", default_value_t = 4)]
    margin: usize,

    /// Overwrite files without keeping a backup
    #[arg(short = 'f', long = "clobber")]
    clobber: bool,

    /// Backup suffix when not clobbering
    #[arg(short = 'o', long = "oldsuffix", default_value = ".0ld")]
    oldsuffix: String,

    /// Only print what would be cropped
    #[arg(short = 'd', long = "dry-run")]
    dry_run: bool,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    quiet: u8,

    #[arg(long = "zsh-comp-gen", hide = true)]
    zsh_comp_gen: bool,

    /// JPEG files
    files: Vec<PathBuf>,
}

/// Count border lines from one edge inward. `sample(line, i)` yields the
/// i-th pixel of the line-th candidate line, counted from the edge. A line
/// is still border while its adjacent-pixel steps stay within `gradient`
/// and its luminosity range stays within `threshold`; the returned depth is
/// the border count plus the starting margin.
fn border_depth<F>(lines: usize, samples: usize, margin: usize, gradient: u8, threshold: u8, sample: F) -> usize
where
    F: Fn(usize, usize) -> u8,
{
    let mut depth = margin;
    for line in 0..lines {
        let mut min = 255i32;
        let mut max = 0i32;
        let mut step = 0i32;
        let mut prev: Option<i32> = None;
        for i in 0..samples {
            let v = sample(line, i) as i32;
            min = min.min(v);
            max = max.max(v);
            if let Some(p) = prev {
                step = step.max((p - v).abs());
            }
            prev = Some(v);
        }
        if step > gradient as i32 || max - min > threshold as i32 {
            break;
        }
        depth += 1;
    }
    depth
}

/// MCU dimensions for a chroma subsampling mode; the lossless crop origin
/// must land on these boundaries.
fn mcu_size(subsamp: Subsamp) -> (usize, usize) {
    match subsamp {
        Subsamp::None | Subsamp::Gray => (8, 8),
        Subsamp::Sub2x1 => (16, 8),
        Subsamp::Sub2x2 => (16, 16),
        Subsamp::Sub1x2 => (8, 16),
        Subsamp::Sub4x1 => (32, 8),
        _ => (16, 16),
    }
}

/// The MCU-aligned crop rectangle for the measured border depths, or None
/// when alignment leaves nothing croppable. The origin rounds inward to the
/// next MCU boundary; width and height round down to whole MCUs.
fn crop_rect(
    w: usize,
    h: usize,
    ml: usize,
    mt: usize,
    mr: usize,
    mb: usize,
    xmod: usize,
    ymod: usize,
) -> Option<(usize, usize, usize, usize)> {
    let xm = ml % xmod;
    let ym = mt % ymod;
    let cx = ml + (xmod - xm);
    let cy = mt + (ymod - ym);

    let mut cw = w as i64 - mr as i64 - xm as i64 - cx as i64;
    cw -= cw % xmod as i64;
    let mut ch = h as i64 - mb as i64 - ym as i64 - cy as i64;
    ch -= ch % ymod as i64;

    if cw <= 0 || ch <= 0 {
        return None;
    }
    let (cw, ch) = (cw as usize, ch as usize);
    if cx + cw > w || cy + ch > h {
        return None;
    }
    Some((cx, cy, cw, ch))
}

fn transform_and_write(
    path: &Path,
    data: &[u8],
    (cx, cy, cw, ch): (usize, usize, usize, usize),
) -> Result<()> {
    let mut transformer = Transformer::new()?;
    let mut crop = TransformCrop::default();
    crop.x = cx;
    crop.y = cy;
    crop.width = Some(cw);
    crop.height = Some(ch);
    let mut transform = Transform::default();
    transform.op = TransformOp::None;
    transform.crop = Some(crop);
    transform.perfect = true;

    let mut out = OutputBuf::new_owned();
    transformer
        .transform(&transform, data, &mut out)
        .with_context(|| format!("cannot transform {}", path.display()))?;

    let mut file =
        fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    file.write_all(&out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Re-encode the crop into the original path. Unless clobbering, the
/// original is first renamed aside and restored on any later failure; a
/// successful write leaves the renamed file behind as the backup.
fn crop_file(cli: &Cli, path: &Path, data: &[u8], rect: (usize, usize, usize, usize)) -> Result<()> {
    let backup = if cli.clobber {
        None
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(&cli.oldsuffix);
        let backup = PathBuf::from(name);
        if let Err(e) = fs::rename(path, &backup) {
            bail!("cannot backup {}, skipping: {e}", path.display());
        }
        Some(backup)
    };

    let written = transform_and_write(path, data, rect);
    if written.is_err()
        && let Some(backup) = &backup
    {
        let _ = fs::rename(backup, path);
    }
    written
}

fn handle(cli: &Cli, verbose: i32, path: &Path) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;

    let mut decompressor = Decompressor::new()?;
    let header = decompressor
        .read_header(&data)
        .with_context(|| format!("unable to read header: {}", path.display()))?;
    let (w, h) = (header.width, header.height);

    let mut gray = vec![0u8; w * h];
    decompressor
        .decompress(
            &data,
            Image {
                pixels: gray.as_mut_slice(),
                width: w,
                pitch: w,
                height: h,
                format: PixelFormat::GRAY,
            },
        )
        .with_context(|| format!("unable to decompress: {}", path.display()))?;

    let (margin, gradient, threshold) = (cli.margin, cli.gradient, cli.threshold);
    let mt = border_depth(h.saturating_sub(1), w, margin, gradient, threshold, |o, i| {
        gray[o * w + i]
    });
    let mb = border_depth(h.saturating_sub(1), w, margin, gradient, threshold, |o, i| {
        gray[(h - 1 - o) * w + i]
    });
    // Vertical borders only count the rows between the horizontal ones.
    let inner_rows = h.saturating_sub(mt + mb);
    let ml = border_depth(w.saturating_sub(1), inner_rows, margin, gradient, threshold, |o, i| {
        gray[(mt + i) * w + o]
    });
    let mr = border_depth(w.saturating_sub(1), inner_rows, margin, gradient, threshold, |o, i| {
        gray[(mt + i) * w + (w - 1 - o)]
    });

    if mt > margin || mb > margin || ml > margin || mr > margin {
        let (xmod, ymod) = mcu_size(header.subsamp);
        let rect = crop_rect(w, h, ml, mt, mr, mb, xmod, ymod);

        if verbose > 1 || (verbose >= 1 && rect.is_some()) {
            let (cx, cy, cw, ch) = rect.unwrap_or((0, 0, 0, 0));
            println!(
                "{} {} l={ml} t={mt} r={mr} b={mb} ({w}x{h}) {cw}x{ch}+{cx}+{cy}",
                path.display(),
                rect.is_some() as u8,
            );
        }

        if let Some(rect) = rect
            && !cli.dry_run
        {
            crop_file(cli, path, &data, rect)?;
        }
    }
    Ok(())
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
            "rjpgtrim",
            &mut io::stdout(),
        );
        return Ok(());
    }

    if cli.files.is_empty() {
        usage();
    }

    let verbose = 1 + cli.verbose as i32 - cli.quiet as i32;
    let mut failed = false;
    for path in &cli.files {
        if let Err(e) = handle(&cli, verbose, path) {
            eprintln!("rjpgtrim: {e:#}");
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
