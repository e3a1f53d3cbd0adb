use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use zune_jpeg::JpegDecoder;

// The fallback decoder is treated as non-reentrant; all fallback decodes in
// the process serialize on this lock.
static FALLBACK_LOCK: Mutex<()> = Mutex::new(());

/// Decode an image to 8-bit grayscale. JPEG data goes through zune-jpeg;
/// anything it rejects is retried with the image crate under the global
/// fallback lock.
pub fn decode_gray(path: &Path, bytes: &[u8], verbose: i32) -> Result<(u32, u32, Vec<u8>)> {
    match decode_jpeg_luma(bytes) {
        Ok(out) => Ok(out),
        Err(e) => {
            if verbose > 1 {
                eprintln!("jpeg decode failed ({e}), trying fallback: {}", path.display());
            }
            decode_fallback(path, bytes)
        }
    }
}

fn decode_jpeg_luma(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    let mut decoder = JpegDecoder::new(bytes);
    let pixels = decoder.decode().map_err(|e| anyhow!("{e}"))?;
    let info = decoder.info().ok_or_else(|| anyhow!("missing image info"))?;
    let (w, h) = (info.width as u32, info.height as u32);
    let n = w as usize * h as usize;

    // The output colorspace follows the file; distinguish by buffer size.
    if pixels.len() == n {
        Ok((w, h, pixels))
    } else if pixels.len() == n * 3 {
        let gray = pixels.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect();
        Ok((w, h, gray))
    } else if pixels.len() == n * 4 {
        let gray = pixels.chunks_exact(4).map(|p| luma(p[0], p[1], p[2])).collect();
        Ok((w, h, gray))
    } else {
        bail!("unexpected {}-byte buffer for {w}x{h}", pixels.len());
    }
}

fn decode_fallback(path: &Path, bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
    let _serial = FALLBACK_LOCK.lock().unwrap();

    let mut reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .unwrap_or_else(|_| image::ImageReader::new(Cursor::new(bytes)));
    if reader.format().is_none()
        && let Ok(fmt) = image::ImageFormat::from_path(path)
    {
        reader.set_format(fmt);
    }

    let rgb = reader.decode()?.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut gray = Vec::with_capacity(w as usize * h as usize);
    for p in rgb.pixels() {
        gray.push(luma(p[0], p[1], p[2]));
    }
    Ok((w, h, gray))
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.30 * r as f64 + 0.58 * g as f64 + 0.12 * b as f64) as u8
}
