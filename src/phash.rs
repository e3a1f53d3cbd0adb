use std::sync::Arc;

use rustdct::{DctPlanner, TransformType2And3};

use crate::item::{NTRANS, Trans};

pub const GRID: usize = 8;
pub const NCELLS: usize = GRID * GRID;

/// Reduce an 8-bit grayscale image to the 8x8 grid of cell means the DCT
/// runs on. Cells are Dx x Dy with Dx = w/8 and Dy = h/8; the fractional
/// remainder is split between the two sides so the sampled area is centered.
/// Requires w >= 8 and h >= 8.
pub fn block_means(pixels: &[u8], w: usize, h: usize) -> [f64; NCELLS] {
    let dx = w / GRID;
    let dy = h / GRID;
    let x0 = (w % GRID) / 2;
    let y0 = (h % GRID) / 2;

    let mut out = [0.0f64; NCELLS];
    let mut i = 0;
    for cy in 0..GRID {
        for cx in 0..GRID {
            let mut sum = 0.0f64;
            for ry in 0..dy {
                let row = y0 + cy * dy + ry;
                for rx in 0..dx {
                    let col = x0 + cx * dx + rx;
                    sum += pixels[w * row + col] as f64;
                }
            }
            out[i] = sum / (dx * dy) as f64;
            i += 1;
        }
    }
    out
}

/// DCT-II fingerprinter over an 8x8 mean grid.
///
/// The planned transform is unscaled; that differs from the orthonormal
/// matrix only by positive per-row and per-column factors, so the sign of
/// every coefficient (and therefore every hash bit) is unaffected.
pub struct DctHasher {
    dct: Arc<dyn TransformType2And3<f64>>,
    scratch_len: usize,
}

impl DctHasher {
    pub fn new() -> Self {
        let mut planner = DctPlanner::new();
        let dct = planner.plan_dct2(GRID);
        let scratch_len = dct.get_scratch_len().max(GRID);
        Self { dct, scratch_len }
    }

    /// 2D DCT-II of the grid, then one bit per coefficient: bit i is set
    /// iff coefficient i is strictly positive. Row-major, bit 0 least
    /// significant. The DC term participates like any other coefficient.
    pub fn hash(&self, means: &[f64; NCELLS]) -> u64 {
        let mut buf = *means;
        let mut scratch = vec![0.0f64; self.scratch_len];

        for row in buf.chunks_mut(GRID) {
            self.dct.process_dct2_with_scratch(row, &mut scratch);
        }

        let mut turned = [0.0f64; NCELLS];
        transpose::transpose(&buf, &mut turned, GRID, GRID);

        for row in turned.chunks_mut(GRID) {
            self.dct.process_dct2_with_scratch(row, &mut scratch);
        }

        transpose::transpose(&turned, &mut buf, GRID, GRID);

        let mut hash = 0u64;
        for (i, &coeff) in buf.iter().enumerate() {
            if coeff > 0.0 {
                hash |= 1u64 << i;
            }
        }
        hash
    }
}

/// 90° counter-clockwise rotation of the cell grid.
pub fn rot1(src: &[f64; NCELLS]) -> [f64; NCELLS] {
    let mut dst = [0.0f64; NCELLS];
    for y in 0..GRID {
        for x in 0..GRID {
            dst[GRID * y + x] = src[GRID * x + (GRID - 1 - y)];
        }
    }
    dst
}

/// 180° rotation.
pub fn rot2(src: &[f64; NCELLS]) -> [f64; NCELLS] {
    let mut dst = [0.0f64; NCELLS];
    for y in 0..GRID {
        for x in 0..GRID {
            dst[GRID * y + x] = src[GRID * (GRID - 1 - y) + (GRID - 1 - x)];
        }
    }
    dst
}

/// 270° counter-clockwise rotation.
pub fn rot3(src: &[f64; NCELLS]) -> [f64; NCELLS] {
    let mut dst = [0.0f64; NCELLS];
    for y in 0..GRID {
        for x in 0..GRID {
            dst[GRID * y + x] = src[GRID * (GRID - 1 - x) + y];
        }
    }
    dst
}

/// Horizontal mirror.
pub fn flip(src: &[f64; NCELLS]) -> [f64; NCELLS] {
    let mut dst = [0.0f64; NCELLS];
    for y in 0..GRID {
        for x in 0..GRID {
            dst[GRID * y + x] = src[GRID * y + (GRID - 1 - x)];
        }
    }
    dst
}

/// Compute the requested variant hashes from one base mean grid. Rotations
/// and mirrors commute with the cell grid, so variants permute the 64 means
/// and rerun the DCT instead of re-decoding pixels. Slots for variants that
/// were not requested are left zero.
pub fn variant_hashes(
    hasher: &DctHasher,
    means: &[f64; NCELLS],
    rotate: bool,
    mirror: bool,
) -> [u64; NTRANS] {
    let mut hashes = [0u64; NTRANS];
    hashes[Trans::Base.index()] = hasher.hash(means);

    if rotate {
        hashes[Trans::Rot1.index()] = hasher.hash(&rot1(means));
        hashes[Trans::Rot2.index()] = hasher.hash(&rot2(means));
        hashes[Trans::Rot3.index()] = hasher.hash(&rot3(means));
    }

    if mirror {
        let flipped = flip(means);
        hashes[Trans::Flip.index()] = hasher.hash(&flipped);
        if rotate {
            hashes[Trans::Flr1.index()] = hasher.hash(&rot1(&flipped));
            hashes[Trans::Flr2.index()] = hasher.hash(&rot2(&flipped));
            hashes[Trans::Flr3.index()] = hasher.hash(&rot3(&flipped));
        }
    }

    hashes
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic but unstructured test pattern.
    fn test_pixels(w: usize, h: usize) -> Vec<u8> {
        (0..w * h).map(|i| ((i * 7 + (i / w) * 13) % 251) as u8).collect()
    }

    // Pixel-level 90 CCW rotation of a square grayscale image.
    fn rotate_pixels_ccw(src: &[u8], s: usize) -> Vec<u8> {
        let mut dst = vec![0u8; s * s];
        for y in 0..s {
            for x in 0..s {
                dst[s * y + x] = src[s * x + (s - 1 - y)];
            }
        }
        dst
    }

    fn mirror_pixels(src: &[u8], s: usize) -> Vec<u8> {
        let mut dst = vec![0u8; s * s];
        for y in 0..s {
            for x in 0..s {
                dst[s * y + x] = src[s * y + (s - 1 - x)];
            }
        }
        dst
    }

    #[test]
    fn uniform_image_has_identical_variants() {
        let pixels = vec![128u8; 16 * 16];
        let means = block_means(&pixels, 16, 16);
        let hasher = DctHasher::new();
        let hashes = variant_hashes(&hasher, &means, true, true);
        for i in 1..NTRANS {
            assert_eq!(hashes[0], hashes[i], "variant {} differs on a uniform image", i);
        }
    }

    #[test]
    fn block_means_are_centered() {
        // 10x10 with 1x1 cells: one column/row skipped on the left/top.
        let mut pixels = vec![0u8; 10 * 10];
        pixels[10 * 1 + 1] = 200;
        let means = block_means(&pixels, 10, 10);
        assert_eq!(means[0], 200.0);
        assert_eq!(means[1], 0.0);
    }

    #[test]
    fn block_means_average_cells() {
        // 16x16: 2x2 cells, all pixels of cell (0,0) set.
        let mut pixels = vec![0u8; 16 * 16];
        for y in 0..2 {
            for x in 0..2 {
                pixels[16 * y + x] = 100;
            }
        }
        let means = block_means(&pixels, 16, 16);
        assert_eq!(means[0], 100.0);
        assert_eq!(means[1], 0.0);
    }

    #[test]
    fn grid_permutation_identities() {
        let means = block_means(&test_pixels(64, 64), 64, 64);
        assert_eq!(rot1(&rot1(&rot1(&rot1(&means)))), means, "four quarter turns");
        assert_eq!(flip(&flip(&means)), means, "double mirror");
        assert_eq!(rot2(&rot2(&means)), means, "double half turn");
        assert_eq!(rot1(&rot3(&means)), means, "quarter turn and back");
        assert_eq!(rot1(&rot1(&means)), rot2(&means), "two quarter turns are a half turn");
    }

    #[test]
    fn variants_match_hashes_of_permuted_grids() {
        let means = block_means(&test_pixels(64, 64), 64, 64);
        let hasher = DctHasher::new();
        let hashes = variant_hashes(&hasher, &means, true, true);

        assert_eq!(hashes[Trans::Rot1.index()], hasher.hash(&rot1(&means)));
        assert_eq!(hashes[Trans::Rot2.index()], hasher.hash(&rot2(&means)));
        assert_eq!(hashes[Trans::Rot3.index()], hasher.hash(&rot3(&means)));
        assert_eq!(hashes[Trans::Flip.index()], hasher.hash(&flip(&means)));
        assert_eq!(hashes[Trans::Flr1.index()], hasher.hash(&rot1(&flip(&means))));
        assert_eq!(hashes[Trans::Flr2.index()], hasher.hash(&rot2(&flip(&means))));
        assert_eq!(hashes[Trans::Flr3.index()], hasher.hash(&rot3(&flip(&means))));
    }

    #[test]
    fn variant_hash_equals_base_hash_of_rotated_image() {
        // Rotating the pixels and hashing must agree with permuting the
        // mean grid, as long as the image divides evenly into cells.
        let s = 64;
        let pixels = test_pixels(s, s);
        let hasher = DctHasher::new();
        let hashes = variant_hashes(&hasher, &block_means(&pixels, s, s), true, true);

        let rotated = rotate_pixels_ccw(&pixels, s);
        let rotated_base = hasher.hash(&block_means(&rotated, s, s));
        assert_eq!(hashes[Trans::Rot1.index()], rotated_base);

        let mirrored = mirror_pixels(&pixels, s);
        let mirrored_base = hasher.hash(&block_means(&mirrored, s, s));
        assert_eq!(hashes[Trans::Flip.index()], mirrored_base);

        let both = rotate_pixels_ccw(&mirrored, s);
        let both_base = hasher.hash(&block_means(&both, s, s));
        assert_eq!(hashes[Trans::Flr1.index()], both_base);
    }

    #[test]
    fn unrequested_variants_stay_zero() {
        let means = block_means(&test_pixels(32, 32), 32, 32);
        let hasher = DctHasher::new();

        let base_only = variant_hashes(&hasher, &means, false, false);
        assert_ne!(base_only[Trans::Base.index()], 0);
        for t in [Trans::Rot1, Trans::Rot2, Trans::Rot3, Trans::Flip, Trans::Flr1] {
            assert_eq!(base_only[t.index()], 0);
        }

        let rot_only = variant_hashes(&hasher, &means, true, false);
        assert_ne!(rot_only[Trans::Rot1.index()], 0);
        assert_eq!(rot_only[Trans::Flip.index()], 0);
        assert_eq!(rot_only[Trans::Flr1.index()], 0);

        let flip_only = variant_hashes(&hasher, &means, false, true);
        assert_ne!(flip_only[Trans::Flip.index()], 0);
        assert_eq!(flip_only[Trans::Flr1.index()], 0);
    }

    #[test]
    fn checkerboard_is_invariant_under_half_turn() {
        // 64x64 chequerboard with 8x8 tiles: the mean grid alternates and a
        // 180 degree rotation maps it onto itself.
        let s = 64;
        let mut pixels = vec![0u8; s * s];
        for y in 0..s {
            for x in 0..s {
                if ((x / 8) + (y / 8)) % 2 == 0 {
                    pixels[s * y + x] = 255;
                }
            }
        }
        let means = block_means(&pixels, s, s);
        assert_eq!(rot2(&means), means);

        let hasher = DctHasher::new();
        let hashes = variant_hashes(&hasher, &means, true, false);
        assert_eq!(hashes[Trans::Rot2.index()], hashes[Trans::Base.index()]);
    }

    #[test]
    fn hash_is_deterministic() {
        let means = block_means(&test_pixels(48, 48), 48, 48);
        let a = DctHasher::new();
        let b = DctHasher::new();
        assert_eq!(a.hash(&means), b.hash(&means));
        assert_eq!(a.hash(&means), a.hash(&means));
    }

    #[test]
    fn asymmetric_image_rotations_differ() {
        // A bright corner blob: no rotational symmetry, so the base hash
        // and its quarter turn disagree.
        let s = 64;
        let mut pixels = vec![20u8; s * s];
        for y in 0..16 {
            for x in 0..16 {
                pixels[s * y + x] = 240;
            }
        }
        let means = block_means(&pixels, s, s);
        let hasher = DctHasher::new();
        let hashes = variant_hashes(&hasher, &means, true, false);
        assert_ne!(hashes[Trans::Base.index()], hashes[Trans::Rot1.index()]);
    }
}
