//! Face chip alignment via a 4-DOF similarity transform.
//!
//! Five anchors derived from the 68-point landmarks are mapped onto a
//! canonical template by least squares, and the colour image is warped
//! into a square chip for the embedding model.

use image::{Rgb, RgbImage};

/// Canonical anchor positions on a 112×112 chip: left eye, right eye,
/// nose tip, left mouth corner, right mouth corner.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Template anchors scaled to a `size`×`size` chip.
pub fn template_points(size: u32) -> [(f32, f32); 5] {
    let k = size as f32 / 112.0;
    TEMPLATE_112.map(|(x, y)| (x * k, y * k))
}

/// Least-squares similarity transform from `src` to `dst`.
///
/// Returns `[a, -b, tx, b, a, ty]`, i.e. the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// Falls back to identity when the system is degenerate.
pub fn estimate_similarity_transform(src: &[(f32, f32)], dst: &[(f32, f32)]) -> [f32; 6] {
    // Unknowns [a, b, tx, ty]; each point pair contributes two rows:
    //   [sx, -sy, 1, 0] -> dx
    //   [sy,  sx, 0, 1] -> dy
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (r, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += r[j] * r[k];
                }
                atb[j] += r[j] * rhs;
            }
        }
    }

    match solve_4x4(ata, atb) {
        Some([a, b, tx, ty]) => [a as f32, -b as f32, tx as f32, b as f32, a as f32, ty as f32],
        None => [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
    }
}

/// Gaussian elimination with partial pivoting. `None` for singular systems.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp `image` through `matrix` into a `size`×`size` chip (bilinear,
/// black outside the source).
pub fn warp_affine(image: &RgbImage, matrix: &[f32; 6], size: u32) -> RgbImage {
    let (a, tx, b, ty) = (matrix[0], matrix[2], matrix[3], matrix[5]);
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(size, size);
    }
    let (ia, ib) = (a / det, b / det);
    let (w, h) = (image.width() as i64, image.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    RgbImage::from_fn(size, size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let (tl, tr) = (sample(x0, y0), sample(x0 + 1, y0));
        let (bl, br) = (sample(x0, y0 + 1), sample(x0 + 1, y0 + 1));

        let mut out = [0u8; 3];
        for c in 0..3 {
            let v = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            out[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

/// Align a face to a canonical `size`×`size` colour chip.
pub fn align_face(image: &RgbImage, anchors: &[(f32, f32); 5], size: u32) -> RgbImage {
    let matrix = estimate_similarity_transform(anchors, &template_points(size));
    warp_affine(image, &matrix, size)
}
