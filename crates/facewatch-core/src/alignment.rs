//! Geometric face alignment ahead of embedding extraction.
//!
//! Faces with landmarks are warped onto the InsightFace 112×112 template with
//! a 4-DOF similarity transform (scale, rotation, translation) fitted by least
//! squares. Faces without landmarks fall back to a square crop around the box.

use crate::types::{FaceCrop, FaceObservation, Frame};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse mapping, `None` for a degenerate (zero-scale) transform.
    fn invert(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Similarity {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Least-squares fit of a similarity transform from `src` to `dst`.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    // Each point pair contributes two rows to A * [a, b, tx, ty]^T = B:
    //   [sx, -sy, 1, 0] = dx
    //   [sy,  sx, 0, 1] = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    match solve_4x4(ata, atb) {
        Some([a, b, tx, ty]) => Similarity { a, b, tx, ty },
        None => Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 },
    }
}

/// Gaussian elimination with partial pivoting on the augmented 4×5 matrix.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(a: [[f32; 4]; 4], b: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&x, &y| m[x][col].abs().total_cmp(&m[y][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Sample the frame through `dst → src` for every output pixel, bilinear,
/// out-of-bounds reads as black.
fn warp(frame: &Frame, to_src: &Similarity, out_size: usize) -> Vec<u8> {
    let (w, h) = (frame.width as i32, frame.height as i32);
    let sample = |x: i32, y: i32| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            frame.data[y as usize * w as usize + x as usize] as f32
        } else {
            0.0
        }
    };

    let mut output = vec![0u8; out_size * out_size];
    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = to_src.apply((ox as f32, oy as f32));
            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0) * fx * (1.0 - fy)
                + sample(x0, y0 + 1) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1) * fx * fy;

            output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

/// Warp a face onto the canonical 112×112 template using its landmarks.
pub fn align_landmarks(frame: &Frame, landmarks: &[(f32, f32); 5]) -> FaceCrop {
    let forward = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112);
    let data = match forward.invert() {
        Some(inverse) => warp(frame, &inverse, ALIGNED_SIZE),
        None => vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE],
    };
    FaceCrop {
        data,
        width: ALIGNED_SIZE as u32,
        height: ALIGNED_SIZE as u32,
    }
}

/// Produce the 112×112 crop the embedding extractor expects for a face.
pub fn align_face(frame: &Frame, face: &FaceObservation) -> FaceCrop {
    match &face.landmarks {
        Some(landmarks) => align_landmarks(frame, landmarks),
        None => {
            let crop = frame.crop(&face.rect, 1.0);
            FaceCrop {
                data: crop.resize_square(ALIGNED_SIZE),
                width: ALIGNED_SIZE as u32,
                height: ALIGNED_SIZE as u32,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let t = estimate_similarity(&pts, &pts);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = estimate_similarity(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 0.01, "a = {}, expected ~0.5", t.a);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = t.invert().unwrap();
        let p = (37.0, 91.0);
        let back = inv.apply(t.apply(p));
        assert!((back.0 - p.0).abs() < 1e-3 && (back.1 - p.1).abs() < 1e-3, "{back:?}");
    }

    #[test]
    fn test_degenerate_transform_has_no_inverse() {
        let t = Similarity { a: 0.0, b: 0.0, tx: 1.0, ty: 1.0 };
        assert!(t.invert().is_none());
    }

    #[test]
    fn test_align_output_size() {
        let frame = Frame::new(vec![128u8; 640 * 480], 640, 480, 0).unwrap();
        let aligned = align_landmarks(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.data.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        assert_eq!((aligned.width, aligned.height), (112, 112));
    }

    #[test]
    fn test_landmark_lands_on_template() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h];
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // 5x5 bright patch at the left eye survives bilinear interpolation.
        let (lx, ly) = (src[0].0 as usize, src[0].1 as usize);
        for y in ly - 2..=ly + 2 {
            for x in lx - 2..=lx + 2 {
                data[y * w + x] = 255;
            }
        }
        let frame = Frame::new(data, w as u32, h as u32, 0).unwrap();
        let aligned = align_landmarks(&frame, &src);

        let rx = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let max_val = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.data[y * ALIGNED_SIZE + x])
            .max()
            .unwrap();
        assert!(max_val > 100, "expected bright patch near ({rx}, {ry}), max={max_val}");
    }

    #[test]
    fn test_align_face_without_landmarks_uses_box() {
        let frame = Frame::new(vec![90u8; 64 * 64], 64, 64, 7).unwrap();
        let face = FaceObservation {
            rect: Rect::new(10.0, 10.0, 40.0, 50.0),
            confidence: 0.9,
            landmarks: None,
            frame_timestamp_ms: 7,
        };
        let aligned = align_face(&frame, &face);
        assert_eq!(aligned.data.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        assert!(aligned.data.iter().all(|&p| p == 90));
    }
}
