use anyhow::Result;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::face::Detection;

pub const ALIGNED_SIZE: u32 = 112;

/// Five-point template SFace was trained on, in 112x112 crop pixels.
pub const REFERENCE_LANDMARKS: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// 2D similarity transform `q = [[a, -b], [b, a]] * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`. `None` if the source points
    /// are degenerate.
    pub fn estimate(src: &[[f32; 2]], dst: &[[f32; 2]]) -> Option<Self> {
        if src.len() != dst.len() || src.is_empty() {
            return None;
        }
        let n = src.len() as f32;
        let mean = |pts: &[[f32; 2]]| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
            [sx / n, sy / n]
        };
        let (ms, md) = (mean(src), mean(dst));

        let (mut dot, mut cross, mut var) = (0.0f32, 0.0f32, 0.0f32);
        for (p, q) in src.iter().zip(dst) {
            let (px, py) = (p[0] - ms[0], p[1] - ms[1]);
            let (qx, qy) = (q[0] - md[0], q[1] - md[1]);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            var += px * px + py * py;
        }
        if var <= f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / var, cross / var);
        Some(Self {
            a,
            b,
            tx: md[0] - (a * ms[0] - b * ms[1]),
            ty: md[1] - (b * ms[0] + a * ms[1]),
        })
    }

    pub fn apply(&self, p: [f32; 2]) -> [f32; 2] {
        [
            self.a * p[0] - self.b * p[1] + self.tx,
            self.b * p[0] + self.a * p[1] + self.ty,
        ]
    }

    pub fn invert(&self, q: [f32; 2]) -> [f32; 2] {
        let det = self.a * self.a + self.b * self.b;
        let (x, y) = (q[0] - self.tx, q[1] - self.ty);
        [
            (self.a * x + self.b * y) / det,
            (-self.b * x + self.a * y) / det,
        ]
    }
}

fn landmark_points(detection: &Detection) -> [[f32; 2]; 5] {
    let lm = &detection.landmarks;
    std::array::from_fn(|i| [lm[i * 2], lm[i * 2 + 1]])
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Option<Rgb<u8>> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let corners = [
        (img.get_pixel(x0, y0), (1.0 - fx) * (1.0 - fy)),
        (img.get_pixel(x1, y0), fx * (1.0 - fy)),
        (img.get_pixel(x0, y1), (1.0 - fx) * fy),
        (img.get_pixel(x1, y1), fx * fy),
    ];
    let mut out = [0u8; 3];
    for (c, slot) in out.iter_mut().enumerate() {
        let v: f32 = corners.iter().map(|(p, wgt)| p[c] as f32 * wgt).sum();
        *slot = v.round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}

/// Warp the detected face onto the 112x112 SFace template.
pub fn align_face(img: &DynamicImage, detection: &Detection) -> Result<RgbImage> {
    let transform = Similarity::estimate(&landmark_points(detection), &REFERENCE_LANDMARKS)
        .ok_or_else(|| anyhow::anyhow!("degenerate landmarks, cannot align face"))?;

    let (w, h) = img.dimensions();
    anyhow::ensure!(w > 0 && h > 0, "cannot align a face in an empty image");
    let source = img.to_rgb8();

    Ok(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let [sx, sy] = transform.invert([x as f32, y as f32]);
        sample_bilinear(&source, sx, sy).unwrap_or(Rgb([0, 0, 0]))
    }))
}
