use imageproc::geometric_transformations::Projection;

/// Four corners, clockwise from top-left.
pub type Quad = [(f32, f32); 4];

const UNIT_SQUARE: Quad = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
// in unit-square coordinates; the edge midpoints land at exp(-2)
const GAUSSIAN_SIGMA: f32 = 0.25;

/// Single channel heat map in row-major order.
#[derive(Clone, Debug)]
pub struct ScoreMap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl ScoreMap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Warps a 2-D Gaussian onto `quad`, keeping the per-pixel maximum.
    ///
    /// Returns `false` when the quad is degenerate and nothing was drawn.
    pub fn draw_gaussian(&mut self, quad: &Quad) -> bool {
        let Some(projection) = Projection::from_control_points(*quad, UNIT_SQUARE) else {
            return false;
        };

        let (min_x, max_x) = bounds(quad.iter().map(|p| p.0), self.width);
        let (min_y, max_y) = bounds(quad.iter().map(|p| p.1), self.height);
        let denominator = 2.0 * GAUSSIAN_SIGMA * GAUSSIAN_SIGMA;

        for y in min_y..max_y {
            for x in min_x..max_x {
                let (u, v) = projection * (x as f32, y as f32);
                if !(0.0..=1.0).contains(&u) || !(0.0..=1.0).contains(&v) {
                    continue;
                }
                let value = (-((u - 0.5).powi(2) + (v - 0.5).powi(2)) / denominator).exp();
                let cell = &mut self.data[y * self.width + x];
                if value > *cell {
                    *cell = value;
                }
            }
        }

        true
    }
}

fn bounds(values: impl Iterator<Item = f32>, limit: usize) -> (usize, usize) {
    let (min, max) = values.fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let min = min.floor().max(0.0) as usize;
    let max = (max.ceil().max(0.0) as usize + 1).min(limit);

    (min.min(limit), max)
}

pub fn scale_quad(quad: &Quad, scale: f32) -> Quad {
    quad.map(|(x, y)| (x * scale, y * scale))
}

fn centroid(points: &[(f32, f32)]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.0, sy + p.1));

    (sx / n, sy / n)
}

/// Builds the link quads between neighbouring characters of each word.
///
/// The link joins the centres of the upper and lower triangles of both
/// characters. `None` means the word lengths do not add up to the number of
/// character quads.
pub fn affinity_quads(char_quads: &[Quad], word_lengths: &[usize]) -> Option<Vec<Quad>> {
    if word_lengths.iter().sum::<usize>() != char_quads.len() {
        return None;
    }

    let triangle_centres = |quad: &Quad| {
        let centre = centroid(quad);
        (
            centroid(&[quad[0], quad[1], centre]),
            centroid(&[quad[2], quad[3], centre]),
        )
    };

    let mut res = Vec::new();
    let mut start = 0;
    for &length in word_lengths {
        for i in start..(start + length).saturating_sub(1) {
            let (upper_a, lower_a) = triangle_centres(&char_quads[i]);
            let (upper_b, lower_b) = triangle_centres(&char_quads[i + 1]);
            res.push([upper_a, upper_b, lower_b, lower_a]);
        }
        start += length;
    }

    Some(res)
}
