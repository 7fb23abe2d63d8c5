use image::GrayImage;

/// Best-scoring placement of a template inside a frame, frame-local
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateMatch {
    pub x: u32,
    pub y: u32,
    pub score: f32,
}

const COARSE_STRIDE: u32 = 4;
const VARIANCE_EPSILON: f64 = 1e-6;

/// Normalized cross-correlation search over every placement of `template`
/// inside `frame`.
///
/// Two passes: a strided sweep locates the winning neighborhood, a dense
/// sweep around it locates the pixel. Scores land in 0.0..=1.0, with
/// negative correlation clamped to zero. Returns None when the template does
/// not fit the frame or is flat (a flat patch correlates with nothing).
pub fn find_best(frame: &GrayImage, template: &GrayImage) -> Option<TemplateMatch> {
    let (frame_w, frame_h) = frame.dimensions();
    let (tpl_w, tpl_h) = template.dimensions();
    if tpl_w == 0 || tpl_h == 0 || tpl_w > frame_w || tpl_h > frame_h {
        return None;
    }

    let stats = TemplateStats::new(template);
    if stats.norm < VARIANCE_EPSILON {
        return None;
    }

    let max_x = frame_w - tpl_w;
    let max_y = frame_h - tpl_h;

    let mut best = TemplateMatch {
        x: 0,
        y: 0,
        score: f32::MIN,
    };

    let mut y = 0;
    while y <= max_y {
        let mut x = 0;
        while x <= max_x {
            let score = score_at(frame, &stats, x, y);
            if score > best.score {
                best = TemplateMatch { x, y, score };
            }
            x += COARSE_STRIDE;
        }
        y += COARSE_STRIDE;
    }

    let x0 = best.x.saturating_sub(COARSE_STRIDE);
    let y0 = best.y.saturating_sub(COARSE_STRIDE);
    let x1 = (best.x + COARSE_STRIDE).min(max_x);
    let y1 = (best.y + COARSE_STRIDE).min(max_y);
    for y in y0..=y1 {
        for x in x0..=x1 {
            let score = score_at(frame, &stats, x, y);
            if score > best.score {
                best = TemplateMatch { x, y, score };
            }
        }
    }

    best.score = best.score.max(0.0);
    Some(best)
}

struct TemplateStats {
    width: u32,
    height: u32,
    /// Template pixels with the mean subtracted.
    centered: Vec<f64>,
    /// sqrt of the sum of squares of `centered`.
    norm: f64,
}

impl TemplateStats {
    fn new(template: &GrayImage) -> Self {
        let (width, height) = template.dimensions();
        let pixels: Vec<f64> = template.pixels().map(|p| f64::from(p.0[0])).collect();
        let mean = pixels.iter().sum::<f64>() / pixels.len() as f64;
        let centered: Vec<f64> = pixels.iter().map(|p| p - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
        Self {
            width,
            height,
            centered,
            norm,
        }
    }
}

fn score_at(frame: &GrayImage, stats: &TemplateStats, origin_x: u32, origin_y: u32) -> f32 {
    let count = f64::from(stats.width * stats.height);

    let mut window_sum = 0.0f64;
    let mut window_sum_sq = 0.0f64;
    let mut cross = 0.0f64;

    let mut idx = 0usize;
    for dy in 0..stats.height {
        for dx in 0..stats.width {
            let value = f64::from(frame.get_pixel(origin_x + dx, origin_y + dy).0[0]);
            window_sum += value;
            window_sum_sq += value * value;
            cross += value * stats.centered[idx];
            idx += 1;
        }
    }

    // sum((w - mean_w)(t - mean_t)) reduces to sum(w * centered_t) because
    // the centered template sums to zero.
    let window_norm_sq = window_sum_sq - window_sum * window_sum / count;
    if window_norm_sq < VARIANCE_EPSILON {
        return 0.0;
    }
    (cross / (window_norm_sq.sqrt() * stats.norm)) as f32
}
