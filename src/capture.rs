use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbaImage};
use serde_json::{json, Value};
use tracing::debug;

use crate::types::{ToolError, ToolErrorCode, ToolOutcome};
use crate::viewer::Viewer;

/// Default aggregate budget for a batch, in base64 characters.
pub const DEFAULT_BYTE_BUDGET: usize = 1_309_246;
const MIN_DOWNSAMPLE: f64 = 0.05;

pub fn encode_png(image: &RgbaImage) -> ToolOutcome<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| ToolError::new(ToolErrorCode::Internal, format!("PNG encoding failed: {err}")))?;
    Ok(bytes)
}

pub fn encode_png_base64(image: &RgbaImage) -> ToolOutcome<String> {
    Ok(STANDARD.encode(encode_png(image)?))
}

/// Resolves a `start:stop:step` spec (each part optional) or a single signed
/// index against an axis of `len` positions, with Python slice semantics.
pub fn resolve_range(spec: &str, len: usize) -> ToolOutcome<Vec<usize>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return resolve_range(":", len);
    }
    let len = len as i64;
    if !spec.contains(':') {
        let index = parse_index(spec)?;
        let resolved = if index < 0 { index + len } else { index };
        if resolved < 0 || resolved >= len {
            return Err(ToolError::invalid(format!(
                "index {index} is out of bounds for axis of length {len}"
            )));
        }
        return Ok(vec![resolved as usize]);
    }

    let parts = spec.split(':').collect::<Vec<_>>();
    if parts.len() > 3 {
        return Err(ToolError::invalid(format!(
            "invalid slice '{spec}': expected start:stop:step"
        )));
    }
    let part = |index: usize| -> ToolOutcome<Option<i64>> {
        match parts.get(index).map(|text| text.trim()) {
            None | Some("") => Ok(None),
            Some(text) => parse_index(text).map(Some),
        }
    };
    let (start, stop, step) = (part(0)?, part(1)?, part(2)?.unwrap_or(1));
    if step == 0 {
        return Err(ToolError::invalid("slice step cannot be zero"));
    }

    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let bound = |value: Option<i64>, default: i64| match value {
        None => default,
        Some(v) if v < 0 => (v + len).max(lower),
        Some(v) => v.min(upper),
    };
    let (mut cursor, stop) = if step > 0 {
        (bound(start, lower), bound(stop, upper))
    } else {
        (bound(start, upper), bound(stop, lower))
    };

    let mut positions = Vec::new();
    while (step > 0 && cursor < stop) || (step < 0 && cursor > stop) {
        positions.push(cursor as usize);
        match cursor.checked_add(step) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    Ok(positions)
}

fn parse_index(text: &str) -> ToolOutcome<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| ToolError::invalid(format!("invalid slice component '{text}'")))
}

/// Uniform per-dimension scale so that `count` frames of roughly
/// `sample_bytes` each fit in `budget`.
pub fn downsample_factor(sample_bytes: usize, count: usize, budget: Option<usize>) -> f64 {
    let Some(budget) = budget else {
        return 1.0;
    };
    let naive = sample_bytes as f64 * count as f64;
    if naive <= budget as f64 || naive == 0.0 {
        return 1.0;
    }
    (budget as f64 / naive).sqrt().clamp(MIN_DOWNSAMPLE, 1.0)
}

fn scale(image: RgbaImage, factor: f64) -> RgbaImage {
    if factor >= 1.0 {
        return image;
    }
    let width = ((f64::from(image.width()) * factor).round() as u32).max(1);
    let height = ((f64::from(image.height()) * factor).round() as u32).max(1);
    imageops::resize(&image, width, height, FilterType::Triangle)
}

#[derive(Debug, Clone)]
pub struct BatchCaptureSpec {
    pub axis: i64,
    pub range: String,
    pub byte_budget: Option<usize>,
    pub canvas_only: bool,
    pub restore_position: bool,
}

#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub position: usize,
    pub width: u32,
    pub height: u32,
    pub base64_data: String,
}

#[derive(Debug, Clone)]
pub struct BatchCapture {
    pub axis: usize,
    pub requested: Vec<usize>,
    pub frames: Vec<CapturedFrame>,
    pub downsample_factor: f64,
    pub total_bytes: usize,
    pub stopped_early: bool,
}

impl BatchCapture {
    pub fn to_result(&self, byte_budget: Option<usize>) -> Value {
        let frames = self
            .frames
            .iter()
            .map(|frame| {
                json!({
                    "position": frame.position,
                    "width": frame.width,
                    "height": frame.height,
                    "mime_type": "image/png",
                    "base64_data": frame.base64_data,
                })
            })
            .collect::<Vec<_>>();
        json!({
            "status": "ok",
            "axis": self.axis,
            "requested_positions": self.requested,
            "n_frames": frames.len(),
            "frames": frames,
            "downsample_factor": self.downsample_factor,
            "total_bytes": self.total_bytes,
            "byte_budget": byte_budget,
            "stopped_early": self.stopped_early,
        })
    }
}

/// Sweeps `spec.axis` over the resolved positions, one frame per position.
/// A sample frame sizes a uniform downsample so the batch fits the budget;
/// the sweep stops before the first frame that would overflow it.
pub fn capture(viewer: &mut dyn Viewer, spec: &BatchCaptureSpec) -> ToolOutcome<BatchCapture> {
    viewer.model_mut().sync_dims();
    let nsteps = viewer.model().nsteps();
    let ndim = nsteps.len() as i64;
    let axis = if spec.axis < 0 { spec.axis + ndim } else { spec.axis };
    if axis < 0 || axis >= ndim {
        return Err(ToolError::invalid(format!(
            "axis {} is out of range for {ndim} dims",
            spec.axis
        )));
    }
    let axis = axis as usize;
    let requested = resolve_range(&spec.range, nsteps[axis])?;
    let original = viewer.model().current_step.clone();

    let swept = sweep(viewer, axis, &requested, spec);
    if spec.restore_position {
        let model = viewer.model_mut();
        model.current_step = original;
        model.sync_dims();
    }
    let (frames, factor, total_bytes, stopped_early) = swept?;
    Ok(BatchCapture {
        axis,
        requested,
        frames,
        downsample_factor: factor,
        total_bytes,
        stopped_early,
    })
}

type Sweep = (Vec<CapturedFrame>, f64, usize, bool);

fn sweep(
    viewer: &mut dyn Viewer,
    axis: usize,
    positions: &[usize],
    spec: &BatchCaptureSpec,
) -> ToolOutcome<Sweep> {
    let Some(first) = positions.first() else {
        return Ok((Vec::new(), 1.0, 0, false));
    };
    viewer.model_mut().current_step[axis] = *first;
    let sample = viewer.screenshot(spec.canvas_only);
    let sample_encoded = encode_png_base64(&sample)?;
    let factor = downsample_factor(sample_encoded.len(), positions.len(), spec.byte_budget);
    debug!(
        "batch capture: {} frames, sample {} bytes, factor {factor:.3}",
        positions.len(),
        sample_encoded.len()
    );

    let mut reusable = (factor >= 1.0).then_some((sample, sample_encoded));
    let mut frames = Vec::with_capacity(positions.len());
    let mut total = 0_usize;
    for position in positions {
        let (image, encoded) = match reusable.take() {
            Some(ready) => ready,
            None => {
                viewer.model_mut().current_step[axis] = *position;
                let image = scale(viewer.screenshot(spec.canvas_only), factor);
                let encoded = encode_png_base64(&image)?;
                (image, encoded)
            }
        };
        if spec
            .byte_budget
            .is_some_and(|budget| total + encoded.len() > budget)
        {
            return Ok((frames, factor, total, true));
        }
        total += encoded.len();
        frames.push(CapturedFrame {
            position: *position,
            width: image.width(),
            height: image.height(),
            base64_data: encoded,
        });
    }
    Ok((frames, factor, total, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::{Grid, HeadlessViewer, Layer, WindowHandle};

    fn noisy_stack(depth: usize, side: usize) -> HeadlessViewer {
        let mut state = 0x2545_F491_u64;
        let values = (0..depth * side * side)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                (state >> 56) as f64
            })
            .collect();
        let grid = Grid::new(vec![depth, side, side], values).expect("grid");
        let mut viewer = HeadlessViewer::new("stack", (side as u32, side as u32), WindowHandle::default());
        viewer.model_mut().add_layer(Layer::image("noise", grid));
        viewer
    }

    fn spec(range: &str, budget: Option<usize>) -> BatchCaptureSpec {
        BatchCaptureSpec {
            axis: 0,
            range: range.to_owned(),
            byte_budget: budget,
            canvas_only: true,
            restore_position: true,
        }
    }

    #[test]
    fn slices_follow_python_semantics() {
        assert_eq!(resolve_range(":", 4).expect("all"), vec![0, 1, 2, 3]);
        assert_eq!(resolve_range("", 3).expect("empty spec"), vec![0, 1, 2]);
        assert_eq!(resolve_range("1:5", 10).expect("range"), vec![1, 2, 3, 4]);
        assert_eq!(resolve_range("::2", 5).expect("step"), vec![0, 2, 4]);
        assert_eq!(resolve_range("::-1", 3).expect("reverse"), vec![2, 1, 0]);
        assert_eq!(resolve_range("-2:", 5).expect("tail"), vec![3, 4]);
        assert_eq!(resolve_range("8:2:-3", 10).expect("neg step"), vec![8, 5]);
        assert_eq!(resolve_range("-1", 5).expect("index"), vec![4]);
        assert_eq!(resolve_range("3:1", 5).expect("empty"), Vec::<usize>::new());
        assert_eq!(resolve_range("-100:100", 3).expect("clamped"), vec![0, 1, 2]);
    }

    #[test]
    fn extreme_steps_stop_instead_of_overflowing() {
        assert_eq!(resolve_range("1::9223372036854775807", 5).expect("huge step"), vec![1]);
        assert_eq!(resolve_range("::-9223372036854775808", 5).expect("huge reverse"), vec![4]);
        assert_eq!(resolve_range("-9223372036854775808:", 3).expect("min start"), vec![0, 1, 2]);
    }

    #[test]
    fn malformed_slices_are_invalid_arguments() {
        for bad in ["::0", "5", "-6", "1:2:3:4", "a:b"] {
            let err = resolve_range(bad, 5).expect_err(bad);
            assert_eq!(err.code, ToolErrorCode::InvalidArgument, "{bad}");
        }
    }

    #[test]
    fn factor_is_clamped_and_skipped_without_budget() {
        assert_eq!(downsample_factor(1_000, 10, None), 1.0);
        assert_eq!(downsample_factor(1_000, 10, Some(20_000)), 1.0);
        assert!((downsample_factor(1_000, 10, Some(2_500)) - 0.5).abs() < 1e-9);
        assert_eq!(downsample_factor(1_000_000, 100, Some(10)), MIN_DOWNSAMPLE);
    }

    #[test]
    fn full_sweep_without_budget_returns_every_position() {
        let mut viewer = noisy_stack(6, 32);
        let batch = capture(&mut viewer, &spec(":", None)).expect("capture");
        assert_eq!(batch.frames.len(), 6);
        assert_eq!(batch.downsample_factor, 1.0);
        assert!(!batch.stopped_early);
        let positions = batch.frames.iter().map(|f| f.position).collect::<Vec<_>>();
        assert_eq!(positions, vec![0, 1, 2, 3, 4, 5]);
        assert!(batch.frames.iter().all(|f| (f.width, f.height) == (32, 32)));
        assert_eq!(viewer.model().current_step[0], 0);
    }

    #[test]
    fn budgeted_sweep_stays_under_budget() {
        let mut viewer = noisy_stack(12, 64);
        let naive = capture(&mut viewer, &spec(":", None)).expect("naive").total_bytes;
        let budget = naive / 4;

        let batch = capture(&mut viewer, &spec(":", Some(budget))).expect("capture");
        assert!(batch.total_bytes <= budget);
        assert!(batch.frames.len() <= 12);
        assert!(!batch.frames.is_empty());
        assert!(batch.downsample_factor < 1.0);
        let summed = batch.frames.iter().map(|f| f.base64_data.len()).sum::<usize>();
        assert_eq!(summed, batch.total_bytes);
    }

    #[test]
    fn tiny_budget_stops_early_with_partial_result() {
        let mut viewer = noisy_stack(4, 32);
        let batch = capture(&mut viewer, &spec(":", Some(1))).expect("capture");
        assert!(batch.frames.is_empty());
        assert!(batch.stopped_early);
        assert_eq!(batch.downsample_factor, MIN_DOWNSAMPLE);
    }

    #[test]
    fn restore_position_is_explicit() {
        let mut viewer = noisy_stack(5, 16);
        viewer.model_mut().set_current_step(0, 2);

        capture(&mut viewer, &spec("::2", None)).expect("capture");
        assert_eq!(viewer.model().current_step[0], 2);

        let mut keep = spec("::2", None);
        keep.restore_position = false;
        capture(&mut viewer, &keep).expect("capture");
        assert_eq!(viewer.model().current_step[0], 4);
    }

    #[test]
    fn empty_slice_and_bad_axis() {
        let mut viewer = noisy_stack(3, 8);
        let batch = capture(&mut viewer, &spec("2:1", None)).expect("capture");
        assert!(batch.frames.is_empty());
        assert!(batch.requested.is_empty());

        let mut bad = spec(":", None);
        bad.axis = 7;
        let err = capture(&mut viewer, &bad).expect_err("axis");
        assert_eq!(err.code, ToolErrorCode::InvalidArgument);
    }
}
