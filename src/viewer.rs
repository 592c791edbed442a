use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use image::{Rgba, RgbaImage};
use serde_json::{json, Value};

const MAX_GRID_VALUES: usize = 1 << 24;
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);
const CHROME: Rgba<u8> = Rgba([38, 41, 48, 255]);
const TITLE_BAR: Rgba<u8> = Rgba([24, 26, 31, 255]);
const TITLE_BAR_PX: u32 = 22;
const FRAME_PX: u32 = 4;

pub const BLENDING_MODES: &[&str] = &[
    "translucent",
    "translucent_no_depth",
    "additive",
    "minimum",
    "opaque",
];

pub const COLORMAPS: &[&str] = &[
    "gray", "red", "green", "blue", "cyan", "magenta", "yellow", "viridis", "magma",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Image,
    Labels,
    Points,
}

impl LayerKind {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Image => "Image",
            Self::Labels => "Labels",
            Self::Points => "Points",
        }
    }
}

/// Dense row-major n-dimensional array of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl Grid {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        if shape.is_empty() || shape.contains(&0) {
            anyhow::bail!("array shape {shape:?} has no elements");
        }
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            anyhow::bail!(
                "array shape {shape:?} needs {expected} values, got {}",
                values.len()
            );
        }
        Ok(Self { shape, values })
    }

    /// Builds a grid from nested JSON lists; ragged input is rejected.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::Array(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }
        if shape.is_empty() {
            anyhow::bail!("data must be a nested list of numbers");
        }
        let total = shape.iter().product::<usize>();
        if total > MAX_GRID_VALUES {
            anyhow::bail!("data has {total} values, limit is {MAX_GRID_VALUES}");
        }
        let mut values = Vec::with_capacity(total);
        flatten_json(value, &shape, 0, &mut values)?;
        Self::new(shape, values)
    }

    pub fn from_image_file(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed reading image file {}", path.display()))?
            .to_luma8();
        let (width, height) = image.dimensions();
        let values = image.into_raw().into_iter().map(f64::from).collect();
        Self::new(vec![height as usize, width as usize], values)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn value_range(&self) -> [f64; 2] {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for value in &self.values {
            lo = lo.min(*value);
            hi = hi.max(*value);
        }
        if lo == hi {
            hi = lo + 1.0;
        }
        [lo, hi]
    }

    pub fn is_integral(&self) -> bool {
        self.values.iter().all(|value| value.fract() == 0.0)
    }

    /// Returns `(rows, cols, samples)` of the trailing 2-D plane selected by
    /// `leading` indices (one per leading axis, clamped to the axis length).
    pub fn plane(&self, leading: &[usize]) -> (usize, usize, &[f64]) {
        if self.shape.len() == 1 {
            return (1, self.shape[0], &self.values);
        }
        let nd = self.shape.len();
        let rows = self.shape[nd - 2];
        let cols = self.shape[nd - 1];
        let mut offset = 0;
        let mut stride = rows * cols;
        for axis in (0..nd - 2).rev() {
            let index = leading
                .get(axis)
                .copied()
                .unwrap_or(0)
                .min(self.shape[axis] - 1);
            offset += index * stride;
            stride *= self.shape[axis];
        }
        (rows, cols, &self.values[offset..offset + rows * cols])
    }
}

fn flatten_json(value: &Value, shape: &[usize], depth: usize, out: &mut Vec<f64>) -> Result<()> {
    if depth == shape.len() {
        let sample = match value {
            Value::Number(number) => number
                .as_f64()
                .ok_or_else(|| anyhow!("data contains a non-finite number"))?,
            Value::Bool(flag) => f64::from(u8::from(*flag)),
            other => anyhow::bail!("data contains a non-numeric value: {other}"),
        };
        out.push(sample);
        return Ok(());
    }
    match value {
        Value::Array(items) if items.len() == shape[depth] => {
            for item in items {
                flatten_json(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        _ => anyhow::bail!("data is ragged at depth {depth}, expected shape {shape:?}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerData {
    Raster(Grid),
    Points(Vec<Vec<f64>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub data: LayerData,
    pub visible: bool,
    pub opacity: f64,
    pub colormap: Option<String>,
    pub blending: String,
    pub contrast_limits: Option<[f64; 2]>,
    pub gamma: f64,
    pub point_size: f64,
}

impl Layer {
    pub fn image(name: impl Into<String>, grid: Grid) -> Self {
        let limits = grid.value_range();
        Self {
            name: name.into(),
            kind: LayerKind::Image,
            data: LayerData::Raster(grid),
            visible: true,
            opacity: 1.0,
            colormap: Some("gray".to_owned()),
            blending: "translucent".to_owned(),
            contrast_limits: Some(limits),
            gamma: 1.0,
            point_size: 0.0,
        }
    }

    pub fn labels(name: impl Into<String>, grid: Grid) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Labels,
            data: LayerData::Raster(grid),
            visible: true,
            opacity: 0.7,
            colormap: None,
            blending: "translucent".to_owned(),
            contrast_limits: None,
            gamma: 1.0,
            point_size: 0.0,
        }
    }

    pub fn points(name: impl Into<String>, points: Vec<Vec<f64>>, size: f64) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Points,
            data: LayerData::Points(points),
            visible: true,
            opacity: 1.0,
            colormap: None,
            blending: "translucent".to_owned(),
            contrast_limits: None,
            gamma: 1.0,
            point_size: size,
        }
    }

    /// Extent of the layer along each of its axes.
    pub fn shape(&self) -> Vec<usize> {
        match &self.data {
            LayerData::Raster(grid) => grid.shape().to_vec(),
            LayerData::Points(points) => {
                let ndim = points.iter().map(Vec::len).max().unwrap_or(2);
                let mut extent = vec![1_usize; ndim];
                for point in points {
                    let offset = ndim - point.len();
                    for (index, coord) in point.iter().enumerate() {
                        let needed = (coord.max(0.0).floor() as usize).saturating_add(1);
                        extent[offset + index] = extent[offset + index].max(needed);
                    }
                }
                extent
            }
        }
    }

    pub fn describe(&self) -> Value {
        let mut info = json!({
            "name": self.name,
            "type": self.kind.type_name(),
            "visible": self.visible,
            "opacity": self.opacity,
            "blending": self.blending,
            "ndim": self.shape().len(),
        });
        match &self.data {
            LayerData::Raster(grid) => {
                info["shape"] = json!(grid.shape());
                info["dtype"] = json!(if grid.is_integral() { "int64" } else { "float64" });
            }
            LayerData::Points(points) => {
                info["n_points"] = json!(points.len());
                info["size"] = json!(self.point_size);
            }
        }
        if let Some(colormap) = &self.colormap {
            info["colormap"] = json!(colormap);
        }
        if let Some(limits) = self.contrast_limits {
            info["contrast_limits"] = json!(limits);
            info["gamma"] = json!(self.gamma);
        }
        info
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub center: Vec<f64>,
    pub zoom: f64,
    pub angles: [f64; 3],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            center: vec![0.0, 0.0],
            zoom: 1.0,
            angles: [0.0, 0.0, 90.0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewerModel {
    pub title: String,
    pub layers: Vec<Layer>,
    pub selected: Vec<String>,
    pub active: Option<String>,
    pub camera: Camera,
    pub ndisplay: usize,
    pub current_step: Vec<usize>,
    pub grid_enabled: bool,
    pub canvas_size: (u32, u32),
}

impl ViewerModel {
    pub fn new(title: impl Into<String>, canvas_size: (u32, u32)) -> Self {
        let mut model = Self {
            title: title.into(),
            layers: Vec::new(),
            selected: Vec::new(),
            active: None,
            camera: Camera::default(),
            ndisplay: 2,
            current_step: vec![0, 0],
            grid_enabled: false,
            canvas_size: (canvas_size.0.max(1), canvas_size.1.max(1)),
        };
        model.reset_view();
        model
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|layer| layer.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|layer| layer.name == name)
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|layer| layer.name.clone()).collect()
    }

    /// `base`, or `base [n]` for the first free `n`.
    pub fn unique_name(&self, base: &str) -> String {
        if self.layer(base).is_none() {
            return base.to_owned();
        }
        (1..)
            .map(|n| format!("{base} [{n}]"))
            .find(|candidate| self.layer(candidate).is_none())
            .unwrap_or_else(|| base.to_owned())
    }

    /// Adds the layer under a unique name, selects it and returns the name.
    pub fn add_layer(&mut self, mut layer: Layer) -> String {
        layer.name = self.unique_name(&layer.name);
        let name = layer.name.clone();
        self.layers.push(layer);
        self.selected = vec![name.clone()];
        self.active = Some(name.clone());
        let first = self.layers.len() == 1;
        self.sync_dims();
        if first {
            self.reset_view();
        }
        name
    }

    pub fn remove_layer(&mut self, name: &str) -> bool {
        let Some(index) = self.layer_index(name) else {
            return false;
        };
        self.layers.remove(index);
        self.selected.retain(|selected| selected != name);
        if self.active.as_deref() == Some(name) {
            self.active = self.layers.last().map(|layer| layer.name.clone());
        }
        self.sync_dims();
        true
    }

    pub fn rename_layer(&mut self, name: &str, new_name: &str) -> Option<String> {
        let index = self.layer_index(name)?;
        if name == new_name {
            return Some(name.to_owned());
        }
        let resolved = self.unique_name(new_name);
        self.layers[index].name = resolved.clone();
        for selected in &mut self.selected {
            if selected == name {
                *selected = resolved.clone();
            }
        }
        if self.active.as_deref() == Some(name) {
            self.active = Some(resolved.clone());
        }
        Some(resolved)
    }

    /// Moves the layer at `from` so that it ends up at `to` (clamped).
    pub fn move_layer(&mut self, from: usize, to: usize) -> usize {
        let layer = self.layers.remove(from);
        let target = to.min(self.layers.len());
        self.layers.insert(target, layer);
        target
    }

    pub fn select_only(&mut self, name: &str) {
        self.selected = vec![name.to_owned()];
        self.active = Some(name.to_owned());
    }

    pub fn ndim(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.shape().len())
            .max()
            .unwrap_or(2)
            .max(2)
    }

    /// Number of discrete positions along each world axis; layers align on
    /// their trailing axes.
    pub fn nsteps(&self) -> Vec<usize> {
        let nd = self.ndim();
        let mut steps = vec![1_usize; nd];
        for layer in &self.layers {
            let shape = layer.shape();
            let offset = nd - shape.len();
            for (index, len) in shape.iter().enumerate() {
                steps[offset + index] = steps[offset + index].max(*len);
            }
        }
        steps
    }

    pub fn set_current_step(&mut self, axis: usize, value: i64) -> Option<usize> {
        let steps = self.nsteps();
        let len = *steps.get(axis)?;
        let last = i64::try_from(len).unwrap_or(i64::MAX).saturating_sub(1).max(0);
        let clamped = value.clamp(0, last) as usize;
        self.sync_dims();
        self.current_step[axis] = clamped;
        Some(clamped)
    }

    pub fn sync_dims(&mut self) {
        let steps = self.nsteps();
        if self.current_step.len() != steps.len() {
            let mut aligned = vec![0_usize; steps.len()];
            let keep = self.current_step.len().min(steps.len());
            let src = self.current_step.len() - keep;
            let dst = steps.len() - keep;
            aligned[dst..].copy_from_slice(&self.current_step[src..]);
            self.current_step = aligned;
        }
        for (step, len) in self.current_step.iter_mut().zip(steps.iter()) {
            *step = (*step).min(len.saturating_sub(1));
        }
    }

    pub fn reset_view(&mut self) {
        let steps = self.nsteps();
        let nd = steps.len();
        let center = steps[nd - self.ndisplay.min(nd)..]
            .iter()
            .map(|len| *len as f64 / 2.0)
            .collect();
        self.camera = Camera {
            center,
            zoom: 1.0,
            angles: self.camera.angles,
        };
    }

    pub fn summary(&self) -> Value {
        json!({
            "title": self.title,
            "n_layers": self.layers.len(),
            "layer_names": self.layer_names(),
            "selected_layers": self.selected,
            "active_layer": self.active,
            "current_step": self.current_step,
            "nsteps": self.nsteps(),
            "ndisplay": self.ndisplay,
            "camera_center": self.camera.center,
            "camera_zoom": self.camera.zoom,
            "camera_angles": self.camera.angles,
            "grid_enabled": self.grid_enabled,
            "canvas_size": [self.canvas_size.0, self.canvas_size.1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Open,
    Destroyed,
}

/// Capability the tool surface needs from the controlled viewer. All methods
/// must only be called on the thread that owns the session.
pub trait Viewer: Send {
    fn model(&self) -> &ViewerModel;

    fn model_mut(&mut self) -> &mut ViewerModel;

    fn screenshot(&mut self, canvas_only: bool) -> RgbaImage {
        render(self.model(), canvas_only)
    }

    fn show(&mut self);

    /// Drains pending window events and reports whether the window survived.
    fn process_events(&mut self) -> WindowStatus;

    fn close(&mut self);

    /// Backend details reported by `session_information`.
    fn window_info(&self) -> Value {
        json!({})
    }
}

pub trait ViewerFactory: Send + Sync {
    fn create(&self, title: &str) -> Result<Box<dyn Viewer>>;
}

/// Shared close flag standing in for the native window; closing it from
/// anywhere is observed on the next event pass.
#[derive(Debug, Clone, Default)]
pub struct WindowHandle {
    closed: Arc<AtomicBool>,
}

impl WindowHandle {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct HeadlessViewer {
    model: ViewerModel,
    window: WindowHandle,
    shown: bool,
    event_passes: u64,
}

impl HeadlessViewer {
    pub fn new(title: &str, canvas_size: (u32, u32), window: WindowHandle) -> Self {
        Self {
            model: ViewerModel::new(title, canvas_size),
            window,
            shown: false,
            event_passes: 0,
        }
    }
}

impl Viewer for HeadlessViewer {
    fn model(&self) -> &ViewerModel {
        &self.model
    }

    fn model_mut(&mut self) -> &mut ViewerModel {
        &mut self.model
    }

    fn show(&mut self) {
        self.shown = true;
    }

    fn process_events(&mut self) -> WindowStatus {
        self.event_passes += 1;
        if self.window.is_closed() {
            WindowStatus::Destroyed
        } else {
            WindowStatus::Open
        }
    }

    fn close(&mut self) {
        self.shown = false;
        self.window.close();
    }

    fn window_info(&self) -> Value {
        json!({
            "backend": "headless",
            "shown": self.shown,
            "event_passes": self.event_passes,
        })
    }
}

pub struct HeadlessViewerFactory {
    canvas_size: (u32, u32),
    created: AtomicU64,
    windows: Mutex<Vec<WindowHandle>>,
}

impl HeadlessViewerFactory {
    pub fn new(canvas_size: (u32, u32)) -> Self {
        Self {
            canvas_size,
            created: AtomicU64::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Handle of the most recently created window.
    pub fn last_window(&self) -> Option<WindowHandle> {
        self.windows
            .lock()
            .ok()
            .and_then(|windows| windows.last().cloned())
    }
}

impl ViewerFactory for HeadlessViewerFactory {
    fn create(&self, title: &str) -> Result<Box<dyn Viewer>> {
        let window = WindowHandle::default();
        self.windows
            .lock()
            .map_err(|_| anyhow!("window registry lock poisoned"))?
            .push(window.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HeadlessViewer::new(title, self.canvas_size, window)))
    }
}

/// Rasterizes the visible layers at the current dims position. Without
/// `canvas_only` the canvas is framed by window chrome.
pub fn render(model: &ViewerModel, canvas_only: bool) -> RgbaImage {
    let (width, height) = model.canvas_size;
    let mut canvas = RgbaImage::from_pixel(width, height, BACKGROUND);
    let visible = model
        .layers
        .iter()
        .filter(|layer| layer.visible)
        .collect::<Vec<_>>();

    if model.grid_enabled && visible.len() > 1 {
        let columns = (visible.len() as f64).sqrt().ceil() as u32;
        let rows = (visible.len() as u32).div_ceil(columns);
        let tile_w = (width / columns).max(1);
        let tile_h = (height / rows).max(1);
        for (index, layer) in visible.iter().enumerate() {
            let index = index as u32;
            let viewport = Viewport {
                x: (index % columns) * tile_w,
                y: (index / columns) * tile_h,
                width: tile_w,
                height: tile_h,
            };
            draw_layer(model, layer, &mut canvas, viewport);
        }
    } else {
        let viewport = Viewport {
            x: 0,
            y: 0,
            width,
            height,
        };
        for layer in visible {
            draw_layer(model, layer, &mut canvas, viewport);
        }
    }

    if canvas_only {
        return canvas;
    }
    let mut framed = RgbaImage::from_pixel(
        width + 2 * FRAME_PX,
        height + TITLE_BAR_PX + 2 * FRAME_PX,
        CHROME,
    );
    for y in 0..TITLE_BAR_PX {
        for x in 0..framed.width() {
            framed.put_pixel(x, y, TITLE_BAR);
        }
    }
    image::imageops::replace(
        &mut framed,
        &canvas,
        i64::from(FRAME_PX),
        i64::from(TITLE_BAR_PX + FRAME_PX),
    );
    framed
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

struct Projection {
    scale: f64,
    center_y: f64,
    center_x: f64,
    half_w: f64,
    half_h: f64,
}

impl Projection {
    fn new(model: &ViewerModel, viewport: Viewport) -> Self {
        let steps = model.nsteps();
        let nd = steps.len();
        let rows = steps[nd - 2] as f64;
        let cols = steps[nd - 1] as f64;
        let fit = (f64::from(viewport.width) / cols).min(f64::from(viewport.height) / rows);
        let center = &model.camera.center;
        let (center_y, center_x) = match center.len() {
            0 | 1 => (rows / 2.0, cols / 2.0),
            len => (center[len - 2], center[len - 1]),
        };
        Self {
            scale: (fit * model.camera.zoom).max(1e-6),
            center_y,
            center_x,
            half_w: f64::from(viewport.width) / 2.0,
            half_h: f64::from(viewport.height) / 2.0,
        }
    }

    fn to_data(&self, px: u32, py: u32) -> (f64, f64) {
        (
            (f64::from(py) + 0.5 - self.half_h) / self.scale + self.center_y,
            (f64::from(px) + 0.5 - self.half_w) / self.scale + self.center_x,
        )
    }

    fn to_screen(&self, y: f64, x: f64) -> (f64, f64) {
        (
            (y - self.center_y) * self.scale + self.half_h,
            (x - self.center_x) * self.scale + self.half_w,
        )
    }
}

fn draw_layer(model: &ViewerModel, layer: &Layer, canvas: &mut RgbaImage, viewport: Viewport) {
    let projection = Projection::new(model, viewport);
    let nd = model.current_step.len();
    match &layer.data {
        LayerData::Raster(grid) => {
            let layer_nd = grid.ndim();
            let leading = if layer_nd > 2 && nd >= layer_nd {
                model.current_step[nd - layer_nd..nd - 2].to_vec()
            } else {
                Vec::new()
            };
            let (rows, cols, plane) = grid.plane(&leading);
            for py in 0..viewport.height {
                for px in 0..viewport.width {
                    let (y, x) = projection.to_data(px, py);
                    if y < 0.0 || x < 0.0 {
                        continue;
                    }
                    let (row, col) = (y as usize, x as usize);
                    if row >= rows || col >= cols {
                        continue;
                    }
                    let sample = plane[row * cols + col];
                    let Some(color) = layer_color(layer, sample) else {
                        continue;
                    };
                    blend(canvas, viewport.x + px, viewport.y + py, color, layer);
                }
            }
        }
        LayerData::Points(points) => {
            let radius = (layer.point_size * projection.scale / 2.0).max(1.0);
            for point in points {
                if point.len() < 2 {
                    continue;
                }
                let offset = nd.saturating_sub(point.len());
                let on_slice = point[..point.len() - 2]
                    .iter()
                    .enumerate()
                    .all(|(index, coord)| {
                        model.current_step.get(offset + index).copied()
                            == Some(coord.round().max(0.0) as usize)
                    });
                if !on_slice {
                    continue;
                }
                let (sy, sx) =
                    projection.to_screen(point[point.len() - 2] + 0.5, point[point.len() - 1] + 0.5);
                let y0 = (sy - radius).floor().max(0.0) as u32;
                let x0 = (sx - radius).floor().max(0.0) as u32;
                let y1 = ((sy + radius).ceil().max(0.0) as u32).min(viewport.height);
                let x1 = ((sx + radius).ceil().max(0.0) as u32).min(viewport.width);
                for py in y0..y1 {
                    for px in x0..x1 {
                        blend(canvas, viewport.x + px, viewport.y + py, [255, 255, 255], layer);
                    }
                }
            }
        }
    }
}

fn layer_color(layer: &Layer, sample: f64) -> Option<[u8; 3]> {
    match layer.kind {
        LayerKind::Labels => label_color(sample),
        _ => {
            let [lo, hi] = layer.contrast_limits.unwrap_or([0.0, 1.0]);
            let span = if hi > lo { hi - lo } else { 1.0 };
            let t = ((sample - lo) / span).clamp(0.0, 1.0).powf(layer.gamma.max(1e-3));
            Some(colormap_rgb(layer.colormap.as_deref().unwrap_or("gray"), t))
        }
    }
}

fn label_color(sample: f64) -> Option<[u8; 3]> {
    let id = sample.round() as i64;
    if id == 0 {
        return None;
    }
    let hash = (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Some([
        (hash >> 16) as u8 | 0x40,
        (hash >> 32) as u8 | 0x40,
        (hash >> 48) as u8 | 0x40,
    ])
}

fn colormap_stops(name: &str) -> &'static [[u8; 3]] {
    match name {
        "red" => &[[0, 0, 0], [255, 0, 0]],
        "green" => &[[0, 0, 0], [0, 255, 0]],
        "blue" => &[[0, 0, 0], [0, 0, 255]],
        "cyan" => &[[0, 0, 0], [0, 255, 255]],
        "magenta" => &[[0, 0, 0], [255, 0, 255]],
        "yellow" => &[[0, 0, 0], [255, 255, 0]],
        "viridis" => &[
            [68, 1, 84],
            [59, 82, 139],
            [33, 145, 140],
            [94, 201, 98],
            [253, 231, 37],
        ],
        "magma" => &[
            [0, 0, 4],
            [81, 18, 124],
            [183, 55, 121],
            [252, 137, 97],
            [252, 253, 191],
        ],
        _ => &[[0, 0, 0], [255, 255, 255]],
    }
}

pub fn normalize_colormap(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_ascii_lowercase();
    let lowered = if lowered == "grey" { "gray".to_owned() } else { lowered };
    COLORMAPS.iter().copied().find(|known| *known == lowered)
}

fn colormap_rgb(name: &str, t: f64) -> [u8; 3] {
    let stops = colormap_stops(name);
    let scaled = t * (stops.len() - 1) as f64;
    let index = (scaled.floor() as usize).min(stops.len() - 2);
    let frac = scaled - index as f64;
    let (a, b) = (stops[index], stops[index + 1]);
    let mut out = [0_u8; 3];
    for channel in 0..3 {
        let value = f64::from(a[channel]) + (f64::from(b[channel]) - f64::from(a[channel])) * frac;
        out[channel] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

fn blend(canvas: &mut RgbaImage, x: u32, y: u32, color: [u8; 3], layer: &Layer) {
    if x >= canvas.width() || y >= canvas.height() {
        return;
    }
    let alpha = layer.opacity.clamp(0.0, 1.0);
    let pixel = canvas.get_pixel_mut(x, y);
    for channel in 0..3 {
        let base = f64::from(pixel.0[channel]);
        let top = f64::from(color[channel]);
        let mixed = match layer.blending.as_str() {
            "additive" => base + top * alpha,
            "minimum" => base.min(top),
            "opaque" => top,
            _ => base * (1.0 - alpha) + top * alpha,
        };
        pixel.0[channel] = mixed.round().clamp(0.0, 255.0) as u8;
    }
}

/// Counts layers per type; used in session reports.
pub fn layer_type_counts(model: &ViewerModel) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for layer in &model.layers {
        *counts.entry(layer.kind.type_name()).or_insert(0) += 1;
    }
    counts
}
