use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::capture::encode_png_base64;
use crate::types::{
    first_bool_arg, first_f64_arg, first_f64_list_arg, first_i64_arg, first_string_arg,
    required_string_arg, ToolError, ToolErrorCode, ToolOutcome, ToolRequest,
};
use crate::viewer::{normalize_colormap, Grid, Layer, LayerKind, Viewer, BLENDING_MODES, COLORMAPS};

/// Where a tool is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    /// Plain viewer operation, see [`apply`]; callable from scripts.
    Viewer,
    /// Needs dispatcher state (session lifecycle, engine, output store).
    Session,
}

#[derive(Debug, Clone, Copy)]
struct Param {
    name: &'static str,
    kind: &'static str,
    required: bool,
    description: &'static str,
}

const fn param(name: &'static str, kind: &'static str, description: &'static str) -> Param {
    Param {
        name,
        kind,
        required: false,
        description,
    }
}

const fn required(name: &'static str, kind: &'static str, description: &'static str) -> Param {
    Param {
        name,
        kind,
        required: true,
        description,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub scope: ToolScope,
    /// Forwarded to a remote bridge when one is reachable.
    pub proxied: bool,
    params: &'static [Param],
}

impl ToolSpec {
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in self.params {
            let mut schema = json!({ "description": param.description });
            match param.kind {
                "any" => {}
                "number_list" => {
                    schema["type"] = json!("array");
                    schema["items"] = json!({ "type": "number" });
                }
                "nested_array" => {
                    schema["type"] = json!("array");
                }
                kind => {
                    schema["type"] = json!(kind);
                }
            }
            properties.insert(param.name.to_owned(), schema);
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }
}

const LAYER_STYLE: &[Param] = &[
    param("name", "string", "Layer name; made unique if taken."),
    param("colormap", "string", "Colormap name, e.g. gray or viridis."),
    param("blending", "string", "translucent, additive, minimum or opaque."),
    param("contrast_limits", "number_list", "[min, max] display range."),
    param("gamma", "number", "Gamma correction, > 0."),
    param("opacity", "number", "Opacity in [0, 1]."),
];

pub const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "detect_viewers",
        description: "Report the local viewer and whether a remote viewer bridge is reachable.",
        scope: ToolScope::Session,
        proxied: false,
        params: &[],
    },
    ToolSpec {
        name: "init_viewer",
        description: "Attach to a remote viewer bridge if one answers, otherwise create or reuse the local viewer.",
        scope: ToolScope::Session,
        proxied: false,
        params: &[
            param("title", "string", "Window title."),
            param("width", "integer", "Canvas width in pixels."),
            param("height", "integer", "Canvas height in pixels."),
        ],
    },
    ToolSpec {
        name: "close_viewer",
        description: "Close the local viewer and stop its event pump.",
        scope: ToolScope::Session,
        proxied: false,
        params: &[],
    },
    ToolSpec {
        name: "session_information",
        description: "Describe the session: viewer state, layers, runtime and recent calls.",
        scope: ToolScope::Session,
        proxied: false,
        params: &[],
    },
    ToolSpec {
        name: "list_layers",
        description: "List layers with their properties.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[],
    },
    ToolSpec {
        name: "add_image",
        description: "Add an image layer from nested-list data or a PNG file path.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            param("data", "nested_array", "Image data as nested lists of numbers."),
            param("path", "string", "Path to an image file (used when data is absent)."),
            LAYER_STYLE[0],
            LAYER_STYLE[1],
            LAYER_STYLE[2],
            LAYER_STYLE[3],
            LAYER_STYLE[4],
            LAYER_STYLE[5],
        ],
    },
    ToolSpec {
        name: "add_labels",
        description: "Add an integer label layer from nested-list data or a PNG file path.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            param("data", "nested_array", "Label ids as nested lists of integers."),
            param("path", "string", "Path to a label image file."),
            LAYER_STYLE[0],
            LAYER_STYLE[5],
        ],
    },
    ToolSpec {
        name: "add_points",
        description: "Add a points layer.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            required("points", "nested_array", "List of coordinates, e.g. [[y, x], ...]."),
            LAYER_STYLE[0],
            param("size", "number", "Point size in data units."),
        ],
    },
    ToolSpec {
        name: "remove_layer",
        description: "Remove a layer by name.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[required("name", "string", "Layer name.")],
    },
    ToolSpec {
        name: "set_layer_properties",
        description: "Update visibility, opacity, colormap, blending, contrast, gamma or name of a layer.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            required("name", "string", "Layer name."),
            param("visible", "boolean", "Show or hide the layer."),
            LAYER_STYLE[5],
            LAYER_STYLE[1],
            LAYER_STYLE[2],
            LAYER_STYLE[3],
            LAYER_STYLE[4],
            param("new_name", "string", "Rename the layer."),
        ],
    },
    ToolSpec {
        name: "reorder_layer",
        description: "Move a layer; give exactly one of index, before or after.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            required("name", "string", "Layer to move."),
            param("index", "integer", "Target index."),
            param("before", "string", "Place before this layer."),
            param("after", "string", "Place after this layer."),
        ],
    },
    ToolSpec {
        name: "set_active_layer",
        description: "Select a layer and make it active.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[required("name", "string", "Layer name.")],
    },
    ToolSpec {
        name: "reset_view",
        description: "Reset camera center and zoom to fit the data.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[],
    },
    ToolSpec {
        name: "set_camera",
        description: "Set camera center, zoom and angles.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            param("center", "number_list", "Center in data coordinates."),
            param("zoom", "number", "Zoom factor, > 0."),
            param("angle", "number_list", "Angles in degrees; a single number sets the in-plane angle."),
        ],
    },
    ToolSpec {
        name: "set_ndisplay",
        description: "Switch between 2 and 3 displayed dimensions.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[required("ndisplay", "integer", "2 or 3.")],
    },
    ToolSpec {
        name: "set_dims_current_step",
        description: "Set the position along one dims axis (clamped to range).",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[
            required("dim", "integer", "Axis index; negative counts from the end."),
            required("value", "integer", "Position along the axis."),
        ],
    },
    ToolSpec {
        name: "set_grid",
        description: "Enable or disable grid mode.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[param("enabled", "boolean", "Defaults to true.")],
    },
    ToolSpec {
        name: "screenshot",
        description: "Render the viewer to a PNG image.",
        scope: ToolScope::Viewer,
        proxied: true,
        params: &[param("canvas_only", "boolean", "Exclude window chrome; defaults to true.")],
    },
    ToolSpec {
        name: "timelapse_screenshot",
        description: "Capture one PNG per position along a dims axis, downsampled to fit a size budget.",
        scope: ToolScope::Session,
        proxied: true,
        params: &[
            required("axis", "integer", "Dims axis to sweep."),
            param("slice_range", "string", "start:stop:step or a single index; defaults to ':'."),
            param("canvas_only", "boolean", "Exclude window chrome; defaults to true."),
            param("interpolate_to_fit", "boolean", "Downsample to fit the byte budget; defaults to false."),
            param("byte_budget", "integer", "Aggregate base64 size budget; giving one enables fitting."),
            param("restore_position", "boolean", "Return the axis to its original position afterwards."),
        ],
    },
    ToolSpec {
        name: "execute_code",
        description: "Run Starlark code with `viewer` and `call_tool` in scope; output is stored and truncated.",
        scope: ToolScope::Session,
        proxied: true,
        params: &[
            required("code", "string", "Starlark source; the last expression is returned."),
            param("line_limit", "integer", "Lines of output to return; -1 for all."),
        ],
    },
    ToolSpec {
        name: "read_output",
        description: "Read stored output of an earlier execution by id and line range.",
        scope: ToolScope::Session,
        proxied: false,
        params: &[
            required("output_id", "string", "Id returned by execute_code."),
            param("start", "integer", "First line (inclusive)."),
            param("end", "integer", "Last line (exclusive); -1 for the end."),
        ],
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

/// Maps alias tool names, and the parameter spellings they carry, onto
/// catalog tools.
pub fn normalize_request(request: ToolRequest) -> ToolRequest {
    let ToolRequest { name, mut params } = request;
    let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
    let name = match normalized.as_str() {
        "timelapse" => "timelapse_screenshot",
        "exec" | "run_code" => "execute_code",
        "session_info" => "session_information",
        "set_zoom" => "set_camera",
        "rename_layer" => {
            if let Some(map) = params.as_object_mut() {
                if !map.contains_key("name") {
                    if let Some(old_name) = map.remove("old_name") {
                        map.insert("name".to_owned(), old_name);
                    }
                }
            }
            "set_layer_properties"
        }
        other => other,
    }
    .to_owned();
    ToolRequest { name, params }
}

pub fn script_tool_names() -> Vec<&'static str> {
    CATALOG
        .iter()
        .filter(|spec| spec.scope == ToolScope::Viewer)
        .map(|spec| spec.name)
        .collect()
}

/// Runs one viewer-scoped tool. Must execute on the viewer's thread.
pub fn apply(viewer: &mut dyn Viewer, name: &str, params: &Value) -> ToolOutcome<Value> {
    match name {
        "list_layers" => Ok(list_layers(viewer)),
        "add_image" => add_raster(viewer, params, LayerKind::Image),
        "add_labels" => add_raster(viewer, params, LayerKind::Labels),
        "add_points" => add_points(viewer, params),
        "remove_layer" => remove_layer(viewer, params),
        "set_layer_properties" => set_layer_properties(viewer, params),
        "reorder_layer" => reorder_layer(viewer, params),
        "set_active_layer" => set_active_layer(viewer, params),
        "reset_view" => {
            viewer.model_mut().reset_view();
            Ok(camera_result(viewer))
        }
        "set_camera" => set_camera(viewer, params),
        "set_ndisplay" => set_ndisplay(viewer, params),
        "set_dims_current_step" => set_dims_current_step(viewer, params),
        "set_grid" => {
            let enabled = first_bool_arg(params, &["enabled"])?.unwrap_or(true);
            viewer.model_mut().grid_enabled = enabled;
            Ok(json!({ "status": "ok", "grid": enabled }))
        }
        "screenshot" => {
            let canvas_only = first_bool_arg(params, &["canvas_only"])?.unwrap_or(true);
            let image = viewer.screenshot(canvas_only);
            Ok(json!({
                "status": "ok",
                "mime_type": "image/png",
                "width": image.width(),
                "height": image.height(),
                "base64_data": encode_png_base64(&image)?,
            }))
        }
        other => Err(ToolError::new(
            ToolErrorCode::UnsupportedTool,
            format!("'{other}' is not a viewer operation"),
        )),
    }
}

fn list_layers(viewer: &dyn Viewer) -> Value {
    let layers = viewer
        .model()
        .layers
        .iter()
        .map(Layer::describe)
        .collect::<Vec<_>>();
    json!({ "status": "ok", "n_layers": layers.len(), "layers": layers })
}

fn load_grid(params: &Value) -> ToolOutcome<Grid> {
    if let Some(data) = params.get("data").filter(|value| !value.is_null()) {
        return Grid::from_json(data).map_err(|err| ToolError::invalid(format!("{err:#}")));
    }
    if let Some(path) = first_string_arg(params, &["path"]) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(ToolError::not_found("File", &path.display().to_string()));
        }
        return Grid::from_image_file(&path).map_err(|err| ToolError::invalid(format!("{err:#}")));
    }
    Err(ToolError::invalid("provide either `data` or `path`"))
}

fn add_raster(viewer: &mut dyn Viewer, params: &Value, kind: LayerKind) -> ToolOutcome<Value> {
    let grid = load_grid(params)?;
    let default_name = match kind {
        LayerKind::Labels => "labels",
        _ => "image",
    };
    let name = first_string_arg(params, &["name"]).unwrap_or_else(|| default_name.to_owned());
    let mut layer = match kind {
        LayerKind::Labels => {
            if !grid.is_integral() {
                return Err(ToolError::invalid("label data must contain integers"));
            }
            Layer::labels(name, grid)
        }
        _ => Layer::image(name, grid),
    };
    apply_style(&mut layer, params)?;
    let shape = layer.shape();
    let name = viewer.model_mut().add_layer(layer);
    Ok(json!({ "status": "ok", "name": name, "shape": shape }))
}

fn add_points(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let raw = params
        .get("points")
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::invalid("missing required parameter `points`"))?;
    let mut points = Vec::with_capacity(raw.len());
    for (index, entry) in raw.iter().enumerate() {
        let coords = entry
            .as_array()
            .and_then(|coords| coords.iter().map(Value::as_f64).collect::<Option<Vec<_>>>())
            .filter(|coords| coords.len() >= 2)
            .ok_or_else(|| {
                ToolError::invalid(format!("point {index} must be a list of at least 2 numbers"))
            })?;
        points.push(coords);
    }
    let n_points = points.len();
    let size = first_f64_arg(params, &["size"])?.unwrap_or(10.0);
    if size <= 0.0 {
        return Err(ToolError::invalid("size must be positive"));
    }
    let name = first_string_arg(params, &["name"]).unwrap_or_else(|| "points".to_owned());
    let mut layer = Layer::points(name, points, size);
    apply_style(&mut layer, params)?;
    let name = viewer.model_mut().add_layer(layer);
    Ok(json!({ "status": "ok", "name": name, "n_points": n_points }))
}

fn remove_layer(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let name = required_string_arg(params, &["name"], "name")?;
    if !viewer.model_mut().remove_layer(&name) {
        return Err(ToolError::not_found("Layer", &name));
    }
    Ok(json!({ "status": "removed", "name": name }))
}

fn apply_style(layer: &mut Layer, params: &Value) -> ToolOutcome<()> {
    if let Some(opacity) = first_f64_arg(params, &["opacity"])? {
        if !(0.0..=1.0).contains(&opacity) {
            return Err(ToolError::invalid("opacity must be within [0, 1]"));
        }
        layer.opacity = opacity;
    }
    if let Some(colormap) = first_string_arg(params, &["colormap"]) {
        if layer.kind != LayerKind::Image {
            return Err(ToolError::invalid(format!(
                "{} layers do not have a colormap",
                layer.kind.type_name()
            )));
        }
        let resolved = normalize_colormap(&colormap).ok_or_else(|| {
            ToolError::invalid(format!(
                "unknown colormap '{colormap}', expected one of {}",
                COLORMAPS.join(", ")
            ))
        })?;
        layer.colormap = Some(resolved.to_owned());
    }
    if let Some(blending) = first_string_arg(params, &["blending"]) {
        let blending = blending.to_ascii_lowercase();
        if !BLENDING_MODES.contains(&blending.as_str()) {
            return Err(ToolError::invalid(format!(
                "unknown blending '{blending}', expected one of {}",
                BLENDING_MODES.join(", ")
            )));
        }
        layer.blending = blending;
    }
    if let Some(limits) = first_f64_list_arg(params, &["contrast_limits"])? {
        if layer.kind != LayerKind::Image {
            return Err(ToolError::invalid("contrast limits apply to image layers only"));
        }
        match limits.as_slice() {
            [lo, hi] if lo < hi => layer.contrast_limits = Some([*lo, *hi]),
            _ => {
                return Err(ToolError::invalid(
                    "contrast_limits must be [min, max] with min < max",
                ))
            }
        }
    }
    if let Some(gamma) = first_f64_arg(params, &["gamma"])? {
        if gamma <= 0.0 {
            return Err(ToolError::invalid("gamma must be positive"));
        }
        layer.gamma = gamma;
    }
    Ok(())
}

fn set_layer_properties(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let name = required_string_arg(params, &["name"], "name")?;
    let visible = first_bool_arg(params, &["visible"])?;
    let model = viewer.model_mut();
    let layer = model
        .layer_mut(&name)
        .ok_or_else(|| ToolError::not_found("Layer", &name))?;

    // validate everything on a copy so a bad value leaves the layer untouched
    let mut updated = layer.clone();
    apply_style(&mut updated, params)?;
    if let Some(visible) = visible {
        updated.visible = visible;
    }
    *layer = updated;

    let final_name = match first_string_arg(params, &["new_name"]) {
        Some(new_name) => model
            .rename_layer(&name, &new_name)
            .unwrap_or_else(|| name.clone()),
        None => name,
    };
    let description = model
        .layer(&final_name)
        .map(Layer::describe)
        .unwrap_or(Value::Null);
    Ok(json!({ "status": "ok", "name": final_name, "layer": description }))
}

fn reorder_layer(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let name = required_string_arg(params, &["name"], "name")?;
    let index = first_i64_arg(params, &["index"])?;
    let before = first_string_arg(params, &["before"]);
    let after = first_string_arg(params, &["after"]);
    let hints = usize::from(index.is_some()) + usize::from(before.is_some()) + usize::from(after.is_some());
    if hints != 1 {
        return Err(ToolError::invalid("Provide exactly one of index, before, or after"));
    }

    let model = viewer.model_mut();
    let from = model
        .layer_index(&name)
        .ok_or_else(|| ToolError::not_found("Layer", &name))?;
    let last = model.layers.len() as i64 - 1;
    let target = if let Some(index) = index {
        let resolved = if index < 0 { index + last + 1 } else { index };
        resolved.clamp(0, last) as usize
    } else {
        let (anchor, offset) = match before {
            Some(anchor) => (anchor, 0),
            None => (after.unwrap_or_default(), 1),
        };
        let anchor_index = model
            .layer_index(&anchor)
            .ok_or_else(|| ToolError::not_found("Layer", &anchor))?;
        if anchor == name {
            from
        } else {
            let anchor_after_removal = if anchor_index > from { anchor_index - 1 } else { anchor_index };
            anchor_after_removal + offset
        }
    };
    let index = model.move_layer(from, target);
    Ok(json!({ "status": "ok", "name": name, "index": index }))
}

fn set_active_layer(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let name = required_string_arg(params, &["name"], "name")?;
    let model = viewer.model_mut();
    if model.layer(&name).is_none() {
        return Err(ToolError::not_found("Layer", &name));
    }
    model.select_only(&name);
    Ok(json!({ "status": "ok", "active": name }))
}

fn camera_result(viewer: &dyn Viewer) -> Value {
    let camera = &viewer.model().camera;
    json!({
        "status": "ok",
        "center": camera.center,
        "zoom": camera.zoom,
        "angles": camera.angles,
    })
}

fn set_camera(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let center = first_f64_list_arg(params, &["center"])?;
    let zoom = first_f64_arg(params, &["zoom"])?;
    let angle = first_f64_list_arg(params, &["angle", "angles"])?;
    if let Some(zoom) = zoom {
        if zoom <= 0.0 {
            return Err(ToolError::invalid("zoom must be positive"));
        }
    }
    if let Some(center) = &center {
        if !(2..=3).contains(&center.len()) {
            return Err(ToolError::invalid("center needs 2 or 3 coordinates"));
        }
    }
    let camera = &mut viewer.model_mut().camera;
    if let Some(center) = center {
        camera.center = center;
    }
    if let Some(zoom) = zoom {
        camera.zoom = zoom;
    }
    match angle.as_deref() {
        None => {}
        Some([single]) => camera.angles[2] = *single,
        Some([a, b, c]) => camera.angles = [*a, *b, *c],
        Some(_) => return Err(ToolError::invalid("angle needs 1 or 3 values")),
    }
    Ok(camera_result(viewer))
}

fn set_ndisplay(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let ndisplay = first_i64_arg(params, &["ndisplay"])?
        .ok_or_else(|| ToolError::invalid("missing required parameter `ndisplay`"))?;
    if ndisplay != 2 && ndisplay != 3 {
        return Err(ToolError::invalid("ndisplay must be 2 or 3"));
    }
    viewer.model_mut().ndisplay = ndisplay as usize;
    Ok(json!({ "status": "ok", "ndisplay": ndisplay }))
}

fn set_dims_current_step(viewer: &mut dyn Viewer, params: &Value) -> ToolOutcome<Value> {
    let dim = first_i64_arg(params, &["dim", "axis"])?
        .ok_or_else(|| ToolError::invalid("missing required parameter `dim`"))?;
    let value = first_i64_arg(params, &["value"])?
        .ok_or_else(|| ToolError::invalid("missing required parameter `value`"))?;
    let model = viewer.model_mut();
    let ndim = model.ndim() as i64;
    let axis = if dim < 0 { dim + ndim } else { dim };
    if axis < 0 || axis >= ndim {
        return Err(ToolError::invalid(format!(
            "dim {dim} is out of range for {ndim} dims"
        )));
    }
    let clamped = model
        .set_current_step(axis as usize, value)
        .ok_or_else(|| ToolError::invalid(format!("dim {dim} is out of range")))?;
    Ok(json!({
        "status": "ok",
        "dim": axis,
        "value": clamped,
        "current_step": model.current_step,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::{HeadlessViewer, WindowHandle};

    fn viewer() -> HeadlessViewer {
        HeadlessViewer::new("tools", (16, 16), WindowHandle::default())
    }

    fn call(viewer: &mut HeadlessViewer, name: &str, params: Value) -> ToolOutcome<Value> {
        apply(viewer, name, &params)
    }

    fn layer_order(viewer: &HeadlessViewer) -> Vec<String> {
        viewer.model().layer_names()
    }

    #[test]
    fn catalog_names_are_unique_and_schemas_are_objects() {
        let mut names = CATALOG.iter().map(|spec| spec.name).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
        let reorder = find("reorder_layer").expect("reorder");
        let schema = reorder.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["name"]));
        assert!(!find("read_output").expect("read_output").proxied);
        let timelapse = normalize_request(ToolRequest::new(" Timelapse ", json!({})));
        assert_eq!(timelapse.name, "timelapse_screenshot");
    }

    #[test]
    fn rename_and_zoom_aliases_map_onto_catalog_tools() {
        let rename = normalize_request(ToolRequest::new(
            "rename_layer",
            json!({ "old_name": "img", "new_name": "renamed" }),
        ));
        assert_eq!(rename.name, "set_layer_properties");
        assert_eq!(rename.params, json!({ "name": "img", "new_name": "renamed" }));

        let zoom = normalize_request(ToolRequest::new("set-zoom", json!({ "zoom": 2.5 })));
        assert_eq!(zoom.name, "set_camera");

        let mut viewer = viewer();
        call(&mut viewer, "add_image", json!({ "data": [[0, 1]], "name": "img" })).expect("add");
        let renamed = call(&mut viewer, &rename.name, rename.params.clone()).expect("rename");
        assert_eq!(renamed["name"], "renamed");
        let camera = call(&mut viewer, &zoom.name, zoom.params.clone()).expect("zoom");
        assert_eq!(camera["zoom"], 2.5);
    }

    #[test]
    fn add_and_list_layers() {
        let mut viewer = viewer();
        let added = call(
            &mut viewer,
            "add_image",
            json!({ "data": [[0, 1], [2, 3]], "name": "img", "colormap": "viridis" }),
        )
        .expect("add");
        assert_eq!(added["name"], "img");
        assert_eq!(added["shape"], json!([2, 2]));

        let points = call(&mut viewer, "add_points", json!({ "points": [[0, 0], [1, 1], [1, 0]] }))
            .expect("points");
        assert_eq!(points["n_points"], 3);

        let listed = call(&mut viewer, "list_layers", json!({})).expect("list");
        assert_eq!(listed["n_layers"], 2);
        assert_eq!(listed["layers"][0]["colormap"], "viridis");
        assert_eq!(listed["layers"][1]["type"], "Points");
    }

    #[test]
    fn invalid_layer_inputs_are_rejected() {
        let mut viewer = viewer();
        let missing = call(&mut viewer, "add_image", json!({})).expect_err("no data");
        assert_eq!(missing.code, ToolErrorCode::InvalidArgument);
        let labels = call(&mut viewer, "add_labels", json!({ "data": [[0.5]] })).expect_err("float labels");
        assert_eq!(labels.code, ToolErrorCode::InvalidArgument);
        let file = call(&mut viewer, "add_image", json!({ "path": "/definitely/missing.png" }))
            .expect_err("missing file");
        assert_eq!(file.code, ToolErrorCode::NotFound);
        let bad_point = call(&mut viewer, "add_points", json!({ "points": [[1, "x"]] }))
            .expect_err("bad point");
        assert_eq!(bad_point.code, ToolErrorCode::InvalidArgument);
    }

    #[test]
    fn far_away_points_do_not_overflow_extents() {
        let mut viewer = viewer();
        let added = call(&mut viewer, "add_points", json!({ "points": [[1e30, 1e30]] })).expect("add");
        assert_eq!(added["n_points"], 1);
        let step = call(&mut viewer, "set_dims_current_step", json!({ "dim": 0, "value": 7 }))
            .expect("step");
        assert_eq!(step["value"], 7);
        let shot = call(&mut viewer, "screenshot", json!({})).expect("screenshot");
        assert_eq!(shot["mime_type"], "image/png");
    }

    #[test]
    fn remove_reports_removed_or_not_found() {
        let mut viewer = viewer();
        call(&mut viewer, "add_points", json!({ "points": [[0, 0]], "name": "p" })).expect("add");
        let removed = call(&mut viewer, "remove_layer", json!({ "name": "p" })).expect("remove");
        assert_eq!(removed, json!({ "status": "removed", "name": "p" }));
        let missing = call(&mut viewer, "remove_layer", json!({ "name": "p" })).expect_err("gone");
        assert_eq!(missing.into_result()["status"], "not_found");
    }

    #[test]
    fn reorder_requires_exactly_one_hint() {
        let mut viewer = viewer();
        for name in ["a", "b", "c"] {
            call(&mut viewer, "add_points", json!({ "points": [[0, 0]], "name": name })).expect("add");
        }
        let err = call(&mut viewer, "reorder_layer", json!({ "name": "a", "index": 1, "before": "c" }))
            .expect_err("two hints");
        assert_eq!(err.code, ToolErrorCode::InvalidArgument);
        assert_eq!(err.message, "Provide exactly one of index, before, or after");
        let none = call(&mut viewer, "reorder_layer", json!({ "name": "a" })).expect_err("no hint");
        assert_eq!(none.code, ToolErrorCode::InvalidArgument);

        let moved = call(&mut viewer, "reorder_layer", json!({ "name": "a", "after": "c" })).expect("after");
        assert_eq!(moved["index"], 2);
        assert_eq!(layer_order(&viewer), vec!["b", "c", "a"]);

        let moved = call(&mut viewer, "reorder_layer", json!({ "name": "a", "before": "b" })).expect("before");
        assert_eq!(moved["index"], 0);
        assert_eq!(layer_order(&viewer), vec!["a", "b", "c"]);

        let moved = call(&mut viewer, "reorder_layer", json!({ "name": "b", "index": -1 })).expect("index");
        assert_eq!(moved["index"], 2);
        assert_eq!(layer_order(&viewer), vec!["a", "c", "b"]);

        let missing = call(&mut viewer, "reorder_layer", json!({ "name": "a", "before": "zzz" }))
            .expect_err("anchor");
        assert_eq!(missing.code, ToolErrorCode::NotFound);
    }

    #[test]
    fn layer_properties_validate_before_mutating() {
        let mut viewer = viewer();
        call(&mut viewer, "add_image", json!({ "data": [[0, 1]], "name": "img" })).expect("add");
        let err = call(
            &mut viewer,
            "set_layer_properties",
            json!({ "name": "img", "opacity": 0.3, "gamma": -1 }),
        )
        .expect_err("bad gamma");
        assert_eq!(err.code, ToolErrorCode::InvalidArgument);
        assert_eq!(viewer.model().layer("img").map(|l| l.opacity), Some(1.0));

        let updated = call(
            &mut viewer,
            "set_layer_properties",
            json!({ "name": "img", "opacity": 0.3, "visible": "false", "new_name": "renamed" }),
        )
        .expect("update");
        assert_eq!(updated["name"], "renamed");
        assert_eq!(updated["layer"]["visible"], false);
        assert_eq!(updated["layer"]["opacity"], 0.3);
    }

    #[test]
    fn dims_camera_and_screenshot() {
        let mut viewer = viewer();
        call(&mut viewer, "add_image", json!({ "data": [[[0, 1]], [[2, 3]], [[4, 5]]] })).expect("add");
        let step = call(&mut viewer, "set_dims_current_step", json!({ "dim": 0, "value": 10 })).expect("step");
        assert_eq!(step["value"], 2);
        let bad = call(&mut viewer, "set_dims_current_step", json!({ "dim": 5, "value": 0 })).expect_err("dim");
        assert_eq!(bad.code, ToolErrorCode::InvalidArgument);

        let camera = call(&mut viewer, "set_camera", json!({ "zoom": 2.0, "angle": 45 })).expect("camera");
        assert_eq!(camera["zoom"], 2.0);
        assert_eq!(camera["angles"][2], 45.0);
        assert!(call(&mut viewer, "set_camera", json!({ "zoom": 0 })).is_err());
        assert!(call(&mut viewer, "set_ndisplay", json!({ "ndisplay": 4 })).is_err());

        let shot = call(&mut viewer, "screenshot", json!({})).expect("screenshot");
        assert_eq!(shot["mime_type"], "image/png");
        assert_eq!(shot["width"], 16);
        assert!(shot["base64_data"].as_str().is_some_and(|data| data.starts_with("iVBOR")));
    }
}
