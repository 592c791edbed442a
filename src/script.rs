use std::cell::RefCell;

use serde_json::{json, Value as JsonValue};
use starlark::any::ProvidesStaticType;
use starlark::environment::{FrozenModule, Globals, GlobalsBuilder, LibraryExtension, Module};
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::none::NoneType;
use starlark::values::structs::AllocStruct;
use starlark::values::tuple::UnpackTuple;
use starlark::values::{Heap, Value, ValueLike};
use tracing::{debug, warn};

use crate::session::ResourceHandle;
use crate::tools;

const SOURCE_NAME: &str = "<execute_code>";
pub const ENGINE_NAME: &str = "starlark";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub ok: bool,
    /// One-line summary of the failure, when there was one.
    pub error: Option<String>,
    pub result_repr: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutcome {
    pub fn status(&self) -> &'static str {
        if self.ok {
            "ok"
        } else {
            "error"
        }
    }
}

/// Per-call state reachable from builtins through `Evaluator::extra`.
#[derive(ProvidesStaticType)]
struct ScriptHost {
    viewer: Option<ResourceHandle>,
    stdout: RefCell<String>,
    stderr: RefCell<String>,
}

impl ScriptHost {
    fn new(viewer: Option<ResourceHandle>) -> Self {
        Self {
            viewer,
            stdout: RefCell::new(String::new()),
            stderr: RefCell::new(String::new()),
        }
    }
}

fn script_host<'a>(eval: &Evaluator<'_, 'a, '_>) -> anyhow::Result<&'a ScriptHost> {
    eval.extra
        .and_then(|extra| extra.downcast_ref::<ScriptHost>())
        .ok_or_else(|| anyhow::anyhow!("script host is not attached to this evaluation"))
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(|value| match value.unpack_str() {
            Some(text) => text.to_owned(),
            None => value.to_repr(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[starlark_module]
fn script_builtins(builder: &mut GlobalsBuilder) {
    /// Writes the arguments, space separated, to the captured stdout.
    fn print<'v>(
        #[starlark(args)] args: UnpackTuple<Value<'v>>,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<NoneType> {
        let host = script_host(eval)?;
        let mut stdout = host.stdout.borrow_mut();
        stdout.push_str(&join_args(&args.items));
        stdout.push('\n');
        Ok(NoneType)
    }

    /// Like `print`, but into the captured stderr.
    fn eprint<'v>(
        #[starlark(args)] args: UnpackTuple<Value<'v>>,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<NoneType> {
        let host = script_host(eval)?;
        let mut stderr = host.stderr.borrow_mut();
        stderr.push_str(&join_args(&args.items));
        stderr.push('\n');
        Ok(NoneType)
    }

    /// Runs a viewer tool against the live session and returns its JSON result.
    fn call_tool<'v>(
        name: &str,
        params: Option<Value<'v>>,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<String> {
        let host = script_host(eval)?;
        let handle = host
            .viewer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no viewer is attached to this session"))?;
        let params = match params {
            Some(value) if !value.is_none() => value
                .to_json_value()
                .map_err(|err| anyhow::anyhow!("params are not JSON-compatible: {err}"))?,
            _ => json!({}),
        };
        let result = handle
            .with(|viewer| tools::apply(viewer, name, &params))
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        let value = match result {
            Ok(value) => value,
            Err(err) => err.into_result(),
        };
        Ok(value.to_string())
    }
}

/// Embedded interpreter with a namespace that persists across calls.
///
/// Each call evaluates in a fresh module seeded with the bindings of the
/// previous call's frozen module. Carried values are readable but frozen:
/// `xs.append(1)` on a list from an earlier call fails, `list(xs)` gives a
/// mutable copy. Names starting with `_` do not carry over.
pub struct CodeExecutionEngine {
    globals: Globals,
    namespace: Option<FrozenModule>,
}

impl Default for CodeExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeExecutionEngine {
    pub fn new() -> Self {
        let globals = GlobalsBuilder::extended_by(&[
            LibraryExtension::StructType,
            LibraryExtension::Map,
            LibraryExtension::Filter,
            LibraryExtension::Json,
        ])
        .with(script_builtins)
        .build();
        Self {
            globals,
            namespace: None,
        }
    }

    pub fn execute(&mut self, source: &str, viewer: Option<&ResourceHandle>) -> ExecutionOutcome {
        let host = ScriptHost::new(viewer.cloned());
        let module = Module::new();
        if let Some(previous) = &self.namespace {
            carry_over(&module, previous);
        }
        seed_namespace(&module, viewer);

        let evaluated = match AstModule::parse(SOURCE_NAME, source.to_owned(), &Dialect::Extended) {
            Ok(ast) => {
                let mut eval = Evaluator::new(&module);
                eval.extra = Some(&host);
                match eval.eval_module(ast, &self.globals) {
                    Ok(value) if value.is_none() => Ok(None),
                    Ok(value) => Ok(Some(value.to_repr())),
                    Err(err) => Err(err.to_string()),
                }
            }
            Err(err) => Err(err.to_string()),
        };

        match module.freeze() {
            Ok(frozen) => self.namespace = Some(frozen),
            Err(err) => warn!("failed to persist script namespace: {err:?}"),
        }

        let stdout = host.stdout.into_inner();
        let mut stderr = host.stderr.into_inner();
        match evaluated {
            Ok(result_repr) => ExecutionOutcome {
                ok: true,
                error: None,
                result_repr,
                stdout,
                stderr,
            },
            Err(diagnostic) => {
                debug!("script execution failed: {diagnostic}");
                let error = Some(summarize_diagnostic(&diagnostic));
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&diagnostic);
                if !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                ExecutionOutcome {
                    ok: false,
                    error,
                    result_repr: None,
                    stdout,
                    stderr,
                }
            }
        }
    }
}

/// Rebinds the previous call's public names as public names of `module`, so
/// they survive any number of later calls.
fn carry_over(module: &Module, previous: &FrozenModule) {
    for name in previous.names() {
        let name = name.as_str();
        if name.starts_with('_') {
            continue;
        }
        if let Ok(value) = previous.get(name) {
            module.set(name, value.owned_value(module.frozen_heap()).to_value());
        }
    }
}

/// Picks the `error:` line of a Starlark diagnostic, falling back to its
/// first non-empty line.
fn summarize_diagnostic(diagnostic: &str) -> String {
    let mut lines = diagnostic.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.clone().next().unwrap_or("script failed");
    let line = lines
        .find(|line| line.starts_with("error:"))
        .map(|line| line.trim_start_matches("error:").trim())
        .unwrap_or(first);
    line.chars().take(200).collect()
}

/// `viewer` is rebound on every call; the utility bindings only when absent.
fn seed_namespace(module: &Module, viewer: Option<&ResourceHandle>) {
    let heap = module.heap();
    let snapshot = viewer
        .and_then(|handle| handle.with(|viewer| viewer.model().summary()).ok())
        .map(|summary| viewer_struct(heap, &summary))
        .unwrap_or_else(Value::new_none);
    module.set("viewer", snapshot);

    if module.get("ENGINE").is_none() {
        module.set("ENGINE", heap.alloc(ENGINE_NAME));
    }
    if module.get("TOOLS").is_none() {
        let names = tools::script_tool_names()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        module.set("TOOLS", heap.alloc(names));
    }
}

fn viewer_struct<'v>(heap: &'v Heap, summary: &JsonValue) -> Value<'v> {
    let fields = [
        "title",
        "layer_names",
        "selected_layers",
        "active_layer",
        "ndisplay",
        "nsteps",
        "current_step",
        "camera_zoom",
        "camera_center",
        "grid_enabled",
    ];
    heap.alloc(AllocStruct(
        fields
            .iter()
            .map(|field| (*field, json_to_value(heap, &summary[*field]))),
    ))
}

fn json_to_value<'v>(heap: &'v Heap, value: &JsonValue) -> Value<'v> {
    match value {
        JsonValue::Null => Value::new_none(),
        JsonValue::Bool(flag) => Value::new_bool(*flag),
        JsonValue::Number(number) => match number.as_i64().and_then(|n| i32::try_from(n).ok()) {
            Some(int) => heap.alloc(int),
            None => heap.alloc(number.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(text) => heap.alloc(text.as_str()),
        JsonValue::Array(items) => heap.alloc(
            items
                .iter()
                .map(|item| json_to_value(heap, item))
                .collect::<Vec<_>>(),
        ),
        JsonValue::Object(map) => heap.alloc(AllocStruct(
            map.iter()
                .map(|(key, item)| (key.as_str(), json_to_value(heap, item))),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::SessionContext;
    use crate::viewer::HeadlessViewerFactory;

    #[test]
    fn final_expression_becomes_result_repr() {
        let mut engine = CodeExecutionEngine::new();
        let outcome = engine.execute("1 + 2", None);
        assert!(outcome.ok);
        assert_eq!(outcome.result_repr.as_deref(), Some("3"));
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn namespace_persists_between_calls() {
        let mut engine = CodeExecutionEngine::new();
        let first = engine.execute("x = 5", None);
        assert!(first.ok);
        assert_eq!(first.result_repr, None);
        let second = engine.execute("x * 2", None);
        assert_eq!(second.result_repr.as_deref(), Some("10"));
        engine.execute("y = 1", None);
        let third = engine.execute("x + y", None);
        assert_eq!(third.result_repr.as_deref(), Some("6"));
    }

    #[test]
    fn carried_bindings_are_frozen_and_private_names_are_dropped() {
        let mut engine = CodeExecutionEngine::new();
        let first = engine.execute("xs = [1]\n_hidden = 3\nxs.append(2)\nlen(xs)", None);
        assert!(first.ok, "{}", first.stderr);
        assert_eq!(first.result_repr.as_deref(), Some("2"));

        let mutate = engine.execute("xs.append(3)", None);
        assert!(!mutate.ok);
        assert!(mutate.error.is_some());

        let copied = engine.execute("ys = list(xs)\nys.append(3)\nys", None);
        assert_eq!(copied.result_repr.as_deref(), Some("[1, 2, 3]"));

        let private = engine.execute("_hidden", None);
        assert!(!private.ok);
        assert!(private.stderr.contains("_hidden"));
    }

    #[test]
    fn none_results_are_omitted_and_prints_are_captured() {
        let mut engine = CodeExecutionEngine::new();
        let outcome = engine.execute("print('hello', 3)\neprint('careful')\nNone", None);
        assert!(outcome.ok);
        assert_eq!(outcome.result_repr, None);
        assert_eq!(outcome.stdout, "hello 3\n");
        assert_eq!(outcome.stderr, "careful\n");
    }

    #[test]
    fn failures_keep_partial_output_and_append_diagnostic() {
        let mut engine = CodeExecutionEngine::new();
        let outcome = engine.execute("print('before')\nfail('ValueError: x')", None);
        assert!(!outcome.ok);
        assert_eq!(outcome.status(), "error");
        assert_eq!(outcome.stdout, "before\n");
        assert!(outcome.stderr.contains("ValueError"));
        assert!(outcome.error.as_deref().is_some_and(|line| !line.is_empty()));
        assert_eq!(outcome.result_repr, None);
    }

    #[test]
    fn syntax_errors_are_recoverable() {
        let mut engine = CodeExecutionEngine::new();
        let broken = engine.execute("def (:", None);
        assert!(!broken.ok);
        assert!(!broken.stderr.is_empty());
        let after = engine.execute("40 + 2", None);
        assert_eq!(after.result_repr.as_deref(), Some("42"));
    }

    #[test]
    fn seeded_bindings_respect_user_rebinding() {
        let mut engine = CodeExecutionEngine::new();
        assert_eq!(
            engine.execute("ENGINE", None).result_repr.as_deref(),
            Some("\"starlark\"")
        );
        engine.execute("ENGINE = 'mine'", None);
        assert_eq!(
            engine.execute("ENGINE", None).result_repr.as_deref(),
            Some("\"mine\"")
        );
        assert_eq!(
            engine.execute("'add_points' in TOOLS", None).result_repr.as_deref(),
            Some("True")
        );
    }

    #[test]
    fn viewer_binding_tracks_the_live_session() {
        let session = SessionContext::new(Arc::new(HeadlessViewerFactory::new((8, 8))), "demo");
        let (handle, _) = session.ensure(None).expect("viewer");
        let mut engine = CodeExecutionEngine::new();

        let added = engine.execute(
            "r = call_tool('add_points', {'points': [[1, 1], [2, 3]], 'name': 'pts'})\n\
             json.decode(r)['n_points']",
            Some(&handle),
        );
        assert!(added.ok, "{}", added.stderr);
        assert_eq!(added.result_repr.as_deref(), Some("2"));

        let names = engine.execute("viewer.layer_names", Some(&handle));
        assert_eq!(names.result_repr.as_deref(), Some("[\"pts\"]"));
        assert_eq!(
            engine.execute("viewer.title", Some(&handle)).result_repr.as_deref(),
            Some("\"demo\"")
        );
    }

    #[test]
    fn call_tool_without_viewer_fails_cleanly() {
        let mut engine = CodeExecutionEngine::new();
        let outcome = engine.execute("call_tool('list_layers')", None);
        assert!(!outcome.ok);
        assert!(outcome.stderr.contains("no viewer"));
    }
}
