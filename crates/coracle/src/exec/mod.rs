//! Isolated guest execution.
//!
//! Runs a bundled CommonJS blob inside a fresh QuickJS context that holds
//! no host capability beyond an explicit workspace object. The context gets
//! a console that captures into bounded buffers, a frozen `process` facade,
//! `Buffer`/`TextEncoder`/`TextDecoder` and a virtual timer queue from the
//! embedded prelude, and nothing else. Guest-visible `eval` and the
//! function constructors are replaced with throwing stubs, and a `require`
//! shim always fails, so the bundle is the only code that ever runs.
//!
//! The timeout is enforced through the engine interrupt handler; a script
//! that spins past its deadline is aborted mid-flight.

mod limits;

pub use limits::{LimitedBuffer, ResourceLimits};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rquickjs::context::intrinsic;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Runtime};
use thiserror::Error;
use tracing::warn;

use crate::vpath;
use crate::workspace::Workspace;

const PRELUDE: &str = include_str!("prelude.js");

/// Errors from guest execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The script exceeded its wall-clock budget.
    #[error("script timed out")]
    Timeout,
    /// The guest threw an uncaught exception.
    #[error("guest error: {message}")]
    Guest {
        message: String,
        stack: Option<String>,
    },
    /// The engine itself failed.
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<rquickjs::Error> for ExecError {
    fn from(err: rquickjs::Error) -> Self {
        ExecError::Engine(err.to_string())
    }
}

/// Captured result of one execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Whether either stream hit the output cap.
    pub truncated: bool,
    /// Zero unless the guest called `process.exit`.
    pub exit_code: i32,
    /// JSON rendering of the entry's `module.exports`, when serializable.
    pub exports_json: Option<String>,
}

/// Guest executor bound to a set of resource limits.
#[derive(Debug, Default)]
pub struct Executor {
    limits: ResourceLimits,
}

impl Executor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits }
    }

    /// Execute a bundled blob against the given workspace.
    ///
    /// `filename` is the guest-visible entry path (`process.argv[1]`).
    /// Mutations performed through the capability object land directly in
    /// `ws`.
    pub fn run(
        &self,
        ws: Rc<RefCell<Workspace>>,
        code: &str,
        filename: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutcome, ExecError> {
        let runtime = Runtime::new()?;
        runtime.set_memory_limit(self.limits.max_memory_bytes);
        let deadline = Instant::now() + self.limits.timeout();
        runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

        let context = Context::custom::<(
            intrinsic::Date,
            intrinsic::Eval,
            intrinsic::RegExpCompiler,
            intrinsic::RegExp,
            intrinsic::Json,
            intrinsic::Proxy,
            intrinsic::MapSet,
            intrinsic::TypedArrays,
            intrinsic::Promise,
            intrinsic::BigInt,
        )>(&runtime)?;

        let stdout = Rc::new(RefCell::new(LimitedBuffer::new(self.limits.max_output_bytes)));
        let stderr = Rc::new(RefCell::new(LimitedBuffer::new(self.limits.max_output_bytes)));

        let process_init = serde_json::json!({
            "argv": std::iter::once("coracle")
                .chain(std::iter::once(filename))
                .map(str::to_string)
                .chain(argv.iter().cloned())
                .collect::<Vec<String>>(),
            "env": env,
        })
        .to_string();

        context.with(|ctx| -> Result<(), ExecError> {
            install_host_hooks(&ctx, &ws, &stdout, &stderr, &process_init)?;
            ctx.eval::<(), _>(PRELUDE)
                .catch(&ctx)
                .map_err(|e| caught_to_error(e, deadline))?;
            Ok(())
        })?;

        let wrapper = wrap_bundle(code);
        let main_result = context.with(|ctx| {
            ctx.eval::<(), _>(wrapper.as_bytes())
                .catch(&ctx)
                .map_err(|e| caught_to_error(e, deadline))
        });
        main_result?;

        drain_jobs(&runtime);

        context.with(|ctx| {
            ctx.eval::<(), _>(RUN_TIMERS)
                .catch(&ctx)
                .map_err(|e| caught_to_error(e, deadline))
        })?;

        drain_jobs(&runtime);

        let (exit_code, exports_json) = context.with(|ctx| -> Result<(i32, Option<String>), ExecError> {
            let exit_code: i32 = ctx.globals().get("__exit_code")?;
            let exports_json: Option<String> = ctx.eval(EXPORTS_JSON)?;
            Ok((exit_code, exports_json))
        })?;

        let out = stdout.borrow().clone();
        let err = stderr.borrow().clone();
        let truncated = out.was_truncated() || err.was_truncated();
        Ok(ExecOutcome {
            stdout: out.into_string(),
            stderr: err.into_string(),
            truncated,
            exit_code,
            exports_json,
        })
    }
}

const RUN_TIMERS: &str = "try { __run_timers(); } catch (err) { \
     if (err && err.__coracle_exit === true) { globalThis.__exit_code = err.code; } \
     else { throw err; } }";

const EXPORTS_JSON: &str = "(function () { \
     try { var j = JSON.stringify(globalThis.__module.exports); \
     return j === undefined ? null : j; } catch (e) { return null; } })()";

fn wrap_bundle(code: &str) -> String {
    format!(
        "globalThis.__exit_code = 0;\n\
         globalThis.__module = {{ exports: {{}} }};\n\
         (function () {{\n\
         var module = globalThis.__module;\n\
         var exports = module.exports;\n\
         function require(name) {{ throw new Error(\"module is blocked: \" + name); }}\n\
         try {{\n\
         (function (require, module, exports) {{\n{code}\n}}).call(exports, require, module, exports);\n\
         }} catch (err) {{\n\
         if (err && err.__coracle_exit === true) {{ globalThis.__exit_code = err.code; }}\n\
         else {{ throw err; }}\n\
         }}\n\
         }})();"
    )
}

fn caught_to_error(err: CaughtError<'_>, deadline: Instant) -> ExecError {
    if Instant::now() >= deadline {
        return ExecError::Timeout;
    }
    match err {
        CaughtError::Exception(exception) => ExecError::Guest {
            message: exception
                .message()
                .unwrap_or_else(|| "uncaught exception".to_string()),
            stack: exception.stack(),
        },
        other => ExecError::Guest {
            message: other.to_string(),
            stack: None,
        },
    }
}

fn drain_jobs(runtime: &Runtime) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => {
                warn!("pending job raised; continuing");
            }
        }
    }
}

fn install_host_hooks(
    ctx: &Ctx<'_>,
    ws: &Rc<RefCell<Workspace>>,
    stdout: &Rc<RefCell<LimitedBuffer>>,
    stderr: &Rc<RefCell<LimitedBuffer>>,
    process_init: &str,
) -> Result<(), ExecError> {
    let globals = ctx.globals();

    let out = stdout.clone();
    globals.set(
        "__host_stdout",
        Function::new(ctx.clone(), move |text: String| {
            out.borrow_mut().write(&text);
        })?,
    )?;

    let err = stderr.clone();
    globals.set(
        "__host_stderr",
        Function::new(ctx.clone(), move |text: String| {
            err.borrow_mut().write(&text);
        })?,
    )?;

    globals.set("__process_init_json", process_init)?;

    let raw = Object::new(ctx.clone())?;

    let cap = ws.clone();
    raw.set(
        "readFile",
        Function::new(
            ctx.clone(),
            move |cx: Ctx<'_>, path: String, enc: String| -> rquickjs::Result<String> {
                let path = vpath::normalize(&path);
                if vpath::is_reserved(&path) {
                    return Err(Exception::throw_message(
                        &cx,
                        &format!("not found: {path}"),
                    ));
                }
                let ws = cap.borrow();
                match ws.read_file(&path) {
                    Ok(bytes) => Ok(if enc == "base64" {
                        BASE64.encode(bytes)
                    } else {
                        String::from_utf8_lossy(bytes).into_owned()
                    }),
                    Err(e) => Err(Exception::throw_message(&cx, &e.to_string())),
                }
            },
        )?,
    )?;

    let cap = ws.clone();
    raw.set(
        "writeFile",
        Function::new(
            ctx.clone(),
            move |cx: Ctx<'_>, path: String, data: String, enc: String| -> rquickjs::Result<()> {
                let path = vpath::normalize(&path);
                if vpath::is_reserved(&path) {
                    return Err(Exception::throw_message(
                        &cx,
                        &format!("access denied: {path}"),
                    ));
                }
                let bytes = if enc == "base64" {
                    BASE64
                        .decode(&data)
                        .map_err(|e| Exception::throw_message(&cx, &e.to_string()))?
                } else {
                    data.into_bytes()
                };
                cap.borrow_mut()
                    .write_file(&path, bytes, true)
                    .map_err(|e| Exception::throw_message(&cx, &e.to_string()))
            },
        )?,
    )?;

    let cap = ws.clone();
    raw.set(
        "readdir",
        Function::new(
            ctx.clone(),
            move |cx: Ctx<'_>, path: String| -> rquickjs::Result<String> {
                let path = vpath::normalize(&path);
                if vpath::is_reserved(&path) {
                    return Err(Exception::throw_message(
                        &cx,
                        &format!("not found: {path}"),
                    ));
                }
                let ws = cap.borrow();
                match ws.list(&path) {
                    Ok(mut names) => {
                        if path == "/" {
                            names.retain(|name| name != ".time");
                        }
                        Ok(serde_json::to_string(&names).expect("names serialize"))
                    }
                    Err(e) => Err(Exception::throw_message(&cx, &e.to_string())),
                }
            },
        )?,
    )?;

    let cap = ws.clone();
    raw.set(
        "stat",
        Function::new(ctx.clone(), move |path: String| -> String {
            let path = vpath::normalize(&path);
            if vpath::is_reserved(&path) {
                return "null".to_string();
            }
            match cap.borrow().stat(&path) {
                Some(info) => serde_json::to_string(&info).expect("stat serializes"),
                None => "null".to_string(),
            }
        })?,
    )?;

    let cap = ws.clone();
    raw.set(
        "mkdir",
        Function::new(
            ctx.clone(),
            move |cx: Ctx<'_>, path: String, recursive: bool| -> rquickjs::Result<()> {
                let path = vpath::normalize(&path);
                if vpath::is_reserved(&path) {
                    return Err(Exception::throw_message(
                        &cx,
                        &format!("access denied: {path}"),
                    ));
                }
                cap.borrow_mut()
                    .mkdir(&path, recursive)
                    .map_err(|e| Exception::throw_message(&cx, &e.to_string()))
            },
        )?,
    )?;

    let cap = ws.clone();
    raw.set(
        "deletePath",
        Function::new(
            ctx.clone(),
            move |cx: Ctx<'_>, path: String| -> rquickjs::Result<()> {
                let path = vpath::normalize(&path);
                if vpath::is_reserved(&path) {
                    return Err(Exception::throw_message(
                        &cx,
                        &format!("access denied: {path}"),
                    ));
                }
                cap.borrow_mut()
                    .delete(&path)
                    .map_err(|e| Exception::throw_message(&cx, &e.to_string()))
            },
        )?,
    )?;

    globals.set("__workspace_raw", raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_code(ws: Rc<RefCell<Workspace>>, code: &str) -> Result<ExecOutcome, ExecError> {
        Executor::default().run(ws, code, "/main.js", &[], &BTreeMap::new())
    }

    fn fresh() -> Rc<RefCell<Workspace>> {
        Rc::new(RefCell::new(Workspace::new()))
    }

    #[test]
    fn test_console_capture() {
        let outcome = run_code(
            fresh(),
            "console.log(\"hello\", 42); console.error(\"bad\");",
        )
        .unwrap();
        assert_eq!(outcome.stdout, "hello 42\n");
        assert_eq!(outcome.stderr, "bad\n");
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_module_exports_returned() {
        let outcome = run_code(fresh(), "module.exports = { a: 1 };").unwrap();
        assert_eq!(outcome.exports_json.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_capability_write_lands_in_workspace() {
        let ws = fresh();
        run_code(
            ws.clone(),
            "globalThis.__workspace.writeFile(\"/out/hello.txt\", \"hi there\", \"utf8\");",
        )
        .unwrap();
        assert_eq!(ws.borrow().read_file("/out/hello.txt").unwrap(), b"hi there");
    }

    #[test]
    fn test_capability_read_and_stat() {
        let ws = fresh();
        ws.borrow_mut()
            .write_file("/data.txt", b"payload".to_vec(), true)
            .unwrap();
        let outcome = run_code(
            ws,
            "var s = globalThis.__workspace.stat(\"/data.txt\");\n\
             console.log(s.type, s.size);\n\
             console.log(globalThis.__workspace.readFile(\"/data.txt\", \"utf8\"));",
        )
        .unwrap();
        assert_eq!(outcome.stdout, "file 7\npayload\n");
    }

    #[test]
    fn test_reserved_namespace_hidden_from_guest() {
        let ws = fresh();
        ws.borrow_mut()
            .write_file("/.time/state.json", b"{}".to_vec(), true)
            .unwrap();
        ws.borrow_mut()
            .write_file("/visible.txt", b"x".to_vec(), true)
            .unwrap();
        let outcome = run_code(
            ws.clone(),
            "console.log(JSON.stringify(globalThis.__workspace.readdir(\"/\")));\n\
             console.log(JSON.stringify(globalThis.__workspace.stat(\"/.time\")));",
        )
        .unwrap();
        assert_eq!(outcome.stdout, "[\"visible.txt\"]\nnull\n");

        let err = run_code(
            ws,
            "globalThis.__workspace.writeFile(\"/.time/x\", \"y\", \"utf8\");",
        )
        .unwrap_err();
        let ExecError::Guest { message, .. } = err else {
            panic!("expected guest error");
        };
        assert!(message.contains("access denied"), "{message}");
    }

    #[test]
    fn test_timeout_on_unbounded_loop() {
        let executor = Executor::new(ResourceLimits {
            timeout_ms: 50,
            ..ResourceLimits::default()
        });
        let err = executor
            .run(fresh(), "for (;;) {}", "/main.js", &[], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
    }

    #[test]
    fn test_eval_is_blocked() {
        let err = run_code(fresh(), "eval(\"1 + 1\");").unwrap_err();
        let ExecError::Guest { message, .. } = err else {
            panic!("expected guest error");
        };
        assert!(message.contains("disabled"), "{message}");
    }

    #[test]
    fn test_function_constructor_is_blocked() {
        let err = run_code(
            fresh(),
            "var F = (function () {}).constructor; F(\"return 1\")();",
        )
        .unwrap_err();
        assert!(matches!(err, ExecError::Guest { .. }));
    }

    #[test]
    fn test_require_is_blocked() {
        let err = run_code(fresh(), "require(\"fs\");").unwrap_err();
        let ExecError::Guest { message, .. } = err else {
            panic!("expected guest error");
        };
        assert!(message.contains("blocked"), "{message}");
    }

    #[test]
    fn test_process_facade() {
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "test".to_string());
        let outcome = Executor::default()
            .run(
                fresh(),
                "console.log(process.argv.join(\",\"));\n\
                 console.log(process.env.MODE);\n\
                 console.log(process.cwd());",
                "/main.ts",
                &["--flag".to_string()],
                &env,
            )
            .unwrap();
        assert_eq!(outcome.stdout, "coracle,/main.ts,--flag\ntest\n/\n");
    }

    #[test]
    fn test_process_exit_code() {
        let outcome = run_code(fresh(), "process.exit(3); console.log(\"never\");").unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout, "");
    }

    #[test]
    fn test_timers_run_in_delay_order() {
        let outcome = run_code(
            fresh(),
            "setTimeout(function () { console.log(\"b\"); }, 10);\n\
             setTimeout(function () { console.log(\"a\"); }, 1);\n\
             console.log(\"main\");",
        )
        .unwrap();
        assert_eq!(outcome.stdout, "main\na\nb\n");
    }

    #[test]
    fn test_buffer_round_trip() {
        let outcome = run_code(
            fresh(),
            "var b = Buffer.from(\"hé\", \"utf8\");\n\
             console.log(b.length);\n\
             console.log(b.toString(\"base64\"));\n\
             console.log(Buffer.from(b.toString(\"base64\"), \"base64\").toString());",
        )
        .unwrap();
        assert_eq!(outcome.stdout, "3\naMOp\nhé\n");
    }

    #[test]
    fn test_output_truncation() {
        let executor = Executor::new(ResourceLimits {
            max_output_bytes: 16,
            ..ResourceLimits::default()
        });
        let outcome = executor
            .run(
                fresh(),
                "for (var i = 0; i < 100; i++) { console.log(\"spam\"); }",
                "/main.js",
                &[],
                &BTreeMap::new(),
            )
            .unwrap();
        assert!(outcome.truncated);
    }
}
