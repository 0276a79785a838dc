//! Guest module bundler.
//!
//! Resolves an entry file and its transitive imports strictly against the
//! workspace plus the fixed shim set, lowers every module to CommonJS, and
//! emits one self-contained blob callable with a `(require, module,
//! exports)` trio. Anything else — bare package names, capability-bearing
//! node modules, dynamic import — is rejected at this boundary.

mod lexer;
mod shims;
mod strip;
mod transform;

pub use lexer::LexError;
pub use strip::StripError;
pub use transform::TransformError;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::vpath;
use crate::workspace::{EntryKind, Workspace};

/// Import specifiers refused outright as defense-in-depth, ahead of the
/// generic bare-specifier rejection.
const DENYLIST: &[&str] = &[
    "child_process",
    "cluster",
    "crypto",
    "dgram",
    "dns",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "process",
    "repl",
    "tls",
    "v8",
    "vm",
    "worker_threads",
];

/// Extension probing order for workspace imports.
const EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".mjs", ".cjs", ".json"];

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("entry module not found: {0}")]
    MissingEntry(String),
    #[error("cannot resolve \"{specifier}\" imported from {importer}")]
    Unresolved { specifier: String, importer: String },
    #[error("blocked module \"{specifier}\" imported from {importer}")]
    Blocked { specifier: String, importer: String },
    #[error("failed to compile {path}: {source}")]
    Transform {
        path: String,
        #[source]
        source: TransformError,
    },
}

/// A bundled program: one CommonJS blob and the entry module id.
#[derive(Debug)]
pub struct Bundle {
    pub code: String,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    Shim(&'static str),
    Module(String),
}

impl Resolved {
    fn id(&self) -> String {
        match self {
            Resolved::Shim(name) => format!("{}{name}", shims::SHIM_ID_PREFIX),
            Resolved::Module(path) => path.clone(),
        }
    }
}

struct ModuleRecord {
    body: String,
    deps: BTreeMap<String, String>,
}

/// Bundle the module graph rooted at `entry_path`.
pub fn bundle(ws: &Workspace, entry_path: &str) -> Result<Bundle, BundleError> {
    let entry = probe(ws, &vpath::normalize(entry_path))
        .ok_or_else(|| BundleError::MissingEntry(vpath::normalize(entry_path)))?;

    let mut modules: BTreeMap<String, ModuleRecord> = BTreeMap::new();
    let mut pending = vec![Resolved::Module(entry.clone())];

    while let Some(next) = pending.pop() {
        let id = next.id();
        if modules.contains_key(&id) {
            continue;
        }
        let record = match &next {
            Resolved::Shim(name) => ModuleRecord {
                body: shims::shim_source(name).expect("known shim").to_string(),
                deps: BTreeMap::new(),
            },
            Resolved::Module(path) => {
                let (body, imports) = lower(ws, path)?;
                let mut deps = BTreeMap::new();
                for specifier in imports {
                    let resolved = resolve(ws, &specifier, path)?;
                    deps.insert(specifier, resolved.id());
                    pending.push(resolved);
                }
                ModuleRecord { body, deps }
            }
        };
        modules.insert(id, record);
    }

    Ok(Bundle {
        code: emit(&modules, &entry),
        entry,
    })
}

fn lower(ws: &Workspace, path: &str) -> Result<(String, Vec<String>), BundleError> {
    let bytes = ws
        .read_file(path)
        .map_err(|_| BundleError::MissingEntry(path.to_string()))?;
    let src = String::from_utf8_lossy(bytes);

    if path.ends_with(".json") {
        return Ok((format!("module.exports = {};", src.trim()), Vec::new()));
    }

    let typescript = path.ends_with(".ts") || path.ends_with(".tsx");
    let lowered =
        transform::lower_module(&src, typescript).map_err(|source| BundleError::Transform {
            path: path.to_string(),
            source,
        })?;
    Ok((lowered.body, lowered.imports))
}

/// Resolve one import specifier relative to its importer.
fn resolve(ws: &Workspace, specifier: &str, importer: &str) -> Result<Resolved, BundleError> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    if let Some(shim) = shims::SHIM_NAMES.iter().find(|n| **n == bare) {
        return Ok(Resolved::Shim(shim));
    }

    let base = if specifier.starts_with("./") || specifier.starts_with("../") {
        vpath::join(&[&vpath::dirname(importer), specifier])
    } else if specifier.starts_with('/') || specifier.starts_with('~') {
        vpath::normalize(specifier)
    } else if DENYLIST.contains(&bare) {
        return Err(BundleError::Blocked {
            specifier: specifier.to_string(),
            importer: importer.to_string(),
        });
    } else {
        return Err(BundleError::Unresolved {
            specifier: specifier.to_string(),
            importer: importer.to_string(),
        });
    };

    probe(ws, &base)
        .map(Resolved::Module)
        .ok_or_else(|| BundleError::Unresolved {
            specifier: specifier.to_string(),
            importer: importer.to_string(),
        })
}

/// Try a path as written, with the known extensions, then as a directory
/// with index files. First existing file wins.
fn probe(ws: &Workspace, base: &str) -> Option<String> {
    let is_file = |p: &str| ws.stat(p).map(|s| s.kind) == Some(EntryKind::File);

    if is_file(base) {
        return Some(base.to_string());
    }
    for ext in EXTENSIONS {
        let candidate = format!("{base}{ext}");
        if is_file(&candidate) {
            return Some(candidate);
        }
    }
    for ext in EXTENSIONS {
        let candidate = format!("{base}/index{ext}");
        if is_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn emit(modules: &BTreeMap<String, ModuleRecord>, entry: &str) -> String {
    let mut out = String::new();
    out.push_str("\"use strict\";\n");
    out.push_str("var __modules = Object.create(null);\n");
    out.push_str("var __cache = Object.create(null);\n");
    out.push_str(
        "function __register(id, deps, fn) { __modules[id] = { deps: deps, fn: fn }; }\n",
    );
    out.push_str("function __default(m) { return m && m.__esModule ? m.default : m; }\n");
    out.push_str(concat!(
        "function __load(id) {\n",
        "  if (__cache[id]) { return __cache[id].exports; }\n",
        "  var mod = __modules[id];\n",
        "  if (!mod) { throw new Error(\"module not found: \" + id); }\n",
        "  var module = { exports: {} };\n",
        "  __cache[id] = module;\n",
        "  function localRequire(spec) {\n",
        "    var target = mod.deps[spec];\n",
        "    if (target === undefined) { throw new Error(\"unresolved import \\\"\" + spec + \"\\\"\"); }\n",
        "    return __load(target);\n",
        "  }\n",
        "  mod.fn.call(module.exports, localRequire, module, module.exports);\n",
        "  return module.exports;\n",
        "}\n",
    ));

    for (id, record) in modules {
        let deps_json =
            serde_json::to_string(&record.deps).expect("dependency map serializes");
        let id_json = serde_json::to_string(id).expect("module id serializes");
        out.push_str(&format!(
            "__register({id_json}, {deps_json}, function (require, module, exports) {{\n{}\n}});\n",
            record.body
        ));
    }

    let entry_json = serde_json::to_string(entry).expect("entry id serializes");
    out.push_str(&format!("module.exports = __load({entry_json});\n"));
    out
}
