//! Embedded standard-library shims presented to guest code.
//!
//! The bundler registers these sources under the `fs`, `path`, and `os`
//! specifiers (and their `node:` forms). They are plain CommonJS modules.
//! The `fs` shim forwards every operation to the capability object the
//! executor binds as `globalThis.__workspace`; `path` and `os` are pure and
//! never consult the host.

/// Module id prefix for shim modules inside a bundle.
pub const SHIM_ID_PREFIX: &str = "coracle:";

/// Bare specifiers served from the shim set.
pub const SHIM_NAMES: &[&str] = &["fs", "path", "os"];

pub fn shim_source(name: &str) -> Option<&'static str> {
    match name {
        "fs" => Some(FS_SHIM),
        "path" => Some(PATH_SHIM),
        "os" => Some(OS_SHIM),
        _ => None,
    }
}

const FS_SHIM: &str = r#""use strict";
var cap = globalThis.__workspace;
if (!cap) { throw new Error("workspace capability is not available"); }

function encodingOf(options, fallback) {
  if (typeof options === "string") { return options; }
  if (options && typeof options.encoding === "string") { return options.encoding; }
  return fallback;
}

function notFound(path) {
  var err = new Error("ENOENT: no such file or directory, '" + path + "'");
  err.code = "ENOENT";
  return err;
}

function readFileSync(path, options) {
  var enc = encodingOf(options, null);
  if (enc === null) {
    return Buffer.from(cap.readFile(path, "base64"), "base64");
  }
  if (enc === "utf8" || enc === "utf-8") {
    return cap.readFile(path, "utf8");
  }
  if (enc === "base64") {
    return cap.readFile(path, "base64");
  }
  throw new Error("unsupported encoding: " + enc);
}

function writeFileSync(path, data, options) {
  var enc = encodingOf(options, "utf8");
  if (data instanceof Uint8Array) {
    cap.writeFile(path, Buffer.from(data).toString("base64"), "base64");
    return;
  }
  var text = String(data);
  if (enc === "utf8" || enc === "utf-8") {
    cap.writeFile(path, text, "utf8");
  } else if (enc === "base64") {
    cap.writeFile(path, text, "base64");
  } else {
    throw new Error("unsupported encoding: " + enc);
  }
}

function appendFileSync(path, data, options) {
  var existing;
  try { existing = readFileSync(path); } catch (_e) { existing = Buffer.alloc(0); }
  var added = data instanceof Uint8Array ? Buffer.from(data) : Buffer.from(String(data), "utf8");
  writeFileSync(path, Buffer.concat([existing, added]));
}

function statSync(path) {
  var info = cap.stat(path);
  if (!info) { throw notFound(path); }
  return {
    size: info.size,
    isFile: function () { return info.type === "file"; },
    isDirectory: function () { return info.type === "dir"; },
  };
}

function existsSync(path) {
  return !!cap.stat(path);
}

function readdirSync(path) {
  return cap.readdir(path);
}

function mkdirSync(path, options) {
  var recursive = options === true || !!(options && options.recursive);
  cap.mkdir(path, recursive);
}

function unlinkSync(path) {
  cap.deletePath(path);
}

function rmdirSync(path) {
  cap.deletePath(path);
}

function rmSync(path, options) {
  if (options && options.force && !existsSync(path)) { return; }
  cap.deletePath(path);
}

function callbackify(fn) {
  return function () {
    var args = Array.prototype.slice.call(arguments);
    var cb = args.pop();
    if (typeof cb !== "function") { throw new Error("callback required"); }
    try {
      cb(null, fn.apply(null, args));
    } catch (err) {
      cb(err);
    }
  };
}

function promisify(fn) {
  return function () {
    var args = arguments;
    return new Promise(function (resolve, reject) {
      try {
        resolve(fn.apply(null, args));
      } catch (err) {
        reject(err);
      }
    });
  };
}

module.exports = {
  readFileSync: readFileSync,
  writeFileSync: writeFileSync,
  appendFileSync: appendFileSync,
  statSync: statSync,
  existsSync: existsSync,
  readdirSync: readdirSync,
  mkdirSync: mkdirSync,
  unlinkSync: unlinkSync,
  rmdirSync: rmdirSync,
  rmSync: rmSync,
  readFile: callbackify(readFileSync),
  writeFile: callbackify(writeFileSync),
  appendFile: callbackify(appendFileSync),
  stat: callbackify(statSync),
  readdir: callbackify(readdirSync),
  mkdir: callbackify(mkdirSync),
  unlink: callbackify(unlinkSync),
  rm: callbackify(rmSync),
  promises: {
    readFile: promisify(readFileSync),
    writeFile: promisify(writeFileSync),
    appendFile: promisify(appendFileSync),
    stat: promisify(statSync),
    readdir: promisify(readdirSync),
    mkdir: promisify(mkdirSync),
    unlink: promisify(unlinkSync),
    rm: promisify(rmSync),
  },
};
"#;

const PATH_SHIM: &str = r#""use strict";

var sep = "/";

function normalize(path) {
  path = String(path).replace(/\\/g, "/");
  var absolute = path.charAt(0) === "/";
  var trailing = path.length > 1 && path.charAt(path.length - 1) === "/";
  var out = [];
  var parts = path.split("/");
  for (var i = 0; i < parts.length; i++) {
    var part = parts[i];
    if (part === "" || part === ".") { continue; }
    if (part === "..") {
      if (out.length > 0 && out[out.length - 1] !== "..") { out.pop(); }
      else if (!absolute) { out.push(".."); }
      continue;
    }
    out.push(part);
  }
  var joined = out.join("/");
  if (absolute) { joined = "/" + joined; }
  if (joined === "") { joined = absolute ? "/" : "."; }
  if (trailing && joined !== "/" && joined !== ".") { joined += "/"; }
  return joined;
}

function join() {
  var parts = [];
  for (var i = 0; i < arguments.length; i++) {
    var arg = String(arguments[i]);
    if (arg !== "") { parts.push(arg); }
  }
  if (parts.length === 0) { return "."; }
  return normalize(parts.join("/"));
}

function resolve() {
  var resolved = "";
  for (var i = arguments.length - 1; i >= 0; i--) {
    var arg = String(arguments[i]);
    if (arg === "") { continue; }
    resolved = resolved === "" ? arg : arg + "/" + resolved;
    if (arg.charAt(0) === "/") { break; }
  }
  if (resolved.charAt(0) !== "/") { resolved = "/" + resolved; }
  var out = normalize(resolved);
  if (out.length > 1 && out.charAt(out.length - 1) === "/") {
    out = out.slice(0, -1);
  }
  return out;
}

function isAbsolute(path) {
  return String(path).charAt(0) === "/";
}

function dirname(path) {
  path = normalize(path);
  if (path === "/") { return "/"; }
  if (path.charAt(path.length - 1) === "/") { path = path.slice(0, -1); }
  var idx = path.lastIndexOf("/");
  if (idx < 0) { return "."; }
  if (idx === 0) { return "/"; }
  return path.slice(0, idx);
}

function basename(path, ext) {
  path = normalize(path);
  if (path.charAt(path.length - 1) === "/") { path = path.slice(0, -1); }
  var idx = path.lastIndexOf("/");
  var base = idx < 0 ? path : path.slice(idx + 1);
  if (ext && base.length > ext.length && base.slice(-ext.length) === ext) {
    base = base.slice(0, base.length - ext.length);
  }
  return base;
}

function extname(path) {
  var base = basename(path);
  var idx = base.lastIndexOf(".");
  if (idx <= 0) { return ""; }
  return base.slice(idx);
}

function relative(from, to) {
  var fromParts = resolve(from).split("/").filter(Boolean);
  var toParts = resolve(to).split("/").filter(Boolean);
  var shared = 0;
  while (
    shared < fromParts.length &&
    shared < toParts.length &&
    fromParts[shared] === toParts[shared]
  ) {
    shared++;
  }
  var up = fromParts.length - shared;
  var out = [];
  for (var i = 0; i < up; i++) { out.push(".."); }
  return out.concat(toParts.slice(shared)).join("/");
}

function parse(path) {
  var dir = dirname(path);
  var base = basename(path);
  var ext = extname(path);
  return {
    root: isAbsolute(path) ? "/" : "",
    dir: dir === "." && !isAbsolute(path) ? "" : dir,
    base: base,
    ext: ext,
    name: ext ? base.slice(0, base.length - ext.length) : base,
  };
}

function format(parts) {
  var dir = parts.dir || parts.root || "";
  var base = parts.base || (parts.name || "") + (parts.ext || "");
  if (dir === "") { return base; }
  return dir === "/" ? dir + base : dir + "/" + base;
}

module.exports = {
  sep: sep,
  delimiter: ":",
  normalize: normalize,
  join: join,
  resolve: resolve,
  isAbsolute: isAbsolute,
  dirname: dirname,
  basename: basename,
  extname: extname,
  relative: relative,
  parse: parse,
  format: format,
};
module.exports.posix = module.exports;
"#;

const OS_SHIM: &str = r#""use strict";
module.exports = {
  EOL: "\n",
  homedir: function () { return "/"; },
  tmpdir: function () { return "/tmp"; },
  platform: function () { return "linux"; },
};
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_shims_present() {
        for name in SHIM_NAMES {
            assert!(shim_source(name).is_some(), "missing shim {name}");
        }
        assert!(shim_source("net").is_none());
    }

    #[test]
    fn test_fs_shim_uses_capability_global() {
        let src = shim_source("fs").unwrap();
        assert!(src.contains("globalThis.__workspace"));
    }

    #[test]
    fn test_pure_shims_never_touch_capability() {
        for name in ["path", "os"] {
            let src = shim_source(name).unwrap();
            assert!(!src.contains("__workspace"), "{name} must stay pure");
        }
    }
}
