//! Lowering of ES modules to CommonJS module functions.
//!
//! Each guest module becomes a body callable as `(require, module,
//! exports)`. Import declarations turn into `require` calls against the
//! importer's resolved specifier map; export declarations are materialized
//! as `exports.name = name` assignments appended at the end of the module
//! (bindings are captured by value, not live). Plain CommonJS sources pass
//! through untouched apart from `require("...")` specifier collection.

use thiserror::Error;

use super::lexer::{lex, LexError, Tok, TokKind};
use super::strip::{strip_types, StripError};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Strip(#[from] StripError),
    #[error("dynamic import() is not supported")]
    DynamicImport,
    #[error("import.meta is not supported")]
    ImportMeta,
    #[error("malformed {0} declaration")]
    Malformed(&'static str),
}

/// A module body lowered to CommonJS plus the import specifiers it needs.
#[derive(Debug)]
pub struct Lowered {
    pub body: String,
    pub imports: Vec<String>,
}

/// Lower one module source. TypeScript sources are stripped first.
pub fn lower_module(src: &str, typescript: bool) -> Result<Lowered, TransformError> {
    let mut tokens = lex(src)?;
    if typescript {
        tokens = strip_types(tokens)?;
    }
    Lowering::new(tokens).run()
}

struct Lowering {
    tokens: Vec<Tok>,
    i: usize,
    out: String,
    imports: Vec<String>,
    /// `(exported name, local expression)` pairs emitted in the epilogue.
    exports: Vec<(String, String)>,
    /// Raw epilogue statements (`export *` copies).
    epilogue: Vec<String>,
    has_esm: bool,
    reexports: usize,
    depth: i32,
}

impl Lowering {
    fn new(tokens: Vec<Tok>) -> Self {
        Self {
            tokens,
            i: 0,
            out: String::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            epilogue: Vec::new(),
            has_esm: false,
            reexports: 0,
            depth: 0,
        }
    }

    fn run(mut self) -> Result<Lowered, TransformError> {
        while self.i < self.tokens.len() {
            self.step()?;
        }
        if self.has_esm {
            self.out.push_str("\nexports.__esModule = true;");
            for stmt in &self.epilogue {
                self.out.push('\n');
                self.out.push_str(stmt);
            }
            let assignments: Vec<String> = self
                .exports
                .iter()
                .map(|(name, expr)| format!("exports.{name} = {expr};"))
                .collect();
            for assignment in assignments {
                self.out.push('\n');
                self.out.push_str(&assignment);
            }
            self.out.push('\n');
        }
        Ok(Lowered {
            body: self.out,
            imports: self.imports,
        })
    }

    fn sig_at(&self, i: usize) -> Option<usize> {
        (i..self.tokens.len()).find(|&j| !self.tokens[j].is_trivia())
    }

    fn sig_text(&self, i: usize) -> Option<&str> {
        self.sig_at(i).map(|j| self.tokens[j].text.as_str())
    }

    fn prev_sig_out_is_dot(&self) -> bool {
        self.out.trim_end().ends_with('.')
    }

    fn emit_current(&mut self) {
        let tok = &self.tokens[self.i];
        match tok.text.as_str() {
            "{" | "(" | "[" => self.depth += 1,
            "}" | ")" | "]" => self.depth -= 1,
            _ => {}
        }
        self.out.push_str(&tok.text);
        self.i += 1;
    }

    fn record_import(&mut self, specifier: &str) {
        if !self.imports.iter().any(|s| s == specifier) {
            self.imports.push(specifier.to_string());
        }
    }

    fn step(&mut self) -> Result<(), TransformError> {
        let tok = self.tokens[self.i].clone();
        if tok.is_trivia() {
            self.emit_current();
            return Ok(());
        }

        if tok.kind == TokKind::Ident && !self.prev_sig_out_is_dot() {
            match tok.text.as_str() {
                "import" if self.depth == 0 => {
                    match self.sig_text(self.i + 1) {
                        Some("(") => return Err(TransformError::DynamicImport),
                        Some(".") => return Err(TransformError::ImportMeta),
                        _ => return self.lower_import(),
                    }
                }
                "import" => {
                    if self.sig_text(self.i + 1) == Some("(") {
                        return Err(TransformError::DynamicImport);
                    }
                }
                "export" if self.depth == 0 => return self.lower_export(),
                "require" => {
                    // Collect plain `require("spec")` specifiers so the
                    // bundler can resolve them; the call itself is kept.
                    if let Some(open) = self.sig_at(self.i + 1).filter(|&j| self.tokens[j].is("("))
                    {
                        if let Some(arg) = self
                            .sig_at(open + 1)
                            .filter(|&j| self.tokens[j].kind == TokKind::Str)
                        {
                            if self.sig_text(arg + 1) == Some(")") {
                                let spec = self.tokens[arg].string_value();
                                self.record_import(&spec);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        self.emit_current();
        Ok(())
    }

    /// Next significant token, consuming up to and including it.
    fn take_sig(&mut self) -> Option<Tok> {
        let j = self.sig_at(self.i)?;
        let tok = self.tokens[j].clone();
        self.i = j + 1;
        Some(tok)
    }

    fn peek_sig(&self) -> Option<&Tok> {
        self.sig_at(self.i).map(|j| &self.tokens[j])
    }

    fn consume_semi(&mut self) {
        if let Some(j) = self.sig_at(self.i) {
            if self.tokens[j].is(";") {
                self.i = j + 1;
            }
        }
    }

    fn lower_import(&mut self) -> Result<(), TransformError> {
        self.has_esm = true;
        self.i += 1; // `import`

        let mut default_name: Option<String> = None;
        let mut ns_name: Option<String> = None;
        let mut named: Vec<(String, String)> = Vec::new();

        loop {
            let tok = self.take_sig().ok_or(TransformError::Malformed("import"))?;
            match tok.kind {
                TokKind::Str => {
                    // `import "spec"`, or the `from "spec"` terminator.
                    let raw = tok.text.clone();
                    let spec = tok.string_value();
                    self.record_import(&spec);
                    self.consume_semi();
                    self.emit_import_bindings(&raw, default_name, ns_name, named);
                    return Ok(());
                }
                TokKind::Ident if tok.text == "from" => continue,
                TokKind::Ident => default_name = Some(tok.text),
                TokKind::Punct if tok.text == "," => continue,
                TokKind::Punct if tok.text == "*" => {
                    let as_kw = self.take_sig().ok_or(TransformError::Malformed("import"))?;
                    if !as_kw.is("as") {
                        return Err(TransformError::Malformed("import"));
                    }
                    let name = self.take_sig().ok_or(TransformError::Malformed("import"))?;
                    ns_name = Some(name.text);
                }
                TokKind::Punct if tok.text == "{" => loop {
                    let item = self.take_sig().ok_or(TransformError::Malformed("import"))?;
                    if item.is("}") {
                        break;
                    }
                    if item.is(",") {
                        continue;
                    }
                    let imported = item.text.clone();
                    let mut local = imported.clone();
                    if self.peek_sig().is_some_and(|t| t.is("as")) {
                        self.take_sig();
                        local = self
                            .take_sig()
                            .ok_or(TransformError::Malformed("import"))?
                            .text;
                    }
                    named.push((imported, local));
                },
                _ => return Err(TransformError::Malformed("import")),
            }
        }
    }

    fn emit_import_bindings(
        &mut self,
        raw_spec: &str,
        default_name: Option<String>,
        ns_name: Option<String>,
        named: Vec<(String, String)>,
    ) {
        let mut stmts: Vec<String> = Vec::new();
        if let Some(ns) = ns_name {
            stmts.push(format!("const {ns} = require({raw_spec});"));
        }
        if let Some(d) = default_name {
            stmts.push(format!("const {d} = __default(require({raw_spec}));"));
        }
        if !named.is_empty() {
            let fields: Vec<String> = named
                .iter()
                .map(|(imported, local)| {
                    if imported == local {
                        imported.clone()
                    } else {
                        format!("{imported}: {local}")
                    }
                })
                .collect();
            stmts.push(format!(
                "const {{ {} }} = require({raw_spec});",
                fields.join(", ")
            ));
        }
        if stmts.is_empty() {
            stmts.push(format!("require({raw_spec});"));
        }
        self.out.push_str(&stmts.join(" "));
    }

    fn lower_export(&mut self) -> Result<(), TransformError> {
        self.has_esm = true;
        self.i += 1; // `export`

        let next = self
            .peek_sig()
            .cloned()
            .ok_or(TransformError::Malformed("export"))?;

        match next.text.as_str() {
            "default" => {
                self.take_sig();
                if let Some(name) = self.peek_declaration_name() {
                    self.exports.push(("default".to_string(), name));
                } else {
                    self.out.push_str("exports.default =");
                }
                Ok(())
            }
            "{" => {
                self.take_sig();
                let mut pairs: Vec<(String, String)> = Vec::new();
                loop {
                    let item = self.take_sig().ok_or(TransformError::Malformed("export"))?;
                    if item.is("}") {
                        break;
                    }
                    if item.is(",") {
                        continue;
                    }
                    let local = item.text.clone();
                    let mut exported = local.clone();
                    if self.peek_sig().is_some_and(|t| t.is("as")) {
                        self.take_sig();
                        exported = self
                            .take_sig()
                            .ok_or(TransformError::Malformed("export"))?
                            .text;
                    }
                    pairs.push((local, exported));
                }
                if self.peek_sig().is_some_and(|t| t.is("from")) {
                    self.take_sig();
                    let spec = self.take_sig().ok_or(TransformError::Malformed("export"))?;
                    if spec.kind != TokKind::Str {
                        return Err(TransformError::Malformed("export"));
                    }
                    let temp = self.fresh_reexport();
                    self.record_import(&spec.string_value());
                    self.out
                        .push_str(&format!("const {temp} = require({});", spec.text));
                    for (local, exported) in pairs {
                        let access = if local == "default" {
                            format!("__default({temp})")
                        } else {
                            format!("{temp}.{local}")
                        };
                        self.exports.push((exported, access));
                    }
                } else {
                    for (local, exported) in pairs {
                        self.exports.push((exported, local));
                    }
                }
                self.consume_semi();
                Ok(())
            }
            "*" => {
                self.take_sig();
                let mut ns: Option<String> = None;
                if self.peek_sig().is_some_and(|t| t.is("as")) {
                    self.take_sig();
                    ns = Some(
                        self.take_sig()
                            .ok_or(TransformError::Malformed("export"))?
                            .text,
                    );
                }
                let from = self.take_sig().ok_or(TransformError::Malformed("export"))?;
                if !from.is("from") {
                    return Err(TransformError::Malformed("export"));
                }
                let spec = self.take_sig().ok_or(TransformError::Malformed("export"))?;
                if spec.kind != TokKind::Str {
                    return Err(TransformError::Malformed("export"));
                }
                let temp = self.fresh_reexport();
                self.record_import(&spec.string_value());
                self.out
                    .push_str(&format!("const {temp} = require({});", spec.text));
                match ns {
                    Some(name) => self.exports.push((name, temp)),
                    None => self.epilogue.push(format!(
                        "for (const __k in {temp}) {{ if (__k !== \"default\" && \
                         !Object.prototype.hasOwnProperty.call(exports, __k)) \
                         exports[__k] = {temp}[__k]; }}"
                    )),
                }
                self.consume_semi();
                Ok(())
            }
            "const" | "let" | "var" => {
                for name in self.scan_binding_names()? {
                    self.exports.push((name.clone(), name));
                }
                Ok(())
            }
            "function" | "class" | "async" => {
                let name = self
                    .peek_declaration_name()
                    .ok_or(TransformError::Malformed("export"))?;
                self.exports.push((name.clone(), name));
                Ok(())
            }
            _ => Err(TransformError::Malformed("export")),
        }
    }

    fn fresh_reexport(&mut self) -> String {
        let temp = format!("__reexport{}", self.reexports);
        self.reexports += 1;
        temp
    }

    /// Name of a `function`/`class` declaration starting at the cursor,
    /// without consuming anything. Returns `None` for anonymous forms and
    /// plain expressions.
    fn peek_declaration_name(&self) -> Option<String> {
        let mut j = self.sig_at(self.i)?;
        if self.tokens[j].text == "async" {
            j = self.sig_at(j + 1)?;
        }
        if !matches!(self.tokens[j].text.as_str(), "function" | "class") {
            return None;
        }
        j = self.sig_at(j + 1)?;
        if self.tokens[j].is("*") {
            j = self.sig_at(j + 1)?;
        }
        if self.tokens[j].kind == TokKind::Ident {
            Some(self.tokens[j].text.clone())
        } else {
            None
        }
    }

    /// Binding names introduced by the variable declaration starting at the
    /// cursor (`const`/`let`/`var` token). Non-consuming lookahead; supports
    /// plain names and one level of object/array destructuring.
    fn scan_binding_names(&self) -> Result<Vec<String>, TransformError> {
        let mut names = Vec::new();
        let mut j = self.sig_at(self.i).ok_or(TransformError::Malformed("export"))?;
        j += 1; // past the declaration keyword

        loop {
            let Some(start) = self.sig_at(j) else { break };
            let tok = &self.tokens[start];
            if tok.kind == TokKind::Ident {
                names.push(tok.text.clone());
                j = start + 1;
            } else if tok.is("{") || tok.is("[") {
                let close = if tok.is("{") { "}" } else { "]" };
                let open = tok.text.clone();
                let mut depth = 0;
                let mut k = start;
                let mut expect_binding = true;
                while k < self.tokens.len() {
                    let t = &self.tokens[k];
                    if t.is(&open) {
                        depth += 1;
                    } else if t.is(close) {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    } else if depth == 1 && !t.is_trivia() {
                        match t.kind {
                            TokKind::Ident => {
                                if expect_binding {
                                    names.push(t.text.clone());
                                }
                                expect_binding = false;
                            }
                            TokKind::Punct => match t.text.as_str() {
                                "," => expect_binding = true,
                                ":" => {
                                    // `{key: renamed}` binds the rename.
                                    names.pop();
                                    expect_binding = true;
                                }
                                "=" => expect_binding = false,
                                "..." => expect_binding = true,
                                _ => {}
                            },
                            _ => {}
                        }
                    }
                    k += 1;
                }
                j = k + 1;
            } else {
                return Err(TransformError::Malformed("export"));
            }

            // Skip the initializer up to a top-level `,` or `;`.
            let mut depth = 0;
            let mut next_declarator = false;
            while j < self.tokens.len() {
                let t = &self.tokens[j];
                match t.text.as_str() {
                    "{" | "(" | "[" => depth += 1,
                    "}" | ")" | "]" => depth -= 1,
                    "," if depth == 0 && t.kind == TokKind::Punct => {
                        next_declarator = true;
                        j += 1;
                        break;
                    }
                    ";" if depth == 0 && t.kind == TokKind::Punct => {
                        return Ok(names);
                    }
                    _ => {}
                }
                j += 1;
            }
            if !next_declarator {
                break;
            }
        }
        Ok(names)
    }
}
