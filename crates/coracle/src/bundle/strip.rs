//! Token-level TypeScript type stripping.
//!
//! Removes the type-only surface of a TypeScript module so the remainder is
//! plain JavaScript: annotations, interfaces, type aliases, `as` /
//! `satisfies` casts, declaration generics, parameter modifiers, optional
//! and non-null markers, and `enum` declarations (lowered to an object
//! IIFE). This is a pragmatic subset, not a TypeScript front end: it covers
//! the constructs guest modules realistically use. Call-site generics
//! (`f<number>(x)`) and arrow-function type parameters are not supported.

use thiserror::Error;

use super::lexer::{LexError, Tok, TokKind};

#[derive(Debug, Error)]
pub enum StripError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("unsupported TypeScript syntax: {0}")]
    Unsupported(String),
    #[error("unexpected end of input while skipping {0}")]
    UnexpectedEof(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Block,
    Object,
    Paren,
    Bracket,
    ClassBody,
}

struct Stripper {
    input: Vec<Tok>,
    output: Vec<Tok>,
    /// Context stack paired with the open-ternary count of each level.
    stack: Vec<(Ctx, u32)>,
    /// Set after `class` until its body brace opens.
    class_header: bool,
    /// Set after `case` until its label colon.
    pending_case: bool,
    /// Output index of an identifier emitted at statement start, used to
    /// recognize labels.
    stmt_ident: Option<usize>,
}

/// Strip TypeScript type syntax from a token stream.
pub fn strip_types(input: Vec<Tok>) -> Result<Vec<Tok>, StripError> {
    let mut stripper = Stripper {
        input,
        output: Vec::new(),
        stack: vec![(Ctx::Block, 0)],
        class_header: false,
        pending_case: false,
        stmt_ident: None,
    };
    stripper.run()?;
    Ok(stripper.output)
}

impl Stripper {
    fn run(&mut self) -> Result<(), StripError> {
        let mut i = 0;
        while i < self.input.len() {
            i = self.step(i)?;
        }
        Ok(())
    }

    fn sig_at(&self, i: usize) -> Option<usize> {
        (i..self.input.len()).find(|&j| !self.input[j].is_trivia())
    }

    fn sig_text(&self, i: usize) -> Option<&str> {
        self.sig_at(i).map(|j| self.input[j].text.as_str())
    }

    fn prev_out(&self) -> Option<&Tok> {
        self.output.iter().rev().find(|t| !t.is_trivia())
    }

    fn top(&self) -> Ctx {
        self.stack.last().map_or(Ctx::Block, |(c, _)| *c)
    }

    fn at_stmt_start(&self) -> bool {
        match self.prev_out() {
            None => true,
            Some(t) => matches!(t.text.as_str(), ";" | "{" | "}") && t.kind == TokKind::Punct,
        }
    }

    fn emit(&mut self, i: usize) -> usize {
        let tok = self.input[i].clone();
        if !tok.is_trivia() {
            if tok.kind == TokKind::Ident && self.at_stmt_start() {
                self.stmt_ident = Some(self.output.len());
            } else {
                self.stmt_ident = None;
            }
        }
        self.output.push(tok);
        i + 1
    }

    fn step(&mut self, i: usize) -> Result<usize, StripError> {
        let tok = &self.input[i];
        if tok.is_trivia() {
            self.output.push(tok.clone());
            return Ok(i + 1);
        }

        match tok.kind {
            TokKind::Ident => self.step_ident(i),
            TokKind::Punct => self.step_punct(i),
            _ => Ok(self.emit(i)),
        }
    }

    fn step_ident(&mut self, i: usize) -> Result<usize, StripError> {
        let text = self.input[i].text.clone();
        let stmt_start = self.at_stmt_start();
        let next = self.sig_text(i + 1).map(str::to_string);

        match text.as_str() {
            "import" if stmt_start => {
                if next.as_deref() == Some("type") {
                    return self.skip_import_statement(i);
                }
                self.copy_import(i)
            }
            "export" if stmt_start => {
                match next.as_deref() {
                    Some("type" | "interface" | "declare") => {
                        self.skip_export_type_statement(i)
                    }
                    // Export clauses are copied verbatim so `as` renames
                    // survive; the module lowering handles them.
                    Some("{" | "*") => self.copy_export_clause(i),
                    _ => Ok(self.emit(i)),
                }
            }
            "interface" if stmt_start => self.skip_interface(i),
            "type"
                if stmt_start
                    && self
                        .sig_at(i + 1)
                        .is_some_and(|j| self.input[j].kind == TokKind::Ident)
                    && self
                        .sig_at(i + 1)
                        .and_then(|j| self.sig_text(j + 1))
                        .is_some_and(|t| t == "=" || t == "<") =>
            {
                self.skip_to_statement_end(i, "type alias")
            }
            "declare" if stmt_start => self.skip_to_statement_end(i, "declare"),
            "abstract" if next.as_deref() == Some("class") => Ok(i + 1),
            "enum" if stmt_start => self.lower_enum(i),
            "const" if stmt_start && next.as_deref() == Some("enum") => {
                let j = self.sig_at(i + 1).expect("enum token");
                self.lower_enum(j)
            }
            "class" => {
                self.class_header = true;
                Ok(self.emit(i))
            }
            "as" | "satisfies" if self.follows_expression() => {
                let after = self.consume_type(i + 1)?;
                Ok(after)
            }
            "public" | "private" | "protected" | "readonly" | "override"
                if (self.top() == Ctx::Paren || self.top() == Ctx::ClassBody)
                    && self.sig_at(i + 1).is_some_and(|j| {
                        self.input[j].kind == TokKind::Ident
                            || self.input[j].is("[")
                            || self.input[j].is("*")
                    }) =>
            {
                Ok(i + 1)
            }
            "function" => {
                let mut at = self.emit(i);
                // Keep the name, drop declaration generics.
                if let Some(j) = self.sig_at(at) {
                    if self.input[j].is("*") {
                        while at <= j {
                            at = self.emit(at);
                        }
                    }
                }
                if let Some(j) = self.sig_at(at) {
                    if self.input[j].kind == TokKind::Ident {
                        while at <= j {
                            at = self.emit(at);
                        }
                        if let Some(k) = self.sig_at(at) {
                            if self.input[k].is("<") {
                                return self.skip_angles(k);
                            }
                        }
                    }
                }
                Ok(at)
            }
            "implements" if self.class_header => {
                // Drop through to the class body brace.
                let mut j = i + 1;
                while j < self.input.len() && !self.input[j].is("{") {
                    j += 1;
                }
                Ok(j)
            }
            _ => {
                if text == "case" && self.top() == Ctx::Block {
                    self.pending_case = true;
                }
                let at = self.emit(i);
                // Declaration generics directly after a class name.
                if self.class_header {
                    if let Some(j) = self.sig_at(at) {
                        if self.input[j].is("<") {
                            return self.skip_angles(j);
                        }
                    }
                }
                Ok(at)
            }
        }
    }

    fn step_punct(&mut self, i: usize) -> Result<usize, StripError> {
        let text = self.input[i].text.clone();
        match text.as_str() {
            "{" => {
                let ctx = if self.class_header {
                    self.class_header = false;
                    Ctx::ClassBody
                } else {
                    self.classify_brace()
                };
                self.stack.push((ctx, 0));
                Ok(self.emit(i))
            }
            "}" => {
                if self.stack.len() > 1 {
                    self.stack.pop();
                }
                Ok(self.emit(i))
            }
            "(" => {
                self.stack.push((Ctx::Paren, 0));
                Ok(self.emit(i))
            }
            ")" => {
                if self.stack.len() > 1 {
                    self.stack.pop();
                }
                Ok(self.emit(i))
            }
            "[" => {
                self.stack.push((Ctx::Bracket, 0));
                Ok(self.emit(i))
            }
            "]" => {
                if self.stack.len() > 1 {
                    self.stack.pop();
                }
                Ok(self.emit(i))
            }
            "?" => {
                // Optional marker `a?: T`, `a?)`, `a?,` is dropped; anything
                // else opens a ternary.
                let next = self.sig_text(i + 1);
                if matches!(next, Some(":" | ")" | ","))
                    && self
                        .prev_out()
                        .is_some_and(|t| t.kind == TokKind::Ident || t.is(")") || t.is("]"))
                {
                    return Ok(i + 1);
                }
                if let Some(level) = self.stack.last_mut() {
                    level.1 += 1;
                }
                Ok(self.emit(i))
            }
            ":" => {
                if self.prev_out().is_some_and(|t| t.text == "default") {
                    return Ok(self.emit(i));
                }
                if self.pending_case {
                    self.pending_case = false;
                    return Ok(self.emit(i));
                }
                if self.stack.last().is_some_and(|(_, ternary)| *ternary > 0) {
                    if let Some(level) = self.stack.last_mut() {
                        level.1 -= 1;
                    }
                    return Ok(self.emit(i));
                }
                if matches!(self.top(), Ctx::Object | Ctx::Bracket) {
                    return Ok(self.emit(i));
                }
                if self.top() == Ctx::Block
                    && self
                        .stmt_ident
                        .is_some_and(|idx| idx + 1 == self.output.len())
                {
                    // A label: `loop: for (...)`.
                    return Ok(self.emit(i));
                }
                self.consume_type(i + 1)
            }
            "!" => {
                // Non-null assertion postfix.
                if self.prev_out().is_some_and(|t| {
                    matches!(
                        t.kind,
                        TokKind::Ident | TokKind::Num | TokKind::Str | TokKind::Template
                    ) || t.is(")")
                        || t.is("]")
                }) {
                    return Ok(i + 1);
                }
                Ok(self.emit(i))
            }
            _ => Ok(self.emit(i)),
        }
    }

    fn follows_expression(&self) -> bool {
        self.prev_out().is_some_and(|t| {
            matches!(
                t.kind,
                TokKind::Ident | TokKind::Num | TokKind::Str | TokKind::Template
            ) || t.is(")")
                || t.is("]")
        })
    }

    fn classify_brace(&self) -> Ctx {
        let Some(prev) = self.prev_out() else {
            return Ctx::Block;
        };
        match prev.kind {
            TokKind::Punct => match prev.text.as_str() {
                "=" | "(" | "[" | "," | ":" => Ctx::Object,
                _ => Ctx::Block,
            },
            TokKind::Ident => match prev.text.as_str() {
                "return" | "const" | "let" | "var" | "in" | "of" | "typeof" => Ctx::Object,
                _ => Ctx::Block,
            },
            _ => Ctx::Block,
        }
    }

    /// Copy an import statement verbatim up to and including its module
    /// specifier string (or terminating semicolon for bare clauses).
    fn copy_import(&mut self, mut i: usize) -> Result<usize, StripError> {
        while i < self.input.len() {
            let is_str = self.input[i].kind == TokKind::Str;
            let is_semi = self.input[i].is(";");
            i = self.emit(i);
            if is_str || is_semi {
                return Ok(i);
            }
        }
        Err(StripError::UnexpectedEof("import statement"))
    }

    /// Copy `export { ... } [from "m"]` or `export * [as ns] from "m"`
    /// verbatim.
    fn copy_export_clause(&mut self, mut i: usize) -> Result<usize, StripError> {
        while i < self.input.len() {
            let is_str = self.input[i].kind == TokKind::Str;
            let is_semi = self.input[i].is(";");
            let closes = self.input[i].is("}")
                && self.sig_text(i + 1) != Some("from")
                && !self.sig_text(i + 1).is_some_and(|t| t == ";");
            i = self.emit(i);
            if is_str || is_semi || closes {
                return Ok(i);
            }
        }
        Err(StripError::UnexpectedEof("export clause"))
    }

    fn skip_export_type_statement(&mut self, i: usize) -> Result<usize, StripError> {
        // `i` sits on `export`; the next significant token decides the shape.
        let j = self.sig_at(i + 1).ok_or(StripError::UnexpectedEof("export"))?;
        match self.input[j].text.as_str() {
            "interface" => self.skip_interface(j),
            // `export type { A } from "m"` has an import-shaped tail.
            "type" if self.sig_text(j + 1) == Some("{") => self.skip_import_statement(j),
            _ => self.skip_to_statement_end(i, "export type"),
        }
    }

    /// Skip a type-only import/export statement: everything up to its
    /// module string or terminating semicolon.
    fn skip_import_statement(&mut self, mut i: usize) -> Result<usize, StripError> {
        while i < self.input.len() {
            let is_str = self.input[i].kind == TokKind::Str;
            let is_semi = self.input[i].is(";");
            i += 1;
            if is_semi {
                return Ok(i);
            }
            if is_str {
                if let Some(k) = self.sig_at(i) {
                    if self.input[k].is(";") {
                        return Ok(k + 1);
                    }
                }
                return Ok(i);
            }
        }
        Err(StripError::UnexpectedEof("import statement"))
    }

    fn skip_interface(&mut self, i: usize) -> Result<usize, StripError> {
        // interface Name<...> extends A, B { ... } ;?
        let mut j = i;
        while j < self.input.len() && !self.input[j].is("{") {
            j += 1;
        }
        if j == self.input.len() {
            return Err(StripError::UnexpectedEof("interface"));
        }
        let mut depth = 0usize;
        while j < self.input.len() {
            if self.input[j].is("{") {
                depth += 1;
            } else if self.input[j].is("}") {
                depth -= 1;
                if depth == 0 {
                    j += 1;
                    break;
                }
            }
            j += 1;
        }
        if let Some(k) = self.sig_at(j) {
            if self.input[k].is(";") {
                return Ok(k + 1);
            }
        }
        Ok(j)
    }

    /// Skip until a `;` at bracket depth zero, a brace group that closes
    /// the statement, or a newline that ends it, consuming the terminator.
    fn skip_to_statement_end(&mut self, i: usize, what: &'static str) -> Result<usize, StripError> {
        let mut depth = 0i32;
        let mut j = i;
        let mut seen_body = false;
        while j < self.input.len() {
            let tok = &self.input[j];
            match tok.text.as_str() {
                "{" | "(" | "[" => depth += 1,
                "}" => {
                    depth -= 1;
                    if depth == 0 {
                        // A closing brace ends the statement unless the
                        // type expression continues past it.
                        match self.sig_text(j + 1) {
                            Some("|" | "&" | "[" | "." | "=>" | "extends" | "?" | ":") => {}
                            Some(";") => {}
                            _ => return Ok(j + 1),
                        }
                    }
                }
                ")" | "]" => depth -= 1,
                ";" if depth == 0 => return Ok(j + 1),
                "=" if depth == 0 => seen_body = true,
                _ => {}
            }
            if tok.kind == TokKind::Ws && tok.text.contains('\n') && depth == 0 && seen_body {
                // ASI: the alias body ended at this newline unless an
                // operator keeps the expression open.
                if let Some(k) = self.sig_at(j) {
                    let next = self.input[k].text.as_str();
                    if !matches!(next, "|" | "&" | "extends" | "=>" | "." | "<" | ">" | "?" | ":")
                    {
                        return Ok(j);
                    }
                } else {
                    return Ok(j);
                }
            }
            j += 1;
        }
        if depth != 0 {
            return Err(StripError::UnexpectedEof(what));
        }
        Ok(j)
    }

    /// Consume a balanced `<...>` group without emitting it.
    fn skip_angles(&mut self, i: usize) -> Result<usize, StripError> {
        let mut depth = 0i32;
        let mut j = i;
        while j < self.input.len() {
            let text = self.input[j].text.as_str();
            if text.chars().all(|c| c == '<') && !text.is_empty() {
                depth += text.len() as i32;
            } else if text.chars().all(|c| c == '>') && !text.is_empty() {
                depth -= text.len() as i32;
            } else if text == ">=" {
                depth -= 1;
            }
            j += 1;
            if depth <= 0 {
                return Ok(j);
            }
        }
        Err(StripError::UnexpectedEof("type parameters"))
    }

    /// Consume a type expression starting at `i`, returning the index just
    /// past it. Nothing is emitted.
    fn consume_type(&mut self, i: usize) -> Result<usize, StripError> {
        let mut j = self.consume_type_atom(i)?;
        loop {
            let Some(k) = self.sig_at(j) else {
                return Ok(j);
            };
            match self.input[k].text.as_str() {
                "|" | "&" => {
                    j = self.consume_type_atom(k + 1)?;
                }
                "[" => {
                    j = self.skip_balanced(k, "[", "]")?;
                }
                "." => {
                    j = self.sig_at(k + 1).map_or(k + 1, |m| m + 1);
                }
                "extends" => {
                    j = self.consume_type_atom(k + 1)?;
                    if let Some(q) = self.sig_at(j) {
                        if self.input[q].is("?") {
                            j = self.consume_type_atom(q + 1)?;
                            if let Some(colon) = self.sig_at(j) {
                                if self.input[colon].is(":") {
                                    j = self.consume_type_atom(colon + 1)?;
                                }
                            }
                        }
                    }
                }
                _ => return Ok(j),
            }
        }
    }

    fn consume_type_atom(&mut self, i: usize) -> Result<usize, StripError> {
        let j = self
            .sig_at(i)
            .ok_or(StripError::UnexpectedEof("type expression"))?;
        let tok = &self.input[j];
        match tok.kind {
            TokKind::Ident => match tok.text.as_str() {
                "keyof" | "typeof" | "readonly" | "infer" | "new" => self.consume_type_atom(j + 1),
                _ => {
                    let mut at = j + 1;
                    if let Some(k) = self.sig_at(at) {
                        if self.input[k].is("<") {
                            at = self.skip_angles(k)?;
                        }
                    }
                    Ok(at)
                }
            },
            TokKind::Str | TokKind::Num | TokKind::Template => Ok(j + 1),
            TokKind::Punct => match tok.text.as_str() {
                "{" => self.skip_balanced(j, "{", "}"),
                "[" => self.skip_balanced(j, "[", "]"),
                "(" => {
                    let after = self.skip_balanced(j, "(", ")")?;
                    if let Some(k) = self.sig_at(after) {
                        if self.input[k].is("=>") {
                            return self.consume_type_atom(k + 1);
                        }
                    }
                    Ok(after)
                }
                "-" => {
                    let k = self
                        .sig_at(j + 1)
                        .ok_or(StripError::UnexpectedEof("type expression"))?;
                    Ok(k + 1)
                }
                other => Err(StripError::Unsupported(format!(
                    "type expression starting with `{other}`"
                ))),
            },
            _ => Err(StripError::Unsupported(
                "type expression starting with trivia".to_string(),
            )),
        }
    }

    fn skip_balanced(
        &mut self,
        i: usize,
        open: &str,
        close: &str,
    ) -> Result<usize, StripError> {
        let mut depth = 0usize;
        let mut j = i;
        while j < self.input.len() {
            if self.input[j].is(open) {
                depth += 1;
            } else if self.input[j].is(close) {
                depth -= 1;
                if depth == 0 {
                    return Ok(j + 1);
                }
            }
            j += 1;
        }
        Err(StripError::UnexpectedEof("balanced group"))
    }

    /// Lower `enum Name { A, B = 2, C = "c" }` to a plain-object IIFE.
    fn lower_enum(&mut self, i: usize) -> Result<usize, StripError> {
        let name_at = self
            .sig_at(i + 1)
            .ok_or(StripError::UnexpectedEof("enum"))?;
        if self.input[name_at].kind != TokKind::Ident {
            return Err(StripError::Unsupported("enum without a name".to_string()));
        }
        let name = self.input[name_at].text.clone();
        let open = self
            .sig_at(name_at + 1)
            .filter(|&j| self.input[j].is("{"))
            .ok_or(StripError::UnexpectedEof("enum body"))?;

        let mut body = String::new();
        let mut next_auto: Option<i64> = Some(0);
        let mut j = open + 1;
        loop {
            let Some(member_at) = self.sig_at(j) else {
                return Err(StripError::UnexpectedEof("enum body"));
            };
            if self.input[member_at].is("}") {
                j = member_at + 1;
                break;
            }
            let member = match self.input[member_at].kind {
                TokKind::Ident => self.input[member_at].text.clone(),
                TokKind::Str => self.input[member_at].string_value(),
                _ => {
                    return Err(StripError::Unsupported(
                        "enum member must be a name".to_string(),
                    ))
                }
            };
            let mut value_at = self.sig_at(member_at + 1);
            let mut value: Option<Tok> = None;
            if value_at.is_some_and(|k| self.input[k].is("=")) {
                let k = self
                    .sig_at(value_at.unwrap() + 1)
                    .ok_or(StripError::UnexpectedEof("enum value"))?;
                match self.input[k].kind {
                    TokKind::Num | TokKind::Str => value = Some(self.input[k].clone()),
                    _ => {
                        return Err(StripError::Unsupported(
                            "enum initializers must be literals".to_string(),
                        ))
                    }
                }
                value_at = self.sig_at(k + 1);
            }

            match value {
                Some(tok) if tok.kind == TokKind::Num => {
                    body.push_str(&format!(
                        "{name}[{name}[\"{member}\"] = {}] = \"{member}\"; ",
                        tok.text
                    ));
                    next_auto = tok.text.parse::<i64>().ok().map(|v| v + 1);
                }
                Some(tok) => {
                    body.push_str(&format!("{name}[\"{member}\"] = {}; ", tok.text));
                    next_auto = None;
                }
                None => {
                    let auto = next_auto.ok_or_else(|| {
                        StripError::Unsupported(
                            "enum member needs an initializer after a string member".to_string(),
                        )
                    })?;
                    body.push_str(&format!(
                        "{name}[{name}[\"{member}\"] = {auto}] = \"{member}\"; "
                    ));
                    next_auto = Some(auto + 1);
                }
            }

            match value_at {
                Some(k) if self.input[k].is(",") => j = k + 1,
                Some(k) if self.input[k].is("}") => {
                    j = k + 1;
                    break;
                }
                _ => return Err(StripError::UnexpectedEof("enum body")),
            }
        }

        let lowered = format!("var {name}; (function ({name}) {{ {body}}})({name} || ({name} = {{}}));");
        self.output.push(Tok {
            kind: TokKind::Ident,
            text: lowered,
        });
        self.stmt_ident = None;
        // Trailing semicolon after the enum body, if any.
        if let Some(k) = self.sig_at(j) {
            if self.input[k].is(";") {
                return Ok(k + 1);
            }
        }
        Ok(j)
    }
}
