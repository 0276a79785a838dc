//! Token scanner for guest JavaScript/TypeScript sources.
//!
//! The bundler never builds a syntax tree; both the TypeScript stripper and
//! the module lowering work on this flat token stream. The scanner knows
//! just enough grammar to keep strings, template literals, comments, and
//! regular expression literals opaque, so the passes above it can reason
//! about the remaining punctuation and identifiers.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated template literal")]
    UnterminatedTemplate,
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("unterminated regular expression")]
    UnterminatedRegex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokKind {
    Ident,
    Num,
    Str,
    Template,
    Regex,
    Punct,
    LineComment,
    BlockComment,
    Ws,
}

#[derive(Debug, Clone)]
pub struct Tok {
    pub kind: TokKind,
    pub text: String,
}

impl Tok {
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokKind::Ws | TokKind::LineComment | TokKind::BlockComment
        )
    }

    pub fn is(&self, text: &str) -> bool {
        self.text == text && matches!(self.kind, TokKind::Punct | TokKind::Ident)
    }

    /// Unquoted value of a string token.
    pub fn string_value(&self) -> String {
        debug_assert_eq!(self.kind, TokKind::Str);
        let inner = &self.text[1..self.text.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Multi-character punctuators, longest first.
const PUNCTS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "**", "++", "--", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "<<", ">>",
];

/// Identifiers after which a `/` starts a regular expression literal.
const REGEX_PRECEDING_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

pub fn lex(src: &str) -> Result<Vec<Tok>, LexError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens: Vec<Tok> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            let start = i;
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            push(&mut tokens, TokKind::Ws, &chars[start..i]);
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'/') {
            let start = i;
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            push(&mut tokens, TokKind::LineComment, &chars[start..i]);
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = i;
            i += 2;
            loop {
                if i + 1 >= chars.len() {
                    return Err(LexError::UnterminatedComment);
                }
                if chars[i] == '*' && chars[i + 1] == '/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            push(&mut tokens, TokKind::BlockComment, &chars[start..i]);
            continue;
        }

        if c == '"' || c == '\'' {
            let start = i;
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(LexError::UnterminatedString);
                }
                if chars[i] == '\\' {
                    i += 2;
                    continue;
                }
                if chars[i] == c {
                    i += 1;
                    break;
                }
                if chars[i] == '\n' {
                    return Err(LexError::UnterminatedString);
                }
                i += 1;
            }
            push(&mut tokens, TokKind::Str, &chars[start..i]);
            continue;
        }

        if c == '`' {
            let start = i;
            i = consume_template(&chars, i)?;
            push(&mut tokens, TokKind::Template, &chars[start..i]);
            continue;
        }

        if c == '/' && regex_allowed(&tokens) {
            let start = i;
            i += 1;
            let mut in_class = false;
            loop {
                if i >= chars.len() || chars[i] == '\n' {
                    return Err(LexError::UnterminatedRegex);
                }
                match chars[i] {
                    '\\' => i += 1,
                    '[' => in_class = true,
                    ']' => in_class = false,
                    '/' if !in_class => break,
                    _ => {}
                }
                i += 1;
            }
            i += 1; // closing slash
            while i < chars.len() && chars[i].is_ascii_alphabetic() {
                i += 1;
            }
            push(&mut tokens, TokKind::Regex, &chars[start..i]);
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                    i += 1;
                } else if (d == '+' || d == '-')
                    && matches!(chars.get(i - 1), Some('e') | Some('E'))
                {
                    i += 1;
                } else {
                    break;
                }
            }
            push(&mut tokens, TokKind::Num, &chars[start..i]);
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            push(&mut tokens, TokKind::Ident, &chars[start..i]);
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 4)].iter().collect();
        let punct = PUNCTS
            .iter()
            .find(|p| rest.starts_with(**p))
            .map_or(1, |p| p.chars().count());
        push(&mut tokens, TokKind::Punct, &chars[i..i + punct]);
        i += punct;
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Tok>, kind: TokKind, text: &[char]) {
    tokens.push(Tok {
        kind,
        text: text.iter().collect(),
    });
}

fn consume_template(chars: &[char], start: usize) -> Result<usize, LexError> {
    let mut i = start + 1;
    loop {
        if i >= chars.len() {
            return Err(LexError::UnterminatedTemplate);
        }
        match chars[i] {
            '\\' => i += 2,
            '`' => return Ok(i + 1),
            '$' if chars.get(i + 1) == Some(&'{') => {
                i += 2;
                let mut depth = 1;
                while depth > 0 {
                    if i >= chars.len() {
                        return Err(LexError::UnterminatedTemplate);
                    }
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        '`' => {
                            i = consume_template(chars, i)?;
                            continue;
                        }
                        '\'' | '"' => {
                            let quote = chars[i];
                            i += 1;
                            while i < chars.len() && chars[i] != quote {
                                if chars[i] == '\\' {
                                    i += 1;
                                }
                                i += 1;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
}

/// Whether a `/` in the current position begins a regex literal rather than
/// a division operator, judged from the previous significant token.
fn regex_allowed(tokens: &[Tok]) -> bool {
    let Some(prev) = tokens.iter().rev().find(|t| !t.is_trivia()) else {
        return true;
    };
    match prev.kind {
        TokKind::Ident => REGEX_PRECEDING_KEYWORDS.contains(&prev.text.as_str()),
        TokKind::Num | TokKind::Str | TokKind::Template | TokKind::Regex => false,
        TokKind::Punct => !matches!(prev.text.as_str(), ")" | "]" | "++" | "--"),
        _ => true,
    }
}

/// Render tokens back to source text.
pub fn render(tokens: &[Tok]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}
