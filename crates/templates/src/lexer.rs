//! Splits template source into text and action chunks, and tokenizes the
//! inside of actions.

use crate::error::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Chunk {
    Text(String),
    Action { body: String, line: usize },
}

/// Break `src` into literal text and `{{ ... }}` actions, applying `{{-` / `-}}`
/// whitespace trimming and dropping `{{/* */}}` comments.
pub(crate) fn split(src: &str) -> Result<Vec<Chunk>, TemplateError> {
    let mut chunks = Vec::new();
    let mut rest = src;
    let mut line = 1;
    let mut trim_next = false;

    loop {
        let Some(start) = rest.find(OPEN) else {
            push_text(&mut chunks, rest, trim_next, false);
            break;
        };

        let after = &rest[start + OPEN.len()..];
        let trim_left = has_left_trim(after);
        push_text(&mut chunks, &rest[..start], trim_next, trim_left);
        line += rest[..start].matches('\n').count();

        let inner = if trim_left { &after[2..] } else { after };
        let (body, consumed, trim_right) = find_close(inner, line)?;

        let trimmed = body.trim();
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") || trimmed.len() < 4 {
                return Err(TemplateError::parse(line, "unclosed comment"));
            }
        } else {
            chunks.push(Chunk::Action {
                body: body.to_string(),
                line,
            });
        }

        line += body.matches('\n').count();
        rest = &inner[consumed..];
        trim_next = trim_right;
    }

    Ok(chunks)
}

fn has_left_trim(after_open: &str) -> bool {
    let mut chars = after_open.chars();
    chars.next() == Some('-') && chars.next().is_some_and(|c| c.is_ascii_whitespace())
}

fn push_text(chunks: &mut Vec<Chunk>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        chunks.push(Chunk::Text(text.to_string()));
    }
}

/// Locate the closing delimiter, skipping over quoted literals. Returns the
/// action body, the number of bytes consumed (including the delimiter) and
/// whether a right trim marker was present.
fn find_close(s: &str, line: usize) -> Result<(&str, usize, bool), TemplateError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q != b'`' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' || b == b'\'' {
                    quote = Some(b);
                } else if s[i..].starts_with(CLOSE) {
                    let body = &s[..i];
                    if let Some(stripped) = body.strip_suffix('-')
                        && stripped.ends_with(|c: char| c.is_ascii_whitespace())
                    {
                        return Ok((stripped, i + CLOSE.len(), true));
                    }
                    return Ok((body, i + CLOSE.len(), false));
                }
            }
        }
        i += 1;
    }

    Err(TemplateError::parse(line, "unclosed action"))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Dot,
    Field(String),
    Var(String),
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Nil,
    Pipe,
    LParen,
    RParen,
    Declare,
    Assign,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    /// Whether whitespace preceded this token. `.A.B` is one field chain,
    /// `.A .B` is two arguments.
    pub spaced: bool,
}

/// Tokenize the body of one action.
pub(crate) fn tokenize(body: &str, line: usize) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut spaced = true;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            spaced = true;
            i += 1;
            continue;
        }

        let tok = match c {
            '|' => {
                i += 1;
                Tok::Pipe
            }
            '(' => {
                i += 1;
                Tok::LParen
            }
            ')' => {
                i += 1;
                Tok::RParen
            }
            ',' => {
                i += 1;
                Tok::Comma
            }
            '=' => {
                i += 1;
                Tok::Assign
            }
            ':' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(TemplateError::parse(line, "expected := after ':'"));
                }
                i += 2;
                Tok::Declare
            }
            '"' => {
                let (value, next) = lex_quoted(&chars, i + 1, line)?;
                i = next;
                Tok::Str(value)
            }
            '`' => {
                let start = i + 1;
                let end = (start..chars.len())
                    .find(|&j| chars[j] == '`')
                    .ok_or_else(|| TemplateError::parse(line, "unterminated raw string"))?;
                i = end + 1;
                Tok::Str(chars[start..end].iter().collect())
            }
            '\'' => {
                let (value, next) = lex_char(&chars, i + 1, line)?;
                i = next;
                Tok::Int(value as i64)
            }
            '.' => {
                if chars.get(i + 1).is_some_and(|&n| is_ident_start(n)) {
                    let (name, next) = lex_ident(&chars, i + 1);
                    i = next;
                    Tok::Field(name)
                } else if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    let (tok, next) = lex_number(&chars, i, line)?;
                    i = next;
                    tok
                } else {
                    i += 1;
                    Tok::Dot
                }
            }
            '$' => {
                let (name, next) = lex_ident(&chars, i + 1);
                i = next;
                Tok::Var(name)
            }
            '-' | '+' if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '.') => {
                let (tok, next) = lex_number(&chars, i, line)?;
                i = next;
                tok
            }
            c if c.is_ascii_digit() => {
                let (tok, next) = lex_number(&chars, i, line)?;
                i = next;
                tok
            }
            c if is_ident_start(c) => {
                let (name, next) = lex_ident(&chars, i);
                i = next;
                match name.as_str() {
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    "nil" => Tok::Nil,
                    _ => Tok::Ident(name),
                }
            }
            other => {
                return Err(TemplateError::parse(
                    line,
                    format!("unexpected {other:?} in action"),
                ));
            }
        };

        tokens.push(Token { tok, spaced });
        spaced = false;
    }

    Ok(tokens)
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn lex_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn lex_quoted(chars: &[char], start: usize, line: usize) -> Result<(String, usize), TemplateError> {
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' => {
                let (c, next) = lex_escape(chars, i + 1, line)?;
                out.push(c);
                i = next;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(TemplateError::parse(line, "unterminated quoted string"))
}

fn lex_char(chars: &[char], start: usize, line: usize) -> Result<(char, usize), TemplateError> {
    let (c, next) = match chars.get(start) {
        Some('\\') => lex_escape(chars, start + 1, line)?,
        Some(&c) => (c, start + 1),
        None => return Err(TemplateError::parse(line, "unterminated character constant")),
    };
    if chars.get(next) != Some(&'\'') {
        return Err(TemplateError::parse(line, "unterminated character constant"));
    }
    Ok((c, next + 1))
}

fn lex_escape(chars: &[char], i: usize, line: usize) -> Result<(char, usize), TemplateError> {
    let c = match chars.get(i) {
        Some('n') => '\n',
        Some('t') => '\t',
        Some('r') => '\r',
        Some('0') => '\0',
        Some('\\') => '\\',
        Some('"') => '"',
        Some('\'') => '\'',
        Some('u') => {
            let hex: String = chars.iter().skip(i + 1).take(4).collect();
            let code = u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| TemplateError::parse(line, format!("bad escape \\u{hex}")))?;
            return Ok((code, i + 5));
        }
        Some(other) => {
            return Err(TemplateError::parse(line, format!("unknown escape \\{other}")));
        }
        None => return Err(TemplateError::parse(line, "unterminated escape")),
    };
    Ok((c, i + 1))
}

fn lex_number(chars: &[char], start: usize, line: usize) -> Result<(Tok, usize), TemplateError> {
    let mut end = start;
    if matches!(chars.get(end), Some('-' | '+')) {
        end += 1;
    }
    while end < chars.len() {
        let c = chars[end];
        let exponent_sign = matches!(c, '-' | '+')
            && matches!(chars.get(end.wrapping_sub(1)), Some('e' | 'E'))
            && !is_hex(&chars[start..end]);
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || exponent_sign {
            end += 1;
        } else {
            break;
        }
    }

    let text: String = chars[start..end].iter().filter(|&&c| c != '_').collect();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };

    let radix = [("0x", 16), ("0X", 16), ("0o", 8), ("0O", 8), ("0b", 2), ("0B", 2)]
        .iter()
        .find_map(|(prefix, radix)| digits.strip_prefix(prefix).map(|d| (d, *radix)));
    if let Some((body, radix)) = radix {
        let value = i64::from_str_radix(body, radix)
            .map_err(|_| TemplateError::parse(line, format!("bad number syntax: {text:?}")))?;
        return Ok((Tok::Int(if negative { -value } else { value }), end));
    }

    if let Ok(value) = text.parse::<i64>() {
        return Ok((Tok::Int(value), end));
    }
    text.parse::<f64>()
        .map(|value| (Tok::Float(value), end))
        .map_err(|_| TemplateError::parse(line, format!("bad number syntax: {text:?}")))
}

fn is_hex(prefix: &[char]) -> bool {
    let s: String = prefix.iter().collect();
    let s = s.trim_start_matches(['-', '+']);
    s.starts_with("0x") || s.starts_with("0X")
}
