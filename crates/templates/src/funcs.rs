//! Helper functions available inside templates.
//!
//! Names and argument order follow Go's builtins and the sprig library, so the
//! piped value always arrives as the last argument: `{{ .Name | trimSuffix "-x" }}`.

use std::cmp::Ordering;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::TemplateError;
use crate::exec::{is_true, to_display, type_name};

type Func = fn(&[Value]) -> Result<Value, String>;

const FUNCS: &[(&str, Func)] = &[
    // builtins
    ("and", and),
    ("or", or),
    ("not", not),
    ("eq", eq),
    ("ne", ne),
    ("lt", lt),
    ("le", le),
    ("gt", gt),
    ("ge", ge),
    ("len", len),
    ("index", index),
    ("print", print),
    ("printf", printf),
    ("println", println),
    ("html", html),
    ("js", js),
    ("urlquery", urlquery),
    // strings
    ("upper", upper),
    ("lower", lower),
    ("title", title),
    ("trim", trim),
    ("trimAll", trim_all),
    ("trimPrefix", trim_prefix),
    ("trimSuffix", trim_suffix),
    ("replace", replace),
    ("contains", contains),
    ("hasPrefix", has_prefix),
    ("hasSuffix", has_suffix),
    ("repeat", repeat),
    ("substr", substr),
    ("trunc", trunc),
    ("abbrev", abbrev),
    ("indent", indent),
    ("nindent", nindent),
    ("quote", quote),
    ("squote", squote),
    ("cat", cat),
    ("split", split),
    ("splitList", split_list),
    ("join", join),
    ("nospace", nospace),
    // defaults
    ("default", default),
    ("empty", empty),
    ("coalesce", coalesce),
    ("ternary", ternary),
    // collections
    ("list", list),
    ("dict", dict),
    ("first", first),
    ("last", last),
    ("rest", rest),
    ("initial", initial),
    ("reverse", reverse),
    ("uniq", uniq),
    ("has", has),
    ("keys", keys),
    ("values", values),
    ("get", get),
    ("set", set),
    ("pluck", pluck),
    // math
    ("add", add),
    ("add1", add1),
    ("sub", sub),
    ("mul", mul),
    ("div", div),
    ("mod", modulo),
    ("max", max),
    ("min", min),
    // encoding and conversion
    ("toJson", to_json),
    ("toPrettyJson", to_pretty_json),
    ("fromJson", from_json),
    ("b64enc", b64enc),
    ("b64dec", b64dec),
    ("toString", to_string),
    ("atoi", atoi),
    ("int", int),
    ("float64", float64),
    // dates
    ("now", now),
    ("date", date),
    ("dateFormat", date),
    ("toDate", to_date),
    ("unixEpoch", unix_epoch),
    ("ago", ago),
    ("duration", duration),
];

pub(crate) fn exists(name: &str) -> bool {
    lookup(name).is_some()
}

/// Names of every available helper, in registration order.
pub fn names() -> impl Iterator<Item = &'static str> {
    FUNCS.iter().map(|(name, _)| *name)
}

/// Invoke a helper. A panicking helper becomes an execution error instead of
/// unwinding into the caller.
pub(crate) fn call(name: &str, args: &[Value]) -> Result<Value, TemplateError> {
    let func = lookup(name).ok_or_else(|| TemplateError::Func {
        name: name.to_string(),
        message: "function not defined".to_string(),
    })?;
    let result = std::panic::catch_unwind(|| func(args))
        .unwrap_or_else(|_| Err("panicked while evaluating".to_string()));
    result.map_err(|message| TemplateError::Func {
        name: name.to_string(),
        message,
    })
}

fn lookup(name: &str) -> Option<Func> {
    FUNCS.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

// ---------------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------------

fn want(args: &[Value], n: usize) -> Result<(), String> {
    if args.len() != n {
        return Err(format!("wrong number of args: want {n} got {}", args.len()));
    }
    Ok(())
}

fn want_at_least(args: &[Value], n: usize) -> Result<(), String> {
    if args.len() < n {
        return Err(format!(
            "wrong number of args: want at least {n} got {}",
            args.len()
        ));
    }
    Ok(())
}

fn int_arg(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .map_err(|_| format!("{s:?} is not an integer")),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        other => Err(format!("can't convert {} to int", type_name(other))),
    }
}

fn float_arg(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{n} is not a number")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("{s:?} is not a number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        other => Err(format!("can't convert {} to float64", type_name(other))),
    }
}

fn list_arg(value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(format!("expected a list, got {}", type_name(other))),
    }
}

fn map_arg(value: &Value) -> Result<&Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a map, got {}", type_name(other))),
    }
}

fn string_fn(args: &[Value], f: impl Fn(&str) -> String) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::String(f(&to_display(&args[0]))))
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn all_ints(args: &[Value]) -> bool {
    args.iter().all(|v| match v {
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::String(s) => s.trim().parse::<i64>().is_ok(),
        Value::Bool(_) | Value::Null => true,
        _ => false,
    })
}

// ---------------------------------------------------------------------------
// builtins
// ---------------------------------------------------------------------------

fn and(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    Ok(args
        .iter()
        .find(|v| !is_true(v))
        .unwrap_or(&args[args.len() - 1])
        .clone())
}

fn or(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    Ok(args
        .iter()
        .find(|v| is_true(v))
        .unwrap_or(&args[args.len() - 1])
        .clone())
}

fn not(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::Bool(!is_true(&args[0])))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| "invalid number comparison".to_string()),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(format!(
            "incompatible types for comparison: {} and {}",
            type_name(a),
            type_name(b)
        )),
    }
}

fn eq(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 2)?;
    Ok(Value::Bool(
        args[1..].iter().any(|other| values_equal(&args[0], other)),
    ))
}

fn ne(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(!values_equal(&args[0], &args[1])))
}

fn lt(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])? == Ordering::Less))
}

fn le(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])? != Ordering::Greater))
}

fn gt(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])? == Ordering::Greater))
}

fn ge(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])? != Ordering::Less))
}

fn len(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::Null => 0,
        other => return Err(format!("len of type {}", type_name(other))),
    };
    Ok(Value::from(n))
}

fn index(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    let mut current = args[0].clone();
    for key in &args[1..] {
        current = match current {
            Value::Array(items) => {
                let i = int_arg(key)?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| format!("index out of range: {i}"))?
            }
            Value::Object(map) => map.get(&to_display(key)).cloned().unwrap_or(Value::Null),
            Value::Null => Value::Null,
            other => return Err(format!("can't index item of type {}", type_name(&other))),
        };
    }
    Ok(current)
}

fn print(args: &[Value]) -> Result<Value, String> {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        // fmt.Sprint only separates operands when neither is a string.
        if i > 0 && !args[i - 1].is_string() && !arg.is_string() {
            out.push(' ');
        }
        out.push_str(&to_display(arg));
    }
    Ok(Value::String(out))
}

fn println(args: &[Value]) -> Result<Value, String> {
    let mut out = args.iter().map(to_display).collect::<Vec<_>>().join(" ");
    out.push('\n');
    Ok(Value::String(out))
}

fn printf(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    Ok(Value::String(sprintf(&to_display(&args[0]), &args[1..])))
}

/// A subset of Go's `fmt.Sprintf`: flags `-`, `0`, `+`, width, precision and
/// the verbs `v s d q f g e t x X %`.
fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next_arg = 0;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut left = false;
        let mut zero = false;
        let mut plus = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(d);
                chars.next();
            }
            precision = Some(digits.parse::<usize>().unwrap_or(0).min(MAX_GENERATED));
        }

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }

        let Some(arg) = args.get(next_arg) else {
            out.push_str(&format!("%!{verb}(MISSING)"));
            continue;
        };
        next_arg += 1;

        let is_numeric = matches!(verb, 'd' | 'f' | 'g' | 'e' | 'x' | 'X');
        let mut rendered = match verb {
            'd' => match int_arg(arg) {
                Ok(n) if plus && n >= 0 => format!("+{n}"),
                Ok(n) => n.to_string(),
                Err(_) => format!("%!d({})", to_display(arg)),
            },
            'f' | 'F' => match float_arg(arg) {
                Ok(f) => format!("{f:.*}", precision.unwrap_or(6)),
                Err(_) => format!("%!f({})", to_display(arg)),
            },
            'e' => match float_arg(arg) {
                Ok(f) => format!("{f:.*e}", precision.unwrap_or(6)),
                Err(_) => format!("%!e({})", to_display(arg)),
            },
            'g' => match float_arg(arg) {
                Ok(f) => f.to_string(),
                Err(_) => format!("%!g({})", to_display(arg)),
            },
            'x' | 'X' => {
                let hex = match arg {
                    Value::String(s) => s.bytes().map(|b| format!("{b:02x}")).collect(),
                    other => match int_arg(other) {
                        Ok(n) => format!("{n:x}"),
                        Err(_) => format!("%!x({})", to_display(other)),
                    },
                };
                if verb == 'X' {
                    hex.to_uppercase()
                } else {
                    hex
                }
            }
            'q' => go_quote(&to_display(arg)),
            't' => is_true(arg).to_string(),
            's' | 'v' => {
                let s = to_display(arg);
                match precision {
                    Some(p) if verb == 's' => s.chars().take(p).collect(),
                    _ => s,
                }
            }
            other => format!("%!{other}({})", to_display(arg)),
        };

        if plus && verb == 'f' && !rendered.starts_with('-') {
            rendered.insert(0, '+');
        }

        let width: usize = width.parse::<usize>().unwrap_or(0).min(MAX_GENERATED);
        let len = rendered.chars().count();
        if len < width {
            let pad = width - len;
            if left {
                rendered.push_str(&" ".repeat(pad));
            } else if zero && is_numeric {
                let (sign, digits) = match rendered.strip_prefix(['-', '+']) {
                    Some(rest) => (&rendered[..1], rest),
                    None => ("", rendered.as_str()),
                };
                rendered = format!("{sign}{}{digits}", "0".repeat(pad));
            } else {
                rendered.insert_str(0, &" ".repeat(pad));
            }
        }
        out.push_str(&rendered);
    }

    if next_arg < args.len() {
        let extra: Vec<String> = args[next_arg..].iter().map(to_display).collect();
        out.push_str(&format!("%!(EXTRA {})", extra.join(", ")));
    }
    out
}

fn go_quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

fn html(args: &[Value]) -> Result<Value, String> {
    let s = args.iter().map(to_display).collect::<String>();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Ok(Value::String(out))
}

fn js(args: &[Value]) -> Result<Value, String> {
    let s = args.iter().map(to_display).collect::<String>();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '&' => out.push_str("\\u0026"),
            '=' => out.push_str("\\u003D"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    Ok(Value::String(out))
}

fn urlquery(args: &[Value]) -> Result<Value, String> {
    let s = args.iter().map(to_display).collect::<String>();
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    Ok(Value::String(out))
}

// ---------------------------------------------------------------------------
// strings
// ---------------------------------------------------------------------------

fn upper(args: &[Value]) -> Result<Value, String> {
    string_fn(args, str::to_uppercase)
}

fn lower(args: &[Value]) -> Result<Value, String> {
    string_fn(args, str::to_lowercase)
}

fn title(args: &[Value]) -> Result<Value, String> {
    string_fn(args, |s| {
        let mut out = String::with_capacity(s.len());
        let mut at_word_start = true;
        for c in s.chars() {
            if at_word_start && c.is_alphabetic() {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            at_word_start = c.is_whitespace();
        }
        out
    })
}

fn trim(args: &[Value]) -> Result<Value, String> {
    string_fn(args, |s| s.trim().to_string())
}

fn nospace(args: &[Value]) -> Result<Value, String> {
    string_fn(args, |s| s.chars().filter(|c| !c.is_whitespace()).collect())
}

fn trim_all(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let cutset: Vec<char> = to_display(&args[0]).chars().collect();
    let s = to_display(&args[1]);
    Ok(Value::String(s.trim_matches(cutset.as_slice()).to_string()))
}

fn trim_prefix(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let prefix = to_display(&args[0]);
    let s = to_display(&args[1]);
    Ok(Value::String(
        s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string(),
    ))
}

fn trim_suffix(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let suffix = to_display(&args[0]);
    let s = to_display(&args[1]);
    Ok(Value::String(
        s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string(),
    ))
}

fn replace(args: &[Value]) -> Result<Value, String> {
    want(args, 3)?;
    let s = to_display(&args[2]);
    Ok(Value::String(
        s.replace(&to_display(&args[0]), &to_display(&args[1])),
    ))
}

fn contains(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(
        to_display(&args[1]).contains(&to_display(&args[0])),
    ))
}

fn has_prefix(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(
        to_display(&args[1]).starts_with(&to_display(&args[0])),
    ))
}

fn has_suffix(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(
        to_display(&args[1]).ends_with(&to_display(&args[0])),
    ))
}

/// Upper bound on the bytes `repeat` and `indent` may produce.
const MAX_GENERATED: usize = 16 << 20;

fn bounded_len(unit: usize, count: usize) -> Result<usize, String> {
    unit.checked_mul(count)
        .filter(|len| *len <= MAX_GENERATED)
        .ok_or_else(|| format!("result exceeds {MAX_GENERATED} bytes"))
}

fn repeat(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let count = usize::try_from(int_arg(&args[0])?).map_err(|_| "negative repeat count")?;
    let s = to_display(&args[1]);
    bounded_len(s.len(), count)?;
    Ok(Value::String(s.repeat(count)))
}

fn substr(args: &[Value]) -> Result<Value, String> {
    want(args, 3)?;
    let chars: Vec<char> = to_display(&args[2]).chars().collect();
    let start = int_arg(&args[0])?.clamp(0, chars.len() as i64) as usize;
    let end = match int_arg(&args[1])? {
        e if e < 0 => chars.len(),
        e => (e as usize).min(chars.len()),
    };
    Ok(Value::String(chars[start.min(end)..end].iter().collect()))
}

fn trunc(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let n = int_arg(&args[0])?;
    let chars: Vec<char> = to_display(&args[1]).chars().collect();
    let len = chars.len() as i64;
    let kept: String = if n >= 0 {
        chars[..n.min(len) as usize].iter().collect()
    } else {
        chars[(len + n).max(0) as usize..].iter().collect()
    };
    Ok(Value::String(kept))
}

fn abbrev(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let width = int_arg(&args[0])?;
    let s = to_display(&args[1]);
    let len = s.chars().count() as i64;
    if width < 4 || len <= width {
        return Ok(Value::String(s));
    }
    let mut out: String = s.chars().take((width - 3) as usize).collect();
    out.push_str("...");
    Ok(Value::String(out))
}

fn indent_str(spaces: usize, s: &str) -> Result<String, String> {
    let lines = s.split('\n').count();
    bounded_len(spaces, lines)?
        .checked_add(s.len())
        .filter(|len| *len <= MAX_GENERATED)
        .ok_or_else(|| format!("result exceeds {MAX_GENERATED} bytes"))?;
    let pad = " ".repeat(spaces);
    Ok(s.split('\n')
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn indent(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let spaces = usize::try_from(int_arg(&args[0])?).map_err(|_| "negative indent")?;
    Ok(Value::String(indent_str(spaces, &to_display(&args[1]))?))
}

fn nindent(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let spaces = usize::try_from(int_arg(&args[0])?).map_err(|_| "negative indent")?;
    Ok(Value::String(format!(
        "\n{}",
        indent_str(spaces, &to_display(&args[1]))?
    )))
}

fn quote(args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(
        args.iter()
            .filter(|v| !v.is_null())
            .map(|v| go_quote(&to_display(v)))
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

fn squote(args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(
        args.iter()
            .filter(|v| !v.is_null())
            .map(|v| format!("'{}'", to_display(v)))
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

fn cat(args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(
        args.iter()
            .filter(|v| !v.is_null())
            .map(to_display)
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

fn split(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let sep = to_display(&args[0]);
    let s = to_display(&args[1]);
    let map: Map<String, Value> = s
        .split(sep.as_str())
        .enumerate()
        .map(|(i, part)| (format!("_{i}"), Value::String(part.to_string())))
        .collect();
    Ok(Value::Object(map))
}

fn split_list(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let sep = to_display(&args[0]);
    let s = to_display(&args[1]);
    Ok(Value::Array(
        s.split(sep.as_str())
            .map(|part| Value::String(part.to_string()))
            .collect(),
    ))
}

fn join(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let sep = to_display(&args[0]);
    let joined = match &args[1] {
        Value::Array(items) => items
            .iter()
            .map(to_display)
            .collect::<Vec<_>>()
            .join(&sep),
        other => to_display(other),
    };
    Ok(Value::String(joined))
}

// ---------------------------------------------------------------------------
// defaults
// ---------------------------------------------------------------------------

fn default(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    match args.get(1) {
        Some(given) if is_true(given) => Ok(given.clone()),
        _ => Ok(args[0].clone()),
    }
}

fn empty(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::Bool(!is_true(&args[0])))
}

fn coalesce(args: &[Value]) -> Result<Value, String> {
    Ok(args.iter().find(|v| is_true(v)).cloned().unwrap_or(Value::Null))
}

fn ternary(args: &[Value]) -> Result<Value, String> {
    want(args, 3)?;
    Ok(if is_true(&args[2]) {
        args[0].clone()
    } else {
        args[1].clone()
    })
}

// ---------------------------------------------------------------------------
// collections
// ---------------------------------------------------------------------------

fn list(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Array(args.to_vec()))
}

fn dict(args: &[Value]) -> Result<Value, String> {
    let mut map = Map::new();
    for pair in args.chunks(2) {
        let value = pair.get(1).cloned().unwrap_or(Value::String(String::new()));
        map.insert(to_display(&pair[0]), value);
    }
    Ok(Value::Object(map))
}

fn first(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(list_arg(&args[0])?.into_iter().next().unwrap_or(Value::Null))
}

fn last(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(list_arg(&args[0])?.pop().unwrap_or(Value::Null))
}

fn rest(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::Array(
        list_arg(&args[0])?.into_iter().skip(1).collect(),
    ))
}

fn initial(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let mut items = list_arg(&args[0])?;
    items.pop();
    Ok(Value::Array(items))
}

fn reverse(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let mut items = list_arg(&args[0])?;
    items.reverse();
    Ok(Value::Array(items))
}

fn uniq(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let mut out: Vec<Value> = Vec::new();
    for item in list_arg(&args[0])? {
        if !out.iter().any(|seen| values_equal(seen, &item)) {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn has(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    Ok(Value::Bool(
        list_arg(&args[1])?
            .iter()
            .any(|item| values_equal(item, &args[0])),
    ))
}

fn keys(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    let mut out: Vec<String> = Vec::new();
    for arg in args {
        out.extend(map_arg(arg)?.keys().cloned());
    }
    out.sort();
    Ok(Value::Array(out.into_iter().map(Value::String).collect()))
}

fn values(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let map = map_arg(&args[0])?;
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Ok(Value::Array(
        entries.into_iter().map(|(_, v)| v.clone()).collect(),
    ))
}

fn get(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let map = map_arg(&args[0])?;
    Ok(map
        .get(&to_display(&args[1]))
        .cloned()
        .unwrap_or(Value::String(String::new())))
}

fn set(args: &[Value]) -> Result<Value, String> {
    want(args, 3)?;
    let mut map = map_arg(&args[0])?.clone();
    map.insert(to_display(&args[1]), args[2].clone());
    Ok(Value::Object(map))
}

fn pluck(args: &[Value]) -> Result<Value, String> {
    want_at_least(args, 1)?;
    let key = to_display(&args[0]);
    let mut out = Vec::new();
    for arg in &args[1..] {
        if let Some(v) = map_arg(arg)?.get(&key) {
            out.push(v.clone());
        }
    }
    Ok(Value::Array(out))
}

// ---------------------------------------------------------------------------
// math
// ---------------------------------------------------------------------------

fn fold(
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    want_at_least(args, 1)?;
    if all_ints(args) {
        let mut acc = int_arg(&args[0])?;
        for arg in &args[1..] {
            acc = int_op(acc, int_arg(arg)?).ok_or("integer overflow")?;
        }
        return Ok(Value::from(acc));
    }
    let mut acc = float_arg(&args[0])?;
    for arg in &args[1..] {
        acc = float_op(acc, float_arg(arg)?);
    }
    Ok(number(acc))
}

fn add(args: &[Value]) -> Result<Value, String> {
    fold(args, i64::checked_add, |a, b| a + b)
}

fn add1(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    fold(&[args[0].clone(), Value::from(1)], i64::checked_add, |a, b| a + b)
}

fn sub(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    fold(args, i64::checked_sub, |a, b| a - b)
}

fn mul(args: &[Value]) -> Result<Value, String> {
    fold(args, i64::checked_mul, |a, b| a * b)
}

fn div(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    if float_arg(&args[1])? == 0.0 {
        return Err("division by zero".to_string());
    }
    fold(args, i64::checked_div, |a, b| a / b)
}

fn modulo(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let divisor = int_arg(&args[1])?;
    if divisor == 0 {
        return Err("division by zero".to_string());
    }
    int_arg(&args[0])?
        .checked_rem(divisor)
        .map(Value::from)
        .ok_or_else(|| "integer overflow".to_string())
}

fn max(args: &[Value]) -> Result<Value, String> {
    fold(args, |a, b| Some(a.max(b)), f64::max)
}

fn min(args: &[Value]) -> Result<Value, String> {
    fold(args, |a, b| Some(a.min(b)), f64::min)
}

// ---------------------------------------------------------------------------
// encoding and conversion
// ---------------------------------------------------------------------------

fn to_json(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    serde_json::to_string(&args[0])
        .map(Value::String)
        .map_err(|e| e.to_string())
}

fn to_pretty_json(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    serde_json::to_string_pretty(&args[0])
        .map(Value::String)
        .map_err(|e| e.to_string())
}

fn from_json(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    serde_json::from_str(&to_display(&args[0])).map_err(|e| e.to_string())
}

fn b64enc(args: &[Value]) -> Result<Value, String> {
    string_fn(args, |s| BASE64.encode(s.as_bytes()))
}

fn b64dec(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let bytes = BASE64
        .decode(to_display(&args[0]).trim())
        .map_err(|e| e.to_string())?;
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|e| e.to_string())
}

fn to_string(args: &[Value]) -> Result<Value, String> {
    string_fn(args, str::to_string)
}

fn atoi(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::from(
        to_display(&args[0]).trim().parse::<i64>().unwrap_or(0),
    ))
}

fn int(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    int_arg(&args[0]).map(Value::from)
}

fn float64(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    float_arg(&args[0]).map(Value::from)
}

// ---------------------------------------------------------------------------
// dates
// ---------------------------------------------------------------------------

fn time_arg(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("parse time {s:?}: {e}")),
        Value::Number(_) => {
            let secs = int_arg(value)?;
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("invalid unix time {secs}"))
        }
        other => Err(format!("expected a time, got {}", type_name(other))),
    }
}

fn format_time(t: &DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

fn now(args: &[Value]) -> Result<Value, String> {
    want(args, 0)?;
    Ok(format_time(&Utc::now()))
}

fn date(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let layout = to_display(&args[0]);
    let t = time_arg(&args[1])?;
    Ok(Value::String(
        t.format(&go_layout_to_strftime(&layout)).to_string(),
    ))
}

fn to_date(args: &[Value]) -> Result<Value, String> {
    want(args, 2)?;
    let layout = go_layout_to_strftime(&to_display(&args[0]));
    let s = to_display(&args[1]);
    if let Ok(t) = DateTime::parse_from_str(&s, &layout) {
        return Ok(format_time(&t.with_timezone(&Utc)));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(&s, &layout) {
        return Ok(format_time(&t.and_utc()));
    }
    chrono::NaiveDate::parse_from_str(&s, &layout)
        .map(|d| format_time(&d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()))
        .map_err(|e| format!("parse {s:?}: {e}"))
}

fn unix_epoch(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::from(time_arg(&args[0])?.timestamp()))
}

fn ago(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    let elapsed = Utc::now() - time_arg(&args[0])?;
    Ok(Value::String(go_duration(elapsed.num_seconds())))
}

fn duration(args: &[Value]) -> Result<Value, String> {
    want(args, 1)?;
    Ok(Value::String(go_duration(int_arg(&args[0])?)))
}

/// Seconds rendered like Go's `time.Duration` string, e.g. `1h2m3s`.
fn go_duration(seconds: i64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }
    let sign = if seconds < 0 { "-" } else { "" };
    let total = seconds.unsigned_abs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{sign}{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{sign}{m}m{s}s")
    } else {
        format!("{sign}{s}s")
    }
}

/// Translate a Go reference-time layout (`2006-01-02T15:04:05Z07:00`) into a
/// chrono format string. Times are always UTC, so zone tokens render as UTC.
pub(crate) fn go_layout_to_strftime(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("January", "%B"),
        ("Jan", "%b"),
        ("Monday", "%A"),
        ("Mon", "%a"),
        ("MST", "%Z"),
        ("2006", "%Y"),
        ("Z07:00", "Z"),
        ("Z0700", "Z"),
        ("-07:00", "%:z"),
        ("-0700", "%z"),
        ("-07", "+00"),
        (".000000000", "%.9f"),
        (".000000", "%.6f"),
        (".000", "%.3f"),
        (".999999999", "%.f"),
        (".999999", "%.f"),
        (".999", "%.f"),
        ("_2", "%e"),
        ("06", "%y"),
        ("01", "%m"),
        ("02", "%d"),
        ("15", "%H"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%-m"),
        ("2", "%-d"),
        ("3", "%-I"),
        ("4", "%-M"),
        ("5", "%-S"),
    ];

    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (go, chrono_fmt) in TOKENS {
            if let Some(tail) = rest.strip_prefix(go) {
                out.push_str(chrono_fmt);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}
