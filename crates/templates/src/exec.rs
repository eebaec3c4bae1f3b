//! Tree-walking evaluator over `serde_json::Value` data.

use serde_json::Value;

use crate::error::TemplateError;
use crate::funcs;
use crate::parse::{Arg, Command, Node, Pipeline};

const MAX_DEPTH: usize = 100;

enum Flow {
    Normal,
    Break,
    Continue,
}

pub(crate) fn execute(nodes: &[Node], data: &Value) -> Result<String, TemplateError> {
    let mut state = State {
        vars: vec![(String::new(), data.clone())],
        out: String::new(),
        depth: 0,
    };
    state.walk(data, nodes)?;
    Ok(state.out)
}

struct State {
    /// Variable stack; `$` is always the first entry.
    vars: Vec<(String, Value)>,
    out: String,
    depth: usize,
}

impl State {
    fn walk(&mut self, dot: &Value, nodes: &[Node]) -> Result<Flow, TemplateError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(TemplateError::exec("exceeded maximum template depth"));
        }
        let result = self.walk_nodes(dot, nodes);
        self.depth -= 1;
        result
    }

    fn walk_nodes(&mut self, dot: &Value, nodes: &[Node]) -> Result<Flow, TemplateError> {
        for node in nodes {
            let flow = match node {
                Node::Text(text) => {
                    self.out.push_str(text);
                    Flow::Normal
                }
                Node::Action(pipe) => {
                    let value = self.pipeline(dot, pipe)?;
                    if pipe.decl.is_empty() {
                        write_value(&mut self.out, &value);
                    }
                    Flow::Normal
                }
                Node::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    let mark = self.vars.len();
                    let value = self.pipeline(dot, cond)?;
                    let branch = if is_true(&value) { then } else { otherwise };
                    let flow = self.walk(dot, branch);
                    self.vars.truncate(mark);
                    flow?
                }
                Node::With {
                    pipe,
                    body,
                    otherwise,
                } => {
                    let mark = self.vars.len();
                    let value = self.pipeline(dot, pipe)?;
                    let flow = if is_true(&value) {
                        self.walk(&value, body)
                    } else {
                        self.walk(dot, otherwise)
                    };
                    self.vars.truncate(mark);
                    flow?
                }
                Node::Range {
                    pipe,
                    body,
                    otherwise,
                } => {
                    let mark = self.vars.len();
                    let flow = self.range(dot, pipe, body, otherwise);
                    self.vars.truncate(mark);
                    flow?
                }
                Node::Break => Flow::Break,
                Node::Continue => Flow::Continue,
            };

            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn range(
        &mut self,
        dot: &Value,
        pipe: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
    ) -> Result<Flow, TemplateError> {
        let value = self.eval_commands(dot, &pipe.cmds)?;
        let items: Vec<(Value, Value)> = match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::from(i), v))
                .collect(),
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::String(k), v))
                    .collect()
            }
            Value::Number(n) => {
                let count = n
                    .as_i64()
                    .ok_or_else(|| TemplateError::exec(format!("range can't iterate over {n}")))?;
                (0..count.max(0))
                    .map(|i| (Value::from(i), Value::from(i)))
                    .collect()
            }
            Value::Null => Vec::new(),
            other => {
                return Err(TemplateError::exec(format!(
                    "range can't iterate over {}",
                    type_name(&other)
                )));
            }
        };

        if items.is_empty() {
            return self.walk(dot, otherwise);
        }

        let mark = self.vars.len();
        for (key, elem) in items {
            self.vars.truncate(mark);
            match pipe.decl.as_slice() {
                [] => {}
                [value_var] => self.vars.push((value_var.clone(), elem.clone())),
                [key_var, value_var] => {
                    self.vars.push((key_var.clone(), key));
                    self.vars.push((value_var.clone(), elem.clone()));
                }
                _ => return Err(TemplateError::exec("too many range variables")),
            }
            match self.walk(&elem, body)? {
                Flow::Break => break,
                Flow::Continue | Flow::Normal => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn pipeline(&mut self, dot: &Value, pipe: &Pipeline) -> Result<Value, TemplateError> {
        let value = self.eval_commands(dot, &pipe.cmds)?;
        match pipe.decl.as_slice() {
            [] => {}
            [name] if pipe.assign => {
                let slot = self
                    .vars
                    .iter_mut()
                    .rev()
                    .find(|(n, _)| n == name)
                    .ok_or_else(|| TemplateError::exec(format!("undefined variable ${name}")))?;
                slot.1 = value.clone();
            }
            [name] => self.vars.push((name.clone(), value.clone())),
            _ => return Err(TemplateError::exec("too many declarations in pipeline")),
        }
        Ok(value)
    }

    fn eval_commands(&mut self, dot: &Value, cmds: &[Command]) -> Result<Value, TemplateError> {
        let mut piped: Option<Value> = None;
        for cmd in cmds {
            piped = Some(self.command(dot, cmd, piped.take())?);
        }
        Ok(piped.unwrap_or(Value::Null))
    }

    fn command(
        &mut self,
        dot: &Value,
        cmd: &Command,
        piped: Option<Value>,
    ) -> Result<Value, TemplateError> {
        match &cmd.args[0] {
            Arg::Func(name) => {
                let mut args = Vec::with_capacity(cmd.args.len());
                for arg in &cmd.args[1..] {
                    args.push(self.arg(dot, arg)?);
                }
                args.extend(piped);
                funcs::call(name, &args)
            }
            first => {
                if cmd.args.len() > 1 || piped.is_some() {
                    return Err(TemplateError::exec(
                        "can't give argument to non-function",
                    ));
                }
                self.arg(dot, first)
            }
        }
    }

    fn arg(&mut self, dot: &Value, arg: &Arg) -> Result<Value, TemplateError> {
        match arg {
            Arg::Dot => Ok(dot.clone()),
            Arg::Field(chain) => lookup(dot, chain),
            Arg::Var(name, chain) => {
                let (_, value) = self
                    .vars
                    .iter()
                    .rev()
                    .find(|(n, _)| n == name)
                    .ok_or_else(|| TemplateError::exec(format!("undefined variable ${name}")))?;
                lookup(value, chain)
            }
            // A function used as an argument is called without arguments.
            Arg::Func(name) => funcs::call(name, &[]),
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Sub(pipe, chain) => {
                let value = self.eval_commands(dot, &pipe.cmds)?;
                lookup(&value, chain)
            }
        }
    }
}

/// Resolve a field chain. Keys are matched exactly first, then
/// case-insensitively; a missing key yields `nil`.
fn lookup(value: &Value, chain: &[String]) -> Result<Value, TemplateError> {
    let mut current = value;
    for field in chain {
        current = match current {
            Value::Object(map) => match map.get(field) {
                Some(v) => v,
                None => match map.iter().find(|(k, _)| k.eq_ignore_ascii_case(field)) {
                    Some((_, v)) => v,
                    None => return Ok(Value::Null),
                },
            },
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(TemplateError::exec(format!(
                    "can't evaluate field {field} in type {}",
                    type_name(other)
                )));
            }
        };
    }
    Ok(current.clone())
}

/// Go truthiness: false, 0, "", nil and empty collections are false.
pub(crate) fn is_true(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

/// Print a value the way `{{ . }}` does: strings raw, lists as `[a b]`,
/// maps as `map[k:v]`, nil as nothing.
pub(crate) fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&format_number(n)),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push_str("map[");
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(k);
                out.push(':');
                write_value(out, v);
            }
            out.push(']');
        }
    }
}

pub(crate) fn to_display(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn format_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or_default();
    if f.fract() == 0.0 && f.abs() < 1e21 {
        format!("{f:.0}")
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_case_insensitive_fallback() {
        let data = json!({"Job": {"Name": "a"}});
        assert_eq!(
            lookup(&data, &["job".into(), "name".into()]).unwrap(),
            json!("a")
        );
        assert_eq!(lookup(&data, &["Missing".into()]).unwrap(), Value::Null);
        assert!(lookup(&json!({"A": 1}), &["A".into(), "B".into()]).is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_true(&json!(null)));
        assert!(!is_true(&json!(0)));
        assert!(!is_true(&json!("")));
        assert!(!is_true(&json!([])));
        assert!(!is_true(&json!({})));
        assert!(is_true(&json!(0.5)));
        assert!(is_true(&json!("x")));
        assert!(is_true(&json!([0])));
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(to_display(&json!([1, "a", true])), "[1 a true]");
        assert_eq!(to_display(&json!({"b": 2, "a": 1})), "map[a:1 b:2]");
        assert_eq!(to_display(&json!(2.0)), "2");
        assert_eq!(to_display(&json!(2.5)), "2.5");
        assert_eq!(to_display(&json!(null)), "");
    }
}
