//! Builds the node tree executed by [`crate::exec`].

use serde_json::Value;

use crate::error::TemplateError;
use crate::funcs;
use crate::lexer::{self, Chunk, Tok, Token};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub decl: Vec<String>,
    pub assign: bool,
    pub cmds: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Dot,
    Field(Vec<String>),
    Var(String, Vec<String>),
    Func(String),
    Literal(Value),
    Sub(Box<Pipeline>, Vec<String>),
}

enum Terminator {
    End,
    Else(Vec<Token>),
    Eof,
}

pub(crate) fn parse(src: &str) -> Result<Vec<Node>, TemplateError> {
    let chunks = lexer::split(src)?;
    let mut parser = Parser {
        chunks,
        pos: 0,
        range_depth: 0,
        last_line: 1,
    };
    let (nodes, term) = parser.list()?;
    match term {
        Terminator::Eof => Ok(nodes),
        Terminator::End => Err(TemplateError::parse(parser.last_line, "unexpected {{end}}")),
        Terminator::Else(_) => Err(TemplateError::parse(parser.last_line, "unexpected {{else}}")),
    }
}

struct Parser {
    chunks: Vec<Chunk>,
    pos: usize,
    range_depth: usize,
    last_line: usize,
}

impl Parser {
    fn list(&mut self) -> Result<(Vec<Node>, Terminator), TemplateError> {
        let mut nodes = Vec::new();

        while self.pos < self.chunks.len() {
            let chunk = self.chunks[self.pos].clone();
            self.pos += 1;

            let (body, line) = match chunk {
                Chunk::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Chunk::Action { body, line } => (body, line),
            };
            self.last_line = line;

            let tokens = lexer::tokenize(&body, line)?;
            let Some(first) = tokens.first() else {
                return Err(TemplateError::parse(line, "missing value for command"));
            };

            let keyword = match &first.tok {
                Tok::Ident(name) => name.as_str(),
                _ => "",
            };
            let rest = tokens[1..].to_vec();

            match keyword {
                "end" => {
                    expect_empty(&rest, "end", line)?;
                    return Ok((nodes, Terminator::End));
                }
                "else" => return Ok((nodes, Terminator::Else(rest))),
                "if" => nodes.push(self.if_node(&rest, line)?),
                "with" => nodes.push(self.with_node(&rest, line)?),
                "range" => nodes.push(self.range_node(&rest, line)?),
                "break" | "continue" => {
                    expect_empty(&rest, keyword, line)?;
                    if self.range_depth == 0 {
                        return Err(TemplateError::parse(
                            line,
                            format!("{{{{{keyword}}}}} outside {{{{range}}}}"),
                        ));
                    }
                    nodes.push(if keyword == "break" {
                        Node::Break
                    } else {
                        Node::Continue
                    });
                }
                "define" | "template" | "block" => {
                    return Err(TemplateError::parse(
                        line,
                        format!("{keyword} is not supported"),
                    ));
                }
                _ => nodes.push(Node::Action(pipeline(&tokens, line, true)?)),
            }
        }

        Ok((nodes, Terminator::Eof))
    }

    fn if_node(&mut self, tokens: &[Token], line: usize) -> Result<Node, TemplateError> {
        let cond = pipeline(tokens, line, true)?;
        let (then, otherwise) = self.branches("if", line)?;
        Ok(Node::If {
            cond,
            then,
            otherwise,
        })
    }

    fn with_node(&mut self, tokens: &[Token], line: usize) -> Result<Node, TemplateError> {
        let pipe = pipeline(tokens, line, true)?;
        let (body, otherwise) = self.branches("with", line)?;
        Ok(Node::With {
            pipe,
            body,
            otherwise,
        })
    }

    fn range_node(&mut self, tokens: &[Token], line: usize) -> Result<Node, TemplateError> {
        let pipe = pipeline(tokens, line, true)?;
        if pipe.assign || pipe.decl.len() > 2 {
            return Err(TemplateError::parse(line, "range can only declare up to two variables"));
        }
        self.range_depth += 1;
        let body = self.list();
        self.range_depth -= 1;

        let (body, term) = body?;
        let otherwise = match term {
            Terminator::End => Vec::new(),
            Terminator::Else(rest) if rest.is_empty() => self.closing_list("range", line)?,
            Terminator::Else(_) => {
                return Err(TemplateError::parse(line, "range only accepts a plain {{else}}"));
            }
            Terminator::Eof => return Err(unexpected_eof("range", line)),
        };
        Ok(Node::Range {
            pipe,
            body,
            otherwise,
        })
    }

    /// Parse the body of an `if`/`with` and its optional else branch. An
    /// `{{else if ...}}` / `{{else with ...}}` nests a new node that shares the
    /// outer `{{end}}`.
    fn branches(
        &mut self,
        keyword: &str,
        line: usize,
    ) -> Result<(Vec<Node>, Vec<Node>), TemplateError> {
        let (body, term) = self.list()?;
        let otherwise = match term {
            Terminator::End => Vec::new(),
            Terminator::Else(rest) if rest.is_empty() => self.closing_list(keyword, line)?,
            Terminator::Else(rest) => {
                let chained = match &rest[0].tok {
                    Tok::Ident(name) if name == "if" => self.if_node(&rest[1..], line)?,
                    Tok::Ident(name) if name == "with" => self.with_node(&rest[1..], line)?,
                    _ => {
                        return Err(TemplateError::parse(
                            line,
                            format!("unexpected tokens after {{{{else}}}} in {keyword}"),
                        ));
                    }
                };
                vec![chained]
            }
            Terminator::Eof => return Err(unexpected_eof(keyword, line)),
        };
        Ok((body, otherwise))
    }

    fn closing_list(&mut self, keyword: &str, line: usize) -> Result<Vec<Node>, TemplateError> {
        let (nodes, term) = self.list()?;
        match term {
            Terminator::End => Ok(nodes),
            Terminator::Else(_) => Err(TemplateError::parse(
                line,
                format!("expected {{{{end}}}} after {{{{else}}}} in {keyword}"),
            )),
            Terminator::Eof => Err(unexpected_eof(keyword, line)),
        }
    }
}

fn unexpected_eof(keyword: &str, line: usize) -> TemplateError {
    TemplateError::parse(line, format!("unexpected EOF: {{{{{keyword}}}}} is never closed"))
}

fn expect_empty(rest: &[Token], keyword: &str, line: usize) -> Result<(), TemplateError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(TemplateError::parse(
            line,
            format!("unexpected arguments to {keyword}"),
        ))
    }
}

fn pipeline(tokens: &[Token], line: usize, allow_decl: bool) -> Result<Pipeline, TemplateError> {
    let (decl, assign, body) = declarations(tokens, line)?;
    if !decl.is_empty() && !allow_decl {
        return Err(TemplateError::parse(line, "declaration not allowed here"));
    }
    if body.is_empty() {
        return Err(TemplateError::parse(line, "missing value for command"));
    }

    let mut cmds = Vec::new();
    for segment in split_commands(body, line)? {
        if segment.is_empty() {
            return Err(TemplateError::parse(line, "missing command in pipeline"));
        }
        cmds.push(command(segment, line)?);
    }

    Ok(Pipeline { decl, assign, cmds })
}

/// Strip a leading `$x :=`, `$k, $v :=` or `$x =`.
fn declarations(
    tokens: &[Token],
    line: usize,
) -> Result<(Vec<String>, bool, &[Token]), TemplateError> {
    let op = tokens
        .iter()
        .position(|t| matches!(t.tok, Tok::Declare | Tok::Assign));
    let Some(op) = op else {
        return Ok((Vec::new(), false, tokens));
    };

    let mut names = Vec::new();
    for (i, token) in tokens[..op].iter().enumerate() {
        match (&token.tok, i % 2) {
            (Tok::Var(name), 0) if !name.is_empty() => names.push(name.clone()),
            (Tok::Comma, 1) => {}
            _ => {
                // Not a declaration prefix; `=` inside an expression is invalid anyway.
                return Err(TemplateError::parse(line, "invalid variable declaration"));
            }
        }
    }
    if names.is_empty() || op % 2 == 0 {
        return Err(TemplateError::parse(line, "invalid variable declaration"));
    }

    let assign = tokens[op].tok == Tok::Assign;
    Ok((names, assign, &tokens[op + 1..]))
}

fn split_commands(tokens: &[Token], line: usize) -> Result<Vec<&[Token]>, TemplateError> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, token) in tokens.iter().enumerate() {
        match token.tok {
            Tok::LParen => depth += 1,
            Tok::RParen => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| TemplateError::parse(line, "unexpected right paren"))?;
            }
            Tok::Pipe if depth == 0 => {
                segments.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TemplateError::parse(line, "unclosed left paren"));
    }
    segments.push(&tokens[start..]);
    Ok(segments)
}

fn command(tokens: &[Token], line: usize) -> Result<Command, TemplateError> {
    let mut args = Vec::new();
    let mut pos = 0;
    while pos < tokens.len() {
        if !tokens[pos].spaced && pos > 0 {
            return Err(TemplateError::parse(line, "missing space between arguments"));
        }
        args.push(operand(tokens, &mut pos, line)?);
    }
    Ok(Command { args })
}

fn operand(tokens: &[Token], pos: &mut usize, line: usize) -> Result<Arg, TemplateError> {
    let token = &tokens[*pos];
    *pos += 1;

    let arg = match &token.tok {
        Tok::Dot => {
            let chain = field_chain(tokens, pos);
            if chain.is_empty() {
                Arg::Dot
            } else {
                Arg::Field(chain)
            }
        }
        Tok::Field(name) => {
            let mut chain = vec![name.clone()];
            chain.extend(field_chain(tokens, pos));
            Arg::Field(chain)
        }
        Tok::Var(name) => Arg::Var(name.clone(), field_chain(tokens, pos)),
        Tok::Ident(name) => {
            if !funcs::exists(name) {
                return Err(TemplateError::parse(
                    line,
                    format!("function {name:?} not defined"),
                ));
            }
            Arg::Func(name.clone())
        }
        Tok::Str(s) => Arg::Literal(Value::String(s.clone())),
        Tok::Int(n) => Arg::Literal(Value::from(*n)),
        Tok::Float(f) => Arg::Literal(Value::from(*f)),
        Tok::Bool(b) => Arg::Literal(Value::Bool(*b)),
        Tok::Nil => Arg::Literal(Value::Null),
        Tok::LParen => {
            let start = *pos;
            let mut depth = 1;
            while *pos < tokens.len() {
                match tokens[*pos].tok {
                    Tok::LParen => depth += 1,
                    Tok::RParen => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                *pos += 1;
            }
            if depth != 0 {
                return Err(TemplateError::parse(line, "unclosed left paren"));
            }
            let inner = pipeline(&tokens[start..*pos], line, false)?;
            *pos += 1;
            Arg::Sub(Box::new(inner), field_chain(tokens, pos))
        }
        other => {
            return Err(TemplateError::parse(
                line,
                format!("unexpected {} in operand", describe(other)),
            ));
        }
    };
    Ok(arg)
}

/// Collect `.A.B` fields glued to the previous operand.
fn field_chain(tokens: &[Token], pos: &mut usize) -> Vec<String> {
    let mut chain = Vec::new();
    while let Some(Token {
        tok: Tok::Field(name),
        spaced: false,
    }) = tokens.get(*pos)
    {
        chain.push(name.clone());
        *pos += 1;
    }
    chain
}

fn describe(tok: &Tok) -> &'static str {
    match tok {
        Tok::Pipe => "'|'",
        Tok::RParen => "')'",
        Tok::Comma => "','",
        Tok::Declare => "':='",
        Tok::Assign => "'='",
        _ => "token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_action() {
        let nodes = parse("{{ .Job.Name }}").unwrap();
        assert_eq!(
            nodes,
            vec![Node::Action(Pipeline {
                decl: vec![],
                assign: false,
                cmds: vec![Command {
                    args: vec![Arg::Field(vec!["Job".into(), "Name".into()])]
                }],
            })]
        );
    }

    #[test]
    fn test_parse_else_if_chain_shares_end() {
        let nodes = parse("{{if .A}}a{{else if .B}}b{{else}}c{{end}}").unwrap();
        let Node::If { otherwise, .. } = &nodes[0] else {
            panic!("expected if");
        };
        assert!(matches!(otherwise[0], Node::If { .. }));
    }

    #[test]
    fn test_parse_range_declarations() {
        let nodes = parse("{{range $i, $p := .Pods}}{{$i}}{{end}}").unwrap();
        let Node::Range { pipe, .. } = &nodes[0] else {
            panic!("expected range");
        };
        assert_eq!(pipe.decl, vec!["i".to_string(), "p".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("{{if .A}}x").is_err());
        assert!(parse("{{end}}").is_err());
        assert!(parse("{{ nosuchfunc .A }}").is_err());
        assert!(parse("{{ break }}").is_err());
        assert!(parse("{{ (.A }}").is_err());
        assert!(parse("{{ .A | }}").is_err());
        assert!(parse("{{ template \"x\" }}").is_err());
    }

    #[test]
    fn test_parse_subpipeline_with_field() {
        let nodes = parse("{{ (index .Pods 0).Name }}").unwrap();
        let Node::Action(pipe) = &nodes[0] else {
            panic!("expected action");
        };
        assert!(matches!(
            &pipe.cmds[0].args[0],
            Arg::Sub(_, fields) if fields == &vec!["Name".to_string()]
        ));
    }
}
