//! Default-rule templates.
//!
//! A small subset of text templates: literal text with `{{ ... }}` actions.
//! Actions are pipelines of commands over the model
//! `{ .Name, .ContainerName, .Labels }` with the functions `normalize` and
//! `index`:
//!
//! ```text
//! Host(`{{ normalize .Name }}.example.com`)
//! Host(`{{ index .Labels "com.example.host" }}`)
//! PathPrefix(`/{{ .ContainerName | normalize }}`)
//! ```
//!
//! `{{-` and `-}}` trim the whitespace before and after an action.

use std::borrow::Cow;
use std::collections::HashMap;

use thiserror::Error;

use crate::provider::normalize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("function {0:?} not defined")]
    UnknownFunction(String),

    #[error("can't evaluate field {0}")]
    UnknownField(String),

    #[error("error calling {func}: {message}")]
    Call { func: &'static str, message: String },

    #[error("cannot print {0} as text")]
    NotText(&'static str),
}

/// Data a rule is rendered against.
#[derive(Debug, Clone, Copy)]
pub struct RuleModel<'a> {
    /// Logical service name.
    pub name: &'a str,
    pub container_name: &'a str,
    pub labels: &'a HashMap<String, String>,
}

/// A parsed template, reusable across passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTemplate {
    nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Text(String),
    Action(Pipeline),
}

/// `cmd | cmd | ...`; each stage receives the previous result as its last
/// argument.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Operand(Operand),
    Call { func: Func, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Operand(Operand),
    Nested(Pipeline),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Name,
    ContainerName,
    Labels,
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Normalize,
    Index,
}

enum Value<'a> {
    Text(Cow<'a, str>),
    Labels(&'a HashMap<String, String>),
}

impl RuleTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut nodes = Vec::new();
        let mut pos = 0;
        let mut trim_next = false;

        while let Some(found) = source[pos..].find("{{") {
            let start = pos + found;
            let mut text = &source[pos..start];
            if trim_next {
                text = text.trim_start();
            }
            let mut action_start = start + 2;
            if source[action_start..].starts_with("- ") {
                text = text.trim_end();
                action_start += 2;
            }
            if !text.is_empty() {
                nodes.push(Node::Text(text.to_string()));
            }

            let mut lexer = Lexer::new(&source[action_start..], action_start);
            let pipeline = lexer.pipeline()?;
            trim_next = lexer.close()?;
            nodes.push(Node::Action(pipeline));
            pos = action_start + lexer.pos;
        }

        let rest = &source[pos..];
        let text = if trim_next { rest.trim_start() } else { rest };
        if !text.is_empty() {
            nodes.push(Node::Text(text.to_string()));
        }
        Ok(Self { nodes })
    }

    /// Render against one entity. An empty result is not an error.
    pub fn render(&self, model: &RuleModel<'_>) -> Result<String, TemplateError> {
        let mut out = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => match pipeline.eval(model)? {
                    Value::Text(text) => out.push_str(&text),
                    Value::Labels(_) => return Err(TemplateError::NotText("map")),
                },
            }
        }
        Ok(out)
    }
}

impl Pipeline {
    fn eval<'a>(&self, model: &RuleModel<'a>) -> Result<Value<'a>, TemplateError> {
        let mut piped: Option<Value<'a>> = None;
        for command in &self.commands {
            piped = Some(command.eval(model, piped.take())?);
        }
        piped.ok_or(TemplateError::Parse {
            offset: 0,
            message: "empty pipeline".to_string(),
        })
    }
}

impl Command {
    fn eval<'a>(
        &self,
        model: &RuleModel<'a>,
        piped: Option<Value<'a>>,
    ) -> Result<Value<'a>, TemplateError> {
        match self {
            Command::Operand(operand) => {
                if piped.is_some() {
                    return Err(TemplateError::Call {
                        func: "pipeline",
                        message: "can't give argument to non-function".to_string(),
                    });
                }
                Ok(operand.eval(model))
            }
            Command::Call { func, args } => {
                let mut values = args
                    .iter()
                    .map(|arg| match arg {
                        Arg::Operand(operand) => Ok(operand.eval(model)),
                        Arg::Nested(pipeline) => pipeline.eval(model),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                values.extend(piped);
                func.call(values)
            }
        }
    }
}

impl Operand {
    fn eval<'a>(&self, model: &RuleModel<'a>) -> Value<'a> {
        match self {
            Operand::Name => Value::Text(Cow::Borrowed(model.name)),
            Operand::ContainerName => Value::Text(Cow::Borrowed(model.container_name)),
            Operand::Labels => Value::Labels(model.labels),
            Operand::Literal(s) => Value::Text(Cow::Owned(s.clone())),
        }
    }
}

impl Func {
    fn lookup(name: &str) -> Result<Self, TemplateError> {
        match name {
            "normalize" => Ok(Func::Normalize),
            "index" => Ok(Func::Index),
            other => Err(TemplateError::UnknownFunction(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Normalize => "normalize",
            Func::Index => "index",
        }
    }

    fn call<'a>(self, args: Vec<Value<'a>>) -> Result<Value<'a>, TemplateError> {
        let err = |message: &str| TemplateError::Call {
            func: self.name(),
            message: message.to_string(),
        };

        match self {
            Func::Normalize => match args.as_slice() {
                [Value::Text(text)] => Ok(Value::Text(Cow::Owned(normalize(text)))),
                [Value::Labels(_)] => Err(err("argument must be a string")),
                _ => Err(err("wrong number of args: want 1")),
            },
            Func::Index => match args.as_slice() {
                [Value::Labels(labels), Value::Text(key)] => Ok(Value::Text(Cow::Owned(
                    labels.get(key.as_ref()).cloned().unwrap_or_default(),
                ))),
                [_, _] => Err(err("can't index item of type string")),
                _ => Err(err("wrong number of args: want 2")),
            },
        }
    }
}

/// Tokenizer and parser for the inside of one action.
struct Lexer<'s> {
    src: &'s str,
    base: usize,
    pos: usize,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str, base: usize) -> Self {
        Self { src, base, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Parse {
            offset: self.base + self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Consume the closing delimiter. Returns whether it trims what follows.
    fn close(&mut self) -> Result<bool, TemplateError> {
        self.skip_ws();
        if self.rest().starts_with("-}}") {
            self.pos += 3;
            return Ok(true);
        }
        if self.rest().starts_with("}}") {
            self.pos += 2;
            return Ok(false);
        }
        Err(self.error("unclosed action"))
    }

    fn at_end_of_command(&mut self) -> bool {
        self.skip_ws();
        let rest = self.rest();
        rest.is_empty()
            || rest.starts_with('|')
            || rest.starts_with(')')
            || rest.starts_with("}}")
            || rest.starts_with("-}}")
    }

    fn pipeline(&mut self) -> Result<Pipeline, TemplateError> {
        let mut commands = vec![self.command()?];
        while self.eat("|") {
            commands.push(self.command()?);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        self.skip_ws();
        if self.rest().starts_with(|c: char| c.is_ascii_alphabetic()) {
            let ident = self.ident();
            let func = Func::lookup(ident)?;
            let mut args = Vec::new();
            while !self.at_end_of_command() {
                args.push(self.arg()?);
            }
            return Ok(Command::Call { func, args });
        }

        let operand = self.operand()?;
        if !self.at_end_of_command() {
            return Err(self.error("unexpected argument to non-function"));
        }
        Ok(Command::Operand(operand))
    }

    fn arg(&mut self) -> Result<Arg, TemplateError> {
        if self.eat("(") {
            let pipeline = self.pipeline()?;
            if !self.eat(")") {
                return Err(self.error("unclosed left paren"));
            }
            return Ok(Arg::Nested(pipeline));
        }
        Ok(Arg::Operand(self.operand()?))
    }

    fn operand(&mut self) -> Result<Operand, TemplateError> {
        self.skip_ws();
        let rest = self.rest();
        match rest.chars().next() {
            Some('.') => {
                self.pos += 1;
                let field = self.ident();
                match field {
                    "Name" => Ok(Operand::Name),
                    "ContainerName" => Ok(Operand::ContainerName),
                    "Labels" => Ok(Operand::Labels),
                    other => Err(TemplateError::UnknownField(other.to_string())),
                }
            }
            Some('"') => self.quoted().map(Operand::Literal),
            Some('`') => {
                let body = &rest[1..];
                let end = body.find('`').ok_or_else(|| self.error("unterminated raw string"))?;
                self.pos += end + 2;
                Ok(Operand::Literal(body[..end].to_string()))
            }
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("missing value")),
        }
    }

    fn ident(&mut self) -> &'s str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn quoted(&mut self) -> Result<String, TemplateError> {
        let mut out = String::new();
        let mut chars = self.rest().char_indices().skip(1);
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(out);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(self.error("unterminated quoted string"))
    }
}
