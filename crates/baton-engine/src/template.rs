//! Template resolution for `{{.path}}` expressions.
//!
//! Substitutes occurrences of `{{ ... }}` inside a string with values from
//! the template context. An expression is a dotted path (`.steps.x.response`,
//! `.inputs.name`, `.loop.iteration`), an inline function call
//! (`{{add .loop.iteration 1}}`), or a pipeline (`{{.name | upper}}` -- the
//! piped value becomes the call's final argument).
//!
//! When the whole template is a single expression, [`resolve_typed`]
//! returns the raw value instead of a rendered string; `foreach` uses this
//! to recover an array.
//!
//! Context payloads are always passed as a JSON object and traversed by
//! path, never interpolated into the template text.

use serde_json::{Number, Value};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from template parsing or resolution.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The template text could not be parsed.
    #[error("template syntax error: {0}")]
    Syntax(String),

    /// A referenced path does not exist in the context.
    #[error("template resolution error: unknown path '{path}'")]
    Resolution { path: String },

    /// A function was applied to unsuitable arguments.
    #[error("template function '{name}' failed: {message}")]
    Function { name: String, message: String },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Resolve every `{{ ... }}` expression in `template` against `context`,
/// producing a string. A template without `{{` is returned unchanged.
pub fn resolve_str(template: &str, context: &Value) -> Result<String, TemplateError> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let mut out = String::with_capacity(template.len());
    for part in split_template(template)? {
        match part {
            Part::Literal(text) => out.push_str(text),
            Part::Expression(expr) => {
                let value = eval_expression(expr, context)?;
                out.push_str(&render_value(&value));
            }
        }
    }
    Ok(out)
}

/// Resolve a template, preserving the value's type when the template is a
/// single expression (`"{{.inputs.items}}"` over an array yields the
/// array). Mixed templates fall back to string rendering.
pub fn resolve_typed(template: &str, context: &Value) -> Result<Value, TemplateError> {
    if !template.contains("{{") {
        return Ok(Value::String(template.to_string()));
    }
    let parts = split_template(template)?;
    if let [Part::Expression(expr)] = parts.as_slice() {
        return eval_expression(expr, context);
    }
    resolve_str(template, context).map(Value::String)
}

/// Recursively resolve templates inside a value: string leaves are
/// resolved with [`resolve_typed`], maps and lists are walked, everything
/// else passes through.
pub fn resolve_inputs(value: &Value, context: &Value) -> Result<Value, TemplateError> {
    match value {
        Value::String(text) => resolve_typed(text, context),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_inputs(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, val)| Ok((key.clone(), resolve_inputs(val, context)?)))
            .collect::<Result<serde_json::Map<_, _>, TemplateError>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Render a resolved value the way it appears in substituted text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects/arrays render as compact JSON.
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Template splitting
// ---------------------------------------------------------------------------

enum Part<'a> {
    Literal(&'a str),
    Expression(&'a str),
}

/// Split a template into literal chunks and `{{ ... }}` expressions.
fn split_template(template: &str) -> Result<Vec<Part<'_>>, TemplateError> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            parts.push(Part::Literal(&rest[..open]));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            TemplateError::Syntax(format!("unterminated '{{{{' in template: {template:?}"))
        })?;
        let inner = after_open[..close].trim();
        if inner.is_empty() {
            return Err(TemplateError::Syntax("empty template expression".to_string()));
        }
        parts.push(Part::Expression(inner));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest));
    }
    Ok(parts)
}

// ---------------------------------------------------------------------------
// Expression lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// `.a.b.c` dotted path (segments).
    Path(Vec<String>),
    /// Bare identifier (function name or keyword literal).
    Ident(String),
    Str(String),
    Num(Number),
    Pipe,
    LParen,
    RParen,
}

fn lex(input: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let (s, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '.' => {
                let (segments, next) = lex_path(&chars, i)?;
                tokens.push(Token::Path(segments));
                i = next;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let (num, next) = lex_number(&chars, i)?;
                tokens.push(Token::Num(num));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(TemplateError::Syntax(format!(
                    "unexpected character '{other}' in expression {input:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), TemplateError> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, i + 1)),
            '\\' if i + 1 < chars.len() => {
                let escaped = chars[i + 1];
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(TemplateError::Syntax("unterminated string literal".to_string()))
}

fn lex_path(chars: &[char], start: usize) -> Result<(Vec<String>, usize), TemplateError> {
    let mut segments = Vec::new();
    let mut i = start;
    while i < chars.len() && chars[i] == '.' {
        i += 1;
        let seg_start = i;
        while i < chars.len()
            && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
        {
            i += 1;
        }
        if i == seg_start {
            return Err(TemplateError::Syntax(
                "path segment must not be empty".to_string(),
            ));
        }
        segments.push(chars[seg_start..i].iter().collect());
    }
    Ok((segments, i))
}

fn lex_number(chars: &[char], start: usize) -> Result<(Number, usize), TemplateError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    let mut is_float = false;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        if chars[i] == '.' {
            is_float = true;
        }
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    let number = if is_float {
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .ok_or_else(|| TemplateError::Syntax(format!("invalid number literal '{text}'")))?
    } else {
        Number::from(
            text.parse::<i64>()
                .map_err(|_| TemplateError::Syntax(format!("invalid number literal '{text}'")))?,
        )
    };
    Ok((number, i))
}

// ---------------------------------------------------------------------------
// Expression evaluation
// ---------------------------------------------------------------------------

/// Evaluate one `{{ ... }}` expression body against the context.
fn eval_expression(expr: &str, context: &Value) -> Result<Value, TemplateError> {
    let tokens = lex(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        context,
    };
    let value = parser.pipeline()?;
    if parser.pos != parser.tokens.len() {
        return Err(TemplateError::Syntax(format!(
            "unexpected trailing tokens in expression {expr:?}"
        )));
    }
    Ok(value)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    context: &'a Value,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// pipeline := operand ('|' call)*
    fn pipeline(&mut self) -> Result<Value, TemplateError> {
        let mut value = self.operand(true)?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.next();
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                other => {
                    return Err(TemplateError::Syntax(format!(
                        "expected function name after '|', got {other:?}"
                    )));
                }
            };
            let mut args = self.call_args()?;
            args.push(value);
            value = apply_function(&name, args)?;
        }
        Ok(value)
    }

    /// operand := path | literal | call | '(' pipeline ')'
    ///
    /// `allow_call` is false in argument position, where a bare identifier
    /// is a keyword literal rather than a nested call; nested calls use
    /// parentheses.
    fn operand(&mut self, allow_call: bool) -> Result<Value, TemplateError> {
        match self.next() {
            Some(Token::Path(segments)) => lookup_path(self.context, &segments),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(Value::Number(n)),
            Some(Token::LParen) => {
                let value = self.pipeline()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(TemplateError::Syntax("expected ')'".to_string())),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" | "nil" => Ok(Value::Null),
                _ if allow_call => {
                    let args = self.call_args()?;
                    apply_function(&name, args)
                }
                _ => Err(TemplateError::Syntax(format!(
                    "unexpected identifier '{name}' in argument position"
                ))),
            },
            other => Err(TemplateError::Syntax(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    /// Zero or more space-separated argument operands, ending at a pipe,
    /// closing paren, or end of input.
    fn call_args(&mut self) -> Result<Vec<Value>, TemplateError> {
        let mut args = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::Pipe) | Some(Token::RParen) => break,
                _ => args.push(self.operand(false)?),
            }
        }
        Ok(args)
    }
}

/// Walk a dotted path into the context. Numeric segments index arrays.
fn lookup_path(context: &Value, segments: &[String]) -> Result<Value, TemplateError> {
    let mut current = context;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment.as_str()),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        };
        current = next.ok_or_else(|| TemplateError::Resolution {
            path: format!(".{}", segments.join(".")),
        })?;
    }
    Ok(current.clone())
}

// ---------------------------------------------------------------------------
// Inline functions
// ---------------------------------------------------------------------------

fn apply_function(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    let fail = |message: String| TemplateError::Function {
        name: name.to_string(),
        message,
    };

    match name {
        "add" => numeric_fold(name, &args, |a, b| a + b, |a, b| a + b),
        "mul" => numeric_fold(name, &args, |a, b| a * b, |a, b| a * b),
        "min" => numeric_fold(name, &args, i64::min, f64::min),
        "max" => numeric_fold(name, &args, i64::max, f64::max),
        "div" => {
            let (a, b) = two_ints(name, &args)?;
            if b == 0 {
                return Err(fail("division by zero".to_string()));
            }
            Ok(Value::from(a / b))
        }
        "mod" => {
            let (a, b) = two_ints(name, &args)?;
            if b == 0 {
                return Err(fail("division by zero".to_string()));
            }
            Ok(Value::from(a % b))
        }
        "divf" => {
            let (a, b) = two_floats(name, &args)?;
            if b == 0.0 {
                return Err(fail("division by zero".to_string()));
            }
            Ok(Number::from_f64(a / b)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        "join" => {
            let [sep, list] = take_args::<2>(name, args)?;
            let sep = as_str(name, &sep)?;
            let items = as_array(name, &list)?;
            let joined: Vec<String> = items.iter().map(render_value).collect();
            Ok(Value::String(joined.join(&sep)))
        }
        "upper" => {
            let [value] = take_args::<1>(name, args)?;
            Ok(Value::String(as_str(name, &value)?.to_uppercase()))
        }
        "trim" => {
            let [value] = take_args::<1>(name, args)?;
            Ok(Value::String(as_str(name, &value)?.trim().to_string()))
        }
        "trimPrefix" => {
            let [prefix, value] = take_args::<2>(name, args)?;
            let prefix = as_str(name, &prefix)?;
            let value = as_str(name, &value)?;
            Ok(Value::String(
                value.strip_prefix(&prefix).unwrap_or(&value).to_string(),
            ))
        }
        "title" => {
            let [value] = take_args::<1>(name, args)?;
            let text = as_str(name, &value)?;
            let titled = text
                .split(' ')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            Ok(Value::String(titled))
        }
        "toJson" => {
            let [value] = take_args::<1>(name, args)?;
            serde_json::to_string(&value)
                .map(Value::String)
                .map_err(|e| fail(e.to_string()))
        }
        "fromJson" => {
            let [value] = take_args::<1>(name, args)?;
            let text = as_str(name, &value)?;
            serde_json::from_str(&text).map_err(|e| fail(format!("invalid JSON: {e}")))
        }
        "default" => {
            let [fallback, value] = take_args::<2>(name, args)?;
            Ok(if is_empty(&value) { fallback } else { value })
        }
        "coalesce" => Ok(args
            .into_iter()
            .find(|value| !is_empty(value))
            .unwrap_or(Value::Null)),
        "pluck" => {
            let [key, list] = take_args::<2>(name, args)?;
            let key = as_str(name, &key)?;
            let items = as_array(name, &list)?;
            let plucked: Vec<Value> = items
                .iter()
                .filter_map(|item| item.get(&key).cloned())
                .collect();
            Ok(Value::Array(plucked))
        }
        "first" => {
            let [list] = take_args::<1>(name, args)?;
            Ok(as_array(name, &list)?.first().cloned().unwrap_or(Value::Null))
        }
        "last" => {
            let [list] = take_args::<1>(name, args)?;
            Ok(as_array(name, &list)?.last().cloned().unwrap_or(Value::Null))
        }
        "len" => {
            let [value] = take_args::<1>(name, args)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => {
                    return Err(fail(format!("cannot take length of {other}")));
                }
            };
            Ok(Value::from(len as i64))
        }
        "hasKey" => {
            let [map, key] = take_args::<2>(name, args)?;
            let key = as_str(name, &key)?;
            match &map {
                Value::Object(obj) => Ok(Value::Bool(obj.contains_key(&key))),
                other => Err(fail(format!("expected object, got {other}"))),
            }
        }
        "toInt" => {
            let [value] = take_args::<1>(name, args)?;
            let int = match &value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| fail(format!("cannot convert {n} to integer")))?,
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| fail(format!("cannot parse '{s}' as integer")))?,
                Value::Bool(b) => i64::from(*b),
                other => return Err(fail(format!("cannot convert {other} to integer"))),
            };
            Ok(Value::from(int))
        }
        "toString" => {
            let [value] = take_args::<1>(name, args)?;
            Ok(Value::String(render_value(&value)))
        }
        "toBool" => {
            let [value] = take_args::<1>(name, args)?;
            let truthy = match &value {
                Value::Bool(b) => *b,
                Value::Null => false,
                Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
                Value::String(s) => matches!(s.trim(), "true" | "1" | "yes"),
                Value::Array(items) => !items.is_empty(),
                Value::Object(map) => !map.is_empty(),
            };
            Ok(Value::Bool(truthy))
        }
        other => Err(TemplateError::Syntax(format!("unknown function '{other}'"))),
    }
}

fn take_args<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], TemplateError> {
    let count = args.len();
    args.try_into().map_err(|_| TemplateError::Function {
        name: name.to_string(),
        message: format!("expected {N} argument(s), got {count}"),
    })
}

fn as_str(name: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(TemplateError::Function {
            name: name.to_string(),
            message: format!("expected string, got {other}"),
        }),
    }
}

fn as_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>, TemplateError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(TemplateError::Function {
            name: name.to_string(),
            message: format!("expected array, got {other}"),
        }),
    }
}

fn numeric_fold(
    name: &str,
    args: &[Value],
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, TemplateError> {
    if args.len() < 2 {
        return Err(TemplateError::Function {
            name: name.to_string(),
            message: format!("expected at least 2 arguments, got {}", args.len()),
        });
    }
    let all_ints = args.iter().all(|v| v.as_i64().is_some());
    if all_ints {
        let mut acc = args[0].as_i64().unwrap();
        for arg in &args[1..] {
            acc = int_op(acc, arg.as_i64().unwrap());
        }
        Ok(Value::from(acc))
    } else {
        let mut acc = number_of(name, &args[0])?;
        for arg in &args[1..] {
            acc = float_op(acc, number_of(name, arg)?);
        }
        Ok(Number::from_f64(acc).map(Value::Number).unwrap_or(Value::Null))
    }
}

fn number_of(name: &str, value: &Value) -> Result<f64, TemplateError> {
    value.as_f64().ok_or_else(|| TemplateError::Function {
        name: name.to_string(),
        message: format!("expected number, got {value}"),
    })
}

fn two_ints(name: &str, args: &[Value]) -> Result<(i64, i64), TemplateError> {
    if args.len() != 2 {
        return Err(TemplateError::Function {
            name: name.to_string(),
            message: format!("expected 2 arguments, got {}", args.len()),
        });
    }
    let a = args[0].as_i64().ok_or_else(|| TemplateError::Function {
        name: name.to_string(),
        message: format!("expected integer, got {}", args[0]),
    })?;
    let b = args[1].as_i64().ok_or_else(|| TemplateError::Function {
        name: name.to_string(),
        message: format!("expected integer, got {}", args[1]),
    })?;
    Ok((a, b))
}

fn two_floats(name: &str, args: &[Value]) -> Result<(f64, f64), TemplateError> {
    if args.len() != 2 {
        return Err(TemplateError::Function {
            name: name.to_string(),
            message: format!("expected 2 arguments, got {}", args.len()),
        });
    }
    Ok((number_of(name, &args[0])?, number_of(name, &args[1])?))
}

/// Sprig-style emptiness: null, empty string/array/object, false, and
/// numeric zero are all "empty".
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "diff": "func x(){}",
            "inputs": { "name": "alice", "items": ["a", "b", "c"], "count": 3 },
            "steps": {
                "gather": { "response": "news", "meta": { "status": "ok" } },
                "score": { "response": 7 }
            },
            "loop": { "iteration": 2 },
            "env": { "HOME": "/root" }
        })
    }

    // -------------------------------------------------------------------
    // Plain substitution
    // -------------------------------------------------------------------

    #[test]
    fn no_markers_is_identity() {
        let ctx = context();
        assert_eq!(resolve_str("plain text", &ctx).unwrap(), "plain text");
    }

    #[test]
    fn resolves_root_and_nested_paths() {
        let ctx = context();
        assert_eq!(
            resolve_str("Review: {{.diff}}", &ctx).unwrap(),
            "Review: func x(){}"
        );
        assert_eq!(
            resolve_str("Got {{.steps.gather.response}}", &ctx).unwrap(),
            "Got news"
        );
        assert_eq!(
            resolve_str("{{.steps.gather.meta.status}}", &ctx).unwrap(),
            "ok"
        );
    }

    #[test]
    fn resolves_multiple_expressions() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{.inputs.name}} has {{.inputs.count}}", &ctx).unwrap(),
            "alice has 3"
        );
    }

    #[test]
    fn array_index_path() {
        let ctx = context();
        assert_eq!(resolve_str("{{.inputs.items.1}}", &ctx).unwrap(), "b");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let ctx = context();
        assert_eq!(
            resolve_str("items: {{.inputs.items}}", &ctx).unwrap(),
            r#"items: ["a","b","c"]"#
        );
        assert_eq!(resolve_str("{{.steps.score.response}}", &ctx).unwrap(), "7");
    }

    #[test]
    fn resolving_twice_is_stable() {
        let ctx = context();
        let once = resolve_str("{{.inputs.name}}", &ctx).unwrap();
        let twice = resolve_str("{{.inputs.name}}", &ctx).unwrap();
        assert_eq!(once, twice);
    }

    // -------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------

    #[test]
    fn unknown_path_is_resolution_error() {
        let ctx = context();
        let err = resolve_str("{{.steps.missing.response}}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Resolution { .. }));
        assert!(err.to_string().contains(".steps.missing.response"));
    }

    #[test]
    fn unterminated_marker_is_syntax_error() {
        let ctx = context();
        let err = resolve_str("{{.diff", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax(_)));
    }

    #[test]
    fn unknown_function_is_syntax_error() {
        let ctx = context();
        let err = resolve_str("{{frobnicate .diff}}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax(_)));
    }

    // -------------------------------------------------------------------
    // Typed resolution
    // -------------------------------------------------------------------

    #[test]
    fn typed_single_expression_preserves_arrays() {
        let ctx = context();
        let value = resolve_typed("{{.inputs.items}}", &ctx).unwrap();
        assert_eq!(value, json!(["a", "b", "c"]));
    }

    #[test]
    fn typed_single_expression_preserves_numbers() {
        let ctx = context();
        let value = resolve_typed("{{.steps.score.response}}", &ctx).unwrap();
        assert_eq!(value, json!(7));
    }

    #[test]
    fn typed_mixed_template_falls_back_to_string() {
        let ctx = context();
        let value = resolve_typed("count: {{.inputs.count}}", &ctx).unwrap();
        assert_eq!(value, json!("count: 3"));
    }

    #[test]
    fn typed_without_markers_is_string() {
        let ctx = context();
        assert_eq!(resolve_typed("hello", &ctx).unwrap(), json!("hello"));
    }

    // -------------------------------------------------------------------
    // Recursive input resolution
    // -------------------------------------------------------------------

    #[test]
    fn resolve_inputs_walks_maps_and_lists() {
        let ctx = context();
        let inputs = json!({
            "url": "https://example.com/{{.inputs.name}}",
            "tags": ["{{.inputs.name}}", "static"],
            "nested": { "who": "{{.inputs.name}}" },
            "count": 42
        });
        let resolved = resolve_inputs(&inputs, &ctx).unwrap();
        assert_eq!(resolved["url"], json!("https://example.com/alice"));
        assert_eq!(resolved["tags"], json!(["alice", "static"]));
        assert_eq!(resolved["nested"]["who"], json!("alice"));
        assert_eq!(resolved["count"], json!(42));
    }

    #[test]
    fn resolve_inputs_preserves_types_for_single_expressions() {
        let ctx = context();
        let inputs = json!({ "items": "{{.inputs.items}}" });
        let resolved = resolve_inputs(&inputs, &ctx).unwrap();
        assert_eq!(resolved["items"], json!(["a", "b", "c"]));
    }

    // -------------------------------------------------------------------
    // Functions
    // -------------------------------------------------------------------

    #[test]
    fn add_and_mul() {
        let ctx = context();
        assert_eq!(resolve_str("{{add .loop.iteration 1}}", &ctx).unwrap(), "3");
        assert_eq!(resolve_str("{{mul .inputs.count 4}}", &ctx).unwrap(), "12");
        assert_eq!(resolve_str("{{add 1 2 3}}", &ctx).unwrap(), "6");
    }

    #[test]
    fn div_variants() {
        let ctx = context();
        assert_eq!(resolve_str("{{div 7 2}}", &ctx).unwrap(), "3");
        assert_eq!(resolve_str("{{divf 7 2}}", &ctx).unwrap(), "3.5");
        assert_eq!(resolve_str("{{mod 7 2}}", &ctx).unwrap(), "1");
        assert!(resolve_str("{{div 1 0}}", &ctx).is_err());
    }

    #[test]
    fn min_max() {
        let ctx = context();
        assert_eq!(resolve_str("{{min 3 7}}", &ctx).unwrap(), "3");
        assert_eq!(resolve_str("{{max 3 7}}", &ctx).unwrap(), "7");
    }

    #[test]
    fn string_functions() {
        let ctx = context();
        assert_eq!(resolve_str("{{upper .inputs.name}}", &ctx).unwrap(), "ALICE");
        assert_eq!(resolve_str("{{trim \"  hi  \"}}", &ctx).unwrap(), "hi");
        assert_eq!(
            resolve_str("{{trimPrefix \"al\" .inputs.name}}", &ctx).unwrap(),
            "ice"
        );
        assert_eq!(
            resolve_str("{{title \"hello world\"}}", &ctx).unwrap(),
            "Hello World"
        );
    }

    #[test]
    fn join_and_pluck() {
        let ctx = json!({
            "items": ["x", "y"],
            "users": [{ "name": "a" }, { "name": "b" }, { "other": 1 }]
        });
        assert_eq!(resolve_str("{{join \",\" .items}}", &ctx).unwrap(), "x,y");
        let plucked = resolve_typed("{{pluck \"name\" .users}}", &ctx).unwrap();
        assert_eq!(plucked, json!(["a", "b"]));
    }

    #[test]
    fn first_last_len() {
        let ctx = context();
        assert_eq!(resolve_str("{{first .inputs.items}}", &ctx).unwrap(), "a");
        assert_eq!(resolve_str("{{last .inputs.items}}", &ctx).unwrap(), "c");
        assert_eq!(resolve_str("{{len .inputs.items}}", &ctx).unwrap(), "3");
        assert_eq!(resolve_str("{{len .inputs.name}}", &ctx).unwrap(), "5");
    }

    #[test]
    fn has_key() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{hasKey .steps.gather \"response\"}}", &ctx).unwrap(),
            "true"
        );
        assert_eq!(
            resolve_str("{{hasKey .steps.gather \"nope\"}}", &ctx).unwrap(),
            "false"
        );
    }

    #[test]
    fn json_roundtrip_functions() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{toJson .inputs.items}}", &ctx).unwrap(),
            r#"["a","b","c"]"#
        );
        let parsed = resolve_typed("{{fromJson \"[1,2]\"}}", &ctx).unwrap();
        assert_eq!(parsed, json!([1, 2]));
    }

    #[test]
    fn default_and_coalesce() {
        let ctx = json!({ "empty": "", "present": "yes" });
        assert_eq!(
            resolve_str("{{default \"fallback\" .empty}}", &ctx).unwrap(),
            "fallback"
        );
        assert_eq!(
            resolve_str("{{default \"fallback\" .present}}", &ctx).unwrap(),
            "yes"
        );
        assert_eq!(
            resolve_str("{{coalesce .empty .present \"z\"}}", &ctx).unwrap(),
            "yes"
        );
    }

    #[test]
    fn conversions() {
        let ctx = json!({ "n": "42", "f": 1.0, "zero": 0 });
        assert_eq!(resolve_str("{{toInt .n}}", &ctx).unwrap(), "42");
        assert_eq!(resolve_typed("{{toString .f}}", &ctx).unwrap(), json!("1.0"));
        assert_eq!(resolve_str("{{toBool .zero}}", &ctx).unwrap(), "false");
        assert_eq!(resolve_str("{{toBool \"true\"}}", &ctx).unwrap(), "true");
    }

    #[test]
    fn pipeline_appends_piped_value_as_last_argument() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{.inputs.name | upper}}", &ctx).unwrap(),
            "ALICE"
        );
        assert_eq!(
            resolve_str("{{.inputs.items | len}}", &ctx).unwrap(),
            "3"
        );
        assert_eq!(
            resolve_str("{{\"  padded  \" | trim | upper}}", &ctx).unwrap(),
            "PADDED"
        );
    }

    #[test]
    fn parenthesized_nested_call() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{add (len .inputs.items) 1}}", &ctx).unwrap(),
            "4"
        );
    }
}
