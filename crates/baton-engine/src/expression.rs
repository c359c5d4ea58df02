//! Boolean expression evaluator for step conditions, loop `until`
//! clauses, and foreach-gated sub-steps.
//!
//! The language covers literals, dotted paths, comparisons
//! (`== != < <= > >=`), logical `&& || !`, membership (`<expr> in
//! <array>`), and a `has(collection, key)` builtin. A path that does not
//! exist in the context resolves to a distinguished Missing value, and any
//! comparison involving Missing yields false. Numeric comparisons coerce
//! int and float; string equality is exact.
//!
//! **Security note:** payloads are always passed as context objects and
//! traversed by path, never interpolated into expression strings.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from expression parsing or evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression parse error: {0}")]
    Parse(String),

    #[error("expression evaluation failed: {0}")]
    Eval(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Evaluate an expression to a boolean against a context object.
///
/// Non-boolean results are coerced with JavaScript-like truthiness; a
/// Missing result is false.
pub fn evaluate_bool(expression: &str, context: &Value) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(expression, context)?))
}

/// Evaluate an expression and return the raw value; Missing becomes
/// `Value::Null`.
pub fn evaluate_value(expression: &str, context: &Value) -> Result<Value, ExpressionError> {
    Ok(evaluate(expression, context)?.unwrap_or(Value::Null))
}

/// A resolved operand: `None` is the distinguished Missing value.
type Resolved = Option<Value>;

fn evaluate(expression: &str, context: &Value) -> Result<Resolved, ExpressionError> {
    if !context.is_object() {
        return Err(ExpressionError::InvalidContext(
            "context must be a JSON object".to_string(),
        ));
    }
    let tokens = lex(expression)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        context,
    };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExpressionError::Parse(format!(
            "unexpected trailing tokens in {expression:?}"
        )));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Str(String),
    Num(f64),
    Int(i64),
    True,
    False,
    Null,
    In,
    Has,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut out = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') if i + 1 < chars.len() => {
                            out.push(match chars[i + 1] {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            out.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExpressionError::Parse(
                                "unterminated string literal".to_string(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                if c == '-' {
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
                if is_float {
                    let value = text.parse::<f64>().map_err(|_| {
                        ExpressionError::Parse(format!("invalid number '{text}'"))
                    })?;
                    tokens.push(Token::Num(value));
                } else {
                    let value = text.parse::<i64>().map_err(|_| {
                        ExpressionError::Parse(format!("invalid number '{text}'"))
                    })?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '.' => {
                let (segments, next) = lex_path(&chars, i)?;
                i = next;
                // A single bare segment may be a keyword.
                if segments.len() == 1 {
                    match segments[0].as_str() {
                        "true" => {
                            tokens.push(Token::True);
                            continue;
                        }
                        "false" => {
                            tokens.push(Token::False);
                            continue;
                        }
                        "null" => {
                            tokens.push(Token::Null);
                            continue;
                        }
                        "in" => {
                            tokens.push(Token::In);
                            continue;
                        }
                        "has" => {
                            tokens.push(Token::Has);
                            continue;
                        }
                        _ => {}
                    }
                }
                tokens.push(Token::Path(segments));
            }
            other => {
                return Err(ExpressionError::Parse(format!(
                    "unexpected character '{other}' in {input:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

/// Lex a dotted path; a leading dot is accepted and ignored.
fn lex_path(chars: &[char], start: usize) -> Result<(Vec<String>, usize), ExpressionError> {
    let mut segments = Vec::new();
    let mut i = start;
    if chars[i] == '.' {
        i += 1;
    }
    loop {
        let seg_start = i;
        while i < chars.len()
            && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
        {
            i += 1;
        }
        if i == seg_start {
            return Err(ExpressionError::Parse(
                "path segment must not be empty".to_string(),
            ));
        }
        segments.push(chars[seg_start..i].iter().collect());
        if i < chars.len() && chars[i] == '.' {
            i += 1;
        } else {
            break;
        }
    }
    Ok((segments, i))
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

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

    fn expect(&mut self, token: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(ExpressionError::Parse(format!(
                "expected {token:?}, got {other:?}"
            ))),
        }
    }

    fn or_expr(&mut self) -> Result<Resolved, ExpressionError> {
        let mut value = self.and_expr()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.next();
            let right = self.and_expr()?;
            value = Some(Value::Bool(truthy(&value) || truthy(&right)));
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<Resolved, ExpressionError> {
        let mut value = self.unary()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.next();
            let right = self.unary()?;
            value = Some(Value::Bool(truthy(&value) && truthy(&right)));
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<Resolved, ExpressionError> {
        if matches!(self.peek(), Some(Token::Bang)) {
            self.next();
            let value = self.unary()?;
            return Ok(Some(Value::Bool(!truthy(&value))));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Resolved, ExpressionError> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::In) => {
                self.next();
                let right = self.primary()?;
                return Ok(Some(Value::Bool(membership(&left, &right))));
            }
            _ => return Ok(left),
        };
        self.next();
        let right = self.primary()?;
        Ok(Some(Value::Bool(compare(op, &left, &right))))
    }

    fn primary(&mut self) -> Result<Resolved, ExpressionError> {
        match self.next() {
            Some(Token::Path(segments)) => Ok(lookup_path(self.context, &segments)),
            Some(Token::Str(s)) => Ok(Some(Value::String(s))),
            Some(Token::Int(n)) => Ok(Some(Value::from(n))),
            Some(Token::Num(f)) => Ok(Some(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::True) => Ok(Some(Value::Bool(true))),
            Some(Token::False) => Ok(Some(Value::Bool(false))),
            Some(Token::Null) => Ok(Some(Value::Null)),
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Has) => {
                self.expect(Token::LParen)?;
                let collection = self.or_expr()?;
                self.expect(Token::Comma)?;
                let key = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(Some(Value::Bool(has(&collection, &key))))
            }
            other => Err(ExpressionError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

/// Walk a dotted path; any miss yields Missing (never an error).
fn lookup_path(context: &Value, segments: &[String]) -> Resolved {
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
        match next {
            Some(value) => current = value,
            None => return None,
        }
    }
    Some(current.clone())
}

// ---------------------------------------------------------------------------
// Semantics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Comparison with Missing on either side is false, regardless of operator.
fn compare(op: CompareOp, left: &Resolved, right: &Resolved) -> bool {
    let (Some(left), Some(right)) = (left, right) else {
        return false;
    };
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => a.partial_cmp(&b),
                        _ => None,
                    }
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                Some(ordering) => match op {
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

/// Equality with numeric coercion; string-to-string equality is exact.
///
/// A number compared against a numeric string also compares numerically:
/// template substitution renders values without quoting, so a resolved
/// `until` clause like `3 == "3"` must still hold.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            match (n.as_f64(), s.trim().parse::<f64>()) {
                (Some(a), Ok(b)) => a == b,
                _ => false,
            }
        }
        (a, b) => a == b,
    }
}

/// `left in right`: membership in an array. Missing operands and
/// non-array right sides are false.
fn membership(left: &Resolved, right: &Resolved) -> bool {
    let (Some(left), Some(Value::Array(items))) = (left, right) else {
        return false;
    };
    items.iter().any(|item| values_equal(item, left))
}

/// `has(collection, key)`: key presence for objects, element membership
/// for arrays.
fn has(collection: &Resolved, key: &Resolved) -> bool {
    match (collection, key) {
        (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
        (Some(Value::Array(items)), Some(key)) => {
            items.iter().any(|item| values_equal(item, key))
        }
        _ => false,
    }
}

/// JavaScript-like truthiness; Missing is false.
fn truthy(value: &Resolved) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
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
            "steps": {
                "gather": { "response": "news", "count": 5 },
                "score": { "response": 7.0 }
            },
            "inputs": { "name": "alice", "tags": ["rust", "wasm"] },
            "loop": { "iteration": 2 }
        })
    }

    // -------------------------------------------------------------------
    // Comparisons
    // -------------------------------------------------------------------

    #[test]
    fn string_equality_is_exact() {
        let ctx = context();
        assert!(evaluate_bool("steps.gather.response == \"news\"", &ctx).unwrap());
        assert!(!evaluate_bool("steps.gather.response == \"News\"", &ctx).unwrap());
        assert!(evaluate_bool("steps.gather.response != \"other\"", &ctx).unwrap());
    }

    #[test]
    fn leading_dot_paths_are_accepted() {
        let ctx = context();
        assert!(evaluate_bool(".steps.gather.response == \"news\"", &ctx).unwrap());
    }

    #[test]
    fn numeric_comparison_coerces_int_and_float() {
        let ctx = context();
        assert!(evaluate_bool("steps.gather.count == 5.0", &ctx).unwrap());
        assert!(evaluate_bool("steps.score.response == 7", &ctx).unwrap());
        assert!(evaluate_bool("steps.gather.count < 10", &ctx).unwrap());
        assert!(evaluate_bool("steps.gather.count >= 5", &ctx).unwrap());
        assert!(!evaluate_bool("steps.gather.count > 5", &ctx).unwrap());
    }

    #[test]
    fn number_equals_numeric_string() {
        let ctx = context();
        // Template substitution renders numbers unquoted; `3 == "3"` holds.
        assert!(evaluate_bool("3 == \"3\"", &ctx).unwrap());
        assert!(evaluate_bool("steps.gather.count == \"5\"", &ctx).unwrap());
        assert!(!evaluate_bool("3 == \"4\"", &ctx).unwrap());
        assert!(!evaluate_bool("3 == \"abc\"", &ctx).unwrap());
    }

    #[test]
    fn string_ordering_is_lexicographic() {
        let ctx = context();
        assert!(evaluate_bool("inputs.name < \"bob\"", &ctx).unwrap());
    }

    // -------------------------------------------------------------------
    // Missing semantics
    // -------------------------------------------------------------------

    #[test]
    fn comparisons_with_missing_are_false() {
        let ctx = context();
        assert!(!evaluate_bool("steps.absent.response == \"news\"", &ctx).unwrap());
        assert!(!evaluate_bool("steps.absent.response != \"news\"", &ctx).unwrap());
        assert!(!evaluate_bool("steps.absent.count < 10", &ctx).unwrap());
        assert!(!evaluate_bool("steps.absent.a == steps.absent.b", &ctx).unwrap());
    }

    #[test]
    fn bare_missing_path_is_false() {
        let ctx = context();
        assert!(!evaluate_bool("steps.absent.response", &ctx).unwrap());
    }

    #[test]
    fn missing_value_surfaces_as_null() {
        let ctx = context();
        assert_eq!(
            evaluate_value("steps.absent.response", &ctx).unwrap(),
            json!(null)
        );
    }

    // -------------------------------------------------------------------
    // Logical operators
    // -------------------------------------------------------------------

    #[test]
    fn and_or_not() {
        let ctx = context();
        assert!(evaluate_bool(
            "steps.gather.response == \"news\" && steps.gather.count == 5",
            &ctx
        )
        .unwrap());
        assert!(evaluate_bool(
            "steps.gather.response == \"other\" || steps.gather.count == 5",
            &ctx
        )
        .unwrap());
        assert!(evaluate_bool("!(steps.gather.count > 5)", &ctx).unwrap());
        assert!(!evaluate_bool("!steps.gather.response", &ctx).unwrap());
    }

    #[test]
    fn parentheses_group() {
        let ctx = context();
        assert!(evaluate_bool(
            "(steps.gather.count > 1 && steps.gather.count < 10) || false",
            &ctx
        )
        .unwrap());
    }

    // -------------------------------------------------------------------
    // Membership and has
    // -------------------------------------------------------------------

    #[test]
    fn in_operator_over_arrays() {
        let ctx = context();
        assert!(evaluate_bool("\"rust\" in inputs.tags", &ctx).unwrap());
        assert!(!evaluate_bool("\"go\" in inputs.tags", &ctx).unwrap());
        assert!(!evaluate_bool("\"x\" in steps.absent.list", &ctx).unwrap());
        // Right side must be an array.
        assert!(!evaluate_bool("\"a\" in inputs.name", &ctx).unwrap());
    }

    #[test]
    fn has_on_objects_and_arrays() {
        let ctx = context();
        assert!(evaluate_bool("has(steps.gather, \"response\")", &ctx).unwrap());
        assert!(!evaluate_bool("has(steps.gather, \"missing\")", &ctx).unwrap());
        assert!(evaluate_bool("has(inputs.tags, \"wasm\")", &ctx).unwrap());
        assert!(!evaluate_bool("has(steps.absent, \"x\")", &ctx).unwrap());
    }

    // -------------------------------------------------------------------
    // Literals and truthiness
    // -------------------------------------------------------------------

    #[test]
    fn literal_expressions() {
        let ctx = context();
        assert!(evaluate_bool("true", &ctx).unwrap());
        assert!(!evaluate_bool("false", &ctx).unwrap());
        assert!(evaluate_bool("\"3\" == \"3\"", &ctx).unwrap());
        assert!(evaluate_bool("1 < 2", &ctx).unwrap());
        assert!(!evaluate_bool("null", &ctx).unwrap());
    }

    #[test]
    fn truthiness_coercion() {
        let ctx = json!({ "empty": "", "zero": 0, "list": [1] });
        assert!(!evaluate_bool("empty", &ctx).unwrap());
        assert!(!evaluate_bool("zero", &ctx).unwrap());
        assert!(evaluate_bool("list", &ctx).unwrap());
    }

    #[test]
    fn null_literal_equality() {
        let ctx = json!({ "val": null });
        assert!(evaluate_bool("val == null", &ctx).unwrap());
    }

    // -------------------------------------------------------------------
    // Stability and errors
    // -------------------------------------------------------------------

    #[test]
    fn evaluating_twice_yields_identical_results() {
        let ctx = context();
        let expr = "steps.gather.count >= 5 && \"rust\" in inputs.tags";
        assert_eq!(
            evaluate_bool(expr, &ctx).unwrap(),
            evaluate_bool(expr, &ctx).unwrap()
        );
    }

    #[test]
    fn parse_errors_are_reported() {
        let ctx = context();
        assert!(evaluate_bool("steps.gather.count ==", &ctx).is_err());
        assert!(evaluate_bool("&& true", &ctx).is_err());
        assert!(evaluate_bool("\"unterminated", &ctx).is_err());
    }

    #[test]
    fn non_object_context_is_rejected() {
        let ctx = json!("not an object");
        assert!(matches!(
            evaluate_bool("true", &ctx),
            Err(ExpressionError::InvalidContext(_))
        ));
    }
}
