//! Condition expression language for workflow trees.
//!
//! A deliberately small grammar — literals, dotted lookups on `result` and
//! `context`, comparisons, `and`/`or`/`not`, parentheses, and the
//! `subtasks.includes("name")` predicate. Anything that fails to parse or
//! evaluate makes the condition `false`.

use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    Bool(bool),
    Number(f64),
    Str(String),
    Path(Vec<String>),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    if chars.get(i + 2) == Some(&'=') {
                        return Err("invalid operator '==='".to_string());
                    }
                    tokens.push(Token::Cmp(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err("single '=' is not a valid operator".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                } else {
                    return Err("unexpected '!'".to_string());
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '-' => {
                // Only valid as a numeric sign.
                if chars.get(i + 1).map(|c| c.is_ascii_digit()) == Some(true) {
                    let (num, next) = lex_number(&chars, i + 1)?;
                    tokens.push(Token::Number(-num));
                    i = next;
                } else {
                    return Err("unexpected '-'".to_string());
                }
            }
            _ if c.is_ascii_digit() => {
                let (num, next) = lex_number(&chars, i)?;
                if chars.get(next).map(|c| c.is_alphanumeric() || *c == '_') == Some(true) {
                    return Err(format!("identifier cannot start with a digit near '{}'", num));
                }
                tokens.push(Token::Number(num));
                i = next;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let (path, next) = lex_path(&chars, i)?;
                i = next;
                tokens.push(match path.as_slice() {
                    [single] if single == "and" => Token::And,
                    [single] if single == "or" => Token::Or,
                    [single] if single == "not" => Token::Not,
                    [single] if single == "true" => Token::Bool(true),
                    [single] if single == "false" => Token::Bool(false),
                    _ => Token::Path(path),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut i = start;
    let mut saw_dot = false;
    let mut text = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            text.push(c);
            i += 1;
        } else if c == '.' && !saw_dot && chars.get(i + 1).map(|n| n.is_ascii_digit()) == Some(true)
        {
            saw_dot = true;
            text.push(c);
            i += 1;
        } else {
            break;
        }
    }
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| format!("invalid number '{}'", text))
}

fn lex_path(chars: &[char], start: usize) -> Result<(Vec<String>, usize), String> {
    let mut i = start;
    let mut segments = Vec::new();
    loop {
        let mut segment = String::new();
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
            segment.push(chars[i]);
            i += 1;
        }
        if segment.is_empty() {
            return Err("empty path segment".to_string());
        }
        segments.push(segment);
        if chars.get(i) == Some(&'.') {
            if chars.get(i + 1) == Some(&'.') {
                return Err("consecutive dots in path".to_string());
            }
            match chars.get(i + 1) {
                Some(c) if c.is_alphabetic() || *c == '_' => i += 1,
                _ => return Err("path must not end with a dot".to_string()),
            }
        } else {
            // Hyphenated identifiers are rejected at the '-' branch of the
            // tokenizer; nothing more to do here.
            break;
        }
    }
    Ok((segments, i))
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Number(f64),
    Str(String),
    Path(Vec<String>),
    Includes(String),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos:    usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(format!("expected {:?}, got {:?}", expected, other)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            // `not not x` is rejected to match the structural rules.
            if self.peek() == Some(&Token::Not) {
                return Err("repeated 'not' operator".to_string());
            }
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.advance();
            if matches!(self.peek(), Some(Token::Cmp(_))) {
                return Err("repeated comparison operator".to_string());
            }
            let right = self.parse_primary()?;
            return Ok(Expr::Cmp(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Path(path)) => {
                if path.len() == 2 && path[0] == "subtasks" && path[1] == "includes" {
                    self.expect(&Token::LParen)?;
                    let name = match self.advance() {
                        Some(Token::Str(s)) => s,
                        other => {
                            return Err(format!(
                                "subtasks.includes expects a string literal, got {:?}",
                                other
                            ))
                        }
                    };
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Includes(name));
                }
                Ok(Expr::Path(path))
            }
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

/// Parse a condition expression. Errors cover unbalanced parentheses and
/// quotes, repeated operators, digit-led or hyphenated identifiers, and any
/// other invalid token sequence.
pub fn parse(input: &str) -> Result<Expr, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty expression".to_string());
    }
    let tokens = tokenize(trimmed)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        ));
    }
    Ok(expr)
}

/// Structural validity check used by the parser's node validation.
pub fn check_syntax(input: &str) -> Result<(), String> {
    parse(input).map(|_| ())
}

/// Evaluation environment: node results by id, context variables, and the
/// names visible to `subtasks.includes`.
pub struct EvalEnv<'a> {
    pub results:   &'a HashMap<String, Value>,
    pub variables: &'a HashMap<String, Value>,
}

impl<'a> EvalEnv<'a> {
    fn lookup(&self, path: &[String]) -> Result<Value, String> {
        let (root, rest) = path
            .split_first()
            .ok_or_else(|| "empty path".to_string())?;
        let (source, rest) = match root.as_str() {
            "result" => {
                let (id, rest) = rest
                    .split_first()
                    .ok_or_else(|| "result reference needs a node id".to_string())?;
                let value = self
                    .results
                    .get(id)
                    .ok_or_else(|| format!("no result for node '{}'", id))?;
                (value.clone(), rest)
            }
            "context" => {
                let (name, rest) = rest
                    .split_first()
                    .ok_or_else(|| "context reference needs a variable name".to_string())?;
                let value = self
                    .variables
                    .get(name)
                    .ok_or_else(|| format!("no context variable '{}'", name))?;
                (value.clone(), rest)
            }
            other => return Err(format!("unknown root '{}'", other)),
        };

        let mut current = source;
        for field in rest {
            current = match current.get(field) {
                Some(v) => v.clone(),
                None => return Err(format!("missing field '{}' in path", field)),
            };
        }
        Ok(current)
    }

    fn subtask_included(&self, name: &str) -> bool {
        self.results
            .values()
            .any(|result| result.to_string().contains(name))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, String> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => Ok(ordering == Some(std::cmp::Ordering::Equal)),
        CmpOp::Ne => match ordering {
            Some(ord) => Ok(ord != std::cmp::Ordering::Equal),
            // Different types are simply unequal.
            None => Ok(true),
        },
        other => {
            let ord = ordering.ok_or_else(|| {
                format!("cannot compare {:?} {} {:?}", left, other.symbol(), right)
            })?;
            Ok(match other {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

pub fn evaluate(expr: &Expr, env: &EvalEnv<'_>) -> Result<Value, String> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(serde_json::json!(n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Path(path) => env.lookup(path),
        Expr::Includes(name) => Ok(Value::Bool(env.subtask_included(name))),
        Expr::Cmp(left, op, right) => {
            let l = evaluate(left, env)?;
            let r = evaluate(right, env)?;
            Ok(Value::Bool(compare(&l, *op, &r)?))
        }
        Expr::And(left, right) => {
            if !truthy(&evaluate(left, env)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(right, env)?)))
        }
        Expr::Or(left, right) => {
            if truthy(&evaluate(left, env)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(right, env)?)))
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, env)?))),
    }
}

/// Parse and evaluate a condition. Any failure — parse or evaluation —
/// yields `false`, preserving the engine's observable behavior.
pub fn evaluate_condition(condition: &str, env: &EvalEnv<'_>) -> bool {
    match parse(condition) {
        Ok(expr) => match evaluate(&expr, env) {
            Ok(value) => truthy(&value),
            Err(err) => {
                tracing::warn!(condition, error = %err, "condition evaluation failed");
                false
            }
        },
        Err(err) => {
            tracing::warn!(condition, error = %err, "condition parse failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env_with(results: Vec<(&str, Value)>, vars: Vec<(&str, Value)>) -> (HashMap<String, Value>, HashMap<String, Value>) {
        (
            results.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        )
    }

    #[test]
    fn parses_comparisons_and_logic() {
        assert!(parse("result.t1.count > 3 and context.mode == 'fast'").is_ok());
        assert!(parse("(true or false) and not false").is_ok());
        assert!(parse("subtasks.includes('summarize')").is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("").is_err());
        assert!(parse("a === b").is_err());
        assert!(parse("a == == b").is_err());
        assert!(parse("true and and false").is_err());
        assert!(parse("not not true").is_err());
        assert!(parse("(true").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("result..t1").is_err());
        assert!(parse("1abc == 2").is_err());
        assert!(parse("my-var == 2").is_err());
    }

    #[test]
    fn evaluates_result_paths() {
        let (results, vars) = env_with(
            vec![("t1", json!({"count": 5, "status": "done"}))],
            vec![],
        );
        let env = EvalEnv { results: &results, variables: &vars };
        assert!(evaluate_condition("result.t1.count > 3", &env));
        assert!(evaluate_condition("result.t1.status == 'done'", &env));
        assert!(!evaluate_condition("result.t1.count < 2", &env));
    }

    #[test]
    fn evaluates_context_paths() {
        let (results, vars) = env_with(vec![], vec![("retries", json!(2))]);
        let env = EvalEnv { results: &results, variables: &vars };
        assert!(evaluate_condition("context.retries <= 2", &env));
        assert!(!evaluate_condition("context.retries == 3", &env));
    }

    #[test]
    fn failures_evaluate_false() {
        let (results, vars) = env_with(vec![], vec![]);
        let env = EvalEnv { results: &results, variables: &vars };
        // Missing reference, type mismatch, parse error — all false.
        assert!(!evaluate_condition("result.missing.field == 1", &env));
        assert!(!evaluate_condition("'a' < 1", &env));
        assert!(!evaluate_condition("not not true", &env));
    }

    #[test]
    fn subtasks_includes_predicate() {
        let (results, vars) = env_with(vec![("t1", json!({"subtask": "summarize_text"}))], vec![]);
        let env = EvalEnv { results: &results, variables: &vars };
        assert!(evaluate_condition("subtasks.includes('summarize')", &env));
        assert!(!evaluate_condition("subtasks.includes('translate')", &env));
    }

    #[test]
    fn short_circuit_skips_bad_operand() {
        let (results, vars) = env_with(vec![], vec![]);
        let env = EvalEnv { results: &results, variables: &vars };
        // Right side would fail to resolve, but the left decides.
        assert!(!evaluate_condition("false and result.missing.x == 1", &env));
        assert!(evaluate_condition("true or result.missing.x == 1", &env));
    }

    #[test]
    fn negative_numbers_parse() {
        let (results, vars) = env_with(vec![("t", json!({"delta": -3}))], vec![]);
        let env = EvalEnv { results: &results, variables: &vars };
        assert!(evaluate_condition("result.t.delta < -1", &env));
    }
}
