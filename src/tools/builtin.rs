use async_trait::async_trait;
use serde_json::Value;

use super::{OperationSchema, ParamSpec, Tool};

fn number_param(description: &str) -> ParamSpec {
    ParamSpec::new("number", true, description)
}

fn get_f64(params: &Value, name: &str) -> Result<f64, String> {
    params
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("parameter '{}' must be a number", name))
}

/// Returns integers as integers so `5 + 3` yields `8`, not `8.0`.
fn number_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        Value::from(x as i64)
    } else {
        Value::from(x)
    }
}

/// Arithmetic over two operands. The default operation is `add`.
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Performs basic arithmetic on two numeric operands"
    }

    fn supported_operations(&self) -> Vec<String> {
        ["add", "subtract", "multiply", "divide"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn validate_params(&self, operation: &str, params: &Value) -> Result<(), String> {
        match self.operation_schema(operation) {
            Some(schema) => schema.check_params(params),
            None => Err(format!("unknown operation '{}'", operation)),
        }
    }

    async fn run(&self, operation: &str, params: &Value) -> Result<Value, String> {
        let a = get_f64(params, "a")?;
        let b = get_f64(params, "b")?;
        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err("division by zero".to_string());
                }
                a / b
            }
            other => return Err(format!("unknown operation '{}'", other)),
        };
        Ok(number_value(result))
    }

    fn operation_schema(&self, operation: &str) -> Option<OperationSchema> {
        let description = match operation {
            "add" => "Add two numbers",
            "subtract" => "Subtract b from a",
            "multiply" => "Multiply two numbers",
            "divide" => "Divide a by b; fails on zero divisor",
            _ => return None,
        };
        Some(
            OperationSchema::new(description)
                .param("a", number_param("First operand"))
                .param("b", number_param("Second operand")),
        )
    }
}

/// Small string-manipulation tool used by demos and workflow tests.
pub struct TextTool;

impl TextTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TextTool {
    fn name(&self) -> &str {
        "text"
    }

    fn description(&self) -> &str {
        "String utilities: casing, concatenation, length"
    }

    fn supported_operations(&self) -> Vec<String> {
        ["uppercase", "lowercase", "concat", "length"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn validate_params(&self, operation: &str, params: &Value) -> Result<(), String> {
        match self.operation_schema(operation) {
            Some(schema) => schema.check_params(params),
            None => Err(format!("unknown operation '{}'", operation)),
        }
    }

    async fn run(&self, operation: &str, params: &Value) -> Result<Value, String> {
        match operation {
            "uppercase" => {
                let text = require_str(params, "text")?;
                Ok(Value::from(text.to_uppercase()))
            }
            "lowercase" => {
                let text = require_str(params, "text")?;
                Ok(Value::from(text.to_lowercase()))
            }
            "concat" => {
                let left = require_str(params, "left")?;
                let right = require_str(params, "right")?;
                Ok(Value::from(format!("{}{}", left, right)))
            }
            "length" => {
                let text = require_str(params, "text")?;
                Ok(Value::from(text.chars().count() as u64))
            }
            other => Err(format!("unknown operation '{}'", other)),
        }
    }

    fn operation_schema(&self, operation: &str) -> Option<OperationSchema> {
        let text = |desc: &str| ParamSpec::new("string", true, desc);
        match operation {
            "uppercase" => Some(
                OperationSchema::new("Convert text to upper case")
                    .param("text", text("Input text")),
            ),
            "lowercase" => Some(
                OperationSchema::new("Convert text to lower case")
                    .param("text", text("Input text")),
            ),
            "concat" => Some(
                OperationSchema::new("Concatenate two strings")
                    .param("left", text("Left part"))
                    .param("right", text("Right part")),
            ),
            "length" => Some(
                OperationSchema::new("Count characters in text")
                    .param("text", text("Input text")),
            ),
            _ => None,
        }
    }
}

fn require_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, String> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("parameter '{}' must be a string", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn calculator_add_keeps_integers() {
        let calc = CalculatorTool::new();
        let out = calc.run("add", &json!({"a": 5, "b": 3})).await.unwrap();
        assert_eq!(out, json!(8));
    }

    #[tokio::test]
    async fn calculator_divide_by_zero_fails() {
        let calc = CalculatorTool::new();
        let err = calc.run("divide", &json!({"a": 1, "b": 0})).await.unwrap_err();
        assert!(err.contains("division by zero"));
    }

    #[tokio::test]
    async fn calculator_divide_fraction() {
        let calc = CalculatorTool::new();
        let out = calc.run("divide", &json!({"a": 7, "b": 2})).await.unwrap();
        assert_eq!(out, json!(3.5));
    }

    #[test]
    fn calculator_default_operation_is_add() {
        assert_eq!(CalculatorTool::new().default_operation().as_deref(), Some("add"));
    }

    #[tokio::test]
    async fn text_operations() {
        let text = TextTool::new();
        assert_eq!(
            text.run("uppercase", &json!({"text": "abc"})).await.unwrap(),
            json!("ABC")
        );
        assert_eq!(
            text.run("concat", &json!({"left": "a", "right": "b"})).await.unwrap(),
            json!("ab")
        );
        assert_eq!(
            text.run("length", &json!({"text": "héllo"})).await.unwrap(),
            json!(5)
        );
    }
}
