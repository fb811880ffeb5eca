//! Builtin tools that run locally inside the runtime.
//!
//! Two tools ship with every registry: `reasoning` and `calculator`. The
//! calculator evaluates through a constrained numeric AST; anything that is
//! not a number, parenthesis or one of `+ - * / ^` is rejected.

use serde_json::{json, Value};

use super::definition::{ToolCategory, ToolDefinition, ToolHealth, ToolType};
use crate::error::{OrchestratorError, Result};

pub const BUILTIN_SERVICE: &str = "builtin";

pub fn builtin_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            BUILTIN_SERVICE,
            "reasoning",
            ToolType::Builtin,
            ToolCategory::Reasoning,
        )
        .with_display_name("Reasoning")
        .with_description("Basic reasoning and logical analysis")
        .with_health(ToolHealth::Healthy)
        .with_schema(json!({
            "type": "function",
            "function": {
                "name": "reasoning",
                "description": "Perform logical reasoning and analysis",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The question or situation to reason about"
                        }
                    },
                    "required": ["query"]
                }
            }
        })),
        ToolDefinition::new(
            BUILTIN_SERVICE,
            "calculator",
            ToolType::Builtin,
            ToolCategory::Calculation,
        )
        .with_display_name("Calculator")
        .with_description("Basic arithmetic evaluation")
        .with_health(ToolHealth::Healthy)
        .with_schema(json!({
            "type": "function",
            "function": {
                "name": "calculator",
                "description": "Evaluate an arithmetic expression",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "expression": {
                            "type": "string",
                            "description": "Arithmetic expression to evaluate"
                        }
                    },
                    "required": ["expression"]
                }
            }
        })),
    ]
}

/// Dispatch a builtin tool call locally.
pub fn run_builtin(tool_name: &str, params: &Value) -> Result<Value> {
    match tool_name {
        "reasoning" => {
            let query = params
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(json!({
                "analysis": format!("Structured analysis of: {query}"),
                "query": query,
            }))
        }
        "calculator" => {
            let expression = params
                .get("expression")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    OrchestratorError::UpstreamFailure(
                        "calculator requires an 'expression' parameter".into(),
                    )
                })?;
            let value = evaluate_expression(expression)?;
            Ok(json!({ "expression": expression, "result": value }))
        }
        other => Err(OrchestratorError::UpstreamFailure(format!(
            "unknown builtin tool '{other}'"
        ))),
    }
}

/// Evaluate an arithmetic expression over a constrained AST: numeric
/// literals, unary minus, `+ - * / ^` and parentheses. `*` and `/` also
/// accept their `×` and `÷` spellings.
pub fn evaluate_expression(expression: &str) -> Result<f64> {
    let mut parser = ExprParser::new(expression);
    let value = parser.parse_sum()?;
    parser.skip_whitespace();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("trailing input after expression"));
    }
    Ok(value)
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> OrchestratorError {
        OrchestratorError::UpstreamFailure(format!(
            "invalid expression at position {}: {message}",
            self.pos
        ))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.get(self.pos).copied()
    }

    fn parse_sum(&mut self) -> Result<f64> {
        let mut value = self.parse_product()?;
        while let Some(op) = self.peek() {
            match op {
                '+' => {
                    self.pos += 1;
                    value += self.parse_product()?;
                }
                '-' => {
                    self.pos += 1;
                    value -= self.parse_product()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_product(&mut self) -> Result<f64> {
        let mut value = self.parse_power()?;
        while let Some(op) = self.peek() {
            match op {
                '*' | '×' => {
                    self.pos += 1;
                    value *= self.parse_power()?;
                }
                '/' | '÷' => {
                    self.pos += 1;
                    let divisor = self.parse_power()?;
                    if divisor == 0.0 {
                        return Err(self.error("division by zero"));
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // Right-associative: 2^3^2 == 2^(3^2).
    fn parse_power(&mut self) -> Result<f64> {
        let base = self.parse_unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            let exponent = self.parse_power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<f64> {
        if self.peek() == Some('-') {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<f64> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.parse_sum()?;
                if self.peek() != Some(')') {
                    return Err(self.error("expected closing parenthesis"));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) => Err(self.error(&format!("unexpected character '{c}'"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_number(&mut self) -> Result<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.chars.len()
            && (self.chars[self.pos].is_ascii_digit() || self.chars[self.pos] == '.')
        {
            self.pos += 1;
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal
            .parse::<f64>()
            .map_err(|_| self.error(&format!("malformed number '{literal}'")))
    }
}
