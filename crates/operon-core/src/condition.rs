//! Condition grammar for conditional branch rules.
//!
//! Conditions are parsed into an explicit grammar, `IDENT COMPARATOR
//! LITERAL` plus a unary `IDENT.exists` form, rather than split on
//! substrings, so operands containing comparator characters never produce
//! ambiguous parses. Branch rules pair an expression with a target:
//! `"confidence >= 0.8 => deep_analysis"`.

use serde::{Deserialize, Serialize};

use crate::error::{OperonError, Result};
use crate::state::ExecutionState;

/// Comparison operators, longest-match first during tokenization.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Comparator {
    Ge,
    Le,
    Ne,
    Eq,
    Gt,
    Lt,
}

impl Comparator {
    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Ne => "!=",
            Comparator::Eq => "==",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionExpr {
    /// `key OP literal`
    Compare {
        key: String,
        op: Comparator,
        literal: serde_json::Value,
    },
    /// `key.exists`
    Exists { key: String },
}

/// A branch rule: `<expression> => <target>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRule {
    pub expr: ConditionExpr,
    pub target: String,
}

impl BranchRule {
    pub fn parse(input: &str) -> Result<Self> {
        let (expr_part, target) = input.split_once("=>").ok_or_else(|| {
            OperonError::InvalidCondition(format!("Missing '=>' in branch rule '{}'", input))
        })?;
        let target = target.trim();
        if target.is_empty() {
            return Err(OperonError::InvalidCondition(format!(
                "Empty branch target in '{}'",
                input
            )));
        }
        Ok(Self {
            expr: ConditionExpr::parse(expr_part)?,
            target: target.to_string(),
        })
    }

    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        self.expr.evaluate(state)
    }
}

impl ConditionExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(OperonError::InvalidCondition(
                "Empty condition expression".into(),
            ));
        }

        // Unary form: `key.exists`
        if let Some(key) = input.strip_suffix(".exists") {
            let key = key.trim();
            validate_ident(key)?;
            return Ok(ConditionExpr::Exists {
                key: key.to_string(),
            });
        }

        // Scan left to right; at each position try two-character operators
        // before single-character ones so `>=` never parses as `>`.
        const OPS: [(&str, Comparator); 6] = [
            (">=", Comparator::Ge),
            ("<=", Comparator::Le),
            ("!=", Comparator::Ne),
            ("==", Comparator::Eq),
            (">", Comparator::Gt),
            ("<", Comparator::Lt),
        ];

        for (i, _) in input.char_indices() {
            for (sym, op) in OPS {
                if input[i..].starts_with(sym) {
                    let key = input[..i].trim();
                    let rhs = input[i + sym.len()..].trim();
                    validate_ident(key)?;
                    let literal = parse_literal(rhs)?;
                    return Ok(ConditionExpr::Compare {
                        key: key.to_string(),
                        op,
                        literal,
                    });
                }
            }
        }

        Err(OperonError::InvalidCondition(format!(
            "No comparator found in '{}'",
            input
        )))
    }

    /// Evaluate against run state. Missing keys are false. Ordering
    /// comparators apply to numbers only; equality is structural.
    pub fn evaluate(&self, state: &ExecutionState) -> bool {
        match self {
            ConditionExpr::Exists { key } => state.contains(key),
            ConditionExpr::Compare { key, op, literal } => {
                let Some(value) = state.get(key) else {
                    return false;
                };
                match op {
                    Comparator::Eq => value == literal,
                    Comparator::Ne => value != literal,
                    Comparator::Ge | Comparator::Le | Comparator::Gt | Comparator::Lt => {
                        let (Some(lhs), Some(rhs)) = (value.as_f64(), literal.as_f64()) else {
                            return false;
                        };
                        match op {
                            Comparator::Ge => lhs >= rhs,
                            Comparator::Le => lhs <= rhs,
                            Comparator::Gt => lhs > rhs,
                            Comparator::Lt => lhs < rhs,
                            Comparator::Eq | Comparator::Ne => unreachable!(),
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for ConditionExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionExpr::Exists { key } => write!(f, "{}.exists", key),
            ConditionExpr::Compare { key, op, literal } => {
                write!(f, "{} {} {}", key, op.symbol(), literal)
            }
        }
    }
}

fn validate_ident(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(OperonError::InvalidCondition(format!(
            "Invalid identifier '{}'",
            key
        )))
    }
}

/// Parse a literal: quoted string, boolean, or number.
fn parse_literal(raw: &str) -> Result<serde_json::Value> {
    if raw.is_empty() {
        return Err(OperonError::InvalidCondition(
            "Missing literal after comparator".into(),
        ));
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(serde_json::Value::String(raw[1..raw.len() - 1].to_string()));
    }
    match raw {
        "true" => return Ok(serde_json::Value::Bool(true)),
        "false" => return Ok(serde_json::Value::Bool(false)),
        _ => {}
    }
    raw.parse::<f64>()
        .ok()
        .and_then(|n| serde_json::Number::from_f64(n).map(serde_json::Value::Number))
        .ok_or_else(|| OperonError::InvalidCondition(format!("Invalid literal '{}'", raw)))
}
