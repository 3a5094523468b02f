//! CALCULATE formulas.
//!
//! A formula is an arithmetic expression over `{campo}` references, for
//! example `{neto} * {alicuota} / 100`. References are rewritten into
//! evalexpr variables once at load; each evaluation binds them from the
//! field store.

use std::fmt;

use evalexpr::{eval_number_with_context, ContextWithMutableVariables, HashMapContext, Value};

use crate::error::{ActionError, RuleError};

const MAX_LENGTH: usize = 1024;
const MAX_NESTING: usize = 32;
const VARIABLE_PREFIX: &str = "__campo";

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expression: String,
    references: Vec<String>,
}

impl Formula {
    /// Rewrites and validates `source`.
    ///
    /// Integer literals are widened to floats so `1 / 2` is not integer
    /// division. Validation evaluates the expression with every reference
    /// bound to 1.0, which rejects syntax errors, unknown identifiers and
    /// non-numeric results.
    pub fn parse(source: &str) -> Result<Self, RuleError> {
        let invalid = |message: String| RuleError::invalid(format!("formula `{}`: {}", source, message));

        if source.trim().is_empty() {
            return Err(invalid("empty expression".to_string()));
        }
        if source.len() > MAX_LENGTH {
            return Err(invalid(format!("longer than {} characters", MAX_LENGTH)));
        }

        let mut expression = String::with_capacity(source.len() + 16);
        let mut references: Vec<String> = Vec::new();
        let mut depth = 0usize;
        let mut chars = source.char_indices().peekable();

        while let Some((at, c)) = chars.next() {
            match c {
                '{' => {
                    let mut path = String::new();
                    let mut closed = false;
                    for (_, next) in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        path.push(next);
                    }
                    if !closed {
                        return Err(invalid("unterminated field reference".to_string()));
                    }
                    let path = path.trim();
                    if path.is_empty() {
                        return Err(invalid("empty field reference".to_string()));
                    }
                    let slot = match references.iter().position(|known| known == path) {
                        Some(slot) => slot,
                        None => {
                            references.push(path.to_string());
                            references.len() - 1
                        }
                    };
                    expression.push_str(&variable(slot));
                }
                '(' => {
                    depth += 1;
                    if depth > MAX_NESTING {
                        return Err(invalid(format!("nested deeper than {} levels", MAX_NESTING)));
                    }
                    expression.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    expression.push(c);
                }
                '0'..='9' if !follows_identifier(&source[..at]) => {
                    let mut literal = String::from(c);
                    while let Some(&(_, next)) = chars.peek() {
                        if next.is_ascii_digit() || next == '.' {
                            literal.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    expression.push_str(&literal);
                    if !literal.contains('.') {
                        expression.push_str(".0");
                    }
                }
                _ => expression.push(c),
            }
        }

        let formula = Self {
            source: source.to_string(),
            expression,
            references,
        };
        let mut context = HashMapContext::new();
        for slot in 0..formula.references.len() {
            context
                .set_value(variable(slot), Value::Float(1.0))
                .map_err(|err| invalid(err.to_string()))?;
        }
        eval_number_with_context(&formula.expression, &context).map_err(|err| invalid(err.to_string()))?;
        Ok(formula)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Distinct field references in order of first appearance.
    pub fn references(&self) -> Vec<&str> {
        self.references.iter().map(String::as_str).collect()
    }

    /// Evaluates the formula. `resolve` returns `Ok(None)` for a missing
    /// reference, which counts as zero. A non-finite result is reported as
    /// a division by zero.
    pub fn evaluate<F>(&self, resolve: F) -> Result<f64, ActionError>
    where
        F: Fn(&str) -> Result<Option<f64>, ActionError>,
    {
        let mut context = HashMapContext::new();
        for (slot, path) in self.references.iter().enumerate() {
            let value = resolve(path)?.unwrap_or(0.0);
            context
                .set_value(variable(slot), Value::Float(value))
                .map_err(|err| self.failure(err))?;
        }

        let value = eval_number_with_context(&self.expression, &context).map_err(|err| self.failure(err))?;
        if !value.is_finite() {
            return Err(ActionError::DivisionByZero {
                formula: self.source.clone(),
            });
        }
        Ok(value)
    }

    fn failure(&self, err: evalexpr::EvalexprError) -> ActionError {
        ActionError::Formula {
            formula: self.source.clone(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn variable(slot: usize) -> String {
    format!("{}{}", VARIABLE_PREFIX, slot)
}

/// Whether a digit at this point continues an identifier (`max2`) or a
/// literal already being read.
fn follows_identifier(before: &str) -> bool {
    before
        .chars()
        .next_back()
        .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '.')
}
