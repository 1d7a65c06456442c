//! A small interpreter for the subset of CEL used by selectors.
//!
//! Supported: literals (int, uint, double, string, bool, null, lists,
//! maps), field selection, indexing, `== != < <= > >= in`, `&& || !`,
//! arithmetic, `?:`, the `has`, `exists`, `all` and `exists_one` macros,
//! and the functions `size`, `startsWith`, `endsWith`, `contains`,
//! `matches`, `lowerAscii`, `upperAscii`, `trim`, `string`, `int`, `double`
//! and `timestamp`.

mod eval;
mod lexer;
mod parser;

pub use eval::{Activation, CelValue};

use super::{SelectorError, Subject};

/// A parsed CEL expression ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CelProgram {
    source: String,
    expr: parser::Expr,
}

impl CelProgram {
    pub fn compile(source: &str) -> Result<Self, SelectorError> {
        Ok(Self {
            source: source.to_string(),
            expr: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a raw value.
    pub fn evaluate(&self, activation: &Activation) -> Result<CelValue, SelectorError> {
        eval::evaluate(&self.expr, activation)
    }

    /// Evaluate as a predicate with `subject` bound under its kind name.
    /// A non-bool result is an evaluation error.
    pub fn evaluate_subject(&self, subject: Subject<'_>) -> Result<bool, SelectorError> {
        let activation = Activation::new().bind(subject.binding(), subject.to_cel());
        match self.evaluate(&activation)? {
            CelValue::Bool(b) => Ok(b),
            other => Err(SelectorError::Eval(format!(
                "selector {:?} returned {} instead of bool",
                self.source,
                other.type_name()
            ))),
        }
    }
}
