use std::fmt;

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Name resolving to the address just past the field the value is encoded in.
pub const HERE: &str = "$";

/// Name resolving to the start address of the most recent instruction.
pub const LAST_INSTRUCTION: &str = "@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ValueOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }
}

/// An operand value that may depend on label addresses. Names are re-resolved
/// on every layout pass; `unresolve` clears them between passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvableValue {
    Literal(i64),
    Name {
        name: String,
        value: Option<i64>,
    },
    Expr {
        op: ValueOp,
        lhs: Box<ResolvableValue>,
        rhs: Box<ResolvableValue>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("value depends on unresolved name '{0}'")]
    Unresolved(String),
    #[error("division by zero")]
    DivideByZero,
    #[error("arithmetic overflow")]
    Overflow,
}

/// Addresses a value's names resolve against during one pass.
pub struct ResolveContext<'a> {
    /// Label name to assigned address.
    pub labels: &'a FxHashMap<String, i64>,
    /// Address just past the field holding this value.
    pub value_end: i64,
    /// Start address of the most recent instruction, once one exists.
    pub instruction_start: Option<i64>,
}

impl ResolvableValue {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name {
            name: name.into(),
            value: None,
        }
    }

    pub fn expr(op: ValueOp, lhs: ResolvableValue, rhs: ResolvableValue) -> Self {
        Self::Expr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::Name { value, .. } => value.is_some(),
            Self::Expr { lhs, rhs, .. } => lhs.is_resolved() && rhs.is_resolved(),
        }
    }

    /// Fills in every name the context knows. Unknown names are left
    /// unresolved, to be reported or recorded as relocations later.
    pub fn resolve(&mut self, ctx: &ResolveContext<'_>) {
        match self {
            Self::Literal(_) => {}
            Self::Name { name, value } => {
                *value = if name == HERE {
                    Some(ctx.value_end)
                } else if name == LAST_INSTRUCTION {
                    ctx.instruction_start
                } else {
                    ctx.labels.get(name).copied()
                };
            }
            Self::Expr { lhs, rhs, .. } => {
                lhs.resolve(ctx);
                rhs.resolve(ctx);
            }
        }
    }

    /// Clears every resolved name so the next pass starts fresh. Label
    /// addresses shift between passes, so stale values must not survive.
    pub fn unresolve(&mut self) {
        match self {
            Self::Literal(_) => {}
            Self::Name { value, .. } => *value = None,
            Self::Expr { lhs, rhs, .. } => {
                lhs.unresolve();
                rhs.unresolve();
            }
        }
    }

    /// Evaluates the value using checked arithmetic.
    pub fn value(&self) -> Result<i64, ValueError> {
        self.evaluate(false)
    }

    /// Evaluates treating every unresolved name as zero. Valid only once the
    /// unresolved names are known to cancel out.
    pub fn value_with_unresolved_zero(&self) -> Result<i64, ValueError> {
        self.evaluate(true)
    }

    fn evaluate(&self, unresolved_as_zero: bool) -> Result<i64, ValueError> {
        match self {
            Self::Literal(value) => Ok(*value),
            Self::Name { name, value } => match value {
                Some(value) => Ok(*value),
                None if unresolved_as_zero => Ok(0),
                None => Err(ValueError::Unresolved(name.clone())),
            },
            Self::Expr { op, lhs, rhs } => {
                let lhs = lhs.evaluate(unresolved_as_zero)?;
                let rhs = rhs.evaluate(unresolved_as_zero)?;
                match op {
                    ValueOp::Add => lhs.checked_add(rhs).ok_or(ValueError::Overflow),
                    ValueOp::Subtract => lhs.checked_sub(rhs).ok_or(ValueError::Overflow),
                    ValueOp::Multiply => lhs.checked_mul(rhs).ok_or(ValueError::Overflow),
                    ValueOp::Divide => {
                        if rhs == 0 {
                            Err(ValueError::DivideByZero)
                        } else {
                            lhs.checked_div(rhs).ok_or(ValueError::Overflow)
                        }
                    }
                }
            }
        }
    }

    /// Visits every name in the value.
    pub fn for_each_name(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::Literal(_) => {}
            Self::Name { name, .. } => f(name),
            Self::Expr { lhs, rhs, .. } => {
                lhs.for_each_name(f);
                rhs.for_each_name(f);
            }
        }
    }

    /// Visits every name the last resolve pass failed to fill in.
    pub fn for_each_unresolved_name(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::Literal(_) => {}
            Self::Name { name, value } => {
                if value.is_none() {
                    f(name);
                }
            }
            Self::Expr { lhs, rhs, .. } => {
                lhs.for_each_unresolved_name(f);
                rhs.for_each_unresolved_name(f);
            }
        }
    }

    /// Net signed count of external names, with subtraction negating its
    /// right side. Multiplication and division require both sides to be free
    /// of externals; otherwise the value has no meaning under relocation and
    /// the result is `None`.
    pub fn external_balance(&self, is_external: &impl Fn(&str) -> bool) -> Option<i64> {
        match self {
            Self::Literal(_) => Some(0),
            Self::Name { name, .. } => Some(i64::from(is_external(name))),
            Self::Expr { op, lhs, rhs } => {
                let lhs = lhs.external_balance(is_external)?;
                let rhs = rhs.external_balance(is_external)?;
                match op {
                    ValueOp::Add => Some(lhs + rhs),
                    ValueOp::Subtract => Some(lhs - rhs),
                    ValueOp::Multiply | ValueOp::Divide => {
                        if lhs == 0 && rhs == 0 {
                            Some(0)
                        } else {
                            None
                        }
                    }
                }
            }
        }
    }

    /// The external name, if the whole value is exactly one bare name.
    pub fn as_bare_name(&self) -> Option<&str> {
        match self {
            Self::Name { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for ResolvableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Name { name, .. } => write!(f, "{name}"),
            Self::Expr { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: i64) -> ResolvableValue {
        ResolvableValue::Literal(value)
    }

    #[test]
    fn resolves_labels_and_position_names() {
        let mut labels = FxHashMap::default();
        labels.insert("loop".to_string(), 0x20);
        let ctx = ResolveContext {
            labels: &labels,
            value_end: 0x10,
            instruction_start: Some(0x0C),
        };

        let mut value = ResolvableValue::expr(
            ValueOp::Subtract,
            ResolvableValue::name("loop"),
            ResolvableValue::name(HERE),
        );
        value.resolve(&ctx);
        assert_eq!(value.value(), Ok(0x10));

        let mut at = ResolvableValue::name(LAST_INSTRUCTION);
        at.resolve(&ctx);
        assert_eq!(at.value(), Ok(0x0C));
    }

    #[test]
    fn unresolve_clears_names_but_not_literals() {
        let mut labels = FxHashMap::default();
        labels.insert("x".to_string(), 7);
        let ctx = ResolveContext {
            labels: &labels,
            value_end: 0,
            instruction_start: None,
        };

        let mut value = ResolvableValue::expr(ValueOp::Add, ResolvableValue::name("x"), lit(1));
        value.resolve(&ctx);
        assert_eq!(value.value(), Ok(8));

        value.unresolve();
        assert_eq!(value.value(), Err(ValueError::Unresolved("x".to_string())));
    }

    #[test]
    fn checked_arithmetic() {
        let div = ResolvableValue::expr(ValueOp::Divide, lit(1), lit(0));
        assert_eq!(div.value(), Err(ValueError::DivideByZero));

        let mul = ResolvableValue::expr(ValueOp::Multiply, lit(i64::MAX), lit(2));
        assert_eq!(mul.value(), Err(ValueError::Overflow));
    }

    #[test]
    fn external_balance_cancels_subtraction() {
        let is_external = |name: &str| name.contains('.');

        // util.a - util.b nets to zero.
        let cancelled = ResolvableValue::expr(
            ValueOp::Subtract,
            ResolvableValue::name("util.a"),
            ResolvableValue::name("util.b"),
        );
        assert_eq!(cancelled.external_balance(&is_external), Some(0));

        // util.a + 4 leaves one dangling external term.
        let dangling =
            ResolvableValue::expr(ValueOp::Add, ResolvableValue::name("util.a"), lit(4));
        assert_eq!(dangling.external_balance(&is_external), Some(1));

        // Externals under multiplication cannot be relocated.
        let scaled =
            ResolvableValue::expr(ValueOp::Multiply, ResolvableValue::name("util.a"), lit(2));
        assert_eq!(scaled.external_balance(&is_external), None);
    }

    #[test]
    fn net_zero_value_evaluates_with_externals_as_zero() {
        let is_external = |name: &str| name.contains('.');
        let value = ResolvableValue::expr(
            ValueOp::Add,
            ResolvableValue::expr(
                ValueOp::Subtract,
                ResolvableValue::name("util.a"),
                ResolvableValue::name("util.b"),
            ),
            lit(12),
        );
        assert_eq!(value.external_balance(&is_external), Some(0));
        assert_eq!(value.value_with_unresolved_zero(), Ok(12));
    }
}
