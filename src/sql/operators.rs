use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    /// String concatenation
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal | BinaryOp::NotEqual
                | BinaryOp::LessThan | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan | BinaryOp::GreaterThanOrEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo
        )
    }

    /// Operator giving the same result with swapped operands.
    pub fn mirror(&self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Equal => Some(BinaryOp::Equal),
            BinaryOp::NotEqual => Some(BinaryOp::NotEqual),
            BinaryOp::LessThan => Some(BinaryOp::GreaterThan),
            BinaryOp::LessThanOrEqual => Some(BinaryOp::GreaterThanOrEqual),
            BinaryOp::GreaterThan => Some(BinaryOp::LessThan),
            BinaryOp::GreaterThanOrEqual => Some(BinaryOp::LessThanOrEqual),
            BinaryOp::Add | BinaryOp::Multiply | BinaryOp::And | BinaryOp::Or => Some(*self),
            _ => None,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "<>",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Debug for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryOp({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
    /// Cast to the expression's type mapping
    Convert,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrored_comparisons() {
        assert_eq!(BinaryOp::LessThan.mirror(), Some(BinaryOp::GreaterThan));
        assert_eq!(BinaryOp::Equal.mirror(), Some(BinaryOp::Equal));
        assert_eq!(BinaryOp::Subtract.mirror(), None);
        assert!(BinaryOp::GreaterThanOrEqual.is_comparison());
        assert!(!BinaryOp::Concat.is_arithmetic());
    }
}
