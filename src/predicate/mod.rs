//! # Predicates
//!
//! Typed boolean filters over entity fields, built with combinators and
//! compiled into the backend's filter grammar.
//!
//! ```
//! use tablerust_rs::predicate::Field;
//!
//! let filter = Field::partition_key()
//!     .equals("Political")
//!     .and(Field::int32("NumberOfParticipants").gt(10) | Field::boolean("Positive").is_true());
//! assert_eq!(
//!     filter.compile().unwrap(),
//!     "((PartitionKey eq 'Political') and ((NumberOfParticipants gt 10) or (Positive eq true)))"
//! );
//! ```

mod compiler;
pub mod literal;

pub use compiler::{compile, OPERATOR_TABLE};

use crate::backend::{compare_values, ComparisonOp};
use crate::error::{Result, StorageError};
use crate::model::{EdmType, Entity, Value, PARTITION_KEY, ROW_KEY, TIMESTAMP};
use std::ops::{BitAnd, BitOr, Not};

/// Binary operators a predicate tree may carry.
///
/// Only comparisons and the two connectives have a filter translation; the
/// arithmetic operators exist so trees built elsewhere can be rejected
/// with a precise error instead of being passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    pub fn comparison(self) -> Option<ComparisonOp> {
        Some(match self {
            BinaryOp::Eq => ComparisonOp::Eq,
            BinaryOp::NotEq => ComparisonOp::Ne,
            BinaryOp::Gt => ComparisonOp::Gt,
            BinaryOp::GtEq => ComparisonOp::Ge,
            BinaryOp::Lt => ComparisonOp::Lt,
            BinaryOp::LtEq => ComparisonOp::Le,
            _ => return None,
        })
    }

    pub fn is_connective(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// A named field, optionally carrying its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub ty: Option<EdmType>,
}

macro_rules! typed_field {
    ($($fn_name:ident => $ty:ident),* $(,)?) => {
        $(
            pub fn $fn_name(name: impl Into<String>) -> Self {
                Self::typed(name, EdmType::$ty)
            }
        )*
    };
}

impl Field {
    pub fn typed(name: impl Into<String>, ty: EdmType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
        }
    }

    /// A field whose type is taken from the literal it is compared with.
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
        }
    }

    typed_field! {
        string => String,
        boolean => Boolean,
        int32 => Int32,
        int64 => Int64,
        double => Double,
        datetime => DateTime,
        guid => Guid,
        binary => Binary,
    }

    pub fn partition_key() -> Self {
        Self::string(PARTITION_KEY)
    }

    pub fn row_key() -> Self {
        Self::string(ROW_KEY)
    }

    pub fn timestamp() -> Self {
        Self::datetime(TIMESTAMP)
    }

    fn compare(&self, op: BinaryOp, value: impl Into<Value>) -> Predicate {
        Predicate::binary(
            Predicate::Field(self.clone()),
            op,
            Predicate::Literal(value.into()),
        )
    }

    pub fn equals(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::Eq, value)
    }

    pub fn not_equals(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::NotEq, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::Gt, value)
    }

    pub fn ge(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::GtEq, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::Lt, value)
    }

    pub fn le(&self, value: impl Into<Value>) -> Predicate {
        self.compare(BinaryOp::LtEq, value)
    }

    /// The field itself as a boolean term; only valid for boolean fields.
    pub fn is_true(&self) -> Predicate {
        Predicate::Field(self.clone())
    }
}

/// Immutable predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Field(Field),
    Literal(Value),
    Binary {
        left: Box<Predicate>,
        op: BinaryOp,
        right: Box<Predicate>,
    },
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn binary(left: Predicate, op: BinaryOp, right: Predicate) -> Self {
        Predicate::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Predicate::Literal(value.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::binary(self, BinaryOp::And, other)
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::binary(self, BinaryOp::Or, other)
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Render this predicate as a backend filter string.
    pub fn compile(&self) -> Result<String> {
        compile(self)
    }

    /// Decide whether `entity` satisfies the predicate, with the same
    /// typing rules the backend applies to the compiled filter. Datetime
    /// properties are compared at the precision the backend stores.
    pub fn evaluate(&self, entity: &Entity) -> Result<bool> {
        match self {
            Predicate::Binary { left, op, right } if op.is_connective() => {
                let l = left.evaluate(entity)?;
                let r = right.evaluate(entity)?;
                Ok(if *op == BinaryOp::And { l && r } else { l || r })
            }
            Predicate::Binary { left, op, right } => {
                let cmp = op.comparison().ok_or_else(|| unsupported_operator(*op))?;
                let (field, literal, field_first) = comparison_operands(left, right)?;
                let value = literal::prepare(literal, field.ty)?;
                let Some(actual) = entity.property(&field.name).map(literal::stored_form) else {
                    return Ok(false);
                };
                Ok(if field_first {
                    compare_values(cmp, &actual, &value)
                } else {
                    compare_values(cmp, &value, &actual)
                })
            }
            Predicate::Not(inner) => inner.evaluate(entity).map(|b| !b),
            Predicate::Field(field) => {
                boolean_field(field)?;
                Ok(entity.property(&field.name).as_deref() == Some(&Value::Bool(true)))
            }
            Predicate::Literal(value) => Err(StorageError::UnsupportedPredicate(format!(
                "constant {} literal is not a filter",
                value.data_type()
            ))),
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        self.and(rhs)
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        self.or(rhs)
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        self.negate()
    }
}

pub(crate) fn unsupported_operator(op: BinaryOp) -> StorageError {
    StorageError::UnsupportedPredicate(format!("operator {op:?} has no filter translation"))
}

/// Split a comparison into its field and literal side.
pub(crate) fn comparison_operands<'a>(
    left: &'a Predicate,
    right: &'a Predicate,
) -> Result<(&'a Field, &'a Value, bool)> {
    match (left, right) {
        (Predicate::Field(f), Predicate::Literal(v)) => Ok((f, v, true)),
        (Predicate::Literal(v), Predicate::Field(f)) => Ok((f, v, false)),
        (Predicate::Field(a), Predicate::Field(b)) => Err(StorageError::UnsupportedPredicate(
            format!("field-to-field comparison {} with {}", a.name, b.name),
        )),
        (Predicate::Literal(_), Predicate::Literal(_)) => Err(StorageError::UnsupportedPredicate(
            "literal-to-literal comparison".to_string(),
        )),
        _ => Err(StorageError::UnsupportedPredicate(
            "comparison operands must be a field and a literal".to_string(),
        )),
    }
}

pub(crate) fn boolean_field(field: &Field) -> Result<()> {
    if field.ty == Some(EdmType::Boolean) {
        Ok(())
    } else {
        Err(StorageError::UnsupportedPredicate(format!(
            "field {} is not declared boolean and cannot stand alone",
            field.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(participants: i32, positive: bool) -> Entity {
        Entity::new("Political", "0001")
            .with_field("NumberOfParticipants", participants)
            .with_field("Positive", positive)
    }

    #[test]
    fn test_evaluate_follows_connectives() {
        let filter = Field::int32("NumberOfParticipants").gt(10) & !Field::boolean("Positive").is_true();
        assert!(filter.evaluate(&event(11, false)).unwrap());
        assert!(!filter.evaluate(&event(11, true)).unwrap());
        assert!(!filter.evaluate(&event(10, false)).unwrap());
    }

    #[test]
    fn test_literal_on_left_keeps_direction() {
        let filter = Predicate::binary(
            Predicate::literal(10),
            BinaryOp::Lt,
            Predicate::Field(Field::int32("NumberOfParticipants")),
        );
        assert!(filter.evaluate(&event(11, true)).unwrap());
        assert!(!filter.evaluate(&event(9, true)).unwrap());
    }

    #[test]
    fn test_missing_field_never_matches() {
        let filter = Field::string("Description").equals("x");
        assert!(!filter.evaluate(&event(1, true)).unwrap());
    }

    #[test]
    fn test_evaluate_rejects_what_compile_rejects() {
        let arithmetic = Predicate::binary(
            Predicate::Field(Field::int32("NumberOfParticipants")),
            BinaryOp::Add,
            Predicate::literal(1),
        );
        assert!(matches!(
            arithmetic.evaluate(&event(1, true)),
            Err(StorageError::UnsupportedPredicate(_))
        ));
        assert!(matches!(
            Field::int32("NumberOfParticipants").is_true().evaluate(&event(1, true)),
            Err(StorageError::UnsupportedPredicate(_))
        ));
    }
}
