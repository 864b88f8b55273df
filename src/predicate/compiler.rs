//! Predicate to filter-string compilation.
//!
//! Compilation runs in two passes over the tree. The first collects every
//! literal in evaluation order and encodes it against the declared type of
//! the field it is compared with. The second renders the boolean skeleton,
//! translating operators through [`OPERATOR_TABLE`] and drawing the encoded
//! literals back in the same order.

use super::{boolean_field, comparison_operands, literal, unsupported_operator, BinaryOp, Predicate};
use crate::error::{Result, StorageError};
use tracing::instrument;

/// Every operator with a filter translation. Anything else is rejected.
pub const OPERATOR_TABLE: [(BinaryOp, &str); 8] = [
    (BinaryOp::Eq, "eq"),
    (BinaryOp::Gt, "gt"),
    (BinaryOp::GtEq, "ge"),
    (BinaryOp::Lt, "lt"),
    (BinaryOp::LtEq, "le"),
    (BinaryOp::NotEq, "ne"),
    (BinaryOp::And, "and"),
    (BinaryOp::Or, "or"),
];

const NOT_TOKEN: &str = "not";

fn translate(op: BinaryOp) -> Result<&'static str> {
    OPERATOR_TABLE
        .iter()
        .find(|(candidate, _)| *candidate == op)
        .map(|(_, token)| *token)
        .ok_or_else(|| unsupported_operator(op))
}

/// Compile a predicate into the backend filter grammar.
#[instrument(skip_all, level = "debug", err)]
pub fn compile(predicate: &Predicate) -> Result<String> {
    let mut literals = Vec::new();
    collect_literals(predicate, &mut literals)?;
    let mut literals = literals.into_iter();
    let mut out = String::new();
    render(predicate, &mut literals, &mut out)?;
    if literals.next().is_some() {
        return Err(StorageError::UnsupportedPredicate(
            "literal outside any comparison".to_string(),
        ));
    }
    Ok(out)
}

fn collect_literals(predicate: &Predicate, out: &mut Vec<String>) -> Result<()> {
    match predicate {
        Predicate::Binary { left, right, .. } => {
            let declared = match (left.as_ref(), right.as_ref()) {
                (Predicate::Field(f), Predicate::Literal(_))
                | (Predicate::Literal(_), Predicate::Field(f)) => f.ty,
                _ => None,
            };
            for side in [left.as_ref(), right.as_ref()] {
                match side {
                    Predicate::Literal(value) => out.push(literal::encode(value, declared)?),
                    other => collect_literals(other, out)?,
                }
            }
            Ok(())
        }
        Predicate::Not(inner) => collect_literals(inner, out),
        Predicate::Literal(value) => {
            out.push(literal::encode(value, None)?);
            Ok(())
        }
        Predicate::Field(_) => Ok(()),
    }
}

fn render(
    predicate: &Predicate,
    literals: &mut impl Iterator<Item = String>,
    out: &mut String,
) -> Result<()> {
    match predicate {
        Predicate::Binary { left, op, right } if op.is_connective() => {
            let token = translate(*op)?;
            out.push('(');
            render(left, literals, out)?;
            out.push(' ');
            out.push_str(token);
            out.push(' ');
            render(right, literals, out)?;
            out.push(')');
            Ok(())
        }
        Predicate::Binary { left, op, right } => {
            let token = translate(*op)?;
            let (field, _, field_first) = comparison_operands(left, right)?;
            let value = literals.next().ok_or_else(|| {
                StorageError::UnsupportedPredicate("comparison without a literal".to_string())
            })?;
            let (lhs, rhs) = if field_first {
                (field.name.as_str(), value.as_str())
            } else {
                (value.as_str(), field.name.as_str())
            };
            out.push('(');
            out.push_str(lhs);
            out.push(' ');
            out.push_str(token);
            out.push(' ');
            out.push_str(rhs);
            out.push(')');
            Ok(())
        }
        Predicate::Not(inner) => {
            out.push_str(NOT_TOKEN);
            out.push(' ');
            render(inner, literals, out)
        }
        Predicate::Field(field) => {
            boolean_field(field)?;
            out.push('(');
            out.push_str(&field.name);
            out.push_str(" eq true)");
            Ok(())
        }
        Predicate::Literal(value) => Err(StorageError::UnsupportedPredicate(format!(
            "constant {} literal is not a filter",
            value.data_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::predicate::Field;
    use time::macros::datetime;

    #[test]
    fn test_connectives_are_fully_parenthesized() {
        let filter = Field::partition_key().equals("Nature")
            & (Field::double("Cost").lt(2.5) | Field::int32("NumberOfParticipants").ge(3));
        assert_eq!(
            compile(&filter).unwrap(),
            "((PartitionKey eq 'Nature') and ((Cost lt 2.5) or (NumberOfParticipants ge 3)))"
        );
    }

    #[test]
    fn test_negation_and_bare_boolean() {
        let filter = !Field::boolean("Positive").is_true() & Field::row_key().not_equals("a'b");
        assert_eq!(
            compile(&filter).unwrap(),
            "(not (Positive eq true) and (RowKey ne 'a''b'))"
        );
    }

    #[test]
    fn test_int64_rule_applies_at_every_position() {
        let total = Field::int64("Total");
        let filter = total.gt(1) & (total.lt(5_000_000_000_i64) | !total.equals(42));
        assert_eq!(
            compile(&filter).unwrap(),
            "((Total gt 1L) and ((Total lt 5000000000L) or not (Total eq 42L)))"
        );
    }

    #[test]
    fn test_literal_left_of_field() {
        let filter = Predicate::binary(
            Predicate::literal(datetime!(2024-01-01 0:00 UTC)),
            BinaryOp::LtEq,
            Predicate::Field(Field::timestamp()),
        );
        assert_eq!(
            compile(&filter).unwrap(),
            "(datetime'2024-01-01T00:00:00.0000000Z' le Timestamp)"
        );
    }

    #[test]
    fn test_unmapped_operators_fail() {
        let arithmetic = Predicate::binary(
            Predicate::binary(
                Predicate::Field(Field::int32("A")),
                BinaryOp::Multiply,
                Predicate::literal(2),
            ),
            BinaryOp::Gt,
            Predicate::literal(4),
        );
        assert!(matches!(
            compile(&arithmetic),
            Err(StorageError::UnsupportedPredicate(_))
        ));

        let field_to_field = Predicate::binary(
            Predicate::Field(Field::int32("A")),
            BinaryOp::Eq,
            Predicate::Field(Field::int32("B")),
        );
        assert!(matches!(
            compile(&field_to_field),
            Err(StorageError::UnsupportedPredicate(_))
        ));

        assert!(matches!(
            compile(&Predicate::literal(true)),
            Err(StorageError::UnsupportedPredicate(_))
        ));
        assert!(matches!(
            compile(&Field::string("Description").is_true()),
            Err(StorageError::UnsupportedPredicate(_))
        ));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let filter = Field::int32("NumberOfParticipants").equals("ten");
        assert!(matches!(compile(&filter), Err(StorageError::TypeMismatch(_))));
        let nan = Field::double("Cost").equals(Value::Double(f64::INFINITY));
        assert!(matches!(compile(&nan), Err(StorageError::TypeMismatch(_))));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let build = || Field::guid("Code").equals(uuid::Uuid::nil()) | Field::binary("Blob").equals(vec![1_u8]);
        assert_eq!(compile(&build()).unwrap(), compile(&build()).unwrap());
    }
}
