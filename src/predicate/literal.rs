//! Literal preparation and encoding.
//!
//! A literal is first coerced to the declared type of the field it is
//! compared with, then rendered with the backend rule for that type. The
//! width of integer literals therefore always comes from the declaration,
//! never from the rendered digits.

use crate::error::{Result, StorageError};
use crate::model::{EdmType, Value};
use std::borrow::Cow;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

const TICK_NANOS: u32 = 100;

/// UTC instant with seven fractional digits, one per 100ns tick.
const DATETIME_LITERAL: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:7]Z"
);

/// Coerce `value` to `declared` and normalize it to what the backend can represent.
pub fn prepare(value: &Value, declared: Option<EdmType>) -> Result<Value> {
    let coerced = match (declared, value) {
        (None, v) => v.clone(),
        (Some(ty), v) if v.data_type() == ty => v.clone(),
        (Some(EdmType::Int64), Value::Int32(n)) => Value::Int64(i64::from(*n)),
        (Some(EdmType::Double), Value::Int32(n)) => Value::Double(f64::from(*n)),
        (Some(EdmType::Double), Value::Int64(n)) => Value::Double(*n as f64),
        (Some(ty), v) => {
            return Err(StorageError::TypeMismatch(format!(
                "{} literal cannot be compared with a field declared {ty}",
                v.data_type()
            )))
        }
    };
    match coerced {
        Value::Double(d) if !d.is_finite() => Err(StorageError::TypeMismatch(format!(
            "double literal {d} has no filter representation"
        ))),
        Value::DateTime(dt) => normalize_datetime(dt).map(Value::DateTime),
        other => Ok(other),
    }
}

/// Offset to UTC and truncate to the backend's 100ns tick.
pub fn normalize_datetime(dt: OffsetDateTime) -> Result<OffsetDateTime> {
    let utc = dt.to_offset(UtcOffset::UTC);
    if !(0..=9999).contains(&utc.year()) {
        return Err(StorageError::TypeMismatch(format!(
            "datetime {utc} is outside the representable year range"
        )));
    }
    Ok(truncate_to_tick(utc))
}

/// Drop the sub-tick nanoseconds, which the backend never stores.
pub fn truncate_to_tick(dt: OffsetDateTime) -> OffsetDateTime {
    let nanos = dt.nanosecond();
    dt.replace_nanosecond(nanos - nanos % TICK_NANOS)
        .unwrap_or(dt)
}

/// `value` as the backend stores it: datetimes lose their sub-tick part.
pub fn stored_form(value: Cow<'_, Value>) -> Cow<'_, Value> {
    if let Value::DateTime(dt) = value.as_ref() {
        return Cow::Owned(Value::DateTime(truncate_to_tick(*dt)));
    }
    value
}

/// Render a prepared literal in the backend filter grammar.
pub(crate) fn render(value: &Value) -> Result<String> {
    Ok(match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bool(b) => b.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => format!("{n}L"),
        // Debug keeps a fractional part or exponent and round-trips exactly.
        Value::Double(d) => format!("{d:?}"),
        Value::DateTime(dt) => {
            let text = dt
                .format(DATETIME_LITERAL)
                .map_err(|e| StorageError::TypeMismatch(format!("datetime {dt}: {e}")))?;
            format!("datetime'{text}'")
        }
        Value::Guid(g) => format!("guid'{}'", g.hyphenated()),
        Value::Binary(bytes) => format!("X'{}'", hex::encode(bytes)),
    })
}

/// Prepare and render in one step.
pub fn encode(value: &Value, declared: Option<EdmType>) -> Result<String> {
    prepare(value, declared).and_then(|v| render(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use uuid::Uuid;

    #[test]
    fn test_strings_double_embedded_quotes() {
        assert_eq!(encode(&"O'Neil".into(), None).unwrap(), "'O''Neil'");
    }

    #[test]
    fn test_int64_width_comes_from_declaration() {
        assert_eq!(encode(&Value::Int32(7), None).unwrap(), "7");
        assert_eq!(encode(&Value::Int32(7), Some(EdmType::Int64)).unwrap(), "7L");
        assert_eq!(encode(&Value::Int64(7), None).unwrap(), "7L");
        assert_eq!(
            encode(&Value::Int64(-9_000_000_000), Some(EdmType::Int64)).unwrap(),
            "-9000000000L"
        );
    }

    #[test]
    fn test_doubles_keep_fraction() {
        assert_eq!(encode(&Value::Double(2.0), None).unwrap(), "2.0");
        assert_eq!(encode(&Value::Int32(3), Some(EdmType::Double)).unwrap(), "3.0");
        assert!(matches!(
            encode(&Value::Double(f64::NAN), None),
            Err(StorageError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_datetime_is_rendered_in_utc() {
        let local = datetime!(2024-05-06 09:30:15.123456789 +02:00);
        assert_eq!(
            encode(&Value::DateTime(local), None).unwrap(),
            "datetime'2024-05-06T07:30:15.1234567Z'"
        );
    }

    #[test]
    fn test_datetime_keeps_four_digit_years_and_drops_sub_tick_nanos() {
        assert_eq!(
            encode(&Value::DateTime(datetime!(0005-01-01 0:00:00.00000019 UTC)), None).unwrap(),
            "datetime'0005-01-01T00:00:00.0000001Z'"
        );
        let stored = stored_form(Cow::Owned(Value::DateTime(datetime!(2024-05-06 9:30:15.123456789 UTC))));
        assert_eq!(
            stored.as_ref(),
            &Value::DateTime(datetime!(2024-05-06 9:30:15.1234567 UTC))
        );
        assert_eq!(stored_form(Cow::Owned(Value::Int32(4))).as_ref(), &Value::Int32(4));
    }

    #[test]
    fn test_guid_and_binary() {
        let code = Uuid::parse_str("6F9619FF-8B86-D011-B42D-00C04FC964FF").unwrap();
        assert_eq!(
            encode(&Value::Guid(code), None).unwrap(),
            "guid'6f9619ff-8b86-d011-b42d-00c04fc964ff'"
        );
        assert_eq!(encode(&Value::Binary(vec![0, 171]), None).unwrap(), "X'00ab'");
    }

    #[test]
    fn test_cross_type_literal_is_rejected() {
        assert!(matches!(
            prepare(&Value::String("5".into()), Some(EdmType::Int32)),
            Err(StorageError::TypeMismatch(_))
        ));
        assert!(matches!(
            prepare(&Value::Int64(5), Some(EdmType::Int32)),
            Err(StorageError::TypeMismatch(_))
        ));
    }
}
