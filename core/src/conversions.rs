//! `ToSql` for [`Value`], coercing to the parameter type the server inferred.
//!
//! Conversions are lossless or rejected: a value that does not fit the
//! declared type fails the bind instead of writing bytes the server would
//! misread.

use std::error::Error;

use bytes::{BufMut, BytesMut};
use postgres_types::{IsNull, Kind, ToSql, Type, WrongType, to_sql_checked};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::value::Value;

type BoxError = Box<dyn Error + Sync + Send>;

/// Largest magnitude an `f64` holds exactly.
const F64_EXACT: u64 = 1 << 53;
/// Largest magnitude an `f32` holds exactly.
const F32_EXACT: u64 = 1 << 24;

#[inline]
fn is_text(ty: &Type) -> bool {
    matches!(*ty, Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME)
}

#[inline]
fn is_json(ty: &Type) -> bool {
    matches!(*ty, Type::JSON | Type::JSONB)
}

/// Writes an already-serialized JSON document.
fn write_raw_json(text: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::JSONB {
        out.put_u8(1);
    }
    out.extend_from_slice(text.as_bytes());
    Ok(IsNull::No)
}

/// Encodes `value` only when its own `ToSql` accepts `ty`.
fn checked<T: ToSql>(value: &T, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if T::accepts(ty) {
        value.to_sql(ty, out)
    } else {
        Err(Box::new(WrongType::new::<T>(ty.clone())))
    }
}

fn lossy(value: impl std::fmt::Display, ty: &Type) -> BoxError {
    format!("{value} cannot be bound to a {ty} parameter without loss").into()
}

fn int_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::INT8 => v.to_sql(ty, out),
        Type::FLOAT4 if v.unsigned_abs() <= F32_EXACT => (v as f32).to_sql(ty, out),
        Type::FLOAT8 if v.unsigned_abs() <= F64_EXACT => (v as f64).to_sql(ty, out),
        Type::FLOAT4 | Type::FLOAT8 => Err(lossy(v, ty)),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        _ if is_text(ty) => v.to_string().to_sql(ty, out),
        _ if is_json(ty) => serde_json::Value::from(v).to_sql(ty, out),
        _ => Err(Box::new(WrongType::new::<i64>(ty.clone()))),
    }
}

fn float_to_sql(v: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::FLOAT8 => v.to_sql(ty, out),
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 => {
            // Integral and inside i64; the narrower widths are range-checked there.
            if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
                int_to_sql(v as i64, ty, out)
            } else {
                Err(lossy(v, ty))
            }
        }
        Type::NUMERIC => Decimal::try_from(v)?.to_sql(ty, out),
        _ if is_text(ty) => v.to_string().to_sql(ty, out),
        _ if is_json(ty) => Value::Float(v).to_json().to_sql(ty, out),
        _ => Err(Box::new(WrongType::new::<f64>(ty.clone()))),
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => match *ty {
                _ if is_text(ty) => v.to_string().to_sql(ty, out),
                _ if is_json(ty) => serde_json::Value::Bool(*v).to_sql(ty, out),
                _ => checked(v, ty, out),
            },
            Value::Int(v) => int_to_sql(*v, ty, out),
            Value::Float(v) => float_to_sql(*v, ty, out),
            Value::Text(v) => match *ty {
                Type::UUID => Uuid::parse_str(v)?.to_sql(ty, out),
                Type::NUMERIC => v.parse::<Decimal>()?.to_sql(ty, out),
                _ if is_json(ty) => write_raw_json(v, ty, out),
                // Enum labels travel as their text.
                _ if matches!(ty.kind(), Kind::Enum(_)) => {
                    out.extend_from_slice(v.as_bytes());
                    Ok(IsNull::No)
                }
                _ => checked(&v.as_str(), ty, out),
            },
            Value::Json(v) => {
                if is_text(ty) {
                    v.to_string().to_sql(ty, out)
                } else {
                    checked(v, ty, out)
                }
            }
            Value::Timestamp(v) => match *ty {
                Type::TIMESTAMPTZ => v.and_utc().to_sql(ty, out),
                _ => checked(v, ty, out),
            },
            Value::TimestampTz(v) => match *ty {
                Type::TIMESTAMP => v.naive_local().to_sql(ty, out),
                _ => checked(v, ty, out),
            },
            Value::Date(v) => checked(v, ty, out),
            Value::Uuid(v) => {
                if is_text(ty) {
                    v.to_string().to_sql(ty, out)
                } else {
                    checked(v, ty, out)
                }
            }
            Value::List(items) => match ty.kind() {
                Kind::Array(_) => items.as_slice().to_sql(ty, out),
                _ if is_json(ty) => self.to_json().to_sql(ty, out),
                _ => Err(format!("cannot bind a list to a {ty} parameter").into()),
            },
            Value::Object(row) => {
                if is_text(ty) {
                    row.to_json().to_string().to_sql(ty, out)
                } else {
                    checked(&row.to_json(), ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use postgres_types::FromSql;

    use super::*;

    fn encode(value: &Value, ty: &Type) -> BytesMut {
        let mut out = BytesMut::new();
        value.to_sql(ty, &mut out).unwrap();
        out
    }

    #[test]
    fn int_narrows_to_declared_width() {
        assert_eq!(encode(&Value::Int(7), &Type::INT4).as_ref(), &7_i32.to_be_bytes());
        assert_eq!(encode(&Value::Int(7), &Type::INT2).as_ref(), &7_i16.to_be_bytes());
        assert_eq!(encode(&Value::Int(7), &Type::INT8).as_ref(), &7_i64.to_be_bytes());
    }

    #[test]
    fn int_overflow_is_an_error() {
        let mut out = BytesMut::new();
        assert!(Value::Int(70_000).to_sql(&Type::INT2, &mut out).is_err());
    }

    #[test]
    fn text_to_jsonb_is_sent_verbatim() {
        let out = encode(&Value::Text("{\"a\":1}".into()), &Type::JSONB);
        assert_eq!(out[0], 1);
        assert_eq!(&out[1..], b"{\"a\":1}");
    }

    fn encode_err(value: &Value, ty: &Type) -> String {
        let mut out = BytesMut::new();
        value.to_sql(ty, &mut out).err().expect("expected to_sql to fail").to_string()
    }

    #[test]
    fn integral_floats_bind_to_integer_columns() {
        assert_eq!(encode(&Value::Float(3.0), &Type::INT8).as_ref(), &3_i64.to_be_bytes());
        assert_eq!(encode(&Value::Float(-2.0), &Type::INT4).as_ref(), &(-2_i32).to_be_bytes());
    }

    #[test]
    fn fractional_floats_are_rejected_by_integer_columns() {
        assert!(encode_err(&Value::Float(1.5), &Type::INT8).contains("without loss"));
        assert!(encode_err(&Value::Float(1.5), &Type::INT4).contains("without loss"));
        assert!(encode_err(&Value::Float(f64::NAN), &Type::INT8).contains("without loss"));
        assert!(encode_err(&Value::Float(1e20), &Type::INT8).contains("without loss"));
    }

    #[test]
    fn ints_widen_to_floats_only_when_exact() {
        assert_eq!(encode(&Value::Int(5), &Type::FLOAT8).as_ref(), &5_f64.to_be_bytes());
        assert_eq!(encode(&Value::Int(5), &Type::FLOAT4).as_ref(), &5_f32.to_be_bytes());
        assert!(encode_err(&Value::Int(i64::MAX), &Type::FLOAT8).contains("without loss"));
        assert!(encode_err(&Value::Int(1 << 25), &Type::FLOAT4).contains("without loss"));
    }

    fn numeric(value: &Value) -> Decimal {
        Decimal::from_sql(&Type::NUMERIC, &encode(value, &Type::NUMERIC)).unwrap()
    }

    #[test]
    fn numbers_encode_as_numeric() {
        assert_eq!(numeric(&Value::Int(42)), Decimal::from(42));
        assert_eq!(numeric(&Value::Float(2.5)), Decimal::new(25, 1));
        assert_eq!(numeric(&Value::Text("19.99".into())), Decimal::new(1999, 2));
        assert!(Value::Text("lots".into()).to_sql(&Type::NUMERIC, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn mismatched_types_are_rejected() {
        assert!(encode_err(&Value::Int(1), &Type::BOOL).contains("i64"));
        assert!(encode_err(&Value::Float(1.0), &Type::DATE).contains("f64"));
        assert!(encode_err(&Value::Bool(true), &Type::INT4).contains("bool"));
        assert!(encode_err(&Value::Text("7".into()), &Type::INT8).contains("&str"));
        assert!(encode_err(&Value::Uuid(Uuid::nil()), &Type::INT8).contains("Uuid"));
        assert!(Value::List(vec![Value::Int(1)])
            .to_sql(&Type::INT8, &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn arrays_check_their_elements() {
        assert!(Value::List(vec![Value::Float(0.5)])
            .to_sql(&Type::INT8_ARRAY, &mut BytesMut::new())
            .is_err());
        assert!(Value::List(vec![Value::Int(1), Value::Int(2)])
            .to_sql(&Type::INT8_ARRAY, &mut BytesMut::new())
            .is_ok());
    }

    #[test]
    fn null_is_null() {
        let mut out = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::TEXT, &mut out).unwrap(),
            IsNull::Yes
        ));
    }
}
