use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};

/// A single column value as it travels through a backup document.
///
/// Serializes as the bare JSON value. JSON has no literal for non-finite
/// floats, so those are written as `{"float": "inf" | "-inf" | "nan"}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

pub type Row = BTreeMap<String, Scalar>;

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }
}

const NON_FINITE_KEY: &str = "float";

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Null => serializer.serialize_unit(),
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Int(i) => serializer.serialize_i64(*i),
            Scalar::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Scalar::Float(f) => {
                let label = if f.is_nan() {
                    "nan"
                } else if f.is_sign_negative() {
                    "-inf"
                } else {
                    "inf"
                };
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NON_FINITE_KEY, label)?;
                map.end()
            }
            Scalar::String(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("null, a boolean, a number, a string or a non-finite float marker")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Scalar, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
        Ok(Scalar::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
        Ok(Scalar::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => Scalar::Int(i),
            Err(_) => Scalar::Float(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
        Ok(Scalar::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
        Ok(Scalar::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
        Ok(Scalar::String(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Scalar, A::Error> {
        let Some((key, label)) = map.next_entry::<String, String>()? else {
            return Err(de::Error::invalid_length(0, &self));
        };
        if key != NON_FINITE_KEY {
            return Err(de::Error::unknown_field(&key, &[NON_FINITE_KEY]));
        }
        if map.next_key::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(2, &self));
        }
        match label.as_str() {
            "inf" => Ok(Scalar::Float(f64::INFINITY)),
            "-inf" => Ok(Scalar::Float(f64::NEG_INFINITY)),
            "nan" => Ok(Scalar::Float(f64::NAN)),
            other => Err(de::Error::unknown_variant(other, &["inf", "-inf", "nan"])),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

pub fn bind_scalar<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Scalar,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Scalar::Null => query.bind(Option::<i64>::None),
        Scalar::Bool(b) => query.bind(*b),
        Scalar::Int(i) => query.bind(*i),
        Scalar::Float(f) => query.bind(*f),
        Scalar::String(s) => query.bind(s.clone()),
    }
}

/// Decode a row using the storage class SQLite reports for each value.
/// BLOB values come back as base64 text.
pub fn decode_row(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Scalar::Null
        } else {
            let type_name = raw.type_info().name().to_ascii_uppercase();
            match type_name.as_str() {
                "INTEGER" | "INT" | "BIGINT" => Scalar::Int(row.try_get::<i64, _>(idx)?),
                "BOOLEAN" => Scalar::Bool(row.try_get::<bool, _>(idx)?),
                "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                    Scalar::Float(row.try_get::<f64, _>(idx)?)
                }
                "BLOB" => Scalar::String(BASE64.encode(row.try_get::<Vec<u8>, _>(idx)?)),
                _ => Scalar::String(row.try_get::<String, _>(idx)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn scalars_serialize_untagged() {
        let row: Row = [
            ("a".to_string(), Scalar::Null),
            ("b".to_string(), Scalar::Bool(true)),
            ("c".to_string(), Scalar::Int(-7)),
            ("d".to_string(), Scalar::Float(1.5)),
            ("e".to_string(), Scalar::String("x".into())),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"a":null,"b":true,"c":-7,"d":1.5,"e":"x"}"#);
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn floats_survive_json_exactly() {
        let row: Row = [
            ("tiny".to_string(), Scalar::Float(5e-324)),
            ("odd".to_string(), Scalar::Float(0.1 + 0.2)),
            ("big".to_string(), Scalar::Float(-1.797_693_134_862_315_7e308)),
            ("inf".to_string(), Scalar::Float(f64::INFINITY)),
            ("ninf".to_string(), Scalar::Float(f64::NEG_INFINITY)),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains(r#""inf":{"float":"inf"}"#));
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);

        let via_value: Row =
            serde_json::from_value(serde_json::from_str::<serde_json::Value>(&json).unwrap())
                .unwrap();
        assert_eq!(via_value, row);

        let nan: Scalar = serde_json::from_str(r#"{"float":"nan"}"#).unwrap();
        assert!(matches!(nan, Scalar::Float(f) if f.is_nan()));
        assert!(serde_json::from_str::<Scalar>(r#"{"float":"huge"}"#).is_err());
        assert!(serde_json::from_str::<Scalar>(r#"{"other":"inf"}"#).is_err());
        assert!(serde_json::from_str::<Scalar>("[1]").is_err());
    }

    #[tokio::test]
    async fn overflowing_reals_decode_as_infinity() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let row = sqlx::query("SELECT 9e999 AS up, -9e999 AS down")
            .fetch_one(&pool)
            .await
            .unwrap();
        let decoded = decode_row(&row).unwrap();
        assert_eq!(decoded["up"], Scalar::Float(f64::INFINITY));
        assert_eq!(decoded["down"], Scalar::Float(f64::NEG_INFINITY));
        let json = serde_json::to_string(&decoded).unwrap();
        assert_eq!(serde_json::from_str::<Row>(&json).unwrap(), decoded);
    }

    #[tokio::test]
    async fn decode_row_follows_storage_class() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let row = sqlx::query("SELECT 3 AS i, 2.5 AS r, 'txt' AS s, NULL AS n, x'0102' AS b")
            .fetch_one(&pool)
            .await
            .unwrap();
        let decoded = decode_row(&row).unwrap();
        assert_eq!(decoded["i"], Scalar::Int(3));
        assert_eq!(decoded["r"], Scalar::Float(2.5));
        assert_eq!(decoded["s"], Scalar::String("txt".into()));
        assert_eq!(decoded["n"], Scalar::Null);
        assert_eq!(decoded["b"], Scalar::String("AQI=".into()));
    }
}
