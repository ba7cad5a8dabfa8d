//! Typed values for dynamically shaped registry records
//!
//! A registry record has no Rust struct behind it. Each column is described by
//! a [`DataType`] tag taken from the catalog, and each value is a [`CellValue`].
//! All type dispatch goes through the column's declared tag; the runtime shape
//! of an incoming JSON value is only used to read it, never to pick a type.

use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use std::str::FromStr;
use uuid::Uuid;

/// Column types the engine knows how to read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Date,
    Timestamp,
    TimestampTz,
    Text,
    Varchar,
    Uuid,
    Integer,
    BigInt,
    Numeric,
    Double,
    Bytea,
}

impl DataType {
    /// Map an `information_schema.columns.data_type` string.
    ///
    /// Returns `None` for anything outside the supported vocabulary, most
    /// notably `USER-DEFINED` (PostGIS geometry).
    pub fn from_catalog(name: &str) -> Option<Self> {
        let t = match name.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Self::Boolean,
            "date" => Self::Date,
            "timestamp without time zone" | "timestamp" => Self::Timestamp,
            "timestamp with time zone" | "timestamptz" => Self::TimestampTz,
            "text" => Self::Text,
            "character varying" | "varchar" => Self::Varchar,
            "uuid" => Self::Uuid,
            "integer" | "int" | "int4" | "smallint" => Self::Integer,
            "bigint" | "int8" => Self::BigInt,
            "numeric" | "decimal" => Self::Numeric,
            "double precision" | "float8" | "real" => Self::Double,
            "bytea" => Self::Bytea,
            _ => return None,
        };
        Some(t)
    }

    pub fn catalog_name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Timestamp => "timestamp without time zone",
            Self::TimestampTz => "timestamp with time zone",
            Self::Text => "text",
            Self::Varchar => "character varying",
            Self::Uuid => "uuid",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Numeric => "numeric",
            Self::Double => "double precision",
            Self::Bytea => "bytea",
        }
    }

    /// Type name used in `CAST($n AS ...)` placeholders.
    pub fn sql_cast(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Timestamp => "timestamp",
            Self::TimestampTz => "timestamptz",
            Self::Text => "text",
            Self::Varchar => "varchar",
            Self::Uuid => "uuid",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Numeric => "numeric",
            Self::Double => "double precision",
            Self::Bytea => "bytea",
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::Text | Self::Varchar)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Integer | Self::BigInt | Self::Numeric | Self::Double
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Integer | Self::BigInt)
    }

    pub fn is_date(self) -> bool {
        matches!(self, Self::Date)
    }

    pub fn is_datetime(self) -> bool {
        matches!(self, Self::Timestamp | Self::TimestampTz)
    }

    pub fn is_boolean(self) -> bool {
        matches!(self, Self::Boolean)
    }
}

/// One value of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Coerce a JSON payload value into the column's declared type.
    pub fn from_json(value: &JsonValue, data_type: DataType) -> Result<Self, String> {
        match value {
            JsonValue::Null => Ok(Self::Null),
            JsonValue::String(s) => Self::parse_text(s, data_type),
            JsonValue::Bool(b) => match data_type {
                DataType::Boolean => Ok(Self::Bool(*b)),
                t if t.is_text() => Ok(Self::Text(b.to_string())),
                _ => Err(format!("boolean is not valid for {}", data_type.catalog_name())),
            },
            JsonValue::Number(n) => match data_type {
                DataType::Integer | DataType::BigInt => {
                    if let Some(i) = n.as_i64() {
                        Ok(Self::Int(i))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 => Ok(Self::Int(f as i64)),
                            _ => Err(format!("cannot parse integer value from '{n}'")),
                        }
                    }
                }
                DataType::Double => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| format!("cannot parse numeric value from '{n}'")),
                DataType::Numeric => Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .map(Self::Decimal)
                    .map_err(|_| format!("cannot parse numeric value from '{n}'")),
                t if t.is_text() => Ok(Self::Text(n.to_string())),
                _ => Err(format!("number is not valid for {}", data_type.catalog_name())),
            },
            JsonValue::Array(_) | JsonValue::Object(_) => Err(format!(
                "structured value is not valid for {}",
                data_type.catalog_name()
            )),
        }
    }

    /// Parse a textual value (payload string, spreadsheet cell) into the
    /// column's declared type. Empty strings are null for non-text columns.
    pub fn parse_text(raw: &str, data_type: DataType) -> Result<Self, String> {
        if data_type.is_text() {
            return Ok(Self::Text(raw.to_string()));
        }
        let s = raw.trim();
        if s.is_empty() {
            return Ok(Self::Null);
        }
        match data_type {
            DataType::Boolean => parse_bool(s)
                .map(Self::Bool)
                .ok_or_else(|| format!("cannot parse boolean value from '{raw}'")),
            DataType::Integer | DataType::BigInt => s
                .parse::<i64>()
                .map(Self::Int)
                .or_else(|_| match s.replace(',', ".").parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 && f.is_finite() => Ok(Self::Int(f as i64)),
                    _ => Err(format!("cannot parse numeric value from '{raw}'")),
                }),
            DataType::Double => s
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Self::Float)
                .ok_or_else(|| format!("cannot parse numeric value from '{raw}'")),
            DataType::Numeric => {
                let normalized = s.replace(',', ".");
                Decimal::from_str(&normalized)
                    .or_else(|_| Decimal::from_scientific(&normalized))
                    .map(Self::Decimal)
                    .map_err(|_| format!("cannot parse numeric value from '{raw}'"))
            }
            DataType::Date => parse_date(s)
                .map(Self::Date)
                .ok_or_else(|| format!("invalid date format '{raw}'")),
            DataType::Timestamp => parse_datetime(s)
                .map(Self::Timestamp)
                .ok_or_else(|| format!("invalid date format '{raw}'")),
            DataType::TimestampTz => DateTime::parse_from_rfc3339(s)
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_datetime(s).map(|n| n.and_utc()))
                .map(Self::TimestampTz)
                .ok_or_else(|| format!("invalid date format '{raw}'")),
            DataType::Uuid => Uuid::parse_str(s)
                .map(Self::Uuid)
                .map_err(|_| format!("cannot parse uuid value from '{raw}'")),
            DataType::Bytea => base64::engine::general_purpose::STANDARD
                .decode(s)
                .map(Self::Bytes)
                .map_err(|_| "binary value must be base64 encoded".to_string()),
            DataType::Text | DataType::Varchar => Ok(Self::Text(raw.to_string())),
        }
    }

    /// The value zero of a numeric column type.
    pub fn zero_for(data_type: DataType) -> Self {
        match data_type {
            DataType::Double => Self::Float(0.0),
            DataType::Numeric => Self::Decimal(Decimal::ZERO),
            _ => Self::Int(0),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Decimal(d) => d
                .to_f64()
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(d.to_string())),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Self::Timestamp(t) => JsonValue::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Self::TimestampTz(t) => JsonValue::String(t.to_rfc3339()),
            Self::Uuid(u) => JsonValue::String(u.to_string()),
            Self::Bytes(b) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }

    /// Human readable text, as written into exported sheets.
    pub fn display_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(true) => "Yes".to_string(),
            Self::Bool(false) => "No".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Decimal(d) => d.normalize().to_string(),
            Self::Text(s) => s.clone(),
            Self::Date(d) => d.format("%d.%m.%Y").to_string(),
            Self::Timestamp(t) => t.format("%d.%m.%Y %H:%M:%S").to_string(),
            Self::TimestampTz(t) => t.format("%d.%m.%Y %H:%M:%S").to_string(),
            Self::Uuid(u) => u.to_string(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }

    /// Plain string form used when a value is compared as text, e.g. against
    /// a back-reference column.
    pub fn as_key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) if s.is_empty() => None,
            Self::Text(s) => Some(s.clone()),
            Self::Int(i) => Some(i.to_string()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Decimal(d) => Some(d.normalize().to_string()),
            Self::Float(f) => Some(f.to_string()),
            other => Some(other.display_text()),
        }
    }

    /// Read one column of a fetched row according to its declared type.
    pub fn decode(row: &PgRow, column: &str, data_type: DataType) -> Result<Self, sqlx::Error> {
        let value = match data_type {
            DataType::Boolean => row.try_get::<Option<bool>, _>(column)?.map(Self::Bool),
            DataType::Date => row.try_get::<Option<NaiveDate>, _>(column)?.map(Self::Date),
            DataType::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(column)?
                .map(Self::Timestamp),
            DataType::TimestampTz => row
                .try_get::<Option<DateTime<Utc>>, _>(column)?
                .map(Self::TimestampTz),
            DataType::Text | DataType::Varchar => {
                row.try_get::<Option<String>, _>(column)?.map(Self::Text)
            }
            DataType::Uuid => row.try_get::<Option<Uuid>, _>(column)?.map(Self::Uuid),
            // `smallint` shares the integer tag; sqlx wants the exact width.
            DataType::Integer | DataType::BigInt => match wire_type(row, column)?.as_str() {
                "INT2" => row
                    .try_get::<Option<i16>, _>(column)?
                    .map(|v| Self::Int(i64::from(v))),
                "INT4" => row
                    .try_get::<Option<i32>, _>(column)?
                    .map(|v| Self::Int(i64::from(v))),
                _ => row.try_get::<Option<i64>, _>(column)?.map(Self::Int),
            },
            DataType::Numeric => row
                .try_get::<Option<Decimal>, _>(column)?
                .map(Self::Decimal),
            DataType::Double => match wire_type(row, column)?.as_str() {
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(column)?
                    .map(|v| Self::Float(f64::from(v))),
                _ => row.try_get::<Option<f64>, _>(column)?.map(Self::Float),
            },
            DataType::Bytea => row.try_get::<Option<Vec<u8>>, _>(column)?.map(Self::Bytes),
        };
        Ok(value.unwrap_or(Self::Null))
    }
}

/// Postgres type name of a fetched column (`INT2`, `FLOAT4`, ...).
fn wire_type(row: &PgRow, column: &str) -> Result<String, sqlx::Error> {
    Ok(row.try_column(column)?.type_info().name().to_string())
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "да" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "нет" => Some(false),
        _ => None,
    }
}

/// Dates arrive as ISO (`2023-05-01`), Russian locale (`01.05.2023`) or US
/// spreadsheet (`05/01/2023`, `05/01/23`) text.
pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y", "%m/%d/%y"];
    if let Some(d) = FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
    {
        return Some(d);
    }
    parse_datetime(s).map(|dt| dt.date())
}

pub(crate) fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
        "%d.%m.%Y %H:%M",
    ];
    if let Some(dt) = FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
    {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    const DATE_ONLY: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%m/%d/%Y", "%m/%d/%y"];
    DATE_ONLY
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// A registry record: column name to value, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: Vec<(String, CellValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == column)
            .map(|(_, v)| v)
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        let column = column.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == column) {
            slot.1 = value;
        } else {
            self.entries.push((column, value));
        }
    }

    pub fn remove(&mut self, column: &str) -> Option<CellValue> {
        let idx = self.entries.iter().position(|(k, _)| k == column)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == column)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, CellValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
