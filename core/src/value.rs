use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type as PgType};
use uuid::Uuid;

/// Column types the engine can stage and bind. `as_ddl` is the type text
/// used when shaping a staging table, `pg_type` the wire type used by the
/// binary COPY writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlColumnType {
    SmallInt,
    Integer,
    BigInt,
    DoublePrecision,
    Numeric,
    Boolean,
    Text,
    Varchar,
    Bytea,
    TimestampTz,
    Date,
    Uuid,
    Jsonb,
}

impl SqlColumnType {
    pub fn as_ddl(&self) -> &'static str {
        match self {
            SqlColumnType::SmallInt => "SMALLINT",
            SqlColumnType::Integer => "INTEGER",
            SqlColumnType::BigInt => "BIGINT",
            SqlColumnType::DoublePrecision => "DOUBLE PRECISION",
            SqlColumnType::Numeric => "NUMERIC",
            SqlColumnType::Boolean => "BOOLEAN",
            SqlColumnType::Text => "TEXT",
            SqlColumnType::Varchar => "VARCHAR",
            SqlColumnType::Bytea => "BYTEA",
            SqlColumnType::TimestampTz => "TIMESTAMPTZ",
            SqlColumnType::Date => "DATE",
            SqlColumnType::Uuid => "UUID",
            SqlColumnType::Jsonb => "JSONB",
        }
    }

    pub fn pg_type(&self) -> PgType {
        match self {
            SqlColumnType::SmallInt => PgType::INT2,
            SqlColumnType::Integer => PgType::INT4,
            SqlColumnType::BigInt => PgType::INT8,
            SqlColumnType::DoublePrecision => PgType::FLOAT8,
            SqlColumnType::Numeric => PgType::NUMERIC,
            SqlColumnType::Boolean => PgType::BOOL,
            SqlColumnType::Text => PgType::TEXT,
            SqlColumnType::Varchar => PgType::VARCHAR,
            SqlColumnType::Bytea => PgType::BYTEA,
            SqlColumnType::TimestampTz => PgType::TIMESTAMPTZ,
            SqlColumnType::Date => PgType::DATE,
            SqlColumnType::Uuid => PgType::UUID,
            SqlColumnType::Jsonb => PgType::JSONB,
        }
    }
}

/// Owned SQL value moved from an entity into a parameter slot or a staged
/// row. Every value travels as a bind parameter, never as inlined text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Numeric(Decimal),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Json(JsonValue),
    /// NULL still carries the column type so the COPY writer knows the slot.
    Null(SqlColumnType),
}

impl SqlValue {
    pub fn column_type(&self) -> SqlColumnType {
        match self {
            SqlValue::SmallInt(_) => SqlColumnType::SmallInt,
            SqlValue::Int(_) => SqlColumnType::Integer,
            SqlValue::BigInt(_) => SqlColumnType::BigInt,
            SqlValue::Double(_) => SqlColumnType::DoublePrecision,
            SqlValue::Numeric(_) => SqlColumnType::Numeric,
            SqlValue::Bool(_) => SqlColumnType::Boolean,
            SqlValue::Text(_) => SqlColumnType::Text,
            SqlValue::Bytes(_) => SqlColumnType::Bytea,
            SqlValue::Timestamp(_) => SqlColumnType::TimestampTz,
            SqlValue::Date(_) => SqlColumnType::Date,
            SqlValue::Uuid(_) => SqlColumnType::Uuid,
            SqlValue::Json(_) => SqlColumnType::Jsonb,
            SqlValue::Null(ty) => *ty,
        }
    }

    pub fn pg_type(&self) -> PgType {
        self.column_type().pg_type()
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::SmallInt(value) => i16::to_sql(value, ty, out),
            SqlValue::Int(value) => i32::to_sql(value, ty, out),
            SqlValue::BigInt(value) => i64::to_sql(value, ty, out),
            SqlValue::Double(value) => f64::to_sql(value, ty, out),
            SqlValue::Numeric(value) => Decimal::to_sql(value, ty, out),
            SqlValue::Bool(value) => bool::to_sql(value, ty, out),
            SqlValue::Text(value) => String::to_sql(value, ty, out),
            SqlValue::Bytes(value) => <Vec<u8>>::to_sql(value, ty, out),
            SqlValue::Timestamp(value) => DateTime::<Utc>::to_sql(value, ty, out),
            SqlValue::Date(value) => NaiveDate::to_sql(value, ty, out),
            SqlValue::Uuid(value) => Uuid::to_sql(value, ty, out),
            SqlValue::Json(value) => JsonValue::to_sql(value, ty, out),
            SqlValue::Null(_) => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true
    }

    to_sql_checked!();
}

impl From<i16> for SqlValue {
    fn from(value: i16) -> Self {
        SqlValue::SmallInt(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Double(value)
    }
}

impl From<Decimal> for SqlValue {
    fn from(value: Decimal) -> Self {
        SqlValue::Numeric(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Bytes(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Date(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        SqlValue::Uuid(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        SqlValue::Json(value)
    }
}

/// Maps `Option<T>` to a typed NULL so staged rows keep their column shape.
pub fn nullable<T: Into<SqlValue>>(value: Option<T>, ty: SqlColumnType) -> SqlValue {
    match value {
        Some(value) => value.into(),
        None => SqlValue::Null(ty),
    }
}
