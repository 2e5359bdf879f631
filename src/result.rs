//! Query-result handling: row decoding and change-suppression digests.
//!
//! Results are held as column-ordered JSON rows so that observers get a
//! stable, serializable view regardless of the column types involved.
//! Binary values (BYTEA) are rendered in Postgres' `\x…` hex text form and
//! NUMERIC keeps its text form to preserve precision.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row as SqlxRow, TypeInfo};
use tracing::warn;

use crate::config::ParamValue;
use crate::error::{Error, Result};

/// One result row: column name → JSON value, in result-set column order.
pub type Row = IndexMap<String, JsonValue>;

/// A published result set. Shared so that observers and the dispatcher can
/// snapshot it without copying rows.
pub type ResultRows = Arc<Vec<Row>>;

/// SHA-256 digest of a serialized result set.
pub(crate) type ResultDigest = [u8; 32];

/// Runs a subscription's query with its bound parameters and decodes the
/// rows to JSON.
pub(crate) async fn execute_query(
   pool: &PgPool,
   sql: &str,
   params: &[ParamValue],
) -> Result<Vec<Row>> {
   let mut query = sqlx::query(sql);
   for param in params {
      query = param.bind(query);
   }

   let rows = query
      .fetch_all(pool)
      .await
      .map_err(|source| Error::QueryExecution { source })?;

   Ok(rows.iter().map(row_to_json).collect())
}

/// Converts one Postgres row into a column-ordered JSON row.
///
/// Follows the column's declared type; values that cannot be decoded under
/// the enabled sqlx type features degrade to null with a warning rather
/// than failing the whole refresh.
pub(crate) fn row_to_json(row: &PgRow) -> Row {
   let mut out = IndexMap::with_capacity(row.columns().len());

   for (index, column) in row.columns().iter().enumerate() {
      let value = match column.type_info().name() {
         "BOOL" => decode_with::<bool, _>(row, index, JsonValue::from),
         "INT2" => decode_with::<i16, _>(row, index, JsonValue::from),
         "INT4" => decode_with::<i32, _>(row, index, JsonValue::from),
         "INT8" => decode_with::<i64, _>(row, index, JsonValue::from),
         "FLOAT4" => decode_with::<f32, _>(row, index, JsonValue::from),
         "FLOAT8" => decode_with::<f64, _>(row, index, JsonValue::from),
         "NUMERIC" => {
            decode_with::<sqlx::types::BigDecimal, _>(row, index, |v| v.to_string().into())
         }
         "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            decode_with::<String, _>(row, index, JsonValue::from)
         }
         "UUID" => decode_with::<sqlx::types::Uuid, _>(row, index, |v| v.to_string().into()),
         "JSON" | "JSONB" => decode_with::<JsonValue, _>(row, index, |v| v),
         "DATE" => decode_with::<sqlx::types::time::Date, _>(row, index, |v| v.to_string().into()),
         "TIME" => decode_with::<sqlx::types::time::Time, _>(row, index, |v| v.to_string().into()),
         "TIMESTAMP" => decode_with::<sqlx::types::time::PrimitiveDateTime, _>(row, index, |v| {
            v.to_string().into()
         }),
         "TIMESTAMPTZ" => decode_with::<sqlx::types::time::OffsetDateTime, _>(row, index, |v| {
            v.to_string().into()
         }),
         "BYTEA" => decode_with::<Vec<u8>, _>(row, index, |v| {
            format!("\\x{}", hex::encode(v)).into()
         }),
         other => match row.try_get::<Option<String>, _>(index) {
            Ok(v) => Ok(v.map(JsonValue::from).unwrap_or(JsonValue::Null)),
            Err(_) => {
               warn!(column = column.name(), r#type = other, "undecodable column, using null");
               Ok(JsonValue::Null)
            }
         },
      };

      let value = value.unwrap_or_else(|e| {
         warn!(column = column.name(), error = %e, "column decode failed, using null");
         JsonValue::Null
      });
      out.insert(column.name().to_string(), value);
   }

   out
}

fn decode_with<'r, T, F>(row: &'r PgRow, index: usize, convert: F) -> sqlx::Result<JsonValue>
where
   T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
   F: FnOnce(T) -> JsonValue,
{
   Ok(row
      .try_get::<Option<T>, _>(index)?
      .map(convert)
      .unwrap_or(JsonValue::Null))
}

/// Digests a result set for change suppression.
///
/// Row serialization is deterministic (IndexMap preserves column order), so
/// equal result sets digest equally and a republish can be suppressed.
pub(crate) fn digest_rows(rows: &[Row]) -> ResultDigest {
   let serialized = serde_json::to_vec(rows).unwrap_or_default();
   let mut hasher = Sha256::new();
   hasher.update(&serialized);
   hasher.finalize().into()
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   fn row(pairs: &[(&str, JsonValue)]) -> Row {
      pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
   }

   #[test]
   fn test_digest_is_stable() {
      let rows = vec![row(&[("id", json!(1)), ("name", json!("a"))])];
      assert_eq!(digest_rows(&rows), digest_rows(&rows.clone()));
   }

   #[test]
   fn test_digest_differs_on_value_change() {
      let a = vec![row(&[("id", json!(1))])];
      let b = vec![row(&[("id", json!(2))])];
      assert_ne!(digest_rows(&a), digest_rows(&b));
   }

   #[test]
   fn test_digest_differs_on_row_order() {
      let a = vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])];
      let b = vec![row(&[("id", json!(2))]), row(&[("id", json!(1))])];
      assert_ne!(digest_rows(&a), digest_rows(&b));
   }

   #[test]
   fn test_digest_of_empty_results() {
      assert_eq!(digest_rows(&[]), digest_rows(&[]));
      assert_ne!(digest_rows(&[]), digest_rows(&[row(&[("id", json!(1))])]));
   }
}
