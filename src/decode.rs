//! Decoding of trigger notification payloads.
//!
//! Triggers emit a JSON envelope per row mutation (see [`crate::sql`]).
//! Every cell is a `{value, oid}` pair carrying the column's text form and
//! its Postgres type OID; this module converts cells back into typed JSON
//! values and assembles the [`RowChange`] record the refresh engine works
//! with.
//!
//! Values are taken at face value from the trigger: if the trigger fired
//! under a role with broader row visibility than the subscriber's
//! connection, the decoded change still reflects what the trigger saw.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::table::QualifiedTable;

/// Row mutation kind, as reported by `TG_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
   Insert,
   Update,
   Delete,
}

impl ChangeOperation {
   pub fn as_str(&self) -> &'static str {
      match self {
         ChangeOperation::Insert => "INSERT",
         ChangeOperation::Update => "UPDATE",
         ChangeOperation::Delete => "DELETE",
      }
   }

   fn parse(raw: &str) -> Result<Self> {
      match raw {
         "INSERT" => Ok(ChangeOperation::Insert),
         "UPDATE" => Ok(ChangeOperation::Update),
         "DELETE" => Ok(ChangeOperation::Delete),
         other => Err(Error::decode(format!("unknown operation '{other}'"))),
      }
   }
}

/// A decoded row mutation.
///
/// `row` is the post-image for INSERT/UPDATE and the pre-image for DELETE.
/// `changes` maps each changed column to its `(old, new)` pair: for INSERT
/// old is null, for DELETE new is null, and for UPDATE only columns whose
/// text form actually changed appear. `hashed` names the columns whose
/// value in `row` is a SHA-256 hex digest instead of the real value.
#[derive(Debug, Clone)]
pub struct RowChange {
   pub table: QualifiedTable,
   pub operation: ChangeOperation,
   pub row: IndexMap<String, JsonValue>,
   pub changes: IndexMap<String, (JsonValue, JsonValue)>,
   pub hashed: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
   table: String,
   operation: String,
   #[serde(default)]
   row: IndexMap<String, Cell>,
   #[serde(default)]
   old_values: IndexMap<String, Cell>,
   #[serde(default)]
   hashed: Vec<String>,
   #[serde(default)]
   error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cell {
   value: Option<String>,
   oid: u32,
}

/// Decodes a raw notification payload into a [`RowChange`].
///
/// An envelope carrying an `error` field (the trigger's exception fallback)
/// decodes to [`Error::TriggerRuntime`]; a malformed envelope decodes to
/// [`Error::Decode`].
pub fn decode_payload(payload: &str) -> Result<RowChange> {
   let envelope: Envelope =
      serde_json::from_str(payload).map_err(|e| Error::decode(e.to_string()))?;

   if let Some(message) = envelope.error {
      return Err(Error::TriggerRuntime {
         table: envelope.table,
         operation: envelope.operation,
         message,
      });
   }

   let table = QualifiedTable::parse(&envelope.table);
   let operation = ChangeOperation::parse(&envelope.operation)?;

   let mut row = IndexMap::with_capacity(envelope.row.len());
   for (column, cell) in &envelope.row {
      row.insert(column.clone(), decode_cell(cell)?);
   }

   let changes = match operation {
      ChangeOperation::Insert => row
         .iter()
         .map(|(col, value)| (col.clone(), (JsonValue::Null, value.clone())))
         .collect(),
      ChangeOperation::Delete => row
         .iter()
         .map(|(col, value)| (col.clone(), (value.clone(), JsonValue::Null)))
         .collect(),
      ChangeOperation::Update => {
         let mut changes = IndexMap::with_capacity(envelope.old_values.len());
         for (column, cell) in &envelope.old_values {
            let old = decode_cell(cell)?;
            let new = row.get(column).cloned().unwrap_or(JsonValue::Null);
            changes.insert(column.clone(), (old, new));
         }
         changes
      }
   };

   Ok(RowChange {
      table,
      operation,
      row,
      changes,
      hashed: envelope.hashed.into_iter().collect(),
   })
}

fn decode_cell(cell: &Cell) -> Result<JsonValue> {
   match &cell.value {
      None => Ok(JsonValue::Null),
      Some(text) => decode_text_value(cell.oid, text),
   }
}

// Type OIDs from pg_type.dat this decoder understands natively. Everything
// else keeps its text form.
mod oid {
   pub const BOOL: u32 = 16;
   pub const INT8: u32 = 20;
   pub const INT2: u32 = 21;
   pub const INT4: u32 = 23;
   pub const OID: u32 = 26;
   pub const JSON: u32 = 114;
   pub const FLOAT4: u32 = 700;
   pub const FLOAT8: u32 = 701;
   pub const JSONB: u32 = 3802;
}

/// Decodes the Postgres text form of a value for the given type OID.
///
/// Integers and floats become JSON numbers, booleans JSON booleans,
/// json/jsonb are parsed, and everything else (numeric included, to
/// preserve precision) keeps its text form.
pub fn decode_text_value(type_oid: u32, text: &str) -> Result<JsonValue> {
   match type_oid {
      oid::BOOL => match text {
         "t" | "true" => Ok(JsonValue::Bool(true)),
         "f" | "false" => Ok(JsonValue::Bool(false)),
         other => Err(Error::decode(format!("invalid bool text '{other}'"))),
      },
      oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
         .parse::<i64>()
         .map(JsonValue::from)
         .map_err(|e| Error::decode(format!("invalid integer text '{text}': {e}"))),
      oid::FLOAT4 | oid::FLOAT8 => {
         let parsed = text
            .parse::<f64>()
            .map_err(|e| Error::decode(format!("invalid float text '{text}': {e}")))?;
         // NaN and infinities have no JSON number form; keep the text
         match serde_json::Number::from_f64(parsed) {
            Some(n) => Ok(JsonValue::Number(n)),
            None => Ok(JsonValue::String(text.to_string())),
         }
      }
      oid::JSON | oid::JSONB => {
         serde_json::from_str(text).map_err(|e| Error::decode(format!("invalid json text: {e}")))
      }
      _ => Ok(JsonValue::String(text.to_string())),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   fn cell(value: &str, oid: u32) -> String {
      format!(r#"{{"value": "{value}", "oid": {oid}}}"#)
   }

   #[test]
   fn test_decode_insert_builds_null_to_value_changes() {
      let payload = format!(
         r#"{{"table": "users", "operation": "INSERT",
             "row": {{"id": {}, "email": {}}}, "hashed": []}}"#,
         cell("7", 23),
         cell("a@b.c", 25),
      );
      let change = decode_payload(&payload).unwrap();

      assert_eq!(change.table, QualifiedTable::parse("users"));
      assert_eq!(change.operation, ChangeOperation::Insert);
      assert_eq!(change.row["id"], json!(7));
      assert_eq!(change.row["email"], json!("a@b.c"));
      assert_eq!(change.changes["id"], (JsonValue::Null, json!(7)));
      assert_eq!(change.changes["email"], (JsonValue::Null, json!("a@b.c")));
      assert!(change.hashed.is_empty());
   }

   #[test]
   fn test_decode_delete_builds_value_to_null_changes() {
      let payload = format!(
         r#"{{"table": "users", "operation": "DELETE", "row": {{"id": {}}}, "hashed": []}}"#,
         cell("7", 23),
      );
      let change = decode_payload(&payload).unwrap();

      assert_eq!(change.operation, ChangeOperation::Delete);
      assert_eq!(change.changes["id"], (json!(7), JsonValue::Null));
   }

   #[test]
   fn test_decode_update_restricts_changes_to_old_values() {
      let payload = format!(
         r#"{{"table": "orders", "operation": "UPDATE",
             "row": {{"id": {}, "status": {}}},
             "old_values": {{"status": {}}},
             "hashed": []}}"#,
         cell("1", 23),
         cell("shipped", 25),
         cell("pending", 25),
      );
      let change = decode_payload(&payload).unwrap();

      assert_eq!(change.changes.len(), 1);
      assert_eq!(change.changes["status"], (json!("pending"), json!("shipped")));
      // the unchanged column stays visible in the row image
      assert_eq!(change.row["id"], json!(1));
   }

   #[test]
   fn test_decode_qualified_table_canonicalizes_public() {
      let payload = r#"{"table": "public.users", "operation": "INSERT", "row": {}, "hashed": []}"#;
      let change = decode_payload(payload).unwrap();
      assert_eq!(change.table, QualifiedTable::parse("users"));

      let payload = r#"{"table": "audit.events", "operation": "INSERT", "row": {}, "hashed": []}"#;
      let change = decode_payload(payload).unwrap();
      assert_eq!(change.table.to_string(), "audit.events");
   }

   #[test]
   fn test_decode_hashed_columns_become_a_set() {
      let payload = format!(
         r#"{{"table": "posts", "operation": "INSERT",
             "row": {{"body": {}}}, "hashed": ["body"]}}"#,
         cell("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef", 25),
      );
      let change = decode_payload(&payload).unwrap();
      assert!(change.hashed.contains("body"));
   }

   #[test]
   fn test_decode_null_value_is_json_null() {
      let payload = r#"{"table": "t", "operation": "INSERT",
                        "row": {"x": {"value": null, "oid": 23}}, "hashed": []}"#;
      let change = decode_payload(payload).unwrap();
      assert_eq!(change.row["x"], JsonValue::Null);
      assert_eq!(change.changes["x"], (JsonValue::Null, JsonValue::Null));
   }

   #[test]
   fn test_error_envelope_raises_trigger_runtime() {
      let payload = r#"{"table": "users", "operation": "UPDATE", "error": "boom"}"#;
      let err = decode_payload(payload).unwrap_err();
      match err {
         Error::TriggerRuntime {
            table,
            operation,
            message,
         } => {
            assert_eq!(table, "users");
            assert_eq!(operation, "UPDATE");
            assert_eq!(message, "boom");
         }
         other => panic!("expected TriggerRuntime, got {other:?}"),
      }
   }

   #[test]
   fn test_malformed_payload_is_decode_error() {
      assert!(matches!(decode_payload("not json"), Err(Error::Decode { .. })));
      assert!(matches!(
         decode_payload(r#"{"table": "t", "operation": "TRUNCATE", "row": {}}"#),
         Err(Error::Decode { .. })
      ));
   }

   #[test]
   fn test_decode_text_value_typed_forms() {
      assert_eq!(decode_text_value(16, "t").unwrap(), json!(true));
      assert_eq!(decode_text_value(16, "false").unwrap(), json!(false));
      assert_eq!(decode_text_value(20, "9000000000").unwrap(), json!(9000000000i64));
      assert_eq!(decode_text_value(701, "1.5").unwrap(), json!(1.5));
      assert_eq!(decode_text_value(701, "NaN").unwrap(), json!("NaN"));
      assert_eq!(
         decode_text_value(3802, r#"{"a": [1, 2]}"#).unwrap(),
         json!({"a": [1, 2]})
      );
      // numeric keeps its text form to preserve precision
      assert_eq!(decode_text_value(1700, "123.450").unwrap(), json!("123.450"));
      // unknown OIDs fall back to text at face value
      assert_eq!(decode_text_value(600, "(1,2)").unwrap(), json!("(1,2)"));
   }

   #[test]
   fn test_decode_text_value_invalid_integer() {
      assert!(matches!(decode_text_value(23, "abc"), Err(Error::Decode { .. })));
   }
}
