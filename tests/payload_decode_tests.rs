//! Integration tests for notification payload decoding.
//!
//! Tests verify:
//! - Golden envelopes shaped like real trigger output decode into the
//!   expected change records
//! - Hash degradation metadata (hashed columns, forced text OID) survives
//!   decoding
//! - Trigger error envelopes surface as errors carrying the envelope data

use serde_json::json;
use sqlx_pg_realtime::{ChangeOperation, Error, QualifiedTable, decode_payload};

#[test]
fn test_golden_insert_envelope() {
   // as emitted by the notify trigger for INSERT INTO users
   let payload = r#"{
      "table": "users",
      "operation": "INSERT",
      "row": {
         "id": {"value": "42", "oid": 23},
         "email": {"value": "ada@example.com", "oid": 25},
         "active": {"value": "true", "oid": 16},
         "balance": {"value": "12.50", "oid": 1700},
         "settings": {"value": "{\"theme\": \"dark\"}", "oid": 3802}
      },
      "hashed": []
   }"#;

   let change = decode_payload(payload).unwrap();
   assert_eq!(change.table, QualifiedTable::parse("users"));
   assert_eq!(change.operation, ChangeOperation::Insert);
   assert_eq!(change.row["id"], json!(42));
   assert_eq!(change.row["email"], json!("ada@example.com"));
   assert_eq!(change.row["active"], json!(true));
   assert_eq!(change.row["balance"], json!("12.50"));
   assert_eq!(change.row["settings"], json!({"theme": "dark"}));

   // INSERT: every column appears as (null, value)
   assert_eq!(change.changes.len(), change.row.len());
   assert_eq!(change.changes["id"].0, json!(null));
   assert_eq!(change.changes["id"].1, json!(42));
}

#[test]
fn test_golden_update_envelope_with_hashed_column() {
   let digest = "a".repeat(64);
   let payload = format!(
      r#"{{
         "table": "posts",
         "operation": "UPDATE",
         "row": {{
            "id": {{"value": "7", "oid": 23}},
            "body": {{"value": "{digest}", "oid": 25}}
         }},
         "old_values": {{
            "body": {{"value": "short old body", "oid": 25}}
         }},
         "hashed": ["body"]
      }}"#
   );

   let change = decode_payload(&payload).unwrap();
   assert_eq!(change.operation, ChangeOperation::Update);
   assert!(change.hashed.contains("body"));
   assert_eq!(change.row["body"], json!(digest));

   // only the changed column shows up in the old/new pairs
   assert_eq!(change.changes.len(), 1);
   assert_eq!(change.changes["body"].0, json!("short old body"));
   assert_eq!(change.changes["body"].1, json!(digest));
}

#[test]
fn test_golden_delete_envelope_carries_pre_image() {
   let payload = r#"{
      "table": "audit.events",
      "operation": "DELETE",
      "row": {"id": {"value": "9", "oid": 20}},
      "hashed": []
   }"#;

   let change = decode_payload(payload).unwrap();
   assert_eq!(change.table.to_string(), "audit.events");
   assert_eq!(change.operation, ChangeOperation::Delete);
   assert_eq!(change.row["id"], json!(9));
   assert_eq!(change.changes["id"].0, json!(9));
   assert_eq!(change.changes["id"].1, json!(null));
}

#[test]
fn test_trigger_error_envelope() {
   let payload = r#"{"table": "users", "operation": "INSERT", "error": "out of memory"}"#;
   match decode_payload(payload) {
      Err(Error::TriggerRuntime {
         table,
         operation,
         message,
      }) => {
         assert_eq!(table, "users");
         assert_eq!(operation, "INSERT");
         assert_eq!(message, "out of memory");
      }
      other => panic!("expected TriggerRuntime, got {other:?}"),
   }
}

#[test]
fn test_decode_reencode_round_trip_for_typed_values() {
   let payload = r#"{
      "table": "t",
      "operation": "INSERT",
      "row": {
         "n": {"value": "-3", "oid": 23},
         "f": {"value": "2.25", "oid": 701},
         "b": {"value": "f", "oid": 16},
         "j": {"value": "[1, null, \"x\"]", "oid": 114}
      },
      "hashed": []
   }"#;

   let change = decode_payload(payload).unwrap();
   let reencoded = serde_json::to_value(&change.row).unwrap();
   assert_eq!(
      reencoded,
      json!({"n": -3, "f": 2.25, "b": false, "j": [1, null, "x"]})
   );
}
