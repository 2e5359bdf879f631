//! Qualified table names.
//!
//! Postgres relations are addressed as `schema.name`. The `public` schema is
//! canonical: a table in `public` is stored and rendered with no schema at
//! all, so `public.users` and `users` compare equal everywhere in the crate
//! (watch specs, notification routing, filter maps).

use std::fmt;

/// A (schema, name) pair identifying a Postgres relation.
///
/// `schema == None` means `public`. Construct via [`QualifiedTable::parse`]
/// (or `From<&str>`) so that `public.x` is canonicalized to `x`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTable {
   schema: Option<String>,
   name: String,
}

impl QualifiedTable {
   /// Parses `"name"` or `"schema.name"`, canonicalizing the `public` schema.
   pub fn parse(raw: &str) -> Self {
      match raw.split_once('.') {
         Some(("public", name)) => Self {
            schema: None,
            name: name.to_string(),
         },
         Some((schema, name)) => Self {
            schema: Some(schema.to_string()),
            name: name.to_string(),
         },
         None => Self {
            schema: None,
            name: raw.to_string(),
         },
      }
   }

   /// The schema, or `None` for `public`.
   pub fn schema(&self) -> Option<&str> {
      self.schema.as_deref()
   }

   /// The bare relation name.
   pub fn name(&self) -> &str {
      &self.name
   }

   /// The schema with the `public` default made explicit.
   pub fn schema_or_public(&self) -> &str {
      self.schema.as_deref().unwrap_or("public")
   }

   /// Identifier-safe `<schema>_<name>` form used in trigger and function
   /// names (e.g. `public_users`, `audit_events`).
   pub fn ident(&self) -> String {
      format!("{}_{}", self.schema_or_public(), self.name)
   }

   /// Double-quoted `"schema"."name"` form for use in DDL.
   pub fn quoted(&self) -> String {
      format!(
         "\"{}\".\"{}\"",
         escape_ident(self.schema_or_public()),
         escape_ident(&self.name)
      )
   }
}

fn escape_ident(ident: &str) -> String {
   ident.replace('"', "\"\"")
}

impl fmt::Display for QualifiedTable {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.schema {
         Some(schema) => write!(f, "{}.{}", schema, self.name),
         None => write!(f, "{}", self.name),
      }
   }
}

impl From<&str> for QualifiedTable {
   fn from(raw: &str) -> Self {
      Self::parse(raw)
   }
}
