//! Server-side SQL assets: the query-analysis routine and the notify
//! trigger template.
//!
//! Everything this system creates inside Postgres shares the
//! [`OBJECT_PREFIX`] name prefix so that [`destroy`](crate::PgRealtime::destroy_objects)
//! can enumerate and drop it later. Notifications from every table flow over
//! the single [`CHANNEL`].
//!
//! # Payload limits
//!
//! `pg_notify` payloads are capped at 8 kB by Postgres. The trigger stays
//! under that in two stages: any column whose text form exceeds
//! [`COLUMN_HASH_THRESHOLD`] bytes is replaced by its SHA-256 hex digest up
//! front, and while the serialized envelope exceeds [`ENVELOPE_TARGET_BYTES`]
//! the largest remaining column above [`DEGRADE_FLOOR_BYTES`] is hashed as
//! well. The final envelope is sent even if it still exceeds the target
//! (best-effort bound).

use crate::table::QualifiedTable;

/// LISTEN/NOTIFY channel shared by every trigger this system installs.
pub const CHANNEL: &str = "_pg_realtime_table_changes";

/// Name prefix for all functions and triggers owned by this system.
pub const OBJECT_PREFIX: &str = "_pg_realtime_";

/// Per-column hashing threshold in bytes (values longer than this are
/// replaced by their SHA-256 digest before the envelope is assembled).
pub const COLUMN_HASH_THRESHOLD: usize = 5_000;

/// Target ceiling for the serialized envelope, below Postgres' 8 kB
/// NOTIFY limit.
pub const ENVELOPE_TARGET_BYTES: usize = 7_500;

/// Columns at or below this length are never degraded by the envelope
/// size loop.
pub const DEGRADE_FLOOR_BYTES: usize = 64;

/// DDL for the `_pg_realtime_parse_query(text)` routine.
///
/// The routine compiles the query into a uniquely-named temporary view,
/// walks the view's dependencies in `pg_depend`, and returns one
/// `('table', name, NULL)` row per referenced relation plus one
/// `('column', name, attname)` row per referenced column. Partition
/// children are reported as their root so callers watch the logical table.
/// The `public` schema is rendered bare; any other schema as
/// `schema.name`. The view is dropped before returning.
pub const PARSE_QUERY_DDL: &str = r#"
CREATE OR REPLACE FUNCTION _pg_realtime_parse_query(q text)
RETURNS TABLE(object_type text, tname text, cname text)
LANGUAGE plpgsql
AS $parse$
DECLARE
   view_name text := '_pg_realtime_pq_' || md5(random()::text || clock_timestamp()::text);
BEGIN
   EXECUTE format('CREATE TEMPORARY VIEW %I AS %s', view_name, q);

   RETURN QUERY
   WITH view_deps AS (
      SELECT d.refobjid AS relid, d.refobjsubid AS attnum
        FROM pg_catalog.pg_depend d
        JOIN pg_catalog.pg_rewrite rw ON rw.oid = d.objid
        JOIN pg_catalog.pg_class v ON v.oid = rw.ev_class
       WHERE v.relname = view_name
         AND v.relnamespace = pg_my_temp_schema()
         AND d.classid = 'pg_rewrite'::regclass
         AND d.refclassid = 'pg_class'::regclass
         AND d.deptype = 'n'
         AND d.refobjid <> v.oid
   ),
   named AS (
      SELECT dep.relid,
             dep.attnum,
             CASE WHEN pn.nspname = 'public' THEN pc.relname::text
                  ELSE pn.nspname || '.' || pc.relname
             END AS rel_name
        FROM view_deps dep
        JOIN pg_catalog.pg_class dc ON dc.oid = dep.relid
        JOIN pg_catalog.pg_class pc
          ON pc.oid = CASE WHEN dc.relispartition
                           THEN pg_partition_root(dep.relid)
                           ELSE dep.relid
                      END
        JOIN pg_catalog.pg_namespace pn ON pn.oid = pc.relnamespace
   )
   SELECT DISTINCT 'table'::text, named.rel_name, NULL::text
     FROM named
   UNION
   SELECT DISTINCT 'column'::text, named.rel_name, a.attname::text
     FROM named
     JOIN pg_catalog.pg_attribute a
       ON a.attrelid = named.relid AND a.attnum = named.attnum
    WHERE named.attnum > 0;

   EXECUTE format('DROP VIEW %I', view_name);
END;
$parse$;
"#;

/// Name of the notify function for a table.
pub fn notify_function_name(table: &QualifiedTable) -> String {
   format!("{}notify_{}", OBJECT_PREFIX, sanitize_ident(&table.ident()))
}

/// Name of the notify trigger for a table.
pub fn trigger_name(table: &QualifiedTable) -> String {
   format!("{}trigger_{}", OBJECT_PREFIX, sanitize_ident(&table.ident()))
}

/// Renders the notify trigger function DDL for a table.
///
/// The function fires AFTER INSERT OR UPDATE OR DELETE FOR EACH ROW. It
/// enumerates the relation's live attributes from the catalog, extracts the
/// text form of each from NEW/OLD with a dynamic cast, applies the two-stage
/// hashing described at module level, and `pg_notify`s the JSON envelope on
/// the shared channel. Any failure inside the body degrades to an
/// `{table, operation, error}` envelope on the same channel.
pub fn render_notify_function(table: &QualifiedTable) -> String {
   let function = notify_function_name(table);
   let table_literal = sql_literal(&table.to_string());

   format!(
      r#"
CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql
AS $notify$
DECLARE
   attr record;
   old_text text;
   new_text text;
   new_oid oid;
   old_oid oid;
   new_hashed boolean;
   old_hashed boolean;
   text_oid constant oid := 'text'::pg_catalog.regtype::oid;
   row_obj jsonb := '{{}}'::jsonb;
   old_obj jsonb := '{{}}'::jsonb;
   hashed_cols jsonb := '[]'::jsonb;
   envelope jsonb;
   victim text;
   victim_len integer;
BEGIN
   FOR attr IN
      SELECT a.attname, a.atttypid
        FROM pg_catalog.pg_attribute a
       WHERE a.attrelid = TG_RELID
         AND a.attnum > 0
         AND NOT a.attisdropped
       ORDER BY a.attnum
   LOOP
      old_text := NULL;
      new_text := NULL;
      new_oid := attr.atttypid;
      old_oid := attr.atttypid;
      new_hashed := false;
      old_hashed := false;

      IF TG_OP <> 'DELETE' THEN
         EXECUTE format('SELECT ($1).%I::text', attr.attname) INTO new_text USING NEW;
      END IF;
      IF TG_OP <> 'INSERT' THEN
         EXECUTE format('SELECT ($1).%I::text', attr.attname) INTO old_text USING OLD;
      END IF;

      -- each side hashes independently; only the hashed cell's oid is
      -- forced to text, the other side keeps the real attribute oid
      IF new_text IS NOT NULL AND octet_length(new_text) > {hash_threshold} THEN
         new_text := encode(digest(new_text, 'sha256'), 'hex');
         new_oid := text_oid;
         new_hashed := true;
      END IF;
      IF old_text IS NOT NULL AND octet_length(old_text) > {hash_threshold} THEN
         old_text := encode(digest(old_text, 'sha256'), 'hex');
         old_oid := text_oid;
         old_hashed := true;
      END IF;

      -- hashed_cols reflects the row image: new values, except for DELETE
      IF TG_OP = 'DELETE' THEN
         row_obj := row_obj || jsonb_build_object(
            attr.attname, jsonb_build_object('value', old_text, 'oid', old_oid::int4));
         IF old_hashed THEN
            hashed_cols := hashed_cols || to_jsonb(attr.attname::text);
         END IF;
      ELSE
         row_obj := row_obj || jsonb_build_object(
            attr.attname, jsonb_build_object('value', new_text, 'oid', new_oid::int4));
         IF new_hashed THEN
            hashed_cols := hashed_cols || to_jsonb(attr.attname::text);
         END IF;
      END IF;

      IF TG_OP = 'UPDATE' AND new_text IS DISTINCT FROM old_text THEN
         old_obj := old_obj || jsonb_build_object(
            attr.attname, jsonb_build_object('value', old_text, 'oid', old_oid::int4));
      END IF;
   END LOOP;

   IF TG_OP = 'UPDATE' THEN
      envelope := jsonb_build_object(
         'table', {table_literal}, 'operation', TG_OP,
         'row', row_obj, 'old_values', old_obj, 'hashed', hashed_cols);
   ELSE
      envelope := jsonb_build_object(
         'table', {table_literal}, 'operation', TG_OP,
         'row', row_obj, 'hashed', hashed_cols);
   END IF;

   WHILE octet_length(envelope::text) > {envelope_target} LOOP
      SELECT e.key, octet_length(e.value ->> 'value')
        INTO victim, victim_len
        FROM jsonb_each(row_obj) e
       WHERE NOT (hashed_cols ? e.key)
         AND e.value ->> 'value' IS NOT NULL
       ORDER BY octet_length(e.value ->> 'value') DESC
       LIMIT 1;

      EXIT WHEN victim IS NULL OR victim_len <= {degrade_floor};

      row_obj := jsonb_set(row_obj, ARRAY[victim], jsonb_build_object(
         'value', encode(digest(row_obj #>> ARRAY[victim, 'value'], 'sha256'), 'hex'),
         'oid', text_oid::int4));
      IF old_obj ? victim THEN
         old_obj := jsonb_set(old_obj, ARRAY[victim], jsonb_build_object(
            'value', encode(digest(old_obj #>> ARRAY[victim, 'value'], 'sha256'), 'hex'),
            'oid', text_oid::int4));
      END IF;
      hashed_cols := hashed_cols || to_jsonb(victim);

      IF TG_OP = 'UPDATE' THEN
         envelope := jsonb_build_object(
            'table', {table_literal}, 'operation', TG_OP,
            'row', row_obj, 'old_values', old_obj, 'hashed', hashed_cols);
      ELSE
         envelope := jsonb_build_object(
            'table', {table_literal}, 'operation', TG_OP,
            'row', row_obj, 'hashed', hashed_cols);
      END IF;
   END LOOP;

   PERFORM pg_notify('{channel}', envelope::text);
   RETURN NULL;
EXCEPTION WHEN OTHERS THEN
   PERFORM pg_notify('{channel}', jsonb_build_object(
      'table', {table_literal}, 'operation', TG_OP, 'error', SQLERRM)::text);
   RETURN NULL;
END;
$notify$;
"#,
      function = function,
      table_literal = table_literal,
      channel = CHANNEL,
      hash_threshold = COLUMN_HASH_THRESHOLD,
      envelope_target = ENVELOPE_TARGET_BYTES,
      degrade_floor = DEGRADE_FLOOR_BYTES,
   )
}

/// Renders the trigger DDL binding the notify function to a table.
///
/// `CREATE OR REPLACE TRIGGER` keeps installation idempotent under
/// concurrent subscribes to the same table.
pub fn render_notify_trigger(table: &QualifiedTable) -> String {
   format!(
      "CREATE OR REPLACE TRIGGER {trigger}\n\
       AFTER INSERT OR UPDATE OR DELETE ON {relation}\n\
       FOR EACH ROW EXECUTE FUNCTION {function}()",
      trigger = trigger_name(table),
      relation = table.quoted(),
      function = notify_function_name(table),
   )
}

/// Enumerates user triggers carrying the reserved prefix, with their tables.
pub const LIST_OWNED_TRIGGERS: &str = r#"
SELECT t.tgname, n.nspname, c.relname
  FROM pg_catalog.pg_trigger t
  JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
  JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
 WHERE NOT t.tgisinternal
   AND t.tgname LIKE '\_pg\_realtime\_%'
"#;

/// Enumerates functions carrying the reserved prefix, as droppable
/// `regprocedure` signatures.
pub const LIST_OWNED_FUNCTIONS: &str = r#"
SELECT p.oid::regprocedure::text
  FROM pg_catalog.pg_proc p
 WHERE p.proname LIKE '\_pg\_realtime\_%'
"#;

/// Flattens a name into a lowercase identifier-safe fragment.
fn sanitize_ident(raw: &str) -> String {
   raw.chars()
      .map(|c| match c {
         'a'..='z' | '0'..='9' | '_' => c,
         'A'..='Z' => c.to_ascii_lowercase(),
         _ => '_',
      })
      .collect()
}

/// Single-quoted SQL string literal with embedded quotes doubled.
fn sql_literal(raw: &str) -> String {
   format!("'{}'", raw.replace('\'', "''"))
}
