//! Per-table codegen: the `_synq_id_<T>` bi-map, the metadata rows, and the
//! triggers translating user writes into log appends.
//!
//! The generated triggers run synchronously inside the user transaction.
//! During a pull (`_synq_local.is_merging = 1`) the logging triggers
//! short-circuit so merge-time writes are not re-logged; the bare map
//! removal on delete stays active because the merge relies on it.

use std::fmt::Write;

use crate::error::Result;
use crate::schema::{ForeignKey, Schema, Table};

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn quote_str(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Generate the complete per-table installation script.
pub(crate) fn codegen(schema: &Schema) -> Result<String> {
    let mut out = String::new();
    for tbl in &schema.tables {
        metadata(&mut out, schema, tbl)?;
        id_map(&mut out, tbl);
        insert_trigger(&mut out, tbl);
        update_trigger(&mut out, tbl);
        rowid_remap_trigger(&mut out, tbl);
    }
    Ok(out)
}

/// Rows of `_synq_names`, `_synq_uniqueness` and `_synq_fk` describing the
/// table. `_synq_uniqueness` maps every replicated field (column value or
/// foreign-key slot) to the uniqueness constraints it participates in.
fn metadata(out: &mut String, schema: &Schema, tbl: &Table) -> Result<()> {
    let _ = writeln!(
        out,
        "INSERT INTO _synq_names VALUES({}, {});",
        tbl.id,
        quote_str(&tbl.name)
    );
    for col in tbl.replicated_columns() {
        let _ = writeln!(
            out,
            "INSERT INTO _synq_names VALUES({}, {});",
            col.field,
            quote_str(&col.name)
        );
        for uniq in &tbl.uniques {
            if uniq.columns.contains(&col.name) {
                let _ = writeln!(
                    out,
                    "INSERT INTO _synq_uniqueness(field, tbl_index) VALUES({}, {});",
                    col.field, uniq.index
                );
            }
        }
    }
    for uniq in &tbl.uniques {
        if let Some(name) = &uniq.name {
            let _ = writeln!(
                out,
                "INSERT INTO _synq_names VALUES({}, {});",
                uniq.index,
                quote_str(name)
            );
        }
    }
    for fk in &tbl.foreign_keys {
        for uniq in &tbl.uniques {
            if fk.columns.iter().any(|c| uniq.columns.contains(c)) {
                let _ = writeln!(
                    out,
                    "INSERT INTO _synq_uniqueness(field, tbl_index) VALUES({}, {});",
                    fk.field, uniq.index
                );
            }
        }
        let f_uniq = schema.foreign_unique(fk)?;
        let _ = writeln!(
            out,
            "INSERT INTO _synq_fk(field, foreign_index, on_delete, on_update)
VALUES({}, {}, {}, {});",
            fk.field,
            f_uniq.index,
            fk.on_delete.code(),
            fk.on_update.code()
        );
    }
    Ok(())
}

/// `_synq_id_<T>` joins the engine row handle with the row identity so that
/// local statements keep addressing rows by their natural keys. When the
/// user table aliases rowid the map declares the alias too, which keeps the
/// correspondence stable across vacuums.
fn id_map(out: &mut String, tbl: &Table) {
    let map = quote_ident(&format!("_synq_id_{}", tbl.name));
    let user = quote_ident(&tbl.name);
    let rowid_decl = if tbl.has_rowid_alias() {
        if tbl.autoincrement {
            "rowid integer PRIMARY KEY AUTOINCREMENT,\n    "
        } else {
            "rowid integer PRIMARY KEY,\n    "
        }
    } else {
        ""
    };
    let _ = write!(
        out,
        r#"
CREATE TABLE {map}(
    {rowid_decl}row_ts integer NOT NULL,
    row_peer integer NOT NULL,
    UNIQUE(row_ts, row_peer),
    FOREIGN KEY(row_ts, row_peer) REFERENCES _synq_id(row_ts, row_peer)
        ON DELETE RESTRICT ON UPDATE CASCADE
) STRICT;

CREATE TRIGGER {trig_delete}
AFTER DELETE ON {user}
BEGIN
    DELETE FROM {map} WHERE rowid = OLD.rowid;
END;

CREATE TRIGGER {trig_delete_id}
AFTER DELETE ON {map}
WHEN (SELECT NOT is_merging FROM _synq_local)
BEGIN
    UPDATE _synq_local SET ts = ts + 1;
    UPDATE _synq_context SET ts = _synq_local.ts
    FROM _synq_local WHERE _synq_context.peer = _synq_local.peer;

    INSERT INTO _synq_id_undo(ts, peer, row_ts, row_peer, ul)
    SELECT local.ts, local.peer, OLD.row_ts, OLD.row_peer, 1
    FROM _synq_local AS local
    WHERE true  -- avoid parsing ambiguity
    ON CONFLICT
    DO UPDATE SET ul = ul + 1, ts = excluded.ts, peer = excluded.peer;
END;
"#,
        trig_delete = quote_ident(&format!("_synq_delete_{}", tbl.name)),
        trig_delete_id = quote_ident(&format!("_synq_delete_id_{}", tbl.name)),
    );
}

fn referred_match(fk: &ForeignKey, side: &str) -> String {
    fk.referred_columns
        .iter()
        .zip(&fk.columns)
        .map(|(referred, col)| {
            format!("{} = {side}.{}", quote_ident(referred), quote_ident(col))
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn null_match(fk: &ForeignKey) -> String {
    fk.columns
        .iter()
        .map(|col| format!("NEW.{} IS NULL", quote_ident(col)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Resolve the locally matched natural key of a referred row to its
/// `(row_ts, row_peer)` identity.
fn target_select(fk: &ForeignKey) -> String {
    let foreign_map = quote_ident(&format!("_synq_id_{}", fk.foreign_table));
    let foreign_user = quote_ident(&fk.foreign_table);
    format!(
        r#"SELECT row_ts, row_peer FROM {foreign_map}
        WHERE rowid = (
            SELECT rowid FROM {foreign_user}
            WHERE {new_match}
        )"#,
        new_match = referred_match(fk, "NEW"),
    )
}

fn insert_trigger(out: &mut String, tbl: &Table) {
    let map = quote_ident(&format!("_synq_id_{}", tbl.name));
    let user = quote_ident(&tbl.name);

    let mut body = String::new();
    let replicated = tbl.replicated_columns();
    if !replicated.is_empty() {
        let tuples = replicated
            .iter()
            .map(|col| format!("({}, NEW.{})", col.field, quote_ident(&col.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            body,
            r#"
    INSERT INTO _synq_log(ts, peer, row_ts, row_peer, field, val)
    SELECT local.ts, local.peer, local.ts, local.peer, tuples.*
    FROM _synq_local AS local, (VALUES {tuples}) AS tuples;
"#
        );
    }
    for fk in &tbl.foreign_keys {
        // a LEFT JOIN keeps the entry when a NULL column leaves the target
        // unresolved
        let _ = write!(
            body,
            r#"
    INSERT INTO _synq_fklog(ts, peer, row_ts, row_peer, field, foreign_row_ts, foreign_row_peer)
    SELECT
        local.ts, local.peer, local.ts, local.peer, {field},
        target.row_ts, target.row_peer
    FROM _synq_local AS local LEFT JOIN (
        {target}
    ) AS target;
"#,
            field = fk.field,
            target = target_select(fk),
        );
    }

    let _ = write!(
        out,
        r#"
CREATE TRIGGER {trig}
AFTER INSERT ON {user}
WHEN (SELECT NOT is_merging FROM _synq_local)
BEGIN
    -- INSERT OR REPLACE does not fire the delete trigger unless recursive
    -- triggers are enabled; attempt the deletion so the replaced row is
    -- marked undone either way.
    DELETE FROM {map} WHERE rowid = NEW.rowid;

    UPDATE _synq_local SET ts = ts + 1;
    UPDATE _synq_context SET ts = _synq_local.ts
    FROM _synq_local WHERE _synq_context.peer = _synq_local.peer;

    INSERT INTO _synq_id(row_ts, row_peer, tbl)
    SELECT ts, peer, {tbl_id} FROM _synq_local;

    INSERT INTO {map}(rowid, row_ts, row_peer)
    SELECT NEW.rowid, ts, peer FROM _synq_local;
{body}END;
"#,
        trig = quote_ident(&format!("_synq_log_insert_{}", tbl.name)),
        tbl_id = tbl.id,
    );
}

fn update_trigger(out: &mut String, tbl: &Table) {
    let map = quote_ident(&format!("_synq_id_{}", tbl.name));
    let user = quote_ident(&tbl.name);

    let replicated = tbl.replicated_columns();
    let mut tracked: Vec<String> = replicated
        .iter()
        .map(|col| quote_ident(&col.name))
        .collect();
    let mut fk_cols: Vec<&str> = tbl.foreign_column_names().into_iter().collect();
    fk_cols.sort_unstable();
    tracked.extend(fk_cols.iter().map(|c| quote_ident(c)));
    if tracked.is_empty() {
        return;
    }

    let mut body = String::new();
    if !replicated.is_empty() {
        let changed = replicated
            .iter()
            .map(|col| {
                let name = quote_ident(&col.name);
                format!(
                    "SELECT {field}, NEW.{name} WHERE OLD.{name} IS NOT NEW.{name}",
                    field = col.field
                )
            })
            .collect::<Vec<_>>()
            .join("\n        UNION ALL ");
        let _ = write!(
            body,
            r#"
    INSERT INTO _synq_log(ts, peer, row_ts, row_peer, field, val)
    SELECT local.ts, local.peer, cur.row_ts, cur.row_peer, tuples.*
    FROM _synq_local AS local, {map} AS cur,
        ({changed}) AS tuples
    WHERE cur.rowid = NEW.rowid;
"#
        );
    }
    for fk in &tbl.foreign_keys {
        let foreign_user = quote_ident(&fk.foreign_table);
        let _ = write!(
            body,
            r#"
    INSERT INTO _synq_fklog(ts, peer, row_ts, row_peer, field, foreign_row_ts, foreign_row_peer)
    SELECT
        local.ts, local.peer, cur.row_ts, cur.row_peer, {field},
        target.row_ts, target.row_peer
    FROM _synq_local AS local, (
        SELECT * FROM {map} WHERE rowid = NEW.rowid
    ) AS cur LEFT JOIN (
        {target}
    ) AS target
    WHERE NOT EXISTS(
        -- an engine-level ON UPDATE CASCADE keeps the logical target
        SELECT 1 FROM (
            SELECT foreign_row_ts, foreign_row_peer FROM _synq_fklog
            WHERE row_ts = cur.row_ts AND row_peer = cur.row_peer AND
                field = {field}
            ORDER BY ts DESC, peer DESC LIMIT 1
        )
        WHERE foreign_row_ts = target.row_ts AND foreign_row_peer = target.row_peer
    ) AND (
        -- a SET NULL cascade of a deleted natural key is not a user update
        NOT ({null_match}) OR EXISTS(
            SELECT 1 FROM {foreign_user}
            WHERE {old_match}
        )
    );
"#,
            field = fk.field,
            target = target_select(fk),
            null_match = null_match(fk),
            old_match = referred_match(fk, "OLD"),
        );
    }

    let _ = write!(
        out,
        r#"
CREATE TRIGGER {trig}
AFTER UPDATE OF {tracked} ON {user}
WHEN (SELECT NOT is_merging FROM _synq_local)
BEGIN
    UPDATE _synq_local SET ts = ts + 1;
    UPDATE _synq_context SET ts = _synq_local.ts
    FROM _synq_local WHERE _synq_context.peer = _synq_local.peer;
{body}END;
"#,
        trig = quote_ident(&format!("_synq_log_update_{}", tbl.name)),
        tracked = tracked.join(", "),
    );
}

/// A local update of the row handle only remaps `_synq_id_<T>`; the change
/// is invisible to other replicas.
fn rowid_remap_trigger(out: &mut String, tbl: &Table) {
    let cols = tbl.rowid_update_columns();
    if cols.is_empty() {
        return;
    }
    let handle = quote_ident(tbl.handle_column());
    let _ = write!(
        out,
        r#"
CREATE TRIGGER {trig}
AFTER UPDATE OF {cols} ON {user}
BEGIN
    UPDATE {map} SET rowid = NEW.{handle}
    WHERE rowid = OLD.{handle};
END;
"#,
        trig = quote_ident(&format!("_synq_log_update_rowid_{}", tbl.name)),
        cols = cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        user = quote_ident(&tbl.name),
        map = quote_ident(&format!("_synq_id_{}", tbl.name)),
    );
}
