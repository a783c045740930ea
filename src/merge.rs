//! Pull: integrate another replica's state into the local database.
//!
//! The remote file is attached as `extern` and the whole merge runs inside
//! one write transaction with deferred foreign keys, so intermediate states
//! need not satisfy referential integrity and any failure rolls the local
//! replica back to its pre-pull bytes. Phases, in order: clock/context
//! reconciliation, log import, conflict resolution, user-table rebuild,
//! context advance. Re-pulling the same remote observes no new entries, so
//! the merge is idempotent.

use std::collections::HashSet;
use std::fmt::Write;
use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;
use crate::schema::{ForeignKey, Schema, Table, Terminal, resolve_reference};
use crate::trigger::quote_ident;

/// Advance the local clock past everything the remote ever observed, then
/// complete both causal contexts so the concurrency joins below are total.
/// The only remote mutation is the idempotent insertion of zero-ts rows.
const CLOCK_AND_CONTEXT: &str = "
UPDATE _synq_local
SET ts = max(ts, (SELECT ifnull(max(ts), 0) FROM extern._synq_context)) + 1;

INSERT OR IGNORE INTO _synq_context SELECT peer, 0 FROM extern._synq_context;
INSERT OR IGNORE INTO extern._synq_context SELECT peer, 0 FROM _synq_context;
";

/// Import every remote entry past the local causal frontier. The two undo
/// relations merge by maximum undo length, which makes them grow-only
/// counters with last-writer metadata.
const IMPORT: &str = "
INSERT INTO _synq_id
SELECT id.* FROM extern._synq_id AS id JOIN _synq_context AS ctx
    ON id.row_ts > ctx.ts AND id.row_peer = ctx.peer;

INSERT INTO _synq_log
SELECT log.* FROM extern._synq_log AS log JOIN _synq_context AS ctx
    ON log.ts > ctx.ts AND log.peer = ctx.peer;

INSERT INTO _synq_fklog
SELECT fklog.*
FROM extern._synq_fklog AS fklog JOIN _synq_context AS ctx
    ON fklog.ts > ctx.ts AND fklog.peer = ctx.peer;

INSERT INTO _synq_id_undo
SELECT undo.* FROM extern._synq_id_undo AS undo JOIN _synq_context AS ctx
    ON undo.ts > ctx.ts AND undo.peer = ctx.peer
WHERE true  -- avoid parsing ambiguity
ON CONFLICT DO UPDATE SET ul = excluded.ul, ts = excluded.ts, peer = excluded.peer
WHERE ul < excluded.ul;

INSERT INTO _synq_undolog
SELECT undo.* FROM extern._synq_undolog AS undo JOIN _synq_context AS ctx
    ON undo.ts > ctx.ts AND undo.peer = ctx.peer
WHERE true  -- avoid parsing ambiguity
ON CONFLICT DO UPDATE SET ul = excluded.ul, ts = excluded.ts, peer = excluded.peer
WHERE ul < excluded.ul;
";

/// Conflict resolution. Five rule families in a fixed order; each writes
/// undo or fklog entries dated by the local clock, with `INSERT OR REPLACE`
/// semantics so re-application is idempotent. Two operations are concurrent
/// when each is newer than what the other side had observed.
const CONFLICT_RESOLUTION: &str = "
-- ON UPDATE RESTRICT: undo concurrent updates to a restricted reference
INSERT OR REPLACE INTO _synq_undolog(ts, peer, obj_peer, obj_ts, ul)
SELECT local.ts, local.peer, log.peer, log.ts, log.ul + 1
FROM _synq_local AS local, _synq_context AS ctx, extern._synq_context AS ectx,
    _synq_log_extra AS log JOIN _synq_uniqueness AS uniq USING(field), _synq_fklog_effective AS fklog
WHERE (
    log.ts > fklog.ts OR (log.ts = fklog.ts AND log.peer = fklog.peer) OR
    (log.ts > ctx.ts AND log.peer = ctx.peer AND fklog.ts > ectx.ts AND fklog.peer = ectx.peer) OR
    (log.ts > ectx.ts AND log.peer = ectx.peer AND fklog.ts > ctx.ts AND fklog.peer = ctx.peer)
) AND (
    log.row_ts = fklog.foreign_row_ts AND
    log.row_peer = fklog.foreign_row_peer AND
    uniq.tbl_index = fklog.foreign_index
) AND fklog.on_update = 1 AND log.ul%2 = 0;

-- ON DELETE RESTRICT: redo deleted rows reachable backward from a visible
-- restricting reference, passing through CASCADE intermediates
INSERT OR REPLACE INTO _synq_id_undo(ts, peer, row_ts, row_peer, ul)
WITH RECURSIVE _synq_restrict_refs(foreign_row_ts, foreign_row_peer) AS (
    SELECT foreign_row_ts, foreign_row_peer
    FROM _synq_fklog_effective
    WHERE on_delete = 1 AND row_ul%2 = 0
    UNION
    SELECT target.foreign_row_ts, target.foreign_row_peer
    FROM _synq_restrict_refs AS src JOIN _synq_fklog_effective AS target
        ON src.foreign_row_ts = target.row_ts AND src.foreign_row_peer = target.row_peer
    WHERE on_delete = 0
)
SELECT local.ts, local.peer, row_ts, row_peer, ul + 1
FROM _synq_local AS local, _synq_restrict_refs JOIN _synq_id_undo
    ON foreign_row_ts = row_ts AND foreign_row_peer = row_peer
WHERE ul%2 = 1;

-- ON UPDATE SET NULL: emit a null target for references whose referred key
-- was updated concurrently (the view trigger dates it at a fresh clock)
INSERT INTO _synq_fklog_effective(row_ts, row_peer, field)
SELECT fklog.row_ts, fklog.row_peer, fklog.field
FROM _synq_context AS ctx, extern._synq_context AS ectx,
    _synq_log_effective AS log JOIN _synq_uniqueness AS uniq USING(field), _synq_fklog_effective AS fklog
WHERE (
    (log.ts > ctx.ts AND log.peer = ctx.peer AND fklog.ts > ectx.ts AND fklog.peer = ectx.peer) OR
    (log.ts > ectx.ts AND log.peer = ectx.peer AND fklog.ts > ctx.ts AND fklog.peer = ctx.peer)
) AND (
    log.row_ts = fklog.foreign_row_ts AND
    log.row_peer = fklog.foreign_row_peer AND
    uniq.tbl_index = fklog.foreign_index
) AND fklog.on_update = 2;

-- uniqueness: among visible rows with identical projections on every field
-- of an index, undo the one with the larger (row_ts, row_peer); the
-- tie-break is symmetric so every replica picks the same loser.
-- TODO: restrict this join to causally concurrent pairs (the undo metadata
-- included); as written it can undo rows whose key collision was already
-- resolved sequentially.
INSERT OR REPLACE INTO _synq_id_undo(ts, peer, row_ts, row_peer, ul)
WITH _synq_unified_log_effective AS (
    SELECT
        log.ts, log.peer, log.row_ts, log.row_peer, log.field,
        log.val, NULL AS foreign_row_ts, NULL AS foreign_row_peer, log.row_ul
    FROM _synq_log_effective AS log
    UNION ALL
    SELECT
        fklog.ts, fklog.peer, fklog.row_ts, fklog.row_peer, fklog.field,
        NULL AS val, fklog.foreign_row_ts, fklog.foreign_row_peer, fklog.row_ul
    FROM _synq_fklog_effective AS fklog
)
SELECT DISTINCT local.ts, local.peer, log.row_ts, log.row_peer, log.row_ul + 1
FROM _synq_local AS local, _synq_unified_log_effective AS log JOIN _synq_unified_log_effective AS self
        ON log.field = self.field AND (
            log.val = self.val OR (
                log.foreign_row_ts = self.foreign_row_ts AND
                log.foreign_row_peer = self.foreign_row_peer
            )
        ) JOIN _synq_uniqueness AS uniq USING(field)
WHERE log.row_ul%2 = 0 AND self.row_ul%2 = 0 AND (
    log.row_ts > self.row_ts OR (
        log.row_ts = self.row_ts AND log.row_peer > self.row_peer
    )
)
GROUP BY log.row_ts, log.row_peer, self.row_ts, self.row_peer, uniq.tbl_index
HAVING count(DISTINCT log.field) >= (
    SELECT count(DISTINCT field) FROM _synq_uniqueness WHERE tbl_index = uniq.tbl_index
);

-- ON DELETE CASCADE: undo visible rows whose reference chain reaches a
-- deleted row through non-SET NULL edges
INSERT OR REPLACE INTO _synq_id_undo(ts, peer, row_ts, row_peer, ul)
WITH RECURSIVE _synq_dangling_refs(row_ts, row_peer, row_ul) AS (
    SELECT fklog.row_ts, fklog.row_peer, fklog.row_ul
    FROM _synq_fklog_effective AS fklog JOIN _synq_id_undo AS undo
        ON fklog.foreign_row_ts = undo.row_ts AND fklog.foreign_row_peer = undo.row_peer
    WHERE fklog.on_delete <> 2 AND fklog.row_ul%2 = 0 AND undo.ul%2 = 1
    UNION
    SELECT src.row_ts, src.row_peer, src.row_ul
    FROM _synq_dangling_refs AS target JOIN _synq_fklog_effective AS src
        ON src.foreign_row_ts = target.row_ts AND src.foreign_row_peer = target.row_peer
    WHERE src.row_ul%2 = 0
)
SELECT local.ts, local.peer, row_ts, row_peer, row_ul + 1
FROM _synq_local AS local, _synq_dangling_refs
WHERE row_ul%2 = 0;
";

/// Advance the context: element-wise max with the remote, then cover the op
/// ids the conflict resolution produced locally (one conditional update per
/// relation that may hold entries at the final local `(peer, ts)`).
const CONTEXT_ADVANCE: &str = "
UPDATE _synq_context SET ts = ctx.ts FROM extern._synq_context AS ctx
WHERE ctx.ts > _synq_context.ts AND _synq_context.peer = ctx.peer;

UPDATE _synq_context SET ts = local.ts
FROM _synq_local AS local JOIN _synq_id_undo USING(peer, ts)
WHERE _synq_context.peer = local.peer;

UPDATE _synq_context SET ts = local.ts
FROM _synq_local AS local JOIN _synq_undolog USING(peer, ts)
WHERE _synq_context.peer = local.peer;

UPDATE _synq_context SET ts = local.ts
FROM _synq_local AS local JOIN _synq_log USING(peer, ts)
WHERE _synq_context.peer = local.peer;

UPDATE _synq_context SET ts = local.ts
FROM _synq_local AS local JOIN _synq_fklog USING(peer, ts)
WHERE _synq_context.peer = local.peer;
";

/// Assemble the full merge script, without ATTACH/DETACH (those cannot run
/// inside the transaction).
fn pull_script(schema: &Schema) -> Result<String> {
    let mut script = String::from(
        "PRAGMA defer_foreign_keys = ON;  -- switches off at the end of the transaction

UPDATE _synq_local SET is_merging = 1;
",
    );
    script.push_str(CLOCK_AND_CONTEXT);
    script.push_str(IMPORT);
    script.push_str(CONFLICT_RESOLUTION);
    script.push_str(&rebuild(schema)?);
    script.push_str(CONTEXT_ADVANCE);
    script.push_str("\nUPDATE _synq_local SET is_merging = 0;\n");
    Ok(script)
}

/// Rebuild the user tables from the merged log: apply deletions and handle
/// assignment for every table first, then materialize the affected rows
/// (cross-table references need every handle in place beforehand).
fn rebuild(schema: &Schema) -> Result<String> {
    let mut out = String::new();
    for tbl in &schema.tables {
        assign_handles(&mut out, tbl);
    }
    for tbl in &schema.tables {
        materialize(&mut out, schema, tbl)?;
    }
    Ok(out)
}

fn assign_handles(out: &mut String, tbl: &Table) {
    let user = quote_ident(&tbl.name);
    let map = quote_ident(&format!("_synq_id_{}", tbl.name));
    let _ = write!(
        out,
        r#"
-- Apply deletions (the map removal cascades through the delete trigger)
DELETE FROM {user} WHERE rowid IN (
    SELECT id.rowid FROM {map} AS id
        JOIN _synq_id_undo AS undo
            ON id.row_ts = undo.row_ts AND id.row_peer = undo.row_peer
    WHERE undo.ul%2 = 1
);

-- Auto-assign local row handles for new visible rows
INSERT INTO {map}(row_peer, row_ts)
SELECT id.row_peer, id.row_ts
FROM _synq_id AS id JOIN _synq_context AS ctx
    ON id.row_ts > ctx.ts AND id.row_peer = ctx.peer
WHERE id.tbl = {tbl_id} AND NOT EXISTS(
    SELECT 1 FROM _synq_id_undo AS undo
    WHERE undo.ul%2 = 1 AND
        undo.row_ts = id.row_ts AND undo.row_peer = id.row_peer
);

-- Auto-assign local row handles for redone rows
INSERT OR IGNORE INTO {map}(row_ts, row_peer)
SELECT id.row_ts, id.row_peer
FROM _synq_id_undo AS redo
    JOIN _synq_context AS ctx
        ON redo.ts > ctx.ts AND redo.peer = ctx.peer
    JOIN _synq_id AS id
        ON redo.row_ts = id.row_ts AND redo.row_peer = id.row_peer
            AND id.tbl = {tbl_id}
WHERE redo.ul%2 = 0;
"#,
        tbl_id = tbl.id,
    );
}

/// Latest visible log value of one replicated column, relative to the `id`
/// row of the surrounding materialization query.
fn column_selector(field: i64, name: &str) -> String {
    format!(
        r#"(
    SELECT log.val FROM _synq_log_extra AS log
    WHERE log.row_ts = id.row_ts AND log.row_peer = id.row_peer AND
        log.field = {field} AND log.ul%2 = 0
    ORDER BY log.ts DESC, log.peer DESC LIMIT 1
) AS {name}"#,
        name = quote_ident(name),
    )
}

/// User-visible value of one foreign-key column: start from the current
/// target of the reference, hop through referred columns that are
/// themselves foreign keys, and finish on the terminal referred scalar (a
/// log value, or a local row handle when the chain ends on a rowid alias).
fn reference_selector(schema: &Schema, fk: &ForeignKey, col: &str) -> Result<String> {
    let mut selector = format!(
        r#"SELECT fklog.* FROM _synq_fklog_extra AS fklog
    WHERE fklog.field = {field} AND fklog.ul%2 = 0 AND
        fklog.row_peer = id.row_peer AND fklog.row_ts = id.row_ts AND
        fklog.row_ul%2 = 0
    ORDER BY fklog.ts DESC, fklog.peer DESC LIMIT 1"#,
        field = fk.field,
    );
    let resolved = resolve_reference(schema, fk, col)?;
    for hop in &resolved.hops {
        selector = format!(
            r#"SELECT fklog2.* FROM (
        {selector}
    ) AS fklog LEFT JOIN _synq_fklog_extra AS fklog2
        ON fklog2.field = {hop_field} AND
            fklog2.ul%2 = 0 AND
            fklog.foreign_row_peer = fklog2.row_peer AND
            fklog.foreign_row_ts = fklog2.row_ts
    WHERE fklog2.row_ul%2 = 0
    ORDER BY fklog2.ts DESC, fklog2.peer DESC LIMIT 1"#,
            hop_field = hop.field,
        );
    }
    let terminal = match resolved.terminal {
        Terminal::Rowid(referred_tbl) => format!(
            r#"SELECT rw.rowid FROM (
        {selector}
    ) AS fklog LEFT JOIN {referred_map} AS rw
        ON fklog.foreign_row_peer = rw.row_peer AND
            fklog.foreign_row_ts = rw.row_ts"#,
            referred_map = quote_ident(&format!("_synq_id_{}", referred_tbl.name)),
        ),
        Terminal::Value(_, referred_col) => format!(
            r#"SELECT log.val FROM (
        {selector}
    ) AS fklog LEFT JOIN _synq_log_extra AS log
        ON log.row_peer = fklog.foreign_row_peer AND
            log.row_ts = fklog.foreign_row_ts AND
            log.field = {referred_field} AND log.ul%2 = 0
    WHERE log.row_ul%2 = 0
    ORDER BY log.ts DESC, log.peer DESC LIMIT 1"#,
            referred_field = referred_col.field,
        ),
    };
    Ok(format!("({terminal}) AS {}", quote_ident(col)))
}

fn materialize(out: &mut String, schema: &Schema, tbl: &Table) -> Result<()> {
    let user = quote_ident(&tbl.name);
    let map = quote_ident(&format!("_synq_id_{}", tbl.name));

    let mut col_names: Vec<String> = vec!["rowid".to_owned()];
    let mut selectors: Vec<String> = vec!["id.rowid".to_owned()];
    let mut seen: HashSet<&str> = HashSet::new();
    for col in tbl.replicated_columns() {
        seen.insert(&col.name);
        col_names.push(quote_ident(&col.name));
        selectors.push(column_selector(col.field, &col.name));
    }
    for fk in &tbl.foreign_keys {
        for col in &fk.columns {
            if !seen.insert(col) {
                continue;
            }
            col_names.push(quote_ident(col));
            selectors.push(reference_selector(schema, fk, col)?);
        }
    }

    // The id set: rows with a newly observed effective entry or a newly
    // undone one, redone rows, rows downstream of an ON UPDATE CASCADE,
    // rows whose SET NULL target was deleted, and freshly imported rows.
    let _ = write!(
        out,
        r#"
INSERT OR REPLACE INTO {user}({col_names})
WITH RECURSIVE _synq_unified_log AS (
    SELECT
        log.ts, log.peer, log.row_ts, log.row_peer, log.field,
        log.val, NULL AS foreign_row_ts, NULL AS foreign_row_peer,
        log.ul, log.ul_ts, log.ul_peer, log.row_ul
    FROM _synq_log_effective AS log
    UNION ALL
    SELECT
        fklog.ts, fklog.peer, fklog.row_ts, fklog.row_peer, fklog.field,
        NULL AS val, fklog.foreign_row_ts, fklog.foreign_row_peer,
        fklog.ul, fklog.ul_ts, fklog.ul_peer, fklog.row_ul
    FROM _synq_fklog_effective AS fklog
), _synq_cascade_refs(row_ts, row_peer, field) AS (
    -- ON UPDATE CASCADE closure seeded by newly observed or newly undone
    -- entries on the referred key
    SELECT fklog.row_ts, fklog.row_peer, fklog.field
    FROM _synq_context AS ctx, _synq_unified_log AS log
        JOIN _synq_uniqueness AS uniq USING(field)
        JOIN _synq_fklog_effective AS fklog
            ON log.row_ts = fklog.foreign_row_ts AND
                log.row_peer = fklog.foreign_row_peer AND
                uniq.tbl_index = fklog.foreign_index
    WHERE fklog.on_update = 0 AND fklog.row_ul%2 = 0 AND
        ((log.peer = ctx.peer AND log.ts > ctx.ts) OR
        (log.ul_peer = ctx.peer AND log.ul_ts > ctx.ts))
    UNION
    SELECT src.row_ts, src.row_peer, src.field
    FROM _synq_cascade_refs AS target
        JOIN _synq_uniqueness AS uniq USING(field)
        JOIN _synq_fklog_effective AS src
            ON src.foreign_row_ts = target.row_ts AND
                src.foreign_row_peer = target.row_peer AND
                uniq.tbl_index = src.foreign_index
    WHERE src.on_update = 0 AND src.row_ul%2 = 0
)
SELECT {selectors} FROM (
    SELECT id.rowid, id.row_ts, id.row_peer FROM (
        SELECT log.row_ts, log.row_peer FROM _synq_unified_log AS log
            JOIN _synq_context AS ctx
                ON (log.ul%2 = 0 AND log.peer = ctx.peer AND log.ts > ctx.ts) OR
                    (log.ul%2 = 1 AND log.ul_peer = ctx.peer AND log.ul_ts > ctx.ts)
        WHERE log.row_ul%2 = 0
        UNION
        SELECT redo.row_ts, redo.row_peer FROM _synq_id_undo AS redo
            JOIN _synq_context AS ctx
                ON redo.ts > ctx.ts AND redo.peer = ctx.peer
        WHERE redo.ul%2 = 0
        UNION
        SELECT log.row_ts, log.row_peer FROM _synq_context AS ctx
            JOIN _synq_undolog AS undo
                ON undo.ts > ctx.ts AND undo.peer = ctx.peer
            JOIN _synq_log AS log
                ON undo.obj_ts = log.ts AND undo.obj_peer = log.peer
        WHERE undo.ul%2 = 1
        UNION
        SELECT log.row_ts, log.row_peer FROM _synq_context AS ctx
            JOIN _synq_undolog AS undo
                ON undo.ts > ctx.ts AND undo.peer = ctx.peer
            JOIN _synq_fklog AS log
                ON undo.obj_ts = log.ts AND undo.obj_peer = log.peer
        WHERE undo.ul%2 = 1
        UNION
        SELECT row_ts, row_peer FROM _synq_cascade_refs
        UNION
        SELECT fklog.row_ts, fklog.row_peer FROM _synq_fklog_extra AS fklog
            JOIN _synq_id_undo AS undo
                ON fklog.foreign_row_peer = undo.row_peer AND
                    fklog.foreign_row_ts = undo.row_ts
        WHERE undo.ul%2 = 1 AND fklog.on_delete = 2
    ) JOIN {map} AS id
        USING(row_ts, row_peer)
    UNION
    SELECT id.rowid, id.row_ts, id.row_peer FROM {map} AS id
        JOIN _synq_context AS ctx
            ON id.row_ts > ctx.ts AND id.row_peer = ctx.peer
) AS id;
"#,
        col_names = col_names.join(", "),
        selectors = selectors.join(",\n    "),
    );
    Ok(())
}

/// Attach `remote` and run the merge in a single transaction; detach in
/// every outcome.
pub(crate) fn pull(conn: &Connection, remote: &Path, schema: &Schema) -> Result<()> {
    let script = pull_script(schema)?;
    log::debug!("pulling from {}", remote.display());
    conn.execute(
        "ATTACH DATABASE ?1 AS extern",
        [remote.to_string_lossy().as_ref()],
    )?;
    let merged = (|| -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&script)?;
        tx.commit()?;
        Ok(())
    })();
    let detached = conn.execute_batch("DETACH DATABASE extern;");
    merged?;
    detached?;
    Ok(())
}
