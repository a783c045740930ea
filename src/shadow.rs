//! Shadow relations shared by all replicas.
//!
//! These tables are the wire protocol: a pull attaches another replica's
//! database file and reads exactly these relations. The logs are append-only
//! ground truth; the user tables are a projection rebuilt from them.

use rusqlite::Connection;

use crate::error::Result;

/// Causal context: `peer -> highest contiguous observed ts`.
///
/// Kept on its own so a fingerprint database can be created from just this
/// relation.
pub(crate) const CREATE_CONTEXT: &str = "
CREATE TABLE _synq_context(
    peer integer PRIMARY KEY,
    ts integer NOT NULL DEFAULT 0 CHECK (ts >= 0)
) STRICT;
";

pub(crate) const CREATE_REPLICATION_TABLES: &str = "
CREATE TABLE _synq_id(
    row_ts integer NOT NULL,
    row_peer integer NOT NULL REFERENCES _synq_context(peer) ON DELETE CASCADE ON UPDATE CASCADE,
    tbl integer NOT NULL,
    PRIMARY KEY(row_ts DESC, row_peer DESC),
    UNIQUE(row_peer, row_ts)
) STRICT, WITHOUT ROWID;

CREATE TABLE _synq_id_undo(
    row_ts integer NOT NULL,
    row_peer integer NOT NULL,
    ul integer NOT NULL DEFAULT 0 CHECK(ul >= 0), -- undo length
    ts integer NOT NULL CHECK(ts >= row_ts),
    peer integer NOT NULL,
    PRIMARY KEY(row_ts DESC, row_peer DESC),
    FOREIGN KEY(row_ts, row_peer) REFERENCES _synq_id(row_ts, row_peer)
        ON DELETE CASCADE ON UPDATE CASCADE
) STRICT, WITHOUT ROWID;
CREATE INDEX _synq_id_undo_index_ts ON _synq_id_undo(peer, ts);

CREATE TABLE _synq_log(
    ts integer NOT NULL CHECK(ts >= row_ts),
    peer integer NOT NULL,
    row_ts integer NOT NULL,
    row_peer integer NOT NULL,
    field integer NOT NULL,
    val any,
    PRIMARY KEY(row_ts, row_peer, field, ts, peer),
    FOREIGN KEY(row_ts, row_peer) REFERENCES _synq_id(row_ts, row_peer)
        ON DELETE CASCADE ON UPDATE CASCADE
) STRICT;
CREATE INDEX _synq_log_index_ts ON _synq_log(peer, ts);

CREATE TABLE _synq_fklog(
    ts integer NOT NULL CHECK(ts >= row_ts),
    peer integer NOT NULL,
    row_ts integer NOT NULL,
    row_peer integer NOT NULL,
    field integer NOT NULL,
    foreign_row_ts integer DEFAULT NULL,
    foreign_row_peer integer DEFAULT NULL,
    PRIMARY KEY(row_ts, row_peer, field, ts, peer),
    FOREIGN KEY(row_ts, row_peer) REFERENCES _synq_id(row_ts, row_peer)
        ON DELETE CASCADE ON UPDATE CASCADE,
    FOREIGN KEY(foreign_row_ts, foreign_row_peer) REFERENCES _synq_id(row_ts, row_peer)
        ON DELETE NO ACTION ON UPDATE CASCADE
) STRICT;
CREATE INDEX _synq_fklog_index_ts ON _synq_fklog(peer, ts);

CREATE TABLE _synq_undolog(
    obj_ts integer NOT NULL,
    obj_peer integer NOT NULL,
    ul integer NOT NULL DEFAULT 0 CHECK(ul >= 0), -- undo length
    ts integer NOT NULL CHECK(ts >= obj_ts),
    peer integer NOT NULL,
    PRIMARY KEY(obj_ts DESC, obj_peer DESC)
) STRICT, WITHOUT ROWID;
CREATE INDEX _synq_undolog_ts ON _synq_undolog(peer, ts);
";

/// Static schema metadata: which replicated field belongs to which
/// uniqueness constraint, and the action policy of every foreign key.
pub(crate) const CREATE_METADATA_TABLES: &str = "
CREATE TABLE _synq_uniqueness(
    field integer NOT NULL,
    tbl_index integer NOT NULL,
    PRIMARY KEY(field, tbl_index)
) STRICT;

CREATE TABLE _synq_fk(
    field integer PRIMARY KEY,
    -- 0: CASCADE, 1: RESTRICT, 2: SET NULL
    on_delete integer NOT NULL CHECK(on_delete BETWEEN 0 AND 2),
    on_update integer NOT NULL CHECK(on_update BETWEEN 0 AND 2),
    foreign_index integer NOT NULL
) STRICT;

CREATE TABLE _synq_names(
    id integer PRIMARY KEY,
    name text NOT NULL
) STRICT;
";

/// Derived relations: the visible value per `(row, field)` and the current
/// foreign-key target per reference, after applying the undo lengths.
///
/// A log entry is effective when its own undo length is even and no entry
/// with a greater `(ts, peer)` on the same `(row, field)` is visible. Ties
/// on `ts` are broken by the larger peer; peers are distinct so the order
/// is total.
pub(crate) const CREATE_VIEWS: &str = "
CREATE VIEW _synq_log_extra AS
SELECT log.*,
    ifnull(undo.ul, 0) AS ul, undo.ts AS ul_ts, undo.peer AS ul_peer,
    ifnull(tbl_undo.ul, 0) AS row_ul, tbl_undo.ts AS row_ul_ts, tbl_undo.peer AS row_ul_peer
FROM _synq_log AS log
    LEFT JOIN _synq_id_undo AS tbl_undo
        USING(row_ts, row_peer)
    LEFT JOIN _synq_undolog AS undo
        ON log.ts = undo.obj_ts AND log.peer = undo.obj_peer;

CREATE VIEW _synq_log_effective AS
SELECT log.* FROM _synq_log_extra AS log
WHERE log.ul%2 = 0 AND NOT EXISTS(
    SELECT 1 FROM _synq_log_extra AS self
    WHERE self.row_ts = log.row_ts AND self.row_peer = log.row_peer AND self.field = log.field AND
        (self.ts > log.ts OR (self.ts = log.ts AND self.peer > log.peer)) AND self.ul%2 = 0
);

CREATE VIEW _synq_fklog_extra AS
SELECT fklog.*,
    ifnull(undo.ul, 0) AS ul, undo.ts AS ul_ts, undo.peer AS ul_peer,
    ifnull(tbl_undo.ul, 0) AS row_ul, tbl_undo.ts AS row_ul_ts, tbl_undo.peer AS row_ul_peer,
    fk.on_update, fk.on_delete, fk.foreign_index
FROM _synq_fklog AS fklog
    LEFT JOIN _synq_id_undo AS tbl_undo
        USING(row_ts, row_peer)
    LEFT JOIN _synq_undolog AS undo
        ON fklog.ts = undo.obj_ts AND fklog.peer = undo.obj_peer
    LEFT JOIN _synq_fk AS fk
        USING(field);

CREATE VIEW _synq_fklog_effective AS
SELECT fklog.* FROM _synq_fklog_extra AS fklog
WHERE fklog.ul%2 = 0 AND NOT EXISTS(
    SELECT 1 FROM _synq_fklog_extra AS self
    WHERE self.ul%2 = 0 AND
        self.row_ts = fklog.row_ts AND self.row_peer = fklog.row_peer AND self.field = fklog.field AND
        (self.ts > fklog.ts OR (self.ts = fklog.ts AND self.peer > fklog.peer))
);

-- Appends a fklog entry dated at a freshly bumped clock. Used by the merge
-- to emit null targets for ON UPDATE SET NULL resolutions.
CREATE TRIGGER _synq_fklog_effective_insert
INSTEAD OF INSERT ON _synq_fklog_effective WHEN (
    NEW.peer IS NULL AND NEW.ts IS NULL
)
BEGIN
    UPDATE _synq_local SET ts = ts + 1;

    INSERT INTO _synq_fklog(
        ts, peer, row_ts, row_peer, field,
        foreign_row_ts, foreign_row_peer
    ) SELECT local.ts, local.peer, NEW.row_ts, NEW.row_peer, NEW.field,
        NEW.foreign_row_ts, NEW.foreign_row_peer
    FROM _synq_local AS local;
END;

CREATE VIEW _synq_id_debug AS
SELECT id.row_ts, id.row_peer, id.tbl, names.name, undo.ul
FROM _synq_id AS id
    LEFT JOIN _synq_id_undo AS undo USING(row_ts, row_peer)
    LEFT JOIN _synq_names AS names ON names.id = id.tbl;
";

/// Install every schema-independent shadow relation. The per-table bi-maps
/// and triggers are generated separately from the introspected schema.
pub(crate) fn install(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_CONTEXT)?;
    conn.execute_batch(CREATE_REPLICATION_TABLES)?;
    conn.execute_batch(CREATE_METADATA_TABLES)?;
    Ok(())
}

pub(crate) fn install_views(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_VIEWS)?;
    Ok(())
}
