//! Hybrid logical clock of a replica.
//!
//! The clock lives inside the database so that the logging triggers can
//! advance it synchronously with every user write. `_synq_local` is the
//! per-replica singleton holding the peer id, the current timestamp and the
//! merge flag; `(ts, peer)` pairs drawn from it are globally unique and
//! totally ordered operation ids.

use rusqlite::Connection;

use crate::error::Result;

pub(crate) const CREATE_LOCAL: &str = "
CREATE TABLE _synq_local(
    id integer PRIMARY KEY DEFAULT 1 CHECK(id = 1),
    peer integer NOT NULL DEFAULT 0,
    ts integer NOT NULL DEFAULT 0 CHECK(ts >= 0),
    is_merging integer NOT NULL DEFAULT 0 CHECK(is_merging & 1 = is_merging)
) STRICT;
INSERT INTO _synq_local DEFAULT VALUES;
";

/// Raises every unit bump of the logical counter to the wall clock, so that
/// operation ids roughly sort chronologically across replicas. The counter
/// stays strictly monotone even when the wall clock steps backwards: max()
/// never lowers the freshly bumped value.
const CREATE_PHYSICAL_FLOOR: &str = "
-- `UPDATE _synq_local SET ts = ts + 1` refreshes the hybrid logical clock.
CREATE TRIGGER _synq_local_clock
AFTER UPDATE OF ts ON _synq_local WHEN (OLD.ts + 1 = NEW.ts)
BEGIN
    UPDATE _synq_local SET ts = max(NEW.ts, CAST(
        (julianday('now') - julianday('1970-01-01')) * 86400.0 * 1000000000.0
            AS integer
        -- unix epoch in nanoseconds
        -- https://www.sqlite.org/lang_datefunc.html#examples
    ));
END;
";

/// Create `_synq_local` and, unless the clock is purely logical, the
/// wall-clock floor trigger.
pub(crate) fn install(conn: &Connection, physical: bool) -> Result<()> {
    conn.execute_batch(CREATE_LOCAL)?;
    if physical {
        conn.execute_batch(CREATE_PHYSICAL_FLOOR)?;
    }
    Ok(())
}

/// Assign the replica identifier and seed its causal context entry.
///
/// Without an explicit peer, an identifier with 48 bits of entropy is drawn
/// from SQLite's own generator.
pub(crate) fn allocate_peer(conn: &Connection, peer: Option<i64>) -> Result<()> {
    match peer {
        None => conn.execute("UPDATE _synq_local SET peer = (random() >> 16)", [])?,
        Some(p) => conn.execute("UPDATE _synq_local SET peer = ?1", [p])?,
    };
    conn.execute(
        "INSERT INTO _synq_context(peer, ts) SELECT peer, 0 FROM _synq_local",
        [],
    )?;
    Ok(())
}

/// Current `(peer, ts)` of the replica.
pub(crate) fn current(conn: &Connection) -> Result<(i64, i64)> {
    let pair = conn.query_row("SELECT peer, ts FROM _synq_local", [], |r| {
        Ok((r.get(0)?, r.get(1)?))
    })?;
    Ok(pair)
}
