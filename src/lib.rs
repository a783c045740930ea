//! Conflict-free replication of SQLite databases.
//!
//! The model is Git-like: a database is initialized once into a replicated
//! database, clones of it then diverge under disconnected edits, and a
//! replica integrates another replica's state with a pull. Convergence is
//! guaranteed by shadow relations maintained next to the user schema: an
//! append-only operation log with per-object undo counters, a causal
//! context, and a hybrid logical clock. User tables stay queryable and
//! writable through plain SQL; schema-derived triggers keep the log in
//! sync.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::backup::Backup;
use serde::{Deserialize, Serialize};

mod clock;
mod error;
pub mod ffi;
mod merge;
pub mod schema;
mod shadow;
mod trigger;

pub use error::{Error, Result};
pub use schema::{Action, Schema};

/// Replication behavior knobs, fixed at `init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Use the wall clock (unix nanoseconds) as a floor for the logical
    /// clock, so operation ids roughly sort chronologically across honest
    /// replicas.
    pub physical_clock: bool,
    /// Map `NO ACTION` referential actions to `CASCADE` instead of
    /// `RESTRICT`.
    pub no_action_is_cascade: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            physical_clock: true,
            no_action_is_cascade: false,
        }
    }
}

/// A handle on one replica, bound to an open SQLite connection.
///
/// All replica state lives in the database itself; the handle carries only
/// the connection and the configuration, so it can be recreated at will.
pub struct Replica<'c> {
    conn: &'c Connection,
    conf: Config,
}

impl<'c> Replica<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Replica::with_config(conn, Config::default())
    }

    pub fn with_config(conn: &'c Connection, conf: Config) -> Self {
        Replica { conn, conf }
    }

    pub fn conn(&self) -> &Connection {
        self.conn
    }

    /// Make the database a replicated database, drawing a random 48-bit
    /// peer identifier.
    ///
    /// The user schema must already be declared and hold no rows: existing
    /// rows would predate the log and never replicate. All-or-nothing, and
    /// only valid once per database.
    pub fn init(&self) -> Result<()> {
        self.init_impl(None)
    }

    /// `init` with a caller-chosen peer identifier.
    pub fn init_with_peer(&self, peer: i64) -> Result<()> {
        self.init_impl(Some(peer))
    }

    fn init_impl(&self, peer: Option<i64>) -> Result<()> {
        let schema = schema::introspect(self.conn, &self.conf)?;
        log::debug!("initializing replication for {} tables", schema.tables.len());
        let tx = self.conn.unchecked_transaction()?;
        for tbl in &schema.tables {
            let populated: bool = tx.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {})",
                    trigger::quote_ident(&tbl.name)
                ),
                [],
                |r| r.get(0),
            )?;
            if populated {
                return Err(Error::State("user tables must be empty at init"));
            }
        }
        shadow::install(&tx)?;
        clock::install(&tx, self.conf.physical_clock)?;
        shadow::install_views(&tx)?;
        tx.execute_batch(&trigger::codegen(&schema)?)?;
        clock::allocate_peer(&tx, peer)?;
        tx.commit()?;
        Ok(())
    }

    /// Byte-level copy of this replica into `target`, which then gets a
    /// fresh peer identifier. `target` must be an empty database.
    pub fn clone_to(&self, target: &mut Connection) -> Result<()> {
        self.clone_impl(target, None)
    }

    pub fn clone_to_with_peer(&self, target: &mut Connection, peer: i64) -> Result<()> {
        self.clone_impl(target, Some(peer))
    }

    fn clone_impl(&self, target: &mut Connection, peer: Option<i64>) -> Result<()> {
        {
            let backup = Backup::new(self.conn, target)?;
            backup.run_to_completion(64, Duration::from_millis(0), None)?;
        }
        clock::allocate_peer(target, peer)?;
        Ok(())
    }

    /// Integrate the state of the replica stored at `remote_path`, resolving
    /// every conflict, inside a single transaction. Pulling the same remote
    /// again is a no-op.
    pub fn pull_from(&self, remote_path: impl AsRef<Path>) -> Result<()> {
        let schema = schema::introspect(self.conn, &self.conf)?;
        merge::pull(self.conn, remote_path.as_ref(), &schema)
    }

    /// Write a database at `path` holding only a snapshot of the causal
    /// context: a compact summary of everything this replica has observed,
    /// usable to compute a delta elsewhere. A full database behaves as a
    /// fingerprint too.
    pub fn fingerprint(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let target = Connection::open(path)?;
        target.execute_batch(shadow::CREATE_CONTEXT)?;
        target.close().map_err(|(_, e)| e)?;
        self.conn.execute(
            "ATTACH DATABASE ?1 AS extern",
            [path.to_string_lossy().as_ref()],
        )?;
        let copied = self
            .conn
            .execute_batch("INSERT INTO extern._synq_context SELECT * FROM _synq_context;");
        let detached = self.conn.execute_batch("DETACH DATABASE extern;");
        copied?;
        detached?;
        Ok(())
    }

    /// Export the log entries a holder of `fingerprint_path` has not
    /// observed yet.
    pub fn delta(
        &self,
        _fingerprint_path: impl AsRef<Path>,
        _delta_path: impl AsRef<Path>,
    ) -> Result<()> {
        Err(Error::Unimplemented("delta"))
    }

    /// The identifier of this replica.
    pub fn peer(&self) -> Result<i64> {
        Ok(clock::current(self.conn)?.0)
    }
}
