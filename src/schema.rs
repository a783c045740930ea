//! Introspection of the user schema into a descriptor model.
//!
//! The triggers and the merge procedure are generated from this model, so
//! everything here must be deterministic for a given schema: metadata ids
//! are assigned by a fixed walk (table, then columns, then unique indexes,
//! then foreign keys, in declaration order) and are persisted in the shadow
//! metadata tables at init.
//!
//! Unsupported schemas are rejected up front, before any state change:
//! `WITHOUT ROWID` tables, virtual tables, a column named like the engine
//! row handle that is not an `INTEGER PRIMARY KEY` alias, `SET DEFAULT`
//! referential actions, and reference chains the merge cannot resolve.

use std::collections::{BTreeMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use crate::Config;
use crate::error::{Error, Result};

/// Referential action of a foreign key, as persisted in `_synq_fk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Cascade,
    Restrict,
    SetNull,
}

impl Action {
    pub(crate) fn code(self) -> i64 {
        match self {
            Action::Cascade => 0,
            Action::Restrict => 1,
            Action::SetNull => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub name: String,
    /// Metadata id, the `field` of `_synq_log` entries for this column.
    pub field: i64,
    /// Generated columns keep their id but are never replicated.
    pub generated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UniqueIndex {
    /// Metadata id, the `tbl_index` of `_synq_uniqueness` rows.
    pub index: i64,
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    /// Metadata id, the `field` of `_synq_fklog` entries for this reference.
    pub field: i64,
    pub columns: Vec<String>,
    pub foreign_table: String,
    pub referred_columns: Vec<String>,
    pub on_delete: Action,
    pub on_update: Action,
}

#[derive(Debug, Clone, Serialize)]
pub struct Table {
    pub name: String,
    /// Metadata id, the `tbl` tag of `_synq_id` rows.
    pub id: i64,
    pub columns: Vec<Column>,
    pub uniques: Vec<UniqueIndex>,
    pub foreign_keys: Vec<ForeignKey>,
    /// The column aliasing the engine rowid, when the table declares an
    /// `INTEGER PRIMARY KEY`.
    pub rowid_alias: Option<String>,
    pub autoincrement: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Table {
    pub fn has_rowid_alias(&self) -> bool {
        self.rowid_alias.is_some()
    }

    /// Column through which local statements address the row handle.
    pub(crate) fn handle_column(&self) -> &str {
        self.rowid_alias.as_deref().unwrap_or("rowid")
    }

    pub fn primary_key(&self) -> Option<&UniqueIndex> {
        self.uniques.iter().find(|u| u.primary)
    }

    pub fn foreign_column_names(&self) -> HashSet<&str> {
        self.foreign_keys
            .iter()
            .flat_map(|fk| fk.columns.iter().map(String::as_str))
            .collect()
    }

    /// Columns whose values are tracked in `_synq_log`: non-generated,
    /// not the rowid alias, not a member of any foreign key.
    pub fn replicated_columns(&self) -> Vec<&Column> {
        let fk_cols = self.foreign_column_names();
        self.columns
            .iter()
            .filter(|c| {
                !c.generated
                    && Some(c.name.as_str()) != self.rowid_alias.as_deref()
                    && !fk_cols.contains(c.name.as_str())
            })
            .collect()
    }

    /// Every name through which a statement can assign the row handle.
    pub(crate) fn rowid_update_columns(&self) -> Vec<&str> {
        let declared: HashSet<String> = self
            .columns
            .iter()
            .map(|c| c.name.to_ascii_lowercase())
            .collect();
        let mut out = Vec::new();
        if let Some(alias) = self.rowid_alias.as_deref() {
            out.push(alias);
        }
        for reserved in ["rowid", "_rowid_", "oid"] {
            if !declared.contains(reserved) {
                out.push(reserved);
            }
        }
        out
    }
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// The uniqueness constraint of the referred table that a foreign key
    /// points at. Its absence indicates a reference to non-unique columns,
    /// which the engine would reject as well.
    pub(crate) fn foreign_unique(&self, fk: &ForeignKey) -> Result<&UniqueIndex> {
        let target = self.table(&fk.foreign_table).ok_or_else(|| {
            Error::UnsupportedSchema(format!("unknown referred table {}", fk.foreign_table))
        })?;
        let referred: HashSet<&str> = fk.referred_columns.iter().map(String::as_str).collect();
        target
            .uniques
            .iter()
            .find(|u| {
                u.columns.len() == referred.len()
                    && u.columns.iter().all(|c| referred.contains(c.as_str()))
            })
            .ok_or_else(|| {
                Error::UnsupportedSchema(format!(
                    "no unique index on {}({}) referred by a foreign key",
                    fk.foreign_table,
                    fk.referred_columns.join(", ")
                ))
            })
    }
}

/// Terminal of a resolved foreign-key reference chain.
pub(crate) enum Terminal<'a> {
    /// The referred column aliases the rowid of this table.
    Rowid(&'a Table),
    /// The referred column is a replicated column of this table.
    Value(&'a Table, &'a Column),
}

/// A foreign-key column resolved to the place its user-visible value lives:
/// zero or more hops through intermediate foreign keys, then a terminal.
pub(crate) struct ResolvedRef<'a> {
    pub hops: Vec<&'a ForeignKey>,
    pub terminal: Terminal<'a>,
}

/// Follow a foreign-key column to its terminal referred column, hopping
/// through referred columns that are themselves foreign keys.
pub(crate) fn resolve_reference<'a>(
    schema: &'a Schema,
    fk: &'a ForeignKey,
    col: &str,
) -> Result<ResolvedRef<'a>> {
    let mut hops = Vec::new();
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    let mut cur_fk = fk;
    let mut cur_col = col.to_owned();
    loop {
        let target = schema.table(&cur_fk.foreign_table).ok_or_else(|| {
            Error::UnsupportedSchema(format!("unknown referred table {}", cur_fk.foreign_table))
        })?;
        let pos = cur_fk
            .columns
            .iter()
            .position(|c| *c == cur_col)
            .ok_or(Error::State("foreign-key column not in its own key"))?;
        let referred = target
            .rowid_alias
            .clone()
            .filter(|alias| cur_fk.referred_columns[pos] == *alias);
        if referred.is_some() {
            return Ok(ResolvedRef {
                hops,
                terminal: Terminal::Rowid(target),
            });
        }
        let referred = &cur_fk.referred_columns[pos];
        let owners: Vec<&ForeignKey> = target
            .foreign_keys
            .iter()
            .filter(|f| f.columns.contains(referred))
            .collect();
        match owners.as_slice() {
            [] => {
                let column = target
                    .columns
                    .iter()
                    .find(|c| c.name == *referred)
                    .ok_or_else(|| {
                        Error::UnsupportedSchema(format!(
                            "referred column {}.{} does not exist",
                            target.name, referred
                        ))
                    })?;
                return Ok(ResolvedRef {
                    hops,
                    terminal: Terminal::Value(target, column),
                });
            }
            [next] => {
                if !seen.insert((next.field, referred.clone())) {
                    return Err(Error::UnsupportedSchema(format!(
                        "cyclic reference chain through {}.{}",
                        target.name, referred
                    )));
                }
                hops.push(*next);
                cur_fk = *next;
                cur_col = referred.clone();
            }
            _ => {
                return Err(Error::UnsupportedSchema(format!(
                    "column {}.{} is referred to but belongs to several foreign keys",
                    target.name, referred
                )));
            }
        }
    }
}

struct RawFk {
    field: i64,
    columns: Vec<String>,
    foreign_table: String,
    referred: Vec<Option<String>>,
    on_delete: Action,
    on_update: Action,
}

struct RawTable {
    name: String,
    id: i64,
    columns: Vec<Column>,
    uniques: Vec<UniqueIndex>,
    rowid_alias: Option<String>,
    autoincrement: bool,
    fks: Vec<RawFk>,
}

/// Read the user schema (everything but `sqlite_*` and `_synq_*`) into the
/// descriptor model.
pub(crate) fn introspect(conn: &Connection, conf: &Config) -> Result<Schema> {
    let mut raw = Vec::new();
    let mut next_id: i64 = 0;
    for name in user_table_names(conn)? {
        raw.push(read_table(conn, &name, conf, &mut next_id)?);
    }
    link_foreign_keys(raw)
}

fn user_table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND
            name NOT LIKE 'sqlite_%' AND name NOT LIKE '_synq_%'
        ORDER BY rowid",
    )?;
    let names = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn read_table(
    conn: &Connection,
    name: &str,
    conf: &Config,
    next_id: &mut i64,
) -> Result<RawTable> {
    let (kind, without_rowid): (String, i64) = conn.query_row(
        "SELECT type, wr FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
        [name],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if kind != "table" {
        return Err(Error::UnsupportedSchema(format!(
            "{name} is a {kind}, only plain tables are replicated"
        )));
    }
    if without_rowid != 0 {
        return Err(Error::UnsupportedSchema(format!(
            "{name} is a WITHOUT ROWID table"
        )));
    }
    let sql: String = conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |r| r.get(0),
    )?;
    let autoincrement = sql.to_ascii_uppercase().contains("AUTOINCREMENT");

    let id = take_id(next_id);
    let mut columns = Vec::new();
    // (name, declared type, pk ordinal)
    let mut decls: Vec<(String, String, i64)> = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT name, type, pk, hidden FROM pragma_table_xinfo(?1)")?;
        let mut rows = stmt.query([name])?;
        while let Some(row) = rows.next()? {
            let col_name: String = row.get(0)?;
            let col_type: String = row.get(1)?;
            let pk: i64 = row.get(2)?;
            let hidden: i64 = row.get(3)?;
            columns.push(Column {
                name: col_name.clone(),
                field: take_id(next_id),
                generated: hidden != 0,
            });
            decls.push((col_name, col_type, pk));
        }
    }

    let indexes = read_indexes(conn, name)?;
    let rowid_alias = rowid_alias(&decls, &indexes);
    for col in &columns {
        let lower = col.name.to_ascii_lowercase();
        if matches!(lower.as_str(), "rowid" | "_rowid_" | "oid")
            && Some(col.name.as_str()) != rowid_alias.as_deref()
        {
            return Err(Error::UnsupportedSchema(format!(
                "{name}.{} shadows the engine row handle",
                col.name
            )));
        }
    }

    let mut uniques = Vec::new();
    if let Some(alias) = &rowid_alias {
        uniques.push(UniqueIndex {
            index: take_id(next_id),
            name: None,
            columns: vec![alias.clone()],
            primary: true,
        });
    }
    for (idx_name, origin, cols) in indexes {
        // Expression members surface as a NULL column name; such an index
        // cannot participate in replicated uniqueness.
        if cols.iter().any(Option::is_none) {
            continue;
        }
        uniques.push(UniqueIndex {
            index: take_id(next_id),
            name: Some(idx_name),
            columns: cols.into_iter().flatten().collect(),
            primary: origin == "pk",
        });
    }

    let fks = read_foreign_keys(conn, name, conf, next_id)?;
    Ok(RawTable {
        name: name.to_owned(),
        id,
        columns,
        uniques,
        rowid_alias,
        autoincrement,
        fks,
    })
}

fn take_id(next_id: &mut i64) -> i64 {
    let id = *next_id;
    *next_id += 1;
    id
}

type RawIndex = (String, String, Vec<Option<String>>);

/// Unique, non-partial indexes of a table: `(name, origin, columns)`.
fn read_indexes(conn: &Connection, table: &str) -> Result<Vec<RawIndex>> {
    let mut out = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT name, origin FROM pragma_index_list(?1) WHERE \"unique\" = 1 AND partial = 0",
    )?;
    let list = stmt
        .query_map([table], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (idx_name, origin) in list {
        let mut stmt =
            conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let cols = stmt
            .query_map([&idx_name], |r| r.get::<_, Option<String>>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push((idx_name, origin, cols));
    }
    Ok(out)
}

/// An `INTEGER PRIMARY KEY` column aliases the engine rowid. The alias has
/// no backing pk index; `INTEGER PRIMARY KEY DESC` keeps one and is
/// therefore not an alias.
fn rowid_alias(decls: &[(String, String, i64)], indexes: &[RawIndex]) -> Option<String> {
    let mut pk_cols = decls.iter().filter(|(_, _, pk)| *pk > 0);
    let (name, col_type, _) = pk_cols.next()?;
    if pk_cols.next().is_some() {
        return None;
    }
    if !col_type.trim().eq_ignore_ascii_case("integer") {
        return None;
    }
    if indexes.iter().any(|(_, origin, _)| origin == "pk") {
        return None;
    }
    Some(name.clone())
}

fn read_foreign_keys(
    conn: &Connection,
    table: &str,
    conf: &Config,
    next_id: &mut i64,
) -> Result<Vec<RawFk>> {
    // (columns, referred, foreign table, on_delete, on_update), keyed by the
    // engine's fk id so multi-column keys group deterministically.
    let mut grouped: BTreeMap<i64, (Vec<String>, Vec<Option<String>>, String, String, String)> =
        BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
        FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let mut rows = stmt.query([table])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let foreign_table: String = row.get(1)?;
        let from: String = row.get(2)?;
        let to: Option<String> = row.get(3)?;
        let on_update: String = row.get(4)?;
        let on_delete: String = row.get(5)?;
        let entry = grouped
            .entry(id)
            .or_insert((Vec::new(), Vec::new(), foreign_table, on_delete, on_update));
        entry.0.push(from);
        entry.1.push(to);
    }
    let mut out = Vec::new();
    for (_, (columns, referred, foreign_table, on_delete, on_update)) in grouped {
        out.push(RawFk {
            field: take_id(next_id),
            columns,
            foreign_table,
            referred,
            on_delete: parse_action(&on_delete, conf)?,
            on_update: parse_action(&on_update, conf)?,
        });
    }
    Ok(out)
}

/// `NO ACTION` normalizes to `RESTRICT` or `CASCADE` per the configuration;
/// `SET DEFAULT` has no replicated counterpart.
fn parse_action(action: &str, conf: &Config) -> Result<Action> {
    match action {
        "CASCADE" => Ok(Action::Cascade),
        "RESTRICT" => Ok(Action::Restrict),
        "SET NULL" => Ok(Action::SetNull),
        "SET DEFAULT" => Err(Error::UnsupportedSchema(
            "ON DELETE/UPDATE SET DEFAULT is not supported".to_owned(),
        )),
        _ if conf.no_action_is_cascade => Ok(Action::Cascade),
        _ => Ok(Action::Restrict),
    }
}

/// Resolve implicit referred columns (a reference to a bare table name
/// points at its primary key) and assemble the final model.
fn link_foreign_keys(raw: Vec<RawTable>) -> Result<Schema> {
    let pk_of: BTreeMap<String, Option<Vec<String>>> = raw
        .iter()
        .map(|t| {
            let pk = t
                .uniques
                .iter()
                .find(|u| u.primary)
                .map(|u| u.columns.clone());
            (t.name.clone(), pk)
        })
        .collect();
    let mut tables = Vec::new();
    for t in raw {
        let mut foreign_keys = Vec::new();
        for fk in t.fks {
            let referred_columns = if fk.referred.iter().all(Option::is_some) {
                fk.referred.into_iter().flatten().collect()
            } else {
                pk_of
                    .get(&fk.foreign_table)
                    .ok_or_else(|| {
                        Error::UnsupportedSchema(format!(
                            "{}.{} refers to unknown table {}",
                            t.name,
                            fk.columns.join(", "),
                            fk.foreign_table
                        ))
                    })?
                    .clone()
                    .ok_or_else(|| {
                        Error::UnsupportedSchema(format!(
                            "{} has no primary key for {} to refer to",
                            fk.foreign_table, t.name
                        ))
                    })?
            };
            if referred_columns.len() != fk.columns.len() {
                return Err(Error::UnsupportedSchema(format!(
                    "{}({}) and the key of {} differ in arity",
                    t.name,
                    fk.columns.join(", "),
                    fk.foreign_table
                )));
            }
            foreign_keys.push(ForeignKey {
                field: fk.field,
                columns: fk.columns,
                foreign_table: fk.foreign_table,
                referred_columns,
                on_delete: fk.on_delete,
                on_update: fk.on_update,
            });
        }
        tables.push(Table {
            name: t.name,
            id: t.id,
            columns: t.columns,
            uniques: t.uniques,
            foreign_keys,
            rowid_alias: t.rowid_alias,
            autoincrement: t.autoincrement,
        });
    }
    Ok(Schema { tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(ddl: &str) -> Result<Schema> {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(ddl).unwrap();
        introspect(&conn, &Config::default())
    }

    #[test]
    fn aliased_rowid_is_not_replicated() {
        let schema = model("CREATE TABLE x(a integer PRIMARY KEY, b any);").unwrap();
        let tbl = schema.table("x").unwrap();
        assert_eq!(tbl.rowid_alias.as_deref(), Some("a"));
        let replicated: Vec<&str> = tbl
            .replicated_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(replicated, ["b"]);
        // the alias still backs a primary uniqueness for incoming references
        assert_eq!(tbl.primary_key().unwrap().columns, ["a"]);
    }

    #[test]
    fn desc_integer_key_keeps_its_index() {
        let schema = model("CREATE TABLE x(a integer PRIMARY KEY DESC, b any);").unwrap();
        let tbl = schema.table("x").unwrap();
        assert_eq!(tbl.rowid_alias, None);
        assert!(tbl.primary_key().unwrap().primary);
    }

    #[test]
    fn foreign_key_columns_are_not_replicated() {
        let schema = model(
            "CREATE TABLE x(v any PRIMARY KEY);
            CREATE TABLE y(w any, v any REFERENCES x(v) ON DELETE CASCADE);",
        )
        .unwrap();
        let tbl = schema.table("y").unwrap();
        let replicated: Vec<&str> = tbl
            .replicated_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(replicated, ["w"]);
        let fk = &tbl.foreign_keys[0];
        assert_eq!(fk.on_delete, Action::Cascade);
        assert_eq!(fk.on_update, Action::Restrict); // NO ACTION normalized
        assert_eq!(fk.referred_columns, ["v"]);
    }

    #[test]
    fn implicit_reference_points_at_primary_key() {
        let schema = model(
            "CREATE TABLE x(v any PRIMARY KEY);
            CREATE TABLE y(v any REFERENCES x);",
        )
        .unwrap();
        let fk = &schema.table("y").unwrap().foreign_keys[0];
        assert_eq!(fk.referred_columns, ["v"]);
        assert!(schema.foreign_unique(fk).unwrap().primary);
    }

    #[test]
    fn no_action_can_map_to_cascade() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE x(v any PRIMARY KEY);
            CREATE TABLE y(v any REFERENCES x(v));",
        )
        .unwrap();
        let conf = Config {
            no_action_is_cascade: true,
            ..Config::default()
        };
        let schema = introspect(&conn, &conf).unwrap();
        let fk = &schema.table("y").unwrap().foreign_keys[0];
        assert_eq!(fk.on_delete, Action::Cascade);
    }

    #[test]
    fn rejects_without_rowid() {
        let err = model("CREATE TABLE x(v text PRIMARY KEY) WITHOUT ROWID;").unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchema(_)));
    }

    #[test]
    fn rejects_set_default() {
        let err = model(
            "CREATE TABLE x(v any PRIMARY KEY);
            CREATE TABLE y(v any REFERENCES x(v) ON DELETE SET DEFAULT);",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchema(_)));
    }

    #[test]
    fn rejects_shadowing_rowid() {
        let err = model("CREATE TABLE x(rowid text);").unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchema(_)));
        // an aliasing rowid column is fine
        model("CREATE TABLE x(rowid integer PRIMARY KEY);").unwrap();
    }

    #[test]
    fn metadata_ids_follow_declaration_order() {
        let schema = model(
            "CREATE TABLE x(a any PRIMARY KEY, b any);
            CREATE TABLE y(c any);",
        )
        .unwrap();
        let x = schema.table("x").unwrap();
        let y = schema.table("y").unwrap();
        assert_eq!(x.id, 0);
        assert_eq!(x.columns[0].field, 1);
        assert_eq!(x.columns[1].field, 2);
        assert_eq!(x.uniques[0].index, 3);
        assert_eq!(y.id, 4);
        assert_eq!(y.columns[0].field, 5);
    }

    #[test]
    fn resolves_reference_chains() {
        let schema = model(
            "CREATE TABLE a(k any PRIMARY KEY);
            CREATE TABLE b(k any PRIMARY KEY REFERENCES a(k));
            CREATE TABLE c(k any REFERENCES b(k));",
        )
        .unwrap();
        let c = schema.table("c").unwrap();
        let resolved = resolve_reference(&schema, &c.foreign_keys[0], "k").unwrap();
        assert_eq!(resolved.hops.len(), 1);
        match resolved.terminal {
            Terminal::Value(tbl, col) => {
                assert_eq!(tbl.name, "a");
                assert_eq!(col.name, "k");
            }
            Terminal::Rowid(_) => panic!("terminal should be a value column"),
        }
    }

    #[test]
    fn resolves_rowid_terminal() {
        let schema = model(
            "CREATE TABLE a(k integer PRIMARY KEY);
            CREATE TABLE b(k integer REFERENCES a(k));",
        )
        .unwrap();
        let b = schema.table("b").unwrap();
        let resolved = resolve_reference(&schema, &b.foreign_keys[0], "k").unwrap();
        assert!(resolved.hops.is_empty());
        assert!(matches!(resolved.terminal, Terminal::Rowid(t) if t.name == "a"));
    }
}
