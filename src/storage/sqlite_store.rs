use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::path::Path;
use indexmap::IndexSet;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};
use crate::compression::conical::ConicalProjection;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{format_number, FieldValue, Record};
use crate::storage::partitioned_table::PartitionedTable;

pub const META_TABLE: &str = "_dbms_meta";

/// Per-row JSON array of the fields holding an explicit null. Tables written
/// with it keep "absent" and "null" apart; without it every NULL loads as null.
pub const NULL_FIELDS_COLUMN: &str = "_nulls";

/// Columns a compressed table is written with, before the key.
pub const COMPRESSED_COLUMNS: [&str; 4] = ["_tan_theta", "_phi", "_intensity", "_stamp"];

/// Per-table configuration kept in `_dbms_meta` under key `config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    pub partition_key: String,
    pub num_partitions: usize,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl TableMeta {
    pub fn of(table: &PartitionedTable) -> Self {
        TableMeta {
            partition_key: table.primary_key.clone(),
            num_partitions: table.num_partitions,
            compressed: table.compressed,
            columns: table.columns.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub batch_size: usize,
    pub page_size: usize,
    pub default_primary_key: String,
    pub default_partitions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub tables: usize,
    pub rows: usize,
}

/// SQLite backing store: one lazily opened connection per database
pub struct SqliteStore {
    settings: StoreSettings,
    codec: ConicalProjection,
    connections: HashMap<String, Connection>,
}

impl SqliteStore {
    pub fn new(settings: StoreSettings) -> Self {
        SqliteStore {
            settings,
            codec: ConicalProjection::default(),
            connections: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    fn connection(&mut self, database: &str, path: &Path) -> Result<&mut Connection> {
        match self.connections.entry(database.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                debug!(database, path = %path.display(), "opening backing store");
                Ok(entry.insert(Connection::open(path)?))
            }
        }
    }

    /// Rewrite every table of `database` in one transaction. Tables no longer
    /// in memory are dropped from the file. On error nothing is committed.
    pub fn save(&mut self, database: &str, path: &Path, tables: &[PartitionedTable]) -> Result<SaveReport> {
        let batch_size = self.settings.batch_size.max(1);
        let codec = self.codec;
        let conn = self.connection(database, path)?;
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (table_name TEXT, key TEXT, value TEXT, PRIMARY KEY (table_name, key))",
                META_TABLE
            ),
            [],
        )?;

        for stale in list_tables(&tx)? {
            if !tables.iter().any(|t| t.name == stale) {
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(&stale)), [])?;
                tx.execute(&format!("DELETE FROM {} WHERE table_name = ?1", META_TABLE), params![stale])?;
                debug!(database, table = %stale, "dropped stale table");
            }
        }

        let mut report = SaveReport::default();
        for table in tables {
            report.rows += write_table(&tx, table, batch_size, &codec)?;
            report.tables += 1;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Rebuild every table stored in the file. A table that fails to load is
    /// logged and skipped.
    pub fn load(&mut self, database: &str, path: &Path) -> Result<Vec<PartitionedTable>> {
        if !path.exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("Database file {} not found", path.display()),
            ));
        }
        let settings = self.settings.clone();
        let codec = self.codec;
        let conn = self.connection(database, path)?;
        let metas = read_meta(conn)?;

        let mut tables = Vec::new();
        for name in list_tables(conn)? {
            let meta = metas.get(&name).cloned().unwrap_or_else(|| TableMeta {
                partition_key: settings.default_primary_key.clone(),
                num_partitions: settings.default_partitions,
                compressed: false,
                columns: Vec::new(),
            });
            match load_table(conn, &name, meta, settings.page_size.max(1), &codec) {
                Ok(table) => tables.push(table),
                Err(err) => warn!(database, table = %name, error = %err, "skipping table that failed to load"),
            }
        }
        Ok(tables)
    }

    /// Close and forget the connection of `database`.
    pub fn evict(&mut self, database: &str) {
        if let Some(conn) = self.connections.remove(database) {
            if let Err((_, err)) = conn.close() {
                warn!(database, error = %err, "closing backing store failed");
            }
        }
    }

    pub fn close_all(&mut self) {
        let names: Vec<String> = self.connections.keys().cloned().collect();
        for name in names {
            self.evict(&name);
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn list_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1 ORDER BY rowid",
    )?;
    let names = stmt
        .query_map(params![META_TABLE], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn read_meta(conn: &Connection) -> Result<HashMap<String, TableMeta>> {
    let exists: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![META_TABLE],
        |row| row.get(0),
    )?;
    let mut metas = HashMap::new();
    if exists == 0 {
        return Ok(metas);
    }

    let mut stmt = conn.prepare(&format!("SELECT table_name, value FROM {} WHERE key = 'config'", META_TABLE))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (table, value) in rows {
        match serde_json::from_str::<TableMeta>(&value) {
            Ok(meta) => {
                metas.insert(table, meta);
            }
            Err(err) => warn!(table = %table, error = %err, "ignoring unreadable table metadata"),
        }
    }
    Ok(metas)
}

/// Columns written for `table`, key excluded: declared columns, then every
/// field seen on a record in first-seen order, then the null marker.
fn persisted_columns(table: &PartitionedTable) -> Vec<String> {
    if table.compressed {
        return COMPRESSED_COLUMNS.iter().map(|c| c.to_string()).collect();
    }
    let mut columns: IndexSet<String> = table.columns.iter().cloned().collect();
    for record in table.records() {
        columns.extend(record.keys().cloned());
    }
    columns.shift_remove(&table.primary_key);
    columns.shift_remove(NULL_FIELDS_COLUMN);
    columns.insert(NULL_FIELDS_COLUMN.to_string());
    columns.into_iter().collect()
}

fn null_fields(record: &Record) -> Result<Option<String>> {
    let nulls: Vec<&String> = record
        .iter()
        .filter(|(_, value)| value.is_null())
        .map(|(field, _)| field)
        .collect();
    if nulls.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(&nulls)?))
}

fn read_null_fields(value: ValueRef<'_>) -> Vec<String> {
    let ValueRef::Text(bytes) = value else {
        return Vec::new();
    };
    serde_json::from_slice(bytes).unwrap_or_else(|err| {
        warn!(error = %err, "ignoring unreadable null marker");
        Vec::new()
    })
}

fn stored_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::Number(n) => Some(format_number(*n)),
        FieldValue::Text(s) => Some(s.clone()),
    }
}

fn write_table(conn: &Connection, table: &PartitionedTable, batch_size: usize, codec: &ConicalProjection) -> Result<usize> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {} (table_name, key, value) VALUES (?1, 'config', ?2)", META_TABLE),
        params![table.name, serde_json::to_string(&TableMeta::of(table))?],
    )?;

    let columns = persisted_columns(table);
    let name = quote_ident(&table.name);
    let definitions: Vec<String> = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .chain(std::iter::once(format!("{} TEXT PRIMARY KEY", quote_ident(&table.primary_key))))
        .collect();
    conn.execute(&format!("CREATE TABLE IF NOT EXISTS {} ({})", name, definitions.join(", ")), [])?;

    let present = table_columns(conn, &table.name)?;
    for column in columns.iter().chain(std::iter::once(&table.primary_key)) {
        if !present.contains(column) {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} TEXT", name, quote_ident(column)), [])?;
        }
    }

    conn.execute(&format!("DELETE FROM {}", name), [])?;

    let column_list: Vec<String> = columns
        .iter()
        .chain(std::iter::once(&table.primary_key))
        .map(|c| quote_ident(c))
        .collect();
    let placeholders: Vec<String> = (1..=column_list.len()).map(|i| format!("?{}", i)).collect();
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {} ({}) VALUES ({})",
        name,
        column_list.join(", "),
        placeholders.join(", ")
    ))?;

    let records: Vec<&Record> = table.records().collect();
    for (batch, chunk) in records.chunks(batch_size).enumerate() {
        for record in chunk {
            let mut values: Vec<Option<String>> = if table.compressed {
                let mut projected: Vec<Option<String>> = codec
                    .compress_record(record)
                    .to_vec()
                    .into_iter()
                    .map(|v| Some(format_number(v)))
                    .collect();
                projected.resize(COMPRESSED_COLUMNS.len(), None);
                projected
            } else {
                columns
                    .iter()
                    .map(|c| match c.as_str() {
                        NULL_FIELDS_COLUMN => null_fields(record),
                        _ => Ok(record.get(c).and_then(stored_text)),
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            values.push(Some(table.key_of(record)));
            stmt.execute(params_from_iter(values.iter()))?;
        }
        debug!(table = %table.name, batch, rows = chunk.len(), "batch written");
    }
    Ok(records.len())
}

fn load_table(conn: &Connection, name: &str, meta: TableMeta, page_size: usize, codec: &ConicalProjection) -> Result<PartitionedTable> {
    let mut table = PartitionedTable::new(name, meta.partition_key, meta.num_partitions);
    table.compressed = meta.compressed;
    table.columns = meta.columns;

    let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2", quote_ident(name)))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let marks_nulls = names.iter().any(|n| n == NULL_FIELDS_COLUMN);

    let mut offset = 0usize;
    loop {
        let mut rows = stmt.query(params![page_size as i64, offset as i64])?;
        let mut fetched = 0usize;
        while let Some(row) = rows.next()? {
            fetched += 1;
            let mut record = Record::new();
            for (i, column) in names.iter().enumerate() {
                let value = row.get_ref(i)?;
                if column == NULL_FIELDS_COLUMN {
                    for field in read_null_fields(value) {
                        record.insert(field, FieldValue::Null);
                    }
                    continue;
                }
                let text = match value {
                    ValueRef::Null if marks_nulls => continue,
                    ValueRef::Null => {
                        record.insert(column.clone(), FieldValue::Null);
                        continue;
                    }
                    ValueRef::Integer(n) => n.to_string(),
                    ValueRef::Real(f) => format_number(f),
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                };
                record.insert(column.clone(), text);
            }
            if table.compressed {
                record = expand_compressed(&table.primary_key, &record, codec);
            }
            table.insert(record);
        }
        if fetched == 0 {
            break;
        }
        offset += fetched;
    }
    Ok(table)
}

/// `{key, x, y, z}` from a compressed row; the direction is all that survives.
fn expand_compressed(primary_key: &str, row: &Record, codec: &ConicalProjection) -> Record {
    let mut record = Record::new();
    if let Some(key) = row.get(primary_key) {
        record.insert(primary_key, key.clone());
    }
    let tuple: Option<Vec<f64>> = COMPRESSED_COLUMNS[..3]
        .iter()
        .map(|c| row.get(c).and_then(FieldValue::as_coordinate))
        .collect();
    match tuple.map(|t| codec.decompress(&t)) {
        Some(Ok([x, y, z])) => {
            record.insert("x", x);
            record.insert("y", y);
            record.insert("z", z);
        }
        Some(Err(err)) => debug!(error = %err, "compressed row has no direction"),
        None => warn!("compressed row is missing projection columns"),
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> StoreSettings {
        StoreSettings {
            batch_size: 2,
            page_size: 2,
            default_primary_key: "id".into(),
            default_partitions: 10,
        }
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn pages_through_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.db");
        let mut table = PartitionedTable::new("t", "id", 3);
        for i in 0..5 {
            table.insert(Record::from_json(&json!({"id": i, "v": i * 10})).unwrap());
        }
        let mut store = SqliteStore::new(settings());
        let report = store.save("d", &path, &[table]).unwrap();
        assert_eq!(report, SaveReport { tables: 1, rows: 5 });
        store.evict("d");

        let loaded = SqliteStore::new(settings()).load("d", &path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].len(), 5);
        assert_eq!(loaded[0].num_partitions, 3);
        assert_eq!(loaded[0].get("4").and_then(|r| r.get("v")), Some(&FieldValue::Text("40".into())));
    }

    #[test]
    fn explicit_nulls_survive_and_absent_fields_stay_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.db");
        let mut table = PartitionedTable::new("t", "id", 2);
        table.insert(Record::from_json(&json!({"id": 1, "a": 5, "b": null})).unwrap());
        table.insert(Record::from_json(&json!({"id": 2, "c": "x"})).unwrap());
        let mut store = SqliteStore::new(settings());
        store.save("n", &path, &[table]).unwrap();
        store.evict("n");

        let loaded = SqliteStore::new(settings()).load("n", &path).unwrap();
        let first = loaded[0].get("1").unwrap();
        assert_eq!(first.get("b"), Some(&FieldValue::Null));
        assert_eq!(first.get("a"), Some(&FieldValue::Text("5".into())));
        assert!(!first.contains("c"));
        assert!(!first.contains(NULL_FIELDS_COLUMN));

        let second = loaded[0].get("2").unwrap();
        assert_eq!(second.len(), 2);
        assert!(!second.contains("a") && !second.contains("b"));
    }

    #[test]
    fn unmarked_tables_load_null_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE people (name TEXT, age TEXT, id TEXT PRIMARY KEY);
                 INSERT INTO people VALUES ('ann', NULL, '7');",
            )
            .unwrap();
        }

        let loaded = SqliteStore::new(settings()).load("ext", &path).unwrap();
        let record = loaded[0].get("7").unwrap();
        assert_eq!(record.get("age"), Some(&FieldValue::Null));
        assert_eq!(record.get("name"), Some(&FieldValue::Text("ann".into())));
    }

    #[test]
    fn compressed_tables_load_as_directions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let mut table = PartitionedTable::new("pts", "id", 2);
        table.compressed = true;
        table.insert(Record::from_json(&json!({"id": "a", "x": 0.3, "y": 0.7})).unwrap());
        let mut store = SqliteStore::new(settings());
        store.save("c", &path, &[table]).unwrap();

        let loaded = store.load("c", &path).unwrap();
        let record = loaded[0].get("a").unwrap();
        let norm: f64 = ["x", "y", "z"]
            .iter()
            .map(|f| record.get(f).and_then(FieldValue::as_number).unwrap().powi(2))
            .sum();
        assert!((norm - 1.0).abs() < 1e-9);
    }
}
