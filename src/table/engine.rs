//! In-memory execution over parsed statements, with whole-file persistence.

use super::parser::{
    parse_statement, Condition, LimitSpec, Literal, OrderBy, SelectCols, Statement,
};
use super::storage;
use super::value::DbValue;
use crate::error::{BotError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type Row = BTreeMap<String, DbValue>;

#[derive(Debug, Clone, Default)]
pub(crate) struct TableSchema {
    pub columns: Vec<(String, String)>,
    pub primary_key: Option<String>,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
    pub auto_increment: i64,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            auto_increment: 1,
        }
    }
}

pub struct Database {
    path: PathBuf,
    pub(crate) tables: BTreeMap<String, Table>,
    in_transaction: bool,
    last_insert_id: i64,
}

impl Database {
    /// Open the database file, loading existing contents when present.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tables = if path.exists() {
            storage::load(path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            tables,
            in_transaction: false,
            last_insert_id: 0,
        })
    }

    pub fn last_insert_id(&self) -> i64 {
        self.last_insert_id
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.tables.get(name).map_or(0, |t| t.rows.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Execute a non-SELECT statement. Returns affected row count.
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<usize> {
        let stmt = parse_statement(sql)?;
        match stmt {
            Statement::CreateTable {
                name,
                if_not_exists,
                columns,
                primary_key,
            } => {
                if self.tables.contains_key(&name) {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(BotError::DbQuery(format!("table {name} already exists")));
                }
                self.tables.insert(
                    name,
                    Table::new(TableSchema {
                        columns,
                        primary_key,
                        indexes: Vec::new(),
                    }),
                );
                self.flush_if_autocommit()?;
                Ok(0)
            }
            Statement::CreateIndex { name, table } => {
                let t = self
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| BotError::DbQuery(format!("no such table {table}")))?;
                if !t.schema.indexes.contains(&name) {
                    t.schema.indexes.push(name);
                }
                self.flush_if_autocommit()?;
                Ok(0)
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let n = self.exec_insert(&table, &columns, &values, params)?;
                self.flush_if_autocommit()?;
                Ok(n)
            }
            Statement::Update {
                table,
                sets,
                filter,
            } => {
                let n = self.exec_update(&table, &sets, filter.as_ref(), params)?;
                self.flush_if_autocommit()?;
                Ok(n)
            }
            Statement::Delete {
                table,
                filter,
                order,
                limit,
            } => {
                let n =
                    self.exec_delete(&table, filter.as_ref(), order.as_ref(), limit.as_ref(), params)?;
                self.flush_if_autocommit()?;
                Ok(n)
            }
            Statement::Begin => {
                self.in_transaction = true;
                Ok(0)
            }
            Statement::Commit => {
                self.in_transaction = false;
                self.flush()?;
                Ok(0)
            }
            Statement::Rollback => {
                // The file still holds the pre-transaction state.
                self.in_transaction = false;
                self.tables = if self.path.exists() {
                    storage::load(&self.path)?
                } else {
                    BTreeMap::new()
                };
                Ok(0)
            }
            Statement::Select { .. } => Err(BotError::DbQuery(
                "SELECT must go through query()".into(),
            )),
        }
    }

    /// Execute a SELECT statement.
    pub fn query(&self, sql: &str, params: &[DbValue]) -> Result<Vec<Row>> {
        let stmt = parse_statement(sql)?;
        let Statement::Select {
            cols,
            table,
            filter,
            order,
            limit,
        } = stmt
        else {
            return Err(BotError::DbQuery("query() accepts only SELECT".into()));
        };

        let t = self
            .tables
            .get(&table)
            .ok_or_else(|| BotError::DbQuery(format!("no such table {table}")))?;

        let mut rows: Vec<Row> = t
            .rows
            .iter()
            .filter(|row| Self::matches(row, filter.as_ref(), params))
            .cloned()
            .collect();

        if let Some(order) = &order {
            Self::sort_rows(&mut rows, order);
        }
        if let Some(limit) = &limit {
            Self::apply_limit(&mut rows, limit, params)?;
        }

        let rows = match cols {
            SelectCols::Star => rows,
            SelectCols::Cols(names) => rows
                .into_iter()
                .map(|row| {
                    names
                        .iter()
                        .filter_map(|name| row.get(name).map(|v| (name.clone(), v.clone())))
                        .collect()
                })
                .collect(),
        };
        Ok(rows)
    }

    pub fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).map(|_| ())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).map(|_| ())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).map(|_| ())
    }

    // ── statement execution ─────────────────────────────────────

    fn exec_insert(
        &mut self,
        table: &str,
        columns: &[String],
        values: &[Literal],
        params: &[DbValue],
    ) -> Result<usize> {
        let resolved: Vec<DbValue> = values
            .iter()
            .map(|v| Self::resolve(v, params))
            .collect::<Result<_>>()?;

        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| BotError::DbQuery(format!("no such table {table}")))?;

        let mut row = Row::new();
        for (col, val) in columns.iter().zip(resolved) {
            row.insert(col.clone(), val);
        }

        if let Some(pk) = &t.schema.primary_key {
            match row.get(pk) {
                None | Some(DbValue::Null) => {
                    row.insert(pk.clone(), DbValue::Int(t.auto_increment));
                    self.last_insert_id = t.auto_increment;
                    t.auto_increment += 1;
                }
                Some(DbValue::Int(v)) => {
                    self.last_insert_id = *v;
                    if *v >= t.auto_increment {
                        t.auto_increment = v + 1;
                    }
                }
                Some(_) => {}
            }
        }

        t.rows.push(row);
        Ok(1)
    }

    fn exec_update(
        &mut self,
        table: &str,
        sets: &[(String, Literal)],
        filter: Option<&Condition>,
        params: &[DbValue],
    ) -> Result<usize> {
        let resolved: Vec<(String, DbValue)> = sets
            .iter()
            .map(|(col, lit)| Ok((col.clone(), Self::resolve(lit, params)?)))
            .collect::<Result<_>>()?;

        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| BotError::DbQuery(format!("no such table {table}")))?;

        let mut affected = 0;
        for row in &mut t.rows {
            if Self::matches(row, filter, params) {
                for (col, val) in &resolved {
                    row.insert(col.clone(), val.clone());
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn exec_delete(
        &mut self,
        table: &str,
        filter: Option<&Condition>,
        order: Option<&OrderBy>,
        limit: Option<&LimitSpec>,
        params: &[DbValue],
    ) -> Result<usize> {
        let limit_n = match limit {
            Some(spec) => {
                let v = Self::resolve(&spec.limit, params)?;
                Some(v.as_int().max(0) as usize)
            }
            None => None,
        };

        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| BotError::DbQuery(format!("no such table {table}")))?;

        let mut matching: Vec<usize> = t
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| Self::matches(row, filter, params))
            .map(|(i, _)| i)
            .collect();

        if let Some(order) = order {
            matching.sort_by(|&a, &b| {
                let va = t.rows[a].get(&order.column).unwrap_or(&DbValue::Null);
                let vb = t.rows[b].get(&order.column).unwrap_or(&DbValue::Null);
                let ord = va.compare(vb);
                if order.desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(n) = limit_n {
            matching.truncate(n);
        }

        matching.sort_unstable_by(|a, b| b.cmp(a));
        for idx in &matching {
            t.rows.remove(*idx);
        }
        Ok(matching.len())
    }

    // ── helpers ─────────────────────────────────────────────────

    fn resolve(lit: &Literal, params: &[DbValue]) -> Result<DbValue> {
        Ok(match lit {
            Literal::Null => DbValue::Null,
            Literal::Int(v) => DbValue::Int(*v),
            Literal::Real(v) => DbValue::Real(*v),
            Literal::Text(v) => DbValue::Text(v.clone()),
            Literal::Param(idx) => params
                .get(*idx)
                .cloned()
                .ok_or_else(|| BotError::DbQuery(format!("missing parameter {idx}")))?,
        })
    }

    fn matches(row: &Row, filter: Option<&Condition>, params: &[DbValue]) -> bool {
        let Some(cond) = filter else { return true };
        match cond {
            Condition::Eq(col, lit) => {
                let Ok(target) = Self::resolve(lit, params) else {
                    return false;
                };
                row.get(col).is_some_and(|v| v.loosely_equals(&target))
            }
            Condition::Like(col, lit) => {
                let Ok(target) = Self::resolve(lit, params) else {
                    return false;
                };
                let pattern = target.as_text();
                row.get(col)
                    .is_some_and(|v| like_match(v.as_text(), pattern))
            }
        }
    }

    fn sort_rows(rows: &mut [Row], order: &OrderBy) {
        rows.sort_by(|a, b| {
            let va = a.get(&order.column).unwrap_or(&DbValue::Null);
            let vb = b.get(&order.column).unwrap_or(&DbValue::Null);
            let ord = va.compare(vb);
            if order.desc {
                ord.reverse()
            } else {
                ord
            }
        });
    }

    fn apply_limit(rows: &mut Vec<Row>, spec: &LimitSpec, params: &[DbValue]) -> Result<()> {
        let limit = Self::resolve(&spec.limit, params)?.as_int().max(0) as usize;
        let offset = match &spec.offset {
            Some(off) => Self::resolve(off, params)?.as_int().max(0) as usize,
            None => 0,
        };
        if offset > 0 {
            if offset >= rows.len() {
                rows.clear();
            } else {
                rows.drain(..offset);
            }
        }
        rows.truncate(limit);
        Ok(())
    }

    fn flush_if_autocommit(&self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.flush()
    }

    /// Atomic rewrite: serialize to a temp file next to the database, then
    /// rename over it.
    fn flush(&self) -> Result<()> {
        storage::save(&self.path, &self.tables)
    }
}

/// `%` wildcards at either end or both; anything else is an exact match.
fn like_match(text: &str, pattern: &str) -> bool {
    let starts = pattern.starts_with('%');
    let ends = pattern.len() > 1 && pattern.ends_with('%');
    match (starts, ends) {
        (true, true) => text.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => text.ends_with(&pattern[1..]),
        (false, true) => text.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) => text == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(tmp: &TempDir) -> Database {
        Database::open(&tmp.path().join("test.db")).unwrap()
    }

    fn seed_messages(db: &mut Database) {
        db.execute(
            "CREATE TABLE messages (id INTEGER, context_key TEXT, content TEXT, timestamp INTEGER, PRIMARY KEY(id))",
            &[],
        )
        .unwrap();
        for (key, content, ts) in [
            ("g_1", "alpha", 100i64),
            ("g_1", "beta", 200),
            ("g_2", "gamma", 150),
            ("g_1", "delta", 300),
        ] {
            db.execute(
                "INSERT INTO messages (context_key, content, timestamp) VALUES (?, ?, ?)",
                &[
                    DbValue::Text(key.into()),
                    DbValue::Text(content.into()),
                    DbValue::Int(ts),
                ],
            )
            .unwrap();
        }
    }

    #[test]
    fn autoincrement_assigns_monotone_ids() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);
        assert_eq!(db.last_insert_id(), 4);
        let rows = db.query("SELECT id FROM messages ORDER BY id", &[]).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_int()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn select_where_order_limit_offset() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);
        let rows = db
            .query(
                "SELECT content FROM messages WHERE context_key = ? ORDER BY timestamp DESC LIMIT 2",
                &[DbValue::Text("g_1".into())],
            )
            .unwrap();
        let contents: Vec<&str> = rows.iter().map(|r| r["content"].as_text()).collect();
        assert_eq!(contents, vec!["delta", "beta"]);

        let rows = db
            .query(
                "SELECT content FROM messages ORDER BY timestamp LIMIT 2 OFFSET 1",
                &[],
            )
            .unwrap();
        let contents: Vec<&str> = rows.iter().map(|r| r["content"].as_text()).collect();
        assert_eq!(contents, vec!["gamma", "beta"]);
    }

    #[test]
    fn like_wildcards() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);
        let rows = db
            .query("SELECT content FROM messages WHERE content LIKE '%lt%'", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"].as_text(), "delta");

        let rows = db
            .query("SELECT content FROM messages WHERE content LIKE 'be%'", &[])
            .unwrap();
        assert_eq!(rows[0]["content"].as_text(), "beta");

        let rows = db
            .query("SELECT content FROM messages WHERE content LIKE '%ma'", &[])
            .unwrap();
        assert_eq!(rows[0]["content"].as_text(), "gamma");
    }

    #[test]
    fn update_with_filter() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);
        let n = db
            .execute(
                "UPDATE messages SET content = ? WHERE context_key = ?",
                &[DbValue::Text("redacted".into()), DbValue::Text("g_1".into())],
            )
            .unwrap();
        assert_eq!(n, 3);
        let rows = db
            .query(
                "SELECT content FROM messages WHERE context_key = ?",
                &[DbValue::Text("g_2".into())],
            )
            .unwrap();
        assert_eq!(rows[0]["content"].as_text(), "gamma");
    }

    #[test]
    fn delete_order_limit_removes_oldest() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);
        let n = db
            .execute(
                "DELETE FROM messages WHERE context_key = ? ORDER BY timestamp LIMIT 2",
                &[DbValue::Text("g_1".into())],
            )
            .unwrap();
        assert_eq!(n, 2);
        let rows = db
            .query(
                "SELECT content FROM messages WHERE context_key = ?",
                &[DbValue::Text("g_1".into())],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"].as_text(), "delta");
    }

    #[test]
    fn persistence_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("persist.db");
        {
            let mut db = Database::open(&path).unwrap();
            seed_messages(&mut db);
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.row_count("messages"), 4);
        let rows = db
            .query("SELECT content FROM messages ORDER BY id DESC LIMIT 1", &[])
            .unwrap();
        assert_eq!(rows[0]["content"].as_text(), "delta");
    }

    #[test]
    fn autoincrement_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("auto.db");
        {
            let mut db = Database::open(&path).unwrap();
            seed_messages(&mut db);
        }
        let mut db = Database::open(&path).unwrap();
        db.execute(
            "INSERT INTO messages (context_key, content, timestamp) VALUES (?, ?, ?)",
            &[
                DbValue::Text("g_9".into()),
                DbValue::Text("after reopen".into()),
                DbValue::Int(999),
            ],
        )
        .unwrap();
        assert_eq!(db.last_insert_id(), 5);
    }

    #[test]
    fn rollback_restores_file_state() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        seed_messages(&mut db);

        db.begin().unwrap();
        db.execute("DELETE FROM messages", &[]).unwrap();
        assert_eq!(db.row_count("messages"), 0);
        db.rollback().unwrap();
        assert_eq!(db.row_count("messages"), 4);
    }

    #[test]
    fn commit_defers_flush_until_end() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn.db");
        let mut db = Database::open(&path).unwrap();
        seed_messages(&mut db);

        db.begin().unwrap();
        db.execute(
            "INSERT INTO messages (context_key, content, timestamp) VALUES (?, ?, ?)",
            &[
                DbValue::Text("g_3".into()),
                DbValue::Text("in txn".into()),
                DbValue::Int(400),
            ],
        )
        .unwrap();

        // Not yet visible on disk.
        let other = Database::open(&path).unwrap();
        assert_eq!(other.row_count("messages"), 4);

        db.commit().unwrap();
        let other = Database::open(&path).unwrap();
        assert_eq!(other.row_count("messages"), 5);
    }

    #[test]
    fn text_with_newlines_round_trips_through_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("escape.db");
        let tricky = "line one\nline two\rwith \x1F separator and \\ backslash";
        {
            let mut db = Database::open(&path).unwrap();
            db.execute(
                "CREATE TABLE notes (id INTEGER, body TEXT, PRIMARY KEY(id))",
                &[],
            )
            .unwrap();
            db.execute(
                "INSERT INTO notes (body) VALUES (?)",
                &[DbValue::Text(tricky.into())],
            )
            .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let rows = db.query("SELECT body FROM notes", &[]).unwrap();
        assert_eq!(rows[0]["body"].as_text(), tricky);
    }

    #[test]
    fn missing_table_errors() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        assert!(db.query("SELECT * FROM ghost", &[]).is_err());
        assert!(db
            .execute("INSERT INTO ghost (a) VALUES (1)", &[])
            .is_err());
    }
}
