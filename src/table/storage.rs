//! Line-oriented database file format.
//!
//! ```text
//! TABLE:<name>
//! COLUMNS:<col>:<type>,<col>:<type>,...
//! PK:<col>
//! AUTO:<next-autoincrement>
//! ROW:<col>=<tag><value>\x1F<col>=<tag><value>...
//! <blank line between tables>
//! ```

use super::engine::{Table, TableSchema};
use super::value::DbValue;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

pub(crate) fn save(path: &Path, tables: &BTreeMap<String, Table>) -> Result<()> {
    let mut out = String::new();
    for (name, table) in tables {
        let _ = writeln!(out, "TABLE:{name}");
        let cols: Vec<String> = table
            .schema
            .columns
            .iter()
            .map(|(c, t)| format!("{c}:{t}"))
            .collect();
        let _ = writeln!(out, "COLUMNS:{}", cols.join(","));
        if let Some(pk) = &table.schema.primary_key {
            let _ = writeln!(out, "PK:{pk}");
        }
        let _ = writeln!(out, "AUTO:{}", table.auto_increment);
        for row in &table.rows {
            let fields: Vec<String> = row
                .iter()
                .map(|(col, val)| format!("{col}={}", val.encode_for_storage()))
                .collect();
            let _ = writeln!(out, "ROW:{}", fields.join("\x1F"));
        }
        out.push('\n');
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn load(path: &Path) -> Result<BTreeMap<String, Table>> {
    let text = std::fs::read_to_string(path)?;
    let mut tables: BTreeMap<String, Table> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("TABLE:") {
            tables.insert(name.to_string(), Table::default());
            current = Some(name.to_string());
            if let Some(t) = tables.get_mut(name) {
                t.auto_increment = 1;
            }
            continue;
        }
        let Some(table) = current.as_ref().and_then(|n| tables.get_mut(n)) else {
            continue;
        };
        if let Some(cols) = line.strip_prefix("COLUMNS:") {
            table.schema = TableSchema {
                columns: cols
                    .split(',')
                    .filter_map(|c| {
                        c.split_once(':')
                            .map(|(name, ty)| (name.to_string(), ty.to_string()))
                    })
                    .collect(),
                primary_key: table.schema.primary_key.take(),
                indexes: std::mem::take(&mut table.schema.indexes),
            };
        } else if let Some(pk) = line.strip_prefix("PK:") {
            table.schema.primary_key = Some(pk.to_string());
        } else if let Some(auto) = line.strip_prefix("AUTO:") {
            table.auto_increment = auto.parse().unwrap_or(1);
        } else if let Some(row_data) = line.strip_prefix("ROW:") {
            let mut row = BTreeMap::new();
            for field in row_data.split('\x1F') {
                if let Some((col, raw)) = field.split_once('=') {
                    row.insert(col.to_string(), DbValue::decode_from_storage(raw));
                }
            }
            table.rows.push(row);
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tables() -> BTreeMap<String, Table> {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), DbValue::Int(7));
        row.insert("body".to_string(), DbValue::Text("hi there".into()));
        row.insert("score".to_string(), DbValue::Real(0.5));
        row.insert("extra".to_string(), DbValue::Null);

        let mut tables = BTreeMap::new();
        tables.insert(
            "notes".to_string(),
            Table {
                schema: TableSchema {
                    columns: vec![
                        ("id".into(), "INTEGER".into()),
                        ("body".into(), "TEXT".into()),
                        ("score".into(), "REAL".into()),
                        ("extra".into(), "TEXT".into()),
                    ],
                    primary_key: Some("id".into()),
                    indexes: vec![],
                },
                rows: vec![row],
                auto_increment: 8,
            },
        );
        tables
    }

    #[test]
    fn format_is_line_oriented_and_tagged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fmt.db");
        save(&path, &sample_tables()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("TABLE:notes\n"));
        assert!(text.contains("COLUMNS:id:INTEGER,body:TEXT,score:REAL,extra:TEXT\n"));
        assert!(text.contains("PK:id\n"));
        assert!(text.contains("AUTO:8\n"));
        assert!(text.contains("id=I7"));
        assert!(text.contains("body=Thi there"));
        assert!(text.contains("extra=NULL"));
        assert!(text.contains('\x1F'));
    }

    #[test]
    fn load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rt.db");
        let tables = sample_tables();
        save(&path, &tables).unwrap();

        let loaded = load(&path).unwrap();
        let notes = &loaded["notes"];
        assert_eq!(notes.auto_increment, 8);
        assert_eq!(notes.schema.primary_key.as_deref(), Some("id"));
        assert_eq!(notes.rows.len(), 1);
        assert_eq!(notes.rows[0]["id"], DbValue::Int(7));
        assert_eq!(notes.rows[0]["body"], DbValue::Text("hi there".into()));
        assert_eq!(notes.rows[0]["extra"], DbValue::Null);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("atomic.db");
        save(&path, &sample_tables()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
