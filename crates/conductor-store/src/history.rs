use chrono::Utc;
use tracing::instrument;

use conductor_core::history::{HistoryEntry, HistoryError, HistoryRecord, HistoryRole, HistoryStore};
use conductor_core::ids::RunId;

use crate::database::Database;
use crate::error::StoreError;

/// SQLite-backed conversation log.
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, entry), fields(role = entry.role.as_str()))]
    pub fn insert(&self, run_id: Option<&RunId>, entry: &HistoryEntry) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history (run_id, role, name, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    run_id.map(RunId::as_str),
                    entry.role.as_str(),
                    entry.name,
                    entry.content,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn entries(&self, run_id: Option<&RunId>) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows: Vec<Row> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, role, name, content FROM history
                 WHERE ?1 IS NULL OR run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([run_id.map(RunId::as_str)], read_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })?;
        rows.into_iter()
            .map(|row| decode(row).map(|record| record.entry))
            .collect()
    }

    /// Newest `limit` records with their run ids, returned oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows: Vec<Row> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, role, name, content FROM (
                     SELECT id, run_id, role, name, content FROM history ORDER BY id DESC LIMIT ?1
                 ) ORDER BY id",
            )?;
            let rows = stmt.query_map([limit as i64], read_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })?;
        rows.into_iter().map(decode).collect()
    }
}

type Row = (Option<String>, String, Option<String>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode((run_id, role, name, content): Row) -> Result<HistoryRecord, StoreError> {
    let role = HistoryRole::parse(&role).ok_or_else(|| StoreError::CorruptRow {
        table: "history",
        column: "role",
        detail: format!("unknown variant: {role}"),
    })?;
    Ok(HistoryRecord {
        run_id: run_id.map(RunId::from_raw),
        entry: HistoryEntry { role, name, content },
    })
}

impl HistoryStore for HistoryRepo {
    fn append(&self, run_id: Option<&RunId>, entry: HistoryEntry) -> Result<(), HistoryError> {
        self.insert(run_id, &entry)
            .map(|_| ())
            .map_err(|e| HistoryError(e.to_string()))
    }

    fn list(&self, run_id: Option<&RunId>) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.entries(run_id).map_err(|e| HistoryError(e.to_string()))
    }

    fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        HistoryRepo::recent(self, limit).map_err(|e| HistoryError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_in_append_order() {
        let repo = HistoryRepo::new(Database::in_memory().unwrap());
        let run = RunId::new();
        repo.append(Some(&run), HistoryEntry::user("refactor module X")).unwrap();
        repo.append(
            Some(&run),
            HistoryEntry::tool_call("write_command", &serde_json::json!({"command": "ls"})),
        )
        .unwrap();
        repo.append(Some(&run), HistoryEntry::assistant("done").named("agent-1")).unwrap();

        let entries = repo.list(Some(&run)).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], HistoryEntry::user("refactor module X"));
        assert!(entries[1].content.starts_with("[tool_call] write_command"));
        assert_eq!(entries[2].name.as_deref(), Some("agent-1"));
    }

    #[test]
    fn filter_by_run() {
        let repo = HistoryRepo::new(Database::in_memory().unwrap());
        let a = RunId::new();
        let b = RunId::new();
        repo.append(Some(&a), HistoryEntry::user("first")).unwrap();
        repo.append(Some(&b), HistoryEntry::user("second")).unwrap();
        repo.append(None, HistoryEntry::user("ls").named("shell")).unwrap();

        assert_eq!(repo.list(Some(&b)).unwrap(), vec![HistoryEntry::user("second")]);
        assert_eq!(repo.list(None).unwrap().len(), 3);
    }

    #[test]
    fn recent_keeps_the_newest_window_in_order() {
        let repo = HistoryRepo::new(Database::in_memory().unwrap());
        let run = RunId::new();
        for i in 0..5 {
            repo.append(Some(&run), HistoryEntry::user(format!("msg {i}"))).unwrap();
        }
        repo.append(None, HistoryEntry::user("ls").named("shell")).unwrap();

        let records = HistoryRepo::recent(&repo, 3).unwrap();
        let contents: Vec<&str> = records.iter().map(|r| r.entry.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 3", "msg 4", "ls"]);
        assert_eq!(records[0].run_id.as_ref(), Some(&run));
        assert!(records[2].run_id.is_none());
    }
}
