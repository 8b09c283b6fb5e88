use tracing::{debug, instrument};

use conductor_core::events::RunEvent;
use conductor_core::ids::RunId;

use crate::database::Database;
use crate::error::StoreError;

/// Durable copy of every event a run published, for observers that attach late.
pub struct RunEventRepo {
    db: Database,
}

impl RunEventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store an event. Returns false when an event with the same sequence or
    /// identity key is already stored for the run.
    #[instrument(skip(self, event), fields(run_id = %event.run_id, seq = event.seq, event_type = event.event_type()))]
    pub fn append(&self, event: &RunEvent) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(event)?;
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO run_events (run_id, seq, key, type, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event.run_id.as_str(),
                    event.seq as i64,
                    event.key,
                    event.event_type(),
                    event.timestamp.to_rfc3339(),
                    payload,
                ],
            )?)
        })?;
        if inserted == 0 {
            debug!("event already stored");
        }
        Ok(inserted > 0)
    }

    /// Events of one run in sequence order.
    pub fn list(&self, run_id: &RunId) -> Result<Vec<RunEvent>, StoreError> {
        let raw: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM run_events WHERE run_id = ?1 ORDER BY seq")?;
            let rows = stmt.query_map([run_id.as_str()], |row| row.get(0))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })?;

        raw.iter()
            .map(|payload| {
                serde_json::from_str(payload).map_err(|e| StoreError::CorruptRow {
                    table: "run_events",
                    column: "payload",
                    detail: e.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunRepo;
    use conductor_core::events::EventPayload;
    use conductor_core::plan::{Plan, Task};

    fn setup() -> (RunEventRepo, RunId) {
        let db = Database::in_memory().unwrap();
        let run_id = RunId::new();
        RunRepo::new(db.clone()).create(&run_id, "prompt", true).unwrap();
        (RunEventRepo::new(db), run_id)
    }

    fn plan_ready(run_id: &RunId, seq: u64, round: u32) -> RunEvent {
        RunEvent::new(
            run_id.clone(),
            seq,
            EventPayload::PlanReady {
                plan: Plan {
                    round,
                    agents: 1,
                    tasks: vec![Task {
                        agent: 1,
                        desc: "edit file A".into(),
                    }],
                },
            },
        )
    }

    #[test]
    fn append_and_list_in_order() {
        let (repo, run_id) = setup();
        repo.append(&plan_ready(&run_id, 2, 2)).unwrap();
        repo.append(&plan_ready(&run_id, 1, 1)).unwrap();
        let done = RunEvent::new(
            run_id.clone(),
            3,
            EventPayload::OrchestratorDone {
                reply: "ok".into(),
                tool_runs: vec![],
            },
        );
        repo.append(&done).unwrap();

        let events = repo.list(&run_id).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[2], done);
    }

    #[test]
    fn duplicate_key_is_ignored() {
        let (repo, run_id) = setup();
        assert!(repo.append(&plan_ready(&run_id, 1, 1)).unwrap());
        assert!(!repo.append(&plan_ready(&run_id, 5, 1)).unwrap());
        assert_eq!(repo.list(&run_id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_run_is_rejected() {
        let repo = RunEventRepo::new(Database::in_memory().unwrap());
        let err = repo.append(&plan_ready(&RunId::new(), 1, 1)).unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
