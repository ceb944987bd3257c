use anyhow::Result;
use rusqlite::{params, Row};

use crate::{
    db::{helpers::parse_process_state, Database},
    models::{Process, ProcessChanges, ProcessState, StreamId},
};

fn row_to_process(row: &Row) -> Result<Process> {
    let state: String = row.get("state")?;

    Ok(Process {
        stream_id: row.get("stream_id")?,
        pid: row.get("pid")?,
        name: row.get("name")?,
        start_time_ns: row.get("start_time_ns")?,
        state: parse_process_state(&state)?,
    })
}

impl Database {
    /// Every process ever seen on the stream, dead ones included, across all
    /// of its connection instances.
    pub async fn list_processes(&self, stream_id: StreamId) -> Result<Vec<Process>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_id, pid, start_time_ns, name, state
                 FROM processes WHERE stream_id = ?1
                 ORDER BY pid, start_time_ns, rowid",
            )?;
            let mut rows = stmt.query(params![stream_id])?;
            let mut processes = Vec::new();
            while let Some(row) = rows.next()? {
                processes.push(row_to_process(row)?);
            }
            Ok(processes)
        })
        .await
    }

    /// Processes observed by one connection instance of the stream.
    pub async fn list_instance_processes(
        &self,
        stream_id: StreamId,
        boot_id: &str,
    ) -> Result<Vec<Process>> {
        let boot_id = boot_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_id, pid, start_time_ns, name, state
                 FROM processes WHERE stream_id = ?1 AND boot_id = ?2
                 ORDER BY pid, start_time_ns",
            )?;
            let mut rows = stmt.query(params![stream_id, boot_id])?;
            let mut processes = Vec::new();
            while let Some(row) = rows.next()? {
                processes.push(row_to_process(row)?);
            }
            Ok(processes)
        })
        .await
    }

    /// Store new processes as alive and mark vanished ones dead, both within
    /// the instance `boot_id`. A process already stored dead for that
    /// instance stays dead.
    pub async fn apply_process_changes(
        &self,
        stream_id: StreamId,
        boot_id: &str,
        changes: ProcessChanges,
    ) -> Result<()> {
        let boot_id = boot_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            for process in &changes.started {
                tx.execute(
                    "INSERT OR IGNORE INTO processes (stream_id, boot_id, pid, start_time_ns, name, state)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        stream_id,
                        boot_id,
                        process.pid,
                        process.start_time_ns,
                        process.name,
                        ProcessState::Alive.as_str(),
                    ],
                )?;
            }
            for process in &changes.died {
                tx.execute(
                    "UPDATE processes SET state = ?5
                     WHERE stream_id = ?1 AND boot_id = ?2 AND pid = ?3 AND start_time_ns = ?4",
                    params![
                        stream_id,
                        boot_id,
                        process.pid,
                        process.start_time_ns,
                        ProcessState::Dead.as_str(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Used when the stream drops: nothing on it can be trusted alive.
    pub async fn mark_stream_processes_dead(&self, stream_id: StreamId) -> Result<usize> {
        self.execute(move |conn| {
            let updated = conn.execute(
                "UPDATE processes SET state = ?2 WHERE stream_id = ?1 AND state = ?3",
                params![
                    stream_id,
                    ProcessState::Dead.as_str(),
                    ProcessState::Alive.as_str(),
                ],
            )?;
            Ok(updated)
        })
        .await
    }
}
