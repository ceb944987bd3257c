use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{
    db::{
        helpers::{parse_datetime, parse_origin},
        repositories::records::{fail_open_operations, merge_batch, MergeReport},
        Database,
    },
    error::RelayError,
    models::{Session, SessionId, SessionImport, SessionOrigin, StreamId, TelemetryBatch, OPEN_END},
};

const SESSION_COLUMNS: &str =
    "session_id, stream_id, pid, name, start_ns, end_ns, origin, created_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let origin: String = row.get("origin")?;
    let created_at: String = row.get("created_at")?;

    Ok(Session {
        session_id: row.get("session_id")?,
        stream_id: row.get("stream_id")?,
        pid: row.get("pid")?,
        name: row.get("name")?,
        start_timestamp: row.get("start_ns")?,
        end_timestamp: row.get("end_ns")?,
        origin: parse_origin(&origin)?,
        created_at: parse_datetime(&created_at, "created_at")?,
    })
}

fn load_session(conn: &Connection, session_id: SessionId) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
    ))?;
    let mut rows = stmt.query(params![session_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

fn open_session_id(conn: &Connection, stream_id: StreamId) -> Result<Option<SessionId>> {
    Ok(conn
        .query_row(
            "SELECT session_id FROM sessions WHERE stream_id = ?1 AND end_ns = ?2",
            params![stream_id, OPEN_END],
            |row| row.get(0),
        )
        .optional()?)
}

fn insert_row(
    conn: &Connection,
    stream_id: StreamId,
    pid: i32,
    name: &str,
    start_ns: i64,
    end_ns: i64,
    origin: SessionOrigin,
) -> Result<SessionId> {
    conn.execute(
        "INSERT INTO sessions (stream_id, pid, name, start_ns, end_ns, origin, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            stream_id,
            pid,
            name,
            start_ns,
            end_ns,
            origin.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Open a live session. Fails with `SessionAlreadyOpen` if the stream
    /// already has one.
    pub async fn insert_session(
        &self,
        stream_id: StreamId,
        pid: i32,
        name: &str,
        start_ns: i64,
    ) -> Result<Session> {
        let name = name.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            if let Some(session_id) = open_session_id(&tx, stream_id)? {
                return Err(RelayError::SessionAlreadyOpen {
                    stream_id,
                    session_id,
                }
                .into());
            }

            let session_id =
                insert_row(&tx, stream_id, pid, &name, start_ns, OPEN_END, SessionOrigin::Live)?;
            let session = load_session(&tx, session_id)?
                .ok_or(RelayError::SessionNotFound(session_id))?;
            tx.commit()?;
            Ok(session)
        })
        .await
    }

    /// Close a session at `at` and fail whatever agent operation it still had
    /// in flight. Closing an already closed session changes nothing and
    /// returns it as stored.
    pub async fn close_session(&self, session_id: SessionId, at: i64) -> Result<Session> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let session =
                load_session(&tx, session_id)?.ok_or(RelayError::SessionNotFound(session_id))?;
            if !session.is_open() {
                return Ok(session);
            }

            let end = at.max(session.start_timestamp);
            fail_open_operations(&tx, session_id, end)?;
            tx.execute(
                "UPDATE sessions SET end_ns = ?2 WHERE session_id = ?1",
                params![session_id, end],
            )?;
            tx.commit()?;

            Ok(Session {
                end_timestamp: end,
                ..session
            })
        })
        .await
    }

    /// Store a finished capture as a closed session in one transaction.
    pub async fn import_session(
        &self,
        import: SessionImport,
        batch: TelemetryBatch,
    ) -> Result<(Session, MergeReport)> {
        if import.end_timestamp < import.start_timestamp || import.end_timestamp == OPEN_END {
            return Err(RelayError::InvalidRange {
                start: import.start_timestamp,
                end: import.end_timestamp,
            }
            .into());
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let session_id = insert_row(
                &tx,
                import.stream_id,
                import.pid,
                &import.name,
                import.start_timestamp,
                import.end_timestamp,
                SessionOrigin::Imported,
            )?;
            let report = merge_batch(&tx, session_id, &batch)?;
            let session = load_session(&tx, session_id)?
                .ok_or(RelayError::SessionNotFound(session_id))?;
            tx.commit()?;
            Ok((session, report))
        })
        .await
    }

    /// Remove a closed session and, by cascade, all of its records.
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        self.execute(move |conn| {
            let session =
                load_session(conn, session_id)?.ok_or(RelayError::SessionNotFound(session_id))?;
            if session.is_open() {
                return Err(RelayError::SessionStillOpen(session_id).into());
            }
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<Session>> {
        self.execute(move |conn| load_session(conn, session_id)).await
    }

    pub async fn open_session_for_stream(&self, stream_id: StreamId) -> Result<Option<Session>> {
        self.execute(move |conn| match open_session_id(conn, stream_id)? {
            Some(session_id) => load_session(conn, session_id),
            None => Ok(None),
        })
        .await
    }

    /// Every session, ordered by stream then start time.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY stream_id, start_ns, session_id"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }
}
