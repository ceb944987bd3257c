use anyhow::Result;
use rusqlite::{params, Row};

use crate::{
    db::{
        helpers::{parse_datetime, parse_device_state},
        Database,
    },
    models::{Device, DeviceState, StreamId},
};

fn row_to_device(row: &Row) -> Result<Device> {
    let state: String = row.get("state")?;
    let connected_at: String = row.get("connected_at")?;

    Ok(Device {
        stream_id: row.get("stream_id")?,
        serial: row.get("serial")?,
        boot_id: row.get("boot_id")?,
        state: parse_device_state(&state)?,
        connected_at: parse_datetime(&connected_at, "connected_at")?,
    })
}

impl Database {
    /// Insert or replace the device row for a stream. A reconnect overwrites
    /// the boot id and connection time.
    pub async fn upsert_device(&self, device: &Device) -> Result<()> {
        let device = device.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO devices (stream_id, serial, boot_id, state, connected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(stream_id) DO UPDATE SET
                     serial = excluded.serial,
                     boot_id = excluded.boot_id,
                     state = excluded.state,
                     connected_at = excluded.connected_at",
                params![
                    device.stream_id,
                    device.serial,
                    device.boot_id,
                    device.state.as_str(),
                    device.connected_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_device_state(&self, stream_id: StreamId, state: DeviceState) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE devices SET state = ?2 WHERE stream_id = ?1",
                params![stream_id, state.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_device(&self, stream_id: StreamId) -> Result<Option<Device>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_id, serial, boot_id, state, connected_at
                 FROM devices WHERE stream_id = ?1",
            )?;
            let mut rows = stmt.query(params![stream_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_device(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT stream_id, serial, boot_id, state, connected_at
                 FROM devices ORDER BY stream_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut devices = Vec::new();
            while let Some(row) = rows.next()? {
                devices.push(row_to_device(row)?);
            }
            Ok(devices)
        })
        .await
    }
}
