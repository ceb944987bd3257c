use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::models::{DeviceState, ProcessState, SessionOrigin};

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_device_state(value: &str) -> Result<DeviceState> {
    match value {
        "Connected" => Ok(DeviceState::Connected),
        "Disconnected" => Ok(DeviceState::Disconnected),
        other => Err(anyhow!("unknown device state {other}")),
    }
}

pub fn parse_process_state(value: &str) -> Result<ProcessState> {
    match value {
        "Alive" => Ok(ProcessState::Alive),
        "Dead" => Ok(ProcessState::Dead),
        other => Err(anyhow!("unknown process state {other}")),
    }
}

pub fn parse_origin(value: &str) -> Result<SessionOrigin> {
    match value {
        "Live" => Ok(SessionOrigin::Live),
        "Imported" => Ok(SessionOrigin::Imported),
        other => Err(anyhow!("unknown session origin {other}")),
    }
}

pub fn encode_payload<T: Serialize>(record: &T) -> Result<String> {
    serde_json::to_string(record).context("failed to encode record payload")
}

pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    serde_json::from_str(payload).context("failed to decode record payload")
}
