// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row codec: conversions between backend-neutral records and column values.
//!
//! Covers payload blobs and their encoding tags, the integer lifecycle columns of
//! `current_executions`, and timer timestamps. PostgreSQL stores timers as
//! `TIMESTAMP` (UTC, microsecond resolution). SQLite stores them as integer
//! microseconds since the Unix epoch so that ordering stays numeric.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, StoreError};
use crate::persistence::{CurrentExecutionRecord, ExecutionRecord, TaskRecord};

// ============================================================================
// Payload Blobs
// ============================================================================

/// Codec tag stored in every `data_encoding` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingType {
    /// Thrift binary encoding.
    ThriftRw,
    /// JSON text.
    Json,
    /// Protocol buffers v3.
    Proto3,
    /// Go gob encoding (legacy rows).
    Gob,
    /// No payload.
    Empty,
    /// Producer did not tag the payload.
    Unknown,
}

impl EncodingType {
    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThriftRw => "thriftrw",
            Self::Json => "json",
            Self::Proto3 => "proto3",
            Self::Gob => "gob",
            Self::Empty => "empty",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncodingType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "thriftrw" => Ok(Self::ThriftRw),
            "json" => Ok(Self::Json),
            "proto3" => Ok(Self::Proto3),
            "gob" => Ok(Self::Gob),
            "empty" => Ok(Self::Empty),
            "unknown" => Ok(Self::Unknown),
            other => Err(StoreError::encoding(
                "data_encoding",
                format!("unrecognised encoding tag '{}'", other),
            )),
        }
    }
}

/// Opaque serialized payload plus its codec tag.
///
/// The store never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlob {
    /// Serialized bytes.
    pub data: Vec<u8>,
    /// How `data` was serialized.
    pub encoding: EncodingType,
}

impl DataBlob {
    /// Wrap already-serialized bytes.
    pub fn new(data: impl Into<Vec<u8>>, encoding: EncodingType) -> Self {
        Self {
            data: data.into(),
            encoding,
        }
    }

    /// A zero-length payload tagged `empty`.
    pub fn empty() -> Self {
        Self::new(Vec::new(), EncodingType::Empty)
    }

    /// Serialize `value` as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?, EncodingType::Json))
    }

    /// Decode a JSON payload. Fails with an encoding error for any other tag.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.encoding != EncodingType::Json {
            return Err(StoreError::encoding(
                "data_encoding",
                format!("expected json payload, found {}", self.encoding),
            ));
        }
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Build from the two stored columns.
    pub(crate) fn from_columns(data: Vec<u8>, encoding: &str) -> Result<Self> {
        let encoding = encoding.parse::<EncodingType>().inspect_err(|e| {
            error!(error = %e, "Failed to decode stored payload");
        })?;
        Ok(Self { data, encoding })
    }
}

// ============================================================================
// Lifecycle Columns
// ============================================================================

/// Lifecycle state column of `current_executions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum WorkflowState {
    /// Run row written, first decision not yet scheduled.
    Created = 0,
    /// Run is executing.
    Running = 1,
    /// Run reached a terminal close status.
    Completed = 2,
    /// Run lost a multi-region conflict and waits for resolution.
    Zombie = 3,
    /// Placeholder state for rows with no meaningful run.
    Void = 4,
    /// Run state could not be reconstructed.
    Corrupted = 5,
}

impl WorkflowState {
    /// Column value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for WorkflowState {
    type Error = StoreError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Zombie,
            4 => Self::Void,
            5 => Self::Corrupted,
            other => {
                error!(value = other, "Unknown workflow state in current_executions");
                return Err(StoreError::encoding(
                    "state",
                    format!("unknown workflow state {}", other),
                ));
            }
        })
    }
}

/// How a run closed. `None` means the run is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum CloseStatus {
    /// Still running.
    None = 0,
    /// Closed successfully.
    Completed = 1,
    /// Closed with a failure.
    Failed = 2,
    /// Closed by cancellation.
    Canceled = 3,
    /// Closed by termination.
    Terminated = 4,
    /// Closed and replaced by a new run of the same workflow id.
    ContinuedAsNew = 5,
    /// Closed by exceeding its execution timeout.
    TimedOut = 6,
}

impl CloseStatus {
    /// Column value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for CloseStatus {
    type Error = StoreError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Completed,
            2 => Self::Failed,
            3 => Self::Canceled,
            4 => Self::Terminated,
            5 => Self::ContinuedAsNew,
            6 => Self::TimedOut,
            other => {
                error!(value = other, "Unknown close status in current_executions");
                return Err(StoreError::encoding(
                    "close_status",
                    format!("unknown close status {}", other),
                ));
            }
        })
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Truncate to microseconds, the finest resolution both engines keep.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_epoch_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// PostgreSQL `TIMESTAMP` column value.
pub fn to_postgres_timestamp(ts: DateTime<Utc>) -> NaiveDateTime {
    normalize_timestamp(ts).naive_utc()
}

/// Read back a PostgreSQL `TIMESTAMP` column.
pub fn from_postgres_timestamp(ts: NaiveDateTime) -> DateTime<Utc> {
    ts.and_utc()
}

/// SQLite integer column value.
pub fn to_sqlite_timestamp(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Read back a SQLite integer timestamp column.
pub fn from_sqlite_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    from_epoch_micros(micros).ok_or_else(|| {
        error!(micros, "Timer timestamp out of range");
        StoreError::encoding(
            "visibility_timestamp",
            format!("{} microseconds is out of range", micros),
        )
    })
}

fn from_epoch_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

// ============================================================================
// Shared Row Types
// ============================================================================

/// `executions` row as both backends return it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub shard_id: i32,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub next_event_id: i64,
    pub last_write_version: i64,
    pub data: Vec<u8>,
    pub data_encoding: String,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(Self {
            shard_id: row.shard_id,
            domain_id: row.domain_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            next_event_id: row.next_event_id,
            last_write_version: row.last_write_version,
            data: DataBlob::from_columns(row.data, &row.data_encoding)?,
        })
    }
}

/// `current_executions` row (also the shape of the join-lock result).
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct CurrentExecutionRow {
    pub shard_id: i32,
    pub domain_id: String,
    pub workflow_id: String,
    pub run_id: String,
    pub create_request_id: String,
    pub state: i32,
    pub close_status: i32,
    pub start_version: i64,
    pub last_write_version: i64,
}

impl TryFrom<CurrentExecutionRow> for CurrentExecutionRecord {
    type Error = StoreError;

    fn try_from(row: CurrentExecutionRow) -> Result<Self> {
        Ok(Self {
            shard_id: row.shard_id,
            domain_id: row.domain_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            create_request_id: row.create_request_id,
            state: WorkflowState::try_from(row.state)?,
            close_status: CloseStatus::try_from(row.close_status)?,
            start_version: row.start_version,
            last_write_version: row.last_write_version,
        })
    }
}

/// Id-ordered task row. The shard is implied by the query filter.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub task_id: i64,
    pub data: Vec<u8>,
    pub data_encoding: String,
}

impl TaskRow {
    pub(crate) fn into_record(self, shard_id: i32) -> Result<TaskRecord> {
        Ok(TaskRecord {
            shard_id,
            task_id: self.task_id,
            data: DataBlob::from_columns(self.data, &self.data_encoding)?,
        })
    }
}

/// Payload-only row (buffered events).
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct BlobRow {
    pub data: Vec<u8>,
    pub data_encoding: String,
}

impl TryFrom<BlobRow> for DataBlob {
    type Error = StoreError;

    fn try_from(row: BlobRow) -> Result<Self> {
        DataBlob::from_columns(row.data, &row.data_encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_encoding_tags_parse_back() {
        for encoding in [
            EncodingType::ThriftRw,
            EncodingType::Json,
            EncodingType::Proto3,
            EncodingType::Gob,
            EncodingType::Empty,
            EncodingType::Unknown,
        ] {
            assert_eq!(encoding.as_str().parse::<EncodingType>().unwrap(), encoding);
        }
    }

    #[test]
    fn test_unrecognised_encoding_is_encoding_error() {
        let err = DataBlob::from_columns(vec![1, 2, 3], "msgpack").unwrap_err();
        assert_eq!(err.error_code(), "ENCODING");
        assert!(err.to_string().contains("msgpack"));
    }

    #[test]
    fn test_json_blob() {
        let blob = DataBlob::json(&serde_json::json!({"next_event_id": 7})).unwrap();
        assert_eq!(blob.encoding, EncodingType::Json);

        let value: serde_json::Value = blob.decode_json().unwrap();
        assert_eq!(value["next_event_id"], 7);
    }

    #[test]
    fn test_decode_json_rejects_other_tags() {
        let blob = DataBlob::new(b"\x0b\x00".to_vec(), EncodingType::ThriftRw);
        let err = blob.decode_json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, StoreError::Encoding { .. }));
    }

    #[test]
    fn test_decode_json_corrupt_payload() {
        let blob = DataBlob::new(b"{truncated".to_vec(), EncodingType::Json);
        assert!(blob.decode_json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_workflow_state_columns() {
        assert_eq!(WorkflowState::Running.as_i32(), 1);
        assert_eq!(WorkflowState::try_from(2).unwrap(), WorkflowState::Completed);
        assert!(WorkflowState::try_from(42).is_err());
    }

    #[test]
    fn test_close_status_columns() {
        assert_eq!(CloseStatus::ContinuedAsNew.as_i32(), 5);
        assert_eq!(CloseStatus::try_from(6).unwrap(), CloseStatus::TimedOut);
        assert!(CloseStatus::try_from(-1).is_err());
    }

    #[test]
    fn test_normalize_truncates_to_micros() {
        let ts = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .unwrap()
            .with_nanosecond(123_456_789)
            .unwrap();
        let normalized = normalize_timestamp(ts);
        assert_eq!(normalized.nanosecond(), 123_456_000);
    }

    #[test]
    fn test_sqlite_timestamp_roundtrip_is_normalized() {
        let ts = Utc
            .with_ymd_and_hms(2031, 1, 2, 3, 4, 5)
            .unwrap()
            .with_nanosecond(999_999_999)
            .unwrap();
        let stored = to_sqlite_timestamp(ts);
        assert_eq!(from_sqlite_timestamp(stored).unwrap(), normalize_timestamp(ts));
    }

    #[test]
    fn test_sqlite_timestamp_before_epoch() {
        let ts = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap();
        let stored = to_sqlite_timestamp(ts);
        assert!(stored < 0);
        assert_eq!(from_sqlite_timestamp(stored).unwrap(), ts);
    }

    #[test]
    fn test_sqlite_timestamp_out_of_range() {
        assert!(from_sqlite_timestamp(i64::MAX).is_err());
    }

    #[test]
    fn test_postgres_timestamp_is_utc_naive() {
        let ts = Utc.with_ymd_and_hms(2024, 2, 29, 23, 0, 0).unwrap();
        let naive = to_postgres_timestamp(ts);
        assert_eq!(naive.to_string(), "2024-02-29 23:00:00");
        assert_eq!(from_postgres_timestamp(naive), ts);
    }
}
