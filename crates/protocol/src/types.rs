use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of an upload's progress.
///
/// `time_remaining` is in seconds and is `f64::INFINITY` until a speed
/// estimate exists. A new snapshot always replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total_size: u64,
    /// Bytes confirmed by the server, accumulated across pauses.
    pub uploaded_size: u64,
    /// Bytes per second over the current run (reset on resume).
    pub average_speed: f64,
    pub time_remaining: f64,
    /// Whole percent in `0..=100`.
    pub percent: u8,
}

impl ProgressSnapshot {
    /// Snapshot of an upload that has not sent anything yet.
    pub fn idle(total_size: u64) -> Self {
        Self {
            total_size,
            uploaded_size: 0,
            average_speed: 0.0,
            time_remaining: f64::INFINITY,
            percent: 0,
        }
    }

    /// Estimated time remaining, `None` while unknown.
    pub fn eta(&self) -> Option<Duration> {
        if self.time_remaining.is_finite() && self.time_remaining >= 0.0 {
            Some(Duration::from_secs_f64(self.time_remaining))
        } else {
            None
        }
    }

    pub fn is_finished(&self) -> bool {
        self.percent >= 100
    }
}

/// Stable numeric codes carried on `fail` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailCode {
    /// Reading a chunk from disk failed during transfer.
    ChunkRead,
    /// Reading or hashing while computing the identifier failed.
    Identifier,
    /// The verify call failed.
    Verify,
    /// A chunk upload exhausted its retries or was rejected.
    ChunkUpload,
    /// The merge call failed.
    Merge,
}

impl FailCode {
    pub fn as_u32(self) -> u32 {
        match self {
            FailCode::ChunkRead => 10001,
            FailCode::Identifier => 10002,
            FailCode::Verify => 20001,
            FailCode::ChunkUpload => 20002,
            FailCode::Merge => 20003,
        }
    }
}

impl Serialize for FailCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Payload of a `fail` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailInfo {
    pub err_code: FailCode,
    pub err_msg: String,
}
