//! Wire envelope and message catalogue.

use crate::encode::EncodeOutcome;
use crate::model::{EncodeOption, ProgramId, RecordedId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

/// One JSON line on the pipe. Requests and responses carry an `id`; pushes do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(id: u64, msg: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            id: Some(id),
            msg: msg.into(),
            value,
            error: None,
        }
    }

    pub fn reply(id: u64, msg: impl Into<String>, result: Result<Value, String>) -> Self {
        let (value, error) = match result {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            id: Some(id),
            msg: msg.into(),
            value,
            error,
        }
    }

    pub fn push(msg: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            id: None,
            msg: msg.into(),
            value,
            error: None,
        }
    }

    pub fn is_push(&self) -> bool {
        self.id.is_none()
    }
}

/// Correlation ids: the current time in milliseconds, bumped past the last id
/// handed out so ids stay unique within one sender.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = crate::model::current_timestamp_ms();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate as u64,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Message kinds.
pub mod kind {
    // worker -> parent requests
    pub const GET_RESERVE_ALL_ID: &str = "getReserveAllId";
    pub const GET_RESERVES: &str = "getReserves";
    pub const GET_RESERVE_CONFLICTS: &str = "getReserveConflicts";
    pub const GET_RESERVE_SKIPS: &str = "getReserveSkips";
    pub const ADD_RESERVE: &str = "addReserve";
    pub const CANCEL_RESERVE: &str = "cancelReserve";
    pub const REMOVE_RESERVE_SKIP: &str = "removeReserveSkip";
    pub const ADD_ENCODE_FILE: &str = "addEncodeFile";
    pub const UPDATE_TS_FILE_SIZE: &str = "updateTsFileSize";
    pub const UPDATE_RESERVES: &str = "updateReserves";
    pub const GET_RECORDED: &str = "getRecorded";
    pub const GET_ENCODED: &str = "getEncoded";

    // parent -> worker pushes
    pub const SET_ENCODE_TO_CLIENT: &str = "setEncodeToClient";
    pub const NOTIFY_CLIENT: &str = "notifyClient";

    // worker -> parent pushes
    pub const ENCODE_FINISHED: &str = "encodeFinished";
    pub const WORKER_STATUS: &str = "workerStatus";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddReservePayload {
    pub program_id: ProgramId,
    #[serde(default)]
    pub encode: Option<EncodeOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramIdPayload {
    pub program_id: ProgramId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdPayload {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEncodeFilePayload {
    pub recorded_id: RecordedId,
    pub name: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub del_ts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedIdPayload {
    pub recorded_id: RecordedId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeFinishedPayload {
    pub recorded_id: RecordedId,
    pub name: String,
    pub outcome: EncodeOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusPayload {
    pub encode_queued: usize,
    pub encode_running: usize,
    pub active_streams: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_omits_id() {
        let line = serde_json::to_string(&Envelope::push(kind::NOTIFY_CLIENT, None)).unwrap();
        assert_eq!(line, r#"{"msg":"notifyClient"}"#);
    }

    #[test]
    fn test_reply_carries_value_or_error() {
        let ok = serde_json::to_value(Envelope::reply(5, "getReserves", Ok(json!([])))).unwrap();
        assert_eq!(ok, json!({"id": 5, "msg": "getReserves", "value": []}));

        let err = serde_json::to_value(Envelope::reply(6, "addReserve", Err("boom".into()))).unwrap();
        assert_eq!(err, json!({"id": 6, "msg": "addReserve", "error": "boom"}));
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let ids = IdGenerator::new();
        let generated: Vec<u64> = (0..1000).map(|_| ids.next_id()).collect();
        assert!(generated.windows(2).all(|w| w[0] < w[1]));
        assert!(generated[0] as i64 >= crate::model::current_timestamp_ms() - 60_000);
    }
}
