//! Parent-side answers to worker requests.

use crate::ipc::message::{
    AddEncodeFilePayload, AddReservePayload, IdPayload, PageQuery, ProgramIdPayload,
    RecordedIdPayload,
};
use crate::ipc::{kind, RequestHandler};
use crate::model::{EncodedItem, RecordedId};
use crate::scheduler::ReservationManager;
use crate::store::Store;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ControlHandler {
    manager: Arc<ReservationManager>,
    store: Arc<dyn Store>,
}

impl ControlHandler {
    pub fn new(manager: Arc<ReservationManager>, store: Arc<dyn Store>) -> Self {
        Self { manager, store }
    }

    async fn dispatch(
        manager: Arc<ReservationManager>,
        store: Arc<dyn Store>,
        msg: &str,
        value: Option<Value>,
    ) -> Result<Value, String> {
        match msg {
            kind::GET_RESERVE_ALL_ID => reply(manager.all_id().await),
            kind::GET_RESERVES => {
                let page: PageQuery = parse(value)?;
                reply(manager.reserves(page.limit, page.offset).await)
            }
            kind::GET_RESERVE_CONFLICTS => {
                let page: PageQuery = parse(value)?;
                reply(manager.conflicts(page.limit, page.offset).await)
            }
            kind::GET_RESERVE_SKIPS => {
                let page: PageQuery = parse(value)?;
                reply(manager.skips(page.limit, page.offset).await)
            }
            kind::ADD_RESERVE => {
                let payload: AddReservePayload = parse(value)?;
                let status = manager
                    .add_reservation(payload.program_id, payload.encode)
                    .await
                    .map_err(|e| e.to_string())?;
                reply(status)
            }
            kind::CANCEL_RESERVE => {
                let payload: ProgramIdPayload = parse(value)?;
                manager
                    .cancel_reservation(payload.program_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            kind::REMOVE_RESERVE_SKIP => {
                let payload: ProgramIdPayload = parse(value)?;
                manager
                    .remove_skip(payload.program_id)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            kind::UPDATE_RESERVES => {
                manager.resync().await.map_err(|e| e.to_string())?;
                Ok(Value::Null)
            }
            kind::ADD_ENCODE_FILE => {
                let payload: AddEncodeFilePayload = parse(value)?;
                reply(add_encode_file(store.as_ref(), payload).await?)
            }
            kind::UPDATE_TS_FILE_SIZE => {
                let payload: RecordedIdPayload = parse(value)?;
                update_ts_file_size(store.as_ref(), payload.recorded_id).await?;
                Ok(Value::Null)
            }
            kind::GET_RECORDED => {
                let payload: IdPayload = parse(value)?;
                reply(store.find_recorded_by_id(payload.id).map_err(|e| e.to_string())?)
            }
            kind::GET_ENCODED => {
                let payload: IdPayload = parse(value)?;
                reply(store.find_encoded_by_id(payload.id).map_err(|e| e.to_string())?)
            }
            other => Err(format!("unknown request kind: {}", other)),
        }
    }
}

impl RequestHandler for ControlHandler {
    fn handle(&self, msg: String, value: Option<Value>) -> BoxFuture<'static, Result<Value, String>> {
        let manager = self.manager.clone();
        let store = self.store.clone();
        Box::pin(async move { Self::dispatch(manager, store, &msg, value).await })
    }
}

/// Register an encoded file, deleting the source recording when asked.
async fn add_encode_file(store: &dyn Store, payload: AddEncodeFilePayload) -> Result<i64, String> {
    let recorded = store
        .find_recorded_by_id(payload.recorded_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Recorded item {} is not found", payload.recorded_id))?;

    let size = tokio::fs::metadata(&payload.file_path)
        .await
        .ok()
        .map(|m| m.len());
    let encoded_id = store
        .add_encoded(EncodedItem {
            id: 0,
            recorded_id: recorded.id,
            name: payload.name,
            path: payload.file_path,
            size,
        })
        .map_err(|e| e.to_string())?;
    info!(recorded_id = recorded.id, encoded_id, "encoded file added");

    if payload.del_ts {
        if let Some(path) = &recorded.rec_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(recorded_id = recorded.id, path = %path.display(), "source recording deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(recorded_id = recorded.id, error = %e, "failed to delete source recording");
                    return Ok(encoded_id);
                }
            }
            store
                .set_recorded_path(recorded.id, None)
                .map_err(|e| e.to_string())?;
        }
    }

    Ok(encoded_id)
}

/// Re-read the size of a recording that an encoder rewrote in place.
async fn update_ts_file_size(store: &dyn Store, recorded_id: RecordedId) -> Result<(), String> {
    let recorded = store
        .find_recorded_by_id(recorded_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Recorded item {} is not found", recorded_id))?;
    let path = recorded
        .rec_path
        .ok_or_else(|| format!("Recorded item {} has no file", recorded_id))?;

    let size = tokio::fs::metadata(&path)
        .await
        .map_err(|e| format!("{}: {}", path.display(), e))?
        .len();
    store
        .set_recorded_size(recorded_id, Some(size))
        .map_err(|e| e.to_string())?;
    info!(recorded_id, size, "recording size updated");
    Ok(())
}

fn parse<T: DeserializeOwned>(value: Option<Value>) -> Result<T, String> {
    let value = value.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|e| format!("invalid payload: {}", e))
}

fn reply<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Program, RecordedItem, Tuner};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn handler() -> (ControlHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=2 {
            store
                .put_program(Program {
                    id,
                    channel_id: 1,
                    start_at: 1_000,
                    end_at: 2_000,
                    name: format!("p{}", id),
                    description: None,
                })
                .unwrap();
        }
        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            vec![Tuner::new(0, "t0", [1])],
        ));
        (ControlHandler::new(manager, store.clone()), store)
    }

    async fn call(h: &ControlHandler, msg: &str, value: Value) -> Result<Value, String> {
        h.handle(msg.to_string(), Some(value)).await
    }

    #[tokio::test]
    async fn test_add_reserve_and_conflict_listing() {
        let (h, _) = handler();

        let first = call(&h, kind::ADD_RESERVE, json!({"programId": 1})).await.unwrap();
        assert_eq!(first, json!("reserved"));
        let second = call(&h, kind::ADD_RESERVE, json!({"programId": 2})).await.unwrap();
        assert_eq!(second, json!("conflict"));

        let all = h.handle(kind::GET_RESERVE_ALL_ID.to_string(), None).await.unwrap();
        assert_eq!(all, json!({"reserves": [1], "conflicts": [2], "skips": []}));

        let conflicts = call(&h, kind::GET_RESERVE_CONFLICTS, json!({"limit": 10})).await.unwrap();
        assert_eq!(conflicts["total"], json!(1));
    }

    #[tokio::test]
    async fn test_errors_come_back_as_strings() {
        let (h, _) = handler();

        let missing = call(&h, kind::CANCEL_RESERVE, json!({"programId": 9})).await;
        assert!(missing.unwrap_err().contains('9'));

        let malformed = call(&h, kind::ADD_RESERVE, json!({"programId": "x"})).await;
        assert!(malformed.unwrap_err().starts_with("invalid payload"));

        let unknown = call(&h, "bogus", Value::Null).await;
        assert_eq!(unknown.unwrap_err(), "unknown request kind: bogus");
    }

    #[tokio::test]
    async fn test_add_encode_file_deletes_source_when_asked() {
        let (h, store) = handler();
        let dir = TempDir::new().unwrap();
        let ts = dir.path().join("p1.ts");
        let mp4 = dir.path().join("p1.mp4");
        std::fs::write(&ts, b"ts").unwrap();
        std::fs::write(&mp4, b"mp4").unwrap();

        let recorded_id = store
            .add_recorded(RecordedItem {
                id: 0,
                program_id: 1,
                channel_id: 1,
                name: "p1".to_string(),
                rec_path: Some(ts.clone()),
                size: None,
            })
            .unwrap();

        let encoded_id = call(
            &h,
            kind::ADD_ENCODE_FILE,
            json!({"recordedId": recorded_id, "name": "p1", "filePath": mp4, "delTs": true}),
        )
        .await
        .unwrap();

        let encoded = store
            .find_encoded_by_id(encoded_id.as_i64().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(encoded.path, PathBuf::from(&mp4));
        assert_eq!(encoded.size, Some(3));
        assert!(!ts.exists());
        assert!(store.find_recorded_by_id(recorded_id).unwrap().unwrap().rec_path.is_none());

        let fetched = call(&h, kind::GET_ENCODED, json!({"id": encoded.id})).await.unwrap();
        assert_eq!(fetched["recordedId"], json!(recorded_id));
    }

    #[tokio::test]
    async fn test_update_ts_file_size_refreshes_recorded_size() {
        let (h, store) = handler();
        let dir = TempDir::new().unwrap();
        let ts = dir.path().join("p1.ts");
        std::fs::write(&ts, b"before").unwrap();

        let recorded_id = store
            .add_recorded(RecordedItem {
                id: 0,
                program_id: 1,
                channel_id: 1,
                name: "p1".to_string(),
                rec_path: Some(ts.clone()),
                size: Some(6),
            })
            .unwrap();

        std::fs::write(&ts, b"rewritten in place").unwrap();
        let reply = call(&h, kind::UPDATE_TS_FILE_SIZE, json!({"recordedId": recorded_id}))
            .await
            .unwrap();
        assert_eq!(reply, Value::Null);
        assert_eq!(
            store.find_recorded_by_id(recorded_id).unwrap().unwrap().size,
            Some(18)
        );

        let missing = call(&h, kind::UPDATE_TS_FILE_SIZE, json!({"recordedId": 99})).await;
        assert_eq!(missing.unwrap_err(), "Recorded item 99 is not found");
    }
}
