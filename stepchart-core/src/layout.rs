//! Persisted layout of a session.
//!
//! Everything a session needs to resume lives in one bucket tree:
//!
//! ```text
//! Version, SessionId, DocumentChecksum, Name, Status     header
//! Running, Configuration, StatesToInvoke, BoundStates    state sets
//! History/<history node>                                 history values
//! Queue/{Head, Tail, Items/<slot>/<event>}               internal queue
//! Invokes/{Count, Items/<n>/<invoke id>}                 active invokes
//! InvokeCounter, DataModel, CurrentEvent, DoneData
//! Capture/<depth>/<index>/{StepKey, StepStatus, StepResult, Data, Iteration}
//! ```

use crate::document::DocId;
use crate::error::{EngineError, PersistenceError};
use crate::event::{Event, EventType, InvokeId};
use serde_json::Value;
use stepchart_storage::{Bucket, KeyPath, KeySegment, StorageError};

/// Version of the layout above. Logs with another version are rejected.
pub const FORMAT_VERSION: i64 = 1;

/// Named keys of the persisted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Version = 1,
    SessionId = 2,
    DocumentChecksum = 3,
    Status = 4,
    Running = 5,
    Configuration = 6,
    History = 7,
    Queue = 9,
    Head = 10,
    Tail = 11,
    Items = 12,
    StatesToInvoke = 13,
    Invokes = 14,
    Count = 15,
    DataModel = 16,
    CurrentEvent = 17,
    Name = 18,
    Type = 19,
    SendId = 20,
    Origin = 21,
    OriginType = 22,
    InvokeId = 23,
    Node = 24,
    Instance = 25,
    Data = 26,
    Capture = 27,
    StepKey = 28,
    StepStatus = 29,
    StepResult = 30,
    Iteration = 31,
    InvokeCounter = 32,
    DoneData = 33,
    BoundStates = 34,
}

impl KeySegment for Key {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
        path.push_enum(*self as u64)
    }
}

pub(crate) fn corrupt(what: impl Into<String>) -> EngineError {
    EngineError::Persistence(PersistenceError::Corrupt(what.into()))
}

/// Writes `event` into `bucket`, replacing whatever was there.
pub(crate) fn write_event(bucket: &Bucket, event: &Event) -> Result<(), EngineError> {
    bucket.clear();
    bucket.add(Key::Name, &event.name)?;
    bucket.add(Key::Type, &event.event_type.code())?;
    if let Some(send_id) = &event.send_id {
        bucket.add(Key::SendId, send_id)?;
    }
    if let Some(origin) = &event.origin {
        bucket.add(Key::Origin, origin)?;
    }
    if let Some(origin_type) = &event.origin_type {
        bucket.add(Key::OriginType, origin_type)?;
    }
    if let Some(invoke_id) = &event.invoke_id {
        write_invoke_id(&bucket.nested(Key::InvokeId)?, invoke_id)?;
    }
    if !event.data.is_null() {
        bucket.add(Key::Data, &serde_json::to_string(&event.data)?)?;
    }
    Ok(())
}

/// Reads an event written by [`write_event`]. Returns `None` if the bucket
/// holds no event.
pub(crate) fn read_event(bucket: &Bucket) -> Result<Option<Event>, EngineError> {
    let Some(name) = bucket.try_get::<String>(Key::Name)? else {
        return Ok(None);
    };
    let code: i64 = bucket
        .try_get(Key::Type)?
        .ok_or_else(|| corrupt("event type"))?;
    let event_type = EventType::from_code(code).ok_or_else(|| corrupt(format!("event type {}", code)))?;

    let data = match bucket.try_get::<String>(Key::Data)? {
        Some(json) => serde_json::from_str(&json)?,
        None => Value::Null,
    };

    Ok(Some(Event {
        name,
        event_type,
        send_id: bucket.try_get(Key::SendId)?,
        origin: bucket.try_get(Key::Origin)?,
        origin_type: bucket.try_get(Key::OriginType)?,
        invoke_id: read_invoke_id(&bucket.nested(Key::InvokeId)?)?,
        data,
    }))
}

pub(crate) fn write_invoke_id(bucket: &Bucket, id: &InvokeId) -> Result<(), EngineError> {
    bucket.add(Key::InvokeId, &id.value)?;
    bucket.add(Key::Node, &id.node.0)?;
    bucket.add(Key::Instance, &id.instance)?;
    Ok(())
}

pub(crate) fn read_invoke_id(bucket: &Bucket) -> Result<Option<InvokeId>, EngineError> {
    let Some(value) = bucket.try_get::<String>(Key::InvokeId)? else {
        return Ok(None);
    };
    let node: u32 = bucket
        .try_get(Key::Node)?
        .ok_or_else(|| corrupt("invoke node"))?;
    let instance: u64 = bucket
        .try_get(Key::Instance)?
        .ok_or_else(|| corrupt("invoke instance"))?;
    Ok(Some(InvokeId::new(value, DocId(node), instance)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use stepchart_storage::SharedStorage;
    use stepchart_wal::InMemoryStorage;

    fn bucket() -> Bucket {
        let storage: SharedStorage = Arc::new(Mutex::new(InMemoryStorage::new()));
        Bucket::new(storage)
    }

    #[test]
    fn test_event_codec_keeps_every_field() {
        let root = bucket();
        let slot = root.nested(Key::CurrentEvent).unwrap();
        let event = Event::external("done.invoke.child")
            .with_data(json!({"result": [1, 2]}))
            .with_send_id("s-7")
            .with_origin("#_child", "scxml")
            .with_invoke_id(InvokeId::new("child", DocId(12), 3));

        write_event(&slot, &event).unwrap();
        assert_eq!(read_event(&slot).unwrap(), Some(event));
    }

    #[test]
    fn test_event_overwrite_drops_old_fields() {
        let slot = bucket().nested(Key::CurrentEvent).unwrap();
        write_event(&slot, &Event::external("a").with_send_id("x")).unwrap();
        write_event(&slot, &Event::internal("b")).unwrap();

        let event = read_event(&slot).unwrap().unwrap();
        assert_eq!(event.name, "b");
        assert_eq!(event.send_id, None);
        assert_eq!(event.event_type, EventType::Internal);
    }

    #[test]
    fn test_missing_event_and_bad_type() {
        let slot = bucket().nested(Key::CurrentEvent).unwrap();
        assert_eq!(read_event(&slot).unwrap(), None);

        slot.add(Key::Name, &"x".to_string()).unwrap();
        slot.add(Key::Type, &9i64).unwrap();
        assert!(read_event(&slot).unwrap_err().is_corruption());
    }

    #[test]
    fn test_keys_are_distinct_from_indices() {
        let enum_path = KeyPath::root().join(Key::Version).unwrap();
        let index_path = KeyPath::root().join(Key::Version as u64).unwrap();
        assert_ne!(enum_path, index_path);
    }
}
