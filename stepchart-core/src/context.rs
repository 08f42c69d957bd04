//! Execution context of a running session.
//!
//! Holds the configuration, history values, internal queue, states to
//! invoke, active invokes and data model. Every mutation goes through a
//! method here that updates the in-memory collection and writes the
//! matching delta into the session bucket, so the persisted tree always
//! mirrors memory at the next checkpoint.

use crate::action::ActionContext;
use crate::cancel::CancellationContext;
use crate::collections::{EntityQueue, InvokeIdSet, KeyList, OrderedSet};
use crate::datamodel::{DataModel, EVENT};
use crate::document::{DocId, Document};
use crate::error::EngineError;
use crate::event::{Event, InvokeId, SessionId};
use crate::invoke::EventDispatcher;
use crate::layout::{corrupt, read_event, read_invoke_id, write_event, write_invoke_id, Key};
use serde_json::Value;
use stepchart_storage::{Bucket, DocIdList};

pub(crate) struct ExecutionContext {
    bucket: Bucket,
    configuration: OrderedSet<DocId>,
    history: KeyList,
    internal_queue: EntityQueue<Event>,
    states_to_invoke: OrderedSet<DocId>,
    invokes: InvokeIdSet,
    bound_states: OrderedSet<DocId>,
    data: DataModel,
    running: bool,
    invoke_counter: u64,
    current_event: Option<Event>,
}

impl ExecutionContext {
    /// Creates an empty context for a new session.
    pub fn fresh(bucket: Bucket, case_sensitive: bool) -> Self {
        Self {
            bucket,
            configuration: OrderedSet::new(),
            history: KeyList::new(),
            internal_queue: EntityQueue::new(),
            states_to_invoke: OrderedSet::new(),
            invokes: InvokeIdSet::new(),
            bound_states: OrderedSet::new(),
            data: DataModel::new(case_sensitive),
            running: false,
            invoke_counter: 0,
            current_event: None,
        }
    }

    /// Rebuilds the context from the persisted tree, checking every stored
    /// document id against `document`.
    pub fn restore(
        bucket: Bucket,
        document: &Document,
        case_sensitive: bool,
    ) -> Result<Self, EngineError> {
        let states = |key: Key| -> Result<OrderedSet<DocId>, EngineError> {
            let list = bucket.get_or(key, DocIdList::default())?;
            list.0
                .into_iter()
                .map(|id| checked(document, id))
                .collect::<Result<OrderedSet<_>, _>>()
        };
        let configuration = states(Key::Configuration)?;
        let states_to_invoke = states(Key::StatesToInvoke)?;
        let bound_states = states(Key::BoundStates)?;

        let mut history = KeyList::new();
        let history_bucket = bucket.nested(Key::History)?;
        for node in document.nodes().filter(|n| document.is_history(n.doc_id)) {
            if let Some(list) = history_bucket.try_get::<DocIdList>(node.doc_id)? {
                let restored = list
                    .0
                    .into_iter()
                    .map(|id| checked(document, id))
                    .collect::<Result<Vec<_>, _>>()?;
                history.set(node.doc_id, restored);
            }
        }

        let queue = bucket.nested(Key::Queue)?;
        let head: u64 = queue.get_or(Key::Head, 0u64)?;
        let tail: u64 = queue.get_or(Key::Tail, 0u64)?;
        let items = queue.nested(Key::Items)?;
        let mut events = Vec::new();
        for slot in head..tail {
            let event = read_event(&items.nested(slot)?)?
                .ok_or_else(|| corrupt(format!("internal queue slot {}", slot)))?;
            events.push(event);
        }

        let invokes_bucket = bucket.nested(Key::Invokes)?;
        let count: u64 = invokes_bucket.get_or(Key::Count, 0u64)?;
        let invoke_items = invokes_bucket.nested(Key::Items)?;
        let mut invokes = InvokeIdSet::new();
        for n in 0..count {
            let id = read_invoke_id(&invoke_items.nested(n)?)?
                .ok_or_else(|| corrupt(format!("active invoke {}", n)))?;
            checked(document, id.node.0)?;
            invokes.insert(id);
        }

        let data = match bucket.try_get::<String>(Key::DataModel)? {
            Some(json) => DataModel::from_json(serde_json::from_str(&json)?, case_sensitive)
                .map_err(|e| corrupt(format!("data model: {}", e)))?,
            None => DataModel::new(case_sensitive),
        };

        Ok(Self {
            configuration,
            history,
            internal_queue: EntityQueue::from_parts(head, events),
            states_to_invoke,
            invokes,
            bound_states,
            data,
            running: bucket.get_or(Key::Running, false)?,
            invoke_counter: bucket.get_or(Key::InvokeCounter, 0u64)?,
            current_event: read_event(&bucket.nested(Key::CurrentEvent)?)?,
            bucket,
        })
    }

    // Configuration

    pub fn configuration(&self) -> &OrderedSet<DocId> {
        &self.configuration
    }

    pub fn add_configuration(&mut self, state: DocId) -> Result<(), EngineError> {
        if self.configuration.insert(state) {
            self.write_states(Key::Configuration, &self.configuration)?;
        }
        Ok(())
    }

    pub fn remove_configuration(&mut self, state: DocId) -> Result<(), EngineError> {
        if self.configuration.remove(&state) {
            self.write_states(Key::Configuration, &self.configuration)?;
        }
        Ok(())
    }

    // History

    pub fn history(&self) -> &KeyList {
        &self.history
    }

    pub fn set_history(&mut self, node: DocId, states: Vec<DocId>) -> Result<(), EngineError> {
        self.bucket
            .nested(Key::History)?
            .add(node, &to_list(states.iter()))?;
        self.history.set(node, states);
        Ok(())
    }

    // Internal queue

    pub fn internal_queue(&self) -> &EntityQueue<Event> {
        &self.internal_queue
    }

    pub fn enqueue_internal(&mut self, event: Event) -> Result<(), EngineError> {
        let queue = self.bucket.nested(Key::Queue)?;
        let slot = self.internal_queue.tail();
        write_event(&queue.nested(Key::Items)?.nested(slot)?, &event)?;
        self.internal_queue.push(event);
        queue.add(Key::Tail, &self.internal_queue.tail())?;
        Ok(())
    }

    pub fn dequeue_internal(&mut self) -> Result<Option<Event>, EngineError> {
        let Some((slot, event)) = self.internal_queue.pop() else {
            return Ok(None);
        };
        let queue = self.bucket.nested(Key::Queue)?;
        queue.nested(Key::Items)?.remove_subtree(slot)?;
        queue.add(Key::Head, &self.internal_queue.head())?;
        Ok(Some(event))
    }

    // Invokes

    pub fn states_to_invoke(&self) -> &OrderedSet<DocId> {
        &self.states_to_invoke
    }

    pub fn add_state_to_invoke(&mut self, state: DocId) -> Result<(), EngineError> {
        if self.states_to_invoke.insert(state) {
            self.write_states(Key::StatesToInvoke, &self.states_to_invoke)?;
        }
        Ok(())
    }

    pub fn remove_state_to_invoke(&mut self, state: DocId) -> Result<(), EngineError> {
        if self.states_to_invoke.remove(&state) {
            self.write_states(Key::StatesToInvoke, &self.states_to_invoke)?;
        }
        Ok(())
    }

    pub fn clear_states_to_invoke(&mut self) -> Result<(), EngineError> {
        if !self.states_to_invoke.is_empty() {
            self.states_to_invoke.clear();
            self.bucket.remove(Key::StatesToInvoke)?;
        }
        Ok(())
    }

    pub fn invokes(&self) -> &InvokeIdSet {
        &self.invokes
    }

    pub fn add_invoke(&mut self, id: InvokeId) -> Result<(), EngineError> {
        if self.invokes.insert(id) {
            self.write_invokes()?;
        }
        Ok(())
    }

    pub fn remove_invoke(&mut self, id: &InvokeId) -> Result<(), EngineError> {
        if self.invokes.remove(id) {
            self.write_invokes()?;
        }
        Ok(())
    }

    /// Returns the next invoke instance number.
    pub fn next_invoke_instance(&mut self) -> Result<u64, EngineError> {
        self.invoke_counter += 1;
        self.bucket.add(Key::InvokeCounter, &self.invoke_counter)?;
        Ok(self.invoke_counter)
    }

    // Data model

    pub fn data(&self) -> &DataModel {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataModel {
        &mut self.data
    }

    pub fn is_bound(&self, state: DocId) -> bool {
        self.bound_states.contains(&state)
    }

    pub fn mark_bound(&mut self, state: DocId) -> Result<(), EngineError> {
        if self.bound_states.insert(state) {
            self.write_states(Key::BoundStates, &self.bound_states)?;
        }
        Ok(())
    }

    /// Writes the data model if it changed since the last flush.
    pub fn flush_data_model(&mut self) -> Result<(), EngineError> {
        if self.data.is_dirty() {
            let json = serde_json::to_string(&self.data.to_json())?;
            self.bucket.add(Key::DataModel, &json)?;
            self.data.mark_clean();
        }
        Ok(())
    }

    // Run state

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) -> Result<(), EngineError> {
        self.running = running;
        self.bucket.add(Key::Running, &running)?;
        Ok(())
    }

    pub fn current_event(&self) -> Option<&Event> {
        self.current_event.as_ref()
    }

    /// Makes `event` the current event and publishes it as `_event`.
    pub fn set_current_event(&mut self, event: Event) -> Result<(), EngineError> {
        write_event(&self.bucket.nested(Key::CurrentEvent)?, &event)?;
        self.data.set_system(EVENT, event.to_system_variable());
        self.current_event = Some(event);
        Ok(())
    }

    /// Builds the view executable content runs against.
    pub fn action_context<'a>(
        &'a mut self,
        document: &'a Document,
        session: &'a SessionId,
        dispatcher: &'a dyn EventDispatcher,
        cancellation: &'a CancellationContext,
    ) -> ActionContext<'a> {
        ActionContext::new(
            &mut self.data,
            &self.configuration,
            document,
            session,
            dispatcher,
            cancellation,
        )
    }

    pub fn set_system(&mut self, name: &str, value: Value) {
        self.data.set_system(name, value);
    }

    fn write_states(&self, key: Key, states: &OrderedSet<DocId>) -> Result<(), EngineError> {
        self.bucket.add(key, &to_list(states.iter()))?;
        Ok(())
    }

    fn write_invokes(&self) -> Result<(), EngineError> {
        let bucket = self.bucket.nested(Key::Invokes)?;
        bucket.clear();
        let items = bucket.nested(Key::Items)?;
        for (n, id) in self.invokes.iter().enumerate() {
            write_invoke_id(&items.nested(n)?, id)?;
        }
        bucket.add(Key::Count, &(self.invokes.len() as u64))?;
        Ok(())
    }
}

fn to_list<'a>(states: impl Iterator<Item = &'a DocId>) -> DocIdList {
    DocIdList(states.map(|s| s.0).collect())
}

fn checked(document: &Document, id: u32) -> Result<DocId, EngineError> {
    let doc_id = DocId(id);
    if document.get(doc_id).is_none() {
        return Err(corrupt(format!("document id {} out of range", id)));
    }
    Ok(doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentBuilder, StateSpec};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use stepchart_storage::SharedStorage;
    use stepchart_wal::InMemoryStorage;

    fn document() -> Document {
        DocumentBuilder::new("ctx")
            .state(
                StateSpec::state("a")
                    .child(StateSpec::state("a1"))
                    .child(StateSpec::history("h", true).transition(
                        crate::document::TransitionSpec::eventless().target("a1"),
                    )),
            )
            .state(StateSpec::state("b"))
            .build()
            .unwrap()
    }

    fn bucket() -> Bucket {
        let storage: SharedStorage = Arc::new(Mutex::new(InMemoryStorage::new()));
        Bucket::new(storage)
    }

    #[test]
    fn test_restore_mirrors_mutations() {
        let doc = document();
        let root = bucket();
        let a = doc.lookup("a").unwrap();
        let a1 = doc.lookup("a1").unwrap();
        let h = doc.lookup("h").unwrap();

        let mut ctx = ExecutionContext::fresh(root.clone(), true);
        ctx.add_configuration(a).unwrap();
        ctx.add_configuration(a1).unwrap();
        ctx.set_history(h, vec![a1]).unwrap();
        ctx.enqueue_internal(Event::internal("first")).unwrap();
        ctx.enqueue_internal(Event::internal("second")).unwrap();
        ctx.dequeue_internal().unwrap();
        ctx.add_state_to_invoke(a1).unwrap();
        ctx.add_invoke(InvokeId::new("svc", DocId(3), 1)).unwrap();
        ctx.add_invoke(InvokeId::new("svc", DocId(3), 2)).unwrap();
        ctx.remove_invoke(&InvokeId::new("svc", DocId(3), 1)).unwrap();
        ctx.data_mut().declare("n", json!(4));
        ctx.flush_data_model().unwrap();
        ctx.set_running(true).unwrap();
        ctx.set_current_event(Event::external("go")).unwrap();

        let restored = ExecutionContext::restore(root, &doc, true).unwrap();
        assert_eq!(restored.configuration().to_vec(), vec![a, a1]);
        assert_eq!(restored.history().get(h), Some(&[a1][..]));
        let queued: Vec<_> = restored.internal_queue().iter().map(|e| e.name.clone()).collect();
        assert_eq!(queued, vec!["second"]);
        assert_eq!(restored.internal_queue().head(), 1);
        assert_eq!(restored.states_to_invoke().to_vec(), vec![a1]);
        assert_eq!(
            restored.invokes().iter().cloned().collect::<Vec<_>>(),
            vec![InvokeId::new("svc", DocId(3), 2)]
        );
        assert_eq!(restored.data().get("n"), Some(&json!(4)));
        assert!(restored.is_running());
        assert_eq!(restored.current_event().map(|e| e.name.as_str()), Some("go"));
    }

    #[test]
    fn test_restore_rejects_unknown_document_ids() {
        let doc = document();
        let root = bucket();
        root.add(Key::Configuration, &DocIdList(vec![999])).unwrap();
        let err = ExecutionContext::restore(root, &doc, true).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_current_event_sets_system_variable() {
        let mut ctx = ExecutionContext::fresh(bucket(), true);
        ctx.set_current_event(Event::external("ping").with_data(json!(7)))
            .unwrap();
        assert_eq!(ctx.data().get("_event.name"), Some(&json!("ping")));
        assert_eq!(ctx.data().get("_event.data"), Some(&json!(7)));
    }

    #[test]
    fn test_invoke_counter_increases() {
        let mut ctx = ExecutionContext::fresh(bucket(), true);
        assert_eq!(ctx.next_invoke_instance().unwrap(), 1);
        assert_eq!(ctx.next_invoke_instance().unwrap(), 2);
    }
}
