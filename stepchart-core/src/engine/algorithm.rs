//! Transition selection, conflict resolution, state exit and entry.
//!
//! These follow the W3C SCXML algorithm. State sets are walked in document
//! order, which is also entry order; exits run in reverse document order.

use super::Interpreter;
use crate::action::ValueExpr;
use crate::collections::OrderedSet;
use crate::datamodel::{NAME, SESSION_ID};
use crate::document::{ActionList, Binding, DataSource, DocId, Document, NodeKind, TransitionKind};
use crate::error::{classify, BoxError, CommunicationFault, EngineError};
use crate::event::{any_descriptor_matches, Event, InvokeId};
use crate::invoke::{generated_invoke_value, InvokeRequest};
use crate::observer::report_error;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// States collected while computing an entry set.
#[derive(Default)]
struct EntrySet {
    states: OrderedSet<DocId>,
    default_entry: OrderedSet<DocId>,
    /// Default history transition to run, keyed by the history's parent.
    history_content: HashMap<DocId, DocId>,
}

impl Interpreter {
    /// Binds data, sets the system variables and enters the initial
    /// configuration.
    pub(super) fn initialize(&mut self) -> Result<(), EngineError> {
        let doc = Arc::clone(&self.document);
        self.ctx.set_system(SESSION_ID, json!(self.session.as_str()));
        self.ctx.set_system(NAME, json!(doc.name()));

        match doc.binding() {
            Binding::Early => {
                let states: Vec<DocId> = doc
                    .nodes()
                    .filter(|n| doc.is_root(n.doc_id) || doc.is_state(n.doc_id))
                    .map(|n| n.doc_id)
                    .collect();
                for state in states {
                    self.initialize_data(&doc, state)?;
                }
            }
            Binding::Late => {
                self.initialize_data(&doc, Document::ROOT)?;
                self.ctx.mark_bound(Document::ROOT)?;
            }
        }

        self.ctx.set_running(true)?;
        let initial = doc
            .initial_transition(Document::ROOT)
            .ok_or_else(|| EngineError::invalid_document("document has no initial transition"))?;
        self.enter_states(&doc, &[initial])?;
        self.notify_configuration();
        tracing::debug!(
            session = %self.session,
            "Initialized, entered {:?}",
            self.configuration()
        );
        Ok(())
    }

    fn initialize_data(&mut self, doc: &Document, state: DocId) -> Result<(), EngineError> {
        for data in doc.data(state) {
            let value = match &data.source {
                DataSource::Literal(value) => value.clone(),
                DataSource::Expr(expr) => match self.evaluate_value(doc, expr.as_ref()) {
                    Ok(value) => value,
                    Err(e) => {
                        self.raise_error(e)?;
                        Value::Null
                    }
                },
                DataSource::Unset => Value::Null,
            };
            self.ctx.data_mut().declare(&data.id, value);
        }
        Ok(())
    }

    pub(super) fn select_eventless_transitions(&mut self) -> Result<Vec<DocId>, EngineError> {
        self.select(None)
    }

    pub(super) fn select_transitions(&mut self, event: &Event) -> Result<Vec<DocId>, EngineError> {
        self.select(Some(&event.name))
    }

    /// For each active atomic state, the first enabled transition found on
    /// the state or its ancestors, with conflicts removed.
    fn select(&mut self, event: Option<&str>) -> Result<Vec<DocId>, EngineError> {
        let doc = Arc::clone(&self.document);
        let atomic: Vec<DocId> = self
            .ctx
            .configuration()
            .in_document_order()
            .into_iter()
            .filter(|s| doc.is_atomic(*s))
            .collect();

        let mut enabled = OrderedSet::new();
        for state in atomic {
            let chain = std::iter::once(state).chain(doc.proper_ancestors(state, None));
            'chain: for source in chain {
                for (id, transition) in doc.transitions(source) {
                    let triggered = match event {
                        None => transition.is_eventless(),
                        Some(name) => {
                            !transition.is_eventless() && any_descriptor_matches(&transition.events, name)
                        }
                    };
                    if triggered && self.condition_holds(&doc, id)? {
                        enabled.insert(id);
                        break 'chain;
                    }
                }
            }
        }
        Ok(self.remove_conflicting(&doc, enabled.to_vec()))
    }

    /// Evaluates a transition guard. A failing guard raises an error event
    /// and counts as false.
    fn condition_holds(&mut self, doc: &Document, transition: DocId) -> Result<bool, EngineError> {
        let Some(cond) = doc.transition(transition).and_then(|t| t.cond.clone()) else {
            return Ok(true);
        };
        let result = {
            let ctx = self
                .ctx
                .action_context(doc, &self.session, self.dispatcher.as_ref(), &self.cancel);
            cond.evaluate(&ctx)
        };
        match result {
            Ok(holds) => Ok(holds),
            Err(e) => {
                self.raise_error(e)?;
                Ok(false)
            }
        }
    }

    /// Drops transitions whose exit sets intersect an earlier one. A
    /// transition from a descendant state wins over one from its ancestor;
    /// otherwise the earlier transition wins.
    fn remove_conflicting(&self, doc: &Document, enabled: Vec<DocId>) -> Vec<DocId> {
        let mut filtered: Vec<DocId> = Vec::new();
        for t1 in enabled {
            let exit1 = self.compute_exit_set(doc, &[t1]);
            let mut preempted = false;
            let mut displaced = Vec::new();
            for &t2 in &filtered {
                if exit1.has_intersection(&self.compute_exit_set(doc, &[t2])) {
                    if doc.is_descendant(doc.transition_source(t1), doc.transition_source(t2)) {
                        displaced.push(t2);
                    } else {
                        preempted = true;
                        break;
                    }
                }
            }
            if !preempted {
                filtered.retain(|t| !displaced.contains(t));
                filtered.push(t1);
            }
        }
        filtered
    }

    fn compute_exit_set(&self, doc: &Document, transitions: &[DocId]) -> OrderedSet<DocId> {
        let mut states = OrderedSet::new();
        for &t in transitions {
            let has_targets = doc.transition(t).map(|t| !t.targets.is_empty()).unwrap_or(false);
            if !has_targets {
                continue;
            }
            if let Some(domain) = self.transition_domain(doc, t) {
                for &s in self.ctx.configuration().iter() {
                    if doc.is_descendant(s, domain) {
                        states.insert(s);
                    }
                }
            }
        }
        states
    }

    fn transition_domain(&self, doc: &Document, t: DocId) -> Option<DocId> {
        let transition = doc.transition(t)?;
        let targets = self.effective_target_states(doc, t);
        if targets.is_empty() {
            return None;
        }
        let source = doc.transition_source(t);
        if transition.kind == TransitionKind::Internal
            && doc.is_compound(source)
            && targets.iter().all(|s| doc.is_descendant(*s, source))
        {
            return Some(source);
        }
        let mut states = vec![source];
        states.extend(targets.iter().copied());
        Some(find_lcca(doc, &states))
    }

    /// Targets with history states replaced by their recorded or default
    /// content.
    fn effective_target_states(&self, doc: &Document, t: DocId) -> OrderedSet<DocId> {
        let mut targets = OrderedSet::new();
        let Some(transition) = doc.transition(t) else {
            return targets;
        };
        for &s in &transition.targets {
            if !doc.is_history(s) {
                targets.insert(s);
                continue;
            }
            match self.ctx.history().get(s) {
                Some(recorded) => {
                    for &state in recorded {
                        targets.insert(state);
                    }
                }
                None => {
                    if let Some(default) = doc.history_default(s) {
                        for state in self.effective_target_states(doc, default).iter() {
                            targets.insert(*state);
                        }
                    }
                }
            }
        }
        targets
    }

    /// Exits the source configuration, runs transition content and enters
    /// the targets.
    pub(super) fn microstep(&mut self, transitions: &[DocId]) -> Result<(), EngineError> {
        let doc = Arc::clone(&self.document);
        self.exit_states(&doc, transitions)?;
        for &t in transitions {
            if let Some(transition) = doc.transition(t) {
                self.execute_block(&doc, &transition.actions)?;
            }
        }
        self.enter_states(&doc, transitions)?;
        self.notify_configuration();
        Ok(())
    }

    fn exit_states(&mut self, doc: &Document, transitions: &[DocId]) -> Result<(), EngineError> {
        let mut exiting = self.compute_exit_set(doc, transitions).to_vec();
        exiting.sort_unstable_by(|a, b| b.cmp(a));

        for &s in &exiting {
            self.ctx.remove_state_to_invoke(s)?;
        }

        for &s in &exiting {
            let histories: Vec<DocId> = doc.history_children(s).collect();
            for h in histories {
                let active = self.ctx.configuration().in_document_order();
                let recorded: Vec<DocId> = if doc.is_deep_history(h) {
                    active
                        .into_iter()
                        .filter(|c| doc.is_atomic(*c) && doc.is_descendant(*c, s))
                        .collect()
                } else {
                    active
                        .into_iter()
                        .filter(|c| doc.node(*c).parent == Some(s))
                        .collect()
                };
                self.ctx.set_history(h, recorded)?;
            }
        }

        for s in exiting {
            self.exit_state(doc, s)?;
        }
        Ok(())
    }

    /// Runs onexit content, cancels the state's invokes and removes it from
    /// the configuration.
    fn exit_state(&mut self, doc: &Document, state: DocId) -> Result<(), EngineError> {
        for block in doc.on_exit(state) {
            self.execute_block(doc, block)?;
        }
        let nodes: Vec<DocId> = doc.invokes(state).map(|(id, _)| id).collect();
        for id in self.ctx.invokes().started_from(&nodes) {
            self.cancel_invoke(&id)?;
        }
        self.ctx.remove_configuration(state)
    }

    fn enter_states(&mut self, doc: &Document, transitions: &[DocId]) -> Result<(), EngineError> {
        let mut entry = EntrySet::default();
        self.compute_entry_set(doc, transitions, &mut entry);

        for s in entry.states.in_document_order() {
            self.ctx.add_configuration(s)?;
            if doc.invokes(s).next().is_some() {
                self.ctx.add_state_to_invoke(s)?;
            }
            if doc.binding() == Binding::Late && !self.ctx.is_bound(s) {
                self.initialize_data(doc, s)?;
                self.ctx.mark_bound(s)?;
            }

            for block in doc.on_entry(s) {
                self.execute_block(doc, block)?;
            }
            if entry.default_entry.contains(&s) {
                if let Some(initial) = doc.initial_transition(s).and_then(|t| doc.transition(t)) {
                    self.execute_block(doc, &initial.actions)?;
                }
            }
            if let Some(default) = entry.history_content.get(&s).and_then(|t| doc.transition(*t)) {
                self.execute_block(doc, &default.actions)?;
            }

            if doc.is_final(s) {
                self.enter_final(doc, s)?;
            }
        }
        Ok(())
    }

    /// A final state under the root ends the loop; anywhere else it raises
    /// `done.state.<parent>`, and `done.state.<grandparent>` once every
    /// region of a parallel grandparent is done.
    fn enter_final(&mut self, doc: &Document, state: DocId) -> Result<(), EngineError> {
        let parent = doc.node(state).parent.unwrap_or(Document::ROOT);
        if doc.is_root(parent) {
            return self.ctx.set_running(false);
        }

        let data = self.done_data(doc, state)?.unwrap_or(Value::Null);
        self.raise_internal(
            Event::platform(format!("done.state.{}", doc.node(parent).id())).with_data(data),
        )?;

        if let Some(grandparent) = doc.node(parent).parent {
            if doc.is_parallel(grandparent)
                && doc
                    .child_states(grandparent)
                    .all(|region| self.is_in_final_state(doc, region))
            {
                self.raise_internal(Event::platform(format!(
                    "done.state.{}",
                    doc.node(grandparent).id()
                )))?;
            }
        }
        Ok(())
    }

    fn is_in_final_state(&self, doc: &Document, state: DocId) -> bool {
        if doc.is_compound(state) {
            doc.child_states(state)
                .any(|c| doc.is_final(c) && self.ctx.configuration().contains(&c))
        } else if doc.is_parallel(state) {
            doc.child_states(state).all(|c| self.is_in_final_state(doc, c))
        } else {
            false
        }
    }

    /// Evaluates `<donedata>`. An evaluation failure raises an error event
    /// and yields null.
    fn done_data(&mut self, doc: &Document, state: DocId) -> Result<Option<Value>, EngineError> {
        let NodeKind::Final {
            done_data: Some(expr),
        } = &doc.node(state).kind
        else {
            return Ok(None);
        };
        match self.evaluate_value(doc, expr.as_ref()) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.raise_error(e)?;
                Ok(Some(Value::Null))
            }
        }
    }

    fn compute_entry_set(&self, doc: &Document, transitions: &[DocId], entry: &mut EntrySet) {
        for &t in transitions {
            let Some(transition) = doc.transition(t) else {
                continue;
            };
            for &s in &transition.targets {
                self.add_descendant_states_to_enter(doc, s, entry);
            }
            if let Some(domain) = self.transition_domain(doc, t) {
                for s in self.effective_target_states(doc, t).to_vec() {
                    self.add_ancestor_states_to_enter(doc, s, domain, entry);
                }
            }
        }
    }

    fn add_descendant_states_to_enter(&self, doc: &Document, state: DocId, entry: &mut EntrySet) {
        if doc.is_history(state) {
            let parent = doc.node(state).parent.unwrap_or(Document::ROOT);
            if let Some(recorded) = self.ctx.history().get(state) {
                let recorded = recorded.to_vec();
                for &s in &recorded {
                    self.add_descendant_states_to_enter(doc, s, entry);
                }
                for &s in &recorded {
                    self.add_ancestor_states_to_enter(doc, s, parent, entry);
                }
            } else if let Some(default) = doc.history_default(state) {
                entry.history_content.insert(parent, default);
                let targets = doc.transition(default).map(|t| t.targets.clone()).unwrap_or_default();
                for &s in &targets {
                    self.add_descendant_states_to_enter(doc, s, entry);
                }
                for &s in &targets {
                    self.add_ancestor_states_to_enter(doc, s, parent, entry);
                }
            }
            return;
        }

        entry.states.insert(state);
        if doc.is_compound(state) {
            entry.default_entry.insert(state);
            match doc.initial_transition(state) {
                Some(initial) => {
                    // History targets are expanded by the descendant pass,
                    // which also queues their default content.
                    let targets = doc.transition(initial).map(|t| t.targets.clone()).unwrap_or_default();
                    for &s in &targets {
                        self.add_descendant_states_to_enter(doc, s, entry);
                    }
                    for s in self.effective_target_states(doc, initial).to_vec() {
                        self.add_ancestor_states_to_enter(doc, s, state, entry);
                    }
                }
                None => {
                    if let Some(first) = doc.child_states(state).next() {
                        self.add_descendant_states_to_enter(doc, first, entry);
                        self.add_ancestor_states_to_enter(doc, first, state, entry);
                    }
                }
            }
        } else if doc.is_parallel(state) {
            for child in doc.child_states(state) {
                if !entry.states.some(|s| *s == child || doc.is_descendant(*s, child)) {
                    self.add_descendant_states_to_enter(doc, child, entry);
                }
            }
        }
    }

    fn add_ancestor_states_to_enter(
        &self,
        doc: &Document,
        state: DocId,
        ancestor: DocId,
        entry: &mut EntrySet,
    ) {
        for anc in doc.proper_ancestors(state, Some(ancestor)) {
            if doc.is_root(anc) {
                break;
            }
            entry.states.insert(anc);
            if doc.is_parallel(anc) {
                for child in doc.child_states(anc) {
                    if !entry.states.some(|s| *s == child || doc.is_descendant(*s, child)) {
                        self.add_descendant_states_to_enter(doc, child, entry);
                    }
                }
            }
        }
    }

    /// Exit sequence of the whole session: onexit content in reverse
    /// document order, invokes cancelled. Returns the done data of the
    /// top-level final state, if one was active.
    pub(super) fn exit_interpreter(&mut self) -> Result<Option<Value>, EngineError> {
        let doc = Arc::clone(&self.document);
        let mut states = self.ctx.configuration().in_document_order();
        states.reverse();

        let mut done = None;
        for s in states {
            if doc.is_final(s) && doc.node(s).parent == Some(Document::ROOT) {
                done = self.done_data(&doc, s)?;
            }
            self.exit_state(&doc, s)?;
        }
        self.notify_configuration();
        Ok(done)
    }

    /// Runs a block of executable content. The first failing action ends
    /// the block and is turned into an error event.
    fn execute_block(&mut self, doc: &Document, actions: &ActionList) -> Result<(), EngineError> {
        if actions.is_empty() {
            return Ok(());
        }
        let (effects, failure) = {
            let mut ctx = self
                .ctx
                .action_context(doc, &self.session, self.dispatcher.as_ref(), &self.cancel);
            let mut failure = None;
            for action in actions {
                if let Err(e) = action.execute(&mut ctx) {
                    failure = Some(e);
                    break;
                }
            }
            (ctx.into_effects(), failure)
        };

        for event in effects.raised {
            self.raise_internal(event)?;
        }
        for value in effects.cancelled_invokes {
            match self.ctx.invokes().find_by_value(&value).cloned() {
                Some(id) => self.cancel_invoke(&id)?,
                None => tracing::debug!(session = %self.session, "No active invoke '{}' to cancel", value),
            }
        }
        if let Some(error) = failure {
            self.raise_error(error)?;
        }
        Ok(())
    }

    pub(super) fn evaluate_value(
        &mut self,
        doc: &Document,
        expr: &dyn ValueExpr,
    ) -> Result<Value, BoxError> {
        let ctx = self
            .ctx
            .action_context(doc, &self.session, self.dispatcher.as_ref(), &self.cancel);
        expr.evaluate(&ctx)
    }

    fn raise_internal(&mut self, event: Event) -> Result<(), EngineError> {
        self.observer.on_raise(&self.session, &event);
        self.ctx.enqueue_internal(event)
    }

    /// Turns a recovered error into `error.execution`, `error.communication`
    /// or `error.platform` on the internal queue.
    pub(super) fn raise_error(&mut self, error: BoxError) -> Result<(), EngineError> {
        let (kind, send_id) = classify(error.as_ref(), &self.session);
        tracing::warn!(session = %self.session, "{}: {}", kind, error);
        report_error(self.observer.as_ref(), &self.session, kind, error.as_ref());

        let mut event = Event::platform(kind.event_name()).with_data(json!({
            "message": error.to_string(),
        }));
        if let Some(send_id) = send_id {
            event = event.with_send_id(send_id);
        }
        self.raise_internal(event)
    }

    pub(super) fn cancel_invoke(&mut self, id: &InvokeId) -> Result<(), EngineError> {
        self.ctx.remove_invoke(id)?;
        match self.controller.cancel(&self.session, id) {
            Ok(()) => {
                tracing::debug!(session = %self.session, "Cancelled invoke {}", id);
                Ok(())
            }
            Err(e) => self.raise_error(Box::new(CommunicationFault::new(self.session.clone(), None, e))),
        }
    }

    /// Starts the invokes of every state entered since the last stable
    /// point, in entry order.
    pub(super) fn start_invokes(&mut self) -> Result<(), EngineError> {
        let doc = Arc::clone(&self.document);
        for state in self.ctx.states_to_invoke().in_document_order() {
            for (node, invoke) in doc.invokes(state) {
                let instance = self.ctx.next_invoke_instance()?;
                let value = invoke
                    .id
                    .clone()
                    .unwrap_or_else(|| generated_invoke_value(doc.node(state).id(), node, instance));
                let id = InvokeId::new(value, node, instance);

                let content = match &invoke.content {
                    Some(expr) => match self.evaluate_value(&doc, expr.as_ref()) {
                        Ok(value) => value,
                        Err(e) => {
                            self.raise_error(e)?;
                            continue;
                        }
                    },
                    None => Value::Null,
                };

                self.ctx.add_invoke(id.clone())?;
                let request = InvokeRequest {
                    session: self.session.clone(),
                    id: id.clone(),
                    service: invoke.service.clone(),
                    src: invoke.src.clone(),
                    content,
                    autoforward: invoke.autoforward,
                };
                match self.controller.start(request) {
                    Ok(()) => tracing::debug!(session = %self.session, "Started invoke {}", id),
                    Err(e) => {
                        self.ctx.remove_invoke(&id)?;
                        self.raise_error(Box::new(CommunicationFault::new(
                            self.session.clone(),
                            None,
                            e,
                        )))?;
                    }
                }
            }
        }
        self.ctx.clear_states_to_invoke()
    }

    /// Finalize and autoforward for the current external event.
    pub(super) fn process_external(&mut self) -> Result<(), EngineError> {
        let doc = Arc::clone(&self.document);
        let Some(event) = self.ctx.current_event().cloned() else {
            return Ok(());
        };

        if let Some(source) = &event.invoke_id {
            if self.ctx.invokes().contains(source) {
                if let Some(invoke) = doc.invoke(source.node) {
                    self.execute_block(&doc, &invoke.finalize)?;
                }
                if event.name == format!("done.invoke.{}", source.value) {
                    self.ctx.remove_invoke(source)?;
                    tracing::debug!(session = %self.session, "Invoke {} finished", source);
                }
            }
        }

        let forward_to: Vec<InvokeId> = self
            .ctx
            .invokes()
            .iter()
            .filter(|id| doc.invoke(id.node).map(|i| i.autoforward).unwrap_or(false))
            .cloned()
            .collect();
        for id in forward_to {
            if let Err(e) = self.controller.forward(&self.session, &id, &event) {
                self.raise_error(Box::new(CommunicationFault::new(self.session.clone(), None, e)))?;
            }
        }
        Ok(())
    }

    fn notify_configuration(&self) {
        let states = self.configuration();
        self.observer.on_configuration(&self.session, &states);
    }
}

/// Least common compound ancestor of `states`; the root if there is none.
fn find_lcca(doc: &Document, states: &[DocId]) -> DocId {
    let Some((head, tail)) = states.split_first() else {
        return Document::ROOT;
    };
    doc.proper_ancestors(*head, None)
        .into_iter()
        .find(|anc| {
            (doc.is_compound(*anc) || doc.is_root(*anc))
                && tail.iter().all(|s| doc.is_descendant(*s, *anc))
        })
        .unwrap_or(Document::ROOT)
}
