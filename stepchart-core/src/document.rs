//! Statechart documents.
//!
//! A document is an immutable tree of typed nodes. Every node has a dense
//! document id assigned in document (pre-)order, which is also the entry
//! order of states. Persisted state refers to nodes only by document id.
//!
//! Documents are built from [`StateSpec`] trees with [`DocumentBuilder`]:
//!
//! ```
//! use stepchart_core::document::{DocumentBuilder, StateSpec, TransitionSpec};
//!
//! let doc = DocumentBuilder::new("traffic")
//!     .initial("red")
//!     .state(StateSpec::state("red").transition(TransitionSpec::on("next").target("green")))
//!     .state(StateSpec::state("green").transition(TransitionSpec::on("next").target("red")))
//!     .build()
//!     .unwrap();
//! assert_eq!(doc.node(doc.lookup("green").unwrap()).id(), "green");
//! ```

use crate::action::{Action, Condition, ValueExpr};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use stepchart_storage::{KeyPath, KeySegment, StorageError};

/// Dense document id of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub u32);

impl DocId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl KeySegment for DocId {
    fn append_to(&self, path: &mut KeyPath) -> Result<(), StorageError> {
        path.push_index(self.0 as u64)
    }
}

/// Ordered executable content.
pub type ActionList = Vec<Arc<dyn Action>>;

/// When `<data>` elements get their initial values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    /// All data is initialized when the session starts.
    #[default]
    Early,
    /// Data of a state is initialized when the state is first entered.
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    #[default]
    External,
    Internal,
}

/// A `<transition>`.
#[derive(Clone)]
pub struct Transition {
    /// Event descriptors; empty for an eventless transition.
    pub events: Vec<String>,
    pub cond: Option<Arc<dyn Condition>>,
    /// Target states; empty for a targetless transition.
    pub targets: Vec<DocId>,
    pub kind: TransitionKind,
    pub actions: ActionList,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }
}

/// An `<invoke>`.
#[derive(Clone)]
pub struct Invoke {
    /// Explicit invoke id; generated at start time when absent.
    pub id: Option<String>,
    /// Service type handed to the invoke controller.
    pub service: String,
    pub src: Option<String>,
    pub content: Option<Arc<dyn ValueExpr>>,
    pub autoforward: bool,
    pub finalize: ActionList,
}

/// Initial value of a `<data>` element.
#[derive(Clone)]
pub enum DataSource {
    Literal(Value),
    Expr(Arc<dyn ValueExpr>),
    Unset,
}

/// A `<data>` element.
#[derive(Clone)]
pub struct Data {
    pub id: String,
    pub source: DataSource,
}

/// Kind-specific payload of a node.
#[derive(Clone)]
pub enum NodeKind {
    Scxml { name: String, binding: Binding },
    State,
    Parallel,
    Final { done_data: Option<Arc<dyn ValueExpr>> },
    History { deep: bool },
    Initial,
    Transition(Transition),
    Invoke(Invoke),
    OnEntry(ActionList),
    OnExit(ActionList),
    DataModel,
    Data(Data),
}

impl NodeKind {
    fn tag(&self) -> u8 {
        match self {
            NodeKind::Scxml { .. } => 1,
            NodeKind::State => 2,
            NodeKind::Parallel => 3,
            NodeKind::Final { .. } => 4,
            NodeKind::History { .. } => 5,
            NodeKind::Initial => 6,
            NodeKind::Transition(_) => 7,
            NodeKind::Invoke(_) => 8,
            NodeKind::OnEntry(_) => 9,
            NodeKind::OnExit(_) => 10,
            NodeKind::DataModel => 11,
            NodeKind::Data(_) => 12,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            NodeKind::Scxml { .. } => "scxml",
            NodeKind::State => "state",
            NodeKind::Parallel => "parallel",
            NodeKind::Final { .. } => "final",
            NodeKind::History { .. } => "history",
            NodeKind::Initial => "initial",
            NodeKind::Transition(_) => "transition",
            NodeKind::Invoke(_) => "invoke",
            NodeKind::OnEntry(_) => "onentry",
            NodeKind::OnExit(_) => "onexit",
            NodeKind::DataModel => "datamodel",
            NodeKind::Data(_) => "data",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Transition(t) => f
                .debug_struct("Transition")
                .field("events", &t.events)
                .field("targets", &t.targets)
                .field("kind", &t.kind)
                .field("cond", &t.cond.is_some())
                .field("actions", &t.actions.len())
                .finish(),
            NodeKind::History { deep } => f.debug_struct("History").field("deep", deep).finish(),
            NodeKind::Invoke(inv) => f
                .debug_struct("Invoke")
                .field("id", &inv.id)
                .field("service", &inv.service)
                .field("autoforward", &inv.autoforward)
                .finish(),
            NodeKind::Data(d) => f.debug_struct("Data").field("id", &d.id).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// A document node.
#[derive(Debug, Clone)]
pub struct Node {
    pub doc_id: DocId,
    id: Option<String>,
    pub parent: Option<DocId>,
    pub children: Vec<DocId>,
    pub kind: NodeKind,
}

impl Node {
    /// The node's `id` attribute. States always have one (generated if the
    /// chart did not give one); other nodes may return an empty string.
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

/// A validated, immutable statechart document.
#[derive(Debug)]
pub struct Document {
    name: String,
    binding: Binding,
    nodes: Vec<Node>,
    ids: HashMap<String, DocId>,
    checksum: u32,
}

impl Document {
    /// Document id of the `<scxml>` root.
    pub const ROOT: DocId = DocId(0);

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// crc32c over the document structure. Stored in session logs and
    /// checked when a session is resumed.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the node with the given id.
    ///
    /// Ids handed out by this document are always valid; ids read back from
    /// storage must be checked with [`Document::get`] first.
    pub fn node(&self, id: DocId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: DocId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Resolves a state id attribute.
    pub fn lookup(&self, id: &str) -> Option<DocId> {
        self.ids.get(id).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn is_state(&self, id: DocId) -> bool {
        matches!(
            self.node(id).kind,
            NodeKind::State | NodeKind::Parallel | NodeKind::Final { .. }
        )
    }

    pub fn is_atomic(&self, id: DocId) -> bool {
        match self.node(id).kind {
            NodeKind::State => self.child_states(id).next().is_none(),
            NodeKind::Final { .. } => true,
            _ => false,
        }
    }

    /// A `<state>` with child states, or the root.
    pub fn is_compound(&self, id: DocId) -> bool {
        matches!(self.node(id).kind, NodeKind::State | NodeKind::Scxml { .. })
            && self.child_states(id).next().is_some()
    }

    pub fn is_parallel(&self, id: DocId) -> bool {
        matches!(self.node(id).kind, NodeKind::Parallel)
    }

    pub fn is_final(&self, id: DocId) -> bool {
        matches!(self.node(id).kind, NodeKind::Final { .. })
    }

    pub fn is_history(&self, id: DocId) -> bool {
        matches!(self.node(id).kind, NodeKind::History { .. })
    }

    pub fn is_deep_history(&self, id: DocId) -> bool {
        matches!(self.node(id).kind, NodeKind::History { deep: true })
    }

    pub fn is_root(&self, id: DocId) -> bool {
        id == Self::ROOT
    }

    /// Child `<state>`, `<parallel>` and `<final>` nodes, in document order.
    pub fn child_states(&self, id: DocId) -> impl Iterator<Item = DocId> + '_ {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(move |c| self.is_state(*c))
    }

    /// Child `<history>` nodes.
    pub fn history_children(&self, id: DocId) -> impl Iterator<Item = DocId> + '_ {
        self.node(id)
            .children
            .iter()
            .copied()
            .filter(move |c| self.is_history(*c))
    }

    /// Outgoing transitions of a state, in document order.
    pub fn transitions(&self, id: DocId) -> impl Iterator<Item = (DocId, &Transition)> + '_ {
        self.node(id).children.iter().filter_map(move |c| match &self.node(*c).kind {
            NodeKind::Transition(t) => Some((*c, t)),
            _ => None,
        })
    }

    pub fn transition(&self, id: DocId) -> Option<&Transition> {
        match &self.get(id)?.kind {
            NodeKind::Transition(t) => Some(t),
            _ => None,
        }
    }

    /// The state a transition leaves from. Transitions of `<initial>` and
    /// `<history>` pseudo-states belong to the enclosing state.
    pub fn transition_source(&self, id: DocId) -> DocId {
        let parent = self.node(id).parent.unwrap_or(Self::ROOT);
        match self.node(parent).kind {
            NodeKind::Initial | NodeKind::History { .. } => {
                self.node(parent).parent.unwrap_or(Self::ROOT)
            }
            _ => parent,
        }
    }

    /// The transition of a state's `<initial>` child, if it has one.
    pub fn initial_transition(&self, id: DocId) -> Option<DocId> {
        let initial = self
            .node(id)
            .children
            .iter()
            .copied()
            .find(|c| matches!(self.node(*c).kind, NodeKind::Initial))?;
        self.first_transition(initial)
    }

    /// The default transition of a `<history>` node.
    pub fn history_default(&self, id: DocId) -> Option<DocId> {
        self.first_transition(id)
    }

    fn first_transition(&self, id: DocId) -> Option<DocId> {
        self.node(id)
            .children
            .iter()
            .copied()
            .find(|c| matches!(self.node(*c).kind, NodeKind::Transition(_)))
    }

    pub fn on_entry(&self, id: DocId) -> impl Iterator<Item = &ActionList> + '_ {
        self.node(id).children.iter().filter_map(move |c| match &self.node(*c).kind {
            NodeKind::OnEntry(actions) => Some(actions),
            _ => None,
        })
    }

    pub fn on_exit(&self, id: DocId) -> impl Iterator<Item = &ActionList> + '_ {
        self.node(id).children.iter().filter_map(move |c| match &self.node(*c).kind {
            NodeKind::OnExit(actions) => Some(actions),
            _ => None,
        })
    }

    /// `<invoke>` children of a state.
    pub fn invokes(&self, id: DocId) -> impl Iterator<Item = (DocId, &Invoke)> + '_ {
        self.node(id).children.iter().filter_map(move |c| match &self.node(*c).kind {
            NodeKind::Invoke(inv) => Some((*c, inv)),
            _ => None,
        })
    }

    pub fn invoke(&self, id: DocId) -> Option<&Invoke> {
        match &self.get(id)?.kind {
            NodeKind::Invoke(inv) => Some(inv),
            _ => None,
        }
    }

    /// `<data>` elements declared directly in a state's `<datamodel>`.
    pub fn data(&self, id: DocId) -> impl Iterator<Item = &Data> + '_ {
        self.node(id)
            .children
            .iter()
            .filter(move |c| matches!(self.node(**c).kind, NodeKind::DataModel))
            .flat_map(move |dm| self.node(*dm).children.iter())
            .filter_map(move |c| match &self.node(*c).kind {
                NodeKind::Data(d) => Some(d),
                _ => None,
            })
    }

    /// Ancestors of `id` from its parent upwards, stopping before `stop`
    /// (or after the root when `stop` is `None`).
    pub fn proper_ancestors(&self, id: DocId, stop: Option<DocId>) -> Vec<DocId> {
        let mut ancestors = Vec::new();
        let mut current = self.node(id).parent;
        while let Some(p) = current {
            if Some(p) == stop {
                break;
            }
            ancestors.push(p);
            current = self.node(p).parent;
        }
        ancestors
    }

    /// Returns whether `id` is a proper descendant of `ancestor`.
    pub fn is_descendant(&self, id: DocId, ancestor: DocId) -> bool {
        let mut current = self.node(id).parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.node(p).parent;
        }
        false
    }

    fn compute_checksum(nodes: &[Node]) -> u32 {
        let mut crc = 0u32;
        for node in nodes {
            let mut buf = Vec::new();
            buf.extend_from_slice(&node.doc_id.0.to_le_bytes());
            buf.extend_from_slice(&node.parent.map(|p| p.0 as i64).unwrap_or(-1).to_le_bytes());
            buf.push(node.kind.tag());
            buf.extend_from_slice(node.id().as_bytes());
            buf.push(0);
            match &node.kind {
                NodeKind::Transition(t) => {
                    for e in &t.events {
                        buf.extend_from_slice(e.as_bytes());
                        buf.push(0);
                    }
                    for target in &t.targets {
                        buf.extend_from_slice(&target.0.to_le_bytes());
                    }
                    buf.push(matches!(t.kind, TransitionKind::Internal) as u8);
                }
                NodeKind::History { deep } => buf.push(*deep as u8),
                NodeKind::Invoke(inv) => {
                    buf.extend_from_slice(inv.service.as_bytes());
                    buf.push(inv.autoforward as u8);
                }
                NodeKind::Scxml { name, binding } => {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(matches!(binding, Binding::Late) as u8);
                }
                NodeKind::Data(d) => buf.extend_from_slice(d.id.as_bytes()),
                _ => {}
            }
            crc = crc32c::crc32c_append(crc, &buf);
        }
        crc
    }
}

enum SpecKind {
    State,
    Parallel,
    Final,
    History { deep: bool },
}

/// Declarative description of a state and its content.
pub struct StateSpec {
    kind: SpecKind,
    id: Option<String>,
    initial: Option<String>,
    data: Vec<DataSpec>,
    on_entry: Vec<ActionList>,
    on_exit: Vec<ActionList>,
    transitions: Vec<TransitionSpec>,
    invokes: Vec<InvokeSpec>,
    children: Vec<StateSpec>,
    done_data: Option<Arc<dyn ValueExpr>>,
}

impl StateSpec {
    fn with_kind(kind: SpecKind, id: Option<String>) -> Self {
        Self {
            kind,
            id,
            initial: None,
            data: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            transitions: Vec::new(),
            invokes: Vec::new(),
            children: Vec::new(),
            done_data: None,
        }
    }

    pub fn state(id: impl Into<String>) -> Self {
        Self::with_kind(SpecKind::State, Some(id.into()))
    }

    /// A `<state>` without an id; one is generated.
    pub fn anonymous() -> Self {
        Self::with_kind(SpecKind::State, None)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::with_kind(SpecKind::Parallel, Some(id.into()))
    }

    pub fn final_state(id: impl Into<String>) -> Self {
        Self::with_kind(SpecKind::Final, Some(id.into()))
    }

    /// A history pseudo-state. Its default transition is set with
    /// [`StateSpec::transition`].
    pub fn history(id: impl Into<String>, deep: bool) -> Self {
        Self::with_kind(SpecKind::History { deep }, Some(id.into()))
    }

    /// Space-separated initial state ids.
    pub fn initial(mut self, ids: impl Into<String>) -> Self {
        self.initial = Some(ids.into());
        self
    }

    pub fn child(mut self, child: StateSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn transition(mut self, transition: TransitionSpec) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Adds an `<onentry>` block.
    pub fn on_entry(mut self, actions: ActionList) -> Self {
        self.on_entry.push(actions);
        self
    }

    /// Adds an `<onexit>` block.
    pub fn on_exit(mut self, actions: ActionList) -> Self {
        self.on_exit.push(actions);
        self
    }

    pub fn invoke(mut self, invoke: InvokeSpec) -> Self {
        self.invokes.push(invoke);
        self
    }

    pub fn data(mut self, data: DataSpec) -> Self {
        self.data.push(data);
        self
    }

    /// `<donedata>` of a final state.
    pub fn done_data(mut self, expr: Arc<dyn ValueExpr>) -> Self {
        self.done_data = Some(expr);
        self
    }
}

/// Declarative description of a transition.
#[derive(Default)]
pub struct TransitionSpec {
    events: Vec<String>,
    cond: Option<Arc<dyn Condition>>,
    target: Option<String>,
    kind: TransitionKind,
    actions: ActionList,
}

impl TransitionSpec {
    /// A transition triggered by space-separated event descriptors.
    pub fn on(events: impl AsRef<str>) -> Self {
        Self {
            events: events
                .as_ref()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            ..Self::default()
        }
    }

    pub fn eventless() -> Self {
        Self::default()
    }

    /// Space-separated target state ids.
    pub fn target(mut self, ids: impl Into<String>) -> Self {
        self.target = Some(ids.into());
        self
    }

    pub fn cond(mut self, cond: Arc<dyn Condition>) -> Self {
        self.cond = Some(cond);
        self
    }

    pub fn internal(mut self) -> Self {
        self.kind = TransitionKind::Internal;
        self
    }

    pub fn action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.push(action);
        self
    }

    pub fn actions(mut self, actions: ActionList) -> Self {
        self.actions.extend(actions);
        self
    }
}

/// Declarative description of an invoke.
pub struct InvokeSpec {
    invoke: Invoke,
}

impl InvokeSpec {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            invoke: Invoke {
                id: None,
                service: service.into(),
                src: None,
                content: None,
                autoforward: false,
                finalize: Vec::new(),
            },
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.invoke.id = Some(id.into());
        self
    }

    pub fn src(mut self, src: impl Into<String>) -> Self {
        self.invoke.src = Some(src.into());
        self
    }

    pub fn content(mut self, content: Arc<dyn ValueExpr>) -> Self {
        self.invoke.content = Some(content);
        self
    }

    pub fn autoforward(mut self, autoforward: bool) -> Self {
        self.invoke.autoforward = autoforward;
        self
    }

    pub fn finalize(mut self, actions: ActionList) -> Self {
        self.invoke.finalize = actions;
        self
    }
}

/// Declarative description of a `<data>` element.
pub struct DataSpec {
    data: Data,
}

impl DataSpec {
    pub fn value(id: impl Into<String>, value: Value) -> Self {
        Self {
            data: Data {
                id: id.into(),
                source: DataSource::Literal(value),
            },
        }
    }

    pub fn expr(id: impl Into<String>, expr: Arc<dyn ValueExpr>) -> Self {
        Self {
            data: Data {
                id: id.into(),
                source: DataSource::Expr(expr),
            },
        }
    }

    pub fn unset(id: impl Into<String>) -> Self {
        Self {
            data: Data {
                id: id.into(),
                source: DataSource::Unset,
            },
        }
    }
}

/// Builds and validates a [`Document`].
pub struct DocumentBuilder {
    name: String,
    binding: Binding,
    initial: Option<String>,
    data: Vec<DataSpec>,
    states: Vec<StateSpec>,
}

enum PendingTargets {
    Names(String),
    FirstChildOf(DocId),
}

#[derive(Default)]
struct Emitter {
    nodes: Vec<Node>,
    ids: HashMap<String, DocId>,
    pending: Vec<(DocId, PendingTargets)>,
}

impl DocumentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binding: Binding::default(),
            initial: None,
            data: Vec::new(),
            states: Vec::new(),
        }
    }

    pub fn binding(mut self, binding: Binding) -> Self {
        self.binding = binding;
        self
    }

    /// Space-separated initial state ids. Defaults to the first state.
    pub fn initial(mut self, ids: impl Into<String>) -> Self {
        self.initial = Some(ids.into());
        self
    }

    /// Adds a top-level `<data>` element.
    pub fn data(mut self, data: DataSpec) -> Self {
        self.data.push(data);
        self
    }

    /// Adds a top-level state.
    pub fn state(mut self, state: StateSpec) -> Self {
        self.states.push(state);
        self
    }

    /// Assigns document ids, resolves targets and validates the tree.
    pub fn build(self) -> Result<Document, EngineError> {
        if self.states.is_empty() {
            return Err(EngineError::invalid_document("document has no states"));
        }

        let mut emitter = Emitter::default();
        let root = emitter.push(
            None,
            None,
            NodeKind::Scxml {
                name: self.name.clone(),
                binding: self.binding,
            },
        )?;
        emitter.emit_data(root, self.data)?;

        let initial = emitter.push(Some(root), None, NodeKind::Initial)?;
        let targets = match self.initial {
            Some(ids) => PendingTargets::Names(ids),
            None => PendingTargets::FirstChildOf(root),
        };
        emitter.emit_transition(
            initial,
            TransitionSpec::eventless().internal(),
            Some(targets),
        )?;

        for state in self.states {
            if matches!(state.kind, SpecKind::History { .. }) {
                return Err(EngineError::invalid_document(
                    "history states must be inside a state",
                ));
            }
            emitter.emit_state(root, state)?;
        }

        emitter.resolve()?;

        let checksum = Document::compute_checksum(&emitter.nodes);
        let document = Document {
            name: self.name,
            binding: self.binding,
            nodes: emitter.nodes,
            ids: emitter.ids,
            checksum,
        };
        validate(&document)?;

        tracing::debug!(
            "Built document '{}': {} nodes, checksum {:08x}",
            document.name,
            document.len(),
            document.checksum
        );
        Ok(document)
    }
}

impl Emitter {
    fn push(
        &mut self,
        parent: Option<DocId>,
        id: Option<String>,
        kind: NodeKind,
    ) -> Result<DocId, EngineError> {
        let doc_id = DocId(self.nodes.len() as u32);
        if let Some(id) = &id {
            if self.ids.insert(id.clone(), doc_id).is_some() {
                return Err(EngineError::invalid_document(format!(
                    "duplicate id '{}'",
                    id
                )));
            }
        }
        self.nodes.push(Node {
            doc_id,
            id,
            parent,
            children: Vec::new(),
            kind,
        });
        if let Some(p) = parent {
            self.nodes[p.index()].children.push(doc_id);
        }
        Ok(doc_id)
    }

    fn emit_data(&mut self, parent: DocId, data: Vec<DataSpec>) -> Result<(), EngineError> {
        if data.is_empty() {
            return Ok(());
        }
        let model = self.push(Some(parent), None, NodeKind::DataModel)?;
        for spec in data {
            self.push(Some(model), None, NodeKind::Data(spec.data))?;
        }
        Ok(())
    }

    fn emit_transition(
        &mut self,
        parent: DocId,
        spec: TransitionSpec,
        targets: Option<PendingTargets>,
    ) -> Result<DocId, EngineError> {
        let id = self.push(
            Some(parent),
            None,
            NodeKind::Transition(Transition {
                events: spec.events,
                cond: spec.cond,
                targets: Vec::new(),
                kind: spec.kind,
                actions: spec.actions,
            }),
        )?;
        if let Some(targets) = targets.or(spec.target.map(PendingTargets::Names)) {
            self.pending.push((id, targets));
        }
        Ok(id)
    }

    fn emit_state(&mut self, parent: DocId, spec: StateSpec) -> Result<DocId, EngineError> {
        let kind = match spec.kind {
            SpecKind::State => NodeKind::State,
            SpecKind::Parallel => NodeKind::Parallel,
            SpecKind::Final => NodeKind::Final {
                done_data: spec.done_data,
            },
            SpecKind::History { deep } => NodeKind::History { deep },
        };
        let is_history = matches!(kind, NodeKind::History { .. });
        let name = kind.name();

        let id = self.push(Some(parent), spec.id.clone(), kind)?;
        if spec.id.is_none() {
            let generated = format!("_s{}", id.0);
            if self.ids.insert(generated.clone(), id).is_some() {
                return Err(EngineError::invalid_document(format!(
                    "duplicate id '{}'",
                    generated
                )));
            }
            self.nodes[id.index()].id = Some(generated);
        }

        if is_history {
            if spec.transitions.len() != 1 || !spec.children.is_empty() {
                return Err(EngineError::invalid_document(format!(
                    "history '{}' needs exactly one default transition",
                    self.nodes[id.index()].id()
                )));
            }
            for t in spec.transitions {
                self.emit_transition(id, t, None)?;
            }
            return Ok(id);
        }

        if let Some(initial) = spec.initial {
            if name != "state" {
                return Err(EngineError::invalid_document(format!(
                    "{} '{}' cannot have an initial attribute",
                    name,
                    self.nodes[id.index()].id()
                )));
            }
            let node = self.push(Some(id), None, NodeKind::Initial)?;
            self.emit_transition(
                node,
                TransitionSpec::eventless().internal(),
                Some(PendingTargets::Names(initial)),
            )?;
        }

        self.emit_data(id, spec.data)?;
        for actions in spec.on_entry {
            self.push(Some(id), None, NodeKind::OnEntry(actions))?;
        }
        for actions in spec.on_exit {
            self.push(Some(id), None, NodeKind::OnExit(actions))?;
        }
        if name == "final" && (!spec.transitions.is_empty() || !spec.children.is_empty()) {
            return Err(EngineError::invalid_document(format!(
                "final state '{}' cannot have transitions or children",
                self.nodes[id.index()].id()
            )));
        }
        for t in spec.transitions {
            self.emit_transition(id, t, None)?;
        }
        for inv in spec.invokes {
            self.push(Some(id), None, NodeKind::Invoke(inv.invoke))?;
        }
        for child in spec.children {
            self.emit_state(id, child)?;
        }
        Ok(id)
    }

    fn resolve(&mut self) -> Result<(), EngineError> {
        for (transition, pending) in std::mem::take(&mut self.pending) {
            let targets = match pending {
                PendingTargets::Names(names) => names
                    .split_whitespace()
                    .map(|name| {
                        self.ids.get(name).copied().ok_or_else(|| {
                            EngineError::invalid_document(format!("unknown target '{}'", name))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                PendingTargets::FirstChildOf(parent) => {
                    let first = self.nodes[parent.index()].children.iter().copied().find(|c| {
                        matches!(
                            self.nodes[c.index()].kind,
                            NodeKind::State | NodeKind::Parallel | NodeKind::Final { .. }
                        )
                    });
                    vec![first.ok_or_else(|| EngineError::invalid_document("no initial state"))?]
                }
            };
            if let NodeKind::Transition(t) = &mut self.nodes[transition.index()].kind {
                t.targets = targets;
            }
        }
        Ok(())
    }
}

fn validate(doc: &Document) -> Result<(), EngineError> {
    for node in doc.nodes() {
        match &node.kind {
            NodeKind::Transition(t) => {
                for target in &t.targets {
                    let kind = &doc.node(*target).kind;
                    if !doc.is_state(*target) && !matches!(kind, NodeKind::History { .. }) {
                        return Err(EngineError::invalid_document(format!(
                            "transition target '{}' is not a state",
                            doc.node(*target).id()
                        )));
                    }
                }

                let parent = node.parent.unwrap_or(Document::ROOT);
                let owner = doc.transition_source(node.doc_id);
                match doc.node(parent).kind {
                    NodeKind::Initial | NodeKind::History { .. } => {
                        if t.targets.is_empty() {
                            return Err(EngineError::invalid_document(format!(
                                "default transition of '{}' has no target",
                                doc.node(owner).id()
                            )));
                        }
                        if let Some(bad) = t.targets.iter().find(|s| !doc.is_descendant(**s, owner)) {
                            return Err(EngineError::invalid_document(format!(
                                "default target '{}' is not inside '{}'",
                                doc.node(*bad).id(),
                                doc.node(owner).id()
                            )));
                        }
                    }
                    _ => {}
                }
            }
            NodeKind::Parallel if doc.child_states(node.doc_id).next().is_none() => {
                return Err(EngineError::invalid_document(format!(
                    "parallel '{}' has no regions",
                    node.id()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        DocumentBuilder::new("sample")
            .initial("p")
            .state(
                StateSpec::parallel("p")
                    .child(
                        StateSpec::state("a")
                            .initial("a2")
                            .child(StateSpec::state("a1"))
                            .child(StateSpec::state("a2"))
                            .child(StateSpec::history("ah", false).transition(
                                TransitionSpec::eventless().target("a1"),
                            )),
                    )
                    .child(StateSpec::state("b").child(StateSpec::final_state("bf"))),
            )
            .state(StateSpec::final_state("done"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_ids_follow_document_order() {
        let doc = sample();
        let order: Vec<&str> = doc
            .nodes()
            .filter(|n| doc.is_state(n.doc_id))
            .map(|n| n.id())
            .collect();
        assert_eq!(order, vec!["p", "a", "a1", "a2", "b", "bf", "done"]);

        let ids: Vec<u32> = doc.nodes().map(|n| n.doc_id.0).collect();
        assert_eq!(ids, (0..doc.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_state_classification() {
        let doc = sample();
        let p = doc.lookup("p").unwrap();
        let a = doc.lookup("a").unwrap();
        let a1 = doc.lookup("a1").unwrap();
        let bf = doc.lookup("bf").unwrap();

        assert!(doc.is_parallel(p));
        assert!(doc.is_compound(a));
        assert!(doc.is_atomic(a1));
        assert!(doc.is_final(bf) && doc.is_atomic(bf));
        assert!(doc.is_compound(Document::ROOT));
        assert!(doc.is_descendant(a1, p));
        assert!(!doc.is_descendant(p, a1));
        assert_eq!(doc.proper_ancestors(a1, Some(p)), vec![a]);
        assert_eq!(doc.child_states(a).count(), 2);
        assert_eq!(doc.history_children(a).count(), 1);
    }

    #[test]
    fn test_initial_transitions() {
        let doc = sample();
        let root_initial = doc.initial_transition(Document::ROOT).unwrap();
        let t = doc.transition(root_initial).unwrap();
        assert_eq!(t.targets, vec![doc.lookup("p").unwrap()]);
        assert_eq!(doc.transition_source(root_initial), Document::ROOT);

        let a = doc.lookup("a").unwrap();
        let a_initial = doc.initial_transition(a).unwrap();
        assert_eq!(doc.transition(a_initial).unwrap().targets, vec![doc.lookup("a2").unwrap()]);
        assert_eq!(doc.transition_source(a_initial), a);

        // No initial attribute: entered through the first child at run time
        assert!(doc.initial_transition(doc.lookup("b").unwrap()).is_none());
    }

    #[test]
    fn test_root_defaults_to_first_state() {
        let doc = DocumentBuilder::new("d")
            .state(StateSpec::state("x"))
            .state(StateSpec::state("y"))
            .build()
            .unwrap();
        let t = doc.initial_transition(Document::ROOT).unwrap();
        assert_eq!(doc.transition(t).unwrap().targets, vec![doc.lookup("x").unwrap()]);
    }

    #[test]
    fn test_validation_errors() {
        let unknown = DocumentBuilder::new("d")
            .state(StateSpec::state("x").transition(TransitionSpec::on("e").target("nowhere")))
            .build();
        assert!(matches!(unknown, Err(EngineError::InvalidDocument { .. })));

        let duplicate = DocumentBuilder::new("d")
            .state(StateSpec::state("x"))
            .state(StateSpec::state("x"))
            .build();
        assert!(duplicate.is_err());

        let history = DocumentBuilder::new("d")
            .state(StateSpec::state("x").child(StateSpec::history("h", true)))
            .build();
        assert!(history.is_err());

        let outside = DocumentBuilder::new("d")
            .state(StateSpec::state("x").initial("y").child(StateSpec::state("x1")))
            .state(StateSpec::state("y"))
            .build();
        assert!(outside.is_err());

        assert!(DocumentBuilder::new("empty").build().is_err());
    }

    #[test]
    fn test_anonymous_states_get_ids() {
        let doc = DocumentBuilder::new("d")
            .state(StateSpec::anonymous())
            .build()
            .unwrap();
        let state = doc.nodes().find(|n| doc.is_state(n.doc_id)).unwrap();
        assert!(state.id().starts_with("_s"));
        assert_eq!(doc.lookup(state.id()), Some(state.doc_id));
    }

    #[test]
    fn test_checksum_tracks_structure() {
        let a = sample();
        let b = sample();
        assert_eq!(a.checksum(), b.checksum());

        let changed = DocumentBuilder::new("sample")
            .state(StateSpec::state("p"))
            .build()
            .unwrap();
        assert_ne!(a.checksum(), changed.checksum());
    }
}
