//! JSON chart definitions.
//!
//! Charts use a JSON DSL that maps onto the document builder:
//!
//! ```json
//! {
//!   "name": "order",
//!   "datamodel": [{"id": "paid", "value": false}],
//!   "states": [
//!     {"id": "created", "transitions": [
//!       {"event": "pay", "target": "paid", "actions": [{"assign": {"location": "paid", "expr": {"literal": true}}}]}
//!     ]},
//!     {"id": "paid", "type": "final", "donedata": {"location": "paid"}}
//!   ]
//! }
//! ```
//!
//! Conditions and values are structured JSON, not an expression language.

use crate::error::ChartError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use stepchart_core::action::{self, Assign, Cancel, InState, Literal, Location, Raise, SendEvent, Truthy};
use stepchart_core::document::{
    ActionList, Binding, DataSpec, InvokeSpec, StateSpec, TransitionKind, TransitionSpec,
};
use stepchart_core::{ActionContext, BoxError, Condition, Document, DocumentBuilder, ValueExpr};

/// A chart as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDef {
    pub name: String,

    #[serde(default)]
    pub binding: Binding,

    /// Space-separated initial state ids (defaults to the first state).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDef>,

    pub states: Vec<StateDef>,

    /// Free-form metadata, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    #[default]
    State,
    Parallel,
    Final,
    History,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDef {
    /// Generated when omitted (plain states only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: StateType,

    /// Deep history; only meaningful for history states.
    #[serde(default)]
    pub deep: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onentry: Vec<ActionDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub onexit: Vec<ActionDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invoke: Vec<InvokeDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donedata: Option<ExprDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    /// Space-separated event descriptors; eventless when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: TransitionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<CondDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeDef {
    #[serde(rename = "type")]
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ExprDef>,

    #[serde(default)]
    pub autoforward: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<ActionDef>,
}

/// A `<data>` declaration. `value` and `expr` are exclusive; neither leaves
/// the location unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDef {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<ExprDef>,
}

/// A value expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExprDef {
    Literal(Value),
    Location(String),
    /// An object whose fields are expressions.
    Object(BTreeMap<String, ExprDef>),
}

/// A transition condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CondDef {
    In(String),
    Truthy(String),
    Equals { location: String, value: Value },
    Not(Box<CondDef>),
    All(Vec<CondDef>),
}

/// A piece of executable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionDef {
    Raise {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ExprDef>,
    },
    Log {
        #[serde(default)]
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<ExprDef>,
    },
    Assign {
        location: String,
        expr: ExprDef,
    },
    Send {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ExprDef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invokeid: Option<String>,
    },
}

impl ChartDef {
    /// Parses a chart from JSON.
    pub fn from_json(json: &str) -> Result<Self, ChartError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a chart from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ChartError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Builds and validates the document.
    pub fn to_document(&self) -> Result<Document, ChartError> {
        if self.states.is_empty() {
            return Err(ChartError::Invalid("chart has no states".to_string()));
        }

        let mut builder = DocumentBuilder::new(self.name.clone()).binding(self.binding);
        if let Some(initial) = &self.initial {
            builder = builder.initial(initial.clone());
        }
        for data in &self.datamodel {
            builder = builder.data(data.to_spec()?);
        }
        for state in &self.states {
            builder = builder.state(state.to_spec()?);
        }
        builder.build().map_err(ChartError::Document)
    }
}

/// Loads a chart file into a document.
pub fn load_chart(path: impl AsRef<Path>) -> Result<Document, ChartError> {
    ChartDef::from_file(path)?.to_document()
}

impl StateDef {
    fn to_spec(&self) -> Result<StateSpec, ChartError> {
        let mut spec = match (self.kind, &self.id) {
            (StateType::State, Some(id)) => StateSpec::state(id.clone()),
            (StateType::State, None) => StateSpec::anonymous(),
            (StateType::Parallel, Some(id)) => StateSpec::parallel(id.clone()),
            (StateType::Final, Some(id)) => StateSpec::final_state(id.clone()),
            (StateType::History, Some(id)) => StateSpec::history(id.clone(), self.deep),
            (kind, None) => {
                return Err(ChartError::Invalid(format!("{:?} state without an id", kind)));
            }
        };

        if self.kind != StateType::Final && self.donedata.is_some() {
            return Err(ChartError::Invalid(format!(
                "donedata on non-final state '{}'",
                self.id.as_deref().unwrap_or_default()
            )));
        }
        if self.kind == StateType::History && !self.states.is_empty() {
            return Err(ChartError::Invalid(format!(
                "history state '{}' has children",
                self.id.as_deref().unwrap_or_default()
            )));
        }

        if let Some(initial) = &self.initial {
            spec = spec.initial(initial.clone());
        }
        for data in &self.datamodel {
            spec = spec.data(data.to_spec()?);
        }
        if !self.onentry.is_empty() {
            spec = spec.on_entry(actions(&self.onentry));
        }
        if !self.onexit.is_empty() {
            spec = spec.on_exit(actions(&self.onexit));
        }
        for transition in &self.transitions {
            spec = spec.transition(transition.to_spec());
        }
        for invoke in &self.invoke {
            spec = spec.invoke(invoke.to_spec());
        }
        for child in &self.states {
            spec = spec.child(child.to_spec()?);
        }
        if let Some(done) = &self.donedata {
            spec = spec.done_data(done.to_expr());
        }
        Ok(spec)
    }
}

impl TransitionDef {
    fn to_spec(&self) -> TransitionSpec {
        let mut spec = match &self.event {
            Some(event) => TransitionSpec::on(event),
            None => TransitionSpec::eventless(),
        };
        if let Some(target) = &self.target {
            spec = spec.target(target.clone());
        }
        if self.kind == TransitionKind::Internal {
            spec = spec.internal();
        }
        if let Some(cond) = &self.cond {
            spec = spec.cond(cond.to_condition());
        }
        spec.actions(actions(&self.actions))
    }
}

impl InvokeDef {
    fn to_spec(&self) -> InvokeSpec {
        let mut spec = InvokeSpec::new(self.service.clone()).autoforward(self.autoforward);
        if let Some(id) = &self.id {
            spec = spec.id(id.clone());
        }
        if let Some(src) = &self.src {
            spec = spec.src(src.clone());
        }
        if let Some(content) = &self.content {
            spec = spec.content(content.to_expr());
        }
        if !self.finalize.is_empty() {
            spec = spec.finalize(actions(&self.finalize));
        }
        spec
    }
}

impl DataDef {
    fn to_spec(&self) -> Result<DataSpec, ChartError> {
        match (&self.value, &self.expr) {
            (Some(_), Some(_)) => Err(ChartError::Invalid(format!(
                "data '{}' has both value and expr",
                self.id
            ))),
            (Some(value), None) => Ok(DataSpec::value(self.id.clone(), value.clone())),
            (None, Some(expr)) => Ok(DataSpec::expr(self.id.clone(), expr.to_expr())),
            (None, None) => Ok(DataSpec::unset(self.id.clone())),
        }
    }
}

impl ExprDef {
    fn to_expr(&self) -> Arc<dyn ValueExpr> {
        match self {
            ExprDef::Literal(value) => Arc::new(Literal(value.clone())),
            ExprDef::Location(location) => Arc::new(Location(location.clone())),
            ExprDef::Object(fields) => Arc::new(ObjectExpr(
                fields.iter().map(|(k, v)| (k.clone(), v.to_expr())).collect(),
            )),
        }
    }
}

struct ObjectExpr(Vec<(String, Arc<dyn ValueExpr>)>);

impl ValueExpr for ObjectExpr {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<Value, BoxError> {
        let mut object = serde_json::Map::with_capacity(self.0.len());
        for (key, expr) in &self.0 {
            object.insert(key.clone(), expr.evaluate(ctx)?);
        }
        Ok(Value::Object(object))
    }
}

impl CondDef {
    fn to_condition(&self) -> Arc<dyn Condition> {
        match self {
            CondDef::In(state) => Arc::new(InState(state.clone())),
            CondDef::Truthy(location) => Arc::new(Truthy(location.clone())),
            CondDef::Equals { location, value } => Arc::new(action::Equals {
                location: location.clone(),
                value: value.clone(),
            }),
            CondDef::Not(inner) => Arc::new(action::Not(inner.to_condition())),
            CondDef::All(conds) => Arc::new(action::All(conds.iter().map(CondDef::to_condition).collect())),
        }
    }
}

fn actions(defs: &[ActionDef]) -> ActionList {
    defs.iter().map(ActionDef::to_action).collect()
}

impl ActionDef {
    fn to_action(&self) -> Arc<dyn stepchart_core::Action> {
        match self {
            ActionDef::Raise { event, data } => Arc::new(Raise {
                event: event.clone(),
                data: data.as_ref().map(ExprDef::to_expr),
            }),
            ActionDef::Log { label, expr } => {
                action::Log::new(label.clone(), expr.as_ref().map(ExprDef::to_expr))
            }
            ActionDef::Assign { location, expr } => Assign::new(location.clone(), expr.to_expr()),
            ActionDef::Send {
                event,
                target,
                id,
                data,
                delay_ms,
            } => {
                let mut send = SendEvent::new(event.clone());
                if let Some(target) = target {
                    send = send.target(target.clone());
                }
                if let Some(id) = id {
                    send = send.id(id.clone());
                }
                if let Some(data) = data {
                    send = send.data(data.to_expr());
                }
                if let Some(ms) = delay_ms {
                    send = send.delay(Duration::from_millis(*ms));
                }
                send.build()
            }
            ActionDef::Cancel { sendid, invokeid } => match (sendid, invokeid) {
                (_, Some(invoke)) => Arc::new(Cancel::Invoke(invoke.clone())),
                (Some(send), None) => Arc::new(Cancel::Send(send.clone())),
                (None, None) => action::action(|_| Err("cancel without sendid or invokeid".into())),
            },
        }
    }
}
