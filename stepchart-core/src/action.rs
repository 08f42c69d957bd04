//! Executable content, conditions and value expressions.
//!
//! These are the evaluator contracts the engine calls into. The engine does
//! not interpret any expression language: a chart loader supplies trait
//! objects, either the built-ins below or its own closures.

use crate::cancel::CancellationContext;
use crate::collections::OrderedSet;
use crate::datamodel::{DataModel, EVENT};
use crate::document::{DocId, Document};
use crate::error::{BoxError, CommunicationFault};
use crate::event::{Event, EventType, SessionId};
use crate::invoke::{EventDispatcher, OutgoingEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Target of a `<send>` that places the event on the session's own
/// internal queue.
pub const INTERNAL_TARGET: &str = "#_internal";

/// A piece of executable content.
pub trait Action: Send + Sync {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError>;
}

/// A transition guard.
pub trait Condition: Send + Sync {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError>;
}

/// An expression producing a value (data initializers, done data, event
/// payloads).
pub trait ValueExpr: Send + Sync {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<Value, BoxError>;
}

/// Side effects of executable content that the engine applies afterwards.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub raised: Vec<Event>,
    pub cancelled_invokes: Vec<String>,
}

/// What executable content can see and do.
pub struct ActionContext<'a> {
    data: &'a mut DataModel,
    configuration: &'a OrderedSet<DocId>,
    document: &'a Document,
    session: &'a SessionId,
    dispatcher: &'a dyn EventDispatcher,
    cancellation: &'a CancellationContext,
    effects: Effects,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        data: &'a mut DataModel,
        configuration: &'a OrderedSet<DocId>,
        document: &'a Document,
        session: &'a SessionId,
        dispatcher: &'a dyn EventDispatcher,
        cancellation: &'a CancellationContext,
    ) -> Self {
        Self {
            data,
            configuration,
            document,
            session,
            dispatcher,
            cancellation,
            effects: Effects::default(),
        }
    }

    pub fn data(&self) -> &DataModel {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut DataModel {
        self.data
    }

    /// The `_event` system variable.
    pub fn event(&self) -> Option<&Value> {
        self.data.get(EVENT)
    }

    pub fn session_id(&self) -> &SessionId {
        self.session
    }

    /// The `In()` predicate: whether the state with this id is active.
    pub fn in_state(&self, id: &str) -> bool {
        self.document
            .lookup(id)
            .map(|doc_id| self.configuration.contains(&doc_id))
            .unwrap_or(false)
    }

    /// Places an event on the internal queue once the current block finishes.
    pub fn raise(&mut self, event: Event) {
        self.effects.raised.push(event);
    }

    /// Sends an event. `#_internal` targets the session itself; anything
    /// else goes to the dispatcher.
    pub fn send(&mut self, event: OutgoingEvent) -> Result<(), BoxError> {
        if event.target.as_deref() == Some(INTERNAL_TARGET) {
            let mut internal = event.event;
            internal.event_type = EventType::External;
            self.effects.raised.push(internal);
            return Ok(());
        }

        let send_id = event.event.send_id.clone();
        self.dispatcher
            .send(self.session, event)
            .map_err(|e| Box::new(CommunicationFault::new(self.session.clone(), send_id, e)) as BoxError)
    }

    /// Cancels a delayed send.
    pub fn cancel_send(&mut self, send_id: &str) -> Result<(), BoxError> {
        self.dispatcher.cancel(self.session, send_id).map_err(|e| {
            Box::new(CommunicationFault::new(
                self.session.clone(),
                Some(send_id.to_string()),
                e,
            )) as BoxError
        })
    }

    /// Cancels an active invoke by its chart-visible id once the current
    /// block finishes.
    pub fn cancel_invoke(&mut self, invoke_id: &str) {
        self.effects.cancelled_invokes.push(invoke_id.to_string());
    }

    /// Returns whether the session was asked to stop, destroy or suspend.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn into_effects(self) -> Effects {
        self.effects
    }
}

/// Wraps a closure as an [`Action`].
pub fn action<F>(f: F) -> Arc<dyn Action>
where
    F: Fn(&mut ActionContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    struct FnAction<F>(F);
    impl<F> Action for FnAction<F>
    where
        F: Fn(&mut ActionContext<'_>) -> Result<(), BoxError> + Send + Sync,
    {
        fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
            (self.0)(ctx)
        }
    }
    Arc::new(FnAction(f))
}

/// Wraps a closure as a [`Condition`].
pub fn condition<F>(f: F) -> Arc<dyn Condition>
where
    F: Fn(&ActionContext<'_>) -> Result<bool, BoxError> + Send + Sync + 'static,
{
    struct FnCondition<F>(F);
    impl<F> Condition for FnCondition<F>
    where
        F: Fn(&ActionContext<'_>) -> Result<bool, BoxError> + Send + Sync,
    {
        fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
            (self.0)(ctx)
        }
    }
    Arc::new(FnCondition(f))
}

/// Wraps a closure as a [`ValueExpr`].
pub fn value<F>(f: F) -> Arc<dyn ValueExpr>
where
    F: Fn(&ActionContext<'_>) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    struct FnValue<F>(F);
    impl<F> ValueExpr for FnValue<F>
    where
        F: Fn(&ActionContext<'_>) -> Result<Value, BoxError> + Send + Sync,
    {
        fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<Value, BoxError> {
            (self.0)(ctx)
        }
    }
    Arc::new(FnValue(f))
}

// Value expressions

/// A constant value.
pub struct Literal(pub Value);

impl ValueExpr for Literal {
    fn evaluate(&self, _ctx: &ActionContext<'_>) -> Result<Value, BoxError> {
        Ok(self.0.clone())
    }
}

/// The value at a data model location. Missing locations are an error.
pub struct Location(pub String);

impl ValueExpr for Location {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<Value, BoxError> {
        ctx.data()
            .get(&self.0)
            .cloned()
            .ok_or_else(|| format!("location '{}' is not defined", self.0).into())
    }
}

// Conditions

/// `In(state)`.
pub struct InState(pub String);

impl Condition for InState {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
        Ok(ctx.in_state(&self.0))
    }
}

/// True when the location holds a truthy value: not null, false, 0, or an
/// empty string, array or object. Missing locations are falsy.
pub struct Truthy(pub String);

impl Condition for Truthy {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
        Ok(ctx.data().get(&self.0).map(is_truthy).unwrap_or(false))
    }
}

/// True when the location holds exactly `value`.
pub struct Equals {
    pub location: String,
    pub value: Value,
}

impl Condition for Equals {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
        Ok(ctx.data().get(&self.location) == Some(&self.value))
    }
}

/// Negates a condition.
pub struct Not(pub Arc<dyn Condition>);

impl Condition for Not {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
        Ok(!self.0.evaluate(ctx)?)
    }
}

/// True when every condition is true.
pub struct All(pub Vec<Arc<dyn Condition>>);

impl Condition for All {
    fn evaluate(&self, ctx: &ActionContext<'_>) -> Result<bool, BoxError> {
        for cond in &self.0 {
            if !cond.evaluate(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// Executable content

/// `<raise>`: places an internal event on the queue.
pub struct Raise {
    pub event: String,
    pub data: Option<Arc<dyn ValueExpr>>,
}

impl Raise {
    pub fn new(event: impl Into<String>) -> Arc<dyn Action> {
        Arc::new(Self {
            event: event.into(),
            data: None,
        })
    }
}

impl Action for Raise {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
        let data = match &self.data {
            Some(expr) => expr.evaluate(ctx)?,
            None => Value::Null,
        };
        ctx.raise(Event::internal(self.event.clone()).with_data(data));
        Ok(())
    }
}

/// `<log>`: writes a labelled value to the tracing log.
pub struct Log {
    pub label: String,
    pub expr: Option<Arc<dyn ValueExpr>>,
}

impl Log {
    pub fn new(label: impl Into<String>, expr: Option<Arc<dyn ValueExpr>>) -> Arc<dyn Action> {
        Arc::new(Self {
            label: label.into(),
            expr,
        })
    }
}

impl Action for Log {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
        let value = match &self.expr {
            Some(expr) => expr.evaluate(ctx)?,
            None => Value::Null,
        };
        tracing::info!(session = %ctx.session_id(), label = %self.label, "{}", value);
        Ok(())
    }
}

/// `<assign>`: writes a value to a declared data model location.
pub struct Assign {
    pub location: String,
    pub expr: Arc<dyn ValueExpr>,
}

impl Assign {
    pub fn new(location: impl Into<String>, expr: Arc<dyn ValueExpr>) -> Arc<dyn Action> {
        Arc::new(Self {
            location: location.into(),
            expr,
        })
    }

    /// Assigns a constant.
    pub fn literal(location: impl Into<String>, value: Value) -> Arc<dyn Action> {
        Self::new(location, Arc::new(Literal(value)))
    }
}

impl Action for Assign {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
        let value = self.expr.evaluate(ctx)?;
        ctx.data_mut().set(&self.location, value)?;
        Ok(())
    }
}

/// `<send>`.
pub struct SendEvent {
    pub event: String,
    pub target: Option<String>,
    pub target_type: Option<String>,
    pub id: Option<String>,
    pub data: Option<Arc<dyn ValueExpr>>,
    pub delay: Option<Duration>,
}

impl SendEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            target: None,
            target_type: None,
            id: None,
            data: None,
            delay: None,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data(mut self, data: Arc<dyn ValueExpr>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn build(self) -> Arc<dyn Action> {
        Arc::new(self)
    }
}

impl Action for SendEvent {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
        let data = match &self.data {
            Some(expr) => expr.evaluate(ctx)?,
            None => Value::Null,
        };
        let mut event = Event::external(self.event.clone())
            .with_data(data)
            .with_origin(format!("#_scxml_{}", ctx.session_id()), "http://www.w3.org/TR/scxml/#SCXMLEventProcessor");
        if let Some(id) = &self.id {
            event = event.with_send_id(id.clone());
        }
        ctx.send(OutgoingEvent {
            event,
            target: self.target.clone(),
            target_type: self.target_type.clone(),
            delay: self.delay,
        })
    }
}

/// `<cancel>`: cancels a delayed send, or an active invoke by its id.
pub enum Cancel {
    Send(String),
    Invoke(String),
}

impl Action for Cancel {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<(), BoxError> {
        match self {
            Cancel::Send(send_id) => ctx.cancel_send(send_id),
            Cancel::Invoke(invoke_id) => {
                ctx.cancel_invoke(invoke_id);
                Ok(())
            }
        }
    }
}
