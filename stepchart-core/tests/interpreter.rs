use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepchart_core::action::{action, value, Assign, Raise};
use stepchart_core::document::{
    Binding, DataSpec, DocumentBuilder, InvokeSpec, StateSpec, TransitionSpec,
};
use stepchart_core::invoke::{InvokeCall, RecordingController};
use stepchart_core::{
    queue, BoxError, CancellationContext, Document, EngineError, EngineObserver, EngineState,
    ErrorKind, Event, Interpreter, InterpreterOptions, SessionId, UnhandledErrorPolicy,
};
use stepchart_wal::{LogConfig, MemoryStream};

#[derive(Default)]
struct Recorder {
    raised: Mutex<Vec<String>>,
    configurations: Mutex<Vec<Vec<String>>>,
    errors: Mutex<Vec<ErrorKind>>,
}

impl EngineObserver for Recorder {
    fn on_raise(&self, _session: &SessionId, event: &Event) {
        self.raised.lock().push(event.name.clone());
    }

    fn on_configuration(&self, _session: &SessionId, states: &[String]) {
        self.configurations.lock().push(states.to_vec());
    }

    fn on_error(
        &self,
        _session: &SessionId,
        kind: ErrorKind,
        _error: &(dyn std::error::Error + 'static),
    ) -> Result<(), BoxError> {
        self.errors.lock().push(kind);
        Ok(())
    }
}

fn open(doc: &Arc<Document>, stream: &MemoryStream) -> Interpreter {
    Interpreter::builder(doc.clone(), SessionId::from("test"))
        .open(stream.clone(), LogConfig::default())
        .unwrap()
}

/// Delivers `events`, then closes the queue.
async fn deliver(interpreter: Interpreter, events: &[&str]) -> Result<Option<Value>, EngineError> {
    let (tx, rx) = queue::channel(None);
    for name in events {
        tx.send(Event::external(*name)).await.unwrap();
    }
    drop(tx);
    interpreter.run(rx, CancellationContext::new()).await
}

#[tokio::test]
async fn test_compound_state_enters_first_child() {
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = entered.clone();
    let doc = Arc::new(
        DocumentBuilder::new("nested")
            .state(
                StateSpec::state("parent")
                    .child(StateSpec::state("first").on_entry(vec![action(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })]))
                    .child(StateSpec::state("second")),
            )
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();

    let err = deliver(open(&doc, &stream), &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Suspended));
    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!(open(&doc, &stream).configuration(), vec!["parent", "first"]);
}

#[tokio::test]
async fn test_parallel_completion_raises_done_events_in_order() {
    let doc = Arc::new(
        DocumentBuilder::new("parallel")
            .state(
                StateSpec::parallel("p")
                    .child(
                        StateSpec::state("r1")
                            .child(StateSpec::state("r1a").transition(
                                TransitionSpec::on("finish1").target("r1done"),
                            ))
                            .child(StateSpec::final_state("r1done")),
                    )
                    .child(
                        StateSpec::state("r2")
                            .child(StateSpec::state("r2a").transition(
                                TransitionSpec::on("finish2").target("r2done"),
                            ))
                            .child(StateSpec::final_state("r2done")),
                    )
                    .transition(TransitionSpec::on("done.state.p").target("end")),
            )
            .state(StateSpec::final_state("end"))
            .build()
            .unwrap(),
    );
    let recorder = Arc::new(Recorder::default());
    let interpreter = Interpreter::builder(doc, SessionId::new())
        .observer(recorder.clone())
        .open(MemoryStream::new(), LogConfig::default())
        .unwrap();

    let done = deliver(interpreter, &["finish1", "finish2"]).await.unwrap();
    assert_eq!(done, None);
    assert_eq!(
        *recorder.raised.lock(),
        vec!["done.state.r1", "done.state.r2", "done.state.p"]
    );
}

#[tokio::test]
async fn test_parallel_regions_move_together() {
    let doc = Arc::new(
        DocumentBuilder::new("regions")
            .state(
                StateSpec::parallel("p")
                    .child(
                        StateSpec::state("r1")
                            .child(StateSpec::state("a").transition(TransitionSpec::on("e").target("a2")))
                            .child(StateSpec::state("a2")),
                    )
                    .child(
                        StateSpec::state("r2")
                            .child(StateSpec::state("b").transition(TransitionSpec::on("e").target("b2")))
                            .child(StateSpec::state("b2")),
                    ),
            )
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &["e"]).await.unwrap_err();
    assert_eq!(
        open(&doc, &stream).configuration(),
        vec!["p", "r1", "a2", "r2", "b2"]
    );
}

#[tokio::test]
async fn test_conflicting_transitions_keep_document_order() {
    let doc = Arc::new(
        DocumentBuilder::new("conflict")
            .state(
                StateSpec::parallel("p")
                    .child(
                        StateSpec::state("r1")
                            .child(StateSpec::state("a").transition(TransitionSpec::on("e").target("out"))),
                    )
                    .child(
                        StateSpec::state("r2")
                            .child(StateSpec::state("b").transition(TransitionSpec::on("e").target("b2")))
                            .child(StateSpec::state("b2")),
                    ),
            )
            .state(StateSpec::state("out"))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &["e"]).await.unwrap_err();
    assert_eq!(open(&doc, &stream).configuration(), vec!["out"]);
}

#[tokio::test]
async fn test_descendant_transition_preempts_ancestor() {
    let doc = Arc::new(
        DocumentBuilder::new("preempt")
            .state(
                StateSpec::state("outer")
                    .transition(TransitionSpec::on("e").target("elsewhere"))
                    .child(StateSpec::state("inner").transition(TransitionSpec::on("e").target("sibling")))
                    .child(StateSpec::state("sibling")),
            )
            .state(StateSpec::state("elsewhere"))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &["e"]).await.unwrap_err();
    assert_eq!(open(&doc, &stream).configuration(), vec!["outer", "sibling"]);
}

#[tokio::test]
async fn test_shallow_history_restores_last_child() {
    let doc = Arc::new(
        DocumentBuilder::new("history")
            .state(
                StateSpec::state("main")
                    .initial("m1")
                    .transition(TransitionSpec::on("pause").target("paused"))
                    .child(StateSpec::state("m1").transition(TransitionSpec::on("next").target("m2")))
                    .child(StateSpec::state("m2"))
                    .child(
                        StateSpec::history("h", false)
                            .transition(TransitionSpec::eventless().target("m1")),
                    ),
            )
            .state(StateSpec::state("paused").transition(TransitionSpec::on("resume").target("h")))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &["next", "pause", "resume"])
        .await
        .unwrap_err();
    assert_eq!(open(&doc, &stream).configuration(), vec!["main", "m2"]);
}

#[tokio::test]
async fn test_initial_history_runs_default_content() {
    let defaults = Arc::new(AtomicUsize::new(0));
    let counter = defaults.clone();
    let doc = Arc::new(
        DocumentBuilder::new("history-initial")
            .state(
                StateSpec::state("main")
                    .initial("h")
                    .child(StateSpec::state("m1"))
                    .child(StateSpec::state("m2"))
                    .child(StateSpec::history("h", false).transition(
                        TransitionSpec::eventless().target("m2").action(action(move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })),
                    )),
            )
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &[]).await.unwrap_err();
    assert_eq!(open(&doc, &stream).configuration(), vec!["main", "m2"]);
    assert_eq!(defaults.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_action_raises_error_event() {
    let doc = Arc::new(
        DocumentBuilder::new("errors")
            .state(
                StateSpec::state("a")
                    .on_entry(vec![action(|_| Err("boom".into()))])
                    .transition(TransitionSpec::on("error.execution").target("recovered")),
            )
            .state(StateSpec::state("recovered"))
            .build()
            .unwrap(),
    );
    let recorder = Arc::new(Recorder::default());
    let stream = MemoryStream::new();
    let interpreter = Interpreter::builder(doc.clone(), SessionId::from("test"))
        .observer(recorder.clone())
        .open(stream.clone(), LogConfig::default())
        .unwrap();

    deliver(interpreter, &[]).await.unwrap_err();
    assert_eq!(*recorder.errors.lock(), vec![ErrorKind::Execution]);
    assert_eq!(open(&doc, &stream).configuration(), vec!["recovered"]);
}

#[tokio::test]
async fn test_unhandled_error_policy() {
    let doc = Arc::new(
        DocumentBuilder::new("unhandled")
            .state(StateSpec::state("a").on_entry(vec![action(|_| Err("boom".into()))]))
            .build()
            .unwrap(),
    );

    let stream = MemoryStream::new();
    let err = deliver(open(&doc, &stream), &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Suspended));

    let stream = MemoryStream::new();
    let interpreter = Interpreter::builder(doc.clone(), SessionId::from("test"))
        .options(InterpreterOptions::default().with_unhandled_errors(UnhandledErrorPolicy::Halt))
        .open(stream.clone(), LogConfig::default())
        .unwrap();
    let err = deliver(interpreter, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Halted));
    assert_eq!(open(&doc, &stream).state(), EngineState::Halted);
}

#[tokio::test]
async fn test_livelock_destroys_session() {
    let doc = Arc::new(
        DocumentBuilder::new("spin")
            .state(
                StateSpec::state("spin")
                    .on_entry(vec![Raise::new("tick")])
                    .transition(TransitionSpec::eventless().target("spin")),
            )
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    let interpreter = Interpreter::builder(doc.clone(), SessionId::from("test"))
        .options(InterpreterOptions::default().with_livelock_window(8))
        .open(stream.clone(), LogConfig::default())
        .unwrap();

    let err = deliver(interpreter, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::LiveLock { window: 8 }));

    let reopened = open(&doc, &stream);
    assert_eq!(reopened.state(), EngineState::Destroyed);
    assert!(reopened.configuration().is_empty());
}

#[tokio::test]
async fn test_invoke_ids_are_unique_per_start() {
    let doc = Arc::new(
        DocumentBuilder::new("invokes")
            .state(
                StateSpec::state("working")
                    .invoke(InvokeSpec::new("svc"))
                    .transition(TransitionSpec::on("restart").target("working")),
            )
            .build()
            .unwrap(),
    );
    let controller = Arc::new(RecordingController::new());
    let interpreter = Interpreter::builder(doc, SessionId::new())
        .controller(controller.clone())
        .open(MemoryStream::new(), LogConfig::default())
        .unwrap();

    deliver(interpreter, &["restart", "restart"]).await.unwrap_err();

    let started = controller.started();
    assert_eq!(started.len(), 3);
    for (i, a) in started.iter().enumerate() {
        for b in &started[i + 1..] {
            assert_ne!(a, b);
            assert_ne!(a.value, b.value);
        }
    }
    let cancelled: Vec<_> = controller
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            InvokeCall::Cancel(id) => Some(id),
            _ => None,
        })
        .collect();
    // The last instance is cancelled by the suspend.
    assert_eq!(cancelled, started);
}

#[tokio::test]
async fn test_stale_invoke_events_are_dropped() {
    let doc = Arc::new(
        DocumentBuilder::new("stale")
            .state(
                StateSpec::state("busy")
                    .invoke(InvokeSpec::new("worker").id("job"))
                    .transition(TransitionSpec::on("done.invoke.job").target("finished")),
            )
            .state(StateSpec::final_state("finished"))
            .build()
            .unwrap(),
    );
    let node = doc.invokes(doc.lookup("busy").unwrap()).next().unwrap().0;
    let controller = Arc::new(RecordingController::new());
    let stream = MemoryStream::new();
    let interpreter = Interpreter::builder(doc.clone(), SessionId::from("test"))
        .controller(controller.clone())
        .open(stream.clone(), LogConfig::default())
        .unwrap();

    let stale = stepchart_core::InvokeId::new("job", node, 1000);
    let (tx, rx) = queue::channel(None);
    tx.send(Event::external("done.invoke.job").with_invoke_id(stale))
        .await
        .unwrap();
    drop(tx);
    let err = interpreter.run(rx, CancellationContext::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Suspended));

    let live = controller.started()[0].clone();
    let resumed = Interpreter::builder(doc, SessionId::from("test"))
        .controller(controller.clone())
        .open(stream, LogConfig::default())
        .unwrap();
    assert_eq!(resumed.configuration(), vec!["busy"]);
    assert_eq!(resumed.active_invokes(), vec![live.clone()]);

    let (tx, rx) = queue::channel(None);
    tx.send(Event::external("done.invoke.job").with_invoke_id(live.clone()))
        .await
        .unwrap();
    resumed.run(rx, CancellationContext::new()).await.unwrap();

    // Restarted under its original id on resume.
    assert_eq!(controller.started(), vec![live.clone(), live]);
}

/// Records which invoke each delivered event came from.
#[derive(Default)]
struct Delivered(Mutex<Vec<(String, Option<stepchart_core::InvokeId>)>>);

impl EngineObserver for Delivered {
    fn on_event(&self, _session: &SessionId, event: &Event) {
        self.0
            .lock()
            .push((event.name.clone(), event.invoke_id.clone()));
    }
}

#[tokio::test]
async fn test_events_from_a_cancelled_instance_are_dropped() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = finalized.clone();
    let doc = Arc::new(
        DocumentBuilder::new("restart")
            .state(
                StateSpec::state("busy")
                    .invoke(InvokeSpec::new("worker").id("job").finalize(vec![action(
                        move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )]))
                    .transition(TransitionSpec::on("leave").target("away"))
                    .transition(TransitionSpec::on("done.invoke.job").target("finished")),
            )
            .state(StateSpec::state("away").transition(TransitionSpec::on("back").target("busy")))
            .state(StateSpec::final_state("finished"))
            .build()
            .unwrap(),
    );
    let controller = Arc::new(RecordingController::new());
    let delivered = Arc::new(Delivered::default());
    let interpreter = Interpreter::builder(doc, SessionId::from("test"))
        .controller(controller.clone())
        .observer(delivered.clone())
        .open(MemoryStream::new(), LogConfig::default())
        .unwrap();
    let (tx, rx) = queue::channel(None);
    let handle = tokio::spawn(interpreter.run(rx, CancellationContext::new()));

    tx.send(Event::external("leave")).await.unwrap();
    tx.send(Event::external("back")).await.unwrap();
    for _ in 0..400 {
        if controller.started().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let started = controller.started();
    assert_eq!(started.len(), 2);
    let (first, second) = (started[0].clone(), started[1].clone());
    assert_eq!(first.value, second.value);
    assert_ne!(first, second);
    assert!(controller.calls().contains(&InvokeCall::Cancel(first.clone())));

    // Same chart-visible id, but from the instance that was cancelled.
    tx.send(Event::external("done.invoke.job").with_invoke_id(first))
        .await
        .unwrap();
    tx.send(Event::external("done.invoke.job").with_invoke_id(second.clone()))
        .await
        .unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), None);

    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    let from_invokes: Vec<_> = delivered
        .0
        .lock()
        .iter()
        .filter_map(|(_, id)| id.clone())
        .collect();
    assert_eq!(from_invokes, vec![second]);
}

#[tokio::test]
async fn test_done_data_is_returned() {
    let doc = Arc::new(
        DocumentBuilder::new("done")
            .data(DataSpec::value("total", json!(0)))
            .state(
                StateSpec::state("counting")
                    .transition(
                        TransitionSpec::on("add")
                            .action(action(|ctx| {
                                let total = ctx.data().get("total").and_then(Value::as_i64).unwrap_or(0);
                                ctx.data_mut().set("total", json!(total + 1))?;
                                Ok(())
                            })),
                    )
                    .transition(TransitionSpec::on("finish").target("end")),
            )
            .state(StateSpec::final_state("end").done_data(value(|ctx| {
                Ok(json!({ "total": ctx.data().get("total").cloned().unwrap_or(Value::Null) }))
            })))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    let done = deliver(open(&doc, &stream), &["add", "add", "add", "finish"])
        .await
        .unwrap();
    assert_eq!(done, Some(json!({ "total": 3 })));

    // A finished session reports the same result again.
    let again = deliver(open(&doc, &stream), &[]).await.unwrap();
    assert_eq!(again, Some(json!({ "total": 3 })));
}

#[tokio::test]
async fn test_late_binding_initializes_on_entry() {
    let doc = Arc::new(
        DocumentBuilder::new("late")
            .binding(Binding::Late)
            .state(StateSpec::state("s1").transition(TransitionSpec::on("go").target("s2")))
            .state(StateSpec::state("s2").data(DataSpec::value("late", json!(5))))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    deliver(open(&doc, &stream), &[]).await.unwrap_err();
    assert!(!open(&doc, &stream).data().is_declared("late"));

    deliver(open(&doc, &stream), &["go"]).await.unwrap_err();
    assert_eq!(open(&doc, &stream).data().get("late"), Some(&json!(5)));
}

#[tokio::test]
async fn test_destroy_runs_exit_content() {
    let exits = Arc::new(AtomicUsize::new(0));
    let counter = exits.clone();
    let doc = Arc::new(
        DocumentBuilder::new("destroy")
            .state(StateSpec::state("idle").on_exit(vec![action(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })]))
            .build()
            .unwrap(),
    );
    let stream = MemoryStream::new();
    let interpreter = open(&doc, &stream);
    let (_tx, rx) = queue::channel(None);
    let cancel = CancellationContext::new();
    let handle = tokio::spawn(interpreter.run(rx, cancel.clone()));

    tokio::task::yield_now().await;
    cancel.destroy();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Destroyed));
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(open(&doc, &stream).state(), EngineState::Destroyed);
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let build = || {
        Arc::new(
            DocumentBuilder::new("det")
                .data(DataSpec::value("n", json!(0)))
                .state(
                    StateSpec::parallel("p")
                        .child(
                            StateSpec::state("x")
                                .child(StateSpec::state("x1").transition(TransitionSpec::on("t").target("x2")))
                                .child(StateSpec::state("x2").on_entry(vec![Raise::new("moved")])),
                        )
                        .child(
                            StateSpec::state("y")
                                .child(StateSpec::state("y1").transition(TransitionSpec::on("moved").target("y2")))
                                .child(
                                    StateSpec::state("y2")
                                        .on_entry(vec![Assign::literal("n", json!(2))]),
                                ),
                        ),
                )
                .build()
                .unwrap(),
        )
    };

    let mut traces = Vec::new();
    for _ in 0..2 {
        let recorder = Arc::new(Recorder::default());
        let interpreter = Interpreter::builder(build(), SessionId::from("same"))
            .observer(recorder.clone())
            .open(MemoryStream::new(), LogConfig::default())
            .unwrap();
        deliver(interpreter, &["t"]).await.unwrap_err();
        let configurations = recorder.configurations.lock().clone();
        let raised = recorder.raised.lock().clone();
        traces.push((configurations, raised));
    }
    assert_eq!(traces[0], traces[1]);
    assert_eq!(
        traces[0].0.last().unwrap(),
        &vec!["p", "x", "x2", "y", "y2"]
    );
}
