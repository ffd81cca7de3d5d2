//! End-to-end event subsystem flows: terminate ends, error propagation to
//! boundary events, event-started sub-processes and composite triggers.

use process_engine::ProcessRuntime;
use process_expr::DataMap;
use process_types::{
    CaughtEvent, EngineError, EventDefinition, NodeId, ProcessDefinition, ProcessNode, TaskState,
    Transition,
};

fn node_state(
    runtime: &ProcessRuntime,
    id: process_types::InstanceId,
    node: &str,
) -> Option<TaskState> {
    runtime
        .instance(id)
        .unwrap()
        .summaries(None)
        .into_iter()
        .filter(|s| s.node == NodeId::new(node))
        .map(|s| s.state)
        .last()
}

// ── Terminate end events ─────────────────────────────────────────────

#[test]
fn terminate_end_cancels_every_live_task() {
    let mut def = ProcessDefinition::new("t", "Terminating");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::parallel("fork")).unwrap();
    def.add_node(ProcessNode::user_task("slow", "Slow")).unwrap();
    def.add_node(ProcessNode::task("fast", "Fast")).unwrap();
    def.add_node(ProcessNode::end_with("kill", EventDefinition::Terminate)).unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_transition(Transition::new("start", "fork")).unwrap();
    def.add_transition(Transition::new("fork", "slow")).unwrap();
    def.add_transition(Transition::new("fork", "fast")).unwrap();
    def.add_transition(Transition::new("fast", "kill")).unwrap();
    def.add_transition(Transition::new("slow", "end")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(def).unwrap();
    let id = runtime.start("t", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    assert_eq!(node_state(&runtime, id, "kill"), Some(TaskState::Completed));
    assert_eq!(node_state(&runtime, id, "slow"), Some(TaskState::Cancelled));
    assert!(runtime.is_completed(id).unwrap());
}

// ── Error end propagation ────────────────────────────────────────────

fn risky_child() -> ProcessDefinition {
    let mut def = ProcessDefinition::new("risky", "Risky");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::end_with(
        "boom",
        EventDefinition::error(Some("E1")),
    ))
    .unwrap();
    def.add_transition(Transition::new("start", "boom")).unwrap();
    def
}

fn guarded_parent() -> ProcessDefinition {
    let mut def = ProcessDefinition::new("caller", "Caller");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::boundary_host("host", "call", ["on_err"])).unwrap();
    def.add_node(ProcessNode::sub_process("call", "Call Risky", "risky")).unwrap();
    def.add_node(ProcessNode::catch_event(
        "on_err",
        "On Error",
        EventDefinition::error(None),
    ))
    .unwrap();
    def.add_node(ProcessNode::task("recover", "Recover")).unwrap();
    def.add_node(ProcessNode::end("done")).unwrap();
    def.add_node(ProcessNode::end("recovered")).unwrap();
    def.add_transition(Transition::new("start", "host")).unwrap();
    def.add_transition(Transition::new("host", "done")).unwrap();
    def.add_transition(Transition::new("on_err", "recover")).unwrap();
    def.add_transition(Transition::new("recover", "recovered")).unwrap();
    def
}

#[test]
fn error_end_is_caught_by_boundary_on_the_owner() {
    let mut runtime = ProcessRuntime::new();
    runtime.register(risky_child()).unwrap();
    runtime.register(guarded_parent()).unwrap();
    let id = runtime.start("caller", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    // The handler path ran; the normal continuation did not.
    assert_eq!(node_state(&runtime, id, "on_err"), Some(TaskState::Completed));
    assert_eq!(node_state(&runtime, id, "recover"), Some(TaskState::Completed));
    assert_eq!(node_state(&runtime, id, "call"), Some(TaskState::Cancelled));
    assert_eq!(node_state(&runtime, id, "done"), None);
    assert!(runtime.is_completed(id).unwrap());
}

#[test]
fn uncaught_error_end_fails_the_owning_task() {
    let mut parent = ProcessDefinition::new("bare", "Bare Caller");
    parent.add_node(ProcessNode::start("start")).unwrap();
    parent.add_node(ProcessNode::sub_process("call", "Call Risky", "risky")).unwrap();
    parent.add_node(ProcessNode::end("done")).unwrap();
    parent.add_transition(Transition::new("start", "call")).unwrap();
    parent.add_transition(Transition::new("call", "done")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(risky_child()).unwrap();
    runtime.register(parent).unwrap();
    let id = runtime.start("bare", DataMap::new()).unwrap();

    let err = runtime.advance(id, None).unwrap_err();
    match err {
        EngineError::TaskFailed { source, trace } => {
            assert!(matches!(*source, EngineError::UnhandledError { .. }));
            assert_eq!(trace, vec!["Call Risky (Bare Caller)"]);
        }
        other => panic!("expected TaskFailed, got {other}"),
    }
    assert_eq!(node_state(&runtime, id, "call"), Some(TaskState::Error));
    assert_eq!(node_state(&runtime, id, "done"), None);
}

#[test]
fn uncaught_escalation_is_dropped() {
    let mut child = ProcessDefinition::new("noisy", "Noisy");
    child.add_node(ProcessNode::start("start")).unwrap();
    child
        .add_node(ProcessNode::end_with(
            "alert",
            EventDefinition::escalation(Some("late")),
        ))
        .unwrap();
    child.add_transition(Transition::new("start", "alert")).unwrap();

    let mut parent = ProcessDefinition::new("calm", "Calm Caller");
    parent.add_node(ProcessNode::start("start")).unwrap();
    parent.add_node(ProcessNode::sub_process("call", "Call Noisy", "noisy")).unwrap();
    parent.add_node(ProcessNode::end("done")).unwrap();
    parent.add_transition(Transition::new("start", "call")).unwrap();
    parent.add_transition(Transition::new("call", "done")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(child).unwrap();
    runtime.register(parent).unwrap();
    let id = runtime.start("calm", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    // Escalations without a catcher do not fail the owner.
    assert!(runtime.is_completed(id).unwrap());
    assert_eq!(node_state(&runtime, id, "done"), Some(TaskState::Completed));
}

// ── Event-started sub-processes ──────────────────────────────────────

fn audit_child() -> ProcessDefinition {
    let mut def = ProcessDefinition::new("audit", "Audit");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::task("record", "Record")).unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_transition(Transition::new("start", "record")).unwrap();
    def.add_transition(Transition::new("record", "end")).unwrap();
    def
}

#[test]
fn matching_event_starts_a_triggered_sub_process() {
    let mut def = ProcessDefinition::new("ops", "Operations");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::user_task("main_work", "Main Work")).unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_node(
        ProcessNode::sub_process("auditor", "Auditor", "audit")
            .with_trigger(EventDefinition::signal("audit_now")),
    )
    .unwrap();
    def.add_transition(Transition::new("start", "main_work")).unwrap();
    def.add_transition(Transition::new("main_work", "end")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(audit_child()).unwrap();
    runtime.register(def).unwrap();
    let id = runtime.start("ops", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    assert_eq!(runtime.instance(id).unwrap().subprocess_count(), 0);

    runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("audit_now")), None)
        .unwrap();
    runtime.advance(id, None).unwrap();

    assert_eq!(runtime.instance(id).unwrap().subprocess_count(), 1);
    assert_eq!(node_state(&runtime, id, "auditor"), Some(TaskState::Completed));
    // The main flow is untouched.
    assert_eq!(node_state(&runtime, id, "main_work"), Some(TaskState::Ready));

    // A finished handler may start again on the next occurrence.
    runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("audit_now")), None)
        .unwrap();
    runtime.advance(id, None).unwrap();
    assert_eq!(runtime.instance(id).unwrap().subprocess_count(), 2);
}

#[test]
fn parallel_multiple_trigger_accumulates_before_starting() {
    let mut def = ProcessDefinition::new("sync", "Sync");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::user_task("wait", "Wait")).unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_node(
        ProcessNode::sub_process("reconcile", "Reconcile", "audit").with_trigger(
            EventDefinition::all_of([
                EventDefinition::signal("ledger_closed"),
                EventDefinition::signal("bank_confirmed"),
            ]),
        ),
    )
    .unwrap();
    def.add_transition(Transition::new("start", "wait")).unwrap();
    def.add_transition(Transition::new("wait", "end")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(audit_child()).unwrap();
    runtime.register(def).unwrap();
    let id = runtime.start("sync", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("ledger_closed")), None)
        .unwrap();
    runtime.advance(id, None).unwrap();
    // One of two events: armed, but no nested instance yet.
    assert_eq!(node_state(&runtime, id, "reconcile"), Some(TaskState::Waiting));
    assert_eq!(runtime.instance(id).unwrap().subprocess_count(), 0);

    runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("bank_confirmed")), None)
        .unwrap();
    runtime.advance(id, None).unwrap();
    assert_eq!(runtime.instance(id).unwrap().subprocess_count(), 1);
    assert_eq!(node_state(&runtime, id, "reconcile"), Some(TaskState::Completed));
}

// ── Composite catchers ───────────────────────────────────────────────

#[test]
fn any_of_catcher_is_satisfied_by_either_event() {
    let mut def = ProcessDefinition::new("either", "Either");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::catch_event(
        "gate",
        "Gate",
        EventDefinition::any_of([
            EventDefinition::message("paper_form"),
            EventDefinition::signal("digital_form"),
        ]),
    ))
    .unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_transition(Transition::new("start", "gate")).unwrap();
    def.add_transition(Transition::new("gate", "end")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(def).unwrap();
    let id = runtime.start("either", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();
    assert_eq!(node_state(&runtime, id, "gate"), Some(TaskState::Waiting));

    let resolved = runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("digital_form")), None)
        .unwrap();
    assert_eq!(resolved.len(), 1);
    runtime.advance(id, None).unwrap();
    assert!(runtime.is_completed(id).unwrap());
}

// ── Signals reach every waiting catcher; messages queue outbound ─────

#[test]
fn signal_resolves_all_catchers_message_queues_when_unconsumed() {
    let mut def = ProcessDefinition::new("sig", "Signals");
    def.add_node(ProcessNode::start("start")).unwrap();
    def.add_node(ProcessNode::parallel("fork")).unwrap();
    def.add_node(ProcessNode::catch_event(
        "first",
        "First",
        EventDefinition::signal("go"),
    ))
    .unwrap();
    def.add_node(ProcessNode::catch_event(
        "second",
        "Second",
        EventDefinition::signal("go"),
    ))
    .unwrap();
    def.add_node(ProcessNode::parallel("join")).unwrap();
    def.add_node(ProcessNode::end("end")).unwrap();
    def.add_transition(Transition::new("start", "fork")).unwrap();
    def.add_transition(Transition::new("fork", "first")).unwrap();
    def.add_transition(Transition::new("fork", "second")).unwrap();
    def.add_transition(Transition::new("first", "join")).unwrap();
    def.add_transition(Transition::new("second", "join")).unwrap();
    def.add_transition(Transition::new("join", "end")).unwrap();

    let mut runtime = ProcessRuntime::new();
    runtime.register(def).unwrap();
    let id = runtime.start("sig", DataMap::new()).unwrap();
    runtime.advance(id, None).unwrap();

    // Both catchers collected before either resolves.
    let resolved = runtime
        .catch(id, CaughtEvent::new(EventDefinition::signal("go")), None)
        .unwrap();
    assert_eq!(resolved.len(), 2);
    runtime.advance(id, None).unwrap();
    assert!(runtime.is_completed(id).unwrap());

    // A message nothing waits on surfaces on the outbound queue.
    let resolved = runtime
        .catch(
            id,
            CaughtEvent::new(EventDefinition::message("late_news")),
            None,
        )
        .unwrap();
    assert!(resolved.is_empty());
    let outbound = runtime.instance(id).unwrap().outbound_messages();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].name, "late_news");
}
