//! External signal gates seen through running tasks.

use std::time::{Duration, Instant};

use serde_json::json;

use labflow::state::StepCode;
use labflow::workflow::{Step, CLOSE_LID_DONE_SIGNAL};
use labflow::{Error, TaskStatus};

use crate::fixtures::{call, payload, wait_signal, Harness};

/// Test: Unanswered gate times out
/// Given a task waiting on a signal with a short timeout
/// When nobody sends the signal
/// Then the task ends in Error and the gate is retired
#[tokio::test]
async fn test_gate_times_out() {
    let h = Harness::new();
    let timeout = Duration::from_millis(300);
    let steps = vec![Step::WaitSignal(wait_signal(CLOSE_LID_DONE_SIGNAL).timeout(timeout))];

    let started = Instant::now();
    h.orch.start_task("T1", "robot_b", steps).unwrap();
    let done = h.finish("robot_b").await;
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "gave up early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(1), "hung for {:?}", elapsed);
    assert_eq!(done.status, TaskStatus::Error);
    assert!(done.side_channel_payload.is_none());
    let message = done.error_message.unwrap();
    assert!(message.contains("waiting for CLOSE_LID_DONE"), "{}", message);
    assert!(h.orch.gate_status().is_empty());

    // A late signal finds nothing to fulfil.
    assert!(!h
        .orch
        .fulfill_signal(CLOSE_LID_DONE_SIGNAL, "robot_b", Default::default())
        .unwrap());
}

/// Test: Signals are routed by agent
/// Given two tasks waiting on the same signal name
/// When the signal is sent for one agent
/// Then only that agent's task moves on
#[tokio::test]
async fn test_signal_routed_by_agent() {
    let h = Harness::new();
    for (task, agent) in [("T-a", "robot_a"), ("T-b", "robot_b")] {
        let steps = vec![
            Step::WaitSignal(wait_signal(CLOSE_LID_DONE_SIGNAL)),
            call(StepCode::PuttingDown, "place_to_shelf"),
        ];
        h.orch.start_task(task, agent, steps).unwrap();
    }
    assert!(h.gate_armed(CLOSE_LID_DONE_SIGNAL, "robot_a").await);
    assert!(h.gate_armed(CLOSE_LID_DONE_SIGNAL, "robot_b").await);

    assert!(h
        .orch
        .fulfill_signal(CLOSE_LID_DONE_SIGNAL, "robot_a", payload(json!({"lid": "closed"})))
        .unwrap());

    let a = h.finish("robot_a").await;
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.side_channel_payload.unwrap()["lid"], json!("closed"));

    assert!(h.status_reaches("robot_b", TaskStatus::WaitingExternal).await);
    assert!(h.state("robot_b").side_channel_payload.is_none());

    h.orch
        .fulfill_signal(CLOSE_LID_DONE_SIGNAL, "robot_b", Default::default())
        .unwrap();
    assert_eq!(h.finish("robot_b").await.status, TaskStatus::Completed);
}

/// Test: Incomplete payload is rejected and the gate stays armed
/// Given a gate that requires a qrcode_id
/// When a signal without it arrives
/// Then the call fails and a later complete signal still completes the task
#[tokio::test]
async fn test_missing_required_field_keeps_gate() {
    let h = Harness::new();
    let steps = vec![Step::WaitSignal(
        wait_signal("SCAN_QRCODE_ENTER_ID").require(&["qrcode_id"]),
    )];
    h.orch.start_task("T1", "robot_a", steps).unwrap();
    assert!(h.gate_armed("SCAN_QRCODE_ENTER_ID", "robot_a").await);

    let err = h
        .orch
        .fulfill_signal("SCAN_QRCODE_ENTER_ID", "robot_a", payload(json!({"type": "x"})))
        .unwrap_err();
    match err {
        Error::ExternalSignalMismatch { missing, .. } => assert_eq!(missing, vec!["qrcode_id"]),
        other => panic!("expected ExternalSignalMismatch, got {:?}", other),
    }
    assert!(h.orch.gates().is_armed("SCAN_QRCODE_ENTER_ID", "robot_a"));

    assert!(h
        .orch
        .fulfill_signal("SCAN_QRCODE_ENTER_ID", "robot_a", payload(json!({"qrcode_id": "Q1"})))
        .unwrap());
    assert_eq!(h.finish("robot_a").await.status, TaskStatus::Completed);
}

/// Test: A gate fires once
/// Given a fulfilled gate
/// When the same signal is sent again
/// Then the duplicate is ignored and the first payload is kept
#[tokio::test]
async fn test_duplicate_signal_ignored() {
    let h = Harness::new();
    let steps = vec![Step::WaitSignal(wait_signal(CLOSE_LID_DONE_SIGNAL))];
    h.orch.start_task("T1", "robot_b", steps).unwrap();
    assert!(h.gate_armed(CLOSE_LID_DONE_SIGNAL, "robot_b").await);

    let first = payload(json!({"seq": 1}));
    let second = payload(json!({"seq": 2}));
    assert!(h.orch.fulfill_signal(CLOSE_LID_DONE_SIGNAL, "robot_b", first).unwrap());
    assert!(!h.orch.fulfill_signal(CLOSE_LID_DONE_SIGNAL, "robot_b", second).unwrap());

    let done = h.finish("robot_b").await;
    assert_eq!(done.side_channel_payload.unwrap()["seq"], json!(1));
}

/// Test: Gate fulfilled by id
/// Given an armed gate listed in the gate status
/// When it is fulfilled through its id
/// Then the task completes
#[tokio::test]
async fn test_fulfil_gate_by_id() {
    let h = Harness::new();
    let steps = vec![Step::WaitSignal(wait_signal(CLOSE_LID_DONE_SIGNAL))];
    h.orch.start_task("T1", "plc", steps).unwrap();
    assert!(h.gate_armed(CLOSE_LID_DONE_SIGNAL, "plc").await);

    let gates = h.orch.gate_status();
    assert_eq!(gates.len(), 1);
    assert_eq!(gates[0].agent_id, "plc");
    assert!(h.orch.fulfill_gate(gates[0].id, Default::default()));
    assert!(!h.orch.fulfill_gate(gates[0].id, Default::default()));

    assert_eq!(h.finish("plc").await.status, TaskStatus::Completed);
}
