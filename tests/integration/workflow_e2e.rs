//! End-to-end workflow tests.
//!
//! These tests run the built-in workflows against the mock controller and
//! check the final task state, the recorded history and the calls that
//! reached the controller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use labflow::actuator::{MockActuator, MockResponse};
use labflow::state::StepCode;
use labflow::workflow::catalog::{SPLIT_AREA_SPLIT, SPLIT_AREA_TRANSFER};
use labflow::workflow::{Step, CLOSE_LID_DONE_SIGNAL, NAVIGATION_TOPIC, SCAN_ENTER_ID_SIGNAL};
use labflow::zone::AcquireOutcome;
use labflow::{Error, Payload, TaskQuery, TaskStatus};

use crate::fixtures::{fast_config, payload, wait_signal, wait_until, Harness};

/// Test: Zone held across an external wait
/// Given robot_a runs T1 which takes the transfer side, then waits on gate G
/// When robot_b asks for the split side while robot_a waits
/// Then robot_b stays blocked until the signal arrives and the block ends,
/// and T1 completes with the signal payload
#[tokio::test]
async fn test_zone_held_while_waiting_for_signal() {
    let h = Harness::new();
    let block = Step::zoned(SPLIT_AREA_TRANSFER, vec![Step::WaitSignal(wait_signal("G"))]);
    h.orch.start_task("T1", "robot_a", vec![block]).unwrap();

    assert!(h.gate_armed("G", "robot_a").await);
    assert!(h.status_reaches("robot_a", TaskStatus::WaitingExternal).await);
    assert_eq!(
        h.orch.zones().occupant(SPLIT_AREA_TRANSFER).as_deref(),
        Some("robot_a")
    );

    let zones = Arc::clone(h.orch.zones());
    let blocked = tokio::spawn({
        let zones = Arc::clone(&zones);
        async move {
            let cancel = CancellationToken::new();
            zones
                .acquire("robot_b", SPLIT_AREA_SPLIT, Duration::from_secs(5), &cancel)
                .await
        }
    });
    assert!(
        wait_until(Duration::from_secs(2), || {
            zones.status().waiting.contains_key(SPLIT_AREA_SPLIT)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let signaller = {
        let orch = Arc::clone(&h.orch);
        std::thread::spawn(move || orch.fulfill_signal("G", "robot_a", payload(json!({"id": "X1"}))))
    };
    assert!(signaller.join().unwrap().unwrap());

    let done = h.finish("robot_a").await;
    assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.side_channel_payload.unwrap()["id"], json!("X1"));
    assert_eq!(blocked.await.unwrap(), AcquireOutcome::Acquired);
    assert_eq!(zones.occupant(SPLIT_AREA_SPLIT).as_deref(), Some("robot_b"));
    assert!(!zones.is_occupied(SPLIT_AREA_TRANSFER));

    let state = h.orch.get_task_state(&TaskQuery::by_task("T1")).unwrap();
    assert_eq!(state.status, TaskStatus::Completed);
}

/// Test: Scan workflow runs through the id gate
/// Given robot_a starts scan_qrcode
/// When the operator enters the bottle id
/// Then the task completes with the id deposited and the staging zone free
#[tokio::test]
async fn test_scan_qrcode_completes_after_id_entry() {
    let h = Harness::new();
    h.orch
        .start_workflow("robot_a", "scan_qrcode", &Payload::new(), Some("T-scan"))
        .unwrap();

    assert!(h.gate_armed(SCAN_ENTER_ID_SIGNAL, "robot_a").await);
    assert!(h.status_reaches("robot_a", TaskStatus::WaitingExternal).await);
    assert_eq!(h.state("robot_a").current_step.code, StepCode::WaitingIdInput);

    let delivered = h
        .orch
        .fulfill_signal(
            SCAN_ENTER_ID_SIGNAL,
            "robot_a",
            payload(json!({"qrcode_id": "QR-881", "type": "glass_bottle_500"})),
        )
        .unwrap();
    assert!(delivered);

    let done = h.finish("robot_a").await;
    assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.current_step.code, StepCode::Completed);
    assert_eq!(
        done.side_channel_payload.unwrap()["qrcode_id"],
        json!("QR-881")
    );

    let codes: Vec<StepCode> = done.history.iter().map(|e| e.step).collect();
    assert_eq!(codes.first(), Some(&StepCode::Navigating));
    assert_eq!(codes.last(), Some(&StepCode::PuttingDown));
    assert!(codes.contains(&StepCode::WaitingIdInput));
    assert_eq!(codes.len(), 12);

    assert!(!h.orch.zones().is_occupied(SPLIT_AREA_TRANSFER));
    assert_eq!(h.mock.call_count("put_down_split_table"), 1);
}

/// Test: Navigation failure ends the task
/// Given the navigation topic reports the failure code
/// When scan_qrcode polls it
/// Then the task ends in Error without reaching the scanner
#[tokio::test]
async fn test_navigation_failure_is_reported() {
    let h = Harness::with_parts(fast_config(), MockActuator::new());
    h.mock
        .publish(NAVIGATION_TOPIC, payload(json!({"state": {"value": 6}})));

    h.orch
        .start_workflow("robot_a", "scan_qrcode", &Payload::new(), None)
        .unwrap();
    let done = h.finish("robot_a").await;

    assert_eq!(done.status, TaskStatus::Error);
    assert!(done.error_message.unwrap().contains("reported status 6"));
    assert_eq!(h.mock.call_count("scan"), 0);
}

/// Test: Split workflow joins both branches
/// Given robot_b starts split_liquid
/// When the capper reports the lid closed
/// Then both branches finish and the split-side zone is used and released
#[tokio::test]
async fn test_split_liquid_joins_branches() {
    let h = Harness::new();
    h.orch
        .start_workflow("robot_b", "split_liquid", &Payload::new(), Some("T-split"))
        .unwrap();

    assert!(h.gate_armed(CLOSE_LID_DONE_SIGNAL, "plc").await);

    assert!(h
        .orch
        .fulfill_signal(CLOSE_LID_DONE_SIGNAL, "plc", Payload::new())
        .unwrap());

    let done = h.finish("robot_b").await;
    assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error_message);

    for action in ["place_to_shelf", "take_tube_rack", "pick_split_area"] {
        assert_eq!(h.mock.call_count(action), 1, "{} was not called once", action);
    }
    let shelf = h
        .mock
        .calls()
        .into_iter()
        .find(|c| c.action == "place_to_shelf")
        .unwrap();
    assert_eq!(shelf.agent_id, "robot_a");
    assert!(!h.orch.zones().is_occupied(SPLIT_AREA_SPLIT));

    let descriptions: Vec<&str> = done.history.iter().map(|e| e.description.as_str()).collect();
    assert!(descriptions.iter().any(|d| d.starts_with("[cleaning]")));
}

/// Test: Actuator failure in one branch fails the parallel block
/// Given the cleaner rejects its start command
/// When split_liquid reaches the parallel block
/// Then the task ends in Error naming the failed branch
#[tokio::test]
async fn test_split_liquid_branch_failure() {
    let h = Harness::new();
    h.mock.script("clean_start", MockResponse::fail("coil 12 not responding"));

    h.orch
        .start_workflow("robot_b", "split_liquid", &Payload::new(), None)
        .unwrap();
    let done = h.finish("robot_b").await;

    assert_eq!(done.status, TaskStatus::Error);
    let message = done.error_message.unwrap();
    assert!(message.contains("cleaning"), "{}", message);
    assert!(message.contains("coil 12 not responding"), "{}", message);
    assert_eq!(h.mock.call_count("pick_split_area"), 0);
    assert!(h.orch.gate_status().is_empty());
}

/// Test: Second task for a busy agent is rejected
/// Given robot_b is running a slow action
/// When another task is started for robot_b
/// Then AgentBusy names the running task and the first task is unaffected
#[tokio::test]
async fn test_busy_agent_rejected() {
    let h = Harness::new();
    h.mock
        .script("pure_water", MockResponse::ok().after(Duration::from_millis(200)));
    let mut params = Payload::new();
    params.insert("action_type".to_string(), json!("B_STEP_1"));

    h.orch
        .start_workflow("robot_b", "robot_action", &params, Some("T-first"))
        .unwrap();
    let err = h
        .orch
        .start_workflow("robot_b", "robot_action", &params, Some("T-second"))
        .unwrap_err();
    match err {
        Error::AgentBusy { agent_id, task_id } => {
            assert_eq!(agent_id, "robot_b");
            assert_eq!(task_id, "T-first");
        }
        other => panic!("expected AgentBusy, got {:?}", other),
    }

    let done = h.finish("robot_b").await;
    assert_eq!(done.task_id, "T-first");
    assert_eq!(done.status, TaskStatus::Completed);

    // Once finished the agent accepts new work.
    h.orch
        .start_workflow("robot_b", "robot_action", &params, Some("T-third"))
        .unwrap();
    assert_eq!(h.finish("robot_b").await.task_id, "T-third");
}

/// Test: Actuator timeout becomes a step timeout
/// Given an action that never answers within its timeout
/// When the robot action runs
/// Then the task ends in Error with the timeout in the message
#[tokio::test]
async fn test_actuator_timeout() {
    let h = Harness::new();
    h.mock
        .script("pure_water", MockResponse::ok().after(Duration::from_secs(30)));
    let mut params = Payload::new();
    params.insert("action_type".to_string(), json!("B_STEP_1"));
    params.insert("timeout".to_string(), json!(1));

    h.orch
        .start_workflow("robot_b", "robot_action", &params, None)
        .unwrap();
    let done = h.finish("robot_b").await;

    assert_eq!(done.status, TaskStatus::Error);
    assert!(done.error_message.unwrap().contains("timed out"));
}
