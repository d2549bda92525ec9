//! JSON command round-trips through the dispatcher.

use serde_json::{json, Value};

use labflow::actuator::MockResponse;
use labflow::ingress::Reply;
use labflow::TaskStatus;

use crate::fixtures::{payload, Harness};

fn send(h: &Harness, command: Value) -> Reply {
    h.dispatcher().handle_line(&command.to_string())
}

/// Test: Scan workflow driven entirely by commands
/// Given START_TASK for scan_qrcode
/// When the operator sends SCAN_QRCODE_ENTER_ID
/// Then GET_TASK_STATE reports completion with the derived bottle id
#[tokio::test]
async fn test_scan_workflow_over_commands() {
    let h = Harness::new();
    let reply = send(
        &h,
        json!({"cmd_id": "1", "cmd_type": "START_TASK",
               "params": {"agent_id": "robot_a", "workflow": "scan_qrcode", "task_id": "T-scan"}}),
    );
    assert!(reply.success, "{}", reply.message);
    assert!(h.gate_armed("SCAN_QRCODE_ENTER_ID", "robot_a").await);

    let reply = send(
        &h,
        json!({"cmd_id": "2", "cmd_type": "GATE_STATUS"}),
    );
    assert_eq!(reply.data[0]["signal"], json!("SCAN_QRCODE_ENTER_ID"));

    let reply = send(
        &h,
        json!({"cmd_id": "3", "cmd_type": "SCAN_QRCODE_ENTER_ID",
               "params": {"agent_id": "robot_a", "qrcode_id": "881", "type": "glass_bottle_500"}}),
    );
    assert_eq!(reply.cmd_id, "3");
    assert_eq!(reply.data["delivered"], json!(true));

    h.finish("robot_a").await;
    let reply = send(
        &h,
        json!({"cmd_id": "4", "cmd_type": "GET_TASK_STATE", "params": {"target_cmd_id": "T-scan"}}),
    );
    assert!(reply.success);
    assert_eq!(reply.data["status"], json!("completed"));
    assert_eq!(
        reply.data["side_channel_payload"]["bottle_id"],
        json!("glass_bottle_500_881")
    );
    assert!(reply.data["history"].as_array().unwrap().len() > 5);
}

/// Test: Controller reply data reaches the task state
/// Given cv_detect answers with bottle coordinates
/// When a task running it is queried with GET_TASK_STATE
/// Then the coordinates appear under the action name
#[tokio::test]
async fn test_reply_payload_visible_in_task_state() {
    let h = Harness::new();
    h.mock.script(
        "cv_detect",
        MockResponse::ok().with_payload(payload(json!({"x": 0.31, "y": 0.12, "count": 3}))),
    );
    let reply = send(
        &h,
        json!({"cmd_type": "START_TASK",
               "params": {"agent_id": "robot_a", "task_id": "T-cv",
                          "steps": [{"kind": "call", "code": "CV_DETECTING",
                                     "service": "/robot", "action": "cv_detect"}]}}),
    );
    assert!(reply.success, "{}", reply.message);
    h.finish("robot_a").await;

    let reply = send(
        &h,
        json!({"cmd_type": "GET_TASK_STATE", "params": {"task_id": "T-cv"}}),
    );
    assert!(reply.success);
    assert_eq!(reply.data["status"], json!("completed"));
    assert_eq!(
        reply.data["side_channel_payload"]["cv_detect"],
        json!({"x": 0.31, "y": 0.12, "count": 3})
    );
}

/// Test: Mismatched query names the agent's real task
/// Given robot_b running T1
/// When GET_TASK_STATE asks robot_b for T2
/// Then the reply fails with task_not_found and current_task_id T1
#[tokio::test]
async fn test_query_mismatch_reports_current_task() {
    let h = Harness::new();
    send(
        &h,
        json!({"cmd_type": "START_TASK",
               "params": {"agent_id": "robot_b", "workflow": "robot_action", "task_id": "T1",
                          "params": {"action_type": "B_STEP_2"}}}),
    );
    h.finish("robot_b").await;

    let reply = send(
        &h,
        json!({"cmd_id": "q", "cmd_type": "GET_TASK_STATE",
               "params": {"agent_id": "robot_b", "task_id": "T2"}}),
    );
    assert!(!reply.success);
    assert_eq!(reply.data["error"], json!("task_not_found"));
    assert_eq!(reply.data["current_task_id"], json!("T1"));
}

/// Test: Cancel and reset over commands
/// Given a task parked on a device signal
/// When CANCEL_TASK then RESET_AGENT are sent
/// Then the task ends Cancelled and the agent accepts a new task
#[tokio::test]
async fn test_cancel_and_reset_commands() {
    let h = Harness::new();
    let steps = json!([{"kind": "wait_signal", "code": "WAITING_DEVICE", "signal": "CLOSE_LID_DONE"}]);
    send(
        &h,
        json!({"cmd_type": "START_TASK", "params": {"agent_id": "plc", "task_id": "T1", "steps": steps.clone()}}),
    );
    assert!(h.gate_armed("CLOSE_LID_DONE", "plc").await);

    let reply = send(&h, json!({"cmd_type": "RESET_AGENT", "params": {"agent_id": "plc"}}));
    assert!(!reply.success);
    assert_eq!(reply.data["error"], json!("agent_busy"));

    let reply = send(&h, json!({"cmd_type": "CANCEL_TASK", "params": {"task_id": "T1"}}));
    assert_eq!(reply.data["cancelled"], json!(true));
    assert_eq!(h.finish("plc").await.status, TaskStatus::Cancelled);

    let reply = send(&h, json!({"cmd_type": "RESET_AGENT", "params": {"agent_id": "plc"}}));
    assert!(reply.success, "{}", reply.message);

    let reply = send(
        &h,
        json!({"cmd_type": "START_TASK", "params": {"agent_id": "plc", "task_id": "T2", "steps": steps}}),
    );
    assert!(reply.success, "{}", reply.message);
}

/// Test: Bad commands get error replies, never panics
/// Given unknown command types, unknown agents and invalid params
/// When they are dispatched
/// Then each reply carries success=false and the error kind
#[tokio::test]
async fn test_error_replies() {
    let h = Harness::new();
    let cases = [
        (json!({"cmd_type": "DANCE"}), "invalid_params"),
        (
            json!({"cmd_type": "START_TASK", "params": {"agent_id": "robot_z", "workflow": "scan_qrcode"}}),
            "unknown_agent",
        ),
        (
            json!({"cmd_type": "START_TASK", "params": {"agent_id": "robot_a", "workflow": "mix"}}),
            "unknown_workflow",
        ),
        (
            json!({"cmd_type": "START_TASK", "params": {"agent_id": "robot_b", "workflow": "transfer",
                                                          "params": {"from": "a"}}}),
            "invalid_params",
        ),
        (json!({"cmd_type": "GET_TASK_STATE", "params": {}}), "invalid_params"),
        (json!({"cmd_type": "FULFILL_SIGNAL", "params": {"agent_id": "plc"}}), "invalid_params"),
    ];
    for (command, kind) in cases {
        let reply = send(&h, command.clone());
        assert!(!reply.success, "{} unexpectedly succeeded", command);
        assert_eq!(reply.data["error"], json!(kind), "{}", command);
    }

    let reply = h.dispatcher().handle_line("]]");
    assert!(!reply.success);
    assert!(h.orch.tasks().is_empty());
}

/// Test: LIST_TASKS reports every agent with a task
#[tokio::test]
async fn test_list_tasks() {
    let h = Harness::new();
    for agent in ["robot_a", "robot_b"] {
        send(
            &h,
            json!({"cmd_type": "START_TASK", "params": {"agent_id": agent, "workflow": "transfer",
                                                          "params": {"from": "x", "to": "y"}}}),
        );
    }
    h.finish("robot_a").await;
    h.finish("robot_b").await;

    let reply = send(&h, json!({"cmd_type": "LIST_TASKS"}));
    let agents: Vec<&str> = reply
        .data
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["agent_id"].as_str())
        .collect();
    assert_eq!(agents, vec!["robot_a", "robot_b"]);
}
