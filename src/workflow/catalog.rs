//! Named workflows that `START_TASK` can launch.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::types::{ActionStep, Branch, PollStep, Step, WaitStep};
use crate::state::StepCode;
use crate::{Error, Payload, Result};

pub const ROBOT_A_SERVICE: &str = "/get_strawberry_service";
pub const ROBOT_B_SERVICE: &str = "/get_halfbodychemical_service";
pub const PLC_SERVICE: &str = "/plc_coil_service";

pub const NAVIGATION_TOPIC: &str = "/navigation_status";
pub const NAVIGATION_POINTER: &str = "/state/value";
pub const NAVIGATION_DONE: i64 = 5;
pub const NAVIGATION_FAILED: i64 = 6;

pub const DETECT_STATE_TOPIC: &str = "/plc/detect_state";
pub const CLEAN_STATE_TOPIC: &str = "/plc/clean_state";
pub const PLC_STATE_POINTER: &str = "/value";
/// Detection module asks for the first sample to be taken away.
pub const DETECT_SAMPLE_READY: i64 = 4;
pub const CLEAN_DONE: i64 = 3;

pub const SCAN_ENTER_ID_SIGNAL: &str = "SCAN_QRCODE_ENTER_ID";
pub const CLOSE_LID_DONE_SIGNAL: &str = "CLOSE_LID_DONE";

pub const SPLIT_AREA_TRANSFER: &str = "waiting_split_area_transfer";
pub const SPLIT_AREA_SPLIT: &str = "waiting_split_area_split";

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub required_params: &'static [&'static str],
}

pub const WORKFLOWS: &[WorkflowInfo] = &[
    WorkflowInfo {
        name: "scan_qrcode",
        description: "scan a bottle's qr code, record its id and stage it at the split table",
        required_params: &[],
    },
    WorkflowInfo {
        name: "split_liquid",
        description: "pour both tubes, then cap and clean in parallel before picking up",
        required_params: &[],
    },
    WorkflowInfo {
        name: "transfer",
        description: "move a bottle from one zone to another",
        required_params: &["from", "to"],
    },
    WorkflowInfo {
        name: "robot_action",
        description: "run one predefined robot B action",
        required_params: &["action_type"],
    },
];

/// Predefined single actions for robot B: (name, action, tube type, code).
const ROBOT_ACTIONS: &[(&str, &str, i64, StepCode)] = &[
    ("B_STEP_1", "pure_water", 1, StepCode::Pouring),
    ("B_STEP_2", "pure_water", 2, StepCode::Pouring),
    ("B_STEP_3", "place_reagent_bottle", -1, StepCode::PuttingDown),
    ("B_STEP_4", "pour_out_clean", 1, StepCode::Cleaning),
    ("B_STEP_5", "take_tube_rack", 1, StepCode::TransferringTube),
    ("B_STEP_6", "pour_out_clean", 2, StepCode::Cleaning),
    ("B_STEP_7", "take_tube_rack", 2, StepCode::TransferringTube),
];

pub fn find(name: &str) -> Option<&'static WorkflowInfo> {
    WORKFLOWS.iter().find(|w| w.name == name)
}

/// Expand a named workflow into its step list for `agent_id`.
pub fn build(name: &str, agent_id: &str, params: &Payload) -> Result<Vec<Step>> {
    let info = find(name).ok_or_else(|| Error::UnknownWorkflow(name.to_string()))?;
    let missing: Vec<&str> = info
        .required_params
        .iter()
        .copied()
        .filter(|p| !params.contains_key(*p))
        .collect();
    if !missing.is_empty() {
        return Err(Error::InvalidParams(format!(
            "{} requires: {}",
            name,
            missing.join(", ")
        )));
    }

    match name {
        "scan_qrcode" => Ok(scan_qrcode(params)),
        "split_liquid" => Ok(split_liquid(agent_id, params)),
        "transfer" => transfer(params),
        "robot_action" => robot_action(params),
        _ => Err(Error::UnknownWorkflow(name.to_string())),
    }
}

fn str_param<'a>(params: &'a Payload, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn navigate(position: &str) -> Vec<Step> {
    vec![
        Step::Call(
            ActionStep::new(StepCode::Navigating, ROBOT_A_SERVICE, "navigation_to_pose")
                .describe(format!("navigating to {}", position))
                .arg("position", position),
        ),
        Step::Poll(navigation_poll(position)),
    ]
}

fn navigation_poll(position: &str) -> PollStep {
    PollStep {
        code: StepCode::Navigating,
        description: format!("waiting to arrive at {}", position),
        topic: NAVIGATION_TOPIC.to_string(),
        pointer: NAVIGATION_POINTER.to_string(),
        done: vec![NAVIGATION_DONE],
        failed: vec![NAVIGATION_FAILED],
        agent: None,
        interval_ms: None,
        deadline_ms: None,
    }
}

fn plc_poll(plc: &str, code: StepCode, description: &str, topic: &str, done: i64) -> PollStep {
    PollStep {
        code,
        description: description.to_string(),
        topic: topic.to_string(),
        pointer: PLC_STATE_POINTER.to_string(),
        done: vec![done],
        failed: Vec::new(),
        agent: Some(plc.to_string()),
        interval_ms: None,
        deadline_ms: None,
    }
}

fn scan_qrcode(params: &Payload) -> Vec<Step> {
    let object_type = str_param(params, "object_type", "glass_bottle_500");
    let pose = str_param(params, "target_pose", "pose_0");
    let slot = params.get("slot").and_then(Value::as_i64).unwrap_or(0);

    let mut steps = navigate("scan_table");
    steps.extend([
        Step::Call(ActionStep::new(StepCode::CvDetecting, ROBOT_A_SERVICE, "cv_detect")),
        Step::Call(
            ActionStep::new(StepCode::Grabbing, ROBOT_A_SERVICE, "grab_object_scan_table")
                .describe(format!("grabbing bottle ({})", object_type))
                .arg("type", object_type)
                .arg("target_pose", pose),
        ),
        Step::Call(ActionStep::new(StepCode::Scanning, ROBOT_A_SERVICE, "scan")),
        Step::WaitSignal(
            WaitStep::new(StepCode::WaitingIdInput, SCAN_ENTER_ID_SIGNAL)
                .describe(format!("waiting for id of {} in slot {}", object_type, slot))
                .require(&["qrcode_id", "type"]),
        ),
        Step::Call(
            ActionStep::new(StepCode::Scanning, ROBOT_A_SERVICE, "pick_scan_back")
                .describe("retracting from scanner"),
        ),
        Step::Call(
            ActionStep::new(StepCode::PuttingToBack, ROBOT_A_SERVICE, "put_object_back")
                .describe(format!("putting to back platform slot_{}", slot))
                .arg("type", object_type)
                .arg("target_pose", format!("point_{}", slot)),
        ),
        Step::Call(ActionStep::new(
            StepCode::TurningBackFront,
            ROBOT_A_SERVICE,
            "back_to_front",
        )),
    ]);
    steps.extend(navigate("split_table"));
    steps.push(Step::zone_call(
        SPLIT_AREA_TRANSFER,
        ActionStep::new(StepCode::PuttingDown, ROBOT_A_SERVICE, "put_down_split_table")
            .arg("target_pose", "pick_point_0"),
    ));
    steps
}

fn split_liquid(agent_id: &str, params: &Payload) -> Vec<Step> {
    let partner = str_param(params, "partner", "robot_a");
    let plc = str_param(params, "plc", "plc");

    let capping = Branch::new(
        "capping",
        vec![
            Step::Call(
                ActionStep::new(StepCode::PuttingDown, ROBOT_B_SERVICE, "place_reagent_bottle")
                    .describe("returning sample bottle")
                    .arg("type", -1),
            ),
            Step::Call(
                ActionStep::new(StepCode::PuttingDown, ROBOT_A_SERVICE, "place_to_equipment")
                    .describe("placing bottle on capper")
                    .on(partner),
            ),
            Step::Call(
                ActionStep::new(StepCode::ClosingLid, PLC_SERVICE, "close_start").on(plc),
            ),
            Step::WaitSignal(
                WaitStep::new(StepCode::WaitingDevice, CLOSE_LID_DONE_SIGNAL)
                    .describe("waiting for capper")
                    .on(plc),
            ),
            Step::Call(
                ActionStep::new(StepCode::PuttingDown, ROBOT_A_SERVICE, "place_to_shelf")
                    .describe("placing capped bottle on shelf")
                    .on(partner),
            ),
        ],
    );

    let cleaning = Branch::new(
        "cleaning",
        vec![
            Step::Call(ActionStep::new(StepCode::Detecting, PLC_SERVICE, "detect_start").on(plc)),
            Step::Poll(plc_poll(
                plc,
                StepCode::WaitingDevice,
                "waiting for detection result",
                DETECT_STATE_TOPIC,
                DETECT_SAMPLE_READY,
            )),
            Step::Call(
                ActionStep::new(StepCode::Cleaning, ROBOT_B_SERVICE, "pour_out_clean")
                    .describe("moving tube 1 to cleaner")
                    .arg("type", 1),
            ),
            Step::Call(ActionStep::new(StepCode::Cleaning, PLC_SERVICE, "clean_start").on(plc)),
            Step::Poll(plc_poll(
                plc,
                StepCode::WaitingDevice,
                "waiting for cleaner",
                CLEAN_STATE_TOPIC,
                CLEAN_DONE,
            )),
            Step::Call(
                ActionStep::new(StepCode::TransferringTube, ROBOT_B_SERVICE, "take_tube_rack")
                    .describe("racking tube 1")
                    .arg("type", 1),
            ),
        ],
    );

    vec![
        Step::Call(
            ActionStep::new(StepCode::Pouring, ROBOT_B_SERVICE, "pure_water")
                .describe("pouring tube 1")
                .arg("type", 1),
        ),
        Step::Call(
            ActionStep::new(StepCode::Pouring, ROBOT_B_SERVICE, "pure_water")
                .describe("pouring tube 2")
                .arg("type", 2),
        ),
        Step::parallel("capping and cleaning", vec![capping, cleaning]),
        Step::zone_call(
            SPLIT_AREA_SPLIT,
            ActionStep::new(StepCode::Grabbing, ROBOT_B_SERVICE, "pick_split_area")
                .describe(format!("{} picking up next bottle", agent_id)),
        ),
    ]
}

fn transfer(params: &Payload) -> Result<Vec<Step>> {
    let from = params
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidParams("from must be a zone name".to_string()))?;
    let to = params
        .get("to")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidParams("to must be a zone name".to_string()))?;
    if from == to {
        return Err(Error::InvalidParams(format!(
            "transfer source and target are both {}",
            from
        )));
    }

    Ok(vec![
        Step::zone_call(
            from,
            ActionStep::new(StepCode::Grabbing, ROBOT_A_SERVICE, "grab_object")
                .describe(format!("grabbing from {}", from))
                .arg("target_pose", from),
        ),
        Step::zone_call(
            to,
            ActionStep::new(StepCode::PuttingDown, ROBOT_A_SERVICE, "put_object")
                .describe(format!("putting to {}", to))
                .arg("target_pose", to),
        ),
    ])
}

fn robot_action(params: &Payload) -> Result<Vec<Step>> {
    let name = params
        .get("action_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidParams("action_type must be a string".to_string()))?;
    let (_, action, tube, code) = ROBOT_ACTIONS
        .iter()
        .find(|(n, ..)| *n == name)
        .ok_or_else(|| Error::InvalidParams(format!("unknown action_type: {}", name)))?;

    let mut step = ActionStep::new(*code, ROBOT_B_SERVICE, action).describe(format!("{} {}", name, action));
    if let Some(seconds) = params.get("timeout").and_then(Value::as_u64) {
        step = step.timeout(Duration::from_secs(seconds));
    }
    Ok(vec![Step::Call(step.arg("type", *tube))])
}
