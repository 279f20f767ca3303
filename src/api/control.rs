//! The control surface: list modes, document their parameters, switch the
//! active mode, adjust a running mode's parameters, and inspect the latest
//! decision snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use crate::controller::Controller;
use crate::modes;
use crate::platform::PlatformInfo;

pub async fn get_modes(State(_ctrl): State<Arc<Controller>>) -> Json<serde_json::Value> {
    let names: Vec<&str> = modes::MODES.iter().map(|m| m.name).collect();
    Json(json!(names))
}

pub async fn get_mode_info(
    State(_ctrl): State<Arc<Controller>>,
    Path(name): Path<String>,
) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let spec = modes::find(&name).ok_or_else(|| ApiError::NotFound(format!("mode {name}")))?;
    let mut info: BTreeMap<String, String> = spec
        .params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    info.insert("_summary".to_string(), spec.summary.to_string());
    Ok(Json(info))
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

pub async fn set_mode(
    State(ctrl): State<Arc<Controller>>,
    Json(req): Json<SetModeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctrl.change_mode(&req.mode, req.params)?;
    Ok(Json(json!(true)))
}

#[derive(Debug, Deserialize)]
pub struct SetParamRequest {
    pub param: String,
    pub value: serde_json::Value,
}

pub async fn set_mode_param(
    State(ctrl): State<Arc<Controller>>,
    Json(req): Json<SetParamRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctrl.change_mode_param(&req.param, req.value)?;
    Ok(Json(json!(true)))
}

pub async fn get_state(State(ctrl): State<Arc<Controller>>) -> Json<serde_json::Value> {
    let mut state = ctrl.state_json();
    let platform = PlatformInfo::get();
    state["platform"] = json!({
        "machine_id": platform.machine_id,
        "portal_id": platform.portal_id,
        "current_mode": ctrl.current_mode(),
    });
    Json(state)
}
