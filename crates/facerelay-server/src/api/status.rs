use crate::error::Result;
use crate::relay::ConnectionSnapshot;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct GateStatus {
    pub capacity: usize,
    pub in_use: usize,
    pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub live_connections: usize,
    pub max_connections: usize,
    pub observers: usize,
    pub gate: GateStatus,
    pub devices: Vec<ConnectionSnapshot>,
}

pub async fn get_status(State(state): State<AppState>) -> Result<Json<RelayStatus>> {
    let devices = state.manager.snapshot().await;

    Ok(Json(RelayStatus {
        live_connections: devices.len(),
        max_connections: state.manager.max_connections(),
        observers: state.hub.observer_count().await,
        gate: GateStatus {
            capacity: state.gate.capacity(),
            in_use: state.gate.in_use(),
            pending: state.gate.pending(),
        },
        devices,
    }))
}
