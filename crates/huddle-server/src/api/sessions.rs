use crate::error::{AppError, Result};
use crate::sfu::NegotiationState;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use huddle_protocol::{ProducerInfo, RtpCapabilities};
use uuid::Uuid;

pub async fn list_producers(State(state): State<AppState>) -> Json<Vec<ProducerInfo>> {
    Json(state.fanout.list_active_publications().await)
}

pub async fn get_rtp_capabilities(State(state): State<AppState>) -> Json<RtpCapabilities> {
    Json(state.capabilities.get_capabilities())
}

pub async fn get_party_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NegotiationState>> {
    let party_id = Uuid::parse_str(&id)
        .map_err(|_| AppError::NotFound(format!("party {}", id)))?;

    if !state.connections.is_connected(party_id).await {
        return Err(AppError::NotFound(format!("party {}", party_id)));
    }

    Ok(Json(state.coordinator.negotiation_state(party_id).await))
}
