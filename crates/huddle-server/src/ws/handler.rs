use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{ClientMessage, PartyId, ServerMessage};
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let party_id = state.lifecycle.on_connect(tx).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests of one party are handled one at a time, in arrival order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", party_id, e);
                        state
                            .connections
                            .send_to_party(
                                party_id,
                                &ServerMessage::Error {
                                    request_id: None,
                                    message: format!("Invalid message format: {}", e),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                if let Some(reply) = handle_client_message(&state, party_id, client_msg).await {
                    state.connections.send_to_party(party_id, &reply).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for party {}: {}", party_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.lifecycle.on_disconnect(party_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Party {} disconnected from WebSocket", party_id);
}

fn failed(party_id: PartyId, request: &str, request_id: Option<u64>, error: AppError) -> ServerMessage {
    tracing::warn!("{} from party {} failed: {}", request, party_id, error);
    error.to_message(request_id)
}

/// Route one request to the coordinator; returns the reply, if the request has one
pub async fn handle_client_message(
    state: &AppState,
    party_id: PartyId,
    message: ClientMessage,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::GetRouterRtpCapabilities { request_id } => {
            Some(ServerMessage::RouterRtpCapabilities {
                request_id,
                rtp_capabilities: state.capabilities.get_capabilities(),
            })
        }
        ClientMessage::CreateTransport { request_id } => {
            Some(match state.coordinator.create_transport(party_id).await {
                Ok(transport) => ServerMessage::TransportCreated {
                    request_id,
                    id: transport.id,
                    ice_parameters: transport.ice_parameters,
                    ice_candidates: transport.ice_candidates,
                    dtls_parameters: transport.dtls_parameters,
                },
                Err(e) => failed(party_id, "create_transport", request_id, e),
            })
        }
        ClientMessage::ConnectTransport {
            request_id,
            transport_id,
            dtls_parameters,
        } => Some(
            match state
                .coordinator
                .connect_transport(party_id, Some(&transport_id), dtls_parameters)
                .await
            {
                Ok(()) => ServerMessage::TransportConnected { request_id },
                Err(e) => failed(party_id, "connect_transport", request_id, e),
            },
        ),
        ClientMessage::Produce {
            request_id,
            transport_id,
            kind,
            rtp_parameters,
        } => Some(
            match state
                .coordinator
                .produce(party_id, Some(&transport_id), kind, rtp_parameters)
                .await
            {
                Ok(id) => ServerMessage::Produced { request_id, id },
                Err(e) => failed(party_id, "produce", request_id, e),
            },
        ),
        ClientMessage::Consume {
            request_id,
            transport_id,
            producer_id,
            rtp_capabilities,
        } => Some(
            match state
                .coordinator
                .consume(party_id, Some(&transport_id), &producer_id, rtp_capabilities)
                .await
            {
                Ok(consumer) => ServerMessage::Consumed {
                    request_id,
                    id: consumer.id,
                    producer_id: consumer.producer_id,
                    kind: consumer.kind,
                    rtp_parameters: consumer.rtp_parameters,
                },
                Err(e) => failed(party_id, "consume", request_id, e),
            },
        ),
        ClientMessage::StopStream => {
            if let Err(e) = state.coordinator.stop_producing(party_id).await {
                tracing::warn!("stop_stream from party {} failed: {}", party_id, e);
            }
            None
        }
        ClientMessage::GetProducers { request_id } => Some(ServerMessage::Producers {
            request_id,
            producers: state.fanout.discover().await,
        }),
        ClientMessage::Leave => {
            let report = state.lifecycle.release(party_id).await;
            tracing::info!(
                "Party {} left, released {} resources",
                party_id,
                report.released.len()
            );
            None
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
