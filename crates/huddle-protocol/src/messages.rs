use serde::{Deserialize, Serialize};

use crate::types::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, PartyId, ProducerInfo,
    RtpCapabilities, RtpParameters,
};

/// Messages sent from client to server via WebSocket
///
/// Requests that expect an answer carry an optional `request_id`, echoed back
/// in the matching [`ServerMessage`] so clients can pair responses with calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for the router's negotiable codecs
    GetRouterRtpCapabilities {
        #[serde(default)]
        request_id: Option<u64>,
    },

    /// Allocate the party's relay transport
    CreateTransport {
        #[serde(default)]
        request_id: Option<u64>,
    },

    /// Complete the DTLS handshake parameters for the party's transport
    ConnectTransport {
        #[serde(default)]
        request_id: Option<u64>,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    /// Publish a stream through the party's transport
    Produce {
        #[serde(default)]
        request_id: Option<u64>,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Subscribe to another party's published stream
    Consume {
        #[serde(default)]
        request_id: Option<u64>,
        transport_id: String,
        producer_id: String,
        /// Receiving capabilities; the router's own are assumed when absent
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },

    /// Stop the party's published stream
    StopStream,

    /// List current publications
    GetProducers {
        #[serde(default)]
        request_id: Option<u64>,
    },

    /// Release everything the party holds without closing the socket
    Leave,

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the socket is accepted
    Welcome { user_id: PartyId },

    /// Error message
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },

    /// Pong response to ping
    Pong,

    RouterRtpCapabilities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        rtp_capabilities: RtpCapabilities,
    },

    TransportCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        id: String,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },

    TransportConnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },

    Produced {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        id: String,
    },

    Consumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    Producers {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        producers: Vec<ProducerInfo>,
    },

    /// A party started publishing a stream
    NewStream { stream_id: String, user_id: PartyId },

    /// A party's published stream went away
    StreamStopped { user_id: PartyId },
}
