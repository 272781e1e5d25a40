use std::time::Instant;

use crate::identity::DeviceIdentifier;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    ConnectionLost(/* reason */ String),
}

/// Everything the transport hands to the ingestion loop.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Message {
        topic: String,
        payload: Vec<u8>,
        received_at: Instant,
    },
    Connection(ConnectionState),
}

#[derive(Clone, Debug)]
pub struct SightingEvent {
    pub observed: DeviceIdentifier,
    pub received_at: Instant,
}
