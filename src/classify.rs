/// Marker that routes a connection to full-duplex forwarding.
pub const WEBSOCKET_UPGRADE_MARKER: &str = "Upgrade: websocket";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    WebSocket,
    Plain,
}

/// Classifies a connection from its decoded first chunk.
///
/// Case-sensitive substring match, no HTTP parsing: the marker counts
/// wherever it appears in the chunk, body included.
#[must_use]
pub fn classify(initial: &str) -> ConnectionKind {
    if initial.contains(WEBSOCKET_UPGRADE_MARKER) {
        ConnectionKind::WebSocket
    } else {
        ConnectionKind::Plain
    }
}
