use axum::extract::ws::{Message, WebSocket};
use tandem_common::error::SyncError;
use tandem_common::protocol::ws::Envelope;

pub fn decode_message(raw: &str) -> Result<Envelope, SyncError> {
    Envelope::decode(raw)
}

pub fn encode_message(envelope: &Envelope) -> Result<String, SyncError> {
    envelope.encode()
}

pub async fn send_ws_message(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), ()> {
    let encoded = encode_message(envelope).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
