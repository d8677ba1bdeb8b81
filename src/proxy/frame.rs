//! Frame conversion between the two sides of a session
//!
//! The client side is an axum server socket and the backend side is a
//! tokio-tungstenite client socket. Both carry the same WebSocket frames,
//! so conversion only re-tags the message; payloads are never inspected.

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as BackendCloseFrame;
use tokio_tungstenite::tungstenite::Message as BackendMessage;

/// What a pump should do with one converted frame
#[derive(Debug, PartialEq)]
pub enum Forward<T> {
    /// Write it and keep reading
    Relay(T),
    /// Write it, then stop: the peer started the closing handshake
    Final(T),
    /// Nothing to write
    Skip,
}

/// Convert a frame read from the client into one for the backend
pub fn from_client(msg: ClientMessage) -> Forward<BackendMessage> {
    match msg {
        ClientMessage::Text(text) => Forward::Relay(BackendMessage::Text(text.as_str().into())),
        ClientMessage::Binary(data) => Forward::Relay(BackendMessage::Binary(data)),
        ClientMessage::Ping(data) => Forward::Relay(BackendMessage::Ping(data)),
        ClientMessage::Pong(data) => Forward::Relay(BackendMessage::Pong(data)),
        ClientMessage::Close(frame) => Forward::Final(BackendMessage::Close(frame.map(|f| {
            BackendCloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().into(),
            }
        }))),
    }
}

/// Convert a frame read from the backend into one for the client
pub fn from_backend(msg: BackendMessage) -> Forward<ClientMessage> {
    match msg {
        BackendMessage::Text(text) => Forward::Relay(ClientMessage::Text(text.as_str().into())),
        BackendMessage::Binary(data) => Forward::Relay(ClientMessage::Binary(data)),
        BackendMessage::Ping(data) => Forward::Relay(ClientMessage::Ping(data)),
        BackendMessage::Pong(data) => Forward::Relay(ClientMessage::Pong(data)),
        BackendMessage::Close(frame) => Forward::Final(ClientMessage::Close(frame.map(|f| {
            ClientCloseFrame {
                code: u16::from(f.code),
                reason: f.reason.as_str().into(),
            }
        }))),
        // Raw frames only appear on the write path
        BackendMessage::Frame(_) => Forward::Skip,
    }
}
