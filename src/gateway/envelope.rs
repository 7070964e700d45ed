//! Response envelopes and reply delivery.
//!
//! Every request-style event answers with exactly one [`Envelope`]. Where it
//! goes depends on how the client asked: with an `ack` id the envelope comes
//! back as a direct reply ([`AckReply`]), otherwise it is emitted on a named
//! channel to the same connection ([`ChannelReply`]).

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::cipher::{CipherError, PayloadCipher};

/// Generic message used when a handler fails in a way the client cannot act on.
pub const UNKNOWN_ERROR: &str = "Unknown Error. Check server logs!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    ClientError,
    ServerError,
    NoData,
}

impl ResponseKind {
    pub fn status(self) -> u16 {
        match self {
            ResponseKind::Success | ResponseKind::NoData => 200,
            ResponseKind::ClientError => 400,
            ResponseKind::ServerError => 500,
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            ResponseKind::Success => "Success",
            ResponseKind::NoData => "No data",
            ResponseKind::ClientError => "Bad Request",
            ResponseKind::ServerError => "Server Error",
        }
    }

    fn error_type(self) -> Option<&'static str> {
        match self {
            ResponseKind::ClientError => Some("Validation Error"),
            ResponseKind::ServerError => Some("Server Error"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub status: u16,
    pub message: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    pub encrypted: bool,
}

impl Envelope {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Build an envelope and run its payload through the cipher.
///
/// For error kinds `text` is the error message; for success kinds it
/// overrides the default status message.
pub fn build_response(
    kind: ResponseKind,
    channel: &str,
    payload: Value,
    text: Option<&str>,
    cipher: &PayloadCipher,
) -> Result<Envelope, CipherError> {
    let error = kind.error_type().map(|kind_name| ErrorDescriptor {
        kind: kind_name.to_string(),
        message: text.unwrap_or(UNKNOWN_ERROR).to_string(),
    });
    let message = match (&error, text) {
        (None, Some(text)) => text.to_string(),
        _ => kind.default_message().to_string(),
    };
    let payload = if kind == ResponseKind::NoData {
        Value::Null
    } else {
        payload
    };
    let (data, encrypted) = cipher.encode(channel, payload)?;
    Ok(Envelope {
        status: kind.status(),
        message,
        data,
        error,
        encrypted,
    })
}

/// Server-error envelope that bypasses the cipher. Used when the cipher itself
/// is what failed.
pub fn plain_server_error(message: &str) -> Envelope {
    Envelope {
        status: ResponseKind::ServerError.status(),
        message: ResponseKind::ServerError.default_message().to_string(),
        data: Value::Null,
        error: Some(ErrorDescriptor {
            kind: "Server Error".to_string(),
            message: message.to_string(),
        }),
        encrypted: false,
    }
}

#[derive(Serialize)]
struct AckFrame<'a> {
    ack: u64,
    data: &'a Envelope,
}

#[derive(Serialize)]
struct EventFrame<'a, T: Serialize> {
    event: &'a str,
    data: &'a T,
}

/// Where an envelope goes once built.
pub trait Reply: Send + Sync {
    /// Hand the envelope to the connection. A closed connection drops it.
    fn deliver(&self, channel: &str, envelope: &Envelope);

    /// Whether the client is waiting on this particular answer.
    fn is_direct(&self) -> bool {
        false
    }
}

/// Direct answer to a request that carried an `ack` id.
pub struct AckReply {
    tx: mpsc::UnboundedSender<Message>,
    ack: u64,
}

impl AckReply {
    pub fn new(tx: mpsc::UnboundedSender<Message>, ack: u64) -> Self {
        Self { tx, ack }
    }
}

impl Reply for AckReply {
    fn deliver(&self, _channel: &str, envelope: &Envelope) {
        let _ = send_json(
            &self.tx,
            &AckFrame {
                ack: self.ack,
                data: envelope,
            },
        );
    }

    fn is_direct(&self) -> bool {
        true
    }
}

/// Fire-and-forget emit on a named channel to the originating connection.
pub struct ChannelReply {
    tx: mpsc::UnboundedSender<Message>,
}

impl ChannelReply {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }
}

impl Reply for ChannelReply {
    fn deliver(&self, channel: &str, envelope: &Envelope) {
        let _ = send_json(
            &self.tx,
            &EventFrame {
                event: channel,
                data: envelope,
            },
        );
    }
}

/// Serialize an `{event, data}` frame once, for broadcast fan-out.
pub fn event_frame_text<T: Serialize>(event: &str, data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EventFrame { event, data })
}

pub(crate) fn send_json<T: Serialize>(
    tx: &mpsc::UnboundedSender<Message>,
    payload: &T,
) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

/// Build, encrypt and deliver one envelope. Error envelopes are logged.
pub fn respond(
    reply: &dyn Reply,
    cipher: &PayloadCipher,
    kind: ResponseKind,
    channel: &str,
    payload: Value,
    text: Option<&str>,
) {
    let envelope = match build_response(kind, channel, payload, text, cipher) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::error!(target: "gateway", channel, error = %err, "failed to encode reply");
            plain_server_error(UNKNOWN_ERROR)
        }
    };
    if let Some(error) = &envelope.error {
        tracing::error!(target: "gateway", channel, "{}", error.message);
    }
    reply.deliver(channel, &envelope);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, GatewayConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn plain_cipher() -> PayloadCipher {
        PayloadCipher::new(Arc::new(ConfigStore::new(GatewayConfig::default()))).unwrap()
    }

    fn recv_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv().unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_client_error_wire_shape() {
        let envelope = build_response(
            ResponseKind::ClientError,
            "error",
            Value::Null,
            Some("No chat GUID provided"),
            &plain_cipher(),
        )
        .unwrap();
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "status": 400,
          "message": "Bad Request",
          "data": null,
          "error": {
            "type": "Validation Error",
            "message": "No chat GUID provided"
          },
          "encrypted": false
        }
        "#);
    }

    #[test]
    fn test_success_has_no_error_field() {
        let envelope = build_response(
            ResponseKind::Success,
            "chats",
            json!([{"guid": "a"}]),
            None,
            &plain_cipher(),
        )
        .unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status"], 200);
        assert_eq!(value["message"], "Success");
        assert_eq!(value["data"][0]["guid"], "a");
        assert!(value.get("error").is_none());
        assert_eq!(value["encrypted"], false);
    }

    #[test]
    fn test_no_data_discards_payload() {
        let envelope = build_response(
            ResponseKind::NoData,
            "last-chat-message",
            json!({"ignored": true}),
            None,
            &plain_cipher(),
        )
        .unwrap();
        assert_eq!(envelope.data, Value::Null);
        assert_eq!(envelope.message, "No data");
        assert!(!envelope.is_error());
    }

    #[test]
    fn test_server_error_defaults_message() {
        let envelope = build_response(
            ResponseKind::ServerError,
            "send-message-error",
            Value::Null,
            None,
            &plain_cipher(),
        )
        .unwrap();
        assert_eq!(envelope.status, 500);
        let error = envelope.error.unwrap();
        assert_eq!(error.kind, "Server Error");
        assert_eq!(error.message, UNKNOWN_ERROR);
    }

    #[test]
    fn test_ack_and_channel_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cipher = plain_cipher();

        respond(
            &AckReply::new(tx.clone(), 7),
            &cipher,
            ResponseKind::Success,
            "chat",
            json!({"guid": "x"}),
            None,
        );
        let frame = recv_json(&mut rx);
        assert_eq!(frame["ack"], 7);
        assert_eq!(frame["data"]["data"]["guid"], "x");
        assert!(frame.get("event").is_none());

        respond(
            &ChannelReply::new(tx),
            &cipher,
            ResponseKind::ClientError,
            "error",
            Value::Null,
            Some("bad"),
        );
        let frame = recv_json(&mut rx);
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["error"]["message"], "bad");
    }

    #[test]
    fn test_delivery_to_closed_connection_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        respond(
            &ChannelReply::new(tx),
            &plain_cipher(),
            ResponseKind::Success,
            "chats",
            json!([]),
            None,
        );
    }
}
