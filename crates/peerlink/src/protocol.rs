//! Wire vocabulary spoken with the signaling relay.
//!
//! Every frame is one UTF-8 text websocket message holding an [`Envelope`]:
//! `{"type": "...", "payload": {...}, "requestId": "..."}`. The `type` field
//! selects the payload schema; `requestId` correlates an offer with the answer
//! produced for it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::P2pError;

pub const MSG_AUTH: &str = "auth";
pub const MSG_AUTH_OK: &str = "auth_ok";
pub const MSG_AUTH_ERROR: &str = "auth_error";
pub const MSG_APP_REGISTER: &str = "app_register";
pub const MSG_APP_REGISTERED: &str = "app_registered";
pub const MSG_OFFER: &str = "offer";
pub const MSG_ANSWER: &str = "answer";
pub const MSG_ICE: &str = "ice";
pub const MSG_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(rename = "apiKey")]
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOkPayload {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(rename = "type", alias = "accountType", default)]
    pub account_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRegisterPayload {
    pub name: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRegisteredPayload {
    #[serde(rename = "appId")]
    pub app_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: String,
    #[serde(rename = "appId", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// The candidate is opaque to the relay; it is either a candidate-init object
/// or a bare candidate string depending on the remote implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
}

/// Decoded form of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Auth(AuthPayload),
    AuthOk(AuthOkPayload),
    AuthError(AuthErrorPayload),
    AppRegister(AppRegisterPayload),
    AppRegistered(AppRegisteredPayload),
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Ice(IcePayload),
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth(_) => MSG_AUTH,
            Message::AuthOk(_) => MSG_AUTH_OK,
            Message::AuthError(_) => MSG_AUTH_ERROR,
            Message::AppRegister(_) => MSG_APP_REGISTER,
            Message::AppRegistered(_) => MSG_APP_REGISTERED,
            Message::Offer(_) => MSG_OFFER,
            Message::Answer(_) => MSG_ANSWER,
            Message::Ice(_) => MSG_ICE,
            Message::Error(_) => MSG_ERROR,
        }
    }

    fn payload_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Message::Auth(p) => serde_json::to_value(p),
            Message::AuthOk(p) => serde_json::to_value(p),
            Message::AuthError(p) => serde_json::to_value(p),
            Message::AppRegister(p) => serde_json::to_value(p),
            Message::AppRegistered(p) => serde_json::to_value(p),
            Message::Offer(p) => serde_json::to_value(p),
            Message::Answer(p) => serde_json::to_value(p),
            Message::Ice(p) => serde_json::to_value(p),
            Message::Error(p) => serde_json::to_value(p),
        }
    }
}

impl Envelope {
    pub fn new(message: &Message, request_id: impl Into<String>) -> Result<Self, P2pError> {
        Ok(Self {
            kind: message.kind().to_string(),
            payload: message.payload_value()?,
            request_id: request_id.into(),
        })
    }

    pub fn to_text(&self) -> Result<String, P2pError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, P2pError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decodes the payload according to `type`. Unknown types yield `Ok(None)`
    /// so newer relays can add message kinds without breaking older clients.
    pub fn decode(&self) -> Result<Option<Message>, P2pError> {
        let message = match self.kind.as_str() {
            MSG_AUTH => Message::Auth(self.payload_as()?),
            MSG_AUTH_OK => Message::AuthOk(self.payload_as()?),
            MSG_AUTH_ERROR => Message::AuthError(self.payload_as()?),
            MSG_APP_REGISTER => Message::AppRegister(self.payload_as()?),
            MSG_APP_REGISTERED => Message::AppRegistered(self.payload_as()?),
            MSG_OFFER => Message::Offer(self.payload_as()?),
            MSG_ANSWER => Message::Answer(self.payload_as()?),
            MSG_ICE => Message::Ice(self.payload_as()?),
            MSG_ERROR => Message::Error(self.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T, P2pError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
