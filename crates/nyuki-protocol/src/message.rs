//! Bus messages.
//!
//! Only the logical shape lives here; how a transport encodes it on the wire
//! is the transport's business.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::jid::Jid;

/// HTTP methods a capability may declare and a bus request may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Patch,
        Method::Delete,
        Method::Head,
        Method::Options,
        Method::Trace,
        Method::Connect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported HTTP method: {0}")]
pub struct MethodParseError(pub String);

impl FromStr for Method {
    type Err = MethodParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(raw))
            .ok_or_else(|| MethodParseError(raw.to_owned()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Point-to-point message.
    Chat,
    /// Message fanned out by a room.
    GroupChat,
    /// Delivery failure returned by the server, same id as the failed message.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub method: Method,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub status: u16,
    /// Raw body; JSON for well-behaved capabilities but not guaranteed.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Broadcast payload, JSON encoded.
    Event { json: String },
    Request(RequestBody),
    Response(ResponseBody),
    Error { condition: String, text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id; replies reuse the id of the message they answer.
    pub id: String,
    pub from: Jid,
    pub to: Jid,
    pub kind: MessageKind,
    pub body: MessageBody,
}

impl Message {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn event(from: Jid, room: Jid, json: String) -> Self {
        Self {
            id: Self::new_id(),
            from,
            to: room,
            kind: MessageKind::GroupChat,
            body: MessageBody::Event { json },
        }
    }

    pub fn request(from: Jid, to: Jid, request: RequestBody) -> Self {
        Self {
            id: Self::new_id(),
            from,
            to,
            kind: MessageKind::Chat,
            body: MessageBody::Request(request),
        }
    }

    /// Answer to `self`, keeping its id.
    pub fn reply(&self, response: ResponseBody) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: MessageKind::Chat,
            body: MessageBody::Response(response),
        }
    }

    /// Delivery failure for `self`, sent back to its author.
    pub fn error_reply(&self, condition: &str, text: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            kind: MessageKind::Error,
            body: MessageBody::Error {
                condition: condition.to_owned(),
                text: text.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("patch".parse::<Method>(), Ok(Method::Patch));
        assert_eq!("CONNECT".parse::<Method>(), Ok(Method::Connect));
        assert!("BREW".parse::<Method>().is_err());
    }

    #[test]
    fn reply_keeps_id_and_swaps_addresses() {
        let request = Message::request(
            "timon@localhost/nyuki".parse().unwrap(),
            "pumbaa@localhost/nyuki".parse().unwrap(),
            RequestBody {
                method: Method::Get,
                endpoint: "/message".to_owned(),
                json: None,
            },
        );
        let reply = request.reply(ResponseBody {
            status: 200,
            body: "{}".to_owned(),
        });
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.to, request.from);
        assert_eq!(reply.from, request.to);
    }
}
