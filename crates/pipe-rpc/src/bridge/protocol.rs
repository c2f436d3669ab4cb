//! Wire protocol types shared by the registry and its workers.
//!
//! Everything on the wire is an [`Envelope`]: two correlation ids, a type tag
//! and an opaque JSON payload. The type tag is either an application method
//! name or one of the reserved [`ControlTag`]s.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(::uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &::uuid::Uuid {
                &self.0
            }

            pub fn parse(s: &str) -> ::std::result::Result<Self, ::uuid::Error> {
                Ok(Self(::uuid::Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

pub(crate) use uuid_id;

uuid_id! {
    /// Shared by every message of one logical call, including fan-out copies.
    RequestId
}

uuid_id! {
    /// Unique per physical exchange. A reply reuses the id of the request it
    /// answers; this is the key of the correlation table.
    MessageId
}

/// Reserved values of [`Envelope::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTag {
    /// First frame on every worker connection.
    RegisterWorker,
    /// Reply carrying an [`ErrorResponse`].
    Error,
    /// Reply for a call that produced no value.
    Null,
}

impl ControlTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterWorker => "RegisterWorker",
            Self::Error => "Error",
            Self::Null => "Null",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RegisterWorker" => Some(Self::RegisterWorker),
            "Error" => Some(Self::Error),
            "Null" => Some(Self::Null),
            _ => None,
        }
    }
}

impl fmt::Display for ControlTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the `RegisterWorker` handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    /// The worker's own channel name. Kept for bookkeeping only.
    pub pipe_name: String,
}

/// Payload of an `Error` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub message: String,
}

/// Payload of a `Null` reply: an empty JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullResponse {}

/// The unit of communication on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    request_id: RequestId,
    message_id: MessageId,
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default, with = "base64_payload")]
    payload: Vec<u8>,
}

impl Envelope {
    /// Start a new logical call: fresh request and message ids.
    pub fn request<P: Serialize + ?Sized>(
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, RpcError> {
        Ok(Self::from_raw(kind, serde_json::to_vec(payload)?))
    }

    /// Build a request around an already-encoded JSON payload.
    pub fn from_raw(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id: RequestId::new(),
            message_id: MessageId::new(),
            kind: kind.into(),
            payload,
        }
    }

    pub fn register_worker(request: &RegisterWorkerRequest) -> Result<Self, RpcError> {
        Self::request(ControlTag::RegisterWorker.as_str(), request)
    }

    /// Answer this envelope. Both ids are copied so the caller's correlation
    /// table can match the reply.
    pub fn reply<P: Serialize + ?Sized>(
        &self,
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, RpcError> {
        Ok(self.reply_raw(kind, serde_json::to_vec(payload)?))
    }

    pub fn reply_raw(&self, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            request_id: self.request_id,
            message_id: self.message_id,
            kind: kind.into(),
            payload,
        }
    }

    pub fn null_reply(&self) -> Self {
        self.reply_raw(ControlTag::Null.as_str(), b"{}".to_vec())
    }

    pub fn error_reply(&self, message: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "Message": message.into() });
        self.reply_raw(ControlTag::Error.as_str(), payload.to_string().into_bytes())
    }

    /// Copy for one target of a fan-out call: same logical request, new
    /// physical exchange.
    pub fn fan_out_copy(&self) -> Self {
        Self {
            request_id: self.request_id,
            message_id: MessageId::new(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Method name or control tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn control_tag(&self) -> Option<ControlTag> {
        ControlTag::parse(&self.kind)
    }

    pub fn is_error(&self) -> bool {
        self.control_tag() == Some(ControlTag::Error)
    }

    pub fn is_null(&self) -> bool {
        self.control_tag() == Some(ControlTag::Null)
    }

    /// Decode the whole payload as one value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            RpcError::Payload(format!("cannot decode {} payload: {}", self.kind, e))
        })
    }

    /// Decode the payload as a positional argument list of exactly
    /// `expected` entries.
    pub fn decode_args(&self, expected: usize) -> Result<Vec<serde_json::Value>, RpcError> {
        let args = match self.decode::<serde_json::Value>()? {
            serde_json::Value::Array(args) => args,
            // A call without arguments may be encoded as null.
            serde_json::Value::Null => Vec::new(),
            other => {
                return Err(RpcError::Payload(format!(
                    "expected an argument array for {}, got {}",
                    self.kind, other
                )));
            }
        };
        if args.len() != expected {
            return Err(RpcError::ParameterCountMismatch {
                expected,
                actual: args.len(),
            });
        }
        Ok(args)
    }

    /// Message carried by an `Error` reply, if this is one.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        Some(
            self.decode::<ErrorResponse>()
                .map(|e| e.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&self.payload).into_owned()),
        )
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Type={}] RequestId={}; MessageId={}; Payload:{}",
            self.kind,
            self.request_id,
            self.message_id,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(kind: &str, payload: &[u8]) -> Envelope {
        Envelope {
            request_id: RequestId(
                uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            ),
            message_id: MessageId(
                uuid::Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap(),
            ),
            kind: kind.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn method_call_serializes() {
        let env = fixed("Echo", br#"["hi"]"#);
        insta::assert_json_snapshot!(env, @r#"
        {
          "RequestId": "550e8400-e29b-41d4-a716-446655440000",
          "MessageId": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
          "Type": "Echo",
          "Payload": "WyJoaSJd"
        }
        "#);
    }

    #[test]
    fn register_worker_payload_serializes() {
        let req = RegisterWorkerRequest {
            worker_id: "W1".to_string(),
            pipe_name: "pipe-rpc.worker.W1".to_string(),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "WorkerId": "W1",
          "PipeName": "pipe-rpc.worker.W1"
        }
        "#);

        let env = Envelope::register_worker(&req).unwrap();
        assert_eq!(env.control_tag(), Some(ControlTag::RegisterWorker));
        assert_eq!(env.decode::<RegisterWorkerRequest>().unwrap(), req);
    }

    #[test]
    fn error_reply_serializes() {
        let env = fixed("Echo", b"[]").error_reply("boom");
        insta::assert_json_snapshot!(env, @r#"
        {
          "RequestId": "550e8400-e29b-41d4-a716-446655440000",
          "MessageId": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
          "Type": "Error",
          "Payload": "eyJNZXNzYWdlIjoiYm9vbSJ9"
        }
        "#);
        assert_eq!(env.error_message().as_deref(), Some("boom"));
    }

    #[test]
    fn null_reply_carries_empty_object() {
        let req = fixed("Ping", b"[]");
        let reply = req.null_reply();
        assert!(reply.is_null());
        assert_eq!(reply.payload(), b"{}");
        assert_eq!(reply.message_id(), req.message_id());
        assert_eq!(reply.request_id(), req.request_id());
        assert_eq!(reply.decode::<NullResponse>().unwrap(), NullResponse {});
    }

    #[test]
    fn reply_copies_both_ids() {
        let req = Envelope::request("Echo", &("hi",)).unwrap();
        let reply = req.reply("Echo", "hi").unwrap();
        assert_eq!(reply.request_id(), req.request_id());
        assert_eq!(reply.message_id(), req.message_id());
        assert_eq!(reply.decode::<String>().unwrap(), "hi");
    }

    #[test]
    fn fan_out_copy_shares_request_id_only() {
        let req = Envelope::request("Echo", &("hi",)).unwrap();
        let copy = req.fan_out_copy();
        assert_eq!(copy.request_id(), req.request_id());
        assert_ne!(copy.message_id(), req.message_id());
        assert_eq!(copy.kind(), "Echo");
        assert_eq!(copy.payload(), req.payload());
    }

    #[test]
    fn decode_args_checks_arity() {
        let env = Envelope::request("Add", &(1, 2)).unwrap();
        assert_eq!(env.decode_args(2).unwrap().len(), 2);
        assert_eq!(
            env.decode_args(3),
            Err(RpcError::ParameterCountMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn decode_args_accepts_null_for_no_arguments() {
        let env = Envelope::request("Ping", &()).unwrap();
        assert!(env.decode_args(0).unwrap().is_empty());
    }

    #[test]
    fn missing_payload_decodes_as_empty() {
        let json = r#"{
            "RequestId": "550e8400-e29b-41d4-a716-446655440000",
            "MessageId": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            "Type": "Null"
        }"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert!(env.is_null());
        assert!(env.payload().is_empty());
    }

    #[test]
    fn control_tags_are_case_sensitive() {
        assert_eq!(ControlTag::parse("Error"), Some(ControlTag::Error));
        assert_eq!(ControlTag::parse("error"), None);
        assert!(fixed("Echo", b"[]").control_tag().is_none());
    }

    #[test]
    fn display_shows_type_and_ids() {
        let env = fixed("Echo", br#"["hi"]"#);
        assert_eq!(
            env.to_string(),
            "[Type=Echo] RequestId=550e8400-e29b-41d4-a716-446655440000; \
             MessageId=6ba7b810-9dad-11d1-80b4-00c04fd430c8; Payload:[\"hi\"]"
        );
    }
}
