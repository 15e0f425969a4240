use crate::error::ProtocolError;
use crate::message::{ClientEnvelope, ServerEnvelope};

// JSON both ways. Binary frames are accepted when they hold UTF-8 JSON.

pub fn decode_client_text(text: &str) -> Result<ClientEnvelope, ProtocolError> {
    serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

pub fn decode_client_bytes(bytes: &[u8]) -> Result<ClientEnvelope, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|err| ProtocolError::Malformed(err.to_string()))
}

pub fn encode_server(envelope: &ServerEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
