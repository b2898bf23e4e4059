use crate::error::Result;
use axum::extract::ws::Utf8Bytes;
use k8s_openapi::serde_json;
use serde::Serialize;

/// A pre-serialized outbound message. Cloning shares the underlying buffer,
/// so one encoding is fanned out to every client unchanged.
pub type Frame = Utf8Bytes;

/// Wire envelope: `{"type": "<resource kind>", "payload": <upstream event>}`
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub payload: &'a T,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub const fn new(kind: &'a str, payload: &'a T) -> Self {
        Self { kind, payload }
    }

    /// Serialize once into a frame ready for broadcast
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON
    pub fn encode(&self) -> Result<Frame> {
        let json = serde_json::to_string(self)?;
        Ok(Frame::from(json))
    }
}
