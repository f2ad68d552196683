use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// A named event with an opaque payload.
///
/// - `name` is the routing key workers use to pick handlers; it only has to be
///   unique within one bus deployment
/// - `data` is an opaque byte blob; producers normally fill it with
///   [`Event::encode_data`] and workers read it back with [`Event::decode_data`]
///
/// The payload encoding is self-describing (JSON), so any `Serialize` value can
/// be carried and decoded into any compatible `Deserialize` shape (including a
/// dynamic [`serde_json::Value`]) without registering types up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    #[serde(default)]
    data: Vec<u8>,
}

impl Event {
    /// Create an event from an already-encoded payload.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Create an event and encode `value` as its payload.
    pub fn with_data<T>(name: impl Into<String>, value: &T) -> CodecResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let mut event = Self::new(name, Vec::new());
        event.encode_data(value)?;
        Ok(event)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.name, self.data)
    }

    /// Replace the payload with the encoding of `value`.
    pub fn encode_data<T>(&mut self, value: &T) -> CodecResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.data = serde_json::to_vec(value).map_err(|e| CodecError::encode(e.to_string()))?;
        Ok(())
    }

    /// Decode the payload into `T`.
    pub fn decode_data<T>(&self) -> CodecResult<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.data).map_err(|e| CodecError::decode(e.to_string()))
    }

    /// Decode the payload without a target type (maps, sequences, primitives).
    pub fn data_value(&self) -> CodecResult<serde_json::Value> {
        self.decode_data()
    }

    /// Serialize the whole event (`{name, data}`) for a log record or queue message.
    pub fn to_wire(&self) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CodecError::wire(e.to_string()))
    }

    /// Parse an event from a log record or queue message.
    pub fn from_wire(bytes: &[u8]) -> CodecResult<Self> {
        let event: Event =
            serde_json::from_slice(bytes).map_err(|e| CodecError::wire(e.to_string()))?;
        if event.name.is_empty() {
            return Err(CodecError::EmptyName);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct CoolEventData {
        customer_id: String,
        user_id: i64,
        permissions: Vec<String>,
        attributes: HashMap<String, serde_json::Value>,
    }

    fn cool_data() -> CoolEventData {
        CoolEventData {
            customer_id: "custy-asdf".to_string(),
            user_id: 7,
            permissions: vec!["read".into(), "write".into(), "admin".into()],
            attributes: HashMap::from([("cool".to_string(), serde_json::Value::Bool(true))]),
        }
    }

    #[test]
    fn structured_payload_survives_the_wire() {
        let event = Event::with_data("cool", &cool_data()).unwrap();

        // Send the event through the wire format and back.
        let bytes = event.to_wire().unwrap();
        let received = Event::from_wire(&bytes).unwrap();
        assert_eq!(received, event);

        let decoded: CoolEventData = received.decode_data().unwrap();
        assert_eq!(decoded.customer_id, "custy-asdf");
        assert_eq!(decoded.user_id, 7);
        assert_eq!(decoded.permissions, vec!["read", "write", "admin"]);
        assert_eq!(decoded.attributes["cool"], serde_json::Value::Bool(true));
        assert_eq!(decoded, cool_data());
    }

    #[test]
    fn payload_decodes_into_a_dynamic_value() {
        let event = Event::with_data("cool", &cool_data()).unwrap();
        let value = event.data_value().unwrap();

        assert_eq!(value["CustomerId"], "custy-asdf");
        assert_eq!(value["Permissions"][2], "admin");
        assert_eq!(value["Attributes"]["cool"], true);
    }

    #[test]
    fn decoding_into_the_wrong_shape_fails() {
        let event = Event::with_data("cool", &vec![1, 2, 3]).unwrap();
        let err = event.decode_data::<CoolEventData>().unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn garbage_on_the_wire_is_rejected() {
        assert!(matches!(
            Event::from_wire(b"\x00\x01not-json").unwrap_err(),
            CodecError::Wire(_)
        ));
        assert_eq!(
            Event::from_wire(br#"{"name":"","data":[]}"#).unwrap_err(),
            CodecError::EmptyName
        );
    }

    #[test]
    fn missing_data_defaults_to_empty() {
        let event = Event::from_wire(br#"{"name":"ping"}"#).unwrap();
        assert_eq!(event.name(), "ping");
        assert!(event.data().is_empty());
    }
}
