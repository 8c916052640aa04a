//! The message record and constructors for the messages the client sends.

use std::fmt;
use std::sync::Arc;

use crate::field;

/// Protocol version announced in [`client_hello`].
pub const EXPECTED_VERSION: &str = "2.0";

/// A named, ordered set of fields with an optional raw payload trailer.
///
/// Messages are immutable once built: the `with_*` methods consume and
/// return the message. Cloning is cheap for the payload, which is shared.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Message name, e.g. `ClientPut`.
    name: String,
    /// Fields in insertion order; keys are unique.
    fields: Vec<(String, String)>,
    /// Raw bytes following the `Data` terminator.
    payload: Option<Arc<[u8]>>,
}

impl Message {
    /// Creates a message with no fields and no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            payload: None,
        }
    }

    /// Sets `key` to `value`, replacing an existing value in place.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    /// Attaches a payload and declares its length in `DataLength`.
    #[must_use]
    pub fn with_payload(self, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        let mut msg = self.with_field(field::DATA_LENGTH, data.len().to_string());
        msg.payload = Some(data);
        msg
    }

    /// Message name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of `key`, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates over fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Payload bytes, if the message carries any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("payload_len", &self.payload.as_ref().map(|p| p.len()))
            .finish()
    }
}

/// Origin of the data inserted by a `ClientPut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UploadFrom {
    /// Data follows the request as its payload.
    Direct,
    /// Data is read by the node from a local file.
    Disk,
    /// Data is a redirect to another key.
    Redirect,
}

impl UploadFrom {
    /// Wire token for the `UploadFrom` field.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Disk => "disk",
            Self::Redirect => "redirect",
        }
    }
}

impl fmt::Display for UploadFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First message on every connection.
pub fn client_hello(name: &str) -> Message {
    Message::new("ClientHello")
        .with_field("Name", name)
        .with_field("ExpectedVersion", EXPECTED_VERSION)
}

/// Asks the node to start a disk-access verification for `directory`.
pub fn test_dda_request(directory: &str, want_read: bool, want_write: bool) -> Message {
    Message::new("TestDDARequest")
        .with_field(field::DIRECTORY, directory)
        .with_field("WantReadDirectory", want_read.to_string())
        .with_field("WantWriteDirectory", want_write.to_string())
}

/// Answers a verification challenge with the content read from the probe file.
pub fn test_dda_response(directory: &str, read_content: &str) -> Message {
    Message::new("TestDDAResponse")
        .with_field(field::DIRECTORY, directory)
        .with_field("ReadContent", read_content)
}
