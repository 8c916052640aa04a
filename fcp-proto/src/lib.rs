//! Wire protocol for talking to a Freenet node over FCP.
//!
//! A message is a name line, a run of `Key=Value` lines and a terminator
//! (`EndMessage`, or `Data` followed by `DataLength` raw bytes). The
//! codec works over any buffered async byte stream (TCP, Unix socket,
//! in-memory duplex).

mod codec;
mod message;
mod reply;

pub use codec::{read_message, write_message};
pub use message::{
    EXPECTED_VERSION, Message, UploadFrom, client_hello, test_dda_request, test_dda_response,
};
pub use reply::{DDA_DENIED, Reply};

/// Field names shared by the messages the client sends and receives.
pub mod field {
    /// Correlation token of a command.
    pub const IDENTIFIER: &str = "Identifier";
    /// Target or resulting key.
    pub const URI: &str = "URI";
    /// Payload origin of a `ClientPut`.
    pub const UPLOAD_FROM: &str = "UploadFrom";
    /// Local file path for disk uploads.
    pub const FILENAME: &str = "Filename";
    /// Redirect target for redirect uploads.
    pub const TARGET_URI: &str = "TargetURI";
    /// Filename stored alongside the inserted data.
    pub const TARGET_FILENAME: &str = "TargetFilename";
    /// Declared payload length.
    pub const DATA_LENGTH: &str = "DataLength";
    /// Directory named by the verification handshake.
    pub const DIRECTORY: &str = "Directory";
    /// Numeric error or failure code.
    pub const CODE: &str = "Code";
}
