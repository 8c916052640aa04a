//! Typed view of the inbound messages the client reacts to.

use crate::field;
use crate::message::Message;

/// `ProtocolError` code asking the client to prove disk access first.
pub const DDA_DENIED: u32 = 25;

/// An inbound message, parsed by name.
///
/// Messages with an unknown name, or missing a field their variant
/// requires, are kept verbatim as [`Reply::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Reply {
    /// Node accepted the `ClientHello`.
    NodeHello {
        /// Node version string, if announced.
        version: Option<String>,
    },
    /// Node refused the connection because the client name is taken.
    CloseConnectionDuplicateClientName,
    /// An insert completed.
    PutSuccessful {
        /// Correlation token of the insert.
        identifier: String,
        /// Resulting key.
        uri: String,
    },
    /// An insert failed.
    PutFailed {
        /// Correlation token of the insert.
        identifier: String,
        /// Failure code.
        code: Option<u32>,
        /// Human-readable failure reason.
        description: Option<String>,
    },
    /// The node rejected a request.
    ProtocolError {
        /// Correlation token, absent for connection-level errors.
        identifier: Option<String>,
        /// Error code (see [`DDA_DENIED`]).
        code: u32,
        /// Human-readable error reason.
        description: Option<String>,
        /// Whether the node closes the connection after this error.
        fatal: bool,
    },
    /// Node's challenge in the disk-access verification.
    TestDdaReply {
        /// Directory under verification.
        directory: String,
        /// Probe file the client must read and echo back.
        read_filename: Option<String>,
        /// File the client must create to prove write access.
        write_filename: Option<String>,
        /// Content to write into `write_filename`.
        content_to_write: Option<String>,
    },
    /// Disk-access verification finished.
    TestDdaComplete {
        /// Directory under verification.
        directory: String,
        /// Whether the node may read from `directory`.
        read_allowed: bool,
        /// Whether the node may write to `directory`.
        write_allowed: bool,
    },
    /// Any other message.
    Other(Message),
}

impl Reply {
    /// Parses `msg` into its typed form.
    pub fn parse(msg: Message) -> Self {
        let parsed = match msg.name() {
            "NodeHello" => Some(Self::NodeHello {
                version: owned(&msg, "Version"),
            }),
            "CloseConnectionDuplicateClientName" => Some(Self::CloseConnectionDuplicateClientName),
            "PutSuccessful" => owned(&msg, field::IDENTIFIER).zip(owned(&msg, field::URI)).map(
                |(identifier, uri)| Self::PutSuccessful { identifier, uri },
            ),
            "PutFailed" => owned(&msg, field::IDENTIFIER).map(|identifier| Self::PutFailed {
                identifier,
                code: number(&msg, field::CODE),
                description: owned(&msg, "CodeDescription"),
            }),
            "ProtocolError" => number(&msg, field::CODE).map(|code| Self::ProtocolError {
                identifier: owned(&msg, field::IDENTIFIER),
                code,
                description: owned(&msg, "CodeDescription"),
                fatal: flag(&msg, "Fatal"),
            }),
            "TestDDAReply" => owned(&msg, field::DIRECTORY).map(|directory| Self::TestDdaReply {
                directory,
                read_filename: owned(&msg, "ReadFilename"),
                write_filename: owned(&msg, "WriteFilename"),
                content_to_write: owned(&msg, "ContentToWrite"),
            }),
            "TestDDAComplete" => {
                owned(&msg, field::DIRECTORY).map(|directory| Self::TestDdaComplete {
                    directory,
                    read_allowed: flag(&msg, "ReadDirectoryAllowed"),
                    write_allowed: flag(&msg, "WriteDirectoryAllowed"),
                })
            }
            _ => None,
        };
        parsed.unwrap_or(Self::Other(msg))
    }

    /// Message name as it appears on the wire.
    pub fn name(&self) -> &str {
        match self {
            Self::NodeHello { .. } => "NodeHello",
            Self::CloseConnectionDuplicateClientName => "CloseConnectionDuplicateClientName",
            Self::PutSuccessful { .. } => "PutSuccessful",
            Self::PutFailed { .. } => "PutFailed",
            Self::ProtocolError { .. } => "ProtocolError",
            Self::TestDdaReply { .. } => "TestDDAReply",
            Self::TestDdaComplete { .. } => "TestDDAComplete",
            Self::Other(msg) => msg.name(),
        }
    }
}

fn owned(msg: &Message, key: &str) -> Option<String> {
    msg.field(key).map(str::to_owned)
}

fn number(msg: &Message, key: &str) -> Option<u32> {
    msg.field(key).and_then(|v| v.trim().parse().ok())
}

fn flag(msg: &Message, key: &str) -> bool {
    msg.field(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
