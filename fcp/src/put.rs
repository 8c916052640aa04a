//! The `ClientPut` command: builder, payload sources and the reply
//! sequence, including the disk-access verification detour.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use fcp_proto::{DDA_DENIED, Message, Reply, UploadFrom, field};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace, warn};

use crate::engine::{Correlation, Deferred, Engine, Outbox, ReplySequence};
use crate::identifier::next_identifier;
use crate::{Error, Result};

/// Sent instead of the probe content when the probe file cannot be read.
const READ_FAILED: &str = "failed-to-read";

/// Longest probe line read back to the node (4 KiB).
const MAX_PROBE_LINE: u64 = 4 * 1024;

/// A key produced by a successful insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    /// The key's URI.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boxed payload reader for direct uploads.
type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// Where the inserted data comes from.
#[non_exhaustive]
pub enum UploadSource {
    /// The node reads a local file.
    Disk(PathBuf),
    /// The data is sent inline; `length` bytes are read from `reader`.
    Direct {
        /// Payload stream.
        reader: BoxRead,
        /// Declared payload length.
        length: u64,
    },
    /// The insert is a redirect to another key.
    Redirect(String),
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk(path) => f.debug_tuple("Disk").field(path).finish(),
            Self::Direct { length, .. } => f
                .debug_struct("Direct")
                .field("length", length)
                .finish_non_exhaustive(),
            Self::Redirect(uri) => f.debug_tuple("Redirect").field(uri).finish(),
        }
    }
}

/// Builder for a `ClientPut` command.
///
/// Exactly one payload source must be set before [`launch`](Self::launch).
///
/// ```no_run
/// # async fn demo(client: fcp::Client) -> fcp::Result<()> {
/// let _key = client
///     .put()
///     .from_file("/srv/site/index.html")
///     .named("index.html")
///     .launch("CHK@")?
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "a PutBuilder does nothing until .launch() is called"]
pub struct PutBuilder {
    /// Engine the command is launched on.
    engine: Engine,
    /// Every source set so far; valid only with exactly one.
    sources: Vec<UploadSource>,
    /// Overrides the filename stored with the data.
    target_filename: Option<String>,
}

impl PutBuilder {
    /// Creates a builder launching on `engine`.
    pub(crate) const fn new(engine: Engine) -> Self {
        Self {
            engine,
            sources: Vec::new(),
            target_filename: None,
        }
    }

    /// Uploads the file at `path`, read by the node itself.
    pub fn from_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(UploadSource::Disk(path.into()));
        self
    }

    /// Uploads `length` bytes read from `reader`.
    pub fn from_stream(mut self, reader: impl AsyncRead + Send + Unpin + 'static, length: u64) -> Self {
        self.sources.push(UploadSource::Direct {
            reader: Box::new(reader),
            length,
        });
        self
    }

    /// Uploads `data` inline.
    pub fn from_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        self.from_stream(std::io::Cursor::new(data), length)
    }

    /// Inserts a redirect to `uri`.
    pub fn redirect_to(mut self, uri: impl Into<String>) -> Self {
        self.sources.push(UploadSource::Redirect(uri.into()));
        self
    }

    /// Stores the data under `filename` instead of the node's default.
    pub fn named(mut self, filename: impl Into<String>) -> Self {
        self.target_filename = Some(filename.into());
        self
    }

    /// Launches the insert to `uri` and returns its pending key.
    ///
    /// Fails with [`Error::Precondition`] when zero or several payload
    /// sources were set; nothing is sent in that case. The result
    /// resolves to `None` when the node reports failure or the connection
    /// closes.
    pub fn launch(mut self, uri: &str) -> Result<Deferred<Option<Key>>> {
        let source = match self.sources.len() {
            0 => return Err(Error::Precondition("no payload source set")),
            1 => self.sources.remove(0),
            _ => return Err(Error::Precondition("more than one payload source set")),
        };

        let identifier = next_identifier();
        let mut put = Message::new("ClientPut")
            .with_field(field::URI, uri)
            .with_field(field::IDENTIFIER, identifier.as_str());

        let (directory, payload) = match source {
            UploadSource::Disk(path) => {
                let path = std::path::absolute(path)?;
                let filename = path
                    .to_str()
                    .ok_or(Error::Precondition("file path is not valid UTF-8"))?;
                put = put
                    .with_field(field::UPLOAD_FROM, UploadFrom::Disk.as_str())
                    .with_field(field::FILENAME, filename);
                (parent_directory(&path), None)
            }
            UploadSource::Redirect(target) => {
                put = put
                    .with_field(field::UPLOAD_FROM, UploadFrom::Redirect.as_str())
                    .with_field(field::TARGET_URI, target);
                (None, None)
            }
            UploadSource::Direct { reader, length } => {
                put = put.with_field(field::UPLOAD_FROM, UploadFrom::Direct.as_str());
                (None, Some((reader, length)))
            }
        };
        if let Some(name) = self.target_filename {
            put = put.with_field(field::TARGET_FILENAME, name);
        }

        debug!(%identifier, uri, "building ClientPut");
        let sequence = PutSequence::new(directory);
        Ok(match payload {
            None => self.engine.launch(put, sequence),
            Some((reader, length)) => self
                .engine
                .launch_with(attach_payload(put, reader, length), sequence),
        })
    }
}

/// Buffers exactly `length` bytes of `reader` as the message payload.
fn attach_payload(
    put: Message,
    mut reader: BoxRead,
    length: u64,
) -> impl Future<Output = Result<Message>> + Send + 'static {
    async move {
        let len = usize::try_from(length)
            .map_err(|_| Error::Precondition("payload length exceeds address space"))?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await?;
        Ok(put.with_payload(data))
    }
}

/// Parent directory of `path` as the node will name it.
fn parent_directory(path: &Path) -> Option<String> {
    path.parent()
        .and_then(Path::to_str)
        .map(str::to_owned)
}

/// Phase of a `ClientPut` conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutState {
    /// Not sent yet.
    Idle,
    /// Waiting for the insert's outcome.
    AwaitingResult,
    /// Verification requested; waiting for the node's challenge.
    AwaitingHandshakeReply,
    /// Challenge answered; waiting for the node's verdict.
    AwaitingHandshakeComplete,
    /// Terminal.
    Finished,
}

/// State of one `ClientPut` conversation.
#[derive(Debug)]
pub(crate) struct PutSequence {
    /// Current phase.
    state: PutState,
    /// Correlation token of the command.
    identifier: String,
    /// Directory to verify; set for disk uploads only.
    directory: Option<String>,
    /// The `ClientPut`, resent verbatim after verification.
    original: Option<Message>,
    /// Whether a verification already completed.
    verified: bool,
    /// Resulting key.
    key: Option<Key>,
}

impl PutSequence {
    /// Creates a sequence; `directory` is the parent of a disk upload's file.
    pub(crate) const fn new(directory: Option<String>) -> Self {
        Self {
            state: PutState::Idle,
            identifier: String::new(),
            directory,
            original: None,
            verified: false,
            key: None,
        }
    }

    fn finish(&mut self) {
        self.state = PutState::Finished;
    }

    fn owns(&self, identifier: &str) -> bool {
        identifier == self.identifier
    }

    fn verifies(&self, directory: &str) -> bool {
        self.directory.as_deref() == Some(directory)
    }

    /// Handles a protocol error addressed to this command.
    async fn protocol_error(&mut self, code: u32, outbox: &Outbox) -> Result<()> {
        let verifiable = code == DDA_DENIED
            && !self.verified
            && self.state == PutState::AwaitingResult;
        match self.directory.as_deref() {
            Some(directory) if verifiable => {
                debug!(identifier = %self.identifier, directory, "disk access verification required");
                outbox
                    .send(&fcp_proto::test_dda_request(directory, true, true))
                    .await?;
                self.state = PutState::AwaitingHandshakeReply;
            }
            _ => {
                debug!(identifier = %self.identifier, code, "put rejected");
                self.finish();
            }
        }
        Ok(())
    }

    /// Answers the node's verification challenge.
    async fn challenge(
        &mut self,
        read_filename: Option<String>,
        write_filename: Option<String>,
        content_to_write: Option<String>,
        outbox: &Outbox,
    ) -> Result<()> {
        let Some(directory) = self.directory.clone() else {
            return Ok(());
        };
        if let (Some(path), Some(content)) = (write_filename, content_to_write) {
            if let Err(e) = tokio::fs::write(&path, content).await {
                warn!(path, error = %e, "failed to write verification file");
            }
        }
        let content = match read_filename {
            Some(path) => read_first_line(&path).await.unwrap_or_else(|e| {
                warn!(path, error = %e, "failed to read verification file");
                READ_FAILED.to_owned()
            }),
            None => READ_FAILED.to_owned(),
        };
        outbox
            .send(&fcp_proto::test_dda_response(&directory, &content))
            .await?;
        self.state = PutState::AwaitingHandshakeComplete;
        Ok(())
    }

    /// Resends the original `ClientPut` once verification finished.
    async fn verified(&mut self, outbox: &Outbox) -> Result<()> {
        self.verified = true;
        if let Some(original) = &self.original {
            debug!(identifier = %self.identifier, "resending ClientPut after verification");
            outbox.send(original).await?;
        }
        self.state = PutState::AwaitingResult;
        Ok(())
    }
}

impl ReplySequence for PutSequence {
    type Output = Option<Key>;

    fn start(&mut self, original: &Message) {
        self.identifier = original
            .field(field::IDENTIFIER)
            .unwrap_or_default()
            .to_owned();
        self.original = Some(original.clone());
        self.state = PutState::AwaitingResult;
    }

    fn correlations(&self) -> Vec<Correlation> {
        let mut keys = vec![Correlation::Identifier(self.identifier.clone())];
        if let Some(dir) = &self.directory {
            keys.push(Correlation::Directory(dir.clone()));
        }
        keys
    }

    fn consume(&mut self, reply: Reply, outbox: &Outbox) -> impl Future<Output = Result<()>> + Send {
        async move {
            match reply {
                Reply::PutSuccessful { identifier, uri } if self.owns(&identifier) => {
                    debug!(%identifier, %uri, "put succeeded");
                    self.key = Some(Key(uri));
                    self.finish();
                }
                Reply::PutFailed {
                    identifier,
                    code,
                    description,
                } if self.owns(&identifier) => {
                    debug!(%identifier, ?code, ?description, "put failed");
                    self.finish();
                }
                Reply::ProtocolError {
                    identifier: Some(identifier),
                    code,
                    ..
                } if self.owns(&identifier) => {
                    self.protocol_error(code, outbox).await?;
                }
                Reply::TestDdaReply {
                    directory,
                    read_filename,
                    write_filename,
                    content_to_write,
                } if self.state == PutState::AwaitingHandshakeReply && self.verifies(&directory) => {
                    self.challenge(read_filename, write_filename, content_to_write, outbox)
                        .await?;
                }
                Reply::TestDdaComplete {
                    directory,
                    read_allowed,
                    ..
                } if self.state == PutState::AwaitingHandshakeComplete
                    && self.verifies(&directory) =>
                {
                    debug!(directory, read_allowed, "disk access verification complete");
                    self.verified(outbox).await?;
                }
                other => trace!(name = other.name(), state = ?self.state, "ignoring reply"),
            }
            Ok(())
        }
    }

    fn connection_closed(&mut self) {
        self.finish();
    }

    fn is_finished(&self) -> bool {
        self.state == PutState::Finished
    }

    fn into_result(self) -> Option<Key> {
        self.key
    }
}

/// First line of the file at `path`.
///
/// An empty first line, or one longer than [`MAX_PROBE_LINE`], is an error.
async fn read_first_line(path: &str) -> std::io::Result<String> {
    use std::io::{Error, ErrorKind};

    let file = tokio::fs::File::open(path).await?;
    let mut line = String::new();
    let n = BufReader::new(file)
        .take(MAX_PROBE_LINE)
        .read_line(&mut line)
        .await?;
    if !line.ends_with('\n') && n as u64 >= MAX_PROBE_LINE {
        return Err(Error::new(ErrorKind::InvalidData, "first line too long"));
    }
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Err(Error::new(ErrorKind::UnexpectedEof, "first line is empty"));
    }
    Ok(line.to_owned())
}
