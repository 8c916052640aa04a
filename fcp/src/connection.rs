//! The shared connection to the node: a serialized writer and the
//! reader loop that feeds inbound messages to the [`Engine`].

use std::fmt;
use std::io;
use std::pin::Pin;

use fcp_proto::{Message, Reply};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::{Error, Result};

/// Boxed write half of the connection.
type BoxWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Write half shared by every sequence on the connection.
///
/// The lock is held for the whole message, so bytes of two messages
/// never interleave.
pub(crate) struct Writer {
    /// The underlying write half.
    inner: Mutex<BoxWrite>,
}

impl Writer {
    /// Wraps a write half.
    pub(crate) fn new(w: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::pin(w)),
        }
    }

    /// Writes one complete message and flushes it.
    pub(crate) async fn send(&self, msg: &Message) -> io::Result<()> {
        let mut w = self.inner.lock().await;
        fcp_proto::write_message(&mut *w, msg).await
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

/// Sends `ClientHello` and waits for the node's answer.
pub(crate) async fn hello(
    r: &mut (impl AsyncBufRead + Unpin),
    w: &Writer,
    name: &str,
) -> Result<()> {
    w.send(&fcp_proto::client_hello(name)).await?;

    let msg = fcp_proto::read_message(r)
        .await?
        .ok_or_else(|| Error::Handshake("connection closed before NodeHello".into()))?;

    match Reply::parse(msg) {
        Reply::NodeHello { version } => {
            debug!(name, ?version, "connected to node");
            Ok(())
        }
        Reply::CloseConnectionDuplicateClientName => Err(Error::Handshake(format!(
            "client name {name:?} already in use"
        ))),
        Reply::ProtocolError {
            code, description, ..
        } => Err(Error::Handshake(format!(
            "protocol error {code}: {}",
            description.unwrap_or_default()
        ))),
        other => Err(Error::Handshake(format!(
            "expected NodeHello, got {}",
            other.name()
        ))),
    }
}

/// Delivers inbound messages to `engine` until the stream ends.
///
/// End of stream and read errors both terminate every sequence.
pub(crate) async fn read_loop(mut r: impl AsyncBufRead + Unpin, engine: Engine) {
    loop {
        match fcp_proto::read_message(&mut r).await {
            Ok(Some(msg)) => engine.dispatch(msg),
            Ok(None) => {
                engine.terminate("connection closed by node");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read from node");
                engine.terminate(&e.to_string());
                return;
            }
        }
    }
}
