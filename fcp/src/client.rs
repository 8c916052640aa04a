//! Client connection to a Freenet node.
//!
//! A [`Client`] owns one connection. Any number of commands may run on it
//! at once; their replies are told apart by their identifiers.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::connection::{self, Writer};
use crate::engine::Engine;
use crate::put::PutBuilder;
use crate::Result;

/// A connection to a node, shared by all commands launched from it.
///
/// Cloning is cheap; clones share the connection.
#[derive(Debug, Clone)]
pub struct Client {
    /// Engine multiplexing commands over the connection.
    engine: Engine,
}

impl Client {
    /// Connects to the node at `config.host:config.port`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        Self::over(stream, config).await
    }

    /// Performs the hello exchange over an established byte stream and
    /// starts delivering replies.
    ///
    /// Must be called within a tokio runtime.
    pub async fn over<S>(stream: S, config: &ClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let writer = Writer::new(writer);

        connection::hello(&mut reader, &writer, &config.name).await?;

        let engine = Engine::new(writer, config.max_in_flight);
        tokio::spawn(connection::read_loop(reader, engine.clone()));
        Ok(Self { engine })
    }

    /// Starts building a `ClientPut` command.
    pub fn put(&self) -> PutBuilder {
        PutBuilder::new(self.engine.clone())
    }

    /// The engine driving this client's commands.
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }
}
