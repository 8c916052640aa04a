//! Asynchronous client for the Freenet client protocol (FCP).
//!
//! Commands are launched on a shared connection and return a
//! [`Deferred`] result immediately. Each command's conversation with the
//! node runs on its own task, may span several request/reply rounds,
//! and resolves exactly once.
//!
//! # Quick start
//!
//! ```no_run
//! use fcp::{Client, ClientConfig};
//!
//! # async fn demo() -> fcp::Result<()> {
//! let client = Client::connect(&ClientConfig::default()).await?;
//! let key = client
//!     .put()
//!     .from_bytes(b"hello freenet".to_vec())
//!     .launch("CHK@")?
//!     .await?;
//!
//! match key {
//!     Some(key) => println!("inserted at {key}"),
//!     None => eprintln!("insert failed"),
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod connection;
mod engine;
mod error;
mod identifier;
mod put;

pub use client::Client;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use engine::{Correlation, Deferred, Engine, Outbox, ReplySequence};
pub use error::{Error, Result};
pub use fcp_proto::{Message, Reply};
pub use identifier::next_identifier;
pub use put::{Key, PutBuilder, UploadSource};
