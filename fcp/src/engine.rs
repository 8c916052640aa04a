//! Reply-sequence engine: binds in-flight commands to their replies.
//!
//! Every launched command is driven by its own task, which owns the
//! command's [`ReplySequence`] state. The engine keeps a routing table
//! from [`Correlation`] keys to those tasks. Inbound messages are fanned
//! out to every task registered under one of the message's keys, in the
//! order the connection produced them; messages nobody waits for are
//! dropped.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use fcp_proto::{Message, Reply, field};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::Writer;
use crate::{Error, Result};

/// Key under which a sequence receives inbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Correlation {
    /// Matches messages whose `Identifier` field equals the token.
    Identifier(String),
    /// Matches messages whose `Directory` field equals the path.
    Directory(String),
}

impl Correlation {
    /// Keys carried by `msg`.
    fn of(msg: &Message) -> Vec<Self> {
        let mut keys = Vec::with_capacity(2);
        if let Some(id) = msg.field(field::IDENTIFIER) {
            keys.push(Self::Identifier(id.to_owned()));
        }
        if let Some(dir) = msg.field(field::DIRECTORY) {
            keys.push(Self::Directory(dir.to_owned()));
        }
        keys
    }
}

/// One command's conversation with the node.
///
/// The engine calls [`start`](Self::start) once with the initial message,
/// then feeds correlated replies to [`consume`](Self::consume) one at a
/// time, checking [`is_finished`](Self::is_finished) after each. Once it
/// returns `true` the sequence is deregistered and
/// [`into_result`](Self::into_result) resolves the caller's [`Deferred`].
pub trait ReplySequence: Send + 'static {
    /// Value the command resolves to.
    type Output: Send + 'static;

    /// Records the initial message before it is sent.
    fn start(&mut self, original: &Message);

    /// Keys this sequence listens on; read once, after [`start`](Self::start).
    fn correlations(&self) -> Vec<Correlation>;

    /// Handles one correlated reply, possibly sending further messages.
    fn consume(
        &mut self,
        reply: Reply,
        outbox: &Outbox,
    ) -> impl Future<Output = Result<()>> + Send;

    /// The connection is gone. Must leave the sequence finished.
    fn connection_closed(&mut self);

    /// Whether the conversation is over.
    fn is_finished(&self) -> bool;

    /// Final outcome, taken once the sequence is finished.
    fn into_result(self) -> Self::Output;
}

/// Lets a sequence continue its own conversation from a handler.
#[derive(Debug)]
pub struct Outbox {
    /// Engine owning the connection.
    engine: Engine,
}

impl Outbox {
    /// Sends `msg` on the shared connection.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.engine.shared.writer.send(msg).await?;
        Ok(())
    }
}

/// Pending result of a launched command.
///
/// Resolves exactly once. Dropping it abandons the command: the engine
/// stops delivering replies to it and never resolves it.
#[derive(Debug)]
#[must_use = "a Deferred result is abandoned when dropped"]
pub struct Deferred<T> {
    /// Receives the outcome from the driving task.
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Deferred<T> {
    /// Abandons the command. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::Dropped)))
    }
}

/// Delivered to a sequence's task.
#[derive(Debug)]
enum Event {
    /// A correlated inbound message.
    Reply(Reply),
    /// The connection terminated.
    Closed,
}

/// A registered sequence's mailbox and keys.
#[derive(Debug)]
struct Slot {
    /// Keys indexed in [`Table::routes`].
    keys: Vec<Correlation>,
    /// Mailbox of the driving task.
    tx: mpsc::UnboundedSender<Event>,
}

/// Routing table, guarded by [`Shared::table`].
#[derive(Debug, Default)]
struct Table {
    /// Set once the connection terminated.
    closed: bool,
    /// Registered sequences by slot id.
    slots: HashMap<u64, Slot>,
    /// Slot ids listening on each key.
    routes: HashMap<Correlation, BTreeSet<u64>>,
}

impl Table {
    /// Removes a slot and its routes. Removing twice is a no-op.
    fn remove(&mut self, id: u64) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        for key in slot.keys {
            if let Some(ids) = self.routes.get_mut(&key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.routes.remove(&key);
                }
            }
        }
    }
}

/// State shared by the engine handle, its tasks and the reader loop.
#[derive(Debug)]
struct Shared {
    /// Write half of the connection.
    writer: Writer,
    /// Routing table.
    table: Mutex<Table>,
    /// Bounds concurrently driven conversations.
    permits: Arc<Semaphore>,
    /// Next slot id.
    next_slot: AtomicU64,
}

/// Multiplexes many reply sequences over one connection.
#[derive(Clone)]
pub struct Engine {
    /// Shared state.
    shared: Arc<Shared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("in_flight", &self.in_flight())
            .field("available_permits", &self.shared.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine writing to `writer`, driving at most
    /// `max_in_flight` conversations at once.
    pub(crate) fn new(writer: Writer, max_in_flight: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                writer,
                table: Mutex::new(Table::default()),
                permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
                next_slot: AtomicU64::new(0),
            }),
        }
    }

    /// Launches `sequence` with `original` as its first message.
    ///
    /// Returns immediately; registration, sending and waiting happen on a
    /// spawned task. Must be called within a tokio runtime.
    pub fn launch<S: ReplySequence>(&self, original: Message, sequence: S) -> Deferred<S::Output> {
        self.launch_with(async move { Ok(original) }, sequence)
    }

    /// Like [`launch`](Self::launch), but the first message is produced by
    /// `prepare` on the command's task (e.g. after buffering a payload).
    pub fn launch_with<S, F>(&self, prepare: F, sequence: S) -> Deferred<S::Output>
    where
        S: ReplySequence,
        F: Future<Output = Result<Message>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(drive(self.clone(), sequence, prepare, tx));
        Deferred { rx }
    }

    /// Routes an inbound message to every sequence listening on one of
    /// its keys. Uncorrelated messages are dropped.
    pub fn dispatch(&self, msg: Message) {
        let targets: Vec<mpsc::UnboundedSender<Event>> = {
            let table = self.table();
            let ids: BTreeSet<u64> = Correlation::of(&msg)
                .iter()
                .filter_map(|key| table.routes.get(key))
                .flatten()
                .copied()
                .collect();
            ids.iter()
                .filter_map(|id| table.slots.get(id))
                .map(|slot| slot.tx.clone())
                .collect()
        };

        if targets.is_empty() {
            trace!(name = msg.name(), "dropping uncorrelated message");
            return;
        }

        let reply = Reply::parse(msg);
        for tx in targets {
            // A closed mailbox belongs to a sequence that just finished.
            let _ = tx.send(Event::Reply(reply.clone()));
        }
    }

    /// Signals connection termination to every registered sequence.
    ///
    /// Sequences launched afterwards finish without sending anything.
    pub fn terminate(&self, cause: &str) {
        let mut table = self.table();
        if !table.closed {
            warn!(cause, active = table.slots.len(), "connection terminated");
        }
        table.closed = true;
        for slot in table.slots.values() {
            let _ = slot.tx.send(Event::Closed);
        }
    }

    /// Number of registered sequences.
    pub fn in_flight(&self) -> usize {
        self.table().slots.len()
    }

    /// Locks the routing table, ignoring poisoning.
    fn table(&self) -> MutexGuard<'_, Table> {
        self.shared
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a mailbox under `keys`.
    fn register(&self, keys: Vec<Correlation>) -> (Registration, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table();
        if table.closed {
            let _ = tx.send(Event::Closed);
        }
        for key in &keys {
            table.routes.entry(key.clone()).or_default().insert(id);
        }
        table.slots.insert(id, Slot { keys, tx });
        let registration = Registration {
            engine: self.clone(),
            id,
            closed: table.closed,
        };
        (registration, rx)
    }
}

/// Removes its slot from the routing table when dropped.
#[derive(Debug)]
struct Registration {
    /// Owning engine.
    engine: Engine,
    /// Slot id.
    id: u64,
    /// Whether the connection had already terminated at registration.
    closed: bool,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.engine.table().remove(self.id);
    }
}

/// How a conversation ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// The sequence reported itself finished.
    Finished,
    /// The caller dropped its [`Deferred`].
    Abandoned,
}

/// Drives one sequence to completion and resolves its result.
async fn drive<S, F>(
    engine: Engine,
    mut sequence: S,
    prepare: F,
    mut tx: oneshot::Sender<Result<S::Output>>,
) where
    S: ReplySequence,
    F: Future<Output = Result<Message>> + Send,
{
    let outcome = match converse(&engine, &mut sequence, prepare, &mut tx).await {
        Ok(Ending::Abandoned) => {
            debug!("command abandoned by caller");
            return;
        }
        Ok(Ending::Finished) => Ok(sequence.into_result()),
        Err(e) => Err(e),
    };
    // The receiver may have gone away since; then there is nobody to tell.
    let _ = tx.send(outcome);
}

/// Registers, sends the first message and feeds replies until finished.
///
/// Abandonment is only observed while waiting, never in the middle of a
/// send, so a dropped [`Deferred`] cannot leave a partial message on the
/// wire.
async fn converse<S, F, T>(
    engine: &Engine,
    sequence: &mut S,
    prepare: F,
    tx: &mut oneshot::Sender<T>,
) -> Result<Ending>
where
    S: ReplySequence,
    F: Future<Output = Result<Message>> + Send,
{
    let setup = async {
        let permit = Arc::clone(&engine.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Dropped)?;
        Ok::<_, Error>((permit, prepare.await?))
    };
    let (_permit, original) = tokio::select! {
        () = tx.closed() => return Ok(Ending::Abandoned),
        ready = setup => ready?,
    };

    sequence.start(&original);
    let (registration, mut events) = engine.register(sequence.correlations());

    if !registration.closed {
        debug!(name = original.name(), "launching command");
        let sent = engine.shared.writer.send(&original).await;
        closed_or(engine, sequence, sent.map_err(Error::from))?;
    }

    let outbox = Outbox {
        engine: engine.clone(),
    };
    while !sequence.is_finished() {
        let event = tokio::select! {
            () = tx.closed() => return Ok(Ending::Abandoned),
            event = events.recv() => event,
        };
        match event {
            Some(Event::Reply(reply)) => {
                let handled = sequence.consume(reply, &outbox).await;
                closed_or(engine, sequence, handled)?;
            }
            Some(Event::Closed) | None => sequence.connection_closed(),
        }
    }
    Ok(Ending::Finished)
}

/// Passes `result` through, unless it failed because the connection
/// terminated meanwhile; then the sequence is closed instead.
fn closed_or<S: ReplySequence>(engine: &Engine, sequence: &mut S, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if engine.table().closed => {
            debug!(error = %e, "send failed on terminated connection");
            sequence.connection_closed();
            Ok(())
        }
        other => other,
    }
}
