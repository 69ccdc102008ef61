//! Per-connection send/receive pair.
//!
//! Architecture follows the reactor pattern: the socket halves are owned by
//! two dedicated tasks, callers talk to them through channels.
//!
//! - The **reader** decodes one [`CommEvent`] at a time and routes `Event`
//!   payloads and `Config` payloads into separate inbound queues, so a slow
//!   consumer of one kind never blocks the other. `Ping` is answered
//!   in-line, `Close` and protocol errors trip the shutdown token.
//! - The **writer** parks on its outbound queue (wake-on-send, no polling),
//!   dequeues FIFO, and writes each frame fully before the next.
//!
//! Shutdown is cooperative: [`Connection::close`] trips the token and joins
//! both tasks. The writer then closes its queue so racing sends are refused,
//! drains every event already accepted, and parts with a `Close` frame.
//! Events offered after close fail with [`SendError::Closed`]; events whose
//! send returned `Ok` always reach the socket.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::SendError;
use crate::event::{CommEvent, Config, Event};
use crate::wire;

/// Queue depth for the outbound and both inbound channels.
const QUEUE_DEPTH: usize = 256;

/// An inbound message routed off the wire: session events and configs
/// travel separate queues but consumers often want whichever is next.
#[derive(Debug)]
pub enum Inbound {
    Event(Event),
    Config(Config),
}

/// Cloneable handle for enqueueing outbound events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<CommEvent>,
    cancel: CancellationToken,
}

impl EventSender {
    /// Enqueue an event for the writer. FIFO order is preserved across all
    /// clones of this sender.
    pub async fn send(&self, event: CommEvent) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.send(event).await.map_err(|_| SendError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An established connection: one reader task, one writer task, and the
/// queues between them and the caller.
pub struct Connection {
    outbound: EventSender,
    events: mpsc::Receiver<Event>,
    configs: mpsc::Receiver<Config>,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Connection {
    /// Split the stream and spawn the reader/writer pair.
    ///
    /// The stream must already be past the version handshake; the pair only
    /// ever sees framed events.
    pub fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let cancel = CancellationToken::new();

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);
        let (configs_tx, configs_rx) = mpsc::channel(QUEUE_DEPTH);

        let reader = tokio::spawn(reader_task(
            read_half,
            events_tx,
            configs_tx,
            outbound_tx.clone(),
            cancel.clone(),
        ));
        let writer = tokio::spawn(writer_task(write_half, outbound_rx, cancel.clone()));

        Self {
            outbound: EventSender {
                tx: outbound_tx,
                cancel: cancel.clone(),
            },
            events: events_rx,
            configs: configs_rx,
            cancel,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Enqueue an outbound event.
    pub async fn send(&self, event: CommEvent) -> Result<(), SendError> {
        self.outbound.send(event).await
    }

    /// A cloneable sender for concurrent producers.
    pub fn sender(&self) -> EventSender {
        self.outbound.clone()
    }

    /// Next inbound message of either kind, `None` once both queues have
    /// terminated. Configs are favored so a burst of events cannot starve
    /// settings replay.
    pub async fn recv(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            Some(config) = self.configs.recv() => Some(Inbound::Config(config)),
            Some(event) = self.events.recv() => Some(Inbound::Event(event)),
            else => None,
        }
    }

    /// Next inbound session event, `None` once the connection is done.
    pub async fn recv_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Next inbound config, `None` once the connection is done.
    pub async fn recv_config(&mut self) -> Option<Config> {
        self.configs.recv().await
    }

    /// True once either side has requested close or the transport died.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token tripped when the connection shuts down; lets owners observe
    /// disconnection without polling.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Graceful shutdown: refuse further sends, flush everything already
    /// accepted, notify the peer, join both tasks. Idempotent.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for both tasks to exit. No forced termination.
    pub async fn join(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

async fn reader_task<R>(
    mut reader: R,
    events_tx: mpsc::Sender<Event>,
    configs_tx: mpsc::Sender<Config>,
    outbound_tx: mpsc::Sender<CommEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            result = wire::read_event(&mut reader) => match result {
                Ok(event) => event,
                Err(e) if e.is_disconnect() => {
                    debug!("peer disconnected");
                    cancel.cancel();
                    break;
                }
                Err(e) => {
                    warn!("protocol error on receive, closing connection: {}", e);
                    cancel.cancel();
                    break;
                }
            },
        };

        match event {
            CommEvent::Event(ev) => {
                trace!("inbound event {:?}", ev.kind);
                if events_tx.send(ev).await.is_err() {
                    break;
                }
            }
            CommEvent::Config(config) => {
                trace!("inbound config {}", config.key);
                if configs_tx.send(config).await.is_err() {
                    break;
                }
            }
            CommEvent::Ping => {
                let _ = outbound_tx.send(CommEvent::Pong).await;
            }
            CommEvent::Pong => {}
            CommEvent::Close => {
                debug!("peer requested close");
                cancel.cancel();
                break;
            }
            other => {
                // Handshake-phase events have no business mid-stream.
                warn!("unexpected {:?} after handshake, ignoring", other.tag());
            }
        }
    }

    trace!("reader task exiting");
}

async fn writer_task<W>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<CommEvent>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            // Drain queued events before reacting to the close request.
            biased;

            event = outbound_rx.recv() => match event {
                Some(event) => {
                    if let Err(e) = wire::write_event(&mut writer, &event).await {
                        warn!("send failed, closing connection: {}", e);
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },

            _ = cancel.cancelled() => {
                // Stop accepting first, so a send racing the close is
                // either refused or lands in the queue we drain here.
                outbound_rx.close();
                while let Some(event) = outbound_rx.recv().await {
                    if wire::write_event(&mut writer, &event).await.is_err() {
                        break;
                    }
                }
                let _ = wire::write_event(&mut writer, &CommEvent::Close).await;
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    trace!("writer task exiting");
}
