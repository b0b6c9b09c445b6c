//! Outbound frame queues with backpressure accounting.
//!
//! Every websocket, inbound or outbound, is driven by a writer task that
//! drains a [`FrameReceiver`]. The engine only ever holds the cloneable
//! [`SocketHandle`], which encodes messages, cuts oversized frames into
//! multipart containers and tracks how many bytes are still queued.

use braid_protocol::{codec, multipart, Message, SocketId};
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::error::{codes, TransportError};

/// Default maximum payload of a single frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Default queued byte count above which senders should wait.
pub const DEFAULT_MAX_BACKPRESSURE: usize = 400 * 1024 * 1024;

/// Size limits of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketLimits {
    /// Frames above this size are sent as multipart containers.
    pub max_payload: usize,
    /// Queued bytes above which [`SocketHandle::drained`] blocks.
    pub max_backpressure: usize,
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_backpressure: DEFAULT_MAX_BACKPRESSURE,
        }
    }
}

/// A frame waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded message.
    Binary(Bytes),
    /// Heartbeat ping.
    Ping,
    /// Close the socket with a code and reason.
    Close { code: u16, reason: String },
}

impl OutboundFrame {
    fn len(&self) -> usize {
        match self {
            OutboundFrame::Binary(data) => data.len(),
            OutboundFrame::Ping | OutboundFrame::Close { .. } => 0,
        }
    }

    /// Whether the close frame should actually be written.
    ///
    /// Links that died are closed with the abnormal code, which the
    /// websocket protocol forbids on the wire.
    #[must_use]
    pub fn is_terminal_only(&self) -> bool {
        matches!(self, OutboundFrame::Close { code, .. } if *code == codes::ABNORMAL)
    }
}

#[derive(Debug)]
struct Shared {
    id: SocketId,
    remote: Option<IpAddr>,
    limits: SocketLimits,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    buffered: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

/// Sending side of a socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

impl SocketHandle {
    /// Create a handle and the receiver its writer task drains.
    #[must_use]
    pub fn channel(
        id: SocketId,
        remote: Option<IpAddr>,
        limits: SocketLimits,
    ) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            remote,
            limits,
            tx,
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            FrameReceiver { rx, shared },
        )
    }

    /// Socket id.
    #[must_use]
    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    /// Remote address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.shared.remote
    }

    /// Size limits.
    #[must_use]
    pub fn limits(&self) -> SocketLimits {
        self.shared.limits
    }

    fn push(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        if self.shared.tx.send(frame).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    /// Encode and queue a message.
    ///
    /// Returns the encoded size.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the socket is closed.
    pub fn send(&self, message: &Message) -> Result<usize, TransportError> {
        let frame = codec::encode(message)?;
        let len = frame.len();
        self.send_encoded(frame)?;
        Ok(len)
    }

    /// Queue an encoded frame, splitting it if it exceeds the payload limit.
    ///
    /// # Errors
    ///
    /// Returns an error if splitting fails or the socket is closed.
    pub fn send_encoded(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() <= self.shared.limits.max_payload {
            return self.push(OutboundFrame::Binary(frame));
        }
        let parts = multipart::split(&frame, self.shared.limits.max_payload)?;
        trace!(socket = %self.id(), size = frame.len(), parts = parts.len(), "Sending multipart");
        for part in parts {
            self.push(OutboundFrame::Binary(part))?;
        }
        Ok(())
    }

    /// Queue raw bytes without splitting.
    ///
    /// Used for fixed compatibility frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is closed.
    pub fn send_raw(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(OutboundFrame::Binary(data))
    }

    /// Queue a heartbeat ping.
    pub fn ping(&self) {
        let _ = self.push(OutboundFrame::Ping);
    }

    /// Close the socket.
    ///
    /// Only the first call has an effect.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.tx.send(OutboundFrame::Close {
            code,
            reason: reason.into(),
        });
        self.shared.drained.notify_waiters();
    }

    /// Whether the socket was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    /// Wait until the queued byte count is below the backpressure limit.
    ///
    /// Returns immediately once the socket is closed.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.is_closed() || self.buffered_amount() < self.shared.limits.max_backpressure {
                return;
            }
            notified.await;
        }
    }

    /// Whether two handles drive the same socket.
    #[must_use]
    pub fn same_as(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Receiving side drained by a socket's writer task.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Next frame to write.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    /// Report a frame as written, releasing its bytes.
    pub fn sent(&self, frame: &OutboundFrame) {
        let len = frame.len();
        if len > 0 {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            self.shared.drained.notify_waiters();
        }
    }

    /// A handle to the same socket.
    #[must_use]
    pub fn handle(&self) -> SocketHandle {
        SocketHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.buffered.store(0, Ordering::SeqCst);
        self.shared.drained.notify_waiters();
    }
}
