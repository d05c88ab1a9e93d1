//! Push transports feeding the real-time channel.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::application::error::SyncError;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "realtime::transport";

/// One named event with an uninterpreted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    pub event: String,
    pub payload: Value,
}

impl PushFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Frames of one open connection. An `Err` item or the end of the stream
/// means the connection is gone.
pub type FrameStream = BoxStream<'static, Result<PushFrame, SyncError>>;

/// A server-to-client event transport.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a new connection. Each call yields an independent stream.
    async fn open(&self) -> Result<FrameStream, SyncError>;
}

type FrameSender = mpsc::UnboundedSender<Result<PushFrame, SyncError>>;

#[derive(Default)]
struct LocalState {
    sender: Option<FrameSender>,
    refuse: Option<SyncError>,
    opened: usize,
}

/// In-process transport: frames pushed through the paired [`LocalEmitter`]
/// reach whichever connection is currently open.
pub struct LocalTransport {
    state: Arc<Mutex<LocalState>>,
}

/// Sending half of a [`LocalTransport`].
#[derive(Clone)]
pub struct LocalEmitter {
    state: Arc<Mutex<LocalState>>,
}

impl LocalTransport {
    pub fn new() -> (Self, LocalEmitter) {
        let state = Arc::new(Mutex::new(LocalState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            LocalEmitter { state },
        )
    }
}

#[async_trait]
impl PushTransport for LocalTransport {
    async fn open(&self) -> Result<FrameStream, SyncError> {
        let mut receiver = {
            let mut state = mutex_lock(&self.state, SOURCE, "open");
            if let Some(error) = state.refuse.clone() {
                return Err(error);
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            state.sender = Some(sender);
            state.opened += 1;
            receiver
        };

        let stream = async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}

impl LocalEmitter {
    /// Deliver a frame to the open connection. Returns false when none is open.
    pub fn emit(&self, event: impl Into<String>, payload: Value) -> bool {
        self.send(Ok(PushFrame::new(event, payload)))
    }

    /// Break the open connection with a transport error.
    pub fn fail(&self, error: SyncError) -> bool {
        let delivered = self.send(Err(error));
        mutex_lock(&self.state, SOURCE, "fail").sender = None;
        delivered
    }

    /// End the open connection's stream.
    pub fn close(&self) {
        mutex_lock(&self.state, SOURCE, "close").sender = None;
    }

    /// Make subsequent `open` calls fail with `error`; `None` accepts again.
    pub fn refuse_connections(&self, error: Option<SyncError>) {
        mutex_lock(&self.state, SOURCE, "refuse_connections").refuse = error;
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "connections_opened").opened
    }

    fn send(&self, item: Result<PushFrame, SyncError>) -> bool {
        let state = mutex_lock(&self.state, SOURCE, "send");
        state
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(item).is_ok())
    }
}
