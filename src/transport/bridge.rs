//! Cross-transport bridge
//!
//! The broker publishes on whatever thread called it. A transport that lives
//! on a single cooperative event loop cannot be touched from there, so the
//! bridge never calls into it directly: it submits a task through a
//! [`LoopHandle`] and returns. The loop drains submitted tasks one at a time,
//! in submission order, with exclusive access to its own state.

use tokio::sync::mpsc;

use crate::broker::message::Message;
use crate::utils::BridgeError;

/// Something the broker notifies on every publish.
///
/// `publish` must return promptly and must not block on I/O.
pub trait ExternalPublisher: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, message: &Message) -> Result<(), BridgeError>;
}

type PublishFn = dyn Fn(&Message) -> Result<(), BridgeError> + Send + Sync;

/// Adapts a closure into an [`ExternalPublisher`].
pub struct CallbackPublisher {
    name: String,
    callback: Box<PublishFn>,
}

impl CallbackPublisher {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Message) -> Result<(), BridgeError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

impl ExternalPublisher for CallbackPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, message: &Message) -> Result<(), BridgeError> {
        (self.callback)(message)
    }
}

pub type LoopTask<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Thread-safe "run this on the loop" capability for loop-owned state `S`.
pub struct LoopHandle<S> {
    tx: mpsc::UnboundedSender<LoopTask<S>>,
}

impl<S> Clone for LoopHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> std::fmt::Debug for LoopHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Receiving end, polled by the loop's driver task.
pub struct LoopQueue<S> {
    rx: mpsc::UnboundedReceiver<LoopTask<S>>,
}

/// A connected handle and queue. The queue goes to the loop that owns `S`,
/// handles go to everyone else.
pub fn loop_channel<S>() -> (LoopHandle<S>, LoopQueue<S>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LoopHandle { tx }, LoopQueue { rx })
}

impl<S> LoopHandle<S> {
    /// Queue `task` and return immediately. Fails only when the loop has
    /// gone away.
    pub fn submit<F>(&self, task: F) -> Result<(), BridgeError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Box::new(task))
            .map_err(|_| BridgeError::LoopStopped)
    }
}

impl<S> LoopQueue<S> {
    /// Next submitted task, or `None` once every handle is gone.
    pub async fn next(&mut self) -> Option<LoopTask<S>> {
        self.rx.recv().await
    }
}
