//! Network and queue utilities.

use std::sync::Once;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use futures::{
    future::pending,
    Future,
};


/// Byte stream a connection runs over. Boxed so plain TCP and TLS streams
/// flow through the same pipeline.
pub(crate) type IoStream = Box<dyn AsyncStream>;

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Attempt to disable nagling, log error on failure.
pub(crate) fn try_denagle(tcp: &TcpStream) {
    let denagle_result = tcp.set_nodelay(true);
    if let Err(e) = denagle_result {
        static WARN_DENAGLE_FAILED: Once = Once::new();
        WARN_DENAGLE_FAILED.call_once(|| warn!(%e, "failed to disable nagling"));
    }
}

/// Wrapper around a future option that resolves to the some value or pends
/// forever.
pub(crate) async fn some_or_pending<T, F: Future<Output = Option<T>>>(option: F) -> T {
    match option.await {
        Some(t) => t,
        None => pending().await,
    }
}

/// Sender half of a queue that is bounded iff `maxsize` is nonzero.
pub(crate) enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

/// Receiver half of a queue that is bounded iff `maxsize` is nonzero.
pub(crate) enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Channel bounded at `maxsize`, unbounded if `maxsize` is 0.
pub(crate) fn queue<T>(maxsize: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    if maxsize == 0 {
        let (send, recv) = mpsc::unbounded_channel();
        (QueueSender::Unbounded(send), QueueReceiver::Unbounded(recv))
    } else {
        let (send, recv) = mpsc::channel(maxsize);
        (QueueSender::Bounded(send), QueueReceiver::Bounded(recv))
    }
}

impl<T> QueueSender<T> {
    /// Send, suspending while a bounded queue is full. Fails iff the
    /// receiver is gone.
    pub(crate) async fn send(&self, value: T) -> Result<(), ()> {
        match self {
            QueueSender::Bounded(send) => send.send(value).await.map_err(|_| ()),
            QueueSender::Unbounded(send) => send.send(value).map_err(|_| ()),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Receive the next value, or `None` once the queue is empty and all
    /// senders are gone.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        match self {
            QueueReceiver::Bounded(recv) => recv.recv().await,
            QueueReceiver::Unbounded(recv) => recv.recv().await,
        }
    }
}
