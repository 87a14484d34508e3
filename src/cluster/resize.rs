//! Terminal size handoff for cluster exec
//!
//! The exec protocol pulls sizes one at a time; the session pushes them
//! whenever its geometry changes. A watch channel sits in between, so only
//! the most recent size is ever waiting.

use async_trait::async_trait;
use futures_channel::mpsc::Sender;
use futures_util::SinkExt;
use kube::api::TerminalSize;
use tokio::sync::watch;
use tracing::debug;

use crate::backend::{BackendError, Resizer, TermSize};

/// Producer side. Dropping it ends the queue.
pub struct ResizeHandle {
    tx: watch::Sender<Option<TermSize>>,
}

impl ResizeHandle {
    /// Replace any size still waiting to be consumed
    pub fn push(&self, size: TermSize) {
        self.tx.send_replace(Some(size));
    }
}

/// Consumer side, pulled by the exec stream
pub struct ResizeQueue {
    rx: watch::Receiver<Option<TermSize>>,
}

impl ResizeQueue {
    /// Wait for the next size change. `None` once the handle is gone and the
    /// last pushed size has been taken.
    pub async fn next(&mut self) -> Option<TerminalSize> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(size) = *self.rx.borrow_and_update() {
                return Some(TerminalSize {
                    width: size.cols,
                    height: size.rows,
                });
            }
        }
    }
}

pub fn resize_queue() -> (ResizeHandle, ResizeQueue) {
    let (tx, rx) = watch::channel(None);
    (ResizeHandle { tx }, ResizeQueue { rx })
}

/// Drain `queue` into the exec's terminal size channel until either side
/// goes away
pub fn spawn_resize_forwarder(mut queue: ResizeQueue, mut sink: Sender<TerminalSize>) {
    tokio::spawn(async move {
        while let Some(size) = queue.next().await {
            if sink.send(size).await.is_err() {
                debug!("Exec terminal size channel closed");
                break;
            }
        }
        debug!("Resize forwarder exited");
    });
}

/// `Resizer` for the io transport; owns the producer side
pub(crate) struct QueueResizer {
    handle: ResizeHandle,
}

impl QueueResizer {
    pub(crate) fn new(handle: ResizeHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Resizer for QueueResizer {
    async fn resize(&mut self, size: TermSize) -> Result<(), BackendError> {
        self.handle.push(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_last_write_wins() {
        let (handle, mut queue) = resize_queue();
        handle.push(TermSize::new(80, 24));
        handle.push(TermSize::new(100, 30));
        handle.push(TermSize::new(132, 43));

        let size = queue.next().await.unwrap();
        assert_eq!((size.width, size.height), (132, 43));
    }

    #[tokio::test]
    async fn test_dropping_handle_unblocks_consumer() {
        let (handle, mut queue) = resize_queue();
        let waiter = tokio::spawn(async move { queue.next().await });

        tokio::task::yield_now().await;
        drop(handle);
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_size_survives_handle_drop() {
        let (handle, mut queue) = resize_queue();
        handle.push(TermSize::new(90, 25));
        drop(handle);

        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn test_forwarder_delivers_rows_and_columns() {
        let (handle, queue) = resize_queue();
        let (tx, mut rx) = futures_channel::mpsc::channel(1);
        spawn_resize_forwarder(queue, tx);

        let mut resizer = QueueResizer::new(handle);
        resizer.resize(TermSize::new(120, 40)).await.unwrap();

        let size = rx.next().await.unwrap();
        assert_eq!(size.width, 120);
        assert_eq!(size.height, 40);

        drop(resizer);
        assert!(rx.next().await.is_none());
    }
}
