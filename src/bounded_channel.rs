// SPDX-License-Identifier: Apache-2.0

//! A bounded MPSC channel carrying results from worker tasks back to a pipeline loop.

use std::fmt;

use flume::{Receiver, Sender};

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    /// Wait for capacity, then send. Fails once the receiver is gone.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Next item, or `None` once every sender is dropped and the channel is empty.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Returns immediately with `None` if nothing is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{SendError, bounded};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn receives_in_order() {
        let (tx, mut rx) = bounded(3);

        assert_ok!(tx.send("u1").await);
        assert_ok!(tx.send("u2").await);
        assert_eq!(rx.len(), 2);

        assert_eq!(Some("u1"), rx.next().await);
        assert_eq!(Some("u2"), rx.try_recv());
        assert!(rx.is_empty());
        assert_eq!(None, rx.try_recv());

        drop(tx);
        assert_eq!(None, rx.next().await);
    }

    #[tokio::test]
    async fn sender_waits_for_capacity() {
        let (tx, mut rx) = bounded(1);

        assert_ok!(tx.send(1).await);

        let mut send2 = spawn(async { tx.send(2).await });
        assert_pending!(send2.poll());

        assert_eq!(Some(1), rx.next().await);
        assert!(send2.is_woken());
        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);
        drop(rx);

        let mut send = spawn(async { tx.send(10).await });
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send.poll()));
    }
}
