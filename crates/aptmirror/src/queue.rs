//! Closeable multi-consumer work queue
//!
//! Producers [`push`](WorkQueue::push) and finally [`close`](WorkQueue::close)
//! the queue. Consumers block in [`pop`](WorkQueue::pop) until an item arrives
//! or the queue is closed and drained, so idle workers exit instead of polling.
//! Every popped item must be acknowledged with
//! [`task_done`](WorkQueue::task_done); [`join`](WorkQueue::join) waits until
//! all pushed items have been acknowledged.

use crate::signal::ErrorSignal;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

#[derive(Debug, Error)]
#[error("work queue '{queue}' is closed")]
pub struct QueueClosed {
    pub queue: String,
}

pub struct WorkQueue<T> {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    outstanding: watch::Sender<usize>,
}

impl<T> WorkQueue<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0);

        Self {
            name: name.into(),
            sender: Mutex::new(Some(tx)),
            receiver: AsyncMutex::new(rx),
            outstanding,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return Err(self.closed_error());
        };

        self.outstanding.send_modify(|n| *n += 1);
        if sender.send(item).is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return Err(self.closed_error());
        }

        Ok(())
    }

    /// Mark population as done. Items already queued are still delivered.
    pub fn close(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Next item, or `None` once the queue is closed and empty.
    /// No two consumers ever receive the same item.
    pub async fn pop(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Like [`pop`](Self::pop) but gives up as soon as the signal is raised
    pub async fn pop_unless(&self, signal: &ErrorSignal) -> Option<T> {
        if signal.is_raised() {
            return None;
        }

        tokio::select! {
            biased;
            _ = signal.raised() => None,
            item = self.pop() => item,
        }
    }

    pub fn task_done(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Items pushed but not yet acknowledged
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every pushed item has been acknowledged
    pub async fn join(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn closed_error(&self) -> QueueClosed {
        QueueClosed {
            queue: self.name.clone(),
        }
    }
}
