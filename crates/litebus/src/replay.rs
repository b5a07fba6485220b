//! Replaying multicast streams.
//!
//! A [`ReplaySubject`] keeps the values pushed into it and hands every new
//! subscriber the retained history followed by all later pushes. Each
//! subscriber owns an independent cursor; dropping one never affects the
//! others.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

struct Inner<T> {
    history: VecDeque<T>,
    /// Retained history bound, `None` keeps everything
    capacity: Option<usize>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
}

pub struct ReplaySubject<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ReplaySubject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> ReplaySubject<T> {
    /// Subject retaining its full history.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Subject retaining at most `capacity` values when bounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                history: VecDeque::new(),
                capacity,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Append a value and fan it out to current subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn push(&self, value: T) -> usize {
        let mut inner = self.lock();

        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());

        match inner.capacity {
            Some(0) => {}
            Some(capacity) => {
                if inner.history.len() == capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(value);
            }
            None => inner.history.push_back(value),
        }

        inner.subscribers.len()
    }

    /// Open a new cursor starting at the oldest retained value.
    pub fn subscribe(&self) -> ReplayStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        for value in &inner.history {
            // Receiver is still in scope, send cannot fail.
            let _ = tx.send(value.clone());
        }
        inner.subscribers.push(tx);

        ReplayStream {
            rx: UnboundedReceiverStream::new(rx),
        }
    }

    /// Number of retained values.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Number of subscribers that have not been dropped yet
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for ReplaySubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a [`ReplaySubject`].
///
/// Ends only when every handle to the subject has been dropped.
pub struct ReplayStream<T> {
    rx: UnboundedReceiverStream<T>,
}

impl<T> Stream for ReplayStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}
