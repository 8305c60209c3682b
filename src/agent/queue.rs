use super::error::AgentError;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{oneshot, watch};

/// One of the two cooperating FIFOs of the loop.
///
/// `push` never blocks. `pop` returns immediately when an item is queued and
/// otherwise parks the caller; at most one parked caller exists per queue,
/// which the single-task loop guarantees by construction. `cancel_wait`
/// wakes the parked caller with the supplied error without consuming an
/// item.
pub struct IntentQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    waiter: Option<oneshot::Sender<Result<T, AgentError>>>,
}

impl<T> Default for IntentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntentQueue<T> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { items: VecDeque::new(), waiter: None }) }
    }

    /// Hand an item to the parked waiter, or enqueue it FIFO.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if let Some(waiter) = inner.waiter.take() {
            // A dropped receiver means the popper was torn down mid-await;
            // the item goes back on the queue rather than being lost.
            if let Err(Ok(item)) = waiter.send(Ok(item)) {
                inner.items.push_back(item);
            }
        } else {
            inner.items.push_back(item);
        }
    }

    /// Pop the next item, parking until one arrives.
    pub async fn pop(&self) -> Result<T, AgentError> {
        let rx = {
            let mut inner = self.inner.lock().expect("queue poisoned");
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            debug_assert!(inner.waiter.is_none(), "second waiter parked on intent queue");
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            rx
        };
        rx.await.map_err(|_| AgentError::QueueClosed)?
    }

    /// Wake the parked caller with `err`. No-op when nobody is parked.
    pub fn cancel_wait(&self, err: AgentError) {
        let waiter = self.inner.lock().expect("queue poisoned").waiter.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(err));
        }
    }

    /// True while a pop is parked on this queue. The loop is in its default
    /// state exactly when the notify queue has a waiter.
    pub fn has_waiter(&self) -> bool {
        self.inner.lock().expect("queue poisoned").waiter.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandshakeState {
    generation: u64,
    ready: bool,
    closed: bool,
}

/// The rendezvous between the loop and external callers.
///
/// Models the "ready to accept a new command" promise: the loop flips to
/// ready right before parking on a queue and back to busy when it wakes.
/// External callers must `wait_ready` before touching the queues, which
/// yields at-most-one-parked-waiter and deterministic cancellation.
pub struct Handshake {
    tx: watch::Sender<HandshakeState>,
}

#[derive(Clone)]
pub struct HandshakeObserver {
    rx: watch::Receiver<HandshakeState>,
}

impl Handshake {
    pub fn new() -> (Self, HandshakeObserver) {
        let (tx, rx) =
            watch::channel(HandshakeState { generation: 0, ready: false, closed: false });
        (Self { tx }, HandshakeObserver { rx })
    }

    /// Loop side: about to park on a queue.
    pub fn enter_wait(&self) {
        self.tx.send_modify(|s| {
            s.generation += 1;
            s.ready = true;
        });
    }

    /// Loop side: woke up with an item in hand.
    pub fn leave_wait(&self) {
        self.tx.send_modify(|s| s.ready = false);
    }

    /// Loop side: stopped for good. Parked observers fail fast instead of
    /// waiting on a loop that will never be ready again.
    pub fn close(&self) {
        self.tx.send_modify(|s| s.closed = true);
    }
}

impl HandshakeObserver {
    /// Park until the loop is at a suspension point.
    pub async fn wait_ready(&self) -> Result<(), AgentError> {
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|s| s.ready || s.closed)
            .await
            .map_err(|_| AgentError::QueueClosed)?;
        if state.closed {
            return Err(AgentError::QueueClosed);
        }
        Ok(())
    }

    /// Park until the loop has gone through at least one more wake/park
    /// cycle. `handle_command` resolves on this, i.e. after its command has
    /// been fully consumed.
    pub async fn wait_next_turn(&self) -> Result<(), AgentError> {
        let start = self.rx.borrow().generation;
        let mut rx = self.rx.clone();
        let state = rx
            .wait_for(|s| (s.ready && s.generation > start) || s.closed)
            .await
            .map_err(|_| AgentError::QueueClosed)?;
        if state.closed {
            return Err(AgentError::QueueClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = IntentQueue::new();
        q.push(1u32);
        q.push(2);
        assert_eq!(q.pop().await.unwrap(), 1);
        assert_eq!(q.pop().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn push_wakes_parked_waiter() {
        let q = std::sync::Arc::new(IntentQueue::new());
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.push(7u32);
        assert_eq!(popper.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn cancel_wait_wakes_with_error() {
        let q = std::sync::Arc::new(IntentQueue::<u32>::new());
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        // Let the popper park first.
        while !q.has_waiter() {
            tokio::task::yield_now().await;
        }
        q.cancel_wait(AgentError::Cancelled);
        assert!(popper.await.unwrap().unwrap_err().is_cancelled());
    }
}
