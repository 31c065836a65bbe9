//! Bridge between the synchronous game thread and tokio-based network I/O
//!
//! The game loop owns the order manager and never blocks on the network.
//! Each `NetworkConnection` therefore carries its own small runtime on a
//! background thread; packets cross back over an unbounded channel that the
//! game thread drains without blocking.

use std::sync::{Arc, Mutex};
use std::thread;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

/// A tokio runtime parked on a dedicated background thread.
///
/// Dropping (or explicitly shutting down) the handle unparks the thread and
/// drops the runtime, aborting every task spawned on it — which is how the
/// transport closes its socket.
pub struct NetRuntime {
    handle: tokio::runtime::Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl NetRuntime {
    /// Creates the runtime and parks it on a new thread.
    pub fn spawn_new() -> Self {
        let runtime = Runtime::new().expect("failed to create tokio runtime");
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::spawn(move || {
            let _ = runtime.block_on(shutdown_rx);
        });

        Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    /// Handle for spawning tasks onto the parked runtime.
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Unparks and drops the runtime, aborting its tasks. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NetRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Unbounded queue carrying items from async tasks to the game thread.
///
/// Async tasks hold the sender; the game thread polls `try_recv`/`drain`
/// without blocking.
pub struct PacketQueue<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> PacketQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx: Arc::new(Mutex::new(rx)),
            tx,
        }
    }

    /// Sender side, for async tasks.
    pub fn sender(&self) -> mpsc::UnboundedSender<T> {
        self.tx.clone()
    }

    /// Enqueues an item from the game thread itself (local echo).
    pub fn push(&self, item: T) {
        let _ = self.tx.send(item);
    }

    /// Non-blocking single receive.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.lock().unwrap().try_recv().ok()
    }

    /// Drains everything that has arrived so far, in arrival order.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.try_recv() {
            items.push(item);
        }
        items
    }
}

impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_arrival_order() {
        let queue = PacketQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_queue_receives_from_runtime_task() {
        let mut runtime = NetRuntime::spawn_new();
        let queue = PacketQueue::new();

        let sender = queue.sender();
        runtime.handle().spawn(async move {
            for i in 0..5 {
                let _ = sender.send(i);
            }
        });

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut received = Vec::new();
        while received.len() < 5 && std::time::Instant::now() < deadline {
            received.extend(queue.drain());
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        runtime.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut runtime = NetRuntime::spawn_new();
        runtime.shutdown();
        runtime.shutdown();
    }
}
