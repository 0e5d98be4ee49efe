//! Outbound message queue and its worker thread
//!
//! Producers on any thread push messages; one dedicated thread drains them in
//! arrival order and hands each to a [`MessageConsumer`] that performs the
//! blocking write. Each push adds exactly one wake permit, and every wake
//! drains the whole queue.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::ipc::Message;
use crate::sync::lock;

const WORKER_THREAD_NAME: &str = "message-queue-worker";

/// Receives each dequeued message, one at a time, on the worker thread
pub trait MessageConsumer: Send + Sync {
    /// Take ownership of `message`; it is dropped once this returns
    fn consume_message(&self, message: Message);
}

/// Errors from worker lifecycle operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker thread is already running")]
    AlreadyRunning,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// A push was rejected because the worker is not running
///
/// The message is handed back to the caller.
#[derive(Debug, Error)]
#[error("message queue worker is not running")]
pub struct PushError(pub Message);

#[derive(Default)]
struct Queue {
    messages: VecDeque<Message>,
    permits: usize,
    accepting: bool,
    done: bool,
    /// Set by the worker thread as it leaves the drain loop
    finished: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        lock(&self.queue)
    }

    fn push(&self, message: Message) -> Result<(), PushError> {
        let mut queue = self.lock();
        if !queue.accepting {
            return Err(PushError(message));
        }
        queue.messages.push_back(message);
        queue.permits += 1;
        drop(queue);

        self.wakeup.notify_one();
        Ok(())
    }
}

/// Cloneable handle for pushing onto a worker's queue from other threads
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    /// Append `message` to the queue; see [`MessageQueueWorker::push_message`]
    pub fn push_message(&self, message: Message) -> Result<(), PushError> {
        self.shared.push(message)
    }

    /// Messages waiting for the worker
    pub fn len(&self) -> usize {
        self.shared.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the outbound queue and the thread that drains it
pub struct MessageQueueWorker {
    shared: Arc<Shared>,
    consumer: Arc<dyn MessageConsumer>,
    thread: Option<JoinHandle<()>>,
}

impl MessageQueueWorker {
    pub fn new(consumer: Arc<dyn MessageConsumer>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            consumer,
            thread: None,
        }
    }

    /// Spawn the worker thread; must happen before any push succeeds
    pub fn initialize(&mut self) -> Result<(), WorkerError> {
        if self.thread.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        {
            let mut queue = self.shared.lock();
            queue.accepting = true;
            queue.done = false;
            queue.finished = false;
        }

        let shared = Arc::clone(&self.shared);
        let consumer = Arc::clone(&self.consumer);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || drain_loop(&shared, consumer.as_ref()));

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                tracing::debug!("message queue worker started");
                Ok(())
            }
            Err(e) => {
                self.shared.lock().accepting = false;
                Err(WorkerError::Spawn(e))
            }
        }
    }

    /// Append `message` to the tail of the queue and wake the worker once
    ///
    /// Fails, returning the message, before [`initialize`](Self::initialize)
    /// or after [`shutdown`](Self::shutdown).
    pub fn push_message(&self, message: Message) -> Result<(), PushError> {
        self.shared.push(message)
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Refuse further pushes and tell the thread to exit once the queue is empty
    ///
    /// Does not wait; see [`wait_drained`](Self::wait_drained) and
    /// [`shutdown`](Self::shutdown).
    pub fn stop(&self) {
        {
            let mut queue = self.shared.lock();
            queue.accepting = false;
            queue.done = true;
        }
        self.shared.wakeup.notify_all();
    }

    /// Wait up to `timeout` for a stopped worker to deliver its backlog
    ///
    /// Returns `false` if the thread is still busy, e.g. blocked writing to a
    /// peer that stopped reading.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        if self.thread.is_none() {
            return true;
        }
        let queue = self.shared.lock();
        let (queue, _) = self
            .shared
            .idle
            .wait_timeout_while(queue, timeout, |queue| !queue.finished)
            .unwrap_or_else(PoisonError::into_inner);
        queue.finished
    }

    /// Stop accepting messages, deliver everything already queued, and join
    ///
    /// Blocks for as long as the consumer does. Calling this more than once
    /// is a no-op.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.stop();
        if thread.join().is_err() {
            tracing::error!("message queue worker panicked");
        }

        let leftover = std::mem::take(&mut self.shared.lock().messages);
        if !leftover.is_empty() {
            tracing::warn!(dropped = leftover.len(), "discarding undelivered messages");
        }
        tracing::debug!("message queue worker stopped");
    }
}

impl Drop for MessageQueueWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_loop(shared: &Shared, consumer: &dyn MessageConsumer) {
    loop {
        let batch = {
            let mut queue = shared.lock();
            while queue.permits == 0 && !queue.done {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if queue.done && queue.messages.is_empty() {
                queue.finished = true;
                break;
            }
            queue.permits = queue.permits.saturating_sub(1);
            std::mem::take(&mut queue.messages)
        };

        for message in batch {
            consumer.consume_message(message);
        }
    }
    shared.idle.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{MessageType, Notification};
    use std::sync::mpsc;

    /// Records the payload of every consumed message
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Vec<u8>>>,
        delay: Option<Duration>,
    }

    impl MessageConsumer for Recorder {
        fn consume_message(&self, message: Message) {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            self.seen.lock().unwrap().push(message.body().to_vec());
        }
    }

    fn message(tag: &[u8]) -> Message {
        Notification::new(MessageType::COMMAND, tag)
            .unwrap()
            .into_message()
    }

    #[test]
    fn test_single_producer_order_is_preserved() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = MessageQueueWorker::new(recorder.clone());
        worker.initialize().unwrap();

        for i in 0..500u32 {
            worker.push_message(message(&i.to_be_bytes())).unwrap();
        }
        worker.shutdown();

        let seen = recorder.seen.lock().unwrap();
        let expected: Vec<Vec<u8>> = (0..500u32).map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = MessageQueueWorker::new(recorder.clone());
        worker.initialize().unwrap();

        let producers: Vec<_> = (0..4u8)
            .map(|producer| {
                let handle = worker.handle();
                thread::spawn(move || {
                    for i in 0..100u8 {
                        handle.push_message(message(&[producer, i])).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        worker.shutdown();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 400);
        for producer in 0..4u8 {
            let order: Vec<u8> = seen
                .iter()
                .filter(|tag| tag[0] == producer)
                .map(|tag| tag[1])
                .collect();
            assert_eq!(order, (0..100u8).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_shutdown_drains_backlog() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(5)),
            ..Recorder::default()
        });
        let mut worker = MessageQueueWorker::new(recorder.clone());
        worker.initialize().unwrap();

        for i in 0..20u8 {
            worker.push_message(message(&[i])).unwrap();
        }
        worker.shutdown();

        assert_eq!(recorder.seen.lock().unwrap().len(), 20);
    }

    #[test]
    fn test_push_before_initialize_returns_message() {
        let worker = MessageQueueWorker::new(Arc::new(Recorder::default()));

        let PushError(returned) = worker.push_message(message(b"early")).unwrap_err();
        assert_eq!(returned.body(), b"early");
    }

    #[test]
    fn test_push_after_shutdown_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let mut worker = MessageQueueWorker::new(recorder.clone());
        worker.initialize().unwrap();
        let handle = worker.handle();
        worker.shutdown();
        worker.shutdown();

        assert!(handle.push_message(message(b"late")).is_err());
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(!worker.is_running());
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let mut worker = MessageQueueWorker::new(Arc::new(Recorder::default()));
        worker.initialize().unwrap();
        assert!(matches!(
            worker.initialize(),
            Err(WorkerError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_wait_drained_is_bounded_by_a_stuck_consumer() {
        struct Gate(Mutex<mpsc::Receiver<()>>);

        impl MessageConsumer for Gate {
            fn consume_message(&self, _message: Message) {
                let _ = self.0.lock().unwrap().recv();
            }
        }

        let (release, gate) = mpsc::channel();
        let mut worker = MessageQueueWorker::new(Arc::new(Gate(Mutex::new(gate))));
        worker.initialize().unwrap();
        worker.push_message(message(b"stuck")).unwrap();

        worker.stop();
        assert!(worker.push_message(message(b"late")).is_err());
        assert!(!worker.wait_drained(Duration::from_millis(100)));

        release.send(()).unwrap();
        assert!(worker.wait_drained(Duration::from_secs(5)));
        worker.shutdown();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_wait_drained_without_thread() {
        let worker = MessageQueueWorker::new(Arc::new(Recorder::default()));
        assert!(worker.wait_drained(Duration::ZERO));
    }

    #[test]
    fn test_consumer_runs_on_worker_thread() {
        struct ThreadName(mpsc::Sender<Option<String>>);

        impl MessageConsumer for ThreadName {
            fn consume_message(&self, _message: Message) {
                let name = thread::current().name().map(str::to_string);
                self.0.send(name).unwrap();
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut worker = MessageQueueWorker::new(Arc::new(ThreadName(tx)));
        worker.initialize().unwrap();
        worker.push_message(message(b"x")).unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
    }
}
