use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{Builder, JoinHandle};

use crate::error::{Error, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed pool of worker threads draining frame reads.
///
/// The edge-triggered strategy hands one task per readable fd per readiness
/// batch to this pool, so a slow peer stalls only the worker it landed on.
/// Tasks are dispatched round-robin over per-worker channels.
pub struct ThreadPool {
    workers: Vec<Worker>,
    senders: Vec<Sender<WorkerMessage>>,
    next_worker: AtomicUsize,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Self {
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::<WorkerMessage>();
            workers.push(Worker::new(id, receiver));
            senders.push(sender);
        }

        Self {
            workers,
            senders,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(WorkerMessage::Task(Box::new(task)))
            .map_err(|_| Error::PoolClosed)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.take_thread() {
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    #[allow(dead_code)]
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Receiver<WorkerMessage>) -> Self {
        let thread = Some(
            Builder::new()
                .name(format!("frame-read-worker-{id}"))
                .spawn(move || {
                    while let Ok(message) = receiver.recv() {
                        match message {
                            WorkerMessage::Task(task) => task(),
                            WorkerMessage::Terminate => break,
                        }
                    }
                })
                .expect("Couldn't create the worker thread id={id}"),
        );

        Self { id, thread }
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}
