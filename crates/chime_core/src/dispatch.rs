use std::collections::VecDeque;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::PostError;

pub type Work = Box<dyn FnOnce() + Send>;

pub trait Dispatcher: Send + Sync {
    fn post(&self, work: Work) -> Result<(), PostError>;

    /// Inline dispatchers run work on the posting thread, which is what allows fixed-delay
    /// repeats to measure from callback completion.
    fn is_inline(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Dispatcher for Inline {
    fn post(&self, work: Work) -> Result<(), PostError> {
        work();
        Ok(())
    }

    fn is_inline(&self) -> bool {
        true
    }
}

/// Queue drained by its owner, typically once per frame of an application loop.
pub struct RunQueue {
    name: String,
    state: Mutex<RunQueueState>,
}

struct RunQueueState {
    pending: VecDeque<Work>,
    closed: bool,
}

impl RunQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RunQueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the work queued so far; anything posted meanwhile waits for the next call.
    pub fn run_pending(&self) -> usize {
        let batch = std::mem::take(&mut self.state.lock().pending);
        let count = batch.len();
        for work in batch {
            work();
        }
        count
    }

    pub fn close(&self) {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        debug!(queue = %self.name, discarded = discarded.len(), "run queue closed");
    }
}

impl Dispatcher for RunQueue {
    fn post(&self, work: Work) -> Result<(), PostError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PostError::Closed(self.name.clone()));
        }
        state.pending.push_back(work);
        Ok(())
    }
}

pub struct WorkerThread {
    name: String,
    sender: Mutex<Option<Sender<Work>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Work>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(work) = receiver.recv() {
                work();
            }
        })?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting work, lets queued work finish and joins the worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Dispatcher for WorkerThread {
    fn post(&self, work: Work) -> Result<(), PostError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(PostError::Closed(self.name.clone()));
        };
        sender
            .send(work)
            .map_err(|_| PostError::Closed(self.name.clone()))
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
