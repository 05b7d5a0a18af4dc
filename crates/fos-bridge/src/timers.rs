//! Timer Wakeups
//!
//! A single named thread that sleeps until the earliest engine timer is due,
//! then queues a timer job on that engine's handle. Engines only say when
//! they next need to run; the callbacks themselves run on the worker pool.

use crate::handle::EngineHandle;
use smol::channel::{self, Receiver, RecvError, Sender};
use smol::Timer;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct Wakeup {
    at: Instant,
    handle: Weak<EngineHandle>,
}

impl PartialEq for Wakeup {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for Wakeup {}

impl PartialOrd for Wakeup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wakeup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

enum Message {
    Schedule(Wakeup),
    Shutdown,
}

enum Event {
    Received(Result<Message, RecvError>),
    Elapsed,
}

/// Owner of the timer thread
pub(crate) struct TimerThread {
    sender: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn start() -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();

        let thread = thread::Builder::new()
            .name("fos-bridge-timers".to_string())
            .spawn(move || smol::block_on(run_loop(receiver)))?;

        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn handle(&self) -> TimerHandle {
        TimerHandle {
            sender: self.sender.clone(),
        }
    }

    /// Stop the thread; wakeups not yet due are dropped
    pub(crate) fn shutdown(&self) {
        let _ = self.sender.try_send(Message::Shutdown);

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("Timer thread panicked");
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_loop(receiver: Receiver<Message>) {
    let mut queue: BinaryHeap<Reverse<Wakeup>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while matches!(queue.peek(), Some(Reverse(next)) if next.at <= now) {
            if let Some(Reverse(wakeup)) = queue.pop() {
                if let Some(handle) = wakeup.handle.upgrade() {
                    handle.fire_timers();
                }
            }
        }

        let event = match queue.peek() {
            Some(Reverse(next)) => {
                let at = next.at;
                smol::future::or(async { Event::Received(receiver.recv().await) }, async {
                    Timer::at(at).await;
                    Event::Elapsed
                })
                .await
            }
            None => Event::Received(receiver.recv().await),
        };

        match event {
            Event::Elapsed => {}
            Event::Received(Ok(Message::Schedule(wakeup))) => queue.push(Reverse(wakeup)),
            Event::Received(Ok(Message::Shutdown)) | Event::Received(Err(_)) => break,
        }
    }

    tracing::trace!(dropped = queue.len(), "Timer thread exiting");
}

/// Cloneable sender onto the timer thread
#[derive(Clone)]
pub(crate) struct TimerHandle {
    sender: Sender<Message>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl TimerHandle {
    /// Queue a timer job on `handle` at `at`; ignored once the thread stopped
    pub(crate) fn schedule(&self, at: Instant, handle: Weak<EngineHandle>) {
        if self
            .sender
            .try_send(Message::Schedule(Wakeup { at, handle }))
            .is_err()
        {
            tracing::trace!("Timer thread stopped; wakeup dropped");
        }
    }
}
