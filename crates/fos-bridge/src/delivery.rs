//! Delivery Context
//!
//! A single named thread that every completion and every channel relay is
//! handed to the host on. Callbacks run one at a time, in posting order, and
//! a panicking callback is logged without taking the thread down.

use crate::BridgeError;
use smol::channel::{self, Receiver, Sender, TryRecvError};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type DeliveryFn = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(DeliveryFn),
    Shutdown,
}

/// Owner of the delivery thread
pub struct DeliveryContext {
    sender: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("queued", &self.sender.len())
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl DeliveryContext {
    /// Spawn the delivery thread
    pub fn start() -> std::io::Result<Self> {
        let (sender, receiver) = channel::unbounded();

        let thread = thread::Builder::new()
            .name("fos-bridge-delivery".to_string())
            .spawn(move || run_loop(receiver))?;

        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> DeliveryHandle {
        DeliveryHandle {
            sender: self.sender.clone(),
        }
    }

    /// Deliver everything already posted, then stop the thread
    pub fn shutdown(&self) {
        // Fails only when the thread is already gone
        let _ = self.sender.try_send(Message::Shutdown);

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Delivery thread panicked");
            }
        }
    }
}

impl Drop for DeliveryContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv_blocking() {
        match message {
            Message::Run(callback) => run_callback(callback),
            Message::Shutdown => break,
        }
    }

    // Late posts fall back to running inline on the poster's thread
    receiver.close();
    while let Ok(message) = receiver.try_recv() {
        if let Message::Run(callback) = message {
            run_callback(callback);
        }
    }
    tracing::trace!("Delivery thread exiting");
}

fn run_callback(callback: DeliveryFn) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("Host callback panicked during delivery");
    }
}

/// Cloneable sender onto the delivery thread
#[derive(Clone)]
pub struct DeliveryHandle {
    sender: Sender<Message>,
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl DeliveryHandle {
    /// Queue a callback for the delivery thread.
    ///
    /// Once the thread has stopped the callback runs on the caller's thread
    /// instead, so nothing posted is ever lost.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.sender.try_send(Message::Run(Box::new(callback))) {
            if let Message::Run(callback) = err.into_inner() {
                run_callback(callback);
            }
        }
    }
}

type Sink<T> = Box<dyn FnOnce(Result<T, BridgeError>) + Send + 'static>;

/// Single-shot sender for the outcome of one operation.
///
/// Dropping a responder without completing it delivers
/// [`BridgeError::Cancelled`].
pub struct Responder<T: Send + 'static> {
    sink: Option<Sink<T>>,
    delivery: DeliveryHandle,
}

impl<T: Send + 'static> Responder<T> {
    /// Responder that hands the outcome to `callback` on the delivery thread
    pub fn new<F>(delivery: DeliveryHandle, callback: F) -> Self
    where
        F: FnOnce(Result<T, BridgeError>) + Send + 'static,
    {
        Self {
            sink: Some(Box::new(callback)),
            delivery,
        }
    }

    pub fn complete(mut self, result: Result<T, BridgeError>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: Result<T, BridgeError>) {
        if let Some(sink) = self.sink.take() {
            self.delivery.post(move || sink(result));
        }
    }
}

impl<T: Send + 'static> Drop for Responder<T> {
    fn drop(&mut self) {
        self.deliver(Err(BridgeError::Cancelled));
    }
}

impl<T: Send + 'static> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("completed", &self.sink.is_none())
            .finish()
    }
}

/// Responder/completion pair
pub fn completion<T: Send + 'static>(delivery: &DeliveryHandle) -> (Responder<T>, Completion<T>) {
    let (sender, receiver) = channel::bounded(1);
    let responder = Responder::new(delivery.clone(), move |result| {
        // The host may have dropped its completion
        let _ = sender.try_send(result);
    });
    (responder, Completion { receiver })
}

/// Receiving end of one operation.
///
/// Blocking hosts call [`Completion::wait`]; async hosts `.await`
/// [`Completion::recv`].
#[derive(Debug)]
pub struct Completion<T> {
    receiver: Receiver<Result<T, BridgeError>>,
}

impl<T> Completion<T> {
    /// Completion that already holds its outcome
    pub fn ready(result: Result<T, BridgeError>) -> Self {
        let (sender, receiver) = channel::bounded(1);
        let _ = sender.try_send(result);
        Self { receiver }
    }

    /// Block until the outcome is delivered
    pub fn wait(self) -> Result<T, BridgeError> {
        self.receiver
            .recv_blocking()
            .unwrap_or(Err(BridgeError::Cancelled))
    }

    /// Wait at most `timeout`; `None` if nothing was delivered in time
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, BridgeError>> {
        smol::block_on(smol::future::or(
            async { Some(self.recv().await) },
            async {
                smol::Timer::after(timeout).await;
                None
            },
        ))
    }

    /// Await the outcome
    pub fn recv(&self) -> impl Future<Output = Result<T, BridgeError>> + '_ {
        async move {
            self.receiver
                .recv()
                .await
                .unwrap_or(Err(BridgeError::Cancelled))
        }
    }

    /// Outcome if it has already been delivered
    pub fn try_recv(&self) -> Option<Result<T, BridgeError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(BridgeError::Cancelled)),
        }
    }
}
