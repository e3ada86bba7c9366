//! Process-wide backend client with lazy, single-flight initialization and
//! explicit shutdown.

use crate::error::{Result, ShortstackError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{watch, OnceCell};

type ConnectFuture<C> = Pin<Box<dyn Future<Output = Result<C>> + Send>>;
type ConnectFn<C> = Box<dyn Fn() -> ConnectFuture<C> + Send + Sync>;

/// Cancellation flag observed by retry loops. Trips once, never resets.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelSignal { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal trips. Pending forever if the owning handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct ClientHandle<C> {
    name: String,
    cell: OnceCell<C>,
    connect: ConnectFn<C>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl<C> ClientHandle<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// `connect` runs at most once, on first use. Concurrent first callers
    /// wait for the same connection attempt. A failed attempt is retried on
    /// the next call.
    pub fn new<F, Fut>(name: impl Into<String>, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let (shutdown_tx, _) = watch::channel(false);
        ClientHandle {
            name: name.into(),
            cell: OnceCell::new(),
            connect: Box::new(move || Box::pin(connect())),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Handle around an already connected client.
    pub fn ready(name: impl Into<String>, client: C) -> Self {
        let name = name.into();
        let (shutdown_tx, _) = watch::channel(false);
        ClientHandle {
            connect: Box::new({
                let name = name.clone();
                move || {
                    let name = name.clone();
                    Box::pin(async move {
                        Err(ShortstackError::Backend(format!(
                            "client {} cannot reconnect",
                            name
                        )))
                    })
                }
            }),
            name,
            cell: OnceCell::new_with(Some(client)),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn get(&self) -> Result<C> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShortstackError::ShuttingDown);
        }
        let client = self
            .cell
            .get_or_try_init(|| async {
                tracing::info!("[CLIENT {}] connecting", self.name);
                (self.connect)().await
            })
            .await?;
        Ok(client.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    /// Refuses new calls and trips the cancellation signal so in-flight
    /// batch retries stop.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("[CLIENT {}] shutting down", self.name);
            self.shutdown_tx.send_replace(true);
        }
    }
}
