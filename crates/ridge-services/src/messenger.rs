//! Messenger — one-message-per-connection transport shared by every node role.
//!
//! Every send, receive, and accept runs as its own task. Send and receive
//! tasks are bounded by a semaphore of `concurrency` permits; the accept
//! loop runs on a dedicated task outside that bound. Whatever a task
//! produces, success or captured fault, lands in one completion queue as
//! an [`Event`]. [`Messenger::get_event`] hands events out one at a time in
//! the order they completed.
//!
//! A connection carries exactly one frame and is then closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use ridge_core::wire::{FrameHeader, Message, WireError, HEADER_LEN};

/// Upper bound on any single connect, read, or write.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("undecodable frame: {0}")]
    Wire(#[from] WireError),

    #[error("timed out after {}s", IO_TIMEOUT.as_secs())]
    TimedOut,

    #[error("messenger is stopped")]
    Closed,

    #[error("messenger was created without a listening address")]
    SendOnly,
}

/// Outcome of one transport operation.
#[derive(Debug)]
pub enum Event {
    /// The accept loop produced a connection (or failed to).
    ConnectionReceived(Result<(TcpStream, SocketAddr), TransportError>),

    /// A send finished. `result` is the delivery outcome.
    MessageSent {
        message: Message,
        destination: SocketAddr,
        result: Result<(), TransportError>,
    },

    /// A receive finished.
    MessageReceived {
        source: SocketAddr,
        result: Result<Message, TransportError>,
    },

    /// [`Messenger::interrupt`] was called.
    Interrupted,
}

impl Event {
    /// True when the event carries a captured fault.
    pub fn is_failure(&self) -> bool {
        match self {
            Event::ConnectionReceived(r) => r.is_err(),
            Event::MessageSent { result, .. } => result.is_err(),
            Event::MessageReceived { result, .. } => result.is_err(),
            Event::Interrupted => false,
        }
    }
}

// ── Messenger ─────────────────────────────────────────────────────────────────

pub struct Messenger {
    local_addr: Option<SocketAddr>,
    listener: Mutex<Option<TcpListener>>,
    listening: AtomicBool,
    permits: Arc<Semaphore>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    interrupt: Notify,
    tasks: Mutex<JoinSet<()>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Bind a listening socket. Accepting starts with [`Messenger::listen`].
    pub async fn bind(addr: SocketAddr, concurrency: usize) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::debug!(addr = %local, concurrency, "messenger bound");
        Ok(Self::build(Some(listener), Some(local), concurrency))
    }

    /// A messenger that only sends and receives on connections it opens.
    pub fn send_only(concurrency: usize) -> Self {
        Self::build(None, None, concurrency)
    }

    fn build(listener: Option<TcpListener>, local_addr: Option<SocketAddr>, concurrency: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            local_addr,
            listener: Mutex::new(listener),
            listening: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            interrupt: Notify::new(),
            tasks: Mutex::new(JoinSet::new()),
            accept_task: Mutex::new(None),
        }
    }

    /// Bound address, if this messenger listens.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start the accept loop. Repeat calls are no-ops.
    ///
    /// The loop keeps exactly one accept outstanding and re-arms after every
    /// accepted connection, including after a failed accept.
    pub fn listen(&self) -> Result<(), TransportError> {
        if self.local_addr.is_none() {
            return Err(TransportError::SendOnly);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = lock(&self.listener).take().ok_or(TransportError::Closed)?;
        let tx = self.events_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let result = listener.accept().await.map_err(TransportError::from);
                let failed = result.is_err();
                if tx.send(Event::ConnectionReceived(result)).is_err() {
                    break;
                }
                if failed {
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        });
        *lock(&self.accept_task) = Some(handle);
        tracing::debug!(addr = ?self.local_addr, "accept loop started");
        Ok(())
    }

    /// Deliver `message` to `destination` on a fresh connection.
    ///
    /// Never blocks. A [`Event::MessageSent`] follows with the outcome.
    pub fn send(&self, message: Message, destination: SocketAddr) {
        let permits = self.permits.clone();
        let tx = self.events_tx.clone();
        self.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => with_timeout(send_to(&message, destination)).await,
                Err(_) => Err(TransportError::Closed),
            };
            if let Err(e) = &result {
                tracing::debug!(kind = ?message.kind(), %destination, error = %e, "send failed");
            }
            let _ = tx.send(Event::MessageSent {
                message,
                destination,
                result,
            });
        });
    }

    /// Read one message from an accepted connection.
    ///
    /// Never blocks. A [`Event::MessageReceived`] follows with the outcome.
    pub fn receive(&self, mut stream: TcpStream) {
        let permits = self.permits.clone();
        let tx = self.events_tx.clone();
        self.spawn(async move {
            let source = stream
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            let result = match permits.acquire_owned().await {
                Ok(_permit) => with_timeout(read_frame(&mut stream)).await,
                Err(_) => Err(TransportError::Closed),
            };
            let _ = tx.send(Event::MessageReceived { source, result });
        });
    }

    /// Connect to `source` and read one message from it.
    pub fn receive_from(&self, source: SocketAddr) {
        let permits = self.permits.clone();
        let tx = self.events_tx.clone();
        self.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => {
                    with_timeout(async {
                        match TcpStream::connect(source).await {
                            Ok(mut stream) => read_frame(&mut stream).await,
                            Err(e) => Err(TransportError::Io(e)),
                        }
                    })
                    .await
                }
                Err(_) => Err(TransportError::Closed),
            };
            let _ = tx.send(Event::MessageReceived { source, result });
        });
    }

    /// Wait for the next completed operation.
    ///
    /// Only one caller receives events at a time. An [`Messenger::interrupt`]
    /// issued before or during the wait yields [`Event::Interrupted`].
    pub async fn get_event(&self) -> Event {
        let mut rx = tokio::select! {
            rx = self.events_rx.lock() => rx,
            _ = self.interrupt.notified() => return Event::Interrupted,
        };
        tokio::select! {
            ev = rx.recv() => ev.unwrap_or(Event::Interrupted),
            _ = self.interrupt.notified() => Event::Interrupted,
        }
    }

    /// Next completed operation, if one is already waiting.
    pub fn get_event_if_present(&self) -> Option<Event> {
        let mut rx = self.events_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// [`Messenger::get_event`] bounded by `timeout`. `None` on expiry.
    pub async fn get_event_timeout(&self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.get_event()).await.ok()
    }

    /// Wake the current (or next) [`Messenger::get_event`] caller with
    /// [`Event::Interrupted`].
    pub fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    /// Close the accepting socket and refuse new work. Operations already
    /// running finish on their own.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.accept_task).take() {
            handle.abort();
        }
        lock(&self.listener).take();
        self.permits.close();
        tracing::debug!(addr = ?self.local_addr, "messenger stopped");
    }

    /// [`Messenger::stop`], then wait up to `timeout` for in-flight
    /// operations. Returns true if everything finished in time; otherwise
    /// the stragglers are left to finish in the background.
    pub async fn stop_timeout(&self, timeout: Duration) -> bool {
        self.stop();
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            tasks.detach_all();
        }
        drained
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.accept_task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Framing ───────────────────────────────────────────────────────────────────

async fn with_timeout<T, F>(fut: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    tokio::time::timeout(IO_TIMEOUT, fut)
        .await
        .unwrap_or(Err(TransportError::TimedOut))
}

async fn send_to(message: &Message, destination: SocketAddr) -> Result<(), TransportError> {
    let mut stream = TcpStream::connect(destination).await?;
    write_frame(&mut stream, message).await
}

/// Write one complete frame and close the write side.
pub async fn write_frame<W>(w: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.to_frame();
    w.write_all(&frame).await?;
    w.flush().await?;
    w.shutdown().await?;
    tracing::trace!(kind = ?message.kind(), len = frame.len(), "frame written");
    Ok(())
}

/// Read one complete frame.
pub async fn read_frame<R>(r: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = vec![0u8; HEADER_LEN];
    r.read_exact(&mut frame).await?;
    let (_, body_len) = FrameHeader::parse(&frame)?;
    frame.resize(HEADER_LEN + body_len, 0);
    r.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(Message::from_frame(&frame)?)
}
