//! Module for scheduling the events that the daemon should handle.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, Interval};

/// Tells every listener loop to wind down
#[derive(Clone)]
pub struct InterruptFlag {
    send: Arc<watch::Sender<bool>>,
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptFlag {
    pub fn new() -> Self {
        let (send, _) = watch::channel(false);
        Self {
            send: Arc::new(send),
        }
    }

    pub fn interrupt(&self) {
        self.send.send_replace(true);
    }

    pub async fn interrupted(&self) {
        let mut recv = self.send.subscribe();
        _ = recv.wait_for(|interrupted| *interrupted).await;
    }
}

/// A struct for creating biased combined futures
/// for interrupts, incoming connections, and periodic work.
/// This will act as an event scheduler for a listener
pub struct EventScheduler {
    listener: TcpListener,
    interrupt_flag: InterruptFlag,
    ticks: Option<Interval>,
}

impl EventScheduler {
    /// Create a new event scheduler
    pub fn new(listener: TcpListener, interrupt_flag: InterruptFlag) -> Self {
        Self {
            listener,
            interrupt_flag,
            ticks: None,
        }
    }

    /// Additionally emit [`NextEvent::Tick`] on every tick of `ticks`
    pub fn with_ticks(mut self, ticks: Interval) -> Self {
        self.ticks = Some(ticks);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get the next scheduled event
    pub fn next_query(&mut self) -> NextQuery<'_> {
        NextQuery {
            interrupted: self.interrupt_flag.interrupted().boxed(),
            accept: self.listener.accept().boxed(),
            tick: self.ticks.as_mut().map(|ticks| ticks.tick().boxed()),
        }
    }
}

/// The next scheduled event
#[derive(Debug)]
pub enum NextEvent {
    /// An interrupt request was received
    Interrupt,
    /// A peer connected
    Accept(TcpStream, SocketAddr),
    /// Accepting a connection failed
    AcceptFailed,
    /// Time for periodic work
    Tick,
}

/// A future which first checks for an interrupt, then
/// checks for an incoming connection, then for a tick.
pub struct NextQuery<'a> {
    interrupted: BoxFuture<'a, ()>,
    accept: BoxFuture<'a, std::io::Result<(TcpStream, SocketAddr)>>,
    tick: Option<BoxFuture<'a, Instant>>,
}

impl Future for NextQuery<'_> {
    type Output = NextEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.interrupted.as_mut().poll(cx).is_ready() {
            return Poll::Ready(NextEvent::Interrupt);
        }
        match self.accept.as_mut().poll(cx) {
            Poll::Ready(Ok((stream, addr))) => return Poll::Ready(NextEvent::Accept(stream, addr)),
            Poll::Ready(Err(e)) => {
                tracing::error!(
                    "Encountered unexpected error while listening for new connections: {e}"
                );
                return Poll::Ready(NextEvent::AcceptFailed);
            }
            Poll::Pending => {}
        }
        match self.tick.as_mut().map(|tick| tick.as_mut().poll(cx)) {
            Some(Poll::Ready(_)) => Poll::Ready(NextEvent::Tick),
            _ => Poll::Pending,
        }
    }
}
