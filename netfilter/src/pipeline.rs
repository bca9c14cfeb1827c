//! Threaded receive pipeline
//!
//! A dedicated thread owns the socket reads. It waits for readability in
//! bounded slices so a shutdown request is noticed within one slice even
//! when no traffic arrives, screens every datagram, and parks the accepted
//! ones in a bounded queue. The game server's receive call site reads from
//! that queue instead of the socket.
//!
//! When the threaded mode is switched off and the queue has drained, reads
//! go straight to the socket again, still through the same screening.

use log::{debug, error, info, warn};
use shared::MAX_DATAGRAM_SIZE;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{FilterError, Result};
use crate::filter::{Netfilter, ReplySender};
use crate::queue::{AcceptedQueue, Packet};

/// Longest single wait for socket readability.
pub const POLL_WAIT: Duration = Duration::from_millis(100);
/// Pause between checks while the threaded mode is switched off.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Pause while the consumer catches up with a full queue.
const STALL_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
}

/// Something the game server can pull screened datagrams from.
///
/// Returns `WouldBlock` when nothing is available, like a non-blocking socket.
pub trait PacketSource {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Raw datagram read underneath the direct path.
pub trait DatagramSocket: ReplySender {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DatagramSocket for UdpSocket {
    fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf)
    }
}

/// Reads the socket directly, screening inline.
///
/// Receive errors never reach the consumer; they are logged and reported
/// as `WouldBlock`.
pub struct DirectSource<'a, S = UdpSocket> {
    socket: &'a S,
    filter: &'a Netfilter,
}

impl<S: DatagramSocket> PacketSource for DirectSource<'_, S> {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, from) = match self.socket.recv_datagram(buf) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
            Err(e) => {
                warn!("Error receiving packet: {}", e);
                return Err(no_data());
            }
        };
        if self.filter.screen(&buf[..len], from, self.socket).is_delivered() {
            Ok((len, from))
        } else {
            Err(no_data())
        }
    }
}

/// Pops datagrams the receive thread already screened.
pub struct QueueSource<'a> {
    queue: &'a AcceptedQueue,
}

impl PacketSource for QueueSource<'_> {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let packet = self.queue.pop().ok_or_else(no_data)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet.data[..len]);
        Ok((len, packet.from))
    }
}

/// The source currently selected for the consumer.
pub enum ActiveSource<'a> {
    Direct(DirectSource<'a>),
    Queue(QueueSource<'a>),
}

impl PacketSource for ActiveSource<'_> {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            ActiveSource::Direct(source) => source.recv_from(buf),
            ActiveSource::Queue(source) => source.recv_from(buf),
        }
    }
}

fn no_data() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "no screened packet available")
}

pub struct ReceivePipeline {
    socket: Arc<UdpSocket>,
    filter: Arc<Netfilter>,
    queue: Arc<AcceptedQueue>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ReceivePipeline {
    /// Takes over the game socket. The socket is switched to non-blocking
    /// mode so direct reads never stall the game loop.
    pub fn new(socket: UdpSocket, filter: Arc<Netfilter>, queue_capacity: usize) -> Result<Self> {
        socket.set_nonblocking(true).map_err(FilterError::Socket)?;
        let local = socket.local_addr().map_err(FilterError::Socket)?;
        debug!("Receive pipeline attached to {}", local);

        Ok(Self {
            socket: Arc::new(socket),
            filter,
            queue: Arc::new(AcceptedQueue::new(queue_capacity)),
            shutdown: CancellationToken::new(),
            worker: None,
        })
    }

    pub fn state(&self) -> PipelineState {
        match &self.worker {
            Some(worker) if !worker.is_finished() => PipelineState::Running,
            _ => PipelineState::Stopped,
        }
    }

    /// Spawns the receive thread.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.as_ref().is_some_and(|worker| worker.is_finished()) {
            self.reap();
        }
        if self.worker.is_some() {
            return Err(FilterError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(FilterError::Runtime)?;

        let socket = {
            let _guard = runtime.enter();
            let handle = self.socket.try_clone().map_err(FilterError::Socket)?;
            tokio::net::UdpSocket::from_std(handle).map_err(FilterError::Socket)?
        };

        let shutdown = CancellationToken::new();
        self.shutdown = shutdown.clone();
        let filter = Arc::clone(&self.filter);
        let queue = Arc::clone(&self.queue);

        let worker = thread::Builder::new()
            .name("netfilter-recv".to_string())
            .spawn(move || {
                runtime.block_on(receive_loop(socket, filter, queue, shutdown));
            })
            .map_err(FilterError::ThreadSpawn)?;

        self.worker = Some(worker);
        info!("Receive pipeline started");
        Ok(())
    }

    /// Asks the receive thread to exit and waits for it. The thread checks
    /// for the request at least every [`POLL_WAIT`].
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.shutdown.cancel();
        if worker.join().is_err() {
            error!("Receive thread panicked");
        }
        info!("Receive pipeline stopped");
    }

    /// Collects a receive thread that already exited on its own.
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Receive thread panicked");
            }
        }
    }

    /// True when screened packets are flowing through the queue.
    pub fn is_threaded(&self) -> bool {
        self.state() == PipelineState::Running && self.filter.is_threaded()
    }

    /// Picks where the next consumer read comes from.
    pub fn source(&self) -> ActiveSource<'_> {
        if !self.is_threaded() && self.queue.is_empty() {
            ActiveSource::Direct(DirectSource {
                socket: &self.socket,
                filter: &self.filter,
            })
        } else {
            ActiveSource::Queue(QueueSource { queue: &self.queue })
        }
    }

    /// Drop-in replacement for the game server's own socket read.
    ///
    /// Copies at most `buf.len()` bytes; longer datagrams are truncated.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.source().recv_from(buf)
    }

    pub fn filter(&self) -> &Arc<Netfilter> {
        &self.filter
    }

    pub fn queue(&self) -> &AcceptedQueue {
        &self.queue
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(
    socket: tokio::net::UdpSocket,
    filter: Arc<Netfilter>,
    queue: Arc<AcceptedQueue>,
    shutdown: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut stalled = false;

    loop {
        if !filter.is_threaded() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(IDLE_WAIT) => continue,
            }
        }

        // Leave excess traffic in the kernel buffer rather than growing ours.
        if queue.is_full() {
            if !stalled {
                debug!("Accepted queue full, pausing socket reads");
                stalled = true;
            }
            filter.note_stall();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(STALL_WAIT) => continue,
            }
        }
        stalled = false;

        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = timeout(POLL_WAIT, socket.recv_from(&mut buffer)) => result,
        };

        let (len, from) = match received {
            Err(_elapsed) => continue,
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => {
                warn!("Error receiving packet: {}", e);
                continue;
            }
            Ok(Ok(received)) => received,
        };

        let data = &buffer[..len];
        if filter.screen(data, from, &socket).is_delivered() {
            if let Err(packet) = queue.push(Packet::new(from, data)) {
                debug!("Accepted queue full, dropped {} bytes from {}", packet.len(), from);
            }
        }
    }

    debug!("Receive loop exiting");
}
