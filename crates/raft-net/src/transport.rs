//! # transport
//!
//! why: move raw datagrams between this node and each neighbor address
//! relations: used by network.rs, knows nothing about envelopes or node ids
//! what: Transport (one udp socket, one reader task), Link (per-address
//!       write pump and receive task), idle link pruning, fault injection
//!       by drop rate

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::NetworkError;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_507;

/// Bytes received from one address
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Shared per-side loss probability
#[derive(Debug, Default)]
struct DropRate(Mutex<f64>);

impl DropRate {
    fn should_drop(&self) -> bool {
        let p = *self.0.lock();
        p > 0.0 && rand::thread_rng().gen::<f64>() < p
    }
}

fn per_side_rate(rate: f64) -> f64 {
    1.0 - (1.0 - rate.clamp(0.0, 1.0)).sqrt()
}

/// One neighbor address with its own outbound and inbound queues
pub struct Link {
    last_send: Mutex<Instant>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    write_pump: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl Link {
    fn open(
        addr: SocketAddr,
        socket: Arc<UdpSocket>,
        drop_rate: Arc<DropRate>,
        sink: mpsc::UnboundedSender<Datagram>,
    ) -> Self {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound, mut inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let send_rate = drop_rate.clone();
        let write_pump = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if send_rate.should_drop() {
                    trace!(%addr, "dropped outbound datagram");
                    continue;
                }
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    debug!(%addr, error = %e, "send failed");
                }
            }
        });

        let receiver = tokio::spawn(async move {
            while let Some(bytes) = inbound_rx.recv().await {
                if drop_rate.should_drop() {
                    trace!(%addr, "dropped inbound datagram");
                    continue;
                }
                if sink.send(Datagram { from: addr, bytes }).is_err() {
                    break;
                }
            }
        });

        Self {
            last_send: Mutex::new(Instant::now()),
            outbound,
            inbound,
            write_pump,
            receiver,
        }
    }

    /// Queue bytes for the write pump; never waits on the socket
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        *self.last_send.lock() = Instant::now();
        self.outbound.send(bytes).map_err(|_| NetworkError::Closed)
    }

    /// Time since this side last sent anything over the link
    pub fn idle(&self) -> Duration {
        self.last_send.lock().elapsed()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.write_pump.abort();
        self.receiver.abort();
    }
}

/// A bound UDP socket demultiplexed into per-address links
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    links: Arc<Mutex<HashMap<SocketAddr, Link>>>,
    drop_rate: Arc<DropRate>,
    sink: mpsc::UnboundedSender<Datagram>,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Bind `addr` and start reading; received datagrams come out of the returned channel
    pub async fn bind(addr: SocketAddr) -> io::Result<(Self, mpsc::UnboundedReceiver<Datagram>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (sink, inbound) = mpsc::unbounded_channel();
        let links: Arc<Mutex<HashMap<SocketAddr, Link>>> = Arc::default();
        let drop_rate: Arc<DropRate> = Arc::default();

        let reader = tokio::spawn(Self::read_loop(
            socket.clone(),
            links.clone(),
            drop_rate.clone(),
            sink.clone(),
        ));

        let transport = Self {
            socket,
            local_addr,
            links,
            drop_rate,
            sink,
            reader,
        };
        Ok((transport, inbound))
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        links: Arc<Mutex<HashMap<SocketAddr, Link>>>,
        drop_rate: Arc<DropRate>,
        sink: mpsc::UnboundedSender<Datagram>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "recv failed");
                    continue;
                }
            };
            if sink.is_closed() {
                break;
            }

            let bytes = buf[..len].to_vec();
            {
                let links = links.lock();
                if let Some(link) = links.get(&from) {
                    // a closed inbound queue only means the link is being torn down
                    let _ = link.inbound.send(bytes);
                    continue;
                }
            }
            // unknown sources get no link of their own until this side answers them
            if drop_rate.should_drop() {
                trace!(%from, "dropped inbound datagram");
                continue;
            }
            if sink.send(Datagram { from, bytes }).is_err() {
                break;
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue `bytes` for `addr`, opening a link on first use
    pub fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> Result<(), NetworkError> {
        if bytes.len() > MAX_DATAGRAM {
            return Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds {}", bytes.len(), MAX_DATAGRAM),
            )));
        }
        let mut links = self.links.lock();
        let link = links.entry(addr).or_insert_with(|| {
            Link::open(addr, self.socket.clone(), self.drop_rate.clone(), self.sink.clone())
        });
        link.send(bytes)
    }

    /// Tear down the link to `addr`; the next send to it opens a fresh one
    pub fn close(&self, addr: SocketAddr) {
        self.links.lock().remove(&addr);
    }

    /// Close every link `keep` rejects, given its address and idle time; returns how many closed
    pub fn retain_links(&self, mut keep: impl FnMut(SocketAddr, Duration) -> bool) -> usize {
        let mut links = self.links.lock();
        let before = links.len();
        links.retain(|addr, link| keep(*addr, link.idle()));
        before - links.len()
    }

    #[cfg(test)]
    fn link_addrs(&self) -> Vec<SocketAddr> {
        self.links.lock().keys().copied().collect()
    }

    /// Outbound and inbound each drop with `1 - sqrt(1 - rate)`, so a
    /// request/reply exchange with this node fails with probability `rate`
    pub fn set_drop_rate(&self, rate: f64) {
        *self.drop_rate.0.lock() = per_side_rate(rate);
    }

    /// Stop reading and drop every link
    pub fn shutdown(&self) {
        self.reader.abort();
        self.links.lock().clear();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
