//! Collaborators the engine runs on: a shared datagram endpoint and a
//! periodic scheduler, plus their tokio implementations.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Callback for datagrams carrying a registered prefix (prefix stripped)
pub type Receiver = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

/// Work run on every tick of a periodic task
pub type PeriodicTask = Box<dyn Fn() + Send + Sync>;

/// One-shot work that may block on file I/O
pub type BlockingTask = Box<dyn FnOnce() + Send>;

/// Shortest period a periodic task may run at
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A datagram endpoint shared between protocols, each identified by a prefix
pub trait Endpoint: Send + Sync {
    /// Send `prefix ++ data` to `peer`. Must not block.
    fn send_packet(&self, peer: SocketAddr, data: &[u8], prefix: &[u8]) -> io::Result<()>;

    /// Route datagrams starting with `prefix` to `receiver`
    fn listen_to(&self, prefix: &[u8], receiver: Receiver);
}

pub trait Scheduler: Send + Sync {
    fn schedule_periodic(&self, name: &str, interval: Duration, task: PeriodicTask) -> TaskHandle;

    /// Run `task` away from the thread that dispatches datagrams
    fn spawn_blocking(&self, task: BlockingTask);
}

/// Cancels a scheduled task when told to
pub struct TaskHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Runs periodic tasks on a tokio runtime
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime this call is made from
    pub fn current() -> anyhow::Result<Self> {
        let handle = Handle::try_current().map_err(|e| anyhow::anyhow!("No tokio runtime available: {}", e))?;
        Ok(Self::new(handle))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_periodic(&self, name: &str, interval: Duration, task: PeriodicTask) -> TaskHandle {
        let interval = interval.max(MIN_PERIOD);
        log::debug!("Scheduling '{}' every {:?}", name, interval);
        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task();
            }
        });
        let name = name.to_string();
        TaskHandle::new(move || {
            log::debug!("Cancelling '{}'", name);
            join.abort();
        })
    }

    fn spawn_blocking(&self, task: BlockingTask) {
        self.handle.spawn_blocking(task);
    }
}

/// A UDP socket shared by every protocol registered on it
///
/// Sends go straight to a non-blocking std handle of the socket, so they
/// never depend on the reactor having polled it for writability.
pub struct UdpEndpoint {
    sender: std::net::UdpSocket,
    receivers: Arc<RwLock<Vec<(Vec<u8>, Receiver)>>>,
    recv_task: JoinHandle<()>,
}

impl UdpEndpoint {
    /// Bind the socket and start dispatching incoming datagrams
    pub async fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let sender = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;
        let receivers: Arc<RwLock<Vec<(Vec<u8>, Receiver)>>> = Arc::new(RwLock::new(Vec::new()));

        log::info!("UDP endpoint bound to {}", socket.local_addr()?);
        let recv_task = tokio::spawn(Self::recv_loop(socket, receivers.clone()));

        Ok(Arc::new(Self {
            sender,
            receivers,
            recv_task,
        }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sender.local_addr()
    }

    async fn recv_loop(socket: UdpSocket, receivers: Arc<RwLock<Vec<(Vec<u8>, Receiver)>>>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(e) => {
                    // ICMP port-unreachable shows up here on some platforms
                    log::warn!("UDP receive failed: {}", e);
                    continue;
                }
            };
            let datagram = &buf[..len];

            let receiver = receivers
                .read()
                .iter()
                .find(|(prefix, _)| datagram.starts_with(prefix))
                .map(|(prefix, receiver)| (prefix.len(), receiver.clone()));

            match receiver {
                Some((prefix_len, receiver)) => receiver(peer, &datagram[prefix_len..]),
                None => log::debug!("Dropping {} bytes from {} with no registered prefix", len, peer),
            }
        }
    }
}

impl Endpoint for UdpEndpoint {
    fn send_packet(&self, peer: SocketAddr, data: &[u8], prefix: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(prefix.len() + data.len());
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(data);
        self.sender.send_to(&buf, peer)?;
        Ok(())
    }

    fn listen_to(&self, prefix: &[u8], receiver: Receiver) {
        let mut receivers = self.receivers.write();
        receivers.retain(|(p, _)| p.as_slice() != prefix);
        receivers.push((prefix.to_vec(), receiver));
        // Longest prefix wins when prefixes overlap
        receivers.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_handle_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = TaskHandle::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        TaskHandle::detached().cancel();
    }

    #[tokio::test]
    async fn test_tokio_scheduler_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let scheduler = TokioScheduler::current().unwrap();
        let handle = scheduler.schedule_periodic(
            "tick",
            Duration::from_millis(10),
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.cancel();
        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "ticks = {ticks}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_survives_zero_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = TokioScheduler::current().unwrap().schedule_periodic(
            "busy",
            Duration::ZERO,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_blocking_work() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioScheduler::current().unwrap().spawn_blocking(Box::new(move || {
            let _ = tx.send(42);
        }));
        let value = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_send_after_bind_succeeds() {
        let target = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let target_addr = target.local_addr().unwrap();

        for _ in 0..20 {
            let fresh = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
            fresh.send_packet(target_addr, b"ping", b"tftp:").unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_udp_endpoint_dispatches_by_prefix() {
        let a = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.listen_to(
            b"tftp:",
            Arc::new(move |peer: SocketAddr, data: &[u8]| {
                let _ = tx.send((peer, data.to_vec()));
            }),
        );

        let b_addr = b.local_addr().unwrap();
        a.send_packet(b_addr, b"ignored", b"other:").unwrap();
        a.send_packet(b_addr, b"hello", b"tftp:").unwrap();

        let (peer, data) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, a.local_addr().unwrap());
        assert_eq!(data, b"hello");
    }
}
