//! UDP knock listeners.
//!
//! One receive task per knock port, all feeding a single bounded channel
//! that the dispatcher drains through the `KnockSource` port. A receive
//! error stays with its own socket: it is logged, backed off and the task
//! keeps receiving.

use crate::domain::{KnockEvent, KnockSequence};
use crate::ports::{KnockPoll, KnockSource, TimeSource};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Knocks buffered between the receive tasks and the dispatcher.
pub const LISTENER_QUEUE_CAPACITY: usize = 1024;

/// Payloads are ignored; only enough is read to see that one arrived.
const RECEIVE_BUFFER: usize = 512;

const MAX_RECEIVE_BACKOFF_SHIFT: u32 = 6;

/// Knock socket setup errors. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A knock port could not be bound.
    #[error("failed to bind knock port {addr}: {source}")]
    Bind {
        /// Address that was requested
        addr: SocketAddr,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A pre-bound socket could not be handed to the runtime.
    #[error("failed to register knock socket: {0}")]
    Register(#[source] io::Error),
}

/// The set of UDP sockets bound to the knock ports.
pub struct UdpKnockListenerSet {
    receiver: mpsc::Receiver<KnockEvent>,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl UdpKnockListenerSet {
    /// Bind one socket per sequence port on `host`.
    ///
    /// Any bind failure is fatal; sockets bound so far are closed.
    pub async fn bind(
        host: IpAddr,
        sequence: &KnockSequence,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, ListenerError> {
        let mut sockets = Vec::with_capacity(sequence.len());
        for &port in sequence.ports() {
            let addr = SocketAddr::new(host, port);
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| ListenerError::Bind { addr, source })?;
            sockets.push(socket);
        }
        Self::spawn(sockets, time_source)
    }

    /// Serve knocks on sockets that are already bound. Each socket's local
    /// port is the knock port it reports.
    pub fn from_std_sockets(
        sockets: Vec<std::net::UdpSocket>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, ListenerError> {
        let sockets = sockets
            .into_iter()
            .map(|socket| {
                socket.set_nonblocking(true)?;
                UdpSocket::from_std(socket)
            })
            .collect::<io::Result<Vec<_>>>()
            .map_err(ListenerError::Register)?;
        Self::spawn(sockets, time_source)
    }

    fn spawn(
        sockets: Vec<UdpSocket>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, ListenerError> {
        let (sender, receiver) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        let mut tasks = Vec::with_capacity(sockets.len());
        let mut local_addrs = Vec::with_capacity(sockets.len());

        for socket in sockets {
            let addr = socket.local_addr().map_err(ListenerError::Register)?;
            info!(%addr, "listening for knocks");
            local_addrs.push(addr);
            tasks.push(tokio::spawn(receive_loop(
                socket,
                addr.port(),
                sender.clone(),
                time_source.clone(),
            )));
        }

        Ok(Self {
            receiver,
            tasks,
            local_addrs,
        })
    }

    /// Addresses the knock sockets are bound to, in sequence order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop every receive task, closing the sockets.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for UdpKnockListenerSet {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl KnockSource for UdpKnockListenerSet {
    async fn next_event(&mut self, timeout: Duration) -> KnockPoll {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => KnockPoll::Knock(event),
            Ok(None) => KnockPoll::Closed,
            Err(_) => KnockPoll::Timeout,
        }
    }
}

/// Datagram receive half of a knock socket.
#[async_trait]
trait RecvDatagram: Send + Sync + 'static {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl RecvDatagram for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

async fn receive_loop<S: RecvDatagram>(
    socket: S,
    port: u16,
    sender: mpsc::Sender<KnockEvent>,
    time_source: Arc<dyn TimeSource>,
) {
    let mut buf = [0u8; RECEIVE_BUFFER];
    let mut consecutive_errors = 0u32;

    loop {
        match socket.recv_datagram(&mut buf).await {
            Ok((0, from)) => {
                consecutive_errors = 0;
                debug!(source = %from.ip(), port, "empty datagram ignored");
            }
            Ok((_, from)) => {
                consecutive_errors = 0;
                // IPv4 peers on a dual-stack socket arrive as ::ffff:a.b.c.d
                let event = KnockEvent::new(from.ip().to_canonical(), port, time_source.now());
                if sender.send(event).await.is_err() {
                    debug!(port, "dispatcher gone, knock listener stopping");
                    return;
                }
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let delay = receive_backoff(consecutive_errors);
                warn!(port, error = %e, retry_in = ?delay, "knock socket receive error");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// 10ms doubling per consecutive error, capped at 640ms.
fn receive_backoff(consecutive_errors: u32) -> Duration {
    let shift = consecutive_errors
        .saturating_sub(1)
        .min(MAX_RECEIVE_BACKOFF_SHIFT);
    Duration::from_millis(10u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualClock;
    use std::collections::VecDeque;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::sync::Mutex;

    fn loopback_sockets(count: usize) -> Vec<std::net::UdpSocket> {
        (0..count)
            .map(|_| std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap())
            .collect()
    }

    /// Replays a fixed list of receive results, then blocks forever.
    struct ScriptedDatagrams {
        script: Mutex<VecDeque<io::Result<(usize, SocketAddr)>>>,
    }

    impl ScriptedDatagrams {
        fn new(script: Vec<io::Result<(usize, SocketAddr)>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl RecvDatagram for ScriptedDatagrams {
        async fn recv_datagram(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let next = self.script.lock().await.pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    fn datagram(ip: IpAddr, len: usize) -> io::Result<(usize, SocketAddr)> {
        Ok((len, SocketAddr::new(ip, 40_000)))
    }

    fn recv_error() -> io::Result<(usize, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "icmp port unreachable"))
    }

    fn mapped(v4: Ipv4Addr) -> IpAddr {
        IpAddr::V6(v4.to_ipv6_mapped())
    }

    #[test]
    fn test_receive_backoff_caps() {
        assert_eq!(receive_backoff(1), Duration::from_millis(10));
        assert_eq!(receive_backoff(2), Duration::from_millis(20));
        assert_eq!(receive_backoff(7), Duration::from_millis(640));
        assert_eq!(receive_backoff(100), Duration::from_millis(640));
    }

    #[tokio::test]
    async fn test_v4_mapped_source_is_canonicalised() {
        let (sender, mut receiver) = mpsc::channel(8);
        let native_v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let socket = ScriptedDatagrams::new(vec![
            datagram(mapped(Ipv4Addr::new(192, 0, 2, 9)), 1),
            datagram(native_v6, 1),
        ]);
        let task = tokio::spawn(receive_loop(
            socket,
            1234,
            sender,
            Arc::new(ManualClock::new(0)),
        ));

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.source, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)));
        assert_eq!(first.port, 1234);
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.source, native_v6);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_stays_with_its_socket() {
        let clock: Arc<dyn TimeSource> = Arc::new(ManualClock::new(0));
        let (sender, mut receiver) = mpsc::channel(8);
        let failing = ScriptedDatagrams::new(vec![
            recv_error(),
            recv_error(),
            recv_error(),
            datagram(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 1),
        ]);
        let healthy = ScriptedDatagrams::new(vec![datagram(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)),
            1,
        )]);
        let tasks = [
            tokio::spawn(receive_loop(failing, 1111, sender.clone(), clock.clone())),
            tokio::spawn(receive_loop(healthy, 2222, sender, clock)),
        ];
        let started = tokio::time::Instant::now();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.port, 2222);
        assert_eq!(first.source, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8)));
        assert!(started.elapsed() < Duration::from_millis(10));

        // The failing socket backs off 10 + 20 + 40 ms, then keeps receiving
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.port, 1111);
        assert_eq!(second.source, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(started.elapsed() >= Duration::from_millis(70));
        assert!(!tasks[0].is_finished());

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_datagram_resets_receive_backoff() {
        let (sender, mut receiver) = mpsc::channel(8);
        let mut script: Vec<_> = (0..6).map(|_| recv_error()).collect();
        script.push(datagram(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 0));
        script.push(recv_error());
        script.push(datagram(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 1));
        let task = tokio::spawn(receive_loop(
            ScriptedDatagrams::new(script),
            1234,
            sender,
            Arc::new(ManualClock::new(0)),
        ));
        let started = tokio::time::Instant::now();

        receiver.recv().await.unwrap();

        // 10+20+40+80+160+320 ms, then a fresh 10 ms after the empty datagram
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(640));
        assert!(elapsed < Duration::from_millis(1_000), "backoff not reset: {:?}", elapsed);

        task.abort();
    }

    #[tokio::test]
    async fn test_flooded_port_does_not_starve_others() {
        const FLOOD: usize = 3_000;
        let clock = Arc::new(ManualClock::new(0));
        let mut listeners =
            UdpKnockListenerSet::from_std_sockets(loopback_sockets(2), clock).unwrap();
        let busy = listeners.local_addrs()[0];
        let quiet = listeners.local_addrs()[1];

        let flooder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        for _ in 0..FLOOD {
            flooder.send_to(b"x", busy).await.unwrap();
        }
        let knocker = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        knocker.send_to(b"x", quiet).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut drained = 0;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match listeners.next_event(remaining).await {
                KnockPoll::Knock(event) if event.port == quiet.port() => break,
                KnockPoll::Knock(event) => {
                    assert_eq!(event.port, busy.port());
                    drained += 1;
                    assert!(drained <= FLOOD, "quiet port never delivered");
                }
                other => panic!("quiet port starved: {:?} after {} knocks", other, drained),
            }
        }
    }

    #[tokio::test]
    async fn test_datagram_becomes_knock_on_its_port() {
        let clock = Arc::new(ManualClock::new(4_000));
        let mut listeners =
            UdpKnockListenerSet::from_std_sockets(loopback_sockets(2), clock).unwrap();
        let target = listeners.local_addrs()[1];

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.send_to(b"x", target).await.unwrap();

        match listeners.next_event(Duration::from_secs(2)).await {
            KnockPoll::Knock(event) => {
                assert_eq!(event.source, IpAddr::V4(Ipv4Addr::LOCALHOST));
                assert_eq!(event.port, target.port());
                assert_eq!(event.received_at.as_millis(), 4_000);
            }
            other => panic!("expected knock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_datagram_is_not_a_knock() {
        let clock = Arc::new(ManualClock::new(0));
        let mut listeners =
            UdpKnockListenerSet::from_std_sockets(loopback_sockets(1), clock).unwrap();
        let target = listeners.local_addrs()[0];

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.send_to(b"", target).await.unwrap();

        assert_eq!(
            listeners.next_event(Duration::from_millis(200)).await,
            KnockPoll::Timeout
        );
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let other = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let free = other.local_addr().unwrap().port();
        drop(other);
        let sequence = KnockSequence::new(vec![free, port]).unwrap();

        let result = UdpKnockListenerSet::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            &sequence,
            Arc::new(ManualClock::new(0)),
        )
        .await;

        match result {
            Err(ListenerError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bind should fail on a taken port"),
        }
    }

    #[tokio::test]
    async fn test_closed_set_reports_closed() {
        let clock = Arc::new(ManualClock::new(0));
        let mut listeners =
            UdpKnockListenerSet::from_std_sockets(loopback_sockets(2), clock).unwrap();

        listeners.close();

        assert_eq!(
            listeners.next_event(Duration::from_secs(2)).await,
            KnockPoll::Closed
        );
    }
}
