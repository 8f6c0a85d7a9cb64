//! DNS proxy: serves UDP and TCP on a loopback port, evaluates each query
//! against the current policy, and forwards permitted queries to the
//! discovered upstream resolver with loop-preventing bypass-marked sockets.
//!
//! This crate targets Linux: the bypass mark (`SO_MARK`) and the redirect
//! installer's `iptables`/`ip6tables` invocations are both Linux-specific,
//! matching the network-namespace sandboxing this proxy is built to run
//! inside.

use crate::discovery;
use crate::error::ProxyStartError;
use crate::policy::{self, Action, NetworkPolicy};
use crate::redirect::BYPASS_MARK;
use hickory_server::proto::op::{Message, MessageType, ResponseCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default listen address used when none is supplied to [`DnsProxy::new`].
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:15353";

const UPSTREAM_PORT: u16 = 53;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// Which transport an inbound query arrived over. Used only to decide
/// whether a UDP upstream exchange should escalate to TCP on a truncated
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp,
    Tcp,
}

struct Inner {
    listen_addr: SocketAddr,
    upstream: String,
    policy: RwLock<Arc<Option<NetworkPolicy>>>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

/// The DNS proxy: UDP+TCP listeners, a hot-swappable policy slot, and the
/// discovered upstream resolver.
#[derive(Clone)]
pub struct DnsProxy {
    inner: Arc<Inner>,
}

impl DnsProxy {
    /// Construct a proxy. Discovers the upstream resolver from
    /// `/etc/resolv.conf`, falling back to a built-in public resolver if
    /// that fails. Does not bind any sockets yet — call [`start`](Self::start).
    pub fn new(policy: Option<NetworkPolicy>, listen_addr: Option<SocketAddr>) -> Self {
        let listen_addr = listen_addr.unwrap_or_else(|| {
            DEFAULT_LISTEN_ADDR
                .parse()
                .expect("DEFAULT_LISTEN_ADDR is a valid socket address")
        });
        let upstream = discovery::discover_upstream(UPSTREAM_PORT);
        let (shutdown_tx, _rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                listen_addr,
                upstream,
                policy: RwLock::new(Arc::new(policy)),
                started: AtomicBool::new(false),
                shutdown_tx,
                tasks: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Bind the UDP and TCP listeners and start serving.
    ///
    /// Returns once a short startup grace window has elapsed with no bind
    /// error observed. A proxy instance can only be started once; starting
    /// it again (including after [`shutdown`](Self::shutdown)) is an error.
    pub async fn start(&self) -> Result<(), ProxyStartError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyStartError::new(std::io::Error::other(
                "dns proxy already started",
            )));
        }

        // Bind both listeners before the `started` flag is allowed to stick.
        // A bind failure (e.g. transient `AddrInUse`) means this proxy never
        // actually started, so the flag is rolled back and a later `start()`
        // call can retry; only a proxy that bound successfully is "already
        // started" in the sense the spec's restart prohibition means.
        let bound = async {
            let udp_socket = UdpSocket::bind(self.inner.listen_addr).await?;
            let tcp_listener = TcpListener::bind(self.inner.listen_addr).await?;
            Ok::<_, std::io::Error>((udp_socket, tcp_listener))
        }
        .await;

        let (udp_socket, tcp_listener) = match bound {
            Ok(pair) => pair,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(ProxyStartError::new(e));
            }
        };

        let udp_socket = Arc::new(udp_socket);
        let udp_task = tokio::spawn(run_udp_listener(udp_socket, self.inner.clone()));
        let tcp_task = tokio::spawn(run_tcp_listener(tcp_listener, self.inner.clone()));

        tokio::time::sleep(STARTUP_GRACE).await;

        *self.inner.tasks.lock().unwrap() = Some((udp_task, tcp_task));
        Ok(())
    }

    /// Signal both listeners to stop accepting new connections.
    ///
    /// In-flight handlers are not cancelled; they finish under the 5-second
    /// upstream exchange timeout. A shut-down proxy cannot be restarted.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Atomically replace the current policy. `None` switches to allow-all.
    pub fn update_policy(&self, new: Option<NetworkPolicy>) {
        *self.inner.policy.write().unwrap() = Arc::new(new);
    }

    /// The current policy snapshot, for diagnostics.
    pub fn current_policy(&self) -> Arc<Option<NetworkPolicy>> {
        self.inner.policy.read().unwrap().clone()
    }

    /// The host portion of the discovered upstream, or `""` if it can't be
    /// split.
    pub fn upstream_host(&self) -> String {
        self.inner
            .upstream
            .rsplit_once(':')
            .map(|(host, _port)| host.to_string())
            .unwrap_or_default()
    }

    /// The `host:port` of the discovered upstream resolver.
    pub fn upstream_addr(&self) -> &str {
        &self.inner.upstream
    }

    /// The address the proxy is (or will be) listening on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }
}

async fn run_udp_listener(socket: Arc<UdpSocket>, inner: Arc<Inner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                log::info!("udp listener on {} shutting down", inner.listen_addr);
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let raw = buf[..len].to_vec();
                        let inner = inner.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            if let Some(response) = handle_query(&inner, &raw, Transport::Udp).await {
                                if let Err(e) = socket.send_to(&response, src).await {
                                    log::warn!("failed to write udp response to {src}: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => log::warn!("udp recv error: {e}"),
                }
            }
        }
    }
}

async fn run_tcp_listener(listener: TcpListener, inner: Arc<Inner>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                log::info!("tcp listener on {} shutting down", inner.listen_addr);
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let inner = inner.clone();
                        tokio::spawn(handle_tcp_connection(stream, inner));
                    }
                    Err(e) => log::warn!("tcp accept error: {e}"),
                }
            }
        }
    }
}

async fn handle_tcp_connection(mut stream: tokio::net::TcpStream, inner: Arc<Inner>) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut raw = vec![0u8; len];
        if stream.read_exact(&mut raw).await.is_err() {
            return;
        }

        let Some(response) = handle_query(&inner, &raw, Transport::Tcp).await else {
            continue;
        };
        let prefix = (response.len() as u16).to_be_bytes();
        if stream.write_all(&prefix).await.is_err() || stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// The per-query handler shared by both transports.
///
/// Returns `None` only when `raw` could not be parsed as a DNS message at
/// all (nothing id-matched can safely be sent back); every other path
/// returns `Some(bytes)` to write to the client.
async fn handle_query(inner: &Inner, raw: &[u8], transport: Transport) -> Option<Vec<u8>> {
    let message = match Message::from_vec(raw) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("dropping unparseable dns message: {e}");
            return None;
        }
    };

    if message.queries().is_empty() {
        return Some(build_empty_response(message.id()));
    }

    let query = &message.queries()[0];
    let domain = query.name().to_string();

    let policy_snapshot = inner.policy.read().unwrap().clone();
    let decision = policy::evaluate((*policy_snapshot).as_ref(), &domain);

    if decision == Action::Deny {
        return Some(build_error_response(&message, ResponseCode::NXDomain));
    }

    match forward(&inner.upstream, raw, transport).await {
        Ok(response) => Some(response),
        Err(e) => {
            log::error!("forward failed for {domain}: {e}");
            Some(build_error_response(&message, ResponseCode::ServFail))
        }
    }
}

fn build_empty_response(id: u16) -> Vec<u8> {
    let mut response = Message::new();
    response.set_id(id);
    response.set_message_type(MessageType::Response);
    response.to_vec().unwrap_or_default()
}

/// Build an error response by flipping the original request's type and
/// response code in place — this leaves the id, opcode, flags, and
/// (unmutated) question section exactly as the client sent them.
fn build_error_response(original: &Message, code: ResponseCode) -> Vec<u8> {
    let mut response = original.clone();
    response.set_message_type(MessageType::Response);
    response.set_response_code(code);
    response.to_vec().unwrap_or_default()
}

async fn forward(upstream: &str, raw: &[u8], transport: Transport) -> std::io::Result<Vec<u8>> {
    match transport {
        Transport::Tcp => forward_tcp(upstream, raw).await,
        Transport::Udp => {
            let response = forward_udp(upstream, raw).await?;
            if is_truncated(&response) {
                forward_tcp(upstream, raw).await
            } else {
                Ok(response)
            }
        }
    }
}

/// Checks the wire-format TC (truncated) bit without a full parse: the flags
/// byte is the third byte of a DNS message header, and TC is bit `0x02`.
fn is_truncated(message: &[u8]) -> bool {
    message.len() > 2 && message[2] & 0x02 != 0
}

async fn forward_udp(upstream: &str, raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    apply_bypass_mark(&socket);
    socket.connect(upstream).await?;
    socket.send(raw).await?;

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(EXCHANGE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream udp timeout"))??;
    buf.truncate(len);
    Ok(buf)
}

async fn forward_tcp(upstream: &str, raw: &[u8]) -> std::io::Result<Vec<u8>> {
    // `upstream` may be an unbracketed IPv6 `host:port` (discovery.rs now
    // brackets its own output, but this keeps forwarding robust to any
    // caller-supplied string); resolve it the same way `forward_udp`'s
    // `connect` does rather than a bare `SocketAddr::parse`.
    let addr = tokio::net::lookup_host(upstream)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad upstream addr"))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_bypass_mark(&socket);

    let mut stream = tokio::time::timeout(EXCHANGE_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream tcp connect timeout"))??;

    let exchange = async {
        stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
        stream.write_all(raw).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut resp = vec![0u8; len];
        stream.read_exact(&mut resp).await?;
        Ok::<_, std::io::Error>(resp)
    };

    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream tcp exchange timeout"))?
}

/// Apply [`BYPASS_MARK`] to a socket before its first packet leaves, so the
/// redirect installer's `RETURN` rule matches it ahead of the `REDIRECT`
/// rule and the proxy never loops back through itself.
///
/// Setting `SO_MARK` requires `CAP_NET_ADMIN`; without it (e.g. in an
/// unprivileged test run) the proxy still forwards queries, just without the
/// loop-prevention guarantee, so a failure here is logged rather than
/// propagated.
fn apply_bypass_mark<S: std::os::fd::AsFd>(socket: &S) {
    #[cfg(target_os = "linux")]
    {
        if let Err(e) = socket2::SockRef::from(socket).set_mark(BYPASS_MARK) {
            log::warn!("failed to set bypass mark on upstream socket: {e}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Action, DomainPattern, EgressRule};
    use tokio::net::UdpSocket as TokioUdpSocket;

    fn deny_policy(domain: &str) -> NetworkPolicy {
        NetworkPolicy {
            egress: vec![EgressRule {
                action: Action::Deny,
                target: DomainPattern::Exact(domain.to_string()),
            }],
            default_action: Action::Allow,
        }
    }

    fn build_query(domain: &str, id: u16) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(id);
        message.set_message_type(MessageType::Query);
        message.set_recursion_desired(true);
        let name = hickory_server::proto::rr::Name::from_ascii(domain).unwrap();
        message.add_query(hickory_server::proto::op::Query::query(
            name,
            hickory_server::proto::rr::RecordType::A,
        ));
        message.to_vec().unwrap()
    }

    #[tokio::test]
    async fn empty_question_message_gets_empty_response() {
        let inner = test_inner(None);
        let mut message = Message::new();
        message.set_id(0xABCD);
        message.set_message_type(MessageType::Query);
        let raw = message.to_vec().unwrap();

        let response = handle_query(&inner, &raw, Transport::Udp).await.unwrap();
        let parsed = Message::from_vec(&response).unwrap();
        assert_eq!(parsed.id(), 0xABCD);
        assert!(parsed.queries().is_empty());
    }

    #[tokio::test]
    async fn denied_domain_gets_nxdomain_with_matching_id_and_unmutated_question() {
        let inner = test_inner(Some(deny_policy("blocked.example")));
        let raw = build_query("blocked.example.", 0x1234);

        let response = handle_query(&inner, &raw, Transport::Udp).await.unwrap();
        let parsed = Message::from_vec(&response).unwrap();
        assert_eq!(parsed.id(), 0x1234);
        assert_eq!(parsed.response_code(), ResponseCode::NXDomain);
        assert_eq!(parsed.queries().len(), 1);
        assert_eq!(parsed.queries()[0].name().to_string(), "blocked.example.");
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_servfail() {
        // Port 0 on loopback never accepts a connection/datagram exchange;
        // picking an unroutable-ish target guarantees a forward failure.
        let inner = test_inner_with_upstream(None, "127.0.0.1:1");
        let raw = build_query("allowed.example.", 0x5678);

        let response = tokio::time::timeout(
            Duration::from_secs(6),
            handle_query(&inner, &raw, Transport::Udp),
        )
        .await
        .expect("handler should finish within 6s")
        .unwrap();

        let parsed = Message::from_vec(&response).unwrap();
        assert_eq!(parsed.id(), 0x5678);
        assert_eq!(parsed.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn allowed_domain_forwards_and_returns_upstream_answer_verbatim() {
        let upstream_socket = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_socket.local_addr().unwrap();

        let query_id = 0x4242;
        let echo_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, src) = upstream_socket.recv_from(&mut buf).await.unwrap();
            let mut response = Message::from_vec(&buf[..len]).unwrap();
            response.set_message_type(MessageType::Response);
            let bytes = response.to_vec().unwrap();
            upstream_socket.send_to(&bytes, src).await.unwrap();
            bytes
        });

        let inner = test_inner_with_upstream(None, &upstream_addr.to_string());
        let raw = build_query("anything.example.", query_id);

        let response = handle_query(&inner, &raw, Transport::Udp).await.unwrap();
        let expected = echo_task.await.unwrap();
        assert_eq!(response, expected);
    }

    #[tokio::test]
    async fn hot_swap_updates_subsequent_evaluations() {
        let proxy = DnsProxy::new(None, None);
        assert_eq!(
            policy::evaluate(proxy.current_policy().as_ref().as_ref(), "blocked.example"),
            Action::Allow
        );

        proxy.update_policy(Some(deny_policy("blocked.example")));
        assert_eq!(
            policy::evaluate(proxy.current_policy().as_ref().as_ref(), "blocked.example"),
            Action::Deny
        );

        proxy.update_policy(None);
        assert_eq!(
            policy::evaluate(proxy.current_policy().as_ref().as_ref(), "blocked.example"),
            Action::Allow
        );
    }

    #[test]
    fn upstream_host_splits_on_last_colon() {
        let proxy = DnsProxy::new(None, None);
        let host = proxy.upstream_host();
        assert!(!host.is_empty());
        assert!(!host.contains(':') || proxy.upstream_addr().starts_with(&host));
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let proxy = DnsProxy::new(None, Some("127.0.0.1:0".parse().unwrap()));
        proxy.start().await.unwrap();
        let second = proxy.start().await;
        assert!(second.is_err());
        proxy.shutdown();
    }

    #[tokio::test]
    async fn failed_bind_does_not_permanently_mark_the_proxy_started() {
        // Hold the port so the proxy's own bind fails, proving a bind
        // failure rolls the `started` flag back rather than sticking it.
        let blocker = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let proxy = DnsProxy::new(None, Some(addr));
        let first = proxy.start().await;
        assert!(first.is_err());

        drop(blocker);

        let second = proxy.start().await;
        assert!(second.is_ok());
        proxy.shutdown();
    }

    fn test_inner(policy: Option<NetworkPolicy>) -> Inner {
        test_inner_with_upstream(policy, "127.0.0.1:1")
    }

    fn test_inner_with_upstream(policy: Option<NetworkPolicy>, upstream: &str) -> Inner {
        let (shutdown_tx, _rx) = watch::channel(false);
        Inner {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream: upstream.to_string(),
            policy: RwLock::new(Arc::new(policy)),
            started: AtomicBool::new(false),
            shutdown_tx,
            tasks: std::sync::Mutex::new(None),
        }
    }
}
