//! Per-sandbox nameserver.
//!
//! UDP and TCP listeners are bound to 127.0.0.33 on ephemeral ports inside
//! the sandbox's network namespace (the bind happens on a pinned thread that
//! enters the namespace and restores it on exit; the sockets keep the
//! namespace they were created in). Queries that match nothing local are
//! forwarded upstream, UDP first with a TCP fallback, and relayed without
//! the authoritative bit.

use crate::core::error::{DriverError, Result};
use crate::dns::resolver::Resolver;
use crate::dns::{redirect, DNS_LISTEN_IP};
use crate::network::netns;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::RwLock;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ANSWER_TTL: u32 = 600;
const DEFAULT_UPSTREAM: &str = "8.8.4.4:53";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const MAX_MESSAGE: usize = 4096;

pub struct Nameserver {
    sandbox: PathBuf,
    resolver: Arc<Resolver>,
    valid_networks: RwLock<Vec<String>>,
    upstream: String,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    ports: parking_lot::Mutex<Option<(u16, u16)>>,
}

impl Nameserver {
    pub fn new(sandbox: impl Into<PathBuf>, resolver: Arc<Resolver>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sandbox: sandbox.into(),
            resolver,
            valid_networks: RwLock::new(Vec::new()),
            upstream: DEFAULT_UPSTREAM.to_string(),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
            ports: parking_lot::Mutex::new(None),
        })
    }

    /// Networks this sandbox may resolve.
    pub fn add_valid_network(&self, network_id: &str) {
        let mut networks = self.valid_networks.write();
        if !networks.iter().any(|id| id == network_id) {
            networks.push(network_id.to_string());
        }
    }

    pub fn remove_valid_network(&self, network_id: &str) {
        self.valid_networks.write().retain(|id| id != network_id);
    }

    fn valid_networks(&self) -> Vec<String> {
        self.valid_networks.read().clone()
    }

    /// `(tcp, udp)` listener ports, once activated.
    pub fn ports(&self) -> Option<(u16, u16)> {
        *self.ports.lock()
    }

    /// Bind the listeners inside the sandbox, install the iptables
    /// interception and start serving.
    pub async fn activate(self: Arc<Self>) -> Result<()> {
        if tokio::fs::metadata(&self.sandbox).await.is_err() {
            return Err(DriverError::not_found(
                "sandbox",
                self.sandbox.display().to_string(),
            ));
        }

        let (udp_std, tcp_std) =
            netns::with_namespace_async(self.sandbox.clone(), bind_listeners).await?;

        let udp = UdpSocket::from_std(udp_std)?;
        let tcp = TcpListener::from_std(tcp_std)?;
        let udp_port = udp.local_addr()?.port();
        let tcp_port = tcp.local_addr()?.port();
        *self.ports.lock() = Some((tcp_port, udp_port));

        redirect::install(self.sandbox.clone(), tcp_port, udp_port).await?;

        let server = Arc::clone(&self);
        let shutdown_rx = self.shutdown.subscribe();
        let udp_task = tokio::spawn(async move {
            server.serve_udp(udp, shutdown_rx).await;
        });
        let server = Arc::clone(&self);
        let shutdown_rx = self.shutdown.subscribe();
        let tcp_task = tokio::spawn(server.serve_tcp(tcp, shutdown_rx));
        self.tasks.lock().extend([udp_task, tcp_task]);

        info!(sandbox = %self.sandbox.display(), tcp_port, udp_port, "nameserver active");
        Ok(())
    }

    /// Stop serving, waiting up to one second for in-flight queries.
    pub async fn deactivate(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(sandbox = %self.sandbox.display(), "nameserver shutdown timed out");
        }
        Ok(())
    }

    async fn serve_udp(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_MESSAGE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "udp receive failed");
                            continue;
                        }
                    };
                    if let Some(response) = self.handle_query(&buf[..len]).await {
                        if let Err(err) = socket.send_to(&response, peer).await {
                            warn!(error = %err, "udp send failed");
                        }
                    }
                }
            }
        }
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "tcp accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = server.serve_tcp_connection(stream).await {
                            debug!(error = %err, "tcp connection ended");
                        }
                    });
                }
            }
        }
    }

    async fn serve_tcp_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let len = match stream.read_u16().await {
                Ok(len) => len as usize,
                Err(_) => return Ok(()),
            };
            if len == 0 || len > MAX_MESSAGE {
                return Ok(());
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;

            if let Some(response) = self.handle_query(&buf).await {
                stream.write_u16(response.len() as u16).await?;
                stream.write_all(&response).await?;
            }
        }
    }

    async fn handle_query(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::from_vec(raw) {
            Ok(query) => query,
            Err(err) => {
                debug!(error = %err, "dropping undecodable query");
                return None;
            }
        };

        let valid = self.valid_networks();
        let mut response = match answer_locally(&self.resolver, &valid, &query) {
            Some(response) => response,
            None => self.forward(raw, &query).await,
        };
        response.set_id(query.id());
        response.to_vec().ok()
    }

    /// Relay a miss upstream, UDP first, TCP on failure.
    async fn forward(&self, raw: &[u8], query: &Message) -> Message {
        let upstream = match self.forward_udp(raw).await {
            Ok(message) => Some(message),
            Err(err) => {
                debug!(error = %err, "udp forward failed, trying tcp");
                self.forward_tcp(raw).await.map_err(|err| {
                    warn!(sandbox = %self.sandbox.display(), error = %err, "upstream forward failed");
                }).ok()
            }
        };

        let mut response = base_response(query);
        match upstream {
            Some(upstream) => {
                response.set_response_code(upstream.response_code());
                response.add_answers(upstream.answers().iter().cloned());
                response.add_name_servers(upstream.name_servers().iter().cloned());
                response.add_additionals(upstream.additionals().iter().cloned());
                response.set_authoritative(false);
            }
            None => {
                response.set_response_code(ResponseCode::ServFail);
            }
        }
        response
    }

    async fn forward_udp(&self, raw: &[u8]) -> Result<Message> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket
            .send_to(raw, self.upstream.as_str())
            .await
            .map_err(DriverError::Io)?;
        let mut buf = vec![0u8; MAX_MESSAGE];
        let (len, _) = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DriverError::external("dns", "upstream udp timeout"))??;
        Message::from_vec(&buf[..len]).map_err(|err| DriverError::external("dns", err.to_string()))
    }

    async fn forward_tcp(&self, raw: &[u8]) -> Result<Message> {
        let upstream: SocketAddr = self
            .upstream
            .parse()
            .map_err(|_| DriverError::external("dns", "bad upstream address"))?;
        let connect = tokio::time::timeout(UPSTREAM_TIMEOUT, TcpStream::connect(upstream))
            .await
            .map_err(|_| DriverError::external("dns", "upstream tcp timeout"))??;
        let mut stream = connect;
        stream.write_u16(raw.len() as u16).await?;
        stream.write_all(raw).await?;
        let len = tokio::time::timeout(UPSTREAM_TIMEOUT, stream.read_u16())
            .await
            .map_err(|_| DriverError::external("dns", "upstream tcp timeout"))?? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Message::from_vec(&buf).map_err(|err| DriverError::external("dns", err.to_string()))
    }
}

/// Bind both listeners; runs inside the sandbox namespace.
fn bind_listeners() -> Result<(std::net::UdpSocket, std::net::TcpListener)> {
    let udp = std::net::UdpSocket::bind((DNS_LISTEN_IP, 0))?;
    udp.set_nonblocking(true)?;
    let tcp = std::net::TcpListener::bind((DNS_LISTEN_IP, 0))?;
    tcp.set_nonblocking(true)?;
    Ok((udp, tcp))
}

fn base_response(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_authoritative(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Answer from the local indices, or `None` when nothing matched and the
/// query should be forwarded.
pub(crate) fn answer_locally(
    resolver: &Resolver,
    valid_networks: &[String],
    query: &Message,
) -> Option<Message> {
    let mut response = base_response(query);
    let mut answered = false;

    for q in query.queries() {
        match q.query_type() {
            RecordType::A => {
                let name = q.name().to_utf8();
                for ip in resolver.resolve_name(&name, valid_networks) {
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        ANSWER_TTL,
                        RData::A(rdata::A(ip)),
                    ));
                    answered = true;
                }
            }
            RecordType::PTR => {
                let Some(ip) = ptr_to_ipv4(&q.name().to_utf8()) else {
                    continue;
                };
                for name in resolver.resolve_ip(ip, valid_networks) {
                    let Ok(target) = Name::from_utf8(format!("{name}.")) else {
                        continue;
                    };
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        ANSWER_TTL,
                        RData::PTR(rdata::PTR(target)),
                    ));
                    answered = true;
                }
            }
            _ => {}
        }
    }

    answered.then_some(response)
}

/// `5.0.1.10.in-addr.arpa.` -> `10.1.0.5`.
fn ptr_to_ipv4(name: &str) -> Option<Ipv4Addr> {
    let rest = name
        .trim_end_matches('.')
        .strip_suffix(".in-addr.arpa")?;
    let octets: Vec<u8> = rest
        .split('.')
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let [d, c, b, a] = octets.as_slice() else {
        return None;
    };
    Some(Ipv4Addr::new(*a, *b, *c, *d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::types::ContainerInfo;
    use hickory_proto::op::Query;
    use std::collections::HashMap;

    fn query(name: &str, record_type: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(42)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_utf8(name).unwrap(), record_type));
        message
    }

    fn resolver_with_container() -> Resolver {
        let resolver = Resolver::new(false);
        resolver.add_container(&ContainerInfo {
            id: "c2".into(),
            name: "c2".into(),
            ips: HashMap::from([("n1".to_string(), "10.1.0.5".parse().unwrap())]),
            ..Default::default()
        });
        resolver
    }

    #[test]
    fn ptr_names_parse_back_to_addresses() {
        assert_eq!(
            ptr_to_ipv4("5.0.1.10.in-addr.arpa."),
            Some(Ipv4Addr::new(10, 1, 0, 5))
        );
        assert_eq!(ptr_to_ipv4("example.com."), None);
    }

    #[test]
    fn a_query_on_a_valid_network_is_answered_authoritatively() {
        let resolver = resolver_with_container();
        let response =
            answer_locally(&resolver, &["n1".to_string()], &query("c2.", RecordType::A)).unwrap();
        assert!(response.authoritative());
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0.to_string(), "10.1.0.5"),
            other => panic!("unexpected rdata {other:?}"),
        }
    }

    #[test]
    fn a_query_from_a_foreign_network_misses() {
        let resolver = resolver_with_container();
        assert!(answer_locally(&resolver, &["n2".to_string()], &query("c2.", RecordType::A)).is_none());
    }

    #[test]
    fn ptr_query_resolves_across_valid_networks() {
        let resolver = resolver_with_container();
        let response = answer_locally(
            &resolver,
            &["n1".to_string()],
            &query("5.0.1.10.in-addr.arpa.", RecordType::PTR),
        )
        .unwrap();
        assert_eq!(response.answers().len(), 1);
    }
}
