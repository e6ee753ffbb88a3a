//! Minimal mDNS responder advertising the server hostname.
//!
//! Listens on the IPv4 (224.0.0.251) and IPv6 (ff02::fb) multicast groups,
//! answers A/AAAA questions for the hostname held by a [Zone] and ignores
//! everything else. The wire codec lives in [protocol], the record source
//! in [zone].

pub mod protocol;
pub mod zone;

pub use zone::{MatterZone, Zone};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use protocol::{Header, Message, RData};

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Receive deadline; the shutdown flag is re-checked at least this often.
const READ_DEADLINE: Duration = Duration::from_secs(1);
const RECV_BUFFER: usize = 65536;

/// Decide how to answer one incoming packet.
///
/// Returns `Ok(None)` for responses, non-standard opcodes, packets with a
/// response code set, and questions the zone has no records for.
pub fn handle_packet(zone: &dyn Zone, data: &[u8]) -> Result<Option<Vec<u8>>> {
    let msg = protocol::parse_message(data)?;
    let h = &msg.header;
    if h.response || h.opcode != 0 || h.rcode != 0 {
        return Ok(None);
    }

    let answers: Vec<_> = msg
        .questions
        .iter()
        .flat_map(|q| zone.records(q))
        .collect();
    if answers.is_empty() {
        return Ok(None);
    }

    let response = Message {
        header: Header {
            id: h.id,
            response: true,
            authoritative: true,
            ..Default::default()
        },
        answers,
        ..Default::default()
    };
    Ok(Some(protocol::encode_message(&response)?))
}

/// IPv4 address and interface index of a named interface.
fn resolve_interface(name: &str) -> Option<(Option<Ipv4Addr>, u32)> {
    let ifaces = if_addrs::get_if_addrs().ok()?;
    let matching: Vec<_> = ifaces.into_iter().filter(|i| i.name == name).collect();
    if matching.is_empty() {
        return None;
    }
    let v4 = matching.iter().find_map(|i| match i.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        _ => None,
    });
    let index = matching.iter().find_map(|i| i.index).unwrap_or(0);
    Some((v4, index))
}

fn create_multicast_socket_v4(interface: Ipv4Addr) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT);
    sock.bind(&socket2::SockAddr::from(addr))?;
    sock.join_multicast_v4(&MDNS_GROUP_V4, &interface)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

fn create_multicast_socket_v6(interface: u32) -> Result<std::net::UdpSocket> {
    let sock = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_only_v6(true)?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)?;
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0);
    sock.bind(&socket2::SockAddr::from(addr))?;
    sock.join_multicast_v6(&MDNS_GROUP_V6, interface)?;
    if interface != 0 {
        sock.set_multicast_if_v6(interface)?;
    }
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

async fn recv_loop(socket: UdpSocket, zone: Arc<dyn Zone>, shutdown: Arc<AtomicBool>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    while !shutdown.load(Ordering::Acquire) {
        let (n, from): (usize, SocketAddr) =
            match tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    if !shutdown.load(Ordering::Acquire) {
                        log::error!("mdns: failed to read packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    continue;
                }
            };

        match handle_packet(zone.as_ref(), &buf[..n]) {
            Ok(Some(reply)) => {
                if let Err(e) = socket.send_to(&reply, from).await {
                    log::error!("mdns: failed to send response to {}: {}", from, e);
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("mdns: dropping packet from {}: {:#}", from, e),
        }
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Send an A query for `hostname` to `target` and wait up to `timeout` for
/// an answer. Unrelated or malformed packets are skipped.
pub async fn resolve_host(
    target: SocketAddr,
    hostname: &str,
    timeout: Duration,
) -> Result<Option<IpAddr>> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    let query = protocol::create_query(hostname, protocol::TYPE_A)?;
    socket
        .send_to(&query, target)
        .await
        .context(format!("failed to send query to {}", target))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => return Ok(None),
            Ok(res) => res?,
        };
        let msg = match protocol::parse_message(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("mdns: ignoring packet from {}: {:#}", from, e);
                continue;
            }
        };
        if !msg.header.response {
            continue;
        }
        let found = msg.answers.iter().find_map(|rr| match rr.data {
            RData::A(ip) if same_name(&rr.name, hostname) => Some(IpAddr::V4(ip)),
            _ => None,
        });
        if found.is_some() {
            return Ok(found);
        }
    }
}

/// Multicast listener answering from a [Zone].
pub struct Responder {
    zone: Arc<dyn Zone>,
    interface: Option<String>,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Responder {
    /// `interface` restricts the multicast joins to one interface by name;
    /// unknown names fall back to all interfaces.
    pub fn new(zone: Arc<dyn Zone>, interface: Option<String>) -> Self {
        Self {
            zone,
            interface,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn interface_name(&self) -> &str {
        self.interface.as_deref().unwrap_or("all")
    }

    /// Join both multicast groups and start answering.
    pub fn start(&self) -> Result<()> {
        let (v4_iface, v6_index) = match self.interface.as_deref() {
            Some(name) => resolve_interface(name).unwrap_or_else(|| {
                log::warn!("primary interface {} not found, using all interfaces", name);
                (None, 0)
            }),
            None => (None, 0),
        };

        let v4 = create_multicast_socket_v4(v4_iface.unwrap_or(Ipv4Addr::UNSPECIFIED))
            .context("failed to setup IPv4 mdns socket")?;
        let v6 = create_multicast_socket_v6(v6_index).context("failed to setup IPv6 mdns socket")?;
        let v4 = UdpSocket::from_std(v4)?;
        let v6 = UdpSocket::from_std(v6)?;

        let mut tasks = self.tasks.lock();
        for sock in [v4, v6] {
            let zone = self.zone.clone();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(recv_loop(sock, zone, shutdown)));
        }
        log::info!("mdns responder started on interface {}", self.interface_name());
        Ok(())
    }

    /// Stop both receive loops. They notice within one read deadline;
    /// loops still running after that are aborted.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(READ_DEADLINE * 2, &mut task).await.is_err() {
                task.abort();
            }
        }
        log::info!("mdns responder shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::{create_query, parse_message, RData, TYPE_A, TYPE_AAAA, TYPE_PTR};
    use super::*;

    fn zone() -> MatterZone {
        MatterZone::with_addresses(
            "test.local",
            vec!["192.168.1.10".parse().unwrap(), "192.168.1.11".parse().unwrap()],
        )
    }

    #[test]
    fn answers_a_query_for_own_hostname() {
        let mut query = create_query("test.local", TYPE_A).unwrap();
        query[0] = 0xab;
        query[1] = 0xcd;
        let reply = handle_packet(&zone(), &query).unwrap().unwrap();
        let msg = parse_message(&reply).unwrap();
        assert_eq!(msg.header.id, 0xabcd);
        assert!(msg.header.response);
        assert!(msg.header.authoritative);
        assert!(msg.questions.is_empty());
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].name, "test.local");
        assert_eq!(msg.answers[1].data, RData::A("192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn silent_for_other_hosts_and_types() {
        let z = zone();
        let other = create_query("other.local", TYPE_A).unwrap();
        assert!(handle_packet(&z, &other).unwrap().is_none());
        let ptr = create_query("test.local", TYPE_PTR).unwrap();
        assert!(handle_packet(&z, &ptr).unwrap().is_none());
        let aaaa = create_query("test.local", TYPE_AAAA).unwrap();
        assert!(handle_packet(&z, &aaaa).unwrap().is_none());
    }

    #[test]
    fn ignores_responses_and_nonstandard_queries() {
        let z = zone();
        let mut response = create_query("test.local", TYPE_A).unwrap();
        response[2] = 0x84;
        assert!(handle_packet(&z, &response).unwrap().is_none());

        let mut opcode = create_query("test.local", TYPE_A).unwrap();
        opcode[2] = 0x10; // opcode 2
        assert!(handle_packet(&z, &opcode).unwrap().is_none());

        let mut rcode = create_query("test.local", TYPE_A).unwrap();
        rcode[3] = 0x03;
        assert!(handle_packet(&z, &rcode).unwrap().is_none());
    }

    #[test]
    fn malformed_packet_is_an_error() {
        assert!(handle_packet(&zone(), &[0, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn resolve_against_unicast_responder() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let z = zone();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            let reply = handle_packet(&z, &buf[..n]).unwrap().unwrap();
            socket.send_to(&reply, from).await.unwrap();
        });

        let ip = resolve_host(addr, "TEST.local.", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ip, Some("192.168.1.10".parse().unwrap()));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn resolve_times_out_without_answer() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let ip = resolve_host(addr, "test.local", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(ip.is_none());
    }

    #[tokio::test]
    async fn shutdown_without_start_is_noop() {
        let responder = Responder::new(Arc::new(zone()), None);
        responder.shutdown().await;
        assert!(responder.tasks.lock().is_empty());
    }
}
