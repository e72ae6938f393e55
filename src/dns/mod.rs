use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::device::CaptiveDns;
use pack::{build_answer, build_error, DnsHeaderPack, DnsQuery, CLASS_IN, TYPE_A, TYPE_ANY};

pub mod pack;

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_TTL: u32 = 300;

/// Largest datagram accepted without EDNS
const MAX_DATAGRAM: usize = 512;

/// Response codes a captive responder can be configured to answer with
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsReplyCode {
    NoError = 0,
    FormError = 1,
    ServerFailure = 2,
    NonExistentDomain = 3,
    NotImplemented = 4,
    Refused = 5,
    YXDomain = 6,
    YXRRSet = 7,
    NXRRSet = 8,
}

/// Lower-case and drop a leading `www.`, the way both the configured domain
/// and incoming question names are compared.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim_end_matches('.').to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Captive DNS responder. Resolves one domain (or `*` for every domain) to
/// a fixed IPv4 address and answers everything else with the configured
/// error code.
///
/// Polled from the run loop: [`CaptiveDns::process_next_request`] handles at
/// most one datagram and never blocks.
pub struct DnsServer {
    bind_ip: IpAddr,
    socket: Option<UdpSocket>,
    ttl: u32,
    error_reply_code: DnsReplyCode,
    domain: String,
    resolved_ip: Ipv4Addr,
    buffer: [u8; MAX_DATAGRAM],
}

impl DnsServer {
    pub fn new() -> Self {
        Self::with_bind_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Listen on a specific local address instead of all interfaces
    pub fn with_bind_ip(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            socket: None,
            ttl: DEFAULT_TTL,
            error_reply_code: DnsReplyCode::NonExistentDomain,
            domain: String::new(),
            resolved_ip: Ipv4Addr::UNSPECIFIED,
            buffer: [0; MAX_DATAGRAM],
        }
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn resolved_ip(&self) -> Ipv4Addr {
        self.resolved_ip
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn matches(&self, name: &str) -> bool {
        self.domain == "*" || normalize_domain(name) == self.domain
    }

    fn is_answerable(&self, query: &DnsQuery) -> bool {
        query.is_simple_query()
            && query.question.as_ref().is_some_and(|q| {
                (q.qtype == TYPE_A || q.qtype == TYPE_ANY)
                    && q.qclass == CLASS_IN
                    && self.matches(&q.name)
            })
    }

    /// Build the reply for one request datagram. `None` means the datagram
    /// is dropped without an answer.
    pub fn respond(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let header = match DnsHeaderPack::unpack_header(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping malformed DNS datagram: {:#}", e);
                return None;
            }
        };

        if header.response {
            return None;
        }

        let reply = match DnsQuery::parse(packet) {
            Ok(query) if self.is_answerable(&query) => {
                build_answer(&query, self.ttl, self.resolved_ip)
            }
            Ok(query) => build_error(&query.header, self.error_reply_code as u8),
            Err(e) => {
                debug!("Unreadable DNS question: {:#}", e);
                build_error(&header, self.error_reply_code as u8)
            }
        };

        match reply {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode DNS reply: {:#}", e);
                None
            }
        }
    }
}

impl Default for DnsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptiveDns for DnsServer {
    fn set_ttl(&mut self, ttl: u32) {
        self.ttl = ttl;
    }

    fn set_error_reply_code(&mut self, code: DnsReplyCode) {
        self.error_reply_code = code;
    }

    fn start(&mut self, port: u16, domain: &str, ip: Ipv4Addr) -> Result<()> {
        if self.socket.take().is_some() {
            debug!("DNS responder already running, rebinding");
        }

        self.domain = normalize_domain(domain);
        self.resolved_ip = ip;

        let addr = SocketAddr::new(self.bind_ip, port);
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("Failed to bind DNS socket on {}", addr))?;
        socket
            .set_nonblocking(true)
            .context("Failed to make DNS socket non-blocking")?;

        info!(
            "DNS responder on {} resolving '{}' to {}",
            socket.local_addr().unwrap_or(addr),
            self.domain,
            ip
        );
        self.socket = Some(socket);

        Ok(())
    }

    fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("DNS responder stopped");
        }
    }

    fn process_next_request(&mut self) -> Result<bool> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(false);
        };

        let (len, peer) = match socket.recv_from(&mut self.buffer) {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            // ICMP port unreachable from an earlier reply surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(false),
            Err(e) => return Err(e).context("Failed to receive DNS request"),
        };

        trace!("DNS request of {} bytes from {}", len, peer);

        if let Some(reply) = self.respond(&self.buffer[..len]) {
            socket
                .send_to(&reply, peer)
                .with_context(|| format!("Failed to send DNS reply to {}", peer))?;
        }

        Ok(true)
    }
}
