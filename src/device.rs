//! Device-wide services owned for the lifetime of the gateway.
//!
//! There is exactly one DNS responder and one web portal per device. They
//! are built once at startup and handed to the network facade inside a
//! [`DeviceContext`].

use std::net::Ipv4Addr;

use anyhow::Result;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::dns::{DnsReplyCode, DnsServer};
use crate::portal::PortalServer;

/// Requests raised by the web portal for the run loop to act on
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortalEvent {
    /// Text typed into the broadcast form
    Broadcast(String),
}

/// Portal events waiting for the run loop. Further submissions are dropped
/// while the queue is full.
pub const PORTAL_QUEUE_DEPTH: usize = 16;

pub type PortalSender = Sender<PortalEvent>;
pub type PortalReceiver = Receiver<PortalEvent>;

pub fn portal_channel() -> (PortalSender, PortalReceiver) {
    mpsc::channel(PORTAL_QUEUE_DEPTH)
}

pub trait CaptiveDns {
    fn set_ttl(&mut self, ttl: u32);

    fn set_error_reply_code(&mut self, code: DnsReplyCode);

    /// Begin answering queries for `domain` with `ip`. Replaces a binding
    /// that is already running.
    fn start(&mut self, port: u16, domain: &str, ip: Ipv4Addr) -> Result<()>;

    /// Close the socket if one is open
    fn stop(&mut self);

    /// Serve at most one pending request. Returns whether one was handled.
    fn process_next_request(&mut self) -> Result<bool>;
}

pub trait WebPortal {
    /// Start serving the form. Submitted broadcasts that should reach the
    /// mesh are sent on `events`.
    fn begin(&mut self, events: PortalSender) -> Result<()>;
}

pub struct DeviceContext<D = DnsServer, W = PortalServer> {
    pub dns: D,
    pub portal: W,
}

impl<D, W> DeviceContext<D, W>
where
    D: CaptiveDns,
    W: WebPortal,
{
    pub fn new(dns: D, portal: W) -> Self {
        Self { dns, portal }
    }
}
