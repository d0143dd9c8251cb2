//! Collaborator traits: everything the protocol engines need from the host.
//!
//! The engines own protocol state and nothing else. Sockets, kernel
//! address/route changes, lease files and hook scripts are reached through
//! the traits here, bundled into a [`Ctx`] that is passed by reference into
//! every engine operation. This keeps the engines single-threaded,
//! deterministic and fully testable with in-memory fakes.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use crate::scheduler::Scheduler;

/// Identity of an interface as the embedder names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceId {
    pub index: u32,
    pub name: String,
}

impl IfaceId {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
        }
    }
}

/// Link-layer facts about an interface, captured at engine start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// IANA hardware type (1 = Ethernet).
    pub hwtype: u16,
    pub hwaddr: Vec<u8>,
    /// Routing metric; lower is preferred during router selection.
    pub metric: u32,
    pub mtu: u32,
}

impl LinkInfo {
    /// Whether this link carries a stable address usable for identity
    /// derivation. Loopback-style pseudo interfaces and links with no
    /// address at all do not.
    pub fn has_stable_address(&self) -> bool {
        const ARPHRD_LOOPBACK: u16 = 772;
        const ARPHRD_NONE: u16 = 0xfffe;
        !self.hwaddr.is_empty()
            && self.hwaddr.iter().any(|&b| b != 0)
            && self.hwtype != ARPHRD_LOOPBACK
            && self.hwtype != ARPHRD_NONE
    }
}

/// Address family tag used for hook invocations and lease-store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
        }
    }
}

/// An IPv4 route derived from DHCP options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route4 {
    pub dest: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Datagram transmission. One implementation per deployment (direct
/// sockets, or a privilege-separated proxy); the engines cannot tell the
/// difference.
///
/// The raw handle is a packet-filter socket able to broadcast before the
/// interface has an address; the UDP handle is a normal bound socket used
/// once a lease is held. The engines drive the open/close lifecycle.
pub trait Transport {
    fn open_raw(&mut self, ifindex: u32) -> io::Result<()>;
    fn close_raw(&mut self, ifindex: u32);
    fn open_udp(&mut self, ifindex: u32, bind: Ipv4Addr) -> io::Result<()>;
    fn close_udp(&mut self, ifindex: u32);

    /// Broadcast a BOOTP frame through the raw handle.
    fn send_raw(&mut self, ifindex: u32, payload: &[u8]) -> io::Result<()>;
    /// Unicast a BOOTP message from `src` to `dst` through the UDP handle.
    fn send_udp(&mut self, ifindex: u32, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8])
        -> io::Result<()>;
    /// Send a DHCPv6 message to `dst` (usually All_DHCP_Relay_Agents_and_Servers).
    fn send_udp6(&mut self, ifindex: u32, dst: Ipv6Addr, payload: &[u8]) -> io::Result<()>;
    /// Send an ICMPv6 message (Router Solicitation) to `dst`.
    fn send_icmp6(&mut self, ifindex: u32, dst: Ipv6Addr, payload: &[u8]) -> io::Result<()>;
}

/// Kernel interface/address/route manipulation.
pub trait NetConfig {
    fn add_address4(
        &mut self,
        ifindex: u32,
        addr: Ipv4Addr,
        mask: Ipv4Addr,
        broadcast: Ipv4Addr,
    ) -> io::Result<()>;
    fn del_address4(&mut self, ifindex: u32, addr: Ipv4Addr) -> io::Result<()>;
    fn add_address6(
        &mut self,
        ifindex: u32,
        addr: Ipv6Addr,
        prefix_len: u8,
        preferred: u32,
        valid: u32,
    ) -> io::Result<()>;
    fn del_address6(&mut self, ifindex: u32, addr: Ipv6Addr) -> io::Result<()>;
    /// Replace the engine-owned portion of the routing table for this
    /// interface.
    fn set_routes4(&mut self, ifindex: u32, routes: &[Route4]) -> io::Result<()>;
    /// Point the IPv6 default route at `gateway`, or withdraw it when
    /// `None`. The gateway is always a link-local router address.
    fn set_default_route6(&mut self, ifindex: u32, gateway: Option<Ipv6Addr>) -> io::Result<()>;
    fn carrier_up(&self, ifindex: u32) -> bool;
    /// Link-local IPv6 address of the interface, once DAD has finished.
    fn link_local6(&self, ifindex: u32) -> Option<Ipv6Addr>;
}

/// Persistent blob storage for leases and the DUID.
///
/// A persisted lease is the raw bytes of the last accepted protocol message
/// for that interface/family; it is re-validated on load as if freshly
/// received.
pub trait LeaseStore {
    fn load(&mut self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn save(&mut self, key: &str, data: &[u8]) -> io::Result<()>;
    fn remove(&mut self, key: &str) -> io::Result<()>;
}

/// Lease-store key for an interface/family pair.
pub fn lease_key(iface: &str, family: Family) -> String {
    match family {
        Family::Ipv4 => format!("{iface}.lease"),
        Family::Ipv6 => format!("{iface}.lease6"),
    }
}

/// Hook/script execution on state transitions.
///
/// `reason` is the human-readable transition string (BOUND, RENEW, REBIND,
/// REBOOT, TIMEOUT, EXPIRE, NAK, RELEASE, STOP, STATIC, INFORM, DELEGATED,
/// ROUTERADVERT). `env` carries the lease contents as environment pairs.
pub trait HookRunner {
    fn run(&mut self, iface: &str, family: Family, reason: &str, env: &[(String, String)]);
}

/// Everything an engine operation may touch, passed by reference.
///
/// `now` is sampled once per scheduler callback so a whole callback sees a
/// consistent clock.
pub struct Ctx<'a> {
    pub now: Instant,
    pub scheduler: &'a mut dyn Scheduler,
    pub transport: &'a mut dyn Transport,
    pub netcfg: &'a mut dyn NetConfig,
    pub store: &'a mut dyn LeaseStore,
    pub hooks: &'a mut dyn HookRunner,
}

/// Classify a transport send failure.
///
/// ENOBUFS/ENETDOWN/ENETUNREACH mean the link cannot carry the frame right
/// now; the engine keeps its lease and its backoff schedule. Anything else
/// is fatal for the lease on that interface.
pub fn is_transient_send_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOBUFS) | Some(libc::ENETDOWN) | Some(libc::ENETUNREACH)
    )
}
