//! DHCPv4 client engine (RFC 2131).
//!
//! Owns one state machine per interface: DISCOVER/OFFER/REQUEST/ACK
//! negotiation, INIT-REBOOT from a persisted lease, renew/rebind/expire
//! timers, NAK backoff, DECLINE on duplicate addresses and route
//! derivation from classless-static-route options. All platform side
//! effects go through the [`Ctx`] collaborators; the engine is re-entered
//! by scheduler callbacks and inbound datagrams only.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::auth::TokenAuth;
use crate::config::{ClientIdConfig, Dhcp4Config, Dhcp4Mode};
use crate::error::{NetleaseError, Result};
use crate::options::{self, Writer4};
use crate::platform::{
    is_transient_send_error, lease_key, Ctx, Family, IfaceId, LinkInfo, Route4,
};
use crate::scheduler::{Proto, TimerKind, TimerToken};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

pub const DHCP_DISCOVER: u8 = 1;
pub const DHCP_OFFER: u8 = 2;
pub const DHCP_REQUEST: u8 = 3;
pub const DHCP_DECLINE: u8 = 4;
pub const DHCP_ACK: u8 = 5;
pub const DHCP_NAK: u8 = 6;
pub const DHCP_RELEASE: u8 = 7;
pub const DHCP_INFORM: u8 = 8;
pub const DHCP_FORCERENEW: u8 = 9;

const DHO_SUBNET_MASK: u8 = 1;
const DHO_ROUTER: u8 = 3;
const DHO_HOSTNAME: u8 = 12;
const DHO_BROADCAST: u8 = 28;
const DHO_STATIC_ROUTE: u8 = 33;
const DHO_VENDOR_ENCAP: u8 = 43;
const DHO_REQUESTED_IP: u8 = 50;
const DHO_LEASE_TIME: u8 = 51;
const DHO_MESSAGE_TYPE: u8 = 53;
const DHO_SERVER_ID: u8 = 54;
const DHO_PARAM_REQUEST: u8 = 55;
const DHO_MESSAGE: u8 = 56;
const DHO_MAX_MESSAGE_SIZE: u8 = 57;
const DHO_RENEWAL_TIME: u8 = 58;
const DHO_REBIND_TIME: u8 = 59;
const DHO_VENDOR_CLASS_ID: u8 = 60;
const DHO_CLIENT_ID: u8 = 61;
const DHO_USER_CLASS: u8 = 77;
const DHO_RAPID_COMMIT: u8 = 80;
const DHO_FQDN: u8 = 81;
const DHO_AUTHENTICATION: u8 = 90;
const DHO_AUTOCONFIGURE: u8 = 116;
const DHO_CSR: u8 = 121;
const DHO_VIVCO: u8 = 124;
const DHO_FORCERENEW_NONCE: u8 = 145;
const DHO_MUDURL: u8 = 161;
/// Vendor (MSFT) classless-route fallback codepoint.
const DHO_CSR_MS: u8 = 249;

/// Shortest lease we will honor; anything shorter is clamped up.
const DHCP_MIN_LEASE: u32 = 20;
/// Lease time wire value meaning "never expires".
const DHCP_INFINITE_LIFETIME: u32 = u32::MAX;
/// Retransmission backoff seed and cap (seconds).
const RETRANS_BASE: u32 = 4;
const RETRANS_CAP: u32 = 64;
/// NAK backoff cap (seconds).
const NAKOFF_MAX: u32 = 60;
/// T1/T2 ratios applied when the server omits or garbles them.
const T1_RATIO: f64 = 0.5;
const T2_RATIO: f64 = 0.875;

const BOOTP_MIN_LEN: usize = 236;
const BOOTP_PACKET_MIN: usize = 300;

fn token(ifindex: u32, kind: TimerKind) -> TimerToken {
    TimerToken::new(ifindex, Proto::Dhcp4, kind)
}

fn read_u32(b: &[u8]) -> Option<u32> {
    if b.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_addr(b: &[u8]) -> Option<Ipv4Addr> {
    read_u32(b).map(Ipv4Addr::from)
}

fn classful_mask(addr: Ipv4Addr) -> Ipv4Addr {
    let o = addr.octets()[0];
    if o < 128 {
        Ipv4Addr::new(255, 0, 0, 0)
    } else if o < 192 {
        Ipv4Addr::new(255, 255, 0, 0)
    } else {
        Ipv4Addr::new(255, 255, 255, 0)
    }
}

/// A parsed BOOTP/DHCP message plus the raw bytes it came from.
///
/// The raw copy is what gets persisted: a lease file is the last accepted
/// message byte-for-byte, re-validated on reload as if freshly received.
#[derive(Debug, Clone)]
pub struct BootpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Options after the magic cookie, overload already applied.
    pub options: Vec<(u8, Vec<u8>)>,
    /// Whether the magic cookie was present (DHCP) or not (plain BOOTP).
    pub has_cookie: bool,
    pub raw: Vec<u8>,
}

impl BootpMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOTP_MIN_LEN {
            return Err(NetleaseError::Truncated {
                what: "BOOTP header",
                need: BOOTP_MIN_LEN,
                have: data.len(),
            });
        }
        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let has_cookie = data.len() >= 240 && data[236..240] == DHCP_MAGIC_COOKIE;
        let options = if has_cookie {
            options::parse_dhcp4_options(&data[240..], &data[108..236], &data[44..108])?
        } else {
            Vec::new()
        };
        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            options,
            has_cookie,
            raw: data.to_vec(),
        })
    }

    pub fn find(&self, code: u8) -> Option<Vec<u8>> {
        options::find4(&self.options, code)
    }

    pub fn has(&self, code: u8) -> bool {
        options::has4(&self.options, code)
    }

    pub fn message_type(&self) -> Option<u8> {
        self.find(DHO_MESSAGE_TYPE)
            .filter(|p| p.len() == 1)
            .map(|p| p[0])
    }
}

/// Outbound message under construction. Options are collected unordered
/// and emitted in ascending numeric order at encode time.
#[derive(Debug)]
struct MessageBuilder {
    xid: u32,
    secs: u16,
    ciaddr: Ipv4Addr,
    htype: u8,
    chaddr: Vec<u8>,
    bootp_only: bool,
    options: Vec<(u8, Vec<u8>)>,
}

impl MessageBuilder {
    fn new(xid: u32, htype: u8, chaddr: &[u8]) -> Self {
        Self {
            xid,
            secs: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            htype,
            chaddr: chaddr.to_vec(),
            bootp_only: false,
            options: Vec::new(),
        }
    }

    fn opt(&mut self, code: u8, payload: Vec<u8>) {
        self.options.push((code, payload));
    }

    fn encode(mut self, max_size: usize) -> std::result::Result<Vec<u8>, options::NoSpace> {
        let mut out = vec![0u8; BOOTP_MIN_LEN];
        out[0] = BOOTREQUEST;
        out[1] = self.htype;
        out[2] = self.chaddr.len().min(16) as u8;
        out[4..8].copy_from_slice(&self.xid.to_be_bytes());
        out[8..10].copy_from_slice(&self.secs.to_be_bytes());
        out[12..16].copy_from_slice(&self.ciaddr.octets());
        let hlen = self.chaddr.len().min(16);
        out[28..28 + hlen].copy_from_slice(&self.chaddr[..hlen]);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);
        let mut w = Writer4::new(max_size.saturating_sub(out.len()));
        if !self.bootp_only {
            self.options.sort_by_key(|(code, _)| *code);
            for (code, payload) in &self.options {
                w.put(*code, payload)?;
            }
        }
        out.extend_from_slice(&w.finish());
        if out.len() < BOOTP_PACKET_MIN {
            out.resize(BOOTP_PACKET_MIN, 0);
        }
        Ok(out)
    }
}

/// A bound DHCPv4 lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub lease_secs: u32,
    pub renewal_secs: u32,
    pub rebind_secs: u32,
    /// Magic cookie seen: DHCP rather than plain BOOTP.
    pub cookie: bool,
    pub from_store: bool,
}

impl Lease {
    fn empty() -> Self {
        Self {
            addr: Ipv4Addr::UNSPECIFIED,
            mask: Ipv4Addr::UNSPECIFIED,
            broadcast: Ipv4Addr::UNSPECIFIED,
            server_id: Ipv4Addr::UNSPECIFIED,
            lease_secs: 0,
            renewal_secs: 0,
            rebind_secs: 0,
            cookie: false,
            from_store: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.addr.is_unspecified()
    }

    pub fn infinite(&self) -> bool {
        self.lease_secs == DHCP_INFINITE_LIFETIME
    }
}

/// Extract lease fields from an accepted message.
pub fn get_lease(msg: &BootpMessage) -> Lease {
    let addr = if !msg.yiaddr.is_unspecified() {
        msg.yiaddr
    } else {
        msg.ciaddr
    };
    let mask = msg
        .find(DHO_SUBNET_MASK)
        .and_then(|p| read_addr(&p))
        .unwrap_or_else(|| classful_mask(addr));
    let broadcast = msg
        .find(DHO_BROADCAST)
        .and_then(|p| read_addr(&p))
        .unwrap_or_else(|| {
            Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
        });
    Lease {
        addr,
        mask,
        broadcast,
        server_id: msg
            .find(DHO_SERVER_ID)
            .and_then(|p| read_addr(&p))
            .unwrap_or(Ipv4Addr::UNSPECIFIED),
        lease_secs: msg.find(DHO_LEASE_TIME).and_then(|p| read_u32(&p)).unwrap_or(0),
        renewal_secs: msg
            .find(DHO_RENEWAL_TIME)
            .and_then(|p| read_u32(&p))
            .unwrap_or(0),
        rebind_secs: msg
            .find(DHO_REBIND_TIME)
            .and_then(|p| read_u32(&p))
            .unwrap_or(0),
        cookie: msg.has_cookie,
        from_store: false,
    }
}

/// Derive the routing table from an accepted message.
///
/// A classless-static-routes option (standard codepoint, then the vendor
/// fallback) overrides everything else; otherwise legacy static-route
/// pairs are combined with the router list. A CSR gateway equal to the
/// destination or to the assigned address is an on-link host route,
/// flagged with a 255.255.255.255 mask sentinel and no gateway.
pub fn get_routes(msg: &BootpMessage, assigned: Ipv4Addr, no_csr: bool) -> Vec<Route4> {
    if !no_csr {
        let csr = msg.find(DHO_CSR).or_else(|| msg.find(DHO_CSR_MS));
        if let Some(csr) = csr {
            return decode_csr(&csr, assigned);
        }
    }
    let mut routes = Vec::new();
    if let Some(pairs) = msg.find(DHO_STATIC_ROUTE) {
        for pair in pairs.chunks_exact(8) {
            let dest = Ipv4Addr::new(pair[0], pair[1], pair[2], pair[3]);
            // default-route entries are not legal in option 33
            if dest.is_unspecified() {
                continue;
            }
            routes.push(Route4 {
                dest,
                mask: classful_mask(dest),
                gateway: Ipv4Addr::new(pair[4], pair[5], pair[6], pair[7]),
            });
        }
    }
    if let Some(gws) = msg.find(DHO_ROUTER) {
        for gw in gws.chunks_exact(4) {
            routes.push(Route4 {
                dest: Ipv4Addr::UNSPECIFIED,
                mask: Ipv4Addr::UNSPECIFIED,
                gateway: Ipv4Addr::new(gw[0], gw[1], gw[2], gw[3]),
            });
        }
    }
    routes
}

fn decode_csr(buf: &[u8], assigned: Ipv4Addr) -> Vec<Route4> {
    let mut routes = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        let cidr = buf[off] as u32;
        if cidr > 32 {
            log::warn!("Discarding classless route with prefix length {cidr}");
            return routes;
        }
        let octets = ((cidr + 7) / 8) as usize;
        if off + 1 + octets + 4 > buf.len() {
            log::warn!("Truncated classless static route option");
            return routes;
        }
        let mut dest = [0u8; 4];
        dest[..octets].copy_from_slice(&buf[off + 1..off + 1 + octets]);
        let dest = Ipv4Addr::from(dest);
        let gw = &buf[off + 1 + octets..off + 1 + octets + 4];
        let gateway = Ipv4Addr::new(gw[0], gw[1], gw[2], gw[3]);
        let mask = if cidr == 0 {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::from(u32::MAX << (32 - cidr))
        };
        if gateway == dest || gateway == assigned {
            // on-link host route
            routes.push(Route4 {
                dest: gateway,
                mask: Ipv4Addr::BROADCAST,
                gateway: Ipv4Addr::UNSPECIFIED,
            });
        } else {
            routes.push(Route4 {
                dest,
                mask,
                gateway,
            });
        }
        off += 1 + octets + 4;
    }
    routes
}

/// DHCPv4 protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dhcp4State {
    Init,
    Discover,
    Reboot,
    Request,
    /// Duplicate-address probe gating entry into Bound.
    Probe,
    Bound,
    Renew,
    Rebind,
    /// Guarded terminal sub-state so a send failure during RELEASE cannot
    /// recursively re-enter teardown.
    Release,
    Inform,
}

#[derive(Debug)]
struct IfState {
    iface: IfaceId,
    link: LinkInfo,
    cfg: Dhcp4Config,
    state: Dhcp4State,
    xid: u32,
    /// Current retransmission interval in seconds; 0 means unseeded.
    interval: u32,
    nakoff: u32,
    client_id: Vec<u8>,
    lease: Lease,
    /// In-flight candidate, not yet bound. Consumed exactly once on bind.
    offer: Option<BootpMessage>,
    /// Message backing the currently bound lease.
    new_msg: Option<BootpMessage>,
    /// Message backing the previously bound lease.
    old_msg: Option<BootpMessage>,
    auth: Option<TokenAuth>,
    /// Origin for the BOOTP `secs` field of the current exchange.
    exchange_start: Option<Instant>,
    udp_bound: bool,
    address_applied: bool,
    /// Suppress repeated identical T1/T2 recompute warnings for this lease.
    timing_warned: bool,
    last_reason: String,
}

/// Process-wide DHCPv4 engine; one state machine per started interface.
pub struct Dhcp4Client {
    states: HashMap<u32, IfState>,
    duid: Option<Vec<u8>>,
    wants_exit: bool,
}

impl Dhcp4Client {
    /// `duid` is only needed for RFC 4361 client identifiers.
    pub fn new(duid: Option<Vec<u8>>) -> Self {
        Self {
            states: HashMap::new(),
            duid,
            wants_exit: false,
        }
    }

    /// Set when a static/inform duplicate-address failure on a
    /// sole-protocol interface means the process has nothing left to do.
    pub fn wants_exit(&self) -> bool {
        self.wants_exit
    }

    pub fn state_of(&self, ifindex: u32) -> Option<Dhcp4State> {
        self.states.get(&ifindex).map(|s| s.state)
    }

    pub fn lease_of(&self, ifindex: u32) -> Option<&Lease> {
        self.states.get(&ifindex).map(|s| &s.lease).filter(|l| !l.is_empty())
    }

    /// Reason string of the last hook invocation for this interface.
    pub fn last_reason_of(&self, ifindex: u32) -> Option<&str> {
        self.states
            .get(&ifindex)
            .map(|s| s.last_reason.as_str())
            .filter(|r| !r.is_empty())
    }

    fn client_id_for(&self, link: &LinkInfo, cfg: &Dhcp4Config, iface: &IfaceId) -> Result<Vec<u8>> {
        match &cfg.client_id {
            ClientIdConfig::Hardware => {
                if !link.has_stable_address() {
                    return Err(NetleaseError::NoIdentity {
                        interface: iface.name.clone(),
                        reason: "no stable link-layer address for a hardware client id"
                            .to_string(),
                    });
                }
                let mut id = Vec::with_capacity(1 + link.hwaddr.len());
                id.push(link.hwtype as u8);
                id.extend_from_slice(&link.hwaddr);
                Ok(id)
            }
            ClientIdConfig::Custom(bytes) => {
                if bytes.is_empty() {
                    return Err(NetleaseError::NoIdentity {
                        interface: iface.name.clone(),
                        reason: "configured client id is empty".to_string(),
                    });
                }
                Ok(bytes.clone())
            }
            ClientIdConfig::Duid { iaid } => {
                let duid = self.duid.as_ref().ok_or_else(|| NetleaseError::NoIdentity {
                    interface: iface.name.clone(),
                    reason: "RFC 4361 client id requested but no DUID available".to_string(),
                })?;
                let mut id = Vec::with_capacity(5 + duid.len());
                id.push(255);
                id.extend_from_slice(iaid);
                id.extend_from_slice(duid);
                Ok(id)
            }
        }
    }

    /// Start DHCPv4 on an interface. Fails silently on transport problems
    /// (logs and leaves the interface inactive), per the daemon contract;
    /// configuration problems are returned so the embedder can report them.
    pub fn start(
        &mut self,
        ctx: &mut Ctx<'_>,
        iface: IfaceId,
        link: LinkInfo,
        cfg: Dhcp4Config,
    ) -> Result<()> {
        if self.states.contains_key(&iface.index) {
            return Err(NetleaseError::AlreadyStarted {
                interface: iface.name,
                proto: "DHCPv4",
            });
        }
        let client_id = self.client_id_for(&link, &cfg, &iface)?;
        let auth = cfg.auth_token.clone().map(TokenAuth::new);
        let ifindex = iface.index;
        let mut st = IfState {
            iface,
            link,
            cfg,
            state: Dhcp4State::Init,
            xid: 0,
            interval: 0,
            nakoff: 0,
            client_id,
            lease: Lease::empty(),
            offer: None,
            new_msg: None,
            old_msg: None,
            auth,
            exchange_start: None,
            udp_bound: false,
            address_applied: false,
            timing_warned: false,
            last_reason: String::new(),
        };

        if let Dhcp4Mode::Static { address, mask } = st.cfg.mode {
            log::info!("{}: using static address {address}", st.iface.name);
            self.states.insert(ifindex, st);
            self.bind_static(ctx, ifindex, address, mask);
            return Ok(());
        }

        if let Err(e) = ctx.transport.open_raw(ifindex) {
            log::error!(
                "{}: cannot open raw transport, leaving DHCPv4 inactive: {e}",
                st.iface.name
            );
            return Ok(());
        }

        // Resume a persisted lease if it still validates.
        if matches!(st.cfg.mode, Dhcp4Mode::Auto) {
            if let Some(stored) = self.load_stored_lease(ctx, &st) {
                st.lease = {
                    let mut l = get_lease(&stored);
                    l.from_store = true;
                    l
                };
                st.new_msg = Some(stored);
                st.state = Dhcp4State::Reboot;
            }
        }

        let delay = if st.cfg.initial_delay {
            Duration::from_millis(rand::thread_rng().gen_range(0..=1000))
        } else {
            Duration::ZERO
        };
        self.states.insert(ifindex, st);
        if delay.is_zero() {
            self.begin(ctx, ifindex);
        } else {
            ctx.scheduler.schedule_once(delay, token(ifindex, TimerKind::Start));
        }
        Ok(())
    }

    fn load_stored_lease(&self, ctx: &mut Ctx<'_>, st: &IfState) -> Option<BootpMessage> {
        let key = lease_key(&st.iface.name, Family::Ipv4);
        let blob = match ctx.store.load(&key) {
            Ok(Some(b)) => b,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("{}: cannot read lease file: {e}", st.iface.name);
                return None;
            }
        };
        let msg = match BootpMessage::parse(&blob) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("{}: discarding corrupt lease file: {e}", st.iface.name);
                let _ = ctx.store.remove(&key);
                return None;
            }
        };
        if msg.yiaddr.is_unspecified() && msg.ciaddr.is_unspecified() {
            let _ = ctx.store.remove(&key);
            return None;
        }
        if let Some(auth) = &st.auth {
            let payload = msg.find(DHO_AUTHENTICATION).unwrap_or_default();
            if let Err(e) = auth.validate_stored(&payload, &st.iface.name) {
                log::warn!("{}: stored lease failed authentication: {e}", st.iface.name);
                let _ = ctx.store.remove(&key);
                return None;
            }
        }
        log::info!(
            "{}: resuming persisted lease for {}",
            st.iface.name,
            if msg.yiaddr.is_unspecified() { msg.ciaddr } else { msg.yiaddr }
        );
        Some(msg)
    }

    /// Scheduler callback entry point.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, kind: TimerKind) {
        if !self.states.contains_key(&ifindex) {
            return;
        }
        match kind {
            TimerKind::Start => self.begin(ctx, ifindex),
            TimerKind::Retransmit => self.retransmit(ctx, ifindex),
            TimerKind::Renew => self.renew(ctx, ifindex),
            TimerKind::Rebind => self.rebind(ctx, ifindex),
            TimerKind::Expire => self.expire(ctx, ifindex),
            _ => {}
        }
    }

    fn begin(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        st.exchange_start = Some(ctx.now);
        match st.cfg.mode {
            Dhcp4Mode::Inform { .. } => {
                st.state = Dhcp4State::Inform;
                st.xid = rand::thread_rng().gen();
                st.interval = 0;
                self.send_message(ctx, ifindex, DHCP_INFORM);
            }
            _ => match st.state {
                Dhcp4State::Reboot => {
                    st.xid = rand::thread_rng().gen();
                    st.interval = 0;
                    log::info!("{}: rebooting lease for {}", st.iface.name, st.lease.addr);
                    self.send_message(ctx, ifindex, DHCP_REQUEST);
                }
                _ => self.discover(ctx, ifindex),
            },
        }
    }

    fn discover(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        st.state = Dhcp4State::Discover;
        st.xid = rand::thread_rng().gen();
        st.interval = 0;
        st.offer = None;
        st.exchange_start = Some(ctx.now);
        log::info!("{}: soliciting a DHCP lease", st.iface.name);
        self.send_message(ctx, ifindex, DHCP_DISCOVER);
    }

    fn retransmit(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let mtype = {
            let Some(st) = self.states.get(&ifindex) else { return };
            match st.state {
                Dhcp4State::Discover => DHCP_DISCOVER,
                Dhcp4State::Request | Dhcp4State::Reboot | Dhcp4State::Renew
                | Dhcp4State::Rebind => DHCP_REQUEST,
                Dhcp4State::Inform => DHCP_INFORM,
                _ => return,
            }
        };
        self.send_message(ctx, ifindex, mtype);
    }

    fn build_message(st: &mut IfState, mtype: u8, elapsed: u16) -> std::result::Result<Vec<u8>, options::NoSpace> {
        let mut b = MessageBuilder::new(st.xid, st.link.hwtype as u8, &st.link.hwaddr);
        b.secs = elapsed;
        if st.cfg.bootp_only {
            b.bootp_only = true;
            return b.encode(st.cfg.max_message_size as usize);
        }

        b.opt(DHO_MESSAGE_TYPE, vec![mtype]);

        match mtype {
            DHCP_DECLINE => {
                b.opt(DHO_REQUESTED_IP, st.lease.addr.octets().to_vec());
                b.opt(DHO_MESSAGE, b"address conflict detected".to_vec());
                if !st.lease.server_id.is_unspecified() {
                    b.opt(DHO_SERVER_ID, st.lease.server_id.octets().to_vec());
                }
            }
            DHCP_RELEASE => {
                b.ciaddr = st.lease.addr;
                if !st.lease.server_id.is_unspecified() {
                    b.opt(DHO_SERVER_ID, st.lease.server_id.octets().to_vec());
                }
            }
            DHCP_REQUEST => match st.state {
                Dhcp4State::Renew | Dhcp4State::Rebind => {
                    b.ciaddr = st.lease.addr;
                    if st.state == Dhcp4State::Renew && !st.lease.server_id.is_unspecified() {
                        b.opt(DHO_SERVER_ID, st.lease.server_id.octets().to_vec());
                    }
                }
                Dhcp4State::Reboot => {
                    b.ciaddr = st.lease.addr;
                }
                _ => {
                    // REQUEST answering an OFFER
                    b.opt(DHO_REQUESTED_IP, st.lease.addr.octets().to_vec());
                    if !st.lease.server_id.is_unspecified() {
                        b.opt(DHO_SERVER_ID, st.lease.server_id.octets().to_vec());
                    }
                }
            },
            DHCP_DISCOVER => {
                if let Some(addr) = st.cfg.request_address {
                    b.opt(DHO_REQUESTED_IP, addr.octets().to_vec());
                }
                if st.cfg.rapid_commit && !st.cfg.test_mode {
                    b.opt(DHO_RAPID_COMMIT, Vec::new());
                }
                b.opt(DHO_AUTOCONFIGURE, vec![1]);
            }
            DHCP_INFORM => {
                if let Dhcp4Mode::Inform { address } = st.cfg.mode {
                    b.ciaddr = address;
                }
            }
            _ => {}
        }

        if matches!(mtype, DHCP_DISCOVER | DHCP_REQUEST) {
            if let Some(secs) = st.cfg.requested_lease_secs {
                b.opt(DHO_LEASE_TIME, secs.to_be_bytes().to_vec());
            }
        }

        if !matches!(mtype, DHCP_DECLINE | DHCP_RELEASE) {
            let prl: Vec<u8> = st
                .cfg
                .request
                .iter()
                .copied()
                .filter(|c| !st.cfg.no_request.contains(c))
                .filter(|c| {
                    // lease timers make no sense on an INFORM
                    mtype != DHCP_INFORM
                        || !matches!(*c, DHO_LEASE_TIME | DHO_RENEWAL_TIME | DHO_REBIND_TIME)
                })
                .collect();
            if !prl.is_empty() {
                b.opt(DHO_PARAM_REQUEST, prl);
            }
            b.opt(
                DHO_MAX_MESSAGE_SIZE,
                st.cfg.max_message_size.to_be_bytes().to_vec(),
            );
            if let Some(uc) = &st.cfg.user_class {
                b.opt(DHO_USER_CLASS, uc.clone());
            }
            b.opt(DHO_CLIENT_ID, st.client_id.clone());
            if let Some(vci) = &st.cfg.vendor_class_id {
                b.opt(DHO_VENDOR_CLASS_ID, vci.as_bytes().to_vec());
            }
            if let Some(venc) = &st.cfg.vendor_encapsulated {
                b.opt(DHO_VENDOR_ENCAP, venc.clone());
            }
            // RFC 4702: FQDN and hostname are mutually exclusive
            if let Some(fqdn) = &st.cfg.fqdn {
                if let Ok(name) = options::encode_domain_name(fqdn) {
                    let mut payload = vec![0x00, 0, 0];
                    payload.extend_from_slice(&name);
                    b.opt(DHO_FQDN, payload);
                }
            } else if let Some(host) = &st.cfg.hostname {
                b.opt(DHO_HOSTNAME, host.as_bytes().to_vec());
            }
            if let Some(auth) = &mut st.auth {
                let mut payload = vec![0u8; auth.payload_len()];
                let now_secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                if auth.fill(&mut payload, now_secs).is_ok() {
                    b.opt(DHO_AUTHENTICATION, payload);
                }
                b.opt(DHO_FORCERENEW_NONCE, vec![1]);
            }
            if let Some(url) = &st.cfg.mud_url {
                b.opt(DHO_MUDURL, url.as_bytes().to_vec());
            }
            if let Some(vivco) = &st.cfg.vivco {
                b.opt(DHO_VIVCO, vivco.clone());
            }
        }

        b.encode(st.cfg.max_message_size as usize)
    }

    /// Build, transmit and arm the retransmission timer for one message.
    ///
    /// The timer is armed exactly once per call even when transmission is
    /// skipped (carrier down) or fails transiently; a fatal raw-transport
    /// failure instead drops the lease and disarms retransmission.
    fn send_message(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, mtype: u8) {
        let (packet, delay, unicast) = {
            let Some(st) = self.states.get_mut(&ifindex) else { return };
            let elapsed = st
                .exchange_start
                .map(|t| ctx.now.saturating_duration_since(t).as_secs().min(u16::MAX as u64) as u16)
                .unwrap_or(0);
            let packet = match Self::build_message(st, mtype, elapsed) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::error!(
                        "{}: message too big ({} > {}), dropping this attempt",
                        st.iface.name,
                        e.needed,
                        e.limit
                    );
                    None
                }
            };
            // exponential backoff, seeded on the first send of a type
            st.interval = if st.interval == 0 {
                RETRANS_BASE
            } else {
                (st.interval * 2).min(RETRANS_CAP)
            };
            let jitter_ms: i64 = rand::thread_rng().gen_range(-1000..=1000);
            let delay_ms = (st.interval as i64 * 1000 + jitter_ms).max(100) as u64;
            let unicast = matches!(st.state, Dhcp4State::Renew | Dhcp4State::Inform if st.udp_bound)
                && !st.lease.addr.is_unspecified()
                && !st.lease.server_id.is_unspecified();
            (packet, Duration::from_millis(delay_ms), unicast)
        };

        if let Some(packet) = packet {
            let st = match self.states.get(&ifindex) {
                Some(s) => s,
                None => return,
            };
            if !ctx.netcfg.carrier_up(ifindex) {
                log::debug!("{}: carrier down, skipping transmission", st.iface.name);
            } else if unicast {
                let (src, dst) = (st.lease.addr, st.lease.server_id);
                if let Err(e) = ctx.transport.send_udp(ifindex, src, dst, &packet) {
                    log::warn!("{}: unicast send failed: {e}", st.iface.name);
                }
            } else if let Err(e) = ctx.transport.send_raw(ifindex, &packet) {
                if is_transient_send_error(&e) {
                    log::debug!("{}: transient send failure: {e}", st.iface.name);
                } else {
                    log::error!("{}: raw transport failed: {e}", st.iface.name);
                    self.drop_lease(ctx, ifindex, "FAIL");
                    return;
                }
            }
        }

        ctx.scheduler.schedule_once(delay, token(ifindex, TimerKind::Retransmit));
    }

    /// Inbound datagram entry point.
    pub fn handle_datagram(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, data: &[u8], src: Ipv4Addr) {
        let msg = match BootpMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("if{ifindex}: dropping malformed BOOTP datagram: {e}");
                return;
            }
        };
        if msg.op != BOOTREPLY {
            return;
        }
        let Some(st) = self.states.get(&ifindex) else { return };
        // FORCERENEW is server-initiated, so its xid is not ours
        if msg.message_type() == Some(DHCP_FORCERENEW) {
            let hlen = st.link.hwaddr.len().min(16);
            if msg.chaddr[..hlen] == st.link.hwaddr[..hlen] {
                self.handle_forcerenew(ctx, ifindex, msg);
            }
            return;
        }
        if msg.xid != st.xid {
            // Maybe a sibling interface is waiting on this xid.
            let target = self.states.iter().find_map(|(idx, other)| {
                (*idx != ifindex
                    && other.xid == msg.xid
                    && msg.chaddr[..other.link.hwaddr.len().min(16)]
                        == other.link.hwaddr[..other.link.hwaddr.len().min(16)])
                .then_some(*idx)
            });
            if let Some(target) = target {
                log::debug!("if{ifindex}: redirecting xid {:#x} to if{target}", msg.xid);
                self.handle_reply(ctx, target, msg, src);
            } else {
                log::debug!(
                    "if{ifindex}: wrong xid {:#x} (expecting {:#x})",
                    msg.xid,
                    st.xid
                );
            }
            return;
        }
        let hlen = st.link.hwaddr.len().min(16);
        if msg.chaddr[..hlen] != st.link.hwaddr[..hlen] {
            log::debug!("{}: hardware address mismatch in reply", st.iface.name);
            return;
        }
        self.handle_reply(ctx, ifindex, msg, src);
    }

    /// RFC 3203 FORCERENEW, only honored when message authentication is
    /// configured and the message passes it.
    fn handle_forcerenew(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: BootpMessage) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.auth.is_none() {
            log::warn!(
                "{}: ignoring FORCERENEW without authentication configured",
                st.iface.name
            );
            return;
        }
        let Some(payload) = msg.find(DHO_AUTHENTICATION) else {
            log::warn!("{}: ignoring unauthenticated FORCERENEW", st.iface.name);
            return;
        };
        if let Some(auth) = &mut st.auth {
            if let Err(e) = auth.validate(&payload, &st.iface.name) {
                log::warn!("{e}");
                return;
            }
        }
        if !matches!(
            st.state,
            Dhcp4State::Bound | Dhcp4State::Renew | Dhcp4State::Rebind
        ) {
            return;
        }
        log::info!("{}: server forces renewal", st.iface.name);
        self.renew(ctx, ifindex);
    }

    fn handle_reply(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: BootpMessage, src: Ipv4Addr) {
        enum Action {
            Bind,
            Probe,
            Request,
            Nak(u32),
            None,
        }
        let action = {
            let Some(st) = self.states.get_mut(&ifindex) else { return };
            let server = msg
                .find(DHO_SERVER_ID)
                .and_then(|p| read_addr(&p))
                .unwrap_or(src);

            if !st.cfg.allow_servers.is_empty() && !st.cfg.allow_servers.contains(&server) {
                log::debug!("{}: ignoring non-allowed server {server}", st.iface.name);
                return;
            }
            if st.cfg.deny_servers.contains(&server) {
                log::debug!("{}: ignoring denied server {server}", st.iface.name);
                return;
            }
            if let Some(code) = st.cfg.reject.iter().find(|c| msg.has(**c)) {
                log::warn!(
                    "{}: rejecting reply carrying reject option {code}",
                    st.iface.name
                );
                return;
            }
            if let Some(auth) = &mut st.auth {
                match msg.find(DHO_AUTHENTICATION) {
                    Some(payload) => {
                        if let Err(e) = auth.validate(&payload, &st.iface.name) {
                            log::warn!("{e}");
                            return;
                        }
                    }
                    None => {
                        log::warn!(
                            "{}: dropping unauthenticated reply (auth configured)",
                            st.iface.name
                        );
                        return;
                    }
                }
            }

            let mtype = msg.message_type();

            if mtype == Some(DHCP_NAK) {
                if st.cfg.require_server_id && !msg.has(DHO_SERVER_ID) {
                    log::warn!(
                        "{}: ignoring NAK without a server identifier",
                        st.iface.name
                    );
                    return;
                }
                if let Some(text) = msg.find(DHO_MESSAGE) {
                    log::warn!(
                        "{}: NAK: {}",
                        st.iface.name,
                        String::from_utf8_lossy(&text)
                    );
                } else {
                    log::warn!("{}: received NAK", st.iface.name);
                }
                if st.cfg.test_mode {
                    return;
                }
                st.nakoff = if st.nakoff == 0 {
                    1
                } else {
                    (st.nakoff * 2).min(NAKOFF_MAX)
                };
                Action::Nak(st.nakoff)
            } else {
                // required-option scan; plain BOOTP is exempt from server-id
                for code in &st.cfg.require {
                    if !msg.has(*code) && (msg.has_cookie || *code != DHO_SERVER_ID) {
                        log::debug!(
                            "{}: reply missing required option {code}",
                            st.iface.name
                        );
                        return;
                    }
                }

                match st.state {
                    Dhcp4State::Discover => {
                        if mtype.is_none() && !msg.has_cookie {
                            // plain BOOTP: the reply is the lease, no REQUEST phase
                            if msg.yiaddr.is_unspecified() {
                                Action::None
                            } else {
                                st.offer = Some(msg);
                                Action::Bind
                            }
                        } else if mtype == Some(DHCP_OFFER) {
                            if msg.yiaddr.is_unspecified() {
                                if let Some(hint) = msg.find(DHO_AUTOCONFIGURE) {
                                    let on = hint.first() == Some(&1);
                                    log::info!(
                                        "{}: server asks IPv4LL {}",
                                        st.iface.name,
                                        if on { "on" } else { "off" }
                                    );
                                    ctx.hooks.run(
                                        &st.iface.name,
                                        Family::Ipv4,
                                        if on { "IPV4LL_ON" } else { "IPV4LL_OFF" },
                                        &[],
                                    );
                                }
                                return;
                            }
                            if msg.yiaddr.is_broadcast() {
                                return;
                            }
                            st.nakoff = 0;
                            let mut lease = get_lease(&msg);
                            lease.from_store = false;
                            st.lease.addr = lease.addr;
                            st.lease.server_id = lease.server_id;
                            st.offer = Some(msg);
                            st.state = Dhcp4State::Request;
                            st.interval = 0;
                            log::info!(
                                "{}: offered {} from {server}",
                                st.iface.name,
                                st.lease.addr
                            );
                            Action::Request
                        } else if mtype == Some(DHCP_ACK)
                            && st.cfg.rapid_commit
                            && msg.has(DHO_RAPID_COMMIT)
                        {
                            // rapid-commit ACK promotes straight past REQUEST
                            st.nakoff = 0;
                            st.state = Dhcp4State::Request;
                            st.offer = Some(msg);
                            if st.cfg.arp_probe {
                                st.state = Dhcp4State::Probe;
                                Action::Probe
                            } else {
                                Action::Bind
                            }
                        } else {
                            Action::None
                        }
                    }
                    Dhcp4State::Request | Dhcp4State::Reboot | Dhcp4State::Renew
                    | Dhcp4State::Rebind | Dhcp4State::Inform => {
                        let acceptable = mtype == Some(DHCP_ACK)
                            || (mtype.is_none() && !msg.has_cookie);
                        if !acceptable {
                            Action::None
                        } else if msg.yiaddr.is_unspecified() && msg.ciaddr.is_unspecified()
                            && !matches!(st.cfg.mode, Dhcp4Mode::Inform { .. })
                        {
                            Action::None
                        } else {
                            st.nakoff = 0;
                            let probe = st.cfg.arp_probe
                                && matches!(st.state, Dhcp4State::Request | Dhcp4State::Reboot);
                            st.offer = Some(msg);
                            if probe {
                                st.state = Dhcp4State::Probe;
                                Action::Probe
                            } else {
                                Action::Bind
                            }
                        }
                    }
                    _ => Action::None,
                }
            }
        };

        match action {
            Action::Bind => self.bind(ctx, ifindex),
            Action::Probe => {
                // retransmission stops while the ARP collaborator probes
                ctx.scheduler.cancel(token(ifindex, TimerKind::Retransmit));
                if let Some(st) = self.states.get(&ifindex) {
                    log::debug!("{}: probing offered address", st.iface.name);
                }
            }
            Action::Request => {
                // secs keeps counting from the start of the exchange
                self.send_message(ctx, ifindex, DHCP_REQUEST);
            }
            Action::Nak(nakoff) => {
                self.drop_lease(ctx, ifindex, "NAK");
                if let Some(st) = self.states.get_mut(&ifindex) {
                    let key = lease_key(&st.iface.name, Family::Ipv4);
                    let _ = ctx.store.remove(&key);
                    st.state = Dhcp4State::Init;
                    st.nakoff = nakoff;
                    log::info!(
                        "{}: backing off {nakoff}s before rediscovery",
                        st.iface.name
                    );
                    ctx.scheduler
                        .schedule_once(Duration::from_secs(nakoff as u64), token(ifindex, TimerKind::Start));
                }
            }
            Action::None => {}
        }
    }

    /// Called by the ARP collaborator when the offered address probed clean.
    pub fn probe_succeeded(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get(&ifindex) else { return };
        if st.state != Dhcp4State::Probe {
            return;
        }
        self.bind(ctx, ifindex);
    }

    fn bind_static(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, address: Ipv4Addr, mask: Ipv4Addr) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        st.lease = Lease {
            addr: address,
            mask,
            broadcast: Ipv4Addr::from(u32::from(address) | !u32::from(mask)),
            server_id: Ipv4Addr::UNSPECIFIED,
            lease_secs: DHCP_INFINITE_LIFETIME,
            renewal_secs: 0,
            rebind_secs: 0,
            cookie: false,
            from_store: false,
        };
        st.state = Dhcp4State::Bound;
        st.last_reason = "STATIC".to_string();
        st.address_applied = true;
        let name = st.iface.name.clone();
        let broadcast = st.lease.broadcast;
        if let Err(e) = ctx.netcfg.add_address4(ifindex, address, mask, broadcast) {
            log::error!("{name}: failed to apply static address: {e}");
        }
        let env = self.lease_env(ifindex);
        ctx.hooks.run(&name, Family::Ipv4, "STATIC", &env);
    }

    /// Consume the accepted message and bring the lease up.
    fn bind(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let Some(msg) = st.offer.take() else {
            log::warn!("{}: bind without an accepted message", st.iface.name);
            return;
        };
        ctx.scheduler.cancel(token(ifindex, TimerKind::Retransmit));
        ctx.scheduler.cancel(token(ifindex, TimerKind::Start));

        let was = st.state;
        let from_store = st.lease.from_store && was == Dhcp4State::Reboot;
        let mut lease = get_lease(&msg);
        lease.from_store = from_store;
        let inform = matches!(st.cfg.mode, Dhcp4Mode::Inform { .. });
        if let Dhcp4Mode::Inform { address } = st.cfg.mode {
            lease.addr = address;
        }

        if !inform && lease.cookie {
            if lease.lease_secs < DHCP_MIN_LEASE {
                log::warn!(
                    "{}: lease time {}s below minimum, clamping to {DHCP_MIN_LEASE}s",
                    st.iface.name,
                    lease.lease_secs
                );
                lease.lease_secs = DHCP_MIN_LEASE;
            }
            if !lease.infinite()
                && (lease.renewal_secs == 0
                    || lease.rebind_secs == 0
                    || lease.rebind_secs >= lease.lease_secs
                    || lease.renewal_secs > lease.rebind_secs)
            {
                // warn only when the server actually sent bad values, and
                // only once per lease
                let sent_both = lease.renewal_secs != 0 && lease.rebind_secs != 0;
                if sent_both && !st.timing_warned {
                    log::warn!(
                        "{}: server sent inconsistent T1/T2 ({}/{} lease {}), recomputing",
                        st.iface.name,
                        lease.renewal_secs,
                        lease.rebind_secs,
                        lease.lease_secs
                    );
                    st.timing_warned = true;
                }
                lease.renewal_secs = (lease.lease_secs as f64 * T1_RATIO) as u32;
                lease.rebind_secs = (lease.lease_secs as f64 * T2_RATIO) as u32;
            }
        }

        let reason = match (inform, was) {
            (true, _) => "INFORM",
            (_, Dhcp4State::Renew) => "RENEW",
            (_, Dhcp4State::Rebind) => "REBIND",
            (_, Dhcp4State::Reboot) => "REBOOT",
            _ if from_store => "TIMEOUT",
            _ => "BOUND",
        };

        log::info!(
            "{}: leased {} for {} seconds ({reason})",
            st.iface.name,
            lease.addr,
            if lease.infinite() { 0 } else { lease.lease_secs }
        );

        st.old_msg = st.new_msg.take();
        st.new_msg = Some(msg);
        st.lease = lease;
        st.state = Dhcp4State::Bound;
        st.last_reason = reason.to_string();

        let is_static = matches!(st.cfg.mode, Dhcp4Mode::Static { .. });
        if !from_store && !inform && !is_static && !st.cfg.test_mode {
            let key = lease_key(&st.iface.name, Family::Ipv4);
            if let Some(raw) = st.new_msg.as_ref().map(|m| m.raw.clone()) {
                if let Err(e) = ctx.store.save(&key, &raw) {
                    log::warn!("{}: cannot persist lease: {e}", st.iface.name);
                }
            }
        }

        // BOOTP leases have no lifetime and never renew
        if st.lease.cookie && !st.lease.infinite() && !inform {
            let renew = st.lease.renewal_secs as u64;
            let rebind = st.lease.rebind_secs as u64;
            let expire = st.lease.lease_secs as u64;
            ctx.scheduler
                .schedule_once(Duration::from_secs(renew), token(ifindex, TimerKind::Renew));
            ctx.scheduler
                .schedule_once(Duration::from_secs(rebind), token(ifindex, TimerKind::Rebind));
            ctx.scheduler
                .schedule_once(Duration::from_secs(expire), token(ifindex, TimerKind::Expire));
        }

        if !inform && !st.cfg.test_mode {
            let (addr, mask, broadcast) = (st.lease.addr, st.lease.mask, st.lease.broadcast);
            let name = st.iface.name.clone();
            st.address_applied = true;
            if let Err(e) = ctx.netcfg.add_address4(ifindex, addr, mask, broadcast) {
                log::error!("{name}: failed to apply address {addr}: {e}");
            }
            let routes = st
                .new_msg
                .as_ref()
                .map(|m| get_routes(m, addr, st.cfg.no_csr))
                .unwrap_or_default();
            if let Err(e) = ctx.netcfg.set_routes4(ifindex, &routes) {
                log::error!("{name}: failed to install routes: {e}");
            }
            // lease held: raw filter is no longer needed, switch to UDP
            ctx.transport.close_raw(ifindex);
            if !st.udp_bound {
                if let Err(e) = ctx.transport.open_udp(ifindex, addr) {
                    log::warn!("{name}: cannot open UDP transport: {e}");
                } else {
                    st.udp_bound = true;
                }
            }
        }

        let name = self.states.get(&ifindex).map(|s| s.iface.name.clone());
        if let Some(name) = name {
            let env = self.lease_env(ifindex);
            ctx.hooks.run(&name, Family::Ipv4, reason, &env);
        }
    }

    /// T1: try to renew against the leasing server.
    pub fn renew(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() {
            return;
        }
        log::info!("{}: renewing lease of {}", st.iface.name, st.lease.addr);
        st.state = Dhcp4State::Renew;
        st.xid = rand::thread_rng().gen();
        st.interval = 0;
        st.exchange_start = Some(ctx.now);
        self.send_message(ctx, ifindex, DHCP_REQUEST);
    }

    /// T2: give up on the leasing server, broadcast to anyone.
    pub fn rebind(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() {
            return;
        }
        log::warn!(
            "{}: failed to renew, rebinding lease of {}",
            st.iface.name,
            st.lease.addr
        );
        st.state = Dhcp4State::Rebind;
        st.timing_warned = false;
        st.interval = 0;
        st.exchange_start = Some(ctx.now);
        // rebind broadcasts; the unicast path keys off Renew state
        self.send_message(ctx, ifindex, DHCP_REQUEST);
    }

    fn expire(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.cfg.extend_lease_on_expiry {
            log::warn!(
                "{}: lease expired, extending as configured",
                st.iface.name
            );
            return;
        }
        log::warn!("{}: lease expired", st.iface.name);
        let key = lease_key(&st.iface.name, Family::Ipv4);
        let carrier_ok = !st.cfg.carrier_only || ctx.netcfg.carrier_up(ifindex);
        let _ = ctx.store.remove(&key);
        self.drop_lease(ctx, ifindex, "EXPIRE");
        if carrier_ok {
            self.discover(ctx, ifindex);
        }
    }

    /// Send RELEASE (when we hold a lease) and tear down.
    pub fn release(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let has_lease = self
            .states
            .get(&ifindex)
            .map(|st| !st.lease.is_empty() && st.lease.cookie && !st.lease.from_store)
            .unwrap_or(false);
        if has_lease {
            if let Some(st) = self.states.get_mut(&ifindex) {
                if st.state == Dhcp4State::Release {
                    return;
                }
                st.state = Dhcp4State::Release;
            }
            let packet = {
                let Some(st) = self.states.get_mut(&ifindex) else { return };
                Self::build_message(st, DHCP_RELEASE, 0).ok()
            };
            if let Some(packet) = packet {
                if let Some(st) = self.states.get(&ifindex) {
                    let (src, dst) = (st.lease.addr, st.lease.server_id);
                    if st.udp_bound && !dst.is_unspecified() {
                        let _ = ctx.transport.send_udp(ifindex, src, dst, &packet);
                    } else {
                        let _ = ctx.transport.send_raw(ifindex, &packet);
                    }
                }
            }
            let key = self
                .states
                .get(&ifindex)
                .map(|st| lease_key(&st.iface.name, Family::Ipv4));
            if let Some(key) = key {
                let _ = ctx.store.remove(&key);
            }
        }
        self.drop_lease(ctx, ifindex, "RELEASE");
    }

    /// Idempotent teardown: cancels timers, closes transports, removes the
    /// applied address and zeroes the lease. A second call is a no-op.
    pub fn drop_lease(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, reason: &str) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() && st.state == Dhcp4State::Init && st.offer.is_none() {
            return;
        }
        for kind in [
            TimerKind::Start,
            TimerKind::Retransmit,
            TimerKind::Renew,
            TimerKind::Rebind,
            TimerKind::Expire,
        ] {
            ctx.scheduler.cancel(token(ifindex, kind));
        }
        let name = st.iface.name.clone();
        let addr = st.lease.addr;
        let applied = st.address_applied;
        let env = if st.lease.is_empty() {
            Vec::new()
        } else {
            lease_env_of(st)
        };
        st.lease = Lease::empty();
        st.offer = None;
        st.old_msg = st.new_msg.take();
        st.address_applied = false;
        st.interval = 0;
        st.last_reason = reason.to_string();
        st.state = Dhcp4State::Init;
        ctx.transport.close_raw(ifindex);
        if st.udp_bound {
            ctx.transport.close_udp(ifindex);
            st.udp_bound = false;
        }
        if applied && !addr.is_unspecified() {
            if let Err(e) = ctx.netcfg.del_address4(ifindex, addr) {
                log::warn!("{name}: failed to remove address {addr}: {e}");
            }
            let _ = ctx.netcfg.set_routes4(ifindex, &[]);
        }
        log::info!("{name}: lease dropped ({reason})");
        ctx.hooks.run(&name, Family::Ipv4, reason, &env);
    }

    /// Full teardown and removal of the per-interface state.
    pub fn free(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        self.drop_lease(ctx, ifindex, "STOP");
        self.states.remove(&ifindex);
    }

    /// The ARP/DAD collaborator reports `addr` as duplicated on the link.
    pub fn address_duplicated(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, addr: Ipv4Addr) {
        let relevant = {
            let Some(st) = self.states.get(&ifindex) else { return };
            st.lease.addr == addr
                || st
                    .offer
                    .as_ref()
                    .map(|o| o.yiaddr == addr)
                    .unwrap_or(false)
        };
        if !relevant {
            return;
        }
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        log::warn!("{}: address {addr} is in use on the network", st.iface.name);
        let key = lease_key(&st.iface.name, Family::Ipv4);
        let _ = ctx.store.remove(&key);
        let static_or_inform =
            !matches!(st.cfg.mode, Dhcp4Mode::Auto);
        let decline = !static_or_inform && !st.lease.from_store && !st.lease.is_empty();
        let sole = st.cfg.sole_protocol;
        if decline {
            st.lease.addr = addr;
            let packet = Self::build_message(st, DHCP_DECLINE, 0).ok();
            if let Some(packet) = packet {
                let _ = ctx.transport.send_raw(ifindex, &packet);
            }
        }
        let _ = ctx.netcfg.del_address4(ifindex, addr);
        for kind in [
            TimerKind::Start,
            TimerKind::Retransmit,
            TimerKind::Renew,
            TimerKind::Rebind,
            TimerKind::Expire,
        ] {
            ctx.scheduler.cancel(token(ifindex, kind));
        }
        if static_or_inform {
            let name = self
                .states
                .get(&ifindex)
                .map(|s| s.iface.name.clone())
                .unwrap_or_default();
            ctx.hooks.run(&name, Family::Ipv4, "EXPIRE", &[]);
            if sole {
                log::error!("{name}: static address duplicated and nothing else to do");
                self.wants_exit = true;
            }
            return;
        }
        if let Some(st) = self.states.get_mut(&ifindex) {
            st.lease = Lease::empty();
            st.offer = None;
            st.state = Dhcp4State::Init;
            st.address_applied = false;
        }
        let delay = Duration::from_secs(rand::thread_rng().gen_range(1..=10));
        log::info!("if{ifindex}: rediscovering in {}s", delay.as_secs());
        ctx.scheduler.schedule_once(delay, token(ifindex, TimerKind::Start));
    }

    /// Environment pairs describing the current lease, for hooks and `dump`.
    pub fn lease_env(&self, ifindex: u32) -> Vec<(String, String)> {
        self.states
            .get(&ifindex)
            .map(lease_env_of)
            .unwrap_or_default()
    }

    /// Print the persisted lease as hook-script environment variables.
    pub fn dump(&self, ctx: &mut Ctx<'_>, iface_name: &str) -> Result<Vec<(String, String)>> {
        let key = lease_key(iface_name, Family::Ipv4);
        let blob = ctx
            .store
            .load(&key)
            .map_err(|e| NetleaseError::store_error("load", &key, e))?
            .ok_or_else(|| NetleaseError::Store {
                operation: "load".to_string(),
                key: key.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no lease"),
            })?;
        let msg = BootpMessage::parse(&blob)?;
        let lease = get_lease(&msg);
        let mut env = vec![
            ("new_ip_address".to_string(), lease.addr.to_string()),
            ("new_subnet_mask".to_string(), lease.mask.to_string()),
            ("new_broadcast_address".to_string(), lease.broadcast.to_string()),
            ("new_dhcp_server_identifier".to_string(), lease.server_id.to_string()),
            ("new_dhcp_lease_time".to_string(), lease.lease_secs.to_string()),
        ];
        if let Some(routers) = msg.find(DHO_ROUTER) {
            let list: Vec<String> = routers
                .chunks_exact(4)
                .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
                .collect();
            env.push(("new_routers".to_string(), list.join(" ")));
        }
        for (k, v) in &env {
            log::info!("{k}={v}");
        }
        Ok(env)
    }
}

fn lease_env_of(st: &IfState) -> Vec<(String, String)> {
    if st.lease.is_empty() {
        return Vec::new();
    }
    vec![
        ("new_ip_address".to_string(), st.lease.addr.to_string()),
        ("new_subnet_mask".to_string(), st.lease.mask.to_string()),
        (
            "new_broadcast_address".to_string(),
            st.lease.broadcast.to_string(),
        ),
        (
            "new_dhcp_server_identifier".to_string(),
            st.lease.server_id.to_string(),
        ),
        (
            "new_dhcp_lease_time".to_string(),
            st.lease.lease_secs.to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dhcp4Config, Dhcp4Mode};
    use crate::scheduler::TimerKind;
    use crate::testutil::Harness;

    const HW: [u8; 6] = [0x02, 0x00, 0x5e, 0x00, 0x01, 0x02];

    fn iface() -> IfaceId {
        IfaceId::new(1, "eth0")
    }

    fn link() -> LinkInfo {
        LinkInfo {
            hwtype: 1,
            hwaddr: HW.to_vec(),
            metric: 0,
            mtu: 1500,
        }
    }

    fn cfg() -> Dhcp4Config {
        Dhcp4Config {
            initial_delay: false,
            arp_probe: false,
            ..Default::default()
        }
    }

    fn reply(xid: u32, yiaddr: Ipv4Addr, opts: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![0u8; BOOTP_MIN_LEN];
        out[0] = BOOTREPLY;
        out[1] = 1;
        out[2] = 6;
        out[4..8].copy_from_slice(&xid.to_be_bytes());
        out[16..20].copy_from_slice(&yiaddr.octets());
        out[28..34].copy_from_slice(&HW);
        out.extend_from_slice(&DHCP_MAGIC_COOKIE);
        for (code, payload) in opts {
            out.push(*code);
            out.push(payload.len() as u8);
            out.extend_from_slice(payload);
        }
        out.push(options::DHO_END);
        out
    }

    fn sent_xid(payload: &[u8]) -> u32 {
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])
    }

    fn sent_type(payload: &[u8]) -> Option<u8> {
        let msg = BootpMessage::parse(payload).unwrap();
        msg.message_type()
    }

    fn server() -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, 1)
    }

    fn offer_opts(mtype: u8, lease: u32) -> Vec<(u8, Vec<u8>)> {
        vec![
            (DHO_MESSAGE_TYPE, vec![mtype]),
            (DHO_SERVER_ID, server().octets().to_vec()),
            (DHO_SUBNET_MASK, vec![255, 255, 255, 0]),
            (DHO_LEASE_TIME, lease.to_be_bytes().to_vec()),
        ]
    }

    #[test]
    fn test_full_acquisition_to_bound() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);

        // DISCOVER went out through the raw transport
        let discover = h.transport.last_payload().to_vec();
        assert_eq!(discover[0], BOOTREQUEST);
        assert_eq!(&discover[236..240], &DHCP_MAGIC_COOKIE);
        assert_eq!(sent_type(&discover), Some(DHCP_DISCOVER));
        let xid = sent_xid(&discover);

        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 3600)), server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Request));
        let request = h.transport.last_payload().to_vec();
        assert_eq!(sent_type(&request), Some(DHCP_REQUEST));
        let req = BootpMessage::parse(&request).unwrap();
        assert_eq!(req.find(DHO_REQUESTED_IP).unwrap(), yi.octets().to_vec());
        assert_eq!(req.find(DHO_SERVER_ID).unwrap(), server().octets().to_vec());

        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_ACK, 3600)), server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Bound));
        let lease = c.lease_of(1).unwrap();
        // T1/T2 recomputed from the lease time as 0.5 and 0.875
        assert_eq!(lease.renewal_secs, 1800);
        assert_eq!(lease.rebind_secs, 3150);
        assert!(h.store.blobs.contains_key("eth0.lease"));
        assert!(h.netcfg.addrs4.iter().any(|&(i, a, _, _)| i == 1 && a == yi));
        for kind in [TimerKind::Renew, TimerKind::Rebind, TimerKind::Expire] {
            assert!(h.scheduler.is_armed(token(1, kind)), "{kind:?} not armed");
        }
        assert_eq!(
            h.hooks.runs.last(),
            Some(&("eth0".to_string(), Family::Ipv4, "BOUND".to_string()))
        );
    }

    #[test]
    fn test_options_emitted_in_ascending_order() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let msg = BootpMessage::parse(h.transport.last_payload()).unwrap();
        let codes: Vec<u8> = msg.options.iter().map(|(c, _)| *c).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        assert_eq!(codes, sorted);
    }

    #[test]
    fn test_nak_without_server_id_ignored_when_required() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut config = cfg();
        config.require_server_id = true;
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), config).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 600)), server());
        // NAK with no server identifier: rejected outright
        let nak = reply(xid, Ipv4Addr::UNSPECIFIED, &[(DHO_MESSAGE_TYPE, vec![DHCP_NAK])]);
        c.handle_datagram(&mut ctx, 1, &nak, server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Request));
        assert_eq!(c.states[&1].nakoff, 0);
    }

    #[test]
    fn test_first_nak_backs_off_one_second() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 600)), server());
        let nak = reply(
            xid,
            Ipv4Addr::UNSPECIFIED,
            &[
                (DHO_MESSAGE_TYPE, vec![DHCP_NAK]),
                (DHO_SERVER_ID, server().octets().to_vec()),
            ],
        );
        c.handle_datagram(&mut ctx, 1, &nak, server());
        drop(ctx);
        assert_eq!(c.states[&1].nakoff, 1);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Init));
        assert!(!h.store.blobs.contains_key("eth0.lease"));
        assert!(h.scheduler.is_armed(token(1, TimerKind::Start)));
        assert!(h
            .hooks
            .runs
            .iter()
            .any(|(_, _, reason)| reason == "NAK"));
    }

    #[test]
    fn test_nak_backoff_doubles_and_caps() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let nak = reply(
            xid,
            Ipv4Addr::UNSPECIFIED,
            &[
                (DHO_MESSAGE_TYPE, vec![DHCP_NAK]),
                (DHO_SERVER_ID, server().octets().to_vec()),
            ],
        );
        let mut seen = Vec::new();
        let mut ctx = h.ctx();
        for _ in 0..8 {
            c.handle_datagram(&mut ctx, 1, &nak, server());
            seen.push(c.states[&1].nakoff);
        }
        drop(ctx);
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_short_lease_clamped() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 9);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 5)), server());
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_ACK, 5)), server());
        drop(ctx);
        let lease = c.lease_of(1).unwrap();
        assert_eq!(lease.lease_secs, DHCP_MIN_LEASE);
        assert_eq!(lease.renewal_secs, 10);
    }

    #[test]
    fn test_drop_lease_is_idempotent() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 600)), server());
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_ACK, 600)), server());
        c.drop_lease(&mut ctx, 1, "STOP");
        let hooks_after_first = {
            drop(ctx);
            h.hooks.runs.len()
        };
        let mut ctx = h.ctx();
        c.drop_lease(&mut ctx, 1, "STOP");
        drop(ctx);
        assert_eq!(h.hooks.runs.len(), hooks_after_first);
        assert!(c.lease_of(1).is_none());
        assert_eq!(h.scheduler.armed(), 0);
    }

    #[test]
    fn test_bootp_reply_exempt_from_required_server_id() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut config = cfg();
        config.require.insert(DHO_SERVER_ID);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), config).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        // plain BOOTP: fixed header only, no cookie, no options
        let mut bootp = vec![0u8; BOOTP_MIN_LEN];
        bootp[0] = BOOTREPLY;
        bootp[1] = 1;
        bootp[2] = 6;
        bootp[4..8].copy_from_slice(&xid.to_be_bytes());
        bootp[16..20].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 7).octets());
        bootp[28..34].copy_from_slice(&HW);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &bootp, server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Bound));
        // no lifetime, so no renewal machinery
        assert!(!h.scheduler.is_armed(token(1, TimerKind::Renew)));
    }

    #[test]
    fn test_reboot_from_persisted_lease() {
        let mut h = Harness::new();
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let stored = reply(0x1234, yi, &offer_opts(DHCP_ACK, 3600));
        h.store.blobs.insert("eth0.lease".to_string(), stored);
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Reboot));
        let req = BootpMessage::parse(h.transport.last_payload()).unwrap();
        assert_eq!(req.message_type(), Some(DHCP_REQUEST));
        assert_eq!(req.ciaddr, yi);
    }

    #[test]
    fn test_message_too_big_still_arms_retry() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut config = cfg();
        config.max_message_size = 245;
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), config).unwrap();
        drop(ctx);
        assert!(h.transport.sent.is_empty());
        assert!(h.scheduler.is_armed(token(1, TimerKind::Retransmit)));
    }

    #[test]
    fn test_csr_overrides_legacy_routes() {
        let assigned = Ipv4Addr::new(192, 0, 2, 50);
        // 10.0.0.0/8 via 192.0.2.1, then a default route
        let csr = vec![
            8, 10, 192, 0, 2, 1, // /8
            0, 192, 0, 2, 254, // /0
        ];
        let raw = reply(
            1,
            assigned,
            &[
                (DHO_CSR, csr),
                (DHO_ROUTER, vec![192, 0, 2, 99]),
                (DHO_STATIC_ROUTE, vec![172, 16, 0, 0, 192, 0, 2, 98]),
            ],
        );
        let msg = BootpMessage::parse(&raw).unwrap();
        let routes = get_routes(&msg, assigned, false);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].dest, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(routes[0].mask, Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(routes[1].dest, Ipv4Addr::UNSPECIFIED);
        assert_eq!(routes[1].gateway, Ipv4Addr::new(192, 0, 2, 254));
        // with CSR masked out, the legacy pair wins
        let legacy = get_routes(&msg, assigned, true);
        assert!(legacy.iter().any(|r| r.dest == Ipv4Addr::new(172, 16, 0, 0)));
        assert!(legacy.iter().any(|r| r.gateway == Ipv4Addr::new(192, 0, 2, 99)));
    }

    #[test]
    fn test_csr_gateway_equal_to_dest_is_host_route() {
        let assigned = Ipv4Addr::new(192, 0, 2, 50);
        let csr = vec![32, 192, 0, 2, 7, 192, 0, 2, 7];
        let raw = reply(1, assigned, &[(DHO_CSR, csr)]);
        let msg = BootpMessage::parse(&raw).unwrap();
        let routes = get_routes(&msg, assigned, false);
        assert_eq!(
            routes,
            vec![Route4 {
                dest: Ipv4Addr::new(192, 0, 2, 7),
                mask: Ipv4Addr::BROADCAST,
                gateway: Ipv4Addr::UNSPECIFIED,
            }]
        );
    }

    #[test]
    fn test_xid_mismatch_redirects_to_sibling() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        let sibling = LinkInfo {
            hwaddr: vec![0x02, 0x00, 0x5e, 0x00, 0x09, 0x09],
            ..link()
        };
        c.start(&mut ctx, IfaceId::new(7, "eth1"), sibling, cfg()).unwrap();
        drop(ctx);
        // the reply to eth0's exchange arrives on eth1
        let xid = sent_xid(h.transport.sent[0].payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 7, &reply(xid, yi, &offer_opts(DHCP_OFFER, 600)), server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Request));
        assert_eq!(c.state_of(7), Some(Dhcp4State::Discover));
    }

    #[test]
    fn test_static_mode_binds_without_negotiation() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut config = cfg();
        config.mode = Dhcp4Mode::Static {
            address: Ipv4Addr::new(10, 1, 1, 1),
            mask: Ipv4Addr::new(255, 255, 255, 0),
        };
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), config).unwrap();
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Bound));
        assert_eq!(c.last_reason_of(1), Some("STATIC"));
        assert!(h.transport.sent.is_empty());
        assert_eq!(
            h.hooks.runs.last(),
            Some(&("eth0".to_string(), Family::Ipv4, "STATIC".to_string()))
        );
    }

    #[test]
    fn test_duplicate_address_declines_and_rediscovers() {
        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_OFFER, 600)), server());
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer_opts(DHCP_ACK, 600)), server());
        c.address_duplicated(&mut ctx, 1, yi);
        drop(ctx);
        let decline = h
            .transport
            .sent
            .iter()
            .rev()
            .find_map(|s| BootpMessage::parse(s.payload()).ok())
            .filter(|m| m.message_type() == Some(DHCP_DECLINE));
        assert!(decline.is_some());
        assert!(!h.store.blobs.contains_key("eth0.lease"));
        assert!(h.scheduler.is_armed(token(1, TimerKind::Start)));
        assert!(!c.wants_exit());
    }

    #[test]
    fn test_forcerenew_requires_authentication() {
        fn server_auth(srv: &mut TokenAuth, replay: u64) -> Vec<u8> {
            let mut p = vec![0u8; srv.payload_len()];
            srv.fill(&mut p, replay).unwrap();
            p
        }

        let mut h = Harness::new();
        let mut c = Dhcp4Client::new(None);
        let mut config = cfg();
        config.auth_token = Some(b"sesame".to_vec());
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), link(), config).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let yi = Ipv4Addr::new(192, 0, 2, 50);
        let mut srv = TokenAuth::new(b"sesame".to_vec());
        let mut offer = offer_opts(DHCP_OFFER, 3600);
        offer.push((DHO_AUTHENTICATION, server_auth(&mut srv, 1)));
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &offer), server());
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let mut ack = offer_opts(DHCP_ACK, 3600);
        ack.push((DHO_AUTHENTICATION, server_auth(&mut srv, 2)));
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply(xid, yi, &ack), server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Bound));

        // unauthenticated FORCERENEW is ignored even with our chaddr
        let bare = reply(
            0xdeadbeef,
            yi,
            &[
                (DHO_MESSAGE_TYPE, vec![DHCP_FORCERENEW]),
                (DHO_SERVER_ID, server().octets().to_vec()),
            ],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &bare, server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Bound));

        // the authenticated one forces an immediate renewal; its xid is
        // the server's, not ours
        let forced = reply(
            0xdeadbeef,
            yi,
            &[
                (DHO_MESSAGE_TYPE, vec![DHCP_FORCERENEW]),
                (DHO_SERVER_ID, server().octets().to_vec()),
                (DHO_AUTHENTICATION, server_auth(&mut srv, 3)),
            ],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &forced, server());
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp4State::Renew));
        assert_eq!(sent_type(h.transport.last_payload()), Some(DHCP_REQUEST));
    }
}
