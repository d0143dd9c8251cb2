//! DHCPv6 client engine (RFC 8415).
//!
//! Covers stateful address assignment (IA_NA/IA_TA), prefix delegation
//! (IA_PD) with downstream fan-out, stateless INFORMATION-REQUEST,
//! CONFIRM after restart, RECONFIGURE, rapid commit and the full RFC 8415
//! retransmission algorithm with SOL_MAX_RT/INF_MAX_RT learning. Driven
//! the same way as the DHCPv4 engine: scheduler callbacks and inbound
//! datagrams against per-interface state, all side effects through [`Ctx`].

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::auth::TokenAuth;
use crate::config::{Dhcp6Config, IaKind, IaSpec, PdAssignment};
use crate::error::{NetleaseError, Result};
use crate::ipv6nd::DhcpHint;
use crate::options::{self, Writer6};
use crate::platform::{lease_key, Ctx, Family, IfaceId};
use crate::scheduler::{Proto, TimerKind, TimerToken};

pub const DHCP6_CLIENT_PORT: u16 = 546;
pub const DHCP6_SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers (ff02::1:2).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);

pub const DHCP6_SOLICIT: u8 = 1;
pub const DHCP6_ADVERTISE: u8 = 2;
pub const DHCP6_REQUEST: u8 = 3;
pub const DHCP6_CONFIRM: u8 = 4;
pub const DHCP6_RENEW: u8 = 5;
pub const DHCP6_REBIND: u8 = 6;
pub const DHCP6_REPLY: u8 = 7;
pub const DHCP6_RELEASE: u8 = 8;
pub const DHCP6_DECLINE: u8 = 9;
pub const DHCP6_RECONFIGURE: u8 = 10;
pub const DHCP6_INFORMATION_REQ: u8 = 11;

const D6_OPTION_CLIENTID: u16 = 1;
const D6_OPTION_SERVERID: u16 = 2;
const D6_OPTION_IA_NA: u16 = 3;
const D6_OPTION_IA_TA: u16 = 4;
const D6_OPTION_IA_ADDR: u16 = 5;
const D6_OPTION_ORO: u16 = 6;
const D6_OPTION_PREFERENCE: u16 = 7;
const D6_OPTION_ELAPSED: u16 = 8;
const D6_OPTION_AUTH: u16 = 11;
const D6_OPTION_UNICAST: u16 = 12;
const D6_OPTION_STATUS_CODE: u16 = 13;
const D6_OPTION_RAPID_COMMIT: u16 = 14;
const D6_OPTION_USER_CLASS: u16 = 15;
const D6_OPTION_VENDOR_CLASS: u16 = 16;
const D6_OPTION_RECONF_MSG: u16 = 19;
const D6_OPTION_RECONF_ACCEPT: u16 = 20;
const D6_OPTION_IA_PD: u16 = 25;
const D6_OPTION_IAPREFIX: u16 = 26;
const D6_OPTION_FQDN: u16 = 39;
const D6_OPTION_PD_EXCLUDE: u16 = 67;
const D6_OPTION_SOL_MAX_RT: u16 = 82;
const D6_OPTION_INF_MAX_RT: u16 = 83;
const D6_OPTION_MUDURL: u16 = 112;

const STATUS_SUCCESS: u16 = 0;
const STATUS_UNSPEC_FAIL: u16 = 1;
const STATUS_NO_ADDRS_AVAIL: u16 = 2;
const STATUS_NO_BINDING: u16 = 3;
const STATUS_NOT_ON_LINK: u16 = 4;
const STATUS_USE_MULTICAST: u16 = 5;
const STATUS_NO_PREFIX_AVAIL: u16 = 6;

pub fn status_str(code: u16) -> &'static str {
    match code {
        STATUS_SUCCESS => "Success",
        STATUS_UNSPEC_FAIL => "UnspecFail",
        STATUS_NO_ADDRS_AVAIL => "NoAddrsAvail",
        STATUS_NO_BINDING => "NoBinding",
        STATUS_NOT_ON_LINK => "NotOnLink",
        STATUS_USE_MULTICAST => "UseMulticast",
        STATUS_NO_PREFIX_AVAIL => "NoPrefixAvail",
        _ => "Unknown",
    }
}

/// Lifetime wire value meaning "never expires".
const INFINITE_LIFETIME: u32 = u32::MAX;

/// Learned retransmission ceilings are clamped into this range.
const MAX_RT_MIN: u32 = 60;
const MAX_RT_MAX: u32 = 86_400;
const SOL_MAX_RT_DEFAULT: u32 = 3600;
const INF_MAX_RT_DEFAULT: u32 = 3600;

fn token(ifindex: u32, kind: TimerKind) -> TimerToken {
    TimerToken::new(ifindex, Proto::Dhcp6, kind)
}

fn read_u32(b: &[u8]) -> Option<u32> {
    (b.len() >= 4).then(|| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_addr6(b: &[u8]) -> Option<Ipv6Addr> {
    let arr: [u8; 16] = b.get(..16)?.try_into().ok()?;
    Some(Ipv6Addr::from(arr))
}

/// RFC 8415 retransmission parameters for one message type. Zero means
/// "unbounded" for `mrt`, `mrc` and `mrd`.
#[derive(Debug, Clone, Copy)]
struct RetransProfile {
    irt: f64,
    mrt: f64,
    mrc: u32,
    mrd: f64,
}

/// A parsed DHCPv6 message plus its raw bytes (persisted verbatim).
#[derive(Debug, Clone)]
pub struct Dhcp6Message {
    pub mtype: u8,
    pub xid: [u8; 3],
    pub options: Vec<(u16, Vec<u8>)>,
    pub raw: Vec<u8>,
}

impl Dhcp6Message {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(NetleaseError::Truncated {
                what: "DHCPv6 header",
                need: 4,
                have: data.len(),
            });
        }
        Ok(Self {
            mtype: data[0],
            xid: [data[1], data[2], data[3]],
            options: options::parse_dhcp6_options(&data[4..])?,
            raw: data.to_vec(),
        })
    }

    pub fn find(&self, code: u16) -> Option<&[u8]> {
        options::find6(&self.options, code)
    }

    /// Top-level status code, defaulting to Success when absent.
    pub fn status(&self) -> (u16, String) {
        status_of(&self.options)
    }
}

fn status_of(opts: &[(u16, Vec<u8>)]) -> (u16, String) {
    match options::find6(opts, D6_OPTION_STATUS_CODE) {
        Some(p) if p.len() >= 2 => (
            u16::from_be_bytes([p[0], p[1]]),
            String::from_utf8_lossy(&p[2..]).into_owned(),
        ),
        _ => (STATUS_SUCCESS, String::new()),
    }
}

/// One bound address or delegated prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ia6Addr {
    pub addr: Ipv6Addr,
    /// 128 for IA_NA/IA_TA addresses, the delegated length for IA_PD.
    pub prefix_len: u8,
    pub preferred: u32,
    pub valid: u32,
    /// RFC 6603 excluded sub-prefix, IA_PD only.
    pub exclude: Option<(Ipv6Addr, u8)>,
}

/// One bound Identity Association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ia {
    pub kind: IaKind,
    pub iaid: [u8; 4],
    pub t1: u32,
    pub t2: u32,
    pub addrs: Vec<Ia6Addr>,
}

/// The bound DHCPv6 lease.
#[derive(Debug, Clone, Default)]
pub struct Lease6 {
    pub server_id: Vec<u8>,
    pub server_unicast: Option<Ipv6Addr>,
    pub ias: Vec<Ia>,
    /// Effective renew/rebind timers across all IAs, seconds.
    pub t1: u32,
    pub t2: u32,
    pub from_store: bool,
}

impl Lease6 {
    fn is_empty(&self) -> bool {
        self.server_id.is_empty()
    }

    /// Longest valid lifetime across every binding.
    pub fn max_valid(&self) -> u32 {
        self.ias
            .iter()
            .flat_map(|ia| ia.addrs.iter())
            .map(|a| a.valid)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dhcp6State {
    Init,
    Solicit,
    Request,
    Confirm,
    Renew,
    Rebind,
    Inform,
    Bound,
    /// Bound with at least one delegated prefix fanned out downstream.
    Delegated,
    Release,
    Decline,
}

#[derive(Debug)]
struct IfState6 {
    iface: IfaceId,
    cfg: Dhcp6Config,
    state: Dhcp6State,
    xid: [u8; 3],
    /// Current retransmission timeout in seconds; 0.0 means unseeded.
    rt: f64,
    /// Transmissions of the in-flight message so far.
    tx_count: u32,
    /// Seconds of exchange time consumed, advanced per retransmission.
    elapsed: f64,
    auth: Option<TokenAuth>,
    lease: Lease6,
    new_msg: Option<Dhcp6Message>,
    /// Best ADVERTISE collected during SOLICIT, with its preference.
    advert: Option<(u8, Dhcp6Message)>,
    sol_max_rt: u32,
    inf_max_rt: u32,
    /// Last negative status code logged, to avoid repeating it every
    /// retransmission.
    last_status: Option<u16>,
    /// Downstream interfaces that still lack a link-local address and
    /// therefore have their delegated prefix deferred.
    deferred_pd: Vec<u32>,
    /// What the most recent Router Advertisement asked for on this link.
    ra_hint: Option<DhcpHint>,
}

/// Process-wide DHCPv6 engine; one state machine per started interface.
pub struct Dhcp6Client {
    states: HashMap<u32, IfState6>,
    duid: Vec<u8>,
}

impl Dhcp6Client {
    pub fn new(duid: Vec<u8>) -> Self {
        Self {
            states: HashMap::new(),
            duid,
        }
    }

    pub fn state_of(&self, ifindex: u32) -> Option<Dhcp6State> {
        self.states.get(&ifindex).map(|s| s.state)
    }

    pub fn lease_of(&self, ifindex: u32) -> Option<&Lease6> {
        self.states
            .get(&ifindex)
            .map(|s| &s.lease)
            .filter(|l| !l.is_empty())
    }

    /// Start DHCPv6 on an interface.
    pub fn start(&mut self, ctx: &mut Ctx<'_>, iface: IfaceId, cfg: Dhcp6Config) -> Result<()> {
        if self.states.contains_key(&iface.index) {
            return Err(NetleaseError::AlreadyStarted {
                interface: iface.name,
                proto: "DHCPv6",
            });
        }
        let auth = cfg.auth_token.clone().map(TokenAuth::new);
        let ifindex = iface.index;
        let mut st = IfState6 {
            iface,
            cfg,
            state: Dhcp6State::Init,
            xid: [0; 3],
            rt: 0.0,
            tx_count: 0,
            elapsed: 0.0,
            auth,
            lease: Lease6::default(),
            new_msg: None,
            advert: None,
            sol_max_rt: SOL_MAX_RT_DEFAULT,
            inf_max_rt: INF_MAX_RT_DEFAULT,
            last_status: None,
            deferred_pd: Vec::new(),
            ra_hint: None,
        };

        if !st.cfg.info_only {
            if let Some(stored) = self.load_stored_lease(ctx, &st) {
                match self.extract_lease(&st.cfg, &stored) {
                    Ok(mut lease) => {
                        lease.from_store = true;
                        st.lease = lease;
                        st.new_msg = Some(stored);
                        st.state = Dhcp6State::Confirm;
                    }
                    Err(reason) => {
                        log::warn!(
                            "{}: discarding unusable stored lease: {reason}",
                            st.iface.name
                        );
                        let _ = ctx.store.remove(&lease_key(&st.iface.name, Family::Ipv6));
                    }
                }
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

    fn load_stored_lease(&self, ctx: &mut Ctx<'_>, st: &IfState6) -> Option<Dhcp6Message> {
        let key = lease_key(&st.iface.name, Family::Ipv6);
        let blob = match ctx.store.load(&key) {
            Ok(Some(b)) => b,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("{}: cannot read lease file: {e}", st.iface.name);
                return None;
            }
        };
        let msg = match Dhcp6Message::parse(&blob) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("{}: discarding corrupt lease file: {e}", st.iface.name);
                let _ = ctx.store.remove(&key);
                return None;
            }
        };
        if let Some(auth) = &st.auth {
            let payload = msg.find(D6_OPTION_AUTH).unwrap_or_default();
            if let Err(e) = auth.validate_stored(payload, &st.iface.name) {
                log::warn!("{}: stored lease failed authentication: {e}", st.iface.name);
                let _ = ctx.store.remove(&key);
                return None;
            }
        }
        Some(msg)
    }

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

    fn new_exchange(st: &mut IfState6, state: Dhcp6State) {
        st.state = state;
        st.xid = rand::thread_rng().gen::<[u8; 3]>();
        st.rt = 0.0;
        st.tx_count = 0;
        st.elapsed = 0.0;
        st.advert = None;
        st.last_status = None;
    }

    fn begin(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.cfg.info_only {
            Self::new_exchange(st, Dhcp6State::Inform);
            log::info!("{}: requesting DHCPv6 information", st.iface.name);
            self.transmit(ctx, ifindex);
            return;
        }
        match st.state {
            Dhcp6State::Confirm => {
                Self::new_exchange(st, Dhcp6State::Confirm);
                log::info!("{}: confirming previous DHCPv6 lease", st.iface.name);
            }
            _ => {
                Self::new_exchange(st, Dhcp6State::Solicit);
                log::info!("{}: soliciting a DHCPv6 lease", st.iface.name);
            }
        }
        self.transmit(ctx, ifindex);
    }

    fn profile(st: &IfState6) -> RetransProfile {
        match st.state {
            Dhcp6State::Solicit => RetransProfile {
                irt: 1.0,
                mrt: st.sol_max_rt as f64,
                mrc: 0,
                mrd: 0.0,
            },
            Dhcp6State::Request => RetransProfile {
                irt: 1.0,
                mrt: 30.0,
                mrc: 10,
                mrd: 0.0,
            },
            Dhcp6State::Confirm => RetransProfile {
                irt: 1.0,
                mrt: 4.0,
                mrc: 0,
                mrd: 10.0,
            },
            Dhcp6State::Renew => RetransProfile {
                irt: 10.0,
                mrt: 600.0,
                mrc: 0,
                mrd: 0.0,
            },
            Dhcp6State::Rebind => RetransProfile {
                irt: 10.0,
                mrt: 600.0,
                mrc: 0,
                mrd: 0.0,
            },
            Dhcp6State::Inform => RetransProfile {
                irt: 1.0,
                mrt: st.inf_max_rt as f64,
                mrc: 0,
                mrd: 0.0,
            },
            Dhcp6State::Release | Dhcp6State::Decline => RetransProfile {
                irt: 1.0,
                mrt: 0.0,
                mrc: 4,
                mrd: 0.0,
            },
            _ => RetransProfile {
                irt: 1.0,
                mrt: 120.0,
                mrc: 0,
                mrd: 0.0,
            },
        }
    }

    /// RFC 8415 §15: RT doubling with +/-10% jitter. The very first
    /// transmission uses negative-only jitter so the elapsed-time option of
    /// the second transmission can never be zero.
    fn next_rt(st: &mut IfState6) -> f64 {
        let p = Self::profile(st);
        let mut rng = rand::thread_rng();
        let rt = if st.rt == 0.0 {
            p.irt + p.irt * rng.gen_range(-0.1..0.0)
        } else {
            let rt = 2.0 * st.rt + st.rt * rng.gen_range(-0.1..0.1);
            if p.mrt > 0.0 && rt > p.mrt {
                p.mrt + p.mrt * rng.gen_range(-0.1..0.1)
            } else {
                rt
            }
        };
        st.rt = rt;
        rt
    }

    fn message_for_state(state: Dhcp6State) -> Option<u8> {
        match state {
            Dhcp6State::Solicit => Some(DHCP6_SOLICIT),
            Dhcp6State::Request => Some(DHCP6_REQUEST),
            Dhcp6State::Confirm => Some(DHCP6_CONFIRM),
            Dhcp6State::Renew => Some(DHCP6_RENEW),
            Dhcp6State::Rebind => Some(DHCP6_REBIND),
            Dhcp6State::Inform => Some(DHCP6_INFORMATION_REQ),
            Dhcp6State::Release => Some(DHCP6_RELEASE),
            Dhcp6State::Decline => Some(DHCP6_DECLINE),
            _ => None,
        }
    }

    fn encode_ia(spec: &IaSpec, binding: Option<&Ia>) -> Result<(u16, Vec<u8>)> {
        let mut inner = Writer6::with_capacity(64);
        if let Some(ia) = binding {
            for a in &ia.addrs {
                match ia.kind {
                    IaKind::Pd => {
                        let mut p = Vec::with_capacity(25);
                        // client is never authoritative for lifetimes
                        p.extend_from_slice(&[0u8; 8]);
                        p.push(a.prefix_len);
                        p.extend_from_slice(&a.addr.octets());
                        inner.put(D6_OPTION_IAPREFIX, &p)?;
                    }
                    _ => {
                        let mut p = Vec::with_capacity(24);
                        p.extend_from_slice(&a.addr.octets());
                        p.extend_from_slice(&[0u8; 8]);
                        inner.put(D6_OPTION_IA_ADDR, &p)?;
                    }
                }
            }
        }
        let nested = inner.finish();
        let (code, mut payload) = match spec.kind {
            IaKind::Na => (D6_OPTION_IA_NA, Vec::with_capacity(12 + nested.len())),
            IaKind::Ta => (D6_OPTION_IA_TA, Vec::with_capacity(4 + nested.len())),
            IaKind::Pd => (D6_OPTION_IA_PD, Vec::with_capacity(12 + nested.len())),
        };
        payload.extend_from_slice(&spec.iaid);
        if spec.kind != IaKind::Ta {
            payload.extend_from_slice(&[0u8; 8]); // T1/T2 are the server's call
        }
        payload.extend_from_slice(&nested);
        Ok((code, payload))
    }

    fn build_message(duid: &[u8], st: &mut IfState6, mtype: u8) -> Result<Vec<u8>> {
        let mut opts: Vec<(u16, Vec<u8>)> = Vec::new();

        opts.push((D6_OPTION_CLIENTID, duid.to_vec()));

        // server-id goes everywhere the exchange is directed at one server
        if matches!(
            mtype,
            DHCP6_REQUEST | DHCP6_RENEW | DHCP6_RELEASE | DHCP6_DECLINE
        ) && !st.lease.server_id.is_empty()
        {
            opts.push((D6_OPTION_SERVERID, st.lease.server_id.clone()));
        }

        if !st.cfg.info_only && mtype != DHCP6_INFORMATION_REQ {
            for spec in &st.cfg.ias {
                let binding = st
                    .lease
                    .ias
                    .iter()
                    .find(|ia| ia.kind == spec.kind && ia.iaid == spec.iaid);
                // SOLICIT sends empty IAs unless we have an address hint
                let include = if mtype == DHCP6_SOLICIT {
                    binding.filter(|ia| !ia.addrs.is_empty())
                } else {
                    binding
                };
                opts.push(Self::encode_ia(spec, include)?);
            }
        }

        if !matches!(mtype, DHCP6_RELEASE | DHCP6_DECLINE) {
            let mut oro = Vec::with_capacity(st.cfg.request.len() * 2);
            for code in &st.cfg.request {
                oro.extend_from_slice(&code.to_be_bytes());
            }
            if !oro.is_empty() {
                opts.push((D6_OPTION_ORO, oro));
            }
            if let Some(uc) = &st.cfg.user_class {
                opts.push((D6_OPTION_USER_CLASS, uc.clone()));
            }
            if let Some(vc) = &st.cfg.vendor_class {
                opts.push((D6_OPTION_VENDOR_CLASS, vc.clone()));
            }
            if st.cfg.reconfigure_accept {
                opts.push((D6_OPTION_RECONF_ACCEPT, Vec::new()));
            }
            // FQDN only travels in messages that can create or refresh a binding
            if matches!(
                mtype,
                DHCP6_SOLICIT | DHCP6_REQUEST | DHCP6_RENEW | DHCP6_REBIND
            ) {
                if let Some(fqdn) = &st.cfg.fqdn {
                    let mut p = vec![0x01]; // S bit: server updates AAAA
                    p.extend_from_slice(&options::encode_domain_name(fqdn)?);
                    opts.push((D6_OPTION_FQDN, p));
                }
            }
            if let Some(url) = &st.cfg.mud_url {
                opts.push((D6_OPTION_MUDURL, url.as_bytes().to_vec()));
            }
        }

        if mtype == DHCP6_SOLICIT && st.cfg.rapid_commit && !st.cfg.test_mode {
            opts.push((D6_OPTION_RAPID_COMMIT, Vec::new()));
        }

        // elapsed time in hundredths of a second, saturating
        let elapsed = (st.elapsed * 100.0).min(u16::MAX as f64) as u16;
        opts.push((D6_OPTION_ELAPSED, elapsed.to_be_bytes().to_vec()));

        // authentication is strictly the last option, filled at send time
        if let Some(auth) = &mut st.auth {
            let mut payload = vec![0u8; auth.payload_len()];
            let now_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            auth.fill(&mut payload, now_secs)?;
            opts.push((D6_OPTION_AUTH, payload));
        }

        opts.sort_by_key(|(code, _)| *code);

        let size: usize = 4 + opts.iter().map(|(_, p)| Writer6::sizeof(p.len())).sum::<usize>();
        let mut out = Vec::with_capacity(size);
        out.push(mtype);
        out.extend_from_slice(&st.xid);
        let mut w = Writer6::with_capacity(size - 4);
        for (code, payload) in &opts {
            w.put(*code, payload)?;
        }
        out.extend_from_slice(&w.finish());
        Ok(out)
    }

    /// Transmit the message for the current state and arm the next
    /// retransmission, honoring MRC/MRD from the RFC 8415 profile.
    /// RELEASE is fire-and-forget and never retransmits.
    fn transmit(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let duid = &self.duid;
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let Some(mtype) = Self::message_for_state(st.state) else { return };
        let p = Self::profile(st);
        if (p.mrc > 0 && st.tx_count >= p.mrc) || (p.mrd > 0.0 && st.elapsed >= p.mrd) {
            self.transmission_failed(ctx, ifindex);
            return;
        }
        let packet = match Self::build_message(duid, st, mtype) {
            Ok(pk) => Some(pk),
            Err(e) => {
                log::error!("{}: cannot build DHCPv6 message: {e}", st.iface.name);
                None
            }
        };
        st.tx_count += 1;
        let rt = Self::next_rt(st);
        st.elapsed += rt;
        // unicast only when the server allowed it and we renew
        let dst = match st.state {
            Dhcp6State::Renew => st.lease.server_unicast,
            _ => None,
        }
        .unwrap_or(ALL_DHCP_RELAY_AGENTS_AND_SERVERS);
        let one_shot = st.state == Dhcp6State::Release;
        let name = st.iface.name.clone();
        if let Some(packet) = packet {
            if let Err(e) = ctx.transport.send_udp6(ifindex, dst, &packet) {
                log::warn!("{name}: DHCPv6 send failed: {e}");
            }
        }
        if !one_shot {
            ctx.scheduler
                .schedule_once(Duration::from_secs_f64(rt), token(ifindex, TimerKind::Retransmit));
        }
    }

    fn retransmit(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        // a collected ADVERTISE is accepted once the first RT elapses
        let promote = {
            let Some(st) = self.states.get(&ifindex) else { return };
            st.state == Dhcp6State::Solicit && st.advert.is_some()
        };
        if promote {
            self.request_collected_advert(ctx, ifindex);
            return;
        }
        self.transmit(ctx, ifindex);
    }

    fn request_collected_advert(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let Some((_, msg)) = st.advert.take() else { return };
        match self.accept_offer(ifindex, msg) {
            Ok(()) => {
                let Some(st) = self.states.get_mut(&ifindex) else { return };
                st.state = Dhcp6State::Request;
                st.rt = 0.0;
                st.tx_count = 0;
                log::info!("{}: requesting advertised lease", st.iface.name);
                self.transmit(ctx, ifindex);
            }
            Err(reason) => {
                log::warn!("if{ifindex}: discarding advertise: {reason}");
                self.transmit(ctx, ifindex);
            }
        }
    }

    /// Take server-id and bindings from an ADVERTISE so the REQUEST can
    /// echo them.
    fn accept_offer(&mut self, ifindex: u32, msg: Dhcp6Message) -> std::result::Result<(), String> {
        let (cfg, server_id) = {
            let st = self.states.get(&ifindex).ok_or("no state")?;
            let sid = msg
                .find(D6_OPTION_SERVERID)
                .ok_or("advertise without server-id")?
                .to_vec();
            (st.cfg.clone(), sid)
        };
        let lease = self.extract_lease_inner(&cfg, &msg)?;
        let Some(st) = self.states.get_mut(&ifindex) else {
            return Err("no state".to_string());
        };
        st.lease = Lease6 {
            server_id,
            ..lease
        };
        Ok(())
    }

    fn extract_lease(&self, cfg: &Dhcp6Config, msg: &Dhcp6Message) -> std::result::Result<Lease6, String> {
        self.extract_lease_inner(cfg, msg)
    }

    /// Walk the configured IAs through the message, enforcing lifetime
    /// sanity. A preferred lifetime longer than the valid lifetime rejects
    /// the whole message.
    fn extract_lease_inner(
        &self,
        cfg: &Dhcp6Config,
        msg: &Dhcp6Message,
    ) -> std::result::Result<Lease6, String> {
        let (code, text) = msg.status();
        if code != STATUS_SUCCESS {
            return Err(format!("status {} ({text})", status_str(code)));
        }
        let mut ias = Vec::new();
        for spec in &cfg.ias {
            let container_code = match spec.kind {
                IaKind::Na => D6_OPTION_IA_NA,
                IaKind::Ta => D6_OPTION_IA_TA,
                IaKind::Pd => D6_OPTION_IA_PD,
            };
            let found = msg.options.iter().find_map(|(c, payload)| {
                (*c == container_code && payload.get(..4) == Some(&spec.iaid[..]))
                    .then_some(payload.as_slice())
            });
            let Some(payload) = found else { continue };
            let ia = parse_ia(spec.kind, spec.iaid, payload)?;
            ias.push(ia);
        }
        let server_id = msg.find(D6_OPTION_SERVERID).unwrap_or_default().to_vec();
        let server_unicast = msg.find(D6_OPTION_UNICAST).and_then(read_addr6);
        let mut lease = Lease6 {
            server_id,
            server_unicast,
            ias,
            t1: 0,
            t2: 0,
            from_store: false,
        };
        compute_timers(&mut lease);
        Ok(lease)
    }

    /// Inbound datagram entry point.
    pub fn handle_datagram(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, data: &[u8]) {
        let msg = match Dhcp6Message::parse(data) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("if{ifindex}: dropping malformed DHCPv6 datagram: {e}");
                return;
            }
        };
        if msg.mtype == DHCP6_RECONFIGURE {
            self.handle_reconfigure(ctx, ifindex, msg);
            return;
        }
        if !matches!(msg.mtype, DHCP6_ADVERTISE | DHCP6_REPLY) {
            return;
        }
        {
            let Some(st) = self.states.get(&ifindex) else { return };
            if msg.xid != st.xid {
                // a reply can land on the wrong interface when several
                // share a link; route it to the sibling that asked
                let sibling = self
                    .states
                    .iter()
                    .find(|(i, s)| **i != ifindex && s.xid == msg.xid)
                    .map(|(i, _)| *i);
                if let Some(target) = sibling {
                    log::debug!(
                        "{}: redirecting reply with xid {:02x?} to if{target}",
                        st.iface.name,
                        msg.xid
                    );
                    self.handle_datagram(ctx, target, &msg.raw);
                    return;
                }
                log::debug!(
                    "{}: wrong xid {:02x?} (expecting {:02x?})",
                    st.iface.name,
                    msg.xid,
                    st.xid
                );
                return;
            }
            match msg.find(D6_OPTION_CLIENTID) {
                Some(cid) if cid == self.duid.as_slice() => {}
                _ => {
                    log::debug!("{}: reply not for our client id", st.iface.name);
                    return;
                }
            }
            if msg.find(D6_OPTION_SERVERID).is_none() {
                log::debug!("{}: reply without server id", st.iface.name);
                return;
            }
        }
        if !self.authenticate(&msg, ifindex) {
            return;
        }
        self.learn_max_rt(ifindex, &msg);
        match msg.mtype {
            DHCP6_ADVERTISE => self.handle_advertise(ctx, ifindex, msg),
            DHCP6_REPLY => self.handle_reply(ctx, ifindex, msg),
            _ => {}
        }
    }

    fn authenticate(&mut self, msg: &Dhcp6Message, ifindex: u32) -> bool {
        let Some(st) = self.states.get_mut(&ifindex) else { return false };
        let Some(auth) = &mut st.auth else { return true };
        match msg.find(D6_OPTION_AUTH) {
            Some(payload) => match auth.validate(payload, &st.iface.name) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("{e}");
                    false
                }
            },
            None if st.cfg.auth_required => {
                log::warn!(
                    "{}: dropping unauthenticated DHCPv6 reply (authentication required)",
                    st.iface.name
                );
                false
            }
            None => {
                log::debug!("{}: accepting unauthenticated DHCPv6 reply", st.iface.name);
                true
            }
        }
    }

    fn learn_max_rt(&mut self, ifindex: u32, msg: &Dhcp6Message) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if let Some(v) = msg.find(D6_OPTION_SOL_MAX_RT).and_then(read_u32) {
            if (MAX_RT_MIN..=MAX_RT_MAX).contains(&v) {
                st.sol_max_rt = v;
            }
        }
        if let Some(v) = msg.find(D6_OPTION_INF_MAX_RT).and_then(read_u32) {
            if (MAX_RT_MIN..=MAX_RT_MAX).contains(&v) {
                st.inf_max_rt = v;
            }
        }
    }

    fn handle_advertise(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: Dhcp6Message) {
        let in_solicit = self
            .states
            .get(&ifindex)
            .map(|st| st.state == Dhcp6State::Solicit)
            .unwrap_or(false);
        if !in_solicit {
            return;
        }
        let (code, text) = msg.status();
        if matches!(code, STATUS_NO_ADDRS_AVAIL | STATUS_NO_PREFIX_AVAIL) {
            // servers repeat this every retransmission; log it once
            let Some(st) = self.states.get_mut(&ifindex) else { return };
            if st.last_status != Some(code) {
                log::info!(
                    "{}: server has no leases available ({text})",
                    st.iface.name
                );
                st.last_status = Some(code);
            }
            return;
        }
        let preference = msg
            .find(D6_OPTION_PREFERENCE)
            .and_then(|p| p.first().copied())
            .unwrap_or(0);
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let better = match &st.advert {
            Some((best, _)) => preference > *best,
            None => true,
        };
        if better {
            st.advert = Some((preference, msg));
        }
        // maximum preference short-circuits the collection window
        if preference == 255 {
            self.request_collected_advert(ctx, ifindex);
        }
    }

    fn handle_reply(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: Dhcp6Message) {
        let (state, rapid, name) = match self.states.get(&ifindex) {
            Some(st) => (st.state, st.cfg.rapid_commit, st.iface.name.clone()),
            None => return,
        };
        let (code, text) = msg.status();
        match state {
            Dhcp6State::Solicit => {
                // only a rapid-commit REPLY is acceptable here
                if rapid && msg.find(D6_OPTION_RAPID_COMMIT).is_some() {
                    self.try_bind(ctx, ifindex, msg, "BOUND");
                }
            }
            Dhcp6State::Request => match code {
                STATUS_NOT_ON_LINK => {
                    log::warn!("{name}: lease not on link, resoliciting");
                    self.restart_solicit(ctx, ifindex);
                }
                STATUS_NO_ADDRS_AVAIL | STATUS_NO_PREFIX_AVAIL => {
                    log::warn!(
                        "{name}: server withdrew the lease ({}): resoliciting",
                        status_str(code)
                    );
                    self.restart_solicit(ctx, ifindex);
                }
                _ => self.try_bind(ctx, ifindex, msg, "BOUND"),
            },
            Dhcp6State::Renew | Dhcp6State::Rebind => {
                if code == STATUS_NO_BINDING {
                    // the server lost us; a fresh REQUEST re-establishes the
                    // binding without restarting from SOLICIT
                    log::warn!("{name}: server reports NoBinding, re-requesting");
                    let Some(st) = self.states.get_mut(&ifindex) else { return };
                    st.state = Dhcp6State::Request;
                    st.rt = 0.0;
                    st.tx_count = 0;
                    self.transmit(ctx, ifindex);
                } else {
                    let reason = if state == Dhcp6State::Renew { "RENEW" } else { "REBIND" };
                    self.try_bind(ctx, ifindex, msg, reason);
                }
            }
            Dhcp6State::Confirm => match code {
                STATUS_NOT_ON_LINK => {
                    log::warn!("{name}: moved to a new link, resoliciting");
                    let _ = ctx.store.remove(&lease_key(&name, Family::Ipv6));
                    self.restart_solicit(ctx, ifindex);
                }
                STATUS_SUCCESS => {
                    // CONFIRM replies carry no IAs; the previous lease stands
                    self.bind_stored(ctx, ifindex, "REBOOT");
                }
                _ => {
                    log::warn!("{name}: confirm failed: {} ({text})", status_str(code));
                }
            },
            Dhcp6State::Inform => {
                self.try_bind(ctx, ifindex, msg, "INFORM");
            }
            Dhcp6State::Decline => {
                // declined addresses are gone; start over for replacements
                ctx.scheduler.cancel(token(ifindex, TimerKind::Retransmit));
                log::info!("{name}: server acknowledged decline, resoliciting");
                self.restart_solicit(ctx, ifindex);
            }
            _ => {}
        }
    }

    /// Record what the most recent Router Advertisement said about DHCPv6
    /// on this link; consulted when a lost lease has to be re-acquired.
    /// Usually wired to [`crate::ipv6nd::NdEngine::set_dhcp_handoff`].
    pub fn set_mode_hint(&mut self, ifindex: u32, hint: DhcpHint) {
        if let Some(st) = self.states.get_mut(&ifindex) {
            st.ra_hint = Some(hint);
        }
    }

    /// Re-acquire after losing the lease, in the mode the last Router
    /// Advertisement asked for.
    fn restart_after_failure(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let hint = self.states.get(&ifindex).and_then(|st| st.ra_hint);
        if hint == Some(DhcpHint::InfoOnly) {
            let Some(st) = self.states.get_mut(&ifindex) else { return };
            log::info!(
                "{}: routers ask for stateless DHCPv6, sending an information request",
                st.iface.name
            );
            Self::new_exchange(st, Dhcp6State::Inform);
            self.transmit(ctx, ifindex);
        } else {
            self.restart_solicit(ctx, ifindex);
        }
    }

    fn restart_solicit(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        for kind in [TimerKind::Renew, TimerKind::Rebind, TimerKind::Expire] {
            ctx.scheduler.cancel(token(ifindex, kind));
        }
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        st.lease = Lease6::default();
        Self::new_exchange(st, Dhcp6State::Solicit);
        self.transmit(ctx, ifindex);
    }

    fn try_bind(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: Dhcp6Message, reason: &str) {
        let cfg = match self.states.get(&ifindex) {
            Some(st) => st.cfg.clone(),
            None => return,
        };
        let inform = reason == "INFORM";
        let lease = if inform {
            Lease6 {
                server_id: msg.find(D6_OPTION_SERVERID).unwrap_or_default().to_vec(),
                ..Lease6::default()
            }
        } else {
            match self.extract_lease(&cfg, &msg) {
                Ok(l) if !l.ias.is_empty() => l,
                Ok(_) => {
                    log::warn!("if{ifindex}: reply carried none of our IAs, ignoring");
                    return;
                }
                Err(reason) => {
                    log::warn!("if{ifindex}: rejecting reply: {reason}");
                    return;
                }
            }
        };
        self.bind(ctx, ifindex, msg, lease, reason);
    }

    fn bind_stored(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, reason: &str) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let Some(msg) = st.new_msg.clone() else { return };
        let mut lease = st.lease.clone();
        lease.from_store = true;
        self.bind(ctx, ifindex, msg, lease, reason);
    }

    fn bind(
        &mut self,
        ctx: &mut Ctx<'_>,
        ifindex: u32,
        msg: Dhcp6Message,
        lease: Lease6,
        reason: &str,
    ) {
        ctx.scheduler.cancel(token(ifindex, TimerKind::Retransmit));
        ctx.scheduler.cancel(token(ifindex, TimerKind::Start));
        let Some(st) = self.states.get_mut(&ifindex) else { return };

        let inform = reason == "INFORM";
        let from_store = lease.from_store;
        // addresses held under the previous binding, to spot withdrawals
        let old_addrs: Vec<Ipv6Addr> = st
            .lease
            .ias
            .iter()
            .filter(|ia| ia.kind != IaKind::Pd)
            .flat_map(|ia| ia.addrs.iter().map(|a| a.addr))
            .collect();
        st.new_msg = Some(msg);
        st.lease = lease;

        let has_pd = st.lease.ias.iter().any(|ia| ia.kind == IaKind::Pd);
        st.state = if has_pd {
            Dhcp6State::Delegated
        } else {
            Dhcp6State::Bound
        };

        if !inform {
            log::info!(
                "{}: DHCPv6 lease bound, T1 {}s T2 {}s ({reason})",
                st.iface.name,
                st.lease.t1,
                st.lease.t2
            );
        }

        if !from_store && !inform && !st.cfg.test_mode {
            let key = lease_key(&st.iface.name, Family::Ipv6);
            if let Some(raw) = st.new_msg.as_ref().map(|m| m.raw.clone()) {
                if let Err(e) = ctx.store.save(&key, &raw) {
                    log::warn!("{}: cannot persist lease: {e}", st.iface.name);
                }
            }
        }

        // apply addresses; a zero valid lifetime removes the address
        if !st.cfg.test_mode && !inform {
            let name = st.iface.name.clone();
            for ia in &st.lease.ias {
                if ia.kind == IaKind::Pd {
                    continue;
                }
                for a in &ia.addrs {
                    if a.valid == 0 {
                        let _ = ctx.netcfg.del_address6(ifindex, a.addr);
                        continue;
                    }
                    if let Err(e) =
                        ctx.netcfg.add_address6(ifindex, a.addr, 128, a.preferred, a.valid)
                    {
                        log::error!("{name}: failed to apply address {}: {e}", a.addr);
                    }
                }
            }
            // a previously bound address the reply no longer carries is
            // stale and comes off the interface
            for addr in &old_addrs {
                let kept = st
                    .lease
                    .ias
                    .iter()
                    .filter(|ia| ia.kind != IaKind::Pd)
                    .flat_map(|ia| ia.addrs.iter())
                    .any(|a| a.addr == *addr && a.valid != 0);
                if !kept {
                    log::info!("{name}: address {addr} withdrawn by the server");
                    let _ = ctx.netcfg.del_address6(ifindex, *addr);
                }
            }
        }

        let t1 = st.lease.t1;
        let t2 = st.lease.t2;
        let valid = st.lease.max_valid();
        if !inform && t1 != INFINITE_LIFETIME && !st.lease.ias.is_empty() {
            if t1 == 0 {
                // every binding already lapsed; renew immediately
                ctx.scheduler
                    .schedule_once(Duration::ZERO, token(ifindex, TimerKind::Renew));
            } else {
                ctx.scheduler
                    .schedule_once(Duration::from_secs(t1 as u64), token(ifindex, TimerKind::Renew));
                ctx.scheduler
                    .schedule_once(Duration::from_secs(t2 as u64), token(ifindex, TimerKind::Rebind));
                if valid != INFINITE_LIFETIME {
                    ctx.scheduler
                        .schedule_once(Duration::from_secs(valid as u64), token(ifindex, TimerKind::Expire));
                }
            }
        }

        let name = st.iface.name.clone();
        ctx.hooks.run(&name, Family::Ipv6, reason, &[]);
        self.fan_out_prefixes(ctx, ifindex);
    }

    /// Carve each delegated prefix into per-downstream-interface prefixes.
    fn fan_out_prefixes(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        st.deferred_pd.clear();
        let mut applied: Vec<(u32, Ipv6Addr, u8, u32, u32)> = Vec::new();
        let mut deferred: Vec<u32> = Vec::new();
        for spec in &st.cfg.ias {
            if spec.kind != IaKind::Pd {
                continue;
            }
            let Some(ia) = st
                .lease
                .ias
                .iter()
                .find(|ia| ia.kind == IaKind::Pd && ia.iaid == spec.iaid)
            else {
                continue;
            };
            for prefix in &ia.addrs {
                if prefix.valid == 0 {
                    continue;
                }
                for assign in &spec.assignments {
                    // downstream needs a link-local address first
                    if ctx.netcfg.link_local6(assign.ifindex).is_none() {
                        log::info!(
                            "{}: deferring prefix for if{} until it has a link-local address",
                            st.iface.name,
                            assign.ifindex
                        );
                        deferred.push(assign.ifindex);
                        continue;
                    }
                    match derive_prefix(prefix, assign) {
                        Ok((sub, sub_len)) => {
                            applied.push((
                                assign.ifindex,
                                sub,
                                sub_len,
                                prefix.preferred,
                                prefix.valid,
                            ));
                        }
                        Err(reason) => {
                            log::warn!(
                                "{}: cannot derive prefix for if{}: {reason}",
                                st.iface.name,
                                assign.ifindex
                            );
                        }
                    }
                }
            }
        }
        st.deferred_pd = deferred;
        let name = st.iface.name.clone();
        for (dst_if, sub, sub_len, preferred, valid) in applied {
            if let Err(e) = ctx.netcfg.add_address6(dst_if, sub, sub_len, preferred, valid) {
                log::error!("{name}: failed to apply delegated prefix to if{dst_if}: {e}");
                continue;
            }
            ctx.hooks.run(&name, Family::Ipv6, "DELEGATED", &[]);
        }
    }

    /// A downstream interface gained its link-local address; retry any
    /// deferred prefix assignment.
    pub fn link_local_ready(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, downstream: u32) {
        let pending = self
            .states
            .get(&ifindex)
            .map(|st| st.deferred_pd.contains(&downstream))
            .unwrap_or(false);
        if pending {
            self.fan_out_prefixes(ctx, ifindex);
        }
    }

    fn handle_reconfigure(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, msg: Dhcp6Message) {
        let accept = {
            let Some(st) = self.states.get(&ifindex) else { return };
            if !st.cfg.reconfigure_accept {
                return;
            }
            match msg.find(D6_OPTION_CLIENTID) {
                Some(cid) if cid == self.duid.as_slice() => {}
                _ => return,
            }
            if msg.find(D6_OPTION_SERVERID) != Some(st.lease.server_id.as_slice()) {
                log::debug!("{}: reconfigure from unknown server", st.iface.name);
                return;
            }
            true
        };
        if !accept {
            return;
        }
        // RECONFIGURE must always be authenticated, unlike replies
        if !self.authenticate(&msg, ifindex) {
            return;
        }
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.auth.is_none() || msg.find(D6_OPTION_AUTH).is_none() {
            log::warn!("{}: ignoring unauthenticated RECONFIGURE", st.iface.name);
            return;
        }
        let reconf = msg
            .find(D6_OPTION_RECONF_MSG)
            .and_then(|p| p.first().copied());
        match reconf {
            Some(DHCP6_RENEW) => {
                log::info!("{}: server asked us to renew", st.iface.name);
                self.renew(ctx, ifindex);
            }
            Some(DHCP6_INFORMATION_REQ) => {
                log::info!("{}: server asked for an information refresh", st.iface.name);
                Self::new_exchange(st, Dhcp6State::Inform);
                self.transmit(ctx, ifindex);
            }
            other => {
                log::debug!(
                    "{}: unsupported reconfigure message type {other:?}",
                    st.iface.name
                );
            }
        }
    }

    pub fn renew(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() {
            return;
        }
        log::info!("{}: renewing DHCPv6 lease", st.iface.name);
        Self::new_exchange(st, Dhcp6State::Renew);
        self.transmit(ctx, ifindex);
    }

    pub fn rebind(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() {
            return;
        }
        log::warn!("{}: failed to renew, rebinding DHCPv6 lease", st.iface.name);
        Self::new_exchange(st, Dhcp6State::Rebind);
        self.transmit(ctx, ifindex);
    }

    fn expire(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.cfg.extend_lease_on_failure {
            log::warn!(
                "{}: DHCPv6 lease expired, extending as configured",
                st.iface.name
            );
            for ia in &mut st.lease.ias {
                for a in &mut ia.addrs {
                    a.preferred = INFINITE_LIFETIME;
                    a.valid = INFINITE_LIFETIME;
                }
            }
            return;
        }
        log::warn!("{}: DHCPv6 lease expired", st.iface.name);
        let key = lease_key(&st.iface.name, Family::Ipv6);
        let _ = ctx.store.remove(&key);
        self.drop_lease(ctx, ifindex, "EXPIRE");
        self.restart_after_failure(ctx, ifindex);
    }

    fn transmission_failed(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get(&ifindex) else { return };
        match st.state {
            Dhcp6State::Request => {
                log::warn!(
                    "{}: no reply to REQUEST, restarting solicitation",
                    st.iface.name
                );
                self.restart_solicit(ctx, ifindex);
            }
            Dhcp6State::Confirm => {
                // no answer: the previous lease is presumed still valid
                log::info!(
                    "{}: no confirm reply, keeping previous lease",
                    st.iface.name
                );
                self.bind_stored(ctx, ifindex, "TIMEOUT");
            }
            Dhcp6State::Decline => {
                log::warn!("{}: decline went unanswered, resoliciting", st.iface.name);
                self.restart_solicit(ctx, ifindex);
            }
            _ => {}
        }
    }

    /// The DAD collaborator reports addresses that failed duplicate
    /// detection. They are removed and DECLINEd to the server.
    pub fn decline_duplicates(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, dups: &[Ipv6Addr]) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if dups.is_empty() || st.lease.is_empty() {
            return;
        }
        let mut any = false;
        for ia in &mut st.lease.ias {
            let before = ia.addrs.len();
            ia.addrs.retain(|a| !dups.contains(&a.addr));
            any |= ia.addrs.len() != before;
        }
        if !any {
            return;
        }
        for addr in dups {
            log::warn!("{}: address {addr} failed duplicate detection", st.iface.name);
            let _ = ctx.netcfg.del_address6(ifindex, *addr);
        }
        // the DECLINE carries only the duplicated addresses; once it is
        // acknowledged (or retries run out) we resolicit a fresh lease
        let declined: Vec<Ia6Addr> = dups
            .iter()
            .map(|a| Ia6Addr {
                addr: *a,
                prefix_len: 128,
                preferred: 0,
                valid: 0,
                exclude: None,
            })
            .collect();
        for ia in &mut st.lease.ias {
            if ia.kind != IaKind::Pd {
                ia.addrs = declined.clone();
                ia.t1 = 0;
                ia.t2 = 0;
            }
        }
        Self::new_exchange(st, Dhcp6State::Decline);
        self.transmit(ctx, ifindex);
    }

    /// Send RELEASE for the held lease and tear down.
    pub fn release(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let has_lease = self
            .states
            .get(&ifindex)
            .map(|st| !st.lease.is_empty() && !st.lease.from_store)
            .unwrap_or(false);
        if has_lease {
            let Some(st) = self.states.get_mut(&ifindex) else { return };
            if st.state == Dhcp6State::Release {
                return;
            }
            Self::new_exchange(st, Dhcp6State::Release);
            self.transmit(ctx, ifindex);
            let key = self
                .states
                .get(&ifindex)
                .map(|st| lease_key(&st.iface.name, Family::Ipv6));
            if let Some(key) = key {
                let _ = ctx.store.remove(&key);
            }
        }
        self.drop_lease(ctx, ifindex, "RELEASE");
    }

    /// Idempotent teardown: cancels timers and removes applied addresses.
    /// An in-flight DECLINE exchange keeps its retransmission timer.
    pub fn drop_lease(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, reason: &str) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.lease.is_empty() && st.state == Dhcp6State::Init {
            return;
        }
        for kind in [
            TimerKind::Start,
            TimerKind::Renew,
            TimerKind::Rebind,
            TimerKind::Expire,
        ] {
            ctx.scheduler.cancel(token(ifindex, kind));
        }
        if st.state != Dhcp6State::Decline {
            ctx.scheduler.cancel(token(ifindex, TimerKind::Retransmit));
        }
        let name = st.iface.name.clone();
        for ia in &st.lease.ias {
            if ia.kind == IaKind::Pd {
                continue;
            }
            for a in &ia.addrs {
                let _ = ctx.netcfg.del_address6(ifindex, a.addr);
            }
        }
        st.lease = Lease6::default();
        st.advert = None;
        if st.state != Dhcp6State::Decline {
            st.state = Dhcp6State::Init;
        }
        log::info!("{name}: DHCPv6 lease dropped ({reason})");
        ctx.hooks.run(&name, Family::Ipv6, reason, &[]);
    }

    /// Full teardown and removal of the per-interface state.
    pub fn free(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        self.drop_lease(ctx, ifindex, "STOP");
        self.states.remove(&ifindex);
    }

    /// Print the persisted lease for an interface.
    pub fn dump(&self, ctx: &mut Ctx<'_>, iface_name: &str, cfg: &Dhcp6Config) -> Result<Vec<(String, String)>> {
        let key = lease_key(iface_name, Family::Ipv6);
        let blob = ctx
            .store
            .load(&key)
            .map_err(|e| NetleaseError::store_error("load", &key, e))?
            .ok_or_else(|| NetleaseError::Store {
                operation: "load".to_string(),
                key: key.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no lease"),
            })?;
        let msg = Dhcp6Message::parse(&blob)?;
        let lease = self
            .extract_lease(cfg, &msg)
            .map_err(NetleaseError::InvalidConfig)?;
        let mut env = Vec::new();
        for (i, ia) in lease.ias.iter().enumerate() {
            for (j, a) in ia.addrs.iter().enumerate() {
                env.push((
                    format!("new_dhcp6_address_{i}_{j}"),
                    format!("{}/{}", a.addr, a.prefix_len),
                ));
                env.push((format!("new_dhcp6_valid_{i}_{j}"), a.valid.to_string()));
            }
        }
        for (k, v) in &env {
            log::info!("{k}={v}");
        }
        Ok(env)
    }
}

/// Effective T1/T2 for a lease: the smallest non-zero server values, with
/// 0.5/0.8 of the shortest preferred lifetime as the fallback.
fn compute_timers(lease: &mut Lease6) {
    let mut t1 = u32::MAX;
    let mut t2 = u32::MAX;
    let mut min_pref = u32::MAX;
    for ia in &lease.ias {
        if ia.t1 != 0 {
            t1 = t1.min(ia.t1);
        }
        if ia.t2 != 0 {
            t2 = t2.min(ia.t2);
        }
        for a in &ia.addrs {
            if a.preferred != 0 {
                min_pref = min_pref.min(a.preferred);
            }
        }
    }
    if min_pref == u32::MAX {
        min_pref = 0;
    }
    if t1 == u32::MAX {
        t1 = if min_pref == INFINITE_LIFETIME {
            INFINITE_LIFETIME
        } else {
            min_pref / 2
        };
    }
    if t2 == u32::MAX {
        t2 = if min_pref == INFINITE_LIFETIME {
            INFINITE_LIFETIME
        } else {
            (min_pref as u64 * 4 / 5) as u32
        };
    }
    if t2 < t1 && t2 != 0 {
        t1 = t2;
    }
    lease.t1 = t1;
    lease.t2 = t2;
}

fn parse_ia(kind: IaKind, iaid: [u8; 4], payload: &[u8]) -> std::result::Result<Ia, String> {
    let header = if kind == IaKind::Ta { 4 } else { 12 };
    if payload.len() < header {
        return Err(format!("IA container too short ({} bytes)", payload.len()));
    }
    let (t1, t2) = if kind == IaKind::Ta {
        (0, 0)
    } else {
        (
            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
        )
    };
    let nested = options::parse_dhcp6_options(&payload[header..])
        .map_err(|e| format!("bad IA options: {e}"))?;
    let (code, _) = status_of(&nested);
    if code != STATUS_SUCCESS {
        return Err(format!("IA status {}", status_str(code)));
    }
    let mut addrs = Vec::new();
    for (c, p) in &nested {
        match (*c, kind) {
            (D6_OPTION_IA_ADDR, IaKind::Na) | (D6_OPTION_IA_ADDR, IaKind::Ta) => {
                if p.len() < 24 {
                    return Err("IA address option too short".to_string());
                }
                let addr = read_addr6(p).unwrap_or(Ipv6Addr::UNSPECIFIED);
                let preferred = u32::from_be_bytes([p[16], p[17], p[18], p[19]]);
                let valid = u32::from_be_bytes([p[20], p[21], p[22], p[23]]);
                if preferred > valid {
                    return Err(format!(
                        "address {addr} preferred lifetime {preferred} exceeds valid {valid}"
                    ));
                }
                let inner = options::parse_dhcp6_options(&p[24..])
                    .map_err(|e| format!("bad IA address options: {e}"))?;
                let (code, _) = status_of(&inner);
                if code != STATUS_SUCCESS {
                    return Err(format!("address status {}", status_str(code)));
                }
                addrs.push(Ia6Addr {
                    addr,
                    prefix_len: 128,
                    preferred,
                    valid,
                    exclude: None,
                });
            }
            (D6_OPTION_IAPREFIX, IaKind::Pd) => {
                if p.len() < 25 {
                    return Err("IA prefix option too short".to_string());
                }
                let preferred = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
                let valid = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
                let prefix_len = p[8];
                let addr = read_addr6(&p[9..]).unwrap_or(Ipv6Addr::UNSPECIFIED);
                if preferred > valid {
                    return Err(format!(
                        "prefix {addr}/{prefix_len} preferred lifetime exceeds valid"
                    ));
                }
                if prefix_len > 128 {
                    return Err(format!("impossible prefix length {prefix_len}"));
                }
                let inner = options::parse_dhcp6_options(&p[25..])
                    .map_err(|e| format!("bad IA prefix options: {e}"))?;
                let exclude = options::find6(&inner, D6_OPTION_PD_EXCLUDE)
                    .and_then(|x| decode_pd_exclude(addr, prefix_len, x));
                addrs.push(Ia6Addr {
                    addr,
                    prefix_len,
                    preferred,
                    valid,
                    exclude,
                });
            }
            _ => {}
        }
    }
    Ok(Ia {
        kind,
        iaid,
        t1,
        t2,
        addrs,
    })
}

/// RFC 6603: the excluded prefix is the delegated prefix with the payload's
/// subnet bits appended.
fn decode_pd_exclude(base: Ipv6Addr, base_len: u8, payload: &[u8]) -> Option<(Ipv6Addr, u8)> {
    let ex_len = *payload.first()?;
    if ex_len <= base_len || ex_len > 128 {
        return None;
    }
    let subnet_bits = (ex_len - base_len) as usize;
    let needed = subnet_bits.div_ceil(8);
    if payload.len() < 1 + needed {
        return None;
    }
    let mut octets = base.octets();
    let mut bit = base_len as usize;
    for i in 0..subnet_bits {
        let src_byte = payload[1 + i / 8];
        let src_bit = (src_byte >> (7 - (i % 8))) & 1;
        if src_bit != 0 {
            octets[bit / 8] |= 1 << (7 - (bit % 8));
        }
        bit += 1;
    }
    Some((Ipv6Addr::from(octets), ex_len))
}

/// Append the SLA id to a delegated prefix for one downstream interface.
fn derive_prefix(
    prefix: &Ia6Addr,
    assign: &PdAssignment,
) -> std::result::Result<(Ipv6Addr, u8), String> {
    let sub_len = if assign.prefix_len == 0 {
        64
    } else {
        assign.prefix_len
    };
    if sub_len < prefix.prefix_len {
        return Err(format!(
            "requested /{sub_len} is shorter than the delegated /{}",
            prefix.prefix_len
        ));
    }
    let sla_bits = (sub_len - prefix.prefix_len) as u32;
    if sla_bits < 32 && assign.sla_id >= (1u32 << sla_bits) {
        return Err(format!(
            "sla id {} does not fit in {sla_bits} bits",
            assign.sla_id
        ));
    }
    let mut octets = prefix.addr.octets();
    // write the sla id into the bits between the two prefix lengths
    for i in 0..sla_bits {
        let src_bit = (assign.sla_id >> (sla_bits - 1 - i)) & 1;
        let dst = prefix.prefix_len as u32 + i;
        if src_bit != 0 {
            octets[(dst / 8) as usize] |= 1 << (7 - (dst % 8));
        }
    }
    let sub = Ipv6Addr::from(octets);
    if let Some((ex, ex_len)) = prefix.exclude {
        if sub_len >= ex_len && prefix_contains(ex, ex_len, sub) {
            return Err(format!("derived prefix {sub}/{sub_len} is excluded ({ex}/{ex_len})"));
        }
    }
    Ok((sub, sub_len))
}

fn prefix_contains(prefix: Ipv6Addr, plen: u8, addr: Ipv6Addr) -> bool {
    let p = u128::from_be_bytes(prefix.octets());
    let a = u128::from_be_bytes(addr.octets());
    if plen == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - plen as u32);
    (p & mask) == (a & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IaSpec;
    use crate::testutil::Harness;

    const DUID: [u8; 10] = [0, 3, 0, 1, 2, 0, 0x5e, 0, 1, 2];
    const SERVER_DUID: [u8; 10] = [0, 3, 0, 1, 2, 0, 0x5e, 9, 9, 9];

    fn iface() -> IfaceId {
        IfaceId::new(1, "eth0")
    }

    fn cfg() -> Dhcp6Config {
        Dhcp6Config {
            initial_delay: false,
            ..Default::default()
        }
    }

    fn client() -> Dhcp6Client {
        Dhcp6Client::new(DUID.to_vec())
    }

    fn lease_addr() -> Ipv6Addr {
        "2001:db8::100".parse().unwrap()
    }

    fn ia_na_payload(iaid: [u8; 4], addr: Ipv6Addr, t1: u32, t2: u32, pref: u32, valid: u32) -> Vec<u8> {
        let mut iaaddr = Vec::new();
        iaaddr.extend_from_slice(&addr.octets());
        iaaddr.extend_from_slice(&pref.to_be_bytes());
        iaaddr.extend_from_slice(&valid.to_be_bytes());
        let mut p = Vec::new();
        p.extend_from_slice(&iaid);
        p.extend_from_slice(&t1.to_be_bytes());
        p.extend_from_slice(&t2.to_be_bytes());
        p.extend_from_slice(&(D6_OPTION_IA_ADDR).to_be_bytes());
        p.extend_from_slice(&(iaaddr.len() as u16).to_be_bytes());
        p.extend_from_slice(&iaaddr);
        p
    }

    fn server_msg(mtype: u8, xid: [u8; 3], extra: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![mtype, xid[0], xid[1], xid[2]];
        let mut w = Writer6::with_capacity(256);
        w.put(D6_OPTION_CLIENTID, &DUID).unwrap();
        w.put(D6_OPTION_SERVERID, &SERVER_DUID).unwrap();
        for (code, payload) in extra {
            w.put(*code, payload).unwrap();
        }
        out.extend_from_slice(&w.finish());
        out
    }

    fn sent_xid(payload: &[u8]) -> [u8; 3] {
        [payload[1], payload[2], payload[3]]
    }

    #[test]
    fn test_solicit_advertise_request_reply() {
        let mut h = Harness::new();
        let mut c = client();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);

        let solicit = h.transport.last_payload().to_vec();
        assert_eq!(solicit[0], DHCP6_SOLICIT);
        let parsed = Dhcp6Message::parse(&solicit).unwrap();
        assert_eq!(parsed.find(D6_OPTION_CLIENTID), Some(&DUID[..]));
        assert!(parsed.find(D6_OPTION_ORO).is_some());
        assert!(parsed.find(D6_OPTION_ELAPSED).is_some());
        let xid = sent_xid(&solicit);

        // maximum preference triggers an immediate REQUEST
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[(D6_OPTION_IA_NA, ia.clone()), (D6_OPTION_PREFERENCE, vec![255])],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Request));
        let request = h.transport.last_payload().to_vec();
        assert_eq!(request[0], DHCP6_REQUEST);
        let req = Dhcp6Message::parse(&request).unwrap();
        assert_eq!(req.find(D6_OPTION_SERVERID), Some(&SERVER_DUID[..]));

        let reply = server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_NA, ia)]);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Bound));
        let lease = c.lease_of(1).unwrap();
        assert_eq!(lease.t1, 300);
        assert_eq!(lease.t2, 480);
        assert!(h.store.blobs.contains_key("eth0.lease6"));
        assert!(h
            .netcfg
            .addrs6
            .iter()
            .any(|&(i, a, plen, _, _)| i == 1 && a == lease_addr() && plen == 128));
        assert!(h.scheduler.is_armed(token(1, TimerKind::Renew)));
        assert!(h.scheduler.is_armed(token(1, TimerKind::Rebind)));
        assert!(h.scheduler.is_armed(token(1, TimerKind::Expire)));
    }

    #[test]
    fn test_preferred_exceeding_valid_rejects_message() {
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 0, 0, 1200, 600);
        let msg =
            Dhcp6Message::parse(&server_msg(DHCP6_REPLY, [1, 2, 3], &[(D6_OPTION_IA_NA, ia)]))
                .unwrap();
        let c = client();
        let err = c.extract_lease(&cfg(), &msg).unwrap_err();
        assert!(err.contains("preferred"), "{err}");
    }

    #[test]
    fn test_timer_fallbacks_from_preferred_lifetime() {
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 0, 0, 1000, 2000);
        let msg =
            Dhcp6Message::parse(&server_msg(DHCP6_REPLY, [1, 2, 3], &[(D6_OPTION_IA_NA, ia)]))
                .unwrap();
        let lease = client().extract_lease(&cfg(), &msg).unwrap();
        assert_eq!(lease.t1, 500);
        assert_eq!(lease.t2, 800);
    }

    #[test]
    fn test_rapid_commit_reply_binds_from_solicit() {
        let mut h = Harness::new();
        let mut c = client();
        let mut config = cfg();
        config.rapid_commit = true;
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), config).unwrap();
        drop(ctx);
        let solicit = h.transport.last_payload().to_vec();
        let parsed = Dhcp6Message::parse(&solicit).unwrap();
        assert!(parsed.find(D6_OPTION_RAPID_COMMIT).is_some());
        let xid = sent_xid(&solicit);
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let reply = server_msg(
            DHCP6_REPLY,
            xid,
            &[(D6_OPTION_IA_NA, ia), (D6_OPTION_RAPID_COMMIT, Vec::new())],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Bound));
    }

    #[test]
    fn test_no_binding_reply_goes_back_to_request() {
        let mut h = Harness::new();
        let mut c = client();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[(D6_OPTION_IA_NA, ia.clone()), (D6_OPTION_PREFERENCE, vec![255])],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        let xid = c.states[&1].xid;
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_NA, ia)]));
        c.renew(&mut ctx, 1);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Renew));
        let xid = c.states[&1].xid;
        let mut status = STATUS_NO_BINDING.to_be_bytes().to_vec();
        status.extend_from_slice(b"gone");
        let nobind = server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_STATUS_CODE, status)]);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &nobind);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Request));
        assert_eq!(h.transport.last_payload()[0], DHCP6_REQUEST);
    }

    #[test]
    fn test_sol_max_rt_learned_within_bounds() {
        let mut h = Harness::new();
        let mut c = client();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[
                (D6_OPTION_IA_NA, ia),
                (D6_OPTION_SOL_MAX_RT, 7200u32.to_be_bytes().to_vec()),
            ],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        assert_eq!(c.states[&1].sol_max_rt, 7200);
        // out-of-range values are ignored
        let mut ctx = h.ctx();
        let xid = c.states[&1].xid;
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let bad = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[
                (D6_OPTION_IA_NA, ia),
                (D6_OPTION_SOL_MAX_RT, 10u32.to_be_bytes().to_vec()),
            ],
        );
        c.handle_datagram(&mut ctx, 1, &bad);
        drop(ctx);
        assert_eq!(c.states[&1].sol_max_rt, 7200);
    }

    #[test]
    fn test_info_only_sends_information_request() {
        let mut h = Harness::new();
        let mut c = client();
        let mut config = cfg();
        config.info_only = true;
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), config).unwrap();
        drop(ctx);
        let sent = h.transport.last_payload();
        assert_eq!(sent[0], DHCP6_INFORMATION_REQ);
        let msg = Dhcp6Message::parse(sent).unwrap();
        // stateless: no IA containers
        assert!(msg.find(D6_OPTION_IA_NA).is_none());
    }

    #[test]
    fn test_derive_prefix_appends_sla_id() {
        let prefix = Ia6Addr {
            addr: "2001:db8:100::".parse().unwrap(),
            prefix_len: 48,
            preferred: 600,
            valid: 1200,
            exclude: None,
        };
        let assign = PdAssignment {
            ifindex: 2,
            sla_id: 5,
            prefix_len: 64,
        };
        let (sub, len) = derive_prefix(&prefix, &assign).unwrap();
        assert_eq!(len, 64);
        assert_eq!(sub, "2001:db8:100:5::".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_derive_prefix_rejects_oversized_sla() {
        let prefix = Ia6Addr {
            addr: "2001:db8::".parse().unwrap(),
            prefix_len: 62,
            preferred: 600,
            valid: 1200,
            exclude: None,
        };
        let assign = PdAssignment {
            ifindex: 2,
            sla_id: 4, // needs 3 bits, only 2 available
            prefix_len: 64,
        };
        assert!(derive_prefix(&prefix, &assign).is_err());
    }

    #[test]
    fn test_derived_prefix_respects_exclusion() {
        let prefix = Ia6Addr {
            addr: "2001:db8:100::".parse().unwrap(),
            prefix_len: 48,
            preferred: 600,
            valid: 1200,
            exclude: Some(("2001:db8:100:5::".parse().unwrap(), 64)),
        };
        let assign = PdAssignment {
            ifindex: 2,
            sla_id: 5,
            prefix_len: 64,
        };
        assert!(derive_prefix(&prefix, &assign).is_err());
        let other = PdAssignment {
            ifindex: 2,
            sla_id: 6,
            prefix_len: 64,
        };
        assert!(derive_prefix(&prefix, &other).is_ok());
    }

    #[test]
    fn test_pd_fan_out_waits_for_link_local() {
        let mut h = Harness::new();
        let mut c = client();
        let mut config = cfg();
        config.ias = vec![IaSpec {
            kind: IaKind::Pd,
            iaid: [0, 0, 0, 2],
            assignments: vec![PdAssignment {
                ifindex: 5,
                sla_id: 1,
                prefix_len: 64,
            }],
        }];
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), config).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        // IA_PD with one delegated /48
        let mut iaprefix = Vec::new();
        iaprefix.extend_from_slice(&600u32.to_be_bytes());
        iaprefix.extend_from_slice(&1200u32.to_be_bytes());
        iaprefix.push(48);
        iaprefix.extend_from_slice(&"2001:db8:100::".parse::<Ipv6Addr>().unwrap().octets());
        let mut iapd = Vec::new();
        iapd.extend_from_slice(&[0, 0, 0, 2]);
        iapd.extend_from_slice(&300u32.to_be_bytes());
        iapd.extend_from_slice(&480u32.to_be_bytes());
        iapd.extend_from_slice(&D6_OPTION_IAPREFIX.to_be_bytes());
        iapd.extend_from_slice(&(iaprefix.len() as u16).to_be_bytes());
        iapd.extend_from_slice(&iaprefix);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[(D6_OPTION_IA_PD, iapd.clone()), (D6_OPTION_PREFERENCE, vec![255])],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        let xid = c.states[&1].xid;
        let reply = server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_PD, iapd)]);
        // downstream if5 has no link-local yet: assignment is deferred
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Delegated));
        assert!(h.netcfg.addrs6.iter().all(|&(i, ..)| i != 5));
        assert_eq!(c.states[&1].deferred_pd, vec![5]);
        // once the link-local appears the prefix lands
        h.netcfg
            .link_local
            .insert(5, "fe80::1".parse().unwrap());
        let mut ctx = h.ctx();
        c.link_local_ready(&mut ctx, 1, 5);
        drop(ctx);
        let expect: Ipv6Addr = "2001:db8:100:1::".parse().unwrap();
        assert!(h
            .netcfg
            .addrs6
            .iter()
            .any(|&(i, a, plen, _, _)| i == 5 && a == expect && plen == 64));
        assert!(h
            .hooks
            .runs
            .iter()
            .any(|(_, _, reason)| reason == "DELEGATED"));
    }

    #[test]
    fn test_wrong_client_id_ignored() {
        let mut h = Harness::new();
        let mut c = client();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let mut out = vec![DHCP6_ADVERTISE, xid[0], xid[1], xid[2]];
        let mut w = Writer6::with_capacity(128);
        w.put(D6_OPTION_CLIENTID, &[9u8; 10]).unwrap();
        w.put(D6_OPTION_SERVERID, &SERVER_DUID).unwrap();
        w.put(D6_OPTION_IA_NA, &ia).unwrap();
        w.put(D6_OPTION_PREFERENCE, &[255]).unwrap();
        out.extend_from_slice(&w.finish());
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &out);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Solicit));
    }

    #[test]
    fn test_decline_after_duplicate_detection() {
        let mut h = Harness::new();
        let mut c = client();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[(D6_OPTION_IA_NA, ia.clone()), (D6_OPTION_PREFERENCE, vec![255])],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        let xid = c.states[&1].xid;
        let reply = server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_NA, ia)]);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply);
        c.decline_duplicates(&mut ctx, 1, &[lease_addr()]);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Decline));
        let decline = h.transport.last_payload();
        assert_eq!(decline[0], DHCP6_DECLINE);
        // the address came off the interface
        assert!(h.netcfg.addrs6.iter().all(|&(_, a, ..)| a != lease_addr()));
    }

    fn ia_na_two(iaid: [u8; 4], a: Ipv6Addr, b: Ipv6Addr) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&iaid);
        p.extend_from_slice(&300u32.to_be_bytes());
        p.extend_from_slice(&480u32.to_be_bytes());
        for addr in [a, b] {
            let mut iaaddr = Vec::new();
            iaaddr.extend_from_slice(&addr.octets());
            iaaddr.extend_from_slice(&600u32.to_be_bytes());
            iaaddr.extend_from_slice(&1200u32.to_be_bytes());
            p.extend_from_slice(&D6_OPTION_IA_ADDR.to_be_bytes());
            p.extend_from_slice(&(iaaddr.len() as u16).to_be_bytes());
            p.extend_from_slice(&iaaddr);
        }
        p
    }

    #[test]
    fn test_renew_reply_drops_withdrawn_address() {
        let mut h = Harness::new();
        let mut c = client();
        let kept = lease_addr();
        let dropped: Ipv6Addr = "2001:db8::200".parse().unwrap();
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), cfg()).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let both = ia_na_two([0, 0, 0, 1], kept, dropped);
        let advert = server_msg(
            DHCP6_ADVERTISE,
            xid,
            &[(D6_OPTION_IA_NA, both.clone()), (D6_OPTION_PREFERENCE, vec![255])],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &advert);
        drop(ctx);
        let xid = c.states[&1].xid;
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_NA, both)]));
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Bound));
        assert!(h.netcfg.addrs6.iter().any(|&(_, a, ..)| a == dropped));

        // the renewal reply only carries one of the two addresses
        let mut ctx = h.ctx();
        c.renew(&mut ctx, 1);
        drop(ctx);
        let xid = c.states[&1].xid;
        let one = ia_na_payload([0, 0, 0, 1], kept, 300, 480, 600, 1200);
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &server_msg(DHCP6_REPLY, xid, &[(D6_OPTION_IA_NA, one)]));
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Bound));
        assert!(h.netcfg.addrs6.iter().any(|&(_, a, ..)| a == kept));
        assert!(h.netcfg.addrs6.iter().all(|&(_, a, ..)| a != dropped));
    }

    #[test]
    fn test_expiry_restarts_stateless_when_routers_say_so() {
        let mut h = Harness::new();
        let mut c = client();
        let mut config = cfg();
        config.rapid_commit = true;
        let mut ctx = h.ctx();
        c.start(&mut ctx, iface(), config).unwrap();
        drop(ctx);
        let xid = sent_xid(h.transport.last_payload());
        let ia = ia_na_payload([0, 0, 0, 1], lease_addr(), 300, 480, 600, 1200);
        let reply = server_msg(
            DHCP6_REPLY,
            xid,
            &[(D6_OPTION_IA_NA, ia), (D6_OPTION_RAPID_COMMIT, Vec::new())],
        );
        let mut ctx = h.ctx();
        c.handle_datagram(&mut ctx, 1, &reply);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Bound));

        // the routers only advertise the O flag now; expiry re-acquires
        // with an information request instead of a fresh solicit
        c.set_mode_hint(1, DhcpHint::InfoOnly);
        let mut ctx = h.ctx();
        c.on_timer(&mut ctx, 1, TimerKind::Expire);
        drop(ctx);
        assert_eq!(c.state_of(1), Some(Dhcp6State::Inform));
        assert_eq!(h.transport.last_payload()[0], DHCP6_INFORMATION_REQ);
    }
}
