//! IPv6 Neighbor Discovery: Router Solicitation and Router Advertisement
//! handling (RFC 4861), stateless address autoconfiguration (RFC 4862) with
//! optional temporary addresses (RFC 4941), and the M/O flag handoff that
//! decides whether DHCPv6 should run and in which mode.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::NdConfig;
use crate::error::{NetleaseError, Result};
use crate::options;
use crate::platform::{Ctx, Family, IfaceId, LinkInfo};
use crate::scheduler::{Proto, TimerKind, TimerToken};

pub const ND_ROUTER_SOLICIT: u8 = 133;
pub const ND_ROUTER_ADVERT: u8 = 134;

pub const ND_OPT_SOURCE_LLADDR: u8 = 1;
pub const ND_OPT_PREFIX_INFO: u8 = 3;
pub const ND_OPT_MTU: u8 = 5;
pub const ND_OPT_RDNSS: u8 = 25;
pub const ND_OPT_DNSSL: u8 = 31;

/// All-routers multicast group solicitations are sent to.
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

const MAX_RTR_SOLICITATIONS: u32 = 3;
const RTR_SOLICITATION_INTERVAL: Duration = Duration::from_secs(4);

/// Smallest MTU an IPv6 link may have (RFC 8200).
const IPV6_MIN_MTU: u32 = 1280;

/// Routers tracked per interface; the worst-sorted entry is evicted first.
const MAX_ROUTERS: usize = 5;

/// RFC 4862 §5.5.3e: a shrinking valid lifetime is floored at two hours
/// unless the address already has less than that left.
const MIN_VALID_REMAINING: u32 = 7200;

/// RFC 4941 caps for temporary addresses.
const TEMP_PREFERRED_LIFETIME: u32 = 86_400;
const TEMP_VALID_LIFETIME: u32 = 604_800;

const RA_FLAG_MANAGED: u8 = 0x80;
const RA_FLAG_OTHER: u8 = 0x40;

fn token(ifindex: u32, kind: TimerKind) -> TimerToken {
    TimerToken::new(ifindex, Proto::Ndisc, kind)
}

fn read_u32(b: &[u8]) -> Option<u32> {
    (b.len() >= 4).then(|| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_addr6(b: &[u8]) -> Option<Ipv6Addr> {
    let arr: [u8; 16] = b.get(..16)?.try_into().ok()?;
    Some(Ipv6Addr::from(arr))
}

fn is_link_local(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// What the most recent Router Advertisement said about DHCPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpHint {
    /// M flag: run stateful DHCPv6.
    Stateful,
    /// O flag only: run INFORMATION-REQUEST.
    InfoOnly,
    /// Neither flag: SLAAC alone suffices.
    None,
}

/// RFC 4191 default router preference, high to low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouterPreference {
    Low,
    Medium,
    High,
}

fn decode_preference(flags: u8) -> RouterPreference {
    match (flags >> 3) & 0x3 {
        0b01 => RouterPreference::High,
        0b11 => RouterPreference::Low,
        // 0b10 is reserved and treated as the default
        _ => RouterPreference::Medium,
    }
}

/// One prefix advertised by a router.
#[derive(Debug, Clone)]
pub struct RaPrefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub preferred: u32,
    pub valid: u32,
}

/// Everything learned from one router, keyed by its link-local source.
#[derive(Debug, Clone)]
pub struct RouterRecord {
    pub source: Ipv6Addr,
    /// Routing metric of the interface the advertisement arrived on.
    pub metric: u32,
    pub lifetime: u16,
    pub preference: RouterPreference,
    pub received: Instant,
    /// Cleared by neighbor-unreachability feedback, restored the same way.
    pub reachable: bool,
    pub prefixes: Vec<RaPrefix>,
    pub rdnss: Vec<Ipv6Addr>,
    pub dnssl: Vec<String>,
    /// Advertised link MTU, kept only when it fits the link (1280 up to
    /// the interface MTU). The engine never resizes the interface itself;
    /// embedders read it through [`NdEngine::routers_of`].
    pub mtu: Option<u32>,
    pub managed: bool,
    pub other_config: bool,
}

impl RouterRecord {
    pub fn expired(&self, now: Instant) -> bool {
        self.lifetime != 0
            && now.duration_since(self.received) >= Duration::from_secs(self.lifetime as u64)
    }

    /// Would lapse before a fresh solicitation burst could find a
    /// replacement.
    pub fn expiring_soon(&self, now: Instant) -> bool {
        if self.lifetime == 0 || self.expired(now) {
            return false;
        }
        let remaining = Duration::from_secs(self.lifetime as u64)
            .saturating_sub(now.duration_since(self.received));
        remaining <= RTR_SOLICITATION_INTERVAL * MAX_RTR_SOLICITATIONS
    }
}

/// Total order over routers: lowest interface metric first, then live
/// before expired, not-about-to-expire before about-to-expire, non-zero
/// lifetime before zero, reachable before unreachable, higher RFC 4191
/// preference before lower. Freshness and source address break the
/// remaining ties so the order is fully deterministic.
pub fn sort_routers(routers: &mut [RouterRecord], now: Instant) {
    routers.sort_by(|a, b| {
        a.metric
            .cmp(&b.metric)
            .then(a.expired(now).cmp(&b.expired(now)))
            .then(a.expiring_soon(now).cmp(&b.expiring_soon(now)))
            .then((a.lifetime == 0).cmp(&(b.lifetime == 0)))
            .then(b.reachable.cmp(&a.reachable))
            .then(b.preference.cmp(&a.preference))
            .then(b.received.cmp(&a.received))
            .then(a.source.cmp(&b.source))
    });
}

/// An address this engine formed from an advertised prefix.
#[derive(Debug, Clone)]
struct SlaacAddr {
    addr: Ipv6Addr,
    prefix: Ipv6Addr,
    prefix_len: u8,
    temporary: bool,
    preferred: u32,
    valid: u32,
    updated: Instant,
    /// Not refreshed by the latest advertisements; a second miss
    /// soft-deprecates the address.
    stale: bool,
}

impl SlaacAddr {
    fn valid_remaining(&self, now: Instant) -> u32 {
        let gone = now.duration_since(self.updated).as_secs();
        (self.valid as u64).saturating_sub(gone) as u32
    }

    fn preferred_remaining(&self, now: Instant) -> u32 {
        let gone = now.duration_since(self.updated).as_secs();
        (self.preferred as u64).saturating_sub(gone) as u32
    }
}

#[derive(Debug)]
struct IfStateNd {
    iface: IfaceId,
    link: LinkInfo,
    cfg: NdConfig,
    probes_sent: u32,
    routers: Vec<RouterRecord>,
    addrs: Vec<SlaacAddr>,
    /// Gateway the default route currently points at, if any.
    default_route: Option<Ipv6Addr>,
    last_hint: Option<DhcpHint>,
}

/// Process-wide ND engine; one listener per started interface.
pub struct NdEngine {
    states: HashMap<u32, IfStateNd>,
    handoff: Option<Box<dyn FnMut(u32, DhcpHint)>>,
}

impl Default for NdEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NdEngine {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            handoff: None,
        }
    }

    /// Register the DHCPv6 handoff: called with the interface index and the
    /// new hint whenever the best router's M/O flags change what DHCPv6
    /// should be doing. Embedders usually queue an event here and start,
    /// restart or stop their [`crate::Dhcp6Client`] from their own loop.
    pub fn set_dhcp_handoff(&mut self, f: impl FnMut(u32, DhcpHint) + 'static) {
        self.handoff = Some(Box::new(f));
    }

    pub fn routers_of(&self, ifindex: u32) -> Option<&[RouterRecord]> {
        self.states.get(&ifindex).map(|s| s.routers.as_slice())
    }

    /// DHCPv6 mode suggested by the best current router, if any.
    pub fn dhcp_hint(&self, ifindex: u32) -> Option<DhcpHint> {
        let st = self.states.get(&ifindex)?;
        let r = st.routers.first()?;
        Some(if r.managed {
            DhcpHint::Stateful
        } else if r.other_config {
            DhcpHint::InfoOnly
        } else {
            DhcpHint::None
        })
    }

    /// An interface is ready once a live router has been heard, and, when
    /// configured to wait, once recursive DNS servers are known.
    pub fn ready(&self, ifindex: u32, now: Instant) -> bool {
        let Some(st) = self.states.get(&ifindex) else { return false };
        let live = st.routers.iter().any(|r| !r.expired(now) && r.lifetime != 0);
        if !live {
            return false;
        }
        if st.cfg.wait_for_dns {
            return st.routers.iter().any(|r| !r.rdnss.is_empty());
        }
        true
    }

    pub fn start(&mut self, ctx: &mut Ctx<'_>, iface: IfaceId, link: LinkInfo, cfg: NdConfig) -> Result<()> {
        if self.states.contains_key(&iface.index) {
            return Err(NetleaseError::AlreadyStarted {
                interface: iface.name,
                proto: "IPv6 ND",
            });
        }
        let ifindex = iface.index;
        let solicit = cfg.solicit;
        let delay = if cfg.initial_delay {
            Duration::from_millis(rand::thread_rng().gen_range(0..=1000))
        } else {
            Duration::ZERO
        };
        self.states.insert(
            ifindex,
            IfStateNd {
                iface,
                link,
                cfg,
                probes_sent: 0,
                routers: Vec::new(),
                addrs: Vec::new(),
                default_route: None,
                last_hint: None,
            },
        );
        if solicit {
            if delay.is_zero() {
                self.send_solicit(ctx, ifindex);
            } else {
                ctx.scheduler.schedule_once(delay, token(ifindex, TimerKind::Solicit));
            }
        }
        Ok(())
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, ifindex: u32, kind: TimerKind) {
        if !self.states.contains_key(&ifindex) {
            return;
        }
        match kind {
            TimerKind::Solicit | TimerKind::Start => self.send_solicit(ctx, ifindex),
            TimerKind::RouterExpire => self.expire_pass(ctx, ifindex),
            _ => {}
        }
    }

    fn send_solicit(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.probes_sent >= MAX_RTR_SOLICITATIONS {
            log::warn!("{}: no IPv6 routers available", st.iface.name);
            return;
        }
        st.probes_sent += 1;
        let mut packet = vec![ND_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0];
        if !st.link.hwaddr.is_empty() {
            packet.extend_from_slice(&options::encode_nd_option(
                ND_OPT_SOURCE_LLADDR,
                &st.link.hwaddr,
            ));
        }
        log::debug!(
            "{}: soliciting an IPv6 router ({}/{})",
            st.iface.name,
            st.probes_sent,
            MAX_RTR_SOLICITATIONS
        );
        if let Err(e) = ctx.transport.send_icmp6(ifindex, ALL_ROUTERS, &packet) {
            log::warn!("{}: router solicitation failed: {e}", st.iface.name);
        }
        ctx.scheduler
            .schedule_once(RTR_SOLICITATION_INTERVAL, token(ifindex, TimerKind::Solicit));
    }

    /// Process a received Router Advertisement. `data` starts at the
    /// ICMPv6 type byte; `hoplimit` comes from the IPv6 header.
    pub fn handle_router_advert(
        &mut self,
        ctx: &mut Ctx<'_>,
        ifindex: u32,
        from: Ipv6Addr,
        hoplimit: u8,
        data: &[u8],
    ) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        // unforwarded on-link packets only
        if hoplimit != 255 {
            log::debug!("{}: RA with hop limit {hoplimit}, dropped", st.iface.name);
            return;
        }
        if !is_link_local(from) {
            log::debug!("{}: RA from non-link-local {from}, dropped", st.iface.name);
            return;
        }
        if data.len() < 16 || data[0] != ND_ROUTER_ADVERT || data[1] != 0 {
            return;
        }
        let flags = data[5];
        let lifetime = u16::from_be_bytes([data[6], data[7]]);
        let opts = match options::parse_nd_options(&data[16..]) {
            Ok(o) => o,
            Err(e) => {
                log::debug!("{}: malformed RA from {from}: {e}", st.iface.name);
                return;
            }
        };

        // our own advertisements reflect back on some links
        if opts
            .iter()
            .any(|(t, p)| *t == ND_OPT_SOURCE_LLADDR && p.starts_with(&st.link.hwaddr) && !st.link.hwaddr.is_empty())
        {
            log::debug!("{}: ignoring our own RA", st.iface.name);
            return;
        }
        for required in &st.cfg.require {
            if !opts.iter().any(|(t, _)| t == required) {
                log::debug!(
                    "{}: RA from {from} lacks required option {required}, dropped",
                    st.iface.name
                );
                return;
            }
        }
        if let Some((t, _)) = opts.iter().find(|(t, _)| st.cfg.reject.contains(t)) {
            log::debug!(
                "{}: RA from {from} carries rejected option {t}, dropped",
                st.iface.name
            );
            return;
        }

        let mut record = RouterRecord {
            source: from,
            metric: st.link.metric,
            lifetime,
            preference: decode_preference(flags),
            received: ctx.now,
            reachable: true,
            prefixes: Vec::new(),
            rdnss: Vec::new(),
            dnssl: Vec::new(),
            mtu: None,
            managed: flags & RA_FLAG_MANAGED != 0,
            other_config: flags & RA_FLAG_OTHER != 0,
        };
        for (typ, payload) in &opts {
            match *typ {
                ND_OPT_PREFIX_INFO => {
                    if let Some(p) = decode_prefix_info(payload) {
                        if p.preferred > p.valid {
                            log::debug!(
                                "{}: prefix {}/{} preferred exceeds valid, skipped",
                                st.iface.name,
                                p.prefix,
                                p.prefix_len
                            );
                            continue;
                        }
                        record.prefixes.push(p);
                    }
                }
                ND_OPT_MTU => {
                    if let Some(mtu) = payload.get(2..6).and_then(read_u32) {
                        if mtu >= IPV6_MIN_MTU && mtu <= st.link.mtu {
                            record.mtu = Some(mtu);
                        } else {
                            log::debug!(
                                "{}: RA MTU {mtu} outside {IPV6_MIN_MTU}..={}, ignored",
                                st.iface.name,
                                st.link.mtu
                            );
                        }
                    }
                }
                ND_OPT_RDNSS => {
                    if payload.len() >= 6 {
                        let mut off = 6;
                        while off + 16 <= payload.len() {
                            if let Some(a) = read_addr6(&payload[off..]) {
                                record.rdnss.push(a);
                            }
                            off += 16;
                        }
                    }
                }
                ND_OPT_DNSSL => {
                    if payload.len() >= 6 {
                        if let Ok(names) = options::decode_domain_names(&payload[6..]) {
                            record.dnssl.extend(names);
                        }
                    }
                }
                _ => {}
            }
        }

        log::info!(
            "{}: router advertisement from {from} (lifetime {lifetime}s)",
            st.iface.name
        );
        // a router answered; the solicitation burst can stop
        ctx.scheduler.cancel(token(ifindex, TimerKind::Solicit));

        match st.routers.iter_mut().find(|r| r.source == from) {
            Some(existing) => {
                // reachability feedback outlives the advertisement refresh
                record.reachable = existing.reachable;
                *existing = record;
            }
            None => st.routers.push(record),
        }
        sort_routers(&mut st.routers, ctx.now);
        while st.routers.len() > MAX_ROUTERS {
            if let Some(evicted) = st.routers.pop() {
                log::info!("{}: evicting router {}", st.iface.name, evicted.source);
            }
        }

        self.apply_prefixes(ctx, ifindex);
        self.rearm_expiry(ctx, ifindex);
        self.install_default_route(ctx, ifindex);
        self.dispatch_hint(ifindex);
        let Some(st) = self.states.get(&ifindex) else { return };
        let env = ra_env(st);
        let name = st.iface.name.clone();
        ctx.hooks.run(&name, Family::Ipv6, "ROUTERADVERT", &env);
    }

    /// Neighbor-unreachability feedback from the embedder; re-ranks the
    /// routers and moves the default route if the head changed.
    pub fn reachability_changed(
        &mut self,
        ctx: &mut Ctx<'_>,
        ifindex: u32,
        source: Ipv6Addr,
        reachable: bool,
    ) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let Some(r) = st.routers.iter_mut().find(|r| r.source == source) else { return };
        if r.reachable == reachable {
            return;
        }
        r.reachable = reachable;
        log::info!(
            "{}: router {source} is {}",
            st.iface.name,
            if reachable { "reachable" } else { "unreachable" }
        );
        sort_routers(&mut st.routers, ctx.now);
        self.install_default_route(ctx, ifindex);
    }

    /// Keep the default route on the ordering's head, skipping routers
    /// that expired or advertised a zero lifetime.
    fn install_default_route(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let head = st
            .routers
            .iter()
            .find(|r| r.lifetime != 0 && !r.expired(ctx.now))
            .map(|r| r.source);
        if st.default_route == head {
            return;
        }
        match ctx.netcfg.set_default_route6(ifindex, head) {
            Ok(()) => {
                match head {
                    Some(gw) => log::info!("{}: default route via {gw}", st.iface.name),
                    None => log::info!("{}: no default router left", st.iface.name),
                }
                st.default_route = head;
            }
            Err(e) => log::error!("{}: failed to set default route: {e}", st.iface.name),
        }
    }

    /// Invoke the DHCPv6 handoff when the best router's M/O flags change
    /// the required mode.
    fn dispatch_hint(&mut self, ifindex: u32) {
        let Some(hint) = self.dhcp_hint(ifindex) else { return };
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if st.last_hint == Some(hint) {
            return;
        }
        st.last_hint = Some(hint);
        if let Some(cb) = self.handoff.as_mut() {
            cb(ifindex, hint);
        }
    }

    /// Form or refresh autoconfigured addresses from every live router's
    /// autonomous prefixes.
    fn apply_prefixes(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        if !st.cfg.autoconf {
            return;
        }
        let now = ctx.now;
        let iid = eui64_interface_id(&st.link.hwaddr);
        let want_temp = st.cfg.temporary_addresses;
        let mut updates: Vec<SlaacAddr> = Vec::new();
        for router in &st.routers {
            if router.expired(now) {
                continue;
            }
            for p in &router.prefixes {
                if !p.autonomous || p.prefix_len != 64 {
                    continue;
                }
                if p.prefix.is_multicast() || is_link_local(p.prefix) {
                    continue;
                }
                if let Some(iid) = iid {
                    updates.push(SlaacAddr {
                        addr: apply_interface_id(p.prefix, iid),
                        prefix: p.prefix,
                        prefix_len: p.prefix_len,
                        temporary: false,
                        preferred: p.preferred,
                        valid: p.valid,
                        updated: now,
                        stale: false,
                    });
                }
                if want_temp {
                    updates.push(SlaacAddr {
                        addr: apply_interface_id(p.prefix, random_interface_id()),
                        prefix: p.prefix,
                        prefix_len: p.prefix_len,
                        temporary: true,
                        preferred: p.preferred.min(TEMP_PREFERRED_LIFETIME),
                        valid: p.valid.min(TEMP_VALID_LIFETIME),
                        updated: now,
                        stale: false,
                    });
                }
            }
        }

        let name = st.iface.name.clone();
        let refreshed: Vec<(Ipv6Addr, bool)> =
            updates.iter().map(|u| (u.prefix, u.temporary)).collect();
        for update in updates {
            let existing = st.addrs.iter_mut().find(|a| {
                a.prefix == update.prefix && a.temporary == update.temporary
            });
            match existing {
                Some(a) => {
                    // RFC 4862 two-hour rule: never let a shrinking valid
                    // lifetime fall below two hours unless it already is
                    let remaining = a.valid_remaining(now);
                    let valid = if update.valid > MIN_VALID_REMAINING || update.valid > remaining {
                        update.valid
                    } else if remaining <= MIN_VALID_REMAINING {
                        remaining
                    } else {
                        MIN_VALID_REMAINING
                    };
                    a.preferred = update.preferred;
                    a.valid = valid;
                    a.updated = now;
                    a.stale = false;
                    if a.preferred == 0 {
                        log::info!("{name}: deprecating {}", a.addr);
                    }
                    if let Err(e) = ctx.netcfg.add_address6(
                        ifindex,
                        a.addr,
                        a.prefix_len,
                        a.preferred,
                        a.valid,
                    ) {
                        log::error!("{name}: failed to refresh {}: {e}", a.addr);
                    }
                }
                None => {
                    if update.valid == 0 {
                        continue;
                    }
                    if let Err(e) = ctx.netcfg.add_address6(
                        ifindex,
                        update.addr,
                        update.prefix_len,
                        update.preferred,
                        update.valid,
                    ) {
                        log::error!("{name}: failed to apply {}: {e}", update.addr);
                        continue;
                    }
                    log::info!(
                        "{name}: autoconfigured {} (pltime {}s, vltime {}s)",
                        update.addr,
                        update.preferred,
                        update.valid
                    );
                    st.addrs.push(update);
                }
            }
        }

        // two-round rule: an address not refreshed by the latest
        // advertisements goes stale first, then is soft-deprecated on the
        // next miss. The valid lifetime keeps running it out.
        let mut deprecate: Vec<(Ipv6Addr, u8, u32)> = Vec::new();
        for a in &mut st.addrs {
            if refreshed.contains(&(a.prefix, a.temporary)) {
                continue;
            }
            if !a.stale {
                a.stale = true;
            } else if a.preferred != 0 {
                a.preferred = 0;
                let valid = a.valid_remaining(now);
                a.valid = valid;
                a.updated = now;
                deprecate.push((a.addr, a.prefix_len, valid));
            }
        }
        for (addr, plen, valid) in deprecate {
            log::info!("{name}: soft-deprecating {addr} (not refreshed)");
            if let Err(e) = ctx.netcfg.add_address6(ifindex, addr, plen, 0, valid) {
                log::error!("{name}: failed to deprecate {addr}: {e}");
            }
        }
    }

    /// One shared timer covers every router and address expiry on the
    /// interface; it is re-armed at the nearest deadline.
    fn rearm_expiry(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get(&ifindex) else { return };
        let now = ctx.now;
        let mut next: Option<Duration> = None;
        let mut consider = |d: Duration| {
            next = Some(match next {
                Some(cur) if cur <= d => cur,
                _ => d,
            });
        };
        for r in &st.routers {
            if r.lifetime != 0 && !r.expired(now) {
                let deadline = Duration::from_secs(r.lifetime as u64)
                    .saturating_sub(now.duration_since(r.received));
                consider(deadline);
            }
        }
        for a in &st.addrs {
            let pref = a.preferred_remaining(now);
            if pref > 0 {
                consider(Duration::from_secs(pref as u64));
            }
            let valid = a.valid_remaining(now);
            if valid > 0 {
                consider(Duration::from_secs(valid as u64));
            }
        }
        if let Some(delay) = next {
            ctx.scheduler
                .schedule_once(delay, token(ifindex, TimerKind::RouterExpire));
        }
    }

    /// Evict expired routers, deprecate preferred-expired addresses, and
    /// drop valid-expired ones.
    fn expire_pass(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.get_mut(&ifindex) else { return };
        let now = ctx.now;
        let name = st.iface.name.clone();
        let before = st.routers.len();
        st.routers.retain(|r| {
            if r.expired(now) {
                log::warn!("{name}: router {} expired", r.source);
                false
            } else {
                true
            }
        });
        sort_routers(&mut st.routers, now);
        let routers_lost = st.routers.len() != before;

        let mut removed = Vec::new();
        for a in &mut st.addrs {
            if a.valid_remaining(now) == 0 {
                removed.push(a.addr);
                continue;
            }
            if a.preferred != 0 && a.preferred_remaining(now) == 0 {
                // deprecated but still valid
                a.preferred = 0;
                let valid = a.valid_remaining(now);
                a.valid = valid;
                a.updated = now;
                log::info!("{name}: {} is now deprecated", a.addr);
                if let Err(e) = ctx.netcfg.add_address6(ifindex, a.addr, a.prefix_len, 0, valid) {
                    log::error!("{name}: failed to deprecate {}: {e}", a.addr);
                }
            }
        }
        for addr in &removed {
            log::warn!("{name}: address {addr} expired");
            let _ = ctx.netcfg.del_address6(ifindex, *addr);
        }
        st.addrs.retain(|a| !removed.contains(&a.addr));

        self.rearm_expiry(ctx, ifindex);
        self.install_default_route(ctx, ifindex);
        self.dispatch_hint(ifindex);
        if routers_lost || !removed.is_empty() {
            let Some(st) = self.states.get(&ifindex) else { return };
            let env = ra_env(st);
            ctx.hooks.run(&name, Family::Ipv6, "ROUTERADVERT", &env);
        }
    }

    /// Stop ND on an interface, removing every autoconfigured address.
    pub fn free(&mut self, ctx: &mut Ctx<'_>, ifindex: u32) {
        let Some(st) = self.states.remove(&ifindex) else { return };
        for kind in [TimerKind::Solicit, TimerKind::RouterExpire, TimerKind::Start] {
            ctx.scheduler.cancel(token(ifindex, kind));
        }
        for a in &st.addrs {
            let _ = ctx.netcfg.del_address6(ifindex, a.addr);
        }
        if st.default_route.is_some() {
            let _ = ctx.netcfg.set_default_route6(ifindex, None);
        }
        ctx.hooks.run(&st.iface.name, Family::Ipv6, "STOP", &[]);
    }
}

fn ra_env(st: &IfStateNd) -> Vec<(String, String)> {
    let mut env = Vec::new();
    let routers: Vec<String> = st
        .routers
        .iter()
        .filter(|r| r.lifetime != 0)
        .map(|r| r.source.to_string())
        .collect();
    if !routers.is_empty() {
        env.push(("nd_routers".to_string(), routers.join(" ")));
    }
    let rdnss: Vec<String> = st
        .routers
        .iter()
        .flat_map(|r| r.rdnss.iter())
        .map(|a| a.to_string())
        .collect();
    if !rdnss.is_empty() {
        env.push(("nd_rdnss".to_string(), rdnss.join(" ")));
    }
    let dnssl: Vec<String> = st
        .routers
        .iter()
        .flat_map(|r| r.dnssl.iter().cloned())
        .collect();
    if !dnssl.is_empty() {
        env.push(("nd_dnssl".to_string(), dnssl.join(" ")));
    }
    env
}

/// Prefix information option body (after the 2 header bytes): length,
/// flags, valid, preferred, reserved, prefix.
fn decode_prefix_info(payload: &[u8]) -> Option<RaPrefix> {
    if payload.len() < 30 {
        return None;
    }
    let prefix_len = payload[0];
    if prefix_len > 128 {
        return None;
    }
    let flags = payload[1];
    let valid = read_u32(&payload[2..])?;
    let preferred = read_u32(&payload[6..])?;
    let prefix = read_addr6(&payload[14..])?;
    Some(RaPrefix {
        prefix,
        prefix_len,
        on_link: flags & 0x80 != 0,
        autonomous: flags & 0x40 != 0,
        preferred,
        valid,
    })
}

/// Modified EUI-64 interface identifier from a 6-byte MAC.
fn eui64_interface_id(hwaddr: &[u8]) -> Option<[u8; 8]> {
    let mac: &[u8; 6] = hwaddr.try_into().ok()?;
    Some([
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ])
}

fn random_interface_id() -> [u8; 8] {
    let mut iid: [u8; 8] = rand::thread_rng().gen();
    // keep the universal/local bit local
    iid[0] &= !0x02;
    iid
}

fn apply_interface_id(prefix: Ipv6Addr, iid: [u8; 8]) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[8..].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}
