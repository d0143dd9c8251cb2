//! In-memory collaborator fakes shared by the module test suites.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use crate::platform::{Ctx, Family, HookRunner, LeaseStore, NetConfig, Route4, Transport};
use crate::scheduler::ManualScheduler;

#[derive(Debug, Default)]
pub struct MemStore {
    pub blobs: HashMap<String, Vec<u8>>,
}

impl LeaseStore for MemStore {
    fn load(&mut self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }
    fn save(&mut self, key: &str, data: &[u8]) -> io::Result<()> {
        self.blobs.insert(key.to_string(), data.to_vec());
        Ok(())
    }
    fn remove(&mut self, key: &str) -> io::Result<()> {
        self.blobs.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Raw { ifindex: u32, payload: Vec<u8> },
    Udp { ifindex: u32, src: Ipv4Addr, dst: Ipv4Addr, payload: Vec<u8> },
    Udp6 { ifindex: u32, dst: Ipv6Addr, payload: Vec<u8> },
    Icmp6 { ifindex: u32, dst: Ipv6Addr, payload: Vec<u8> },
}

impl Sent {
    pub fn payload(&self) -> &[u8] {
        match self {
            Sent::Raw { payload, .. }
            | Sent::Udp { payload, .. }
            | Sent::Udp6 { payload, .. }
            | Sent::Icmp6 { payload, .. } => payload,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeTransport {
    pub sent: Vec<Sent>,
    pub raw_open: Vec<u32>,
    pub udp_open: Vec<(u32, Ipv4Addr)>,
    /// Error injected into the next raw send, if any.
    pub raw_error: Option<i32>,
}

impl FakeTransport {
    pub fn last_payload(&self) -> &[u8] {
        self.sent.last().expect("something was sent").payload()
    }
}

impl Transport for FakeTransport {
    fn open_raw(&mut self, ifindex: u32) -> io::Result<()> {
        self.raw_open.push(ifindex);
        Ok(())
    }
    fn close_raw(&mut self, ifindex: u32) {
        self.raw_open.retain(|&i| i != ifindex);
    }
    fn open_udp(&mut self, ifindex: u32, bind: Ipv4Addr) -> io::Result<()> {
        self.udp_open.push((ifindex, bind));
        Ok(())
    }
    fn close_udp(&mut self, ifindex: u32) {
        self.udp_open.retain(|&(i, _)| i != ifindex);
    }
    fn send_raw(&mut self, ifindex: u32, payload: &[u8]) -> io::Result<()> {
        if let Some(errno) = self.raw_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.sent.push(Sent::Raw {
            ifindex,
            payload: payload.to_vec(),
        });
        Ok(())
    }
    fn send_udp(
        &mut self,
        ifindex: u32,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> io::Result<()> {
        self.sent.push(Sent::Udp {
            ifindex,
            src,
            dst,
            payload: payload.to_vec(),
        });
        Ok(())
    }
    fn send_udp6(&mut self, ifindex: u32, dst: Ipv6Addr, payload: &[u8]) -> io::Result<()> {
        self.sent.push(Sent::Udp6 {
            ifindex,
            dst,
            payload: payload.to_vec(),
        });
        Ok(())
    }
    fn send_icmp6(&mut self, ifindex: u32, dst: Ipv6Addr, payload: &[u8]) -> io::Result<()> {
        self.sent.push(Sent::Icmp6 {
            ifindex,
            dst,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeNetConfig {
    pub addrs4: Vec<(u32, Ipv4Addr, Ipv4Addr, Ipv4Addr)>,
    pub addrs6: Vec<(u32, Ipv6Addr, u8, u32, u32)>,
    pub routes4: HashMap<u32, Vec<Route4>>,
    pub routes6: HashMap<u32, Option<Ipv6Addr>>,
    pub carrier: HashMap<u32, bool>,
    pub link_local: HashMap<u32, Ipv6Addr>,
}

impl NetConfig for FakeNetConfig {
    fn add_address4(
        &mut self,
        ifindex: u32,
        addr: Ipv4Addr,
        mask: Ipv4Addr,
        broadcast: Ipv4Addr,
    ) -> io::Result<()> {
        self.addrs4.push((ifindex, addr, mask, broadcast));
        Ok(())
    }
    fn del_address4(&mut self, ifindex: u32, addr: Ipv4Addr) -> io::Result<()> {
        self.addrs4.retain(|&(i, a, _, _)| !(i == ifindex && a == addr));
        Ok(())
    }
    fn add_address6(
        &mut self,
        ifindex: u32,
        addr: Ipv6Addr,
        prefix_len: u8,
        preferred: u32,
        valid: u32,
    ) -> io::Result<()> {
        // refreshes replace the earlier entry
        self.addrs6.retain(|&(i, a, ..)| !(i == ifindex && a == addr));
        self.addrs6.push((ifindex, addr, prefix_len, preferred, valid));
        Ok(())
    }
    fn del_address6(&mut self, ifindex: u32, addr: Ipv6Addr) -> io::Result<()> {
        self.addrs6.retain(|&(i, a, ..)| !(i == ifindex && a == addr));
        Ok(())
    }
    fn set_routes4(&mut self, ifindex: u32, routes: &[Route4]) -> io::Result<()> {
        self.routes4.insert(ifindex, routes.to_vec());
        Ok(())
    }
    fn set_default_route6(&mut self, ifindex: u32, gateway: Option<Ipv6Addr>) -> io::Result<()> {
        self.routes6.insert(ifindex, gateway);
        Ok(())
    }
    fn carrier_up(&self, ifindex: u32) -> bool {
        *self.carrier.get(&ifindex).unwrap_or(&true)
    }
    fn link_local6(&self, ifindex: u32) -> Option<Ipv6Addr> {
        self.link_local.get(&ifindex).copied()
    }
}

#[derive(Debug, Default)]
pub struct RecordingHooks {
    pub runs: Vec<(String, Family, String)>,
}

impl HookRunner for RecordingHooks {
    fn run(&mut self, iface: &str, family: Family, reason: &str, _env: &[(String, String)]) {
        self.runs.push((iface.to_string(), family, reason.to_string()));
    }
}

/// Everything a test harness needs to drive an engine.
pub struct Harness {
    pub scheduler: ManualScheduler,
    pub transport: FakeTransport,
    pub netcfg: FakeNetConfig,
    pub store: MemStore,
    pub hooks: RecordingHooks,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            scheduler: ManualScheduler::new(),
            transport: FakeTransport::default(),
            netcfg: FakeNetConfig::default(),
            store: MemStore::default(),
            hooks: RecordingHooks::default(),
        }
    }

    pub fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            now: Instant::now(),
            scheduler: &mut self.scheduler,
            transport: &mut self.transport,
            netcfg: &mut self.netcfg,
            store: &mut self.store,
            hooks: &mut self.hooks,
        }
    }

    pub fn ctx_at(&mut self, now: Instant) -> Ctx<'_> {
        Ctx {
            now,
            scheduler: &mut self.scheduler,
            transport: &mut self.transport,
            netcfg: &mut self.netcfg,
            store: &mut self.store,
            hooks: &mut self.hooks,
        }
    }
}
