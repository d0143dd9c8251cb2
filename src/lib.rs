//! # netlease
//!
//! Host-side network configuration client: sans-io protocol engines for
//! DHCPv4 (RFC 2131/2132), DHCPv6 (RFC 8415) and IPv6 Neighbor Discovery
//! (RFC 4861/4862).
//!
//! ## Features
//!
//! - **DHCPv4**: DISCOVER through BOUND with reboot, renew/rebind, NAK
//!   backoff, BOOTP fallback, classless static routes, DECLINE on duplicate
//!   addresses, static and inform-only modes
//! - **DHCPv6**: stateful IA_NA/IA_TA, prefix delegation with downstream
//!   fan-out, CONFIRM after restart, RECONFIGURE, rapid commit, stateless
//!   INFORMATION-REQUEST
//! - **IPv6 ND**: router solicitation/advertisement handling, SLAAC with
//!   optional temporary addresses, router ranking, M/O handoff to DHCPv6
//! - **Identity**: persistent DUID generation (RFC 8415 §11) shared across
//!   both DHCP families
//!
//! ## Design
//!
//! The engines hold protocol state per interface and nothing else. Sockets,
//! kernel address/route changes, lease files, timers and hook scripts sit
//! behind the traits in [`platform`], bundled into a [`platform::Ctx`] that
//! every operation receives. Embedders drive the engines from their own
//! event loop: feed inbound datagrams in, dispatch expired timers back, and
//! implement the collaborator traits however the deployment needs.
//!
//! ## Usage
//!
//! ```no_run
//! use netlease::{Dhcp4Client, Dhcp4Config, IfaceId, LinkInfo};
//!
//! # fn run(mut ctx: netlease::Ctx<'_>) -> netlease::Result<()> {
//! let mut dhcp = Dhcp4Client::new(None);
//! let iface = IfaceId::new(2, "eth0");
//! let link = LinkInfo {
//!     hwtype: 1,
//!     hwaddr: vec![0x02, 0x00, 0x5e, 0x10, 0x20, 0x30],
//!     metric: 0,
//!     mtu: 1500,
//! };
//! dhcp.start(&mut ctx, iface, link, Dhcp4Config::default())?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dhcp4;
pub mod dhcp6;
pub mod duid;
pub mod error;
pub mod ipv6nd;
pub mod logging;
pub mod options;
pub mod platform;
pub mod scheduler;

#[cfg(test)]
mod testutil;

pub use config::{ClientIdConfig, Dhcp4Config, Dhcp4Mode, Dhcp6Config, IaKind, IaSpec, NdConfig, PdAssignment};
pub use dhcp4::{Dhcp4Client, Dhcp4State, Lease};
pub use dhcp6::{Dhcp6Client, Dhcp6State, Lease6};
pub use duid::{ensure_duid, DuidKind};
pub use error::{NetleaseError, Result};
pub use ipv6nd::{DhcpHint, NdEngine, RouterRecord};
pub use platform::{
    Ctx, Family, HookRunner, IfaceId, LeaseStore, LinkInfo, NetConfig, Route4, Transport,
};
pub use scheduler::{ManualScheduler, Proto, Scheduler, TimerKind, TimerToken};
