//! Per-interface engine configuration.
//!
//! One configuration struct per engine, serde-derived so embedders can load
//! them from their own config files. Defaults follow common client
//! behavior: request the basic addressing options, probe duplicates, no
//! test mode.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// How the DHCPv4 client identifier (option 61) is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientIdConfig {
    /// Hardware type byte followed by the link-layer address.
    Hardware,
    /// Explicit bytes from configuration, sent verbatim.
    Custom(Vec<u8>),
    /// RFC 4361: 0xff, a 4-byte IAID, then the DUID.
    Duid { iaid: [u8; 4] },
}

/// DHCPv4 operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dhcp4Mode {
    /// Normal lease negotiation.
    Auto,
    /// Fixed address; no server exchange beyond an optional INFORM.
    Static {
        address: Ipv4Addr,
        mask: Ipv4Addr,
    },
    /// Address obtained elsewhere; only options are requested.
    Inform { address: Ipv4Addr },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp4Config {
    pub client_id: ClientIdConfig,
    pub mode: Dhcp4Mode,
    /// Options asked for in the parameter request list.
    pub request: BTreeSet<u8>,
    /// Options masked out of the parameter request list.
    pub no_request: BTreeSet<u8>,
    /// Options that must be present in a reply for it to be accepted.
    pub require: BTreeSet<u8>,
    /// Options whose presence in a reply causes outright rejection.
    pub reject: BTreeSet<u8>,
    /// If non-empty, only these servers are accepted.
    pub allow_servers: Vec<Ipv4Addr>,
    pub deny_servers: Vec<Ipv4Addr>,
    /// Reject NAKs that do not carry a server identifier.
    pub require_server_id: bool,
    /// Speak plain BOOTP: no DHCP options beyond the cookie.
    pub bootp_only: bool,
    pub rapid_commit: bool,
    pub hostname: Option<String>,
    /// RFC 4702 FQDN; mutually exclusive with `hostname` on the wire
    /// (FQDN wins when both are set).
    pub fqdn: Option<String>,
    pub user_class: Option<Vec<u8>>,
    pub vendor_class_id: Option<String>,
    /// Raw option 43 payload.
    pub vendor_encapsulated: Option<Vec<u8>>,
    /// Raw option 124 payload.
    pub vivco: Option<Vec<u8>>,
    pub mud_url: Option<String>,
    /// Address to ask for in the first DISCOVER.
    pub request_address: Option<Ipv4Addr>,
    pub requested_lease_secs: Option<u32>,
    /// Maximum DHCP message size we negotiate and enforce when building.
    pub max_message_size: u16,
    /// Run duplicate-address detection before binding (PROBE state).
    pub arp_probe: bool,
    /// Randomize the first transmission by up to a second.
    pub initial_delay: bool,
    /// Keep an expired lease alive instead of dropping it.
    pub extend_lease_on_expiry: bool,
    /// Only negotiate while the carrier is up.
    pub carrier_only: bool,
    /// Exercise the exchange but never commit addresses or files.
    pub test_mode: bool,
    /// Shared token for the message-authentication option.
    pub auth_token: Option<Vec<u8>>,
    /// Mask the classless-static-routes option so simpler route options
    /// are used instead.
    pub no_csr: bool,
    /// This interface is the only protocol family the process serves; a
    /// static/inform duplicate-address failure then asks for process exit.
    pub sole_protocol: bool,
}

impl Default for Dhcp4Config {
    fn default() -> Self {
        // Subnet mask, routers, DNS, host/domain name, broadcast, static
        // routes, lease timers, CSR, domain search.
        let request: BTreeSet<u8> =
            [1u8, 3, 6, 12, 15, 28, 33, 51, 54, 58, 59, 119, 121].into();
        Self {
            client_id: ClientIdConfig::Hardware,
            mode: Dhcp4Mode::Auto,
            request,
            no_request: BTreeSet::new(),
            require: BTreeSet::new(),
            reject: BTreeSet::new(),
            allow_servers: Vec::new(),
            deny_servers: Vec::new(),
            require_server_id: false,
            bootp_only: false,
            rapid_commit: false,
            hostname: None,
            fqdn: None,
            user_class: None,
            vendor_class_id: None,
            vendor_encapsulated: None,
            vivco: None,
            mud_url: None,
            request_address: None,
            requested_lease_secs: None,
            max_message_size: 1472,
            arp_probe: true,
            initial_delay: true,
            extend_lease_on_expiry: false,
            carrier_only: false,
            test_mode: false,
            auth_token: None,
            no_csr: false,
            sole_protocol: false,
        }
    }
}

/// Kind of a DHCPv6 Identity Association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IaKind {
    /// Non-temporary addresses (IA_NA).
    Na,
    /// Temporary addresses (IA_TA).
    Ta,
    /// Delegated prefix (IA_PD).
    Pd,
}

/// A downstream assignment of part of a delegated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdAssignment {
    /// Interface that receives the derived prefix.
    pub ifindex: u32,
    /// Site-level aggregator id appended to the delegated prefix. With
    /// `prefix_len` 0 the id and length are chosen automatically from the
    /// interface index.
    pub sla_id: u32,
    /// Length of the derived prefix; 0 selects automatic sizing.
    pub prefix_len: u8,
}

/// One Identity Association this interface wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaSpec {
    pub kind: IaKind,
    pub iaid: [u8; 4],
    /// For IA_PD: where the delegated prefix gets carved up.
    pub assignments: Vec<PdAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dhcp6Config {
    pub ias: Vec<IaSpec>,
    /// Option request option contents.
    pub request: BTreeSet<u16>,
    pub rapid_commit: bool,
    /// INFORMATION-REQUEST only; no addresses.
    pub info_only: bool,
    pub fqdn: Option<String>,
    pub user_class: Option<Vec<u8>>,
    pub vendor_class: Option<Vec<u8>>,
    pub mud_url: Option<String>,
    pub reconfigure_accept: bool,
    pub auth_token: Option<Vec<u8>>,
    /// Reject unauthenticated RECONFIGURE instead of warning.
    pub auth_required: bool,
    /// On renew/rebind/confirm failure, extend lifetimes to infinity
    /// instead of tearing down.
    pub extend_lease_on_failure: bool,
    pub initial_delay: bool,
    pub test_mode: bool,
}

impl Default for Dhcp6Config {
    fn default() -> Self {
        // DNS servers, domain search list, SOL_MAX_RT, INF_MAX_RT.
        let request: BTreeSet<u16> = [23u16, 24, 82, 83].into();
        Self {
            ias: vec![IaSpec {
                kind: IaKind::Na,
                iaid: [0, 0, 0, 1],
                assignments: Vec::new(),
            }],
            request,
            rapid_commit: false,
            info_only: false,
            fqdn: None,
            user_class: None,
            vendor_class: None,
            mud_url: None,
            reconfigure_accept: false,
            auth_token: None,
            auth_required: false,
            extend_lease_on_failure: false,
            initial_delay: true,
            test_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdConfig {
    /// Send Router Solicitations on start.
    pub solicit: bool,
    /// Perform stateless address autoconfiguration from on-link prefixes.
    pub autoconf: bool,
    /// Also churn RFC 4941 temporary addresses for autoconf prefixes.
    pub temporary_addresses: bool,
    /// ND option types that must all be present for an RA to be kept.
    pub require: BTreeSet<u8>,
    /// ND option types whose presence discards the RA.
    pub reject: BTreeSet<u8>,
    /// Randomize the first solicitation by up to a second.
    pub initial_delay: bool,
    /// Refuse to report readiness until an RDNSS option has been seen.
    pub wait_for_dns: bool,
}

impl Default for NdConfig {
    fn default() -> Self {
        Self {
            solicit: true,
            autoconf: true,
            temporary_addresses: false,
            require: BTreeSet::new(),
            reject: BTreeSet::new(),
            initial_delay: true,
            wait_for_dns: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_list_is_sorted_and_basic() {
        let cfg = Dhcp4Config::default();
        assert!(cfg.request.contains(&1));
        assert!(cfg.request.contains(&3));
        assert!(cfg.request.contains(&121));
        // BTreeSet iteration order doubles as the PRL wire order.
        let v: Vec<u8> = cfg.request.iter().copied().collect();
        let mut sorted = v.clone();
        sorted.sort_unstable();
        assert_eq!(v, sorted);
    }

    #[test]
    fn test_default_ia_is_na() {
        let cfg = Dhcp6Config::default();
        assert_eq!(cfg.ias.len(), 1);
        assert_eq!(cfg.ias[0].kind, IaKind::Na);
    }

    #[test]
    fn test_configs_roundtrip_serde() {
        let cfg = Dhcp4Config {
            client_id: ClientIdConfig::Duid { iaid: [1, 2, 3, 4] },
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Dhcp4Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.client_id, cfg.client_id);
        assert_eq!(back.request, cfg.request);
    }
}
