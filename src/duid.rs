//! DHCP Unique Identifier generation and caching.
//!
//! The DUID is the stable client identity for DHCPv6 (and for RFC 4361
//! DHCPv4 client ids). It is generated once, written to the lease store
//! under the `"duid"` key, and reused verbatim forever after so the client
//! identity survives restarts and link-layer address changes.

use crate::error::{NetleaseError, Result};
use crate::platform::{LeaseStore, LinkInfo};

/// Store key the cached DUID lives under.
pub const DUID_STORE_KEY: &str = "duid";

/// DUID type 1: link-layer address plus time.
pub const DUID_LLT: u16 = 1;
/// DUID type 3: link-layer address only.
pub const DUID_LL: u16 = 3;
/// DUID type 4: machine UUID.
pub const DUID_UUID: u16 = 4;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the DUID-LLT
/// time origin.
const DUID_TIME_EPOCH: u64 = 946_684_800;

const DUID_MIN_LEN: usize = 3;
const DUID_MAX_LEN: usize = 128;

/// Which flavor of DUID to generate when no cached one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidKind {
    LinkLayer,
    LinkLayerTime,
    /// Machine UUID, falling back to link-layer when the UUID is absent
    /// or all-zero.
    Uuid,
}

fn encode_ll(hwtype: u16, hwaddr: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + hwaddr.len());
    out.extend_from_slice(&DUID_LL.to_be_bytes());
    out.extend_from_slice(&hwtype.to_be_bytes());
    out.extend_from_slice(hwaddr);
    out
}

fn encode_llt(hwtype: u16, hwaddr: &[u8], now_unix: u64) -> Vec<u8> {
    let secs = now_unix.saturating_sub(DUID_TIME_EPOCH) as u32;
    let mut out = Vec::with_capacity(8 + hwaddr.len());
    out.extend_from_slice(&DUID_LLT.to_be_bytes());
    out.extend_from_slice(&hwtype.to_be_bytes());
    out.extend_from_slice(&secs.to_be_bytes());
    out.extend_from_slice(hwaddr);
    out
}

fn encode_uuid(uuid: [u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend_from_slice(&DUID_UUID.to_be_bytes());
    out.extend_from_slice(&uuid);
    out
}

/// Pick the link whose address anchors the identity: the interface itself
/// when its address is stable, otherwise the first sibling with a stable
/// address. Pseudo-interfaces must never yield an unstable identity.
fn identity_link<'a>(links: &'a [LinkInfo]) -> Option<&'a LinkInfo> {
    links.iter().find(|l| l.has_stable_address())
}

/// Load the cached DUID, or generate one of `kind`, cache it, and return it.
///
/// `links` lists the starting interface first, then its siblings; the first
/// stable link-layer address found is used. `machine_uuid` feeds the UUID
/// flavor and is rejected when all-zero.
pub fn ensure_duid(
    store: &mut dyn LeaseStore,
    kind: DuidKind,
    links: &[LinkInfo],
    machine_uuid: Option<[u8; 16]>,
    now_unix: u64,
) -> Result<Vec<u8>> {
    if let Some(cached) = store
        .load(DUID_STORE_KEY)
        .map_err(|e| NetleaseError::store_error("load", DUID_STORE_KEY, e))?
    {
        if (DUID_MIN_LEN..=DUID_MAX_LEN).contains(&cached.len()) {
            return Ok(cached);
        }
        log::warn!(
            "Cached DUID has invalid length {}, regenerating",
            cached.len()
        );
    }

    let duid = match kind {
        DuidKind::Uuid => match machine_uuid {
            Some(uuid) if uuid.iter().any(|&b| b != 0) => encode_uuid(uuid),
            _ => {
                log::debug!("No usable machine UUID, falling back to link-layer DUID");
                let link = identity_link(links).ok_or_else(|| NetleaseError::DuidError {
                    operation: "generate".to_string(),
                    reason: "no interface with a stable link-layer address".to_string(),
                })?;
                encode_llt(link.hwtype, &link.hwaddr, now_unix)
            }
        },
        DuidKind::LinkLayerTime => {
            let link = identity_link(links).ok_or_else(|| NetleaseError::DuidError {
                operation: "generate".to_string(),
                reason: "no interface with a stable link-layer address".to_string(),
            })?;
            encode_llt(link.hwtype, &link.hwaddr, now_unix)
        }
        DuidKind::LinkLayer => {
            let link = identity_link(links).ok_or_else(|| NetleaseError::DuidError {
                operation: "generate".to_string(),
                reason: "no interface with a stable link-layer address".to_string(),
            })?;
            encode_ll(link.hwtype, &link.hwaddr)
        }
    };

    store
        .save(DUID_STORE_KEY, &duid)
        .map_err(|e| NetleaseError::store_error("save", DUID_STORE_KEY, e))?;
    log::info!("Generated DUID ({} bytes)", duid.len());
    Ok(duid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemStore;

    fn eth() -> LinkInfo {
        LinkInfo {
            hwtype: 1,
            hwaddr: vec![0x02, 0x00, 0x5e, 0x10, 0x20, 0x30],
            metric: 0,
            mtu: 1500,
        }
    }

    fn lo() -> LinkInfo {
        LinkInfo {
            hwtype: 772,
            hwaddr: vec![0; 6],
            metric: 0,
            mtu: 65536,
        }
    }

    #[test]
    fn test_llt_layout() {
        let mut store = MemStore::default();
        let duid = ensure_duid(
            &mut store,
            DuidKind::LinkLayerTime,
            &[eth()],
            None,
            DUID_TIME_EPOCH + 5,
        )
        .unwrap();
        assert_eq!(&duid[0..2], &[0, 1]);
        assert_eq!(&duid[2..4], &[0, 1]);
        assert_eq!(&duid[4..8], &5u32.to_be_bytes());
        assert_eq!(&duid[8..], &eth().hwaddr[..]);
    }

    #[test]
    fn test_cached_duid_wins_over_regeneration() {
        let mut store = MemStore::default();
        let first = ensure_duid(&mut store, DuidKind::Uuid, &[eth()], Some([7; 16]), 0).unwrap();
        // different inputs, same identity
        let second =
            ensure_duid(&mut store, DuidKind::LinkLayer, &[eth()], None, 12345).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_zero_uuid_rejected() {
        let mut store = MemStore::default();
        let duid =
            ensure_duid(&mut store, DuidKind::Uuid, &[eth()], Some([0; 16]), 1000).unwrap();
        assert_eq!(&duid[0..2], &DUID_LLT.to_be_bytes());
    }

    #[test]
    fn test_pseudo_interface_uses_sibling() {
        let mut store = MemStore::default();
        let duid =
            ensure_duid(&mut store, DuidKind::LinkLayer, &[lo(), eth()], None, 0).unwrap();
        assert_eq!(&duid[4..], &eth().hwaddr[..]);
    }

    #[test]
    fn test_no_stable_link_fails() {
        let mut store = MemStore::default();
        assert!(ensure_duid(&mut store, DuidKind::LinkLayer, &[lo()], None, 0).is_err());
    }
}
