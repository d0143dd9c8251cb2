//! Message authentication: the token protocol.
//!
//! A fixed shared token travels in the authentication option (DHCPv4 code
//! 90, DHCPv6 code 11) with a monotonically increasing replay counter.
//! The payload layout is protocol (1), algorithm (1), replay-detection
//! method (1), replay value (8), then the token bytes.
//!
//! The option is written last and its payload is filled in at send time,
//! after the rest of the message is final, so the replay counter covers
//! the transmission rather than the build.

use crate::error::{NetleaseError, Result};

const PROTO_TOKEN: u8 = 0;
const ALG_NONE: u8 = 0;
const RDM_MONOTONIC: u8 = 0;

/// Fixed-header bytes ahead of the token.
pub const AUTH_FIXED_LEN: usize = 3 + 8;

/// Token-protocol authenticator state for one interface/family.
#[derive(Debug, Clone)]
pub struct TokenAuth {
    token: Vec<u8>,
    /// Highest replay value accepted from the peer.
    last_rx: Option<u64>,
    /// Last replay value we sent.
    last_tx: u64,
}

impl TokenAuth {
    pub fn new(token: Vec<u8>) -> Self {
        Self {
            token,
            last_rx: None,
            last_tx: 0,
        }
    }

    /// Wire size of the authentication payload.
    pub fn payload_len(&self) -> usize {
        AUTH_FIXED_LEN + self.token.len()
    }

    /// Fill `out` (exactly `payload_len` bytes) at send time.
    /// `replay` must not move backwards between calls; wall-clock seconds
    /// are the usual source.
    pub fn fill(&mut self, out: &mut [u8], replay: u64) -> Result<()> {
        if out.len() != self.payload_len() {
            return Err(NetleaseError::OptionTooLong {
                code: 90,
                len: out.len(),
            });
        }
        let replay = replay.max(self.last_tx.saturating_add(1));
        self.last_tx = replay;
        out[0] = PROTO_TOKEN;
        out[1] = ALG_NONE;
        out[2] = RDM_MONOTONIC;
        out[3..11].copy_from_slice(&replay.to_be_bytes());
        out[11..].copy_from_slice(&self.token);
        Ok(())
    }

    /// Validate a received authentication payload: token match plus replay
    /// monotonicity. `iface` is only for the error message.
    pub fn validate(&mut self, payload: &[u8], iface: &str) -> Result<()> {
        if payload.len() < AUTH_FIXED_LEN {
            return Err(NetleaseError::AuthFailed {
                interface: iface.to_string(),
                reason: format!("authentication option too short ({} bytes)", payload.len()),
            });
        }
        if payload[0] != PROTO_TOKEN {
            return Err(NetleaseError::AuthFailed {
                interface: iface.to_string(),
                reason: format!("unsupported authentication protocol {}", payload[0]),
            });
        }
        let mut replay_bytes = [0u8; 8];
        replay_bytes.copy_from_slice(&payload[3..11]);
        let replay = u64::from_be_bytes(replay_bytes);
        if let Some(last) = self.last_rx {
            if replay < last {
                return Err(NetleaseError::AuthFailed {
                    interface: iface.to_string(),
                    reason: format!("replay value {replay} went backwards (last {last})"),
                });
            }
        }
        if payload[AUTH_FIXED_LEN..] != self.token[..] {
            return Err(NetleaseError::AuthFailed {
                interface: iface.to_string(),
                reason: "token mismatch".to_string(),
            });
        }
        self.last_rx = Some(replay);
        Ok(())
    }

    /// Validation for a persisted lease being re-read: token must match
    /// but the replay window is not advanced (the message is historical).
    pub fn validate_stored(&self, payload: &[u8], iface: &str) -> Result<()> {
        let mut probe = Self::new(self.token.clone());
        probe.validate(payload, iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_then_validate() {
        let mut tx = TokenAuth::new(b"sesame".to_vec());
        let mut rx = TokenAuth::new(b"sesame".to_vec());
        let mut buf = vec![0u8; tx.payload_len()];
        tx.fill(&mut buf, 1000).unwrap();
        rx.validate(&buf, "eth0").unwrap();
    }

    #[test]
    fn test_token_mismatch_rejected() {
        let mut tx = TokenAuth::new(b"sesame".to_vec());
        let mut rx = TokenAuth::new(b"other".to_vec());
        let mut buf = vec![0u8; tx.payload_len()];
        tx.fill(&mut buf, 1).unwrap();
        assert!(rx.validate(&buf, "eth0").is_err());
    }

    #[test]
    fn test_replay_going_backwards_rejected() {
        let mut tx = TokenAuth::new(b"t".to_vec());
        let mut rx = TokenAuth::new(b"t".to_vec());
        let mut a = vec![0u8; tx.payload_len()];
        tx.fill(&mut a, 50).unwrap();
        rx.validate(&a, "eth0").unwrap();
        // hand-build an older replay value with the right token
        let mut b = a.clone();
        b[3..11].copy_from_slice(&10u64.to_be_bytes());
        assert!(rx.validate(&b, "eth0").is_err());
    }

    #[test]
    fn test_tx_replay_is_monotonic_even_if_clock_steps_back() {
        let mut tx = TokenAuth::new(b"t".to_vec());
        let mut a = vec![0u8; tx.payload_len()];
        tx.fill(&mut a, 100).unwrap();
        tx.fill(&mut a, 50).unwrap();
        let replay = u64::from_be_bytes(a[3..11].try_into().unwrap());
        assert!(replay > 100);
    }

    #[test]
    fn test_stored_validation_ignores_replay_window() {
        let mut tx = TokenAuth::new(b"t".to_vec());
        let mut rx = TokenAuth::new(b"t".to_vec());
        let mut a = vec![0u8; tx.payload_len()];
        tx.fill(&mut a, 7).unwrap();
        let mut b = vec![0u8; tx.payload_len()];
        tx.fill(&mut b, 9).unwrap();
        rx.validate(&b, "eth0").unwrap();
        // `a` is older than the live window but fine as a stored lease
        assert!(rx.validate(&a, "eth0").is_err());
        rx.validate_stored(&a, "eth0").unwrap();
    }
}
