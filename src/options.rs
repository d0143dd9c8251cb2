//! Binary option codecs shared by the DHCPv4, DHCPv6 and ND engines.
//!
//! Three TLV dialects live here: the 1-byte-code/1-byte-length DHCPv4
//! options (with pad, end, option overload and long-option concatenation),
//! the 2-byte-code/2-byte-length network-order DHCPv6 options (nested
//! identically inside IA containers), and the 8-byte-unit ICMPv6 ND
//! options. Plus RFC 1035 domain-name decoding with compression, used by
//! the domain-search and DNSSL options.
//!
//! Parsing never panics on hostile input: any length overrun rejects the
//! buffer with an error the caller turns into log-and-drop.

use crate::error::{NetleaseError, Result};

/// DHCPv4 pad option.
pub const DHO_PAD: u8 = 0;
/// DHCPv4 option overload (RFC 2131 §4.1).
pub const DHO_OPTIONSOVERLOADED: u8 = 52;
/// DHCPv4 end option.
pub const DHO_END: u8 = 255;

const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

/// A decoded option occurrence. Repeated codes are kept as separate
/// occurrences; [`find4`]/[`find6`] concatenate on lookup (RFC 3396).
pub type RawOption4 = (u8, Vec<u8>);
pub type RawOption6 = (u16, Vec<u8>);
pub type RawOptionNd = (u8, Vec<u8>);

fn scan_dhcp4_area(area: &[u8], out: &mut Vec<RawOption4>, overload: &mut u8) -> Result<()> {
    let mut off = 0usize;
    while off < area.len() {
        let code = area[off];
        if code == DHO_PAD {
            off += 1;
            continue;
        }
        if code == DHO_END {
            return Ok(());
        }
        if off + 2 > area.len() {
            return Err(NetleaseError::Truncated {
                what: "DHCPv4 option header",
                need: off + 2,
                have: area.len(),
            });
        }
        let len = area[off + 1] as usize;
        if off + 2 + len > area.len() {
            return Err(NetleaseError::Truncated {
                what: "DHCPv4 option payload",
                need: off + 2 + len,
                have: area.len(),
            });
        }
        let payload = area[off + 2..off + 2 + len].to_vec();
        if code == DHO_OPTIONSOVERLOADED && len == 1 {
            *overload |= payload[0];
        } else {
            out.push((code, payload));
        }
        off += 2 + len;
    }
    Ok(())
}

/// Parse the DHCPv4 option area, following the option-overload redirection
/// into the `file` and `sname` header fields when option 52 asks for it.
/// `area` starts after the magic cookie.
pub fn parse_dhcp4_options(area: &[u8], file: &[u8], sname: &[u8]) -> Result<Vec<RawOption4>> {
    let mut out = Vec::new();
    let mut overload = 0u8;
    scan_dhcp4_area(area, &mut out, &mut overload)?;
    // Overload declarations inside overloaded areas are ignored.
    let mut nested = 0u8;
    if overload & OVERLOAD_FILE != 0 {
        scan_dhcp4_area(file, &mut out, &mut nested)?;
    }
    if overload & OVERLOAD_SNAME != 0 {
        scan_dhcp4_area(sname, &mut out, &mut nested)?;
    }
    Ok(out)
}

/// Concatenated payload of every occurrence of `code`, or None if absent.
pub fn find4(opts: &[RawOption4], code: u8) -> Option<Vec<u8>> {
    let mut found = false;
    let mut out = Vec::new();
    for (c, payload) in opts {
        if *c == code {
            found = true;
            out.extend_from_slice(payload);
        }
    }
    found.then_some(out)
}

pub fn has4(opts: &[RawOption4], code: u8) -> bool {
    opts.iter().any(|(c, _)| *c == code)
}

/// Writer-side error: the option area is out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSpace {
    pub limit: usize,
    pub needed: usize,
}

/// Bounds-checked DHCPv4 option writer.
///
/// `limit` is the room left for options (negotiated maximum message size
/// minus the fixed header and cookie); one byte is always reserved for the
/// end option. Payloads longer than 255 bytes are split into consecutive
/// occurrences of the same code (RFC 3396).
#[derive(Debug)]
pub struct Writer4 {
    buf: Vec<u8>,
    limit: usize,
}

impl Writer4 {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(1024)),
            limit,
        }
    }

    fn room(&self) -> usize {
        // end option byte stays reserved
        self.limit.saturating_sub(self.buf.len() + 1)
    }

    pub fn put(&mut self, code: u8, payload: &[u8]) -> std::result::Result<(), NoSpace> {
        let chunks = if payload.is_empty() {
            1
        } else {
            payload.len().div_ceil(255)
        };
        let needed = payload.len() + 2 * chunks;
        if needed > self.room() {
            return Err(NoSpace {
                limit: self.limit,
                needed: self.buf.len() + 1 + needed,
            });
        }
        if payload.is_empty() {
            self.buf.push(code);
            self.buf.push(0);
            return Ok(());
        }
        for chunk in payload.chunks(255) {
            self.buf.push(code);
            self.buf.push(chunk.len() as u8);
            self.buf.extend_from_slice(chunk);
        }
        Ok(())
    }

    /// Current offset of the next byte to be written; used to locate
    /// payloads that are finalized at send time.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(DHO_END);
        self.buf
    }
}

/// Parse a flat DHCPv6 option area (also used for nested IA payloads).
pub fn parse_dhcp6_options(buf: &[u8]) -> Result<Vec<RawOption6>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        if off + 4 > buf.len() {
            return Err(NetleaseError::Truncated {
                what: "DHCPv6 option header",
                need: off + 4,
                have: buf.len(),
            });
        }
        let code = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let len = u16::from_be_bytes([buf[off + 2], buf[off + 3]]) as usize;
        if off + 4 + len > buf.len() {
            return Err(NetleaseError::Truncated {
                what: "DHCPv6 option payload",
                need: off + 4 + len,
                have: buf.len(),
            });
        }
        out.push((code, buf[off + 4..off + 4 + len].to_vec()));
        off += 4 + len;
    }
    Ok(out)
}

/// First occurrence of `code` in a DHCPv6 option list.
pub fn find6(opts: &[RawOption6], code: u16) -> Option<&[u8]> {
    opts.iter()
        .find(|(c, _)| *c == code)
        .map(|(_, payload)| payload.as_slice())
}

/// DHCPv6 option writer. No wire-mandated size cap; capacity comes from
/// the caller's sizing pass so the fill pass never reallocates.
#[derive(Debug)]
pub struct Writer6 {
    buf: Vec<u8>,
}

impl Writer6 {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put(&mut self, code: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > u16::MAX as usize {
            return Err(NetleaseError::OptionTooLong {
                code,
                len: payload.len(),
            });
        }
        self.buf.extend_from_slice(&code.to_be_bytes());
        self.buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Wire size one `put` of this payload will occupy.
    pub fn sizeof(payload_len: usize) -> usize {
        4 + payload_len
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Parse ICMPv6 ND options: 1-byte type, 1-byte length in 8-byte units
/// covering the header. Zero length is malformed and rejects the buffer.
/// The returned payload excludes the 2 header bytes.
pub fn parse_nd_options(buf: &[u8]) -> Result<Vec<RawOptionNd>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        if off + 2 > buf.len() {
            return Err(NetleaseError::Truncated {
                what: "ND option header",
                need: off + 2,
                have: buf.len(),
            });
        }
        let typ = buf[off];
        let units = buf[off + 1] as usize;
        if units == 0 {
            return Err(NetleaseError::Truncated {
                what: "ND option with zero length",
                need: off + 8,
                have: off,
            });
        }
        let len = units * 8;
        if off + len > buf.len() {
            return Err(NetleaseError::Truncated {
                what: "ND option payload",
                need: off + len,
                have: buf.len(),
            });
        }
        out.push((typ, buf[off + 2..off + len].to_vec()));
        off += len;
    }
    Ok(out)
}

/// Encode one ND option, padding the payload to an 8-byte boundary.
pub fn encode_nd_option(typ: u8, payload: &[u8]) -> Vec<u8> {
    let total = (2 + payload.len()).div_ceil(8) * 8;
    let mut out = Vec::with_capacity(total);
    out.push(typ);
    out.push((total / 8) as u8);
    out.extend_from_slice(payload);
    out.resize(total, 0);
    out
}

const NAME_POINTER_MASK: u8 = 0xc0;
const MAX_NAME_LEN: usize = 255;

fn decode_one_name(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut off = start;
    let mut next = None; // resume offset after the first pointer
    let mut jumps = 0usize;
    loop {
        if off >= buf.len() {
            return Err(NetleaseError::Truncated {
                what: "domain name label",
                need: off + 1,
                have: buf.len(),
            });
        }
        let len = buf[off];
        if len == 0 {
            off += 1;
            break;
        }
        if len & NAME_POINTER_MASK == NAME_POINTER_MASK {
            if off + 2 > buf.len() {
                return Err(NetleaseError::Truncated {
                    what: "domain name compression pointer",
                    need: off + 2,
                    have: buf.len(),
                });
            }
            let target = (((len & !NAME_POINTER_MASK) as usize) << 8) | buf[off + 1] as usize;
            // Pointers must go backwards; a bounded jump count breaks any
            // remaining cycle a hostile encoder could build.
            if target >= off || jumps >= 32 {
                return Err(NetleaseError::Truncated {
                    what: "domain name compression loop",
                    need: target,
                    have: off,
                });
            }
            if next.is_none() {
                next = Some(off + 2);
            }
            off = target;
            jumps += 1;
            continue;
        }
        if len & NAME_POINTER_MASK != 0 {
            return Err(NetleaseError::Truncated {
                what: "domain name label type",
                need: off,
                have: buf.len(),
            });
        }
        let len = len as usize;
        if off + 1 + len > buf.len() {
            return Err(NetleaseError::Truncated {
                what: "domain name label payload",
                need: off + 1 + len,
                have: buf.len(),
            });
        }
        if !name.is_empty() {
            name.push('.');
        }
        for &b in &buf[off + 1..off + 1 + len] {
            // Printable subset only; anything else gets escaped out.
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                name.push(b as char);
            } else {
                name.push_str(&format!("\\{:03o}", b));
            }
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NetleaseError::Truncated {
                what: "domain name too long",
                need: name.len(),
                have: MAX_NAME_LEN,
            });
        }
        off += 1 + len;
    }
    Ok((name, next.unwrap_or(off)))
}

/// Decode a concatenation of RFC 1035 domain names with compression, as
/// carried by the domain-search (119), DNSSL (ND 31) and DHCPv6 domain
/// options.
pub fn decode_domain_names(buf: &[u8]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        let (name, next) = decode_one_name(buf, off)?;
        if !name.is_empty() {
            names.push(name);
        }
        off = next;
    }
    Ok(names)
}

/// Encode a single domain name without compression (client-sent FQDNs).
pub fn encode_domain_name(name: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(NetleaseError::OptionTooLong {
                code: 0,
                len: label.len(),
            });
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN {
        return Err(NetleaseError::OptionTooLong {
            code: 0,
            len: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_option_roundtrip() {
        // For all valid single options, decode then re-encode yields the
        // same bytes. Exercise a representative spread of lengths.
        for len in [0usize, 1, 4, 128, 255] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut wire = vec![42u8, len as u8];
            wire.extend_from_slice(&payload);
            wire.push(DHO_END);
            let opts = parse_dhcp4_options(&wire, &[], &[]).unwrap();
            assert_eq!(opts, vec![(42u8, payload.clone())]);
            let mut w = Writer4::new(600);
            w.put(42, &payload).unwrap();
            assert_eq!(w.finish(), wire);
        }
    }

    #[test]
    fn test_pad_and_end_handling() {
        let wire = [0u8, 0, 53, 1, 5, 0, 255, 99, 4, 1, 2, 3, 4];
        let opts = parse_dhcp4_options(&wire, &[], &[]).unwrap();
        // Everything after END is ignored, pads skipped.
        assert_eq!(opts, vec![(53u8, vec![5])]);
    }

    #[test]
    fn test_truncated_option_rejected() {
        assert!(parse_dhcp4_options(&[53, 4, 1], &[], &[]).is_err());
        assert!(parse_dhcp4_options(&[53], &[], &[]).is_err());
    }

    #[test]
    fn test_overload_redirects_into_file_and_sname() {
        let area = [52u8, 1, 3, 255];
        let file = [12u8, 2, b'h', b'i', 255];
        let sname = [15u8, 3, b'l', b'a', b'n', 255];
        let opts = parse_dhcp4_options(&area, &file, &sname).unwrap();
        assert_eq!(find4(&opts, 12), Some(b"hi".to_vec()));
        assert_eq!(find4(&opts, 15), Some(b"lan".to_vec()));
        // the overload option itself is not surfaced
        assert!(!has4(&opts, 52));
    }

    #[test]
    fn test_long_option_concatenation() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
        let mut w = Writer4::new(600);
        w.put(121, &payload).unwrap();
        let wire = w.finish();
        let opts = parse_dhcp4_options(&wire, &[], &[]).unwrap();
        assert_eq!(opts.len(), 2);
        assert_eq!(find4(&opts, 121), Some(payload));
    }

    #[test]
    fn test_writer_bounds_check() {
        let mut w = Writer4::new(10);
        assert!(w.put(53, &[5]).is_ok());
        let err = w.put(12, &[b'x'; 16]).unwrap_err();
        assert_eq!(err.limit, 10);
        // failed put leaves the writer usable
        assert!(w.put(55, &[1]).is_ok());
    }

    #[test]
    fn test_dhcp6_roundtrip_and_truncation() {
        let mut w = Writer6::with_capacity(64);
        w.put(1, &[0, 1, 0, 1, 1, 2, 3, 4]).unwrap();
        w.put(8, &[0, 0]).unwrap();
        let wire = w.finish();
        let opts = parse_dhcp6_options(&wire).unwrap();
        assert_eq!(find6(&opts, 1), Some(&[0u8, 1, 0, 1, 1, 2, 3, 4][..]));
        assert_eq!(find6(&opts, 8), Some(&[0u8, 0][..]));
        assert!(parse_dhcp6_options(&wire[..wire.len() - 1]).is_err());
        assert!(parse_dhcp6_options(&[0, 1, 0]).is_err());
    }

    #[test]
    fn test_nd_option_zero_length_rejected() {
        assert!(parse_nd_options(&[1, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_nd_option_roundtrip() {
        let slla = encode_nd_option(1, &[2, 0, 0x5e, 0, 0, 1]);
        assert_eq!(slla.len(), 8);
        let opts = parse_nd_options(&slla).unwrap();
        assert_eq!(opts, vec![(1u8, vec![2, 0, 0x5e, 0, 0, 1])]);
    }

    #[test]
    fn test_domain_names_with_compression() {
        // "example.com" then "sub" + pointer to offset 0
        let mut buf = vec![
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
        ];
        buf.extend_from_slice(&[3, b's', b'u', b'b', 0xc0, 0]);
        let names = decode_domain_names(&buf).unwrap();
        assert_eq!(names, vec!["example.com", "sub.example.com"]);
    }

    #[test]
    fn test_domain_name_forward_pointer_rejected() {
        // pointer to itself
        assert!(decode_domain_names(&[0xc0, 0]).is_err());
    }

    #[test]
    fn test_encode_domain_name() {
        let wire = encode_domain_name("host.lan").unwrap();
        assert_eq!(wire, vec![4, b'h', b'o', b's', b't', 3, b'l', b'a', b'n', 0]);
        let names = decode_domain_names(&wire).unwrap();
        assert_eq!(names, vec!["host.lan"]);
    }
}
