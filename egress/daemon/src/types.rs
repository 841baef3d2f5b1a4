//! Userspace type definitions
//!
//! ## Organization
//!
//! - **Kernel Types**: records shared with the eBPF program (from kntrl_common)
//! - **Decoding**: conversion of raw perf samples into those records

use bytes::{Buf, BufMut, BytesMut};
use std::{fmt, net::Ipv4Addr};
use thiserror::Error;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel eBPF program and userspace
    //!
    //! These are re-exported from the kntrl-common crate and must
    //! maintain binary compatibility with the eBPF program.

    pub use kntrl_common::constants;
    pub use kntrl_common::types::{Event, IP4Event};
}

pub use kernel::{Event, IP4Event};
use kntrl_common::TASK_COMM_LEN;

/// Raw sample could not be decoded into an [`IP4Event`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected record length {actual}, expected {expected} bytes")]
    Length { expected: usize, actual: usize },
}

/// Decode one little-endian IPv4 connect record
///
/// The sample must be exactly [`IP4Event::SIZE`] bytes long.
pub fn decode_ip4_event(raw: &[u8]) -> Result<IP4Event, DecodeError> {
    if raw.len() != IP4Event::SIZE {
        return Err(DecodeError::Length {
            expected: IP4Event::SIZE,
            actual: raw.len(),
        });
    }

    let mut buf = raw;
    let ts_us = buf.get_u64_le();
    let pid = buf.get_u32_le();
    let af = buf.get_u16_le();
    let mut task = [0u8; TASK_COMM_LEN];
    buf.copy_to_slice(&mut task);
    let daddr = buf.get_u32_le();
    let dport = buf.get_u16_le();

    Ok(IP4Event {
        event: Event {
            ts_us,
            pid,
            af,
            task,
        },
        daddr,
        dport,
    })
}

/// Encode a record in the kernel's wire layout
pub fn encode_ip4_event(event: &IP4Event) -> BytesMut {
    let header = event.event;
    let mut buf = BytesMut::with_capacity(IP4Event::SIZE);
    buf.put_u64_le(header.ts_us);
    buf.put_u32_le(header.pid);
    buf.put_u16_le(header.af);
    buf.put_slice(&header.task);
    buf.put_u32_le(event.daddr);
    buf.put_u16_le(event.dport);
    buf
}

/// Allow map key for an address
///
/// The kernel stores the network-order address as a plain `u32`; reading
/// the octets little-endian yields the same integer on a little-endian host.
pub fn addr_to_key(addr: Ipv4Addr) -> u32 {
    u32::from_le_bytes(addr.octets())
}

/// Inverse of [`addr_to_key`], also used for `IP4Event::daddr`
pub fn key_to_addr(key: u32) -> Ipv4Addr {
    Ipv4Addr::from(key.to_le_bytes())
}

/// Task name up to the first NUL
pub fn task_name(task: &[u8; TASK_COMM_LEN]) -> String {
    let nul = task.iter().position(|&c| c == 0).unwrap_or(task.len());
    String::from_utf8_lossy(&task[..nul]).into_owned()
}

/// Decoded view of an [`IP4Event`] with userspace-friendly types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub ts_us: u64,
    pub pid: u32,
    pub task: String,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

impl From<&IP4Event> for Connection {
    fn from(event: &IP4Event) -> Self {
        let header = event.event;
        Self {
            ts_us: header.ts_us,
            pid: header.pid,
            task: task_name(&header.task),
            daddr: key_to_addr(event.daddr),
            dport: event.dport,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{:<16} -> {}:{}", self.pid, self.task, self.daddr, self.dport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kntrl_common::AF_INET;

    fn sample_event() -> IP4Event {
        let mut task = [0u8; TASK_COMM_LEN];
        task[..4].copy_from_slice(b"curl");
        IP4Event {
            event: Event {
                ts_us: 1_234_567,
                pid: 4242,
                af: AF_INET,
                task,
            },
            daddr: addr_to_key(Ipv4Addr::new(140, 82, 112, 3)),
            dport: 443,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let event = sample_event();
        let raw = encode_ip4_event(&event);

        assert_eq!(raw.len(), IP4Event::SIZE);
        assert_eq!(decode_ip4_event(&raw).unwrap(), event);
    }

    #[test]
    fn test_wire_layout_is_little_endian() {
        let raw = encode_ip4_event(&sample_event());

        assert_eq!(&raw[0..8], &1_234_567u64.to_le_bytes());
        assert_eq!(&raw[8..12], &4242u32.to_le_bytes());
        assert_eq!(&raw[12..14], &AF_INET.to_le_bytes());
        assert_eq!(&raw[14..18], b"curl");
        assert_eq!(&raw[30..34], &[140, 82, 112, 3]);
        assert_eq!(&raw[34..36], &443u16.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let raw = encode_ip4_event(&sample_event());

        assert_eq!(
            decode_ip4_event(&raw[..35]),
            Err(DecodeError::Length {
                expected: 36,
                actual: 35
            })
        );

        let mut longer = raw.to_vec();
        longer.extend_from_slice(&[0, 0, 0, 0]);
        assert!(decode_ip4_event(&longer).is_err());
        assert!(decode_ip4_event(&[]).is_err());
    }

    #[test]
    fn test_connection_view() {
        let conn = Connection::from(&sample_event());

        assert_eq!(conn.task, "curl");
        assert_eq!(conn.daddr, Ipv4Addr::new(140, 82, 112, 3));
        assert_eq!(conn.dport, 443);
        assert_eq!(conn.to_string(), "[4242]curl             -> 140.82.112.3:443");
    }

    #[test]
    fn test_key_byte_order() {
        let addr = Ipv4Addr::new(127, 0, 0, 1);
        assert_eq!(addr_to_key(addr), 0x0100007f);
        assert_eq!(key_to_addr(0x0100007f), addr);
    }

    #[test]
    fn test_task_name_without_nul() {
        assert_eq!(task_name(b"abcdefghijklmnop"), "abcdefghijklmnop");
    }
}
