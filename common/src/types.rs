//! Shared data structures between kernel and userspace
//!
//! The kernel program emits these records packed, little-endian. The
//! structs are `repr(C, packed)` so their size matches the wire size.

use crate::constants::TASK_COMM_LEN;

/// Common header of every connection event
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Monotonic timestamp in microseconds
    pub ts_us: u64,
    /// Process ID that opened the connection
    pub pid: u32,
    /// Address family (AF_INET for [`IP4Event`])
    pub af: u16,
    /// Task name, NUL padded
    pub task: [u8; TASK_COMM_LEN],
}

/// Socket connect event for AF_INET
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IP4Event {
    /// Common header
    pub event: Event,
    /// Destination address as read from the kernel's `__be32`
    pub daddr: u32,
    /// Destination port
    pub dport: u16,
}

impl IP4Event {
    /// Exact size of one record on the wire
    pub const SIZE: usize = core::mem::size_of::<IP4Event>();
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<Event>() == 30);
    assert!(core::mem::size_of::<IP4Event>() == 36);
};
