//! Shared constants for the egress probe
//!
//! These names and values are fixed by the kernel program and must not
//! drift from it.

// ============================================================================
// BPF Map Names
// ============================================================================

/// Single-entry map holding the enforcement mode at key [`MODE_KEY`]
pub const MAP_MODE: &str = "mode_map";

/// Hash map of permitted IPv4 destinations (address key, presence value)
pub const MAP_ALLOW: &str = "allow_map";

/// Perf event array carrying connection-opened records
pub const MAP_IPV4_EVENTS: &str = "ipv4_events";

/// Perf event array carrying connection-closed records
pub const MAP_IPV4_CLOSED_EVENTS: &str = "ipv4_closed_events";

// ============================================================================
// Mode Codes (value stored in mode_map)
// ============================================================================

/// Key under which the mode value is stored
pub const MODE_KEY: u32 = 0;

/// Observe and log only
pub const MODE_MONITOR: u32 = 0;

/// Observe and let the kernel program enforce the allow-list
pub const MODE_TRACE: u32 = 1;

// ============================================================================
// Allow Map
// ============================================================================

/// Presence marker written for every allowed address
pub const ALLOW_PRESENT: u32 = 1;

/// Loopback, always allowed
pub const ALLOW_LOOPBACK: [u8; 4] = [127, 0, 0, 1];

/// Link-local instance metadata endpoint, always allowed
pub const ALLOW_LINK_LOCAL_METADATA: [u8; 4] = [169, 254, 169, 254];

/// Cloud (Azure wire server) metadata endpoint, always allowed
pub const ALLOW_CLOUD_METADATA: [u8; 4] = [168, 63, 129, 16];

// ============================================================================
// Event Streams
// ============================================================================

/// Default per-CPU perf buffer size in bytes
pub const PERF_BUFFER_BYTES: usize = 4096;

/// Length of the task name buffer (TASK_COMM_LEN)
pub const TASK_COMM_LEN: usize = 16;

/// AF_INET
pub const AF_INET: u16 = 2;

// ============================================================================
// Hook Points
// ============================================================================

/// Tracepoint category for the connect syscall hook
pub const TRACEPOINT_CATEGORY: &str = "syscalls";

/// Tracepoint name for the connect syscall hook
pub const TRACEPOINT_CONNECT: &str = "sys_enter_connect";

/// Root of the cgroup v2 hierarchy used for the egress hook
pub const ROOT_CGROUP: &str = "/sys/fs/cgroup";
