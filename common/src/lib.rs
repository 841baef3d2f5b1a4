//! Shared types and constants for the kntrl egress probe
//!
//! This crate describes the binary contract between the kernel-resident
//! filtering program and the userspace control plane: map names, mode
//! codes and the layout of the connection events.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{Event, IP4Event};
