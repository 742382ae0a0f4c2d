// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # macvirt Library
//!
//! Boots a single Linux VM through the host's native virtualization
//! framework (Apple Virtualization.framework on macOS) with:
//! - A Linux boot loader (kernel, initrd, command line)
//! - A read-write root disk and a read-only cloud-init data disk
//! - A NAT network device with a locally-administered MAC address
//! - A memory balloon and an entropy device
//! - The serial console bridged to the process's stdin/stdout
//!
//! The library is used by the `macvirt` binary, and exposes the
//! configuration builder and runner for embedding and testing.

pub mod console;
pub mod diagnostics;
pub mod hypervisor;
pub mod mac;
pub mod runner;
pub mod vmcore;

#[cfg(target_os = "macos")]
pub mod vz;

// CLI module (not public)
mod cli;

pub use crate::vmcore::*;
pub use cli::{run, run_with, Cli};
pub use hypervisor::{default_hypervisor, GuestConsole, Hypervisor, ResourceLimits, VmEvent};
pub use mac::MacAddress;
pub use runner::{VmOutcome, VmRunner, VmState};
