// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! Seam between macvirt and the host's virtualization service.
//!
//! The platform owns everything interesting: validation of device
//! combinations, disk image formats, CPU and memory virtualization. A
//! [`Hypervisor`] only has to translate a [`VmConfig`] into the platform's
//! descriptor, start it, and report what happened on the event channel.

use std::{os::fd::OwnedFd, sync::mpsc::Sender, thread, time::Duration};

use log::debug;

use crate::vmcore::{VmConfig, VmError, VmResult, BYTES_PER_MEGABYTE};

/// Resource bounds the host accepts for a single VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub min_memory_size: u64,
    pub max_memory_size: u64,
    pub min_cpu_count: usize,
    pub max_cpu_count: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            min_memory_size: 128 * BYTES_PER_MEGABYTE,
            max_memory_size: u64::MAX,
            min_cpu_count: 1,
            max_cpu_count: usize::MAX,
        }
    }
}

/// Guest side of the serial console pipes
#[derive(Debug)]
pub struct GuestConsole {
    /// The guest reads its console input from here
    pub input: OwnedFd,
    /// The guest writes its console output here
    pub output: OwnedFd,
}

/// Asynchronous notifications from the platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmEvent {
    /// The start request completed and the guest is running
    Started,
    /// The start request completed with a platform error
    StartFailed(String),
    /// The guest halted
    Stopped,
    /// The platform moved the VM into an error state
    Crashed(String),
}

/// A host virtualization backend
pub trait Hypervisor {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Resource bounds used for local validation before the platform sees
    /// the configuration
    fn limits(&self) -> ResourceLimits;

    /// Build and validate the platform descriptor.
    ///
    /// Disk attachment failures and platform validation failures surface
    /// here; nothing has been started yet.
    fn configure(&mut self, config: &VmConfig, console: GuestConsole) -> VmResult<()>;

    /// Request an asynchronous start. The outcome of the request, and any
    /// later state change, is sent on `events`.
    fn start(&mut self, events: Sender<VmEvent>) -> VmResult<()>;

    /// Drive the host event loop for up to `timeout`
    fn pump(&mut self, timeout: Duration);
}

/// Backend for hosts without a supported virtualization framework
#[derive(Debug, Default)]
pub struct UnsupportedHypervisor;

impl Hypervisor for UnsupportedHypervisor {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }

    fn configure(&mut self, _config: &VmConfig, _console: GuestConsole) -> VmResult<()> {
        Err(VmError::Unsupported(format!(
            "no virtualization backend for {}",
            std::env::consts::OS
        )))
    }

    fn start(&mut self, _events: Sender<VmEvent>) -> VmResult<()> {
        Err(VmError::Unsupported("virtual machine was never configured".to_string()))
    }

    fn pump(&mut self, timeout: Duration) {
        thread::sleep(timeout);
    }
}

/// The backend for the current host
pub fn default_hypervisor() -> Box<dyn Hypervisor> {
    #[cfg(target_os = "macos")]
    let hypervisor: Box<dyn Hypervisor> = Box::new(crate::vz::VzHypervisor::new());

    #[cfg(not(target_os = "macos"))]
    let hypervisor: Box<dyn Hypervisor> = Box::new(UnsupportedHypervisor);

    debug!("Using {} hypervisor backend", hypervisor.name());
    hypervisor
}
