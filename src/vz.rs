// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # Apple Virtualization.framework backend
//!
//! Translates a [`VmConfig`] into a `VZVirtualMachineConfiguration`:
//! - `VZLinuxBootLoader` with kernel, initrd and command line
//! - `VZVirtioBlockDeviceConfiguration` over `VZDiskImageStorageDeviceAttachment`
//! - `VZVirtioConsoleDeviceSerialPortConfiguration` over the console pipes
//! - `VZVirtioNetworkDeviceConfiguration` with `VZNATNetworkDeviceAttachment`
//! - `VZVirtioTraditionalMemoryBalloonDeviceConfiguration`
//! - `VZVirtioEntropyDeviceConfiguration`
//!
//! The VM is bound to the main dispatch queue, so every call here has to
//! happen on the main thread, and [`Hypervisor::pump`] runs the main run loop.

use std::{
    os::fd::{IntoRawFd, OwnedFd},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    time::Duration,
};

use block2::RcBlock;
use log::{debug, info};
use objc2::{rc::Retained, AllocAnyThread};
use objc2_foundation::{NSArray, NSDate, NSError, NSFileHandle, NSRunLoop, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEntropyDeviceConfiguration,
    VZFileHandleSerialPortAttachment, VZLinuxBootLoader, VZMACAddress,
    VZMemoryBalloonDeviceConfiguration, VZNATNetworkDeviceAttachment,
    VZNetworkDeviceConfiguration, VZSerialPortConfiguration, VZStorageDeviceConfiguration,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioNetworkDeviceConfiguration,
    VZVirtioTraditionalMemoryBalloonDeviceConfiguration, VZVirtualMachine,
    VZVirtualMachineConfiguration, VZVirtualMachineState,
};

use crate::{
    hypervisor::{GuestConsole, Hypervisor, ResourceLimits, VmEvent},
    vmcore::{DiskAttachment, VmConfig, VmError, VmResult},
};

/// Virtualization.framework backed hypervisor
#[derive(Default)]
pub struct VzHypervisor {
    configuration: Option<Retained<VZVirtualMachineConfiguration>>,
    machine: Option<Retained<VZVirtualMachine>>,
    events: Option<Sender<VmEvent>>,
    /// Set by the start completion handler once the platform reports success
    started: Arc<AtomicBool>,
    last_state: Option<VZVirtualMachineState>,
    halt_reported: bool,
}

impl VzHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report guest halts and error states that happen after the start
    fn observe_state(&mut self) {
        let (Some(machine), Some(events)) = (&self.machine, &self.events) else {
            return;
        };

        let state = unsafe { machine.state() };
        if self.last_state != Some(state) {
            debug!("VZVirtualMachine state changed to {:?}", state);
            self.last_state = Some(state);
        }
        if self.halt_reported {
            return;
        }

        if let Some(event) = halt_event(state, self.started.load(Ordering::Acquire)) {
            self.halt_reported = true;
            let _ = events.send(event);
        }
    }
}

/// Terminal event for a sampled state. A `Stopped` sample only counts once
/// the start has succeeded, since a fresh VM also reports `Stopped`.
fn halt_event(state: VZVirtualMachineState, started: bool) -> Option<VmEvent> {
    if state == VZVirtualMachineState::Error {
        Some(VmEvent::Crashed("virtual machine entered an error state".to_string()))
    } else if state == VZVirtualMachineState::Stopped && started {
        Some(VmEvent::Stopped)
    } else {
        None
    }
}

impl Hypervisor for VzHypervisor {
    fn name(&self) -> &'static str {
        "virtualization.framework"
    }

    fn limits(&self) -> ResourceLimits {
        unsafe {
            ResourceLimits {
                min_memory_size: VZVirtualMachineConfiguration::minimumAllowedMemorySize(),
                max_memory_size: VZVirtualMachineConfiguration::maximumAllowedMemorySize(),
                min_cpu_count: VZVirtualMachineConfiguration::minimumAllowedCPUCount(),
                max_cpu_count: VZVirtualMachineConfiguration::maximumAllowedCPUCount(),
            }
        }
    }

    fn configure(&mut self, config: &VmConfig, console: GuestConsole) -> VmResult<()> {
        let configuration = unsafe { VZVirtualMachineConfiguration::new() };

        let boot_loader = unsafe {
            let loader = VZLinuxBootLoader::initWithKernelURL(
                VZLinuxBootLoader::alloc(),
                &file_url(&config.boot_loader.kernel),
            );
            loader.setInitialRamdiskURL(Some(&file_url(&config.boot_loader.initrd)));
            loader.setCommandLine(&NSString::from_str(&config.boot_loader.command_line));
            loader
        };

        let storage = config
            .storage
            .iter()
            .map(attach_disk)
            .collect::<VmResult<Vec<_>>>()?;

        let serial_port: Retained<VZSerialPortConfiguration> = unsafe {
            let attachment =
                VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                    VZFileHandleSerialPortAttachment::alloc(),
                    Some(&file_handle(console.input)),
                    Some(&file_handle(console.output)),
                );
            let port = VZVirtioConsoleDeviceSerialPortConfiguration::new();
            port.setAttachment(Some(&attachment));
            Retained::into_super(port)
        };

        let mac = config.mac_address().to_string();
        let network_device: Retained<VZNetworkDeviceConfiguration> = unsafe {
            let mac_address =
                VZMACAddress::initWithString(VZMACAddress::alloc(), &NSString::from_str(&mac))
                    .ok_or_else(|| VmError::InvalidMacAddress(mac.clone()))?;
            let device = VZVirtioNetworkDeviceConfiguration::new();
            device.setAttachment(Some(&VZNATNetworkDeviceAttachment::new()));
            device.setMACAddress(&mac_address);
            Retained::into_super(device)
        };

        let balloon: Retained<VZMemoryBalloonDeviceConfiguration> = Retained::into_super(unsafe {
            VZVirtioTraditionalMemoryBalloonDeviceConfiguration::new()
        });
        let entropy: Retained<VZEntropyDeviceConfiguration> =
            Retained::into_super(unsafe { VZVirtioEntropyDeviceConfiguration::new() });

        unsafe {
            configuration.setBootLoader(Some(&boot_loader));
            configuration.setCPUCount(config.cpu_count);
            configuration.setMemorySize(config.memory_size);
            configuration.setStorageDevices(&NSArray::from_retained_slice(&storage));
            configuration.setSerialPorts(&NSArray::from_retained_slice(&[serial_port]));
            configuration.setNetworkDevices(&NSArray::from_retained_slice(&[network_device]));
            configuration.setMemoryBalloonDevices(&NSArray::from_retained_slice(&[balloon]));
            configuration.setEntropyDevices(&NSArray::from_retained_slice(&[entropy]));

            configuration
                .validateWithError()
                .map_err(|err| VmError::Configuration(describe(&err)))?;
        }

        info!(
            "Configured VM with {} CPU(s), {} bytes of memory, MAC {}",
            config.cpu_count, config.memory_size, mac
        );
        self.configuration = Some(configuration);
        Ok(())
    }

    fn start(&mut self, events: Sender<VmEvent>) -> VmResult<()> {
        let configuration = self.configuration.as_ref().ok_or_else(|| {
            VmError::StartFailed("virtual machine was never configured".to_string())
        })?;

        let machine = unsafe {
            VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), configuration)
        };

        let completion = events.clone();
        let started = Arc::clone(&self.started);
        let handler = RcBlock::new(move |err: *mut NSError| {
            let event = match unsafe { err.as_ref() } {
                None => {
                    started.store(true, Ordering::Release);
                    VmEvent::Started
                }
                Some(err) => VmEvent::StartFailed(describe(err)),
            };
            let _ = completion.send(event);
        });

        unsafe { machine.startWithCompletionHandler(&handler) };
        debug!("Start requested");

        self.machine = Some(machine);
        self.events = Some(events);
        Ok(())
    }

    fn pump(&mut self, timeout: Duration) {
        unsafe {
            let deadline = NSDate::dateWithTimeIntervalSinceNow(timeout.as_secs_f64());
            NSRunLoop::mainRunLoop().runUntilDate(&deadline);
        }
        self.observe_state();
    }
}

fn file_url(path: &Path) -> Retained<NSURL> {
    let path = NSString::from_str(&path.to_string_lossy());
    unsafe { NSURL::fileURLWithPath(&path) }
}

fn file_handle(fd: OwnedFd) -> Retained<NSFileHandle> {
    unsafe {
        NSFileHandle::initWithFileDescriptor_closeOnDealloc(
            NSFileHandle::alloc(),
            fd.into_raw_fd(),
            true,
        )
    }
}

fn attach_disk(disk: &DiskAttachment) -> VmResult<Retained<VZStorageDeviceConfiguration>> {
    let attachment = unsafe {
        VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &file_url(&disk.path),
            disk.read_only,
        )
    }
    .map_err(|err| VmError::DiskAttachment {
        path: disk.path.clone(),
        reason: describe(&err),
    })?;

    let device = unsafe {
        VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &attachment,
        )
    };
    Ok(Retained::into_super(device))
}

fn describe(err: &NSError) -> String {
    err.localizedDescription().to_string()
}
