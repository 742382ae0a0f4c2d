// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # VM configuration record
//!
//! This module describes the single virtual machine macvirt launches:
//! - Linux boot loader (kernel, initial ramdisk, command line)
//! - CPU count and memory size
//! - A read-write primary disk and a read-only cloud-init data disk
//! - A virtio console serial port bridged to the host's standard streams
//! - A NAT network device with a locally-administered MAC address
//! - A traditional memory balloon and an entropy device
//!
//! The record is built once from [`VmOptions`], validated once, and then
//! handed to a [`Hypervisor`](crate::hypervisor::Hypervisor) by reference.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{hypervisor::ResourceLimits, mac::MacAddress};

/// Bytes in one megabyte as understood by `--memory`
pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Default memory size in megabytes
pub const DEFAULT_MEMORY_MB: u64 = 256;

/// Default number of virtual CPUs
pub const DEFAULT_CPU_COUNT: usize = 1;

/// Default console escape sequence
pub const DEFAULT_ESCAPE_SEQUENCE: &str = "q";

/// Custom error types for VM setup and launch
#[derive(Error, Debug)]
pub enum VmError {
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to attach disk {}: {reason}", .path.display())]
    DiskAttachment { path: PathBuf, reason: String },

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("System random number generator failed")]
    Entropy,

    #[error("Failed to start virtual machine: {0}")]
    StartFailed(String),

    #[error("Virtualization is not supported on this host: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type VmResult<T> = Result<T, VmError>;

/// User-facing launch options, as collected by the CLI
#[derive(Clone, Debug)]
pub struct VmOptions {
    /// Memory in megabytes
    pub memory_mb: u64,
    pub cpu_count: usize,
    pub kernel_path: PathBuf,
    pub initrd_path: PathBuf,
    pub disk_path: PathBuf,
    pub cloud_init_data_path: PathBuf,
    /// Passed verbatim as the kernel command line
    pub command_line: String,
    pub escape_sequence: String,
    /// Fixed MAC address; a random one is generated when absent
    pub mac_address: Option<MacAddress>,
}

impl VmOptions {
    /// Options with the CLI defaults for everything that has one
    pub fn new(
        kernel_path: impl Into<PathBuf>,
        initrd_path: impl Into<PathBuf>,
        disk_path: impl Into<PathBuf>,
        cloud_init_data_path: impl Into<PathBuf>,
        command_line: impl Into<String>,
    ) -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_count: DEFAULT_CPU_COUNT,
            kernel_path: kernel_path.into(),
            initrd_path: initrd_path.into(),
            disk_path: disk_path.into(),
            cloud_init_data_path: cloud_init_data_path.into(),
            command_line: command_line.into(),
            escape_sequence: DEFAULT_ESCAPE_SEQUENCE.to_string(),
            mac_address: None,
        }
    }
}

/// How the guest kernel is located and booted
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BootLoader {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub command_line: String,
}

/// A disk image exposed to the guest as a virtio block device
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct DiskAttachment {
    pub path: PathBuf,
    pub read_only: bool,
}

impl DiskAttachment {
    /// Resolve `path` to an absolute reference to an existing regular file
    pub fn attach(path: &Path, read_only: bool) -> VmResult<Self> {
        let failed = |reason: String| VmError::DiskAttachment {
            path: path.to_path_buf(),
            reason,
        };

        let resolved = fs::canonicalize(path).map_err(|e| failed(e.to_string()))?;
        let metadata = fs::metadata(&resolved).map_err(|e| failed(e.to_string()))?;
        if !metadata.is_file() {
            return Err(failed("not a regular file".to_string()));
        }

        debug!(
            "Attached disk {} ({})",
            resolved.display(),
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self {
            path: resolved,
            read_only,
        })
    }
}

/// Serial port device model
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum SerialPort {
    /// virtio console, attached to the host's standard streams
    VirtioConsole,
}

/// Network attachment model
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Host-managed NAT
    Nat,
}

/// Virtio network device
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct NetworkDevice {
    pub mac_address: MacAddress,
    pub attachment: NetworkAttachment,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum MemoryBalloon {
    VirtioTraditional,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum EntropySource {
    Virtio,
}

/// Full description of the VM to launch
#[derive(Clone, Debug, Serialize)]
pub struct VmConfig {
    pub boot_loader: BootLoader,
    pub cpu_count: usize,
    /// Memory size in bytes
    pub memory_size: u64,
    /// Primary disk first, cloud-init data disk second
    pub storage: Vec<DiskAttachment>,
    pub serial: SerialPort,
    pub network: NetworkDevice,
    pub memory_balloon: MemoryBalloon,
    pub entropy: EntropySource,
    /// Accepted for compatibility; no detach handling is attached to it
    pub escape_sequence: String,
}

impl VmConfig {
    /// Build the VM description from CLI options.
    ///
    /// Both disks are resolved here, so a missing image fails before any
    /// hypervisor is touched.
    pub fn from_options(options: &VmOptions) -> VmResult<Self> {
        let memory_size = memory_bytes(options.memory_mb)?;

        let storage = vec![
            DiskAttachment::attach(&options.disk_path, false)?,
            DiskAttachment::attach(&options.cloud_init_data_path, true)?,
        ];

        let mac_address = match options.mac_address {
            Some(mac) => {
                if !mac.is_unicast() {
                    return Err(VmError::Configuration(format!(
                        "MAC address {mac} is a multicast address"
                    )));
                }
                if !mac.is_locally_administered() {
                    warn!("MAC address {} is not locally administered", mac);
                }
                mac
            }
            None => MacAddress::random_locally_administered()?,
        };

        debug!(
            "Escape sequence {:?} accepted but not bound to a detach action",
            options.escape_sequence
        );

        Ok(Self {
            boot_loader: BootLoader {
                kernel: absolute(&options.kernel_path)?,
                initrd: absolute(&options.initrd_path)?,
                command_line: options.command_line.clone(),
            },
            cpu_count: options.cpu_count,
            memory_size,
            storage,
            serial: SerialPort::VirtioConsole,
            network: NetworkDevice {
                mac_address,
                attachment: NetworkAttachment::Nat,
            },
            memory_balloon: MemoryBalloon::VirtioTraditional,
            entropy: EntropySource::Virtio,
            escape_sequence: options.escape_sequence.clone(),
        })
    }

    /// MAC address of the guest's network device
    pub fn mac_address(&self) -> MacAddress {
        self.network.mac_address
    }

    /// Check the record against the host's resource limits and the boot files
    pub fn validate(&self, limits: &ResourceLimits) -> VmResult<()> {
        if self.memory_size < limits.min_memory_size || self.memory_size > limits.max_memory_size {
            return Err(VmError::Configuration(format!(
                "memory size {} bytes is outside the allowed range {}..={}",
                self.memory_size, limits.min_memory_size, limits.max_memory_size
            )));
        }

        if self.cpu_count < limits.min_cpu_count || self.cpu_count > limits.max_cpu_count {
            return Err(VmError::Configuration(format!(
                "CPU count {} is outside the allowed range {}..={}",
                self.cpu_count, limits.min_cpu_count, limits.max_cpu_count
            )));
        }

        for (what, path) in [
            ("kernel", &self.boot_loader.kernel),
            ("initrd", &self.boot_loader.initrd),
        ] {
            if !path.is_file() {
                return Err(VmError::Configuration(format!(
                    "{what} image {} does not exist",
                    path.display()
                )));
            }
        }

        if self.boot_loader.command_line.trim().is_empty() {
            return Err(VmError::Configuration(
                "kernel command line is empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Convert a `--memory` value in megabytes to bytes
pub fn memory_bytes(memory_mb: u64) -> VmResult<u64> {
    memory_mb.checked_mul(BYTES_PER_MEGABYTE).ok_or_else(|| {
        VmError::Configuration(format!("memory size of {memory_mb} MB overflows"))
    })
}

fn absolute(path: &Path) -> VmResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct BootFiles {
        dir: TempDir,
    }

    impl BootFiles {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            for name in ["vmlinuz", "initrd", "basedisk", "cidata.iso"] {
                fs::write(dir.path().join(name), b"image").unwrap();
            }
            Self { dir }
        }

        fn options(&self) -> VmOptions {
            let p = |name: &str| self.dir.path().join(name);
            VmOptions::new(
                p("vmlinuz"),
                p("initrd"),
                p("basedisk"),
                p("cidata.iso"),
                "console=hvc0 root=/dev/vda",
            )
        }
    }

    #[test]
    fn memory_is_megabytes_times_1048576() {
        assert_eq!(memory_bytes(512).unwrap(), 536_870_912);
        assert_eq!(memory_bytes(DEFAULT_MEMORY_MB).unwrap(), 268_435_456);
    }

    #[test]
    fn memory_overflow_is_a_configuration_error() {
        assert!(matches!(memory_bytes(u64::MAX), Err(VmError::Configuration(_))));
    }

    #[test]
    fn builds_full_device_set() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.memory_mb = 512;
        options.cpu_count = 2;

        let config = VmConfig::from_options(&options).unwrap();

        assert_eq!(config.memory_size, 536_870_912);
        assert_eq!(config.cpu_count, 2);
        assert_eq!(config.boot_loader.command_line, "console=hvc0 root=/dev/vda");
        assert_eq!(config.storage.len(), 2);
        assert!(!config.storage[0].read_only);
        assert!(config.storage[1].read_only);
        assert!(config.storage[0].path.ends_with("basedisk"));
        assert!(config.storage[1].path.ends_with("cidata.iso"));
        assert_eq!(config.network.attachment, NetworkAttachment::Nat);
        assert_eq!(config.serial, SerialPort::VirtioConsole);
        assert_eq!(config.memory_balloon, MemoryBalloon::VirtioTraditional);
        assert_eq!(config.entropy, EntropySource::Virtio);
        assert_eq!(config.escape_sequence, "q");
        assert!(config.mac_address().is_locally_administered());
        assert!(config.mac_address().is_unicast());
    }

    #[test]
    fn missing_disk_fails_attachment() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.disk_path = files.dir.path().join("nope.img");

        match VmConfig::from_options(&options) {
            Err(VmError::DiskAttachment { path, .. }) => assert!(path.ends_with("nope.img")),
            other => panic!("expected disk attachment error, got {other:?}"),
        }
    }

    #[test]
    fn directory_is_not_a_disk() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.cloud_init_data_path = files.dir.path().to_path_buf();

        assert!(matches!(
            VmConfig::from_options(&options),
            Err(VmError::DiskAttachment { .. })
        ));
    }

    #[test]
    fn keeps_supplied_mac() {
        let files = BootFiles::new();
        let mut options = files.options();
        let mac: MacAddress = "52:54:00:12:34:56".parse().unwrap();
        options.mac_address = Some(mac);

        let config = VmConfig::from_options(&options).unwrap();
        assert_eq!(config.mac_address(), mac);
    }

    #[test]
    fn rejects_multicast_mac() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.mac_address = Some("03:00:00:00:00:01".parse().unwrap());

        assert!(matches!(
            VmConfig::from_options(&options),
            Err(VmError::Configuration(_))
        ));
    }

    #[test]
    fn validate_accepts_defaults() {
        let files = BootFiles::new();
        let config = VmConfig::from_options(&files.options()).unwrap();
        config.validate(&ResourceLimits::default()).unwrap();
    }

    #[test]
    fn validate_enforces_limits() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.memory_mb = 64;
        let config = VmConfig::from_options(&options).unwrap();
        assert!(matches!(
            config.validate(&ResourceLimits::default()),
            Err(VmError::Configuration(_))
        ));

        let mut options = files.options();
        options.cpu_count = 0;
        let config = VmConfig::from_options(&options).unwrap();
        assert!(matches!(
            config.validate(&ResourceLimits::default()),
            Err(VmError::Configuration(_))
        ));

        let limits = ResourceLimits {
            max_cpu_count: 4,
            ..ResourceLimits::default()
        };
        let mut options = files.options();
        options.cpu_count = 8;
        let config = VmConfig::from_options(&options).unwrap();
        assert!(config.validate(&limits).is_err());
    }

    #[test]
    fn validate_requires_kernel_and_initrd() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.kernel_path = files.dir.path().join("missing-kernel");
        let config = VmConfig::from_options(&options).unwrap();

        let err = config.validate(&ResourceLimits::default()).unwrap_err();
        assert!(err.to_string().contains("kernel image"));
    }

    #[test]
    fn validate_rejects_blank_command_line() {
        let files = BootFiles::new();
        let mut options = files.options();
        options.command_line = "   ".to_string();
        let config = VmConfig::from_options(&options).unwrap();

        assert!(config.validate(&ResourceLimits::default()).is_err());
    }

    #[test]
    fn serializes_for_dry_run() {
        let files = BootFiles::new();
        let config = VmConfig::from_options(&files.options()).unwrap();
        let json: serde_json::Value = serde_json::to_value(&config).unwrap();

        assert_eq!(json["memory_size"], 268_435_456u64);
        assert_eq!(json["network"]["attachment"], "Nat");
        assert_eq!(json["network"]["mac_address"], config.mac_address().to_string());
        assert_eq!(json["storage"][1]["read_only"], true);
    }

    proptest! {
        #[test]
        fn memory_conversion_is_exact(mb in 0u64..=(u64::MAX / BYTES_PER_MEGABYTE)) {
            prop_assert_eq!(memory_bytes(mb).unwrap(), mb * 1_048_576);
        }
    }
}
