// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # macvirt CLI - Command Line Interface
//!
//! Parses the launch options, builds the VM configuration, and hands it to
//! the runner with the process's standard streams as the guest console.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
};

use chrono::Local;
use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};

use crate::{
    diagnostics::{DiagnosticSink, FileSink, NullSink},
    hypervisor::{default_hypervisor, Hypervisor},
    mac::MacAddress,
    runner::VmRunner,
    vmcore::{VmConfig, VmOptions, VmResult, DEFAULT_ESCAPE_SEQUENCE},
};

/// Macvirt is a small cli wrapper to use the host's internal virtualization feature
#[derive(Parser, Debug)]
#[command(name = "macvirt")]
#[command(version)]
#[command(
    about = "Boot a Linux VM with the host's native virtualization framework",
    long_about = None
)]
pub struct Cli {
    /// Memory in megabytes
    #[arg(long, default_value_t = 256)]
    pub memory: u64,

    /// CPU cores
    #[arg(long, default_value_t = 1)]
    pub cpu_count: usize,

    /// Kernel path
    #[arg(long)]
    pub kernel_path: PathBuf,

    /// Initrd path
    #[arg(long)]
    pub initrd_path: PathBuf,

    /// Disk path
    #[arg(long)]
    pub disk_path: PathBuf,

    /// Cloud-init data path
    #[arg(long)]
    pub cloud_init_data_path: PathBuf,

    /// Kernel cmdline arguments
    #[arg(long)]
    pub cmd_line_arg: String,

    /// Escape sequence, when using a tty
    #[arg(long, default_value = DEFAULT_ESCAPE_SEQUENCE)]
    pub escape_sequence: String,

    /// MAC address for the network device (random locally-administered if omitted)
    #[arg(long)]
    pub mac_address: Option<MacAddress>,

    /// Sets the level of verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Diagnostic log file (defaults to log.txt in the documents directory)
    #[arg(long, conflicts_with = "no_diagnostic_log")]
    pub diagnostic_log: Option<PathBuf>,

    /// Disable the diagnostic log file
    #[arg(long)]
    pub no_diagnostic_log: bool,

    /// Build and validate the configuration, print it as JSON, and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    pub fn vm_options(&self) -> VmOptions {
        VmOptions {
            memory_mb: self.memory,
            cpu_count: self.cpu_count,
            kernel_path: self.kernel_path.clone(),
            initrd_path: self.initrd_path.clone(),
            disk_path: self.disk_path.clone(),
            cloud_init_data_path: self.cloud_init_data_path.clone(),
            command_line: self.cmd_line_arg.clone(),
            escape_sequence: self.escape_sequence.clone(),
            mac_address: self.mac_address,
        }
    }

    fn diagnostics(&self) -> Box<dyn DiagnosticSink> {
        if self.no_diagnostic_log {
            return Box::new(NullSink);
        }

        let sink = match &self.diagnostic_log {
            Some(path) => Some(FileSink::new(path)),
            None => FileSink::in_documents(),
        };

        match sink {
            Some(sink) => {
                debug!("Diagnostic log at {}", sink.path().display());
                Box::new(sink)
            }
            None => Box::new(NullSink),
        }
    }
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn init_logging(level: &str) {
    // Logs go to stderr; stdout carries the guest console.
    let _ = Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, parse_level(level))
        .try_init();
}

/// Main entry point for the CLI, returns the process exit code
pub fn run() -> VmResult<i32> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);
    info!("macvirt starting");

    let mut hypervisor = default_hypervisor();
    run_with(cli, hypervisor.as_mut(), io::stdin(), io::stdout())
}

/// Build the configuration from parsed options and either print it
/// (`--dry-run`) or launch it on `hypervisor`, using `host_in` and
/// `host_out` as the guest console.
pub fn run_with<R, W>(
    cli: Cli,
    hypervisor: &mut dyn Hypervisor,
    host_in: R,
    mut host_out: W,
) -> VmResult<i32>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let config = VmConfig::from_options(&cli.vm_options())?;

    if cli.dry_run {
        config.validate(&hypervisor.limits())?;
        serde_json::to_writer_pretty(&mut host_out, &config)?;
        writeln!(host_out)?;
        return Ok(0);
    }

    writeln!(
        host_out,
        "Used MAC address to connect to the vm: {}",
        config.mac_address()
    )?;
    host_out.flush()?;

    let mut runner = VmRunner::new(cli.diagnostics());
    let outcome = runner.launch(hypervisor, &config, host_in, host_out)?;

    if let Some(msg) = outcome.error_message() {
        eprintln!("{}", msg);
    }

    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    const REQUIRED: [&str; 11] = [
        "macvirt",
        "--kernel-path",
        "/vm/vmlinuz",
        "--initrd-path",
        "/vm/initrd",
        "--disk-path",
        "/vm/basedisk",
        "--cloud-init-data-path",
        "/vm/cidata.iso",
        "--cmd-line-arg",
        "console=hvc0 root=/dev/vda",
    ];

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();

        assert_eq!(cli.memory, 256);
        assert_eq!(cli.cpu_count, 1);
        assert_eq!(cli.escape_sequence, "q");
        assert_eq!(cli.mac_address, None);
        assert!(!cli.dry_run);

        let options = cli.vm_options();
        assert_eq!(options.kernel_path, PathBuf::from("/vm/vmlinuz"));
        assert_eq!(options.cloud_init_data_path, PathBuf::from("/vm/cidata.iso"));
        assert_eq!(options.command_line, "console=hvc0 root=/dev/vda");
    }

    #[test]
    fn overrides() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--memory",
            "1024",
            "--cpu-count",
            "4",
            "--escape-sequence",
            "x",
            "--mac-address",
            "ee:c7:65:ce:78:2",
        ]);
        let cli = Cli::try_parse_from(args).unwrap();

        assert_eq!(cli.memory, 1024);
        assert_eq!(cli.cpu_count, 4);
        assert_eq!(cli.escape_sequence, "x");
        assert_eq!(
            cli.mac_address.map(|m| m.to_string()).as_deref(),
            Some("ee:c7:65:ce:78:02")
        );
    }

    #[test]
    fn missing_kernel_path_is_a_usage_error() {
        let args: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|a| *a != "--kernel-path" && *a != "/vm/vmlinuz")
            .collect();

        let err = Cli::try_parse_from(args).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--memory", "lots"]);
        assert_eq!(
            Cli::try_parse_from(args).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );

        let mut args = REQUIRED.to_vec();
        args.extend(["--mac-address", "not-a-mac"]);
        assert_eq!(
            Cli::try_parse_from(args).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
    }

    #[test]
    fn diagnostic_log_flags_conflict() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--diagnostic-log", "/tmp/log.txt", "--no-diagnostic-log"]);
        assert_eq!(
            Cli::try_parse_from(args).unwrap_err().kind(),
            ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("chatty"), LevelFilter::Info);
    }
}
