// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # macvirt
//!
//! Small CLI wrapper around the host's internal virtualization feature:
//! boots a Linux kernel with a root disk and a cloud-init disk, prints the
//! guest's MAC address, and attaches the guest console to this terminal.

use colored::Colorize;

fn main() {
    match macvirt::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}
