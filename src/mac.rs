// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # MAC addresses for the guest network device
//!
//! Addresses are generated from the system CSPRNG with the
//! locally-administered bit set and the multicast bit cleared, so they never
//! collide with vendor-assigned hardware addresses.

use std::{fmt, str::FromStr};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Serialize, Serializer};

use crate::vmcore::{VmError, VmResult};

const LOCALLY_ADMINISTERED_BIT: u8 = 0x02;
const MULTICAST_BIT: u8 = 0x01;

/// A 48-bit IEEE 802 MAC address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a random unicast, locally-administered address
    pub fn random_locally_administered() -> VmResult<Self> {
        let mut octets = [0u8; 6];
        SystemRandom::new()
            .fill(&mut octets)
            .map_err(|_| VmError::Entropy)?;

        octets[0] = (octets[0] | LOCALLY_ADMINISTERED_BIT) & !MULTICAST_BIT;
        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & LOCALLY_ADMINISTERED_BIT != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = VmError;

    /// Accepts `aa:bb:cc:dd:ee:ff` as well as the unpadded form `arp -an`
    /// prints on macOS (`aa:b:cc:d:ee:f`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VmError::InvalidMacAddress(s.to_string());

        let mut octets = [0u8; 6];
        let mut groups = s.trim().split(':');

        for octet in octets.iter_mut() {
            let group = groups.next().ok_or_else(invalid)?;
            if group.is_empty()
                || group.len() > 2
                || !group.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }

        if groups.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
