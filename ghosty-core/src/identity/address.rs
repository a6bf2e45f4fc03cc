//! Link-layer hardware addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IdentityError;

/// A 48-bit hardware (MAC) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Build from raw octets
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Locally administered bit is set
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Group (multicast) bit is set
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`,
    /// case-insensitive.
    pub fn parse(input: &str) -> Result<Self, IdentityError> {
        let invalid = || IdentityError::InvalidAddress(input.to_string());
        let trimmed = input.trim();

        let groups: Vec<&str> = if trimmed.contains(':') {
            trimmed.split(':').collect()
        } else if trimmed.contains('-') {
            trimmed.split('-').collect()
        } else if trimmed.len() == 12 && trimmed.is_ascii() {
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(invalid());
        };

        if groups.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, group) in octets.iter_mut().zip(groups) {
            if group.len() != 2 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddress {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MacAddress> for String {
    fn from(address: MacAddress) -> Self {
        address.to_string()
    }
}

/// Extract the newly assigned address from address-change tool output.
///
/// The tool prints `Current MAC`, `Permanent MAC` and `New MAC` lines; only
/// the last one describes the result.
pub fn parse_new_address(output: &str) -> Option<MacAddress> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("New MAC:")?;
        rest.split_whitespace().next().and_then(|token| token.parse().ok())
    })
}
