//! Provider GUID parsing and formatting.
//!
//! ETW identifies providers by GUID. Users paste them in whatever form their
//! tooling printed, so both `{...}` and bare forms are accepted. Output uses
//! the braced upper-case form Windows tools print.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uguid::Guid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid GUID {input:?}: {reason}")]
pub struct GuidError {
    input: String,
    reason: String,
}

/// GUID of the provider whose events are captured.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderGuid(Guid);

impl ProviderGuid {
    pub fn parse(s: &str) -> Result<Self, GuidError> {
        let trimmed = s.trim();
        let inner = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
            (Some(rest), true) => &rest[..rest.len() - 1],
            (None, false) => trimmed,
            _ => {
                return Err(GuidError {
                    input: s.to_string(),
                    reason: "unbalanced braces".to_string(),
                })
            }
        };
        Guid::try_parse(inner)
            .map(ProviderGuid)
            .map_err(|e| GuidError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// Bytes in the native Windows `GUID` memory layout (first three fields
    /// little-endian).
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ProviderGuid(Guid::from_bytes(bytes))
    }

    /// Split into the `Data1`..`Data4` fields of a Windows `GUID`.
    pub fn fields(self) -> (u32, u16, u16, [u8; 8]) {
        let b = self.to_bytes();
        let data1 = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        let data2 = u16::from_le_bytes([b[4], b[5]]);
        let data3 = u16::from_le_bytes([b[6], b[7]]);
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&b[8..]);
        (data1, data2, data3, data4)
    }

    pub fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&data1.to_le_bytes());
        b[4..6].copy_from_slice(&data2.to_le_bytes());
        b[6..8].copy_from_slice(&data3.to_le_bytes());
        b[8..].copy_from_slice(&data4);
        Self::from_bytes(b)
    }
}

impl FromStr for ProviderGuid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ProviderGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (d1, d2, d3, d4) = self.fields();
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            d1, d2, d3, d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6], d4[7]
        )
    }
}

impl fmt::Debug for ProviderGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderGuid({self})")
    }
}
