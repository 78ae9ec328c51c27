//! EFI GUIDs in their textual `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` form.

use alloc::string::String;
use core::fmt;
use core::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// EFI GUID stored in its on-wire (mixed-endian) byte layout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid([u8; 16]);

/// Standard EFI global variable namespace (`Boot####`, `BootOrder`, ...).
pub const EFI_GLOBAL_VARIABLE: Guid = Guid::from_fields(
    0x8BE4_DF61,
    0x93CA,
    0x11D2,
    [0xAA, 0x0D, 0x00, 0xE0, 0x98, 0x03, 0x2B, 0x8C],
);

/// Chrysalis vendor namespace for its own and rerouted boot variables.
pub const CHRYSALIS_VENDOR: Guid = Guid::from_fields(
    0x4EA0_5EED,
    0xC4B1,
    0x4E0D,
    [0x9D, 0x4A, 0xEA, 0x0C, 0x1A, 0x5B, 0x00, 0x01],
);

impl Guid {
    /// Build from the four textual fields.
    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let d1 = data1.to_le_bytes();
        let d2 = data2.to_le_bytes();
        let d3 = data3.to_le_bytes();
        Self([
            d1[0], d1[1], d1[2], d1[3], d2[0], d2[1], d3[0], d3[1], data4[0], data4[1], data4[2],
            data4[3], data4[4], data4[5], data4[6], data4[7],
        ])
    }

    /// Raw on-wire bytes.
    pub const fn to_bytes(&self) -> [u8; 16] {
        self.0
    }

    fn data1(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    fn data2(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }

    fn data3(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }
}

/// GUID text failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseGuidError;

impl fmt::Display for ParseGuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected GUID in XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX form")
    }
}

impl FromStr for Guid {
    type Err = ParseGuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 36 {
            return Err(ParseGuidError);
        }
        for dash in [8, 13, 18, 23] {
            if bytes[dash] != b'-' {
                return Err(ParseGuidError);
            }
        }

        let field = |range: core::ops::Range<usize>| -> Result<u64, ParseGuidError> {
            u64::from_str_radix(&s[range], 16).map_err(|_| ParseGuidError)
        };
        // from_str_radix accepts a leading '+'; reject anything but hex digits
        if !s
            .bytes()
            .enumerate()
            .all(|(i, b)| matches!(i, 8 | 13 | 18 | 23) || b.is_ascii_hexdigit())
        {
            return Err(ParseGuidError);
        }

        let data1 = field(0..8)? as u32;
        let data2 = field(9..13)? as u16;
        let data3 = field(14..18)? as u16;
        let clock = field(19..23)? as u16;
        let node = field(24..36)?;

        let mut data4 = [0u8; 8];
        data4[..2].copy_from_slice(&clock.to_be_bytes());
        data4[2..].copy_from_slice(&node.to_be_bytes()[2..]);
        Ok(Self::from_fields(data1, data2, data3, data4))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d4 = &self.0[8..];
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.data1(),
            self.data2(),
            self.data3(),
            d4[0],
            d4[1],
            d4[2],
            d4[3],
            d4[4],
            d4[5],
            d4[6],
            d4[7]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct GuidVisitor;

        impl Visitor<'_> for GuidVisitor {
            type Value = Guid;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a GUID string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Guid, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Guid, E> {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_str(GuidVisitor)
    }
}
