//! PCM format descriptions and the device sinks the buffer process feeds.
//!
//! The buffer core never interprets samples. It only needs to know how many
//! bytes make up one frame so that every write to a sink carries whole frames.

#[cfg(feature = "audio-cpal")]
pub mod device;

pub mod channel;
pub mod null;
pub mod output;
pub mod sink;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Sample encoding bitmask.
///
/// Single encodings are distinct bit patterns. Format queries return unions
/// of them to describe everything a device accepts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding(u32);

impl Encoding {
    pub const NONE: Encoding = Encoding(0);
    pub const UNSIGNED_8: Encoding = Encoding(0x01);
    pub const ULAW_8: Encoding = Encoding(0x04);
    pub const ALAW_8: Encoding = Encoding(0x08);
    pub const SIGNED_8: Encoding = Encoding(0x82);
    pub const UNSIGNED_16: Encoding = Encoding(0x60);
    pub const SIGNED_16: Encoding = Encoding(0xd0);
    pub const FLOAT_32: Encoding = Encoding(0x200);
    pub const FLOAT_64: Encoding = Encoding(0x400);
    pub const SIGNED_32: Encoding = Encoding(0x1180);
    pub const UNSIGNED_32: Encoding = Encoding(0x2100);
    pub const SIGNED_24: Encoding = Encoding(0x5080);
    pub const UNSIGNED_24: Encoding = Encoding(0x6000);

    /// Every single encoding, widest first.
    pub const ALL: [Encoding; 12] = [
        Encoding::FLOAT_64,
        Encoding::FLOAT_32,
        Encoding::SIGNED_32,
        Encoding::UNSIGNED_32,
        Encoding::SIGNED_24,
        Encoding::UNSIGNED_24,
        Encoding::SIGNED_16,
        Encoding::UNSIGNED_16,
        Encoding::SIGNED_8,
        Encoding::UNSIGNED_8,
        Encoding::ULAW_8,
        Encoding::ALAW_8,
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Encoding(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Encoding) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Bytes per sample, or 0 if this is not exactly one known encoding.
    pub fn sample_size(self) -> usize {
        match self {
            Encoding::UNSIGNED_8 | Encoding::SIGNED_8 | Encoding::ULAW_8 | Encoding::ALAW_8 => 1,
            Encoding::UNSIGNED_16 | Encoding::SIGNED_16 => 2,
            Encoding::SIGNED_24 | Encoding::UNSIGNED_24 => 3,
            Encoding::SIGNED_32 | Encoding::UNSIGNED_32 | Encoding::FLOAT_32 => 4,
            Encoding::FLOAT_64 => 8,
            _ => 0,
        }
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Encoding::UNSIGNED_8 => "u8",
            Encoding::SIGNED_8 => "s8",
            Encoding::ULAW_8 => "ulaw",
            Encoding::ALAW_8 => "alaw",
            Encoding::UNSIGNED_16 => "u16",
            Encoding::SIGNED_16 => "s16",
            Encoding::SIGNED_24 => "s24",
            Encoding::UNSIGNED_24 => "u24",
            Encoding::SIGNED_32 => "s32",
            Encoding::UNSIGNED_32 => "u32",
            Encoding::FLOAT_32 => "f32",
            Encoding::FLOAT_64 => "f64",
            _ => return None,
        };
        Some(name)
    }

    /// The single encodings contained in this mask.
    pub fn iter(self) -> impl Iterator<Item = Encoding> {
        Encoding::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl BitOr for Encoding {
    type Output = Encoding;

    fn bitor(self, rhs: Encoding) -> Encoding {
        Encoding(self.0 | rhs.0)
    }
}

impl BitOrAssign for Encoding {
    fn bitor_assign(&mut self, rhs: Encoding) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            return write!(f, "Encoding({name})");
        }
        let names: Vec<&str> = self.iter().filter_map(Encoding::name).collect();
        write!(f, "Encoding({:#x}: {})", self.0, names.join("|"))
    }
}

/// Output format of an open stream.
///
/// In format query results the `encoding` field is a mask, and an all-zero
/// record stands for "no default reported".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub channels: u16,
    pub encoding: Encoding,
}

impl AudioFormat {
    pub const fn new(rate: u32, channels: u16, encoding: Encoding) -> Self {
        Self {
            rate,
            channels,
            encoding,
        }
    }

    /// Bytes per interleaved frame, 0 for an unusable format.
    pub fn frame_size(&self) -> usize {
        self.encoding.sample_size() * usize::from(self.channels)
    }

    /// Bytes per second of audio at this format.
    pub fn byte_rate(&self) -> usize {
        self.frame_size() * self.rate as usize
    }

    pub fn is_unknown(&self) -> bool {
        self.rate == 0 && self.channels == 0 && self.encoding.is_empty()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}",
            self.rate,
            self.channels,
            self.encoding.name().unwrap_or("mixed")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_multiplies_sample_size_by_channels() {
        let fmt = AudioFormat::new(44_100, 2, Encoding::SIGNED_16);
        assert_eq!(fmt.frame_size(), 4);
        assert_eq!(fmt.byte_rate(), 176_400);
        assert_eq!(AudioFormat::new(48_000, 6, Encoding::SIGNED_24).frame_size(), 18);
    }

    #[test]
    fn masks_have_no_sample_size() {
        let mask = Encoding::SIGNED_16 | Encoding::FLOAT_32;
        assert_eq!(mask.sample_size(), 0);
        assert!(mask.contains(Encoding::SIGNED_16));
        assert!(!mask.contains(Encoding::SIGNED_32));
        assert_eq!(mask.iter().count(), 2);
    }

    #[test]
    fn signed_24_is_not_mistaken_for_signed_8() {
        assert!(!Encoding::SIGNED_8.contains(Encoding::SIGNED_24));
        assert_eq!(Encoding::SIGNED_24.sample_size(), 3);
    }
}
