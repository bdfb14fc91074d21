//! Text decoding for raw output frames.
//!
//! [`TextDecoder`] is the seam for the host's codec. [`Encoding`] covers the
//! encodings scripts are expected to write.

use std::fmt;

use crate::error::DecodeError;

/// Turns one raw frame into text.
pub trait TextDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<String, DecodeError>;
}

/// Built-in encodings selectable with the `encoding` job setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// UTF-8; invalid sequences become U+FFFD.
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    /// Strict 7-bit ASCII.
    Ascii,
    /// ISO-8859-1, every byte maps to the code point of the same value.
    Latin1,
    /// No decoding; bytes are passed through lossily.
    Nop,
}

impl Encoding {
    /// Look up an encoding by name. Empty means UTF-8.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "utf-8" | "utf8" => Some(Self::Utf8),
            "utf-16le" | "utf16le" => Some(Self::Utf16Le),
            "utf-16be" | "utf16be" => Some(Self::Utf16Be),
            "ascii" | "us-ascii" => Some(Self::Ascii),
            "latin1" | "latin-1" | "iso-8859-1" => Some(Self::Latin1),
            "nop" => Some(Self::Nop),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Ascii => "ascii",
            Self::Latin1 => "latin1",
            Self::Nop => "nop",
        }
    }

    fn decode_utf16(self, raw: &[u8], little_endian: bool) -> Result<String, DecodeError> {
        if raw.len() % 2 != 0 {
            return Err(DecodeError::OddLength {
                encoding: self.name(),
                len: raw.len(),
            });
        }
        let units = raw.chunks_exact(2).map(|pair| {
            let bytes = [pair[0], pair[1]];
            if little_endian {
                u16::from_le_bytes(bytes)
            } else {
                u16::from_be_bytes(bytes)
            }
        });
        char::decode_utf16(units)
            .collect::<Result<String, _>>()
            .map_err(|_| DecodeError::UnpairedSurrogate {
                encoding: self.name(),
            })
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TextDecoder for Encoding {
    fn decode(&self, raw: &[u8]) -> Result<String, DecodeError> {
        match self {
            Self::Utf8 | Self::Nop => Ok(String::from_utf8_lossy(raw).into_owned()),
            Self::Utf16Le => self.decode_utf16(raw, true),
            Self::Utf16Be => self.decode_utf16(raw, false),
            Self::Ascii => match raw.iter().position(|b| !b.is_ascii()) {
                Some(offset) => Err(DecodeError::InvalidByte {
                    encoding: self.name(),
                    offset,
                }),
                // All bytes are ASCII, so this cannot fail.
                None => Ok(raw.iter().map(|&b| char::from(b)).collect()),
            },
            Self::Latin1 => Ok(raw.iter().map(|&b| char::from(b)).collect()),
        }
    }
}
