//! Byte conversion tables for in-place text recoding
//!
//! The engine's convert step rewrites a file through a 256-entry byte
//! remap table plus an end-of-line policy. Tables are built here from
//! pairs of single-byte encodings; picking which pair applies to a given
//! file (the detection heuristic) is the caller's business.

use crate::{FsError, Result};
use encoding_rs::Encoding;

/// What to do with line endings while converting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EolPolicy {
    /// Leave CR/LF bytes untouched
    #[default]
    Preserve,
    /// Normalize all line endings to CRLF
    Crlf,
    /// Normalize all line endings to LF
    Lf,
    /// Normalize all line endings to CR
    Cr,
}

impl EolPolicy {
    fn bytes(self) -> &'static [u8] {
        match self {
            EolPolicy::Preserve => b"",
            EolPolicy::Crlf => b"\r\n",
            EolPolicy::Lf => b"\n",
            EolPolicy::Cr => b"\r",
        }
    }
}

/// A byte remap table plus an end-of-line policy
#[derive(Clone)]
pub struct ConvertTable {
    map: [u8; 256],
    eol: EolPolicy,
}

impl ConvertTable {
    /// A table that maps every byte to itself
    pub fn identity(eol: EolPolicy) -> Self {
        let mut map = [0u8; 256];
        for (i, slot) in map.iter_mut().enumerate() {
            *slot = i as u8;
        }
        Self { map, eol }
    }

    /// Build a remap table between two single-byte encodings
    ///
    /// Bytes that do not round-trip (undecodable in the source, or whose
    /// character has no representation in the target) are left unchanged.
    pub fn between(src: &'static Encoding, dst: &'static Encoding, eol: EolPolicy) -> Result<Self> {
        if !src.is_single_byte() || !dst.is_single_byte() {
            return Err(FsError::Encoding(format!(
                "conversion table requires single-byte encodings, got {} -> {}",
                src.name(),
                dst.name()
            )));
        }

        let mut table = Self::identity(eol);
        for b in 0u16..256 {
            let byte = [b as u8];
            let (decoded, _, had_errors) = src.decode(&byte);
            if had_errors || decoded.chars().count() != 1 {
                continue;
            }
            let (encoded, _, had_errors) = dst.encode(&decoded);
            if had_errors || encoded.len() != 1 {
                continue;
            }
            table.map[b as usize] = encoded[0];
        }
        Ok(table)
    }

    /// Build a table from WHATWG encoding labels (e.g. "windows-1250")
    pub fn by_label(src: &str, dst: &str, eol: EolPolicy) -> Result<Self> {
        let src = Encoding::for_label(src.as_bytes())
            .ok_or_else(|| FsError::Encoding(format!("unknown encoding: {}", src)))?;
        let dst = Encoding::for_label(dst.as_bytes())
            .ok_or_else(|| FsError::Encoding(format!("unknown encoding: {}", dst)))?;
        Self::between(src, dst, eol)
    }

    pub fn map_byte(&self, b: u8) -> u8 {
        self.map[b as usize]
    }

    pub fn eol(&self) -> EolPolicy {
        self.eol
    }
}

impl std::fmt::Debug for ConvertTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertTable").field("eol", &self.eol).finish()
    }
}

/// Streaming application of a [`ConvertTable`]
///
/// Tracks a CR seen at a chunk boundary so CRLF pairs split across reads
/// are still collapsed into one line ending.
pub struct Recoder {
    table: ConvertTable,
    pending_cr: bool,
}

impl Recoder {
    pub fn new(table: ConvertTable) -> Self {
        Self {
            table,
            pending_cr: false,
        }
    }

    /// Convert one chunk of input, appending to `out`
    pub fn push(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if self.table.eol == EolPolicy::Preserve {
            out.extend(input.iter().map(|&b| self.table.map_byte(b)));
            return;
        }

        let eol = self.table.eol.bytes();
        for &b in input {
            if self.pending_cr {
                self.pending_cr = false;
                out.extend_from_slice(eol);
                if b == b'\n' {
                    continue;
                }
            }
            match b {
                b'\r' => self.pending_cr = true,
                b'\n' => out.extend_from_slice(eol),
                _ => out.push(self.table.map_byte(b)),
            }
        }
    }

    /// Flush any line ending still held back at end of input
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.pending_cr {
            self.pending_cr = false;
            out.extend_from_slice(self.table.eol.bytes());
        }
    }
}
