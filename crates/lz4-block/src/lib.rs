//! Bounded LZ4 block format encoder and decoder.
//!
//! This crate implements the LZ4 block format described in
//! <https://github.com/lz4/lz4/blob/dev/doc/lz4_Block_format.md> without any
//! `unsafe` code and without allocating. Both directions write into a caller
//! supplied buffer and fail cleanly when it is too small, which is what a page
//! compressor wants: output that does not fit under the size threshold is
//! simply a failed compression.
//!
//! # Sequence Layout
//!
//! ```text
//! ┌───────┬──────────────┬──────────┬────────────┬──────────────┐
//! │ token │ literal len+ │ literals │ offset(le) │ match len+   │
//! │ 1 B   │ 0..n B       │ n B      │ 2 B        │ 0..n B       │
//! └───────┴──────────────┴──────────┴────────────┴──────────────┘
//! ```
//!
//! The last sequence carries literals only, and the final five bytes of any
//! block are always literals.
//!
//! # Examples
//!
//! ```
//! use lz4_block::HashTable;
//!
//! let input = [0x42_u8; 4096];
//! let mut compressed = [0_u8; 4096];
//! let mut table = HashTable::new();
//! let len = lz4_block::compress_into(&input, &mut compressed, &mut table).unwrap();
//! assert!(len < 64);
//!
//! let mut output = [0_u8; 4096];
//! let n = lz4_block::decompress_into(&compressed[..len], &mut output).unwrap();
//! assert_eq!(n, input.len());
//! assert_eq!(output, input);
//! ```

#![cfg_attr(not(test), no_std)]

use dataview::DataView;

/// Minimum length of a match.
const MIN_MATCH: usize = 4;
/// The last bytes of a block that must be encoded as literals.
const LAST_LITERALS: usize = 5;
/// No match may start within this many bytes of the end of the block.
const MF_LIMIT: usize = 12;
/// Largest distance a 16-bit offset can express.
const MAX_DISTANCE: usize = 0xFFFF;
/// Nibble value meaning "length continues in extension bytes".
const RUN_MASK: usize = 0x0F;
/// Search step grows by one every `1 << SKIP_TRIGGER` failed probes.
const SKIP_TRIGGER: u32 = 6;

const HASH_LOG: u32 = 12;
const HASH_SIZE: usize = 1 << HASH_LOG;

/// Largest input accepted by [`compress_into`].
///
/// Match positions are kept as 16-bit values in the [`HashTable`].
pub const MAX_INPUT_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum CompressError {
    #[display("input of {len} bytes exceeds the 65536 byte limit")]
    InputTooLarge { len: usize },
    #[display("compressed output does not fit in {capacity} bytes")]
    OutputTooSmall { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum DecompressError {
    #[display("compressed input ended unexpectedly at byte {position}")]
    Truncated { position: usize },
    #[display("match offset {offset} is invalid at output position {position}")]
    InvalidOffset { offset: usize, position: usize },
    #[display("decompressed output does not fit in {capacity} bytes")]
    OutputTooSmall { capacity: usize },
}

/// Match finder state.
///
/// Holding the table outside of [`compress_into`] keeps 8 KiB off the stack of
/// every caller and lets one table be reused across many pages.
#[derive(Clone)]
pub struct HashTable {
    positions: [u16; HASH_SIZE],
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HashTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            positions: [0; HASH_SIZE],
        }
    }

    fn reset(&mut self) {
        self.positions.fill(0);
    }

    fn hash(sequence: u32) -> usize {
        (sequence.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
    }

    fn replace(&mut self, sequence: u32, position: usize) -> usize {
        let slot = &mut self.positions[Self::hash(sequence)];
        let previous = usize::from(*slot);
        *slot = u16::try_from(position).unwrap_or(u16::MAX);
        previous
    }
}

/// Returns the worst case compressed size for `len` input bytes.
#[must_use]
pub const fn max_compressed_size(len: usize) -> usize {
    len + len / 255 + 16
}

struct Writer<'a> {
    output: &'a mut [u8],
    position: usize,
}

impl Writer<'_> {
    fn overflow(&self) -> CompressError {
        CompressError::OutputTooSmall {
            capacity: self.output.len(),
        }
    }

    fn push(&mut self, byte: u8) -> Result<(), CompressError> {
        let capacity = self.output.len();
        let slot = self
            .output
            .get_mut(self.position)
            .ok_or(CompressError::OutputTooSmall { capacity })?;
        *slot = byte;
        self.position += 1;
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), CompressError> {
        let end = self.position + bytes.len();
        if end > self.output.len() {
            return Err(self.overflow());
        }
        self.output[self.position..end].copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }

    fn extended_length(&mut self, mut len: usize) -> Result<(), CompressError> {
        while len >= 0xFF {
            self.push(0xFF)?;
            len -= 0xFF;
        }
        #[expect(clippy::cast_possible_truncation)]
        let last = len as u8;
        self.push(last)
    }

    fn sequence(
        &mut self,
        literals: &[u8],
        offset: usize,
        match_len: usize,
    ) -> Result<(), CompressError> {
        let literal_code = literals.len().min(RUN_MASK);
        let match_code = (match_len - MIN_MATCH).min(RUN_MASK);
        #[expect(clippy::cast_possible_truncation)]
        let token = ((literal_code << 4) | match_code) as u8;
        self.push(token)?;
        if literal_code == RUN_MASK {
            self.extended_length(literals.len() - RUN_MASK)?;
        }
        self.extend(literals)?;
        debug_assert!(offset <= MAX_DISTANCE);
        #[expect(clippy::cast_possible_truncation)]
        let offset = offset as u16;
        self.extend(&offset.to_le_bytes())?;
        if match_code == RUN_MASK {
            self.extended_length(match_len - MIN_MATCH - RUN_MASK)?;
        }
        Ok(())
    }

    fn last_literals(&mut self, literals: &[u8]) -> Result<(), CompressError> {
        let literal_code = literals.len().min(RUN_MASK);
        #[expect(clippy::cast_possible_truncation)]
        let token = (literal_code << 4) as u8;
        self.push(token)?;
        if literal_code == RUN_MASK {
            self.extended_length(literals.len() - RUN_MASK)?;
        }
        self.extend(literals)
    }
}

fn read_u32(input: &[u8], position: usize) -> u32 {
    DataView::from(input).read::<u32>(position)
}

fn common_length(input: &[u8], mut earlier: usize, mut current: usize, limit: usize) -> usize {
    let start = current;
    while current < limit && input[earlier] == input[current] {
        earlier += 1;
        current += 1;
    }
    current - start
}

/// Compresses `input` into `output`, returning the compressed length.
///
/// Fails with [`CompressError::OutputTooSmall`] as soon as the encoding would
/// exceed `output.len()`; the contents of `output` are unspecified in that
/// case.
pub fn compress_into(
    input: &[u8],
    output: &mut [u8],
    table: &mut HashTable,
) -> Result<usize, CompressError> {
    if input.len() > MAX_INPUT_SIZE {
        return Err(CompressError::InputTooLarge { len: input.len() });
    }

    let mut writer = Writer {
        output,
        position: 0,
    };

    if input.len() <= MF_LIMIT {
        writer.last_literals(input)?;
        return Ok(writer.position);
    }

    table.reset();
    let match_limit = input.len() - LAST_LITERALS;
    let mf_limit = input.len() - MF_LIMIT;

    let mut anchor = 0;
    let mut ip = 1;

    'sequences: loop {
        let mut probes = 1_usize << SKIP_TRIGGER;
        let mut candidate;
        loop {
            if ip > mf_limit {
                break 'sequences;
            }
            let sequence = read_u32(input, ip);
            candidate = table.replace(sequence, ip);
            if candidate < ip
                && ip - candidate <= MAX_DISTANCE
                && read_u32(input, candidate) == sequence
            {
                break;
            }
            ip += probes >> SKIP_TRIGGER;
            probes += 1;
        }

        while ip > anchor && candidate > 0 && input[ip - 1] == input[candidate - 1] {
            ip -= 1;
            candidate -= 1;
        }

        let match_len = MIN_MATCH
            + common_length(input, candidate + MIN_MATCH, ip + MIN_MATCH, match_limit);
        writer.sequence(&input[anchor..ip], ip - candidate, match_len)?;

        ip += match_len;
        anchor = ip;
        if ip > mf_limit {
            break;
        }
        table.replace(read_u32(input, ip - 2), ip - 2);
    }

    writer.last_literals(&input[anchor..])?;
    Ok(writer.position)
}

struct Reader<'a> {
    input: &'a [u8],
    position: usize,
}

impl Reader<'_> {
    fn is_empty(&self) -> bool {
        self.position >= self.input.len()
    }

    fn byte(&mut self) -> Result<u8, DecompressError> {
        let byte = *self
            .input
            .get(self.position)
            .ok_or(DecompressError::Truncated {
                position: self.position,
            })?;
        self.position += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&[u8], DecompressError> {
        let end = self.position + len;
        let bytes = self
            .input
            .get(self.position..end)
            .ok_or(DecompressError::Truncated {
                position: self.position,
            })?;
        self.position = end;
        Ok(bytes)
    }

    fn length(&mut self, code: usize) -> Result<usize, DecompressError> {
        let mut len = code;
        if code == RUN_MASK {
            loop {
                let byte = self.byte()?;
                len += usize::from(byte);
                if byte != 0xFF {
                    break;
                }
            }
        }
        Ok(len)
    }
}

/// Decompresses one LZ4 block into `output`, returning the decompressed
/// length.
pub fn decompress_into(input: &[u8], output: &mut [u8]) -> Result<usize, DecompressError> {
    let capacity = output.len();
    let mut reader = Reader { input, position: 0 };
    let mut op = 0;

    loop {
        let token = usize::from(reader.byte()?);

        let literal_len = reader.length(token >> 4)?;
        let literals = reader.bytes(literal_len)?;
        let literal_end = op + literal_len;
        output
            .get_mut(op..literal_end)
            .ok_or(DecompressError::OutputTooSmall { capacity })?
            .copy_from_slice(literals);
        op = literal_end;

        if reader.is_empty() {
            return Ok(op);
        }

        let offset = usize::from(u16::from_le_bytes([reader.byte()?, reader.byte()?]));
        if offset == 0 || offset > op {
            return Err(DecompressError::InvalidOffset {
                offset,
                position: op,
            });
        }

        let match_len = reader.length(token & RUN_MASK)? + MIN_MATCH;
        if op + match_len > capacity {
            return Err(DecompressError::OutputTooSmall { capacity });
        }
        // Byte-wise so that overlapping matches replicate the pattern.
        for i in op..op + match_len {
            output[i] = output[i - offset];
        }
        op += match_len;
    }
}
