//! Binary codec for segment files
//!
//! Layout of a segment file:
//!
//! ```text
//! HEADER (12 bytes):
//!   magic "FPSG"            4B
//!   codec version           u32 LE
//!   block_size              u16 LE
//!   reserved                u16 LE (zero)
//!
//! METADATA (variable, CRC-checked):
//!   num_items               u64 LE
//!   num_blocks              u32 LE
//!   min_doc_id              u32 LE
//!   max_doc_id              u32 LE
//!   max_commit_id           u64 LE
//!   attr_count              u32 LE
//!     per attribute: key_len u16 LE, key bytes (UTF-8), value u64 LE
//!   docs_count              u32 LE
//!     per doc (sorted by id): id u32 LE, status u8 (1=live, 0=tombstone)
//!   block index             num_blocks x u32 LE (first hash of each block)
//!   crc32 of all metadata bytes above    u32 LE
//!
//! BLOCK REGION: num_blocks fixed-size blocks, each:
//!   num_items               u16 LE
//!   min_hash                u32 LE
//!   items: per item, vbyte(hash delta) then vbyte(id); the id is stored as
//!     a delta from the previous id while the hash repeats and resets to a
//!     full value on every new hash (and on the first item of the block)
//!   zero padding up to block_size - 4
//!   crc32 over bytes [0 .. block_size-4]   u32 LE
//! ```
//!
//! Blocks are self-describing: decoding needs only the block bytes and the
//! codec version.

use std::collections::HashMap;
use std::io::{self, Write};

use crc32fast::Hasher;

use super::types::Item;

/// Magic bytes at the start of every segment file
pub const SEGMENT_MAGIC: &[u8; 4] = b"FPSG";
/// Current segment codec version
pub const CODEC_VERSION: u32 = 1;
/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Per-block header: item count + first hash
const BLOCK_HEADER_SIZE: usize = 6;
/// Trailing CRC of each block
const BLOCK_CRC_SIZE: usize = 4;

// ============================================================================
// VByte codec
// ============================================================================

/// Variable-byte encoding: seven value bits per byte, least significant
/// group first, with the top bit set on every byte except the last.
pub fn encode_vbyte(value: u32, output: &mut Vec<u8>) {
    let mut remaining = value;
    while remaining >= 0x80 {
        output.push((remaining as u8 & 0x7F) | 0x80);
        remaining >>= 7;
    }
    output.push(remaining as u8);
}

/// Decode a variable-byte integer starting at `data[*pos]`.
pub fn decode_vbyte(data: &[u8], pos: &mut usize) -> io::Result<u32> {
    let mut value = 0u32;
    for group in 0..5u32 {
        let byte = match data.get(*pos) {
            Some(&byte) => byte,
            None => return Err(eof("posting data")),
        };
        *pos += 1;
        value |= u32::from(byte & 0x7F) << (7 * group);
        if byte & 0x80 == 0 {
            // The fifth byte may only carry the top four bits of a u32
            if group == 4 && byte > 0x0F {
                break;
            }
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "posting value overflows 32 bits",
    ))
}

/// Number of bytes `encode_vbyte` emits for a value: one per started
/// seven-bit group.
pub fn vbyte_len(value: u32) -> usize {
    let bits = 32 - value.leading_zeros().min(31);
    ((bits + 6) / 7) as usize
}

// ============================================================================
// Header
// ============================================================================

/// Encode the fixed segment header
pub fn encode_header(block_size: u16, output: &mut Vec<u8>) {
    output.extend_from_slice(SEGMENT_MAGIC);
    output.extend_from_slice(&CODEC_VERSION.to_le_bytes());
    output.extend_from_slice(&block_size.to_le_bytes());
    output.extend_from_slice(&0u16.to_le_bytes());
}

/// Decode and validate the fixed segment header, returning the block size
pub fn decode_header(data: &[u8]) -> io::Result<u16> {
    if data.len() < HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "segment file too small for header",
        ));
    }
    if &data[0..4] != SEGMENT_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version > CODEC_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("codec version {} too new", version),
        ));
    }
    let block_size = u16::from_le_bytes(data[8..10].try_into().unwrap());
    if (block_size as usize) < BLOCK_HEADER_SIZE + BLOCK_CRC_SIZE + 10 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("block size {} too small", block_size),
        ));
    }
    Ok(block_size)
}

// ============================================================================
// Metadata
// ============================================================================

/// Decoded segment metadata block
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentMeta {
    pub num_items: u64,
    pub min_doc_id: u32,
    pub max_doc_id: u32,
    pub max_commit_id: u64,
    pub attributes: HashMap<String, u64>,
    pub docs: HashMap<u32, bool>,
    /// First hash of each block, in block order
    pub block_index: Vec<u32>,
}

impl SegmentMeta {
    /// Serialize the metadata block, appending its CRC.
    pub fn encode(&self, output: &mut Vec<u8>) {
        let start = output.len();

        output.extend_from_slice(&self.num_items.to_le_bytes());
        output.extend_from_slice(&(self.block_index.len() as u32).to_le_bytes());
        output.extend_from_slice(&self.min_doc_id.to_le_bytes());
        output.extend_from_slice(&self.max_doc_id.to_le_bytes());
        output.extend_from_slice(&self.max_commit_id.to_le_bytes());

        let mut attrs: Vec<(&String, &u64)> = self.attributes.iter().collect();
        attrs.sort();
        output.extend_from_slice(&(attrs.len() as u32).to_le_bytes());
        for (key, value) in attrs {
            output.extend_from_slice(&(key.len() as u16).to_le_bytes());
            output.extend_from_slice(key.as_bytes());
            output.extend_from_slice(&value.to_le_bytes());
        }

        let mut docs: Vec<(&u32, &bool)> = self.docs.iter().collect();
        docs.sort();
        output.extend_from_slice(&(docs.len() as u32).to_le_bytes());
        for (id, status) in docs {
            output.extend_from_slice(&id.to_le_bytes());
            output.push(u8::from(*status));
        }

        for first_hash in &self.block_index {
            output.extend_from_slice(&first_hash.to_le_bytes());
        }

        let mut hasher = Hasher::new();
        hasher.update(&output[start..]);
        output.extend_from_slice(&hasher.finalize().to_le_bytes());
    }

    /// Decode the metadata block starting at `data[*pos]`, verifying its CRC.
    pub fn decode(data: &[u8], pos: &mut usize) -> io::Result<Self> {
        let start = *pos;
        let mut meta = SegmentMeta::default();

        let num_items = read_u64(data, pos)?;
        let num_blocks = read_u32(data, pos)? as usize;
        meta.num_items = num_items;
        meta.min_doc_id = read_u32(data, pos)?;
        meta.max_doc_id = read_u32(data, pos)?;
        meta.max_commit_id = read_u64(data, pos)?;

        let attr_count = read_u32(data, pos)? as usize;
        for _ in 0..attr_count {
            let key_len = read_u16(data, pos)? as usize;
            if *pos + key_len > data.len() {
                return Err(eof("attribute key"));
            }
            let key = std::str::from_utf8(&data[*pos..*pos + key_len])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "attribute key not UTF-8"))?
                .to_string();
            *pos += key_len;
            let value = read_u64(data, pos)?;
            meta.attributes.insert(key, value);
        }

        let docs_count = read_u32(data, pos)? as usize;
        for _ in 0..docs_count {
            let id = read_u32(data, pos)?;
            let status = read_u8(data, pos)?;
            meta.docs.insert(id, status != 0);
        }

        meta.block_index.reserve(num_blocks);
        for _ in 0..num_blocks {
            meta.block_index.push(read_u32(data, pos)?);
        }

        let mut hasher = Hasher::new();
        hasher.update(&data[start..*pos]);
        let expected = hasher.finalize();
        let stored = read_u32(data, pos)?;
        if stored != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "metadata checksum mismatch",
            ));
        }

        Ok(meta)
    }
}

fn eof(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("unexpected end of {}", what),
    )
}

fn read_u8(data: &[u8], pos: &mut usize) -> io::Result<u8> {
    if *pos + 1 > data.len() {
        return Err(eof("metadata"));
    }
    let v = data[*pos];
    *pos += 1;
    Ok(v)
}

fn read_u16(data: &[u8], pos: &mut usize) -> io::Result<u16> {
    if *pos + 2 > data.len() {
        return Err(eof("metadata"));
    }
    let v = u16::from_le_bytes(data[*pos..*pos + 2].try_into().unwrap());
    *pos += 2;
    Ok(v)
}

fn read_u32(data: &[u8], pos: &mut usize) -> io::Result<u32> {
    if *pos + 4 > data.len() {
        return Err(eof("metadata"));
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(data: &[u8], pos: &mut usize) -> io::Result<u64> {
    if *pos + 8 > data.len() {
        return Err(eof("metadata"));
    }
    let v = u64::from_le_bytes(data[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

// ============================================================================
// Block builder
// ============================================================================

/// Accumulates sorted items into one fixed-size block.
///
/// Items are accepted until the next one would overflow the block payload;
/// `finish()` then emits exactly `block_size` bytes.
pub struct BlockBuilder {
    block_size: usize,
    buf: Vec<u8>,
    num_items: u16,
    min_hash: u32,
    prev_hash: u32,
    prev_id: u32,
}

impl BlockBuilder {
    pub fn new(block_size: u16) -> Self {
        Self {
            block_size: block_size as usize,
            buf: Vec::with_capacity(block_size as usize),
            num_items: 0,
            min_hash: 0,
            prev_hash: 0,
            prev_id: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.num_items == 0
    }

    pub fn num_items(&self) -> u16 {
        self.num_items
    }

    /// Hash of the first item in the block (valid once non-empty)
    pub fn first_hash(&self) -> u32 {
        self.min_hash
    }

    /// Append an item if it fits. Items must arrive in `(hash, id)` order.
    pub fn try_push(&mut self, item: Item) -> bool {
        if self.num_items == u16::MAX {
            return false;
        }

        // First item of a block: hash delta 0 against min_hash, full id.
        let (hash_delta, id_value) = if self.num_items == 0 {
            (0, item.id)
        } else {
            let delta = item.hash - self.prev_hash;
            if delta == 0 {
                (0, item.id - self.prev_id)
            } else {
                (delta, item.id)
            }
        };

        let encoded = vbyte_len(hash_delta) + vbyte_len(id_value);
        let capacity = self.block_size - BLOCK_CRC_SIZE - BLOCK_HEADER_SIZE;
        if self.buf.len() + encoded > capacity {
            return false;
        }

        if self.num_items == 0 {
            self.min_hash = item.hash;
        }
        encode_vbyte(hash_delta, &mut self.buf);
        encode_vbyte(id_value, &mut self.buf);
        self.prev_hash = item.hash;
        self.prev_id = item.id;
        self.num_items += 1;
        true
    }

    /// Emit the finished block (exactly `block_size` bytes) and reset.
    pub fn finish<W: Write>(&mut self, output: &mut W) -> io::Result<()> {
        let mut block = Vec::with_capacity(self.block_size);
        block.extend_from_slice(&self.num_items.to_le_bytes());
        block.extend_from_slice(&self.min_hash.to_le_bytes());
        block.extend_from_slice(&self.buf);
        block.resize(self.block_size - BLOCK_CRC_SIZE, 0);

        let mut hasher = Hasher::new();
        hasher.update(&block);
        block.extend_from_slice(&hasher.finalize().to_le_bytes());

        output.write_all(&block)?;

        self.buf.clear();
        self.num_items = 0;
        self.min_hash = 0;
        self.prev_hash = 0;
        self.prev_id = 0;
        Ok(())
    }
}

/// Decode one fixed-size block into `items`, verifying its CRC.
pub fn decode_block(block: &[u8], items: &mut Vec<Item>) -> io::Result<()> {
    if block.len() < BLOCK_HEADER_SIZE + BLOCK_CRC_SIZE {
        return Err(eof("block"));
    }

    let payload_end = block.len() - BLOCK_CRC_SIZE;
    let stored = u32::from_le_bytes(block[payload_end..].try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(&block[..payload_end]);
    if hasher.finalize() != stored {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "block checksum mismatch",
        ));
    }

    let num_items = u16::from_le_bytes(block[0..2].try_into().unwrap()) as usize;
    let min_hash = u32::from_le_bytes(block[2..6].try_into().unwrap());

    let data = &block[..payload_end];
    let mut pos = BLOCK_HEADER_SIZE;
    let mut prev_hash = min_hash;
    let mut prev_id = 0u32;

    items.reserve(num_items);
    for i in 0..num_items {
        let hash_delta = decode_vbyte(data, &mut pos)?;
        let id_value = decode_vbyte(data, &mut pos)?;
        let hash = prev_hash + hash_delta;
        let id = if i == 0 || hash_delta != 0 {
            id_value
        } else {
            prev_id + id_value
        };
        items.push(Item::new(hash, id));
        prev_hash = hash;
        prev_id = id;
    }

    Ok(())
}
