//! Log record framing.
//!
//! Leaf segments and branch files are both sequences of frames.
//!
//! # Layout
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0       4       checksum of [length | body] (little-endian)
//! 4       4       length of body (little-endian)
//! 8       length  body
//!
//! body := count:u32 | (len:u32 | bytes) * count
//! ```
//!
//! Part 0 of the body is a JSON header; the remaining parts are raw bytes
//! (key, record).

use serde::{Deserialize, Serialize};

use crate::common::{Checksum, PageId, Result};
use crate::storage::segment::Segment;

/// Size of the frame prefix (checksum + length).
pub const FRAME_PREFIX: usize = 8;

/// Header of a leaf segment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Header {
    /// Insert the record in parts `[key, value]` at `index`.
    Insert { index: usize },
    /// Delete (or ghost) the record at `index`.
    Delete { index: usize },
    /// Overwrite the record at `index` with parts `[key, value]`.
    Replace { index: usize },
    /// Set the right sibling.
    Right { id: Option<PageId> },
    /// Leading key of the page, in part 0.
    Key,
    /// Start from the replayed state of another segment.
    Load { id: PageId, segment: Segment },
    /// Append the live records of another segment and adopt its right sibling.
    Merge { id: PageId, segment: Segment },
    /// Keep records `[index, length)`.
    Slice { index: usize, length: usize },
    /// The named segment loads this one.
    Dependent { id: PageId, segment: Segment },
}

/// Header of a branch file record. The child's key, if any, is part 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEntry {
    pub id: PageId,
}

/// Encode one frame.
pub fn encode<H: Serialize>(checksum: Checksum, header: &H, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(header)?;

    let mut body = Vec::with_capacity(
        4 + 4 + header.len() + parts.iter().map(|part| 4 + part.len()).sum::<usize>(),
    );
    body.extend_from_slice(&(parts.len() as u32 + 1).to_le_bytes());
    body.extend_from_slice(&(header.len() as u32).to_le_bytes());
    body.extend_from_slice(&header);
    for part in parts {
        body.extend_from_slice(&(part.len() as u32).to_le_bytes());
        body.extend_from_slice(part);
    }

    let mut frame = Vec::with_capacity(FRAME_PREFIX + body.len());
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    let sum = checksum.compute(&frame[4..]);
    frame[..4].copy_from_slice(&sum.to_le_bytes());
    Ok(frame)
}

/// One decoded frame, borrowing from the buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub header: &'a [u8],
    pub parts: Vec<&'a [u8]>,
}

impl Frame<'_> {
    /// Parse the JSON header.
    pub fn header<'de, H: Deserialize<'de>>(&'de self) -> serde_json::Result<H> {
        serde_json::from_slice(self.header)
    }
}

/// Why a buffer stopped decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The final frame is incomplete or fails its checksum; everything before
    /// `offset` is intact.
    Torn { offset: usize },
    /// A frame inside the buffer is damaged.
    Corrupt { offset: usize, reason: String },
}

/// Iterates the frames of a buffer.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    offset: usize,
    checksum: Checksum,
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8], checksum: Checksum) -> Self {
        FrameReader {
            buf,
            offset: 0,
            checksum,
        }
    }

    /// Offset just past the last frame returned.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decode the next frame, `Ok(None)` at a clean end of buffer.
    pub fn next_frame(&mut self) -> std::result::Result<Option<Frame<'a>>, FrameError> {
        let start = self.offset;
        let remaining = self.buf.len() - start;
        if remaining == 0 {
            return Ok(None);
        }
        let torn = FrameError::Torn { offset: start };
        if remaining < FRAME_PREFIX {
            return Err(torn);
        }

        let expected = read_u32(self.buf, start).ok_or_else(|| torn.clone())?;
        let length = read_u32(self.buf, start + 4).ok_or_else(|| torn.clone())? as usize;
        let end = start + FRAME_PREFIX + length;
        if end > self.buf.len() {
            return Err(torn);
        }
        if !self.checksum.verify(&self.buf[start + 4..end], expected) {
            if end == self.buf.len() {
                return Err(torn);
            }
            return Err(FrameError::Corrupt {
                offset: start,
                reason: "checksum mismatch".into(),
            });
        }

        let body = &self.buf[start + FRAME_PREFIX..end];
        let corrupt = |reason: &str| FrameError::Corrupt {
            offset: start,
            reason: reason.into(),
        };
        let count = read_u32(body, 0).ok_or_else(|| corrupt("missing part count"))? as usize;
        if count == 0 {
            return Err(corrupt("frame has no header"));
        }
        let mut at = 4;
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let len = read_u32(body, at).ok_or_else(|| corrupt("missing part length"))? as usize;
            at += 4;
            let part = body
                .get(at..at + len)
                .ok_or_else(|| corrupt("part overruns frame"))?;
            parts.push(part);
            at += len;
        }
        if at != body.len() {
            return Err(corrupt("trailing bytes in frame"));
        }

        self.offset = end;
        let header = parts.remove(0);
        Ok(Some(Frame { header, parts }))
    }
}
