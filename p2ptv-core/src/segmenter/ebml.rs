//! EBML variable-length integer primitives

use crate::{Error, Result};

pub const EBML_HEADER: u32 = 0x1A45_DFA3;
pub const SEGMENT: u32 = 0x1853_8067;
pub const SEEK_HEAD: u32 = 0x114D_9B74;
pub const INFO: u32 = 0x1549_A966;
pub const TRACKS: u32 = 0x1654_AE6B;
pub const CHAPTERS: u32 = 0x1043_A770;
pub const CLUSTER: u32 = 0x1F43_B675;
pub const CUES: u32 = 0x1C53_BB6B;
pub const ATTACHMENTS: u32 = 0x1941_A469;
pub const TAGS: u32 = 0x1254_C367;

pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
pub const CLUSTER_TIMECODE: u32 = 0xE7;

/// Nanoseconds per timecode tick when `Info` does not say otherwise
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Byte pattern of [`EBML_HEADER`], used to resynchronise
pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Whether `id` may appear directly inside a Segment
#[must_use]
pub const fn is_top_level(id: u32) -> bool {
    matches!(
        id,
        EBML_HEADER
            | SEGMENT
            | SEEK_HEAD
            | INFO
            | TRACKS
            | CHAPTERS
            | CLUSTER
            | CUES
            | ATTACHMENTS
            | TAGS
    )
}

/// Data size of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    Known(u64),
    /// All value bits set: the element runs until something ends it
    Unknown,
}

/// Parsed element header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    /// Element id including its length marker
    pub id: u32,
    pub size: ElementSize,
    /// Bytes taken by id and size
    pub header_len: usize,
}

impl ElementHeader {
    /// Header plus data size, when known
    #[must_use]
    pub fn total_len(&self) -> Option<u64> {
        match self.size {
            ElementSize::Known(size) => Some(self.header_len as u64 + size),
            ElementSize::Unknown => None,
        }
    }
}

/// Read an element id. `Ok(None)` means more bytes are needed.
pub fn read_element_id(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let len = first.leading_zeros() as usize + 1;
    if len > 4 {
        return Err(Error::Demux(format!("invalid element id lead byte {first:#04x}")));
    }
    if buf.len() < len {
        return Ok(None);
    }
    let id = buf[..len]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    Ok(Some((id, len)))
}

/// Read an element data size. `Ok(None)` means more bytes are needed.
pub fn read_size(buf: &[u8]) -> Result<Option<(ElementSize, usize)>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let len = first.leading_zeros() as usize + 1;
    if len > 8 {
        return Err(Error::Demux("invalid element size lead byte 0x00".to_string()));
    }
    if buf.len() < len {
        return Ok(None);
    }

    // an 8-byte size keeps no value bits in the lead byte
    let marker_mask = 0xFFu8.checked_shr(len as u32).unwrap_or(0);
    let mut value = u64::from(first & marker_mask);
    let mut all_ones = (first & marker_mask) == marker_mask;
    for &b in &buf[1..len] {
        value = (value << 8) | u64::from(b);
        all_ones &= b == 0xFF;
    }

    let size = if all_ones {
        ElementSize::Unknown
    } else {
        ElementSize::Known(value)
    };
    Ok(Some((size, len)))
}

/// Read a complete element header. `Ok(None)` means more bytes are needed.
pub fn read_element_header(buf: &[u8]) -> Result<Option<ElementHeader>> {
    let Some((id, id_len)) = read_element_id(buf)? else {
        return Ok(None);
    };
    let Some((size, size_len)) = read_size(&buf[id_len..])? else {
        return Ok(None);
    };
    Ok(Some(ElementHeader {
        id,
        size,
        header_len: id_len + size_len,
    }))
}

/// Big-endian unsigned integer element payload (0 to 8 bytes)
pub fn read_uint(data: &[u8]) -> Result<u64> {
    if data.len() > 8 {
        return Err(Error::Demux(format!(
            "unsigned integer of {} bytes",
            data.len()
        )));
    }
    Ok(data.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Find the first child with `id` among the fully buffered children in `body`
pub fn find_child_uint(body: &[u8], id: u32) -> Result<Option<u64>> {
    let mut pos = 0;
    while pos < body.len() {
        let Some(header) = read_element_header(&body[pos..])? else {
            return Ok(None);
        };
        let ElementSize::Known(size) = header.size else {
            return Ok(None);
        };
        let start = pos + header.header_len;
        let Some(end) = usize::try_from(size).ok().and_then(|s| start.checked_add(s)) else {
            return Ok(None);
        };
        if end > body.len() {
            return Ok(None);
        }
        if header.id == id {
            return read_uint(&body[start..end]).map(Some);
        }
        pos = end;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_element_id() {
        assert_eq!(read_element_id(&[0xE7, 0x81]).unwrap(), Some((0xE7, 1)));
        assert_eq!(
            read_element_id(&EBML_MAGIC).unwrap(),
            Some((EBML_HEADER, 4))
        );
        assert_eq!(read_element_id(&[0x1A, 0x45]).unwrap(), None);
        assert!(read_element_id(&[0x00]).is_err());
        assert!(read_element_id(&[0x08, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_read_size() {
        assert_eq!(read_size(&[0x81]).unwrap(), Some((ElementSize::Known(1), 1)));
        assert_eq!(
            read_size(&[0x40, 0x02]).unwrap(),
            Some((ElementSize::Known(2), 2))
        );
        assert_eq!(read_size(&[0xFF]).unwrap(), Some((ElementSize::Unknown, 1)));
        assert_eq!(
            read_size(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap(),
            Some((ElementSize::Unknown, 8))
        );
        assert_eq!(read_size(&[0x10, 0x00]).unwrap(), None);
        assert!(read_size(&[0x00]).is_err());
    }

    #[test]
    fn test_read_element_header() {
        let header = read_element_header(&[0x1F, 0x43, 0xB6, 0x75, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF])
            .unwrap()
            .unwrap();
        assert_eq!(header.id, CLUSTER);
        assert_eq!(header.size, ElementSize::Unknown);
        assert_eq!(header.header_len, 12);
        assert_eq!(header.total_len(), None);
    }

    #[test]
    fn test_find_child_uint() {
        // Timecode (E7) = 0x0102 preceded by a Void element
        let body = [0xEC, 0x81, 0x00, 0xE7, 0x82, 0x01, 0x02];
        assert_eq!(find_child_uint(&body, CLUSTER_TIMECODE).unwrap(), Some(0x0102));
        assert_eq!(find_child_uint(&body, TIMECODE_SCALE).unwrap(), None);
    }
}
