//! Scatter-gather buffers for command data
//!
//! A command's data buffer is held as a list of fixed-size segments. PDU
//! payloads are received straight into the runs a byte range maps to, and
//! transmitted from them without first flattening the buffer.

use crate::error::{IscsiError, IscsiResult};

pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// Portion of one segment covered by a mapped byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRun {
    pub segment: usize,
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterList {
    segments: Vec<Vec<u8>>,
    len: usize,
}

impl ScatterList {
    /// Zero-filled buffer of `len` bytes split into default-sized segments
    pub fn new(len: usize) -> Self {
        Self::with_segment_size(len, DEFAULT_SEGMENT_SIZE)
    }

    pub fn with_segment_size(len: usize, segment_size: usize) -> Self {
        let segment_size = segment_size.max(1);
        let mut segments = Vec::with_capacity(len.div_ceil(segment_size));
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(segment_size);
            segments.push(vec![0u8; n]);
            remaining -= n;
        }
        ScatterList { segments, len }
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        let len = segments.iter().map(Vec::len).sum();
        ScatterList { segments, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn check_range(&self, offset: usize, len: usize) -> IscsiResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(IscsiError::InvalidPdu(format!(
                "range {}+{} outside {} byte buffer",
                offset, len, self.len
            ))),
        }
    }

    /// Segment runs covering `offset..offset + len`
    pub fn map(&self, offset: usize, len: usize) -> IscsiResult<Vec<SegmentRun>> {
        self.check_range(offset, len)?;
        let mut runs = Vec::new();
        let mut skip = offset;
        let mut remaining = len;
        for (i, seg) in self.segments.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let take = (seg.len() - skip).min(remaining);
            runs.push(SegmentRun {
                segment: i,
                start: skip,
                len: take,
            });
            skip = 0;
            remaining -= take;
        }
        Ok(runs)
    }

    pub fn slices(&self, offset: usize, len: usize) -> IscsiResult<Vec<&[u8]>> {
        Ok(self
            .map(offset, len)?
            .into_iter()
            .map(|r| &self.segments[r.segment][r.start..r.start + r.len])
            .collect())
    }

    pub fn slices_mut(&mut self, offset: usize, len: usize) -> IscsiResult<Vec<&mut [u8]>> {
        self.check_range(offset, len)?;
        let mut out = Vec::new();
        let mut skip = offset;
        let mut remaining = len;
        for seg in self.segments.iter_mut() {
            if remaining == 0 {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let take = (seg.len() - skip).min(remaining);
            out.push(&mut seg[skip..skip + take]);
            skip = 0;
            remaining -= take;
        }
        Ok(out)
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> IscsiResult<()> {
        let mut src = data;
        for dst in self.slices_mut(offset, data.len())? {
            let (head, tail) = src.split_at(dst.len());
            dst.copy_from_slice(head);
            src = tail;
        }
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> IscsiResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for s in self.slices(offset, len)? {
            out.extend_from_slice(s);
        }
        Ok(out)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }

    /// Copy as much of `data` as fits, returning the byte count copied
    pub fn fill_from(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.len);
        // in range by construction
        let _ = self.write_at(0, &data[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_crosses_segments() {
        let sgl = ScatterList::with_segment_size(10, 4);
        assert_eq!(sgl.segment_count(), 3);
        let runs = sgl.map(3, 6).unwrap();
        assert_eq!(
            runs,
            vec![
                SegmentRun { segment: 0, start: 3, len: 1 },
                SegmentRun { segment: 1, start: 0, len: 4 },
                SegmentRun { segment: 2, start: 0, len: 1 },
            ]
        );
        assert!(sgl.map(8, 3).is_err());
        assert!(sgl.map(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read_back() {
        let mut sgl = ScatterList::with_segment_size(9, 2);
        sgl.write_at(1, b"abcdef").unwrap();
        assert_eq!(sgl.read_at(1, 6).unwrap(), b"abcdef");
        assert_eq!(sgl.to_vec(), b"\0abcdef\0\0");
    }

    #[test]
    fn test_receive_into_mutable_runs() {
        let mut sgl = ScatterList::with_segment_size(8, 3);
        let src: Vec<u8> = (1..=5).collect();
        let mut pos = 0;
        for run in sgl.slices_mut(2, 5).unwrap() {
            let n = run.len();
            run.copy_from_slice(&src[pos..pos + n]);
            pos += n;
        }
        assert_eq!(sgl.to_vec(), vec![0, 0, 1, 2, 3, 4, 5, 0]);
    }

    #[test]
    fn test_fill_truncates() {
        let mut sgl = ScatterList::new(4);
        assert_eq!(sgl.fill_from(b"123456"), 4);
        assert_eq!(sgl.to_vec(), b"1234");
        assert!(ScatterList::new(0).is_empty());
    }
}
