//! Data-In sequencing
//!
//! Read data is split into PDUs no larger than the initiator's
//! MaxRecvDataSegmentLength, grouped into bursts of MaxBurstLength. The last
//! PDU of each burst carries F; the last PDU of the command carries S plus
//! status unless sense data has to follow in a separate SCSI Response.

use crate::command::Residual;
use crate::pdu::flags;

/// Placement of one Data-In PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInValues {
    pub offset: u32,
    pub length: u32,
    pub data_sn: u32,
    pub end_of_burst: bool,
    pub last: bool,
}

/// Lay out `total` bytes of read data
pub fn datain_layout(total: u32, max_segment: u32, max_burst: u32) -> Vec<DataInValues> {
    let max_segment = max_segment.max(1);
    let max_burst = max_burst.max(1);
    let mut out = Vec::new();
    let mut offset = 0u32;
    let mut burst_used = 0u32;
    let mut data_sn = 0u32;
    while offset < total {
        let length = max_segment.min(max_burst - burst_used).min(total - offset);
        offset += length;
        burst_used += length;
        let last = offset == total;
        let end_of_burst = last || burst_used == max_burst;
        if end_of_burst {
            burst_used = 0;
        }
        out.push(DataInValues {
            offset: offset - length,
            length,
            data_sn,
            end_of_burst,
            last,
        });
        data_sn = data_sn.wrapping_add(1);
    }
    out
}

/// PDUs a Data/R2T SNACK asks to be resent; a zero run length means
/// "everything from `begrun` on".
pub fn datain_range(layout: &[DataInValues], begrun: u32, run_length: u32) -> Vec<DataInValues> {
    layout
        .iter()
        .filter(|v| v.data_sn >= begrun && (run_length == 0 || v.data_sn - begrun < run_length))
        .copied()
        .collect()
}

/// Flag byte of a Data-In PDU
///
/// Status is carried only on the last PDU, and only when no sense data needs
/// a separate response.
pub fn datain_flags(v: &DataInValues, carries_status: bool, residual: Residual) -> u8 {
    let mut f = 0;
    if v.end_of_burst {
        f |= flags::FINAL;
    }
    if v.last && carries_status {
        f |= flags::FINAL | flags::DATA_STATUS;
        f |= residual_flags(residual);
    }
    f
}

/// O/U residual bits shared by Data-In and SCSI Response
pub fn residual_flags(residual: Residual) -> u8 {
    match residual {
        Residual::None => 0,
        Residual::Underflow(_) => flags::RESIDUAL_UNDERFLOW,
        Residual::Overflow(_) => flags::RESIDUAL_OVERFLOW,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pdu() {
        let layout = datain_layout(512, 8192, 262_144);
        assert_eq!(layout.len(), 1);
        assert!(layout[0].last && layout[0].end_of_burst);
        assert_eq!(layout[0].data_sn, 0);
    }

    #[test]
    fn test_segments_and_bursts() {
        // 20 KiB with 8 KiB segments and 12 KiB bursts
        let layout = datain_layout(20 * 1024, 8192, 12 * 1024);
        let lens: Vec<u32> = layout.iter().map(|v| v.length).collect();
        assert_eq!(lens, vec![8192, 4096, 8192]);
        assert_eq!(layout[1].offset, 8192);
        assert!(!layout[0].end_of_burst);
        assert!(layout[1].end_of_burst);
        assert!(layout[2].last);
        assert_eq!(layout.iter().map(|v| v.data_sn).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(datain_layout(0, 8192, 8192).is_empty());
    }

    #[test]
    fn test_status_flags() {
        let layout = datain_layout(100, 64, 1024);
        assert_eq!(datain_flags(&layout[0], true, Residual::None), 0);
        let f = datain_flags(&layout[1], true, Residual::Underflow(12));
        assert_eq!(f, flags::FINAL | flags::DATA_STATUS | flags::RESIDUAL_UNDERFLOW);
        // sense pending: the last PDU ends the burst but carries no status
        assert_eq!(datain_flags(&layout[1], false, Residual::None), flags::FINAL);
    }

    #[test]
    fn test_snack_range() {
        let layout = datain_layout(10 * 512, 512, 1 << 20);
        let r = datain_range(&layout, 3, 2);
        assert_eq!(r.iter().map(|v| v.data_sn).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(datain_range(&layout, 8, 0).len(), 2);
    }
}
