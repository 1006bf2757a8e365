//! Command ring entries.
//!
//! A slot starts with an [`EntryHeader`] followed by a union of two shapes: the
//! request the driver writes, and the response the kernel later writes over it
//! in place. Only one is meaningful at a time, so a decoded slot is a
//! [`CommandEntry`] variant picked by the [`Phase`] the caller expects, never
//! both views at once.

use super::{LayoutConfig, get_ptr, get_u16, get_u32, get_u64, put, put_ptr};
use crate::error::{Result, ensure_len};

/// Correlates a request with the response the kernel eventually writes for it.
pub type CommandId = u16;

// struct tcmu_cmd_entry_hdr
pub(crate) const LEN_OP: usize = 0;
pub(crate) const CMD_ID: usize = 4;
pub(crate) const KFLAGS: usize = 6;
pub(crate) const UFLAGS: usize = 7;
pub(crate) const HEADER_SIZE: usize = 8;

// req, 4 bytes of padding after iov_dif_cnt put cdb_off on an 8 byte boundary
pub(crate) const REQ_IOV_CNT: usize = 8;
pub(crate) const REQ_IOV_BIDI_CNT: usize = 12;
pub(crate) const REQ_IOV_DIF_CNT: usize = 16;
pub(crate) const REQ_CDB_OFF: usize = 24;
// __pad1 @ 32, __pad2 @ 40
pub(crate) const REQ_IOV0: usize = 48;

// rsp: __pad1 @ 9, __pad2 @ 10, __pad3 @ 12
pub(crate) const RSP_SCSI_STATUS: usize = 8;
pub(crate) const RSP_SENSE: usize = 16;

const OP_MASK: u32 = 0x7;

/// Set in `kflags` by the kernel once it has written a response into the slot.
pub const KFLAG_RESPONSE: u8 = 0x1;

/// `TCMU_UFLAG_UNKNOWN_OP`: the responder didn't recognise the entry's opcode.
pub const UFLAG_UNKNOWN_OP: u8 = 0x1;

/// `enum tcmu_opcode`, stored in the low 3 bits of `len_op`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Filler the reader skips over.
    Pad,
    Cmd,
    /// Any value this driver doesn't know about.
    Other(u8),
}

impl Opcode {
    fn from_bits(bits: u32) -> Self {
        match bits & OP_MASK {
            0 => Opcode::Pad,
            1 => Opcode::Cmd,
            other => Opcode::Other(other as u8),
        }
    }

    fn bits(self) -> u32 {
        match self {
            Opcode::Pad => 0,
            Opcode::Cmd => 1,
            Opcode::Other(bits) => u32::from(bits) & OP_MASK,
        }
    }
}

/// Which of the two overlaid shapes a slot is expected to hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

/// `struct tcmu_cmd_entry_hdr`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    /// Length of the whole entry in bytes, a multiple of 8.
    pub len: u32,
    pub op: Opcode,
    pub cmd_id: CommandId,
    /// Flags owned by the kernel side.
    pub kflags: u8,
    /// Flags owned by the userspace side.
    pub uflags: u8,
}

impl EntryHeader {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, HEADER_SIZE)?;
        let len_op = (self.len & !OP_MASK) | self.op.bits();
        put(buf, LEN_OP, &len_op.to_ne_bytes());
        put(buf, CMD_ID, &self.cmd_id.to_ne_bytes());
        buf[KFLAGS] = self.kflags;
        buf[UFLAGS] = self.uflags;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, HEADER_SIZE)?;
        let len_op = get_u32(buf, LEN_OP);
        Ok(Self {
            len: len_op & !OP_MASK,
            op: Opcode::from_bits(len_op),
            cmd_id: get_u16(buf, CMD_ID),
            kflags: buf[KFLAGS],
            uflags: buf[UFLAGS],
        })
    }
}

/// A `struct iovec`: the address and length of one data segment.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

/// The request shape of `struct tcmu_cmd_entry`.
///
/// The iovec array holds the data vectors, then the bidirectional ones, then
/// the integrity (dif) ones; the three counts are derived from the vector
/// lengths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestEntry {
    pub header: EntryHeader,
    /// Offset of the CDB from the start of the mapping.
    pub cdb_off: u64,
    pub iovecs: Vec<IoVec>,
    pub bidi_iovecs: Vec<IoVec>,
    pub dif_iovecs: Vec<IoVec>,
}

impl RequestEntry {
    fn iovec_count(&self) -> usize {
        self.iovecs.len() + self.bidi_iovecs.len() + self.dif_iovecs.len()
    }

    pub fn encode(&self, layout: &LayoutConfig, buf: &mut [u8]) -> Result<()> {
        let size = layout.request_size(self.iovec_count());
        ensure_len(buf, size)?;
        buf[..size].fill(0);
        self.header.encode(buf)?;
        put(buf, REQ_IOV_CNT, &(self.iovecs.len() as u32).to_ne_bytes());
        put(buf, REQ_IOV_BIDI_CNT, &(self.bidi_iovecs.len() as u32).to_ne_bytes());
        put(buf, REQ_IOV_DIF_CNT, &(self.dif_iovecs.len() as u32).to_ne_bytes());
        put(buf, REQ_CDB_OFF, &self.cdb_off.to_ne_bytes());

        let width = layout.pointer_width;
        let all = self
            .iovecs
            .iter()
            .chain(&self.bidi_iovecs)
            .chain(&self.dif_iovecs);
        for (i, iov) in all.enumerate() {
            let off = REQ_IOV0 + i * layout.iovec_size();
            put_ptr(buf, off, iov.base, width);
            put_ptr(buf, off + width.bytes(), iov.len, width);
        }
        Ok(())
    }

    pub fn decode(buf: &[u8], layout: &LayoutConfig) -> Result<Self> {
        ensure_len(buf, REQ_IOV0)?;
        let header = EntryHeader::decode(buf)?;
        let counts = [
            get_u32(buf, REQ_IOV_CNT) as usize,
            get_u32(buf, REQ_IOV_BIDI_CNT) as usize,
            get_u32(buf, REQ_IOV_DIF_CNT) as usize,
        ];
        let required = counts
            .iter()
            .try_fold(0usize, |acc, n| acc.checked_add(*n))
            .and_then(|total| total.checked_mul(layout.iovec_size()))
            .and_then(|bytes| bytes.checked_add(REQ_IOV0))
            .unwrap_or(usize::MAX);
        ensure_len(buf, required)?;

        let width = layout.pointer_width;
        let mut next = 0;
        let mut take = |count: usize| -> Vec<IoVec> {
            let out = (next..next + count)
                .map(|i| {
                    let off = REQ_IOV0 + i * layout.iovec_size();
                    IoVec {
                        base: get_ptr(buf, off, width),
                        len: get_ptr(buf, off + width.bytes(), width),
                    }
                })
                .collect();
            next += count;
            out
        };
        let iovecs = take(counts[0]);
        let bidi_iovecs = take(counts[1]);
        let dif_iovecs = take(counts[2]);

        Ok(Self {
            header,
            cdb_off: get_u64(buf, REQ_CDB_OFF),
            iovecs,
            bidi_iovecs,
            dif_iovecs,
        })
    }
}

/// The response shape of `struct tcmu_cmd_entry`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseEntry {
    pub header: EntryHeader,
    /// SAM status code; zero is GOOD.
    pub scsi_status: u8,
    /// Sense data, exactly `sense_size` bytes once decoded.
    pub sense: Vec<u8>,
}

impl ResponseEntry {
    /// Builds a response the way the kernel would write it, with the sense data
    /// zero-padded or truncated to the layout's sense buffer.
    pub fn new(cmd_id: CommandId, scsi_status: u8, sense: &[u8], layout: &LayoutConfig) -> Self {
        let mut padded = vec![0; layout.sense_size];
        let n = sense.len().min(padded.len());
        padded[..n].copy_from_slice(&sense[..n]);
        Self {
            header: EntryHeader {
                len: layout.slot_size() as u32,
                op: Opcode::Cmd,
                cmd_id,
                kflags: KFLAG_RESPONSE,
                uflags: 0,
            },
            scsi_status,
            sense: padded,
        }
    }

    pub fn cmd_id(&self) -> CommandId {
        self.header.cmd_id
    }

    pub fn status(&self) -> u8 {
        self.scsi_status
    }

    pub fn sense(&self) -> &[u8] {
        &self.sense
    }

    pub fn is_good(&self) -> bool {
        self.scsi_status == 0
    }

    pub fn unknown_op(&self) -> bool {
        self.header.uflags & UFLAG_UNKNOWN_OP != 0
    }

    pub fn encode(&self, layout: &LayoutConfig, buf: &mut [u8]) -> Result<()> {
        let size = layout.response_size();
        ensure_len(buf, size)?;
        buf[..size].fill(0);
        self.header.encode(buf)?;
        buf[RSP_SCSI_STATUS] = self.scsi_status;
        let n = self.sense.len().min(layout.sense_size);
        put(buf, RSP_SENSE, &self.sense[..n]);
        Ok(())
    }

    pub fn decode(buf: &[u8], layout: &LayoutConfig) -> Result<Self> {
        ensure_len(buf, layout.response_size())?;
        Ok(Self {
            header: EntryHeader::decode(buf)?,
            scsi_status: buf[RSP_SCSI_STATUS],
            sense: buf[RSP_SENSE..RSP_SENSE + layout.sense_size].to_vec(),
        })
    }
}

/// One decoded ring slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandEntry {
    Request(RequestEntry),
    Response(ResponseEntry),
    /// Filler with no body.
    Pad(EntryHeader),
}

impl CommandEntry {
    /// Decodes a slot as the shape `phase` says it holds. Pad entries decode as
    /// [`CommandEntry::Pad`] in either phase.
    pub fn decode(buf: &[u8], phase: Phase, layout: &LayoutConfig) -> Result<Self> {
        let header = EntryHeader::decode(buf)?;
        if header.op == Opcode::Pad {
            return Ok(CommandEntry::Pad(header));
        }
        Ok(match phase {
            Phase::Request => CommandEntry::Request(RequestEntry::decode(buf, layout)?),
            Phase::Response => CommandEntry::Response(ResponseEntry::decode(buf, layout)?),
        })
    }

    pub fn encode(&self, layout: &LayoutConfig, buf: &mut [u8]) -> Result<()> {
        match self {
            CommandEntry::Request(req) => req.encode(layout, buf),
            CommandEntry::Response(rsp) => rsp.encode(layout, buf),
            CommandEntry::Pad(header) => header.encode(buf),
        }
    }

    pub fn header(&self) -> &EntryHeader {
        match self {
            CommandEntry::Request(req) => &req.header,
            CommandEntry::Response(rsp) => &rsp.header,
            CommandEntry::Pad(header) => header,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::layout::{PointerWidth, SENSE_BUFFER_SIZE};

    fn layout64() -> LayoutConfig {
        LayoutConfig {
            pointer_width: PointerWidth::Bits64,
            ..LayoutConfig::default()
        }
    }

    fn header(cmd_id: CommandId) -> EntryHeader {
        EntryHeader {
            len: 0,
            op: Opcode::Cmd,
            cmd_id,
            kflags: 0x3,
            uflags: 0x4,
        }
    }

    #[test]
    fn request_fields_land_on_kernel_offsets() {
        let layout = layout64();
        let req = RequestEntry {
            header: header(0x2),
            cdb_off: 0x8,
            iovecs: vec![IoVec {
                base: 0x23,
                len: 0x24,
            }],
            bidi_iovecs: vec![],
            dif_iovecs: vec![],
        };
        // Dirty buffer: reserved fields must come out zeroed
        let mut buf = [0xffu8; 128];
        req.encode(&layout, &mut buf).unwrap();

        assert_eq!(&buf[0..4], &1u32.to_ne_bytes());
        assert_eq!(&buf[4..6], &2u16.to_ne_bytes());
        assert_eq!(buf[6], 0x3);
        assert_eq!(buf[7], 0x4);
        assert_eq!(&buf[8..12], &1u32.to_ne_bytes());
        assert_eq!(&buf[12..20], &[0; 8]);
        assert_eq!(&buf[20..24], &[0; 4]);
        assert_eq!(&buf[24..32], &8u64.to_ne_bytes());
        assert_eq!(&buf[32..48], &[0; 16]);
        assert_eq!(&buf[48..56], &0x23u64.to_ne_bytes());
        assert_eq!(&buf[56..64], &0x24u64.to_ne_bytes());
        assert!(buf[64..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn narrow_iovecs_on_32_bit_layouts() {
        let layout = LayoutConfig {
            pointer_width: PointerWidth::Bits32,
            ..LayoutConfig::default()
        };
        let req = RequestEntry {
            header: header(1),
            cdb_off: 0,
            iovecs: vec![
                IoVec {
                    base: 0x23,
                    len: 0x24,
                },
                IoVec {
                    base: 0x25,
                    len: 0x26,
                },
            ],
            bidi_iovecs: vec![],
            dif_iovecs: vec![],
        };
        let mut buf = [0u8; 64];
        req.encode(&layout, &mut buf).unwrap();
        assert_eq!(&buf[48..52], &0x23u32.to_ne_bytes());
        assert_eq!(&buf[52..56], &0x24u32.to_ne_bytes());
        assert_eq!(&buf[56..60], &0x25u32.to_ne_bytes());
        assert_eq!(RequestEntry::decode(&buf, &layout).unwrap(), req);
    }

    #[test]
    fn request_round_trips_with_every_vector_kind() {
        let layout = layout64();
        let iov = |n: u64| IoVec {
            base: 0x1000 * n,
            len: 512 * n,
        };
        let req = RequestEntry {
            header: EntryHeader {
                len: layout.slot_size() as u32,
                ..header(77)
            },
            cdb_off: 4096 + 112,
            iovecs: vec![iov(1), iov(2)],
            bidi_iovecs: vec![iov(3)],
            dif_iovecs: vec![iov(4)],
        };
        let mut buf = vec![0u8; layout.slot_size()];
        req.encode(&layout, &mut buf).unwrap();
        assert_eq!(&buf[8..12], &2u32.to_ne_bytes());
        assert_eq!(&buf[12..16], &1u32.to_ne_bytes());
        assert_eq!(&buf[16..20], &1u32.to_ne_bytes());
        assert_eq!(RequestEntry::decode(&buf, &layout).unwrap(), req);
    }

    #[test]
    fn response_fields_land_on_kernel_offsets() {
        let layout = layout64();
        let rsp = ResponseEntry::new(9, 0x2, &[0x6, 0x7], &layout);
        let mut buf = [0xffu8; 128];
        rsp.encode(&layout, &mut buf).unwrap();

        assert_eq!(buf[8], 0x2);
        assert_eq!(&buf[9..16], &[0; 7]);
        assert_eq!(buf[16], 0x6);
        assert_eq!(buf[17], 0x7);
        assert!(buf[18..16 + SENSE_BUFFER_SIZE].iter().all(|b| *b == 0));
        assert_eq!(buf[6], KFLAG_RESPONSE);

        let decoded = ResponseEntry::decode(&buf, &layout).unwrap();
        assert_eq!(decoded, rsp);
        assert_eq!(decoded.cmd_id(), 9);
        assert!(!decoded.is_good());
        assert!(!decoded.unknown_op());
    }

    #[test]
    fn long_sense_is_truncated() {
        let layout = LayoutConfig {
            sense_size: 4,
            ..layout64()
        };
        let rsp = ResponseEntry::new(1, 0, &[1, 2, 3, 4, 5, 6], &layout);
        assert_eq!(rsp.sense(), &[1, 2, 3, 4]);
    }

    #[test]
    fn request_claiming_more_iovecs_than_fit_is_rejected() {
        let layout = layout64();
        let mut buf = [0u8; 64];
        header(1).encode(&mut buf).unwrap();
        put(&mut buf, REQ_IOV_CNT, &5u32.to_ne_bytes());
        let e = RequestEntry::decode(&buf, &layout).expect_err("5 iovecs need 128 bytes");
        assert!(matches!(
            e,
            Error::InvalidBufferSize {
                required: 128,
                actual: 64
            }
        ));
    }

    #[test]
    fn phase_selects_shape() {
        let layout = layout64();
        let mut buf = vec![0u8; layout.slot_size()];
        ResponseEntry::new(4, 0, &[], &layout)
            .encode(&layout, &mut buf)
            .unwrap();
        let entry = CommandEntry::decode(&buf, Phase::Response, &layout).unwrap();
        assert!(matches!(entry, CommandEntry::Response(ref r) if r.cmd_id() == 4));
        assert_eq!(entry.header().kflags, KFLAG_RESPONSE);

        let pad = EntryHeader {
            len: layout.slot_size() as u32,
            op: Opcode::Pad,
            cmd_id: 0,
            kflags: 0,
            uflags: 0,
        };
        pad.encode(&mut buf).unwrap();
        for phase in [Phase::Request, Phase::Response] {
            let entry = CommandEntry::decode(&buf, phase, &layout).unwrap();
            assert_eq!(entry, CommandEntry::Pad(pad));
        }
    }

    #[test]
    fn unknown_opcode_survives_decoding() {
        let mut buf = [0u8; HEADER_SIZE];
        put(&mut buf, LEN_OP, &(128u32 | 0x5).to_ne_bytes());
        let header = EntryHeader::decode(&buf).unwrap();
        assert_eq!(header.op, Opcode::Other(5));
        assert_eq!(header.len, 128);
    }
}
