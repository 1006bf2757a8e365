//! Byte layouts shared with the kernel's TCMU driver, as published in
//! `include/uapi/linux/target_core_user.h`.
//!
//! The layouts are a fixed external contract: field order, padding and native
//! widths follow the kernel structures exactly, so every offset is spelled out
//! as a constant instead of relying on `#[repr(C)]` packing. Reserved fields are
//! written as zero and never read back.
//!
//! Widths the kernel fixes at compile time (pointer size, sense buffer size)
//! and the sizing choices of this driver (iovecs and inline CDB bytes per slot)
//! are carried in a [`LayoutConfig`], so fixtures for other targets can be
//! encoded on any host.

pub mod entry;
pub mod mailbox;

pub use entry::{
    CommandEntry, CommandId, EntryHeader, IoVec, KFLAG_RESPONSE, Opcode, Phase, RequestEntry,
    ResponseEntry, UFLAG_UNKNOWN_OP,
};
pub use mailbox::{MAILBOX_FLAG_CAP_OOOC, MAILBOX_SIZE, MAILBOX_VERSION, Mailbox};

use std::fmt::Write;

/// `TCMU_SENSE_BUFFERSIZE`
pub const SENSE_BUFFER_SIZE: usize = 96;

/// Commands with a CDB longer than 16 bytes are rare enough that slots don't
/// reserve room for them by default.
pub const MAX_CDB_SIZE: usize = 16;

/// Entry lengths are multiples of 8, which frees the low 3 bits of `len_op`
/// for the opcode.
pub const ENTRY_ALIGN: usize = 8;

/// Width of the `iov_base`/`iov_len` members of a `struct iovec`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    #[cfg(target_pointer_width = "64")]
    pub const NATIVE: PointerWidth = PointerWidth::Bits64;
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE: PointerWidth = PointerWidth::Bits32;

    pub const fn bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

/// Sizing of a ring slot.
///
/// A slot holds the entry header, the request shape, up to `max_iovecs`
/// iovecs and then `cdb_size` bytes of inline CDB, and is always large enough
/// for the response shape that later overwrites it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LayoutConfig {
    pub pointer_width: PointerWidth,
    /// Iovecs (data, bidi and dif together) a single request may carry.
    pub max_iovecs: usize,
    /// Inline CDB bytes reserved in each slot.
    pub cdb_size: usize,
    /// Length of the response's sense buffer.
    pub sense_size: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            pointer_width: PointerWidth::NATIVE,
            max_iovecs: 4,
            cdb_size: MAX_CDB_SIZE,
            sense_size: SENSE_BUFFER_SIZE,
        }
    }
}

impl LayoutConfig {
    /// Size of one `struct iovec`.
    pub const fn iovec_size(&self) -> usize {
        2 * self.pointer_width.bytes()
    }

    /// Bytes used by the request shape for `iovecs` vectors, header included.
    pub const fn request_size(&self, iovecs: usize) -> usize {
        entry::REQ_IOV0 + iovecs * self.iovec_size()
    }

    /// Bytes used by the response shape, header included.
    pub const fn response_size(&self) -> usize {
        entry::RSP_SENSE + self.sense_size
    }

    /// Offset of the inline CDB from the start of a slot.
    pub const fn cdb_offset(&self) -> usize {
        self.request_size(self.max_iovecs)
    }

    /// Size of one ring slot.
    pub const fn slot_size(&self) -> usize {
        let request = self.cdb_offset() + self.cdb_size;
        let response = self.response_size();
        let largest = if request > response { request } else { response };
        round_up(largest, ENTRY_ALIGN)
    }
}

pub(crate) const fn round_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Copies `N` bytes at `off` out of `buf`. Callers check bounds first.
pub(crate) fn field<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes(field(buf, off))
}

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes(field(buf, off))
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(field(buf, off))
}

/// Reads a pointer-sized value, widened to 64 bits.
pub(crate) fn get_ptr(buf: &[u8], off: usize, width: PointerWidth) -> u64 {
    match width {
        PointerWidth::Bits32 => u64::from(get_u32(buf, off)),
        PointerWidth::Bits64 => get_u64(buf, off),
    }
}

pub(crate) fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..off + bytes.len()].copy_from_slice(bytes);
}

/// Writes a pointer-sized value. 32-bit layouts keep the low half.
pub(crate) fn put_ptr(buf: &mut [u8], off: usize, val: u64, width: PointerWidth) {
    match width {
        PointerWidth::Bits32 => put(buf, off, &(val as u32).to_ne_bytes()),
        PointerWidth::Bits64 => put(buf, off, &val.to_ne_bytes()),
    }
}

/// Renders bytes as rows of 16 `0x%02x` values.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 5 + bytes.len() / 16 + 1);
    for (i, b) in bytes.iter().enumerate() {
        let _ = write!(out, "0x{b:02x}");
        out.push(if i % 16 == 15 { '\n' } else { ' ' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_slot_fits_both_shapes() {
        let layout = LayoutConfig {
            pointer_width: PointerWidth::Bits64,
            ..LayoutConfig::default()
        };
        assert_eq!(layout.iovec_size(), 16);
        assert_eq!(layout.request_size(0), 48);
        assert_eq!(layout.response_size(), 112);
        assert_eq!(layout.cdb_offset(), 48 + 4 * 16);
        assert_eq!(layout.slot_size(), 128);
        assert_eq!(layout.slot_size() % ENTRY_ALIGN, 0);
    }

    #[test]
    fn small_slot_is_sized_by_response() {
        let layout = LayoutConfig {
            pointer_width: PointerWidth::Bits32,
            max_iovecs: 1,
            cdb_size: 6,
            sense_size: SENSE_BUFFER_SIZE,
        };
        assert_eq!(layout.iovec_size(), 8);
        // request: 48 + 8 + 6 = 62, response: 16 + 96 = 112
        assert_eq!(layout.slot_size(), 112);
    }

    #[test]
    fn slot_size_rounds_to_entry_alignment() {
        let layout = LayoutConfig {
            pointer_width: PointerWidth::Bits64,
            max_iovecs: 8,
            cdb_size: 3,
            sense_size: 8,
        };
        // 48 + 128 + 3 = 179
        assert_eq!(layout.slot_size(), 184);
    }

    #[test]
    fn pointer_fields_follow_width() {
        let mut buf = [0u8; 8];
        put_ptr(&mut buf, 0, 0x1_0000_0023, PointerWidth::Bits32);
        assert_eq!(get_ptr(&buf, 0, PointerWidth::Bits32), 0x23);
        assert_eq!(&buf[4..], &[0; 4]);
        put_ptr(&mut buf, 0, 0x1_0000_0023, PointerWidth::Bits64);
        assert_eq!(get_ptr(&buf, 0, PointerWidth::Bits64), 0x1_0000_0023);
    }

    #[test]
    fn hexdump_wraps_every_16_bytes() {
        let dump = hexdump(&[0xab; 17]);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].split(' ').count(), 16);
        assert_eq!(lines[1].trim_end(), "0xab");
    }
}
