//! The mailbox header at the start of the shared region.

use super::{get_u16, get_u32, put};
use crate::error::{Result, ensure_len};

/// `TCMU_MAILBOX_VERSION`
pub const MAILBOX_VERSION: u16 = 2;

/// `TCMU_MAILBOX_FLAG_CAP_OOOC`: the kernel accepts completions out of
/// submission order.
pub const MAILBOX_FLAG_CAP_OOOC: u16 = 1 << 0;

pub(crate) const VERSION: usize = 0;
pub(crate) const FLAGS: usize = 2;
pub(crate) const CMDR_OFF: usize = 4;
pub(crate) const CMDR_SIZE: usize = 8;
pub(crate) const CMD_HEAD: usize = 12;
/// `cmd_tail` is aligned to its own cache line so the two sides don't share one.
pub(crate) const CMD_TAIL: usize = 64;

/// `sizeof(struct tcmu_mailbox)`
pub const MAILBOX_SIZE: usize = CMD_TAIL + 4;

/// `struct tcmu_mailbox`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Mailbox {
    pub version: u16,
    pub flags: u16,
    /// Offset of the command ring from the start of the mapping.
    pub cmdr_off: u32,
    /// Size of the command ring in bytes.
    pub cmdr_size: u32,
    /// Ring offset up to which the kernel has answered entries.
    pub cmd_head: u32,
    /// Ring offset up to which the driver has published entries.
    pub cmd_tail: u32,
}

impl Mailbox {
    /// Writes the mailbox into the first [`MAILBOX_SIZE`] bytes of `buf`,
    /// zeroing the reserved bytes between `cmd_head` and `cmd_tail`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        ensure_len(buf, MAILBOX_SIZE)?;
        buf[..MAILBOX_SIZE].fill(0);
        put(buf, VERSION, &self.version.to_ne_bytes());
        put(buf, FLAGS, &self.flags.to_ne_bytes());
        put(buf, CMDR_OFF, &self.cmdr_off.to_ne_bytes());
        put(buf, CMDR_SIZE, &self.cmdr_size.to_ne_bytes());
        put(buf, CMD_HEAD, &self.cmd_head.to_ne_bytes());
        put(buf, CMD_TAIL, &self.cmd_tail.to_ne_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, MAILBOX_SIZE)?;
        Ok(Self {
            version: get_u16(buf, VERSION),
            flags: get_u16(buf, FLAGS),
            cmdr_off: get_u32(buf, CMDR_OFF),
            cmdr_size: get_u32(buf, CMDR_SIZE),
            cmd_head: get_u32(buf, CMD_HEAD),
            cmd_tail: get_u32(buf, CMD_TAIL),
        })
    }

    pub fn supports_out_of_order(&self) -> bool {
        self.flags & MAILBOX_FLAG_CAP_OOOC != 0
    }
}
