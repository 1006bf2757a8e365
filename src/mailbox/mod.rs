//! The driver side of the shared mailbox and command ring.
//!
//! The driver publishes requests at `cmd_tail`; the kernel answers them in
//! completion order, writing each response over the oldest unanswered slot and
//! moving `cmd_head` past it. Responses carry the command id they answer, so
//! the slot a response lands in says nothing about which request it belongs
//! to.
//!
//! All driver-side state sits behind one lock. Entries are written in full
//! before `cmd_tail` is published with a release store, and `cmd_head` is read
//! with an acquire load before any answered slot is decoded.

pub mod region;
pub mod uio;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::Ordering;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::cdb::CommandBlock;
use crate::error::{Error, Result};
use crate::layout::entry::HEADER_SIZE;
use crate::layout::mailbox::{CMD_HEAD, CMD_TAIL};
use crate::layout::{
    CommandId, ENTRY_ALIGN, EntryHeader, IoVec, KFLAG_RESPONSE, LayoutConfig, MAILBOX_SIZE,
    MAILBOX_VERSION, Mailbox, Opcode, RequestEntry, ResponseEntry, hexdump,
};
use crate::ring::{self, RingCursor};
use region::SharedRegion;

/// A command as handed to the driver: the CDB plus the data segments it
/// refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    pub cdb: CommandBlock,
    pub iovecs: Vec<IoVec>,
    pub bidi_iovecs: Vec<IoVec>,
    pub dif_iovecs: Vec<IoVec>,
}

impl CommandRequest {
    pub fn new(cdb: CommandBlock) -> Self {
        Self {
            cdb,
            iovecs: Vec::new(),
            bidi_iovecs: Vec::new(),
            dif_iovecs: Vec::new(),
        }
    }

    pub fn with_iovec(mut self, iov: IoVec) -> Self {
        self.iovecs.push(iov);
        self
    }

    pub fn with_bidi_iovec(mut self, iov: IoVec) -> Self {
        self.bidi_iovecs.push(iov);
        self
    }

    pub fn with_dif_iovec(mut self, iov: IoVec) -> Self {
        self.dif_iovecs.push(iov);
        self
    }

    fn iovec_count(&self) -> usize {
        self.iovecs.len() + self.bidi_iovecs.len() + self.dif_iovecs.len()
    }
}

/// Decodes the mailbox at the start of `region`. Nothing is written.
pub fn read_mailbox<R: SharedRegion + ?Sized>(region: &R) -> Result<Mailbox> {
    let mut raw = [0u8; MAILBOX_SIZE];
    region.read_at(0, &mut raw)?;
    Mailbox::decode(&raw)
}

/// Where the ring lives inside the mapping and how it is cut into slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingGeometry {
    pub cmdr_off: u32,
    pub cmdr_size: u32,
    pub slot_size: u32,
    pub slot_count: NonZeroU32,
}

impl RingGeometry {
    /// Validates the mailbox's ring description against the mapping and the
    /// slot size.
    pub fn from_mailbox(
        mailbox: &Mailbox,
        layout: &LayoutConfig,
        region_len: usize,
    ) -> Result<Self> {
        let slot_size = layout.slot_size();
        let cmdr_off = mailbox.cmdr_off as usize;
        let cmdr_size = mailbox.cmdr_size as usize;

        if cmdr_off < MAILBOX_SIZE || cmdr_off % ENTRY_ALIGN != 0 {
            return Err(Error::corrupt(format!(
                "ring offset {cmdr_off} overlaps the mailbox or is unaligned"
            )));
        }
        if cmdr_off.checked_add(cmdr_size).is_none_or(|end| end > region_len) {
            return Err(Error::corrupt(format!(
                "ring of {cmdr_size} bytes at {cmdr_off} runs past the {region_len} byte mapping"
            )));
        }
        if cmdr_size % slot_size != 0 {
            return Err(Error::corrupt(format!(
                "ring size {cmdr_size} is not a multiple of the {slot_size} byte slot"
            )));
        }
        let slot_count = cmdr_size / slot_size;
        // Command ids are 16 bits wide and 0 is never handed out.
        if slot_count >= usize::from(CommandId::MAX) {
            return Err(Error::corrupt(format!(
                "{slot_count} slots outnumber the command ids"
            )));
        }
        let slot_count = NonZeroU32::new(slot_count as u32)
            .ok_or_else(|| Error::corrupt("ring has no slots"))?;

        Ok(Self {
            cmdr_off: mailbox.cmdr_off,
            cmdr_size: mailbox.cmdr_size,
            slot_size: slot_size as u32,
            slot_count,
        })
    }

    /// Offset of slot `index` from the start of the mapping.
    pub fn slot_offset(&self, index: u32) -> usize {
        self.cmdr_off as usize + self.ring_offset(index) as usize
    }

    /// Offset of slot `index` from the start of the ring, the unit the
    /// mailbox cursors are kept in.
    pub fn ring_offset(&self, index: u32) -> u32 {
        index * self.slot_size
    }

    /// Slot index of a ring offset read from the mailbox.
    pub fn index_of(&self, ring_offset: u32) -> Result<u32> {
        if ring_offset >= self.cmdr_size || ring_offset % self.slot_size != 0 {
            return Err(Error::corrupt(format!(
                "cursor {ring_offset} is not a slot boundary inside the {} byte ring",
                self.cmdr_size
            )));
        }
        Ok(ring_offset / self.slot_size)
    }
}

struct DriverState {
    cursor: RingCursor,
    next_id: CommandId,
    in_flight: HashSet<CommandId>,
    /// Set once the mailbox has been caught breaking the kernel contract.
    poisoned: Option<String>,
}

impl DriverState {
    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(Error::CorruptMailbox(reason.clone())),
            None => Ok(()),
        }
    }

    /// Records a fatal error so nothing else is read from or written to the
    /// ring.
    fn poison(&mut self, e: &Error) {
        if let Error::CorruptMailbox(reason) = e {
            error!("mailbox corrupt, abandoning the ring: {reason}");
            self.poisoned.get_or_insert_with(|| reason.clone());
        }
    }

    /// Returns the next id that's neither 0 nor still in flight.
    fn allocate_id(&mut self) -> Option<CommandId> {
        for _ in 0..CommandId::MAX {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if id != 0 && !self.in_flight.contains(&id) {
                return Some(id);
            }
        }
        None
    }
}

/// Owns a mapped mailbox and serializes the driver's access to it.
///
/// Dropping the driver releases the region.
pub struct MailboxDriver<R> {
    region: R,
    layout: LayoutConfig,
    geometry: RingGeometry,
    state: Mutex<DriverState>,
}

impl<R: SharedRegion> MailboxDriver<R> {
    /// Reads the mailbox at the start of `region`, checks the ring geometry
    /// and lines the cursors up with the kernel's `cmd_head`.
    ///
    /// The mapping may have carried traffic before, so the ring doesn't have
    /// to start at slot 0, but it must be idle: `cmd_tail` has to equal
    /// `cmd_head`.
    ///
    /// On error the region is dropped along with everything else.
    #[tracing::instrument(skip(region), fields(len = region.len()))]
    pub fn attach(region: R, layout: LayoutConfig) -> Result<Self> {
        let mailbox = read_mailbox(&region)?;
        debug!(
            version = mailbox.version,
            flags = mailbox.flags,
            cmdr_off = mailbox.cmdr_off,
            cmdr_size = mailbox.cmdr_size,
            cmd_head = mailbox.cmd_head,
            cmd_tail = mailbox.cmd_tail,
            "got a TCMU mailbox"
        );
        if mailbox.version != MAILBOX_VERSION {
            warn!(
                "mailbox version {} differs from the supported {MAILBOX_VERSION}",
                mailbox.version
            );
        }

        let geometry = RingGeometry::from_mailbox(&mailbox, &layout, region.len())?;
        debug!(
            slot_size = geometry.slot_size,
            slots = geometry.slot_count.get(),
            "ring geometry"
        );

        let driver = Self {
            region,
            layout,
            geometry,
            state: Mutex::new(DriverState {
                cursor: RingCursor::new(geometry.slot_count),
                next_id: 1,
                in_flight: HashSet::new(),
                poisoned: None,
            }),
        };
        driver.reset()?;
        Ok(driver)
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    /// A snapshot of the mailbox as it is right now.
    pub fn mailbox(&self) -> Result<Mailbox> {
        read_mailbox(&self.region)
    }

    /// Number of commands published but not yet answered and polled.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Restarts both cursors at the slot the kernel's `cmd_head` points to,
    /// slot 0 on a fresh mapping, and publishes the matching `cmd_tail`.
    ///
    /// Only valid while nothing is outstanding, on either side of the ring,
    /// which in practice means right after attaching.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_poisoned()?;
        let outstanding = (state.cursor.occupied() as usize).max(state.in_flight.len());
        if outstanding > 0 {
            return Err(Error::CommandsOutstanding(outstanding));
        }

        let raw_head = self.region.load_u32(CMD_HEAD, Ordering::Acquire)?;
        let raw_tail = self.region.load_u32(CMD_TAIL, Ordering::Relaxed)?;
        let head = self.geometry.index_of(raw_head)?;
        let tail = self.geometry.index_of(raw_tail)?;
        if head != tail {
            // published before this driver took over and never answered
            let unanswered = ring::distance(head, tail, self.geometry.slot_count);
            return Err(Error::CommandsOutstanding(unanswered as usize));
        }
        state.cursor.reset_at(head);
        state.next_id = 1;
        self.region
            .store_u32(CMD_TAIL, self.geometry.ring_offset(head), Ordering::Release)?;
        debug!(slot = head, "ring cursors reset");
        Ok(())
    }

    /// Writes `request` into the next free slot and publishes it to the
    /// kernel.
    pub fn submit(&self, request: &CommandRequest) -> Result<CommandId> {
        if request.iovec_count() > self.layout.max_iovecs {
            return Err(Error::TooManyIovecs {
                count: request.iovec_count(),
                max: self.layout.max_iovecs,
            });
        }
        if request.cdb.len() > self.layout.cdb_size {
            return Err(Error::CdbTooLong {
                len: request.cdb.len(),
                max: self.layout.cdb_size,
            });
        }

        let mut state = self.state.lock();
        state.check_poisoned()?;
        if state.cursor.is_full() {
            return Err(Error::RingFull {
                capacity: self.geometry.slot_count.get(),
            });
        }
        let id = state.allocate_id().ok_or(Error::RingFull {
            capacity: self.geometry.slot_count.get(),
        })?;

        let index = state.cursor.tail().index;
        let slot = self.geometry.slot_offset(index);
        let cdb_at = self.layout.cdb_offset();
        let entry = RequestEntry {
            header: EntryHeader {
                len: self.geometry.slot_size,
                op: Opcode::Cmd,
                cmd_id: id,
                kflags: 0,
                uflags: 0,
            },
            cdb_off: (slot + cdb_at) as u64,
            iovecs: request.iovecs.clone(),
            bidi_iovecs: request.bidi_iovecs.clone(),
            dif_iovecs: request.dif_iovecs.clone(),
        };
        let mut buf = vec![0u8; self.geometry.slot_size as usize];
        entry.encode(&self.layout, &mut buf)?;
        buf[cdb_at..cdb_at + request.cdb.len()].copy_from_slice(request.cdb.as_bytes());
        trace!("request entry at slot {index}:\n{}", hexdump(&buf));

        let published = self
            .region
            .write_at(slot, &buf)
            .and_then(|()| state.cursor.advance_tail())
            .and_then(|tail| {
                self.region.store_u32(
                    CMD_TAIL,
                    self.geometry.ring_offset(tail.index),
                    Ordering::Release,
                )
            });
        if let Err(e) = published {
            state.poison(&e);
            return Err(e);
        }
        state.in_flight.insert(id);
        debug!(id, slot = index, opcode = request.cdb.opcode(), "submitted");
        Ok(id)
    }

    /// Returns the responses the kernel has written since the last poll.
    ///
    /// The sequence is lazy: each item is decoded, and its slot released, only
    /// when the iterator reaches it. Entries left unread when the iterator is
    /// dropped are returned by the next poll. The driver stays locked while
    /// the iterator is alive.
    pub fn poll(&self) -> Result<Completions<'_, R>> {
        let mut state = self.state.lock();
        state.check_poisoned()?;
        match self.answered(&state) {
            Ok(remaining) => {
                if remaining > 0 {
                    trace!(remaining, "responses ready");
                }
                Ok(Completions {
                    driver: self,
                    state,
                    remaining,
                    failed: false,
                })
            }
            Err(e) => {
                state.poison(&e);
                Err(e)
            }
        }
    }

    /// Counts the slots from the local head that the kernel has answered.
    fn answered(&self, state: &DriverState) -> Result<u32> {
        let raw_head = self.region.load_u32(CMD_HEAD, Ordering::Acquire)?;
        let kernel_head = self.geometry.index_of(raw_head)?;
        let cursor = &state.cursor;
        let capacity = self.geometry.slot_count;

        let mut ready = ring::distance(cursor.head().index, kernel_head, capacity);
        // With every slot occupied, a kernel head on top of ours means either
        // nothing or everything was answered. The slot itself says which.
        if ready == 0 && cursor.is_full() {
            let header = self.slot_header(cursor.head().index)?;
            if header.kflags & KFLAG_RESPONSE != 0 {
                ready = capacity.get();
            }
        }
        if ready > cursor.occupied() {
            return Err(Error::corrupt(format!(
                "kernel head {raw_head} is past the driver's tail {}",
                self.geometry.ring_offset(cursor.tail().index)
            )));
        }
        Ok(ready)
    }

    fn slot_header(&self, index: u32) -> Result<EntryHeader> {
        let mut raw = [0u8; HEADER_SIZE];
        self.region.read_at(self.geometry.slot_offset(index), &mut raw)?;
        EntryHeader::decode(&raw)
    }

    /// Decodes the answered slot at the head and releases it.
    ///
    /// Every slot holds exactly one request and every request gets exactly one
    /// response, so a PAD, or a response for a command that isn't in flight,
    /// would leave some command unanswerable. Both are corruption.
    fn consume(&self, state: &mut DriverState) -> Result<ResponseEntry> {
        let index = state.cursor.head().index;
        let mut buf = vec![0u8; self.geometry.slot_size as usize];
        self.region.read_at(self.geometry.slot_offset(index), &mut buf)?;
        let header = EntryHeader::decode(&buf)?;
        if header.kflags & KFLAG_RESPONSE == 0 {
            return Err(Error::corrupt(format!(
                "slot {index} is behind the kernel head but was never answered"
            )));
        }

        match header.op {
            Opcode::Cmd => {}
            Opcode::Pad => {
                return Err(Error::corrupt(format!(
                    "slot {index} was padded instead of answered"
                )));
            }
            Opcode::Other(op) => {
                return Err(Error::corrupt(format!("slot {index} has unknown opcode {op}")));
            }
        }

        trace!("response entry at slot {index}:\n{}", hexdump(&buf));
        let response = ResponseEntry::decode(&buf, &self.layout)?;
        if !state.in_flight.remove(&response.cmd_id()) {
            return Err(Error::corrupt(format!(
                "slot {index} answers command {}, which isn't in flight",
                response.cmd_id()
            )));
        }
        state.cursor.advance_head();
        Ok(response)
    }
}

#[cfg(test)]
impl<R: SharedRegion> MailboxDriver<R> {
    pub(crate) fn set_next_id(&self, id: CommandId) {
        self.state.lock().next_id = id;
    }
}

/// Responses drained by one [`MailboxDriver::poll`].
///
/// Finite: it ends at the kernel head observed when the poll started, or
/// after the first error.
pub struct Completions<'a, R: SharedRegion> {
    driver: &'a MailboxDriver<R>,
    state: MutexGuard<'a, DriverState>,
    remaining: u32,
    failed: bool,
}

impl<R: SharedRegion> Iterator for Completions<'_, R> {
    type Item = Result<ResponseEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        self.remaining -= 1;
        let next = self.driver.consume(&mut self.state);
        if let Err(e) = &next {
            self.failed = true;
            self.state.poison(e);
        }
        Some(next)
    }
}
