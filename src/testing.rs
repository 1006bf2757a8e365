//! A simulated kernel side for driving the ring in tests.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::cdb;
use crate::dispatch::Doorbell;
use crate::layout::entry::HEADER_SIZE;
use crate::layout::mailbox::{CMD_HEAD, CMD_TAIL};
use crate::layout::{
    CommandId, EntryHeader, KFLAG_RESPONSE, LayoutConfig, MAILBOX_FLAG_CAP_OOOC, MAILBOX_SIZE,
    MAILBOX_VERSION, Mailbox, Opcode, RequestEntry, ResponseEntry,
};
use crate::mailbox::region::{HeapRegion, SharedRegion};

/// Plays the kernel's part: answers slots in place at its own head and
/// publishes `cmd_head`.
pub struct FakeKernel {
    region: Arc<HeapRegion>,
    layout: LayoutConfig,
    slots: u32,
    head: u32,
}

impl FakeKernel {
    pub const CMDR_OFF: u32 = 128;

    pub fn new(slots: u32) -> Self {
        let layout = LayoutConfig::default();
        let slot_size = layout.slot_size() as u32;
        let mailbox = Mailbox {
            version: MAILBOX_VERSION,
            flags: MAILBOX_FLAG_CAP_OOOC,
            cmdr_off: Self::CMDR_OFF,
            cmdr_size: slots * slot_size,
            cmd_head: 0,
            cmd_tail: 0,
        };
        let region = HeapRegion::new((Self::CMDR_OFF + slots * slot_size) as usize);
        let mut raw = [0u8; MAILBOX_SIZE];
        mailbox.encode(&mut raw).unwrap();
        region.write_at(0, &raw).unwrap();
        Self {
            region: Arc::new(region),
            layout,
            slots,
            head: 0,
        }
    }

    pub fn region(&self) -> Arc<HeapRegion> {
        Arc::clone(&self.region)
    }

    pub fn layout(&self) -> LayoutConfig {
        self.layout
    }

    fn slot_size(&self) -> usize {
        self.layout.slot_size()
    }

    fn slot_offset(&self, index: u32) -> usize {
        Self::CMDR_OFF as usize + index as usize * self.slot_size()
    }

    fn slot(&self, index: u32) -> Vec<u8> {
        let mut buf = vec![0u8; self.slot_size()];
        self.region.read_at(self.slot_offset(index), &mut buf).unwrap();
        buf
    }

    /// Decodes the request the driver left in slot `index`.
    pub fn request_at(&self, index: u32) -> RequestEntry {
        RequestEntry::decode(&self.slot(index), &self.layout).unwrap()
    }

    /// The inline CDB of slot `index`, cut to the length its opcode implies.
    pub fn cdb_at(&self, index: u32) -> Vec<u8> {
        let slot = self.slot(index);
        let cdb = &slot[self.layout.cdb_offset()..];
        let len = cdb::expected_len(cdb).unwrap();
        cdb[..len].to_vec()
    }

    /// Raw `cmd_tail`.
    pub fn tail(&self) -> u32 {
        self.region.load_u32(CMD_TAIL, Ordering::Acquire).unwrap()
    }

    /// Overwrites `cmd_head` without touching any slot.
    pub fn set_head_raw(&self, raw: u32) {
        self.region.store_u32(CMD_HEAD, raw, Ordering::Release).unwrap();
    }

    /// Writes a response for `id` over the oldest unanswered slot.
    pub fn complete(&mut self, id: CommandId, status: u8, sense: &[u8]) {
        let response = ResponseEntry::new(id, status, sense, &self.layout);
        let mut buf = vec![0u8; self.slot_size()];
        response.encode(&self.layout, &mut buf).unwrap();
        self.answer(&buf);
    }

    /// Answers the oldest unanswered slot with padding.
    pub fn pad(&mut self) {
        let header = EntryHeader {
            len: self.slot_size() as u32,
            op: Opcode::Pad,
            cmd_id: 0,
            kflags: KFLAG_RESPONSE,
            uflags: 0,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(&mut buf).unwrap();
        self.answer(&buf);
    }

    fn answer(&mut self, bytes: &[u8]) {
        self.region.write_at(self.slot_offset(self.head), bytes).unwrap();
        self.head = (self.head + 1) % self.slots;
        self.set_head_raw(self.head * self.slot_size() as u32);
    }
}

/// Counts kicks and lets tests signal completions.
#[derive(Default)]
pub struct TestDoorbell {
    pub kicks: AtomicUsize,
    pub completions: Notify,
}

impl TestDoorbell {
    pub fn kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }
}

impl Doorbell for TestDoorbell {
    fn ring(&self) -> io::Result<()> {
        self.kicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&self) -> io::Result<()> {
        self.completions.notified().await;
        Ok(())
    }
}
