//! Userspace side of the kernel's TCMU (`tcm-user`) command ring, as described in:
//! - `include/uapi/linux/target_core_user.h`, the layouts shared with the kernel
//! - <https://docs.kernel.org/target/tcmu-design.html>
//!
//! The kernel exposes each TCMU backstore as a UIO device whose memory map
//! starts with a mailbox followed by a circular command ring. This crate maps
//! that region, writes command entries into the ring, and matches the responses
//! the kernel writes back to whoever is waiting on them.
//!
//! A [`MailboxDriver`] owns the mapping and the ring cursors. A [`Dispatcher`]
//! sits on top of it and turns submits into awaitable [`PendingCommand`]s.
//! SCSI semantics stay out of it: CDBs are opaque bytes.

pub mod cdb;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod mailbox;
pub mod ring;

#[cfg(test)]
mod testing;

pub use cdb::CommandBlock;
pub use dispatch::{Dispatcher, Doorbell, NoopDoorbell, PendingCommand};
pub use error::{Error, Result};
pub use layout::{CommandId, IoVec, LayoutConfig, ResponseEntry};
pub use mailbox::region::{HeapRegion, SharedRegion};
pub use mailbox::uio::{TcmuDeviceInfo, UioDoorbell, UioMapping};
pub use mailbox::{CommandRequest, MailboxDriver, RingGeometry};
