//! Correlating kernel responses with the callers waiting for them.
//!
//! Every submitted command gets a pending entry keyed by its command id. A
//! pump drains the ring and hands each response to its entry; whatever has no
//! entry (its waiter timed out, cancelled or went away) is logged and dropped.
//! Once the mailbox turns out to be corrupt, every pending entry is failed and
//! the dispatcher refuses further work.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::{CommandId, ResponseEntry};
use crate::mailbox::region::SharedRegion;
use crate::mailbox::{CommandRequest, MailboxDriver};

/// How often [`NoopDoorbell`] lets the dispatcher look at the ring.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The interrupt line between the driver and the kernel.
pub trait Doorbell: Send + Sync {
    /// Tells the kernel new entries were published.
    fn ring(&self) -> io::Result<()>;

    /// Resolves once the kernel has signalled, possibly spuriously.
    fn wait(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// A doorbell nobody answers. Kicks are dropped and waiting just sleeps for
/// [`POLL_INTERVAL`], so the ring ends up being polled.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopDoorbell;

impl Doorbell for NoopDoorbell {
    fn ring(&self) -> io::Result<()> {
        Ok(())
    }

    async fn wait(&self) -> io::Result<()> {
        time::sleep(POLL_INTERVAL).await;
        Ok(())
    }
}

/// How a pending command left the dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Resolution {
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

struct Pending {
    tx: oneshot::Sender<Result<ResponseEntry>>,
    /// Tells apart two commands that used the same id at different times.
    ticket: u64,
}

type PendingMap = HashMap<CommandId, Pending>;

pub struct Dispatcher<R, D> {
    driver: MailboxDriver<R>,
    doorbell: D,
    /// Always locked before the driver.
    pending: Mutex<PendingMap>,
    next_ticket: AtomicU64,
}

impl<R: SharedRegion, D: Doorbell> Dispatcher<R, D> {
    pub fn new(driver: MailboxDriver<R>, doorbell: D) -> Self {
        Self {
            driver,
            doorbell,
            pending: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn driver(&self) -> &MailboxDriver<R> {
        &self.driver
    }

    pub fn doorbell(&self) -> &D {
        &self.doorbell
    }

    /// Number of commands someone is still waiting on.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Publishes `request` and kicks the kernel.
    ///
    /// A full ring is reported as [`Error::RingFull`], which is worth retrying
    /// once a pump has freed a slot.
    pub fn submit(&self, request: &CommandRequest) -> Result<PendingCommand<'_, R, D>> {
        let mut pending = self.pending.lock();
        let id = match self.driver.submit(request) {
            Ok(id) => id,
            Err(e) => {
                if e.is_fatal() {
                    fail_all(&mut pending, &e);
                }
                return Err(e);
            }
        };
        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        pending.insert(id, Pending { tx, ticket });
        drop(pending);

        if let Err(e) = self.doorbell.ring() {
            // the kernel still finds the entry the next time it looks
            warn!(id, "couldn't kick the kernel: {e}");
        }
        Ok(PendingCommand {
            dispatcher: self,
            id,
            ticket,
            rx: Some(rx),
            settled: false,
        })
    }

    /// Submits `request` and waits up to `timeout` for its response.
    ///
    /// Something else has to keep pumping the ring meanwhile, usually
    /// [`Dispatcher::run`].
    pub async fn submit_and_wait(
        &self,
        request: &CommandRequest,
        timeout: Duration,
    ) -> Result<ResponseEntry> {
        self.submit(request)?.wait(timeout).await
    }

    /// Stops waiting for command `id`. Its waiter sees [`Error::Cancelled`].
    ///
    /// The entry stays on the ring; when its response turns up it is dropped.
    /// Returns whether anything was waiting on `id`.
    pub fn cancel(&self, id: CommandId) -> bool {
        let Some(op) = self.pending.lock().remove(&id) else {
            return false;
        };
        let _ = op.tx.send(Err(Error::Cancelled(id)));
        debug!(id, resolution = ?Resolution::Cancelled, "command settled");
        true
    }

    /// Drains the responses the kernel has written so far and wakes their
    /// waiters. Returns how many waiters were resolved.
    pub fn pump(&self) -> Result<usize> {
        let mut pending = self.pending.lock();
        let completions = match self.driver.poll() {
            Ok(completions) => completions,
            Err(e) => {
                fail_all(&mut pending, &e);
                return Err(e);
            }
        };

        let mut resolved = 0;
        for completion in completions {
            let response = match completion {
                Ok(response) => response,
                Err(e) => {
                    fail_all(&mut pending, &e);
                    return Err(e);
                }
            };
            let id = response.cmd_id();
            let Some(op) = pending.remove(&id) else {
                warn!(id, status = response.status(), "dropping response nobody is waiting for");
                continue;
            };
            if op.tx.send(Ok(response)).is_err() {
                debug!(id, "waiter went away before its response");
            }
            debug!(id, resolution = ?Resolution::Completed, "command settled");
            resolved += 1;
        }
        Ok(resolved)
    }

    /// Pumps the ring every time the doorbell goes off. Only returns on
    /// error, after every pending command has been failed.
    pub async fn run(&self) -> Result<()> {
        loop {
            self.pump()?;
            self.doorbell.wait().await?;
        }
    }

    /// Removes the entry for `id` if it still belongs to `ticket`.
    fn forget(&self, id: CommandId, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&id) {
            Some(op) if op.ticket == ticket => {
                pending.remove(&id);
                true
            }
            _ => false,
        }
    }
}

/// Fails every pending command with the mailbox corruption that stopped the
/// ring. Non-fatal errors leave the waiters alone.
fn fail_all(pending: &mut PendingMap, e: &Error) {
    let Error::CorruptMailbox(reason) = e else {
        return;
    };
    for (id, op) in pending.drain() {
        let _ = op.tx.send(Err(Error::CorruptMailbox(reason.clone())));
        debug!(id, resolution = ?Resolution::Failed, "command settled");
    }
}

/// A submitted command that hasn't been waited on yet.
///
/// Dropping it without waiting cancels it.
pub struct PendingCommand<'a, R: SharedRegion, D: Doorbell> {
    dispatcher: &'a Dispatcher<R, D>,
    id: CommandId,
    ticket: u64,
    rx: Option<oneshot::Receiver<Result<ResponseEntry>>>,
    settled: bool,
}

impl<R: SharedRegion, D: Doorbell> PendingCommand<'_, R, D> {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Waits up to `timeout` for the response.
    ///
    /// On timeout the pending entry is removed, so a response arriving later
    /// is dropped by the pump.
    pub async fn wait(mut self, timeout: Duration) -> Result<ResponseEntry> {
        let id = self.id;
        let Some(mut rx) = self.rx.take() else {
            return Err(Error::Cancelled(id));
        };
        let outcome = time::timeout(timeout, &mut rx).await;
        self.settled = true;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled(id)),
            Err(_) => {
                if self.dispatcher.forget(id, self.ticket) {
                    debug!(id, resolution = ?Resolution::TimedOut, "command settled");
                    return Err(Error::Timeout(id));
                }
                // Settled by someone else right as the deadline passed.
                rx.try_recv().unwrap_or(Err(Error::Timeout(id)))
            }
        }
    }

    /// Stops waiting. Returns whether the command was still pending.
    pub fn cancel(mut self) -> bool {
        self.settled = true;
        let cancelled = self.dispatcher.forget(self.id, self.ticket);
        if cancelled {
            debug!(id = self.id, resolution = ?Resolution::Cancelled, "command settled");
        }
        cancelled
    }
}

impl<R: SharedRegion, D: Doorbell> Drop for PendingCommand<'_, R, D> {
    fn drop(&mut self) {
        if !self.settled && self.dispatcher.forget(self.id, self.ticket) {
            debug!(id = self.id, resolution = ?Resolution::Cancelled, "command dropped");
        }
    }
}
