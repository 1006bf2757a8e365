use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{bail, eyre};
use tcmu_ring::cdb::test_unit_ready;
use tcmu_ring::layout::entry::RequestEntry;
use tcmu_ring::layout::{
    EntryHeader, KFLAG_RESPONSE, MAILBOX_FLAG_CAP_OOOC, MAILBOX_SIZE, MAILBOX_VERSION, Mailbox,
    Opcode, hexdump,
};
use tcmu_ring::mailbox::{read_mailbox, uio};
use tcmu_ring::{
    CommandRequest, Dispatcher, IoVec, LayoutConfig, MailboxDriver, ResponseEntry, RingGeometry,
    SharedRegion, TcmuDeviceInfo,
};
use tracing::info;

/// How long `tur` waits for the kernel before giving up.
const TUR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tcmu-ring")]
#[command(version)]
#[command(about = "Inspect and exercise TCMU command rings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Hexdump the shared structures as this build lays them out
    Layout,

    /// List tcm-user UIO devices
    List,

    /// Print a device's mailbox and ring geometry without touching the ring
    Inspect {
        /// UIO device name, e.g. uio0
        uio: String,
    },

    /// Send one TEST UNIT READY through the ring
    Tur {
        /// UIO device name, e.g. uio0
        uio: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Layout => dump_layouts(&LayoutConfig::default()),
        Command::List => {
            for device in uio::enumerate_tcmu_devices()? {
                println!(
                    "{}\thba {}\tvolume {}\tconfig {}",
                    device.uio, device.hba, device.volume, device.config
                );
            }
            Ok(())
        }
        Command::Inspect { uio } => inspect(&find_device(&uio)?),
        Command::Tur { uio } => test_unit_ready_on(&find_device(&uio)?).await,
    }
}

fn find_device(name: &str) -> Result<TcmuDeviceInfo> {
    uio::enumerate_tcmu_devices()?
        .into_iter()
        .find(|device| device.uio == name)
        .ok_or_else(|| eyre!("{name} is not a tcm-user device"))
}

/// Prints the bytes of each kernel-shared structure filled with recognisable
/// values, so the offsets can be checked against `target_core_user.h`.
fn dump_layouts(layout: &LayoutConfig) -> Result<()> {
    let slot_size = layout.slot_size();
    println!(
        "slot size {slot_size}, inline CDB at {}, {}-bit iovecs",
        layout.cdb_offset(),
        layout.iovec_size() * 4
    );

    let mailbox = Mailbox {
        version: MAILBOX_VERSION,
        flags: MAILBOX_FLAG_CAP_OOOC,
        cmdr_off: 0x80,
        cmdr_size: 0x10 * slot_size as u32,
        cmd_head: 0x07,
        cmd_tail: 0x08,
    };
    let mut buf = [0u8; MAILBOX_SIZE];
    mailbox.encode(&mut buf)?;
    println!("mailbox ({MAILBOX_SIZE} bytes):\n{}", hexdump(&buf));

    let request = RequestEntry {
        header: EntryHeader {
            len: slot_size as u32,
            op: Opcode::Cmd,
            cmd_id: 0x0102,
            kflags: 0,
            uflags: 0,
        },
        cdb_off: 0x80 + layout.cdb_offset() as u64,
        iovecs: vec![IoVec {
            base: 0x1000,
            len: 0x200,
        }],
        bidi_iovecs: Vec::new(),
        dif_iovecs: Vec::new(),
    };
    let mut slot = vec![0u8; slot_size];
    request.encode(layout, &mut slot)?;
    let cdb = test_unit_ready();
    slot[layout.cdb_offset()..][..cdb.len()].copy_from_slice(cdb.as_bytes());
    println!("request entry ({slot_size} bytes):\n{}", hexdump(&slot));

    let response = ResponseEntry::new(0x0102, 0x02, &[0x70, 0x00, 0x05], layout);
    let mut slot = vec![0u8; slot_size];
    response.encode(layout, &mut slot)?;
    println!(
        "response entry ({slot_size} bytes, kflags 0x{KFLAG_RESPONSE:02x}):\n{}",
        hexdump(&slot)
    );
    Ok(())
}

/// Reports what the device's mailbox says. Only reads the mapping, so it is
/// safe to run against a device another process is driving.
fn inspect(device: &TcmuDeviceInfo) -> Result<()> {
    let (mapping, _doorbell) = uio::open(device)?;
    let mailbox = read_mailbox(&mapping)?;
    let geometry = RingGeometry::from_mailbox(&mailbox, &LayoutConfig::default(), mapping.len())?;
    info!(
        version = mailbox.version,
        out_of_order = mailbox.supports_out_of_order(),
        cmdr_off = geometry.cmdr_off,
        cmdr_size = geometry.cmdr_size,
        slot_size = geometry.slot_size,
        slots = geometry.slot_count.get(),
        cmd_head = mailbox.cmd_head,
        cmd_tail = mailbox.cmd_tail,
        "{}",
        device.uio
    );
    Ok(())
}

/// Sends one TEST UNIT READY and prints the status the kernel answers with.
async fn test_unit_ready_on(device: &TcmuDeviceInfo) -> Result<()> {
    let (mapping, doorbell) = uio::open(device)?;
    let driver = MailboxDriver::attach(mapping, LayoutConfig::default())?;
    let dispatcher = Dispatcher::new(driver, doorbell);
    let request = CommandRequest::new(test_unit_ready());

    let response = tokio::select! {
        res = dispatcher.run() => {
            res?;
            bail!("dispatcher stopped before the command completed");
        }
        res = dispatcher.submit_and_wait(&request, TUR_TIMEOUT) => res?,
    };
    println!(
        "status 0x{:02x}{}",
        response.status(),
        if response.unknown_op() { " (unknown op)" } else { "" }
    );
    if !response.is_good() {
        println!("sense:\n{}", hexdump(response.sense()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn device_subcommands_take_a_uio_name() {
        let cli = Cli::try_parse_from(["tcmu-ring", "inspect", "uio3"]).unwrap();
        assert!(matches!(cli.command, Command::Inspect { uio } if uio == "uio3"));

        let cli = Cli::try_parse_from(["tcmu-ring", "tur", "uio0"]).unwrap();
        assert!(matches!(cli.command, Command::Tur { uio } if uio == "uio0"));

        assert!(Cli::try_parse_from(["tcmu-ring", "tur"]).is_err());
        assert!(Cli::try_parse_from(["tcmu-ring", "layout", "extra"]).is_err());
        assert!(Cli::try_parse_from(["tcmu-ring"]).is_err());
    }
}
