//! Attaching to the kernel through a `tcm-user` UIO device.
//!
//! Each TCMU backstore shows up as `/dev/uioN`. Its sysfs name is
//! `tcm-user/<hba>/<volume>/<config>`, the first memory map of the device is
//! the mailbox and command ring, and the file descriptor itself doubles as the
//! interrupt line: reading 4 bytes waits for the kernel, writing 4 bytes kicks
//! it.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

use super::region::SharedRegion;
use crate::dispatch::Doorbell;
use crate::error::{Error, Result};

pub const SYSFS_UIO_ROOT: &str = "/sys/class/uio";

/// Every UIO device exposed by the TCMU kernel module has a name starting
/// with this.
const TCMU_UIO_PREFIX: &str = "tcm-user";

/// A `tcm-user` UIO device found in sysfs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcmuDeviceInfo {
    /// Device node name, such as `uio0`.
    pub uio: String,
    pub hba: String,
    pub volume: String,
    /// The `dev_config` string the backstore was created with.
    pub config: String,
}

impl TcmuDeviceInfo {
    pub fn dev_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.uio)
    }
}

/// Splits a sysfs UIO name into `(hba, volume, config)`.
///
/// The config is the remainder and may itself contain slashes.
pub fn parse_uio_name(name: &str) -> Option<(String, String, String)> {
    let mut parts = name.trim_end().splitn(4, '/');
    if parts.next()? != TCMU_UIO_PREFIX {
        return None;
    }
    let hba = parts.next()?.to_owned();
    let volume = parts.next()?.to_owned();
    let config = parts.next()?.to_owned();
    Some((hba, volume, config))
}

/// Returns every `tcm-user` device currently registered with the UIO
/// subsystem.
pub fn enumerate_tcmu_devices() -> Result<Vec<TcmuDeviceInfo>> {
    enumerate_in(Path::new(SYSFS_UIO_ROOT))
}

pub(crate) fn enumerate_in(root: &Path) -> Result<Vec<TcmuDeviceInfo>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let uio = entry.file_name().to_string_lossy().into_owned();
        if !uio.starts_with("uio") {
            continue;
        }
        let name = match fs::read_to_string(entry.path().join("name")) {
            Ok(name) => name,
            Err(e) => {
                warn!("skipping {uio}: {e}");
                continue;
            }
        };
        match parse_uio_name(&name) {
            Some((hba, volume, config)) => devices.push(TcmuDeviceInfo {
                uio,
                hba,
                volume,
                config,
            }),
            None => debug!("{uio} is not a tcm-user device"),
        }
    }
    devices.sort_by(|a, b| a.uio.cmp(&b.uio));
    Ok(devices)
}

/// Size of the device's first memory map, as reported by sysfs.
pub(crate) fn map_size_in(root: &Path, uio: &str) -> Result<usize> {
    let raw = fs::read_to_string(root.join(uio).join("maps/map0/size"))?;
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| Error::Io(io::Error::new(ErrorKind::InvalidData, e)))
}

/// Opens a `tcm-user` device, maps its ring and wraps its interrupt line.
///
/// Must be called from within a tokio runtime.
#[tracing::instrument]
pub fn open(info: &TcmuDeviceInfo) -> Result<(UioMapping, UioDoorbell)> {
    let name = fs::read_to_string(Path::new(SYSFS_UIO_ROOT).join(&info.uio).join("name"))?;
    if parse_uio_name(&name).is_none() {
        return Err(Error::NotTcmuDevice(info.uio.clone()));
    }
    let len = map_size_in(Path::new(SYSFS_UIO_ROOT), &info.uio)?;
    debug!(len, "mapping device");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(info.dev_path())?;
    let mapping = UioMapping::map(&file, len)?;
    let doorbell = UioDoorbell::new(file.into())?;
    Ok((mapping, doorbell))
}

/// The device's ring, mapped shared and writable. Unmapped on drop.
#[derive(Debug)]
pub struct UioMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory; all access goes through the
// `SharedRegion` helpers.
unsafe impl Send for UioMapping {}
unsafe impl Sync for UioMapping {}

impl UioMapping {
    fn map(fd: &impl AsRawFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::corrupt("device reports an empty map"));
        }
        // SAFETY: mapping a fresh range chosen by the kernel; the result is
        // checked before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr.cast()).ok_or_else(|| Error::corrupt("mmap returned null"))?;
        Ok(Self { ptr, len })
    }
}

impl Drop for UioMapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a live mapping created in `map`.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

// SAFETY: page aligned, `len` bytes, valid until `munmap` in drop.
unsafe impl SharedRegion for UioMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// The UIO file descriptor, used as an interrupt line in both directions.
pub struct UioDoorbell {
    fd: AsyncFd<OwnedFd>,
}

impl UioDoorbell {
    /// Wraps a non-blocking UIO descriptor.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
        })
    }
}

impl Doorbell for UioDoorbell {
    fn ring(&self) -> io::Result<()> {
        let buf = 1u32.to_ne_bytes();
        // SAFETY: the fd is open and `buf` is valid for its length.
        let ret = unsafe {
            libc::write(
                self.fd.get_ref().as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    async fn wait(&self) -> io::Result<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut count = [0u8; 4];
            let res = guard.try_io(|fd| {
                // SAFETY: the fd is open and `count` is valid for its length.
                let ret = unsafe {
                    libc::read(
                        fd.get_ref().as_raw_fd(),
                        count.as_mut_ptr().cast(),
                        count.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
            match res {
                Ok(result) => {
                    result?;
                    tracing::trace!(interrupts = u32::from_ne_bytes(count), "doorbell");
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}
