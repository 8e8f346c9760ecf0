//! rpmsg Character Device Remote Channel
//!
//! Remote channel on an rpmsg endpoint exposed as a character device
//! (for example `/dev/rpmsg0`). Each `write` sends one message and each
//! `read` returns one message.
//!
//! The device is opened non-blocking and polled through the runtime's
//! reactor, so a pending read is an ordinary future: aborting the read task
//! cancels it and nothing is left behind on the blocking pool.
//!
//! The device does not report its MTU, so it is configured (see
//! [`DEFAULT_RPMSG_MTU`](super::DEFAULT_RPMSG_MTU)).
//!
//! When the device reports end of file or a read error, the remote side is
//! gone and the owning pairing is torn down.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RemoteChannel;
use crate::error::ChannelError;
use crate::relay::RelayHandle;

/// Remote channel over an rpmsg character device
pub struct RpmsgCharChannel {
    device: PathBuf,
    mtu: usize,
    fd: Arc<AsyncFd<File>>,
    attached: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl RpmsgCharChannel {
    /// Open `device` for reading and writing
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Unavailable` if the device cannot be opened or
    /// cannot be polled (regular files, for instance).
    pub fn open(device: impl Into<PathBuf>, mtu: usize) -> Result<Self, ChannelError> {
        let device = device.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&device)
            .map_err(|e| ChannelError::Unavailable(format!("{}: {e}", device.display())))?;

        Self::from_file(file, device, mtu)
    }

    /// Wrap an already open device
    ///
    /// `file` is switched to non-blocking mode. `device` is only used for
    /// logging.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Unavailable` if the descriptor cannot be
    /// registered with the reactor.
    pub fn from_file(
        file: File,
        device: impl Into<PathBuf>,
        mtu: usize,
    ) -> Result<Self, ChannelError> {
        let device = device.into();
        let unavailable =
            |e: io::Error| ChannelError::Unavailable(format!("{}: {e}", device.display()));

        set_nonblocking(&file).map_err(unavailable)?;
        let fd = AsyncFd::new(file).map_err(unavailable)?;

        info!(device = ?device, mtu = mtu, "Remote channel opened");

        Ok(Self {
            device,
            mtu,
            fd: Arc::new(fd),
            attached: AtomicBool::new(false),
            read_task: Mutex::new(None),
            released: AtomicBool::new(false),
        })
    }

    /// Device path
    #[must_use]
    pub fn device(&self) -> &Path {
        &self.device
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` belongs to `file`, which outlives both calls
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl RemoteChannel for RpmsgCharChannel {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if payload.len() > self.mtu {
            return Err(ChannelError::PayloadTooLarge {
                len: payload.len(),
                mtu: self.mtu,
            });
        }

        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(payload)
            }) {
                Ok(Ok(n)) if n == payload.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(ChannelError::SendFailed(format!(
                        "short write: {n} of {} bytes",
                        payload.len()
                    )))
                }
                Ok(Err(e)) => return Err(ChannelError::SendFailed(e.to_string())),
                Err(_would_block) => continue,
            }
        }
    }

    fn attach(&self, handle: RelayHandle) -> Result<(), ChannelError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Unavailable(
                "remote channel already attached".into(),
            ));
        }

        let task = tokio::spawn(read_loop(
            Arc::clone(&self.fd),
            self.mtu,
            self.device.clone(),
            handle,
        ));
        *self.read_task.lock() = Some(task);
        Ok(())
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        info!(device = ?self.device, "Remote channel released");
    }
}

/// Read one message, waiting for the device to become readable
async fn read_message(fd: &AsyncFd<File>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.read(buf)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Post each message read from the device; tear down when the device goes away
async fn read_loop(fd: Arc<AsyncFd<File>>, mtu: usize, device: PathBuf, handle: RelayHandle) {
    let mut buf = vec![0u8; mtu.max(1)];

    loop {
        match read_message(&fd, &mut buf).await {
            Ok(0) => {
                info!(device = ?device, "Remote channel closed by peer");
                break;
            }
            Ok(n) => {
                debug!(len = n, "Received from remote");
                if handle.notify_remote(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(device = ?device, error = %e, "Remote channel read error");
                break;
            }
        }
    }

    handle.teardown().await;
}
