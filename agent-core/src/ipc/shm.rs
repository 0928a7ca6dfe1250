//! Worker link over named FIFOs and memory-mapped bulk regions.
//!
//! Matches the layout a separate worker process maps: each bulk region is a
//! file holding a little-endian `u64` pair count followed by `capacity`
//! keys (`u64`) and `capacity` values (`f32` bit patterns). Signals travel
//! one byte at a time through two FIFOs, worker-to-agent and back.
//!
//! Access to a region is serialized by the signal protocol itself: the
//! worker never touches the request region between raising a signal and
//! (for pulls) receiving the ready byte, and the agent only writes the
//! reply region inside that window.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use memmap2::MmapMut;
use tokio::task;
use tracing::info;

use super::{WorkerLink, WorkerSignal, READY_SIGNAL};
use crate::batch::KeyValueBatch;
use crate::config::IpcConfig;
use crate::error::{AgentError, Result};

const HEADER_LEN: usize = 8;

/// One memory-mapped `(size, keys[], values[])` record.
pub(crate) struct SharedRegion {
    mmap: MmapMut,
    capacity: usize,
}

impl SharedRegion {
    /// Map the region file at `path`, creating and sizing it if needed.
    pub(crate) fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ipc_with_source("cannot create IPC directory", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                AgentError::ipc_with_source(format!("cannot open region {}", path.display()), e)
            })?;
        let len = (HEADER_LEN + capacity * (8 + 4)) as u64;
        file.set_len(len)
            .map_err(|e| AgentError::ipc_with_source("cannot size region file", e))?;

        // SAFETY: the mapping stays valid for the life of `file`, which we
        // keep open through the Mmap; concurrent worker access is excluded
        // by the signal protocol described in the module docs.
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| AgentError::ipc_with_source("cannot map region file", e))?;

        Ok(Self { mmap, capacity })
    }

    pub(crate) fn read(&self) -> KeyValueBatch {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.mmap[..HEADER_LEN]);
        let size = (u64::from_le_bytes(header) as usize).min(self.capacity);

        let mut batch = KeyValueBatch::with_capacity(size);
        let keys_base = HEADER_LEN;
        let values_base = HEADER_LEN + self.capacity * 8;
        for i in 0..size {
            let mut k = [0u8; 8];
            k.copy_from_slice(&self.mmap[keys_base + i * 8..keys_base + (i + 1) * 8]);
            let mut v = [0u8; 4];
            v.copy_from_slice(&self.mmap[values_base + i * 4..values_base + (i + 1) * 4]);
            batch.push(u64::from_le_bytes(k), f32::from_le_bytes(v));
        }
        batch
    }

    pub(crate) fn write(&mut self, batch: &KeyValueBatch) -> Result<()> {
        if batch.len() > self.capacity {
            return Err(AgentError::ipc(format!(
                "batch of {} pairs exceeds region capacity {}",
                batch.len(),
                self.capacity
            )));
        }
        let keys_base = HEADER_LEN;
        let values_base = HEADER_LEN + self.capacity * 8;
        for (i, (&k, &v)) in batch.keys.iter().zip(batch.values.iter()).enumerate() {
            self.mmap[keys_base + i * 8..keys_base + (i + 1) * 8]
                .copy_from_slice(&k.to_le_bytes());
            self.mmap[values_base + i * 4..values_base + (i + 1) * 4]
                .copy_from_slice(&v.to_le_bytes());
        }
        self.mmap[..HEADER_LEN].copy_from_slice(&(batch.len() as u64).to_le_bytes());
        self.mmap
            .flush()
            .map_err(|e| AgentError::ipc_with_source("cannot flush region", e))
    }
}

/// Production worker link backed by FIFOs and shared regions.
pub struct ShmWorkerLink {
    signal_rx: Mutex<File>,
    ready_tx: Mutex<File>,
    request_region: Mutex<SharedRegion>,
    reply_region: Mutex<SharedRegion>,
}

impl ShmWorkerLink {
    /// Create the FIFOs and regions named in `config` and open all four
    /// endpoints. Opening blocks until the worker process attaches to the
    /// opposite FIFO ends, so this runs on the blocking pool.
    pub async fn open(config: &IpcConfig, capacity: usize) -> Result<Self> {
        let config = config.clone();
        task::spawn_blocking(move || Self::open_blocking(&config, capacity))
            .await
            .map_err(|e| AgentError::ipc(format!("IPC setup task failed: {e}")))?
    }

    fn open_blocking(config: &IpcConfig, capacity: usize) -> Result<Self> {
        let request_region = SharedRegion::open(&config.request_region, capacity)?;
        let reply_region = SharedRegion::open(&config.reply_region, capacity)?;

        make_fifo(&config.signal_fifo)?;
        make_fifo(&config.ready_fifo)?;

        info!(
            signal = %config.signal_fifo.display(),
            ready = %config.ready_fifo.display(),
            "waiting for worker to attach"
        );
        // Read end first: the worker opens its write end first, mirrored.
        let signal_rx = OpenOptions::new()
            .read(true)
            .open(&config.signal_fifo)
            .map_err(|e| AgentError::ipc_with_source("cannot open signal FIFO", e))?;
        let ready_tx = OpenOptions::new()
            .write(true)
            .open(&config.ready_fifo)
            .map_err(|e| AgentError::ipc_with_source("cannot open ready FIFO", e))?;

        Ok(Self {
            signal_rx: Mutex::new(signal_rx),
            ready_tx: Mutex::new(ready_tx),
            request_region: Mutex::new(request_region),
            reply_region: Mutex::new(reply_region),
        })
    }

    fn clone_signal_rx(&self) -> Result<File> {
        self.signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_clone()
            .map_err(|e| AgentError::ipc_with_source("cannot clone signal FIFO handle", e))
    }
}

#[async_trait]
impl WorkerLink for ShmWorkerLink {
    async fn wait_signal(&self) -> Result<WorkerSignal> {
        let mut file = self.clone_signal_rx()?;
        let byte = task::spawn_blocking(move || -> Result<u8> {
            let mut buf = [0u8; 1];
            let n = file
                .read(&mut buf)
                .map_err(|e| AgentError::ipc_with_source("signal FIFO read failed", e))?;
            if n == 0 {
                return Err(AgentError::ipc("signal FIFO closed by worker"));
            }
            Ok(buf[0])
        })
        .await
        .map_err(|e| AgentError::ipc(format!("signal wait task failed: {e}")))??;

        WorkerSignal::from_byte(byte)
    }

    async fn signal_ready(&self) -> Result<()> {
        let mut file = self
            .ready_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_clone()
            .map_err(|e| AgentError::ipc_with_source("cannot clone ready FIFO handle", e))?;
        task::spawn_blocking(move || {
            file.write_all(&[READY_SIGNAL])
                .and_then(|_| file.flush())
                .map_err(|e| AgentError::ipc_with_source("ready FIFO write failed", e))
        })
        .await
        .map_err(|e| AgentError::ipc(format!("ready signal task failed: {e}")))?
    }

    async fn read_batch(&self) -> Result<KeyValueBatch> {
        let region = self
            .request_region
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(region.read())
    }

    async fn write_batch(&self, batch: &KeyValueBatch) -> Result<()> {
        let mut region = self.reply_region.lock().unwrap_or_else(|e| e.into_inner());
        region.write(batch)
    }
}

fn make_fifo(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AgentError::ipc_with_source("cannot create IPC directory", e))?;
    }
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| AgentError::ipc("FIFO path contains a NUL byte"))?;
    // SAFETY: c_path is a valid NUL-terminated path for the duration of
    // the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(AgentError::ipc_with_source(
                format!("mkfifo {} failed", path.display()),
                err,
            ));
        }
    }
    Ok(())
}
