//! Fixed-capacity shared storage slot with cross-process mediation (spec §4.2).

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_memory::{Shmem, ShmemConf};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NamedResources;
use crate::error::BusError;
use crate::lock::NamedLock;

/// A transform applied to the current payload under the write lock,
/// producing the new payload to commit (spec §4.2 `read_modify_write`).
pub type Transform = Box<dyn FnOnce(Vec<u8>) -> Result<Vec<u8>, BusError> + Send>;

/// Byte-addressable, fixed-capacity shared storage mediated by a
/// [`NamedLock`], with a local `FileUpdated` change event.
///
/// Modeled as a trait (spec §9 "Polymorphism over capabilities") so tests
/// can supply a pure in-memory variant instead of a named OS region.
#[async_trait]
pub trait SharedRegion: Send + Sync {
    fn max_file_size(&self) -> u32;

    async fn size(&self) -> Result<u32, BusError>;

    async fn read(&self) -> Result<Vec<u8>, BusError>;

    async fn write(&self, payload: Vec<u8>) -> Result<(), BusError>;

    async fn read_modify_write(&self, transform: Transform) -> Result<(), BusError>;

    /// A receiver for the local `FileUpdated` change event; every writer's
    /// committed change wakes every subscribed receiver.
    fn watch_file_updated(&self) -> broadcast::Receiver<()>;

    async fn dispose(&self) -> Result<(), BusError>;
}

const GENERATION_BYTES: usize = 8;
const LEN_PREFIX_BYTES: usize = 4;
/// How often the background watcher polls the generation counter (spec §9
/// Open Questions: generation-counter fallback for the Set/Reset pulse).
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(4);

/// The real, cross-process [`SharedRegion`]: a named `shared_memory`
/// mapping plus a [`NamedLock`], laid out exactly as spec §6 describes
/// (`<u32 LE length><payload><padding>`), with an extra trailing 8-byte
/// generation counter used only for local change notification.
pub struct NamedSharedRegion {
    max_file_size: u32,
    lock: NamedLock,
    // Keeping the mapping alive for the region's lifetime, mirroring the
    // teacher's `Bus { shmem: Option<Shmem>, journal: *mut Journal }` shape.
    _shmem: Shmem,
    ptr: *mut u8,
    change_tx: broadcast::Sender<()>,
    watcher_cancel: CancellationToken,
    watcher_handle: AsyncMutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

unsafe impl Send for NamedSharedRegion {}
unsafe impl Sync for NamedSharedRegion {}

impl NamedSharedRegion {
    pub fn new(
        name: &str,
        max_file_size: u32,
        max_reader_count: u32,
        wait_timeout: Duration,
    ) -> Result<Arc<Self>, BusError> {
        if max_file_size < 1 {
            return Err(BusError::InvalidCapacity);
        }
        let names = NamedResources::derive(name);
        let lock = NamedLock::new(
            &names.mutex_name,
            &names.semaphore_name,
            max_reader_count,
            wait_timeout,
        )?;

        let total_size = max_file_size as usize + LEN_PREFIX_BYTES + GENERATION_BYTES;
        let (shmem, created) = match ShmemConf::new()
            .size(total_size)
            .os_id(&names.region_name)
            .create()
        {
            Ok(s) => (s, true),
            Err(_) => {
                let s = ShmemConf::new()
                    .size(total_size)
                    .os_id(&names.region_name)
                    .open()
                    .map_err(|e| BusError::SystemPrimitiveUnavailable {
                        name: names.region_name.clone(),
                        reason: e.to_string(),
                    })?;
                (s, false)
            }
        };

        let ptr = shmem.as_ptr();
        if created {
            unsafe { ptr::write_bytes(ptr, 0, total_size) };
        }

        let (change_tx, _) = broadcast::channel(64);
        let region = Arc::new(Self {
            max_file_size,
            lock,
            _shmem: shmem,
            ptr,
            change_tx,
            watcher_cancel: CancellationToken::new(),
            watcher_handle: AsyncMutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let handle = Self::spawn_watcher(Arc::clone(&region));
        // `try_lock` never contends here: nothing else can see `region` yet.
        *region
            .watcher_handle
            .try_lock()
            .expect("watcher_handle uncontended at construction") = Some(handle);

        Ok(region)
    }

    fn generation_ptr(&self) -> *const AtomicU64 {
        unsafe { self.ptr.add(LEN_PREFIX_BYTES + self.max_file_size as usize) as *const AtomicU64 }
    }

    fn spawn_watcher(region: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let gen_ptr = region.generation_ptr();
            let mut last = unsafe { (*gen_ptr).load(Ordering::Acquire) };
            loop {
                tokio::select! {
                    _ = region.watcher_cancel.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
                }
                let current = unsafe { (*gen_ptr).load(Ordering::Acquire) };
                if current != last {
                    last = current;
                    // No receivers is not an error: nobody is listening yet.
                    let _ = region.change_tx.send(());
                }
            }
        })
    }

    fn bump_generation(&self) {
        unsafe { (*self.generation_ptr()).fetch_add(1, Ordering::AcqRel) };
    }

    /// # Safety
    /// Caller must hold at least a read lock.
    unsafe fn read_len_locked(&self) -> u32 {
        let mut buf = [0u8; LEN_PREFIX_BYTES];
        ptr::copy_nonoverlapping(self.ptr, buf.as_mut_ptr(), LEN_PREFIX_BYTES);
        u32::from_le_bytes(buf)
    }

    /// # Safety
    /// Caller must hold at least a read lock.
    unsafe fn read_payload_locked(&self) -> Vec<u8> {
        let len = self.read_len_locked() as usize;
        let mut buf = vec![0u8; len];
        ptr::copy_nonoverlapping(self.ptr.add(LEN_PREFIX_BYTES), buf.as_mut_ptr(), len);
        buf
    }

    /// # Safety
    /// Caller must hold the write lock; `payload.len() <= max_file_size`.
    unsafe fn write_payload_locked(&self, payload: &[u8]) {
        let len = (payload.len() as u32).to_le_bytes();
        ptr::copy_nonoverlapping(len.as_ptr(), self.ptr, LEN_PREFIX_BYTES);
        ptr::copy_nonoverlapping(
            payload.as_ptr(),
            self.ptr.add(LEN_PREFIX_BYTES),
            payload.len(),
        );
    }

    fn check_capacity(&self, len: usize) -> Result<(), BusError> {
        if len > self.max_file_size as usize {
            Err(BusError::PayloadTooLarge {
                len,
                max: self.max_file_size,
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedRegion for NamedSharedRegion {
    fn max_file_size(&self) -> u32 {
        self.max_file_size
    }

    async fn size(&self) -> Result<u32, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let guard = self.lock.acquire_read().await?;
        let len = unsafe { self.read_len_locked() };
        drop(guard);
        Ok(len)
    }

    async fn read(&self) -> Result<Vec<u8>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let guard = self.lock.acquire_read().await?;
        let payload = unsafe { self.read_payload_locked() };
        drop(guard);
        Ok(payload)
    }

    async fn write(&self, payload: Vec<u8>) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        self.check_capacity(payload.len())?;
        let guard = self.lock.acquire_write().await?;
        unsafe { self.write_payload_locked(&payload) };
        drop(guard);
        self.bump_generation();
        Ok(())
    }

    async fn read_modify_write(&self, transform: Transform) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let guard = self.lock.acquire_write().await?;
        let current = unsafe { self.read_payload_locked() };
        let output = transform(current)?;
        self.check_capacity(output.len())?;
        unsafe { self.write_payload_locked(&output) };
        drop(guard);
        self.bump_generation();
        Ok(())
    }

    fn watch_file_updated(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    async fn dispose(&self) -> Result<(), BusError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.watcher_cancel.cancel();
        if let Some(handle) = self.watcher_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.lock.dispose().await
    }
}

/// A pure in-memory [`SharedRegion`] for tests (spec §9 "Polymorphism over
/// capabilities"): no named OS primitives, immediate (non-polled) change
/// notification, reader/writer exclusion via `tokio::sync::RwLock`.
pub struct InMemorySharedRegion {
    max_file_size: u32,
    payload: tokio::sync::RwLock<Vec<u8>>,
    change_tx: broadcast::Sender<()>,
    disposed: AtomicBool,
}

impl InMemorySharedRegion {
    pub fn new(max_file_size: u32) -> Arc<Self> {
        let (change_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            max_file_size,
            payload: tokio::sync::RwLock::new(Vec::new()),
            change_tx,
            disposed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SharedRegion for InMemorySharedRegion {
    fn max_file_size(&self) -> u32 {
        self.max_file_size
    }

    async fn size(&self) -> Result<u32, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        Ok(self.payload.read().await.len() as u32)
    }

    async fn read(&self) -> Result<Vec<u8>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        Ok(self.payload.read().await.clone())
    }

    async fn write(&self, payload: Vec<u8>) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        if payload.len() > self.max_file_size as usize {
            return Err(BusError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_file_size,
            });
        }
        *self.payload.write().await = payload;
        let _ = self.change_tx.send(());
        Ok(())
    }

    async fn read_modify_write(&self, transform: Transform) -> Result<(), BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let mut guard = self.payload.write().await;
        let current = guard.clone();
        let output = transform(current)?;
        if output.len() > self.max_file_size as usize {
            return Err(BusError::PayloadTooLarge {
                len: output.len(),
                max: self.max_file_size,
            });
        }
        *guard = output;
        drop(guard);
        let _ = self.change_tx.send(());
        Ok(())
    }

    fn watch_file_updated(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    async fn dispose(&self) -> Result<(), BusError> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_region_round_trips() {
        let region = InMemorySharedRegion::new(1024);
        region.write(b"hello".to_vec()).await.unwrap();
        assert_eq!(region.read().await.unwrap(), b"hello");
        assert_eq!(region.size().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn in_memory_region_rejects_oversized_payload() {
        let region = InMemorySharedRegion::new(4);
        let err = region.write(vec![0u8; 5]).await.unwrap_err();
        assert_eq!(
            err,
            BusError::PayloadTooLarge { len: 5, max: 4 }
        );
    }

    #[tokio::test]
    async fn in_memory_region_signals_file_updated() {
        let region = InMemorySharedRegion::new(1024);
        let mut rx = region.watch_file_updated();
        region.write(b"x".to_vec()).await.unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn named_region_round_trips_across_two_handles() {
        let name = format!("namedregiontest_{}", uuid::Uuid::new_v4().simple());
        let a = NamedSharedRegion::new(&name, 256, 4, Duration::from_millis(200)).unwrap();
        a.write(b"from-a".to_vec()).await.unwrap();

        let b = NamedSharedRegion::new(&name, 256, 4, Duration::from_millis(200)).unwrap();
        assert_eq!(b.read().await.unwrap(), b"from-a");

        a.dispose().await.unwrap();
        b.dispose().await.unwrap();
    }
}
