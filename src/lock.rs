//! Multi-reader / single-writer lock over a system-wide name (spec §4.1).
//!
//! Built from two POSIX named semaphores the way the teacher crate opens
//! its single notification semaphore: `sem_open` with `O_CREAT`, closed
//! (never unlinked) on drop so a crashed or exited participant never
//! removes a primitive another participant still holds.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::error::BusError;

/// A single named POSIX semaphore, opened or created by name.
///
/// Acquisition never blocks in the kernel: `sem_timedwait` is not portable
/// to named semaphores on every POSIX target (notably macOS), so waiting
/// with a deadline is implemented as `sem_trywait` under an adaptive
/// backoff, the same shape as the `adaptive_yield` spin/yield/sleep ladder
/// used by `rw_lock.rs` in the retrieval pack's `natyamatsya-cpp-ipc`
/// example.
struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn open_or_create(name: &str, initial_value: u32) -> Result<Self, BusError> {
        let posix_name = format!("/{name}");
        let cname = CString::new(posix_name.clone()).map_err(|_| BusError::InvalidName)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), libc::O_CREAT, 0o666, initial_value) };
        if sem == libc::SEM_FAILED {
            return Err(BusError::SystemPrimitiveUnavailable {
                name: posix_name,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    fn try_take(&self) -> bool {
        unsafe { libc::sem_trywait(self.sem) == 0 }
    }

    fn post(&self) {
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    /// Waits for a permit, polling with an increasing backoff, bounded by
    /// `wait_timeout`.
    async fn wait_timeout(&self, wait_timeout: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + wait_timeout;
        let mut spins: u32 = 0;
        loop {
            if self.try_take() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BusError::Timeout(self.name.clone()));
            }
            let backoff = if spins < 4 {
                Duration::from_micros(50)
            } else if spins < 16 {
                Duration::from_micros(200)
            } else {
                Duration::from_millis(1)
            };
            tokio::time::sleep(backoff.min(deadline - now)).await;
            spins = spins.saturating_add(1);
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem) } != 0 {
            tracing::warn!(name = %self.name, error = %io::Error::last_os_error(), "sem_close failed");
        }
    }
}

/// Multi-reader/single-writer lock over a system-wide name (spec §4.1).
pub struct NamedLock {
    mutex: NamedSemaphore,
    semaphore: NamedSemaphore,
    max_reader_count: u32,
    wait_timeout: Duration,
    /// Serializes acquisition attempts made by *this* instance so one
    /// instance cannot over-commit its own capacity from multiple threads.
    local_latch: Semaphore,
    reader_permits_held: AtomicU32,
    writer_held: AtomicBool,
    disposed: AtomicBool,
}

impl NamedLock {
    pub fn new(
        mutex_name: &str,
        semaphore_name: &str,
        max_reader_count: u32,
        wait_timeout: Duration,
    ) -> Result<Self, BusError> {
        if max_reader_count < 1 {
            return Err(BusError::InvalidReaderCount);
        }
        let mutex = NamedSemaphore::open_or_create(mutex_name, 1)?;
        let semaphore = NamedSemaphore::open_or_create(semaphore_name, max_reader_count)?;
        Ok(Self {
            mutex,
            semaphore,
            max_reader_count,
            wait_timeout,
            local_latch: Semaphore::new(1),
            reader_permits_held: AtomicU32::new(0),
            writer_held: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    async fn take_local_latch(&self) -> Result<SemaphorePermit<'_>, BusError> {
        match timeout(self.wait_timeout, self.local_latch.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(BusError::Disposed),
            Err(_) => Err(BusError::Timeout("local latch".to_string())),
        }
    }

    pub async fn acquire_read(&self) -> Result<ReadGuard<'_>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let latch = self.take_local_latch().await?;

        if let Err(e) = self.mutex.wait_timeout(self.wait_timeout).await {
            drop(latch);
            return Err(e);
        }
        if let Err(e) = self.semaphore.wait_timeout(self.wait_timeout).await {
            self.mutex.post();
            drop(latch);
            return Err(e);
        }
        self.mutex.post();

        self.reader_permits_held.fetch_add(1, Ordering::AcqRel);
        Ok(ReadGuard {
            lock: self,
            _latch: latch,
        })
    }

    pub async fn acquire_write(&self) -> Result<WriteGuard<'_>, BusError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BusError::Disposed);
        }
        let latch = self.take_local_latch().await?;

        if let Err(e) = self.mutex.wait_timeout(self.wait_timeout).await {
            drop(latch);
            return Err(e);
        }

        let mut taken: u32 = 0;
        for _ in 0..self.max_reader_count {
            if let Err(e) = self.semaphore.wait_timeout(self.wait_timeout).await {
                for _ in 0..taken {
                    self.semaphore.post();
                }
                self.mutex.post();
                drop(latch);
                return Err(e);
            }
            taken += 1;
        }
        self.mutex.post();

        self.writer_held.store(true, Ordering::Release);
        Ok(WriteGuard {
            lock: self,
            _latch: latch,
        })
    }

    /// Reflects only this instance's current holdings; for tests/diagnostics.
    pub fn is_reader_held(&self) -> bool {
        self.reader_permits_held.load(Ordering::Acquire) > 0
    }

    pub fn is_writer_held(&self) -> bool {
        self.writer_held.load(Ordering::Acquire)
    }

    /// Refuses to dispose while any lock this instance holds is still
    /// outstanding; the named primitives themselves are left for the OS to
    /// reclaim (never unlinked) since other participants may still hold
    /// handles to them.
    pub async fn dispose(&self) -> Result<(), BusError> {
        let _latch = self.take_local_latch().await?;
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }
}

pub struct ReadGuard<'a> {
    lock: &'a NamedLock,
    _latch: SemaphorePermit<'a>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.semaphore.post();
        self.lock.reader_permits_held.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WriteGuard<'a> {
    lock: &'a NamedLock,
    _latch: SemaphorePermit<'a>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        for _ in 0..self.lock.max_reader_count {
            self.lock.semaphore.post();
        }
        self.lock.writer_held.store(false, Ordering::Release);
    }
}
