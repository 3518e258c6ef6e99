//! A named, fixed-size frame buffer shared between processes.
//!
//! Memory layout of the POSIX shared memory object:
//!
//! ```text
//! +---------------------------+ 0
//! | SegmentHeader             |  magic, capacity, payload offset,
//! |                           |  publish sequence, timestamp,
//! |                           |  pthread mutex + condvar
//! +---------------------------+ payload_offset (page aligned)
//! | payload (capacity bytes)  |  one image, overwritten in place
//! +---------------------------+
//! ```
//!
//! Everything below the magic word is only touched while holding the
//! segment mutex.

use std::fs::File;
use std::mem::{self, size_of};
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, warn};

use super::sync::{self, LockOutcome};
use crate::error::ShmError;

/// "SHMCAM01"
const MAGIC: u64 = 0x5348_4d43_414d_3031;

#[repr(C)]
struct SegmentHeader {
    magic: AtomicU64,
    capacity: u64,
    payload_offset: u64,
    sequence: u64,
    timestamp_sec: i64,
    timestamp_usec: i64,
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

/// One shared frame buffer, either created (producer) or attached (reader)
pub struct SharedSegment {
    name: String,
    os_name: String,
    capacity: usize,
    header: NonNull<SegmentHeader>,
    payload: NonNull<u8>,
    owner: bool,
    _map: MmapMut,
}

// The header and payload are only accessed through the process-shared mutex.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create the segment `name` with room for exactly `capacity` payload
    /// bytes. A stale segment with the same name is replaced.
    pub fn create(name: &str, capacity: usize) -> Result<Self, ShmError> {
        let os_name = os_name(name)?;
        if capacity == 0 {
            return Err(ShmError::InvalidSize {
                name: name.to_string(),
                capacity,
            });
        }

        let payload_offset = align_up(size_of::<SegmentHeader>(), page_size::get());
        let total = payload_offset + capacity;

        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP;
        let fd = match shm_open(os_name.as_str(), flags, mode) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                warn!("Replacing stale shared memory '{}'", name);
                shm_unlink(os_name.as_str()).map_err(|e| os_err(name, "shm_unlink", e))?;
                shm_open(os_name.as_str(), flags, mode)
                    .map_err(|e| os_err(name, "shm_open", e))?
            }
            Err(e) => return Err(os_err(name, "shm_open", e)),
        };

        // From here on a failure must not leave the name behind
        let cleanup = UnlinkOnError(&os_name);

        ftruncate(&fd, total as libc::off_t).map_err(|e| os_err(name, "ftruncate", e))?;
        let file = File::from(fd);
        let mut map = unsafe { MmapOptions::new().len(total).map_mut(&file) }.map_err(|source| {
            ShmError::Map {
                name: name.to_string(),
                source,
            }
        })?;

        let base = map.as_mut_ptr();
        let header = base as *mut SegmentHeader;
        unsafe {
            // ftruncate zero-filled the object; only non-zero fields are written
            addr_of_mut!((*header).capacity).write(capacity as u64);
            addr_of_mut!((*header).payload_offset).write(payload_offset as u64);
            sync::init_mutex(addr_of_mut!((*header).mutex))
                .map_err(|e| os_err(name, "pthread_mutex_init", e))?;
            sync::init_cond(addr_of_mut!((*header).cond))
                .map_err(|e| os_err(name, "pthread_cond_init", e))?;
            (*header).magic.store(MAGIC, Ordering::Release);
        }
        mem::forget(cleanup);

        debug!(name, capacity, payload_offset, "created shared segment");

        Ok(Self {
            name: name.to_string(),
            os_name,
            capacity,
            header: NonNull::new(header).ok_or_else(|| ShmError::NotReady(name.to_string()))?,
            payload: NonNull::new(unsafe { base.add(payload_offset) })
                .ok_or_else(|| ShmError::NotReady(name.to_string()))?,
            owner: true,
            _map: map,
        })
    }

    /// Attach to a segment created by a producer.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let os_name = os_name(name)?;
        let fd = shm_open(os_name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| os_err(name, "shm_open", e))?;
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|source| ShmError::Map {
                name: name.to_string(),
                source,
            })?
            .len() as usize;
        if len < size_of::<SegmentHeader>() {
            return Err(ShmError::NotReady(name.to_string()));
        }

        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }.map_err(|source| {
            ShmError::Map {
                name: name.to_string(),
                source,
            }
        })?;

        let base = map.as_mut_ptr();
        let header = base as *mut SegmentHeader;
        let (capacity, payload_offset) = unsafe {
            if (*header).magic.load(Ordering::Acquire) != MAGIC {
                return Err(ShmError::NotReady(name.to_string()));
            }
            (
                addr_of!((*header).capacity).read() as usize,
                addr_of!((*header).payload_offset).read() as usize,
            )
        };
        if payload_offset < size_of::<SegmentHeader>() || payload_offset + capacity > len {
            return Err(ShmError::NotReady(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            os_name,
            capacity,
            header: NonNull::new(header).ok_or_else(|| ShmError::NotReady(name.to_string()))?,
            payload: NonNull::new(unsafe { base.add(payload_offset) })
                .ok_or_else(|| ShmError::NotReady(name.to_string()))?,
            owner: false,
            _map: map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload size in bytes, fixed at creation
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        unsafe { addr_of_mut!((*self.header.as_ptr()).mutex) }
    }

    fn cond(&self) -> *mut libc::pthread_cond_t {
        unsafe { addr_of_mut!((*self.header.as_ptr()).cond) }
    }

    /// Acquire the segment lock, blocking against every other process that
    /// holds it.
    pub fn lock(&self) -> Result<SegmentGuard<'_>, ShmError> {
        match unsafe { sync::lock(self.mutex()) } {
            Ok(LockOutcome::Acquired) => Ok(SegmentGuard { segment: self }),
            Ok(LockOutcome::Abandoned) => Err(self.abandon()),
            Err(e) => Err(self.lock_err(e)),
        }
    }

    /// Wake every process waiting for a new frame.
    pub fn notify_all(&self) -> Result<(), ShmError> {
        unsafe { sync::broadcast(self.cond()) }
            .map_err(|e| os_err(&self.name, "pthread_cond_broadcast", e))
    }

    /// Overwrite the payload with `image`, stamp it, release the lock and
    /// wake all waiters. Returns the new publish sequence number.
    pub fn publish(&self, image: &[u8], timestamp: SystemTime) -> Result<u64, ShmError> {
        if image.len() != self.capacity {
            return Err(ShmError::SizeMismatch {
                name: self.name.clone(),
                capacity: self.capacity,
                actual: image.len(),
            });
        }

        let sequence = {
            let mut guard = self.lock()?;
            guard.data_mut().copy_from_slice(image);
            guard.set_timestamp(timestamp);
            guard.sequence()
        };
        self.notify_all()?;
        Ok(sequence)
    }

    /// Copy the current payload and its timestamp out under the lock.
    pub fn snapshot(&self) -> Result<(Vec<u8>, Option<SystemTime>), ShmError> {
        let guard = self.lock()?;
        Ok((guard.data().to_vec(), guard.timestamp()))
    }

    /// Called while holding a mutex whose previous owner died. The data may be
    /// half written, so the mutex is released without being marked
    /// consistent, which leaves it unusable for everyone.
    fn abandon(&self) -> ShmError {
        unsafe { sync::unlock(self.mutex()) };
        ShmError::Abandoned(self.name.clone())
    }

    fn lock_err(&self, e: Errno) -> ShmError {
        if e == Errno::ENOTRECOVERABLE {
            ShmError::Abandoned(self.name.clone())
        } else {
            ShmError::Lock {
                name: self.name.clone(),
                source: e,
            }
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.owner {
            // Attached readers keep their mapping; only the name goes away
            if let Err(e) = shm_unlink(self.os_name.as_str()) {
                warn!("Failed to unlink shared memory '{}': {}", self.name, e);
            } else {
                debug!(name = %self.name, "released shared segment");
            }
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Exclusive access to a segment; the lock is released on drop.
pub struct SegmentGuard<'a> {
    segment: &'a SharedSegment,
}

impl<'a> SegmentGuard<'a> {
    fn header(&self) -> *mut SegmentHeader {
        self.segment.header.as_ptr()
    }

    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.segment.payload.as_ptr(), self.segment.capacity) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.segment.payload.as_ptr(), self.segment.capacity) }
    }

    /// Number of publishes so far; 0 before the first frame
    pub fn sequence(&self) -> u64 {
        unsafe { addr_of!((*self.header()).sequence).read() }
    }

    /// Capture time of the current payload, `None` before the first publish
    pub fn timestamp(&self) -> Option<SystemTime> {
        if self.sequence() == 0 {
            return None;
        }
        let (sec, usec) = unsafe {
            (
                addr_of!((*self.header()).timestamp_sec).read(),
                addr_of!((*self.header()).timestamp_usec).read(),
            )
        };
        // Another process may have scribbled on the header
        let usec = usec.clamp(0, 999_999) as u64;
        let since_epoch = Duration::from_secs(sec.max(0) as u64) + Duration::from_micros(usec);
        UNIX_EPOCH.checked_add(since_epoch)
    }

    /// Record the payload's capture time and advance the publish sequence.
    pub fn set_timestamp(&mut self, timestamp: SystemTime) {
        let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        unsafe {
            let header = self.header();
            addr_of_mut!((*header).timestamp_sec).write(since_epoch.as_secs() as i64);
            addr_of_mut!((*header).timestamp_usec).write(since_epoch.subsec_micros() as i64);
            let sequence = addr_of!((*header).sequence).read();
            addr_of_mut!((*header).sequence).write(sequence.wrapping_add(1));
        }
    }

    /// Release the lock until the condition is signalled, then re-acquire it.
    /// May return spuriously; see [`wait_for_publish`](Self::wait_for_publish).
    pub fn wait(self) -> Result<Self, ShmError> {
        let segment = self.segment;
        let outcome = unsafe { sync::wait(segment.cond(), segment.mutex()) };
        match outcome {
            Ok(LockOutcome::Acquired) => Ok(self),
            Ok(LockOutcome::Abandoned) => {
                mem::forget(self);
                Err(segment.abandon())
            }
            Err(e) => {
                // The mutex is not held after a failed re-acquire
                mem::forget(self);
                Err(segment.lock_err(e))
            }
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound. The flag is `true`
    /// when the wait timed out.
    pub fn wait_timeout(self, timeout: Duration) -> Result<(Self, bool), ShmError> {
        let segment = self.segment;
        let outcome = unsafe { sync::wait_timeout(segment.cond(), segment.mutex(), timeout) };
        match outcome {
            Ok(Some(LockOutcome::Acquired)) => Ok((self, false)),
            Ok(None) => Ok((self, true)),
            Ok(Some(LockOutcome::Abandoned)) => {
                mem::forget(self);
                Err(segment.abandon())
            }
            Err(e) => {
                // The mutex is not held after a failed re-acquire
                mem::forget(self);
                Err(segment.lock_err(e))
            }
        }
    }

    /// Wait until a publish newer than `seen` has landed.
    pub fn wait_for_publish(mut self, seen: u64) -> Result<Self, ShmError> {
        while self.sequence() == seen {
            self = self.wait()?;
        }
        Ok(self)
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        unsafe { sync::unlock(self.segment.mutex()) };
    }
}

/// Unlinks a freshly created object unless disarmed with `mem::forget`.
struct UnlinkOnError<'a>(&'a str);

impl Drop for UnlinkOnError<'_> {
    fn drop(&mut self) {
        let _ = shm_unlink(self.0);
    }
}

fn os_name(name: &str) -> Result<String, ShmError> {
    if name.is_empty() || name.len() > 250 || name.contains(['/', '\0']) {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(format!("/{name}"))
}

fn os_err(name: &str, op: &'static str, source: Errno) -> ShmError {
    ShmError::Os {
        name: name.to_string(),
        op,
        source,
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}
