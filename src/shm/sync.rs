//! Process-shared pthread primitives living inside a mapped segment

use std::mem::MaybeUninit;
use std::time::Duration;

use libc::{pthread_cond_t, pthread_mutex_t};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

/// Result of locking a robust mutex
pub(super) enum LockOutcome {
    Acquired,
    /// Previous owner died while holding the lock; the caller now holds it
    Abandoned,
}

fn check(rc: libc::c_int) -> Result<(), Errno> {
    match rc {
        0 => Ok(()),
        code => Err(Errno::from_raw(code)),
    }
}

/// Initialize a robust, process-shared mutex in place.
///
/// # Safety
/// `mutex` must point to writable memory that no other thread or process is
/// using as a mutex yet.
pub(super) unsafe fn init_mutex(mutex: *mut pthread_mutex_t) -> Result<(), Errno> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

    let result = check(libc::pthread_mutexattr_setpshared(
        attr.as_mut_ptr(),
        libc::PTHREAD_PROCESS_SHARED,
    ))
    .and_then(|_| {
        check(libc::pthread_mutexattr_setrobust(
            attr.as_mut_ptr(),
            libc::PTHREAD_MUTEX_ROBUST,
        ))
    })
    .and_then(|_| check(libc::pthread_mutex_init(mutex, attr.as_ptr())));

    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
    result
}

/// Initialize a process-shared condition variable timed against
/// CLOCK_MONOTONIC.
///
/// # Safety
/// Same requirements as [`init_mutex`].
pub(super) unsafe fn init_cond(cond: *mut pthread_cond_t) -> Result<(), Errno> {
    let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;

    let result = check(libc::pthread_condattr_setpshared(
        attr.as_mut_ptr(),
        libc::PTHREAD_PROCESS_SHARED,
    ))
    .and_then(|_| {
        check(libc::pthread_condattr_setclock(
            attr.as_mut_ptr(),
            libc::CLOCK_MONOTONIC,
        ))
    })
    .and_then(|_| check(libc::pthread_cond_init(cond, attr.as_ptr())));

    libc::pthread_condattr_destroy(attr.as_mut_ptr());
    result
}

/// # Safety
/// `mutex` must have been set up by [`init_mutex`] and stay mapped.
pub(super) unsafe fn lock(mutex: *mut pthread_mutex_t) -> Result<LockOutcome, Errno> {
    match libc::pthread_mutex_lock(mutex) {
        0 => Ok(LockOutcome::Acquired),
        libc::EOWNERDEAD => Ok(LockOutcome::Abandoned),
        code => Err(Errno::from_raw(code)),
    }
}

/// # Safety
/// The calling thread must hold `mutex`.
pub(super) unsafe fn unlock(mutex: *mut pthread_mutex_t) {
    libc::pthread_mutex_unlock(mutex);
}

/// Block on `cond`, atomically releasing `mutex`.
///
/// # Safety
/// The calling thread must hold `mutex`.
pub(super) unsafe fn wait(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
) -> Result<LockOutcome, Errno> {
    match libc::pthread_cond_wait(cond, mutex) {
        0 => Ok(LockOutcome::Acquired),
        libc::EOWNERDEAD => Ok(LockOutcome::Abandoned),
        code => Err(Errno::from_raw(code)),
    }
}

/// Like [`wait`], giving up after `timeout`. `Ok(None)` means timed out
/// with the mutex re-acquired.
///
/// # Safety
/// The calling thread must hold `mutex`.
pub(super) unsafe fn wait_timeout(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
    timeout: Duration,
) -> Result<Option<LockOutcome>, Errno> {
    let deadline = clock_gettime(ClockId::CLOCK_MONOTONIC)? + TimeSpec::from_duration(timeout);
    match libc::pthread_cond_timedwait(cond, mutex, deadline.as_ref()) {
        0 => Ok(Some(LockOutcome::Acquired)),
        libc::ETIMEDOUT => Ok(None),
        libc::EOWNERDEAD => Ok(Some(LockOutcome::Abandoned)),
        code => Err(Errno::from_raw(code)),
    }
}

/// # Safety
/// `cond` must have been set up by [`init_cond`] and stay mapped.
pub(super) unsafe fn broadcast(cond: *mut pthread_cond_t) -> Result<(), Errno> {
    check(libc::pthread_cond_broadcast(cond))
}
