//! N-party rendezvous over a shared-memory segment plus a SysV semaphore.
//!
//! Mirrors [`crate::shmem_data::ShmemData`]'s create-or-open-by-flink pattern:
//! the rendezvous counters live in a `ShmemData<BarrierState>` segment, and a
//! SysV semaphore (keyed off the same flink path via `ftok`) is used purely as
//! the sleep/wake mechanism between processes. Reusable and resettable;
//! independent of the router/executor.

use std::{
    ffi::CString,
    path::Path,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use procmesh_utils::safe_assert;
use tracing::warn;

use crate::{
    error::BarrierError,
    shmem_data::{ShmemData, shmem_path},
};

#[repr(C)]
struct BarrierState {
    parties: AtomicU32,
    count: AtomicU32,
    generation: AtomicU64,
    broken: AtomicBool,
}

impl Default for BarrierState {
    fn default() -> Self {
        Self {
            parties: AtomicU32::new(0),
            count: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            broken: AtomicBool::new(false),
        }
    }
}

/// Which role this call to [`Barrier::await_all`] played in tripping the
/// barrier. Neither variant implies ordering guarantees beyond "all parties
/// had called `await_all` before any of them returned".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// This call was the one that observed the last arrival and released
    /// every follower.
    Leader,
    Follower,
}

#[repr(C)]
union SemUn {
    val: libc::c_int,
    buf: *mut libc::semid_ds,
    array: *mut libc::c_ushort,
}

pub struct Barrier {
    state: ShmemData<BarrierState>,
    sem_id: libc::c_int,
}

// SAFETY: the segment is backed by shared memory mapped identically in every
// attached process; all mutation goes through atomics or the SysV semaphore,
// neither of which requires single-process ownership.
unsafe impl Send for Barrier {}
unsafe impl Sync for Barrier {}

impl Barrier {
    /// Creates (if absent) or attaches to the named barrier. `parties` is
    /// only honoured by the process that wins the creation race; later
    /// attaches reuse whatever count the creator set (use [`Barrier::leave`]
    /// to shrink it at runtime, e.g. on a peer's shutdown).
    pub fn create_or_open(app_name: &str, label: &str, parties: u32) -> Result<Self, BarrierError> {
        let path = shmem_path(app_name, label);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(BarrierError::Sem)?;
        }
        if !path.exists() {
            std::fs::File::create(&path).map_err(BarrierError::Sem)?;
        }

        let mut created_fresh = false;
        let state = ShmemData::<BarrierState>::open_or_init_labeled(app_name, label, || {
            created_fresh = true;
            BarrierState { parties: AtomicU32::new(parties), ..Default::default() }
        })?;

        let key = ftok(&path)?;
        let sem_id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | 0o666) };
        if sem_id < 0 {
            return Err(BarrierError::Sem(std::io::Error::last_os_error()));
        }

        if created_fresh {
            let arg = SemUn { val: 0 };
            if unsafe { libc::semctl(sem_id, 0, libc::SETVAL, arg) } < 0 {
                return Err(BarrierError::Sem(std::io::Error::last_os_error()));
            }
        }

        Ok(Self { state, sem_id })
    }

    pub fn parties(&self) -> u32 {
        self.state.parties.load(Ordering::Acquire)
    }

    pub fn is_broken(&self) -> bool {
        self.state.broken.load(Ordering::Acquire)
    }

    /// Lowers the required party count by one, e.g. when a peer that would
    /// have called `await_all` has exited instead.
    pub fn leave(&self) {
        self.state.parties.fetch_sub(1, Ordering::AcqRel);
    }

    /// Blocks until every configured party has called `await_all`, or until
    /// `timeout` elapses, or until some other waiter observes a timeout
    /// first and breaks the barrier.
    ///
    /// A barrier configured for (or shrunk to) zero parties returns
    /// immediately without touching the semaphore.
    pub fn await_all(&self, timeout: Option<Duration>) -> Result<AwaitOutcome, BarrierError> {
        let parties = self.parties();
        if parties == 0 {
            return Ok(AwaitOutcome::Follower);
        }
        if self.is_broken() {
            return Err(BarrierError::Broken);
        }

        let arrived = self.state.count.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived >= parties {
            self.state.count.store(0, Ordering::Release);
            self.state.generation.fetch_add(1, Ordering::AcqRel);
            self.post(parties.saturating_sub(1))?;
            return Ok(AwaitOutcome::Leader);
        }

        match self.wait_one(timeout) {
            Ok(()) => {
                if self.is_broken() {
                    return Err(BarrierError::Broken);
                }
                Ok(AwaitOutcome::Follower)
            }
            Err(BarrierError::TimedOut) => {
                if !self.state.broken.swap(true, Ordering::AcqRel) {
                    self.state.generation.fetch_add(1, Ordering::AcqRel);
                    // Generous wakeup: release everyone else who might still
                    // be parked, even though we don't know exactly how many.
                    let stragglers = self.parties();
                    if let Err(err) = self.post(stragglers) {
                        warn!(?err, "barrier: failed to wake stragglers after timeout");
                    }
                }
                Err(BarrierError::Broken)
            }
            Err(e) => Err(e),
        }
    }

    /// Clears a broken barrier for reuse: drops the broken flag, zeroes the
    /// arrival count, and bumps the generation so stale waiters woken by a
    /// previous break don't get confused for members of the new round.
    pub fn reset(&self) {
        self.state.broken.store(false, Ordering::Release);
        self.state.count.store(0, Ordering::Release);
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        let arg = SemUn { val: 0 };
        if unsafe { libc::semctl(self.sem_id, 0, libc::SETVAL, arg) } < 0 {
            warn!(err = ?std::io::Error::last_os_error(), "barrier: reset semctl failed");
        }
    }

    fn post(&self, n: u32) -> Result<(), BarrierError> {
        if n == 0 {
            return Ok(());
        }
        safe_assert!(n <= i16::MAX as u32, "barrier post count {n} exceeds SysV sem_op range");
        let mut sb = libc::sembuf { sem_num: 0, sem_op: n as i16, sem_flg: 0 };
        let ret = unsafe { libc::semop(self.sem_id, &mut sb, 1) };
        if ret == 0 {
            Ok(())
        } else {
            Err(BarrierError::Sem(std::io::Error::last_os_error()))
        }
    }

    fn wait_one(&self, timeout: Option<Duration>) -> Result<(), BarrierError> {
        let mut sb = libc::sembuf { sem_num: 0, sem_op: -1, sem_flg: 0 };
        let ret = match timeout {
            Some(d) => {
                let ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: libc::c_long::from(d.subsec_nanos()),
                };
                unsafe { libc::semtimedop(self.sem_id, &mut sb, 1, &ts) }
            }
            None => unsafe { libc::semop(self.sem_id, &mut sb, 1) },
        };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN => Err(BarrierError::TimedOut),
            Some(code) if code == libc::EINTR => Err(BarrierError::Interrupted),
            _ => Err(BarrierError::Sem(err)),
        }
    }
}

fn ftok(path: &Path) -> Result<libc::key_t, BarrierError> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| BarrierError::Sem(std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
    let key = unsafe { libc::ftok(c_path.as_ptr(), i32::from(b'B')) };
    if key == -1 {
        return Err(BarrierError::Sem(std::io::Error::last_os_error()));
    }
    Ok(key)
}
