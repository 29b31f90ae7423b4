//! Signal blocking for exhaustion passes.
//!
//! A ZERO tier pass deliberately drives a zone to exhaustion. Being killed
//! halfway leaves the system starved, so the pass runs with every blockable
//! signal of the calling thread masked.

use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::mem::MaybeUninit;

/// Whether a ZERO tier invocation masks signals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum SignalPolicy {
    /// Mask all blockable signals while the invocation runs
    #[default]
    Block,
    /// Leave the signal mask alone
    Ignore,
}

/// Keeps all blockable signals of the calling thread masked until dropped.
///
/// The previous mask is restored on drop.
pub struct SignalGuard {
    previous: libc::sigset_t,
}

impl SignalGuard {
    /// Blocks every blockable signal of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mask cannot be changed.
    pub fn block_all() -> std::io::Result<Self> {
        let mut full = MaybeUninit::<libc::sigset_t>::uninit();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
        let ret = unsafe {
            libc::sigfillset(full.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_SETMASK, full.as_ptr(), previous.as_mut_ptr())
        };
        if ret != 0 {
            return Err(std::io::Error::from_raw_os_error(ret));
        }
        debug!("blocked all signals for the calling thread");
        Ok(Self {
            previous: unsafe { previous.assume_init() },
        })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let ret = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if ret != 0 {
            warn!(
                "failed to restore signal mask: {}",
                std::io::Error::from_raw_os_error(ret)
            );
        } else {
            debug!("restored signal mask");
        }
    }
}

/// Whether `signal` is in the calling thread's signal mask.
///
/// # Errors
///
/// Returns the OS error if the mask cannot be read.
pub fn is_blocked(signal: libc::c_int) -> std::io::Result<bool> {
    let mut current = MaybeUninit::<libc::sigset_t>::uninit();
    let ret = unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), current.as_mut_ptr())
    };
    if ret != 0 {
        return Err(std::io::Error::from_raw_os_error(ret));
    }
    Ok(unsafe { libc::sigismember(current.as_ptr(), signal) } == 1)
}

impl fmt::Debug for SignalGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalGuard").finish_non_exhaustive()
    }
}
