use std::{mem, ptr, time::Duration};

use nix::errno::Errno;

use crate::error::Error;

type Result<T> = std::result::Result<T, Error>;

/// A counting semaphore backed by an anonymous shared mapping.
///
/// Unlike the runtime's synchronization types this one lives in memory the
/// kernel shares across `fork`, so the controller and the guest-setup
/// process can hand off through it without any common lock scope. An
/// anonymous mapping also avoids the name collisions and stale-object
/// cleanup of named semaphores: if the owner dies the mapping is reclaimed
/// with its address space.
///
/// The owner is whoever called [`Semaphore::new`]; dropping it unmaps and
/// destroys the counter exactly once. A copy inherited through `fork`
/// must not outlive the handshake it guards.
pub struct Semaphore {
    sem: *mut libc::sem_t,
}

// The raw pointer targets shared memory; every access goes through the
// kernel's semaphore calls, which synchronize internally.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Map shared memory for one counter and initialize it to `initial`.
    ///
    /// `interprocess = false` is only valid when all waiters and posters
    /// are threads of the calling process; pass `true` to cooperate with a
    /// forked child.
    pub fn new(interprocess: bool, initial: u32) -> Result<Self> {
        let mapping = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem::size_of::<libc::sem_t>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(Error::ResourceExhausted(Errno::last()));
        }

        let sem = mapping as *mut libc::sem_t;
        if unsafe { libc::sem_init(sem, interprocess as libc::c_int, initial) } != 0 {
            let errno = Errno::last();
            unsafe { libc::munmap(mapping, mem::size_of::<libc::sem_t>()) };
            return Err(Error::InitializationFailed(errno));
        }

        Ok(Self { sem })
    }

    /// Increment the counter and wake one blocked waiter.
    ///
    /// Failure means the counter is corrupt or already destroyed; callers
    /// treat it as fatal to the invocation.
    pub fn post(&self) -> Result<()> {
        match unsafe { libc::sem_post(self.sem) } {
            0 => Ok(()),
            _ => Err(Error::Semaphore(Errno::last())),
        }
    }

    /// Block until the counter is positive, then decrement it.
    pub fn wait(&self) -> Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(Error::Semaphore(errno)),
            }
        }
    }

    /// Decrement the counter if it is positive, `false` otherwise.
    pub fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN => Ok(false),
            errno => Err(Error::Semaphore(errno)),
        }
    }

    /// Block until the counter is positive or the absolute
    /// `CLOCK_REALTIME` deadline passes; `false` on timeout, without
    /// decrementing.
    pub fn timed_wait(&self, sec: libc::time_t, nsec: libc::c_long) -> Result<bool> {
        let deadline = libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec,
        };
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(false),
                errno => return Err(Error::Semaphore(errno)),
            }
        }
    }

    /// Absolute deadline `timeout` from now, for [`Semaphore::timed_wait`].
    pub fn deadline_in(timeout: Duration) -> (libc::time_t, libc::c_long) {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
        let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        (sec, nsec)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // Teardown has no recovery path, errors are swallowed.
        if unsafe { libc::sem_destroy(self.sem) } != 0 {
            log::debug!("semaphore destroy failed: {}", Errno::last());
        }
        if unsafe { libc::munmap(self.sem as *mut libc::c_void, mem::size_of::<libc::sem_t>()) }
            != 0
        {
            log::debug!("semaphore unmap failed: {}", Errno::last());
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use nix::{
        sys::wait::waitpid,
        unistd::{fork, ForkResult},
    };

    use super::*;

    #[test]
    /// counter semantics: two permits, third `try_wait` comes back empty
    fn try_wait_counts_down() {
        let semaphore = Semaphore::new(false, 2).unwrap();
        assert!(semaphore.try_wait().unwrap());
        assert!(semaphore.try_wait().unwrap());
        assert!(!semaphore.try_wait().unwrap());
    }

    #[test]
    /// `timed_wait` times out without consuming anything
    fn timed_wait_expires() {
        let semaphore = Semaphore::new(false, 0).unwrap();
        let (sec, nsec) = Semaphore::deadline_in(Duration::from_millis(50));
        assert!(!semaphore.timed_wait(sec, nsec).unwrap());
        // the counter was not touched
        semaphore.post().unwrap();
        assert!(semaphore.try_wait().unwrap());
        assert!(!semaphore.try_wait().unwrap());
    }

    #[test]
    /// a post from another thread releases a blocked `wait`
    fn wait_across_threads() {
        let semaphore = Semaphore::new(false, 0).unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                semaphore.post().unwrap();
            });
            semaphore.wait().unwrap();
        });
    }

    #[test]
    /// the mapping survives `fork`: a post from the child releases the parent
    fn wait_across_fork() {
        let semaphore = Semaphore::new(true, 0).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let posted = semaphore.post().is_ok();
                unsafe { libc::_exit(!posted as libc::c_int) };
            }
            ForkResult::Parent { child } => {
                let (sec, nsec) = Semaphore::deadline_in(Duration::from_secs(5));
                assert!(semaphore.timed_wait(sec, nsec).unwrap());
                waitpid(child, None).unwrap();
            }
        }
    }
}
