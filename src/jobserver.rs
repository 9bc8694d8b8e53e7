use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use anyhow::{Context as _, Result};
use makejobs::{Token, TokenChannel};

pub static JOBSERVER: OnceLock<Option<TokenChannel>> = OnceLock::new();

/// Connects to the jobserver from `MAKEFLAGS`, once per process.
pub fn maybe_init_fromenv() -> Result<Option<&'static TokenChannel>> {
    if let Some(channel) = JOBSERVER.get() {
        return Ok(channel.as_ref());
    }

    // Safety: the inherited descriptors are only ever used through JOBSERVER
    // and nothing in this process closes them.
    let channel = unsafe { makejobs::from_env() }.context("connecting to jobserver")?;

    Ok(JOBSERVER.get_or_init(|| channel).as_ref())
}

/// Self-pipe that interrupts a pending token wait.
///
/// Woken when a command finishes (its slot may be reused) and on SIGINT.
#[derive(Debug)]
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
    interrupted: AtomicBool,
}

impl Waker {
    pub fn new() -> Result<Self> {
        let mut fds = [0; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            return Err(std::io::Error::last_os_error()).context("creating wakeup pipe");
        }
        // Safety: both freshly created and owned by nobody else
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        Ok(Self {
            read,
            write,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn wake(&self) {
        let byte = 0u8;
        // a full pipe already holds a pending wakeup
        unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
    }

    /// Consumes pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) } > 0
        {
        }
    }

    /// Marks the run as interrupted and wakes a pending token wait.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

/// Permission to run one job.
#[derive(Debug)]
pub enum Slot {
    /// The slot every make child owns without asking.
    Implicit,
    Token(Token<'static>),
    /// No jobserver, the caller limits itself.
    Unlimited,
}

/// Hands out job slots: the implicit one first, then jobserver tokens.
#[derive(Debug)]
pub struct Slots {
    channel: Option<&'static TokenChannel>,
    implicit_free: AtomicBool,
}

impl Slots {
    pub fn new(channel: Option<&'static TokenChannel>) -> Self {
        Self {
            channel,
            implicit_free: AtomicBool::new(true),
        }
    }

    pub fn has_jobserver(&self) -> bool {
        self.channel.is_some()
    }

    /// Returns a free slot, waiting for a token if the implicit slot is taken.
    ///
    /// Returns `Ok(None)` if `waker` fired while waiting. The caller should
    /// look around (finished commands, interrupts) and ask again.
    pub fn acquire(&self, waker: &Waker) -> Result<Option<Slot>> {
        let Some(channel) = self.channel else {
            return Ok(Some(Slot::Unlimited));
        };

        if self
            .implicit_free
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(Some(Slot::Implicit));
        }

        Ok(channel.acquire_or_wake(waker.as_fd())?.map(Slot::Token))
    }

    pub fn release(&self, slot: Slot) -> Result<()> {
        match slot {
            Slot::Implicit => self.implicit_free.store(true, Ordering::Release),
            Slot::Token(token) => token.release()?,
            Slot::Unlimited => (),
        }
        Ok(())
    }
}
