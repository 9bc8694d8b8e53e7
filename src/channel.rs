use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use tracing::{info, warn};

use crate::error::{Error, Op, ProtocolError, Role};
use crate::fd;
use crate::handshake::{EnvLookup, Handshake, ProcessEnv};

/// The pipe shared with the jobserver.
///
/// Both descriptors are borrowed from the parent make process. They are never
/// closed by this type. `TokenChannel` is `Sync`: every acquire and release is
/// a single `read(2)`/`write(2)` of one byte, so any number of threads may use
/// the same channel concurrently.
#[derive(Debug)]
pub struct TokenChannel {
    read: BorrowedFd<'static>,
    write: BorrowedFd<'static>,
}

/// Permission to run one job.
///
/// Hand it back with [`Token::release`]. A token that is dropped instead is
/// released on a best-effort basis, errors are only logged.
pub struct Token<'a> {
    channel: &'a TokenChannel,
    byte: u8,
    released: bool,
}

/// Connects to the jobserver advertised in the process environment.
///
/// Returns `Ok(None)` if there is no jobserver.
///
/// # Safety
///
/// See [`TokenChannel::from_raw_fds`]. The descriptors come from `MAKEFLAGS`;
/// the caller must make sure nothing in the process closed or reused them.
pub unsafe fn from_env() -> Result<Option<TokenChannel>, Error> {
    discover(&ProcessEnv)
}

/// Like [`from_env`], with the environment provided by `env`.
///
/// # Safety
///
/// See [`TokenChannel::from_raw_fds`].
pub unsafe fn discover<E: EnvLookup + ?Sized>(env: &E) -> Result<Option<TokenChannel>, Error> {
    match Handshake::from_env(env)? {
        Some(handshake) => handshake.open().map(Some),
        None => Ok(None),
    }
}

impl Handshake {
    /// Validates and configures the advertised descriptors.
    ///
    /// # Safety
    ///
    /// See [`TokenChannel::from_raw_fds`].
    pub unsafe fn open(self) -> Result<TokenChannel, Error> {
        TokenChannel::from_raw_fds(self.read, self.write)
    }
}

impl TokenChannel {
    /// Creates a channel from two raw descriptor numbers.
    ///
    /// Both descriptors are checked to be open and are switched to blocking
    /// mode.
    ///
    /// # Safety
    ///
    /// `read` and `write` must stay open for the rest of the process lifetime
    /// and must not be closed by anybody else while the channel is in use.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Result<TokenChannel, Error> {
        for (role, fd) in [(Role::Read, read), (Role::Write, write)] {
            fd::check_open(fd).map_err(|source| Error::InvalidDescriptor { role, fd, source })?;
        }

        // checked above, so neither is -1
        let channel = TokenChannel {
            read: BorrowedFd::borrow_raw(read),
            write: BorrowedFd::borrow_raw(write),
        };

        for (role, fd) in [(Role::Read, channel.read), (Role::Write, channel.write)] {
            fd::set_blocking(fd).map_err(|source| Error::Configuration {
                role,
                fd: fd.as_raw_fd(),
                source,
            })?;
        }

        Ok(channel)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Takes one token from the jobserver, blocking until one is available.
    pub fn acquire(&self) -> Result<Token<'_>, Error> {
        info!(fd = self.read_fd(), "attempting to acquire jobserver token");

        let byte = match fd::read_byte(self.read) {
            Ok((1, byte)) => byte,
            Ok((count, _)) => {
                return Err(ProtocolError::UnexpectedCount {
                    op: Op::Acquire,
                    count,
                }
                .into())
            }
            Err(source) => {
                return Err(ProtocolError::Io {
                    op: Op::Acquire,
                    source,
                }
                .into())
            }
        };

        info!(fd = self.read_fd(), byte, "acquired jobserver token");

        Ok(Token {
            channel: self,
            byte,
            released: false,
        })
    }

    /// Like [`acquire`](Self::acquire), but gives up once `wake` becomes
    /// readable and returns `Ok(None)`. Draining `wake` is up to the caller.
    ///
    /// The wait happens in `poll(2)`. Another client may still take the byte
    /// between the poll and the read, the read then blocks like `acquire` does.
    pub fn acquire_or_wake(&self, wake: BorrowedFd<'_>) -> Result<Option<Token<'_>>, Error> {
        let (_, woken) = fd::poll_readable(self.read, wake).map_err(|source| ProtocolError::Io {
            op: Op::Acquire,
            source,
        })?;

        if woken {
            info!(fd = self.read_fd(), "woken up while waiting for jobserver token");
            return Ok(None);
        }

        self.acquire().map(Some)
    }

    /// Hands `token` back to the jobserver. `None` is accepted and does nothing.
    pub fn release(&self, token: Option<Token<'_>>) -> Result<(), Error> {
        match token {
            Some(token) => token.release(),
            None => Ok(()),
        }
    }

    fn put_back(&self, byte: u8) -> Result<(), Error> {
        info!(fd = self.write_fd(), byte, "releasing jobserver token");

        match fd::write_byte(self.write, byte) {
            Ok(1) => (),
            Ok(count) => {
                return Err(ProtocolError::UnexpectedCount {
                    op: Op::Release,
                    count,
                }
                .into())
            }
            Err(source) => {
                return Err(ProtocolError::Io {
                    op: Op::Release,
                    source,
                }
                .into())
            }
        }

        info!(fd = self.write_fd(), byte, "released jobserver token");
        Ok(())
    }
}

impl Token<'_> {
    /// The byte that was read from the jobserver. It carries no meaning but is
    /// written back unchanged on release.
    pub fn byte(&self) -> u8 {
        self.byte
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.channel.put_back(self.byte)
    }
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.channel.put_back(self.byte) {
            warn!("dropped jobserver token could not be released: {e}");
        }
    }
}

impl fmt::Debug for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Token")
            .field("byte", &self.byte)
            .field("read_fd", &self.channel.read_fd())
            .field("write_fd", &self.channel.write_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::test_pipe::Pipe;
    use std::collections::HashMap;
    use std::os::fd::AsFd;
    use std::sync::mpsc;
    use std::time::Duration;

    fn channel(pipe: &Pipe) -> TokenChannel {
        unsafe { TokenChannel::from_raw_fds(pipe.read.as_raw_fd(), pipe.write.as_raw_fd()) }
            .unwrap()
    }

    #[test]
    fn test_acquire_in_order() {
        let pipe = Pipe::new();
        pipe.seed(b"abc");
        let channel = channel(&pipe);

        let tokens = (0..3)
            .map(|_| channel.acquire().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            tokens.iter().map(Token::byte).collect::<Vec<_>>(),
            b"abc".to_vec()
        );
        assert_eq!(pipe.pending(), 0);

        for token in tokens {
            token.release().unwrap();
        }
        assert_eq!(pipe.pending(), 3);
    }

    #[test]
    fn test_acquire_blocks_until_released() {
        let pipe = Pipe::new();
        pipe.seed(b"x");
        let channel = &channel(&pipe);

        let first = channel.acquire().unwrap();

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            s.spawn(move || {
                let token = channel.acquire().unwrap();
                tx.send(token.byte()).unwrap();
                token.release().unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

            first.release().unwrap();
            assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), b'x');
        });

        assert_eq!(pipe.pending(), 1);
    }

    #[test]
    fn test_release_writes_acquired_byte() {
        let pipe = Pipe::new();
        pipe.seed(&[0xa5]);
        let channel = channel(&pipe);

        let token = channel.acquire().unwrap();
        assert_eq!(pipe.pending(), 0);
        channel.release(Some(token)).unwrap();
        assert_eq!(pipe.pending(), 1);

        let (count, byte) = fd::read_byte(pipe.read.as_fd()).unwrap();
        assert_eq!((count, byte), (1, 0xa5));
    }

    #[test]
    fn test_release_none() {
        let pipe = Pipe::new();
        let channel = channel(&pipe);
        channel.release(None).unwrap();
        assert_eq!(pipe.pending(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let pipe = Pipe::new();
        pipe.seed(b"+");
        let channel = channel(&pipe);

        drop(channel.acquire().unwrap());
        assert_eq!(pipe.pending(), 1);
    }

    #[test]
    fn test_acquire_eof() {
        let Pipe { read, write } = Pipe::new();
        let channel =
            unsafe { TokenChannel::from_raw_fds(read.as_raw_fd(), read.as_raw_fd()) }.unwrap();
        drop(write);

        match channel.acquire() {
            Err(Error::Protocol(err)) => {
                assert_eq!(err.op(), Op::Acquire);
                assert!(matches!(
                    err,
                    ProtocolError::UnexpectedCount { count: 0, .. }
                ));
            }
            other => panic!("unexpected result {other:?}"),
        };
    }

    #[test]
    fn test_release_broken_pipe() {
        let pipe = Pipe::new();
        pipe.seed(b"+");
        let channel = channel(&pipe);
        let token = channel.acquire().unwrap();

        // reading side gone, writing yields EPIPE (SIGPIPE is ignored by the
        // Rust runtime)
        let Pipe { read, write } = pipe;
        drop(read);

        match token.release() {
            Err(Error::Protocol(ProtocolError::Io { op, source })) => {
                assert_eq!(op, Op::Release);
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected result {other:?}"),
        }
        drop(write);
    }

    #[test]
    fn test_nonblocking_cleared() {
        let pipe = Pipe::new();
        for fd in [pipe.read.as_raw_fd(), pipe.write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }

        let channel = channel(&pipe);

        assert!(!fd::is_nonblocking(pipe.read.as_fd()).unwrap());
        assert!(!fd::is_nonblocking(pipe.write.as_fd()).unwrap());
        assert_eq!(channel.read_fd(), pipe.read.as_raw_fd());
    }

    #[test]
    fn test_invalid_descriptor() {
        let pipe = Pipe::new();

        // far above anything a test process has open
        let closed = 4000;

        match unsafe { TokenChannel::from_raw_fds(closed, pipe.write.as_raw_fd()) } {
            Err(Error::InvalidDescriptor { role, fd, .. }) => {
                assert_eq!(role, Role::Read);
                assert_eq!(fd, closed);
            }
            other => panic!("unexpected result {other:?}"),
        }

        match unsafe { TokenChannel::from_raw_fds(pipe.read.as_raw_fd(), closed) } {
            Err(err @ Error::InvalidDescriptor { .. }) => {
                assert!(err.to_string().contains("try adding `+`"));
            }
            other => panic!("unexpected result {other:?}"),
        };
    }

    #[test]
    fn test_discover() {
        let pipe = Pipe::new();
        let mut env = HashMap::new();

        assert!(unsafe { discover(&env) }.unwrap().is_none());

        env.insert(
            "MAKEFLAGS".to_string(),
            format!(
                " -j2 --jobserver-auth={},{}",
                pipe.read.as_raw_fd(),
                pipe.write.as_raw_fd()
            ),
        );
        let channel = unsafe { discover(&env) }.unwrap().unwrap();
        assert_eq!(channel.read_fd(), pipe.read.as_raw_fd());
        assert_eq!(channel.write_fd(), pipe.write.as_raw_fd());

        env.insert("MAKEFLAGS".to_string(), " -j2".to_string());
        assert!(matches!(unsafe { discover(&env) }, Err(Error::Parse(_))));

        env.insert(
            "MAKEFLAGS".to_string(),
            "--jobserver-auth=4000,4001".to_string(),
        );
        assert!(matches!(
            unsafe { discover(&env) },
            Err(Error::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_acquire_or_wake_token() {
        let pipe = Pipe::new();
        let wake = Pipe::new();
        pipe.seed(b"t");
        let channel = channel(&pipe);

        let token = channel.acquire_or_wake(wake.read.as_fd()).unwrap().unwrap();
        assert_eq!(token.byte(), b't');
        token.release().unwrap();
        assert_eq!(pipe.pending(), 1);
    }

    #[test]
    fn test_acquire_or_wake_abandoned() {
        let pipe = Pipe::new();
        let wake = Pipe::new();
        let channel = &channel(&pipe);

        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel();
            let wake_read = wake.read.as_fd();
            s.spawn(move || {
                let woken = channel.acquire_or_wake(wake_read).unwrap().is_none();
                tx.send(woken).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

            wake.seed(b"w");
            assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
        });

        // nothing was taken from the jobserver, the wakeup byte is left
        assert_eq!(pipe.pending(), 0);
        assert_eq!(wake.pending(), 1);
    }

    #[test]
    fn test_acquire_or_wake_eof() {
        let Pipe { read, write } = Pipe::new();
        let wake = Pipe::new();
        let channel =
            unsafe { TokenChannel::from_raw_fds(read.as_raw_fd(), read.as_raw_fd()) }.unwrap();
        drop(write);

        let result = channel.acquire_or_wake(wake.read.as_fd());
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedCount { count: 0, .. }))
        ));
    }

    #[test]
    fn test_concurrent_acquire() {
        const SEEDED: usize = 16;
        const THREADS: usize = 8;

        let pipe = Pipe::new();
        pipe.seed(&(0..SEEDED as u8).collect::<Vec<_>>());
        let channel = channel(&pipe);

        let mut acquired = std::thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let mut bytes = Vec::new();
                        for _ in 0..SEEDED / THREADS {
                            let token = channel.acquire().unwrap();
                            bytes.push(token.byte());
                            std::mem::forget(token);
                        }
                        bytes
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        acquired.sort();
        assert_eq!(acquired, (0..SEEDED as u8).collect::<Vec<_>>());
        assert_eq!(pipe.pending(), 0);
    }
}
