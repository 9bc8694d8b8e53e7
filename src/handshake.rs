//! Finding the jobserver descriptors in the environment.
//!
//! make advertises its jobserver to child processes through `MAKEFLAGS`,
//! e.g. `MAKEFLAGS=" -j4 --jobserver-auth=3,4"`. Older make versions spell
//! the flag `--jobserver-fds=`. Both spellings are treated the same.

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::error::{ParseError, Role};

/// Environment variable make uses to pass its flags (and the jobserver) down.
pub const HANDSHAKE_VAR: &str = "MAKEFLAGS";

const FLAG_PREFIXES: [&str; 2] = ["--jobserver-auth=", "--jobserver-fds="];

/// Source of environment variables.
pub trait EnvLookup {
    fn var(&self, key: &str) -> Option<String>;
}

/// The environment of the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
    }
}

impl EnvLookup for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Descriptor numbers as advertised by make. Nothing is known about them yet,
/// see [`Handshake::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub read: RawFd,
    pub write: RawFd,
}

impl Handshake {
    /// Looks up the handshake in `env`.
    ///
    /// Returns `Ok(None)` if `MAKEFLAGS` is unset or empty, i.e. we're not
    /// running below make.
    pub fn from_env<E: EnvLookup + ?Sized>(env: &E) -> Result<Option<Handshake>, ParseError> {
        match env.var(HANDSHAKE_VAR) {
            Some(makeflags) if !makeflags.is_empty() => Handshake::parse(&makeflags).map(Some),
            _ => Ok(None),
        }
    }

    /// Parses a `MAKEFLAGS` value. The first jobserver flag wins.
    pub fn parse(makeflags: &str) -> Result<Handshake, ParseError> {
        for arg in makeflags.split(' ') {
            let Some(value) = FLAG_PREFIXES
                .iter()
                .find_map(|prefix| arg.strip_prefix(prefix))
            else {
                continue;
            };

            let (read, write) = match value.split_once(',') {
                Some((read, write)) => (read, Some(write)),
                None => (value, None),
            };

            return Ok(Handshake {
                read: parse_fd(Role::Read, read)?,
                write: parse_fd(Role::Write, write.unwrap_or_default())?,
            });
        }

        Err(ParseError::MissingFlag {
            value: makeflags.to_string(),
        })
    }
}

fn parse_fd(field: Role, value: &str) -> Result<RawFd, ParseError> {
    match value.parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(ParseError::Descriptor {
            field,
            value: value.to_string(),
        }),
    }
}
