use std::fmt;
use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Which end of the jobserver pipe a descriptor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    Write,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Read => write!(f, "read"),
            Role::Write => write!(f, "write"),
        }
    }
}

/// The token operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Acquire,
    Release,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Op::Acquire => write!(f, "acquire"),
            Op::Release => write!(f, "release"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("cannot parse jobserver {field} descriptor from `{value}`")]
    Descriptor { field: Role, value: String },
    #[error("cannot parse --jobserver-auth from $MAKEFLAGS: `{value}`")]
    MissingFlag { value: String },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("cannot {op} jobserver token")]
    Io {
        op: Op,
        #[source]
        source: io::Error,
    },
    #[error("cannot {op} jobserver token: transferred {count} bytes instead of 1")]
    UnexpectedCount { op: Op, count: usize },
}

impl ProtocolError {
    pub fn op(&self) -> Op {
        match self {
            ProtocolError::Io { op, .. } | ProtocolError::UnexpectedCount { op, .. } => *op,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(
        "unable to use jobserver {role} descriptor {fd}; does make know this command can \
         work with a jobserver? (try adding `+` before the command in the recipe)"
    )]
    InvalidDescriptor {
        role: Role,
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("cannot set jobserver {role} descriptor {fd} as blocking")]
    Configuration {
        role: Role,
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
