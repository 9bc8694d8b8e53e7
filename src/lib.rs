//! Client side of the GNU make jobserver protocol.
//!
//! make hands a pipe to its children and seeds it with one byte per job slot.
//! A child that wants to run another job in parallel reads a byte (a token)
//! from the pipe and writes it back when the job is done.
//!
//! ```no_run
//! # fn main() -> Result<(), makejobs::Error> {
//! // Safety: nothing in this process touches the inherited descriptors.
//! if let Some(channel) = unsafe { makejobs::from_env()? } {
//!     let token = channel.acquire()?;
//!     // run one job
//!     token.release()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every make child owns one implicit job slot without reading a token.
//! Tokens are only needed for jobs beyond that.

mod channel;
mod error;
mod fd;
mod handshake;

pub use channel::{discover, from_env, Token, TokenChannel};
pub use error::{Error, Op, ParseError, ProtocolError, Role};
pub use handshake::{EnvLookup, Handshake, ProcessEnv, HANDSHAKE_VAR};
