//! Anonymous pipe endpoints for the child process.
//!
//! The launcher wires the child's call stream onto fd 3 and its reply
//! stream onto fd 4 before exec; stdin/stdout/stderr are redirected
//! elsewhere and never carry protocol bytes. This module turns those
//! inherited descriptors into tokio pipe endpoints.
//!
//! Unix only: the protocol runs over anonymous pipes between a single
//! parent/child pair.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::net::unix::pipe;

use crate::error::Result;

/// Descriptor carrying call envelopes into the child.
pub const CHILD_CALL_FD: RawFd = 3;

/// Descriptor carrying reply envelopes out of the child.
pub const CHILD_REPLY_FD: RawFd = 4;

/// Claim the child-side pipe endpoints from their fixed descriptors.
///
/// Must be called at most once per process: it takes ownership of
/// fds 3 and 4, which must not be touched elsewhere afterwards.
///
/// # Errors
///
/// Returns an I/O error if either descriptor is missing or not a pipe.
pub fn child_endpoints() -> Result<(pipe::Receiver, pipe::Sender)> {
    // Safety: the launcher duped the pipe ends onto these descriptors
    // before exec and nothing else in the process holds them.
    let call_fd = unsafe { OwnedFd::from_raw_fd(CHILD_CALL_FD) };
    let reply_fd = unsafe { OwnedFd::from_raw_fd(CHILD_REPLY_FD) };

    let receiver = pipe::Receiver::from_owned_fd(call_fd)?;
    let sender = pipe::Sender::from_owned_fd(reply_fd)?;
    Ok((receiver, sender))
}
