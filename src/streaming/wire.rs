//! Control socket framing
//!
//! # Wire Format
//!
//! Every message on the control socket, in both directions, is framed the
//! same way:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ Opaque bytes             │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! - **Handshake (agent → cloud)**: raw bytes of the unit identifier
//! - **State (agent → cloud)**: serialized unit state, once per interval
//! - **Command (cloud → agent)**: opaque payload handed to the unit
//!
//! ## Error Handling
//!
//! - **EOF before a full frame**: [`Error::ConnectionClosed`]
//! - **Oversized length prefix**: [`Error::FrameTooLarge`], nothing allocated
//! - **Oversized outbound payload**: [`Error::FrameTooLarge`], nothing written
//!
//! Both end the session; there is no attempt to resynchronise the stream.

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Size of the length prefix in bytes
pub const HEADER_LEN: usize = 4;

/// Maximum payload size accepted by [`decode`] (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prefix `payload` with its big-endian length.
///
/// Payloads over [`MAX_FRAME_LEN`] are refused, since [`decode`] would
/// reject them on the other end.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    let too_large = || Error::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_LEN,
    };
    if payload.len() > MAX_FRAME_LEN {
        return Err(too_large());
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large())?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read exactly one frame from `reader` and return its payload.
///
/// Blocks until the whole payload has arrived. Never returns a partial
/// payload: if the stream ends first the result is
/// [`Error::ConnectionClosed`].
pub fn decode<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; HEADER_LEN];
    read_full(reader, &mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload)?;
    Ok(payload)
}

/// Encode `payload` and write it to `writer` in one call.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&encode(payload)?)?;
    writer.flush()?;
    Ok(())
}

/// `read_exact` that maps a short stream to `ConnectionClosed`.
///
/// `read_exact` already retries short reads and `Interrupted`.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}
