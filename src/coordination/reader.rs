//! Blocking, seekable reads over a buffer file that is still growing.
//!
//! A reader never relies on end-of-file from the OS: it compares its own
//! offset with the byte count published by the fetch task and only reports
//! EOF once the download is done and everything up to that count was read.

use std::fs::File;
use std::io::{self, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;

use super::coordinator::{FetchPhase, FetchState};
use super::registry::Lease;

/// Upper bound for a single read from the buffer file.
const READ_CHUNK: usize = 256 * 1024;

/// Per-caller cursor over a coordinator's buffer file.
///
/// Holds a [`Lease`], released when the reader is closed or dropped.  A
/// client disconnecting therefore only drops its reader; the shared fetch
/// keeps running.
#[derive(Debug)]
pub struct StreamReader {
    lease: Lease,
    events: watch::Receiver<FetchState>,
    offset: u64,
}

impl StreamReader {
    pub(super) fn new(lease: Lease) -> Self {
        let events = lease.coordinator().subscribe();
        Self {
            lease,
            events,
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read into `buf`, waiting for data if none is available yet.
    ///
    /// Returns `Ok(0)` at end of stream.  A failed download surfaces as an
    /// error once the bytes received before the failure are consumed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.next_chunk(buf.len()).await? {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    /// Read up to `max` bytes at the current offset.  `None` means EOF.
    pub async fn next_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let offset = self.offset;
        let state = match self
            .events
            .wait_for(|s| s.received > offset || s.phase.is_done())
            .await
        {
            Ok(state) => state.clone(),
            Err(e) => return Err(io::Error::other(e)),
        };

        if state.received > offset {
            let available = usize::try_from(state.received - offset).unwrap_or(usize::MAX);
            let len = available.min(max);
            let file = Arc::clone(self.lease.coordinator().buffer());
            let chunk = tokio::task::spawn_blocking(move || read_at(&file, offset, len))
                .await
                .map_err(io::Error::other)??;
            if chunk.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "buffer file is shorter than the published length",
                ));
            }
            self.offset += chunk.len() as u64;
            return Ok(Some(chunk));
        }

        match state.phase {
            FetchPhase::Failed(e) => Err(io::Error::other(e.to_string())),
            _ => Ok(None),
        }
    }

    /// Move the read offset.
    ///
    /// Seeking relative to the end needs the content length, which is only
    /// known once the mirror's metadata arrived.
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let length = self
                    .events
                    .borrow()
                    .metadata
                    .and_then(|m| m.content_length)
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "content length is not known yet",
                        )
                    })?;
                length.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid seek to a negative position")
        })?;
        self.offset = target;
        Ok(target)
    }

    /// Release the reader's reference on the coordinator.
    pub fn close(self) {}

    /// Turn the reader into a byte stream suitable for a response body.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::try_unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk(READ_CHUNK).await?;
            Ok(chunk.map(|chunk| (chunk, reader)))
        })
    }
}

fn read_at(file: &File, offset: u64, len: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; len];
    let n = file.read_at(&mut buf, offset)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}
