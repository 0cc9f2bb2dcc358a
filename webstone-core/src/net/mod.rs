//! Socket I/O helpers
//!
//! Bounded buffered reads driven by a completion policy, full-write
//! loops, readiness probes and timeout setup. Everything is built on
//! blocking `std::net` sockets with per-socket timeouts; a blocked
//! worker never affects its siblings.

pub mod acceptor;

pub use acceptor::{ClientConnection, ConnectionHandler, Server};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{is_connection_reset, is_timeout, Result};
use crate::util::find_sequence;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Decides when a buffered socket read is complete.
#[derive(Debug, Clone)]
pub enum ReadCompletion {
    /// Complete once the accumulated buffer contains `mark`; bytes
    /// after the mark are over-read and reported via
    /// [`SocketRead::mark_end`]. Used for HTTP header termination.
    UntilEndMark { mark: Vec<u8> },
    /// Complete when no further data arrives within `timeout`. Used for
    /// the administrative command channel.
    UntilIdle { timeout: Duration },
}

impl ReadCompletion {
    pub fn end_mark(mark: &[u8]) -> Self {
        ReadCompletion::UntilEndMark { mark: mark.to_vec() }
    }
}

/// Outcome of [`read_from_socket`].
#[derive(Debug, Default)]
pub struct SocketRead {
    /// Everything read, including any bytes past the end mark
    pub data: Vec<u8>,
    /// Byte offset just past the matched end mark, when one was found
    pub mark_end: Option<usize>,
    /// Peer closed (or reset, when tolerated) before completion
    pub connection_closed: bool,
}

/// Read from `stream` until the completion policy is satisfied.
///
/// With `fail_on_reset = false` a connection reset/abort marks the
/// stream closed instead of failing; a read timeout on an empty buffer
/// does the same (an idle keep-alive connection expiring is not an
/// error). Any other socket failure, or a timeout mid-message, is.
pub fn read_from_socket(
    stream: &mut TcpStream,
    check: &ReadCompletion,
    fail_on_reset: bool,
) -> Result<SocketRead> {
    let mut result = SocketRead::default();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    let saved_timeout = match check {
        ReadCompletion::UntilIdle { timeout } => {
            let saved = stream.read_timeout().ok().flatten();
            stream.set_read_timeout(Some(*timeout))?;
            Some(saved)
        }
        ReadCompletion::UntilEndMark { .. } => None,
    };

    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                result.connection_closed = true;
                break;
            }
            Ok(n) => {
                // re-scan from just before the chunk edge so a mark
                // split across reads is still found
                let scan_from = match check {
                    ReadCompletion::UntilEndMark { mark } => {
                        result.data.len().saturating_sub(mark.len() - 1)
                    }
                    ReadCompletion::UntilIdle { .. } => 0,
                };
                result.data.extend_from_slice(&buf[..n]);

                if let ReadCompletion::UntilEndMark { mark } = check {
                    if let Some(pos) = find_sequence(&result.data[scan_from..], mark) {
                        result.mark_end = Some(scan_from + pos + mark.len());
                        break;
                    }
                }
            }
            Err(e) if is_timeout(&e) => {
                match check {
                    // quiet period elapsed: the message is complete
                    ReadCompletion::UntilIdle { .. } => break,
                    ReadCompletion::UntilEndMark { .. } => {
                        if result.data.is_empty() {
                            result.connection_closed = true;
                            break;
                        }
                        restore_timeout(stream, saved_timeout);
                        return Err(e.into());
                    }
                }
            }
            Err(e) if is_connection_reset(&e) && !fail_on_reset => {
                result.connection_closed = true;
                break;
            }
            Err(e) => {
                restore_timeout(stream, saved_timeout);
                return Err(e.into());
            }
        }
    }

    restore_timeout(stream, saved_timeout);
    Ok(result)
}

fn restore_timeout(stream: &TcpStream, saved: Option<Option<Duration>>) {
    if let Some(timeout) = saved {
        let _ = stream.set_read_timeout(timeout);
    }
}

/// Write the whole buffer, retrying partial sends.
pub fn write_to_socket(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    stream.write_all(data)?;
    Ok(())
}

/// Probe read-readiness: true when at least one byte can be read within
/// `timeout`. A cleanly closed peer reports false.
pub fn check_readable(stream: &TcpStream, timeout: Duration) -> bool {
    let saved = stream.read_timeout().ok().flatten();
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let readable = matches!(stream.peek(&mut probe), Ok(n) if n > 0);
    let _ = stream.set_read_timeout(saved);
    readable
}

/// Probe write-readiness: the stream is considered writable while no
/// error is pending on the socket.
pub fn check_writable(stream: &TcpStream) -> bool {
    matches!(stream.take_error(), Ok(None))
}

/// Apply the configured per-socket timeouts.
pub fn apply_timeouts(stream: &TcpStream, read: Duration, write: Duration) -> Result<()> {
    stream.set_read_timeout(Some(read))?;
    stream.set_write_timeout(Some(write))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::{TcpListener, TcpStream};

    /// Connected loopback socket pair for exercising the real stream
    /// types in unit tests.
    pub fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }
}
