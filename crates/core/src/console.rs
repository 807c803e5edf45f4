//! Console plumbing shared by every driver: two unidirectional pipes whose
//! host ends are nonblocking and driven by the tokio reactor.

use std::future::Future;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::Result;

pub fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn poll_read_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<std::io::Result<()>> {
    loop {
        let mut guard = match fd.poll_read_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        let unfilled = buf.initialize_unfilled();
        match nix::unistd::read(fd.get_ref().as_raw_fd(), unfilled) {
            Ok(n) => {
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            Err(e) => return Poll::Ready(Err(e.into())),
        }
    }
}

fn poll_write_fd(
    fd: &AsyncFd<OwnedFd>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<std::io::Result<usize>> {
    loop {
        let mut guard = match fd.poll_write_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };

        match nix::unistd::write(fd.get_ref(), buf) {
            Ok(n) => return Poll::Ready(Ok(n)),
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
                continue;
            }
            Err(e) => return Poll::Ready(Err(e.into())),
        }
    }
}

/// One host-side pipe end. Closing drops the descriptor once no in-flight
/// poll still holds it.
#[derive(Debug)]
struct PipeEnd(Mutex<Option<Arc<AsyncFd<OwnedFd>>>>);

impl PipeEnd {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        Ok(Self(Mutex::new(Some(Arc::new(AsyncFd::new(fd)?)))))
    }

    fn get(&self) -> Option<Arc<AsyncFd<OwnedFd>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn close(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Guest-facing pipe ends handed to the platform VM.
#[derive(Debug)]
pub struct GuestConsole {
    /// Read end of the input pipe; the guest's serial port reads from it.
    pub input: OwnedFd,
    /// Write end of the output pipe; the guest's serial port writes to it.
    pub output: OwnedFd,
}

/// Host-facing pipe ends owned by a driver between Create and teardown.
#[derive(Debug)]
pub struct HostConsole {
    input: Arc<PipeEnd>,
    output: Arc<PipeEnd>,
    closed: CancellationToken,
}

/// Allocates the input and output pipes for one VM.
///
/// Must be called from within a tokio runtime.
pub fn console_pipes() -> Result<(HostConsole, GuestConsole)> {
    let (guest_input, host_input) = nix::unistd::pipe()?;
    let (host_output, guest_output) = nix::unistd::pipe()?;
    set_nonblocking(&host_input)?;
    set_nonblocking(&host_output)?;

    let host = HostConsole {
        input: Arc::new(PipeEnd::new(host_input)?),
        output: Arc::new(PipeEnd::new(host_output)?),
        closed: CancellationToken::new(),
    };
    let guest = GuestConsole {
        input: guest_input,
        output: guest_output,
    };
    Ok((host, guest))
}

impl HostConsole {
    pub fn handles(&self) -> Console {
        Console {
            input: ConsoleWriter {
                end: self.input.clone(),
                closed: Box::pin(self.closed.clone().cancelled_owned()),
            },
            output: ConsoleReader {
                end: self.output.clone(),
                closed: Box::pin(self.closed.clone().cancelled_owned()),
            },
        }
    }

    /// Closes both host ends and wakes any task blocked on them. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
        self.input.close();
        self.output.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for HostConsole {
    fn drop(&mut self) {
        self.close();
    }
}

/// The console as seen by callers: write to `input`, read from `output`.
pub struct Console {
    pub input: ConsoleWriter,
    pub output: ConsoleReader,
}

/// Write end of the console input pipe.
pub struct ConsoleWriter {
    end: Arc<PipeEnd>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

/// Read end of the console output pipe. Yields EOF once the console is closed.
pub struct ConsoleReader {
    end: Arc<PipeEnd>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "console closed")
}

impl AsyncRead for ConsoleReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        match this.end.get() {
            Some(fd) => poll_read_fd(&fd, cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ConsoleWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(broken_pipe()));
        }
        match this.end.get() {
            Some(fd) => poll_write_fd(&fd, cx, buf),
            None => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
