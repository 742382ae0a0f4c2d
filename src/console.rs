// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # Serial console bridge
//!
//! The guest's virtio console is attached to two OS pipes. Two forwarding
//! threads connect the host ends to the process's standard streams:
//!
//! ```text
//!  stdin  ──console-in──▶  input pipe  ──▶ guest
//!  stdout ◀─console-out──  output pipe ◀── guest
//! ```
//!
//! Each thread reads, forwards, and reads again until end-of-stream. There
//! is no flow control beyond what the pipes themselves provide.

use std::{
    fs::File,
    io::{self, ErrorKind, Read, Write},
    os::fd::{FromRawFd, OwnedFd},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};

use log::{debug, trace, warn};

use crate::{hypervisor::GuestConsole, vmcore::VmResult};

const CHUNK_SIZE: usize = 4096;

/// Host ends of the console pipes
#[derive(Debug)]
pub struct HostConsole {
    /// Bytes written here arrive at the guest's console input
    pub to_guest: File,
    /// Bytes the guest writes to its console arrive here
    pub from_guest: File,
}

/// Both console pipes, before they are split between host and guest
#[derive(Debug)]
pub struct ConsolePipes {
    pub host: HostConsole,
    pub guest: GuestConsole,
}

impl ConsolePipes {
    pub fn new() -> VmResult<Self> {
        let (guest_input, to_guest) = pipe()?;
        let (from_guest, guest_output) = pipe()?;

        Ok(Self {
            host: HostConsole {
                to_guest: File::from(to_guest),
                from_guest: File::from(from_guest),
            },
            guest: GuestConsole {
                input: guest_input,
                output: guest_output,
            },
        })
    }
}

/// Create a pipe, returning `(read_end, write_end)`
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    for fd in fds {
        // SAFETY: fd was just returned by pipe(2) and is owned by us.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: closing the descriptors we own before bailing out.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }

    // SAFETY: both descriptors are open and exclusively owned from here on.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Direction of a forwarding loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host stdin to guest
    Input,
    /// Guest to host stdout
    Output,
}

impl Direction {
    fn thread_name(self) -> &'static str {
        match self {
            Direction::Input => "console-in",
            Direction::Output => "console-out",
        }
    }
}

/// Copy `reader` into `writer` until end-of-stream, flushing after every
/// chunk. Returns the number of bytes forwarded.
pub fn forward<R: Read, W: Write>(mut reader: R, mut writer: W) -> io::Result<u64> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n])?;
        writer.flush()?;
        total += n as u64;
        trace!("Forwarded {} bytes", n);
    }
}

/// The two running forwarding threads
pub struct ConsoleForwarder {
    done: Receiver<(Direction, io::Result<u64>)>,
    output_finished: bool,
}

impl ConsoleForwarder {
    /// Start forwarding `host_in` to the guest and the guest to `host_out`
    pub fn spawn<R, W>(host_in: R, console: HostConsole, host_out: W) -> VmResult<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, done) = mpsc::channel();

        Self::spawn_pump(Direction::Input, host_in, console.to_guest, tx.clone())?;
        Self::spawn_pump(Direction::Output, console.from_guest, host_out, tx)?;

        Ok(Self {
            done,
            output_finished: false,
        })
    }

    fn spawn_pump<R, W>(
        direction: Direction,
        reader: R,
        writer: W,
        done: mpsc::Sender<(Direction, io::Result<u64>)>,
    ) -> VmResult<()>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        thread::Builder::new()
            .name(direction.thread_name().to_string())
            .spawn(move || {
                debug!("{} started", direction.thread_name());
                let result = forward(reader, writer);
                match &result {
                    Ok(total) => debug!(
                        "{} reached end of stream after {} bytes",
                        direction.thread_name(),
                        total
                    ),
                    Err(e) => warn!("{} stopped: {}", direction.thread_name(), e),
                }
                let _ = done.send((direction, result));
            })?;
        Ok(())
    }

    /// Wait up to `timeout` for the guest-to-host loop to drain.
    ///
    /// The input loop is not waited for: it may be parked in a read on the
    /// process's stdin, which cannot be interrupted.
    pub fn wait_output(&mut self, timeout: Duration) -> bool {
        while !self.output_finished {
            match self.done.recv_timeout(timeout) {
                Ok((Direction::Output, _)) => self.output_finished = true,
                Ok((Direction::Input, _)) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Console output still open after {:?}", timeout);
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{io::Cursor, sync::Arc};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Reader that yields `Interrupted` once before every chunk
    struct Flaky {
        inner: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(ErrorKind::Interrupted.into());
            }
            let max = buf.len().min(7);
            self.inner.read(&mut buf[..max])
        }
    }

    #[test]
    fn forward_preserves_bytes_and_order() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let capture = Capture::default();

        let n = forward(Cursor::new(data.clone()), capture.clone()).unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(*capture.0.lock(), data);
    }

    #[test]
    fn forward_retries_interrupted_reads() {
        let data = b"login: root\npassword:".to_vec();
        let capture = Capture::default();
        let reader = Flaky {
            inner: Cursor::new(data.clone()),
            interrupt: false,
        };

        forward(reader, capture.clone()).unwrap();
        assert_eq!(*capture.0.lock(), data);
    }

    #[test]
    fn pipes_carry_bytes_between_host_and_guest() {
        let ConsolePipes { host, guest } = ConsolePipes::new().unwrap();
        let mut guest_in = File::from(guest.input);
        let mut guest_out = File::from(guest.output);
        let HostConsole {
            mut to_guest,
            mut from_guest,
        } = host;

        to_guest.write_all(b"uname -a\n").unwrap();
        drop(to_guest);
        let mut received = Vec::new();
        guest_in.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"uname -a\n");

        guest_out.write_all(b"Linux lima 5.10\n").unwrap();
        drop(guest_out);
        let mut printed = Vec::new();
        from_guest.read_to_end(&mut printed).unwrap();
        assert_eq!(printed, b"Linux lima 5.10\n");
    }

    #[test]
    fn forwarder_drains_guest_output() {
        let ConsolePipes { host, guest } = ConsolePipes::new().unwrap();
        let capture = Capture::default();
        let mut forwarder =
            ConsoleForwarder::spawn(Cursor::new(b"ls\n".to_vec()), host, capture.clone()).unwrap();

        let mut guest_in = File::from(guest.input);
        let mut typed = Vec::new();
        guest_in.read_to_end(&mut typed).unwrap();
        assert_eq!(typed, b"ls\n");

        let mut guest_out = File::from(guest.output);
        guest_out.write_all(b"bin etc home\n").unwrap();
        drop(guest_out);

        assert!(forwarder.wait_output(Duration::from_secs(5)));
        assert_eq!(*capture.0.lock(), b"bin etc home\n");
    }
}
