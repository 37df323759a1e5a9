//! The byte-stream link abstraction
//!
//! Real tty drivers live outside this crate; in-tree there is a TCP client port (the
//! `socket://host:port` interface convention) and an in-memory pipe pair for tests. Both sides of
//! the transport share one port: reads happen on a clone from the receive thread while writes go
//! through the original.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use eyre::WrapErr;

/// How long a read blocks before giving the caller a chance to re-check for shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The result of one read attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed at the start of the buffer
    Data(usize),
    /// Nothing arrived within the poll interval; try again
    TimedOut,
    /// The link is gone; no further data will ever arrive
    Closed,
}

/// A duplex byte-stream link
pub trait SerialPort: Send {
    fn name(&self) -> &str;

    fn read(&mut self, buffer: &mut [u8]) -> eyre::Result<ReadOutcome>;

    fn write_all(&mut self, data: &[u8]) -> eyre::Result<()>;

    /// A second handle onto the same link, for concurrent read and write
    fn try_clone(&self) -> eyre::Result<Box<dyn SerialPort>>;

    /// Reconfigure the link bit rate where the hardware supports it; zero keeps the current rate
    fn set_baud_rate(&mut self, baud_rate: u32) -> eyre::Result<()>;
}

/// A serial link tunneled over a TCP connection (`socket://host:port`)
pub struct TcpPort {
    name: String,
    stream: TcpStream,
}

impl TcpPort {
    /// Connect to a `socket://host:port` interface name
    pub fn connect(iface: &str) -> eyre::Result<TcpPort> {
        let Some(address) = iface.strip_prefix("socket://") else {
            eyre::bail!("Not a socket:// interface name: {iface:?}");
        };
        let stream = TcpStream::connect(address)
            .wrap_err(format!("Failed to connect to {address}"))?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(TcpPort {
            name: iface.to_string(),
            stream,
        })
    }
}

impl SerialPort for TcpPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buffer: &mut [u8]) -> eyre::Result<ReadOutcome> {
        match self.stream.read(buffer) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(size) => Ok(ReadOutcome::Data(size)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(ReadOutcome::TimedOut)
            }
            Err(e) => Err(e).wrap_err("TCP read failed"),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> eyre::Result<()> {
        self.stream.write_all(data).wrap_err("TCP write failed")
    }

    fn try_clone(&self) -> eyre::Result<Box<dyn SerialPort>> {
        Ok(Box::new(TcpPort {
            name: self.name.clone(),
            stream: self.stream.try_clone().wrap_err("Failed to clone the TCP stream")?,
        }))
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> eyre::Result<()> {
        // A TCP tunnel has no bit rate of its own
        tracing::debug!("{}: ignoring baud rate {baud_rate}", self.name);
        Ok(())
    }
}

#[derive(Default)]
struct PipeChannel {
    state: Mutex<(VecDeque<u8>, bool)>,
    available: Condvar,
}

impl PipeChannel {
    fn write(&self, data: &[u8]) -> eyre::Result<()> {
        let mut state = self.state.lock().expect("poisoned");
        if state.1 {
            eyre::bail!("The pipe is closed");
        }
        state.0.extend(data);
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    fn read(&self, buffer: &mut [u8]) -> ReadOutcome {
        let mut state = self.state.lock().expect("poisoned");
        if state.0.is_empty() {
            if state.1 {
                return ReadOutcome::Closed;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, READ_TIMEOUT)
                .expect("poisoned");
            state = guard;
        }
        if state.0.is_empty() {
            if state.1 {
                return ReadOutcome::Closed;
            }
            return ReadOutcome::TimedOut;
        }
        let count = buffer.len().min(state.0.len());
        for slot in buffer.iter_mut().take(count) {
            *slot = state.0.pop_front().expect("checked non-empty");
        }
        ReadOutcome::Data(count)
    }

    fn close(&self) {
        self.state.lock().expect("poisoned").1 = true;
        self.available.notify_all();
    }
}

/// One end of an in-memory duplex byte stream
pub struct PipePort {
    name: String,
    rx: Arc<PipeChannel>,
    tx: Arc<PipeChannel>,
}

impl PipePort {
    /// Simulate unplugging the link: the peer observes end-of-stream
    pub fn disconnect(&self) {
        self.tx.close();
        self.rx.close();
    }
}

/// A connected pair of in-memory ports
pub fn pipe_pair() -> (PipePort, PipePort) {
    let a_to_b = Arc::new(PipeChannel::default());
    let b_to_a = Arc::new(PipeChannel::default());
    (
        PipePort {
            name: "pipe:a".into(),
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
        },
        PipePort {
            name: "pipe:b".into(),
            rx: b_to_a,
            tx: a_to_b,
        },
    )
}

impl SerialPort for PipePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buffer: &mut [u8]) -> eyre::Result<ReadOutcome> {
        Ok(self.rx.read(buffer))
    }

    fn write_all(&mut self, data: &[u8]) -> eyre::Result<()> {
        self.tx.write(data)
    }

    fn try_clone(&self) -> eyre::Result<Box<dyn SerialPort>> {
        Ok(Box::new(PipePort {
            name: self.name.clone(),
            rx: Arc::clone(&self.rx),
            tx: Arc::clone(&self.tx),
        }))
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> eyre::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_pipe_round_trip() {
        let (mut a, mut b) = pipe_pair();
        a.write_all(b"hello").unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(b.read(&mut buffer).unwrap(), ReadOutcome::Data(5));
        assert_eq!(&buffer[..5], b"hello");
        assert_eq!(b.read(&mut buffer).unwrap(), ReadOutcome::TimedOut);
    }

    #[test]
    fn test_pipe_disconnect() {
        let (mut a, b) = pipe_pair();
        b.disconnect();
        let mut buffer = [0u8; 16];
        assert_eq!(a.read(&mut buffer).unwrap(), ReadOutcome::Closed);
        assert!(a.write_all(b"x").is_err());
    }

    #[test]
    fn test_pipe_clone_shares_the_link() {
        let (a, mut b) = pipe_pair();
        let mut a2 = a.try_clone().unwrap();
        a2.write_all(b"via clone").unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(b.read(&mut buffer).unwrap(), ReadOutcome::Data(9));
    }
}
