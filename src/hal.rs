// Hardware adapter: byte-stream transports and delays
//
// The control core only sees these traits. A node on real hardware uses
// `SerialTransport`; tests and simulations use `MemoryTransport`.

use parking_lot::Mutex;
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Non-blocking byte stream to one physical serial link
pub trait Transport: Send {
    /// Number of received bytes that can be read without blocking
    fn available(&mut self) -> io::Result<usize>;

    /// Read one received byte. Only called when `available()` reported data.
    fn read_byte(&mut self) -> io::Result<u8>;

    fn write_byte(&mut self, byte: u8) -> io::Result<()>;

    /// Write a whole frame
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &byte in bytes {
            self.write_byte(byte)?;
        }
        Ok(())
    }
}

/// Bounded wait primitive used between gait phases and liveness rounds
pub trait Delay: Send {
    fn pause(&mut self, duration: Duration);
}

/// Sleeps the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Returns immediately (simulation and tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn pause(&mut self, _duration: Duration) {}
}

/// Serial port transport
///
/// The OS driver buffers incoming bytes; `available()` asks it how many are
/// waiting, so reads never block.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port with the given baudrate
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn available(&mut self) -> io::Result<usize> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::other)?;
        Ok(waiting as usize)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

/// Produces the bytes a peer sends back after receiving a frame
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Shared view of a `MemoryTransport`, kept by the test or simulation
#[derive(Clone, Default)]
pub struct MemoryHandle {
    inbound: Arc<Mutex<VecDeque<u8>>>,
    outbound: Arc<Mutex<Vec<u8>>>,
    polls: Arc<AtomicUsize>,
}

impl MemoryHandle {
    /// Queue bytes as if the peer had sent them
    pub fn inject(&self, bytes: &[u8]) {
        self.inbound.lock().extend(bytes.iter().copied());
    }

    /// Drain everything written to the transport so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock())
    }

    /// Bytes received but not yet read by the link
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }

    /// How many times the link asked for available bytes
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

/// In-memory transport with an optional scripted peer
pub struct MemoryTransport {
    handle: MemoryHandle,
    responder: Option<Responder>,
    echo: bool,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryHandle) {
        let handle = MemoryHandle::default();
        let transport = Self {
            handle: handle.clone(),
            responder: None,
            echo: false,
        };
        (transport, handle)
    }

    /// Transport whose peer answers every written frame through `responder`
    pub fn with_responder<F>(responder: F) -> (Self, MemoryHandle)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let (mut transport, handle) = Self::new();
        transport.responder = Some(Box::new(responder));
        (transport, handle)
    }

    /// Reflect written bytes back into the receive side, like a half-duplex
    /// single-wire bus does
    pub fn echoing(mut self) -> Self {
        self.echo = true;
        self
    }
}

impl Transport for MemoryTransport {
    fn available(&mut self) -> io::Result<usize> {
        self.handle.polls.fetch_add(1, Ordering::Relaxed);
        Ok(self.handle.inbound.lock().len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.handle
            .inbound
            .lock()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no byte available"))
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.handle.outbound.lock().push(byte);
        if self.echo {
            self.handle.inbound.lock().push_back(byte);
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.handle.outbound.lock().extend_from_slice(bytes);
        if self.echo {
            self.handle.inbound.lock().extend(bytes.iter().copied());
        }
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(bytes) {
                self.handle.inbound.lock().extend(reply);
            }
        }
        Ok(())
    }
}
