use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::{MachineError, MachineResult};
use crate::interrupt::Machine;
use crate::pending::InterruptKind;

/// Where console input comes from. `bytes_available` must never block.
pub trait ByteSource: Send {
    /// Number of bytes that can be read immediately.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Read one byte. Only called after `bytes_available` reported at least
    /// one.
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// Where console output goes.
pub trait ByteSink: Send {
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
}

/// Shared in-memory input, for tests and embedding. Bytes can be appended
/// while the simulation runs.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    bytes: Arc<Mutex<VecDeque<u8>>>,
}

impl ScriptedSource {
    pub fn new(initial: &[u8]) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(initial.iter().copied().collect())),
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        self.bytes.lock().unwrap().extend(bytes.iter().copied());
    }
}

impl ByteSource for ScriptedSource {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes.lock().unwrap().len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.bytes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "source drained"))
    }
}

/// Shared in-memory output, for tests and embedding.
#[derive(Clone, Default)]
pub struct SharedSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }
}

impl ByteSink for SharedSink {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.bytes.lock().unwrap().push(byte);
        Ok(())
    }
}

/// Standard input as a console keyboard.
///
/// Host stdin cannot be polled portably, so a background thread reads it
/// byte-wise into a channel and `bytes_available` drains the channel into a
/// local buffer. End of input shows up as zero available forever.
pub struct StdinSource {
    rx: Receiver<u8>,
    buffered: VecDeque<u8>,
}

impl StdinSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("console-stdin".into())
            .spawn(move || {
                let stdin = io::stdin();
                for byte in stdin.lock().bytes() {
                    let Ok(byte) = byte else { break };
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
            })
            .expect("spawn stdin reader");
        Self {
            rx,
            buffered: VecDeque::new(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSource for StdinSource {
    fn bytes_available(&mut self) -> io::Result<usize> {
        loop {
            match self.rx.try_recv() {
                Ok(byte) => self.buffered.push_back(byte),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(self.buffered.len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.buffered
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no byte buffered"))
    }
}

/// Standard output as a console display.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ByteSink for StdoutSink {
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&[byte])?;
        stdout.flush()
    }
}

struct ConsoleState {
    source: Box<dyn ByteSource>,
    sink: Box<dyn ByteSink>,
    /// Is a put_char in flight? Only one character may be written at a time.
    put_busy: bool,
    /// Has an incoming character been buffered and not yet collected?
    char_avail: bool,
    incoming: u8,
}

/// Asynchronous serial console: a keyboard polled once per character time and
/// a display that completes one character time after each write.
///
/// `read_handler` runs when a character arrives from the keyboard;
/// `write_handler` runs when an output character has departed and the next
/// one may be written. Both run with interrupts disabled.
pub struct Console {
    machine: Arc<Machine>,
    read_handler: Box<dyn Fn() + Send + Sync>,
    write_handler: Box<dyn Fn() + Send + Sync>,
    state: Mutex<ConsoleState>,
}

impl Console {
    /// Creates the device and starts polling for input.
    pub fn new(
        machine: Arc<Machine>,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
        read_handler: impl Fn() + Send + Sync + 'static,
        write_handler: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let console = Arc::new(Self {
            machine,
            read_handler: Box::new(read_handler),
            write_handler: Box::new(write_handler),
            state: Mutex::new(ConsoleState {
                source,
                sink,
                put_busy: false,
                char_avail: false,
                incoming: 0,
            }),
        });
        console.schedule_poll();
        console
    }

    /// Console attached to host stdin/stdout.
    pub fn stdio(
        machine: Arc<Machine>,
        read_handler: impl Fn() + Send + Sync + 'static,
        write_handler: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::new(
            machine,
            Box::new(StdinSource::new()),
            Box::new(StdoutSink),
            read_handler,
            write_handler,
        )
    }

    fn schedule_poll(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.machine.schedule(
            self.machine.params().console_time,
            InterruptKind::ConsoleRead,
            move || {
                if let Some(console) = weak.upgrade() {
                    console.poll();
                }
            },
        );
    }

    /// Periodic keyboard poll: pull in one byte if the input buffer is free
    /// and the source has something to offer.
    fn poll(self: &Arc<Self>) {
        // Keep the poll stream alive first, whatever else happens.
        self.schedule_poll();

        {
            let mut st = self.state.lock().unwrap();
            if st.char_avail {
                return;
            }
            let available = match st.source.bytes_available() {
                Ok(n) => n,
                Err(err) => {
                    warn!(%err, "console input poll failed");
                    return;
                }
            };
            if available == 0 {
                return;
            }
            match st.source.read_byte() {
                Ok(byte) => {
                    st.incoming = byte;
                    st.char_avail = true;
                }
                Err(err) => {
                    warn!(%err, "console input read failed");
                    return;
                }
            }
        }

        self.machine
            .with_stats(|stats| stats.num_console_chars_read += 1);
        (self.read_handler)();
    }

    /// Collects the buffered input character, freeing the buffer for the next
    /// poll.
    pub fn get_char(&self) -> MachineResult<u8> {
        let mut st = self.state.lock().unwrap();
        if !st.char_avail {
            return Err(MachineError::NoInputBuffered);
        }
        st.char_avail = false;
        Ok(st.incoming)
    }

    /// Emits one character to the display and schedules its completion
    /// interrupt. Fails without side effects while a previous write is still
    /// in flight.
    pub fn put_char(self: &Arc<Self>, byte: u8) -> MachineResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            if st.put_busy {
                return Err(MachineError::ConsoleBusy);
            }
            st.sink.write_byte(byte)?;
            st.put_busy = true;
        }

        debug!(byte, "console write");
        let weak = Arc::downgrade(self);
        self.machine.schedule(
            self.machine.params().console_time,
            InterruptKind::ConsoleWrite,
            move || {
                if let Some(console) = weak.upgrade() {
                    console.write_done();
                }
            },
        );
        Ok(())
    }

    fn write_done(&self) {
        self.state.lock().unwrap().put_busy = false;
        self.machine
            .with_stats(|stats| stats.num_console_chars_written += 1);
        (self.write_handler)();
    }
}
