//! In-memory port and simulated STK500v1 bootloader for unit tests.

use crate::error::{Error, Result};
use crate::port::{Port, PortOpener};
use crate::protocol::stk500::{CRC_EOP, PARM_SW_MAJOR, PARM_SW_MINOR, cmd, resp};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct LogState {
    writes: Vec<Vec<u8>>,
    signals: Vec<(bool, bool)>,
    opens: Vec<u32>,
    closes: usize,
}

/// Shared record of everything done to mock ports.
#[derive(Debug, Clone, Default)]
pub(crate) struct PortLog(Arc<Mutex<LogState>>);

impl PortLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub(crate) fn signals(&self) -> Vec<(bool, bool)> {
        self.lock().signals.clone()
    }

    pub(crate) fn opens(&self) -> Vec<u32> {
        self.lock().opens.clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Number of times a line went active from both released.
    pub(crate) fn reset_pulses(&self) -> usize {
        let mut previous = (false, false);
        let mut pulses = 0;
        for &level in &self.lock().signals {
            if previous == (false, false) && level != (false, false) {
                pulses += 1;
            }
            previous = level;
        }
        pulses
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

pub(crate) struct MockPort {
    log: PortLog,
    input: VecDeque<u8>,
    responder: Responder,
    timeout: Duration,
    baud: u32,
    closed: bool,
    read_chunk: Option<usize>,
}

impl MockPort {
    /// A port whose far end never says anything.
    pub(crate) fn silent(log: &PortLog) -> Self {
        Self::with_responder(log, |_| Vec::new())
    }

    /// A port that answers every write with `responder(written)`.
    pub(crate) fn with_responder<F>(log: &PortLog, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            log: log.clone(),
            input: VecDeque::new(),
            responder: Box::new(responder),
            timeout: Duration::from_millis(10),
            baud: 115200,
            closed: false,
            read_chunk: None,
        }
    }

    pub(crate) fn at_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Hand out at most `n` bytes per read.
    pub(crate) fn with_read_chunk(mut self, n: usize) -> Self {
        self.read_chunk = Some(n);
        self
    }

    pub(crate) fn push_input(&mut self, data: &[u8]) {
        self.input.extend(data);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            thread::sleep(self.timeout.min(Duration::from_millis(2)));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let limit = self.read_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(self.input.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.lock().writes.push(buf.to_vec());
        let reply = (self.responder)(buf);
        self.input.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.input.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "/dev/mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut log = self.log.lock();
        let rts = log.signals.last().map_or(false, |s| s.1);
        log.signals.push((level, rts));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        let mut log = self.log.lock();
        let dtr = log.signals.last().map_or(false, |s| s.0);
        log.signals.push((dtr, level));
        Ok(())
    }

    fn set_signals(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.log.lock().signals.push((dtr, rts));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        assert!(!self.closed, "mock port closed twice");
        self.closed = true;
        self.log.lock().closes += 1;
        Ok(())
    }
}

/// State of the simulated bootloader.
#[derive(Debug)]
pub(crate) struct SimState {
    /// Answer from this `GET_SYNC` on (1-based); `None` never answers.
    pub(crate) sync_on: Option<usize>,
    /// Only answer on ports opened at this baud rate.
    pub(crate) baud: Option<u32>,
    /// Stay silent until the board has been reset this many times.
    pub(crate) resets_needed: usize,
    /// Reset pulses seen on the control lines so far.
    pub(crate) resets: usize,
    /// Bytes sent in front of the sync acknowledgement.
    pub(crate) sync_prefix: Vec<u8>,
    /// Answer `PROG_PAGE` for this page index with `INSYNC FAILED`.
    pub(crate) fail_page: Option<usize>,
    pub(crate) signature: [u8; 3],
    pub(crate) version: (u8, u8),

    pub(crate) get_sync_count: usize,
    pub(crate) synced: bool,
    pub(crate) entered_progmode: bool,
    pub(crate) left_progmode: bool,
    address: u16,
    /// `(word address, page bytes, memory type)` for every `PROG_PAGE`.
    pub(crate) pages: Vec<(u16, Vec<u8>, u8)>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            sync_on: Some(1),
            baud: None,
            resets_needed: 0,
            resets: 0,
            sync_prefix: Vec::new(),
            fail_page: None,
            signature: [0x1E, 0x95, 0x0F],
            version: (8, 0),
            get_sync_count: 0,
            synced: false,
            entered_progmode: false,
            left_progmode: false,
            address: 0,
            pages: Vec::new(),
        }
    }
}

/// A scripted optiboot-like bootloader.
#[derive(Debug, Clone, Default)]
pub(crate) struct SimBootloader(Arc<Mutex<SimState>>);

impl SimBootloader {
    pub(crate) fn answering_on(sync_on: usize) -> Self {
        let sim = Self::default();
        sim.state().sync_on = Some(sync_on);
        sim
    }

    pub(crate) fn never_answering() -> Self {
        let sim = Self::default();
        sim.state().sync_on = None;
        sim
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    /// Responder for a port opened at `baud`.
    pub(crate) fn responder(&self, baud: u32) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
        let sim = self.clone();
        move |frame| sim.handle(baud, frame)
    }

    fn handle(&self, baud: u32, frame: &[u8]) -> Vec<u8> {
        let mut s = self.state();
        if s.baud.is_some_and(|b| b != baud) || frame.last() != Some(&CRC_EOP) {
            return Vec::new();
        }

        let ack = vec![resp::INSYNC, resp::OK];
        match frame[0] {
            cmd::GET_SYNC => {
                s.get_sync_count += 1;
                if s.resets >= s.resets_needed
                    && s.sync_on.is_some_and(|n| s.get_sync_count >= n)
                {
                    s.synced = true;
                    let mut out = s.sync_prefix.clone();
                    out.extend_from_slice(&ack);
                    out
                } else {
                    Vec::new()
                }
            },
            _ if !s.synced => Vec::new(),
            cmd::ENTER_PROGMODE => {
                s.entered_progmode = true;
                ack
            },
            cmd::LEAVE_PROGMODE => {
                s.left_progmode = true;
                ack
            },
            cmd::LOAD_ADDRESS => {
                s.address = u16::from_le_bytes([frame[1], frame[2]]);
                ack
            },
            cmd::PROG_PAGE => {
                let len = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
                let memtype = frame[3];
                let data = frame[4..4 + len].to_vec();
                let address = s.address;
                s.pages.push((address, data, memtype));
                if s.fail_page == Some(s.pages.len() - 1) {
                    vec![resp::INSYNC, resp::FAILED]
                } else {
                    ack
                }
            },
            cmd::GET_PARAMETER => {
                let value = match frame[1] {
                    PARM_SW_MAJOR => s.version.0,
                    PARM_SW_MINOR => s.version.1,
                    _ => 0,
                };
                vec![resp::INSYNC, value, resp::OK]
            },
            cmd::READ_SIGN => {
                let sig = s.signature;
                vec![resp::INSYNC, sig[0], sig[1], sig[2], resp::OK]
            },
            _ => vec![resp::INSYNC, resp::FAILED],
        }
    }
}

/// Opens mock ports wired to a simulated bootloader.
pub(crate) struct MockOpener {
    pub(crate) log: PortLog,
    pub(crate) sim: SimBootloader,
    pub(crate) busy: bool,
}

impl MockOpener {
    pub(crate) fn new(sim: &SimBootloader) -> Self {
        Self {
            log: PortLog::default(),
            sim: sim.clone(),
            busy: false,
        }
    }
}

impl PortOpener for MockOpener {
    type Port = MockPort;

    fn port_name(&self) -> &str {
        "/dev/mock"
    }

    fn open(&mut self, baud_rate: u32) -> Result<MockPort> {
        if self.busy {
            return Err(Error::PortUnavailable {
                port: "/dev/mock".into(),
                reason: "Device or resource busy".into(),
            });
        }
        self.log.0.lock().unwrap().opens.push(baud_rate);
        let log = self.log.clone();
        let sim = self.sim.clone();
        let mut respond = self.sim.responder(baud_rate);
        let responder = move |frame: &[u8]| {
            let resets = log.reset_pulses();
            sim.state().resets = resets;
            respond(frame)
        };
        Ok(MockPort::with_responder(&self.log, responder).at_baud(baud_rate))
    }
}
