//! Test doubles for the native port and the clock.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::{Parity, SerialConfiguration};
use crate::monitor::Clock;
use crate::port::{ComErrors, NativePort, RawRead};

/// A [Clock] that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub(crate) struct ManualClock(Rc<Cell<Instant>>);

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    pub(crate) fn advance_ms(&self, ms: u64) {
        self.0.set(self.0.get() + Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

/// A scripted [NativePort] that records everything done to it.
#[derive(Debug, Default)]
pub(crate) struct MockPort {
    pub(crate) accept_open: bool,
    pub(crate) open: bool,
    pub(crate) opened: Vec<(String, SerialConfiguration)>,
    pub(crate) closes: usize,
    pub(crate) disposals: usize,

    /// Results handed out by read(), in order. Once empty, reads time out.
    pub(crate) reads: VecDeque<RawRead>,
    pub(crate) read_calls: usize,
    pub(crate) last_value: u8,

    /// How many bytes each write() call accepts, in order. Once empty,
    /// writes accept everything.
    pub(crate) accepts: VecDeque<usize>,
    pub(crate) write_calls: usize,
    pub(crate) written: Vec<u8>,

    /// How many bytes write_with_parity() claims to accept.
    pub(crate) parity_accepts: usize,
    pub(crate) parity_writes: Vec<(u8, Parity)>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            accept_open: true,
            parity_accepts: 1,
            ..Default::default()
        }
    }

    pub(crate) fn with_reads<I>(reads: I) -> Self
    where
        I: IntoIterator<Item = RawRead>,
    {
        Self {
            reads: reads.into_iter().collect(),
            ..Self::new()
        }
    }

    pub(crate) fn with_accepts<I>(accepts: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        Self {
            accepts: accepts.into_iter().collect(),
            ..Self::new()
        }
    }
}

impl NativePort for MockPort {
    fn open(&mut self, name: &str, config: &SerialConfiguration) -> bool {
        self.opened.push((name.to_owned(), config.clone()));
        self.open = self.accept_open;
        self.open
    }

    fn close(&mut self) {
        self.closes += 1;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self) -> RawRead {
        self.read_calls += 1;
        match self.reads.pop_front() {
            Some(read) => {
                self.last_value = read.value;
                read
            }
            None => RawRead::failed(self.last_value, ComErrors::empty()),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        self.write_calls += 1;
        let n = self.accepts.pop_front().unwrap_or(bytes.len());
        self.written.extend(bytes.iter().take(n));
        n
    }

    fn write_with_parity(&mut self, byte: u8, parity: Parity) -> usize {
        self.parity_writes.push((byte, parity));
        self.parity_accepts
    }

    fn dispose(&mut self) {
        self.disposals += 1;
        self.open = false;
    }
}
