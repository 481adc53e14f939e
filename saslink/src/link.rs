use crate::config::{SerialConfiguration, MAX_WRITE_ATTEMPTS};
use crate::framing::{Classification, Framer, LinkState};
use crate::monitor::{ActivityMonitor, Clock, StdClock};
use crate::port::{ComErrors, NativePort};

/// What [SasLink::read_one_byte] hands back to the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadByte {
    pub byte: u8,
    /// This byte starts a new address cycle.
    pub wake_up: bool,
    /// A byte was actually read. When unset, `byte` is stale.
    pub success: bool,
}

impl ReadByte {
    const CLOSED: Self = Self {
        byte: 0xff,
        wake_up: false,
        success: false,
    };
}

/// The outcome of [SasLink::transmit].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SendReport {
    /// Bytes the port accepted.
    pub sent: usize,
    /// Bytes we asked it to send.
    pub len: usize,
    /// Native write calls made.
    pub attempts: u8,
    /// The port claimed to accept more than it was given.
    pub overrun: bool,
}

impl SendReport {
    pub const fn is_complete(&self) -> bool {
        self.sent >= self.len
    }
}

/// A SAS slave port: the EGM's end of the multidrop bus.
///
/// Driven from a single polling loop. Each call to
/// [read_one_byte][Self::read_one_byte] pulls at most one byte and
/// blocks for at most the configured read timeout.
#[derive(Debug)]
pub struct SasLink<P, C = StdClock>
where
    P: NativePort,
    C: Clock,
{
    port: P,
    config: SerialConfiguration,
    framer: Framer,
    monitor: ActivityMonitor<C>,
    sas_address: u8,
    disposed: bool,
}

impl<P> SasLink<P, StdClock>
where
    P: NativePort,
{
    pub fn new(port: P) -> Self {
        Self::with_clock(port, StdClock)
    }
}

impl<P, C> SasLink<P, C>
where
    P: NativePort,
    C: Clock,
{
    /// Create a link that times bus silence with the given clock.
    pub fn with_clock(port: P, clock: C) -> Self {
        Self {
            port,
            config: SerialConfiguration::sas(),
            framer: Framer::new(),
            monitor: ActivityMonitor::with_clock(clock),
            sas_address: 0,
            disposed: false,
        }
    }

    /// Get the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get the underlying port, mutably.
    ///
    /// Reading from it directly will confuse the framer.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn config(&self) -> &SerialConfiguration {
        &self.config
    }

    pub fn monitor(&self) -> &ActivityMonitor<C> {
        &self.monitor
    }

    pub fn state(&self) -> LinkState {
        self.framer.state()
    }

    /// Classification of the last byte successfully read this session.
    pub fn last_classification(&self) -> Option<Classification> {
        self.framer.last_classification()
    }

    pub fn sas_address(&self) -> u8 {
        self.sas_address
    }

    pub fn set_sas_address(&mut self, address: u8) {
        self.sas_address = address;
    }

    pub fn is_open(&self) -> bool {
        !self.disposed && self.port.is_open()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Open the named port with the fixed SAS configuration. Starts a new
    /// framing session on success.
    pub fn open(&mut self, name: &str) -> bool {
        if self.disposed {
            log::error!("cannot open {}, link already disposed", name);
            return false;
        }

        if let Err(e) = self.config.validate() {
            log::error!("refusing to open {}: {}", name, e);
            return false;
        }

        if !self.port.open(name, &self.config) {
            log::error!("failed to open {}", name);
            return false;
        }

        log::debug!(
            "opened {} at {} baud, address {}",
            name,
            self.config.baud_rate,
            self.sas_address
        );
        self.framer.reset();
        self.monitor.restart();
        true
    }

    pub fn close(&mut self) {
        self.port.close();
    }

    /// Release the port for good. Safe to call any number of times.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.port.dispose();
    }

    /// Read and classify one byte.
    ///
    /// `is_long_poll` tells the framer the caller is in the middle of a
    /// long poll, where [crate::POLL_MARKER] is ordinary data.
    pub fn read_one_byte(&mut self, is_long_poll: bool) -> ReadByte {
        if !self.is_open() {
            return ReadByte::CLOSED;
        }

        let raw = self.port.read();
        if !raw.success {
            // silence is normal, only worth a note when it drags on
            self.monitor.check_silence();
            return ReadByte {
                byte: raw.value,
                wake_up: raw.errors.contains(ComErrors::PARITY),
                success: false,
            };
        }

        self.monitor.record_activity();
        let class = self.framer.classify(&raw.sample(), is_long_poll);
        log::trace!("rx 0x{:02x} {:?} {:?}", raw.value, class, self.framer.state());

        ReadByte {
            byte: raw.value,
            wake_up: class.is_wake_up(),
            success: true,
        }
    }

    /// Push a buffer out through the port, retrying partial writes up to
    /// [MAX_WRITE_ATTEMPTS] times.
    pub fn transmit(&mut self, bytes: &[u8]) -> SendReport {
        let mut report = SendReport {
            sent: 0,
            len: bytes.len(),
            attempts: 0,
            overrun: false,
        };

        while report.sent < report.len && report.attempts < MAX_WRITE_ATTEMPTS {
            let remaining = report.len - report.sent;
            let n = self.port.write(&bytes[report.sent..]);
            report.attempts += 1;

            if n > remaining {
                log::error!(
                    "port accepted {} bytes but only {} remained",
                    n,
                    remaining
                );
                report.overrun = true;
                report.sent = report.len;
            } else {
                report.sent += n;
            }
        }

        if !report.is_complete() {
            log::warn!(
                "gave up after {} attempts, sent {} of {} bytes",
                report.attempts,
                report.sent,
                report.len
            );
        }

        report
    }

    /// Send raw bytes. Always reports success, even if the port stopped
    /// accepting data; use [transmit][Self::transmit] for the real
    /// outcome.
    pub fn send_raw_bytes(&mut self, bytes: &[u8]) -> bool {
        self.transmit(bytes);
        true
    }

    /// Claim the line by sending our address with the chirp parity.
    pub fn send_chirp(&mut self) -> bool {
        let written = self
            .port
            .write_with_parity(self.sas_address, self.config.chirp_parity);
        log::trace!("chirp 0x{:02x}, accepted {}", self.sas_address, written);
        written == 1
    }
}

impl<P, C> Drop for SasLink<P, C>
where
    P: NativePort,
    C: Clock,
{
    fn drop(&mut self) {
        self.dispose();
    }
}
