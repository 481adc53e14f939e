use std::time::Duration;

/// SAS bus speed.
pub const BAUD_RATE: u32 = 19200;

/// Reserved byte the host uses during general (non-addressed) polling.
pub const POLL_MARKER: u8 = 0x80;

/// Native write calls [crate::SasLink::send_raw_bytes] will make before
/// giving up on a buffer.
pub const MAX_WRITE_ATTEMPTS: u8 = 5;

/// Bus silence longer than this is logged.
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_millis(30_000);

/// DC1.
pub const XON: u8 = 0x11;

/// DC3.
pub const XOFF: u8 = 0x13;

/// Parity modes a port can put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
    /// Parity bit always set.
    Mark,
    /// Parity bit always clear.
    Space,
}

impl Parity {
    /// The ninth bit this mode transmits alongside `byte`, or [None] if
    /// there is no parity bit at all.
    pub const fn bit_for(self, byte: u8) -> Option<bool> {
        let odd_ones = byte.count_ones() % 2 == 1;
        match self {
            Parity::None => None,
            Parity::Odd => Some(!odd_ones),
            Parity::Even => Some(odd_ones),
            Parity::Mark => Some(true),
            Parity::Space => Some(false),
        }
    }

    pub const fn code(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
            Parity::Mark => 3,
            Parity::Space => 4,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Parity::None),
            1 => Some(Parity::Odd),
            2 => Some(Parity::Even),
            3 => Some(Parity::Mark),
            4 => Some(Parity::Space),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub const fn code(self) -> u8 {
        match self {
            StopBits::One => 0,
            StopBits::OnePointFive => 1,
            StopBits::Two => 2,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StopBits::One),
            1 => Some(StopBits::OnePointFive),
            2 => Some(StopBits::Two),
            _ => None,
        }
    }
}

/// Serial parameters handed to a [crate::NativePort] when it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialConfiguration {
    pub baud_rate: u32,
    pub data_bits: u8,
    /// Parity used for all ordinary traffic.
    pub parity: Parity,
    /// Parity forced onto the address byte when chirping.
    pub chirp_parity: Parity,
    pub stop_bits: StopBits,
    /// Maximum gap between two received bytes. [None] is infinite.
    pub read_interval_timeout: Option<Duration>,
    /// Upper bound on a single read call.
    pub read_total_timeout: Duration,
    /// Upper bound on a single write call.
    pub write_total_timeout: Duration,
    pub rx_high_water: u16,
    pub rx_low_water: u16,
    /// Receive queue size, in bytes.
    pub rx_queue_size: u16,
    /// Transmit queue size, in bytes.
    pub tx_queue_size: u16,
    /// Flow control is off, but drivers still insist these differ.
    pub xon_char: u8,
    pub xoff_char: u8,
}

impl SerialConfiguration {
    /// The fixed configuration of a SAS slave port.
    pub const fn sas() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            data_bits: 8,
            parity: Parity::Space,
            chirp_parity: Parity::Mark,
            stop_bits: StopBits::One,
            read_interval_timeout: None,
            read_total_timeout: Duration::from_millis(20),
            write_total_timeout: Duration::from_millis(100),
            rx_high_water: 2048,
            rx_low_water: 512,
            rx_queue_size: 8,
            tx_queue_size: 64,
            xon_char: XON,
            xoff_char: XOFF,
        }
    }

    /// Check the internal consistency of the parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::DataBits(self.data_bits));
        }
        if self.xon_char == self.xoff_char {
            return Err(ConfigError::FlowControlChars(self.xon_char));
        }
        if self.rx_low_water >= self.rx_high_water {
            return Err(ConfigError::WaterMarks {
                low: self.rx_low_water,
                high: self.rx_high_water,
            });
        }
        if self.rx_queue_size == 0 || self.tx_queue_size == 0 {
            return Err(ConfigError::EmptyQueue);
        }
        if self.parity == self.chirp_parity {
            return Err(ConfigError::ChirpParity(self.parity));
        }
        Ok(())
    }
}

impl Default for SerialConfiguration {
    fn default() -> Self {
        Self::sas()
    }
}

/// An error type for [SerialConfiguration::validate].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigError {
    ZeroBaudRate,
    DataBits(u8),
    FlowControlChars(u8),
    WaterMarks { low: u16, high: u16 },
    EmptyQueue,
    ChirpParity(Parity),
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::ZeroBaudRate => write!(f, "baud rate must be non-zero"),
            Self::DataBits(n) => write!(f, "unsupported data bits: {}", n),
            Self::FlowControlChars(c) => {
                write!(f, "xon and xoff are both 0x{:02x}, they must differ", c)
            }
            Self::WaterMarks { low, high } => write!(
                f,
                "rx low-water mark {} must be below high-water mark {}",
                low, high
            ),
            Self::EmptyQueue => write!(f, "queue sizes must be non-zero"),
            Self::ChirpParity(p) => {
                write!(f, "chirp parity must differ from normal parity ({:?})", p)
            }
        }
    }
}
