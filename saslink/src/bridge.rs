//! A [NativePort] for 9-bit bus bridges.
//!
//! Ordinary 8-bit serial drivers cannot report or force the parity bit
//! of individual bytes. A bridge (a small USB device, or the simulator in
//! `sastool`) sits on the real bus and carries each bus character over a
//! plain byte stream as a two-byte word: a flags byte holding the ninth
//! bit and any line errors, then the data byte.
//!
//! When the port is opened, a single control frame carrying the
//! [SerialConfiguration] is sent so the bridge can set up the bus side.

use std::collections::VecDeque;

use embedded_io::{Error as _, ErrorKind};
use nom::bytes::complete::tag;
use nom::combinator::{all_consuming, map_opt};
use nom::multi::length_data;
use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::IResult;

use crate::config::{Parity, SerialConfiguration, StopBits, MAX_WRITE_ATTEMPTS};
use crate::port::{ComErrors, NativePort, RawRead};

/// First byte of a control frame. Never set in a data word's flags.
pub const CONTROL: u8 = 0x80;

/// Word flag: the ninth bit as seen on the bus.
pub const NINTH_BIT: u8 = 0x01;

/// Word flag: the bridge saw a framing error.
pub const FRAMING_ERROR: u8 = 0x02;

/// Word flag: the bridge's own receiver overran.
pub const OVERRUN: u8 = 0x04;

/// Length of the configuration payload.
pub const CONFIG_LEN: usize = 30;

const CONTROL_TAG: &[u8] = &[CONTROL];

/// Encoding of an infinite timeout.
const INFINITE_MS: u32 = u32::MAX;

/// One bus character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusWord {
    pub data: u8,
    pub ninth_bit: bool,
    pub framing_error: bool,
    pub overrun: bool,
}

impl BusWord {
    pub const fn new(data: u8, ninth_bit: bool) -> Self {
        Self {
            data,
            ninth_bit,
            framing_error: false,
            overrun: false,
        }
    }

    /// A word carrying `data` with the ninth bit `parity` would put on
    /// the wire.
    pub const fn with_parity(data: u8, parity: Parity) -> Self {
        let ninth_bit = match parity.bit_for(data) {
            Some(bit) => bit,
            None => false,
        };
        Self::new(data, ninth_bit)
    }

    pub const fn encode(&self) -> [u8; 2] {
        let mut flags = 0;
        if self.ninth_bit {
            flags |= NINTH_BIT;
        }
        if self.framing_error {
            flags |= FRAMING_ERROR;
        }
        if self.overrun {
            flags |= OVERRUN;
        }
        [flags, self.data]
    }

    pub const fn decode(word: [u8; 2]) -> Self {
        let [flags, data] = word;
        Self {
            data,
            ninth_bit: flags & NINTH_BIT != 0,
            framing_error: flags & FRAMING_ERROR != 0,
            overrun: flags & OVERRUN != 0,
        }
    }

    /// Line errors a receiver configured for `parity` would report.
    pub fn errors(&self, parity: Parity) -> ComErrors {
        let mut errors = ComErrors::empty();
        if parity
            .bit_for(self.data)
            .map_or(false, |expected| expected != self.ninth_bit)
        {
            errors |= ComErrors::PARITY;
        }
        if self.framing_error {
            errors |= ComErrors::FRAMING;
        }
        if self.overrun {
            errors |= ComErrors::OVERRUN;
        }
        errors
    }
}

/// An error type for decoding bridge control frames.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeError {
    /// More bytes are needed.
    Incomplete,
    /// Not a valid configuration frame.
    Malformed,
}

impl std::error::Error for BridgeError {}

impl core::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Self::Incomplete => write!(f, "incomplete control frame"),
            Self::Malformed => write!(f, "malformed control frame"),
        }
    }
}

fn millis(duration: core::time::Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(INFINITE_MS - 1)
}

/// Serialize a configuration into a control frame.
pub fn encode_config_frame(config: &SerialConfiguration) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONFIG_LEN + 2);
    out.push(CONTROL);
    out.push(CONFIG_LEN as u8);
    out.extend_from_slice(&config.baud_rate.to_le_bytes());
    out.push(config.data_bits);
    out.push(config.parity.code());
    out.push(config.chirp_parity.code());
    out.push(config.stop_bits.code());
    let interval = config.read_interval_timeout.map_or(INFINITE_MS, millis);
    out.extend_from_slice(&interval.to_le_bytes());
    out.extend_from_slice(&millis(config.read_total_timeout).to_le_bytes());
    out.extend_from_slice(&millis(config.write_total_timeout).to_le_bytes());
    out.extend_from_slice(&config.rx_high_water.to_le_bytes());
    out.extend_from_slice(&config.rx_low_water.to_le_bytes());
    out.extend_from_slice(&config.rx_queue_size.to_le_bytes());
    out.extend_from_slice(&config.tx_queue_size.to_le_bytes());
    out.push(config.xon_char);
    out.push(config.xoff_char);
    out
}

fn parity(input: &[u8]) -> IResult<&[u8], Parity> {
    map_opt(le_u8, Parity::from_code)(input)
}

fn stop_bits(input: &[u8]) -> IResult<&[u8], StopBits> {
    map_opt(le_u8, StopBits::from_code)(input)
}

fn timeout(input: &[u8]) -> IResult<&[u8], Option<core::time::Duration>> {
    let (input, ms) = le_u32(input)?;
    let duration = if ms == INFINITE_MS {
        None
    } else {
        Some(core::time::Duration::from_millis(ms.into()))
    };
    Ok((input, duration))
}

fn config_body(input: &[u8]) -> IResult<&[u8], SerialConfiguration> {
    let (input, baud_rate) = le_u32(input)?;
    let (input, data_bits) = le_u8(input)?;
    let (input, parity_) = parity(input)?;
    let (input, chirp_parity) = parity(input)?;
    let (input, stop_bits_) = stop_bits(input)?;
    let (input, read_interval_timeout) = timeout(input)?;
    let (input, read_total_timeout) = map_opt(timeout, |t| t)(input)?;
    let (input, write_total_timeout) = map_opt(timeout, |t| t)(input)?;
    let (input, rx_high_water) = le_u16(input)?;
    let (input, rx_low_water) = le_u16(input)?;
    let (input, rx_queue_size) = le_u16(input)?;
    let (input, tx_queue_size) = le_u16(input)?;
    let (input, xon_char) = le_u8(input)?;
    let (input, xoff_char) = le_u8(input)?;

    Ok((
        input,
        SerialConfiguration {
            baud_rate,
            data_bits,
            parity: parity_,
            chirp_parity,
            stop_bits: stop_bits_,
            read_interval_timeout,
            read_total_timeout,
            write_total_timeout,
            rx_high_water,
            rx_low_water,
            rx_queue_size,
            tx_queue_size,
            xon_char,
            xoff_char,
        },
    ))
}

/// nom parser for a whole configuration control frame.
pub fn config_frame(input: &[u8]) -> IResult<&[u8], SerialConfiguration> {
    let (input, _) = tag(CONTROL_TAG)(input)?;
    let (input, body) = length_data(le_u8)(input)?;
    let (_, config) = all_consuming(config_body)(body)?;
    Ok((input, config))
}

/// Decode a configuration control frame from the front of `input`.
/// Returns the configuration and the number of bytes consumed.
pub fn parse_config_frame(input: &[u8]) -> Result<(SerialConfiguration, usize), BridgeError> {
    match input {
        [] | [_] => return Err(BridgeError::Incomplete),
        [_, len, rest @ ..] if rest.len() < usize::from(*len) => {
            return Err(BridgeError::Incomplete)
        }
        _ => {}
    }

    let (rest, config) = config_frame(input).map_err(|_| BridgeError::Malformed)?;
    Ok((config, input.len() - rest.len()))
}

/// A [NativePort] talking to a 9-bit bridge over a byte stream.
///
/// The stream is created by `opener` each time the port is opened, and
/// should already honour the read and write timeouts in the
/// configuration it is given.
pub struct BridgePort<F, O> {
    opener: O,
    stream: Option<F>,
    config: SerialConfiguration,
    rx: VecDeque<u8>,
    scratch: Vec<u8>,
    last_value: u8,
    disposed: bool,
}

impl<F, O> core::fmt::Debug for BridgePort<F, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BridgePort")
            .field("open", &self.stream.is_some())
            .field("config", &self.config)
            .field("buffered", &self.rx.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<F, O, E> BridgePort<F, O>
where
    O: FnMut(&str, &SerialConfiguration) -> Result<F, E>,
{
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            stream: None,
            config: SerialConfiguration::sas(),
            rx: VecDeque::new(),
            scratch: Vec::new(),
            last_value: 0,
            disposed: false,
        }
    }
}

impl<F, O> BridgePort<F, O> {
    /// Get the underlying stream, if open.
    pub fn stream(&self) -> Option<&F> {
        self.stream.as_ref()
    }

    /// Bus characters received from the bridge but not yet read.
    pub fn buffered(&self) -> usize {
        self.rx.len() / 2
    }
}

impl<F, O> BridgePort<F, O>
where
    F: embedded_io::Read + embedded_io::Write,
{
    /// Pull whatever the bridge has, up to one receive queue's worth.
    fn fill(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let want = usize::from(self.config.rx_queue_size) * 2;
        self.scratch.resize(want, 0);
        match stream.read(&mut self.scratch) {
            Ok(0) => {
                log::warn!("bridge closed the stream");
                self.stream = None;
            }
            Ok(n) => self.rx.extend(&self.scratch[..n]),
            Err(e) => {
                if e.kind() != ErrorKind::TimedOut {
                    log::debug!("bridge read: {:?}", e);
                }
            }
        }
    }

    /// Write as much of `bytes` as the stream takes, then flush. Returns
    /// how many bytes went out.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };

        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) => {
                    log::debug!("bridge write: {:?}", e);
                    break;
                }
            }
        }

        if let Err(e) = stream.flush() {
            log::debug!("bridge flush: {:?}", e);
        }
        written
    }

    /// Send encoded words. Returns how many whole words went out.
    ///
    /// A word cut in half would shift every later word on the bridge, so
    /// the second half is retried, and the stream dropped if it still
    /// will not go.
    fn send_words(&mut self, words: &[u8]) -> usize {
        let mut written = self.push(words);

        if written % 2 == 1 {
            for _ in 0..MAX_WRITE_ATTEMPTS {
                written += self.push(&words[written..written + 1]);
                if written % 2 == 0 {
                    break;
                }
            }
            if written % 2 == 1 {
                log::error!("bridge write stopped mid-word, closing stream");
                self.stream = None;
                self.rx.clear();
            }
        }

        written / 2
    }
}

impl<F, O, E> NativePort for BridgePort<F, O>
where
    F: embedded_io::Read + embedded_io::Write,
    O: FnMut(&str, &SerialConfiguration) -> Result<F, E>,
    E: core::fmt::Debug,
{
    fn open(&mut self, name: &str, config: &SerialConfiguration) -> bool {
        if self.disposed {
            return false;
        }
        self.close();

        let stream = match (self.opener)(name, config) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("cannot open bridge {}: {:?}", name, e);
                return false;
            }
        };

        self.stream = Some(stream);
        self.config = config.clone();
        let frame = encode_config_frame(config);
        if self.push(&frame) != frame.len() {
            log::error!("cannot configure bridge {}", name);
            self.stream = None;
            return false;
        }
        true
    }

    fn close(&mut self) {
        self.stream = None;
        self.rx.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> RawRead {
        if self.rx.len() < 2 {
            self.fill();
        }

        let (Some(flags), Some(data)) = (self.rx.get(0).copied(), self.rx.get(1).copied()) else {
            return RawRead::failed(self.last_value, ComErrors::empty());
        };
        self.rx.drain(..2);

        let word = BusWord::decode([flags, data]);
        self.last_value = word.data;
        let queued = u32::try_from(self.buffered()).unwrap_or(u32::MAX);
        RawRead::received(word.data, word.errors(self.config.parity), queued)
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(usize::from(self.config.tx_queue_size));
        let words: Vec<u8> = bytes[..n]
            .iter()
            .flat_map(|&b| BusWord::with_parity(b, self.config.parity).encode())
            .collect();

        self.send_words(&words)
    }

    fn write_with_parity(&mut self, byte: u8, parity: Parity) -> usize {
        self.send_words(&BusWord::with_parity(byte, parity).encode())
    }

    fn dispose(&mut self) {
        self.close();
        self.disposed = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use quickcheck_macros::quickcheck;

    /// An in-memory bridge: reads come from `incoming`, writes land in
    /// `outgoing`. Each write takes the next result from `accepts`, and
    /// everything once that runs out.
    #[derive(Debug, Default, Clone)]
    struct Pipe {
        incoming: Rc<RefCell<VecDeque<u8>>>,
        outgoing: Rc<RefCell<Vec<u8>>>,
        accepts: Rc<RefCell<VecDeque<Result<usize, ErrorKind>>>>,
    }

    impl Pipe {
        fn feed(&self, words: &[BusWord]) {
            let mut incoming = self.incoming.borrow_mut();
            for w in words {
                incoming.extend(w.encode());
            }
        }
    }

    impl embedded_io::ErrorType for Pipe {
        type Error = ErrorKind;
    }

    impl embedded_io::Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let mut incoming = self.incoming.borrow_mut();
            if incoming.is_empty() {
                return Err(ErrorKind::TimedOut);
            }
            let n = buf.len().min(incoming.len());
            for (slot, b) in buf.iter_mut().zip(incoming.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }
    }

    impl embedded_io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            let n = match self.accepts.borrow_mut().pop_front() {
                Some(accept) => accept?.min(buf.len()),
                None => buf.len(),
            };
            self.outgoing.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    type TestPort = BridgePort<Pipe, Box<dyn FnMut(&str, &SerialConfiguration) -> Result<Pipe, ()>>>;

    fn opened(pipe: &Pipe) -> TestPort {
        let pipe = pipe.clone();
        let mut port: TestPort = BridgePort::new(Box::new(move |_: &str, _: &SerialConfiguration| {
            Ok(pipe.clone())
        }));
        assert!(port.open("bridge", &SerialConfiguration::sas()));
        port
    }

    #[test]
    fn open_sends_configuration() {
        let pipe = Pipe::default();
        let _port = opened(&pipe);

        let sent = pipe.outgoing.borrow();
        assert_eq!(sent.len(), CONFIG_LEN + 2);
        assert_eq!(
            parse_config_frame(&sent),
            Ok((SerialConfiguration::sas(), CONFIG_LEN + 2))
        );
    }

    #[test]
    fn failed_opener() {
        let mut port: TestPort = BridgePort::new(Box::new(|_: &str, _: &SerialConfiguration| Err(())));
        assert!(!port.open("bridge", &SerialConfiguration::sas()));
        assert!(!port.is_open());
        assert!(!port.read().success);
    }

    #[test]
    fn ninth_bit_is_parity_error_under_space() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.feed(&[BusWord::new(0x01, true), BusWord::new(0x1f, false)]);

        let first = port.read();
        assert!(first.success);
        assert_eq!(first.value, 0x01);
        assert_eq!(first.errors, ComErrors::PARITY);
        assert_eq!(first.queued, 1);

        let second = port.read();
        assert_eq!(second.value, 0x1f);
        assert_eq!(second.errors, ComErrors::empty());
        assert_eq!(second.queued, 0);

        let third = port.read();
        assert!(!third.success);
        assert_eq!(third.value, 0x1f);
    }

    #[test]
    fn bridge_line_errors_pass_through() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.feed(&[BusWord {
            data: 0x55,
            ninth_bit: false,
            framing_error: true,
            overrun: true,
        }]);

        assert_eq!(port.read().errors, ComErrors::FRAMING | ComErrors::OVERRUN);
    }

    #[test]
    fn reads_pull_one_queue_at_a_time() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        let words: Vec<BusWord> = (0..20).map(|b| BusWord::new(b, false)).collect();
        pipe.feed(&words);

        // one receive queue (8 characters) per stream read
        assert_eq!(port.read().queued, 7);
        assert_eq!(port.buffered(), 7);
    }

    #[test]
    fn split_word_waits_for_second_half() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.incoming.borrow_mut().push_back(NINTH_BIT);

        assert!(!port.read().success);
        pipe.incoming.borrow_mut().push_back(0x07);
        let read = port.read();
        assert!(read.success);
        assert_eq!(read.value, 0x07);
        assert_eq!(read.errors, ComErrors::PARITY);
    }

    #[test]
    fn writes_stop_at_tx_queue_size() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.outgoing.borrow_mut().clear();

        let data = [0xaau8; 100];
        assert_eq!(port.write(&data), 64);
        let sent = pipe.outgoing.borrow();
        assert_eq!(sent.len(), 128);
        assert!(sent.chunks(2).all(|w| w == [0x00, 0xaa]));
    }

    #[test]
    fn chirp_word_has_ninth_bit() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.outgoing.borrow_mut().clear();

        assert_eq!(port.write_with_parity(0x05, Parity::Mark), 1);
        assert_eq!(*pipe.outgoing.borrow(), [NINTH_BIT, 0x05]);
    }

    #[test]
    fn interrupted_word_is_finished_not_repeated() {
        let pipe = Pipe::default();
        let mut link = crate::SasLink::new(opened(&pipe));
        pipe.outgoing.borrow_mut().clear();
        pipe.accepts
            .borrow_mut()
            .extend([Ok(3), Err(ErrorKind::TimedOut)]);

        let report = link.transmit(&[0xaa, 0xbb]);
        assert!(report.is_complete());
        assert_eq!(*pipe.outgoing.borrow(), [0x00, 0xaa, 0x00, 0xbb]);
    }

    #[test]
    fn whole_words_count_before_an_error() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.outgoing.borrow_mut().clear();
        pipe.accepts
            .borrow_mut()
            .extend([Ok(4), Err(ErrorKind::TimedOut)]);

        assert_eq!(port.write(&[0x01, 0x02, 0x03]), 2);
        assert!(port.is_open());
        assert_eq!(port.write(&[0x03]), 1);
        assert_eq!(*pipe.outgoing.borrow(), [0x00, 0x01, 0x00, 0x02, 0x00, 0x03]);
    }

    #[test]
    fn stuck_half_word_closes_stream() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        pipe.outgoing.borrow_mut().clear();
        pipe.accepts.borrow_mut().push_back(Ok(1));
        pipe.accepts
            .borrow_mut()
            .extend(std::iter::repeat(Err(ErrorKind::TimedOut)).take(8));

        assert_eq!(port.write(&[0x01]), 0);
        assert!(!port.is_open());
        assert_eq!(port.write(&[0x02]), 0);
    }

    #[test]
    fn closed_port_writes_nothing() {
        let pipe = Pipe::default();
        let mut port = opened(&pipe);
        port.dispose();

        assert_eq!(port.write(b"abc"), 0);
        assert_eq!(port.write_with_parity(0x05, Parity::Mark), 0);
        assert!(!port.open("bridge", &SerialConfiguration::sas()));
    }

    #[test]
    fn truncated_config_frame() {
        let frame = encode_config_frame(&SerialConfiguration::sas());
        assert_eq!(parse_config_frame(&frame[..1]), Err(BridgeError::Incomplete));
        assert_eq!(parse_config_frame(&frame[..10]), Err(BridgeError::Incomplete));
    }

    #[test]
    fn bad_config_frames() {
        let mut frame = encode_config_frame(&SerialConfiguration::sas());
        frame[0] = 0x00;
        assert_eq!(parse_config_frame(&frame), Err(BridgeError::Malformed));

        let mut frame = encode_config_frame(&SerialConfiguration::sas());
        // parity code out of range
        frame[7] = 9;
        assert_eq!(parse_config_frame(&frame), Err(BridgeError::Malformed));
    }

    #[test]
    fn config_frame_leaves_trailing_words() {
        let mut frame = encode_config_frame(&SerialConfiguration::sas());
        frame.extend(BusWord::new(0x01, true).encode());
        let (_, used) = parse_config_frame(&frame).unwrap();
        assert_eq!(&frame[used..], [NINTH_BIT, 0x01]);
    }

    #[quickcheck]
    fn received_parity_error_matches_space(data: u8, ninth_bit: bool) -> bool {
        let word = BusWord::new(data, ninth_bit);
        word.errors(Parity::Space).contains(ComErrors::PARITY) == ninth_bit
    }
}
