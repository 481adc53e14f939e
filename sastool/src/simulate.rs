use std::io::{Read, Write};
use std::time::Duration;

use saslink::bridge::{parse_config_frame, BridgeError, BusWord};
use saslink::{SerialConfiguration, POLL_MARKER};

const SAS_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_KERMIT);

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim_start_matches("0x");
    if !s.is_ascii() {
        return Err("not a hex string".to_owned());
    }
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".to_owned());
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(pair, 16).map_err(|e| e.to_string())
        })
        .collect()
}

#[derive(clap::Args, Debug)]
pub struct SimulateOpts {
    #[arg(default_value = "localhost:8855")]
    bind: String,
    /// Machine addresses to poll.
    #[arg(short, long, default_values_t = [1u8], value_parser = clap::value_parser!(u8).range(1..=127))]
    addresses: Vec<u8>,
    /// Send a long poll every this many poll cycles. 0 disables them.
    #[arg(long, default_value_t = 5)]
    long_poll_every: usize,
    /// Long poll command byte.
    #[arg(long, default_value_t = 0x1f)]
    command: u8,
    /// Long poll data, in hex. When present a CRC is appended.
    #[arg(long)]
    data: Option<String>,
    /// Milliseconds to wait for replies after each poll.
    #[arg(long, default_value_t = 200)]
    interval: u64,
}

impl crate::ToolRun for SimulateOpts {
    fn run(&self) -> anyhow::Result<()> {
        let data = match self.data {
            Some(ref data) => Some(parse_hex(data).map_err(anyhow::Error::msg)?),
            None => None,
        };

        let listener = std::net::TcpListener::bind(&self.bind)?;
        eprintln!("Listening on {}.", self.bind);

        loop {
            let (stream, addr) = listener.accept()?;
            eprintln!("Connected to {}.", addr);

            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(Duration::from_millis(self.interval.max(1))))?;

            match Host::new(stream, self, data.clone()).simulate() {
                Err(e) => match e.downcast_ref::<std::io::Error>().map(|e| e.kind()) {
                    // an expected error, at disconnect
                    Some(std::io::ErrorKind::UnexpectedEof) => {
                        eprintln!("Disconnected from {}.", addr);
                        continue;
                    }
                    // any other error is unexpected
                    _ => anyhow::bail!(e),
                },
                // statically impossible, but ! not stable
                _ => {}
            }
        }
    }
}

/// The host side of the bus, polling over one bridge connection.
struct Host<'a, F> {
    stream: F,
    rx: Vec<u8>,
    config: Option<SerialConfiguration>,
    data: Option<Vec<u8>>,
    opts: &'a SimulateOpts,
}

impl<'a, F> Host<'a, F>
where
    F: Read + Write,
{
    fn new(stream: F, opts: &'a SimulateOpts, data: Option<Vec<u8>>) -> Self {
        Self {
            stream,
            rx: Vec::new(),
            config: None,
            data,
            opts,
        }
    }

    fn simulate(&mut self) -> anyhow::Result<()> {
        let opts = self.opts;
        let mut cycle = 0usize;
        loop {
            for &address in opts.addresses.iter() {
                let every = opts.long_poll_every;
                let words = if every > 0 && cycle % every == every - 1 {
                    self.long_poll(address)
                } else {
                    vec![BusWord::new(POLL_MARKER | address, true)]
                };
                self.send(&words)?;
                self.receive()?;
            }
            cycle = cycle.wrapping_add(1);
        }
    }

    fn long_poll(&self, address: u8) -> Vec<BusWord> {
        let mut words = vec![
            BusWord::new(address, true),
            BusWord::new(self.opts.command, false),
        ];
        if let Some(ref data) = self.data {
            let mut digest = SAS_CRC.digest();
            digest.update(&[address, self.opts.command]);
            digest.update(data);
            let crc = digest.finalize();

            words.extend(data.iter().map(|&b| BusWord::new(b, false)));
            words.extend(crc.to_le_bytes().map(|b| BusWord::new(b, false)));
        }
        words
    }

    fn send(&mut self, words: &[BusWord]) -> anyhow::Result<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.encode()).collect();
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Wait one interval for replies, handling anything that arrives.
    fn receive(&mut self) -> anyhow::Result<()> {
        let mut buf = [0; 256];
        match self.stream.read(&mut buf) {
            Ok(0) => return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => self.rx.extend_from_slice(&buf[..n]),
            Err(e) if crate::common::is_timeout(&e) => {}
            Err(e) => return Err(e.into()),
        }

        self.handle_config()?;
        if self.config.is_none() {
            return Ok(());
        }

        let n = self.rx.len() / 2 * 2;
        let words: Vec<BusWord> = self.rx[..n]
            .chunks_exact(2)
            .map(|w| BusWord::decode([w[0], w[1]]))
            .collect();
        self.rx.drain(..n);

        for word in words.iter().filter(|w| w.ninth_bit) {
            println!("chirp from {}", word.data);
        }
        let replies: Vec<BusWord> = words.into_iter().filter(|w| !w.ninth_bit).collect();
        if !replies.is_empty() {
            println!("reply ({} bytes):", replies.len());
            crate::dump::dump_prefix("  ", &replies);
        }
        Ok(())
    }

    /// Consume any configuration frames at the front of the buffer.
    fn handle_config(&mut self) -> anyhow::Result<()> {
        while !self.rx.is_empty() && self.rx[0] == saslink::bridge::CONTROL {
            match parse_config_frame(&self.rx) {
                Ok((config, used)) => {
                    eprintln!(
                        "Bus configured: {} baud, {:?} parity, chirp {:?}.",
                        config.baud_rate, config.parity, config.chirp_parity
                    );
                    self.rx.drain(..used);
                    self.config = Some(config);
                }
                Err(BridgeError::Incomplete) => break,
                Err(e) => anyhow::bail!(e),
            }
        }
        Ok(())
    }
}
