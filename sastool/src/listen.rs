use std::time::{Duration, Instant};

use saslink::{BridgePort, FromStd, SasLink, SerialConfiguration, POLL_MARKER};

#[derive(clap::Args, Debug)]
pub struct ListenOpts {
    #[command(flatten)]
    bridge: crate::common::BridgeArgs,
    /// Our address on the bus.
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=127))]
    address: u8,
    /// Chirp after this many milliseconds without being polled.
    #[arg(long, default_value_t = 5000)]
    chirp_after: u64,
    /// Stop after this many frames.
    #[arg(short, long)]
    count: Option<usize>,
}

/// Bytes collected since the last wake-up.
#[derive(Debug, Default)]
struct Frame {
    bytes: Vec<u8>,
    long_poll: bool,
}

impl crate::ToolRun for ListenOpts {
    fn run(&self) -> anyhow::Result<()> {
        let args = self.bridge.clone();
        let port = BridgePort::new(move |name: &str, config: &SerialConfiguration| {
            args.open(name, config).map(FromStd::new)
        });

        let mut link = SasLink::new(port);
        link.set_sas_address(self.address);
        if !link.open(&self.bridge.port) {
            anyhow::bail!("could not open bridge at {}", self.bridge.port);
        }
        eprintln!(
            "Listening on {} as address {}.",
            self.bridge.port, self.address
        );

        let general_poll = POLL_MARKER | self.address;
        let chirp_after = Duration::from_millis(self.chirp_after);
        let mut last_polled = Instant::now();
        let mut frame = Frame::default();
        let mut frames = 0;

        while link.is_open() {
            if self.count.is_some_and(|count| frames >= count) {
                break;
            }

            let read = link.read_one_byte(frame.long_poll);
            if !read.success {
                // a gap ends whatever message was in flight
                if !frame.bytes.is_empty() {
                    frames += 1;
                    report(&std::mem::take(&mut frame));
                }
                if last_polled.elapsed() > chirp_after {
                    log::debug!("not polled for {:?}, chirping", last_polled.elapsed());
                    link.send_chirp();
                    last_polled = Instant::now();
                }
                continue;
            }

            if read.wake_up {
                if !frame.bytes.is_empty() {
                    frames += 1;
                    report(&std::mem::take(&mut frame));
                }

                if read.byte == general_poll {
                    last_polled = Instant::now();
                    // nothing to report
                    link.send_raw_bytes(&[0x00]);
                    frames += 1;
                    println!("general poll");
                    continue;
                }

                frame.long_poll = read.byte == self.address;
                if frame.long_poll {
                    last_polled = Instant::now();
                }
            }

            frame.bytes.push(read.byte);
        }

        if !link.is_open() {
            eprintln!("Bridge closed.");
        }
        Ok(())
    }
}

fn report(frame: &Frame) {
    let kind = if frame.long_poll { "long poll" } else { "traffic" };
    println!("{} ({} bytes):", kind, frame.bytes.len());
    crate::dump::dump_bytes("  ", &frame.bytes);
}
