use saslink::SerialConfiguration;

/// Where the bridge is, and how to reach it.
#[derive(clap::Args, Debug, Clone)]
pub struct BridgeArgs {
    #[arg(default_value_t = default_serial_port())]
    pub port: String,
    /// Baud rate of the link to the bridge [default: the bus baud rate]
    #[arg(short, long)]
    pub baud: Option<u32>,
    /// Treat PORT as a plain file or fifo.
    #[arg(long)]
    pub plain_file: bool,
    /// Treat PORT as a host:port to connect to, such as a simulator.
    #[arg(long)]
    pub tcp: bool,
}

#[derive(Debug)]
pub enum BridgeStream {
    Serial(Box<dyn serialport::SerialPort>),
    File(std::fs::File),
    Tcp(std::net::TcpStream),
}

pub fn default_serial_port() -> String {
    if let Ok(infos) = serialport::available_ports() {
        for info in infos {
            #[cfg(target_os = "macos")]
            if info.port_name.ends_with(".Bluetooth-Incoming-Port") {
                // these ports are almost always *not* what we want
                continue;
            }

            #[cfg(target_os = "macos")]
            if info.port_name.starts_with("/dev/tty.") {
                // macos ports with tty. have flow control we don't use
                // use cu. ports instead!
                continue;
            }

            return info.port_name.clone();
        }
    }

    // not great, but reasonable fallback
    "/dev/ttyUSB0".to_owned()
}

impl std::io::Read for BridgeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(port) => port.read(buf),
            Self::File(port) => port.read(buf),
            Self::Tcp(port) => port.read(buf),
        }
    }
}

impl std::io::Write for BridgeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(port) => port.write(buf),
            Self::File(port) => port.write(buf),
            Self::Tcp(port) => port.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Serial(port) => port.flush(),
            Self::File(port) => port.flush(),
            Self::Tcp(port) => port.flush(),
        }
    }
}

impl BridgeArgs {
    /// Open a stream to the bridge named `name`, with the timeouts from
    /// `config` applied where the stream supports them.
    pub fn open(&self, name: &str, config: &SerialConfiguration) -> anyhow::Result<BridgeStream> {
        if self.tcp {
            let port = std::net::TcpStream::connect(name)?;
            port.set_nodelay(true)?;
            port.set_read_timeout(Some(config.read_total_timeout))?;
            port.set_write_timeout(Some(config.write_total_timeout))?;
            Ok(BridgeStream::Tcp(port))
        } else if self.plain_file {
            let port = std::fs::File::options().read(true).write(true).open(name)?;
            Ok(BridgeStream::File(port))
        } else {
            // the bridge carries 9-bit words as plain 8N1 bytes, the bus
            // side parity lives in the words themselves
            let port = serialport::new(name, self.baud.unwrap_or(config.baud_rate))
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(config.read_total_timeout)
                .open()?;
            Ok(BridgeStream::Serial(port))
        }
    }
}

/// Whether an I/O error is just a read timeout.
pub fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}
