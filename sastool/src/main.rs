use clap::Parser;

mod common;
mod dump;
mod listen;
mod simulate;

trait ToolRun {
    fn run(&self) -> anyhow::Result<()>;
}

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a SAS bus through a 9-bit bridge.")]
struct ToolOptions {
    /// More logging (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    #[command(subcommand)]
    command: ToolCommand,
}

#[derive(clap::Subcommand, Debug)]
enum ToolCommand {
    /// List serial ports.
    Ports(PortsOpts),
    /// Act as a machine on the bus and print what arrives.
    Listen(listen::ListenOpts),
    /// Act as the host, polling machines over TCP.
    Simulate(simulate::SimulateOpts),
}

impl ToolRun for ToolCommand {
    fn run(&self) -> anyhow::Result<()> {
        use ToolCommand::*;
        match self {
            Ports(o) => o.run(),
            Listen(o) => o.run(),
            Simulate(o) => o.run(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct PortsOpts {}

impl ToolRun for PortsOpts {
    fn run(&self) -> anyhow::Result<()> {
        let ports = serialport::available_ports()?;
        if ports.is_empty() {
            eprintln!("No serial ports found.");
        }
        for info in ports {
            match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => println!(
                    "{}  usb {:04x}:{:04x} {}",
                    info.port_name,
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                _ => println!("{}", info.port_name),
            }
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let opts = ToolOptions::parse();

    let level = match opts.debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    opts.command.run()
}
