// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// sysexfs command-line front end
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use sysexfs::connector::{Connector, Device, autodetect, connect};
use sysexfs::connectors::elektron::ElektronConnector;
use sysexfs::device::DeviceTable;
use sysexfs::serial::{MIDI_BAUD, MidiPort, PortKind, SerialMidiPort, available_ports};
use sysexfs::{Config, Error, Filesystem, JobControl, Operations, Result, Session};

#[derive(Parser)]
#[command(name = "sysexfs")]
#[command(about = "Browse and transfer files on MIDI instruments over System Exclusive", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Port to use (e.g., /dev/ttyUSB0, or a MIDI port name with --midi)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate for serial ports
    #[arg(short, long, default_value_t = MIDI_BAUD)]
    baud: u32,

    /// Open a host MIDI port instead of a serial device
    #[cfg(feature = "midi-io")]
    #[arg(long)]
    midi: bool,

    /// Connector to use instead of autodetection (elektron, sds)
    #[arg(short, long)]
    connector: Option<String>,

    /// Reply timeout in milliseconds
    #[arg(long, default_value = "5000", value_name = "MS")]
    timeout: u64,

    /// Retries per Sample Dump Standard packet
    #[arg(long, default_value = "5")]
    retries: u32,

    /// Elektron device table (one "<id> <fs mask> <storage> <name>" per line)
    #[arg(long, value_name = "FILE")]
    devices: Option<PathBuf>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial and MIDI ports
    Ports,
    /// Show the device and its filesystems
    Info,
    /// List a directory
    Ls {
        fs: String,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download an item to a local file
    Get { fs: String, path: String, file: PathBuf },
    /// Upload a local file
    Put { fs: String, file: PathBuf, path: String },
    /// Create a directory
    Mkdir { fs: String, path: String },
    /// Delete an item (directories recursively)
    Rm { fs: String, path: String },
    /// Rename or move an item
    Mv { fs: String, from: String, to: String },
    /// Copy an item
    Cp { fs: String, from: String, to: String },
    /// Clear a slot
    Clear { fs: String, path: String },
    /// Swap two slots
    Swap { fs: String, a: String, b: String },
}

fn init_logging(debug: bool) {
    let default = if debug { "sysexfs=debug" } else { "sysexfs=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if matches!(cli.command, Commands::Ports) {
        for port in available_ports()? {
            let kind = match port.kind {
                PortKind::Serial => "serial",
                PortKind::Midi => "midi",
            };
            println!("{:<7} {}", kind, port.name);
        }
        return Ok(());
    }

    let config = Config {
        timeout: Duration::from_millis(cli.timeout),
        sds_retries: cli.retries,
        ..Config::default()
    };
    let port_name = cli
        .port
        .as_deref()
        .ok_or_else(|| Error::InvalidArgument("No port given (see the ports command)".into()))?;

    let session = Session::new(open_port(&cli, port_name, &config)?, config);
    let device = handshake(&session, &cli)?;

    match cli.command {
        Commands::Ports => {}
        Commands::Info => print_info(&device),
        Commands::Ls { fs, path } => {
            let fs = filesystem(&device, &fs)?;
            for item in fs.readdir(&session, &path)? {
                let item = item?;
                let kind = if item.is_dir() { 'd' } else { '-' };
                let slot = item.slot.as_deref().unwrap_or("");
                let size = item.size.map(|s| s.to_string()).unwrap_or_default();
                println!("{} {:>4} {:>10} {}", kind, slot, size, item.name);
            }
        }
        Commands::Get { fs, path, file } => {
            let fs = filesystem(&device, &fs)?;
            let data = fs.download(&session, &path, &progress_job())?;
            std::fs::write(&file, &data)?;
            println!("Saved {} bytes to {}", data.len(), file.display());
        }
        Commands::Put { fs, file, path } => {
            let fs = filesystem(&device, &fs)?;
            let data = std::fs::read(&file)?;
            fs.upload(&session, &path, &data, &progress_job())?;
            println!("Sent {} bytes", data.len());
        }
        Commands::Mkdir { fs, path } => filesystem(&device, &fs)?.mkdir(&session, &path)?,
        Commands::Rm { fs, path } => filesystem(&device, &fs)?.delete(&session, &path)?,
        Commands::Mv { fs, from, to } => {
            let fs = filesystem(&device, &fs)?;
            if fs.supports(Operations::RENAME) && !to.contains('/') {
                fs.rename(&session, &from, &to)?;
            } else {
                fs.move_item(&session, &from, &to)?;
            }
        }
        Commands::Cp { fs, from, to } => filesystem(&device, &fs)?.copy(&session, &from, &to)?,
        Commands::Clear { fs, path } => filesystem(&device, &fs)?.clear(&session, &path)?,
        Commands::Swap { fs, a, b } => filesystem(&device, &fs)?.swap(&session, &a, &b)?,
    }

    session.close();
    Ok(())
}

fn open_port(cli: &Cli, name: &str, config: &Config) -> Result<Box<dyn MidiPort>> {
    #[cfg(feature = "midi-io")]
    if cli.midi {
        return Ok(Box::new(sysexfs::serial::MidirPort::open(name)?));
    }

    let port = SerialMidiPort::open(name, cli.baud, config.poll_interval).map_err(std::io::Error::from)?;
    Ok(Box::new(port))
}

fn handshake(session: &Session, cli: &Cli) -> Result<Device> {
    if let Some(path) = &cli.devices {
        let table = DeviceTable::parse(&std::fs::read_to_string(path)?)?;
        return ElektronConnector::with_registry(Arc::new(table)).handshake(session);
    }

    match &cli.connector {
        Some(name) => connect(session, name),
        None => autodetect(session),
    }
}

fn filesystem<'d>(device: &'d Device, name: &str) -> Result<&'d Arc<dyn Filesystem>> {
    device
        .filesystem(name)
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no '{}' filesystem", device.name, name)))
}

fn print_info(device: &Device) {
    println!("Device:    {}", device.name);
    println!("Version:   {}", device.version);
    println!("Connector: {}", device.connector);
    for fs in &device.filesystems {
        let options = fs.options();
        let addressing = if options.slots { "slots" } else { "paths" };
        println!("  {:<10} {:<6} {}", fs.name(), addressing, fs.operations());
    }
}

/// Job that draws a progress bar on stderr.
fn progress_job() -> JobControl {
    const WIDTH: usize = 40;
    JobControl::with_progress(|fraction| {
        let filled = (fraction * WIDTH as f64).round() as usize;
        eprint!("\r[{}{}] {:3.0}%", "#".repeat(filled), " ".repeat(WIDTH - filled), fraction * 100.0);
        if fraction >= 1.0 {
            eprintln!();
        }
    })
}
