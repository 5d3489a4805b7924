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

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use sbp_fileio::{bootloader, BootloaderConfig, FileIo, TransferConfig, WriteOptions};
use sbp_fileio::serial::SerialLink;
use tracing::Level;

#[derive(Parser)]
#[command(name = "sbp-fileio")]
#[command(about = "File transfer and bootloader handshake for GNSS receivers over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Use RTS/CTS hardware flow control
    #[arg(long)]
    flow_control: bool,

    /// Requests kept in flight at once
    #[arg(long, default_value = "10", value_name = "N")]
    window: usize,

    /// Milliseconds before an unanswered request is resent
    #[arg(long, default_value = "1000", value_name = "MS")]
    timeout_ms: u64,

    /// Resends per request before giving up
    #[arg(long, default_value = "3")]
    retries: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a file from the device
    Read {
        /// Path on the device
        remote: String,
        /// Local file to write; prints to stdout when omitted
        local: Option<PathBuf>,
    },
    /// Write a local file to the device
    Write {
        /// Local file to send
        local: PathBuf,
        /// Path on the device
        remote: String,
    },
    /// List a directory on the device
    List {
        #[arg(default_value = ".")]
        dir: String,
    },
    /// Remove a file from the device
    Delete {
        remote: String,
    },
    /// Reset the device and complete the bootloader handshake
    Handshake {
        /// Give up after this many seconds instead of waiting indefinitely
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Start the application once the handshake completes
        #[arg(long)]
        jump: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    if cli.window == 0 {
        eprintln!("Error: window must be at least 1");
        std::process::exit(1);
    }

    let config = TransferConfig {
        window: cli.window,
        timeout: Duration::from_millis(cli.timeout_ms),
        max_retries: cli.retries,
        ..TransferConfig::default()
    };

    eprintln!("Opening serial port: {} at {} baud", cli.port, cli.baud);
    let link = match SerialLink::open(&cli.port, cli.baud, cli.flow_control) {
        Ok(link) => link,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&link, config, cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(link: &SerialLink, config: TransferConfig, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    if let Commands::Handshake { timeout, jump } = command {
        let info = bootloader::handshake(link, BootloaderConfig::default(), timeout.map(Duration::from_secs), jump)?;
        println!("Bootloader version: {} (protocol {})", info.version, info.protocol_version);
        return Ok(());
    }

    let mut fileio = FileIo::new(link, config);
    fileio.negotiate()?;

    match command {
        Commands::Read { remote, local } => {
            let data = fileio.read(&remote)?;
            match local {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    eprintln!("Read {} bytes into {}", data.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Commands::Write { local, remote } => {
            let data = std::fs::read(&local)?;
            fileio.write(&remote, &data, WriteOptions::default())?;
            eprintln!("Wrote {} bytes to {}", data.len(), remote);
        }
        Commands::List { dir } => {
            for name in fileio.list_dir(&dir)? {
                println!("{}", name);
            }
        }
        Commands::Delete { remote } => {
            fileio.remove(&remote)?;
        }
        Commands::Handshake { .. } => {}
    }
    Ok(())
}
