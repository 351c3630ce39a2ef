//! Command line surface.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

pub const DEFAULT_PORT: u16 = 55825;

/// Share a DALI bus on a USB adapter between TCP clients.
#[derive(Parser, Debug)]
#[command(name = "daliserver", version, about)]
pub struct Options {
	/// Address to listen on
	#[arg(short = 'l', value_name = "ADDRESS", default_value = "127.0.0.1")]
	pub listen_address: Ipv4Addr,

	/// Port to listen on
	#[arg(short = 'p', value_name = "PORT", default_value_t = DEFAULT_PORT)]
	pub port: u16,

	/// Log level
	#[arg(short = 'd', value_name = "LEVEL", default_value = "info")]
	pub log_level: LogLevel,

	/// Run without USB hardware and answer every request with a fake
	/// response
	#[arg(short = 'n')]
	pub dry_run: bool,

	/// Detach from the terminal and run in the background
	#[arg(short = 'b')]
	pub daemonize: bool,

	/// PID file written when running in the background
	#[arg(
		short = 'r',
		value_name = "FILE",
		default_value = "/var/run/daliserver.pid"
	)]
	pub pid_file: PathBuf,

	/// Write the log to this file instead of stderr
	#[arg(short = 'f', value_name = "FILE")]
	pub log_file: Option<PathBuf>,

	/// Log through syslog
	#[arg(short = 's')]
	pub syslog: bool,

	/// Use the adapter at this bus:device address instead of scanning for
	/// a matching product id
	#[arg(short = 'u', value_name = "BUS:DEV", value_parser = parse_usb_address)]
	pub usb_device: Option<(u8, u8)>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
	Fatal,
	Error,
	Warn,
	Info,
	Debug,
}

impl LogLevel {
	pub fn to_filter(self) -> LevelFilter {
		match self {
			// The log facade has no fatal level; fatal conditions are
			// errors that end the process.
			LogLevel::Fatal => LevelFilter::Error,
			LogLevel::Error => LevelFilter::Error,
			LogLevel::Warn => LevelFilter::Warn,
			LogLevel::Info => LevelFilter::Info,
			LogLevel::Debug => LevelFilter::Debug,
		}
	}
}

fn parse_usb_address(value: &str) -> Result<(u8, u8), String> {
	let (bus, device) = value
		.split_once(':')
		.ok_or_else(|| format!("expected BUS:DEV, got `{}`", value))?;
	let bus: u8 = bus
		.parse()
		.map_err(|_| format!("invalid bus number `{}`", bus))?;
	let device: u8 = device
		.parse()
		.map_err(|_| format!("invalid device number `{}`", device))?;
	Ok((bus, device))
}
