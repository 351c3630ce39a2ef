//! Log setup: stderr by default, a reopenable file with `-f`, syslog with
//! `-s`.
//!
//! SIGHUP only sets a flag; [reopen] runs later on the dispatcher thread,
//! swaps in a fresh file handle and lets a rotated logfile go.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use env_logger::{Builder, Target};
use log::info;

use crate::config::Options;

static LOG_SINK: Mutex<Option<ReopenableFile>> = Mutex::new(None);

/// A log target whose underlying file can be swapped out at runtime.
#[derive(Clone)]
struct ReopenableFile {
	path: PathBuf,
	file: Arc<Mutex<File>>,
}

impl ReopenableFile {
	fn open(path: &Path) -> io::Result<ReopenableFile> {
		Ok(ReopenableFile {
			path: path.to_path_buf(),
			file: Arc::new(Mutex::new(Self::open_file(path)?)),
		})
	}

	fn open_file(path: &Path) -> io::Result<File> {
		OpenOptions::new().create(true).append(true).open(path)
	}

	fn reopen(&self) -> io::Result<()> {
		let fresh = Self::open_file(&self.path)?;
		*self.file.lock().unwrap() = fresh;
		Ok(())
	}
}

impl Write for ReopenableFile {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.file.lock().unwrap().write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.lock().unwrap().flush()
	}
}

pub fn init(options: &Options) -> Result<()> {
	let filter = options.log_level.to_filter();
	if options.syslog {
		syslog::init(filter).context("installing syslog logger")?;
		return Ok(());
	}
	let mut builder = Builder::new();
	builder.filter_level(filter);
	if let Some(path) = &options.log_file {
		let sink = ReopenableFile::open(path)
			.with_context(|| format!("opening log file {}", path.display()))?;
		*LOG_SINK.lock().unwrap() = Some(sink.clone());
		builder.target(Target::Pipe(Box::new(sink)));
	}
	builder.init();
	Ok(())
}

/// Reopen the logfile (SIGHUP).  A no-op for stderr and syslog logging.
pub fn reopen() {
	let sink = LOG_SINK.lock().unwrap();
	if let Some(sink) = sink.as_ref() {
		match sink.reopen() {
			Ok(()) => info!("log file reopened"),
			Err(err) => eprintln!("error reopening log file: {}", err),
		}
	}
}

mod syslog {
	//! Minimal syslog(3) backend for the log facade.

	use std::ffi::CString;

	use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

	struct Syslog {
		filter: LevelFilter,
	}

	impl Log for Syslog {
		fn enabled(&self, metadata: &Metadata) -> bool {
			metadata.level() <= self.filter
		}

		fn log(&self, record: &Record) {
			if !self.enabled(record.metadata()) {
				return;
			}
			let priority = match record.level() {
				Level::Error => libc::LOG_ERR,
				Level::Warn => libc::LOG_WARNING,
				Level::Info => libc::LOG_INFO,
				Level::Debug | Level::Trace => libc::LOG_DEBUG,
			};
			if let Ok(message) = CString::new(record.args().to_string()) {
				unsafe {
					libc::syslog(
						priority,
						b"%s\0".as_ptr() as *const libc::c_char,
						message.as_ptr(),
					);
				}
			}
		}

		fn flush(&self) {}
	}

	pub fn init(filter: LevelFilter) -> Result<(), SetLoggerError> {
		unsafe {
			libc::openlog(
				b"daliserver\0".as_ptr() as *const libc::c_char,
				libc::LOG_PID,
				libc::LOG_DAEMON,
			);
		}
		log::set_boxed_logger(Box::new(Syslog { filter }))?;
		log::set_max_level(filter);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Read;

	#[test]
	fn test_reopenable_file_survives_rotation() {
		let dir = std::env::temp_dir().join(format!("daliserver-log-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("test.log");

		let mut sink = ReopenableFile::open(&path).unwrap();
		sink.write_all(b"before\n").unwrap();

		// Rotate: move the file away, reopen, write again.
		let rotated = dir.join("test.log.1");
		std::fs::rename(&path, &rotated).unwrap();
		sink.reopen().unwrap();
		sink.write_all(b"after\n").unwrap();
		sink.flush().unwrap();

		let mut fresh = String::new();
		File::open(&path)
			.unwrap()
			.read_to_string(&mut fresh)
			.unwrap();
		assert_eq!(fresh, "after\n");

		let mut old = String::new();
		File::open(&rotated)
			.unwrap()
			.read_to_string(&mut old)
			.unwrap();
		assert_eq!(old, "before\n");

		std::fs::remove_dir_all(&dir).unwrap();
	}
}
