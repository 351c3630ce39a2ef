//! Background operation: double-fork detach and the PID file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;

/// Detach from the controlling terminal: fork, become a session leader,
/// fork again and point stdio at /dev/null.  Returns in the grandchild;
/// the intermediate processes exit cleanly.
pub fn daemonize() -> Result<()> {
	fork_and_exit_parent()?;
	if unsafe { libc::setsid() } < 0 {
		bail!(
			"creating session failed: {}",
			io::Error::last_os_error()
		);
	}
	fork_and_exit_parent()?;

	let devnull = unsafe {
		libc::open(
			b"/dev/null\0".as_ptr() as *const libc::c_char,
			libc::O_RDWR,
		)
	};
	if devnull < 0 {
		bail!("opening /dev/null failed: {}", io::Error::last_os_error());
	}
	unsafe {
		libc::dup2(devnull, 0);
		libc::dup2(devnull, 1);
		libc::dup2(devnull, 2);
		if devnull > 2 {
			libc::close(devnull);
		}
	}
	Ok(())
}

fn fork_and_exit_parent() -> Result<()> {
	match unsafe { libc::fork() } {
		-1 => bail!("fork failed: {}", io::Error::last_os_error()),
		0 => Ok(()),
		_ => std::process::exit(0),
	}
}

/// The daemon's PID file; removed again when the value drops.
pub struct PidFile {
	path: PathBuf,
}

impl PidFile {
	pub fn create(path: &Path) -> Result<PidFile> {
		let pid = unsafe { libc::getpid() };
		fs::write(path, format!("{}\n", pid))
			.with_context(|| format!("writing PID file {}", path.display()))?;
		Ok(PidFile {
			path: path.to_path_buf(),
		})
	}
}

impl Drop for PidFile {
	fn drop(&mut self) {
		if let Err(err) = fs::remove_file(&self.path) {
			warn!("error removing PID file {}: {}", self.path.display(), err);
		}
	}
}
