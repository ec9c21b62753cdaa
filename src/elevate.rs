//! Privilege preflight and elevated re-execution
//!
//! Device self-allocation needs root (module loading and the loopback
//! control ioctls). The pipeline itself never forks: `needs_elevation` is a
//! plain preflight check, and the outer orchestrator decides whether to
//! hand the whole run to an elevated child via `reexec_elevated`.

use crate::error::Result;
use std::process::{Command, ExitStatus};
use tracing::info;

const ELEVATION_HELPER: &str = "pkexec";

/// Whether the current process lacks the privilege device provisioning needs
pub fn needs_elevation() -> bool {
    unsafe { libc::geteuid() } != 0
}

/// Re-execute this binary with the original arguments under the elevation
/// helper, block until the child finishes, and return its exit code. On
/// success the child performs the entire run; the caller must exit with the
/// returned code and do no further work.
pub fn reexec_elevated() -> Result<i32> {
    let exe = std::env::current_exe()?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    info!(
        "Device provisioning requires elevation, re-executing via {}",
        ELEVATION_HELPER
    );
    let status = Command::new(ELEVATION_HELPER).arg(&exe).args(&args).status()?;
    Ok(exit_code(status))
}

/// Map a child exit status to our own: termination by signal is nonzero.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn exit_codes_propagate() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        // wait(2) encoding: normal exit code lives in the high byte
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    }

    #[test]
    fn signal_termination_maps_to_failure() {
        // killed by SIGKILL: no exit code
        let status = ExitStatus::from_raw(9);
        assert_eq!(status.code(), None);
        assert_eq!(exit_code(status), 1);
    }
}
