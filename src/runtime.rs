//! Platform-specific process and filesystem operations
//!
//! Everything that differs between operating systems sits behind
//! [`ProcessRuntime`]. One implementation is picked at startup with
//! [`detect`] and shared by the supervisor, the build pipeline and the
//! proxy control plane.

use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Child;

pub trait ProcessRuntime: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Ask a child to shut down gracefully
    fn terminate(&self, child: &mut Child) -> io::Result<()>;

    /// Link `src` into `dst` as a directory link
    fn link_dir(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Resolve a program name to what should be passed to `Command::new`
    fn resolve_program(&self, program: &str) -> String {
        program.to_string()
    }

    /// Command used to reload the reverse proxy when none is configured
    fn default_reload_command(&self) -> Vec<String> {
        vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()]
    }
}

/// Unix: SIGTERM for graceful stop, symlinks for shared dependencies
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct UnixRuntime;

#[cfg(unix)]
impl ProcessRuntime for UnixRuntime {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    fn link_dir(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(src, dst)
    }
}

/// Fallback for platforms without POSIX signals. Termination is a hard kill
#[derive(Debug, Default)]
pub struct GenericRuntime;

impl ProcessRuntime for GenericRuntime {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        match child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    #[cfg(windows)]
    fn link_dir(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::os::windows::fs::symlink_dir(src, dst)
    }

    #[cfg(unix)]
    fn link_dir(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(src, dst)
    }

    #[cfg(not(any(unix, windows)))]
    fn link_dir(&self, _src: &Path, _dst: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "directory links are not supported on this platform",
        ))
    }

    fn resolve_program(&self, program: &str) -> String {
        if cfg!(windows) && matches!(program, "npm" | "npx" | "yarn" | "pnpm") {
            format!("{}.cmd", program)
        } else {
            program.to_string()
        }
    }
}

/// Select the runtime for the current platform
pub fn detect() -> Arc<dyn ProcessRuntime> {
    #[cfg(unix)]
    {
        Arc::new(UnixRuntime)
    }

    #[cfg(not(unix))]
    {
        Arc::new(GenericRuntime)
    }
}
