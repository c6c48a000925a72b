//! Startup privilege check.
//!
//! Creating tunnel interfaces needs root, so the daemon refuses to start
//! without it instead of failing on every helper launch.

/// The daemon was started without the privilege it needs.
#[derive(Debug, thiserror::Error)]
#[error("Please run as root (sudo devtunneld run)")]
pub struct PrivilegeMissing;

/// Check if the current process is running as root.
#[cfg(unix)]
pub fn is_privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Non-unix platforms are not checked.
#[cfg(not(unix))]
pub const fn is_privileged() -> bool {
    true
}

pub fn ensure_privileged() -> Result<(), PrivilegeMissing> {
    if is_privileged() {
        Ok(())
    } else {
        Err(PrivilegeMissing)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn check_agrees_with_effective_uid() {
        let root = nix::unistd::geteuid().is_root();
        assert_eq!(ensure_privileged().is_ok(), root);
    }
}
