//! VM lifecycle states.
//!
//! States are bits so composite guards stay cheap: a relaunch is legal
//! from `QUIT | ERROR`, and `state & RUNNING` answers "is it live"
//! without enumerating.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a VM instance.
///
/// `ERROR` is sticky: nothing clears it except a successful relaunch,
/// which transitions `QUIT | ERROR` back to `BUILDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmState(u32);

impl VmState {
    /// Configured but not yet launched (or relaunching).
    pub const BUILDING: VmState = VmState(1 << 0);
    /// QEMU is live and vCPUs are executing.
    pub const RUNNING: VmState = VmState(1 << 1);
    /// QEMU is live but vCPUs are stopped.
    pub const PAUSED: VmState = VmState(1 << 2);
    /// QEMU exited (cleanly or via an operator kill).
    pub const QUIT: VmState = VmState(1 << 3);
    /// A launch or control-channel failure occurred; sticky.
    pub const ERROR: VmState = VmState(1 << 4);

    /// True if any bit of `mask` is set in `self`.
    pub fn intersects(self, mask: VmState) -> bool {
        self.0 & mask.0 != 0
    }

    /// True if the VM may be (re)launched from this state.
    pub fn can_launch(self) -> bool {
        self == Self::BUILDING || self.intersects(Self::QUIT | Self::ERROR)
    }
}

impl std::ops::BitOr for VmState {
    type Output = VmState;

    fn bitor(self, rhs: VmState) -> VmState {
        VmState(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for VmState {
    type Output = VmState;

    fn bitand(self, rhs: VmState) -> VmState {
        VmState(self.0 & rhs.0)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::BUILDING => "BUILDING",
            Self::RUNNING => "RUNNING",
            Self::PAUSED => "PAUSED",
            Self::QUIT => "QUIT",
            Self::ERROR => "ERROR",
            _ => return write!(f, "VmState({:#b})", self.0),
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_bit_test() {
        assert!(VmState::RUNNING.intersects(VmState::RUNNING));
        assert!(!VmState::PAUSED.intersects(VmState::RUNNING));
    }

    #[test]
    fn relaunch_only_from_quit_or_error() {
        assert!(VmState::BUILDING.can_launch());
        assert!(VmState::QUIT.can_launch());
        assert!(VmState::ERROR.can_launch());
        assert!(!VmState::RUNNING.can_launch());
        assert!(!VmState::PAUSED.can_launch());
    }

    #[test]
    fn states_are_mutually_exclusive_bits() {
        // RUNNING and PAUSED can never be confused by a mask test.
        assert!(!(VmState::RUNNING & VmState::PAUSED).intersects(VmState::RUNNING | VmState::PAUSED));
    }
}
