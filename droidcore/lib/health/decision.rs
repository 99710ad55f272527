use crate::cvd::FleetStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What the toolchain listing says about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolchainSignal {
    /// Listed as running.
    Running,

    /// Listed as cleanly stopped.
    Stopped,

    /// Listed with any other status, or not listed at all.
    Ambiguous,
}

/// The liveness classification of one sandbox for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Alive. `reset_failures` is false when only the VM process vouches for it.
    Running {
        /// Whether the consecutive failure counter is cleared
        reset_failures: bool,
    },

    /// Every signal is negative.
    Stopped,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ToolchainSignal {
    /// Whether the direct probes are needed to decide.
    pub fn is_ambiguous(self) -> bool {
        self == ToolchainSignal::Ambiguous
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Classifies a sandbox from its three liveness signals, most trusted first.
///
/// `device` is the device endpoint probe and `process` the VM process probe; `None` means the
/// probe was not run.
pub fn classify(toolchain: ToolchainSignal, device: Option<bool>, process: Option<bool>) -> Verdict {
    match (toolchain, device, process) {
        (ToolchainSignal::Running, _, _) => Verdict::Running {
            reset_failures: true,
        },
        (ToolchainSignal::Stopped, _, _) => Verdict::Stopped,
        (ToolchainSignal::Ambiguous, Some(true), _) => Verdict::Running {
            reset_failures: true,
        },
        (ToolchainSignal::Ambiguous, _, Some(true)) => Verdict::Running {
            reset_failures: false,
        },
        (ToolchainSignal::Ambiguous, _, _) => Verdict::Stopped,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<Option<&FleetStatus>> for ToolchainSignal {
    fn from(status: Option<&FleetStatus>) -> Self {
        match status {
            Some(FleetStatus::Running) => ToolchainSignal::Running,
            Some(FleetStatus::Stopped) => ToolchainSignal::Stopped,
            Some(FleetStatus::Other(_)) | None => ToolchainSignal::Ambiguous,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_table() {
        use ToolchainSignal::*;

        let running = Verdict::Running {
            reset_failures: true,
        };
        let booting = Verdict::Running {
            reset_failures: false,
        };

        assert_eq!(classify(Running, None, None), running);
        assert_eq!(classify(Running, Some(false), Some(false)), running);
        assert_eq!(classify(Stopped, Some(true), Some(true)), Verdict::Stopped);
        assert_eq!(classify(Ambiguous, Some(true), None), running);
        assert_eq!(classify(Ambiguous, Some(false), Some(true)), booting);
        assert_eq!(classify(Ambiguous, Some(false), Some(false)), Verdict::Stopped);
        assert_eq!(classify(Ambiguous, None, None), Verdict::Stopped);
    }

    #[test]
    fn test_signal_from_status() {
        let cancelled = FleetStatus::Other("Cancelled".to_string());
        assert_eq!(ToolchainSignal::from(Some(&FleetStatus::Running)), ToolchainSignal::Running);
        assert_eq!(ToolchainSignal::from(Some(&FleetStatus::Stopped)), ToolchainSignal::Stopped);
        assert!(ToolchainSignal::from(Some(&cancelled)).is_ambiguous());
        assert!(ToolchainSignal::from(None).is_ambiguous());
    }
}
