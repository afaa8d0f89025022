//! Stable exit codes for taskloop CLI commands.

use crate::core::status::RunStatus;

/// Command succeeded, or the run finished with `success`.
pub const SUCCESS: i32 = 0;
/// The run ended `blocked` or `failed`, or the command itself errored.
pub const BLOCKED: i32 = 1;
/// The run was paused, stopped, or interrupted and can be picked up again.
pub const INTERRUPTED: i32 = 2;

/// Exit code for a run that returned with `status`.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => SUCCESS,
        RunStatus::Paused | RunStatus::Stopped => INTERRUPTED,
        RunStatus::Blocked | RunStatus::Failed | RunStatus::Planning | RunStatus::Working => BLOCKED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_codes() {
        assert_eq!(for_status(RunStatus::Success), SUCCESS);
        assert_eq!(for_status(RunStatus::Paused), INTERRUPTED);
        assert_eq!(for_status(RunStatus::Stopped), INTERRUPTED);
        assert_eq!(for_status(RunStatus::Blocked), BLOCKED);
        assert_eq!(for_status(RunStatus::Failed), BLOCKED);
    }
}
