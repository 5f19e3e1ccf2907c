// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::{Error, Result};

/// The externally observable state of an asynchronous operation or component.
///
/// Any value other than [`Status::NotStarted`] or [`Status::Pending`] guarantees that the
/// operation has completed, which makes polling `status()` reliable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not started since creation or the last reuse.
    #[default]
    NotStarted,

    /// Started and not yet completed.
    Pending,

    /// Completed successfully.
    Success,

    /// Completed unsuccessfully.
    Failed(Error),
}

impl Status {
    /// Whether the operation has been started and has not yet completed.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Whether the operation completed successfully.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether the operation has reached a terminal status.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Failed(_))
    }

    /// The outcome of a completed operation, or `None` if it has not completed.
    #[must_use]
    pub const fn outcome(self) -> Option<Result<()>> {
        match self {
            Self::Success => Some(Ok(())),
            Self::Failed(error) => Some(Err(error)),
            Self::NotStarted | Self::Pending => None,
        }
    }
}

impl From<Result<()>> for Status {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(error) => Self::Failed(error),
        }
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        Self::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_values_are_completed() {
        assert!(!Status::NotStarted.is_completed());
        assert!(!Status::Pending.is_completed());
        assert!(Status::Success.is_completed());
        assert!(Status::Failed(Error::Cancelled).is_completed());
    }

    #[test]
    fn outcome_maps_terminal_values() {
        assert_eq!(Status::Pending.outcome(), None);
        assert_eq!(Status::Success.outcome(), Some(Ok(())));
        assert_eq!(
            Status::Failed(Error::ShutdownPending).outcome(),
            Some(Err(Error::ShutdownPending))
        );
        assert_eq!(Status::from(Err(Error::Failed(3))), Status::Failed(Error::Failed(3)));
    }
}
