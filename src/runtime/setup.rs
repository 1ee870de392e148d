use anyhow::Error as AnyError;

/// Component whose one-time setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupTarget {
    Reader,
    Handler,
}

/// Raised when a collaborator's `setup` hook fails. The original error stays
/// reachable through [`std::error::Error::source`].
#[derive(Debug)]
pub struct NotInitializedError {
    target: SetupTarget,
    source: AnyError,
}

impl NotInitializedError {
    pub fn new(target: SetupTarget, source: AnyError) -> Self {
        Self { target, source }
    }

    pub fn target(&self) -> SetupTarget {
        self.target
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for NotInitializedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "the proper initialization has not occurred ({:?} setup failed)",
            self.target
        )
    }
}

impl std::error::Error for NotInitializedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
