use std::fmt;

/// Classification of a fatal fault, one per process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    IoWrite,
    IoRead,
    CreateDirectory,
    Download,
    MalformedInput,
    Interrupted,
    Cancelled,
    Generic,
}

impl FaultClass {
    /// Process exit code reported to the operator for this class.
    pub const fn exit_code(self) -> u8 {
        match self {
            FaultClass::Generic => 1,
            FaultClass::IoWrite => 10,
            FaultClass::IoRead => 11,
            FaultClass::CreateDirectory => 12,
            FaultClass::Download => 20,
            FaultClass::MalformedInput => 21,
            FaultClass::Interrupted => 30,
            FaultClass::Cancelled => 31,
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::IoWrite => write!(f, "io write failure"),
            FaultClass::IoRead => write!(f, "io read failure"),
            FaultClass::CreateDirectory => write!(f, "directory creation failure"),
            FaultClass::Download => write!(f, "download failure"),
            FaultClass::MalformedInput => write!(f, "malformed input"),
            FaultClass::Interrupted => write!(f, "interrupted"),
            FaultClass::Cancelled => write!(f, "cancelled"),
            FaultClass::Generic => write!(f, "generic fault"),
        }
    }
}

/// A non-retryable failure raised while processing or fetching records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct TaskFailure {
    pub class: FaultClass,
    pub message: String,
}

impl TaskFailure {
    pub fn new(class: FaultClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FaultClass::Generic, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FaultClass::MalformedInput, message)
    }

    /// Raised by a worker that stopped between items because the job was cancelled.
    pub fn interrupted() -> Self {
        Self::new(FaultClass::Interrupted, "stopped after cancellation")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::FaultClass;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let all = [
            FaultClass::IoWrite,
            FaultClass::IoRead,
            FaultClass::CreateDirectory,
            FaultClass::Download,
            FaultClass::MalformedInput,
            FaultClass::Interrupted,
            FaultClass::Cancelled,
            FaultClass::Generic,
        ];
        let codes: HashSet<u8> = all.iter().map(|c| c.exit_code()).collect();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0));
    }
}
