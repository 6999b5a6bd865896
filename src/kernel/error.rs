use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A guest kernel result word, as returned in `w0` from a supervisor call.
///
/// Layout is `module | description << 9`; every code produced here belongs to
/// the kernel module (1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResultCode(u32);

impl ResultCode {
    const KERNEL_MODULE: u32 = 1;

    pub const SUCCESS: Self = Self(0);
    pub const TERMINATION_REQUESTED: Self = Self::kernel(59);
    pub const OUT_OF_RESOURCE: Self = Self::kernel(103);
    pub const OUT_OF_HANDLES: Self = Self::kernel(105);
    pub const INVALID_PRIORITY: Self = Self::kernel(112);
    pub const INVALID_CORE_ID: Self = Self::kernel(113);
    pub const INVALID_HANDLE: Self = Self::kernel(114);
    pub const INVALID_COMBINATION: Self = Self::kernel(116);
    pub const TIMED_OUT: Self = Self::kernel(117);
    pub const CANCELLED: Self = Self::kernel(118);
    pub const OUT_OF_RANGE: Self = Self::kernel(119);
    pub const INVALID_ENUM_VALUE: Self = Self::kernel(120);
    pub const INVALID_STATE: Self = Self::kernel(125);
    pub const LIMIT_REACHED: Self = Self::kernel(132);

    const fn kernel(description: u32) -> Self {
        Self(Self::KERNEL_MODULE | (description << 9))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    pub const fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    pub const fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:X} ({}-{:04})",
            self.0,
            2000 + self.module(),
            self.description()
        )
    }
}

/// Errors a guest can provoke through the supervisor-call interface.
///
/// None of these are fatal to the host; each one is reported back to the guest
/// as its [`ResultCode`]. Corruption of scheduler bookkeeping is not modelled
/// here, see [`crate::invariant_violation!`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("invalid handle 0x{0:X}")]
    InvalidHandle(u32),

    #[error("priority {0} is outside the guest range")]
    InvalidPriority(u32),

    #[error("core {0} does not exist or is not permitted")]
    InvalidCoreId(i32),

    #[error("invalid argument combination: {0}")]
    InvalidCombination(&'static str),

    #[error("value out of range: {0}")]
    OutOfRange(&'static str),

    #[error("object is in the wrong state: {0}")]
    InvalidState(&'static str),

    #[error("mutex released by a thread that does not own it")]
    NotOwner,

    #[error("thread attempted to re-acquire a mutex it already owns")]
    ReentrantLock,

    #[error("handle table is full")]
    OutOfHandles,

    #[error("host resource exhausted: {0}")]
    OutOfResource(&'static str),

    #[error("resource limit reached: {0}")]
    LimitReached(&'static str),

    #[error("wait was cancelled")]
    Cancelled,

    #[error("thread termination was requested")]
    TerminationRequested,

    #[error("unknown supervisor call 0x{0:02X}")]
    UnknownSupervisorCall(u32),
}

impl KernelError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            KernelError::InvalidHandle(_) => ResultCode::INVALID_HANDLE,
            KernelError::InvalidPriority(_) => ResultCode::INVALID_PRIORITY,
            KernelError::InvalidCoreId(_) => ResultCode::INVALID_CORE_ID,
            KernelError::InvalidCombination(_) => ResultCode::INVALID_COMBINATION,
            KernelError::OutOfRange(_) => ResultCode::OUT_OF_RANGE,
            KernelError::InvalidState(_)
            | KernelError::NotOwner
            | KernelError::ReentrantLock => ResultCode::INVALID_STATE,
            KernelError::OutOfHandles => ResultCode::OUT_OF_HANDLES,
            KernelError::OutOfResource(_) => ResultCode::OUT_OF_RESOURCE,
            KernelError::LimitReached(_) => ResultCode::LIMIT_REACHED,
            KernelError::Cancelled => ResultCode::CANCELLED,
            KernelError::TerminationRequested => ResultCode::TERMINATION_REQUESTED,
            KernelError::UnknownSupervisorCall(_) => ResultCode::INVALID_ENUM_VALUE,
        }
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> Self {
        err.result_code()
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// How a successful wait ended. A timeout is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitOutcome {
    /// The object at `index` in the wait list satisfied the wait.
    Signaled { index: usize },
    TimedOut,
}

impl WaitOutcome {
    pub fn is_signaled(self) -> bool {
        matches!(self, WaitOutcome::Signaled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_layout() {
        assert_eq!(ResultCode::TIMED_OUT.raw(), 0xEA01);
        assert_eq!(ResultCode::INVALID_HANDLE.raw(), 0xE401);
        assert_eq!(ResultCode::CANCELLED.raw(), 0xEC01);
        assert_eq!(ResultCode::TIMED_OUT.module(), 1);
        assert_eq!(ResultCode::TIMED_OUT.description(), 117);
        assert_eq!(ResultCode::TIMED_OUT.to_string(), "0xEA01 (2001-0117)");
    }

    #[test]
    fn test_errors_map_to_guest_codes() {
        assert_eq!(
            KernelError::ReentrantLock.result_code(),
            ResultCode::INVALID_STATE
        );
        assert_eq!(
            ResultCode::from(KernelError::InvalidHandle(0xD000)),
            ResultCode::INVALID_HANDLE
        );
        assert!(!KernelError::Cancelled.result_code().is_success());
    }
}
