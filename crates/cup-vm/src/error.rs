//! Status codes and error types.

use thiserror::Error;

/// Non-ok half of the status channel, carried in `Err`. The error value
/// itself travels on the raising thread's stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Throw {
    /// Suspension of a coroutine. Not a fault.
    #[error("yield")]
    Yield,
    #[error("runtime error")]
    Runtime,
    #[error("syntax error")]
    Syntax,
    #[error("not enough memory")]
    Memory,
    #[error("error in error handling")]
    ErrErr,
}

pub type VmResult<T> = Result<T, Throw>;

/// Thread and protected-call status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Ok,
    Yield,
    ErrRun,
    ErrSyntax,
    ErrMem,
    ErrErr,
}

impl Status {
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }

    pub fn as_throw(self) -> Option<Throw> {
        match self {
            Status::Ok => None,
            Status::Yield => Some(Throw::Yield),
            Status::ErrRun => Some(Throw::Runtime),
            Status::ErrSyntax => Some(Throw::Syntax),
            Status::ErrMem => Some(Throw::Memory),
            Status::ErrErr => Some(Throw::ErrErr),
        }
    }

    pub fn from_result(r: VmResult<()>) -> Status {
        match r {
            Ok(()) => Status::Ok,
            Err(t) => t.into(),
        }
    }
}

impl From<Throw> for Status {
    fn from(t: Throw) -> Self {
        match t {
            Throw::Yield => Status::Yield,
            Throw::Runtime => Status::ErrRun,
            Throw::Syntax => Status::ErrSyntax,
            Throw::Memory => Status::ErrMem,
            Throw::ErrErr => Status::ErrErr,
        }
    }
}

/// Error surfaced to embedding hosts by [`crate::vm::Vm::pcall_function`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CupError {
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Syntax(String),
    #[error("not enough memory")]
    Memory,
    #[error("error in error handling")]
    ErrorInErrorHandling,
    /// Error object that is neither a string nor a number.
    #[error("error object is a {0} value")]
    Value(&'static str),
}
