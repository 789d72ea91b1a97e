// error types for cpu-level operations

use std::{error::Error, fmt, io};

#[derive(Debug)]
#[non_exhaustive]
pub enum CpuError {
    // i/o or system call error
    Io(io::Error),

    // operation not supported on this platform
    NotSupported,

    // invalid cpu id
    InvalidCpu { cpu: usize, max: usize },
}

impl fmt::Display for CpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuError::Io(err) => write!(f, "I/O error: {}", err),
            CpuError::NotSupported => {
                write!(f, "CPU affinity is not supported on this platform")
            }
            CpuError::InvalidCpu { cpu, max } => {
                write!(f, "CPU {} is invalid (max CPU is {})", cpu, max)
            }
        }
    }
}

impl Error for CpuError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CpuError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CpuError {
    fn from(err: io::Error) -> Self {
        CpuError::Io(err)
    }
}
