use std::io;

use thiserror::Error;

/// Problems with a memory image file.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported image version {0}")]
    BadVersion(u32),
    #[error("image truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("segment layout is invalid: {0}")]
    Layout(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by the VM to its host.
///
/// Guest exceptions never show up here, they are dispatched inside the
/// interpreter. A `Fatal` error means the VM state is structurally broken
/// and the process should terminate with exit code 1.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("fatal VM error: {0}")]
    Fatal(String),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings: {0}")]
    Config(&'static str),
}

pub type VmResult<T> = Result<T, VmError>;

/// Builds a [`VmError::Fatal`] and logs it on the way out.
///
/// ```ignore
/// return Err(fatal!("bad opcode {}", b));
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!(target: "squawk", "{}", msg);
        $crate::error::VmError::Fatal(msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fatal() -> VmResult<()> {
        Err(crate::fatal!("bad opcode {}", 255))
    }

    #[test]
    fn fatal_macro_builds_message() {
        let err = create_test_fatal().unwrap_err();
        assert!(matches!(err, VmError::Fatal(ref m) if m == "bad opcode 255"));
        assert_eq!(err.to_string(), "fatal VM error: bad opcode 255");
    }

    #[test]
    fn image_errors_convert() {
        let err: VmError = ImageError::BadMagic(0x1234).into();
        assert_eq!(err.to_string(), "image error: bad magic number 0x00001234");
    }
}
