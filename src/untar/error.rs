use std::path::PathBuf;

/// Errors of the extraction engine.
///
/// Every variant maps to a stable status code (see [`UntarError::code`]) which
/// is what the restore session ultimately reports.
#[derive(thiserror::Error, Debug)]
pub enum UntarError {
    #[error("invalid parameter: {0}")]
    Param(String),
    #[error("path does not exist: {0:?}")]
    NotExist(PathBuf),
    #[error("invalid archive format: {0}")]
    Format(String),
    #[error("unable to allocate extension buffer: {0}")]
    Alloc(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("extraction aborted")]
    Aborted,
}

pub const ERR_PARAM: i32 = -1;
pub const ERR_NOEXIST: i32 = -2;
pub const ERR_FORMAT: i32 = -3;
pub const ERR_MALLOC: i32 = -4;
pub const ERR_IO: i32 = -5;
pub const ERR_ABORTED: i32 = -6;

impl UntarError {
    /// The status code handed back to the restore session.
    pub fn code(&self) -> i32 {
        match self {
            UntarError::Param(_) => ERR_PARAM,
            UntarError::NotExist(_) => ERR_NOEXIST,
            UntarError::Format(_) => ERR_FORMAT,
            UntarError::Alloc(_) => ERR_MALLOC,
            UntarError::Io(_) => ERR_IO,
            UntarError::Aborted => ERR_ABORTED,
        }
    }
}

impl From<nix::Error> for UntarError {
    fn from(err: nix::Error) -> Self {
        UntarError::Io(std::io::Error::from(err))
    }
}

/// Map an operation result to a status code, `0` meaning success.
pub fn status_code<T>(result: &Result<T, UntarError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.code(),
    }
}

macro_rules! format_bail {
    ($($fmt:tt)+) => {
        return Err($crate::untar::UntarError::Format(format!($($fmt)+)))
    };
}
pub(crate) use format_bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&Ok::<(), UntarError>(())), 0);
        assert_eq!(UntarError::Param("x".into()).code(), -1);
        assert_eq!(UntarError::NotExist("/nope".into()).code(), -2);
        assert_eq!(UntarError::Format("bad magic".into()).code(), -3);
        assert_eq!(UntarError::Alloc("too long".into()).code(), -4);
        assert_eq!(
            UntarError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).code(),
            -5
        );
        assert_eq!(UntarError::from(nix::errno::Errno::ENOSPC).code(), -5);
        assert_eq!(UntarError::Aborted.code(), -6);
    }
}
