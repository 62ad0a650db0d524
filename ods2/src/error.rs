use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// 驱动各层共用的状态码，错误原样向上传递
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such device")]
    NoSuchDevice,
    #[error("no such volume")]
    NoSuchVolume,
    #[error("no such file")]
    NoSuchFile,
    /// 通配搜索已经穷尽，并不是真正的错误
    #[error("no more files")]
    NoMoreFiles,
    #[error("bad file name syntax")]
    BadFileName,
    #[error("bad parameter value")]
    BadParameter,
    #[error("file is not a directory")]
    BadDirectory,
    #[error("write locked")]
    WriteLocked,
    #[error("file is locked by another opener")]
    FileLocked,
    #[error("duplicate file name")]
    DuplicateFileName,
    #[error("data check: checksum or format mismatch")]
    DataCheck,
    #[error("insufficient memory")]
    InsufficientMemory,
    #[error("end of file")]
    EndOfFile,
    #[error("device has open files and cannot be dismounted")]
    DeviceNotDismounted,
    #[error("device is already mounted")]
    DeviceMounted,
    #[error("no free space on device")]
    DeviceFull,
    #[error("directory record does not fit in a block")]
    DirectoryFull,
    #[error("internal consistency check failed: {0}")]
    BugCheck(&'static str),
    #[error("device I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::InsufficientMemory
    }
}

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        log::debug!("structure decode failed: {e}");
        Error::DataCheck
    }
}
