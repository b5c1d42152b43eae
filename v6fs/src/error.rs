use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 文件系统层面的错误。
///
/// 资源耗尽（`NoSpace`/`NoMem`/`FileTooLarge`）在挂载边界换算成 errno；
/// `LogCorrupt` 在重放时表示日志到头，属于正常结束。
/// 逻辑错误（对非目录 lookup、释放坏块号等）不在此列，直接 panic。
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}: no space left on device")]
    NoSpace(&'static str),

    #[error("{0}: cache full")]
    NoMem(&'static str),

    #[error("{0}: maximum file size exceeded")]
    FileTooLarge(&'static str),

    #[error("log corrupt: {0}")]
    LogCorrupt(&'static str),

    #[error("{0}: alignment error")]
    Alignment(&'static str),

    #[error("{0}: index out of range")]
    OutOfRange(&'static str),

    #[error("{0}")]
    Format(&'static str),

    #[error("file system not cleanly unmounted")]
    Unclean,

    #[error("not a directory")]
    NotDir,

    #[error("no such file or directory")]
    NoEnt,

    #[error("permission denied")]
    Acces,

    #[error("file exists")]
    Exist,

    #[error("file name too long")]
    NameTooLong,

    #[error("invalid argument")]
    Inval,

    #[error("directory not empty")]
    NotEmpty,

    #[error("too many links")]
    TooManyLinks,
}

impl Error {
    /// 供 VFS 边界使用的负 errno
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => -e.raw_os_error().unwrap_or(5),
            Error::NoSpace(_) => -28,      // ENOSPC
            Error::NoMem(_) => -12,        // ENOMEM
            Error::FileTooLarge(_) => -27, // EFBIG
            Error::NotDir => -20,          // ENOTDIR
            Error::NoEnt => -2,            // ENOENT
            Error::Acces => -13,           // EACCES
            Error::Exist => -17,           // EEXIST
            Error::NameTooLong => -36,     // ENAMETOOLONG
            Error::Inval => -22,           // EINVAL
            Error::NotEmpty => -39,        // ENOTEMPTY
            Error::TooManyLinks => -27,    // EFBIG，沿用原语义
            _ => -5,                       // EIO
        }
    }
}
