//! # v6fs
//!
//! Unix V6 文件系统的读写实现，外加一份预写日志（journal）保证崩溃一致性。
//! 磁盘布局与 1975 年的 V6 兼容；日志区紧跟在传统文件系统之后：
//!
//! ```text
//! 引导块 | 超级块 | 索引节点区 | 数据块区 | 日志头 | 空闲位图 | 环形日志
//! ```
//!
//! 自上而下的层次：

// 高层操作：路径解析、mknod/mkdir/link/unlink/rename
pub mod fsops;

// 离线检查器
pub mod fsck;

// 文件系统核心：打开镜像、缓存、分配、路径名
mod fs;
pub use fs::{FsCache, OpenFlag, V6FileSystem};

// 预写日志与崩溃恢复
mod journal;
pub use journal::{Tx, V6Log};
mod replay;
pub use replay::Replay;

// 日志的磁盘格式：记录编码、CRC、日志头
pub mod logrec;
pub use logrec::{Lsn, lsn_le};

// 索引节点操作与目录项
mod inode;
pub use inode::{Dirent, DoLog};

// 游标：在文件内顺序读写
mod cursor;
pub use cursor::{Cursor, Span};

// 块路径：间接块树的统一遍历
pub mod blockpath;
pub use blockpath::{BlockPath, PtrArray};

// 缓存层：扇区缓冲与内存索引节点
mod cache;
pub use cache::{BufRef, Buffer, InodeRef, InodeSlot};

// 位图：空闲块表
mod bitmap;
pub use bitmap::Bitmap;

// 按对齐页缓冲的设备读写器
mod bufio;
pub use bufio::{FdReader, FdWriter};

// 磁盘数据结构
pub mod layout;

mod error;
pub use error::{Error, Result};

/// 扇区大小，所有磁盘结构以它对齐
pub const SECTOR_SIZE: usize = 512;
pub const BOOTBLOCK_SECTOR: u16 = 0;
pub const SUPERBLOCK_SECTOR: u16 = 1;
pub const INODE_START_SECTOR: u16 = 2;
/// 根目录的索引节点号，节点号从 1 开始
pub const ROOT_INUMBER: u16 = 1;
/// 引导块开头的魔数
pub const BOOTBLOCK_MAGIC: u16 = 0o407;
/// 文件大小上限：24 位长度字段
pub const MAX_FILE_SIZE: u32 = 0xff_ffff;

/// 索引节点内的块指针数
pub const IADDR_SIZE: usize = 8;
/// 间接块内的块指针数
pub const INDBLK_SIZE: usize = SECTOR_SIZE / 2;
pub const INODES_PER_BLOCK: u16 = (SECTOR_SIZE / layout::INODE_SIZE) as u16;
