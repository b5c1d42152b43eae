//! # 磁盘数据结构层
//!
//! 描述镜像上的物理字节布局，全部假定小端字节序：
//!
//! 引导块 | 超级块 | 索引节点区 | 数据块区
//!
//! 日志区的磁盘结构见 [`crate::logrec`]。

use core::{mem, ptr, slice};

use crate::SECTOR_SIZE;

mod super_block;
pub use super_block::FileSys;

mod inode;
pub use inode::DiskInode;
pub use inode::{
    IALLOC, IEXEC, IFBLK, IFCHR, IFDIR, IFMT, IFREG, ILARG, IREAD, ISGID, ISUID, ISVTX, IWRITE,
};

mod dir_entry;
pub use dir_entry::{DirEntry, NAME_MAX_LEN};

pub const INODE_SIZE: usize = mem::size_of::<DiskInode>();

/// 从扇区缓冲复制出磁盘结构。
/// 仅用于字段全为整数的 `#[repr(C)]` 布局类型。
pub fn from_sector<T>(buf: &[u8; SECTOR_SIZE]) -> T {
    assert!(mem::size_of::<T>() <= SECTOR_SIZE);
    unsafe { ptr::read_unaligned(buf.as_ptr().cast()) }
}

/// 把磁盘结构铺进一个扇区，空余部分填零
pub fn to_sector<T>(v: &T) -> [u8; SECTOR_SIZE] {
    assert!(mem::size_of::<T>() <= SECTOR_SIZE);
    let mut buf = [0; SECTOR_SIZE];
    let bytes =
        unsafe { slice::from_raw_parts(ptr::from_ref(v).cast::<u8>(), mem::size_of::<T>()) };
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}
