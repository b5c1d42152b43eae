use crate::INODE_START_SECTOR;

/// 超级块，位于 1 号扇区。
///
/// `s_free`/`s_inode` 是 1975 年遗留的空闲块栈和空闲节点缓存；
/// 启用日志后空闲块改由位图管理，`s_nfree` 清零。
#[derive(Debug, Clone)]
#[repr(C)]
pub struct FileSys {
    /// 索引节点区占据的扇区数
    pub s_isize: u16,
    /// 整个卷的扇区数（不含日志区）
    pub s_fsize: u16,
    /// 空闲块栈深度（0-100）
    pub s_nfree: u16,
    /// 空闲块栈
    pub s_free: [u16; 100],
    /// 空闲节点缓存个数（0-100）
    pub s_ninode: u16,
    /// 空闲节点缓存
    pub s_inode: [u16; 100],
    pub s_flock: u8,
    pub s_ilock: u8,
    /// 超级块被修改过
    pub s_fmod: u8,
    pub s_ronly: u8,
    /// 最后更新时间，高低 16 位交换存放
    pub s_time: [u16; 2],
    /// 本卷带日志
    pub s_uselog: u8,
    /// 未干净卸载
    pub s_dirty: u8,
    pad: [u16; 47],
}

impl FileSys {
    pub fn zeroed() -> Self {
        Self {
            s_isize: 0,
            s_fsize: 0,
            s_nfree: 0,
            s_free: [0; 100],
            s_ninode: 0,
            s_inode: [0; 100],
            s_flock: 0,
            s_ilock: 0,
            s_fmod: 0,
            s_ronly: 0,
            s_time: [0; 2],
            s_uselog: 0,
            s_dirty: 0,
            pad: [0; 47],
        }
    }

    /// 数据区的第一个扇区
    #[inline]
    pub fn datastart(&self) -> u16 {
        INODE_START_SECTOR + self.s_isize
    }

    #[inline]
    pub fn set_time(&mut self, t: u32) {
        self.s_time = [(t >> 16) as u16, t as u16];
    }
}
