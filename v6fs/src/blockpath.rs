//! # 块路径
//!
//! [`BlockPath`] 把「文件内第 n 块」翻译成一串指针数组下标：
//! 最高一级落在索引节点的 `i_addr`，其余落在一级、二级间接块。
//! 三个下标各占 9 位（多出的一位用来表示「数组末尾再过一格」的哨兵），
//! 外加 2 位高度和 1 位「起点是索引节点」标志，压进一个 `u32`。
//!
//! 分配、截断、检查器都沿同一条路径代数遍历间接块树。

use crate::cache::{BufRef, InodeRef};
use crate::layout::{DiskInode, ILARG};
use crate::{V6FileSystem, Result};
use crate::{IADDR_SIZE, INDBLK_SIZE, SECTOR_SIZE};

/// 第一个需要二级间接块的文件块号
pub const FIRST_DINDR_BLK: u32 = ((IADDR_SIZE - 1) * INDBLK_SIZE) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPath(pub u32);

impl BlockPath {
    pub fn make1(b1: u16) -> Self {
        Self((b1 as u32) << 23 | 5)
    }

    pub fn make2(b1: u16, b2: u16) -> Self {
        Self((b1 as u32) << 23 | (b2 as u32) << 14 | 6)
    }

    pub fn make3(b1: u16, b2: u16, b3: u16) -> Self {
        Self((b1 as u32) << 23 | (b2 as u32) << 14 | (b3 as u32) << 5 | 7)
    }

    /// 最高一级的下标
    #[inline]
    pub fn index(self) -> u16 {
        (self.0 >> 23) as u16
    }

    #[inline]
    pub fn height(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// 路径从索引节点出发，而非从间接块中途开始
    #[inline]
    pub fn from_inode(self) -> bool {
        self.0 & 4 != 0
    }

    /// 掐掉最高一级，高度减一
    pub fn tail(self) -> Self {
        assert!(self.height() > 0, "BlockPath::tail: empty index list");
        Self((self.0 & !7).wrapping_shl(9) | (self.height() - 1) as u32)
    }

    /// 哨兵路径在子指针 `i` 里的投影：
    /// `i` 在哨兵之前给「无穷大路径」（整棵子树都在文件内），
    /// 等于哨兵给它自己的 tail，之后给「空路径」（整棵子树越界）。
    pub fn tail_at(self, i: u16) -> Self {
        assert!(self.height() > 0, "BlockPath::tail_at: empty index list");
        if i == self.index() {
            return self.tail();
        }
        let mut h = self.height() - 1;
        // ILARG 节点里 i_addr[7] 才是二级间接块，高度不对称
        if self.from_inode() && h > 0 {
            h = if i < IADDR_SIZE as u16 - 1 { 1 } else { 2 };
        }
        if i < self.index() {
            Self(0x8040_0000u32.wrapping_shl(9 * (2 - h) as u32) | h as u32)
        } else {
            Self(h as u32)
        }
    }

    /// 有效的 `height()` 级下标是否全为 0
    pub fn is_zero(self) -> bool {
        let h = self.height();
        if h == 0 {
            return true;
        }
        self.0 >> (5 + 9 * (3 - h) as u32) == 0
    }
}

/// 文件块号到路径。`blockno` 取 `u32` 是为了让 0x10000
/// 能表示「最后一块再过一格」。
pub fn blockno_path(mode: u16, blockno: u32) -> BlockPath {
    if mode & ILARG == 0 {
        assert!(
            blockno <= IADDR_SIZE as u32,
            "BlockPath: small-file length exceeded"
        );
        return BlockPath::make1(blockno as u16);
    }

    if blockno < FIRST_DINDR_BLK {
        return BlockPath::make2(
            (blockno / INDBLK_SIZE as u32) as u16,
            (blockno % INDBLK_SIZE as u32) as u16,
        );
    }
    let bn = blockno - FIRST_DINDR_BLK;
    BlockPath::make3(
        IADDR_SIZE as u16 - 1,
        (bn / INDBLK_SIZE as u32) as u16,
        (bn % INDBLK_SIZE as u32) as u16,
    )
}

/// `size` 字节的文件末尾再过一格的路径，用作截断和扫描的界
pub fn sentinel_path(mode: u16, size: u32) -> BlockPath {
    let bn = size / SECTOR_SIZE as u32 + (size % SECTOR_SIZE as u32 != 0) as u32;
    if mode & ILARG == 0 {
        blockno_path(mode, bn.min(IADDR_SIZE as u32))
    } else {
        blockno_path(mode, bn.min(0x10000))
    }
}

/// 路径还原成文件块号，顺带校验形状
pub fn blockpath_no(pth: BlockPath) -> u16 {
    let top = pth.index() as u32;
    match pth.height() {
        1 if top < IADDR_SIZE as u32 => top as u16,
        2 if top < IADDR_SIZE as u32 - 1 => {
            (INDBLK_SIZE as u32 * top + pth.tail().index() as u32) as u16
        }
        3 if top == IADDR_SIZE as u32 - 1 => {
            let t = pth.tail();
            (FIRST_DINDR_BLK + INDBLK_SIZE as u32 * t.index() as u32 + t.tail().index() as u32)
                as u16
        }
        _ => panic!("blockpath_no: invalid path"),
    }
}

/// 块指针数组：对「索引节点的 `i_addr`」和「间接块」的统一视图。
/// 两者长度不同、标脏方式不同，持有引用防止被缓存回收。
pub enum PtrArray {
    Inode(InodeRef),
    Block(BufRef),
}

impl PtrArray {
    #[inline]
    pub fn is_inode(&self) -> bool {
        matches!(self, PtrArray::Inode(_))
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            PtrArray::Inode(_) => IADDR_SIZE,
            PtrArray::Block(_) => INDBLK_SIZE,
        }
    }

    pub fn at(&self, i: usize) -> u16 {
        assert!(i < self.len(), "PtrArray index out of range");
        match self {
            PtrArray::Inode(ip) => ip.lock().unwrap().d.i_addr[i],
            PtrArray::Block(bp) => *bp.lock().unwrap().get::<u16>(2 * i),
        }
    }

    /// 写入指针并记日志
    pub fn set_at(&self, fs: &mut V6FileSystem, i: usize, blkno: u16) -> Result<()> {
        assert!(i < self.len(), "PtrArray index out of range");
        match self {
            PtrArray::Inode(ip) => {
                ip.lock().unwrap().d.i_addr[i] = blkno;
                fs.patch_inode(ip, core::mem::offset_of!(DiskInode, i_addr) + 2 * i, 2)
            }
            PtrArray::Block(bp) => {
                *bp.lock().unwrap().get_mut::<u16>(2 * i) = blkno;
                fs.patch_buf(bp, 2 * i, 2)
            }
        }
    }

    /// 第 `i` 个指针指向的块，0 则为 `None`
    pub fn fetch_at(&self, fs: &mut V6FileSystem, i: usize) -> Result<Option<BufRef>> {
        let bn = self.at(i);
        if bn == 0 {
            return Ok(None);
        }
        fs.bread(bn).map(Some)
    }

    /// 指针本身在镜像上的字节偏移
    pub fn pointer_offset(&self, fs: &V6FileSystem, i: usize) -> u32 {
        match self {
            PtrArray::Inode(ip) => {
                let inum = ip.lock().unwrap().inum();
                fs.iblock(inum) as u32 * SECTOR_SIZE as u32
                    + V6FileSystem::iindex(inum) as u32 * crate::layout::INODE_SIZE as u32
                    + core::mem::offset_of!(DiskInode, i_addr) as u32
                    + 2 * i as u32
            }
            PtrArray::Block(bp) => {
                bp.lock().unwrap().blockno() as u32 * SECTOR_SIZE as u32 + 2 * i as u32
            }
        }
    }

    /// 所有指针都落在数据区才算完好；未初始化的间接块在这里现形。
    /// 文件大小封顶 2^24-1 字节，二级间接块最后 7 个指针必须为零。
    pub fn check(&self, fs: &V6FileSystem, dbl_indir: bool) -> bool {
        for i in 0..self.len() {
            let bn = self.at(i);
            if bn != 0 && (fs.badblock(bn) || (dbl_indir && i >= INDBLK_SIZE - (IADDR_SIZE - 1))) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ILARG;

    #[test]
    fn round_trip_small() {
        for bn in 0..IADDR_SIZE as u32 {
            assert_eq!(blockpath_no(blockno_path(0, bn)) as u32, bn, "bn={bn}");
        }
    }

    #[test]
    fn round_trip_large() {
        for bn in (0..0x10000u32).step_by(7) {
            assert_eq!(blockpath_no(blockno_path(ILARG, bn)) as u32, bn, "bn={bn}");
        }
        assert_eq!(blockpath_no(blockno_path(ILARG, 0xffff)), 0xffff);
        assert_eq!(
            blockpath_no(blockno_path(ILARG, FIRST_DINDR_BLK)) as u32,
            FIRST_DINDR_BLK
        );
    }

    #[test]
    fn sentinel_bounds() {
        // 小文件：1024 字节 = 两块，哨兵指向第 2 块
        let p = sentinel_path(0, 1024);
        assert_eq!(p.height(), 1);
        assert_eq!(p.index(), 2);

        // 哨兵不会越过小文件寻址上限
        let p = sentinel_path(0, 8 * 512);
        assert_eq!(p.index(), IADDR_SIZE as u16);

        // 大文件哨兵封顶在 0x10000
        let p = sentinel_path(ILARG, crate::MAX_FILE_SIZE);
        assert_eq!(p.height(), 3);
    }

    #[test]
    fn tail_at_polarity() {
        // 哨兵 (2, 5)：下标 1 整棵在文件里，下标 3 整棵越界
        let s = blockno_path(ILARG, 2 * INDBLK_SIZE as u32 + 5);
        assert_eq!(s.index(), 2);

        let before = s.tail_at(1);
        assert!(!before.is_zero());
        assert!(before.index() as usize >= INDBLK_SIZE);

        let at = s.tail_at(2);
        assert_eq!(at.height(), 1);
        assert_eq!(at.index(), 5);

        let after = s.tail_at(3);
        assert!(after.is_zero());
    }

    #[test]
    fn tail_drops_top_level() {
        let p = BlockPath::make3(7, 100, 42);
        assert!(p.from_inode());
        let t = p.tail();
        assert_eq!(t.height(), 2);
        assert_eq!(t.index(), 100);
        assert!(!t.from_inode());
        assert_eq!(t.tail().index(), 42);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn bad_shape_rejected() {
        // 高度 3 的路径最高一级必须是 i_addr 的最后一格
        blockpath_no(BlockPath::make3(3, 0, 0));
    }
}
