//! # 文件系统核心
//!
//! [`V6FileSystem`] 拥有设备句柄、内存超级块、两个缓存池和可选的日志。
//! 调度模型是单线程协作式：所有操作同步完成，公开接口拿 `&mut self`。
//!
//! 崩溃注入：环境变量 `CRASH_AT=N` 让第 N 次物理扇区写直接中止进程，
//! 用来生成崩溃恢复的测试镜像。

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use block_dev::RawDevice;
use enumflags2::{bitflags, BitFlags};

use crate::cache::{BufRef, Buffer, CachePool, InodeRef, InodeSlot};
use crate::fsops;
use crate::layout::{self, DiskInode, FileSys, IFDIR, IFMT, INODE_SIZE};
use crate::logrec::{read_loghdr, LogRecord};
use crate::replay::Replay;
use crate::{lsn_le, Lsn, V6Log};
use crate::{Error, Result};
use crate::{
    BOOTBLOCK_MAGIC, INODES_PER_BLOCK, INODE_START_SECTOR, ROOT_INUMBER, SECTOR_SIZE,
    SUPERBLOCK_SECTOR,
};

/// 打开镜像的方式
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    ReadOnly,
    /// 镜像未干净卸载（且无法重放）时拒绝打开
    MustBeClean,
    /// 即使镜像带日志也不启用
    NoLog,
    /// 没有日志就建一个
    MkLog,
    /// 允许靠重放日志接受脏镜像
    Replay,
}

/// 两个缓存池，由调用方构造后交给文件系统
pub struct FsCache {
    pub(crate) b: CachePool<Buffer>,
    pub(crate) i: CachePool<InodeSlot>,
}

impl FsCache {
    pub fn new(bsize: usize, isize: usize) -> Self {
        Self {
            b: CachePool::new(bsize),
            i: CachePool::new(isize),
        }
    }
}

impl Default for FsCache {
    fn default() -> Self {
        Self::new(16, 100)
    }
}

pub struct V6FileSystem {
    pub dev: Arc<dyn RawDevice>,
    pub readonly: bool,
    /// 打开时镜像就处于脏状态
    pub unclean: bool,
    pub superblock: FileSys,
    pub(crate) cache: FsCache,
    pub log: Option<V6Log>,
    closed: bool,
}

impl std::fmt::Debug for V6FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V6FileSystem")
            .field("readonly", &self.readonly)
            .field("unclean", &self.unclean)
            .field("superblock", &self.superblock)
            .field("closed", &self.closed)
            .finish()
    }
}

impl V6FileSystem {
    pub fn open(path: impl AsRef<Path>, cache: FsCache, flags: BitFlags<OpenFlag>) -> Result<Self> {
        let readonly = flags.contains(OpenFlag::ReadOnly);
        let file = File::options()
            .read(true)
            .write(!readonly)
            .open(path.as_ref())?;
        Self::from_device(Arc::new(file), cache, flags)
    }

    pub fn from_device(
        dev: Arc<dyn RawDevice>,
        cache: FsCache,
        flags: BitFlags<OpenFlag>,
    ) -> Result<Self> {
        let readonly = flags.contains(OpenFlag::ReadOnly);

        let mut sector = [0; SECTOR_SIZE];
        dev.read_exact_at(&mut sector, SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64)?;
        let mut superblock: FileSys = layout::from_sector(&sector);

        let mut magic = [0; 2];
        dev.read_exact_at(&mut magic, 0)?;
        if u16::from_le_bytes(magic) != BOOTBLOCK_MAGIC {
            return Err(Error::Format("boot block missing magic number"));
        }

        let unclean = superblock.s_dirty != 0;

        // 老镜像的超级块尾部可能是垃圾，日志头校验不过就当没有日志
        if superblock.s_uselog != 0 {
            if let Err(e) = read_loghdr(dev.as_ref(), superblock.s_fsize as u32) {
                log::warn!("invalid log header, clearing s_uselog in superblock: {e}");
                superblock.s_uselog = 0;
            }
        }

        if flags.contains(OpenFlag::MustBeClean)
            && unclean
            && (superblock.s_uselog == 0
                || flags & (OpenFlag::Replay | OpenFlag::NoLog) != BitFlags::<OpenFlag>::from(OpenFlag::Replay))
        {
            return Err(Error::Unclean);
        }

        let mut fs = Self {
            dev,
            readonly,
            unclean,
            superblock,
            cache,
            log: None,
            closed: false,
        };
        if !readonly {
            fs.superblock.s_fmod = 0;
        }
        if !flags.contains(OpenFlag::NoLog) && !readonly {
            if fs.superblock.s_uselog == 0 && flags.contains(OpenFlag::MkLog) {
                log::info!("creating journal and bitmap");
                V6Log::create(&mut fs, 0)?;
            }
            if fs.superblock.s_uselog != 0 {
                if fs.unclean {
                    let mut r = Replay::new(&fs)?;
                    r.replay(&mut fs)?;
                }
                fs.log = Some(V6Log::open(fs.dev.clone(), &fs.superblock)?);
            }
        }
        if !readonly {
            fs.superblock.s_dirty = 1;
            fs.write_superblock()?;
        }
        Ok(fs)
    }

    /// 有序卸载：检查点、刷缓存、把超级块改回干净
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.readonly {
            let suppressed = self.log.as_ref().is_some_and(|l| l.suppress_commit);
            if self.log.is_some() {
                self.checkpoint()?;
            } else {
                self.sync();
            }
            self.log = None;
            self.superblock.s_fmod = 0;
            if !self.unclean && !suppressed {
                self.superblock.s_dirty = 0;
            }
            self.write_superblock()?;
        }
        self.invalidate()?;
        Ok(())
    }

    /// 把所有脏且已落日志的缓存条目写回原位置，返回是否全部成功
    pub fn sync(&mut self) -> bool {
        let mut ok = true;
        let committed = self.log.as_ref().map(|l| l.committed);

        // 先刷索引节点，写回会弄脏所在扇区的缓冲
        for (inum, slot) in self.cache.i.entries() {
            let (flush, d) = {
                let g = slot.lock().unwrap();
                (g.dirty && durable(committed, g.logged, g.lsn), g.d.clone())
            };
            if !flush {
                continue;
            }
            match self.iput(inum, &d) {
                Ok(()) => {
                    let mut g = slot.lock().unwrap();
                    g.dirty = false;
                    g.logged = false;
                }
                Err(e) => {
                    ok = false;
                    log::warn!("cache flush: {e}");
                }
            }
        }

        for (bn, bp) in self.cache.b.entries() {
            let res = {
                let g = bp.lock().unwrap();
                if !(g.dirty && durable(committed, g.logged, g.lsn)) {
                    continue;
                }
                self.writeblock(&g.data.0, bn as u32)
            };
            match res {
                Ok(()) => {
                    let mut g = bp.lock().unwrap();
                    g.dirty = false;
                    g.logged = false;
                }
                Err(e) => {
                    ok = false;
                    log::warn!("cache flush: {e}");
                }
            }
        }

        // 带日志时超级块没有值得保的信息：空闲节点表重挂载时重扫，
        // 空闲块走位图
        if self.log.is_none() && self.superblock.s_fmod != 0 {
            self.superblock.s_fmod = 0;
            if let Err(e) = self.write_superblock() {
                ok = false;
                log::warn!("cache flush: {e}");
            }
        }
        ok
    }

    /// 丢掉全部缓存（不写回），重读超级块
    pub fn invalidate(&mut self) -> Result<()> {
        self.cache.i.clear();
        self.cache.b.clear();
        let mut sector = [0; SECTOR_SIZE];
        self.readblock(&mut sector, SUPERBLOCK_SECTOR as u32)?;
        self.superblock = layout::from_sector(&sector);
        Ok(())
    }

    /* ---------- 扇区缓冲 ---------- */

    /// 读一块进缓存
    pub fn bread(&mut self, blockno: u16) -> Result<BufRef> {
        let bp = self.bget(blockno)?;
        {
            let mut g = bp.lock().unwrap();
            if !g.initialized {
                self.readblock(&mut g.data.0, blockno as u32)?;
                g.initialized = true;
            }
        }
        Ok(bp)
    }

    /// 只占缓冲不读盘，用于马上要整体覆盖的块
    pub fn bget(&mut self, blockno: u16) -> Result<BufRef> {
        if let Some(bp) = self.cache.b.try_lookup(blockno) {
            return Ok(bp);
        }
        self.make_buffer_room()?;
        Ok(self.cache.b.insert(blockno, Buffer::new(blockno)))
    }

    /// 立即写回
    pub fn bwrite(&self, bp: &BufRef) -> Result<()> {
        let mut g = bp.lock().unwrap();
        g.initialized = true;
        self.writeblock(&g.data.0, g.blockno() as u32)?;
        g.dirty = false;
        Ok(())
    }

    fn make_buffer_room(&mut self) -> Result<()> {
        if !self.cache.b.is_full() {
            return Ok(());
        }
        let committed = self.log.as_ref().map(|l| l.committed);
        let mut victim = self
            .cache
            .b
            .evict(move |b| durable(committed, b.logged, b.lsn));
        if victim.is_none() {
            // 回收不动多半是领先日志太多，先把日志刷出去
            self.flush_log()?;
            let committed = self.log.as_ref().map(|l| l.committed);
            victim = self
                .cache
                .b
                .evict(move |b| durable(committed, b.logged, b.lsn));
        }
        let Some((bn, bp)) = victim else {
            log::warn!("buffer cache is full");
            return Err(Error::NoMem("buffer cache full"));
        };
        let g = bp.lock().unwrap();
        if g.dirty {
            self.writeblock(&g.data.0, bn as u32)?;
        }
        Ok(())
    }

    /// 接下来 `n` 次缓冲分配能否成功（截断目录前要先问一声）
    pub fn can_alloc_bufs(&mut self, n: usize) -> bool {
        let committed = self.log.as_ref().map(|l| l.committed);
        if self
            .cache
            .b
            .can_alloc(n, move |b| durable(committed, b.logged, b.lsn))
        {
            return true;
        }
        if self.flush_log().is_err() {
            return false;
        }
        let committed = self.log.as_ref().map(|l| l.committed);
        self.cache
            .b
            .can_alloc(n, move |b| durable(committed, b.logged, b.lsn))
    }

    fn can_alloc_inodes(&mut self, n: usize) -> bool {
        let committed = self.log.as_ref().map(|l| l.committed);
        if self
            .cache
            .i
            .can_alloc(n, move |s| durable(committed, s.logged, s.lsn))
        {
            return true;
        }
        if self.flush_log().is_err() {
            return false;
        }
        let committed = self.log.as_ref().map(|l| l.committed);
        self.cache
            .i
            .can_alloc(n, move |s| durable(committed, s.logged, s.lsn))
    }

    /// 强推日志缓冲，让已提交记录立即可重放
    pub fn flush_log(&mut self) -> Result<()> {
        match self.log.as_mut() {
            Some(l) => l.flush(),
            None => Ok(()),
        }
    }

    /* ---------- 索引节点 ---------- */

    /// `inum` 所在的扇区号
    pub fn iblock(&self, inum: u16) -> u16 {
        assert!(inum != 0, "iblock: invalid inum");
        let blockno = (inum - ROOT_INUMBER) / INODES_PER_BLOCK;
        assert!(blockno < self.superblock.s_isize, "iblock: invalid inum");
        blockno + INODE_START_SECTOR
    }

    /// `inum` 在所在扇区内的序号
    #[inline]
    pub fn iindex(inum: u16) -> u16 {
        (inum - ROOT_INUMBER) % INODES_PER_BLOCK
    }

    pub fn iget(&mut self, inum: u16) -> Result<InodeRef> {
        let ip = self.iget_raw(inum)?;
        let init = ip.lock().unwrap().initialized;
        if !init {
            let bp = self.bread(self.iblock(inum))?;
            let d = {
                let g = bp.lock().unwrap();
                g.get::<DiskInode>(Self::iindex(inum) as usize * INODE_SIZE).clone()
            };
            let mut g = ip.lock().unwrap();
            g.d = d;
            g.initialized = true;
        }
        Ok(ip)
    }

    /// 占一个节点槽，不从磁盘读
    fn iget_raw(&mut self, inum: u16) -> Result<InodeRef> {
        if let Some(ip) = self.cache.i.try_lookup(inum) {
            return Ok(ip);
        }
        self.make_inode_room()?;
        Ok(self.cache.i.insert(inum, InodeSlot::new(inum)))
    }

    /// 缓存里有就给，不读盘不动 LRU
    pub fn try_iget(&self, inum: u16) -> Option<InodeRef> {
        self.cache.i.peek(inum)
    }

    /// 把内存节点拷回所在扇区的缓冲
    pub(crate) fn iput(&mut self, inum: u16, d: &DiskInode) -> Result<()> {
        let bp = self.bread(self.iblock(inum))?;
        let mut g = bp.lock().unwrap();
        let off = Self::iindex(inum) as usize * INODE_SIZE;
        g.data.0[off..off + INODE_SIZE].copy_from_slice(d.as_bytes());
        g.bdwrite();
        Ok(())
    }

    fn make_inode_room(&mut self) -> Result<()> {
        if !self.cache.i.is_full() {
            return Ok(());
        }
        let committed = self.log.as_ref().map(|l| l.committed);
        let mut victim = self
            .cache
            .i
            .evict(move |s| durable(committed, s.logged, s.lsn));
        if victim.is_none() {
            self.flush_log()?;
            let committed = self.log.as_ref().map(|l| l.committed);
            victim = self
                .cache
                .i
                .evict(move |s| durable(committed, s.logged, s.lsn));
        }
        let Some((inum, slot)) = victim else {
            log::warn!("inode cache is full");
            return Err(Error::NoMem("inode cache full"));
        };
        let (dirty, d) = {
            let g = slot.lock().unwrap();
            (g.dirty, g.d.clone())
        };
        if dirty {
            self.iput(inum, &d)?;
        }
        Ok(())
    }

    /// 路径解析，`..`/`.` 在词法层消解
    pub fn namei(&mut self, path: &str) -> Result<Option<InodeRef>> {
        self.namei_from(ROOT_INUMBER, path)
    }

    pub fn namei_from(&mut self, start: u16, path: &str) -> Result<Option<InodeRef>> {
        let mut ip = self.iget(start)?;
        for name in fsops::path_components(path) {
            if ip.lock().unwrap().d.i_mode & IFMT != IFDIR {
                return Ok(None);
            }
            let Some(de) = self.dir_lookup(&ip, name.as_bytes())? else {
                return Ok(None);
            };
            let inum = de.inum();
            ip = self.iget(inum)?;
        }
        Ok(Some(ip))
    }

    /* ---------- 分配 ---------- */

    #[inline]
    pub fn badblock(&self, blockno: u16) -> bool {
        blockno < self.superblock.datastart() || blockno >= self.superblock.s_fsize
    }

    /// 分配一块并清零。`metadata` 对间接块和目录块为真：
    /// 它们之后的修改全走日志，重放时要重新清零；
    /// 数据块可能带着未记日志的写回内容，不能清。
    pub fn balloc(&mut self, metadata: bool) -> Result<BufRef> {
        if !self.can_alloc_bufs(1) {
            log::warn!("buffer cache is full");
            return Err(Error::NoMem("block allocation out of buffers"));
        }
        let bn = if self.log.is_some() {
            let datastart = self.superblock.datastart();
            let fsize = self.superblock.s_fsize;
            self.log.as_mut().unwrap().balloc(metadata, datastart, fsize)?
        } else {
            self.balloc_freelist()?
        };
        if bn == 0 {
            return Err(Error::NoSpace("no free blocks on device"));
        }
        let bp = self.bget(bn)?;
        {
            let mut g = bp.lock().unwrap();
            g.data.0.fill(0);
            g.bdwrite();
        }
        Ok(bp)
    }

    pub fn bfree(&mut self, blockno: u16) -> Result<()> {
        assert!(!self.badblock(blockno), "attempt to free bad block");
        if self.log.is_some() {
            self.log.as_mut().unwrap().bfree(blockno)?;
        } else {
            self.bfree_freelist(blockno)?;
        }
        self.cache.b.free(blockno);
        Ok(())
    }

    /// 1975 年的空闲块栈：栈空时弹出的块本身装着下一批空闲块号
    fn balloc_freelist(&mut self) -> Result<u16> {
        if self.superblock.s_nfree == 0
            || (self.superblock.s_nfree == 1 && self.superblock.s_free[0] == 0)
        {
            return Ok(0);
        }
        self.superblock.s_fmod = 1;
        self.superblock.s_nfree -= 1;
        let blockno = self.superblock.s_free[self.superblock.s_nfree as usize];

        if self.superblock.s_nfree == 0 {
            let bp = self.bread(blockno)?;
            let g = bp.lock().unwrap();
            for i in 0..self.superblock.s_free.len() {
                self.superblock.s_free[i] = *g.get::<u16>(2 * i);
            }
            self.superblock.s_nfree = self.superblock.s_free.len() as u16;
        }
        Ok(blockno)
    }

    /// 栈满时把整个栈写进被释放的块，栈重置为只含这一块
    fn bfree_freelist(&mut self, blockno: u16) -> Result<()> {
        self.superblock.s_fmod = 1;

        if self.superblock.s_nfree as usize == self.superblock.s_free.len() {
            let bp = self.bget(blockno)?;
            {
                let mut g = bp.lock().unwrap();
                for (i, w) in self.superblock.s_free.iter().enumerate() {
                    g.data.0[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
                }
                let used = 2 * self.superblock.s_free.len();
                g.data.0[used..].fill(0);
            }
            self.superblock.s_free[0] = blockno;
            self.superblock.s_nfree = 1;
            self.bwrite(&bp)?;
            return Ok(());
        }

        // 栈曾经空过：先放终结标记 0
        if self.superblock.s_nfree == 0 {
            self.superblock.s_free[0] = 0;
            self.superblock.s_nfree = 1;
        }
        self.superblock.s_free[self.superblock.s_nfree as usize] = blockno;
        self.superblock.s_nfree += 1;
        Ok(())
    }

    pub fn ialloc(&mut self) -> Result<InodeRef> {
        if !self.can_alloc_inodes(1) {
            log::warn!("inode cache is full");
            return Err(Error::NoMem("inode cache overflow"));
        }
        if self.superblock.s_ninode == 0 {
            // 空闲节点表用光了就从头整盘扫，V6 当年就是这么干的
            let end = self.superblock.s_isize as u32 * INODES_PER_BLOCK as u32;
            let mut i = 1;
            while i <= end && (self.superblock.s_ninode as usize) < self.superblock.s_inode.len() {
                let ip = self.iget(i as u16)?;
                let free = !ip.lock().unwrap().d.is_allocated();
                if free {
                    let n = self.superblock.s_ninode as usize;
                    self.superblock.s_inode[n] = i as u16;
                    self.superblock.s_ninode += 1;
                }
                i += 1;
            }
        }
        if self.superblock.s_ninode == 0 {
            return Err(Error::NoSpace("out of inodes"));
        }
        self.superblock.s_ninode -= 1;
        let inum = self.superblock.s_inode[self.superblock.s_ninode as usize];
        let ip = self.iget_raw(inum)?;
        self.superblock.s_fmod = 1;
        {
            let mut g = ip.lock().unwrap();
            g.d = DiskInode::default();
            g.initialized = true;
        }
        Ok(ip)
    }

    pub fn ifree(&mut self, inum: u16) {
        assert!(
            inum >= ROOT_INUMBER && inum <= self.superblock.s_isize * INODES_PER_BLOCK,
            "ifree: invalid inum"
        );
        if self.superblock.s_ninode as usize >= self.superblock.s_inode.len() {
            return;
        }
        let n = self.superblock.s_ninode as usize;
        self.superblock.s_inode[n] = inum;
        self.superblock.s_ninode += 1;
        self.superblock.s_fmod = 1;
    }

    /* ---------- 补丁 ---------- */

    /// 缓冲内容已改好，把 `[offset, offset+len)` 这段记进日志并标脏
    pub fn patch_buf(&mut self, bp: &BufRef, offset: usize, len: usize) -> Result<()> {
        assert!(len > 0 && offset + len <= SECTOR_SIZE);
        let (blockno, bytes) = {
            let mut g = bp.lock().unwrap();
            g.bdwrite();
            (g.blockno(), g.data.0[offset..offset + len].to_vec())
        };
        if let Some(log) = self.log.as_mut() {
            assert!(log.in_tx, "log patch outside transaction");
            log.append(LogRecord::Patch {
                blockno,
                offset: offset as u16,
                bytes,
            })?;
            let lsn = log.sequence;
            let mut g = bp.lock().unwrap();
            g.lsn = lsn;
            g.logged = true;
        }
        Ok(())
    }

    /// 同上，但目标是内存节点映像里的一段字段
    pub fn patch_inode(&mut self, ip: &InodeRef, offset: usize, len: usize) -> Result<()> {
        assert!(len > 0 && offset + len <= INODE_SIZE);
        let (inum, bytes) = {
            let mut g = ip.lock().unwrap();
            g.mark_dirty();
            (g.inum(), g.d.as_bytes()[offset..offset + len].to_vec())
        };
        let blockno = self.iblock(inum);
        let block_off = Self::iindex(inum) as usize * INODE_SIZE + offset;
        if let Some(log) = self.log.as_mut() {
            assert!(log.in_tx, "log patch outside transaction");
            log.append(LogRecord::Patch {
                blockno,
                offset: block_off as u16,
                bytes,
            })?;
            let lsn = log.sequence;
            let mut g = ip.lock().unwrap();
            g.lsn = lsn;
            g.logged = true;
        }
        Ok(())
    }

    pub fn patch_inode_whole(&mut self, ip: &InodeRef) -> Result<()> {
        self.patch_inode(ip, 0, INODE_SIZE)
    }

    /* ---------- 物理读写 ---------- */

    pub fn readblock(&self, mem: &mut [u8; SECTOR_SIZE], blockno: u32) -> Result<()> {
        self.dev
            .read_exact_at(mem, blockno as u64 * SECTOR_SIZE as u64)?;
        Ok(())
    }

    pub fn writeblock(&self, mem: &[u8; SECTOR_SIZE], blockno: u32) -> Result<()> {
        if should_crash() {
            crash();
        }
        self.dev
            .write_all_at(mem, blockno as u64 * SECTOR_SIZE as u64)?;
        Ok(())
    }

    pub fn write_superblock(&self) -> Result<()> {
        self.writeblock(&layout::to_sector(&self.superblock), SUPERBLOCK_SECTOR as u32)
    }
}

impl Drop for V6FileSystem {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_inner() {
                log::warn!("close: {e}");
            }
        }
    }
}

/// 条目的最新补丁是否已在日志里落盘
#[inline]
fn durable(committed: Option<Lsn>, logged: bool, lsn: Lsn) -> bool {
    !logged || committed.is_some_and(|c| lsn_le(lsn, c))
}

/// `CRASH_AT` 计数达到后返回 true，只触发一次
fn should_crash() -> bool {
    static CRASH_AT: OnceLock<AtomicI64> = OnceLock::new();
    let c = CRASH_AT.get_or_init(|| {
        AtomicI64::new(
            std::env::var("CRASH_AT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        )
    });
    if c.load(Ordering::Relaxed) <= 0 {
        return false;
    }
    c.fetch_sub(1, Ordering::Relaxed) == 1
}

fn crash() -> ! {
    eprintln!("Crashing because of CRASH_AT environment variable");
    std::process::abort();
}

/// 当前墙钟秒数，塞进 32 位时间戳字段
pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
