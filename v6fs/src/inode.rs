//! # 索引节点操作
//!
//! 对内存节点的各种改动：按块路径找块（可选分配）、大小文件互转、
//! 截断、目录查找与建项、时间戳。所有落盘的修改通过补丁记日志。

use core::mem::offset_of;

use crate::blockpath::{blockno_path, sentinel_path, PtrArray};
use crate::cache::{BufRef, InodeRef};
use crate::cursor::Cursor;
use crate::fs::now;
use crate::layout::{DirEntry, DiskInode, IFDIR, IFMT, ILARG, NAME_MAX_LEN};
use crate::{Error, Result, V6FileSystem};
use crate::{IADDR_SIZE, MAX_FILE_SIZE, SECTOR_SIZE};

/// 这次修改要不要写日志。
/// atime 这类丢了无妨的更新选 `No`，省日志量。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoLog {
    No,
    Yes,
}

/// 目录项句柄：目录节点 + 所在缓冲 + 块内偏移。
/// 握着缓冲引用，槽位不会在手里被回收。
pub struct Dirent {
    pub dir: InodeRef,
    pub bp: BufRef,
    pub off: usize,
}

impl Dirent {
    pub fn inum(&self) -> u16 {
        self.bp
            .lock()
            .unwrap()
            .get::<DirEntry>(self.off)
            .d_inumber
    }

    pub fn name(&self) -> Vec<u8> {
        self.bp
            .lock()
            .unwrap()
            .get::<DirEntry>(self.off)
            .name()
            .to_vec()
    }

    /// 填节点号并把整个目录项记日志；清零时顺带抹掉名字。
    /// 目录的 mtime 也在这里更新。
    pub fn set_inum(&self, fs: &mut V6FileSystem, inum: u16) -> Result<()> {
        {
            let mut g = self.bp.lock().unwrap();
            let de = g.get_mut::<DirEntry>(self.off);
            de.d_inumber = inum;
            if inum == 0 {
                de.set_name(b"");
            }
        }
        fs.patch_buf(&self.bp, self.off, DirEntry::SIZE)?;
        fs.mtouch(&self.dir, DoLog::Yes)
    }

    /// 只写名字，不标脏不记日志，交给之后的 `set_inum` 一并落盘
    pub fn set_name(&self, name: &[u8]) {
        let mut g = self.bp.lock().unwrap();
        g.get_mut_untracked::<DirEntry>(self.off).set_name(name);
    }
}

impl V6FileSystem {
    /// 文件第 `blockno` 块所在的缓冲。指针为零时，
    /// `allocate` 决定是分配新块还是报告空洞（`None`）。
    pub fn getblock(&mut self, ip: &InodeRef, blockno: u32, allocate: bool) -> Result<Option<BufRef>> {
        if allocate && blockno >= IADDR_SIZE as u32 {
            self.make_large(ip)?;
        }
        debug_assert!(!allocate || self.log.as_ref().map_or(true, |l| l.in_tx));

        let mode = ip.lock().unwrap().d.i_mode;
        let mut ba = PtrArray::Inode(ip.clone());
        let mut bp = None;
        let mut idx = blockno_path(mode, blockno);
        while idx.height() > 0 {
            let bn = ba.at(idx.index() as usize);
            let child = if bn == 0 {
                if !allocate {
                    return Ok(None);
                }
                let nbp = self.balloc(idx.height() > 1 || mode & IFMT == IFDIR)?;
                let nbn = nbp.lock().unwrap().blockno();
                ba.set_at(self, idx.index() as usize, nbn)?;
                nbp
            } else {
                self.bread(bn)?
            };
            bp = Some(child.clone());
            ba = PtrArray::Block(child);
            idx = idx.tail();
        }
        Ok(bp)
    }

    pub(crate) fn getblock_alloc(&mut self, ip: &InodeRef, blockno: u32) -> Result<BufRef> {
        Ok(self
            .getblock(ip, blockno, true)?
            .expect("allocating getblock returned a hole"))
    }

    /// 设大文件标志：腾一个间接块，放进前八个直接指针
    pub fn make_large(&mut self, ip: &InodeRef) -> Result<()> {
        if ip.lock().unwrap().d.i_mode & ILARG != 0 {
            return Ok(());
        }

        let bp = self.balloc(true)?;
        {
            let addrs = ip.lock().unwrap().d.i_addr;
            let mut g = bp.lock().unwrap();
            for (i, w) in addrs.iter().enumerate() {
                g.data.0[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
            }
        }
        // 多记一个字节（512 字节的块里无害），
        // 让 dump 工具能把这条补丁和目录项补丁区分开
        self.patch_buf(&bp, 0, 2 * IADDR_SIZE + 1)?;

        {
            let mut g = ip.lock().unwrap();
            let bn = bp.lock().unwrap().blockno();
            g.d.i_addr = [0; IADDR_SIZE];
            g.d.i_addr[0] = bn;
            g.d.i_mode |= ILARG;
        }
        self.patch_inode_whole(ip)
    }

    /// 清大文件标志：把间接块头部的八个指针搬回 `i_addr`。
    /// 只在文件不超过 8 块时合法。
    pub fn make_small(&mut self, ip: &InodeRef, dolog: DoLog) -> Result<()> {
        let (mode, addr0) = {
            let g = ip.lock().unwrap();
            (g.d.i_mode, g.d.i_addr[0])
        };
        if mode & ILARG == 0 {
            return Ok(());
        }

        let mut addrs = [0u16; IADDR_SIZE];
        if addr0 != 0 {
            let ibp = self.bread(addr0)?;
            let mut g = ibp.lock().unwrap();
            for (i, w) in addrs.iter_mut().enumerate() {
                *w = *g.get::<u16>(2 * i);
            }
            g.data.0[..2 * IADDR_SIZE].fill(0);
            g.bdwrite();
        }

        free_blocks(
            self,
            &PtrArray::Inode(ip.clone()),
            blockno_path(mode, IADDR_SIZE as u32),
        )?;
        if addr0 != 0 {
            self.bfree(addr0)?;
        }
        {
            let mut g = ip.lock().unwrap();
            g.d.i_addr = addrs;
            g.d.i_mode &= !ILARG;
        }
        if dolog == DoLog::Yes {
            self.patch_inode_whole(ip)?;
        } else {
            ip.lock().unwrap().mark_dirty();
        }
        Ok(())
    }

    /// 截断到 `size` 字节：从哨兵路径起自底向上释放块，
    /// 缩进 8 块以内先退回小文件表示
    pub fn itruncate(&mut self, ip: &InodeRef, size: u32, dolog: DoLog) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge("truncate"));
        }
        let mut converted_to_small = false;
        if size <= (IADDR_SIZE * SECTOR_SIZE) as u32 {
            self.make_small(ip, DoLog::No)?;
            converted_to_small = true;
        }

        let mode = ip.lock().unwrap().d.i_mode;
        let pth = sentinel_path(mode, size);
        free_blocks(self, &PtrArray::Inode(ip.clone()), pth)?;

        if dolog == DoLog::No {
            ip.lock().unwrap().d.set_size(size);
        } else if !converted_to_small {
            self.set_size(ip, size)?;
        } else {
            ip.lock().unwrap().d.set_size(size);
            self.patch_inode_whole(ip)?;
        }
        Ok(())
    }

    /// 截断到零并抹掉整个节点映像
    pub fn iclear(&mut self, ip: &InodeRef) -> Result<()> {
        self.itruncate(ip, 0, DoLog::No)?;
        ip.lock().unwrap().d = DiskInode::default();
        self.patch_inode_whole(ip)
    }

    /// 写 24 位长度，只记三个字节的补丁
    pub fn set_size(&mut self, ip: &InodeRef, size: u32) -> Result<()> {
        ip.lock().unwrap().d.set_size(size);
        self.patch_inode(ip, offset_of!(DiskInode, i_size0), 3)
    }

    /// 更新 atime。不记日志：崩溃后 atime 回旧值无伤大雅
    pub fn atouch(&mut self, ip: &InodeRef) {
        if !self.readonly {
            let mut g = ip.lock().unwrap();
            g.d.set_atime(now());
            g.mark_dirty();
        }
    }

    pub fn mtouch(&mut self, ip: &InodeRef, dolog: DoLog) -> Result<()> {
        ip.lock().unwrap().d.set_mtime(now());
        if dolog == DoLog::Yes {
            self.patch_inode(ip, offset_of!(DiskInode, i_mtime), 4)
        } else {
            ip.lock().unwrap().mark_dirty();
            Ok(())
        }
    }

    /* ---------- 目录 ---------- */

    /// 线性扫目录找名字
    pub fn dir_lookup(&mut self, ip: &InodeRef, name: &[u8]) -> Result<Option<Dirent>> {
        assert!(
            ip.lock().unwrap().d.is_dir(),
            "dir_lookup on non-directory"
        );
        let mut c = Cursor::new(ip.clone());
        while let Some(span) = c.readref(self, DirEntry::SIZE)? {
            let hit = span.map(|de: &DirEntry| de.d_inumber != 0 && de.name() == name);
            if hit {
                return Ok(Some(Dirent {
                    dir: ip.clone(),
                    bp: span.bp,
                    off: span.off,
                }));
            }
        }
        Ok(None)
    }

    /// 找名字，没有就建一个目录项（节点号 0 的空槽优先复用）。
    /// 名字先写进槽里，落盘靠之后 `set_inum` 的整项补丁。
    pub fn dir_create(&mut self, ip: &InodeRef, name: &[u8]) -> Result<Dirent> {
        assert!(
            ip.lock().unwrap().d.is_dir(),
            "dir_create on non-directory"
        );
        assert!(name.len() <= NAME_MAX_LEN, "directory entry name too long");

        let mut spare = None;
        let mut c = Cursor::new(ip.clone());
        while let Some(span) = c.readref(self, DirEntry::SIZE)? {
            let (inum, hit) = span.map(|de: &DirEntry| (de.d_inumber, de.name() == name));
            if hit {
                return Ok(Dirent {
                    dir: ip.clone(),
                    bp: span.bp,
                    off: span.off,
                });
            }
            if spare.is_none() && inum == 0 {
                spare = Some(span);
            }
        }

        let span = match spare {
            Some(s) => s,
            None => {
                let s = c.writeref(self, DirEntry::SIZE)?;
                s.map_mut(|de: &mut DirEntry| de.d_inumber = 0);
                s
            }
        };
        let de = Dirent {
            dir: ip.clone(),
            bp: span.bp,
            off: span.off,
        };
        de.set_name(name);
        Ok(de)
    }
}

/// 自底向上释放路径 `start` 及其右侧的所有块。
/// 子树完全清空时连间接块一并释放。
pub(crate) fn free_blocks(fs: &mut V6FileSystem, ba: &PtrArray, start: crate::BlockPath) -> Result<()> {
    for i in (start.index() as usize..ba.len()).rev() {
        let bn = ba.at(i);
        if bn == 0 {
            continue;
        }
        let child = start.tail_at(i as u16);
        if child.height() > 0 {
            let cbp = fs.bread(bn)?;
            free_blocks(fs, &PtrArray::Block(cbp), child)?;
            if !child.is_zero() {
                continue;
            }
        }
        fs.bfree(bn)?;
        ba.set_at(fs, i, 0)?;
    }
    Ok(())
}
