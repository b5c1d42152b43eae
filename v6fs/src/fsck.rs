//! # 离线检查器
//!
//! 扫描 - 修补两段式：先把发现的问题攒成「磁盘偏移 → 字节」的补丁，
//! 再一次性绕过日志直接打上。补链接（加 `.`/`..`）可能要分配块，
//! 放在所有补丁之后按正常操作执行。
//!
//! 检查项：块越界、跨文件重复引用、超过文件末尾的块、坏间接块、
//! 目录项节点号、重名、`.`/`..`、目录硬链接、链接计数、
//! 空闲表与超级块里的空闲节点缓存。

use core::fmt;
use std::collections::{BTreeMap, HashSet};

use crate::blockpath::{sentinel_path, PtrArray};
use crate::cache::InodeRef;
use crate::cursor::Cursor;
use crate::fsops;
use crate::layout::{DirEntry, IFBLK, IFCHR, IFMT, INODE_SIZE};
use crate::{Bitmap, BlockPath, Result, V6FileSystem};
use crate::{INODES_PER_BLOCK, INODE_START_SECTOR, ROOT_INUMBER, SECTOR_SIZE};

struct Newlink {
    dirino: u16,
    ino: u16,
    name: &'static [u8],
}

pub struct Fsck {
    /// 1 = 还没见到谁用这个块
    freemap: Bitmap,
    /// 目录扫描统计出的链接数，下标即节点号
    nlinks: Vec<u8>,
    /// 待打的补丁：镜像字节偏移 → 内容。同一偏移先到先得
    patches: BTreeMap<u32, Vec<u8>>,
    /// 待补的 `.`/`..` 链接，要分配块，排在补丁之后
    newlinks: Vec<Newlink>,
}

impl Fsck {
    pub fn new(fs: &V6FileSystem) -> Self {
        let mut freemap = Bitmap::new(
            fs.superblock.s_fsize as usize,
            fs.superblock.datastart() as usize,
        );
        freemap.fill(true);
        Self {
            freemap,
            nlinks: vec![
                0;
                ROOT_INUMBER as usize
                    + fs.superblock.s_isize as usize * INODES_PER_BLOCK as usize
            ],
            patches: BTreeMap::new(),
            newlinks: Vec::new(),
        }
    }

    fn report(&self, ctx: &str, args: fmt::Arguments) {
        if ctx.is_empty() {
            println!("{args}");
        } else {
            println!("{ctx}: {args}");
        }
    }

    fn valid_inum(&self, inum: u16) -> bool {
        inum >= ROOT_INUMBER && (inum as usize) < self.nlinks.len()
    }

    fn patch(&mut self, offset: u32, bytes: Vec<u8>) {
        self.patches.entry(offset).or_insert(bytes);
    }

    fn patch16(&mut self, offset: u32, v: u16) {
        self.patch(offset, v.to_le_bytes().to_vec());
    }

    fn inode_offset(fs: &V6FileSystem, inum: u16) -> u32 {
        fs.iblock(inum) as u32 * SECTOR_SIZE as u32
            + V6FileSystem::iindex(inum) as u32 * INODE_SIZE as u32
    }

    /* ---------- 第一遍：块引用 ---------- */

    pub fn scan_inodes(&mut self, fs: &mut V6FileSystem) -> Result<bool> {
        let mut res = true;
        for ino in ROOT_INUMBER as usize..self.nlinks.len() {
            let ctx = format!("inode {ino}");
            let ip = fs.iget(ino as u16)?;
            if !self.scan_inode_blocks(fs, &ip, &ctx)? {
                res = false;
            }
        }
        Ok(res)
    }

    fn scan_inode_blocks(&mut self, fs: &mut V6FileSystem, ip: &InodeRef, ctx: &str) -> Result<bool> {
        let (mode, size) = {
            let g = ip.lock().unwrap();
            (g.d.i_mode, g.d.size())
        };
        // 设备节点的 i_addr 放的是设备号，不是块号
        if mode & IFMT == IFCHR || mode & IFMT == IFBLK {
            return Ok(true);
        }
        self.scan_blocks(
            fs,
            &PtrArray::Inode(ip.clone()),
            sentinel_path(mode, size),
            ctx,
        )
    }

    /// 沿哨兵路径扫指针数组。返回 false 时整个数组不可信，
    /// 上级要把指向它的指针抹零。
    fn scan_blocks(
        &mut self,
        fs: &mut V6FileSystem,
        ba: &PtrArray,
        end: BlockPath,
        ctx: &str,
    ) -> Result<bool> {
        if !ba.is_inode() && !ba.check(fs, end.height() == 2) {
            return Ok(false);
        }
        let mut res = true;
        for i in 0..ba.len() {
            let bn = ba.at(i);
            if bn == 0 {
                continue;
            }
            if fs.badblock(bn) {
                self.report(ctx, format_args!("block {bn}: bad block number in inode"));
            } else if (i as u16) > end.index()
                || (i as u16 == end.index() && end.tail().is_zero())
            {
                self.report(ctx, format_args!("block {bn}: allocated beyond end of file"));
            } else if !self.freemap.at(bn as usize) {
                self.report(ctx, format_args!("block {bn}: cross-allocated"));
            } else {
                self.freemap.set(bn as usize, false);
                if end.height() <= 1 {
                    continue;
                }
                let child = fs.bread(bn)?;
                if self.scan_blocks(fs, &PtrArray::Block(child), end.tail_at(i as u16), ctx)? {
                    continue;
                }
            }
            self.patch16(ba.pointer_offset(fs, i), 0);
            res = false;
        }
        Ok(res)
    }

    /* ---------- 第二遍：目录结构 ---------- */

    pub fn scan_directory(
        &mut self,
        fs: &mut V6FileSystem,
        ip: &InodeRef,
        parent: u16,
        ctx: &str,
    ) -> Result<bool> {
        let ctx = format!("{ctx}/");
        let my_inum = ip.lock().unwrap().inum();
        let parent = if parent == 0 { my_inum } else { parent };

        let mut res = true;
        let (mut dot_ok, mut dotdot_ok) = (false, false);
        let mut names: HashSet<Vec<u8>> = HashSet::new();

        let mut c = Cursor::new(ip.clone());
        while let Some(span) = c.readref(fs, DirEntry::SIZE)? {
            let (inum, name) = span.map(|d: &DirEntry| (d.d_inumber, d.name().to_vec()));
            if inum == 0 {
                continue;
            }
            let entry_off =
                span.bp.lock().unwrap().blockno() as u32 * SECTOR_SIZE as u32 + span.off as u32;
            let shown = String::from_utf8_lossy(&name).into_owned();

            if !self.valid_inum(inum) {
                self.report(&ctx, format_args!("invalid inumber {inum} for {shown}"));
                res = false;
                self.patch16(entry_off, 0);
                continue;
            }
            if !names.insert(name.clone()) {
                self.report(
                    &ctx,
                    format_args!("duplicate directory entry for \"{shown}\""),
                );
                res = false;
                self.patch16(entry_off, 0);
                continue;
            }
            if name == b"." {
                if inum != my_inum {
                    self.report(&ctx, format_args!("incorrect \".\" inumber"));
                    res = false;
                    self.patch16(entry_off, my_inum);
                }
                dot_ok = true;
                self.nlinks[my_inum as usize] = self.nlinks[my_inum as usize].saturating_add(1);
                continue;
            }
            if name == b".." {
                if inum != parent {
                    self.report(&ctx, format_args!("incorrect \"..\" inumber"));
                    res = false;
                    self.patch16(entry_off, parent);
                }
                dotdot_ok = true;
                self.nlinks[parent as usize] = self.nlinks[parent as usize].saturating_add(1);
                continue;
            }

            self.nlinks[inum as usize] = self.nlinks[inum as usize].saturating_add(1);
            let eip = fs.iget(inum)?;
            if !eip.lock().unwrap().d.is_allocated() {
                self.report(
                    &ctx,
                    format_args!("directory entry {shown} for unallocated inode {inum}"),
                );
                res = false;
                self.nlinks[inum as usize] -= 1;
                self.patch16(entry_off, 0);
                continue;
            }
            if eip.lock().unwrap().d.is_dir() {
                if self.nlinks[inum as usize] != 1 {
                    self.report(
                        &ctx,
                        format_args!("hard link \"{shown}\" to directory {inum}"),
                    );
                    res = false;
                    self.nlinks[inum as usize] -= 1;
                    self.patch16(entry_off, 0);
                    continue;
                }
                let child_ctx = format!("{ctx}{shown}");
                if !self.scan_directory(fs, &eip, my_inum, &child_ctx)? {
                    res = false;
                }
            }
        }

        if !dot_ok {
            self.report(&ctx, format_args!("missing \".\""));
            self.newlinks.push(Newlink {
                dirino: my_inum,
                ino: my_inum,
                name: b".",
            });
            self.nlinks[my_inum as usize] = self.nlinks[my_inum as usize].saturating_add(1);
        }
        if !dotdot_ok {
            self.report(&ctx, format_args!("missing \"..\""));
            self.newlinks.push(Newlink {
                dirino: my_inum,
                ino: parent,
                name: b"..",
            });
            self.nlinks[parent as usize] = self.nlinks[parent as usize].saturating_add(1);
        }
        Ok(res && dot_ok && dotdot_ok)
    }

    /* ---------- 第三遍：链接计数 ---------- */

    pub fn fix_nlink(&mut self, fs: &mut V6FileSystem) -> Result<bool> {
        let mut res = true;
        for i in ROOT_INUMBER as usize..self.nlinks.len() {
            let ip = fs.iget(i as u16)?;
            let n = self.nlinks[i];
            let (allocated, nlink) = {
                let g = ip.lock().unwrap();
                (g.d.is_allocated(), g.d.i_nlink)
            };
            if n == 0 {
                if allocated {
                    self.report("", format_args!("clearing unreachable inode {i}"));
                    res = false;
                    self.patch(Self::inode_offset(fs, i as u16), vec![0; INODE_SIZE]);
                }
            } else if n != nlink {
                self.report(
                    "",
                    format_args!("inode {i}: link count {nlink} should be {n}"),
                );
                res = false;
                self.patch(Self::inode_offset(fs, i as u16) + 2, vec![n]);
            }
        }
        Ok(res)
    }

    /* ---------- 套用修补 ---------- */

    /// 补丁直写家位置（不经日志），然后从扫描位图重建空闲表，
    /// 最后按正常路径加缺失的 `.`/`..`
    pub fn apply(&mut self, fs: &mut V6FileSystem) -> Result<()> {
        fs.invalidate()?;
        for (pos, contents) in std::mem::take(&mut self.patches) {
            assert!(pos as usize % SECTOR_SIZE + contents.len() <= SECTOR_SIZE);
            let bp = fs.bread((pos / SECTOR_SIZE as u32) as u16)?;
            let mut g = bp.lock().unwrap();
            let off = pos as usize % SECTOR_SIZE;
            g.data.0[off..off + contents.len()].copy_from_slice(&contents);
            g.bdwrite();
        }
        fs.sync();

        // 重建的是遗留格式的空闲表，日志位图作废
        fs.superblock.s_uselog = 0;
        self.rebuild_freelist(fs)?;

        for nl in std::mem::take(&mut self.newlinks) {
            let ip = fs.iget(nl.dirino)?;
            let de = fs.dir_create(&ip, nl.name)?;
            de.set_inum(fs, nl.ino)?;
        }
        fs.sync();
        Ok(())
    }

    fn rebuild_freelist(&mut self, fs: &mut V6FileSystem) -> Result<()> {
        fs.superblock.s_nfree = 0;
        let start = INODE_START_SECTOR + fs.superblock.s_isize;
        // 空闲表先进后出，倒着放让后续分配更连续
        for bn in (start..fs.superblock.s_fsize).rev() {
            if self.freemap.at(bn as usize) {
                fs.bfree(bn)?;
            }
        }
        Ok(())
    }
}

/// 整趟检查。`write` 为假时只报告不修，返回镜像是否干净。
pub fn fsck(fs: &mut V6FileSystem, write: bool) -> Result<bool> {
    let mut f = Fsck::new(fs);
    let mut res = true;

    if !f.scan_inodes(fs)? {
        println!("scan inodes required fixes");
        res = false;
        if write {
            f.apply(fs)?;
        }
    }

    {
        let ok = match fsops::fs_freemap(fs) {
            Ok(fm) => fm == f.freemap,
            Err(_) => false,
        };
        if !ok {
            println!("free list was incorrect");
            res = false;
        }
    }

    let root = fs.iget(ROOT_INUMBER)?;
    if !f.scan_directory(fs, &root, ROOT_INUMBER, "")? {
        println!("scan directories required fixes");
        res = false;
        if write {
            f.apply(fs)?;
        }
    }
    drop(root);

    if !f.fix_nlink(fs)? {
        println!("fix link count required fixes");
        res = false;
    }

    if fs.superblock.s_ninode as usize > fs.superblock.s_inode.len() {
        println!("invalid s_ninode");
        fs.superblock.s_ninode = 0;
        res = false;
    } else {
        for k in 0..fs.superblock.s_ninode as usize {
            let inum = fs.superblock.s_inode[k];
            if !f.valid_inum(inum) || f.nlinks[inum as usize] != 0 {
                println!("invalid inode {inum} in free list");
                fs.superblock.s_ninode = 0;
                res = false;
            }
        }
    }

    if write {
        f.apply(fs)?;
        // 强迫下次挂载重扫空闲节点
        fs.superblock.s_ninode = 0;
        fs.superblock.s_fmod = 1;
        fs.superblock.s_dirty = 0;
        fs.unclean = false;
    } else {
        fs.superblock.s_fmod = 0;
        fs.invalidate()?;
    }

    if !res {
        println!("File system was corrupt");
    }
    Ok(res)
}
