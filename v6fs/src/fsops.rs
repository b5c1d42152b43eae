//! # 高层操作
//!
//! 路径解析和建删改链接这一层。每个修改操作各自是一个事务，
//! 权限检查通过调用方注入的钩子完成（挂载层按 uid/gid 算，
//! 工具直接放行）。

use core::mem::offset_of;

use block_dev::RawDevice;
use enumflags2::{bitflags, BitFlags};

use crate::cache::InodeSlot;
use crate::cursor::Cursor;
use crate::inode::{Dirent, DoLog};
use crate::layout::{DirEntry, DiskInode, IALLOC, IFDIR, IFMT, NAME_MAX_LEN};
use crate::{Bitmap, Error, Result, V6FileSystem};
use crate::{INODES_PER_BLOCK, INODE_START_SECTOR, ROOT_INUMBER, SECTOR_SIZE};

/// 目录链接数的上限，`i_nlink` 只有一个字节
const MAX_NLINK: u8 = 255;

/// 权限钩子：返回 3 位掩码，4=读 2=写 1=执行
pub type PermFn<'a> = &'a dyn Fn(&InodeSlot) -> u8;

/// 不设防的权限钩子
pub fn full_perms(_: &InodeSlot) -> u8 {
    7
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameFlag {
    /// 允许最后一段是 `.` 或 `..`
    DotOk,
    /// 不存在就建目录项（节点号填 0）
    Create,
    /// 配合 `Create`：名字必须尚不存在
    Exclusive,
    /// 要求目录可写（删链接用）
    DirWrite,
}

/// 把路径拆成组件。`.` 丢掉，`..` 在词法层回退一级，
/// 回退不动（已在根上）就留给目录里的 `..` 项处理。
pub fn path_components(s: &str) -> Vec<&str> {
    let mut ret = Vec::new();
    for c in s.split('/') {
        if c.is_empty() {
            continue;
        }
        if c == ".." && !ret.is_empty() {
            ret.pop();
        } else if c != "." {
            ret.push(c);
        }
    }
    ret
}

/// 拆成（目录，文件名）。尾随斜杠的文件名折算成 `.`
pub fn splitpath(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        None => (".", path),
        Some(p) => {
            let tail = &path[p + 1..];
            let mut q = p;
            while q > 1 && path.as_bytes()[q - 1] == b'/' {
                q -= 1;
            }
            (&path[..q], if tail.is_empty() { "." } else { tail })
        }
    }
}

/// 从 `start` 起解析 `path`，返回最后一段的目录项句柄。
/// 途经的每一级目录都要有执行位；`Create` 还要求父目录可写。
pub fn named(
    fs: &mut V6FileSystem,
    start: u16,
    path: &str,
    flags: BitFlags<NameFlag>,
    access: PermFn,
) -> Result<Dirent> {
    debug_assert!(
        !flags.contains(NameFlag::Create) || fs.log.as_ref().map_or(true, |l| l.in_tx),
        "creating dirent outside transaction"
    );

    let mut cs = path_components(path);
    if cs.is_empty() {
        cs.push(".");
    }
    let name = cs.pop().unwrap();
    if name.len() > NAME_MAX_LEN {
        return Err(Error::NameTooLong);
    }
    if (name == "." || name == "..")
        && flags & (NameFlag::DotOk | NameFlag::Create) != BitFlags::<NameFlag>::from(NameFlag::DotOk)
    {
        return Err(Error::Inval);
    }

    let mut ip = fs.iget(start)?;
    let mut i = 0;
    loop {
        if ip.lock().unwrap().d.i_mode & IFMT != IFDIR {
            return Err(Error::NotDir);
        }
        if access(&ip.lock().unwrap()) & 1 == 0 {
            return Err(Error::Acces);
        }
        if i == cs.len() {
            break;
        }
        let Some(de) = fs.dir_lookup(&ip, cs[i].as_bytes())? else {
            return Err(Error::NoEnt);
        };
        let inum = de.inum();
        ip = fs.iget(inum)?;
        i += 1;
    }

    let perm = access(&ip.lock().unwrap());
    if flags.contains(NameFlag::DirWrite) && perm & 2 == 0 {
        return Err(Error::Acces);
    }

    let de = if perm & 2 != 0 && flags.contains(NameFlag::Create) {
        Some(fs.dir_create(&ip, name.as_bytes())?)
    } else {
        fs.dir_lookup(&ip, name.as_bytes())?
    };
    let Some(de) = de else {
        return Err(Error::NoEnt);
    };
    if flags.contains(NameFlag::Exclusive) && de.inum() != 0 {
        return Err(Error::Exist);
    }
    Ok(de)
}

/// 建节点的初始化钩子在事务里跑，设权限和设备号之类
pub type InodeInit<'a> = &'a dyn Fn(&mut DiskInode);

pub fn mknod(fs: &mut V6FileSystem, de: &Dirent, init: Option<InodeInit>) -> Result<()> {
    if de.inum() != 0 {
        return Err(Error::Exist);
    }

    let ip = fs.ialloc()?;
    fs.with_tx(|fs| {
        {
            let mut g = ip.lock().unwrap();
            g.d.i_mode = IALLOC;
            g.d.i_nlink = 1;
        }
        fs.atouch(&ip);
        {
            let mut g = ip.lock().unwrap();
            let t = g.d.atime();
            g.d.set_mtime(t);
        }
        match init {
            Some(f) => {
                let mut g = ip.lock().unwrap();
                f(&mut g.d);
                g.d.i_mode |= IALLOC;
            }
            None => ip.lock().unwrap().d.i_mode |= 0o666,
        }
        fs.patch_inode_whole(&ip)?;
        let inum = ip.lock().unwrap().inum();
        de.set_inum(fs, inum)
    })
}

pub fn mkdir(fs: &mut V6FileSystem, de: &Dirent, init: Option<InodeInit>) -> Result<()> {
    if de.inum() != 0 {
        return Err(Error::Exist);
    }
    if de.dir.lock().unwrap().d.i_nlink >= MAX_NLINK {
        return Err(Error::TooManyLinks);
    }

    let ip = fs.ialloc()?;
    fs.with_tx(|fs| {
        {
            let mut g = ip.lock().unwrap();
            g.d.i_mode = IFDIR | IALLOC;
            g.d.i_nlink = 2;
        }
        fs.atouch(&ip);
        {
            let mut g = ip.lock().unwrap();
            let t = g.d.atime();
            g.d.set_mtime(t);
        }
        match init {
            Some(f) => {
                let mut g = ip.lock().unwrap();
                f(&mut g.d);
                g.d.i_mode = (g.d.i_mode & !IFMT) | IFDIR | IALLOC;
            }
            None => ip.lock().unwrap().d.i_mode |= 0o777,
        }
        let inum = ip.lock().unwrap().inum();
        de.set_inum(fs, inum)?;
        let dot = fs.dir_create(&ip, b".")?;
        dot.set_inum(fs, inum)?;
        let parent = de.dir.lock().unwrap().inum();
        let dotdot = fs.dir_create(&ip, b"..")?;
        dotdot.set_inum(fs, parent)?;
        fs.patch_inode_whole(&ip)?;

        de.dir.lock().unwrap().d.i_nlink += 1;
        fs.patch_inode(&de.dir, offset_of!(DiskInode, i_nlink), 1)
    })
}

pub fn rmdir(fs: &mut V6FileSystem, de: &Dirent) -> Result<()> {
    if de.inum() == 0 {
        return Err(Error::NoEnt);
    }
    let ip = fs.iget(de.inum())?;
    if !ip.lock().unwrap().d.is_dir() {
        return Err(Error::NotDir);
    }

    {
        let mut c = Cursor::new(ip.clone());
        while let Some(span) = c.readref(fs, DirEntry::SIZE)? {
            let occupied = span.map(|d: &DirEntry| {
                d.d_inumber != 0 && d.name() != b"." && d.name() != b".."
            });
            if occupied {
                return Err(Error::NotEmpty);
            }
        }
    }

    // 截断可能同时要间接块和数据块两个缓冲
    if !fs.can_alloc_bufs(2) {
        return Err(Error::NoMem("rmdir"));
    }
    fs.with_tx(|fs| {
        de.set_inum(fs, 0)?;
        de.dir.lock().unwrap().d.i_nlink -= 1;
        fs.patch_inode(&de.dir, offset_of!(DiskInode, i_nlink), 1)?;
        fs.mtouch(&de.dir, DoLog::Yes)?;
        fs.iclear(&ip)?;
        let inum = ip.lock().unwrap().inum();
        fs.ifree(inum);
        Ok(())
    })
}

pub fn link(fs: &mut V6FileSystem, oldde: &Dirent, newde: &Dirent) -> Result<()> {
    if oldde.inum() == 0 {
        return Err(Error::NoEnt);
    }
    if newde.inum() != 0 {
        return Err(Error::Exist);
    }
    let ip = fs.iget(oldde.inum())?;
    if ip.lock().unwrap().d.i_nlink >= MAX_NLINK {
        return Err(Error::TooManyLinks);
    }

    fs.with_tx(|fs| {
        fs.mtouch(&ip, DoLog::Yes)?;
        ip.lock().unwrap().d.i_nlink += 1;
        fs.patch_inode(&ip, offset_of!(DiskInode, i_nlink), 1)?;
        let inum = ip.lock().unwrap().inum();
        newde.set_inum(fs, inum)
    })
}

pub fn unlink(fs: &mut V6FileSystem, de: &Dirent) -> Result<()> {
    if de.inum() == 0 {
        return Err(Error::NoEnt);
    }
    let ip = fs.iget(de.inum())?;
    fs.with_tx(|fs| {
        de.set_inum(fs, 0)?;
        let nlink = ip.lock().unwrap().d.i_nlink;
        if nlink > 1 {
            ip.lock().unwrap().d.i_nlink -= 1;
            fs.patch_inode(&ip, offset_of!(DiskInode, i_nlink), 1)
        } else {
            fs.iclear(&ip)
        }
    })
}

/// 改名。目标存在则先顶掉（同一个事务内）；
/// 跨目录时两边目录的补丁各记各的，尽力而为。
pub fn rename(fs: &mut V6FileSystem, oldpath: &str, newpath: &str, access: PermFn) -> Result<()> {
    let oldde = named(fs, ROOT_INUMBER, oldpath, NameFlag::DirWrite.into(), access)?;

    fs.with_tx(|fs| {
        let newde = named(fs, ROOT_INUMBER, newpath, NameFlag::Create.into(), access)?;
        rename_at(fs, &oldde, &newde)
    })
}

/// `rename` 的目录项版本，调用方负责事务
pub fn rename_at(fs: &mut V6FileSystem, oldde: &Dirent, newde: &Dirent) -> Result<()> {
    if oldde.inum() == 0 {
        return Err(Error::NoEnt);
    }
    if newde.inum() != 0 {
        let tp = fs.iget(newde.inum())?;
        let nlink = tp.lock().unwrap().d.i_nlink;
        if nlink > 1 {
            tp.lock().unwrap().d.i_nlink -= 1;
            fs.patch_inode(&tp, offset_of!(DiskInode, i_nlink), 1)?;
            fs.mtouch(&tp, DoLog::Yes)?;
        } else {
            let inum = tp.lock().unwrap().inum();
            fs.iclear(&tp)?;
            fs.ifree(inum);
        }
    }

    let ip = fs.iget(oldde.inum())?;
    let inum = ip.lock().unwrap().inum();
    newde.set_inum(fs, inum)?;
    oldde.set_inum(fs, 0)?;

    // 目录跨父挪动：`..` 指向新父，两边父目录的链接数跟着走
    let old_parent = oldde.dir.lock().unwrap().inum();
    let new_parent = newde.dir.lock().unwrap().inum();
    if old_parent != new_parent && ip.lock().unwrap().d.is_dir() {
        if let Some(dd) = fs.dir_lookup(&ip, b"..")? {
            dd.set_inum(fs, new_parent)?;
        }
        oldde.dir.lock().unwrap().d.i_nlink -= 1;
        fs.patch_inode(&oldde.dir, offset_of!(DiskInode, i_nlink), 1)?;
        newde.dir.lock().unwrap().d.i_nlink += 1;
        fs.patch_inode(&newde.dir, offset_of!(DiskInode, i_nlink), 1)?;
    }
    fs.mtouch(&ip, DoLog::Yes)
}

/// 空闲节点数，扫全表，statvfs 用
pub fn num_free_inodes(fs: &mut V6FileSystem) -> Result<usize> {
    let mut n = 0;
    for i in (INODE_START_SECTOR..INODE_START_SECTOR + fs.superblock.s_isize).rev() {
        let bp = fs.bread(i)?;
        for j in 0..INODES_PER_BLOCK {
            let inum = (i - INODE_START_SECTOR) * INODES_PER_BLOCK + j + 1;
            // 缓存里的副本比磁盘新
            let free = match fs.try_iget(inum) {
                Some(ip) => !ip.lock().unwrap().d.is_allocated(),
                None => {
                    let g = bp.lock().unwrap();
                    !g.get::<DiskInode>(j as usize * crate::layout::INODE_SIZE)
                        .is_allocated()
                }
            };
            if free {
                n += 1;
            }
        }
    }
    Ok(n)
}

pub fn num_free_blocks(fs: &mut V6FileSystem) -> Result<usize> {
    if let Some(l) = fs.log.as_ref() {
        return Ok(l.freemap.popcount());
    }
    if fs.superblock.s_uselog != 0 {
        let mut fm = Bitmap::new(
            fs.superblock.s_fsize as usize,
            fs.superblock.datastart() as usize,
        );
        fs.dev.read_exact_at(
            fm.as_bytes_mut(),
            (fs.superblock.s_fsize as u64 + 1) * SECTOR_SIZE as u64,
        )?;
        fm.tidy();
        return Ok(fm.popcount());
    }

    let mut n = fs.superblock.s_nfree as usize;
    if n == 0 {
        return Ok(0);
    }
    let mut next = fs.superblock.s_free[0];
    while next != 0 {
        let bp = fs.bread(next)?;
        n += fs.superblock.s_free.len();
        next = *bp.lock().unwrap().get::<u16>(0);
        fs.cache.b.free(bp.lock().unwrap().blockno());
    }
    // 链表以块号 0 收尾，去掉这个结束标记
    Ok(n - 1)
}

/// 空闲块位图的快照。带日志就抄内存位图；镜像支持日志但当前
/// 没挂日志则读磁盘副本；否则遍历 1975 年款的百宽空闲链表。
pub fn fs_freemap(fs: &mut V6FileSystem) -> Result<Bitmap> {
    let mut freemap = Bitmap::new(
        fs.superblock.s_fsize as usize,
        fs.superblock.datastart() as usize,
    );
    if let Some(l) = fs.log.as_ref() {
        freemap.as_bytes_mut().copy_from_slice(l.freemap.as_bytes());
    } else if fs.superblock.s_uselog != 0 {
        fs.dev.read_exact_at(
            freemap.as_bytes_mut(),
            (fs.superblock.s_fsize as u64 + 1) * SECTOR_SIZE as u64,
        )?;
        freemap.tidy();
    } else if fs.superblock.s_nfree != 0 {
        for i in (1..fs.superblock.s_nfree as usize).rev() {
            freemap.checked_set(fs.superblock.s_free[i] as usize, true)?;
        }
        let mut bn = fs.superblock.s_free[0];
        while bn != 0 {
            freemap.checked_set(bn as usize, true)?;
            let bp = fs.bread(bn)?;
            let g = bp.lock().unwrap();
            for i in (1..fs.superblock.s_free.len()).rev() {
                freemap.checked_set(*g.get::<u16>(2 * i) as usize, true)?;
            }
            bn = *g.get::<u16>(0);
        }
    }
    Ok(freemap)
}
