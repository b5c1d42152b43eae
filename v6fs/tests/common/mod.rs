//! 测试用的镜像搭建。布局和 mkv6fs 工具一致，
//! 直接用库的公开接口铺超级块、空闲表和根目录。
#![allow(dead_code)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use enumflags2::BitFlags;
use tempfile::TempDir;
use v6fs::fsops::{self, NameFlag};
use v6fs::layout::{self, FileSys, IALLOC, IFDIR};
use v6fs::{
    Cursor, DoLog, FsCache, InodeRef, OpenFlag, V6FileSystem, V6Log, BOOTBLOCK_MAGIC,
    INODES_PER_BLOCK, ROOT_INUMBER, SECTOR_SIZE, SUPERBLOCK_SECTOR,
};

pub struct TestImage {
    pub path: PathBuf,
    _dir: TempDir,
}

/// 造一个 `nblocks` 扇区的镜像，可选日志区
pub fn mkfs(nblocks: u16, ninodes: u16, log_blocks: Option<u16>) -> TestImage {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v6.img");

    let fd = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .unwrap();
    fd.set_len(nblocks as u64 * SECTOR_SIZE as u64).unwrap();

    let mut sb = FileSys::zeroed();
    sb.s_isize = ninodes.div_ceil(INODES_PER_BLOCK);
    sb.s_fsize = nblocks;
    fd.write_all_at(
        &layout::to_sector(&sb),
        SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64,
    )
    .unwrap();
    fd.write_all_at(&BOOTBLOCK_MAGIC.to_le_bytes(), 0).unwrap();
    drop(fd);

    let mut fs = V6FileSystem::open(&path, FsCache::default(), BitFlags::empty()).unwrap();
    let start = fs.superblock.datastart();
    for bn in (start..nblocks).rev() {
        fs.bfree(bn).unwrap();
    }

    let ip = fs.iget(ROOT_INUMBER).unwrap();
    let bp = fs.balloc(true).unwrap();
    {
        let mut g = ip.lock().unwrap();
        g.d.i_mode = IALLOC | IFDIR | 0o755;
        g.d.i_nlink = 2;
        g.d.i_addr[0] = bp.lock().unwrap().blockno();
    }
    fs.mtouch(&ip, DoLog::Yes).unwrap();
    fs.atouch(&ip);
    let dot = fs.dir_create(&ip, b".").unwrap();
    dot.set_inum(&mut fs, ROOT_INUMBER).unwrap();
    let dotdot = fs.dir_create(&ip, b"..").unwrap();
    dotdot.set_inum(&mut fs, ROOT_INUMBER).unwrap();
    drop((dot, dotdot, ip, bp));

    if let Some(lb) = log_blocks {
        V6Log::create(&mut fs, lb).unwrap();
    }
    fs.close().unwrap();

    TestImage { path, _dir: dir }
}

pub fn open(path: &Path, flags: BitFlags<OpenFlag>) -> V6FileSystem {
    V6FileSystem::open(path, FsCache::default(), flags).unwrap()
}

pub fn create_file(fs: &mut V6FileSystem, path: &str) -> InodeRef {
    let inum = fs
        .with_tx(|fs| {
            let de = fsops::named(
                fs,
                ROOT_INUMBER,
                path,
                NameFlag::Create.into(),
                &fsops::full_perms,
            )?;
            if de.inum() == 0 {
                fsops::mknod(fs, &de, None)?;
            }
            Ok(de.inum())
        })
        .unwrap();
    fs.iget(inum).unwrap()
}

pub fn mkdir(fs: &mut V6FileSystem, path: &str) {
    fs.with_tx(|fs| {
        let de = fsops::named(
            fs,
            ROOT_INUMBER,
            path,
            NameFlag::Create | NameFlag::Exclusive,
            &fsops::full_perms,
        )?;
        fsops::mkdir(fs, &de, None)
    })
    .unwrap();
}

pub fn write_at(fs: &mut V6FileSystem, ip: &InodeRef, offset: u32, data: &[u8]) {
    fs.with_tx(|fs| {
        let mut c = Cursor::new(ip.clone());
        c.seek(offset)?;
        c.write(fs, data)
    })
    .unwrap();
}

pub fn read_at(fs: &mut V6FileSystem, ip: &InodeRef, offset: u32, len: usize) -> Vec<u8> {
    let mut c = Cursor::new(ip.clone());
    c.seek(offset).unwrap();
    let mut buf = vec![0; len];
    let n = c.read(fs, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

/// 驻留模式字节串，内容和偏移挂钩，读回校验用
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn nlink_of(fs: &mut V6FileSystem, path: &str) -> u8 {
    let ip = fs.namei(path).unwrap().unwrap();
    let n = ip.lock().unwrap().d.i_nlink;
    n
}
