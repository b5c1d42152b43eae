mod common;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use common::*;
use enumflags2::BitFlags;
use v6fs::fsck::fsck;
use v6fs::{OpenFlag, V6FileSystem, INODES_PER_BLOCK, INODE_START_SECTOR, SECTOR_SIZE};

fn inode_disk_offset(inum: u16) -> u64 {
    let block = INODE_START_SECTOR as u64 + (inum as u64 - 1) / INODES_PER_BLOCK as u64;
    block * SECTOR_SIZE as u64 + (inum as u64 - 1) % INODES_PER_BLOCK as u64 * 32
}

fn check(fs: &mut V6FileSystem, write: bool) -> bool {
    fsck(fs, write).unwrap()
}

#[test]
fn fresh_image_is_clean() {
    let img = mkfs(2000, 100, None);
    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(check(&mut fs, false));
}

#[test]
fn populated_image_is_clean() {
    let img = mkfs(2000, 100, None);
    {
        let mut fs = open(&img.path, BitFlags::empty());
        mkdir(&mut fs, "d");
        let ip = create_file(&mut fs, "d/f");
        write_at(&mut fs, &ip, 0, &pattern(5000));
        drop(ip);
        fs.close().unwrap();
    }
    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(check(&mut fs, false));
}

#[test]
fn repairs_bad_link_count() {
    let img = mkfs(2000, 100, None);
    let inum = {
        let mut fs = open(&img.path, BitFlags::empty());
        let ip = create_file(&mut fs, "f");
        let inum = ip.lock().unwrap().inum();
        drop(ip);
        fs.close().unwrap();
        inum
    };

    // 把 i_nlink 改成 7
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&img.path)
        .unwrap();
    fd.write_all_at(&[7], inode_disk_offset(inum) + 2).unwrap();
    drop(fd);

    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        assert!(!check(&mut fs, true));
        fs.close().unwrap();
    }
    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(check(&mut fs, false));
    let ip = fs.namei("f").unwrap().unwrap();
    assert_eq!(ip.lock().unwrap().d.i_nlink, 1);
}

#[test]
fn repairs_cross_allocated_block() {
    let img = mkfs(2000, 100, None);
    let (inum_a, addr_b);
    {
        let mut fs = open(&img.path, BitFlags::empty());
        let a = create_file(&mut fs, "a");
        write_at(&mut fs, &a, 0, &pattern(512));
        let b = create_file(&mut fs, "b");
        write_at(&mut fs, &b, 0, &pattern(512));
        inum_a = a.lock().unwrap().inum();
        addr_b = b.lock().unwrap().d.i_addr[0];
        drop((a, b));
        fs.close().unwrap();
    }

    // 让 a 的第一块指向 b 的块：跨文件重复引用
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&img.path)
        .unwrap();
    fd.write_all_at(&addr_b.to_le_bytes(), inode_disk_offset(inum_a) + 8)
        .unwrap();
    drop(fd);

    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        assert!(!check(&mut fs, true));
        fs.close().unwrap();
    }
    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(check(&mut fs, false));
}

#[test]
fn clears_unreachable_inode() {
    let img = mkfs(2000, 100, None);
    let inum = {
        let mut fs = open(&img.path, BitFlags::empty());
        let ip = create_file(&mut fs, "ghost");
        let inum = ip.lock().unwrap().inum();
        drop(ip);
        fs.close().unwrap();
        inum
    };

    // 直接抹掉目录项（节点还留着 IALLOC）：制造孤儿
    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        let root = fs.iget(v6fs::ROOT_INUMBER).unwrap();
        let de = fs.dir_lookup(&root, b"ghost").unwrap().unwrap();
        de.set_inum(&mut fs, 0).unwrap();
        drop((de, root));
        fs.close().unwrap();
    }

    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        assert!(!check(&mut fs, true));
        fs.close().unwrap();
    }
    let mut fs = open(&img.path, OpenFlag::NoLog.into());
    assert!(check(&mut fs, false));
    let ip = fs.iget(inum).unwrap();
    assert!(!ip.lock().unwrap().d.is_allocated());
}

#[test]
fn repairs_broken_dotdot() {
    let img = mkfs(2000, 100, None);
    {
        let mut fs = open(&img.path, BitFlags::empty());
        mkdir(&mut fs, "d");
        fs.close().unwrap();
    }

    // 把 d 的 `..` 指向 d 自己
    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        let d = fs.namei("d").unwrap().unwrap();
        let inum = d.lock().unwrap().inum();
        let de = fs.dir_lookup(&d, b"..").unwrap().unwrap();
        de.set_inum(&mut fs, inum).unwrap();
        drop((de, d));
        fs.close().unwrap();
    }

    {
        let mut fs = open(&img.path, OpenFlag::NoLog.into());
        assert!(!check(&mut fs, true));
        fs.close().unwrap();
    }
    let mut fs = open(&img.path, OpenFlag::NoLog.into());
    assert!(check(&mut fs, false));
    let d = fs.namei("d").unwrap().unwrap();
    let de = fs.dir_lookup(&d, b"..").unwrap().unwrap();
    assert_eq!(de.inum(), v6fs::ROOT_INUMBER);
}
