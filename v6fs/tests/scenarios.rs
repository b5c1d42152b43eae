mod common;

use common::*;
use enumflags2::BitFlags;
use v6fs::fsops::{self, NameFlag};
use v6fs::layout::ILARG;
use v6fs::{fsck, OpenFlag, ROOT_INUMBER, SECTOR_SIZE};

#[test]
fn create_write_remount_reread() {
    let img = mkfs(4000, 200, None);
    let data = pattern(1024);

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = create_file(&mut fs, "a");
    write_at(&mut fs, &ip, 0, &data);
    drop(ip);
    fs.close().unwrap();

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = fs.namei("a").unwrap().unwrap();
    {
        let g = ip.lock().unwrap();
        assert_eq!(g.d.size(), 1024);
        assert_eq!(g.d.i_mode & ILARG, 0);
    }
    assert_eq!(read_at(&mut fs, &ip, 0, 2048), data);
}

#[test]
fn journaled_create_survives_remount() {
    let img = mkfs(4000, 200, Some(64));
    let data = pattern(3000);

    let mut fs = open(&img.path, BitFlags::empty());
    assert!(fs.log.is_some());
    let ip = create_file(&mut fs, "a");
    write_at(&mut fs, &ip, 0, &data);
    drop(ip);
    fs.close().unwrap();

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = fs.namei("a").unwrap().unwrap();
    assert_eq!(read_at(&mut fs, &ip, 0, 3000), data);
}

#[test]
fn growing_past_small_threshold_promotes() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    let free_before = fsops::num_free_blocks(&mut fs).unwrap();
    let ip = create_file(&mut fs, "big");
    write_at(&mut fs, &ip, 0, &pattern(4097));

    {
        let g = ip.lock().unwrap();
        assert_eq!(g.d.size(), 4097);
        assert_ne!(g.d.i_mode & ILARG, 0);
        assert_ne!(g.d.i_addr[0], 0);
    }
    // ceil(4097/512) = 9 块数据，外加一个间接块
    let free_after = fsops::num_free_blocks(&mut fs).unwrap();
    assert_eq!(free_before - free_after, 9 + 1);

    assert_eq!(read_at(&mut fs, &ip, 0, 4097), pattern(4097));
}

#[test]
fn sparse_file_reads_zeros() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    let free_before = fsops::num_free_blocks(&mut fs).unwrap();
    let ip = create_file(&mut fs, "s");
    write_at(&mut fs, &ip, 100 * SECTOR_SIZE as u32, b"x");

    assert_eq!(ip.lock().unwrap().d.size(), 100 * SECTOR_SIZE as u32 + 1);
    // 只消耗间接块和真正写到的那一块
    let free_after = fsops::num_free_blocks(&mut fs).unwrap();
    assert_eq!(free_before - free_after, 2);

    let zeros = read_at(&mut fs, &ip, 0, 100 * SECTOR_SIZE);
    assert_eq!(zeros.len(), 100 * SECTOR_SIZE);
    assert!(zeros.iter().all(|&b| b == 0));
    assert_eq!(read_at(&mut fs, &ip, 100 * SECTOR_SIZE as u32, 4), b"x");
}

#[test]
fn unlink_releases_blocks() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    let ip = create_file(&mut fs, "f");
    write_at(&mut fs, &ip, 0, &pattern(50 * SECTOR_SIZE));
    drop(ip);
    let free_before = fsops::num_free_blocks(&mut fs).unwrap();

    fs.with_tx(|fs| {
        let de = fsops::named(
            fs,
            ROOT_INUMBER,
            "f",
            NameFlag::DirWrite.into(),
            &fsops::full_perms,
        )?;
        fsops::unlink(fs, &de)
    })
    .unwrap();

    // 50 块数据加一个间接块回到空闲位图
    let free_after = fsops::num_free_blocks(&mut fs).unwrap();
    assert_eq!(free_after, free_before + 50 + 1);
    assert!(fs.namei("f").unwrap().is_none());
    fs.close().unwrap();

    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(fsck::fsck(&mut fs, false).unwrap());
}

#[test]
fn truncate_demotes_large_file() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    let ip = create_file(&mut fs, "t");
    write_at(&mut fs, &ip, 0, &pattern(20 * SECTOR_SIZE));
    assert_ne!(ip.lock().unwrap().d.i_mode & ILARG, 0);

    fs.with_tx(|fs| fs.itruncate(&ip, 700, v6fs::DoLog::Yes)).unwrap();
    {
        let g = ip.lock().unwrap();
        assert_eq!(g.d.size(), 700);
        assert_eq!(g.d.i_mode & ILARG, 0);
    }
    assert_eq!(read_at(&mut fs, &ip, 0, 700), pattern(700));
}

#[test]
fn rmdir_refuses_nonempty() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    mkdir(&mut fs, "d");
    let ip = create_file(&mut fs, "d/f");
    drop(ip);

    let err = fs
        .with_tx(|fs| {
            let de = fsops::named(
                fs,
                ROOT_INUMBER,
                "d",
                NameFlag::DirWrite.into(),
                &fsops::full_perms,
            )?;
            fsops::rmdir(fs, &de)
        })
        .unwrap_err();
    assert!(matches!(err, v6fs::Error::NotEmpty));
}

#[test]
fn directory_tree_and_rename() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    mkdir(&mut fs, "a");
    mkdir(&mut fs, "a/b");
    assert_eq!(nlink_of(&mut fs, "/"), 3);
    assert_eq!(nlink_of(&mut fs, "a"), 3);

    fsops::rename(&mut fs, "a/b", "c", &fsops::full_perms).unwrap();

    assert_eq!(nlink_of(&mut fs, "/"), 4);
    assert_eq!(nlink_of(&mut fs, "a"), 2);
    assert_eq!(nlink_of(&mut fs, "c"), 2);
    assert!(fs.namei("a/b").unwrap().is_none());

    // `/c/..` 指回根
    let c = fs.namei("c").unwrap().unwrap();
    let dd = fs.dir_lookup(&c, b"..").unwrap().unwrap();
    assert_eq!(dd.inum(), ROOT_INUMBER);
    drop((c, dd));
    fs.close().unwrap();

    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(fsck::fsck(&mut fs, false).unwrap());
}

#[test]
fn hard_links_and_counts() {
    let img = mkfs(4000, 200, Some(64));
    let mut fs = open(&img.path, BitFlags::empty());

    let ip = create_file(&mut fs, "x");
    drop(ip);
    fs.with_tx(|fs| {
        let oldde = fsops::named(fs, ROOT_INUMBER, "x", BitFlags::empty(), &fsops::full_perms)?;
        let newde = fsops::named(
            fs,
            ROOT_INUMBER,
            "y",
            NameFlag::Create | NameFlag::Exclusive,
            &fsops::full_perms,
        )?;
        fsops::link(fs, &oldde, &newde)
    })
    .unwrap();

    assert_eq!(nlink_of(&mut fs, "x"), 2);
    let x = fs.namei("x").unwrap().unwrap();
    let y = fs.namei("y").unwrap().unwrap();
    assert_eq!(x.lock().unwrap().inum(), y.lock().unwrap().inum());
    drop((x, y));

    fs.with_tx(|fs| {
        let de = fsops::named(
            fs,
            ROOT_INUMBER,
            "x",
            NameFlag::DirWrite.into(),
            &fsops::full_perms,
        )?;
        fsops::unlink(fs, &de)
    })
    .unwrap();
    assert!(fs.namei("x").unwrap().is_none());
    assert_eq!(nlink_of(&mut fs, "y"), 1);
}

#[test]
fn named_rejects_bad_names() {
    let img = mkfs(4000, 200, None);
    let mut fs = open(&img.path, BitFlags::empty());

    assert!(matches!(
        fsops::named(
            &mut fs,
            ROOT_INUMBER,
            "this-name-is-way-too-long",
            BitFlags::empty(),
            &fsops::full_perms,
        ),
        Err(v6fs::Error::NameTooLong)
    ));
    assert!(matches!(
        fsops::named(
            &mut fs,
            ROOT_INUMBER,
            ".",
            BitFlags::empty(),
            &fsops::full_perms,
        ),
        Err(v6fs::Error::Inval)
    ));
    // DotOk 放行
    assert!(fsops::named(
        &mut fs,
        ROOT_INUMBER,
        ".",
        NameFlag::DotOk.into(),
        &fsops::full_perms,
    )
    .is_ok());
}
