mod common;

use std::mem;

use common::*;
use enumflags2::BitFlags;
use v6fs::fsops::{self, NameFlag};
use v6fs::{fsck, OpenFlag, Replay, V6FileSystem, ROOT_INUMBER};

/// 模拟崩溃：数据块已写回（它们不经日志，随时可以回家），
/// 日志已刷出，元数据的家位置一个字节没动，然后直接丢弃句柄。
fn crash(mut fs: V6FileSystem) {
    assert!(fs.sync());
    fs.flush_log().unwrap();
    mem::forget(fs);
}

/// 提交过的事务在崩溃后由重放恢复出来
#[test]
fn replay_recovers_committed_tx() {
    let img = mkfs(4000, 200, Some(64));
    let data = pattern(2000);

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = create_file(&mut fs, "a");
    write_at(&mut fs, &ip, 0, &data);
    drop(ip);
    crash(fs);

    // 不重放时文件不可见：目录项和节点还躺在日志里
    {
        let mut peek = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
        assert!(peek.namei("a").unwrap().is_none());
    }

    // 正常挂载触发重放
    let mut fs = open(&img.path, BitFlags::empty());
    let ip = fs.namei("a").unwrap().unwrap();
    assert_eq!(ip.lock().unwrap().d.size(), 2000);
    assert_eq!(read_at(&mut fs, &ip, 0, 2000), data);
    drop(ip);
    fs.close().unwrap();

    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(fsck::fsck(&mut fs, false).unwrap());
}

/// 没提交的事务重放时整体丢弃，分配过的块全回来
#[test]
fn incomplete_tx_is_discarded() {
    let img = mkfs(4000, 200, Some(64));

    let mut fs = open(&img.path, BitFlags::empty());
    let free_before = fsops::num_free_blocks(&mut fs).unwrap();
    let tx = fs.begin().unwrap();
    let de = fsops::named(
        &mut fs,
        ROOT_INUMBER,
        "d",
        NameFlag::Create | NameFlag::Exclusive,
        &fsops::full_perms,
    )
    .unwrap();
    fsops::mkdir(&mut fs, &de, None).unwrap();
    drop(de);
    // 故意不 commit(tx)
    mem::forget(tx);
    crash(fs);

    let mut fs = open(&img.path, BitFlags::empty());
    assert!(fs.namei("d").unwrap().is_none());
    assert_eq!(fsops::num_free_blocks(&mut fs).unwrap(), free_before);
    fs.close().unwrap();

    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(fsck::fsck(&mut fs, false).unwrap());
}

/// 重放是幂等的：对同一镜像再跑一遍 apply，字节不变
#[test]
fn replay_is_idempotent() {
    let img = mkfs(4000, 200, Some(64));

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = create_file(&mut fs, "a");
    write_at(&mut fs, &ip, 0, &pattern(600));
    drop(ip);
    crash(fs);

    let apply = |path: &std::path::Path| {
        let mut fs = open(path, OpenFlag::NoLog.into());
        let mut r = Replay::new(&fs).unwrap();
        r.replay(&mut fs).unwrap();
        fs.close().unwrap();
    };

    apply(&img.path);
    let once = std::fs::read(&img.path).unwrap();
    apply(&img.path);
    let twice = std::fs::read(&img.path).unwrap();
    assert_eq!(once, twice);

    let mut fs = open(&img.path, BitFlags::empty());
    let ip = fs.namei("a").unwrap().unwrap();
    assert_eq!(read_at(&mut fs, &ip, 0, 600), pattern(600));
}

/// 一串操作全部提交后崩溃，恢复出来的正是整个前缀
#[test]
fn crash_prefix_property() {
    let img = mkfs(4000, 200, Some(64));

    let mut fs = open(&img.path, BitFlags::empty());
    for (i, name) in ["f0", "f1", "f2"].iter().enumerate() {
        let ip = create_file(&mut fs, name);
        write_at(&mut fs, &ip, 0, &pattern(700 * (i + 1)));
    }
    crash(fs);

    let mut fs = open(&img.path, BitFlags::empty());
    for (i, name) in ["f0", "f1", "f2"].iter().enumerate() {
        let ip = fs.namei(name).unwrap().unwrap();
        assert_eq!(
            read_at(&mut fs, &ip, 0, 700 * (i + 1)),
            pattern(700 * (i + 1))
        );
    }
    fs.close().unwrap();

    let mut fs = open(&img.path, OpenFlag::NoLog | OpenFlag::ReadOnly);
    assert!(fsck::fsck(&mut fs, false).unwrap());
}

/// 重放后空闲位图和实际占用对得上
#[test]
fn freemap_restored_after_replay() {
    let img = mkfs(4000, 200, Some(64));

    let mut fs = open(&img.path, BitFlags::empty());
    let before = fsops::num_free_blocks(&mut fs).unwrap();
    let ip = create_file(&mut fs, "a");
    write_at(&mut fs, &ip, 0, &pattern(3 * 512));
    drop(ip);
    crash(fs);

    let mut fs = open(&img.path, BitFlags::empty());
    let after = fsops::num_free_blocks(&mut fs).unwrap();
    assert_eq!(before - after, 3);
    fs.close().unwrap();
}

/// 脏标志拦住不带重放的独占挂载
#[test]
fn must_be_clean_rejects_dirty_image() {
    let img = mkfs(4000, 200, Some(64));

    let fs = open(&img.path, BitFlags::empty());
    crash(fs);

    let err = V6FileSystem::open(
        &img.path,
        Default::default(),
        OpenFlag::MustBeClean | OpenFlag::NoLog,
    )
    .unwrap_err();
    assert!(matches!(err, v6fs::Error::Unclean));

    // 带重放资格就放行
    let fs = V6FileSystem::open(
        &img.path,
        Default::default(),
        OpenFlag::MustBeClean | OpenFlag::Replay,
    )
    .unwrap();
    fs.close().unwrap();
}
