use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use enumflags2::BitFlags;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use v6fs::fsops::{self, NameFlag};
use v6fs::layout::{DirEntry, DiskInode, IALLOC, IFBLK, IFCHR, IFDIR, IFMT};
use v6fs::{
    Cursor, DoLog, Error, FsCache, InodeRef, InodeSlot, OpenFlag, V6FileSystem,
    INODES_PER_BLOCK, MAX_FILE_SIZE, SECTOR_SIZE,
};

const TTL: Duration = Duration::from_secs(1);

/// Mount a V6 file system image through FUSE (single-threaded)
#[derive(Parser)]
struct Cli {
    image: PathBuf,
    mountpoint: PathBuf,

    /// Create a journal if the image has none
    #[arg(short = 'j')]
    create_journal: bool,

    /// Use the low byte of the uid for access control
    #[arg(long)]
    checkuid: bool,

    /// Mount a dirty file system (beware!)
    #[arg(long)]
    force: bool,

    /// Write metadata to the log but not the file system
    /// (only for generating test cases!)
    #[arg(long)]
    suppress_commit: bool,
}

struct V6Fuse {
    fs: V6FileSystem,
    checkuid: bool,
}

fn timestamp(t: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(t as u64)
}

fn errno(e: &Error) -> i32 {
    -e.errno()
}

impl V6Fuse {
    fn root_user(&self, req: &Request<'_>) -> bool {
        !self.checkuid || req.uid() == 0
    }

    /// 3 位权限掩码，只看 uid/gid 的低字节
    fn perms(&self, req: &Request<'_>, ip: &InodeSlot) -> u8 {
        if self.root_user(req) {
            return 7;
        }
        let (uid, gid) = (req.uid() as u8, req.gid() as u8);
        if ip.d.i_uid == uid {
            (ip.d.i_mode >> 6 & 7) as u8
        } else if ip.d.i_gid == gid {
            (ip.d.i_mode >> 3 & 7) as u8
        } else {
            (ip.d.i_mode & 7) as u8
        }
    }

    fn check_access(&mut self, req: &Request<'_>, ip: &InodeRef, want: u8) -> Result<(), i32> {
        let have = self.perms(req, &ip.lock().unwrap());
        // 掩码换算成 rwx 的哪一位都要有
        if have & want == want {
            Ok(())
        } else {
            Err(libc::EACCES)
        }
    }

    fn iget(&mut self, ino: u64) -> Result<InodeRef, i32> {
        if ino == 0 || ino > self.fs.superblock.s_isize as u64 * INODES_PER_BLOCK as u64 {
            return Err(libc::ENOENT);
        }
        self.fs.iget(ino as u16).map_err(|e| errno(&e))
    }

    fn attr(&self, ip: &InodeRef) -> Result<FileAttr, i32> {
        let g = ip.lock().unwrap();
        if !g.d.is_allocated() {
            log::warn!("invalid unallocated inode {}", g.inum());
            return Err(libc::EIO);
        }
        let kind = match g.d.i_mode & IFMT {
            IFDIR => FileType::Directory,
            IFCHR => FileType::CharDevice,
            IFBLK => FileType::BlockDevice,
            _ => FileType::RegularFile,
        };
        let size = g.d.size() as u64;
        Ok(FileAttr {
            ino: g.inum() as u64,
            size,
            blocks: size.div_ceil(SECTOR_SIZE as u64),
            atime: timestamp(g.d.atime()),
            mtime: timestamp(g.d.mtime()),
            ctime: timestamp(g.d.mtime()),
            crtime: UNIX_EPOCH,
            kind,
            perm: g.d.i_mode & 0o7777,
            nlink: g.d.i_nlink as u32,
            uid: g.d.i_uid as u32,
            gid: g.d.i_gid as u32,
            rdev: if matches!(kind, FileType::CharDevice | FileType::BlockDevice) {
                (g.d.major() as u32) << 8 | g.d.minor() as u32
            } else {
                0
            },
            blksize: SECTOR_SIZE as u32,
            flags: 0,
        })
    }

    /// 取添删链接用的目录项，名字不得是 `.`/`..`
    fn dirent(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        flags: BitFlags<NameFlag>,
    ) -> Result<v6fs::Dirent, i32> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let dp = self.iget(parent)?;
        {
            let g = dp.lock().unwrap();
            if !g.d.is_dir() {
                return Err(libc::ENOTDIR);
            }
        }
        let uid = req.uid();
        let gid = req.gid();
        let checkuid = self.checkuid;
        let access = move |ip: &InodeSlot| perms_for(checkuid, uid, gid, ip);
        let parent_inum = dp.lock().unwrap().inum();
        fsops::named(&mut self.fs, parent_inum, name, flags, &access)
            .map_err(|e| -e.errno())
    }
}

fn perms_for(checkuid: bool, uid: u32, gid: u32, ip: &InodeSlot) -> u8 {
    if !checkuid || uid == 0 {
        return 7;
    }
    if ip.d.i_uid == uid as u8 {
        (ip.d.i_mode >> 6 & 7) as u8
    } else if ip.d.i_gid == gid as u8 {
        (ip.d.i_mode >> 3 & 7) as u8
    } else {
        (ip.d.i_mode & 7) as u8
    }
}

macro_rules! try_reply {
    ($reply:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => {
                $reply.error(err);
                return;
            }
        }
    };
}

impl Filesystem for V6Fuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let dp = try_reply!(reply, self.iget(parent));
        if !dp.lock().unwrap().d.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let de = try_reply!(
            reply,
            self.fs.dir_lookup(&dp, name.as_bytes()).map_err(|e| errno(&e))
        );
        let Some(de) = de else {
            reply.error(libc::ENOENT);
            return;
        };
        let ip = try_reply!(reply, self.iget(de.inum() as u64));
        let attr = try_reply!(reply, self.attr(&ip));
        reply.entry(&TTL, &attr, 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let ip = try_reply!(reply, self.iget(ino));
        let attr = try_reply!(reply, self.attr(&ip));
        reply.attr(&TTL, &attr);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let ip = try_reply!(reply, self.iget(ino));

        if mode.is_some() || uid.is_some() || gid.is_some() {
            let owner = {
                let g = ip.lock().unwrap();
                self.root_user(req) || req.uid() as u8 == g.d.i_uid
            };
            if !owner {
                reply.error(libc::EPERM);
                return;
            }
        }
        if size.is_some() || atime.is_some() || mtime.is_some() {
            try_reply!(reply, self.check_access(req, &ip, 2));
        }

        let res = self.fs.with_tx(|fs| {
            if let Some(mode) = mode {
                let mut g = ip.lock().unwrap();
                let m = (g.d.i_mode & !0o7777) | (mode as u16 & 0o7777);
                g.d.i_mode = m;
                drop(g);
                fs.patch_inode(&ip, 0, 2)?;
                fs.mtouch(&ip, DoLog::Yes)?;
            }
            if uid.is_some() || gid.is_some() {
                {
                    let mut g = ip.lock().unwrap();
                    if let Some(uid) = uid {
                        g.d.i_uid = uid as u8;
                    }
                    if let Some(gid) = gid {
                        g.d.i_gid = gid as u8;
                    }
                }
                fs.patch_inode(&ip, core::mem::offset_of!(DiskInode, i_uid), 2)?;
                fs.mtouch(&ip, DoLog::Yes)?;
            }
            if let Some(size) = size {
                fs.itruncate(&ip, size.min(MAX_FILE_SIZE as u64) as u32, DoLog::Yes)?;
            }
            if atime.is_some() || mtime.is_some() {
                {
                    let mut g = ip.lock().unwrap();
                    if let Some(t) = atime {
                        g.d.set_atime(to_epoch(t));
                    }
                    if let Some(t) = mtime {
                        g.d.set_mtime(to_epoch(t));
                    }
                }
                fs.patch_inode(&ip, core::mem::offset_of!(DiskInode, i_atime), 8)?;
            }
            Ok(())
        });
        try_reply!(reply, res.map_err(|e| errno(&e)));
        let attr = try_reply!(reply, self.attr(&ip));
        reply.attr(&TTL, &attr);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let newmode = match mode as u16 & libc::S_IFMT as u16 {
            m if m == libc::S_IFBLK as u16 => IFBLK,
            m if m == libc::S_IFCHR as u16 => IFCHR,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        if rdev >> 16 != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        if !self.root_user(req) {
            reply.error(libc::EPERM);
            return;
        }

        let res = {
            let tx_res = self.fs.begin().map_err(|e| errno(&e));
            let tx = try_reply!(reply, tx_res);
            let r = (|| -> Result<(), i32> {
                let de = self.dirent(req, parent, name, NameFlag::Create | NameFlag::Exclusive)?;
                let newmode = (mode as u16 & 0o7777) | IALLOC | newmode;
                fsops::mknod(
                    &mut self.fs,
                    &de,
                    Some(&|d: &mut DiskInode| {
                        d.i_mode = newmode;
                        d.set_dev((rdev >> 8) as u8, rdev as u8);
                    }),
                )
                .map_err(|e| errno(&e))
            })();
            self.fs.commit(tx).map_err(|e| errno(&e)).and(r)
        };
        try_reply!(reply, res);

        self.lookup(req, parent, name, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let res = {
            let tx = try_reply!(reply, self.fs.begin().map_err(|e| errno(&e)));
            let r = (|| -> Result<u16, i32> {
                let de = self.dirent(req, parent, name, NameFlag::Create.into())?;
                if de.inum() != 0 {
                    return Ok(de.inum());
                }
                fsops::mknod(
                    &mut self.fs,
                    &de,
                    Some(&|d: &mut DiskInode| d.i_mode |= mode as u16 & 0o7777),
                )
                .map_err(|e| errno(&e))?;
                Ok(de.inum())
            })();
            self.fs.commit(tx).map_err(|e| errno(&e)).and(r)
        };
        let inum = try_reply!(reply, res);
        let ip = try_reply!(reply, self.iget(inum as u64));
        let attr = try_reply!(reply, self.attr(&ip));
        reply.created(&TTL, &attr, 0, inum as u64, 0);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let res = {
            let tx = try_reply!(reply, self.fs.begin().map_err(|e| errno(&e)));
            let r = (|| -> Result<(), i32> {
                let de = self.dirent(req, parent, name, NameFlag::Create | NameFlag::Exclusive)?;
                let uid = req.uid() as u8;
                let gid = req.gid() as u8;
                let root = self.root_user(req);
                fsops::mkdir(
                    &mut self.fs,
                    &de,
                    Some(&move |d: &mut DiskInode| {
                        d.i_mode = (mode as u16 & 0o7777) | IFDIR | IALLOC;
                        if !root {
                            d.i_uid = uid;
                            d.i_gid = gid;
                        }
                    }),
                )
                .map_err(|e| errno(&e))
            })();
            self.fs.commit(tx).map_err(|e| errno(&e)).and(r)
        };
        try_reply!(reply, res);
        self.lookup(req, parent, name, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let de = try_reply!(reply, self.dirent(req, parent, name, NameFlag::DirWrite.into()));
        try_reply!(
            reply,
            fsops::unlink(&mut self.fs, &de).map_err(|e| errno(&e))
        );
        reply.ok();
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let de = try_reply!(reply, self.dirent(req, parent, name, NameFlag::DirWrite.into()));
        try_reply!(reply, fsops::rmdir(&mut self.fs, &de).map_err(|e| errno(&e)));
        reply.ok();
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let res = {
            let tx = try_reply!(reply, self.fs.begin().map_err(|e| errno(&e)));
            let r = (|| -> Result<(), i32> {
                let newde = self.dirent(
                    req,
                    newparent,
                    newname,
                    NameFlag::Create | NameFlag::Exclusive | NameFlag::DirWrite,
                )?;
                let ip = self.iget(ino)?;
                // 旧项按节点号直接加链接
                if ip.lock().unwrap().d.i_nlink >= 255 {
                    return Err(libc::EFBIG);
                }
                let r = self.fs.with_tx(|fs| {
                    fs.mtouch(&ip, DoLog::Yes)?;
                    ip.lock().unwrap().d.i_nlink += 1;
                    fs.patch_inode(&ip, core::mem::offset_of!(DiskInode, i_nlink), 1)?;
                    let inum = ip.lock().unwrap().inum();
                    newde.set_inum(fs, inum)
                });
                r.map_err(|e| errno(&e))
            })();
            self.fs.commit(tx).map_err(|e| errno(&e)).and(r)
        };
        try_reply!(reply, res);
        self.lookup(req, newparent, newname, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let oldde = try_reply!(reply, self.dirent(req, parent, name, NameFlag::DirWrite.into()));
        let res = {
            let tx = try_reply!(reply, self.fs.begin().map_err(|e| errno(&e)));
            let r = (|| -> Result<(), i32> {
                let newde = self.dirent(req, newparent, newname, NameFlag::Create.into())?;
                fsops::rename_at(&mut self.fs, &oldde, &newde).map_err(|e| errno(&e))
            })();
            self.fs.commit(tx).map_err(|e| errno(&e)).and(r)
        };
        try_reply!(reply, res);
        reply.ok();
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let want = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => 4,
            libc::O_WRONLY => 2,
            libc::O_RDWR => 6,
            _ => 7,
        };
        let ip = try_reply!(reply, self.iget(ino));
        try_reply!(reply, self.check_access(req, &ip, want));
        if flags & libc::O_TRUNC != 0 {
            if ip.lock().unwrap().d.i_mode & IFMT != 0 {
                reply.error(libc::EINVAL);
                return;
            }
            let res = self.fs.with_tx(|fs| {
                fs.itruncate(&ip, 0, DoLog::Yes)?;
                fs.mtouch(&ip, DoLog::Yes)
            });
            try_reply!(reply, res.map_err(|e| errno(&e)));
        }
        reply.opened(ino, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let ip = try_reply!(reply, self.iget(ino));
        let Ok(offset) = u32::try_from(offset) else {
            reply.error(libc::EFBIG);
            return;
        };
        let mut c = Cursor::new(ip);
        try_reply!(
            reply,
            c.seek(offset.min(MAX_FILE_SIZE)).map_err(|e| errno(&e))
        );
        let mut buf = vec![0; size as usize];
        let n = try_reply!(reply, c.read(&mut self.fs, &mut buf).map_err(|e| errno(&e)));
        reply.data(&buf[..n]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let ip = try_reply!(reply, self.iget(ino));
        let Ok(offset) = u32::try_from(offset) else {
            reply.error(libc::EFBIG);
            return;
        };
        let res = self.fs.with_tx(|fs| {
            let mut c = Cursor::new(ip.clone());
            c.seek(offset)?;
            // 数据写入不算元数据，mtime 不记日志
            fs.mtouch(&ip, DoLog::No)?;
            c.write(fs, data)
        });
        let n = try_reply!(reply, res.map_err(|e| errno(&e)));
        reply.written(n as u32);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let ip = try_reply!(reply, self.iget(ino));
        if !ip.lock().unwrap().d.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let mut c = Cursor::new(ip);
        let start = offset as u32 - offset as u32 % DirEntry::SIZE as u32;
        try_reply!(reply, c.seek(start).map_err(|e| errno(&e)));

        loop {
            let span = try_reply!(
                reply,
                c.readref(&mut self.fs, DirEntry::SIZE).map_err(|e| errno(&e))
            );
            let Some(span) = span else { break };
            let (inum, name) = span.map(|d: &DirEntry| (d.d_inumber, d.name_lossy()));
            if inum == 0 {
                continue;
            }
            let kind = match self.fs.iget(inum) {
                Ok(ep) => match ep.lock().unwrap().d.i_mode & IFMT {
                    IFDIR => FileType::Directory,
                    IFCHR => FileType::CharDevice,
                    IFBLK => FileType::BlockDevice,
                    _ => FileType::RegularFile,
                },
                Err(_) => FileType::RegularFile,
            };
            if reply.add(inum as u64, c.tell() as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let sb = &self.fs.superblock;
        let blocks = (sb.s_fsize - sb.datastart()) as u64;
        let files = sb.s_isize as u64 * INODES_PER_BLOCK as u64;
        let bfree = fsops::num_free_blocks(&mut self.fs).unwrap_or(0) as u64;
        let ffree = fsops::num_free_inodes(&mut self.fs).unwrap_or(0) as u64;
        reply.statfs(
            blocks,
            bfree,
            bfree,
            files,
            ffree,
            SECTOR_SIZE as u32,
            v6fs::layout::NAME_MAX_LEN as u32,
            SECTOR_SIZE as u32,
        );
    }
}

fn to_epoch(t: TimeOrNow) -> u32 {
    let st = match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    };
    st.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut flags = BitFlags::<OpenFlag>::empty();
    if !cli.force {
        flags |= OpenFlag::MustBeClean;
    }
    if cli.create_journal {
        flags |= OpenFlag::MkLog | OpenFlag::Replay;
    }

    let mut fs = match V6FileSystem::open(&cli.image, FsCache::default(), flags) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("Error: {e}");
            exit(1);
        }
    };
    if cli.suppress_commit {
        if let Some(l) = fs.log.as_mut() {
            l.suppress_commit = true;
        }
    }

    let shim = V6Fuse {
        fs,
        checkuid: cli.checkuid,
    };
    let opts = [MountOption::FSName("v6fs".into())];
    if let Err(e) = fuser::mount2(shim, &cli.mountpoint, &opts) {
        eprintln!("Error: {e}");
        exit(1);
    }
}
