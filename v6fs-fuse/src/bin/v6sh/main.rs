mod cli;

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::exit;
use std::sync::Arc;

use block_dev::RawDevice;
use clap::Parser;
use cli::{Cli, Cmd};
use v6fs::blockpath::PtrArray;
use v6fs::fsops;
use v6fs::layout::{self, FileSys, IALLOC, IEXEC, IFBLK, IFCHR, IFDIR, IFMT, IREAD, ISGID, ISUID, ISVTX, IWRITE};
use v6fs::logrec::read_loghdr;
use v6fs::{
    Cursor, DoLog, FsCache, InodeRef, OpenFlag, V6FileSystem, INODES_PER_BLOCK, ROOT_INUMBER,
    SECTOR_SIZE, SUPERBLOCK_SECTOR,
};
use v6fs_fuse::{fmttime, fs_path};

fn open(readonly: bool) -> v6fs::Result<V6FileSystem> {
    let mut flags: enumflags2::BitFlags<OpenFlag> = OpenFlag::NoLog.into();
    if readonly {
        flags |= OpenFlag::ReadOnly;
    }
    V6FileSystem::open(fs_path(), FsCache::default(), flags)
}

fn lsline(ip: &InodeRef, use_atime: bool) -> String {
    let g = ip.lock().unwrap();
    let mode = g.d.i_mode;
    let mut s = format!("{:5} ", g.inum());
    s.push(match mode & IFMT {
        IFDIR => 'd',
        IFCHR => 'c',
        IFBLK => 'b',
        0 => '-',
        _ => '?',
    });
    let rwx = |s: &mut String, r: u16, w: u16, x: u16, sbit: u16, sch: char| {
        s.push(if mode & r != 0 { 'r' } else { '-' });
        s.push(if mode & w != 0 { 'w' } else { '-' });
        if mode & sbit != 0 {
            s.push(if mode & x != 0 { sch } else { sch.to_ascii_uppercase() });
        } else {
            s.push(if mode & x != 0 { 'x' } else { '-' });
        }
    };
    rwx(&mut s, IREAD, IWRITE, IEXEC, ISUID, 's');
    rwx(&mut s, IREAD >> 3, IWRITE >> 3, IEXEC >> 3, ISGID, 's');
    rwx(&mut s, IREAD >> 6, IWRITE >> 6, IEXEC >> 6, ISVTX, 't');
    let t = if use_atime { g.d.atime() } else { g.d.mtime() };
    s.push_str(&format!(
        " {:3} {:3} {:3} {:8} {}  ",
        g.d.i_nlink,
        g.d.i_uid,
        g.d.i_gid,
        g.d.size(),
        fmttime(t)
    ));
    s
}

fn resolve(fs: &mut V6FileSystem, path: &str) -> v6fs::Result<Option<InodeRef>> {
    if let Some(n) = path.strip_prefix('#') {
        let inum: u16 = n.parse().map_err(|_| v6fs::Error::Inval)?;
        return fs.iget(inum).map(Some);
    }
    fs.namei(path)
}

fn cmd_ls(atime: bool, paths: &[String]) -> v6fs::Result<()> {
    let mut fs = open(true)?;
    for path in paths {
        let Some(ip) = fs.namei(path)? else {
            eprintln!("{path}: no such file or directory");
            continue;
        };
        if !ip.lock().unwrap().d.is_dir() {
            println!("{}{path}", lsline(&ip, atime));
            continue;
        }
        fs.atouch(&ip);
        println!("{path}:");
        let mut c = Cursor::new(ip.clone());
        while let Some(span) = c.readref(&mut fs, layout::DirEntry::SIZE)? {
            let (inum, name) =
                span.map(|d: &layout::DirEntry| (d.d_inumber, d.name_lossy()));
            if inum == 0 {
                continue;
            }
            let ep = fs.iget(inum)?;
            println!("{}{name}", lsline(&ep, atime));
        }
    }
    Ok(())
}

fn cmd_cat(paths: &[String]) -> v6fs::Result<()> {
    let mut fs = open(true)?;
    let mut out = io::stdout();
    for path in paths {
        let Some(ip) = fs.namei(path)? else {
            eprintln!("{path}: no such file or directory");
            continue;
        };
        if ip.lock().unwrap().d.i_mode & IFMT != 0 {
            eprintln!("{path}: not a regular file");
            continue;
        }
        let mut c = Cursor::new(ip);
        let mut buf = [0; SECTOR_SIZE];
        loop {
            let n = c.read(&mut fs, &mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
    }
    Ok(())
}

fn cmd_stat(paths: &[String]) -> v6fs::Result<()> {
    let mut fs = open(true)?;
    for path in paths {
        let Some(ip) = resolve(&mut fs, path)? else {
            eprintln!("{path}: no such file or directory");
            continue;
        };
        println!("{}{path}", lsline(&ip, false));
        let g = ip.lock().unwrap();
        println!("        ino: {}", g.inum());
        println!("        i_mode: 0{:o}", g.d.i_mode);
        println!("        i_nlink: {}", g.d.i_nlink);
        println!("        i_uid: {}", g.d.i_uid);
        println!("        i_gid: {}", g.d.i_gid);
        println!("        size: {}", g.d.size());
        for (j, bn) in g.d.i_addr.iter().enumerate() {
            println!("        i_addr[{j}]: {bn}");
        }
        println!("        atime: {}", fmttime(g.d.atime()));
        println!("        mtime: {}", fmttime(g.d.mtime()));
    }
    Ok(())
}

fn cmd_put(file: &str, v6file: &str) -> v6fs::Result<()> {
    let mut data = Vec::new();
    if file == "-" {
        io::stdin().read_to_end(&mut data)?;
    } else {
        File::open(file)?.read_to_end(&mut data)?;
    }

    let mut fs = open(false)?;
    let (dname, mut fname) = fsops::splitpath(v6file);
    if fname == "." {
        fname = fsops::splitpath(file).1;
    }
    let Some(dir) = fs.namei(dname)? else {
        eprintln!("{v6file}: no such directory");
        return Ok(());
    };

    let de = fs.dir_create(&dir, fname.as_bytes())?;
    let out;
    if de.inum() != 0 {
        out = fs.iget(de.inum())?;
        if out.lock().unwrap().d.i_mode & IFMT != 0 {
            eprintln!("{v6file}: not a regular file");
            return Ok(());
        }
        fs.itruncate(&out, 0, DoLog::Yes)?;
    } else {
        out = fs.ialloc()?;
        {
            let mut g = out.lock().unwrap();
            g.d.i_mode = IALLOC | 0o644;
            g.d.i_nlink = 1;
            g.mark_dirty();
        }
        let inum = out.lock().unwrap().inum();
        de.set_inum(&mut fs, inum)?;
    }

    let mut c = Cursor::new(out.clone());
    fs.mtouch(&out, DoLog::Yes)?;
    c.write(&mut fs, &data)?;
    fs.close()
}

fn cmd_unlink(paths: &[String]) -> v6fs::Result<()> {
    let mut fs = open(false)?;
    for path in paths {
        let (dname, fname) = fsops::splitpath(path);
        if fname.is_empty() {
            eprintln!("{path}: trailing slash not allowed");
            continue;
        }
        let de = match fs.namei(dname)? {
            Some(dir) => fs.dir_lookup(&dir, fname.as_bytes())?,
            None => None,
        };
        let Some(de) = de else {
            eprintln!("{path}: no such file or directory");
            continue;
        };
        let ip = fs.iget(de.inum())?;
        fs.mtouch(&de.dir, DoLog::Yes)?;
        de.set_inum(&mut fs, 0)?;
        let nlink = ip.lock().unwrap().d.i_nlink;
        if nlink > 1 {
            ip.lock().unwrap().d.i_nlink -= 1;
            fs.mtouch(&ip, DoLog::Yes)?;
        } else {
            let inum = ip.lock().unwrap().inum();
            fs.iclear(&ip)?;
            fs.ifree(inum);
        }
    }
    fs.close()
}

fn cmd_truncate(file: &str, length: u32) -> v6fs::Result<()> {
    let mut fs = open(false)?;
    let Some(ip) = resolve(&mut fs, file)? else {
        eprintln!("{file}: no such file or directory");
        return Ok(());
    };
    fs.itruncate(&ip, length, DoLog::Yes)?;
    fs.close()
}

fn cmd_block(blocks: &[u16]) -> v6fs::Result<()> {
    let mut fs = open(true)?;
    for &bn in blocks {
        let bp = match fs.bread(bn) {
            Ok(bp) => bp,
            Err(e) => {
                eprintln!("{bn}: {e}");
                continue;
            }
        };
        if blocks.len() > 1 {
            println!("Block {bn}:");
        }
        let g = bp.lock().unwrap();
        let p = &g.data.0;
        let mut skipped = false;
        for i in (0..SECTOR_SIZE).step_by(16) {
            if i > 0 && p[i - 16..i] == p[i..i + 16] {
                skipped = true;
                continue;
            }
            if skipped {
                skipped = false;
                println!("*");
            }
            let mut line = format!("{i:3}");
            for j in 0..16 {
                if j % 4 == 0 {
                    line.push(' ');
                }
                line.push_str(&format!("{:02x}", p[i + j]));
            }
            line.push_str("  >");
            for j in 0..16 {
                let c = p[i + j];
                line.push(if (0x20..0x7f).contains(&c) { c as char } else { ' ' });
            }
            line.push('<');
            println!("{line}");
        }
        if skipped {
            println!("*");
        }
    }
    Ok(())
}

fn cmd_iblock(blocks: &[u16]) -> v6fs::Result<()> {
    let mut fs = open(true)?;
    for &bn in blocks {
        if bn >= fs.superblock.s_fsize {
            eprintln!("{bn}: invalid block number");
            continue;
        }
        let bp = fs.bread(bn)?;
        if blocks.len() > 1 {
            println!("Indirect block {bn}:");
        }
        let ba = PtrArray::Block(bp);
        let mut stop = ba.len();
        while stop > 0 && ba.at(stop - 1) == 0 {
            stop -= 1;
        }
        for j in 0..stop {
            println!("  {:3}: {}", j, ba.at(j));
        }
    }
    Ok(())
}

fn cmd_dump() -> v6fs::Result<()> {
    let dev: Arc<dyn RawDevice> = Arc::new(File::open(fs_path())?);
    let mut sector = [0; SECTOR_SIZE];
    dev.read_exact_at(&mut sector, SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64)?;
    let s: FileSys = layout::from_sector(&sector);

    println!("* superblock contents:");
    println!("{:>11}: {}", "s_isize", s.s_isize);
    println!("{:>11}: {}", "s_fsize", s.s_fsize);
    println!("{:>11}: {}", "s_nfree", s.s_nfree);
    print_list("s_free", &s.s_free[..(s.s_nfree as usize).min(s.s_free.len())]);
    println!("{:>11}: {}", "s_ninode", s.s_ninode);
    print_list(
        "s_inode",
        &s.s_inode[..(s.s_ninode as usize).min(s.s_inode.len())],
    );
    println!("{:>11}: {}", "s_flock", s.s_flock);
    println!("{:>11}: {}", "s_ilock", s.s_ilock);
    println!("{:>11}: {}", "s_fmod", s.s_fmod);
    println!("{:>11}: {}", "s_ronly", s.s_ronly);
    println!(
        "{:>11}: {}",
        "s_time",
        fmttime((s.s_time[0] as u32) << 16 | s.s_time[1] as u32)
    );
    println!("{:>11}: {}", "s_uselog", s.s_uselog);
    println!("{:>11}: {}", "s_dirty", s.s_dirty);

    if s.s_uselog == 0 {
        return Ok(());
    }
    let Ok(h) = read_loghdr(dev.as_ref(), s.s_fsize as u32) else {
        return Ok(());
    };
    println!();
    println!("* loghdr contents:");
    println!("{:>11}: 0x{:x}", "l_magic", h.l_magic);
    println!("{:>11}: {}", "l_hdrblock", h.l_hdrblock);
    println!("{:>11}: {}", "l_logsize", h.l_logsize);
    println!("{:>11}: {}", "l_mapsize", h.l_mapsize);
    println!("{:>11}: {}", "l_checkpoint", h.l_checkpoint);
    println!("{:>11}: {}", "l_sequence", h.l_sequence);
    Ok(())
}

fn print_list(name: &str, vals: &[u16]) {
    print!("{name:>11}:");
    for (i, v) in vals.iter().enumerate() {
        if i > 0 && i % 10 == 0 {
            print!("\n           ");
        }
        print!(" {v:5}");
    }
    println!();
}

fn cmd_usedblocks() -> v6fs::Result<()> {
    let mut fs = open(true)?;
    let nblocks = (fs.superblock.s_fsize - fs.superblock.datastart()) as usize;
    let nfree = fsops::num_free_blocks(&mut fs)?;
    println!("{} used blocks (out of {})", nblocks - nfree, nblocks);
    let bm = fsops::fs_freemap(&mut fs)?;
    let mut c = 0;
    for i in bm.min_index()..bm.max_index() {
        if !bm.at(i) {
            if c % 10 == 0 {
                print!("{}", if c > 0 { "\n    " } else { "    " });
            }
            print!(" {i:5}");
            c += 1;
        }
    }
    if c > 0 {
        println!();
    }
    assert_eq!(nfree, bm.popcount());
    Ok(())
}

fn cmd_usedinodes() -> v6fs::Result<()> {
    let mut fs = open(true)?;
    let ninodes = fs.superblock.s_isize * INODES_PER_BLOCK;
    let nfree = fsops::num_free_inodes(&mut fs)?;
    println!(
        "{} used inodes (out of {})",
        ninodes as usize - nfree,
        ninodes
    );
    let mut c = 0;
    for i in ROOT_INUMBER..=ninodes {
        let used = fs.iget(i)?.lock().unwrap().d.is_allocated();
        if used {
            if c % 10 == 0 {
                print!("{}", if c > 0 { "\n    " } else { "    " });
            }
            print!(" {i:5}");
            c += 1;
        }
    }
    if c > 0 {
        println!();
    }
    Ok(())
}

fn cmd_deface() -> v6fs::Result<()> {
    let mut garbage = Vec::with_capacity(SECTOR_SIZE + 17);
    while garbage.len() < SECTOR_SIZE {
        garbage.extend_from_slice(b"This is garbage. ");
    }
    garbage.truncate(SECTOR_SIZE);

    let mut fs = open(false)?;
    let bm = fsops::fs_freemap(&mut fs)?;
    for i in bm.min_index()..bm.max_index() {
        if bm.at(i) {
            let bp = fs.bget(i as u16)?;
            let mut g = bp.lock().unwrap();
            g.data.0.copy_from_slice(&garbage);
            g.bdwrite();
        }
    }
    fs.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let res = match &cli.cmd {
        Cmd::Ls { atime, paths } => cmd_ls(*atime, paths),
        Cmd::Cat { paths } => cmd_cat(paths),
        Cmd::Stat { paths } => cmd_stat(paths),
        Cmd::Put { file, v6file } => cmd_put(file, v6file),
        Cmd::Unlink { paths } => cmd_unlink(paths),
        Cmd::Truncate { file, length } => cmd_truncate(file, *length),
        Cmd::Block { blocks } => cmd_block(blocks),
        Cmd::Iblock { blocks } => cmd_iblock(blocks),
        Cmd::Dump => cmd_dump(),
        Cmd::Usedblocks => cmd_usedblocks(),
        Cmd::Usedinodes => cmd_usedinodes(),
        Cmd::Deface => cmd_deface(),
    };
    if let Err(e) = res {
        eprintln!("{e}");
        exit(1);
    }
}
