mod cli;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::process::exit;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use cli::Cli;
use v6fs::layout::{self, FileSys, IALLOC, IFDIR};
use v6fs::{
    FsCache, V6FileSystem, V6Log, BOOTBLOCK_MAGIC, INODES_PER_BLOCK, ROOT_INUMBER, SECTOR_SIZE,
    SUPERBLOCK_SECTOR,
};

fn create_file(cli: &Cli, nblocks: u16, ninodes: u16) -> io::Result<()> {
    let fd = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&cli.image)?;
    fd.set_len(nblocks as u64 * SECTOR_SIZE as u64)?;

    let mut sb = FileSys::zeroed();
    sb.s_isize = ninodes.div_ceil(INODES_PER_BLOCK);
    sb.s_fsize = nblocks;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    sb.set_time(now);
    fd.write_all_at(
        &layout::to_sector(&sb),
        SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64,
    )?;
    fd.write_all_at(&BOOTBLOCK_MAGIC.to_le_bytes(), 0)?;
    Ok(())
}

fn run(cli: &Cli) -> v6fs::Result<()> {
    let nblocks = cli.sectors.min(0xffff) as u16;
    let ninodes = cli
        .inodes
        .unwrap_or(nblocks as u32 / 4)
        .clamp(1, nblocks as u32) as u16;

    create_file(cli, nblocks, ninodes)?;

    let mut fs = V6FileSystem::open(&cli.image, FsCache::new(30, 100), Default::default())?;

    // 空闲表倒着灌，让低块号先被分出去
    let start = fs.superblock.datastart();
    for bn in (start..nblocks).rev() {
        fs.bfree(bn)?;
    }

    let ip = fs.iget(ROOT_INUMBER)?;
    let bp = fs.balloc(true)?;
    {
        let mut g = ip.lock().unwrap();
        g.d.i_mode = IALLOC | IFDIR | 0o755;
        g.d.i_nlink = 2;
        g.d.i_addr[0] = bp.lock().unwrap().blockno();
    }
    fs.mtouch(&ip, v6fs::DoLog::Yes)?;
    fs.atouch(&ip);

    let dot = fs.dir_create(&ip, b".")?;
    dot.set_inum(&mut fs, ROOT_INUMBER)?;
    let dotdot = fs.dir_create(&ip, b"..")?;
    dotdot.set_inum(&mut fs, ROOT_INUMBER)?;

    if let Some(log_blocks) = cli.log_blocks {
        V6Log::create(&mut fs, log_blocks)?;
    }
    fs.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        let _ = writeln!(io::stderr(), "{}: {e}", cli.image.display());
        exit(1);
    }
}
