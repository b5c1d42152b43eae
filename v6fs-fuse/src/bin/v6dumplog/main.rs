use std::fs::File;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use block_dev::RawDevice;
use clap::Parser;
use v6fs::layout::FileSys;
use v6fs::logrec::{read_loghdr, LogEntry};
use v6fs::{Error, FdReader, SECTOR_SIZE, SUPERBLOCK_SECTOR};

/// Decode and print the journal of an image
#[derive(Parser)]
struct Cli {
    image: PathBuf,

    /// Byte offset to start from, or `c` for the checkpoint
    /// (default: start of the log area)
    start: Option<String>,
}

fn read_log(cli: &Cli) -> v6fs::Result<()> {
    let dev: Arc<dyn RawDevice> = Arc::new(File::open(&cli.image)?);

    let mut sector = [0; SECTOR_SIZE];
    dev.read_exact_at(&mut sector, SUPERBLOCK_SECTOR as u64 * SECTOR_SIZE as u64)?;
    let sb: FileSys = v6fs::layout::from_sector(&sector);

    let hdr = read_loghdr(dev.as_ref(), sb.s_fsize as u32)?;

    let mut f = FdReader::new(dev);
    match cli.start.as_deref() {
        Some("c") => f.seek(hdr.l_checkpoint),
        Some(s) => {
            let pos: u32 = s.parse().map_err(|_| Error::Inval)?;
            if pos <= hdr.logstart() * SECTOR_SIZE as u32 {
                f.seek(hdr.logstart() * SECTOR_SIZE as u32);
            } else {
                f.seek(pos);
            }
        }
        None => f.seek(hdr.logstart() * SECTOR_SIZE as u32),
    }

    // 从检查点之上绕一圈回来就停
    let mut above = true;
    let mut pos = f.tell();
    while above || pos < hdr.l_checkpoint {
        println!("[offset {}]", f.tell());
        let e = LogEntry::load(&mut f)?;
        println!("{}", e.show(Some(&sb)));
        let newpos = f.tell();
        if newpos < pos {
            above = false;
        }
        pos = newpos;
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match read_log(&cli) {
        Ok(()) => {}
        Err(e @ Error::LogCorrupt(_)) => {
            // 读到坏记录就是日志到头，正常收场
            println!("* Exiting because: {e}");
            exit(0);
        }
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    }
}
