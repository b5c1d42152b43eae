use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use enumflags2::BitFlags;
use v6fs::{fsck, FsCache, OpenFlag, V6FileSystem};

/// Check and repair a V6 file system image
#[derive(Parser)]
struct Cli {
    /// Apply fixes instead of only reporting
    #[arg(short = 'y')]
    yes: bool,

    /// Image to check
    image: PathBuf,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut flags: BitFlags<OpenFlag> = OpenFlag::NoLog.into();
    if !cli.yes {
        flags |= OpenFlag::ReadOnly;
    }

    let res = (|| -> v6fs::Result<bool> {
        let mut fs = V6FileSystem::open(&cli.image, FsCache::new(30, 100), flags)?;
        fsck::fsck(&mut fs, cli.yes)
    })();

    match res {
        Ok(true) => exit(0),
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("{}: {e}", cli.image.display());
            exit(1);
        }
    }
}
