use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use v6fs::{FsCache, OpenFlag, Replay, V6FileSystem};

/// Replay the journal of an image without mounting it
#[derive(Parser)]
struct Cli {
    image: PathBuf,
}

fn run(cli: &Cli) -> v6fs::Result<()> {
    let mut fs = V6FileSystem::open(&cli.image, FsCache::default(), OpenFlag::NoLog.into())?;
    let mut r = Replay::new(&fs)?;
    r.replay(&mut fs)?;
    fs.close()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("{e}");
        exit(1);
    }
}
