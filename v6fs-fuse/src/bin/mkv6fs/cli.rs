use std::path::PathBuf;

use clap::Parser;

/// Create an empty V6 file system image
#[derive(Parser)]
pub struct Cli {
    /// Image file to create
    pub image: PathBuf,

    /// Volume size in sectors (capped at 65535)
    #[arg(default_value_t = 0xffff)]
    pub sectors: u32,

    /// Number of inodes (default: sectors / 4)
    pub inodes: Option<u32>,

    /// Add a journal of this many blocks (0 picks a default size)
    pub log_blocks: Option<u16>,
}
