use clap::{Parser, Subcommand};

/// Poke around a V6 file system image.
/// The image comes from $V6IMG, defaulting to `v6.img`.
#[derive(Parser)]
#[command(name = "v6sh")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand)]
pub enum Cmd {
    /// List files or directory contents
    Ls {
        /// Show atime instead of mtime
        #[arg(short = 'a')]
        atime: bool,
        paths: Vec<String>,
    },
    /// Print regular files
    Cat { paths: Vec<String> },
    /// Show inode details; `#N` addresses inode N directly
    Stat { paths: Vec<String> },
    /// Copy a host file into the image (`-` reads stdin)
    Put { file: String, v6file: String },
    /// Remove directory entries
    Unlink { paths: Vec<String> },
    /// Truncate a file to a length
    Truncate { file: String, length: u32 },
    /// Hex-dump sectors
    Block { blocks: Vec<u16> },
    /// Print a sector as a block-pointer array
    Iblock { blocks: Vec<u16> },
    /// Dump the superblock and log header
    Dump,
    /// Show allocated block numbers
    Usedblocks,
    /// Show allocated inode numbers
    Usedinodes,
    /// Fill all free blocks with garbage
    Deface,
}
