use std::mem;

use v6fs::layout::{DirEntry, DiskInode, FileSys, INODE_SIZE};
use v6fs::logrec::LogHeader;
use v6fs::{INODES_PER_BLOCK, SECTOR_SIZE};

#[test]
fn on_disk_sizes() {
    assert_eq!(SECTOR_SIZE, mem::size_of::<FileSys>());
    assert_eq!(32, mem::size_of::<DiskInode>());
    assert_eq!(INODE_SIZE, mem::size_of::<DiskInode>());
    assert_eq!(DirEntry::SIZE, mem::size_of::<DirEntry>());
    assert_eq!(SECTOR_SIZE, mem::size_of::<LogHeader>());
    assert_eq!(16, INODES_PER_BLOCK);
}

#[test]
fn size_codec() {
    let mut d = DiskInode::default();
    d.set_size(0xab_cdef);
    assert_eq!(d.size(), 0xab_cdef);
    assert_eq!(d.i_size0, 0xab);
    assert_eq!(d.i_size1, 0xcdef);
}

#[test]
fn time_halves_swapped() {
    let mut d = DiskInode::default();
    d.set_mtime(0x1234_5678);
    assert_eq!(d.i_mtime, 0x5678_1234);
    assert_eq!(d.mtime(), 0x1234_5678);
}
