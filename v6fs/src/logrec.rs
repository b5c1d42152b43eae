//! # 日志的磁盘格式
//!
//! 日志区跟在传统 V6 布局之后，依次是日志头（一个扇区）、
//! 空闲位图、环形日志。每条记录的框架：
//!
//! ```text
//! [头: LSN(4) 类型(1)] [记录体] [尾: CRC-32(4) LSN(4)]
//! ```
//!
//! 尾部校验和覆盖头与记录体，LSN 重复一份；写到一半的记录
//! 过不了校验，重放时视作日志结束。

use core::mem;

use block_dev::RawDevice;

use crate::layout::{DirEntry, FileSys, INODE_SIZE};
use crate::{bufio::FdReader, bufio::FdWriter, Error, Result};
use crate::{IADDR_SIZE, INODES_PER_BLOCK, INODE_START_SECTOR, SECTOR_SIZE};

pub const LOG_MAGIC: u32 = 0x474c_0636;
pub const LOG_CRC_SEED: u32 = 0x8ab2_7857;

/// 日志序列号，32 位回绕递增
pub type Lsn = u32;

/// 回绕意义下 a ≤ b。LSN 空间远大于日志容量，半程以内视为先后
#[inline]
pub fn lsn_le(a: Lsn, b: Lsn) -> bool {
    b.wrapping_sub(a) <= Lsn::MAX / 2
}

/// 日志头，位于 `s_fsize` 号扇区
#[derive(Debug, Clone)]
#[repr(C)]
pub struct LogHeader {
    pub l_magic: u32,
    /// 本扇区自己的块号（= `s_fsize`）
    pub l_hdrblock: u32,
    /// 日志区扇区数
    pub l_logsize: u16,
    /// 空闲位图占的扇区数
    pub l_mapsize: u16,
    /// 崩溃后从这个字节偏移开始重放
    pub l_checkpoint: u32,
    /// `l_checkpoint` 处期望的第一个 LSN
    pub l_sequence: Lsn,
    l_pad: [u8; SECTOR_SIZE - 20],
}

impl LogHeader {
    pub fn zeroed() -> Self {
        Self {
            l_magic: 0,
            l_hdrblock: 0,
            l_logsize: 0,
            l_mapsize: 0,
            l_checkpoint: 0,
            l_sequence: 0,
            l_pad: [0; SECTOR_SIZE - 20],
        }
    }

    #[inline]
    pub fn mapstart(&self) -> u32 {
        self.l_hdrblock + 1
    }

    #[inline]
    pub fn logstart(&self) -> u32 {
        self.mapstart() + self.l_mapsize as u32
    }

    #[inline]
    pub fn logend(&self) -> u32 {
        self.logstart() + self.l_logsize as u32
    }

    /// 环形日志的字节容量
    #[inline]
    pub fn logbytes(&self) -> u32 {
        SECTOR_SIZE as u32 * (self.l_logsize - self.l_mapsize - 1) as u32
    }
}

/// 读并校验日志头
pub fn read_loghdr(dev: &dyn RawDevice, blockno: u32) -> Result<LogHeader> {
    let mut buf = [0; SECTOR_SIZE];
    dev.read_exact_at(&mut buf, blockno as u64 * SECTOR_SIZE as u64)?;
    let hdr: LogHeader = crate::layout::from_sector(&buf);
    if hdr.l_magic != LOG_MAGIC
        || hdr.l_hdrblock != blockno
        || hdr.l_checkpoint < hdr.logstart() * SECTOR_SIZE as u32
    {
        return Err(Error::LogCorrupt("invalid log header"));
    }
    Ok(hdr)
}

/// 日志记录。编码为小端，字节向量带一字节长度前缀。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// 事务开始
    Begin,
    /// 把 `bytes` 盖到 `blockno` 扇区的 `offset` 处
    Patch {
        blockno: u16,
        offset: u16,
        bytes: Vec<u8>,
    },
    /// 块被分配。元数据块重放时要清零：之后对它的修改都在日志里，
    /// 而数据块可能带着没记日志的写回内容，不能清
    BlockAlloc { blockno: u16, zero_on_replay: bool },
    /// 块被释放
    BlockFree { blockno: u16 },
    /// 事务提交，`sequence` 指回对应 Begin 的 LSN
    Commit { sequence: Lsn },
    /// 物理记录：下一条记录写在日志区开头
    Rewind,
}

impl LogRecord {
    fn tag(&self) -> u8 {
        match self {
            LogRecord::Begin => 0,
            LogRecord::Patch { .. } => 1,
            LogRecord::BlockAlloc { .. } => 2,
            LogRecord::BlockFree { .. } => 3,
            LogRecord::Commit { .. } => 4,
            LogRecord::Rewind => 5,
        }
    }

    fn body_nbytes(&self) -> usize {
        match self {
            LogRecord::Begin | LogRecord::Rewind => 0,
            LogRecord::Patch { bytes, .. } => 2 + 2 + 1 + bytes.len(),
            LogRecord::BlockAlloc { .. } => 3,
            LogRecord::BlockFree { .. } => 2,
            LogRecord::Commit { .. } => 4,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::Begin | LogRecord::Rewind => {}
            LogRecord::Patch {
                blockno,
                offset,
                bytes,
            } => {
                assert!(bytes.len() <= 0xff, "log patch too long");
                out.extend_from_slice(&blockno.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                out.extend_from_slice(&blockno.to_le_bytes());
                out.push(*zero_on_replay as u8);
            }
            LogRecord::BlockFree { blockno } => out.extend_from_slice(&blockno.to_le_bytes()),
            LogRecord::Commit { sequence } => out.extend_from_slice(&sequence.to_le_bytes()),
        }
    }
}

/// 带 LSN 的完整记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub sequence: Lsn,
    pub rec: LogRecord,
}

const HEADER_NBYTES: usize = 5;
const FOOTER_NBYTES: usize = 8;

impl LogEntry {
    /// Rewind 记录的编码长度，追加前要预留
    pub const REWIND_NBYTES: u32 = (HEADER_NBYTES + FOOTER_NBYTES) as u32;

    pub fn nbytes(&self) -> usize {
        HEADER_NBYTES + self.rec.body_nbytes() + FOOTER_NBYTES
    }

    pub fn save(&self, w: &mut FdWriter) -> Result<()> {
        let mut framed = Vec::with_capacity(self.nbytes());
        framed.extend_from_slice(&self.sequence.to_le_bytes());
        framed.push(self.rec.tag());
        self.rec.encode_body(&mut framed);
        let crc = crc32(&framed, LOG_CRC_SEED);
        framed.extend_from_slice(&crc.to_le_bytes());
        framed.extend_from_slice(&self.sequence.to_le_bytes());
        w.write(&framed)
    }

    pub fn load(r: &mut FdReader) -> Result<Self> {
        let mut crc = LOG_CRC_SEED;
        let mut head = [0; HEADER_NBYTES];
        mustread(r, &mut head, &mut crc)?;
        let sequence = Lsn::from_le_bytes(head[..4].try_into().unwrap());

        let rec = match head[4] {
            0 => LogRecord::Begin,
            1 => {
                let mut fixed = [0; 5];
                mustread(r, &mut fixed, &mut crc)?;
                let mut bytes = vec![0; fixed[4] as usize];
                mustread(r, &mut bytes, &mut crc)?;
                LogRecord::Patch {
                    blockno: u16::from_le_bytes(fixed[..2].try_into().unwrap()),
                    offset: u16::from_le_bytes(fixed[2..4].try_into().unwrap()),
                    bytes,
                }
            }
            2 => {
                let mut b = [0; 3];
                mustread(r, &mut b, &mut crc)?;
                LogRecord::BlockAlloc {
                    blockno: u16::from_le_bytes(b[..2].try_into().unwrap()),
                    zero_on_replay: b[2] != 0,
                }
            }
            3 => {
                let mut b = [0; 2];
                mustread(r, &mut b, &mut crc)?;
                LogRecord::BlockFree {
                    blockno: u16::from_le_bytes(b),
                }
            }
            4 => {
                let mut b = [0; 4];
                mustread(r, &mut b, &mut crc)?;
                LogRecord::Commit {
                    sequence: Lsn::from_le_bytes(b),
                }
            }
            5 => LogRecord::Rewind,
            _ => return Err(Error::LogCorrupt("invalid record type")),
        };

        let mut foot = [0; FOOTER_NBYTES];
        if !r.try_read(&mut foot)? {
            return Err(Error::LogCorrupt("premature EOF"));
        }
        let checksum = u32::from_le_bytes(foot[..4].try_into().unwrap());
        let seq2 = Lsn::from_le_bytes(foot[4..].try_into().unwrap());
        if seq2 != sequence {
            return Err(Error::LogCorrupt("sequence number mismatch"));
        }
        if checksum != crc {
            return Err(Error::LogCorrupt("bad checksum"));
        }
        Ok(Self { sequence, rec })
    }

    /// 给 dump 工具的展示形式
    pub fn show(&self, sb: Option<&FileSys>) -> String {
        use core::fmt::Write;

        let mut s = format!("* LSN {}\n", self.sequence);
        match &self.rec {
            LogRecord::Begin => s.push_str("  LogBegin\n"),
            LogRecord::Rewind => s.push_str("  LogRewind\n"),
            LogRecord::Commit { sequence } => {
                let _ = write!(s, "  LogCommit\n    sequence: {sequence}\n");
            }
            LogRecord::BlockFree { blockno } => {
                let _ = write!(s, "  LogBlockFree\n    blockno: {blockno}\n");
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                let _ = write!(
                    s,
                    "  LogBlockAlloc\n    blockno: {blockno}\n    zero_on_replay: {}\n",
                    *zero_on_replay as u8
                );
            }
            LogRecord::Patch {
                blockno,
                offset,
                bytes,
            } => {
                let _ = write!(
                    s,
                    "  LogPatch\n    blockno: {blockno}\n    offset_in_block: {offset}\n    bytes: {}\n",
                    hexdump(bytes)
                );
                if let Some(sb) = sb {
                    let _ = write!(s, "  {}\n", what_patch(sb, *blockno, *offset, bytes));
                }
            }
        }
        s
    }
}

fn mustread(r: &mut FdReader, buf: &mut [u8], crc: &mut u32) -> Result<()> {
    if !r.try_read(buf)? {
        return Err(Error::LogCorrupt("premature EOF"));
    }
    *crc = crc32(buf, *crc);
    Ok(())
}

/// CRC-32：多项式 0x04C11DB7，高位先行，不取反不反射。
/// 种子传 `LOG_CRC_SEED` 用于日志记录，传 `!0` 即 CRC-32/MPEG-2。
pub fn crc32(buf: &[u8], mut crc: u32) -> u32 {
    const TABLE: [u32; 256] = crc_table();
    for &b in buf {
        let i = (b ^ (crc >> 24) as u8) as usize;
        crc = TABLE[i] ^ crc << 8;
    }
    crc
}

const fn crc_table() -> [u32; 256] {
    const POLY: u32 = 0x04c1_1db7;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            crc = (crc << 1) ^ if crc & 0x8000_0000 != 0 { POLY } else { 0 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

pub fn hexdump(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use core::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/* 补丁分类，方便从 dump 输出里认出改的是什么 */

pub fn what_patch(sb: &FileSys, blockno: u16, offset: u16, bytes: &[u8]) -> String {
    if blockno >= sb.datastart() {
        what_data_patch(offset, bytes)
    } else if blockno >= INODE_START_SECTOR {
        what_inode_patch(blockno, offset, bytes)
    } else {
        "superblock/bootblock patch?".into()
    }
}

pub fn what_data_patch(offset: u16, bytes: &[u8]) -> String {
    if bytes.len() == DirEntry::SIZE {
        let inum = u16::from_le_bytes(bytes[..2].try_into().unwrap());
        let name = String::from_utf8_lossy(
            &bytes[2..2 + bytes[2..].iter().position(|&c| c == 0).unwrap_or(14)],
        )
        .into_owned();
        format!("dirent ({inum}, \"{name}\")")
    } else if bytes.len() == 2 {
        format!(
            "block pointer {}",
            u16::from_le_bytes(bytes.try_into().unwrap())
        )
    } else if offset == 0 && bytes.len() == 2 * IADDR_SIZE + 1 {
        // make_large 多记一个字节，靠长度与目录项补丁区分
        let mut s = String::from("block pointers");
        for i in 0..IADDR_SIZE {
            use core::fmt::Write;
            let bn = u16::from_le_bytes(bytes[2 * i..2 * i + 2].try_into().unwrap());
            let _ = write!(s, " {bn}");
        }
        s
    } else {
        "unknown data patch".into()
    }
}

pub fn what_inode_patch(blockno: u16, offset: u16, bytes: &[u8]) -> String {
    const FIELDS: [(usize, &str); 8] = [
        (0, "i_mode"),
        (2, "i_nlink"),
        (3, "i_uid"),
        (5, "i_size0"),
        (6, "i_size1"),
        (8, "i_addr"),
        (24, "i_atime"),
        (28, "i_mtime"),
    ];

    let inum = 1
        + (blockno - INODE_START_SECTOR) * INODES_PER_BLOCK
        + offset / INODE_SIZE as u16;
    let mut s = format!("inode #{inum} (");
    if bytes.len() >= INODE_SIZE {
        s.push_str("whole inode");
    } else {
        let o = offset as usize % INODE_SIZE;
        let iaddr_end = 8 + 2 * IADDR_SIZE;
        if bytes.len() == 2 && o % 2 == 0 && (8..iaddr_end).contains(&o) {
            use core::fmt::Write;
            let bn = u16::from_le_bytes(bytes.try_into().unwrap());
            let _ = write!(s, "i_addr[{}] = block pointer {bn}", (o - 8) / 2);
        } else {
            let mut first = true;
            for (fo, name) in FIELDS {
                if fo >= o && fo < o + bytes.len() {
                    if !first {
                        s.push_str(", ");
                    }
                    first = false;
                    s.push_str(name);
                }
            }
        }
    }
    s.push(')');
    s
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn crc_reference_values() {
        assert_eq!(crc32(b"", LOG_CRC_SEED), LOG_CRC_SEED);
        assert_eq!(crc32(b"123456789", !0), 0x0376_e6e7);
    }

    fn temp_dev() -> Arc<dyn RawDevice> {
        let file = tempfile::tempfile().unwrap();
        file.set_len(0x10000).unwrap();
        Arc::new(file)
    }

    #[test]
    fn codec_round_trip() {
        let dev = temp_dev();
        let entries = [
            LogEntry {
                sequence: 7,
                rec: LogRecord::Begin,
            },
            LogEntry {
                sequence: 8,
                rec: LogRecord::Patch {
                    blockno: 130,
                    offset: 96,
                    bytes: vec![1, 2, 3, 4, 5],
                },
            },
            LogEntry {
                sequence: 9,
                rec: LogRecord::BlockAlloc {
                    blockno: 131,
                    zero_on_replay: true,
                },
            },
            LogEntry {
                sequence: 10,
                rec: LogRecord::BlockFree { blockno: 99 },
            },
            LogEntry {
                sequence: 11,
                rec: LogRecord::Commit { sequence: 7 },
            },
            LogEntry {
                sequence: 12,
                rec: LogRecord::Rewind,
            },
        ];

        let mut w = FdWriter::new(dev.clone());
        for e in &entries {
            e.save(&mut w).unwrap();
        }
        w.flush().unwrap();

        let mut r = FdReader::new(dev);
        for e in &entries {
            assert_eq!(&LogEntry::load(&mut r).unwrap(), e);
        }
    }

    #[test]
    fn corrupt_byte_fails_checksum() {
        let dev = temp_dev();
        let mut w = FdWriter::new(dev.clone());
        LogEntry {
            sequence: 3,
            rec: LogRecord::BlockFree { blockno: 500 },
        }
        .save(&mut w)
        .unwrap();
        w.flush().unwrap();

        let mut b = [0; 1];
        dev.read_exact_at(&mut b, 5).unwrap();
        b[0] ^= 0x40;
        dev.write_all_at(&b, 5).unwrap();

        let mut r = FdReader::new(dev);
        assert!(matches!(
            LogEntry::load(&mut r),
            Err(Error::LogCorrupt("bad checksum"))
        ));
    }

    #[test]
    fn lsn_wraps() {
        assert!(lsn_le(0xffff_fff0, 3));
        assert!(!lsn_le(3, 0xffff_fff0));
        assert!(lsn_le(5, 5));
    }

    #[test]
    fn rewind_size_reservation() {
        let e = LogEntry {
            sequence: 0,
            rec: LogRecord::Rewind,
        };
        assert_eq!(e.nbytes() as u32, LogEntry::REWIND_NBYTES);
    }
}
