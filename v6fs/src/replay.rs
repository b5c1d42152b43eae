//! # 日志重放
//!
//! 镜像带日志且上次没有干净卸载时，挂载前从 `l_checkpoint` 起
//! 把日志里完整的事务重新套用一遍。先整体验一遍事务（CRC、LSN
//! 连号、Begin/Commit 配对），验上了再回头逐条套用——半截事务
//! 一条都不准碰。重放幂等：再跑一遍结果不变。

use block_dev::RawDevice;

use crate::bufio::FdReader;
use crate::logrec::{read_loghdr, LogEntry, LogHeader, LogRecord};
use crate::{layout, Bitmap, Error, Lsn, Result, V6FileSystem, SECTOR_SIZE};

pub struct Replay {
    r: FdReader,
    hdr: LogHeader,
    freemap: Bitmap,
    /// 下一条记录应有的 LSN
    sequence: Lsn,
}

impl Replay {
    pub fn new(fs: &V6FileSystem) -> Result<Self> {
        let hdr = read_loghdr(fs.dev.as_ref(), fs.superblock.s_fsize as u32)?;
        let mut freemap = Bitmap::new(
            fs.superblock.s_fsize as usize,
            fs.superblock.datastart() as usize,
        );
        fs.dev.read_exact_at(
            freemap.as_bytes_mut(),
            hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        freemap.tidy();

        let sequence = hdr.l_sequence;
        let mut r = FdReader::new(fs.dev.clone());
        r.seek(hdr.l_checkpoint);
        Ok(Self {
            r,
            hdr,
            freemap,
            sequence,
        })
    }

    /// 读下一条记录并对 LSN；`LogRewind` 在这里消化掉
    fn read_next(&mut self) -> Result<LogEntry> {
        let mut e = self.load_checked()?;
        if matches!(e.rec, LogRecord::Rewind) {
            self.r.seek(self.hdr.logstart() * SECTOR_SIZE as u32);
            e = self.load_checked()?;
        }
        Ok(e)
    }

    fn load_checked(&mut self) -> Result<LogEntry> {
        let e = LogEntry::load(&mut self.r)?;
        if e.sequence != self.sequence {
            return Err(Error::LogCorrupt("bad sequence number"));
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(e)
    }

    /// 当前位置是否停着一个完整事务。读指针总会复位；
    /// 遇到坏记录时序列号故意不回退，保证新检查点的 LSN
    /// 压在所有旧记录之上。
    fn check_tx(&mut self) -> Result<bool> {
        let start_pos = self.r.tell();
        let start_seq = self.sequence;

        let res = (|| -> Result<()> {
            let e = self.read_next()?;
            let LogRecord::Begin = e.rec else {
                return Err(Error::LogCorrupt("no LogBegin"));
            };
            let begin_seq = e.sequence;
            loop {
                let e = self.read_next()?;
                if let LogRecord::Commit { sequence } = e.rec {
                    if sequence != begin_seq {
                        return Err(Error::LogCorrupt("begin/commit sequence mismatch"));
                    }
                    return Ok(());
                }
            }
        })();

        self.r.seek(start_pos);
        match res {
            Ok(()) => {
                self.sequence = start_seq;
                Ok(true)
            }
            Err(Error::LogCorrupt(why)) => {
                log::info!("reached log end: {why}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&mut self, fs: &mut V6FileSystem, e: &LogEntry) -> Result<()> {
        match &e.rec {
            LogRecord::Begin | LogRecord::Commit { .. } | LogRecord::Rewind => Ok(()),
            LogRecord::Patch {
                blockno,
                offset,
                bytes,
            } => {
                let bp = fs.bread(*blockno)?;
                let mut g = bp.lock().unwrap();
                g.data.0[*offset as usize..*offset as usize + bytes.len()].copy_from_slice(bytes);
                g.bdwrite();
                Ok(())
            }
            LogRecord::BlockAlloc {
                blockno,
                zero_on_replay,
            } => {
                let bp = fs.bread(*blockno)?;
                if *zero_on_replay {
                    let mut g = bp.lock().unwrap();
                    g.data.0.fill(0);
                    g.bdwrite();
                }
                self.freemap.set(*blockno as usize, false);
                Ok(())
            }
            LogRecord::BlockFree { blockno } => {
                self.freemap.set(*blockno as usize, true);
                Ok(())
            }
        }
    }

    /// 套用所有完整事务，然后推进检查点、写回位图、
    /// 让超级块重扫空闲节点表
    pub fn replay(&mut self, fs: &mut V6FileSystem) -> Result<()> {
        let first = self.hdr.l_sequence;
        while self.check_tx()? {
            loop {
                let e = self.read_next()?;
                self.apply(fs, &e)?;
                if matches!(e.rec, LogRecord::Commit { .. }) {
                    break;
                }
            }
        }
        log::info!("played log entries {} to {}", first, self.sequence);

        self.hdr.l_sequence = self.sequence;
        self.hdr.l_checkpoint = self.r.tell();
        fs.dev.write_all_at(
            self.freemap.as_bytes(),
            self.hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        // 节点分配不记日志，强迫重挂载后重扫
        fs.superblock.s_fmod = 1;
        fs.superblock.s_ninode = 0;

        // 先把刚套用的改动全部落盘，再把日志头指向新检查点
        fs.sync();
        fs.writeblock(&layout::to_sector(&self.hdr), fs.superblock.s_fsize as u32)?;
        fs.superblock.s_fmod = 1;
        fs.unclean = false;
        Ok(())
    }
}
