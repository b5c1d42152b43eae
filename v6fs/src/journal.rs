//! # 预写日志
//!
//! 每个改动文件系统的操作都包在一个事务里：`LogBegin` 起头，
//! 一串补丁/分配/释放记录，`LogCommit` 收尾。提交之前记录只进日志，
//! 家位置不动；检查点把已提交的效果推回家并推进 `l_checkpoint`。
//!
//! 空闲块由内存位图管理，位图的磁盘副本只在检查点重写，
//! 两次检查点之间靠重放日志重建。

use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use block_dev::RawDevice;

use crate::bufio::FdWriter;
use crate::fsops;
use crate::layout::FileSys;
use crate::logrec::{read_loghdr, LogEntry, LogHeader, LogRecord, LOG_MAGIC};
use crate::{layout, Bitmap, Error, Lsn, Result, V6FileSystem, SECTOR_SIZE};

/// 事务令牌。`owner` 为真的那层负责提交；
/// 嵌套的 `begin` 拿到的是不会重复提交的空令牌。
#[must_use]
pub struct Tx {
    pub(crate) owner: bool,
}

impl Tx {
    pub(crate) fn noop() -> Self {
        Self { owner: false }
    }
}

pub struct V6Log {
    w: FdWriter,
    pub hdr: LogHeader,
    /// 空闲块位图，1 为空闲
    pub freemap: Bitmap,
    /// 最后写出的记录的 LSN
    pub sequence: Lsn,
    /// 已落盘的最高 LSN
    pub committed: Lsn,
    /// 已推回家位置的最高 LSN
    pub applied: Lsn,
    pub in_tx: bool,
    begin_sequence: Lsn,
    /// 上一次分配到的块，就近接着找
    last_balloc: u16,
    /// 本事务释放的块，位图要等提交才置位，
    /// 免得释放还没持久就有人把块当空闲读走
    freed: Vec<u16>,
    checkpoint_time: Instant,
    /// 测试模式：不推进 `committed`，日志写满就当场崩溃。
    /// 只用来造测试镜像，平时保持 false。
    pub suppress_commit: bool,
}

impl V6Log {
    pub fn open(dev: Arc<dyn RawDevice>, sb: &FileSys) -> Result<Self> {
        let hdr = read_loghdr(dev.as_ref(), sb.s_fsize as u32)?;
        let mut freemap = Bitmap::new(sb.s_fsize as usize, sb.datastart() as usize);
        dev.read_exact_at(
            freemap.as_bytes_mut(),
            hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        freemap.tidy();

        // 序列号回退一格：检查点之前崩溃的话，
        // 日志里的第一条记录要和日志头对得上
        let seq = hdr.l_sequence.wrapping_sub(1);
        let mut w = FdWriter::new(dev);
        w.seek(hdr.l_checkpoint)?;

        Ok(Self {
            w,
            hdr,
            freemap,
            sequence: seq,
            committed: seq,
            applied: seq,
            in_tx: false,
            begin_sequence: seq,
            last_balloc: 0,
            freed: Vec::new(),
            checkpoint_time: Instant::now(),
            suppress_commit: false,
        })
    }

    pub(crate) fn begin(&mut self) -> Result<Tx> {
        if self.in_tx {
            return Ok(Tx::noop());
        }
        self.append(LogRecord::Begin)?;
        self.begin_sequence = self.sequence;
        self.in_tx = true;
        Ok(Tx { owner: true })
    }

    /// 追加一条记录。快到日志区末尾时先写 `LogRewind`，
    /// 跳回区头接着写。
    pub fn append(&mut self, rec: LogRecord) -> Result<()> {
        self.sequence = self.sequence.wrapping_add(1);
        let mut entry = LogEntry {
            sequence: self.sequence,
            rec,
        };
        let pos = self.w.tell();
        if pos + LogEntry::REWIND_NBYTES > self.hdr.logend() * SECTOR_SIZE as u32 {
            LogEntry {
                sequence: self.sequence,
                rec: LogRecord::Rewind,
            }
            .save(&mut self.w)?;
            self.sequence = self.sequence.wrapping_add(1);
            entry.sequence = self.sequence;
            self.w.seek(self.hdr.logstart() * SECTOR_SIZE as u32)?;
        }
        entry.save(&mut self.w)
    }

    /// 从 `near` 起就近找空闲块，清位图位并记日志
    pub fn balloc_near(
        &mut self,
        mut near: u16,
        metadata: bool,
        datastart: u16,
        fsize: u16,
    ) -> Result<u16> {
        if near < datastart || near >= fsize {
            near = datastart;
        }
        let Some(bn) = self.freemap.find_first_set(near as usize) else {
            return Ok(0);
        };
        self.freemap.set(bn, false);
        if self.in_tx {
            self.append(LogRecord::BlockAlloc {
                blockno: bn as u16,
                zero_on_replay: metadata,
            })?;
        }
        Ok(bn as u16)
    }

    pub fn balloc(&mut self, metadata: bool, datastart: u16, fsize: u16) -> Result<u16> {
        let near = if self.suppress_commit { 0 } else { self.last_balloc };
        let bn = self.balloc_near(near, metadata, datastart, fsize)?;
        self.last_balloc = bn;
        Ok(bn)
    }

    pub fn bfree(&mut self, blockno: u16) -> Result<()> {
        assert!(self.in_tx, "bfree outside transaction");
        self.freed.push(blockno);
        self.append(LogRecord::BlockFree { blockno })
    }

    /// 把日志缓冲推到设备上，推进 `committed`
    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        if !self.suppress_commit {
            self.committed = if self.in_tx {
                self.begin_sequence.wrapping_sub(1)
            } else {
                self.sequence
            };
        }
        Ok(())
    }

    /// 写游标到检查点的环形距离
    pub fn space(&self) -> u32 {
        let pos = self.w.tell();
        let cp = self.hdr.l_checkpoint;
        if cp >= pos {
            cp - pos
        } else {
            self.hdr.logbytes().wrapping_sub(pos - cp)
        }
    }

    #[inline]
    pub fn writer_pos(&self) -> u32 {
        self.w.tell()
    }

    /// 给镜像加一段日志区：日志头、空闲位图、环形日志。
    /// `log_blocks` 传 0 用默认大小。
    pub fn create(fs: &mut V6FileSystem, log_blocks: u16) -> Result<()> {
        let mut hdr = LogHeader::zeroed();
        hdr.l_magic = LOG_MAGIC;
        hdr.l_hdrblock = fs.superblock.s_fsize as u32;
        hdr.l_mapsize = ((fs.superblock.s_fsize - fs.superblock.datastart()) as u32)
            .div_ceil(8 * SECTOR_SIZE as u32) as u16;
        let log_blocks = if log_blocks == 0 {
            fs.superblock.s_fsize / 64 + 8
        } else {
            log_blocks
        };
        hdr.l_logsize = hdr.l_mapsize + log_blocks;
        hdr.l_checkpoint = hdr.logstart() * SECTOR_SIZE as u32;
        hdr.l_sequence = rnd_u32()?;

        // 先掐掉可能残留的旧日志区，再扩到新长度
        fs.dev.set_len(hdr.l_hdrblock as u64 * SECTOR_SIZE as u64)?;
        fs.dev.set_len(hdr.logend() as u64 * SECTOR_SIZE as u64)?;

        let freemap = fsops::fs_freemap(fs)?;
        fs.dev.write_all_at(
            freemap.as_bytes(),
            hdr.mapstart() as u64 * SECTOR_SIZE as u64,
        )?;
        fs.writeblock(&layout::to_sector(&hdr), hdr.l_hdrblock)?;
        fs.superblock.s_uselog = 1;
        // 空闲块改走位图
        fs.superblock.s_nfree = 0;
        fs.write_superblock()?;
        Ok(())
    }
}

impl V6FileSystem {
    /// 开启一个事务；没有日志时给空令牌
    pub fn begin(&mut self) -> Result<Tx> {
        match self.log.as_mut() {
            Some(l) => l.begin(),
            None => Ok(Tx::noop()),
        }
    }

    /// 提交事务：写 `LogCommit`，把本事务释放的块归还位图。
    /// 日志剩余空间不足一半、或距上次检查点超过 30 秒时顺手做检查点。
    pub fn commit(&mut self, tx: Tx) -> Result<()> {
        if !tx.owner || self.log.is_none() {
            return Ok(());
        }
        let need_checkpoint = {
            let l = self.log.as_mut().unwrap();
            let begin_seq = l.begin_sequence;
            l.append(LogRecord::Commit {
                sequence: begin_seq,
            })?;
            for bn in std::mem::take(&mut l.freed) {
                l.freemap.set(bn as usize, true);
            }
            l.in_tx = false;
            if l.suppress_commit {
                l.flush()?;
                if l.space() < SECTOR_SIZE as u32 {
                    eprintln!("log full, aborting");
                    std::process::abort();
                }
                false
            } else {
                l.space() < l.hdr.logbytes() / 2
                    || l.checkpoint_time.elapsed() > Duration::from_secs(30)
            }
        };
        if need_checkpoint {
            log::debug!(
                "log space low or checkpoint stale ({} bytes left), checkpointing",
                self.log.as_ref().unwrap().space()
            );
            self.checkpoint()?;
        }
        Ok(())
    }

    /// 事务套在一个闭包里跑。无论闭包成败都提交：
    /// 错误路径上已写的记录也会封口，最多留下一些
    /// 分配了够不着的块，下次 fsck 回收。
    pub fn with_tx<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let tx = self.begin()?;
        let res = f(self);
        self.commit(tx)?;
        res
    }

    /// 检查点：日志刷盘、缓存同步回家、写位图和新日志头。
    /// 之后崩溃重放从新的 `l_checkpoint` 开始。
    pub fn checkpoint(&mut self) -> Result<()> {
        assert!(
            !self.log.as_ref().unwrap().in_tx,
            "checkpoint inside transaction"
        );
        if self.log.as_ref().unwrap().suppress_commit {
            self.log.as_mut().unwrap().w.flush()?;
            self.sync();
            return Ok(());
        }
        {
            let l = self.log.as_mut().unwrap();
            l.hdr.l_checkpoint = l.w.tell();
            l.hdr.l_sequence = l.sequence.wrapping_add(1);
            log::debug!(
                "checkpoint at offset {}, sequence {}",
                l.hdr.l_checkpoint,
                l.hdr.l_sequence
            );
            // 垫一个空事务，回绕之后日志永远不会被读成「空」
            l.append(LogRecord::Begin)?;
            let begin_seq = l.sequence;
            l.append(LogRecord::Commit {
                sequence: begin_seq,
            })?;
            l.flush()?;
        }

        if !self.sync() {
            return Err(Error::Io(std::io::Error::other("checkpoint sync failed")));
        }

        let (hdr_sector, hdrblock) = {
            let l = self.log.as_mut().unwrap();
            l.applied = l.committed;
            for bn in std::mem::take(&mut l.freed) {
                l.freemap.set(bn as usize, true);
            }
            self.dev.write_all_at(
                l.freemap.as_bytes(),
                l.hdr.mapstart() as u64 * SECTOR_SIZE as u64,
            )?;
            (layout::to_sector(&l.hdr), l.hdr.l_hdrblock)
        };
        self.writeblock(&hdr_sector, hdrblock)?;
        let l = self.log.as_mut().unwrap();
        l.checkpoint_time = Instant::now();
        log::info!(
            "checkpoint complete, applied through LSN {}",
            l.applied
        );
        Ok(())
    }
}

/// 日志初始序列号取随机数，避免新旧日志的 LSN 撞上
fn rnd_u32() -> Result<u32> {
    let mut buf = [0; 4];
    File::open("/dev/urandom")?.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
