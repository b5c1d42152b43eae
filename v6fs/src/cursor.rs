//! # 游标
//!
//! 在一个文件里顺序读写的位置。握着「当前块」的缓冲引用，
//! 按 16 字节目录项这类定长记录走读时不必反复查缓存。
//!
//! 稀疏文件：指针为零的块读出全零、不占存储；写入时才真正分配。

use core::mem;

use crate::cache::{BufRef, InodeRef};
use crate::inode::DoLog;
use crate::{Error, Result, V6FileSystem};
use crate::{MAX_FILE_SIZE, SECTOR_SIZE};

/// 缓冲里的一段连续字节，不跨扇区。
/// 通过闭包按磁盘结构类型访问，避免把字节拷来拷去。
pub struct Span {
    pub bp: BufRef,
    pub off: usize,
}

impl Span {
    #[inline]
    pub fn map<T, V>(&self, f: impl FnOnce(&T) -> V) -> V {
        self.bp.lock().unwrap().map(self.off, f)
    }

    #[inline]
    pub fn map_mut<T, V>(&self, f: impl FnOnce(&mut T) -> V) -> V {
        self.bp.lock().unwrap().map_mut(self.off, f)
    }
}

pub struct Cursor {
    ip: InodeRef,
    // 指向 (pos-1)/SECTOR_SIZE 号块：上一次取出的记录以 pos 结尾，
    // 引用要压着那段字节所在的缓冲
    bp: Option<BufRef>,
    pos: u32,
}

impl Cursor {
    pub fn new(ip: InodeRef) -> Self {
        Self {
            ip,
            bp: None,
            pos: 0,
        }
    }

    #[inline]
    pub fn inode(&self) -> &InodeRef {
        &self.ip
    }

    #[inline]
    pub fn tell(&self) -> u32 {
        self.pos
    }

    pub fn seek(&mut self, pos: u32) -> Result<()> {
        if pos > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge("seek"));
        }
        if pos.wrapping_sub(1) / SECTOR_SIZE as u32 != self.pos.wrapping_sub(1) / SECTOR_SIZE as u32
        {
            self.bp = None;
        }
        self.pos = pos;
        Ok(())
    }

    /// 接下来 `n` 字节的零拷贝视图；到文件尾返回 `None`，
    /// 稀疏空洞整块跳过。`n` 不得跨扇区。
    pub fn readref(&mut self, fs: &mut V6FileSystem, n: usize) -> Result<Option<Span>> {
        if n == 0 {
            return Ok(None);
        }
        if n > SECTOR_SIZE
            || (self.pos as usize + n - 1) / SECTOR_SIZE != self.pos as usize / SECTOR_SIZE
        {
            return Err(Error::Alignment("Cursor::readref"));
        }
        let filesize = self.ip.lock().unwrap().d.size();
        loop {
            if self.pos >= filesize || n as u32 > filesize - self.pos {
                return Ok(None);
            }
            let offset = self.pos % SECTOR_SIZE as u32;
            if self.bp.is_none() || offset == 0 {
                self.bp = fs.getblock(&self.ip, self.pos / SECTOR_SIZE as u32, false)?;
                if self.bp.is_none() {
                    self.pos = self.pos - offset + SECTOR_SIZE as u32;
                    continue;
                }
            }
            self.pos += n as u32;
            return Ok(Some(Span {
                bp: self.bp.clone().unwrap(),
                off: offset as usize,
            }));
        }
    }

    /// `readref` 的写版本：补上空洞、必要时延长文件
    pub fn writeref(&mut self, fs: &mut V6FileSystem, n: usize) -> Result<Span> {
        assert!(n > 0, "Cursor::writeref: empty span");
        if n > SECTOR_SIZE
            || (self.pos as usize + n - 1) / SECTOR_SIZE != self.pos as usize / SECTOR_SIZE
        {
            return Err(Error::Alignment("Cursor::writeref"));
        }
        if n as u32 > MAX_FILE_SIZE - self.pos {
            return Err(Error::FileTooLarge("writeref"));
        }

        let bp = fs.getblock_alloc(&self.ip, self.pos / SECTOR_SIZE as u32)?;
        self.bp = Some(bp.clone());
        let off = self.pos as usize % SECTOR_SIZE;
        self.pos += n as u32;
        if self.pos > self.ip.lock().unwrap().d.size() {
            fs.set_size(&self.ip, self.pos)?;
            fs.mtouch(&self.ip, DoLog::Yes)?;
        }
        bp.lock().unwrap().bdwrite();
        Ok(Span { bp, off })
    }

    /// 取下一条定长记录，类型大小必须整除扇区
    pub fn next<T>(&mut self, fs: &mut V6FileSystem) -> Result<Option<Span>> {
        const {
            assert!(mem::size_of::<T>() <= SECTOR_SIZE && SECTOR_SIZE % mem::size_of::<T>() == 0)
        };
        self.readref(fs, mem::size_of::<T>())
    }

    /// 读 `buf.len()` 字节，空洞补零；返回实际读到的长度。
    /// 有进展就更新 atime。
    pub fn read(&mut self, fs: &mut V6FileSystem, buf: &mut [u8]) -> Result<usize> {
        let filesize = self.ip.lock().unwrap().d.size();
        let mut nread = 0;
        while nread < buf.len() && self.pos < filesize {
            let start = self.pos as usize % SECTOR_SIZE;
            if start == 0 {
                self.bp = None;
            }
            let mut to_read = SECTOR_SIZE - start;
            to_read = to_read.min(buf.len() - nread);
            to_read = to_read.min((filesize - self.pos) as usize);
            if self.bp.is_none() {
                self.bp = fs.getblock(&self.ip, self.pos / SECTOR_SIZE as u32, false)?;
            }
            let dst = &mut buf[nread..nread + to_read];
            match &self.bp {
                Some(bp) => {
                    let g = bp.lock().unwrap();
                    dst.copy_from_slice(&g.data.0[start..start + to_read]);
                }
                None => dst.fill(0),
            }
            nread += to_read;
            self.pos += to_read as u32;
        }
        if nread > 0 {
            fs.atouch(&self.ip);
        }
        if self.pos % SECTOR_SIZE as u32 == 0 {
            self.bp = None;
        }
        Ok(nread)
    }

    /// 写 `buf`，按需分配块。文件变长才把 mtime 记日志，
    /// 原地覆写的 mtime 丢了就丢了。
    pub fn write(&mut self, fs: &mut V6FileSystem, buf: &[u8]) -> Result<usize> {
        if buf.len() as u32 > MAX_FILE_SIZE - self.pos {
            return Err(Error::FileTooLarge("write"));
        }

        let mut nwritten = 0;
        while nwritten < buf.len() {
            let start = self.pos as usize % SECTOR_SIZE;
            if start == 0 {
                self.bp = None;
            }
            let to_write = (SECTOR_SIZE - start).min(buf.len() - nwritten);
            if self.bp.is_none() {
                self.bp = Some(fs.getblock_alloc(&self.ip, self.pos / SECTOR_SIZE as u32)?);
            }
            {
                let bp = self.bp.as_ref().unwrap();
                let mut g = bp.lock().unwrap();
                g.data.0[start..start + to_write]
                    .copy_from_slice(&buf[nwritten..nwritten + to_write]);
                g.bdwrite();
            }
            self.pos += to_write as u32;
            nwritten += to_write;
        }
        if nwritten > 0 {
            if self.pos > self.ip.lock().unwrap().d.size() {
                fs.set_size(&self.ip, self.pos)?;
                fs.mtouch(&self.ip, DoLog::Yes)?;
            } else {
                fs.mtouch(&self.ip, DoLog::No)?;
            }
        }
        if self.pos % SECTOR_SIZE as u32 == 0 {
            self.bp = None;
        }
        Ok(nwritten)
    }
}
