//! # 缓冲读写器
//!
//! 日志记录不按扇区对齐，[`FdReader`]/[`FdWriter`] 在设备上蒙一层
//! 8 KiB 对齐页的缓冲，把零碎的记录读写攒成整页 I/O。
//!
//! 读缓冲的起点、写缓冲的终点始终对齐到 `BUF_SIZE` 边界。

use std::sync::Arc;

use block_dev::RawDevice;

use crate::Result;

pub const BUF_SIZE: usize = 8192;

#[inline]
fn offset(pos: u32) -> u32 {
    pos % BUF_SIZE as u32
}

#[inline]
fn lower_bound(pos: u32) -> u32 {
    pos - offset(pos)
}

#[inline]
fn upper_bound(pos: u32) -> u32 {
    lower_bound(pos) + BUF_SIZE as u32
}

/// 缓冲内容为半开区间 `[lower_bound(pos), buf_end)`
pub struct FdReader {
    dev: Arc<dyn RawDevice>,
    buf: Box<[u8; BUF_SIZE]>,
    buf_end: u32,
    pos: u32,
}

impl FdReader {
    pub fn new(dev: Arc<dyn RawDevice>) -> Self {
        Self {
            dev,
            buf: Box::new([0; BUF_SIZE]),
            buf_end: 0,
            pos: 0,
        }
    }

    /// 读满 `dst` 返回 true；遇到文件尾读不满则返回 false
    pub fn try_read(&mut self, dst: &mut [u8]) -> Result<bool> {
        let mut read = 0;
        while read < dst.len() {
            if self.pos >= self.buf_end {
                let start = lower_bound(self.pos);
                let n = self.dev.read_at(&mut self.buf[..], start as u64)?;
                if n <= offset(self.pos) as usize {
                    return Ok(false);
                }
                self.buf_end = start + n as u32;
            }
            let n = ((self.buf_end - self.pos) as usize).min(dst.len() - read);
            let o = offset(self.pos) as usize;
            dst[read..read + n].copy_from_slice(&self.buf[o..o + n]);
            self.pos += n as u32;
            read += n;
        }
        Ok(true)
    }

    /// 目标离开当前缓冲窗口时丢弃缓冲
    pub fn seek(&mut self, pos: u32) {
        if pos < lower_bound(self.pos) || self.buf_end <= pos {
            self.buf_end = 0;
        }
        self.pos = pos;
    }

    #[inline]
    pub fn tell(&self) -> u32 {
        self.pos
    }
}

/// 不变式：`buf_start <= pos < upper_bound(buf_start)`，
/// 未刷出的字节在 `[buf_start, pos)`
pub struct FdWriter {
    dev: Arc<dyn RawDevice>,
    buf: Box<[u8; BUF_SIZE]>,
    buf_start: u32,
    pos: u32,
}

impl FdWriter {
    pub fn new(dev: Arc<dyn RawDevice>) -> Self {
        Self {
            dev,
            buf: Box::new([0; BUF_SIZE]),
            buf_start: 0,
            pos: 0,
        }
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = ((upper_bound(self.buf_start) - self.pos) as usize).min(data.len());
            let o = (self.pos - self.buf_start) as usize;
            self.buf[o..o + n].copy_from_slice(&data[..n]);
            self.pos += n as u32;
            data = &data[n..];
            if offset(self.pos) == 0 {
                self.flush()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pos <= self.buf_start {
            return Ok(());
        }
        let len = (self.pos - self.buf_start) as usize;
        self.dev.write_all_at(&self.buf[..len], self.buf_start as u64)?;
        self.buf_start = self.pos;
        Ok(())
    }

    /// 挪动写入位置，先把已有内容刷出去
    pub fn seek(&mut self, pos: u32) -> Result<()> {
        self.flush()?;
        self.pos = pos;
        self.buf_start = pos;
        Ok(())
    }

    #[inline]
    pub fn tell(&self) -> u32 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::*;

    #[test]
    fn scattered_writes_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("img"))
            .unwrap();
        file.set_len(4 * BUF_SIZE as u64).unwrap();
        let dev: Arc<dyn RawDevice> = Arc::new(file);

        let mut w = FdWriter::new(dev.clone());
        w.seek(BUF_SIZE as u32 - 3).unwrap();
        w.write(b"abcdef").unwrap(); // 跨页
        w.seek(10).unwrap();
        w.write(&[7; 13]).unwrap();
        w.flush().unwrap();

        let mut r = FdReader::new(dev);
        let mut buf = [0; 6];
        r.seek(BUF_SIZE as u32 - 3);
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(&buf, b"abcdef");

        r.seek(10);
        let mut buf = [0; 13];
        assert!(r.try_read(&mut buf).unwrap());
        assert_eq!(buf, [7; 13]);
    }

    #[test]
    fn short_read_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("img"))
            .unwrap();
        file.set_len(16).unwrap();
        let dev: Arc<dyn RawDevice> = Arc::new(file);

        let mut r = FdReader::new(dev);
        r.seek(10);
        let mut buf = [0; 10];
        assert!(!r.try_read(&mut buf).unwrap());
    }
}
