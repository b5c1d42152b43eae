//! # 设备接口层
//!
//! [`RawDevice`] 是对镜像文件等字节寻址存储设备的抽象，
//! 实现了此特质的类型即可挂载文件系统。
//!
//! 日志记录不按扇区对齐，所以接口以字节偏移读写；
//! 扇区粒度的读写由上层自行拼装。

use std::fs::File;
use std::io;

/// 字节寻址的底层设备
pub trait RawDevice: Send + Sync {
    /// 从 `offset` 处读取，返回实际读到的字节数（文件尾可短读）
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// 向 `offset` 处写入，返回实际写入的字节数
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// 设备总长度
    fn len(&self) -> io::Result<u64>;

    /// 调整设备长度（扩展部分填零）
    fn set_len(&self, len: u64) -> io::Result<()>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 读满 `buf`，短读视为错误
    fn read_exact_at(&self, buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        let mut buf = buf;
        while !buf.is_empty() {
            match self.read_at(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }

    /// 写出整个 `buf`
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl RawDevice for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}
