use core::{ptr, slice};

/// 目录项名字上限，不足时补 `\0`，占满 14 字节则不带终止符
pub const NAME_MAX_LEN: usize = 14;

/// 目录项：16 字节的「节点号 + 名字」对。
/// 节点号为 0 表示空槽，创建目录项时可以复用。
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct DirEntry {
    pub d_inumber: u16,
    d_name: [u8; NAME_MAX_LEN],
}

impl DirEntry {
    pub const SIZE: usize = 16;

    pub fn name(&self) -> &[u8] {
        let len = self
            .d_name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_MAX_LEN);
        &self.d_name[..len]
    }

    /// 名字的展示形式，非 UTF-8 的字节做有损转换
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name()).into_owned()
    }

    pub fn set_name(&mut self, name: &[u8]) {
        assert!(name.len() <= NAME_MAX_LEN, "directory entry name too long");
        self.d_name.fill(0);
        self.d_name[..name.len()].copy_from_slice(name);
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), Self::SIZE) }
    }
}
