//! # 缓存层
//!
//! 固定容量的扇区缓冲池与索引节点池。条目都包在 `Arc<Mutex<_>>` 里，
//! 引用计数就是外借情况：`strong_count == 1` 才允许回收。
//!
//! 与日志的关系：条目被日志补丁弄脏时记下补丁的 LSN，
//! 该 LSN 落盘（`lsn_le(lsn, committed)`）之前不得写回原位置，
//! 否则崩溃后重放无法撤销半截事务。

use core::mem;
use std::sync::{Arc, Mutex};

use crate::layout::DiskInode;
use crate::{Lsn, SECTOR_SIZE};

/// 扇区字节，保证对齐，可以按磁盘结构类型就地访问
#[repr(C, align(8))]
pub struct SectorData(pub [u8; SECTOR_SIZE]);

/// 内存中的扇区缓冲
pub struct Buffer {
    blockno: u16,
    pub data: SectorData,
    /// 已从磁盘读入或已被整体覆盖
    pub initialized: bool,
    pub dirty: bool,
    /// 带着未落盘的日志补丁
    pub logged: bool,
    pub lsn: Lsn,
}

pub type BufRef = Arc<Mutex<Buffer>>;

impl Buffer {
    pub(crate) fn new(blockno: u16) -> Self {
        Self {
            blockno,
            data: SectorData([0; SECTOR_SIZE]),
            initialized: false,
            dirty: false,
            logged: false,
            lsn: 0,
        }
    }

    #[inline]
    pub fn blockno(&self) -> u16 {
        self.blockno
    }

    /// 延迟写：标脏，由回收、`sync` 或检查点写回
    #[inline]
    pub fn bdwrite(&mut self) {
        self.initialized = true;
        self.dirty = true;
    }

    pub fn get<T>(&self, offset: usize) -> &T {
        assert!(offset + mem::size_of::<T>() <= SECTOR_SIZE);
        assert!(offset % mem::align_of::<T>() == 0);
        unsafe { &*self.data.0.as_ptr().add(offset).cast() }
    }

    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        self.bdwrite();
        self.get_mut_untracked(offset)
    }

    /// 与 `get_mut` 相同但不标脏，改动由之后的补丁记账
    pub fn get_mut_untracked<T>(&mut self, offset: usize) -> &mut T {
        assert!(offset + mem::size_of::<T>() <= SECTOR_SIZE);
        assert!(offset % mem::align_of::<T>() == 0);
        unsafe { &mut *self.data.0.as_mut_ptr().add(offset).cast() }
    }

    #[inline]
    pub fn map<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get(offset))
    }

    #[inline]
    pub fn map_mut<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }
}

/// 内存中的索引节点。磁盘映像整份复制进来，
/// 写回时再拷回所在扇区的缓冲（见 `V6FileSystem::iput`）。
pub struct InodeSlot {
    inum: u16,
    pub d: DiskInode,
    pub initialized: bool,
    pub dirty: bool,
    pub logged: bool,
    pub lsn: Lsn,
}

pub type InodeRef = Arc<Mutex<InodeSlot>>;

impl InodeSlot {
    pub(crate) fn new(inum: u16) -> Self {
        Self {
            inum,
            d: DiskInode::default(),
            initialized: false,
            dirty: false,
            logged: false,
            lsn: 0,
        }
    }

    #[inline]
    pub fn inum(&self) -> u16 {
        self.inum
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// 固定容量的条目池。队列顺序即 LRU：队首最冷，命中挪到队尾。
pub(crate) struct CachePool<T> {
    capacity: usize,
    queue: Vec<(u16, Arc<Mutex<T>>)>,
}

impl<T> CachePool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Vec::with_capacity(capacity),
        }
    }

    /// 命中则挪到队尾并返回
    pub fn try_lookup(&mut self, id: u16) -> Option<Arc<Mutex<T>>> {
        let i = self.queue.iter().position(|(k, _)| *k == id)?;
        let entry = self.queue.remove(i);
        let r = entry.1.clone();
        self.queue.push(entry);
        Some(r)
    }

    /// 只查不动 LRU
    pub fn peek(&self, id: u16) -> Option<Arc<Mutex<T>>> {
        self.queue
            .iter()
            .find_map(|(k, e)| (*k == id).then(|| e.clone()))
    }

    pub fn insert(&mut self, id: u16, v: T) -> Arc<Mutex<T>> {
        debug_assert!(self.queue.len() < self.capacity);
        let e = Arc::new(Mutex::new(v));
        self.queue.push((id, e.clone()));
        e
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// 摘下队首第一个无人引用且满足 `can` 的条目。
    /// 脏数据写回由调用方负责（需要设备或其它缓存）。
    pub fn evict(&mut self, can: impl Fn(&T) -> bool) -> Option<(u16, Arc<Mutex<T>>)> {
        let i = self.queue.iter().position(|(_, e)| {
            Arc::strong_count(e) == 1 && can(&e.lock().unwrap())
        })?;
        Some(self.queue.remove(i))
    }

    /// 接下来 `want` 次分配能否成功
    pub fn can_alloc(&self, want: usize, can: impl Fn(&T) -> bool) -> bool {
        let mut n = self.capacity - self.queue.len();
        for (_, e) in &self.queue {
            if n >= want {
                break;
            }
            if Arc::strong_count(e) == 1 && can(&e.lock().unwrap()) {
                n += 1;
            }
        }
        n >= want
    }

    /// 丢弃 `id` 的条目，不写回
    pub fn free(&mut self, id: u16) -> Option<Arc<Mutex<T>>> {
        let i = self.queue.iter().position(|(k, _)| *k == id)?;
        Some(self.queue.remove(i).1)
    }

    /// 丢弃全部条目，不写回
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// 当前条目的快照，供 flush 遍历
    pub fn entries(&self) -> Vec<(u16, Arc<Mutex<T>>)> {
        self.queue.clone()
    }
}
