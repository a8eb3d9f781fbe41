//! 提交序列号模块
//!
//! 每个队列索引（queue-index）有独立、单调递增的序列号序列。
//! 序列号只在同一索引内可比较；不同索引之间没有顺序。
//!
//! # 水位线
//!
//! 对每个索引维护三条水位线：enqueued ≥ submitted ≥ completed。
//! 它们都用 [`AtomicQueueSerialArray`] 保存，只通过 `fetch_max` 前进。

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// 序列号
///
/// 0 表示“从未使用”，有效序列号从 1 开始。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 队列索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialIndex(u32);

impl SerialIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// (队列索引, 序列号) 对
///
/// 只有索引相同时才有顺序，`partial_cmp` 对不同索引返回 `None`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueSerial {
    index: SerialIndex,
    serial: Serial,
}

impl QueueSerial {
    pub fn new(index: SerialIndex, serial: Serial) -> Self {
        Self { index, serial }
    }

    pub fn index(&self) -> SerialIndex {
        self.index
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn valid(&self) -> bool {
        !self.serial.is_zero()
    }
}

impl PartialOrd for QueueSerial {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        if self.index != other.index {
            return None;
        }
        Some(self.serial.cmp(&other.serial))
    }
}

impl fmt::Display for QueueSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index.0, self.serial.0)
    }
}

/// 资源使用记录
///
/// 对每个队列索引记录资源依赖的最高序列号。
/// 当所有记录的序列号都不大于对应的 completed 水位线时，这次使用才算结束。
///
/// 只保存用到的索引（按索引排序），占用的内存与索引值的大小无关。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceUse {
    serials: Vec<(SerialIndex, Serial)>,
}

impl ResourceUse {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由单个序列号构造
    pub fn from_queue_serial(queue_serial: QueueSerial) -> Self {
        let mut usage = Self::new();
        usage.set_queue_serial(queue_serial);
        usage
    }

    /// 记录一次使用（只会提高对应索引的序列号）
    pub fn set_queue_serial(&mut self, queue_serial: QueueSerial) {
        if !queue_serial.valid() {
            return;
        }
        let index = queue_serial.index();
        match self.serials.binary_search_by_key(&index, |(slot, _)| *slot) {
            Ok(position) => {
                let serial = &mut self.serials[position].1;
                *serial = (*serial).max(queue_serial.serial());
            }
            Err(position) => self.serials.insert(position, (index, queue_serial.serial())),
        }
    }

    /// 合并另一次使用
    pub fn merge(&mut self, other: &ResourceUse) {
        for (index, serial) in other.iter() {
            self.set_queue_serial(QueueSerial::new(index, serial));
        }
    }

    /// 指定索引上的序列号
    pub fn serial(&self, index: SerialIndex) -> Serial {
        self.serials
            .binary_search_by_key(&index, |(slot, _)| *slot)
            .map_or(Serial::ZERO, |position| self.serials[position].1)
    }

    /// 遍历 (索引, 序列号)，按索引升序
    pub fn iter(&self) -> impl Iterator<Item = (SerialIndex, Serial)> + '_ {
        self.serials.iter().copied()
    }

    /// 记录中最大的队列索引
    pub fn max_index(&self) -> Option<SerialIndex> {
        self.serials.last().map(|(index, _)| *index)
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    /// 是否被给定的水位线快照覆盖
    pub fn is_covered_by(&self, watermarks: &[Serial]) -> bool {
        self.iter().all(|(index, serial)| {
            watermarks.get(index.as_usize()).map_or(false, |mark| *mark >= serial)
        })
    }
}

/// 原子序列号数组
///
/// 每个队列索引一个槽位，只能前进不能后退。
#[derive(Debug)]
pub struct AtomicQueueSerialArray {
    serials: Box<[AtomicU64]>,
}

impl AtomicQueueSerialArray {
    pub fn new(size: usize) -> Self {
        Self {
            serials: (0..size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }

    pub fn load(&self, index: SerialIndex) -> Serial {
        self.serials
            .get(index.as_usize())
            .map_or(Serial::ZERO, |slot| Serial(slot.load(Ordering::Acquire)))
    }

    /// 前进到 `serial`，如果当前值已经更大则不变
    ///
    /// 返回之前的值。
    pub fn advance(&self, queue_serial: QueueSerial) -> Serial {
        match self.serials.get(queue_serial.index().as_usize()) {
            Some(slot) => Serial(slot.fetch_max(queue_serial.serial().value(), Ordering::AcqRel)),
            None => Serial::ZERO,
        }
    }

    /// 把另一个数组的所有槽位合并进来
    pub fn advance_all(&self, other: &AtomicQueueSerialArray) {
        for (mine, theirs) in self.serials.iter().zip(other.serials.iter()) {
            mine.fetch_max(theirs.load(Ordering::Acquire), Ordering::AcqRel);
        }
    }

    pub fn snapshot(&self) -> Vec<Serial> {
        self.serials.iter().map(|slot| Serial(slot.load(Ordering::Acquire))).collect()
    }

    pub fn covers(&self, queue_serial: QueueSerial) -> bool {
        self.load(queue_serial.index()) >= queue_serial.serial()
    }

    pub fn covers_use(&self, usage: &ResourceUse) -> bool {
        usage.iter().all(|(index, serial)| self.load(index) >= serial)
    }
}

/// 每个队列索引的序列号生成器
#[derive(Debug)]
pub struct SerialFactory {
    next: AtomicU64,
}

impl SerialFactory {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// 生成一个新序列号，永不重复
    pub fn generate(&self) -> Serial {
        Serial(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SerialFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// 队列索引分配器
///
/// 每个生产者（上下文）占用一个索引，同一时刻一个索引只属于一个生产者。
#[derive(Debug)]
pub struct QueueSerialIndexAllocator {
    free: Mutex<Vec<bool>>,
}

impl QueueSerialIndexAllocator {
    pub fn new(max_indices: usize) -> Self {
        Self {
            free: Mutex::new(vec![true; max_indices]),
        }
    }

    /// 分配一个空闲索引，用尽时返回 `None`
    pub fn allocate(&self) -> Option<SerialIndex> {
        let mut free = self.free.lock();
        let slot = free.iter().position(|is_free| *is_free)?;
        free[slot] = false;
        Some(SerialIndex::new(slot as u32))
    }

    pub fn release(&self, index: SerialIndex) {
        let mut free = self.free.lock();
        if let Some(slot) = free.get_mut(index.as_usize()) {
            debug_assert!(!*slot, "queue serial index released twice");
            *slot = true;
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.free.lock().iter().filter(|is_free| !**is_free).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qs(index: u32, serial: u64) -> QueueSerial {
        QueueSerial::new(SerialIndex::new(index), Serial::new(serial))
    }

    #[test]
    fn test_queue_serial_ordering() {
        assert!(qs(0, 1) < qs(0, 2));
        assert_eq!(qs(0, 3), qs(0, 3));
        // 不同索引之间不可比较
        assert_eq!(qs(0, 1).partial_cmp(&qs(1, 2)), None);
        assert!(!(qs(0, 1) < qs(1, 2)));
    }

    #[test]
    fn test_resource_use_coverage() {
        let mut usage = ResourceUse::from_queue_serial(qs(0, 5));
        usage.set_queue_serial(qs(2, 3));
        usage.set_queue_serial(qs(0, 4)); // 不会降低

        assert_eq!(usage.serial(SerialIndex::new(0)), Serial::new(5));
        assert!(!usage.is_covered_by(&[Serial::new(5)]));
        assert!(usage.is_covered_by(&[Serial::new(5), Serial::ZERO, Serial::new(3)]));

        let mut merged = ResourceUse::from_queue_serial(qs(1, 7));
        merged.merge(&usage);
        assert_eq!(merged.iter().count(), 3);
    }

    #[test]
    fn test_resource_use_with_huge_index_stays_small() {
        let mut usage = ResourceUse::from_queue_serial(qs(u32::MAX, 1));
        usage.set_queue_serial(qs(3, 2));

        assert_eq!(usage.iter().count(), 2);
        assert_eq!(usage.max_index(), Some(SerialIndex::new(u32::MAX)));
        assert_eq!(usage.serial(SerialIndex::new(u32::MAX)), Serial::new(1));
        // 越界索引永远不会被水位线覆盖
        let array = AtomicQueueSerialArray::new(4);
        array.advance(qs(3, 2));
        assert!(!array.covers_use(&usage));
    }

    #[test]
    fn test_atomic_array_is_monotonic() {
        let array = AtomicQueueSerialArray::new(4);
        array.advance(qs(1, 10));
        array.advance(qs(1, 4));

        assert_eq!(array.load(SerialIndex::new(1)), Serial::new(10));
        assert!(array.covers(qs(1, 9)));
        assert!(!array.covers(qs(1, 11)));
        // 越界索引视为从未提交
        assert_eq!(array.load(SerialIndex::new(9)), Serial::ZERO);
    }

    #[test]
    fn test_serial_factory() {
        let factory = SerialFactory::new();
        let a = factory.generate();
        let b = factory.generate();
        assert_eq!(a, Serial::new(1));
        assert!(b > a);
    }

    #[test]
    fn test_index_allocator() {
        let allocator = QueueSerialIndexAllocator::new(2);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert!(allocator.allocate().is_none());

        allocator.release(a);
        assert_eq!(allocator.allocate(), Some(a));
        assert_eq!(allocator.allocated_count(), 2);
    }
}
