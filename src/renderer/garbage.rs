//! 延迟销毁模块
//!
//! 仍可能被在途批次使用的设备对象不能立即销毁，先连同其 [`ResourceUse`] 放入垃圾列表，
//! 等对应的序列号全部完成后再销毁。

use std::collections::VecDeque;

use super::serial::{AtomicQueueSerialArray, ResourceUse};
use crate::gfx::backend::{DeviceBackend, DeviceObject};

/// 一组共享同一次资源使用的待销毁对象
#[derive(Debug)]
pub struct SharedGarbage {
    usage: ResourceUse,
    objects: Vec<DeviceObject>,
}

impl SharedGarbage {
    pub fn new(usage: ResourceUse, objects: Vec<DeviceObject>) -> Self {
        Self { usage, objects }
    }

    pub fn usage(&self) -> &ResourceUse {
        &self.usage
    }

    /// 资源使用已完成时销毁对象并返回 true
    fn destroy_if_complete(&mut self, device: &dyn DeviceBackend, completed: &AtomicQueueSerialArray) -> bool {
        if !completed.covers_use(&self.usage) {
            return false;
        }
        self.destroy(device);
        true
    }

    fn destroy(&mut self, device: &dyn DeviceBackend) {
        for object in self.objects.drain(..) {
            device.destroy_object(object);
        }
    }
}

/// 垃圾列表
///
/// 按加入顺序保存；同一队列索引上先加入的垃圾先完成。
#[derive(Debug, Default)]
pub struct GarbageList {
    garbage: VecDeque<SharedGarbage>,
    pending_objects: usize,
}

impl GarbageList {
    pub fn add(&mut self, garbage: SharedGarbage) {
        self.pending_objects += garbage.objects.len();
        self.garbage.push_back(garbage);
    }

    /// 销毁所有已完成的垃圾，返回销毁的对象数量
    ///
    /// 遇到第一个未完成的条目即停止。
    pub fn cleanup(&mut self, device: &dyn DeviceBackend, completed: &AtomicQueueSerialArray) -> usize {
        let mut destroyed = 0;
        while let Some(front) = self.garbage.front_mut() {
            let count = front.objects.len();
            if !front.destroy_if_complete(device, completed) {
                break;
            }
            destroyed += count;
            self.garbage.pop_front();
        }
        self.pending_objects -= destroyed;
        destroyed
    }

    /// 不检查完成状态，全部销毁（设备空闲或丢失后使用）
    pub fn destroy_all(&mut self, device: &dyn DeviceBackend) -> usize {
        let destroyed = self.pending_objects;
        for mut garbage in self.garbage.drain(..) {
            garbage.destroy(device);
        }
        self.pending_objects = 0;
        destroyed
    }

    pub fn pending_object_count(&self) -> usize {
        self.pending_objects
    }

    pub fn is_empty(&self) -> bool {
        self.garbage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::software::SoftwareDevice;
    use crate::renderer::serial::{QueueSerial, Serial, SerialIndex};
    use ash::vk::{self, Handle};

    fn semaphore(raw: u64) -> DeviceObject {
        DeviceObject::Semaphore(vk::Semaphore::from_raw(raw))
    }

    fn usage(serial: u64) -> ResourceUse {
        ResourceUse::from_queue_serial(QueueSerial::new(SerialIndex::new(0), Serial::new(serial)))
    }

    #[test]
    fn test_cleanup_stops_at_first_incomplete() {
        let device = SoftwareDevice::immediate();
        let completed = AtomicQueueSerialArray::new(1);
        let mut list = GarbageList::default();

        list.add(SharedGarbage::new(usage(1), vec![semaphore(10), semaphore(11)]));
        list.add(SharedGarbage::new(usage(2), vec![semaphore(12)]));
        assert_eq!(list.pending_object_count(), 3);

        assert_eq!(list.cleanup(&device, &completed), 0);

        completed.advance(QueueSerial::new(SerialIndex::new(0), Serial::new(1)));
        assert_eq!(list.cleanup(&device, &completed), 2);
        assert_eq!(list.pending_object_count(), 1);
        assert_eq!(device.stats().objects_destroyed, 2);

        assert_eq!(list.destroy_all(&device), 1);
        assert!(list.is_empty());
    }
}
