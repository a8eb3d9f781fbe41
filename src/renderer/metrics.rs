//! 性能统计模块
//!
//! QueuePerfCounters 记录提交相关的调用次数，分为累计值和本帧值。

/// 队列性能计数器
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePerfCounters {
    /// `submit_commands` 调用次数（累计）
    pub command_queue_submit_calls_total: u64,
    /// `submit_commands` 调用次数（本帧）
    pub command_queue_submit_calls_per_frame: u64,
    /// 提交时等待的信号量数量（累计）
    pub command_queue_wait_semaphores_total: u64,
    /// 实际调用设备提交的次数（累计）
    pub vk_queue_submit_calls_total: u64,
    /// 实际调用设备提交的次数（本帧）
    pub vk_queue_submit_calls_per_frame: u64,
}

impl QueuePerfCounters {
    /// 记录一次批次提交
    pub fn record_submit(&mut self, wait_semaphore_count: usize) {
        self.command_queue_submit_calls_total += 1;
        self.command_queue_submit_calls_per_frame += 1;
        self.command_queue_wait_semaphores_total += wait_semaphore_count as u64;
    }

    /// 记录一次设备提交调用
    pub fn record_device_submit(&mut self) {
        self.vk_queue_submit_calls_total += 1;
        self.vk_queue_submit_calls_per_frame += 1;
    }

    /// 清零本帧计数
    pub fn reset_per_frame(&mut self) {
        self.command_queue_submit_calls_per_frame = 0;
        self.vk_queue_submit_calls_per_frame = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_frame_reset_keeps_totals() {
        let mut counters = QueuePerfCounters::default();
        counters.record_submit(2);
        counters.record_device_submit();
        counters.record_submit(0);

        assert_eq!(counters.command_queue_submit_calls_per_frame, 2);
        assert_eq!(counters.command_queue_wait_semaphores_total, 2);

        counters.reset_per_frame();
        assert_eq!(counters.command_queue_submit_calls_per_frame, 0);
        assert_eq!(counters.vk_queue_submit_calls_per_frame, 0);
        assert_eq!(counters.command_queue_submit_calls_total, 2);
        assert_eq!(counters.vk_queue_submit_calls_total, 1);
    }
}
