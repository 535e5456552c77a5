// ==========================================
// 仓库出库释放系统 - 操作日志数据仓储
// ==========================================
// 红线: 释放/撤销/分配/通道状态变更必须记录
// 写入可在释放工作单元的检查点内完成 (insert_with)
// ==========================================

mod core;
mod queries;


pub use core::ActionLogRepository;
