//! 事件模块
//!
//! - `types.rs`: 上传事件类型
//! - `bus.rs`: 全局广播、任务级回调与终态保护
//! - `throttle.rs`: 进度事件节流

mod bus;
mod throttle;
mod types;

pub use bus::*;
pub use throttle::*;
pub use types::*;
