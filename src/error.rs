// 上传队列错误定义
//
// 错误分类：
// - 输入/配置错误：入队时同步拒绝，不进入队列
// - 授权错误：无法获取上传句柄，立即失败，不重试
// - 传输/合并错误：按重试策略重试，预算耗尽后永久失败
// - 取消：不是错误，是独立的终态

use thiserror::Error;

/// 上传队列错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 入队参数非法（空文件、缺少会话ID等）
    #[error("参数非法: {0}")]
    InvalidInput(String),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 任务当前状态不支持该操作
    #[error("任务 {task_id} 当前状态 {status} 不支持{action}")]
    InvalidState {
        task_id: String,
        status: String,
        action: &'static str,
    },

    /// 获取上传授权失败
    #[error("获取上传授权失败: {0}")]
    Authorization(String),

    /// 分片传输失败
    #[error("分片 #{part_number} 上传失败: {message}")]
    Transport { part_number: u32, message: String },

    /// 合并分片失败
    #[error("合并分片失败: {0}")]
    Finalize(String),

    /// 读取文件内容失败
    #[error("读取文件失败: {0}")]
    Source(String),

    /// 已取消
    #[error("上传已取消")]
    Cancelled,

    /// 配置非法
    #[error("配置非法: {0}")]
    InvalidConfig(String),
}

impl UploadError {
    /// 是否可重试
    ///
    /// 只有传输失败和合并失败会交给重试策略，其余错误立即终止
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::Transport { .. } | UploadError::Finalize(_))
    }
}

/// 上传队列结果类型
pub type Result<T> = std::result::Result<T, UploadError>;
