// 等待队列
//
// 按 (优先级, 序号) 升序出队：优先级越小越先调度，同优先级先进先出。
// 重试任务以最高优先级插到队首，多个重试任务之间后插入的先出队

use super::task::QueuedTask;
use std::collections::BTreeMap;

type BacklogKey = (i64, i64);

/// 优先级等待队列
#[derive(Debug, Default)]
pub struct Backlog {
    entries: BTreeMap<BacklogKey, QueuedTask>,
    next_seq: i64,
    next_front_seq: i64,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按任务优先级入队
    pub fn push(&mut self, task: QueuedTask) {
        self.next_seq += 1;
        self.entries.insert((task.priority, self.next_seq), task);
    }

    /// 插到队首（重试任务）
    pub fn push_front(&mut self, task: QueuedTask) {
        self.next_front_seq -= 1;
        self.entries.insert((i64::MIN, self.next_front_seq), task);
    }

    /// 取出优先级最高的任务
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.entries.pop_first().map(|(_, task)| task)
    }

    /// 按任务 ID 移除
    pub fn remove(&mut self, task_id: &str) -> Option<QueuedTask> {
        let key = self
            .entries
            .iter()
            .find(|(_, task)| task.id == task_id)
            .map(|(key, _)| *key)?;
        self.entries.remove(&key)
    }

    pub fn get(&self, task_id: &str) -> Option<&QueuedTask> {
        self.entries.values().find(|task| task.id == task_id)
    }

    /// 按出队顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.entries.values()
    }

    /// 清空并按出队顺序返回所有任务
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
