// 上传任务定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 排队中
    Queued,
    /// 上传中
    Uploading,
    /// 已完成
    Done,
    /// 失败
    Error,
    /// 已取消
    Canceled,
}

impl UploadTaskStatus {
    /// 是否为终态（完成、失败、取消）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    /// 是否仍有待完成的工作（排队或上传中）
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Uploading)
    }

    /// 是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Canceled)
    }

    /// 状态迁移表
    ///
    /// - queued -> uploading / error（内容缺失）/ canceled
    /// - uploading -> done / error / canceled
    /// - error / canceled -> queued（仅显式重试）
    /// - error -> canceled（全部取消）
    /// - done 没有出边
    pub fn can_transition_to(&self, next: UploadTaskStatus) -> bool {
        use UploadTaskStatus::*;
        matches!(
            (self, next),
            (Queued, Uploading)
                | (Queued, Error)
                | (Queued, Canceled)
                | (Uploading, Done)
                | (Uploading, Error)
                | (Uploading, Canceled)
                | (Error, Queued)
                | (Canceled, Queued)
                | (Error, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for UploadTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态通道的更新载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: UploadTaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: UploadTaskStatus) -> Self {
        Self {
            status,
            progress: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: UploadTaskStatus::Error,
            progress: None,
            error: Some(message.into()),
        }
    }

    pub fn done() -> Self {
        Self {
            status: UploadTaskStatus::Done,
            progress: Some(1.0),
            error: None,
        }
    }

    /// 重试时重新入队，进度归零
    pub fn requeued() -> Self {
        Self {
            status: UploadTaskStatus::Queued,
            progress: Some(0.0),
            error: None,
        }
    }

    /// 合并同一 key 的两次更新：以较新的为准，较新的未携带进度时沿用旧进度
    pub fn merge(&mut self, newer: StatusUpdate) {
        let carried = self.progress;
        *self = newer;
        if self.progress.is_none() {
            self.progress = carried;
        }
    }
}

/// 上传任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    /// 最终目标对象键
    pub key: String,
    /// 显示名称（原始相对路径）
    pub name: String,
    /// 文件大小（仅展示用）
    pub size: u64,
    /// 进度 [0, 1]
    pub progress: f64,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 错误信息，仅在 error 状态下存在
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadTask {
    /// 创建排队中的任务
    pub fn new(key: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            size,
            progress: 0.0,
            status: UploadTaskStatus::Queued,
            error: None,
        }
    }

    /// 应用一次状态更新
    ///
    /// 已完成的任务不会再被改回其他状态
    pub fn apply_status(&mut self, update: &StatusUpdate) {
        if self.status == UploadTaskStatus::Done && update.status != UploadTaskStatus::Done {
            return;
        }

        self.status = update.status;
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 1.0);
        }
        match update.status {
            UploadTaskStatus::Done => {
                self.progress = 1.0;
                self.error = None;
            }
            UploadTaskStatus::Error => {
                self.error = Some(update.error.clone().unwrap_or_else(|| "upload failed".to_string()));
            }
            _ => {
                self.error = None;
            }
        }
    }

    /// 应用一次进度更新，只在上传中生效且只增不减
    pub fn apply_progress(&mut self, progress: f64) {
        if self.status != UploadTaskStatus::Uploading {
            return;
        }
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == UploadTaskStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UploadTaskStatus::*;

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Canceled).unwrap(), "\"canceled\"");
        let status: UploadTaskStatus = serde_json::from_str("\"uploading\"").unwrap();
        assert_eq!(status, Uploading);
        assert_eq!(Done.to_string(), "done");
    }

    #[test]
    fn test_transition_table() {
        let all = [Queued, Uploading, Done, Error, Canceled];

        // done 没有出边
        for next in all {
            assert!(!Done.can_transition_to(next));
        }
        // 只有失败和取消能回到排队
        for from in all {
            assert_eq!(from.can_transition_to(Queued), from.is_retryable());
        }
        assert!(Queued.can_transition_to(Error));
        assert!(Error.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Error));
        assert!(!Queued.can_transition_to(Done));
    }

    #[test]
    fn test_status_merge_carries_progress() {
        let mut pending = StatusUpdate {
            status: Uploading,
            progress: Some(0.4),
            error: None,
        };
        pending.merge(StatusUpdate::failed("boom"));

        assert_eq!(pending.status, Error);
        assert_eq!(pending.progress, Some(0.4));
        assert_eq!(pending.error.as_deref(), Some("boom"));

        pending.merge(StatusUpdate::requeued());
        assert_eq!(pending.progress, Some(0.0));
        assert!(pending.error.is_none());
    }

    #[test]
    fn test_done_is_sticky() {
        let mut task = UploadTask::new("a.txt", "a.txt", 3);
        task.apply_status(&StatusUpdate::new(Uploading));
        task.apply_progress(0.5);
        task.apply_status(&StatusUpdate::done());
        assert_eq!(task.progress, 1.0);

        task.apply_status(&StatusUpdate::new(Canceled));
        task.apply_status(&StatusUpdate::requeued());
        assert!(task.is_done());
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_progress_monotonic_and_only_while_uploading() {
        let mut task = UploadTask::new("a.txt", "a.txt", 3);
        task.apply_progress(0.5);
        assert_eq!(task.progress, 0.0);

        task.apply_status(&StatusUpdate::new(Uploading));
        task.apply_progress(0.6);
        task.apply_progress(0.3);
        assert_eq!(task.progress, 0.6);
        task.apply_progress(7.0);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_error_only_in_error_state() {
        let mut task = UploadTask::new("a.txt", "a.txt", 3);
        task.apply_status(&StatusUpdate::failed("content missing"));
        assert_eq!(task.error.as_deref(), Some("content missing"));

        task.apply_status(&StatusUpdate::requeued());
        assert_eq!(task.status, Queued);
        assert!(task.error.is_none());
        assert_eq!(task.progress, 0.0);
    }
}
