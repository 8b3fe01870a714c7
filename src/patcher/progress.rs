use crate::utils::EspError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 补丁生成过程中的进度事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PatchEvent {
    Started { files: usize },
    FileStarted { index: usize, name: String },
    FileMerged { index: usize, name: String, records: usize },
    FileSkipped { index: usize, name: String, reason: String },
    Emitting { objects: usize },
    Finished { changed: usize, conflicts: usize },
}

/// 进度接收方
pub trait ProgressSink: Sync {
    fn event(&self, event: &PatchEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&PatchEvent) + Sync,
{
    fn event(&self, event: &PatchEvent) {
        self(event)
    }
}

/// 不关心进度
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: &PatchEvent) {}
}

/// 协作式取消标志，在文件边界检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 已取消时返回 `EspError::Cancelled`
    pub fn check(&self) -> Result<(), EspError> {
        if self.is_cancelled() {
            Err(EspError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(EspError::Cancelled)));
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: &PatchEvent| seen.lock().unwrap().push(event.clone());
        sink.event(&PatchEvent::Started { files: 2 });
        NoProgress.event(&PatchEvent::Started { files: 1 });
        assert_eq!(seen.lock().unwrap().as_slice(), &[PatchEvent::Started { files: 2 }]);
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_string(&PatchEvent::Finished { changed: 3, conflicts: 1 }).unwrap();
        assert_eq!(json, r#"{"event":"finished","changed":3,"conflicts":1}"#);
    }
}
