use serde::Serialize;

/// 构建进度事件（通过 WebSocket 推送到开发页面）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    Started {
        profile: String,
        run_id: String,
    },
    StageBegin {
        stage: String,
    },
    StageEnd {
        stage: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Finished {
        total_ms: u64,
        failed: usize,
    },
    Failed {
        error: String,
    },
    /// 通知所有已连接的页面刷新
    Reload,
}
