use std::path::PathBuf;
use thiserror::Error;

/// 构建图级别的错误：会中止当前运行并返回给调用方
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("未知的构建环境：{0}（可选：stable、beta、alpha、test）")]
    UnknownProfile(String),

    #[error("目标目录 {} 已有构建在执行", .0.display())]
    ConcurrentRunConflict(PathBuf),

    #[error("{action} {} 失败：{source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 单个转换阶段失败，只记录在阶段结果中，不会中止其他阶段
    #[error("阶段 {stage} 失败：{message}")]
    Stage { stage: String, message: String },

    #[error("任务执行异常：{0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("任务图无效：{0}")]
    InvalidGraph(String),

    #[error("文件监听失败：{0}")]
    Watch(#[from] notify::Error),
}

impl PipelineError {
    pub fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }
}
