use crate::build::BuildRun;
use crate::build::runner::Runner;
use crate::error::PipelineError;
use crate::profile::EnvironmentProfile;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;

/// 相对源码根目录的监听范围
const WATCH_GLOBS: &[&str] = &[
    "copy/**/*",
    "ejs/**/*.ejs",
    "ejs/**/*.json",
    "ejs/**/*.js",
    "img/**/*.png",
    "img/**/*.svg",
    "img/**/*.gif",
    "img/**/*.jpg",
    "img/**/*.jpeg",
    "js/**/*.js",
    "sass/**/*.sass",
    "sass/**/*.scss",
];

static WATCH_PATTERNS: LazyLock<Vec<glob::Pattern>> = LazyLock::new(|| {
    WATCH_GLOBS
        .iter()
        .map(|p| glob::Pattern::new(p).unwrap())
        .collect()
});

const MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

const CHANNEL_CAPACITY: usize = 64;

type InFlight<'a> = Pin<Box<dyn Future<Output = Result<BuildRun, PipelineError>> + Send + 'a>>;

/// 变更路径是否在监听范围内
pub fn is_watched(source_root: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(source_root) else {
        return false;
    };
    WATCH_PATTERNS
        .iter()
        .any(|p| p.matches_path_with(rel, MATCH_OPTIONS))
}

/// 持有底层 watcher，drop 后停止监听
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
}

/// 递归监听源码目录，把范围内的变更路径发送到返回的通道
pub fn watch_sources(source: &Path) -> Result<(SourceWatcher, mpsc::Receiver<PathBuf>), PipelineError> {
    let root = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let filter_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("文件监听出错：{e}");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        for path in event.paths {
            if is_watched(&filter_root, &path) {
                tracing::debug!("检测到变更：{}", path.display());
                // 通道已满说明已有重建排队，丢弃不影响结果
                let _ = tx.try_send(path);
            }
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    tracing::info!("正在监听 {} 的变更", root.display());

    Ok((SourceWatcher { _watcher: watcher }, rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    #[default]
    Idle,
    Building,
    /// 构建进行中又有新变更，结束后立即再构建一次
    AwaitingDebounce,
}

/// 监听-重建状态机，不涉及 IO
#[derive(Debug, Default)]
pub struct ReloadLoop {
    state: LoopState,
}

impl ReloadLoop {
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// 收到变更；返回 true 表示应立即开始构建
    pub fn on_change(&mut self) -> bool {
        match self.state {
            LoopState::Idle => {
                self.state = LoopState::Building;
                true
            }
            LoopState::Building | LoopState::AwaitingDebounce => {
                self.state = LoopState::AwaitingDebounce;
                false
            }
        }
    }

    /// 构建结束（无论阶段成败）；返回 true 表示有排队的重建需要开始
    pub fn on_build_settled(&mut self) -> bool {
        match self.state {
            LoopState::AwaitingDebounce => {
                self.state = LoopState::Building;
                true
            }
            LoopState::Building | LoopState::Idle => {
                self.state = LoopState::Idle;
                false
            }
        }
    }
}

pub trait Rebuild: Send + Sync {
    fn rebuild(&self) -> impl Future<Output = Result<BuildRun, PipelineError>> + Send;
}

pub trait ReloadSink: Send + Sync {
    fn notify_reload(&self);
}

/// 开发模式下固定环境的重建
pub struct ProfileRebuild {
    runner: Runner,
    profile: EnvironmentProfile,
}

impl ProfileRebuild {
    pub fn new(runner: Runner, profile: EnvironmentProfile) -> Self {
        Self { runner, profile }
    }
}

impl Rebuild for ProfileRebuild {
    fn rebuild(&self) -> impl Future<Output = Result<BuildRun, PipelineError>> + Send {
        self.runner.run_profile(&self.profile)
    }
}

/// 驱动监听循环：同一时间最多一次构建，构建期间的变更合并为一次后续构建。
/// 通道关闭且没有构建在执行时返回
pub async fn run_loop<R, S>(mut changes: mpsc::Receiver<PathBuf>, rebuilder: R, sink: S, debounce: Duration)
where
    R: Rebuild,
    S: ReloadSink,
{
    let mut machine = ReloadLoop::default();
    let mut in_flight: Option<InFlight<'_>> = None;
    let mut open = true;

    loop {
        if !open && in_flight.is_none() {
            break;
        }
        tokio::select! {
            biased;

            result = settle(&mut in_flight) => {
                in_flight = None;
                match result {
                    Ok(run) => {
                        tracing::debug!("重建 {} 结束", run.id);
                        sink.notify_reload();
                    }
                    Err(e) => tracing::error!("重建失败：{e}"),
                }
                if machine.on_build_settled() {
                    fold_pending(&mut changes, debounce).await;
                    in_flight = Some(Box::pin(rebuilder.rebuild()));
                }
            }

            change = changes.recv(), if open => {
                let Some(path) = change else {
                    open = false;
                    continue;
                };
                tracing::info!("文件变更：{}", path.display());
                let start = machine.on_change();
                tracing::debug!(state = ?machine.state(), "监听状态");
                if start {
                    fold_pending(&mut changes, debounce).await;
                    in_flight = Some(Box::pin(rebuilder.rebuild()));
                }
            }
        }
    }
    tracing::debug!("监听循环结束");
}

async fn settle<F: Future + Unpin>(build: &mut Option<F>) -> F::Output {
    match build {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

/// 等待一段静默期，期间到达的变更并入即将开始的构建
async fn fold_pending(changes: &mut mpsc::Receiver<PathBuf>, debounce: Duration) {
    tokio::time::sleep(debounce).await;
    let mut folded = 0;
    while changes.try_recv().is_ok() {
        folded += 1;
    }
    if folded > 0 {
        tracing::debug!("合并 {folded} 个变更到本次构建");
    }
}
