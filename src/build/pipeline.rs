use crate::build::dest;
use crate::build::events::BuildEvent;
use crate::build::graph::{NodeOutcome, TaskGraph, TaskId, TaskKind, TaskNode};
use crate::build::stages::{self, CancelFlag, StageContext, StageId, StageReport};
use crate::build::{BuildRun, StageOutcome};
use crate::config::{FaviconConfig, SiteConfig, StylesConfig};
use crate::error::PipelineError;
use crate::profile::{EnvironmentProfile, ProfileRegistry};
use chrono::Local;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use ulid::Ulid;

type ReportSlot = Arc<Mutex<BTreeMap<StageId, StageReport>>>;

/// 构建管道：clean → recreate → 六个转换阶段并行
pub struct Pipeline {
    source: PathBuf,
    build_root: PathBuf,
    styles: StylesConfig,
    favicon: FaviconConfig,
    stage_timeout: Option<Duration>,
    events: broadcast::Sender<BuildEvent>,
}

impl Pipeline {
    pub fn new(project_root: &Path, config: &SiteConfig) -> Self {
        let mut styles = config.styles.clone();
        styles.include_paths = styles
            .include_paths
            .iter()
            .map(|p| project_root.join(p))
            .collect();

        let (events, _) = broadcast::channel::<BuildEvent>(64);

        Self {
            source: config.source_dir(project_root),
            build_root: config.build_root(project_root),
            styles,
            favicon: config.favicon.clone(),
            stage_timeout: config.stage_timeout(),
            events,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn registry(&self) -> ProfileRegistry {
        ProfileRegistry::new(self.build_root.clone())
    }

    pub fn events(&self) -> broadcast::Sender<BuildEvent> {
        self.events.clone()
    }

    /// 执行一次完整构建；阶段失败记录在结果中，清理/创建目录失败则返回错误
    pub async fn build(&self, profile: &EnvironmentProfile) -> Result<BuildRun, PipelineError> {
        let id = Ulid::new();
        let started_at = Local::now();
        let start = Instant::now();
        tracing::info!(
            "开始构建 [{}] → {}",
            profile.name,
            profile.destination.display()
        );
        let _ = self.events.send(BuildEvent::Started {
            profile: profile.name.to_string(),
            run_id: id.to_string(),
        });

        let ctx = Arc::new(StageContext {
            source: self.source.clone(),
            destination: profile.destination.clone(),
            profile: profile.name,
            debug: profile.debug,
            started_at,
            styles: self.styles.clone(),
            favicon: self.favicon.clone(),
            cancel: CancelFlag::default(),
        });
        let reports: ReportSlot = Arc::default();

        let result = match TaskGraph::new(self.nodes(profile, &ctx, &reports)) {
            Ok(graph) => graph.run().await,
            Err(e) => Err(e),
        };
        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                tracing::error!("构建 [{}] 失败：{e}", profile.name);
                let _ = self.events.send(BuildEvent::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut reports = std::mem::take(&mut *reports.lock().unwrap_or_else(|e| e.into_inner()));
        let stage_results = outcomes
            .into_iter()
            .filter_map(|(task, outcome)| {
                let TaskId::Stage(stage) = task else {
                    return None;
                };
                let outcome = match outcome {
                    NodeOutcome::Succeeded => {
                        StageOutcome::Succeeded(reports.remove(&stage).unwrap_or_default())
                    }
                    NodeOutcome::Failed(message) => StageOutcome::Failed(message),
                    NodeOutcome::Skipped => StageOutcome::Failed("依赖任务未完成，未执行".into()),
                };
                Some((stage, outcome))
            })
            .collect();

        let run = BuildRun {
            id,
            profile: profile.clone(),
            started_at,
            elapsed: start.elapsed(),
            stage_results,
        };
        run.log_summary();
        let _ = self.events.send(BuildEvent::Finished {
            total_ms: run.elapsed.as_millis() as u64,
            failed: run.failed_count(),
        });
        Ok(run)
    }

    fn nodes(
        &self,
        profile: &EnvironmentProfile,
        ctx: &Arc<StageContext>,
        reports: &ReportSlot,
    ) -> Vec<TaskNode> {
        let mut nodes = Vec::with_capacity(2 + StageId::ALL.len());

        let target = profile.clone();
        nodes.push(TaskNode::new(TaskId::Clean, TaskKind::Clean, [], move || async move {
            dest::clean_destination(&target).await
        }));

        let target = profile.clone();
        let build_root = self.build_root.clone();
        nodes.push(TaskNode::new(
            TaskId::Recreate,
            TaskKind::Recreate,
            [TaskId::Clean],
            move || async move { dest::ensure_directories(&build_root, &target).await },
        ));

        for stage in StageId::ALL {
            let ctx = Arc::clone(ctx);
            let reports = Arc::clone(reports);
            let events = self.events.clone();
            let timeout = self.stage_timeout;
            nodes.push(TaskNode::new(
                TaskId::Stage(stage),
                TaskKind::Transform,
                [TaskId::Recreate],
                move || run_stage_task(stage, ctx, reports, events, timeout),
            ));
        }
        nodes
    }
}

async fn run_stage_task(
    stage: StageId,
    ctx: Arc<StageContext>,
    reports: ReportSlot,
    events: broadcast::Sender<BuildEvent>,
    timeout: Option<Duration>,
) -> Result<(), PipelineError> {
    let _ = events.send(BuildEvent::StageBegin {
        stage: stage.to_string(),
    });
    tracing::debug!("阶段 {stage} 开始");

    // 每个阶段单独的取消标记，超时只取消自己
    let stage_ctx = StageContext {
        cancel: CancelFlag::default(),
        ..(*ctx).clone()
    };
    let cancel = stage_ctx.cancel.clone();
    let mut work = tokio::task::spawn_blocking(move || stages::run_stage(stage, &stage_ctx));
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut work).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("阶段 {stage} 超时，等待其停止写入");
                cancel.cancel();
                // 阻塞任务返回前本阶段不结束，目标目录在此之前不会被释放
                let _ = work.await;
                return stage_failed(stage, &events, format!("超过 {:?} 未完成", limit));
            }
        },
        None => work.await,
    };

    match joined {
        Ok(Ok(report)) => {
            tracing::debug!("阶段 {stage} 完成（{} 个文件）", report.artifacts);
            let _ = events.send(BuildEvent::StageEnd {
                stage: stage.to_string(),
                ok: true,
                error: None,
            });
            reports
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(stage, report);
            Ok(())
        }
        Ok(Err(e)) => stage_failed(stage, &events, format!("{e:#}")),
        Err(e) => stage_failed(stage, &events, format!("任务执行异常: {e}")),
    }
}

fn stage_failed(
    stage: StageId,
    events: &broadcast::Sender<BuildEvent>,
    message: String,
) -> Result<(), PipelineError> {
    let _ = events.send(BuildEvent::StageEnd {
        stage: stage.to_string(),
        ok: false,
        error: Some(message.clone()),
    });
    Err(PipelineError::Stage {
        stage: stage.to_string(),
        message,
    })
}
