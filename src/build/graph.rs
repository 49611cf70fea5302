use crate::build::stages::StageId;
use crate::error::PipelineError;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::task::JoinSet;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send>>;
type TaskAction = Box<dyn FnOnce() -> TaskFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Clean,
    Recreate,
    Stage(StageId),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Recreate => f.write_str("recreate"),
            Self::Stage(stage) => write!(f, "{stage}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Clean,
    Recreate,
    Transform,
}

impl TaskKind {
    /// 清理/重建失败后目标目录状态不可信，整个运行必须中止
    fn is_fatal(self) -> bool {
        !matches!(self, Self::Transform)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Succeeded,
    Failed(String),
    /// 依赖节点未成功，未执行
    Skipped,
}

pub struct TaskNode {
    pub id: TaskId,
    pub kind: TaskKind,
    pub depends_on: Vec<TaskId>,
    action: TaskAction,
}

impl TaskNode {
    pub fn new<F, Fut>(
        id: TaskId,
        kind: TaskKind,
        depends_on: impl IntoIterator<Item = TaskId>,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        Self {
            id,
            kind,
            depends_on: depends_on.into_iter().collect(),
            action: Box::new(move || Box::pin(action())),
        }
    }
}

/// 任务图执行器：依赖全部成功的节点并发执行，节点完成后重新计算可执行集合
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self, PipelineError> {
        validate(&nodes)?;
        Ok(Self { nodes })
    }

    /// 执行全部节点，返回每个节点的结果
    ///
    /// 转换节点失败只记录结果；清理/重建节点失败时不再启动新节点，
    /// 等待已启动的节点结束后返回该错误
    pub async fn run(self) -> Result<BTreeMap<TaskId, NodeOutcome>, PipelineError> {
        let mut pending: HashMap<TaskId, TaskNode> =
            self.nodes.into_iter().map(|n| (n.id, n)).collect();
        let mut outcomes: BTreeMap<TaskId, NodeOutcome> = BTreeMap::new();
        let mut running: JoinSet<(TaskId, TaskKind, Result<(), PipelineError>)> = JoinSet::new();
        let mut abort: Option<PipelineError> = None;

        loop {
            if abort.is_none() {
                skip_unreachable(&mut pending, &mut outcomes);

                let mut ready: Vec<TaskId> = pending
                    .values()
                    .filter(|n| {
                        n.depends_on
                            .iter()
                            .all(|d| outcomes.get(d) == Some(&NodeOutcome::Succeeded))
                    })
                    .map(|n| n.id)
                    .collect();
                ready.sort();

                for id in ready {
                    let Some(node) = pending.remove(&id) else {
                        continue;
                    };
                    let kind = node.kind;
                    let fut = (node.action)();
                    tracing::debug!("启动任务：{id}");
                    running.spawn(async move { (id, kind, fut.await) });
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, kind, result) = joined?;

            match result {
                Ok(()) => {
                    outcomes.insert(id, NodeOutcome::Succeeded);
                }
                Err(e) if kind.is_fatal() => {
                    tracing::error!("任务 {id} 失败，中止本次构建：{e}");
                    outcomes.insert(id, NodeOutcome::Failed(e.to_string()));
                    abort.get_or_insert(e);
                }
                Err(e) => {
                    outcomes.insert(id, NodeOutcome::Failed(e.to_string()));
                }
            }
        }

        if let Some(e) = abort {
            return Err(e);
        }

        for id in pending.into_keys() {
            outcomes.insert(id, NodeOutcome::Skipped);
        }
        Ok(outcomes)
    }
}

/// 依赖失败或被跳过的节点标记为跳过，逐层传播
fn skip_unreachable(
    pending: &mut HashMap<TaskId, TaskNode>,
    outcomes: &mut BTreeMap<TaskId, NodeOutcome>,
) {
    loop {
        let blocked: Vec<TaskId> = pending
            .values()
            .filter(|n| {
                n.depends_on.iter().any(|d| {
                    matches!(
                        outcomes.get(d),
                        Some(NodeOutcome::Failed(_) | NodeOutcome::Skipped)
                    )
                })
            })
            .map(|n| n.id)
            .collect();
        if blocked.is_empty() {
            return;
        }
        for id in blocked {
            pending.remove(&id);
            outcomes.insert(id, NodeOutcome::Skipped);
        }
    }
}

/// 检查重复节点、未知依赖和循环依赖（Kahn 算法）
fn validate(nodes: &[TaskNode]) -> Result<(), PipelineError> {
    let mut ids = HashSet::new();
    for node in nodes {
        if !ids.insert(node.id) {
            return Err(PipelineError::InvalidGraph(format!("重复的任务：{}", node.id)));
        }
    }

    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
    let mut adj: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for node in nodes {
        in_degree.entry(node.id).or_insert(0);
        for dep in &node.depends_on {
            if !ids.contains(dep) {
                return Err(PipelineError::InvalidGraph(format!(
                    "任务 {} 依赖不存在的任务 {dep}",
                    node.id
                )));
            }
            adj.entry(*dep).or_default().push(node.id);
            *in_degree.entry(node.id).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<TaskId> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in adj.get(&id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited != nodes.len() {
        return Err(PipelineError::InvalidGraph("任务依赖存在循环".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording_node(
        id: TaskId,
        kind: TaskKind,
        deps: Vec<TaskId>,
        log: Arc<Mutex<Vec<String>>>,
    ) -> TaskNode {
        TaskNode::new(id, kind, deps, move || async move {
            log.lock().unwrap().push(format!("start {id}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            log.lock().unwrap().push(format!("end {id}"));
            Ok(())
        })
    }

    fn pipeline_shape(
        log: Arc<Mutex<Vec<String>>>,
        stage: impl Fn(StageId) -> TaskNode,
    ) -> Vec<TaskNode> {
        let mut nodes = vec![
            recording_node(TaskId::Clean, TaskKind::Clean, vec![], log.clone()),
            recording_node(TaskId::Recreate, TaskKind::Recreate, vec![TaskId::Clean], log),
        ];
        nodes.extend(StageId::ALL.into_iter().map(stage));
        nodes
    }

    #[tokio::test]
    async fn runs_clean_then_recreate_then_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage_log = log.clone();
        let nodes = pipeline_shape(log.clone(), move |s| {
            recording_node(
                TaskId::Stage(s),
                TaskKind::Transform,
                vec![TaskId::Recreate],
                stage_log.clone(),
            )
        });

        let outcomes = TaskGraph::new(nodes).unwrap().run().await.unwrap();
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.values().all(|o| *o == NodeOutcome::Succeeded));

        let log = log.lock().unwrap();
        assert_eq!(&log[..4], ["start clean", "end clean", "start recreate", "end recreate"]);
        assert_eq!(log.len(), 16);
    }

    #[tokio::test]
    async fn stages_run_concurrently() {
        let barrier = Arc::new(tokio::sync::Barrier::new(StageId::ALL.len()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let nodes = pipeline_shape(log, move |s| {
            let barrier = barrier.clone();
            TaskNode::new(TaskId::Stage(s), TaskKind::Transform, [TaskId::Recreate], move || async move {
                // 只有六个阶段同时在执行时才能越过屏障
                barrier.wait().await;
                Ok(())
            })
        });

        let outcomes = tokio::time::timeout(Duration::from_secs(5), TaskGraph::new(nodes).unwrap().run())
            .await
            .expect("stages were serialized")
            .unwrap();
        assert!(outcomes.values().all(|o| *o == NodeOutcome::Succeeded));
    }

    #[tokio::test]
    async fn failed_stage_does_not_stop_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let nodes = pipeline_shape(log, |s| {
            TaskNode::new(TaskId::Stage(s), TaskKind::Transform, [TaskId::Recreate], move || async move {
                if s == StageId::Templates {
                    return Err(PipelineError::Stage {
                        stage: s.to_string(),
                        message: "语法错误".into(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
        });

        let outcomes = TaskGraph::new(nodes).unwrap().run().await.unwrap();
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, NodeOutcome::Failed(_)))
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(failed, vec![TaskId::Stage(StageId::Templates)]);
        assert_eq!(
            outcomes.values().filter(|o| **o == NodeOutcome::Succeeded).count(),
            7
        );
    }

    #[tokio::test]
    async fn fatal_failure_aborts_before_stages() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut nodes = vec![
            TaskNode::new(TaskId::Clean, TaskKind::Clean, [], || async {
                Err(PipelineError::filesystem(
                    "删除目录",
                    "build/test",
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ))
            }),
            TaskNode::new(TaskId::Recreate, TaskKind::Recreate, [TaskId::Clean], || async { Ok(()) }),
        ];
        for s in StageId::ALL {
            let started = started.clone();
            nodes.push(TaskNode::new(TaskId::Stage(s), TaskKind::Transform, [TaskId::Recreate], move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let err = TaskGraph::new(nodes).unwrap().run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Filesystem { .. }));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejects_cycles_and_unknown_dependencies() {
        let cyclic = vec![
            TaskNode::new(TaskId::Clean, TaskKind::Clean, [TaskId::Recreate], || async { Ok(()) }),
            TaskNode::new(TaskId::Recreate, TaskKind::Recreate, [TaskId::Clean], || async { Ok(()) }),
        ];
        assert!(matches!(TaskGraph::new(cyclic), Err(PipelineError::InvalidGraph(_))));

        let dangling = vec![TaskNode::new(
            TaskId::Recreate,
            TaskKind::Recreate,
            [TaskId::Clean],
            || async { Ok(()) },
        )];
        assert!(matches!(TaskGraph::new(dangling), Err(PipelineError::InvalidGraph(_))));
    }
}
