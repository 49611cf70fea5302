pub mod dest;
pub mod events;
pub mod graph;
pub mod pipeline;
pub mod runner;
pub mod sourcemap;
pub mod stages;

use crate::profile::EnvironmentProfile;
use chrono::{DateTime, Local};
use stages::{StageId, StageReport};
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded(StageReport),
    Failed(String),
}

/// 一次完整构建的结果
#[derive(Debug, Clone)]
pub struct BuildRun {
    pub id: Ulid,
    pub profile: EnvironmentProfile,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub stage_results: BTreeMap<StageId, StageOutcome>,
}

impl BuildRun {
    pub fn failures(&self) -> impl Iterator<Item = (StageId, &str)> {
        self.stage_results.iter().filter_map(|(id, outcome)| match outcome {
            StageOutcome::Failed(message) => Some((*id, message.as_str())),
            _ => None,
        })
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn artifacts(&self) -> usize {
        self.stage_results
            .values()
            .map(|outcome| match outcome {
                StageOutcome::Succeeded(report) => report.artifacts,
                _ => 0,
            })
            .sum()
    }

    /// 有阶段失败时输出警告，部分产物仍然保留
    pub fn log_summary(&self) {
        for (stage, message) in self.failures() {
            tracing::warn!(%stage, "{message}");
        }
        let failed = self.failed_count();
        if failed == 0 {
            tracing::info!(
                "构建完成 [{}]，耗时 {:.2}s（共 {} 个文件）",
                self.profile.name,
                self.elapsed.as_secs_f64(),
                self.artifacts(),
            );
        } else {
            tracing::warn!(
                "构建完成 [{}]，但有 {failed} 个阶段失败，耗时 {:.2}s（输出不完整）",
                self.profile.name,
                self.elapsed.as_secs_f64(),
            );
        }
    }
}
