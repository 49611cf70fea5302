use crate::build::pipeline::Pipeline;
use crate::build::{dest, BuildRun};
use crate::error::PipelineError;
use crate::profile::{EnvironmentProfile, ProfileRegistry};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 按环境名选择并执行构建，同一目标目录同时只允许一次运行
#[derive(Clone)]
pub struct Runner {
    registry: ProfileRegistry,
    pipeline: Arc<Pipeline>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

/// 目标目录占用凭证，释放时解除占用
pub struct RunClaim {
    destination: PathBuf,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.destination);
    }
}

impl Runner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            registry: pipeline.registry(),
            pipeline: Arc::new(pipeline),
            in_flight: Arc::default(),
        }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub async fn run(&self, name: &str) -> Result<BuildRun, PipelineError> {
        let profile = self.registry.resolve(name)?;
        self.run_profile(&profile).await
    }

    pub async fn run_profile(&self, profile: &EnvironmentProfile) -> Result<BuildRun, PipelineError> {
        let _claim = self.claim(&profile.destination)?;
        self.pipeline.build(profile).await
    }

    /// 占用目标目录；已有运行在写同一目录或正在清空构建根目录时返回冲突错误
    pub fn claim(&self, destination: &Path) -> Result<RunClaim, PipelineError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let build_root = self.registry.build_root();
        if in_flight.contains(build_root) || !in_flight.insert(destination.to_path_buf()) {
            return Err(PipelineError::ConcurrentRunConflict(destination.to_path_buf()));
        }
        Ok(RunClaim {
            destination: destination.to_path_buf(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// 删除整个构建根目录；有运行进行中时拒绝
    pub async fn clean_all(&self) -> Result<(), PipelineError> {
        let build_root = self.registry.build_root().to_path_buf();
        let _claim = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(busy) = in_flight.iter().next() {
                return Err(PipelineError::ConcurrentRunConflict(busy.clone()));
            }
            in_flight.insert(build_root.clone());
            RunClaim {
                destination: build_root.clone(),
                in_flight: Arc::clone(&self.in_flight),
            }
        };
        dest::clean_all(&build_root).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::stages::{fixtures, StageId};
    use crate::build::StageOutcome;
    use crate::config::SiteConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn project(root: &Path) -> Runner {
        write_sources(root);
        Runner::new(Pipeline::new(root, &SiteConfig::default()))
    }

    fn write_sources(root: &Path) {
        fixtures::write(root, "src/copy/robots.txt", "User-agent: *\n");
        fixtures::write(root, "src/ejs/dict.json", r#"{"title": "Demo"}"#);
        fixtures::write(root, "src/ejs/page/index.ejs", "<h1>{{ title }}</h1>\n<p>{{ build.profile }}</p>");
        fixtures::write(root, "src/sass/main.scss", "$c: #ff0000;\nbody { color: $c; }\n");
        fixtures::write(root, "src/js/app.js", "// entry\nfunction add(a, b) {\n  return a + b;\n}\n");
        fixtures::write(root, "src/favicon.png", fixtures::png(64, 64));
        fixtures::write(root, "src/img/logo.png", fixtures::png(8, 8));
    }

    fn snapshot(dir: &Path) -> Vec<(String, u64)> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<(String, u64)> = entries
            .map(|e| {
                let e = e.unwrap();
                (e.file_name().to_string_lossy().into_owned(), e.metadata().unwrap().len())
            })
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn debug_profile_builds_everything_with_source_maps() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());

        let run = runner.run("test").await.unwrap();
        assert_eq!(run.failed_count(), 0);
        assert_eq!(run.stage_results.len(), StageId::ALL.len());

        let out = dir.path().join("build/test");
        for rel in [
            "robots.txt",
            "index.html",
            "css/main.min.css",
            "css/main.min.css.map",
            "js/app.min.js",
            "js/app.min.js.map",
            "favicon.ico",
            "img/logo.png",
        ] {
            assert!(out.join(rel).is_file(), "缺少 {rel}");
        }
        let js = std::fs::read_to_string(out.join("js/app.min.js")).unwrap();
        assert!(js.contains("sourceMappingURL=app.min.js.map"));
        let html = std::fs::read_to_string(out.join("index.html")).unwrap();
        assert!(html.contains("<h1>Demo</h1>"));
        assert!(html.contains("<p>test</p>"));
    }

    #[tokio::test]
    async fn stable_profile_omits_source_maps() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());

        let run = runner.run("stable").await.unwrap();
        assert_eq!(run.failed_count(), 0);

        let out = dir.path().join("build/stable");
        assert!(out.join("js/app.min.js").is_file());
        assert!(!out.join("js/app.min.js.map").exists());
        assert!(!out.join("css/main.min.css.map").exists());
        let js = std::fs::read_to_string(out.join("js/app.min.js")).unwrap();
        assert!(!js.contains("sourceMappingURL"));
    }

    #[tokio::test]
    async fn stale_outputs_are_removed_before_rebuilding() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());
        fixtures::write(dir.path(), "src/copy/old.txt", "old");

        runner.run("beta").await.unwrap();
        let out = dir.path().join("build/beta");
        assert!(out.join("old.txt").is_file());

        std::fs::remove_file(dir.path().join("src/copy/old.txt")).unwrap();
        runner.run("beta").await.unwrap();
        assert!(!out.join("old.txt").exists());
        assert!(out.join("robots.txt").is_file());
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());
        fixtures::write(dir.path(), "src/ejs/page/index.ejs", "{% if %}");

        let run = runner.run("alpha").await.unwrap();
        assert_eq!(run.failed_count(), 1);
        let failed: Vec<StageId> = run.failures().map(|(id, _)| id).collect();
        assert_eq!(failed, vec![StageId::Templates]);
        let succeeded = run
            .stage_results
            .values()
            .filter(|o| matches!(o, StageOutcome::Succeeded(_)))
            .count();
        assert_eq!(succeeded, 5);

        let out = dir.path().join("build/alpha");
        assert!(!out.join("index.html").exists());
        assert!(out.join("robots.txt").is_file());
        assert!(out.join("js/app.min.js").is_file());
        assert!(out.join("favicon.ico").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_stage_fails_and_stops_writing_before_run_returns() {
        let dir = tempfile::tempdir().unwrap();
        write_sources(dir.path());
        let big = fixtures::png(512, 512);
        for i in 0..24 {
            fixtures::write(dir.path(), &format!("src/img/big-{i:02}.png"), &big);
        }
        let mut config = SiteConfig::default();
        config.build.stage_timeout_secs = Some(0);
        let runner = Runner::new(Pipeline::new(dir.path(), &config));

        let run = runner.run("test").await.unwrap();
        assert_eq!(run.stage_results.len(), StageId::ALL.len());
        match &run.stage_results[&StageId::Images] {
            StageOutcome::Failed(message) => assert!(message.contains("未完成"), "{message}"),
            other => panic!("images 阶段应当超时失败：{other:?}"),
        }

        let dest = dir.path().join("build/test");
        let img = snapshot(&dest.join("img"));
        let root_files = snapshot(&dest);
        drop(runner.claim(&dest).unwrap());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(snapshot(&dest.join("img")), img);
        assert_eq!(snapshot(&dest), root_files);
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());

        let err = runner.run("nightly").await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownProfile(name) if name == "nightly"));
        assert!(!dir.path().join("build").exists());
    }

    #[tokio::test]
    async fn concurrent_run_on_same_destination_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());
        let profile = runner.registry().resolve("test").unwrap();

        let claim = runner.claim(&profile.destination).unwrap();
        let err = runner.run("test").await.unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrentRunConflict(_)));
        assert!(matches!(
            runner.clean_all().await,
            Err(PipelineError::ConcurrentRunConflict(_))
        ));

        // 其他环境不受影响
        runner.run("beta").await.unwrap();

        drop(claim);
        runner.run("test").await.unwrap();
    }

    #[tokio::test]
    async fn clean_all_removes_build_root() {
        let dir = tempfile::tempdir().unwrap();
        let runner = project(dir.path());
        runner.run("stable").await.unwrap();
        runner.run("test").await.unwrap();

        runner.clean_all().await.unwrap();
        assert!(!dir.path().join("build").exists());
        runner.clean_all().await.unwrap();
    }
}
