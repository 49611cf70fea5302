use crate::error::PipelineError;
use crate::profile::EnvironmentProfile;
use std::io::ErrorKind;
use std::path::Path;

/// 删除整个构建根目录（clear / clean 命令）
pub async fn clean_all(build_root: &Path) -> Result<(), PipelineError> {
    remove_tree(build_root).await?;
    tracing::info!("已清除构建根目录：{}", build_root.display());
    Ok(())
}

/// 只删除指定环境的输出目录，其他环境的产物不受影响
pub async fn clean_destination(profile: &EnvironmentProfile) -> Result<(), PipelineError> {
    remove_tree(&profile.destination).await?;
    tracing::debug!("已清除输出目录：{}", profile.destination.display());
    Ok(())
}

/// 确保构建根目录和环境输出目录存在，已存在时不报错
pub async fn ensure_directories(
    build_root: &Path,
    profile: &EnvironmentProfile,
) -> Result<(), PipelineError> {
    for dir in [build_root, profile.destination.as_path()] {
        if tokio::fs::try_exists(dir).await.unwrap_or(false) {
            continue;
        }
        match tokio::fs::create_dir(dir).await {
            Ok(()) => tracing::debug!("已创建目录：{}", dir.display()),
            // 检查与创建之间被其他进程抢先创建
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(PipelineError::filesystem("创建目录", dir, e)),
        }
    }
    Ok(())
}

async fn remove_tree(path: &Path) -> Result<(), PipelineError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::filesystem("删除目录", path, e)),
    }
}
