pub mod server;
pub mod watch;

use crate::build::runner::Runner;
use crate::config::SiteConfig;
use crate::profile::EnvironmentProfile;
use server::LiveReload;
use std::future::IntoFuture;
use watch::ProfileRebuild;

/// 开发模式：首次构建 → 启动服务器 → 监听源码并在变更后重建、通知刷新
pub async fn run(runner: Runner, profile: EnvironmentProfile, config: &SiteConfig) -> anyhow::Result<()> {
    runner.run_profile(&profile).await?;

    let live = LiveReload::new(runner.pipeline().events());
    let app = server::router(&profile.destination, live.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!("端口 {} 已被占用", config.server.port);
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!("开发服务器启动：http://{addr}（{}）", profile.name);

    let (_watcher, changes) = watch::watch_sources(runner.pipeline().source())?;
    let rebuild = ProfileRebuild::new(runner, profile);

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        () = watch::run_loop(changes, rebuild, live, config.debounce()) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("收到中断信号，退出开发模式"),
    }
    Ok(())
}
