use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod build;
mod config;
mod dev;
mod error;
mod profile;

use build::pipeline::Pipeline;
use build::runner::Runner;
use profile::ProfileName;

#[derive(Parser)]
#[command(name = "kiln", about = "静态站点资源构建管道", version = long_version())]
struct Cli {
    /// 项目根目录（默认当前目录）
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 清空整个构建目录
    #[command(alias = "clean")]
    Clear,

    /// 构建 stable 环境（默认命令）
    #[command(aliases = ["release", "stable"])]
    Build,

    /// 构建 beta 环境（带 source map）
    Beta,

    /// 构建 alpha 环境（带 source map）
    Alpha,

    /// 构建 test 环境（带 source map）
    Test,

    /// 按名称构建任意环境
    Run {
        /// 环境名：stable、beta、alpha、test
        profile: String,
    },

    /// 开发模式：构建 stable 并监听变更
    #[command(name = "dev_stable", aliases = ["dev_build", "dev_release"])]
    DevStable,

    /// 开发模式：beta
    #[command(name = "dev_beta")]
    DevBeta,

    /// 开发模式：alpha
    #[command(name = "dev_alpha")]
    DevAlpha,

    /// 开发模式：test
    #[command(name = "dev_test")]
    DevTest,
}

enum Task {
    Clear,
    Build(String),
    Dev(ProfileName),
}

impl From<Commands> for Task {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Clear => Self::Clear,
            Commands::Build => Self::Build(ProfileName::Stable.to_string()),
            Commands::Beta => Self::Build(ProfileName::Beta.to_string()),
            Commands::Alpha => Self::Build(ProfileName::Alpha.to_string()),
            Commands::Test => Self::Build(ProfileName::Test.to_string()),
            Commands::Run { profile } => Self::Build(profile),
            Commands::DevStable => Self::Dev(ProfileName::Stable),
            Commands::DevBeta => Self::Dev(ProfileName::Beta),
            Commands::DevAlpha => Self::Dev(ProfileName::Alpha),
            Commands::DevTest => Self::Dev(ProfileName::Test),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = cli.root.canonicalize().unwrap_or_else(|_| cli.root.clone());

    // 配置中的日志级别作为默认值，RUST_LOG 优先
    let site_config = config::SiteConfig::load(&root);
    let default_level = site_config
        .as_ref()
        .map(|c| c.server.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&default_level)),
        )
        .init();

    let site_config = site_config?;
    let task = Task::from(cli.command.unwrap_or(Commands::Build));
    let runner = Runner::new(Pipeline::new(&root, &site_config));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match task {
                Task::Clear => runner.clean_all().await?,
                Task::Build(name) => {
                    runner.run(&name).await?;
                }
                Task::Dev(name) => {
                    let profile = runner.registry().profile(name);
                    dev::run(runner, profile, &site_config).await?;
                }
            }
            anyhow::Ok(())
        })
}

const fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        "\ncommit:  ",
        env!("KILN_GIT_COMMIT"),
        "\nbuild:   ",
        env!("KILN_BUILD_TIME"),
        "\ntarget:  ",
        env!("KILN_BUILD_TARGET"),
        "\nprofile: ",
        env!("KILN_BUILD_PROFILE"),
    )
}
