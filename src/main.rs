use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fb_index::config::{DaemonConfig, ProjectConfig};
use fb_index::core::Project;
use fb_index::event::{EventPipeline, EventWatcher};
use fb_index::index::{FileBasedIndex, FileNameIndex, IdentifierIndex};
use fb_index::query::QueryServer;

#[derive(Parser, Debug)]
#[command(name = "fb-index", version, about = "Incremental file-based index daemon")]
struct Cli {
    /// TOML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的索引目录
    #[arg(long)]
    index_root: Option<PathBuf>,

    /// 追加一个项目（目录名即项目名），可重复
    #[arg(short, long = "root")]
    roots: Vec<PathBuf>,

    /// HTTP 查询端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 周期性状态日志间隔（秒，0 关闭）
    #[arg(long, default_value_t = 300)]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::load_or_default(cli.config.as_deref())?;
    if let Some(root) = cli.index_root {
        config.engine.index_root = root;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    for (i, root) in cli.roots.into_iter().enumerate() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("root-{}", i));
        config.projects.push(ProjectConfig {
            name,
            roots: vec![root],
        });
    }

    info!("Starting fb-index, index root {:?}", config.engine.index_root);

    let engine = FileBasedIndex::builder(config.engine.clone())
        .register(IdentifierIndex::new(&config.source_globs)?)
        .register(FileNameIndex)
        .open()?;

    // 事件管道先于扫描启动，扫描期间的修改不会丢
    let pipeline = Arc::new(EventPipeline::new(
        engine.clone(),
        Duration::from_millis(config.debounce_ms),
    ));
    let (mut watcher, rx) =
        EventWatcher::start(config.event_channel_size, pipeline.overflow_counter())?;
    let watch_list: Vec<PathBuf> = config
        .projects
        .iter()
        .flat_map(|p| p.roots.iter().cloned())
        .collect();
    let watched = watcher.watch(&watch_list);
    info!("Watching {} roots ({} configured)", watched, watch_list.len());
    tokio::spawn(pipeline.clone().run(rx));

    for project in &config.projects {
        let handle = engine.open_project(Project::from(project));
        tokio::task::spawn_blocking(move || match handle.join() {
            Ok(outcome) => info!(
                "Project '{}' scanned: {} files, {} updated, {} skipped, {} failed",
                outcome.project, outcome.files, outcome.updated, outcome.skipped, outcome.failed
            ),
            Err(e) => tracing::error!("Project scan failed: {}", e),
        });
    }

    let server = QueryServer::new(engine.clone(), Some(pipeline.clone()));
    let port = config.port;
    tokio::spawn(async move {
        if let Err(e) = server.run(port).await {
            tracing::error!("Query server stopped: {}", e);
        }
    });

    if cli.report_secs > 0 {
        let engine = engine.clone();
        let pipeline = pipeline.clone();
        let period = Duration::from_secs(cli.report_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("\n{}\n{}", engine.report(), pipeline.stats());
            }
        });
    }

    info!("fb-index ready. Query via: http://localhost:{}/data?index=Identifiers&key=main", port);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    drop(watcher);
    engine.close()?;
    Ok(())
}
