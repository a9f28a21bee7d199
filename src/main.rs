use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use submission_uploader::{
    config::{AppConfig, CompletionMode, TransportMode, UploadConfig, DEFAULT_CONFIG_PATH},
    logging,
    render::ConsoleRenderer,
    SelectedFile, UploadEvent, UploadSession,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "submission-uploader")]
#[command(about = "Upload submission files with resumable chunked or whole-file transfer")]
struct Cli {
    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// 上传接口地址
    #[arg(long)]
    target: Option<String>,
    /// 处理状态查询接口地址
    #[arg(long)]
    status_url: Option<String>,
    /// 使用整文件上传（不分片）
    #[arg(long)]
    legacy: bool,
    /// 上传响应即最终结果，不轮询处理状态
    #[arg(long)]
    immediate: bool,
    /// 最大同时上传数
    #[arg(long)]
    concurrency: Option<usize>,
    /// 分片大小 (MB)
    #[arg(long)]
    chunk_size_mb: Option<u64>,
    /// 单次最多上传的文件数
    #[arg(long)]
    max_files: Option<usize>,
    /// 允许的扩展名，可重复
    #[arg(long = "allow-ext")]
    allow_ext: Vec<String>,
    /// 不探测服务器已有分片
    #[arg(long)]
    no_test_chunks: bool,
    /// 以 JSON 行输出事件
    #[arg(long)]
    json: bool,
    /// 关闭颜色输出
    #[arg(long)]
    no_color: bool,
    /// 要上传的文件
    files: Vec<PathBuf>,
}

impl Cli {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut UploadConfig) {
        if let Some(target) = &self.target {
            config.target_url = target.clone();
        }
        if let Some(status_url) = &self.status_url {
            config.status_url = Some(status_url.clone());
        }
        if self.legacy {
            config.transport_mode = TransportMode::Legacy;
        }
        if self.immediate {
            config.completion_mode = CompletionMode::Immediate;
        }
        if let Some(concurrency) = self.concurrency {
            config.max_simultaneous = concurrency;
        }
        if let Some(chunk_size_mb) = self.chunk_size_mb {
            config.chunk_size_mb = chunk_size_mb;
        }
        if self.max_files.is_some() {
            config.max_files = self.max_files;
        }
        if !self.allow_ext.is_empty() {
            config.allowed_extensions = self.allow_ext.clone();
        }
        if self.no_test_chunks {
            config.test_chunks = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log);
    cli.apply(&mut config.upload);

    let mut files = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        files.push(SelectedFile::from_path(path).await?);
    }

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let session = UploadSession::new(config.upload.clone(), ui_tx).context("创建上传会话失败")?;
    info!(
        "上传会话 {} 已创建，传输模式: {:?}",
        session.id(),
        session.transport_mode()
    );
    let mut renderer = ConsoleRenderer::new(!cli.no_color);

    match session.start(files) {
        Ok(identifiers) => info!("已提交 {} 个文件", identifiers.len()),
        // 校验失败时提示事件已在通道中，下面统一输出后退出
        Err(e) if e.is_validation() => {}
        Err(e) => return Err(e.into()),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消上传");
                session.cancel();
            }
            event = ui_rx.recv() => {
                let Some(event) = event else { break };
                print_event(&mut renderer, &event, cli.json)?;
                if matches!(
                    event,
                    UploadEvent::AllSettled | UploadEvent::Reset | UploadEvent::ValidationFailed { .. }
                ) {
                    break;
                }
            }
        }
    }

    session.wait_until_settled().await;
    for target in session.snapshot() {
        info!(
            "{}: {} ({:.1}%)",
            target.relative_path,
            target.state.as_str(),
            target.progress()
        );
    }

    // 通过返回值退出，保证日志缓冲随 _log_guard 一起落盘
    Ok(exit_code(&renderer))
}

/// 有文件失败或选择被拒绝时以非零码退出
fn exit_code(renderer: &ConsoleRenderer) -> ExitCode {
    if renderer.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_event(renderer: &mut ConsoleRenderer, event: &UploadEvent, json: bool) -> anyhow::Result<()> {
    // JSON 模式下仍经过渲染器，用于统计失败数
    let line = renderer.render(event);
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else if let Some(line) = line {
        println!("{}", line);
    }
    Ok(())
}
