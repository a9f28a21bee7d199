// 命令行渲染
//
// 把会话事件转换为面向用户的文本行

use crate::events::UploadEvent;
use crate::uploader::progress::{format_size, TransferPhase};
use crate::uploader::status::Severity;
use std::collections::HashMap;

/// 等待服务器处理时的忙碌指示
const SPINNER: [&str; 4] = ["|", "/", "-", "\\"];

/// 控制台渲染器
#[derive(Debug, Default)]
pub struct ConsoleRenderer {
    /// 文件标识 -> 展示名
    names: HashMap<String, String>,
    /// 是否输出 ANSI 颜色
    colored: bool,
    spinner_frame: usize,
    succeeded: usize,
    failed: usize,
    rejected: bool,
}

impl ConsoleRenderer {
    pub fn new(colored: bool) -> Self {
        Self {
            colored,
            ..Self::default()
        }
    }

    /// 是否有失败（文件失败或选择被拒绝）
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.rejected
    }

    fn name_of(&self, identifier: &str) -> String {
        self.names
            .get(identifier)
            .cloned()
            .unwrap_or_else(|| identifier.to_string())
    }

    fn paint(&self, text: String, severity: Severity) -> String {
        if !self.colored {
            return text;
        }
        let code = match severity {
            Severity::Warning => "33",
            Severity::Error => "31",
        };
        format!("\x1b[{}m{}\x1b[0m", code, text)
    }

    /// 渲染一个事件，不需要展示的事件返回 None
    pub fn render(&mut self, event: &UploadEvent) -> Option<String> {
        if let UploadEvent::Created {
            identifier, name, ..
        } = event
        {
            self.names.insert(identifier.clone(), name.clone());
        }
        // 文件级事件的展示名，会话级事件为空
        let name = event
            .identifier()
            .map(|identifier| self.name_of(identifier))
            .unwrap_or_default();

        match event {
            UploadEvent::Created { size, lane, .. } => {
                let lane = lane.map(|l| format!(" [lane {}]", l + 1)).unwrap_or_default();
                Some(format!(
                    "{} ({}){}: Queued for upload...",
                    name,
                    format_size(*size),
                    lane
                ))
            }
            UploadEvent::StatusChanged { .. } => None,
            UploadEvent::Progress {
                percent,
                speed,
                phase,
                ..
            } => Some(match phase {
                TransferPhase::Finalizing => {
                    format!("{}: Processing and validating file, please wait...", name)
                }
                TransferPhase::Transferring => format!(
                    "{}: Progress: {:.3}% Upload speed: {}/s",
                    name,
                    percent,
                    format_size(speed.unwrap_or(0))
                ),
            }),
            UploadEvent::Processing {
                status, message, ..
            } => {
                let frame = SPINNER[self.spinner_frame % SPINNER.len()];
                self.spinner_frame += 1;
                Some(match message {
                    Some(message) => format!("{}: {} {} - {}", name, frame, status, message),
                    None => format!("{}: {} {}", name, frame, status),
                })
            }
            UploadEvent::PollProblem { description, .. } => Some(format!(
                "{}: Status check failed, retrying. {}",
                name, description
            )),
            UploadEvent::Succeeded { link, message, .. } => {
                self.succeeded += 1;
                Some(match (link, message) {
                    (Some(link), _) => format!("{}: Upload successful. View: {}", name, link),
                    (None, Some(message)) => format!(
                        "{}: Upload successful. Server response: {}",
                        name, message
                    ),
                    (None, None) => format!("{}: Upload successful.", name),
                })
            }
            UploadEvent::Failed { classification, .. } => {
                self.failed += 1;
                let line = format!("{}: {}", name, classification);
                Some(self.paint(line, classification.severity))
            }
            UploadEvent::ValidationFailed { message } => {
                self.rejected = true;
                Some(self.paint(format!("Error : {}", message), Severity::Error))
            }
            UploadEvent::Reset => {
                self.names.clear();
                Some("Upload cancelled.".to_string())
            }
            UploadEvent::AllSettled => Some(format!(
                "All uploads finished: {} succeeded, {} failed.",
                self.succeeded, self.failed
            )),
        }
    }
}
