// 上传完成处理
//
// 把文件成功时的响应体解析为结果：
// - 轮询模式下带 temp_name：服务器延后处理，需要启动轮询
// - 带 submission_id / submission_ids：立即完成
// - 不是 JSON：仍视为成功，展示原始文本

use crate::client::{ResourceId, UploadResponseBody};
use crate::config::CompletionMode;

/// 完成结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// 服务器延后处理
    Deferred { temp_name: String },
    /// 立即完成
    Created {
        resource_ids: Vec<String>,
        link: Option<String>,
        message: Option<String>,
    },
    /// 响应体无法解析
    Unparsed { raw: String },
}

/// 根据响应体解析完成结果
///
/// # 参数
/// * `body` - 最后一个请求的响应体
/// * `mode` - 完成模式（立即 / 轮询）
/// * `link_prefix` - 资源链接前缀
pub fn resolve(body: &str, mode: CompletionMode, link_prefix: &str) -> CompletionOutcome {
    let parsed: UploadResponseBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return CompletionOutcome::Unparsed {
                raw: body.to_string(),
            }
        }
    };

    if mode == CompletionMode::Polling {
        if let Some(temp_name) = parsed.temp_name.as_deref().filter(|t| !t.is_empty()) {
            return CompletionOutcome::Deferred {
                temp_name: temp_name.to_string(),
            };
        }
    }

    let resource_ids = collect_ids(parsed.submission_id.as_ref(), parsed.submission_ids.as_deref());
    let link = build_link(link_prefix, &resource_ids, parsed.url.as_deref());

    CompletionOutcome::Created {
        resource_ids,
        link,
        message: parsed.message,
    }
}

/// 合并单个 ID 和 ID 列表
pub fn collect_ids(single: Option<&ResourceId>, list: Option<&[ResourceId]>) -> Vec<String> {
    let mut ids: Vec<String> = list
        .unwrap_or_default()
        .iter()
        .map(ResourceId::to_string)
        .collect();
    if let Some(id) = single {
        let id = id.to_string();
        if !ids.contains(&id) {
            ids.insert(0, id);
        }
    }
    ids
}

/// 构建资源链接
///
/// 服务器给出 `url` 时直接拼接前缀；否则只有恰好一个 ID 时才生成链接
pub fn build_link(link_prefix: &str, resource_ids: &[String], url: Option<&str>) -> Option<String> {
    let prefix = link_prefix.trim_end_matches('/');
    if let Some(url) = url.filter(|u| !u.is_empty()) {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Some(url.to_string());
        }
        let separator = if url.starts_with('/') { "" } else { "/" };
        return Some(format!("{}{}{}", prefix, separator, url));
    }
    match resource_ids {
        [id] => Some(format!("{}/submission/{}", prefix, id)),
        _ => None,
    }
}
