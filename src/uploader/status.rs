// 失败分类
//
// 把 HTTP 状态码 / 传输异常 / 无法解析的响应映射为展示类别：
// - 409 是服务器认可的"重复 / 正在处理"状态，以警告（橙色）展示
// - 其余一律以错误（红色）展示

use serde::{Deserialize, Serialize};
use std::fmt;

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// 409 冲突
    Conflict,
    /// 其他非 2xx
    ServerError,
    /// 未收到响应的网络/传输异常
    TransportFailure,
    /// 响应体不是合法的结构化数据
    ParseFailure,
}

/// 展示级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 警告（橙色）
    Warning,
    /// 错误（红色）
    Error,
}

impl FailureCategory {
    pub fn severity(&self) -> Severity {
        match self {
            FailureCategory::Conflict => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: FailureCategory,
    pub severity: Severity,
    /// HTTP 状态码（传输异常时为 None）
    pub http_status: Option<u16>,
    /// 状态码描述
    pub reason: Option<String>,
    /// 服务器返回的 message，解析失败时为原始响应文本，传输异常时为异常描述
    pub message: String,
}

impl Classification {
    /// 服务器处理阶段报告 failed
    pub fn processing_failed(message: Option<String>) -> Self {
        build(
            FailureCategory::ServerError,
            None,
            message.unwrap_or_else(|| "Processing failed".to_string()),
        )
    }

    /// 状态码 + 描述，未知状态码只显示数字
    pub fn status_line(&self) -> Option<String> {
        let status = self.http_status?;
        Some(match &self.reason {
            Some(reason) => format!("{} - {}", status, reason),
            None => status.to_string(),
        })
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Upload failed!")?;
        if let Some(line) = self.status_line() {
            write!(f, " Request status: {}.", line)?;
        }
        match self.category {
            FailureCategory::TransportFailure => write!(f, " Network error: {}", self.message),
            _ => write!(f, " Server response: {}", self.message),
        }
    }
}

/// 错误响应体 `{status, message}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

/// 对一次失败进行分类
///
/// # 参数
/// * `http_status` - HTTP 状态码（未收到响应时为 None）
/// * `transport_error` - 传输异常描述
/// * `raw_body` - 原始响应文本
pub fn classify(
    http_status: Option<u16>,
    transport_error: Option<&str>,
    raw_body: &str,
) -> Classification {
    if http_status.is_none() {
        if let Some(error) = transport_error {
            return build(FailureCategory::TransportFailure, None, error.to_string());
        }
    }

    let parsed = if raw_body.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str::<ErrorBody>(raw_body))
    };

    // 传输层没有状态码时，使用响应体中的 status 字段
    let status = http_status.or_else(|| match &parsed {
        Some(Ok(body)) => body.status,
        _ => None,
    });

    let message = match &parsed {
        Some(Ok(body)) => body.message.clone().unwrap_or_else(|| raw_body.to_string()),
        _ => raw_body.to_string(),
    };

    if status == Some(409) {
        return build(FailureCategory::Conflict, status, message);
    }

    match parsed {
        Some(Err(_)) => build(FailureCategory::ParseFailure, status, message),
        _ => match status {
            Some(code) if !(200..300).contains(&code) => {
                build(FailureCategory::ServerError, status, message)
            }
            // 2xx 但被当作失败上报，或者没有任何可用信息
            _ => build(FailureCategory::ParseFailure, status, message),
        },
    }
}

fn build(category: FailureCategory, http_status: Option<u16>, message: String) -> Classification {
    Classification {
        category,
        severity: category.severity(),
        http_status,
        reason: http_status.and_then(reason_phrase).map(str::to_string),
        message,
    }
}

/// HTTP 状态码描述
pub fn reason_phrase(code: u16) -> Option<&'static str> {
    let phrase = match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        507 => "Insufficient Storage",
        511 => "Network Authentication Required",
        _ => return None,
    };
    Some(phrase)
}
