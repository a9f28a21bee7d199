// 文件标识生成
//
// 标识只由相对路径和文件大小决定，不读取文件内容：
// 服务器据此识别"同一个逻辑文件"的分片，重新上传时可跳过已收到的分片。
// 同名但大小不同的文件（例如重新导出）会得到新的标识。

/// 生成文件标识
///
/// 格式：`<大小>-<路径 UTF-8 每个字节的十进制值拼接>`
///
/// 路径字节均 >= 32 时（不含控制字符），两位数字节以 3-9 开头、三位数字节以 1-2 开头，
/// 拼接结果可唯一还原，不同路径不会得到相同的数字串。
pub fn identify(relative_path: &str, size: u64) -> String {
    let mut encoded = String::with_capacity(relative_path.len() * 3 + 21);
    encoded.push_str(&size.to_string());
    encoded.push('-');
    for byte in relative_path.as_bytes() {
        encoded.push_str(&byte.to_string());
    }
    encoded
}
