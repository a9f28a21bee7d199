// 上传分片规划
//
// resumable 分片规则：
// - 分片数 = max(floor(文件大小 / 分片大小), 1)
// - 最后一个分片吸收余数（因此最后一片最大接近 2 倍分片大小）
// - 空文件也有一个长度为 0 的分片
// - 分片序号从 1 开始

use anyhow::{Context, Result};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 分片描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 所属文件标识
    pub file_identifier: String,
    /// 分片序号（从 1 开始）
    pub index: u64,
    /// 字节范围
    pub range: Range<u64>,
    /// 已尝试次数
    pub attempt: u32,
}

impl ChunkDescriptor {
    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 读取分片数据
    pub async fn read_data(&self, file_path: &Path) -> Result<Vec<u8>> {
        let mut file = File::open(file_path)
            .await
            .with_context(|| format!("打开上传文件失败: {:?}", file_path))?;

        file.seek(std::io::SeekFrom::Start(self.range.start))
            .await
            .context("文件定位失败")?;

        let mut buffer = vec![0u8; self.size() as usize];
        file.read_exact(&mut buffer)
            .await
            .context("读取分片数据失败")?;

        debug!(
            "读取分片 #{}: id={}, bytes={}..{}",
            self.index, self.file_identifier, self.range.start, self.range.end
        );

        Ok(buffer)
    }
}

/// 计算分片数量
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);
    (total_size / chunk_size).max(1)
}

/// 规划一个文件的所有分片
pub fn plan_chunks(file_identifier: &str, total_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.max(1);
    let count = chunk_count(total_size, chunk_size);

    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = if i + 1 == count {
                total_size
            } else {
                start + chunk_size
            };
            ChunkDescriptor {
                file_identifier: file_identifier.to_string(),
                index: i + 1,
                range: start..end,
                attempt: 0,
            }
        })
        .collect()
}
