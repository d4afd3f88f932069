use anyhow::{Context, Result};
use std::path::Path;

/// 只保留日志文件最后 `max_lines` 行，返回被丢弃的行数
pub fn rotate_log<P: AsRef<Path>>(path: P, max_lines: usize) -> Result<usize> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(0);
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("无法读取日志文件: {:?}", path))?;
    let lines: Vec<&str> = content.lines().collect();

    if lines.len() <= max_lines {
        return Ok(0);
    }

    let dropped = lines.len() - max_lines;
    let mut kept = lines[dropped..].join("\n");
    if !kept.is_empty() {
        kept.push('\n');
    }
    std::fs::write(path, kept).with_context(|| format!("无法写入日志文件: {:?}", path))?;

    Ok(dropped)
}
