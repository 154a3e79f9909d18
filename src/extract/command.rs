use std::path::Path;
use std::process::Command;

use anyhow::bail;
use log::debug;

use crate::error::{ReidError, Result};
use crate::extract::FeatureExtractor;

/// 图片路径的占位符
const IMAGE_PLACEHOLDER: &str = "{image}";

/// 调用外部程序提取特征
///
/// 程序的标准输出应当是一个 JSON 浮点数组。
pub struct CommandExtractor {
    name: String,
    program: String,
    args: Vec<String>,
    dim: Option<usize>,
}

impl CommandExtractor {
    /// 命令模板按空白分割，参数中的 `{image}` 会被替换为图片路径
    pub fn new(name: impl Into<String>, template: &str, dim: Option<usize>) -> anyhow::Result<Self> {
        let mut parts = template.split_whitespace().map(|s| s.to_string());
        let Some(program) = parts.next() else {
            bail!("特征提取命令为空");
        };
        let args = parts.collect::<Vec<_>>();
        if !args.iter().any(|a| a.contains(IMAGE_PLACEHOLDER)) {
            bail!("特征提取命令中缺少 {IMAGE_PLACEHOLDER} 占位符：{template}");
        }
        Ok(Self { name: name.into(), program, args, dim })
    }
}

impl FeatureExtractor for CommandExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<f32>> {
        let image = path.to_string_lossy();
        let args = self.args.iter().map(|a| a.replace(IMAGE_PLACEHOLDER, &image));
        debug!("{}: 运行 {} 提取 {}", self.name, self.program, image);

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| ReidError::extraction(path, format!("无法运行 {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReidError::extraction(
                path,
                format!("{} 退出码 {}: {}", self.program, output.status, stderr.trim()),
            ));
        }

        let vector: Vec<f32> = serde_json::from_slice(&output.stdout)
            .map_err(|e| ReidError::extraction(path, format!("无法解析输出: {e}")))?;
        if let Some(dim) = self.dim {
            if vector.len() != dim {
                return Err(ReidError::extraction(
                    path,
                    format!("特征维度为 {}，期望 {dim}", vector.len()),
                ));
            }
        }
        if vector.is_empty() {
            return Err(ReidError::extraction(path, "特征为空"));
        }
        Ok(vector)
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_requires_placeholder() {
        assert!(CommandExtractor::new("deep", "embed.py", None).is_err());
        assert!(CommandExtractor::new("deep", "", None).is_err());
        assert!(CommandExtractor::new("deep", "python embed.py --input={image}", None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_output() {
        let extractor = CommandExtractor::new("deep", "echo [1.5,2,{image}]", None).unwrap();
        let v = extractor.extract(Path::new("3")).unwrap();
        assert_eq!(v, vec![1.5, 2.0, 3.0]);
    }

    #[cfg(unix)]
    #[test]
    fn test_width_enforced() {
        let extractor = CommandExtractor::new("deep", "echo [1,{image}]", Some(3)).unwrap();
        let err = extractor.extract(Path::new("2")).unwrap_err();
        assert!(matches!(err, ReidError::Extraction { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure() {
        let extractor = CommandExtractor::new("deep", "false {image}", None).unwrap();
        assert!(extractor.extract(Path::new("a.jpg")).is_err());
    }
}
