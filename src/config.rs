use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::*;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs = ProjectDirs::from("", "wildreid", "wildreid").expect("failed to get project dir");
    ConfDir { path: proj_dirs.data_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap_or("wildreid")
}

#[derive(Parser, Debug, Clone)]
#[command(name = "wildreid", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 目录、特征库、模型等数据的存放目录
    #[arg(short, long, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从裁剪图重新构建特征库、目录与分类器
    Build(BuildCommand),
    /// 检索一张图片，未见过的图片会自动加入目录
    Identify(IdentifyCommand),
    /// 检索并根据召回率决定是否重新训练
    Reid(ReidCommand),
    /// 使用分类器为图片给出个体/物种标签
    Classify(ClassifyCommand),
    /// 启动 HTTP 识别服务
    Server(ServerCommand),
    /// 导出目录中的全部融合向量
    Export(ExportCommand),
    /// 显示目录概况
    Show(ShowCommand),
}

/// 索引类型
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// 精确搜索
    Flat,
    /// 倒排 + 标量量化，需要训练
    Ivf,
}

/// 距离度量
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// 欧氏距离的平方
    L2,
    /// 1 - 余弦相似度
    Cosine,
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 新建目录时使用的索引类型
    #[arg(long, value_enum, default_value_t = IndexKind::Flat)]
    pub index_kind: IndexKind,
    /// 索引距离度量
    #[arg(long, value_enum, default_value_t = Metric::L2)]
    pub metric: Metric,
    /// IVF 聚类中心数量，训练样本不足时自动减少
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub nlist: usize,
    /// IVF 搜索的倒排列表数量
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub nprobe: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { index_kind: IndexKind::Flat, metric: Metric::L2, nlist: 100, nprobe: 8 }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct RecallOptions {
    /// 排名结果数量
    #[arg(short = 'k', long, value_name = "K", default_value_t = 5)]
    pub top_k: usize,
    /// 召回率低于该值时触发完整的重新训练
    #[arg(long, value_name = "RECALL", default_value_t = 0.5)]
    pub recall_threshold: f32,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self { top_k: 5, recall_threshold: 0.5 }
    }
}

/// 深度特征来源
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepSource {
    /// 调用外部程序
    Command,
    /// 从已保存的特征库中按文件名查找
    Precomputed,
}

/// 纹理特征来源
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSource {
    /// 内置的颜色直方图 + LBP + GLCM
    Native,
    /// 从已保存的特征库中按文件名查找
    Precomputed,
}

#[derive(Parser, Debug, Clone)]
pub struct ExtractOptions {
    /// 深度特征来源
    #[arg(long, value_enum, default_value_t = DeepSource::Command)]
    pub deep: DeepSource,
    /// 深度特征提取命令，`{image}` 会被替换为图片路径，输出为 JSON 浮点数组
    /// 例：--deep-command 'python embed.py {image}'
    #[arg(long, value_name = "CMD", verbatim_doc_comment)]
    pub deep_command: Option<String>,
    /// 深度特征的固定维度，不填则不检查
    #[arg(long, value_name = "DIM")]
    pub deep_dim: Option<usize>,
    /// 预计算深度特征库的路径（不含扩展名）
    #[arg(long, value_name = "PATH")]
    pub deep_store: Option<PathBuf>,
    /// 纹理特征来源
    #[arg(long, value_enum, default_value_t = PatternSource::Native)]
    pub pattern: PatternSource,
    /// 预计算纹理特征库的路径（不含扩展名）
    #[arg(long, value_name = "PATH")]
    pub pattern_store: Option<PathBuf>,
}

/// 裁剪方式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// 语料已经按 `<类别>/<图片>` 裁剪好，直接复制
    Copy,
    /// 调用外部检测程序
    Command,
}

/// 分类器的训练输入
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierInput {
    /// 仅深度特征
    Deep,
    /// 融合特征
    Fused,
}

#[derive(Parser, Debug, Clone)]
pub struct PipelineOptions {
    /// 原始语料目录，不填则直接使用已有裁剪图
    #[arg(long, value_name = "DIR")]
    pub corpus: Option<PathBuf>,
    /// 裁剪方式
    #[arg(long, value_enum, default_value_t = DetectorKind::Copy)]
    pub detector: DetectorKind,
    /// 外部检测命令，`{corpus}` 与 `{crops}` 会被替换，输出为 JSON 检测结果数组
    #[arg(long, value_name = "CMD")]
    pub detect_command: Option<String>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png")]
    pub suffix: String,
    /// 分类器训练使用的特征
    #[arg(long, value_enum, default_value_t = ClassifierInput::Deep)]
    pub classifier_input: ClassifierInput,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            corpus: None,
            detector: DetectorKind::Copy,
            detect_command: None,
            suffix: "jpg,jpeg,png".to_string(),
            classifier_input: ClassifierInput::Deep,
        }
    }
}

/// 传递给各个组件的完整配置
#[derive(Debug, Clone)]
pub struct Settings {
    pub conf_dir: ConfDir,
    pub index: IndexOptions,
    pub recall: RecallOptions,
}

impl Settings {
    pub fn new(conf_dir: ConfDir) -> Self {
        Self { conf_dir, index: IndexOptions::default(), recall: RecallOptions::default() }
    }
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回目录索引文件的路径
    pub fn index(&self) -> PathBuf {
        self.path.join("catalog.index")
    }

    /// 返回目录元数据文件的路径
    pub fn metadata(&self) -> PathBuf {
        self.path.join("catalog.json")
    }

    /// 返回融合向量备份文件的路径
    pub fn embeddings_backup(&self) -> PathBuf {
        self.path.join("embeddings.npy")
    }

    /// 返回特征库目录
    pub fn features(&self) -> PathBuf {
        self.path.join("features")
    }

    /// 返回深度特征库的路径（不含扩展名）
    pub fn deep_store(&self) -> PathBuf {
        self.features().join("deep")
    }

    /// 返回纹理特征库的路径（不含扩展名）
    pub fn pattern_store(&self) -> PathBuf {
        self.features().join("pattern")
    }

    /// 返回裁剪图目录
    pub fn crops(&self) -> PathBuf {
        self.path.join("crops")
    }

    /// 返回分类器文件的路径
    pub fn classifier(&self) -> PathBuf {
        self.path.join("models").join("classifier.json")
    }

    /// 返回分类器训练指标文件的路径
    pub fn classifier_metrics(&self) -> PathBuf {
        self.path.join("models").join("classifier_metrics.json")
    }

    /// 返回检索结果文件的路径
    pub fn recall_result(&self) -> PathBuf {
        self.path.join("results").join("recall_result.json")
    }

    /// 返回分类结果文件的路径
    pub fn identity_result(&self) -> PathBuf {
        self.path.join("results").join("identity_result.json")
    }

    /// 返回重新识别运行日志的路径
    pub fn run_log(&self) -> PathBuf {
        self.path.join("reid_run_log.json")
    }

    /// 返回上传图片的存放目录
    pub fn uploads(&self) -> PathBuf {
        self.path.join("uploads")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
