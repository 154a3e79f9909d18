use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::recall::RecallEngine;

/// 应用状态
pub struct AppState {
    /// 召回引擎，收录新图片会修改目录，因此同一时间只允许一个请求使用
    pub engine: Mutex<RecallEngine>,
    /// 上传图片的保存目录
    pub uploads: PathBuf,
    /// 鉴权 token
    pub token: String,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(engine: RecallEngine, token: String) -> Arc<Self> {
        let uploads = engine.settings().conf_dir.uploads();
        Arc::new(AppState { engine: Mutex::new(engine), uploads, token })
    }
}
