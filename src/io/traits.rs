/// IO 抽象层 - trait 定义
use crate::utils::EspError;
use std::path::Path;

/// 插件文件原始数据
#[derive(Debug, Clone)]
pub struct RawEspData {
    /// 文件的原始字节数据
    pub bytes: Vec<u8>,
}

/// 插件文件读取 trait
///
/// 只负责取得字节，不负责解析。
pub trait EspReader: Send + Sync {
    /// 读取插件文件的原始数据
    fn read(&self, path: &Path) -> Result<RawEspData, EspError>;
}

/// 插件文件写入 trait
///
/// 只负责落盘，不负责序列化。实现必须保证目标路径上要么是旧文件，
/// 要么是完整的新文件。
pub trait EspWriter: Send + Sync {
    /// 写入插件文件数据
    fn write(&self, data: &RawEspData, path: &Path) -> Result<(), EspError>;
}
