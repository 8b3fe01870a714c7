/// IO 抽象层模块
///
/// 文件读写通过 trait 注入，解析与序列化不直接接触文件系统。
///
/// - **traits**: Reader/Writer trait 接口
/// - **esp_io**: 基于文件系统的默认实现（写入为原子替换）
///
/// ```rust,ignore
/// use esp_patcher::io::{DefaultEspReader, EspReader};
///
/// let reader = DefaultEspReader;
/// let data = reader.read(Path::new("example.esp"))?;
/// ```
pub mod esp_io;
pub mod traits;

pub use esp_io::{DefaultEspReader, DefaultEspWriter};
pub use traits::{EspReader, EspWriter, RawEspData};
