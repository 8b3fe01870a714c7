use crate::datatypes::{RecordFlags, TextEncoding};
use crate::group::Group;
use crate::record::Record;
use crate::resolver::{PluginName, Resolver};
use crate::schema::{decode_record, CodecOptions, FieldSet, SchemaRegistry};
use crate::utils::ParseWarning;
use std::path::{Path, PathBuf};

mod header;
mod iter;
mod parser;
mod stats;
mod writer;

pub use header::{MasterEntry, PluginHeader, SUPPORTED_VERSIONS};
pub use iter::RecordIter;
pub use parser::{LoadOptions, PluginReader, ReaderState};
pub use stats::PluginStats;
pub use writer::RebuildCheck;

/// 已解析的插件文件
#[derive(Debug, Clone)]
pub struct Plugin {
    /// 文件路径（内存中构造的插件为文件名）
    pub path: PathBuf,
    /// 文件名，同时作为对象标识的来源
    pub name: PluginName,
    /// 头部记录
    pub header: PluginHeader,
    /// 顶级组列表
    pub groups: Vec<Group>,
    /// 解析时跳过或截断的内容
    pub warnings: Vec<ParseWarning>,
    /// 文本编码
    pub encoding: TextEncoding,
    /// 按记录类型过滤加载，不包含完整内容
    partial: bool,
}

impl Plugin {
    /// 创建空插件（用于生成补丁）
    pub fn new_empty(name: &str, header: PluginHeader) -> Self {
        Plugin {
            path: PathBuf::from(name),
            name: PluginName::new(name),
            header,
            groups: Vec::new(),
            warnings: Vec::new(),
            encoding: TextEncoding::default(),
            partial: false,
        }
    }

    /// 打开插件文件（默认选项）
    pub fn open(path: impl AsRef<Path>) -> Result<Self, crate::utils::EspError> {
        Self::load(path.as_ref().to_path_buf())
    }

    /// 获取插件名称
    pub fn get_name(&self) -> &str {
        self.name.as_str()
    }

    /// 获取插件类型
    pub fn get_type(&self) -> &str {
        let extension = Path::new(self.name.as_str())
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("esm") => "ESM",
            Some("esl") => "ESL",
            _ => "ESP",
        }
    }

    /// 是否为主文件（标志位或 .esm/.esl 扩展名）
    pub fn is_master(&self) -> bool {
        self.header.has_flag(RecordFlags::MASTER_FILE) || matches!(self.get_type(), "ESM" | "ESL")
    }

    /// 是否为本地化插件
    pub fn is_localized(&self) -> bool {
        self.header.has_flag(RecordFlags::LOCALIZED)
    }

    /// 是否为轻量插件
    pub fn is_light(&self) -> bool {
        self.header.has_flag(RecordFlags::LIGHT_MASTER) || self.get_type() == "ESL"
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// 主文件名列表
    pub fn master_names(&self) -> Vec<PluginName> {
        self.header
            .masters()
            .iter()
            .map(|m| PluginName::new(m.name.as_str()))
            .collect()
    }

    /// 本插件的 FormID 解析器
    pub fn resolver(&self) -> Resolver {
        Resolver::for_plugin(self.name.clone(), self.master_names())
    }

    pub fn codec_options(&self) -> CodecOptions {
        CodecOptions {
            localized: self.is_localized(),
            encoding: self.encoding,
        }
    }

    /// 按内置结构解码记录；未知类型或已损坏的记录返回 None
    pub fn decode(&self, record: &Record) -> Option<FieldSet> {
        if record.decode_error.is_some() {
            return None;
        }
        let schema = SchemaRegistry::builtin().get(&record.signature)?;
        Some(decode_record(schema, &record.subrecords, self.codec_options()))
    }

    /// 按 FormID 查找记录
    pub fn find_record(&self, form_id: u32) -> Option<&Record> {
        self.records().find(|r| r.form_id == form_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Signature;
    use crate::subrecord::Subrecord;

    fn header_with_masters(masters: &[&str]) -> PluginHeader {
        let mut header = PluginHeader::new(1.71);
        header.set_masters(
            masters
                .iter()
                .map(|name| MasterEntry {
                    name: name.to_string(),
                    size: 0,
                })
                .collect(),
        );
        header
    }

    #[test]
    fn test_plugin_type_and_flags() {
        let plugin = Plugin::new_empty("Update.esm", header_with_masters(&["Skyrim.esm"]));
        assert_eq!(plugin.get_type(), "ESM");
        assert!(plugin.is_master());
        assert!(!plugin.is_localized());

        let mut header = PluginHeader::new(1.71);
        header.set_flag(RecordFlags::LOCALIZED, true);
        let plugin = Plugin::new_empty("Mod.esp", header);
        assert!(plugin.is_localized());
        assert!(!plugin.is_master());
        assert!(plugin.codec_options().localized);
    }

    #[test]
    fn test_resolver_uses_masters() {
        let plugin = Plugin::new_empty("Mod.esp", header_with_masters(&["Skyrim.esm"]));
        let resolver = plugin.resolver();
        assert_eq!(resolver.resolve(0x0000_0012).origin, PluginName::new("skyrim.esm"));
        assert_eq!(resolver.resolve(0x0100_0800).origin, PluginName::new("Mod.esp"));
    }

    #[test]
    fn test_decode_known_and_opaque() {
        let plugin = Plugin::new_empty("Mod.esp", PluginHeader::new(1.71));
        let mut glob = Record::new(Signature::new(b"GLOB"), 0x800, 0);
        glob.set_subrecords(vec![
            Subrecord::new(Signature::new(b"EDID"), b"GameHour\0".to_vec()),
            Subrecord::new(Signature::new(b"FLTV"), 12.0f32.to_le_bytes().to_vec()),
        ]);
        assert!(plugin.decode(&glob).is_some());

        let info = Record::new(Signature::new(b"INFO"), 0x801, 0);
        assert!(plugin.decode(&info).is_none());
    }
}
