use crate::datatypes::{Signature, TextEncoding};
use crate::resolver::PluginName;
use crate::utils::EspError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// 内置默认配置
const DEFAULT_CONFIG: &str = include_str!("../../data/default_patch_config.json");

/// 补丁生成配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// 输出插件文件名
    pub patch_name: String,
    pub author: String,
    pub description: String,
    /// 未在 record_types 中出现的记录类型是否参与合并
    pub default_enabled: bool,
    /// 记录类型开关
    pub record_types: BTreeMap<Signature, bool>,
    /// 输出标记为轻量插件
    pub flag_light: bool,
    /// 源记录压缩时，输出记录也压缩
    pub compress: bool,
    /// 非本地化字符串的编码
    pub encoding: TextEncoding,
    /// 可以从并集列表中删除条目的插件；其余插件只追加条目
    pub delev: Vec<String>,
}

impl Default for PatchConfig {
    fn default() -> Self {
        PatchConfig {
            patch_name: "Bashed Patch, 0.esp".to_string(),
            author: "BASHED PATCH".to_string(),
            description: String::new(),
            default_enabled: true,
            record_types: BTreeMap::new(),
            flag_light: false,
            compress: true,
            encoding: TextEncoding::default(),
            delev: Vec::new(),
        }
    }
}

impl PatchConfig {
    /// 内置默认配置（data/default_patch_config.json）
    pub fn builtin() -> Result<Self, EspError> {
        Ok(serde_json::from_str(DEFAULT_CONFIG)?)
    }

    /// 从 JSON 文件加载，缺省字段取默认值
    pub fn from_file(path: &Path) -> Result<Self, EspError> {
        if !path.exists() {
            return Err(EspError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: PatchConfig = serde_json::from_str(&text)?;
        tracing::debug!(path = %path.display(), types = config.record_types.len(), "已加载补丁配置");
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, EspError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 该记录类型是否参与合并
    pub fn is_enabled(&self, signature: &Signature) -> bool {
        self.record_types
            .get(signature)
            .copied()
            .unwrap_or(self.default_enabled)
    }

    /// 设置单个记录类型的开关
    pub fn with_toggle(mut self, signature: Signature, enabled: bool) -> Self {
        self.record_types.insert(signature, enabled);
        self
    }

    /// 只合并指定的记录类型
    pub fn enable_only(mut self, signatures: &[Signature]) -> Self {
        self.default_enabled = false;
        self.record_types = signatures.iter().map(|s| (*s, true)).collect();
        self
    }

    /// 允许该插件删除列表条目
    pub fn with_delev(mut self, plugin: &str) -> Self {
        self.delev.push(plugin.to_string());
        self
    }

    /// 该插件缺少的列表条目是否视为删除
    pub fn removes_entries(&self, plugin: &PluginName) -> bool {
        self.delev.iter().any(|name| PluginName::new(name.as_str()) == *plugin)
    }

    pub fn output_name(&self) -> PluginName {
        PluginName::new(self.patch_name.as_str())
    }
}
