use crate::utils::EspError;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// FormID 中对象编号占用的低24位
pub const OBJECT_INDEX_MASK: u32 = 0x00FF_FFFF;

/// 输出文件最多可声明的主文件数（0xFF 保留给运行时）
pub const MAX_MASTERS: usize = 254;

/// 插件文件名（大小写不敏感比较，保留原始大小写用于显示和写出）
#[derive(Debug, Clone)]
pub struct PluginName {
    display: String,
    key: String,
}

impl PluginName {
    pub fn new(name: impl Into<String>) -> Self {
        let display = name.into();
        let key = display.to_lowercase();
        PluginName { display, key }
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }
}

impl PartialEq for PluginName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PluginName {}

impl Hash for PluginName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for PluginName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for PluginName {
    fn from(name: &str) -> Self {
        PluginName::new(name)
    }
}

impl Serialize for PluginName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

/// 进程内稳定的对象标识：定义该对象的插件 + 对象编号
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub origin: PluginName,
    pub index: u32,
}

impl ObjectId {
    pub fn new(origin: impl Into<PluginName>, index: u32) -> Self {
        ObjectId {
            origin: origin.into(),
            index: index & OBJECT_INDEX_MASK,
        }
    }
}

impl From<String> for PluginName {
    fn from(name: String) -> Self {
        PluginName::new(name)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:06X}", self.origin, self.index)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// 局部 FormID -> ObjectId
///
/// 高字节是主文件列表的索引，超出列表长度的索引都指向插件自身。
/// 结果只依赖 (插件名, 主文件列表, FormID)，与全局加载顺序无关。
#[derive(Debug, Clone)]
pub struct Resolver {
    plugin: PluginName,
    masters: Vec<PluginName>,
}

impl Resolver {
    pub fn for_plugin(plugin: PluginName, masters: Vec<PluginName>) -> Self {
        Resolver { plugin, masters }
    }

    pub fn plugin(&self) -> &PluginName {
        &self.plugin
    }

    pub fn masters(&self) -> &[PluginName] {
        &self.masters
    }

    /// 解析局部 FormID
    pub fn resolve(&self, form_id: u32) -> ObjectId {
        let master_index = (form_id >> 24) as usize;
        let origin = self.masters.get(master_index).unwrap_or(&self.plugin);
        ObjectId {
            origin: origin.clone(),
            index: form_id & OBJECT_INDEX_MASK,
        }
    }

    /// 文件中高字节 -> 插件名（用于在输出中判断映射是否为恒等）
    fn slot(&self, master_index: usize) -> &PluginName {
        self.masters.get(master_index).unwrap_or(&self.plugin)
    }
}

/// ObjectId -> 输出文件的局部 FormID
#[derive(Debug, Clone)]
pub struct Remapper {
    output: PluginName,
    masters: Vec<PluginName>,
    lookup: HashMap<PluginName, u32>,
}

impl Remapper {
    pub fn new(output: PluginName, masters: Vec<PluginName>) -> Result<Self, EspError> {
        if masters.len() > MAX_MASTERS {
            return Err(EspError::TooManyMasters(masters.len()));
        }
        let lookup = masters
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();
        Ok(Remapper {
            output,
            masters,
            lookup,
        })
    }

    pub fn masters(&self) -> &[PluginName] {
        &self.masters
    }

    /// 重建输出文件的 FormID
    pub fn to_local(&self, id: &ObjectId) -> Result<u32, EspError> {
        let slot = if id.origin == self.output {
            self.masters.len() as u32
        } else {
            *self
                .lookup
                .get(&id.origin)
                .ok_or_else(|| EspError::UnresolvedMaster {
                    plugin: self.output.to_string(),
                    master: id.origin.to_string(),
                })?
        };
        Ok((slot << 24) | (id.index & OBJECT_INDEX_MASK))
    }

    /// 源文件的原始 FormID 字节能否不经转换直接写入输出
    ///
    /// 源文件中出现的每个高字节都必须在输出中指向同一个插件。
    pub fn is_identity_for(&self, source: &Resolver) -> bool {
        (0..=source.masters.len()).all(|slot| {
            let name = source.slot(slot);
            if *name == self.output {
                slot == self.masters.len()
            } else {
                self.lookup.get(name) == Some(&(slot as u32))
            }
        })
    }
}
