use super::Plugin;
use crate::datatypes::Signature;
use crate::group::{Group, GroupChild};
use serde::Serialize;
use std::collections::BTreeMap;

/// 插件统计信息
#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub name: String,
    pub plugin_type: String,
    pub version: f32,
    pub is_master: bool,
    pub is_localized: bool,
    pub is_light: bool,
    pub masters: Vec<String>,
    pub group_count: usize,
    /// 不含头部记录
    pub record_count: usize,
    pub compressed_count: usize,
    pub deleted_count: usize,
    /// 无法解析子记录、按原始字节保留的记录数
    pub undecodable_count: usize,
    pub warning_count: usize,
    /// 各记录类型的数量
    pub by_signature: BTreeMap<Signature, usize>,
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "类型: {} (HEDR {})", self.plugin_type, self.version)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "本地化: {}", if self.is_localized { "是" } else { "否" })?;
        writeln!(f, "轻量: {}", if self.is_light { "是" } else { "否" })?;
        writeln!(f, "依赖主文件 ({}):", self.masters.len())?;
        for (index, master) in self.masters.iter().enumerate() {
            writeln!(f, "  [{:02X}] {}", index, master)?;
        }
        writeln!(f, "组数量: {}", self.group_count)?;
        writeln!(f, "记录数量: {}", self.record_count)?;
        writeln!(f, "压缩记录: {}", self.compressed_count)?;
        writeln!(f, "已删除记录: {}", self.deleted_count)?;
        writeln!(f, "无法解析的记录: {}", self.undecodable_count)?;
        writeln!(f, "解析警告: {}", self.warning_count)?;
        if !self.by_signature.is_empty() {
            writeln!(f, "记录类型:")?;
            for (signature, count) in &self.by_signature {
                writeln!(f, "  {}: {}", signature, count)?;
            }
        }
        Ok(())
    }
}

impl Plugin {
    /// 获取统计信息
    pub fn get_stats(&self) -> PluginStats {
        let mut stats = PluginStats {
            name: self.get_name().to_string(),
            plugin_type: self.get_type().to_string(),
            version: self.header.version(),
            is_master: self.is_master(),
            is_localized: self.is_localized(),
            is_light: self.is_light(),
            masters: self.header.masters().iter().map(|m| m.name.clone()).collect(),
            group_count: self.count_total_groups(),
            record_count: 0,
            compressed_count: 0,
            deleted_count: 0,
            undecodable_count: 0,
            warning_count: self.warnings.len(),
            by_signature: BTreeMap::new(),
        };

        for record in self.records() {
            stats.record_count += 1;
            *stats.by_signature.entry(record.signature).or_insert(0) += 1;
            if record.is_compressed() {
                stats.compressed_count += 1;
            }
            if record.is_deleted() {
                stats.deleted_count += 1;
            }
            if record.decode_error.is_some() {
                stats.undecodable_count += 1;
            }
        }

        stats
    }

    /// 统计总组数
    pub(crate) fn count_total_groups(&self) -> usize {
        self.groups.len() + self.groups.iter().map(count_subgroups).sum::<usize>()
    }
}

/// 统计子组数量
fn count_subgroups(group: &Group) -> usize {
    group
        .children
        .iter()
        .map(|child| match child {
            GroupChild::Group(subgroup) => 1 + count_subgroups(subgroup),
            GroupChild::Record(_) => 0,
        })
        .sum()
}
