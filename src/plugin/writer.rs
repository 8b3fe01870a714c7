use super::Plugin;
use crate::group::{Group, GroupChild, GRUP};
use crate::io::{DefaultEspWriter, EspWriter, RawEspData};
use crate::record::Record;
use crate::utils::EspError;
use serde::Serialize;
use std::path::Path;

/// 重新序列化与原始字节的比较结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildCheck {
    pub identical: bool,
    pub original_len: usize,
    pub rebuilt_len: usize,
    /// 第一个不同字节的偏移
    pub first_difference: Option<usize>,
}

impl RebuildCheck {
    pub fn compare(original: &[u8], rebuilt: &[u8]) -> Self {
        let first_difference = original
            .iter()
            .zip(rebuilt.iter())
            .position(|(a, b)| a != b)
            .or_else(|| {
                if original.len() != rebuilt.len() {
                    Some(original.len().min(rebuilt.len()))
                } else {
                    None
                }
            });
        RebuildCheck {
            identical: first_difference.is_none(),
            original_len: original.len(),
            rebuilt_len: rebuilt.len(),
            first_difference,
        }
    }
}

impl Plugin {
    /// 序列化为字节
    ///
    /// 未修改的记录按原始字节写出（包括原始压缩数据），组大小重新计算。
    pub fn to_bytes(&self) -> Result<Vec<u8>, EspError> {
        if self.partial {
            return Err(EspError::InvalidFormat(format!(
                "{} 是按类型过滤加载的，不能写回",
                self.name
            )));
        }

        let mut output = Vec::new();
        Self::write_record(&self.header.to_record(), &mut output)?;
        for group in &self.groups {
            Self::write_group(group, &mut output)?;
        }
        Ok(output)
    }

    /// 原子写入文件
    pub fn write_to_file(&self, path: &Path) -> Result<(), EspError> {
        self.write_with(path, &DefaultEspWriter)
    }

    /// 使用自定义 Writer 写入
    pub fn write_with(&self, path: &Path, writer: &dyn EspWriter) -> Result<(), EspError> {
        let bytes = self.to_bytes()?;
        tracing::info!(plugin = %self.name, path = %path.display(), bytes = bytes.len(), "写入插件");
        writer.write(&RawEspData { bytes }, path)
    }

    /// 与原始文件字节比较重新序列化的结果
    pub fn verify_roundtrip(&self, original: &[u8]) -> Result<RebuildCheck, EspError> {
        let rebuilt = self.to_bytes()?;
        Ok(RebuildCheck::compare(original, &rebuilt))
    }

    /// 写入记录
    pub(crate) fn write_record(record: &Record, output: &mut Vec<u8>) -> Result<(), EspError> {
        let data = record.data_for_write()?;
        let size = u32::try_from(data.len()).map_err(|_| {
            EspError::InvalidFormat(format!("记录 {} 数据过大: {} bytes", record.signature, data.len()))
        })?;

        output.extend_from_slice(record.signature.as_bytes());
        output.extend_from_slice(&size.to_le_bytes());
        output.extend_from_slice(&record.flags.to_le_bytes());
        output.extend_from_slice(&record.form_id.to_le_bytes());
        output.extend_from_slice(&record.timestamp.to_le_bytes());
        output.extend_from_slice(&record.version_control_info.to_le_bytes());
        output.extend_from_slice(&record.internal_version.to_le_bytes());
        output.extend_from_slice(&record.unknown.to_le_bytes());
        output.extend_from_slice(&data);
        Ok(())
    }

    /// 写入组
    pub(crate) fn write_group(group: &Group, output: &mut Vec<u8>) -> Result<(), EspError> {
        let start = output.len();
        output.extend_from_slice(GRUP.as_bytes());

        // 临时占位符，稍后计算实际大小
        let size_pos = output.len();
        output.extend_from_slice(&[0u8; 4]);

        output.extend_from_slice(&group.label);
        output.extend_from_slice(&group.group_type.to_i32().to_le_bytes());
        output.extend_from_slice(&group.timestamp.to_le_bytes());
        output.extend_from_slice(&group.version_control_info.to_le_bytes());
        output.extend_from_slice(&group.unknown.to_le_bytes());

        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => Self::write_group(subgroup, output)?,
                GroupChild::Record(record) => Self::write_record(record, output)?,
            }
        }

        // 组大小包含头部
        let actual_size = u32::try_from(output.len() - start).map_err(|_| {
            EspError::InvalidFormat(format!("组 {} 过大", group.get_label_string()))
        })?;
        output[size_pos..size_pos + 4].copy_from_slice(&actual_size.to_le_bytes());
        Ok(())
    }
}
