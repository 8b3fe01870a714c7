use crate::group::{Group, GroupChild};
use crate::plugin::Plugin;
use crate::record::Record;
use crate::schema::SchemaRegistry;
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// ESP文件结构调试器
pub struct EspDebugger;

impl EspDebugger {
    /// 生成详细的文件结构dump
    pub fn dump_file_structure(plugin: &Plugin, output_path: &Path) -> Result<(), EspError> {
        let mut output = BufWriter::new(File::create(output_path)?);
        Self::dump_structure(plugin, &mut output)?;
        output.flush()?;
        Ok(())
    }

    pub fn dump_structure<W: Write>(plugin: &Plugin, output: &mut W) -> Result<(), EspError> {
        Self::write_header_info(output, plugin)?;
        Self::write_masters_info(output, plugin)?;
        Self::write_groups_info(output, plugin)?;
        Ok(())
    }

    /// 写入头部信息
    fn write_header_info<W: Write>(output: &mut W, plugin: &Plugin) -> Result<(), EspError> {
        let header = &plugin.header;
        writeln!(output, "=== ESP文件结构dump ===")?;
        writeln!(output, "文件: {}", plugin.get_name())?;
        writeln!(output, "类型: {}", plugin.get_type())?;
        writeln!(output, "版本: {:.2}", header.version())?;
        writeln!(output, "主文件: {}", if plugin.is_master() { "是" } else { "否" })?;
        writeln!(output, "本地化: {}", if plugin.is_localized() { "是" } else { "否" })?;
        writeln!(output, "轻量: {}", if plugin.is_light() { "是" } else { "否" })?;
        writeln!(output, "记录数: {}", header.num_records())?;
        writeln!(output, "下一个对象ID: 0x{:06X}", header.next_object_id())?;
        if let Some(author) = header.author() {
            writeln!(output, "作者: {}", author)?;
        }
        if let Some(description) = header.description() {
            writeln!(output, "描述: {}", description.replace('\n', " / "))?;
        }
        writeln!(output)?;

        writeln!(output, "=== 头部记录 ===")?;
        Self::dump_record(plugin, &header.to_record(), output, 0)?;
        writeln!(output)?;
        Ok(())
    }

    /// 写入主文件信息
    fn write_masters_info<W: Write>(output: &mut W, plugin: &Plugin) -> Result<(), EspError> {
        let masters = plugin.header.masters();
        writeln!(output, "=== 主文件列表 ({}) ===", masters.len())?;
        for (i, master) in masters.iter().enumerate() {
            writeln!(output, "  {:02X}: {}", i, master.name)?;
        }
        writeln!(output)?;
        Ok(())
    }

    /// 写入组信息
    fn write_groups_info<W: Write>(output: &mut W, plugin: &Plugin) -> Result<(), EspError> {
        writeln!(output, "=== 组结构 ({}) ===", plugin.groups.len())?;
        for (i, group) in plugin.groups.iter().enumerate() {
            writeln!(output, "组 {}:", i)?;
            Self::dump_group(plugin, group, output, 0)?;
            writeln!(output)?;
        }
        if !plugin.warnings.is_empty() {
            writeln!(output, "=== 解析警告 ({}) ===", plugin.warnings.len())?;
            for warning in &plugin.warnings {
                writeln!(output, "  {}", warning)?;
            }
        }
        Ok(())
    }

    /// Dump 组结构
    fn dump_group<W: Write>(plugin: &Plugin, group: &Group, output: &mut W, indent: usize) -> Result<(), EspError> {
        let prefix = "  ".repeat(indent);

        writeln!(output, "{}GRUP {{", prefix)?;
        writeln!(output, "{}  大小: {} bytes", prefix, group.size)?;
        writeln!(output, "{}  标签: {:?} ('{}')", prefix, group.label, group.get_label_string())?;
        writeln!(output, "{}  类型: {:?} ({})", prefix, group.group_type, group.group_type.to_i32())?;
        writeln!(output, "{}  时间戳: {}", prefix, group.timestamp)?;
        writeln!(output, "{}  版本控制: {}", prefix, group.version_control_info)?;
        writeln!(output, "{}  子元素数: {}", prefix, group.children.len())?;

        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => Self::dump_group(plugin, subgroup, output, indent + 1)?,
                GroupChild::Record(record) => Self::dump_record(plugin, record, output, indent + 1)?,
            }
        }

        writeln!(output, "{}}}", prefix)?;
        Ok(())
    }

    /// Dump 记录结构
    fn dump_record<W: Write>(plugin: &Plugin, record: &Record, output: &mut W, indent: usize) -> Result<(), EspError> {
        let prefix = "  ".repeat(indent);

        writeln!(output, "{}{} {{", prefix, record.signature)?;
        writeln!(output, "{}  FormID: 0x{:08X} ({})", prefix, record.form_id, plugin.resolver().resolve(record.form_id))?;
        writeln!(output, "{}  数据大小: {} bytes", prefix, record.data_size)?;
        writeln!(output, "{}  标志位: 0x{:08X}", prefix, record.flags)?;
        writeln!(output, "{}  时间戳: {}", prefix, record.timestamp)?;
        writeln!(output, "{}  版本控制: {}", prefix, record.version_control_info)?;
        writeln!(output, "{}  内部版本: {}", prefix, record.internal_version)?;
        writeln!(output, "{}  子记录数: {}", prefix, record.subrecords.len())?;

        if let Some(reason) = &record.decode_error {
            writeln!(output, "{}  ⚠ 无法解析子记录: {}", prefix, reason)?;
        }

        let total_subrecord_size = Self::calculate_subrecord_size(&record.subrecords);
        if !record.is_compressed() && record.decode_error.is_none() && total_subrecord_size != record.data_size as usize {
            writeln!(output, "{}  ⚠ 大小不匹配！计算值: {} bytes", prefix, total_subrecord_size)?;
        }

        for subrecord in &record.subrecords {
            Self::dump_subrecord(subrecord, output, indent + 1)?;
        }

        // 有结构描述的记录额外输出解码后的字段
        if let (Some(schema), Some(fields)) = (
            SchemaRegistry::builtin().get(&record.signature),
            plugin.decode(record),
        ) {
            writeln!(output, "{}  字段:", prefix)?;
            for (element, value) in schema.elements.iter().zip(&fields.fields) {
                if !value.is_absent() {
                    writeln!(output, "{}    {} = {}", prefix, element.name, value)?;
                }
            }
            for extra in &fields.extras {
                writeln!(output, "{}    (未描述) {}: {} bytes", prefix, extra.subrecord.signature, extra.subrecord.data.len())?;
            }
        }

        writeln!(output, "{}}}", prefix)?;
        Ok(())
    }

    /// 计算子记录总大小
    fn calculate_subrecord_size(subrecords: &[Subrecord]) -> usize {
        subrecords.iter().map(|sr| sr.encoded_len()).sum()
    }

    /// Dump 子记录结构
    fn dump_subrecord<W: Write>(subrecord: &Subrecord, output: &mut W, indent: usize) -> Result<(), EspError> {
        let prefix = "  ".repeat(indent);
        let extended = if subrecord.extended { " (XXXX)" } else { "" };
        writeln!(
            output,
            "{}{} [{} bytes{}]",
            prefix,
            subrecord.signature,
            subrecord.data.len(),
            extended
        )?;
        Self::dump_subrecord_data(output, &prefix, subrecord)?;
        Ok(())
    }

    /// Dump子记录数据
    fn dump_subrecord_data<W: Write>(output: &mut W, prefix: &str, subrecord: &Subrecord) -> Result<(), EspError> {
        if subrecord.data.is_empty() {
            return Ok(());
        }
        let preview_len = std::cmp::min(32, subrecord.data.len());
        let hex_data: Vec<String> = subrecord.data[..preview_len]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        writeln!(
            output,
            "{}  数据预览: {}{}",
            prefix,
            hex_data.join(" "),
            if subrecord.data.len() > 32 { "..." } else { "" }
        )?;

        if Self::is_likely_string_subrecord(subrecord.signature.as_bytes()) {
            let text_content = String::from_utf8_lossy(&subrecord.data);
            let clean_text = text_content.trim_end_matches('\0');
            if !clean_text.is_empty() {
                writeln!(output, "{}  文本内容: \"{}\"", prefix, clean_text)?;
            }
        }
        Ok(())
    }

    /// 判断是否可能是字符串类型的子记录
    fn is_likely_string_subrecord(signature: &[u8; 4]) -> bool {
        matches!(signature, b"EDID" | b"CNAM" | b"SNAM" | b"MAST")
    }

    /// 对比两个文件的结构
    pub fn compare_structures<W: Write>(original: &Plugin, rebuilt: &Plugin, output: &mut W) -> Result<usize, EspError> {
        writeln!(output, "=== ESP文件结构对比 ===")?;
        writeln!(output, "原始文件: {}", original.path.display())?;
        writeln!(output, "重建文件: {}", rebuilt.path.display())?;
        writeln!(output)?;

        let mut differences = 0;
        writeln!(output, "=== 基本信息对比 ===")?;
        writeln!(output, "组数量: {} vs {}", original.groups.len(), rebuilt.groups.len())?;
        writeln!(output, "主文件数: {} vs {}", original.header.masters().len(), rebuilt.header.masters().len())?;
        if original.header.masters() != rebuilt.header.masters() {
            writeln!(output, "⚠ 主文件列表不一致")?;
            differences += 1;
        }
        writeln!(output)?;

        writeln!(output, "=== 头部记录对比 ===")?;
        differences += Self::compare_records(
            &original.header.to_record(),
            &rebuilt.header.to_record(),
            output,
            "头部",
        )?;
        writeln!(output)?;

        writeln!(output, "=== 组结构对比 ===")?;
        let min_groups = std::cmp::min(original.groups.len(), rebuilt.groups.len());
        for i in 0..min_groups {
            differences += Self::compare_groups(&original.groups[i], &rebuilt.groups[i], output, &format!("组 {}", i))?;
        }
        if original.groups.len() != rebuilt.groups.len() {
            writeln!(output, "⚠ 组数量不匹配！")?;
            differences += 1;
        }

        writeln!(output, "差异数: {}", differences)?;
        Ok(differences)
    }

    /// 对比两个组（递归）
    fn compare_groups<W: Write>(original: &Group, rebuilt: &Group, output: &mut W, path: &str) -> Result<usize, EspError> {
        let mut differences = 0;
        if original.label != rebuilt.label || original.group_type != rebuilt.group_type {
            writeln!(output, "  ⚠ {} 标签不匹配: {} vs {}", path, original.get_label_string(), rebuilt.get_label_string())?;
            differences += 1;
        }
        if original.children.len() != rebuilt.children.len() {
            writeln!(
                output,
                "  ⚠ {} 子元素数量不匹配: {} vs {}",
                path,
                original.children.len(),
                rebuilt.children.len()
            )?;
            differences += 1;
        }

        for (i, (a, b)) in original.children.iter().zip(&rebuilt.children).enumerate() {
            let child_path = format!("{}/{}", path, i);
            differences += match (a, b) {
                (GroupChild::Group(a), GroupChild::Group(b)) => Self::compare_groups(a, b, output, &child_path)?,
                (GroupChild::Record(a), GroupChild::Record(b)) => Self::compare_records(a, b, output, &child_path)?,
                _ => {
                    writeln!(output, "  ⚠ {} 子元素类型不同", child_path)?;
                    1
                }
            };
        }
        Ok(differences)
    }

    /// 对比两个记录
    fn compare_records<W: Write>(original: &Record, rebuilt: &Record, output: &mut W, name: &str) -> Result<usize, EspError> {
        let mut differences = 0;
        if original.signature != rebuilt.signature || original.form_id != rebuilt.form_id {
            writeln!(
                output,
                "  ⚠ {} 记录不匹配: {} {:08X} vs {} {:08X}",
                name, original.signature, original.form_id, rebuilt.signature, rebuilt.form_id
            )?;
            differences += 1;
        }
        if original.flags != rebuilt.flags {
            writeln!(output, "  ⚠ {} 标志位不匹配: 0x{:08X} vs 0x{:08X}", name, original.flags, rebuilt.flags)?;
            differences += 1;
        }
        if original.subrecords != rebuilt.subrecords {
            writeln!(
                output,
                "  ⚠ {} 子记录不一致: {} vs {} 个",
                name,
                original.subrecords.len(),
                rebuilt.subrecords.len()
            )?;
            differences += 1;
        }
        Ok(differences)
    }
}
