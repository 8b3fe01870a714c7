use crate::datatypes::{RecordFlags, Signature};
use crate::group::{Group, GroupType};
use crate::plugin::Plugin;
use crate::record::Record;
use crate::resolver::{ObjectId, Remapper, Resolver};
use crate::schema::{Extra, FieldValue, RecordSchema, SchemaRegistry, Value};
use std::collections::HashMap;

/// 输出结构中的组位置，标签中的 FormID 已解析
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// 顶级组
    Top(Signature),
    /// 以父记录为标签的组（世界空间、单元格、对话子组等）
    Object { group_type: i32, parent: ObjectId },
    /// 单元格块/子块，标签原样保留
    Block { group_type: i32, label: [u8; 4] },
}

impl GroupKey {
    pub fn from_group(group: &Group, resolver: &Resolver) -> Self {
        match group.group_type {
            GroupType::Top => GroupKey::Top(Signature(group.label)),
            _ => match group.label_form_id() {
                Some(form_id) => GroupKey::Object {
                    group_type: group.group_type.to_i32(),
                    parent: resolver.resolve(form_id),
                },
                None => GroupKey::Block {
                    group_type: group.group_type.to_i32(),
                    label: group.label,
                },
            },
        }
    }

    pub fn group_type(&self) -> GroupType {
        match self {
            GroupKey::Top(_) => GroupType::Top,
            GroupKey::Object { group_type, .. } | GroupKey::Block { group_type, .. } => {
                GroupType::from(*group_type)
            }
        }
    }

    /// 标签引用的父记录
    pub fn parent(&self) -> Option<&ObjectId> {
        match self {
            GroupKey::Object { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// 紧跟在父记录之后的子组（世界空间、单元格、对话）
    pub fn follows_parent(&self) -> bool {
        self.group_type().parent_signature().is_some()
    }

    /// 输出文件中的组
    pub fn to_group(&self, remapper: &Remapper) -> Result<Group, crate::utils::EspError> {
        let label = match self {
            GroupKey::Top(signature) => signature.0,
            GroupKey::Object { parent, .. } => remapper.to_local(parent)?.to_le_bytes(),
            GroupKey::Block { label, .. } => *label,
        };
        Ok(Group::new(label, self.group_type()))
    }
}

/// 一个字段组的值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// 结构中的一个元素
    Field(FieldValue),
    /// 记录标志（不含压缩位）
    Flags(u32),
    /// 结构中未描述的子记录
    Extras(Vec<Extra>),
    /// 无结构描述的记录的全部数据
    Data(Vec<u8>),
}

impl Part {
    /// 是否原样保留了源文件的字节（其中的 FormID 没有解析）
    pub fn is_raw(&self) -> bool {
        match self {
            Part::Field(value) => value.has_raw(),
            Part::Extras(extras) => !extras.is_empty(),
            Part::Data(data) => !data.is_empty(),
            Part::Flags(_) => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Part::Field(value) => value.to_string(),
            Part::Flags(flags) => format!("{:08X}", flags),
            Part::Extras(extras) => {
                let names: Vec<String> = extras.iter().map(|e| e.subrecord.signature.to_string()).collect();
                format!("<{}>", names.join(" "))
            }
            Part::Data(data) => format!("<{} bytes, crc {:08X}>", data.len(), crc32fast::hash(data)),
        }
    }

    fn rows(&self) -> Option<&[Vec<Value>]> {
        match self {
            Part::Field(FieldValue::List(rows)) => Some(rows),
            Part::Field(FieldValue::Absent) => Some(&[]),
            _ => None,
        }
    }
}

/// 字段组名称：结构元素 + flags + extras；无结构的记录为 flags + data
pub fn part_names(schema: Option<&RecordSchema>) -> Vec<&'static str> {
    match schema {
        Some(schema) => schema
            .elements
            .iter()
            .map(|e| e.name)
            .chain(["flags", "extras"])
            .collect(),
        None => vec!["flags", "data"],
    }
}

/// 某个文件中的一个记录版本
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// 输入文件序号
    pub file: usize,
    /// 源记录（用于输出记录头部）
    pub record: Record,
    pub parts: Vec<Part>,
    /// 外层组在前
    pub placement: Vec<GroupKey>,
    /// 全部字段组的校验和
    pub fingerprint: u32,
    pub editor_id: Option<String>,
    /// 合并并集列表时，该版本缺少的基础条目视为删除
    pub removes_entries: bool,
}

impl Snapshot {
    /// 解码并解析记录中的引用
    pub fn capture(
        plugin: &Plugin,
        file: usize,
        record: &Record,
        resolver: &Resolver,
        placement: Vec<GroupKey>,
    ) -> Self {
        let flags = record.flags & !RecordFlags::COMPRESSED.bits();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&flags.to_le_bytes());

        let parts = match plugin.decode(record) {
            Some(mut fields) => {
                fields.resolve(resolver);
                hasher.update(&fields.fingerprint().to_le_bytes());
                let mut parts: Vec<Part> = fields.fields.into_iter().map(Part::Field).collect();
                parts.push(Part::Flags(flags));
                parts.push(Part::Extras(fields.extras));
                parts
            }
            None => {
                // 原始字节中的 FormID 依赖文件的主文件列表
                hasher.update(&record.checksum.to_le_bytes());
                for master in resolver.masters() {
                    hasher.update(master.as_str().to_lowercase().as_bytes());
                }
                vec![Part::Flags(flags), Part::Data(record.raw_data.clone())]
            }
        };

        let editor_id = record.get_editor_id();
        let mut stripped = record.clone();
        stripped.subrecords.clear();
        stripped.raw_data.clear();
        stripped.original_compressed_data = None;

        Snapshot {
            file,
            record: stripped,
            parts,
            placement,
            fingerprint: hasher.finalize(),
            editor_id,
            removes_entries: false,
        }
    }

    pub fn with_removals(mut self, removes_entries: bool) -> Self {
        self.removes_entries = removes_entries;
        self
    }
}

/// 合并后一个字段组的取值
#[derive(Debug, Clone)]
pub struct ResolvedPart {
    pub part: Part,
    /// 取值来源的版本序号（0 为基础版本）
    pub source: usize,
}

/// 一个字段组上的冲突
#[derive(Debug, Clone)]
pub struct PartConflict {
    pub part: usize,
    /// 修改了该字段组的版本序号
    pub editors: Vec<usize>,
    pub winner: usize,
}

/// 超出计数上限而被截断的列表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub part: usize,
    pub limit: usize,
    /// 丢弃的条目数（从末尾开始）
    pub dropped: usize,
}

/// 一个对象的合并结果
#[derive(Debug, Clone)]
pub struct Resolution {
    pub parts: Vec<ResolvedPart>,
    /// 至少一个字段组与基础版本不同
    pub changed: bool,
    pub conflicts: Vec<PartConflict>,
    pub truncated: Vec<Truncation>,
}

/// 单个对象的合并状态
#[derive(Debug, Clone)]
pub struct MergeState {
    pub id: ObjectId,
    pub signature: Signature,
    /// 记录类型已启用；未启用的只作为父记录跟踪
    pub enabled: bool,
    /// 第一个为基础版本，其余按优先级从低到高
    versions: Vec<Snapshot>,
}

impl MergeState {
    pub fn base(&self) -> &Snapshot {
        &self.versions[0]
    }

    pub fn latest(&self) -> &Snapshot {
        &self.versions[self.versions.len() - 1]
    }

    pub fn versions(&self) -> &[Snapshot] {
        &self.versions
    }

    pub fn schema(&self) -> Option<&'static RecordSchema> {
        SchemaRegistry::builtin().get(&self.signature)
    }

    pub fn editor_id(&self) -> Option<String> {
        self.versions.iter().rev().find_map(|v| v.editor_id.clone())
    }

    /// 合并所有版本
    pub fn resolve(&self) -> Resolution {
        let schema = self.schema();
        let base = self.base();
        let part_count = base.parts.len();

        // 与基础版本完全相同的版本不参与比较
        let edits: Vec<usize> = (1..self.versions.len())
            .filter(|&i| self.versions[i].fingerprint != base.fingerprint)
            .collect();

        let mut parts = Vec::with_capacity(part_count);
        let mut conflicts = Vec::new();
        let mut truncated = Vec::new();
        let mut changed = false;

        for index in 0..part_count {
            let base_part = &base.parts[index];
            let union = schema.map(|s| s.is_union(index)).unwrap_or(false);
            let limit = schema.and_then(|s| s.row_limit(index));

            let merged = union.then(|| self.merge_union(index, &edits, limit)).flatten();
            let resolved = match merged {
                Some((resolved, truncation)) => {
                    truncated.extend(truncation);
                    resolved
                }
                None => {
                    let editors: Vec<usize> = edits
                        .iter()
                        .copied()
                        .filter(|&i| self.part(i, index) != Some(base_part))
                        .collect();

                    match editors.last() {
                        Some(&winner) => {
                            let mut distinct: Vec<&Part> = Vec::new();
                            for &editor in &editors {
                                if let Some(part) = self.part(editor, index) {
                                    if !distinct.contains(&part) {
                                        distinct.push(part);
                                    }
                                }
                            }
                            if distinct.len() > 1 {
                                conflicts.push(PartConflict {
                                    part: index,
                                    editors: editors.clone(),
                                    winner,
                                });
                            }
                            ResolvedPart {
                                part: self.part(winner, index).cloned().unwrap_or_else(|| base_part.clone()),
                                source: winner,
                            }
                        }
                        None => ResolvedPart {
                            part: base_part.clone(),
                            source: 0,
                        },
                    }
                }
            };

            if &resolved.part != base_part {
                changed = true;
            }
            parts.push(resolved);
        }

        Resolution {
            parts,
            changed,
            conflicts,
            truncated,
        }
    }

    fn part(&self, version: usize, index: usize) -> Option<&Part> {
        self.versions.get(version).and_then(|v| v.parts.get(index))
    }

    /// 列表并集：基础条目加上各版本按优先级新增的条目（去重）
    ///
    /// 只有允许删除的版本缺少的基础条目才会被移除。结果超过计数上限时保留前面的条目。
    fn merge_union(
        &self,
        index: usize,
        edits: &[usize],
        limit: Option<usize>,
    ) -> Option<(ResolvedPart, Option<Truncation>)> {
        let base_rows = self.part(0, index)?.rows()?;
        let mut removed: Vec<&Vec<Value>> = Vec::new();
        let mut added: Vec<&Vec<Value>> = Vec::new();
        let mut source = 0;

        for &version in edits {
            let rows = self.part(version, index)?.rows()?;
            let mut touched = false;
            if self.versions[version].removes_entries {
                for row in base_rows {
                    if !rows.contains(row) && !removed.contains(&row) {
                        removed.push(row);
                        touched = true;
                    }
                }
            }
            for row in rows {
                if !base_rows.contains(row) {
                    touched = true;
                    if !added.contains(&row) {
                        added.push(row);
                    }
                }
            }
            if touched {
                source = version;
            }
        }

        let mut merged: Vec<Vec<Value>> = base_rows
            .iter()
            .filter(|row| !removed.contains(row))
            .chain(added)
            .cloned()
            .collect();
        let truncation = match limit {
            Some(limit) if merged.len() > limit => {
                let dropped = merged.len() - limit;
                merged.truncate(limit);
                Some(Truncation {
                    part: index,
                    limit,
                    dropped,
                })
            }
            _ => None,
        };
        let part = if merged.is_empty() {
            Part::Field(FieldValue::Absent)
        } else {
            Part::Field(FieldValue::List(merged))
        };
        Some((ResolvedPart { part, source }, truncation))
    }
}

/// ObjectId -> 合并状态（按首次出现的顺序保存）
#[derive(Debug, Default)]
pub struct MergeTable {
    index: HashMap<ObjectId, usize>,
    states: Vec<MergeState>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn position(&self, id: &ObjectId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&MergeState> {
        self.position(id).map(|i| &self.states[i])
    }

    pub fn states(&self) -> &[MergeState] {
        &self.states
    }

    /// 加入一个版本；首次出现的版本成为基础版本
    ///
    /// 记录类型与已有版本不一致时返回错误信息，不加入。
    pub fn record(
        &mut self,
        id: ObjectId,
        signature: Signature,
        enabled: bool,
        snapshot: Snapshot,
    ) -> Result<(), String> {
        match self.index.get(&id) {
            Some(&position) => {
                let state = &mut self.states[position];
                if state.signature != signature {
                    return Err(format!(
                        "{} 已作为 {} 出现，不能再作为 {} 合并",
                        id, state.signature, signature
                    ));
                }
                state.versions.push(snapshot);
            }
            None => {
                self.index.insert(id.clone(), self.states.len());
                self.states.push(MergeState {
                    id,
                    signature,
                    enabled,
                    versions: vec![snapshot],
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PluginName;

    fn snapshot(file: usize, parts: Vec<Part>) -> Snapshot {
        let mut hasher = crc32fast::Hasher::new();
        for part in &parts {
            hasher.update(part.describe().as_bytes());
        }
        Snapshot {
            file,
            record: Record::new(Signature::new(b"FLST"), 0x800, 0),
            parts,
            placement: vec![GroupKey::Top(Signature::new(b"FLST"))],
            fingerprint: hasher.finalize(),
            editor_id: None,
            removes_entries: false,
        }
    }

    fn value(v: u32) -> Part {
        Part::Field(FieldValue::Struct(vec![Value::U32(v)]))
    }

    fn list(items: &[u32]) -> Part {
        if items.is_empty() {
            return Part::Field(FieldValue::Absent);
        }
        Part::Field(FieldValue::List(items.iter().map(|v| vec![Value::U32(*v)]).collect()))
    }

    fn table(versions: Vec<Snapshot>) -> MergeState {
        let mut table = MergeTable::new();
        let id = ObjectId::new("Base.esm", 0x800);
        for version in versions {
            table.record(id.clone(), Signature::new(b"TEST"), true, version).unwrap();
        }
        table.get(&id).unwrap().clone()
    }

    #[test]
    fn test_last_editor_wins_with_conflict() {
        let state = table(vec![
            snapshot(0, vec![value(1)]),
            snapshot(1, vec![value(2)]),
            snapshot(2, vec![value(3)]),
        ]);
        let resolution = state.resolve();
        assert!(resolution.changed);
        assert_eq!(resolution.parts[0].part, value(3));
        assert_eq!(resolution.conflicts.len(), 1);
        assert_eq!(resolution.conflicts[0].editors, vec![1, 2]);
        assert_eq!(resolution.conflicts[0].winner, 2);
    }

    #[test]
    fn test_same_value_is_not_a_conflict() {
        let state = table(vec![
            snapshot(0, vec![value(1)]),
            snapshot(1, vec![value(2)]),
            snapshot(2, vec![value(2)]),
        ]);
        let resolution = state.resolve();
        assert!(resolution.conflicts.is_empty());
        assert_eq!(resolution.parts[0].part, value(2));
    }

    #[test]
    fn test_revert_to_base_keeps_earlier_edit() {
        let state = table(vec![
            snapshot(0, vec![value(1)]),
            snapshot(1, vec![value(2)]),
            snapshot(2, vec![value(1)]),
        ]);
        let resolution = state.resolve();
        assert_eq!(resolution.parts[0].part, value(2));
        assert_eq!(resolution.parts[0].source, 1);
        assert!(resolution.conflicts.is_empty());
    }

    #[test]
    fn test_unchanged_object() {
        let state = table(vec![snapshot(0, vec![value(1)]), snapshot(1, vec![value(1)])]);
        let resolution = state.resolve();
        assert!(!resolution.changed);
    }

    /// 只有一个列表字段不同的各版本，返回合并状态和列表字段序号
    fn union_state(
        signature: &[u8; 4],
        field: &str,
        versions: &[(&[u32], bool)],
    ) -> (MergeState, usize) {
        let signature = Signature::new(signature);
        let schema = SchemaRegistry::builtin().get(&signature).unwrap();
        let index = schema.index_of(field).unwrap();
        let mut table = MergeTable::new();
        let id = ObjectId::new("Base.esm", 0x800);
        for (file, (items, removes)) in versions.iter().enumerate() {
            let mut parts: Vec<Part> = (0..schema.elements.len())
                .map(|_| Part::Field(FieldValue::Absent))
                .collect();
            parts[index] = list(items);
            parts.push(Part::Flags(0));
            parts.push(Part::Extras(Vec::new()));
            let version = snapshot(file, parts).with_removals(*removes);
            table.record(id.clone(), signature, true, version).unwrap();
        }
        (table.get(&id).unwrap().clone(), index)
    }

    #[test]
    fn test_union_merge_is_additive() {
        // File2 没有条目 1，但未允许删除
        let (state, lnam) = union_state(
            b"FLST",
            "LNAM",
            &[(&[1, 2][..], false), (&[1, 2, 3][..], false), (&[2, 4, 3][..], false)],
        );
        let resolution = state.resolve();
        assert!(resolution.conflicts.is_empty());
        assert!(resolution.truncated.is_empty());
        assert_eq!(resolution.parts[lnam].part, list(&[1, 2, 3, 4]));
        assert_eq!(resolution.parts[lnam].source, 2);
    }

    #[test]
    fn test_union_removal_needs_opt_in() {
        let (state, lnam) = union_state(
            b"FLST",
            "LNAM",
            &[(&[1, 2][..], false), (&[1, 2, 3][..], false), (&[2, 4, 3][..], true)],
        );
        assert_eq!(state.resolve().parts[lnam].part, list(&[2, 3, 4]));

        // 只删除、不新增的旧版本列表不改变结果
        let (state, lnam) = union_state(b"FLST", "LNAM", &[(&[1, 2][..], false), (&[1][..], false)]);
        let resolution = state.resolve();
        assert_eq!(resolution.parts[lnam].part, list(&[1, 2]));
        assert!(!resolution.changed);
    }

    #[test]
    fn test_union_truncated_at_counter_limit() {
        let base: Vec<u32> = (0..200).collect();
        let first: Vec<u32> = (0..250).collect();
        let second: Vec<u32> = (0..200).chain(300..350).collect();
        let (state, lvlo) = union_state(
            b"LVLI",
            "LVLO",
            &[(&base[..], false), (&first[..], false), (&second[..], false)],
        );
        let resolution = state.resolve();
        assert_eq!(
            resolution.truncated,
            vec![Truncation {
                part: lvlo,
                limit: 255,
                dropped: 45,
            }]
        );
        let expected: Vec<u32> = (0..250).chain(300..305).collect();
        assert_eq!(resolution.parts[lvlo].part, list(&expected));
    }

    #[test]
    fn test_signature_mismatch_rejected() {
        let mut table = MergeTable::new();
        let id = ObjectId::new(PluginName::new("Base.esm"), 0x800);
        table
            .record(id.clone(), Signature::new(b"WEAP"), true, snapshot(0, vec![value(1)]))
            .unwrap();
        assert!(table
            .record(id, Signature::new(b"ARMO"), true, snapshot(1, vec![value(1)]))
            .is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_group_key_roundtrip() {
        let resolver = Resolver::for_plugin("Mod.esp".into(), vec![PluginName::new("Skyrim.esm")]);
        let group = Group::new(0x0000_3C5Fu32.to_le_bytes(), GroupType::CellChildren);
        let key = GroupKey::from_group(&group, &resolver);
        assert_eq!(key.parent(), Some(&ObjectId::new("Skyrim.esm", 0x3C5F)));
        assert!(key.follows_parent());

        let remapper = Remapper::new("Patch.esp".into(), vec![PluginName::new("Skyrim.esm")]).unwrap();
        assert_eq!(key.to_group(&remapper).unwrap().label, 0x0000_3C5Fu32.to_le_bytes());

        let block = Group::new(3i32.to_le_bytes(), GroupType::InteriorCellBlock);
        assert!(!GroupKey::from_group(&block, &resolver).follows_parent());
    }
}
