use super::config::PatchConfig;
use super::report::{IssueKind, MergeIssue};
use super::state::{GroupKey, MergeState, MergeTable, Part, Resolution};
use crate::datatypes::{RecordFlags, Signature};
use crate::group::{Group, GroupChild};
use crate::plugin::{MasterEntry, Plugin, PluginHeader};
use crate::record::Record;
use crate::resolver::{ObjectId, PluginName, Remapper};
use crate::schema::{encode_record, CodecOptions, FieldSet, FormRef};
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// 没有输入文件时使用的 HEDR 版本
const DEFAULT_VERSION: f32 = 1.71;

/// 顶级组的标准顺序
const TOP_GROUP_ORDER: &[&[u8; 4]] = &[
    b"GMST", b"KYWD", b"LCRT", b"AACT", b"TXST", b"GLOB", b"CLAS", b"FACT", b"HDPT", b"HAIR",
    b"EYES", b"RACE", b"SOUN", b"ASPC", b"MGEF", b"SCPT", b"LTEX", b"ENCH", b"SPEL", b"SCRL",
    b"ACTI", b"TACT", b"ARMO", b"BOOK", b"CONT", b"DOOR", b"INGR", b"LIGH", b"MISC", b"APPA",
    b"STAT", b"SCOL", b"MSTT", b"PWAT", b"GRAS", b"TREE", b"CLDC", b"FLOR", b"FURN", b"WEAP",
    b"AMMO", b"NPC_", b"LVLN", b"KEYM", b"ALCH", b"IDLM", b"COBJ", b"PROJ", b"HAZD", b"SLGM",
    b"LVLI", b"WTHR", b"CLMT", b"SPGD", b"RFCT", b"REGN", b"NAVI", b"CELL", b"WRLD", b"DIAL",
    b"QUST", b"IDLE", b"PACK", b"CSTY", b"LSCR", b"LVSP", b"ANIO", b"WATR", b"EFSH", b"EXPL",
    b"DEBR", b"IMGS", b"IMAD", b"FLST", b"PERK", b"BPTD", b"ADDN", b"AVIF", b"CAMS", b"CPTH",
    b"VTYP", b"MATT", b"IPCT", b"IPDS", b"ARMA", b"ECZN", b"LCTN", b"MESG", b"RGDL", b"DOBJ",
    b"LGTM", b"MUSC", b"FSTP", b"FSTS", b"SMBN", b"SMQN", b"SMEN", b"DLBR", b"MUST", b"DLVW",
    b"WOOP", b"SHOU", b"EQUP", b"RELA", b"SCEN", b"ASTP", b"OTFT", b"ARTO", b"MATO", b"MOVT",
    b"SNDR", b"DUAL", b"SNCT", b"SOPM", b"COLL", b"CLFM", b"REVB",
];

/// 输出生成的输入
pub(crate) struct EmitInput<'a> {
    pub table: &'a MergeTable,
    /// 与 table 中的状态一一对应
    pub resolutions: &'a [Resolution],
    /// 参与合并的文件，按优先级
    pub files: &'a [&'a Plugin],
    pub config: &'a PatchConfig,
}

pub(crate) struct Emitted {
    pub plugin: Plugin,
    /// 输出的已修改记录数（不含只作为父记录带上的）
    pub changed: usize,
    pub issues: Vec<MergeIssue>,
}

/// 输出中的一个组节点
#[derive(Default)]
struct Node {
    records: Vec<(ObjectId, Record)>,
    children: BTreeMap<GroupKey, Node>,
}

struct Prepared<'a> {
    state: &'a MergeState,
    resolution: &'a Resolution,
    /// 只作为嵌套记录的父记录输出
    forced: bool,
}

impl Prepared<'_> {
    fn placement(&self) -> Vec<GroupKey> {
        let placement = &self.state.latest().placement;
        if placement.is_empty() {
            vec![GroupKey::Top(self.state.signature)]
        } else {
            placement.clone()
        }
    }

    fn raw_sources(&self) -> impl Iterator<Item = usize> + '_ {
        self.resolution
            .parts
            .iter()
            .filter(|p| p.part.is_raw())
            .map(|p| self.state.versions()[p.source].file)
    }

    /// 原样保留了数据、且主文件顺序与输出不一致的文件（去重）
    fn unmappable_sources(&self, mappable: impl Fn(usize) -> bool) -> Vec<usize> {
        let mut files: Vec<usize> = self.raw_sources().filter(|&file| !mappable(file)).collect();
        files.sort_unstable();
        files.dedup();
        files
    }
}

/// 生成补丁插件
pub(crate) fn emit(input: &EmitInput<'_>, selected: &[usize]) -> Result<Emitted, EspError> {
    let config = input.config;
    let output_name = config.output_name();
    let mut issues = Vec::new();

    let prepared = include_parents(input, selected, &mut issues);
    let masters = output_masters(input, &prepared, &output_name)?;
    let remapper = Remapper::new(output_name.clone(), masters.clone())?;

    let localized = prepared.iter().any(|p| {
        p.resolution.parts.iter().any(|r| match &r.part {
            Part::Field(value) => value.has_localized_text(),
            _ => false,
        })
    });
    let options = CodecOptions {
        localized,
        encoding: config.encoding,
    };

    let mut root: BTreeMap<GroupKey, Node> = BTreeMap::new();
    let mut changed = 0;
    for item in &prepared {
        let state = item.state;
        let subrecords = match build_subrecords(item, &remapper, options) {
            Ok(subrecords) => subrecords,
            Err(e) => {
                tracing::warn!(object = %state.id, error = %e, "合并结果无法编码，跳过");
                issues.push(MergeIssue {
                    kind: IssueKind::EncodeFailed,
                    object: Some(state.id.clone()),
                    file: None,
                    message: e.to_string(),
                });
                continue;
            }
        };

        let unmappable =
            item.unmappable_sources(|file| remapper.is_identity_for(&input.files[file].resolver()));
        for file in unmappable {
            issues.push(MergeIssue {
                kind: IssueKind::UnmappableData,
                object: Some(state.id.clone()),
                file: Some(input.files[file].name.to_string()),
                message: "原样保留的数据中的 FormID 未重映射".to_string(),
            });
        }

        let latest = state.latest();
        let flags = item
            .resolution
            .parts
            .iter()
            .find_map(|p| match p.part {
                Part::Flags(flags) => Some(flags),
                _ => None,
            })
            .unwrap_or(latest.record.flags & !RecordFlags::COMPRESSED.bits());

        let mut record = latest.record.clone();
        record.form_id = remapper.to_local(&state.id)?;
        record.flags = flags;
        if config.compress && latest.record.is_compressed() {
            record.flags |= RecordFlags::COMPRESSED.bits();
        }
        record.set_subrecords(subrecords);

        let placement = item.placement();
        let Some((first, rest)) = placement.split_first() else {
            continue;
        };
        node_at(&mut root, first, rest).records.push((state.id.clone(), record));
        if !item.forced {
            changed += 1;
        }
    }

    let mut tops: Vec<(GroupKey, Node)> = root.into_iter().collect();
    tops.sort_by_key(|(key, _)| top_rank(key));
    let mut groups = Vec::with_capacity(tops.len());
    for (key, node) in tops {
        groups.push(build_group(&key, node, &remapper)?);
    }

    let header = build_header(input, &masters, localized, changed);
    let mut plugin = Plugin::new_empty(&config.patch_name, header);
    plugin.encoding = config.encoding;
    plugin.groups = groups;
    let count = plugin.records().count() + plugin.count_total_groups();
    plugin.header.set_num_records(count as u32);

    tracing::info!(
        changed,
        records = count,
        masters = masters.len(),
        localized,
        "补丁内容已生成"
    );

    Ok(Emitted {
        plugin,
        changed,
        issues,
    })
}

/// 嵌套记录需要父记录（CELL/WRLD/DIAL）一起输出
fn include_parents<'a>(
    input: &EmitInput<'a>,
    selected: &[usize],
    issues: &mut Vec<MergeIssue>,
) -> Vec<Prepared<'a>> {
    let states = input.table.states();
    let mut order: Vec<(usize, bool)> = selected.iter().map(|&i| (i, false)).collect();
    let mut included: HashSet<usize> = selected.iter().copied().collect();
    let mut missing: BTreeSet<ObjectId> = BTreeSet::new();

    let mut cursor = 0;
    while cursor < order.len() {
        let (index, _) = order[cursor];
        cursor += 1;
        for key in &states[index].latest().placement {
            let Some(parent) = key.parent().filter(|_| key.follows_parent()) else {
                continue;
            };
            match input.table.position(parent) {
                Some(position) => {
                    if included.insert(position) {
                        order.push((position, true));
                    }
                }
                None => {
                    if missing.insert(parent.clone()) {
                        issues.push(MergeIssue {
                            kind: IssueKind::MissingParent,
                            object: Some(parent.clone()),
                            file: None,
                            message: format!("{} 的父记录不在任何输入文件中", states[index].id),
                        });
                    }
                }
            }
        }
    }

    order
        .into_iter()
        .map(|(index, forced)| Prepared {
            state: &states[index],
            resolution: &input.resolutions[index],
            forced,
        })
        .collect()
}

/// 输出的主文件：被引用到的输入文件，按优先级排列
fn output_masters(
    input: &EmitInput<'_>,
    prepared: &[Prepared<'_>],
    output_name: &PluginName,
) -> Result<Vec<PluginName>, EspError> {
    let mut referenced: BTreeSet<PluginName> = BTreeSet::new();
    for item in prepared {
        referenced.insert(item.state.id.origin.clone());
        for key in &item.state.latest().placement {
            if let Some(parent) = key.parent() {
                referenced.insert(parent.origin.clone());
            }
        }
        for resolved in &item.resolution.parts {
            if let Part::Field(value) = &resolved.part {
                for reference in value.refs() {
                    if let FormRef::Resolved(id) = reference {
                        referenced.insert(id.origin.clone());
                    }
                }
            }
        }
        // 原样保留的字节按源文件的主文件列表解释
        for file in item.raw_sources() {
            let plugin = input.files[file];
            referenced.insert(plugin.name.clone());
            referenced.extend(plugin.master_names());
        }
    }
    referenced.remove(output_name);

    let masters: Vec<PluginName> = input
        .files
        .iter()
        .map(|plugin| plugin.name.clone())
        .filter(|name| referenced.contains(name))
        .collect();

    if let Some(unknown) = referenced.iter().find(|name| !masters.contains(name)) {
        return Err(EspError::UnresolvedMaster {
            plugin: output_name.to_string(),
            master: unknown.to_string(),
        });
    }
    Ok(masters)
}

fn build_subrecords(
    item: &Prepared<'_>,
    remapper: &Remapper,
    options: CodecOptions,
) -> Result<Vec<Subrecord>, EspError> {
    let state = item.state;
    let parts = &item.resolution.parts;

    match state.schema() {
        Some(schema) => {
            let count = schema.elements.len();
            let mut fields = FieldSet::new(state.signature, count);
            for (index, resolved) in parts.iter().enumerate() {
                match &resolved.part {
                    Part::Field(value) if index < count => fields.set(index, value.clone()),
                    Part::Extras(extras) => fields.extras = extras.clone(),
                    _ => {}
                }
            }
            fields.remap(remapper)?;
            encode_record(schema, &fields, options)
        }
        None => {
            let data = parts
                .iter()
                .find_map(|p| match &p.part {
                    Part::Data(data) => Some(data.as_slice()),
                    _ => None,
                })
                .unwrap_or(&[]);
            Ok(Record::parse_subrecords(data)?.0)
        }
    }
}

fn node_at<'n>(
    root: &'n mut BTreeMap<GroupKey, Node>,
    first: &GroupKey,
    rest: &[GroupKey],
) -> &'n mut Node {
    let mut node = root.entry(first.clone()).or_default();
    for key in rest {
        node = node.children.entry(key.clone()).or_default();
    }
    node
}

fn top_rank(key: &GroupKey) -> (usize, Option<Signature>) {
    match key {
        GroupKey::Top(signature) => {
            let rank = TOP_GROUP_ORDER
                .iter()
                .position(|s| *s == signature.as_bytes())
                .unwrap_or(TOP_GROUP_ORDER.len());
            (rank, Some(*signature))
        }
        _ => (usize::MAX, None),
    }
}

/// 记录按输出 FormID 排序，父记录的子组紧跟其后，其余子组按键排序
fn build_group(key: &GroupKey, node: Node, remapper: &Remapper) -> Result<Group, EspError> {
    let mut group = key.to_group(remapper)?;
    let Node {
        mut records,
        mut children,
    } = node;
    records.sort_by_key(|(_, record)| record.form_id);

    for (id, record) in records {
        group.children.push(GroupChild::Record(record));
        let attached: Vec<GroupKey> = children
            .keys()
            .filter(|k| k.follows_parent() && k.parent() == Some(&id))
            .cloned()
            .collect();
        for child_key in attached {
            if let Some(child) = children.remove(&child_key) {
                let subgroup = build_group(&child_key, child, remapper)?;
                group.children.push(GroupChild::Group(Box::new(subgroup)));
            }
        }
    }

    for (child_key, child) in children {
        let subgroup = build_group(&child_key, child, remapper)?;
        group.children.push(GroupChild::Group(Box::new(subgroup)));
    }
    Ok(group)
}

fn build_header(
    input: &EmitInput<'_>,
    masters: &[PluginName],
    localized: bool,
    changed: usize,
) -> PluginHeader {
    let config = input.config;
    let version = input
        .files
        .iter()
        .map(|plugin| plugin.header.version())
        .fold(None, |max: Option<f32>, v| Some(max.map_or(v, |m| m.max(v))))
        .unwrap_or(DEFAULT_VERSION);

    let mut description = String::new();
    if !config.description.is_empty() {
        description.push_str(&config.description);
        description.push_str("\n\n");
    }
    description.push_str(&format!("Records Changed: {}", changed));
    if config.flag_light {
        description.push_str("\nThis patch is ESL-flagged to save a load order slot.");
    }

    let mut header = PluginHeader::new(version);
    header.set_encoding(config.encoding);
    if !config.author.is_empty() {
        header.set_author(Some(config.author.clone()));
    }
    header.set_description(Some(description));
    header.set_masters(
        masters
            .iter()
            .map(|name| MasterEntry {
                name: name.to_string(),
                size: 0,
            })
            .collect(),
    );
    header.set_flag(RecordFlags::LOCALIZED, localized);
    header.set_flag(RecordFlags::LIGHT_MASTER, config.flag_light);
    header
}
