use crate::datatypes::{read_i32, read_signature, read_u16, read_u32, remaining_len, Signature};
use crate::record::Record;
use crate::utils::{EspError, ParseWarning};
use std::collections::HashSet;
use std::io::Cursor;

/// 组头部大小
pub const GROUP_HEADER_SIZE: usize = 24;

/// 组签名
pub const GRUP: Signature = Signature::new(b"GRUP");

/// 组大小上限（超过视为损坏）
const MAX_GROUP_SIZE: u32 = 200_000_000;

/// 组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    /// 顶级组，标签为记录类型
    Top,
    /// 世界空间子组，标签为 WRLD FormID
    WorldChildren,
    /// 室内单元格块，标签为块编号
    InteriorCellBlock,
    /// 室内单元格子块，标签为子块编号
    InteriorCellSubBlock,
    /// 室外单元格块，标签为网格坐标 (Y, X)
    ExteriorCellBlock,
    /// 室外单元格子块，标签为网格坐标 (Y, X)
    ExteriorCellSubBlock,
    /// 单元格子组，标签为 CELL FormID
    CellChildren,
    /// 对话主题子组，标签为 DIAL FormID
    TopicChildren,
    /// 单元格持久引用
    CellPersistentChildren,
    /// 单元格临时引用
    CellTemporaryChildren,
    /// 单元格远景引用
    CellVisibleDistantChildren,
    /// 未知类型
    Unknown(i32),
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(&self) -> i32 {
        match self {
            GroupType::Top => 0,
            GroupType::WorldChildren => 1,
            GroupType::InteriorCellBlock => 2,
            GroupType::InteriorCellSubBlock => 3,
            GroupType::ExteriorCellBlock => 4,
            GroupType::ExteriorCellSubBlock => 5,
            GroupType::CellChildren => 6,
            GroupType::TopicChildren => 7,
            GroupType::CellPersistentChildren => 8,
            GroupType::CellTemporaryChildren => 9,
            GroupType::CellVisibleDistantChildren => 10,
            GroupType::Unknown(value) => *value,
        }
    }

    /// 标签是否为 FormID
    pub fn label_is_form_id(&self) -> bool {
        matches!(
            self,
            GroupType::WorldChildren
                | GroupType::CellChildren
                | GroupType::TopicChildren
                | GroupType::CellPersistentChildren
                | GroupType::CellTemporaryChildren
                | GroupType::CellVisibleDistantChildren
        )
    }

    /// 紧跟在父记录之后的子组，返回父记录类型
    pub fn parent_signature(&self) -> Option<Signature> {
        match self {
            GroupType::WorldChildren => Some(Signature::new(b"WRLD")),
            GroupType::CellChildren => Some(Signature::new(b"CELL")),
            GroupType::TopicChildren => Some(Signature::new(b"DIAL")),
            _ => None,
        }
    }
}

impl From<i32> for GroupType {
    fn from(value: i32) -> Self {
        match value {
            0 => GroupType::Top,
            1 => GroupType::WorldChildren,
            2 => GroupType::InteriorCellBlock,
            3 => GroupType::InteriorCellSubBlock,
            4 => GroupType::ExteriorCellBlock,
            5 => GroupType::ExteriorCellSubBlock,
            6 => GroupType::CellChildren,
            7 => GroupType::TopicChildren,
            8 => GroupType::CellPersistentChildren,
            9 => GroupType::CellTemporaryChildren,
            10 => GroupType::CellVisibleDistantChildren,
            _ => GroupType::Unknown(value),
        }
    }
}

/// 组结构
#[derive(Debug, Clone)]
pub struct Group {
    /// 组大小(包含头部24字节，读取时的原始值)
    pub size: u32,
    /// 标签
    pub label: [u8; 4],
    /// 组类型
    pub group_type: GroupType,
    /// 时间戳
    pub timestamp: u16,
    /// 版本控制信息
    pub version_control_info: u16,
    /// 未知字段
    pub unknown: u32,
    /// 子元素
    pub children: Vec<GroupChild>,
}

/// 组子元素
#[derive(Debug, Clone)]
pub enum GroupChild {
    /// 子组
    Group(Box<Group>),
    /// 记录
    Record(Record),
}

/// 组解析上下文
pub(crate) struct GroupParseContext<'a> {
    /// 当前游标在文件中的起始偏移
    pub base_offset: u64,
    /// 只保留这些类型的记录
    pub filter: Option<&'a HashSet<Signature>>,
    pub warnings: Vec<ParseWarning>,
}

impl<'a> GroupParseContext<'a> {
    pub fn new(base_offset: u64, filter: Option<&'a HashSet<Signature>>) -> Self {
        GroupParseContext {
            base_offset,
            filter,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, offset: u64, signature: Option<Signature>, message: String) {
        tracing::warn!(offset, signature = ?signature, "{}", message);
        self.warnings.push(ParseWarning {
            offset,
            signature,
            form_id: None,
            message,
        });
    }
}

impl Group {
    /// 创建空组
    pub fn new(label: [u8; 4], group_type: GroupType) -> Self {
        Group {
            size: GROUP_HEADER_SIZE as u32,
            label,
            group_type,
            timestamp: 0,
            version_control_info: 0,
            unknown: 0,
            children: Vec::new(),
        }
    }

    /// 创建顶级组
    pub fn top(signature: Signature) -> Self {
        Self::new(signature.0, GroupType::Top)
    }

    /// 解析组（不过滤，损坏的分支被截断）
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let mut ctx = GroupParseContext::new(0, None);
        Self::parse_with(cursor, &mut ctx)
    }

    /// 解析组
    ///
    /// 头部损坏时返回错误；内容中途截断时关闭该分支并记录警告，
    /// 游标移动到声明的组结尾（或数据结尾）。
    pub(crate) fn parse_with(
        cursor: &mut Cursor<&[u8]>,
        ctx: &mut GroupParseContext<'_>,
    ) -> Result<Self, EspError> {
        let start = cursor.position();
        let offset = ctx.base_offset + start;

        // 检查是否有足够的数据读取头部
        if remaining_len(cursor) < GROUP_HEADER_SIZE {
            return Err(EspError::TruncatedRecord {
                signature: GRUP,
                offset,
                declared: GROUP_HEADER_SIZE as u64,
                available: remaining_len(cursor) as u64,
            });
        }

        let signature = read_signature(cursor)?;
        if signature != GRUP {
            return Err(EspError::InvalidFormat(format!(
                "在位置 {} 期望 GRUP，但找到 {}",
                offset, signature
            )));
        }

        let size = read_u32(cursor)?;
        if !(GROUP_HEADER_SIZE as u32..=MAX_GROUP_SIZE).contains(&size) {
            return Err(EspError::InvalidFormat(format!(
                "在位置 {} 发现异常组大小: {} bytes",
                offset, size
            )));
        }

        let mut label = [0u8; 4];
        label.copy_from_slice(&read_signature(cursor)?.0);
        let group_type = GroupType::from(read_i32(cursor)?);
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let unknown = read_u32(cursor)?;

        let data = *cursor.get_ref();
        let declared_end = start as usize + size as usize;
        let data_end = if declared_end > data.len() {
            ctx.warn(
                offset,
                Some(Signature(label)),
                format!(
                    "组声明 {} 字节，但只剩 {} 字节，截断处理",
                    size,
                    data.len() - start as usize
                ),
            );
            data.len()
        } else {
            declared_end
        };

        let mut children = Vec::new();
        let mut pos = cursor.position() as usize;
        while pos < data_end {
            let child_offset = ctx.base_offset + pos as u64;
            if data_end - pos < GROUP_HEADER_SIZE {
                ctx.warn(
                    child_offset,
                    Some(Signature(label)),
                    format!("组末尾有 {} 字节无法解析，关闭该分支", data_end - pos),
                );
                break;
            }

            // 子元素限定在本组范围内解析
            let slice = &data[pos..data_end];
            let mut child_cursor = Cursor::new(slice);
            let saved_base = ctx.base_offset;
            ctx.base_offset = child_offset;

            let result = if &slice[0..4] == GRUP.as_bytes() {
                Group::parse_with(&mut child_cursor, ctx).map(|group| {
                    if ctx.filter.is_none() || !group.children.is_empty() {
                        Some(GroupChild::Group(Box::new(group)))
                    } else {
                        None
                    }
                })
            } else {
                Record::parse(&mut child_cursor).map(|record| {
                    if let Some(reason) = &record.decode_error {
                        ctx.warnings.push(ParseWarning {
                            offset: child_offset,
                            signature: Some(record.signature),
                            form_id: Some(record.form_id),
                            message: reason.clone(),
                        });
                    }
                    match ctx.filter {
                        Some(filter) if !filter.contains(&record.signature) => None,
                        _ => Some(GroupChild::Record(record)),
                    }
                })
            };
            ctx.base_offset = saved_base;

            match result {
                Ok(child) => {
                    children.extend(child);
                    pos += child_cursor.position() as usize;
                }
                Err(e) => {
                    ctx.warn(
                        child_offset,
                        Some(Signature(label)),
                        format!("组内容损坏，关闭该分支: {}", e),
                    );
                    break;
                }
            }
        }

        cursor.set_position(data_end as u64);

        Ok(Group {
            size,
            label,
            group_type,
            timestamp,
            version_control_info,
            unknown,
            children,
        })
    }

    /// 获取组标签
    pub fn get_label(&self) -> &[u8; 4] {
        &self.label
    }

    /// 获取组类型
    pub fn get_type(&self) -> &GroupType {
        &self.group_type
    }

    /// 顶级组的记录类型标签
    pub fn label_signature(&self) -> Option<Signature> {
        match self.group_type {
            GroupType::Top => Some(Signature(self.label)),
            _ => None,
        }
    }

    /// 父记录 FormID 标签
    pub fn label_form_id(&self) -> Option<u32> {
        if self.group_type.label_is_form_id() {
            Some(u32::from_le_bytes(self.label))
        } else {
            None
        }
    }

    /// 室内块/子块编号
    pub fn label_block(&self) -> Option<i32> {
        match self.group_type {
            GroupType::InteriorCellBlock | GroupType::InteriorCellSubBlock => {
                Some(i32::from_le_bytes(self.label))
            }
            _ => None,
        }
    }

    /// 室外块/子块网格坐标，返回 (X, Y)
    pub fn label_grid(&self) -> Option<(i16, i16)> {
        match self.group_type {
            GroupType::ExteriorCellBlock | GroupType::ExteriorCellSubBlock => {
                let y = i16::from_le_bytes([self.label[0], self.label[1]]);
                let x = i16::from_le_bytes([self.label[2], self.label[3]]);
                Some((x, y))
            }
            _ => None,
        }
    }

    /// 获取所有记录
    pub fn get_records(&self) -> Vec<&Record> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        records
    }

    /// 递归收集所有记录
    fn collect_records<'a>(&'a self, records: &mut Vec<&'a Record>) {
        for child in &self.children {
            match child {
                GroupChild::Group(group) => {
                    group.collect_records(records);
                }
                GroupChild::Record(record) => {
                    records.push(record);
                }
            }
        }
    }

    /// 获取组标签字符串
    pub fn get_label_string(&self) -> String {
        match self.group_type {
            GroupType::Top => String::from_utf8_lossy(&self.label).into_owned(),
            _ if self.group_type.label_is_form_id() => {
                format!("{:08X}", u32::from_le_bytes(self.label))
            }
            GroupType::ExteriorCellBlock | GroupType::ExteriorCellSubBlock => {
                let (x, y) = self.label_grid().unwrap_or_default();
                format!("({}, {})", x, y)
            }
            _ => i32::from_le_bytes(self.label).to_string(),
        }
    }
}
