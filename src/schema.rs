//! 记录结构描述
//!
//! 每种记录类型对应一个 [`RecordSchema`]，由若干有序的 [`Element`] 组成。
//! 元素描述一个或一组子记录的布局，解码和编码都由同一份描述驱动。

mod codec;
mod definitions;
mod registry;
mod value;

pub use codec::{decode_record, encode_record, CodecOptions, DecodeContext};
pub use registry::SchemaRegistry;
pub use value::{Extra, FieldSet, FieldValue, FormRef, TextValue, Value};

use crate::datatypes::Signature;

/// 结构体字段的基础类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    /// 局部 FormID，解码为引用
    FormId,
    /// 固定长度字节块
    Bytes(usize),
    /// 子记录剩余的全部字节（只能作为最后一个字段）
    Remaining,
}

impl Primitive {
    /// 固定宽度，`Remaining` 返回 None
    pub fn width(&self) -> Option<usize> {
        match self {
            Primitive::U8 | Primitive::I8 => Some(1),
            Primitive::U16 | Primitive::I16 => Some(2),
            Primitive::U32 | Primitive::I32 | Primitive::F32 | Primitive::FormId => Some(4),
            Primitive::Bytes(len) => Some(*len),
            Primitive::Remaining => None,
        }
    }
}

/// 结构体字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: Primitive,
}

impl FieldDef {
    pub const fn new(name: &'static str, kind: Primitive) -> Self {
        FieldDef { name, kind }
    }
}

/// 字符串子记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// 以 NULL 结尾的文本
    ZString,
    /// 本地化插件中为4字节字符串表ID，否则同 ZString
    LString,
}

/// 重复块的存储方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// 所有条目连续存放在一个子记录中
    Packed,
    /// 每个条目一个子记录
    PerSubrecord,
}

/// 重复块的计数方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    /// 由数据长度推出
    Implicit,
    /// 由前置计数子记录给出
    Counter { signature: Signature, width: Primitive },
}

impl Count {
    /// 计数字段能表示的最大条目数
    pub fn max_rows(&self) -> Option<usize> {
        match self {
            Count::Implicit => None,
            Count::Counter { width, .. } => Some(match width {
                Primitive::U8 => u8::MAX as usize,
                Primitive::U16 => u16::MAX as usize,
                _ => u32::MAX as usize,
            }),
        }
    }
}

/// 条件元素的出现条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// 标记子记录之后的子记录属于该组，直到遇到组外的子记录
    Marker(Signature),
    /// 前面某个结构体字段的标志位
    Flag {
        element: &'static str,
        field: usize,
        mask: u32,
        when_set: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Struct {
        signature: Signature,
        fields: Vec<FieldDef>,
    },
    String {
        signature: Signature,
        kind: StringKind,
    },
    Repeating {
        signature: Signature,
        fields: Vec<FieldDef>,
        packing: Packing,
        count: Count,
    },
    Conditional {
        presence: Presence,
        elements: Vec<Element>,
    },
}

/// 一个字段元素，名称同时作为合并时的字段组名
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: &'static str,
    pub kind: ElementKind,
}

impl Element {
    pub fn structure(name: &'static str, signature: &[u8; 4], fields: Vec<FieldDef>) -> Self {
        Element {
            name,
            kind: ElementKind::Struct {
                signature: Signature::new(signature),
                fields,
            },
        }
    }

    /// 单个 FormID 字段的子记录
    pub fn form_id(name: &'static str, signature: &[u8; 4]) -> Self {
        Self::structure(name, signature, vec![FieldDef::new("form", Primitive::FormId)])
    }

    /// 不解释内容的子记录
    pub fn blob(name: &'static str, signature: &[u8; 4]) -> Self {
        Self::structure(name, signature, vec![FieldDef::new("data", Primitive::Remaining)])
    }

    pub fn zstring(name: &'static str, signature: &[u8; 4]) -> Self {
        Element {
            name,
            kind: ElementKind::String {
                signature: Signature::new(signature),
                kind: StringKind::ZString,
            },
        }
    }

    pub fn lstring(name: &'static str, signature: &[u8; 4]) -> Self {
        Element {
            name,
            kind: ElementKind::String {
                signature: Signature::new(signature),
                kind: StringKind::LString,
            },
        }
    }

    pub fn list(
        name: &'static str,
        signature: &[u8; 4],
        fields: Vec<FieldDef>,
        packing: Packing,
        count: Count,
    ) -> Self {
        Element {
            name,
            kind: ElementKind::Repeating {
                signature: Signature::new(signature),
                fields,
                packing,
                count,
            },
        }
    }

    pub fn marker_group(name: &'static str, marker: &[u8; 4], elements: Vec<Element>) -> Self {
        Element {
            name,
            kind: ElementKind::Conditional {
                presence: Presence::Marker(Signature::new(marker)),
                elements,
            },
        }
    }

    pub fn flag_group(name: &'static str, presence: Presence, elements: Vec<Element>) -> Self {
        Element {
            name,
            kind: ElementKind::Conditional { presence, elements },
        }
    }

    /// 直接承载数据的子记录签名（条件元素没有）
    pub fn signature(&self) -> Option<Signature> {
        match &self.kind {
            ElementKind::Struct { signature, .. }
            | ElementKind::String { signature, .. }
            | ElementKind::Repeating { signature, .. } => Some(*signature),
            ElementKind::Conditional { .. } => None,
        }
    }

    /// 该元素会消费的所有子记录签名（含计数和标记子记录）
    pub fn signatures(&self) -> Vec<Signature> {
        match &self.kind {
            ElementKind::Struct { signature, .. } | ElementKind::String { signature, .. } => {
                vec![*signature]
            }
            ElementKind::Repeating { signature, count, .. } => match count {
                Count::Counter { signature: counter, .. } => vec![*counter, *signature],
                Count::Implicit => vec![*signature],
            },
            ElementKind::Conditional { presence, elements } => {
                let mut sigs: Vec<Signature> = match presence {
                    Presence::Marker(marker) => vec![*marker],
                    Presence::Flag { .. } => Vec::new(),
                };
                sigs.extend(elements.iter().flat_map(|e| e.signatures()));
                sigs
            }
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, ElementKind::Repeating { .. })
    }
}

/// 一种记录类型的完整描述
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    pub signature: Signature,
    pub elements: Vec<Element>,
    /// 合并时按集合并集处理的列表字段
    pub union_fields: Vec<&'static str>,
}

impl RecordSchema {
    pub fn new(signature: &[u8; 4], elements: Vec<Element>) -> Self {
        RecordSchema {
            signature: Signature::new(signature),
            elements,
            union_fields: Vec::new(),
        }
    }

    pub fn with_union(mut self, fields: &[&'static str]) -> Self {
        self.union_fields.extend_from_slice(fields);
        self
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// 列表元素的条目数上限
    pub fn row_limit(&self, index: usize) -> Option<usize> {
        match self.elements.get(index).map(|e| &e.kind) {
            Some(ElementKind::Repeating { count, .. }) => count.max_rows(),
            _ => None,
        }
    }

    pub fn is_union(&self, index: usize) -> bool {
        self.elements
            .get(index)
            .map(|e| e.is_list() && self.union_fields.contains(&e.name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_signatures() {
        let keywords = Element::list(
            "KWDA",
            b"KWDA",
            vec![FieldDef::new("keyword", Primitive::FormId)],
            Packing::Packed,
            Count::Counter {
                signature: Signature::new(b"KSIZ"),
                width: Primitive::U32,
            },
        );
        assert_eq!(
            keywords.signatures(),
            vec![Signature::new(b"KSIZ"), Signature::new(b"KWDA")]
        );

        let male = Element::marker_group("Male", b"MNAM", vec![Element::zstring("ANAM", b"ANAM")]);
        assert_eq!(male.signature(), None);
        assert_eq!(
            male.signatures(),
            vec![Signature::new(b"MNAM"), Signature::new(b"ANAM")]
        );
    }

    #[test]
    fn test_union_lookup() {
        let schema = RecordSchema::new(
            b"FLST",
            vec![
                Element::zstring("EDID", b"EDID"),
                Element::list(
                    "LNAM",
                    b"LNAM",
                    vec![FieldDef::new("form", Primitive::FormId)],
                    Packing::PerSubrecord,
                    Count::Implicit,
                ),
            ],
        )
        .with_union(&["LNAM"]);
        assert!(schema.is_union(1));
        assert!(!schema.is_union(0));
        assert_eq!(schema.index_of("LNAM"), Some(1));
        assert_eq!(schema.row_limit(1), None);
        assert_eq!(schema.row_limit(0), None);
    }

    #[test]
    fn test_counter_limits() {
        let counter = |width| Count::Counter {
            signature: Signature::new(b"LLCT"),
            width,
        };
        assert_eq!(counter(Primitive::U8).max_rows(), Some(255));
        assert_eq!(counter(Primitive::U16).max_rows(), Some(65535));
        assert_eq!(Count::Implicit.max_rows(), None);
    }
}
