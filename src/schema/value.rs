use crate::datatypes::Signature;
use crate::resolver::{ObjectId, Remapper, Resolver};
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use std::fmt;

/// FormID 引用：文件内的局部形式，或解析后的全局形式
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FormRef {
    Local(u32),
    Resolved(ObjectId),
}

impl FormRef {
    pub fn is_null(&self) -> bool {
        matches!(self, FormRef::Local(0))
    }
}

impl fmt::Display for FormRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormRef::Local(id) => write!(f, "{:08X}", id),
            FormRef::Resolved(id) => write!(f, "{}", id),
        }
    }
}

/// 结构体中的单个值
#[derive(Debug, Clone)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bytes(Vec<u8>),
    Ref(FormRef),
}

// 浮点按位比较，NaN 的原始位模式也要保持一致
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    /// 整数值（用于标志位判断）
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U8(v) => Some(*v as u32),
            Value::I8(v) => Some(*v as u8 as u32),
            Value::U16(v) => Some(*v as u32),
            Value::I16(v) => Some(*v as u16 as u32),
            Value::U32(v) => Some(*v),
            Value::I32(v) => Some(*v as u32),
            _ => None,
        }
    }

    fn feed(&self, hasher: &mut crc32fast::Hasher) {
        match self {
            Value::U8(v) => hasher.update(&[0, *v]),
            Value::I8(v) => hasher.update(&[1, *v as u8]),
            Value::U16(v) => {
                hasher.update(&[2]);
                hasher.update(&v.to_le_bytes());
            }
            Value::I16(v) => {
                hasher.update(&[3]);
                hasher.update(&v.to_le_bytes());
            }
            Value::U32(v) => {
                hasher.update(&[4]);
                hasher.update(&v.to_le_bytes());
            }
            Value::I32(v) => {
                hasher.update(&[5]);
                hasher.update(&v.to_le_bytes());
            }
            Value::F32(v) => {
                hasher.update(&[6]);
                hasher.update(&v.to_bits().to_le_bytes());
            }
            Value::Bytes(bytes) => {
                hasher.update(&[7]);
                hasher.update(&(bytes.len() as u32).to_le_bytes());
                hasher.update(bytes);
            }
            Value::Ref(FormRef::Local(id)) => {
                hasher.update(&[8]);
                hasher.update(&id.to_le_bytes());
            }
            Value::Ref(FormRef::Resolved(id)) => {
                hasher.update(&[9]);
                hasher.update(id.origin.as_str().to_lowercase().as_bytes());
                hasher.update(&id.index.to_le_bytes());
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::Bytes(bytes) => {
                for b in bytes.iter().take(16) {
                    write!(f, "{:02X}", b)?;
                }
                if bytes.len() > 16 {
                    write!(f, "..({} bytes)", bytes.len())?;
                }
                Ok(())
            }
            Value::Ref(r) => write!(f, "{}", r),
        }
    }
}

/// 文本字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextValue {
    Inline(String),
    /// 字符串表ID（本地化插件）
    Localized(u32),
}

/// 一个元素解码后的值
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldValue {
    /// 输入中不存在，编码时不输出
    #[default]
    Absent,
    Struct(Vec<Value>),
    Text(TextValue),
    List(Vec<Vec<Value>>),
    /// 条件元素内各子元素的值
    Group(Vec<FieldValue>),
    /// 无法按结构重新编码的原始子记录，原样写回
    Raw(Vec<Subrecord>),
}

impl FieldValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }

    /// 是否包含无法重映射的原始数据
    pub fn has_raw(&self) -> bool {
        match self {
            FieldValue::Raw(_) => true,
            FieldValue::Group(values) => values.iter().any(|v| v.has_raw()),
            _ => false,
        }
    }

    pub fn has_localized_text(&self) -> bool {
        match self {
            FieldValue::Text(TextValue::Localized(_)) => true,
            FieldValue::Group(values) => values.iter().any(|v| v.has_localized_text()),
            _ => false,
        }
    }

    pub fn has_inline_text(&self) -> bool {
        match self {
            FieldValue::Text(TextValue::Inline(_)) => true,
            FieldValue::Group(values) => values.iter().any(|v| v.has_inline_text()),
            _ => false,
        }
    }

    /// 对所有引用执行变换
    pub fn try_for_each_ref(
        &mut self,
        f: &mut dyn FnMut(&mut FormRef) -> Result<(), EspError>,
    ) -> Result<(), EspError> {
        match self {
            FieldValue::Struct(values) => values.iter_mut().try_for_each(|v| visit_value(v, f)),
            FieldValue::List(rows) => rows
                .iter_mut()
                .flat_map(|row| row.iter_mut())
                .try_for_each(|v| visit_value(v, f)),
            FieldValue::Group(values) => values.iter_mut().try_for_each(|v| v.try_for_each_ref(f)),
            FieldValue::Absent | FieldValue::Text(_) | FieldValue::Raw(_) => Ok(()),
        }
    }

    /// 收集所有引用
    pub fn refs(&self) -> Vec<&FormRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a FormRef>) {
        let push = |value: &'a Value, refs: &mut Vec<&'a FormRef>| {
            if let Value::Ref(r) = value {
                refs.push(r);
            }
        };
        match self {
            FieldValue::Struct(values) => values.iter().for_each(|v| push(v, refs)),
            FieldValue::List(rows) => rows.iter().flatten().for_each(|v| push(v, refs)),
            FieldValue::Group(values) => values.iter().for_each(|v| v.collect_refs(refs)),
            FieldValue::Absent | FieldValue::Text(_) | FieldValue::Raw(_) => {}
        }
    }

    pub(crate) fn feed(&self, hasher: &mut crc32fast::Hasher) {
        match self {
            FieldValue::Absent => hasher.update(&[0]),
            FieldValue::Struct(values) => {
                hasher.update(&[1, values.len() as u8]);
                values.iter().for_each(|v| v.feed(hasher));
            }
            FieldValue::Text(TextValue::Inline(text)) => {
                hasher.update(&[2]);
                hasher.update(text.as_bytes());
                hasher.update(&[0]);
            }
            FieldValue::Text(TextValue::Localized(id)) => {
                hasher.update(&[3]);
                hasher.update(&id.to_le_bytes());
            }
            FieldValue::List(rows) => {
                hasher.update(&[4]);
                hasher.update(&(rows.len() as u32).to_le_bytes());
                rows.iter().flatten().for_each(|v| v.feed(hasher));
            }
            FieldValue::Group(values) => {
                hasher.update(&[5, values.len() as u8]);
                values.iter().for_each(|v| v.feed(hasher));
            }
            FieldValue::Raw(subrecords) => {
                hasher.update(&[6]);
                for sr in subrecords {
                    hasher.update(sr.signature.as_bytes());
                    hasher.update(&(sr.data.len() as u32).to_le_bytes());
                    hasher.update(&sr.data);
                }
            }
        }
    }
}

fn visit_value(
    value: &mut Value,
    f: &mut dyn FnMut(&mut FormRef) -> Result<(), EspError>,
) -> Result<(), EspError> {
    match value {
        Value::Ref(r) => f(r),
        _ => Ok(()),
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Absent => write!(f, "<absent>"),
            FieldValue::Struct(values) => write_joined(f, values.iter(), ", ", "(", ")"),
            FieldValue::Text(TextValue::Inline(text)) => write!(f, "{:?}", text),
            FieldValue::Text(TextValue::Localized(id)) => write!(f, "<string {:08X}>", id),
            FieldValue::List(rows) => {
                write!(f, "[")?;
                for (i, row) in rows.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if row.len() == 1 {
                        write!(f, "{}", row[0])?;
                    } else {
                        write_joined(f, row.iter(), ", ", "(", ")")?;
                    }
                }
                write!(f, "]")
            }
            FieldValue::Group(values) => write_joined(f, values.iter(), "; ", "{", "}"),
            FieldValue::Raw(subrecords) => {
                write!(f, "<raw")?;
                for sr in subrecords {
                    write!(f, " {}:{}", sr.signature, sr.data.len())?;
                }
                write!(f, ">")
            }
        }
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
    separator: &str,
    open: &str,
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

/// 结构中未描述的子记录，编码时写在锚点元素之后
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extra {
    /// 前一个已知元素的索引，None 表示位于所有元素之前
    pub anchor: Option<usize>,
    pub subrecord: Subrecord,
}

/// 一条记录解码后的全部字段（按结构顺序）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    pub signature: Signature,
    pub fields: Vec<FieldValue>,
    pub extras: Vec<Extra>,
}

impl FieldSet {
    pub fn new(signature: Signature, element_count: usize) -> Self {
        FieldSet {
            signature,
            fields: vec![FieldValue::Absent; element_count],
            extras: Vec::new(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    pub fn set(&mut self, index: usize, value: FieldValue) {
        if let Some(slot) = self.fields.get_mut(index) {
            *slot = value;
        }
    }

    /// 局部引用 -> 全局引用（空引用保持不变）
    pub fn resolve(&mut self, resolver: &Resolver) {
        let mut resolve = |r: &mut FormRef| -> Result<(), EspError> {
            if let FormRef::Local(id) = r {
                if *id != 0 {
                    *r = FormRef::Resolved(resolver.resolve(*id));
                }
            }
            Ok(())
        };
        for field in &mut self.fields {
            // 闭包不会返回错误
            let _ = field.try_for_each_ref(&mut resolve);
        }
    }

    /// 全局引用 -> 输出文件的局部引用
    pub fn remap(&mut self, remapper: &Remapper) -> Result<(), EspError> {
        let mut remap = |r: &mut FormRef| -> Result<(), EspError> {
            if let FormRef::Resolved(id) = r {
                *r = FormRef::Local(remapper.to_local(id)?);
            }
            Ok(())
        };
        self.fields
            .iter_mut()
            .try_for_each(|field| field.try_for_each_ref(&mut remap))
    }

    /// 所有已解析的引用目标
    pub fn object_refs(&self) -> Vec<ObjectId> {
        self.fields
            .iter()
            .flat_map(|f| f.refs())
            .filter_map(|r| match r {
                FormRef::Resolved(id) => Some(id.clone()),
                FormRef::Local(_) => None,
            })
            .collect()
    }

    /// 是否含有原样保留的数据（其中的 FormID 无法重映射）
    pub fn has_unmappable(&self) -> bool {
        !self.extras.is_empty() || self.fields.iter().any(|f| f.has_raw())
    }

    /// 字段内容的 CRC32（与原始字节无关，只取决于解码后的值）
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.signature.as_bytes());
        for field in &self.fields {
            field.feed(&mut hasher);
        }
        for extra in &self.extras {
            hasher.update(&[extra.anchor.map(|a| a as u8 + 1).unwrap_or(0)]);
            FieldValue::Raw(vec![extra.subrecord.clone()]).feed(&mut hasher);
        }
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::PluginName;

    #[test]
    fn test_float_compare_by_bits() {
        assert_eq!(Value::F32(f32::NAN), Value::F32(f32::NAN));
        assert_ne!(Value::F32(0.0), Value::F32(-0.0));
        assert_ne!(Value::U8(1), Value::U16(1));
    }

    #[test]
    fn test_resolve_and_remap() {
        let mut fields = FieldSet::new(Signature::new(b"FLST"), 1);
        fields.set(
            0,
            FieldValue::List(vec![
                vec![Value::Ref(FormRef::Local(0x0000_0F00))],
                vec![Value::Ref(FormRef::Local(0x0100_0801))],
                vec![Value::Ref(FormRef::Local(0))],
            ]),
        );

        let resolver = Resolver::for_plugin("Mod.esp".into(), vec![PluginName::new("Skyrim.esm")]);
        fields.resolve(&resolver);
        let refs = fields.object_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1], ObjectId::new("Mod.esp", 0x801));

        let remapper = Remapper::new(
            "Patch.esp".into(),
            vec![PluginName::new("Skyrim.esm"), PluginName::new("Other.esm"), PluginName::new("Mod.esp")],
        )
        .unwrap();
        fields.remap(&remapper).unwrap();
        assert_eq!(
            fields.get(0),
            Some(&FieldValue::List(vec![
                vec![Value::Ref(FormRef::Local(0x0000_0F00))],
                vec![Value::Ref(FormRef::Local(0x0200_0801))],
                vec![Value::Ref(FormRef::Local(0))],
            ]))
        );
    }

    #[test]
    fn test_fingerprint_tracks_values() {
        let mut a = FieldSet::new(Signature::new(b"GLOB"), 1);
        a.set(0, FieldValue::Struct(vec![Value::F32(1.0)]));
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.set(0, FieldValue::Struct(vec![Value::F32(2.0)]));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_display() {
        let list = FieldValue::List(vec![vec![Value::U32(1)], vec![Value::U32(2)]]);
        assert_eq!(list.to_string(), "[1, 2]");
        assert_eq!(FieldValue::Struct(vec![Value::I32(2)]).to_string(), "(2)");
    }
}
