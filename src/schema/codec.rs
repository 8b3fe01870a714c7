use super::value::{Extra, FieldSet, FieldValue, FormRef, TextValue, Value};
use super::{Count, Element, ElementKind, FieldDef, Packing, Presence, Primitive, RecordSchema, StringKind};
use crate::datatypes::{
    read_bytes, read_f32, read_i16, read_i32, read_i8, read_u16, read_u32, read_u8, remaining_len,
    write_f32, write_i16, write_i32, write_i8, write_u16, write_u32, write_u8, Signature, TextEncoding,
};
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use std::collections::HashMap;
use std::io::Cursor;

/// 编解码选项（来自插件头部和加载选项）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecOptions {
    /// 插件带有本地化标志：LString 字段为字符串表ID
    pub localized: bool,
    pub encoding: TextEncoding,
}

fn mismatch(record: Signature, field: &str, reason: impl Into<String>) -> EspError {
    EspError::FieldMismatch {
        record,
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// 解码一条记录的子记录流
///
/// 每个元素解码后会立即重新编码并与消费的子记录比较，不一致时退化为
/// `FieldValue::Raw`，保证写回的字节与输入一致。
pub fn decode_record(schema: &RecordSchema, subrecords: &[Subrecord], options: CodecOptions) -> FieldSet {
    let mut ctx = DecodeContext::new(schema, options);
    for subrecord in subrecords {
        ctx.feed(subrecord.clone());
    }
    ctx.finish()
}

/// 按结构顺序编码字段
pub fn encode_record(
    schema: &RecordSchema,
    fields: &FieldSet,
    options: CodecOptions,
) -> Result<Vec<Subrecord>, EspError> {
    if fields.fields.len() != schema.elements.len() {
        return Err(mismatch(
            schema.signature,
            "*",
            format!(
                "字段数 {} 与结构元素数 {} 不一致",
                fields.fields.len(),
                schema.elements.len()
            ),
        ));
    }

    let mut output = Vec::new();
    let push_extras = |anchor: Option<usize>, output: &mut Vec<Subrecord>| {
        for extra in fields.extras.iter().filter(|e| e.anchor == anchor) {
            output.push(extra.subrecord.clone());
        }
    };

    push_extras(None, &mut output);
    for (index, (element, value)) in schema.elements.iter().zip(&fields.fields).enumerate() {
        encode_element(schema.signature, element, value, options, &mut output)?;
        push_extras(Some(index), &mut output);
    }
    // 锚点越界的附加子记录放在最后
    for extra in &fields.extras {
        if matches!(extra.anchor, Some(a) if a >= schema.elements.len()) {
            output.push(extra.subrecord.clone());
        }
    }
    Ok(output)
}

/// 解码单个顶层子记录（结构体或字符串元素）
pub fn decode_subrecord(
    schema: &RecordSchema,
    subrecord: &Subrecord,
    options: CodecOptions,
) -> Result<FieldValue, EspError> {
    let element = schema
        .elements
        .iter()
        .find(|e| {
            e.signature() == Some(subrecord.signature)
                && matches!(e.kind, ElementKind::Struct { .. } | ElementKind::String { .. })
        })
        .ok_or_else(|| mismatch(schema.signature, &subrecord.signature.to_string(), "未知的子记录类型"))?;
    decode_element(schema, element, std::slice::from_ref(subrecord), &[], options)
}

/// 解码状态：在扫描子记录流的过程中显式传递
pub struct DecodeContext<'s> {
    schema: &'s RecordSchema,
    options: CodecOptions,
    /// 子记录签名 -> 顶层元素
    routes: HashMap<Signature, usize>,
    /// 当前打开的标记组
    open_marker: Option<usize>,
    /// 每个元素按到达顺序消费的子记录
    consumed: Vec<Vec<Subrecord>>,
    last_element: Option<usize>,
    /// 尚未确定归属的未知子记录
    pending: Vec<Subrecord>,
    extras: Vec<Extra>,
}

impl<'s> DecodeContext<'s> {
    pub fn new(schema: &'s RecordSchema, options: CodecOptions) -> Self {
        let mut routes = HashMap::new();
        for (index, element) in schema.elements.iter().enumerate() {
            let signatures = match &element.kind {
                ElementKind::Conditional {
                    presence: Presence::Marker(marker),
                    ..
                } => vec![*marker],
                _ => element.signatures(),
            };
            for signature in signatures {
                routes.entry(signature).or_insert(index);
            }
        }

        DecodeContext {
            schema,
            options,
            routes,
            open_marker: None,
            consumed: vec![Vec::new(); schema.elements.len()],
            last_element: None,
            pending: Vec::new(),
            extras: Vec::new(),
        }
    }

    /// 处理下一个子记录
    pub fn feed(&mut self, subrecord: Subrecord) {
        let signature = subrecord.signature;

        if let Some(group) = self.open_marker {
            if self.group_accepts(group, signature) {
                self.route(group, subrecord);
                return;
            }
        }

        match self.routes.get(&signature).copied() {
            Some(index) => {
                self.open_marker = match &self.schema.elements[index].kind {
                    ElementKind::Conditional {
                        presence: Presence::Marker(marker),
                        ..
                    } if *marker == signature => Some(index),
                    _ => None,
                };
                self.route(index, subrecord);
            }
            None => {
                tracing::debug!(record = %self.schema.signature, subrecord = %signature, "未描述的子记录，原样保留");
                self.pending.push(subrecord);
            }
        }
    }

    fn group_accepts(&self, group: usize, signature: Signature) -> bool {
        match &self.schema.elements[group].kind {
            ElementKind::Conditional { elements, .. } => {
                elements.iter().any(|e| e.signatures().contains(&signature))
            }
            _ => false,
        }
    }

    fn route(&mut self, index: usize, subrecord: Subrecord) {
        if !self.pending.is_empty() {
            if self.last_element == Some(index) {
                // 未知子记录夹在同一元素的子记录之间，只能整体原样保留
                let pending = std::mem::take(&mut self.pending);
                self.consumed[index].extend(pending);
            } else {
                self.flush_pending();
            }
        }
        self.consumed[index].push(subrecord);
        self.last_element = Some(index);
    }

    fn flush_pending(&mut self) {
        let anchor = self.last_element;
        for subrecord in self.pending.drain(..) {
            self.extras.push(Extra { anchor, subrecord });
        }
    }

    /// 解码所有元素
    pub fn finish(mut self) -> FieldSet {
        self.flush_pending();

        let schema = self.schema;
        let mut fields = FieldSet::new(schema.signature, schema.elements.len());
        fields.extras = std::mem::take(&mut self.extras);

        for (index, element) in schema.elements.iter().enumerate() {
            let consumed = std::mem::take(&mut self.consumed[index]);
            if consumed.is_empty() {
                continue;
            }

            let decoded = decode_element(schema, element, &consumed, &fields.fields[..index], self.options)
                .and_then(|value| {
                    let mut encoded = Vec::with_capacity(consumed.len());
                    encode_element(schema.signature, element, &value, self.options, &mut encoded)?;
                    if encoded == consumed {
                        Ok(value)
                    } else {
                        Err(mismatch(schema.signature, element.name, "重新编码结果与原始字节不一致"))
                    }
                });

            fields.fields[index] = match decoded {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(record = %schema.signature, element = element.name, error = %e, "按原始子记录保留");
                    FieldValue::Raw(consumed)
                }
            };
        }

        fields
    }
}

fn decode_element(
    schema: &RecordSchema,
    element: &Element,
    consumed: &[Subrecord],
    earlier: &[FieldValue],
    options: CodecOptions,
) -> Result<FieldValue, EspError> {
    let record = schema.signature;
    match &element.kind {
        ElementKind::Struct { signature, fields } => {
            let subrecord = single(record, element, consumed, *signature)?;
            decode_struct(record, element.name, &subrecord.data, fields).map(FieldValue::Struct)
        }
        ElementKind::String { signature, kind } => {
            let subrecord = single(record, element, consumed, *signature)?;
            decode_text(record, element.name, &subrecord.data, *kind, options).map(FieldValue::Text)
        }
        ElementKind::Repeating {
            signature,
            fields,
            packing,
            count,
        } => {
            let mut items = consumed;
            let mut expected = None;
            if let Count::Counter {
                signature: counter,
                width,
            } = count
            {
                if let Some(first) = items.first().filter(|sr| sr.signature == *counter) {
                    let mut cursor = Cursor::new(&first.data[..]);
                    let value = read_primitive(&mut cursor, *width)?
                        .as_u32()
                        .ok_or_else(|| mismatch(record, element.name, "计数字段不是整数"))?;
                    if remaining_len(&cursor) != 0 {
                        return Err(mismatch(record, element.name, "计数子记录长度错误"));
                    }
                    expected = Some(value as usize);
                    items = &items[1..];
                }
            }

            if let Some(stray) = items.iter().find(|sr| sr.signature != *signature) {
                return Err(mismatch(
                    record,
                    element.name,
                    format!("列表中出现 {} 子记录", stray.signature),
                ));
            }

            let rows = match packing {
                Packing::Packed => {
                    if items.len() != 1 {
                        return Err(mismatch(record, element.name, "紧凑列表应只有一个子记录"));
                    }
                    let width = row_width(fields)
                        .ok_or_else(|| mismatch(record, element.name, "紧凑列表条目不是定长"))?;
                    let data = &items[0].data;
                    if width == 0 || data.len() % width != 0 {
                        return Err(mismatch(
                            record,
                            element.name,
                            format!("数据长度 {} 不是条目长度 {} 的整数倍", data.len(), width),
                        ));
                    }
                    data.chunks(width)
                        .map(|chunk| decode_struct(record, element.name, chunk, fields))
                        .collect::<Result<Vec<_>, _>>()?
                }
                Packing::PerSubrecord => items
                    .iter()
                    .map(|sr| decode_struct(record, element.name, &sr.data, fields))
                    .collect::<Result<Vec<_>, _>>()?,
            };

            if let Some(expected) = expected {
                if expected != rows.len() {
                    return Err(mismatch(
                        record,
                        element.name,
                        format!("计数为 {}，实际条目 {}", expected, rows.len()),
                    ));
                }
            }
            Ok(FieldValue::List(rows))
        }
        ElementKind::Conditional { presence, elements } => {
            let nested = match presence {
                Presence::Marker(marker) => {
                    let first = consumed
                        .first()
                        .filter(|sr| sr.signature == *marker)
                        .ok_or_else(|| mismatch(record, element.name, "缺少标记子记录"))?;
                    if !first.data.is_empty() {
                        return Err(mismatch(record, element.name, "标记子记录带有数据"));
                    }
                    &consumed[1..]
                }
                Presence::Flag {
                    element: flag_element,
                    field,
                    mask,
                    when_set,
                } => {
                    let index = schema
                        .index_of(flag_element)
                        .ok_or_else(|| mismatch(record, element.name, "条件引用了不存在的元素"))?;
                    let bits = match earlier.get(index) {
                        Some(FieldValue::Struct(values)) => values.get(*field).and_then(|v| v.as_u32()),
                        _ => None,
                    }
                    .ok_or_else(|| mismatch(record, element.name, "无法读取条件标志"))?;
                    if ((bits & mask) != 0) != *when_set {
                        return Err(mismatch(record, element.name, "标志位表明该元素不应出现"));
                    }
                    consumed
                }
            };

            let mut values = Vec::with_capacity(elements.len());
            let mut claimed = 0;
            for sub_element in elements {
                let signatures = sub_element.signatures();
                let part: Vec<Subrecord> = nested
                    .iter()
                    .filter(|sr| signatures.contains(&sr.signature))
                    .cloned()
                    .collect();
                claimed += part.len();
                if part.is_empty() {
                    values.push(FieldValue::Absent);
                } else {
                    values.push(decode_element(schema, sub_element, &part, &[], options)?);
                }
            }
            if claimed != nested.len() {
                return Err(mismatch(record, element.name, "组内出现无法归属的子记录"));
            }
            Ok(FieldValue::Group(values))
        }
    }
}

fn single<'a>(
    record: Signature,
    element: &Element,
    consumed: &'a [Subrecord],
    signature: Signature,
) -> Result<&'a Subrecord, EspError> {
    match consumed {
        [only] if only.signature == signature => Ok(only),
        _ => Err(mismatch(
            record,
            element.name,
            format!("期望一个 {} 子记录，实际 {} 个", signature, consumed.len()),
        )),
    }
}

fn row_width(fields: &[FieldDef]) -> Option<usize> {
    fields.iter().map(|f| f.kind.width()).sum()
}

fn read_primitive(cursor: &mut Cursor<&[u8]>, kind: Primitive) -> Result<Value, EspError> {
    Ok(match kind {
        Primitive::U8 => Value::U8(read_u8(cursor)?),
        Primitive::I8 => Value::I8(read_i8(cursor)?),
        Primitive::U16 => Value::U16(read_u16(cursor)?),
        Primitive::I16 => Value::I16(read_i16(cursor)?),
        Primitive::U32 => Value::U32(read_u32(cursor)?),
        Primitive::I32 => Value::I32(read_i32(cursor)?),
        Primitive::F32 => Value::F32(read_f32(cursor)?),
        Primitive::FormId => Value::Ref(FormRef::Local(read_u32(cursor)?)),
        Primitive::Bytes(len) => Value::Bytes(read_bytes(cursor, len)?),
        Primitive::Remaining => {
            let len = remaining_len(cursor);
            Value::Bytes(read_bytes(cursor, len)?)
        }
    })
}

/// 解码结构体；数据在字段边界提前结束时，缺失的尾部字段不出现在结果中
fn decode_struct(
    record: Signature,
    name: &str,
    data: &[u8],
    fields: &[FieldDef],
) -> Result<Vec<Value>, EspError> {
    let mut cursor = Cursor::new(data);
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        if remaining_len(&cursor) == 0 {
            break;
        }
        if let Some(width) = field.kind.width() {
            if remaining_len(&cursor) < width {
                return Err(mismatch(
                    record,
                    name,
                    format!("字段 {} 需要 {} 字节，只剩 {} 字节", field.name, width, remaining_len(&cursor)),
                ));
            }
        }
        values.push(read_primitive(&mut cursor, field.kind)?);
    }
    if remaining_len(&cursor) != 0 {
        return Err(mismatch(
            record,
            name,
            format!("结构体之后还有 {} 字节", remaining_len(&cursor)),
        ));
    }
    Ok(values)
}

fn decode_text(
    record: Signature,
    name: &str,
    data: &[u8],
    kind: StringKind,
    options: CodecOptions,
) -> Result<TextValue, EspError> {
    if kind == StringKind::LString && options.localized {
        if data.len() != 4 {
            return Err(mismatch(record, name, "本地化字符串ID应为4字节"));
        }
        return Ok(TextValue::Localized(u32::from_le_bytes([data[0], data[1], data[2], data[3]])));
    }
    let text = match data.split_last() {
        Some((&0, body)) => body,
        _ => data,
    };
    Ok(TextValue::Inline(options.encoding.decode(text)))
}

fn encode_element(
    record: Signature,
    element: &Element,
    value: &FieldValue,
    options: CodecOptions,
    output: &mut Vec<Subrecord>,
) -> Result<(), EspError> {
    match (&element.kind, value) {
        (_, FieldValue::Absent) => Ok(()),
        (_, FieldValue::Raw(subrecords)) => {
            output.extend(subrecords.iter().cloned());
            Ok(())
        }
        (ElementKind::Struct { signature, fields }, FieldValue::Struct(values)) => {
            let data = encode_struct(record, element.name, fields, values)?;
            output.push(Subrecord::new(*signature, data));
            Ok(())
        }
        (ElementKind::String { signature, kind }, FieldValue::Text(text)) => {
            let data = match (kind, options.localized, text) {
                (StringKind::LString, true, TextValue::Localized(id)) => id.to_le_bytes().to_vec(),
                (StringKind::LString, true, TextValue::Inline(_)) => {
                    return Err(mismatch(record, element.name, "本地化插件中不能写入内联文本"));
                }
                (_, _, TextValue::Inline(text)) => {
                    let mut bytes = options.encoding.encode(text);
                    bytes.push(0);
                    bytes
                }
                (_, _, TextValue::Localized(_)) => {
                    return Err(mismatch(record, element.name, "非本地化插件中不能写入字符串ID"));
                }
            };
            output.push(Subrecord::new(*signature, data));
            Ok(())
        }
        (
            ElementKind::Repeating {
                signature,
                fields,
                packing,
                count,
            },
            FieldValue::List(rows),
        ) => {
            if rows.is_empty() {
                return Ok(());
            }
            if let Count::Counter {
                signature: counter,
                width,
            } = count
            {
                let too_many = |_: std::num::TryFromIntError| {
                    mismatch(record, element.name, format!("条目数 {} 超出计数字段范围", rows.len()))
                };
                let mut data = Vec::new();
                match width {
                    Primitive::U8 => write_u8(&mut data, u8::try_from(rows.len()).map_err(too_many)?)?,
                    Primitive::U16 => write_u16(&mut data, u16::try_from(rows.len()).map_err(too_many)?)?,
                    _ => write_u32(&mut data, u32::try_from(rows.len()).map_err(too_many)?)?,
                }
                output.push(Subrecord::new(*counter, data));
            }
            match packing {
                Packing::Packed => {
                    let mut data = Vec::new();
                    for row in rows {
                        if row.len() != fields.len() {
                            return Err(mismatch(record, element.name, "紧凑列表条目字段不完整"));
                        }
                        data.extend(encode_struct(record, element.name, fields, row)?);
                    }
                    output.push(Subrecord::new(*signature, data));
                }
                Packing::PerSubrecord => {
                    for row in rows {
                        let data = encode_struct(record, element.name, fields, row)?;
                        output.push(Subrecord::new(*signature, data));
                    }
                }
            }
            Ok(())
        }
        (ElementKind::Conditional { presence, elements }, FieldValue::Group(values)) => {
            if values.len() != elements.len() {
                return Err(mismatch(record, element.name, "条件组的值数量与结构不一致"));
            }
            if let Presence::Marker(marker) = presence {
                output.push(Subrecord::new(*marker, Vec::new()));
            }
            for (sub_element, sub_value) in elements.iter().zip(values) {
                encode_element(record, sub_element, sub_value, options, output)?;
            }
            Ok(())
        }
        _ => Err(mismatch(record, element.name, format!("值 {} 与元素类型不匹配", value))),
    }
}

fn encode_struct(
    record: Signature,
    name: &str,
    fields: &[FieldDef],
    values: &[Value],
) -> Result<Vec<u8>, EspError> {
    if values.len() > fields.len() {
        return Err(mismatch(record, name, "值的数量多于字段数量"));
    }
    let mut data = Vec::new();
    for (field, value) in fields.iter().zip(values) {
        match (field.kind, value) {
            (Primitive::U8, Value::U8(v)) => write_u8(&mut data, *v)?,
            (Primitive::I8, Value::I8(v)) => write_i8(&mut data, *v)?,
            (Primitive::U16, Value::U16(v)) => write_u16(&mut data, *v)?,
            (Primitive::I16, Value::I16(v)) => write_i16(&mut data, *v)?,
            (Primitive::U32, Value::U32(v)) => write_u32(&mut data, *v)?,
            (Primitive::I32, Value::I32(v)) => write_i32(&mut data, *v)?,
            (Primitive::F32, Value::F32(v)) => write_f32(&mut data, *v)?,
            (Primitive::FormId, Value::Ref(FormRef::Local(id))) => write_u32(&mut data, *id)?,
            (Primitive::FormId, Value::Ref(FormRef::Resolved(id))) => {
                return Err(EspError::UnmappedReference(format!("{}.{}.{} = {}", record, name, field.name, id)));
            }
            (Primitive::Bytes(len), Value::Bytes(bytes)) if bytes.len() == len => data.extend_from_slice(bytes),
            (Primitive::Remaining, Value::Bytes(bytes)) => data.extend_from_slice(bytes),
            _ => {
                return Err(mismatch(
                    record,
                    name,
                    format!("字段 {} 的值 {} 类型不符", field.name, value),
                ));
            }
        }
    }
    Ok(data)
}
