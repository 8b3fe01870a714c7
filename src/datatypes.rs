use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read, Write};

// 基础整数类型读取函数（越界时返回 UnexpectedEof）
pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, std::io::Error> {
    cursor.read_u8()
}

pub fn read_i8(cursor: &mut Cursor<&[u8]>) -> Result<i8, std::io::Error> {
    cursor.read_i8()
}

pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, std::io::Error> {
    cursor.read_u16::<LittleEndian>()
}

pub fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16, std::io::Error> {
    cursor.read_i16::<LittleEndian>()
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, std::io::Error> {
    cursor.read_u32::<LittleEndian>()
}

pub fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, std::io::Error> {
    cursor.read_i32::<LittleEndian>()
}

pub fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64, std::io::Error> {
    cursor.read_u64::<LittleEndian>()
}

pub fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32, std::io::Error> {
    cursor.read_f32::<LittleEndian>()
}

/// 读取固定长度字节块
pub fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, std::io::Error> {
    let remaining = remaining_len(cursor);
    if len > remaining {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("需要 {} 字节，剩余 {} 字节", len, remaining),
        ));
    }
    let mut buffer = vec![0u8; len];
    cursor.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// 读取4字节签名
pub fn read_signature(cursor: &mut Cursor<&[u8]>) -> Result<Signature, std::io::Error> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(Signature(bytes))
}

/// 游标之后剩余的字节数
pub fn remaining_len(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len() as u64;
    len.saturating_sub(cursor.position()) as usize
}

// 基础整数类型写入函数
pub fn write_u8(writer: &mut dyn Write, value: u8) -> Result<(), std::io::Error> {
    writer.write_u8(value)
}

pub fn write_i8(writer: &mut dyn Write, value: i8) -> Result<(), std::io::Error> {
    writer.write_i8(value)
}

pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_i16(writer: &mut dyn Write, value: i16) -> Result<(), std::io::Error> {
    writer.write_i16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

pub fn write_i32(writer: &mut dyn Write, value: i32) -> Result<(), std::io::Error> {
    writer.write_i32::<LittleEndian>(value)
}

pub fn write_u64(writer: &mut dyn Write, value: u64) -> Result<(), std::io::Error> {
    writer.write_u64::<LittleEndian>(value)
}

pub fn write_f32(writer: &mut dyn Write, value: f32) -> Result<(), std::io::Error> {
    writer.write_f32::<LittleEndian>(value)
}

/// 4字符类型签名（记录、子记录、组标签）
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const fn new(bytes: &[u8; 4]) -> Self {
        Signature(*bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// 以字符串形式显示（非ASCII字节会被替换）
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// 从字符串解析，长度必须为4字节
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.len() != 4 {
            return None;
        }
        let mut sig = [0u8; 4];
        sig.copy_from_slice(bytes);
        Some(Signature(sig))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.as_string())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Signature::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("签名必须是4个字节: {:?}", text)))
    }
}

/// 插件文本编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "windows-1252")]
    Windows1252,
    #[serde(rename = "utf-8")]
    Utf8,
}

impl TextEncoding {
    fn encoding(&self) -> &'static encoding_rs::Encoding {
        match self {
            TextEncoding::Windows1252 => encoding_rs::WINDOWS_1252,
            TextEncoding::Utf8 => encoding_rs::UTF_8,
        }
    }

    /// 解码（不处理结尾的NULL）
    pub fn decode(&self, data: &[u8]) -> String {
        let (decoded, _) = self.encoding().decode_without_bom_handling(data);
        decoded.into_owned()
    }

    /// 编码（不添加结尾的NULL）
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (encoded, _, _) = self.encoding().encode(text);
        encoded.into_owned()
    }

    pub fn label(&self) -> &'static str {
        match self {
            TextEncoding::Windows1252 => "windows-1252",
            TextEncoding::Utf8 => "utf-8",
        }
    }
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

#[derive(Debug, Clone)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
}

impl RawString {
    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Z字符串解析(以null结尾)
    pub fn parse_zstring(data: &[u8]) -> Self {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self::decode(&data[..null_pos])
    }

    /// Z字符串编码（末尾补一个null）
    pub fn encode_zstring(text: &str, encoding: TextEncoding) -> Vec<u8> {
        let mut bytes = encoding.encode(text);
        bytes.push(0);
        bytes
    }
}

// 记录标志位定义
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化（仅TES4）
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件（仅TES4）
        const PERSISTENT = 0x00000400;         // 持久化
        const DISABLED = 0x00000800;           // 初始禁用
        const IGNORED = 0x00001000;            // 忽略
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_checked_reads() {
        let data = [0x01u8, 0x02, 0x03];
        let mut cursor = Cursor::new(&data[..]);
        assert_eq!(read_u16(&mut cursor).unwrap(), 0x0201);
        assert!(read_u32(&mut cursor).is_err());

        let mut cursor = Cursor::new(&data[..]);
        assert!(read_bytes(&mut cursor, 4).is_err());
        assert_eq!(read_bytes(&mut cursor, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(remaining_len(&cursor), 0);
    }

    #[test]
    fn test_signature_parse_and_display() {
        let sig = Signature::parse("WEAP").unwrap();
        assert_eq!(sig, Signature::new(b"WEAP"));
        assert_eq!(sig.to_string(), "WEAP");
        assert!(Signature::parse("TOOLONG").is_none());

        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, "\"WEAP\"");
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn test_windows1252_is_lossless() {
        let bytes: Vec<u8> = (1u8..=255).collect();
        let text = TextEncoding::Windows1252.decode(&bytes);
        assert_eq!(TextEncoding::Windows1252.encode(&text), bytes);
    }

    #[test]
    fn test_zstring() {
        let encoded = RawString::encode_zstring("Iron Sword", TextEncoding::Windows1252);
        assert_eq!(encoded.last(), Some(&0));
        assert_eq!(RawString::parse_zstring(&encoded).content, "Iron Sword");
    }
}
