use crate::datatypes::{read_signature, read_u16, read_u32, remaining_len, RecordFlags, Signature};
use crate::subrecord::{Subrecord, SUBRECORD_HEADER_SIZE};
use crate::utils::EspError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};

/// 记录头部大小（TES4 之后的游戏）
pub const RECORD_HEADER_SIZE: usize = 24;

/// 单条记录数据上限（超过视为损坏）
const MAX_RECORD_SIZE: u32 = 100_000_000;
/// 解压后数据上限
const MAX_DECOMPRESSED_SIZE: u32 = 50_000_000;

/// 记录结构
#[derive(Debug, Clone)]
pub struct Record {
    /// 记录类型
    pub signature: Signature,
    /// 数据大小（读取时的原始值，写入时重新计算）
    pub data_size: u32,
    /// 标志位（原始32位数据）
    pub flags: u32,
    /// FormID（文件内局部标识）
    pub form_id: u32,
    /// 时间戳
    pub timestamp: u16,
    /// 版本控制信息
    pub version_control_info: u16,
    /// 内部版本（form version）
    pub internal_version: u16,
    /// 未知字段
    pub unknown: u16,
    /// 原始压缩数据（如果记录是压缩的，保存原始压缩字节）
    pub original_compressed_data: Option<Vec<u8>>,
    /// 解压后的子记录字节流
    pub raw_data: Vec<u8>,
    /// 子记录列表
    pub subrecords: Vec<Subrecord>,
    /// 子记录流之后的 NULL 填充字节数
    pub padding: usize,
    /// 子记录解析失败的原因（此时 subrecords 为空，raw_data 原样保留）
    pub decode_error: Option<String>,
    /// raw_data 的 CRC32
    pub checksum: u32,
    /// 是否已被修改（用于智能压缩处理）
    pub is_modified: bool,
}

impl Record {
    /// 创建一个新的空记录
    pub fn new(signature: Signature, form_id: u32, flags: u32) -> Self {
        Record {
            signature,
            data_size: 0,
            flags,
            form_id,
            timestamp: 0,
            version_control_info: 0,
            internal_version: 0,
            unknown: 0,
            original_compressed_data: None,
            raw_data: Vec::new(),
            subrecords: Vec::new(),
            padding: 0,
            decode_error: None,
            checksum: crc32fast::hash(&[]),
            is_modified: true,
        }
    }

    /// 解析记录
    ///
    /// 头部或数据被截断时返回 `TruncatedRecord`；子记录层面的损坏不会中断，
    /// 而是记录在 `decode_error` 中，游标总是停在记录声明的结尾处。
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let offset = cursor.position();
        if remaining_len(cursor) < RECORD_HEADER_SIZE {
            return Err(EspError::TruncatedRecord {
                signature: Signature::new(b"----"),
                offset,
                declared: RECORD_HEADER_SIZE as u64,
                available: remaining_len(cursor) as u64,
            });
        }

        let signature = read_signature(cursor)?;
        let data_size = read_u32(cursor)?;
        let flags = read_u32(cursor)?;
        let form_id = read_u32(cursor)?;
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let internal_version = read_u16(cursor)?;
        let unknown = read_u16(cursor)?;

        let available = remaining_len(cursor);
        if data_size > MAX_RECORD_SIZE || data_size as usize > available {
            return Err(EspError::TruncatedRecord {
                signature,
                offset,
                declared: data_size as u64,
                available: available as u64,
            });
        }

        let start = cursor.position() as usize;
        let data = cursor.get_ref()[start..start + data_size as usize].to_vec();
        cursor.set_position((start + data_size as usize) as u64);

        let mut record = Record {
            signature,
            data_size,
            flags,
            form_id,
            timestamp,
            version_control_info,
            internal_version,
            unknown,
            original_compressed_data: None,
            raw_data: Vec::new(),
            subrecords: Vec::new(),
            padding: 0,
            decode_error: None,
            checksum: 0,
            is_modified: false,
        };

        if flags & RecordFlags::COMPRESSED.bits() != 0 {
            match Self::decompress_data(&data) {
                Ok(decompressed) => {
                    record.raw_data = decompressed;
                    record.original_compressed_data = Some(data);
                }
                Err(e) => {
                    tracing::warn!(record = %signature, form_id = format_args!("{:08X}", form_id), error = %e, "记录解压失败，跳过子记录解析");
                    record.decode_error = Some(e.to_string());
                    record.raw_data = data.clone();
                    record.original_compressed_data = Some(data);
                }
            }
        } else {
            record.raw_data = data;
        }

        if record.decode_error.is_none() {
            match Self::parse_subrecords(&record.raw_data) {
                Ok((subrecords, padding)) => {
                    record.subrecords = subrecords;
                    record.padding = padding;
                }
                Err(e) => {
                    tracing::warn!(record = %signature, form_id = format_args!("{:08X}", form_id), error = %e, "子记录解析失败，记录按原始字节保留");
                    record.decode_error = Some(e.to_string());
                }
            }
        }

        record.checksum = crc32fast::hash(&record.raw_data);
        Ok(record)
    }

    /// 解压缩数据（前4字节为解压后大小）
    fn decompress_data(data: &[u8]) -> Result<Vec<u8>, EspError> {
        if data.len() < 4 {
            return Err(EspError::CompressionError("压缩数据太短，无法包含解压大小".into()));
        }

        let mut data_cursor = Cursor::new(data);
        let decompressed_size = read_u32(&mut data_cursor)?;
        if decompressed_size > MAX_DECOMPRESSED_SIZE {
            return Err(EspError::CompressionError(format!(
                "解压大小过大: {} bytes (可能数据损坏)",
                decompressed_size
            )));
        }

        let mut decoder = ZlibDecoder::new(&data[4..]);
        let mut decompressed = Vec::with_capacity(decompressed_size as usize);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| EspError::CompressionError(e.to_string()))?;

        if decompressed.len() != decompressed_size as usize {
            return Err(EspError::CompressionError(format!(
                "解压大小不匹配: 期望 {} bytes，实际 {} bytes",
                decompressed_size,
                decompressed.len()
            )));
        }

        Ok(decompressed)
    }

    /// 解析子记录，返回子记录列表和末尾 NULL 填充长度
    pub(crate) fn parse_subrecords(data: &[u8]) -> Result<(Vec<Subrecord>, usize), EspError> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);

        while cursor.position() < data.len() as u64 {
            let remaining = remaining_len(&cursor);

            // 不足一个子记录头部：只允许 NULL 填充
            if remaining < SUBRECORD_HEADER_SIZE {
                let remaining_bytes = &data[cursor.position() as usize..];
                if remaining_bytes.iter().all(|&b| b == 0) {
                    return Ok((subrecords, remaining));
                }
                return Err(EspError::InvalidFormat(format!(
                    "记录末尾有 {} 字节非 NULL 数据，无法解析为子记录: {:02X?}",
                    remaining, remaining_bytes
                )));
            }

            subrecords.push(Subrecord::parse(&mut cursor)?);
        }

        Ok((subrecords, 0))
    }

    /// 序列化子记录字节流（不含压缩）
    pub fn serialize_subrecords(&self) -> Vec<u8> {
        if !self.is_modified || self.decode_error.is_some() {
            return self.raw_data.clone();
        }
        let mut output = Vec::with_capacity(self.raw_data.len());
        for subrecord in &self.subrecords {
            subrecord.write(&mut output);
        }
        output
    }

    /// 生成写入文件的数据部分（必要时重新压缩）
    pub fn data_for_write(&self) -> Result<Vec<u8>, EspError> {
        if !self.is_modified {
            if let Some(compressed) = &self.original_compressed_data {
                return Ok(compressed.clone());
            }
            return Ok(self.raw_data.clone());
        }

        let subrecord_data = self.serialize_subrecords();
        if self.is_compressed() {
            Self::compress_data(&subrecord_data)
        } else {
            Ok(subrecord_data)
        }
    }

    /// 压缩数据（前4字节写入解压后大小）
    pub fn compress_data(data: &[u8]) -> Result<Vec<u8>, EspError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let mut result = Vec::with_capacity(compressed.len() + 4);
        result.extend_from_slice(&(data.len() as u32).to_le_bytes());
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    /// 替换子记录并标记为已修改
    pub fn set_subrecords(&mut self, subrecords: Vec<Subrecord>) {
        self.subrecords = subrecords;
        self.padding = 0;
        self.decode_error = None;
        self.original_compressed_data = None;
        self.is_modified = true;
        self.raw_data = self.serialize_subrecords();
        self.checksum = crc32fast::hash(&self.raw_data);
    }

    /// 获取标志位
    pub fn get_flags(&self) -> RecordFlags {
        RecordFlags::from_bits_retain(self.flags)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & RecordFlags::COMPRESSED.bits() != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & RecordFlags::DELETED.bits() != 0
    }

    /// 查找子记录
    pub fn find_subrecord(&self, signature: &Signature) -> Option<&Subrecord> {
        self.subrecords.iter().find(|sr| &sr.signature == signature)
    }

    /// 获取编辑器ID
    pub fn get_editor_id(&self) -> Option<String> {
        self.find_subrecord(&Signature::new(b"EDID"))
            .map(|sr| String::from_utf8_lossy(&sr.data).trim_end_matches('\0').to_string())
    }

    /// 标记为已修改
    pub fn mark_modified(&mut self) {
        self.is_modified = true;
    }
}
