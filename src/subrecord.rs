use crate::datatypes::{read_signature, read_u16, read_u32, remaining_len, Signature};
use crate::utils::EspError;
use std::io::Cursor;

/// 扩展大小子记录签名
pub const XXXX: Signature = Signature::new(b"XXXX");

/// 子记录头部大小（4字节类型 + 2字节大小）
pub const SUBRECORD_HEADER_SIZE: usize = 6;

/// 子记录结构
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subrecord {
    /// 4字符记录类型
    pub signature: Signature,
    /// 原始数据
    pub data: Vec<u8>,
    /// 原文件是否使用 XXXX 扩展大小前缀
    pub extended: bool,
}

impl Subrecord {
    pub fn new(signature: Signature, data: Vec<u8>) -> Self {
        Subrecord {
            signature,
            data,
            extended: false,
        }
    }

    /// 解析子记录（自动处理 XXXX 扩展大小）
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let (mut signature, mut size) = Self::parse_header(cursor)?;
        let mut extended = false;

        if signature == XXXX {
            // XXXX 的数据是下一个子记录的真实大小，下一个头部的大小字段恒为0
            let ext_data = Self::read_payload(cursor, signature, size)?;
            let mut ext_cursor = Cursor::new(&ext_data[..]);
            let real_size = read_u32(&mut ext_cursor)? as usize;
            let (next_signature, _) = Self::parse_header(cursor)?;
            signature = next_signature;
            size = real_size;
            extended = true;
        }

        let data = Self::read_payload(cursor, signature, size)?;

        Ok(Subrecord {
            signature,
            data,
            extended,
        })
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>) -> Result<(Signature, usize), EspError> {
        // 检查是否有足够的数据读取头部
        if remaining_len(cursor) < SUBRECORD_HEADER_SIZE {
            return Err(EspError::TruncatedSubrecord {
                signature: Signature::new(b"----"),
                declared: SUBRECORD_HEADER_SIZE,
                available: remaining_len(cursor),
            });
        }
        let signature = read_signature(cursor)?;
        let size = read_u16(cursor)? as usize;
        Ok((signature, size))
    }

    fn read_payload(
        cursor: &mut Cursor<&[u8]>,
        signature: Signature,
        size: usize,
    ) -> Result<Vec<u8>, EspError> {
        let available = remaining_len(cursor);
        if size > available {
            return Err(EspError::TruncatedSubrecord {
                signature,
                declared: size,
                available,
            });
        }
        let start = cursor.position() as usize;
        let data = cursor.get_ref()[start..start + size].to_vec();
        cursor.set_position((start + size) as u64);
        Ok(data)
    }

    /// 写入子记录（数据超过 0xFFFF 字节时写出 XXXX 前缀）
    pub fn write(&self, output: &mut Vec<u8>) {
        if self.extended || self.data.len() > u16::MAX as usize {
            output.extend_from_slice(XXXX.as_bytes());
            output.extend_from_slice(&4u16.to_le_bytes());
            output.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
            output.extend_from_slice(self.signature.as_bytes());
            output.extend_from_slice(&0u16.to_le_bytes());
        } else {
            output.extend_from_slice(self.signature.as_bytes());
            output.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        }
        output.extend_from_slice(&self.data);
    }

    /// 写出后占用的字节数
    pub fn encoded_len(&self) -> usize {
        let header = if self.extended || self.data.len() > u16::MAX as usize {
            SUBRECORD_HEADER_SIZE * 2 + 4
        } else {
            SUBRECORD_HEADER_SIZE
        };
        header + self.data.len()
    }

    /// 获取子记录类型
    pub fn get_type(&self) -> &Signature {
        &self.signature
    }

    /// 获取数据
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }
}
