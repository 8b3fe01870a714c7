use crate::datatypes::{read_f32, read_u32, read_u64, RawString, RecordFlags, Signature, TextEncoding};
use crate::record::Record;
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use std::io::Cursor;

/// 支持的 HEDR 版本号
///
/// 0.8 Oblivion，0.94 Fallout 3 / Skyrim LE，1.32 Fallout NV，
/// 0.95/1.0 Fallout 4，1.7/1.71 Skyrim SE。
pub const SUPPORTED_VERSIONS: &[f32] = &[0.8, 0.94, 0.95, 0.96, 1.0, 1.32, 1.7, 1.71];

const TES4: Signature = Signature::new(b"TES4");
const HEDR: Signature = Signature::new(b"HEDR");
const CNAM: Signature = Signature::new(b"CNAM");
const SNAM: Signature = Signature::new(b"SNAM");
const MAST: Signature = Signature::new(b"MAST");
const DATA: Signature = Signature::new(b"DATA");

/// 主文件条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEntry {
    pub name: String,
    /// MAST 之后 DATA 子记录中的文件大小（通常为0）
    pub size: u64,
}

/// 插件头部（TES4 记录）
#[derive(Debug, Clone)]
pub struct PluginHeader {
    /// 原始头部记录
    record: Record,
    version: f32,
    num_records: u32,
    next_object_id: u32,
    author: Option<String>,
    description: Option<String>,
    masters: Vec<MasterEntry>,
    /// 其他头部子记录（ONAM、INTV、INCC 等），按原顺序保留
    other: Vec<Subrecord>,
    encoding: TextEncoding,
    modified: bool,
}

impl PluginHeader {
    /// 新建头部
    pub fn new(version: f32) -> Self {
        let mut record = Record::new(TES4, 0, 0);
        record.internal_version = 0;
        PluginHeader {
            record,
            version,
            num_records: 0,
            next_object_id: 0x800,
            author: None,
            description: None,
            masters: Vec::new(),
            other: Vec::new(),
            encoding: TextEncoding::default(),
            modified: true,
        }
    }

    /// 从 TES4 记录解析
    pub fn parse(record: Record, encoding: TextEncoding) -> Result<Self, EspError> {
        if record.signature != TES4 {
            return Err(EspError::BadMagic(record.signature.to_string()));
        }
        if let Some(reason) = &record.decode_error {
            return Err(EspError::InvalidFormat(format!("头部记录损坏: {}", reason)));
        }

        let hedr = record
            .find_subrecord(&HEDR)
            .ok_or_else(|| EspError::InvalidFormat("头部缺少 HEDR 子记录".into()))?;
        if hedr.data.len() < 12 {
            return Err(EspError::InvalidFormat(format!(
                "HEDR 长度应为12字节，实际 {} 字节",
                hedr.data.len()
            )));
        }
        let mut cursor = Cursor::new(&hedr.data[..]);
        let version = read_f32(&mut cursor)?;
        let num_records = read_u32(&mut cursor)?;
        let next_object_id = read_u32(&mut cursor)?;

        if !SUPPORTED_VERSIONS.iter().any(|v| (v - version).abs() < 0.001) {
            return Err(EspError::UnsupportedVersion(format!("HEDR {}", version)));
        }

        let mut author = None;
        let mut description = None;
        let mut masters: Vec<MasterEntry> = Vec::new();
        let mut other = Vec::new();

        for subrecord in &record.subrecords {
            match subrecord.signature {
                HEDR => {}
                CNAM => author = Some(decode_zstring(&subrecord.data, encoding)),
                SNAM => description = Some(decode_zstring(&subrecord.data, encoding)),
                MAST => masters.push(MasterEntry {
                    name: decode_zstring(&subrecord.data, encoding),
                    size: 0,
                }),
                DATA if masters.last().is_some() && subrecord.data.len() == 8 => {
                    let mut cursor = Cursor::new(&subrecord.data[..]);
                    if let Some(last) = masters.last_mut() {
                        last.size = read_u64(&mut cursor)?;
                    }
                }
                _ => other.push(subrecord.clone()),
            }
        }

        Ok(PluginHeader {
            record,
            version,
            num_records,
            next_object_id,
            author,
            description,
            masters,
            other,
            encoding,
            modified: false,
        })
    }

    /// 生成写入用的头部记录（未修改时返回原始记录）
    pub fn to_record(&self) -> Record {
        if !self.modified {
            return self.record.clone();
        }

        let mut subrecords = Vec::new();
        let mut hedr = Vec::with_capacity(12);
        hedr.extend_from_slice(&self.version.to_le_bytes());
        hedr.extend_from_slice(&self.num_records.to_le_bytes());
        hedr.extend_from_slice(&self.next_object_id.to_le_bytes());
        subrecords.push(Subrecord::new(HEDR, hedr));

        if let Some(author) = &self.author {
            subrecords.push(Subrecord::new(CNAM, RawString::encode_zstring(author, self.encoding)));
        }
        if let Some(description) = &self.description {
            subrecords.push(Subrecord::new(SNAM, RawString::encode_zstring(description, self.encoding)));
        }
        for master in &self.masters {
            subrecords.push(Subrecord::new(MAST, RawString::encode_zstring(&master.name, self.encoding)));
            subrecords.push(Subrecord::new(DATA, master.size.to_le_bytes().to_vec()));
        }
        subrecords.extend(self.other.iter().cloned());

        let mut record = self.record.clone();
        // 头部永不压缩
        record.flags &= !RecordFlags::COMPRESSED.bits();
        record.set_subrecords(subrecords);
        record
    }

    pub fn version(&self) -> f32 {
        self.version
    }

    pub fn num_records(&self) -> u32 {
        self.num_records
    }

    pub fn next_object_id(&self) -> u32 {
        self.next_object_id
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn masters(&self) -> &[MasterEntry] {
        &self.masters
    }

    pub fn flags(&self) -> RecordFlags {
        self.record.get_flags()
    }

    pub fn has_flag(&self, flag: RecordFlags) -> bool {
        self.record.flags & flag.bits() != 0
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn set_flag(&mut self, flag: RecordFlags, on: bool) {
        if on {
            self.record.flags |= flag.bits();
        } else {
            self.record.flags &= !flag.bits();
        }
        self.modified = true;
    }

    pub fn set_version(&mut self, version: f32) {
        self.version = version;
        self.modified = true;
    }

    pub fn set_num_records(&mut self, count: u32) {
        self.num_records = count;
        self.modified = true;
    }

    pub fn set_author(&mut self, author: Option<String>) {
        self.author = author;
        self.modified = true;
    }

    pub fn set_description(&mut self, description: Option<String>) {
        self.description = description;
        self.modified = true;
    }

    pub fn set_masters(&mut self, masters: Vec<MasterEntry>) {
        self.masters = masters;
        self.modified = true;
    }

    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        self.encoding = encoding;
        self.modified = true;
    }
}

fn decode_zstring(data: &[u8], encoding: TextEncoding) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    encoding.decode(&data[..end])
}
