use super::{Plugin, PluginHeader};
use crate::datatypes::{read_u32, Signature, TextEncoding};
use crate::group::{Group, GroupParseContext, GroupType, GROUP_HEADER_SIZE, GRUP};
use crate::io::EspReader;
use crate::record::Record;
use crate::resolver::PluginName;
use crate::utils::{EspError, ParseWarning};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// 过滤加载时总是进入的容器组（子组中可能有目标类型）
const CONTAINER_GROUPS: [Signature; 3] = [
    Signature::new(b"CELL"),
    Signature::new(b"WRLD"),
    Signature::new(b"DIAL"),
];

/// 加载选项
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// 只保留这些类型的记录（None 表示全部）
    pub filter: Option<HashSet<Signature>>,
    /// 非本地化字符串的编码
    pub encoding: TextEncoding,
    /// 顶级组并行解析
    pub parallel: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            filter: None,
            encoding: TextEncoding::default(),
            parallel: true,
        }
    }
}

impl LoadOptions {
    /// 只加载指定类型的记录
    pub fn with_filter(mut self, signatures: impl IntoIterator<Item = Signature>) -> Self {
        self.filter = Some(signatures.into_iter().collect());
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// 是否需要解析该顶级组
    fn wants_top_group(&self, label: Signature) -> bool {
        match &self.filter {
            Some(filter) => filter.contains(&label) || CONTAINER_GROUPS.contains(&label),
            None => true,
        }
    }
}

/// 读取器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// 尚未读取任何内容
    Unopened,
    /// 已读取头部
    HeaderRead,
    /// 正在逐个读取顶级组
    GroupStream,
    /// 数据已读完（或遇到无法继续的错误）
    Closed,
}

/// 流式插件读取器
///
/// 先读头部，再逐个产出顶级组。损坏的分支被截断并记录警告，
/// 只有头部或顶级组头部损坏时才返回错误。
pub struct PluginReader<'a> {
    data: &'a [u8],
    position: u64,
    state: ReaderState,
    options: LoadOptions,
    warnings: Vec<ParseWarning>,
}

impl<'a> PluginReader<'a> {
    pub fn new(data: &'a [u8], options: LoadOptions) -> Self {
        PluginReader {
            data,
            position: 0,
            state: ReaderState::Unopened,
            options,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// 当前在数据中的偏移
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<ParseWarning> {
        self.warnings
    }

    /// 读取并验证头部记录
    pub fn read_header(&mut self) -> Result<PluginHeader, EspError> {
        if self.state != ReaderState::Unopened {
            return Err(EspError::InvalidFormat("头部只能读取一次".into()));
        }

        if self.data.len() >= 4 {
            match &self.data[0..4] {
                b"TES4" => {}
                b"TES3" => {
                    self.state = ReaderState::Closed;
                    return Err(EspError::UnsupportedVersion("TES3 (Morrowind) 格式".into()));
                }
                other => {
                    self.state = ReaderState::Closed;
                    return Err(EspError::BadMagic(String::from_utf8_lossy(other).into_owned()));
                }
            }
        }

        let mut cursor = Cursor::new(self.data);
        let record = match Record::parse(&mut cursor) {
            Ok(record) => record,
            Err(e) => {
                self.state = ReaderState::Closed;
                return Err(e);
            }
        };
        let header = PluginHeader::parse(record, self.options.encoding)?;

        self.position = cursor.position();
        self.state = ReaderState::HeaderRead;
        Ok(header)
    }

    /// 读取下一个顶级组，数据结束时返回 None
    pub fn next_group(&mut self) -> Result<Option<Group>, EspError> {
        match self.state {
            ReaderState::Unopened => {
                return Err(EspError::InvalidFormat("必须先读取头部".into()));
            }
            ReaderState::Closed => return Ok(None),
            ReaderState::HeaderRead | ReaderState::GroupStream => {}
        }
        self.state = ReaderState::GroupStream;

        loop {
            let Some((start, end)) = self.next_boundary()? else {
                self.state = ReaderState::Closed;
                return Ok(None);
            };
            self.position = end;

            if !self.boundary_wanted(start) {
                continue;
            }

            let (group, warnings) = parse_top_group(self.data, start, end, self.options.filter.as_ref())?;
            self.warnings.extend(warnings);
            return Ok(Some(group));
        }
    }

    /// 读取剩余的全部顶级组
    ///
    /// 并行模式下先扫描顶级组边界，再并行解析各组，警告按文件顺序合并。
    pub fn read_all_groups(&mut self) -> Result<Vec<Group>, EspError> {
        if !self.options.parallel {
            let mut groups = Vec::new();
            while let Some(group) = self.next_group()? {
                groups.push(group);
            }
            return Ok(groups);
        }

        match self.state {
            ReaderState::Unopened => {
                return Err(EspError::InvalidFormat("必须先读取头部".into()));
            }
            ReaderState::Closed => return Ok(Vec::new()),
            ReaderState::HeaderRead | ReaderState::GroupStream => {}
        }
        self.state = ReaderState::GroupStream;

        // 第一遍：扫描顶级组边界
        let mut boundaries = Vec::new();
        while let Some((start, end)) = self.next_boundary()? {
            self.position = end;
            if self.boundary_wanted(start) {
                boundaries.push((start, end));
            }
        }
        self.state = ReaderState::Closed;

        // 第二遍：并行解析
        let data = self.data;
        let filter = self.options.filter.as_ref();
        let parsed: Result<Vec<(Group, Vec<ParseWarning>)>, EspError> = boundaries
            .par_iter()
            .map(|&(start, end)| parse_top_group(data, start, end, filter))
            .collect();

        let mut groups = Vec::with_capacity(boundaries.len());
        for (group, warnings) in parsed? {
            self.warnings.extend(warnings);
            groups.push(group);
        }
        Ok(groups)
    }

    /// 找到下一个顶级组的范围 [start, end)
    fn next_boundary(&mut self) -> Result<Option<(u64, u64)>, EspError> {
        let len = self.data.len() as u64;
        let pos = self.position;
        if pos >= len {
            return Ok(None);
        }

        if len - pos < GROUP_HEADER_SIZE as u64 {
            self.warn(pos, None, format!("文件末尾有 {} 字节无法解析", len - pos));
            self.position = len;
            return Ok(None);
        }

        let header = &self.data[pos as usize..pos as usize + GROUP_HEADER_SIZE];
        if &header[0..4] != GRUP.as_bytes() {
            self.state = ReaderState::Closed;
            return Err(EspError::InvalidFormat(format!(
                "在位置 {} 期望 GRUP，但找到 {}",
                pos,
                String::from_utf8_lossy(&header[0..4])
            )));
        }

        let mut cursor = Cursor::new(&header[4..8]);
        let size = read_u32(&mut cursor)? as u64;
        if size < GROUP_HEADER_SIZE as u64 {
            self.state = ReaderState::Closed;
            return Err(EspError::InvalidFormat(format!(
                "在位置 {} 发现异常组大小: {} bytes",
                pos, size
            )));
        }

        Ok(Some((pos, (pos + size).min(len))))
    }

    fn boundary_wanted(&self, start: u64) -> bool {
        let header = &self.data[start as usize..start as usize + GROUP_HEADER_SIZE];
        let group_type = i32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if GroupType::from(group_type) != GroupType::Top {
            return true;
        }
        let label = Signature([header[8], header[9], header[10], header[11]]);
        self.options.wants_top_group(label)
    }

    fn warn(&mut self, offset: u64, signature: Option<Signature>, message: String) {
        tracing::warn!(offset, "{}", message);
        self.warnings.push(ParseWarning {
            offset,
            signature,
            form_id: None,
            message,
        });
    }
}

/// 解析 data[start..end] 中的一个顶级组
fn parse_top_group(
    data: &[u8],
    start: u64,
    end: u64,
    filter: Option<&HashSet<Signature>>,
) -> Result<(Group, Vec<ParseWarning>), EspError> {
    // 越界的组大小在这里被截断，由组解析器记录警告
    let slice = &data[start as usize..end as usize];
    let mut cursor = Cursor::new(slice);
    let mut ctx = GroupParseContext::new(start, filter);
    let group = Group::parse_with(&mut cursor, &mut ctx)?;
    Ok((group, ctx.warnings))
}

impl Plugin {
    /// 加载插件文件（默认选项）
    pub fn load(path: PathBuf) -> Result<Self, EspError> {
        Self::load_with_options(path, &LoadOptions::default())
    }

    /// 加载插件文件
    ///
    /// 使用内存映射读取，零拷贝。
    pub fn load_with_options(path: PathBuf, options: &LoadOptions) -> Result<Self, EspError> {
        if !path.exists() {
            return Err(EspError::NotFound(path));
        }
        let file = std::fs::File::open(&path)?;
        // SAFETY: 映射只读，解析期间不修改文件
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_data(path, &mmap[..], options)
    }

    /// 使用自定义 Reader 加载插件文件
    ///
    /// ```rust,ignore
    /// use esp_patcher::{Plugin, DefaultEspReader, LoadOptions};
    /// let plugin = Plugin::load_with_reader("example.esp".into(), &DefaultEspReader, &LoadOptions::default())?;
    /// ```
    pub fn load_with_reader(
        path: PathBuf,
        reader: &dyn EspReader,
        options: &LoadOptions,
    ) -> Result<Self, EspError> {
        let raw = reader.read(&path)?;
        Self::from_data(path, &raw.bytes, options)
    }

    /// 从内存数据解析插件
    pub fn from_bytes(name: &str, data: &[u8]) -> Result<Self, EspError> {
        Self::from_bytes_with_options(name, data, &LoadOptions::default())
    }

    pub fn from_bytes_with_options(
        name: &str,
        data: &[u8],
        options: &LoadOptions,
    ) -> Result<Self, EspError> {
        Self::from_data(PathBuf::from(name), data, options)
    }

    /// 并行加载多个插件，结果顺序与输入一致
    pub fn open_all(paths: &[PathBuf], options: &LoadOptions) -> Vec<Result<Plugin, EspError>> {
        paths
            .par_iter()
            .map(|path| Self::load_with_options(path.clone(), options))
            .collect()
    }

    fn from_data(path: PathBuf, data: &[u8], options: &LoadOptions) -> Result<Self, EspError> {
        let name = plugin_name_of(&path);
        let mut reader = PluginReader::new(data, options.clone());
        let header = reader.read_header()?;
        let groups = reader.read_all_groups()?;
        let warnings = reader.into_warnings();

        tracing::debug!(
            plugin = %name,
            groups = groups.len(),
            warnings = warnings.len(),
            "插件已加载"
        );

        Ok(Plugin {
            path,
            name,
            header,
            groups,
            warnings,
            encoding: options.encoding,
            partial: options.filter.is_some(),
        })
    }
}

fn plugin_name_of(path: &Path) -> PluginName {
    match path.file_name() {
        Some(file_name) => PluginName::new(file_name.to_string_lossy().as_ref()),
        None => PluginName::new(path.to_string_lossy().as_ref()),
    }
}
