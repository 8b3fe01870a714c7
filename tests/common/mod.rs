//! 测试用的合成插件
#![allow(dead_code)]

use esp_patcher::group::{Group, GroupChild};
use esp_patcher::plugin::{MasterEntry, PluginHeader};
use esp_patcher::{Plugin, Record, Signature, Subrecord};

pub fn sig(bytes: &[u8; 4]) -> Signature {
    Signature::new(bytes)
}

pub fn zstring(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    data.push(0);
    data
}

pub fn record(signature: &[u8; 4], form_id: u32, subrecords: Vec<(&[u8; 4], Vec<u8>)>) -> Record {
    let mut record = Record::new(sig(signature), form_id, 0);
    record.set_subrecords(
        subrecords
            .into_iter()
            .map(|(s, data)| Subrecord::new(sig(s), data))
            .collect(),
    );
    record
}

/// LVLI：LVLD 为 chance_none，条目为 (level, reference, count)
pub fn lvli(form_id: u32, edid: &str, chance_none: u8, entries: &[(u16, u32, u16)]) -> Record {
    let mut subrecords = vec![(b"EDID", zstring(edid)), (b"LVLD", vec![chance_none])];
    if !entries.is_empty() {
        subrecords.push((b"LLCT", vec![entries.len() as u8]));
    }
    for (level, reference, count) in entries {
        let mut data = Vec::new();
        data.extend_from_slice(&level.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&reference.to_le_bytes());
        data.extend_from_slice(&count.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        subrecords.push((b"LVLO", data));
    }
    record(b"LVLI", form_id, subrecords)
}

pub fn flst(form_id: u32, edid: &str, forms: &[u32]) -> Record {
    let mut subrecords = vec![(b"EDID", zstring(edid))];
    for form in forms {
        subrecords.push((b"LNAM", form.to_le_bytes().to_vec()));
    }
    record(b"FLST", form_id, subrecords)
}

pub fn glob(form_id: u32, edid: &str, value: f32) -> Record {
    record(
        b"GLOB",
        form_id,
        vec![
            (b"EDID", zstring(edid)),
            (b"FNAM", vec![b'f']),
            (b"FLTV", value.to_le_bytes().to_vec()),
        ],
    )
}

/// 按顶级组收集记录的插件构造器
pub struct PluginBuilder {
    name: String,
    masters: Vec<String>,
    groups: Vec<Group>,
}

impl PluginBuilder {
    pub fn new(name: &str) -> Self {
        PluginBuilder {
            name: name.to_string(),
            masters: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn master(mut self, name: &str) -> Self {
        self.masters.push(name.to_string());
        self
    }

    pub fn record(mut self, record: Record) -> Self {
        let signature = record.signature;
        match self
            .groups
            .iter_mut()
            .find(|g| g.label_signature() == Some(signature))
        {
            Some(group) => group.children.push(GroupChild::Record(record)),
            None => {
                let mut group = Group::top(signature);
                group.children.push(GroupChild::Record(record));
                self.groups.push(group);
            }
        }
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut header = PluginHeader::new(1.71);
        header.set_masters(
            self.masters
                .iter()
                .map(|name| MasterEntry {
                    name: name.clone(),
                    size: 0,
                })
                .collect(),
        );
        let mut plugin = Plugin::new_empty(&self.name, header);
        plugin.groups = self.groups.clone();
        plugin.to_bytes().unwrap()
    }

    /// 序列化后重新解析，得到与从文件加载相同的插件
    pub fn build(&self) -> Plugin {
        Plugin::from_bytes(&self.name, &self.bytes()).unwrap()
    }
}
