use super::Plugin;
use crate::datatypes::Signature;
use crate::group::{Group, GroupChild, GroupType};
use crate::record::Record;
use std::slice;

/// 按文件顺序深度优先遍历记录（惰性）
pub struct RecordIter<'a> {
    top: slice::Iter<'a, Group>,
    stack: Vec<slice::Iter<'a, GroupChild>>,
    filter: Option<Vec<Signature>>,
}

impl<'a> RecordIter<'a> {
    pub(crate) fn new(groups: &'a [Group], filter: Option<Vec<Signature>>) -> Self {
        RecordIter {
            top: groups.iter(),
            stack: Vec::new(),
            filter,
        }
    }

    fn wants(&self, signature: &Signature) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.contains(signature))
    }

    /// 顶级组中不可能出现目标类型时跳过整组
    fn may_contain(&self, group: &Group) -> bool {
        match (&self.filter, group.group_type) {
            (Some(filter), GroupType::Top) => {
                let label = Signature(group.label);
                filter.contains(&label) || matches!(&label.0, b"CELL" | b"WRLD" | b"DIAL")
            }
            _ => true,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a Record;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(children) = self.stack.last_mut() else {
                let group = self.top.next()?;
                if self.may_contain(group) {
                    self.stack.push(group.children.iter());
                }
                continue;
            };
            match children.next() {
                Some(GroupChild::Record(record)) => {
                    if self.wants(&record.signature) {
                        return Some(record);
                    }
                }
                Some(GroupChild::Group(group)) => self.stack.push(group.children.iter()),
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

impl Plugin {
    /// 全部记录（不含头部）
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter::new(&self.groups, None)
    }

    /// 指定类型的记录
    pub fn records_of(&self, signatures: &[Signature]) -> RecordIter<'_> {
        RecordIter::new(&self.groups, Some(signatures.to_vec()))
    }

    /// 可选过滤的遍历
    pub fn iterate(&self, signatures: Option<&[Signature]>) -> RecordIter<'_> {
        RecordIter::new(&self.groups, signatures.map(|s| s.to_vec()))
    }

    /// 带祖先组路径的遍历（外层组在前）
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(&[&Group], &Record),
    {
        let mut path: Vec<&Group> = Vec::new();
        for group in &self.groups {
            walk_group(group, &mut path, &mut visit);
        }
    }
}

fn walk_group<'a, F>(group: &'a Group, path: &mut Vec<&'a Group>, visit: &mut F)
where
    F: FnMut(&[&Group], &Record),
{
    path.push(group);
    for child in &group.children {
        match child {
            GroupChild::Record(record) => visit(path.as_slice(), record),
            GroupChild::Group(subgroup) => walk_group(subgroup, path, visit),
        }
    }
    path.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginHeader;

    fn sample() -> Plugin {
        let mut plugin = Plugin::new_empty("Mod.esp", PluginHeader::new(1.71));

        let mut glob = Group::top(Signature::new(b"GLOB"));
        glob.children.push(GroupChild::Record(Record::new(Signature::new(b"GLOB"), 0x800, 0)));

        let mut cells = Group::top(Signature::new(b"CELL"));
        let mut block = Group::new(0i32.to_le_bytes(), GroupType::InteriorCellBlock);
        block.children.push(GroupChild::Record(Record::new(Signature::new(b"CELL"), 0x900, 0)));
        let mut children = Group::new(0x900u32.to_le_bytes(), GroupType::CellChildren);
        let mut temporary = Group::new(0x900u32.to_le_bytes(), GroupType::CellTemporaryChildren);
        temporary.children.push(GroupChild::Record(Record::new(Signature::new(b"REFR"), 0x901, 0)));
        children.children.push(GroupChild::Group(Box::new(temporary)));
        block.children.push(GroupChild::Group(Box::new(children)));
        cells.children.push(GroupChild::Group(Box::new(block)));

        plugin.groups.push(glob);
        plugin.groups.push(cells);
        plugin
    }

    #[test]
    fn test_records_in_file_order() {
        let plugin = sample();
        let ids: Vec<u32> = plugin.records().map(|r| r.form_id).collect();
        assert_eq!(ids, vec![0x800, 0x900, 0x901]);
    }

    #[test]
    fn test_records_of_filters_nested() {
        let plugin = sample();
        let refs: Vec<u32> = plugin
            .records_of(&[Signature::new(b"REFR")])
            .map(|r| r.form_id)
            .collect();
        assert_eq!(refs, vec![0x901]);
        assert_eq!(plugin.iterate(Some(&[Signature::new(b"GLOB")])).count(), 1);
        assert_eq!(plugin.iterate(None).count(), 3);
    }

    #[test]
    fn test_walk_reports_ancestry() {
        let plugin = sample();
        let mut depths = Vec::new();
        plugin.walk(|path, record| depths.push((record.form_id, path.len())));
        assert_eq!(depths, vec![(0x800, 1), (0x900, 2), (0x901, 4)]);
    }
}
