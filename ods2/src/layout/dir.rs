//! 目录文件的记录
//!
//! 每个块由若干紧密排列的记录组成，以 0xFFFF 作为块内结束标记：
//!
//! `size:u16 verlimit:u16 flags:u8 namecount:u8 name[namecount] (补齐到偶数) entry[..]`
//!
//! `size` 不含自身，每个 entry 为 `version:u16 fid[6]`，版本号递减排列。
//! 记录之间按名称字节升序排列。

use super::fid::FileId;
use super::{set_word, word, BLOCK_SIZE};
use crate::{Error, Result};

pub const END_OF_BLOCK: u16 = 0xFFFF;
pub const ENTRY_SIZE: usize = 2 + FileId::SIZE;
/// size、verlimit、flags、namecount
const RECORD_HEADER: usize = 6;
/// 名称的最大长度
pub const MAX_NAME: usize = 86;
/// 新记录的默认版本上限
pub const DEFAULT_VERLIMIT: u16 = 32767;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub version: u16,
    pub fid: FileId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub verlimit: u16,
    pub flags: u8,
    pub name: Vec<u8>,
    pub entries: Vec<DirEntry>,
}

impl DirRecord {
    pub fn new(name: &[u8], entry: DirEntry) -> Self {
        Self {
            verlimit: DEFAULT_VERLIMIT,
            flags: 0,
            name: name.to_vec(),
            entries: vec![entry],
        }
    }

    /// 记录在磁盘上占用的字节数
    pub fn len(&self) -> usize {
        entries_offset(self.name.len()) + self.entries.len() * ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn encode_into(&self, buf: &mut [u8]) {
        let len = self.len();
        set_word(buf, 0, (len - 2) as u16);
        set_word(buf, 2, self.verlimit);
        buf[4] = self.flags;
        buf[5] = self.name.len() as u8;
        buf[RECORD_HEADER..RECORD_HEADER + self.name.len()].copy_from_slice(&self.name);
        let mut at = entries_offset(self.name.len());
        if at > RECORD_HEADER + self.name.len() {
            buf[at - 1] = 0;
        }
        for ent in &self.entries {
            set_word(buf, at, ent.version);
            ent.fid.write(buf, at + 2);
            at += ENTRY_SIZE;
        }
    }
}

/// 名称补齐到偶数后，第一个 entry 的偏移
#[inline]
pub fn entries_offset(namecount: usize) -> usize {
    RECORD_HEADER + namecount + (namecount & 1)
}

/// 解析一个目录块，格式不对时报 [`Error::BadDirectory`]
pub fn parse_block(block: &[u8]) -> Result<Vec<DirRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + 2 <= BLOCK_SIZE {
        let size = word(block, offset);
        if size == END_OF_BLOCK {
            break;
        }
        let len = size as usize + 2;
        if len % 2 != 0 || offset + len > BLOCK_SIZE || len < RECORD_HEADER {
            log::debug!("directory record at {offset}: bad size {size}");
            return Err(Error::BadDirectory);
        }
        let rec = &block[offset..offset + len];
        let namecount = rec[5] as usize;
        let first = entries_offset(namecount);
        if namecount == 0 || first + ENTRY_SIZE > len || (len - first) % ENTRY_SIZE != 0 {
            log::debug!("directory record at {offset}: bad layout");
            return Err(Error::BadDirectory);
        }
        let entries = rec[first..]
            .chunks_exact(ENTRY_SIZE)
            .map(|ent| DirEntry {
                version: word(ent, 0),
                fid: FileId::read(ent, 2),
            })
            .collect();
        records.push(DirRecord {
            verlimit: word(rec, 2),
            flags: rec[4],
            name: rec[RECORD_HEADER..RECORD_HEADER + namecount].to_vec(),
            entries,
        });
        offset += len;
    }
    Ok(records)
}

/// 记录序列占用的字节数
pub fn records_len(records: &[DirRecord]) -> usize {
    records.iter().map(DirRecord::len).sum()
}

/// 把记录写成一个块，放不下时返回`None`
pub fn encode_block(records: &[DirRecord]) -> Option<[u8; BLOCK_SIZE]> {
    if records_len(records) > BLOCK_SIZE {
        return None;
    }
    let mut block = [0u8; BLOCK_SIZE];
    let mut offset = 0;
    for rec in records {
        rec.encode_into(&mut block[offset..]);
        offset += rec.len();
    }
    if offset + 2 <= BLOCK_SIZE {
        set_word(&mut block, offset, END_OF_BLOCK);
    }
    Some(block)
}

/// 第一个记录的名称，空块返回`None`
pub fn first_record(block: &[u8]) -> Result<Option<DirRecord>> {
    Ok(parse_block(block)?.into_iter().next())
}
