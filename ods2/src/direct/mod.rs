//! 目录检索
//!
//! 每次调用都是对目录文件块的一次独立检索：先按各块第一个记录的名称二分定位，
//! 再顺序扫描记录与版本。通配检索的续查位置保存在 [`Fib`] 中。

pub mod name;

use block_dev::BLOCK_SIZE;

use crate::layout::dir::{self, DirEntry, DirRecord, MAX_NAME};
use crate::layout::fid::FileId;
use crate::session::FileHandle;
use crate::{Error, Result, Session};

pub use name::{name_check, name_match, Match, NameSpec, MAX_VERSION, VERSION_ALL};

/// 目录操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirAction {
    Lookup,
    Delete,
    Insert,
}

/// 通配检索的续查位置：所在块与上次返回的名称和版本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wcc {
    block: u32,
    name: Vec<u8>,
    version: u16,
}

/// 文件标识块：检索的输入与输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fib {
    /// 找到的（或要插入的）文件
    pub fid: FileId,
    /// 所在目录
    pub did: FileId,
    pub wcc: Option<Wcc>,
}

impl Fib {
    pub fn new(did: FileId) -> Self {
        Self {
            did,
            ..Self::default()
        }
    }

    /// 插入时使用：要登记的文件
    pub fn with_fid(did: FileId, fid: FileId) -> Self {
        Self {
            fid,
            did,
            wcc: None,
        }
    }
}

/// 检索的起点
#[derive(Debug)]
struct Cursor {
    block: u32,
    /// 续查时跳过此位置及之前的项
    after: Option<(Vec<u8>, u16)>,
}

fn entry_name(rec: &DirRecord, version: u16) -> String {
    format!("{};{version}", String::from_utf8_lossy(&rec.name))
}

/// 按匹配式的版本从记录中选出项的下标
///
/// 同名记录可能跨块延续，`seen`是前面几块里已经出现过的同名项数。
fn pick_versions(rec: &DirRecord, version: i32, seen: usize) -> Vec<usize> {
    match version {
        VERSION_ALL => (0..rec.entries.len()).collect(),
        0 if seen == 0 && !rec.entries.is_empty() => vec![0],
        0 => Vec::new(),
        v if v < 0 => match (v.unsigned_abs() as usize).checked_sub(seen) {
            Some(n) if n < rec.entries.len() => vec![n],
            _ => Vec::new(),
        },
        v => rec
            .entries
            .iter()
            .position(|ent| i32::from(ent.version) == v)
            .into_iter()
            .collect(),
    }
}

/// 块内记录的排序位置 (名称升序, 版本降序)
fn before(name: &[u8], version: u16, key: &[u8], key_version: u16) -> bool {
    name < key || (name == key && version > key_version)
}

impl Session {
    /// 在目录`dir`中查找、删除或插入名称`spec`
    ///
    /// 成功时返回 `名称;版本`，[`Fib::fid`] 为找到、删除或插入的文件。
    /// 通配查找依次调用，直到返回 [`Error::NoMoreFiles`]。
    pub fn search_directory(
        &mut self,
        dir: FileHandle,
        fib: &mut Fib,
        spec: &str,
        action: DirAction,
    ) -> Result<String> {
        let spec = name_check(spec)?;
        let info = self.file_info(dir)?;
        if !info.directory {
            return Err(Error::BadDirectory);
        }
        if spec.name.len() > MAX_NAME {
            return Err(Error::BadFileName);
        }
        let eof = info.eof_block.min(info.highest);

        match action {
            DirAction::Insert => {
                if spec.wild || spec.version < 0 {
                    return Err(Error::BadFileName);
                }
                self.insert_entry(dir, eof, fib, &spec)
            }
            DirAction::Delete if spec.wild => Err(Error::BadFileName),
            DirAction::Lookup | DirAction::Delete => {
                let resume = if action == DirAction::Lookup && spec.wild {
                    fib.wcc.take()
                } else {
                    None
                };
                let resumed = resume.is_some();
                let cursor = match resume {
                    Some(wcc) => Cursor {
                        block: wcc.block.clamp(1, eof.max(1)),
                        after: Some((wcc.name, wcc.version)),
                    },
                    None => Cursor {
                        block: self.locate_block(dir, eof, &spec)?,
                        after: None,
                    },
                };
                match self.scan(dir, eof, fib, &spec, cursor, action) {
                    Err(Error::NoSuchFile) if resumed => Err(Error::NoMoreFiles),
                    result => result,
                }
            }
        }
    }

    /// 二分定位第一个可能含有匹配项的块
    fn locate_block(&mut self, dir: FileHandle, eof: u32, spec: &NameSpec) -> Result<u32> {
        let key = spec.literal_prefix().as_bytes();
        let key_version = match spec.version {
            v if v > 0 && !spec.has_wild_name() => v as u16,
            _ => u16::MAX,
        };
        let (mut lo, mut hi) = (1, eof);
        let mut found = 1;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let first = self.read_dir_block(dir, mid)?.into_iter().next();
            let go_right = match first {
                Some(rec) => before(&rec.name, rec.entries[0].version, key, key_version),
                None => true,
            };
            if go_right {
                found = mid;
                lo = mid + 1;
            } else {
                hi = mid - 1;
            }
        }
        log::trace!("directory search for {} starts at block {found}", spec.name);
        Ok(found)
    }

    fn scan(
        &mut self,
        dir: FileHandle,
        eof: u32,
        fib: &mut Fib,
        spec: &NameSpec,
        cursor: Cursor,
        action: DirAction,
    ) -> Result<String> {
        let pattern = spec.name.as_bytes();
        // 上一块最后一条记录的名称及其已有的项数
        let mut carry: Option<(Vec<u8>, usize)> = None;
        for block in cursor.block..=eof {
            let mut records = self.read_dir_block(dir, block)?;
            let carried = carry.take();
            for r in 0..records.len() {
                let rec = &records[r];
                let seen = match &carried {
                    Some((name, seen)) if r == 0 && rec.name == *name => *seen,
                    _ => 0,
                };
                let mut picks = match name_match(pattern, &rec.name) {
                    Match::Less | Match::NotEqual => continue,
                    Match::Greater => return Err(Error::NoSuchFile),
                    Match::Equal => pick_versions(rec, spec.version, seen),
                };
                if let Some((name, version)) = &cursor.after {
                    if rec.name < *name {
                        continue;
                    }
                    if rec.name == *name {
                        picks.retain(|&i| rec.entries[i].version < *version);
                    }
                }
                let Some(&i) = picks.first() else {
                    // 记录在下一块继续
                    if r + 1 == records.len() && block < eof {
                        carry = Some((rec.name.clone(), seen + rec.entries.len()));
                        continue;
                    }
                    if spec.has_wild_name() {
                        continue;
                    }
                    return Err(Error::NoSuchFile);
                };

                let entry = rec.entries[i];
                let found = entry_name(rec, entry.version);
                fib.fid = entry.fid;
                match action {
                    DirAction::Lookup => {
                        fib.wcc = spec.wild.then(|| Wcc {
                            block,
                            name: rec.name.clone(),
                            version: entry.version,
                        });
                    }
                    DirAction::Delete => {
                        records[r].entries.remove(i);
                        if records[r].is_empty() {
                            records.remove(r);
                        }
                        self.store_after_delete(dir, eof, block, &records)?;
                        log::debug!("removed {found} from directory");
                    }
                    DirAction::Insert => return Err(Error::BugCheck("insert through scan")),
                }
                return Ok(found);
            }
        }
        Err(Error::NoSuchFile)
    }

    fn insert_entry(
        &mut self,
        dir: FileHandle,
        eof: u32,
        fib: &mut Fib,
        spec: &NameSpec,
    ) -> Result<String> {
        if fib.fid.is_null() {
            return Err(Error::BadParameter);
        }
        let name = spec.name.as_bytes();
        if eof == 0 {
            let version = if spec.version == 0 { 1 } else { spec.version as u16 };
            let record = DirRecord::new(name, DirEntry { version, fid: fib.fid });
            if self.file(dir)?.highest_block() < 1 {
                self.extend_file(dir, 1)?;
            }
            self.write_dir_block(dir, 1, std::slice::from_ref(&record))?;
            self.set_end_of_file(dir, 2, 0)?;
            return Ok(entry_name(&record, version));
        }

        let exact = NameSpec {
            version: 0,
            ..spec.clone()
        };
        let start = self.locate_block(dir, eof, &exact)?;
        // 新项所在的块与记录下标
        let mut place = (eof, None);
        'blocks: for block in start..=eof {
            let records = self.read_dir_block(dir, block)?;
            for (r, rec) in records.iter().enumerate() {
                match name_match(name, &rec.name) {
                    Match::Less => continue,
                    Match::Equal => {
                        place = (block, Some((r, true)));
                        break 'blocks;
                    }
                    _ => {
                        place = (block, Some((r, false)));
                        break 'blocks;
                    }
                }
            }
        }

        let (block, at) = place;
        let mut records = self.read_dir_block(dir, block)?;
        let version = match at {
            Some((r, true)) => {
                let rec = &mut records[r];
                let version = match spec.version {
                    0 => u32::from(rec.entries[0].version) + 1,
                    v => v as u32,
                };
                if version > MAX_VERSION as u32 {
                    return Err(Error::BadParameter);
                }
                let version = version as u16;
                if rec.entries.iter().any(|ent| ent.version == version) {
                    return Err(Error::DuplicateFileName);
                }
                let pos = rec.entries.partition_point(|ent| ent.version > version);
                rec.entries.insert(pos, DirEntry { version, fid: fib.fid });
                version
            }
            Some((r, false)) => {
                let version = if spec.version == 0 { 1 } else { spec.version as u16 };
                records.insert(r, DirRecord::new(name, DirEntry { version, fid: fib.fid }));
                version
            }
            None => {
                let version = if spec.version == 0 { 1 } else { spec.version as u16 };
                records.push(DirRecord::new(name, DirEntry { version, fid: fib.fid }));
                version
            }
        };

        if dir::encode_block(&records).is_some() {
            self.write_dir_block(dir, block, &records)?;
        } else {
            self.split_block(dir, eof, block, records)?;
        }
        let found = format!("{};{version}", spec.name);
        log::debug!("entered {found} as {}", fib.fid);
        Ok(found)
    }

    /// 块放不下时一分为二，后面的块整体下移一块
    fn split_block(
        &mut self,
        dir: FileHandle,
        eof: u32,
        block: u32,
        mut records: Vec<DirRecord>,
    ) -> Result<()> {
        if records.iter().any(|rec| rec.len() + 2 > BLOCK_SIZE) {
            return Err(Error::DirectoryFull);
        }
        let half = dir::records_len(&records) / 2;
        let mut split = 1;
        let mut len = records[0].len();
        while split < records.len() - 1 && len + records[split].len() <= half {
            len += records[split].len();
            split += 1;
        }
        let tail = records.split_off(split);
        if dir::encode_block(&records).is_none() || dir::encode_block(&tail).is_none() {
            return Err(Error::DirectoryFull);
        }

        if self.file(dir)?.highest_block() < eof + 1 {
            self.extend_file(dir, 1)?;
        }
        for vbn in (block + 1..=eof).rev() {
            self.copy_dir_block(dir, vbn, vbn + 1)?;
        }
        self.write_dir_block(dir, block, &records)?;
        self.write_dir_block(dir, block + 1, &tail)?;
        self.set_end_of_file(dir, eof + 2, 0)?;
        log::debug!("directory block {block} split, {} block(s) in use", eof + 1);
        Ok(())
    }

    /// 删除后写回；块空了就把后面的块上移并截短目录
    fn store_after_delete(
        &mut self,
        dir: FileHandle,
        eof: u32,
        block: u32,
        records: &[DirRecord],
    ) -> Result<()> {
        if !records.is_empty() || eof == 1 {
            return self.write_dir_block(dir, block, records);
        }
        for vbn in block + 1..=eof {
            self.copy_dir_block(dir, vbn, vbn - 1)?;
        }
        let eof = eof - 1;
        self.set_end_of_file(dir, eof + 1, 0)?;
        self.shrink_file(dir, eof)?;
        log::debug!("directory compacted to {eof} block(s)");
        Ok(())
    }

    fn read_dir_block(&mut self, dir: FileHandle, vbn: u32) -> Result<Vec<DirRecord>> {
        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(dir, vbn, &mut block)?;
        dir::parse_block(&block)
    }

    fn write_dir_block(&mut self, dir: FileHandle, vbn: u32, records: &[DirRecord]) -> Result<()> {
        let block = dir::encode_block(records).ok_or(Error::DirectoryFull)?;
        self.write_block(dir, vbn, &block)
    }

    fn copy_dir_block(&mut self, dir: FileHandle, from: u32, to: u32) -> Result<()> {
        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(dir, from, &mut block)?;
        self.write_block(dir, to, &block)
    }
}
