//! 文件头与文件控制块的访问
//!
//! 文件头存放在索引文件里，经由索引文件的块组读写；
//! 唯一的例外是挂载时正在建立的索引文件自身，它借用直接读来的引导头。

use std::collections::BTreeMap;

use block_dev::BLOCK_SIZE;

use crate::cache::{CacheFlag, Handle, Released};
use crate::chunk::Chunk;
use crate::layout::fid::FileId;
use crate::layout::header::{FileChar, FileHeader};
use crate::layout::map::Extent;
use crate::session::{FileHandle, VolumeHandle};
use crate::{Error, Result, Session};

/// 文件控制块对其文件头的引用
#[derive(Debug)]
pub(crate) enum HeadRef {
    /// 挂载时的索引文件头
    Boot(Box<[u8; BLOCK_SIZE]>),
    /// 索引文件块组中的一个块
    Chunk {
        chunk: Handle<Chunk>,
        offset: usize,
        /// 获取时被许可修改的块
        modmask: u8,
    },
    Released,
}

/// 一个打开的文件
#[derive(Debug)]
pub struct FileControl {
    pub(crate) volume: VolumeHandle,
    /// rvn 已规范化为成员号
    pub(crate) fid: FileId,
    pub(crate) head: HeadRef,
    pub(crate) write: bool,
    pub(crate) delete_pending: bool,
    /// 已映射的最高块
    pub(crate) highest: u32,
    /// 从此块起读出全零，0 表示没有高水位
    pub(crate) highwater: u32,
}

impl FileControl {
    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn volume(&self) -> VolumeHandle {
        self.volume
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn highest_block(&self) -> u32 {
        self.highest
    }
}

/// 文件的概要信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub fid: FileId,
    pub name: String,
    pub highest: u32,
    pub highwater: u32,
    pub eof_block: u32,
    pub ffbyte: u16,
    pub directory: bool,
}

impl FileInfo {
    /// 按结束块与首个空闲字节计算的字节数
    pub fn size(&self) -> u64 {
        let efblk = if self.ffbyte == 0 {
            self.eof_block + 1
        } else {
            self.eof_block
        };
        u64::from(efblk.saturating_sub(1)) * BLOCK_SIZE as u64 + u64::from(self.ffbyte)
    }
}

/// 文件控制块在卷下的键
fn file_key(fid: &FileId) -> u32 {
    let rvn = u32::from(fid.volume());
    fid.number() | ((rvn - 1) << 24)
}

impl Session {
    /// 读取并校验文件头
    ///
    /// 文件头在索引文件中的 VBN 为 `文件号 - 1 + ibmapvbn + ibmapsize`。
    pub(crate) fn access_head(
        &mut self,
        volume: VolumeHandle,
        fid: FileId,
        write: bool,
    ) -> Result<HeadRef> {
        if write && !self.volumes.get(volume)?.writable {
            return Err(Error::WriteLocked);
        }
        let rvn = fid.volume();
        let (index, vbn) = self.header_vbn(volume, rvn, fid.number())?;

        let cref = self.access_chunk(index, vbn, u32::from(write))?;
        let valid = FileHeader(self.chunk_block(&cref)?).validate(&fid, rvn);
        if let Err(e) = valid {
            self.deaccess_chunk(cref.chunk, 0, true)?;
            return Err(e);
        }
        Ok(HeadRef::Chunk {
            chunk: cref.chunk,
            offset: cref.offset,
            modmask: cref.modmask,
        })
    }

    /// 文件头所在的索引文件及其VBN
    pub(crate) fn header_vbn(
        &self,
        volume: VolumeHandle,
        rvn: u8,
        number: u32,
    ) -> Result<(FileHandle, u32)> {
        if number == 0 {
            return Err(Error::BadParameter);
        }
        let member = self.volumes.get(volume)?.member(rvn)?;
        let index = member
            .index
            .ok_or(Error::BugCheck("index file not accessed"))?;
        let vbn = number - 1 + member.home.header_vbn_base();
        if vbn > self.files.get(index)?.highest {
            return Err(Error::NoSuchFile);
        }
        Ok((index, vbn))
    }

    pub(crate) fn release_head(&mut self, head: HeadRef) -> Result<()> {
        match head {
            HeadRef::Chunk { chunk, .. } => self.deaccess_chunk(chunk, 0, true),
            HeadRef::Boot(_) | HeadRef::Released => Ok(()),
        }
    }

    pub(crate) fn head_bytes<'a>(&'a self, head: &'a HeadRef) -> Result<&'a [u8]> {
        match head {
            HeadRef::Boot(block) => Ok(&block[..]),
            HeadRef::Chunk { chunk, offset, .. } => {
                Ok(&self.chunks.get(*chunk)?.data[*offset..*offset + BLOCK_SIZE])
            }
            HeadRef::Released => Err(Error::BugCheck("file header already released")),
        }
    }

    pub(crate) fn header(&self, fcb: FileHandle) -> Result<FileHeader<&[u8]>> {
        let file = self.files.get(fcb)?;
        self.head_bytes(&file.head).map(FileHeader)
    }

    /// 修改文件头，结束后重算校验和并标记所在块已修改
    pub(crate) fn update_head<R>(
        &mut self,
        head: &HeadRef,
        f: impl FnOnce(&mut FileHeader<&mut [u8]>) -> R,
    ) -> Result<R> {
        let HeadRef::Chunk {
            chunk,
            offset,
            modmask,
        } = *head
        else {
            return Err(Error::BugCheck("header is not modifiable"));
        };
        if modmask == 0 {
            return Err(Error::WriteLocked);
        }
        let block = self.chunks.get_mut(chunk)?;
        let mut header = FileHeader(&mut block.data[offset..offset + BLOCK_SIZE]);
        let result = f(&mut header);
        header.update_checksum();
        block.modified |= modmask;
        self.chunks.set_flag(chunk, CacheFlag::Modified, true)?;
        Ok(result)
    }

    pub(crate) fn update_header<R>(
        &mut self,
        fcb: FileHandle,
        f: impl FnOnce(&mut FileHeader<&mut [u8]>) -> R,
    ) -> Result<R> {
        let file = self.files.get(fcb)?;
        if !file.write {
            return Err(Error::WriteLocked);
        }
        let head = match &file.head {
            HeadRef::Chunk {
                chunk,
                offset,
                modmask,
            } => HeadRef::Chunk {
                chunk: *chunk,
                offset: *offset,
                modmask: *modmask,
            },
            _ => return Err(Error::BugCheck("header is not modifiable")),
        };
        self.update_head(&head, f)
    }

    /// 按 File-ID 打开文件，已打开时只增加引用
    ///
    /// 对只读打开的文件再请求写访问时，会重新获取可写的文件头。
    pub fn access_file(
        &mut self,
        volume: VolumeHandle,
        fid: FileId,
        write: bool,
    ) -> Result<FileHandle> {
        if fid.is_null() {
            return Err(Error::BadParameter);
        }
        if write && !self.volumes.get(volume)?.writable {
            return Err(Error::WriteLocked);
        }
        let fid = FileId {
            rvn: fid.volume(),
            ..fid
        };
        self.volumes.get(volume)?.member(fid.rvn)?;
        let key = file_key(&fid);

        if let Some(fcb) = self.files.search(Some(volume.raw()), &key) {
            let file = self.files.get(fcb)?;
            if fid.seq != 0 && file.fid.seq != fid.seq {
                self.files.untouch(fcb, false)?;
                return Err(Error::NoSuchFile);
            }
            if write && !file.write {
                if let Err(e) = self.upgrade_head(fcb) {
                    self.files.untouch(fcb, false)?;
                    return Err(e);
                }
            }
            log::trace!("file {fid}: cache hit");
            return Ok(fcb);
        }

        let member = self.volumes.get_mut(volume)?.member_mut(fid.rvn)?;
        let head = match (member.index, member.boot_header.take()) {
            (None, Some(boot)) if fid.number() == 1 => HeadRef::Boot(boot),
            (None, _) => return Err(Error::BugCheck("index file not accessed")),
            (Some(_), boot) => {
                member.boot_header = boot;
                self.access_head(volume, fid, write)?
            }
        };

        let header = FileHeader(self.head_bytes(&head)?);
        let file = FileControl {
            volume,
            fid,
            write,
            delete_pending: false,
            highest: header.hiblk(),
            highwater: header.highwater(),
            head,
        };
        log::debug!(
            "file {fid}: opened{} hiblk={} highwater={}",
            if write { " for write" } else { "" },
            file.highest,
            file.highwater
        );
        self.files.insert(Some(volume.raw()), key, file)
    }

    /// 释放一次引用，最后一次释放时回收控制块
    ///
    /// 回收失败（如写回出错）时文件保持打开，错误原样返回。
    pub fn deaccess_file(&mut self, fcb: FileHandle) -> Result<()> {
        match self.files.untouch(fcb, false)? {
            Released::InUse => Ok(()),
            Released::Idle => self.reclaim_file(fcb),
        }
    }

    /// 删除文件：没有其他打开者时打上删除标记，关闭时释放块与文件头
    pub fn erase_file(&mut self, volume: VolumeHandle, fid: FileId) -> Result<()> {
        let resfiles = self.member_home(volume, fid.volume())?.resfiles;
        if fid.number() <= u32::from(resfiles) {
            return Err(Error::BadParameter);
        }
        let fcb = self.access_file(volume, fid, true)?;
        if self.files.refcount(fcb)? > 1 {
            self.deaccess_file(fcb)?;
            return Err(Error::FileLocked);
        }
        if let Err(e) = self.update_header(fcb, |h| h.set_filechar(h.filechar() | FileChar::MarkDel)) {
            self.deaccess_file(fcb)?;
            return Err(e);
        }
        self.files.get_mut(fcb)?.delete_pending = true;
        self.deaccess_file(fcb)
    }

    pub fn file(&self, fcb: FileHandle) -> Result<&FileControl> {
        self.files.get(fcb)
    }

    /// 同一文件被打开的次数
    pub fn file_refcount(&self, fcb: FileHandle) -> Result<u32> {
        self.files.refcount(fcb)
    }

    pub fn file_info(&self, fcb: FileHandle) -> Result<FileInfo> {
        let file = self.files.get(fcb)?;
        let header = self.header(fcb)?;
        Ok(FileInfo {
            fid: file.fid,
            name: header.name(),
            highest: file.highest,
            highwater: file.highwater,
            eof_block: header.eof_block(),
            ffbyte: header.ffbyte(),
            directory: header.is_directory(),
        })
    }
}

impl Session {
    fn upgrade_head(&mut self, fcb: FileHandle) -> Result<()> {
        let file = self.files.get(fcb)?;
        let (volume, fid) = (file.volume, file.fid);
        let head = self.access_head(volume, fid, true)?;
        let old = std::mem::replace(&mut self.files.get_mut(fcb)?.head, head);
        self.files.get_mut(fcb)?.write = true;
        log::debug!("file {fid}: upgraded to write access");
        self.release_head(old)
    }

    /// 引用计数归零后的回收：删除 → 写回块组 → 释放文件头 → 移除子对象
    ///
    /// 任何一步失败时文件保持打开，文件头也不释放。
    fn reclaim_file(&mut self, fcb: FileHandle) -> Result<()> {
        let parent = Some(fcb.raw());

        // 释放失败时保留删除标记，下次关闭再试
        let deleted = self.files.get(fcb)?.delete_pending;
        if deleted {
            if let Err(e) = self.dealloc_file(fcb) {
                log::error!("deallocation of {} failed: {e}", self.files.get(fcb)?.fid);
                self.files.touch(fcb)?;
                return Err(e);
            }
            self.files.get_mut(fcb)?.delete_pending = false;
        }

        // 已删除文件的数据不再写回
        for chunk in self.chunks.children(parent).into_iter().filter(|_| !deleted) {
            if !self.chunks.contains(chunk) {
                continue;
            }
            if let Err(e) = self.flush_chunk(chunk) {
                self.files.touch(fcb)?;
                return Err(e);
            }
        }

        // 索引文件的文件头在它自己的块组里，由文件头持有一次引用
        let head_chunk = match self.files.get(fcb)?.head {
            HeadRef::Chunk { chunk, .. } => Some(chunk),
            _ => None,
        };
        for chunk in self.chunks.children(parent) {
            let held = u32::from(Some(chunk) == head_chunk);
            if self.chunks.refcount(chunk)? > held {
                log::error!("chunk {chunk:?} still accessed while its file is released");
                self.files.touch(fcb)?;
                return Err(Error::BugCheck("chunk busy at file release"));
            }
        }

        let head = std::mem::replace(&mut self.files.get_mut(fcb)?.head, HeadRef::Released);
        self.release_head(head)?;
        for chunk in self.chunks.children(parent) {
            self.chunks.remove(chunk)?;
        }
        for window in self.windows.children(parent) {
            self.windows.remove(window)?;
        }
        let file = self.files.remove(fcb)?;
        log::debug!("file {}: released", file.fid);
        Ok(())
    }

    /// 释放文件的全部块与文件头
    ///
    /// 先收集全部区段与扩展头并核对位图，这一步不改动任何东西；
    /// 之后先抹掉文件头、归还文件号，最后才归还块。中途失败只会漏掉块，
    /// 不会让仍被文件头映射的块变成空闲。
    fn dealloc_file(&mut self, fcb: FileHandle) -> Result<()> {
        let file = self.files.get(fcb)?;
        let (volume, fid, highest) = (file.volume, file.fid, file.highest);

        let mut runs: BTreeMap<u8, Vec<Extent>> = BTreeMap::new();
        let mut vbn = 1;
        while vbn <= highest {
            let map = self.get_window(fcb, vbn)?;
            let count = map.count.min(highest - vbn + 1);
            runs.entry(map.rvn).or_default().push(Extent {
                count,
                lbn: map.lbn,
            });
            vbn += count;
        }

        let mut chain = Vec::new();
        let mut next = self.header(fcb)?.ext_fid();
        let mut rvn = fid.rvn;
        while !next.is_null() {
            if next.rvn == 0 {
                next.rvn = rvn;
            }
            if chain.contains(&next) || chain.len() > u16::MAX as usize {
                return Err(Error::BugCheck("extension header chain loops"));
            }
            let head = self.access_head(volume, next, true)?;
            let following = FileHeader(self.head_bytes(&head)?).ext_fid();
            self.release_head(head)?;
            chain.push(next);
            rvn = next.rvn;
            next = following;
        }

        for (rvn, extents) in &runs {
            self.check_extents(volume, *rvn, extents)?;
        }
        for header in std::iter::once(&fid).chain(&chain) {
            if !self.file_number_in_use(volume, header.rvn, header.number())? {
                log::error!("file {fid}: header {header} has no file number");
                return Err(Error::BugCheck("file number already free"));
            }
        }

        self.update_header(fcb, |h| h.clear())?;
        for ext in &chain {
            let head = self.access_head(volume, *ext, true)?;
            let cleared = self.update_head(&head, |h| h.clear());
            self.release_head(head)?;
            cleared?;
        }
        self.free_file_number(volume, fid.rvn, fid.number())?;
        for ext in &chain {
            self.free_file_number(volume, ext.rvn, ext.number())?;
        }
        for (rvn, extents) in &runs {
            self.free_extents(volume, *rvn, extents)?;
        }

        log::debug!(
            "file {fid}: deallocated {} block(s), {} extension header(s)",
            highest,
            chain.len()
        );
        Ok(())
    }
}
