//! 文件头的修改：新建、扩展、截短与文件结尾

use block_dev::BLOCK_SIZE;
use enumflags2::BitFlags;

use crate::access::HeadRef;
use crate::layout::fid::FileId;
use crate::layout::header::{FileChar, FileHeader};
use crate::layout::map::{self, Extent};
use crate::session::{FileHandle, VolumeHandle};
use crate::{Error, Result, Session};

/// 扩展头链中的一个文件头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainHeader {
    Primary,
    Extension(FileId),
}

impl Session {
    /// 在卷集第一个成员上新建一个空文件头，返回其 File-ID
    ///
    /// 序号在旧文件头的基础上加一，旧的 File-ID 因此失效。
    pub fn create_file(
        &mut self,
        volume: VolumeHandle,
        name: &str,
        filechar: BitFlags<FileChar>,
        backlink: FileId,
    ) -> Result<FileId> {
        let vol = self.volumes.get(volume)?;
        if !vol.writable {
            return Err(Error::WriteLocked);
        }
        let rvn = if vol.members.len() > 1 { 1 } else { 0 };

        let number = self.alloc_file_number(volume, 1)?;
        match self.write_new_header(volume, number, rvn, name, filechar, backlink) {
            Ok(fid) => {
                log::debug!("created {name} as {fid}");
                Ok(fid)
            }
            Err(e) => {
                self.free_file_number(volume, 1, number)?;
                Err(e)
            }
        }
    }

    fn write_new_header(
        &mut self,
        volume: VolumeHandle,
        number: u32,
        rvn: u8,
        name: &str,
        filechar: BitFlags<FileChar>,
        backlink: FileId,
    ) -> Result<FileId> {
        let (index, vbn) = self.header_vbn(volume, 1, number)?;
        let cref = self.access_chunk(index, vbn, 1)?;
        let block = &mut self.chunk_data_mut(&cref)?[..BLOCK_SIZE];

        let old = FileHeader(&*block).fid();
        let seq = old.seq.wrapping_add(1).max(1);
        let fid = FileId::from_number(number, seq, rvn);

        let mut header = FileHeader(block);
        header.init(fid, name, filechar);
        header.set_backlink(backlink);
        header.update_checksum();
        self.deaccess_chunk(cref.chunk, cref.modmask, true)?;
        Ok(fid)
    }

    /// 为文件追加至少`blocks`块，返回新的最高块
    ///
    /// 新区段写进扩展头链的最后一个文件头；映射区放不下时归还刚分配的块。
    pub fn extend_file(&mut self, fcb: FileHandle, blocks: u32) -> Result<u32> {
        let file = self.files.get(fcb)?;
        if !file.write {
            return Err(Error::WriteLocked);
        }
        let (volume, fid, highest) = (file.volume, file.fid, file.highest);
        if blocks == 0 {
            return Ok(highest);
        }

        let chain = self.header_chain(fcb)?;
        let last = chain.last().copied().unwrap_or(ChainHeader::Primary);
        let rvn = match last {
            ChainHeader::Primary => fid.rvn,
            ChainHeader::Extension(ext) => ext.rvn,
        };

        let extents = self.alloc_clusters(volume, rvn, blocks)?;
        let added: u32 = extents.iter().map(|ext| ext.count).sum();
        let appended = map::encode_all(&extents).and_then(|words| {
            self.with_chain_header(fcb, last, |h| {
                let mut all = h.map_words();
                all.extend(words);
                h.set_map_words(&all)
            })?
        });
        if let Err(e) = appended {
            self.free_extents(volume, rvn, &extents)?;
            log::debug!("file {fid}: extension failed: {e}");
            return Err(e);
        }

        let new_highest = highest + added;
        self.update_header(fcb, |h| h.set_hiblk(new_highest))?;
        self.files.get_mut(fcb)?.highest = new_highest;
        self.drop_windows(fcb)?;
        log::debug!("file {fid}: extended by {added} block(s) to {new_highest}");
        Ok(new_highest)
    }

    /// 把文件截短到`new_highest`（向上取整到簇），多出的块归还位图
    pub fn shrink_file(&mut self, fcb: FileHandle, new_highest: u32) -> Result<u32> {
        let file = self.files.get(fcb)?;
        if !file.write {
            return Err(Error::WriteLocked);
        }
        let (volume, fid, highest, highwater) =
            (file.volume, file.fid, file.highest, file.highwater);
        let cluster = u32::from(self.member_home(volume, fid.rvn)?.cluster);
        let keep = new_highest.div_ceil(cluster) * cluster;
        if keep >= highest {
            return Ok(highest);
        }

        // 先算出每个文件头保留的区段与要释放的区段
        let mut chain = vec![ChainHeader::Primary];
        chain.extend(self.header_chain(fcb)?);
        let mut rewrites = Vec::with_capacity(chain.len());
        let mut freed: Vec<(u8, Extent)> = Vec::new();
        let mut vbn = 1;
        for &link in &chain {
            let (words, rvn) = match link {
                ChainHeader::Primary => (self.header(fcb)?.map_words(), fid.rvn),
                ChainHeader::Extension(ext) => {
                    let head = self.access_head(volume, ext, false)?;
                    let words = FileHeader(self.head_bytes(&head)?).map_words();
                    self.release_head(head)?;
                    (words, ext.rvn)
                }
            };
            let mut kept = Vec::new();
            for ext in map::decode(&words)? {
                if vbn + ext.count - 1 <= keep {
                    kept.push(ext);
                } else if vbn > keep {
                    freed.push((rvn, ext));
                } else {
                    let head = keep + 1 - vbn;
                    kept.push(Extent {
                        count: head,
                        lbn: ext.lbn,
                    });
                    freed.push((
                        rvn,
                        Extent {
                            count: ext.count - head,
                            lbn: ext.lbn + head,
                        },
                    ));
                }
                vbn += ext.count;
            }
            rewrites.push((link, map::encode_all(&kept)?));
        }

        let mut by_rvn: Vec<u8> = freed.iter().map(|(rvn, _)| *rvn).collect();
        by_rvn.sort_unstable();
        by_rvn.dedup();
        for rvn in by_rvn {
            let extents: Vec<Extent> = freed
                .iter()
                .filter(|(r, _)| *r == rvn)
                .map(|(_, ext)| *ext)
                .collect();
            self.free_extents(volume, rvn, &extents)?;
        }

        for (link, words) in rewrites {
            self.with_chain_header(fcb, link, |h| h.set_map_words(&words))??;
        }
        let highwater = if highwater == 0 { 0 } else { highwater.min(keep + 1) };
        self.update_header(fcb, |h| {
            h.set_hiblk(keep);
            h.set_highwater(highwater);
            if h.eof_block() > keep {
                h.set_end_of_file(keep + 1, 0);
            }
        })?;
        let file = self.files.get_mut(fcb)?;
        file.highest = keep;
        file.highwater = highwater;

        self.drop_windows(fcb)?;
        self.truncate_chunks(fcb, keep)?;
        log::debug!("file {fid}: shrunk from {highest} to {keep} block(s)");
        Ok(keep)
    }

    /// 设置文件结尾：结尾块与其中第一个空闲字节
    pub fn set_end_of_file(&mut self, fcb: FileHandle, efblk: u32, ffbyte: u16) -> Result<()> {
        if usize::from(ffbyte) >= BLOCK_SIZE || efblk == 0 {
            return Err(Error::BadParameter);
        }
        self.update_header(fcb, |h| h.set_end_of_file(efblk, ffbyte))
    }

    /// 按字节数设置文件结尾
    pub fn set_file_size(&mut self, fcb: FileHandle, bytes: u64) -> Result<()> {
        let block = BLOCK_SIZE as u64;
        let efblk = u32::try_from(bytes / block + 1).map_err(|_| Error::BadParameter)?;
        self.set_end_of_file(fcb, efblk, (bytes % block) as u16)
    }

    /// 主文件头之后的扩展头，rvn 已规范化
    fn header_chain(&mut self, fcb: FileHandle) -> Result<Vec<ChainHeader>> {
        let file = self.files.get(fcb)?;
        let (volume, mut rvn) = (file.volume, file.fid.rvn);
        let mut chain = Vec::new();
        let mut next = self.header(fcb)?.ext_fid();
        while !next.is_null() {
            if next.rvn == 0 {
                next.rvn = rvn;
            }
            if chain.contains(&ChainHeader::Extension(next)) {
                return Err(Error::BugCheck("extension header chain loops"));
            }
            let head = self.access_head(volume, next, false)?;
            let following = FileHeader(self.head_bytes(&head)?).ext_fid();
            self.release_head(head)?;
            chain.push(ChainHeader::Extension(next));
            rvn = next.rvn;
            next = following;
        }
        Ok(chain)
    }

    /// 修改链上的某个文件头
    fn with_chain_header<R>(
        &mut self,
        fcb: FileHandle,
        link: ChainHeader,
        f: impl FnOnce(&mut FileHeader<&mut [u8]>) -> R,
    ) -> Result<R> {
        match link {
            ChainHeader::Primary => self.update_header(fcb, f),
            ChainHeader::Extension(ext) => {
                let volume = self.files.get(fcb)?.volume;
                let head: HeadRef = self.access_head(volume, ext, true)?;
                let result = self.update_head(&head, f);
                self.release_head(head)?;
                result
            }
        }
    }
}
