//! 块组(Chunk)：文件数据的 4 块读写缓冲
//!
//! 块组按 VBN 对齐到 4 块，挂在所属文件下面。获取时可以声明要写的块，
//! 释放时只能把声明过的块标为已修改；写回在块组空闲且被淘汰、文件关闭
//! 或会话刷新时进行。

use block_dev::BLOCK_SIZE;

use crate::cache::{CacheFlag, Handle, Released};
use crate::session::FileHandle;
use crate::{Error, Result, Session};

/// 每个块组的块数
pub const CHUNK_BLOCKS: u32 = 4;

/// 清零时一次写出的最多块数
const ZERO_RUN: u32 = 32;

#[derive(Debug)]
pub struct Chunk {
    pub(crate) file: FileHandle,
    /// 第一个块的 VBN
    base: u32,
    /// 有效块数，文件末尾的块组可能不满
    blocks: u32,
    pub(crate) data: Vec<u8>,
    /// 当前持有者获准修改的块
    writable: u8,
    /// 尚未写回的块
    pub(crate) modified: u8,
}

impl Chunk {
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn is_modified(&self) -> bool {
        self.modified != 0
    }
}

/// 一次块组访问的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub chunk: Handle<Chunk>,
    /// 所请求的块在缓冲中的字节偏移
    pub offset: usize,
    /// 从所请求的块起，本块组内还可连续访问的块数
    pub blocks: u32,
    /// 本次获准修改的块
    pub modmask: u8,
}

#[inline]
fn chunk_base(vbn: u32) -> u32 {
    ((vbn - 1) / CHUNK_BLOCKS) * CHUNK_BLOCKS + 1
}

/// 掩码中最高位对应的块序号
#[inline]
fn top_block(mask: u8) -> u32 {
    7 - mask.leading_zeros()
}

impl Session {
    /// 取得包含`vbn`的块组，`write_blocks`为准备修改的块数（从`vbn`起）
    pub fn access_chunk(
        &mut self,
        fcb: FileHandle,
        vbn: u32,
        write_blocks: u32,
    ) -> Result<ChunkRef> {
        let file = self.files.get(fcb)?;
        if vbn == 0 || vbn > file.highest {
            return Err(Error::EndOfFile);
        }
        if write_blocks > 0 && !file.write {
            return Err(Error::WriteLocked);
        }
        let base = chunk_base(vbn);
        let wanted = CHUNK_BLOCKS.min(file.highest - base + 1);

        let chunk = match self.chunks.search(Some(fcb.raw()), &base) {
            Some(chunk) => {
                // 文件扩展之后，末尾的块组需要补上新的块
                let have = self.chunks.get(chunk)?.blocks;
                if have < wanted {
                    let mut data = std::mem::take(&mut self.chunks.get_mut(chunk)?.data);
                    let loaded = self.load_blocks(fcb, base, have, wanted, &mut data);
                    let c = self.chunks.get_mut(chunk)?;
                    c.data = data;
                    if let Err(e) = loaded {
                        self.chunks.untouch(chunk, false)?;
                        return Err(e);
                    }
                    c.blocks = wanted;
                }
                log::trace!("chunk {base}: cache hit");
                chunk
            }
            None => {
                let mut data = Vec::new();
                data.try_reserve_exact(CHUNK_BLOCKS as usize * BLOCK_SIZE)?;
                data.resize(CHUNK_BLOCKS as usize * BLOCK_SIZE, 0);
                self.load_blocks(fcb, base, 0, wanted, &mut data)?;
                self.chunks.insert(
                    Some(fcb.raw()),
                    base,
                    Chunk {
                        file: fcb,
                        base,
                        blocks: wanted,
                        data,
                        writable: 0,
                        modified: 0,
                    },
                )?
            }
        };

        let index = vbn - base;
        let c = self.chunks.get_mut(chunk)?;
        let blocks = c.blocks - index;
        let modmask = if write_blocks > 0 {
            let n = write_blocks.min(blocks);
            (((1u32 << n) - 1) << index) as u8
        } else {
            0
        };
        c.writable |= modmask;
        if modmask != 0 {
            self.chunks.set_flag(chunk, CacheFlag::WriteIntent, true)?;
        }
        Ok(ChunkRef {
            chunk,
            offset: index as usize * BLOCK_SIZE,
            blocks,
            modmask,
        })
    }

    /// 释放块组，`modmask`中的块被标为已修改
    ///
    /// 不带`reuse`时块组立即写回并移出缓存。抬高高水位失败时引用照样释放。
    pub fn deaccess_chunk(&mut self, chunk: Handle<Chunk>, modmask: u8, reuse: bool) -> Result<()> {
        let c = self.chunks.get_mut(chunk)?;
        if modmask & !c.writable != 0 {
            log::error!(
                "chunk {}: modify mask {modmask:#04x} outside granted {:#04x}",
                c.base,
                c.writable
            );
            return Err(Error::WriteLocked);
        }
        let (file, base) = (c.file, c.base);
        let raised = if modmask != 0 {
            c.modified |= modmask;
            self.raise_highwater(file, base + top_block(modmask))
        } else {
            Ok(())
        };

        if self.chunks.untouch(chunk, modmask != 0)? == Released::Idle {
            self.chunks.get_mut(chunk)?.writable = 0;
            self.chunks.set_flag(chunk, CacheFlag::WriteIntent, false)?;
            if !reuse && raised.is_ok() {
                self.flush_chunk(chunk)?;
                self.chunks.remove(chunk)?;
            }
        }
        raised?;
        self.evict_chunks()
    }

    /// 请求块的 512 字节
    pub fn chunk_block(&self, cref: &ChunkRef) -> Result<&[u8]> {
        let c = self.chunks.get(cref.chunk)?;
        Ok(&c.data[cref.offset..cref.offset + BLOCK_SIZE])
    }

    /// 从请求块起本块组内连续的数据
    pub fn chunk_data(&self, cref: &ChunkRef) -> Result<&[u8]> {
        let c = self.chunks.get(cref.chunk)?;
        Ok(&c.data[cref.offset..c.blocks as usize * BLOCK_SIZE])
    }

    /// 获准修改的那几块
    pub fn chunk_data_mut(&mut self, cref: &ChunkRef) -> Result<&mut [u8]> {
        if cref.modmask == 0 {
            return Err(Error::WriteLocked);
        }
        let end = (top_block(cref.modmask) as usize + 1) * BLOCK_SIZE;
        let c = self.chunks.get_mut(cref.chunk)?;
        Ok(&mut c.data[cref.offset..end])
    }

    /// 读出文件的一个块
    pub fn read_block(&mut self, fcb: FileHandle, vbn: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::BadParameter);
        }
        let cref = self.access_chunk(fcb, vbn, 0)?;
        buf.copy_from_slice(self.chunk_block(&cref)?);
        self.deaccess_chunk(cref.chunk, 0, true)
    }

    /// 写入文件的一个块，写回延迟到块组被淘汰或文件关闭时
    pub fn write_block(&mut self, fcb: FileHandle, vbn: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(Error::BadParameter);
        }
        let cref = self.access_chunk(fcb, vbn, 1)?;
        self.chunk_data_mut(&cref)?[..BLOCK_SIZE].copy_from_slice(buf);
        self.deaccess_chunk(cref.chunk, cref.modmask, true)
    }

    /// 写回块组中已修改的块，全部成功才清除修改标记
    pub(crate) fn flush_chunk(&mut self, chunk: Handle<Chunk>) -> Result<()> {
        let c = self.chunks.get(chunk)?;
        let (file, base, blocks, modified) = (c.file, c.base, c.blocks, c.modified);
        if modified == 0 {
            return Ok(());
        }
        let volume = self.files.get(file)?.volume;

        let mut i = 0;
        while i < blocks {
            if modified & (1 << i) == 0 {
                i += 1;
                continue;
            }
            let map = self.get_window(file, base + i)?;
            let mut n = 1;
            while i + n < blocks && n < map.count && modified & (1 << (i + n)) != 0 {
                n += 1;
            }
            let range = i as usize * BLOCK_SIZE..(i + n) as usize * BLOCK_SIZE;
            let data = &self.chunks.get(chunk)?.data[range];
            if let Err(e) = self
                .member_device(volume, map.rvn)?
                .write_blocks(u64::from(map.lbn.get()), data)
            {
                log::warn!("chunk {base}: write of {n} block(s) at LBN {} failed: {e}", map.lbn);
                return Err(e.into());
            }
            log::trace!("chunk {base}: wrote VBN {}..{} at LBN {}", base + i, base + i + n, map.lbn);
            i += n;
        }

        self.chunks.get_mut(chunk)?.modified = 0;
        self.chunks.set_flag(chunk, CacheFlag::Modified, false)
    }

    /// 丢弃文件中从`new_highest`之后的块组，末尾块组截短
    pub(crate) fn truncate_chunks(&mut self, fcb: FileHandle, new_highest: u32) -> Result<()> {
        for chunk in self.chunks.children(Some(fcb.raw())) {
            let c = self.chunks.get_mut(chunk)?;
            if c.base > new_highest {
                if self.chunks.refcount(chunk)? != 0 {
                    return Err(Error::BugCheck("truncating an accessed chunk"));
                }
                self.chunks.remove(chunk)?;
            } else if c.base + c.blocks - 1 > new_highest {
                c.blocks = new_highest - c.base + 1;
                let keep = ((1u32 << c.blocks) - 1) as u8;
                c.modified &= keep;
                c.writable &= keep;
            }
        }
        Ok(())
    }

    /// 把块`base..base+to`中`from`之后的部分读进缓冲
    fn load_blocks(
        &mut self,
        fcb: FileHandle,
        base: u32,
        from: u32,
        to: u32,
        data: &mut [u8],
    ) -> Result<()> {
        let file = self.files.get(fcb)?;
        let (volume, highwater) = (file.volume, file.highwater);

        let mut i = from;
        while i < to {
            let vbn = base + i;
            let range_of = |i: u32, n: u32| i as usize * BLOCK_SIZE..(i + n) as usize * BLOCK_SIZE;
            // 高水位之后的块读作全零
            if highwater != 0 && vbn >= highwater {
                data[range_of(i, to - i)].fill(0);
                break;
            }
            let map = self.get_window(fcb, vbn)?;
            let mut n = map.count.min(to - i);
            if highwater != 0 {
                n = n.min(highwater - vbn);
            }
            self.member_device(volume, map.rvn)?
                .read_blocks(u64::from(map.lbn.get()), &mut data[range_of(i, n)])?;
            log::trace!("chunk {base}: read VBN {vbn}..{} from LBN {}", vbn + n, map.lbn);
            i += n;
        }
        Ok(())
    }

    /// 修改到高水位处或之后时立即抬高高水位
    ///
    /// 旧高水位与新写入块之间的块此前读作全零，抬高之前先在磁盘上清零，
    /// 否则会读出这些簇上一个主人留下的数据。
    fn raise_highwater(&mut self, fcb: FileHandle, vbn: u32) -> Result<()> {
        let old = self.files.get(fcb)?.highwater;
        if old == 0 || vbn < old {
            return Ok(());
        }
        self.zero_blocks(fcb, old, vbn)?;
        let highwater = vbn + 1;
        self.files.get_mut(fcb)?.highwater = highwater;
        self.update_header(fcb, |h| h.set_highwater(highwater))
    }

    /// 在磁盘上把 VBN `from..to` 写成全零
    ///
    /// 缓存中这些块本来就是合成的零，只有已声明修改的块会在写回时覆盖它们。
    fn zero_blocks(&mut self, fcb: FileHandle, from: u32, to: u32) -> Result<()> {
        if from >= to {
            return Ok(());
        }
        let volume = self.files.get(fcb)?.volume;
        let zero = vec![0u8; ZERO_RUN as usize * BLOCK_SIZE];
        let mut vbn = from;
        while vbn < to {
            let map = self.get_window(fcb, vbn)?;
            let n = map.count.min(to - vbn).min(ZERO_RUN);
            self.member_device(volume, map.rvn)?
                .write_blocks(u64::from(map.lbn.get()), &zero[..n as usize * BLOCK_SIZE])?;
            vbn += n;
        }
        log::trace!("file {fcb:?}: zeroed VBN {from}..{to} below new highwater");
        Ok(())
    }

    /// 空闲块组超出上限时写回并移除最久未用的
    ///
    /// 写回时映射文件块可能再次释放块组，这时不重入淘汰。
    fn evict_chunks(&mut self) -> Result<()> {
        if self.evicting {
            return Ok(());
        }
        self.evicting = true;
        let result = self.evict_idle_chunks();
        self.evicting = false;
        result
    }

    fn evict_idle_chunks(&mut self) -> Result<()> {
        while self.chunks.len() > self.chunk_limit {
            let Some(victim) = self.chunks.lru_idle() else {
                break;
            };
            if let Err(e) = self.flush_chunk(victim) {
                log::warn!("eviction of chunk {victim:?} failed: {e}");
                return Err(e);
            }
            self.chunks.remove(victim)?;
        }
        Ok(())
    }
}
