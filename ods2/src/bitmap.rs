//! 存储位图与文件号位图
//!
//! 存储位图在 `BITMAP.SYS` 中，VBN 1 为存储控制块，位从 VBN 2 开始，
//! 每位对应一个簇，置位表示空闲。
//! 文件号位图在索引文件的 `ibmapvbn` 处，第 n-1 位对应文件号 n，置位表示已使用。

use block_dev::BLOCK_SIZE;

use crate::layout::map::Extent;
use crate::session::{FileHandle, VolumeHandle};
use crate::{Error, Result, Session};

/// 每个位图块的位数
pub const BLOCK_BITS: u32 = BLOCK_SIZE as u32 * 8;

/// 存储位图的第一个块
pub const STORAGE_MAP_VBN: u32 = 2;

/// 文件中的一段位图
#[derive(Debug, Clone, Copy)]
struct Bitmap {
    file: FileHandle,
    start_vbn: u32,
    /// 有效位数
    bits: u32,
    /// 置位表示空闲（存储位图）还是已用（文件号位图）
    set_is_free: bool,
}

/// 位的编号
struct BitIndex(u32);

impl BitIndex {
    /// (块序号, 字节, 字节内的位)
    fn decode(self) -> (u32, usize, u8) {
        let block = self.0 / BLOCK_BITS;
        let inblock = self.0 % BLOCK_BITS;
        (block, (inblock / 8) as usize, (inblock % 8) as u8)
    }
}

impl Bitmap {
    /// 在前`limit`位中找出`count`个空闲位，返回若干段 (起始位, 长度)
    fn find_free(&self, session: &mut Session, count: u32, limit: u32) -> Result<Vec<(u32, u32)>> {
        let mut runs: Vec<(u32, u32)> = Vec::new();
        let mut found = 0;
        let mut buf = [0u8; BLOCK_SIZE];
        let end = self.bits.min(limit);
        let mut block = u32::MAX;

        for n in 0..end {
            let (b, byte, bit) = BitIndex(n).decode();
            if b != block {
                session.read_block(self.file, self.start_vbn + b, &mut buf)?;
                block = b;
            }
            let set = buf[byte] & (1 << bit) != 0;
            if set != self.set_is_free {
                continue;
            }
            match runs.last_mut() {
                Some((start, len)) if *start + *len == n => *len += 1,
                _ => runs.push((n, 1)),
            }
            found += 1;
            if found == count {
                return Ok(runs);
            }
        }
        Err(Error::DeviceFull)
    }

    /// 确认`start..start+count`全部处于已分配状态
    fn all_allocated(&self, session: &mut Session, start: u32, count: u32) -> Result<bool> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut block = u32::MAX;
        for n in start..start + count {
            if n >= self.bits {
                return Ok(false);
            }
            let (b, byte, bit) = BitIndex(n).decode();
            if b != block {
                session.read_block(self.file, self.start_vbn + b, &mut buf)?;
                block = b;
            }
            let set = buf[byte] & (1 << bit) != 0;
            if set == self.set_is_free {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 把一段位标为已分配或空闲
    fn mark(&self, session: &mut Session, start: u32, count: u32, allocated: bool) -> Result<()> {
        let value = allocated != self.set_is_free;
        let mut n = start;
        while n < start + count {
            let (b, _, _) = BitIndex(n).decode();
            let block_end = ((b + 1) * BLOCK_BITS).min(start + count);
            let cref = session.access_chunk(self.file, self.start_vbn + b, 1)?;
            let data = session.chunk_data_mut(&cref)?;
            for m in n..block_end {
                let (_, byte, bit) = BitIndex(m).decode();
                if value {
                    data[byte] |= 1 << bit;
                } else {
                    data[byte] &= !(1 << bit);
                }
            }
            session.deaccess_chunk(cref.chunk, cref.modmask, true)?;
            n = block_end;
        }
        Ok(())
    }

    /// 处于空闲状态的位数
    fn count_free(&self, session: &mut Session) -> Result<u32> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut free = 0;
        let blocks = self.bits.div_ceil(BLOCK_BITS);
        for b in 0..blocks {
            session.read_block(self.file, self.start_vbn + b, &mut buf)?;
            let bits = (self.bits - b * BLOCK_BITS).min(BLOCK_BITS);
            free += (0..bits)
                .filter(|n| (buf[(n / 8) as usize] & (1 << (n % 8)) != 0) == self.set_is_free)
                .count() as u32;
        }
        Ok(free)
    }
}

impl Session {
    fn storage_bitmap(&self, volume: VolumeHandle, rvn: u8) -> Result<(Bitmap, u32)> {
        let member = self.volumes.get(volume)?.member(rvn)?;
        let file = member.bitmap.ok_or(Error::WriteLocked)?;
        let cluster = u32::from(member.home.cluster);
        let clusters = self.member_device(volume, rvn)?.block_count() / u64::from(cluster);
        Ok((
            Bitmap {
                file,
                start_vbn: STORAGE_MAP_VBN,
                bits: clusters.min(u64::from(u32::MAX)) as u32,
                set_is_free: true,
            },
            cluster,
        ))
    }

    fn index_bitmap(&self, volume: VolumeHandle, rvn: u8) -> Result<(Bitmap, u32)> {
        let member = self.volumes.get(volume)?.member(rvn)?;
        let file = member.index.ok_or(Error::BugCheck("index file not accessed"))?;
        let home = &member.home;
        // 受预分配的文件头区域限制
        let highest = self.files.get(file)?.highest;
        let headers = (highest + 1).saturating_sub(home.header_vbn_base());
        let bits = home
            .maxfiles
            .min(u32::from(home.ibmapsize) * BLOCK_BITS);
        Ok((
            Bitmap {
                file,
                start_vbn: u32::from(home.ibmapvbn),
                bits,
                set_is_free: false,
            },
            headers,
        ))
    }

    /// 分配至少`blocks`块，首次适配，可能分成若干段
    ///
    /// 空间不够时不做任何分配。
    pub(crate) fn alloc_clusters(
        &mut self,
        volume: VolumeHandle,
        rvn: u8,
        blocks: u32,
    ) -> Result<Vec<Extent>> {
        let (bitmap, cluster) = self.storage_bitmap(volume, rvn)?;
        let need = blocks.div_ceil(cluster);
        if need == 0 {
            return Ok(Vec::new());
        }
        let runs = bitmap.find_free(self, need, u32::MAX)?;
        let mut extents = Vec::with_capacity(runs.len());
        for (start, len) in runs {
            bitmap.mark(self, start, len, true)?;
            extents.push(Extent::new(len * cluster, start * cluster));
        }
        log::debug!("member {rvn}: allocated {extents:?}");
        Ok(extents)
    }

    /// 释放区段，先确认每个簇都已分配再改位图
    pub(crate) fn free_extents(
        &mut self,
        volume: VolumeHandle,
        rvn: u8,
        extents: &[Extent],
    ) -> Result<()> {
        let ranges = self.check_extents(volume, rvn, extents)?;
        let (bitmap, _) = self.storage_bitmap(volume, rvn)?;
        for &(start, count) in &ranges {
            bitmap.mark(self, start, count, false)?;
        }
        log::debug!("member {rvn}: freed {} range(s)", ranges.len());
        Ok(())
    }

    /// 确认区段互不重叠且每个簇都处于已分配状态，返回按簇计的范围
    ///
    /// 只读位图，不做任何修改。
    pub(crate) fn check_extents(
        &mut self,
        volume: VolumeHandle,
        rvn: u8,
        extents: &[Extent],
    ) -> Result<Vec<(u32, u32)>> {
        let (bitmap, cluster) = self.storage_bitmap(volume, rvn)?;
        let mut ranges: Vec<(u32, u32)> = extents
            .iter()
            .filter(|ext| ext.count > 0)
            .map(|ext| {
                let start = ext.lbn.get() / cluster;
                let end = ext.end().div_ceil(cluster);
                (start, end - start)
            })
            .collect();
        ranges.sort_unstable();
        ranges.dedup();

        for pair in ranges.windows(2) {
            if pair[0].0 + pair[0].1 > pair[1].0 {
                log::error!("member {rvn}: overlapping extents {:?} and {:?}", pair[0], pair[1]);
                return Err(Error::BugCheck("extents overlap"));
            }
        }
        for &(start, count) in &ranges {
            if !bitmap.all_allocated(self, start, count)? {
                log::error!("member {rvn}: clusters {start}+{count} are already free");
                return Err(Error::BugCheck("double free of clusters"));
            }
        }
        Ok(ranges)
    }

    /// 卷成员上空闲的块数
    pub fn free_blocks(&mut self, volume: VolumeHandle, rvn: u8) -> Result<u64> {
        let (bitmap, cluster) = self.storage_bitmap(volume, rvn)?;
        Ok(u64::from(bitmap.count_free(self)?) * u64::from(cluster))
    }

    /// 分配一个文件号
    pub(crate) fn alloc_file_number(&mut self, volume: VolumeHandle, rvn: u8) -> Result<u32> {
        let (bitmap, headers) = self.index_bitmap(volume, rvn)?;
        let runs = bitmap.find_free(self, 1, headers)?;
        let (bit, _) = runs[0];
        bitmap.mark(self, bit, 1, true)?;
        log::trace!("member {rvn}: file number {} allocated", bit + 1);
        Ok(bit + 1)
    }

    pub(crate) fn free_file_number(
        &mut self,
        volume: VolumeHandle,
        rvn: u8,
        number: u32,
    ) -> Result<()> {
        if number == 0 {
            return Err(Error::BadParameter);
        }
        let (bitmap, _) = self.index_bitmap(volume, rvn)?;
        if !bitmap.all_allocated(self, number - 1, 1)? {
            log::error!("member {rvn}: file number {number} is not in use");
            return Err(Error::BugCheck("file number already free"));
        }
        bitmap.mark(self, number - 1, 1, false)
    }

    /// 文件号是否已被使用
    pub fn file_number_in_use(&mut self, volume: VolumeHandle, rvn: u8, number: u32) -> Result<bool> {
        if number == 0 {
            return Ok(false);
        }
        let (bitmap, _) = self.index_bitmap(volume, rvn)?;
        bitmap.all_allocated(self, number - 1, 1)
    }
}
