//! 文件头(File Header)，每个文件在索引文件中占一个块
//!
//! 头部固定区 | 标识区(idoffset) | 映射区(mpoffset) | 访问控制区(acoffset) | 保留区(rsoffset) | 校验和

use enumflags2::{bitflags, BitFlags};

use super::fid::FileId;
use super::{
    long, set_long, set_swapped_long, set_word, swapped_long, verify_block_checksum, word,
    write_block_checksum, BLOCK_SIZE,
};
use crate::{Error, Result};

const IDOFFSET: usize = 0;
const MPOFFSET: usize = 1;
const ACOFFSET: usize = 2;
const RSOFFSET: usize = 3;
const SEG_NUM: usize = 4;
const STRUCLEV: usize = 6;
const FID: usize = 8;
const EXT_FID: usize = 14;
/// 记录属性区(FAT)，32字节
const RECATTR: usize = 20;
const RTYPE: usize = RECATTR;
const RATTRIB: usize = RECATTR + 1;
const RSIZE: usize = RECATTR + 2;
const HIBLK: usize = RECATTR + 4;
const EFBLK: usize = RECATTR + 8;
const FFBYTE: usize = RECATTR + 12;
const FILECHAR: usize = 52;
const MAP_INUSE: usize = 58;
const FILEOWNER: usize = 60;
const FILEPROT: usize = 64;
const BACKLINK: usize = 66;
const HIGHWATER: usize = 76;

/// 标识区内的偏移
const ID_FILENAME: usize = 0;
const ID_REVISION: usize = 20;
const ID_FILENAMEXT: usize = 54;
const ID_FILENAME_LEN: usize = 20;
const ID_FILENAMEXT_LEN: usize = 66;

/// 新文件头采用的区域偏移（以字计）
pub const STD_IDOFFSET: u8 = 40;
pub const STD_MPOFFSET: u8 = 100;
pub const STD_ACOFFSET: u8 = 255;
pub const STD_RSOFFSET: u8 = 255;

/// 可变长记录
pub const RTYPE_VARIABLE: u8 = 2;
/// 定长记录
pub const RTYPE_FIXED: u8 = 1;
/// 记录不跨块
pub const RATTRIB_NOSPAN: u8 = 0x08;

/// 文件特征位
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChar {
    NoBackup = 0x0000_0002,
    WriteBack = 0x0000_0004,
    ReadCheck = 0x0000_0008,
    WriteCheck = 0x0000_0010,
    ContigBest = 0x0000_0020,
    Locked = 0x0000_0040,
    Contig = 0x0000_0080,
    BadAcl = 0x0000_0800,
    Spool = 0x0000_1000,
    Directory = 0x0000_2000,
    BadBlock = 0x0000_4000,
    MarkDel = 0x0000_8000,
}

/// 文件头视图
#[derive(Debug, Clone, Copy)]
pub struct FileHeader<B>(pub B);

impl<B: AsRef<[u8]>> FileHeader<B> {
    #[inline]
    fn buf(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// 标识区的字节偏移
    pub fn id_offset(&self) -> usize {
        self.buf()[IDOFFSET] as usize * 2
    }

    /// 映射区的字节偏移
    pub fn map_offset(&self) -> usize {
        self.buf()[MPOFFSET] as usize * 2
    }

    pub fn ac_offset(&self) -> usize {
        self.buf()[ACOFFSET] as usize * 2
    }

    pub fn rs_offset(&self) -> usize {
        self.buf()[RSOFFSET] as usize * 2
    }

    pub fn seg_num(&self) -> u16 {
        word(self.buf(), SEG_NUM)
    }

    pub fn fid(&self) -> FileId {
        FileId::read(self.buf(), FID)
    }

    pub fn ext_fid(&self) -> FileId {
        FileId::read(self.buf(), EXT_FID)
    }

    pub fn backlink(&self) -> FileId {
        FileId::read(self.buf(), BACKLINK)
    }

    pub fn rtype(&self) -> u8 {
        self.buf()[RTYPE]
    }

    /// 最高已分配块
    pub fn hiblk(&self) -> u32 {
        swapped_long(self.buf(), HIBLK)
    }

    /// 文件结尾所在块
    pub fn efblk(&self) -> u32 {
        swapped_long(self.buf(), EFBLK)
    }

    /// 结尾块中第一个空闲字节
    pub fn ffbyte(&self) -> u16 {
        word(self.buf(), FFBYTE)
    }

    /// 最后一个有内容的块
    pub fn eof_block(&self) -> u32 {
        let efblk = self.efblk();
        if self.ffbyte() == 0 {
            efblk.saturating_sub(1)
        } else {
            efblk
        }
    }

    pub fn filechar(&self) -> BitFlags<FileChar> {
        BitFlags::from_bits_truncate(long(self.buf(), FILECHAR))
    }

    pub fn is_directory(&self) -> bool {
        self.filechar().contains(FileChar::Directory)
    }

    /// 映射区中已使用的字数
    pub fn map_inuse(&self) -> usize {
        self.buf()[MAP_INUSE] as usize
    }

    pub fn owner(&self) -> u32 {
        long(self.buf(), FILEOWNER)
    }

    /// 标识区足够大时才有高水位字段
    pub fn highwater(&self) -> u32 {
        if self.buf()[IDOFFSET] > 39 {
            long(self.buf(), HIGHWATER)
        } else {
            0
        }
    }

    /// 已使用的映射字
    pub fn map_words(&self) -> Vec<u16> {
        let start = self.map_offset();
        (0..self.map_inuse())
            .map(|i| word(self.buf(), start + i * 2))
            .collect()
    }

    /// 映射区可容纳的字数
    pub fn map_capacity(&self) -> usize {
        (self.ac_offset() - self.map_offset()) / 2
    }

    /// 标识区中记录的文件名
    pub fn name(&self) -> String {
        let id = self.id_offset();
        if id + ID_FILENAMEXT + ID_FILENAMEXT_LEN > BLOCK_SIZE {
            return String::new();
        }
        let buf = self.buf();
        let mut name: Vec<u8> = buf[id + ID_FILENAME..id + ID_FILENAME + ID_FILENAME_LEN].to_vec();
        name.extend_from_slice(&buf[id + ID_FILENAMEXT..id + ID_FILENAMEXT + ID_FILENAMEXT_LEN]);
        String::from_utf8_lossy(&name).trim_end().to_owned()
    }

    /// 校验文件头：校验和、FID 以及各区域偏移的单调性
    pub fn validate(&self, fid: &FileId, member_rvn: u8) -> Result<()> {
        let buf = self.buf();
        if buf.len() < BLOCK_SIZE || !verify_block_checksum(buf) {
            log::debug!("header {fid}: bad checksum");
            return Err(Error::NoSuchFile);
        }
        let on_disk = self.fid();
        if !fid.matches_header(&on_disk, member_rvn) {
            log::debug!("header {fid}: contains {on_disk}");
            return Err(Error::NoSuchFile);
        }
        let (id, mp, ac, rs) = (
            buf[IDOFFSET],
            buf[MPOFFSET],
            buf[ACOFFSET],
            buf[RSOFFSET],
        );
        if !(id <= mp && mp <= ac && ac <= rs) || self.map_inuse() > (ac - mp) as usize {
            log::debug!("header {fid}: bad area offsets {id}/{mp}/{ac}/{rs}");
            return Err(Error::NoSuchFile);
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> FileHeader<B> {
    #[inline]
    fn buf_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }

    /// 写入一个全新的文件头
    pub fn init(&mut self, fid: FileId, name: &str, filechar: BitFlags<FileChar>) {
        let buf = self.buf_mut();
        let seq = fid.seq;
        buf[..BLOCK_SIZE].fill(0);
        buf[IDOFFSET] = STD_IDOFFSET;
        buf[MPOFFSET] = STD_MPOFFSET;
        buf[ACOFFSET] = STD_ACOFFSET;
        buf[RSOFFSET] = STD_RSOFFSET;
        set_word(buf, STRUCLEV, super::home::STRUCLEV);
        FileId { seq, ..fid }.write(buf, FID);
        set_long(buf, FILECHAR, filechar.bits());
        set_word(buf, FILEPROT, 0xFA00);
        buf[RTYPE] = if filechar.contains(FileChar::Directory) {
            RTYPE_VARIABLE
        } else {
            RTYPE_FIXED
        };
        buf[RATTRIB] = if filechar.contains(FileChar::Directory) {
            RATTRIB_NOSPAN
        } else {
            0
        };
        set_word(buf, RSIZE, 512);
        set_swapped_long(buf, EFBLK, 1);
        set_long(buf, HIGHWATER, 1);

        let id = STD_IDOFFSET as usize * 2;
        let bytes = name.as_bytes();
        let (head, rest) = bytes.split_at(bytes.len().min(ID_FILENAME_LEN));
        buf[id + ID_FILENAME..id + ID_FILENAME + ID_FILENAME_LEN].fill(b' ');
        buf[id + ID_FILENAME..id + ID_FILENAME + head.len()].copy_from_slice(head);
        let rest = &rest[..rest.len().min(ID_FILENAMEXT_LEN)];
        buf[id + ID_FILENAMEXT..id + ID_FILENAMEXT + ID_FILENAMEXT_LEN].fill(b' ');
        buf[id + ID_FILENAMEXT..id + ID_FILENAMEXT + rest.len()].copy_from_slice(rest);
        set_word(buf, id + ID_REVISION, 1);

        self.update_checksum();
    }

    pub fn set_seg_num(&mut self, seg: u16) {
        set_word(self.buf_mut(), SEG_NUM, seg);
    }

    pub fn set_ext_fid(&mut self, fid: FileId) {
        fid.write(self.buf_mut(), EXT_FID);
    }

    pub fn set_backlink(&mut self, fid: FileId) {
        fid.write(self.buf_mut(), BACKLINK);
    }

    pub fn set_hiblk(&mut self, blocks: u32) {
        set_swapped_long(self.buf_mut(), HIBLK, blocks);
    }

    pub fn set_end_of_file(&mut self, efblk: u32, ffbyte: u16) {
        set_swapped_long(self.buf_mut(), EFBLK, efblk);
        set_word(self.buf_mut(), FFBYTE, ffbyte);
    }

    pub fn set_filechar(&mut self, filechar: BitFlags<FileChar>) {
        set_long(self.buf_mut(), FILECHAR, filechar.bits());
    }

    pub fn set_highwater(&mut self, highwater: u32) {
        if self.buf()[IDOFFSET] > 39 {
            set_long(self.buf_mut(), HIGHWATER, highwater);
        }
    }

    pub fn set_owner(&mut self, owner: u32) {
        set_long(self.buf_mut(), FILEOWNER, owner);
    }

    /// 替换映射区的内容，放不下时报错
    pub fn set_map_words(&mut self, words: &[u16]) -> Result<()> {
        if words.len() > self.map_capacity() || words.len() > u8::MAX as usize {
            return Err(Error::DeviceFull);
        }
        let start = self.map_offset();
        let capacity = self.map_capacity();
        let buf = self.buf_mut();
        buf[start..start + capacity * 2].fill(0);
        for (i, w) in words.iter().enumerate() {
            set_word(buf, start + i * 2, *w);
        }
        buf[MAP_INUSE] = words.len() as u8;
        Ok(())
    }

    /// 删除文件头：抹掉文件号与校验和，保留序号供下次复用
    pub fn clear(&mut self) {
        let buf = self.buf_mut();
        set_word(buf, FID, 0);
        buf[FID + 5] = 0;
        set_word(buf, 510, 0);
    }

    pub fn update_checksum(&mut self) -> u16 {
        write_block_checksum(self.buf_mut())
    }
}
