use core::fmt;

use super::{set_word, word};

/// File-ID：(文件号, 序号, 相对卷号, 文件号扩展)
///
/// 磁盘上占6字节：`num:u16 seq:u16 rvn:u8 nmx:u8`。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub num: u16,
    pub seq: u16,
    /// 0 表示“当前卷”
    pub rvn: u8,
    /// 文件号的高8位
    pub nmx: u8,
}

impl FileId {
    pub const SIZE: usize = 6;

    pub const INDEXF: Self = Self::new(1, 1);
    pub const BITMAP: Self = Self::new(2, 2);
    pub const BADBLK: Self = Self::new(3, 3);
    pub const MFD: Self = Self::new(4, 4);
    pub const CORIMG: Self = Self::new(5, 5);

    pub const fn new(num: u16, seq: u16) -> Self {
        Self {
            num,
            seq,
            rvn: 0,
            nmx: 0,
        }
    }

    /// 由完整的文件号构造
    pub const fn from_number(number: u32, seq: u16, rvn: u8) -> Self {
        Self {
            num: number as u16,
            seq,
            rvn,
            nmx: (number >> 16) as u8,
        }
    }

    /// 24位的完整文件号
    pub const fn number(&self) -> u32 {
        self.num as u32 | ((self.nmx as u32) << 16)
    }

    pub fn is_null(&self) -> bool {
        self.number() == 0
    }

    /// 把 0 号相对卷解释为 1
    pub fn volume(&self) -> u8 {
        self.rvn.max(1)
    }

    pub fn read(buf: &[u8], offset: usize) -> Self {
        Self {
            num: word(buf, offset),
            seq: word(buf, offset + 2),
            rvn: buf[offset + 4],
            nmx: buf[offset + 5],
        }
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        set_word(buf, offset, self.num);
        set_word(buf, offset + 2, self.seq);
        buf[offset + 4] = self.rvn;
        buf[offset + 5] = self.nmx;
    }

    /// 文件头里的FID与请求的FID是否一致，文件头中的 rvn 0 匹配任意卷
    pub fn matches_header(&self, on_disk: &FileId, member_rvn: u8) -> bool {
        on_disk.num == self.num
            && on_disk.nmx == self.nmx
            && (self.seq == 0 || on_disk.seq == self.seq)
            && (on_disk.rvn == 0 || on_disk.rvn == self.rvn.max(member_rvn))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.number(), self.seq, self.rvn)
    }
}
