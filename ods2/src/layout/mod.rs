//! 卷的布局
//!
//! 引导块 | 主页块 | 备份主页块 | 索引文件(位图 + 文件头) | 存储位图 | 数据
//!
//! 所有多字节字段都是小端序；记录属性中的长字按 PDP-11 习惯高字在前。

pub mod dir;
pub mod fid;
pub mod header;
pub mod home;
pub mod map;

use derive_more::{Add, Display, From, Into};

pub use block_dev::BLOCK_SIZE;

/// 卷内的逻辑块号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, From, Into, Display)]
#[repr(transparent)]
pub struct Lbn(u32);

impl core::ops::Add<u32> for Lbn {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        self + Self(rhs)
    }
}

impl Lbn {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

#[inline]
pub fn word(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub fn set_word(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn long(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
pub fn set_long(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// 高字在前的长字
#[inline]
pub fn swapped_long(buf: &[u8], offset: usize) -> u32 {
    (u32::from(word(buf, offset)) << 16) | u32::from(word(buf, offset + 2))
}

#[inline]
pub fn set_swapped_long(buf: &mut [u8], offset: usize, value: u32) {
    set_word(buf, offset, (value >> 16) as u16);
    set_word(buf, offset + 2, value as u16);
}

/// 前`words`个字的回绕累加和
pub fn checksum(buf: &[u8], words: usize) -> u16 {
    buf[..words * 2]
        .chunks_exact(2)
        .fold(0u16, |sum, w| sum.wrapping_add(u16::from_le_bytes([w[0], w[1]])))
}

/// 块的校验和：前255个字之和，存放在第256个字
pub fn block_checksum(block: &[u8]) -> u16 {
    checksum(block, 255)
}

pub fn verify_block_checksum(block: &[u8]) -> bool {
    block_checksum(block) == word(block, 510)
}

/// 重新计算并写入块的校验和，返回新值
pub fn write_block_checksum(block: &mut [u8]) -> u16 {
    let sum = block_checksum(block);
    set_word(block, 510, sum);
    sum
}
