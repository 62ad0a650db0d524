//! 检索指针(Retrieval Pointer)
//!
//! 每个指针的首字高两位选择格式：
//!
//! | 格式 | 字数 | 块数 | LBN |
//! |------|------|------|-----|
//! | 0    | 1    | 0（放置控制字） | - |
//! | 1    | 2    | 低8位 + 1 | 22位，高6位在首字的 8..14 位 |
//! | 2    | 3    | 14位 + 1 | 32位，低字在前 |
//! | 3    | 4    | 30位 + 1 | 32位，低字在前 |

use super::Lbn;
use crate::{Error, Result};

/// 一段连续的物理块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub count: u32,
    pub lbn: Lbn,
}

impl Extent {
    pub fn new(count: u32, lbn: u32) -> Self {
        Self {
            count,
            lbn: Lbn::new(lbn),
        }
    }

    pub fn end(&self) -> u32 {
        self.lbn.get() + self.count
    }
}

/// 依次解出映射区中的指针，放置控制字不产生区段
pub fn decode(words: &[u16]) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let w0 = words[i];
        let need = match w0 >> 14 {
            0 => 1,
            1 => 2,
            2 => 3,
            _ => 4,
        };
        if i + need > words.len() {
            log::debug!("retrieval pointer truncated at word {i}");
            return Err(Error::DataCheck);
        }
        let w = &words[i..i + need];
        match w0 >> 14 {
            0 => {}
            1 => extents.push(Extent::new(
                u32::from(w0 & 0x00FF) + 1,
                (u32::from(w0 & 0x3F00) << 8) | u32::from(w[1]),
            )),
            2 => extents.push(Extent::new(
                u32::from(w0 & 0x3FFF) + 1,
                (u32::from(w[2]) << 16) | u32::from(w[1]),
            )),
            _ => extents.push(Extent::new(
                ((u32::from(w0 & 0x3FFF) << 16) | u32::from(w[1])) + 1,
                (u32::from(w[3]) << 16) | u32::from(w[2]),
            )),
        }
        i += need;
    }
    Ok(extents)
}

/// 以能容纳的最窄格式编码一个区段
pub fn encode(extent: &Extent) -> Result<Vec<u16>> {
    if extent.count == 0 || extent.count > 0x4000_0000 {
        return Err(Error::BadParameter);
    }
    let len = extent.count - 1;
    let lbn = extent.lbn.get();
    let words = if len <= 0xFF && lbn < 1 << 22 {
        vec![
            0x4000 | (((lbn >> 16) as u16 & 0x3F) << 8) | len as u16,
            lbn as u16,
        ]
    } else if len <= 0x3FFF {
        vec![0x8000 | len as u16, lbn as u16, (lbn >> 16) as u16]
    } else {
        vec![
            0xC000 | ((len >> 16) as u16 & 0x3FFF),
            len as u16,
            lbn as u16,
            (lbn >> 16) as u16,
        ]
    };
    Ok(words)
}

/// 编码一组区段，相邻且连续的区段先合并
pub fn encode_all(extents: &[Extent]) -> Result<Vec<u16>> {
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for ext in extents.iter().filter(|ext| ext.count > 0) {
        match merged.last_mut() {
            Some(last) if last.end() == ext.lbn.get() && last.count + ext.count <= 0x4000_0000 => {
                last.count += ext.count;
            }
            _ => merged.push(*ext),
        }
    }
    let mut words = Vec::new();
    for ext in &merged {
        words.extend(encode(ext)?);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format1() {
        // 3 块，LBN 0x12_3456
        let words = [0x4000 | (0x12 << 8) | 2, 0x3456];
        assert_eq!(decode(&words).unwrap(), vec![Extent::new(3, 0x12_3456)]);
        assert_eq!(encode(&Extent::new(3, 0x12_3456)).unwrap(), words);
    }

    #[test]
    fn format2_and_3() {
        let ext = Extent::new(1000, 0x0100_0002);
        let words = encode(&ext).unwrap();
        assert_eq!(words, vec![0x8000 | 999, 0x0002, 0x0100]);
        assert_eq!(decode(&words).unwrap(), vec![ext]);

        let big = Extent::new(0x0002_0001, 77);
        let words = encode(&big).unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0] >> 14, 3);
        assert_eq!(decode(&words).unwrap(), vec![big]);
    }

    #[test]
    fn placement_words_are_skipped() {
        let words = [0x0000, 0x4000, 100, 0x0123];
        assert_eq!(decode(&words).unwrap(), vec![Extent::new(1, 100)]);
    }

    #[test]
    fn truncated_pointer() {
        assert!(matches!(decode(&[0x8000, 1]), Err(Error::DataCheck)));
    }

    #[test]
    fn contiguous_extents_merge() {
        let words = encode_all(&[Extent::new(2, 10), Extent::new(3, 12), Extent::new(1, 40)]).unwrap();
        assert_eq!(
            decode(&words).unwrap(),
            vec![Extent::new(5, 10), Extent::new(1, 40)]
        );
    }
}
