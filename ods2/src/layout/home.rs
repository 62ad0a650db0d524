//! 主页块(Home Block)，卷的第一个有效元数据块

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use super::{checksum, set_word, word, BLOCK_SIZE};
use crate::{Error, Result};

/// 格式标识
pub const FORMAT_ID: &[u8; 12] = b"DECFILE11B  ";

/// 结构级别 2，版本 1
pub const STRUCLEV: u16 = 0x0201;

/// checksum1 覆盖的字数
const CHECKSUM1_WORDS: usize = 29;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeBlock {
    /// 主页块自身的LBN
    pub homelbn: u32,
    /// 备份主页块的LBN
    pub alhomelbn: u32,
    /// 备份索引文件头的LBN
    pub altidxlbn: u32,
    pub struclev: u16,
    /// 簇大小（块）
    pub cluster: u16,
    pub homevbn: u16,
    pub alhomevbn: u16,
    pub altidxvbn: u16,
    /// 索引文件位图的起始VBN
    pub ibmapvbn: u16,
    /// 索引文件位图的起始LBN
    pub ibmaplbn: u32,
    /// 卷上允许的最多文件数
    pub maxfiles: u32,
    /// 索引文件位图占用的块数
    pub ibmapsize: u16,
    /// 保留文件的数量
    pub resfiles: u16,
    pub devtype: u16,
    /// 卷集中的相对卷号，单卷为 0
    pub rvn: u16,
    pub setcount: u16,
    pub volchar: u16,
    pub volowner: u32,
    pub sec_mask: u32,
    pub protect: u16,
    pub fileprot: u16,
    pub recprot: u16,
    pub checksum1: u16,
    pub credate: [u8; 8],
    pub window: u8,
    pub lru_lim: u8,
    pub extend: u16,
    pub retainmin: [u8; 8],
    pub retainmax: [u8; 8],
    pub revdate: [u8; 8],
    pub min_class: [u8; 20],
    pub max_class: [u8; 20],
    reserved: [u8; 320],
    pub serialnum: u32,
    pub strucname: [u8; 12],
    pub volname: [u8; 12],
    pub ownername: [u8; 12],
    pub format: [u8; 12],
    reserved2: u16,
    pub checksum2: u16,
}

impl HomeBlock {
    /// 以全零为底的主页块
    pub fn new() -> Self {
        Self {
            homelbn: 0,
            alhomelbn: 0,
            altidxlbn: 0,
            struclev: STRUCLEV,
            cluster: 1,
            homevbn: 0,
            alhomevbn: 0,
            altidxvbn: 0,
            ibmapvbn: 0,
            ibmaplbn: 0,
            maxfiles: 0,
            ibmapsize: 0,
            resfiles: 0,
            devtype: 0,
            rvn: 0,
            setcount: 0,
            volchar: 0,
            volowner: 0,
            sec_mask: 0,
            protect: 0,
            fileprot: 0,
            recprot: 0,
            checksum1: 0,
            credate: [0; 8],
            window: 7,
            lru_lim: 16,
            extend: 5,
            retainmin: [0; 8],
            retainmax: [0; 8],
            revdate: [0; 8],
            min_class: [0; 20],
            max_class: [0; 20],
            reserved: [0; 320],
            serialnum: 0,
            strucname: [b' '; 12],
            volname: [b' '; 12],
            ownername: [b' '; 12],
            format: *FORMAT_ID,
            reserved2: 0,
            checksum2: 0,
        }
    }

    /// 解析并校验主页块
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < BLOCK_SIZE {
            return Err(Error::BadParameter);
        }
        let home = Self::read(&mut Cursor::new(&block[..BLOCK_SIZE]))?;

        if home.format != *FORMAT_ID || home.struclev >> 8 != STRUCLEV >> 8 {
            log::debug!("home block format {:?} struclev {:#x}", home.format, home.struclev);
            return Err(Error::DataCheck);
        }
        if checksum(block, CHECKSUM1_WORDS) != word(block, 58)
            || checksum(block, 255) != word(block, 510)
        {
            log::debug!("home block checksum mismatch");
            return Err(Error::DataCheck);
        }
        if home.cluster == 0 || home.ibmapsize == 0 {
            return Err(Error::DataCheck);
        }
        Ok(home)
    }

    /// 编码为磁盘块，同时填好两个校验和
    pub fn encode(&self) -> Result<[u8; BLOCK_SIZE]> {
        let mut block = [0u8; BLOCK_SIZE];
        self.write(&mut Cursor::new(&mut block[..]))?;
        let sum1 = checksum(&block, CHECKSUM1_WORDS);
        set_word(&mut block, 58, sum1);
        let sum2 = checksum(&block, 255);
        set_word(&mut block, 510, sum2);
        Ok(block)
    }

    /// 去掉尾部空格的卷标
    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.volname).trim_end().to_owned()
    }

    pub fn set_label(&mut self, label: &str) {
        pad_field(&mut self.volname, label);
    }

    pub fn set_owner(&mut self, owner: &str) {
        pad_field(&mut self.ownername, owner);
    }

    /// 索引文件中第一个文件头所在的VBN
    pub fn header_vbn_base(&self) -> u32 {
        u32::from(self.ibmapvbn) + u32::from(self.ibmapsize)
    }
}

impl Default for HomeBlock {
    fn default() -> Self {
        Self::new()
    }
}

fn pad_field(field: &mut [u8; 12], value: &str) {
    field.fill(b' ');
    for (b, v) in field.iter_mut().zip(value.bytes()) {
        *b = v.to_ascii_uppercase();
    }
}
