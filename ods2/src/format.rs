//! 卷初始化：在块设备上写出一个全新的 ODS-2 卷
//!
//! 布局（LBN）：
//!
//! ```text
//! 0        引导块            ┐
//! 1        主页块            │
//! 2        备用主页块        │ INDEXF.SYS
//! 3        备用索引文件头    │
//! 4..      文件号位图        │
//! ..       预分配的文件头    ┘
//! ..       BITMAP.SYS：存储控制块 + 存储位图
//! ..       000000.DIR
//! ```
//!
//! 每个文件都从簇边界开始并占整数个簇。

use block_dev::{BlockDevice, BLOCK_SIZE};
use enumflags2::BitFlags;

use crate::bitmap::BLOCK_BITS;
use crate::layout::dir::{self, DirEntry, DirRecord};
use crate::layout::fid::FileId;
use crate::layout::header::{FileChar, FileHeader};
use crate::layout::home::{HomeBlock, STRUCLEV};
use crate::layout::map::{self, Extent};
use crate::layout::{set_long, set_word, write_block_checksum};
use crate::volume::HOME_LBN;
use crate::{Error, Result};

/// 保留文件的个数
pub const RESERVED_FILES: u16 = 5;
/// 卷的属主 [1,1]
pub const DEFAULT_OWNER: u32 = 0x0001_0001;

/// 初始化参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// 卷标，至多 12 个字符
    pub label: String,
    /// 属主名称
    pub owner_name: String,
    /// 属主 UIC
    pub owner: u32,
    /// 每簇块数
    pub cluster: u16,
    /// 预分配的文件头个数
    pub headers: u32,
    /// 最大文件数，`None` 时按容量估算
    pub maxfiles: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: "ODS2".to_owned(),
            owner_name: String::new(),
            owner: DEFAULT_OWNER,
            cluster: 1,
            headers: 64,
            maxfiles: None,
        }
    }
}

/// 一个保留文件的位置
#[derive(Debug, Clone, Copy)]
struct Placement {
    fid: FileId,
    name: &'static str,
    lbn: u32,
    blocks: u32,
    filechar: BitFlags<FileChar>,
    /// 有内容的块数
    used: u32,
}

fn round_up(blocks: u32, cluster: u32) -> u32 {
    blocks.div_ceil(cluster) * cluster
}

/// 初始化整个设备，返回写出的主页块
pub fn format(dev: &dyn BlockDevice, opts: &FormatOptions) -> Result<HomeBlock> {
    if !dev.is_writable() {
        return Err(Error::WriteLocked);
    }
    if opts.cluster == 0
        || opts.headers < u32::from(RESERVED_FILES)
        || opts.headers >= 1 << 24
        || opts.label.len() > 12
    {
        return Err(Error::BadParameter);
    }
    let cluster = u32::from(opts.cluster);
    let blocks = u32::try_from(dev.block_count()).map_err(|_| Error::BadParameter)?;
    let clusters = blocks / cluster;

    let maxfiles = opts
        .maxfiles
        .unwrap_or(blocks / 2)
        .clamp(opts.headers, (1 << 24) - 1);
    let ibmapsize = maxfiles.div_ceil(BLOCK_BITS);
    let ibmapsize = u16::try_from(ibmapsize).map_err(|_| Error::BadParameter)?;

    let ibmaplbn = 4;
    let header_lbn = ibmaplbn + u32::from(ibmapsize);
    let index_blocks = round_up(header_lbn + opts.headers, cluster);
    let bitmap_lbn = index_blocks;
    let bitmap_blocks = round_up(1 + clusters.div_ceil(BLOCK_BITS), cluster);
    let mfd_lbn = bitmap_lbn + bitmap_blocks;
    let mfd_blocks = round_up(1, cluster);
    let used = mfd_lbn + mfd_blocks;
    if used > blocks {
        log::debug!("{blocks} block(s) cannot hold the {used} block(s) of volume structure");
        return Err(Error::DeviceFull);
    }

    let mut home = HomeBlock::new();
    home.homelbn = HOME_LBN as u32;
    home.alhomelbn = 2;
    home.altidxlbn = 3;
    home.cluster = opts.cluster;
    home.homevbn = 2;
    home.alhomevbn = 3;
    home.altidxvbn = 4;
    home.ibmapvbn = 5;
    home.ibmaplbn = ibmaplbn;
    home.maxfiles = maxfiles;
    home.ibmapsize = ibmapsize;
    home.resfiles = RESERVED_FILES;
    home.volowner = opts.owner;
    home.protect = 0;
    home.fileprot = 0xFA00;
    home.serialnum = blocks;
    home.set_label(&opts.label);
    home.set_owner(&opts.owner_name);

    let contig = BitFlags::from(FileChar::Contig);
    let files = [
        Placement {
            fid: FileId::INDEXF,
            name: "INDEXF.SYS;1",
            lbn: 0,
            blocks: index_blocks,
            filechar: contig,
            used: index_blocks,
        },
        Placement {
            fid: FileId::BITMAP,
            name: "BITMAP.SYS;1",
            lbn: bitmap_lbn,
            blocks: bitmap_blocks,
            filechar: contig,
            used: bitmap_blocks,
        },
        Placement {
            fid: FileId::BADBLK,
            name: "BADBLK.SYS;1",
            lbn: 0,
            blocks: 0,
            filechar: BitFlags::empty(),
            used: 0,
        },
        Placement {
            fid: FileId::MFD,
            name: "000000.DIR;1",
            lbn: mfd_lbn,
            blocks: mfd_blocks,
            filechar: FileChar::Directory | FileChar::Contig,
            used: 1,
        },
        Placement {
            fid: FileId::CORIMG,
            name: "CORIMG.SYS;1",
            lbn: 0,
            blocks: 0,
            filechar: BitFlags::empty(),
            used: 0,
        },
    ];

    // 先清零卷结构占用的区域
    let zero = vec![0u8; used as usize * BLOCK_SIZE];
    dev.write_blocks(0, &zero)?;

    let home_block = home.encode()?;
    let home = HomeBlock::decode(&home_block)?;
    dev.write_blocks(HOME_LBN, &home_block)?;
    dev.write_blocks(u64::from(home.alhomelbn), &home_block)?;

    let mut ibmap = vec![0u8; usize::from(ibmapsize) * BLOCK_SIZE];
    for placement in &files {
        let n = placement.fid.number() - 1;
        ibmap[(n / 8) as usize] |= 1 << (n % 8);
    }
    dev.write_blocks(u64::from(ibmaplbn), &ibmap)?;

    for placement in &files {
        let header = file_header(placement, opts.owner)?;
        let lbn = header_lbn + placement.fid.number() - 1;
        dev.write_blocks(u64::from(lbn), &header)?;
        if placement.fid == FileId::INDEXF {
            dev.write_blocks(u64::from(home.altidxlbn), &header)?;
        }
    }

    dev.write_blocks(u64::from(bitmap_lbn), &control_block(cluster, blocks))?;
    let mut storage = vec![0u8; (bitmap_blocks - 1) as usize * BLOCK_SIZE];
    for c in used / cluster..clusters {
        storage[(c / 8) as usize] |= 1 << (c % 8);
    }
    dev.write_blocks(u64::from(bitmap_lbn + 1), &storage)?;

    let mut records: Vec<DirRecord> = files
        .iter()
        .map(|p| {
            let name = p.name.trim_end_matches(";1");
            DirRecord::new(
                name.as_bytes(),
                DirEntry {
                    version: 1,
                    fid: p.fid,
                },
            )
        })
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    let mfd = dir::encode_block(&records).ok_or(Error::DirectoryFull)?;
    dev.write_blocks(u64::from(mfd_lbn), &mfd)?;

    log::info!(
        "formatted {} : {blocks} blocks, cluster {cluster}, {maxfiles} files max, {} free",
        home.label(),
        (clusters - used.div_ceil(cluster)) * cluster
    );
    Ok(home)
}

fn file_header(p: &Placement, owner: u32) -> Result<[u8; BLOCK_SIZE]> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut header = FileHeader(&mut block[..]);
    header.init(p.fid, p.name, p.filechar);
    header.set_backlink(FileId::MFD);
    header.set_owner(owner);
    if p.blocks > 0 {
        let words = map::encode_all(&[Extent::new(p.blocks, p.lbn)])?;
        header.set_map_words(&words)?;
    }
    header.set_hiblk(p.blocks);
    header.set_end_of_file(p.used + 1, 0);
    header.set_highwater(p.blocks + 1);
    header.update_checksum();
    Ok(block)
}

/// 存储控制块：结构级别、簇大小、卷的块数
fn control_block(cluster: u32, blocks: u32) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    set_word(&mut block, 0, STRUCLEV);
    set_word(&mut block, 2, cluster as u16);
    set_long(&mut block, 4, blocks);
    set_long(&mut block, 8, BLOCK_SIZE as u32);
    write_block_checksum(&mut block);
    block
}
