#![allow(dead_code)]

use block_dev::{BlockDevice, MemDisk, BLOCK_SIZE};
use ods2::layout::header::FileHeader;
use ods2::layout::home::HomeBlock;
use ods2::{
    format, DirAction, Fib, FileChar, FileHandle, FileId, FormatOptions, MemOpener, MountFlag,
    Session, VolumeHandle,
};

pub const DISK: &str = "DUA0:";

/// 初始化好的内存盘
pub fn fresh_disk(blocks: u64) -> MemDisk {
    let disk = MemDisk::new(blocks);
    format(
        &disk,
        &FormatOptions {
            label: "SCRATCH".to_owned(),
            ..FormatOptions::default()
        },
    )
    .unwrap();
    disk
}

pub fn session(disk: &MemDisk) -> Session {
    Session::new(MemOpener::new().with_disk(DISK, disk.clone()))
}

pub fn mount_rw(session: &mut Session) -> VolumeHandle {
    session.mount(MountFlag::Write.into(), &[DISK], &[]).unwrap()
}

/// 新建文件并分配`blocks`块，文件保持写打开
pub fn new_file(
    session: &mut Session,
    volume: VolumeHandle,
    name: &str,
    blocks: u32,
) -> (FileId, FileHandle) {
    let fid = session
        .create_file(volume, name, Default::default(), FileId::MFD)
        .unwrap();
    let fcb = session.access_file(volume, fid, true).unwrap();
    if blocks > 0 {
        session.extend_file(fcb, blocks).unwrap();
    }
    (fid, fcb)
}

/// 新建一个子目录文件
pub fn new_directory(session: &mut Session, volume: VolumeHandle, name: &str) -> FileHandle {
    let fid = session
        .create_file(volume, name, FileChar::Directory.into(), FileId::MFD)
        .unwrap();
    session.access_file(volume, fid, true).unwrap()
}

pub fn open_mfd(session: &mut Session, volume: VolumeHandle, write: bool) -> FileHandle {
    session.access_file(volume, FileId::MFD, write).unwrap()
}

pub fn enter(session: &mut Session, dir: FileHandle, name: &str, fid: FileId) -> String {
    let mut fib = Fib::with_fid(FileId::MFD, fid);
    session
        .search_directory(dir, &mut fib, name, DirAction::Insert)
        .unwrap()
}

pub fn lookup(session: &mut Session, dir: FileHandle, name: &str) -> ods2::Result<(String, FileId)> {
    let mut fib = Fib::new(FileId::MFD);
    let found = session.search_directory(dir, &mut fib, name, DirAction::Lookup)?;
    Ok((found, fib.fid))
}

/// 通配检索的全部结果
pub fn list(session: &mut Session, dir: FileHandle, pattern: &str) -> Vec<(String, FileId)> {
    let mut fib = Fib::new(FileId::MFD);
    let mut out = Vec::new();
    loop {
        match session.search_directory(dir, &mut fib, pattern, DirAction::Lookup) {
            Ok(name) => out.push((name, fib.fid)),
            Err(ods2::Error::NoMoreFiles | ods2::Error::NoSuchFile) => break,
            Err(e) => panic!("listing {pattern}: {e}"),
        }
        if fib.wcc.is_none() {
            break;
        }
    }
    out
}

pub fn pattern_block(seed: u8) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
}

/// 绕过会话直接改写磁盘上的文件头，改完重算校验和
///
/// 卷须已卸载，否则缓存中的旧内容会覆盖这次修改。
pub fn patch_header(disk: &MemDisk, number: u32, edit: impl FnOnce(&mut FileHeader<&mut [u8]>)) {
    let home = HomeBlock::decode(&disk.block(1)).unwrap();
    // 索引文件从 LBN 0 起连续存放，LBN = VBN - 1
    let lbn = u64::from(home.header_vbn_base() + number - 2);
    let mut block = disk.block(lbn);
    let mut header = FileHeader(&mut block[..]);
    edit(&mut header);
    header.update_checksum();
    disk.write_blocks(lbn, &block).unwrap();
}
