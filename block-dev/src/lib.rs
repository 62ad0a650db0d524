//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，
//! [`BlockDevice`] 就是对读写块设备的抽象。
//! ODS-2 的块恒为 512 字节，块号从设备起始处计算。

mod block_file;
mod mem_disk;

use std::fmt::Debug;
use std::io;

pub use self::{block_file::BlockFile, mem_disk::MemDisk};

/// 块的字节数
pub const BLOCK_SIZE: usize = 512;

/// 块设备驱动特质
///
/// `buf` 的长度必须是 [`BLOCK_SIZE`] 的整数倍，一次调用可读写多个连续块。
pub trait BlockDevice: Debug {
    fn read_blocks(&self, block_id: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_blocks(&self, block_id: u64, buf: &[u8]) -> io::Result<()>;

    /// 设备的总块数
    fn block_count(&self) -> u64;

    fn is_writable(&self) -> bool {
        true
    }
}

/// 检查一次传输是否落在设备之内
pub(crate) fn check_range(dev: &dyn BlockDevice, block_id: u64, len: usize) -> io::Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a multiple of the block size",
        ));
    }
    let blocks = (len / BLOCK_SIZE) as u64;
    if block_id + blocks > dev.block_count() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("block {block_id}+{blocks} beyond end of device"),
        ));
    }
    Ok(())
}
