use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{check_range, BlockDevice, BLOCK_SIZE};

/// 宿主机上的磁盘镜像文件
#[derive(Debug)]
pub struct BlockFile {
    inner: RefCell<File>,
    blocks: u64,
    writable: bool,
}

impl BlockFile {
    pub fn new(fd: File, writable: bool) -> io::Result<Self> {
        let blocks = fd.metadata()?.len() / BLOCK_SIZE as u64;
        Ok(Self {
            inner: RefCell::new(fd),
            blocks,
            writable,
        })
    }

    /// 优先以读写方式打开，失败则退回只读
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(fd) => Self::new(fd, true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Self::new(File::open(path)?, false)
            }
            Err(e) => Err(e),
        }
    }

    /// 创建（或截断）一个`blocks`块大小的镜像
    pub fn create(path: impl AsRef<Path>, blocks: u64) -> io::Result<Self> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        fd.set_len(blocks * BLOCK_SIZE as u64)?;
        Self::new(fd, true)
    }
}

impl BlockDevice for BlockFile {
    fn read_blocks(&self, block_id: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self, block_id, buf.len())?;
        let mut file = self.inner.borrow_mut();
        file.seek(SeekFrom::Start(block_id * BLOCK_SIZE as u64))?;
        file.read_exact(buf)
    }

    fn write_blocks(&self, block_id: u64, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "image opened read-only",
            ));
        }
        check_range(self, block_id, buf.len())?;
        let mut file = self.inner.borrow_mut();
        file.seek(SeekFrom::Start(block_id * BLOCK_SIZE as u64))?;
        file.write_all(buf)
    }

    fn block_count(&self) -> u64 {
        self.blocks
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}
