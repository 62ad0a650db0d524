use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use crate::{check_range, BlockDevice, BLOCK_SIZE};

/// 内存中的磁盘
///
/// 克隆得到的句柄共享同一份数据，卸载后重新挂载能看到之前写入的内容。
#[derive(Debug, Clone)]
pub struct MemDisk {
    data: Rc<RefCell<Vec<u8>>>,
    /// 剩余多少次写入后开始报错，用于模拟故障
    fail_after: Rc<Cell<Option<usize>>>,
}

impl MemDisk {
    pub fn new(blocks: u64) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0; blocks as usize * BLOCK_SIZE])),
            fail_after: Rc::default(),
        }
    }

    /// 之后第`writes`次以后的写入全部失败，`None`恢复正常
    pub fn fail_writes_after(&self, writes: Option<usize>) {
        self.fail_after.set(writes);
    }

    /// 直接查看某个块的内容
    pub fn block(&self, block_id: u64) -> Vec<u8> {
        let start = block_id as usize * BLOCK_SIZE;
        self.data.borrow()[start..start + BLOCK_SIZE].to_vec()
    }
}

impl BlockDevice for MemDisk {
    fn read_blocks(&self, block_id: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self, block_id, buf.len())?;
        let start = block_id as usize * BLOCK_SIZE;
        buf.copy_from_slice(&self.data.borrow()[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&self, block_id: u64, buf: &[u8]) -> io::Result<()> {
        check_range(self, block_id, buf.len())?;
        if let Some(left) = self.fail_after.get() {
            if left == 0 {
                return Err(io::Error::other("injected write failure"));
            }
            self.fail_after.set(Some(left - 1));
        }
        let start = block_id as usize * BLOCK_SIZE;
        self.data.borrow_mut()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        (self.data.borrow().len() / BLOCK_SIZE) as u64
    }
}
