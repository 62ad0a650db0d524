use crate::access::FileControl;
use crate::cache::{Cache, Handle};
use crate::chunk::Chunk;
use crate::device::{Device, DeviceOpener};
use crate::volume::Volume;
use crate::window::Window;
use crate::Result;

pub type FileHandle = Handle<FileControl>;
pub type VolumeHandle = Handle<Volume>;

/// 驱动的全部状态
///
/// 设备表、已挂载的卷以及它们的缓存都归会话所有，随会话一起释放。
pub struct Session {
    pub(crate) opener: Box<dyn DeviceOpener>,
    pub(crate) devices: Cache<String, Device>,
    /// 以挂载序号为键
    pub(crate) volumes: Cache<u32, Volume>,
    /// 父对象为卷，以 `文件号 | (rvn-1) << 24` 为键
    pub(crate) files: Cache<u32, FileControl>,
    /// 父对象为文件，以起始VBN为键
    pub(crate) windows: Cache<u32, Window>,
    /// 父对象为文件，以块组的首个VBN为键
    pub(crate) chunks: Cache<u32, Chunk>,
    pub(crate) chunk_limit: usize,
    /// 正在淘汰块组
    pub(crate) evicting: bool,
    pub(crate) next_volume: u32,
}

impl Session {
    /// 空闲块组数量的默认上限
    pub const CHUNK_LIMIT: usize = 64;

    pub fn new(opener: impl DeviceOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            devices: Cache::new(),
            volumes: Cache::new(),
            files: Cache::new(),
            windows: Cache::new(),
            chunks: Cache::new(),
            chunk_limit: Self::CHUNK_LIMIT,
            evicting: false,
            next_volume: 1,
        }
    }

    pub fn with_chunk_limit(mut self, limit: usize) -> Self {
        self.chunk_limit = limit.max(1);
        self
    }

    /// 写回所有已修改的块组
    pub fn flush(&mut self) -> Result<()> {
        for chunk in self.chunks.handles() {
            // 前面的写回可能已经淘汰了它
            if self.chunks.contains(chunk) {
                self.flush_chunk(chunk)?;
            }
        }
        Ok(())
    }

    pub fn volumes(&self) -> Vec<VolumeHandle> {
        self.volumes.handles()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("write-back at session end failed: {e}");
        }
    }
}
