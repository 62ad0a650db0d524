//! # 用户态的 ODS-2 卷驱动
//!
//! 在任意 [`BlockDevice`](block_dev::BlockDevice) 上挂载 ODS-2 卷（或卷集），
//! 按 File-ID 打开文件、以块为单位读写，并在目录文件中查找、登记与删除名称。

/* 整体架构，自上而下 */

// 目录层：名称的检查、匹配与目录记录的增删查
pub mod direct;
pub use direct::{DirAction, Fib};

// 文件头修改层：新建、扩展、截短
mod update;

// 位图层：存储位图与文件号位图
mod bitmap;
pub use bitmap::BLOCK_BITS;

// 块组层：4 块对齐的读写缓冲
mod chunk;
pub use chunk::{Chunk, ChunkRef, CHUNK_BLOCKS};

// 窗口层：VBN 到 LBN 的映射
mod window;
pub use window::{Mapping, Window};

// 文件访问层：文件头与文件控制块
mod access;
pub use access::{FileControl, FileInfo};

// 卷层：挂载与卸载
mod volume;
pub use volume::{Member, MountFlag, MountFlags, Volume, HOME_LBN};

// 设备层：设备登记表
mod device;
pub use device::{Device, DeviceOpener, ImageOpener, MemOpener};

// 会话：以上各层的全部状态
mod session;
pub use session::{FileHandle, Session, VolumeHandle};

// 对象缓存
pub mod cache;
pub use cache::Handle;

// 磁盘数据结构层
pub mod layout;
pub use layout::fid::FileId;
pub use layout::header::FileChar;

mod format;
pub use format::{format, FormatOptions, RESERVED_FILES};

mod error;
pub use error::{Error, Result};
