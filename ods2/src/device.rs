//! 设备登记表：按名称（不区分大小写）记录打开的物理设备

use std::collections::BTreeMap;

use block_dev::{BlockDevice, BlockFile, MemDisk};

use crate::cache::Handle;
use crate::volume::Volume;
use crate::{Error, Result, Session};

/// 物理 I/O 的边界：按名称打开一个块设备
pub trait DeviceOpener {
    fn open(&mut self, name: &str) -> Result<Box<dyn BlockDevice>>;
}

/// 把设备名当作宿主机上的镜像路径
#[derive(Debug, Default)]
pub struct ImageOpener;

impl DeviceOpener for ImageOpener {
    fn open(&mut self, name: &str) -> Result<Box<dyn BlockDevice>> {
        match BlockFile::open(name) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NoSuchDevice),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存盘的集合，名称到 [`MemDisk`] 的映射
#[derive(Debug, Default)]
pub struct MemOpener {
    disks: BTreeMap<String, MemDisk>,
}

impl MemOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, name: &str, disk: MemDisk) -> Self {
        self.disks.insert(normalize(name), disk);
        self
    }
}

impl DeviceOpener for MemOpener {
    fn open(&mut self, name: &str) -> Result<Box<dyn BlockDevice>> {
        self.disks
            .get(&normalize(name))
            .map(|disk| Box::new(disk.clone()) as Box<dyn BlockDevice>)
            .ok_or(Error::NoSuchDevice)
    }
}

/// 一个已打开的物理设备
#[derive(Debug)]
pub struct Device {
    pub name: String,
    pub(crate) dev: Box<dyn BlockDevice>,
    /// 挂载在此设备上的卷
    pub(crate) volume: Option<Handle<Volume>>,
}

impl Device {
    pub fn blocks(&self) -> u64 {
        self.dev.block_count()
    }

    pub fn volume(&self) -> Option<Handle<Volume>> {
        self.volume
    }
}

/// 设备名的规范形式：大写，去掉结尾的冒号
pub(crate) fn normalize(name: &str) -> String {
    name.trim_end_matches(':').to_ascii_uppercase()
}

impl Session {
    /// 查找设备，`create`时按需打开并登记
    ///
    /// 返回的句柄持有一次引用，由 [`Session::release_device`] 释放。
    pub fn device_lookup(&mut self, name: &str, create: bool) -> Result<Handle<Device>> {
        let key = normalize(name);
        if let Some(handle) = self.devices.search(None, &key) {
            return Ok(handle);
        }
        if !create {
            return Err(Error::NoSuchDevice);
        }

        let dev = self.opener.open(name)?;
        log::debug!("device {key}: {} blocks", dev.block_count());
        self.devices.insert(
            None,
            key,
            Device {
                name: name.to_owned(),
                dev,
                volume: None,
            },
        )
    }

    /// 设备在会话结束前一直保留
    pub fn release_device(&mut self, device: Handle<Device>) -> Result<()> {
        self.devices.untouch(device, false).map(|_| ())
    }

    pub fn device(&self, device: Handle<Device>) -> Result<&Device> {
        self.devices.get(device)
    }

    /// 由设备名找到挂载在其上的卷
    pub fn volume_for_device(&mut self, name: &str) -> Result<Handle<Volume>> {
        let device = self.device_lookup(name, false)?;
        let volume = self.devices.get(device)?.volume;
        self.release_device(device)?;
        volume.ok_or(Error::NoSuchVolume)
    }
}
