//! 卷（可能由多个成员组成的卷集）的挂载与卸载

use block_dev::{BlockDevice, BLOCK_SIZE};
use enumflags2::{bitflags, BitFlags};

use crate::access::HeadRef;
use crate::cache::Handle;
use crate::device::Device;
use crate::layout::fid::FileId;
use crate::layout::header::FileHeader;
use crate::layout::home::HomeBlock;
use crate::session::{FileHandle, VolumeHandle};
use crate::{Error, Result, Session};

/// 主页块所在的LBN
pub const HOME_LBN: u64 = 1;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFlag {
    /// 以读写方式挂载
    Write = 0b1,
}

pub type MountFlags = BitFlags<MountFlag>;

/// 卷集中的一个成员
#[derive(Debug)]
pub struct Member {
    pub(crate) device: Handle<Device>,
    pub(crate) home: HomeBlock,
    /// 索引文件的控制块建好之前，直接从磁盘读来的索引文件头
    pub(crate) boot_header: Option<Box<[u8; BLOCK_SIZE]>>,
    pub(crate) index: Option<FileHandle>,
    pub(crate) bitmap: Option<FileHandle>,
}

impl Member {
    pub fn home(&self) -> &HomeBlock {
        &self.home
    }
}

#[derive(Debug)]
pub struct Volume {
    pub(crate) writable: bool,
    /// 下标为 rvn-1，挂载失败的成员为空
    pub(crate) members: Vec<Option<Member>>,
}

impl Volume {
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// 成功挂载的成员数
    pub fn member_count(&self) -> usize {
        self.members.iter().flatten().count()
    }

    pub fn member(&self, rvn: u8) -> Result<&Member> {
        self.members
            .get(usize::from(rvn.max(1)) - 1)
            .and_then(Option::as_ref)
            .ok_or(Error::NoSuchVolume)
    }

    pub(crate) fn member_mut(&mut self, rvn: u8) -> Result<&mut Member> {
        self.members
            .get_mut(usize::from(rvn.max(1)) - 1)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSuchVolume)
    }

    /// 第一个成员的卷标
    pub fn label(&self) -> String {
        self.member(1).map(|m| m.home.label()).unwrap_or_default()
    }

    /// 卸载前应当剩下的引用：每个成员的索引文件，可写时再加位图文件
    fn baseline_refs(&self) -> u32 {
        let per_member = if self.writable { 2 } else { 1 };
        self.member_count() as u32 * per_member
    }
}

impl Session {
    pub fn volume(&self, volume: VolumeHandle) -> Result<&Volume> {
        self.volumes.get(volume)
    }

    /// 挂载卷集，`devices`的顺序即相对卷号
    ///
    /// 第一个成员必须成功；之后的成员失败时只记录下来，卷集降级为可用的成员。
    pub fn mount(
        &mut self,
        flags: MountFlags,
        devices: &[&str],
        labels: &[&str],
    ) -> Result<VolumeHandle> {
        if devices.is_empty() || devices.len() > u8::MAX as usize {
            return Err(Error::BadParameter);
        }
        let writable = flags.contains(MountFlag::Write);
        let key = self.next_volume;
        self.next_volume += 1;
        let volume = self.volumes.insert(
            None,
            key,
            Volume {
                writable,
                members: Vec::with_capacity(devices.len()),
            },
        )?;

        for (i, name) in devices.iter().enumerate() {
            let rvn = (i + 1) as u8;
            let label = labels.get(i).copied().filter(|l| !l.is_empty());
            if let Err(e) = self.mount_member(volume, rvn, name, label) {
                if rvn == 1 {
                    log::debug!("mount of {name} failed: {e}");
                    self.volumes.remove(volume)?;
                    return Err(e);
                }
                log::warn!("volume set member {rvn} ({name}) not mounted: {e}");
            }
        }

        log::info!(
            "mounted {} ({} member(s), {})",
            self.volumes.get(volume)?.label(),
            self.volumes.get(volume)?.member_count(),
            if writable { "read/write" } else { "read-only" }
        );
        Ok(volume)
    }

    /// 卸载卷集，除索引/位图文件的自引用外还有文件打开时失败
    pub fn dismount(&mut self, volume: VolumeHandle) -> Result<()> {
        let vol = self.volumes.get(volume)?;
        let expected = vol.baseline_refs();
        let actual = self.files.refcount_under(Some(volume.raw()));
        if actual != expected {
            log::debug!("dismount refused: {actual} references, expected {expected}");
            return Err(Error::DeviceNotDismounted);
        }

        let count = vol.members.len();
        for i in 0..count {
            let rvn = (i + 1) as u8;
            let Ok(member) = self.volumes.get_mut(volume)?.member_mut(rvn) else {
                continue;
            };
            if let Some(bitmap) = member.bitmap.take() {
                self.deaccess_file(bitmap)?;
            }
        }
        for i in 0..count {
            let rvn = (i + 1) as u8;
            let Ok(member) = self.volumes.get_mut(volume)?.member_mut(rvn) else {
                continue;
            };
            if let Some(index) = member.index.take() {
                self.deaccess_file(index)?;
            }
        }

        let leftover = self.files.children(Some(volume.raw()));
        if !leftover.is_empty() {
            log::error!("{} file control block(s) survived dismount", leftover.len());
            return Err(Error::BugCheck("file control blocks left at dismount"));
        }

        let vol = self.volumes.remove(volume)?;
        for member in vol.members.into_iter().flatten() {
            self.devices.get_mut(member.device)?.volume = None;
            self.release_device(member.device)?;
        }
        log::info!("dismounted volume {volume:?}");
        Ok(())
    }

    /// 成员所在的块设备
    pub(crate) fn member_device(&self, volume: VolumeHandle, rvn: u8) -> Result<&dyn BlockDevice> {
        let device = self.volumes.get(volume)?.member(rvn)?.device;
        Ok(self.devices.get(device)?.dev.as_ref())
    }

    pub(crate) fn member_home(&self, volume: VolumeHandle, rvn: u8) -> Result<&HomeBlock> {
        Ok(&self.volumes.get(volume)?.member(rvn)?.home)
    }
}

impl Session {
    fn mount_member(
        &mut self,
        volume: VolumeHandle,
        rvn: u8,
        name: &str,
        label: Option<&str>,
    ) -> Result<()> {
        let writable = self.volumes.get(volume)?.writable;
        let device = self.device_lookup(name, true)?;

        let member = match self.load_member(device, rvn, label, writable) {
            Ok(member) => member,
            Err(e) => {
                self.release_device(device)?;
                return Err(e);
            }
        };
        let vol = self.volumes.get_mut(volume)?;
        vol.members.resize_with(usize::from(rvn) - 1, || None);
        vol.members.push(Some(member));

        if let Err(e) = self.open_reserved(volume, rvn, writable) {
            self.drop_member(volume, rvn)?;
            return Err(e);
        }
        self.devices.get_mut(device)?.volume = Some(volume);
        Ok(())
    }

    /// 读取并校验主页块与引导用的索引文件头
    fn load_member(
        &mut self,
        device: Handle<Device>,
        rvn: u8,
        label: Option<&str>,
        writable: bool,
    ) -> Result<Member> {
        let dev = self.devices.get(device)?;
        if dev.volume.is_some() {
            return Err(Error::DeviceMounted);
        }
        if writable && !dev.dev.is_writable() {
            return Err(Error::WriteLocked);
        }

        let mut block = [0u8; BLOCK_SIZE];
        dev.dev.read_blocks(HOME_LBN, &mut block)?;
        let home = HomeBlock::decode(&block)?;
        if let Some(label) = label {
            if !home.label().eq_ignore_ascii_case(label.trim()) {
                log::debug!("label {} does not match {label}", home.label());
                return Err(Error::NoSuchVolume);
            }
        }

        // 索引文件头紧跟在索引文件位图之后，此时还没有控制块，直接按LBN读
        let head_lbn = u64::from(home.ibmaplbn) + u64::from(home.ibmapsize);
        let mut boot = Box::new([0u8; BLOCK_SIZE]);
        dev.dev.read_blocks(head_lbn, &mut boot[..])?;
        let fid = FileId {
            rvn,
            ..FileId::INDEXF
        };
        FileHeader(&boot[..])
            .validate(&fid, rvn)
            .map_err(|_| Error::DataCheck)?;

        log::debug!(
            "member {rvn}: volume {} index header at LBN {head_lbn}",
            home.label()
        );
        Ok(Member {
            device,
            home,
            boot_header: Some(boot),
            index: None,
            bitmap: None,
        })
    }

    /// 建立索引文件（可写时还有位图文件）的控制块
    fn open_reserved(&mut self, volume: VolumeHandle, rvn: u8, writable: bool) -> Result<()> {
        let index_fid = FileId {
            rvn,
            ..FileId::INDEXF
        };
        let index = self.access_file(volume, index_fid, writable)?;
        let member = self.volumes.get_mut(volume)?.member_mut(rvn)?;
        member.index = Some(index);
        member.boot_header = None;

        // 之后索引文件头也和其它文件一样经由块组访问
        let head = match self.access_head(volume, index_fid, writable) {
            Ok(head) => head,
            Err(e) => {
                log::warn!("index file header of member {rvn} unreadable through cache: {e}");
                return Err(e);
            }
        };
        let old = std::mem::replace(&mut self.files.get_mut(index)?.head, head);
        debug_assert!(matches!(old, HeadRef::Boot(_)));

        if writable {
            let bitmap = self.access_file(
                volume,
                FileId {
                    rvn,
                    ..FileId::BITMAP
                },
                true,
            )?;
            self.volumes.get_mut(volume)?.member_mut(rvn)?.bitmap = Some(bitmap);
        }
        Ok(())
    }

    /// 撤销一个挂载到一半的成员
    fn drop_member(&mut self, volume: VolumeHandle, rvn: u8) -> Result<()> {
        let Ok(member) = self.volumes.get_mut(volume)?.member_mut(rvn) else {
            return Ok(());
        };
        let (bitmap, index, device) = (member.bitmap.take(), member.index.take(), member.device);
        if let Some(bitmap) = bitmap {
            self.deaccess_file(bitmap)?;
        }
        // 引导头还没换掉时，控制块也要能释放
        if let Some(index) = index {
            self.deaccess_file(index)?;
        }
        self.volumes.get_mut(volume)?.members[usize::from(rvn) - 1] = None;
        self.release_device(device)
    }
}
