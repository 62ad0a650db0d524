//! 窗口：把一段连续的 VBN 映射到若干物理区段
//!
//! 窗口互不重叠、按起始块排序。建立新窗口时从最近的前一个窗口记下的文件头继续解码，
//! 不必每次从主文件头开始翻扩展头链。

use crate::layout::fid::FileId;
use crate::layout::header::FileHeader;
use crate::layout::map::{self, Extent};
use crate::layout::Lbn;
use crate::session::{FileHandle, VolumeHandle};
use crate::{Error, Result, Session};

/// 扩展头链长度的上限，防止损坏的链成环
const MAX_CHAIN: usize = 4096;

#[derive(Debug, Clone)]
pub struct Window {
    /// 覆盖的第一个块
    loblk: u32,
    /// 覆盖的最后一个块
    hiblk: u32,
    /// 区段所在的相对卷
    rvn: u8,
    /// (起始VBN, 区段)，按VBN升序且首尾相接
    extents: Vec<(u32, Extent)>,
    /// 提供最后一段映射的文件头
    hd_fid: FileId,
    /// 该文件头的映射从哪个VBN开始
    hd_basevbn: u32,
}

/// 一次映射的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub rvn: u8,
    pub lbn: Lbn,
    /// 从`lbn`起连续的块数
    pub count: u32,
}

impl Window {
    #[inline]
    pub fn contains(&self, vbn: u32) -> bool {
        !self.extents.is_empty() && self.loblk <= vbn && vbn <= self.hiblk
    }

    pub fn range(&self) -> (u32, u32) {
        (self.loblk, self.hiblk)
    }

    pub fn rvn(&self) -> u8 {
        self.rvn
    }

    /// 在区段中二分查找`vbn`
    pub fn lookup(&self, vbn: u32) -> Option<Mapping> {
        if !self.contains(vbn) {
            return None;
        }
        let idx = self.extents.partition_point(|(start, _)| *start <= vbn) - 1;
        let (start, ext) = self.extents[idx];
        let offset = vbn - start;
        Some(Mapping {
            rvn: self.rvn,
            lbn: ext.lbn + offset,
            count: ext.count - offset,
        })
    }

    fn push(&mut self, vbn: u32, ext: Extent) {
        debug_assert_eq!(vbn, self.hiblk + 1);
        self.extents.push((vbn, ext));
        self.hiblk = vbn + ext.count - 1;
    }

    /// 丢掉已累积的区段，从`vbn`重新开始
    fn restart(&mut self, vbn: u32, rvn: u8) {
        self.extents.clear();
        self.loblk = vbn;
        self.hiblk = vbn - 1;
        self.rvn = rvn;
    }
}

impl Session {
    /// 把文件的`vbn`映射到物理块
    pub fn get_window(&mut self, fcb: FileHandle, vbn: u32) -> Result<Mapping> {
        if vbn == 0 {
            return Err(Error::EndOfFile);
        }
        let parent = Some(fcb.raw());
        let window = match self.windows.search_by(parent, &vbn, |w| w.contains(vbn)) {
            Some(window) => window,
            None => self.build_window(fcb, vbn)?,
        };
        let mapping = self.windows.get(window)?.lookup(vbn);
        self.windows.untouch(window, false)?;
        mapping.ok_or(Error::BugCheck("window does not cover block"))
    }

    /// 文件当前缓存的窗口范围，按起始块排列
    pub fn windows_of(&self, fcb: FileHandle) -> Result<Vec<(u32, u32)>> {
        self.windows
            .children(Some(fcb.raw()))
            .into_iter()
            .map(|w| self.windows.get(w).map(Window::range))
            .collect()
    }

    /// 丢弃文件的全部窗口，映射改变后调用
    pub(crate) fn drop_windows(&mut self, fcb: FileHandle) -> Result<()> {
        for window in self.windows.children(Some(fcb.raw())) {
            self.windows.remove(window)?;
        }
        Ok(())
    }

    fn build_window(&mut self, fcb: FileHandle, vbn: u32) -> Result<crate::cache::Handle<Window>> {
        let parent = Some(fcb.raw());
        let file = self.files.get(fcb)?;
        let (volume, file_fid) = (file.volume, file.fid);

        let (below, above) = self.windows.neighbours(parent, &vbn);
        // 新窗口不能越过下一个窗口的起点
        let limit = match above {
            Some(w) => self.windows.get(w)?.loblk - 1,
            None => u32::MAX,
        };
        let mut window = match below {
            Some(w) => {
                let prev = self.windows.get(w)?;
                Window {
                    loblk: prev.hiblk + 1,
                    hiblk: prev.hiblk,
                    rvn: prev.rvn,
                    extents: Vec::new(),
                    hd_fid: prev.hd_fid,
                    hd_basevbn: prev.hd_basevbn,
                }
            }
            None => Window {
                loblk: 1,
                hiblk: 0,
                rvn: file_fid.rvn,
                extents: Vec::new(),
                hd_fid: file_fid,
                hd_basevbn: 1,
            },
        };

        let mut hd_fid = window.hd_fid;
        let mut hd_base = window.hd_basevbn;
        for _ in 0..MAX_CHAIN {
            let (words, ext_fid) = self.header_map(volume, fcb, &file_fid, &hd_fid)?;
            let header_rvn = hd_fid.volume();

            if header_rvn != window.rvn {
                // 一个窗口内的区段不能跨卷
                window.restart(hd_base.max(window.loblk), header_rvn);
            }

            let mut cur = hd_base;
            for ext in map::decode(&words)? {
                let end = cur + ext.count;
                let next = window.hiblk + 1;
                if end > next && next <= limit {
                    let skip = next.saturating_sub(cur);
                    let count = (end.min(limit.saturating_add(1))) - next;
                    window.push(
                        next,
                        Extent {
                            count,
                            lbn: ext.lbn + skip,
                        },
                    );
                }
                cur = end;
            }
            window.hd_fid = hd_fid;
            window.hd_basevbn = hd_base;

            if window.contains(vbn) {
                log::trace!(
                    "file {file_fid}: window {}..={} ({} extent(s))",
                    window.loblk,
                    window.hiblk,
                    window.extents.len()
                );
                // 读扩展头时的写回可能已经建好了同一个窗口
                if let Some(existing) = self.windows.search(parent, &window.loblk) {
                    return Ok(existing);
                }
                return self.windows.insert(parent, window.loblk, window);
            }

            if ext_fid.is_null() {
                log::debug!("file {file_fid}: block {vbn} is not mapped");
                return Err(Error::NoSuchFile);
            }
            hd_base = cur;
            hd_fid = FileId {
                rvn: if ext_fid.rvn == 0 { header_rvn } else { ext_fid.rvn },
                ..ext_fid
            };
        }
        Err(Error::BugCheck("extension header chain too long"))
    }

    /// 某个文件头的映射字与扩展头FID
    fn header_map(
        &mut self,
        volume: VolumeHandle,
        fcb: FileHandle,
        file_fid: &FileId,
        hd_fid: &FileId,
    ) -> Result<(Vec<u16>, FileId)> {
        if hd_fid.number() == file_fid.number() && hd_fid.volume() == file_fid.volume() {
            let header = self.header(fcb)?;
            return Ok((header.map_words(), header.ext_fid()));
        }
        let head = self.access_head(volume, *hd_fid, false)?;
        let header = FileHeader(self.head_bytes(&head)?);
        let result = (header.map_words(), header.ext_fid());
        self.release_head(head)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(extents: &[(u32, u32, u32)]) -> Window {
        let mut w = Window {
            loblk: extents[0].0,
            hiblk: extents[0].0 - 1,
            rvn: 1,
            extents: Vec::new(),
            hd_fid: FileId::new(20, 1),
            hd_basevbn: 1,
        };
        for &(vbn, count, lbn) in extents {
            w.push(vbn, Extent::new(count, lbn));
        }
        w
    }

    #[test]
    fn lookup_within_extents() {
        let w = window(&[(1, 3, 100), (4, 2, 50), (6, 10, 900)]);
        assert_eq!(w.range(), (1, 15));
        assert_eq!(
            w.lookup(1),
            Some(Mapping {
                rvn: 1,
                lbn: Lbn::new(100),
                count: 3
            })
        );
        assert_eq!(w.lookup(5).map(|m| (m.lbn.get(), m.count)), Some((51, 1)));
        assert_eq!(w.lookup(15).map(|m| (m.lbn.get(), m.count)), Some((909, 1)));
        assert_eq!(w.lookup(16), None);
        assert_eq!(w.lookup(0), None);
    }

    #[test]
    fn restart_discards_extents() {
        let mut w = window(&[(1, 3, 100)]);
        w.restart(4, 2);
        assert!(!w.contains(2));
        w.push(4, Extent::new(2, 7));
        assert_eq!(w.range(), (4, 5));
        assert_eq!(w.lookup(5).map(|m| (m.rvn, m.lbn.get())), Some((2, 8)));
    }
}
