//! # 对象缓存
//!
//! 卷、文件、窗口、块组这些内存对象都放在 [`Cache`] 里。
//! 对象只能通过父对象下的有序树找到，外部只持有带代数的句柄 [`Handle`]，
//! 对象被释放后旧句柄立即失效，不会悬垂。
//!
//! 引用计数归零时缓存本身不做写回，由调用者（会话）决定是留作复用还是
//! 写回后移除，因为写回需要访问设备与其它缓存。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use enumflags2::{bitflags, BitFlags};

use crate::{Error, Result};

/// 对象的状态位
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFlag {
    /// 持有者声明了写意图
    WriteIntent = 0b01,
    /// 内容与磁盘不一致
    Modified = 0b10,
}

/// 去掉类型信息的句柄，用于记录跨缓存的父子关系
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

/// 指向缓存中某个对象的句柄
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            raw: RawHandle { index, generation },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn raw(self) -> RawHandle {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.raw.index, self.raw.generation)
    }
}

/// 解除引用之后对象的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// 还有其他持有者
    InUse,
    /// 引用计数归零
    Idle,
}

#[derive(Debug)]
struct Node<K, T> {
    key: K,
    parent: Option<RawHandle>,
    refcount: u32,
    flags: BitFlags<CacheFlag>,
    /// 最近一次被访问的时刻
    stamp: u64,
    value: T,
}

#[derive(Debug)]
struct Slot<K, T> {
    generation: u32,
    node: Option<Node<K, T>>,
}

#[derive(Debug)]
pub struct Cache<K, T> {
    slots: Vec<Slot<K, T>>,
    free: Vec<u32>,
    /// 每个父对象下按键排序的子树
    trees: BTreeMap<Option<RawHandle>, BTreeMap<K, Handle<T>>>,
    /// 引用计数为零的对象，按最近访问时刻排序
    idle: BTreeSet<(u64, RawHandle)>,
    clock: u64,
    live: usize,
}

impl<K: Ord + Clone + fmt::Debug, T> Default for Cache<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone + fmt::Debug, T> Cache<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            trees: BTreeMap::new(),
            idle: BTreeSet::new(),
            clock: 0,
            live: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.node(handle).is_ok()
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.node(handle).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        self.node_mut(handle).map(|node| &mut node.value)
    }

    pub fn key(&self, handle: Handle<T>) -> Result<&K> {
        self.node(handle).map(|node| &node.key)
    }

    pub fn parent(&self, handle: Handle<T>) -> Result<Option<RawHandle>> {
        self.node(handle).map(|node| node.parent)
    }

    pub fn refcount(&self, handle: Handle<T>) -> Result<u32> {
        self.node(handle).map(|node| node.refcount)
    }

    pub fn flags(&self, handle: Handle<T>) -> Result<BitFlags<CacheFlag>> {
        self.node(handle).map(|node| node.flags)
    }

    pub fn set_flag(&mut self, handle: Handle<T>, flag: CacheFlag, on: bool) -> Result<()> {
        let node = self.node_mut(handle)?;
        node.flags.set(flag, on);
        Ok(())
    }

    /// 按键精确查找，命中时引用计数加一
    pub fn search(&mut self, parent: Option<RawHandle>, key: &K) -> Option<Handle<T>> {
        let handle = *self.trees.get(&parent)?.get(key)?;
        self.hit(handle)
    }

    /// 按比较函数查找：取键不大于`key`的最后一个对象，交给`matches`判断是否覆盖
    ///
    /// 窗口以起始块号为键，用它来找包含某个块的窗口。
    pub fn search_by(
        &mut self,
        parent: Option<RawHandle>,
        key: &K,
        matches: impl Fn(&T) -> bool,
    ) -> Option<Handle<T>> {
        let handle = *self.trees.get(&parent)?.range(..=key).next_back()?.1;
        if !matches(self.get(handle).ok()?) {
            return None;
        }
        self.hit(handle)
    }

    /// `key`两侧最近的对象（不增加引用计数）
    pub fn neighbours(
        &self,
        parent: Option<RawHandle>,
        key: &K,
    ) -> (Option<Handle<T>>, Option<Handle<T>>) {
        let Some(tree) = self.trees.get(&parent) else {
            return (None, None);
        };
        let below = tree.range(..=key).next_back().map(|(_, h)| *h);
        let above = tree
            .range(key..)
            .find(|(k, _)| *k != key)
            .map(|(_, h)| *h);
        (below, above)
    }

    /// 新建对象并挂到父对象下，初始引用计数为一
    pub fn insert(&mut self, parent: Option<RawHandle>, key: K, value: T) -> Result<Handle<T>> {
        if self
            .trees
            .get(&parent)
            .is_some_and(|tree| tree.contains_key(&key))
        {
            log::error!("cache key {key:?} already present");
            return Err(Error::BugCheck("duplicate cache key"));
        }

        let stamp = self.tick();
        let node = Node {
            key: key.clone(),
            parent,
            refcount: 1,
            flags: BitFlags::empty(),
            stamp,
            value,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                Handle::new(index, slot.generation)
            }
            None => {
                self.slots.try_reserve(1)?;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                Handle::new((self.slots.len() - 1) as u32, 0)
            }
        };
        self.trees.entry(parent).or_default().insert(key, handle);
        self.live += 1;
        Ok(handle)
    }

    /// 不经查找直接增加引用计数
    pub fn touch(&mut self, handle: Handle<T>) -> Result<()> {
        self.acquire(handle)
    }

    /// 减少引用计数，`modified`时同时标记为已修改
    pub fn untouch(&mut self, handle: Handle<T>, modified: bool) -> Result<Released> {
        let node = self.node_mut(handle)?;
        if node.refcount == 0 {
            log::error!("untouch of idle object {handle:?}");
            return Err(Error::BugCheck("reference count underflow"));
        }
        if modified {
            node.flags |= CacheFlag::Modified;
        }
        node.refcount -= 1;
        if node.refcount > 0 {
            return Ok(Released::InUse);
        }
        let stamp = node.stamp;
        self.idle.insert((stamp, handle.raw));
        Ok(Released::Idle)
    }

    /// 不论引用计数，强制移除对象
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        self.node(handle)?;
        let slot = &mut self.slots[handle.raw.index as usize];
        let node = slot.node.take().ok_or(Error::BugCheck("stale cache handle"))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.raw.index);
        self.live -= 1;
        if node.refcount == 0 {
            self.idle.remove(&(node.stamp, handle.raw));
        }

        if let Some(tree) = self.trees.get_mut(&node.parent) {
            tree.remove(&node.key);
            if tree.is_empty() {
                self.trees.remove(&node.parent);
            }
        }
        Ok(node.value)
    }

    /// 某个父对象下的全部子对象，按键升序
    pub fn children(&self, parent: Option<RawHandle>) -> Vec<Handle<T>> {
        self.trees
            .get(&parent)
            .map(|tree| tree.values().copied().collect())
            .unwrap_or_default()
    }

    /// 父对象下所有子对象的引用计数之和
    pub fn refcount_under(&self, parent: Option<RawHandle>) -> u32 {
        self.children(parent)
            .into_iter()
            .filter_map(|handle| self.refcount(handle).ok())
            .sum()
    }

    /// 最久未被访问的空闲对象
    pub fn lru_idle(&self) -> Option<Handle<T>> {
        self.idle
            .first()
            .map(|&(_, raw)| Handle::new(raw.index, raw.generation))
    }

    /// 全部对象
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.trees
            .values()
            .flat_map(|tree| tree.values().copied())
            .collect()
    }
}

impl<K, T> Cache<K, T> {
    fn node(&self, handle: Handle<T>) -> Result<&Node<K, T>> {
        self.slots
            .get(handle.raw.index as usize)
            .filter(|slot| slot.generation == handle.raw.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(Error::BugCheck("stale cache handle"))
    }

    fn node_mut(&mut self, handle: Handle<T>) -> Result<&mut Node<K, T>> {
        self.slots
            .get_mut(handle.raw.index as usize)
            .filter(|slot| slot.generation == handle.raw.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(Error::BugCheck("stale cache handle"))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn hit(&mut self, handle: Handle<T>) -> Option<Handle<T>> {
        self.acquire(handle).ok().map(|()| handle)
    }

    /// 引用计数加一并刷新访问时刻，空闲对象离开空闲集合
    fn acquire(&mut self, handle: Handle<T>) -> Result<()> {
        let stamp = self.tick();
        let node = self.node_mut(handle)?;
        let (old, was_idle) = (node.stamp, node.refcount == 0);
        node.refcount += 1;
        node.stamp = stamp;
        if was_idle {
            self.idle.remove(&(old, handle.raw));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Range(u32, u32);

    #[test]
    fn miss_then_hit() {
        let mut cache: Cache<u32, &str> = Cache::new();
        assert!(cache.search(None, &7).is_none());

        let h = cache.insert(None, 7, "seven").unwrap();
        assert_eq!(cache.refcount(h).unwrap(), 1);

        let again = cache.search(None, &7).unwrap();
        assert_eq!(again, h);
        assert_eq!(cache.refcount(h).unwrap(), 2);
        assert!(matches!(cache.insert(None, 7, "dup"), Err(Error::BugCheck(_))));
    }

    #[test]
    fn refcount_pairs_balance() {
        let mut cache: Cache<u32, ()> = Cache::new();
        let h = cache.insert(None, 1, ()).unwrap();
        for _ in 0..5 {
            cache.search(None, &1).unwrap();
            cache.touch(h).unwrap();
        }
        for _ in 0..10 {
            assert_eq!(cache.untouch(h, false).unwrap(), Released::InUse);
        }
        assert_eq!(cache.refcount(h).unwrap(), 1);
        assert_eq!(cache.untouch(h, true).unwrap(), Released::Idle);
        assert!(cache.flags(h).unwrap().contains(CacheFlag::Modified));
        assert!(matches!(cache.untouch(h, false), Err(Error::BugCheck(_))));
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut cache: Cache<u32, u8> = Cache::new();
        let h = cache.insert(None, 1, 10).unwrap();
        assert_eq!(cache.remove(h).unwrap(), 10);
        assert!(cache.get(h).is_err());

        // 槽位被复用后旧句柄依旧无效
        let h2 = cache.insert(None, 2, 20).unwrap();
        assert!(cache.get(h).is_err());
        assert_eq!(*cache.get(h2).unwrap(), 20);
        assert!(cache.search(None, &1).is_none());
    }

    #[test]
    fn covering_search() {
        let mut cache: Cache<u32, Range> = Cache::new();
        let parent = cache.insert(None, 0, Range(0, 0)).unwrap().raw();
        cache.insert(Some(parent), 1, Range(1, 10)).unwrap();
        let second = cache.insert(Some(parent), 11, Range(11, 20)).unwrap();

        let covers = |vbn: u32| move |r: &Range| (r.0..=r.1).contains(&vbn);
        assert_eq!(cache.search_by(Some(parent), &15, covers(15)), Some(second));
        assert!(cache.search_by(Some(parent), &25, covers(25)).is_none());
        assert!(cache.search_by(None, &15, covers(15)).is_none());

        let (below, above) = cache.neighbours(Some(parent), &5);
        assert!(below.is_some());
        assert_eq!(above, Some(second));
    }

    #[test]
    fn subtree_refcount_and_lru() {
        let mut cache: Cache<u32, ()> = Cache::new();
        let root = cache.insert(None, 0, ()).unwrap();
        let a = cache.insert(Some(root.raw()), 1, ()).unwrap();
        let b = cache.insert(Some(root.raw()), 2, ()).unwrap();
        cache.touch(b).unwrap();
        assert_eq!(cache.refcount_under(Some(root.raw())), 3);

        cache.untouch(a, false).unwrap();
        cache.untouch(b, false).unwrap();
        cache.untouch(b, false).unwrap();
        assert_eq!(cache.lru_idle(), Some(a));
        cache.search(None, &0);
        cache.untouch(root, false).unwrap();
        cache.untouch(root, false).unwrap();
        assert_eq!(cache.lru_idle(), Some(a));
        assert_eq!(cache.children(Some(root.raw())), vec![a, b]);
    }

    #[test]
    fn idle_order_follows_last_access() {
        let mut cache: Cache<u32, ()> = Cache::new();
        let handles: Vec<_> = (0..64).map(|k| cache.insert(None, k, ()).unwrap()).collect();
        for &h in handles.iter().rev() {
            cache.untouch(h, false).unwrap();
        }
        // 空闲顺序按访问时刻而不是释放顺序
        assert_eq!(cache.lru_idle(), Some(handles[0]));

        cache.search(None, &0).unwrap();
        assert_eq!(cache.lru_idle(), Some(handles[1]));
        cache.untouch(handles[0], false).unwrap();
        assert_eq!(cache.lru_idle(), Some(handles[1]));

        cache.remove(handles[1]).unwrap();
        assert_eq!(cache.lru_idle(), Some(handles[2]));
        for &h in &handles[2..] {
            cache.remove(h).unwrap();
        }
        assert_eq!(cache.lru_idle(), Some(handles[0]));
        cache.touch(handles[0]).unwrap();
        assert_eq!(cache.lru_idle(), None);
    }
}
