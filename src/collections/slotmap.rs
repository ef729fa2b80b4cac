use core::fmt;

/// A key into a [`SlotMap`]. The generation makes stale keys miss once their slot is reused.
pub trait SlotKey: Copy + Eq + fmt::Debug {
    fn from_parts(idx: u32, generation: u32) -> Self;
    fn idx(self) -> usize;
    fn generation(self) -> u32;
}

macro_rules! slot_keys {
    {$($(#[$meta:meta])* $name:ident)*} => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
            pub struct $name {
                idx: u32,
                generation: u32,
            }
            impl $crate::collections::SlotKey for $name {
                fn from_parts(idx: u32, generation: u32) -> Self {
                    Self { idx, generation }
                }
                fn idx(self) -> usize {
                    self.idx as usize
                }
                fn generation(self) -> u32 {
                    self.generation
                }
            }
            impl core::fmt::Display for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    write!(f, "{}v{}", self.idx, self.generation)
                }
            }
        )*
    };
}
pub(crate) use slot_keys;

const NONE: u32 = u32::MAX;

#[derive(Debug)]
pub struct SlotMap<K, T> {
    head: u32,
    len: usize,
    // (generation, value or next free slot)
    entries: Vec<(u32, Result<T, u32>)>,
    _key: core::marker::PhantomData<K>,
}
impl<K: SlotKey, T> Default for SlotMap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<K: SlotKey, T> SlotMap<K, T> {
    pub fn new() -> Self {
        Self {
            head: NONE,
            len: 0,
            entries: vec![],
            _key: core::marker::PhantomData,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    fn slot(&self, key: K) -> Option<&T> {
        match self.entries.get(key.idx())? {
            (generation, Ok(v)) if *generation == key.generation() => Some(v),
            _ => None,
        }
    }
    pub fn get(&self, key: K) -> Option<&T> {
        self.slot(key)
    }
    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        match self.entries.get_mut(key.idx())? {
            (generation, Ok(v)) if *generation == key.generation() => Some(v),
            _ => None,
        }
    }
    pub fn contains(&self, key: K) -> bool {
        self.slot(key).is_some()
    }
    /// The live key occupying slot `idx`, if any.
    pub fn key_at(&self, idx: usize) -> Option<K> {
        match self.entries.get(idx)? {
            (generation, Ok(_)) => Some(K::from_parts(idx as u32, *generation)),
            _ => None,
        }
    }
    /// The key the next call to [`SlotMap::insert`] will hand out.
    pub fn next_key(&self) -> K {
        if self.head == NONE {
            K::from_parts(self.entries.len() as u32, 0)
        } else {
            K::from_parts(self.head, self.entries[self.head as usize].0)
        }
    }
    pub fn insert(&mut self, value: T) -> K {
        let key = self.next_key();
        if self.head == NONE {
            self.entries.push((0, Ok(value)));
        } else {
            let slot = &mut self.entries[key.idx()];
            self.head = core::mem::replace(&mut slot.1, Ok(value))
                .map(|_| ())
                .expect_err("corrupted slotmap");
        }
        self.len += 1;
        key
    }
    pub fn release(&mut self, key: K) -> Option<T> {
        let head = self.head;
        let (generation, entry) = self.entries.get_mut(key.idx())?;
        if *generation != key.generation() || entry.is_err() {
            return None;
        }
        let value = core::mem::replace(entry, Err(head)).ok();
        *generation = generation.wrapping_add(1);
        self.head = key.idx() as u32;
        self.len -= 1;
        value
    }
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k).collect()
    }
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, (generation, v))| {
            v.as_ref().ok().map(|v| (K::from_parts(i as u32, *generation), v))
        })
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(i, (generation, v))| {
            let generation = *generation;
            v.as_mut().ok().map(|v| (K::from_parts(i as u32, generation), v))
        })
    }
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.iter().map(|(_, v)| v)
    }
}
