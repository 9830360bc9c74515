//! Index-based intrusive lists over the descriptor arena.
//!
//! Every descriptor is on at most one list at a time. Links live in a side
//! table indexed by descriptor number, so list operations are O(1) and no
//! descriptor holds a reference to another.

/// Which list a descriptor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    /// Unassociated buffers of one size class.
    Free(usize),
    /// Cached buffers of one size class, least recently used first.
    Lru(usize),
    /// Modified buffers waiting for write-back, oldest first.
    Modified,
    /// Buffers a sync request handed to the swapout worker.
    Sync,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    owner: Option<ListId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// The free, LRU, modified and sync lists of one cache.
#[derive(Debug)]
pub(crate) struct Lists {
    links: Vec<Link>,
    free: Vec<Ends>,
    lru: Vec<Ends>,
    modified: Ends,
    sync: Ends,
}

impl Lists {
    pub(crate) fn new(descriptors: usize, classes: usize) -> Self {
        Self {
            links: vec![Link::default(); descriptors],
            free: vec![Ends::default(); classes],
            lru: vec![Ends::default(); classes],
            modified: Ends::default(),
            sync: Ends::default(),
        }
    }

    fn ends(&self, list: ListId) -> &Ends {
        match list {
            ListId::Free(class) => &self.free[class],
            ListId::Lru(class) => &self.lru[class],
            ListId::Modified => &self.modified,
            ListId::Sync => &self.sync,
        }
    }

    fn ends_mut(&mut self, list: ListId) -> &mut Ends {
        match list {
            ListId::Free(class) => &mut self.free[class],
            ListId::Lru(class) => &mut self.lru[class],
            ListId::Modified => &mut self.modified,
            ListId::Sync => &mut self.sync,
        }
    }

    pub(crate) fn owner(&self, index: usize) -> Option<ListId> {
        self.links[index].owner
    }

    pub(crate) fn len(&self, list: ListId) -> usize {
        self.ends(list).len
    }

    pub(crate) fn front(&self, list: ListId) -> Option<usize> {
        self.ends(list).head
    }

    /// Append `index` at the tail of `list`, first unlinking it from
    /// whatever list it was on.
    pub(crate) fn push_back(&mut self, list: ListId, index: usize) {
        self.remove(index);
        let old_tail = self.ends(list).tail;
        self.links[index] = Link {
            prev: old_tail,
            next: None,
            owner: Some(list),
        };
        match old_tail {
            Some(tail) => self.links[tail].next = Some(index),
            None => self.ends_mut(list).head = Some(index),
        }
        let ends = self.ends_mut(list);
        ends.tail = Some(index);
        ends.len += 1;
    }

    /// Unlink `index` from its list. No-op when it is on none.
    pub(crate) fn remove(&mut self, index: usize) {
        let Link { prev, next, owner } = self.links[index];
        let Some(list) = owner else {
            return;
        };
        match prev {
            Some(prev) => self.links[prev].next = next,
            None => self.ends_mut(list).head = next,
        }
        match next {
            Some(next) => self.links[next].prev = prev,
            None => self.ends_mut(list).tail = prev,
        }
        self.ends_mut(list).len -= 1;
        self.links[index] = Link::default();
    }

    pub(crate) fn pop_front(&mut self, list: ListId) -> Option<usize> {
        let head = self.ends(list).head?;
        self.remove(head);
        Some(head)
    }

    /// Members of `list`, head to tail.
    pub(crate) fn iter(&self, list: ListId) -> ListIter<'_> {
        ListIter {
            lists: self,
            cursor: self.ends(list).head,
        }
    }
}

pub(crate) struct ListIter<'a> {
    lists: &'a Lists,
    cursor: Option<usize>,
}

impl Iterator for ListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.cursor?;
        self.cursor = self.lists.links[current].next;
        Some(current)
    }
}
