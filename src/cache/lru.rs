//! Slab-backed doubly-linked recency list
//!
//! Nodes live in a `Vec` and link to each other by index, so touch, remove
//! and pop are O(1) without any unsafe pointer juggling. Freed slots are
//! recycled through a free list.

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Recency order, front = least recently used
#[derive(Debug)]
pub(crate) struct LruList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> LruList<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert as most recently used, returning the slot index
    pub(crate) fn push_back(&mut self, value: T) -> usize {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(t) = self.nodes[tail].as_mut() {
                    t.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        idx
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&T> {
        self.nodes.get(idx)?.as_ref().map(|n| &n.value)
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.nodes.get_mut(idx)?.as_mut().map(|n| &mut n.value)
    }

    /// Move an entry to the most recently used position
    pub(crate) fn touch(&mut self, idx: usize) -> bool {
        if self.get(idx).is_none() {
            return false;
        }
        if self.tail == Some(idx) {
            return true;
        }
        self.unlink(idx);
        self.link_back(idx);
        true
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Option<T> {
        self.get(idx)?;
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(node.value)
    }

    /// Least recently used slot
    pub(crate) fn front(&self) -> Option<usize> {
        self.head
    }

    /// Slots from least to most recently used
    pub(crate) fn iter(&self) -> LruIter<'_, T> {
        LruIter {
            list: self,
            cursor: self.head,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(n) => (n.prev, n.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn link_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(node) = self.nodes[t].as_mut() {
                    node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }
}

pub(crate) struct LruIter<'a, T> {
    list: &'a LruList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for LruIter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.nodes.get(idx)?.as_ref()?;
        self.cursor = node.next;
        Some((idx, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &LruList<&'static str>) -> Vec<&'static str> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_insertion_order_is_recency_order() {
        let mut list = LruList::new();
        list.push_back("a");
        list.push_back("b");
        list.push_back("c");
        assert_eq!(order(&list), vec!["a", "b", "c"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut list = LruList::new();
        let a = list.push_back("a");
        list.push_back("b");
        list.push_back("c");

        assert!(list.touch(a));
        assert_eq!(order(&list), vec!["b", "c", "a"]);
        assert_eq!(list.get(list.front().unwrap()), Some(&"b"));
    }

    #[test]
    fn test_remove_middle_and_reuse_slot() {
        let mut list = LruList::new();
        list.push_back("a");
        let b = list.push_back("b");
        list.push_back("c");

        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(order(&list), vec!["a", "c"]);
        assert_eq!(list.remove(b), None);

        let d = list.push_back("d");
        assert_eq!(d, b);
        assert_eq!(order(&list), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_remove_all() {
        let mut list = LruList::new();
        let a = list.push_back("a");
        let b = list.push_back("b");
        list.remove(a);
        list.remove(b);
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
        assert!(!list.touch(a));
    }
}
