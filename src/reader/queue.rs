use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Retry,
    Normal,
}

type Key = (Urgency, usize, u64, usize);

#[derive(Debug, Clone, Copy)]
struct Request {
    index: usize,
    urgency: Urgency,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct PageQueue {
    anchor: usize,
    next_seq: u64,
    heap: BinaryHeap<Reverse<Key>>,
    members: HashSet<usize>,
}

impl PageQueue {
    pub fn new(anchor: usize) -> Self {
        Self {
            anchor,
            ..Self::default()
        }
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }

    fn key(&self, req: Request) -> Key {
        (req.urgency, req.index.abs_diff(self.anchor), req.seq, req.index)
    }

    pub fn push(&mut self, index: usize, urgency: Urgency) -> bool {
        if self.members.contains(&index) {
            if urgency == Urgency::Retry {
                self.remove(index);
            } else {
                return false;
            }
        }
        let req = Request {
            index,
            urgency,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.members.insert(index);
        self.heap.push(Reverse(self.key(req)));
        true
    }

    pub fn pop(&mut self) -> Option<usize> {
        let Reverse((_, _, _, index)) = self.heap.pop()?;
        self.members.remove(&index);
        Some(index)
    }

    pub fn set_anchor(&mut self, anchor: usize) {
        if anchor == self.anchor {
            return;
        }
        self.anchor = anchor;
        let requests: Vec<Request> = self.drain_requests();
        self.heap = requests
            .into_iter()
            .map(|req| Reverse(self.key(req)))
            .collect();
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if !self.members.remove(&index) {
            return false;
        }
        self.heap.retain(|Reverse((_, _, _, i))| *i != index);
        true
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize) -> bool,
    {
        self.heap.retain(|Reverse((_, _, _, i))| keep(*i));
        self.members = self.heap.iter().map(|Reverse((_, _, _, i))| *i).collect();
    }

    pub fn contains(&self, index: usize) -> bool {
        self.members.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.members.clear();
    }

    fn drain_requests(&mut self) -> Vec<Request> {
        self.heap
            .drain()
            .map(|Reverse((urgency, _, seq, index))| Request {
                index,
                urgency,
                seq,
            })
            .collect()
    }
}
