// Kelp Persistent Trie
// Immutable hash array mapped trie over string keys
//
// Every update returns a new root and shares all untouched subtrees with the
// previous version, so a snapshot can be handed to another VM by cloning the
// root pointer.

use rustc_hash::FxHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

const BITS: u32 = 5;
const WIDTH: u32 = 1 << BITS;
const MASK: u64 = (WIDTH - 1) as u64;
/// Levels that consume hash bits; below this keys live in collision buckets
const MAX_DEPTH: u32 = 12;

pub type HashFn = fn(&str) -> u64;

fn fx_hash(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

#[derive(Clone)]
enum Entry<V> {
    Leaf(Arc<str>, V),
    Node(Arc<Node<V>>),
    Bucket(Arc<Vec<(Arc<str>, V)>>),
}

#[derive(Clone)]
struct Node<V> {
    bitmap: u32,
    entries: Vec<Entry<V>>,
}

impl<V: Clone> Node<V> {
    fn empty() -> Self {
        Self {
            bitmap: 0,
            entries: Vec::new(),
        }
    }

    fn slot(&self, bit: u32) -> usize {
        (self.bitmap & (bit - 1)).count_ones() as usize
    }
}

fn fragment(hash: u64, depth: u32) -> u32 {
    1 << ((hash >> (depth * BITS)) & MASK)
}

/// Persistent map from string keys to `V`.
#[derive(Clone)]
pub struct Trie<V> {
    root: Arc<Node<V>>,
    len: usize,
    hasher: HashFn,
}

impl<V: Clone> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> Trie<V> {
    pub fn new() -> Self {
        Self::with_hasher(fx_hash)
    }

    /// Build a trie with a custom key hash
    pub fn with_hasher(hasher: HashFn) -> Self {
        Self {
            root: Arc::new(Node::empty()),
            len: 0,
            hasher,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both tries are the same version
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        let hash = (self.hasher)(key);
        let mut node: &Node<V> = &self.root;
        let mut depth = 0;
        loop {
            let bit = fragment(hash, depth);
            if node.bitmap & bit == 0 {
                return None;
            }
            match &node.entries[node.slot(bit)] {
                Entry::Leaf(k, v) => return if &**k == key { Some(v) } else { None },
                Entry::Bucket(items) => {
                    return items.iter().find(|(k, _)| &**k == key).map(|(_, v)| v);
                }
                Entry::Node(child) => {
                    node = child;
                    depth += 1;
                }
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Return a new map with `key` bound to `value`; `self` is untouched
    pub fn put(&self, key: &str, value: V) -> Self {
        let hash = (self.hasher)(key);
        let key: Arc<str> = Arc::from(key);
        let (root, added) = self.put_node(&self.root, 0, hash, key, value);
        Self {
            root: Arc::new(root),
            len: self.len + usize::from(added),
            hasher: self.hasher,
        }
    }

    fn put_node(&self, node: &Node<V>, depth: u32, hash: u64, key: Arc<str>, value: V) -> (Node<V>, bool) {
        let bit = fragment(hash, depth);
        let slot = node.slot(bit);
        let mut copy = node.clone();

        if node.bitmap & bit == 0 {
            copy.entries.insert(slot, Entry::Leaf(key, value));
            copy.bitmap |= bit;
            return (copy, true);
        }

        let (replacement, added) = match &node.entries[slot] {
            Entry::Leaf(existing, _) if *existing == key => (Entry::Leaf(key, value), false),
            Entry::Leaf(existing, existing_value) => {
                let existing_hash = (self.hasher)(&**existing);
                let split = self.split(
                    depth + 1,
                    (existing.clone(), existing_value.clone(), existing_hash),
                    (key, value, hash),
                );
                (split, true)
            }
            Entry::Node(child) => {
                let (child, added) = self.put_node(child, depth + 1, hash, key, value);
                (Entry::Node(Arc::new(child)), added)
            }
            Entry::Bucket(items) => {
                let mut items = (**items).clone();
                let added = match items.iter_mut().find(|(k, _)| *k == key) {
                    Some(item) => {
                        item.1 = value;
                        false
                    }
                    None => {
                        items.push((key, value));
                        true
                    }
                };
                (Entry::Bucket(Arc::new(items)), added)
            }
        };
        copy.entries[slot] = replacement;
        (copy, added)
    }

    /// Push two colliding leaves down until their hash fragments differ
    fn split(&self, depth: u32, a: (Arc<str>, V, u64), b: (Arc<str>, V, u64)) -> Entry<V> {
        if depth >= MAX_DEPTH {
            return Entry::Bucket(Arc::new(vec![(a.0, a.1), (b.0, b.1)]));
        }
        let bit_a = fragment(a.2, depth);
        let bit_b = fragment(b.2, depth);
        let node = if bit_a == bit_b {
            Node {
                bitmap: bit_a,
                entries: vec![self.split(depth + 1, a, b)],
            }
        } else {
            let leaf_a = Entry::Leaf(a.0, a.1);
            let leaf_b = Entry::Leaf(b.0, b.1);
            let entries = if bit_a < bit_b {
                vec![leaf_a, leaf_b]
            } else {
                vec![leaf_b, leaf_a]
            };
            Node {
                bitmap: bit_a | bit_b,
                entries,
            }
        };
        Entry::Node(Arc::new(node))
    }

    /// Return a new map without `key`
    pub fn remove(&self, key: &str) -> Self {
        let hash = (self.hasher)(key);
        match Self::remove_node(&self.root, 0, hash, key) {
            Some(root) => Self {
                root: Arc::new(root),
                len: self.len - 1,
                hasher: self.hasher,
            },
            None => self.clone(),
        }
    }

    fn remove_node(node: &Node<V>, depth: u32, hash: u64, key: &str) -> Option<Node<V>> {
        let bit = fragment(hash, depth);
        if node.bitmap & bit == 0 {
            return None;
        }
        let slot = node.slot(bit);
        let mut copy = node.clone();
        match &node.entries[slot] {
            Entry::Leaf(k, _) => {
                if &**k != key {
                    return None;
                }
                copy.entries.remove(slot);
                copy.bitmap &= !bit;
            }
            Entry::Node(child) => {
                let child = Self::remove_node(child, depth + 1, hash, key)?;
                if child.entries.is_empty() {
                    copy.entries.remove(slot);
                    copy.bitmap &= !bit;
                } else {
                    copy.entries[slot] = Entry::Node(Arc::new(child));
                }
            }
            Entry::Bucket(items) => {
                let position = items.iter().position(|(k, _)| &**k == key)?;
                let mut items = (**items).clone();
                items.remove(position);
                if items.is_empty() {
                    copy.entries.remove(slot);
                    copy.bitmap &= !bit;
                } else {
                    copy.entries[slot] = Entry::Bucket(Arc::new(items));
                }
            }
        }
        Some(copy)
    }

    /// Visit every entry in trie order; stop early when `visit` returns false
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        Self::range_node(&self.root, &mut visit);
    }

    fn range_node<F>(node: &Node<V>, visit: &mut F) -> bool
    where
        F: FnMut(&str, &V) -> bool,
    {
        for entry in &node.entries {
            let keep_going = match entry {
                Entry::Leaf(k, v) => visit(&**k, v),
                Entry::Node(child) => Self::range_node(child, visit),
                Entry::Bucket(items) => items.iter().all(|(k, v)| visit(&**k, v)),
            };
            if !keep_going {
                return false;
            }
        }
        true
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        let mut keys = Vec::with_capacity(self.len);
        self.range(|k, _| {
            keys.push(Arc::from(k));
            true
        });
        keys
    }

    pub fn entries(&self) -> Vec<(Arc<str>, V)> {
        let mut out = Vec::with_capacity(self.len);
        self.range(|k, v| {
            out.push((Arc::from(k), v.clone()));
            true
        });
        out
    }

    /// Fold `other` into `self`; entries of `other` win on conflict
    pub fn merge(&self, other: &Trie<V>) -> Self {
        let mut merged = self.clone();
        other.range(|k, v| {
            merged = merged.put(k, v.clone());
            true
        });
        merged
    }
}

impl<V: Clone + fmt::Debug> fmt::Debug for Trie<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.range(|k, v| {
            map.entry(&k, v);
            true
        });
        map.finish()
    }
}
