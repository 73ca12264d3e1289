//! Radix index of the addresses touched by in-flight transactions.
//!
//! Addresses are hierarchical: a short address is a namespace covering every
//! longer address that shares its prefix. A conflict check therefore has to
//! look both up the tree (is an enclosing namespace already claimed?) and down
//! it (does activity already exist inside this namespace?).
//!
//! Each node holds the readers recorded at that address and at most one
//! writer. Setting a writer drops the node's readers and its whole subtree,
//! since the new writer already follows everything recorded beneath it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::num::NonZeroUsize;

/// One address with recorded readers and/or a writer.
#[derive(Debug, Clone)]
pub struct PredecessorNode<T> {
    children: HashMap<String, PredecessorNode<T>>,
    readers: Vec<T>,
    writer: Option<T>,
}

impl<T> PredecessorNode<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            readers: Vec::new(),
            writer: None,
        }
    }

    pub fn readers(&self) -> &[T] {
        &self.readers
    }

    pub fn writer(&self) -> Option<&T> {
        self.writer.as_ref()
    }

    /// Tokens of the direct children, in no particular order.
    pub fn child_tokens(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}

/// Predecessor index for one scheduling epoch.
#[derive(Debug, Clone)]
pub struct PredecessorTree<T> {
    token_size: NonZeroUsize,
    root: PredecessorNode<T>,
}

impl<T> PredecessorTree<T>
where
    T: Clone + Eq + Hash,
{
    /// Creates a tree that branches on every character.
    pub fn new() -> Self {
        Self::with_token_size(NonZeroUsize::MIN)
    }

    /// Creates a tree that branches every `token_size` characters.
    ///
    /// Prefix queries are only exact for addresses whose length is a multiple
    /// of `token_size`, e.g. byte-aligned hex addresses with a size of 2.
    pub fn with_token_size(token_size: NonZeroUsize) -> Self {
        Self {
            token_size,
            root: PredecessorNode::new(),
        }
    }

    fn tokenize(&self, address: &str) -> Vec<String> {
        let chars: Vec<char> = address.chars().collect();
        chars
            .chunks(self.token_size.get())
            .map(|chunk| chunk.iter().collect())
            .collect()
    }

    /// Returns the node at `address`, if one exists.
    pub fn get(&self, address: &str) -> Option<&PredecessorNode<T>> {
        let mut node = &self.root;
        for token in self.tokenize(address) {
            node = node.children.get(&token)?;
        }
        Some(node)
    }

    fn get_or_create(&mut self, address: &str) -> &mut PredecessorNode<T> {
        let tokens = self.tokenize(address);
        let mut node = &mut self.root;
        for token in tokens {
            node = node.children.entry(token).or_insert_with(PredecessorNode::new);
        }
        node
    }

    /// Records `reader` at `address`. Existing writers are left alone.
    pub fn add_reader(&mut self, address: &str, reader: T) {
        let node = self.get_or_create(address);
        if !node.readers.contains(&reader) {
            node.readers.push(reader);
        }
    }

    /// Makes `writer` the only entry at `address` and prunes everything below it.
    pub fn set_writer(&mut self, address: &str, writer: T) {
        let node = self.get_or_create(address);
        node.readers.clear();
        node.writer = Some(writer);
        node.children.clear();
    }

    /// Transactions that must finish before a write to `address`.
    ///
    /// That is every reader at or above the address, the nearest writer at or
    /// above it, and every reader and writer below it. Writers further up than
    /// the nearest one are already predecessors of that writer.
    pub fn find_write_predecessors(&self, address: &str) -> HashSet<T> {
        let mut predecessors = HashSet::new();

        let mut node = &self.root;
        let mut enclosing_writer = node.writer.as_ref();
        predecessors.extend(node.readers.iter().cloned());

        for token in self.tokenize(address) {
            match node.children.get(&token) {
                Some(child) => node = child,
                None => {
                    // Nothing recorded at or below the address.
                    predecessors.extend(enclosing_writer.cloned());
                    return predecessors;
                }
            }
            predecessors.extend(node.readers.iter().cloned());
            if node.writer.is_some() {
                enclosing_writer = node.writer.as_ref();
            }
        }
        predecessors.extend(enclosing_writer.cloned());

        let mut to_process: VecDeque<&PredecessorNode<T>> = node.children.values().collect();
        while let Some(descendant) = to_process.pop_front() {
            predecessors.extend(descendant.readers.iter().cloned());
            predecessors.extend(descendant.writer.iter().cloned());
            to_process.extend(descendant.children.values());
        }

        predecessors
    }

    /// Transactions that must finish before a read of `address`.
    ///
    /// Only writers matter: the nearest writer at or above the address and
    /// every writer below it. Readers never block a read.
    pub fn find_read_predecessors(&self, address: &str) -> HashSet<T> {
        let mut predecessors = HashSet::new();

        let mut node = &self.root;
        let mut enclosing_writer = node.writer.as_ref();

        for token in self.tokenize(address) {
            match node.children.get(&token) {
                Some(child) => node = child,
                None => {
                    predecessors.extend(enclosing_writer.cloned());
                    return predecessors;
                }
            }
            if node.writer.is_some() {
                enclosing_writer = node.writer.as_ref();
            }
        }
        predecessors.extend(enclosing_writer.cloned());

        let mut to_process: VecDeque<&PredecessorNode<T>> = node.children.values().collect();
        while let Some(descendant) = to_process.pop_front() {
            predecessors.extend(descendant.writer.iter().cloned());
            to_process.extend(descendant.children.values());
        }

        predecessors
    }

    /// Total number of (reader, writer) entries recorded in the tree.
    pub fn entry_counts(&self) -> (usize, usize) {
        let mut readers = 0;
        let mut writers = 0;
        let mut to_process = VecDeque::from([&self.root]);
        while let Some(node) = to_process.pop_front() {
            readers += node.readers.len();
            writers += usize::from(node.writer.is_some());
            to_process.extend(node.children.values());
        }
        (readers, writers)
    }

    /// Drops everything; used when an epoch ends.
    pub fn clear(&mut self) {
        self.root = PredecessorNode::new();
    }
}

impl<T> Default for PredecessorTree<T>
where
    T: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn set(ids: &[u32]) -> HashSet<u32> {
        ids.iter().copied().collect()
    }

    fn add_readers(tree: &mut PredecessorTree<u32>, readers: &[(&str, u32)]) {
        for (address, id) in readers {
            tree.add_reader(address, *id);
        }
    }

    fn assert_preds(tree: &PredecessorTree<u32>, address: &str, read: &[u32], write: &[u32]) {
        assert_eq!(
            tree.find_read_predecessors(address),
            set(read),
            "read predecessors of {address:?}"
        );
        assert_eq!(
            tree.find_write_predecessors(address),
            set(write),
            "write predecessors of {address:?}"
        );
    }

    /// Readers below a namespace, then a writer in the middle of it.
    fn radix_tree() -> PredecessorTree<u32> {
        let mut tree = PredecessorTree::new();
        add_readers(
            &mut tree,
            &[("radix", 1), ("radish", 2), ("radon", 3), ("razzle", 4), ("rustic", 5)],
        );
        add_readers(&mut tree, &[("rad", 6), ("rust", 7)]);
        tree.set_writer("radi", 8);
        tree
    }

    #[test]
    fn test_readers_only() {
        let mut tree = PredecessorTree::new();
        add_readers(
            &mut tree,
            &[("radix", 1), ("radish", 2), ("radon", 3), ("razzle", 4), ("rustic", 5)],
        );

        assert_eq!(tree.entry_counts(), (5, 0));
        assert_preds(&tree, "r", &[], &[1, 2, 3, 4, 5]);
        assert_preds(&tree, "rad", &[], &[1, 2, 3]);
        assert_preds(&tree, "radi", &[], &[1, 2]);
        assert_preds(&tree, "radix", &[], &[1]);
    }

    #[test]
    fn test_writer_in_middle_of_tree() {
        let tree = radix_tree();

        assert_eq!(tree.entry_counts(), (5, 1));
        assert_preds(&tree, "rad", &[8], &[3, 6, 8]);
        assert_preds(&tree, "radi", &[8], &[6, 8]);
        assert_preds(&tree, "radical", &[8], &[6, 8]);
        assert!(tree.get("radix").is_none());
        assert!(tree.get("radish").is_none());
    }

    #[test]
    fn test_writer_supersedes_subtree() {
        let mut tree = radix_tree();
        add_readers(
            &mut tree,
            &[("rad", 9), ("radi", 10), ("radio", 11), ("radon", 12), ("rust", 13)],
        );
        tree.set_writer("radii", 14);
        assert_preds(&tree, "radi", &[8, 14], &[6, 8, 9, 10, 11, 14]);
        assert_preds(&tree, "radii", &[14], &[6, 9, 10, 14]);

        tree.set_writer("rust", 15);
        tree.set_writer("rad", 16);

        assert_eq!(tree.entry_counts(), (1, 2));
        assert_preds(&tree, "rad", &[16], &[16]);
        assert_preds(&tree, "radio", &[16], &[16]);
        assert_preds(&tree, "radon", &[16], &[16]);
        assert_preds(&tree, "r", &[15, 16], &[4, 15, 16]);
        assert_preds(&tree, "rustic", &[15], &[15]);
        assert!(tree.get("radi").is_none());
    }

    #[test]
    fn test_writer_at_root() {
        let mut tree = radix_tree();
        tree.set_writer("", 0);

        assert_eq!(tree.entry_counts(), (0, 1));
        assert_preds(&tree, "", &[0], &[0]);
        assert_preds(&tree, "rabbit", &[0], &[0]);
        assert_preds(&tree, "s", &[0], &[0]);
    }

    #[test]
    fn test_initial_segment_addresses() {
        let mut tree = PredecessorTree::new();
        for (address, id) in [("c", 1), ("ca", 2), ("cat", 3)] {
            tree.set_writer(address, id);
            tree.add_reader(address, id);
        }

        assert_eq!(tree.entry_counts(), (3, 3));
        assert_preds(&tree, "", &[1, 2, 3], &[1, 2, 3]);
        assert_preds(&tree, "ca", &[2, 3], &[1, 2, 3]);
        assert_preds(&tree, "cath", &[3], &[1, 2, 3]);

        tree.set_writer("carp", 4);
        tree.add_reader("carp", 4);
        assert_preds(&tree, "ca", &[2, 3, 4], &[1, 2, 3, 4]);
        assert_preds(&tree, "carp", &[4], &[1, 2, 4]);
        assert_preds(&tree, "dog", &[], &[]);
    }

    #[test]
    fn test_hex_tokens() {
        let address_a = "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb";
        let address_b = "3e23e8160039594a33894f6564e1b1348bbd7a0088d42c4acb73eeaed59c009d";

        let mut tree = PredecessorTree::with_token_size(NonZeroUsize::new(2).unwrap());
        tree.add_reader(address_a, 1);
        tree.add_reader(address_b, 2);
        tree.set_writer(address_a, 1);
        tree.set_writer(&address_b[0..4], 3);
        assert!(tree.get(address_b).is_none());

        tree.add_reader(address_a, 1);
        tree.add_reader(address_b, 2);

        let node = tree.get(&address_b[0..4]).unwrap();
        assert_eq!(node.writer(), Some(&3));
        assert_eq!(node.child_tokens().collect::<Vec<_>>(), vec!["e8"]);

        assert_eq!(tree.find_write_predecessors(address_a), set(&[1]));
        assert_eq!(tree.find_read_predecessors(address_a), set(&[1]));
        assert_eq!(tree.find_write_predecessors(address_b), set(&[2, 3]));
        assert_eq!(tree.find_read_predecessors(address_b), set(&[3]));
    }

    /// Flat reference model: every recorded address mapped to its entries.
    #[derive(Default)]
    struct Model {
        entries: HashMap<String, (Vec<u32>, Option<u32>)>,
    }

    impl Model {
        fn add_reader(&mut self, address: &str, id: u32) {
            let entry = self.entries.entry(address.to_string()).or_default();
            if !entry.0.contains(&id) {
                entry.0.push(id);
            }
        }

        fn set_writer(&mut self, address: &str, id: u32) {
            self.entries
                .retain(|k, _| !(k.len() > address.len() && k.starts_with(address)));
            self.entries
                .insert(address.to_string(), (Vec::new(), Some(id)));
        }

        fn enclosing_writer(&self, address: &str) -> Option<u32> {
            self.entries
                .iter()
                .filter(|(k, (_, w))| address.starts_with(k.as_str()) && w.is_some())
                .max_by_key(|(k, _)| k.len())
                .and_then(|(_, (_, w))| *w)
        }

        fn read_preds(&self, address: &str) -> HashSet<u32> {
            let mut preds: HashSet<u32> = self.enclosing_writer(address).into_iter().collect();
            for (k, (_, w)) in &self.entries {
                if k.len() > address.len() && k.starts_with(address) {
                    preds.extend(w);
                }
            }
            preds
        }

        fn write_preds(&self, address: &str) -> HashSet<u32> {
            let mut preds = self.read_preds(address);
            for (k, (readers, _)) in &self.entries {
                if address.starts_with(k.as_str()) || k.starts_with(address) {
                    preds.extend(readers);
                }
            }
            preds
        }
    }

    fn address_strategy() -> impl Strategy<Value = String> {
        proptest::collection::vec(prop_oneof![Just('a'), Just('b'), Just('c')], 0..4)
            .prop_map(|chars| chars.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_matches_flat_model(
            ops in proptest::collection::vec((any::<bool>(), address_strategy()), 1..40),
            queries in proptest::collection::vec(address_strategy(), 1..10),
        ) {
            let mut tree = PredecessorTree::new();
            let mut model = Model::default();
            for (id, (is_write, address)) in ops.iter().enumerate() {
                let id = id as u32;
                if *is_write {
                    tree.set_writer(address, id);
                    model.set_writer(address, id);
                } else {
                    tree.add_reader(address, id);
                    model.add_reader(address, id);
                }
            }
            for address in &queries {
                prop_assert_eq!(tree.find_read_predecessors(address), model.read_preds(address));
                prop_assert_eq!(tree.find_write_predecessors(address), model.write_preds(address));
            }
        }
    }
}
