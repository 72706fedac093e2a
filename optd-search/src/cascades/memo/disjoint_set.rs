// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashMap;
use std::hash::Hash;

/// A data structure for efficiently maintaining disjoint sets of `T`.
///
/// The memo serializes access to it, so finds are plain reads and path compression only
/// happens on `union`.
#[derive(Debug, Default)]
pub struct DisjointSet<T> {
    /// Mapping from node to its parent.
    node_parents: HashMap<T, T>,
    num_sets: usize,
}

impl<T> DisjointSet<T>
where
    T: Ord + Hash + Copy,
{
    pub fn new() -> Self {
        Self {
            node_parents: HashMap::new(),
            num_sets: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.node_parents.len()
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    pub fn add(&mut self, node: T) {
        if let std::collections::hash_map::Entry::Vacant(entry) = self.node_parents.entry(node) {
            entry.insert(node);
            self.num_sets += 1;
        }
    }

    /// Follows parents until reaching the representative of the set, a node that is its own
    /// parent.
    pub fn find(&self, node: &T) -> Option<T> {
        let mut current = *self.node_parents.get(node)?;
        loop {
            let parent = *self.node_parents.get(&current)?;
            if parent == current {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Unions the set containing `a` and the set containing `b`. Returns the new representative
    /// followed by the other node, or `None` if one of the nodes is not present.
    ///
    /// The smaller representative is selected as the new representative.
    pub fn union(&mut self, a: &T, b: &T) -> Option<[T; 2]> {
        let a_rep = self.find(a)?;
        let b_rep = self.find(b)?;
        let res = match a_rep.cmp(&b_rep) {
            std::cmp::Ordering::Less => [a_rep, b_rep],
            std::cmp::Ordering::Greater => [b_rep, a_rep],
            std::cmp::Ordering::Equal => return Some([a_rep, b_rep]),
        };
        self.node_parents.insert(res[1], res[0]);
        self.num_sets -= 1;
        self.compress(a, res[0]);
        self.compress(b, res[0]);
        Some(res)
    }

    /// Points every node on the path from `node` directly at `rep`.
    fn compress(&mut self, node: &T, rep: T) {
        let mut current = *node;
        while let Some(parent) = self.node_parents.insert(current, rep) {
            if parent == current || parent == rep {
                break;
            }
            current = parent;
        }
    }

    pub fn is_representative(&self, node: &T) -> bool {
        self.node_parents.get(node) == Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minmax<T: Ord>(v1: T, v2: T) -> [T; 2] {
        if v1 <= v2 {
            [v1, v2]
        } else {
            [v2, v1]
        }
    }

    fn test_union_find<T>(inputs: Vec<T>)
    where
        T: Ord + Hash + Copy + std::fmt::Debug,
    {
        let mut set = DisjointSet::new();

        for input in inputs.iter() {
            set.add(*input);
        }

        for input in inputs.iter() {
            let rep = set.find(input);
            assert_eq!(
                rep,
                Some(*input),
                "representive should be node itself for singleton"
            );
        }
        assert_eq!(set.size(), inputs.len());
        assert_eq!(set.num_sets(), inputs.len());

        for input in inputs.iter() {
            set.union(input, input).unwrap();
            let rep = set.find(input);
            assert_eq!(rep, Some(*input), "representative should not change");
        }
        assert_eq!(set.num_sets(), inputs.len());

        let mut num_sets = set.num_sets();
        for (x, y) in inputs.iter().step_by(2).zip(inputs.iter().skip(1).step_by(2)) {
            let [rep, other] = set.union(x, y).unwrap();
            assert_eq!([rep, other], minmax(*x, *y), "smaller value is the rep");
            assert_eq!(set.find(x), Some(rep));
            assert_eq!(set.find(y), Some(rep));
            num_sets -= 1;
        }
        assert_eq!(set.num_sets(), num_sets);
    }

    #[test]
    fn union_find_i32() {
        test_union_find(vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn union_find_chain() {
        let mut set = DisjointSet::new();
        for i in 0..5 {
            set.add(i);
        }
        set.union(&3, &4);
        set.union(&2, &3);
        set.union(&4, &1);
        for i in 1..5 {
            assert_eq!(set.find(&i), Some(1));
        }
        assert_eq!(set.find(&0), Some(0));
        assert!(set.is_representative(&1));
        assert!(!set.is_representative(&4));
        assert_eq!(set.num_sets(), 2);
        assert_eq!(set.find(&7), None);
    }
}
