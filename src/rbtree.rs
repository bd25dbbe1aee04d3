//! Red-black sibling tree
//!
//! Each storage indexes its children through a red-black tree whose nodes
//! are the directory entries themselves: the left/right links and the node
//! colour live inside the 128-byte records, addressed by SID. The tree
//! never owns nodes; every operation works on borrows of the directory
//! vector and reads/writes the embedded links.
//!
//! Parent links are not stored in the format. Mutating operations attach to
//! a tree by rebuilding a SID -> parent map from the stored links, which
//! doubles as structural validation (out-of-range SIDs and cyclic sibling
//! references surface here as `Corrupted`).

use crate::directory::{cmp_names, DirectoryEntry, StgColor, NOSTREAM};
use crate::error::{CfbError, Result};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const NIL: u32 = NOSTREAM;

/// Outcome of a removal. When the target had two children the predecessor's
/// payload is copied into the target's record and the predecessor's slot is
/// the one structurally removed; `freed_sid` names the slot the caller must
/// invalidate.
#[derive(Debug)]
pub struct RemovedNode {
    pub freed_sid: u32,
    /// True when a predecessor payload was relocated into the target slot.
    pub relocated: bool,
}

/// Mutable view over one storage's sibling tree
pub struct SiblingTree<'a> {
    dir: &'a mut Vec<DirectoryEntry>,
    root: u32,
    parents: HashMap<u32, u32>,
    nil_parent: u32,
}

impl<'a> SiblingTree<'a> {
    /// Attach to the tree rooted at `root`, rebuilding and validating the
    /// parent map.
    pub fn attach(dir: &'a mut Vec<DirectoryEntry>, root: u32) -> Result<Self> {
        let mut parents = HashMap::new();

        if root != NIL {
            if root as usize >= dir.len() {
                return Err(CfbError::Corrupted(format!(
                    "child SID {} out of range",
                    root
                )));
            }
            let mut stack = vec![root];
            let mut seen = 0usize;
            while let Some(node) = stack.pop() {
                seen += 1;
                if seen > dir.len() {
                    return Err(CfbError::Corrupted(
                        "cyclic sibling reference in directory".into(),
                    ));
                }
                let entry = &dir[node as usize];
                for link in [entry.left_sibling, entry.right_sibling] {
                    if link == NIL {
                        continue;
                    }
                    if link as usize >= dir.len() {
                        return Err(CfbError::Corrupted(format!(
                            "sibling SID {} out of range",
                            link
                        )));
                    }
                    if parents.insert(link, node).is_some() {
                        return Err(CfbError::Corrupted(
                            "cyclic sibling reference in directory".into(),
                        ));
                    }
                    stack.push(link);
                }
            }
        }

        Ok(SiblingTree {
            dir,
            root,
            parents,
            nil_parent: NIL,
        })
    }

    /// Root SID after the last mutation, `NOSTREAM` when empty. The caller
    /// stores this into the parent storage's child link.
    pub fn root(&self) -> u32 {
        self.root
    }

    fn left(&self, x: u32) -> u32 {
        if x == NIL {
            NIL
        } else {
            self.dir[x as usize].left_sibling
        }
    }

    fn right(&self, x: u32) -> u32 {
        if x == NIL {
            NIL
        } else {
            self.dir[x as usize].right_sibling
        }
    }

    fn set_left(&mut self, x: u32, v: u32) {
        self.dir[x as usize].left_sibling = v;
    }

    fn set_right(&mut self, x: u32, v: u32) {
        self.dir[x as usize].right_sibling = v;
    }

    fn color(&self, x: u32) -> StgColor {
        if x == NIL {
            StgColor::Black
        } else {
            self.dir[x as usize].color
        }
    }

    fn set_color(&mut self, x: u32, color: StgColor) {
        if x != NIL {
            self.dir[x as usize].color = color;
        }
    }

    fn parent_of(&self, x: u32) -> u32 {
        if x == NIL {
            self.nil_parent
        } else {
            *self.parents.get(&x).unwrap_or(&NIL)
        }
    }

    fn set_parent(&mut self, x: u32, p: u32) {
        if x == NIL {
            self.nil_parent = p;
        } else {
            self.parents.insert(x, p);
        }
    }

    fn cmp_nodes(&self, a: u32, b: u32) -> Ordering {
        cmp_names(
            self.dir[a as usize].name_units(),
            self.dir[b as usize].name_units(),
        )
    }

    fn rotate_left(&mut self, x: u32) {
        let y = self.right(x);
        debug_assert_ne!(y, NIL);

        let yl = self.left(y);
        self.set_right(x, yl);
        self.set_parent(yl, x);

        let p = self.parent_of(x);
        self.set_parent(y, p);
        if x == self.root {
            self.root = y;
        } else if self.left(p) == x {
            self.set_left(p, y);
        } else {
            self.set_right(p, y);
        }

        self.set_left(y, x);
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, x: u32) {
        let y = self.left(x);
        debug_assert_ne!(y, NIL);

        let yr = self.right(y);
        self.set_left(x, yr);
        self.set_parent(yr, x);

        let p = self.parent_of(x);
        self.set_parent(y, p);
        if x == self.root {
            self.root = y;
        } else if self.left(p) == x {
            self.set_left(p, y);
        } else {
            self.set_right(p, y);
        }

        self.set_right(y, x);
        self.set_parent(x, y);
    }

    /// Insert the entry at `sid` by its name key. Duplicate keys are
    /// rejected with `Duplicated`.
    pub fn insert(&mut self, sid: u32) -> Result<()> {
        debug_assert!((sid as usize) < self.dir.len());

        if self.root == NIL {
            self.set_left(sid, NIL);
            self.set_right(sid, NIL);
            self.set_color(sid, StgColor::Black);
            self.set_parent(sid, NIL);
            self.root = sid;
            return Ok(());
        }

        let mut cur = self.root;
        loop {
            match self.cmp_nodes(sid, cur) {
                Ordering::Equal => {
                    return Err(CfbError::Duplicated(self.dir[sid as usize].name()));
                }
                Ordering::Less => {
                    let next = self.left(cur);
                    if next == NIL {
                        self.set_left(cur, sid);
                        break;
                    }
                    cur = next;
                }
                Ordering::Greater => {
                    let next = self.right(cur);
                    if next == NIL {
                        self.set_right(cur, sid);
                        break;
                    }
                    cur = next;
                }
            }
        }

        self.set_parent(sid, cur);
        self.set_left(sid, NIL);
        self.set_right(sid, NIL);
        self.set_color(sid, StgColor::Red);
        self.insert_fixup(sid);
        Ok(())
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.color(self.parent_of(z)) == StgColor::Red {
            let p = self.parent_of(z);
            let g = self.parent_of(p);
            if g == NIL {
                break;
            }
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == StgColor::Red {
                    self.set_color(p, StgColor::Black);
                    self.set_color(uncle, StgColor::Black);
                    self.set_color(g, StgColor::Red);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p2 = self.parent_of(z);
                    let g2 = self.parent_of(p2);
                    self.set_color(p2, StgColor::Black);
                    self.set_color(g2, StgColor::Red);
                    self.rotate_right(g2);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == StgColor::Red {
                    self.set_color(p, StgColor::Black);
                    self.set_color(uncle, StgColor::Black);
                    self.set_color(g, StgColor::Red);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p2 = self.parent_of(z);
                    let g2 = self.parent_of(p2);
                    self.set_color(p2, StgColor::Black);
                    self.set_color(g2, StgColor::Red);
                    self.rotate_left(g2);
                }
            }
        }
        let root = self.root;
        self.set_color(root, StgColor::Black);
    }

    fn transplant(&mut self, u: u32, v: u32) {
        let p = self.parent_of(u);
        if u == self.root {
            self.root = v;
        } else if self.left(p) == u {
            self.set_left(p, v);
        } else {
            self.set_right(p, v);
        }
        self.set_parent(v, p);
    }

    /// Remove the entry whose name matches `name`.
    ///
    /// A node with two children is not unlinked itself: its in-order
    /// predecessor's payload is copied over the target record and the
    /// predecessor's slot is removed instead, so the caller must invalidate
    /// `freed_sid` rather than the SID it looked up.
    pub fn remove(&mut self, name: &[u16]) -> Result<RemovedNode> {
        let mut z = self.root;
        loop {
            if z == NIL {
                return Err(CfbError::ItemNotFound(String::from_utf16_lossy(name)));
            }
            match cmp_names(name, self.dir[z as usize].name_units()) {
                Ordering::Less => z = self.left(z),
                Ordering::Greater => z = self.right(z),
                Ordering::Equal => break,
            }
        }

        let mut y = z;
        let mut relocated = false;
        if self.left(z) != NIL && self.right(z) != NIL {
            // in-order predecessor: rightmost node of the left subtree
            y = self.left(z);
            while self.right(y) != NIL {
                y = self.right(y);
            }
            relocated = true;
        }

        let x = if self.left(y) != NIL {
            self.left(y)
        } else {
            self.right(y)
        };
        let y_color = self.color(y);

        self.transplant(y, x);

        if relocated {
            let payload = self.dir[y as usize].clone();
            self.dir[z as usize].copy_payload_from(&payload);
        }

        if y_color == StgColor::Black {
            self.delete_fixup(x);
        }

        Ok(RemovedNode {
            freed_sid: y,
            relocated,
        })
    }

    fn delete_fixup(&mut self, mut x: u32) {
        while x != self.root && self.color(x) == StgColor::Black {
            let p = self.parent_of(x);
            if p == NIL {
                break;
            }
            if x == self.left(p) {
                let mut w = self.right(p);
                if self.color(w) == StgColor::Red {
                    self.set_color(w, StgColor::Black);
                    self.set_color(p, StgColor::Red);
                    self.rotate_left(p);
                    w = self.right(p);
                }
                if w == NIL {
                    break;
                }
                if self.color(self.left(w)) == StgColor::Black
                    && self.color(self.right(w)) == StgColor::Black
                {
                    self.set_color(w, StgColor::Red);
                    x = p;
                } else {
                    if self.color(self.right(w)) == StgColor::Black {
                        let wl = self.left(w);
                        self.set_color(wl, StgColor::Black);
                        self.set_color(w, StgColor::Red);
                        self.rotate_right(w);
                        w = self.right(p);
                    }
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, StgColor::Black);
                    let wr = self.right(w);
                    self.set_color(wr, StgColor::Black);
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.left(p);
                if self.color(w) == StgColor::Red {
                    self.set_color(w, StgColor::Black);
                    self.set_color(p, StgColor::Red);
                    self.rotate_right(p);
                    w = self.left(p);
                }
                if w == NIL {
                    break;
                }
                if self.color(self.left(w)) == StgColor::Black
                    && self.color(self.right(w)) == StgColor::Black
                {
                    self.set_color(w, StgColor::Red);
                    x = p;
                } else {
                    if self.color(self.left(w)) == StgColor::Black {
                        let wr = self.right(w);
                        self.set_color(wr, StgColor::Black);
                        self.set_color(w, StgColor::Red);
                        self.rotate_left(w);
                        w = self.left(p);
                    }
                    let pc = self.color(p);
                    self.set_color(w, pc);
                    self.set_color(p, StgColor::Black);
                    let wl = self.left(w);
                    self.set_color(wl, StgColor::Black);
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.set_color(x, StgColor::Black);
    }
}

/// Look up a name in the tree rooted at `root` without building a parent
/// map. Steps are bounded by the directory length so a corrupted cyclic
/// tree cannot spin.
pub fn find(dir: &[DirectoryEntry], root: u32, name: &[u16]) -> Result<Option<u32>> {
    let mut cur = root;
    let mut steps = 0usize;
    while cur != NIL {
        if cur as usize >= dir.len() {
            return Err(CfbError::Corrupted(format!(
                "sibling SID {} out of range",
                cur
            )));
        }
        steps += 1;
        if steps > dir.len() {
            return Err(CfbError::Corrupted(
                "cyclic sibling reference in directory".into(),
            ));
        }
        let entry = &dir[cur as usize];
        match cmp_names(name, entry.name_units()) {
            Ordering::Less => cur = entry.left_sibling,
            Ordering::Greater => cur = entry.right_sibling,
            Ordering::Equal => return Ok(Some(cur)),
        }
    }
    Ok(None)
}

/// In-order traversal of the tree rooted at `root`.
///
/// With `strict` set, an out-of-range or invalid sibling SID is a
/// `Corrupted` error. Otherwise the offending subtree is skipped with a
/// warning. Cycles are fatal either way.
pub fn in_order(dir: &[DirectoryEntry], root: u32, strict: bool) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    let mut cur = root;
    let mut steps = 0usize;

    loop {
        while cur != NIL {
            if cur as usize >= dir.len() || dir[cur as usize].is_invalid() {
                if strict {
                    return Err(CfbError::Corrupted(format!(
                        "sibling SID {} is not a live entry",
                        cur
                    )));
                }
                tracing::warn!(sid = cur, "skipping invalid sibling subtree");
                cur = NIL;
                break;
            }
            steps += 1;
            if steps > dir.len() {
                return Err(CfbError::Corrupted(
                    "cyclic sibling reference in directory".into(),
                ));
            }
            stack.push(cur);
            cur = dir[cur as usize].left_sibling;
        }
        match stack.pop() {
            Some(node) => {
                out.push(node);
                cur = dir[node as usize].right_sibling;
            }
            None => break,
        }
    }
    Ok(out)
}

/// Verify the red-black invariants of the tree rooted at `root`: the root
/// is black, no red node has a red child, every root-to-nil path crosses
/// the same number of black nodes, and keys obey the name ordering.
/// Returns the black height.
pub fn validate(dir: &[DirectoryEntry], root: u32) -> Result<u32> {
    if root == NIL {
        return Ok(0);
    }
    if root as usize >= dir.len() {
        return Err(CfbError::Corrupted(format!(
            "child SID {} out of range",
            root
        )));
    }
    if dir[root as usize].color != StgColor::Black {
        return Err(CfbError::Corrupted("tree root is red".into()));
    }
    let mut seen = HashSet::new();
    check_subtree(dir, root, None, None, &mut seen)
}

fn check_subtree(
    dir: &[DirectoryEntry],
    sid: u32,
    min: Option<&[u16]>,
    max: Option<&[u16]>,
    seen: &mut HashSet<u32>,
) -> Result<u32> {
    if sid == NIL {
        return Ok(1);
    }
    if sid as usize >= dir.len() {
        return Err(CfbError::Corrupted(format!(
            "sibling SID {} out of range",
            sid
        )));
    }
    if !seen.insert(sid) {
        return Err(CfbError::Corrupted(
            "cyclic sibling reference in directory".into(),
        ));
    }

    let entry = &dir[sid as usize];
    let key = entry.name_units();

    if let Some(lo) = min {
        if cmp_names(key, lo) != Ordering::Greater {
            return Err(CfbError::Corrupted(format!(
                "entry '{}' violates the name ordering",
                entry.name()
            )));
        }
    }
    if let Some(hi) = max {
        if cmp_names(key, hi) != Ordering::Less {
            return Err(CfbError::Corrupted(format!(
                "entry '{}' violates the name ordering",
                entry.name()
            )));
        }
    }

    if entry.color == StgColor::Red {
        for link in [entry.left_sibling, entry.right_sibling] {
            if link != NIL
                && (link as usize) < dir.len()
                && dir[link as usize].color == StgColor::Red
            {
                return Err(CfbError::Corrupted(format!(
                    "red entry '{}' has a red child",
                    entry.name()
                )));
            }
        }
    }

    let left_height = check_subtree(dir, entry.left_sibling, min, Some(key), seen)?;
    let right_height = check_subtree(dir, entry.right_sibling, Some(key), max, seen)?;
    if left_height != right_height {
        return Err(CfbError::Corrupted(format!(
            "black height mismatch under '{}'",
            entry.name()
        )));
    }

    Ok(left_height + u32::from(entry.color == StgColor::Black))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StgType;

    fn entry(sid: u32, name: &str) -> DirectoryEntry {
        let mut e = DirectoryEntry::new(sid, StgType::Stream);
        e.set_name(name).unwrap();
        e
    }

    fn build(names: &[&str]) -> (Vec<DirectoryEntry>, u32) {
        let mut dir: Vec<DirectoryEntry> = names
            .iter()
            .enumerate()
            .map(|(i, n)| entry(i as u32, n))
            .collect();
        let mut root = NOSTREAM;
        for sid in 0..names.len() as u32 {
            let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
            tree.insert(sid).unwrap();
            root = tree.root();
        }
        (dir, root)
    }

    #[test]
    fn test_insert_orders_by_name_key() {
        // "zz" sorts before "aaa" (length first)
        let (dir, root) = build(&["aaa", "zz", "b", "cc", "dddd"]);
        let order = in_order(&dir, root, true).unwrap();
        let names: Vec<String> = order.iter().map(|&s| dir[s as usize].name()).collect();
        assert_eq!(names, vec!["b", "cc", "zz", "aaa", "dddd"]);
        validate(&dir, root).unwrap();
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut dir, root) = build(&["alpha", "beta"]);
        dir.push(entry(2, "ALPHA")); // equal under the case-folding key
        let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
        assert!(matches!(tree.insert(2), Err(CfbError::Duplicated(_))));
    }

    #[test]
    fn test_find() {
        let (dir, root) = build(&["one", "two", "three", "four"]);
        let key: Vec<u16> = "three".encode_utf16().collect();
        let sid = find(&dir, root, &key).unwrap().unwrap();
        assert_eq!(dir[sid as usize].name(), "three");

        let missing: Vec<u16> = "five".encode_utf16().collect();
        assert!(find(&dir, root, &missing).unwrap().is_none());
    }

    #[test]
    fn test_remove_leaf_and_validate() {
        let (mut dir, mut root) = build(&["a", "b", "c", "d", "e", "f", "g"]);
        for victim in ["a", "g", "d"] {
            let key: Vec<u16> = victim.encode_utf16().collect();
            let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
            tree.remove(&key).unwrap();
            root = tree.root();
            validate(&dir, root).unwrap();
            assert!(find(&dir, root, &key).unwrap().is_none());
        }
        let order = in_order(&dir, root, true).unwrap();
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_remove_two_children_relocates_predecessor() {
        let (mut dir, root) = build(&["d", "b", "f", "a", "c", "e", "g"]);
        let key: Vec<u16> = "d".encode_utf16().collect();
        let target = find(&dir, root, &key).unwrap().unwrap();
        assert_ne!(dir[target as usize].left_sibling, NOSTREAM);
        assert_ne!(dir[target as usize].right_sibling, NOSTREAM);

        let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
        let removed = tree.remove(&key).unwrap();
        let root = tree.root();

        assert!(removed.relocated);
        // the freed slot is the predecessor's, not the looked-up SID
        assert_ne!(removed.freed_sid, target);
        // the target slot now carries the predecessor's name ("c")
        assert_eq!(dir[target as usize].name(), "c");
        validate(&dir, root).unwrap();

        assert!(find(&dir, root, &key).unwrap().is_none());
        let c_key: Vec<u16> = "c".encode_utf16().collect();
        assert!(find(&dir, root, &c_key).unwrap().is_some());
    }

    #[test]
    fn test_remove_missing() {
        let (mut dir, root) = build(&["x"]);
        let key: Vec<u16> = "y".encode_utf16().collect();
        let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
        assert!(matches!(tree.remove(&key), Err(CfbError::ItemNotFound(_))));
    }

    #[test]
    fn test_remove_last_leaves_empty_tree() {
        let (mut dir, root) = build(&["only"]);
        let key: Vec<u16> = "only".encode_utf16().collect();
        let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
        tree.remove(&key).unwrap();
        assert_eq!(tree.root(), NOSTREAM);
    }

    #[test]
    fn test_invariants_over_many_inserts() {
        let names: Vec<String> = (0..200).map(|i| format!("entry{:03}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (dir, root) = build(&refs);
        let height = validate(&dir, root).unwrap();
        assert!(height >= 1);
        assert_eq!(in_order(&dir, root, true).unwrap().len(), 200);
    }

    #[test]
    fn test_interleaved_insert_remove_keeps_invariants() {
        let names: Vec<String> = (0..64).map(|i| format!("n{:02}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (mut dir, mut root) = build(&refs);

        // delete every third entry
        for i in (0..64).step_by(3) {
            let key: Vec<u16> = format!("n{:02}", i).encode_utf16().collect();
            let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
            tree.remove(&key).unwrap();
            root = tree.root();
            validate(&dir, root).unwrap();
        }

        // reinsert them under fresh SIDs
        for i in (0..64).step_by(3) {
            let sid = dir.len() as u32;
            dir.push(entry(sid, &format!("n{:02}", i)));
            let mut tree = SiblingTree::attach(&mut dir, root).unwrap();
            tree.insert(sid).unwrap();
            root = tree.root();
            validate(&dir, root).unwrap();
        }

        assert_eq!(in_order(&dir, root, true).unwrap().len(), 64);
    }

    #[test]
    fn test_cycle_detected() {
        let mut dir = vec![entry(0, "a"), entry(1, "b")];
        dir[0].left_sibling = 1;
        dir[1].left_sibling = 0;
        assert!(matches!(
            SiblingTree::attach(&mut dir, 0),
            Err(CfbError::Corrupted(_))
        ));
        assert!(matches!(in_order(&dir, 0, true), Err(CfbError::Corrupted(_))));
    }

    #[test]
    fn test_tolerant_walk_skips_bad_subtree() {
        let mut dir = vec![entry(0, "m"), entry(1, "a"), entry(2, "z")];
        dir[0].left_sibling = 1;
        dir[0].right_sibling = 2;
        dir[1].left_sibling = 77; // dangling reference
        let strict = in_order(&dir, 0, true);
        assert!(matches!(strict, Err(CfbError::Corrupted(_))));

        let tolerant = in_order(&dir, 0, false).unwrap();
        let names: Vec<String> = tolerant.iter().map(|&s| dir[s as usize].name()).collect();
        assert_eq!(names, vec!["a", "m", "z"]);
    }
}
