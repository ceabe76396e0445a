//! Local event coalescing
//!
//! A batch of raw filesystem events is collapsed into the smallest list of
//! events that, replayed in order against the tree as it was before the
//! batch, produces the tree as it is after the batch.
//!
//! ## Approach
//!
//! The batch is replayed against a virtual tree. Every item an event touches
//! becomes a node that remembers where it lived before the batch (its
//! origin, if it existed) and where it lives now (if it still exists). Items
//! below a touched directory are materialized lazily, with their origin
//! derived from the directory's origin, so a directory move carries its whole
//! subtree without any per-child events.
//!
//! Paths that were emptied by a move or a deletion are remembered as
//! vacancies. Stale child events that refer to a vacated location (for
//! instance the implied child moves some backends report after a directory
//! move) resolve against the vacancy and become no-ops.
//!
//! The net change of every node is then emitted:
//!
//! | origin | now      | moves | result                        |
//! |--------|----------|-------|-------------------------------|
//! | none   | none     |       | nothing                       |
//! | none   | `p`      |       | created `p`                   |
//! | `o`    | none     |       | deleted `o`                   |
//! | `o`    | `o`      | ≥ 1   | modified `o` (files only)     |
//! | `o`    | `p`      | 1     | moved `o → p`                 |
//! | `o`    | `p`      | ≥ 2   | deleted `o`, created `p`      |
//!
//! ## Output order
//!
//! Deletions come first and use pre-batch paths. Moves follow in an order
//! where every destination parent exists and every destination is free;
//! each source is rewritten through the moves emitted before it. Creations
//! follow, parents before children, then modifications, both using
//! post-batch paths.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::fs_event::{FsEvent, FsEventKind};

type NodeId = usize;

#[derive(Debug)]
struct Node {
    /// Location before the batch, `None` for items created in the batch
    origin: Option<PathBuf>,
    /// Location after the batch, `None` once deleted
    path: Option<PathBuf>,
    is_dir: bool,
    moves: u32,
    modified: bool,
    /// Sequence number of the last move
    moved_at: usize,
}

#[derive(Debug, Clone)]
enum Vacancy {
    Removed,
    MovedTo(PathBuf),
}

enum Resolved {
    Node(NodeId),
    Inside { ancestor: NodeId, at: PathBuf },
    Vacant { at: PathBuf, vacancy: Vacancy },
    Untouched,
}

#[derive(Debug, Clone)]
struct Move {
    src: PathBuf,
    dest: PathBuf,
    is_dir: bool,
    seq: usize,
}

#[derive(Debug, Clone)]
struct Change {
    path: PathBuf,
    is_dir: bool,
}

/// Collapses a batch of raw events into an equivalent minimal list
pub fn coalesce(events: Vec<FsEvent>) -> Vec<FsEvent> {
    if events.len() < 2 {
        return events;
    }

    let input = events.len();
    let mut tree = VirtualTree::default();
    for (seq, event) in events.into_iter().enumerate() {
        tree.apply(seq, event);
    }
    let output = tree.into_events();

    tracing::trace!(input, output = output.len(), "Coalesced local events");
    output
}

/// Replaces `from` with `to` at the start of `path`
pub(crate) fn rebase(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let rest = path.strip_prefix(from).ok()?;
    if rest.as_os_str().is_empty() {
        Some(to.to_path_buf())
    } else {
        Some(to.join(rest))
    }
}

fn is_strictly_under(path: &Path, ancestor: &Path) -> bool {
    path != ancestor && path.starts_with(ancestor)
}

fn depth(path: &Path) -> usize {
    path.components().count()
}

#[derive(Debug, Default)]
struct VirtualTree {
    nodes: Vec<Node>,
    current: HashMap<PathBuf, NodeId>,
    vacated: HashMap<PathBuf, Vacancy>,
}

impl VirtualTree {
    fn apply(&mut self, seq: usize, event: FsEvent) {
        let is_dir = event.is_directory;
        match event.kind {
            FsEventKind::Created => self.create(&event.src_path, is_dir),
            FsEventKind::Deleted => {
                if let Some((_, path)) = self.locate(&event.src_path, is_dir, false) {
                    self.kill(&path);
                }
            }
            FsEventKind::Modified => {
                if let Some((id, _)) = self.locate(&event.src_path, is_dir, false) {
                    self.nodes[id].modified = true;
                }
            }
            FsEventKind::Moved => match event.dest_path {
                Some(dest) => self.move_item(seq, &event.src_path, &dest, is_dir),
                None => self.create(&event.src_path, is_dir),
            },
        }
    }

    fn resolve(&self, path: &Path) -> Resolved {
        if let Some(&id) = self.current.get(path) {
            return Resolved::Node(id);
        }
        if let Some(vacancy) = self.vacated.get(path) {
            return Resolved::Vacant {
                at: path.to_path_buf(),
                vacancy: vacancy.clone(),
            };
        }
        for ancestor in path.ancestors().skip(1) {
            if let Some(&id) = self.current.get(ancestor) {
                return Resolved::Inside {
                    ancestor: id,
                    at: ancestor.to_path_buf(),
                };
            }
            if let Some(vacancy) = self.vacated.get(ancestor) {
                return Resolved::Vacant {
                    at: ancestor.to_path_buf(),
                    vacancy: vacancy.clone(),
                };
            }
        }
        Resolved::Untouched
    }

    /// Finds the node an event refers to, materializing it if needed
    ///
    /// With `follow_moves`, paths inside a moved-away directory are
    /// translated to the directory's new location.
    fn locate(&mut self, path: &Path, is_dir: bool, follow_moves: bool) -> Option<(NodeId, PathBuf)> {
        let mut path = path.to_path_buf();
        for _ in 0..=self.vacated.len() {
            match self.resolve(&path) {
                Resolved::Node(id) => return Some((id, path)),
                Resolved::Inside { ancestor, at } => {
                    let origin = match (&self.nodes[ancestor].origin, path.strip_prefix(&at)) {
                        (Some(origin), Ok(rest)) => Some(origin.join(rest)),
                        _ => None,
                    };
                    let id = self.insert(origin, path.clone(), is_dir);
                    return Some((id, path));
                }
                Resolved::Untouched => {
                    let id = self.insert(Some(path.clone()), path.clone(), is_dir);
                    return Some((id, path));
                }
                Resolved::Vacant {
                    at,
                    vacancy: Vacancy::MovedTo(to),
                } if follow_moves => {
                    path = rebase(&path, &at, &to)?;
                }
                Resolved::Vacant { .. } => return None,
            }
        }
        None
    }

    fn insert(&mut self, origin: Option<PathBuf>, path: PathBuf, is_dir: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            origin,
            path: Some(path.clone()),
            is_dir,
            moves: 0,
            modified: false,
            moved_at: 0,
        });
        self.current.insert(path, id);
        id
    }

    fn create(&mut self, path: &Path, is_dir: bool) {
        if self.current.contains_key(path) {
            self.kill(path);
        }
        self.clear_vacancies(path);
        self.insert(None, path.to_path_buf(), is_dir);
    }

    /// Removes the node at `path` and everything below it
    fn kill(&mut self, path: &Path) {
        let doomed: Vec<PathBuf> = self
            .current
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(id) = self.current.remove(&p) {
                self.nodes[id].path = None;
            }
        }
        self.clear_vacancies(path);
        self.vacated.insert(path.to_path_buf(), Vacancy::Removed);
    }

    fn clear_vacancies(&mut self, path: &Path) {
        self.vacated.retain(|p, _| !p.starts_with(path));
    }

    fn move_item(&mut self, seq: usize, src: &Path, dest: &Path, is_dir: bool) {
        let Some((id, src)) = self.locate(src, is_dir, true) else {
            // The source no longer exists; all that is known is the result.
            self.create(dest, is_dir);
            return;
        };
        if src == dest {
            return;
        }
        if self.current.contains_key(dest) {
            self.kill(dest);
        }
        self.clear_vacancies(dest);

        let relocated: Vec<(PathBuf, NodeId)> = self
            .current
            .iter()
            .filter(|(p, _)| p.starts_with(&src))
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        for (old, node) in relocated {
            self.current.remove(&old);
            if let Some(new) = rebase(&old, &src, dest) {
                self.nodes[node].path = Some(new.clone());
                self.current.insert(new, node);
            }
        }

        let stale: Vec<(PathBuf, Vacancy)> = self
            .vacated
            .iter()
            .filter(|(p, _)| is_strictly_under(p, &src))
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect();
        for (old, vacancy) in stale {
            self.vacated.remove(&old);
            if let Some(new) = rebase(&old, &src, dest) {
                self.vacated.insert(new, vacancy);
            }
        }
        for vacancy in self.vacated.values_mut() {
            if let Vacancy::MovedTo(to) = vacancy {
                if let Some(new) = rebase(to, &src, dest) {
                    *to = new;
                }
            }
        }
        self.vacated
            .insert(src.clone(), Vacancy::MovedTo(dest.to_path_buf()));

        let node = &mut self.nodes[id];
        node.moves += 1;
        node.moved_at = seq;
    }

    /// True if every ancestor of `path` is the item that lived there before
    fn ancestors_in_place(&self, path: &Path) -> bool {
        path.ancestors().skip(1).all(|ancestor| {
            match self.current.get(ancestor) {
                Some(&id) => self.nodes[id].origin.as_deref() == Some(ancestor),
                None => !self.vacated.contains_key(ancestor),
            }
        })
    }

    fn into_events(self) -> Vec<FsEvent> {
        let mut deleted: Vec<Change> = Vec::new();
        let mut created: Vec<Change> = Vec::new();
        let mut modified: Vec<Change> = Vec::new();
        let mut moves: Vec<Move> = Vec::new();

        for node in &self.nodes {
            let is_dir = node.is_dir;
            match (&node.origin, &node.path) {
                (None, None) => {}
                (None, Some(path)) => created.push(Change {
                    path: path.clone(),
                    is_dir,
                }),
                (Some(origin), None) => deleted.push(Change {
                    path: origin.clone(),
                    is_dir,
                }),
                (Some(origin), Some(path)) => {
                    if node.moves == 0 {
                        if node.modified && !is_dir {
                            modified.push(Change {
                                path: path.clone(),
                                is_dir,
                            });
                        }
                    } else if origin == path && self.ancestors_in_place(path) {
                        if !is_dir {
                            modified.push(Change {
                                path: path.clone(),
                                is_dir,
                            });
                        }
                    } else if node.moves == 1 {
                        moves.push(Move {
                            src: origin.clone(),
                            dest: path.clone(),
                            is_dir,
                            seq: node.moved_at,
                        });
                        if node.modified && !is_dir {
                            modified.push(Change {
                                path: path.clone(),
                                is_dir,
                            });
                        }
                    } else {
                        deleted.push(Change {
                            path: origin.clone(),
                            is_dir,
                        });
                        created.push(Change {
                            path: path.clone(),
                            is_dir,
                        });
                    }
                }
            }
        }

        split_orphaned_moves(&mut moves, &mut deleted, &mut created);
        merge_replacements(&moves, &mut deleted, &mut created, &mut modified);
        drop_nested(&mut deleted, &mut created, &mut modified);

        let (moves, unordered) = order_moves(moves);
        for m in unordered {
            deleted.push(Change {
                path: m.src,
                is_dir: m.is_dir,
            });
            created.push(Change {
                path: m.dest,
                is_dir: m.is_dir,
            });
        }
        created.sort_by_key(|c| depth(&c.path));

        let mut events = Vec::with_capacity(deleted.len() + moves.len() + created.len() + modified.len());
        events.extend(deleted.into_iter().map(|c| FsEvent::deleted(c.path, c.is_dir)));
        events.extend(moves.into_iter().map(|m| FsEvent::moved(m.src, m.dest, m.is_dir)));
        events.extend(created.into_iter().map(|c| FsEvent::created(c.path, c.is_dir)));
        events.extend(modified.into_iter().map(|c| FsEvent::modified(c.path, c.is_dir)));
        events
    }
}

/// Turns moves out of deleted folders or into created folders into a
/// deletion plus a creation
fn split_orphaned_moves(moves: &mut Vec<Move>, deleted: &mut Vec<Change>, created: &mut Vec<Change>) {
    loop {
        let (split, keep): (Vec<Move>, Vec<Move>) = std::mem::take(moves).into_iter().partition(|m| {
            deleted.iter().any(|d| is_strictly_under(&m.src, &d.path))
                || created.iter().any(|c| is_strictly_under(&m.dest, &c.path))
        });
        *moves = keep;
        if split.is_empty() {
            return;
        }
        for m in split {
            deleted.push(Change {
                path: m.src,
                is_dir: m.is_dir,
            });
            created.push(Change {
                path: m.dest,
                is_dir: m.is_dir,
            });
        }
    }
}

/// A file deleted and created at the same path with nothing happening to
/// its ancestors is a modification
fn merge_replacements(
    moves: &[Move],
    deleted: &mut Vec<Change>,
    created: &mut Vec<Change>,
    modified: &mut Vec<Change>,
) {
    let touched: Vec<&Path> = deleted
        .iter()
        .chain(created.iter())
        .map(|c| c.path.as_path())
        .chain(moves.iter().flat_map(|m| [m.src.as_path(), m.dest.as_path()]))
        .collect();
    let ancestor_touched = |path: &Path| touched.iter().any(|t| is_strictly_under(path, t));

    let replaced: HashSet<PathBuf> = deleted
        .iter()
        .filter(|d| !d.is_dir)
        .filter(|d| created.iter().any(|c| !c.is_dir && c.path == d.path))
        .filter(|d| !ancestor_touched(&d.path))
        .map(|d| d.path.clone())
        .collect();
    if replaced.is_empty() {
        return;
    }

    deleted.retain(|d| !replaced.contains(&d.path) || d.is_dir);
    created.retain(|c| !replaced.contains(&c.path) || c.is_dir);
    modified.retain(|m| !replaced.contains(&m.path));
    modified.extend(replaced.into_iter().map(|path| Change { path, is_dir: false }));
}

/// Removes events made redundant by an event on an ancestor
fn drop_nested(deleted: &mut Vec<Change>, created: &mut Vec<Change>, modified: &mut Vec<Change>) {
    let deleted_dirs: Vec<PathBuf> = deleted.iter().filter(|d| d.is_dir).map(|d| d.path.clone()).collect();
    deleted.retain(|d| !deleted_dirs.iter().any(|dir| is_strictly_under(&d.path, dir)));

    let created_dirs: Vec<PathBuf> = created.iter().filter(|c| c.is_dir).map(|c| c.path.clone()).collect();
    created.retain(|c| !created_dirs.iter().any(|dir| is_strictly_under(&c.path, dir)));
    modified.retain(|m| {
        !created.iter().any(|c| c.path == m.path)
            && !created_dirs.iter().any(|dir| is_strictly_under(&m.path, dir))
    });
}

/// Orders moves so that each can be replayed, returning any that cannot
///
/// A move must wait for the move that brings its destination parent into
/// place and for the move that frees its destination. Ties go to shallower
/// destinations, then to the earlier move. Sources are rewritten through
/// earlier moves of their ancestors.
fn order_moves(moves: Vec<Move>) -> (Vec<Move>, Vec<Move>) {
    let n = moves.len();
    let must_precede = |a: &Move, b: &Move| is_strictly_under(&b.dest, &a.dest) || b.dest == a.src;

    let mut waiting: Vec<usize> = (0..n)
        .map(|j| (0..n).filter(|&i| i != j && must_precede(&moves[i], &moves[j])).count())
        .collect();
    let mut done = vec![false; n];
    let mut ordered: Vec<Move> = Vec::with_capacity(n);

    while ordered.len() < n {
        let next = (0..n)
            .filter(|&i| !done[i] && waiting[i] == 0)
            .min_by_key(|&i| (depth(&moves[i].dest), moves[i].seq));
        let Some(i) = next else {
            break;
        };
        done[i] = true;
        for j in 0..n {
            if !done[j] && j != i && must_precede(&moves[i], &moves[j]) {
                waiting[j] -= 1;
            }
        }

        let mut m = moves[i].clone();
        for earlier in &ordered {
            if let Some(src) = rebase(&m.src, &earlier.src, &earlier.dest) {
                m.src = src;
            }
        }
        ordered.push(m);
    }

    let unordered = moves
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !done[*i])
        .map(|(_, m)| m)
        .collect();
    (ordered, unordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn p(path: &str) -> PathBuf {
        PathBuf::from(format!("/r{path}"))
    }

    fn created(path: &str, dir: bool) -> FsEvent {
        FsEvent::created(p(path), dir)
    }

    fn deleted(path: &str, dir: bool) -> FsEvent {
        FsEvent::deleted(p(path), dir)
    }

    fn modified(path: &str) -> FsEvent {
        FsEvent::modified(p(path), false)
    }

    fn moved(src: &str, dest: &str, dir: bool) -> FsEvent {
        FsEvent::moved(p(src), p(dest), dir)
    }

    /// Minimal tree model: path to is-directory
    type Snapshot = BTreeMap<PathBuf, bool>;

    fn snapshot(entries: &[(&str, bool)]) -> Snapshot {
        let mut snap = Snapshot::new();
        snap.insert(p(""), true);
        for (path, dir) in entries {
            snap.insert(p(path), *dir);
        }
        snap
    }

    /// Applies events to a tree model
    ///
    /// A created folder brings along whatever is below it on `disk`, the way
    /// the engine uploads a new folder with its contents.
    fn replay(mut snap: Snapshot, events: &[FsEvent], disk: &Snapshot) -> Result<Snapshot, String> {
        let parent_ok = |snap: &Snapshot, path: &Path| {
            path.parent().map_or(false, |parent| snap.get(parent) == Some(&true))
        };
        for ev in events {
            match ev.kind {
                FsEventKind::Created => {
                    if !parent_ok(&snap, &ev.src_path) {
                        return Err(format!("no parent for {ev:?}"));
                    }
                    snap.insert(ev.src_path.clone(), ev.is_directory);
                    if ev.is_directory {
                        for (k, v) in disk.iter().filter(|(k, _)| k.starts_with(&ev.src_path)) {
                            snap.insert(k.clone(), *v);
                        }
                    }
                }
                FsEventKind::Deleted => {
                    if snap.remove(&ev.src_path).is_none() {
                        return Err(format!("nothing to delete for {ev:?}"));
                    }
                    snap.retain(|k, _| !k.starts_with(&ev.src_path));
                }
                FsEventKind::Modified => {
                    if !snap.contains_key(&ev.src_path) {
                        return Err(format!("nothing to modify for {ev:?}"));
                    }
                }
                FsEventKind::Moved => {
                    let dest = ev.dest_path.clone().unwrap();
                    if !snap.contains_key(&ev.src_path) {
                        return Err(format!("nothing to move for {ev:?}"));
                    }
                    if !parent_ok(&snap, &dest) {
                        return Err(format!("no parent for {ev:?}"));
                    }
                    snap.retain(|k, _| !k.starts_with(&dest));
                    let subtree: Vec<(PathBuf, bool)> = snap
                        .iter()
                        .filter(|(k, _)| k.starts_with(&ev.src_path))
                        .map(|(k, v)| (k.clone(), *v))
                        .collect();
                    for (old, dir) in subtree {
                        snap.remove(&old);
                        snap.insert(rebase(&old, &ev.src_path, &dest).unwrap(), dir);
                    }
                }
            }
        }
        Ok(snap)
    }

    /// Replays raw and coalesced events and checks both end in the same tree
    fn assert_equivalent(before: &[(&str, bool)], raw: Vec<FsEvent>) -> Vec<FsEvent> {
        let old = snapshot(before);
        let expected = replay(old.clone(), &raw, &Snapshot::new()).expect("raw events must replay");
        let result = coalesce(raw);
        let actual = replay(old, &result, &expected).unwrap_or_else(|e| panic!("{e}; coalesced: {result:#?}"));
        assert_eq!(actual, expected, "coalesced: {result:#?}");
        result
    }

    /// Like `assert_equivalent` for raw batches that carry stale events
    fn assert_reaches(before: &[(&str, bool)], raw: Vec<FsEvent>, after: &[(&str, bool)]) -> Vec<FsEvent> {
        let expected = snapshot(after);
        let result = coalesce(raw);
        let actual = replay(snapshot(before), &result, &expected)
            .unwrap_or_else(|e| panic!("{e}; coalesced: {result:#?}"));
        assert_eq!(actual, expected, "coalesced: {result:#?}");
        result
    }

    mod rules {
        use super::*;

        #[test]
        fn test_created_then_deleted_cancels() {
            let result = assert_equivalent(&[], vec![created("/f", false), deleted("/f", false)]);
            assert!(result.is_empty());
        }

        #[test]
        fn test_deleted_then_created_is_modified() {
            let result = assert_equivalent(&[("/f", false)], vec![deleted("/f", false), created("/f", false)]);
            assert_eq!(result, vec![modified("/f")]);
        }

        #[test]
        fn test_created_then_modified_is_created() {
            let result = assert_equivalent(&[], vec![created("/f", false), modified("/f"), modified("/f")]);
            assert_eq!(result, vec![created("/f", false)]);
        }

        #[test]
        fn test_created_then_moved_is_created_at_destination() {
            let result = assert_equivalent(
                &[],
                vec![created("/f1", false), modified("/f1"), moved("/f1", "/f2", false)],
            );
            assert_eq!(result, vec![created("/f2", false)]);
        }

        #[test]
        fn test_moved_then_deleted_is_deleted_at_origin() {
            let result = assert_equivalent(
                &[("/a", false)],
                vec![moved("/a", "/b", false), deleted("/b", false)],
            );
            assert_eq!(result, vec![deleted("/a", false)]);
        }

        #[test]
        fn test_moved_back_is_modified() {
            let result = assert_equivalent(
                &[("/f1", false)],
                vec![moved("/f1", "/f2", false), moved("/f2", "/f1", false)],
            );
            assert_eq!(result, vec![modified("/f1")]);
        }

        #[test]
        fn test_folder_moved_back_is_nothing() {
            let result = assert_equivalent(
                &[("/d", true), ("/d/x", false)],
                vec![moved("/d", "/e", true), moved("/e", "/d", true)],
            );
            assert!(result.is_empty());
        }

        #[test]
        fn test_moved_twice_is_deleted_and_created() {
            let result = assert_equivalent(
                &[("/a", false)],
                vec![moved("/a", "/b", false), moved("/b", "/c", false)],
            );
            assert_eq!(result, vec![deleted("/a", false), created("/c", false)]);
        }

        #[test]
        fn test_single_move_with_edit() {
            let result = assert_equivalent(
                &[("/a", false)],
                vec![modified("/a"), moved("/a", "/b", false)],
            );
            assert_eq!(result, vec![moved("/a", "/b", false), modified("/b")]);
        }
    }

    mod folders {
        use super::*;

        #[test]
        fn test_folder_deletion_subsumes_nested_events() {
            let result = assert_equivalent(
                &[("/d", true), ("/d/f", false), ("/d/sub", true), ("/d/sub/g", false)],
                vec![
                    modified("/d/f"),
                    deleted("/d/f", false),
                    deleted("/d/sub/g", false),
                    deleted("/d/sub", true),
                    deleted("/d", true),
                ],
            );
            assert_eq!(result, vec![deleted("/d", true)]);
        }

        #[test]
        fn test_implied_child_moves_are_ignored() {
            let result = assert_reaches(
                &[("/d", true), ("/d/f", false), ("/d/s", true), ("/d/s/g", false)],
                vec![
                    moved("/d", "/e", true),
                    moved("/d/f", "/e/f", false),
                    moved("/d/s", "/e/s", true),
                    moved("/d/s/g", "/e/s/g", false),
                ],
                &[("/e", true), ("/e/f", false), ("/e/s", true), ("/e/s/g", false)],
            );
            assert_eq!(result, vec![moved("/d", "/e", true)]);
        }

        #[test]
        fn test_child_renamed_before_folder_move() {
            let result = assert_equivalent(
                &[("/d", true), ("/d/x", false)],
                vec![moved("/d/x", "/d/y", false), moved("/d", "/e", true)],
            );
            assert_eq!(
                result,
                vec![moved("/d", "/e", true), moved("/e/x", "/e/y", false)]
            );
        }

        #[test]
        fn test_file_moved_out_of_deleted_folder_survives() {
            let result = assert_equivalent(
                &[("/d", true), ("/d/keep", false), ("/d/drop", false)],
                vec![moved("/d/keep", "/keep", false), deleted("/d/drop", false), deleted("/d", true)],
            );
            assert_eq!(
                result,
                vec![deleted("/d", true), created("/keep", false)]
            );
        }

        #[test]
        fn test_move_into_created_folder_becomes_creation() {
            let result = assert_equivalent(
                &[("/f", false)],
                vec![created("/n", true), moved("/f", "/n/f", false), created("/n/g", false)],
            );
            assert_eq!(result, vec![deleted("/f", false), created("/n", true)]);
        }

        #[test]
        fn test_created_folder_subsumes_children() {
            let result = assert_equivalent(
                &[],
                vec![
                    created("/n", true),
                    created("/n/a", false),
                    modified("/n/a"),
                    created("/n/s", true),
                    created("/n/s/b", false),
                ],
            );
            assert_eq!(result, vec![created("/n", true)]);
        }

        #[test]
        fn test_edit_inside_moved_folder_uses_new_path() {
            let result = assert_equivalent(
                &[("/d", true), ("/d/f", false)],
                vec![moved("/d", "/e", true), modified("/e/f")],
            );
            assert_eq!(result, vec![moved("/d", "/e", true), modified("/e/f")]);
        }
    }

    mod type_changes {
        use super::*;

        #[test]
        fn test_file_replaced_by_folder_is_preserved() {
            let result = assert_equivalent(
                &[("/a", false)],
                vec![deleted("/a", false), created("/a", true)],
            );
            assert_eq!(result, vec![deleted("/a", false), created("/a", true)]);
        }

        #[test]
        fn test_folder_replaced_by_file_is_preserved() {
            let result = assert_equivalent(
                &[("/a", true), ("/a/x", false)],
                vec![deleted("/a/x", false), deleted("/a", true), created("/a", false)],
            );
            assert_eq!(result, vec![deleted("/a", true), created("/a", false)]);
        }

        #[test]
        fn test_type_change_through_rename() {
            let result = assert_equivalent(
                &[("/a", false)],
                vec![moved("/a", "/tmp", false), created("/a", true), deleted("/tmp", false)],
            );
            assert_eq!(result, vec![deleted("/a", false), created("/a", true)]);
        }
    }

    /// Every short raw sequence on `/a`, with moves to and from `/b`
    mod single_path {
        use super::*;

        #[derive(Debug, Clone, Copy)]
        enum Step {
            Create,
            Delete,
            Modify,
            MoveOut,
            MoveIn,
        }

        const STEPS: [Step; 5] = [Step::Create, Step::Delete, Step::Modify, Step::MoveOut, Step::MoveIn];

        /// Item kind at `/a` and `/b`; `Some(true)` is a folder
        type State = (Option<bool>, Option<bool>);

        /// The event for `step` if the OS could report it in `state`
        fn next(step: Step, dir: bool, (a, b): State) -> Option<(FsEvent, State)> {
            let here = Some(dir);
            match step {
                Step::Create if a.is_none() => Some((created("/a", dir), (here, b))),
                Step::Delete if a == here => Some((deleted("/a", dir), (None, b))),
                Step::Modify if a == here => Some((FsEvent::modified(p("/a"), dir), (a, b))),
                Step::MoveOut if a == here && b.is_none() => Some((moved("/a", "/b", dir), (None, here))),
                Step::MoveIn if b == here && a.is_none() => Some((moved("/b", "/a", dir), (here, None))),
                _ => None,
            }
        }

        fn check_all(before: &[(&str, bool)], state: State, events: &mut Vec<FsEvent>, left: usize) -> usize {
            let mut checked = 0;
            if !events.is_empty() {
                assert_equivalent(before, events.clone());
                checked += 1;
            }
            if left == 0 {
                return checked;
            }
            for step in STEPS {
                for dir in [false, true] {
                    if let Some((event, state)) = next(step, dir, state) {
                        events.push(event);
                        checked += check_all(before, state, events, left - 1);
                        events.pop();
                    }
                }
            }
            checked
        }

        #[test]
        fn test_all_sequences_up_to_four_events() {
            let kinds = [None, Some(false), Some(true)];
            let mut checked = 0;
            for a in kinds {
                for b in kinds {
                    let before: Vec<(&str, bool)> = [("/a", a), ("/b", b)]
                        .into_iter()
                        .filter_map(|(path, kind)| kind.map(|dir| (path, dir)))
                        .collect();
                    checked += check_all(&before, (a, b), &mut Vec::new(), 4);
                }
            }
            assert_eq!(checked, 582);
        }
    }

    mod ordering {
        use super::*;

        #[test]
        fn test_swap_through_temporary_name() {
            assert_equivalent(
                &[("/a", false), ("/b", false)],
                vec![moved("/a", "/t", false), moved("/b", "/a", false), moved("/t", "/b", false)],
            );
        }

        #[test]
        fn test_chain_of_renames_frees_destinations_first() {
            let result = assert_equivalent(
                &[("/a", false), ("/b", false)],
                vec![moved("/b", "/c", false), moved("/a", "/b", false)],
            );
            assert_eq!(
                result,
                vec![moved("/b", "/c", false), moved("/a", "/b", false)]
            );
        }

        #[test]
        fn test_deeper_destination_freed_by_shallower_move() {
            assert_equivalent(
                &[("/a", true), ("/a/x", false), ("/c", true), ("/c/z", false)],
                vec![moved("/a/x", "/q", false), moved("/c/z", "/a/x", false)],
            );
        }

        #[test]
        fn test_overwriting_move_deletes_target() {
            let result = assert_equivalent(
                &[("/a", false), ("/b", false)],
                vec![modified("/b"), moved("/a", "/b", false)],
            );
            assert_eq!(result, vec![deleted("/b", false), moved("/a", "/b", false)]);
        }

        #[test]
        fn test_mixed_batch_replays() {
            assert_equivalent(
                &[
                    ("/docs", true),
                    ("/docs/a.txt", false),
                    ("/docs/b.txt", false),
                    ("/pics", true),
                    ("/pics/1.jpg", false),
                ],
                vec![
                    created("/new", true),
                    moved("/docs/a.txt", "/new/a.txt", false),
                    moved("/pics", "/docs/pics", true),
                    modified("/docs/pics/1.jpg"),
                    deleted("/docs/b.txt", false),
                    created("/docs/b.txt", false),
                    moved("/docs", "/archive", true),
                ],
            );
        }
    }

    #[test]
    fn test_single_event_passes_through() {
        let events = vec![modified("/x")];
        assert_eq!(coalesce(events.clone()), events);
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase(Path::new("/a/b/c"), Path::new("/a"), Path::new("/x")), Some(PathBuf::from("/x/b/c")));
        assert_eq!(rebase(Path::new("/a"), Path::new("/a"), Path::new("/x")), Some(PathBuf::from("/x")));
        assert_eq!(rebase(Path::new("/ab"), Path::new("/a"), Path::new("/x")), None);
    }
}
