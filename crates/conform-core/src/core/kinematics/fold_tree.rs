use std::fmt;

/// Incoming edge of a non-root residue in the fold tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    /// Chemically continuous polymer bond from the sequence neighbour `from` (`pos ± 1`).
    Polymer { from: usize },
    /// Rigid-body transform from `from`; atoms default to each residue's root atom.
    Jump {
        from: usize,
        label: usize,
        upstream_atom: Option<String>,
        downstream_atom: Option<String>,
    },
    /// Non-polymer chemical bond (e.g. a branch) between two named atoms.
    Chemical {
        from: usize,
        upstream_atom: String,
        downstream_atom: String,
    },
}

impl Link {
    pub fn jump(from: usize) -> Self {
        Link::Jump {
            from,
            label: 0,
            upstream_atom: None,
            downstream_atom: None,
        }
    }

    pub fn from(&self) -> usize {
        match self {
            Link::Polymer { from } | Link::Jump { from, .. } | Link::Chemical { from, .. } => *from,
        }
    }

    fn set_from(&mut self, new: usize) {
        match self {
            Link::Polymer { from } | Link::Jump { from, .. } | Link::Chemical { from, .. } => {
                *from = new
            }
        }
    }

    pub fn is_polymer(&self) -> bool {
        matches!(self, Link::Polymer { .. })
    }

    pub fn is_jump(&self) -> bool {
        matches!(self, Link::Jump { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Peptide,
    Jump(usize),
    Chemical,
}

/// Compressed edge view of the tree: polymer runs plus single jump/chemical edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub start: usize,
    pub stop: usize,
    pub kind: EdgeKind,
}

/// Polymer link that crossed an insertion point before the slot was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Span {
    None,
    /// `seqpos - 1` was the parent of the old `seqpos`.
    Forward,
    /// The old `seqpos` was the parent of `seqpos - 1`.
    Backward,
}

/// Residue-level topology: which residues are connected by polymer bonds, rigid-body jumps or
/// chemical branch bonds, and where the chain is cut.
///
/// Each non-root residue has exactly one incoming [`Link`]. Positions are 1-based. Jump labels are
/// kept contiguous (`1..=num_jumps`) in order of the downstream residue.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FoldTree {
    root: usize,
    links: Vec<Option<Link>>,
}

impl FoldTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single forward polymer run `1 -> n` rooted at residue 1.
    pub fn simple(n: usize) -> Self {
        let links = (1..=n)
            .map(|i| (i > 1).then_some(Link::Polymer { from: i - 1 }))
            .collect();
        Self {
            root: if n > 0 { 1 } else { 0 },
            links,
        }
    }

    pub fn residue_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn root(&self) -> usize {
        self.root
    }

    fn check_pos(&self, pos: usize) {
        assert!(
            (1..=self.links.len()).contains(&pos),
            "residue {} out of range for fold tree of {} residues",
            pos,
            self.links.len()
        );
    }

    pub fn link(&self, pos: usize) -> Option<&Link> {
        self.check_pos(pos);
        self.links[pos - 1].as_ref()
    }

    pub fn parent(&self, pos: usize) -> Option<usize> {
        self.link(pos).map(Link::from)
    }

    /// Residues whose incoming link starts at `pos`, in ascending order.
    pub fn children(&self, pos: usize) -> Vec<usize> {
        (1..=self.links.len())
            .filter(|&i| self.links[i - 1].as_ref().is_some_and(|l| l.from() == pos))
            .collect()
    }

    /// True when `a` and `b` are sequence neighbours joined by a polymer link.
    pub fn is_polymer_linked(&self, a: usize, b: usize) -> bool {
        if a.abs_diff(b) != 1 {
            return false;
        }
        matches!(self.link(b), Some(Link::Polymer { from }) if *from == a)
            || matches!(self.link(a), Some(Link::Polymer { from }) if *from == b)
    }

    /// A cut point is a position not polymer-linked to its successor; the last residue always is.
    pub fn is_cutpoint(&self, pos: usize) -> bool {
        self.check_pos(pos);
        pos == self.links.len() || !self.is_polymer_linked(pos, pos + 1)
    }

    pub fn cutpoints(&self) -> Vec<usize> {
        (1..=self.links.len())
            .filter(|&p| self.is_cutpoint(p))
            .collect()
    }

    pub fn num_jumps(&self) -> usize {
        self.links.iter().flatten().filter(|l| l.is_jump()).count()
    }

    /// `(upstream, downstream)` residues of jump `label`.
    pub fn jump_edge(&self, label: usize) -> Option<(usize, usize)> {
        self.links.iter().enumerate().find_map(|(i, l)| match l {
            Some(Link::Jump { from, label: l, .. }) if *l == label => Some((*from, i + 1)),
            _ => None,
        })
    }

    /// True if `pos` starts or ends a jump.
    pub fn is_jump_point(&self, pos: usize) -> bool {
        matches!(self.link(pos), Some(Link::Jump { .. }))
            || self
                .links
                .iter()
                .flatten()
                .any(|l| l.is_jump() && l.from() == pos)
    }

    /// Root, jump endpoints and chemical-edge endpoints: residues that cannot be removed
    /// without re-rooting part of the tree.
    pub fn is_anchor(&self, pos: usize) -> bool {
        pos == self.root
            || self.is_jump_point(pos)
            || matches!(self.link(pos), Some(Link::Chemical { .. }))
            || self
                .links
                .iter()
                .flatten()
                .any(|l| matches!(l, Link::Chemical { from, .. } if *from == pos))
    }

    /// Appends a residue with the given incoming link. The first residue becomes the root and
    /// must be appended with `None`.
    pub fn append_residue(&mut self, link: Option<Link>) {
        if self.links.is_empty() {
            assert!(link.is_none(), "first residue of a fold tree must be the root");
            self.root = 1;
            self.links.push(None);
            return;
        }
        let link = link.expect("non-root residue needs an incoming link");
        let new_pos = self.links.len() + 1;
        assert!(
            (1..new_pos).contains(&link.from()),
            "link source {} out of range",
            link.from()
        );
        if let Link::Polymer { from } = link {
            assert_eq!(from, new_pos - 1, "polymer link must come from a sequence neighbour");
        }
        self.links.push(Some(link));
        self.relabel_jumps();
    }

    /// Inserts a residue at `seqpos` polymer-bonded to its lower neighbour `seqpos - 1`.
    ///
    /// With `join_upper`, a polymer link that used to cross the insertion point is threaded
    /// through the new residue; otherwise the far side re-attaches through a jump.
    pub fn insert_polymer_residue_after(&mut self, seqpos: usize, join_upper: bool) {
        assert!(seqpos > 1, "insertion after a residue needs a lower neighbour");
        let span = self.open_slot(seqpos, 1);
        match span {
            Span::Forward if join_upper => {
                self.set_link(seqpos, Link::Polymer { from: seqpos - 1 });
                self.set_link(seqpos + 1, Link::Polymer { from: seqpos });
            }
            Span::Backward if join_upper => {
                self.set_link(seqpos, Link::Polymer { from: seqpos + 1 });
                self.set_link(seqpos - 1, Link::Polymer { from: seqpos });
            }
            Span::Forward => {
                self.set_link(seqpos, Link::Polymer { from: seqpos - 1 });
                self.set_link(seqpos + 1, Link::jump(seqpos - 1));
            }
            Span::Backward => {
                self.set_link(seqpos, Link::Polymer { from: seqpos - 1 });
                self.set_link(seqpos - 1, Link::jump(seqpos + 1));
            }
            Span::None => self.set_link(seqpos, Link::Polymer { from: seqpos - 1 }),
        }
        self.relabel_jumps();
    }

    /// Inserts a residue at `seqpos` polymer-bonded to its upper neighbour (`seqpos + 1` after
    /// insertion). `join_lower` threads a crossing polymer link through the new residue.
    pub fn insert_polymer_residue_before(&mut self, seqpos: usize, join_lower: bool) {
        assert!(
            seqpos <= self.links.len(),
            "insertion before a residue needs an upper neighbour"
        );
        let span = self.open_slot(seqpos, 1);
        match span {
            Span::Forward if join_lower => {
                self.set_link(seqpos, Link::Polymer { from: seqpos - 1 });
                self.set_link(seqpos + 1, Link::Polymer { from: seqpos });
            }
            Span::Backward if join_lower => {
                self.set_link(seqpos, Link::Polymer { from: seqpos + 1 });
                self.set_link(seqpos - 1, Link::Polymer { from: seqpos });
            }
            Span::Forward => {
                self.set_link(seqpos, Link::Polymer { from: seqpos + 1 });
                self.set_link(seqpos + 1, Link::jump(seqpos - 1));
            }
            Span::Backward => {
                self.set_link(seqpos, Link::Polymer { from: seqpos + 1 });
                self.set_link(seqpos - 1, Link::jump(seqpos + 1));
            }
            Span::None => self.set_link(seqpos, Link::Polymer { from: seqpos + 1 }),
        }
        self.relabel_jumps();
    }

    /// Inserts a residue at `seqpos` attached to `anchor` (post-insertion numbering) by `link`,
    /// which must be a jump or chemical link whose `from` is the anchor. A polymer link crossing
    /// the insertion point is replaced by a jump.
    pub fn insert_residue_by_link(&mut self, seqpos: usize, link: Link) {
        assert!(!link.is_polymer(), "use the polymer insertion primitives");
        assert_ne!(link.from(), seqpos, "a residue cannot anchor itself");
        let span = self.open_slot(seqpos, 1);
        self.patch_span(span, seqpos, 1);
        self.set_link(seqpos, link);
        self.relabel_jumps();
    }

    /// Splices `donor` in at `seqpos`, attaching its root to `anchor` (post-insertion numbering)
    /// through a new jump.
    pub fn insert_fold_tree_by_jump(
        &mut self,
        donor: &FoldTree,
        seqpos: usize,
        anchor: usize,
        upstream_atom: Option<String>,
        downstream_atom: Option<String>,
    ) {
        let count = donor.residue_count();
        if count == 0 {
            return;
        }
        if self.links.is_empty() {
            *self = donor.clone();
            return;
        }
        assert!(
            !(seqpos..seqpos + count).contains(&anchor),
            "splice anchor {} lies inside the inserted block",
            anchor
        );
        let span = self.open_slot(seqpos, count);
        self.patch_span(span, seqpos, count);
        let offset = seqpos - 1;
        for (i, link) in donor.links.iter().enumerate() {
            let pos = seqpos + i;
            let shifted = match link {
                Some(l) => {
                    let mut l = l.clone();
                    l.set_from(l.from() + offset);
                    l
                }
                None => Link::Jump {
                    from: anchor,
                    label: 0,
                    upstream_atom: upstream_atom.clone(),
                    downstream_atom: downstream_atom.clone(),
                },
            };
            self.set_link(pos, shifted);
        }
        self.relabel_jumps();
    }

    /// Removes a residue that is polymer-linked on its incoming side and anchors nothing but
    /// polymer children.
    pub fn delete_polymer_residue(&mut self, seqpos: usize) {
        self.check_pos(seqpos);
        assert!(
            !self.is_anchor(seqpos),
            "residue {} is a jump point or tree root; use the slow delete",
            seqpos
        );
        let parent = self
            .parent(seqpos)
            .expect("non-root residue must have a parent");
        for child in self.children(seqpos) {
            self.set_link(child, Link::Polymer { from: parent });
        }
        self.remove_slot(seqpos);
    }

    /// Removes any residue, re-rooting or re-anchoring its children around the gap.
    pub fn delete_seqpos_slow(&mut self, seqpos: usize) {
        self.check_pos(seqpos);
        if self.links.len() == 1 {
            *self = FoldTree::new();
            return;
        }
        let children = self.children(seqpos);
        let new_anchor = match self.parent(seqpos) {
            Some(parent) => parent,
            None => {
                let new_root = children
                    .iter()
                    .copied()
                    .find(|&c| self.links[c - 1].as_ref().is_some_and(Link::is_polymer))
                    .or_else(|| children.first().copied())
                    .expect("root of a multi-residue tree must have children");
                self.links[new_root - 1] = None;
                self.root = new_root;
                new_root
            }
        };
        for child in children {
            if child == new_anchor {
                continue;
            }
            let old = self.links[child - 1].take();
            let adjacent = new_anchor.abs_diff(child) == 2
                && (new_anchor.min(child) + 1) == seqpos
                && old.as_ref().is_some_and(Link::is_polymer);
            let relinked = if adjacent {
                Link::Polymer { from: new_anchor }
            } else {
                let downstream_atom = match old {
                    Some(Link::Jump { downstream_atom, .. }) => downstream_atom,
                    Some(Link::Chemical { downstream_atom, .. }) => Some(downstream_atom),
                    _ => None,
                };
                Link::Jump {
                    from: new_anchor,
                    label: 0,
                    upstream_atom: None,
                    downstream_atom,
                }
            };
            self.links[child - 1] = Some(relinked);
        }
        self.remove_slot(seqpos);
    }

    pub fn delete_range_slow(&mut self, start: usize, end: usize) {
        assert!(start <= end, "empty deletion range {}..={}", start, end);
        for _ in start..=end {
            self.delete_seqpos_slow(start);
        }
    }

    pub fn replace(&mut self, other: FoldTree) {
        *self = other;
    }

    /// Re-roots the tree at `new_root` by reversing the links on the path to the old root.
    pub fn reorder(&mut self, new_root: usize) {
        self.check_pos(new_root);
        let mut path = vec![new_root];
        while let Some(parent) = self.parent(*path.last().unwrap_or(&new_root)) {
            path.push(parent);
        }
        for pair in path.windows(2).rev() {
            let (child, parent) = (pair[0], pair[1]);
            let link = self.links[child - 1].take().expect("path link");
            let reversed = match link {
                Link::Polymer { .. } => Link::Polymer { from: child },
                Link::Jump {
                    label,
                    upstream_atom,
                    downstream_atom,
                    ..
                } => Link::Jump {
                    from: child,
                    label,
                    upstream_atom: downstream_atom,
                    downstream_atom: upstream_atom,
                },
                Link::Chemical {
                    upstream_atom,
                    downstream_atom,
                    ..
                } => Link::Chemical {
                    from: child,
                    upstream_atom: downstream_atom,
                    downstream_atom: upstream_atom,
                },
            };
            self.links[parent - 1] = Some(reversed);
        }
        self.root = new_root;
        self.relabel_jumps();
    }

    /// Every residue reached exactly once from the root, polymer links between neighbours only.
    pub fn check_topology(&self) -> bool {
        let n = self.links.len();
        if n == 0 {
            return self.root == 0;
        }
        if !(1..=n).contains(&self.root) || self.links[self.root - 1].is_some() {
            return false;
        }
        for (i, link) in self.links.iter().enumerate() {
            let pos = i + 1;
            match link {
                None if pos != self.root => return false,
                Some(l) => {
                    let from = l.from();
                    if !(1..=n).contains(&from) || from == pos {
                        return false;
                    }
                    if l.is_polymer() && from.abs_diff(pos) != 1 {
                        return false;
                    }
                }
                None => {}
            }
            let mut cursor = pos;
            let mut steps = 0;
            while let Some(l) = &self.links[cursor - 1] {
                cursor = l.from();
                steps += 1;
                if steps > n {
                    return false;
                }
            }
            if cursor != self.root {
                return false;
            }
        }
        true
    }

    /// Compressed edges: maximal polymer runs plus one edge per jump or chemical link.
    pub fn edges(&self) -> Vec<Edge> {
        let n = self.links.len();
        let polymer_from = |pos: usize, from: usize| {
            (1..=n).contains(&pos)
                && matches!(&self.links[pos - 1], Some(Link::Polymer { from: f }) if *f == from)
        };
        let mut edges = Vec::new();
        for u in 1..=n {
            for forward in [true, false] {
                let next = |p: usize| if forward { p + 1 } else { p.wrapping_sub(1) };
                let prev = |p: usize| if forward { p.wrapping_sub(1) } else { p + 1 };
                // Only start at the head of a run.
                if !polymer_from(next(u), u) || polymer_from(u, prev(u)) {
                    continue;
                }
                let mut end = next(u);
                while polymer_from(next(end), end) {
                    end = next(end);
                }
                edges.push(Edge {
                    start: u,
                    stop: end,
                    kind: EdgeKind::Peptide,
                });
            }
        }
        for (i, link) in self.links.iter().enumerate() {
            match link {
                Some(Link::Jump { from, label, .. }) => edges.push(Edge {
                    start: *from,
                    stop: i + 1,
                    kind: EdgeKind::Jump(*label),
                }),
                Some(Link::Chemical { from, .. }) => edges.push(Edge {
                    start: *from,
                    stop: i + 1,
                    kind: EdgeKind::Chemical,
                }),
                _ => {}
            }
        }
        edges.sort_by_key(|e| (e.start, e.stop));
        edges
    }

    fn set_link(&mut self, pos: usize, link: Link) {
        self.links[pos - 1] = Some(link);
    }

    /// Opens `count` empty slots at `seqpos`, shifting later residues up, and reports the polymer
    /// link that used to cross the insertion point.
    fn open_slot(&mut self, seqpos: usize, count: usize) -> Span {
        let n = self.links.len();
        assert!(
            (1..=n + 1).contains(&seqpos),
            "insertion point {} out of range for {} residues",
            seqpos,
            n
        );
        let span = if seqpos > 1 && seqpos <= n {
            match (&self.links[seqpos - 1], &self.links[seqpos - 2]) {
                (Some(Link::Polymer { from }), _) if *from == seqpos - 1 => Span::Forward,
                (_, Some(Link::Polymer { from })) if *from == seqpos => Span::Backward,
                _ => Span::None,
            }
        } else {
            Span::None
        };

        let shift = |p: usize| if p >= seqpos { p + count } else { p };
        for link in self.links.iter_mut().flatten() {
            let from = link.from();
            link.set_from(shift(from));
        }
        self.root = shift(self.root);
        let tail = self.links.split_off(seqpos - 1);
        self.links.extend(std::iter::repeat_n(None, count));
        self.links.extend(tail);
        span
    }

    /// Re-attaches the far side of a polymer link broken by a block insertion through a jump.
    fn patch_span(&mut self, span: Span, seqpos: usize, count: usize) {
        match span {
            Span::Forward => self.set_link(seqpos + count, Link::jump(seqpos - 1)),
            Span::Backward => self.set_link(seqpos - 1, Link::jump(seqpos + count)),
            Span::None => {}
        }
    }

    fn remove_slot(&mut self, seqpos: usize) {
        self.links.remove(seqpos - 1);
        let shift = |p: usize| if p > seqpos { p - 1 } else { p };
        for link in self.links.iter_mut().flatten() {
            let from = link.from();
            debug_assert_ne!(from, seqpos, "dangling link into deleted residue");
            link.set_from(shift(from));
        }
        self.root = shift(self.root);
        self.relabel_jumps();
    }

    fn relabel_jumps(&mut self) {
        let mut next = 1;
        for link in self.links.iter_mut().flatten() {
            if let Link::Jump { label, .. } = link {
                *label = next;
                next += 1;
            }
        }
    }
}

impl fmt::Display for FoldTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FOLD_TREE")?;
        for edge in self.edges() {
            let code = match edge.kind {
                EdgeKind::Peptide => -1,
                EdgeKind::Chemical => -2,
                EdgeKind::Jump(label) => label as i64,
            };
            write!(f, " EDGE {} {} {}", edge.start, edge.stop, code)?;
        }
        Ok(())
    }
}
