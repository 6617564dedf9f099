//! Mirror list diffing used by hot reload.

use std::cmp::Ordering;

use crate::config::MirrorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorDiffOp {
    Add,
    Delete,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorConfigDiff {
    pub op: MirrorDiffOp,
    pub config: MirrorConfig,
}

/// Compute the operations that turn `old` into `new`, matched by mirror name.
///
/// Both lists are sorted by name and walked in parallel, so the result is
/// ordered by name. `Modify` carries the new config.
pub fn diff_mirror_config(old: &[MirrorConfig], new: &[MirrorConfig]) -> Vec<MirrorConfigDiff> {
    let mut old_sorted: Vec<&MirrorConfig> = old.iter().collect();
    let mut new_sorted: Vec<&MirrorConfig> = new.iter().collect();
    old_sorted.sort_by(|a, b| a.name.cmp(&b.name));
    new_sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old_sorted.len() && j < new_sorted.len() {
        let (o, n) = (old_sorted[i], new_sorted[j]);
        match o.name.cmp(&n.name) {
            Ordering::Less => {
                ops.push(MirrorConfigDiff {
                    op: MirrorDiffOp::Delete,
                    config: o.clone(),
                });
                i += 1;
            }
            Ordering::Greater => {
                ops.push(MirrorConfigDiff {
                    op: MirrorDiffOp::Add,
                    config: n.clone(),
                });
                j += 1;
            }
            Ordering::Equal => {
                if o != n {
                    ops.push(MirrorConfigDiff {
                        op: MirrorDiffOp::Modify,
                        config: n.clone(),
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    ops.extend(old_sorted[i..].iter().map(|o| MirrorConfigDiff {
        op: MirrorDiffOp::Delete,
        config: (*o).clone(),
    }));
    ops.extend(new_sorted[j..].iter().map(|n| MirrorConfigDiff {
        op: MirrorDiffOp::Add,
        config: (*n).clone(),
    }));
    ops
}
