//! Average-linkage agglomerative clustering with a same-camera exclusion.

use std::collections::HashSet;

use ndarray::Array2;

use crate::tracker::local_track::SourceId;
use crate::tracker::matching::FORBIDDEN;

struct Cluster {
    members: Vec<usize>,
    cameras: HashSet<SourceId>,
}

/// Flat cluster labels for observations described by `dist` (square, symmetric),
/// cutting the average-linkage dendrogram at `threshold`.
///
/// `cameras[i]` is the camera observation `i` came from. Two clusters that
/// already hold a track from the same camera are never merged, whatever the
/// distance matrix says, so every cluster has at most one track per camera.
///
/// Labels are dense and numbered in order of each cluster's first member.
pub fn average_linkage(dist: &Array2<f64>, cameras: &[SourceId], threshold: f64) -> Vec<usize> {
    let n = cameras.len();
    debug_assert_eq!(dist.dim(), (n, n));
    if n <= 1 {
        return vec![0; n];
    }

    let mut clusters: Vec<Option<Cluster>> = (0..n)
        .map(|i| {
            Some(Cluster {
                members: vec![i],
                cameras: HashSet::from([cameras[i]]),
            })
        })
        .collect();

    let mut linkage = Array2::<f64>::from_elem((n, n), FORBIDDEN);
    for i in 0..n {
        for j in (i + 1)..n {
            let d = if cameras[i] == cameras[j] { FORBIDDEN } else { dist[[i, j]] };
            linkage[[i, j]] = d;
            linkage[[j, i]] = d;
        }
    }

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..n {
            if clusters[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if clusters[j].is_none() {
                    continue;
                }
                let d = linkage[[i, j]];
                if d < FORBIDDEN && best.is_none_or(|(_, _, b)| d < b) {
                    best = Some((i, j, d));
                }
            }
        }

        let Some((a, b, d)) = best else { break };
        if d > threshold {
            break;
        }

        let Some(absorbed) = clusters[b].take() else { break };
        let Some(target) = clusters[a].as_mut() else { break };
        let (size_a, size_b) = (target.members.len() as f64, absorbed.members.len() as f64);
        target.members.extend(absorbed.members);
        target.cameras.extend(absorbed.cameras);
        let merged_cameras = target.cameras.clone();

        for k in 0..n {
            if k == a || k == b {
                continue;
            }
            let Some(other) = clusters[k].as_ref() else { continue };
            let (da, db) = (linkage[[a, k]], linkage[[b, k]]);
            let blocked = da >= FORBIDDEN || db >= FORBIDDEN;
            let merged = if blocked || !merged_cameras.is_disjoint(&other.cameras) {
                FORBIDDEN
            } else {
                (size_a * da + size_b * db) / (size_a + size_b)
            };
            linkage[[a, k]] = merged;
            linkage[[k, a]] = merged;
        }
    }

    let mut labels = vec![0; n];
    let mut heads: Vec<(usize, &Cluster)> = clusters
        .iter()
        .flatten()
        .map(|c| (c.members.iter().copied().min().unwrap_or(0), c))
        .collect();
    heads.sort_by_key(|(head, _)| *head);
    for (label, (_, cluster)) in heads.into_iter().enumerate() {
        for &m in &cluster.members {
            labels[m] = label;
        }
    }
    labels
}

/// Group observation indices by label, preserving label order.
pub fn group_by_label(labels: &[usize]) -> Vec<Vec<usize>> {
    let count = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut groups = vec![Vec::new(); count];
    for (idx, &label) in labels.iter().enumerate() {
        groups[label].push(idx);
    }
    groups
}
