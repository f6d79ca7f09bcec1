//! Ward-linkage agglomerative clustering via the nearest-neighbour chain

use ndarray::Array2;

#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    height: f64,
}

/// Condensed symmetric matrix of Ward merge costs between active clusters
struct CostMatrix {
    n: usize,
    values: Vec<f64>,
}

impl CostMatrix {
    fn from_points(data: &Array2<f64>) -> Self {
        let n = data.nrows();
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = data
                    .row(i)
                    .iter()
                    .zip(data.row(j).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>();
                values[i * n + j] = d;
                values[j * n + i] = d;
            }
        }
        Self { n, values }
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        self.values[i * self.n + j] = value;
        self.values[j * self.n + i] = value;
    }
}

/// Build the full Ward merge sequence.
///
/// Merged clusters live in the slot of the lower index; the other slot is
/// retired. Heights are squared-distance Ward costs.
fn ward_merges(data: &Array2<f64>) -> Vec<Merge> {
    let n = data.nrows();
    let mut costs = CostMatrix::from_points(data);
    let mut sizes = vec![1usize; n];
    let mut active = vec![true; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges = Vec::with_capacity(n.saturating_sub(1));

    while merges.len() + 1 < n {
        if chain.is_empty() {
            if let Some(first) = active.iter().position(|a| *a) {
                chain.push(first);
            }
        }

        // Grow the chain until two clusters are reciprocal nearest neighbours
        let (a, b) = loop {
            let tip = chain[chain.len() - 1];
            let prev = chain.len().checked_sub(2).map(|i| chain[i]);

            let mut best = prev;
            let mut best_cost = prev.map_or(f64::INFINITY, |p| costs.get(tip, p));
            for other in (0..n).filter(|&k| active[k] && k != tip) {
                let cost = costs.get(tip, other);
                if cost < best_cost {
                    best = Some(other);
                    best_cost = cost;
                }
            }

            match best {
                Some(next) if Some(next) == prev => break (tip, next),
                Some(next) => chain.push(next),
                None => break (tip, tip),
            }
        };
        chain.truncate(chain.len().saturating_sub(2));
        if a == b {
            break;
        }

        let (keep, retire) = (a.min(b), a.max(b));
        let height = costs.get(keep, retire);
        let (n_keep, n_retire) = (sizes[keep] as f64, sizes[retire] as f64);

        // Lance-Williams update for Ward linkage
        for k in (0..n).filter(|&k| active[k] && k != keep && k != retire) {
            let n_k = sizes[k] as f64;
            let updated = ((n_keep + n_k) * costs.get(k, keep)
                + (n_retire + n_k) * costs.get(k, retire)
                - n_k * height)
                / (n_keep + n_retire + n_k);
            costs.set(k, keep, updated);
        }

        sizes[keep] += sizes[retire];
        active[retire] = false;
        merges.push(Merge {
            left: keep,
            right: retire,
            height,
        });
    }

    merges
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Cut the Ward dendrogram of `data` at `n_clusters` clusters.
///
/// Labels are numbered by first appearance in row order. Asking for more
/// clusters than rows leaves every row in its own cluster.
pub fn ward_labels(data: &Array2<f64>, n_clusters: usize) -> Vec<usize> {
    let n = data.nrows();
    let mut merges = ward_merges(data);
    // Stable sort keeps creation order for equal heights, so children still
    // precede their parent.
    merges.sort_by(|a, b| a.height.total_cmp(&b.height));

    let mut parent: Vec<usize> = (0..n).collect();
    let n_unions = n.saturating_sub(n_clusters.max(1));
    for merge in merges.iter().take(n_unions) {
        let left = find(&mut parent, merge.left);
        let right = find(&mut parent, merge.right);
        if left != right {
            parent[right] = left;
        }
    }

    let mut ids: Vec<Option<usize>> = vec![None; n];
    let mut next = 0;
    (0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            *ids[root].get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_two_groups() {
        let data = array![[0.0, 0.0], [0.2, 0.0], [10.0, 10.0], [10.1, 10.2], [0.1, 0.1]];
        assert_eq!(ward_labels(&data, 2), vec![0, 0, 1, 1, 0]);
    }

    #[test]
    fn test_cut_levels() {
        let data = array![[0.0], [1.0], [10.0], [11.0], [30.0]];
        assert_eq!(ward_labels(&data, 1), vec![0, 0, 0, 0, 0]);
        assert_eq!(ward_labels(&data, 3), vec![0, 0, 1, 1, 2]);
        assert_eq!(ward_labels(&data, 5), vec![0, 1, 2, 3, 4]);
        assert_eq!(ward_labels(&data, 9), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_count() {
        let data = array![[0.0], [4.0], [5.0], [9.0]];
        assert_eq!(ward_merges(&data).len(), 3);
    }

    /// Greedy Ward: repeatedly merge the pair whose union adds the least
    /// within-cluster sum of squares.
    fn brute_force_ward(data: &Array2<f64>, n_clusters: usize) -> Vec<usize> {
        let mut clusters: Vec<Vec<usize>> = (0..data.nrows()).map(|i| vec![i]).collect();
        let centroid = |members: &[usize]| -> Vec<f64> {
            let mut c = vec![0.0; data.ncols()];
            for &m in members {
                for (acc, v) in c.iter_mut().zip(data.row(m).iter()) {
                    *acc += v / members.len() as f64;
                }
            }
            c
        };

        while clusters.len() > n_clusters {
            let mut best = (0, 1, f64::INFINITY);
            for i in 0..clusters.len() {
                for j in (i + 1)..clusters.len() {
                    let (ci, cj) = (centroid(&clusters[i]), centroid(&clusters[j]));
                    let (ni, nj) = (clusters[i].len() as f64, clusters[j].len() as f64);
                    let dist: f64 = ci.iter().zip(&cj).map(|(a, b)| (a - b).powi(2)).sum();
                    let increase = ni * nj / (ni + nj) * dist;
                    if increase < best.2 {
                        best = (i, j, increase);
                    }
                }
            }
            let merged = clusters.remove(best.1);
            clusters[best.0].extend(merged);
        }

        let mut labels = vec![0; data.nrows()];
        for (id, members) in clusters.iter().enumerate() {
            for &m in members {
                labels[m] = id;
            }
        }
        let mut ids: Vec<Option<usize>> = vec![None; clusters.len()];
        let mut next = 0;
        labels
            .iter()
            .map(|&l| {
                *ids[l].get_or_insert_with(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect()
    }

    #[test]
    fn test_matches_brute_force_ward() {
        use rand::{Rng, SeedableRng};
        use rand_pcg::Pcg64Mcg;

        let mut rng = Pcg64Mcg::seed_from_u64(3);
        for _ in 0..40 {
            let n = rng.gen_range(5..25);
            let raw: Vec<f64> = (0..n * 3).map(|_| rng.gen_range(-5.0..5.0)).collect();
            let data = Array2::from_shape_vec((n, 3), raw).unwrap();
            for k in 2..5 {
                assert_eq!(ward_labels(&data, k), brute_force_ward(&data, k));
            }
        }
    }

    #[test]
    fn test_duplicate_points() {
        let data = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [8.0, 8.0]];
        assert_eq!(ward_labels(&data, 2), vec![0, 0, 0, 1]);
    }
}
