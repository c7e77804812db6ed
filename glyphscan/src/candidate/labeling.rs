//! Connected-component sizes of a thresholded probability mask.
//!
//! Foreground pixels are collected into horizontal runs row by row; runs that
//! touch a run of the previous row are merged with union-find. Only component
//! sizes are needed, so no label image is produced.

use common::Buffer2;
use serde::{Deserialize, Serialize};

/// Pixel neighborhood used when grouping foreground pixels into blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Pixels at (x±1, y) and (x, y±1).
    Four,
    /// Also the four diagonal neighbors.
    #[default]
    Eight,
}

/// A horizontal run of foreground pixels.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize, // inclusive
    end: usize,   // exclusive
    label: usize,
}

impl Run {
    #[inline]
    fn touches(&self, prev: &Run, connectivity: Connectivity) -> bool {
        match connectivity {
            Connectivity::Four => prev.start < self.end && prev.end > self.start,
            Connectivity::Eight => prev.start < self.end + 1 && prev.end + 1 > self.start,
        }
    }
}

#[derive(Debug, Default)]
struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    fn make_set(&mut self) -> usize {
        let label = self.parent.len();
        self.parent.push(label);
        self.size.push(0);
        label
    }

    fn find(&mut self, mut label: usize) -> usize {
        while self.parent[label] != label {
            // path halving
            self.parent[label] = self.parent[self.parent[label]];
            label = self.parent[label];
        }
        label
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small] = big;
        self.size[big] += self.size[small];
    }
}

fn row_runs(row: &[f32], threshold: f32, runs: &mut Vec<Run>) {
    runs.clear();
    let mut start = None;
    for (x, &p) in row.iter().enumerate() {
        match (p > threshold, start) {
            (true, None) => start = Some(x),
            (false, Some(s)) => {
                runs.push(Run {
                    start: s,
                    end: x,
                    label: 0,
                });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(Run {
            start: s,
            end: row.len(),
            label: 0,
        });
    }
}

/// Pixel counts of every blob of pixels strictly above `threshold`.
pub fn blob_sizes(mask: &Buffer2<f32>, threshold: f32, connectivity: Connectivity) -> Vec<usize> {
    let mut uf = UnionFind::default();
    let mut prev: Vec<Run> = Vec::new();
    let mut curr: Vec<Run> = Vec::new();

    for row in mask.rows() {
        row_runs(row, threshold, &mut curr);

        // both run lists are sorted by start, so a single sweep finds overlaps
        let mut first = 0;
        for run in curr.iter_mut() {
            let mut label = None;
            while first < prev.len() && prev[first].end + 1 < run.start + 1 {
                first += 1;
            }
            for p in prev[first..].iter() {
                if p.start > run.end {
                    break;
                }
                if run.touches(p, connectivity) {
                    match label {
                        None => label = Some(p.label),
                        Some(l) => uf.union(l, p.label),
                    }
                }
            }
            let label = label.unwrap_or_else(|| uf.make_set());
            let root = uf.find(label);
            uf.size[root] += run.end - run.start;
            run.label = label;
        }

        std::mem::swap(&mut prev, &mut curr);
    }

    let roots: Vec<usize> = (0..uf.parent.len()).filter(|&l| uf.find(l) == l).collect();
    roots.into_iter().map(|l| uf.size[l]).collect()
}

/// Pixel count of the largest blob, 0 if there is none.
pub fn largest_blob(mask: &Buffer2<f32>, threshold: f32, connectivity: Connectivity) -> usize {
    blob_sizes(mask, threshold, connectivity)
        .into_iter()
        .max()
        .unwrap_or(0)
}
