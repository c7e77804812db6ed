use hashbrown::HashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

fn t(x: u32, y: u32) -> TileCoord {
    TileCoord::new(x, y, 17)
}

fn as_set(group: &TileGroup) -> HashSet<TileCoord> {
    group.tiles().iter().copied().collect()
}

fn random_tiles(rng: &mut StdRng, side: u32, density: f64) -> Vec<TileCoord> {
    let mut tiles = Vec::new();
    for y in 0..side {
        for x in 0..side {
            if rng.random_bool(density) {
                tiles.push(t(100 + x, 200 + y));
            }
        }
    }
    tiles
}

#[test]
fn groups_example_set() {
    let groups = group_tiles(&[t(0, 0), t(1, 0), t(5, 5)]);

    assert_eq!(groups.len(), 2);
    assert_eq!(as_set(&groups[0]), [t(0, 0), t(1, 0)].into_iter().collect());
    assert_eq!(groups[1].tiles(), &[t(5, 5)]);
}

#[test]
fn empty_input_yields_no_groups() {
    assert!(group_tiles(&[]).is_empty());
}

#[test]
fn diagonal_tiles_are_separate_groups() {
    let groups = group_tiles(&[t(0, 0), t(1, 1)]);
    assert_eq!(groups.len(), 2);
}

#[test]
fn l_shape_connects_through_members() {
    let tiles = [t(0, 0), t(2, 2), t(0, 1), t(0, 2), t(1, 2)];
    let groups = group_tiles(&tiles);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 5);
}

#[test]
fn duplicates_are_collapsed() {
    let groups = group_tiles(&[t(3, 3), t(3, 3), t(3, 4)]);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].len(), 2);
}

#[test]
fn tiles_at_origin_do_not_underflow() {
    let groups = group_tiles(&[t(0, 0), t(0, 1)]);
    assert_eq!(groups.len(), 1);
}

#[test]
fn membership_does_not_depend_on_input_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let tiles = random_tiles(&mut rng, 12, 0.45);

    let mut reversed = tiles.clone();
    reversed.reverse();

    let mut a: Vec<Vec<(u32, u32)>> = group_tiles(&tiles)
        .iter()
        .map(|g| {
            let mut v: Vec<_> = g.tiles().iter().map(|c| (c.x, c.y)).collect();
            v.sort_unstable();
            v
        })
        .collect();
    let mut b: Vec<Vec<(u32, u32)>> = group_tiles(&reversed)
        .iter()
        .map(|g| {
            let mut v: Vec<_> = g.tiles().iter().map(|c| (c.x, c.y)).collect();
            v.sort_unstable();
            v
        })
        .collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[test]
fn every_tile_in_exactly_one_connected_group() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let tiles = random_tiles(&mut rng, 10, 0.5);
        let input: HashSet<TileCoord> = tiles.iter().copied().collect();
        let groups = group_tiles(&tiles);

        let total: usize = groups.iter().map(TileGroup::len).sum();
        assert_eq!(total, input.len());

        let mut seen = HashSet::new();
        for group in &groups {
            for tile in group {
                assert!(seen.insert(*tile), "{tile} appears twice");
            }

            // no input tile outside the group touches it
            let members = as_set(group);
            for tile in group {
                for n in tile.neighbors() {
                    if input.contains(&n) {
                        assert!(members.contains(&n));
                    }
                }
            }
        }
    }
}

#[test]
fn bounds_and_label() {
    let group = TileGroup::new(vec![t(10, 20), t(11, 20), t(11, 21)]);
    let bounds = group.bounds();

    assert_eq!(bounds.width_tiles(), 2);
    assert_eq!(bounds.height_tiles(), 2);
    assert_eq!(bounds.offset_of(t(11, 21)), (1, 1));
    assert!(!bounds.contains(t(12, 20)));
    assert_eq!(group.label(3), "group_3_coords_10_20");
}

#[test]
fn small_group_is_not_split() {
    let group = TileGroup::new(vec![t(0, 0), t(1, 0)]);
    let chunks = split_if_oversized(&group, 2, 1).unwrap();
    assert_eq!(chunks, vec![group]);
}

#[test]
fn zero_chunk_side_is_rejected() {
    let group = TileGroup::new(vec![t(0, 0)]);
    let err = split_if_oversized(&group, 0, 0).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn oversized_group_splits_into_row_major_blocks() {
    let tiles: Vec<_> = (0..5).flat_map(|y| (0..5).map(move |x| t(x, y))).collect();
    let group = TileGroup::new(tiles);

    let chunks = split_if_oversized(&group, 10, 2).unwrap();

    // 3x3 grid of blocks, last row/column are 1 tile thick
    assert_eq!(chunks.len(), 9);
    assert_eq!(as_set(&chunks[0]), [t(0, 0), t(1, 0), t(0, 1), t(1, 1)].into_iter().collect());
    assert_eq!(chunks[2].tiles(), &[t(4, 0), t(4, 1)]);
    assert_eq!(chunks[8].tiles(), &[t(4, 4)]);
}

#[test]
fn empty_blocks_are_dropped() {
    // ring with a hole bigger than a block
    let mut tiles = Vec::new();
    for y in 0..6 {
        for x in 0..6 {
            if x == 0 || y == 0 || x == 5 || y == 5 {
                tiles.push(t(x, y));
            }
        }
    }
    let group = TileGroup::new(tiles);
    let chunks = split_if_oversized(&group, 4, 2).unwrap();

    // the centre 2x2 block at (2..4, 2..4) has no tiles
    assert_eq!(chunks.len(), 8);
    assert!(chunks.iter().all(|c| !c.is_empty()));
}

#[test]
fn chunk_union_equals_group() {
    let mut rng = StdRng::seed_from_u64(1234);
    for _ in 0..30 {
        let tiles = random_tiles(&mut rng, 15, 0.7);
        for group in group_tiles(&tiles) {
            let max = rng.random_range(0..group.len() + 2);
            let side = rng.random_range(1..8);
            let chunks = split_if_oversized(&group, max, side).unwrap();

            let mut union = HashSet::new();
            for chunk in &chunks {
                let b = chunk.bounds();
                assert!(b.width_tiles() <= side && b.height_tiles() <= side || chunks.len() == 1);
                for tile in chunk {
                    assert!(union.insert(*tile), "{tile} in two chunks");
                }
            }
            assert_eq!(union, as_set(&group));
        }
    }
}

#[test]
fn plan_chunks_groups_then_splits() {
    let mut tiles: Vec<_> = (0..4).flat_map(|y| (0..4).map(move |x| t(x, y))).collect();
    tiles.push(t(50, 50));

    let chunks = plan_chunks(&tiles, 8, 2).unwrap();
    assert_eq!(chunks.len(), 5);
    assert_eq!(chunks.last().unwrap().tiles(), &[t(50, 50)]);
}
