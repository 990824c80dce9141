//! Clustering behaviour through the public API.

use proptest::prelude::*;

use brick_classifier::clustering::{ClusterMap, EpsSource};
use brick_classifier::{ClusterId, DensityClusterer, PartitionClusterer};

fn scenario_a() -> Vec<Vec<f32>> {
    vec![
        vec![1.0, 2.0],
        vec![2.0, 2.0],
        vec![2.0, 3.0],
        vec![8.0, 7.0],
        vec![8.0, 8.0],
        vec![7.0, 7.0],
        vec![25.0, 80.0],
        vec![30.0, 90.0],
        vec![30.0, 85.0],
    ]
}

#[test]
fn test_density_auto_radius_on_three_groups() {
    let result = DensityClusterer::default().cluster(&scenario_a()).unwrap();

    assert_eq!(result.eps_source, EpsSource::Knee { index: 5 });
    assert!((result.eps - 1.0).abs() < 1e-9);
    assert_eq!(
        result.assignment,
        vec![
            ClusterId::Cluster(0),
            ClusterId::Cluster(0),
            ClusterId::Cluster(0),
            ClusterId::Cluster(1),
            ClusterId::Cluster(1),
            ClusterId::Cluster(1),
            ClusterId::Noise,
            ClusterId::Noise,
            ClusterId::Noise,
        ]
    );
}

#[test]
fn test_partition_fit_separates_three_groups() {
    let assignment = PartitionClusterer::default()
        .fit(&scenario_a(), 3)
        .unwrap();
    let map = ClusterMap::from_assignment(&assignment);

    assert!(map.noise().is_empty());
    let groups: Vec<Vec<usize>> = map.clusters().map(|(_, m)| m.to_vec()).collect();
    assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]);
}

#[test]
fn test_far_outlier_is_noise() {
    let mut vectors = scenario_a();
    vectors.push(vec![1000.0, 1000.0]);
    let result = DensityClusterer::default().cluster(&vectors).unwrap();

    assert_eq!(result.assignment.len(), 10);
    assert_eq!(result.assignment[9], ClusterId::Noise);
    assert!(result.assignment[..9].iter().any(|id| !id.is_noise()));
}

#[test]
fn test_partition_sweep_picks_four_groups() {
    let centres = [(0.0f32, 0.0f32), (0.0, 10.0), (20.0, 0.0), (20.0, 10.0)];
    let vectors: Vec<Vec<f32>> = centres
        .iter()
        .flat_map(|(cx, cy)| {
            [(0.0, 0.0), (0.3, 0.0), (0.0, 0.3)]
                .into_iter()
                .map(move |(dx, dy)| vec![cx + dx, cy + dy])
        })
        .collect();

    let result = PartitionClusterer::new(2, 8, 1, 1).cluster(&vectors).unwrap();

    assert_eq!(result.chosen_k, 4);
    assert!(result.assignment.iter().all(|id| !id.is_noise()));
    let map = ClusterMap::from_assignment(&result.assignment);
    assert_eq!(map.cluster_count(), 4);
    assert!(map.clusters().all(|(_, members)| members.len() == 3));
}

fn points(max_len: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(prop::collection::vec(-50.0f32..50.0, 2), 0..max_len)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every point lands in exactly one cluster or in noise.
    #[test]
    fn prop_density_partitions_input(vectors in points(40)) {
        let result = DensityClusterer::default().cluster(&vectors).unwrap();
        prop_assert_eq!(result.assignment.len(), vectors.len());

        let map = ClusterMap::from_assignment(&result.assignment);
        prop_assert_eq!(map.point_count(), vectors.len());

        let mut seen: Vec<usize> = map.noise().to_vec();
        for (_, members) in map.clusters() {
            prop_assert!(!members.is_empty());
            seen.extend_from_slice(members);
        }
        seen.sort_unstable();
        prop_assert_eq!(seen, (0..vectors.len()).collect::<Vec<_>>());
    }

    /// Cluster ids are dense: 0..cluster_count with no gaps.
    #[test]
    fn prop_density_ids_are_dense(vectors in points(40)) {
        let result = DensityClusterer::default().cluster(&vectors).unwrap();
        let map = ClusterMap::from_assignment(&result.assignment);
        let ids: Vec<usize> = map.clusters().map(|(id, _)| id).collect();
        prop_assert_eq!(ids, (0..map.cluster_count()).collect::<Vec<_>>());
    }

    #[test]
    fn prop_density_is_deterministic(vectors in points(40)) {
        let engine = DensityClusterer::default();
        let a = engine.cluster(&vectors).unwrap();
        let b = engine.cluster(&vectors).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_partition_never_produces_noise(vectors in points(24)) {
        let result = PartitionClusterer::new(2, 6, 1, 2).cluster(&vectors).unwrap();
        prop_assert_eq!(result.assignment.len(), vectors.len());
        prop_assert!(result.assignment.iter().all(|id| !id.is_noise()));
        if !vectors.is_empty() {
            prop_assert!(result.chosen_k >= 1);
        }
    }

    #[test]
    fn prop_partition_is_deterministic(vectors in points(24)) {
        let engine = PartitionClusterer::new(2, 6, 1, 2);
        let a = engine.cluster(&vectors).unwrap();
        let b = engine.cluster(&vectors).unwrap();
        prop_assert_eq!(a.assignment, b.assignment);
        prop_assert_eq!(a.chosen_k, b.chosen_k);
    }
}
