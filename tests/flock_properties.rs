//! End-to-end properties of the CPU flock.

use flockgrid::prelude::*;
use flockgrid::spatial::INVALID_CELL;
use flockgrid::SpawnContext;

/// A dense flock so most agents have neighbours in every rule radius.
fn dense_state(count: usize, seed: u64) -> (FlockConfig, Vec<Vec3>, Vec<Vec3>) {
    let config = FlockConfig::default().with_scene_scale(20.0).with_seed(seed);
    let mut spawn = SpawnContext::new(Some(seed), config.scene_scale);
    let positions = spawn.uniform_positions(count).unwrap();
    let velocities = spawn.random_velocities(count, config.max_speed).unwrap();
    (config, positions, velocities)
}

/// Per-identity velocities and positions after `steps` steps.
fn run(strategy: Strategy, steps: usize, count: usize) -> (Vec<Vec3>, Vec<Vec3>) {
    let (config, positions, velocities) = dense_state(count, 42);
    let mut flock = Flock::from_agents(config, &positions, &velocities).unwrap();
    for _ in 0..steps {
        flock.step(0.1, strategy).unwrap();
    }

    let mut pos = vec![Vec3::ZERO; count];
    let mut vel = vec![Vec3::ZERO; count];
    for (slot, &id) in flock.identities().iter().enumerate() {
        pos[id as usize] = flock.positions()[slot];
        vel[id as usize] = flock.velocities()[slot];
    }
    (pos, vel)
}

#[test]
fn test_grid_strategies_match_brute_force() {
    let count = 1500;
    let (ref_pos, ref_vel) = run(Strategy::BruteForce, 3, count);

    for strategy in [Strategy::Scattered, Strategy::Coherent] {
        let (pos, vel) = run(strategy, 3, count);
        for id in 0..count {
            assert!(
                vel[id].abs_diff_eq(ref_vel[id], 1e-4),
                "{strategy}: velocity of agent {id} is {:?}, expected {:?}",
                vel[id],
                ref_vel[id]
            );
            assert!(
                pos[id].abs_diff_eq(ref_pos[id], 1e-3),
                "{strategy}: position of agent {id} diverged"
            );
        }
    }
}

#[test]
fn test_agents_outside_grid_are_ignored_by_every_strategy() {
    let (config, mut positions, mut velocities) = dense_state(400, 31);
    positions.extend([Vec3::new(-1e11, 0.0, 0.0), Vec3::new(0.0, 5e9, -2e10), Vec3::splat(130.0)]);
    velocities.extend([Vec3::ZERO, Vec3::X * 0.5, Vec3::NEG_Y * 0.2]);
    let count = positions.len();

    let velocities_after = |strategy: Strategy| {
        let mut flock = Flock::from_agents(config, &positions, &velocities).unwrap();
        flock.step(0.1, strategy).unwrap();
        let mut vel = vec![Vec3::ZERO; count];
        for (slot, &id) in flock.identities().iter().enumerate() {
            vel[id as usize] = flock.velocities()[slot];
        }
        vel
    };

    let reference = velocities_after(Strategy::BruteForce);
    for strategy in [Strategy::Scattered, Strategy::Coherent] {
        let vel = velocities_after(strategy);
        for id in 0..count {
            assert!(
                vel[id].abs_diff_eq(reference[id], 1e-5),
                "{strategy}: agent {id} is {:?}, expected {:?}",
                vel[id],
                reference[id]
            );
        }
    }
    // Nothing near the far agents, so they keep their velocity
    assert_eq!(reference[count - 3], Vec3::ZERO);
    assert!(reference[count - 2].abs_diff_eq(Vec3::X * 0.5, 1e-6));
}

#[test]
fn test_overflowing_speed_keeps_direction() {
    for strategy in Strategy::ALL {
        let mut flock =
            Flock::from_agents(FlockConfig::default(), &[Vec3::ZERO], &[Vec3::new(3e38, 0.0, 0.0)]).unwrap();
        flock.step(0.1, strategy).unwrap();
        let v = flock.velocities()[0];
        assert!(v.abs_diff_eq(Vec3::X, 1e-5), "{strategy}: {v:?}");
    }
}

#[test]
fn test_speed_never_exceeds_limit() {
    let (config, positions, _) = dense_state(800, 5);
    let velocities: Vec<Vec3> = (0..positions.len()).map(|i| Vec3::new(5.0 + i as f32 * 0.01, -3.0, 2.0)).collect();
    let mut flock = Flock::from_agents(config.with_max_speed(0.5), &positions, &velocities).unwrap();

    for strategy in Strategy::ALL {
        flock.step(0.1, strategy).unwrap();
        for v in flock.velocities() {
            assert!(v.length() <= 0.5 + 1e-4, "{strategy}: speed {} over limit", v.length());
        }
    }
}

#[test]
fn test_agent_wraps_to_opposite_face() {
    for strategy in Strategy::ALL {
        let mut flock = Flock::from_agents(
            FlockConfig::default(),
            &[Vec3::new(99.99, 0.0, 0.0)],
            &[Vec3::new(10.0, 0.0, 0.0)],
        )
        .unwrap();
        flock.step(1.0, strategy).unwrap();

        let p = flock.positions()[0];
        assert_eq!(p.x, -100.0, "{strategy}");
        assert_eq!(p.y, 0.0);
        assert_eq!(p.z, 0.0);
    }
}

#[test]
fn test_isolated_agent_keeps_velocity() {
    let positions = [Vec3::new(-50.0, -50.0, -50.0), Vec3::new(50.0, 50.0, 50.0)];
    let velocities = [Vec3::new(0.3, 0.0, -0.4), Vec3::new(0.0, 0.2, 0.0)];

    for strategy in Strategy::ALL {
        let mut flock = Flock::from_agents(FlockConfig::default(), &positions, &velocities).unwrap();
        flock.step(0.1, strategy).unwrap();
        for (slot, &id) in flock.identities().iter().enumerate() {
            let expected = velocities[id as usize];
            assert!(flock.velocities()[slot].abs_diff_eq(expected, 1e-6), "{strategy}");
        }
    }
}

#[test]
fn test_cell_ranges_tile_the_sorted_array() {
    let (config, positions, velocities) = dense_state(2000, 9);
    let mut flock = Flock::from_agents(config, &positions, &velocities).unwrap();
    flock.step(0.1, Strategy::Coherent).unwrap();

    let positions = flock.positions().to_vec();
    let grid = *flock.grid();
    let view = flock.partition();
    let n = positions.len();

    let mut covered = vec![false; n];
    for cell in 0..grid.cell_count {
        if let Some(range) = view.ranges.range(cell) {
            for i in range {
                assert!(!covered[i], "slot {i} covered by two cells");
                covered[i] = true;
                assert_eq!(view.sorted_cells[i], cell);
            }
        }
    }
    assert!(covered.iter().all(|&c| c), "sorted array has a gap");

    for (i, &agent) in view.sorted_agents.iter().enumerate() {
        let cell = grid.cell_id(positions[agent as usize]);
        assert_ne!(cell, INVALID_CELL);
        assert_eq!(view.sorted_cells[i], cell);
    }
    assert!(view.sorted_cells.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_same_seed_same_trajectory() {
    let config = FlockConfig::default().with_scene_scale(15.0).with_seed(1234);
    let mut a = Flock::new(1000, config).unwrap();
    let mut b = Flock::new(1000, config).unwrap();

    for _ in 0..10 {
        a.step(0.1, Strategy::Coherent).unwrap();
        b.step(0.1, Strategy::Coherent).unwrap();
    }
    assert_eq!(a.snapshot(1.0), b.snapshot(1.0));
    assert_eq!(a.identities(), b.identities());
}

#[test]
fn test_identities_stay_a_permutation() {
    let (config, positions, velocities) = dense_state(600, 17);
    let mut flock = Flock::from_agents(config, &positions, &velocities).unwrap();
    for _ in 0..5 {
        flock.step(0.1, Strategy::Coherent).unwrap();
    }
    let mut ids = flock.identities().to_vec();
    ids.sort_unstable();
    assert!(ids.iter().enumerate().all(|(i, &id)| id == i as u32));
}

#[test]
fn test_two_agent_separation() {
    let positions = [Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)];
    let config = FlockConfig::default()
        .with_cohesion(RuleParams::new(5.0, 0.0))
        .with_alignment(RuleParams::new(5.0, 0.0));

    for strategy in Strategy::ALL {
        let mut flock = Flock::from_agents(config, &positions, &[Vec3::ZERO; 2]).unwrap();
        flock.step(0.0, strategy).unwrap();
        for (slot, &id) in flock.identities().iter().enumerate() {
            let expected = if id == 0 { -0.1 } else { 0.1 };
            assert!((flock.velocities()[slot].x - expected).abs() < 1e-6, "{strategy}");
        }
    }
}

#[test]
fn test_invalid_inputs_rejected() {
    assert!(matches!(
        Flock::new(0, FlockConfig::default()),
        Err(FlockError::InvalidConfig(_))
    ));

    let flat = FlockConfig::default()
        .with_cohesion(RuleParams::new(0.0, 0.01))
        .with_separation(RuleParams::new(0.0, 0.1))
        .with_alignment(RuleParams::new(0.0, 0.1));
    assert!(matches!(Flock::new(10, flat), Err(FlockError::InvalidConfig(_))));

    let mismatched = Flock::from_agents(FlockConfig::default(), &[Vec3::ZERO; 3], &[Vec3::ZERO; 2]);
    assert!(matches!(mismatched, Err(FlockError::InvalidConfig(_))));

    let mut flock = Flock::new(4, FlockConfig::default().with_seed(2)).unwrap();
    let before = flock.snapshot(1.0);
    assert!(flock.step(f32::INFINITY, Strategy::Scattered).is_err());
    assert_eq!(flock.snapshot(1.0), before);
    assert_eq!(flock.timer().total_steps(), 0);
}

#[test]
fn test_snapshot_buffer_length_checked() {
    let flock = Flock::new(8, FlockConfig::default().with_seed(3)).unwrap();
    let mut short = vec![Vec4::ZERO; 7];
    assert!(matches!(
        flock.write_snapshot(1.0, &mut short),
        Err(FlockError::SnapshotLength { expected: 8, actual: 7 })
    ));

    let mut out = vec![Vec4::ZERO; 8];
    flock.write_snapshot(0.01, &mut out).unwrap();
    for (record, p) in out.iter().zip(flock.positions()) {
        assert!(record.truncate().abs_diff_eq(*p * 0.01, 1e-6));
        assert_eq!(record.w, 1.0);
    }
}

#[test]
fn test_config_from_json_drives_flock() {
    let config = FlockConfig::from_json(r#"{ "scene_scale": 30.0, "seed": 8, "timing_window": 4 }"#).unwrap();
    let mut flock = Flock::new(200, config).unwrap();
    assert_eq!(flock.grid().side_count, 8);

    for _ in 0..4 {
        flock.step(0.1, Strategy::Scattered).unwrap();
    }
    assert!(flock.timer().last_average().is_some());
    assert!(flock.positions().iter().all(|p| p.abs().max_element() <= 30.0));
}
