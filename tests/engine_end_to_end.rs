mod common;

use std::f32::consts::TAU;

use common::FlakyBackend;
use slime_engine::{
    Agent, BoundaryMode, CpuBackend, EngineState, SimError, SimulationEngine, SimulationSettings,
    SpawnMode, SpeciesSettings,
};

const DT: f32 = 1.0 / 60.0;

fn reference_settings() -> SimulationSettings {
    SimulationSettings {
        width: 64,
        height: 64,
        num_agents: 100,
        spawn_mode: SpawnMode::Random,
        trail_weight: 5.0,
        decay_rate: 0.1,
        diffuse_rate: 0.2,
        seed: Some(2024),
        ..Default::default()
    }
}

fn engine_with(settings: SimulationSettings) -> SimulationEngine<CpuBackend> {
    let mut engine = SimulationEngine::new(CpuBackend::new());
    engine.initialize(settings).expect("initialize");
    engine
}

fn in_bounds(agent: &Agent, w: f32, h: f32) -> bool {
    (0.0..w).contains(&agent.position[0]) && (0.0..h).contains(&agent.position[1])
}

fn bits(agents: &[Agent]) -> Vec<u32> {
    bytemuck::cast_slice::<Agent, u32>(agents).to_vec()
}

#[test]
fn single_step_deposits_only_where_agents_are() {
    let mut engine = engine_with(reference_settings());
    engine.step(DT).unwrap();

    let agents = engine.read_population().unwrap().to_vec();
    assert_eq!(agents.len(), 100);
    assert!(agents.iter().all(|a| in_bounds(a, 64.0, 64.0)));

    let field = engine.current_field().unwrap();
    assert!(field.total_intensity() > 0.0);
    for y in 0..64u32 {
        for x in 0..64u32 {
            if field.intensity(x, y) > 0.0 {
                let visited = agents
                    .iter()
                    .any(|a| a.position[0] as u32 == x && a.position[1] as u32 == y);
                assert!(visited, "trail at ({x}, {y}) without an agent there");
            }
        }
    }
}

#[test]
fn long_run_keeps_population_and_bounds() {
    let mut engine = engine_with(reference_settings());
    for _ in 0..240 {
        engine.step(DT).unwrap();
        assert_eq!(engine.population_len(), 100);
    }
    let agents = engine.read_population().unwrap();
    assert!(agents.iter().all(|a| in_bounds(a, 64.0, 64.0)));
    assert!(agents.iter().all(|a| a.angle.is_finite()));
    assert!(engine.current_field().unwrap().total_intensity() > 0.0);
    assert_eq!(engine.tick(), 240);
}

#[test]
fn three_species_point_spawn_sits_at_centre() {
    let mut engine = engine_with(SimulationSettings {
        width: 80,
        height: 40,
        num_agents: 10_000,
        spawn_mode: SpawnMode::Point,
        species: vec![SpeciesSettings::default(); 3],
        seed: Some(8),
        ..Default::default()
    });
    let agents = engine.read_population().unwrap();
    let mut bins = [0usize; 10];
    for a in agents {
        assert_eq!(a.position, [40.0, 20.0]);
        assert_eq!(a.species_mask.iter().sum::<i32>(), 1);
        assert_eq!(a.species_mask[a.species_index as usize], 1);
        bins[(((a.angle / TAU) * 10.0) as usize).min(9)] += 1;
    }
    assert!(bins.iter().all(|&n| (850..=1150).contains(&n)), "angles skewed: {bins:?}");
}

#[test]
fn same_seed_same_simulation() {
    let mut a = engine_with(reference_settings());
    let mut b = engine_with(reference_settings());
    for _ in 0..20 {
        a.step(DT).unwrap();
        b.step(DT).unwrap();
    }
    assert_eq!(a.current_field().unwrap(), b.current_field().unwrap());
    assert_eq!(bits(a.read_population().unwrap()), bits(b.read_population().unwrap()));
}

fn edge_runner(boundary: BoundaryMode) -> SimulationEngine<CpuBackend> {
    let species = SpeciesSettings {
        move_speed: 30.0,
        turn_speed: 0.0,
        ..Default::default()
    };
    let mut engine = engine_with(SimulationSettings {
        width: 64,
        height: 64,
        num_agents: 1,
        boundary,
        species: vec![species],
        seed: Some(1),
        ..reference_settings()
    });
    let runner = [Agent::new([63.75, 10.5], 0.0, 0, Agent::ALL_CHANNELS)];
    engine.replace_population_prefix(&runner).unwrap();
    engine
}

#[test]
fn wrap_boundary_carries_agent_across_the_edge() {
    let mut engine = edge_runner(BoundaryMode::Wrap);
    engine.step(DT).unwrap();

    let agent = engine.read_population().unwrap()[0];
    assert!((agent.position[0] - 0.25).abs() < 1e-3, "x = {}", agent.position[0]);
    assert_eq!(agent.position[1], 10.5);
    assert_eq!(agent.angle, 0.0);
    let field = engine.current_field().unwrap();
    assert!(field.intensity(0, 10) > 0.0);
    assert_eq!(field.intensity(63, 10), 0.0);
}

#[test]
fn clamp_boundary_stops_agent_and_skips_deposit() {
    let mut engine = edge_runner(BoundaryMode::Clamp);
    engine.step(DT).unwrap();

    let agent = engine.read_population().unwrap()[0];
    assert_eq!(agent.position, [63.0, 10.5]);
    assert!((0.0..=TAU).contains(&agent.angle));
    assert_eq!(engine.current_field().unwrap().total_intensity(), 0.0);
}

#[test]
fn failed_tick_leaves_field_and_population_untouched() {
    let mut engine = SimulationEngine::new(FlakyBackend::new());
    engine.initialize(reference_settings()).unwrap();
    engine.step(DT).unwrap();

    let field_before = engine.current_field().unwrap();
    let agents_before = bits(engine.read_population().unwrap());

    engine.backend_mut().fail_submits = 1;
    let err = engine.step(DT).unwrap_err();
    assert!(matches!(err, SimError::BackendUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.tick(), 1);
    assert_eq!(engine.backend().inner.pending_commands(), 0);

    assert_eq!(engine.current_field().unwrap(), field_before);
    assert_eq!(bits(engine.read_population().unwrap()), agents_before);

    engine.step(DT).unwrap();
    assert_eq!(engine.tick(), 2);
    assert_ne!(engine.current_field().unwrap(), field_before);
}

#[test]
fn dispose_releases_everything_and_blocks_further_use() {
    let mut engine = engine_with(reference_settings());
    engine.step(DT).unwrap();
    assert!(engine.backend().live_resources() > 0);

    engine.dispose();
    assert_eq!(engine.backend().live_resources(), 0);
    engine.dispose();

    assert!(matches!(engine.step(DT), Err(SimError::UseAfterDispose { .. })));
    assert!(matches!(engine.current_field(), Err(SimError::UseAfterDispose { .. })));
    assert!(matches!(engine.read_population(), Err(SimError::UseAfterDispose { .. })));
    assert!(matches!(
        engine.replace_population_prefix(&[]),
        Err(SimError::UseAfterDispose { .. })
    ));
    assert!(matches!(engine.tune(|_| {}), Err(SimError::UseAfterDispose { .. })));
    assert!(matches!(
        engine.initialize(reference_settings()),
        Err(SimError::UseAfterDispose { .. })
    ));
}

#[test]
fn replace_prefix_keeps_suffix_bit_identical() {
    let mut engine = engine_with(reference_settings());
    for _ in 0..5 {
        engine.step(DT).unwrap();
    }
    let before = engine.read_population().unwrap().to_vec();
    let fresh = engine.spawn_batch(30).unwrap();

    engine.replace_population_prefix(&fresh).unwrap();
    let after = engine.read_population().unwrap().to_vec();
    assert_eq!(after.len(), 100);
    assert_eq!(bits(&after[..70]), bits(&before[30..]));
    assert_eq!(bits(&after[70..]), bits(&fresh));

    engine.step(DT).unwrap();
    assert_eq!(engine.population_len(), 100);
}

#[test]
fn oversized_replacement_is_rejected_without_change() {
    let mut engine = engine_with(reference_settings());
    engine.step(DT).unwrap();
    let before = bits(engine.read_population().unwrap());

    let too_many = vec![Agent::new([1.0, 1.0], 0.0, 0, Agent::ALL_CHANNELS); 101];
    let err = engine.replace_population_prefix(&too_many).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(_)));
    assert_eq!(bits(engine.read_population().unwrap()), before);
}

#[test]
fn tuned_settings_apply_from_the_next_tick() {
    let mut engine = engine_with(reference_settings());
    engine.step(DT).unwrap();
    assert!(engine.current_field().unwrap().total_intensity() > 0.0);

    engine.tune(|s| s.decay_rate = 1000.0).unwrap();
    engine.step(DT).unwrap();
    assert_eq!(engine.current_field().unwrap().total_intensity(), 0.0);
}

#[test]
fn zero_rates_keep_an_empty_population_field_fixed() {
    let mut engine = engine_with(SimulationSettings {
        num_agents: 0,
        decay_rate: 0.0,
        diffuse_rate: 0.0,
        ..reference_settings()
    });
    for _ in 0..3 {
        engine.step(DT).unwrap();
    }
    assert_eq!(engine.population_len(), 0);
    assert_eq!(engine.current_field().unwrap().total_intensity(), 0.0);
}

#[test]
fn crowded_cell_saturates_instead_of_wrapping() {
    // each agent deposits 2^16 units, so 2^16 of them reach 2^32 in one cell
    let mut engine = engine_with(SimulationSettings {
        width: 32,
        height: 32,
        num_agents: 65_536,
        spawn_mode: SpawnMode::Point,
        trail_weight: 60.0,
        decay_rate: 0.0,
        diffuse_rate: 0.0,
        species: vec![SpeciesSettings {
            move_speed: 0.0,
            ..Default::default()
        }],
        seed: Some(3),
        ..Default::default()
    });
    engine.step(DT).unwrap();

    let field = engine.current_field().unwrap();
    assert_eq!(field.get(16, 16), Some([1.0, 1.0, 1.0, 0.0]));
    assert_eq!(field.total_intensity(), 3.0);
}

#[test]
fn far_reaching_sensors_step_normally() {
    for boundary in [BoundaryMode::Clamp, BoundaryMode::Wrap] {
        let species = SpeciesSettings {
            sensor_offset_dst: 1e10,
            ..Default::default()
        };
        let settings = SimulationSettings {
            boundary,
            species: vec![species],
            ..reference_settings()
        };
        settings.validate().unwrap();

        let mut engine = engine_with(settings);
        for _ in 0..10 {
            engine.step(DT).unwrap();
        }
        assert_eq!(engine.state(), EngineState::Ready);
        let agents = engine.read_population().unwrap();
        assert!(agents.iter().all(|a| in_bounds(a, 64.0, 64.0)));
    }
}

#[test]
fn off_field_replacements_are_rejected() {
    let mut engine = engine_with(reference_settings());
    engine.step(DT).unwrap();
    let before = bits(engine.read_population().unwrap());

    for position in [[1e10, 5.0], [5.0, -1.0], [64.0, 0.0], [f32::INFINITY, 0.0]] {
        let stray = [Agent::new(position, 0.0, 0, Agent::ALL_CHANNELS)];
        let err = engine.replace_population_prefix(&stray).unwrap_err();
        assert!(matches!(err, SimError::InvalidArgument(_)), "{position:?}");
    }
    assert_eq!(bits(engine.read_population().unwrap()), before);
    engine.step(DT).unwrap();
}
