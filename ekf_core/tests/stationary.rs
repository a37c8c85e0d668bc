// ekf_core/tests/stationary.rs

mod common;

use common::{assert_healthy, Bench};
use ekf_core::frames::layout::{DANG_BIAS, QUAT};
use ekf_core::prelude::*;

fn baro_only() -> EkfParams {
    EkfParams {
        fusion_mode: 0,
        mag_fusion_type: MagFuseType::None,
        ..Default::default()
    }
}

#[test]
fn initialises_after_enough_baro_data() {
    let mut bench = Bench::new(baro_only());
    bench.run(0.2);
    assert!(!bench.ekf.is_initialised());
    bench.run(2.0);
    assert!(bench.ekf.is_initialised());
    assert!(!bench.ekf.control_status().yaw_align);
    assert_eq!(bench.ekf.control_status().height_source, HeightSensor::Baro);
}

#[test]
fn static_vehicle_without_aiding_holds_still() {
    let mut bench = Bench::new(baro_only());
    bench.run(3.0);
    assert!(bench.ekf.is_initialised());
    let yaw_var_early = bench.ekf.orientation_covariances()[(3, 3)];

    // Yaw and the gyro bias about down are unobserved, so their variances
    // only ever grow.
    let unobserved = [QUAT + 3, DANG_BIAS + 2];
    let mut previous = unobserved.map(|i| bench.ekf.covariances()[(i, i)]);
    bench.run_checked(20.0, |ekf| {
        assert_healthy(ekf);
        for (prev, &i) in previous.iter_mut().zip(&unobserved) {
            let var = ekf.covariances()[(i, i)];
            assert!(var >= *prev * (1.0 - 1e-5), "variance {i} fell from {prev} to {var}");
            *prev = var;
        }
    });

    let state = bench.ekf.state();
    assert!(state.vel.norm() < 0.1, "velocity {:?}", state.vel);
    assert!(state.pos.norm() < 0.5, "position {:?}", state.pos);
    assert!(bench.ekf.get_velocity().norm() < 0.1);
    assert!(bench.ekf.using_synthetic_position());
    assert!(bench.ekf.inertial_dead_reckoning());
    assert!(bench.ekf.control_status().tilt_align);

    // Nothing observes yaw.
    let yaw_var_late = bench.ekf.orientation_covariances()[(3, 3)];
    assert!(yaw_var_late > yaw_var_early, "{yaw_var_late} <= {yaw_var_early}");
}

#[test]
fn real_time_output_tracks_the_delayed_state() {
    let mut bench = Bench::new(baro_only());
    bench.run(10.0);
    let [att, vel, pos] = bench.ekf.get_output_tracking_error();
    assert!(att < 1e-3 && vel < 0.05 && pos < 0.05);
    let q = bench.ekf.calculate_quaternion();
    assert!((q.norm() - 1.0).abs() < 1e-5);
}

#[test]
fn imu_bias_reset_is_rate_limited() {
    let mut bench = Bench::new(baro_only());
    bench.run(1.0);
    assert!(bench.ekf.reset_imu_bias());
    bench.run(5.0);
    let state = *bench.ekf.state();
    let covariances = *bench.ekf.covariances();
    assert!(!bench.ekf.reset_imu_bias());
    assert_eq!(*bench.ekf.state(), state);
    assert_eq!(*bench.ekf.covariances(), covariances);
    bench.run(5.1);
    assert!(bench.ekf.reset_imu_bias());
    assert_eq!(bench.ekf.get_gyro_bias(), Vector3f::zeros());
}

#[test]
fn mag_heading_aligns_yaw_at_start() {
    let mut bench = Bench::new(EkfParams {
        fusion_mode: 0,
        ..Default::default()
    });
    bench.run(3.0);
    assert!(bench.ekf.is_initialised());
    assert!(bench.ekf.control_status().yaw_align);

    bench.run_checked(5.0, assert_healthy);
    let q = bench.ekf.get_quaternion();
    // Facing north: no rotation about down.
    assert!(q.k.abs() < 0.02, "quaternion {q:?}");
}
