// ekf_core/tests/gps.rs

mod common;

use common::{assert_healthy, Bench, ORIGIN_ALT, ORIGIN_LAT};
use ekf_core::prelude::*;

/// Failure bit of the satellite count check in the GPS check status.
const NSATS_FAILED: u16 = 1 << 1;

fn gps_bench(msg: GpsMessage) -> Bench {
    let mut bench = Bench::new(EkfParams::default());
    bench.gps = Some(msg);
    bench
}

#[test]
fn too_few_satellites_keep_gps_out() {
    let mut bench = gps_bench(GpsMessage {
        nsats: 4,
        ..Bench::good_gps()
    });
    bench.run_checked(20.0, assert_healthy);

    assert!(bench.ekf.get_gps_check_status() & NSATS_FAILED != 0);
    assert!(!bench.ekf.control_status().gps);
    assert!(bench.ekf.get_ekf_origin().is_none());
    let status = bench.ekf.get_ekf_soln_status();
    assert_eq!(status & solution_status::POS_HORIZ_ABS, 0);
}

#[test]
fn healthy_gps_sets_the_origin_and_is_fused() {
    let mut bench = gps_bench(Bench::good_gps());
    bench.run(5.0);
    assert!(bench.ekf.get_ekf_origin().is_none(), "origin before health period");

    bench.run_checked(20.0, assert_healthy);
    let origin = bench.ekf.get_ekf_origin().expect("origin set from GPS");
    assert!((origin.lat_deg - ORIGIN_LAT).abs() < 1e-9);
    assert!((origin.alt - ORIGIN_ALT).abs() < 0.5);
    assert_eq!(bench.ekf.get_gps_check_status(), 0);
    assert!(bench.ekf.control_status().gps);
    assert!(!bench.ekf.inertial_dead_reckoning());

    let status = bench.ekf.get_ekf_soln_status();
    assert_ne!(status & solution_status::POS_HORIZ_ABS, 0);
    assert_ne!(status & solution_status::VELOCITY_HORIZ, 0);
    assert_eq!(bench.ekf.set_ekf_origin(0.0, 0.0, 0.0), Err(EkfError::OriginAlreadySet));

    let (hpos, vpos) = bench.ekf.get_ekf_lpos_accuracy();
    assert!(hpos > 0.0 && hpos < 2.0);
    assert!(vpos > 0.0);
}

#[test]
fn position_outlier_is_rejected_and_fusion_continues() {
    let mut bench = gps_bench(Bench::good_gps());
    bench.run(25.0);
    assert!(bench.ekf.control_status().gps);

    bench.gps_glitch_north = Some(50.0);
    let mut max_pos_ratio = 0.0_f32;
    let mut saw_fault = false;
    bench.run_checked(0.5, |ekf| {
        let test = ekf.get_innovation_test_status();
        max_pos_ratio = max_pos_ratio.max(test.pos);
        saw_fault |= test.status & innovation_fault::POS_NE != 0;
        assert_healthy(ekf);
    });
    assert!(max_pos_ratio > 1.0);
    assert!(saw_fault);
    assert!(bench.ekf.state().pos[0].abs() < 1.0);

    bench.run(2.0);
    let test = bench.ekf.get_innovation_test_status();
    assert!(test.pos < 1.0, "pos ratio {}", test.pos);
    assert_eq!(test.status & innovation_fault::POS_NE, 0);
    assert!(bench.ekf.control_status().gps);
    assert!(bench.ekf.get_vel_pos_innov()[3].abs() < 1.0);
}
