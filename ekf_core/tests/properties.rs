// ekf_core/tests/properties.rs

mod common;

use common::{assert_healthy, Bench};
use ekf_core::prelude::*;
use proptest::prelude::*;

/// Body rate and specific force offsets, each held for one filter period.
fn motion() -> impl Strategy<Value = (Vector3f, Vector3f)> {
    let rate = -1.0_f32..1.0;
    let accel = -3.0_f32..3.0;
    (
        (rate.clone(), rate.clone(), rate),
        (accel.clone(), accel.clone(), accel),
    )
        .prop_map(|((gx, gy, gz), (ax, ay, az))| {
            (Vector3f::new(gx, gy, gz), Vector3f::new(ax, ay, az))
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn filter_stays_well_formed_under_random_motion(
        sequence in prop::collection::vec(motion(), 50..200),
    ) {
        let mut bench = Bench::new(EkfParams {
            fusion_mode: 0,
            ..Default::default()
        });
        bench.run(2.0);
        prop_assert!(bench.ekf.is_initialised());

        for (gyro, accel) in sequence {
            for _ in 0..3 {
                if bench.step_with(gyro, accel) {
                    assert_healthy(&bench.ekf);
                }
            }
        }
        let q = bench.ekf.get_quaternion();
        prop_assert!((q.norm() - 1.0).abs() < 1e-3);
    }
}
