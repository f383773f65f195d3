// tests/test_volume.rs — Integration tests for host volumes, regions and
// configuration.

use tomo_cg::volume::check_region;
use tomo_cg::{DeviceProfile, Extent3, Origin3, ReconConfig, Status, Volume};

// ===== Regions =====

#[test]
fn region_copy_matches_manual_loop() {
    let src = Volume::from_fn(Extent3::new(5, 4, 3), |x, y, z| (x * 100 + y * 10 + z) as f32);
    let mut dst = Volume::filled(Extent3::new(4, 4, 4), -1.0);
    let (so, dor, size) = (Origin3::new(2, 1, 0), Origin3::new(0, 2, 1), Extent3::new(3, 2, 3));
    dst.copy_region_from(&src, so, dor, size).unwrap();

    for z in 0..4 {
        for y in 0..4 {
            for x in 0..4 {
                let inside = x < 3 && (2..4).contains(&y) && (1..4).contains(&z);
                let expected = if inside {
                    src.get(x + 2, y - 2 + 1, z - 1)
                } else {
                    -1.0
                };
                assert_eq!(dst.get(x, y, z), expected, "({x},{y},{z})");
            }
        }
    }
}

#[test]
fn region_overrun_reports_out_of_bounds() {
    let err = check_region(Extent3::cube(8), Origin3::new(0, 0, 7), Extent3::cube(2), "vol").unwrap_err();
    assert_eq!(err.status, Status::OutOfBounds);
    assert!(err.to_string().starts_with("OUT_OF_BOUNDS"));
}

#[test]
fn slices_partition_the_volume() {
    let vol = Volume::from_fn(Extent3::new(2, 3, 4), |x, y, z| (x + y * 2 + z * 6) as f32);
    let joined: Vec<f32> = (0..4).flat_map(|z| vol.slice(z).to_vec()).collect();
    assert_eq!(joined, vol.as_slice());
    assert_eq!(vol.clone().into_vec(), joined);
}

// ===== Configuration =====

#[test]
fn config_defaults_for_missing_sections() {
    let cfg = ReconConfig::from_toml_str("[device]\nprofile = \"portable\"\n").unwrap();
    assert_eq!(cfg.device.profile, DeviceProfile::Portable);
    assert!(!cfg.device.prefer_hardware);
    assert_eq!(cfg.solver.degeneracy_floor, 1e-30);
    assert!(!cfg.solver.timing);
}

#[test]
fn config_rejects_unknown_profile() {
    assert!(ReconConfig::from_toml_str("[device]\nprofile = \"quantum\"\n").is_err());
}
