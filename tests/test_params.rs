use atlas_photon::params::{ConfidenceSelection, SpatialFilter};
use atlas_photon::types::{Beam, PhotonError, SurfaceType};
use atlas_photon::SubsetParams;
use std::io::Write;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_params(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(json.as_bytes()).expect("Failed to write parameters");
    file
}

#[test]
fn test_load_parameters_from_file() {
    init_logging();

    let file = write_params(
        r#"{
            "spatial_filter": {
                "polygon": { "vertices": [[-108.3, 39.0], [-107.7, 39.0], [-107.7, 39.4], [-108.3, 39.4]] }
            },
            "surface_type": "land_ice",
            "atl03_cnf": [3, 4],
            "track": 2,
            "yapc": { "score": 100, "version": 3 },
            "fit": { "max_iterations": 10 },
            "read_timeout": 30
        }"#,
    );

    let params = SubsetParams::from_file(file.path()).expect("Failed to load parameters");
    println!("Loaded parameters: {:?}", params);

    assert!(matches!(params.spatial_filter, SpatialFilter::Polygon(_)));
    assert_eq!(params.surface_type, SurfaceType::LandIce);
    assert_eq!(params.atl03_cnf, ConfidenceSelection::Levels(vec![3, 4]));
    assert_eq!(params.beams, vec![Beam::Gt2l, Beam::Gt2r]);
    assert!(params.stages.yapc);
    assert!(params.stages.fit);
    assert!(!params.stages.atl08);
    assert_eq!(params.fit.as_ref().map(|f| f.max_iterations), Some(10));
    assert_eq!(params.read_timeout().as_secs(), 30);

    let mask = params.confidence_mask();
    assert_eq!(mask, [false, false, false, false, false, true, true]);
}

#[test]
fn test_phoreal_enables_classification() {
    init_logging();

    let params = SubsetParams::from_json_str(
        r#"{ "beams": ["gt3r", "gt1l", "gt3r"], "phoreal": { "binsize": 2.0, "geoloc": "center" } }"#,
    )
    .expect("Failed to parse parameters");

    assert_eq!(params.beams, vec![Beam::Gt1l, Beam::Gt3r]);
    assert!(params.stages.atl08);
    assert!(params.stages.phoreal);
    assert_eq!(params.atl08_class, vec![1, 2, 3]);
}

#[test]
fn test_invalid_parameters_are_rejected() {
    init_logging();

    let bad_track = SubsetParams::from_json_str(r#"{ "track": 4 }"#);
    assert!(matches!(bad_track, Err(PhotonError::Config(_))));

    let bad_class = SubsetParams::from_json_str(r#"{ "atl08_class": [7] }"#);
    assert!(matches!(bad_class, Err(PhotonError::Config(_))));

    let bad_json = SubsetParams::from_json_str(r#"{ "beams": "#);
    assert!(matches!(bad_json, Err(PhotonError::Json(_))));

    let missing = SubsetParams::from_file("/nonexistent/params.json");
    assert!(matches!(missing, Err(PhotonError::Io(_))));
}
