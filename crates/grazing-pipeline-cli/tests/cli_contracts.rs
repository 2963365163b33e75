#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn grc_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_grc") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/grc");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "grazing-pipeline-cli", "--bin", "grc"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build grc binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn grc_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(grc_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run grc command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

struct Fixture {
    root: PathBuf,
    db: PathBuf,
    manifest_root: PathBuf,
    boundary: PathBuf,
    soil: PathBuf,
    biomass: PathBuf,
    herd: PathBuf,
    weather: PathBuf,
}

fn write_json(path: &Path, value: &Value) {
    let raw = match serde_json::to_string_pretty(value) {
        Ok(raw) => raw,
        Err(err) => panic!("failed to serialize fixture: {err}"),
    };
    if let Err(err) = std::fs::write(path, raw) {
        panic!("failed to write fixture {}: {err}", path.display());
    }
}

fn fixture(tag: &str) -> Fixture {
    let root = std::env::temp_dir().join(format!("grc-cli-{tag}-{}", Ulid::new()));
    if let Err(err) = std::fs::create_dir_all(&root) {
        panic!("failed to create fixture dir: {err}");
    }

    let fixture = Fixture {
        db: root.join("pipeline.sqlite3"),
        manifest_root: root.join("manifests"),
        boundary: root.join("boundary.json"),
        soil: root.join("soil.json"),
        biomass: root.join("biomass.json"),
        herd: root.join("herd.json"),
        weather: root.join("weather.json"),
        root,
    };

    write_json(
        &fixture.boundary,
        &json!({
            "boundary_id": "ranch_001_paddock_3",
            "name": "Paddock 3",
            "geometry_geojson": "{\"type\":\"Polygon\",\"coordinates\":[]}",
            "crs": "EPSG:4326",
            "area_ha": 50.0,
            "centroid_lat": 44.5,
            "centroid_lon": -103.2
        }),
    );
    write_json(
        &fixture.soil,
        &json!([
            {"productivity_index": 50.0, "available_water_capacity": 0.15,
             "source_version": "nrcs:v1"}
        ]),
    );
    write_json(
        &fixture.biomass,
        &json!([
            {"composite_date": "2025-05-20", "biomass_kg_per_ha": 1500.0,
             "source_version": "rap:v1"}
        ]),
    );
    write_json(
        &fixture.herd,
        &json!({
            "herd_id": "herd-7",
            "animal_count": 400,
            "daily_intake_kg_per_head": 12.0,
            "animal_type": "cattle"
        }),
    );
    write_json(
        &fixture.weather,
        &json!({
            "daily": {
                "time": ["2025-06-01", "2025-06-02", "2025-06-03"],
                "precipitation_sum": [0.5, 0.0, 1.2],
                "temperature_2m_max": [24.0, 25.5, 22.0],
                "temperature_2m_min": [10.0, 11.0, 9.5],
                "wind_speed_10m_max": [7.0, 9.0, 12.0]
            }
        }),
    );

    fixture
}

fn load_and_ingest(fx: &Fixture) {
    let output = grc_output(
        &fx.db,
        &[
            "load-reference",
            "--boundary",
            &fx.boundary.display().to_string(),
            "--soil",
            &fx.soil.display().to_string(),
            "--biomass",
            &fx.biomass.display().to_string(),
        ],
    );
    assert!(output.status.success(), "load-reference failed");

    let output = grc_output(
        &fx.db,
        &[
            "ingest",
            "--boundary",
            &fx.boundary.display().to_string(),
            "--herd",
            &fx.herd.display().to_string(),
            "--weather",
            &fx.weather.display().to_string(),
            "--start",
            "2025-06-01",
            "--end",
            "2025-06-03",
        ],
    );
    assert!(output.status.success(), "ingest failed");
    let report = stdout_json(&output);
    assert_eq!(report["status"], "succeeded");
    assert_eq!(report["features_inserted"], 3);
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(grc_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["load-reference", "ingest", "compute", "explain", "monitor"] {
        assert!(stdout.contains(required), "missing subcommand {required}");
    }
}

#[test]
fn end_to_end_compute_is_idempotent() {
    let fx = fixture("compute");
    load_and_ingest(&fx);

    let compute_args = [
        "compute",
        "--boundary-id",
        "ranch_001_paddock_3",
        "--herd-config-id",
        "herd-7",
        "--as-of",
        "2025-06-01",
        "--manifest-root",
        &fx.manifest_root.display().to_string(),
    ];

    let output = grc_output(&fx.db, &compute_args);
    assert!(output.status.success());
    let first = stdout_json(&output);
    assert_eq!(first["replayed"], false);
    assert_eq!(first["days_remaining"], 15.625);
    assert_eq!(first["recommended_move_date"], "2025-06-16");

    let manifest_path = match first["manifest_path"].as_str() {
        Some(path) => PathBuf::from(path),
        None => panic!("manifest_path missing from compute output"),
    };
    assert!(manifest_path.is_file());

    let output = grc_output(&fx.db, &compute_args);
    assert!(output.status.success());
    let second = stdout_json(&output);
    assert_eq!(second["replayed"], true);
    assert_eq!(second["run_id"], first["run_id"]);
    assert_eq!(second["snapshot_id"], first["snapshot_id"]);
}

#[test]
fn explain_renders_derivation() {
    let fx = fixture("explain");
    load_and_ingest(&fx);

    let output = grc_output(
        &fx.db,
        &[
            "compute",
            "--boundary-id",
            "ranch_001_paddock_3",
            "--herd-config-id",
            "herd-7",
            "--as-of",
            "2025-06-02",
            "--manifest-root",
            &fx.manifest_root.display().to_string(),
        ],
    );
    assert!(output.status.success());
    let computed = stdout_json(&output);
    let run_id = match computed["run_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("run_id missing from compute output"),
    };

    let output = grc_output(&fx.db, &["explain", "--run-id", &run_id]);
    assert!(output.status.success());
    let explained = stdout_json(&output);
    assert_eq!(explained["run_id"], run_id.as_str());
    assert_eq!(explained["identity"]["herd_config_id"], "herd-7");
    assert_eq!(
        explained["derivation"]
            .as_array()
            .map_or(0, std::vec::Vec::len),
        4
    );
}

#[test]
fn changed_inputs_under_same_identity_exit_3() {
    let fx = fixture("drift");
    load_and_ingest(&fx);

    let compute_args = [
        "compute",
        "--boundary-id",
        "ranch_001_paddock_3",
        "--herd-config-id",
        "herd-7",
        "--as-of",
        "2025-06-01",
        "--manifest-root",
        &fx.manifest_root.display().to_string(),
    ];
    let output = grc_output(&fx.db, &compute_args);
    assert!(output.status.success());

    // Change the biomass reference and re-ingest so the feature day differs,
    // then recompute the same identity.
    write_json(
        &fx.biomass,
        &json!([
            {"composite_date": "2025-05-20", "biomass_kg_per_ha": 900.0,
             "source_version": "rap:v1"}
        ]),
    );
    let output = grc_output(
        &fx.db,
        &[
            "load-reference",
            "--boundary",
            &fx.boundary.display().to_string(),
            "--biomass",
            &fx.biomass.display().to_string(),
        ],
    );
    assert!(output.status.success());
    let output = grc_output(
        &fx.db,
        &[
            "ingest",
            "--boundary",
            &fx.boundary.display().to_string(),
            "--herd",
            &fx.herd.display().to_string(),
            "--weather",
            &fx.weather.display().to_string(),
            "--start",
            "2025-06-01",
            "--end",
            "2025-06-03",
        ],
    );
    assert!(output.status.success());

    let output = grc_output(&fx.db, &compute_args);
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("drift conflict"), "stderr={stderr}");
}

#[test]
fn monitor_reports_status_and_exit_code() {
    let fx = fixture("monitor");
    load_and_ingest(&fx);

    for day in ["2025-06-01", "2025-06-02", "2025-06-03"] {
        let output = grc_output(
            &fx.db,
            &[
                "compute",
                "--boundary-id",
                "ranch_001_paddock_3",
                "--herd-config-id",
                "herd-7",
                "--as-of",
                day,
                "--manifest-root",
                &fx.manifest_root.display().to_string(),
            ],
        );
        assert!(output.status.success());
    }

    let output = grc_output(
        &fx.db,
        &[
            "monitor",
            "--boundary-id",
            "ranch_001_paddock_3",
            "--end",
            "2025-06-03",
            "--lookback-days",
            "3",
            "--report-root",
            &fx.manifest_root.display().to_string(),
        ],
    );
    assert!(output.status.success());
    let record = stdout_json(&output);
    assert_eq!(record["status"], "ok");
    assert_eq!(record["report"]["metrics"]["n_recommendations"], 3);

    // Empty window on another boundary id is crit, exit 2.
    let output = grc_output(
        &fx.db,
        &[
            "monitor",
            "--boundary-id",
            "no_such_boundary",
            "--end",
            "2025-06-03",
            "--lookback-days",
            "3",
            "--report-root",
            &fx.manifest_root.display().to_string(),
        ],
    );
    assert_eq!(output.status.code(), Some(2));
    let record = stdout_json(&output);
    assert_eq!(record["status"], "crit");

    let _ = std::fs::remove_dir_all(&fx.root);
}
