//! Offline replay of logged sensor data.
//!
//! A log is a CSV file with one row per filter tick and named columns:
//!
//! `lat, lon, hMSL, velN, velE, velD, hAcc, vAcc, sAcc` (GPS, wire units),
//! `eulerX, eulerY, eulerZ, linearAccelX, linearAccelY, linearAccelZ` (IMU), and an optional
//! `fixType`. Empty or `NaN` cells mark a sample that was absent on that tick.
//!
//! Each row is fed through the same preprocessing and [`FusionFilter::step`] as the live
//! runtime. The replay writes:
//!
//! - `acc_input.csv`: world-frame acceleration (3 columns),
//! - `measure.csv`: measurement vector (6 columns),
//! - `kalman_boat_R.csv`: diagonal of the measurement noise (6 columns),
//! - `estimate.csv`: state, latitude factor and orientation after every tick.
//!
//! Preprocessed files carry a row of `NaN` when the sample is missing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FilterConfig;
use crate::fusion::{EstimateSnapshot, FusionFilter};
use crate::kalman::FilterError;
use crate::measurements::{GpsFix, GpsMeasurement, Orientation, is_valid_fix, world_acceleration};
use crate::messages::{GpsSample, ImuSample};
use crate::shared::{ReferenceFix, Snapshot};

pub const ACC_INPUT_FILE: &str = "acc_input.csv";
pub const MEASURE_FILE: &str = "measure.csv";
pub const MEASUREMENT_NOISE_FILE: &str = "kalman_boat_R.csv";
pub const ESTIMATE_FILE: &str = "estimate.csv";

const ESTIMATE_HEADER: [&str; 10] = [
    "north",
    "east",
    "up",
    "v_north",
    "v_east",
    "v_up",
    "latitude_factor",
    "heading",
    "pitch",
    "roll",
];

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// One logged tick. Absent values are `None` or non-finite.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default, rename = "hMSL")]
    pub h_msl: Option<f64>,
    #[serde(default)]
    pub vel_n: Option<f64>,
    #[serde(default)]
    pub vel_e: Option<f64>,
    #[serde(default)]
    pub vel_d: Option<f64>,
    #[serde(default)]
    pub h_acc: Option<f64>,
    #[serde(default)]
    pub v_acc: Option<f64>,
    #[serde(default)]
    pub s_acc: Option<f64>,
    #[serde(default)]
    pub fix_type: Option<i32>,
    #[serde(default)]
    pub euler_x: Option<f64>,
    #[serde(default)]
    pub euler_y: Option<f64>,
    #[serde(default)]
    pub euler_z: Option<f64>,
    #[serde(default)]
    pub linear_accel_x: Option<f64>,
    #[serde(default)]
    pub linear_accel_y: Option<f64>,
    #[serde(default)]
    pub linear_accel_z: Option<f64>,
}

fn present(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

impl ReplayRecord {
    /// Read every record of a log file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, ReplayError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Write records as a log file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<(), ReplayError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// The GPS sample of this tick, if every GPS column is present.
    pub fn gps(&self) -> Option<GpsSample> {
        Some(GpsSample {
            lat: present(self.lat)?,
            lon: present(self.lon)?,
            h_msl: present(self.h_msl)?,
            vel_n: present(self.vel_n)?,
            vel_e: present(self.vel_e)?,
            vel_d: present(self.vel_d)?,
            h_acc: present(self.h_acc)?,
            v_acc: present(self.v_acc)?,
            s_acc: present(self.s_acc)?,
            fix_type: self.fix_type,
            ..GpsSample::default()
        })
    }

    /// The IMU sample of this tick, if every IMU column is present.
    pub fn imu(&self) -> Option<ImuSample> {
        Some(ImuSample::new(
            Vector3::new(
                present(self.euler_x)?,
                present(self.euler_y)?,
                present(self.euler_z)?,
            ),
            Vector3::new(
                present(self.linear_accel_x)?,
                present(self.linear_accel_y)?,
                present(self.linear_accel_z)?,
            ),
        ))
    }
}

/// Preprocessed inputs and filter output of one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReplayStep {
    pub acceleration: Option<Vector3<f64>>,
    pub measurement: Option<GpsMeasurement>,
    pub estimate: EstimateSnapshot,
}

/// Counters of a finished replay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub rows: usize,
    pub imu_samples: usize,
    pub gps_samples: usize,
    pub corrections: usize,
    pub outputs: Vec<PathBuf>,
}

/// Run the filter over `records`, one tick per record.
pub fn replay_records(
    records: &[ReplayRecord],
    config: &FilterConfig,
) -> Result<Vec<ReplayStep>, FilterError> {
    let mut filter = FusionFilter::from_config(config)?;
    let reference = ReferenceFix::new();
    let mut steps = Vec::with_capacity(records.len());

    for record in records {
        let gps = record
            .gps()
            .filter(|sample| is_valid_fix(sample, config.min_fix_type));
        let imu = record.imu();
        if let Some(sample) = &gps {
            reference.capture(GpsFix::from_sample(sample));
        }

        let acceleration = imu
            .as_ref()
            .map(|sample| world_acceleration(sample, &Orientation::from_imu(sample)));
        let measurement = gps
            .as_ref()
            .zip(reference.get())
            .map(|(sample, reference)| GpsFix::from_sample(sample).measurement(reference));

        let estimate = filter.step(
            &Snapshot {
                value: gps,
                fresh: gps.is_some(),
            },
            &Snapshot {
                value: imu,
                fresh: imu.is_some(),
            },
            reference.get(),
        );
        steps.push(ReplayStep {
            acceleration,
            measurement: measurement.filter(|_| filter.last_report().corrected),
            estimate,
        });
    }
    Ok(steps)
}

fn write_rows<P, I>(path: P, header: Option<&[&str]>, rows: I) -> Result<(), ReplayError>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = Vec<f64>>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

fn or_nan(values: Option<Vec<f64>>, width: usize) -> Vec<f64> {
    values.unwrap_or_else(|| vec![f64::NAN; width])
}

/// Replay a log file and write the preprocessed inputs and estimates into `output_dir`.
pub fn run_replay<P, Q>(
    input: P,
    output_dir: Q,
    config: &FilterConfig,
) -> Result<ReplaySummary, ReplayError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let input = input.as_ref();
    let output_dir = output_dir.as_ref();
    let records = ReplayRecord::from_csv(input)?;
    log::info!("replaying {} rows from {}", records.len(), input.display());

    let steps = replay_records(&records, config)?;
    fs::create_dir_all(output_dir)?;

    let acc_path = output_dir.join(ACC_INPUT_FILE);
    write_rows(
        &acc_path,
        None,
        steps
            .iter()
            .map(|s| or_nan(s.acceleration.map(|a| a.iter().copied().collect()), 3)),
    )?;
    let measure_path = output_dir.join(MEASURE_FILE);
    write_rows(
        &measure_path,
        None,
        steps.iter().map(|s| {
            or_nan(s.measurement.map(|m| m.vector.iter().copied().collect()), 6)
        }),
    )?;
    let noise_path = output_dir.join(MEASUREMENT_NOISE_FILE);
    write_rows(
        &noise_path,
        None,
        steps.iter().map(|s| {
            or_nan(
                s.measurement
                    .map(|m| m.noise.diagonal().iter().copied().collect()),
                6,
            )
        }),
    )?;
    let estimate_path = output_dir.join(ESTIMATE_FILE);
    write_rows(
        &estimate_path,
        Some(&ESTIMATE_HEADER[..]),
        steps.iter().map(|s| {
            let e = &s.estimate;
            let mut row: Vec<f64> = e.state.iter().copied().collect();
            row.extend([
                e.latitude_factor,
                e.orientation.heading,
                e.orientation.pitch,
                e.orientation.roll,
            ]);
            row
        }),
    )?;

    let summary = ReplaySummary {
        rows: steps.len(),
        imu_samples: steps.iter().filter(|s| s.acceleration.is_some()).count(),
        gps_samples: records
            .iter()
            .filter_map(ReplayRecord::gps)
            .filter(|sample| is_valid_fix(sample, config.min_fix_type))
            .count(),
        corrections: steps.iter().filter(|s| s.measurement.is_some()).count(),
        outputs: vec![acc_path, measure_path, noise_path, estimate_path],
    };
    log::info!(
        "replay done: {} rows, {} IMU samples, {} GPS samples, {} corrections",
        summary.rows,
        summary.imu_samples,
        summary.gps_samples,
        summary.corrections
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    const LOG: &str = "\
lat,lon,hMSL,velN,velE,velD,hAcc,vAcc,sAcc,fixType,eulerX,eulerY,eulerZ,linearAccelX,linearAccelY,linearAccelZ
450000000,90000000,0,1000,0,0,1000,1000,100,3,0,0,360,0,0,0
,,,,,,,,,,0,0,360,0.5,0,0
NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN,,NaN,NaN,NaN,NaN,NaN,NaN
450000100,90000000,0,1000,0,0,1000,1000,100,3,,,,,,
";

    fn write_log(dir: &Path) -> PathBuf {
        let path = dir.join("log.csv");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(LOG.as_bytes()).unwrap();
        path
    }

    #[test]
    fn records_parse_absent_cells() {
        let dir = tempfile::tempdir().unwrap();
        let records = ReplayRecord::from_csv(write_log(dir.path())).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records[0].gps().is_some() && records[0].imu().is_some());
        assert!(records[1].gps().is_none() && records[1].imu().is_some());
        assert!(records[2].gps().is_none() && records[2].imu().is_none());
        assert!(records[3].gps().is_some() && records[3].imu().is_none());
        assert_eq!(records[0].gps().unwrap().fix_type, Some(3));
    }

    #[test]
    fn replay_matches_expected_inputs() {
        let records = ReplayRecord::from_csv(write_log(tempfile::tempdir().unwrap().path())).unwrap();
        let steps = replay_records(&records, &FilterConfig::default()).unwrap();
        assert_eq!(steps.len(), 4);

        // First fix becomes the reference: zero offset.
        let first = steps[0].measurement.unwrap();
        assert_approx_eq!(first.vector[0], 0.0, 1e-12);
        assert_approx_eq!(first.vector[3], 1.0, 1e-12);
        assert_approx_eq!(first.noise[(0, 0)], 0.25, 1e-12);

        let acceleration = steps[1].acceleration.unwrap();
        assert_approx_eq!(acceleration[0], 0.5, 1e-12);
        assert!(steps[1].measurement.is_none());
        assert!(steps[2].acceleration.is_none() && steps[2].measurement.is_none());

        // 1e-5 degrees north of the reference.
        let last = steps[3].measurement.unwrap();
        assert_approx_eq!(last.vector[0], 1e-5 * crate::earth::EARTH_CIRCUMFERENCE / 360.0, 1e-6);
        assert!(steps[3].estimate.state[3] > 0.5);
    }

    #[test]
    fn run_replay_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_log(dir.path());
        let out = dir.path().join("out");
        let summary = run_replay(&input, &out, &FilterConfig::default()).unwrap();
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.imu_samples, 2);
        assert_eq!(summary.gps_samples, 2);
        assert_eq!(summary.corrections, 2);
        assert_eq!(summary.outputs.len(), 4);

        let acc = fs::read_to_string(out.join(ACC_INPUT_FILE)).unwrap();
        let lines: Vec<&str> = acc.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "NaN,NaN,NaN");
        assert_eq!(lines[1].split(',').count(), 3);

        let measure = fs::read_to_string(out.join(MEASURE_FILE)).unwrap();
        let lines: Vec<&str> = measure.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "NaN,NaN,NaN,NaN,NaN,NaN");
        let noise = fs::read_to_string(out.join(MEASUREMENT_NOISE_FILE)).unwrap();
        let first: Vec<f64> = noise
            .lines()
            .next()
            .unwrap()
            .split(',')
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(first.len(), 6);
        assert_approx_eq!(first[5], 0.0025, 1e-15);

        let estimate = fs::read_to_string(out.join(ESTIMATE_FILE)).unwrap();
        let mut lines = estimate.lines();
        assert_eq!(lines.next().unwrap(), ESTIMATE_HEADER.join(","));
        assert_eq!(lines.count(), 4);
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_replay(dir.path().join("nope.csv"), dir.path(), &FilterConfig::default());
        assert!(matches!(err, Err(ReplayError::Csv(_))));
    }
}
