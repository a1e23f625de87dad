//! Sensor sample types and their wire decoding.
//!
//! Samples arrive as JSON objects published by the GPS and IMU boards:
//!
//! - GPS: `lat`, `lon` (1e-7 degrees), `hMSL` (mm), `velN`, `velE`, `velD` (mm/s),
//!   `hAcc`, `vAcc` (mm), `sAcc` (mm/s), plus optional `fixType`, `epoch`, `gSpeed`,
//!   `headMot` and `headAcc`.
//! - IMU: `euler.{x,y,z}` (degrees) and `linearAccel.{x,y,z}` (m/s², body frame).
//!
//! Decoding never fails on a missing field through a panic or an exception-style path:
//! every field is first read as optional and an absent required field is reported as
//! [`DecodeError::MissingField`]. Callers discard such samples.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest Euler angle magnitude accepted from the IMU (deg).
pub const MAX_EULER_DEGREES: f64 = 360.0;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or non-finite field `{0}`")]
    MissingField(&'static str),
}

/// A GPS sample as reported on the wire, before unit normalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    /// Latitude (1e-7 deg)
    pub lat: f64,
    /// Longitude (1e-7 deg)
    pub lon: f64,
    /// Height above mean sea level (mm)
    pub h_msl: f64,
    /// North velocity (mm/s)
    pub vel_n: f64,
    /// East velocity (mm/s)
    pub vel_e: f64,
    /// Down velocity (mm/s)
    pub vel_d: f64,
    /// Horizontal accuracy (mm)
    pub h_acc: f64,
    /// Vertical accuracy (mm)
    pub v_acc: f64,
    /// Speed accuracy (mm/s)
    pub s_acc: f64,
    pub fix_type: Option<i32>,
    pub epoch: Option<i64>,
    /// Ground speed (mm/s)
    pub g_speed: Option<f64>,
    /// Heading of motion (1e-5 deg)
    pub head_mot: Option<f64>,
    /// Heading accuracy (1e-5 deg)
    pub head_acc: Option<f64>,
}

/// An IMU sample: Euler angles in degrees and body-frame linear acceleration in m/s².
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub euler: Vector3<f64>,
    pub linear_accel: Vector3<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpsPayload {
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(rename = "hMSL")]
    h_msl: Option<f64>,
    vel_n: Option<f64>,
    vel_e: Option<f64>,
    vel_d: Option<f64>,
    h_acc: Option<f64>,
    v_acc: Option<f64>,
    s_acc: Option<f64>,
    fix_type: Option<i32>,
    epoch: Option<i64>,
    g_speed: Option<f64>,
    head_mot: Option<f64>,
    head_acc: Option<f64>,
}

#[derive(Deserialize)]
struct AxesPayload {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImuPayload {
    euler: Option<AxesPayload>,
    linear_accel: Option<AxesPayload>,
}

fn required(value: Option<f64>, name: &'static str) -> Result<f64, DecodeError> {
    value
        .filter(|v| v.is_finite())
        .ok_or(DecodeError::MissingField(name))
}

impl AxesPayload {
    fn into_vector(self, names: [&'static str; 3]) -> Result<Vector3<f64>, DecodeError> {
        Ok(Vector3::new(
            required(self.x, names[0])?,
            required(self.y, names[1])?,
            required(self.z, names[2])?,
        ))
    }
}

impl GpsSample {
    /// Decode a GPS payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: GpsPayload = serde_json::from_slice(payload)?;
        Ok(GpsSample {
            lat: required(raw.lat, "lat")?,
            lon: required(raw.lon, "lon")?,
            h_msl: required(raw.h_msl, "hMSL")?,
            vel_n: required(raw.vel_n, "velN")?,
            vel_e: required(raw.vel_e, "velE")?,
            vel_d: required(raw.vel_d, "velD")?,
            h_acc: required(raw.h_acc, "hAcc")?,
            v_acc: required(raw.v_acc, "vAcc")?,
            s_acc: required(raw.s_acc, "sAcc")?,
            fix_type: raw.fix_type,
            epoch: raw.epoch,
            g_speed: raw.g_speed,
            head_mot: raw.head_mot,
            head_acc: raw.head_acc,
        })
    }

    /// True when every required field holds a finite number.
    pub fn is_complete(&self) -> bool {
        [
            self.lat, self.lon, self.h_msl, self.vel_n, self.vel_e, self.vel_d, self.h_acc,
            self.v_acc, self.s_acc,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

impl ImuSample {
    pub fn new(euler: Vector3<f64>, linear_accel: Vector3<f64>) -> Self {
        ImuSample {
            euler,
            linear_accel,
        }
    }

    /// Decode an IMU payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: ImuPayload = serde_json::from_slice(payload)?;
        let euler = raw
            .euler
            .ok_or(DecodeError::MissingField("euler"))?
            .into_vector(["euler.x", "euler.y", "euler.z"])?;
        let linear_accel = raw
            .linear_accel
            .ok_or(DecodeError::MissingField("linearAccel"))?
            .into_vector(["linearAccel.x", "linearAccel.y", "linearAccel.z"])?;
        Ok(ImuSample::new(euler, linear_accel))
    }

    /// True when every component is finite and the Euler angles lie within ±360°.
    pub fn is_complete(&self) -> bool {
        self.euler.iter().all(|v| v.abs() <= MAX_EULER_DEGREES)
            && self.linear_accel.iter().all(|v| v.is_finite())
    }
}
