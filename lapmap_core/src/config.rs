//! Runtime configuration.
//!
//! The surrounding process hands configuration over as a string→string map
//! (command-line style); every numeric field is parsed here, once, into a
//! typed [`SlamConfig`].

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Typed engine configuration.
#[derive(Debug, Clone)]
pub struct SlamConfig {
    /// Frame-boundary timeout for the frame assembler, milliseconds.
    pub gathering_time_ms: u32,
    /// Association distance: observations closer than this are one cone (m).
    pub same_cone_threshold: f64,
    /// WGS84 latitude of the local-frame origin, degrees.
    pub ref_latitude: f64,
    /// WGS84 longitude of the local-frame origin, degrees.
    pub ref_longitude: f64,
    /// Keyframe interval, milliseconds.
    pub time_between_keyframes_ms: f64,
    /// Maximum range at which a cone is created or advanced to (m).
    pub cone_mapping_threshold: f64,
    /// Number of upcoming cones per outbound packet.
    pub cones_per_packet: u32,
    /// Net cone-index advance that counts as one completed lap.
    pub lap_size: i64,
    /// Sender stamp carried on every outbound message.
    pub sender_stamp: u32,
    /// Whether inbound pose readings are WGS84 (true) or already local
    /// Cartesian (false).
    pub gps_coords: bool,
    /// Longitudinal offset from the lidar to the vehicle CoG, metres.
    pub lidar_dist_to_cog: f64,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            gathering_time_ms: 50,
            same_cone_threshold: 0.5,
            ref_latitude: 0.0,
            ref_longitude: 0.0,
            time_between_keyframes_ms: 100.0,
            cone_mapping_threshold: 10.0,
            cones_per_packet: 5,
            lap_size: 40,
            sender_stamp: 0,
            gps_coords: false,
            lidar_dist_to_cog: 1.5,
        }
    }
}

impl SlamConfig {
    /// Parses a configuration from the process's string map.
    ///
    /// All keys listed in the table of §6 are required except `gpsCoords`
    /// and `lidarDistToCog`, which default to `false` and `1.5`.
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            gathering_time_ms: parse_required(args, "gatheringTimeMs")?,
            same_cone_threshold: parse_required(args, "sameConeThreshold")?,
            ref_latitude: parse_required(args, "refLatitude")?,
            ref_longitude: parse_required(args, "refLongitude")?,
            time_between_keyframes_ms: parse_required(args, "timeBetweenKeyframes")?,
            cone_mapping_threshold: parse_required(args, "coneMappingThreshold")?,
            cones_per_packet: parse_required(args, "conesPerPacket")?,
            lap_size: parse_required(args, "lapSize")?,
            sender_stamp: parse_required(args, "id")?,
            gps_coords: parse_optional(args, "gpsCoords")?.unwrap_or(false),
            lidar_dist_to_cog: parse_optional(args, "lidarDistToCog")?.unwrap_or(1.5),
        })
    }
}

fn parse_required<T: FromStr>(args: &HashMap<String, String>, key: &str) -> Result<T, ConfigError> {
    let raw = args
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.clone(),
    })
}

fn parse_optional<T: FromStr>(
    args: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match args.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            }),
    }
}

/// Errors raised while parsing the configuration map.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Missing configuration key: {0}")]
    MissingKey(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}
