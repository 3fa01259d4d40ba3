// Inbound telemetry decoding
//
// One line from the board is a JSON object such as
//   {"h1":1,"cu1":120,"h2":0,"cu2":0,"err1":0,"err2":0}
// The link is noisy, so anything that does not decode becomes an empty record
// instead of an error. Only keys the parser was configured with are kept.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{DRIVER1_ERROR_KEY, DRIVER2_ERROR_KEY};

/// Decoded contents of one telemetry line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryRecord {
    fields: HashMap<String, i32>,
    pub driver1_error: bool,
    pub driver2_error: bool,
}

impl TelemetryRecord {
    /// Integer value for a recognized key, if the line carried a usable one
    pub fn get(&self, key: &str) -> Option<i32> {
        self.fields.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.driver1_error && !self.driver2_error
    }
}

/// Parses telemetry lines against a fixed set of per-motor keys
#[derive(Debug)]
pub struct TelemetryParser {
    keys: HashSet<String>,
    malformed: u64,
}

impl TelemetryParser {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            malformed: 0,
        }
    }

    /// Decode one line. Never fails: garbage yields an empty record.
    pub fn parse(&mut self, line: &[u8]) -> TelemetryRecord {
        match serde_json::from_slice::<Value>(line) {
            Ok(Value::Object(map)) => self.decode_object(&map),
            Ok(other) => {
                self.malformed += 1;
                debug!("Telemetry line is not an object: {}", other);
                TelemetryRecord::default()
            }
            Err(e) => {
                self.malformed += 1;
                debug!(
                    "Dropping malformed telemetry ({}): {:?}",
                    e,
                    String::from_utf8_lossy(line)
                );
                TelemetryRecord::default()
            }
        }
    }

    /// Number of lines that could not be decoded so far
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn decode_object(&self, map: &Map<String, Value>) -> TelemetryRecord {
        let fields = map
            .iter()
            .filter(|(key, _)| self.keys.contains(key.as_str()))
            .filter_map(|(key, value)| as_int(value).map(|v| (key.clone(), v)))
            .collect();

        TelemetryRecord {
            fields,
            driver1_error: error_flag(map, DRIVER1_ERROR_KEY),
            driver2_error: error_flag(map, DRIVER2_ERROR_KEY),
        }
    }
}

/// Integer in i32 range; an integral float (e.g. `3.0`) is accepted too
fn as_int(value: &Value) -> Option<i32> {
    if let Some(v) = value.as_i64() {
        return i32::try_from(v).ok();
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 {
        Some(f as i32)
    } else {
        None
    }
}

fn error_flag(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).and_then(as_int).is_some_and(|v| v != 0)
}
