//! Flat key/value view of the config.
//!
//! The dispatch dashboard reads `/status` and writes `/update-config` using a
//! single-level JSON object whose key names predate the sectioned TOML file.
//! This module is the only place that maps between the two.

use serde_json::{Map, Value};

use super::validation::{validate_unknown_flat_keys, ValidationWarning};
use super::{BotConfig, ConfigError};

/// Every key `to_flat` emits and `apply_flat_update` accepts.
pub const FLAT_KEYS: &[&str] = &[
    "server_ip",
    "server_port",
    "inner_port",
    "stand_ip",
    "stand_port",
    "admin_uid",
    "master_key",
    "test_key",
    "use_rfid",
    "baudrate2",
    "link_address",
    "link_device",
    "firstSetWorkingLists",
    "resetWorkingLists",
    "getPayment",
    "addWorkingList",
    // misspelled key older dashboards still send
    "firstSetWoringLists",
];

impl BotConfig {
    /// Flat snapshot served by `GET /status`.
    pub fn to_flat(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |k: &str, v: Value| {
            map.insert(k.to_string(), v);
        };
        put("server_ip", self.backend.host.clone().into());
        put("server_port", self.backend.port.into());
        put("inner_port", self.server.port.into());
        put("stand_ip", self.stand.host.clone().into());
        put("stand_port", self.stand.port.into());
        put("admin_uid", self.cards.admin_uid.clone().into());
        put("master_key", self.cards.master_key.clone().into());
        put("test_key", self.cards.test_key.clone().into());
        put("use_rfid", self.reader.use_rfid.into());
        put("baudrate2", self.link.baud_rate.into());
        put("link_address", self.link.address.clone().into());
        put("link_device", self.link.device.clone().into());
        put(
            "firstSetWorkingLists",
            self.backend.first_set_working_list.clone().into(),
        );
        put("resetWorkingLists", self.backend.reset_working_list.clone().into());
        put("getPayment", self.backend.get_payment.clone().into());
        put("addWorkingList", self.backend.add_working_list.clone().into());
        map
    }

    /// Merge a flat `/update-config` body into a copy of this config.
    ///
    /// Missing keys keep their current value. A wrong-typed value fails the
    /// whole update and nothing is applied. Unknown keys come back as warnings.
    pub fn apply_flat_update(
        &self,
        body: &Value,
    ) -> Result<(Self, Vec<ValidationWarning>), ConfigError> {
        let obj = body.as_object().ok_or_else(|| ConfigError::Field {
            field: "<body>".to_string(),
            message: "expected a JSON object".to_string(),
        })?;

        let mut next = self.clone();
        for (key, value) in obj {
            let key = key.as_str();
            match key {
                "server_ip" => next.backend.host = string_field(key, value)?,
                "server_port" => next.backend.port = port_field(key, value)?,
                "inner_port" => next.server.port = port_field(key, value)?,
                "stand_ip" => next.stand.host = string_field(key, value)?,
                "stand_port" => next.stand.port = port_field(key, value)?,
                "admin_uid" => next.cards.admin_uid = uid_field(key, value)?,
                "master_key" => next.cards.master_key = uid_field(key, value)?,
                "test_key" => next.cards.test_key = uid_field(key, value)?,
                "use_rfid" => next.reader.use_rfid = bool_field(key, value)?,
                "baudrate2" => next.link.baud_rate = u32_field(key, value)?,
                "link_address" => next.link.address = string_field(key, value)?,
                "link_device" => next.link.device = string_field(key, value)?,
                "firstSetWorkingLists" | "firstSetWoringLists" => {
                    next.backend.first_set_working_list = string_field(key, value)?;
                }
                "resetWorkingLists" => next.backend.reset_working_list = string_field(key, value)?,
                "getPayment" => next.backend.get_payment = string_field(key, value)?,
                "addWorkingList" => next.backend.add_working_list = string_field(key, value)?,
                _ => {}
            }
        }

        let warnings = validate_unknown_flat_keys(obj);
        next.validate()?;
        Ok((next, warnings))
    }
}

fn type_error(field: &str, expected: &str, value: &Value) -> ConfigError {
    ConfigError::Field {
        field: field.to_string(),
        message: format!("expected {expected}, got {value}"),
    }
}

fn string_field(field: &str, value: &Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| type_error(field, "a string", value))
}

/// Card ids are compared against normalized reader output, so fold case here.
fn uid_field(field: &str, value: &Value) -> Result<String, ConfigError> {
    string_field(field, value).map(|s| s.to_ascii_lowercase())
}

fn bool_field(field: &str, value: &Value) -> Result<bool, ConfigError> {
    value
        .as_bool()
        .ok_or_else(|| type_error(field, "a boolean", value))
}

fn u32_field(field: &str, value: &Value) -> Result<u32, ConfigError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| type_error(field, "an unsigned integer", value))
}

fn port_field(field: &str, value: &Value) -> Result<u16, ConfigError> {
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| type_error(field, "a port number", value))
}
