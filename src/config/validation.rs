//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Unknown keys never fail a load. They are walked out of the raw TOML (or
//! the flat JSON of `/update-config`) and reported with "did you mean?"
//! suggestions. Range checks run on the typed config and do fail.

use std::collections::HashSet;

use super::BotConfig;

/// A non-fatal config warning (typo, ignored field).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ", did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path of `BotConfig`.
///
/// Maintained by hand alongside bot_config.rs.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [backend]
        "backend",
        "backend.host",
        "backend.port",
        "backend.first_set_working_list",
        "backend.reset_working_list",
        "backend.get_payment",
        "backend.add_working_list",
        "backend.forward_path",
        "backend.timeout_ms",
        // [backend.markers]
        "backend.markers",
        "backend.markers.working_list_initialized",
        "backend.markers.working_list_reset",
        "backend.markers.working_list_added",
        // [stand]
        "stand",
        "stand.host",
        "stand.port",
        "stand.action",
        "stand.attempts",
        "stand.retry_delay_ms",
        // [server]
        "server",
        "server.bind",
        "server.port",
        // [cards]
        "cards",
        "cards.admin_uid",
        "cards.master_key",
        "cards.test_key",
        // [reader]
        "reader",
        "reader.use_rfid",
        "reader.address",
        "reader.reconnect_attempts",
        "reader.reconnect_delay_ms",
        // [link]
        "link",
        "link.transport",
        "link.address",
        "link.device",
        "link.baud_rate",
        "link.attempts",
        "link.ack_window_ms",
        "link.backoff_ms",
        "link.reconnect_attempts",
        "link.reconnect_delay_ms",
        // [ledger]
        "ledger",
        "ledger.refresh_retries",
        "ledger.start_refresh_retries",
        "ledger.refresh_delay_ms",
        // [control]
        "control",
        "control.stop_resets_order",
        "control.restart_delay_ms",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// A table `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (k, levenshtein(unknown, k)))
        .filter(|&(_, dist)| dist <= 3)
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(k, _)| k.to_string())
}

fn unknown_key_warnings<'a>(
    found: impl IntoIterator<Item = &'a str>,
    known: &HashSet<&str>,
    what: &str,
) -> Vec<ValidationWarning> {
    found
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|key| ValidationWarning {
            field: key.to_string(),
            message: format!("Unknown {what} '{key}'"),
            suggestion: suggest_correction(key, known),
        })
        .collect()
}

/// Parse a raw TOML string and return warnings for any unknown config keys.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(), // parse errors are reported by serde later
    };

    let found = walk_toml_keys(&value, "");
    unknown_key_warnings(found.iter().map(String::as_str), &known_config_keys(), "config key")
}

/// Warnings for keys of a flat `/update-config` body that are not config fields.
pub fn validate_unknown_flat_keys(
    body: &serde_json::Map<String, serde_json::Value>,
) -> Vec<ValidationWarning> {
    let known: HashSet<&str> = super::flat::FLAT_KEYS.iter().copied().collect();
    unknown_key_warnings(body.keys().map(String::as_str), &known, "config field")
}

// ============================================================================
// Range Validation
// ============================================================================

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Check a parsed config. Returns one message per impossible value.
pub fn validate_ranges(config: &BotConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let ports = [
        ("backend.port", config.backend.port),
        ("stand.port", config.stand.port),
        ("server.port", config.server.port),
    ];
    for (field, port) in ports {
        if port == 0 {
            errors.push(format!("{field} must be non-zero"));
        }
    }

    let hosts = [
        ("backend.host", &config.backend.host),
        ("stand.host", &config.stand.host),
    ];
    for (field, host) in hosts {
        if host.trim().is_empty() {
            errors.push(format!("{field} must not be empty"));
        }
    }

    let b = &config.backend;
    let mut paths = vec![
        ("backend.first_set_working_list", &b.first_set_working_list),
        ("backend.reset_working_list", &b.reset_working_list),
        ("backend.get_payment", &b.get_payment),
        ("backend.add_working_list", &b.add_working_list),
    ];
    if let Some(ref forward) = b.forward_path {
        paths.push(("backend.forward_path", forward));
    }
    for (field, path) in paths {
        if !path.starts_with('/') {
            errors.push(format!("{field} = '{path}' must start with '/'"));
        }
    }

    let attempts = [
        ("link.attempts", config.link.attempts),
        ("stand.attempts", config.stand.attempts),
        ("ledger.refresh_retries", config.ledger.refresh_retries),
        ("ledger.start_refresh_retries", config.ledger.start_refresh_retries),
    ];
    for (field, n) in attempts {
        if n == 0 {
            errors.push(format!("{field} must be at least 1"));
        }
    }

    if config.link.ack_window_ms == 0 {
        errors.push("link.ack_window_ms must be non-zero".to_string());
    }
    if config.link.baud_rate == 0 {
        errors.push("link.baud_rate must be non-zero".to_string());
    }

    let cards = [
        ("cards.admin_uid", &config.cards.admin_uid),
        ("cards.master_key", &config.cards.master_key),
        ("cards.test_key", &config.cards.test_key),
    ];
    for (field, uid) in cards {
        if !is_lower_hex(uid) {
            errors.push(format!("{field} = '{uid}' must be lowercase hex"));
        }
    }

    errors
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("hello", "hello"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("get_paymnt", "get_payment"), 1);
    }

    #[test]
    fn test_levenshtein_empty() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [backend]
            host = "x"
            [backend.markers]
            working_list_reset = "ok"
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"backend".to_string()));
        assert!(keys.contains(&"backend.host".to_string()));
        assert!(keys.contains(&"backend.markers.working_list_reset".to_string()));
    }

    #[test]
    fn test_unknown_key_gets_suggestion() {
        let warnings = validate_unknown_keys("[link]\nack_windw_ms = 10\n");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "link.ack_windw_ms");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("link.ack_window_ms"));
    }

    #[test]
    fn test_known_keys_produce_no_warnings() {
        let raw = BotConfig::default().to_toml().unwrap();
        assert!(validate_unknown_keys(&raw).is_empty());
    }

    #[test]
    fn test_flat_typo_suggestion() {
        let body = serde_json::json!({ "server_iq": "1.2.3.4", "server_port": 80 });
        let warnings = validate_unknown_flat_keys(body.as_object().unwrap());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].suggestion.as_deref(), Some("server_ip"));
    }

    #[test]
    fn test_ranges_flag_bad_values() {
        let mut config = BotConfig::default();
        config.backend.port = 0;
        config.backend.get_payment = "bot/payment".to_string();
        config.cards.test_key = "34E0EF03".to_string();
        config.stand.attempts = 0;

        let errors = validate_ranges(&config);
        assert_eq!(errors.len(), 4, "{errors:?}");
    }
}
