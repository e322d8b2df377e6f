//! Payment Ledger — the active order and what is left to pick
//!
//! Snapshot format served by the backend's "get payment" path:
//!
//! ```json
//! { "orderId": "A1", "Cola": ["c3a27b28", 2], "Chips": ["99887766", 1] }
//! ```
//!
//! Every key other than the order id is an item name mapped to
//! `[tagId, quantity]`. Entry order follows the document.
//!
//! [`PaymentLedger::parse`] builds the new state on the side and swaps it in
//! only on success, so a malformed snapshot never disturbs the current order.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Order id key.
pub const ORDER_ID_KEY: &str = "orderId";

/// Order id key used by older backends.
pub const LEGACY_ORDER_ID_KEY: &str = "paymentId";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Payment snapshot is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Payment snapshot is not a JSON object")]
    NotAnObject,

    #[error("Payment snapshot has no string 'orderId'")]
    MissingOrderId,
}

/// One item of the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub item_name: String,
    pub tag_id: String,
    pub remaining_qty: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentLedger {
    order_id: String,
    entries: Vec<LedgerEntry>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// An order is active when the order id is non-empty.
    pub fn is_active(&self) -> bool {
        !self.order_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.order_id.clear();
        self.entries.clear();
    }

    /// Replace the ledger with the snapshot in `body`.
    ///
    /// On error the ledger is left exactly as it was.
    pub fn parse(&mut self, body: &str) -> Result<(), LedgerError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| LedgerError::InvalidJson(e.to_string()))?;
        let obj = value.as_object().ok_or(LedgerError::NotAnObject)?;
        let next = Self::from_snapshot(obj)?;

        debug!(
            order_id = %next.order_id,
            entries = next.entries.len(),
            "[Ledger] Snapshot applied"
        );
        *self = next;
        Ok(())
    }

    fn from_snapshot(obj: &Map<String, Value>) -> Result<Self, LedgerError> {
        let order_id = obj
            .get(ORDER_ID_KEY)
            .or_else(|| obj.get(LEGACY_ORDER_ID_KEY))
            .and_then(Value::as_str)
            .ok_or(LedgerError::MissingOrderId)?
            .to_string();

        let mut entries: Vec<LedgerEntry> = Vec::new();
        for (item_name, value) in obj {
            if item_name == ORDER_ID_KEY || item_name == LEGACY_ORDER_ID_KEY {
                continue;
            }
            let Some(entry) = parse_entry(item_name, value) else {
                warn!(item = %item_name, value = %value, "[Ledger] Skipping malformed entry");
                continue;
            };
            if entries.iter().any(|e| e.tag_id == entry.tag_id) {
                warn!(
                    tag = %entry.tag_id,
                    item = %item_name,
                    "[Ledger] Tag already mapped to another item; first entry wins"
                );
            }
            entries.push(entry);
        }

        Ok(Self { order_id, entries })
    }

    /// First entry whose tag id equals `tag_id`.
    pub fn match_tag(&self, tag_id: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.tag_id == tag_id)
    }

    /// Take one unit from the first entry for `tag_id` that still has stock.
    ///
    /// Returns the entry after the decrement, or `None` if nothing was left.
    pub fn consume(&mut self, tag_id: &str) -> Option<&LedgerEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.tag_id == tag_id && e.remaining_qty > 0)?;
        entry.remaining_qty -= 1;
        Some(&*entry)
    }
}

fn parse_entry(item_name: &str, value: &Value) -> Option<LedgerEntry> {
    let [tag, qty] = value.as_array()?.as_slice() else {
        return None;
    };
    let tag_id = tag.as_str()?.trim().to_ascii_lowercase();
    let remaining_qty = if let Some(n) = qty.as_u64() {
        u32::try_from(n).unwrap_or(u32::MAX)
    } else if qty.as_i64().is_some() {
        // negative
        0
    } else {
        return None;
    };
    Some(LedgerEntry {
        item_name: item_name.to_string(),
        tag_id,
        remaining_qty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{"orderId":"A1","Cola":["c3a27b28",2],"Chips":["99887766",1]}"#;

    fn loaded() -> PaymentLedger {
        let mut ledger = PaymentLedger::new();
        ledger.parse(SNAPSHOT).unwrap();
        ledger
    }

    #[test]
    fn test_parse_snapshot() {
        let ledger = loaded();
        assert_eq!(ledger.order_id(), "A1");
        assert!(ledger.is_active());
        assert_eq!(
            ledger.entries(),
            &[
                LedgerEntry {
                    item_name: "Cola".to_string(),
                    tag_id: "c3a27b28".to_string(),
                    remaining_qty: 2,
                },
                LedgerEntry {
                    item_name: "Chips".to_string(),
                    tag_id: "99887766".to_string(),
                    remaining_qty: 1,
                },
            ]
        );
        assert_eq!(ledger.match_tag("c3a27b28").unwrap().item_name, "Cola");
        assert!(ledger.match_tag("00000000").is_none());
    }

    #[test]
    fn test_failed_parse_leaves_ledger_untouched() {
        let mut ledger = loaded();
        let before = ledger.clone();

        for body in [
            "not json",
            "[1,2,3]",
            r#"{"Cola":["c3a27b28",2]}"#,
            r#"{"orderId":7,"Cola":["c3a27b28",2]}"#,
            r#"{"orderId":"B2","Cola":["c3a27b28",2]"#,
        ] {
            assert!(ledger.parse(body).is_err(), "{body} should fail");
            assert_eq!(ledger, before);
        }
    }

    #[test]
    fn test_parse_errors_are_specific() {
        let mut ledger = PaymentLedger::new();
        assert!(matches!(ledger.parse("{"), Err(LedgerError::InvalidJson(_))));
        assert_eq!(ledger.parse("\"A1\""), Err(LedgerError::NotAnObject));
        assert_eq!(ledger.parse("{}"), Err(LedgerError::MissingOrderId));
    }

    #[test]
    fn test_malformed_entries_skipped_and_negative_clamped() {
        let mut ledger = PaymentLedger::new();
        ledger
            .parse(
                r#"{
                    "orderId": "A2",
                    "NoArray": "c3a27b28",
                    "Short": ["c3a27b28"],
                    "NumTag": [123, 1],
                    "FloatQty": ["11111111", 1.5],
                    "Negative": ["22222222", -4],
                    "Good": ["33333333", 3]
                }"#,
            )
            .unwrap();

        let names: Vec<_> = ledger.entries().iter().map(|e| e.item_name.as_str()).collect();
        assert_eq!(names, vec!["Negative", "Good"]);
        assert_eq!(ledger.match_tag("22222222").unwrap().remaining_qty, 0);
    }

    #[test]
    fn test_legacy_payment_id_alias() {
        let mut ledger = PaymentLedger::new();
        ledger.parse(r#"{"paymentId":"P9","Water":["aabbccdd",1]}"#).unwrap();
        assert_eq!(ledger.order_id(), "P9");
        assert_eq!(ledger.entries().len(), 1);
    }

    #[test]
    fn test_empty_order_id_is_inactive() {
        let mut ledger = PaymentLedger::new();
        ledger.parse(r#"{"orderId":""}"#).unwrap();
        assert!(!ledger.is_active());
    }

    #[test]
    fn test_duplicate_tags_first_match_wins() {
        let mut ledger = PaymentLedger::new();
        ledger
            .parse(r#"{"orderId":"A3","First":["c3a27b28",1],"Second":["c3a27b28",5]}"#)
            .unwrap();
        assert_eq!(ledger.entries().len(), 2);
        assert_eq!(ledger.match_tag("c3a27b28").unwrap().item_name, "First");
    }

    #[test]
    fn test_consume_never_goes_negative() {
        let mut ledger = loaded();
        assert_eq!(ledger.consume("99887766").unwrap().remaining_qty, 0);
        assert!(ledger.consume("99887766").is_none());
        assert_eq!(ledger.match_tag("99887766").unwrap().remaining_qty, 0);
        assert!(ledger.consume("unknown").is_none());
    }

    #[test]
    fn test_consume_moves_to_next_duplicate_with_stock() {
        let mut ledger = PaymentLedger::new();
        ledger
            .parse(r#"{"orderId":"A4","First":["c3a27b28",1],"Second":["c3a27b28",1]}"#)
            .unwrap();
        assert_eq!(ledger.consume("c3a27b28").unwrap().item_name, "First");
        assert_eq!(ledger.consume("c3a27b28").unwrap().item_name, "Second");
        assert!(ledger.consume("c3a27b28").is_none());
    }

    #[test]
    fn test_clear() {
        let mut ledger = loaded();
        ledger.clear();
        assert!(!ledger.is_active());
        assert!(ledger.entries().is_empty());
    }
}
