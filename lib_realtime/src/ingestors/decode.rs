//! Stream payload decoding.
//!
//! Producers publish either a JSON array of records or a single record
//! object. The array form is tried first.

use thiserror::Error;

use crate::models::Record;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is neither a record array nor a record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decodes one message payload into the records it carries.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if let Ok(records) = serde_json::from_slice::<Vec<Record>>(payload) {
        return Ok(records);
    }
    let single = serde_json::from_slice::<Record>(payload)?;
    Ok(vec![single])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_yields_one_record() {
        let records = decode_payload(br#"{"id":7,"t":1,"pos":{"x":76.9,"y":43.2}}"#).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].unit_id, 7);
        assert_eq!(records[0].record_type, 1);
    }

    #[test]
    fn array_yields_each_record_in_order() {
        let records = decode_payload(br#"[{"id":1},{"id":2,"address":"Abay ave 10"}]"#).unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.unit_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(records[1].address.as_deref(), Some("Abay ave 10"));
    }

    #[test]
    fn null_pos_or_params_still_decode() {
        let records = decode_payload(br#"{"id":5,"params":null}"#).unwrap();
        assert_eq!(records[0].unit_id, 5);

        let records = decode_payload(br#"[{"id":5,"pos":null},{"id":6}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pos.x, 0.0);
    }

    #[test]
    fn empty_array_yields_nothing() {
        assert!(decode_payload(b"[]").unwrap().is_empty());
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(decode_payload(b"{not json").is_err());
        assert!(decode_payload(br#"{"t":1}"#).is_err());
        assert!(decode_payload(br#"[{"id":1},{"t":2}]"#).is_err());
        assert!(decode_payload(b"42").is_err());
    }
}
