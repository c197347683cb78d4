use serde::{Deserialize, Serialize};

/// A payment transaction as published on the input topic.
///
/// Producers are not consistent about which optional fields they fill in, so
/// anything missing falls back to its default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: String,
    pub status: String,
    pub timestamp: String,
    pub payment_method: String,
    pub card_number: String,
    pub bank_name: String,
    pub merchant_id: String,
    pub merchant_name: String,
    pub location: String,
    pub description: String,
    pub category: String,
    pub invoice_number: String,
    pub reference_id: String,
    pub tax_amount: f64,
    pub discount: f64,
    pub net_amount: f64,
    pub ip_address: String,
    pub device_id: String,
}

/// The stored projection of a [`Transaction`]. Card, device and network
/// details never leave the input topic.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoredTransaction {
    #[serde(rename = "_id")]
    pub transaction_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: String,
    pub status: String,
    pub timestamp: String,
    pub payment_method: String,
}

impl From<Transaction> for StoredTransaction {
    fn from(tx: Transaction) -> Self {
        Self {
            transaction_id: tx.transaction_id,
            amount: tx.amount,
            currency: tx.currency,
            transaction_type: tx.transaction_type,
            status: tx.status,
            timestamp: tx.timestamp,
            payment_method: tx.payment_method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_drops_sensitive_fields() {
        let tx: Transaction = serde_json::from_value(json!({
            "transaction_id": "tx-1",
            "user_id": "u-9",
            "amount": 12.5,
            "currency": "EUR",
            "transaction_type": "purchase",
            "status": "completed",
            "timestamp": "2024-03-01T10:00:00Z",
            "payment_method": "card",
            "card_number": "4111111111111111",
            "ip_address": "10.0.0.1"
        }))
        .unwrap();

        let stored = StoredTransaction::from(tx);
        let encoded = serde_json::to_value(&stored).unwrap();

        assert_eq!(encoded["_id"], "tx-1");
        assert_eq!(encoded["amount"], 12.5);
        assert_eq!(encoded["payment_method"], "card");
        assert!(encoded.get("card_number").is_none());
        assert!(encoded.get("ip_address").is_none());
        assert!(encoded.get("user_id").is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let tx: Transaction = serde_json::from_str(r#"{"transaction_id":"tx-2"}"#).unwrap();

        assert_eq!(tx.transaction_id, "tx-2");
        assert_eq!(tx.amount, 0.0);
        assert!(tx.currency.is_empty());
    }
}
