use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMethod {
    Mpesa,
    Cash,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Success,
    Failed,
    Pending,
}

/// A fare payment collected on board, keyed by `matatu_id` on `matatu.fares`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FareEvent {
    pub transaction_id: String,
    pub matatu_id: String,
    pub passenger_id: String,
    pub amount_kes: Decimal,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
}

impl FareEvent {
    pub fn is_success(&self) -> bool {
        self.status == PaymentStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_method_serialize_uppercase() {
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Failed).unwrap(),
            "\"FAILED\""
        );
        assert_eq!(
            serde_json::to_string(&PaymentMethod::Mpesa).unwrap(),
            "\"MPESA\""
        );
    }

    #[test]
    fn test_fare_accepts_numeric_amount() {
        let json = r#"{
            "transactionId": "TXN-1001",
            "matatuId": "KBZ 123A",
            "passengerId": "PAX-7",
            "amountKes": 70,
            "paymentMethod": "CASH",
            "status": "SUCCESS",
            "timestamp": "2024-05-01T08:00:00Z"
        }"#;

        let fare: FareEvent = serde_json::from_str(json).unwrap();
        assert_eq!(fare.amount_kes, Decimal::from(70));
        assert!(fare.is_success());
    }
}
