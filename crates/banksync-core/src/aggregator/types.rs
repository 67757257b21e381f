//! Aggregator wire types

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Accept identifiers sent either as JSON strings or numbers
pub fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}

/// Optional variant of [`string_or_number`]
pub fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "string_or_number")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

/// A short-lived bearer token for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token is still usable `margin` from now
    pub fn is_valid_for(&self, margin: chrono::Duration) -> bool {
        self.expires_at - margin > Utc::now()
    }
}

/// Token endpoint response; either an absolute expiry or a TTL in seconds
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn into_token(self) -> AccessToken {
        let expires_at = self
            .expires_at
            .or_else(|| self.expires_in.map(|s| Utc::now() + chrono::Duration::seconds(s)))
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(2));
        AccessToken {
            token: self.access_token,
            expires_at,
        }
    }
}

/// Paginated list envelope
#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceList<T> {
    pub resources: Vec<T>,
}

/// An account resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteAccount {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default, alias = "currency")]
    pub currency_code: Option<String>,
    #[serde(default, rename = "type")]
    pub account_type: Option<String>,
    #[serde(default)]
    pub iban: Option<String>,
    /// Everything else the provider sends, kept as account metadata
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteAccount {
    pub fn new(id: &str, name: &str, balance: f64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            balance,
            currency_code: Some("EUR".to_string()),
            account_type: Some("checking".to_string()),
            iban: None,
            extra: serde_json::Map::new(),
        }
    }

    /// IBAN with everything but the country code and last four characters hidden
    pub fn masked_iban(&self) -> Option<String> {
        let iban: String = self.iban.as_deref()?.chars().filter(|c| !c.is_whitespace()).collect();
        let len = iban.chars().count();
        if len <= 6 {
            return Some("*".repeat(len));
        }
        let head: String = iban.chars().take(2).collect();
        let tail: String = iban.chars().skip(len - 4).collect();
        Some(format!("{}{}{}", head, "*".repeat(len - 6), tail))
    }
}

/// A transaction resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTransaction {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub amount: f64,
    #[serde(default)]
    pub clean_description: Option<String>,
    #[serde(default)]
    pub provider_description: Option<String>,
    /// Booking date
    pub date: NaiveDate,
    #[serde(default)]
    pub transaction_date: Option<NaiveDate>,
    #[serde(default)]
    pub value_date: Option<NaiveDate>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    /// Aggregator category hint (e.g. "food", "transport")
    #[serde(default, alias = "category")]
    pub merchant_category: Option<String>,
    #[serde(default)]
    pub balance_after: Option<f64>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteTransaction {
    pub fn new(id: &str, amount: f64, description: &str, date: NaiveDate) -> Self {
        Self {
            id: id.to_string(),
            amount,
            clean_description: Some(description.to_string()),
            provider_description: None,
            date,
            transaction_date: None,
            value_date: None,
            merchant_name: None,
            merchant_category: None,
            balance_after: None,
            deleted: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn description(&self) -> String {
        self.clean_description
            .as_deref()
            .or(self.provider_description.as_deref())
            .unwrap_or("")
            .trim()
            .to_string()
    }

    /// The date the movement happened, falling back to the booking date
    pub fn effective_date(&self) -> NaiveDate {
        self.transaction_date.unwrap_or(self.date)
    }
}

/// Item status resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemStatus {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, alias = "status_code")]
    pub status: Option<i64>,
    #[serde(default)]
    pub status_code_info: Option<String>,
    #[serde(default)]
    pub status_code_description: Option<String>,
    #[serde(default, alias = "provider")]
    pub provider_name: Option<String>,
    #[serde(default, alias = "bank")]
    pub bank_name: Option<String>,
}

impl ItemStatus {
    pub fn healthy(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: Some(0),
            status_code_info: Some("OK".to_string()),
            status_code_description: None,
            provider_name: None,
            bank_name: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        is_success_code(self.status, self.status_code_info.as_deref())
    }

    /// Human readable failure reason for lifecycle bookkeeping
    pub fn describe(&self) -> String {
        describe_status(
            self.status,
            self.status_code_info.as_deref(),
            self.status_code_description.as_deref(),
        )
    }
}

/// Status code 0 or an "OK" info string both mean the item refreshed fine
pub fn is_success_code(code: Option<i64>, info: Option<&str>) -> bool {
    code == Some(0) || info.is_some_and(|i| i.eq_ignore_ascii_case("ok"))
}

pub fn describe_status(code: Option<i64>, info: Option<&str>, description: Option<&str>) -> String {
    let code = code.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string());
    match (info, description) {
        (Some(info), Some(desc)) => format!("status {} ({}): {}", code, info, desc),
        (Some(info), None) => format!("status {} ({})", code, info),
        (None, Some(desc)) => format!("status {}: {}", code, desc),
        (None, None) => format!("status {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_accept_numbers_and_strings() {
        let tx: RemoteTransaction = serde_json::from_str(
            r#"{"id": 123456, "amount": -12.3, "clean_description": "Carrefour", "date": "2024-03-01"}"#,
        )
        .unwrap();
        assert_eq!(tx.id, "123456");

        let tx: RemoteTransaction = serde_json::from_str(
            r#"{"id": "abc", "amount": 5, "provider_description": "VIR", "date": "2024-03-01"}"#,
        )
        .unwrap();
        assert_eq!(tx.id, "abc");
        assert_eq!(tx.description(), "VIR");
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let account: RemoteAccount = serde_json::from_str(
            r#"{"id": 7, "name": "Compte courant", "balance": 120.5, "type": "checking", "provider_id": 574}"#,
        )
        .unwrap();
        assert_eq!(account.extra.get("provider_id"), Some(&serde_json::json!(574)));
    }

    #[test]
    fn test_masked_iban() {
        let mut account = RemoteAccount::new("1", "Compte", 0.0);
        account.iban = Some("FR76 3000 6000 0112 3456 7890 189".to_string());
        let masked = account.masked_iban().unwrap();
        assert!(masked.starts_with("FR"));
        assert!(masked.ends_with("0189"));
        assert!(!masked.contains("3000"));
    }

    #[test]
    fn test_success_codes() {
        assert!(is_success_code(Some(0), None));
        assert!(is_success_code(None, Some("OK")));
        assert!(!is_success_code(Some(402), Some("invalid_credentials")));
        assert!(!is_success_code(None, None));
    }

    #[test]
    fn test_token_ttl() {
        let token = TokenResponse {
            access_token: "t".to_string(),
            expires_at: None,
            expires_in: Some(7200),
        }
        .into_token();
        assert!(token.is_valid_for(chrono::Duration::minutes(5)));
        assert!(!token.is_valid_for(chrono::Duration::hours(3)));
    }
}
