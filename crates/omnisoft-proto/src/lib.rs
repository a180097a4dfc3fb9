//! Omnisoft terminal wire protocol.
//!
//! Every call is a JSON `POST` to `http://{ip}:{port}/v2` carrying a
//! [`TerminalRequest`]. The operation is selected by `requestData.checkData.check_type`
//! and document operations (sale, rollback, ...) carry their payload under
//! `requestData.tokenData.parameters`.
//!
//! Envelopes arrive from upstream as opaque JSON, so every struct here keeps
//! unknown fields in a flattened `extra` map and writes them back unchanged.

pub mod sanitize;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const API_VERSION: &str = "v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckType(pub u16);

impl CheckType {
    pub const SALE: Self = Self(1);
    pub const DEPOSIT: Self = Self(7);
    pub const WITHDRAW: Self = Self(8);
    pub const ROLLBACK: Self = Self(10);
    pub const RECEIPT_COPY: Self = Self(11);
    pub const X_REPORT: Self = Self(12);
    pub const CLOSE_SHIFT: Self = Self(13);
    pub const SHIFT_STATUS: Self = Self(14);
    pub const OPEN_SHIFT: Self = Self(15);
    pub const REPRINT: Self = Self(16);
    pub const HISTORY: Self = Self(17);
    pub const STATEMENT: Self = Self(18);
    pub const CORRECTION: Self = Self(19);
    pub const OPEN_MONEY_BOX: Self = Self(28);
    pub const CLOSE_MONEY_BOX: Self = Self(29);
    pub const CREDIT_PAY: Self = Self(31);
    pub const CREDIT_PAY_ROLLBACK: Self = Self(32);
    pub const PREPAY: Self = Self(34);
    pub const LOGIN: Self = Self(40);
    pub const GET_INFO: Self = Self(41);
    pub const MONEY_BACK: Self = Self(100);
}

/// Document kind carried in `tokenData.parameters.doc_type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Sale,
    Rollback,
    MoneyBack,
    Prepay,
    Creditpay,
    Correction,
    Deposit,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRequest {
    pub request_data: RequestData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// Replaced with the device token before sending, so a malformed upstream
    /// value is simply dropped.
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "checkData", default, skip_serializing_if = "Option::is_none")]
    pub check_data: Option<CheckData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "tokenData", default, skip_serializing_if = "Option::is_none")]
    pub token_data: Option<TokenData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    pub check_type: CheckType,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<DocumentParameters>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    /// Receipt reference assigned by the tax backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_ref: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DocumentData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Item>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_ref: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A receipt line item.
///
/// Only the amounts quantity correction works with are modelled, and they are
/// kept as raw JSON so whatever upstream sent is written back untouched.
/// Names, codes (`itemCodeType` 0 plain, 1 EAN8, 2 EAN13, 3 service, 5 credit
/// payment), VAT, discounts and margins ride along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_quantity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_price: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_sum: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn quantity(&self) -> Option<f64> {
        self.item_quantity.as_ref().and_then(amount)
    }

    pub fn price(&self) -> Option<f64> {
        self.item_price.as_ref().and_then(amount)
    }

    pub fn sum(&self) -> Option<f64> {
        self.item_sum.as_ref().and_then(amount)
    }

    /// Non-finite quantities cannot be written as JSON and leave the item as is.
    pub fn set_quantity(&mut self, quantity: f64) {
        if let Some(number) = serde_json::Number::from_f64(quantity) {
            self.item_quantity = Some(Value::Number(number));
        }
    }
}

impl TerminalRequest {
    fn with_check_type(check_type: CheckType) -> Self {
        Self {
            request_data: RequestData {
                check_data: Some(CheckData {
                    check_type,
                    extra: Map::new(),
                }),
                ..RequestData::default()
            },
            extra: Map::new(),
        }
    }

    pub fn login(name: impl Into<String>, password: impl Into<String>) -> Self {
        let mut request = Self::with_check_type(CheckType::LOGIN);
        request.request_data.name = Some(name.into());
        request.request_data.password = Some(password.into());
        request
    }

    pub fn info(access_token: impl Into<String>) -> Self {
        let mut request = Self::with_check_type(CheckType::GET_INFO);
        request.request_data.access_token = Some(access_token.into());
        request
    }

    pub fn check_type(&self) -> Option<CheckType> {
        self.request_data
            .check_data
            .as_ref()
            .map(|check| check.check_type)
    }

    pub fn parameters(&self) -> Option<&DocumentParameters> {
        self.request_data
            .token_data
            .as_ref()
            .and_then(|token| token.parameters.as_ref())
    }

    pub fn parameters_mut(&mut self) -> Option<&mut DocumentParameters> {
        self.request_data
            .token_data
            .as_mut()
            .and_then(|token| token.parameters.as_mut())
    }

    pub fn doc_type(&self) -> Option<&DocType> {
        self.parameters().and_then(|params| params.doc_type.as_ref())
    }

    pub fn items_mut(&mut self) -> Option<&mut Vec<Item>> {
        self.parameters_mut()
            .and_then(|params| params.data.as_mut())
            .and_then(|data| data.items.as_mut())
    }

    /// The backend's receipt reference, looked up on the parameters first and
    /// then on the document data.
    pub fn receipt_ref(&self) -> Option<String> {
        let params = self.parameters()?;
        params
            .int_ref
            .as_ref()
            .and_then(identifier)
            .or_else(|| {
                params
                    .data
                    .as_ref()
                    .and_then(|data| data.int_ref.as_ref())
                    .and_then(identifier)
            })
    }

    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.request_data.access_token = Some(token.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalResponse {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_number: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int_ref: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TerminalResponse {
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }

    /// Fiscal identifier (`long_id`) issued for a registered document.
    pub fn fiscal_id(&self) -> Option<String> {
        self.long_id
            .as_ref()
            .and_then(identifier)
            .or_else(|| self.data_field("long_id"))
    }

    /// Receipt number echoed back by the terminal, if any.
    pub fn echoed_receipt_id(&self) -> Option<String> {
        self.document_number
            .as_ref()
            .and_then(identifier)
            .or_else(|| self.int_ref.as_ref().and_then(identifier))
            .or_else(|| self.data_field("document_number"))
            .or_else(|| self.data_field("int_ref"))
    }

    fn data_field(&self, key: &str) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(identifier)
    }
}

/// Reads a string or numeric identifier; empty strings and other JSON kinds
/// yield `None`.
pub fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Reads a JSON number or a numeric string.
pub fn amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// A field of the wrong JSON type reads as absent instead of failing the
/// whole message.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}
