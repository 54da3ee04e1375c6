//! Source-specific payload parsers.
//!
//! Parsers only interpret; they never touch invoices. Every payload maps to
//! a ping, an ignorable notice, or a payment notice.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use podledger_invoicing::PaymentMethod;

use super::{WebhookError, WebhookSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotice {
    /// Gateway-side reference used for idempotency.
    pub reference: String,
    pub amount: u64,
    /// Free-text transfer description; may carry an invoice number.
    pub description: String,
    pub outcome: PaymentOutcome,
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedWebhook {
    /// Connectivity check without payment data.
    Ping,
    Ignored(String),
    Payment(PaymentNotice),
}

pub fn parse(source: WebhookSource, raw: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    match source {
        WebhookSource::PayOs => parse_payos(raw),
        WebhookSource::Sepay => parse_sepay(raw),
    }
}

#[derive(Debug, Deserialize)]
struct PayOsBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    data: Option<PayOsData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayOsData {
    order_code: JsonValue,
    amount: u64,
    #[serde(default)]
    description: Option<String>,
}

fn parse_payos(raw: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    let body: PayOsBody =
        serde_json::from_slice(raw).map_err(|e| WebhookError::Malformed(e.to_string()))?;

    let Some(data) = body.data else {
        return Ok(ParsedWebhook::Ping);
    };

    // orderCode arrives as a number from the gateway, as a string from some SDKs.
    let reference = match &data.order_code {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(WebhookError::Malformed("orderCode is missing".to_string())),
    };

    let outcome = match body.code.as_deref() {
        Some("00") => PaymentOutcome::Succeeded,
        _ => PaymentOutcome::Failed(body.desc.unwrap_or_else(|| "gateway reported failure".into())),
    };

    Ok(ParsedWebhook::Payment(PaymentNotice {
        reference,
        amount: data.amount,
        description: data.description.unwrap_or_default(),
        outcome,
        method: PaymentMethod::PaymentLink,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SepayBody {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    transfer_type: Option<String>,
    #[serde(default)]
    transfer_amount: Option<u64>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reference_code: Option<String>,
}

fn parse_sepay(raw: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    let body: SepayBody =
        serde_json::from_slice(raw).map_err(|e| WebhookError::Malformed(e.to_string()))?;

    let Some(amount) = body.transfer_amount else {
        return Ok(ParsedWebhook::Ping);
    };

    if body
        .transfer_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("out"))
    {
        return Ok(ParsedWebhook::Ignored("outgoing transfer".to_string()));
    }

    let reference = body
        .reference_code
        .filter(|r| !r.trim().is_empty())
        .or_else(|| match body.id {
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            Some(JsonValue::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        })
        .ok_or_else(|| WebhookError::Malformed("transfer has no reference".to_string()))?;

    Ok(ParsedWebhook::Payment(PaymentNotice {
        reference: format!("sepay:{reference}"),
        amount,
        description: body.content.unwrap_or_default(),
        outcome: PaymentOutcome::Succeeded,
        method: PaymentMethod::BankTransfer,
    }))
}

/// Invoice number embedded in a transfer description.
///
/// Bank apps strip punctuation, so both sides are compared alphanumerically
/// and case-insensitively.
pub fn mentions_invoice(description: &str, invoice_number: &str) -> bool {
    let wanted = normalize_invoice_text(invoice_number);
    !wanted.is_empty() && normalize_invoice_text(description).contains(&wanted)
}

/// Uppercase alphanumerics only; the form invoice numbers are matched in.
pub fn normalize_invoice_text(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
