// services/mpesa_service.rs
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::config::MpesaUrls;
use crate::errors::{AppError, Result};

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub expires_in: String,
}

// C2B Structs
#[derive(Debug, Clone, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode", default, deserialize_with = "string_or_number")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode", default, deserialize_with = "string_or_number")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: String,
    #[serde(rename = "ResultCode", default, deserialize_with = "string_or_number")]
    pub result_code: String,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
}

impl StkQueryResponse {
    pub fn is_complete(&self) -> bool {
        !self.merchant_request_id.is_empty()
            && !self.checkout_request_id.is_empty()
            && !self.result_code.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.result_code == "0" && self.result_desc.to_lowercase().contains("successfully")
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// The three Daraja calls the STK flows depend on.
#[async_trait]
pub trait DarajaApi: Send + Sync {
    async fn generate_token(&self, basic_token: &str) -> Result<String>;

    async fn stk_push(&self, access_token: &str, request: &StkPushRequest) -> Result<StkPushResponse>;

    async fn stk_query(&self, access_token: &str, request: &StkQueryRequest) -> Result<StkQueryResponse>;
}

#[derive(Debug, Clone)]
pub struct MpesaService {
    urls: MpesaUrls,
    client: Client,
}

impl MpesaService {
    pub fn new(urls: MpesaUrls) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(MpesaService { urls, client })
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        read_json(response).await
    }
}

/// Decodes a Daraja response, surfacing its `errorMessage` field, non-2xx
/// statuses and non-JSON bodies as M-Pesa errors.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    let body = response.text().await?;

    let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
        error!(%status, body = %body, "undecodable M-Pesa response");
        AppError::mpesa(format!("failed to decode mpesa response: {}", e))
    })?;

    if let Some(message) = value.get("errorMessage") {
        return Err(AppError::mpesa(format!(
            "error happened while calling mpesa: {}",
            message
        )));
    }
    if !status.is_success() {
        error!(%status, body = %body, "M-Pesa request failed");
        return Err(AppError::mpesa(format!("mpesa request failed: {}", status)));
    }
    if !content_type.starts_with("application/json") {
        return Err(AppError::mpesa("incorrect response content type from mpesa"));
    }

    serde_json::from_value(value)
        .map_err(|e| AppError::mpesa(format!("failed to decode mpesa response: {}", e)))
}

#[async_trait]
impl DarajaApi for MpesaService {
    async fn generate_token(&self, basic_token: &str) -> Result<String> {
        info!("Requesting new access token");

        let response = self
            .client
            .get(&self.urls.auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", basic_token))
            .send()
            .await?;

        let auth_response: AuthResponse = read_json(response).await?;
        if auth_response.access_token.trim().is_empty() {
            return Err(AppError::mpesa("empty access token"));
        }

        info!(expires_in = %auth_response.expires_in, "Access token obtained");
        Ok(auth_response.access_token)
    }

    async fn stk_push(&self, access_token: &str, request: &StkPushRequest) -> Result<StkPushResponse> {
        info!(phone = %request.phone_number, amount = %request.amount, "C2B: STK push");
        let response: StkPushResponse = self
            .post_json(&self.urls.stk_url, access_token, request)
            .await?;
        info!(checkout_id = %response.checkout_request_id, "C2B initiated");
        Ok(response)
    }

    async fn stk_query(&self, access_token: &str, request: &StkQueryRequest) -> Result<StkQueryResponse> {
        self.post_json(&self.urls.query_url, access_token, request).await
    }
}

/// `base64(consumer_key:consumer_secret)` for the token endpoint.
pub fn basic_token(consumer_key: &str, consumer_secret: &str) -> String {
    base64.encode(format!("{}:{}", consumer_key, consumer_secret))
}

pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

/// Daraja timestamps are East Africa Time.
pub fn daraja_timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(3))
        .naive_utc()
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// Normalizes Kenyan numbers to `+254XXXXXXXXX`. Anything unrecognized is
/// returned trimmed.
pub fn format_phone_number(phone: &str) -> String {
    let phone = phone.trim();
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    let all_digits = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());

    if !all_digits {
        return phone.to_string();
    }
    if digits.starts_with("254") && digits.len() == 12 {
        return format!("+{}", digits);
    }
    if phone.starts_with('+') {
        return phone.to_string();
    }
    if (digits.starts_with("07") || digits.starts_with("01")) && digits.len() == 10 {
        return format!("+254{}", &digits[1..]);
    }
    if (digits.starts_with('7') || digits.starts_with('1')) && digits.len() == 9 {
        return format!("+254{}", digits);
    }
    phone.to_string()
}

/// The MSISDN form Daraja expects in `PartyA` and `PhoneNumber`.
pub fn daraja_msisdn(phone: &str) -> String {
    phone.trim_start_matches('+').to_string()
}
