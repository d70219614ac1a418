use crate::config::Config;
use crate::model::{PayoutMethod, PayoutRecord};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a provider dispatch. A missing id is legal (cash payouts have
/// no external reference).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub provider_payout_id: Option<String>,
}

/// Boundary component translating a payout record into an external
/// payment-rail call. One implementation per payout method.
#[async_trait]
pub trait PayoutProvider: Send + Sync {
    async fn execute(&self, record: &PayoutRecord) -> Result<ProviderReceipt>;
}

/// Adapter lookup keyed by payout method. The scheduler selects an adapter
/// here and never branches on the method itself.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<PayoutMethod, Arc<dyn PayoutProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(
            PayoutMethod::LinePay,
            Arc::new(LinePayProvider::from_config(cfg)?),
        );
        registry.register(
            PayoutMethod::BankTransfer,
            Arc::new(BankTransferProvider::from_config(cfg)?),
        );
        registry.register(PayoutMethod::Cash, Arc::new(CashProvider));
        Ok(registry)
    }

    pub fn register(&mut self, method: PayoutMethod, adapter: Arc<dyn PayoutProvider>) {
        self.adapters.insert(method, adapter);
    }

    pub fn get(&self, method: PayoutMethod) -> Option<Arc<dyn PayoutProvider>> {
        self.adapters.get(&method).cloned()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("methods", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// LINE Pay disbursement client.
#[derive(Clone)]
pub struct LinePayProvider {
    http: Client,
    base_url: Url,
    channel_id: String,
    channel_secret: String,
}

impl fmt::Debug for LinePayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinePayProvider")
            .field("base_url", &self.base_url)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl LinePayProvider {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.providers.line_pay.base_url)
            .context("invalid LINE Pay base URL")?;
        Ok(Self::with_base_url(
            cfg.providers.line_pay.channel_id.clone(),
            cfg.providers.line_pay.channel_secret.clone(),
            base_url,
        ))
    }

    pub fn with_base_url(channel_id: String, channel_secret: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("payout-engine/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            channel_id,
            channel_secret,
        }
    }

    pub fn build_request(&self, record: &PayoutRecord) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v3/disbursements")
            .context("invalid LINE Pay base URL")?;
        self.http
            .post(endpoint)
            .header("X-LINE-ChannelId", &self.channel_id)
            .header("X-LINE-ChannelSecret", &self.channel_secret)
            .header("Content-Type", "application/json")
            .json(&disbursement_body(record))
            .build()
            .context("failed to build LINE Pay request")
    }
}

pub fn disbursement_body(record: &PayoutRecord) -> Value {
    json!({
        "targetUserId": record.target_identifier,
        "amount": record.amount,
        "description": record.description,
        "orderId": record.id,
    })
}

#[derive(Deserialize)]
struct DisbursementResponse {
    #[serde(rename = "disbursementId")]
    disbursement_id: String,
}

#[async_trait]
impl PayoutProvider for LinePayProvider {
    async fn execute(&self, record: &PayoutRecord) -> Result<ProviderReceipt> {
        let request = self.build_request(record)?;
        debug!(url = %request.url(), payout_id = %record.id, "sending LINE Pay disbursement");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach LINE Pay")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from LINE Pay: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("LINE Pay error {}: {}", status, body));
        }

        let payload: DisbursementResponse =
            res.json().await.context("invalid LINE Pay response")?;
        Ok(ProviderReceipt {
            provider_payout_id: Some(payload.disbursement_id),
        })
    }
}

/// Bank-transfer rail client.
#[derive(Clone)]
pub struct BankTransferProvider {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for BankTransferProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankTransferProvider")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BankTransferProvider {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.providers.bank_transfer.base_url)
            .context("invalid bank-transfer base URL")?;
        Ok(Self::with_base_url(
            cfg.providers.bank_transfer.api_key.clone(),
            base_url,
        ))
    }

    pub fn with_base_url(api_key: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("payout-engine/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    pub fn build_request(&self, record: &PayoutRecord) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/transfers")
            .context("invalid bank-transfer base URL")?;
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&transfer_body(record))
            .build()
            .context("failed to build bank-transfer request")
    }
}

pub fn transfer_body(record: &PayoutRecord) -> Value {
    json!({
        "account": record.target_identifier,
        "amount": record.amount,
        "memo": record.description,
        "idempotencyKey": record.id,
    })
}

#[derive(Deserialize)]
struct TransferResponse {
    #[serde(rename = "transferId")]
    transfer_id: String,
}

#[async_trait]
impl PayoutProvider for BankTransferProvider {
    async fn execute(&self, record: &PayoutRecord) -> Result<ProviderReceipt> {
        let request = self.build_request(record)?;
        debug!(url = %request.url(), payout_id = %record.id, "sending bank transfer");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach bank-transfer rail")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("bank-transfer error {}: {}", status, body));
        }

        let payload: TransferResponse = res
            .json()
            .await
            .context("invalid bank-transfer response")?;
        Ok(ProviderReceipt {
            provider_payout_id: Some(payload.transfer_id),
        })
    }
}

/// Cash payouts are settled at the register; there is no external call to
/// make, so dispatch always succeeds with no provider reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct CashProvider;

#[async_trait]
impl PayoutProvider for CashProvider {
    async fn execute(&self, record: &PayoutRecord) -> Result<ProviderReceipt> {
        debug!(payout_id = %record.id, amount = record.amount, "cash payout recorded");
        Ok(ProviderReceipt::default())
    }
}
