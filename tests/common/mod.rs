#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stk_api::config::MpesaSettings;
use stk_api::database::{InMemoryEventBus, InMemoryRequestCache, InMemoryTransactionStore};
use stk_api::errors::{AppError, Result};
use stk_api::middleware::auth::{AuthApi, Claims};
use stk_api::models::callback::StkCallbackPayload;
use stk_api::models::{InitiateStkRequest, PublishInfo};
use stk_api::services::credentials::Credentials;
use stk_api::services::mpesa_service::{
    DarajaApi, StkPushRequest, StkPushResponse, StkQueryRequest, StkQueryResponse,
};
use stk_api::services::stk_service::StkService;

pub const ADMIN_GROUP: &str = "admin";

/// What the fake network answers to the next push.
#[derive(Debug, Clone)]
pub enum PushScript {
    Accept(String),
    MissingCheckout,
    Error(String),
    Hang,
}

/// What the fake network answers to a status query for one checkout id.
#[derive(Debug, Clone)]
pub enum QueryScript {
    Paid,
    Cancelled,
    Error,
}

/// Scripted Daraja API. Pushes are answered in order, queries by checkout id
/// (paid when unscripted).
pub struct FakeDaraja {
    pushes: Mutex<VecDeque<PushScript>>,
    queries: Mutex<HashMap<String, QueryScript>>,
    token: Mutex<Option<String>>,
    pub push_requests: Mutex<Vec<StkPushRequest>>,
    pub query_requests: Mutex<Vec<StkQueryRequest>>,
    pub query_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for FakeDaraja {
    fn default() -> Self {
        Self {
            pushes: Mutex::new(VecDeque::new()),
            queries: Mutex::new(HashMap::new()),
            token: Mutex::new(Some("fresh-token".to_string())),
            push_requests: Mutex::new(Vec::new()),
            query_requests: Mutex::new(Vec::new()),
            query_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }
}

impl FakeDaraja {
    pub fn script_push(&self, script: PushScript) {
        self.pushes.lock().unwrap().push_back(script);
    }

    pub fn script_query(&self, checkout_id: &str, script: QueryScript) {
        self.queries
            .lock()
            .unwrap()
            .insert(checkout_id.to_string(), script);
    }

    pub fn set_token(&self, token: Option<&str>) {
        *self.token.lock().unwrap() = token.map(str::to_string);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }

    pub fn query_count(&self) -> usize {
        self.query_requests.lock().unwrap().len()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DarajaApi for FakeDaraja {
    async fn generate_token(&self, _basic_token: &str) -> Result<String> {
        self.token
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| AppError::mpesa("mpesa request failed: 400 Bad Request"))
    }

    async fn stk_push(&self, _access_token: &str, request: &StkPushRequest) -> Result<StkPushResponse> {
        self.push_requests.lock().unwrap().push(request.clone());
        let script = self
            .pushes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PushScript::Accept("ws_default".to_string()));

        match script {
            PushScript::Accept(checkout) => Ok(StkPushResponse {
                merchant_request_id: format!("m-{}", checkout),
                checkout_request_id: checkout,
                response_code: "0".into(),
                response_description: "Success. Request accepted for processing".into(),
                customer_message: "Success. Request accepted for processing".into(),
            }),
            PushScript::MissingCheckout => Ok(StkPushResponse {
                merchant_request_id: "m-1".into(),
                response_code: "0".into(),
                ..Default::default()
            }),
            PushScript::Error(message) => Err(AppError::mpesa(message)),
            PushScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AppError::mpesa("unreachable"))
            }
        }
    }

    async fn stk_query(&self, _access_token: &str, request: &StkQueryRequest) -> Result<StkQueryResponse> {
        self.query_requests.lock().unwrap().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let script = self
            .queries
            .lock()
            .unwrap()
            .get(&request.checkout_request_id)
            .cloned()
            .unwrap_or(QueryScript::Paid);

        let (code, desc) = match script {
            QueryScript::Paid => ("0", "The service request is processed successfully."),
            QueryScript::Cancelled => ("1032", "Request cancelled by user"),
            QueryScript::Error => return Err(AppError::mpesa("The transaction is being processed")),
        };
        Ok(StkQueryResponse {
            merchant_request_id: format!("m-{}", request.checkout_request_id),
            checkout_request_id: request.checkout_request_id.clone(),
            response_code: "0".into(),
            response_description: "The service request has been accepted successsfully".into(),
            result_code: code.into(),
            result_desc: desc.into(),
        })
    }
}

pub struct Harness {
    pub service: StkService,
    pub store: InMemoryTransactionStore,
    pub cache: InMemoryRequestCache,
    pub bus: InMemoryEventBus,
    pub api: Arc<FakeDaraja>,
    pub credentials: Arc<Credentials>,
    pub auth: Arc<AuthApi>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_push_timeout(Duration::from_secs(15))
    }

    pub fn with_push_timeout(push_timeout: Duration) -> Self {
        let store = InMemoryTransactionStore::new();
        let cache = InMemoryRequestCache::new();
        let bus = InMemoryEventBus::new();
        let api = Arc::new(FakeDaraja::default());
        let credentials = Arc::new(Credentials::new("key", "secret"));
        credentials.set_access_token("test-token".to_string());
        let auth = Arc::new(AuthApi::new("test-secret", vec![ADMIN_GROUP.to_string()]));

        let mut settings = MpesaSettings::new(
            "174379",
            "ACME",
            "passkey",
            "https://example.com/api/mpesa/callback",
        );
        settings.push_timeout = push_timeout;

        let service = StkService::new(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            Arc::new(bus.clone()),
            api.clone(),
            credentials.clone(),
            settings,
            auth.clone(),
        );

        Self {
            service,
            store,
            cache,
            bus,
            api,
            credentials,
            auth,
        }
    }

    /// Initiates and waits for the detached push to be recorded.
    pub async fn initiate(&self, request: InitiateStkRequest) -> i64 {
        let initiated = self.service.initiate(request).await.unwrap();
        initiated.task.await.unwrap();
        initiated.transaction.id
    }

    /// Initiates a push the network accepts under `checkout_id`.
    pub async fn accepted(&self, phone: &str, checkout_id: &str) -> i64 {
        self.api.script_push(PushScript::Accept(checkout_id.to_string()));
        self.initiate(request(phone)).await
    }
}

pub fn admin() -> Claims {
    Claims {
        sub: "admin-1".into(),
        group: ADMIN_GROUP.into(),
        exp: usize::MAX,
    }
}

pub fn user(sub: &str) -> Claims {
    Claims {
        sub: sub.into(),
        group: "users".into(),
        exp: usize::MAX,
    }
}

pub fn request(phone: &str) -> InitiateStkRequest {
    InitiateStkRequest {
        initiator_id: "user-1".into(),
        initiator_customer_reference: "cust-1".into(),
        initiator_customer_names: "Jane Doe".into(),
        phone: phone.into(),
        amount: dec!(100),
        account_reference: "INV-1".into(),
        ..Default::default()
    }
}

pub fn publishing_request(phone: &str, channel: &str, only_on_success: bool) -> InitiateStkRequest {
    InitiateStkRequest {
        publish: true,
        publish_message: Some(PublishInfo {
            only_on_success,
            channel_name: channel.into(),
            payload: HashMap::from([("order".to_string(), "42".to_string())]),
        }),
        ..request(phone)
    }
}

pub fn success_callback(checkout_id: &str, receipt: &str) -> StkCallbackPayload {
    serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": format!("m-{}", checkout_id),
                "CheckoutRequestID": checkout_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 100},
                        {"Name": "MpesaReceiptNumber", "Value": receipt},
                        {"Name": "TransactionDate", "Value": 20240301101500u64},
                        {"Name": "PhoneNumber", "Value": 254712345678u64}
                    ]
                }
            }
        }
    }))
    .unwrap()
}

pub fn failed_callback(checkout_id: &str, result_code: i32) -> StkCallbackPayload {
    serde_json::from_value(serde_json::json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": format!("m-{}", checkout_id),
                "CheckoutRequestID": checkout_id,
                "ResultCode": result_code,
                "ResultDesc": "Request cancelled by user"
            }
        }
    }))
    .unwrap()
}
