// services/credentials.rs
use std::sync::RwLock;
use tracing::{error, info};

use super::mpesa_service::{basic_token, DarajaApi};
use crate::errors::Result;

/// Daraja credentials. The basic token is derived once; the access token is
/// replaced wholesale on every successful refresh and read as a snapshot.
#[derive(Debug)]
pub struct Credentials {
    basic_token: String,
    access_token: RwLock<String>,
}

impl Credentials {
    pub fn new(consumer_key: &str, consumer_secret: &str) -> Self {
        Self {
            basic_token: basic_token(consumer_key, consumer_secret),
            access_token: RwLock::new(String::new()),
        }
    }

    pub fn basic_token(&self) -> &str {
        &self.basic_token
    }

    pub fn access_token(&self) -> String {
        match self.access_token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token().is_empty()
    }

    pub fn set_access_token(&self, token: String) {
        match self.access_token.write() {
            Ok(mut current) => *current = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Fetches a new access token. On failure the previous token stays in
    /// place and the error is returned.
    pub async fn refresh(&self, api: &dyn DarajaApi) -> Result<()> {
        match api.generate_token(&self.basic_token).await {
            Ok(token) => {
                self.set_access_token(token);
                info!("M-Pesa access token refreshed");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to refresh M-Pesa access token");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::services::mpesa_service::{
        StkPushRequest, StkPushResponse, StkQueryRequest, StkQueryResponse,
    };
    use async_trait::async_trait;

    struct TokenOnly(Option<&'static str>);

    #[async_trait]
    impl DarajaApi for TokenOnly {
        async fn generate_token(&self, _basic_token: &str) -> Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| AppError::mpesa("auth failed"))
        }

        async fn stk_push(&self, _: &str, _: &StkPushRequest) -> Result<StkPushResponse> {
            unreachable!()
        }

        async fn stk_query(&self, _: &str, _: &StkQueryRequest) -> Result<StkQueryResponse> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_token() {
        let credentials = Credentials::new("key", "secret");
        assert!(!credentials.has_access_token());

        credentials.refresh(&TokenOnly(Some("tok-1"))).await.unwrap();
        assert_eq!(credentials.access_token(), "tok-1");

        assert!(credentials.refresh(&TokenOnly(None)).await.is_err());
        assert_eq!(credentials.access_token(), "tok-1");
    }

    #[test]
    fn basic_token_is_derived_from_consumer_pair() {
        let credentials = Credentials::new("key", "secret");
        assert_eq!(credentials.basic_token(), "a2V5OnNlY3JldA==");
    }
}
