//! HTTP client for the KMS/HSM signing proxy.
//!
//! Wire contract:
//! - `POST {endpoint}/sign` body `{"payload_b64": ..., "key_id"?: ...}` and a
//!   2xx response of `{"signature_b64": ..., "signer_id": ...}`.
//! - `POST {endpoint}/verify` body `{payload_b64, signature_b64, signer_id}`
//!   and a 2xx response of `{"verified": bool}`.
//!
//! Any non-2xx status, transport error, or missing response field is a
//! failure. Transport errors and 5xx responses are retried exactly once with
//! exponential backoff. When fail-closed, failures propagate; otherwise the
//! configured dev fallback signer takes over.

use {
    super::{SignatureRecord, Signer, SignerError},
    crate::config::SigningConfig,
    async_trait::async_trait,
    base64::{engine::general_purpose::STANDARD, Engine as _},
    reqwest::Client,
    serde::{Deserialize, Serialize},
    std::{fs, sync::Arc, time::Duration},
    tokio_retry::{
        strategy::{jitter, ExponentialBackoff},
        RetryIf,
    },
};

pub struct KmsSigner {
    endpoint: String,
    key_id: Option<String>,
    api_key: Option<String>,
    client: Client,
    fail_closed: bool,
    fallback: Option<Arc<dyn Signer>>,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    payload_b64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_id: Option<&'a str>,
}

#[derive(Deserialize)]
struct SignResponse {
    signature_b64: Option<String>,
    signer_id: Option<String>,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    payload_b64: String,
    signature_b64: &'a str,
    signer_id: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    verified: Option<bool>,
}

impl KmsSigner {
    /// Build the proxy client. Client construction failure here must abort
    /// startup: a configured endpoint with an unusable HTTP client is a
    /// misconfiguration, not something to discover on the first request.
    pub fn new(
        endpoint: &str,
        cfg: &SigningConfig,
        fail_closed: bool,
        fallback: Option<Arc<dyn Signer>>,
    ) -> Result<Self, SignerError> {
        let mut builder = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms));

        if let (Some(cert), Some(key)) = (&cfg.client_cert, &cfg.client_key) {
            let mut pem = fs::read(cert)
                .map_err(|e| SignerError::Config(format!("cannot read client cert: {e}")))?;
            pem.extend(
                fs::read(key)
                    .map_err(|e| SignerError::Config(format!("cannot read client key: {e}")))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| SignerError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        if let Some(ca) = &cfg.ca_cert {
            let pem = fs::read(ca)
                .map_err(|e| SignerError::Config(format!("cannot read CA cert: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| SignerError::Config(format!("invalid CA cert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| SignerError::Config(format!("cannot build http client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key_id: cfg.key_id.clone(),
            api_key: cfg.api_key.clone(),
            client,
            fail_closed,
            fallback,
        })
    }

    fn retryable(err: &SignerError) -> bool {
        match err {
            SignerError::Transport(_) => true,
            SignerError::Rejected { status } => *status >= 500,
            _ => false,
        }
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        // A single retry; the caller-facing bound stays timeout + backoff.
        ExponentialBackoff::from_millis(200).map(jitter).take(1)
    }

    async fn sign_once(&self, payload: &[u8]) -> Result<SignatureRecord, SignerError> {
        let body = SignRequest {
            payload_b64: STANDARD.encode(payload),
            key_id: self.key_id.as_deref(),
        };

        let mut req = self.client.post(format!("{}/sign", self.endpoint));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SignerError::Rejected {
                status: status.as_u16(),
            });
        }

        let parsed: SignResponse = resp
            .json()
            .await
            .map_err(|e| SignerError::MalformedResponse(format!("invalid json: {e}")))?;

        match (parsed.signature_b64, parsed.signer_id) {
            (Some(signature), Some(signer_id)) => Ok(SignatureRecord {
                signature,
                signer_id,
            }),
            _ => Err(SignerError::MalformedResponse(
                "missing signature_b64 or signer_id".into(),
            )),
        }
    }

    async fn verify_once(
        &self,
        payload: &[u8],
        signature: &str,
        signer_id: &str,
    ) -> Result<bool, SignerError> {
        let body = VerifyRequest {
            payload_b64: STANDARD.encode(payload),
            signature_b64: signature,
            signer_id,
        };

        let mut req = self.client.post(format!("{}/verify", self.endpoint));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SignerError::Rejected {
                status: status.as_u16(),
            });
        }

        let parsed: VerifyResponse = resp
            .json()
            .await
            .map_err(|e| SignerError::MalformedResponse(format!("invalid json: {e}")))?;

        parsed
            .verified
            .ok_or_else(|| SignerError::MalformedResponse("missing verified".into()))
    }
}

#[async_trait]
impl Signer for KmsSigner {
    async fn sign(&self, payload: &[u8]) -> Result<SignatureRecord, SignerError> {
        let attempt =
            RetryIf::spawn(Self::retry_strategy(), || self.sign_once(payload), Self::retryable)
                .await;

        match attempt {
            Ok(record) => Ok(record),
            Err(err) if !self.fail_closed => match &self.fallback {
                Some(fallback) => {
                    log::warn!("signing proxy failed, using dev fallback: {err}");
                    fallback.sign(payload).await
                }
                None => Err(err),
            },
            Err(err) => Err(SignerError::Unavailable(err.to_string())),
        }
    }

    async fn verify(
        &self,
        payload: &[u8],
        signature: &str,
        signer_id: &str,
    ) -> Result<bool, SignerError> {
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.verify_once(payload, signature, signer_id),
            Self::retryable,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::signer::{HmacDevSigner, DEV_SIGNER_ID},
        serde_json::json,
    };

    fn cfg() -> SigningConfig {
        SigningConfig::default()
    }

    fn kms(server: &mockito::ServerGuard, fail_closed: bool) -> KmsSigner {
        KmsSigner::new(&server.url(), &cfg(), fail_closed, None).unwrap()
    }

    #[tokio::test]
    async fn sign_happy_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sign")
            .match_body(mockito::Matcher::PartialJson(json!({
                "payload_b64": STANDARD.encode(b"digest"),
            })))
            .with_status(200)
            .with_body(r#"{"signature_b64":"c2ln","signer_id":"kms-1"}"#)
            .create_async()
            .await;

        let record = kms(&server, true).sign(b"digest").await.unwrap();
        assert_eq!(record.signature, "c2ln");
        assert_eq!(record.signer_id, "kms-1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_signer_id_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sign")
            .with_status(200)
            .with_body(r#"{"signature_b64":"c2ln"}"#)
            .create_async()
            .await;

        // Fail-open without a fallback still surfaces the proxy error.
        let err = kms(&server, false).sign(b"digest").await.unwrap_err();
        assert!(matches!(err, SignerError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn server_error_is_retried_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sign")
            .with_status(502)
            .with_body(r#"{"error":"bad gateway"}"#)
            .expect(2)
            .create_async()
            .await;

        let err = kms(&server, true).sign(b"digest").await.unwrap_err();
        assert!(matches!(err, SignerError::Unavailable(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sign")
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let err = kms(&server, false).sign(b"digest").await.unwrap_err();
        assert!(matches!(err, SignerError::Rejected { status: 403 }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn dev_fallback_takes_over_when_fail_open() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sign")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let fallback: Arc<dyn Signer> = Arc::new(HmacDevSigner::new("dev-secret"));
        let signer = KmsSigner::new(&server.url(), &cfg(), false, Some(fallback)).unwrap();

        let record = signer.sign(b"digest").await.unwrap();
        assert_eq!(record.signer_id, DEV_SIGNER_ID);
    }

    #[tokio::test]
    async fn fail_closed_never_falls_back() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sign")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let fallback: Arc<dyn Signer> = Arc::new(HmacDevSigner::new("dev-secret"));
        let signer = KmsSigner::new(&server.url(), &cfg(), true, Some(fallback)).unwrap();

        let err = signer.sign(b"digest").await.unwrap_err();
        assert!(matches!(err, SignerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn verify_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(200)
            .with_body(r#"{"verified":true}"#)
            .create_async()
            .await;

        let verified = kms(&server, true)
            .verify(b"digest", "c2ln", "kms-1")
            .await
            .unwrap();
        assert!(verified);
    }
}
