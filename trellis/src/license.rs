use crate::vault::Vault;
use log::{info, warn};
use reqwest::{Client, StatusCode, Url, header};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use trellis_cdm::{CdmError, IdentityStore, ProtectionHeader, SecurityLevel, Session};

#[derive(Debug, Error)]
pub enum LicenseError {
    /// The server refused the challenge outright. Retrying cannot help; the
    /// account is simply not entitled to this title.
    #[error("license server denied the request (HTTP {status}), not entitled")]
    Entitlement { status: u16 },
    #[error("license request failed: {reason}")]
    Network { reason: String },
    #[error("license did not cover required key id {kid}")]
    MissingKey { kid: String },
    #[error(transparent)]
    Cdm(#[from] CdmError),
    #[error("key vault: {0}")]
    Vault(String),
}

pub struct TransportReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// POST a binary challenge, return whatever came back. Exists as a seam so
/// the negotiation loop is testable without a server; the production
/// implementation is [`HttpTransport`].
pub trait LicenseTransport: Send + Sync {
    async fn submit(&self, url: &Url, body: Vec<u8>) -> Result<TransportReply, LicenseError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl LicenseTransport for HttpTransport {
    async fn submit(&self, url: &Url, body: Vec<u8>) -> Result<TransportReply, LicenseError> {
        let response = self
            .client
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| LicenseError::Network {
                reason: describe_reqwest_error(&e),
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| LicenseError::Network {
                reason: describe_reqwest_error(&e),
            })?
            .to_vec();

        Ok(TransportReply { status, body })
    }
}

fn describe_reqwest_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "timeout".to_owned()
    } else if error.is_connect() {
        "connection error".to_owned()
    } else {
        error.to_string()
    }
}

/// Obtains content keys for titles, vault first.
///
/// Negotiations for the same `(service, content_id)` coalesce onto one
/// in-flight session behind a keyed mutex; whoever wins populates the vault
/// and everyone else is served from it under the same lock.
pub struct KeyBroker<T> {
    transport: T,
    vault: Vault,
    identities: IdentityStore,
    security_level: SecurityLevel,
    retries: u8,
    backoff: Duration,
    inflight: tokio::sync::Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl<T: LicenseTransport> KeyBroker<T> {
    pub fn new(
        transport: T,
        vault: Vault,
        identities: IdentityStore,
        security_level: SecurityLevel,
        retries: u8,
        backoff: Duration,
    ) -> Self {
        Self {
            transport,
            vault,
            identities,
            security_level,
            retries,
            backoff,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Return keys covering `required_kids` for a title, negotiating a fresh
    /// license only on a vault miss.
    pub async fn obtain(
        &self,
        service: &str,
        content_id: &str,
        header: &ProtectionHeader,
        license_url: &Url,
        required_kids: &[String],
    ) -> Result<HashMap<String, String>, LicenseError> {
        let flight = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry((service.to_owned(), content_id.to_owned()))
                .or_default()
                .clone()
        };
        let _guard = flight.lock().await;

        if let Some(keys) = self
            .vault
            .lookup(service, content_id, required_kids)
            .await
            .map_err(|e| LicenseError::Vault(e.to_string()))?
        {
            info!("Using {} cached keys for {content_id}", keys.len());
            return Ok(keys);
        }

        let device = Arc::new(self.identities.load(self.security_level)?);

        if device.needs_renewal() {
            warn!(
                "device identity {} is due for renewal, proceeding anyway",
                device.security_level
            );
        }

        let mut session = Session::new(device, header.clone())?;
        let mut attempt: u8 = 0;

        let body = loop {
            let challenge = session.build_challenge()?;
            session.submitted()?;

            info!("Requesting license for {content_id}");

            let transient = match self.transport.submit(license_url, challenge).await {
                Ok(reply) if StatusCode::from_u16(reply.status).map_or(false, |s| s.is_client_error()) => {
                    return Err(LicenseError::Entitlement {
                        status: reply.status,
                    });
                }
                Ok(reply) if reply.status >= 500 => format!("HTTP {}", reply.status),
                Ok(reply) => break reply.body,
                Err(LicenseError::Network { reason }) => reason,
                Err(e) => return Err(e),
            };

            attempt += 1;

            if attempt > self.retries {
                return Err(LicenseError::Network {
                    reason: format!("giving up after {attempt} attempts ({transient})"),
                });
            }

            let delay = self.backoff * 2u32.pow(u32::from(attempt - 1));
            warn!("License request failed ({transient}), retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        };

        session.validate_response(&body)?;
        session.derive_keys()?;
        let keys = session.close()?;

        self.vault
            .store(service, content_id, &keys)
            .await
            .map_err(|e| LicenseError::Vault(e.to_string()))?;

        self.vault
            .lookup(service, content_id, required_kids)
            .await
            .map_err(|e| LicenseError::Vault(e.to_string()))?
            .ok_or_else(|| {
                let stored = keys.iter().map(|k| k.kid_hex()).collect::<Vec<_>>();
                let missing = required_kids
                    .iter()
                    .find(|kid| !stored.contains(kid))
                    .cloned()
                    .unwrap_or_default();
                LicenseError::MissingKey { kid: missing }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trellis_cdm::{Device, header, responder::Responder};

    const KID: [u8; 16] = [0xaa; 16];
    const KEY: [u8; 16] = [0xbb; 16];

    enum Reply {
        Grant,
        Status(u16),
        ConnectionError,
    }

    struct MockTransport {
        responder: Responder,
        reply: Reply,
        submits: AtomicUsize,
    }

    impl LicenseTransport for MockTransport {
        async fn submit(&self, _url: &Url, body: Vec<u8>) -> Result<TransportReply, LicenseError> {
            self.submits.fetch_add(1, Ordering::SeqCst);

            match self.reply {
                Reply::Grant => Ok(TransportReply {
                    status: 200,
                    body: self.responder.respond(&body).unwrap(),
                }),
                Reply::Status(status) => Ok(TransportReply {
                    status,
                    body: vec![],
                }),
                Reply::ConnectionError => Err(LicenseError::Network {
                    reason: "connection error".to_owned(),
                }),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        broker: KeyBroker<MockTransport>,
        header: ProtectionHeader,
        url: Url,
    }

    static DEVICE_KEY: std::sync::LazyLock<RsaPrivateKey> =
        std::sync::LazyLock::new(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap());

    async fn fixture(reply: Reply, retries: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        let device = Device::new(
            b"test-client".to_vec(),
            vec![vec![0x30]],
            DEVICE_KEY.clone(),
            SecurityLevel::L3,
        );
        trellis_cdm::device::save(&device, &dir.path().join("devices")).unwrap();

        let transport = MockTransport {
            responder: Responder::new(DEVICE_KEY.to_public_key()).key(KID, KEY),
            reply,
            submits: AtomicUsize::new(0),
        };

        let broker = KeyBroker::new(
            transport,
            Vault::open(&dir.path().join("vault.db")).await.unwrap(),
            IdentityStore::new(dir.path().join("devices")),
            SecurityLevel::L3,
            retries,
            Duration::ZERO,
        );

        let raw = header::build(trellis_cdm::ProtectionSystem::Widevine, &[KID], b"");
        Fixture {
            _dir: dir,
            broker,
            header: ProtectionHeader::parse(&raw).unwrap(),
            url: "https://license.example.com/".parse().unwrap(),
        }
    }

    fn required() -> Vec<String> {
        vec![hex::encode(KID)]
    }

    #[tokio::test]
    async fn second_obtain_is_served_from_the_vault() {
        let f = fixture(Reply::Grant, 3).await;

        let first = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &required())
            .await
            .unwrap();
        let second = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &required())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[&hex::encode(KID)], hex::encode(KEY));
        assert_eq!(f.broker.transport.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_obtains_coalesce() {
        let f = fixture(Reply::Grant, 3).await;

        let req = required();
        let (a, b) = tokio::join!(
            f.broker
                .obtain("test", "title", &f.header, &f.url, &req),
            f.broker
                .obtain("test", "title", &f.header, &f.url, &req),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.broker.transport.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_respect_the_retry_bound() {
        let f = fixture(Reply::ConnectionError, 3).await;

        let err = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &required())
            .await
            .unwrap_err();

        assert!(matches!(err, LicenseError::Network { .. }));
        // One initial attempt plus exactly three retries.
        assert_eq!(f.broker.transport.submits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn server_errors_are_retried_too() {
        let f = fixture(Reply::Status(503), 2).await;

        let err = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &required())
            .await
            .unwrap_err();

        assert!(matches!(err, LicenseError::Network { .. }));
        assert_eq!(f.broker.transport.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn entitlement_denial_is_never_retried() {
        let f = fixture(Reply::Status(403), 3).await;

        let err = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &required())
            .await
            .unwrap_err();

        assert!(matches!(err, LicenseError::Entitlement { status: 403 }));
        assert_eq!(f.broker.transport.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_required_kid_is_an_error() {
        let f = fixture(Reply::Grant, 3).await;
        let other_kid = hex::encode([0xcc; 16]);

        let err = f
            .broker
            .obtain("test", "title", &f.header, &f.url, &[other_kid.clone()])
            .await
            .unwrap_err();

        assert!(matches!(err, LicenseError::MissingKey { kid } if kid == other_kid));
    }
}
