//! Alert shipper: authenticates to the collection server, performs a
//! Diffie-Hellman handshake, and ships Fernet-encrypted alerts over TCP
//! (see spec §4.6 and §6).

use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hkdf::Hkdf;
use openssl::bn::BigNum;
use openssl::dh::Dh;
use openssl::pkey::PKey;
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{CompanyKey, ShipperConfig};
use crate::error::DcaError;
use crate::types::Alert;

const AUTH_SUCCESS: &str = "CONN";
const RECV_SIZE: usize = 1024;

/// RFC-3526 Diffie-Hellman group 14 (2048-bit MODP), generator 2.
const GROUP14_PRIME_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

fn group14() -> Result<Dh<openssl::pkey::Params>> {
    let p = BigNum::from_hex_str(GROUP14_PRIME_HEX)?;
    let g = BigNum::from_u32(2)?;
    Ok(Dh::from_pqg(p, None, g)?)
}

/// A session key derived from one DH handshake, used to seal outbound
/// alerts for the lifetime of a single TCP connection.
struct Session {
    stream: TcpStream,
    fernet: fernet::Fernet,
}

impl Session {
    async fn establish(key: &CompanyKey, hostname: &str) -> Result<Self, DcaError> {
        let addr = key.resolve_server_addr()?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DcaError::Network(format!("cannot connect to {addr}: {e}")))?;

        Self::authenticate(&mut stream, key, hostname).await?;
        let fernet = Self::handshake(&mut stream).await?;

        Ok(Self { stream, fernet })
    }

    async fn authenticate(stream: &mut TcpStream, key: &CompanyKey, hostname: &str) -> Result<(), DcaError> {
        let credentials = serde_json::json!({
            "hostname": hostname,
            "company_hash": key.raw,
        });
        let payload = serde_json::to_vec(&credentials)
            .map_err(|e| DcaError::Startup(format!("cannot encode credentials: {e}")))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| DcaError::Network(format!("cannot send credentials: {e}")))?;

        let mut buf = vec![0u8; RECV_SIZE];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| DcaError::Network(format!("cannot read auth response: {e}")))?;
        let response = String::from_utf8_lossy(&buf[..n]);
        if response.trim_end_matches('\0') != AUTH_SUCCESS {
            return Err(DcaError::Auth(format!("server rejected credentials: {response}")));
        }
        Ok(())
    }

    async fn handshake(stream: &mut TcpStream) -> Result<fernet::Fernet, DcaError> {
        let params = group14().map_err(|e| DcaError::Startup(format!("cannot build DH group: {e}")))?;
        let keypair = params
            .generate_key()
            .map_err(|e| DcaError::Startup(format!("cannot generate DH keypair: {e}")))?;
        let pkey = PKey::from_dh(keypair.clone())
            .map_err(|e| DcaError::Startup(format!("cannot wrap DH keypair: {e}")))?;
        let public_der = pkey
            .public_key_to_der()
            .map_err(|e| DcaError::Startup(format!("cannot serialize DH public key: {e}")))?;

        stream
            .write_all(&public_der)
            .await
            .map_err(|e| DcaError::Network(format!("cannot send public key: {e}")))?;

        let mut buf = vec![0u8; RECV_SIZE];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| DcaError::Network(format!("cannot read peer public key: {e}")))?;

        let peer_pkey = PKey::public_key_from_der(&buf[..n])
            .map_err(|e| DcaError::Startup(format!("malformed peer public key: {e}")))?;
        let peer_dh = peer_pkey
            .dh()
            .map_err(|e| DcaError::Startup(format!("peer key is not a DH key: {e}")))?;

        let shared_secret = keypair
            .compute_key(peer_dh.public_key())
            .map_err(|e| DcaError::Startup(format!("cannot compute shared secret: {e}")))?;

        let hk = Hkdf::<Sha256>::new(None, &shared_secret);
        let mut okm = [0u8; 32];
        hk.expand(b"handshake data", &mut okm)
            .map_err(|_| DcaError::Startup("HKDF expand failed".into()))?;

        let fernet_key = URL_SAFE.encode(okm);
        let fernet = fernet::Fernet::new(&fernet_key)
            .ok_or_else(|| DcaError::Startup("derived key is not a valid Fernet key".into()))?;

        info!("handshake complete, session key established");
        Ok(fernet)
    }

    /// Sends one alert as a session frame: the antigen id alone, JSON-encoded
    /// as a string (not the `Alert` struct), per spec §4.6's shipping loop.
    async fn send(&mut self, alert: &Alert) -> Result<(), DcaError> {
        let payload = serde_json::to_string(&alert.antigen_id)
            .map_err(|e| DcaError::Network(format!("cannot encode alert: {e}")))?;
        let token = self.fernet.encrypt(payload.as_bytes());
        self.stream
            .write_all(token.as_bytes())
            .await
            .map_err(|e| DcaError::Network(format!("cannot send alert: {e}")))
    }
}

/// Ships alerts to the collection server, reconnecting with exponential
/// backoff on any network failure (an addition not present in the original
/// client, which ran unattended and relied on the OS to surface errors).
pub struct AlertShipper {
    company_key: CompanyKey,
    hostname: String,
    config: ShipperConfig,
}

impl AlertShipper {
    pub fn new(company_key: CompanyKey, hostname: String, config: ShipperConfig) -> Self {
        Self { company_key, hostname, config }
    }

    /// Consumes alerts from `alert_rx` and ships them, reconnecting as
    /// needed. Exits when the channel closes or `cancel` fires.
    pub async fn run(
        self,
        mut alert_rx: mpsc::UnboundedReceiver<Alert>,
        cancel: CancellationToken,
    ) -> Result<(), DcaError> {
        let mut session = self.connect_with_retry(&cancel).await?;

        loop {
            let alert = tokio::select! {
                _ = cancel.cancelled() => break,
                alert = alert_rx.recv() => alert,
            };
            let Some(alert) = alert else { break };

            if let Err(e) = session.send(&alert).await {
                warn!(error = %e, "alert send failed, reconnecting");
                session = self.connect_with_retry(&cancel).await?;
                let _ = session.send(&alert).await;
            }
        }
        Ok(())
    }

    async fn connect_with_retry(&self, cancel: &CancellationToken) -> Result<Session, DcaError> {
        let mut backoff = Duration::from_secs(self.config.initial_backoff_secs);
        let max_backoff = Duration::from_secs(self.config.max_backoff_secs);
        let mut attempt = 0u32;

        loop {
            match Session::establish(&self.company_key, &self.hostname).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, backoff_secs = backoff.as_secs(), "connect failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DcaError::Network("shutdown during reconnect".into())),
                        _ = tokio::time::sleep(backoff) => {},
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn group14_prime_parses_to_2048_bits() {
        let dh = group14().unwrap();
        assert_eq!(dh.prime_p().num_bits(), 2048);
    }

    #[test]
    fn fernet_key_derived_from_hkdf_is_url_safe_base64_of_32_bytes() {
        let shared_secret = [7u8; 32];
        let hk = Hkdf::<Sha256>::new(None, &shared_secret);
        let mut okm = [0u8; 32];
        hk.expand(b"handshake data", &mut okm).unwrap();
        let key = URL_SAFE.encode(okm);
        assert!(fernet::Fernet::new(&key).is_some());
    }

    const EXPECTED_HASH: &str = "0123456789abcdef0123456789abcdef";

    /// A minimal stand-in for the collection server's handshake handling,
    /// scoped to this test module: no real server exists in this workspace
    /// (out of scope per spec §1), so the test plays the server role for
    /// both sides of the protocol in spec §6.
    async fn run_test_server(listener: TcpListener, accept_hash: bool, expected_raw: String) -> Option<String> {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut buf = vec![0u8; RECV_SIZE];
        let n = stream.read(&mut buf).await.unwrap();
        let creds: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        let hash = creds["company_hash"].as_str().unwrap();

        if !accept_hash || hash != expected_raw {
            stream.write_all(b"FAIL").await.unwrap();
            return None;
        }
        stream.write_all(b"CONN").await.unwrap();

        let params = group14().unwrap();
        let server_keypair = params.generate_key().unwrap();
        let server_pkey = PKey::from_dh(server_keypair.clone()).unwrap();
        let server_der = server_pkey.public_key_to_der().unwrap();

        let mut buf = vec![0u8; RECV_SIZE];
        let n = stream.read(&mut buf).await.unwrap();
        let client_pkey = PKey::public_key_from_der(&buf[..n]).unwrap();
        let client_dh = client_pkey.dh().unwrap();

        stream.write_all(&server_der).await.unwrap();

        let shared_secret = server_keypair.compute_key(client_dh.public_key()).unwrap();
        let hk = Hkdf::<Sha256>::new(None, &shared_secret);
        let mut okm = [0u8; 32];
        hk.expand(b"handshake data", &mut okm).unwrap();
        let fernet_key = URL_SAFE.encode(okm);
        let fernet = fernet::Fernet::new(&fernet_key).unwrap();

        let mut buf = vec![0u8; RECV_SIZE];
        let n = stream.read(&mut buf).await.unwrap();
        let token = std::str::from_utf8(&buf[..n]).unwrap();
        let plaintext = fernet.decrypt(token).unwrap();
        Some(serde_json::from_slice::<String>(&plaintext).unwrap())
    }

    fn test_company_key(port: u16) -> CompanyKey {
        CompanyKey {
            company_hash: EXPECTED_HASH.to_string(),
            server_hostname: "127.0.0.1".to_string(),
            server_port: port,
            raw: format!("{EXPECTED_HASH}:127.0.0.1:{port}"),
        }
    }

    /// Scenario S5: a successful handshake followed by one session frame
    /// that the server decrypts back to the original antigen id.
    #[tokio::test]
    async fn handshake_succeeds_and_alert_decrypts_on_the_server_side() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = test_company_key(port);
        let server = tokio::spawn(run_test_server(listener, true, key.raw.clone()));

        let mut session = Session::establish(&key, "test-host").await.unwrap();
        session
            .send(&Alert { antigen_id: "10.0.0.1:1-10.0.0.5:443".to_string() })
            .await
            .unwrap();

        let decrypted = server.await.unwrap();
        assert_eq!(decrypted, Some("10.0.0.1:1-10.0.0.5:443".to_string()));
    }

    /// Scenario S6: the server rejects the credentials; the client surfaces
    /// an auth failure and never proceeds to the DH exchange.
    #[tokio::test]
    async fn handshake_fails_on_rejected_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = test_company_key(port);
        let server = tokio::spawn(run_test_server(listener, false, key.raw.clone()));

        let result = Session::establish(&key, "test-host").await;
        assert!(matches!(result, Err(DcaError::Auth(_))));

        assert_eq!(server.await.unwrap(), None);
    }
}
