use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const PRIVATE_KEY_FILE: &str = "atproto_private_key.pem";
const PUBLIC_JWK_FILE: &str = "atproto_jwk.json";

/// Public half of the signing key as an ES256 JWK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Jwk {
    pub fn from_verifying_key(key: &VerifyingKey, kid: impl Into<String>) -> Result<Self> {
        let point = key.to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(Error::KeyStorage("public key has no affine coordinates".into()));
        };

        Ok(Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
            use_: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
            kid: Some(kid.into()),
        })
    }

    pub fn to_verifying_key(&self) -> Result<VerifyingKey> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(Error::KeyStorage(format!(
                "unsupported key type {} {}",
                self.kty, self.crv
            )));
        }

        let decode = |coord: &str| -> Result<p256::FieldBytes> {
            let bytes = URL_SAFE_NO_PAD
                .decode(coord)
                .map_err(|e| Error::KeyStorage(format!("invalid JWK coordinate: {}", e)))?;
            if bytes.len() != 32 {
                return Err(Error::KeyStorage("JWK coordinate must be 32 bytes".into()));
            }
            Ok(p256::FieldBytes::clone_from_slice(&bytes))
        };

        let point =
            p256::EncodedPoint::from_affine_coordinates(&decode(&self.x)?, &decode(&self.y)?, false);
        VerifyingKey::from_encoded_point(&point)
            .map_err(|e| Error::KeyStorage(format!("invalid public key: {}", e)))
    }

    /// RFC 7638 thumbprint over the required EC members in lexicographic order
    pub fn thumbprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// The active key pair
#[derive(Debug)]
pub struct SigningKeyPair {
    pub signing_key: SigningKey,
    pub jwk: Jwk,
}

/// Owns the on-disk signing key used for DPoP proofs and client assertions.
///
/// Keys are created on first use and reused for the lifetime of the process.
/// Rotation is an operator action and must not race with signing.
pub struct KeyManager {
    dir: PathBuf,
    cached: RwLock<Option<Arc<SigningKeyPair>>>,
}

impl KeyManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_jwk_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_JWK_FILE)
    }

    pub fn keys_exist(&self) -> bool {
        self.private_key_path().exists() && self.public_jwk_path().exists()
    }

    /// Loads the key pair, generating and persisting it if absent.
    pub fn ensure_keys(&self) -> Result<Arc<SigningKeyPair>> {
        if let Some(pair) = self.read_cache()? {
            return Ok(pair);
        }

        let mut cached = self
            .cached
            .write()
            .map_err(|_| Error::KeyStorage("key cache lock poisoned".into()))?;
        if let Some(pair) = cached.as_ref() {
            return Ok(pair.clone());
        }

        let pair = if self.keys_exist() {
            self.load()?
        } else {
            self.generate()?
        };
        let pair = Arc::new(pair);
        *cached = Some(pair.clone());
        Ok(pair)
    }

    pub fn current_private_key(&self) -> Result<SigningKey> {
        Ok(self.ensure_keys()?.signing_key.clone())
    }

    pub fn current_public_jwk(&self) -> Result<Jwk> {
        Ok(self.ensure_keys()?.jwk.clone())
    }

    /// JWK Set served at the client metadata `jwks_uri`
    pub fn jwks(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "keys": [self.current_public_jwk()?] }))
    }

    /// Backs up the current files with a timestamp suffix and generates a new pair.
    pub fn rotate_keys(&self) -> Result<Arc<SigningKeyPair>> {
        let mut cached = self
            .cached
            .write()
            .map_err(|_| Error::KeyStorage("key cache lock poisoned".into()))?;

        let suffix = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        for path in [self.private_key_path(), self.public_jwk_path()] {
            if path.exists() {
                let backup = backup_path(&path, &suffix);
                fs::copy(&path, &backup).map_err(|e| {
                    Error::KeyStorage(format!("failed to back up {}: {}", path.display(), e))
                })?;
                restrict_permissions(&backup)?;
            }
        }

        let pair = Arc::new(self.generate()?);
        *cached = Some(pair.clone());
        tracing::info!("rotated signing key, new kid: {:?}", pair.jwk.kid);
        Ok(pair)
    }

    fn read_cache(&self) -> Result<Option<Arc<SigningKeyPair>>> {
        let cached = self
            .cached
            .read()
            .map_err(|_| Error::KeyStorage("key cache lock poisoned".into()))?;
        Ok(cached.clone())
    }

    fn load(&self) -> Result<SigningKeyPair> {
        let pem = fs::read_to_string(self.private_key_path())
            .map_err(|e| Error::KeyStorage(format!("failed to read private key: {}", e)))?;
        let signing_key = SigningKey::from_pkcs8_pem(&pem)
            .map_err(|e| Error::KeyStorage(format!("invalid private key: {}", e)))?;

        let jwk_json = fs::read_to_string(self.public_jwk_path())
            .map_err(|e| Error::KeyStorage(format!("failed to read JWK: {}", e)))?;
        let jwk: Jwk = serde_json::from_str(&jwk_json)
            .map_err(|e| Error::KeyStorage(format!("invalid JWK: {}", e)))?;

        if jwk.to_verifying_key()? != *signing_key.verifying_key() {
            return Err(Error::KeyStorage(
                "public JWK does not match private key".into(),
            ));
        }

        tracing::info!("loaded signing key from {}", self.dir.display());
        Ok(SigningKeyPair { signing_key, jwk })
    }

    fn generate(&self) -> Result<SigningKeyPair> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::KeyStorage(format!("failed to create {}: {}", self.dir.display(), e))
        })?;

        let signing_key = SigningKey::random(&mut OsRng);
        let jwk = Jwk::from_verifying_key(
            signing_key.verifying_key(),
            uuid::Uuid::new_v4().to_string(),
        )?;

        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::KeyStorage(format!("failed to encode private key: {}", e)))?;
        let jwk_json = serde_json::to_string_pretty(&jwk)
            .map_err(|e| Error::KeyStorage(format!("failed to encode JWK: {}", e)))?;

        write_private(&self.private_key_path(), pem.as_bytes())?;
        write_private(&self.public_jwk_path(), jwk_json.as_bytes())?;

        tracing::info!("generated new signing key in {}", self.dir.display());
        Ok(SigningKeyPair { signing_key, jwk })
    }
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".backup_{}", suffix));
    path.with_file_name(name)
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)
        .map_err(|e| Error::KeyStorage(format!("failed to write {}: {}", path.display(), e)))?;
    restrict_permissions(path)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        Error::KeyStorage(format!("failed to chmod {}: {}", path.display(), e))
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
