use anyhow::Context;
use common::{
    runtime::UnixTimestamp,
    types::{
        FileId,
        SessionId,
        UserId,
    },
};
use errors::ErrorMetadata;
use hmac::{
    Hmac,
    Mac,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::Sha256;

use crate::secret::Secret;

type HmacSha256 = Hmac<Sha256>;

/// Everything a stateless part upload or completion needs to know, bound
/// into the token at initiate time. Claim fields are tainted input until the
/// signature has been verified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTokenClaims {
    pub session_id: SessionId,
    pub file_id: FileId,
    /// Provider-scoped upload id, passed through verbatim.
    pub upload_id: String,
    pub owner_id: UserId,
    pub filename: String,
    pub content_type: String,
    pub total_size: u64,
    pub max_chunk_size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<FileId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_modified: Option<UnixTimestamp>,
    pub issued_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
}

/// Issues and checks the instance's signed tokens. The token is JWT-shaped:
/// `base64url(header).base64url(claims).base64url(hmac-sha256(signing
/// input))` under the instance secret.
#[derive(Clone)]
pub struct KeyBroker {
    secret: Secret,
}

#[derive(Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

fn invalid_token() -> ErrorMetadata {
    ErrorMetadata::unauthenticated("InvalidUploadToken", "upload token is malformed or forged")
}

impl KeyBroker {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key length")
    }

    pub fn issue_upload_token(&self, claims: &UploadTokenClaims) -> anyhow::Result<String> {
        let header = serde_json::to_vec(&TokenHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        })?;
        let payload = serde_json::to_vec(claims)?;
        let signing_input = format!(
            "{}.{}",
            base64::encode_config(header, base64::URL_SAFE_NO_PAD),
            base64::encode_config(payload, base64::URL_SAFE_NO_PAD),
        );
        let mut mac = self.mac();
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{signing_input}.{}",
            base64::encode_config(signature, base64::URL_SAFE_NO_PAD)
        ))
    }

    /// Verifies the signature, then the expiry, and only then surfaces the
    /// claims. Nothing inside the token is consulted before the MAC checks
    /// out.
    pub fn check_upload_token(
        &self,
        token: &str,
        now: UnixTimestamp,
    ) -> anyhow::Result<UploadTokenClaims> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            anyhow::bail!(invalid_token());
        };

        let signature = base64::decode_config(signature_b64, base64::URL_SAFE_NO_PAD)
            .ok()
            .context(invalid_token())?;
        let mut mac = self.mac();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        if mac.verify_slice(&signature).is_err() {
            anyhow::bail!(invalid_token());
        }

        let header: TokenHeader = base64::decode_config(header_b64, base64::URL_SAFE_NO_PAD)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .context(invalid_token())?;
        if header.alg != "HS256" {
            anyhow::bail!(invalid_token());
        }

        let claims: UploadTokenClaims = base64::decode_config(payload_b64, base64::URL_SAFE_NO_PAD)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .context(invalid_token())?;

        if claims.expires_at <= now {
            anyhow::bail!(ErrorMetadata::unauthenticated(
                "UploadTokenExpired",
                "upload token has expired; initiate a new upload",
            ));
        }
        Ok(claims)
    }
}
