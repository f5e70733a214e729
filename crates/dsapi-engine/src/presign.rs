//! Pre-signed object retrieval URLs.
//!
//! A URL carries the signing key id, the signing time, its validity window and
//! an HMAC-SHA256 over the canonical request. [`PresignSigner::verify`] checks
//! all of it against a given instant.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Algorithm tag written into every URL.
pub const PRESIGN_ALGORITHM: &str = "DSV1-HMAC-SHA256";

/// Longest validity the signer will issue.
pub const MAX_EXPIRES_SECS: u64 = 604_800;

const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Why a URL failed verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresignError {
    /// URL could not be parsed or misses a parameter
    #[error("malformed presigned url: {0}")]
    Malformed(String),
    /// Validity window elapsed
    #[error("presigned url expired")]
    Expired,
    /// Signature does not match
    #[error("presigned url signature mismatch")]
    BadSignature,
}

/// Parameters recovered from a verified URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedParams {
    /// Container name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Signing time
    pub signed_at: DateTime<Utc>,
    /// Validity in seconds
    pub expires_secs: u64,
}

/// Signs and verifies retrieval URLs for one set of credentials.
#[derive(Clone)]
pub struct PresignSigner {
    endpoint: Url,
    region: String,
    access_key_id: String,
    secret_access_key: String,
}

impl std::fmt::Debug for PresignSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignSigner")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .finish()
    }
}

impl PresignSigner {
    /// Creates a signer. `endpoint` defaults to the regional public endpoint.
    pub fn new(region: &str, access_key_id: &str, secret_access_key: &str, endpoint: Option<&str>) -> Result<Self, PresignError> {
        let base = match endpoint {
            Some(e) if !e.is_empty() => e.to_string(),
            _ => format!("https://s3.{}.amazonaws.com", region),
        };
        let endpoint = Url::parse(&base).map_err(|e| PresignError::Malformed(format!("{}: {}", base, e)))?;
        Ok(Self {
            endpoint,
            region: region.to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
        })
    }

    fn canonical(&self, method: &str, bucket: &str, key: &str, date: &str, expires: u64) -> String {
        format!(
            "{}\n/{}/{}\n{}\n{}\n{}\n{}",
            method, bucket, key, self.access_key_id, self.region, date, expires
        )
    }

    fn signature(&self, canonical: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_access_key.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signs a GET for `bucket/key` valid for `expires_secs` from `now`.
    pub fn presign_get(&self, bucket: &str, key: &str, expires_secs: u64, now: DateTime<Utc>) -> String {
        let expires = expires_secs.min(MAX_EXPIRES_SECS);
        let date = now.format(DATE_FORMAT).to_string();
        let sig = self.signature(&self.canonical("GET", bucket, key, &date, expires));

        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(bucket);
            for part in key.split('/') {
                segments.push(part);
            }
        }
        url.query_pairs_mut()
            .append_pair("X-Ds-Algorithm", PRESIGN_ALGORITHM)
            .append_pair("X-Ds-Credential", &format!("{}/{}", self.access_key_id, self.region))
            .append_pair("X-Ds-Date", &date)
            .append_pair("X-Ds-Expires", &expires.to_string())
            .append_pair("X-Ds-Signature", &sig);
        url.to_string()
    }

    /// Verifies a URL produced by [`presign_get`](Self::presign_get) at instant `now`.
    pub fn verify(&self, raw: &str, now: DateTime<Utc>) -> Result<PresignedParams, PresignError> {
        let url = Url::parse(raw).map_err(|e| PresignError::Malformed(e.to_string()))?;
        let param = |name: &str| -> Result<String, PresignError> {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .ok_or_else(|| PresignError::Malformed(format!("missing {}", name)))
        };

        if param("X-Ds-Algorithm")? != PRESIGN_ALGORITHM {
            return Err(PresignError::Malformed("unknown algorithm".to_string()));
        }
        let date = param("X-Ds-Date")?;
        let expires: u64 = param("X-Ds-Expires")?
            .parse()
            .map_err(|_| PresignError::Malformed("bad expiry".to_string()))?;
        let signature = param("X-Ds-Signature")?;

        let mut segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(|p| percent_decode(p)).collect())
            .unwrap_or_default();
        let base_len = self.endpoint.path_segments().map(|s| s.filter(|p| !p.is_empty()).count()).unwrap_or(0);
        if segments.len() < base_len + 2 {
            return Err(PresignError::Malformed("missing bucket or key".to_string()));
        }
        let mut rest = segments.split_off(base_len);
        let bucket = rest.remove(0);
        let key = rest.join("/");

        let expected = self.signature(&self.canonical("GET", &bucket, &key, &date, expires));
        if expected != signature {
            return Err(PresignError::BadSignature);
        }

        let naive = NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
            .map_err(|_| PresignError::Malformed("bad date".to_string()))?;
        let signed_at = Utc.from_utc_datetime(&naive);
        if now > signed_at + chrono::Duration::seconds(expires as i64) {
            return Err(PresignError::Expired);
        }

        Ok(PresignedParams {
            bucket,
            key,
            signed_at,
            expires_secs: expires,
        })
    }
}

fn percent_decode(s: &str) -> String {
    url::form_urlencoded::parse(format!("k={}", s.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> PresignSigner {
        PresignSigner::new("us-east-1", "AKIDEXAMPLE", "secret", None).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_presign_and_verify() {
        let s = signer();
        let url = s.presign_get("ds-abc", "_attachments/readme.txt", 300, at(0));
        assert!(url.starts_with("https://s3.us-east-1.amazonaws.com/ds-abc/_attachments/readme.txt?"));
        let params = s.verify(&url, at(120)).unwrap();
        assert_eq!(params.bucket, "ds-abc");
        assert_eq!(params.key, "_attachments/readme.txt");
        assert_eq!(params.expires_secs, 300);
    }

    #[test]
    fn test_expired_url_rejected() {
        let s = signer();
        let url = s.presign_get("b", "k", 300, at(0));
        assert_eq!(s.verify(&url, at(301)), Err(PresignError::Expired));
    }

    #[test]
    fn test_tampered_key_rejected() {
        let s = signer();
        let url = s.presign_get("b", "k1", 300, at(0));
        let tampered = url.replace("/b/k1?", "/b/k2?");
        assert_eq!(s.verify(&tampered, at(1)), Err(PresignError::BadSignature));
    }

    #[test]
    fn test_other_secret_rejected() {
        let url = signer().presign_get("b", "k", 300, at(0));
        let other = PresignSigner::new("us-east-1", "AKIDEXAMPLE", "other", None).unwrap();
        assert_eq!(other.verify(&url, at(1)), Err(PresignError::BadSignature));
    }

    #[test]
    fn test_custom_endpoint_and_special_characters() {
        let s = PresignSigner::new("us-east-1", "AK", "sk", Some("http://localhost:9000")).unwrap();
        let url = s.presign_get("b", "_attachments/my file+1.csv", 60, at(0));
        assert!(url.starts_with("http://localhost:9000/b/_attachments/"));
        let params = s.verify(&url, at(30)).unwrap();
        assert_eq!(params.key, "_attachments/my file+1.csv");
    }

    #[test]
    fn test_expiry_capped() {
        let s = signer();
        let url = s.presign_get("b", "k", 10_000_000, at(0));
        assert_eq!(s.verify(&url, at(1)).unwrap().expires_secs, MAX_EXPIRES_SECS);
    }
}
