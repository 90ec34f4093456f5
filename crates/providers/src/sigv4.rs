//! AWS Signature Version 4 request signing.
//!
//! Minimal implementation covering what the Bedrock adapter sends: POST
//! with a JSON payload, no query string, `host` + `x-amz-date` +
//! `content-type` as signed headers. HMAC-SHA256 over the canonical
//! request per the SigV4 specification.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Credentials and scope for one signing operation.
pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
}

/// Headers produced by signing: `x-amz-date` and `authorization`.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sign a POST request. `now` is injected so tests are deterministic.
pub fn sign_post(
    params: &SigningParams<'_>,
    host: &str,
    uri_path: &str,
    payload: &[u8],
    now: chrono::DateTime<chrono::Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let signed_headers = "content-type;host;x-amz-date";
    let canonical_headers = format!(
        "content-type:application/json\nhost:{host}\nx-amz-date:{amz_date}\n"
    );
    let payload_hash = sha256_hex(payload);

    let canonical_request = format!(
        "POST\n{uri_path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let credential_scope = format!(
        "{date_stamp}/{}/{}/aws4_request",
        params.region, params.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    // Key derivation chain: date → region → service → "aws4_request"
    let k_date = hmac_sha256(
        format!("AWS4{}", params.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, params.region.as_bytes());
    let k_service = hmac_sha256(&k_region, params.service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex_encode(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        params.access_key_id
    );

    SignedHeaders { amz_date, authorization }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params() -> SigningParams<'static> {
        SigningParams {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
            service: "bedrock",
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let a = sign_post(&params(), "bedrock.us-east-1.amazonaws.com", "/model/x/invoke", b"{}", now);
        let b = sign_post(&params(), "bedrock.us-east-1.amazonaws.com", "/model/x/invoke", b"{}", now);
        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20240115T120000Z");
    }

    #[test]
    fn signature_changes_with_payload() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let a = sign_post(&params(), "h", "/p", b"{\"a\":1}", now);
        let b = sign_post(&params(), "h", "/p", b"{\"a\":2}", now);
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn authorization_carries_scope_and_signed_headers() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let signed = sign_post(&params(), "h", "/p", b"{}", now);
        assert!(signed.authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240115/us-east-1/bedrock/aws4_request"));
        assert!(signed.authorization.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(signed.authorization.contains("Signature="));
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
