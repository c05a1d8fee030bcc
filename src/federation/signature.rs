//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per the draft-cavage HTTP Signatures
//! scheme as deployed by Mastodon:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Pseudo-header expanding to `<method> <path>`
pub const REQUEST_TARGET: &str = "(request-target)";

/// Headers every inbound signature must cover
pub const REQUIRED_SIGNED_HEADERS: [&str; 3] = [REQUEST_TARGET, "date", "host"];

/// Build the canonical signing string.
///
/// For each header name, in the signer's order, emits `name: value`; lines
/// are joined by `\n`. `lookup` supplies values for real headers.
pub fn signing_string<'a, F>(
    method: &str,
    path: &str,
    header_names: &[String],
    mut lookup: F,
) -> Result<String, AppError>
where
    F: FnMut(&str) -> Option<&'a str>,
{
    let mut signing_parts = Vec::with_capacity(header_names.len());

    for header_name in header_names {
        let value = if header_name == REQUEST_TARGET {
            format!("{} {}", method.to_lowercase(), path)
        } else {
            lookup(header_name)
                .ok_or_else(|| {
                    AppError::Authentication(format!("Signed header missing: {}", header_name))
                })?
                .to_string()
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(signing_parts.join("\n"))
}

/// Sign an HTTP request
///
/// Creates the HTTP Signature header for outgoing requests, covering
/// `(request-target) host date` plus `digest` when a body is present.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PKCS#8 or PKCS#1 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/actor/alice#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host_name = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    // Matches what HTTP clients put in the Host header.
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host_name, port),
        None => host_name.to_string(),
    };

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    // 2. Generate Date header (RFC 7231 IMF-fixdate)
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Generate Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let mut header_names = vec![
        REQUEST_TARGET.to_string(),
        "host".to_string(),
        "date".to_string(),
    ];
    if digest.is_some() {
        header_names.push("digest".to_string());
    }

    let signing_string = signing_string(method, &path_and_query, &header_names, |name| {
        match name {
            "host" => Some(host.as_str()),
            "date" => Some(date.as_str()),
            "digest" => digest.as_deref(),
            _ => None,
        }
    })?;

    // 5. Sign with RSA-SHA256
    let signature_b64 = sign_bytes(private_key_pem, signing_string.as_bytes())?;

    // 6. Build Signature header
    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        header_names.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest,
        host,
    })
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Host value that was signed
    pub host: String,
}

/// RSA-SHA256 (PKCS#1 v1.5) signature over `data`, Base64 encoded.
pub fn sign_bytes(private_key_pem: &str, data: &[u8]) -> Result<String, AppError> {
    let private_key = parse_private_key_pem(private_key_pem)?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let signature = signing_key
        .try_sign(data)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA signing failed: {}", e)))?;
    Ok(BASE64.encode(signature.to_bytes()))
}

fn parse_private_key_pem(private_key_pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_key_pem))
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))
}

/// Parse a PEM public key as published in actor documents.
///
/// The armor (`-----BEGIN/END (RSA )?PUBLIC KEY-----`) and all whitespace
/// are stripped before Base64 decoding. The DER is read as X.509
/// SubjectPublicKeyInfo first, then as a bare PKCS#1 `RSAPublicKey`.
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, AppError> {
    let encoded: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !(line.starts_with("-----BEGIN") || line.starts_with("-----END")))
        .flat_map(|line| line.chars())
        .filter(|c| !c.is_whitespace())
        .collect();

    if encoded.is_empty() {
        return Err(AppError::Authentication("Empty public key".to_string()));
    }

    let der = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| AppError::Authentication(format!("Public key is not base64: {}", e)))?;

    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| AppError::Authentication(format!("Failed to parse public key: {}", e)))
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm, when the signer sent one
    pub algorithm: Option<String>,
    /// Signed header names, lowercased, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

impl ParsedSignature {
    /// Actor URL the key belongs to (`keyId` without its fragment).
    pub fn actor_url(&self) -> &str {
        self.key_id.split('#').next().unwrap_or(&self.key_id)
    }
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Values may be quoted or bare. Tokens without `=` and unknown keys are
/// ignored.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    let mut parsed_tokens = 0;

    for part in header.split(',') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        parsed_tokens += 1;

        let key = key.trim();
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        if key.eq_ignore_ascii_case("keyId") {
            key_id = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("algorithm") {
            algorithm = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("headers") {
            headers = Some(
                value
                    .split_whitespace()
                    .map(|s| s.to_ascii_lowercase())
                    .collect::<Vec<_>>(),
            );
        } else if key.eq_ignore_ascii_case("signature") {
            signature = Some(value.to_string());
        }
    }

    if parsed_tokens < 3 {
        return Err(AppError::Authentication(
            "Signature tokens missing from http header".to_string(),
        ));
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| {
            AppError::Authentication("Header signature missing 'keyId'".to_string())
        })?,
        algorithm,
        headers: headers.ok_or_else(|| {
            AppError::Authentication("Header signature missing 'headers'".to_string())
        })?,
        signature: signature.ok_or_else(|| {
            AppError::Authentication("Header signature missing 'signature'".to_string())
        })?,
    })
}

/// Read and parse the `Signature` header of a request.
pub fn signature_from_headers(headers: &http::HeaderMap) -> Result<ParsedSignature, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Authentication("Signature missing from http header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Authentication("Invalid Signature header".to_string()))?;

    parse_signature_header(signature_header)
}

/// How strictly the signed `date` header is checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatePolicy {
    /// Maximum allowed distance from now; `None` accepts any date.
    pub max_skew_secs: Option<i64>,
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method of the received request
/// * `path` - Request path (and query) as received
/// * `headers` - All request headers
/// * `body` - Request body, checked against `digest` when it is signed
/// * `parsed` - Parsed `Signature` header
/// * `public_key` - Signer's public key
/// * `policy` - Date handling
///
/// # Errors
/// `AppError::Authentication` for every failure.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    parsed: &ParsedSignature,
    public_key: &RsaPublicKey,
    policy: DatePolicy,
) -> Result<(), AppError> {
    for required in REQUIRED_SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Authentication(format!(
                "{} is not in signed headers",
                required
            )));
        }
    }

    if let Some(max_skew) = policy.max_skew_secs {
        check_date(headers, max_skew)?;
    }

    if parsed.headers.iter().any(|h| h == "digest") {
        let digest = header_str(headers, "digest")
            .ok_or_else(|| AppError::Authentication("Missing Digest header".to_string()))?;
        let expected = generate_digest(body.unwrap_or_default());
        if digest != expected {
            return Err(AppError::Authentication("Digest mismatch".to_string()));
        }
    }

    let signing_string = signing_string(method, path, &parsed.headers, |name| {
        header_str(headers, name)
    })?;

    let signature_bytes = BASE64
        .decode(parsed.signature.as_bytes())
        .map_err(|_| AppError::Authentication("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Authentication(format!("Invalid signature format: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key.clone());
    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Authentication("Signature verify failed".to_string()))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn check_date(headers: &http::HeaderMap, max_skew_secs: i64) -> Result<(), AppError> {
    let date_str = header_str(headers, "date")
        .ok_or_else(|| AppError::Authentication("Missing Date header".to_string()))?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Authentication("Invalid Date format".to_string()))?;

    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > max_skew_secs {
        return Err(AppError::Authentication(
            "Date header too old or in future".to_string(),
        ));
    }
    Ok(())
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}
