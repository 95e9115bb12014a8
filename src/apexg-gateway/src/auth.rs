use apexg_core::AuthPolicy;
use apexg_errors::{GatewayError, GatewayResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

fn header_get<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn query_get(query: Option<&str>, name: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Strips an authorization scheme, case-insensitively.
fn credentials<'a>(headers: &'a HeaderMap, scheme: &str) -> Option<&'a str> {
    let value = header_get(headers, "authorization")?.trim();
    let (given, rest) = value.split_once(' ')?;
    given.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

/// Checks the caller against an endpoint policy.
///
/// Returns the authenticated caller id, or `None` for open endpoints.
pub fn authenticate(
    policy: &AuthPolicy,
    headers: &HeaderMap,
    query: Option<&str>,
) -> GatewayResult<Option<String>> {
    match policy {
        AuthPolicy::None => Ok(None),
        AuthPolicy::ApiKey { header_name, query_param, keys } => {
            let key = header_get(headers, header_name)
                .map(str::to_string)
                .or_else(|| query_param.as_deref().and_then(|p| query_get(query, p)))
                .ok_or(GatewayError::Unauthenticated)?;
            keys.get(&key).cloned().map(Some).ok_or(GatewayError::Unauthenticated)
        }
        AuthPolicy::Bearer { tokens, secret, issuer } => {
            let token = credentials(headers, "bearer").ok_or(GatewayError::Unauthenticated)?;
            if let Some(caller) = tokens.get(token) {
                return Ok(Some(caller.clone()));
            }
            let secret = secret.as_deref().ok_or(GatewayError::Unauthenticated)?;
            verify_jwt(token, secret, issuer.as_deref()).map(Some)
        }
        AuthPolicy::Basic { users } => basic(headers, users).map(Some),
    }
}

fn verify_jwt(token: &str, secret: &str, issuer: Option<&str>) -> GatewayResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(iss) = issuer {
        validation.set_issuer(&[iss]);
    }
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims.sub)
        .map_err(|e| {
            debug!(error = %e, "jwt rejected");
            GatewayError::Unauthenticated
        })
}

fn basic(headers: &HeaderMap, users: &HashMap<String, String>) -> GatewayResult<String> {
    let encoded = credentials(headers, "basic").ok_or(GatewayError::Unauthenticated)?;
    let decoded = STANDARD
        .decode(encoded)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or(GatewayError::Unauthenticated)?;
    let (user, pass) = decoded.split_once(':').ok_or(GatewayError::Unauthenticated)?;
    match users.get(user) {
        Some(expected) if expected == pass => Ok(user.to_string()),
        _ => Err(GatewayError::Unauthenticated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_str(value).unwrap());
        h
    }

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: i64,
        iss: &'a str,
    }

    fn jwt(secret: &str, sub: &str, iss: &str, exp_offset: i64) -> String {
        let claims = TestClaims { sub, iss, exp: chrono::Utc::now().timestamp() + exp_offset };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn open_endpoints_pass() {
        assert_eq!(authenticate(&AuthPolicy::None, &HeaderMap::new(), None), Ok(None));
    }

    #[test]
    fn api_key_from_header_or_query() {
        let policy = AuthPolicy::ApiKey {
            header_name: "x-api-key".into(),
            query_param: Some("api_key".into()),
            keys: [("k-123".to_string(), "partner-a".to_string())].into(),
        };
        assert_eq!(
            authenticate(&policy, &headers("x-api-key", "k-123"), None),
            Ok(Some("partner-a".into()))
        );
        assert_eq!(
            authenticate(&policy, &HeaderMap::new(), Some("x=1&api_key=k-123")),
            Ok(Some("partner-a".into()))
        );
        assert_eq!(
            authenticate(&policy, &headers("x-api-key", "wrong"), None),
            Err(GatewayError::Unauthenticated)
        );
        assert_eq!(authenticate(&policy, &HeaderMap::new(), None), Err(GatewayError::Unauthenticated));
    }

    #[test]
    fn bearer_static_tokens_and_jwt() {
        let policy = AuthPolicy::Bearer {
            tokens: [("static-tok".to_string(), "ops".to_string())].into(),
            secret: Some("s3cret".into()),
            issuer: Some("apexrebate".into()),
        };
        assert_eq!(
            authenticate(&policy, &headers("authorization", "Bearer static-tok"), None),
            Ok(Some("ops".into()))
        );

        let good = jwt("s3cret", "user_42", "apexrebate", 3600);
        assert_eq!(
            authenticate(&policy, &headers("authorization", &format!("bearer {}", good)), None),
            Ok(Some("user_42".into()))
        );

        let wrong_secret = jwt("other", "user_42", "apexrebate", 3600);
        let wrong_issuer = jwt("s3cret", "user_42", "someone", 3600);
        let expired = jwt("s3cret", "user_42", "apexrebate", -3600);
        for token in [wrong_secret, wrong_issuer, expired] {
            assert_eq!(
                authenticate(&policy, &headers("authorization", &format!("Bearer {}", token)), None),
                Err(GatewayError::Unauthenticated)
            );
        }
        assert_eq!(
            authenticate(&policy, &headers("authorization", "Basic abc"), None),
            Err(GatewayError::Unauthenticated)
        );
    }

    #[test]
    fn basic_credentials() {
        let policy = AuthPolicy::Basic { users: [("admin".to_string(), "pa:ss".to_string())].into() };
        let ok = format!("Basic {}", STANDARD.encode("admin:pa:ss"));
        assert_eq!(authenticate(&policy, &headers("authorization", &ok), None), Ok(Some("admin".into())));

        let bad = format!("Basic {}", STANDARD.encode("admin:nope"));
        assert_eq!(authenticate(&policy, &headers("authorization", &bad), None), Err(GatewayError::Unauthenticated));
        assert_eq!(
            authenticate(&policy, &headers("authorization", "Basic !!!"), None),
            Err(GatewayError::Unauthenticated)
        );
    }
}
