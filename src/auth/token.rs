//! Access token claim inspection.
//!
//! Only the payload is decoded; signatures are the server's business.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
  /// Expiry, seconds since the epoch
  pub exp: Option<i64>,
  pub user_id: Option<serde_json::Value>,
}

/// Decode the claims segment of a JWT. Returns `None` for anything that is not
/// a well-formed three-part token.
pub fn decode_claims(token: &str) -> Option<Claims> {
  let mut parts = token.split('.');
  let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
  if parts.next().is_some() {
    return None;
  }

  let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
  serde_json::from_slice(&bytes).ok()
}

pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
  decode_claims(token)?
    .exp
    .and_then(|exp| DateTime::from_timestamp(exp, 0))
}

/// True when the token expires within `window` of `now`. Tokens without a
/// readable expiry are left alone.
pub fn expires_within(token: &str, window: Duration, now: DateTime<Utc>) -> bool {
  match expires_at(token) {
    Some(exp) => exp - now <= window,
    None => false,
  }
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
  let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
  let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"user_id":1}}"#, exp));
  format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_decode_expiry() {
    let token = make_token(1_700_000_000);
    assert_eq!(
      expires_at(&token),
      Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    );
  }

  #[test]
  fn test_garbage_tokens() {
    assert!(decode_claims("not-a-token").is_none());
    assert!(decode_claims("a.b").is_none());
    assert!(decode_claims("a.!!!.c").is_none());
    assert!(decode_claims("a.b.c.d").is_none());
    assert!(!expires_within("opaque", Duration::minutes(5), Utc::now()));
  }

  #[test]
  fn test_refresh_window() {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let soon = make_token((now + Duration::minutes(4)).timestamp());
    let later = make_token((now + Duration::minutes(50)).timestamp());
    let past = make_token((now - Duration::minutes(1)).timestamp());

    assert!(expires_within(&soon, Duration::minutes(5), now));
    assert!(!expires_within(&later, Duration::minutes(5), now));
    assert!(expires_within(&past, Duration::minutes(5), now));
  }
}
