use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Short-lived bearer credential carried in the query string at attach:
/// `{user_id}.{expiry_unix}.{hex signature}`.
#[derive(Error, Debug, PartialEq)]
pub enum AuthError {
    #[error("Malformed token")]
    Malformed,
    #[error("Token expired")]
    Expired,
    #[error("Invalid signature")]
    BadSignature,
}

pub fn issue_token(secret: &str, user_id: Uuid, expiry: OffsetDateTime) -> String {
    let expiry = expiry.unix_timestamp();
    let signature = sign(secret, user_id, expiry);
    format!("{user_id}.{expiry}.{signature}")
}

pub fn verify_token(secret: &str, token: &str, now: OffsetDateTime) -> Result<Uuid, AuthError> {
    let mut parts = token.splitn(3, '.');
    let user_id = parts
        .next()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(AuthError::Malformed)?;
    let expiry = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(AuthError::Malformed)?;
    let signature = parts.next().ok_or(AuthError::Malformed)?;

    let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length to work");
    mac.update(payload(user_id, expiry).as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::BadSignature)?;

    if expiry < now.unix_timestamp() {
        return Err(AuthError::Expired);
    }

    Ok(user_id)
}

fn payload(user_id: Uuid, expiry: i64) -> String {
    format!("{user_id}.{expiry}")
}

fn sign(secret: &str, user_id: Uuid, expiry: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length to work");
    mac.update(payload(user_id, expiry).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    const SECRET: &str = "test-token-secret";

    #[test]
    fn issued_tokens_verify() {
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let token = issue_token(SECRET, user_id, now + Duration::minutes(5));

        assert_eq!(verify_token(SECRET, &token, now), Ok(user_id));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let token = issue_token(SECRET, user_id, now - Duration::seconds(1));

        assert_eq!(verify_token(SECRET, &token, now), Err(AuthError::Expired));
    }

    #[test]
    fn tampered_tokens_fail_the_signature_check() {
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let token = issue_token(SECRET, user_id, now + Duration::minutes(5));

        // Swap the user id for another one, keeping the signature.
        let other = Uuid::new_v4();
        let forged = format!("{other}{}", &token[36..]);

        assert_eq!(
            verify_token(SECRET, &forged, now),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn tokens_signed_with_another_secret_are_rejected() {
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let token = issue_token("other-secret", user_id, now + Duration::minutes(5));

        assert_eq!(
            verify_token(SECRET, &token, now),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            verify_token(SECRET, "not-a-token", now),
            Err(AuthError::Malformed)
        );
    }
}
