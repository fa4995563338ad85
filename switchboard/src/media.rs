use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRole {
    Publisher,
    Subscriber,
}

impl MediaRole {
    fn as_str(&self) -> &'static str {
        match self {
            MediaRole::Publisher => "publisher",
            MediaRole::Subscriber => "subscriber",
        }
    }
}

/// Derives per-channel, per-participant join credentials for the external
/// media transport. A pure function of
/// `(app_id, certificate, channel, uid, role, expiry)` — nothing here is
/// stored, and refreshing a token is just deriving it again with a later
/// expiry.
#[derive(Clone)]
pub struct MediaTokenIssuer {
    app_id: String,
    app_certificate: String,
    token_ttl_secs: u64,
}

impl MediaTokenIssuer {
    pub fn new(app_id: String, app_certificate: String, token_ttl_secs: u64) -> Self {
        Self {
            app_id,
            app_certificate,
            token_ttl_secs,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn token_ttl_secs(&self) -> u64 {
        self.token_ttl_secs
    }

    /// Channel name for a call session. Derived once at allocation and
    /// persisted with the session so both participants join the same room.
    pub fn channel_name(session_id: Uuid, allocated_at: OffsetDateTime) -> String {
        format!(
            "call_{}_{}",
            session_id.simple(),
            allocated_at.unix_timestamp()
        )
    }

    /// Stable in-channel uid for a participant.
    pub fn participant_uid(user_id: Uuid) -> u32 {
        let bytes = user_id.as_bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn issue(
        &self,
        channel: &str,
        uid: u32,
        role: MediaRole,
        now: OffsetDateTime,
    ) -> commons::MediaCredentials {
        let expiry = now.unix_timestamp() + self.token_ttl_secs as i64;
        let payload = format!(
            "{TOKEN_VERSION}:{}:{channel}:{uid}:{}:{expiry}",
            self.app_id,
            role.as_str()
        );

        let mut mac = HmacSha256::new_from_slice(self.app_certificate.as_bytes())
            .expect("any key length to work");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        commons::MediaCredentials {
            app_id: self.app_id.clone(),
            channel: channel.to_string(),
            uid,
            token: format!("{payload}:{signature}"),
            expires_in_secs: self.token_ttl_secs,
            // The caller narrows this to the session's kind.
            kind: commons::CallKind::Both,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> MediaTokenIssuer {
        MediaTokenIssuer::new("app-id".to_string(), "certificate".to_string(), 7200)
    }

    #[test]
    fn token_is_a_pure_function_of_its_inputs() {
        let now = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();
        let a = issuer().issue("call_abc_1", 42, MediaRole::Publisher, now);
        let b = issuer().issue("call_abc_1", 42, MediaRole::Publisher, now);
        assert_eq!(a.token, b.token);
    }

    #[test]
    fn token_binds_channel_uid_and_role() {
        let now = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();
        let base = issuer().issue("call_abc_1", 42, MediaRole::Publisher, now);

        let other_channel = issuer().issue("call_abc_2", 42, MediaRole::Publisher, now);
        let other_uid = issuer().issue("call_abc_1", 43, MediaRole::Publisher, now);
        let other_role = issuer().issue("call_abc_1", 42, MediaRole::Subscriber, now);

        assert_ne!(base.token, other_channel.token);
        assert_ne!(base.token, other_uid.token);
        assert_ne!(base.token, other_role.token);
    }

    #[test]
    fn participant_uid_is_stable_per_user() {
        let user = Uuid::new_v4();
        assert_eq!(
            MediaTokenIssuer::participant_uid(user),
            MediaTokenIssuer::participant_uid(user)
        );
    }

    #[test]
    fn channel_name_carries_the_session_id() {
        let session_id = Uuid::new_v4();
        let now = OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap();
        let channel = MediaTokenIssuer::channel_name(session_id, now);
        assert!(channel.contains(&session_id.simple().to_string()));
    }
}
