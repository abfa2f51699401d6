use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC signer for playback proxy urls, the proxy verifies with the same secret
pub struct SignatureUtil {
    secret: String,
}

impl SignatureUtil {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// sig covers client_id + expiry + encoded manifest url, client_id is a hash of IP + User-Agent
    pub fn generate_signature(&self, client_id: &str, expiry: i64, url: &str) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            // hmac takes keys of any length, this arm never runs
            Err(_) => return String::new(),
        };

        mac.update(client_id.as_bytes());
        mac.update(expiry.to_string().as_bytes());
        mac.update(url.as_bytes());

        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify_signature(&self, client_id: &str, expiry: i64, url: &str, signature: &str) -> bool {
        if Utc::now().timestamp() > expiry {
            return false;
        }

        let Ok(signature) = hex::decode(signature) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(client_id.as_bytes());
        mac.update(expiry.to_string().as_bytes());
        mac.update(url.as_bytes());

        // constant time compare
        mac.verify_slice(&signature).is_ok()
    }

    pub fn generate_expiry(minutes: i64) -> i64 {
        Utc::now().timestamp() + minutes * 60
    }
}
