use resolver::server::utils::signature_utils::SignatureUtil;

#[test]
fn test_signature_generation() {
    let util = SignatureUtil::new("test_secret".to_string());
    let sig1 = util.generate_signature("client123", 1234567890, "aHR0cHM6Ly9jZG4uZXhhbXBsZS9tLm0zdTg");
    let sig2 = util.generate_signature("client123", 1234567890, "aHR0cHM6Ly9jZG4uZXhhbXBsZS9tLm0zdTg");

    assert_eq!(sig1, sig2);
    // hex encoded sha256
    assert_eq!(sig1.len(), 64);

    let other_secret = SignatureUtil::new("other_secret".to_string());
    assert_ne!(
        sig1,
        other_secret.generate_signature("client123", 1234567890, "aHR0cHM6Ly9jZG4uZXhhbXBsZS9tLm0zdTg")
    );
}

#[test]
fn test_signature_verification() {
    let util = SignatureUtil::new("test_secret".to_string());
    let future_expiry = SignatureUtil::generate_expiry(12);
    let url = "aHR0cHM6Ly9jZG4uZXhhbXBsZS9tLm0zdTg";
    let client_id = "client123";

    let signature = util.generate_signature(client_id, future_expiry, url);

    assert!(util.verify_signature(client_id, future_expiry, url, &signature));

    assert!(!util.verify_signature(client_id, future_expiry, url, "invalid"));

    // bound to client, expiry and url
    assert!(!util.verify_signature("different_client", future_expiry, url, &signature));
    assert!(!util.verify_signature(client_id, future_expiry + 1, url, &signature));
    assert!(!util.verify_signature(client_id, future_expiry, "b3RoZXI", &signature));
}

#[test]
fn test_expired_signature() {
    let util = SignatureUtil::new("test_secret".to_string());
    let past_expiry = 1234567890; // a while ago
    let url = "aHR0cHM6Ly9jZG4uZXhhbXBsZS9tLm0zdTg";
    let client_id = "client123";

    let signature = util.generate_signature(client_id, past_expiry, url);

    assert!(!util.verify_signature(client_id, past_expiry, url, &signature));
}

#[test]
fn test_expiry_is_in_minutes() {
    let now = chrono::Utc::now().timestamp();
    let expiry = SignatureUtil::generate_expiry(12);

    assert!((expiry - now - 12 * 60).abs() <= 1);
}
