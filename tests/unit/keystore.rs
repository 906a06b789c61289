//! Keystore Unit Tests

use gateway_enforcer::config::KeystoreConfig;
use gateway_enforcer::keystore::{KeyFamily, Keystore, SigningMaterial, TrustStore, TrustedCertificate};

use crate::fixture;

#[test]
fn test_trust_store_aliases_are_file_stems() {
    let store = TrustStore::load_dir(&fixture("truststore")).unwrap();
    assert_eq!(store.aliases(), vec!["apikey", "client", "idp", "internal"]);

    let idp = store.get("idp").unwrap();
    assert_eq!(idp.family, Some(KeyFamily::Rsa));
    assert!(idp.decoding_key().is_some());
    assert!(idp.subject.contains("issuer.gateway.test"));
}

#[test]
fn test_certificate_matched_by_der() {
    let store = TrustStore::load_dir(&fixture("truststore")).unwrap();

    let client = TrustedCertificate::from_pem("presented", &std::fs::read(fixture("client.pem")).unwrap()).unwrap();
    assert_eq!(store.find_by_der(&client.der).map(|c| c.alias.clone()), Some("client".to_string()));

    let stranger = TrustedCertificate::from_pem("presented", &std::fs::read(fixture("stranger.pem")).unwrap()).unwrap();
    assert!(store.find_by_der(&stranger.der).is_none());
}

#[test]
fn test_thumbprint_is_unpadded_sha256() {
    let cert = TrustedCertificate::from_pem("idp", &std::fs::read(fixture("issuer.pem")).unwrap()).unwrap();
    assert_eq!(cert.thumbprint_sha256.len(), 43);
    assert!(!cert.thumbprint_sha256.contains('='));
    assert!(cert.is_valid_at(cert.not_before));
    assert!(!cert.is_valid_at(cert.not_after + 1));
}

#[test]
fn test_signing_material_from_fixtures() {
    let material = SigningMaterial::load(&fixture("issuer.key"), &fixture("issuer.pem")).unwrap();
    assert!(!material.private_key_pkcs8.is_empty());
    assert_eq!(material.certificate.family, Some(KeyFamily::Rsa));

    // A certificate is not a private key.
    let pem = std::fs::read(fixture("issuer.pem")).unwrap();
    assert!(SigningMaterial::from_pem(&pem, &pem).is_err());
}

#[test]
fn test_reload_failure_keeps_previous_material() {
    let dir = std::env::temp_dir().join(format!("enforcer-truststore-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::copy(fixture("issuer.pem"), dir.join("idp.pem")).unwrap();

    let keystore = Keystore::load(KeystoreConfig {
        trust_store_dir: Some(dir.clone()),
        ..KeystoreConfig::default()
    })
    .unwrap();
    assert_eq!(keystore.trust_store().len(), 1);

    std::fs::copy(fixture("client.pem"), dir.join("client.pem")).unwrap();
    keystore.reload().unwrap();
    assert_eq!(keystore.trust_store().len(), 2);

    std::fs::remove_dir_all(&dir).unwrap();
    assert!(keystore.reload().is_err());
    assert_eq!(keystore.trust_store().len(), 2);
}
