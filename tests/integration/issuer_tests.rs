//! Certificate issuance from a mock certificate service

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use ecp_auth::{
    check_cert, get_cert, issue_credential, CheckOptions, EcpError, SessionOptions, ValidationError,
};
use ecp_tests::common::*;
use openssl::pkcs12::Pkcs12;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers the issuance form with a PKCS#12 bundle sealed with the
/// submitted export password
struct CertificateService {
    lifetimes: Arc<Mutex<Vec<String>>>,
}

impl Respond for CertificateService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let form: Vec<(String, String)> = url::form_urlencoded::parse(&request.body)
            .into_owned()
            .collect();
        let field = |name: &str| {
            form.iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        let cookie = request
            .headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let (Some(csrf), Some(password), Some(lifetime)) =
            (field("CSRF"), field("p12password"), field("p12lifetime"))
        else {
            return ResponseTemplate::new(400).set_body_string("incomplete form");
        };
        if field("submit").as_deref() != Some("pkcs12")
            || !cookie.contains(&format!("CSRF={}", csrf))
            || !cookie.contains(&format!("{}={}", SESSION_COOKIE, SESSION_VALUE))
        {
            return ResponseTemplate::new(403).set_body_string("forbidden");
        }
        self.lifetimes.lock().unwrap().push(lifetime);

        let credential = mint_credential("Albert Einstein albert.einstein@example.org", 3600 * 12);
        let bundle = Pkcs12::builder()
            .name("albert.einstein")
            .pkey(&credential.private_key)
            .cert(&credential.certificate)
            .build2(&password)
            .unwrap();
        ResponseTemplate::new(200)
            .set_body_raw(bundle.to_der().unwrap(), "application/x-pkcs12")
    }
}

async fn mount_certificate_service(server: &MockServer) -> Arc<Mutex<Vec<String>>> {
    let lifetimes = Arc::new(Mutex::new(Vec::new()));
    Mock::given(method("POST"))
        .and(path(CERT_SERVICE_PATH))
        .respond_with(CertificateService {
            lifetimes: lifetimes.clone(),
        })
        .mount(server)
        .await;
    lifetimes
}

#[tokio::test]
async fn test_issue_credential() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;
    let lifetimes = mount_certificate_service(&server).await;

    let session = open_basic_session(&server).await.unwrap();
    let sp_url = session.config().sp_url.clone();
    let credential = issue_credential(&session, &sp_url, 11.2).await.unwrap();

    assert_eq!(lifetimes.lock().unwrap().as_slice(), ["12"]);
    assert!(credential
        .certificate
        .public_key()
        .unwrap()
        .public_eq(&credential.private_key));
    check_cert(
        &credential.certificate,
        &CheckOptions {
            hours: 11.0,
            proxy: Some(false),
            ..Default::default()
        },
    )
    .unwrap();
}

#[tokio::test]
async fn test_get_cert_opens_and_closes_session() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;
    let lifetimes = mount_certificate_service(&server).await;

    let options = SessionOptions {
        password: Some(PASSWORD.to_string()),
        ..basic_options(&server)
    };
    let credential = get_cert(&test_config(&server), options, ecp_auth::DEFAULT_CERT_HOURS)
        .await
        .unwrap();
    assert_eq!(lifetimes.lock().unwrap().as_slice(), ["277"]);

    let pem = credential.to_pem().unwrap();
    let pem = String::from_utf8(pem).unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(pem.contains("PRIVATE KEY-----"));
}

#[tokio::test]
async fn test_service_error_is_propagated() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;
    Mock::given(method("POST"))
        .and(path(CERT_SERVICE_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("certificate service unavailable"))
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let sp_url = session.config().sp_url.clone();
    let err = issue_credential(&session, &sp_url, 1.0).await.unwrap_err();
    assert_matches!(err, EcpError::HttpStatus { status: 500, .. });
}

#[tokio::test]
async fn test_garbage_bundle_is_crypto_error() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;
    Mock::given(method("POST"))
        .and(path(CERT_SERVICE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a pkcs12 bundle".to_vec()))
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let sp_url = session.config().sp_url.clone();
    let err = issue_credential(&session, &sp_url, 1.0).await.unwrap_err();
    assert_matches!(err, EcpError::Crypto(_));
}

#[tokio::test]
async fn test_nonpositive_lifetime_is_rejected_before_any_request() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;
    let lifetimes = mount_certificate_service(&server).await;

    let session = open_basic_session(&server).await.unwrap();
    let sp_url = session.config().sp_url.clone();
    for hours in [-5.0, 0.0, f64::NAN] {
        let err = issue_credential(&session, &sp_url, hours).await.unwrap_err();
        assert_matches!(
            err,
            EcpError::Validation(ValidationError::InvalidLifetime { .. })
        );
    }

    assert!(lifetimes.lock().unwrap().is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}
