//! End-to-end ECP handshakes against a mock SP and IdP

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use ecp_auth::{
    with_session, EcpError, EcpSession, SessionOptions, StaticPrompt, ECP_NS,
};
use ecp_tests::common::*;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_authenticate_mints_session_cookie() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let session = open_basic_session(&server).await.unwrap();
    assert_eq!(session.endpoint(), idp_endpoint(&server));

    let url = format!("{}{}", server.uri(), CERT_SERVICE_PATH);
    let cookie = session.authenticate(&url).await.unwrap();
    assert_eq!(cookie.name, SESSION_COOKIE);
    assert_eq!(cookie.value, SESSION_VALUE);
    assert_eq!(cookie.domain, "127.0.0.1");
    assert!(cookie.is_session());

    // the same cookie landed in the shared jar
    assert!(ecp_auth::has_session_cookies(session.cookies(), &url));
}

#[tokio::test]
async fn test_idp_receives_envelope_without_sp_header() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let session = open_basic_session(&server).await.unwrap();
    session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let idp_post = requests
        .iter()
        .find(|r| r.url.path() == IDP_PATH && r.headers.contains_key("authorization"))
        .expect("IdP was contacted");
    let body = String::from_utf8_lossy(&idp_post.body);
    assert!(body.contains("samlp:AuthnRequest"));
    assert!(!body.contains("paos:Request"));
    assert!(!body.contains(RELAY_STATE));
    assert_eq!(
        idp_post.headers.get("content-type").unwrap(),
        "text/xml; charset=utf-8"
    );

    let sp_get = requests
        .iter()
        .find(|r| r.url.path() == CERT_SERVICE_PATH)
        .unwrap();
    let paos = sp_get.headers.get("paos").unwrap().to_str().unwrap();
    assert!(paos.contains(ECP_NS));

    let acs_post = requests.iter().find(|r| r.url.path() == ACS_PATH).unwrap();
    let body = String::from_utf8_lossy(&acs_post.body);
    assert!(body.contains("ecp:RelayState"));
    assert!(!body.contains("ecp:Response"));
    assert!(body.contains("saml2p:Response"));
}

#[tokio::test]
async fn test_get_completes_handshake_on_demand() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let session = open_basic_session(&server).await.unwrap();
    let response = session
        .get(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), PROTECTED_BODY);

    // a second GET rides on the existing cookie
    let before = server.received_requests().await.unwrap().len();
    let response = session
        .get(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), PROTECTED_BODY);
    assert_eq!(server.received_requests().await.unwrap().len(), before + 1);
}

#[tokio::test]
async fn test_get_cookie_for_other_url() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let mut config = test_config(&server);
    config.sp_url = format!("{}/elsewhere", server.uri());
    let url = format!("{}{}", server.uri(), CERT_SERVICE_PATH);

    // with_session uses the terminal prompt, so the password comes from the options
    let options = SessionOptions {
        password: Some(PASSWORD.to_string()),
        ..basic_options(&server)
    };
    let cookie = with_session(&config, options, move |session| {
        Box::pin(async move { session.get_cookie(&url).await })
    })
    .await
    .unwrap();
    assert_eq!(cookie.name, SESSION_COOKIE);
}

#[tokio::test]
async fn test_wrong_password_is_authentication_failure() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let session = EcpSession::builder(test_config(&server), basic_options(&server))
        .prompt(Arc::new(StaticPrompt::new(USERNAME, "E=mc^3")))
        .open()
        .await
        .unwrap();
    let err = session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap_err();
    assert_matches!(err, EcpError::AuthenticationFailed { ref endpoint } if endpoint.ends_with(IDP_PATH));
    assert!(err.to_string().contains("incorrectly entered your passphrase"));
}

#[tokio::test]
async fn test_html_login_page_is_authentication_failure() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_service_provider(&server).await;
    Mock::given(method("POST"))
        .and(path(IDP_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body><form>Login<br></form></body></html>", "text/html"),
        )
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let err = session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap_err();
    assert_matches!(err, EcpError::AuthenticationFailed { .. });
}

#[tokio::test]
async fn test_sp_error_status_is_reported() {
    setup_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CERT_SERVICE_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let err = session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap_err();
    assert_matches!(err, EcpError::HttpStatus { status: 503, ref body, .. } if body == "maintenance");
    assert_eq!(err.status_code(), Some(503));
}

#[tokio::test]
async fn test_acs_mismatch_sends_fault_and_continues() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_service_provider(&server).await;

    // the IdP names a different ACS than the SP asked for
    let other_acs = "/Shibboleth.sso/SAML2/ECP/alt";
    mount_acs(&server, other_acs).await;
    mount_password_idp(&server, &format!("{}{}", server.uri(), other_acs)).await;
    Mock::given(method("POST"))
        .and(path(ACS_PATH))
        .and(body_string_contains("S:Fault"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(1)
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let cookie = session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap();
    assert_eq!(cookie.name, SESSION_COOKIE);

    // the fault is delivered in the background
    let mut delivered = false;
    for _ in 0..50 {
        let requests = server.received_requests().await.unwrap();
        if requests.iter().any(|r| {
            r.url.path() == ACS_PATH && String::from_utf8_lossy(&r.body).contains("faultstring")
        }) {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delivered, "SOAP fault never reached the response consumer");
}

#[tokio::test]
async fn test_missing_session_cookie() {
    setup_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CERT_SERVICE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sp_envelope(&format!("{}{}", server.uri(), ACS_PATH)),
            "application/vnd.paos+xml",
        ))
        .mount(&server)
        .await;
    mount_password_idp(&server, &format!("{}{}", server.uri(), ACS_PATH)).await;
    // ACS accepts the assertion but never sets a cookie
    Mock::given(method("POST"))
        .and(path(ACS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let session = open_basic_session(&server).await.unwrap();
    let err = session
        .authenticate(&format!("{}{}", server.uri(), CERT_SERVICE_PATH))
        .await
        .unwrap_err();
    assert_matches!(err, EcpError::SessionCookieNotFound { ref host } if host == "127.0.0.1");
}

#[tokio::test]
async fn test_prepopulated_jar_skips_handshake() {
    setup_test_logging();
    let server = MockServer::start().await;
    mount_ecp_flow(&server).await;

    let url = format!("{}{}", server.uri(), CERT_SERVICE_PATH);
    let jar = Arc::new(ecp_auth::CookieJar::new());
    jar.insert(ecp_auth::SessionCookie::new(
        "127.0.0.1",
        SESSION_COOKIE,
        "_reused",
    ));

    let session = EcpSession::builder(test_config(&server), basic_options(&server))
        .prompt(Arc::new(StaticPrompt::none()))
        .cookie_jar(jar)
        .open()
        .await
        .unwrap();
    let response = session.get(&url).await.unwrap();
    assert_eq!(response.text().await.unwrap(), PROTECTED_BODY);

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != IDP_PATH));
}
