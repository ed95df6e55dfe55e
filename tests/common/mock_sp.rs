//! A Shibboleth SP and IdP pair served by wiremock
//!
//! One `MockServer` plays every role: the protected resource, the
//! assertion consumer service, the IdP ECP endpoint and the institution
//! directory.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use wiremock::matchers::{basic_auth, body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the protected resource and certificate service
pub const CERT_SERVICE_PATH: &str = "/secure/getcert";

/// Path of the SP's assertion consumer service
pub const ACS_PATH: &str = "/Shibboleth.sso/SAML2/ECP";

/// Path of the IdP ECP endpoint
pub const IDP_PATH: &str = "/idp/profile/SAML2/SOAP/ECP";

/// Path of the institution directory
pub const DIRECTORY_PATH: &str = "/ecpidps.txt";

/// Relay state echoed back to the SP
pub const RELAY_STATE: &str = "ss:mem:6a7b2c";

/// Name of the session cookie minted by the ACS
pub const SESSION_COOKIE: &str = "_shibsession_64656661756c7468747470733a2f2f";

/// Value of the session cookie minted by the ACS
pub const SESSION_VALUE: &str = "_a1b2c3d4e5f6";

/// Body served once the session cookie is presented
pub const PROTECTED_BODY: &str = "<html>protected content</html>";

/// ECP endpoint of the mock IdP
pub fn idp_endpoint(server: &MockServer) -> String {
    format!("{}{}", server.uri(), IDP_PATH)
}

/// PAOS request naming `response_consumer_url`
pub fn sp_envelope(response_consumer_url: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<S:Envelope xmlns:S="http://schemas.xmlsoap.org/soap/envelope/"><S:Header>"#,
            r#"<paos:Request xmlns:paos="urn:liberty:paos:2003-08" S:actor="http://schemas.xmlsoap.org/soap/actor/next" S:mustUnderstand="1" responseConsumerURL="{}" service="urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp"/>"#,
            r#"<ecp:Request xmlns:ecp="urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp" IsPassive="0" S:actor="http://schemas.xmlsoap.org/soap/actor/next" S:mustUnderstand="1"/>"#,
            r#"<ecp:RelayState xmlns:ecp="urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp" S:actor="http://schemas.xmlsoap.org/soap/actor/next" S:mustUnderstand="1">{}</ecp:RelayState>"#,
            r#"</S:Header><S:Body>"#,
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" AssertionConsumerServiceURL="{}" ID="_ec1025e786e6fff3" ProtocolBinding="urn:oasis:names:tc:SAML:2.0:bindings:PAOS" Version="2.0"/>"#,
            r#"</S:Body></S:Envelope>"#,
        ),
        response_consumer_url, RELAY_STATE, response_consumer_url
    )
}

/// IdP response naming `acs_url`
pub fn idp_envelope(acs_url: &str) -> String {
    format!(
        concat!(
            r#"<soap11:Envelope xmlns:soap11="http://schemas.xmlsoap.org/soap/envelope/"><soap11:Header>"#,
            r#"<ecp:Response xmlns:ecp="urn:oasis:names:tc:SAML:2.0:profiles:SSO:ecp" AssertionConsumerServiceURL="{}" soap11:actor="http://schemas.xmlsoap.org/soap/actor/next" soap11:mustUnderstand="1"/>"#,
            r#"</soap11:Header><soap11:Body>"#,
            r#"<saml2p:Response xmlns:saml2p="urn:oasis:names:tc:SAML:2.0:protocol" Destination="{}" ID="_9c2f0b7e" Version="2.0"/>"#,
            r#"</soap11:Body></soap11:Envelope>"#,
        ),
        acs_url, acs_url
    )
}

/// `Authorization` header value carrying `token`
pub fn negotiate_header(token: &str) -> String {
    format!("Negotiate {}", STANDARD.encode(token))
}

/// Mount the SP side: the protected resource and the ACS.
///
/// Requests carrying a cookie get [`PROTECTED_BODY`]; everything else gets
/// a PAOS request whose response consumer is the ACS.
pub async fn mount_service_provider(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(CERT_SERVICE_PATH))
        .and(header_exists("cookie"))
        .respond_with(ResponseTemplate::new(200).set_body_string(PROTECTED_BODY))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(CERT_SERVICE_PATH))
        .and(header_exists("paos"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sp_envelope(&format!("{}{}", server.uri(), ACS_PATH)),
            "application/vnd.paos+xml",
        ))
        .mount(server)
        .await;

    mount_acs(server, ACS_PATH).await;
}

/// Mount an ACS at `acs_path` that accepts the relay state and mints the
/// session cookie
pub async fn mount_acs(server: &MockServer, acs_path: &str) {
    Mock::given(method("POST"))
        .and(path(acs_path))
        .and(header("content-type", "application/vnd.paos+xml"))
        .and(body_string_contains(RELAY_STATE))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header(
                    "set-cookie",
                    format!("{}={}; path=/; HttpOnly", SESSION_COOKIE, SESSION_VALUE).as_str(),
                )
                .insert_header(
                    "location",
                    format!("{}{}", server.uri(), CERT_SERVICE_PATH).as_str(),
                ),
        )
        .mount(server)
        .await;
}

/// Mount an IdP that accepts the test user's password and answers with an
/// assertion for `acs_url`; anything else gets a 401
pub async fn mount_password_idp(server: &MockServer, acs_url: &str) {
    Mock::given(method("POST"))
        .and(path(IDP_PATH))
        .and(basic_auth(super::USERNAME, super::PASSWORD))
        .respond_with(ResponseTemplate::new(200).set_body_raw(idp_envelope(acs_url), "text/xml"))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(IDP_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

/// Mount the whole password-authenticated flow
pub async fn mount_ecp_flow(server: &MockServer) {
    mount_service_provider(server).await;
    mount_password_idp(server, &format!("{}{}", server.uri(), ACS_PATH)).await;
}

/// Serve `entries` (`(name, url)`) as the institution directory
pub async fn mount_directory(server: &MockServer, entries: &[(&str, String)]) {
    let body: String = entries
        .iter()
        .map(|(name, url)| format!("{} {}\n", url, name))
        .collect();
    Mock::given(method("GET"))
        .and(path(DIRECTORY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}
