//! Captive portal detection and best-effort login.
//!
//! Public networks intercept HTTP and redirect to a login page before
//! granting internet access. Detection probes well-known connectivity-check
//! endpoints that return a fixed body when the network is open; anything else
//! is a portal. Login scrapes the portal page for a credential form and
//! submits it, then re-probes to confirm access was actually granted (many
//! portals answer 200 to failed logins too).
//!
//! Every network-layer failure here is recoverable: the uplink may still
//! have valid layer-2 connectivity, so nothing in this module returns a
//! fatal error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) pi-router";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);
const POST_LOGIN_GRACE: Duration = Duration::from_secs(2);

/// What a connectivity probe expects from an open network.
enum Expect {
    /// 204 with an empty body.
    NoContent,
    /// 200 with the marker somewhere in the body.
    BodyContains(&'static str),
}

struct Probe {
    url: &'static str,
    expect: Expect,
}

const PROBES: &[Probe] = &[
    Probe {
        url: "http://connectivitycheck.gstatic.com/generate_204",
        expect: Expect::NoContent,
    },
    Probe {
        url: "http://clients3.google.com/generate_204",
        expect: Expect::NoContent,
    },
    Probe {
        url: "http://captive.apple.com/hotspot-detect.html",
        expect: Expect::BodyContains("Success"),
    },
];

/// Detection outcome for one uplink activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalDetection {
    /// No HTTP response at all: no portal, but no internet either.
    NoPortal,
    /// A response arrived but not the expected one.
    PortalDetected,
    /// The probe body matched exactly.
    InternetConfirmed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalSession {
    pub detection: PortalDetection,
    pub portal_url: Option<String>,
    pub has_internet: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub message: String,
}

/// Probe client: redirects must surface as 3xx responses, not be followed.
pub fn probe_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .redirect(Policy::none())
        .timeout(PROBE_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

fn login_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .redirect(Policy::limited(5))
        .timeout(LOGIN_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Run the detection algorithm against the fixed probe list.
pub async fn detect(client: &Client) -> PortalSession {
    detect_with(client, PROBES).await
}

async fn detect_with(client: &Client, probes: &[Probe]) -> PortalSession {
    for probe in probes {
        let response = match client.get(probe.url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = probe.url, error = %e, "probe unreachable");
                continue;
            }
        };

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if is_redirect(status) {
            let portal_url = location.unwrap_or_default();
            info!(url = probe.url, portal = %portal_url, "probe redirected, captive portal detected");
            return PortalSession {
                detection: PortalDetection::PortalDetected,
                portal_url: (!portal_url.is_empty()).then_some(portal_url),
                has_internet: false,
                checked_at: Utc::now(),
            };
        }

        let body = response.text().await.unwrap_or_default();
        let matched = match probe.expect {
            Expect::NoContent => status == 204 && body.is_empty(),
            Expect::BodyContains(marker) => status == 200 && body.contains(marker),
        };

        if matched {
            debug!(url = probe.url, "connectivity confirmed");
            return PortalSession {
                detection: PortalDetection::InternetConfirmed,
                portal_url: None,
                has_internet: true,
                checked_at: Utc::now(),
            };
        }

        // A response arrived but not the expected content: intercepted.
        let portal_url = extract_form(&body)
            .and_then(|f| f.action)
            .and_then(|action| absolutize(probe.url, &action));
        info!(url = probe.url, status, "unexpected probe response, captive portal detected");
        return PortalSession {
            detection: PortalDetection::PortalDetected,
            portal_url,
            has_internet: false,
            checked_at: Utc::now(),
        };
    }

    // Nothing answered at all.
    PortalSession {
        detection: PortalDetection::NoPortal,
        portal_url: None,
        has_internet: false,
        checked_at: Utc::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub kind: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalForm {
    pub action: Option<String>,
    pub method: String,
    pub fields: Vec<FormField>,
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{attr}=");
    let mut search = 0;
    while let Some(rel) = lower[search..].find(&needle) {
        let at = search + rel;
        // Must be preceded by whitespace so `action=` does not match
        // `formaction=`.
        if at > 0 && !lower.as_bytes()[at - 1].is_ascii_whitespace() {
            search = at + needle.len();
            continue;
        }
        let rest = &tag[at + needle.len()..];
        let mut chars = rest.chars();
        return match chars.next() {
            Some(q @ ('"' | '\'')) => {
                let rest = &rest[1..];
                rest.find(q).map(|end| rest[..end].to_string())
            }
            Some(_) => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                Some(rest[..end].to_string())
            }
            None => None,
        };
    }
    None
}

/// Scrape the first form out of portal HTML. Best effort; portal markup is
/// not standardized.
pub fn extract_form(html: &str) -> Option<PortalForm> {
    let lower = html.to_ascii_lowercase();
    let start = lower.find("<form")?;
    let tag_end = lower[start..].find('>')? + start;
    let form_tag = &html[start..tag_end];

    let body_end = lower[tag_end..]
        .find("</form")
        .map(|i| tag_end + i)
        .unwrap_or(html.len());
    let form_body = &html[tag_end..body_end];
    let body_lower = &lower[tag_end..body_end];

    let mut fields = Vec::new();
    let mut search = 0;
    while let Some(rel) = body_lower[search..].find("<input") {
        let at = search + rel;
        let end = body_lower[at..]
            .find('>')
            .map(|i| at + i)
            .unwrap_or(form_body.len());
        let input_tag = &form_body[at..end];
        if let Some(name) = attr_value(input_tag, "name") {
            fields.push(FormField {
                name,
                kind: attr_value(input_tag, "type").unwrap_or_else(|| "text".to_string()),
                value: attr_value(input_tag, "value"),
            });
        }
        search = end;
    }

    Some(PortalForm {
        action: attr_value(form_tag, "action"),
        method: attr_value(form_tag, "method")
            .map(|m| m.to_ascii_lowercase())
            .unwrap_or_else(|| "post".to_string()),
        fields,
    })
}

fn absolutize(base: &str, action: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(action).ok().map(|u| u.to_string())
}

/// Fill the form's fields from supplied credentials. Hidden inputs keep
/// their markup values. Returns `Err` with a reason when the form wants a
/// password that was not supplied.
pub fn fill_form(
    form: &PortalForm,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<Vec<(String, String)>, String> {
    let mut params = Vec::new();
    let mut username_used = false;

    for field in &form.fields {
        let value = match field.kind.as_str() {
            "password" => match password {
                Some(p) => p.to_string(),
                None => return Err(format!("portal form requires a password ({})", field.name)),
            },
            "text" | "email" if !username_used && username.is_some() => {
                username_used = true;
                username.unwrap_or_default().to_string()
            }
            // submit buttons, checkboxes, hidden inputs: keep markup value
            _ => field.value.clone().unwrap_or_default(),
        };
        params.push((field.name.clone(), value));
    }
    Ok(params)
}

/// Fetch the portal page, submit its form, and re-probe once after a grace
/// delay. `success` reflects confirmed internet access, never the POST alone.
pub async fn login(
    portal_url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> LoginOutcome {
    let client = match login_client() {
        Ok(c) => c,
        Err(e) => {
            return LoginOutcome {
                success: false,
                message: format!("could not build HTTP client: {e}"),
            };
        }
    };

    let page = match client.get(portal_url).send().await {
        Ok(r) => r.text().await.unwrap_or_default(),
        Err(e) => {
            warn!(url = portal_url, error = %e, "portal page fetch failed");
            return LoginOutcome {
                success: false,
                message: format!("portal page fetch failed: {e}"),
            };
        }
    };

    let Some(form) = extract_form(&page) else {
        return LoginOutcome {
            success: false,
            message: "no login form found on portal page".to_string(),
        };
    };

    let params = match fill_form(&form, username, password) {
        Ok(p) => p,
        Err(reason) => {
            return LoginOutcome {
                success: false,
                message: reason,
            };
        }
    };

    let target = form
        .action
        .as_deref()
        .and_then(|a| absolutize(portal_url, a))
        .unwrap_or_else(|| portal_url.to_string());

    let request = if form.method == "get" {
        client.get(&target).query(&params)
    } else {
        client.post(&target).form(&params)
    };

    // Portal password stays out of the logs.
    info!(url = %target, method = %form.method, fields = params.len(), "submitting portal form");
    if let Err(e) = request.send().await {
        return LoginOutcome {
            success: false,
            message: format!("portal form submission failed: {e}"),
        };
    }

    tokio::time::sleep(POST_LOGIN_GRACE).await;

    let session = match probe_client() {
        Ok(c) => detect(&c).await,
        Err(e) => {
            return LoginOutcome {
                success: false,
                message: format!("could not re-probe after login: {e}"),
            };
        }
    };

    if session.has_internet {
        LoginOutcome {
            success: true,
            message: "portal login confirmed, internet access granted".to_string(),
        }
    } else {
        LoginOutcome {
            success: false,
            message: "portal login submitted but internet access not confirmed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"<html><body>
<form action="/auth/login" method="POST">
  <input type="hidden" name="token" value="abc123">
  <input type="text" name="user">
  <input type="password" name="pass">
  <input type="submit" name="go" value="Connect">
</form>
</body></html>"#;

    const ACCEPT_PAGE: &str = r#"<form method="post" action="http://portal.example/accept">
<input type="hidden" name="session" value="s1">
<input type="submit" name="agree" value="I agree">
</form>"#;

    #[test]
    fn extracts_credential_form() {
        let form = extract_form(LOGIN_PAGE).unwrap();
        assert_eq!(form.action.as_deref(), Some("/auth/login"));
        assert_eq!(form.method, "post");
        assert_eq!(form.fields.len(), 4);
        assert_eq!(form.fields[0].name, "token");
        assert_eq!(form.fields[0].value.as_deref(), Some("abc123"));
        assert_eq!(form.fields[2].kind, "password");
    }

    #[test]
    fn no_form_yields_none() {
        assert!(extract_form("<html><body>welcome</body></html>").is_none());
    }

    #[test]
    fn fill_form_injects_credentials_and_keeps_hidden_values() {
        let form = extract_form(LOGIN_PAGE).unwrap();
        let params = fill_form(&form, Some("alice"), Some("s3cret")).unwrap();
        assert!(params.contains(&("token".to_string(), "abc123".to_string())));
        assert!(params.contains(&("user".to_string(), "alice".to_string())));
        assert!(params.contains(&("pass".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn password_form_without_password_is_refused() {
        let form = extract_form(LOGIN_PAGE).unwrap();
        assert!(fill_form(&form, Some("alice"), None).is_err());
    }

    #[test]
    fn accept_form_needs_no_credentials() {
        let form = extract_form(ACCEPT_PAGE).unwrap();
        let params = fill_form(&form, None, None).unwrap();
        assert_eq!(params.len(), 2);
        assert!(params.contains(&("session".to_string(), "s1".to_string())));
    }

    #[test]
    fn relative_actions_resolve_against_portal_url() {
        assert_eq!(
            absolutize("http://portal.example/login?next=1", "/auth").as_deref(),
            Some("http://portal.example/auth")
        );
        assert_eq!(
            absolutize("http://portal.example/login", "http://other.example/go").as_deref(),
            Some("http://other.example/go")
        );
    }

    #[test]
    fn redirect_statuses_are_recognized() {
        assert!(is_redirect(302));
        assert!(is_redirect(307));
        assert!(!is_redirect(200));
        assert!(!is_redirect(204));
    }

    #[test]
    fn attr_matching_requires_word_boundary() {
        assert_eq!(
            attr_value("<form formaction=\"/x\" action=\"/y\">", "action").as_deref(),
            Some("/y")
        );
        assert_eq!(attr_value("<input type=text name=user>", "name").as_deref(), Some("user"));
    }

    use axum::{Router, http::StatusCode, response::Html, routing::get};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn probe_at(url: String) -> Probe {
        Probe {
            url: Box::leak(url.into_boxed_str()),
            expect: Expect::NoContent,
        }
    }

    #[tokio::test]
    async fn expected_probe_body_confirms_internet() {
        let base = serve(Router::new().route(
            "/generate_204",
            get(|| async { StatusCode::NO_CONTENT }),
        ))
        .await;

        let probes = [probe_at(format!("{base}/generate_204"))];
        let session = detect_with(&probe_client().unwrap(), &probes).await;

        assert_eq!(session.detection, PortalDetection::InternetConfirmed);
        assert!(session.has_internet);
        assert!(session.portal_url.is_none());
    }

    #[tokio::test]
    async fn redirected_probe_reports_the_portal_url() {
        let base = serve(Router::new().route(
            "/generate_204",
            get(|| async {
                (
                    StatusCode::FOUND,
                    [("location", "http://portal.example/login")],
                    "",
                )
            }),
        ))
        .await;

        let probes = [probe_at(format!("{base}/generate_204"))];
        let session = detect_with(&probe_client().unwrap(), &probes).await;

        assert_eq!(session.detection, PortalDetection::PortalDetected);
        assert_eq!(session.portal_url.as_deref(), Some("http://portal.example/login"));
        assert!(!session.has_internet);
    }

    #[tokio::test]
    async fn intercepted_probe_page_yields_the_form_action_url() {
        let base = serve(Router::new().route(
            "/generate_204",
            get(|| async { Html(r#"<form action="/auth" method="post"></form>"#) }),
        ))
        .await;

        let probes = [probe_at(format!("{base}/generate_204"))];
        let session = detect_with(&probe_client().unwrap(), &probes).await;

        assert_eq!(session.detection, PortalDetection::PortalDetected);
        assert_eq!(session.portal_url, Some(format!("{base}/auth")));
    }

    #[tokio::test]
    async fn unreachable_probes_mean_no_portal() {
        // Bind then drop, so the port is known to refuse connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probes = [probe_at(format!("http://{addr}/generate_204"))];
        let session = detect_with(&probe_client().unwrap(), &probes).await;

        assert_eq!(session.detection, PortalDetection::NoPortal);
        assert!(!session.has_internet);
        assert!(session.portal_url.is_none());
    }
}
