//! The public client facade: redirect policy, cookie jar interplay,
//! Basic auth from url userinfo, and Referer rules, on top of the
//! transport dispatcher.

use std::sync::Arc;

use cookie::Cookie;
use http::header::{HeaderMap, HeaderValue};
use http::Method;
use url::Url;

use crate::config::{ClientConfig, RedirectDecision};
use crate::error::Error;
use crate::jar::CookieJar;
use crate::request::Request;
use crate::response::Response;
use crate::send_body::SendBody;
use crate::transport::{default_transport, Transport};
use crate::util;

/// Default redirect chain limit.
const MAX_REDIRECTS: usize = 10;

/// Headers never forwarded to a different registrable domain on
/// redirect.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "www-authenticate", "cookie", "cookie2"];

/// An HTTP client.
///
/// Cheap to clone; clones share the transport (and so the connection
/// pool) and the cookie jar.
///
/// ```no_run
/// let client = httpool::Client::new();
/// let mut response = client.get("http://httpbin.org/get")?;
/// let body = response.body_mut().read_to_string()?;
/// # Ok::<(), httpool::Error>(())
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<Transport>,
    config: Arc<ClientConfig>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    /// A client on the process-wide default transport, without a cookie
    /// jar.
    pub fn new() -> Client {
        Client {
            transport: default_transport(),
            config: Arc::new(ClientConfig::default()),
        }
    }

    pub fn with_transport(transport: Arc<Transport>) -> Client {
        Client {
            transport,
            config: Arc::new(ClientConfig::default()),
        }
    }

    pub fn with_config(transport: Arc<Transport>, config: ClientConfig) -> Client {
        Client {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.config.cookie_jar.as_ref()
    }

    /// GET the url.
    pub fn get(&self, url: &str) -> Result<Response, Error> {
        let req = Request::new(Method::GET, url).map_err(|e| e.into_op("Get", url))?;
        self.do_request(req).map_err(|e| e.into_op("Get", url))
    }

    /// HEAD the url.
    pub fn head(&self, url: &str) -> Result<Response, Error> {
        let req = Request::new(Method::HEAD, url).map_err(|e| e.into_op("Head", url))?;
        self.do_request(req).map_err(|e| e.into_op("Head", url))
    }

    /// POST `body` with the given content type.
    pub fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<SendBody>,
    ) -> Result<Response, Error> {
        let run = || -> Result<Response, Error> {
            let mut req = Request::new(Method::POST, url)?;
            req.set_header("Content-Type", content_type)?;
            req.set_body(body.into());
            self.do_request(req)
        };
        run().map_err(|e| e.into_op("Post", url))
    }

    /// POST key/value pairs as `application/x-www-form-urlencoded`.
    /// Repeated keys are allowed and kept in order.
    pub fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Response, Error> {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in form {
            ser.append_pair(k, v);
        }
        let encoded = ser.finish();
        self.post(url, "application/x-www-form-urlencoded", encoded)
            .map_err(|e| e.into_op("Post", url))
    }

    /// Run a request through the redirect loop. (`do` in spirit; the
    /// name is taken by the keyword.)
    pub fn do_request(&self, req: Request) -> Result<Response, Error> {
        let op = op_name(&req.method);
        let url = req.url.as_str().to_string();
        self.do_inner(req).map_err(|e| e.into_op(op, &url))
    }

    fn do_inner(&self, req: Request) -> Result<Response, Error> {
        // headers of the very first request; each hop copies from these
        // (minus the sensitive set when crossing domains).
        let initial_headers = req.headers.clone();

        let mut via: Vec<Request> = Vec::new();
        let mut req = req;

        loop {
            self.apply_auth(&mut req);
            self.apply_cookies(&mut req);
            if let Some(ua) = &self.config.user_agent {
                if !ua.is_empty() && !req.headers.contains_key(http::header::USER_AGENT) {
                    if let Ok(v) = HeaderValue::from_str(ua) {
                        req.headers.insert(http::header::USER_AGENT, v);
                    }
                }
            }

            let mut resp = self.transport.round_trip(&mut req)?;

            if let Some(jar) = &self.config.cookie_jar {
                store_set_cookies(jar, &req.url, &resp.headers);
            }

            let location = resp.header("location").map(|s| s.to_string());
            let next = match redirect_behavior(&req, resp.status().as_u16(), location.as_deref()) {
                RedirectBehavior::Deliver => {
                    resp.request = Some(Box::new(req.clone_without_body()));
                    return Ok(resp);
                }
                RedirectBehavior::Redirect {
                    location,
                    method,
                    with_body,
                } => {
                    // location may be relative; resolve against the
                    // url we actually requested.
                    let next_url = req
                        .url
                        .join(&location)
                        .map_err(|e| Error::BadUrl(format!("{}: {}", location, e)))?;
                    self.build_redirect(&req, &initial_headers, next_url, method, with_body)?
                }
            };

            via.push(req.clone_without_body());

            match self.check_redirect(&next, &via) {
                RedirectDecision::Follow => {}
                RedirectDecision::UseLastResponse => {
                    resp.request = Some(Box::new(req.clone_without_body()));
                    return Ok(resp);
                }
                RedirectDecision::Abort(e) => {
                    resp.body_mut().close();
                    return Err(e);
                }
            }

            // finish with the previous body so the conn can be reused
            // for the next hop.
            resp.body_mut().close();

            debug!("redirect {} -> {}", req.url, next.url);
            req = next;
        }
    }

    /// Synthesize Basic auth from the url userinfo.
    fn apply_auth(&self, req: &mut Request) {
        let user = req.url.username();
        let pass = req.url.password().unwrap_or("");
        if (user.is_empty() && pass.is_empty())
            || req.headers.contains_key(http::header::AUTHORIZATION)
        {
            return;
        }
        let value = format!("Basic {}", util::basic_auth(user, pass));
        if let Ok(v) = HeaderValue::from_str(&value) {
            req.headers.insert(http::header::AUTHORIZATION, v);
        }
    }

    /// Merge jar cookies onto the request's Cookie header. The result
    /// is at most one Cookie line (RFC 6265 §5.4).
    fn apply_cookies(&self, req: &mut Request) {
        let jar = match &self.config.cookie_jar {
            Some(jar) => jar,
            None => return,
        };
        let from_jar = jar.cookies(&req.url);
        if from_jar.is_empty() && req.headers.get_all(http::header::COOKIE).iter().count() <= 1 {
            return;
        }
        let mut parts: Vec<String> = req
            .headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .collect();
        for c in &from_jar {
            parts.push(format!("{}={}", c.name(), c.value()));
        }
        let line = parts.join("; ");
        if let Ok(v) = HeaderValue::from_str(&line) {
            req.headers.insert(http::header::COOKIE, v);
        }
    }

    fn check_redirect(&self, next: &Request, via: &[Request]) -> RedirectDecision {
        if let Some(check) = &self.config.check_redirect {
            return check(next, via);
        }
        if via.len() >= MAX_REDIRECTS {
            RedirectDecision::Abort(Error::TooManyRedirects)
        } else {
            RedirectDecision::Follow
        }
    }

    /// Construct the next request in a redirect chain.
    fn build_redirect(
        &self,
        prev: &Request,
        initial_headers: &HeaderMap,
        next_url: Url,
        method: Method,
        with_body: bool,
    ) -> Result<Request, Error> {
        let mut next = Request::with_url(method, next_url);
        next.context = prev.context.clone();
        next.close = prev.close;

        // carry the original headers, stripping the sensitive set when
        // the destination is a different registrable domain than the
        // previous hop.
        next.headers = copy_redirect_headers(initial_headers, &prev.url, &next.url);

        if with_body {
            // 307/308: resend the body. Callers without get_body never
            // get here (redirect_behavior delivered the response).
            if let Some(get_body) = &prev.get_body {
                next.body = Some(get_body().map_err(Error::Io)?);
                next.get_body = Some(get_body.clone());
                next.had_body = prev.had_body;
                next.content_length = prev.content_length;
            }
        }

        apply_referer(&mut next, &prev.url);
        Ok(next)
    }
}

enum RedirectBehavior {
    Deliver,
    Redirect {
        location: String,
        method: Method,
        with_body: bool,
    },
}

/// What a 3xx means for the follow-up request (RFC 7231 §6.4 plus
/// de-facto method downgrade).
fn redirect_behavior(req: &Request, status: u16, location: Option<&str>) -> RedirectBehavior {
    let location = match location {
        Some(l) if !l.is_empty() => l.to_string(),
        _ => return RedirectBehavior::Deliver,
    };
    match status {
        301 | 302 | 303 => {
            // non-GET/HEAD downgrade to GET and drop the body.
            let method = match req.method {
                ref m if *m == Method::GET || *m == Method::HEAD => m.clone(),
                _ => Method::GET,
            };
            RedirectBehavior::Redirect {
                location,
                method,
                with_body: false,
            }
        }
        307 | 308 => {
            if req.had_body && req.get_body.is_none() {
                // cannot replay the body; hand the 3xx to the caller.
                return RedirectBehavior::Deliver;
            }
            RedirectBehavior::Redirect {
                location,
                method: req.method.clone(),
                with_body: req.had_body,
            }
        }
        _ => RedirectBehavior::Deliver,
    }
}

fn copy_redirect_headers(initial: &HeaderMap, prev_url: &Url, next_url: &Url) -> HeaderMap {
    let src_host = prev_url.host_str().unwrap_or_default();
    let dest_host = next_url.host_str().unwrap_or_default();
    let same_site = util::is_domain_or_subdomain(dest_host, src_host);

    let mut out = HeaderMap::new();
    for (name, value) in initial.iter() {
        if !same_site && SENSITIVE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// RFC 7231 §5.5.2: referer without userinfo, and never from https to
/// http.
fn apply_referer(next: &mut Request, prev_url: &Url) {
    if next.headers.contains_key(http::header::REFERER) {
        return;
    }
    if prev_url.scheme() == "https" && next.url.scheme() == "http" {
        return;
    }
    let mut referer = prev_url.clone();
    referer.set_username("").ok();
    referer.set_password(None).ok();
    referer.set_fragment(None);
    if let Ok(v) = HeaderValue::from_str(referer.as_str()) {
        next.headers.insert(http::header::REFERER, v);
    }
}

fn store_set_cookies(jar: &CookieJar, url: &Url, headers: &HeaderMap) {
    let mut parsed: Vec<Cookie<'static>> = Vec::new();
    for value in headers.get_all(http::header::SET_COOKIE) {
        let raw = match value.to_str() {
            Ok(s) => s,
            Err(_) => continue,
        };
        match Cookie::parse(raw.to_string()) {
            Ok(c) => parsed.push(c),
            // unparseable cookies are ignored.
            Err(_) => continue,
        }
    }
    if !parsed.is_empty() {
        jar.set_cookies(url, parsed);
    }
}

fn op_name(method: &Method) -> &'static str {
    if *method == Method::GET {
        "Get"
    } else if *method == Method::HEAD {
        "Head"
    } else if *method == Method::POST {
        "Post"
    } else if *method == Method::PUT {
        "Put"
    } else if *method == Method::DELETE {
        "Delete"
    } else if *method == Method::OPTIONS {
        "Options"
    } else if *method == Method::PATCH {
        "Patch"
    } else if *method == Method::TRACE {
        "Trace"
    } else {
        "Do"
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(method: Method, url: &str) -> Request {
        Request::new(method, url).unwrap()
    }

    #[test]
    fn downgrade_on_302() {
        let r = req(Method::POST, "http://a/");
        match redirect_behavior(&r, 302, Some("/x")) {
            RedirectBehavior::Redirect { method, with_body, .. } => {
                assert_eq!(method, Method::GET);
                assert!(!with_body);
            }
            _ => panic!("expected redirect"),
        }
    }

    #[test]
    fn get_and_head_preserved_on_301() {
        for m in [Method::GET, Method::HEAD] {
            let r = req(m.clone(), "http://a/");
            match redirect_behavior(&r, 301, Some("/x")) {
                RedirectBehavior::Redirect { method, .. } => assert_eq!(method, m),
                _ => panic!("expected redirect"),
            }
        }
    }

    #[test]
    fn preserve_method_and_body_on_307() {
        let mut r = req(Method::POST, "http://a/");
        r.set_body(SendBody::from("payload"));
        match redirect_behavior(&r, 307, Some("/x")) {
            RedirectBehavior::Redirect { method, with_body, .. } => {
                assert_eq!(method, Method::POST);
                assert!(with_body);
            }
            _ => panic!("expected redirect"),
        }
    }

    #[test]
    fn no_redirect_307_without_get_body() {
        let mut r = req(Method::POST, "http://a/");
        r.set_body(SendBody::from_reader(&b"stream"[..], Some(6)));
        assert!(matches!(
            redirect_behavior(&r, 307, Some("/x")),
            RedirectBehavior::Deliver
        ));
    }

    #[test]
    fn missing_location_delivers() {
        let r = req(Method::GET, "http://a/");
        assert!(matches!(
            redirect_behavior(&r, 302, None),
            RedirectBehavior::Deliver
        ));
    }

    #[test]
    fn sensitive_headers_stripped_cross_domain() {
        let mut initial = HeaderMap::new();
        initial.insert("authorization", "secret".parse().unwrap());
        initial.insert("cookie", "a=1".parse().unwrap());
        initial.insert("x-other", "keep".parse().unwrap());

        let src: Url = "https://foo.com/".parse().unwrap();
        let evil: Url = "https://evil.com/".parse().unwrap();
        let out = copy_redirect_headers(&initial, &src, &evil);
        assert!(!out.contains_key("authorization"));
        assert!(!out.contains_key("cookie"));
        assert_eq!(out.get("x-other").unwrap(), "keep");

        let sub: Url = "https://sub.foo.com/".parse().unwrap();
        let out = copy_redirect_headers(&initial, &src, &sub);
        assert_eq!(out.get("authorization").unwrap(), "secret");
        assert_eq!(out.get("cookie").unwrap(), "a=1");
    }

    #[test]
    fn referer_rules() {
        let prev: Url = "https://user:pw@site.com/page".parse().unwrap();

        let mut next = req(Method::GET, "https://other.com/");
        apply_referer(&mut next, &prev);
        assert_eq!(next.header("referer").unwrap(), "https://site.com/page");

        // https -> http omits the referer entirely.
        let mut next = req(Method::GET, "http://other.com/");
        apply_referer(&mut next, &prev);
        assert!(next.header("referer").is_none());
    }

    #[test]
    fn op_names() {
        assert_eq!(op_name(&Method::GET), "Get");
        assert_eq!(op_name(&Method::POST), "Post");
    }
}
