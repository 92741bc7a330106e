//! In-memory cookie jar, RFC 6265 semantics.
//!
//! Entries are stored in a two-level map: registrable domain ("jar
//! key") to entry id (`domain;path;name`) to entry. Parsing and
//! serialization of the cookie wire format is the `cookie` crate's job;
//! this module owns storage, scoping and eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use cookie::{Cookie, Expiration};
use url::Url;

/// Optional public-suffix oracle used to derive the jar key (effective
/// TLD plus one). Without one, the jar falls back to the last two
/// labels of the host.
pub trait PublicSuffixList: Send + Sync {
    /// The public suffix of `domain`, e.g. `co.uk` for `bbc.co.uk`.
    fn public_suffix(&self, domain: &str) -> Option<String>;
}

/// A thread-safe cookie jar.
///
/// ```
/// use httpool::CookieJar;
///
/// let jar = CookieJar::new();
/// let url: url::Url = "http://example.com/".parse().unwrap();
/// jar.set_cookies(&url, vec![cookie::Cookie::parse("a=1; Path=/").unwrap()]);
/// assert_eq!(jar.cookies(&url).len(), 1);
/// ```
pub struct CookieJar {
    psl: Option<Box<dyn PublicSuffixList>>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, HashMap<String, Entry>>,
    /// Creation times are nudged to stay unique, making the emission
    /// order total.
    last_creation: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    value: String,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
    /// No Domain attribute was present: match only the exact host.
    host_only: bool,
    persistent: bool,
    expires: Option<SystemTime>,
    creation: SystemTime,
    last_access: SystemTime,
}

impl Entry {
    fn id(&self) -> String {
        entry_id(&self.domain, &self.path, &self.name)
    }

    fn expired(&self, now: SystemTime) -> bool {
        match self.expires {
            Some(at) => at <= now,
            None => false,
        }
    }

    fn domain_match(&self, host: &str) -> bool {
        if self.domain == host {
            return true;
        }
        !self.host_only && host.ends_with(&format!(".{}", self.domain))
    }

    fn path_match(&self, path: &str) -> bool {
        if self.path == path {
            return true;
        }
        if path.starts_with(&self.path) {
            return self.path.ends_with('/') || path.as_bytes().get(self.path.len()) == Some(&b'/');
        }
        false
    }
}

fn entry_id(domain: &str, path: &str, name: &str) -> String {
    format!("{};{};{}", domain, path, name)
}

impl Default for CookieJar {
    fn default() -> Self {
        CookieJar::new()
    }
}

impl CookieJar {
    pub fn new() -> CookieJar {
        CookieJar {
            psl: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_public_suffix_list(psl: impl PublicSuffixList + 'static) -> CookieJar {
        CookieJar {
            psl: Some(Box::new(psl)),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The cookies to send for a request to `url`, sorted longest path
    /// first, then by earliest creation. Expired entries are removed on
    /// the way; returned entries get their last-access time bumped.
    pub fn cookies(&self, url: &Url) -> Vec<Cookie<'static>> {
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return Vec::new(),
        };
        let host = match canonical_host(url) {
            Some(h) => h,
            None => return Vec::new(),
        };
        let key = self.jar_key(&host);
        let path = request_path(url);
        let now = SystemTime::now();

        let mut inner = self.inner.lock().unwrap();
        let submap = match inner.entries.get_mut(&key) {
            Some(m) => m,
            None => return Vec::new(),
        };

        let mut selected: Vec<Entry> = Vec::new();
        let mut expired: Vec<String> = Vec::new();
        for (id, entry) in submap.iter_mut() {
            if entry.expired(now) {
                expired.push(id.clone());
                continue;
            }
            if !entry.domain_match(&host) || !entry.path_match(&path) {
                continue;
            }
            if entry.secure && !https {
                continue;
            }
            entry.last_access = now;
            selected.push(entry.clone());
        }
        for id in expired {
            submap.remove(&id);
        }
        if submap.is_empty() {
            inner.entries.remove(&key);
        }

        selected.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.creation.cmp(&b.creation))
        });

        selected
            .into_iter()
            .map(|e| {
                let mut c = Cookie::new(e.name, e.value);
                c.set_path(e.path);
                c.set_secure(e.secure);
                c.set_http_only(e.http_only);
                c
            })
            .collect()
    }

    /// Ingest `Set-Cookie` cookies received in a response to `url`.
    pub fn set_cookies(&self, url: &Url, cookies: Vec<Cookie<'static>>) {
        if !matches!(url.scheme(), "http" | "https") {
            return;
        }
        let host = match canonical_host(url) {
            Some(h) => h,
            None => return,
        };
        let key = self.jar_key(&host);
        let def_path = default_path(url.path());
        let now = SystemTime::now();

        let mut inner = self.inner.lock().unwrap();
        for c in cookies {
            if c.name().is_empty() {
                continue;
            }
            let (domain, host_only) = match self.domain_and_type(&host, c.domain()) {
                Some(v) => v,
                // an unusable Domain attribute voids the cookie.
                None => continue,
            };
            let path = match c.path() {
                Some(p) if p.starts_with('/') => p.to_string(),
                _ => def_path.clone(),
            };
            let id = entry_id(&domain, &path, c.name());

            // Max-Age wins over Expires.
            let (remove, persistent, expires) = if let Some(max_age) = c.max_age() {
                let secs = max_age.whole_seconds();
                if secs <= 0 {
                    (true, false, None)
                } else {
                    (false, true, Some(now + Duration::from_secs(secs as u64)))
                }
            } else {
                match c.expires() {
                    Some(Expiration::DateTime(dt)) => {
                        let at: SystemTime = dt.into();
                        if at <= now {
                            (true, false, None)
                        } else {
                            (false, true, Some(at))
                        }
                    }
                    _ => (false, false, None),
                }
            };

            let existing_creation = {
                let submap = inner.entries.entry(key.clone()).or_insert_with(HashMap::new);
                if remove {
                    submap.remove(&id);
                    continue;
                }
                // keep the original creation time when updating.
                submap.get(&id).map(|e| e.creation)
            };
            let creation = match existing_creation {
                Some(c) => c,
                None => inner.next_creation(now),
            };
            let entry = Entry {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain,
                path,
                secure: c.secure().unwrap_or(false),
                http_only: c.http_only().unwrap_or(false),
                host_only,
                persistent,
                expires,
                creation,
                last_access: now,
            };
            inner
                .entries
                .entry(key.clone())
                .or_insert_with(HashMap::new)
                .insert(entry.id(), entry);
        }
    }

    /// The registrable domain used to bucket entries.
    fn jar_key(&self, host: &str) -> String {
        if is_ip(host) {
            return host.to_string();
        }
        if let Some(psl) = &self.psl {
            if let Some(suffix) = psl.public_suffix(host) {
                if suffix == host {
                    return host.to_string();
                }
                if let Some(prefix) = host.strip_suffix(&format!(".{}", suffix)) {
                    let label = prefix.rsplit('.').next().unwrap_or(prefix);
                    return format!("{}.{}", label, suffix);
                }
                // suffix does not actually match; fall through.
            }
        }
        // no list: the last two labels.
        let mut labels = host.rsplitn(3, '.');
        let tld = labels.next().unwrap_or(host);
        match labels.next() {
            Some(second) => format!("{}.{}", second, tld),
            None => host.to_string(),
        }
    }

    /// Resolve the Domain attribute against the request host. `None`
    /// voids the cookie; a missing or malformed attribute yields a
    /// host-only cookie.
    fn domain_and_type(&self, host: &str, attr: Option<&str>) -> Option<(String, bool)> {
        let attr = match attr {
            None | Some("") => return Some((host.to_string(), true)),
            Some(a) => a,
        };
        if is_ip(host) {
            // a Domain attribute never matches an IP host.
            return if attr == host {
                Some((host.to_string(), true))
            } else {
                None
            };
        }
        let domain = attr.trim_start_matches('.').to_ascii_lowercase();
        if domain.is_empty() || domain.ends_with('.') {
            return None;
        }
        // illegal characters silently degrade to host-only (the
        // attribute was already dropped by the parser in most cases).
        if !domain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
        {
            return Some((host.to_string(), true));
        }
        if let Some(psl) = &self.psl {
            if psl.public_suffix(&domain).as_deref() == Some(domain.as_str()) && host != domain {
                // no cookies for an entire public suffix.
                return None;
            }
        }
        // the attribute must tail-match the request host.
        if host != domain && !host.ends_with(&format!(".{}", domain)) {
            return None;
        }
        Some((domain, false))
    }
}

impl Inner {
    /// Monotonically unique creation time.
    fn next_creation(&mut self, now: SystemTime) -> SystemTime {
        let next = match self.last_creation {
            Some(last) if last >= now => last + Duration::from_nanos(1),
            _ => now,
        };
        self.last_creation = Some(next);
        next
    }
}

/// Canonical request host: lowercased, punycoded (url does both),
/// port and trailing dot removed.
fn canonical_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

fn is_ip(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_ok()
        || host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(|h| h.parse::<std::net::Ipv6Addr>().is_ok())
            .unwrap_or(false)
}

fn request_path(url: &Url) -> String {
    let p = url.path();
    if p.is_empty() {
        "/".to_string()
    } else {
        p.to_string()
    }
}

/// Default cookie path per RFC 6265 §5.1.4: the directory of the
/// request path.
fn default_path(path: &str) -> String {
    if !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        let count: usize = inner.entries.values().map(|m| m.len()).sum();
        f.debug_struct("CookieJar").field("entries", &count).finish()
    }
}
