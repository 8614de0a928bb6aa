// Broker address helpers
//
// Joins the optional virtual host onto the base address and masks
// credentials before an address is logged or reported.

use url::Url;

/// Build the connect target from the base address and optional vhost
///
/// With a vhost the result is `base` without trailing slashes, one `/`, then
/// the vhost without leading slashes. A missing or slash-only vhost leaves the
/// base untouched so the broker's default vhost is used.
pub fn target_uri(base: &str, vhost: Option<&str>) -> String {
    let segment = vhost.map(|v| v.trim().trim_start_matches('/')).unwrap_or("");

    if segment.is_empty() {
        return base.to_string();
    }

    format!("{}/{}", base.trim_end_matches('/'), segment)
}

/// Replace the password component of an address with `****`
///
/// Unparseable input is reduced to its scheme so nothing secret leaks.
pub fn redact(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some("****")).is_err() {
                return "<redacted>".to_string();
            }
            url.to_string()
        }
        Err(_) => match uri.split_once("://") {
            Some((scheme, _)) => format!("{}://<redacted>", scheme),
            None => "<redacted>".to_string(),
        },
    }
}
