//! Extraction of `token` and `serverID` from an upgrade request target.
//!
//! Two forms are accepted:
//!
//! ```text
//! /websockify?token=<token>&serverID=<target>
//! /websocket/<target>/<token>
//! ```
//!
//! Query parameters take precedence over the path form.

/// Parameters carried by an upgrade request. Either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeParams {
    pub token: Option<String>,
    pub server_id: Option<String>,
}

impl UpgradeParams {
    /// Parse from a request path and optional query string.
    pub fn parse(path: &str, query: Option<&str>) -> Self {
        let mut params = Self::default();

        if let Some(query) = query {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" if params.token.is_none() => params.token = Some(value.into_owned()),
                    "serverID" if params.server_id.is_none() => {
                        params.server_id = Some(value.into_owned())
                    }
                    _ => {}
                }
            }
        }

        if params.token.is_none() || params.server_id.is_none() {
            if let Some((server_id, token)) = parse_legacy_path(path) {
                params.server_id.get_or_insert(server_id);
                params.token.get_or_insert(token);
            }
        }

        params
    }

    /// Parse a full request target such as `/path?query`.
    pub fn from_request_target(target: &str) -> Self {
        match target.split_once('?') {
            Some((path, query)) => Self::parse(path, Some(query)),
            None => Self::parse(target, None),
        }
    }

    /// Both values, if present and non-empty.
    pub fn require(&self) -> Option<(&str, &str)> {
        let token = self.token.as_deref().filter(|t| !t.trim().is_empty())?;
        let server_id = self.server_id.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((token, server_id))
    }
}

/// `/websocket/<serverID>/<token>`
fn parse_legacy_path(path: &str) -> Option<(String, String)> {
    let mut segments = path.trim_matches('/').split('/');
    match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some("websocket"), Some(server_id), Some(token), None)
            if !server_id.is_empty() && !token.is_empty() =>
        {
            Some((decode_segment(server_id), decode_segment(token)))
        }
        _ => None,
    }
}

fn decode_segment(segment: &str) -> String {
    // `form_urlencoded` also maps '+' to space, which never appears in ids or tokens.
    form_urlencoded::parse(format!("v={segment}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| segment.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_form() {
        let p = UpgradeParams::from_request_target("/websockify?token=abc&serverID=vm1");
        assert_eq!(p.require(), Some(("abc", "vm1")));
    }

    #[test]
    fn percent_decoded() {
        let p = UpgradeParams::from_request_target("/?serverID=rack%2Fa&token=t%20x");
        assert_eq!(p.server_id.as_deref(), Some("rack/a"));
        assert_eq!(p.token.as_deref(), Some("t x"));
    }

    #[test]
    fn legacy_path_form() {
        let p = UpgradeParams::from_request_target("/websocket/vm2/deadbeef");
        assert_eq!(p.require(), Some(("deadbeef", "vm2")));
    }

    #[test]
    fn query_wins_over_path() {
        let p = UpgradeParams::from_request_target("/websocket/vm2/deadbeef?serverID=vm9");
        assert_eq!(p.require(), Some(("deadbeef", "vm9")));
    }

    #[test]
    fn missing_or_empty_values() {
        assert_eq!(UpgradeParams::from_request_target("/").require(), None);
        assert_eq!(
            UpgradeParams::from_request_target("/?token=abc").require(),
            None
        );
        assert_eq!(
            UpgradeParams::from_request_target("/?token=&serverID=vm1").require(),
            None
        );
        assert_eq!(
            UpgradeParams::from_request_target("/websocket/vm1").require(),
            None
        );
    }

    #[test]
    fn first_occurrence_wins() {
        let p = UpgradeParams::from_request_target("/?token=a&token=b&serverID=vm1");
        assert_eq!(p.token.as_deref(), Some("a"));
    }
}
