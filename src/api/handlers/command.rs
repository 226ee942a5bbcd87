use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Extension},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::{
    context::{parse_remote, Ctx},
    token::{extract_bearer, refresh_challenge},
    Core,
};

/// Marker the CLI client sends for an empty argument, an empty path
/// segment would get collapsed on the way.
pub const EMPTY_ARG: &str = "\u{b6}";

const API_PREFIX: &str = "/api/";

fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = bytes.get(i + 1..i + 3)?;
            let decoded = hex::decode(pair).ok()?;
            out.extend(decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}

/// Menu arguments from a request path, one per segment.
#[must_use]
pub fn path_args(path: &str) -> Option<Vec<String>> {
    let rest = path.strip_prefix(API_PREFIX).unwrap_or_default();

    rest.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode(segment).map(|arg| if arg == EMPTY_ARG { String::new() } else { arg })
        })
        .collect()
}

/// The caller's address. A forwarded-for header is only believed when the
/// peer itself is a loopback proxy.
fn remote_of(peer: Option<SocketAddr>, headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| parse_remote(v).is_some());

    let peer = peer.map(|p| p.ip().to_canonical());

    match (peer, forwarded) {
        (Some(peer), Some(client)) if peer.is_loopback() => client.to_string(),
        (Some(peer), _) => peer.to_string(),
        (None, Some(client)) => client.to_string(),
        (None, None) => String::new(),
    }
}

// axum handler for /api/*cmd
pub async fn command(
    Extension(core): Extension<Arc<Core>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let realm = core.system().get().name.clone();
    let mut ctx = Ctx::new(core);

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    ctx.set_client(&remote_of(peer.map(|ci| ci.0), &headers), user_agent);

    let presented = extract_bearer(&headers);
    let mut refresh = false;
    if let Some(token) = &presented {
        match ctx.login_token(token).await {
            Ok(expsoon) => refresh = expsoon,
            Err(err) => {
                debug!("Token rejected: {err}");
                ctx.set_status(StatusCode::UNAUTHORIZED);
            }
        }
    }

    match path_args(uri.path()) {
        Some(args) => {
            ctx.run(args).await;
        }
        None => {
            ctx.set_return_code(1);
            ctx.set_status(StatusCode::BAD_REQUEST);
            ctx.outln("An error occurred: Invalid encoding in request path");
        }
    }

    if refresh && ctx.is_logged_in() && !ctx.token_minted() {
        if let Err(err) = ctx.new_token() {
            debug!("Token refresh failed: {err}");
        }
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    if ctx.return_code() != 0 {
        response_headers.insert("X-ReturnCode", HeaderValue::from(ctx.return_code()));
    }

    let challenge = match ctx.token() {
        Some(token) if ctx.token_minted() => Some(refresh_challenge(&realm, token)),
        // A bare challenge tells the client to forget its token.
        _ if ctx.status() == StatusCode::UNAUTHORIZED
            || (presented.is_some() && !ctx.is_logged_in()) =>
        {
            Some(format!("Bearer realm=\"{realm}\""))
        }
        _ => None,
    };
    if let Some(value) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response_headers.insert(header::WWW_AUTHENTICATE, value);
    }

    let status = ctx.status();
    (status, response_headers, ctx.buffered()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_segments_become_arguments() {
        assert_eq!(
            path_args("/api/system/login/alice/p%2Fw%20x").unwrap(),
            ["system", "login", "alice", "p/w x"]
        );
        assert_eq!(
            path_args("/api/user/set/alice/descr/%C2%B6").unwrap(),
            ["user", "set", "alice", "descr", ""]
        );
        assert!(path_args("/api/").unwrap().is_empty());
        assert!(path_args("/api/bad%zz").is_none());
        assert!(path_args("/api/cut%4").is_none());
    }

    #[test]
    fn forwarded_for_needs_a_loopback_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.7, 10.0.0.1"));

        let local: SocketAddr = "[::1]:4000".parse().unwrap();
        let remote: SocketAddr = "198.51.100.2:4000".parse().unwrap();

        assert_eq!(remote_of(Some(local), &headers), "192.0.2.7");
        assert_eq!(remote_of(Some(remote), &headers), "198.51.100.2");
        assert_eq!(remote_of(Some(remote), &HeaderMap::new()), "198.51.100.2");

        // IPv4 peers on a dual-stack listener arrive mapped.
        let mapped_local: SocketAddr = "[::ffff:127.0.0.1]:4000".parse().unwrap();
        let mapped_remote: SocketAddr = "[::ffff:198.51.100.2]:4000".parse().unwrap();
        assert_eq!(remote_of(Some(mapped_local), &headers), "192.0.2.7");
        assert_eq!(remote_of(Some(mapped_remote), &HeaderMap::new()), "198.51.100.2");
    }
}
